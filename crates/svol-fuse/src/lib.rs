//! # svol-fuse
//!
//! FUSE front-end for shortvol.
//!
//! Exposes a one-directory filesystem containing a single regular file,
//! `block`, whose size is the volume capacity. Format it with mkfs and
//! loop-mount it, and every read and write lands on the shortener-backed
//! volume underneath. Fsync is a no-op since writes are already synchronous
//! all the way through the driver.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEntry, ReplyWrite, Request,
};
use libc::{EFBIG, EINVAL, EIO, ENOENT};
use tracing::{error, trace};

use svol_core::Volume;

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 512;

const ROOT_INO: u64 = 1;
const BLOCK_INO: u64 = 2;
const BLOCK_NAME: &str = "block";

/// The filesystem: one directory, one file, one volume.
pub struct BlockFs {
    volume: Arc<Volume>,
}

impl BlockFs {
    pub fn new(volume: Arc<Volume>) -> Self {
        Self { volume }
    }

    fn attr(&self, ino: u64) -> Option<FileAttr> {
        let (kind, perm, size, nlink) = match ino {
            ROOT_INO => (FileType::Directory, 0o755, 0, 2),
            BLOCK_INO => (FileType::RegularFile, 0o666, self.volume.capacity(), 1),
            _ => return None,
        };
        Some(FileAttr {
            ino,
            size,
            blocks: size.div_ceil(BLOCK_SIZE as u64),
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind,
            perm,
            nlink,
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
            blksize: BLOCK_SIZE,
        })
    }
}

impl Filesystem for BlockFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent == ROOT_INO && name.to_str() == Some(BLOCK_NAME) {
            // unwrap: the block inode always has attributes.
            reply.entry(&TTL, &self.attr(BLOCK_INO).unwrap(), 0);
        } else {
            reply.error(ENOENT);
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.attr(ino) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(ENOENT),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(ino, offset, size, "read");
        if ino != BLOCK_INO {
            reply.error(ENOENT);
            return;
        }
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(EINVAL);
            return;
        };
        let size = clamp_to_capacity(self.volume.capacity(), offset, size as usize);
        match self.volume.read(size, offset) {
            Ok(data) => reply.data(&data),
            Err(err) => {
                error!(%err, offset, size, "volume read failed");
                reply.error(EIO);
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(ino, offset, len = data.len(), "write");
        if ino != BLOCK_INO {
            reply.error(ENOENT);
            return;
        }
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(EINVAL);
            return;
        };
        if offset + data.len() as u64 > self.volume.capacity() {
            reply.error(EFBIG);
            return;
        }
        match self.volume.write(offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(err) => {
                error!(%err, offset, len = data.len(), "volume write failed");
                reply.error(EIO);
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INO {
            reply.error(ENOENT);
            return;
        }
        let entries = [
            (ROOT_INO, FileType::Directory, "."),
            (ROOT_INO, FileType::Directory, ".."),
            (BLOCK_INO, FileType::RegularFile, BLOCK_NAME),
        ];
        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, *name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        match ino {
            ROOT_INO | BLOCK_INO => reply.opened(0, 0),
            _ => reply.error(ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // The block file has a fixed size and no tracked times; whatever
        // the caller asked for, the attributes stay as they are.
        match self.attr(ino) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(ENOENT),
        }
    }

    fn fsync(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        trace!("fsync");
        reply.ok();
    }
}

/// Largest read size that stays inside the volume.
fn clamp_to_capacity(capacity: u64, offset: u64, size: usize) -> usize {
    if offset >= capacity {
        return 0;
    }
    size.min((capacity - offset) as usize)
}

/// Mount the volume at `mountpoint` in the background. Dropping the
/// returned session unmounts.
pub fn mount<P: AsRef<Path>>(
    volume: Arc<Volume>,
    mountpoint: P,
) -> std::io::Result<fuser::BackgroundSession> {
    let options = [
        MountOption::RW,
        MountOption::FSName("shortvol".to_string()),
        MountOption::AutoUnmount,
    ];
    fuser::spawn_mount2(BlockFs::new(volume), mountpoint, &options)
}
