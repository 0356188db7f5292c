//! The volume: a contiguous byte range assembled from shortener entries.
//!
//! Byte offsets map onto leaves of the node tree: leaf `i` covers bytes
//! `[i * node_size, (i + 1) * node_size)`. A read walks the touched leaves
//! in order, materializing each one (from the shortener, through the read
//! cache) or synthesizing zeroes for leaves that were never written. A
//! write recomposes each touched leaf from its old bytes and the new data,
//! stores it, and then re-stores every ancestor up to the root since each
//! ancestor's child list now names a different identifier.
//!
//! All state sits behind one mutex, so calls from a multi-threaded
//! front-end serialize; with a blocking HTTP round-trip per entry, lock
//! contention is not where the time goes.

use std::sync::Mutex;

use tracing::{debug, trace, warn};

use svol_driver::Shortener;

use crate::cache::ReadCache;
use crate::tree::{descent_path, NodeId, Tree};
use crate::{Result, VolumeError};

#[derive(Debug)]
pub struct Volume {
    driver: Box<dyn Shortener>,
    depth: u32,
    node_size: usize,
    ids_per_node: u64,
    capacity: u64,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    tree: Tree,
    cache: ReadCache,
}

impl Volume {
    /// Open a volume against `driver` with the default read cache.
    ///
    /// `root_id` is the identifier persisted by a previous mount; `None`
    /// (or an empty string) starts a fresh, all-zero volume.
    pub fn new(driver: Box<dyn Shortener>, depth: u32, root_id: Option<String>) -> Result<Self> {
        Self::with_cache(driver, depth, root_id, ReadCache::default())
    }

    pub fn with_cache(
        driver: Box<dyn Shortener>,
        depth: u32,
        root_id: Option<String>,
        cache: ReadCache,
    ) -> Result<Self> {
        if depth == 0 {
            return Err(VolumeError::InvalidGeometry(
                "depth must be positive".to_string(),
            ));
        }
        let node_size = driver.node_size();
        let id_size = driver.id_size();
        // Interior entries store children as identifiers joined by a
        // one-byte separator; the final separator is unneeded, hence +1.
        let ids_per_node = ((node_size + 1) / (id_size + 1)) as u64;
        if ids_per_node < 2 {
            return Err(VolumeError::InvalidGeometry(format!(
                "node size {node_size} fits fewer than two identifiers of size {id_size}"
            )));
        }
        let capacity = ids_per_node
            .checked_pow(depth)
            .and_then(|leaves| leaves.checked_mul(node_size as u64))
            .ok_or_else(|| {
                VolumeError::InvalidGeometry(format!(
                    "capacity overflows at depth {depth} with fan-out {ids_per_node}"
                ))
            })?;

        let root_id = root_id.filter(|id| !id.is_empty());
        if root_id.is_none() {
            debug!("no root id, starting a fresh volume");
        }
        Ok(Self {
            driver,
            depth,
            node_size,
            ids_per_node,
            capacity,
            state: Mutex::new(State {
                tree: Tree::new(root_id),
                cache,
            }),
        })
    }

    /// Total addressable bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Identifier of the current root entry, if anything has ever been
    /// stored. This is the sole handle needed to reopen the volume.
    pub fn root_id(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.tree.short_id(state.tree.root()).map(str::to_string)
    }

    /// Read `size` bytes starting at `offset`.
    ///
    /// Never-written regions come back zero-filled. The returned buffer is
    /// exactly `size` bytes long.
    pub fn read(&self, size: usize, offset: u64) -> Result<Vec<u8>> {
        self.check_range(offset, size as u64)?;
        if size == 0 {
            return Ok(Vec::new());
        }
        debug!(size, offset, "reading");
        let mut state = self.state.lock().unwrap();

        let node_size = self.node_size as u64;
        let start_leaf = offset / node_size;
        let end_leaf = (offset + size as u64).div_ceil(node_size);

        let mut out = Vec::with_capacity(size);
        for leaf_idx in start_leaf..end_leaf {
            let leaf = self.leaf(&mut state, leaf_idx)?;
            let (sub_start, sub_end) =
                self.sub_range(leaf_idx, start_leaf, end_leaf, offset, size as u64);
            trace!(leaf_idx, sub_start, sub_end, "leaf sub-read");
            let leaf_data = self.leaf_bytes(&mut state, leaf)?;
            out.extend_from_slice(&leaf_data[sub_start..sub_end]);
        }
        Ok(out)
    }

    /// Write `data` at `offset`, returning the number of bytes written.
    ///
    /// Every touched leaf is recomposed and stored, and each store cascades
    /// identifier updates to the root. The first failure aborts the write;
    /// leaves already stored stay reachable from the in-memory root, but
    /// the error is the caller's to surface.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let size = data.len();
        self.check_range(offset, size as u64)?;
        if size == 0 {
            return Ok(0);
        }
        debug!(size, offset, "writing");
        let mut state = self.state.lock().unwrap();

        let node_size = self.node_size as u64;
        let start_leaf = offset / node_size;
        let end_leaf = (offset + size as u64).div_ceil(node_size);

        let mut remaining = data;
        let mut written = 0usize;
        for leaf_idx in start_leaf..end_leaf {
            let leaf = self.leaf(&mut state, leaf_idx)?;
            let (sub_start, sub_end) =
                self.sub_range(leaf_idx, start_leaf, end_leaf, offset, size as u64);
            trace!(leaf_idx, sub_start, sub_end, "leaf sub-write");

            let existing = self.leaf_bytes(&mut state, leaf)?;
            let take = sub_end - sub_start;
            let mut composed = Vec::with_capacity(self.node_size);
            composed.extend_from_slice(&existing[..sub_start]);
            composed.extend_from_slice(&remaining[..take]);
            composed.extend_from_slice(&existing[sub_end..]);
            remaining = &remaining[take..];

            self.store_node(&mut state, leaf, &composed)?;
            written += take;
        }
        Ok(written)
    }

    /// Sub-slice of one leaf covered by the request `[offset, offset+len)`.
    ///
    /// A range ending exactly on a node boundary covers the whole final
    /// leaf, on the write path as well as the read path.
    fn sub_range(
        &self,
        leaf_idx: u64,
        start_leaf: u64,
        end_leaf: u64,
        offset: u64,
        len: u64,
    ) -> (usize, usize) {
        let node_size = self.node_size as u64;
        let sub_start = if leaf_idx == start_leaf {
            (offset % node_size) as usize
        } else {
            0
        };
        let sub_end = if leaf_idx + 1 == end_leaf {
            match ((offset + len) % node_size) as usize {
                0 => self.node_size,
                rem => rem,
            }
        } else {
            self.node_size
        };
        (sub_start, sub_end)
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(VolumeError::OutOfRange {
                offset,
                len,
                capacity: self.capacity,
            }),
        }
    }

    /// Descend to the leaf at `leaf_idx`, materializing children on the
    /// way. Idempotent: repeat visits only walk already-present nodes.
    fn leaf(&self, state: &mut State, leaf_idx: u64) -> Result<NodeId> {
        let path = descent_path(leaf_idx, self.ids_per_node, self.depth);
        trace!(leaf_idx, ?path, "descending to leaf");
        let mut node = state.tree.root();
        for child_idx in path {
            if state.tree.child_count(node) == 0 {
                self.hydrate(state, node)?;
            }
            node = state.tree.child(node, child_idx).ok_or_else(|| {
                VolumeError::Corrupt(format!("node has no child at index {child_idx}"))
            })?;
        }
        Ok(node)
    }

    /// Materialize a node's children: parse them out of its stored entry,
    /// or create unwritten placeholders if the node was never stored.
    fn hydrate(&self, state: &mut State, node: NodeId) -> Result<()> {
        let short_id = state.tree.short_id(node).map(str::to_string);
        let children = match short_id {
            Some(id) => {
                let data = self.cached_read(state, &id)?;
                // Entries may come back NUL-padded; the child list is what
                // precedes the padding.
                let end = data.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1);
                let ids = data[..end]
                    .split(|&b| b == b',')
                    .map(|token| {
                        if token.is_empty() {
                            Ok(None)
                        } else {
                            String::from_utf8(token.to_vec()).map(Some).map_err(|_| {
                                VolumeError::Corrupt(format!("non-utf8 child id under {id}"))
                            })
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                if ids.len() as u64 != self.ids_per_node {
                    warn!(
                        id = %id,
                        children = ids.len(),
                        expected = self.ids_per_node,
                        "interior entry has unexpected child count"
                    );
                }
                ids
            }
            None => vec![None; self.ids_per_node as usize],
        };
        state.tree.install_children(node, children);
        Ok(())
    }

    /// A leaf's current bytes, zero-padded to exactly `node_size`.
    fn leaf_bytes(&self, state: &mut State, leaf: NodeId) -> Result<Vec<u8>> {
        let short_id = state.tree.short_id(leaf).map(str::to_string);
        let mut data = match short_id {
            Some(id) => self.cached_read(state, &id)?,
            None => Vec::new(),
        };
        data.truncate(self.node_size);
        data.resize(self.node_size, 0);
        Ok(data)
    }

    /// Read an entry through the cache.
    fn cached_read(&self, state: &mut State, id: &str) -> Result<Vec<u8>> {
        if let Some(hit) = state.cache.get(id) {
            trace!(id, "cache hit");
            return Ok(hit.to_vec());
        }
        debug!(id, "fetching entry");
        let data = self.driver.read(id)?;
        debug!(id, len = data.len(), "fetched entry");
        state.cache.put(id.to_string(), data.clone());
        Ok(data)
    }

    /// Store bytes at a node and cascade the identifier change to the root.
    fn store_node(&self, state: &mut State, node: NodeId, data: &[u8]) -> Result<()> {
        debug!(len = data.len(), "storing leaf entry");
        let new_id = self.driver.write(data)?;
        trace!(id = %new_id, "leaf entry stored");
        state.tree.set_short_id(node, new_id);

        let mut current = node;
        while let Some(parent) = state.tree.parent(current) {
            let serialized = state.tree.child_short_ids(parent).join(",");
            debug!(len = serialized.len(), "storing interior entry");
            let new_id = self.driver.write(serialized.as_bytes())?;
            trace!(id = %new_id, "interior entry stored");
            state.tree.set_short_id(parent, new_id);
            current = parent;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use svol_driver::{Memory, Shortener};

    use super::*;

    // 8-byte entries with 2-byte identifiers: fan-out (8+1)/(2+1) = 3, so
    // depth 2 gives 9 leaves and a 72-byte volume.
    fn small_volume(depth: u32) -> Volume {
        Volume::new(Box::new(Memory::new(8, 2)), depth, None).unwrap()
    }

    /// Counts driver round-trips on the way through to an inner store.
    #[derive(Debug)]
    struct Spy<T> {
        inner: T,
        writes: AtomicUsize,
        reads: AtomicUsize,
    }

    impl<T> Spy<T> {
        fn new(inner: T) -> Self {
            Self {
                inner,
                writes: AtomicUsize::new(0),
                reads: AtomicUsize::new(0),
            }
        }
    }

    impl<T: Shortener> Shortener for Spy<T> {
        fn node_size(&self) -> usize {
            self.inner.node_size()
        }
        fn id_size(&self) -> usize {
            self.inner.id_size()
        }
        fn read(&self, id: &str) -> svol_driver::Result<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(id)
        }
        fn write(&self, data: &[u8]) -> svol_driver::Result<String> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write(data)
        }
    }

    /// Strips trailing zeroes on store and pads nothing on read, like a
    /// backend that stores short tails short.
    #[derive(Debug)]
    struct Trimming<T>(T);

    impl<T: Shortener> Shortener for Trimming<T> {
        fn node_size(&self) -> usize {
            self.0.node_size()
        }
        fn id_size(&self) -> usize {
            self.0.id_size()
        }
        fn read(&self, id: &str) -> svol_driver::Result<Vec<u8>> {
            self.0.read(id)
        }
        fn write(&self, data: &[u8]) -> svol_driver::Result<String> {
            let end = data.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1);
            self.0.write(&data[..end])
        }
    }

    /// NUL-pads every entry out to `node_size` on read, like a backend
    /// that always hands back full-size entries.
    #[derive(Debug)]
    struct Padding<T>(T);

    impl<T: Shortener> Shortener for Padding<T> {
        fn node_size(&self) -> usize {
            self.0.node_size()
        }
        fn id_size(&self) -> usize {
            self.0.id_size()
        }
        fn read(&self, id: &str) -> svol_driver::Result<Vec<u8>> {
            let mut data = self.0.read(id)?;
            data.resize(self.0.node_size(), 0);
            Ok(data)
        }
        fn write(&self, data: &[u8]) -> svol_driver::Result<String> {
            self.0.write(data)
        }
    }

    /// Fails every write after the first `allowed`.
    #[derive(Debug)]
    struct FailingWrites<T> {
        inner: T,
        allowed: AtomicUsize,
    }

    impl<T: Shortener> Shortener for FailingWrites<T> {
        fn node_size(&self) -> usize {
            self.inner.node_size()
        }
        fn id_size(&self) -> usize {
            self.inner.id_size()
        }
        fn read(&self, id: &str) -> svol_driver::Result<Vec<u8>> {
            self.inner.read(id)
        }
        fn write(&self, data: &[u8]) -> svol_driver::Result<String> {
            if self.allowed.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
            {
                return Err(svol_driver::DriverError::Parse("injected failure".to_string()));
            }
            self.inner.write(data)
        }
    }

    #[test]
    fn geometry() {
        let volume = small_volume(2);
        assert_eq!(volume.capacity(), 72);
        let deeper = small_volume(3);
        assert_eq!(deeper.capacity(), 216);
    }

    #[test]
    fn rejects_zero_depth() {
        let err = Volume::new(Box::new(Memory::new(8, 2)), 0, None).unwrap_err();
        assert!(matches!(err, VolumeError::InvalidGeometry(_)));
    }

    #[test]
    fn rejects_degenerate_fan_out() {
        // One 4-byte id per 4-byte entry: no room for a child list.
        let err = Volume::new(Box::new(Memory::new(4, 4)), 2, None).unwrap_err();
        assert!(matches!(err, VolumeError::InvalidGeometry(_)));
    }

    #[test]
    fn fresh_volume_reads_zeroes() {
        let volume = small_volume(2);
        assert_eq!(volume.read(8, 0).unwrap(), vec![0u8; 8]);
        assert_eq!(volume.read(72, 0).unwrap(), vec![0u8; 72]);
        // Unaligned windows synthesize zeroes too.
        assert_eq!(volume.read(13, 5).unwrap(), vec![0u8; 13]);
        assert!(volume.root_id().is_none());
    }

    #[test]
    fn reads_return_exactly_the_requested_length() {
        let volume = small_volume(2);
        for (size, offset) in [(0, 0), (1, 0), (7, 1), (8, 8), (9, 7), (72, 0), (0, 72), (5, 67)] {
            assert_eq!(volume.read(size, offset).unwrap().len(), size);
        }
    }

    #[test]
    fn read_after_write_single_leaf() {
        let volume = small_volume(2);
        assert_eq!(volume.write(0, b"ABCDEFGH").unwrap(), 8);
        assert_eq!(volume.read(8, 0).unwrap(), b"ABCDEFGH");
        assert!(volume.root_id().is_some());
    }

    #[test]
    fn write_across_leaf_boundary() {
        let volume = small_volume(2);
        assert_eq!(volume.write(6, b"XYZW").unwrap(), 4);
        let mut expected = vec![0u8; 12];
        expected[6..10].copy_from_slice(b"XYZW");
        assert_eq!(volume.read(12, 0).unwrap(), expected);
    }

    #[test]
    fn writes_do_not_disturb_surrounding_bytes() {
        let volume = small_volume(2);
        let backdrop: Vec<u8> = (0..72u8).collect();
        volume.write(0, &backdrop).unwrap();

        volume.write(20, b"????").unwrap();

        let mut expected = backdrop;
        expected[20..24].copy_from_slice(b"????");
        assert_eq!(volume.read(72, 0).unwrap(), expected);
    }

    #[test]
    fn identical_rewrites_keep_the_root_id() {
        // The memory driver is content-addressed, so writing the same
        // bytes twice must reproduce the same root.
        let volume = small_volume(2);
        volume.write(0, b"ABCDEFGH").unwrap();
        let first = volume.root_id().unwrap();
        volume.write(0, b"ABCDEFGH").unwrap();
        assert_eq!(volume.root_id().unwrap(), first);
    }

    #[test]
    fn differing_rewrites_change_the_root_id() {
        let volume = small_volume(2);
        volume.write(0, b"ABCDEFGH").unwrap();
        let first = volume.root_id().unwrap();
        volume.write(0, b"HGFEDCBA").unwrap();
        assert_ne!(volume.root_id().unwrap(), first);
    }

    #[test]
    fn full_volume_write() {
        let spy = Arc::new(Spy::new(Memory::new(8, 2)));
        let volume = Volume::new(Box::new(spy.clone()), 2, None).unwrap();

        assert_eq!(volume.write(0, &[0xFF; 72]).unwrap(), 72);
        assert_eq!(volume.read(72, 0).unwrap(), vec![0xFF; 72]);

        // Each of the 9 leaf iterations stores the leaf plus its two
        // ancestors, regardless of deduplication at the service.
        assert_eq!(spy.writes.load(Ordering::SeqCst), 27);
    }

    #[test]
    fn aligned_write_fills_last_leaf() {
        // A range ending exactly on a node boundary still consumes input
        // into the final leaf.
        let volume = small_volume(2);
        let data: Vec<u8> = (1..=24u8).collect();
        assert_eq!(volume.write(0, &data).unwrap(), 24);
        assert_eq!(volume.read(24, 0).unwrap(), data);
    }

    #[test]
    fn sparse_writes_at_depth_three() {
        let volume = small_volume(3);
        let capacity = volume.capacity();
        volume.write(0, &[0xAA]).unwrap();
        volume.write(capacity - 1, &[0xBB]).unwrap();

        let contents = volume.read(capacity as usize, 0).unwrap();
        assert_eq!(contents[0], 0xAA);
        assert_eq!(contents[capacity as usize - 1], 0xBB);
        assert!(contents[1..capacity as usize - 1].iter().all(|&b| b == 0));
    }

    #[test]
    fn reopen_from_persisted_root() {
        let store = Arc::new(Memory::new(8, 2));
        let first = Volume::new(Box::new(store.clone()), 2, None).unwrap();
        first.write(3, b"persisted payload").unwrap();
        let root = first.root_id().unwrap();

        let second = Volume::new(Box::new(store), 2, Some(root)).unwrap();
        assert_eq!(&second.read(17, 3).unwrap(), b"persisted payload");
        // Untouched regions are still zero.
        assert_eq!(second.read(3, 0).unwrap(), vec![0u8; 3]);
    }

    #[test]
    fn empty_root_id_means_fresh_volume() {
        let volume = Volume::new(Box::new(Memory::new(8, 2)), 2, Some(String::new())).unwrap();
        assert!(volume.root_id().is_none());
        assert_eq!(volume.read(72, 0).unwrap(), vec![0u8; 72]);
    }

    #[test]
    fn short_entries_are_padded_on_read() {
        let volume = Volume::new(Box::new(Trimming(Memory::new(8, 2))), 2, None).unwrap();
        volume.write(0, b"AB").unwrap();
        let mut expected = vec![0u8; 8];
        expected[..2].copy_from_slice(b"AB");
        assert_eq!(volume.read(8, 0).unwrap(), expected);
    }

    #[test]
    fn padded_interior_entries_rehydrate() {
        let store = Arc::new(Memory::new(8, 2));
        let first =
            Volume::new(Box::new(Padding(store.clone())), 2, None).unwrap();
        first.write(10, b"deep").unwrap();
        let root = first.root_id().unwrap();

        let second = Volume::new(Box::new(Padding(store)), 2, Some(root)).unwrap();
        assert_eq!(&second.read(4, 10).unwrap(), b"deep");
    }

    #[test]
    fn cache_is_transparent() {
        let store = Arc::new(Memory::new(8, 2));
        let cached = Volume::new(Box::new(store.clone()), 2, None).unwrap();
        let uncached = Volume::with_cache(
            Box::new(store),
            2,
            None,
            ReadCache::disabled(),
        )
        .unwrap();

        for volume in [&cached, &uncached] {
            volume.write(5, b"cache me if you can").unwrap();
            volume.write(40, b"again").unwrap();
        }
        assert_eq!(cached.root_id(), uncached.root_id());
        assert_eq!(
            cached.read(72, 0).unwrap(),
            uncached.read(72, 0).unwrap()
        );
    }

    #[test]
    fn cache_skips_repeat_fetches() {
        let spy = Arc::new(Spy::new(Memory::new(8, 2)));
        let volume = Volume::new(Box::new(spy.clone()), 2, None).unwrap();
        volume.write(0, b"ABCDEFGH").unwrap();

        // The first read fetches the rewritten leaf; repeats stay local.
        volume.read(8, 0).unwrap();
        let baseline = spy.reads.load(Ordering::SeqCst);
        volume.read(8, 0).unwrap();
        volume.read(8, 0).unwrap();
        assert_eq!(spy.reads.load(Ordering::SeqCst), baseline);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let volume = small_volume(2);
        assert!(matches!(
            volume.read(8, 70),
            Err(VolumeError::OutOfRange { .. })
        ));
        assert!(matches!(
            volume.write(70, b"toolong"),
            Err(VolumeError::OutOfRange { .. })
        ));
        assert!(matches!(
            volume.read(1, u64::MAX),
            Err(VolumeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn write_failures_short_circuit() {
        let driver = FailingWrites {
            inner: Memory::new(8, 2),
            // Leaf 0 propagates fully (3 stores), then the next leaf's
            // store fails.
            allowed: AtomicUsize::new(3),
        };
        let volume = Volume::new(Box::new(driver), 2, None).unwrap();
        assert!(volume.write(0, &[1u8; 16]).is_err());
        // The first leaf made it in and stays reachable in memory.
        assert_eq!(volume.read(8, 0).unwrap(), vec![1u8; 8]);
    }
}
