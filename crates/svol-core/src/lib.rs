//! # svol-core
//!
//! The block translation layer: presents a contiguous byte-addressable
//! volume whose backing storage is a fixed-arity, fixed-depth tree of
//! shortener entries.
//!
//! Leaves hold raw volume bytes; interior entries hold the comma-joined
//! identifiers of their children. Because identifiers change on every
//! store, any leaf rewrite cascades bottom-up: the leaf gets a new
//! identifier, so its parent's child list changes and must be re-stored,
//! and so on to the root. The root identifier is the sole handle a volume
//! needs to be reopened later.
//!
//! Regions that have never been written are synthesized as zeroes on read
//! without ever touching the shortener.

mod cache;
mod tree;
mod volume;

pub use cache::ReadCache;
pub use volume::Volume;

use thiserror::Error;

/// Errors surfaced by volume operations.
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error(transparent)]
    Driver(#[from] svol_driver::DriverError),

    #[error("invalid volume geometry: {0}")]
    InvalidGeometry(String),

    #[error("range {offset}+{len} exceeds capacity {capacity}")]
    OutOfRange {
        offset: u64,
        len: u64,
        capacity: u64,
    },

    #[error("corrupt tree entry: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, VolumeError>;
