//! # svol-driver
//!
//! Shortener drivers for shortvol.
//!
//! A driver turns a chunk of bytes into an opaque short identifier and back
//! again. Every driver advertises two fixed attributes: how many bytes fit
//! into a single entry (`node_size`) and how long its identifiers are
//! (`id_size`). The block layer consumes drivers exclusively through the
//! [`Shortener`] trait, so adding a backend means implementing the trait and
//! wiring it into [`create`].
//!
//! Identifiers are opaque strings. Some services hand back the same
//! identifier for the same payload (effectively deduplicating writes);
//! nothing here relies on that.

mod bitly;
mod memory;
mod tinyurl;

pub use bitly::Bitly;
pub use memory::Memory;
pub use tinyurl::Tinyurl;

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors surfaced by shortener drivers.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Parse(String),

    #[error("payload decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    #[error("invalid driver options: {0}")]
    InvalidOptions(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// A URL shortener seen as an addressable byte store.
///
/// `read` and `write` are synchronous; for the network-backed drivers each
/// call is one HTTP round-trip and may block for seconds. Cancellation and
/// timeouts are the driver's business, callers only see the error.
pub trait Shortener: Send + Sync + std::fmt::Debug {
    /// Number of storable bytes in one entry. Constant.
    fn node_size(&self) -> usize;

    /// Length of one identifier. Constant.
    fn id_size(&self) -> usize;

    /// Fetch the bytes stored under an identifier.
    ///
    /// May return fewer than `node_size` bytes; short entries are the
    /// caller's problem to pad.
    fn read(&self, id: &str) -> Result<Vec<u8>>;

    /// Store up to `node_size` bytes and return the new identifier.
    fn write(&self, data: &[u8]) -> Result<String>;
}

impl<T: Shortener + ?Sized> Shortener for std::sync::Arc<T> {
    fn node_size(&self) -> usize {
        (**self).node_size()
    }

    fn id_size(&self) -> usize {
        (**self).id_size()
    }

    fn read(&self, id: &str) -> Result<Vec<u8>> {
        (**self).read(id)
    }

    fn write(&self, data: &[u8]) -> Result<String> {
        (**self).write(data)
    }
}

/// Construct a driver by name.
///
/// `opts` is the free-form `driver_opts` mapping from the config file; each
/// driver decodes its own typed options from it. Unknown names are fatal at
/// startup.
pub fn create(name: &str, opts: &serde_yaml::Value) -> Result<Box<dyn Shortener>> {
    match name {
        "memory" => Ok(Box::new(Memory::from_opts(opts)?)),
        "tinyurl" => Ok(Box::new(Tinyurl::from_opts(opts)?)),
        "bitly" => Ok(Box::new(Bitly::from_opts(opts)?)),
        other => Err(DriverError::UnknownDriver(other.to_string())),
    }
}

/// Decode a driver's options struct from the free-form config value.
/// An absent `driver_opts` key arrives as `Null` and means "all defaults".
pub(crate) fn decode_opts<T: DeserializeOwned + Default>(opts: &serde_yaml::Value) -> Result<T> {
    if opts.is_null() {
        return Ok(T::default());
    }
    Ok(serde_yaml::from_value(opts.clone())?)
}
