//! Disk cache for verified blobs.
//!
//! The [`CacheStore`] owns the blob directory and its embedded metadata
//! database; [`stream`] provides the hash-validating tee that fills the
//! cache while fanning bytes out to waiting clients.

pub mod store;
pub mod stream;

pub use store::CacheStore;
