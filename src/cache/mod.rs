//! querycache storage engine
//!
//! Holds the published result for every endpoint and the encrypted files that
//! back large results:
//!
//! - **CacheStore**: sharded key → entry map with atomic publish and removal
//! - **CacheEntry**: immutable result snapshot with precomputed HTTP validators
//! - **BlobStore**: AES-256-GCM encrypted temporary files, keyed per process
//! - **Fingerprinter**: streaming XXH64 over serialized rows
//!
//! Replaced entries are retired by dropping them. A file-backed entry deletes
//! its blob once the last reader holding the entry lets go.

mod blob;
mod entry;
mod fingerprint;
mod store;

pub use blob::{Blob, BlobError, BlobReader, BlobStore, BlobWriter};
#[cfg(test)]
pub(crate) use blob::wait_until_removed;
pub use entry::{CacheEntry, Payload};
pub use fingerprint::{Fingerprint, Fingerprinter};
pub use store::CacheStore;
