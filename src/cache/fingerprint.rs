//! Streaming content fingerprints.

use std::fmt;

use xxhash_rust::xxh64::Xxh64;

const SEED: u64 = 0;

/// Incremental XXH64 over serialized rows, fed as they are produced.
#[derive(Clone)]
pub struct Fingerprinter {
    hasher: Xxh64,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self {
            hasher: Xxh64::new(SEED),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish(&self) -> Fingerprint {
        Fingerprint(self.hasher.digest())
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fingerprinter").finish_non_exhaustive()
    }
}

/// 64-bit content hash of a cached result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Weak entity-tag form, `W/"<hex>"`.
    pub fn etag(self) -> String {
        format!("W/\"{:x}\"", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
