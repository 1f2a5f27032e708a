//! Published cache entries.

use bytes::Bytes;
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};

use super::{blob::Blob, fingerprint::Fingerprint};

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
const HTTP_DATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Serialized result content. Exactly one representation is present.
#[derive(Debug)]
pub enum Payload {
    Memory(Bytes),
    Blob(Blob),
}

impl Payload {
    pub fn len(&self) -> u64 {
        match self {
            Payload::Memory(bytes) => bytes.len() as u64,
            Payload::Blob(blob) => blob.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self, Payload::Blob(_))
    }
}

/// Immutable snapshot of one endpoint's result.
///
/// Header values are rendered once here; replacing a key always means
/// publishing a new entry.
#[derive(Debug)]
pub struct CacheEntry {
    fingerprint: Fingerprint,
    produced_at: OffsetDateTime,
    freshness_secs: u64,
    payload: Payload,
    etag: String,
    last_modified: String,
    cache_control: String,
}

impl CacheEntry {
    /// `produced_at` is truncated to whole seconds and converted to UTC.
    pub fn new(
        fingerprint: Fingerprint,
        produced_at: OffsetDateTime,
        freshness_secs: u64,
        payload: Payload,
    ) -> Self {
        let produced_at = produced_at
            .to_offset(time::UtcOffset::UTC)
            .replace_nanosecond(0)
            .unwrap_or(produced_at);
        let last_modified = produced_at
            .format(HTTP_DATE)
            .unwrap_or_else(|_| String::from("Thu, 01 Jan 1970 00:00:00 GMT"));

        Self {
            fingerprint,
            produced_at,
            freshness_secs,
            payload,
            etag: fingerprint.etag(),
            last_modified,
            cache_control: format!("max-age={freshness_secs}, immutable"),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn produced_at(&self) -> OffsetDateTime {
        self.produced_at
    }

    pub fn freshness_secs(&self) -> u64 {
        self.freshness_secs
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn last_modified(&self) -> &str {
        &self.last_modified
    }

    pub fn cache_control(&self) -> &str {
        &self.cache_control
    }

    /// Weak comparison against an `If-None-Match` header value.
    pub fn matches(&self, if_none_match: &str) -> bool {
        let ours = opaque_tag(&self.etag);
        if_none_match
            .split(',')
            .map(str::trim)
            .filter(|candidate| !candidate.is_empty())
            .any(|candidate| candidate == "*" || opaque_tag(candidate) == ours)
    }
}

fn opaque_tag(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}
