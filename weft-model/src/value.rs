//! The replicated record type and its identity ordering.

use siphasher::sip::SipHasher24;
use std::hash::Hasher;

/// Sentinel TTL disabling expiry.
pub const TTL_INFINITE: i64 = i64::MAX;

// Fixed SipHash keys: the content hash must agree across processes,
// so the randomly-keyed std hasher is not an option.
const HASH_KEY_0: u64 = 0x7765_6674_2d6b_7673; // "weft-kvs"
const HASH_KEY_1: u64 = 0x6861_7368_2d76_3031; // "hash-v01"

/// One versioned record in the replicated store.
///
/// `version` is a monotonic counter owned by the originator. `value`
/// is absent for TTL-only refreshes, which bump `ttl_version` instead
/// of `version`. `hash` is a pure function of
/// (version, originator_id, value) and is what hash-dump diffing
/// compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub version: u64,
    pub originator_id: String,
    pub value: Option<Vec<u8>>,
    pub ttl_ms: i64,
    pub ttl_version: u64,
    pub hash: u64,
}

impl Value {
    /// Build a record and fill in its content hash.
    pub fn new(
        version: u64,
        originator_id: impl Into<String>,
        value: Option<Vec<u8>>,
        ttl_ms: i64,
        ttl_version: u64,
    ) -> Self {
        let mut val = Self {
            version,
            originator_id: originator_id.into(),
            value,
            ttl_ms,
            ttl_version,
            hash: 0,
        };
        val.rehash();
        val
    }

    /// Recompute the content hash over (version, originator_id, value).
    pub fn content_hash(&self) -> u64 {
        let mut hasher = SipHasher24::new_with_keys(HASH_KEY_0, HASH_KEY_1);
        hasher.write_u64(self.version);
        hasher.write_usize(self.originator_id.len());
        hasher.write(self.originator_id.as_bytes());
        match &self.value {
            Some(bytes) => {
                hasher.write_u8(1);
                hasher.write(bytes);
            }
            None => hasher.write_u8(0),
        }
        hasher.finish()
    }

    /// Fill the `hash` field from the other identifying fields.
    pub fn rehash(&mut self) {
        self.hash = self.content_hash();
    }

    pub fn is_ttl_infinite(&self) -> bool {
        self.ttl_ms == TTL_INFINITE
    }

    /// A finite, non-positive TTL is the deletion sentinel.
    pub fn is_delete(&self) -> bool {
        self.ttl_ms <= 0
    }

    /// The tuple that decides merge conflicts, compared lexicographically.
    pub fn identity(&self) -> (u64, &str, u64) {
        (self.version, self.originator_id.as_str(), self.hash)
    }

    /// Copy of this record with the payload stripped, as returned by
    /// hash dumps.
    pub fn hash_summary(&self) -> Value {
        Value {
            value: None,
            ..self.clone()
        }
    }

    /// TTL-only refresh of this record: no payload, same identity
    /// tuple, bumped `ttl_version`.
    pub fn ttl_refresh(&self, ttl_ms: i64) -> Value {
        let mut refresh = self.hash_summary();
        refresh.ttl_ms = ttl_ms;
        refresh.ttl_version = self.ttl_version + 1;
        refresh
    }
}
