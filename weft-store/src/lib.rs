//! Weft Store
//!
//! The replicated key-value store node: an event-loop actor owning
//! the local map, peer table, TTL countdown queue and full-sync
//! backoff state, with a cloneable handle for in-process callers and
//! bound bus endpoints for everyone else.
//!
//! Replication is eventually consistent: deltas flood through
//! publish/subscribe topics, new peers full-sync with exponential
//! backoff, and a periodic randomized hash-dump pull closes any
//! remaining divergence.

pub mod actor;
pub mod backoff;
pub mod error;
pub mod handle;
pub mod ttl_queue;

pub use actor::{KvStore, KvStoreConfig, DEFAULT_DB_SYNC_INTERVAL, DEFAULT_STATS_SUBMIT_INTERVAL};
pub use backoff::ExponentialBackoff;
pub use error::StoreError;
pub use handle::KvStoreHandle;
pub use ttl_queue::{TtlCountdownEntry, TtlCountdownQueue};
