//! Response cache: key derivation, eligibility rules, entries and storage.
//!
//! - [`key`]: canonicalizes a request target and digests it into a [`CacheKey`].
//! - [`rules`]: decides which request paths may be cached.
//! - [`entry`]: the persisted [`CacheEntry`] record.
//! - [`store`]: the [`CacheStore`] over a pluggable [`KvEngine`].

pub mod entry;
pub mod key;
pub mod rules;
pub mod store;

pub use entry::CacheEntry;
pub use key::{CacheKey, KeyError, RequestTarget, derive_key, normalize};
pub use rules::{CacheRule, CacheRuleSet, RuleError, is_cacheable};
pub use store::{CacheStore, KvEngine, MemoryEngine, SledEngine, StoreError, StoreStatsSnapshot};
