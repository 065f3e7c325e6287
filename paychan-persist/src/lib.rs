//! Persisters for [`paychan`] nodes, built on key-version-value stores.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Key-version-value stores and the adapter implementing [`paychan::persist::Persist`]
pub mod kvv;

pub use kvv::memory::MemoryKVVStore;
#[cfg(feature = "redb-kvv")]
pub use kvv::redb::RedbKVVStore;
pub use kvv::{KVVPersister, KVVStore, KVV};
