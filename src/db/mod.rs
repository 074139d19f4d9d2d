// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod errors;
mod memory;

pub use errors::Error;
pub use memory::MemoryDB;

/// Store interface used as a KV store implementation. Deal records and the
/// current signed ask are persisted through this interface; the embedding
/// node decides the backing database.
pub trait Store: Clone + Send + Sync + 'static {
    /// Read a single value from the data store, `None` if the key doesn't
    /// exist.
    fn read<K>(&self, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        K: AsRef<[u8]>;

    /// Write a single value to the data store.
    fn write<K, V>(&self, key: K, value: V) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>;

    /// Delete the value at `key`.
    fn delete<K>(&self, key: K) -> Result<(), Error>
    where
        K: AsRef<[u8]>;

    /// Returns `Ok(true)` if the key exists in the store.
    fn exists<K>(&self, key: K) -> Result<bool, Error>
    where
        K: AsRef<[u8]>;

    /// Return every value stored under a key starting with `prefix`.
    fn values_with_prefix<K>(&self, prefix: K) -> Result<Vec<Vec<u8>>, Error>
    where
        K: AsRef<[u8]>;
}
