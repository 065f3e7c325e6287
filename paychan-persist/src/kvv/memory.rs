use std::collections::BTreeMap;
use std::sync::Mutex;

use log::*;
use paychan::persist::Error;
use paychan::SendSync;

use crate::kvv::{KVVPersister, KVVStore, KVV};

/// A key-version-value in-memory store.
pub struct MemoryKVVStore {
    data: Mutex<BTreeMap<String, (u64, Vec<u8>)>>,
}

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl MemoryKVVStore {
    /// Create a persister over an empty in-memory store
    pub fn new() -> KVVPersister<Self> {
        KVVPersister(Self { data: Mutex::new(BTreeMap::new()) })
    }
}

impl SendSync for MemoryKVVStore {}

impl KVVStore for MemoryKVVStore {
    type Iter = Iter;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let version = self.get_version(key)?.map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }

    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error> {
        let mut data = self.data.lock().unwrap();
        if let Some((ver, val)) = data.get(key) {
            if version < *ver {
                error!("version mismatch for {}: {} < {}", key, version, ver);
                return Err(Error::VersionMismatch(key.to_string()));
            } else if version == *ver {
                if *val != value {
                    error!("value mismatch for {}: {}", key, version);
                    return Err(Error::VersionMismatch(key.to_string()));
                }
                return Ok(());
            }
        }
        data.insert(key.to_string(), (version, value));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        Ok(self.data.lock().unwrap().get(key).map(|(v, _)| *v))
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let data = self.data.lock().unwrap();
        let result = data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (ver, value))| KVV(k.clone(), (*ver, value.clone())))
            .collect::<Vec<_>>();
        Ok(Iter(result.into_iter()))
    }

    fn clear_database(&self) -> Result<(), Error> {
        self.data.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn versioned_put_test() {
        let store = MemoryKVVStore::new();
        store.put("a/1", b"x".to_vec()).unwrap();
        store.put("a/1", b"y".to_vec()).unwrap();
        assert_eq!(store.get("a/1").unwrap(), Some((1, b"y".to_vec())));

        // same version and value is a no-op, anything else going back is refused
        store.put_with_version("a/1", 1, b"y".to_vec()).unwrap();
        assert!(matches!(store.put_with_version("a/1", 1, b"z".to_vec()), Err(Error::VersionMismatch(_))));
        assert!(matches!(store.put_with_version("a/1", 0, b"y".to_vec()), Err(Error::VersionMismatch(_))));
        store.put_with_version("a/1", 5, b"z".to_vec()).unwrap();
        assert_eq!(store.get_version("a/1").unwrap(), Some(5));
        assert_eq!(store.get("b").unwrap(), None);
    }

    #[test]
    fn prefix_test() {
        let store = MemoryKVVStore::new();
        for key in ["a/2", "b/1", "a/1", "ab"] {
            store.put(key, key.as_bytes().to_vec()).unwrap();
        }
        let keys: Vec<String> = store.get_prefix("a/").unwrap().map(|kvv| kvv.0).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
        store.clear_database().unwrap();
        assert_eq!(store.get_prefix("").unwrap().count(), 0);
    }
}
