use core::fmt::Display;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use paychan::persist::Error;
use paychan::SendSync;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::*;

use crate::kvv::{KVVPersister, KVVStore, KVV};

// values are stored as the big-endian version followed by the payload
const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

/// A key-version-value store backed by redb
pub struct RedbKVVStore {
    db: Database,
    // current version of each key, so versioning is enforced without a read
    versions: Mutex<BTreeMap<String, u64>>,
}

impl SendSync for RedbKVVStore {}

fn db_err(e: impl Display) -> Error {
    Error::Internal(format!("redb: {}", e))
}

impl RedbKVVStore {
    /// Open or create a store in directory `path`, and wrap it in a persister
    pub fn new<P: AsRef<Path>>(path: P) -> Result<KVVPersister<Self>, Error> {
        Ok(KVVPersister(Self::new_store(path)?))
    }

    /// Open or create a store in directory `path`
    pub fn new_store<P: AsRef<Path>>(path: P) -> Result<RedbKVVStore, Error> {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir(path).map_err(|e| Error::Unavailable(format!("{}: {}", path.display(), e)))?;
        }
        if !path.is_dir() {
            return Err(Error::Unavailable(format!("{} is not a directory", path.display())));
        }
        let mut db = Database::create(path.join("redb")).map_err(db_err)?;
        if !db.check_integrity().map_err(db_err)? {
            warn!("repaired database at {}", path.display());
        }
        {
            // create the table if it doesn't exist
            let tx = db.begin_write().map_err(db_err)?;
            tx.open_table(TABLE).map_err(db_err)?;
            tx.commit().map_err(db_err)?;
        }

        let mut versions = BTreeMap::new();
        {
            let tx = db.begin_read().map_err(db_err)?;
            let table = tx.open_table(TABLE).map_err(db_err)?;
            for item in table.iter().map_err(db_err)? {
                let (key, vv) = item.map_err(db_err)?;
                let (version, _) = Self::decode_vv(vv.value())?;
                versions.insert(key.value().to_string(), version);
            }
        }
        debug!("opened {} with {} keys", path.display(), versions.len());
        Ok(Self { db, versions: Mutex::new(versions) })
    }

    fn decode_vv(vv: &[u8]) -> Result<(u64, Vec<u8>), Error> {
        if vv.len() < 8 {
            return Err(Error::Internal(format!("stored value has {} bytes", vv.len())));
        }
        let mut version = [0u8; 8];
        version.copy_from_slice(&vv[..8]);
        Ok((u64::from_be_bytes(version), vv[8..].to_vec()))
    }

    fn encode_vv(version: u64, value: Vec<u8>) -> Vec<u8> {
        let mut vv = Vec::with_capacity(value.len() + 8);
        vv.extend_from_slice(&version.to_be_bytes());
        vv.extend_from_slice(&value);
        vv
    }
}

impl KVVStore for RedbKVVStore {
    type Iter = Iter;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let version = self.versions.lock().unwrap().get(key).map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }

    #[instrument(skip(self, value))]
    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error> {
        let vv = Self::encode_vv(version, value);
        let mut versions = self.versions.lock().unwrap();

        if let Some(v) = versions.get(key) {
            if version < *v {
                error!("version mismatch for {}: {} < {}", key, version, v);
                return Err(Error::VersionMismatch(key.to_string()));
            } else if version == *v {
                let tx = self.db.begin_read().map_err(db_err)?;
                let table = tx.open_table(TABLE).map_err(db_err)?;
                let existing = table
                    .get(key)
                    .map_err(db_err)?
                    .ok_or_else(|| Error::NotFound(key.to_string()))?;
                if existing.value() != vv.as_slice() {
                    error!("value mismatch for {}: {}", key, version);
                    return Err(Error::VersionMismatch(key.to_string()));
                }
                return Ok(());
            }
        }
        let tx = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = tx.open_table(TABLE).map_err(db_err)?;
            table.insert(key, vv.as_slice()).map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        versions.insert(key.to_string(), version);
        Ok(())
    }

    #[instrument(skip(self))]
    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        let tx = self.db.begin_read().map_err(db_err)?;
        let table = tx.open_table(TABLE).map_err(db_err)?;
        let result = table.get(key).map_err(db_err)?;
        match result {
            Some(vv) => Ok(Some(Self::decode_vv(vv.value())?)),
            None => Ok(None),
        }
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        Ok(self.versions.lock().unwrap().get(key).copied())
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let tx = self.db.begin_read().map_err(db_err)?;
        let table = tx.open_table(TABLE).map_err(db_err)?;
        let mut result = Vec::new();
        for item in table.range(prefix..).map_err(db_err)? {
            let (key, vv) = item.map_err(db_err)?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let (version, value) = Self::decode_vv(vv.value())?;
            result.push(KVV(key.value().to_string(), (version, value)));
        }
        Ok(Iter(result.into_iter()))
    }

    fn clear_database(&self) -> Result<(), Error> {
        let mut versions = self.versions.lock().unwrap();
        let tx = self.db.begin_write().map_err(db_err)?;
        tx.delete_table(TABLE).map_err(db_err)?;
        tx.open_table(TABLE).map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        versions.clear();
        Ok(())
    }
}
