/// In-memory store
pub mod memory;
/// redb file-backed store
#[cfg(feature = "redb-kvv")]
pub mod redb;

use core::fmt::Debug;
use core::ops::Deref;

use paychan::bitcoin::hashes::Hash;
use paychan::bitcoin::{OutPoint, Txid};
use paychan::channel::ChannelId;
use paychan::node::MultihopPayment;
use paychan::persist::model::ChannelData;
use paychan::persist::{Error, Persist};
use paychan::SendSync;
use serde_json::{from_slice, to_vec};

const CHANNEL_PREFIX: &str = "channel";
const MULTIHOP_PREFIX: &str = "multihop";
const SEPARATOR: &str = "/";

/// key-version-value
pub struct KVV(pub String, pub (u64, Vec<u8>));

impl Debug for KVV {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("KVV").field(&self.0).field(&self.1 .0).field(&hex::encode(&self.1 .1)).finish()
    }
}

impl KVV {
    /// convert to the inner tuple
    pub fn into_inner(self) -> (String, (u64, Vec<u8>)) {
        (self.0, self.1)
    }
}

/// A key-version-value store
pub trait KVVStore: SendSync {
    /// Iterator over a key range
    type Iter: Iterator<Item = KVV>;

    /// Put a value, bumping the key's version
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;
    /// If the key already exists, the version must be greater than the existing version.
    /// Writing the same version again is accepted only with the same value.
    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error>;
    /// Get a key-value pair from the store
    /// Returns Ok(None) if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error>;
    /// Get the version of a key-value pair from the store
    /// Returns Ok(None) if the key does not exist.
    fn get_version(&self, key: &str) -> Result<Option<u64>, Error>;
    /// Get all key-value pairs with the given prefix, in key order
    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error>;
    /// Clear the database
    fn clear_database(&self) -> Result<(), Error>;
}

/// Adapter for a KVVStore to implement Persist.
///
/// Channels are stored as JSON under `channel/<hex id>`, where the id is the
/// funding txid followed by the big-endian vout.  Multihop records are stored
/// under `multihop/<hex payment hash>`.
pub struct KVVPersister<S: KVVStore>(pub S);

impl<S: KVVStore> Deref for KVVPersister<S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S: KVVStore> SendSync for KVVPersister<S> {}

impl<S: KVVStore> Persist for KVVPersister<S> {
    fn save_channel(&self, id: &ChannelId, data: &ChannelData) -> Result<(), Error> {
        let key = make_key(CHANNEL_PREFIX, &channel_id_bytes(id));
        self.put(&key, data.to_bytes()?)
    }

    fn load_channel(&self, id: &ChannelId) -> Result<ChannelData, Error> {
        let key = make_key(CHANNEL_PREFIX, &channel_id_bytes(id));
        let (_, value) = self.get(&key)?.ok_or_else(|| Error::NotFound(key.clone()))?;
        ChannelData::from_bytes(&value)
    }

    fn list_channels(&self) -> Result<Vec<(ChannelId, ChannelData)>, Error> {
        let prefix = CHANNEL_PREFIX.to_string() + SEPARATOR;
        let mut res = Vec::new();
        for kvv in self.get_prefix(&prefix)? {
            let (key, (_, value)) = kvv.into_inner();
            let id = channel_id_from_bytes(&extract_key_suffix(&prefix, &key)?)?;
            res.push((id, ChannelData::from_bytes(&value)?));
        }
        Ok(res)
    }

    fn save_multihop(&self, payment: &MultihopPayment) -> Result<(), Error> {
        let key = make_key(MULTIHOP_PREFIX, &payment.payment_hash);
        let value = to_vec(payment).map_err(|e| Error::Internal(format!("encode multihop: {}", e)))?;
        self.put(&key, value)
    }

    fn load_multihops(&self) -> Result<Vec<MultihopPayment>, Error> {
        let prefix = MULTIHOP_PREFIX.to_string() + SEPARATOR;
        self.get_prefix(&prefix)?
            .map(|kvv| {
                let (key, (_, value)) = kvv.into_inner();
                from_slice(&value).map_err(|e| Error::Internal(format!("decode {}: {}", key, e)))
            })
            .collect()
    }
}

fn make_key(prefix: impl Into<String>, key: &[u8]) -> String {
    format!("{}/{}", prefix.into(), hex::encode(key))
}

fn extract_key_suffix(prefix: &str, key: &str) -> Result<Vec<u8>, Error> {
    let suffix = key
        .strip_prefix(prefix)
        .ok_or_else(|| Error::Internal(format!("key {} outside {}", key, prefix)))?;
    hex::decode(suffix).map_err(|e| Error::Internal(format!("bad key {}: {}", key, e)))
}

fn channel_id_bytes(id: &ChannelId) -> Vec<u8> {
    let outpoint = id.outpoint();
    let mut bytes = outpoint.txid.as_byte_array().to_vec();
    bytes.extend_from_slice(&outpoint.vout.to_be_bytes());
    bytes
}

fn channel_id_from_bytes(bytes: &[u8]) -> Result<ChannelId, Error> {
    if bytes.len() != 36 {
        return Err(Error::Internal(format!("channel id has {} bytes", bytes.len())));
    }
    let mut txid = [0u8; 32];
    txid.copy_from_slice(&bytes[..32]);
    let mut vout = [0u8; 4];
    vout.copy_from_slice(&bytes[32..]);
    Ok(ChannelId(OutPoint { txid: Txid::from_byte_array(txid), vout: u32::from_be_bytes(vout) }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::memory::MemoryKVVStore;
    use super::*;
    use paychan::node::Node;
    use paychan::util::test_utils::*;
    use paychan::Arc;
    use test_log::test;

    /// A node on `persister` with one funded channel and one multihop record
    pub(crate) fn make_node(persister: Arc<dyn Persist>) -> (Node, ChannelId) {
        let wallet_a = Arc::new(TestWallet::new(1));
        let wallet_b = Arc::new(TestWallet::new(2));
        let (setup, _) = make_channel_setups(&*wallet_a, &*wallet_b, 0, 1, 0, 700_000, 300_000);
        let node = Node::new(test_config(), wallet_a, persister, Arc::new(TestTransport::new()));
        let id = node.add_channel(setup).unwrap();
        node.register_multihop([5; 32], 50_000, None, id).unwrap();
        (node, id)
    }

    /// Restore a node from `persister` and check it matches `node`
    pub(crate) fn check_restore(node: &Node, id: &ChannelId, persister: Arc<dyn Persist>) {
        let restored = Node::restore(
            test_config(),
            Arc::new(TestWallet::new(1)),
            persister,
            Arc::new(TestTransport::new()),
        )
        .unwrap();
        assert_eq!(restored.channel_ids(), vec![*id]);
        let data = restored.with_channel(id, |c| Ok(c.to_data())).unwrap();
        assert_eq!(data, node.with_channel(id, |c| Ok(c.to_data())).unwrap());
        assert_eq!(restored.multihops(), node.multihops());
    }

    #[test]
    fn channel_key_test() {
        let id = test_channel_id(7);
        let bytes = channel_id_bytes(&id);
        assert_eq!(bytes.len(), 36);
        let key = make_key(CHANNEL_PREFIX, &bytes);
        assert!(key.starts_with("channel/0707"));
        let suffix = extract_key_suffix("channel/", &key).unwrap();
        assert_eq!(channel_id_from_bytes(&suffix).unwrap(), id);
        assert!(extract_key_suffix("multihop/", &key).is_err());
        assert!(channel_id_from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn persister_round_trip_test() {
        let persister = Arc::new(MemoryKVVStore::new());
        let (node, id) = make_node(persister.clone());
        check_restore(&node, &id, persister.clone());

        let key = make_key(CHANNEL_PREFIX, &channel_id_bytes(&id));
        assert_eq!(persister.get_version(&key).unwrap(), Some(0));
        let data = persister.load_channel(&id).unwrap();
        persister.save_channel(&id, &data).unwrap();
        assert_eq!(persister.get_version(&key).unwrap(), Some(1));

        let record = &persister.load_multihops().unwrap()[0];
        assert_eq!(record.payment_hash, [5; 32]);
        assert_eq!(record.outgoing, id);
    }

    #[test]
    fn missing_channel_test() {
        let persister = MemoryKVVStore::new();
        match persister.load_channel(&test_channel_id(1)) {
            Err(Error::NotFound(key)) => assert!(key.starts_with("channel/")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(persister.list_channels().unwrap().is_empty());
    }

    #[test]
    fn corrupt_value_test() {
        let persister = MemoryKVVStore::new();
        let key = make_key(CHANNEL_PREFIX, &channel_id_bytes(&test_channel_id(1)));
        persister.put(&key, b"garbage".to_vec()).unwrap();
        assert!(matches!(persister.list_channels(), Err(Error::Internal(_))));
    }
}
