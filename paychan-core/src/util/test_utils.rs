#![allow(missing_docs)]

use core::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{OutPoint, Transaction, Txid, WPubkeyHash};
use tracing::*;

use crate::channel::{Channel, ChannelBasepoints, ChannelId, ChannelSetup, FundingDescriptor};
use crate::channel_err;
use crate::error::ChannelError;
use crate::msgs::Message;
use crate::node::{ChannelPolicy, MultihopPayment, Node, NodeConfig};
use crate::persist::model::ChannelData;
use crate::persist::{Error, Persist};
use crate::prelude::*;
use crate::signer::{derive, KeyGen, KeyPurpose};
use crate::wallet::{AssetParams, PeerTransport, UtxoDescriptor, Wallet};
use crate::Arc;

pub const TEST_ASSET: u32 = 1;
pub const TEST_FEE: i64 = 1_000;
pub const TEST_DELAY: u16 = 144;
pub const TEST_FUNDING_HEIGHT: u32 = 100;
pub const TEST_HEIGHT: u32 = 1000;

pub fn test_config() -> NodeConfig {
    NodeConfig {
        policy: ChannelPolicy {
            min_output: 10_000,
            max_send: 1 << 30,
            channel_timeout: Duration::from_secs(10),
        },
    }
}

pub fn test_channel_id(n: u8) -> ChannelId {
    ChannelId(OutPoint { txid: Txid::from_byte_array([n; 32]), vout: 0 })
}

/// A wallet deriving keys from a fixed seed and recording what it is handed
pub struct TestWallet {
    seed: [u8; 32],
    pub height: Mutex<u32>,
    pub test_network: bool,
    pub reachable: Mutex<bool>,
    pub broadcasts: Mutex<Vec<Transaction>>,
    pub exports: Mutex<Vec<UtxoDescriptor>>,
    pub unwatched: Mutex<Vec<OutPoint>>,
    next_address: Mutex<u8>,
}

impl TestWallet {
    pub fn new(seed_byte: u8) -> Self {
        TestWallet {
            seed: [seed_byte; 32],
            height: Mutex::new(TEST_HEIGHT),
            test_network: false,
            reachable: Mutex::new(true),
            broadcasts: Mutex::new(Vec::new()),
            exports: Mutex::new(Vec::new()),
            unwatched: Mutex::new(Vec::new()),
            next_address: Mutex::new(0),
        }
    }

    pub fn set_height(&self, height: u32) {
        *self.height.lock().unwrap() = height;
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn exports(&self) -> Vec<UtxoDescriptor> {
        self.exports.lock().unwrap().clone()
    }
}

impl SendSync for TestWallet {}

impl Wallet for TestWallet {
    fn current_height(&self, _asset: u32) -> Result<u32, ChannelError> {
        Ok(*self.height.lock().unwrap())
    }

    fn asset_params(&self, _asset: u32) -> Option<AssetParams> {
        if *self.reachable.lock().unwrap() {
            Some(AssetParams { test_network: self.test_network })
        } else {
            None
        }
    }

    fn derive_private_key(&self, keygen: &KeyGen) -> Result<SecretKey, ChannelError> {
        Ok(derive(&self.seed, keygen)?.secret_key())
    }

    fn broadcast(&self, _asset: u32, tx: &Transaction) -> Result<(), ChannelError> {
        self.broadcasts.lock().unwrap().push(tx.clone());
        Ok(())
    }

    fn new_address(&self, _asset: u32) -> Result<WPubkeyHash, ChannelError> {
        let mut next = self.next_address.lock().unwrap();
        *next += 1;
        Ok(WPubkeyHash::from_byte_array([*next; 20]))
    }

    fn export_utxo(&self, descriptor: UtxoDescriptor) -> Result<(), ChannelError> {
        self.exports.lock().unwrap().push(descriptor);
        Ok(())
    }

    fn stop_watching(&self, _asset: u32, outpoint: &OutPoint) -> Result<(), ChannelError> {
        self.unwatched.lock().unwrap().push(*outpoint);
        Ok(())
    }
}

/// A persister keeping serialized channels in memory
pub struct MemoryPersister {
    channels: Mutex<OrderedMap<ChannelId, Vec<u8>>>,
    multihops: Mutex<OrderedMap<[u8; 32], MultihopPayment>>,
    fail_saves: AtomicBool,
}

impl MemoryPersister {
    pub fn new() -> Self {
        MemoryPersister {
            channels: Mutex::new(OrderedMap::new()),
            multihops: Mutex::new(OrderedMap::new()),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, id: &ChannelId) -> bool {
        self.channels.lock().unwrap().contains_key(id)
    }

    pub fn load(&self, id: &ChannelId) -> ChannelData {
        self.load_channel(id).unwrap()
    }

    pub fn multihops(&self) -> Vec<MultihopPayment> {
        self.multihops.lock().unwrap().values().cloned().collect()
    }
}

impl SendSync for MemoryPersister {}

impl Persist for MemoryPersister {
    fn save_channel(&self, id: &ChannelId, data: &ChannelData) -> Result<(), Error> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("saves disabled".to_string()));
        }
        self.channels.lock().unwrap().insert(*id, data.to_bytes()?);
        Ok(())
    }

    fn load_channel(&self, id: &ChannelId) -> Result<ChannelData, Error> {
        let channels = self.channels.lock().unwrap();
        let bytes = channels.get(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        ChannelData::from_bytes(bytes)
    }

    fn list_channels(&self) -> Result<Vec<(ChannelId, ChannelData)>, Error> {
        let channels = self.channels.lock().unwrap();
        channels.iter().map(|(id, bytes)| Ok((*id, ChannelData::from_bytes(bytes)?))).collect()
    }

    fn save_multihop(&self, payment: &MultihopPayment) -> Result<(), Error> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("saves disabled".to_string()));
        }
        self.multihops.lock().unwrap().insert(payment.payment_hash, payment.clone());
        Ok(())
    }

    fn load_multihops(&self) -> Result<Vec<MultihopPayment>, Error> {
        Ok(self.multihops())
    }
}

/// A transport queueing encoded messages until the test delivers them
pub struct TestTransport {
    outbox: Mutex<Vec<(u32, Vec<u8>)>>,
    fail_sends: AtomicBool,
}

impl TestTransport {
    pub fn new() -> Self {
        TestTransport { outbox: Mutex::new(Vec::new()), fail_sends: AtomicBool::new(false) }
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Drain the queue, in send order
    pub fn take(&self) -> Vec<(u32, Message)> {
        let queued: Vec<(u32, Vec<u8>)> = self.outbox.lock().unwrap().drain(..).collect();
        queued.into_iter().map(|(peer, bytes)| (peer, Message::from_bytes(&bytes).unwrap())).collect()
    }

    /// Names of the queued messages, leaving them queued
    pub fn pending_names(&self) -> Vec<&'static str> {
        let outbox = self.outbox.lock().unwrap();
        outbox.iter().map(|(_, bytes)| Message::from_bytes(bytes).unwrap().name()).collect()
    }

    pub fn pending(&self) -> usize {
        self.outbox.lock().unwrap().len()
    }
}

impl SendSync for TestTransport {}

impl PeerTransport for TestTransport {
    fn send(&self, peer_idx: u32, msg: Message) -> Result<(), ChannelError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            channel_err!(Transport, "peer {} unreachable", peer_idx);
        }
        self.outbox.lock().unwrap().push((peer_idx, msg.to_bytes()?));
        Ok(())
    }
}

pub struct TestNode {
    pub node: Arc<Node>,
    pub wallet: Arc<TestWallet>,
    pub persister: Arc<MemoryPersister>,
    pub transport: Arc<TestTransport>,
}

impl TestNode {
    pub fn new(seed_byte: u8, config: NodeConfig) -> Self {
        let wallet = Arc::new(TestWallet::new(seed_byte));
        let persister = Arc::new(MemoryPersister::new());
        let transport = Arc::new(TestTransport::new());
        let node = Arc::new(Node::new(config, wallet.clone(), persister.clone(), transport.clone()));
        TestNode { node, wallet, persister, transport }
    }

    pub fn data(&self, id: &ChannelId) -> ChannelData {
        self.node.with_channel(id, |c| Ok(c.to_data())).unwrap()
    }

    pub fn balances(&self, id: &ChannelId) -> (i64, i64) {
        self.node.with_channel(id, |c| Ok(c.state.balances(c.capacity()))).unwrap()
    }
}

/// Setups for a channel between the holders of two wallets, the first
/// funding it
pub fn make_channel_setups(
    wallet_a: &dyn Wallet,
    wallet_b: &dyn Wallet,
    a_idx: u32,
    b_idx: u32,
    channel_idx: u32,
    a_amount: i64,
    b_amount: i64,
) -> (ChannelSetup, ChannelSetup) {
    let outpoint = OutPoint {
        txid: Txid::from_byte_array([0x10 + channel_idx as u8; 32]),
        vout: channel_idx,
    };
    let a_points = ChannelBasepoints::derive(wallet_a, TEST_ASSET, b_idx, channel_idx).unwrap();
    let b_points = ChannelBasepoints::derive(wallet_b, TEST_ASSET, a_idx, channel_idx).unwrap();
    let setup = |peer_idx, is_outbound, my_amount, theirs: &ChannelBasepoints| ChannelSetup {
        funding: FundingDescriptor {
            outpoint,
            value: a_amount + b_amount,
            keygen: KeyGen::channel(TEST_ASSET, KeyPurpose::Fund, peer_idx, channel_idx),
            height: TEST_FUNDING_HEIGHT,
            asset: TEST_ASSET,
        },
        peer_idx,
        is_outbound,
        delay: TEST_DELAY,
        my_amount,
        fee: TEST_FEE,
        their_pubkeys: theirs.pubkeys.clone(),
        their_points: theirs.points,
        their_htlc_bases: theirs.htlc_bases,
    };
    (setup(b_idx, true, a_amount, &b_points), setup(a_idx, false, b_amount, &a_points))
}

/// Two ends of a fresh channel with the initial signatures exchanged
pub fn make_test_channel_pair(a_amount: i64, b_amount: i64) -> (Channel, Channel) {
    let wallet_a: Arc<dyn Wallet> = Arc::new(TestWallet::new(1));
    let wallet_b: Arc<dyn Wallet> = Arc::new(TestWallet::new(2));
    let (setup_a, setup_b) =
        make_channel_setups(&*wallet_a, &*wallet_b, 0, 1, 0, a_amount, b_amount);
    let mut a = Channel::from_setup(setup_a, wallet_a).unwrap();
    let mut b = Channel::from_setup(setup_b, wallet_b).unwrap();
    let sigs_a = a.sign_their_commitment(&a.state).unwrap();
    let sigs_b = b.sign_their_commitment(&b.state).unwrap();
    b.accept_initial_signatures(&sigs_a).unwrap();
    a.accept_initial_signatures(&sigs_b).unwrap();
    (a, b)
}

/// Nodes that address each other by their position
pub struct TestNetwork {
    pub nodes: Vec<TestNode>,
}

impl TestNetwork {
    pub fn new(count: usize, config: NodeConfig) -> Self {
        TestNetwork {
            nodes: (0..count).map(|i| TestNode::new(i as u8 + 1, config.clone())).collect(),
        }
    }

    pub fn channel_setups(
        &self,
        a: usize,
        b: usize,
        channel_idx: u32,
        a_amount: i64,
        b_amount: i64,
    ) -> (ChannelSetup, ChannelSetup) {
        make_channel_setups(
            &*self.nodes[a].wallet,
            &*self.nodes[b].wallet,
            a as u32,
            b as u32,
            channel_idx,
            a_amount,
            b_amount,
        )
    }

    /// Open a channel funded by `a` and exchange the initial signatures
    pub fn open_channel(
        &self,
        a: usize,
        b: usize,
        channel_idx: u32,
        a_amount: i64,
        b_amount: i64,
    ) -> ChannelId {
        let (setup_a, setup_b) = self.channel_setups(a, b, channel_idx, a_amount, b_amount);
        let (node_a, node_b) = (&self.nodes[a].node, &self.nodes[b].node);
        let id = node_a.add_channel(setup_a).unwrap();
        assert_eq!(node_b.add_channel(setup_b).unwrap(), id);
        let sigs_a = node_a.sign_counterparty_commitment(&id).unwrap();
        let sigs_b = node_b.sign_counterparty_commitment(&id).unwrap();
        node_b.accept_commitment_signatures(&id, &sigs_a).unwrap();
        node_a.accept_commitment_signatures(&id, &sigs_b).unwrap();
        id
    }

    /// Deliver `msgs` as sent by node `from`
    pub fn deliver(&self, from: usize, msgs: Vec<(u32, Message)>) -> Vec<Result<(), ChannelError>> {
        msgs.into_iter()
            .map(|(to, msg)| {
                debug!("deliver {} from {} to {}", msg.name(), from, to);
                self.nodes[to as usize].node.handle_message(from as u32, msg)
            })
            .collect()
    }

    /// Deliver what node `from` has queued
    pub fn deliver_from(&self, from: usize) -> Vec<Result<(), ChannelError>> {
        let msgs = self.nodes[from].transport.take();
        self.deliver(from, msgs)
    }

    /// Deliver until every queue is empty
    pub fn deliver_all(&self) -> Vec<Result<(), ChannelError>> {
        let mut results = Vec::new();
        loop {
            let mut delivered = false;
            for from in 0..self.nodes.len() {
                let msgs = self.nodes[from].transport.take();
                delivered |= !msgs.is_empty();
                results.extend(self.deliver(from, msgs));
            }
            if !delivered {
                return results;
            }
        }
    }

    /// Deliver until every queue is empty, asserting every message was accepted
    pub fn pump(&self) {
        for result in self.deliver_all() {
            result.unwrap();
        }
    }

    /// Deliver messages from a background thread until the returned pump is
    /// dropped
    pub fn spawn_pump(self: &Arc<Self>) -> BackgroundPump {
        let stop = Arc::new(AtomicBool::new(false));
        let net = Arc::clone(self);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !thread_stop.load(Ordering::SeqCst) {
                for result in net.deliver_all() {
                    if let Err(e) = result {
                        warn!("pump: {}", e);
                    }
                }
                thread::sleep(Duration::from_millis(2));
            }
        });
        BackgroundPump { stop, handle: Some(handle) }
    }
}

pub struct BackgroundPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for BackgroundPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let give_up = Instant::now() + timeout;
    while Instant::now() < give_up {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
