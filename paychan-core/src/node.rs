use core::fmt::{self, Debug, Formatter};
use core::time::Duration;

use anyhow::anyhow;
use itertools::Itertools;
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};
use tracing::*;

use crate::channel::{Channel, ChannelBasepoints, ChannelId, ChannelSetup, ChannelSlot, UpdateInFlight};
use crate::error::{invalid_argument_error, ChannelError};
use crate::htlc::{payment_hash_of, Preimage};
use crate::msgs::CommitmentSigs;
use crate::persist::Persist;
use crate::prelude::*;
use crate::wallet::{PeerTransport, Wallet};
use crate::Arc;

/// Limits applied to every channel of a node
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelPolicy {
    /// Smallest balance or HTLC output either party may be left with
    pub min_output: i64,
    /// Exclusive upper bound on a single HTLC or push
    pub max_send: i64,
    /// How long a handshake may stay unanswered before the channel fails
    pub channel_timeout: Duration,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        ChannelPolicy {
            min_output: 100_000,
            max_send: 1 << 30,
            channel_timeout: Duration::from_secs(60),
        }
    }
}

impl ChannelPolicy {
    /// The default policy, overridden by `PAYCHAN_MIN_OUTPUT`, `PAYCHAN_MAX_SEND`
    /// and `PAYCHAN_CHANNEL_TIMEOUT_SECS`
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> anyhow::Result<Self> {
        let mut policy = ChannelPolicy::default();
        let parse = |name: &str| -> anyhow::Result<Option<i64>> {
            match lookup(name) {
                Some(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|e| anyhow!("{}={}: {}", name, s, e)),
                None => Ok(None),
            }
        };
        if let Some(v) = parse("PAYCHAN_MIN_OUTPUT")? {
            policy.min_output = v;
        }
        if let Some(v) = parse("PAYCHAN_MAX_SEND")? {
            policy.max_send = v;
        }
        if let Some(v) = parse("PAYCHAN_CHANNEL_TIMEOUT_SECS")? {
            if v <= 0 {
                return Err(anyhow!("PAYCHAN_CHANNEL_TIMEOUT_SECS must be positive"));
            }
            policy.channel_timeout = Duration::from_secs(v as u64);
        }
        if policy.min_output < 0 || policy.max_send <= policy.min_output {
            return Err(anyhow!(
                "inconsistent policy: min_output {} max_send {}",
                policy.min_output,
                policy.max_send
            ));
        }
        Ok(policy)
    }
}

/// Node configuration
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeConfig {
    /// Channel limits
    pub policy: ChannelPolicy,
}

/// A payment routed through this node: an incoming HTLC forwarded on an
/// outgoing channel
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultihopPayment {
    /// The shared payment hash
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub payment_hash: [u8; 32],
    /// Set once the preimage is learned downstream
    #[serde_as(as = "Option<IfIsHumanReadable<Hex, Bytes>>")]
    pub preimage: Option<Preimage>,
    /// Amount forwarded
    pub amount: i64,
    /// Channel the payment came in on, if not originated here
    pub incoming: Option<ChannelId>,
    /// Channel the payment goes out on
    pub outgoing: ChannelId,
    /// The incoming HTLC was claimed
    pub succeeded: bool,
}

/// A node holding channels with peers.
///
/// Handshake entry points are in the `handshake` module, on-chain claims in
/// the `claim` module.
pub struct Node {
    pub(crate) config: NodeConfig,
    pub(crate) wallet: Arc<dyn Wallet>,
    pub(crate) persister: Arc<dyn Persist>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    channels: Mutex<OrderedMap<ChannelId, Arc<ChannelSlot>>>,
    multihops: Mutex<Map<[u8; 32], MultihopPayment>>,
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Node")
            .field("config", &self.config)
            .field("channels", &self.channel_ids())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Create a node with no channels
    pub fn new(
        config: NodeConfig,
        wallet: Arc<dyn Wallet>,
        persister: Arc<dyn Persist>,
        transport: Arc<dyn PeerTransport>,
    ) -> Node {
        Node {
            config,
            wallet,
            persister,
            transport,
            channels: Mutex::new(OrderedMap::new()),
            multihops: Mutex::new(Map::new()),
        }
    }

    /// Create a node with the channels and multihop records found in `persister`
    pub fn restore(
        config: NodeConfig,
        wallet: Arc<dyn Wallet>,
        persister: Arc<dyn Persist>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Node, ChannelError> {
        let entries = persister.list_channels()?;
        let multihops = persister.load_multihops()?;
        let node = Node::new(config, Arc::clone(&wallet), persister, transport);
        {
            let mut channels = node.channels.lock().unwrap();
            for (id, data) in entries {
                let channel = Channel::from_data(data, Arc::clone(&wallet))?;
                if channel.id != id {
                    channel_err!(Internal, "channel {} stored under {}", channel.id, id);
                }
                debug!("restored channel {}", id);
                channels.insert(id, Arc::new(ChannelSlot::new(channel)));
            }
        }
        {
            let mut records = node.multihops.lock().unwrap();
            for m in multihops {
                records.insert(m.payment_hash, m);
            }
        }
        info!("restored {} channels", node.channel_ids().len());
        Ok(node)
    }

    /// The configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Our basepoints for a new channel, to hand to the counterparty
    pub fn channel_basepoints(
        &self,
        asset: u32,
        peer_idx: u32,
        channel_idx: u32,
    ) -> Result<ChannelBasepoints, ChannelError> {
        ChannelBasepoints::derive(&*self.wallet, asset, peer_idx, channel_idx)
    }

    /// Register a new channel at state 0 and persist it
    #[instrument(skip(self))]
    pub fn add_channel(&self, setup: ChannelSetup) -> Result<ChannelId, ChannelError> {
        let channel = Channel::from_setup(setup, Arc::clone(&self.wallet))?;
        let id = channel.id;
        let mut channels = self.channels.lock().unwrap();
        if channels.contains_key(&id) {
            channel_err!(InvalidArgument, "channel {} already exists", id);
        }
        self.persister.save_channel(&id, &channel.to_data())?;
        channels.insert(id, Arc::new(ChannelSlot::new(channel)));
        info!("added channel {}", id);
        Ok(id)
    }

    /// IDs of all channels, in order
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.lock().unwrap().keys().cloned().collect_vec()
    }

    /// Get the channel slot
    pub fn get_channel(&self, id: &ChannelId) -> Result<Arc<ChannelSlot>, ChannelError> {
        let channels = self.channels.lock().unwrap();
        let slot = channels
            .get(id)
            .ok_or_else(|| invalid_argument_error(format!("no such channel: {}", id)))?;
        Ok(Arc::clone(slot))
    }

    pub(crate) fn slots(&self) -> Vec<Arc<ChannelSlot>> {
        self.channels.lock().unwrap().values().cloned().collect_vec()
    }

    /// Execute a function with an existing channel.
    ///
    /// An invalid argument error will be returned if the channel does not exist.
    pub fn with_channel<F: Sized, T>(&self, id: &ChannelId, mut f: F) -> Result<T, ChannelError>
    where
        F: FnMut(&mut Channel) -> Result<T, ChannelError>,
    {
        let slot = self.get_channel(id)?;
        let mut chan = slot.channel.lock().unwrap();
        f(&mut chan)
    }

    /// Our signatures on the counterparty's current commitment, exchanged when
    /// the channel is set up
    pub fn sign_counterparty_commitment(&self, id: &ChannelId) -> Result<CommitmentSigs, ChannelError> {
        self.with_channel(id, |chan| chan.sign_their_commitment(&chan.state))
    }

    /// Take the counterparty's signatures on our state 0 commitment
    #[instrument(skip(self, sigs))]
    pub fn accept_commitment_signatures(
        &self,
        id: &ChannelId,
        sigs: &CommitmentSigs,
    ) -> Result<(), ChannelError> {
        self.with_channel(id, |chan| {
            if chan.state.state_index != 0 {
                channel_err!(InvalidArgument, "{} already at state {}", chan.id, chan.state.state_index);
            }
            chan.accept_initial_signatures(sigs)?;
            self.persister.save_channel(&chan.id, &chan.to_data())?;
            Ok(())
        })
    }

    /// Fail a channel.  It rejects every handshake from now on and can only be
    /// closed on-chain.
    pub fn fail_channel(&self, id: &ChannelId, reason: &str) -> Result<(), ChannelError> {
        let slot = self.get_channel(id)?;
        let mut chan = slot.channel.lock().unwrap();
        self.fail_locked(&slot, &mut chan, reason);
        Ok(())
    }

    // Callers hold the channel lock
    pub(crate) fn fail_locked(&self, slot: &ChannelSlot, chan: &mut Channel, reason: &str) {
        if !chan.state.failed {
            error!("{}: failing channel: {}", chan.id, reason);
        }
        chan.state.failed = true;
        chan.update = UpdateInFlight::Withheld;
        if let Err(e) = self.persister.save_channel(&chan.id, &chan.to_data()) {
            error!("{}: could not persist failure: {:?}", chan.id, e);
        }
        slot.update_cv.notify_all();
    }

    pub(crate) fn save_channel(&self, chan: &Channel) -> Result<(), ChannelError> {
        self.persister.save_channel(&chan.id, &chan.to_data())?;
        Ok(())
    }

    // Refresh the in-memory channel from storage before mutating it
    pub(crate) fn reload_channel(&self, chan: &mut Channel) -> Result<(), ChannelError> {
        let data = self.persister.load_channel(&chan.id)?;
        chan.reload(data)
    }

    /// Record a payment forwarded from `incoming` to `outgoing`
    #[instrument(skip(self))]
    pub fn register_multihop(
        &self,
        payment_hash: [u8; 32],
        amount: i64,
        incoming: Option<ChannelId>,
        outgoing: ChannelId,
    ) -> Result<(), ChannelError> {
        let mut records = self.multihops.lock().unwrap();
        if records.contains_key(&payment_hash) {
            channel_err!(InvalidArgument, "payment {} already registered", hex::encode(payment_hash));
        }
        let record = MultihopPayment {
            payment_hash,
            preimage: None,
            amount,
            incoming,
            outgoing,
            succeeded: false,
        };
        self.persister.save_multihop(&record)?;
        records.insert(payment_hash, record);
        Ok(())
    }

    /// All multihop records, by payment hash
    pub fn multihops(&self) -> Vec<MultihopPayment> {
        self.multihops
            .lock()
            .unwrap()
            .values()
            .cloned()
            .sorted_by_key(|m| m.payment_hash)
            .collect_vec()
    }

    // Returns the record if it was waiting for this preimage
    pub(crate) fn multihop_learned(
        &self,
        preimage: &Preimage,
    ) -> Result<Option<MultihopPayment>, ChannelError> {
        let hash = payment_hash_of(preimage);
        let mut records = self.multihops.lock().unwrap();
        let record = match records.get_mut(&hash) {
            Some(r) if r.preimage.is_none() => r,
            _ => return Ok(None),
        };
        record.preimage = Some(*preimage);
        self.persister.save_multihop(record)?;
        Ok(Some(record.clone()))
    }

    pub(crate) fn multihop_succeeded(&self, payment_hash: &[u8; 32]) -> Result<(), ChannelError> {
        let mut records = self.multihops.lock().unwrap();
        if let Some(record) = records.get_mut(payment_hash) {
            if !record.succeeded {
                record.succeeded = true;
                self.persister.save_multihop(record)?;
                info!("multihop payment {} succeeded", hex::encode(payment_hash));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelErrorKind;
    use crate::util::test_utils::*;
    use test_log::test;

    #[test]
    fn policy_from_lookup_test() {
        let policy = ChannelPolicy::from_lookup(|name| match name {
            "PAYCHAN_MIN_OUTPUT" => Some("5000".to_string()),
            "PAYCHAN_CHANNEL_TIMEOUT_SECS" => Some(" 3 ".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(policy.min_output, 5000);
        assert_eq!(policy.max_send, 1 << 30);
        assert_eq!(policy.channel_timeout, Duration::from_secs(3));
        assert_eq!(ChannelPolicy::from_lookup(|_| None).unwrap(), ChannelPolicy::default());
    }

    #[test]
    fn policy_rejects_garbage_test() {
        assert!(ChannelPolicy::from_lookup(|name| {
            (name == "PAYCHAN_MAX_SEND").then(|| "lots".to_string())
        })
        .is_err());
        assert!(ChannelPolicy::from_lookup(|name| {
            (name == "PAYCHAN_MAX_SEND").then(|| "10".to_string())
        })
        .is_err());
        assert!(ChannelPolicy::from_lookup(|name| {
            (name == "PAYCHAN_CHANNEL_TIMEOUT_SECS").then(|| "0".to_string())
        })
        .is_err());
    }

    #[test]
    fn add_and_restore_test() {
        let net = TestNetwork::new(2, test_config());
        let id = net.open_channel(0, 1, 0, 700_000, 300_000);
        let node = &net.nodes[0];
        assert_eq!(node.node.channel_ids(), vec![id]);
        assert!(node.persister.contains(&id));

        let restored = Node::restore(
            test_config(),
            node.wallet.clone(),
            node.persister.clone(),
            node.transport.clone(),
        )
        .unwrap();
        assert_eq!(restored.channel_ids(), vec![id]);
        let data = restored.with_channel(&id, |c| Ok(c.to_data())).unwrap();
        assert_eq!(data, node.node.with_channel(&id, |c| Ok(c.to_data())).unwrap());
        assert!(data.state.their_sig.is_some());
    }

    #[test]
    fn duplicate_channel_rejected_test() {
        let net = TestNetwork::new(2, test_config());
        net.open_channel(0, 1, 0, 700_000, 300_000);
        let (setup, _) = net.channel_setups(0, 1, 0, 700_000, 300_000);
        let err = net.nodes[0].node.add_channel(setup).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::InvalidArgument);
    }

    #[test]
    fn unknown_channel_test() {
        let net = TestNetwork::new(1, test_config());
        let err = net.nodes[0].node.get_channel(&test_channel_id(9)).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::InvalidArgument);
    }

    #[test]
    fn multihop_records_test() {
        let net = TestNetwork::new(1, test_config());
        let node = &net.nodes[0].node;
        let preimage = [4; 16];
        let hash = payment_hash_of(&preimage);
        node.register_multihop(hash, 1000, Some(test_channel_id(1)), test_channel_id(2)).unwrap();
        assert!(node.register_multihop(hash, 1000, None, test_channel_id(2)).is_err());
        assert!(node.multihop_learned(&[5; 16]).unwrap().is_none());
        let record = node.multihop_learned(&preimage).unwrap().unwrap();
        assert_eq!(record.incoming, Some(test_channel_id(1)));
        assert!(node.multihop_learned(&preimage).unwrap().is_none());
        node.multihop_succeeded(&hash).unwrap();
        let stored = net.nodes[0].persister.multihops();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].succeeded);
        assert_eq!(stored[0].preimage, Some(preimage));
    }

    #[test]
    fn fail_channel_test() {
        let net = TestNetwork::new(2, test_config());
        let id = net.open_channel(0, 1, 0, 700_000, 300_000);
        net.nodes[0].node.fail_channel(&id, "operator request").unwrap();
        let (failed, update) =
            net.nodes[0].node.with_channel(&id, |c| Ok((c.state.failed, c.update))).unwrap();
        assert!(failed);
        assert_eq!(update, UpdateInFlight::Withheld);
        assert!(net.nodes[0].persister.load(&id).state.failed);
    }
}
