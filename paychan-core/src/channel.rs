use core::fmt;
use core::fmt::{Debug, Formatter};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::{OutPoint, ScriptBuf, Txid};
use lightning::ln::chan_utils::{derive_private_key, get_commitment_transaction_number_obscure_factor};
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::error::ChannelError;
use crate::htlc::{Htlc, Preimage, ZERO_PREIMAGE};
use crate::msgs::{
    CommitmentSigs, DeltaSig, EmptyRev, GapSigRev, HashSig, Message, PreimageSig, Rev,
    Revocation, SigRev,
};
use crate::node::ChannelPolicy;
use crate::persist::model::ChannelData;
use crate::prelude::*;
use crate::revocation::{RevocationReceiver, RevocationSender};
use crate::signer::{KeyGen, KeyPurpose};
use crate::state::ChannelState;
use crate::sync::{Condvar, Mutex};
use crate::tx::script::funding_redeemscript;
use crate::tx::{
    build_commitment_tx, build_htlc_tx, sign_input, verify_input, CommitmentKeys,
    CommitmentParams, CommitmentTx, HtlcOutputInfo,
};
use crate::util::crypto_utils::{
    derive_public_key, from_compact, point_from_secret, sha256, to_compact,
};
use crate::wallet::Wallet;
use crate::Arc;

// deferrals remembered for await_update
const MAX_DEFERRED_GENS: usize = 16;

/// Channel identifier: the funding outpoint, which both parties share
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ChannelId(pub OutPoint);

impl ChannelId {
    /// The funding outpoint
    pub fn outpoint(&self) -> OutPoint {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.0.txid, self.0.vout)
    }
}

/// The long-lived public keys of one party
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StaticPubkeys {
    /// 2-of-2 funding key
    pub fund: PublicKey,
    /// Receives this party's balance on the other party's commitment
    pub refund: PublicKey,
    /// Base of the revocation and delayed keys
    pub hakd_base: PublicKey,
}

/// The funding output of a channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundingDescriptor {
    /// The funding outpoint
    pub outpoint: OutPoint,
    /// Channel capacity
    pub value: i64,
    /// Path of our funding key.  Every other channel key is a sibling.
    pub keygen: KeyGen,
    /// Confirmation height, 0 while unconfirmed
    pub height: u32,
    /// The asset sub-ledger
    pub asset: u32,
}

/// On-chain close status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CloseData {
    /// The funding output is spent
    pub closed: bool,
    /// Height of the close transaction
    pub close_height: u32,
    /// The close transaction
    pub close_txid: Option<Txid>,
}

/// The terms of a new channel, as agreed with the counterparty
#[derive(Clone, Debug)]
pub struct ChannelSetup {
    /// The funding output
    pub funding: FundingDescriptor,
    /// The counterparty
    pub peer_idx: u32,
    /// We opened the channel
    pub is_outbound: bool,
    /// CSV delay on broadcaster outputs
    pub delay: u16,
    /// Our initial balance
    pub my_amount: i64,
    /// Fee taken from each balance output and each second-stage transaction
    pub fee: i64,
    /// The counterparty's static keys
    pub their_pubkeys: StaticPubkeys,
    /// Counterparty points of states 0, 1 and 2
    pub their_points: [PublicKey; 3],
    /// Counterparty HTLC bases of slots 0 and 1
    pub their_htlc_bases: [PublicKey; 2],
}

/// What a party hands over so that the other can set up the channel
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelBasepoints {
    /// Static keys
    pub pubkeys: StaticPubkeys,
    /// Points of states 0, 1 and 2
    pub points: [PublicKey; 3],
    /// HTLC bases of slots 0 and 1
    pub htlc_bases: [PublicKey; 2],
}

impl ChannelBasepoints {
    /// Derive our basepoints for a channel with `peer_idx`
    pub fn derive(
        wallet: &dyn Wallet,
        asset: u32,
        peer_idx: u32,
        channel_idx: u32,
    ) -> Result<Self, ChannelError> {
        let secp_ctx = Secp256k1::new();
        let keygen = KeyGen::channel(asset, KeyPurpose::Fund, peer_idx, channel_idx);
        let (pubkeys, sender) = derive_my_keys(wallet, &secp_ctx, &keygen)?;
        let htlc_base = |idx| -> Result<PublicKey, ChannelError> {
            let secret = wallet.derive_private_key(&KeyGen::htlc(asset, idx, channel_idx))?;
            Ok(PublicKey::from_secret_key(&secp_ctx, &secret))
        };
        Ok(ChannelBasepoints {
            pubkeys,
            points: [
                sender.point(&secp_ctx, 0)?,
                sender.point(&secp_ctx, 1)?,
                sender.point(&secp_ctx, 2)?,
            ],
            htlc_bases: [htlc_base(0)?, htlc_base(1)?],
        })
    }
}

/// Who holds the update token of a channel
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UpdateInFlight {
    /// Nobody, a handshake may start
    Idle,
    /// Our proposal awaits the counterparty's answer
    Proposing {
        /// When the proposal times out
        deadline: Instant,
    },
    /// We answered a counterparty proposal and await its revocation
    Responding {
        /// When the answer times out
        deadline: Instant,
    },
    /// The channel failed, the token is never returned
    Withheld,
}

/// A proposed state change, as carried by `HashSig`, `PreimageSig` or `DeltaSig`
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Proposal {
    Htlc { amount: i64, payment_hash: [u8; 32], locktime: u32 },
    Clear { idx: u32, preimage: Preimage },
    Push { amount: i64 },
}

impl Proposal {
    /// Split a proposal message into the change, the signatures and the payload
    pub(crate) fn from_message(msg: &Message) -> Option<(Proposal, &CommitmentSigs, [u8; 32])> {
        match msg {
            Message::HashSig(m) => Some((
                Proposal::Htlc {
                    amount: m.amount,
                    payment_hash: m.payment_hash,
                    locktime: m.locktime,
                },
                &m.sigs,
                m.data,
            )),
            Message::PreimageSig(m) => {
                Some((Proposal::Clear { idx: m.idx, preimage: m.preimage }, &m.sigs, m.data))
            }
            Message::DeltaSig(m) => Some((Proposal::Push { amount: m.amount }, &m.sigs, m.data)),
            _ => None,
        }
    }

    fn to_message(&self, outpoint: OutPoint, sigs: CommitmentSigs, data: [u8; 32]) -> Message {
        match *self {
            Proposal::Htlc { amount, payment_hash, locktime } => Message::HashSig(HashSig {
                channel_outpoint: outpoint,
                amount,
                payment_hash,
                locktime,
                sigs,
                data,
            }),
            Proposal::Clear { idx, preimage } => Message::PreimageSig(PreimageSig {
                channel_outpoint: outpoint,
                idx,
                preimage,
                sigs,
                data,
            }),
            Proposal::Push { amount } => {
                Message::DeltaSig(DeltaSig { channel_outpoint: outpoint, amount, sigs, data })
            }
        }
    }
}

/// Our static keys and revocation sender, derived from the funding key path
pub(crate) fn derive_my_keys(
    wallet: &dyn Wallet,
    secp_ctx: &Secp256k1<All>,
    fund_keygen: &KeyGen,
) -> Result<(StaticPubkeys, RevocationSender), ChannelError> {
    let pubkey = |purpose| -> Result<PublicKey, ChannelError> {
        let secret = wallet.derive_private_key(&fund_keygen.with_purpose(purpose))?;
        Ok(PublicKey::from_secret_key(secp_ctx, &secret))
    };
    let pubkeys = StaticPubkeys {
        fund: pubkey(KeyPurpose::Fund)?,
        refund: pubkey(KeyPurpose::Refund)?,
        hakd_base: pubkey(KeyPurpose::Hakd)?,
    };
    let root = wallet.derive_private_key(&fund_keygen.with_purpose(KeyPurpose::Revocation))?;
    Ok((pubkeys, RevocationSender::new(sha256(&root.secret_bytes()))))
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// A payment channel
pub struct Channel {
    /// The channel ID
    pub id: ChannelId,
    /// The funding output
    pub funding: FundingDescriptor,
    /// The counterparty
    pub peer_idx: u32,
    /// We opened the channel
    pub is_outbound: bool,
    /// CSV delay on broadcaster outputs
    pub delay: u16,
    /// Our static keys
    pub my_pubkeys: StaticPubkeys,
    /// The counterparty's static keys
    pub their_pubkeys: StaticPubkeys,
    sender: RevocationSender,
    /// Revocation secrets received from the counterparty
    pub their_revocations: RevocationReceiver,
    /// The ledger
    pub state: ChannelState,
    /// Close status
    pub close_data: CloseData,
    /// The update token
    pub update: UpdateInFlight,
    /// Bumped each time a handshake completes or is deferred
    pub update_gen: u64,
    /// Generations whose proposal the counterparty deferred, newest last
    pub(crate) deferred_gens: Vec<u64>,
    /// Unix time of the last committed update
    pub last_update: u64,
    wallet: Arc<dyn Wallet>,
    secp_ctx: Secp256k1<All>,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer_idx", &self.peer_idx)
            .field("is_outbound", &self.is_outbound)
            .field("state", &self.state)
            .field("close_data", &self.close_data)
            .field("update", &self.update)
            .field("update_gen", &self.update_gen)
            .finish_non_exhaustive()
    }
}

/// A channel with the condition variable its update token waiters block on
pub struct ChannelSlot {
    /// The channel lock
    pub channel: Mutex<Channel>,
    /// Signalled whenever the token changes hands or a handshake completes
    pub update_cv: Condvar,
}

impl fmt::Debug for ChannelSlot {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ChannelSlot").finish_non_exhaustive()
    }
}

impl ChannelSlot {
    pub(crate) fn new(channel: Channel) -> Self {
        ChannelSlot { channel: Mutex::new(channel), update_cv: Condvar::new() }
    }
}

impl Channel {
    /// Create a channel at state 0
    pub fn from_setup(setup: ChannelSetup, wallet: Arc<dyn Wallet>) -> Result<Self, ChannelError> {
        if setup.my_amount < 0 || setup.my_amount > setup.funding.value {
            channel_err!(
                InvalidArgument,
                "balance {} outside capacity {}",
                setup.my_amount,
                setup.funding.value
            );
        }
        if setup.fee < 0 || setup.delay == 0 {
            channel_err!(InvalidArgument, "fee {} delay {}", setup.fee, setup.delay);
        }
        let secp_ctx = Secp256k1::new();
        let (my_pubkeys, sender) = derive_my_keys(&*wallet, &secp_ctx, &setup.funding.keygen)?;
        let asset = setup.funding.asset;
        let channel_idx = setup.funding.keygen.channel_idx();
        let my_base = |idx| -> Result<PublicKey, ChannelError> {
            let secret = wallet.derive_private_key(&KeyGen::htlc(asset, idx, channel_idx))?;
            Ok(PublicKey::from_secret_key(&secp_ctx, &secret))
        };
        let state = ChannelState {
            state_index: 0,
            my_amount: setup.my_amount,
            fee: setup.fee,
            delta: 0,
            htlc_idx: 0,
            htlcs: Vec::new(),
            in_progress_htlc: None,
            colliding_htlc: None,
            colliding_hash_delta: false,
            colliding_hash_preimage: false,
            colliding_preimage_delta: false,
            colliding_preimages: false,
            collision: 0,
            elk_point: setup.their_points[0],
            next_elk_point: setup.their_points[1],
            next2_elk_point: setup.their_points[2],
            my_next_htlc_base: my_base(0)?,
            my_next2_htlc_base: my_base(1)?,
            next_htlc_base: setup.their_htlc_bases[0],
            next2_htlc_base: setup.their_htlc_bases[1],
            their_sig: None,
            failed: false,
            data: [0; 32],
        };
        Ok(Channel {
            id: ChannelId(setup.funding.outpoint),
            funding: setup.funding,
            peer_idx: setup.peer_idx,
            is_outbound: setup.is_outbound,
            delay: setup.delay,
            my_pubkeys,
            their_pubkeys: setup.their_pubkeys,
            sender,
            their_revocations: RevocationReceiver::new(),
            state,
            close_data: CloseData::default(),
            update: UpdateInFlight::Idle,
            update_gen: 0,
            deferred_gens: Vec::new(),
            last_update: now_secs(),
            wallet,
            secp_ctx,
        })
    }

    /// Restore a channel from its persisted envelope
    pub fn from_data(data: ChannelData, wallet: Arc<dyn Wallet>) -> Result<Self, ChannelError> {
        let secp_ctx = Secp256k1::new();
        let (my_pubkeys, sender) = derive_my_keys(&*wallet, &secp_ctx, &data.funding.keygen)?;
        let update =
            if data.state.failed { UpdateInFlight::Withheld } else { UpdateInFlight::Idle };
        Ok(Channel {
            id: ChannelId(data.funding.outpoint),
            funding: data.funding,
            peer_idx: data.peer_idx,
            is_outbound: data.is_outbound,
            delay: data.delay,
            my_pubkeys,
            their_pubkeys: data.their_pubkeys,
            sender,
            their_revocations: data.their_revocations,
            state: data.state,
            close_data: data.close_data,
            update,
            update_gen: 0,
            deferred_gens: Vec::new(),
            last_update: data.last_update,
            wallet,
            secp_ctx,
        })
    }

    /// The persisted envelope
    pub fn to_data(&self) -> ChannelData {
        ChannelData {
            funding: self.funding.clone(),
            peer_idx: self.peer_idx,
            is_outbound: self.is_outbound,
            delay: self.delay,
            close_data: self.close_data.clone(),
            their_pubkeys: self.their_pubkeys.clone(),
            their_revocations: self.their_revocations.clone(),
            state: self.state.clone(),
            last_update: self.last_update,
        }
    }

    /// Replace the mutable parts with a freshly loaded envelope.  A failure
    /// recorded in memory survives the reload.
    pub(crate) fn reload(&mut self, data: ChannelData) -> Result<(), ChannelError> {
        if data.funding.outpoint != self.funding.outpoint {
            channel_err!(
                Internal,
                "loaded {} for {}",
                ChannelId(data.funding.outpoint),
                self.id
            );
        }
        let failed = self.state.failed;
        self.their_revocations = data.their_revocations;
        self.state = data.state;
        self.state.failed |= failed;
        self.close_data = data.close_data;
        self.last_update = data.last_update;
        Ok(())
    }

    /// The asset sub-ledger
    pub fn asset(&self) -> u32 {
        self.funding.asset
    }

    /// Channel capacity
    pub fn capacity(&self) -> i64 {
        self.funding.value
    }

    /// The channel index of our key paths
    pub fn channel_idx(&self) -> u32 {
        self.funding.keygen.channel_idx()
    }

    pub(crate) fn secp_ctx(&self) -> &Secp256k1<All> {
        &self.secp_ctx
    }

    pub(crate) fn wallet(&self) -> &dyn Wallet {
        &*self.wallet
    }

    pub(crate) fn my_secret(&self, purpose: KeyPurpose) -> Result<SecretKey, ChannelError> {
        self.wallet.derive_private_key(&self.funding.keygen.with_purpose(purpose))
    }

    /// Our HTLC base for slot `idx`
    pub(crate) fn my_htlc_base(&self, idx: u32) -> Result<PublicKey, ChannelError> {
        let keygen = KeyGen::htlc(self.asset(), idx, self.channel_idx());
        let secret = self.wallet.derive_private_key(&keygen)?;
        Ok(PublicKey::from_secret_key(&self.secp_ctx, &secret))
    }

    /// Our HTLC key for `htlc` on the commitment using `per_commitment_point`
    pub(crate) fn htlc_secret(
        &self,
        htlc: &Htlc,
        per_commitment_point: &PublicKey,
    ) -> Result<SecretKey, ChannelError> {
        let base = self.wallet.derive_private_key(&htlc.keygen)?;
        Ok(derive_private_key(&self.secp_ctx, per_commitment_point, &base))
    }

    /// Our point for state `idx`
    pub fn my_point(&self, idx: u64) -> Result<PublicKey, ChannelError> {
        self.sender.point(&self.secp_ctx, idx)
    }

    /// The counterparty point for state `idx`, among the three it has announced
    /// beyond its last revocation
    pub fn their_point(&self, state: &ChannelState, idx: u64) -> Result<PublicKey, ChannelError> {
        let base = self.their_revocations.next_index();
        match idx.checked_sub(base) {
            Some(0) => Ok(state.elk_point),
            Some(1) => Ok(state.next_elk_point),
            Some(2) => Ok(state.next2_elk_point),
            _ => channel_err!(Internal, "no point for state {}, next revocation {}", idx, base),
        }
    }

    /// The 2-of-2 funding script
    pub fn funding_script(&self) -> ScriptBuf {
        funding_redeemscript(&self.my_pubkeys.fund, &self.their_pubkeys.fund)
    }

    fn obscure_factor(&self) -> u64 {
        get_commitment_transaction_number_obscure_factor(
            &self.my_pubkeys.refund,
            &self.their_pubkeys.refund,
            self.is_outbound,
        )
    }

    /// Build our commitment (`mine`) or the counterparty's for `state`
    pub(crate) fn build_commitment(
        &self,
        state: &ChannelState,
        mine: bool,
    ) -> Result<(CommitmentTx, CommitmentKeys), ChannelError> {
        let point = if mine {
            self.my_point(state.state_index)?
        } else {
            self.their_point(state, state.state_index)?
        };
        let (owner, other) = if mine {
            (&self.my_pubkeys, &self.their_pubkeys)
        } else {
            (&self.their_pubkeys, &self.my_pubkeys)
        };
        let keys =
            CommitmentKeys::new(&self.secp_ctx, &point, &owner.hakd_base, &other.hakd_base, &other.refund);
        let (my_amount, their_amount) = state.balances(self.capacity());
        let (broadcaster_amount, countersignatory_amount) =
            if mine { (my_amount, their_amount) } else { (their_amount, my_amount) };

        let mut htlcs = Vec::new();
        for h in state.live_htlcs() {
            let (owner_base, other_base) =
                if mine { (&h.my_htlc_base, &h.their_htlc_base) } else { (&h.their_htlc_base, &h.my_htlc_base) };
            htlcs.push(HtlcOutputInfo {
                idx: h.idx,
                offered: mine != h.incoming,
                amount: h.amount,
                payment_hash: h.payment_hash,
                locktime: h.locktime,
                broadcaster_key: derive_public_key(&self.secp_ctx, &point, owner_base)?,
                countersignatory_key: derive_public_key(&self.secp_ctx, &point, other_base)?,
            });
        }
        let params = CommitmentParams {
            funding_outpoint: self.funding.outpoint,
            obscured_state_index: state.state_index ^ self.obscure_factor(),
            delay: self.delay,
            broadcaster_amount,
            countersignatory_amount,
            fee: state.fee,
        };
        Ok((build_commitment_tx(&params, &keys, &htlcs), keys))
    }

    /// Sign the counterparty's commitment for `state` and its second-stage
    /// HTLC transactions
    pub(crate) fn sign_their_commitment(
        &self,
        state: &ChannelState,
    ) -> Result<CommitmentSigs, ChannelError> {
        let (ctx, keys) = self.build_commitment(state, false)?;
        let fund_key = self.my_secret(KeyPurpose::Fund)?;
        let sig = sign_input(
            &self.secp_ctx,
            &ctx.tx,
            0,
            &self.funding_script(),
            self.capacity(),
            &fund_key,
        )?;
        let txid = ctx.tx.compute_txid();
        let mut htlc_sigs = Vec::new();
        for h in state.live_htlcs() {
            let (vout, info, script) = ctx
                .htlc_output(h.idx)
                .ok_or_else(|| channel_error!(Internal, "htlc {} has no output", h.idx))?;
            let htlc_tx = build_htlc_tx(txid, *vout, info, &keys, self.delay, state.fee);
            let key = self.htlc_secret(h, &keys.per_commitment_point)?;
            let sig = sign_input(&self.secp_ctx, &htlc_tx, 0, script, h.amount, &key)?;
            htlc_sigs.push(to_compact(&sig));
        }
        Ok(CommitmentSigs { commitment_sig: to_compact(&sig), htlc_sigs })
    }

    /// Check the counterparty's signatures on our commitment for `state`, and
    /// store them in it
    pub(crate) fn verify_my_commitment(
        &self,
        state: &mut ChannelState,
        sigs: &CommitmentSigs,
    ) -> Result<(), ChannelError> {
        let (ctx, keys) = self.build_commitment(state, true)?;
        let sig = from_compact(&sigs.commitment_sig)
            .map_err(|_| channel_error!(Protocol, "malformed commitment signature"))?;
        verify_input(
            &self.secp_ctx,
            &ctx.tx,
            0,
            &self.funding_script(),
            self.capacity(),
            &sig,
            &self.their_pubkeys.fund,
        )?;
        let live: Vec<u32> = state.live_htlcs().iter().map(|h| h.idx).collect();
        if live.len() != sigs.htlc_sigs.len() {
            channel_err!(
                Protocol,
                "{} htlc signatures for {} htlcs at state {}",
                sigs.htlc_sigs.len(),
                live.len(),
                state.state_index
            );
        }
        let txid = ctx.tx.compute_txid();
        for (idx, compact) in live.into_iter().zip(sigs.htlc_sigs.iter()) {
            let (vout, info, script) = ctx
                .htlc_output(idx)
                .ok_or_else(|| channel_error!(Internal, "htlc {} has no output", idx))?;
            let htlc_tx = build_htlc_tx(txid, *vout, info, &keys, self.delay, state.fee);
            let sig = from_compact(compact)
                .map_err(|_| channel_error!(Protocol, "malformed htlc {} signature", idx))?;
            verify_input(
                &self.secp_ctx,
                &htlc_tx,
                0,
                script,
                info.amount,
                &sig,
                &info.countersignatory_key,
            )?;
            if let Some(h) = state.live_htlc_mut(idx) {
                h.sig = *compact;
            }
        }
        state.their_sig = Some(sigs.commitment_sig);
        Ok(())
    }

    /// The revocation of our state `revoked`, with what the counterparty needs
    /// for the next states
    pub(crate) fn revocation_for(&self, revoked: u64) -> Result<Revocation, ChannelError> {
        let htlc_idx = self.state.htlc_idx_after_commit();
        Ok(Revocation {
            revoked_index: revoked,
            secret: self.sender.at(revoked),
            next_point: self.my_point(revoked + 2)?,
            next2_point: self.my_point(revoked + 3)?,
            next_htlc_base: self.my_htlc_base(htlc_idx)?,
            next2_htlc_base: self.my_htlc_base(htlc_idx + 1)?,
        })
    }

    /// Take in a counterparty revocation.
    ///
    /// Returns false, changing nothing, if it was already received.
    pub(crate) fn ingest_revocation(&mut self, rev: &Revocation) -> Result<bool, ChannelError> {
        let next = self.their_revocations.next_index();
        if rev.revoked_index < next {
            debug!("{}: ignoring replayed revocation of {}", self.id, rev.revoked_index);
            return Ok(false);
        }
        if rev.revoked_index != next {
            channel_err!(Protocol, "revocation of {}, expected {}", rev.revoked_index, next);
        }
        let point = point_from_secret(&self.secp_ctx, &rev.secret)
            .map_err(|_| channel_error!(Protocol, "malformed secret for {}", rev.revoked_index))?;
        if point != self.state.elk_point {
            channel_err!(Protocol, "secret for {} does not match its point", rev.revoked_index);
        }
        if rev.next_point != self.state.next2_elk_point {
            channel_err!(Protocol, "point for {} changed", rev.revoked_index + 2);
        }
        self.their_revocations.insert(rev.revoked_index, rev.secret)?;
        self.state.elk_point = self.state.next_elk_point;
        self.state.next_elk_point = rev.next_point;
        self.state.next2_elk_point = rev.next2_point;
        self.state.next_htlc_base = rev.next_htlc_base;
        self.state.next2_htlc_base = rev.next2_htlc_base;
        Ok(true)
    }

    /// Fold the pending proposals into the ledger and move our HTLC bases along
    pub(crate) fn commit_pending(&mut self) -> Result<(), ChannelError> {
        self.state.commit_pending();
        self.state.my_next_htlc_base = self.my_htlc_base(self.state.htlc_idx)?;
        self.state.my_next2_htlc_base = self.my_htlc_base(self.state.htlc_idx + 1)?;
        self.last_update = now_secs();
        Ok(())
    }

    fn new_htlc(
        &self,
        state: &ChannelState,
        idx: u32,
        incoming: bool,
        amount: i64,
        payment_hash: [u8; 32],
        locktime: u32,
    ) -> Htlc {
        Htlc::new(
            idx,
            incoming,
            amount,
            payment_hash,
            locktime,
            state.next_htlc_base,
            state.my_next_htlc_base,
            KeyGen::htlc(self.asset(), idx, self.channel_idx()),
        )
    }

    // Move an HTLC that lost the tie-break to the following slot
    fn defer_htlc(&self, state: &ChannelState, mut htlc: Htlc) -> Htlc {
        htlc.idx += 1;
        htlc.their_htlc_base = state.next2_htlc_base;
        htlc.my_htlc_base = state.my_next2_htlc_base;
        htlc.keygen = KeyGen::htlc(self.asset(), htlc.idx, self.channel_idx());
        htlc
    }

    fn propose(
        &mut self,
        proposal: Proposal,
        mut next: ChannelState,
        data: [u8; 32],
        deadline: Instant,
    ) -> Result<Message, ChannelError> {
        next.state_index += 1;
        next.data = data;
        let sigs = self.sign_their_commitment(&next)?;
        self.state = next;
        self.update = UpdateInFlight::Proposing { deadline };
        Ok(proposal.to_message(self.funding.outpoint, sigs, data))
    }

    /// Offer an HTLC at the next slot
    pub(crate) fn propose_htlc(
        &mut self,
        amount: i64,
        payment_hash: [u8; 32],
        locktime: u32,
        data: [u8; 32],
        deadline: Instant,
    ) -> Result<Message, ChannelError> {
        let mut next = self.state.clone();
        let htlc =
            self.new_htlc(&next, next.htlc_idx, false, amount, payment_hash, locktime);
        next.in_progress_htlc = Some(htlc);
        next.my_amount -= amount;
        self.propose(Proposal::Htlc { amount, payment_hash, locktime }, next, data, deadline)
    }

    /// Resolve committed HTLC `idx`
    pub(crate) fn propose_clear(
        &mut self,
        idx: u32,
        preimage: Preimage,
        data: [u8; 32],
        deadline: Instant,
    ) -> Result<Message, ChannelError> {
        let mut next = self.state.clone();
        next.apply_clear(idx, preimage);
        self.propose(Proposal::Clear { idx, preimage }, next, data, deadline)
    }

    /// Push `amount` to the counterparty
    pub(crate) fn propose_push(
        &mut self,
        amount: i64,
        data: [u8; 32],
        deadline: Instant,
    ) -> Result<Message, ChannelError> {
        let mut next = self.state.clone();
        next.delta = -amount;
        next.my_amount -= amount;
        self.propose(Proposal::Push { amount }, next, data, deadline)
    }

    // Apply a counterparty proposal to a state with no proposal of ours, checking
    // it as we go
    fn apply_their_proposal(
        &self,
        state: &mut ChannelState,
        proposal: &Proposal,
        policy: &ChannelPolicy,
        height: u32,
    ) -> Result<(), ChannelError> {
        match *proposal {
            Proposal::Htlc { amount, payment_hash, locktime } => {
                if amount < policy.min_output {
                    channel_err!(Protocol, "htlc amount {} below minimum", amount);
                }
                let htlc = self.new_htlc(state, state.htlc_idx, true, amount, payment_hash, locktime);
                state.in_progress_htlc = Some(htlc);
            }
            Proposal::Clear { idx, preimage } => {
                let h = match state.htlcs.get(idx as usize) {
                    Some(h) => h,
                    None => channel_err!(Protocol, "htlc {} out of range", idx),
                };
                if h.cleared || h.clearing {
                    channel_err!(Protocol, "htlc {} already cleared", idx);
                }
                if preimage == ZERO_PREIMAGE {
                    if !h.incoming {
                        channel_err!(Protocol, "timeout of our own htlc {}", idx);
                    }
                    if h.locktime > height {
                        channel_err!(Protocol, "htlc {} locktime {} not reached at {}", idx, h.locktime, height);
                    }
                } else {
                    if h.incoming {
                        channel_err!(Protocol, "preimage for their own htlc {}", idx);
                    }
                    if !h.preimage_matches(&preimage) {
                        channel_err!(Protocol, "preimage does not match htlc {}", idx);
                    }
                }
                state.apply_clear(idx, preimage);
            }
            Proposal::Push { amount } => {
                if amount <= 0 {
                    channel_err!(Protocol, "push of {}", amount);
                }
                state.delta = amount;
                state.my_amount += amount;
            }
        }
        let their_amount = state.their_amount(self.capacity());
        if their_amount - state.fee < policy.min_output {
            channel_err!(Protocol, "counterparty balance {} below minimum", their_amount);
        }
        state.state_index += 1;
        Ok(())
    }

    // Fold a colliding counterparty proposal into our pending state, recording
    // the collision class
    fn merge_their_proposal(
        &self,
        gap: &mut ChannelState,
        proposal: &Proposal,
    ) -> Result<(), ChannelError> {
        let clearing_idx = gap.htlcs.iter().find(|h| h.clearing && !h.cleared).map(|h| h.idx);
        match *proposal {
            Proposal::Htlc { amount, payment_hash, locktime } => {
                let theirs = self.new_htlc(gap, gap.htlc_idx, true, amount, payment_hash, locktime);
                if let Some(mine) = gap.in_progress_htlc.take() {
                    let mine_wins =
                        gap.my_next_htlc_base.serialize()[..] > gap.next_htlc_base.serialize()[..];
                    debug!("{}: htlc collision, ours wins: {}", self.id, mine_wins);
                    let (kept, deferred) = if mine_wins { (mine, theirs) } else { (theirs, mine) };
                    gap.colliding_htlc = Some(self.defer_htlc(gap, deferred));
                    gap.in_progress_htlc = Some(kept);
                } else if clearing_idx.is_some() {
                    gap.colliding_hash_preimage = true;
                    gap.in_progress_htlc = Some(theirs);
                } else if gap.delta < 0 {
                    gap.colliding_hash_delta = true;
                    gap.in_progress_htlc = Some(theirs);
                } else {
                    channel_err!(Internal, "collision with no proposal of ours");
                }
            }
            Proposal::Clear { idx, preimage } => {
                if gap.in_progress_htlc.is_some() {
                    gap.colliding_hash_preimage = true;
                } else if let Some(mine) = clearing_idx {
                    if mine == idx {
                        channel_err!(Protocol, "both sides clearing htlc {}", idx);
                    }
                    gap.colliding_preimages = true;
                } else if gap.delta < 0 {
                    gap.colliding_preimage_delta = true;
                } else {
                    channel_err!(Internal, "collision with no proposal of ours");
                }
                gap.apply_clear(idx, preimage);
            }
            Proposal::Push { amount } => {
                if gap.in_progress_htlc.is_some() {
                    gap.colliding_hash_delta = true;
                } else if clearing_idx.is_some() {
                    gap.colliding_preimage_delta = true;
                } else if gap.delta < 0 {
                    gap.collision = 1;
                } else {
                    channel_err!(Internal, "collision with no proposal of ours");
                }
                gap.delta += amount;
                gap.my_amount += amount;
            }
        }
        Ok(())
    }

    /// Handle a counterparty proposal.
    ///
    /// Answers `SigRev` when idle, `GapSigRev` when our own proposal is
    /// outstanding, and `EmptyRev` when the proposal has to be deferred.
    pub(crate) fn receive_proposal(
        &mut self,
        proposal: &Proposal,
        sigs: &CommitmentSigs,
        data: [u8; 32],
        policy: &ChannelPolicy,
        height: u32,
        deadline: Instant,
    ) -> Result<Message, ChannelError> {
        if let Proposal::Clear { .. } = proposal {
            if self.state.delta > 0 {
                info!("{}: clear during push with delta {}, deferring", self.id, self.state.delta);
                return Ok(self.empty_rev());
            }
        }
        match self.update {
            UpdateInFlight::Idle => {
                if !self.state.is_at_rest() {
                    channel_err!(Protocol, "idle channel not at rest");
                }
                self.respond(proposal, sigs, data, policy, height, deadline)
            }
            UpdateInFlight::Proposing { .. } => {
                if self.state.has_collision() {
                    channel_err!(Protocol, "third proposal during a collision");
                }
                self.respond_collision(proposal, sigs, data, policy, height)
            }
            UpdateInFlight::Responding { .. } | UpdateInFlight::Withheld => {
                channel_err!(Protocol, "proposal while {:?}", self.update)
            }
        }
    }

    fn empty_rev(&self) -> Message {
        Message::EmptyRev(EmptyRev {
            channel_outpoint: self.funding.outpoint,
            state_index: self.state.state_index,
        })
    }

    fn respond(
        &mut self,
        proposal: &Proposal,
        sigs: &CommitmentSigs,
        data: [u8; 32],
        policy: &ChannelPolicy,
        height: u32,
        deadline: Instant,
    ) -> Result<Message, ChannelError> {
        let mut next = self.state.clone();
        self.apply_their_proposal(&mut next, proposal, policy, height)?;
        next.data = data;
        self.verify_my_commitment(&mut next, sigs)?;
        let my_sigs = self.sign_their_commitment(&next)?;
        let revoked = self.state.state_index;
        self.state = next;
        let revocation = self.revocation_for(revoked)?;
        self.update = UpdateInFlight::Responding { deadline };
        Ok(Message::SigRev(SigRev { channel_outpoint: self.funding.outpoint, sigs: my_sigs, revocation }))
    }

    fn respond_collision(
        &mut self,
        proposal: &Proposal,
        sigs: &CommitmentSigs,
        data: [u8; 32],
        policy: &ChannelPolicy,
        height: u32,
    ) -> Result<Message, ChannelError> {
        // their signatures cover our base state plus their proposal only
        let mut scratch = self.state.base_view();
        self.apply_their_proposal(&mut scratch, proposal, policy, height)?;
        self.verify_my_commitment(&mut scratch, sigs)?;

        let mut gap = self.state.clone();
        self.merge_their_proposal(&mut gap, proposal)?;
        gap.state_index += 1;
        gap.data = data;
        let my_sigs = self.sign_their_commitment(&gap)?;
        let revoked = gap.state_index - 2;
        self.state = gap;
        let revocation = self.revocation_for(revoked)?;
        info!("{}: collision, gap state {}", self.id, self.state.state_index);
        Ok(Message::GapSigRev(GapSigRev {
            channel_outpoint: self.funding.outpoint,
            sigs: my_sigs,
            revocation,
        }))
    }

    /// Complete our proposal with the counterparty's signatures and revocation.
    ///
    /// Returns the `Rev` to send, or `None` for a replay.
    pub(crate) fn receive_sig_rev(&mut self, msg: &SigRev) -> Result<Option<Message>, ChannelError> {
        if msg.revocation.revoked_index < self.their_revocations.next_index() {
            debug!("{}: ignoring replayed SigRev", self.id);
            return Ok(None);
        }
        if !matches!(self.update, UpdateInFlight::Proposing { .. }) || self.state.has_collision() {
            channel_err!(Protocol, "SigRev while {:?}", self.update);
        }
        let mut next = self.state.clone();
        self.verify_my_commitment(&mut next, &msg.sigs)?;
        self.state = next;
        self.ingest_revocation(&msg.revocation)?;
        self.commit_pending()?;
        let revocation = self.revocation_for(self.state.state_index - 1)?;
        self.update = UpdateInFlight::Idle;
        self.update_gen += 1;
        Ok(Some(Message::Rev(Rev { channel_outpoint: self.funding.outpoint, revocation })))
    }

    /// Take the counterparty's signatures on the gap state.
    ///
    /// Returns the `Rev` of our base state's successor, or `None` for a replay.
    pub(crate) fn receive_gap_sig_rev(
        &mut self,
        msg: &GapSigRev,
    ) -> Result<Option<Message>, ChannelError> {
        if msg.revocation.revoked_index < self.their_revocations.next_index() {
            debug!("{}: ignoring replayed GapSigRev", self.id);
            return Ok(None);
        }
        if !matches!(self.update, UpdateInFlight::Proposing { .. }) || !self.state.has_collision() {
            channel_err!(Protocol, "GapSigRev while {:?}", self.update);
        }
        let mut next = self.state.clone();
        self.verify_my_commitment(&mut next, &msg.sigs)?;
        self.state = next;
        self.ingest_revocation(&msg.revocation)?;
        let revocation = self.revocation_for(self.state.state_index - 1)?;
        Ok(Some(Message::Rev(Rev { channel_outpoint: self.funding.outpoint, revocation })))
    }

    /// Take the revocation completing a handshake.
    ///
    /// Returns false for a replay.
    pub(crate) fn receive_rev(&mut self, msg: &Rev) -> Result<bool, ChannelError> {
        if msg.revocation.revoked_index < self.their_revocations.next_index() {
            debug!("{}: ignoring replayed Rev", self.id);
            return Ok(false);
        }
        let expected = match self.update {
            UpdateInFlight::Responding { .. } => true,
            UpdateInFlight::Proposing { .. } =>
                self.state.has_collision()
                    && self.their_revocations.next_index() + 1 == self.state.state_index,
            _ => false,
        };
        if !expected {
            channel_err!(Protocol, "Rev while {:?}", self.update);
        }
        self.ingest_revocation(&msg.revocation)?;
        self.commit_pending()?;
        self.update = UpdateInFlight::Idle;
        self.update_gen += 1;
        Ok(true)
    }

    /// Whether the proposal started at generation `gen` was deferred
    pub(crate) fn was_deferred(&self, gen: u64) -> bool {
        self.deferred_gens.contains(&gen)
    }

    /// Roll our outstanding proposal back after the counterparty deferred it.
    ///
    /// The token goes back to idle, so a retry does not wait for the proposer
    /// to notice the deferral.
    ///
    /// Returns false if there was nothing to roll back.
    pub(crate) fn receive_empty_rev(&mut self, msg: &EmptyRev) -> bool {
        if !matches!(self.update, UpdateInFlight::Proposing { .. }) || self.state.has_collision() {
            warn!("{}: ignoring EmptyRev at {} while {:?}", self.id, msg.state_index, self.update);
            return false;
        }
        self.state = self.state.base_view();
        self.update = UpdateInFlight::Idle;
        if self.deferred_gens.len() == MAX_DEFERRED_GENS {
            self.deferred_gens.remove(0);
        }
        self.deferred_gens.push(self.update_gen);
        self.update_gen += 1;
        true
    }

    /// Verify the counterparty's signatures on our current commitment, as
    /// exchanged when the channel is set up
    pub(crate) fn accept_initial_signatures(&mut self, sigs: &CommitmentSigs) -> Result<(), ChannelError> {
        let mut state = self.state.clone();
        self.verify_my_commitment(&mut state, sigs)?;
        self.state = state;
        Ok(())
    }
}
