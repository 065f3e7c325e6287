//! Closing a channel unilaterally and claiming its HTLCs on chain.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use tracing::*;

use crate::channel::{Channel, ChannelId, UpdateInFlight};
use crate::error::ChannelError;
use crate::htlc::{payment_hash_of, Htlc, Preimage, ZERO_PREIMAGE};
use crate::node::Node;
use crate::prelude::*;
use crate::signer::KeyPurpose;
use crate::state::ChannelState;
use crate::tx::script::{funding_witness, htlc_single_witness, htlc_two_of_two_witness};
use crate::tx::{build_htlc_tx, sign_input, verify_input, CommitmentKeys, CommitmentTx};
use crate::util::crypto_utils::from_compact;
use crate::wallet::UtxoDescriptor;

/// A commitment found on chain, with the state it was built from
pub(crate) struct ClosedCommitment {
    pub state: ChannelState,
    pub mine: bool,
    pub ctx: CommitmentTx,
    pub keys: CommitmentKeys,
}

impl Channel {
    /// The unsigned commitments of both parties for the current state, ours first
    pub fn close_txs(&self) -> Result<(Transaction, Transaction), ChannelError> {
        let (mine, _) = self.build_commitment(&self.state, true)?;
        let (theirs, _) = self.build_commitment(&self.state, false)?;
        Ok((mine.tx, theirs.tx))
    }

    /// Find which commitment `txid` is.  The current state is tried first,
    /// then the state before our outstanding proposal.
    pub(crate) fn match_close_tx(&self, txid: &Txid) -> Result<ClosedCommitment, ChannelError> {
        for state in [self.state.clone(), self.state.base_view()] {
            for mine in [true, false] {
                match self.build_commitment(&state, mine) {
                    Ok((ctx, keys)) if ctx.tx.compute_txid() == *txid =>
                        return Ok(ClosedCommitment { state, mine, ctx, keys }),
                    Ok(_) => {}
                    Err(e) => debug!("{}: skipping candidate at {}: {}", self.id, state.state_index, e),
                }
            }
        }
        channel_err!(Reconstruction, "{}: {} matches no known commitment", self.id, txid)
    }

    // Spend the HTLC output of our own commitment through the co-signed
    // second-stage transaction.  Its output is the wallet's to sweep after the
    // delay.
    fn claim_from_my_commitment(
        &self,
        closed: &ClosedCommitment,
        htlc: &Htlc,
        preimage: Option<Preimage>,
    ) -> Result<(Transaction, UtxoDescriptor), ChannelError> {
        let txid = closed.ctx.tx.compute_txid();
        let (vout, info, script) = closed
            .ctx
            .htlc_output(htlc.idx)
            .ok_or_else(|| channel_error!(Reconstruction, "htlc {} has no output", htlc.idx))?;
        let mut tx = build_htlc_tx(txid, *vout, info, &closed.keys, self.delay, closed.state.fee);
        let their_sig = from_compact(&htlc.sig)
            .map_err(|_| channel_error!(Reconstruction, "no countersignature for htlc {}", htlc.idx))?;
        verify_input(self.secp_ctx(), &tx, 0, script, htlc.amount, &their_sig, &info.countersignatory_key)
            .map_err(|e| channel_error!(Reconstruction, "htlc {}: {}", htlc.idx, e))?;
        let key = self.htlc_secret(htlc, &closed.keys.per_commitment_point)?;
        let my_sig = sign_input(self.secp_ctx(), &tx, 0, script, htlc.amount, &key)?;
        tx.input[0].witness =
            htlc_two_of_two_witness(script, their_sig, my_sig, preimage.as_ref().map(|p| &p[..]));
        let descriptor = UtxoDescriptor {
            outpoint: OutPoint { txid: tx.compute_txid(), vout: 0 },
            value: htlc.amount - closed.state.fee,
            keygen: self.funding.keygen.with_purpose(KeyPurpose::Hakd),
            per_commitment_point: closed.keys.per_commitment_point,
            witness_script: closed.keys.revokeable_script(self.delay),
            sequence: self.delay as u32,
            pre_sig_stack: vec![vec![]],
            height: self.close_data.close_height,
        };
        Ok((tx, descriptor))
    }

    // Spend the HTLC output of the counterparty's commitment directly to a
    // fresh wallet address
    fn claim_from_their_commitment(
        &self,
        closed: &ClosedCommitment,
        htlc: &Htlc,
        preimage: Option<Preimage>,
    ) -> Result<Transaction, ChannelError> {
        let txid = closed.ctx.tx.compute_txid();
        let (vout, _, script) = closed
            .ctx
            .htlc_output(htlc.idx)
            .ok_or_else(|| channel_error!(Reconstruction, "htlc {} has no output", htlc.idx))?;
        let address = self.wallet().new_address(self.asset())?;
        let lock_time =
            if htlc.incoming { LockTime::ZERO } else { LockTime::from_consensus(htlc.locktime) };
        let mut tx = Transaction {
            version: Version::TWO,
            lock_time,
            input: vec![TxIn {
                previous_output: OutPoint { txid, vout: *vout },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ZERO,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat((htlc.amount - closed.state.fee) as u64),
                script_pubkey: ScriptBuf::new_p2wpkh(&address),
            }],
        };
        let key = self.htlc_secret(htlc, &closed.keys.per_commitment_point)?;
        let sig = sign_input(self.secp_ctx(), &tx, 0, script, htlc.amount, &key)?;
        tx.input[0].witness = htlc_single_witness(script, sig, preimage.as_ref().map(|p| &p[..]));
        Ok(tx)
    }

    fn mark_cleared_on_chain(&mut self, idx: u32) -> bool {
        let state = &mut self.state;
        let htlc = state
            .htlcs
            .iter_mut()
            .chain(state.in_progress_htlc.iter_mut())
            .chain(state.colliding_htlc.iter_mut())
            .find(|h| h.idx == idx);
        match htlc {
            Some(h) => {
                h.cleared_on_chain = true;
                true
            }
            None => false,
        }
    }
}

impl Node {
    /// Broadcast our latest commitment that the counterparty signed
    #[instrument(skip(self))]
    pub fn break_channel(&self, id: &ChannelId) -> Result<Transaction, ChannelError> {
        let slot = self.get_channel(id)?;
        let mut chan = slot.channel.lock().unwrap();
        self.reload_channel(&mut chan)?;
        if chan.close_data.closed {
            channel_err!(Closed, "{}", id);
        }
        let mut found = None;
        for state in [chan.state.clone(), chan.state.base_view()] {
            let their_sig = match state.their_sig.as_ref().map(from_compact) {
                Some(Ok(sig)) => sig,
                _ => continue,
            };
            let (ctx, _) = match chan.build_commitment(&state, true) {
                Ok(built) => built,
                Err(e) => {
                    debug!("{}: no commitment at {}: {}", id, state.state_index, e);
                    continue;
                }
            };
            let script = chan.funding_script();
            let verified = verify_input(
                chan.secp_ctx(),
                &ctx.tx,
                0,
                &script,
                chan.capacity(),
                &their_sig,
                &chan.their_pubkeys.fund,
            );
            if verified.is_ok() {
                found = Some((state.state_index, ctx.tx, their_sig, script));
                break;
            }
        }
        let (state_index, mut tx, their_sig, script) = match found {
            Some(f) => f,
            None => channel_err!(Reconstruction, "{}: no countersigned commitment", id),
        };
        let fund_key = chan.my_secret(KeyPurpose::Fund)?;
        let my_sig = sign_input(chan.secp_ctx(), &tx, 0, &script, chan.capacity(), &fund_key)?;
        tx.input[0].witness = funding_witness(
            &script,
            (&chan.my_pubkeys.fund, my_sig),
            (&chan.their_pubkeys.fund, their_sig),
        );
        self.wallet.broadcast(chan.asset(), &tx)?;
        let txid = tx.compute_txid();
        warn!("{}: broke channel at state {} with {}", id, state_index, txid);
        chan.close_data.closed = true;
        chan.close_data.close_txid = Some(txid);
        chan.update = UpdateInFlight::Withheld;
        slot.update_cv.notify_all();
        self.save_channel(&chan)?;
        Ok(tx)
    }

    /// Record that the funding output was spent by `txid` at `height`
    #[instrument(skip(self))]
    pub fn on_channel_closed(&self, id: &ChannelId, txid: Txid, height: u32) -> Result<(), ChannelError> {
        let slot = self.get_channel(id)?;
        let mut chan = slot.channel.lock().unwrap();
        self.reload_channel(&mut chan)?;
        chan.close_data.closed = true;
        chan.close_data.close_txid = Some(txid);
        chan.close_data.close_height = height;
        if chan.update != UpdateInFlight::Idle {
            chan.update = UpdateInFlight::Withheld;
        }
        slot.update_cv.notify_all();
        self.save_channel(&chan)?;
        info!("{}: closed by {} at {}", id, txid, height);
        Ok(())
    }

    /// The unsigned commitments of both parties for the current state
    pub fn get_close_txs(&self, id: &ChannelId) -> Result<(Transaction, Transaction), ChannelError> {
        self.with_channel(id, |chan| chan.close_txs())
    }

    /// Claim HTLC `idx` of a closed channel from whichever commitment closed it.
    ///
    /// An incoming HTLC needs its preimage; an outgoing one is timed out and
    /// needs its locktime reached.
    #[instrument(skip(self))]
    pub fn claim_htlc_on_chain(
        &self,
        id: &ChannelId,
        idx: u32,
        preimage: Option<Preimage>,
    ) -> Result<Transaction, ChannelError> {
        let slot = self.get_channel(id)?;
        let mut chan = slot.channel.lock().unwrap();
        self.reload_channel(&mut chan)?;
        if !chan.close_data.closed {
            channel_err!(InvalidArgument, "{} is not closed", id);
        }
        let close_txid = chan
            .close_data
            .close_txid
            .ok_or_else(|| channel_error!(Reconstruction, "{}: close txid unknown", id))?;
        let closed = chan.match_close_tx(&close_txid)?;
        let htlc = closed
            .state
            .live_htlcs()
            .into_iter()
            .find(|h| h.idx == idx)
            .cloned()
            .ok_or_else(|| channel_error!(InvalidArgument, "{}: htlc {} not on {}", id, idx, close_txid))?;
        if htlc.cleared_on_chain {
            channel_err!(InvalidArgument, "{}: htlc {} already claimed", id, idx);
        }
        let preimage = if htlc.incoming {
            match preimage {
                Some(p) if p != ZERO_PREIMAGE && payment_hash_of(&p) == htlc.payment_hash => Some(p),
                _ => channel_err!(InvalidArgument, "{}: htlc {} needs its preimage", id, idx),
            }
        } else {
            let height = self.wallet.current_height(chan.asset())?;
            if htlc.locktime > height {
                channel_err!(
                    LocktimeNotExpired,
                    "{}: htlc {} locktime {} at height {}",
                    id,
                    idx,
                    htlc.locktime,
                    height
                );
            }
            None
        };
        if htlc.amount <= closed.state.fee {
            channel_err!(InvalidArgument, "{}: htlc {} does not cover the fee", id, idx);
        }

        let tx = if closed.mine {
            let (tx, descriptor) = chan.claim_from_my_commitment(&closed, &htlc, preimage)?;
            self.wallet.export_utxo(descriptor)?;
            tx
        } else {
            chan.claim_from_their_commitment(&closed, &htlc, preimage)?
        };
        let (vout, _, _) = closed
            .ctx
            .htlc_output(idx)
            .ok_or_else(|| channel_error!(Reconstruction, "htlc {} has no output", idx))?;
        self.wallet.stop_watching(chan.asset(), &OutPoint { txid: close_txid, vout: *vout })?;
        self.wallet.broadcast(chan.asset(), &tx)?;
        chan.mark_cleared_on_chain(idx);
        self.save_channel(&chan)?;
        info!(
            "{}: claimed htlc {} from {} commitment with {}",
            id,
            idx,
            if closed.mine { "our" } else { "their" },
            tx.compute_txid()
        );
        Ok(tx)
    }

    /// Claim every incoming HTLC locked to `preimage`'s hash, on chain for
    /// closed channels and by handshake for open ones.
    ///
    /// Returns the claim transactions broadcast.  Failures on one channel are
    /// logged and skipped.
    pub fn claim_htlc(&self, preimage: Preimage) -> Result<Vec<Txid>, ChannelError> {
        let hash = payment_hash_of(&preimage);
        if let Some(record) = self.multihop_learned(&preimage)? {
            debug!("learned preimage of multihop payment {} out of {}", hex::encode(hash), record.outgoing);
        }
        let mut txids = Vec::new();
        let mut claimed = false;
        for (id, htlc) in self.find_htlcs_by_hash(&hash)? {
            if !htlc.incoming || htlc.cleared || htlc.cleared_on_chain {
                continue;
            }
            let closed = self.with_channel(&id, |chan| Ok(chan.close_data.closed))?;
            // an unanswered clear does not settle a closed channel, the
            // commitment on chain decides
            if htlc.clearing && !closed {
                continue;
            }
            if closed {
                match self.claim_htlc_on_chain(&id, htlc.idx, Some(preimage)) {
                    Ok(tx) => {
                        txids.push(tx.compute_txid());
                        claimed = true;
                    }
                    Err(e) => warn!("{}: could not claim htlc {} on chain: {}", id, htlc.idx, e),
                }
            } else {
                match self.clear_htlc(&id, htlc.idx, preimage, [0; 32]) {
                    Ok(()) => claimed = true,
                    Err(e) => warn!("{}: could not clear htlc {}: {}", id, htlc.idx, e),
                }
            }
        }
        if claimed {
            self.multihop_succeeded(&hash)?;
        }
        Ok(txids)
    }

    /// Time out every outgoing HTLC of `asset` whose locktime is reached at
    /// `height`, on chain for closed channels and by handshake for open ones
    pub fn claim_htlc_timeouts(&self, asset: u32, height: u32) -> Result<Vec<Txid>, ChannelError> {
        let mut txids = Vec::new();
        for (id, htlc) in self.find_htlcs_by_timeout_height(asset, height)? {
            if htlc.cleared_on_chain {
                continue;
            }
            let closed = self.with_channel(&id, |chan| Ok(chan.close_data.closed))?;
            if htlc.clearing && !closed {
                continue;
            }
            if closed {
                match self.claim_htlc_on_chain(&id, htlc.idx, None) {
                    Ok(tx) => txids.push(tx.compute_txid()),
                    Err(e) => warn!("{}: could not time out htlc {} on chain: {}", id, htlc.idx, e),
                }
            } else if let Err(e) = self.clear_htlc(&id, htlc.idx, ZERO_PREIMAGE, [0; 32]) {
                warn!("{}: could not time out htlc {}: {}", id, htlc.idx, e);
            }
        }
        Ok(txids)
    }

    /// The channel and HTLC behind an HTLC output of a counterparty commitment
    pub fn get_htlc(&self, outpoint: &OutPoint) -> Result<(ChannelId, Htlc), ChannelError> {
        for slot in self.slots() {
            let chan = slot.channel.lock().unwrap();
            let (ctx, _) = match chan.build_commitment(&chan.state, false) {
                Ok(built) => built,
                Err(_) => continue,
            };
            if ctx.tx.compute_txid() != outpoint.txid {
                continue;
            }
            let idx = ctx
                .htlc_outputs
                .iter()
                .find(|(vout, _, _)| *vout == outpoint.vout)
                .map(|(_, info, _)| info.idx);
            if let Some(h) = idx.and_then(|idx| chan.state.live_htlcs().into_iter().find(|h| h.idx == idx)) {
                return Ok((chan.id, h.clone()));
            }
        }
        channel_err!(InvalidArgument, "no htlc at {}", outpoint)
    }

    /// HTLCs of every channel locked to `payment_hash`
    pub fn find_htlcs_by_hash(&self, payment_hash: &[u8; 32]) -> Result<Vec<(ChannelId, Htlc)>, ChannelError> {
        let mut found = Vec::new();
        for slot in self.slots() {
            let chan = slot.channel.lock().unwrap();
            let state = &chan.state;
            for h in state.htlcs.iter().chain(state.in_progress_htlc.iter()).chain(state.colliding_htlc.iter()) {
                if h.payment_hash == *payment_hash {
                    found.push((chan.id, h.clone()));
                }
            }
        }
        Ok(found)
    }

    /// Uncleared outgoing HTLCs of `asset` whose locktime is reached at `height`
    pub fn find_htlcs_by_timeout_height(
        &self,
        asset: u32,
        height: u32,
    ) -> Result<Vec<(ChannelId, Htlc)>, ChannelError> {
        let mut found = Vec::new();
        for slot in self.slots() {
            let chan = slot.channel.lock().unwrap();
            if chan.asset() != asset {
                continue;
            }
            for h in chan.state.htlcs.iter() {
                if !h.incoming && !h.cleared && h.locktime <= height {
                    found.push((chan.id, h.clone()));
                }
            }
        }
        Ok(found)
    }

    /// Mark HTLC `idx` as resolved by an on-chain claim seen by the watcher
    pub fn set_htlc_cleared_on_chain(&self, id: &ChannelId, idx: u32) -> Result<(), ChannelError> {
        let slot = self.get_channel(id)?;
        let mut chan = slot.channel.lock().unwrap();
        self.reload_channel(&mut chan)?;
        if !chan.mark_cleared_on_chain(idx) {
            channel_err!(InvalidArgument, "{}: no htlc {}", id, idx);
        }
        self.save_channel(&chan)
    }
}
