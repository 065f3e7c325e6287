//! The update token and the three-message handshake, driven from the node.
//!
//! A proposer first acquires the channel's update token, waiting on the
//! channel's condition variable while another handshake is in flight.  The
//! channel is reloaded from storage before every mutation and saved before any
//! message leaves, so that a crash never loses a state the peer may have seen.

use std::time::Instant;

use tracing::*;

use crate::channel::{Channel, ChannelId, ChannelSlot, Proposal, UpdateInFlight};
use crate::error::ChannelError;
use crate::htlc::{Preimage, ZERO_PREIMAGE};
use crate::msgs::Message;
use crate::node::Node;
use crate::sync::MutexGuard;
use crate::Arc;

impl Node {
    fn check_not_failed(&self, slot: &ChannelSlot) -> Result<(), ChannelError> {
        let chan = slot.channel.lock().unwrap();
        if chan.state.failed {
            channel_err!(Failed, "{}", chan.id);
        }
        Ok(())
    }

    /// Take the update token, waiting up to the channel timeout for an
    /// in-flight handshake to finish.  A handshake that overstays its deadline
    /// fails the channel.
    pub(crate) fn acquire_update<'a>(
        &self,
        slot: &'a ChannelSlot,
    ) -> Result<MutexGuard<'a, Channel>, ChannelError> {
        let timeout = self.config.policy.channel_timeout;
        let give_up = Instant::now() + timeout;
        let mut chan = slot.channel.lock().unwrap();
        loop {
            if chan.close_data.closed {
                channel_err!(Closed, "{}", chan.id);
            }
            if chan.state.failed || chan.update == UpdateInFlight::Withheld {
                channel_err!(Failed, "{}", chan.id);
            }
            let now = Instant::now();
            let wake = match chan.update {
                UpdateInFlight::Idle => {
                    chan.update = UpdateInFlight::Proposing { deadline: now + timeout };
                    return Ok(chan);
                }
                UpdateInFlight::Proposing { deadline } | UpdateInFlight::Responding { deadline } => {
                    if now >= deadline {
                        self.fail_locked(slot, &mut chan, "handshake in flight timed out");
                        channel_err!(Timeout, "{}: handshake in flight timed out", chan.id);
                    }
                    deadline.min(give_up)
                }
                UpdateInFlight::Withheld => give_up,
            };
            if now >= give_up {
                self.fail_locked(slot, &mut chan, "update token not released");
                channel_err!(Timeout, "{}: update token not released", chan.id);
            }
            trace!("{}: waiting for the update token held as {:?}", chan.id, chan.update);
            chan = slot.update_cv.wait_timeout(chan, wake - now).unwrap().0;
        }
    }

    /// Give the token back without proposing
    pub(crate) fn release_update(&self, slot: &ChannelSlot, chan: &mut Channel) {
        if let UpdateInFlight::Proposing { .. } = chan.update {
            chan.update = UpdateInFlight::Idle;
        }
        slot.update_cv.notify_all();
    }

    // Reload and check the channel can take a proposal.  Soft failures give the
    // token back, anything else fails the channel.
    fn prepare_proposal(&self, slot: &ChannelSlot, chan: &mut Channel) -> Result<(), ChannelError> {
        if let Err(e) = self.reload_channel(chan) {
            self.fail_locked(slot, chan, "reload failed");
            return Err(e);
        }
        if chan.close_data.closed {
            self.release_update(slot, chan);
            channel_err!(Closed, "{}", chan.id);
        }
        let params = match self.wallet.asset_params(chan.asset()) {
            Some(p) => p,
            None => {
                self.release_update(slot, chan);
                channel_err!(NotReachable, "asset {} of {}", chan.asset(), chan.id);
            }
        };
        if chan.funding.height == 0 && !params.test_network {
            self.release_update(slot, chan);
            channel_err!(Unconfirmed, "{}", chan.id);
        }
        Ok(())
    }

    fn check_at_rest(&self, slot: &ChannelSlot, chan: &mut Channel) -> Result<(), ChannelError> {
        if !chan.state.is_at_rest() {
            self.fail_locked(slot, chan, "proposal while not at rest");
            channel_err!(Failed, "{} not at rest at {}", chan.id, chan.state.state_index);
        }
        Ok(())
    }

    fn check_balance(
        &self,
        slot: &ChannelSlot,
        chan: &mut Channel,
        amount: i64,
    ) -> Result<(), ChannelError> {
        let remaining = chan.state.my_amount - chan.state.fee - amount;
        if remaining < self.config.policy.min_output {
            self.release_update(slot, chan);
            channel_err!(
                InsufficientFunds,
                "{}: {} would leave {}, minimum {}",
                chan.id,
                amount,
                remaining,
                self.config.policy.min_output
            );
        }
        Ok(())
    }

    fn check_amount(&self, amount: i64) -> Result<(), ChannelError> {
        if amount <= 0 || amount >= self.config.policy.max_send {
            channel_err!(
                InvalidArgument,
                "amount {} outside (0, {})",
                amount,
                self.config.policy.max_send
            );
        }
        Ok(())
    }

    fn token_deadline(&self, chan: &Channel) -> Instant {
        match chan.update {
            UpdateInFlight::Proposing { deadline } => deadline,
            _ => Instant::now() + self.config.policy.channel_timeout,
        }
    }

    // Persist, then send.  Either failure fails the channel.
    fn save_and_send(
        &self,
        slot: &ChannelSlot,
        chan: &mut Channel,
        msg: Message,
    ) -> Result<(), ChannelError> {
        if let Err(e) = self.save_channel(chan) {
            self.fail_locked(slot, chan, "save failed");
            return Err(e);
        }
        debug!("{}: sending {} to peer {}", chan.id, msg.name(), chan.peer_idx);
        if let Err(e) = self.transport.send(chan.peer_idx, msg) {
            self.fail_locked(slot, chan, "send failed");
            return Err(e);
        }
        Ok(())
    }

    fn finish_proposal(
        &self,
        slot: &ChannelSlot,
        chan: &mut Channel,
        result: Result<Message, ChannelError>,
    ) -> Result<u64, ChannelError> {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                self.fail_locked(slot, chan, "could not build proposal");
                return Err(e);
            }
        };
        self.save_and_send(slot, chan, msg)?;
        Ok(chan.update_gen)
    }

    /// Offer an HTLC and send the proposal without waiting for the answer.
    ///
    /// Returns the update generation to pass to [`Node::await_update`].
    #[instrument(skip(self))]
    pub fn start_offer_htlc(
        &self,
        id: &ChannelId,
        amount: i64,
        payment_hash: [u8; 32],
        locktime: u32,
        data: [u8; 32],
    ) -> Result<u64, ChannelError> {
        let slot = self.get_channel(id)?;
        self.check_not_failed(&slot)?;
        self.check_amount(amount)?;
        let mut chan = self.acquire_update(&slot)?;
        self.prepare_proposal(&slot, &mut chan)?;
        self.check_balance(&slot, &mut chan, amount)?;
        self.check_at_rest(&slot, &mut chan)?;
        let deadline = self.token_deadline(&chan);
        debug!("{}: offering {} locked to {:?} until {}", id, amount, log_bytes!(payment_hash), locktime);
        let result = chan.propose_htlc(amount, payment_hash, locktime, data, deadline);
        self.finish_proposal(&slot, &mut chan, result)
    }

    /// Resolve HTLC `idx` by preimage, or by timeout with the zero preimage, and
    /// send the proposal without waiting for the answer
    #[instrument(skip(self))]
    pub fn start_clear_htlc(
        &self,
        id: &ChannelId,
        idx: u32,
        preimage: Preimage,
        data: [u8; 32],
    ) -> Result<u64, ChannelError> {
        let slot = self.get_channel(id)?;
        self.check_not_failed(&slot)?;
        let mut chan = self.acquire_update(&slot)?;
        self.prepare_proposal(&slot, &mut chan)?;
        self.check_at_rest(&slot, &mut chan)?;

        let htlc = match chan.state.htlcs.get(idx as usize) {
            Some(h) => h.clone(),
            None => {
                self.fail_locked(&slot, &mut chan, "clear of unknown htlc");
                channel_err!(Failed, "{}: htlc {} out of range", id, idx);
            }
        };
        if htlc.cleared || htlc.clearing {
            self.fail_locked(&slot, &mut chan, "clear of cleared htlc");
            channel_err!(Failed, "{}: htlc {} already cleared", id, idx);
        }
        if preimage == ZERO_PREIMAGE {
            if htlc.incoming {
                self.release_update(&slot, &mut chan);
                channel_err!(InvalidArgument, "{}: only the offerer times out htlc {}", id, idx);
            }
            let height = match self.wallet.current_height(chan.asset()) {
                Ok(h) => h,
                Err(e) => {
                    self.release_update(&slot, &mut chan);
                    return Err(e);
                }
            };
            if htlc.locktime > height {
                self.release_update(&slot, &mut chan);
                channel_err!(
                    LocktimeNotExpired,
                    "{}: htlc {} locktime {} at height {}",
                    id,
                    idx,
                    htlc.locktime,
                    height
                );
            }
        } else {
            if !htlc.incoming {
                self.release_update(&slot, &mut chan);
                channel_err!(InvalidArgument, "{}: only the receiver reveals htlc {}", id, idx);
            }
            if !htlc.preimage_matches(&preimage) {
                self.fail_locked(&slot, &mut chan, "preimage mismatch");
                channel_err!(Failed, "{}: preimage does not match htlc {}", id, idx);
            }
        }
        let deadline = self.token_deadline(&chan);
        let result = chan.propose_clear(idx, preimage, data, deadline);
        self.finish_proposal(&slot, &mut chan, result)
    }

    /// Push funds to the counterparty and send the proposal without waiting
    /// for the answer
    #[instrument(skip(self))]
    pub fn start_push(&self, id: &ChannelId, amount: i64, data: [u8; 32]) -> Result<u64, ChannelError> {
        let slot = self.get_channel(id)?;
        self.check_not_failed(&slot)?;
        self.check_amount(amount)?;
        let mut chan = self.acquire_update(&slot)?;
        self.prepare_proposal(&slot, &mut chan)?;
        self.check_balance(&slot, &mut chan, amount)?;
        self.check_at_rest(&slot, &mut chan)?;
        let deadline = self.token_deadline(&chan);
        let result = chan.propose_push(amount, data, deadline);
        self.finish_proposal(&slot, &mut chan, result)
    }

    /// Wait until the handshake started at generation `gen` completes.
    ///
    /// A deferred proposal returns a `Deferred` error; the caller may retry it.
    pub fn await_update(&self, id: &ChannelId, gen: u64) -> Result<(), ChannelError> {
        let slot = self.get_channel(id)?;
        let mut chan = slot.channel.lock().unwrap();
        loop {
            if chan.was_deferred(gen) {
                channel_err!(Deferred, "{}: proposal deferred by peer", id);
            }
            if chan.update_gen != gen {
                return Ok(());
            }
            match chan.update {
                UpdateInFlight::Idle => return Ok(()),
                UpdateInFlight::Withheld => channel_err!(Failed, "{}", id),
                UpdateInFlight::Proposing { deadline } | UpdateInFlight::Responding { deadline } => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.fail_locked(&slot, &mut chan, "no answer from peer");
                        channel_err!(Timeout, "{}: no answer from peer", id);
                    }
                    chan = slot.update_cv.wait_timeout(chan, deadline - now).unwrap().0;
                }
            }
        }
    }

    /// Offer an HTLC and wait for the handshake to complete
    pub fn offer_htlc(
        &self,
        id: &ChannelId,
        amount: i64,
        payment_hash: [u8; 32],
        locktime: u32,
        data: [u8; 32],
    ) -> Result<(), ChannelError> {
        let gen = self.start_offer_htlc(id, amount, payment_hash, locktime, data)?;
        self.await_update(id, gen)
    }

    /// Resolve an HTLC and wait for the handshake to complete
    pub fn clear_htlc(
        &self,
        id: &ChannelId,
        idx: u32,
        preimage: Preimage,
        data: [u8; 32],
    ) -> Result<(), ChannelError> {
        let gen = self.start_clear_htlc(id, idx, preimage, data)?;
        self.await_update(id, gen)
    }

    /// Push funds and wait for the handshake to complete
    pub fn push(&self, id: &ChannelId, amount: i64, data: [u8; 32]) -> Result<(), ChannelError> {
        let gen = self.start_push(id, amount, data)?;
        self.await_update(id, gen)
    }

    /// Handle a message from peer `peer_idx`.
    ///
    /// Any error while handling it fails the channel.  A revealed preimage
    /// starts a background claim of matching incoming HTLCs on other channels.
    pub fn handle_message(self: &Arc<Self>, peer_idx: u32, msg: Message) -> Result<(), ChannelError> {
        let id = ChannelId(msg.channel_outpoint());
        let slot = self.get_channel(&id)?;
        {
            let mut chan = slot.channel.lock().unwrap();
            if chan.peer_idx != peer_idx {
                channel_err!(InvalidArgument, "{} from peer {}, expected {}", id, peer_idx, chan.peer_idx);
            }
            if chan.close_data.closed {
                channel_err!(Closed, "{}", id);
            }
            if chan.state.failed {
                channel_err!(Failed, "{}", id);
            }
            debug!("{}: received {} at state {}", id, msg.name(), chan.state.state_index);
            if let Err(e) = self.reload_channel(&mut chan) {
                self.fail_locked(&slot, &mut chan, "reload failed");
                return Err(e);
            }
            if let Err(e) = self.dispatch(&slot, &mut chan, &msg) {
                self.fail_locked(&slot, &mut chan, &format!("handling {}", msg.name()));
                return Err(e);
            }
        }

        if let Message::PreimageSig(m) = msg {
            if m.preimage != ZERO_PREIMAGE {
                let node = Arc::clone(self);
                let preimage = m.preimage;
                std::thread::spawn(move || match node.claim_htlc(preimage) {
                    Ok(txids) if !txids.is_empty() => info!("claimed on chain: {:?}", txids),
                    Ok(_) => {}
                    Err(e) => warn!("claim after preimage: {}", e),
                });
            }
        }
        Ok(())
    }

    fn dispatch(&self, slot: &ChannelSlot, chan: &mut Channel, msg: &Message) -> Result<(), ChannelError> {
        let reply = match msg {
            Message::HashSig(_) | Message::PreimageSig(_) | Message::DeltaSig(_) => {
                let (proposal, sigs, data) = Proposal::from_message(msg)
                    .ok_or_else(|| channel_error!(Internal, "{} is not a proposal", msg.name()))?;
                let height = match proposal {
                    Proposal::Clear { preimage, .. } if preimage == ZERO_PREIMAGE =>
                        self.wallet.current_height(chan.asset())?,
                    _ => 0,
                };
                let deadline = Instant::now() + self.config.policy.channel_timeout;
                Some(chan.receive_proposal(&proposal, sigs, data, &self.config.policy, height, deadline)?)
            }
            Message::SigRev(m) => chan.receive_sig_rev(m)?,
            Message::GapSigRev(m) => chan.receive_gap_sig_rev(m)?,
            Message::Rev(m) => {
                if !chan.receive_rev(m)? {
                    return Ok(());
                }
                None
            }
            Message::EmptyRev(m) => {
                if !chan.receive_empty_rev(m) {
                    return Ok(());
                }
                None
            }
        };
        self.save_channel(chan)?;
        if let Some(reply) = reply {
            debug!("{}: replying {} to peer {}", chan.id, reply.name(), chan.peer_idx);
            self.transport.send(chan.peer_idx, reply)?;
        }
        slot.update_cv.notify_all();
        Ok(())
    }
}
