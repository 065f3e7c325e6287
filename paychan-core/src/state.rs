use bitcoin::secp256k1::PublicKey;
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};

use crate::htlc::{Htlc, Preimage};
use crate::prelude::*;
use crate::util::crypto_utils::CompactSignature;

/// The mutable ledger of a channel.
///
/// Balances are from the local point of view.  `my_amount` already excludes
/// outgoing HTLCs that are still live; the counterparty balance is whatever is
/// left of the capacity after `my_amount` and all live HTLCs.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    /// Index of the newest commitment
    pub state_index: u64,
    /// Our balance
    pub my_amount: i64,
    /// Fee taken from each balance output of a commitment
    pub fee: i64,
    /// Pending non-HTLC balance shift, negative when we are pushing
    pub delta: i64,
    /// Next HTLC slot
    pub htlc_idx: u32,
    /// Committed HTLCs, in idx order, never removed
    pub htlcs: Vec<Htlc>,
    /// HTLC proposed but not yet committed
    pub in_progress_htlc: Option<Htlc>,
    /// The HTLC deferred to the slot after `in_progress_htlc` by a collision
    pub colliding_htlc: Option<Htlc>,
    /// An HTLC offer collided with a push
    pub colliding_hash_delta: bool,
    /// An HTLC offer collided with a clear
    pub colliding_hash_preimage: bool,
    /// A clear collided with a push
    pub colliding_preimage_delta: bool,
    /// Two clears collided
    pub colliding_preimages: bool,
    /// Two pushes collided
    pub collision: i8,
    /// Counterparty point of its oldest unrevoked state
    pub elk_point: PublicKey,
    /// Counterparty point of the state after `elk_point`
    pub next_elk_point: PublicKey,
    /// Counterparty point of the state after `next_elk_point`
    pub next2_elk_point: PublicKey,
    /// Our base for the next HTLC slot
    pub my_next_htlc_base: PublicKey,
    /// Our base for the slot after that
    pub my_next2_htlc_base: PublicKey,
    /// Counterparty base for the next HTLC slot
    pub next_htlc_base: PublicKey,
    /// Counterparty base for the slot after that
    pub next2_htlc_base: PublicKey,
    /// Counterparty signature on our current commitment
    #[serde_as(as = "Option<IfIsHumanReadable<Hex, Bytes>>")]
    pub their_sig: Option<CompactSignature>,
    /// The channel rejects new handshakes
    pub failed: bool,
    /// Opaque payload piggy-backed on the last update
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub data: [u8; 32],
}

impl ChannelState {
    /// Whether no proposal is outstanding
    pub fn is_at_rest(&self) -> bool {
        self.delta == 0
            && self.in_progress_htlc.is_none()
            && self.colliding_htlc.is_none()
            && !self.htlcs.iter().any(|h| h.clearing && !h.cleared)
            && !self.has_collision()
    }

    /// Whether any collision flag is set
    pub fn has_collision(&self) -> bool {
        self.colliding_hash_delta
            || self.colliding_hash_preimage
            || self.colliding_preimage_delta
            || self.colliding_preimages
            || self.collision != 0
            || self.colliding_htlc.is_some()
    }

    /// HTLCs with an output in the newest commitment, in idx order
    pub fn live_htlcs(&self) -> Vec<&Htlc> {
        let mut live: Vec<&Htlc> = self.htlcs.iter().filter(|h| h.is_live()).collect();
        live.extend(self.in_progress_htlc.iter());
        live.extend(self.colliding_htlc.iter());
        live.sort_by_key(|h| h.idx);
        live
    }

    /// Mutable access to the live HTLC at `idx`
    pub fn live_htlc_mut(&mut self, idx: u32) -> Option<&mut Htlc> {
        if let Some(h) = self.in_progress_htlc.as_mut().filter(|h| h.idx == idx) {
            return Some(h);
        }
        if let Some(h) = self.colliding_htlc.as_mut().filter(|h| h.idx == idx) {
            return Some(h);
        }
        self.htlcs.iter_mut().find(|h| h.idx == idx && h.is_live())
    }

    /// The counterparty balance for a channel of `capacity`
    pub fn their_amount(&self, capacity: i64) -> i64 {
        let held: i64 = self.live_htlcs().iter().map(|h| h.amount).sum();
        capacity - self.my_amount - held
    }

    /// Both balances, local first
    pub fn balances(&self, capacity: i64) -> (i64, i64) {
        (self.my_amount, self.their_amount(capacity))
    }

    /// Index of the HTLC slot after the pending proposals commit
    pub fn htlc_idx_after_commit(&self) -> u32 {
        self.htlc_idx
            + self.in_progress_htlc.is_some() as u32
            + self.colliding_htlc.is_some() as u32
    }

    /// Record a proposed resolution of committed HTLC `idx`, crediting us if it
    /// moves the amount to our side
    pub(crate) fn apply_clear(&mut self, idx: u32, preimage: Preimage) {
        if let Some(h) = self.htlcs.get_mut(idx as usize) {
            h.clearing = true;
            h.preimage = Some(preimage);
            if h.resolution_gains_local(&preimage) {
                self.my_amount += h.amount;
            }
        }
    }

    /// A snapshot of this state without our own outstanding proposal, as of the
    /// previous state index.
    pub fn base_view(&self) -> ChannelState {
        let mut base = self.clone();
        if let Some(h) = base.in_progress_htlc.take() {
            if !h.incoming {
                base.my_amount += h.amount;
            } else {
                base.in_progress_htlc = Some(h);
            }
        }
        for h in base.htlcs.iter_mut().filter(|h| h.clearing && !h.cleared) {
            if let Some(preimage) = h.preimage {
                if h.resolution_gains_local(&preimage) {
                    base.my_amount -= h.amount;
                }
            }
            h.clearing = false;
            h.preimage = None;
        }
        if base.delta < 0 {
            base.my_amount -= base.delta;
            base.delta = 0;
        }
        base.state_index = base.state_index.saturating_sub(1);
        base
    }

    /// Fold the pending proposals into the committed ledger
    pub(crate) fn commit_pending(&mut self) {
        let mut pending: Vec<Htlc> =
            self.in_progress_htlc.take().into_iter().chain(self.colliding_htlc.take()).collect();
        pending.sort_by_key(|h| h.idx);
        self.htlcs.extend(pending);
        self.htlc_idx = self.htlcs.len() as u32;
        for h in self.htlcs.iter_mut().filter(|h| h.clearing) {
            h.cleared = true;
        }
        self.delta = 0;
        self.colliding_hash_delta = false;
        self.colliding_hash_preimage = false;
        self.colliding_preimage_delta = false;
        self.colliding_preimages = false;
        self.collision = 0;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::htlc::tests::make_htlc;
    use crate::htlc::ZERO_PREIMAGE;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use test_log::test;

    pub(crate) fn make_state(my_amount: i64) -> ChannelState {
        let secp_ctx = Secp256k1::new();
        let key = |b| PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[b; 32]).unwrap());
        ChannelState {
            state_index: 1,
            my_amount,
            fee: 10,
            delta: 0,
            htlc_idx: 0,
            htlcs: vec![],
            in_progress_htlc: None,
            colliding_htlc: None,
            colliding_hash_delta: false,
            colliding_hash_preimage: false,
            colliding_preimage_delta: false,
            colliding_preimages: false,
            collision: 0,
            elk_point: key(1),
            next_elk_point: key(2),
            next2_elk_point: key(3),
            my_next_htlc_base: key(4),
            my_next2_htlc_base: key(5),
            next_htlc_base: key(6),
            next2_htlc_base: key(7),
            their_sig: None,
            failed: false,
            data: [0; 32],
        }
    }

    #[test]
    fn offer_balances_test() {
        let mut state = make_state(700);
        assert_eq!(state.balances(1000), (700, 300));
        state.in_progress_htlc = Some(make_htlc(0, false, 100, &[1; 16]));
        state.my_amount -= 100;
        state.state_index += 1;
        assert!(!state.is_at_rest());
        assert_eq!(state.balances(1000), (600, 300));

        let base = state.base_view();
        assert_eq!(base.balances(1000), (700, 300));
        assert_eq!(base.state_index, 1);
        assert!(base.is_at_rest());

        state.commit_pending();
        assert!(state.is_at_rest());
        assert_eq!(state.htlc_idx, 1);
        assert_eq!(state.balances(1000), (600, 300));
        assert_eq!(state.htlc_idx_after_commit(), 1);
    }

    #[test]
    fn clear_balances_test() {
        let mut state = make_state(600);
        state.htlcs.push(make_htlc(0, false, 100, &[1; 16]));
        state.htlcs.push(make_htlc(1, true, 50, &[2; 16]));
        state.htlc_idx = 2;
        assert_eq!(state.balances(1000), (600, 250));

        // outgoing timeout refunds us, incoming success pays us
        state.apply_clear(0, ZERO_PREIMAGE);
        assert_eq!(state.balances(1000), (700, 250));
        let base = state.base_view();
        assert_eq!(base.balances(1000), (600, 250));
        assert!(base.htlcs[0].preimage.is_none());

        state.apply_clear(1, [2; 16]);
        assert_eq!(state.balances(1000), (750, 250));
        state.commit_pending();
        assert!(state.htlcs.iter().all(|h| h.cleared && h.clearing));
        assert!(state.live_htlcs().is_empty());
    }

    #[test]
    fn push_base_view_test() {
        let mut state = make_state(600);
        state.delta = -50;
        state.my_amount -= 50;
        let base = state.base_view();
        assert_eq!(base.my_amount, 600);
        assert_eq!(base.delta, 0);
        state.collision = 1;
        assert!(state.has_collision());
        state.commit_pending();
        assert!(!state.has_collision());
        assert_eq!(state.my_amount, 550);
    }

    #[test]
    fn live_order_test() {
        let mut state = make_state(600);
        state.htlcs.push(make_htlc(0, false, 10, &[1; 16]));
        state.htlc_idx = 1;
        state.colliding_htlc = Some(make_htlc(2, true, 30, &[3; 16]));
        state.in_progress_htlc = Some(make_htlc(1, false, 20, &[2; 16]));
        let idxs: Vec<u32> = state.live_htlcs().iter().map(|h| h.idx).collect();
        assert_eq!(idxs, vec![0, 1, 2]);
        assert_eq!(state.htlc_idx_after_commit(), 3);
        assert_eq!(state.live_htlc_mut(2).unwrap().amount, 30);
        state.commit_pending();
        assert_eq!(state.htlcs.iter().map(|h| h.idx).collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
