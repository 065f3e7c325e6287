use bitcoin::secp256k1::PublicKey;
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};

use crate::signer::KeyGen;
use crate::util::crypto_utils::{sha256, CompactSignature};

/// Length of an HTLC preimage
pub const PREIMAGE_LEN: usize = 16;

/// An HTLC preimage
pub type Preimage = [u8; PREIMAGE_LEN];

/// The all-zero preimage, which resolves an HTLC by timeout
pub const ZERO_PREIMAGE: Preimage = [0; PREIMAGE_LEN];

/// The payment hash locking an HTLC with this preimage
pub fn payment_hash_of(preimage: &Preimage) -> [u8; 32] {
    sha256(preimage)
}

/// A hashed time-locked conditional payment inside a channel.
///
/// `incoming` is from the local party's point of view.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Htlc {
    /// Slot index within the channel
    pub idx: u32,
    /// Whether the counterparty offered it
    pub incoming: bool,
    /// Amount in satoshi
    pub amount: i64,
    /// SHA256 of the preimage
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub payment_hash: [u8; 32],
    /// Absolute block height after which the offerer may time it out
    pub locktime: u32,
    /// Counterparty base key for this slot
    pub their_htlc_base: PublicKey,
    /// Our base key for this slot
    pub my_htlc_base: PublicKey,
    /// Derivation path of our base key
    pub keygen: KeyGen,
    /// Resolution is committed
    pub cleared: bool,
    /// Resolution is proposed or committed
    pub clearing: bool,
    /// Resolved by an on-chain claim
    pub cleared_on_chain: bool,
    /// The revealing preimage, or [`ZERO_PREIMAGE`] for a timeout
    #[serde_as(as = "Option<IfIsHumanReadable<Hex, Bytes>>")]
    pub preimage: Option<Preimage>,
    /// Counterparty signature on our second-stage transaction for this HTLC
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub sig: CompactSignature,
}

impl Htlc {
    /// Create an unresolved HTLC
    pub fn new(
        idx: u32,
        incoming: bool,
        amount: i64,
        payment_hash: [u8; 32],
        locktime: u32,
        their_htlc_base: PublicKey,
        my_htlc_base: PublicKey,
        keygen: KeyGen,
    ) -> Self {
        Htlc {
            idx,
            incoming,
            amount,
            payment_hash,
            locktime,
            their_htlc_base,
            my_htlc_base,
            keygen,
            cleared: false,
            clearing: false,
            cleared_on_chain: false,
            preimage: None,
            sig: [0; 64],
        }
    }

    /// Whether the recorded resolution is a timeout
    pub fn is_timeout(&self) -> bool {
        self.preimage == Some(ZERO_PREIMAGE)
    }

    /// Whether resolving with `preimage` moves the amount to the local side.
    ///
    /// A success pays the receiver and a timeout refunds the offerer.
    pub fn resolution_gains_local(&self, preimage: &Preimage) -> bool {
        self.incoming != (*preimage == ZERO_PREIMAGE)
    }

    /// Whether `preimage` resolves this HTLC
    pub fn preimage_matches(&self, preimage: &Preimage) -> bool {
        *preimage == ZERO_PREIMAGE || payment_hash_of(preimage) == self.payment_hash
    }

    /// Whether the HTLC still has an output in the latest commitments
    pub fn is_live(&self) -> bool {
        !self.clearing && !self.cleared
    }
}
