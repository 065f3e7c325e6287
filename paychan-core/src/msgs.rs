//! Peer wire messages of the channel update protocol.
//!
//! A proposal (`HashSig`, `PreimageSig` or `DeltaSig`) carries the proposer's
//! signatures on the responder's next commitment.  `SigRev` answers it with the
//! responder's signatures and the revocation of its previous state, and `Rev`
//! completes it.  Colliding proposals are answered with `GapSigRev`.

use bitcoin::secp256k1::PublicKey;
use bitcoin::OutPoint;
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};

use crate::error::ChannelError;
use crate::htlc::Preimage;
use crate::prelude::*;
use crate::util::crypto_utils::CompactSignature;

/// Signatures on one commitment and its second-stage HTLC transactions
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitmentSigs {
    /// Signature on the commitment's funding input
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub commitment_sig: CompactSignature,
    /// One signature per live HTLC, in slot order
    #[serde_as(as = "Vec<IfIsHumanReadable<Hex, Bytes>>")]
    pub htlc_sigs: Vec<CompactSignature>,
}

/// Offer an HTLC
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HashSig {
    /// Funding outpoint of the channel
    pub channel_outpoint: OutPoint,
    /// HTLC amount
    pub amount: i64,
    /// Payment hash
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub payment_hash: [u8; 32],
    /// CLTV height
    pub locktime: u32,
    /// Signatures on the responder's next state
    pub sigs: CommitmentSigs,
    /// Opaque payload
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub data: [u8; 32],
}

/// Resolve an HTLC by preimage, or by timeout with the zero preimage
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreimageSig {
    /// Funding outpoint of the channel
    pub channel_outpoint: OutPoint,
    /// HTLC slot
    pub idx: u32,
    /// The preimage
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub preimage: Preimage,
    /// Signatures on the responder's next state
    pub sigs: CommitmentSigs,
    /// Opaque payload
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub data: [u8; 32],
}

/// Push funds to the responder
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaSig {
    /// Funding outpoint of the channel
    pub channel_outpoint: OutPoint,
    /// Amount pushed
    pub amount: i64,
    /// Signatures on the responder's next state
    pub sigs: CommitmentSigs,
    /// Opaque payload
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub data: [u8; 32],
}

/// Revocation of one state, with the points and HTLC bases the sender will use next
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Revocation {
    /// The revoked state
    pub revoked_index: u64,
    /// Its revocation secret
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub secret: [u8; 32],
    /// Sender point for `revoked_index + 2`
    pub next_point: PublicKey,
    /// Sender point for `revoked_index + 3`
    pub next2_point: PublicKey,
    /// Sender base for its next HTLC slot
    pub next_htlc_base: PublicKey,
    /// Sender base for the slot after that
    pub next2_htlc_base: PublicKey,
}

/// Countersign a proposal and revoke the previous state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SigRev {
    /// Funding outpoint of the channel
    pub channel_outpoint: OutPoint,
    /// Signatures on the proposer's next state
    pub sigs: CommitmentSigs,
    /// Revocation of the responder's previous state
    pub revocation: Revocation,
}

/// Countersign the gap state after a collision and revoke the base state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GapSigRev {
    /// Funding outpoint of the channel
    pub channel_outpoint: OutPoint,
    /// Signatures on the counterparty's gap state
    pub sigs: CommitmentSigs,
    /// Revocation of the sender's base state
    pub revocation: Revocation,
}

/// Revoke a state, completing a handshake
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rev {
    /// Funding outpoint of the channel
    pub channel_outpoint: OutPoint,
    /// The revocation
    pub revocation: Revocation,
}

/// Defer the counterparty's proposal without processing it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmptyRev {
    /// Funding outpoint of the channel
    pub channel_outpoint: OutPoint,
    /// The sender's current state index
    pub state_index: u64,
}

/// A peer message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Offer an HTLC
    HashSig(HashSig),
    /// Clear an HTLC
    PreimageSig(PreimageSig),
    /// Push funds
    DeltaSig(DeltaSig),
    /// Countersign and revoke
    SigRev(SigRev),
    /// Countersign a gap state and revoke
    GapSigRev(GapSigRev),
    /// Revoke
    Rev(Rev),
    /// Defer
    EmptyRev(EmptyRev),
}

impl Message {
    /// The channel this message is about
    pub fn channel_outpoint(&self) -> OutPoint {
        match self {
            Message::HashSig(m) => m.channel_outpoint,
            Message::PreimageSig(m) => m.channel_outpoint,
            Message::DeltaSig(m) => m.channel_outpoint,
            Message::SigRev(m) => m.channel_outpoint,
            Message::GapSigRev(m) => m.channel_outpoint,
            Message::Rev(m) => m.channel_outpoint,
            Message::EmptyRev(m) => m.channel_outpoint,
        }
    }

    /// Name of the message type, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Message::HashSig(_) => "HashSig",
            Message::PreimageSig(_) => "PreimageSig",
            Message::DeltaSig(_) => "DeltaSig",
            Message::SigRev(_) => "SigRev",
            Message::GapSigRev(_) => "GapSigRev",
            Message::Rev(_) => "Rev",
            Message::EmptyRev(_) => "EmptyRev",
        }
    }

    /// Serialize for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChannelError> {
        serde_json::to_vec(self).map_err(|e| channel_error!(Internal, "encode: {}", e))
    }

    /// Deserialize from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChannelError> {
        serde_json::from_slice(bytes).map_err(|e| channel_error!(Decode, "message: {}", e))
    }
}
