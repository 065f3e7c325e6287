use core::fmt::{self, Debug, Formatter};

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{self, PublicKey, Secp256k1};
use lightning::ln::chan_utils::build_commitment_secret;
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};

use crate::error::ChannelError;
use crate::prelude::*;
use crate::util::crypto_utils::point_from_secret;
use crate::util::macro_logger::DebugBytes;
use crate::util::INITIAL_COMMITMENT_NUMBER;

/// Produces our revocation secrets, one per state index
#[derive(Clone)]
pub struct RevocationSender {
    seed: [u8; 32],
}

impl Debug for RevocationSender {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("RevocationSender").finish_non_exhaustive()
    }
}

impl RevocationSender {
    /// Create a sender rooted at `seed`
    pub fn new(seed: [u8; 32]) -> Self {
        RevocationSender { seed }
    }

    /// The secret for state `index`
    pub fn at(&self, index: u64) -> [u8; 32] {
        build_commitment_secret(&self.seed, INITIAL_COMMITMENT_NUMBER - index)
    }

    /// The per-state point for state `index`
    pub fn point<T: secp256k1::Signing>(
        &self,
        secp_ctx: &Secp256k1<T>,
        index: u64,
    ) -> Result<PublicKey, ChannelError> {
        Ok(point_from_secret(secp_ctx, &self.at(index))?)
    }
}

/// Stores the counterparty's revealed revocation secrets in O(log n) space
#[serde_as]
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RevocationReceiver {
    #[serde_as(as = "IfIsHumanReadable<Vec<(Hex, _)>, Vec<(Bytes, _)>>")]
    old_secrets: Vec<([u8; 32], u64)>,
}

impl Debug for RevocationReceiver {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("RevocationReceiver")
            .field("next_index", &self.next_index())
            .field("old_secrets", &DebugOldSecrets(&self.old_secrets))
            .finish()
    }
}

struct DebugOldSecrets<'a>(pub &'a Vec<([u8; 32], u64)>);
impl<'a> Debug for DebugOldSecrets<'a> {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_list()
            .entries(
                self.0
                    .iter()
                    .filter(|os| os.1 != 1 << 48)
                    .map(|os| (DebugBytes(&os.0), os.1)),
            )
            .finish()
    }
}

impl Default for RevocationReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl RevocationReceiver {
    /// Creates an empty receiver
    pub fn new() -> Self {
        let old_secrets = (0..49).map(|_| ([0; 32], 1 << 48)).collect::<Vec<_>>();
        Self { old_secrets }
    }

    #[inline]
    fn place_secret(idx: u64) -> u8 {
        for i in 0..48 {
            if idx & (1 << i) == (1 << i) {
                return i;
            }
        }
        48
    }

    fn min_seen_secret(&self) -> u64 {
        self.old_secrets.iter().map(|&(_, idx)| idx).min().unwrap_or(1 << 48)
    }

    #[inline]
    fn derive_secret(secret: [u8; 32], bits: u8, idx: u64) -> [u8; 32] {
        let mut res: [u8; 32] = secret;
        for i in 0..bits {
            let bitpos = bits - 1 - i;
            if idx & (1 << bitpos) == (1 << bitpos) {
                res[(bitpos / 8) as usize] ^= 1 << (bitpos & 7);
                res = Sha256::hash(&res).to_byte_array();
            }
        }
        res
    }

    fn provide_secret(&mut self, idx: u64, secret: [u8; 32]) -> Result<(), ChannelError> {
        let pos = Self::place_secret(idx);
        for i in 0..pos {
            let (old_secret, old_idx) = self.old_secrets[i as usize];
            if Self::derive_secret(secret, pos, old_idx) != old_secret {
                channel_err!(ChainMismatch, "secret at {} does not derive secret at {}", idx, old_idx);
            }
        }
        if self.min_seen_secret() <= idx {
            return Ok(());
        }
        self.old_secrets[pos as usize] = (secret, idx);
        Ok(())
    }

    fn get_secret(&self, idx: u64) -> Option<[u8; 32]> {
        for i in 0..self.old_secrets.len() {
            if (idx & (!((1 << i) - 1))) == self.old_secrets[i].1 {
                return Some(Self::derive_secret(self.old_secrets[i].0, i as u8, idx));
            }
        }
        None
    }

    /// The first state index whose secret has not been received
    pub fn next_index(&self) -> u64 {
        let min = self.min_seen_secret();
        if min == 1 << 48 {
            0
        } else {
            INITIAL_COMMITMENT_NUMBER - min + 1
        }
    }

    /// Insert the secret revoking state `index`.
    ///
    /// Secrets arrive in index order.  A secret for an index already received must
    /// match the stored chain.
    pub fn insert(&mut self, index: u64, secret: [u8; 32]) -> Result<(), ChannelError> {
        let next = self.next_index();
        if index > next {
            channel_err!(ChainMismatch, "secret for {} received, expected {}", index, next);
        }
        if index < next {
            if self.at(index) != Some(secret) {
                channel_err!(ChainMismatch, "secret for {} differs from stored", index);
            }
            return Ok(());
        }
        self.provide_secret(INITIAL_COMMITMENT_NUMBER - index, secret)
    }

    /// Regenerate the secret revoking state `index`, if received
    pub fn at(&self, index: u64) -> Option<[u8; 32]> {
        if index >= self.next_index() {
            return None;
        }
        self.get_secret(INITIAL_COMMITMENT_NUMBER - index)
    }
}
