use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::secp256k1::{self, Keypair, Secp256k1};
use bitcoin::Network;
use serde_derive::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::prelude::*;
use crate::util::crypto_utils::hkdf_sha256;

/// Flag for hardened derivation steps
pub const HARDENED: u32 = 1 << 31;
/// The deepest path a [`KeyGen`] can describe
pub const MAX_DEPTH: u8 = 5;

const BIP44_PURPOSE: u32 = 44;

/// What a channel key is used for.  Occupies the third step of a channel path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    /// 2-of-2 funding multisig key
    Fund,
    /// Key receiving the to_remote output of the counterparty's commitment
    Refund,
    /// Base for revocation and delayed keys (hash-and-key-derivation)
    Hakd,
    /// Root of the revocation hash chain
    Revocation,
    /// Per-HTLC base key
    Htlc,
}

impl KeyPurpose {
    /// The unhardened path index for this purpose
    pub fn index(self) -> u32 {
        match self {
            KeyPurpose::Fund => 20,
            KeyPurpose::Refund => 30,
            KeyPurpose::Hakd => 40,
            KeyPurpose::Revocation => 8888,
            KeyPurpose::Htlc => 0x4854,
        }
    }
}

/// A derivation path.  Only paths are ever persisted, never private keys.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyGen {
    /// Number of meaningful steps
    pub depth: u8,
    /// Path steps, high bit set for hardened
    pub steps: [u32; 5],
}

impl KeyGen {
    /// The path of a channel key
    pub fn channel(asset: u32, purpose: KeyPurpose, peer_idx: u32, channel_idx: u32) -> Self {
        KeyGen {
            depth: MAX_DEPTH,
            steps: [
                BIP44_PURPOSE | HARDENED,
                asset | HARDENED,
                purpose.index() | HARDENED,
                peer_idx | HARDENED,
                channel_idx | HARDENED,
            ],
        }
    }

    /// The path of the base key of one HTLC
    pub fn htlc(asset: u32, htlc_idx: u32, channel_idx: u32) -> Self {
        KeyGen {
            depth: MAX_DEPTH,
            steps: [
                BIP44_PURPOSE | HARDENED,
                asset | HARDENED,
                KeyPurpose::Htlc.index() | HARDENED,
                htlc_idx | HARDENED,
                channel_idx | HARDENED,
            ],
        }
    }

    /// The same path with another purpose
    pub fn with_purpose(&self, purpose: KeyPurpose) -> Self {
        let mut keygen = *self;
        keygen.steps[2] = purpose.index() | HARDENED;
        keygen
    }

    /// The asset this path is scoped to
    pub fn asset(&self) -> u32 {
        self.steps[1] & !HARDENED
    }

    /// The channel index this path is scoped to
    pub fn channel_idx(&self) -> u32 {
        self.steps[4] & !HARDENED
    }

    fn child_numbers(&self) -> Result<Vec<ChildNumber>, ChannelError> {
        if self.depth == 0 || self.depth > MAX_DEPTH {
            channel_err!(InvalidPath, "depth {} out of range", self.depth);
        }
        Ok(self.steps[..self.depth as usize].iter().map(|s| ChildNumber::from(*s)).collect())
    }
}

/// Derive the key pair at `keygen` from a master seed.
///
/// Pure and deterministic.
pub fn derive(seed: &[u8], keygen: &KeyGen) -> Result<Keypair, ChannelError> {
    let path = keygen.child_numbers()?;
    let secp_ctx = Secp256k1::signing_only();
    let master_seed = hkdf_sha256(seed, "bip32 seed".as_bytes(), &[]);
    let master = Xpriv::new_master(Network::Bitcoin, &master_seed)
        .map_err(|e| channel_error!(Internal, "master key: {}", e))?;
    let child = master
        .derive_priv(&secp_ctx, &path)
        .map_err(|e| channel_error!(InvalidPath, "{:?}: {}", keygen, e))?;
    Ok(Keypair::from_secret_key(&secp_ctx, &child.private_key))
}

/// Derive the public key at `keygen`
pub fn derive_pubkey(seed: &[u8], keygen: &KeyGen) -> Result<secp256k1::PublicKey, ChannelError> {
    Ok(derive(seed, keygen)?.public_key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelErrorKind;
    use test_log::test;

    const SEED: [u8; 32] = [7u8; 32];

    #[test]
    fn derive_deterministic_test() {
        let keygen = KeyGen::channel(1, KeyPurpose::Fund, 2, 3);
        let a = derive(&SEED, &keygen).unwrap();
        let b = derive(&SEED, &keygen).unwrap();
        assert_eq!(a.secret_bytes(), b.secret_bytes());
        let other = derive(&SEED, &keygen.with_purpose(KeyPurpose::Refund)).unwrap();
        assert_ne!(a.public_key(), other.public_key());
        let other_seed = derive(&[8u8; 32], &keygen).unwrap();
        assert_ne!(a.public_key(), other_seed.public_key());
    }

    #[test]
    fn derive_bad_depth_test() {
        let mut keygen = KeyGen::htlc(1, 0, 3);
        keygen.depth = 0;
        assert_eq!(derive(&SEED, &keygen).unwrap_err().kind, ChannelErrorKind::InvalidPath);
        keygen.depth = 6;
        assert_eq!(derive(&SEED, &keygen).unwrap_err().kind, ChannelErrorKind::InvalidPath);
        keygen.depth = 3;
        assert!(derive(&SEED, &keygen).is_ok());
    }

    #[test]
    fn keygen_fields_test() {
        let keygen = KeyGen::htlc(5, 9, 11);
        assert_eq!(keygen.asset(), 5);
        assert_eq!(keygen.channel_idx(), 11);
        assert_eq!(keygen.steps[2], 0x4854 | HARDENED);
        assert_eq!(keygen.with_purpose(KeyPurpose::Hakd).steps[2], 40 | HARDENED);
        assert_ne!(
            derive_pubkey(&SEED, &KeyGen::htlc(5, 9, 11)).unwrap(),
            derive_pubkey(&SEED, &KeyGen::htlc(5, 10, 11)).unwrap()
        );
    }
}
