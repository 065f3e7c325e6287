use crate::prelude::*;
use bitcoin::hashes::sha256::Hash as BitcoinSha256;
use bitcoin::hashes::{hash160, Hash, HashEngine, Hmac, HmacEngine};
use bitcoin::secp256k1::{self, ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SegwitV0Sighash};
use lightning::ln::channel_keys::{
    DelayedPaymentBasepoint, DelayedPaymentKey, RevocationBasepoint, RevocationKey,
};

/// A 64-byte compact ECDSA signature
pub type CompactSignature = [u8; 64];

/// Derive a 32-byte secret from another secret using HKDF-SHA256
pub fn hkdf_sha256(secret: &[u8], info: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut hmac = HmacEngine::<BitcoinSha256>::new(salt);
    hmac.input(secret);
    let prk = Hmac::from_engine(hmac).to_byte_array();

    let mut hmac = HmacEngine::<BitcoinSha256>::new(&prk[..]);
    hmac.input(info);
    hmac.input(&[1u8]);
    Hmac::from_engine(hmac).to_byte_array()
}

/// Tweak a base point with a per-commitment point:
/// `base + sha256(per_commitment_point || base) * G`
pub(crate) fn derive_public_key<T: secp256k1::Signing>(
    secp_ctx: &Secp256k1<T>,
    per_commitment_point: &PublicKey,
    base_point: &PublicKey,
) -> Result<PublicKey, secp256k1::Error> {
    let mut sha = BitcoinSha256::engine();
    sha.input(&per_commitment_point.serialize());
    sha.input(&base_point.serialize());
    let res = BitcoinSha256::from_engine(sha).to_byte_array();

    let hashkey = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&res)?);
    base_point.combine(&hashkey)
}

/// The revocation key for a commitment broadcast by the owner of `per_commitment_point`
pub(crate) fn derive_revocation_key<T: secp256k1::Verification>(
    secp_ctx: &Secp256k1<T>,
    per_commitment_point: &PublicKey,
    countersignatory_base: &PublicKey,
) -> RevocationKey {
    RevocationKey::from_basepoint(
        secp_ctx,
        &RevocationBasepoint::from(*countersignatory_base),
        per_commitment_point,
    )
}

/// The delayed key guarding the broadcaster's own output
pub(crate) fn derive_delayed_key<T: secp256k1::Signing>(
    secp_ctx: &Secp256k1<T>,
    per_commitment_point: &PublicKey,
    broadcaster_base: &PublicKey,
) -> DelayedPaymentKey {
    DelayedPaymentKey::from_basepoint(
        secp_ctx,
        &DelayedPaymentBasepoint::from(*broadcaster_base),
        per_commitment_point,
    )
}

/// The public point of a revocation-chain element
pub fn point_from_secret<T: secp256k1::Signing>(
    secp_ctx: &Secp256k1<T>,
    secret: &[u8; 32],
) -> Result<PublicKey, secp256k1::Error> {
    Ok(PublicKey::from_secret_key(secp_ctx, &SecretKey::from_slice(secret)?))
}

/// Convert a [Signature] to Bitcoin signature bytes, with SIGHASH_ALL
pub fn signature_to_bitcoin_vec(sig: Signature) -> Vec<u8> {
    let mut sigvec = sig.serialize_der().to_vec();
    sigvec.push(EcdsaSighashType::All as u8);
    sigvec
}

/// Compact form of a signature, for storage and the wire
pub fn to_compact(sig: &Signature) -> CompactSignature {
    sig.serialize_compact()
}

/// Parse a compact signature
pub fn from_compact(bytes: &CompactSignature) -> Result<Signature, secp256k1::Error> {
    Signature::from_compact(bytes)
}

pub(crate) fn sighash_message(sighash: SegwitV0Sighash) -> Message {
    Message::from_digest(sighash.to_byte_array())
}

/// Single SHA256
pub fn sha256(data: &[u8]) -> [u8; 32] {
    BitcoinSha256::hash(data).to_byte_array()
}

pub(crate) fn hash160_of_key(key: &PublicKey) -> [u8; 20] {
    hash160::Hash::hash(&key.serialize()).to_byte_array()
}
