use bitcoin::blockdata::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_CLTV, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUAL,
    OP_EQUALVERIFY, OP_HASH160, OP_IF, OP_PUSHNUM_2, OP_SHA256, OP_SIZE,
};
use bitcoin::blockdata::script::Builder;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{ScriptBuf, WPubkeyHash, Witness};
use bitcoin::hashes::Hash;
use lightning::ln::chan_utils::make_funding_redeemscript;

use crate::htlc::PREIMAGE_LEN;
use crate::prelude::*;
use crate::util::crypto_utils::{hash160_of_key, signature_to_bitcoin_vec};

/// Per-state keys and terms of one HTLC output, from the commitment broadcaster's
/// point of view
#[derive(Clone, Debug, PartialEq)]
pub struct HtlcOutputInfo {
    /// HTLC slot index
    pub idx: u32,
    /// Whether the broadcaster offered the HTLC
    pub offered: bool,
    /// Amount in satoshi
    pub amount: i64,
    /// SHA256 of the preimage
    pub payment_hash: [u8; 32],
    /// CLTV height of the timeout path
    pub locktime: u32,
    /// Broadcaster HTLC key, tweaked by the broadcaster's per-state point
    pub broadcaster_key: PublicKey,
    /// Countersignatory HTLC key, tweaked by the broadcaster's per-state point
    pub countersignatory_key: PublicKey,
}

fn push_two_of_two(builder: Builder, info: &HtlcOutputInfo) -> Builder {
    builder
        .push_opcode(OP_PUSHNUM_2)
        .push_slice(info.countersignatory_key.serialize())
        .push_slice(info.broadcaster_key.serialize())
        .push_opcode(OP_PUSHNUM_2)
        .push_opcode(OP_CHECKMULTISIG)
}

fn push_single(builder: Builder, info: &HtlcOutputInfo) -> Builder {
    builder.push_slice(info.countersignatory_key.serialize()).push_opcode(OP_CHECKSIG)
}

/// The witness script of an HTLC output.
///
/// The countersignatory spends alone, and the broadcaster spends only through a
/// second-stage transaction the countersignatory co-signed.  The revocation key
/// holder can always spend.
pub fn htlc_redeemscript(revocation_key: &PublicKey, info: &HtlcOutputInfo) -> ScriptBuf {
    let mut builder = Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(hash160_of_key(revocation_key))
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE)
        .push_opcode(OP_SIZE)
        .push_int(PREIMAGE_LEN as i64)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_SHA256)
        .push_slice(info.payment_hash)
        .push_opcode(OP_EQUALVERIFY);
    builder = if info.offered { push_single(builder, info) } else { push_two_of_two(builder, info) };
    builder = builder
        .push_opcode(OP_ELSE)
        .push_opcode(OP_DROP)
        .push_int(info.locktime as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP);
    builder = if info.offered { push_two_of_two(builder, info) } else { push_single(builder, info) };
    builder.push_opcode(OP_ENDIF).push_opcode(OP_ENDIF).into_script()
}

/// The 2-of-2 funding script
pub fn funding_redeemscript(a: &PublicKey, b: &PublicKey) -> ScriptBuf {
    make_funding_redeemscript(a, b)
}

/// The witness spending the funding output, signatures in script key order
pub fn funding_witness(
    script: &ScriptBuf,
    a: (&PublicKey, Signature),
    b: (&PublicKey, Signature),
) -> Witness {
    let (first, second) = if a.0.serialize()[..] < b.0.serialize()[..] { (a, b) } else { (b, a) };
    Witness::from_slice(&[
        vec![],
        signature_to_bitcoin_vec(first.1),
        signature_to_bitcoin_vec(second.1),
        script.to_bytes(),
    ])
}

/// The witness of a broadcaster second-stage spend, co-signed by the countersignatory
pub fn htlc_two_of_two_witness(
    script: &ScriptBuf,
    countersignatory_sig: Signature,
    broadcaster_sig: Signature,
    preimage: Option<&[u8]>,
) -> Witness {
    Witness::from_slice(&[
        vec![],
        signature_to_bitcoin_vec(countersignatory_sig),
        signature_to_bitcoin_vec(broadcaster_sig),
        preimage.map(|p| p.to_vec()).unwrap_or_default(),
        script.to_bytes(),
    ])
}

/// The witness of a direct countersignatory spend
pub fn htlc_single_witness(script: &ScriptBuf, sig: Signature, preimage: Option<&[u8]>) -> Witness {
    Witness::from_slice(&[
        signature_to_bitcoin_vec(sig),
        preimage.map(|p| p.to_vec()).unwrap_or_default(),
        script.to_bytes(),
    ])
}

/// A P2WPKH output script for a key
pub fn p2wpkh_script(key: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::hash(&key.serialize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::script::Instruction;
    use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
    use test_log::test;

    fn key(b: u8) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &SecretKey::from_slice(&[b; 32]).unwrap())
    }

    fn info(offered: bool) -> HtlcOutputInfo {
        HtlcOutputInfo {
            idx: 0,
            offered,
            amount: 100,
            payment_hash: [5; 32],
            locktime: 1000,
            broadcaster_key: key(1),
            countersignatory_key: key(2),
        }
    }

    fn count_checksig(script: &ScriptBuf) -> (usize, usize) {
        let mut single = 0;
        let mut multi = 0;
        for ins in script.instructions() {
            match ins.unwrap() {
                Instruction::Op(op) if op == OP_CHECKSIG => single += 1,
                Instruction::Op(op) if op == OP_CHECKMULTISIG => multi += 1,
                _ => {}
            }
        }
        (single, multi)
    }

    #[test]
    fn htlc_script_shape_test() {
        let offered = htlc_redeemscript(&key(3), &info(true));
        let received = htlc_redeemscript(&key(3), &info(false));
        assert_ne!(offered, received);
        assert_eq!(count_checksig(&offered), (2, 1));
        assert_eq!(count_checksig(&received), (2, 1));
        let offered_str = format!("{:?}", offered);
        assert!(offered_str.contains("OP_CLTV"));
        assert!(offered_str.contains("OP_SIZE OP_PUSHNUM_16 OP_EQUAL"));
        assert!(offered_str.contains(&hex::encode([5u8; 32])));
        // the success path of an offered HTLC is the countersignatory alone
        let success = offered_str.split("OP_EQUALVERIFY").nth(1).unwrap();
        assert!(success.trim_start().starts_with("OP_PUSHBYTES_33"));
        assert!(success.split("OP_ELSE").next().unwrap().contains("OP_CHECKSIG"));
    }

    #[test]
    fn funding_witness_order_test() {
        let secp_ctx = Secp256k1::new();
        let msg = Message::from_digest([1; 32]);
        let (ka, kb) = (key(1), key(2));
        let sa = secp_ctx.sign_ecdsa(&msg, &SecretKey::from_slice(&[1; 32]).unwrap());
        let sb = secp_ctx.sign_ecdsa(&msg, &SecretKey::from_slice(&[2; 32]).unwrap());
        let script = funding_redeemscript(&ka, &kb);
        let w1 = funding_witness(&script, (&ka, sa), (&kb, sb));
        let w2 = funding_witness(&script, (&kb, sb), (&ka, sa));
        assert_eq!(w1, w2);
        assert_eq!(w1.len(), 4);
        assert!(w1.nth(0).unwrap().is_empty());
    }

    #[test]
    fn htlc_witness_test() {
        let secp_ctx = Secp256k1::new();
        let sig = secp_ctx
            .sign_ecdsa(&Message::from_digest([1; 32]), &SecretKey::from_slice(&[1; 32]).unwrap());
        let script = htlc_redeemscript(&key(3), &info(false));
        let w = htlc_single_witness(&script, sig, None);
        assert_eq!(w.len(), 3);
        assert!(w.nth(1).unwrap().is_empty());
        let w = htlc_two_of_two_witness(&script, sig, sig, Some(&[7u8; 16]));
        assert_eq!(w.len(), 5);
        assert_eq!(w.nth(3).unwrap(), &[7u8; 16]);
        assert_eq!(w.last().unwrap(), script.as_bytes());
    }
}
