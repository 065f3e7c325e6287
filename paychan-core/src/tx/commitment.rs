use core::cmp;

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{self, ecdsa::Signature, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use lightning::ln::chan_utils::get_revokeable_redeemscript;
use lightning::ln::channel_keys::{DelayedPaymentKey, RevocationKey};

use crate::error::ChannelError;
use crate::prelude::*;
use crate::tx::script::{htlc_redeemscript, p2wpkh_script, HtlcOutputInfo};
use crate::util::crypto_utils::{derive_delayed_key, derive_revocation_key, sighash_message};

/// Keys of one commitment, from its broadcaster's point of view
#[derive(Clone, Debug)]
pub struct CommitmentKeys {
    /// The broadcaster's per-state point
    pub per_commitment_point: PublicKey,
    /// Spends any output of this commitment once it is revoked
    pub revocation_key: PublicKey,
    /// Spends the broadcaster's outputs after the delay
    pub delayed_key: PublicKey,
    /// Receives the countersignatory's balance
    pub to_remote_key: PublicKey,
}

impl CommitmentKeys {
    /// Tweak the static keys of both parties with the broadcaster's point
    pub fn new<T: secp256k1::Signing + secp256k1::Verification>(
        secp_ctx: &Secp256k1<T>,
        per_commitment_point: &PublicKey,
        broadcaster_hakd_base: &PublicKey,
        countersignatory_hakd_base: &PublicKey,
        countersignatory_refund: &PublicKey,
    ) -> Self {
        let revocation_key =
            derive_revocation_key(secp_ctx, per_commitment_point, countersignatory_hakd_base);
        let delayed_key = derive_delayed_key(secp_ctx, per_commitment_point, broadcaster_hakd_base);
        CommitmentKeys {
            per_commitment_point: *per_commitment_point,
            revocation_key: revocation_key.to_public_key(),
            delayed_key: delayed_key.to_public_key(),
            to_remote_key: *countersignatory_refund,
        }
    }

    /// The CSV-delayed script guarding the broadcaster's funds
    pub fn revokeable_script(&self, delay: u16) -> ScriptBuf {
        get_revokeable_redeemscript(
            &RevocationKey(self.revocation_key),
            delay,
            &DelayedPaymentKey(self.delayed_key),
        )
    }
}

/// Terms of one commitment
#[derive(Clone, Debug)]
pub struct CommitmentParams {
    /// The funding output spent by the commitment
    pub funding_outpoint: OutPoint,
    /// The obscured state index
    pub obscured_state_index: u64,
    /// CSV delay on the broadcaster's outputs
    pub delay: u16,
    /// Broadcaster balance
    pub broadcaster_amount: i64,
    /// Countersignatory balance
    pub countersignatory_amount: i64,
    /// Fee taken from each balance output
    pub fee: i64,
}

/// A built commitment transaction with the scripts of its outputs
#[derive(Clone, Debug)]
pub struct CommitmentTx {
    /// The unsigned transaction
    pub tx: Transaction,
    /// The output index, info and witness script of each HTLC output
    pub htlc_outputs: Vec<(u32, HtlcOutputInfo, ScriptBuf)>,
    /// The broadcaster's delayed balance output, if present
    pub to_local: Option<(u32, ScriptBuf)>,
}

impl CommitmentTx {
    /// The output of HTLC slot `idx`
    pub fn htlc_output(&self, idx: u32) -> Option<&(u32, HtlcOutputInfo, ScriptBuf)> {
        self.htlc_outputs.iter().find(|(_, info, _)| info.idx == idx)
    }
}

fn sort_outputs<T, C: Fn(&T, &T) -> cmp::Ordering>(outputs: &mut Vec<(TxOut, T)>, tie_breaker: C) {
    outputs.sort_by(|a, b| {
        a.0.value.cmp(&b.0.value).then_with(|| {
            a.0.script_pubkey[..].cmp(&b.0.script_pubkey[..]).then_with(|| tie_breaker(&a.1, &b.1))
        })
    });
}

fn positive_amount(value: i64) -> Option<Amount> {
    if value > 0 {
        Some(Amount::from_sat(value as u64))
    } else {
        None
    }
}

/// Locktime and sequence carrying an obscured state index
pub fn encode_state_index(obscured: u64) -> (LockTime, Sequence) {
    let locktime = LockTime::from_consensus((0x20 << 8 * 3) | (obscured & 0xffffff) as u32);
    let sequence = Sequence((0x80 << 8 * 3) | ((obscured >> 3 * 8) & 0xffffff) as u32);
    (locktime, sequence)
}

/// Recover the state index of a commitment, given the obscure factor
pub fn state_index_from_tx(tx: &Transaction, obscure_factor: u64) -> Option<u64> {
    if tx.input.len() != 1 {
        return None;
    }
    if (tx.input[0].sequence.0 >> 8 * 3) as u8 != 0x80
        || (tx.lock_time.to_consensus_u32() >> 8 * 3) as u8 != 0x20
    {
        return None;
    }
    let obscured = ((tx.input[0].sequence.0 as u64 & 0xffffff) << 3 * 8)
        | (tx.lock_time.to_consensus_u32() as u64 & 0xffffff);
    Some(obscured ^ obscure_factor)
}

/// Build a commitment transaction.
///
/// Balance outputs at or below the fee are omitted.  Outputs are in BIP-69
/// order, HTLCs tie-broken by slot index.
pub fn build_commitment_tx(
    params: &CommitmentParams,
    keys: &CommitmentKeys,
    htlcs: &[HtlcOutputInfo],
) -> CommitmentTx {
    enum Kind {
        ToLocal(ScriptBuf),
        ToRemote,
        Htlc(HtlcOutputInfo, ScriptBuf),
    }
    let mut txouts: Vec<(TxOut, Kind)> = Vec::new();

    if let Some(value) = positive_amount(params.broadcaster_amount - params.fee) {
        let script = keys.revokeable_script(params.delay);
        txouts.push((TxOut { value, script_pubkey: script.to_p2wsh() }, Kind::ToLocal(script)));
    }
    if let Some(value) = positive_amount(params.countersignatory_amount - params.fee) {
        txouts.push((
            TxOut { value, script_pubkey: p2wpkh_script(&keys.to_remote_key) },
            Kind::ToRemote,
        ));
    }
    for info in htlcs {
        if let Some(value) = positive_amount(info.amount) {
            let script = htlc_redeemscript(&keys.revocation_key, info);
            txouts.push((
                TxOut { value, script_pubkey: script.to_p2wsh() },
                Kind::Htlc(info.clone(), script),
            ));
        }
    }

    sort_outputs(&mut txouts, |a, b| match (a, b) {
        (Kind::Htlc(ai, _), Kind::Htlc(bi, _)) => ai.idx.cmp(&bi.idx),
        _ => cmp::Ordering::Equal,
    });

    let (lock_time, sequence) = encode_state_index(params.obscured_state_index);
    let mut tx = Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: params.funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: Vec::with_capacity(txouts.len()),
    };
    let mut htlc_outputs = Vec::new();
    let mut to_local = None;
    for (vout, (txout, kind)) in txouts.into_iter().enumerate() {
        tx.output.push(txout);
        match kind {
            Kind::ToLocal(script) => to_local = Some((vout as u32, script)),
            Kind::Htlc(info, script) => htlc_outputs.push((vout as u32, info, script)),
            Kind::ToRemote => {}
        }
    }
    CommitmentTx { tx, htlc_outputs, to_local }
}

/// Build the broadcaster's second-stage transaction for an HTLC output.
///
/// A timeout spend of an offered HTLC carries the HTLC locktime.
pub fn build_htlc_tx(
    commitment_txid: bitcoin::Txid,
    vout: u32,
    info: &HtlcOutputInfo,
    keys: &CommitmentKeys,
    delay: u16,
    fee: i64,
) -> Transaction {
    let lock_time = if info.offered {
        LockTime::from_consensus(info.locktime)
    } else {
        LockTime::ZERO
    };
    let value = Amount::from_sat((info.amount - fee).max(0) as u64);
    Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: OutPoint { txid: commitment_txid, vout },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut { value, script_pubkey: keys.revokeable_script(delay).to_p2wsh() }],
    }
}

fn sighash(
    tx: &Transaction,
    input: usize,
    script: &ScriptBuf,
    value: i64,
) -> Result<secp256k1::Message, ChannelError> {
    let sighash = SighashCache::new(tx)
        .p2wsh_signature_hash(input, script, Amount::from_sat(value as u64), EcdsaSighashType::All)
        .map_err(|e| channel_error!(Internal, "sighash: {}", e))?;
    Ok(sighash_message(sighash))
}

/// Sign a P2WSH input
pub fn sign_input<T: secp256k1::Signing>(
    secp_ctx: &Secp256k1<T>,
    tx: &Transaction,
    input: usize,
    script: &ScriptBuf,
    value: i64,
    key: &SecretKey,
) -> Result<Signature, ChannelError> {
    let msg = sighash(tx, input, script, value)?;
    Ok(secp_ctx.sign_ecdsa(&msg, key))
}

/// Verify a signature on a P2WSH input
pub fn verify_input<T: secp256k1::Verification>(
    secp_ctx: &Secp256k1<T>,
    tx: &Transaction,
    input: usize,
    script: &ScriptBuf,
    value: i64,
    sig: &Signature,
    key: &PublicKey,
) -> Result<(), ChannelError> {
    let msg = sighash(tx, input, script, value)?;
    secp_ctx
        .verify_ecdsa(&msg, sig, key)
        .map_err(|_| channel_error!(Protocol, "bad signature on input {} of {}", input, tx.compute_txid()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;
    use lightning::ln::chan_utils::get_commitment_transaction_number_obscure_factor;
    use test_log::test;

    fn secret(b: u8) -> SecretKey {
        SecretKey::from_slice(&[b; 32]).unwrap()
    }

    fn key(b: u8) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &secret(b))
    }

    fn keys() -> CommitmentKeys {
        CommitmentKeys::new(&Secp256k1::new(), &key(9), &key(1), &key(2), &key(3))
    }

    fn htlc(idx: u32, offered: bool, amount: i64) -> HtlcOutputInfo {
        HtlcOutputInfo {
            idx,
            offered,
            amount,
            payment_hash: [idx as u8; 32],
            locktime: 700,
            broadcaster_key: key(4),
            countersignatory_key: key(5),
        }
    }

    fn params(broadcaster_amount: i64, countersignatory_amount: i64) -> CommitmentParams {
        CommitmentParams {
            funding_outpoint: OutPoint { txid: Txid::all_zeros(), vout: 1 },
            obscured_state_index: 42,
            delay: 144,
            broadcaster_amount,
            countersignatory_amount,
            fee: 10,
        }
    }

    #[test]
    fn commitment_outputs_test() {
        let keys = keys();
        let htlcs = vec![htlc(1, false, 100), htlc(0, true, 100)];
        let ctx = build_commitment_tx(&params(600, 300), &keys, &htlcs);
        let values: Vec<u64> = ctx.tx.output.iter().map(|o| o.value.to_sat()).collect();
        assert_eq!(values, vec![100, 100, 290, 590]);
        // equal HTLC values fall back to script order or slot order
        assert_eq!(ctx.htlc_outputs.len(), 2);
        let (vout, _, script) = ctx.htlc_output(1).unwrap();
        assert_eq!(ctx.tx.output[*vout as usize].script_pubkey, script.to_p2wsh());
        let (vout, script) = ctx.to_local.as_ref().unwrap();
        assert_eq!(*vout, 3);
        assert_eq!(ctx.tx.output[3].script_pubkey, script.to_p2wsh());
        assert_eq!(ctx.tx.output[2].script_pubkey, p2wpkh_script(&key(3)));
    }

    #[test]
    fn commitment_omits_dust_balance_test() {
        let ctx = build_commitment_tx(&params(10, 300), &keys(), &[]);
        assert_eq!(ctx.tx.output.len(), 1);
        assert!(ctx.to_local.is_none());
    }

    #[test]
    fn state_index_obscured_test() {
        let factor = get_commitment_transaction_number_obscure_factor(&key(1), &key(2), true);
        let mut p = params(600, 300);
        p.obscured_state_index = 123456789 ^ factor;
        let ctx = build_commitment_tx(&p, &keys(), &[]);
        assert_eq!(state_index_from_tx(&ctx.tx, factor), Some(123456789));
        assert_ne!(ctx.tx.lock_time.to_consensus_u32() & 0xffffff, 123456789 & 0xffffff);
    }

    #[test]
    fn htlc_tx_test() {
        let keys = keys();
        let ctx = build_commitment_tx(&params(600, 300), &keys, &[htlc(0, true, 100)]);
        let (vout, info, script) = ctx.htlc_output(0).unwrap().clone();
        let txid = ctx.tx.compute_txid();
        let timeout = build_htlc_tx(txid, vout, &info, &keys, 144, 10);
        assert_eq!(timeout.lock_time.to_consensus_u32(), 700);
        assert_eq!(timeout.output[0].value.to_sat(), 90);
        assert_eq!(timeout.input[0].sequence, Sequence::ZERO);
        let success = build_htlc_tx(txid, vout, &htlc(0, false, 100), &keys, 144, 10);
        assert_eq!(success.lock_time, LockTime::ZERO);

        let secp_ctx = Secp256k1::new();
        let sig = sign_input(&secp_ctx, &timeout, 0, &script, 100, &secret(5)).unwrap();
        verify_input(&secp_ctx, &timeout, 0, &script, 100, &sig, &key(5)).unwrap();
        assert!(verify_input(&secp_ctx, &timeout, 0, &script, 101, &sig, &key(5)).is_err());
        assert!(verify_input(&secp_ctx, &timeout, 0, &script, 100, &sig, &key(4)).is_err());
    }
}
