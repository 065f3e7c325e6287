#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bitcoin::hashes::Hash;
    use bitcoin::{OutPoint, Txid};
    use test_log::test;

    use crate::channel::ChannelId;
    use crate::error::ChannelErrorKind;
    use crate::htlc::{payment_hash_of, ZERO_PREIMAGE};
    use crate::signer::KeyPurpose;
    use crate::util::test_utils::*;
    use crate::Arc;

    const PREIMAGE: [u8; 16] = [0x42; 16];
    const LOCKTIME: u32 = 1500;
    const CLOSE_HEIGHT: u32 = 1010;

    // A offers 100_000 to B on a (700_000, 300_000) channel
    fn setup() -> (TestNetwork, ChannelId) {
        let net = TestNetwork::new(2, test_config());
        let id = net.open_channel(0, 1, 0, 700_000, 300_000);
        net.nodes[0]
            .node
            .start_offer_htlc(&id, 100_000, payment_hash_of(&PREIMAGE), LOCKTIME, [0; 32])
            .unwrap();
        net.pump();
        (net, id)
    }

    // `breaker` broadcasts its commitment and both sides see it confirm
    fn close(net: &TestNetwork, id: &ChannelId, breaker: usize) -> Txid {
        let tx = net.nodes[breaker].node.break_channel(id).unwrap();
        let txid = tx.compute_txid();
        for node in &net.nodes {
            node.node.on_channel_closed(id, txid, CLOSE_HEIGHT).unwrap();
        }
        txid
    }

    #[test]
    fn break_channel_test() {
        let (net, id) = setup();
        let (mine, theirs) = net.nodes[1].node.get_close_txs(&id).unwrap();
        assert_eq!(net.nodes[0].node.get_close_txs(&id).unwrap().1, mine);
        let tx = net.nodes[1].node.break_channel(&id).unwrap();
        assert_eq!(tx.compute_txid(), mine.compute_txid());
        assert_ne!(tx.compute_txid(), theirs.compute_txid());
        assert_eq!(tx.input[0].witness.len(), 4);
        assert_eq!(net.nodes[1].wallet.broadcasts(), vec![tx]);
        let data = net.nodes[1].persister.load(&id);
        assert!(data.close_data.closed);
        let err = net.nodes[1].node.start_push(&id, 10_000, [0; 32]).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::Closed);
        let err = net.nodes[1].node.break_channel(&id).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::Closed);
    }

    #[test]
    fn break_channel_mid_handshake_test() {
        let net = TestNetwork::new(2, test_config());
        let id = net.open_channel(0, 1, 0, 700_000, 300_000);
        let (at_rest, _) = net.nodes[0].node.get_close_txs(&id).unwrap();
        net.nodes[0].node.start_push(&id, 10_000, [0; 32]).unwrap();
        // the proposal is unanswered, so only the state before it is countersigned
        let tx = net.nodes[0].node.break_channel(&id).unwrap();
        assert_eq!(tx.compute_txid(), at_rest.compute_txid());
    }

    #[test]
    fn claim_from_own_commitment_test() {
        let (net, id) = setup();
        let close_txid = close(&net, &id, 1);
        let b = &net.nodes[1];
        let tx = b.node.claim_htlc_on_chain(&id, 0, Some(PREIMAGE)).unwrap();

        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output.txid, close_txid);
        assert_eq!(tx.lock_time.to_consensus_u32(), 0);
        let witness = &tx.input[0].witness;
        assert_eq!(witness.len(), 5);
        assert_eq!(witness.nth(3).unwrap(), &PREIMAGE[..]);
        assert_eq!(tx.output[0].value.to_sat(), 99_000);

        let exports = b.wallet.exports();
        assert_eq!(exports.len(), 1);
        let utxo = &exports[0];
        assert_eq!(utxo.outpoint, OutPoint { txid: tx.compute_txid(), vout: 0 });
        assert_eq!(utxo.value, 99_000);
        assert_eq!(utxo.sequence, TEST_DELAY as u32);
        assert_eq!(utxo.height, CLOSE_HEIGHT);
        assert_eq!(utxo.pre_sig_stack, vec![Vec::<u8>::new()]);
        assert_eq!(utxo.witness_script.to_p2wsh(), tx.output[0].script_pubkey);
        let fund_keygen = b.node.with_channel(&id, |c| Ok(c.funding.keygen)).unwrap();
        assert_eq!(utxo.keygen, fund_keygen.with_purpose(KeyPurpose::Hakd));

        assert_eq!(*b.wallet.unwatched.lock().unwrap(), vec![tx.input[0].previous_output]);
        assert_eq!(b.wallet.broadcasts().last(), Some(&tx));
        assert!(b.persister.load(&id).state.htlcs[0].cleared_on_chain);
        let err = b.node.claim_htlc_on_chain(&id, 0, Some(PREIMAGE)).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::InvalidArgument);
    }

    #[test]
    fn claim_from_their_commitment_test() {
        let (net, id) = setup();
        let close_txid = close(&net, &id, 0);
        let b = &net.nodes[1];
        let err = b.node.claim_htlc_on_chain(&id, 0, Some([0x43; 16])).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::InvalidArgument);

        let txids = b.node.claim_htlc(PREIMAGE).unwrap();
        assert_eq!(txids.len(), 1);
        let tx = b.wallet.broadcasts().last().unwrap().clone();
        assert_eq!(tx.compute_txid(), txids[0]);
        assert_eq!(tx.input[0].previous_output.txid, close_txid);
        assert_eq!(tx.input[0].sequence.0, 0);
        assert_eq!(tx.lock_time.to_consensus_u32(), 0);
        assert_eq!(tx.input[0].witness.len(), 3);
        assert_eq!(tx.input[0].witness.nth(1).unwrap(), &PREIMAGE[..]);
        assert!(tx.output[0].script_pubkey.is_p2wpkh());
        assert_eq!(tx.output[0].value.to_sat(), 99_000);
        assert!(b.wallet.exports().is_empty());
    }

    #[test]
    fn timeout_claim_test() {
        let (net, id) = setup();
        close(&net, &id, 1);
        let a = &net.nodes[0];
        a.wallet.set_height(LOCKTIME - 1);
        let err = a.node.claim_htlc_on_chain(&id, 0, None).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::LocktimeNotExpired);
        assert!(a.node.claim_htlc_timeouts(TEST_ASSET, LOCKTIME - 1).unwrap().is_empty());

        a.wallet.set_height(LOCKTIME);
        let txids = a.node.claim_htlc_timeouts(TEST_ASSET, LOCKTIME).unwrap();
        assert_eq!(txids.len(), 1);
        let tx = a.wallet.broadcasts().last().unwrap().clone();
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.lock_time.to_consensus_u32(), LOCKTIME);
        let witness = &tx.input[0].witness;
        assert_eq!(witness.len(), 3);
        assert!(witness.nth(1).unwrap().is_empty());
        // already claimed
        assert!(a.node.claim_htlc_timeouts(TEST_ASSET, LOCKTIME).unwrap().is_empty());
    }

    #[test]
    fn timeout_from_own_commitment_test() {
        let (net, id) = setup();
        close(&net, &id, 0);
        let a = &net.nodes[0];
        a.wallet.set_height(LOCKTIME);
        let tx = a.node.claim_htlc_on_chain(&id, 0, None).unwrap();
        assert_eq!(tx.lock_time.to_consensus_u32(), LOCKTIME);
        assert_eq!(tx.input[0].witness.len(), 5);
        assert!(tx.input[0].witness.nth(3).unwrap().is_empty());
        assert_eq!(a.wallet.exports().len(), 1);
    }

    #[test]
    fn claim_needs_known_close_test() {
        let (net, id) = setup();
        let b = &net.nodes[1];
        let err = b.node.claim_htlc_on_chain(&id, 0, Some(PREIMAGE)).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::InvalidArgument);

        b.node.on_channel_closed(&id, Txid::from_byte_array([0xee; 32]), CLOSE_HEIGHT).unwrap();
        let err = b.node.claim_htlc_on_chain(&id, 0, Some(PREIMAGE)).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::Reconstruction);
        // a failed claim is skipped
        assert!(b.node.claim_htlc(PREIMAGE).unwrap().is_empty());
    }

    #[test]
    fn htlc_lookup_test() {
        let (net, id) = setup();
        let (a, b) = (&net.nodes[0], &net.nodes[1]);
        let (_, theirs) = b.node.get_close_txs(&id).unwrap();
        let vout = theirs.output.iter().position(|o| o.value.to_sat() == 100_000).unwrap();
        let outpoint = OutPoint { txid: theirs.compute_txid(), vout: vout as u32 };
        let (found_id, htlc) = b.node.get_htlc(&outpoint).unwrap();
        assert_eq!(found_id, id);
        assert!(htlc.incoming);
        assert_eq!(htlc.idx, 0);
        assert!(a.node.get_htlc(&outpoint).is_err());

        let hash = payment_hash_of(&PREIMAGE);
        assert_eq!(a.node.find_htlcs_by_hash(&hash).unwrap().len(), 1);
        assert!(b.node.find_htlcs_by_hash(&[0; 32]).unwrap().is_empty());
        assert_eq!(a.node.find_htlcs_by_timeout_height(TEST_ASSET, LOCKTIME).unwrap().len(), 1);
        assert!(a.node.find_htlcs_by_timeout_height(TEST_ASSET, LOCKTIME - 1).unwrap().is_empty());
        assert!(a.node.find_htlcs_by_timeout_height(TEST_ASSET + 1, LOCKTIME).unwrap().is_empty());
        assert!(b.node.find_htlcs_by_timeout_height(TEST_ASSET, LOCKTIME).unwrap().is_empty());

        b.node.set_htlc_cleared_on_chain(&id, 0).unwrap();
        assert!(b.persister.load(&id).state.htlcs[0].cleared_on_chain);
        assert!(b.node.set_htlc_cleared_on_chain(&id, 5).is_err());
    }

    #[test]
    fn timeouts_on_open_channel_test() {
        let (net, id) = setup();
        let net = Arc::new(net);
        for node in &net.nodes {
            node.wallet.set_height(LOCKTIME);
        }
        let _pump = net.spawn_pump();
        let txids = net.nodes[0].node.claim_htlc_timeouts(TEST_ASSET, LOCKTIME).unwrap();
        assert!(txids.is_empty());
        assert!(wait_until(Duration::from_secs(5), || {
            net.nodes.iter().all(|n| n.data(&id).state.htlcs[0].cleared)
        }));
        assert_eq!(net.nodes[0].balances(&id), (700_000, 300_000));
    }

    #[test]
    fn multihop_claim_test() {
        let net = TestNetwork::new(3, test_config());
        let ab = net.open_channel(0, 1, 0, 700_000, 300_000);
        let bc = net.open_channel(1, 2, 1, 500_000, 200_000);
        let hash = payment_hash_of(&PREIMAGE);
        net.nodes[0].node.start_offer_htlc(&ab, 100_000, hash, LOCKTIME + 10, [0; 32]).unwrap();
        net.pump();
        net.nodes[1].node.register_multihop(hash, 90_000, Some(ab), bc).unwrap();
        net.nodes[1].node.start_offer_htlc(&bc, 90_000, hash, LOCKTIME, [0; 32]).unwrap();
        net.pump();

        // C reveals to B, and B pulls the payment from A in the background
        net.nodes[2].node.start_clear_htlc(&bc, 0, PREIMAGE, [0; 32]).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            for result in net.deliver_all() {
                result.unwrap();
            }
            net.nodes[1].node.multihops()[0].succeeded
        }));
        assert!(wait_until(Duration::from_secs(5), || {
            net.deliver_all().into_iter().for_each(|r| r.unwrap());
            net.nodes[0].data(&ab).state.htlcs[0].cleared
        }));

        assert_eq!(net.nodes[0].balances(&ab), (600_000, 400_000));
        assert_eq!(net.nodes[1].balances(&ab), (400_000, 600_000));
        assert_eq!(net.nodes[1].balances(&bc), (410_000, 290_000));
        let record = &net.nodes[1].persister.multihops()[0];
        assert_eq!(record.preimage, Some(PREIMAGE));
        assert!(record.succeeded);
    }

    #[test]
    fn claim_with_unanswered_clear_test() {
        let (net, id) = setup();
        let b = &net.nodes[1];
        b.node.start_clear_htlc(&id, 0, PREIMAGE, [0; 32]).unwrap();
        // the PreimageSig never reaches A
        assert_eq!(b.transport.take().len(), 1);
        let close_txid = close(&net, &id, 0);

        let txids = b.node.claim_htlc(PREIMAGE).unwrap();
        assert_eq!(txids.len(), 1);
        let tx = b.wallet.broadcasts().last().unwrap().clone();
        assert_eq!(tx.input[0].previous_output.txid, close_txid);
        assert_eq!(tx.input[0].witness.nth(1).unwrap(), &PREIMAGE[..]);
        assert!(b.data(&id).state.htlcs[0].cleared_on_chain);
        assert!(b.node.claim_htlc(PREIMAGE).unwrap().is_empty());
    }

    #[test]
    fn timeout_with_unanswered_clear_test() {
        let (net, id) = setup();
        let a = &net.nodes[0];
        a.wallet.set_height(LOCKTIME);
        a.node.start_clear_htlc(&id, 0, ZERO_PREIMAGE, [0; 32]).unwrap();
        assert_eq!(a.transport.take().len(), 1);
        let close_txid = close(&net, &id, 1);

        let txids = a.node.claim_htlc_timeouts(TEST_ASSET, LOCKTIME).unwrap();
        assert_eq!(txids.len(), 1);
        let tx = a.wallet.broadcasts().last().unwrap().clone();
        assert_eq!(tx.input[0].previous_output.txid, close_txid);
        assert_eq!(tx.lock_time.to_consensus_u32(), LOCKTIME);
        assert!(a.node.claim_htlc_timeouts(TEST_ASSET, LOCKTIME).unwrap().is_empty());
    }

    #[test]
    fn open_channel_skips_clearing_htlc_test() {
        let (net, id) = setup();
        let b = &net.nodes[1];
        b.node.start_clear_htlc(&id, 0, PREIMAGE, [0; 32]).unwrap();
        b.transport.take();
        // the clear in flight owns the htlc while the channel is open
        assert!(b.node.claim_htlc(PREIMAGE).unwrap().is_empty());
        assert!(b.transport.take().is_empty());
        assert!(!b.data(&id).state.failed);
    }
}
