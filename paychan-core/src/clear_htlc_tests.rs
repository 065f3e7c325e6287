#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::channel::{ChannelId, UpdateInFlight};
    use crate::error::ChannelErrorKind;
    use crate::htlc::{payment_hash_of, ZERO_PREIMAGE};
    use crate::util::test_utils::*;

    const PREIMAGE: [u8; 16] = [0x42; 16];
    const LOCKTIME: u32 = 1500;

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

    #[test]
    fn clear_by_preimage_test() {
        let (net, id) = setup();
        net.nodes[1].node.start_clear_htlc(&id, 0, PREIMAGE, [3; 32]).unwrap();
        net.pump();
        assert_eq!(net.nodes[0].balances(&id), (600_000, 400_000));
        assert_eq!(net.nodes[1].balances(&id), (400_000, 600_000));
        for node in &net.nodes {
            let data = node.data(&id);
            assert_eq!(data.state.state_index, 2);
            assert!(data.state.htlcs[0].cleared);
            assert_eq!(data.state.htlcs[0].preimage, Some(PREIMAGE));
            assert!(data.state.live_htlcs().is_empty());
        }
        assert_eq!(net.nodes[0].data(&id).state.data, [3; 32]);
    }

    #[test]
    fn clear_by_timeout_test() {
        let (net, id) = setup();
        let a = &net.nodes[0];
        a.wallet.set_height(LOCKTIME - 1);
        let err = a.node.start_clear_htlc(&id, 0, ZERO_PREIMAGE, [0; 32]).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::LocktimeNotExpired);
        assert_eq!(a.node.with_channel(&id, |c| Ok(c.update)).unwrap(), UpdateInFlight::Idle);

        // locktime == height is expired
        a.wallet.set_height(LOCKTIME);
        net.nodes[1].wallet.set_height(LOCKTIME);
        a.node.start_clear_htlc(&id, 0, ZERO_PREIMAGE, [0; 32]).unwrap();
        net.pump();
        assert_eq!(a.balances(&id), (700_000, 300_000));
        assert!(net.nodes[1].data(&id).state.htlcs[0].is_timeout());
    }

    #[test]
    fn responder_rejects_early_timeout_test() {
        let (net, id) = setup();
        net.nodes[0].wallet.set_height(LOCKTIME);
        // B has not seen the locktime block yet
        net.nodes[1].wallet.set_height(LOCKTIME - 10);
        net.nodes[0].node.start_clear_htlc(&id, 0, ZERO_PREIMAGE, [0; 32]).unwrap();
        let results = net.deliver_from(0);
        assert_eq!(results[0].as_ref().unwrap_err().kind, ChannelErrorKind::Protocol);
        assert!(net.nodes[1].persister.load(&id).state.failed);
    }

    #[test]
    fn clear_wrong_direction_test() {
        let (net, id) = setup();
        // the offerer cannot reveal, and the receiver cannot time out
        let err = net.nodes[0].node.start_clear_htlc(&id, 0, PREIMAGE, [0; 32]).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::InvalidArgument);
        let err = net.nodes[1].node.start_clear_htlc(&id, 0, ZERO_PREIMAGE, [0; 32]).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::InvalidArgument);
        for node in &net.nodes {
            assert!(!node.data(&id).state.failed);
        }
    }

    #[test]
    fn clear_wrong_preimage_fails_channel_test() {
        let (net, id) = setup();
        let err = net.nodes[1].node.start_clear_htlc(&id, 0, [0x43; 16], [0; 32]).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::Failed);
        assert!(net.nodes[1].persister.load(&id).state.failed);
        assert_eq!(net.nodes[1].transport.pending(), 0);
    }

    #[test]
    fn clear_unknown_htlc_fails_channel_test() {
        let (net, id) = setup();
        let err = net.nodes[1].node.start_clear_htlc(&id, 1, PREIMAGE, [0; 32]).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::Failed);
        assert!(net.nodes[1].data(&id).state.failed);
    }

    #[test]
    fn clear_twice_fails_channel_test() {
        let (net, id) = setup();
        net.nodes[1].node.start_clear_htlc(&id, 0, PREIMAGE, [0; 32]).unwrap();
        net.pump();
        let err = net.nodes[1].node.start_clear_htlc(&id, 0, PREIMAGE, [0; 32]).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::Failed);
    }

    #[test]
    fn offer_and_clear_both_directions_test() {
        let (net, id) = setup();
        let preimage = [0x17; 16];
        net.nodes[1]
            .node
            .start_offer_htlc(&id, 50_000, payment_hash_of(&preimage), LOCKTIME, [0; 32])
            .unwrap();
        net.pump();
        net.nodes[0].node.start_clear_htlc(&id, 1, preimage, [0; 32]).unwrap();
        net.pump();
        net.nodes[1].node.start_clear_htlc(&id, 0, PREIMAGE, [0; 32]).unwrap();
        net.pump();
        assert_eq!(net.nodes[0].balances(&id), (650_000, 350_000));
        assert_eq!(net.nodes[1].balances(&id), (350_000, 650_000));
        let data = net.nodes[0].data(&id);
        assert_eq!(data.state.state_index, 4);
        assert_eq!(data.state.htlc_idx, 2);
        assert!(data.state.htlcs.iter().all(|h| h.cleared));
    }
}
