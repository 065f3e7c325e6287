use serde_derive::{Deserialize, Serialize};

use crate::channel::{CloseData, FundingDescriptor, StaticPubkeys};
use crate::persist::Error;
use crate::prelude::*;
use crate::revocation::RevocationReceiver;
use crate::state::ChannelState;

/// The durable envelope of a channel.
///
/// Our own keys and revocation sender are not stored; they are derived again
/// from `funding.keygen` on load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelData {
    /// The funding output and the path of our funding key
    pub funding: FundingDescriptor,
    /// The counterparty
    pub peer_idx: u32,
    /// We opened the channel
    pub is_outbound: bool,
    /// CSV delay on broadcaster outputs
    pub delay: u16,
    /// Close status
    pub close_data: CloseData,
    /// The counterparty's static keys
    pub their_pubkeys: StaticPubkeys,
    /// Revocation secrets received from the counterparty
    pub their_revocations: RevocationReceiver,
    /// The ledger
    pub state: ChannelState,
    /// Unix time of the last committed update
    pub last_update: u64,
}

impl ChannelData {
    /// Serialize for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|e| Error::Internal(format!("encode channel: {}", e)))
    }

    /// Deserialize from storage
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::Internal(format!("decode channel: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htlc::tests::make_htlc;
    use crate::revocation::RevocationSender;
    use crate::signer::{KeyGen, KeyPurpose};
    use crate::state::tests::make_state;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use bitcoin::{OutPoint, Txid};
    use test_log::test;

    fn make_data() -> ChannelData {
        let secp_ctx = Secp256k1::new();
        let key = |b| PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[b; 32]).unwrap());
        let mut state = make_state(700);
        state.htlcs.push(make_htlc(0, true, 100, &[4; 16]));
        state.htlc_idx = 1;
        state.their_sig = Some([8; 64]);
        let sender = RevocationSender::new([3; 32]);
        let mut their_revocations = RevocationReceiver::new();
        for i in 0..5 {
            their_revocations.insert(i, sender.at(i)).unwrap();
        }
        ChannelData {
            funding: FundingDescriptor {
                outpoint: OutPoint { txid: Txid::from_byte_array([7; 32]), vout: 1 },
                value: 1_100_000,
                keygen: KeyGen::channel(1, KeyPurpose::Fund, 2, 3),
                height: 100,
                asset: 1,
            },
            peer_idx: 2,
            is_outbound: true,
            delay: 144,
            close_data: CloseData::default(),
            their_pubkeys: StaticPubkeys { fund: key(10), refund: key(11), hakd_base: key(12) },
            their_revocations,
            state,
            last_update: 1_700_000_000,
        }
    }

    #[test]
    fn channel_data_bytes_test() {
        let data = make_data();
        let bytes = data.to_bytes().unwrap();
        let restored = ChannelData::from_bytes(&bytes).unwrap();
        assert_eq!(restored, data);
        assert_eq!(restored.their_revocations.at(3), Some(RevocationSender::new([3; 32]).at(3)));
        assert_eq!(restored.their_revocations.next_index(), 5);
    }

    #[test]
    fn channel_data_truncated_test() {
        let bytes = make_data().to_bytes().unwrap();
        let err = ChannelData::from_bytes(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
