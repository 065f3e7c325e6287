use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{OutPoint, ScriptBuf, Transaction, WPubkeyHash};
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};

use crate::error::ChannelError;
use crate::msgs::Message;
use crate::prelude::*;
use crate::signer::KeyGen;

/// Parameters of an asset sub-ledger
#[derive(Clone, Debug, PartialEq)]
pub struct AssetParams {
    /// Test networks skip the funding confirmation requirement
    pub test_network: bool,
}

/// A spendable output handed to the wallet for sweeping
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UtxoDescriptor {
    /// The output
    pub outpoint: OutPoint,
    /// Its value
    pub value: i64,
    /// Path of the base key that, tweaked by `per_commitment_point`, signs for it
    pub keygen: KeyGen,
    /// Tweak for the base key
    pub per_commitment_point: PublicKey,
    /// The P2WSH witness script
    pub witness_script: ScriptBuf,
    /// Relative locktime required to spend
    pub sequence: u32,
    /// Witness elements pushed after the signature, before the script
    #[serde_as(as = "Vec<IfIsHumanReadable<Hex, Bytes>>")]
    pub pre_sig_stack: Vec<Vec<u8>>,
    /// Height at which the output confirmed
    pub height: u32,
}

/// The chain and key-storage collaborator
pub trait Wallet: SendSync {
    /// Current block height of the asset's chain
    fn current_height(&self, asset: u32) -> Result<u32, ChannelError>;

    /// Parameters of the asset, or `None` if its sub-ledger is not reachable
    fn asset_params(&self, asset: u32) -> Option<AssetParams>;

    /// Derive the private key at `keygen`
    fn derive_private_key(&self, keygen: &KeyGen) -> Result<SecretKey, ChannelError>;

    /// Broadcast a transaction
    fn broadcast(&self, asset: u32, tx: &Transaction) -> Result<(), ChannelError>;

    /// A fresh pubkey hash to receive swept funds
    fn new_address(&self, asset: u32) -> Result<WPubkeyHash, ChannelError>;

    /// Hand over an output the wallet can sweep after its delay
    fn export_utxo(&self, descriptor: UtxoDescriptor) -> Result<(), ChannelError>;

    /// Stop watching an outpoint for spends
    fn stop_watching(&self, asset: u32, outpoint: &OutPoint) -> Result<(), ChannelError>;
}

/// The peer messaging collaborator
pub trait PeerTransport: SendSync {
    /// Queue a message to a peer
    fn send(&self, peer_idx: u32, msg: Message) -> Result<(), ChannelError>;
}
