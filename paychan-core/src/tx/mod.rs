/// Output scripts and witnesses
pub mod script;
/// Commitment and second-stage transactions
pub mod commitment;

pub use commitment::{
    build_commitment_tx, build_htlc_tx, sign_input, verify_input, CommitmentKeys,
    CommitmentParams, CommitmentTx,
};
pub use script::HtlcOutputInfo;
