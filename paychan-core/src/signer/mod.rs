/// Key derivation paths and the derivation function
pub mod derive;

pub use derive::{derive, derive_pubkey, KeyGen, KeyPurpose};
