#![crate_name = "paychan"]

//! Bidirectional HTLC payment channels with on-chain enforcement.
//! See [`node::Node`] for the entry point.

#![forbid(unsafe_code)]
#![allow(bare_trait_objects)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

#[macro_use]
extern crate alloc;
extern crate core;

pub use bitcoin;
pub use lightning;

/// Various utilities
#[macro_use]
pub mod util;
/// Error kinds and constructors
#[macro_use]
pub mod error;
/// Channel identity and the update state machine
pub mod channel;
/// HTLC records
pub mod htlc;
/// Peer wire messages
pub mod msgs;
/// Node: the channel registry and the handshake entry points
pub mod node;
/// Persistence
pub mod persist;
/// Revocation hash chains
pub mod revocation;
/// Key derivation
pub mod signer;
/// Channel ledger
pub mod state;
/// Transaction and script construction
pub mod tx;
/// Chain and wallet collaborator
pub mod wallet;

mod claim;
mod handshake;

pub use alloc::sync::Arc;

/// Common imports
pub mod prelude {
    pub use alloc::{boxed::Box, string::String, vec, vec::Vec};

    pub use hashbrown::HashMap as Map;

    pub use alloc::collections::BTreeMap as OrderedMap;

    pub use alloc::borrow::ToOwned;
    pub use alloc::string::ToString;

    pub use std::sync::{Mutex, MutexGuard};

    /// Convenience trait for Send + Sync
    pub trait SendSync: Send + Sync {}
}

pub use prelude::SendSync;

mod sync {
    pub use ::std::sync::{Condvar, Mutex, MutexGuard};
}

#[cfg(test)]
mod clear_htlc_tests;
#[cfg(test)]
mod claim_htlc_tests;
