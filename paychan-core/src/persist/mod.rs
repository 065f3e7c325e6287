use crate::channel::ChannelId;
use crate::node::MultihopPayment;
use crate::prelude::*;

/// Models for persistence
pub mod model;

use model::ChannelData;

#[derive(Clone, Debug, PartialEq)]
/// Error returned by persister
pub enum Error {
    /// Persister is temporarily unavailable, might work later
    Unavailable(String),
    /// Inconsistent state, needed resource is missing
    NotFound(String),
    /// Inconsistent state, resource already present
    AlreadyExists(String),
    /// Non-recoverable internal error
    Internal(String),
    /// A versioned write would move a key backwards
    VersionMismatch(String),
}

/// Persister of channels and multihop payment records
///
/// A [`Node`](crate::node::Node) saves a channel under the channel lock after
/// every state change, and reloads it after taking the lock and before
/// inspecting the state.  Implementations should persist durably before
/// returning.
pub trait Persist: SendSync {
    /// Create or replace a channel
    fn save_channel(&self, id: &ChannelId, data: &ChannelData) -> Result<(), Error>;

    /// Get a channel from store
    fn load_channel(&self, id: &ChannelId) -> Result<ChannelData, Error>;

    /// Get all channels from store
    fn list_channels(&self) -> Result<Vec<(ChannelId, ChannelData)>, Error>;

    /// Create or replace the multihop record for a payment hash
    fn save_multihop(&self, payment: &MultihopPayment) -> Result<(), Error>;

    /// Get all multihop records
    fn load_multihops(&self) -> Result<Vec<MultihopPayment>, Error>;
}
