//! Authority-to-node callback messages.
//!
//! A callback is an explicit request message correlated by [`CallbackId`].
//! The node answers by sending the matching `evict_*` or `downgrade_*`
//! acknowledgement through its update queue, so the acknowledgement is
//! ordered after any commit that flushes the same resource. The
//! acknowledgement names the request's `grant_seq`.

use crate::protocol::types::{AccessLevel, ResourceKey, SessionId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Correlation id of an outstanding callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallbackId(pub u64);

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cb:{}", self.0)
    }
}

/// What the authority asks the holder to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallbackAction {
    /// Drop the resource entirely.
    Evict,
    /// Weaken an exclusive holding to shared.
    Downgrade,
}

impl CallbackAction {
    /// Level the holder keeps after complying, if any.
    pub fn retained_level(self) -> Option<AccessLevel> {
        match self {
            Self::Evict => None,
            Self::Downgrade => Some(AccessLevel::Shared),
        }
    }

    /// Action needed to make room for a request at `requested`.
    pub fn for_request(requested: AccessLevel) -> Self {
        match requested {
            AccessLevel::Exclusive => Self::Evict,
            AccessLevel::Shared => Self::Downgrade,
        }
    }
}

impl std::fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Evict => write!(f, "evict"),
            Self::Downgrade => write!(f, "downgrade"),
        }
    }
}

/// A revocation request sent to a holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackRequest {
    pub id: CallbackId,
    /// The holder's session the request is addressed to.
    pub session: SessionId,
    pub resource: ResourceKey,
    pub action: CallbackAction,
    /// Grant sequence of the holding being revoked.
    pub grant_seq: u64,
}

/// Sending half of a node's callback channel, held by the authority.
pub type CallbackSender = mpsc::UnboundedSender<CallbackRequest>;

/// Receiving half of a node's callback channel, served by the node.
pub type CallbackReceiver = mpsc::UnboundedReceiver<CallbackRequest>;

/// Create a callback channel.
pub fn callback_channel() -> (CallbackSender, CallbackReceiver) {
    mpsc::unbounded_channel()
}
