//! Error types.
//!
//! [`CacheConsistencyError`] is the only protocol-level failure: a stale
//! ownership claim, a stale epoch, or a disagreement between node and
//! authority bookkeeping. It is never retried by the protocol layer. Every
//! other failure (transport, timeout, store) is carried by [`CoherenceError`]
//! alongside it.

use crate::protocol::types::{AccessLevel, Epoch, NodeId, ResourceKey};
use thiserror::Error;

/// Protocol consistency violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheConsistencyError {
    /// The request carried an epoch that is not the node's live session.
    #[error("stale epoch for {node}: observed {observed}, current {current:?}")]
    StaleEpoch {
        node: NodeId,
        observed: Epoch,
        current: Option<Epoch>,
    },

    /// The authority has no session for this node.
    #[error("unknown node {node}")]
    UnknownNode { node: NodeId },

    /// A commit claimed a resource the node does not hold at the required level.
    #[error("{node} does not hold {resource} at {required} (holds {held:?})")]
    NotHeld {
        node: NodeId,
        resource: ResourceKey,
        required: AccessLevel,
        held: Option<AccessLevel>,
    },

    /// A new allocation named a resource that already exists.
    #[error("{resource} already exists")]
    AlreadyExists { resource: ResourceKey },

    /// A new allocation named a resource another node currently holds.
    #[error("{resource} is held by {holder}")]
    ConflictingHolder {
        resource: ResourceKey,
        holder: NodeId,
    },

    /// A callback acknowledgement disagrees with authority bookkeeping.
    #[error("bookkeeping mismatch for {node} on {resource}: {detail}")]
    BookkeepingMismatch {
        node: NodeId,
        resource: ResourceKey,
        detail: String,
    },

    /// The commit batch is not well formed.
    #[error("malformed batch: {detail}")]
    MalformedBatch { detail: String },
}

impl CacheConsistencyError {
    pub fn stale_epoch(node: NodeId, observed: Epoch, current: Option<Epoch>) -> Self {
        Self::StaleEpoch {
            node,
            observed,
            current,
        }
    }

    pub fn not_held(
        node: NodeId,
        resource: ResourceKey,
        required: AccessLevel,
        held: Option<AccessLevel>,
    ) -> Self {
        Self::NotHeld {
            node,
            resource,
            required,
            held,
        }
    }

    pub fn mismatch(node: NodeId, resource: ResourceKey, detail: impl Into<String>) -> Self {
        Self::BookkeepingMismatch {
            node,
            resource,
            detail: detail.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedBatch {
            detail: detail.into(),
        }
    }

    /// Whether the node's whole session is gone, as opposed to a single
    /// resource claim being out of date.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Self::StaleEpoch { .. } | Self::UnknownNode { .. })
    }
}

/// Crate-wide error.
#[derive(Debug, Clone, Error)]
pub enum CoherenceError {
    /// Protocol consistency violation. Caller must resynchronize ownership.
    #[error(transparent)]
    Consistency(#[from] CacheConsistencyError),

    /// Peer unreachable or link broken.
    #[error("transport failure: {message}")]
    Transport { message: String },

    /// The operation was abandoned because its session ended.
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    /// The durable store rejected or failed a batch.
    #[error("store failure: {message}")]
    Store { message: String },

    /// Caller error that never reached the protocol.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The node has been shut down.
    #[error("shutting down")]
    Shutdown,
}

impl CoherenceError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Whether resending the identical request may succeed.
    ///
    /// Only transport failures qualify; consistency errors require the caller
    /// to rebuild the request.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_consistency(&self) -> bool {
        matches!(self, Self::Consistency(_))
    }

    /// The inner consistency error, if any.
    pub fn as_consistency(&self) -> Option<&CacheConsistencyError> {
        match self {
            Self::Consistency(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type using CoherenceError.
pub type CoherenceResult<T> = Result<T, CoherenceError>;
