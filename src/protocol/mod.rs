//! Protocol surface between nodes and the authority.
//!
//! - [`types`] - Identifiers, access levels, grants
//! - [`server`] - `UpdateQueueServer` and `GrantServer` contracts, commit batches
//! - [`callback`] - Authority-to-node callback messages
//! - [`traced`] - Transparent tracing decorator for the contracts

pub mod callback;
pub mod server;
pub mod traced;
pub mod types;

pub use callback::{callback_channel, CallbackAction, CallbackId, CallbackRequest};
pub use server::{AuthorityLink, CommitBatch, GrantServer, UpdateQueueServer};
pub use traced::Traced;
pub use types::{
    AccessLevel, BindingValue, Epoch, Grant, NodeId, ObjectId, ObjectIdRange, ObjectValue,
    ResourceKey, SessionId,
};
