//! Durable store behind the authority.
//!
//! The authority is the only caller. Every mutation goes through
//! [`DurableStore::apply_batch`], which is atomic: either every write and
//! every allocation in the batch becomes visible, or none does.
//!
//! # Modules
//!
//! - [`memory`] - In-memory reference store

pub mod memory;

pub use memory::MemoryStore;

use crate::protocol::types::{BindingValue, ObjectId, ObjectValue, ResourceKey};
use bytes::Bytes;
use thiserror::Error;

/// One atomic unit of durable change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreBatch {
    /// Writes to existing objects. `None` removes the object.
    pub object_writes: Vec<(ObjectId, ObjectValue)>,
    /// Objects that must not exist yet.
    pub new_objects: Vec<(ObjectId, Bytes)>,
    /// Writes to existing bindings. `None` removes the binding.
    pub binding_writes: Vec<(String, BindingValue)>,
    /// Bindings that must not exist yet.
    pub new_bindings: Vec<(String, ObjectId)>,
}

impl StoreBatch {
    pub fn is_empty(&self) -> bool {
        self.object_writes.is_empty()
            && self.new_objects.is_empty()
            && self.binding_writes.is_empty()
            && self.new_bindings.is_empty()
    }

    /// Number of individual changes in the batch.
    pub fn len(&self) -> usize {
        self.object_writes.len()
            + self.new_objects.len()
            + self.binding_writes.len()
            + self.new_bindings.len()
    }
}

/// Durable store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// An allocation named a resource that already exists.
    #[error("{resource} already exists")]
    AlreadyExists { resource: ResourceKey },

    /// The store could not apply the batch. Nothing was written.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
}

/// Counters describing the store contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub objects: usize,
    pub bindings: usize,
    pub batches_applied: u64,
}

/// Backing persistence of the authority.
pub trait DurableStore: Send + Sync {
    /// Apply a batch atomically.
    fn apply_batch(&self, batch: &StoreBatch) -> Result<(), StoreError>;

    /// Current value of an object.
    fn object(&self, oid: ObjectId) -> ObjectValue;

    /// Current target of a binding.
    fn binding(&self, name: &str) -> BindingValue;

    fn contains_object(&self, oid: ObjectId) -> bool {
        self.object(oid).is_some()
    }

    fn contains_binding(&self, name: &str) -> bool {
        self.binding(name).is_some()
    }

    /// Highest object id present, used to seed id allocation.
    fn max_object_id(&self) -> Option<ObjectId>;

    fn stats(&self) -> StoreStats;
}
