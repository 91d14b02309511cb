//! In-memory reference store.

use crate::protocol::types::{BindingValue, ObjectId, ObjectValue, ResourceKey};
use crate::storage::{DurableStore, StoreBatch, StoreError, StoreStats};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct StoreState {
    objects: HashMap<ObjectId, Bytes>,
    bindings: BTreeMap<String, ObjectId>,
    batches_applied: u64,
}

/// A [`DurableStore`] kept entirely in memory.
///
/// A batch is validated in full before any change is made, then applied
/// under one write lock, so readers never see part of a batch.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with objects and bindings.
    pub fn with_contents(
        objects: impl IntoIterator<Item = (ObjectId, Bytes)>,
        bindings: impl IntoIterator<Item = (String, ObjectId)>,
    ) -> Self {
        let state = StoreState {
            objects: objects.into_iter().collect(),
            bindings: bindings.into_iter().collect(),
            batches_applied: 0,
        };
        Self {
            state: RwLock::new(state),
        }
    }

    /// All binding names in order.
    pub fn binding_names(&self) -> Vec<String> {
        self.state.read().bindings.keys().cloned().collect()
    }
}

impl DurableStore for MemoryStore {
    fn apply_batch(&self, batch: &StoreBatch) -> Result<(), StoreError> {
        let mut state = self.state.write();

        for (oid, _) in &batch.new_objects {
            if state.objects.contains_key(oid) {
                return Err(StoreError::AlreadyExists {
                    resource: ResourceKey::Object(*oid),
                });
            }
        }
        for (name, _) in &batch.new_bindings {
            if state.bindings.contains_key(name) {
                return Err(StoreError::AlreadyExists {
                    resource: ResourceKey::Binding(name.clone()),
                });
            }
        }

        for (oid, value) in &batch.object_writes {
            match value {
                Some(bytes) => {
                    state.objects.insert(*oid, bytes.clone());
                }
                None => {
                    state.objects.remove(oid);
                }
            }
        }
        for (oid, bytes) in &batch.new_objects {
            state.objects.insert(*oid, bytes.clone());
        }
        for (name, target) in &batch.binding_writes {
            match target {
                Some(oid) => {
                    state.bindings.insert(name.clone(), *oid);
                }
                None => {
                    state.bindings.remove(name);
                }
            }
        }
        for (name, oid) in &batch.new_bindings {
            state.bindings.insert(name.clone(), *oid);
        }

        state.batches_applied += 1;
        Ok(())
    }

    fn object(&self, oid: ObjectId) -> ObjectValue {
        self.state.read().objects.get(&oid).cloned()
    }

    fn binding(&self, name: &str) -> BindingValue {
        self.state.read().bindings.get(name).copied()
    }

    fn max_object_id(&self) -> Option<ObjectId> {
        self.state.read().objects.keys().max().copied()
    }

    fn stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            objects: state.objects.len(),
            bindings: state.bindings.len(),
            batches_applied: state.batches_applied,
        }
    }
}
