//! A node's collection of cache entries.
//!
//! All entry changes happen under one lock. Operations that must also take
//! a place in the update queue receive a `register` closure that runs under
//! that lock, so the queue order of commits and acknowledgements matches
//! the order in which they changed the cache.

use crate::cache::entry::{CacheEntry, CacheState, CachedValue};
use crate::core::error::CacheConsistencyError;
use crate::protocol::callback::{CallbackAction, CallbackRequest};
use crate::protocol::server::CommitBatch;
use crate::protocol::types::{
    AccessLevel, BindingValue, Epoch, NodeId, ObjectId, ObjectValue, ResourceKey,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Local changes of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    pub objects: BTreeMap<ObjectId, ObjectValue>,
    pub new_objects: BTreeMap<ObjectId, Bytes>,
    pub bindings: BTreeMap<String, BindingValue>,
    pub new_bindings: BTreeMap<String, ObjectId>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
            && self.new_objects.is_empty()
            && self.bindings.is_empty()
            && self.new_bindings.is_empty()
    }

    /// Resources the node must already own.
    pub fn owned_keys(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        self.objects
            .keys()
            .map(|oid| ResourceKey::Object(*oid))
            .chain(self.bindings.keys().map(|n| ResourceKey::Binding(n.clone())))
    }

    /// Resources created by this write set.
    pub fn new_keys(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        self.new_objects
            .keys()
            .map(|oid| ResourceKey::Object(*oid))
            .chain(
                self.new_bindings
                    .keys()
                    .map(|n| ResourceKey::Binding(n.clone())),
            )
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.owned_keys().chain(self.new_keys()).collect()
    }

    /// Render as a commit batch: owned resources first, allocations last.
    pub fn to_batch(&self, sequence: u64) -> CommitBatch {
        let mut oids: Vec<ObjectId> = self.objects.keys().copied().collect();
        let mut oid_values: Vec<ObjectValue> = self.objects.values().cloned().collect();
        oids.extend(self.new_objects.keys().copied());
        oid_values.extend(self.new_objects.values().cloned().map(Some));

        let mut names: Vec<String> = self.bindings.keys().cloned().collect();
        let mut name_values: Vec<BindingValue> = self.bindings.values().copied().collect();
        names.extend(self.new_bindings.keys().cloned());
        name_values.extend(self.new_bindings.values().copied().map(Some));

        CommitBatch {
            sequence,
            oids,
            oid_values,
            new_oids: self.new_objects.len(),
            names,
            name_values,
            new_names: self.new_bindings.len(),
        }
    }
}

/// Outcome of starting to serve a callback.
#[derive(Debug)]
pub enum RevokeStart<T> {
    /// The grant this callback revokes has not been installed yet. The
    /// callback is parked until it is.
    Deferred,
    /// Acknowledge now. `cached` is false when the resource is not cached,
    /// in which case the acknowledgement is a no-op.
    Ready { ticket: T, cached: bool },
}

#[derive(Debug, Default)]
struct CacheInner {
    epoch: Option<Epoch>,
    entries: HashMap<ResourceKey, CacheEntry>,
    fetching: HashMap<ResourceKey, usize>,
    deferred: HashMap<ResourceKey, Vec<CallbackRequest>>,
}

impl CacheInner {
    fn current(&self, epoch: Epoch) -> bool {
        self.epoch == Some(epoch)
    }

    fn release_fetch(&mut self, key: &ResourceKey) {
        if let Some(n) = self.fetching.get_mut(key) {
            *n -= 1;
            if *n == 0 {
                self.fetching.remove(key);
            }
        }
    }
}

/// Cache state snapshot counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub dirty: usize,
    pub revoking: usize,
    pub deferred_callbacks: usize,
}

/// Every cache entry of one node.
#[derive(Debug)]
pub struct NodeCache {
    node: NodeId,
    inner: Mutex<CacheInner>,
}

impl NodeCache {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Empty the cache and bind it to a new session epoch. Parked callbacks
    /// belong to the old session and are discarded.
    pub fn reset(&self, epoch: Epoch) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.fetching.clear();
        inner.deferred.clear();
        inner.epoch = Some(epoch);
        dropped
    }

    pub fn epoch(&self) -> Option<Epoch> {
        self.inner.lock().epoch
    }

    pub fn lookup(&self, key: &ResourceKey) -> Option<CacheEntry> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn state(&self, key: &ResourceKey) -> CacheState {
        self.inner
            .lock()
            .entries
            .get(key)
            .map_or(CacheState::Uncached, |e| e.state)
    }

    /// Cached value if readable at `level`.
    pub fn readable(&self, key: &ResourceKey, level: AccessLevel) -> Option<CachedValue> {
        self.inner
            .lock()
            .entries
            .get(key)
            .filter(|e| e.readable_at(level))
            .map(|e| e.value.clone())
    }

    /// Note a fetch in flight for `key`.
    pub fn begin_fetch(&self, key: &ResourceKey) {
        *self.inner.lock().fetching.entry(key.clone()).or_default() += 1;
    }

    /// A fetch failed. Returns parked callbacks, which can now be served.
    pub fn end_fetch(&self, key: &ResourceKey) -> Vec<CallbackRequest> {
        let mut inner = self.inner.lock();
        inner.release_fetch(key);
        if inner.fetching.contains_key(key) {
            return Vec::new();
        }
        inner.deferred.remove(key).unwrap_or_default()
    }

    /// Install a grant received under `epoch`.
    ///
    /// Returns the value now cached, or `None` if the cache moved on to a
    /// different epoch, plus every parked callback that targets this grant
    /// or a later one. Parked callbacks for older grants are stale and
    /// dropped.
    pub fn install_grant(
        &self,
        epoch: Epoch,
        key: &ResourceKey,
        value: CachedValue,
        level: AccessLevel,
        grant_seq: u64,
    ) -> (Option<CachedValue>, Vec<CallbackRequest>) {
        let mut inner = self.inner.lock();
        if !inner.current(epoch) {
            return (None, Vec::new());
        }
        inner.release_fetch(key);

        let entry = inner
            .entries
            .entry(key.clone())
            .and_modify(|e| {
                if grant_seq > e.grant_seq && e.revoking.is_some() {
                    // Superseded a revoked holding: start over.
                    *e = CacheEntry::new(
                        key.clone(),
                        CacheState::Uncached.granted(level),
                        value.clone(),
                        grant_seq,
                    );
                    return;
                }
                if e.pending_commits == 0 && !e.state.is_dirty() {
                    e.value = value.clone();
                }
                e.state = e.state.granted(level);
                e.grant_seq = e.grant_seq.max(grant_seq);
            })
            .or_insert_with(|| {
                CacheEntry::new(
                    key.clone(),
                    CacheState::Uncached.granted(level),
                    value.clone(),
                    grant_seq,
                )
            });
        let installed = entry.value.clone();
        let installed_seq = entry.grant_seq;

        let ready = if inner.fetching.contains_key(key) {
            Vec::new()
        } else {
            inner.deferred.remove(key).unwrap_or_default()
        };
        let (ready, stale): (Vec<_>, Vec<_>) = ready
            .into_iter()
            .partition(|req| req.grant_seq >= installed_seq);
        for req in stale {
            tracing::debug!(node = %self.node, callback = %req.id, resource = %req.resource, "dropping stale callback");
        }
        (Some(installed), ready)
    }

    /// Apply a transaction's write set locally and take its place in the
    /// update queue.
    ///
    /// Every owned resource must be writable and every new resource must be
    /// absent; otherwise nothing changes.
    pub fn apply_commit<T>(
        &self,
        epoch: Epoch,
        writes: &WriteSet,
        register: impl FnOnce(&[ResourceKey]) -> T,
    ) -> Result<T, CacheConsistencyError> {
        let mut inner = self.inner.lock();
        if !inner.current(epoch) {
            return Err(CacheConsistencyError::stale_epoch(
                self.node,
                epoch,
                inner.epoch,
            ));
        }

        for key in writes.owned_keys() {
            match inner.entries.get(&key) {
                Some(e) if e.writable() => {}
                other => {
                    return Err(CacheConsistencyError::not_held(
                        self.node,
                        key,
                        AccessLevel::Exclusive,
                        other.and_then(|e| e.state.level()),
                    ))
                }
            }
        }
        for key in writes.new_keys() {
            if inner.entries.contains_key(&key) {
                return Err(CacheConsistencyError::AlreadyExists { resource: key });
            }
        }

        for (oid, value) in &writes.objects {
            if let Some(e) = inner.entries.get_mut(&ResourceKey::Object(*oid)) {
                e.value = CachedValue::Object(value.clone());
            }
        }
        for (name, target) in &writes.bindings {
            if let Some(e) = inner.entries.get_mut(&ResourceKey::Binding(name.clone())) {
                e.value = CachedValue::Binding(*target);
            }
        }
        for (oid, bytes) in &writes.new_objects {
            let key = ResourceKey::Object(*oid);
            let entry = CacheEntry::new(
                key.clone(),
                CacheState::Exclusive,
                CachedValue::Object(Some(bytes.clone())),
                0,
            );
            inner.entries.insert(key, entry);
        }
        for (name, oid) in &writes.new_bindings {
            let key = ResourceKey::Binding(name.clone());
            let entry = CacheEntry::new(
                key.clone(),
                CacheState::Exclusive,
                CachedValue::Binding(Some(*oid)),
                0,
            );
            inner.entries.insert(key, entry);
        }

        let keys = writes.keys();
        for key in &keys {
            if let Some(e) = inner.entries.get_mut(key) {
                // Writable was checked above.
                e.state = e.state.written().unwrap_or(CacheState::ExclusiveDirty);
                e.pending_commits += 1;
            }
        }
        Ok(register(&keys))
    }

    /// A commit carrying `keys` was acknowledged.
    pub fn commit_acknowledged(&self, epoch: Epoch, keys: &[ResourceKey]) {
        let mut inner = self.inner.lock();
        if !inner.current(epoch) {
            return;
        }
        for key in keys {
            if let Some(e) = inner.entries.get_mut(key) {
                e.pending_commits = e.pending_commits.saturating_sub(1);
                if e.pending_commits == 0 {
                    e.state = e.state.flushed();
                }
            }
        }
    }

    /// A commit carrying `keys` was refused. The entries no longer match
    /// the authority and are dropped so ownership is fetched again.
    pub fn commit_rejected(&self, epoch: Epoch, keys: &[ResourceKey]) -> usize {
        let mut inner = self.inner.lock();
        if !inner.current(epoch) {
            return 0;
        }
        keys.iter()
            .filter(|key| inner.entries.remove(*key).is_some())
            .count()
    }

    /// Start serving a callback and take a place in the update queue for
    /// its acknowledgement.
    pub fn begin_revoke<T>(
        &self,
        request: &CallbackRequest,
        register: impl FnOnce(&[ResourceKey]) -> T,
    ) -> RevokeStart<T> {
        let mut inner = self.inner.lock();
        let key = &request.resource;
        let installed = inner.entries.get(key).map(|e| e.grant_seq);

        let awaiting_grant = inner.fetching.contains_key(key)
            && installed.map_or(true, |seq| seq != 0 && seq < request.grant_seq);
        if awaiting_grant {
            inner
                .deferred
                .entry(key.clone())
                .or_default()
                .push(request.clone());
            return RevokeStart::Deferred;
        }

        let cached = match inner.entries.get_mut(key) {
            Some(e) => {
                e.revoking = Some(match (e.revoking, request.action) {
                    (Some(CallbackAction::Evict), _) => CallbackAction::Evict,
                    (_, action) => action,
                });
                true
            }
            None => false,
        };
        let ticket = register(std::slice::from_ref(key));
        RevokeStart::Ready { ticket, cached }
    }

    /// The acknowledgement for a callback was accepted.
    pub fn finish_revoke(
        &self,
        epoch: Epoch,
        key: &ResourceKey,
        action: CallbackAction,
        grant_seq: u64,
    ) -> CacheState {
        let mut inner = self.inner.lock();
        if !inner.current(epoch) {
            return CacheState::Uncached;
        }
        let Some(entry) = inner.entries.get_mut(key) else {
            return CacheState::Uncached;
        };
        if entry.grant_seq > grant_seq && entry.grant_seq != 0 {
            // A newer grant was installed while the acknowledgement was in flight.
            return entry.state;
        }

        let next = match entry.state.revoked(action) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(node = %self.node, resource = %key, error = %e, "revoked entry still dirty");
                CacheState::Uncached
            }
        };
        if next == CacheState::Uncached {
            inner.entries.remove(key);
        } else {
            entry.state = next;
            entry.revoking = None;
        }
        next
    }

    /// The acknowledgement could not be delivered. The entry stays as it is
    /// at the authority.
    pub fn abort_revoke(&self, key: &ResourceKey) {
        if let Some(e) = self.inner.lock().entries.get_mut(key) {
            e.revoking = None;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            dirty: inner.entries.values().filter(|e| e.state.is_dirty()).count(),
            revoking: inner
                .entries
                .values()
                .filter(|e| e.revoking.is_some())
                .count(),
            deferred_callbacks: inner.deferred.values().map(Vec::len).sum(),
        }
    }
}
