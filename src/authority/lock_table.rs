//! Authority lock table.
//!
//! An index-keyed map from [`ResourceKey`] to the set of nodes holding it.
//! Nodes are referenced by [`NodeId`] only; session details live in the
//! session registry and are looked up, never pointed to.
//!
//! The holder set is the closed enum [`Holders`], so at most one exclusive
//! holder can be represented and exclusive and shared holders cannot coexist.
//!
//! Grants for one resource are serialized by a per-resource gate (a fair
//! tokio mutex, so waiters are served in arrival order). The gate is held
//! across eviction/downgrade round trips. Commits and acknowledgements only
//! touch the bookkeeping map and never wait on a gate.

use crate::core::error::CacheConsistencyError;
use crate::protocol::types::{AccessLevel, Epoch, NodeId, ResourceKey};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One node's hold on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holding {
    pub level: AccessLevel,
    pub epoch: Epoch,
    pub grant_seq: u64,
}

/// Holder set of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Holders {
    #[default]
    Free,
    Shared(BTreeMap<NodeId, Holding>),
    Exclusive(NodeId, Holding),
}

/// Result of a downgrade transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DowngradeOutcome {
    /// The node went from exclusive to shared.
    Downgraded,
    /// The node already held shared access.
    AlreadyShared,
    /// The node held nothing.
    NotHeld,
}

impl Holders {
    /// Level held by `node`, if any.
    pub fn level_of(&self, node: NodeId) -> Option<AccessLevel> {
        self.holding_of(node).map(|h| h.level)
    }

    pub fn holding_of(&self, node: NodeId) -> Option<Holding> {
        match self {
            Self::Free => None,
            Self::Shared(holders) => holders.get(&node).copied(),
            Self::Exclusive(holder, holding) if *holder == node => Some(*holding),
            Self::Exclusive(..) => None,
        }
    }

    /// Holders other than `node` that must be revoked or weakened before
    /// `node` can hold `level`.
    pub fn conflicting(&self, node: NodeId, level: AccessLevel) -> Vec<(NodeId, Holding)> {
        match self {
            Self::Free => Vec::new(),
            Self::Shared(holders) => {
                if level == AccessLevel::Exclusive {
                    holders
                        .iter()
                        .filter(|(id, _)| **id != node)
                        .map(|(id, h)| (*id, *h))
                        .collect()
                } else {
                    Vec::new()
                }
            }
            Self::Exclusive(holder, holding) if *holder != node => vec![(*holder, *holding)],
            Self::Exclusive(..) => Vec::new(),
        }
    }

    /// Record a grant. Fails with the conflicting holders if any remain.
    /// A grant never lowers a level the node already holds.
    pub fn grant(
        &mut self,
        node: NodeId,
        level: AccessLevel,
        epoch: Epoch,
        grant_seq: u64,
    ) -> Result<Holding, Vec<(NodeId, Holding)>> {
        let conflicts = self.conflicting(node, level);
        if !conflicts.is_empty() {
            return Err(conflicts);
        }
        let holding = Holding {
            level,
            epoch,
            grant_seq,
        };
        match std::mem::take(self) {
            Self::Free => {
                *self = match level {
                    AccessLevel::Exclusive => Self::Exclusive(node, holding),
                    AccessLevel::Shared => Self::Shared(BTreeMap::from([(node, holding)])),
                };
                Ok(holding)
            }
            Self::Shared(mut holders) => {
                if level == AccessLevel::Exclusive {
                    // No conflicts means `node` is the only shared holder.
                    *self = Self::Exclusive(node, holding);
                } else {
                    holders.insert(node, holding);
                    *self = Self::Shared(holders);
                }
                Ok(holding)
            }
            Self::Exclusive(holder, existing) => {
                // Only reachable for the holder itself.
                let kept = Holding {
                    level: AccessLevel::Exclusive,
                    epoch,
                    grant_seq: existing.grant_seq.max(grant_seq),
                };
                *self = Self::Exclusive(holder, kept);
                Ok(kept)
            }
        }
    }

    /// Remove `node` from the holder set.
    pub fn release(&mut self, node: NodeId) -> Option<Holding> {
        match std::mem::take(self) {
            Self::Free => None,
            Self::Shared(mut holders) => {
                let removed = holders.remove(&node);
                if !holders.is_empty() {
                    *self = Self::Shared(holders);
                }
                removed
            }
            Self::Exclusive(holder, holding) => {
                if holder == node {
                    Some(holding)
                } else {
                    *self = Self::Exclusive(holder, holding);
                    None
                }
            }
        }
    }

    /// Weaken `node` from exclusive to shared.
    pub fn downgrade(&mut self, node: NodeId) -> DowngradeOutcome {
        match std::mem::take(self) {
            Self::Exclusive(holder, holding) if holder == node => {
                let shared = Holding {
                    level: AccessLevel::Shared,
                    ..holding
                };
                *self = Self::Shared(BTreeMap::from([(node, shared)]));
                DowngradeOutcome::Downgraded
            }
            Self::Shared(holders) => {
                let outcome = if holders.contains_key(&node) {
                    DowngradeOutcome::AlreadyShared
                } else {
                    DowngradeOutcome::NotHeld
                };
                *self = Self::Shared(holders);
                outcome
            }
            other => {
                *self = other;
                DowngradeOutcome::NotHeld
            }
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    /// All holders with their levels.
    pub fn holders(&self) -> Vec<(NodeId, AccessLevel)> {
        match self {
            Self::Free => Vec::new(),
            Self::Shared(holders) => holders.iter().map(|(id, h)| (*id, h.level)).collect(),
            Self::Exclusive(holder, holding) => vec![(*holder, holding.level)],
        }
    }
}

/// A node queued for a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub node: NodeId,
    pub level: AccessLevel,
    pub ticket: u64,
}

/// Lock table entry for one resource.
#[derive(Debug, Clone, Default)]
pub struct LockTableEntry {
    pub holders: Holders,
    /// Pending requesters in arrival order.
    pub waiters: VecDeque<Waiter>,
}

impl LockTableEntry {
    fn is_idle(&self) -> bool {
        self.holders.is_free() && self.waiters.is_empty()
    }
}

/// Bookkeeping state guarded by one lock.
#[derive(Debug, Default)]
pub struct TableState {
    entries: HashMap<ResourceKey, LockTableEntry>,
    by_node: HashMap<NodeId, HashSet<ResourceKey>>,
}

impl TableState {
    pub fn entry(&self, key: &ResourceKey) -> Option<&LockTableEntry> {
        self.entries.get(key)
    }

    pub fn holding(&self, key: &ResourceKey, node: NodeId) -> Option<Holding> {
        self.entries.get(key).and_then(|e| e.holders.holding_of(node))
    }

    /// Require `node` to hold `key` exclusively under `epoch`.
    pub fn check_exclusive(
        &self,
        key: &ResourceKey,
        node: NodeId,
        epoch: Epoch,
    ) -> Result<(), CacheConsistencyError> {
        match self.holding(key, node) {
            Some(h) if h.level == AccessLevel::Exclusive && h.epoch == epoch => Ok(()),
            Some(h) if h.epoch != epoch => Err(CacheConsistencyError::not_held(
                node,
                key.clone(),
                AccessLevel::Exclusive,
                None,
            )),
            held => Err(CacheConsistencyError::not_held(
                node,
                key.clone(),
                AccessLevel::Exclusive,
                held.map(|h| h.level),
            )),
        }
    }

    /// Require that no node other than `node` holds `key`.
    pub fn check_unheld_by_others(
        &self,
        key: &ResourceKey,
        node: NodeId,
    ) -> Result<(), CacheConsistencyError> {
        if let Some(entry) = self.entries.get(key) {
            if let Some((holder, _)) = entry
                .holders
                .holders()
                .into_iter()
                .find(|(id, _)| *id != node)
            {
                return Err(CacheConsistencyError::ConflictingHolder {
                    resource: key.clone(),
                    holder,
                });
            }
        }
        Ok(())
    }

    fn grant(
        &mut self,
        key: &ResourceKey,
        node: NodeId,
        level: AccessLevel,
        epoch: Epoch,
        grant_seq: u64,
    ) -> Result<Holding, Vec<(NodeId, Holding)>> {
        let entry = self.entries.entry(key.clone()).or_default();
        let holding = entry.holders.grant(node, level, epoch, grant_seq)?;
        self.by_node.entry(node).or_default().insert(key.clone());
        Ok(holding)
    }

    fn release(&mut self, key: &ResourceKey, node: NodeId) -> Option<Holding> {
        let entry = self.entries.get_mut(key)?;
        let removed = entry.holders.release(node);
        if entry.is_idle() {
            self.entries.remove(key);
        }
        if removed.is_some() {
            if let Some(keys) = self.by_node.get_mut(&node) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_node.remove(&node);
                }
            }
        }
        removed
    }

    fn downgrade(&mut self, key: &ResourceKey, node: NodeId) -> DowngradeOutcome {
        match self.entries.get_mut(key) {
            Some(entry) => entry.holders.downgrade(node),
            None => DowngradeOutcome::NotHeld,
        }
    }

    /// `node`'s holding on `key` if it was granted after `grant_seq`.
    fn newer_than(&self, key: &ResourceKey, node: NodeId, grant_seq: u64) -> Option<Holding> {
        self.holding(key, node).filter(|h| h.grant_seq > grant_seq)
    }
}

/// Shared handle to a resource's grant gate.
pub type Gate = Arc<tokio::sync::Mutex<()>>;

/// The authority's lock table.
#[derive(Debug, Default)]
pub struct LockTable {
    state: RwLock<TableState>,
    gates: Mutex<HashMap<ResourceKey, Gate>>,
    next_grant_seq: AtomicU64,
    next_ticket: AtomicU64,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view for validation.
    pub fn read(&self) -> RwLockReadGuard<'_, TableState> {
        self.state.read()
    }

    /// Exclusive view for validation followed by mutation.
    pub fn write(&self) -> RwLockWriteGuard<'_, TableState> {
        self.state.write()
    }

    /// Level `node` currently holds on `key`.
    pub fn level_of(&self, key: &ResourceKey, node: NodeId) -> Option<AccessLevel> {
        self.state.read().holding(key, node).map(|h| h.level)
    }

    /// Current holders of `key`.
    pub fn holders(&self, key: &ResourceKey) -> Vec<(NodeId, AccessLevel)> {
        self.state
            .read()
            .entry(key)
            .map(|e| e.holders.holders())
            .unwrap_or_default()
    }

    /// Nodes queued for `key`, in arrival order.
    pub fn waiters(&self, key: &ResourceKey) -> Vec<Waiter> {
        self.state
            .read()
            .entry(key)
            .map(|e| e.waiters.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Resources currently held by `node`.
    pub fn held_by(&self, node: NodeId) -> Vec<ResourceKey> {
        self.state
            .read()
            .by_node
            .get(&node)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Holders that conflict with `node` holding `level`.
    pub fn conflicting(
        &self,
        key: &ResourceKey,
        node: NodeId,
        level: AccessLevel,
    ) -> Vec<(NodeId, Holding)> {
        self.state
            .read()
            .entry(key)
            .map(|e| e.holders.conflicting(node, level))
            .unwrap_or_default()
    }

    /// Allocate the next grant sequence number.
    pub fn next_grant_seq(&self) -> u64 {
        self.next_grant_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a grant to `node`.
    pub fn grant(
        &self,
        key: &ResourceKey,
        node: NodeId,
        level: AccessLevel,
        epoch: Epoch,
    ) -> Result<Holding, Vec<(NodeId, Holding)>> {
        let seq = self.next_grant_seq();
        self.state.write().grant(key, node, level, epoch, seq)
    }

    /// Record a grant while the caller already holds the write guard.
    pub fn grant_locked(
        &self,
        state: &mut TableState,
        key: &ResourceKey,
        node: NodeId,
        level: AccessLevel,
        epoch: Epoch,
    ) -> Result<Holding, Vec<(NodeId, Holding)>> {
        let seq = self.next_grant_seq();
        state.grant(key, node, level, epoch, seq)
    }

    /// Remove `node` from `key`'s holders.
    pub fn release(&self, key: &ResourceKey, node: NodeId) -> Option<Holding> {
        self.state.write().release(key, node)
    }

    /// Weaken `node` on `key` to shared.
    pub fn downgrade(&self, key: &ResourceKey, node: NodeId) -> DowngradeOutcome {
        self.state.write().downgrade(key, node)
    }

    /// Release `node`'s holding on `key` unless it was granted after
    /// `grant_seq`, in which case the newer holding is returned untouched.
    pub fn release_granted(
        &self,
        key: &ResourceKey,
        node: NodeId,
        grant_seq: u64,
    ) -> Result<Option<Holding>, Holding> {
        let mut state = self.state.write();
        if let Some(newer) = state.newer_than(key, node, grant_seq) {
            return Err(newer);
        }
        Ok(state.release(key, node))
    }

    /// Downgrade `node` on `key` unless its holding was granted after
    /// `grant_seq`, in which case the newer holding is returned untouched.
    pub fn downgrade_granted(
        &self,
        key: &ResourceKey,
        node: NodeId,
        grant_seq: u64,
    ) -> Result<DowngradeOutcome, Holding> {
        let mut state = self.state.write();
        if let Some(newer) = state.newer_than(key, node, grant_seq) {
            return Err(newer);
        }
        Ok(state.downgrade(key, node))
    }

    /// Remove `node` from every resource it holds. Returns the reclaimed keys.
    pub fn release_all(&self, node: NodeId) -> Vec<ResourceKey> {
        let mut state = self.state.write();
        let keys: Vec<ResourceKey> = state
            .by_node
            .get(&node)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            state.release(key, node);
        }
        state.by_node.remove(&node);
        keys
    }

    /// Join the FIFO queue for `key`. Returns the waiter ticket.
    pub fn enqueue(&self, key: &ResourceKey, node: NodeId, level: AccessLevel) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        self.state
            .write()
            .entries
            .entry(key.clone())
            .or_default()
            .waiters
            .push_back(Waiter {
                node,
                level,
                ticket,
            });
        ticket
    }

    /// Leave the queue for `key`, whether served or abandoned.
    pub fn dequeue(&self, key: &ResourceKey, ticket: u64) {
        let mut state = self.state.write();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.waiters.retain(|w| w.ticket != ticket);
            if entry.is_idle() {
                state.entries.remove(key);
            }
        }
    }

    /// The grant gate for `key`.
    pub fn gate(&self, key: &ResourceKey) -> Gate {
        self.gates
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the gate for `key` once nobody is using or waiting on it.
    pub fn retire_gate(&self, key: &ResourceKey) {
        let mut gates = self.gates.lock();
        if gates.get(key).is_some_and(|g| Arc::strong_count(g) == 1) {
            gates.remove(key);
        }
    }

    /// Number of resources with bookkeeping.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
