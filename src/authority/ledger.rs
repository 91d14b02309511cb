//! Commit deduplication.
//!
//! A node may resend a commit after a transport failure without knowing
//! whether the first delivery was applied. The ledger records the outcome
//! of each `(node, epoch, sequence)` so a redelivery gets the same answer
//! instead of being applied twice.
//!
//! Records expire after a TTL, or when their session ends. A record is
//! never dropped while a resend could still arrive: when the table is full
//! of live records, new commits are turned away until space frees up. Store
//! failures are never recorded, so a resend after one is applied afresh.

use crate::core::error::{CacheConsistencyError, CoherenceResult};
use crate::protocol::types::{Epoch, NodeId, SessionId};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Idempotence key of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitKey {
    pub node: NodeId,
    pub epoch: Epoch,
    pub sequence: u64,
}

impl CommitKey {
    pub fn new(session: SessionId, sequence: u64) -> Self {
        Self {
            node: session.node_id,
            epoch: session.epoch,
            sequence,
        }
    }
}

impl std::fmt::Display for CommitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.node, self.epoch.0, self.sequence)
    }
}

/// Recorded outcome of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    Rejected(CacheConsistencyError),
}

impl CommitOutcome {
    pub fn into_result(self) -> CoherenceResult<()> {
        match self {
            Self::Applied => Ok(()),
            Self::Rejected(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone)]
enum Slot {
    InFlight,
    Done {
        outcome: CommitOutcome,
        recorded_at: Instant,
    },
}

/// Result of looking a commit up before applying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCheck {
    /// Never seen; the caller now owns the key until `finish` or `abandon`.
    Fresh,
    /// Seen and decided.
    Recorded(CommitOutcome),
    /// Another delivery of the same commit is being applied.
    InFlight,
    /// Unseen, but every slot holds a live record.
    Full,
}

/// Ledger statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerStats {
    pub entries: usize,
    pub in_flight: usize,
    pub capacity: usize,
    pub ttl_ms: u64,
}

/// Bounded, expiring record of commit outcomes.
#[derive(Debug)]
pub struct CommitLedger {
    slots: HashMap<CommitKey, Slot>,
    order: VecDeque<CommitKey>,
    ttl: Duration,
    capacity: usize,
}

impl Default for CommitLedger {
    fn default() -> Self {
        Self::new(Duration::from_millis(300_000), 4096)
    }
}

impl CommitLedger {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Look up `key`, claiming it if unseen.
    pub fn begin(&mut self, key: CommitKey, now: Instant) -> LedgerCheck {
        self.expire(now);
        match self.slots.get(&key) {
            Some(Slot::InFlight) => LedgerCheck::InFlight,
            Some(Slot::Done { outcome, .. }) => LedgerCheck::Recorded(outcome.clone()),
            None if self.slots.len() >= self.capacity => LedgerCheck::Full,
            None => {
                self.slots.insert(key, Slot::InFlight);
                LedgerCheck::Fresh
            }
        }
    }

    /// Record the decided outcome of a claimed key.
    pub fn finish(&mut self, key: CommitKey, outcome: CommitOutcome, now: Instant) {
        self.slots.insert(
            key,
            Slot::Done {
                outcome,
                recorded_at: now,
            },
        );
        self.order.push_back(key);
    }

    /// Release a claimed key without recording an outcome.
    pub fn abandon(&mut self, key: CommitKey) {
        if matches!(self.slots.get(&key), Some(Slot::InFlight)) {
            self.slots.remove(&key);
        }
    }

    /// Drop every record of `node`.
    pub fn forget_node(&mut self, node: NodeId) -> usize {
        let before = self.slots.len();
        self.slots.retain(|k, _| k.node != node);
        self.order.retain(|k| k.node != node);
        before - self.slots.len()
    }

    /// Drop records older than the TTL.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some(key) = self.order.front().copied() {
            let stale = match self.slots.get(&key) {
                Some(Slot::Done { recorded_at, .. }) => {
                    now.saturating_duration_since(*recorded_at) >= self.ttl
                }
                _ => true,
            };
            if !stale {
                break;
            }
            self.order.pop_front();
            if matches!(self.slots.get(&key), Some(Slot::Done { .. })) {
                self.slots.remove(&key);
                expired += 1;
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            entries: self.slots.len(),
            in_flight: self
                .slots
                .values()
                .filter(|s| matches!(s, Slot::InFlight))
                .count(),
            capacity: self.capacity,
            ttl_ms: self.ttl.as_millis() as u64,
        }
    }
}
