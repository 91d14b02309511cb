//! Node session registry.
//!
//! Each registered node has at most one current session. Registering again
//! allocates a fresh epoch and supersedes the previous one. Ended sessions
//! are kept so stale requests can be told which epoch is current.

use crate::core::error::CacheConsistencyError;
use crate::protocol::callback::CallbackSender;
use crate::protocol::types::{Epoch, NodeId, SessionId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::time::Instant;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Declared dead by the authority, typically after a callback timeout.
    Failed,
    /// Ended by the node itself.
    Disconnected,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alive => write!(f, "alive"),
            Self::Failed => write!(f, "failed"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug)]
struct SessionRecord {
    session: SessionId,
    liveness: Liveness,
    callbacks: CallbackSender,
    cancel: watch::Sender<bool>,
    registered_at: Instant,
}

/// Snapshot of one session for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub session: SessionId,
    pub liveness: Liveness,
    pub registered_at: Instant,
}

/// Registry of node sessions keyed by node id.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<NodeId, SessionRecord>>,
    next_epoch: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
        }
    }

    /// Open a session for `node`. Returns the new session and the one it
    /// superseded, if that one was still alive.
    pub fn register(
        &self,
        node: NodeId,
        callbacks: CallbackSender,
    ) -> (SessionId, Option<SessionId>) {
        let epoch = Epoch(self.next_epoch.fetch_add(1, Ordering::SeqCst));
        let session = SessionId::new(node, epoch);
        let (cancel, _) = watch::channel(false);
        let record = SessionRecord {
            session,
            liveness: Liveness::Alive,
            callbacks,
            cancel,
            registered_at: Instant::now(),
        };

        let previous = self.sessions.write().insert(node, record);
        let superseded = previous.and_then(|old| {
            let _ = old.cancel.send(true);
            (old.liveness == Liveness::Alive).then_some(old.session)
        });
        (session, superseded)
    }

    /// Check that `session` is the node's current live session.
    pub fn validate(&self, session: SessionId) -> Result<(), CacheConsistencyError> {
        let sessions = self.sessions.read();
        match sessions.get(&session.node_id) {
            None => Err(CacheConsistencyError::UnknownNode {
                node: session.node_id,
            }),
            Some(record) if record.session.epoch != session.epoch => {
                Err(CacheConsistencyError::stale_epoch(
                    session.node_id,
                    session.epoch,
                    Some(record.session.epoch),
                ))
            }
            Some(record) if record.liveness != Liveness::Alive => Err(
                CacheConsistencyError::stale_epoch(session.node_id, session.epoch, None),
            ),
            Some(_) => Ok(()),
        }
    }

    /// End `session` if it is current and alive. Returns whether it was.
    ///
    /// Wakes every grant request the session is waiting on.
    pub fn end(&self, session: SessionId, liveness: Liveness) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&session.node_id) {
            Some(record) if record.session == session && record.liveness == Liveness::Alive => {
                record.liveness = liveness;
                let _ = record.cancel.send(true);
                true
            }
            _ => false,
        }
    }

    /// Current live session of `node` and its callback channel.
    pub fn route(&self, node: NodeId) -> Option<(SessionId, CallbackSender)> {
        let sessions = self.sessions.read();
        sessions
            .get(&node)
            .filter(|r| r.liveness == Liveness::Alive)
            .map(|r| (r.session, r.callbacks.clone()))
    }

    /// Receiver that turns `true` once `session` ends.
    pub fn cancellation(&self, session: SessionId) -> Option<watch::Receiver<bool>> {
        let sessions = self.sessions.read();
        sessions
            .get(&session.node_id)
            .filter(|r| r.session == session)
            .map(|r| r.cancel.subscribe())
    }

    pub fn info(&self, node: NodeId) -> Option<SessionInfo> {
        self.sessions.read().get(&node).map(|r| SessionInfo {
            session: r.session,
            liveness: r.liveness,
            registered_at: r.registered_at,
        })
    }

    /// All sessions that are still alive.
    pub fn live(&self) -> Vec<SessionId> {
        let mut live: Vec<SessionId> = self
            .sessions
            .read()
            .values()
            .filter(|r| r.liveness == Liveness::Alive)
            .map(|r| r.session)
            .collect();
        live.sort_by_key(|s| s.node_id);
        live
    }
}
