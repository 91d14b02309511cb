//! Outstanding callback tracking.
//!
//! Every eviction or downgrade request the authority sends is registered
//! here under a fresh [`CallbackId`] and indexed by `(holder, resource)`.
//! The matching acknowledgement resolves it; a timeout or the holder's
//! session ending cancels it.

use crate::core::error::{CacheConsistencyError, CoherenceError};
use crate::protocol::callback::{CallbackAction, CallbackId, CallbackRequest, CallbackSender};
use crate::protocol::types::{NodeId, ResourceKey, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// How an outstanding callback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResolution {
    /// The holder acknowledged it.
    Acknowledged,
    /// The holder's session ended before it answered.
    Cancelled,
}

/// Handle the grant path awaits for one callback.
#[derive(Debug)]
pub struct CallbackTicket {
    pub id: CallbackId,
    pub holder: SessionId,
    pub resource: ResourceKey,
    pub action: CallbackAction,
    pub(crate) resolved: oneshot::Receiver<CallbackResolution>,
}

#[derive(Debug)]
struct Pending {
    holder: NodeId,
    resource: ResourceKey,
    action: CallbackAction,
    tx: oneshot::Sender<CallbackResolution>,
}

#[derive(Debug, Default)]
struct PendingState {
    by_id: HashMap<CallbackId, Pending>,
    by_target: HashMap<(NodeId, ResourceKey), CallbackId>,
}

impl PendingState {
    fn take(&mut self, id: CallbackId) -> Option<Pending> {
        let pending = self.by_id.remove(&id)?;
        self.by_target
            .remove(&(pending.holder, pending.resource.clone()));
        Some(pending)
    }
}

/// Registry of callbacks awaiting acknowledgement.
#[derive(Debug, Default)]
pub struct CallbackDispatcher {
    next_id: AtomicU64,
    pending: Mutex<PendingState>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and send a callback to `holder`.
    pub fn issue(
        &self,
        sender: &CallbackSender,
        holder: SessionId,
        resource: ResourceKey,
        action: CallbackAction,
        grant_seq: u64,
    ) -> Result<CallbackTicket, CoherenceError> {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.pending.lock();
            if let Some(stale) = state
                .by_target
                .insert((holder.node_id, resource.clone()), id)
            {
                if let Some(p) = state.by_id.remove(&stale) {
                    let _ = p.tx.send(CallbackResolution::Cancelled);
                }
            }
            state.by_id.insert(
                id,
                Pending {
                    holder: holder.node_id,
                    resource: resource.clone(),
                    action,
                    tx,
                },
            );
        }

        let request = CallbackRequest {
            id,
            session: holder,
            resource: resource.clone(),
            action,
            grant_seq,
        };
        if sender.send(request).is_err() {
            self.pending.lock().take(id);
            return Err(CoherenceError::transport(format!(
                "callback channel to {} closed",
                holder
            )));
        }

        tracing::debug!(callback = %id, holder = %holder, resource = %resource, action = %action, "callback issued");
        Ok(CallbackTicket {
            id,
            holder,
            resource,
            action,
            resolved: rx,
        })
    }

    /// Action outstanding for `(node, resource)`, if any.
    pub fn pending_action(&self, node: NodeId, resource: &ResourceKey) -> Option<CallbackAction> {
        let state = self.pending.lock();
        state
            .by_target
            .get(&(node, resource.clone()))
            .and_then(|id| state.by_id.get(id))
            .map(|p| p.action)
    }

    /// Check an acknowledgement against the outstanding request.
    ///
    /// An eviction satisfies a downgrade request. A downgrade does not
    /// satisfy an eviction request.
    pub fn check_ack(
        &self,
        node: NodeId,
        resource: &ResourceKey,
        acked: CallbackAction,
    ) -> Result<(), CacheConsistencyError> {
        match (self.pending_action(node, resource), acked) {
            (Some(CallbackAction::Evict), CallbackAction::Downgrade) => {
                Err(CacheConsistencyError::mismatch(
                    node,
                    resource.clone(),
                    "downgrade acknowledged while eviction was requested",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Resolve the outstanding callback for `(node, resource)` as acknowledged.
    pub fn complete(&self, node: NodeId, resource: &ResourceKey) -> Option<CallbackId> {
        let mut state = self.pending.lock();
        let id = state.by_target.get(&(node, resource.clone())).copied()?;
        let pending = state.take(id)?;
        let _ = pending.tx.send(CallbackResolution::Acknowledged);
        Some(id)
    }

    /// Drop an outstanding callback without resolving it.
    pub fn cancel(&self, id: CallbackId) -> bool {
        self.pending.lock().take(id).is_some()
    }

    /// Cancel every callback addressed to `node`.
    pub fn cancel_node(&self, node: NodeId) -> usize {
        let mut state = self.pending.lock();
        let ids: Vec<CallbackId> = state
            .by_id
            .iter()
            .filter(|(_, p)| p.holder == node)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(p) = state.take(*id) {
                let _ = p.tx.send(CallbackResolution::Cancelled);
            }
        }
        ids.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().by_id.len()
    }
}
