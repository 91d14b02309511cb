//! The authority: arbitration, commits and session lifecycle.

use crate::authority::callbacks::{CallbackDispatcher, CallbackResolution, CallbackTicket};
use crate::authority::ledger::{CommitKey, CommitLedger, CommitOutcome, LedgerCheck};
use crate::authority::lock_table::{DowngradeOutcome, Gate, Holding, LockTable, TableState};
use crate::authority::session::{Liveness, SessionRegistry};
use crate::core::config::AuthorityConfig;
use crate::core::error::{CacheConsistencyError, CoherenceError, CoherenceResult};
use crate::protocol::callback::{CallbackAction, CallbackSender};
use crate::protocol::server::{CommitBatch, GrantServer, UpdateQueueServer};
use crate::protocol::types::{
    AccessLevel, BindingValue, Grant, NodeId, ObjectId, ObjectIdRange, ObjectValue, ResourceKey,
    SessionId,
};
use crate::storage::{DurableStore, StoreBatch, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Counters describing authority activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthorityStats {
    pub grants: u64,
    pub commits_applied: u64,
    pub commits_rejected: u64,
    pub commits_redelivered: u64,
    pub callbacks_issued: u64,
    pub callback_timeouts: u64,
    pub nodes_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    grants: AtomicU64,
    commits_applied: AtomicU64,
    commits_rejected: AtomicU64,
    commits_redelivered: AtomicU64,
    callbacks_issued: AtomicU64,
    callback_timeouts: AtomicU64,
    nodes_failed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Central arbiter of ownership and the only writer of the durable store.
pub struct Authority {
    store: Arc<dyn DurableStore>,
    locks: LockTable,
    sessions: SessionRegistry,
    callbacks: CallbackDispatcher,
    ledger: Mutex<CommitLedger>,
    next_oid: AtomicU64,
    callback_timeout: Duration,
    counters: Counters,
}

impl Authority {
    /// Create an authority over `store` with default settings.
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self::with_config(store, &AuthorityConfig::default())
    }

    pub fn with_config(store: Arc<dyn DurableStore>, config: &AuthorityConfig) -> Self {
        let next_oid = store.max_object_id().map_or(1, |oid| oid.0 + 1);
        Self {
            store,
            locks: LockTable::new(),
            sessions: SessionRegistry::new(),
            callbacks: CallbackDispatcher::new(),
            ledger: Mutex::new(CommitLedger::new(
                config.commit_ledger_ttl(),
                config.commit_ledger_capacity,
            )),
            next_oid: AtomicU64::new(next_oid),
            callback_timeout: config.callback_timeout(),
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn callbacks(&self) -> &CallbackDispatcher {
        &self.callbacks
    }

    pub fn stats(&self) -> AuthorityStats {
        let c = &self.counters;
        AuthorityStats {
            grants: c.grants.load(Ordering::Relaxed),
            commits_applied: c.commits_applied.load(Ordering::Relaxed),
            commits_rejected: c.commits_rejected.load(Ordering::Relaxed),
            commits_redelivered: c.commits_redelivered.load(Ordering::Relaxed),
            callbacks_issued: c.callbacks_issued.load(Ordering::Relaxed),
            callback_timeouts: c.callback_timeouts.load(Ordering::Relaxed),
            nodes_failed: c.nodes_failed.load(Ordering::Relaxed),
        }
    }

    /// Declare `session` dead: invalidate its epoch, reclaim everything it
    /// holds and cancel callbacks addressed to it and grants it waits on.
    ///
    /// Returns false if the session had already ended.
    pub fn fail_node(&self, session: SessionId, reason: &str) -> bool {
        if !self.sessions.end(session, Liveness::Failed) {
            return false;
        }
        let reclaimed = self.reclaim(session.node_id);
        Counters::bump(&self.counters.nodes_failed);
        tracing::warn!(
            session = %session,
            reclaimed,
            reason,
            "node failed, holdings reclaimed"
        );
        true
    }

    /// End every live session.
    pub fn shutdown(&self) {
        for session in self.sessions.live() {
            if self.sessions.end(session, Liveness::Disconnected) {
                self.reclaim(session.node_id);
            }
        }
        tracing::info!("authority stopped");
    }

    fn reclaim(&self, node: NodeId) -> usize {
        let reclaimed = self.locks.release_all(node).len();
        self.callbacks.cancel_node(node);
        self.ledger.lock().forget_node(node);
        reclaimed
    }

    /// Obtain `level` on `key` for `session`, revoking conflicting holders.
    async fn acquire(
        &self,
        session: SessionId,
        key: &ResourceKey,
        level: AccessLevel,
    ) -> CoherenceResult<Holding> {
        self.sessions.validate(session)?;
        let node = session.node_id;

        if let Some(h) = self.locks.read().holding(key, node) {
            if h.level >= level && h.epoch == session.epoch {
                return Ok(h);
            }
        }

        let mut cancel = self
            .sessions
            .cancellation(session)
            .ok_or_else(|| CacheConsistencyError::stale_epoch(node, session.epoch, None))?;

        let ticket = self.locks.enqueue(key, node, level);
        let gate = self.locks.gate(key);
        let result = self
            .acquire_gated(session, key, level, gate.clone(), &mut cancel)
            .await;

        drop(gate);
        self.locks.dequeue(key, ticket);
        self.locks.retire_gate(key);

        if let Ok(holding) = &result {
            Counters::bump(&self.counters.grants);
            tracing::debug!(
                session = %session,
                resource = %key,
                level = %holding.level,
                grant_seq = holding.grant_seq,
                "granted"
            );
        }
        result
    }

    /// Grant under the resource gate, once every conflicting holder has
    /// given way.
    async fn acquire_gated(
        &self,
        session: SessionId,
        key: &ResourceKey,
        level: AccessLevel,
        gate: Gate,
        cancel: &mut watch::Receiver<bool>,
    ) -> CoherenceResult<Holding> {
        let node = session.node_id;
        let _section = tokio::select! {
            guard = gate.lock_owned() => guard,
            _ = async { cancel.wait_for(|ended| *ended).await.is_ok() } => {
                return Err(CoherenceError::cancelled(format!(
                    "{} ended while waiting for {}",
                    session, key
                )));
            }
        };
        self.sessions.validate(session)?;
        self.revoke_conflicts(key, node, level).await?;

        let holding = self
            .locks
            .grant(key, node, level, session.epoch)
            .map_err(|conflicts| {
                CacheConsistencyError::mismatch(
                    node,
                    key.clone(),
                    format!("{} holders remain after revocation", conflicts.len()),
                )
            })?;

        // A failure that raced the grant would otherwise leave it behind.
        if let Err(e) = self.sessions.validate(session) {
            self.locks.release(key, node);
            return Err(e.into());
        }
        Ok(holding)
    }

    /// Evict or downgrade every holder that conflicts with `node` holding
    /// `level`, waiting for each to acknowledge.
    async fn revoke_conflicts(
        &self,
        key: &ResourceKey,
        node: NodeId,
        level: AccessLevel,
    ) -> CoherenceResult<()> {
        let action = CallbackAction::for_request(level);
        loop {
            let conflicts = self.locks.conflicting(key, node, level);
            if conflicts.is_empty() {
                return Ok(());
            }

            let mut tickets = Vec::with_capacity(conflicts.len());
            for (holder, holding) in conflicts {
                match self.sessions.route(holder) {
                    Some((holder_session, sender)) if holder_session.epoch == holding.epoch => {
                        match self.issue(&sender, holder_session, key, action, holding) {
                            Some(ticket) => tickets.push(ticket),
                            None => {
                                self.fail_node(holder_session, "callback channel closed");
                            }
                        }
                    }
                    _ => {
                        // Left over from a session that already ended.
                        self.locks.release(key, holder);
                    }
                }
            }

            let deadline = Instant::now() + self.callback_timeout;
            for ticket in tickets {
                self.await_ticket(ticket, deadline).await;
            }
        }
    }

    fn issue(
        &self,
        sender: &CallbackSender,
        holder: SessionId,
        key: &ResourceKey,
        action: CallbackAction,
        holding: Holding,
    ) -> Option<CallbackTicket> {
        let ticket = self
            .callbacks
            .issue(sender, holder, key.clone(), action, holding.grant_seq)
            .ok()?;
        Counters::bump(&self.counters.callbacks_issued);
        Some(ticket)
    }

    async fn await_ticket(&self, ticket: CallbackTicket, deadline: Instant) {
        match tokio::time::timeout_at(deadline, ticket.resolved).await {
            Ok(Ok(CallbackResolution::Acknowledged)) => {}
            Ok(Ok(CallbackResolution::Cancelled)) | Ok(Err(_)) => {
                tracing::debug!(callback = %ticket.id, holder = %ticket.holder, "callback cancelled");
            }
            Err(_) => {
                self.callbacks.cancel(ticket.id);
                Counters::bump(&self.counters.callback_timeouts);
                tracing::warn!(
                    callback = %ticket.id,
                    holder = %ticket.holder,
                    resource = %ticket.resource,
                    action = %ticket.action,
                    "callback timed out"
                );
                self.fail_node(ticket.holder, "callback timed out");
            }
        }
    }

    /// Validate and apply a commit, recording new allocations as holdings.
    fn apply_commit(&self, session: SessionId, batch: &CommitBatch) -> CoherenceResult<()> {
        batch.validate_shape()?;
        let store_batch = to_store_batch(batch)?;
        let allocates = batch.new_oids > 0 || batch.new_names > 0;

        if allocates {
            let mut state = self.locks.write();
            self.validate_commit(&state, session, batch)?;
            self.store.apply_batch(&store_batch).map_err(store_error)?;
            for key in allocated_keys(batch) {
                self.locks
                    .grant_locked(&mut state, &key, session.node_id, AccessLevel::Exclusive, session.epoch)
                    .map_err(|_| {
                        CacheConsistencyError::mismatch(
                            session.node_id,
                            key.clone(),
                            "allocation conflicts with a holder",
                        )
                    })?;
            }
        } else {
            let state = self.locks.read();
            self.validate_commit(&state, session, batch)?;
            self.store.apply_batch(&store_batch).map_err(store_error)?;
        }
        Ok(())
    }

    fn validate_commit(
        &self,
        state: &TableState,
        session: SessionId,
        batch: &CommitBatch,
    ) -> Result<(), CacheConsistencyError> {
        self.sessions.validate(session)?;
        let node = session.node_id;

        for oid in batch.fixed_oids() {
            state.check_exclusive(&ResourceKey::Object(*oid), node, session.epoch)?;
        }
        for name in batch.fixed_names() {
            state.check_exclusive(&ResourceKey::Binding(name.clone()), node, session.epoch)?;
        }
        for oid in batch.allocated_oids() {
            let key = ResourceKey::Object(*oid);
            if self.store.contains_object(*oid) {
                return Err(CacheConsistencyError::AlreadyExists { resource: key });
            }
            state.check_unheld_by_others(&key, node)?;
        }
        for name in batch.allocated_names() {
            let key = ResourceKey::Binding(name.clone());
            if self.store.contains_binding(name) {
                return Err(CacheConsistencyError::AlreadyExists { resource: key });
            }
            state.check_unheld_by_others(&key, node)?;
        }
        Ok(())
    }

    /// Apply an eviction or downgrade acknowledgement for the grant
    /// `grant_seq`. A holding granted after it is left alone.
    fn acknowledge(
        &self,
        session: SessionId,
        key: ResourceKey,
        action: CallbackAction,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.sessions.validate(session)?;
        let node = session.node_id;
        let current = self.locks.read().holding(&key, node);
        if let Some(newer) = current.filter(|h| h.grant_seq > grant_seq) {
            tracing::debug!(
                session = %session,
                resource = %key,
                acked = grant_seq,
                current = newer.grant_seq,
                "acknowledgement for an earlier grant ignored"
            );
            return Ok(());
        }
        self.callbacks.check_ack(node, &key, action)?;

        let applied = match action {
            CallbackAction::Evict => self
                .locks
                .release_granted(&key, node, grant_seq)
                .map(|_| ()),
            CallbackAction::Downgrade => self
                .locks
                .downgrade_granted(&key, node, grant_seq)
                .map(|outcome| {
                    if outcome == DowngradeOutcome::NotHeld {
                        tracing::debug!(
                            session = %session,
                            resource = %key,
                            "downgrade of unheld resource"
                        );
                    }
                }),
        };
        if let Err(newer) = applied {
            // Regranted between the check above and the update.
            tracing::debug!(
                session = %session,
                resource = %key,
                acked = grant_seq,
                current = newer.grant_seq,
                "acknowledgement for an earlier grant ignored"
            );
            return Ok(());
        }

        if let Some(id) = self.callbacks.complete(node, &key) {
            tracing::debug!(callback = %id, session = %session, resource = %key, action = %action, "callback acknowledged");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority")
            .field("resources", &self.locks.len())
            .field("live_sessions", &self.sessions.live().len())
            .field("pending_callbacks", &self.callbacks.pending())
            .field("callback_timeout", &self.callback_timeout)
            .finish()
    }
}

fn to_store_batch(batch: &CommitBatch) -> Result<StoreBatch, CacheConsistencyError> {
    let fixed_oids = batch.oids.len() - batch.new_oids;
    let fixed_names = batch.names.len() - batch.new_names;

    let mut new_objects = Vec::with_capacity(batch.new_oids);
    for (oid, value) in batch.oids[fixed_oids..]
        .iter()
        .zip(&batch.oid_values[fixed_oids..])
    {
        let bytes = value.clone().ok_or_else(|| {
            CacheConsistencyError::malformed(format!("new object {} has no value", oid))
        })?;
        new_objects.push((*oid, bytes));
    }

    let mut new_bindings = Vec::with_capacity(batch.new_names);
    for (name, target) in batch.names[fixed_names..]
        .iter()
        .zip(&batch.name_values[fixed_names..])
    {
        let oid = target.ok_or_else(|| {
            CacheConsistencyError::malformed(format!("new binding {:?} has no target", name))
        })?;
        new_bindings.push((name.clone(), oid));
    }

    Ok(StoreBatch {
        object_writes: batch.oids[..fixed_oids]
            .iter()
            .copied()
            .zip(batch.oid_values[..fixed_oids].iter().cloned())
            .collect(),
        new_objects,
        binding_writes: batch.names[..fixed_names]
            .iter()
            .cloned()
            .zip(batch.name_values[..fixed_names].iter().copied())
            .collect(),
        new_bindings,
    })
}

fn allocated_keys(batch: &CommitBatch) -> Vec<ResourceKey> {
    batch
        .allocated_oids()
        .iter()
        .map(|oid| ResourceKey::Object(*oid))
        .chain(
            batch
                .allocated_names()
                .iter()
                .map(|n| ResourceKey::Binding(n.clone())),
        )
        .collect()
}

fn store_error(e: StoreError) -> CoherenceError {
    match e {
        StoreError::AlreadyExists { resource } => {
            CacheConsistencyError::AlreadyExists { resource }.into()
        }
        StoreError::Unavailable { message } => CoherenceError::store(message),
    }
}

#[async_trait]
impl UpdateQueueServer for Authority {
    async fn commit(&self, session: SessionId, batch: CommitBatch) -> CoherenceResult<()> {
        self.sessions.validate(session)?;
        let key = CommitKey::new(session, batch.sequence);

        let check = self.ledger.lock().begin(key, Instant::now());
        match check {
            LedgerCheck::Fresh => {}
            LedgerCheck::Recorded(outcome) => {
                Counters::bump(&self.counters.commits_redelivered);
                tracing::debug!(commit = %key, "redelivered commit answered from ledger");
                return outcome.into_result();
            }
            LedgerCheck::InFlight => {
                return Err(CoherenceError::transport(format!(
                    "commit {} is already being applied",
                    key
                )));
            }
            LedgerCheck::Full => {
                tracing::warn!(commit = %key, "commit ledger full, commit turned away");
                return Err(CoherenceError::transport(format!(
                    "commit ledger full, {} not accepted",
                    key
                )));
            }
        }

        let result = self.apply_commit(session, &batch);
        match &result {
            Ok(()) => {
                self.ledger
                    .lock()
                    .finish(key, CommitOutcome::Applied, Instant::now());
                Counters::bump(&self.counters.commits_applied);
                tracing::debug!(
                    commit = %key,
                    oids = batch.oids.len(),
                    names = batch.names.len(),
                    "commit applied"
                );
            }
            Err(CoherenceError::Consistency(e)) => {
                self.ledger
                    .lock()
                    .finish(key, CommitOutcome::Rejected(e.clone()), Instant::now());
                Counters::bump(&self.counters.commits_rejected);
                tracing::info!(commit = %key, error = %e, "commit rejected");
            }
            Err(e) => {
                self.ledger.lock().abandon(key);
                tracing::warn!(commit = %key, error = %e, "commit failed");
            }
        }
        result
    }

    async fn evict_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.acknowledge(session, ResourceKey::Object(oid), CallbackAction::Evict, grant_seq)
    }

    async fn downgrade_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.acknowledge(session, ResourceKey::Object(oid), CallbackAction::Downgrade, grant_seq)
    }

    async fn evict_binding(
        &self,
        session: SessionId,
        name: &str,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.acknowledge(session, ResourceKey::binding(name), CallbackAction::Evict, grant_seq)
    }

    async fn downgrade_binding(
        &self,
        session: SessionId,
        name: &str,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.acknowledge(session, ResourceKey::binding(name), CallbackAction::Downgrade, grant_seq)
    }
}

#[async_trait]
impl GrantServer for Authority {
    async fn register_node(
        &self,
        node_id: NodeId,
        callbacks: CallbackSender,
    ) -> CoherenceResult<SessionId> {
        let (session, superseded) = self.sessions.register(node_id, callbacks);
        if let Some(old) = superseded {
            let reclaimed = self.reclaim(node_id);
            tracing::info!(session = %session, previous = %old, reclaimed, "node re-registered");
        } else {
            // A previous session that failed was already reclaimed.
            self.reclaim(node_id);
            tracing::info!(session = %session, "node registered");
        }
        Ok(session)
    }

    async fn disconnect(&self, session: SessionId) -> CoherenceResult<()> {
        self.sessions.validate(session)?;
        if self.sessions.end(session, Liveness::Disconnected) {
            let reclaimed = self.reclaim(session.node_id);
            tracing::info!(session = %session, reclaimed, "node disconnected");
        }
        Ok(())
    }

    async fn get_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        level: AccessLevel,
    ) -> CoherenceResult<Grant<ObjectValue>> {
        let holding = self.acquire(session, &ResourceKey::Object(oid), level).await?;
        Ok(Grant {
            value: self.store.object(oid),
            level: holding.level,
            grant_seq: holding.grant_seq,
        })
    }

    async fn get_binding(
        &self,
        session: SessionId,
        name: &str,
        level: AccessLevel,
    ) -> CoherenceResult<Grant<BindingValue>> {
        let holding = self.acquire(session, &ResourceKey::binding(name), level).await?;
        Ok(Grant {
            value: self.store.binding(name),
            level: holding.level,
            grant_seq: holding.grant_seq,
        })
    }

    async fn new_object_ids(
        &self,
        session: SessionId,
        count: u64,
    ) -> CoherenceResult<ObjectIdRange> {
        self.sessions.validate(session)?;
        if count == 0 {
            return Ok(ObjectIdRange::empty());
        }
        let start = self
            .next_oid
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| next.checked_add(count))
            .map_err(|next| {
                CoherenceError::invalid(format!(
                    "cannot reserve {} object ids starting at {}",
                    count, next
                ))
            })?;
        tracing::debug!(session = %session, start, count, "object ids reserved");
        Ok(ObjectIdRange::new(start, start + count))
    }
}
