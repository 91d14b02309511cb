//! Node facade: session, transactions, fetch-and-grant and callbacks.

use crate::cache::entry::{CacheState, CachedValue};
use crate::cache::node_cache::{NodeCache, RevokeStart, WriteSet};
use crate::cache::update_queue::{RetryPolicy, Update, UpdateQueue};
use crate::core::config::NodeConfig;
use crate::core::error::{CacheConsistencyError, CoherenceError, CoherenceResult};
use crate::protocol::callback::{callback_channel, CallbackAction, CallbackReceiver, CallbackRequest, CallbackSender};
use crate::protocol::server::AuthorityLink;
use crate::protocol::types::{
    AccessLevel, BindingValue, NodeId, ObjectId, ObjectIdRange, ObjectValue, ResourceKey,
    SessionId,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Counters describing node activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub fetches: u64,
    pub commits: u64,
    pub commits_rejected: u64,
    pub callbacks_served: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct Counters {
    fetches: AtomicU64,
    commits: AtomicU64,
    commits_rejected: AtomicU64,
    callbacks_served: AtomicU64,
    reconnects: AtomicU64,
}

/// State tied to one authority session.
#[derive(Debug)]
struct SessionState {
    session: SessionId,
    queue: UpdateQueue,
}

struct NodeInner {
    id: NodeId,
    link: Arc<dyn AuthorityLink>,
    config: NodeConfig,
    retry: RetryPolicy,
    cache: NodeCache,
    session: RwLock<Arc<SessionState>>,
    callback_tx: CallbackSender,
    reconnecting: tokio::sync::Mutex<()>,
    oids: Mutex<ObjectIdRange>,
    shutdown: watch::Sender<bool>,
    callback_loop: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

/// A cluster node with its local cache.
///
/// Cloning is cheap; clones share the same cache and session.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Register with the authority and start serving callbacks.
    pub async fn connect(
        id: NodeId,
        link: Arc<dyn AuthorityLink>,
        config: NodeConfig,
    ) -> CoherenceResult<Self> {
        let (callback_tx, callback_rx) = callback_channel();
        let session = link.register_node(id, callback_tx.clone()).await?;
        let retry = RetryPolicy::from_config(&config);

        let cache = NodeCache::new(id);
        cache.reset(session.epoch);
        let state = SessionState {
            session,
            queue: UpdateQueue::new(session, link.clone(), retry),
        };
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(NodeInner {
            id,
            link,
            config,
            retry,
            cache,
            session: RwLock::new(Arc::new(state)),
            callback_tx,
            reconnecting: tokio::sync::Mutex::new(()),
            oids: Mutex::new(ObjectIdRange::empty()),
            shutdown,
            callback_loop: Mutex::new(None),
            counters: Counters::default(),
        });

        let handle = tokio::spawn(serve_callbacks(
            Arc::downgrade(&inner),
            callback_rx,
            inner.shutdown.subscribe(),
        ));
        *inner.callback_loop.lock() = Some(handle);

        tracing::info!(node = %id, session = %session, "node connected");
        Ok(Self { inner })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Current session.
    pub fn session(&self) -> SessionId {
        self.inner.session.read().session
    }

    pub fn cache(&self) -> &NodeCache {
        &self.inner.cache
    }

    /// Local state of a cached object.
    pub fn object_state(&self, oid: ObjectId) -> CacheState {
        self.inner.cache.state(&ResourceKey::Object(oid))
    }

    /// Local state of a cached binding.
    pub fn binding_state(&self, name: &str) -> CacheState {
        self.inner.cache.state(&ResourceKey::binding(name))
    }

    pub fn stats(&self) -> NodeStats {
        let c = &self.inner.counters;
        NodeStats {
            fetches: c.fetches.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            commits_rejected: c.commits_rejected.load(Ordering::Relaxed),
            callbacks_served: c.callbacks_served.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Start a transaction.
    pub fn begin(&self) -> Transaction {
        Transaction {
            node: self.clone(),
            writes: WriteSet::default(),
        }
    }

    /// Read an object at `level`, fetching it on a miss.
    pub async fn get_object(&self, oid: ObjectId, level: AccessLevel) -> CoherenceResult<ObjectValue> {
        let value = self.inner.acquire(&ResourceKey::Object(oid), level).await?;
        value
            .into_object()
            .ok_or_else(|| CoherenceError::invalid(format!("{} is not an object", oid)))
    }

    /// Read a binding at `level`, fetching it on a miss.
    pub async fn get_binding(&self, name: &str, level: AccessLevel) -> CoherenceResult<BindingValue> {
        let value = self.inner.acquire(&ResourceKey::binding(name), level).await?;
        value
            .into_binding()
            .ok_or_else(|| CoherenceError::invalid(format!("{:?} is not a binding", name)))
    }

    /// Wait until every queued commit and acknowledgement has been delivered.
    pub async fn flush(&self) {
        let state = self.inner.current();
        state.queue.flush().await;
    }

    /// Abandon the current session and open a fresh one. The cache is emptied.
    pub async fn reconnect(&self) -> CoherenceResult<SessionId> {
        self.inner.ensure_open()?;
        let session = self.session();
        self.inner.reconnect(session).await
    }

    /// Flush, end the session and stop serving callbacks.
    pub async fn shutdown(&self) -> CoherenceResult<()> {
        self.flush().await;
        let session = self.session();
        let result = self.inner.link.disconnect(session).await;
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.callback_loop.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!(node = %self.inner.id, session = %session, "node stopped");
        match result {
            Err(CoherenceError::Consistency(e)) if e.invalidates_session() => Ok(()),
            other => other,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("session", &self.session())
            .field("cache", &self.inner.cache.stats())
            .finish()
    }
}

impl NodeInner {
    fn current(&self) -> Arc<SessionState> {
        self.session.read().clone()
    }

    fn ensure_open(&self) -> CoherenceResult<()> {
        if *self.shutdown.borrow() {
            return Err(CoherenceError::Shutdown);
        }
        Ok(())
    }

    /// Return the value of `key` readable at `level`, fetching and granting
    /// it from the authority on a miss.
    async fn acquire(self: &Arc<Self>, key: &ResourceKey, level: AccessLevel) -> CoherenceResult<CachedValue> {
        self.ensure_open()?;
        let mut attempt = 0;
        loop {
            let state = self.current();
            if let Some(value) = self.cache.readable(key, level) {
                return Ok(value);
            }

            match self.fetch(&state, key, level).await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    return Err(CoherenceError::cancelled(format!(
                        "session {} ended during fetch of {}",
                        state.session, key
                    )))
                }
                Err(e) if e.is_retriable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    tracing::warn!(node = %self.id, resource = %key, attempt, error = %e, "retrying fetch");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
                Err(e) => {
                    self.recover(state.session, &e).await;
                    return Err(e);
                }
            }
        }
    }

    async fn fetch(
        self: &Arc<Self>,
        state: &SessionState,
        key: &ResourceKey,
        level: AccessLevel,
    ) -> CoherenceResult<Option<CachedValue>> {
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        self.cache.begin_fetch(key);
        let granted = match key {
            ResourceKey::Object(oid) => self
                .link
                .get_object(state.session, *oid, level)
                .await
                .map(|g| (CachedValue::Object(g.value), g.level, g.grant_seq)),
            ResourceKey::Binding(name) => self
                .link
                .get_binding(state.session, name, level)
                .await
                .map(|g| (CachedValue::Binding(g.value), g.level, g.grant_seq)),
        };

        match granted {
            Ok((value, granted_level, grant_seq)) => {
                let (installed, ready) = self.cache.install_grant(
                    state.session.epoch,
                    key,
                    value,
                    granted_level,
                    grant_seq,
                );
                self.spawn_callbacks(ready);
                Ok(installed)
            }
            Err(e) => {
                let ready = self.cache.end_fetch(key);
                self.spawn_callbacks(ready);
                Err(e)
            }
        }
    }

    /// Commit a write set. On success every change is durable.
    async fn commit(self: &Arc<Self>, writes: WriteSet) -> CoherenceResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;
        let state = self.current();
        let epoch = state.session.epoch;
        let ticket = self
            .cache
            .apply_commit(epoch, &writes, |keys| state.queue.register(keys))?;
        let keys = ticket.keys().to_vec();
        let batch = writes.to_batch(ticket.sequence);

        // The cache settles before any queued callback on these keys runs.
        let result = state
            .queue
            .submit_with(ticket, Update::Commit(batch), |result| match result {
                Ok(()) => {
                    self.cache.commit_acknowledged(epoch, &keys);
                    self.counters.commits.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    let dropped = self.cache.commit_rejected(epoch, &keys);
                    self.counters.commits_rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(node = %self.id, session = %state.session, dropped, error = %e, "commit failed");
                }
            })
            .await;
        if let Err(e) = &result {
            self.recover(state.session, e).await;
        }
        result
    }

    /// Reconnect when `error` means the session can no longer be used.
    async fn recover(self: &Arc<Self>, session: SessionId, error: &CoherenceError) {
        let lost = match error {
            CoherenceError::Consistency(e) => e.invalidates_session(),
            e => e.is_retriable(),
        };
        if !lost {
            return;
        }
        if let Err(e) = self.reconnect(session).await {
            tracing::error!(node = %self.id, error = %e, "reconnect failed");
        }
    }

    async fn reconnect(&self, failed: SessionId) -> CoherenceResult<SessionId> {
        let _guard = self.reconnecting.lock().await;
        let current = self.current();
        if current.session != failed {
            return Ok(current.session);
        }

        let session = self
            .link
            .register_node(self.id, self.callback_tx.clone())
            .await?;
        let state = Arc::new(SessionState {
            session,
            queue: UpdateQueue::new(session, self.link.clone(), self.retry),
        });
        let dropped = {
            let mut slot = self.session.write();
            let dropped = self.cache.reset(session.epoch);
            *slot = state;
            dropped
        };
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(node = %self.id, previous = %failed, session = %session, dropped, "reconnected under new epoch");
        Ok(session)
    }

    /// Take a fresh object id, reserving a new block when the current one
    /// is used up. Ids are never handed out twice.
    async fn next_object_id(self: &Arc<Self>) -> CoherenceResult<ObjectId> {
        self.ensure_open()?;
        let reserved = self.oids.lock().take();
        if let Some(oid) = reserved {
            return Ok(oid);
        }
        let session = self.current().session;
        let block = self
            .link
            .new_object_ids(session, self.config.oid_block_size)
            .await?;
        let mut oids = self.oids.lock();
        if oids.is_empty() {
            *oids = block;
        }
        oids.take()
            .ok_or_else(|| CoherenceError::invalid("authority returned an empty id block"))
    }

    fn spawn_callbacks(self: &Arc<Self>, requests: Vec<CallbackRequest>) {
        for request in requests {
            let inner = self.clone();
            tokio::spawn(async move { inner.handle_callback(request).await });
        }
    }

    /// Serve one eviction or downgrade request.
    async fn handle_callback(self: Arc<Self>, request: CallbackRequest) {
        let state = self.current();
        if request.session != state.session {
            tracing::debug!(node = %self.id, callback = %request.id, "callback for a previous session ignored");
            return;
        }

        let ticket = match self
            .cache
            .begin_revoke(&request, |keys| state.queue.register(keys))
        {
            RevokeStart::Deferred => {
                tracing::debug!(node = %self.id, callback = %request.id, resource = %request.resource, "callback deferred until grant installs");
                return;
            }
            RevokeStart::Ready { ticket, cached } => {
                if !cached {
                    tracing::debug!(node = %self.id, resource = %request.resource, "callback for uncached resource");
                }
                ticket
            }
        };

        let update = match request.action {
            CallbackAction::Evict => Update::Evict(request.resource.clone(), request.grant_seq),
            CallbackAction::Downgrade => {
                Update::Downgrade(request.resource.clone(), request.grant_seq)
            }
        };
        let result = state
            .queue
            .submit_with(ticket, update, |result| match result {
                Ok(()) => {
                    let next = self.cache.finish_revoke(
                        state.session.epoch,
                        &request.resource,
                        request.action,
                        request.grant_seq,
                    );
                    self.counters.callbacks_served.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(node = %self.id, callback = %request.id, resource = %request.resource, state = %next, "callback served");
                }
                Err(e) => {
                    self.cache.abort_revoke(&request.resource);
                    tracing::warn!(node = %self.id, callback = %request.id, error = %e, "callback acknowledgement failed");
                }
            })
            .await;
        if let Err(e) = result {
            self.recover(state.session, &e).await;
        }
    }
}

/// Callback service loop. Runs independently of outbound requests; each
/// request is served on its own task.
async fn serve_callbacks(
    node: Weak<NodeInner>,
    mut requests: CallbackReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else { break };
                let Some(inner) = node.upgrade() else { break };
                tokio::spawn(inner.handle_callback(request));
            }
            _ = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => break,
        }
    }
}

/// A unit of local work.
///
/// Reads go through the cache. Writes are buffered and made durable
/// together by [`Transaction::commit`], after the node has obtained
/// exclusive access to every resource written.
#[derive(Debug)]
pub struct Transaction {
    node: Node,
    writes: WriteSet,
}

impl Transaction {
    pub async fn read_object(&self, oid: ObjectId) -> CoherenceResult<ObjectValue> {
        if let Some(value) = self.writes.objects.get(&oid) {
            return Ok(value.clone());
        }
        if let Some(bytes) = self.writes.new_objects.get(&oid) {
            return Ok(Some(bytes.clone()));
        }
        self.node.get_object(oid, AccessLevel::Shared).await
    }

    pub async fn read_binding(&self, name: &str) -> CoherenceResult<BindingValue> {
        if let Some(target) = self.writes.bindings.get(name) {
            return Ok(*target);
        }
        if let Some(oid) = self.writes.new_bindings.get(name) {
            return Ok(Some(*oid));
        }
        self.node.get_binding(name, AccessLevel::Shared).await
    }

    /// Overwrite an existing object.
    pub async fn write_object(&mut self, oid: ObjectId, value: Bytes) -> CoherenceResult<()> {
        if let Some(slot) = self.writes.new_objects.get_mut(&oid) {
            *slot = value;
            return Ok(());
        }
        self.node
            .get_object(oid, AccessLevel::Exclusive)
            .await?;
        self.writes.objects.insert(oid, Some(value));
        Ok(())
    }

    /// Remove an object.
    pub async fn remove_object(&mut self, oid: ObjectId) -> CoherenceResult<()> {
        if self.writes.new_objects.remove(&oid).is_some() {
            return Ok(());
        }
        self.node
            .get_object(oid, AccessLevel::Exclusive)
            .await?;
        self.writes.objects.insert(oid, None);
        Ok(())
    }

    /// Create a new object under a fresh id.
    pub async fn create_object(&mut self, value: Bytes) -> CoherenceResult<ObjectId> {
        let oid = self.node.inner.next_object_id().await?;
        self.writes.new_objects.insert(oid, value);
        Ok(oid)
    }

    /// Point `name` at `oid`, creating or replacing the binding.
    pub async fn bind(&mut self, name: &str, oid: ObjectId) -> CoherenceResult<()> {
        if let Some(slot) = self.writes.new_bindings.get_mut(name) {
            *slot = oid;
            return Ok(());
        }
        self.node
            .get_binding(name, AccessLevel::Exclusive)
            .await?;
        self.writes.bindings.insert(name.to_string(), Some(oid));
        Ok(())
    }

    /// Create a binding that must not exist yet, without fetching it first.
    /// The commit fails if another node created it in the meantime.
    pub fn bind_new(&mut self, name: &str, oid: ObjectId) -> CoherenceResult<()> {
        if self.writes.bindings.contains_key(name) {
            return Err(CoherenceError::invalid(format!(
                "binding {:?} already written in this transaction",
                name
            )));
        }
        self.writes.new_bindings.insert(name.to_string(), oid);
        Ok(())
    }

    /// Remove a binding.
    pub async fn unbind(&mut self, name: &str) -> CoherenceResult<()> {
        if self.writes.new_bindings.remove(name).is_some() {
            return Ok(());
        }
        self.node
            .get_binding(name, AccessLevel::Exclusive)
            .await?;
        self.writes.bindings.insert(name.to_string(), None);
        Ok(())
    }

    /// Resources this transaction writes.
    pub fn write_keys(&self) -> HashSet<ResourceKey> {
        self.writes.keys().into_iter().collect()
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Make every buffered write durable, atomically.
    ///
    /// On [`CacheConsistencyError`] the affected entries are dropped; the
    /// caller must start a new transaction, which re-acquires ownership.
    pub async fn commit(self) -> CoherenceResult<()> {
        self.node.inner.commit(self.writes).await
    }
}

/// Whether `error` means the caller should rebuild its transaction.
pub fn needs_retry(error: &CoherenceError) -> bool {
    match error {
        CoherenceError::Consistency(CacheConsistencyError::MalformedBatch { .. }) => false,
        CoherenceError::Consistency(_) => true,
        CoherenceError::Cancelled { .. } => true,
        e => e.is_retriable(),
    }
}
