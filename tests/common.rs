//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

use async_trait::async_trait;
use bytes::Bytes;
use coherence::authority::Authority;
use coherence::cache::Node;
use coherence::core::config::{AuthorityConfig, Config, NodeConfig};
use coherence::core::error::{CoherenceError, CoherenceResult};
use coherence::protocol::callback::{callback_channel, CallbackReceiver, CallbackSender};
use coherence::protocol::server::{AuthorityLink, CommitBatch, GrantServer, UpdateQueueServer};
use coherence::protocol::types::{
    AccessLevel, BindingValue, Grant, NodeId, ObjectId, ObjectIdRange, ObjectValue, SessionId,
};
use coherence::storage::{DurableStore, MemoryStore, StoreBatch, StoreError, StoreStats};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

// ============================================================================
// Config files
// ============================================================================

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    let config_content = r#"
[cluster]
node_count = 2
"#;

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Create a configuration with custom settings.
pub fn create_config_with_settings(
    callback_timeout_ms: u64,
    node_count: u32,
    log_level: &str,
) -> NamedTempFile {
    let config_content = format!(
        r#"
[authority]
callback_timeout_ms = {}

[cluster]
node_count = {}

[telemetry]
log_level = "{}"
"#,
        callback_timeout_ms, node_count, log_level
    );

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Load a config from a temp file.
pub fn load_config(file: &NamedTempFile) -> Config {
    Config::from_file(file.path()).expect("Failed to load config")
}

// ============================================================================
// Cluster builders
// ============================================================================

/// Authority settings with a short callback timeout.
pub fn fast_authority_config() -> AuthorityConfig {
    AuthorityConfig {
        callback_timeout_ms: 200,
        ..AuthorityConfig::default()
    }
}

/// Node settings with quick retries.
pub fn fast_node_config() -> NodeConfig {
    NodeConfig {
        oid_block_size: 4,
        max_transport_retries: 2,
        retry_backoff_ms: 1,
    }
}

/// An authority over a store, plus connected nodes.
pub struct TestCluster {
    pub store: Arc<dyn DurableStore>,
    pub authority: Arc<Authority>,
    pub nodes: Vec<Node>,
}

impl TestCluster {
    /// Build an authority over `store` and connect `nodes` nodes to it.
    pub async fn start(store: Arc<dyn DurableStore>, nodes: u64) -> Self {
        let authority = Arc::new(Authority::with_config(
            store.clone(),
            &fast_authority_config(),
        ));
        let mut connected = Vec::new();
        for n in 1..=nodes {
            let link: Arc<dyn AuthorityLink> = authority.clone();
            let node = Node::connect(NodeId(n), link, fast_node_config())
                .await
                .expect("node connects");
            connected.push(node);
        }
        Self {
            store,
            authority,
            nodes: connected,
        }
    }

    /// Cluster over an empty in-memory store.
    pub async fn empty(nodes: u64) -> Self {
        Self::start(Arc::new(MemoryStore::new()), nodes).await
    }

    /// Cluster over a store seeded with `objects`.
    pub async fn seeded(objects: &[(u64, &'static [u8])], nodes: u64) -> Self {
        let store = MemoryStore::with_contents(
            objects
                .iter()
                .map(|(oid, v)| (ObjectId(*oid), Bytes::from_static(v))),
            [],
        );
        Self::start(Arc::new(store), nodes).await
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }
}

/// Register a session directly with the authority, keeping the raw callback
/// receiver so the test decides whether and when to answer.
pub async fn raw_session(authority: &Authority, node: u64) -> (SessionId, CallbackReceiver) {
    let (tx, rx) = callback_channel();
    let session = authority
        .register_node(NodeId(node), tx)
        .await
        .expect("register");
    (session, rx)
}

pub fn bytes(value: &'static [u8]) -> Bytes {
    Bytes::from_static(value)
}

/// Commit batch writing `values` to owned objects.
pub fn object_batch(sequence: u64, writes: &[(u64, &'static [u8])]) -> CommitBatch {
    CommitBatch {
        sequence,
        oids: writes.iter().map(|(oid, _)| ObjectId(*oid)).collect(),
        oid_values: writes.iter().map(|(_, v)| Some(bytes(v))).collect(),
        ..CommitBatch::default()
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

// ============================================================================
// Fault injection
// ============================================================================

/// A store that can be told to fail its next batches.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    fail_next: AtomicU32,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            fail_next: AtomicU32::new(0),
        }
    }

    pub fn fail_next(&self, batches: u32) {
        self.fail_next.store(batches, Ordering::SeqCst);
    }
}

impl DurableStore for FaultyStore {
    fn apply_batch(&self, batch: &StoreBatch) -> Result<(), StoreError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable {
                message: "injected failure".to_string(),
            });
        }
        self.inner.apply_batch(batch)
    }

    fn object(&self, oid: ObjectId) -> ObjectValue {
        self.inner.object(oid)
    }

    fn binding(&self, name: &str) -> BindingValue {
        self.inner.binding(name)
    }

    fn max_object_id(&self) -> Option<ObjectId> {
        self.inner.max_object_id()
    }

    fn stats(&self) -> StoreStats {
        self.inner.stats()
    }
}

/// A link to the authority that can lose requests or replies.
///
/// A lost request never reaches the authority. A lost reply reaches it and
/// takes effect, but the caller sees a transport failure and resends.
pub struct FlakyLink {
    inner: Arc<Authority>,
    lose_requests: AtomicU32,
    lose_replies: AtomicU32,
    down: AtomicBool,
}

impl FlakyLink {
    pub fn new(inner: Arc<Authority>) -> Self {
        Self {
            inner,
            lose_requests: AtomicU32::new(0),
            lose_replies: AtomicU32::new(0),
            down: AtomicBool::new(false),
        }
    }

    pub fn lose_requests(&self, n: u32) {
        self.lose_requests.store(n, Ordering::SeqCst);
    }

    pub fn lose_replies(&self, n: u32) {
        self.lose_replies.store(n, Ordering::SeqCst);
    }

    /// Fail every commit and acknowledgement until brought back up.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn pass<T>(
        &self,
        call: impl std::future::Future<Output = CoherenceResult<T>>,
    ) -> CoherenceResult<T> {
        if self.down.load(Ordering::SeqCst) || Self::take(&self.lose_requests) {
            return Err(CoherenceError::transport("request lost"));
        }
        let result = call.await;
        if Self::take(&self.lose_replies) {
            return Err(CoherenceError::transport("reply lost"));
        }
        result
    }
}

#[async_trait]
impl UpdateQueueServer for FlakyLink {
    async fn commit(&self, session: SessionId, batch: CommitBatch) -> CoherenceResult<()> {
        self.pass(self.inner.commit(session, batch)).await
    }

    async fn evict_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.pass(self.inner.evict_object(session, oid, grant_seq)).await
    }

    async fn downgrade_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.pass(self.inner.downgrade_object(session, oid, grant_seq)).await
    }

    async fn evict_binding(
        &self,
        session: SessionId,
        name: &str,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.pass(self.inner.evict_binding(session, name, grant_seq)).await
    }

    async fn downgrade_binding(
        &self,
        session: SessionId,
        name: &str,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.pass(self.inner.downgrade_binding(session, name, grant_seq)).await
    }
}

#[async_trait]
impl GrantServer for FlakyLink {
    async fn register_node(
        &self,
        node_id: NodeId,
        callbacks: CallbackSender,
    ) -> CoherenceResult<SessionId> {
        self.inner.register_node(node_id, callbacks).await
    }

    async fn disconnect(&self, session: SessionId) -> CoherenceResult<()> {
        self.inner.disconnect(session).await
    }

    async fn get_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        level: AccessLevel,
    ) -> CoherenceResult<Grant<ObjectValue>> {
        self.inner.get_object(session, oid, level).await
    }

    async fn get_binding(
        &self,
        session: SessionId,
        name: &str,
        level: AccessLevel,
    ) -> CoherenceResult<Grant<BindingValue>> {
        self.inner.get_binding(session, name, level).await
    }

    async fn new_object_ids(
        &self,
        session: SessionId,
        count: u64,
    ) -> CoherenceResult<ObjectIdRange> {
        self.inner.new_object_ids(session, count).await
    }
}

/// Give spawned tasks a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
