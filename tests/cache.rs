//! Node integration tests: transactions, callbacks, ordering, recovery.

mod common;

use async_trait::async_trait;
use coherence::authority::Authority;
use coherence::cache::update_queue::QueueTicket;
use coherence::cache::{needs_retry, CacheState, CachedValue, Node, RetryPolicy, Update, UpdateQueue};
use coherence::core::config::NodeConfig;
use coherence::core::error::{CacheConsistencyError, CoherenceError, CoherenceResult};
use coherence::protocol::callback::CallbackSender;
use coherence::protocol::server::{AuthorityLink, CommitBatch, GrantServer, UpdateQueueServer};
use coherence::protocol::types::{
    AccessLevel, BindingValue, Epoch, Grant, NodeId, ObjectId, ObjectIdRange, ObjectValue,
    ResourceKey, SessionId,
};
use coherence::storage::{DurableStore, MemoryStore};
use common::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Revocation
// ============================================================================

#[tokio::test]
async fn test_holder_is_evicted_before_conflicting_grant() {
    let cluster = TestCluster::seeded(&[(5, b"five")], 2).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    a.get_object(ObjectId(5), AccessLevel::Exclusive)
        .await
        .unwrap();
    assert_eq!(a.object_state(ObjectId(5)), CacheState::Exclusive);

    let value = b
        .get_object(ObjectId(5), AccessLevel::Exclusive)
        .await
        .unwrap();
    assert_eq!(value, Some(bytes(b"five")));

    // The acknowledgement was accepted before b's grant.
    assert_eq!(
        cluster
            .authority
            .locks()
            .holders(&ResourceKey::Object(ObjectId(5))),
        vec![(b.id(), AccessLevel::Exclusive)]
    );
    assert_eq!(cluster.authority.callbacks().pending(), 0);
    assert!(eventually(WAIT, || a.object_state(ObjectId(5)) == CacheState::Uncached).await);
    assert!(eventually(WAIT, || a.stats().callbacks_served == 1).await);
}

#[tokio::test]
async fn test_downgrade_keeps_last_committed_value() {
    let cluster = TestCluster::seeded(&[(5, b"five")], 2).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let mut tx = a.begin();
    tx.write_object(ObjectId(5), bytes(b"v2")).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(a.object_state(ObjectId(5)), CacheState::Exclusive);

    let seen = b.get_object(ObjectId(5), AccessLevel::Shared).await.unwrap();
    assert_eq!(seen, Some(bytes(b"v2")));

    assert!(eventually(WAIT, || a.object_state(ObjectId(5)) == CacheState::Shared).await);
    let entry = a
        .cache()
        .lookup(&ResourceKey::Object(ObjectId(5)))
        .expect("still cached");
    assert_eq!(entry.value, CachedValue::Object(Some(bytes(b"v2"))));

    // Still readable locally without another fetch.
    let fetches = a.stats().fetches;
    assert_eq!(
        a.get_object(ObjectId(5), AccessLevel::Shared).await.unwrap(),
        Some(bytes(b"v2"))
    );
    assert_eq!(a.stats().fetches, fetches);
}

#[tokio::test]
async fn test_binding_ownership_moves_between_nodes() {
    let cluster = TestCluster::seeded(&[(1, b"one"), (2, b"two")], 2).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let mut tx = a.begin();
    tx.bind("root", ObjectId(1)).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = b.begin();
    assert_eq!(tx.read_binding("root").await.unwrap(), Some(ObjectId(1)));
    tx.bind("root", ObjectId(2)).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(cluster.store.binding("root"), Some(ObjectId(2)));
    assert!(eventually(WAIT, || a.binding_state("root") == CacheState::Uncached).await);

    let mut tx = a.begin();
    tx.unbind("root").await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(cluster.store.binding("root"), None);
}

#[tokio::test]
async fn test_write_after_losing_ownership_needs_retry() {
    let cluster = TestCluster::seeded(&[(1, b"one")], 2).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let mut tx = a.begin();
    tx.write_object(ObjectId(1), bytes(b"from a")).await.unwrap();

    b.get_object(ObjectId(1), AccessLevel::Exclusive)
        .await
        .unwrap();
    assert!(eventually(WAIT, || a.object_state(ObjectId(1)) == CacheState::Uncached).await);

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(
        err,
        CoherenceError::Consistency(CacheConsistencyError::NotHeld { .. })
    ));
    assert!(needs_retry(&err));
    assert_eq!(cluster.store.object(ObjectId(1)), Some(bytes(b"one")));

    // A fresh transaction re-acquires ownership.
    let mut tx = a.begin();
    tx.write_object(ObjectId(1), bytes(b"from a")).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(cluster.store.object(ObjectId(1)), Some(bytes(b"from a")));
}

#[tokio::test]
async fn test_concurrent_requests_keep_holders_consistent() {
    let cluster = TestCluster::seeded(&[(1, b"one")], 3).await;

    let mut tasks = Vec::new();
    for (i, node) in cluster.nodes.iter().cloned().enumerate() {
        tasks.push(tokio::spawn(async move {
            for round in 0..10 {
                let level = if (round + i) % 2 == 0 {
                    AccessLevel::Exclusive
                } else {
                    AccessLevel::Shared
                };
                node.get_object(ObjectId(1), level).await?;
            }
            Ok::<_, CoherenceError>(())
        }));
    }
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("no deadlock")
            .unwrap()
            .unwrap();
    }

    let key = ResourceKey::Object(ObjectId(1));
    let holders = cluster.authority.locks().holders(&key);
    let exclusive = holders
        .iter()
        .filter(|(_, level)| *level == AccessLevel::Exclusive)
        .count();
    assert!(exclusive == 0 || holders.len() == 1);

    settle().await;
    let local_exclusive = cluster
        .nodes
        .iter()
        .filter(|n| n.object_state(ObjectId(1)).level() == Some(AccessLevel::Exclusive))
        .count();
    assert!(local_exclusive <= 1);
}

// ============================================================================
// Transactions and allocation
// ============================================================================

#[tokio::test]
async fn test_created_objects_get_fresh_ids_and_commit_atomically() {
    let cluster = TestCluster::empty(1).await;
    let node = cluster.node(0);

    let mut tx = node.begin();
    let mut oids = Vec::new();
    for i in 0..5u8 {
        oids.push(tx.create_object(bytes::Bytes::from(vec![i])).await.unwrap());
    }
    let ids: Vec<u64> = oids.iter().map(|o| o.0).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    tx.bind_new("root", oids[0]).unwrap();
    assert_eq!(tx.read_binding("root").await.unwrap(), Some(oids[0]));
    assert_eq!(tx.read_object(oids[4]).await.unwrap(), Some(bytes::Bytes::from(vec![4u8])));
    assert_eq!(tx.write_keys().len(), 6);
    tx.commit().await.unwrap();

    let stats = cluster.store.stats();
    assert_eq!(stats.objects, 5);
    assert_eq!(stats.bindings, 1);
    assert_eq!(stats.batches_applied, 1);
    assert_eq!(node.object_state(oids[0]), CacheState::Exclusive);
    assert_eq!(node.binding_state("root"), CacheState::Exclusive);

    // Owned after allocation: writable without another fetch.
    let fetches = node.stats().fetches;
    let mut tx = node.begin();
    tx.write_object(oids[0], bytes(b"updated")).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(node.stats().fetches, fetches);
    assert_eq!(cluster.store.object(oids[0]), Some(bytes(b"updated")));
}

#[tokio::test]
async fn test_bind_new_conflict_is_rejected() {
    let cluster = TestCluster::seeded(&[(1, b"one")], 2).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let mut tx = a.begin();
    tx.bind_new("dup", ObjectId(1)).unwrap();
    tx.commit().await.unwrap();

    let mut tx = b.begin();
    tx.bind_new("dup", ObjectId(1)).unwrap();
    let err = tx.commit().await.unwrap_err();
    assert!(err.is_consistency());
    assert!(needs_retry(&err));
}

#[tokio::test]
async fn test_read_only_transaction_commits_nothing() {
    let cluster = TestCluster::seeded(&[(1, b"one")], 1).await;
    let node = cluster.node(0);

    let tx = node.begin();
    assert_eq!(tx.read_object(ObjectId(1)).await.unwrap(), Some(bytes(b"one")));
    assert!(tx.is_read_only());
    tx.commit().await.unwrap();
    assert_eq!(cluster.store.stats().batches_applied, 0);
    assert_eq!(node.object_state(ObjectId(1)), CacheState::Shared);
}

#[tokio::test]
async fn test_remove_object() {
    let cluster = TestCluster::seeded(&[(1, b"one")], 1).await;
    let node = cluster.node(0);

    let mut tx = node.begin();
    tx.remove_object(ObjectId(1)).await.unwrap();
    assert_eq!(tx.read_object(ObjectId(1)).await.unwrap(), None);
    tx.commit().await.unwrap();
    assert!(!cluster.store.contains_object(ObjectId(1)));
}

// ============================================================================
// Transport failures and reconnection
// ============================================================================

async fn flaky_node(store: MemoryStore) -> (Arc<Authority>, Arc<FlakyLink>, Node) {
    let authority = Arc::new(Authority::with_config(
        Arc::new(store),
        &fast_authority_config(),
    ));
    let link = Arc::new(FlakyLink::new(authority.clone()));
    let as_link: Arc<dyn AuthorityLink> = link.clone();
    let node = Node::connect(NodeId(1), as_link, fast_node_config())
        .await
        .unwrap();
    (authority, link, node)
}

#[tokio::test]
async fn test_lost_commit_reply_is_resent_and_applied_once() {
    let store = MemoryStore::with_contents([(ObjectId(1), bytes(b"one"))], []);
    let (authority, link, node) = flaky_node(store).await;

    let mut tx = node.begin();
    tx.write_object(ObjectId(1), bytes(b"two")).await.unwrap();
    link.lose_replies(1);
    tx.commit().await.unwrap();

    assert_eq!(authority.store().object(ObjectId(1)), Some(bytes(b"two")));
    assert_eq!(authority.store().stats().batches_applied, 1);
    assert_eq!(authority.stats().commits_redelivered, 1);
    assert_eq!(node.stats().reconnects, 0);
}

#[tokio::test]
async fn test_lost_commit_request_is_resent() {
    let store = MemoryStore::with_contents([(ObjectId(1), bytes(b"one"))], []);
    let (authority, link, node) = flaky_node(store).await;

    let mut tx = node.begin();
    tx.write_object(ObjectId(1), bytes(b"two")).await.unwrap();
    link.lose_requests(2);
    tx.commit().await.unwrap();

    assert_eq!(authority.store().object(ObjectId(1)), Some(bytes(b"two")));
    assert_eq!(authority.stats().commits_redelivered, 0);
}

#[tokio::test]
async fn test_exhausted_retries_reconnect_under_new_epoch() {
    let store = MemoryStore::with_contents([(ObjectId(1), bytes(b"one"))], []);
    let (authority, link, node) = flaky_node(store).await;
    let before = node.session();

    let mut tx = node.begin();
    tx.write_object(ObjectId(1), bytes(b"two")).await.unwrap();
    link.set_down(true);
    let err = tx.commit().await.unwrap_err();
    assert!(err.is_retriable());
    assert!(needs_retry(&err));

    let after = node.session();
    assert!(after.epoch > before.epoch);
    assert_eq!(node.stats().reconnects, 1);
    assert!(node.cache().is_empty());
    assert!(authority.sessions().validate(before).is_err());
    assert!(authority.locks().held_by(NodeId(1)).is_empty());

    link.set_down(false);
    let mut tx = node.begin();
    tx.write_object(ObjectId(1), bytes(b"two")).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(authority.store().object(ObjectId(1)), Some(bytes(b"two")));
}

#[tokio::test]
async fn test_resent_eviction_ack_does_not_release_a_regrant() {
    let authority = Arc::new(Authority::with_config(
        Arc::new(MemoryStore::with_contents([(ObjectId(5), bytes(b"five"))], [])),
        &fast_authority_config(),
    ));
    let link = Arc::new(FlakyLink::new(authority.clone()));
    let flaky: Arc<dyn AuthorityLink> = link.clone();
    let slow_resend = NodeConfig {
        retry_backoff_ms: 300,
        ..fast_node_config()
    };
    let a = Node::connect(NodeId(1), flaky, slow_resend).await.unwrap();
    let direct = |id| {
        let link: Arc<dyn AuthorityLink> = authority.clone();
        Node::connect(NodeId(id), link, fast_node_config())
    };
    let (b, c) = (direct(2).await.unwrap(), direct(3).await.unwrap());
    let key = ResourceKey::Object(ObjectId(5));

    a.get_object(ObjectId(5), AccessLevel::Exclusive)
        .await
        .unwrap();

    // A's eviction ack lands but its reply is lost, so it is resent later.
    link.lose_replies(1);
    b.get_object(ObjectId(5), AccessLevel::Exclusive)
        .await
        .unwrap();

    // A wins the object back before the resend goes out.
    a.get_object(ObjectId(5), AccessLevel::Exclusive)
        .await
        .unwrap();
    a.flush().await;

    assert_eq!(
        authority.locks().holders(&key),
        vec![(NodeId(1), AccessLevel::Exclusive)]
    );
    assert_eq!(a.object_state(ObjectId(5)), CacheState::Exclusive);

    // A third node must still go through A.
    c.get_object(ObjectId(5), AccessLevel::Exclusive)
        .await
        .unwrap();
    assert!(eventually(WAIT, || a.object_state(ObjectId(5)) == CacheState::Uncached).await);
    assert_eq!(b.object_state(ObjectId(5)), CacheState::Uncached);
    assert_eq!(c.object_state(ObjectId(5)), CacheState::Exclusive);
    assert_eq!(
        authority.locks().holders(&key),
        vec![(NodeId(3), AccessLevel::Exclusive)]
    );
}

#[tokio::test]
async fn test_explicit_reconnect_drops_cache_and_holdings() {
    let cluster = TestCluster::seeded(&[(1, b"one"), (2, b"two")], 1).await;
    let node = cluster.node(0);
    node.get_object(ObjectId(1), AccessLevel::Exclusive)
        .await
        .unwrap();
    node.get_object(ObjectId(2), AccessLevel::Shared)
        .await
        .unwrap();
    assert_eq!(node.cache().len(), 2);

    let old = node.session();
    let new = node.reconnect().await.unwrap();
    assert!(new.epoch > old.epoch);
    assert_eq!(node.session(), new);
    assert!(node.cache().is_empty());
    assert!(cluster.authority.locks().held_by(node.id()).is_empty());
}

#[tokio::test]
async fn test_shutdown_flushes_and_releases() {
    let cluster = TestCluster::seeded(&[(1, b"one")], 1).await;
    let node = cluster.node(0);

    let mut tx = node.begin();
    tx.write_object(ObjectId(1), bytes(b"final")).await.unwrap();
    tx.commit().await.unwrap();
    node.shutdown().await.unwrap();

    assert_eq!(cluster.store.object(ObjectId(1)), Some(bytes(b"final")));
    assert!(cluster.authority.locks().held_by(node.id()).is_empty());
    assert!(cluster.authority.sessions().live().is_empty());
}

#[tokio::test]
async fn test_stopped_node_refuses_work() {
    let cluster = TestCluster::seeded(&[(1, b"one")], 1).await;
    let node = cluster.node(0);
    node.shutdown().await.unwrap();

    let err = node
        .get_object(ObjectId(1), AccessLevel::Shared)
        .await
        .unwrap_err();
    assert!(matches!(err, CoherenceError::Shutdown));

    let mut tx = node.begin();
    let err = tx.create_object(bytes(b"late")).await.unwrap_err();
    assert!(matches!(err, CoherenceError::Shutdown));
    assert!(matches!(node.reconnect().await, Err(CoherenceError::Shutdown)));
    assert!(cluster.authority.sessions().live().is_empty());
}

#[test]
fn test_needs_retry_classification() {
    assert!(needs_retry(&CoherenceError::transport("reset")));
    assert!(needs_retry(&CoherenceError::cancelled("session ended")));
    assert!(needs_retry(
        &CacheConsistencyError::stale_epoch(NodeId(1), Epoch(1), None).into()
    ));
    assert!(!needs_retry(&CacheConsistencyError::malformed("bad").into()));
    assert!(!needs_retry(&CoherenceError::store("disk full")));
    assert!(!needs_retry(&CoherenceError::Shutdown));
}

// ============================================================================
// Update queue ordering
// ============================================================================

/// Records the order in which updates arrive. Commits are slow.
#[derive(Default)]
struct RecordingLink {
    log: Mutex<Vec<String>>,
}

impl RecordingLink {
    fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl UpdateQueueServer for RecordingLink {
    async fn commit(&self, _session: SessionId, batch: CommitBatch) -> CoherenceResult<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.record(format!("commit:{}", batch.sequence));
        Ok(())
    }

    async fn evict_object(
        &self,
        _session: SessionId,
        oid: ObjectId,
        _grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.record(format!("evict:{}", oid.0));
        Ok(())
    }

    async fn downgrade_object(
        &self,
        _session: SessionId,
        oid: ObjectId,
        _grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.record(format!("downgrade:{}", oid.0));
        Ok(())
    }

    async fn evict_binding(
        &self,
        _session: SessionId,
        name: &str,
        _grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.record(format!("evict:{}", name));
        Ok(())
    }

    async fn downgrade_binding(
        &self,
        _session: SessionId,
        name: &str,
        _grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.record(format!("downgrade:{}", name));
        Ok(())
    }
}

#[async_trait]
impl GrantServer for RecordingLink {
    async fn register_node(
        &self,
        node_id: NodeId,
        _callbacks: CallbackSender,
    ) -> CoherenceResult<SessionId> {
        Ok(SessionId::new(node_id, Epoch(1)))
    }

    async fn disconnect(&self, _session: SessionId) -> CoherenceResult<()> {
        Ok(())
    }

    async fn get_object(
        &self,
        _session: SessionId,
        _oid: ObjectId,
        level: AccessLevel,
    ) -> CoherenceResult<Grant<ObjectValue>> {
        Ok(Grant {
            value: None,
            level,
            grant_seq: 1,
        })
    }

    async fn get_binding(
        &self,
        _session: SessionId,
        _name: &str,
        level: AccessLevel,
    ) -> CoherenceResult<Grant<BindingValue>> {
        Ok(Grant {
            value: None,
            level,
            grant_seq: 1,
        })
    }

    async fn new_object_ids(
        &self,
        _session: SessionId,
        count: u64,
    ) -> CoherenceResult<ObjectIdRange> {
        Ok(ObjectIdRange::new(1, 1 + count))
    }
}

fn submit(queue: &Arc<UpdateQueue>, ticket: QueueTicket, update: Update) -> tokio::task::JoinHandle<CoherenceResult<()>> {
    let queue = queue.clone();
    tokio::spawn(async move { queue.submit(ticket, update).await })
}

#[tokio::test]
async fn test_acknowledgement_follows_commit_on_same_resource() {
    let link = Arc::new(RecordingLink::default());
    let as_link: Arc<dyn AuthorityLink> = link.clone();
    let session = SessionId::new(NodeId(1), Epoch(1));
    let queue = Arc::new(UpdateQueue::new(session, as_link, RetryPolicy::default()));

    let one = ResourceKey::Object(ObjectId(1));
    let two = ResourceKey::Object(ObjectId(2));

    let commit_ticket = queue.register(&[one.clone()]);
    let evict_one = queue.register(&[one.clone()]);
    let evict_two = queue.register(&[two.clone()]);
    assert_eq!(queue.outstanding(), 3);

    let mut batch = CommitBatch::new(commit_ticket.sequence);
    batch.oids.push(ObjectId(1));
    batch.oid_values.push(Some(bytes(b"v")));

    // Submitted in reverse: registration order decides.
    let handles = vec![
        submit(&queue, evict_two, Update::Evict(two, 1)),
        submit(&queue, evict_one, Update::Evict(one, 1)),
        submit(&queue, commit_ticket, Update::Commit(batch)),
    ];
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    queue.flush().await;

    assert_eq!(queue.outstanding(), 0);
    assert_eq!(link.log(), vec!["evict:2", "commit:1", "evict:1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_completion_runs_before_next_update_on_resource() {
    let link = Arc::new(RecordingLink::default());
    let as_link: Arc<dyn AuthorityLink> = link.clone();
    let session = SessionId::new(NodeId(1), Epoch(1));
    let queue = Arc::new(UpdateQueue::new(session, as_link, RetryPolicy::default()));
    let key = ResourceKey::Object(ObjectId(3));

    let commit_ticket = queue.register(&[key.clone()]);
    let downgrade_ticket = queue.register(&[key.clone()]);
    let batch = CommitBatch::new(commit_ticket.sequence);

    // Stands in for the node's cache: dirty until the commit completes.
    let settled = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let seen_by_downgrade = Arc::new(Mutex::new(None));

    let commit = {
        let (queue, settled) = (queue.clone(), settled.clone());
        tokio::spawn(async move {
            queue
                .submit_with(commit_ticket, Update::Commit(batch), move |result| {
                    assert!(result.is_ok());
                    // Leave a window other workers could slip into.
                    std::thread::sleep(Duration::from_millis(50));
                    settled.store(true, std::sync::atomic::Ordering::SeqCst);
                })
                .await
        })
    };
    let downgrade = {
        let (queue, settled, seen) = (queue.clone(), settled.clone(), seen_by_downgrade.clone());
        tokio::spawn(async move {
            queue
                .submit_with(downgrade_ticket, Update::Downgrade(key, 1), move |_| {
                    *seen.lock() = Some(settled.load(std::sync::atomic::Ordering::SeqCst));
                })
                .await
        })
    };

    commit.await.unwrap().unwrap();
    downgrade.await.unwrap().unwrap();
    assert_eq!(*seen_by_downgrade.lock(), Some(true));
    assert_eq!(link.log(), vec!["commit:1", "downgrade:3"]);
}

#[tokio::test]
async fn test_disjoint_commits_are_in_flight_together() {
    let link = Arc::new(RecordingLink::default());
    let as_link: Arc<dyn AuthorityLink> = link.clone();
    let session = SessionId::new(NodeId(1), Epoch(1));
    let queue = Arc::new(UpdateQueue::new(session, as_link, RetryPolicy::default()));

    let started = tokio::time::Instant::now();
    let mut handles = Vec::new();
    for oid in 1..=4 {
        let ticket = queue.register(&[ResourceKey::Object(ObjectId(oid))]);
        let batch = CommitBatch::new(ticket.sequence);
        handles.push(submit(&queue, ticket, Update::Commit(batch)));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Four 50 ms commits run side by side, not back to back.
    assert!(started.elapsed() < Duration::from_millis(180));
    assert_eq!(link.log().len(), 4);
}

#[tokio::test]
async fn test_node_over_memory_store_reads_missing_object_as_none() {
    let cluster = TestCluster::start(Arc::new(MemoryStore::new()), 1).await;
    assert_eq!(
        cluster
            .node(0)
            .get_object(ObjectId(99), AccessLevel::Shared)
            .await
            .unwrap(),
        None
    );
}
