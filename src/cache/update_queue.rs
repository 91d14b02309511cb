//! Ordered delivery of a node's updates to the authority.
//!
//! Every update (a commit, or an eviction or downgrade acknowledgement) is
//! registered with the resources it touches and receives a sequence
//! number. It is sent only once every earlier update touching one of the
//! same resources has finished, so an acknowledgement always follows the
//! commits that flush the resource. Updates on disjoint resources are in
//! flight concurrently.
//!
//! Registration is synchronous and decides the order; sending is async.

use crate::core::config::NodeConfig;
use crate::core::error::CoherenceResult;
use crate::protocol::server::{AuthorityLink, CommitBatch};
use crate::protocol::types::{ResourceKey, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One unit of work for the authority.
///
/// Acknowledgements carry the grant sequence named by the callback they
/// answer, so a late resend cannot touch a later grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Commit(CommitBatch),
    Evict(ResourceKey, u64),
    Downgrade(ResourceKey, u64),
}

impl Update {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Commit(_) => "commit",
            Self::Evict(..) => "evict",
            Self::Downgrade(..) => "downgrade",
        }
    }
}

/// Transport retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            max_retries: config.max_transport_retries,
            backoff: config.retry_backoff(),
        }
    }

    /// Delay before resend number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

/// A registered update's place in the queue.
#[derive(Debug)]
pub struct QueueTicket {
    pub sequence: u64,
    keys: Vec<ResourceKey>,
    after: Vec<watch::Receiver<bool>>,
    done: watch::Sender<bool>,
}

impl QueueTicket {
    pub fn keys(&self) -> &[ResourceKey] {
        &self.keys
    }
}

#[derive(Debug)]
struct QueueState {
    next_sequence: u64,
    last: HashMap<ResourceKey, (u64, watch::Receiver<bool>)>,
}

/// Per-session update queue.
pub struct UpdateQueue {
    session: SessionId,
    link: Arc<dyn AuthorityLink>,
    retry: RetryPolicy,
    state: Mutex<QueueState>,
    outstanding: watch::Sender<usize>,
}

impl UpdateQueue {
    pub fn new(session: SessionId, link: Arc<dyn AuthorityLink>, retry: RetryPolicy) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            session,
            link,
            retry,
            state: Mutex::new(QueueState {
                next_sequence: 0,
                last: HashMap::new(),
            }),
            outstanding,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Take the next place in line for `keys`.
    pub fn register(&self, keys: &[ResourceKey]) -> QueueTicket {
        let (done, rx) = watch::channel(false);
        let mut state = self.state.lock();
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        let mut after = Vec::new();
        for key in keys {
            if let Some((_, prev)) = state.last.insert(key.clone(), (sequence, rx.clone())) {
                after.push(prev);
            }
        }
        drop(state);
        self.outstanding.send_modify(|n| *n += 1);
        QueueTicket {
            sequence,
            keys: keys.to_vec(),
            after,
            done,
        }
    }

    /// Wait for the ticket's turn, then deliver `update`.
    ///
    /// Transport failures are resent with the same content up to the retry
    /// limit. Any other failure is returned at once.
    pub async fn submit(&self, ticket: QueueTicket, update: Update) -> CoherenceResult<()> {
        self.submit_with(ticket, update, |_| ()).await
    }

    /// Like [`UpdateQueue::submit`], running `finish` on the outcome before
    /// later updates on the same resources are released.
    pub async fn submit_with<F>(
        &self,
        ticket: QueueTicket,
        update: Update,
        finish: F,
    ) -> CoherenceResult<()>
    where
        F: FnOnce(&CoherenceResult<()>) + Send,
    {
        let QueueTicket {
            sequence,
            keys,
            after,
            done,
        } = ticket;

        for mut prev in after {
            // A dropped sender means the earlier update was abandoned.
            let _ = prev.wait_for(|finished| *finished).await;
        }

        let result = self.deliver(sequence, &update).await;
        finish(&result);

        done.send_replace(true);
        {
            let mut state = self.state.lock();
            for key in &keys {
                if state.last.get(key).is_some_and(|(seq, _)| *seq == sequence) {
                    state.last.remove(key);
                }
            }
        }
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        result
    }

    async fn deliver(&self, sequence: u64, update: &Update) -> CoherenceResult<()> {
        let mut attempt = 0;
        loop {
            let result = self.send_once(update).await;
            match result {
                Err(e) if e.is_retriable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        session = %self.session,
                        sequence,
                        update = update.kind(),
                        attempt,
                        error = %e,
                        "resending update"
                    );
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn send_once(&self, update: &Update) -> CoherenceResult<()> {
        let session = self.session;
        match update {
            Update::Commit(batch) => self.link.commit(session, batch.clone()).await,
            Update::Evict(ResourceKey::Object(oid), seq) => {
                self.link.evict_object(session, *oid, *seq).await
            }
            Update::Evict(ResourceKey::Binding(name), seq) => {
                self.link.evict_binding(session, name, *seq).await
            }
            Update::Downgrade(ResourceKey::Object(oid), seq) => {
                self.link.downgrade_object(session, *oid, *seq).await
            }
            Update::Downgrade(ResourceKey::Binding(name), seq) => {
                self.link.downgrade_binding(session, name, *seq).await
            }
        }
    }

    /// Number of registered updates that have not finished.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Wait until every registered update has finished.
    pub async fn flush(&self) {
        let mut rx = self.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl std::fmt::Debug for UpdateQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateQueue")
            .field("session", &self.session)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
