//! Node-to-authority contracts.
//!
//! [`UpdateQueueServer`] is the five-operation surface a node's update queue
//! talks to. [`GrantServer`] covers sessions and fetch-and-grant. Both are
//! implemented directly by the authority and by the [`Traced`] decorator.
//!
//! [`Traced`]: crate::protocol::traced::Traced

use crate::core::error::{CacheConsistencyError, CoherenceResult};
use crate::protocol::callback::CallbackSender;
use crate::protocol::types::{
    AccessLevel, BindingValue, Grant, NodeId, ObjectId, ObjectIdRange, ObjectValue, ResourceKey,
    SessionId,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// A batch of writes committed atomically.
///
/// `oids`/`oid_values` and `names`/`name_values` each hold a fixed prefix of
/// resources the node already owns, followed by `new_oids`/`new_names`
/// trailing entries that are allocated by this commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitBatch {
    /// Per-session sequence number; with the session it forms the
    /// idempotence key of the commit.
    pub sequence: u64,
    pub oids: Vec<ObjectId>,
    pub oid_values: Vec<ObjectValue>,
    pub new_oids: usize,
    pub names: Vec<String>,
    pub name_values: Vec<BindingValue>,
    pub new_names: usize,
}

impl CommitBatch {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            ..Default::default()
        }
    }

    /// Check lengths, trailing counts and duplicate keys.
    pub fn validate_shape(&self) -> Result<(), CacheConsistencyError> {
        if self.oids.len() != self.oid_values.len() {
            return Err(CacheConsistencyError::malformed(format!(
                "{} oids but {} values",
                self.oids.len(),
                self.oid_values.len()
            )));
        }
        if self.names.len() != self.name_values.len() {
            return Err(CacheConsistencyError::malformed(format!(
                "{} names but {} values",
                self.names.len(),
                self.name_values.len()
            )));
        }
        if self.new_oids > self.oids.len() {
            return Err(CacheConsistencyError::malformed(format!(
                "new_oids {} exceeds {} oids",
                self.new_oids,
                self.oids.len()
            )));
        }
        if self.new_names > self.names.len() {
            return Err(CacheConsistencyError::malformed(format!(
                "new_names {} exceeds {} names",
                self.new_names,
                self.names.len()
            )));
        }
        let mut seen = HashSet::new();
        for oid in &self.oids {
            if !seen.insert(ResourceKey::Object(*oid)) {
                return Err(CacheConsistencyError::malformed(format!(
                    "{} appears twice",
                    oid
                )));
            }
        }
        for name in &self.names {
            if !seen.insert(ResourceKey::Binding(name.clone())) {
                return Err(CacheConsistencyError::malformed(format!(
                    "binding {:?} appears twice",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Already-owned objects.
    pub fn fixed_oids(&self) -> &[ObjectId] {
        &self.oids[..self.oids.len() - self.new_oids]
    }

    /// Objects allocated by this commit.
    pub fn allocated_oids(&self) -> &[ObjectId] {
        &self.oids[self.oids.len() - self.new_oids..]
    }

    /// Already-owned bindings.
    pub fn fixed_names(&self) -> &[String] {
        &self.names[..self.names.len() - self.new_names]
    }

    /// Bindings allocated by this commit.
    pub fn allocated_names(&self) -> &[String] {
        &self.names[self.names.len() - self.new_names..]
    }

    /// Every resource the batch touches, in batch order.
    pub fn resources(&self) -> Vec<ResourceKey> {
        self.oids
            .iter()
            .map(|oid| ResourceKey::Object(*oid))
            .chain(self.names.iter().map(|n| ResourceKey::Binding(n.clone())))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.oids.is_empty() && self.names.is_empty()
    }
}

/// Commit and acknowledgement surface of the authority.
#[async_trait]
pub trait UpdateQueueServer: Send + Sync {
    /// Atomically apply a batch of writes and allocations.
    async fn commit(&self, session: SessionId, batch: CommitBatch) -> CoherenceResult<()>;

    /// Acknowledge that the node no longer caches an object.
    ///
    /// `grant_seq` is the grant named by the callback being answered. An
    /// acknowledgement for a grant older than the node's current holding is
    /// a late redelivery and changes nothing.
    async fn evict_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        grant_seq: u64,
    ) -> CoherenceResult<()>;

    /// Acknowledge that the node now caches an object for read only.
    async fn downgrade_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        grant_seq: u64,
    ) -> CoherenceResult<()>;

    /// Acknowledge that the node no longer caches a binding.
    async fn evict_binding(
        &self,
        session: SessionId,
        name: &str,
        grant_seq: u64,
    ) -> CoherenceResult<()>;

    /// Acknowledge that the node now caches a binding for read only.
    async fn downgrade_binding(
        &self,
        session: SessionId,
        name: &str,
        grant_seq: u64,
    ) -> CoherenceResult<()>;
}

/// Session and fetch-and-grant surface of the authority.
#[async_trait]
pub trait GrantServer: Send + Sync {
    /// Open a new session for `node_id` with a fresh epoch. Any previous
    /// session of the node is invalidated and its holdings reclaimed.
    async fn register_node(
        &self,
        node_id: NodeId,
        callbacks: CallbackSender,
    ) -> CoherenceResult<SessionId>;

    /// End a session cleanly, releasing everything it holds.
    async fn disconnect(&self, session: SessionId) -> CoherenceResult<()>;

    /// Fetch an object and obtain access at `level`.
    async fn get_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        level: AccessLevel,
    ) -> CoherenceResult<Grant<ObjectValue>>;

    /// Fetch a binding and obtain access at `level`.
    async fn get_binding(
        &self,
        session: SessionId,
        name: &str,
        level: AccessLevel,
    ) -> CoherenceResult<Grant<BindingValue>>;

    /// Reserve `count` fresh object ids for the node.
    async fn new_object_ids(&self, session: SessionId, count: u64)
        -> CoherenceResult<ObjectIdRange>;
}

/// Everything a node needs from the authority.
pub trait AuthorityLink: UpdateQueueServer + GrantServer {}

impl<T: UpdateQueueServer + GrantServer + ?Sized> AuthorityLink for T {}

#[async_trait]
impl<S: UpdateQueueServer + ?Sized> UpdateQueueServer for Arc<S> {
    async fn commit(&self, session: SessionId, batch: CommitBatch) -> CoherenceResult<()> {
        (**self).commit(session, batch).await
    }

    async fn evict_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        (**self).evict_object(session, oid, grant_seq).await
    }

    async fn downgrade_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        (**self).downgrade_object(session, oid, grant_seq).await
    }

    async fn evict_binding(
        &self,
        session: SessionId,
        name: &str,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        (**self).evict_binding(session, name, grant_seq).await
    }

    async fn downgrade_binding(
        &self,
        session: SessionId,
        name: &str,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        (**self).downgrade_binding(session, name, grant_seq).await
    }
}

#[async_trait]
impl<S: GrantServer + ?Sized> GrantServer for Arc<S> {
    async fn register_node(
        &self,
        node_id: NodeId,
        callbacks: CallbackSender,
    ) -> CoherenceResult<SessionId> {
        (**self).register_node(node_id, callbacks).await
    }

    async fn disconnect(&self, session: SessionId) -> CoherenceResult<()> {
        (**self).disconnect(session).await
    }

    async fn get_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        level: AccessLevel,
    ) -> CoherenceResult<Grant<ObjectValue>> {
        (**self).get_object(session, oid, level).await
    }

    async fn get_binding(
        &self,
        session: SessionId,
        name: &str,
        level: AccessLevel,
    ) -> CoherenceResult<Grant<BindingValue>> {
        (**self).get_binding(session, name, level).await
    }

    async fn new_object_ids(
        &self,
        session: SessionId,
        count: u64,
    ) -> CoherenceResult<ObjectIdRange> {
        (**self).new_object_ids(session, count).await
    }
}
