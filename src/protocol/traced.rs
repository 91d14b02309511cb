//! Transparent tracing decorator.
//!
//! [`Traced`] wraps any implementation of the protocol contracts and records
//! each call's parameters before delegating, then the result or error after.
//! Events are emitted at `TRACE` under the `coherence::rpc` target. The
//! wrapped operation's contract and return value are untouched.

use crate::core::error::CoherenceResult;
use crate::protocol::callback::CallbackSender;
use crate::protocol::server::{CommitBatch, GrantServer, UpdateQueueServer};
use crate::protocol::types::{
    AccessLevel, BindingValue, Grant, NodeId, ObjectId, ObjectIdRange, ObjectValue, SessionId,
};
use async_trait::async_trait;
use std::future::Future;

/// A contract implementation that logs every call.
#[derive(Debug, Clone)]
pub struct Traced<S> {
    inner: S,
    component: &'static str,
}

impl<S> Traced<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            component: "authority",
        }
    }

    /// Label events with a component name (for example the peer being called).
    pub fn with_component(inner: S, component: &'static str) -> Self {
        Self { inner, component }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    async fn call<T, F>(
        &self,
        op: &'static str,
        describe: impl FnOnce() -> String,
        fut: F,
    ) -> CoherenceResult<T>
    where
        F: Future<Output = CoherenceResult<T>>,
    {
        let params = if tracing::enabled!(target: "coherence::rpc", tracing::Level::TRACE) {
            Some(describe())
        } else {
            None
        };
        if let Some(ref params) = params {
            tracing::trace!(target: "coherence::rpc", component = self.component, op, "{} {}", op, params);
        }
        let result = fut.await;
        if let Some(ref params) = params {
            match &result {
                Ok(_) => {
                    tracing::trace!(target: "coherence::rpc", component = self.component, op, "{} {} returns", op, params)
                }
                Err(e) => {
                    tracing::trace!(target: "coherence::rpc", component = self.component, op, error = %e, "{} {} throws", op, params)
                }
            }
        }
        result
    }
}

#[async_trait]
impl<S: UpdateQueueServer> UpdateQueueServer for Traced<S> {
    async fn commit(&self, session: SessionId, batch: CommitBatch) -> CoherenceResult<()> {
        // The batch moves into the inner call, so render it up front.
        let params = tracing::enabled!(target: "coherence::rpc", tracing::Level::TRACE).then(|| {
            format!(
                "session:{}, seq:{}, oids:{:?}, newOids:{}, names:{:?}, newNames:{}",
                session,
                batch.sequence,
                batch.oids.iter().map(|o| o.0).collect::<Vec<_>>(),
                batch.new_oids,
                batch.names,
                batch.new_names
            )
        });
        self.call(
            "commit",
            move || params.unwrap_or_default(),
            self.inner.commit(session, batch),
        )
        .await
    }

    async fn evict_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.call(
            "evictObject",
            || format!("session:{}, oid:{}, grantSeq:{}", session, oid.0, grant_seq),
            self.inner.evict_object(session, oid, grant_seq),
        )
        .await
    }

    async fn downgrade_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.call(
            "downgradeObject",
            || format!("session:{}, oid:{}, grantSeq:{}", session, oid.0, grant_seq),
            self.inner.downgrade_object(session, oid, grant_seq),
        )
        .await
    }

    async fn evict_binding(
        &self,
        session: SessionId,
        name: &str,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.call(
            "evictBinding",
            || format!("session:{}, name:{}, grantSeq:{}", session, name, grant_seq),
            self.inner.evict_binding(session, name, grant_seq),
        )
        .await
    }

    async fn downgrade_binding(
        &self,
        session: SessionId,
        name: &str,
        grant_seq: u64,
    ) -> CoherenceResult<()> {
        self.call(
            "downgradeBinding",
            || format!("session:{}, name:{}, grantSeq:{}", session, name, grant_seq),
            self.inner.downgrade_binding(session, name, grant_seq),
        )
        .await
    }
}

#[async_trait]
impl<S: GrantServer> GrantServer for Traced<S> {
    async fn register_node(
        &self,
        node_id: NodeId,
        callbacks: CallbackSender,
    ) -> CoherenceResult<SessionId> {
        self.call(
            "registerNode",
            || format!("nodeId:{}", node_id.0),
            self.inner.register_node(node_id, callbacks),
        )
        .await
    }

    async fn disconnect(&self, session: SessionId) -> CoherenceResult<()> {
        self.call(
            "disconnect",
            || format!("session:{}", session),
            self.inner.disconnect(session),
        )
        .await
    }

    async fn get_object(
        &self,
        session: SessionId,
        oid: ObjectId,
        level: AccessLevel,
    ) -> CoherenceResult<Grant<ObjectValue>> {
        self.call(
            "getObject",
            || format!("session:{}, oid:{}, level:{}", session, oid.0, level),
            self.inner.get_object(session, oid, level),
        )
        .await
    }

    async fn get_binding(
        &self,
        session: SessionId,
        name: &str,
        level: AccessLevel,
    ) -> CoherenceResult<Grant<BindingValue>> {
        self.call(
            "getBinding",
            || format!("session:{}, name:{}, level:{}", session, name, level),
            self.inner.get_binding(session, name, level),
        )
        .await
    }

    async fn new_object_ids(
        &self,
        session: SessionId,
        count: u64,
    ) -> CoherenceResult<ObjectIdRange> {
        self.call(
            "newObjectIds",
            || format!("session:{}, count:{}", session, count),
            self.inner.new_object_ids(session, count),
        )
        .await
    }
}
