//! Identifiers and value types shared by nodes and the authority.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier of a persistent object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "oid:{}", self.0)
    }
}

/// Identifier of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Session epoch. Allocated by the authority, strictly increasing across
/// every session it has ever opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "epoch:{}", self.0)
    }
}

/// A node session identity. Every cross-node message carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub node_id: NodeId,
    pub epoch: Epoch,
}

impl SessionId {
    pub fn new(node_id: NodeId, epoch: Epoch) -> Self {
        Self { node_id, epoch }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.node_id, self.epoch.0)
    }
}

/// A cacheable resource: either an object or a name binding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKey {
    Object(ObjectId),
    Binding(String),
}

impl ResourceKey {
    pub fn object(oid: ObjectId) -> Self {
        Self::Object(oid)
    }

    pub fn binding(name: impl Into<String>) -> Self {
        Self::Binding(name.into())
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Object(oid) => write!(f, "{}", oid),
            Self::Binding(name) => write!(f, "name:{:?}", name),
        }
    }
}

/// Access level granted by the authority.
///
/// Ordered so that `Exclusive > Shared`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    Shared,
    Exclusive,
}

impl AccessLevel {
    /// Whether a holder at `self` must be revoked or weakened before
    /// `requested` can be granted to another node.
    pub fn conflicts_with(self, requested: AccessLevel) -> bool {
        self == AccessLevel::Exclusive || requested == AccessLevel::Exclusive
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared => write!(f, "SHARED"),
            Self::Exclusive => write!(f, "EXCLUSIVE"),
        }
    }
}

/// Object contents. `None` marks a removed object.
pub type ObjectValue = Option<Bytes>;

/// Binding target. `None` marks an unbound name.
pub type BindingValue = Option<ObjectId>;

/// A granted resource together with its value at grant time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant<T> {
    pub value: T,
    pub level: AccessLevel,
    /// Per-resource grant sequence. Callbacks name the grant they revoke.
    pub grant_seq: u64,
}

/// A contiguous block of fresh object ids reserved for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIdRange {
    pub start: u64,
    pub end: u64,
}

impl ObjectIdRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn empty() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Take the next id from the front of the block.
    pub fn take(&mut self) -> Option<ObjectId> {
        if self.is_empty() {
            return None;
        }
        let oid = ObjectId(self.start);
        self.start += 1;
        Some(oid)
    }
}
