//! Cache lines and their access-level state machine.

use crate::protocol::callback::CallbackAction;
use crate::protocol::types::{AccessLevel, BindingValue, ObjectValue, ResourceKey};
use thiserror::Error;

/// Local access state of a cached resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CacheState {
    #[default]
    Uncached,
    Shared,
    Exclusive,
    /// Exclusive with local changes not yet acknowledged by the authority.
    ExclusiveDirty,
}

/// Illegal cache state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot write in state {from}")]
    NotWritable { from: CacheState },

    #[error("cannot {action} in state {from}: unflushed changes")]
    Dirty {
        from: CacheState,
        action: CallbackAction,
    },
}

impl CacheState {
    /// Access level this state grants locally.
    pub fn level(self) -> Option<AccessLevel> {
        match self {
            Self::Uncached => None,
            Self::Shared => Some(AccessLevel::Shared),
            Self::Exclusive | Self::ExclusiveDirty => Some(AccessLevel::Exclusive),
        }
    }

    pub fn satisfies(self, level: AccessLevel) -> bool {
        self.level().is_some_and(|held| held >= level)
    }

    pub fn is_dirty(self) -> bool {
        self == Self::ExclusiveDirty
    }

    /// Apply a grant from the authority. Never lowers the level.
    pub fn granted(self, level: AccessLevel) -> Self {
        match (self, level) {
            (Self::ExclusiveDirty, _) => Self::ExclusiveDirty,
            (Self::Exclusive, _) | (_, AccessLevel::Exclusive) => Self::Exclusive,
            (Self::Shared, AccessLevel::Shared) | (Self::Uncached, AccessLevel::Shared) => {
                Self::Shared
            }
        }
    }

    /// Record a local write.
    pub fn written(self) -> Result<Self, TransitionError> {
        match self {
            Self::Exclusive | Self::ExclusiveDirty => Ok(Self::ExclusiveDirty),
            from => Err(TransitionError::NotWritable { from }),
        }
    }

    /// Every commit carrying this entry's changes was acknowledged.
    pub fn flushed(self) -> Self {
        match self {
            Self::ExclusiveDirty => Self::Exclusive,
            other => other,
        }
    }

    /// Drop the resource.
    pub fn evicted(self) -> Result<Self, TransitionError> {
        match self {
            Self::ExclusiveDirty => Err(TransitionError::Dirty {
                from: self,
                action: CallbackAction::Evict,
            }),
            _ => Ok(Self::Uncached),
        }
    }

    /// Weaken to read-only.
    pub fn downgraded(self) -> Result<Self, TransitionError> {
        match self {
            Self::Exclusive => Ok(Self::Shared),
            Self::ExclusiveDirty => Err(TransitionError::Dirty {
                from: self,
                action: CallbackAction::Downgrade,
            }),
            other => Ok(other),
        }
    }

    /// Apply a callback action.
    pub fn revoked(self, action: CallbackAction) -> Result<Self, TransitionError> {
        match action {
            CallbackAction::Evict => self.evicted(),
            CallbackAction::Downgrade => self.downgraded(),
        }
    }
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uncached => write!(f, "UNCACHED"),
            Self::Shared => write!(f, "SHARED"),
            Self::Exclusive => write!(f, "EXCLUSIVE"),
            Self::ExclusiveDirty => write!(f, "EXCLUSIVE_DIRTY"),
        }
    }
}

/// Cached contents of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    Object(ObjectValue),
    Binding(BindingValue),
}

impl CachedValue {
    pub fn into_object(self) -> Option<ObjectValue> {
        match self {
            Self::Object(v) => Some(v),
            Self::Binding(_) => None,
        }
    }

    pub fn into_binding(self) -> Option<BindingValue> {
        match self {
            Self::Binding(v) => Some(v),
            Self::Object(_) => None,
        }
    }
}

/// A node's local copy of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: ResourceKey,
    pub state: CacheState,
    pub value: CachedValue,
    /// Grant this entry was installed under. Zero for resources the node
    /// allocated itself.
    pub grant_seq: u64,
    /// Commits carrying this entry's changes that are not yet acknowledged.
    pub pending_commits: u32,
    /// Callback being served, if any. A revoking entry accepts no new writes.
    pub revoking: Option<CallbackAction>,
}

impl CacheEntry {
    pub fn new(key: ResourceKey, state: CacheState, value: CachedValue, grant_seq: u64) -> Self {
        Self {
            key,
            state,
            value,
            grant_seq,
            pending_commits: 0,
            revoking: None,
        }
    }

    /// Whether the entry can be read at `level` right now.
    pub fn readable_at(&self, level: AccessLevel) -> bool {
        self.revoking.is_none() && self.state.satisfies(level)
    }

    /// Whether the entry can take part in a commit.
    pub fn writable(&self) -> bool {
        self.revoking.is_none() && self.state.satisfies(AccessLevel::Exclusive)
    }
}
