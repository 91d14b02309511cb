//! Node-side cache.
//!
//! A node caches objects and bindings under access levels granted by the
//! authority, changes them through transactions and sends its changes
//! and callback acknowledgements through a per-session update queue.
//!
//! # Modules
//!
//! - [`entry`] - Cache lines and the access-level state machine
//! - [`node_cache`] - Concurrency-safe collection of cache lines
//! - [`update_queue`] - Per-resource ordered delivery to the authority
//! - [`node`] - Node facade and transactions

pub mod entry;
pub mod node;
pub mod node_cache;
pub mod update_queue;

pub use entry::{CacheEntry, CacheState, CachedValue, TransitionError};
pub use node::{needs_retry, Node, NodeStats, Transaction};
pub use node_cache::{NodeCache, WriteSet};
pub use update_queue::{RetryPolicy, Update, UpdateQueue};
