//! Coherence - cache coherence and update queue for a distributed object store.
//!
//! A cluster of nodes caches objects and name bindings from a shared
//! durable store. A central authority hands out access levels, collects
//! each node's committed changes and, when a node needs a conflicting
//! grant, calls back the current holders to evict or downgrade their
//! copies. At any moment a resource has either one exclusive holder or any
//! number of shared holders.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────────┐
//! │ Node                         │      │ Node                         │
//! │  Transaction → NodeCache     │      │  Transaction → NodeCache     │
//! │  UpdateQueue (per-resource)  │      │  UpdateQueue (per-resource)  │
//! └──────────────────────────────┘      └──────────────────────────────┘
//!        │ commit / evict / downgrade / get    ▲ callbacks
//!        ▼                                     │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ Authority                                                       │
//! │  LockTable │ SessionRegistry │ CallbackDispatcher │ CommitLedger │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ apply_batch
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ DurableStore                                                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Protocol
//! - [`protocol::types`] - Identifiers, access levels, grants
//! - [`protocol::server`] - `UpdateQueueServer` and `GrantServer` contracts
//! - [`protocol::callback`] - Authority-to-node callback messages
//! - [`protocol::traced`] - Tracing decorator for the contracts
//!
//! ## Authority
//! - [`authority::lock_table`] - Holders, grant gates, FIFO waiters
//! - [`authority::session`] - Sessions and epochs
//! - [`authority::callbacks`] - Outstanding callbacks
//! - [`authority::ledger`] - Commit deduplication
//! - [`authority::server`] - The authority
//!
//! ## Node
//! - [`cache::entry`] - Cache line state machine
//! - [`cache::node_cache`] - A node's cache lines
//! - [`cache::update_queue`] - Ordered delivery to the authority
//! - [`cache::node`] - Node facade and transactions
//!
//! ## Storage
//! - [`storage::memory`] - In-memory durable store
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - In-process cluster runtime
//! - [`core::error`] - Error types
//!
//! # Key Invariants
//!
//! - Holders of a resource are none, one exclusive, or any number shared.
//! - A commit may only write resources its node holds exclusively under its
//!   current epoch; a batch is applied entirely or not at all.
//! - An eviction or downgrade acknowledgement is delivered after every
//!   commit that flushes the same resource.
//! - Requests carrying a stale epoch are rejected without effect.

// Core infrastructure
pub mod core;

// Node/authority contracts
pub mod protocol;

// Authority
pub mod authority;

// Node cache
pub mod cache;

// Storage layer
pub mod storage;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime};
pub use authority::Authority;
pub use cache::{Node, Transaction};
pub use storage::{DurableStore, MemoryStore};
