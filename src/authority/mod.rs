//! Central authority.
//!
//! The authority arbitrates which node may read or write each resource,
//! applies commits to the durable store and revokes ownership through
//! callbacks when another node needs a conflicting grant.
//!
//! # Modules
//!
//! - [`lock_table`] - Per-resource holders, grant gates, FIFO waiters
//! - [`session`] - Node sessions and epochs
//! - [`callbacks`] - Outstanding eviction/downgrade requests
//! - [`ledger`] - Commit outcome deduplication
//! - [`server`] - The [`Authority`] itself

pub mod callbacks;
pub mod ledger;
pub mod lock_table;
pub mod server;
pub mod session;

pub use callbacks::{CallbackDispatcher, CallbackResolution, CallbackTicket};
pub use ledger::{CommitKey, CommitLedger, CommitOutcome};
pub use lock_table::{Holders, Holding, LockTable};
pub use server::{Authority, AuthorityStats};
pub use session::{Liveness, SessionRegistry};
