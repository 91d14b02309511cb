//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - In-process cluster orchestration
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod runtime;
