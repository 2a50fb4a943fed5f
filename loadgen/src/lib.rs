//! Towerload load generator library
//!
//! This module exports the simulation engine for the `towerload` binary and
//! for integration tests.

mod actions;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod metrics;
pub mod runner;
pub mod screen;
pub mod vu;

// Re-export commonly used types
pub use client::{CognitoIdentity, ReqwestTransport};
pub use config::Config;
pub use metrics::Metrics;
pub use runner::{RunError, RunSummary, Runner};
pub use vu::{SimContext, SimError, VirtualUser};
