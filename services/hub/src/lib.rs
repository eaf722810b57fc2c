//! Fleet Central Hub.
//!
//! This crate primarily ships a `hub` binary, but exposes a small library
//! surface so the orchestrator's integration tests can run a Central Hub
//! in-process.

pub mod alerts;
pub mod api;
pub mod central;
pub mod config;
pub mod state;

pub use central::{CentralConfig, CentralHub, IngestError};
