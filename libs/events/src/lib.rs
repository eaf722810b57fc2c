//! # fleet-events
//!
//! Data model shared by the fleet orchestrator and the Central Hub.
//!
//! ## Design Principles
//!
//! - Agent specs are loaded once and never mutated afterwards
//! - Probe results, error events and hub records are immutable once created
//! - Everything that crosses a process or host boundary is `serde`-friendly
//!
//! ## Modules
//!
//! - `spec`: declared fleet topology (`AgentSpec`) and recovery policy
//! - `status`: agent lifecycle status
//! - `probe`: health protocol messages and probe results
//! - `error_event`: structured events carried by the error bus
//! - `hub`: hub records, batches and the aggregate health view

mod error;
mod error_event;
mod hub;
mod probe;
mod spec;
mod status;

pub use error::EventError;
pub use error_event::*;
pub use hub::*;
pub use probe::*;
pub use spec::*;
pub use status::*;
