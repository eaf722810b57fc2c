//! Fleet Orchestrator Library
//!
//! The orchestrator runs on each host and keeps a fleet of long-running
//! agent processes alive. It resolves the agents' dependency graph into
//! launch waves, starts each wave once the previous one reports healthy,
//! watches every agent through an application-level health protocol, and
//! recovers failures without operator intervention.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator
//! ├── Supervisor       (process lifecycle, wave launch, restarts)
//! ├── HealthMonitor    (per-agent probe tasks)
//! │   └── RecoveryEngine   (failure counting, backoff, escalation tiers)
//! ├── ErrorBus         (in-process event fan-out)
//! └── EdgeHub          (record buffer, forwarding and failover to Central)
//! ```
//!
//! ## Modules
//!
//! - `config`: environment configuration
//! - `fleet`: fleet file loading
//! - `state`: in-memory agent runtime state and history
//! - `runtime`: process launcher interface (OS processes, mock)
//! - `health`: health check client
//! - `supervisor`: process supervisor
//! - `recovery`: recovery engine
//! - `bus`: error bus
//! - `edge`, `client`: edge hub and its Central Hub transport
//! - `monitor`: steady-state monitoring loop
//! - `report`: operator report

pub mod bus;
pub mod client;
pub mod config;
pub mod edge;
pub mod fleet;
pub mod health;
pub mod monitor;
pub mod orchestrator;
pub mod recovery;
pub mod report;
pub mod runtime;
pub mod state;
pub mod supervisor;

// Re-export commonly used types
pub use bus::{ErrorBus, EventFilter, Subscription};
pub use edge::{EdgeHub, HubError, HubTransport};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use report::{AgentOutcome, LaunchReport};
pub use runtime::MockLauncher;
pub use supervisor::{Supervisor, SupervisorError};
