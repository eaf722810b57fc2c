//! Runtime state of supervised agents.
//!
//! Every agent has one [`AgentRuntimeState`] behind its own lock inside a
//! [`StateTable`]. Only the supervisor and the recovery engine write state;
//! everything else reads cloned snapshots.
//!
//! Entries are created when an agent is first launched and leave the live
//! table on explicit shutdown or once recovery is exhausted. Retired entries
//! are kept in a bounded history log.

mod agent;
mod table;

pub use agent::{
    AgentRuntimeState, InvalidTransition, ProbeSummary, StatusChange, PROBE_HISTORY_LEN,
};
pub use table::{StateTable, DEFAULT_HISTORY_LIMIT};
