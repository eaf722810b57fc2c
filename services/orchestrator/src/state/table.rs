use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use fleet_events::AgentStatus;
use tokio::sync::{Mutex, RwLock};

use super::agent::AgentRuntimeState;

/// Default number of retired entries kept.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

/// Live runtime state, one lock per agent.
///
/// The outer lock only guards membership and is never held across an
/// entry lock acquisition.
pub struct StateTable {
    entries: RwLock<BTreeMap<String, Arc<Mutex<AgentRuntimeState>>>>,
    history: Mutex<VecDeque<AgentRuntimeState>>,
    history_limit: usize,
}

impl StateTable {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
        }
    }

    /// Entry for `name`, created in `PENDING` if absent.
    pub async fn register(&self, name: &str) -> Arc<Mutex<AgentRuntimeState>> {
        if let Some(entry) = self.entry(name).await {
            return entry;
        }
        let mut entries = self.entries.write().await;
        Arc::clone(
            entries
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(AgentRuntimeState::new(name)))),
        )
    }

    /// Entry for `name`, if live.
    pub async fn entry(&self, name: &str) -> Option<Arc<Mutex<AgentRuntimeState>>> {
        self.entries.read().await.get(name).cloned()
    }

    /// Cloned state of a live agent.
    pub async fn snapshot(&self, name: &str) -> Option<AgentRuntimeState> {
        let entry = self.entry(name).await?;
        let state = entry.lock().await;
        Some(state.clone())
    }

    /// Current status of a live agent.
    pub async fn status(&self, name: &str) -> Option<AgentStatus> {
        let entry = self.entry(name).await?;
        let status = entry.lock().await.status;
        Some(status)
    }

    /// Cloned state of every live agent, ordered by name.
    pub async fn snapshot_all(&self) -> Vec<AgentRuntimeState> {
        let entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.lock().await.clone());
        }
        out
    }

    /// Remove `name` from the live table and append its final state to history.
    pub async fn retire(&self, name: &str) -> Option<AgentRuntimeState> {
        let entry = self.entries.write().await.remove(name)?;
        let state = entry.lock().await.clone();

        let mut history = self.history.lock().await;
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(state.clone());
        Some(state)
    }

    /// Retired entries, oldest first.
    pub async fn history(&self) -> Vec<AgentRuntimeState> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Live state of `name`, or its most recent retired state.
    pub async fn last_known(&self, name: &str) -> Option<AgentRuntimeState> {
        if let Some(state) = self.snapshot(name).await {
            return Some(state);
        }
        self.history
            .lock()
            .await
            .iter()
            .rev()
            .find(|s| s.name == name)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for StateTable {
    fn default() -> Self {
        Self::new()
    }
}
