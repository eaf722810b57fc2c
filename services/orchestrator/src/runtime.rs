//! Process launcher interface and implementations.
//!
//! The launcher abstracts process lifecycle operations:
//! - Spawning an agent's entry point
//! - Terminating it
//! - Observing its exit
//!
//! [`CommandLauncher`] runs real OS processes. [`MockLauncher`] is provided
//! for testing and development.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_events::AgentSpec;
use fleet_id::BootId;
use tracing::{debug, info, warn};

/// Handle to a spawned agent process.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Boot ID (unique per launch).
    pub boot_id: BootId,

    /// Agent name.
    pub agent: String,

    /// OS process ID, when known.
    pub pid: Option<u32>,

    child: Option<tokio::process::Child>,
}

impl ProcessHandle {
    /// A handle with no OS process behind it.
    pub fn detached(agent: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            boot_id: BootId::new(),
            agent: agent.into(),
            pid,
            child: None,
        }
    }
}

/// Process launcher interface.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn the agent's entry point.
    async fn spawn(&self, spec: &AgentSpec) -> Result<ProcessHandle>;

    /// Stop a running process, waiting up to `grace` before killing it.
    ///
    /// Returns the exit code, if one was observed.
    async fn terminate(&self, handle: &mut ProcessHandle, grace: Duration) -> Result<Option<i32>>;

    /// Exit code of the process if it has exited, without blocking.
    fn exit_code(&self, handle: &mut ProcessHandle) -> Option<i32>;
}

/// Launches agents as child processes of the orchestrator.
///
/// Children are not killed when their handle is dropped: aborting a launch
/// leaves already-started agents running.
#[derive(Debug, Default)]
pub struct CommandLauncher;

impl CommandLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn spawn(&self, spec: &AgentSpec) -> Result<ProcessHandle> {
        let (program, args) = spec
            .command
            .split_first()
            .with_context(|| format!("agent {} has no command", spec.name))?;

        let child = tokio::process::Command::new(program)
            .args(args)
            .envs(&spec.env)
            .env("FLEET_AGENT_NAME", &spec.name)
            .env("FLEET_AGENT_PORT", spec.port.to_string())
            .env("FLEET_HEALTH_PORT", spec.health_port.to_string())
            .kill_on_drop(false)
            .spawn()
            .with_context(|| format!("failed to spawn {} for agent {}", program, spec.name))?;

        let pid = child.id();
        let handle = ProcessHandle {
            boot_id: BootId::new(),
            agent: spec.name.clone(),
            pid,
            child: Some(child),
        };

        info!(
            agent = %spec.name,
            boot_id = %handle.boot_id,
            pid = ?pid,
            "Spawned agent process"
        );
        Ok(handle)
    }

    async fn terminate(&self, handle: &mut ProcessHandle, grace: Duration) -> Result<Option<i32>> {
        let Some(child) = handle.child.as_mut() else {
            return Ok(None);
        };

        if let Some(status) = child.try_wait()? {
            return Ok(status.code());
        }

        #[cfg(unix)]
        {
            if let Some(pid) = handle.pid {
                // SAFETY: `pid` belongs to a child we spawned and have not reaped.
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if rc != 0 {
                    debug!(agent = %handle.agent, pid, "SIGTERM failed");
                }
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => Ok(status?.code()),
            Err(_) => {
                warn!(
                    agent = %handle.agent,
                    grace_ms = grace.as_millis() as u64,
                    "Agent ignored SIGTERM, killing"
                );
                child.kill().await?;
                Ok(child.wait().await?.code())
            }
        }
    }

    fn exit_code(&self, handle: &mut ProcessHandle) -> Option<i32> {
        let child = handle.child.as_mut()?;
        match child.try_wait() {
            // Killed by a signal: report it the way shells do.
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(e) => {
                warn!(agent = %handle.agent, error = %e, "Failed to poll agent process");
                None
            }
        }
    }
}

/// Mock launcher for testing and development.
#[derive(Debug, Default)]
pub struct MockLauncher {
    inner: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    next_pid: u32,
    spawns: HashMap<String, u32>,
    terminations: HashMap<String, u32>,
    fail_spawn: HashMap<String, String>,
    exited: HashMap<BootId, i32>,
    live: HashMap<String, BootId>,
}

impl MockLauncher {
    /// Create a new mock launcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every spawn of `agent` fail with `reason`.
    pub fn fail_spawn(&self, agent: &str, reason: &str) {
        self.with_state(|s| {
            s.fail_spawn.insert(agent.to_string(), reason.to_string());
        });
    }

    /// Simulate the current process of `agent` exiting with `code`.
    pub fn exit(&self, agent: &str, code: i32) {
        self.with_state(|s| {
            if let Some(boot) = s.live.get(agent).copied() {
                s.exited.insert(boot, code);
            }
        });
    }

    /// Number of times `agent` was spawned.
    pub fn spawn_count(&self, agent: &str) -> u32 {
        self.with_state(|s| s.spawns.get(agent).copied().unwrap_or(0))
    }

    /// Number of times `agent` was terminated.
    pub fn terminate_count(&self, agent: &str) -> u32 {
        self.with_state(|s| s.terminations.get(agent).copied().unwrap_or(0))
    }

    /// Boot ID of the most recent spawn of `agent`.
    pub fn current_boot(&self, agent: &str) -> Option<BootId> {
        self.with_state(|s| s.live.get(agent).copied())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl ProcessLauncher for MockLauncher {
    async fn spawn(&self, spec: &AgentSpec) -> Result<ProcessHandle> {
        if let Some(reason) = self.with_state(|s| s.fail_spawn.get(&spec.name).cloned()) {
            anyhow::bail!("[MOCK] {}", reason);
        }

        let handle = self.with_state(|s| {
            s.next_pid += 1;
            *s.spawns.entry(spec.name.clone()).or_default() += 1;
            let handle = ProcessHandle::detached(&spec.name, Some(1000 + s.next_pid));
            s.live.insert(spec.name.clone(), handle.boot_id);
            handle
        });

        debug!(
            agent = %spec.name,
            boot_id = %handle.boot_id,
            "[MOCK] Spawned agent"
        );
        Ok(handle)
    }

    async fn terminate(&self, handle: &mut ProcessHandle, _grace: Duration) -> Result<Option<i32>> {
        debug!(agent = %handle.agent, boot_id = %handle.boot_id, "[MOCK] Terminating agent");
        Ok(self.with_state(|s| {
            *s.terminations.entry(handle.agent.clone()).or_default() += 1;
            if s.live.get(&handle.agent) == Some(&handle.boot_id) {
                s.live.remove(&handle.agent);
            }
            Some(s.exited.remove(&handle.boot_id).unwrap_or(0))
        }))
    }

    fn exit_code(&self, handle: &mut ProcessHandle) -> Option<i32> {
        self.with_state(|s| s.exited.get(&handle.boot_id).copied())
    }
}
