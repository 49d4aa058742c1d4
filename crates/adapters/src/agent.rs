// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Generic agent process adapter. Any long-lived external process
//! that speaks the IPC protocol over `MEOW_ORCH_SOCK` can implement
//! this trait; the dispatcher only knows it as `spawn` / `send` /
//! `kill` / `get_state`.

use async_trait::async_trait;
use meow_core::id::AgentId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent '{0}' not found")]
    NotFound(String),
    #[error("failed to spawn agent '{agent_id}': {source}")]
    SpawnFailed {
        agent_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send to agent '{0}'")]
    SendFailed(String),
    #[error("failed to kill agent '{0}': {1}")]
    KillFailed(String, String),
}

/// Configuration to launch an agent process.
#[derive(Debug, Clone)]
pub struct AgentSpawnConfig {
    pub agent_id: AgentId,
    pub agent_name: String,
    /// Fully substituted command line (already shell-escaped).
    pub command: String,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub agent_id: AgentId,
}

impl AgentHandle {
    pub fn new(agent_id: AgentId) -> Self {
        Self { agent_id }
    }
}

#[async_trait]
pub trait AgentAdapter: Send + Sync + 'static {
    async fn spawn(&self, config: AgentSpawnConfig) -> Result<AgentHandle, AgentError>;
    async fn kill(&self, agent_id: &AgentId, graceful: bool) -> Result<(), AgentError>;
}

/// Spawns agents as plain child processes. The environment carries
/// the IPC socket path and identifying env vars; the dispatcher owns
/// the socket endpoint, this adapter only owns process lifetime.
pub struct ProcessAgentAdapter {
    children: parking_lot::Mutex<HashMap<String, Child>>,
}

impl Default for ProcessAgentAdapter {
    fn default() -> Self {
        Self {
            children: parking_lot::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AgentAdapter for ProcessAgentAdapter {
    async fn spawn(&self, config: AgentSpawnConfig) -> Result<AgentHandle, AgentError> {
        let span = info_span!("agent_spawn", agent_id = %config.agent_id, agent_name = %config.agent_name);
        async move {
            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(&config.command)
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            for (k, v) in &config.env {
                command.env(k, v);
            }
            if let Some(cwd) = &config.cwd {
                command.current_dir(cwd);
            }

            let child = command.spawn().map_err(|source| AgentError::SpawnFailed {
                agent_id: config.agent_id.to_string(),
                source,
            })?;

            info!("agent process spawned");
            self.children
                .lock()
                .insert(config.agent_id.to_string(), child);
            Ok(AgentHandle::new(config.agent_id))
        }
        .instrument(span)
        .await
    }

    async fn kill(&self, agent_id: &AgentId, graceful: bool) -> Result<(), AgentError> {
        let mut children = self.children.lock();
        let Some(child) = children.get_mut(agent_id.as_str()) else {
            // Killing an already-gone agent is not an error.
            return Ok(());
        };
        if graceful {
            if let Some(pid) = child.id() {
                // SIGTERM equivalent: best-effort, nonfatal if unsupported.
                let _ = std::process::Command::new("kill")
                    .arg(pid.to_string())
                    .status();
            }
        } else {
            if let Err(err) = child.start_kill() {
                warn!(agent_id = %agent_id, error = %err, "kill failed");
                return Err(AgentError::KillFailed(agent_id.to_string(), err.to_string()));
            }
        }
        children.remove(agent_id.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_runs_the_given_command() {
        let adapter = ProcessAgentAdapter::default();
        let handle = adapter
            .spawn(AgentSpawnConfig {
                agent_id: AgentId::new("a1"),
                agent_name: "test".into(),
                command: "true".into(),
                env: vec![],
                cwd: None,
            })
            .await
            .unwrap();
        assert_eq!(handle.agent_id.as_str(), "a1");
    }

    #[tokio::test]
    async fn kill_of_unknown_agent_is_not_an_error() {
        let adapter = ProcessAgentAdapter::default();
        assert!(adapter.kill(&AgentId::new("ghost"), true).await.is_ok());
    }
}
