// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory agent adapter for tests.

use crate::agent::{AgentAdapter, AgentError, AgentHandle, AgentSpawnConfig};
use async_trait::async_trait;
use meow_core::id::AgentId;
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Default)]
pub struct FakeAgentAdapter {
    spawned: Mutex<HashSet<String>>,
}

#[async_trait]
impl AgentAdapter for FakeAgentAdapter {
    async fn spawn(&self, config: AgentSpawnConfig) -> Result<AgentHandle, AgentError> {
        self.spawned.lock().insert(config.agent_id.to_string());
        Ok(AgentHandle::new(config.agent_id))
    }

    async fn kill(&self, agent_id: &AgentId, _graceful: bool) -> Result<(), AgentError> {
        self.spawned.lock().remove(agent_id.as_str());
        Ok(())
    }
}

impl FakeAgentAdapter {
    pub fn is_spawned(&self, agent_id: &AgentId) -> bool {
        self.spawned.lock().contains(agent_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_spawned_agents() {
        let adapter = FakeAgentAdapter::default();
        let id = AgentId::new("a1");
        adapter
            .spawn(AgentSpawnConfig {
                agent_id: id.clone(),
                agent_name: "t".into(),
                command: "true".into(),
                env: vec![],
                cwd: None,
            })
            .await
            .unwrap();
        assert!(adapter.is_spawned(&id));
        adapter.kill(&id, true).await.unwrap();
        assert!(!adapter.is_spawned(&id));
    }
}
