// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Run state: the per-run record of step and agent status, and the
//! read-only summary derived from it.

use crate::id::{AgentId, RunId, StepId};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Overall run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Done,
    Failed,
    Stopped,
    CleaningUp,
}

/// Per-step status. `Completing` covers steps that have signalled
/// completion but are still running cleanup (e.g. an `expand` step
/// whose last child just finished).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completing,
    Done,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// Per-step execution record tracked inside a [`Run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    pub executor: String,
    #[serde(skip, default = "Instant::now")]
    pub started_at: Instant,
    pub attempt: u32,
    pub outputs: HashMap<String, Value>,
    pub error: Option<String>,
    pub agent_id: Option<AgentId>,
}

impl StepState {
    pub fn pending(executor: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Pending,
            executor: executor.into(),
            started_at: Instant::now(),
            attempt: 0,
            outputs: HashMap::new(),
            error: None,
            agent_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Exited,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub status: AgentStatus,
    pub session_id: Option<String>,
    pub current_step: Option<StepId>,
}

/// The full state of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub template_ref: String,
    pub status: RunStatus,
    #[serde(skip, default = "Instant::now")]
    pub started_at: Instant,
    pub done_at: Option<Instant>,
    pub variables: HashMap<String, Value>,
    pub steps: HashMap<StepId, StepState>,
    pub agents: HashMap<AgentId, AgentState>,
}

impl Run {
    pub fn new(id: RunId, template_ref: impl Into<String>, variables: HashMap<String, Value>) -> Self {
        Self {
            id,
            template_ref: template_ref.into(),
            status: RunStatus::Pending,
            started_at: Instant::now(),
            done_at: None,
            variables,
            steps: HashMap::new(),
            agents: HashMap::new(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            run_id: self.id.clone(),
            status: self.status,
            total: self.steps.len(),
            done: 0,
            running: 0,
            pending: 0,
            failed: 0,
            skipped: 0,
            completing: 0,
            errors: Vec::new(),
        };
        for state in self.steps.values() {
            match state.status {
                StepStatus::Pending => summary.pending += 1,
                StepStatus::Running => summary.running += 1,
                StepStatus::Completing => summary.completing += 1,
                StepStatus::Done => summary.done += 1,
                StepStatus::Failed => {
                    summary.failed += 1;
                    if let Some(err) = &state.error {
                        summary.errors.push(err.clone());
                    }
                }
                StepStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

/// Read-only derivation of a [`Run`] for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub total: usize,
    pub done: usize,
    pub running: usize,
    pub pending: usize,
    pub failed: usize,
    pub skipped: usize,
    pub completing: usize,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_tallies_step_statuses() {
        let mut run = Run::new(RunId::new("run-ab-12345678"), "main", HashMap::new());
        run.steps.insert(StepId::new("a"), StepState {
            status: StepStatus::Done,
            ..StepState::pending("shell")
        });
        run.steps.insert(StepId::new("b"), StepState {
            status: StepStatus::Failed,
            error: Some("boom".into()),
            ..StepState::pending("shell")
        });
        let summary = run.summary();
        assert_eq!(summary.done, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors, vec!["boom".to_string()]);
    }
}
