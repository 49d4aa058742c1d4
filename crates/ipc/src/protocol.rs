// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent IPC message types.

use meow_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Messages an agent process sends to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    StepDone {
        workflow: String,
        agent: String,
        step: String,
        #[serde(default)]
        outputs: HashMap<String, Value>,
    },
    GetPrompt {
        agent: String,
    },
    Event {
        event_type: String,
        #[serde(default)]
        data: serde_json::Value,
        agent: String,
        workflow: String,
    },
}

/// Orchestrator replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorMessage {
    Ok,
    Error { message: String },
    Prompt { content: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_done_round_trips_through_json() {
        let mut outputs = HashMap::new();
        outputs.insert("r".to_string(), Value::Int(1));
        let msg = AgentMessage::StepDone {
            workflow: "w".into(),
            agent: "a".into(),
            step: "s".into(),
            outputs,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn tag_discriminates_variant() {
        let json = r#"{"type":"get_prompt","agent":"a"}"#;
        let msg: AgentMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, AgentMessage::GetPrompt { .. }));
    }
}
