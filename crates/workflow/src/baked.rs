// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Executable-form step graph: the baker's output, consumed by the
//! dispatcher.

use crate::model::{AgentOutputDecl, OutputDecl};
use meow_core::Value;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BakedStep {
    pub id: String,
    pub needs: Vec<String>,
    pub timeout: Option<Duration>,
    pub executor: BakedExecutor,
}

#[derive(Debug, Clone)]
pub enum BakedExecutor {
    Shell {
        command: String,
        workdir: Option<String>,
        env: HashMap<String, String>,
        on_error: OnError,
        outputs: HashMap<String, OutputDecl>,
    },
    Spawn {
        agent: String,
        adapter: Option<String>,
        workdir: Option<String>,
        env: HashMap<String, String>,
        resume_session: Option<String>,
        spawn_args: Vec<String>,
    },
    Kill {
        agent: String,
        graceful: bool,
        timeout: Option<Duration>,
    },
    Expand {
        template: String,
        variables: HashMap<String, Value>,
    },
    Branch {
        condition: String,
        on_true: Option<BakedTarget>,
        on_false: Option<BakedTarget>,
        on_timeout: Option<BakedTarget>,
        workdir: Option<String>,
        env: HashMap<String, String>,
        outputs: HashMap<String, OutputDecl>,
        on_error: OnError,
    },
    Foreach {
        items: Vec<Value>,
        item_var: String,
        index_var: Option<String>,
        template: String,
        variables: HashMap<String, Value>,
        parallel: bool,
        max_concurrent: Option<usize>,
        join: bool,
    },
    Agent {
        agent: String,
        prompt: String,
        interactive: bool,
        outputs: HashMap<String, AgentOutputDecl>,
    },
}

#[derive(Debug, Clone)]
pub enum BakedTarget {
    Template {
        template: String,
        variables: HashMap<String, Value>,
    },
    Inline {
        steps: Vec<BakedStep>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    Fail,
    Continue,
    Retry(u32),
}

impl Default for OnError {
    fn default() -> Self {
        OnError::Fail
    }
}

impl OnError {
    pub fn parse(s: Option<&str>) -> Result<OnError, String> {
        match s {
            None => Ok(OnError::Fail),
            Some("fail") => Ok(OnError::Fail),
            Some("continue") => Ok(OnError::Continue),
            Some(other) => {
                if let Some(n) = other.strip_prefix("retry:") {
                    n.parse::<u32>()
                        .map(OnError::Retry)
                        .map_err(|_| format!("invalid retry count in on_error: '{other}'"))
                } else {
                    Err(format!("unknown on_error value: '{other}'"))
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BakeResult {
    pub workflow_id: String,
    pub steps: Vec<BakedStep>,
    pub cleanup_on_success: Option<String>,
    pub cleanup_on_failure: Option<String>,
    pub cleanup_on_stop: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_error_parses_retry_count() {
        assert_eq!(OnError::parse(Some("retry:3")).unwrap(), OnError::Retry(3));
    }

    #[test]
    fn on_error_rejects_garbage() {
        assert!(OnError::parse(Some("retry:abc")).is_err());
    }

    #[test]
    fn on_error_defaults_to_fail() {
        assert_eq!(OnError::parse(None).unwrap(), OnError::Fail);
    }
}
