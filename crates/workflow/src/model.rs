// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Template-form types: what a parsed workflow document looks like
//! before baking.

use indexmap::IndexMap;
use meow_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A parsed document: one or more named workflows.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub path: Option<String>,
    pub workflows: IndexMap<String, Workflow>,
}

impl Module {
    /// Default entrypoint workflow, `main`.
    pub fn main(&self) -> Option<&Workflow> {
        self.workflows.get("main")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub variables: HashMap<String, VariableDecl>,
    #[serde(default)]
    pub steps: Vec<StepDef>,
    #[serde(default)]
    pub cleanup_on_success: Option<String>,
    #[serde(default)]
    pub cleanup_on_failure: Option<String>,
    #[serde(default)]
    pub cleanup_on_stop: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    String,
    Int,
    Bool,
    Object,
    Json,
    File,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableDecl {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(rename = "type", default)]
    pub var_type: Option<VarType>,
    #[serde(default)]
    pub description: String,
}

/// Output declaration: where to read a value from and how to decode it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDecl {
    pub source: String,
    #[serde(rename = "type", default)]
    pub var_type: Option<VarType>,
}

/// An agent `outputs` declaration, which additionally may be required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutputDecl {
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "type", default)]
    pub var_type: Option<VarType>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(flatten)]
    pub executor: ExecutorDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "lowercase")]
pub enum ExecutorDef {
    Shell {
        command: String,
        #[serde(default)]
        workdir: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        on_error: Option<String>,
        #[serde(default, alias = "outputs")]
        shell_outputs: HashMap<String, OutputDecl>,
    },
    Spawn {
        agent: String,
        #[serde(default)]
        adapter: Option<String>,
        #[serde(default)]
        workdir: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        resume_session: Option<String>,
        #[serde(default)]
        spawn_args: Vec<String>,
    },
    Kill {
        agent: String,
        #[serde(default = "default_true")]
        graceful: bool,
        #[serde(default)]
        timeout: Option<u64>,
    },
    Expand {
        template: String,
        #[serde(default)]
        variables: HashMap<String, Value>,
    },
    Branch {
        condition: String,
        #[serde(default)]
        on_true: Option<ExpansionTarget>,
        #[serde(default)]
        on_false: Option<ExpansionTarget>,
        #[serde(default)]
        on_timeout: Option<ExpansionTarget>,
        #[serde(default)]
        workdir: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, alias = "outputs")]
        shell_outputs: HashMap<String, OutputDecl>,
        #[serde(default)]
        on_error: Option<String>,
    },
    Foreach {
        #[serde(default)]
        items: Option<String>,
        #[serde(default)]
        items_file: Option<String>,
        item_var: String,
        #[serde(default)]
        index_var: Option<String>,
        template: String,
        #[serde(default)]
        variables: HashMap<String, Value>,
        #[serde(default)]
        parallel: ParallelSpec,
        #[serde(default)]
        max_concurrent: Option<String>,
        #[serde(default = "default_true")]
        join: bool,
    },
    Agent {
        agent: String,
        prompt: String,
        #[serde(default = "default_mode")]
        mode: String,
        #[serde(default)]
        outputs: HashMap<String, AgentOutputDecl>,
    },
}

fn default_true() -> bool {
    true
}

fn default_mode() -> String {
    "autonomous".to_string()
}

/// `parallel` accepts a bare bool or a string template to be resolved
/// at bake time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParallelSpec {
    Bool(bool),
    Template(String),
}

impl Default for ParallelSpec {
    fn default() -> Self {
        ParallelSpec::Bool(false)
    }
}

/// A branch/foreach child: either a template expansion or an inline
/// step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpansionTarget {
    Template {
        template: String,
        #[serde(default)]
        variables: HashMap<String, Value>,
    },
    Inline {
        steps: Vec<StepDef>,
    },
}
