// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TOML module parsing.
//!
//! A module document is a map of top-level tables, each one a
//! workflow. We deserialize into an order-preserving map of raw TOML
//! values first, then decode each workflow individually so that parse
//! errors can be attributed to a specific workflow/step/field.

use crate::model::{Module, Workflow};
use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{path}: invalid TOML: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("{path}: workflow \"{workflow}\": {message}")]
    Workflow {
        path: String,
        workflow: String,
        message: String,
    },
    #[error("{path}: expected a workflow document with at least one workflow")]
    Empty { path: String },
}

pub fn parse_module(path: &str, source: &str) -> Result<Module, ParseError> {
    let raw: IndexMap<String, toml::Value> =
        toml::from_str(source).map_err(|e| ParseError::Toml {
            path: path.to_string(),
            source: e,
        })?;

    if raw.is_empty() {
        return Err(ParseError::Empty {
            path: path.to_string(),
        });
    }

    let mut workflows = IndexMap::with_capacity(raw.len());
    for (raw_name, value) in raw {
        let name = raw_name.strip_prefix('.').unwrap_or(&raw_name).to_string();
        let mut workflow: Workflow = value.try_into().map_err(|e: toml::de::Error| ParseError::Workflow {
            path: path.to_string(),
            workflow: name.clone(),
            message: e.to_string(),
        })?;
        if workflow.name.is_empty() {
            workflow.name = name.clone();
        }
        if workflow.steps.is_empty() {
            return Err(ParseError::Workflow {
                path: path.to_string(),
                workflow: name,
                message: "workflow has no steps".to_string(),
            });
        }
        workflows.insert(name, workflow);
    }

    Ok(Module {
        path: Some(path.to_string()),
        workflows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_shell_workflow() {
        let src = r#"
[main]
description = "build"

[[main.steps]]
id = "build"
executor = "shell"
command = "cargo build"
"#;
        let module = parse_module("m.meow.toml", src).unwrap();
        let main = module.main().unwrap();
        assert_eq!(main.description, "build");
        assert_eq!(main.steps.len(), 1);
        assert_eq!(main.steps[0].id, "build");
    }

    #[test]
    fn strips_leading_dot_from_local_workflow_names() {
        let src = r#"
[".helper"]
[[".helper".steps]]
id = "s"
executor = "shell"
command = "true"
"#;
        let module = parse_module("m.meow.toml", src).unwrap();
        assert!(module.workflows.contains_key("helper"));
    }

    #[test]
    fn rejects_workflow_with_no_steps() {
        let src = "[main]\ndescription = \"empty\"\n";
        let err = parse_module("m.meow.toml", src).unwrap_err();
        assert!(matches!(err, ParseError::Workflow { .. }));
    }

    #[test]
    fn typed_variable_values_preserved() {
        let src = r#"
[main]
[[main.steps]]
id = "s"
executor = "expand"
template = "other"
[main.steps.variables]
count = 3
flag = true
"#;
        let module = parse_module("m.meow.toml", src).unwrap();
        let step = &module.main().unwrap().steps[0];
        if let crate::model::ExecutorDef::Expand { variables, .. } = &step.executor {
            assert_eq!(variables.get("count"), Some(&meow_core::Value::Int(3)));
            assert_eq!(variables.get("flag"), Some(&meow_core::Value::Bool(true)));
        } else {
            panic!("expected expand executor");
        }
    }
}
