// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The baker: turns a parsed [`Workflow`] plus caller variables into
//! an executable [`BakeResult`].

use crate::baked::{BakeResult, BakedExecutor, BakedStep, BakedTarget, OnError};
use crate::context::{Context, DeferOptions, SubstituteError};
use crate::model::{ExecutorDef, ExpansionTarget, ParallelSpec, StepDef, VarType, Workflow};
use meow_core::Value;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BakeError {
    #[error("unknown variable '{name}'{}", suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    UnknownVariable {
        name: String,
        suggestion: Option<String>,
    },
    #[error("missing required variable '{0}'")]
    MissingRequired(String),
    #[error("failed to read file variable '{name}' from '{path}': {source}")]
    FileRead {
        name: String,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("variable '{name}' coercion failed: {source}")]
    Coerce {
        name: String,
        #[source]
        source: meow_core::value::CoerceError,
    },
    #[error("substitute {field}: {source}")]
    Substitute {
        field: String,
        #[source]
        source: SubstituteError,
    },
    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

pub struct Baker {
    pub defer: DeferOptions,
}

impl Default for Baker {
    fn default() -> Self {
        Self {
            defer: DeferOptions {
                defer_undefined_variables: false,
                defer_step_outputs: true,
            },
        }
    }
}

impl Baker {
    pub fn bake(
        &self,
        workflow_id: &str,
        workflow: &Workflow,
        caller_vars: HashMap<String, Value>,
    ) -> Result<BakeResult, BakeError> {
        let resolved_vars = self.resolve_variables(workflow, caller_vars)?;

        let mut ctx = Context::new(resolved_vars);
        ctx.defer = self.defer;
        ctx.set_builtin("workflow_id", Value::String(workflow_id.to_string()));

        let mut steps = Vec::with_capacity(workflow.steps.len());
        for step in &workflow.steps {
            steps.push(self.bake_step(&mut ctx, step)?);
        }

        Ok(BakeResult {
            workflow_id: workflow_id.to_string(),
            steps,
            cleanup_on_success: workflow.cleanup_on_success.clone(),
            cleanup_on_failure: workflow.cleanup_on_failure.clone(),
            cleanup_on_stop: workflow.cleanup_on_stop.clone(),
        })
    }

    fn resolve_variables(
        &self,
        workflow: &Workflow,
        mut caller_vars: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, BakeError> {
        let declared: Vec<&str> = workflow.variables.keys().map(String::as_str).collect();
        for name in caller_vars.keys() {
            if !workflow.variables.contains_key(name) {
                let suggestion = closest(name, &declared);
                return Err(BakeError::UnknownVariable {
                    name: name.clone(),
                    suggestion,
                });
            }
        }

        let mut resolved = HashMap::new();
        for (name, decl) in &workflow.variables {
            let provided = caller_vars.remove(name);
            let mut value = match provided {
                Some(v) => v,
                None => match &decl.default {
                    Some(d) => d.clone(),
                    None => {
                        if decl.required && !self.defer.defer_undefined_variables {
                            return Err(BakeError::MissingRequired(name.clone()));
                        }
                        continue;
                    }
                },
            };

            if let Some(var_type) = decl.var_type {
                if var_type == VarType::File {
                    let path = value.to_plain_string();
                    let contents = fs::read_to_string(&path).map_err(|source| BakeError::FileRead {
                        name: name.clone(),
                        path: path.clone(),
                        source,
                    })?;
                    value = Value::String(contents.trim().to_string());
                } else {
                    value = value
                        .coerce(to_core_type(var_type))
                        .map_err(|source| BakeError::Coerce {
                            name: name.clone(),
                            source,
                        })?;
                }
            }

            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    fn bake_step(&self, ctx: &mut Context, step: &StepDef) -> Result<BakedStep, BakeError> {
        ctx.set_builtin("step_id", Value::String(step.id.clone()));
        let timeout = step
            .timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
            .map_err(|message| BakeError::InvalidValue {
                field: format!("{}.timeout", step.id),
                message,
            })?;

        let executor = self.bake_executor(ctx, &step.id, &step.executor)?;

        Ok(BakedStep {
            id: step.id.clone(),
            needs: step.needs.clone(),
            timeout,
            executor,
        })
    }

    fn bake_executor(
        &self,
        ctx: &mut Context,
        step_id: &str,
        executor: &ExecutorDef,
    ) -> Result<BakedExecutor, BakeError> {
        let field = |f: &str| -> String { format!("{step_id}.{f}") };
        let sub = |ctx: &mut Context, f: &str, s: &str| -> Result<String, BakeError> {
            ctx.render(s).map_err(|source| BakeError::Substitute {
                field: field(f),
                source,
            })
        };
        let sub_env =
            |ctx: &mut Context, env: &HashMap<String, String>| -> Result<HashMap<String, String>, BakeError> {
                let mut out = HashMap::with_capacity(env.len());
                for (k, v) in env {
                    out.insert(
                        k.clone(),
                        ctx.render(v).map_err(|source| BakeError::Substitute {
                            field: field(&format!("env.{k}")),
                            source,
                        })?,
                    );
                }
                Ok(out)
            };

        Ok(match executor {
            ExecutorDef::Shell {
                command,
                workdir,
                env,
                on_error,
                shell_outputs,
            } => BakedExecutor::Shell {
                command: ctx
                    .substitute_for_shell(command)
                    .map_err(|source| BakeError::Substitute {
                        field: field("command"),
                        source,
                    })?,
                workdir: workdir
                    .as_deref()
                    .map(|w| sub(ctx, "workdir", w))
                    .transpose()?,
                env: sub_env(ctx, env)?,
                on_error: OnError::parse(on_error.as_deref()).map_err(|message| {
                    BakeError::InvalidValue {
                        field: field("on_error"),
                        message,
                    }
                })?,
                outputs: shell_outputs.clone(),
            },
            ExecutorDef::Spawn {
                agent,
                adapter,
                workdir,
                env,
                resume_session,
                spawn_args,
            } => BakedExecutor::Spawn {
                agent: sub(ctx, "agent", agent)?,
                adapter: adapter.clone(),
                workdir: workdir
                    .as_deref()
                    .map(|w| sub(ctx, "workdir", w))
                    .transpose()?,
                env: sub_env(ctx, env)?,
                resume_session: resume_session.clone(),
                spawn_args: spawn_args
                    .iter()
                    .map(|a| sub(ctx, "spawn_args", a))
                    .collect::<Result<_, _>>()?,
            },
            ExecutorDef::Kill {
                agent,
                graceful,
                timeout,
            } => BakedExecutor::Kill {
                agent: sub(ctx, "agent", agent)?,
                graceful: *graceful,
                timeout: timeout.map(Duration::from_secs),
            },
            ExecutorDef::Expand { template, variables } => BakedExecutor::Expand {
                template: sub(ctx, "template", template)?,
                variables: ctx
                    .eval_map(variables)
                    .map_err(|source| BakeError::Substitute {
                        field: field("variables"),
                        source,
                    })?,
            },
            ExecutorDef::Branch {
                condition,
                on_true,
                on_false,
                on_timeout,
                workdir,
                env,
                shell_outputs,
                on_error,
            } => BakedExecutor::Branch {
                condition: ctx
                    .substitute_for_shell(condition)
                    .map_err(|source| BakeError::Substitute {
                        field: field("condition"),
                        source,
                    })?,
                on_true: on_true
                    .as_ref()
                    .map(|t| self.bake_target(ctx, step_id, t))
                    .transpose()?,
                on_false: on_false
                    .as_ref()
                    .map(|t| self.bake_target(ctx, step_id, t))
                    .transpose()?,
                on_timeout: on_timeout
                    .as_ref()
                    .map(|t| self.bake_target(ctx, step_id, t))
                    .transpose()?,
                workdir: workdir
                    .as_deref()
                    .map(|w| sub(ctx, "workdir", w))
                    .transpose()?,
                env: sub_env(ctx, env)?,
                outputs: shell_outputs.clone(),
                on_error: OnError::parse(on_error.as_deref()).map_err(|message| {
                    BakeError::InvalidValue {
                        field: field("on_error"),
                        message,
                    }
                })?,
            },
            ExecutorDef::Foreach {
                items,
                items_file,
                item_var,
                index_var,
                template,
                variables,
                parallel,
                max_concurrent,
                join,
            } => {
                let items_value = match (items, items_file) {
                    (Some(expr), _) => {
                        let rendered = ctx.eval(expr).map_err(|source| BakeError::Substitute {
                            field: field("items"),
                            source,
                        })?;
                        value_to_list(rendered, step_id)?
                    }
                    (None, Some(path_expr)) => {
                        let path = sub(ctx, "items_file", path_expr)?;
                        let contents = fs::read_to_string(&path).map_err(|source| BakeError::FileRead {
                            name: field("items_file"),
                            path,
                            source,
                        })?;
                        let json: serde_json::Value =
                            serde_json::from_str(&contents).map_err(|e| BakeError::InvalidValue {
                                field: field("items_file"),
                                message: e.to_string(),
                            })?;
                        match json {
                            serde_json::Value::Array(a) => a.into_iter().map(Value::from_json).collect(),
                            other => vec![Value::from_json(other)],
                        }
                    }
                    (None, None) => {
                        return Err(BakeError::InvalidValue {
                            field: field("items"),
                            message: "foreach step requires 'items' or 'items_file'".to_string(),
                        })
                    }
                };

                let parallel_resolved = match parallel {
                    ParallelSpec::Bool(b) => *b,
                    ParallelSpec::Template(s) => {
                        let rendered = sub(ctx, "parallel", s)?;
                        parse_bool(&rendered).map_err(|message| BakeError::InvalidValue {
                            field: field("parallel"),
                            message,
                        })?
                    }
                };

                let max_concurrent_resolved = max_concurrent
                    .as_deref()
                    .map(|m| sub(ctx, "max_concurrent", m))
                    .transpose()?
                    .map(|s| s.parse::<usize>())
                    .transpose()
                    .map_err(|e| BakeError::InvalidValue {
                        field: field("max_concurrent"),
                        message: e.to_string(),
                    })?;

                BakedExecutor::Foreach {
                    items: items_value,
                    item_var: item_var.clone(),
                    index_var: index_var.clone(),
                    template: sub(ctx, "template", template)?,
                    variables: ctx
                        .eval_map(variables)
                        .map_err(|source| BakeError::Substitute {
                            field: field("variables"),
                            source,
                        })?,
                    parallel: parallel_resolved,
                    max_concurrent: max_concurrent_resolved,
                    join: *join,
                }
            }
            ExecutorDef::Agent {
                agent,
                prompt,
                mode,
                outputs,
            } => BakedExecutor::Agent {
                agent: sub(ctx, "agent", agent)?,
                prompt: sub(ctx, "prompt", prompt)?,
                interactive: mode == "interactive",
                outputs: outputs.clone(),
            },
        })
    }

    fn bake_target(
        &self,
        ctx: &mut Context,
        step_id: &str,
        target: &ExpansionTarget,
    ) -> Result<BakedTarget, BakeError> {
        match target {
            ExpansionTarget::Template { template, variables } => Ok(BakedTarget::Template {
                template: ctx.render(template).map_err(|source| BakeError::Substitute {
                    field: format!("{step_id}.template"),
                    source,
                })?,
                variables: ctx
                    .eval_map(variables)
                    .map_err(|source| BakeError::Substitute {
                        field: format!("{step_id}.variables"),
                        source,
                    })?,
            }),
            ExpansionTarget::Inline { steps } => {
                let mut baked = Vec::with_capacity(steps.len());
                for inline_step in steps {
                    baked.push(self.bake_step(ctx, inline_step)?);
                }
                Ok(BakedTarget::Inline { steps: baked })
            }
        }
    }
}

fn value_to_list(value: Value, step_id: &str) -> Result<Vec<Value>, BakeError> {
    match value {
        Value::Array(a) => Ok(a.into_iter().map(Value::from_json).collect()),
        other => Err(BakeError::InvalidValue {
            field: format!("{step_id}.items"),
            message: format!("expected an array, got {}", other.to_plain_string()),
        }),
    }
}

fn to_core_type(t: VarType) -> meow_core::value::ValueType {
    use meow_core::value::ValueType as VT;
    match t {
        VarType::String => VT::String,
        VarType::Int => VT::Int,
        VarType::Bool => VT::Bool,
        VarType::Object => VT::Object,
        VarType::Json => VT::Json,
        VarType::File => VT::File,
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(format!("'{other}' is not a valid bool")),
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (num_part, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let num: u64 = num_part
        .parse()
        .map_err(|_| format!("invalid duration: '{s}'"))?;
    let secs = match unit {
        "s" | "" => num,
        "m" => num * 60,
        "h" => num * 3600,
        other => return Err(format!("unknown duration unit '{other}' in '{s}'")),
    };
    Ok(Duration::from_secs(secs))
}

fn closest(target: &str, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(target, c)))
        .filter(|(_, d)| *d <= 2)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c.to_string())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut dp = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for (i, row) in dp.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=b.len() {
        dp[0][j] = j;
    }
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            dp[i][j] = (dp[i - 1][j] + 1)
                .min(dp[i][j - 1] + 1)
                .min(dp[i - 1][j - 1] + cost);
        }
    }
    dp[a.len()][b.len()]
}
