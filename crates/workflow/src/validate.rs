// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Validation: collects every defect in a parsed workflow instead of
//! stopping at the first one.

use crate::model::{ExecutorDef, ExpansionTarget, Module, StepDef, Workflow};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub workflow: String,
    pub step: Option<String>,
    pub field: Option<String>,
    pub message: String,
    pub suggestion: Option<String>,
}

/// Validate every workflow in a module, plus the cross-workflow checks
/// that need visibility into the whole module (local template
/// references resolving to a sibling workflow).
pub fn validate_module(module: &Module) -> Vec<ValidationIssue> {
    let sibling_names: HashSet<&str> = module.workflows.keys().map(String::as_str).collect();
    let mut issues = Vec::new();
    for (name, workflow) in &module.workflows {
        issues.extend(validate_workflow(name, workflow));
        check_local_references(name, workflow, &sibling_names, &mut issues);
    }
    issues
}

fn check_local_references(
    name: &str,
    workflow: &Workflow,
    sibling_names: &HashSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    for step in &workflow.steps {
        for (field, template) in local_template_fields(step) {
            if template.contains("{{") {
                continue;
            }
            let Some(target_name) = template.strip_prefix('.') else {
                continue;
            };
            if !sibling_names.contains(target_name) {
                let candidates: Vec<&str> = sibling_names.iter().copied().collect();
                issues.push(ValidationIssue {
                    workflow: name.to_string(),
                    step: Some(step.id.clone()),
                    field: Some(field.to_string()),
                    message: format!(
                        "local reference '{template}' does not resolve to a workflow in this module"
                    ),
                    suggestion: closest_match(target_name, &candidates),
                });
            }
        }
    }
}

fn local_template_fields(step: &StepDef) -> Vec<(&'static str, &str)> {
    let mut out = Vec::new();
    match &step.executor {
        ExecutorDef::Expand { template, .. } => out.push(("template", template.as_str())),
        ExecutorDef::Foreach { template, .. } => out.push(("template", template.as_str())),
        ExecutorDef::Branch {
            on_true,
            on_false,
            on_timeout,
            ..
        } => {
            for (field, target) in [
                ("on_true", on_true),
                ("on_false", on_false),
                ("on_timeout", on_timeout),
            ] {
                if let Some(ExpansionTarget::Template { template, .. }) = target {
                    out.push((field, template.as_str()));
                }
            }
        }
        _ => {}
    }
    out
}

pub fn validate_workflow(name: &str, workflow: &Workflow) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if workflow.steps.is_empty() {
        issues.push(ValidationIssue {
            workflow: name.to_string(),
            step: None,
            field: None,
            message: "workflow has no steps".to_string(),
            suggestion: None,
        });
    }

    check_unique_ids(name, workflow, &mut issues);
    check_needs_resolve(name, workflow, &mut issues);
    check_cycles(name, workflow, &mut issues);
    check_variable_references(name, workflow, &mut issues);

    issues
}

fn check_unique_ids(name: &str, workflow: &Workflow, issues: &mut Vec<ValidationIssue>) {
    let mut seen = HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(step.id.clone()) {
            issues.push(ValidationIssue {
                workflow: name.to_string(),
                step: Some(step.id.clone()),
                field: None,
                message: format!("duplicate step id '{}'", step.id),
                suggestion: None,
            });
        }
    }
}

fn expand_children(step: &StepDef) -> Vec<String> {
    // Child ids this step's expansion may produce, for `needs` of the
    // form `<step>.<child>` to resolve against.
    match &step.executor {
        ExecutorDef::Branch {
            on_true,
            on_false,
            on_timeout,
            ..
        } => [on_true, on_false, on_timeout]
            .into_iter()
            .flatten()
            .flat_map(target_child_ids)
            .collect(),
        ExecutorDef::Expand { .. } | ExecutorDef::Foreach { .. } => vec!["*".to_string()],
        _ => Vec::new(),
    }
}

fn target_child_ids(target: &ExpansionTarget) -> Vec<String> {
    match target {
        ExpansionTarget::Inline { steps } => steps.iter().map(|s| s.id.clone()).collect(),
        ExpansionTarget::Template { .. } => vec!["*".to_string()],
    }
}

fn check_needs_resolve(name: &str, workflow: &Workflow, issues: &mut Vec<ValidationIssue>) {
    let sibling_ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
    let mut children_by_parent: HashMap<&str, Vec<String>> = HashMap::new();
    for step in &workflow.steps {
        children_by_parent.insert(step.id.as_str(), expand_children(step));
    }

    for step in &workflow.steps {
        for dep in &step.needs {
            if sibling_ids.contains(dep.as_str()) {
                continue;
            }
            if let Some((parent, child)) = dep.split_once('.') {
                if let Some(children) = children_by_parent.get(parent) {
                    if children.iter().any(|c| c == "*" || c == child) {
                        continue;
                    }
                }
            }
            issues.push(ValidationIssue {
                workflow: name.to_string(),
                step: Some(step.id.clone()),
                field: Some("needs".to_string()),
                message: format!("'{dep}' does not resolve to a sibling step or expansion child"),
                suggestion: None,
            });
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

fn check_cycles(name: &str, workflow: &Workflow, issues: &mut Vec<ValidationIssue>) {
    let adjacency: HashMap<&str, Vec<&str>> = workflow
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.needs.iter().map(String::as_str).collect()))
        .collect();
    let mut colors: HashMap<&str, Color> =
        workflow.steps.iter().map(|s| (s.id.as_str(), Color::White)).collect();

    for step in &workflow.steps {
        if colors.get(step.id.as_str()) == Some(&Color::White) {
            let mut path = Vec::new();
            if let Some(cycle) = visit(step.id.as_str(), &adjacency, &mut colors, &mut path) {
                issues.push(ValidationIssue {
                    workflow: name.to_string(),
                    step: None,
                    field: Some("needs".to_string()),
                    message: format!("dependency cycle: {}", cycle.join(" → ")),
                    suggestion: None,
                });
            }
        }
    }
}

fn visit<'a>(
    id: &'a str,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    colors.insert(id, Color::Gray);
    path.push(id);
    if let Some(deps) = adjacency.get(id) {
        for &dep in deps {
            // `needs` may reference expansion children (e.g. `x.y`),
            // which are not nodes in this graph; only sibling ids
            // participate in cycle detection here.
            if !adjacency.contains_key(dep) {
                continue;
            }
            match colors.get(dep) {
                Some(Color::Gray) => {
                    let mut cycle: Vec<String> = path.iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                Some(Color::White) | None => {
                    if let Some(cycle) = visit(dep, adjacency, colors, path) {
                        return Some(cycle);
                    }
                }
                Some(Color::Black) => {}
            }
        }
    }
    path.pop();
    colors.insert(id, Color::Black);
    None
}

fn check_variable_references(name: &str, workflow: &Workflow, issues: &mut Vec<ValidationIssue>) {
    let declared: Vec<&str> = workflow.variables.keys().map(String::as_str).collect();
    const BUILTINS: &[&str] = &["workflow_id", "step_id", "timestamp", "date", "time"];

    for step in &workflow.steps {
        for field_text in step_text_fields(step) {
            for reference in find_references(&field_text) {
                let first = reference.split('.').next().unwrap_or(&reference);
                if first == "output" || first == "outputs" {
                    continue;
                }
                if declared.contains(&first) || BUILTINS.contains(&first) {
                    continue;
                }
                let suggestion = closest_match(first, &declared);
                issues.push(ValidationIssue {
                    workflow: name.to_string(),
                    step: Some(step.id.clone()),
                    field: None,
                    message: format!("undefined variable reference '{first}'"),
                    suggestion,
                });
            }
        }
    }
}

fn step_text_fields(step: &StepDef) -> Vec<String> {
    match &step.executor {
        ExecutorDef::Shell { command, .. } => vec![command.clone()],
        ExecutorDef::Branch { condition, .. } => vec![condition.clone()],
        ExecutorDef::Agent { prompt, .. } => vec![prompt.clone()],
        _ => Vec::new(),
    }
}

fn find_references(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let after_start = &rest[start + 2..];
        if let Some(end) = after_start.find("}}") {
            out.push(after_start[..end].trim().to_string());
            rest = &after_start[end + 2..];
        } else {
            break;
        }
    }
    out
}

fn closest_match(target: &str, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .map(|c| (*c, edit_distance(target, c)))
        .filter(|(_, d)| *d <= 2)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c.to_string())
}

fn edit_distance(a: &str, b: &str) -> usize {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutorDef, StepDef, VariableDecl};
    use std::collections::HashMap;

    fn shell_step(id: &str, needs: &[&str], command: &str) -> StepDef {
        StepDef {
            id: id.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            timeout: None,
            executor: ExecutorDef::Shell {
                command: command.to_string(),
                workdir: None,
                env: HashMap::new(),
                on_error: None,
                shell_outputs: HashMap::new(),
            },
        }
    }

    #[test]
    fn detects_duplicate_step_ids() {
        let wf = Workflow {
            steps: vec![shell_step("a", &[], "true"), shell_step("a", &[], "true")],
            ..Default::default()
        };
        let issues = validate_workflow("main", &wf);
        assert!(issues.iter().any(|i| i.message.contains("duplicate step id")));
    }

    #[test]
    fn detects_unresolved_needs() {
        let wf = Workflow {
            steps: vec![shell_step("a", &["ghost"], "true")],
            ..Default::default()
        };
        let issues = validate_workflow("main", &wf);
        assert!(issues.iter().any(|i| i.message.contains("does not resolve")));
    }

    #[test]
    fn detects_dependency_cycle() {
        let wf = Workflow {
            steps: vec![shell_step("a", &["b"], "true"), shell_step("b", &["a"], "true")],
            ..Default::default()
        };
        let issues = validate_workflow("main", &wf);
        assert!(issues.iter().any(|i| i.message.contains("cycle")));
    }

    #[test]
    fn undefined_variable_gets_edit_distance_suggestion() {
        let mut variables = HashMap::new();
        variables.insert("adapter".to_string(), VariableDecl::default());
        let wf = Workflow {
            variables,
            steps: vec![shell_step("a", &[], "run --mode {{adapater}}")],
            ..Default::default()
        };
        let issues = validate_workflow("main", &wf);
        let issue = issues
            .iter()
            .find(|i| i.message.contains("adapater"))
            .expect("expected undefined variable issue");
        assert_eq!(issue.suggestion.as_deref(), Some("adapter"));
    }

    #[test]
    fn output_references_are_not_flagged() {
        let wf = Workflow {
            steps: vec![shell_step("a", &[], "echo {{build.outputs.artifact}}")],
            ..Default::default()
        };
        let issues = validate_workflow("main", &wf);
        assert!(!issues.iter().any(|i| i.message.contains("undefined")));
    }

    fn expand_step(id: &str, template: &str) -> StepDef {
        StepDef {
            id: id.to_string(),
            needs: Vec::new(),
            timeout: None,
            executor: ExecutorDef::Expand {
                template: template.to_string(),
                variables: HashMap::new(),
            },
        }
    }

    #[test]
    fn local_reference_to_a_missing_sibling_is_flagged() {
        let mut workflows = indexmap::IndexMap::new();
        workflows.insert(
            "main".to_string(),
            Workflow {
                steps: vec![expand_step("a", ".worker")],
                ..Default::default()
            },
        );
        let module = crate::model::Module {
            path: Some("m.meow.toml".to_string()),
            workflows,
        };
        let issues = validate_module(&module);
        assert!(issues
            .iter()
            .any(|i| i.message.contains("does not resolve to a workflow in this module")));
    }

    #[test]
    fn local_reference_to_a_real_sibling_is_not_flagged() {
        let mut workflows = indexmap::IndexMap::new();
        workflows.insert(
            "main".to_string(),
            Workflow {
                steps: vec![expand_step("a", ".worker")],
                ..Default::default()
            },
        );
        workflows.insert(
            "worker".to_string(),
            Workflow {
                steps: vec![shell_step("s", &[], "true")],
                ..Default::default()
            },
        );
        let module = crate::model::Module {
            path: Some("m.meow.toml".to_string()),
            workflows,
        };
        let issues = validate_module(&module);
        assert!(!issues
            .iter()
            .any(|i| i.message.contains("does not resolve to a workflow in this module")));
    }
}
