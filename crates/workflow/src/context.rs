// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Variable/output context and `{{path}}` substitution.
//!
//! Two resolution modes: [`Context::render`] always returns a string;
//! [`Context::eval`] preserves the referent's type when the whole
//! input is a single pure reference.

use meow_core::Value;
use std::collections::HashMap;
use thiserror::Error;

const MAX_RENDER_PASSES: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubstituteError {
    #[error("undefined variable or field: {0}")]
    Undefined(String),
    #[error("cannot descend into non-object at: {0}")]
    NotAnObject(String),
    #[error("unresolved references after {MAX_RENDER_PASSES} passes: {0:?}")]
    MaxDepthExceeded(Vec<String>),
    #[error("step '{0}' outputs are not yet available")]
    OutputsNotReady(String),
}

/// Governs how an unresolvable reference is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeferOptions {
    pub defer_undefined_variables: bool,
    pub defer_step_outputs: bool,
}

/// Callback used to fetch a not-yet-cached step output on demand.
pub trait OutputLookup: Send + Sync {
    /// Returns `Ok(None)` if the step hasn't reached `done` yet.
    fn lookup(&self, step_id: &str, field: &str) -> Result<Option<Value>, String>;
}

pub struct Context<'a> {
    pub variables: HashMap<String, Value>,
    pub outputs: HashMap<String, HashMap<String, Value>>,
    pub builtins: HashMap<String, Value>,
    pub defer: DeferOptions,
    output_lookup: Option<&'a dyn OutputLookup>,
}

impl<'a> Context<'a> {
    pub fn new(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            outputs: HashMap::new(),
            builtins: HashMap::new(),
            defer: DeferOptions::default(),
            output_lookup: None,
        }
    }

    pub fn with_output_lookup(mut self, lookup: &'a dyn OutputLookup) -> Self {
        self.output_lookup = Some(lookup);
        self
    }

    pub fn set_builtin(&mut self, key: impl Into<String>, value: Value) {
        self.builtins.insert(key.into(), value);
    }

    /// Render: always returns a string, substituting every `{{path}}`
    /// occurrence, re-scanning up to [`MAX_RENDER_PASSES`] times to
    /// allow one level of indirection through values that themselves
    /// contain templates.
    pub fn render(&mut self, template: &str) -> Result<String, SubstituteError> {
        let mut current = template.to_string();
        for _ in 0..MAX_RENDER_PASSES {
            let (next, substituted_any) = self.substitute_pass(&current, false)?;
            if !substituted_any {
                return Ok(next);
            }
            if next == current {
                return Ok(next);
            }
            current = next;
        }
        let remaining = find_patterns(&current);
        if remaining.is_empty() {
            Ok(current)
        } else {
            Err(SubstituteError::MaxDepthExceeded(remaining))
        }
    }

    /// Eval: if `template`, trimmed, is exactly one `{{path}}` with no
    /// other content, resolve and return the typed value. Otherwise
    /// falls back to rendering as a string.
    pub fn eval(&mut self, template: &str) -> Result<Value, SubstituteError> {
        let trimmed = template.trim();
        if let Some(path) = pure_reference(trimmed) {
            return self.resolve_path(&path);
        }
        self.render(template).map(Value::String)
    }

    /// Apply [`Context::eval`] to every value in a map.
    pub fn eval_map(
        &mut self,
        map: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, SubstituteError> {
        let mut out = HashMap::with_capacity(map.len());
        for (k, v) in map {
            let resolved = match v {
                Value::String(s) => self.eval(s)?,
                other => other.clone(),
            };
            out.insert(k.clone(), resolved);
        }
        Ok(out)
    }

    /// Substitute `{{...}}` with single-quoted, shell-safe literals.
    /// Non-recursive: a resolved value containing `{{other}}` is left
    /// literal rather than re-expanded.
    pub fn substitute_for_shell(&mut self, template: &str) -> Result<String, SubstituteError> {
        let (result, _) = self.substitute_pass(template, true)?;
        Ok(result)
    }

    fn substitute_pass(&mut self, template: &str, shell_escape: bool) -> Result<(String, bool), SubstituteError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        let mut substituted_any = false;
        loop {
            match find_next_expr(rest) {
                None => {
                    out.push_str(rest);
                    break;
                }
                Some((before, path, after)) => {
                    out.push_str(before);
                    let value = self.resolve_path(path)?;
                    if shell_escape {
                        out.push_str(&shell_quote(&value.to_plain_string()));
                    } else {
                        out.push_str(&value.to_plain_string());
                    }
                    substituted_any = true;
                    rest = after;
                }
            }
        }
        Ok((out, substituted_any))
    }

    fn resolve_path(&mut self, path: &str) -> Result<Value, SubstituteError> {
        let segments: Vec<&str> = path.split('.').collect();
        if let Some(idx) = segments.iter().position(|s| *s == "outputs" || *s == "output") {
            if idx > 0 && idx + 1 < segments.len() {
                let step_id = segments[..idx].join(".");
                let field = segments[idx + 1..].join(".");
                return self.resolve_output(&step_id, &field, path);
            }
        }
        if let Some(v) = self.variables.get(segments[0]) {
            return descend(v.clone(), &segments[1..], path);
        }
        if let Some(v) = self.builtins.get(segments[0]) {
            return descend(v.clone(), &segments[1..], path);
        }
        if segments[0] == "timestamp" || segments[0] == "date" || segments[0] == "time" {
            return Ok(Value::String(dynamic_time_builtin(segments[0])));
        }
        if self.defer.defer_undefined_variables {
            return Ok(Value::String(format!("{{{{{path}}}}}")));
        }
        Err(SubstituteError::Undefined(path.to_string()))
    }

    fn resolve_output(
        &mut self,
        step_id: &str,
        field: &str,
        full_path: &str,
    ) -> Result<Value, SubstituteError> {
        if let Some(fields) = self.outputs.get(step_id) {
            if let Some(v) = fields.get(field) {
                return Ok(v.clone());
            }
        }
        if let Some(lookup) = self.output_lookup {
            match lookup.lookup(step_id, field) {
                Ok(Some(v)) => {
                    self.outputs
                        .entry(step_id.to_string())
                        .or_default()
                        .insert(field.to_string(), v.clone());
                    return Ok(v);
                }
                Ok(None) => {
                    if self.defer.defer_step_outputs {
                        return Ok(Value::String(format!("{{{{{full_path}}}}}")));
                    }
                    return Err(SubstituteError::OutputsNotReady(step_id.to_string()));
                }
                Err(e) => return Err(SubstituteError::Undefined(e)),
            }
        }
        if self.defer.defer_step_outputs {
            return Ok(Value::String(format!("{{{{{full_path}}}}}")));
        }
        Err(SubstituteError::Undefined(full_path.to_string()))
    }
}

fn dynamic_time_builtin(kind: &str) -> String {
    let now = chrono::Utc::now();
    match kind {
        "date" => now.format("%Y-%m-%d").to_string(),
        "time" => now.format("%H:%M:%S").to_string(),
        _ => now.timestamp().to_string(),
    }
}

fn descend(mut value: Value, rest: &[&str], full_path: &str) -> Result<Value, SubstituteError> {
    for field in rest {
        match value {
            Value::Object(ref map) => {
                value = map
                    .get(*field)
                    .cloned()
                    .map(Value::from_json)
                    .ok_or_else(|| SubstituteError::Undefined(full_path.to_string()))?;
            }
            _ => return Err(SubstituteError::NotAnObject(full_path.to_string())),
        }
    }
    Ok(value)
}

/// If `s` is exactly `{{path}}` with no other content and no nested
/// braces, return the inner path.
fn pure_reference(s: &str) -> Option<String> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim().to_string())
}

/// Find the next `{{...}}` span, returning (before, path, after).
fn find_next_expr(s: &str) -> Option<(&str, &str, &str)> {
    let start = s.find("{{")?;
    let rel_end = s[start + 2..].find("}}")?;
    let end = start + 2 + rel_end;
    Some((&s[..start], s[start + 2..end].trim(), &s[end + 2..]))
}

fn find_patterns(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = s;
    while let Some((_, path, after)) = find_next_expr(rest) {
        out.push(path.to_string());
        rest = after;
    }
    out
}

/// Wrap `s` in single quotes for shell use, escaping internal single
/// quotes as `'"'"'`.
fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\"'\"'");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(vars: &[(&str, Value)]) -> Context<'static> {
        let mut map = HashMap::new();
        for (k, v) in vars {
            map.insert((*k).to_string(), v.clone());
        }
        Context::new(map)
    }

    #[test]
    fn render_substitutes_variable() {
        let mut c = ctx(&[("target", Value::String("feature-x".into()))]);
        assert_eq!(
            c.render("test -f {{target}}.done").unwrap(),
            "test -f feature-x.done"
        );
    }

    #[test]
    fn eval_preserves_type_for_pure_reference() {
        let mut map = serde_json::Map::new();
        map.insert("key".into(), serde_json::Value::String("value".into()));
        let mut c = ctx(&[("config", Value::Object(map.clone()))]);
        let v = c.eval("{{config}}").unwrap();
        assert_eq!(v, Value::Object(map));
    }

    #[test]
    fn eval_mixed_string_falls_back_to_render() {
        let mut c = ctx(&[("x", Value::Int(5))]);
        let v = c.eval("value={{x}}").unwrap();
        assert_eq!(v, Value::String("value=5".into()));
    }

    #[test]
    fn shell_substitution_single_quotes_and_escapes() {
        let mut c = ctx(&[("msg", Value::String("it's ok".into()))]);
        let rendered = c.substitute_for_shell("echo {{msg}}").unwrap();
        assert_eq!(rendered, "echo 'it'\"'\"'s ok'");
    }

    #[test]
    fn shell_substitution_is_not_recursive() {
        let mut c = ctx(&[("msg", Value::String("{{other}}".into()))]);
        let rendered = c.substitute_for_shell("echo {{msg}}").unwrap();
        assert_eq!(rendered, "echo '{{other}}'");
    }

    #[test]
    fn undefined_variable_errors_by_default() {
        let mut c: Context = Context::new(HashMap::new());
        let err = c.render("{{missing}}").unwrap_err();
        assert!(matches!(err, SubstituteError::Undefined(_)));
    }

    #[test]
    fn deferred_undefined_variable_is_left_verbatim() {
        let mut c: Context = Context::new(HashMap::new());
        c.defer.defer_undefined_variables = true;
        assert_eq!(c.render("{{missing}}").unwrap(), "{{missing}}");
    }

    #[test]
    fn output_reference_resolves_through_lookup() {
        struct Lookup;
        impl OutputLookup for Lookup {
            fn lookup(&self, step_id: &str, field: &str) -> Result<Option<Value>, String> {
                assert_eq!(step_id, "build");
                assert_eq!(field, "artifact");
                Ok(Some(Value::String("out.bin".into())))
            }
        }
        let lookup = Lookup;
        let mut c: Context = Context::new(HashMap::new()).with_output_lookup(&lookup);
        assert_eq!(
            c.render("{{build.outputs.artifact}}").unwrap(),
            "out.bin"
        );
    }

    #[test]
    fn render_idempotent_once_resolved() {
        let mut c = ctx(&[("a", Value::String("plain".into()))]);
        let once = c.render("{{a}}").unwrap();
        let twice = c.render(&once).unwrap();
        assert_eq!(once, twice);
    }
}
