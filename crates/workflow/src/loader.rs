// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reference resolution: `name[:sub][#section]` against a tiered
//! search hierarchy (project / user / embedded), with collection
//! support and cycle detection across a shared visited set.

use crate::collection::{parse_manifest, ManifestError, MANIFEST_FILE};
use crate::embedded;
use crate::model::{ExecutorDef, ExpansionTarget, Module, Workflow};
use crate::parse::{parse_module, ParseError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Project,
    User,
    Embedded,
}

impl Scope {
    fn tiers(self) -> &'static [Tier] {
        match self {
            Scope::Project => &[Tier::Project, Tier::User, Tier::Embedded],
            Scope::User => &[Tier::User, Tier::Embedded],
            Scope::Embedded => &[Tier::Embedded],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Project,
    User,
    Embedded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub subpath: Option<String>,
    pub section: String,
}

impl Reference {
    pub fn parse(raw: &str) -> Reference {
        let (head, section) = match raw.split_once('#') {
            Some((h, s)) => (h, s.to_string()),
            None => (raw, "main".to_string()),
        };
        let (name, subpath) = match head.split_once(':') {
            Some((n, s)) => (n.to_string(), Some(s.to_string())),
            None => (head.to_string(), None),
        };
        Reference {
            name,
            subpath,
            section,
        }
    }

    /// Canonical key used for cycle detection: the resolved file
    /// path plus section, so two references to the same document
    /// compare equal regardless of exact spelling.
    fn cycle_key(&self, resolved_path: &str) -> String {
        format!("{resolved_path}#{}", self.section)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reference not found: {reference} (searched: {searched:?})")]
    NotFound {
        reference: String,
        searched: Vec<String>,
    },
    #[error(
        "circular reference detected: {offender} (path: {})",
        path.join(" → ")
    )]
    Cycle { offender: String, path: Vec<String> },
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Bookkeeping for one loader traversal. `visited` is shared across
/// forks (for cycle detection); `stack` is copied on fork (for
/// accurate error paths when siblings load concurrently).
#[derive(Debug, Clone, Default)]
pub struct LoadContext {
    visited: HashSet<String>,
    stack: Vec<String>,
}

impl LoadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `key`. Fails if already on the active stack (a cycle);
    /// diamond dependencies are fine because `exit` removes the key
    /// again once a sibling branch is done with it.
    pub fn enter(&mut self, key: &str) -> Result<(), LoadError> {
        if self.visited.contains(key) {
            let mut path = self.stack.clone();
            path.push(key.to_string());
            return Err(LoadError::Cycle {
                offender: key.to_string(),
                path,
            });
        }
        self.visited.insert(key.to_string());
        self.stack.push(key.to_string());
        Ok(())
    }

    /// Leave `key`: pop from both the stack and the visited set.
    pub fn exit(&mut self, key: &str) {
        if self.stack.last().map(String::as_str) == Some(key) {
            self.stack.pop();
        }
        self.visited.remove(key);
    }

    /// Fork a child context for a concurrently-loading branch: shares
    /// the visited set (so cross-branch cycles are still caught) but
    /// copies the stack (so each branch reports its own path).
    pub fn child(&self) -> Self {
        Self {
            visited: self.visited.clone(),
            stack: self.stack.clone(),
        }
    }
}

pub struct Loader {
    project_root: Option<PathBuf>,
    user_root: Option<PathBuf>,
}

impl Loader {
    pub fn new(project_root: Option<PathBuf>, user_root: Option<PathBuf>) -> Self {
        Self {
            project_root,
            user_root,
        }
    }

    fn tier_root(&self, tier: Tier) -> Option<PathBuf> {
        match tier {
            Tier::Project => self.project_root.clone(),
            Tier::User => self.user_root.clone(),
            Tier::Embedded => None,
        }
    }

    /// Resolve and parse the module containing `reference`, returning
    /// the module plus the workflow name to use (the reference's
    /// `section`).
    pub fn load(
        &self,
        raw_reference: &str,
        scope: Scope,
        ctx: &mut LoadContext,
    ) -> Result<(Module, String), LoadError> {
        let reference = Reference::parse(raw_reference);
        let mut searched = Vec::new();

        for tier in scope.tiers() {
            if let Some(found) = self.try_tier(*tier, &reference, &mut searched)? {
                let key = reference.cycle_key(&found.display_path);
                ctx.enter(&key)?;
                let module = parse_module(&found.display_path, &found.source)?;
                check_local_cycles(&module, &found.display_path)?;
                ctx.exit(&key);
                return Ok((module, reference.section));
            }
        }

        Err(LoadError::NotFound {
            reference: raw_reference.to_string(),
            searched,
        })
    }

    fn try_tier(
        &self,
        tier: Tier,
        reference: &Reference,
        searched: &mut Vec<String>,
    ) -> Result<Option<Found>, LoadError> {
        if tier == Tier::Embedded {
            return self.try_embedded(reference, searched);
        }

        let Some(root) = self.tier_root(tier) else {
            return Ok(None);
        };

        // Collection form: <root>/<name>/meow-collection.toml
        let collection_dir = root.join(&reference.name);
        let manifest_path = collection_dir.join(MANIFEST_FILE);
        searched.push(manifest_path.display().to_string());
        if manifest_path.is_file() {
            let manifest_source = read_to_string(&manifest_path)?;
            let _manifest = parse_manifest(&manifest_source)?;
            let file = match &reference.subpath {
                Some(sub) => collection_dir.join(format!("{sub}.meow.toml")),
                None => {
                    // entrypoint: first pack's first workflow, by convention `main.meow.toml`
                    collection_dir.join("main.meow.toml")
                }
            };
            if file.is_file() {
                let source = read_to_string(&file)?;
                return Ok(Some(Found {
                    display_path: file.display().to_string(),
                    source,
                }));
            }
            // Manifest exists but referenced file doesn't: fall through
            // to the single-file fallback below rather than failing.
        }

        // Single-file form: <root>/<name>.meow.toml (or <root>/<name>/<sub>.meow.toml)
        let file = match &reference.subpath {
            Some(sub) => root.join(&reference.name).join(format!("{sub}.meow.toml")),
            None => root.join(format!("{}.meow.toml", reference.name)),
        };
        searched.push(file.display().to_string());
        if file.is_file() {
            let source = read_to_string(&file)?;
            return Ok(Some(Found {
                display_path: file.display().to_string(),
                source,
            }));
        }

        Ok(None)
    }

    fn try_embedded(
        &self,
        reference: &Reference,
        searched: &mut Vec<String>,
    ) -> Result<Option<Found>, LoadError> {
        let key = match &reference.subpath {
            Some(sub) => format!("{}/{sub}", reference.name),
            None => reference.name.clone(),
        };
        searched.push(format!("embedded:{key}"));
        Ok(embedded::lookup(&key).map(|source| Found {
            display_path: format!("embedded:{key}"),
            source: source.to_string(),
        }))
    }
}

struct Found {
    display_path: String,
    source: String,
}

/// Walk every local (same-module, leading-dot) template reference
/// reachable from each workflow and fail on the first cycle. Local
/// references never leave the module they're declared in, so this is
/// fully static: no dispatch-time recursion is needed to catch it.
fn check_local_cycles(module: &Module, display_path: &str) -> Result<(), LoadError> {
    for name in module.workflows.keys() {
        let mut ctx = LoadContext::new();
        visit_local(module, display_path, name, &mut ctx)?;
    }
    Ok(())
}

fn visit_local(
    module: &Module,
    display_path: &str,
    name: &str,
    ctx: &mut LoadContext,
) -> Result<(), LoadError> {
    let key = format!("{display_path}#{name}");
    ctx.enter(&key)?;
    if let Some(workflow) = module.workflows.get(name) {
        for target in local_targets(workflow) {
            visit_local(module, display_path, &target, ctx)?;
        }
    }
    ctx.exit(&key);
    Ok(())
}

fn local_targets(workflow: &Workflow) -> Vec<String> {
    let mut targets = Vec::new();
    for step in &workflow.steps {
        match &step.executor {
            ExecutorDef::Expand { template, .. } => push_local_target(&mut targets, template),
            ExecutorDef::Foreach { template, .. } => push_local_target(&mut targets, template),
            ExecutorDef::Branch {
                on_true,
                on_false,
                on_timeout,
                ..
            } => {
                for target in [on_true, on_false, on_timeout].into_iter().flatten() {
                    if let ExpansionTarget::Template { template, .. } = target {
                        push_local_target(&mut targets, template);
                    }
                }
            }
            _ => {}
        }
    }
    targets
}

fn push_local_target(targets: &mut Vec<String>, template: &str) {
    // Templated references (`{{...}}`) aren't known until bake time;
    // only a literal leading-dot string can be checked statically.
    if !template.contains("{{") {
        if let Some(name) = template.strip_prefix('.') {
            targets.push(name.to_string());
        }
    }
}

fn read_to_string(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })
}
