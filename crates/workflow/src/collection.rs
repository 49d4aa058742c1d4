// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Collection manifest (`meow-collection.toml`): a directory of
//! workflows plus optional skills, referenced as a unit by name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const MANIFEST_FILE: &str = "meow-collection.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub collection: CollectionMeta,
    #[serde(default)]
    pub packs: Vec<Pack>,
    #[serde(default)]
    pub skills: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub meow_version: Option<String>,
    pub owner: Owner,
    #[serde(default)]
    pub repository: Option<Repository>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Owner {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub url: String,
    #[serde(default)]
    pub license: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pack {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub workflows: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid TOML in manifest: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("collection name must be lowercase, hyphen-separated: {0}")]
    InvalidName(String),
    #[error("version must be semver X.Y.Z: {0}")]
    InvalidVersion(String),
    #[error("workflow path must be relative and end in .meow.toml: {0}")]
    InvalidWorkflowPath(String),
    #[error("skill path must be relative and end in skill.toml: {0}")]
    InvalidSkillPath(String),
}

pub fn parse_manifest(source: &str) -> Result<Manifest, ManifestError> {
    let manifest: Manifest = toml::from_str(source)?;
    validate_manifest(&manifest)?;
    Ok(manifest)
}

fn validate_manifest(manifest: &Manifest) -> Result<(), ManifestError> {
    if !is_lowercase_hyphenated(&manifest.collection.name) {
        return Err(ManifestError::InvalidName(manifest.collection.name.clone()));
    }
    if !is_semver(&manifest.collection.version) {
        return Err(ManifestError::InvalidVersion(manifest.collection.version.clone()));
    }
    for pack in &manifest.packs {
        for path in &pack.workflows {
            if !is_relative(path) || !path.ends_with(".meow.toml") {
                return Err(ManifestError::InvalidWorkflowPath(path.clone()));
            }
        }
    }
    for path in manifest.skills.values() {
        if !is_relative(path) || !path.ends_with("skill.toml") {
            return Err(ManifestError::InvalidSkillPath(path.clone()));
        }
    }
    Ok(())
}

fn is_relative(path: &str) -> bool {
    !path.starts_with('/') && !path.contains("..")
}

fn is_lowercase_hyphenated(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
