// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resolves the directories the engine reads workflows from and
//! writes run state to.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine a home directory to resolve a state directory under")]
    NoStateDir,
}

/// Filesystem roots the engine needs: where project/user workflow
/// tiers live, and where run snapshots are written.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub project_root: Option<PathBuf>,
    pub user_root: Option<PathBuf>,
    pub run_dir_root: PathBuf,
}

impl EngineConfig {
    /// `MEOW_STATE_DIR` wins outright; otherwise the project tier is
    /// `.meow/workflows` relative to the current directory (when it
    /// exists) and the user tier and run directory fall under
    /// `dirs::home_dir()/.meow`.
    pub fn resolve() -> Result<Self, ConfigError> {
        let state_dir = if let Ok(dir) = std::env::var("MEOW_STATE_DIR") {
            PathBuf::from(dir)
        } else {
            let home = dirs::home_dir().ok_or(ConfigError::NoStateDir)?;
            home.join(".meow")
        };

        let project_root = std::env::current_dir()
            .ok()
            .map(|cwd| cwd.join(".meow").join("workflows"))
            .filter(|p| p.is_dir());
        let user_root = Some(state_dir.join("workflows"));
        let run_dir_root = state_dir.join("runs");

        Ok(Self {
            project_root,
            user_root,
            run_dir_root,
        })
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir_root.join(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn explicit_state_dir_env_var_wins() {
        std::env::set_var("MEOW_STATE_DIR", "/tmp/meow-test-state");
        let config = EngineConfig::resolve().unwrap();
        assert_eq!(config.run_dir_root, PathBuf::from("/tmp/meow-test-state/runs"));
        std::env::remove_var("MEOW_STATE_DIR");
    }
}
