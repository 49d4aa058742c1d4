// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Newtype identifiers, plus the `run-<hex>-<8hex>` run id generator.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Helper for truncated display of ids in logs.
pub trait ShortId {
    fn short(&self, n: usize) -> String;
}

impl ShortId for str {
    fn short(&self, n: usize) -> String {
        self.chars().take(n).collect()
    }
}

macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn short(&self, n: usize) -> String {
                self.0.short(n)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(RunId);
define_id!(AgentId);
define_id!(StepId);

/// Generates unique identifiers.
pub trait IdGen: Send + Sync {
    fn next(&self, prefix: &str) -> String;
}

/// Generator backed by `uuid::Uuid::new_v4`.
#[derive(Debug, Clone, Default)]
pub struct UuidIdGen;

impl IdGen for UuidIdGen {
    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4().simple())
    }
}

/// Sequential generator for deterministic tests.
#[derive(Debug, Clone)]
pub struct SequentialIdGen {
    counter: Arc<AtomicU64>,
}

impl Default for SequentialIdGen {
    fn default() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl IdGen for SequentialIdGen {
    fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{n:08x}")
    }
}

/// Generates [`RunId`]s in the `run-<lowhex>-<8hex>` form.
///
/// The first hex group carries entropy from a v4 UUID (36 hex chars
/// after stripping hyphens, we keep 16); the second group is exactly
/// 8 lowercase hex characters, also UUID-derived. Both are lowercase
/// and contain none of `/ \ : * ? " < > |` or whitespace, so a RunId
/// is always a valid path component.
pub trait RunIdGen: Send + Sync {
    fn next_run_id(&self) -> RunId;
}

#[derive(Debug, Clone, Default)]
pub struct UuidRunIdGen;

impl RunIdGen for UuidRunIdGen {
    fn next_run_id(&self) -> RunId {
        let a = Uuid::new_v4().simple().to_string();
        let b = Uuid::new_v4().simple().to_string();
        RunId::new(format!("run-{}-{}", &a[..16], &b[..8]))
    }
}

/// Regex-free format check: `run-[0-9a-f]+-[0-9a-f]{8}`.
pub fn is_valid_run_id(s: &str) -> bool {
    let Some(rest) = s.strip_prefix("run-") else {
        return false;
    };
    let Some((first, second)) = rest.rsplit_once('-') else {
        return false;
    };
    !first.is_empty()
        && first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        && second.len() == 8
        && second.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_match_the_format() {
        let gen = UuidRunIdGen;
        for _ in 0..100 {
            let id = gen.next_run_id();
            assert!(is_valid_run_id(id.as_str()), "bad id: {id}");
        }
    }

    #[test]
    fn ids_are_filesystem_safe() {
        let gen = UuidRunIdGen;
        let id = gen.next_run_id();
        assert!(!id
            .as_str()
            .chars()
            .any(|c| "/\\:*?\"<>| \t\n".contains(c)));
    }

    #[test]
    fn generated_ids_do_not_collide() {
        let gen = UuidRunIdGen;
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(gen.next_run_id().as_str().to_string()));
        }
    }

    #[test]
    fn sequential_gen_is_deterministic() {
        let gen = SequentialIdGen::default();
        assert_eq!(gen.next("step"), "step-00000000");
        assert_eq!(gen.next("step"), "step-00000001");
    }
}
