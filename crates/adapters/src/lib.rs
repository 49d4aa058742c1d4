// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! meow-adapters: process-level collaborators for the dispatcher —
//! subprocess execution for `shell` steps, agent process lifecycle
//! for `spawn`/`kill` steps.

pub mod agent;
pub mod shell;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use agent::{AgentAdapter, AgentError, AgentHandle, AgentSpawnConfig};
pub use shell::{ShellError, ShellOutcome, ShellRunner};

#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeAgentAdapter;
