// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The outcome a step worker reports back to the dispatcher task.

use meow_core::Value;
use meow_workflow::baked::BakedStep;
use std::collections::HashMap;

/// What a step worker produced, fed back to the single-writer
/// dispatcher loop.
#[derive(Debug)]
pub enum StepOutcome {
    /// The step reached a terminal status directly (shell, kill,
    /// agent, a branch/foreach that spawned no further work).
    Terminal {
        status: TerminalStatus,
        outputs: HashMap<String, Value>,
        error: Option<String>,
    },
    /// An `expand`/`foreach`/`branch` step spliced child steps into
    /// the run. `self_done` is `true` when the parent step itself is
    /// immediately `done` (e.g. `foreach` with `join = false`); `false`
    /// means the parent waits for every spliced child to terminate.
    Spliced {
        children: Vec<BakedStep>,
        self_done: bool,
    },
    /// Re-enter `pending` with an incremented attempt counter (retry
    /// policy on a failed shell/branch step).
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Done,
    Failed,
    Skipped,
}
