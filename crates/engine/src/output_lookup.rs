// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bridges a live [`Run`] into [`OutputLookup`] so the dispatcher can
//! resolve `{{step.outputs.field}}` references the baker left
//! deferred (output values don't exist until the producing step
//! finishes, which is after the whole workflow is baked).

use meow_core::{Run, StepId, Value};
use meow_workflow::context::OutputLookup;

pub struct RunOutputLookup<'a> {
    run: &'a Run,
}

impl<'a> RunOutputLookup<'a> {
    pub fn new(run: &'a Run) -> Self {
        Self { run }
    }
}

impl OutputLookup for RunOutputLookup<'_> {
    fn lookup(&self, step_id: &str, field: &str) -> Result<Option<Value>, String> {
        let Some(state) = self.run.steps.get(&StepId::new(step_id)) else {
            return Err(format!("no such step '{step_id}'"));
        };
        if !state.status.is_terminal() {
            return Ok(None);
        }
        Ok(state.outputs.get(field).cloned())
    }
}
