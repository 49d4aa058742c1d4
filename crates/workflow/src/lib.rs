// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! meow-workflow: module parsing, reference resolution, validation,
//! variable substitution, and baking.

pub mod bake;
pub mod baked;
pub mod collection;
pub mod context;
pub mod embedded;
pub mod loader;
pub mod model;
pub mod parse;
pub mod validate;

pub use bake::{BakeError, Baker};
pub use baked::{BakeResult, BakedExecutor, BakedStep, BakedTarget, OnError};
pub use context::{Context, DeferOptions, OutputLookup, SubstituteError};
pub use loader::{LoadContext, LoadError, Loader, Reference, Scope};
pub use model::{Module, StepDef, VariableDecl, Workflow};
pub use parse::{parse_module, ParseError};
pub use validate::{validate_module, validate_workflow, ValidationIssue};
