// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Logging setup for embedders of the engine. A CLI or test harness
//! calls [`init_logging`] once at startup; the engine itself never
//! installs a subscriber implicitly.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install an `EnvFilter` + `fmt` layer, defaulting to `info` when
/// `RUST_LOG` is unset.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
