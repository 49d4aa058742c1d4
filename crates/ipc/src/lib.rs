// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! meow-ipc: newline-delimited JSON protocol between the orchestrator
//! and agent processes, over a local Unix domain socket.

pub mod client;
pub mod protocol;
pub mod server;
pub mod wire;

pub use client::AgentClient;
pub use protocol::{AgentMessage, OrchestratorMessage};
pub use server::{Inbound, IpcServer, ServerError};
pub use wire::{read_message, write_message, WireError};
