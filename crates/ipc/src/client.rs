// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent-side IPC client. All writes serialize on a per-connection
//! mutex; on any I/O error the connection is dropped and reopened
//! lazily on the next call.

use crate::protocol::{AgentMessage, OrchestratorMessage};
use crate::wire::{read_message, write_message, WireError};
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

pub struct AgentClient {
    socket_path: PathBuf,
    conn: Mutex<Option<UnixStream>>,
}

impl AgentClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            conn: Mutex::new(None),
        }
    }

    /// Send one request and read the matching reply. Request/response
    /// is half-duplex: one line out, one line in, per call.
    pub async fn request(&self, message: &AgentMessage) -> Result<OrchestratorMessage, WireError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(UnixStream::connect(&self.socket_path).await?);
        }

        let result = async {
            let stream = guard.as_mut().expect("connection just established");
            write_message(stream, message).await?;
            let mut reader = BufReader::new(&mut *stream);
            read_message(&mut reader).await
        }
        .await;

        if result.is_err() {
            *guard = None;
        }
        result
    }

    /// Fire-and-forget: send an `event` message without waiting for a
    /// reply (none is sent for this message type).
    pub async fn send_event(&self, message: &AgentMessage) -> Result<(), WireError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(UnixStream::connect(&self.socket_path).await?);
        }
        let stream = guard.as_mut().expect("connection just established");
        let result = write_message(stream, message).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::IpcServer;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn round_trips_step_done_through_server() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("run.sock");
        let server = IpcServer::bind(&socket_path).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            server.serve(tx).await;
        });
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                if let Some(reply) = inbound.reply {
                    let _ = reply.send(OrchestratorMessage::Ok);
                }
            }
        });

        let client = AgentClient::new(&socket_path);
        let reply = client
            .request(&AgentMessage::StepDone {
                workflow: "w".into(),
                agent: "a".into(),
                step: "s".into(),
                outputs: HashMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(reply, OrchestratorMessage::Ok);
    }
}
