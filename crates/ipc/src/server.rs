// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Orchestrator-side IPC server: one Tokio task accepts connections on
//! a run's Unix socket, one task per connection reads newline-JSON
//! messages and forwards them to the dispatcher over an mpsc channel,
//! replying on the same connection once the dispatcher answers.

use crate::protocol::{AgentMessage, OrchestratorMessage};
use crate::wire::{read_message, write_message, WireError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error binding socket at {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A decoded agent message paired with a reply channel. `reply` is
/// `None` for fire-and-forget `event` messages.
pub struct Inbound {
    pub message: AgentMessage,
    pub reply: Option<oneshot::Sender<OrchestratorMessage>>,
}

pub struct IpcServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl IpcServer {
    pub fn bind(socket_path: impl Into<PathBuf>) -> Result<Self, ServerError> {
        let socket_path = socket_path.into();
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        let listener = UnixListener::bind(&socket_path).map_err(|source| ServerError::Bind {
            path: socket_path.display().to_string(),
            source,
        })?;
        Ok(Self {
            socket_path,
            listener,
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections forever, forwarding each decoded message to
    /// `tx`. Returns only on a fatal accept error.
    pub async fn serve(self, tx: mpsc::Sender<Inbound>) -> std::io::Error {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, tx).await {
                            warn!(error = %err, "ipc connection closed with error");
                        }
                    });
                }
                Err(err) => return err,
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    tx: mpsc::Sender<Inbound>,
) -> Result<(), WireError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let message: AgentMessage = match read_message(&mut reader).await {
            Ok(m) => m,
            Err(WireError::ConnectionClosed) => return Ok(()),
            Err(err) => return Err(err),
        };

        let fire_and_forget = matches!(message, AgentMessage::Event { .. });
        if fire_and_forget {
            let _ = tx.send(Inbound { message, reply: None }).await;
            continue;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx
            .send(Inbound {
                message,
                reply: Some(reply_tx),
            })
            .await
            .is_err()
        {
            return Ok(());
        }

        let reply = reply_rx
            .await
            .unwrap_or(OrchestratorMessage::Error {
                message: "dispatcher dropped the reply channel".to_string(),
            });
        write_message(&mut write_half, &reply).await?;
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
            info!(path = %self.socket_path.display(), "removed ipc socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn step_done_gets_a_reply_on_the_same_connection() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("run.sock");
        let server = IpcServer::bind(&socket_path).unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        tokio::spawn(async move {
            server.serve(tx).await;
        });

        tokio::spawn(async move {
            let inbound = rx.recv().await.unwrap();
            assert!(matches!(inbound.message, AgentMessage::StepDone { .. }));
            if let Some(reply) = inbound.reply {
                let _ = reply.send(OrchestratorMessage::Ok);
            }
        });

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        let msg = AgentMessage::StepDone {
            workflow: "w".into(),
            agent: "a".into(),
            step: "s".into(),
            outputs: HashMap::new(),
        };
        let mut encoded = serde_json::to_string(&msg).unwrap();
        encoded.push('\n');
        stream.write_all(encoded.as_bytes()).await.unwrap();

        let (read_half, _write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let reply: OrchestratorMessage = read_message(&mut reader).await.unwrap();
        assert_eq!(reply, OrchestratorMessage::Ok);
    }

    #[tokio::test]
    async fn event_messages_get_no_reply() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("run.sock");
        let server = IpcServer::bind(&socket_path).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            server.serve(tx).await;
        });

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        let msg = AgentMessage::Event {
            event_type: "heartbeat".into(),
            data: serde_json::Value::Null,
            agent: "a".into(),
            workflow: "w".into(),
        };
        let mut encoded = serde_json::to_string(&msg).unwrap();
        encoded.push('\n');
        stream.write_all(encoded.as_bytes()).await.unwrap();

        let inbound = rx.recv().await.unwrap();
        assert!(inbound.reply.is_none());
    }
}
