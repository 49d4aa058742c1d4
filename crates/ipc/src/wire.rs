// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Newline-delimited JSON framing: one message per line, UTF-8.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for a message")]
    Timeout,
}

/// Read one newline-delimited JSON message from `reader`.
pub async fn read_message<R, T>(reader: &mut BufReader<R>) -> Result<T, WireError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(WireError::ConnectionClosed);
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Write one message as a JSON line terminated by `\n`.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), WireError>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_string(message)?;
    encoded.push('\n');
    writer.write_all(encoded.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read with a bound on how long to wait for the line to arrive.
pub async fn read_message_timeout<R, T>(
    reader: &mut BufReader<R>,
    timeout: Duration,
) -> Result<T, WireError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    tokio::time::timeout(timeout, read_message(reader))
        .await
        .map_err(|_| WireError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentMessage, OrchestratorMessage};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn writes_and_reads_one_line_per_message() {
        let mut buf: Vec<u8> = Vec::new();
        write_message(&mut buf, &OrchestratorMessage::Ok).await.unwrap();
        write_message(
            &mut buf,
            &OrchestratorMessage::Error {
                message: "boom".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(buf.iter().filter(|&&b| b == b'\n').count(), 2);

        let mut reader = BufReader::new(buf.as_slice());
        let first: OrchestratorMessage = read_message(&mut reader).await.unwrap();
        assert_eq!(first, OrchestratorMessage::Ok);
        let second: OrchestratorMessage = read_message(&mut reader).await.unwrap();
        assert_eq!(
            second,
            OrchestratorMessage::Error {
                message: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn empty_stream_reports_connection_closed() {
        let mut reader = BufReader::new(&b""[..]);
        let err = read_message::<_, AgentMessage>(&mut reader).await.unwrap_err();
        assert!(matches!(err, WireError::ConnectionClosed));
    }
}
