//! Newline-delimited JSON spoken between the supervisor and the agent child.
//!
//! The agent writes [`AgentMessage`]s to stdout and reads
//! [`SupervisorMessage`]s from stdin; its logs go to stderr.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentMessage {
    Status { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SupervisorMessage {
    Stop,
}

pub type StatusSender = mpsc::UnboundedSender<AgentMessage>;
pub type StatusReceiver = mpsc::UnboundedReceiver<AgentMessage>;

pub fn status_channel() -> (StatusSender, StatusReceiver) {
    mpsc::unbounded_channel()
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Drains the status channel into `writer`, one JSON object per line.
pub async fn forward_messages<W>(mut rx: StatusReceiver, mut writer: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let line = encode_line(&message).map_err(std::io::Error::other)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Eof,
}

/// Reads supervisor messages until a stop request or end of input.
/// Lines that are not valid messages are logged and skipped.
pub async fn wait_for_stop<R>(reader: R) -> std::io::Result<StopReason>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SupervisorMessage>(&line) {
            Ok(SupervisorMessage::Stop) => return Ok(StopReason::Requested),
            Err(e) => warn!("Ignoring unrecognised supervisor message {:?}: {}", line, e),
        }
    }
    debug!("Supervisor input closed");
    Ok(StopReason::Eof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_message_wire_format() {
        let line = encode_line(&AgentMessage::Status {
            message: "Username: x".to_string(),
        })
        .unwrap();
        assert_eq!(line, "{\"type\":\"status\",\"message\":\"Username: x\"}\n");
    }

    #[test]
    fn stop_message_wire_format() {
        assert_eq!(encode_line(&SupervisorMessage::Stop).unwrap(), "{\"type\":\"stop\"}\n");
        let parsed: SupervisorMessage = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(parsed, SupervisorMessage::Stop);
    }

    #[tokio::test]
    async fn forwards_each_status_as_a_line() {
        let (tx, rx) = status_channel();
        tx.send(AgentMessage::Status { message: "one".to_string() }).unwrap();
        tx.send(AgentMessage::Status { message: "two".to_string() }).unwrap();
        drop(tx);

        let mut out = Vec::new();
        forward_messages(rx, &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"two\""));
    }

    #[tokio::test]
    async fn stop_request_ends_wait() {
        let input: &[u8] = b"garbage\n\n{\"type\":\"stop\"}\n{\"type\":\"stop\"}\n";
        assert_eq!(wait_for_stop(input).await.unwrap(), StopReason::Requested);
    }

    #[tokio::test]
    async fn closed_input_reports_eof() {
        let input: &[u8] = b"{\"type\":\"status\",\"message\":\"x\"}\n";
        assert_eq!(wait_for_stop(input).await.unwrap(), StopReason::Eof);
    }
}
