//! Newline-delimited framing for stdio backends.
//!
//! Each message is a single line of compact JSON terminated by `\n`.
//! Blank lines are ignored; undecodable lines are logged and skipped so one
//! bad write from a backend does not end the whole channel.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::protocol::JsonRpcMessage;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Write one message and flush.
pub async fn write_message<W>(writer: &mut W, msg: &JsonRpcMessage) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = msg.to_line()?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads messages from a line-oriented byte stream.
pub struct MessageReader<R> {
    lines: Lines<BufReader<R>>,
    label: String,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, label: impl Into<String>) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            label: label.into(),
        }
    }

    /// Next decoded message, or `Ok(None)` at end of stream.
    pub async fn next_message(&mut self) -> Result<Option<JsonRpcMessage>, std::io::Error> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match JsonRpcMessage::parse(trimmed) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => {
                    tracing::warn!(
                        backend = %self.label,
                        error = %e,
                        line = %truncate(trimmed, 200),
                        "Skipping undecodable line from backend"
                    );
                }
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
