//! The chat message type and its newline-delimited JSON encoding.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// A single chat message as it travels through the hub.
///
/// Messages are never mutated once handed to the hub; fan-out shares one
/// allocation between all recipients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub body: String,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
        }
    }

    /// Encodes the message as one JSON object terminated by `\n`.
    pub fn to_frame(&self) -> io::Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(self).map_err(invalid_data)?;
        frame.push(b'\n');
        Ok(frame)
    }

    /// Decodes one frame. Whitespace-only frames carry no message.
    pub fn from_frame(frame: &[u8]) -> io::Result<Option<Self>> {
        if frame.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(frame).map(Some).map_err(invalid_data)
    }
}

/// Reads the next message, passing over blank lines.
///
/// `Ok(None)` means the reader hit end-of-stream. A line that is not a
/// message yields [`io::ErrorKind::InvalidData`].
pub async fn read_message<R>(reader: &mut R) -> io::Result<Option<ChatMessage>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    while reader.read_until(b'\n', &mut frame).await? > 0 {
        if let Some(message) = ChatMessage::from_frame(&frame)? {
            return Ok(Some(message));
        }
        frame.clear();
    }
    Ok(None)
}

/// Writes one frame and flushes it.
pub async fn write_message<W>(writer: &mut W, message: &ChatMessage) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.to_frame()?).await?;
    writer.flush().await
}

fn invalid_data(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
