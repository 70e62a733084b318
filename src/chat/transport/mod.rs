//! Transport layer for chat connections.
//!
//! A [`Transport`] opens [`Link`]s; a link reports its connect outcome as its
//! first [`LinkEvent`] and then carries JSON [`Frame`]s in both directions.

mod memory;
mod tcp;

pub use memory::{MemoryRelay, MemoryTransport};
pub use tcp::{TcpLink, TcpTransport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chat::error::ChatError;

/// One named event on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// A frame with a `null` payload.
    pub fn bare(event: impl Into<String>) -> Self {
        Self::new(event, serde_json::Value::Null)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChatError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ChatError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Something that happened on a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    ConnectError(String),
    Frame(Frame),
    Disconnected,
}

/// Opens links to a relay.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Link>, ChatError>;
}

/// A bidirectional frame link.
///
/// `send` and `recv` may run concurrently from different tasks.
#[async_trait]
pub trait Link: Send + Sync {
    /// Send a frame. Only valid after `Connected` was reported.
    async fn send(&self, frame: Frame) -> Result<(), ChatError>;

    /// Next event, or `None` once the link has ended.
    async fn recv(&self) -> Option<LinkEvent>;

    /// Close the link.
    async fn close(&self) -> Result<(), ChatError>;
}

/// Helper to write a length-prefixed message asynchronously.
pub async fn write_length_prefixed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ChatError> {
    let len = u32::try_from(data.len())
        .map_err(|_| ChatError::TransportError(format!("Frame too large: {} bytes", data.len())))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Helper to read a length-prefixed message asynchronously.
pub async fn read_length_prefixed<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Vec<u8>, ChatError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > max_len {
        return Err(ChatError::TransportError(format!(
            "Frame too large: {} bytes (max {})",
            len, max_len
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}
