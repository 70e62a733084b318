//! TCP transport for chat connections.
//!
//! Frames travel as length-prefixed (u32 LE) JSON over a tokio `TcpStream`.
//! The connect attempt runs on the first `recv`, so its outcome arrives as a
//! regular link event.

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::chat::config::DEFAULT_MAX_FRAME_LEN;
use crate::chat::error::ChatError;
use crate::chat::transport::{
    read_length_prefixed, write_length_prefixed, Frame, Link, LinkEvent, Transport,
};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
    max_frame_len: usize,
}

impl TcpTransport {
    /// Create a transport for the relay at `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Set the largest frame accepted from the relay.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self) -> Result<Box<dyn Link>, ChatError> {
        Ok(Box::new(TcpLink::new(self.addr.clone(), self.max_frame_len)))
    }
}

enum ReadState {
    Pending,
    Open(BufReader<OwnedReadHalf>),
    Ended,
}

/// TCP link using tokio.
pub struct TcpLink {
    addr: String,
    max_frame_len: usize,
    reader: Mutex<ReadState>,
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
}

impl TcpLink {
    fn new(addr: String, max_frame_len: usize) -> Self {
        Self {
            addr,
            max_frame_len,
            reader: Mutex::new(ReadState::Pending),
            writer: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn send(&self, frame: Frame) -> Result<(), ChatError> {
        let data = frame.to_bytes()?;
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| ChatError::TransportError("Not connected".to_string()))?;
        write_length_prefixed(writer, &data).await
    }

    async fn recv(&self) -> Option<LinkEvent> {
        let mut state = self.reader.lock().await;

        loop {
            match &mut *state {
                ReadState::Pending => match TcpStream::connect(&self.addr).await {
                    Ok(stream) => {
                        let (read_half, write_half) = stream.into_split();
                        *self.writer.lock().await = Some(BufWriter::new(write_half));
                        *state = ReadState::Open(BufReader::new(read_half));
                        debug!(addr = %self.addr, "tcp link connected");
                        return Some(LinkEvent::Connected);
                    }
                    Err(e) => {
                        *state = ReadState::Ended;
                        return Some(LinkEvent::ConnectError(format!(
                            "Failed to connect to {}: {}",
                            self.addr, e
                        )));
                    }
                },
                ReadState::Open(reader) => {
                    match read_length_prefixed(reader, self.max_frame_len).await {
                        Ok(data) => match Frame::from_bytes(&data) {
                            Ok(frame) => return Some(LinkEvent::Frame(frame)),
                            Err(e) => {
                                warn!(error = %e, "skipping malformed frame");
                                continue;
                            }
                        },
                        Err(e) => {
                            debug!(error = %e, "tcp link ended");
                            *state = ReadState::Ended;
                            return Some(LinkEvent::Disconnected);
                        }
                    }
                }
                ReadState::Ended => return None,
            }
        }
    }

    async fn close(&self) -> Result<(), ChatError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.flush().await?;
            writer.shutdown().await?;
        }
        Ok(())
    }
}
