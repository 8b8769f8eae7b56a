//! Transport seam between connection management and the wire
//!
//! Frames are a 4-byte big-endian length followed by one JSON-encoded
//! [`Message`].

use crate::protocol::Message;
use crate::types::NodeInfo;
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Opens connections to validator nodes
#[async_trait]
pub trait NodeTransport: Send + Sync + 'static {
    /// Dial `node`; the caller applies the dial timeout
    async fn connect(&self, node: &NodeInfo) -> Result<Box<dyn NodeConnection>>;
}

/// Live connection to one node
#[async_trait]
pub trait NodeConnection: Send + 'static {
    /// Send one message and wait for the node's answer
    async fn exchange(&mut self, message: &Message) -> Result<Message>;
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let body = message.encode()?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::Other(format!("Frame too large: {} bytes", body.len())));
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin + Send,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Other(format!("Frame too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Message::decode(&body)
}

/// Production transport over TCP
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    /// Create a TCP transport
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeTransport for TcpTransport {
    async fn connect(&self, node: &NodeInfo) -> Result<Box<dyn NodeConnection>> {
        let stream = TcpStream::connect(&node.address).await?;
        stream.set_nodelay(true)?;
        trace!(node = %node.name, address = %node.address, "TCP connection established");
        Ok(Box::new(TcpConnection { stream }))
    }
}

/// TCP connection carrying framed messages
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

#[async_trait]
impl NodeConnection for TcpConnection {
    async fn exchange(&mut self, message: &Message) -> Result<Message> {
        write_frame(&mut self.stream, message).await?;
        read_frame(&mut self.stream).await
    }
}
