use crate::network::protocol::{ControlMessage, MAX_CHUNK_SIZE};
use crate::{QuickshareError, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// Upper bound on a single frame: one full chunk plus envelope.
const MAX_FRAME_LEN: usize = MAX_CHUNK_SIZE + 4096;

/// One control channel stream. Frames are a 4-byte big-endian length followed
/// by a bincode encoded [`ControlMessage`].
pub struct ControlConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl ControlConnection {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        // Chunk frames are written one at a time; don't let Nagle hold them back.
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer_addr })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn write_message(&mut self, message: &ControlMessage) -> Result<()> {
        let message_data = bincode::serialize(message)?;
        if message_data.len() > MAX_FRAME_LEN {
            return Err(QuickshareError::Protocol(format!(
                "Outgoing {} frame too large ({} bytes)",
                message.kind(),
                message_data.len()
            )));
        }
        let message_len = message_data.len() as u32;

        self.stream.write_all(&message_len.to_be_bytes()).await?;
        self.stream.write_all(&message_data).await?;
        self.stream.flush().await?;

        trace!(
            "Sent {} frame ({} bytes) to {}",
            message.kind(),
            message_data.len(),
            self.peer_addr
        );
        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<ControlMessage> {
        let mut len_bytes = [0u8; 4];
        self.stream.read_exact(&mut len_bytes).await?;
        let message_len = u32::from_be_bytes(len_bytes) as usize;

        if message_len > MAX_FRAME_LEN {
            return Err(QuickshareError::Protocol(format!(
                "Incoming frame too large ({} bytes)",
                message_len
            )));
        }

        let mut message_data = vec![0u8; message_len];
        self.stream.read_exact(&mut message_data).await?;

        let message: ControlMessage = bincode::deserialize(&message_data)?;
        trace!(
            "Received {} frame ({} bytes) from {}",
            message.kind(),
            message_len,
            self.peer_addr
        );
        Ok(message)
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
