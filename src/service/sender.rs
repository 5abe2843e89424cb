use crate::network::connection::ControlConnection;
use crate::network::control::send_control_offer;
use crate::network::protocol::{Chunk, ControlMessage, Offer};
use crate::service::session::{TransferDirection, TransferSession};
use crate::{utils, QuickshareError, Result};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a finished send.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub transfer_id: Uuid,
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    /// Digest of the bytes this side read and sent.
    pub sha256: String,
    /// Digest the receiver computed over what it wrote.
    pub receiver_sha256: String,
}

impl SendReport {
    pub fn digests_match(&self) -> bool {
        self.sha256 == self.receiver_sha256
    }
}

/// Send side of one transfer: a source file cut into `chunk_size` pieces.
#[derive(Debug, Clone)]
pub struct Sender {
    file_path: PathBuf,
    filename: String,
    chunk_size: usize,
    total_size: u64,
    handshake_timeout: Duration,
}

impl Sender {
    pub fn new(file_path: impl Into<PathBuf>, chunk_size: usize) -> Result<Self> {
        let file_path = file_path.into();

        let metadata = std::fs::metadata(&file_path).map_err(|e| {
            QuickshareError::FileOperation(format!("Cannot read {:?}: {}", file_path, e))
        })?;
        if !metadata.is_file() {
            return Err(QuickshareError::FileOperation(format!(
                "{:?} is not a file",
                file_path
            )));
        }
        if chunk_size == 0 {
            return Err(QuickshareError::Transfer(
                "Chunk size must be greater than zero".to_string(),
            ));
        }

        let filename = file_path
            .file_name()
            .ok_or_else(|| QuickshareError::FileOperation("Invalid file name".to_string()))?
            .to_string_lossy()
            .to_string();

        Ok(Self {
            file_path,
            filename,
            chunk_size,
            total_size: metadata.len(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    /// Bound on how long the default handshake waits for accept/reject.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn offer(&self) -> Result<Offer> {
        Offer::new(self.filename.clone(), self.total_size, self.chunk_size)
    }

    /// Send using the standard control handshake.
    pub async fn send_to<P>(&self, host: &str, port: u16, progress: P) -> Result<SendReport>
    where
        P: FnMut(u64, usize),
    {
        let timeout = self.handshake_timeout;
        self.send(
            host,
            port,
            move |host, port, offer| async move {
                send_control_offer(&host, port, &offer, timeout).await
            },
            progress,
        )
        .await
    }

    /// Negotiate through `handshake`, then stream the file chunk by chunk.
    ///
    /// `progress(index, bytes_in_chunk)` runs on this task right after each
    /// chunk is written, so it should return quickly.
    pub async fn send<H, Fut, P>(
        &self,
        host: &str,
        port: u16,
        handshake: H,
        mut progress: P,
    ) -> Result<SendReport>
    where
        H: FnOnce(String, u16, Offer) -> Fut,
        Fut: Future<Output = Result<ControlConnection>>,
        P: FnMut(u64, usize),
    {
        let offer = self.offer()?;
        let mut session = TransferSession::new(offer.clone(), TransferDirection::Outgoing);

        info!(
            "Offering {} ({}) to {}:{} as transfer {}",
            self.filename,
            utils::format_file_size(self.total_size),
            host,
            port,
            session.id
        );

        let mut conn = match handshake(host.to_string(), port, offer).await {
            Ok(conn) => conn,
            Err(e) => {
                session.fail(e.to_string());
                return Err(e);
            }
        };
        session.accept()?;

        match self.stream_chunks(&mut session, &mut conn, &mut progress).await {
            Ok(report) => {
                session.complete()?;
                conn.shutdown().await;
                info!(
                    "Transfer {} sent: {} in {} chunks",
                    report.transfer_id,
                    utils::format_file_size(report.bytes_sent),
                    report.chunks_sent
                );
                Ok(report)
            }
            Err(e) => {
                session.fail(e.to_string());
                warn!("Transfer {} failed: {}", session.id, e);
                // Best effort; the peer may already be gone.
                let _ = conn
                    .write_message(&ControlMessage::TransferError {
                        reason: e.to_string(),
                    })
                    .await;
                conn.shutdown().await;
                Err(e)
            }
        }
    }

    async fn stream_chunks<P>(
        &self,
        session: &mut TransferSession,
        conn: &mut ControlConnection,
        progress: &mut P,
    ) -> Result<SendReport>
    where
        P: FnMut(u64, usize),
    {
        session.begin_transfer()?;

        let mut file = File::open(&self.file_path).await.map_err(|e| {
            QuickshareError::FileOperation(format!("Failed to open {:?}: {}", self.file_path, e))
        })?;
        let mut hasher = Sha256::new();

        while !session.is_last_chunk_done() {
            let index = session.next_chunk_index();
            let expected_len = session.offer.expected_chunk_len(index).ok_or_else(|| {
                QuickshareError::Transfer(format!("No chunk {} in offer", index))
            })?;

            let payload = read_chunk(&mut file, expected_len).await.map_err(|e| {
                QuickshareError::FileOperation(format!(
                    "Failed to read chunk {} of {:?}: {}",
                    index, self.file_path, e
                ))
            })?;
            if payload.len() != expected_len {
                return Err(QuickshareError::FileOperation(format!(
                    "{:?} shrank during transfer (chunk {} has {} of {} bytes)",
                    self.file_path,
                    index,
                    payload.len(),
                    expected_len
                )));
            }

            hasher.update(&payload);
            let len = payload.len();
            conn.write_message(&ControlMessage::Chunk(Chunk { index, payload }))
                .await?;
            session.record_chunk(len)?;
            progress(index, len);

            debug!(
                "Transfer {}: sent chunk {}/{} ({} bytes)",
                session.id,
                index + 1,
                session.offer.total_chunks(),
                len
            );
        }

        let sha256 = utils::hex_digest(hasher);

        match conn.read_message().await? {
            ControlMessage::TransferComplete {
                bytes_received,
                sha256: receiver_sha256,
            } => {
                if bytes_received != session.bytes_transferred() {
                    return Err(QuickshareError::Transfer(format!(
                        "Receiver stored {} bytes, sent {}",
                        bytes_received,
                        session.bytes_transferred()
                    )));
                }
                Ok(SendReport {
                    transfer_id: session.id,
                    bytes_sent: session.bytes_transferred(),
                    chunks_sent: session.chunks_transferred(),
                    sha256,
                    receiver_sha256,
                })
            }
            ControlMessage::TransferError { reason } => Err(QuickshareError::Transfer(format!(
                "Receiver failed: {}",
                reason
            ))),
            other => Err(QuickshareError::Protocol(format!(
                "Expected TransferComplete, got {}",
                other.kind()
            ))),
        }
    }
}

/// Fill up to `len` bytes, stopping early only at end of file.
async fn read_chunk(file: &mut File, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
