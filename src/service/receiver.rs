use crate::network::connection::ControlConnection;
use crate::network::protocol::{ControlMessage, Offer};
use crate::service::session::{TransferDirection, TransferSession};
use crate::{utils, QuickshareError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Passed to `on_start` before the first byte is written.
#[derive(Debug, Clone, Serialize)]
pub struct TransferStarted {
    pub transfer_id: Uuid,
    pub filename: String,
    pub size: u64,
    pub total_chunks: u64,
    pub save_path: PathBuf,
}

/// Passed to `on_complete` exactly once per accepted offer.
///
/// `ok` means the declared number of bytes arrived without I/O error. The
/// digest is reported as computed; comparing it against a trusted value is up
/// to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub transfer_id: Uuid,
    pub filename: String,
    pub save_path: PathBuf,
    pub bytes_transferred: u64,
    pub sha256: Option<String>,
    pub ok: bool,
    pub error: Option<String>,
}

pub type StartHook = Box<dyn FnOnce(&TransferStarted) + Send + 'static>;
pub type CompleteHook = Box<dyn FnOnce(&TransferOutcome) + Send + 'static>;

/// Receive side of one transfer. Built by an offer handler, which decides
/// where the file goes; the receiver never picks a destination itself.
pub struct Receiver {
    save_path: PathBuf,
    chunk_size: usize,
    total_chunks: u64,
    out_dir: Option<PathBuf>,
    on_start: Option<StartHook>,
    on_complete: Option<CompleteHook>,
    staging_created: bool,
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("save_path", &self.save_path)
            .field("chunk_size", &self.chunk_size)
            .field("total_chunks", &self.total_chunks)
            .field("out_dir", &self.out_dir)
            .finish_non_exhaustive()
    }
}

impl Receiver {
    pub fn new(save_path: impl Into<PathBuf>, chunk_size: usize, total_chunks: u64) -> Self {
        Self {
            save_path: save_path.into(),
            chunk_size,
            total_chunks,
            out_dir: None,
            on_start: None,
            on_complete: None,
            staging_created: false,
        }
    }

    /// Anchor the destination inside `dir`: relative save paths are joined to
    /// it and paths escaping it are refused.
    pub fn out_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(dir.into());
        self
    }

    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&TransferStarted) + Send + 'static,
    {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&TransferOutcome) + Send + 'static,
    {
        self.on_complete = Some(Box::new(hook));
        self
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// Check the receiver matches the offer and make its destination ready.
    /// Runs before the offer is accepted, so a failure here becomes a rejection.
    pub async fn prepare(&mut self, offer: &Offer) -> Result<()> {
        if self.chunk_size != offer.chunk_size() {
            return Err(QuickshareError::Transfer(format!(
                "Receiver expects chunk size {}, offer uses {}",
                self.chunk_size,
                offer.chunk_size()
            )));
        }
        if self.total_chunks != offer.total_chunks() {
            return Err(QuickshareError::Transfer(format!(
                "Receiver expects {} chunks, offer declares {}",
                self.total_chunks,
                offer.total_chunks()
            )));
        }

        let save_path = self.resolve_save_path()?;
        if let Some(ref dir) = self.out_dir {
            fs::create_dir_all(dir).await.map_err(|e| {
                QuickshareError::FileOperation(format!(
                    "Failed to create output directory {:?}: {}",
                    dir, e
                ))
            })?;
        }
        if let Some(parent) = save_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                QuickshareError::FileOperation(format!(
                    "Failed to create destination directory {:?}: {}",
                    parent, e
                ))
            })?;
        }
        if fs::metadata(&save_path).await.is_ok_and(|m| m.is_dir()) {
            return Err(QuickshareError::FileOperation(format!(
                "Destination {:?} is a directory",
                save_path
            )));
        }

        self.save_path = save_path;
        Ok(())
    }

    fn resolve_save_path(&self) -> Result<PathBuf> {
        if self.save_path.file_name().is_none() {
            return Err(QuickshareError::FileOperation(format!(
                "Destination {:?} has no file name",
                self.save_path
            )));
        }

        let Some(ref dir) = self.out_dir else {
            return Ok(self.save_path.clone());
        };

        let relative = if self.save_path.is_absolute() {
            self.save_path.strip_prefix(dir).map_err(|_| {
                QuickshareError::FileOperation(format!(
                    "Destination {:?} is outside {:?}",
                    self.save_path, dir
                ))
            })?
        } else {
            self.save_path.as_path()
        };

        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(QuickshareError::FileOperation(format!(
                "Destination {:?} escapes {:?}",
                self.save_path, dir
            )));
        }

        Ok(dir.join(relative))
    }

    /// Prepare, accept and receive in one go, for callers that already hold
    /// an accepted connection.
    pub async fn handle_offer_and_receive(
        mut self,
        offer: Offer,
        conn: &mut ControlConnection,
    ) -> TransferOutcome {
        let mut session = TransferSession::new(offer, TransferDirection::Incoming);
        let prepared = match self.prepare(&session.offer).await {
            Ok(()) => session.accept(),
            Err(e) => Err(e),
        };

        if let Err(e) = prepared {
            session.fail(e.to_string());
            let outcome = self.outcome(&session, None, Some(e.to_string()));
            self.fire_complete(&outcome);
            return outcome;
        }

        self.receive(session, conn).await
    }

    /// Drive an accepted session to completion over `conn`.
    ///
    /// Always fires `on_complete` exactly once, on success and on failure.
    pub async fn receive(
        mut self,
        mut session: TransferSession,
        conn: &mut ControlConnection,
    ) -> TransferOutcome {
        let staging_path = staging_path_for(&self.save_path, session.id);

        let result = self.receive_into(&mut session, conn, &staging_path).await;

        let outcome = match result {
            Ok(sha256) => match session.complete() {
                Ok(()) => {
                    info!(
                        "Transfer {} complete: {} ({}) saved to {:?}",
                        session.id,
                        session.offer.filename(),
                        utils::format_file_size(session.bytes_transferred()),
                        self.save_path
                    );
                    self.outcome(&session, Some(sha256), None)
                }
                Err(e) => {
                    session.fail(e.to_string());
                    self.outcome(&session, Some(sha256), Some(e.to_string()))
                }
            },
            Err(e) => {
                error!("Transfer {} failed: {}", session.id, e);
                session.fail(e.to_string());
                // Only ever remove a staging file this session created.
                if self.staging_created {
                    if let Err(remove_err) = fs::remove_file(&staging_path).await {
                        if remove_err.kind() != std::io::ErrorKind::NotFound {
                            warn!(
                                "Failed to remove partial file {:?}: {}",
                                staging_path, remove_err
                            );
                        }
                    }
                }
                self.outcome(&session, None, Some(e.to_string()))
            }
        };

        self.fire_complete(&outcome);
        outcome
    }

    /// Give up on an accepted session before any chunk was read.
    pub fn abort(mut self, mut session: TransferSession, reason: impl Into<String>) -> TransferOutcome {
        let reason = reason.into();
        warn!("Transfer {} aborted: {}", session.id, reason);
        session.fail(reason.clone());
        let outcome = self.outcome(&session, None, Some(reason));
        self.fire_complete(&outcome);
        outcome
    }

    async fn receive_into(
        &mut self,
        session: &mut TransferSession,
        conn: &mut ControlConnection,
        staging_path: &Path,
    ) -> Result<String> {
        session.begin_transfer()?;

        let started = TransferStarted {
            transfer_id: session.id,
            filename: session.offer.filename().to_string(),
            size: session.offer.total_size(),
            total_chunks: session.offer.total_chunks(),
            save_path: self.save_path.clone(),
        };
        if let Some(hook) = self.on_start.take() {
            hook(&started);
        }

        info!(
            "Receiving {} ({}, {} chunks) from {} into {:?}",
            started.filename,
            utils::format_file_size(started.size),
            started.total_chunks,
            conn.peer_addr(),
            self.save_path
        );

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(staging_path)
            .await
            .map_err(|e| {
                QuickshareError::FileOperation(format!(
                    "Failed to create {:?}: {}",
                    staging_path, e
                ))
            })?;
        self.staging_created = true;
        let mut writer = BufWriter::new(file);
        let mut hasher = Sha256::new();

        while !session.is_last_chunk_done() {
            let chunk = match conn.read_message().await? {
                ControlMessage::Chunk(chunk) => chunk,
                ControlMessage::TransferError { reason } => {
                    return Err(QuickshareError::Transfer(format!(
                        "Sender aborted: {}",
                        reason
                    )));
                }
                other => {
                    return Err(QuickshareError::Protocol(format!(
                        "Expected Chunk, got {}",
                        other.kind()
                    )));
                }
            };

            let expected_index = session.next_chunk_index();
            if chunk.index != expected_index {
                return Err(QuickshareError::Protocol(format!(
                    "Chunk {} arrived while expecting chunk {}",
                    chunk.index, expected_index
                )));
            }

            let expected_len = session
                .offer
                .expected_chunk_len(chunk.index)
                .ok_or_else(|| {
                    QuickshareError::Protocol(format!("Chunk {} beyond declared count", chunk.index))
                })?;
            if chunk.payload.len() != expected_len {
                return Err(QuickshareError::Protocol(format!(
                    "Chunk {} carries {} bytes, expected {}",
                    chunk.index,
                    chunk.payload.len(),
                    expected_len
                )));
            }

            writer.write_all(&chunk.payload).await.map_err(|e| {
                QuickshareError::FileOperation(format!("Failed to write chunk {}: {}", chunk.index, e))
            })?;
            hasher.update(&chunk.payload);
            session.record_chunk(chunk.payload.len())?;

            debug!(
                "Transfer {}: chunk {}/{} ({} bytes)",
                session.id,
                chunk.index + 1,
                session.offer.total_chunks(),
                chunk.payload.len()
            );
        }

        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;
        drop(file);

        if session.bytes_transferred() != session.offer.total_size() {
            return Err(QuickshareError::Transfer(format!(
                "Received {} bytes, offer declared {}",
                session.bytes_transferred(),
                session.offer.total_size()
            )));
        }

        fs::rename(staging_path, &self.save_path).await.map_err(|e| {
            QuickshareError::FileOperation(format!(
                "Failed to move {:?} into place: {}",
                staging_path, e
            ))
        })?;

        Ok(utils::hex_digest(hasher))
    }

    fn outcome(
        &self,
        session: &TransferSession,
        sha256: Option<String>,
        error: Option<String>,
    ) -> TransferOutcome {
        TransferOutcome {
            transfer_id: session.id,
            filename: session.offer.filename().to_string(),
            save_path: self.save_path.clone(),
            bytes_transferred: session.bytes_transferred(),
            ok: error.is_none(),
            sha256,
            error,
        }
    }

    fn fire_complete(&mut self, outcome: &TransferOutcome) {
        if let Some(hook) = self.on_complete.take() {
            hook(outcome);
        }
    }
}

/// `<name>.<transfer id>.part` next to the destination, private to one session.
fn staging_path_for(save_path: &Path, transfer_id: Uuid) -> PathBuf {
    let mut name = save_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.part", transfer_id));
    save_path.with_file_name(name)
}
