use crate::network::protocol::Offer;
use crate::{QuickshareError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SessionState {
    Pending,
    Accepted,
    Transferring,
    Completed,
    Failed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Pending => write!(f, "Pending"),
            SessionState::Accepted => write!(f, "Accepted"),
            SessionState::Transferring => write!(f, "Transferring"),
            SessionState::Completed => write!(f, "Completed"),
            SessionState::Failed(msg) => write!(f, "Failed: {}", msg),
        }
    }
}

/// State machine transitions for a transfer session
impl SessionState {
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        match (self, next) {
            (SessionState::Pending, SessionState::Accepted) => true,
            (SessionState::Pending, SessionState::Failed(_)) => true,

            (SessionState::Accepted, SessionState::Transferring) => true,
            (SessionState::Accepted, SessionState::Failed(_)) => true,

            (SessionState::Transferring, SessionState::Completed) => true,
            (SessionState::Transferring, SessionState::Failed(_)) => true,

            // No transitions from terminal states
            (SessionState::Completed, _) => false,
            (SessionState::Failed(_), _) => false,

            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

/// Bookkeeping for one live send or receive. Touched only by the task
/// driving that transfer.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub id: Uuid,
    pub offer: Offer,
    pub direction: TransferDirection,
    state: SessionState,
    bytes_transferred: u64,
    chunks_transferred: u64,
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
}

impl TransferSession {
    pub fn new(offer: Offer, direction: TransferDirection) -> Self {
        Self {
            id: offer.transfer_id(),
            offer,
            direction,
            state: SessionState::Pending,
            bytes_transferred: 0,
            chunks_transferred: 0,
            started_at: SystemTime::now(),
            finished_at: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn chunks_transferred(&self) -> u64 {
        self.chunks_transferred
    }

    /// Index the next chunk must carry.
    pub fn next_chunk_index(&self) -> u64 {
        self.chunks_transferred
    }

    pub fn is_last_chunk_done(&self) -> bool {
        self.chunks_transferred >= self.offer.total_chunks()
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(QuickshareError::Transfer(format!(
                "Session {}: illegal transition {} -> {}",
                self.id, self.state, next
            )));
        }
        if next.is_terminal() {
            self.finished_at = Some(SystemTime::now());
        }
        self.state = next;
        Ok(())
    }

    pub fn accept(&mut self) -> Result<()> {
        self.transition(SessionState::Accepted)
    }

    pub fn begin_transfer(&mut self) -> Result<()> {
        self.transition(SessionState::Transferring)
    }

    pub fn record_chunk(&mut self, bytes: usize) -> Result<()> {
        if self.state != SessionState::Transferring {
            return Err(QuickshareError::Transfer(format!(
                "Session {} is not transferring ({})",
                self.id, self.state
            )));
        }
        self.bytes_transferred += bytes as u64;
        self.chunks_transferred += 1;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(SessionState::Completed)
    }

    /// Moves to `Failed` unless the session already reached a terminal state.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed(reason.into());
            self.finished_at = Some(SystemTime::now());
        }
    }

    pub fn progress_percent(&self) -> f32 {
        if self.offer.total_size() == 0 {
            return 100.0;
        }
        (self.bytes_transferred as f32 / self.offer.total_size() as f32) * 100.0
    }
}
