use crate::{utils, QuickshareError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest chunk size a peer may offer.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Presence datagram broadcast by the announcer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Announcement {
    pub name: String,
    /// Control channel port of the announcing node.
    pub port: u16,
    /// Emission time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Announcement {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            timestamp: utils::current_timestamp_millis(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let announcement: Announcement = serde_json::from_slice(data)?;
        if announcement.name.trim().is_empty() {
            return Err(QuickshareError::Discovery(
                "Announcement without a name".to_string(),
            ));
        }
        if announcement.port == 0 {
            return Err(QuickshareError::Discovery(
                "Announcement without a control port".to_string(),
            ));
        }
        Ok(announcement)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    Sha256,
}

/// A proposed transfer. First message on every control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    transfer_id: Uuid,
    filename: String,
    total_size: u64,
    total_chunks: u64,
    chunk_size: usize,
    checksum: ChecksumAlgorithm,
}

impl Offer {
    pub fn new(filename: impl Into<String>, total_size: u64, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(QuickshareError::Protocol(
                "Chunk size must be greater than zero".to_string(),
            ));
        }

        let offer = Self {
            transfer_id: Uuid::new_v4(),
            filename: filename.into(),
            total_size,
            total_chunks: chunk_count(total_size, chunk_size),
            chunk_size,
            checksum: ChecksumAlgorithm::Sha256,
        };
        offer.validate()?;
        Ok(offer)
    }

    /// Checks an offer received off the wire before anything acts on it.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(QuickshareError::Protocol(format!(
                "Unsupported chunk size {}",
                self.chunk_size
            )));
        }

        if self.total_chunks != chunk_count(self.total_size, self.chunk_size) {
            return Err(QuickshareError::Protocol(format!(
                "Offer declares {} chunks for {} bytes at chunk size {}",
                self.total_chunks, self.total_size, self.chunk_size
            )));
        }

        let name = self.filename.as_str();
        if name.trim().is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name == "."
            || name == ".."
            || name.contains('\0')
        {
            return Err(QuickshareError::Protocol(format!(
                "Invalid filename in offer: {:?}",
                self.filename
            )));
        }

        Ok(())
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn checksum(&self) -> ChecksumAlgorithm {
        self.checksum
    }

    /// Exact payload length chunk `index` must carry.
    pub fn expected_chunk_len(&self, index: u64) -> Option<usize> {
        if index >= self.total_chunks {
            return None;
        }
        let start = index * self.chunk_size as u64;
        Some((self.total_size - start).min(self.chunk_size as u64) as usize)
    }
}

pub fn chunk_count(total_size: u64, chunk_size: usize) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size as u64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u64,
    pub payload: Vec<u8>,
}

/// Everything that travels over a control connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    Offer(Offer),
    OfferResponse {
        accepted: bool,
        reason: Option<String>,
    },
    Chunk(Chunk),
    TransferComplete {
        bytes_received: u64,
        sha256: String,
    },
    TransferError {
        reason: String,
    },
}

impl ControlMessage {
    pub fn accept() -> Self {
        ControlMessage::OfferResponse {
            accepted: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        ControlMessage::OfferResponse {
            accepted: false,
            reason: Some(reason.into()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Offer(_) => "Offer",
            ControlMessage::OfferResponse { .. } => "OfferResponse",
            ControlMessage::Chunk(_) => "Chunk",
            ControlMessage::TransferComplete { .. } => "TransferComplete",
            ControlMessage::TransferError { .. } => "TransferError",
        }
    }
}
