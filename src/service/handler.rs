use crate::network::control::{OfferDecision, OfferHandler};
use crate::network::protocol::Offer;
use crate::service::receiver::{Receiver, TransferOutcome, TransferStarted};
use crate::utils;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

type StartCallback = Arc<dyn Fn(&TransferStarted) + Send + Sync>;
type CompleteCallback = Arc<dyn Fn(&TransferOutcome) + Send + Sync>;
type Reserved = Arc<Mutex<HashSet<PathBuf>>>;

/// Holds a destination name while a receiver may still write to it.
struct Reservation {
    path: PathBuf,
    reserved: Reserved,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.remove(&self.path);
        debug!("Released destination {:?}", self.path);
    }
}

/// Accepts every offer into one directory.
///
/// Offered names are reduced to a single safe component and never overwrite an
/// existing file or a name another running transfer holds: a clash gets a
/// ` (n)` suffix instead. Picking the name checks the directory synchronously.
#[derive(Clone)]
pub struct DirectoryHandler {
    dir: PathBuf,
    max_size: Option<u64>,
    on_start: Option<StartCallback>,
    on_complete: Option<CompleteCallback>,
    reserved: Reserved,
}

impl DirectoryHandler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_size: None,
            on_start: None,
            on_complete: None,
            reserved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Refuse offers larger than `bytes`.
    pub fn max_size(mut self, bytes: u64) -> Self {
        self.max_size = Some(bytes);
        self
    }

    pub fn on_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TransferStarted) + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(callback));
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TransferOutcome) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn reserve(&self, safe_name: &str) -> Reservation {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        let path = utils::unique_path_where(&self.dir, safe_name, |candidate| {
            reserved.contains(candidate) || candidate.exists()
        });
        reserved.insert(path.clone());
        Reservation {
            path,
            reserved: self.reserved.clone(),
        }
    }
}

impl OfferHandler for DirectoryHandler {
    fn handle_offer(&self, offer: &Offer) -> OfferDecision {
        if let Some(limit) = self.max_size {
            if offer.total_size() > limit {
                return OfferDecision::Reject(format!(
                    "File too large: {} exceeds limit of {}",
                    utils::format_file_size(offer.total_size()),
                    utils::format_file_size(limit)
                ));
            }
        }

        let safe_name = utils::sanitize_filename(offer.filename());
        let reservation = self.reserve(&safe_name);
        let Some(file_name) = reservation.path.file_name().map(PathBuf::from) else {
            return OfferDecision::Reject("Unusable file name".to_string());
        };

        info!("Accepting {} as {:?}", offer.filename(), reservation.path);

        let mut receiver = Receiver::new(file_name, offer.chunk_size(), offer.total_chunks())
            .out_dir(self.dir.clone());
        if let Some(callback) = self.on_start.clone() {
            receiver = receiver.on_start(move |started| callback(started));
        }

        // The name stays reserved until the outcome is reported, or until the
        // receiver is dropped without ever running.
        let on_complete = self.on_complete.clone();
        receiver = receiver.on_complete(move |outcome| {
            if let Some(callback) = on_complete {
                callback(outcome);
            }
            drop(reservation);
        });
        OfferDecision::Accept(receiver)
    }
}
