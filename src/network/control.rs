use crate::network::connection::ControlConnection;
use crate::network::protocol::{ControlMessage, Offer};
use crate::service::receiver::Receiver;
use crate::service::session::{TransferDirection, TransferSession};
use crate::{QuickshareError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const STOP_GRACE: Duration = Duration::from_secs(2);
/// An inbound connection must present its offer within this time.
const OFFER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// What an offer handler decided.
pub enum OfferDecision {
    Accept(Receiver),
    Reject(String),
}

/// Decides, per inbound offer, whether to accept it and where the bytes go.
///
/// Called on the connection's async task before anything is acknowledged.
/// It must not block for long: small synchronous filesystem lookups (such as
/// checking whether a destination name exists) are fine, slow I/O is not.
pub trait OfferHandler: Send + Sync + 'static {
    fn handle_offer(&self, offer: &Offer) -> OfferDecision;
}

impl<F> OfferHandler for F
where
    F: Fn(&Offer) -> OfferDecision + Send + Sync + 'static,
{
    fn handle_offer(&self, offer: &Offer) -> OfferDecision {
        self(offer)
    }
}

/// Accepts control connections and runs each inbound transfer on its own task.
pub struct ControlServer {
    bind_addr: SocketAddr,
    handler: Arc<dyn OfferHandler>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    pub fn new(bind_addr: SocketAddr, handler: impl OfferHandler) -> Self {
        Self {
            bind_addr,
            handler: Arc::new(handler),
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Port actually bound, available after `start()`.
    pub fn port(&self) -> Option<u16> {
        self.local_addr.map(|addr| addr.port())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(QuickshareError::AlreadyRunning("control server"));
        }

        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handler = self.handler.clone();

        info!("Control server listening on {}", local_addr);

        self.handle = Some(tokio::spawn(async move {
            Self::run_accept_loop(listener, handler, shutdown_rx).await;
        }));
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    async fn run_accept_loop(
        listener: TcpListener,
        handler: Arc<dyn OfferHandler>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Accepted control connection from {}", addr);
                        let handler = handler.clone();
                        // Connections outlive the accept loop; stop() does not cut them off.
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(stream, handler).await {
                                warn!("Control connection from {} ended with error: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept control connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        debug!("Control server accept loop stopped");
    }

    async fn handle_connection(stream: TcpStream, handler: Arc<dyn OfferHandler>) -> Result<()> {
        let mut conn = ControlConnection::new(stream)?;

        let offer = match tokio::time::timeout(OFFER_READ_TIMEOUT, conn.read_message()).await {
            Ok(Ok(ControlMessage::Offer(offer))) => offer,
            Ok(Ok(other)) => {
                let reason = format!("Expected Offer, got {}", other.kind());
                let _ = conn.write_message(&ControlMessage::reject(reason.as_str())).await;
                return Err(QuickshareError::Protocol(reason));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(QuickshareError::Protocol(format!(
                    "No offer within {:?}",
                    OFFER_READ_TIMEOUT
                )))
            }
        };

        if let Err(e) = offer.validate() {
            warn!("Rejecting invalid offer from {}: {}", conn.peer_addr(), e);
            conn.write_message(&ControlMessage::reject(e.to_string())).await?;
            return Ok(());
        }

        info!(
            "Offer {} from {}: {} ({} bytes, {} chunks)",
            offer.transfer_id(),
            conn.peer_addr(),
            offer.filename(),
            offer.total_size(),
            offer.total_chunks()
        );

        let mut session = TransferSession::new(offer, TransferDirection::Incoming);

        let mut receiver = match handler.handle_offer(&session.offer) {
            OfferDecision::Accept(receiver) => receiver,
            OfferDecision::Reject(reason) => {
                info!("Offer {} rejected: {}", session.id, reason);
                session.fail(reason.clone());
                conn.write_message(&ControlMessage::reject(reason)).await?;
                conn.shutdown().await;
                return Ok(());
            }
        };

        if let Err(e) = receiver.prepare(&session.offer).await {
            warn!("Offer {} rejected, destination not usable: {}", session.id, e);
            session.fail(e.to_string());
            conn.write_message(&ControlMessage::reject(e.to_string())).await?;
            conn.shutdown().await;
            return Ok(());
        }

        session.accept()?;
        if let Err(e) = conn.write_message(&ControlMessage::accept()).await {
            receiver.abort(session, format!("Failed to acknowledge offer: {}", e));
            return Err(e);
        }

        let outcome = receiver.receive(session, &mut conn).await;

        let reply = if outcome.ok {
            ControlMessage::TransferComplete {
                bytes_received: outcome.bytes_transferred,
                sha256: outcome.sha256.clone().unwrap_or_default(),
            }
        } else {
            ControlMessage::TransferError {
                reason: outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "Transfer failed".to_string()),
            }
        };
        if let Err(e) = conn.write_message(&reply).await {
            debug!("Could not report outcome of {}: {}", outcome.transfer_id, e);
        }
        conn.shutdown().await;
        Ok(())
    }

    /// Stops accepting connections and releases the listening socket.
    /// Transfers already running carry on. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("Control server did not stop within {:?}, aborting", STOP_GRACE);
                handle.abort();
            }
            info!("Control server stopped");
        }
        self.local_addr = None;
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Client half of the handshake: connect, send the offer, wait for the verdict.
///
/// Returns the connection ready for chunk data once the peer accepts. The
/// whole exchange, connect included, is bounded by `timeout`.
pub async fn send_control_offer(
    host: &str,
    port: u16,
    offer: &Offer,
    timeout: Duration,
) -> Result<ControlConnection> {
    let handshake = async {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| QuickshareError::Connect {
                addr: format!("{}:{}", host, port),
                source: e,
            })?;
        let mut conn = ControlConnection::new(stream)?;

        conn.write_message(&ControlMessage::Offer(offer.clone()))
            .await?;

        match conn.read_message().await? {
            ControlMessage::OfferResponse { accepted: true, .. } => {
                info!("Offer {} accepted by {}", offer.transfer_id(), conn.peer_addr());
                Ok(conn)
            }
            ControlMessage::OfferResponse {
                accepted: false,
                reason,
            } => Err(QuickshareError::Rejected(
                reason.unwrap_or_else(|| "no reason given".to_string()),
            )),
            other => Err(QuickshareError::Protocol(format!(
                "Expected OfferResponse, got {}",
                other.kind()
            ))),
        }
    };

    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| QuickshareError::HandshakeTimeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::Chunk;
    use crate::service::handler::DirectoryHandler;
    use crate::service::receiver::TransferOutcome;
    use crate::service::sender::Sender;
    use crate::utils;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    type Outcomes = Arc<Mutex<Vec<TransferOutcome>>>;

    /// Handler that saves every offer under `dir` and records outcomes.
    fn recording_handler(dir: PathBuf) -> (impl OfferHandler, Outcomes) {
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let handler = move |offer: &Offer| {
            let sink = sink.clone();
            OfferDecision::Accept(
                Receiver::new(offer.filename(), offer.chunk_size(), offer.total_chunks())
                    .out_dir(dir.clone())
                    .on_complete(move |outcome| sink.lock().unwrap().push(outcome.clone())),
            )
        };
        (handler, outcomes)
    }

    fn partial_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "part"))
            .collect()
    }

    async fn running_server(handler: impl OfferHandler) -> ControlServer {
        let mut server = ControlServer::new("127.0.0.1:0".parse().unwrap(), handler);
        server.start().await.unwrap();
        server
    }

    fn write_source(dir: &TempDir, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        let path = dir.path().join(name);
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    async fn send_file(path: &Path, chunk_size: usize, port: u16) -> Result<(crate::service::sender::SendReport, Vec<(u64, usize)>)> {
        let sender = Sender::new(path, chunk_size)?;
        let mut calls = Vec::new();
        let report = sender
            .send_to("127.0.0.1", port, |index, len| calls.push((index, len)))
            .await?;
        Ok((report, calls))
    }

    #[tokio::test]
    async fn test_round_trip_various_sizes() {
        let source_dir = tempdir().unwrap();
        let inbox = tempdir().unwrap();
        let (handler, outcomes) = recording_handler(inbox.path().to_path_buf());
        let mut server = running_server(handler).await;
        let port = server.port().unwrap();

        let cases: [(usize, usize); 5] = [(0, 16), (1, 16), (1000, 100), (1001, 100), (70_000, 4096)];
        for (i, (len, chunk_size)) in cases.iter().enumerate() {
            let name = format!("file-{}.bin", i);
            let (path, data) = write_source(&source_dir, &name, *len);

            let (report, calls) = send_file(&path, *chunk_size, port).await.unwrap();

            let received = std::fs::read(inbox.path().join(&name)).unwrap();
            assert_eq!(received, data, "content mismatch for {}", name);
            assert_eq!(report.bytes_sent, *len as u64);
            assert!(report.digests_match());
            assert_eq!(report.sha256, utils::sha256_bytes(&data));

            let expected_chunks = len.div_ceil(*chunk_size);
            assert_eq!(calls.len(), expected_chunks);
            for (expected_index, (index, _)) in calls.iter().enumerate() {
                assert_eq!(*index, expected_index as u64);
            }
            assert_eq!(calls.iter().map(|(_, n)| n).sum::<usize>(), *len);
        }

        server.stop().await;
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), cases.len());
        assert!(outcomes.iter().all(|o| o.ok));
    }

    #[tokio::test]
    async fn test_three_megabyte_offer_in_three_chunks() {
        let source_dir = tempdir().unwrap();
        let inbox = tempdir().unwrap();
        let (handler, outcomes) = recording_handler(inbox.path().to_path_buf());
        let mut server = running_server(handler).await;

        let (path, data) = write_source(&source_dir, "a.bin", 3 * 1024 * 1024);
        let (report, calls) = send_file(&path, 1024 * 1024, server.port().unwrap())
            .await
            .unwrap();
        server.stop().await;

        assert_eq!(report.chunks_sent, 3);
        assert_eq!(calls, vec![(0, 1024 * 1024), (1, 1024 * 1024), (2, 1024 * 1024)]);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert!(outcome.ok);
        assert_eq!(outcome.bytes_transferred, 3 * 1024 * 1024);
        assert_eq!(outcome.sha256.as_deref(), Some(utils::sha256_bytes(&data).as_str()));
        assert_eq!(outcome.save_path, inbox.path().join("a.bin"));
    }

    #[tokio::test]
    async fn test_rejection_short_circuits() {
        let source_dir = tempdir().unwrap();
        let inbox = tempdir().unwrap();
        let completions: Outcomes = Arc::new(Mutex::new(Vec::new()));

        let sink = completions.clone();
        let inbox_path = inbox.path().to_path_buf();
        let mut server = running_server(move |offer: &Offer| {
            if offer.total_size() > 100 {
                return OfferDecision::Reject("too large".to_string());
            }
            let sink = sink.clone();
            OfferDecision::Accept(
                Receiver::new(offer.filename(), offer.chunk_size(), offer.total_chunks())
                    .out_dir(inbox_path.clone())
                    .on_complete(move |o| sink.lock().unwrap().push(o.clone())),
            )
        })
        .await;

        let (path, _) = write_source(&source_dir, "big.bin", 1000);
        let mut calls = 0;
        let result = Sender::new(&path, 100)
            .unwrap()
            .send_to("127.0.0.1", server.port().unwrap(), |_, _| calls += 1)
            .await;
        server.stop().await;

        match result {
            Err(QuickshareError::Rejected(reason)) => assert_eq!(reason, "too large"),
            other => panic!("expected rejection, got {:?}", other.map(|r| r.bytes_sent)),
        }
        assert_eq!(calls, 0);
        assert!(!inbox.path().join("big.bin").exists());
        assert!(partial_files(inbox.path()).is_empty());
        assert!(completions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_isolated() {
        let source_dir = tempdir().unwrap();
        let inbox = tempdir().unwrap();
        let (handler, outcomes) = recording_handler(inbox.path().to_path_buf());
        let mut server = running_server(handler).await;
        let port = server.port().unwrap();

        // A peer that gets accepted, sends one chunk and then stalls.
        let stalled_offer = Offer::new("stalled.bin", 300, 100).unwrap();
        let mut stalled = send_control_offer("127.0.0.1", port, &stalled_offer, Duration::from_secs(5))
            .await
            .unwrap();
        stalled
            .write_message(&ControlMessage::Chunk(Chunk {
                index: 0,
                payload: vec![9u8; 100],
            }))
            .await
            .unwrap();

        let (path, data) = write_source(&source_dir, "healthy.bin", 50_000);
        let (report, _) = tokio::time::timeout(Duration::from_secs(10), send_file(&path, 1024, port))
            .await
            .expect("healthy transfer blocked by stalled one")
            .unwrap();
        assert!(report.digests_match());
        assert_eq!(std::fs::read(inbox.path().join("healthy.bin")).unwrap(), data);
        assert!(!inbox.path().join("stalled.bin").exists());

        // Now let the stalled peer vanish; its session fails on its own.
        drop(stalled);
        let mut failed_seen = false;
        for _ in 0..50 {
            if outcomes.lock().unwrap().iter().any(|o| o.filename == "stalled.bin") {
                failed_seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        server.stop().await;

        assert!(failed_seen);
        let outcomes = outcomes.lock().unwrap();
        let stalled = outcomes.iter().find(|o| o.filename == "stalled.bin").unwrap();
        assert!(!stalled.ok);
        assert!(partial_files(inbox.path()).is_empty());
        assert!(outcomes.iter().any(|o| o.filename == "healthy.bin" && o.ok));
    }

    #[tokio::test]
    async fn test_concurrent_sessions_with_same_name_do_not_collide() {
        let inbox = tempdir().unwrap();
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let handler = DirectoryHandler::new(inbox.path())
            .on_complete(move |outcome| sink.lock().unwrap().push(outcome.clone()));
        let mut server = running_server(handler).await;
        let port = server.port().unwrap();

        let offer_a = Offer::new("same.bin", 8, 4).unwrap();
        let offer_b = Offer::new("same.bin", 8, 4).unwrap();
        let mut a = send_control_offer("127.0.0.1", port, &offer_a, Duration::from_secs(5))
            .await
            .unwrap();
        let mut b = send_control_offer("127.0.0.1", port, &offer_b, Duration::from_secs(5))
            .await
            .unwrap();

        // Interleave so both sessions are writing at the same time.
        for index in 0..2u64 {
            a.write_message(&ControlMessage::Chunk(Chunk {
                index,
                payload: b"AAAA".to_vec(),
            }))
            .await
            .unwrap();
            b.write_message(&ControlMessage::Chunk(Chunk {
                index,
                payload: b"BBBB".to_vec(),
            }))
            .await
            .unwrap();
        }

        for (conn, expected) in [(&mut a, b"AAAAAAAA"), (&mut b, b"BBBBBBBB")] {
            match conn.read_message().await.unwrap() {
                ControlMessage::TransferComplete { bytes_received, sha256 } => {
                    assert_eq!(bytes_received, 8);
                    assert_eq!(sha256, utils::sha256_bytes(expected));
                }
                other => panic!("expected TransferComplete, got {}", other.kind()),
            }
        }
        server.stop().await;

        let mut stored = vec![
            std::fs::read(inbox.path().join("same.bin")).unwrap(),
            std::fs::read(inbox.path().join("same (1).bin")).unwrap(),
        ];
        stored.sort();
        assert_eq!(stored, vec![b"AAAAAAAA".to_vec(), b"BBBBBBBB".to_vec()]);
        assert!(partial_files(inbox.path()).is_empty());

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 2);
        for outcome in outcomes.iter() {
            assert!(outcome.ok, "{:?}", outcome.error);
            let on_disk = std::fs::read(&outcome.save_path).unwrap();
            assert_eq!(outcome.sha256.as_deref(), Some(utils::sha256_bytes(&on_disk).as_str()));
        }
        assert_ne!(outcomes[0].save_path, outcomes[1].save_path);
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_transfer_finish() {
        let inbox = tempdir().unwrap();
        let (handler, outcomes) = recording_handler(inbox.path().to_path_buf());
        let mut server = running_server(handler).await;
        let port = server.port().unwrap();

        let offer = Offer::new("late.bin", 8, 4).unwrap();
        let mut conn = send_control_offer("127.0.0.1", port, &offer, Duration::from_secs(5))
            .await
            .unwrap();

        server.stop().await;
        server.stop().await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        for (index, payload) in [b"abcd", b"efgh"].iter().enumerate() {
            conn.write_message(&ControlMessage::Chunk(Chunk {
                index: index as u64,
                payload: payload.to_vec(),
            }))
            .await
            .unwrap();
        }
        match conn.read_message().await.unwrap() {
            ControlMessage::TransferComplete { bytes_received, sha256 } => {
                assert_eq!(bytes_received, 8);
                assert_eq!(sha256, utils::sha256_bytes(b"abcdefgh"));
            }
            other => panic!("expected TransferComplete, got {}", other.kind()),
        }

        assert_eq!(std::fs::read(inbox.path().join("late.bin")).unwrap(), b"abcdefgh");
        assert_eq!(outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_without_start_and_port_reuse() {
        let inbox = tempdir().unwrap();
        let (handler, _) = recording_handler(inbox.path().to_path_buf());
        let mut idle = ControlServer::new("127.0.0.1:0".parse().unwrap(), handler);
        idle.stop().await;
        idle.stop().await;
        assert!(idle.port().is_none());

        let (handler, _) = recording_handler(inbox.path().to_path_buf());
        let mut server = running_server(handler).await;
        let addr = server.local_addr().unwrap();
        assert!(matches!(
            server.start().await,
            Err(QuickshareError::AlreadyRunning(_))
        ));
        server.stop().await;

        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_port_in_use_fails_start() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let inbox = tempdir().unwrap();
        let (handler, _) = recording_handler(inbox.path().to_path_buf());

        let mut server = ControlServer::new(taken.local_addr().unwrap(), handler);
        assert!(matches!(
            server.start().await,
            Err(QuickshareError::Network(_))
        ));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let (stream, _) = silent.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let offer = Offer::new("a.bin", 1, 1).unwrap();
        let result = send_control_offer("127.0.0.1", port, &offer, Duration::from_millis(200)).await;
        hold.abort();

        assert!(matches!(result, Err(QuickshareError::HandshakeTimeout(_))));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let offer = Offer::new("a.bin", 1, 1).unwrap();
        let result = send_control_offer("127.0.0.1", port, &offer, Duration::from_secs(2)).await;
        match result {
            Err(e @ QuickshareError::Connect { .. }) => assert!(e.is_retryable()),
            other => panic!("expected connect error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_first_message_must_be_offer() {
        let inbox = tempdir().unwrap();
        let (handler, outcomes) = recording_handler(inbox.path().to_path_buf());
        let mut server = running_server(handler).await;

        let stream = TcpStream::connect(("127.0.0.1", server.port().unwrap()))
            .await
            .unwrap();
        let mut conn = ControlConnection::new(stream).unwrap();
        conn.write_message(&ControlMessage::Chunk(Chunk {
            index: 0,
            payload: vec![1, 2, 3],
        }))
        .await
        .unwrap();

        match conn.read_message().await.unwrap() {
            ControlMessage::OfferResponse { accepted, .. } => assert!(!accepted),
            other => panic!("expected OfferResponse, got {}", other.kind()),
        }
        server.stop().await;
        assert!(outcomes.lock().unwrap().is_empty());
    }
}
