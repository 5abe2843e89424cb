use crate::network::protocol::Announcement;
use crate::{QuickshareError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const STOP_GRACE: Duration = Duration::from_secs(2);
const MAX_DATAGRAM: usize = 2048;

/// Stable identity of an announcing node: its name plus the address it
/// announces from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PeerKey {
    pub name: String,
    pub addr: IpAddr,
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub name: String,
    pub addr: IpAddr,
    /// Control channel port the peer listens on.
    pub port: u16,
    /// Timestamp carried in the most recent announcement.
    pub announced_at: u64,
    pub last_seen: Instant,
}

impl PeerRecord {
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

type PeerTable = Arc<RwLock<HashMap<PeerKey, PeerRecord>>>;

/// Listens for announcements and keeps the table of reachable peers.
///
/// Stale entries are dropped when the table is read, so no timer task is
/// needed.
pub struct PeerRegistry {
    bind_addr: SocketAddr,
    eviction_window: Duration,
    own_identity: Option<(String, u16)>,
    peers: PeerTable,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeerRegistry {
    pub fn new(bind_addr: SocketAddr, eviction_window: Duration) -> Self {
        Self {
            bind_addr,
            eviction_window,
            own_identity: None,
            peers: Arc::new(RwLock::new(HashMap::new())),
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Ignore announcements carrying this node's own name and control port.
    pub fn ignore_self(mut self, name: impl Into<String>, control_port: u16) -> Self {
        self.own_identity = Some((name.into(), control_port));
        self
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Address the listening socket is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn eviction_window(&self) -> Duration {
        self.eviction_window
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(QuickshareError::AlreadyRunning("peer registry"));
        }

        let socket = UdpSocket::bind(self.bind_addr).await.map_err(|e| {
            QuickshareError::Discovery(format!(
                "Failed to bind discovery socket on {}: {}",
                self.bind_addr, e
            ))
        })?;
        let local_addr = socket.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let peers = self.peers.clone();
        let own_identity = self.own_identity.clone();

        info!("Peer registry listening on {}", local_addr);

        self.handle = Some(tokio::spawn(async move {
            Self::run_receive_loop(socket, peers, own_identity, shutdown_rx).await;
        }));
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    async fn run_receive_loop(
        socket: UdpSocket,
        peers: PeerTable,
        own_identity: Option<(String, u16)>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => match Announcement::decode(&buf[..len]) {
                        Ok(announcement) => {
                            let is_self = own_identity
                                .as_ref()
                                .is_some_and(|(name, port)| {
                                    *name == announcement.name && *port == announcement.port
                                });
                            if !is_self {
                                Self::upsert(&peers, announcement, from.ip()).await;
                            }
                        }
                        Err(e) => debug!("Dropping datagram from {}: {}", from, e),
                    },
                    // Transient errors (e.g. ICMP port unreachable on some platforms)
                    // must not end the loop.
                    Err(e) => debug!("Discovery receive error: {}", e),
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        debug!("Peer registry receive loop stopped");
    }

    async fn upsert(peers: &PeerTable, announcement: Announcement, from: IpAddr) {
        let key = PeerKey {
            name: announcement.name.clone(),
            addr: from,
        };
        let record = PeerRecord {
            name: announcement.name,
            addr: from,
            port: announcement.port,
            announced_at: announcement.timestamp,
            last_seen: Instant::now(),
        };

        let mut table = peers.write().await;
        if table.insert(key.clone(), record).is_none() {
            info!("Discovered peer {}", key);
        } else {
            debug!("Refreshed peer {}", key);
        }
    }

    /// Record an announcement as if it had arrived from `from`.
    pub async fn record_announcement(&self, announcement: Announcement, from: IpAddr) {
        Self::upsert(&self.peers, announcement, from).await;
    }

    /// Snapshot of every peer heard from within the eviction window.
    pub async fn get_peers(&self) -> HashMap<PeerKey, PeerRecord> {
        let now = Instant::now();
        let window = self.eviction_window;

        let mut table = self.peers.write().await;
        table.retain(|key, record| {
            let fresh = now.duration_since(record.last_seen) <= window;
            if !fresh {
                debug!("Evicting stale peer {}", key);
            }
            fresh
        });
        table.clone()
    }

    /// Stops listening and releases the socket. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("Peer registry did not stop within {:?}, aborting", STOP_GRACE);
                handle.abort();
            }
        }
        self.local_addr = None;
    }
}

impl Drop for PeerRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
