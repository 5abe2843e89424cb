use crate::network::protocol::Announcement;
use crate::{QuickshareError, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `stop()` waits for the loop to wind down.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Periodically advertises this node's control port to one target address.
pub struct Announcer {
    name: String,
    control_port: u16,
    target: SocketAddr,
    interval: Duration,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Announcer {
    pub fn new(name: impl Into<String>, control_port: u16, target: SocketAddr, interval: Duration) -> Self {
        Self {
            name: name.into(),
            control_port,
            target,
            interval,
            shutdown_tx: None,
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(QuickshareError::AlreadyRunning("announcer"));
        }
        if self.interval.is_zero() {
            return Err(QuickshareError::Config(
                "Announce interval must be greater than zero".to_string(),
            ));
        }

        let bind_addr = match self.target.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        if self.target.is_ipv4() {
            socket.set_broadcast(true)?;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let name = self.name.clone();
        let control_port = self.control_port;
        let target = self.target;
        let interval = self.interval;

        info!(
            "Announcing '{}' (control port {}) to {} every {:?}",
            name, control_port, target, interval
        );

        self.handle = Some(tokio::spawn(async move {
            Self::run_announce_loop(socket, name, control_port, target, interval, shutdown_rx)
                .await;
        }));
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    async fn run_announce_loop(
        socket: UdpSocket,
        name: String,
        control_port: u16,
        target: SocketAddr,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let announcement = Announcement::new(name.as_str(), control_port);
                    match announcement.encode() {
                        Ok(data) => {
                            // Best effort: the next tick supersedes a lost datagram.
                            if let Err(e) = socket.send_to(&data, target).await {
                                debug!("Announcement to {} failed: {}", target, e);
                            }
                        }
                        Err(e) => warn!("Failed to encode announcement: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        debug!("Announcer for '{}' stopped", name);
    }

    /// Stops the announce loop. Safe to call repeatedly or before `start()`.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("Announcer did not stop within {:?}, aborting", STOP_GRACE);
                handle.abort();
            }
        }
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
