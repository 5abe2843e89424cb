use crate::config::Settings;
use crate::network::{Announcer, ControlServer, OfferHandler, PeerRecord, PeerRegistry};
use crate::service::handler::DirectoryHandler;
use crate::service::sender::{SendReport, Sender};
use crate::{QuickshareError, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// One node: answers offers, announces itself and tracks the peers it hears.
pub struct QuickshareDaemon {
    settings: Arc<Settings>,
    server: ControlServer,
    registry: Option<PeerRegistry>,
    announcer: Option<Announcer>,
}

impl QuickshareDaemon {
    /// Node that saves every incoming file into the configured receive directory.
    pub fn new(settings: Settings) -> Self {
        let handler = DirectoryHandler::new(settings.receive_dir());
        Self::with_handler(settings, handler)
    }

    pub fn with_handler(settings: Settings, handler: impl OfferHandler) -> Self {
        let server = ControlServer::new(settings.control_bind_addr(), handler);
        Self {
            settings: Arc::new(settings),
            server,
            registry: None,
            announcer: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.server.is_running()
    }

    /// Port the control server is bound to, once started.
    pub fn control_port(&self) -> Option<u16> {
        self.server.port()
    }

    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.registry.as_ref().and_then(|r| r.local_addr())
    }

    /// Bring up the control server, then discovery, then announcements of
    /// the port actually bound. Anything already started is torn down again
    /// if a later step fails.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(QuickshareError::AlreadyRunning("daemon"));
        }

        let name = self.settings.device.name.clone();
        info!("Starting Quickshare daemon as {:?}", name);

        self.server.start().await?;
        let control_port = self
            .server
            .port()
            .ok_or_else(|| QuickshareError::Config("Control server has no port".to_string()))?;

        let mut registry = PeerRegistry::new(
            self.settings.discovery_bind_addr(),
            self.settings.eviction_window(),
        )
        .ignore_self(name.clone(), control_port);
        if let Err(e) = registry.start().await {
            error!("Failed to start peer registry: {}", e);
            self.server.stop().await;
            return Err(e);
        }

        let mut announcer = Announcer::new(
            name,
            control_port,
            self.settings.announce_target_addr(),
            self.settings.announce_interval(),
        );
        if let Err(e) = announcer.start().await {
            error!("Failed to start announcer: {}", e);
            registry.stop().await;
            self.server.stop().await;
            return Err(e);
        }

        self.registry = Some(registry);
        self.announcer = Some(announcer);

        info!(
            "Daemon running: control port {}, discovery on {}",
            control_port,
            self.settings.discovery_bind_addr()
        );
        Ok(())
    }

    /// Stop announcing, listening and accepting. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(mut announcer) = self.announcer.take() {
            announcer.stop().await;
        }
        if let Some(mut registry) = self.registry.take() {
            registry.stop().await;
        }
        if self.server.is_running() {
            self.server.stop().await;
            info!("Daemon stopped");
        }
    }

    /// Peers heard from recently, ordered by name.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        let Some(ref registry) = self.registry else {
            return Vec::new();
        };

        let mut peers: Vec<PeerRecord> = registry.get_peers().await.into_values().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name).then(a.addr.cmp(&b.addr)));
        peers
    }

    /// Offer `path` to the node listening at `host:port` and stream it.
    pub async fn send_file<P>(
        &self,
        host: &str,
        port: u16,
        path: impl AsRef<Path>,
        progress: P,
    ) -> Result<SendReport>
    where
        P: FnMut(u64, usize),
    {
        let sender = Sender::new(path.as_ref(), self.settings.transfer.chunk_size)?
            .with_handshake_timeout(self.settings.handshake_timeout());
        sender.send_to(host, port, progress).await
    }
}
