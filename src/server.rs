//! WebSocket listener
//!
//! Accepts TCP connections, upgrades them to WebSocket and runs one
//! [`Session`] per connection, each with its own coordinator and search
//! engine.

use crate::coordinator::{MiningCoordinator, PowLimits};
use crate::session::{Session, SessionId};
use crate::worker::{CpuWorker, CpuWorkerConfig, MiningWorker};
use crate::{Config, Result};
use dashmap::DashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

/// Live connection entry
#[derive(Debug, Clone)]
struct ConnectionInfo {
    peer: SocketAddr,
    connected_at: Instant,
    shutdown: CancellationToken,
}

/// Open connections, kept for limit checks and shutdown
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<SessionId, ConnectionInfo>,
}

impl ConnectionRegistry {
    fn register(&self, id: SessionId, peer: SocketAddr, shutdown: CancellationToken) {
        self.connections.insert(
            id,
            ConnectionInfo {
                peer,
                connected_at: Instant::now(),
                shutdown,
            },
        );
    }

    fn remove(&self, id: &SessionId) {
        if let Some((_, info)) = self.connections.remove(id) {
            debug!(
                "Connection from {} lasted {:?}",
                info.peer,
                info.connected_at.elapsed()
            );
        }
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is open
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Signal every open session to stop
    pub fn cancel_all(&self) {
        for entry in self.connections.iter() {
            entry.value().shutdown.cancel();
        }
    }
}

/// Mining service listener
pub struct MiningServer {
    listener: TcpListener,
    limits: PowLimits,
    worker_config: CpuWorkerConfig,
    max_connections: usize,
    registry: Arc<ConnectionRegistry>,
}

impl MiningServer {
    /// Bind the listen socket described by `config`
    pub async fn bind(config: &Config) -> Result<Self> {
        let addr = config.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            limits: config.pow_limits()?,
            worker_config: config.cpu_worker_config(),
            max_connections: config.server.max_connections,
            registry: Arc::new(ConnectionRegistry::default()),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared view of open connections
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until `shutdown` resolves, then close every
    /// session and wait for them to finish
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let tracker = TaskTracker::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down, closing {} connections", self.registry.len());
                    break;
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    if self.registry.len() >= self.max_connections {
                        warn!("Max connections reached, rejecting {}", peer);
                        drop(stream);
                        continue;
                    }

                    let id = SessionId::new();
                    let session_shutdown = CancellationToken::new();
                    self.registry.register(id, peer, session_shutdown.clone());

                    let registry = Arc::clone(&self.registry);
                    let engine: Arc<dyn MiningWorker> =
                        Arc::new(CpuWorker::new(self.worker_config));
                    let limits = self.limits;

                    tracker.spawn(
                        async move {
                            info!("New connection");
                            let served =
                                serve_connection(id, stream, engine, limits, session_shutdown)
                                    .await;
                            if let Err(e) = served {
                                warn!(category = e.category(), "Connection error: {}", e);
                            }
                            registry.remove(&id);
                        }
                        .instrument(info_span!("session", connection = %id, peer = %peer)),
                    );
                }
            }
        }

        self.registry.cancel_all();
        tracker.close();
        tracker.wait().await;
        info!("All sessions closed");
        Ok(())
    }
}

async fn serve_connection(
    id: SessionId,
    stream: TcpStream,
    engine: Arc<dyn MiningWorker>,
    limits: PowLimits,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let ws = tokio_tungstenite::accept_async(stream).await?;
    let coordinator = MiningCoordinator::new(engine, limits, shutdown.child_token());
    Session::new(id, ws, coordinator, shutdown).run().await
}
