use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout, Duration};

use super::shutdown::Shutdown;
use crate::utils::error::SimulationError;

type ClientWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub peer: String,
    pub connected_at: DateTime<Utc>,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub last_write_error: Option<String>,
}

/// A connected streaming client. Dropping it frees its slot.
struct ClientConnection {
    info: ClientInfo,
    writer: Arc<Mutex<ClientWriter>>,
    liveness: Option<AbortHandle>,
    _slot: OwnedSemaphorePermit,
}

/// Snapshot entry handed to broadcasters.
#[derive(Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    pub peer: String,
    writer: Arc<Mutex<ClientWriter>>,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

struct Inner {
    clients: RwLock<HashMap<ClientId, ClientConnection>>,
    slots: Arc<Semaphore>,
    max_clients: usize,
    next_id: AtomicU64,
    write_timeout: Duration,
}

/// Bounded set of streaming telegram clients.
///
/// A slot is reserved before `accept` is called, so connection attempts
/// beyond `max_clients` wait in the listen backlog until a client leaves.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(max_clients: usize, write_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                clients: RwLock::new(HashMap::new()),
                slots: Arc::new(Semaphore::new(max_clients)),
                max_clients,
                next_id: AtomicU64::new(1),
                write_timeout,
            }),
        }
    }

    pub async fn bind(address: &str) -> Result<TcpListener, SimulationError> {
        TcpListener::bind(address).await.map_err(|e| SimulationError::BindError {
            address: address.to_string(),
            source: e,
        })
    }

    pub fn max_clients(&self) -> usize {
        self.inner.max_clients
    }

    /// Accepts clients until `shutdown` fires. The listener is dropped on return.
    pub async fn run_accept_loop(&self, listener: TcpListener, mut shutdown: Shutdown) {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        info!("📡 Telegram server listening on {} (max {} clients)", local, self.inner.max_clients);

        while !shutdown.is_triggered() {
            let slot = tokio::select! {
                _ = shutdown.triggered() => break,
                slot = self.inner.slots.clone().acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.triggered() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("Failed to accept telegram client: {}", e);
                        sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not disable Nagle for {}: {}", peer, e);
            }
            let (reader, writer) = stream.into_split();
            self.admit(slot, peer.to_string(), Box::new(writer), Some((reader, shutdown.clone())))
                .await;
        }

        info!("🛑 Telegram accept loop on {} stopped", local);
    }

    /// Registers an already-connected transport if a slot is free.
    pub async fn attach<W>(&self, peer: impl Into<String>, writer: W) -> Option<ClientId>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let slot = self.inner.slots.clone().try_acquire_owned().ok()?;
        Some(self.admit(slot, peer.into(), Box::new(writer), None).await)
    }

    async fn admit(
        &self,
        slot: OwnedSemaphorePermit,
        peer: String,
        writer: ClientWriter,
        liveness: Option<(OwnedReadHalf, Shutdown)>,
    ) -> ClientId {
        let id = ClientId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let info = ClientInfo {
            id,
            peer: peer.clone(),
            connected_at: Utc::now(),
            messages_sent: 0,
            bytes_sent: 0,
            last_write_error: None,
        };

        let mut clients = self.inner.clients.write().await;
        let liveness = liveness.map(|(reader, shutdown)| {
            let manager = self.clone();
            tokio::spawn(async move { manager.watch_liveness(id, reader, shutdown).await }).abort_handle()
        });
        clients.insert(
            id,
            ClientConnection {
                info,
                writer: Arc::new(Mutex::new(writer)),
                liveness,
                _slot: slot,
            },
        );
        info!("✅ Telegram client {} connected from {} ({}/{})", id, peer, clients.len(), self.inner.max_clients);
        id
    }

    /// Incoming bytes are discarded; the read side only detects disconnects.
    async fn watch_liveness(&self, id: ClientId, mut reader: OwnedReadHalf, mut shutdown: Shutdown) {
        let mut buf = [0u8; 256];
        loop {
            tokio::select! {
                _ = shutdown.triggered() => return,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("🔌 Telegram client {} disconnected", id);
                        break;
                    }
                    Ok(n) => debug!("📥 Ignoring {} bytes from telegram client {}", n, id),
                    Err(e) => {
                        warn!("❌ Telegram client {} read error: {}", id, e);
                        break;
                    }
                },
            }
        }
        self.evict(id, None).await;
    }

    /// Removes a client. Removing an unknown or already removed id is a no-op.
    pub async fn remove(&self, id: ClientId) -> bool {
        self.evict(id, None).await.is_some()
    }

    async fn evict(&self, id: ClientId, reason: Option<String>) -> Option<ClientInfo> {
        let removed = self.inner.clients.write().await.remove(&id);
        let connection = removed?;

        let mut info = connection.info.clone();
        info.last_write_error = reason;
        match &info.last_write_error {
            Some(reason) => warn!("🔌 Removed telegram client {} ({}): {}", id, info.peer, reason),
            None => info!("🔌 Removed telegram client {} ({})", id, info.peer),
        }
        if let Some(liveness) = &connection.liveness {
            liveness.abort();
        }
        Some(info)
    }

    /// Copy of the live client set; later accepts and removals do not affect it.
    pub async fn broadcast_targets(&self) -> Vec<ClientHandle> {
        let clients = self.inner.clients.read().await;
        let mut targets: Vec<ClientHandle> = clients
            .values()
            .map(|c| ClientHandle {
                id: c.info.id,
                peer: c.info.peer.clone(),
                writer: c.writer.clone(),
            })
            .collect();
        targets.sort_by_key(|t| t.id);
        targets
    }

    /// Writes one frame to one client. Any failure closes the client.
    pub async fn send(&self, target: &ClientHandle, frame: Bytes) -> Result<(), SimulationError> {
        let write = async {
            let mut writer = target.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await
        };

        let error = match timeout(self.inner.write_timeout, write).await {
            Ok(Ok(())) => {
                self.record_delivery(target.id, frame.len()).await;
                return Ok(());
            }
            Ok(Err(e)) => SimulationError::CommunicationError(format!("write to {} failed: {}", target.peer, e)),
            Err(_) => SimulationError::Timeout,
        };

        self.evict(target.id, Some(error.to_string())).await;
        Err(error)
    }

    async fn record_delivery(&self, id: ClientId, bytes: usize) {
        if let Some(connection) = self.inner.clients.write().await.get_mut(&id) {
            connection.info.messages_sent += 1;
            connection.info.bytes_sent += bytes as u64;
        }
    }

    pub async fn client_count(&self) -> usize {
        self.inner.clients.read().await.len()
    }

    pub async fn client_stats(&self) -> Vec<ClientInfo> {
        let mut stats: Vec<ClientInfo> = self
            .inner
            .clients
            .read()
            .await
            .values()
            .map(|c| c.info.clone())
            .collect();
        stats.sort_by_key(|info| info.id);
        stats
    }

    /// Closes every client, flushing each within the write timeout.
    pub async fn close_all(&self) {
        let drained: Vec<ClientConnection> = self.inner.clients.write().await.drain().map(|(_, c)| c).collect();

        for connection in drained {
            if let Some(liveness) = &connection.liveness {
                liveness.abort();
            }
            let close = async { connection.writer.lock().await.shutdown().await };
            match timeout(self.inner.write_timeout, close).await {
                Ok(Ok(())) => debug!("Closed telegram client {}", connection.info.id),
                Ok(Err(e)) => warn!("Failed to close telegram client {}: {}", connection.info.id, e),
                Err(_) => warn!("Timeout closing telegram client {}", connection.info.id),
            }
        }
    }
}
