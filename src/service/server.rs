//! # Connection Server
//!
//! Accepts peers on a dual-stack TCP port and keeps a pool of their
//! connections, keyed by [`ConnectionId`].
//!
//! The server is the observer of every pooled connection. It removes a
//! connection from the pool on its terminal notification and then re-notifies
//! its own delegate, so by the time a delegate hears `connection_terminated`
//! the pool no longer contains that connection.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use peerlink::config::NetworkConfig;
//! use peerlink::service::server::{ConnectionServer, ServerObserver};
//! use peerlink::transport::connection::Connection;
//!
//! struct Echo;
//!
//! impl ServerObserver for Echo {
//!     fn received_data(&self, payload: Bytes, connection: &Connection) {
//!         let _ = connection.send_data(&payload);
//!     }
//! }
//!
//! # async fn run() -> peerlink::error::Result<()> {
//! let echo = Arc::new(Echo);
//! let server = ConnectionServer::bind(&NetworkConfig::default(), Arc::downgrade(&echo) as _).await?;
//! println!("listening on port {}", server.port());
//! server.graceful_shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::frame;
use crate::discovery::{Discovery, ServiceHandle, ServiceType};
use crate::error::{ProtocolError, Result};
use crate::transport::connection::{Connection, ConnectionId, ConnectionObserver};
use crate::transport::listener::{bind_dual_stack, Listener};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::DRAIN_POLL_INTERVAL;

/// Receives publish and connection events from a [`ConnectionServer`]
pub trait ServerObserver: Send + Sync {
    /// The service was advertised under `instance_name`
    fn published(&self, _instance_name: &str) {}

    /// Advertising the service failed
    fn publish_failed(&self, _error: &ProtocolError) {}

    /// The advertisement for `instance_name` was withdrawn
    fn service_stopped(&self, _instance_name: &str) {}

    fn connection_established(&self, _connection: &Connection) {}

    fn connection_attempt_failed(&self, _connection: &Connection, _error: &ProtocolError) {}

    fn connection_terminated(&self, _connection: &Connection) {}

    fn received_data(&self, _payload: Bytes, _connection: &Connection) {}
}

type Publication = (Arc<dyn Discovery>, ServiceHandle);

struct ServerInner {
    config: NetworkConfig,
    service: ServiceType,
    delegate: Weak<dyn ServerObserver>,
    pool: RwLock<HashMap<ConnectionId, Connection>>,
    port: u16,
    local_addrs: Vec<SocketAddr>,
    shutdown: CancellationToken,
    is_shut_down: AtomicBool,
    metrics: Arc<Metrics>,
    publication: Mutex<Option<Publication>>,
}

impl ServerInner {
    fn read_pool(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Connection>> {
        self.pool.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_pool(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Connection>> {
        self.pool.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_publication(&self) -> MutexGuard<'_, Option<Publication>> {
        self.publication
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn delegate(&self) -> Option<Arc<dyn ServerObserver>> {
        self.delegate.upgrade()
    }

    /// Pool an accepted stream, unless the server is shutting down or full
    fn adopt<S>(self: &Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // Held across construction so the driver cannot remove the
        // connection before it has been inserted
        let mut pool = self.write_pool();
        if self.is_shut_down.load(Ordering::Acquire) {
            debug!(peer = %peer, "Dropping connection accepted during shutdown");
            return;
        }
        if pool.len() >= self.config.server.max_connections {
            warn!(
                peer = %peer,
                limit = self.config.server.max_connections,
                "Connection limit reached, rejecting peer"
            );
            self.metrics.connection_rejected();
            return;
        }

        let observer: Weak<dyn ConnectionObserver> = Arc::downgrade(self) as _;
        let connection = Connection::accepted(
            stream,
            peer,
            observer,
            &self.config.transport,
            Arc::clone(&self.metrics),
        );
        debug!(conn_id = %connection.id(), peer = %peer, pooled = pool.len() + 1, "Accepted connection");
        pool.insert(connection.id(), connection);
    }

    fn remove(&self, connection: &Connection) {
        if self.write_pool().remove(&connection.id()).is_some() {
            debug!(conn_id = %connection.id(), "Removed connection from pool");
        }
    }
}

impl ConnectionObserver for ServerInner {
    fn connection_established(&self, connection: &Connection) {
        if let Some(delegate) = self.delegate() {
            delegate.connection_established(connection);
        }
    }

    fn connection_attempt_failed(&self, connection: &Connection, error: &ProtocolError) {
        self.remove(connection);
        if let Some(delegate) = self.delegate() {
            delegate.connection_attempt_failed(connection, error);
        }
    }

    fn connection_terminated(&self, connection: &Connection) {
        self.remove(connection);
        if let Some(delegate) = self.delegate() {
            delegate.connection_terminated(connection);
        }
    }

    fn received_data(&self, payload: Bytes, connection: &Connection) {
        if let Some(delegate) = self.delegate() {
            delegate.received_data(payload, connection);
        }
    }
}

async fn accept_loop<L: Listener>(inner: Arc<ServerInner>, listener: L) {
    let addr = listener.local_addr().ok();
    let shutdown = inner.shutdown.clone();
    info!(addr = ?addr, "Accepting connections");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => inner.adopt(stream, peer),
                Err(e) => {
                    warn!(addr = ?addr, error = %e, "Error accepting connection");
                    // Back off so a persistent error (e.g. fd exhaustion) does not spin
                    tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
                }
            },
        }
    }

    info!(addr = ?addr, "Listener closed");
}

/// Multi-peer server: dual-stack listeners plus a pool of open connections
pub struct ConnectionServer {
    inner: Arc<ServerInner>,
}

impl ConnectionServer {
    /// Bind the listeners described by `config.server` and start accepting.
    ///
    /// With port 0 the system picks a port; IPv4 and IPv6 share it when both
    /// bind. Fails with [`ProtocolError::SocketCreateFailed`] only if neither
    /// family can listen.
    #[instrument(skip(config, delegate), fields(port = config.server.port))]
    pub async fn bind(config: &NetworkConfig, delegate: Weak<dyn ServerObserver>) -> Result<Self> {
        let stack = bind_dual_stack(&config.server, config.transport.nodelay)?;
        let port = stack
            .port()
            .ok_or_else(|| ProtocolError::SocketCreateFailed("listener has no local address".into()))?;

        let inner = Arc::new(ServerInner {
            config: config.clone(),
            service: config.service.service(),
            delegate,
            pool: RwLock::new(HashMap::new()),
            port,
            local_addrs: stack.local_addrs(),
            shutdown: CancellationToken::new(),
            is_shut_down: AtomicBool::new(false),
            metrics: Arc::new(Metrics::new()),
            publication: Mutex::new(None),
        });

        for listener in [stack.ipv4, stack.ipv6].into_iter().flatten() {
            tokio::spawn(accept_loop(Arc::clone(&inner), listener));
        }

        info!(port, addrs = ?inner.local_addrs, "Server started");
        Ok(Self { inner })
    }

    /// Port shared by the listeners
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.inner.local_addrs
    }

    /// Service type this server publishes
    pub fn service_type(&self) -> &ServiceType {
        &self.inner.service
    }

    /// Number of pooled (non-terminal) connections
    pub fn connection_count(&self) -> usize {
        self.inner.read_pool().len()
    }

    /// Snapshot of the pooled connections
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.read_pool().values().cloned().collect()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down.load(Ordering::Acquire)
    }

    /// Queue `payload` to every open pooled connection.
    ///
    /// Connections that are not `Open` are skipped. Returns how many
    /// connections the frame was queued on.
    pub fn broadcast(&self, payload: &[u8]) -> Result<usize> {
        let frame: Bytes = frame::encode(payload)?;
        let pool = self.inner.read_pool();

        let recipients = pool
            .values()
            .filter(|connection| connection.is_open())
            .filter(|connection| connection.enqueue(frame.clone()).is_ok())
            .count();
        drop(pool);

        self.inner.metrics.broadcast();
        debug!(recipients, bytes = payload.len(), "Broadcast queued");
        Ok(recipients)
    }

    /// Queue `payload` to one pooled connection
    pub fn send_to(&self, payload: &[u8], id: ConnectionId) -> Result<()> {
        let connection = self
            .inner
            .read_pool()
            .get(&id)
            .cloned()
            .ok_or(ProtocolError::UnknownConnection(id))?;
        connection.send_data(payload)
    }

    /// Close every pooled connection and stop listening.
    ///
    /// Returns immediately; connections flush and report
    /// `connection_terminated` from their own tasks. Idempotent, and safe to
    /// call from an observer callback.
    pub fn shutdown(&self) {
        if self.inner.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(port = self.inner.port, "Shutting down server");

        for connection in self.connections() {
            connection.close();
        }
        self.inner.shutdown.cancel();

        let publication = self.inner.lock_publication().take();
        if let Some((discovery, handle)) = publication {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let delegate = self.inner.delegate.clone();
                    runtime.spawn(async move {
                        withdraw(discovery.as_ref(), &handle, delegate.upgrade()).await;
                    });
                }
                Err(_) => warn!(instance = handle.name(), "No runtime to withdraw advertisement"),
            }
        }
    }

    /// [`shutdown`](Self::shutdown), then wait for the pool to drain.
    ///
    /// Waits at most `server.shutdown_timeout`.
    pub async fn graceful_shutdown(&self) {
        self.shutdown();

        let timeout = tokio::time::sleep(self.inner.config.server.shutdown_timeout);
        tokio::pin!(timeout);

        loop {
            let remaining = self.connection_count();
            if remaining == 0 {
                info!("All connections closed");
                break;
            }
            tokio::select! {
                _ = &mut timeout => {
                    warn!(remaining, "Shutdown timeout reached, abandoning open connections");
                    break;
                }
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {
                    debug!(remaining, "Waiting for connections to close");
                }
            }
        }

        self.inner.metrics.log_metrics();
    }

    /// Advertise this server's service type and port through `discovery`.
    ///
    /// Reports `published` or `publish_failed` to the delegate. A previous
    /// advertisement is withdrawn first.
    #[instrument(skip(self, discovery), fields(service = %self.inner.service))]
    pub async fn publish(&self, discovery: Arc<dyn Discovery>) -> Result<()> {
        if self.is_shut_down() {
            return Err(ProtocolError::ServerShutDown);
        }
        self.unpublish().await?;

        let name = self.instance_name();
        match discovery
            .advertise(&self.inner.service, &name, self.inner.port)
            .await
        {
            Ok(handle) => {
                info!(instance = %name, port = self.inner.port, "Service published");
                *self.inner.lock_publication() = Some((discovery, handle));
                if let Some(delegate) = self.inner.delegate() {
                    delegate.published(&name);
                }
                Ok(())
            }
            Err(e) => {
                warn!(instance = %name, error = %e, "Publish failed");
                if let Some(delegate) = self.inner.delegate() {
                    delegate.publish_failed(&e);
                }
                Err(e)
            }
        }
    }

    /// Withdraw the current advertisement, if any, reporting `service_stopped`
    pub async fn unpublish(&self) -> Result<()> {
        let publication = self.inner.lock_publication().take();
        let Some((discovery, handle)) = publication else {
            return Ok(());
        };
        discovery.withdraw(&handle).await?;
        info!(instance = handle.name(), "Service unpublished");
        if let Some(delegate) = self.inner.delegate() {
            delegate.service_stopped(handle.name());
        }
        Ok(())
    }

    /// Name of the current advertisement
    pub fn published_name(&self) -> Option<String> {
        self.inner
            .lock_publication()
            .as_ref()
            .map(|(_, handle)| handle.name().to_string())
    }

    fn instance_name(&self) -> String {
        let configured = &self.inner.config.server.instance_name;
        if !configured.is_empty() {
            return configured.clone();
        }
        std::env::var("HOSTNAME")
            .ok()
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| format!("{}-{}", self.inner.service.name(), self.inner.port))
    }
}

async fn withdraw(
    discovery: &dyn Discovery,
    handle: &ServiceHandle,
    delegate: Option<Arc<dyn ServerObserver>>,
) {
    match discovery.withdraw(handle).await {
        Ok(()) => {
            info!(instance = handle.name(), "Service withdrawn on shutdown");
            if let Some(delegate) = delegate {
                delegate.service_stopped(handle.name());
            }
        }
        Err(e) => warn!(instance = handle.name(), error = %e, "Could not withdraw service"),
    }
}

impl Drop for ConnectionServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connection::{ConnectionState, PeerAddress};
    use std::net::Ipv4Addr;

    struct Silent;
    impl ServerObserver for Silent {}

    fn loopback() -> NetworkConfig {
        NetworkConfig::default_with_overrides(|config| {
            config.server.ipv4_address = Ipv4Addr::LOCALHOST;
            config.server.enable_ipv6 = false;
        })
    }

    async fn bound() -> (ConnectionServer, Arc<Silent>) {
        let observer = Arc::new(Silent);
        let weak: Weak<dyn ServerObserver> = Arc::downgrade(&observer) as _;
        let server = ConnectionServer::bind(&loopback(), weak).await.unwrap();
        (server, observer)
    }

    #[tokio::test]
    async fn broadcast_skips_connections_that_are_not_open() {
        let (server, _observer) = bound().await;
        let opening = Connection::detached(
            PeerAddress::Accepted("127.0.0.1:1".parse().unwrap()),
            ConnectionState::Opening,
        );
        server
            .inner
            .write_pool()
            .insert(opening.id(), opening.clone());

        assert_eq!(server.broadcast(b"hello").unwrap(), 0);
        assert_eq!(opening.queued_frames(), 0);
        assert_eq!(server.metrics().snapshot().broadcasts, 1);
    }

    #[tokio::test]
    async fn send_to_unknown_id_fails() {
        let (server, _observer) = bound().await;
        let id = ConnectionId::from_raw(u64::MAX);
        assert!(matches!(
            server.send_to(b"x", id),
            Err(ProtocolError::UnknownConnection(unknown)) if unknown == id
        ));
    }

    #[tokio::test]
    async fn shutdown_twice_is_harmless() {
        let (server, _observer) = bound().await;
        server.shutdown();
        server.shutdown();
        assert!(server.is_shut_down());
        assert_eq!(server.connection_count(), 0);
        assert!(matches!(
            server
                .publish(Arc::new(crate::discovery::LocalDiscovery::new()))
                .await,
            Err(ProtocolError::ServerShutDown)
        ));
    }

    #[tokio::test]
    async fn instance_name_prefers_configuration() {
        let observer = Arc::new(Silent);
        let weak: Weak<dyn ServerObserver> = Arc::downgrade(&observer) as _;
        let mut config = loopback();
        config.server.instance_name = "kitchen".into();
        let server = ConnectionServer::bind(&config, weak).await.unwrap();
        assert_eq!(server.instance_name(), "kitchen");
    }
}
