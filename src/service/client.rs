//! # Client Session
//!
//! A single outbound link to one peer, plus optional browsing for peers that
//! offer the session's service type.
//!
//! Lifecycle notifications from the underlying [`Connection`] are forwarded
//! unchanged to the session's [`ClientObserver`]. Once the connection reaches
//! a terminal state the session is free to `connect` again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::discovery::{Discovery, DiscoveryEvent, ServiceInstance, ServiceType};
use crate::error::{ProtocolError, Result};
use crate::transport::connection::{Connection, ConnectionObserver, PeerDescriptor};
use crate::utils::metrics::Metrics;

/// Receives search and connection events from a [`ClientSession`]
pub trait ClientObserver: Send + Sync {
    /// Browsing began
    fn search_started(&self) {}

    /// Browsing could not start or broke off
    fn search_failed(&self, _error: &ProtocolError) {}

    /// Browsing ended
    fn search_stopped(&self) {}

    /// The set of found services changed
    fn services_updated(&self, _services: &[ServiceInstance]) {}

    fn connection_established(&self, _connection: &Connection) {}

    fn connection_attempt_failed(&self, _connection: &Connection, _error: &ProtocolError) {}

    fn connection_terminated(&self, _connection: &Connection) {}

    fn received_data(&self, _payload: Bytes, _connection: &Connection) {}
}

struct ClientInner {
    config: NetworkConfig,
    service: ServiceType,
    discovery: Option<Arc<dyn Discovery>>,
    delegate: Weak<dyn ClientObserver>,
    current: Mutex<Option<Connection>>,
    found: Mutex<Vec<ServiceInstance>>,
    search: Mutex<Option<CancellationToken>>,
    metrics: Arc<Metrics>,
}

impl ClientInner {
    fn lock_current(&self) -> MutexGuard<'_, Option<Connection>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_found(&self) -> MutexGuard<'_, Vec<ServiceInstance>> {
        self.found.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_search(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.search.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delegate(&self) -> Option<Arc<dyn ClientObserver>> {
        self.delegate.upgrade()
    }

    /// Forget `connection` if it is still the current one
    fn release(&self, connection: &Connection) {
        let mut current = self.lock_current();
        if current.as_ref() == Some(connection) {
            *current = None;
        }
    }

    /// Apply a browse event; returns the new list if it changed
    fn apply(&self, event: DiscoveryEvent) -> Option<Vec<ServiceInstance>> {
        let mut found = self.lock_found();
        let changed = match event {
            DiscoveryEvent::Found(instance) => {
                if found.contains(&instance) {
                    false
                } else {
                    debug!(instance = %instance, "Service found");
                    found.push(instance);
                    true
                }
            }
            DiscoveryEvent::Lost(instance) => {
                let before = found.len();
                found.retain(|known| known != &instance);
                debug!(instance = %instance, "Service lost");
                found.len() != before
            }
        };
        changed.then(|| found.clone())
    }
}

impl ConnectionObserver for ClientInner {
    fn connection_established(&self, connection: &Connection) {
        if let Some(delegate) = self.delegate() {
            delegate.connection_established(connection);
        }
    }

    fn connection_attempt_failed(&self, connection: &Connection, error: &ProtocolError) {
        self.release(connection);
        if let Some(delegate) = self.delegate() {
            delegate.connection_attempt_failed(connection, error);
        }
    }

    fn connection_terminated(&self, connection: &Connection) {
        self.release(connection);
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

async fn browse_loop(inner: Arc<ClientInner>, discovery: Arc<dyn Discovery>, cancel: CancellationToken) {
    let browsed = tokio::select! {
        _ = cancel.cancelled() => return,
        browsed = discovery.browse(&inner.service) => browsed,
    };

    let mut events = match browsed {
        Ok(events) => events,
        Err(e) => {
            warn!(service = %inner.service, error = %e, "Browse failed");
            if !cancel.is_cancelled() {
                inner.lock_search().take();
            }
            if let Some(delegate) = inner.delegate() {
                delegate.search_failed(&e);
            }
            return;
        }
    };

    info!(service = %inner.service, "Searching for services");
    if let Some(delegate) = inner.delegate() {
        delegate.search_started();
    }

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            warn!(service = %inner.service, "Discovery ended the browse");
            if !cancel.is_cancelled() {
                inner.lock_search().take();
            }
            // A broken browse ends with search_failed alone
            if let Some(delegate) = inner.delegate() {
                delegate.search_failed(&ProtocolError::DiscoveryError("browse ended".into()));
            }
            return;
        };
        if let Some(services) = inner.apply(event) {
            if let Some(delegate) = inner.delegate() {
                delegate.services_updated(&services);
            }
        }
    }

    info!(service = %inner.service, "Search stopped");
    if let Some(delegate) = inner.delegate() {
        delegate.search_stopped();
    }
}

/// Single-peer client with optional service browsing
pub struct ClientSession {
    inner: Arc<ClientInner>,
}

impl ClientSession {
    /// Create an idle session. `discovery` is needed for searching and for
    /// dialling found services.
    pub fn new(
        config: &NetworkConfig,
        discovery: Option<Arc<dyn Discovery>>,
        delegate: Weak<dyn ClientObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config: config.clone(),
                service: config.service.service(),
                discovery,
                delegate,
                current: Mutex::new(None),
                found: Mutex::new(Vec::new()),
                search: Mutex::new(None),
                metrics: Arc::new(Metrics::new()),
            }),
        }
    }

    /// Start a connection to `descriptor`.
    ///
    /// A symbolic descriptor starts in `Resolving`, a concrete one in
    /// `Opening`; progress is reported through the observer. Fails with
    /// [`ProtocolError::AlreadyConnecting`] while the current connection is
    /// not terminal.
    #[instrument(skip(self))]
    pub fn connect(&self, descriptor: PeerDescriptor) -> Result<Connection> {
        if descriptor.is_symbolic() && self.inner.discovery.is_none() {
            return Err(ProtocolError::DiscoveryUnavailable);
        }

        let mut current = self.inner.lock_current();
        if let Some(existing) = current.as_ref() {
            if !existing.state().is_terminal() {
                return Err(ProtocolError::AlreadyConnecting);
            }
        }

        let observer: Weak<dyn ConnectionObserver> = Arc::downgrade(&self.inner) as _;
        let connection = Connection::dial(
            descriptor,
            self.inner.discovery.clone(),
            observer,
            &self.inner.config.transport,
            Arc::clone(&self.inner.metrics),
        );
        info!(conn_id = %connection.id(), peer = %connection.address(), "Connecting");
        *current = Some(connection.clone());
        Ok(connection)
    }

    /// Dial `client.address` from the configuration
    pub fn connect_configured(&self) -> Result<Connection> {
        let (host, port) = self
            .inner
            .config
            .client
            .host_port()
            .ok_or_else(|| ProtocolError::ConfigError("No client address configured".into()))?;
        self.connect(PeerDescriptor::host(host, port))
    }

    /// Dial a found service by its position in [`found_services`](Self::found_services)
    pub fn connect_to_service_at_index(&self, index: usize) -> Result<Connection> {
        let instance = self
            .inner
            .lock_found()
            .get(index)
            .cloned()
            .ok_or(ProtocolError::InvalidServiceIndex(index))?;
        self.connect(PeerDescriptor::Service(instance))
    }

    /// Resolve and dial `instance`
    pub fn connect_to_service(&self, instance: ServiceInstance) -> Result<Connection> {
        self.connect(PeerDescriptor::Service(instance))
    }

    /// Frame and queue `payload` on the current connection
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let connection = self
            .inner
            .lock_current()
            .clone()
            .ok_or(ProtocolError::NotConnected)?;
        connection.send_data(payload)
    }

    /// Close the current connection, if any. The session may `connect` again
    /// immediately.
    pub fn disconnect(&self) {
        let connection = self.inner.lock_current().take();
        if let Some(connection) = connection {
            info!(conn_id = %connection.id(), "Disconnecting");
            connection.close();
        }
    }

    /// The current (non-released) connection
    pub fn connection(&self) -> Option<Connection> {
        self.inner.lock_current().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|c| c.is_open())
    }

    /// Service type this session searches for
    pub fn service_type(&self) -> &ServiceType {
        &self.inner.service
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Browse for the session's service type.
    ///
    /// Results accumulate in [`found_services`](Self::found_services). Fails
    /// with [`ProtocolError::DiscoveryUnavailable`] when the session has no
    /// discovery collaborator; a no-op while already searching.
    pub fn start_searching(&self) -> Result<()> {
        let discovery = self
            .inner
            .discovery
            .clone()
            .ok_or(ProtocolError::DiscoveryUnavailable)?;

        let cancel = {
            let mut search = self.inner.lock_search();
            if search.is_some() {
                return Ok(());
            }
            let cancel = CancellationToken::new();
            *search = Some(cancel.clone());
            cancel
        };
        self.inner.lock_found().clear();

        tokio::spawn(browse_loop(Arc::clone(&self.inner), discovery, cancel));
        Ok(())
    }

    /// End the current browse; `search_stopped` follows
    pub fn stop_searching(&self) {
        if let Some(cancel) = self.inner.lock_search().take() {
            cancel.cancel();
        }
    }

    pub fn is_searching(&self) -> bool {
        self.inner.lock_search().is_some()
    }

    /// Services found by the current or last search
    pub fn found_services(&self) -> Vec<ServiceInstance> {
        self.inner.lock_found().clone()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.stop_searching();
        self.disconnect();
    }
}
