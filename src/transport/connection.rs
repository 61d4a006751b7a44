//! # Framed Peer Connection
//!
//! One duplex, length-prefixed message stream to one peer.
//!
//! A [`Connection`] is a cheap, cloneable handle. Each connection runs a single
//! driver task on the Tokio runtime that owns the byte stream: it resolves and
//! dials (outbound), reads and decodes incoming frames, and drains the outgoing
//! queue. Public operations never await I/O; `send_data` enqueues and wakes the
//! writer, `close` flips the state and signals the driver.
//!
//! ## States
//! ```text
//! Created -> (Resolving) -> Opening -> Open -> Closing -> Closed
//!                 |             |
//!                 v             v
//!           ResolveFailed  ConnectFailed
//! ```
//!
//! Exactly one of `connection_attempt_failed` / `connection_terminated` is
//! delivered per connection. Observer callbacks run on the driver task without
//! any connection lock held, so they may call back into the connection (or
//! close other connections) freely.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::config::TransportConfig;
use crate::core::codec::FrameCodec;
use crate::core::frame;
use crate::discovery::{Discovery, ServiceInstance};
use crate::error::{ProtocolError, Result};
use crate::transport::outgoing::OutgoingQueue;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Created,
    Resolving,
    Opening,
    Open,
    Closing,
    Closed,
    ResolveFailed,
    ConnectFailed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Closed | ConnectionState::ResolveFailed | ConnectionState::ConnectFailed
        )
    }

    /// Whether a connection in this state may still reach `Open`
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ConnectionState::Created | ConnectionState::Resolving | ConnectionState::Opening
        )
    }
}

/// Where a connection leads. Immutable for the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    /// Concrete host and port to dial
    Host { host: String, port: u16 },
    /// Found service that must be resolved first
    Service(ServiceInstance),
    /// Inbound socket handed over by a listener
    Accepted(SocketAddr),
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Host { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            PeerAddress::Host { host, port } => write!(f, "{host}:{port}"),
            PeerAddress::Service(instance) => write!(f, "{instance}"),
            PeerAddress::Accepted(addr) => write!(f, "{addr}"),
        }
    }
}

/// A dialable peer: concrete, or symbolic and resolved on connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerDescriptor {
    Host { host: String, port: u16 },
    Service(ServiceInstance),
}

impl PeerDescriptor {
    pub fn host(host: impl Into<String>, port: u16) -> Self {
        PeerDescriptor::Host {
            host: host.into(),
            port,
        }
    }

    pub fn service(instance: ServiceInstance) -> Self {
        PeerDescriptor::Service(instance)
    }

    /// Whether the descriptor needs resolving before it can be dialled
    pub fn is_symbolic(&self) -> bool {
        matches!(self, PeerDescriptor::Service(_))
    }
}

impl From<SocketAddr> for PeerDescriptor {
    fn from(addr: SocketAddr) -> Self {
        PeerDescriptor::host(addr.ip().to_string(), addr.port())
    }
}

impl From<ServiceInstance> for PeerDescriptor {
    fn from(instance: ServiceInstance) -> Self {
        PeerDescriptor::Service(instance)
    }
}

impl From<PeerDescriptor> for PeerAddress {
    fn from(descriptor: PeerDescriptor) -> Self {
        match descriptor {
            PeerDescriptor::Host { host, port } => PeerAddress::Host { host, port },
            PeerDescriptor::Service(instance) => PeerAddress::Service(instance),
        }
    }
}

/// Receives lifecycle and data events from connections.
///
/// Connections hold observers weakly; keep the `Arc` alive for as long as
/// events should be delivered.
pub trait ConnectionObserver: Send + Sync {
    /// The connection reached `Open`
    fn connection_established(&self, _connection: &Connection) {}

    /// Resolution or connection setup failed; terminal
    fn connection_attempt_failed(&self, _connection: &Connection, _error: &ProtocolError) {}

    /// An open (or opening) connection was closed, locally or by the peer; terminal
    fn connection_terminated(&self, _connection: &Connection) {}

    /// A complete frame arrived
    fn received_data(&self, _payload: Bytes, _connection: &Connection) {}
}

/// Why the open phase ended without an error
enum Shutdown {
    Requested,
    PeerClosed,
}

struct Shared {
    id: ConnectionId,
    address: PeerAddress,
    state: Mutex<ConnectionState>,
    peer_addr: OnceLock<SocketAddr>,
    outgoing: Mutex<OutgoingQueue>,
    writable: Notify,
    cancel: CancellationToken,
    notified: AtomicBool,
    observer: Weak<dyn ConnectionObserver>,
    settings: TransportConfig,
    metrics: Arc<Metrics>,
}

/// Handle to one framed peer link
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Connection {}

impl Connection {
    fn new(
        address: PeerAddress,
        observer: Weak<dyn ConnectionObserver>,
        settings: &TransportConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: ConnectionId::next(),
                address,
                state: Mutex::new(ConnectionState::Created),
                peer_addr: OnceLock::new(),
                outgoing: Mutex::new(OutgoingQueue::new()),
                writable: Notify::new(),
                cancel: CancellationToken::new(),
                notified: AtomicBool::new(false),
                observer,
                settings: settings.clone(),
                metrics,
            }),
        }
    }

    /// Adopt an accepted stream. The connection starts in `Opening` and its
    /// driver is spawned on the current runtime.
    pub fn accepted<S>(
        stream: S,
        peer: SocketAddr,
        observer: Weak<dyn ConnectionObserver>,
        settings: &TransportConfig,
        metrics: Arc<Metrics>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Self::new(PeerAddress::Accepted(peer), observer, settings, metrics);
        let _ = connection.shared.peer_addr.set(peer);
        connection.set_state(ConnectionState::Opening);

        let driver = connection.clone();
        tokio::spawn(
            async move { driver.run_open(stream).await }.instrument(connection.span()),
        );
        connection
    }

    /// Dial `descriptor`. Symbolic descriptors start in `Resolving` and are
    /// resolved through `discovery`; concrete ones start in `Opening`.
    pub fn dial(
        descriptor: PeerDescriptor,
        discovery: Option<Arc<dyn Discovery>>,
        observer: Weak<dyn ConnectionObserver>,
        settings: &TransportConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let initial = if descriptor.is_symbolic() {
            ConnectionState::Resolving
        } else {
            ConnectionState::Opening
        };
        let connection = Self::new(descriptor.into(), observer, settings, metrics);
        connection.set_state(initial);

        let driver = connection.clone();
        tokio::spawn(
            async move { driver.run_outbound(discovery).await }.instrument(connection.span()),
        );
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn address(&self) -> &PeerAddress {
        &self.shared.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Socket address of the peer, once connected
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr.get().copied()
    }

    /// Frames waiting to be written
    pub fn queued_frames(&self) -> usize {
        self.lock_outgoing().len()
    }

    /// Frame `payload` and queue it for writing.
    ///
    /// Fails with [`ProtocolError::NotConnected`] unless the connection is
    /// `Open`, and with [`ProtocolError::FrameTooLarge`] if the payload length
    /// does not fit the prefix. Never awaits.
    pub fn send_data(&self, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(ProtocolError::NotConnected);
        }
        self.enqueue(frame::encode(payload)?)
    }

    /// Queue an already-encoded frame
    pub(crate) fn enqueue(&self, frame: Bytes) -> Result<()> {
        let state = self.lock_state();
        if *state != ConnectionState::Open {
            return Err(ProtocolError::NotConnected);
        }
        self.lock_outgoing().push(frame);
        drop(state);

        self.shared.writable.notify_one();
        Ok(())
    }

    /// Close the connection.
    ///
    /// Queued frames are flushed best-effort before the stream is released.
    /// The observer hears `connection_terminated` once; later calls are no-ops.
    pub fn close(&self) {
        {
            let mut state = self.lock_state();
            if state.is_terminal() || *state == ConnectionState::Closing {
                return;
            }
            *state = ConnectionState::Closing;
        }
        debug!(conn_id = %self.id(), "Close requested");
        self.shared.cancel.cancel();
    }

    fn span(&self) -> tracing::Span {
        info_span!("connection", conn_id = %self.shared.id, peer = %self.shared.address)
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outgoing(&self) -> MutexGuard<'_, OutgoingQueue> {
        self.shared
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        *self.lock_state() = next;
    }

    /// Move `from -> to`; fails if the state changed underneath (e.g. closed)
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.lock_state();
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.shared.observer.upgrade()
    }

    async fn run_outbound(self, discovery: Option<Arc<dyn Discovery>>) {
        let (host, port) = match self.address() {
            PeerAddress::Host { host, port } => (host.clone(), *port),
            PeerAddress::Service(instance) => {
                let Some(discovery) = discovery else {
                    self.fail(ConnectionState::ResolveFailed, ProtocolError::DiscoveryUnavailable);
                    return;
                };
                let resolved = tokio::select! {
                    _ = self.shared.cancel.cancelled() => {
                        self.terminate();
                        return;
                    }
                    resolved = discovery.resolve(instance) => resolved,
                };
                match resolved {
                    Ok(target) => {
                        debug!(host = %target.host, port = target.port, "Resolved service");
                        if !self.transition(ConnectionState::Resolving, ConnectionState::Opening) {
                            self.terminate();
                            return;
                        }
                        (target.host, target.port)
                    }
                    Err(e) => {
                        let e = match e {
                            ProtocolError::ResolveFailed(_) => e,
                            other => ProtocolError::ResolveFailed(other.to_string()),
                        };
                        self.fail(ConnectionState::ResolveFailed, e);
                        return;
                    }
                }
            }
            PeerAddress::Accepted(addr) => {
                self.fail(
                    ConnectionState::ConnectFailed,
                    ProtocolError::ConnectFailed(format!("cannot dial accepted peer {addr}")),
                );
                return;
            }
        };

        let connected = tokio::select! {
            _ = self.shared.cancel.cancelled() => {
                self.terminate();
                return;
            }
            connected = TcpStream::connect((host.as_str(), port)) => connected,
        };

        match connected {
            Ok(stream) => {
                if let Ok(peer) = stream.peer_addr() {
                    let _ = self.shared.peer_addr.set(peer);
                }
                if let Err(e) = stream.set_nodelay(self.shared.settings.nodelay) {
                    debug!(error = %e, "Could not set TCP_NODELAY");
                }
                self.run_open(stream).await;
            }
            Err(e) => self.fail(
                ConnectionState::ConnectFailed,
                ProtocolError::ConnectFailed(format!("{host}:{port}: {e}")),
            ),
        }
    }

    /// Drive a connected stream until it is closed or fails
    async fn run_open<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if !self.transition(ConnectionState::Opening, ConnectionState::Open) {
            // close() won the race with stream setup
            drop(stream);
            self.terminate();
            return;
        }

        self.shared.metrics.connection_opened();
        info!(peer_addr = ?self.peer_addr(), "Connection open");
        if let Some(observer) = self.observer() {
            observer.connection_established(self);
        }

        let (reader, mut writer) = tokio::io::split(stream);
        let mut frames = FramedRead::with_capacity(
            reader,
            FrameCodec::new(self.shared.settings.max_frame_length),
            self.shared.settings.read_buffer_capacity,
        );

        let outcome = tokio::select! {
            res = self.read_frames(&mut frames) => res,
            res = self.write_frames(&mut writer) => res,
            _ = self.shared.cancel.cancelled() => Ok(Shutdown::Requested),
        };

        match outcome {
            Ok(Shutdown::Requested) => {
                let flush = self.flush_and_shutdown(&mut writer);
                if let Err(e) = with_timeout_error(flush, self.shared.settings.flush_timeout).await {
                    debug!(error = %e, pending = self.queued_frames(), "Flush on close incomplete");
                }
            }
            Ok(Shutdown::PeerClosed) => {
                info!("Peer closed the stream");
                self.set_state(ConnectionState::Closing);
                // Replies queued while reading the peer's last frames still go out
                let flush = self.flush_and_shutdown(&mut writer);
                if let Err(e) = with_timeout_error(flush, self.shared.settings.flush_timeout).await {
                    debug!(error = %e, pending = self.queued_frames(), "Flush after peer close incomplete");
                }
            }
            Err(e) => {
                warn!(error = %e, "Stream error, terminating connection");
                self.shared.metrics.connection_error();
                self.set_state(ConnectionState::Closing);
            }
        }

        drop(frames);
        drop(writer);
        self.shared.metrics.connection_closed();
        self.terminate();
    }

    async fn read_frames<R>(&self, frames: &mut FramedRead<ReadHalf<R>, FrameCodec>) -> Result<Shutdown>
    where
        R: AsyncRead + Unpin,
    {
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            trace!(bytes = frame.len(), "Frame received");
            self.shared.metrics.frame_received(frame.len() as u64);
            if let Some(observer) = self.observer() {
                observer.received_data(frame.payload, self);
            }
        }
        Ok(Shutdown::PeerClosed)
    }

    async fn write_frames<W>(&self, writer: &mut WriteHalf<W>) -> Result<Shutdown>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let pending = self.lock_outgoing().pending();
            match pending {
                Some(chunk) => self.write_chunk(writer, &chunk).await?,
                None => {
                    writer.flush().await?;
                    self.shared.writable.notified().await;
                }
            }
        }
    }

    /// Write as much of `chunk` as the stream takes and record the progress
    async fn write_chunk<W>(&self, writer: &mut WriteHalf<W>, chunk: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let written = writer.write(chunk).await?;
        if written == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero).into());
        }
        let completed = self.lock_outgoing().advance(written);
        if let Some(frame_len) = completed {
            trace!(bytes = frame_len, "Frame written");
            self.shared.metrics.frame_sent(frame_len as u64);
        }
        Ok(())
    }

    async fn flush_and_shutdown<W>(&self, writer: &mut WriteHalf<W>) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let pending = self.lock_outgoing().pending();
            match pending {
                Some(chunk) => self.write_chunk(writer, &chunk).await?,
                None => break,
            }
        }
        writer.flush().await?;
        writer.shutdown().await?;
        Ok(())
    }

    /// Enter `Closed` and report `connection_terminated` once
    fn terminate(&self) {
        self.set_state(ConnectionState::Closed);
        let dropped = self.lock_outgoing().clear();
        if dropped > 0 {
            debug!(dropped, "Discarded unsent frames");
        }
        if self.shared.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Connection closed");
        if let Some(observer) = self.observer() {
            observer.connection_terminated(self);
        }
    }

    /// Enter a failed terminal state and report `connection_attempt_failed` once
    fn fail(&self, terminal: ConnectionState, error: ProtocolError) {
        self.set_state(terminal);
        if self.shared.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(state = ?terminal, error = %error, "Connection attempt failed");
        self.shared.metrics.connection_failed();
        if let Some(observer) = self.observer() {
            observer.connection_attempt_failed(self, &error);
        }
    }
}

#[cfg(test)]
impl Connection {
    /// A connection with no driver, pinned to `state`
    pub(crate) fn detached(address: PeerAddress, state: ConnectionState) -> Self {
        struct Silent;
        impl ConnectionObserver for Silent {}

        let observer: Weak<dyn ConnectionObserver> = Weak::<Silent>::new();
        let connection = Self::new(
            address,
            observer,
            &TransportConfig::default(),
            Arc::new(Metrics::new()),
        );
        connection.set_state(state);
        connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ServiceType;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Established,
        AttemptFailed(ConnectionState),
        Terminated,
        Data(Vec<u8>),
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    impl ConnectionObserver for Recorder {
        fn connection_established(&self, _connection: &Connection) {
            let _ = self.0.send(Event::Established);
        }

        fn connection_attempt_failed(&self, connection: &Connection, _error: &ProtocolError) {
            let _ = self.0.send(Event::AttemptFailed(connection.state()));
        }

        fn connection_terminated(&self, _connection: &Connection) {
            let _ = self.0.send(Event::Terminated);
        }

        fn received_data(&self, payload: Bytes, _connection: &Connection) {
            let _ = self.0.send(Event::Data(payload.to_vec()));
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timed out")
            .expect("observer channel closed")
    }

    #[tokio::test]
    async fn send_before_open_is_not_connected() {
        let conn = Connection::detached(PeerAddress::Accepted(peer()), ConnectionState::Opening);
        assert!(matches!(conn.send_data(b"x"), Err(ProtocolError::NotConnected)));
        assert_eq!(conn.queued_frames(), 0);
    }

    #[tokio::test]
    async fn delivers_frames_split_across_reads() {
        let (observer, mut events) = recorder();
        let (local, mut remote) = tokio::io::duplex(64);
        let weak: Weak<dyn ConnectionObserver> = Arc::downgrade(&observer) as _;
        let conn = Connection::accepted(local, peer(), weak, &TransportConfig::default(), Arc::default());

        assert_eq!(next(&mut events).await, Event::Established);
        assert!(conn.is_open());

        let wire = frame::encode(b"hello").unwrap();
        remote.write_all(&wire[..3]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.write_all(&wire[3..]).await.unwrap();
        remote.write_all(&frame::encode(b"").unwrap()).await.unwrap();

        assert_eq!(next(&mut events).await, Event::Data(b"hello".to_vec()));
        assert_eq!(next(&mut events).await, Event::Data(Vec::new()));
    }

    #[tokio::test]
    async fn writes_survive_small_stream_buffers() {
        let (observer, mut events) = recorder();
        // A 3-byte pipe forces every frame through several partial writes
        let (local, mut remote) = tokio::io::duplex(3);
        let weak: Weak<dyn ConnectionObserver> = Arc::downgrade(&observer) as _;
        let conn = Connection::accepted(local, peer(), weak, &TransportConfig::default(), Arc::default());
        assert_eq!(next(&mut events).await, Event::Established);

        conn.send_data(b"first").unwrap();
        conn.send_data(b"second").unwrap();
        conn.send_data(b"third").unwrap();

        let mut expected = Vec::new();
        for payload in [&b"first"[..], b"second", b"third"] {
            expected.extend_from_slice(&frame::encode(payload).unwrap());
        }
        let mut received = vec![0u8; expected.len()];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn close_twice_reports_once() {
        let (observer, mut events) = recorder();
        let (local, _remote) = tokio::io::duplex(64);
        let weak: Weak<dyn ConnectionObserver> = Arc::downgrade(&observer) as _;
        let conn = Connection::accepted(local, peer(), weak, &TransportConfig::default(), Arc::default());
        assert_eq!(next(&mut events).await, Event::Established);

        conn.close();
        conn.close();
        assert_eq!(next(&mut events).await, Event::Terminated);
        assert_eq!(conn.state(), ConnectionState::Closed);

        conn.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
        assert!(matches!(conn.send_data(b"late"), Err(ProtocolError::NotConnected)));
    }

    #[tokio::test]
    async fn close_flushes_queued_frames() {
        let (observer, mut events) = recorder();
        let (local, mut remote) = tokio::io::duplex(4);
        let weak: Weak<dyn ConnectionObserver> = Arc::downgrade(&observer) as _;
        let conn = Connection::accepted(local, peer(), weak, &TransportConfig::default(), Arc::default());
        assert_eq!(next(&mut events).await, Event::Established);

        conn.send_data(b"bye").unwrap();
        conn.close();

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, frame::encode(b"bye").unwrap().to_vec());
        assert_eq!(next(&mut events).await, Event::Terminated);
    }

    #[tokio::test]
    async fn peer_eof_terminates() {
        let (observer, mut events) = recorder();
        let (local, remote) = tokio::io::duplex(64);
        let weak: Weak<dyn ConnectionObserver> = Arc::downgrade(&observer) as _;
        let conn = Connection::accepted(local, peer(), weak, &TransportConfig::default(), Arc::default());
        assert_eq!(next(&mut events).await, Event::Established);

        drop(remote);
        assert_eq!(next(&mut events).await, Event::Terminated);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn oversized_incoming_frame_terminates() {
        let (observer, mut events) = recorder();
        let (local, mut remote) = tokio::io::duplex(64);
        let settings = TransportConfig {
            max_frame_length: 4,
            ..TransportConfig::default()
        };
        let weak: Weak<dyn ConnectionObserver> = Arc::downgrade(&observer) as _;
        let metrics = Arc::new(Metrics::new());
        let _conn = Connection::accepted(local, peer(), weak, &settings, metrics.clone());
        assert_eq!(next(&mut events).await, Event::Established);

        remote.write_all(&frame::encode(b"too long").unwrap()).await.unwrap();
        assert_eq!(next(&mut events).await, Event::Terminated);
        assert_eq!(metrics.snapshot().connection_errors, 1);
    }

    #[tokio::test]
    async fn dial_refused_reports_connect_failed() {
        // Grab a free port, then release it so nothing listens there
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (observer, mut events) = recorder();
        let weak: Weak<dyn ConnectionObserver> = Arc::downgrade(&observer) as _;
        let conn = Connection::dial(
            PeerDescriptor::host("127.0.0.1", port),
            None,
            weak,
            &TransportConfig::default(),
            Arc::default(),
        );

        assert_eq!(
            next(&mut events).await,
            Event::AttemptFailed(ConnectionState::ConnectFailed)
        );
        assert!(conn.state().is_terminal());
    }

    #[tokio::test]
    async fn symbolic_dial_without_discovery_fails_to_resolve() {
        let (observer, mut events) = recorder();
        let weak: Weak<dyn ConnectionObserver> = Arc::downgrade(&observer) as _;
        let instance = ServiceInstance::new("kitchen", ServiceType::new("chat", "tcp"));
        let _conn = Connection::dial(
            PeerDescriptor::service(instance),
            None,
            weak,
            &TransportConfig::default(),
            Arc::default(),
        );

        assert_eq!(
            next(&mut events).await,
            Event::AttemptFailed(ConnectionState::ResolveFailed)
        );
    }

    #[test]
    fn peer_address_display() {
        let v6 = PeerAddress::Host {
            host: "::1".into(),
            port: 80,
        };
        assert_eq!(v6.to_string(), "[::1]:80");
        let v4: PeerAddress = PeerDescriptor::from(peer()).into();
        assert_eq!(v4.to_string(), "127.0.0.1:9");
    }
}
