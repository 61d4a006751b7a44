//! Listening sockets.
//!
//! [`Listener`] is the accept capability the server loops over. [`TcpAcceptor`]
//! implements it for TCP; [`bind_dual_stack`] creates the IPv4 / IPv6 pair.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::constants::ERR_NO_LISTENER;
use crate::error::{ProtocolError, Result};

/// Pending connection backlog per listening socket
pub const LISTEN_BACKLOG: i32 = 128;

/// Something that yields accepted byte streams
pub trait Listener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next inbound connection
    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// TCP listener that applies stream options to every accepted socket
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    nodelay: bool,
}

impl TcpAcceptor {
    /// Bind a single listening socket. IPv6 sockets are v6-only so an IPv4
    /// socket can share the same port.
    pub fn bind(addr: SocketAddr, nodelay: bool) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        #[cfg(unix)]
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener = TcpListener::from_std(socket.into())?;
        Ok(Self { listener, nodelay })
    }

    pub fn port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }
}

impl Listener for TcpAcceptor {
    type Stream = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        async move {
            let (stream, peer) = self.listener.accept().await?;
            if let Err(e) = stream.set_nodelay(self.nodelay) {
                debug!(peer = %peer, error = %e, "Could not set TCP_NODELAY");
            }
            Ok((stream, peer))
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// The IPv4 / IPv6 listener pair; a family is absent if it failed to bind
#[derive(Debug)]
pub struct DualStack {
    pub ipv4: Option<TcpAcceptor>,
    pub ipv6: Option<TcpAcceptor>,
}

impl DualStack {
    /// Port shared by the bound listeners
    pub fn port(&self) -> Option<u16> {
        self.ipv4
            .as_ref()
            .or(self.ipv6.as_ref())
            .and_then(|l| l.port().ok())
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.ipv4
            .iter()
            .chain(self.ipv6.iter())
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }
}

/// Bind the IPv4 and IPv6 listeners described by `config`.
///
/// Each family binds independently and a failure only omits that family.
/// With port 0 the IPv6 socket is moved onto the port the system assigned to
/// the IPv4 socket; if that rebind fails the server continues IPv4-only.
/// Fails with [`ProtocolError::SocketCreateFailed`] only if neither binds.
pub fn bind_dual_stack(config: &ServerConfig, nodelay: bool) -> Result<DualStack> {
    let v4_addr = SocketAddr::V4(SocketAddrV4::new(config.ipv4_address, config.port));

    let ipv4 = match TcpAcceptor::bind(v4_addr, nodelay) {
        Ok(listener) => Some(listener),
        Err(e) => {
            warn!(addr = %v4_addr, error = %e, "IPv4 listener unavailable");
            None
        }
    };

    with_ipv6(config, ipv4, nodelay)
}

/// Add the IPv6 listener to an already attempted IPv4 one
fn with_ipv6(config: &ServerConfig, ipv4: Option<TcpAcceptor>, nodelay: bool) -> Result<DualStack> {
    let v6_addr = |port| SocketAddr::V6(SocketAddrV6::new(config.ipv6_address, port, 0, 0));

    let mut ipv6 = if config.enable_ipv6 {
        match TcpAcceptor::bind(v6_addr(config.port), nodelay) {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(addr = %v6_addr(config.port), error = %e, "IPv6 listener unavailable");
                None
            }
        }
    } else {
        None
    };

    let rebind_port = match (config.port, ipv4.as_ref(), ipv6.as_ref()) {
        (0, Some(v4), Some(v6)) => {
            let v4_port = v4.port()?;
            (v6.port()? != v4_port).then_some(v4_port)
        }
        _ => None,
    };

    if let Some(port) = rebind_port {
        // Release the auto-assigned IPv6 port before claiming the IPv4 one
        drop(ipv6.take());
        ipv6 = match TcpAcceptor::bind(v6_addr(port), nodelay) {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(port, error = %e, "IPv6 rebind failed, continuing IPv4-only");
                None
            }
        };
    }

    let stack = DualStack { ipv4, ipv6 };
    if stack.ipv4.is_none() && stack.ipv6.is_none() {
        return Err(ProtocolError::SocketCreateFailed(format!(
            "{ERR_NO_LISTENER} on port {}",
            config.port
        )));
    }

    info!(
        port = ?stack.port(),
        ipv4 = stack.ipv4.is_some(),
        ipv6 = stack.ipv6.is_some(),
        "Listeners bound"
    );
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn loopback_config(port: u16) -> ServerConfig {
        ServerConfig {
            port,
            ipv4_address: Ipv4Addr::LOCALHOST,
            ipv6_address: Ipv6Addr::LOCALHOST,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn auto_port_is_shared_across_families() {
        let stack = bind_dual_stack(&loopback_config(0), true).unwrap();
        let v4 = stack.ipv4.as_ref().map(|l| l.port().unwrap());
        let v6 = stack.ipv6.as_ref().map(|l| l.port().unwrap());

        assert!(stack.port().unwrap() > 0);
        if let (Some(v4), Some(v6)) = (v4, v6) {
            assert_eq!(v4, v6);
        }
    }

    #[tokio::test]
    async fn ipv6_can_be_disabled() {
        let config = ServerConfig {
            enable_ipv6: false,
            ..loopback_config(0)
        };
        let stack = bind_dual_stack(&config, true).unwrap();
        assert!(stack.ipv6.is_none());
        assert_eq!(stack.local_addrs().len(), 1);
    }

    #[tokio::test]
    async fn fixed_port_in_use_fails_when_no_family_binds() {
        let taken = bind_dual_stack(
            &ServerConfig {
                enable_ipv6: false,
                ..loopback_config(0)
            },
            true,
        )
        .unwrap();
        let port = taken.port().unwrap();

        // Only IPv4 requested, and its port is already taken
        let config = ServerConfig {
            enable_ipv6: false,
            ..loopback_config(port)
        };
        // SO_REUSEADDR does not allow two listeners on one port
        assert!(matches!(
            bind_dual_stack(&config, true),
            Err(ProtocolError::SocketCreateFailed(_))
        ));
    }

    #[tokio::test]
    async fn fixed_port_keeps_ipv4_when_ipv6_is_taken() {
        // Hosts without IPv6 loopback cannot set this up
        let Ok(squatter) = std::net::TcpListener::bind((Ipv6Addr::LOCALHOST, 0)) else {
            return;
        };
        let port = squatter.local_addr().unwrap().port();

        let stack = bind_dual_stack(&loopback_config(port), true).unwrap();
        assert!(stack.ipv4.is_some());
        assert!(stack.ipv6.is_none());
        assert_eq!(stack.port(), Some(port));
    }

    #[tokio::test]
    async fn failed_ipv6_rebind_leaves_ipv4_only() {
        let ipv4 = TcpAcceptor::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), true).unwrap();
        let port = ipv4.port().unwrap();
        // Occupy the port the IPv6 socket would be moved onto
        let Ok(_squatter) = std::net::TcpListener::bind((Ipv6Addr::LOCALHOST, port)) else {
            return;
        };

        let stack = with_ipv6(&loopback_config(0), Some(ipv4), true).unwrap();
        assert!(stack.ipv4.is_some());
        assert!(stack.ipv6.is_none());
        assert_eq!(stack.port(), Some(port));
        assert_eq!(stack.local_addrs().len(), 1);
    }
}
