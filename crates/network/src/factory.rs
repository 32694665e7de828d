//! Listening and dialing sockets for quorum peers.
//!
//! [`QuorumSocketFactory`] is built once per node from a [`ChannelMode`]. With
//! TLS, accept and connect only complete after the mutual handshake; the
//! connected-but-unauthenticated state is never handed out.
//!
//! Under TLS 1.3 the client finishes its half of the handshake before the
//! server has verified the client certificate. The server therefore sends a
//! single [`AUTH_ACK`] byte once it has accepted the client, and connect stays
//! pending until that byte arrives. A rejected client sees the server's alert
//! (or a closed stream) instead and fails with a handshake error.

use quorum_security::{ChannelMode, SecureChannelContext};
use quorum_types::{QuorumError, QuorumPeerAddress, Result, MAX_PEER_PORT};
use rustls::pki_types::ServerName;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::operation::SocketOperation;
use crate::stream::{is_tls_failure, QuorumStream};

/// Sent by the server over TLS once it has authenticated the client.
pub const AUTH_ACK: u8 = 0x06;

#[derive(Debug, Clone)]
pub struct QuorumSocketFactory {
    mode: ChannelMode,
}

impl QuorumSocketFactory {
    pub fn new(mode: ChannelMode) -> Self {
        Self { mode }
    }

    pub fn for_tls(context: Arc<SecureChannelContext>) -> Self {
        Self::new(ChannelMode::Tls(context))
    }

    /// Plaintext sockets for local or test topologies.
    pub fn without_tls() -> Self {
        Self::new(ChannelMode::Plaintext)
    }

    pub fn mode(&self) -> &ChannelMode {
        &self.mode
    }

    /// Bind and listen on `bind_address:port`.
    ///
    /// Port 0 picks an ephemeral port. The OS may choose one above
    /// [`MAX_PEER_PORT`], in which case the listener works but cannot be named
    /// by a [`QuorumPeerAddress`]. Quorum nodes always listen on a fixed port.
    pub async fn build_for_server(&self, port: u16, bind_address: IpAddr) -> Result<ListenerHandle> {
        let addr = SocketAddr::new(bind_address, port);
        if port > MAX_PEER_PORT {
            return Err(QuorumError::InvalidAddress {
                address: addr.to_string(),
                reason: format!("port {} exceeds {}", port, MAX_PEER_PORT),
            });
        }

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!("Failed to bind listener on {}: {}", addr, e);
            QuorumError::Bind {
                address: addr.to_string(),
                source: e,
            }
        })?;
        let local_addr = listener.local_addr().map_err(|e| QuorumError::Bind {
            address: addr.to_string(),
            source: e,
        })?;

        if local_addr.port() > MAX_PEER_PORT {
            warn!(
                "Listener on {} is outside the peer port range (max {}), peers cannot address it",
                local_addr, MAX_PEER_PORT
            );
        }

        let acceptor = match &self.mode {
            ChannelMode::Tls(context) => Some(TlsAcceptor::from(context.server_config())),
            ChannelMode::Plaintext => None,
        };

        info!(
            "Listening on {} ({})",
            local_addr,
            if acceptor.is_some() { "mTLS" } else { "plaintext" }
        );

        Ok(ListenerHandle {
            listener: Arc::new(listener),
            acceptor,
            local_addr,
        })
    }

    pub fn build_for_client(&self) -> ClientConnector {
        let connector = match &self.mode {
            ChannelMode::Tls(context) => Some(TlsConnector::from(context.client_config())),
            ChannelMode::Plaintext => None,
        };
        ClientConnector {
            connector,
            connect_timeout: None,
        }
    }
}

fn handshake_error(peer: &str, e: io::Error) -> QuorumError {
    if is_tls_failure(&e) {
        warn!("TLS handshake with {} failed: {}", peer, e);
        QuorumError::Handshake {
            peer: peer.to_string(),
            reason: e.to_string(),
        }
    } else {
        QuorumError::transport(peer, e)
    }
}

/// The server alerting, closing or resetting before the ack means it refused
/// our certificate.
fn ack_error(peer: &str, e: io::Error) -> QuorumError {
    let refused = matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    );
    if refused || is_tls_failure(&e) {
        warn!("{} rejected our certificate: {}", peer, e);
        QuorumError::Handshake {
            peer: peer.to_string(),
            reason: e.to_string(),
        }
    } else {
        QuorumError::transport(peer, e)
    }
}

fn connection_error(peer: &str, e: io::Error) -> QuorumError {
    QuorumError::transport(peer, e)
}

/// A bound listening socket.
pub struct ListenerHandle {
    listener: Arc<TcpListener>,
    acceptor: Option<TlsAcceptor>,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept exactly one incoming connection, including its handshake.
    pub fn accept(&self) -> SocketOperation<Connection> {
        let listener = Arc::clone(&self.listener);
        let acceptor = self.acceptor.clone();
        let local_addr = self.local_addr;

        SocketOperation::spawn(format!("accept on {}", local_addr), async move {
            let (tcp, remote) = listener
                .accept()
                .await
                .map_err(|e| connection_error(&local_addr.to_string(), e))?;
            let peer = remote.to_string();
            debug!("Accepted TCP connection from {}", peer);

            let stream = match acceptor {
                Some(acceptor) => {
                    let mut tls = acceptor
                        .accept(tcp)
                        .await
                        .map_err(|e| handshake_error(&peer, e))?;
                    tls.write_all(&[AUTH_ACK])
                        .await
                        .map_err(|e| connection_error(&peer, e))?;
                    tls.flush().await.map_err(|e| connection_error(&peer, e))?;
                    QuorumStream::Server(tls)
                }
                None => QuorumStream::Plain(tcp),
            };

            let connection =
                Connection::new(stream, peer.clone()).map_err(|e| connection_error(&peer, e))?;
            info!(
                "Accepted connection from {} (peer: {})",
                peer,
                connection
                    .peer_common_name()
                    .unwrap_or_else(|| "unauthenticated".to_string())
            );
            Ok(connection)
        })
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.acceptor.is_some())
            .finish()
    }
}

/// Dials quorum peers. Cheap to clone.
#[derive(Clone)]
pub struct ClientConnector {
    connector: Option<TlsConnector>,
    connect_timeout: Option<Duration>,
}

impl ClientConnector {
    /// Bound the TCP connect plus handshake. Expiry is a transport failure.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn connect(&self, peer: &QuorumPeerAddress) -> SocketOperation<Connection> {
        let connector = self.connector.clone();
        let timeout = self.connect_timeout;
        let addr = peer.addr();
        let label = peer.to_string();

        SocketOperation::spawn(format!("connect to {}", label), async move {
            let attempt = establish(connector, addr, label.clone());
            match timeout {
                Some(limit) => tokio::time::timeout(limit, attempt).await.map_err(|_| {
                    QuorumError::transport(
                        &label,
                        io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("connect timed out after {:?}", limit),
                        ),
                    )
                })?,
                None => attempt.await,
            }
        })
    }
}

impl std::fmt::Debug for ClientConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnector")
            .field("tls", &self.connector.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

async fn establish(
    connector: Option<TlsConnector>,
    addr: SocketAddr,
    label: String,
) -> Result<Connection> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| connection_error(&label, e))?;
    if let Err(e) = tcp.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", label, e);
    }

    let stream = match connector {
        Some(connector) => {
            // Server names are not verified; the peer IP fills the SNI slot.
            let server_name = ServerName::from(addr.ip());
            let mut tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| handshake_error(&label, e))?;

            let mut ack = [0u8; 1];
            tls.read_exact(&mut ack)
                .await
                .map_err(|e| ack_error(&label, e))?;
            if ack[0] != AUTH_ACK {
                return Err(QuorumError::Handshake {
                    peer: label,
                    reason: format!("unexpected authentication ack 0x{:02x}", ack[0]),
                });
            }
            QuorumStream::Client(tls)
        }
        None => QuorumStream::Plain(tcp),
    };

    let connection = Connection::new(stream, label.clone()).map_err(|e| connection_error(&label, e))?;
    info!(
        "Connected to {} (peer: {})",
        label,
        connection
            .peer_common_name()
            .unwrap_or_else(|| "unauthenticated".to_string())
    );
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_types::ErrorKind;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// A listener on a free port within the peer port range.
    fn reserve_port() -> std::net::TcpListener {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        loop {
            let port = rng.gen_range(20_000..=MAX_PEER_PORT);
            if let Ok(listener) = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
                return listener;
            }
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let factory = QuorumSocketFactory::without_tls();
        let listener = factory.build_for_server(0, LOCALHOST).await.unwrap();
        let port = listener.local_addr().port();
        assert_ne!(port, 0);

        // Addressable as a peer only if the OS picked a port in range.
        let as_peer = QuorumPeerAddress::from_resolved(1, listener.local_addr());
        assert_eq!(as_peer.is_ok(), port <= MAX_PEER_PORT);
    }

    #[tokio::test]
    async fn test_bind_in_use_is_bind_error() {
        let factory = QuorumSocketFactory::without_tls();
        let occupied = reserve_port();
        let port = occupied.local_addr().unwrap().port();

        let err = factory.build_for_server(port, LOCALHOST).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bind);
    }

    #[tokio::test]
    async fn test_port_above_bound_rejected() {
        let factory = QuorumSocketFactory::without_tls();
        let err = factory.build_for_server(40000, LOCALHOST).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_plaintext_connect_refused_is_transport() {
        let factory = QuorumSocketFactory::without_tls();
        let port = reserve_port().local_addr().unwrap().port();
        let peer = QuorumPeerAddress::from_resolved(2, SocketAddr::new(LOCALHOST, port)).unwrap();

        let err = factory
            .build_for_client()
            .connect(&peer)
            .outcome()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_missing_ack_is_handshake_failure() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "early eof");
        assert_eq!(ack_error("server.1", eof).kind(), ErrorKind::Handshake);

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(ack_error("server.1", reset).kind(), ErrorKind::Handshake);

        let alert = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(rustls::AlertDescription::BadCertificate),
        );
        let err = ack_error("server.1", alert);
        assert_eq!(err.kind(), ErrorKind::Handshake);
        assert!(!err.is_retryable());

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(ack_error("server.1", timed_out).kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_connect_timeout_configured() {
        let connector = QuorumSocketFactory::without_tls()
            .build_for_client()
            .with_connect_timeout(Duration::from_millis(250));
        assert_eq!(connector.connect_timeout(), Some(Duration::from_millis(250)));
    }
}
