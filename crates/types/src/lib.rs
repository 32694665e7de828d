use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use thiserror::Error;
use tracing::warn;

/// Highest port a quorum peer may listen on. The peer wire encoding historically
/// carries ports as signed 16-bit values.
pub const MAX_PEER_PORT: u16 = 32767;

#[derive(Error, Debug)]
pub enum QuorumError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Trust configuration error: {0}")]
    TrustConfiguration(String),

    #[error("Channel configuration error: {0}")]
    ChannelConfiguration(String),

    #[error("Key store error for {location}: {reason}")]
    KeyStore { location: String, reason: String },

    #[error("Invalid peer address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Invalid backoff configuration: {0}")]
    BackoffConfiguration(String),

    #[error("Failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    #[error("Transport failure with {peer}: {source}")]
    Transport {
        peer: String,
        #[source]
        source: io::Error,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse classification of [`QuorumError`], used by callers that own retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Bind,
    Handshake,
    Transport,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "CONFIGURATION"),
            ErrorKind::Bind => write!(f, "BIND"),
            ErrorKind::Handshake => write!(f, "HANDSHAKE"),
            ErrorKind::Transport => write!(f, "TRANSPORT"),
            ErrorKind::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl QuorumError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuorumError::Config(_)
            | QuorumError::TrustConfiguration(_)
            | QuorumError::ChannelConfiguration(_)
            | QuorumError::KeyStore { .. }
            | QuorumError::InvalidAddress { .. }
            | QuorumError::BackoffConfiguration(_) => ErrorKind::Configuration,
            QuorumError::Bind { .. } => ErrorKind::Bind,
            QuorumError::Handshake { .. } => ErrorKind::Handshake,
            QuorumError::Transport { .. } => ErrorKind::Transport,
            QuorumError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Only transport failures can heal by waiting. A rejected certificate or a
    /// malformed setting stays broken no matter how often it is retried.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub fn transport(peer: impl fmt::Display, source: io::Error) -> Self {
        QuorumError::Transport {
            peer: peer.to_string(),
            source,
        }
    }

    fn invalid_address(address: &str, reason: impl Into<String>) -> Self {
        QuorumError::InvalidAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QuorumError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        PeerId(id)
    }
}

/// A single member of the quorum: its id and the resolved address it listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuorumPeerAddress {
    id: PeerId,
    addr: SocketAddr,
}

impl QuorumPeerAddress {
    /// Parse `host:port` and resolve the host immediately, so a bad address is a
    /// configuration error at construction rather than at connect time.
    ///
    /// IPv6 literals must be bracketed (`[::1]:2888`).
    pub fn parse(id: impl Into<PeerId>, address: &str) -> Result<Self> {
        let id = id.into();
        let (host, port_str) = address
            .rsplit_once(':')
            .ok_or_else(|| QuorumError::invalid_address(address, "expected host:port"))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(QuorumError::invalid_address(address, "empty host"));
        }

        let port = parse_port(port_str).map_err(|reason| {
            warn!("Failed to parse port {} for peer {}: {}", port_str, id, reason);
            QuorumError::invalid_address(address, reason)
        })?;

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                warn!("Failed to resolve address {}: {}", host, e);
                QuorumError::invalid_address(address, format!("resolution failed: {}", e))
            })?
            .next()
            .ok_or_else(|| QuorumError::invalid_address(address, "host resolved to no addresses"))?;

        Ok(Self { id, addr })
    }

    /// Build from an already resolved address. The port bound still applies.
    pub fn from_resolved(id: impl Into<PeerId>, addr: SocketAddr) -> Result<Self> {
        if addr.port() > MAX_PEER_PORT {
            return Err(QuorumError::invalid_address(
                &addr.to_string(),
                format!("port {} exceeds {}", addr.port(), MAX_PEER_PORT),
            ));
        }
        Ok(Self {
            id: id.into(),
            addr,
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Display for QuorumPeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server.{}={}", self.id, self.addr)
    }
}

fn parse_port(s: &str) -> std::result::Result<u16, String> {
    let port: u32 = s
        .trim()
        .parse()
        .map_err(|e| format!("invalid port '{}': {}", s, e))?;
    if port > MAX_PEER_PORT as u32 {
        return Err(format!("port {} exceeds {}", port, MAX_PEER_PORT));
    }
    Ok(port as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_address() {
        let peer = QuorumPeerAddress::parse(1, "127.0.0.1:2888").unwrap();
        assert_eq!(peer.id(), PeerId(1));
        assert_eq!(peer.addr(), "127.0.0.1:2888".parse::<SocketAddr>().unwrap());
        assert_eq!(peer.to_string(), "server.1=127.0.0.1:2888");
    }

    #[test]
    fn test_parse_resolves_localhost() {
        let peer = QuorumPeerAddress::parse(2, "localhost:3888").unwrap();
        assert!(peer.addr().ip().is_loopback());
        assert_eq!(peer.addr().port(), 3888);
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let peer = QuorumPeerAddress::parse(3, "[::1]:2888").unwrap();
        assert!(peer.addr().is_ipv6());
    }

    #[test]
    fn test_port_upper_bound() {
        assert!(QuorumPeerAddress::parse(1, "127.0.0.1:32767").is_ok());

        let err = QuorumPeerAddress::parse(1, "127.0.0.1:32768").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(QuorumPeerAddress::parse(1, "127.0.0.1:65535").is_err());
    }

    #[test]
    fn test_invalid_ports_rejected() {
        for address in ["127.0.0.1:-1", "127.0.0.1:abc", "127.0.0.1:", "127.0.0.1"] {
            let err = QuorumPeerAddress::parse(1, address).unwrap_err();
            assert!(
                matches!(err, QuorumError::InvalidAddress { .. }),
                "expected InvalidAddress for {}",
                address
            );
        }
    }

    #[test]
    fn test_from_resolved_checks_port() {
        let ok: SocketAddr = "10.0.0.1:2888".parse().unwrap();
        assert!(QuorumPeerAddress::from_resolved(4, ok).is_ok());

        let too_high: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        assert!(QuorumPeerAddress::from_resolved(4, too_high).is_err());
    }

    #[test]
    fn test_error_kinds() {
        let handshake = QuorumError::Handshake {
            peer: "server.1".to_string(),
            reason: "unknown issuer".to_string(),
        };
        assert_eq!(handshake.kind(), ErrorKind::Handshake);
        assert!(!handshake.is_retryable());

        let transport = QuorumError::transport(
            "server.1",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(transport.kind(), ErrorKind::Transport);
        assert!(transport.is_retryable());

        assert!(!QuorumError::TrustConfiguration("x".into()).is_retryable());
        assert_eq!(QuorumError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
