//! Asynchronous quorum sockets.
//!
//! [`QuorumSocketFactory`] binds listeners and creates client connectors for a
//! node's [`ChannelMode`](quorum_security::ChannelMode). Every connect, accept,
//! read and write runs on its own task and is handed back as a
//! [`SocketOperation`] that can be polled, awaited, subscribed to or cancelled.
//! [`PeerReconnector`] wraps a connector with a backoff policy.
//!
//! ```no_run
//! use quorum_network::QuorumSocketFactory;
//! use quorum_types::QuorumPeerAddress;
//!
//! # async fn demo() -> quorum_types::Result<()> {
//! let factory = QuorumSocketFactory::without_tls();
//! let peer = QuorumPeerAddress::parse(2, "127.0.0.1:2888")?;
//!
//! let connection = factory.build_for_client().connect(&peer).outcome().await?;
//! connection.write("hello").outcome().await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod factory;
mod operation;
mod reconnector;
mod stream;

pub use connection::{Connection, READ_CHUNK_SIZE};
pub use factory::{ClientConnector, ListenerHandle, QuorumSocketFactory, AUTH_ACK};
pub use operation::{OperationState, SocketOperation};
pub use reconnector::PeerReconnector;
