//! An established, authenticated duplex byte stream to a quorum peer.

use quorum_types::{PeerId, QuorumError, Result};
use rustls::pki_types::CertificateDer;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::operation::SocketOperation;
use crate::stream::QuorumStream;

/// Largest chunk returned by a single [`Connection::read`].
pub const READ_CHUNK_SIZE: usize = 8 * 1024;

/// One direction of a connection. Operations issued on the same half run in
/// issue order: each waits for its predecessor to finish or be cancelled.
struct OrderedHalf<H> {
    io: Arc<Mutex<H>>,
    tail: StdMutex<Option<oneshot::Receiver<()>>>,
}

impl<H> OrderedHalf<H> {
    fn new(io: H) -> Self {
        Self {
            io: Arc::new(Mutex::new(io)),
            tail: StdMutex::new(None),
        }
    }

    /// Returns the predecessor to wait on and this operation's release token.
    /// The token is dropped when the operation completes or is aborted.
    fn enqueue(&self) -> (Option<oneshot::Receiver<()>>, oneshot::Sender<()>) {
        let (release, done) = oneshot::channel();
        let mut tail = self
            .tail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (tail.replace(done), release)
    }
}

async fn wait_turn(previous: Option<oneshot::Receiver<()>>) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }
}

pub struct Connection {
    peer: String,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    encrypted: bool,
    peer_certificates: Vec<CertificateDer<'static>>,
    reader: OrderedHalf<ReadHalf<QuorumStream>>,
    writer: OrderedHalf<WriteHalf<QuorumStream>>,
}

impl Connection {
    pub(crate) fn new(stream: QuorumStream, peer: String) -> io::Result<Self> {
        let tcp = stream.tcp();
        let peer_addr = tcp.peer_addr()?;
        let local_addr = tcp.local_addr()?;
        let encrypted = stream.is_tls();
        let peer_certificates = stream.peer_certificates();

        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            peer,
            peer_addr,
            local_addr,
            encrypted,
            peer_certificates,
            reader: OrderedHalf::new(reader),
            writer: OrderedHalf::new(writer),
        })
    }

    /// Label used in logs and errors, e.g. `server.2=10.0.0.2:2888`.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Certificate chain the peer presented, leaf first. Empty in plaintext mode.
    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.peer_certificates
    }

    pub fn peer_common_name(&self) -> Option<String> {
        self.peer_certificates
            .first()
            .and_then(quorum_security::common_name)
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_certificates
            .first()
            .and_then(quorum_security::peer_id_from_certificate)
    }

    /// Read whatever is available, up to [`READ_CHUNK_SIZE`] bytes. An empty
    /// vector means the peer closed its side.
    pub fn read(&self) -> SocketOperation<Vec<u8>> {
        let (previous, release) = self.reader.enqueue();
        let io = Arc::clone(&self.reader.io);
        let peer = self.peer.clone();

        SocketOperation::spawn(format!("read from {}", peer), async move {
            let _release = release;
            wait_turn(previous).await;

            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            let n = io
                .lock()
                .await
                .read(&mut buf)
                .await
                .map_err(|e| QuorumError::transport(&peer, e))?;
            buf.truncate(n);
            debug!("Read {} bytes from {}", n, peer);
            Ok(buf)
        })
    }

    /// Read exactly `len` bytes. Hitting end of stream first is a transport error.
    pub fn read_exact(&self, len: usize) -> SocketOperation<Vec<u8>> {
        let (previous, release) = self.reader.enqueue();
        let io = Arc::clone(&self.reader.io);
        let peer = self.peer.clone();

        SocketOperation::spawn(format!("read {} bytes from {}", len, peer), async move {
            let _release = release;
            wait_turn(previous).await;

            let mut buf = vec![0u8; len];
            io.lock()
                .await
                .read_exact(&mut buf)
                .await
                .map_err(|e| QuorumError::transport(&peer, e))?;
            debug!("Read {} bytes from {}", len, peer);
            Ok(buf)
        })
    }

    /// Write and flush all of `data`. Completes with the number of bytes written.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> SocketOperation<usize> {
        let data = data.into();
        let (previous, release) = self.writer.enqueue();
        let io = Arc::clone(&self.writer.io);
        let peer = self.peer.clone();

        SocketOperation::spawn(format!("write to {}", peer), async move {
            let _release = release;
            wait_turn(previous).await;

            let mut io = io.lock().await;
            io.write_all(&data)
                .await
                .map_err(|e| QuorumError::transport(&peer, e))?;
            io.flush()
                .await
                .map_err(|e| QuorumError::transport(&peer, e))?;
            debug!("Wrote {} bytes to {}", data.len(), peer);
            Ok(data.len())
        })
    }

    /// Close the write side after every earlier write. TLS sends close_notify.
    pub fn shutdown(&self) -> SocketOperation<()> {
        let (previous, release) = self.writer.enqueue();
        let io = Arc::clone(&self.writer.io);
        let peer = self.peer.clone();

        SocketOperation::spawn(format!("shutdown {}", peer), async move {
            let _release = release;
            wait_turn(previous).await;

            io.lock()
                .await
                .shutdown()
                .await
                .map_err(|e| QuorumError::transport(&peer, e))?;
            debug!("Shut down write side to {}", peer);
            Ok(())
        })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("local_addr", &self.local_addr)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}
