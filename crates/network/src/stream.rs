use rustls::pki_types::CertificateDer;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Byte stream under a [`Connection`](crate::Connection): plain TCP, or TLS from
/// either side of the handshake.
pub(crate) enum QuorumStream {
    Plain(TcpStream),
    Client(tokio_rustls::client::TlsStream<TcpStream>),
    Server(tokio_rustls::server::TlsStream<TcpStream>),
}

impl QuorumStream {
    pub(crate) fn tcp(&self) -> &TcpStream {
        match self {
            QuorumStream::Plain(s) => s,
            QuorumStream::Client(s) => s.get_ref().0,
            QuorumStream::Server(s) => s.get_ref().0,
        }
    }

    pub(crate) fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        let certs = match self {
            QuorumStream::Plain(_) => None,
            QuorumStream::Client(s) => s.get_ref().1.peer_certificates(),
            QuorumStream::Server(s) => s.get_ref().1.peer_certificates(),
        };
        certs.map(|c| c.to_vec()).unwrap_or_default()
    }

    pub(crate) fn is_tls(&self) -> bool {
        !matches!(self, QuorumStream::Plain(_))
    }
}

impl AsyncRead for QuorumStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            QuorumStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            QuorumStream::Client(s) => Pin::new(s).poll_read(cx, buf),
            QuorumStream::Server(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for QuorumStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            QuorumStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            QuorumStream::Client(s) => Pin::new(s).poll_write(cx, buf),
            QuorumStream::Server(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            QuorumStream::Plain(s) => Pin::new(s).poll_flush(cx),
            QuorumStream::Client(s) => Pin::new(s).poll_flush(cx),
            QuorumStream::Server(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            QuorumStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            QuorumStream::Client(s) => Pin::new(s).poll_shutdown(cx),
            QuorumStream::Server(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Errors surfacing from the TLS layer carry a `rustls::Error` and are reported
/// with `InvalidData`. Everything else is a transport problem.
pub(crate) fn is_tls_failure(e: &io::Error) -> bool {
    let wraps_rustls = e
        .get_ref()
        .map(|inner| inner.is::<rustls::Error>())
        .unwrap_or(false);
    wraps_rustls || e.kind() == io::ErrorKind::InvalidData
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_failure_classification() {
        let rejected = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert!(is_tls_failure(&rejected));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(!is_tls_failure(&refused));

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(!is_tls_failure(&eof));
    }
}
