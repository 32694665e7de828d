//! Reading the quorum identity out of a peer certificate.

use quorum_types::PeerId;
use rustls::pki_types::CertificateDer;
use tracing::debug;
use x509_parser::prelude::*;

/// Subject common name of `cert`, if it parses and carries one.
pub fn common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let parsed = match X509Certificate::from_der(cert.as_ref()) {
        Ok((_, parsed)) => parsed,
        Err(e) => {
            debug!("Failed to parse peer certificate: {}", e);
            return None;
        }
    };

    let cn = parsed.subject().iter_common_name().next()?;
    match cn.as_str() {
        Ok(cn) => Some(cn.to_string()),
        Err(e) => {
            debug!("Failed to extract CN: {}", e);
            None
        }
    }
}

/// Peer id from a `server.{id}` common name.
pub fn peer_id_from_certificate(cert: &CertificateDer<'_>) -> Option<PeerId> {
    let cn = common_name(cert)?;
    let id = cn.strip_prefix("server.")?;
    id.parse::<u64>().ok().map(PeerId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_ca::TestCertificateAuthority;

    fn leaf(pem: &str) -> CertificateDer<'static> {
        let mut reader = pem.as_bytes();
        let cert = rustls_pemfile::certs(&mut reader).next().unwrap().unwrap();
        cert
    }

    #[test]
    fn test_peer_id_from_issued_certificate() {
        let ca = TestCertificateAuthority::generate("Quorum Test CA").unwrap();
        let issued = ca.issue_peer(7, &["localhost".to_string()]).unwrap();
        let cert = leaf(issued.cert_pem());

        assert_eq!(common_name(&cert).as_deref(), Some("server.7"));
        assert_eq!(peer_id_from_certificate(&cert), Some(PeerId(7)));
    }

    #[test]
    fn test_ca_certificate_has_no_peer_id() {
        let ca = TestCertificateAuthority::generate("Quorum Test CA").unwrap();
        let cert = leaf(&ca.cert_pem());

        assert_eq!(common_name(&cert).as_deref(), Some("Quorum Test CA"));
        assert_eq!(peer_id_from_certificate(&cert), None);
    }

    #[test]
    fn test_garbage_der() {
        let cert = CertificateDer::from(vec![0u8, 1, 2, 3]);
        assert!(common_name(&cert).is_none());
    }
}
