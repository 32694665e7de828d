//! Throwaway certificate authority for local clusters and tests.
//!
//! ```text
//! Root CA (self-signed)
//!     │
//!     ├── server.1 (signed by CA)
//!     ├── server.2 (signed by CA)
//!     └── server.3 (signed by CA)
//! ```
//!
//! Each peer certificate carries `CN=server.{id}` and both the server and client
//! auth usages, since every quorum member dials and accepts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use quorum_types::{QuorumError, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use tracing::info;

use crate::keystore::KeyStoreWriter;
use crate::trust::StoreSettings;

/// Default certificate validity period (1 year).
const DEFAULT_VALIDITY_DAYS: u64 = 365;

/// Organization name for certificates.
const ORG_NAME: &str = "Quorum";

/// Alias under which the CA certificate is stored in generated trust stores.
pub const DEFAULT_CA_ALIAS: &str = "ca";

fn generation_error(what: &str, e: rcgen::Error) -> QuorumError {
    QuorumError::ChannelConfiguration(format!("Failed to {}: {}", what, e))
}

fn validity(params: &mut CertificateParams) {
    let now = std::time::SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + Duration::from_secs(DEFAULT_VALIDITY_DAYS * 24 * 60 * 60)).into();
}

/// Self-signed CA able to issue peer certificates.
pub struct TestCertificateAuthority {
    cert: rcgen::Certificate,
    key_pair: KeyPair,
}

impl TestCertificateAuthority {
    pub fn generate(common_name: &str) -> Result<Self> {
        info!("Generating certificate authority '{}'", common_name);

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, ORG_NAME);
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        validity(&mut params);

        let key_pair = KeyPair::generate().map_err(|e| generation_error("generate CA key pair", e))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| generation_error("create CA certificate", e))?;

        Ok(Self { cert, key_pair })
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a certificate for quorum member `peer_id`. `hostnames` become SANs;
    /// entries that parse as IP addresses are added as IP SANs.
    pub fn issue_peer(&self, peer_id: u64, hostnames: &[String]) -> Result<IssuedCertificate> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("server.{}", peer_id));
        dn.push(DnType::OrganizationName, ORG_NAME);
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        for hostname in hostnames {
            if let Ok(ip) = hostname.parse::<std::net::IpAddr>() {
                params.subject_alt_names.push(SanType::IpAddress(ip));
            } else {
                let dns_name = rcgen::Ia5String::try_from(hostname.clone()).map_err(|e| {
                    QuorumError::ChannelConfiguration(format!("Invalid DNS name {}: {:?}", hostname, e))
                })?;
                params.subject_alt_names.push(SanType::DnsName(dns_name));
            }
        }
        validity(&mut params);

        let key_pair =
            KeyPair::generate().map_err(|e| generation_error("generate peer key pair", e))?;
        let cert = params
            .signed_by(&key_pair, &self.cert, &self.key_pair)
            .map_err(|e| generation_error("sign peer certificate", e))?;

        info!("Issued certificate for server.{}", peer_id);

        Ok(IssuedCertificate {
            peer_id,
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            ca_cert_pem: self.cert.pem(),
        })
    }

    /// Write a trust store holding this CA under [`DEFAULT_CA_ALIAS`].
    pub fn write_truststore(&self, path: &Path, password: &str) -> Result<()> {
        KeyStoreWriter::new()
            .with_trusted_certificate(DEFAULT_CA_ALIAS, self.cert_pem())
            .write(path, password)
    }

    /// Write `truststore.ks` plus `node{id}.ks` for ids `1..=nodes` into `dir`.
    pub fn write_cluster(&self, dir: &Path, nodes: u64, password: &str) -> Result<ClusterPaths> {
        let truststore = dir.join("truststore.ks");
        self.write_truststore(&truststore, password)?;

        let hostnames = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        let mut keystores = Vec::new();
        for id in 1..=nodes {
            let issued = self.issue_peer(id, &hostnames)?;
            let path = dir.join(format!("node{}.ks", id));
            issued.write_keystore(&path, password)?;
            keystores.push(path);
        }

        Ok(ClusterPaths {
            truststore,
            keystores,
        })
    }
}

/// A peer certificate and its private key, both PEM encoded.
pub struct IssuedCertificate {
    peer_id: u64,
    cert_pem: String,
    key_pem: String,
    ca_cert_pem: String,
}

impl IssuedCertificate {
    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Leaf followed by the issuing CA.
    pub fn chain_pem(&self) -> String {
        format!("{}{}", self.cert_pem, self.ca_cert_pem)
    }

    pub fn write_keystore(&self, path: &Path, password: &str) -> Result<()> {
        KeyStoreWriter::new()
            .with_private_key(format!("server.{}", self.peer_id), self.key_pem(), self.chain_pem())
            .write(path, password)
    }
}

/// Files produced by [`TestCertificateAuthority::write_cluster`].
#[derive(Debug, Clone)]
pub struct ClusterPaths {
    pub truststore: PathBuf,
    pub keystores: Vec<PathBuf>,
}

impl ClusterPaths {
    /// Store settings for node `id` (1-based), using one password for every store.
    pub fn settings_for(&self, id: usize, password: &str) -> StoreSettings {
        StoreSettings {
            key_store_location: self
                .keystores
                .get(id.saturating_sub(1))
                .map(|p| p.display().to_string()),
            key_store_password: Some(password.to_string()),
            trust_store_location: Some(self.truststore.display().to_string()),
            trust_store_password: Some(password.to_string()),
            trust_store_ca_alias: Some(DEFAULT_CA_ALIAS.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_generation() {
        let ca = TestCertificateAuthority::generate("Quorum Test CA").unwrap();
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_peer_issue() {
        let ca = TestCertificateAuthority::generate("Quorum Test CA").unwrap();
        let issued = ca
            .issue_peer(3, &["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();

        assert_eq!(issued.peer_id(), 3);
        assert!(issued.key_pem().contains("BEGIN PRIVATE KEY"));
        assert_eq!(issued.chain_pem().matches("BEGIN CERTIFICATE").count(), 2);
    }

    #[test]
    fn test_write_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestCertificateAuthority::generate("Quorum Test CA").unwrap();
        let paths = ca.write_cluster(dir.path(), 3, "StorePass").unwrap();

        assert!(paths.truststore.exists());
        assert_eq!(paths.keystores.len(), 3);
        assert!(paths.keystores.iter().all(|p| p.exists()));

        let settings = paths.settings_for(2, "StorePass");
        assert!(settings
            .key_store_location
            .as_deref()
            .unwrap()
            .ends_with("node2.ks"));
        assert_eq!(settings.trust_store_ca_alias.as_deref(), Some("ca"));
    }
}
