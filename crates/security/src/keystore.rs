//! Key store contract and the JSON-backed store shipped with the crate.
//!
//! A key store is a password protected collection of aliased entries. Each entry
//! is either a private key with its certificate chain, or a trusted certificate.
//! [`TrustMaterialLoader`](crate::TrustMaterialLoader) only relies on the
//! [`CertificateStore`] trait, so other backends (an HSM, a platform store) can be
//! plugged in without touching the TLS setup.
//!
//! The JSON format keeps PEM text per entry and an integrity digest over the
//! entries keyed by the store password:
//!
//! ```text
//! {
//!   "version": 1,
//!   "entries": [
//!     { "type": "private_key", "alias": "server.1", "key_pem": "...", "chain_pem": "..." },
//!     { "type": "trusted_certificate", "alias": "ca", "cert_pem": "..." }
//!   ],
//!   "digest": "<hex sha256(password || tag || entries)>"
//! }
//! ```

use quorum_types::{QuorumError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const KEYSTORE_VERSION: u32 = 1;
const DIGEST_TAG: &[u8] = b"quorum-keystore-v1";

/// A single aliased entry of a key store.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEntry {
    PrivateKey {
        alias: String,
        key_pem: String,
        chain_pem: String,
    },
    TrustedCertificate {
        alias: String,
        cert_pem: String,
    },
}

impl StoreEntry {
    pub fn alias(&self) -> &str {
        match self {
            StoreEntry::PrivateKey { alias, .. } | StoreEntry::TrustedCertificate { alias, .. } => {
                alias
            }
        }
    }

    pub fn is_private_key(&self) -> bool {
        matches!(self, StoreEntry::PrivateKey { .. })
    }

    /// The certificate this entry vouches for: the trusted certificate itself, or
    /// the whole chain of a private key entry (leaf first).
    pub fn certificate_pem(&self) -> &str {
        match self {
            StoreEntry::PrivateKey { chain_pem, .. } => chain_pem,
            StoreEntry::TrustedCertificate { cert_pem, .. } => cert_pem,
        }
    }
}

impl std::fmt::Debug for StoreEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreEntry::PrivateKey { alias, .. } => f
                .debug_struct("PrivateKey")
                .field("alias", alias)
                .finish_non_exhaustive(),
            StoreEntry::TrustedCertificate { alias, .. } => f
                .debug_struct("TrustedCertificate")
                .field("alias", alias)
                .finish_non_exhaustive(),
        }
    }
}

/// Source of key material. Implementations open the store at `location`,
/// check it against `password` and hand back its entries.
pub trait CertificateStore: Send + Sync {
    fn open(&self, location: &str, password: &str) -> Result<Vec<StoreEntry>>;
}

#[derive(Serialize, Deserialize)]
struct KeyStoreFile {
    version: u32,
    entries: Vec<StoreEntry>,
    digest: String,
}

fn compute_digest(password: &str, entries: &[StoreEntry]) -> Result<String> {
    let encoded = serde_json::to_vec(entries).map_err(|e| QuorumError::KeyStore {
        location: "<memory>".to_string(),
        reason: format!("failed to encode entries: {}", e),
    })?;

    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(DIGEST_TAG);
    hasher.update(&encoded);
    Ok(hex::encode(hasher.finalize()))
}

/// File backed key store in the JSON format described in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonKeyStore;

impl JsonKeyStore {
    pub fn parse(location: &str, json: &str, password: &str) -> Result<Vec<StoreEntry>> {
        let store_err = |reason: String| QuorumError::KeyStore {
            location: location.to_string(),
            reason,
        };

        let file: KeyStoreFile =
            serde_json::from_str(json).map_err(|e| store_err(format!("malformed key store: {}", e)))?;

        if file.version != KEYSTORE_VERSION {
            return Err(store_err(format!("unsupported key store version {}", file.version)));
        }

        if compute_digest(password, &file.entries)? != file.digest {
            return Err(store_err(
                "integrity check failed (wrong password or tampered store)".to_string(),
            ));
        }

        debug!("Opened key store {} with {} entries", location, file.entries.len());
        Ok(file.entries)
    }
}

impl CertificateStore for JsonKeyStore {
    fn open(&self, location: &str, password: &str) -> Result<Vec<StoreEntry>> {
        let json = fs::read_to_string(location).map_err(|e| QuorumError::KeyStore {
            location: location.to_string(),
            reason: format!("unable to read key store: {}", e),
        })?;
        Self::parse(location, &json, password)
    }
}

/// Builds key store files in the [`JsonKeyStore`] format.
#[derive(Debug, Default, Clone)]
pub struct KeyStoreWriter {
    entries: Vec<StoreEntry>,
}

impl KeyStoreWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_private_key(
        mut self,
        alias: impl Into<String>,
        key_pem: impl Into<String>,
        chain_pem: impl Into<String>,
    ) -> Self {
        self.entries.push(StoreEntry::PrivateKey {
            alias: alias.into(),
            key_pem: key_pem.into(),
            chain_pem: chain_pem.into(),
        });
        self
    }

    pub fn with_trusted_certificate(
        mut self,
        alias: impl Into<String>,
        cert_pem: impl Into<String>,
    ) -> Self {
        self.entries.push(StoreEntry::TrustedCertificate {
            alias: alias.into(),
            cert_pem: cert_pem.into(),
        });
        self
    }

    pub fn to_json(&self, password: &str) -> Result<String> {
        if password.is_empty() {
            return Err(QuorumError::TrustConfiguration(
                "key store password must not be empty".to_string(),
            ));
        }

        let file = KeyStoreFile {
            version: KEYSTORE_VERSION,
            entries: self.entries.clone(),
            digest: compute_digest(password, &self.entries)?,
        };

        serde_json::to_string_pretty(&file).map_err(|e| QuorumError::KeyStore {
            location: "<memory>".to_string(),
            reason: format!("failed to serialize key store: {}", e),
        })
    }

    pub fn write(&self, path: &Path, password: &str) -> Result<()> {
        let json = self.to_json(password)?;
        fs::write(path, json).map_err(|e| QuorumError::KeyStore {
            location: path.display().to_string(),
            reason: format!("failed to write key store: {}", e),
        })?;
        info!("Key store with {} entries saved to {:?}", self.entries.len(), path);
        Ok(())
    }
}
