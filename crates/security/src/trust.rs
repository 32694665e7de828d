//! Turns key store and trust store settings into validated trust material.

use quorum_types::{QuorumError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::keystore::{CertificateStore, JsonKeyStore, StoreEntry};

/// The five store settings a node is configured with. Any of them may be absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub key_store_location: Option<String>,
    pub key_store_password: Option<String>,
    pub trust_store_location: Option<String>,
    pub trust_store_password: Option<String>,
    pub trust_store_ca_alias: Option<String>,
}

/// This node's private key and the certificate chain it presents to peers.
pub struct KeyIdentity {
    alias: String,
    key: PrivateKeyDer<'static>,
    chain: Vec<CertificateDer<'static>>,
}

impl KeyIdentity {
    pub fn new(
        alias: impl Into<String>,
        key: PrivateKeyDer<'static>,
        chain: Vec<CertificateDer<'static>>,
    ) -> Self {
        Self {
            alias: alias.into(),
            key,
            chain,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }
}

impl Clone for KeyIdentity {
    fn clone(&self) -> Self {
        Self {
            alias: self.alias.clone(),
            key: self.key.clone_key(),
            chain: self.chain.clone(),
        }
    }
}

impl std::fmt::Debug for KeyIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyIdentity")
            .field("alias", &self.alias)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Validated key and trust material. Either half may be absent.
#[derive(Debug, Clone, Default)]
pub struct TrustMaterial {
    identity: Option<KeyIdentity>,
    trust_root: Option<CertificateDer<'static>>,
}

impl TrustMaterial {
    pub fn new(identity: Option<KeyIdentity>, trust_root: Option<CertificateDer<'static>>) -> Self {
        Self {
            identity,
            trust_root,
        }
    }

    pub fn identity(&self) -> Option<&KeyIdentity> {
        self.identity.as_ref()
    }

    pub fn trust_root(&self) -> Option<&CertificateDer<'static>> {
        self.trust_root.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.identity.is_none() && self.trust_root.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.identity.is_some() && self.trust_root.is_some()
    }
}

/// Loads [`TrustMaterial`] through a [`CertificateStore`].
///
/// Every setting is validated for shape before any store is opened, so a
/// misconfiguration is reported ahead of I/O errors.
pub struct TrustMaterialLoader<S = JsonKeyStore> {
    store: S,
}

impl TrustMaterialLoader<JsonKeyStore> {
    pub fn new() -> Self {
        Self {
            store: JsonKeyStore,
        }
    }
}

impl Default for TrustMaterialLoader<JsonKeyStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: CertificateStore> TrustMaterialLoader<S> {
    pub fn with_store(store: S) -> Self {
        Self { store }
    }

    pub fn load_settings(&self, settings: &StoreSettings) -> Result<TrustMaterial> {
        self.load(
            settings.key_store_location.as_deref(),
            settings.key_store_password.as_deref(),
            settings.trust_store_location.as_deref(),
            settings.trust_store_password.as_deref(),
            settings.trust_store_ca_alias.as_deref(),
        )
    }

    pub fn load(
        &self,
        key_location: Option<&str>,
        key_password: Option<&str>,
        trust_location: Option<&str>,
        trust_password: Option<&str>,
        trust_alias: Option<&str>,
    ) -> Result<TrustMaterial> {
        let key_store = validate_store_args("key store", key_location, key_password)?;
        let trust_store = validate_store_args("trust store", trust_location, trust_password)?;

        let trust_alias = match (&trust_store, trust_alias) {
            (Some(_), Some(alias)) if !alias.is_empty() => Some(alias),
            (Some((location, _)), _) => {
                let msg = format!("failed to create trust manager, no alias for: {}", location);
                error!("{}", msg);
                return Err(QuorumError::TrustConfiguration(msg));
            }
            (None, _) => None,
        };

        let identity = match key_store {
            Some((location, password)) => Some(self.load_identity(location, password)?),
            None => {
                warn!("key store not specified, no identity will be presented");
                None
            }
        };

        let trust_root = match (trust_store, trust_alias) {
            (Some((location, password)), Some(alias)) => {
                Some(self.load_trust_root(location, password, alias)?)
            }
            _ => {
                warn!("trust store not specified, no trust root configured");
                None
            }
        };

        Ok(TrustMaterial::new(identity, trust_root))
    }

    fn load_identity(&self, location: &str, password: &str) -> Result<KeyIdentity> {
        info!("Key store location: {}", location);
        let entries = self.store.open(location, password)?;

        let mut keys = entries.into_iter().filter_map(|entry| match entry {
            StoreEntry::PrivateKey {
                alias,
                key_pem,
                chain_pem,
            } => Some((alias, key_pem, chain_pem)),
            StoreEntry::TrustedCertificate { .. } => None,
        });

        let (alias, key_pem, chain_pem) = keys.next().ok_or_else(|| {
            let msg = format!("key store contains no private key entry: {}", location);
            error!("{}", msg);
            QuorumError::TrustConfiguration(msg)
        })?;
        let extra = keys.count();
        if extra > 0 {
            let msg = format!(
                "Keystore should contain only one key, found: {} for: {}",
                extra + 1,
                location
            );
            error!("{}", msg);
            return Err(QuorumError::TrustConfiguration(msg));
        }

        let key = parse_private_key(location, &key_pem)?;
        let chain = parse_certificates(location, &chain_pem)?;
        info!(
            "Loaded private key '{}' with {} certificate(s) from {}",
            alias,
            chain.len(),
            location
        );

        Ok(KeyIdentity { alias, key, chain })
    }

    fn load_trust_root(
        &self,
        location: &str,
        password: &str,
        alias: &str,
    ) -> Result<CertificateDer<'static>> {
        info!("Trust store location: {}", location);
        let entries = self.store.open(location, password)?;

        let entry = entries
            .iter()
            .find(|entry| entry.alias().eq_ignore_ascii_case(alias))
            .ok_or_else(|| {
                let msg = format!(
                    "failed to find root CA from: {} with alias: {}",
                    location, alias
                );
                error!("{}", msg);
                QuorumError::TrustConfiguration(msg)
            })?;

        let root = parse_certificates(location, entry.certificate_pem())?
            .into_iter()
            .next()
            .ok_or_else(|| {
                QuorumError::TrustConfiguration(format!(
                    "alias {} in {} holds no certificate",
                    alias, location
                ))
            })?;

        info!("Loaded root CA '{}' from {}", alias, location);
        Ok(root)
    }
}

/// Both-or-neither: a location without a password, a password without a
/// location, or an empty password are configuration errors.
fn validate_store_args<'a>(
    what: &str,
    location: Option<&'a str>,
    password: Option<&'a str>,
) -> Result<Option<(&'a str, &'a str)>> {
    match (location, password) {
        (None, None) => Ok(None),
        (None, Some(_)) => Err(QuorumError::TrustConfiguration(format!(
            "{} location not specified",
            what
        ))),
        (Some(location), None) => Err(QuorumError::TrustConfiguration(format!(
            "{} password not specified for: {}",
            what, location
        ))),
        (Some(location), Some("")) => Err(QuorumError::TrustConfiguration(format!(
            "{} password is empty for: {}",
            what, location
        ))),
        (Some(location), Some(password)) => Ok(Some((location, password))),
    }
}

fn parse_private_key(location: &str, pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = pem.as_bytes();
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| QuorumError::KeyStore {
            location: location.to_string(),
            reason: format!("failed to parse private key: {}", e),
        })?
        .ok_or_else(|| QuorumError::KeyStore {
            location: location.to_string(),
            reason: "no valid private key found in key entry".to_string(),
        })
}

fn parse_certificates(location: &str, pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| QuorumError::KeyStore {
            location: location.to_string(),
            reason: format!("failed to parse certificates: {}", e),
        })?;

    if certs.is_empty() {
        return Err(QuorumError::KeyStore {
            location: location.to_string(),
            reason: "no certificates found".to_string(),
        });
    }

    Ok(certs)
}
