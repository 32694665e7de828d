//! TLS configuration shared by every quorum connection of a node.
//!
//! A [`SecureChannelContext`] is built once from [`TrustMaterial`] and mints both
//! the client side and the server side configuration, so a peer presents the same
//! certificate whether it dials or accepts.
//!
//! Peers are addressed by id and IP, so server names are never matched against
//! certificates. Chain, validity period and signatures are verified against the
//! configured root in both directions.

use quorum_types::{QuorumError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    SupportedProtocolVersion,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::trust::{KeyIdentity, TrustMaterial};

/// Protocol version used when none is configured.
pub const DEFAULT_PROTOCOL_VERSION: &str = "TLSv1";

/// The lowest TLS version a node is willing to speak.
///
/// TLS 1.0 and 1.1 are not implemented by rustls, so those names raise the
/// floor to TLS 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    Tls12AndUp,
    Tls13Only,
}

impl ProtocolVersion {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "TLS" | "TLSv1" | "TLSv1.1" | "TLSv1.2" => Ok(ProtocolVersion::Tls12AndUp),
            "TLSv1.3" => Ok(ProtocolVersion::Tls13Only),
            other => Err(QuorumError::ChannelConfiguration(format!(
                "unsupported protocol version: '{}'",
                other
            ))),
        }
    }

    pub fn supported_versions(&self) -> &'static [&'static SupportedProtocolVersion] {
        static TLS12_AND_UP: &[&SupportedProtocolVersion] =
            &[&rustls::version::TLS13, &rustls::version::TLS12];
        static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

        match self {
            ProtocolVersion::Tls12AndUp => TLS12_AND_UP,
            ProtocolVersion::Tls13Only => TLS13_ONLY,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Tls12AndUp => write!(f, "TLSv1.2+"),
            ProtocolVersion::Tls13Only => write!(f, "TLSv1.3"),
        }
    }
}

/// Immutable client and server TLS configuration for one node.
pub struct SecureChannelContext {
    protocol: ProtocolVersion,
    client_config: Arc<ClientConfig>,
    server_config: Arc<ServerConfig>,
    identity_alias: String,
}

impl SecureChannelContext {
    /// Build both configurations from `material`.
    ///
    /// # Errors
    /// Returns [`QuorumError::ChannelConfiguration`] if the protocol version is
    /// unsupported, if either half of the material is missing, or if rustls
    /// rejects the key or the root certificate.
    pub fn build(material: TrustMaterial, protocol_version: &str) -> Result<Self> {
        let protocol = ProtocolVersion::parse(protocol_version)?;

        let (identity, root) = match (material.identity(), material.trust_root()) {
            (Some(identity), Some(root)) => (identity, root),
            (None, None) => {
                return Err(QuorumError::ChannelConfiguration(
                    "no key or trust material configured; use plaintext mode explicitly"
                        .to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(QuorumError::ChannelConfiguration(
                    "mutual TLS requires a key store, only a trust store was configured"
                        .to_string(),
                ))
            }
            (Some(_), None) => {
                return Err(QuorumError::ChannelConfiguration(
                    "mutual TLS requires a trust store, only a key store was configured"
                        .to_string(),
                ))
            }
        };

        info!("Building mTLS channel context ({})", protocol);

        let provider = Arc::new(ring::default_provider());

        let mut root_store = RootCertStore::empty();
        root_store.add(root.clone()).map_err(|e| {
            error!("Failed to add CA certificate to root store: {}", e);
            channel_error("failed to add root certificate", e)
        })?;
        let root_store = Arc::new(root_store);

        let server_config = build_server_config(identity, &root_store, &provider, protocol)?;
        let client_config = build_client_config(identity, &root_store, &provider, protocol)?;

        info!(
            "mTLS channel context ready, presenting '{}' with {} certificate(s)",
            identity.alias(),
            identity.cert_chain().len()
        );

        Ok(Self {
            protocol,
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
            identity_alias: identity.alias().to_string(),
        })
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.client_config)
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// Alias of the key entry this node presents.
    pub fn identity_alias(&self) -> &str {
        &self.identity_alias
    }
}

impl fmt::Debug for SecureChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannelContext")
            .field("protocol", &self.protocol)
            .field("identity_alias", &self.identity_alias)
            .finish_non_exhaustive()
    }
}

/// How quorum sockets are secured. Plaintext has to be asked for; it is never
/// what a failed TLS setup degrades to.
#[derive(Debug, Clone)]
pub enum ChannelMode {
    Tls(Arc<SecureChannelContext>),
    Plaintext,
}

impl ChannelMode {
    pub fn is_tls(&self) -> bool {
        matches!(self, ChannelMode::Tls(_))
    }
}

fn channel_error(what: &str, e: impl fmt::Display) -> QuorumError {
    QuorumError::ChannelConfiguration(format!("{}: {}", what, e))
}

fn build_server_config(
    identity: &KeyIdentity,
    roots: &Arc<RootCertStore>,
    provider: &Arc<CryptoProvider>,
    protocol: ProtocolVersion,
) -> Result<ServerConfig> {
    // Client certificates are mandatory.
    let client_verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::clone(roots), Arc::clone(provider))
            .build()
            .map_err(|e| channel_error("failed to build client verifier", e))?;

    let config = ServerConfig::builder_with_provider(Arc::clone(provider))
        .with_protocol_versions(protocol.supported_versions())
        .map_err(|e| channel_error("unsupported protocol versions", e))?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(identity.cert_chain().to_vec(), identity.private_key().clone_key())
        .map_err(|e| {
            error!("Failed to build server config: {}", e);
            channel_error("failed to initialize server key material", e)
        })?;

    debug!("Server config created");
    Ok(config)
}

fn build_client_config(
    identity: &KeyIdentity,
    roots: &Arc<RootCertStore>,
    provider: &Arc<CryptoProvider>,
    protocol: ProtocolVersion,
) -> Result<ClientConfig> {
    let verifier = Arc::new(QuorumServerVerifier {
        roots: Arc::clone(roots),
        provider: Arc::clone(provider),
    });

    let config = ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_protocol_versions(protocol.supported_versions())
        .map_err(|e| channel_error("unsupported protocol versions", e))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(identity.cert_chain().to_vec(), identity.private_key().clone_key())
        .map_err(|e| {
            error!("Failed to build client config: {}", e);
            channel_error("failed to initialize client key material", e)
        })?;

    debug!("Client config created");
    Ok(config)
}

/// Verifies the server chain against the quorum root without matching the
/// server name.
#[derive(Debug)]
struct QuorumServerVerifier {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for QuorumServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;

        debug!("Server certificate chain verified (server name not checked)");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
