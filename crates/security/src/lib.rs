//! Key material and TLS setup for quorum connections.
//!
//! # Overview
//!
//! - [`TrustMaterialLoader`] opens the key store and trust store through a
//!   [`CertificateStore`] and validates what it finds.
//! - [`SecureChannelContext`] turns that material into rustls client and server
//!   configurations with mandatory mutual authentication.
//! - [`TestCertificateAuthority`] writes throwaway clusters of key stores for
//!   local topologies and tests.
//!
//! # Example
//!
//! ```no_run
//! use quorum_security::{SecureChannelContext, StoreSettings, TrustMaterialLoader};
//!
//! # fn main() -> quorum_types::Result<()> {
//! let settings = StoreSettings {
//!     key_store_location: Some("certs/node1.ks".to_string()),
//!     key_store_password: Some("StorePass".to_string()),
//!     trust_store_location: Some("certs/truststore.ks".to_string()),
//!     trust_store_password: Some("StorePass".to_string()),
//!     trust_store_ca_alias: Some("ca".to_string()),
//! };
//!
//! let material = TrustMaterialLoader::new().load_settings(&settings)?;
//! let context = SecureChannelContext::build(material, "TLSv1.2")?;
//! # let _ = context;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod identity;
pub mod keystore;
pub mod test_ca;
pub mod trust;

pub use context::{ChannelMode, ProtocolVersion, SecureChannelContext, DEFAULT_PROTOCOL_VERSION};
pub use identity::{common_name, peer_id_from_certificate};
pub use keystore::{CertificateStore, JsonKeyStore, KeyStoreWriter, StoreEntry};
pub use test_ca::{ClusterPaths, IssuedCertificate, TestCertificateAuthority, DEFAULT_CA_ALIAS};
pub use trust::{KeyIdentity, StoreSettings, TrustMaterial, TrustMaterialLoader};
