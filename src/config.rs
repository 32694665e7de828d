use quorum_backoff::BackoffConfig;
use quorum_security::{ProtocolVersion, StoreSettings, DEFAULT_PROTOCOL_VERSION};
use quorum_types::{PeerId, QuorumError, QuorumPeerAddress, Result, MAX_PEER_PORT};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "config/default.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub tls: TlsConfig,
    pub peers: Vec<PeerConfig>,
    pub backoff: BackoffConfig,
    /// Bound on TCP connect plus handshake for outbound links. 0 disables it.
    pub connect_timeout_ms: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: u64,
    pub listen_port: u16,
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub protocol_version: String,
    pub key_store_location: Option<String>,
    pub key_store_password: Option<String>,
    pub trust_store_location: Option<String>,
    pub trust_store_password: Option<String>,
    pub trust_store_ca_alias: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: u64,
    pub address: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            tls: TlsConfig::default(),
            peers: vec![],
            backoff: BackoffConfig::default(),
            connect_timeout_ms: 5_000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            listen_port: 2888,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            key_store_location: None,
            key_store_password: None,
            trust_store_location: None,
            trust_store_password: None,
            trust_store_ca_alias: None,
        }
    }
}

impl TlsConfig {
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            key_store_location: self.key_store_location.clone(),
            key_store_password: self.key_store_password.clone(),
            trust_store_location: self.trust_store_location.clone(),
            trust_store_password: self.trust_store_password.clone(),
            trust_store_ca_alias: self.trust_store_ca_alias.clone(),
        }
    }
}

fn config_error(msg: impl Into<String>) -> QuorumError {
    QuorumError::Config(msg.into())
}

impl AppConfig {
    /// Defaults, then the config file (explicit path, or `config/default.toml`
    /// if it exists), then environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_string()),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Some(DEFAULT_CONFIG_FILE.to_string()),
            None => None,
        };

        let mut app_config = match file {
            Some(file) => Self::from_file(&file)?,
            None => AppConfig::default(),
        };

        app_config.override_from_env()?;
        Ok(app_config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(|e| config_error(format!("Failed to load config file {}: {}", path, e)))?;

        settings
            .try_deserialize::<AppConfig>()
            .map_err(|e| config_error(format!("Invalid config file {}: {}", path, e)))
    }

    fn override_from_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `QUORUM_*` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("QUORUM_NODE_ID") {
            self.node.id = id
                .parse()
                .map_err(|e| config_error(format!("Invalid QUORUM_NODE_ID: {}", e)))?;
        }

        if let Some(port) = lookup("QUORUM_LISTEN_PORT") {
            self.node.listen_port = port
                .parse()
                .map_err(|e| config_error(format!("Invalid QUORUM_LISTEN_PORT: {}", e)))?;
        }

        if let Some(bind_address) = lookup("QUORUM_BIND_ADDRESS") {
            self.node.bind_address = bind_address;
        }

        if let Some(peers) = lookup("QUORUM_PEERS") {
            if !peers.trim().is_empty() {
                self.peers = parse_peer_list(&peers)?;
            }
        }

        if let Some(enabled) = lookup("QUORUM_TLS_ENABLED") {
            self.tls.enabled = enabled
                .parse()
                .map_err(|e| config_error(format!("Invalid QUORUM_TLS_ENABLED: {}", e)))?;
        }

        if let Some(version) = lookup("QUORUM_SSL_VERSION") {
            self.tls.protocol_version = version;
        }

        if let Some(location) = lookup("QUORUM_SSL_KEYSTORE_LOCATION") {
            self.tls.key_store_location = Some(location);
        }

        if let Some(password) = lookup("QUORUM_SSL_KEYSTORE_PASSWORD") {
            self.tls.key_store_password = Some(password);
        }

        if let Some(location) = lookup("QUORUM_SSL_TRUSTSTORE_LOCATION") {
            self.tls.trust_store_location = Some(location);
        }

        if let Some(password) = lookup("QUORUM_SSL_TRUSTSTORE_PASSWORD") {
            self.tls.trust_store_password = Some(password);
        }

        if let Some(alias) = lookup("QUORUM_SSL_TRUSTSTORE_CA_ALIAS") {
            self.tls.trust_store_ca_alias = Some(alias);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(config_error("node.id cannot be 0"));
        }

        if self.node.listen_port == 0 {
            return Err(config_error(
                "node.listen_port cannot be 0, peers must be able to address this node",
            ));
        }

        if self.node.listen_port > MAX_PEER_PORT {
            return Err(config_error(format!(
                "node.listen_port {} exceeds {}",
                self.node.listen_port, MAX_PEER_PORT
            )));
        }

        self.bind_address()?;

        if self.tls.enabled {
            ProtocolVersion::parse(&self.tls.protocol_version)?;
        }

        self.backoff.validate()?;

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id) {
                return Err(config_error(format!("duplicate peer id {}", peer.id)));
            }
        }
        self.peer_addresses()?;

        Ok(())
    }

    pub fn node_id(&self) -> PeerId {
        PeerId(self.node.id)
    }

    pub fn bind_address(&self) -> Result<IpAddr> {
        self.node
            .bind_address
            .parse()
            .map_err(|e| config_error(format!("Invalid node.bind_address: {}", e)))
    }

    /// Resolved addresses of every other quorum member.
    pub fn peer_addresses(&self) -> Result<Vec<QuorumPeerAddress>> {
        self.peers
            .iter()
            .filter(|peer| peer.id != self.node.id)
            .map(|peer| QuorumPeerAddress::parse(peer.id, &peer.address))
            .collect()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }
}

/// Parse `id=host:port,id=host:port`.
fn parse_peer_list(list: &str) -> Result<Vec<PeerConfig>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, address) = entry
                .split_once('=')
                .ok_or_else(|| config_error(format!("Invalid peer entry '{}', expected id=host:port", entry)))?;
            let id = id
                .trim()
                .parse()
                .map_err(|e| config_error(format!("Invalid peer id in '{}': {}", entry, e)))?;
            Ok(PeerConfig {
                id,
                address: address.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_backoff::BackoffStrategy;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.tls.enabled);
        assert_eq!(config.tls.protocol_version, "TLSv1");
        assert_eq!(config.connect_timeout(), Some(Duration::from_millis(5_000)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(lookup(&[
                ("QUORUM_NODE_ID", "3"),
                ("QUORUM_LISTEN_PORT", "3888"),
                ("QUORUM_PEERS", "1=127.0.0.1:2888, 2=127.0.0.1:2889,3=127.0.0.1:2890"),
                ("QUORUM_SSL_VERSION", "TLSv1.3"),
                ("QUORUM_SSL_KEYSTORE_LOCATION", "certs/node3.ks"),
                ("QUORUM_SSL_KEYSTORE_PASSWORD", "StorePass"),
                ("QUORUM_SSL_TRUSTSTORE_CA_ALIAS", "ca"),
            ]))
            .unwrap();

        assert_eq!(config.node_id(), PeerId(3));
        assert_eq!(config.node.listen_port, 3888);
        assert_eq!(config.peers.len(), 3);
        assert_eq!(config.tls.protocol_version, "TLSv1.3");

        let settings = config.tls.store_settings();
        assert_eq!(settings.key_store_location.as_deref(), Some("certs/node3.ks"));
        assert_eq!(settings.trust_store_ca_alias.as_deref(), Some("ca"));

        // Self is skipped.
        let peers = config.peer_addresses().unwrap();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|p| p.id() != PeerId(3)));
    }

    #[test]
    fn test_invalid_env_values() {
        let mut config = AppConfig::default();
        assert!(config
            .apply_overrides(lookup(&[("QUORUM_NODE_ID", "abc")]))
            .is_err());
        assert!(config
            .apply_overrides(lookup(&[("QUORUM_PEERS", "127.0.0.1:2888")]))
            .is_err());
        assert!(config
            .apply_overrides(lookup(&[("QUORUM_TLS_ENABLED", "maybe")]))
            .is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::default();
        config.node.id = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.node.listen_port = 40000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.node.listen_port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.node.bind_address = "not-an-ip".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.tls.protocol_version = "SSLv3".to_string();
        assert!(config.validate().is_err());
        config.tls.enabled = false;
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.backoff.initial_delay_ms = -1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.peers = vec![
            PeerConfig {
                id: 2,
                address: "127.0.0.1:2888".to_string(),
            },
            PeerConfig {
                id: 2,
                address: "127.0.0.1:2889".to_string(),
            },
        ];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.peers = vec![PeerConfig {
            id: 2,
            address: "127.0.0.1:65000".to_string(),
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
log_level = "debug"
log_format = "json"
connect_timeout_ms = 0

[node]
id = 2
listen_port = 2889

[tls]
enabled = false

[[peers]]
id = 1
address = "127.0.0.1:2888"

[backoff]
strategy = "exponential"
initial_delay_ms = 50
max_delay_ms = 1000
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.node.id, 2);
        assert_eq!(config.node.bind_address, "0.0.0.0");
        assert!(!config.tls.enabled);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.connect_timeout(), None);
        assert_eq!(config.backoff.strategy, BackoffStrategy::Exponential);
        assert_eq!(config.backoff.exponent_base, 2);
        assert_eq!(config.peers.len(), 1);
        assert!(config.validate().is_ok());
    }
}
