use anyhow::Context;
use quorum_network::{Connection, ListenerHandle, PeerReconnector, QuorumSocketFactory};
use quorum_security::{
    ChannelMode, SecureChannelContext, TestCertificateAuthority, TrustMaterialLoader,
};
use quorum_types::{ErrorKind, QuorumPeerAddress};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;

/// Build the channel mode the config asks for. Plaintext only when TLS is
/// explicitly disabled.
pub fn channel_mode(config: &AppConfig) -> anyhow::Result<ChannelMode> {
    if !config.tls.enabled {
        warn!("TLS disabled, quorum links will be plaintext");
        return Ok(ChannelMode::Plaintext);
    }

    let material = TrustMaterialLoader::new()
        .load_settings(&config.tls.store_settings())
        .context("Failed to load trust material")?;
    let context = SecureChannelContext::build(material, &config.tls.protocol_version)
        .context("Failed to build TLS context")?;
    Ok(ChannelMode::Tls(Arc::new(context)))
}

pub async fn run_node(config: AppConfig) -> anyhow::Result<()> {
    config.validate()?;
    info!("Starting quorum node {}", config.node_id());

    let factory = QuorumSocketFactory::new(channel_mode(&config)?);
    let listener = factory
        .build_for_server(config.node.listen_port, config.bind_address()?)
        .await?;

    let mut tasks = JoinSet::new();
    tasks.spawn(accept_loop(listener, config.node.id));

    let mut connector = factory.build_for_client();
    if let Some(timeout) = config.connect_timeout() {
        connector = connector.with_connect_timeout(timeout);
    }

    for peer in config.peer_addresses()? {
        let reconnector = PeerReconnector::new(connector.clone(), peer, config.backoff.build()?);
        tasks.spawn(maintain_link(reconnector, config.node.id));
    }

    info!("Node {} running, press Ctrl+C to stop", config.node_id());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    tasks.shutdown().await;
    Ok(())
}

async fn accept_loop(listener: ListenerHandle, node_id: u64) {
    let mut connections = JoinSet::new();
    loop {
        match listener.accept().outcome().await {
            Ok(connection) => {
                connections.spawn(drain_inbound(connection, node_id));
            }
            Err(e) if matches!(e.kind(), ErrorKind::Handshake | ErrorKind::Transport) => {
                warn!("Rejected incoming connection: {}", e);
            }
            Err(e) => {
                error!("Listener on {} stopped: {}", listener.local_addr(), e);
                return;
            }
        }
    }
}

/// Greet an inbound peer, then log whatever it sends until it closes.
async fn drain_inbound(connection: Connection, node_id: u64) {
    let who = connection
        .peer_common_name()
        .unwrap_or_else(|| connection.peer().to_string());

    if let Err(e) = connection.write(greeting(node_id)).outcome().await {
        warn!("Failed to greet {}: {}", who, e);
        return;
    }

    loop {
        match connection.read().outcome().await {
            Ok(bytes) if bytes.is_empty() => {
                info!("{} closed the connection", who);
                return;
            }
            Ok(bytes) => {
                info!(
                    "Received {} bytes from {}: {}",
                    bytes.len(),
                    who,
                    String::from_utf8_lossy(&bytes).trim_end()
                );
            }
            Err(e) => {
                warn!("Connection from {} failed: {}", who, e);
                return;
            }
        }
    }
}

fn greeting(node_id: u64) -> String {
    format!("hello from server.{}\n", node_id)
}

/// Keep one outbound link alive. Ends only on a failure retrying cannot fix.
async fn maintain_link(mut reconnector: PeerReconnector, node_id: u64) {
    loop {
        let connection = match reconnector.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Link to {} abandoned: {}", reconnector.peer(), e);
                return;
            }
        };

        let carried_data = hold_link(&connection, reconnector.peer(), node_id).await;
        drop(connection);
        reconnector.link_lost(carried_data).await;
    }
}

/// Greet the peer and read until the link goes away. Returns whether the
/// peer sent anything.
async fn hold_link(connection: &Connection, peer: &QuorumPeerAddress, node_id: u64) -> bool {
    if let Err(e) = connection.write(greeting(node_id)).outcome().await {
        warn!("Failed to greet {}: {}", peer, e);
        return false;
    }

    let mut carried_data = false;
    loop {
        match connection.read().outcome().await {
            Ok(bytes) if bytes.is_empty() => return carried_data,
            Ok(bytes) => {
                carried_data = true;
                debug!("{} bytes from {}", bytes.len(), peer);
            }
            Err(e) => {
                warn!("Link to {} lost: {}", peer, e);
                return carried_data;
            }
        }
    }
}

pub fn check(config: &AppConfig) -> anyhow::Result<()> {
    config.validate()?;
    let mode = channel_mode(config)?;

    println!("\nNode Configuration");
    println!("─────────────────────────────────────");
    println!("  Node ID:     {}", config.node_id());
    println!("  Listen:      {}:{}", config.node.bind_address, config.node.listen_port);
    match &mode {
        ChannelMode::Tls(context) => {
            println!("  Security:    mTLS ({})", context.protocol());
            println!("  Identity:    {}", context.identity_alias());
        }
        ChannelMode::Plaintext => println!("  Security:    plaintext"),
    }
    println!("  Backoff:     {}", config.backoff.strategy);

    println!("\nPeers");
    println!("─────────────────────────────────────");
    for peer in config.peer_addresses()? {
        println!("  {}", peer);
    }
    Ok(())
}

pub fn generate_certificates(out: &Path, nodes: u64, password: &str) -> anyhow::Result<()> {
    if nodes == 0 {
        anyhow::bail!("--nodes must be at least 1");
    }

    std::fs::create_dir_all(out)
        .with_context(|| format!("Failed to create output directory {}", out.display()))?;

    let ca = TestCertificateAuthority::generate("Quorum Link Test CA")?;
    let paths = ca.write_cluster(out, nodes, password)?;

    println!("\nGenerated test certificates");
    println!("─────────────────────────────────────");
    println!("  Trust store: {}", paths.truststore.display());
    for keystore in &paths.keystores {
        println!("  Key store:   {}", keystore.display());
    }
    Ok(())
}

pub async fn probe(config: &AppConfig, peer: &str) -> anyhow::Result<()> {
    let address = QuorumPeerAddress::parse(0, peer)?;
    let factory = QuorumSocketFactory::new(channel_mode(config)?);

    let mut connector = factory.build_for_client();
    if let Some(timeout) = config.connect_timeout() {
        connector = connector.with_connect_timeout(timeout);
    }

    match connector.connect(&address).outcome().await {
        Ok(connection) => {
            println!(
                "Connected to {} ({}, peer: {})",
                connection.peer_addr(),
                if connection.is_encrypted() { "mTLS" } else { "plaintext" },
                connection
                    .peer_common_name()
                    .unwrap_or_else(|| "unauthenticated".to_string())
            );
            if let Err(e) = connection.shutdown().outcome().await {
                debug!("Shutdown of connection to {} failed: {}", peer, e);
            }
            Ok(())
        }
        Err(e) => {
            println!("Connection to {} failed [{}]: {}", peer, e.kind(), e);
            Err(e.into())
        }
    }
}
