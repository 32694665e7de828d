use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "quorum-link")]
#[command(version, about = "Authenticated mTLS links between quorum peers", long_about = None)]
#[command(author = "Quorum Link Team")]
pub struct Cli {
    /// Configuration file (defaults to config/default.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node: listen for peers and keep a link to every configured peer (default mode)
    Run,

    /// Validate configuration and key material without touching the network
    Check,

    /// Generate a test CA trust store and one key store per node
    GenCerts {
        #[arg(short, long, default_value = "certs", help = "Output directory")]
        out: PathBuf,

        #[arg(short, long, default_value = "3", help = "Number of nodes")]
        nodes: u64,

        #[arg(short, long, help = "Password protecting every generated store")]
        password: String,
    },

    /// Make a single connection attempt to a peer and report the outcome
    Probe {
        #[arg(short, long, help = "Peer address as host:port")]
        peer: String,
    },
}
