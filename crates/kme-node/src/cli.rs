use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::client::DEFAULT_GRACE_PERIOD;

#[derive(Parser)]
#[command(name = "kme-node", about = "QKD Key Management Entity with an ETSI 014 style API")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a KME node
    Run {
        /// Node configuration (TOML)
        #[arg(long, short)]
        config: PathBuf,
        /// Override the configured listen address
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Override the configured log level
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Show the status of the link to a slave SAE
    Status {
        /// Base URL of the KME
        #[arg(long, default_value = "http://127.0.0.1:8001")]
        url: String,
        /// Calling SAE
        #[arg(long)]
        sae_id: Option<String>,
        /// Slave SAE
        slave: String,
    },
    /// Request encryption keys for a slave SAE
    Enc {
        /// Base URL of the KME
        #[arg(long, default_value = "http://127.0.0.1:8001")]
        url: String,
        /// Calling (master) SAE
        #[arg(long)]
        sae_id: Option<String>,
        /// Slave SAE
        slave: String,
        /// Number of keys
        #[arg(long, short)]
        number: Option<usize>,
        /// Key size in bits
        #[arg(long, short)]
        size: Option<usize>,
        /// Sender address recorded with the keys
        #[arg(long)]
        sender_email: Option<String>,
        /// Receiver address recorded with the keys
        #[arg(long)]
        receiver_email: Option<String>,
    },
    /// Retrieve decryption keys issued by a master SAE
    Dec {
        /// Base URL of the KME
        #[arg(long, default_value = "http://127.0.0.1:8002")]
        url: String,
        /// Calling (slave) SAE
        #[arg(long)]
        sae_id: Option<String>,
        /// Master SAE
        master: String,
        /// Key IDs to retrieve
        #[arg(long = "key-id", required = true)]
        key_ids: Vec<String>,
        /// Receiver address checked against the keys
        #[arg(long)]
        receiver_email: Option<String>,
        /// How long to retry keys that have not arrived yet, in milliseconds
        #[arg(long, default_value_t = DEFAULT_GRACE_PERIOD.as_millis() as u64)]
        grace_ms: u64,
    },
}
