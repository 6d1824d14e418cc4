use std::time::Duration;

use clap::Parser;
use kme_logging::KmeSubscriberBuilder;
use kme_node::api::types::EncKeysRequest;
use kme_node::cli::{Cli, Command};
use kme_node::{KmeClient, KmeNode, NodeConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            listen,
            log_level,
        } => {
            let mut config = NodeConfig::from_toml_file(&config)?;
            if let Some(addr) = listen {
                config.listen_addr = addr;
            }

            let mut logging = KmeSubscriberBuilder::new().with_config(config.logging.clone());
            if let Some(level) = log_level {
                logging = logging.with_level(level);
            }
            let _guard = logging.init()?;

            let node = KmeNode::new(config)?;
            node.start().await?;

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            node.stop().await?;
        }

        Command::Status { url, sae_id, slave } => {
            let status = client(url, sae_id)?.status(&slave).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Command::Enc {
            url,
            sae_id,
            slave,
            number,
            size,
            sender_email,
            receiver_email,
        } => {
            let request = EncKeysRequest { number, size };
            let response = client(url, sae_id)?
                .enc_keys(
                    &slave,
                    &request,
                    sender_email.as_deref(),
                    receiver_email.as_deref(),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Command::Dec {
            url,
            sae_id,
            master,
            key_ids,
            receiver_email,
            grace_ms,
        } => {
            let response = client(url, sae_id)?
                .dec_keys_with_retry(
                    &master,
                    &key_ids,
                    receiver_email.as_deref(),
                    Duration::from_millis(grace_ms),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}

fn client(url: String, sae_id: Option<String>) -> anyhow::Result<KmeClient> {
    let client = KmeClient::new(url)?;
    Ok(match sae_id {
        Some(sae_id) => client.with_sae_id(sae_id),
        None => client,
    })
}
