//! Veilgate CLI
//!
//! One binary, one subcommand per role: `relay`, `exit`, `proxy`, plus
//! `keygen` for the exit's OHTTP keypair. Flags only; every subcommand
//! runs until ctrl-c.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Parser, Subcommand};
use tracing::info;

use veilgate_client::{Client, LocalProxy, ProxyConfig};
use veilgate_crypto::decode_key_config_b64;
use veilgate_exit::{ExitConfig, ExitNode, TunnelConfig};
use veilgate_keystore::{expand_path, load_or_generate, save_keypair};
use veilgate_logging::LogLevel;
use veilgate_relay::{RelayConfig, RelayNode};

/// Veilgate - decentralized privacy gateway for AI inference backends
#[derive(Parser)]
#[command(name = "veilgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay node
    Relay {
        /// QUIC listen address
        #[arg(long, default_value = "0.0.0.0:4433")]
        listen: SocketAddr,

        /// Heartbeat TTL in seconds; silent exits are evicted after this
        #[arg(long, default_value = "60")]
        heartbeat_ttl: u64,
    },

    /// Run an exit node tunneling to a relay
    Exit {
        /// Relay address to dial
        #[arg(long)]
        relay: String,

        /// AI backend base URL, e.g. https://api.openai.com
        #[arg(long)]
        backend_url: String,

        /// API key injected as a bearer token
        #[arg(long)]
        api_key: Option<String>,

        /// Extra header in NAME=VALUE form; repeatable. Replaces matching
        /// incoming headers and suppresses API-key injection
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// OHTTP private key file (generated on first run)
        #[arg(long, default_value = "~/.veilgate/ohttp.key")]
        key_file: PathBuf,
    },

    /// Run the local encrypting proxy
    Proxy {
        /// Local HTTP listen address
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: SocketAddr,

        /// Relay address to dial
        #[arg(long)]
        relay: String,

        /// Pin a specific exit by its base64 KeyConfig; omitted, the
        /// proxy asks the relay for live exits and picks one
        #[arg(long)]
        exit_key: Option<String>,
    },

    /// Generate an OHTTP keypair for an exit
    Keygen {
        /// Private key output path
        #[arg(long, default_value = "~/.veilgate/ohttp.key")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    veilgate_logging::init(LogLevel::from_verbose(cli.verbose));

    match cli.command {
        Commands::Relay {
            listen,
            heartbeat_ttl,
        } => run_relay(listen, heartbeat_ttl).await,
        Commands::Exit {
            relay,
            backend_url,
            api_key,
            headers,
            key_file,
        } => run_exit(relay, backend_url, api_key, headers, key_file).await,
        Commands::Proxy {
            listen,
            relay,
            exit_key,
        } => run_proxy(listen, relay, exit_key).await,
        Commands::Keygen { out } => run_keygen(out),
    }
}

async fn run_relay(listen: SocketAddr, heartbeat_ttl: u64) -> Result<()> {
    let node = RelayNode::new(RelayConfig {
        listen,
        heartbeat_ttl: Duration::from_secs(heartbeat_ttl),
        ..Default::default()
    });
    node.start().await.context("starting relay")?;
    node.ready().await;
    info!("relay ready");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    node.stop().await;
    Ok(())
}

async fn run_exit(
    relay: String,
    backend_url: String,
    api_key: Option<String>,
    headers: Vec<(String, String)>,
    key_file: PathBuf,
) -> Result<()> {
    let keys = load_or_generate(&expand_path(&key_file)).context("loading OHTTP keypair")?;
    info!("exit pub_key_hash: {}", keys.pub_key_hash());

    let node = ExitNode::new(
        ExitConfig {
            relay_addr: relay,
            backend_url,
            api_key,
            headers: headers.into_iter().collect::<HashMap<_, _>>(),
            tunnel: TunnelConfig::default(),
        },
        &keys,
    )
    .context("creating exit node")?;

    node.start();
    node.ready().await;
    info!("exit registered and serving");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    node.stop().await;
    Ok(())
}

async fn run_proxy(listen: SocketAddr, relay: String, exit_key: Option<String>) -> Result<()> {
    let client = Arc::new(Client::new_dynamic().context("creating client")?);
    client.set_relay(relay);
    client.connect().await.context("connecting to relay")?;

    match exit_key {
        Some(encoded) => {
            let (key_id, public_key) =
                decode_key_config_b64(&encoded).context("decoding exit key config")?;
            client.set_exit(key_id, &public_key)?;
        }
        None => {
            let entries = client
                .query_exit_keys()
                .await
                .context("querying exit keys from relay")?;
            let Some(entry) = entries.first() else {
                bail!("relay reports no registered exits");
            };
            client.set_exit_from_entry(entry)?;
            info!("selected exit {}", entry.pub_key_hash);
        }
    }

    let proxy = LocalProxy::new(
        Arc::clone(&client),
        ProxyConfig {
            listen,
            ..Default::default()
        },
    );

    tokio::select! {
        result = proxy.serve() => result.context("proxy server")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            proxy.shutdown();
        }
    }
    client.close().await;
    Ok(())
}

fn run_keygen(out: PathBuf) -> Result<()> {
    let path = expand_path(&out);
    if path.exists() {
        bail!("refusing to overwrite existing key file {:?}", path);
    }

    let keys = veilgate_crypto::KeyPair::generate();
    save_keypair(&keys, &path).context("saving keypair")?;

    println!("pub_key_hash: {}", keys.pub_key_hash());
    println!("key_config:   {}", BASE64.encode(keys.key_config()));
    println!("private key:  {:?} (mode 0600)", path);
    Ok(())
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Api-Key=secret").unwrap(),
            ("X-Api-Key".to_string(), "secret".to_string())
        );
        assert_eq!(
            parse_header("Name = value with = signs").unwrap(),
            ("Name".to_string(), "value with = signs".to_string())
        );
        assert!(parse_header("no-equals").is_err());
        assert!(parse_header("=value").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
