//! p2ptunnel - forward a local TCP service to a trusted peer
//!
//! Every node keeps its identity and trusted peers in one YAML file. A node
//! runs either as an agent, exposing a local service to its peers, or as a
//! connector, exposing a local port that forwards to its single peer.

mod config;
mod roles;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Config, DEFAULT_CONFIG_PATH};
use p2ptunnel_transport_quic::config::DEFAULT_P2P_PORT;
use p2ptunnel_tunnel::DEFAULT_CONNECTOR_PORT;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// p2ptunnel - Tunnel a TCP service between two trusted peers
#[derive(Parser, Debug)]
#[command(name = "p2ptunnel")]
#[command(about = "Tunnel a TCP service between two trusted peers")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Path to the node configuration file
    #[arg(short = 'c', long = "conf", global = true, default_value = DEFAULT_CONFIG_PATH, env = "P2PTUNNEL_CONF")]
    conf: PathBuf,

    /// Enable verbose logging and dump HTTP headers of tunneled traffic
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new node identity and configuration file
    #[command(visible_alias = "i")]
    Init {
        /// Name of this node
        name: String,

        /// UDP port of the peer-to-peer endpoint
        #[arg(long, default_value_t = DEFAULT_P2P_PORT)]
        listen_port: u16,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Trust a peer
    #[command(visible_alias = "a")]
    Add {
        /// Local name for the peer
        name: String,

        /// Peer id, as printed by `p2ptunnel id` on the peer
        id: String,

        /// Peer endpoint address (host:port), if it accepts dials
        #[arg(long)]
        addr: Option<String>,
    },

    /// Stop trusting a peer
    #[command(visible_alias = "rm")]
    Remove {
        /// Local name for the peer
        name: String,

        /// Peer id, which must match the stored one
        id: String,
    },

    /// Print this node's peer id
    Id,

    /// Expose a local TCP port to the configured peers
    Agent {
        /// Local port to forward tunneled requests to
        forward_port: u16,
    },

    /// Listen locally and forward connections to the configured peer
    Connector {
        /// Local port to listen on
        #[arg(short, long, default_value_t = DEFAULT_CONNECTOR_PORT)]
        port: u16,
    },
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose && cli.log_level == "info" {
        "debug"
    } else {
        cli.log_level.as_str()
    };
    setup_logging(log_level)?;

    match cli.command {
        Commands::Init {
            name,
            listen_port,
            force,
        } => {
            let config = Config::init(&cli.conf, &name, listen_port, force)?;
            println!("{}", config.id);
        }
        Commands::Add { name, id, addr } => {
            let mut config = Config::load(&cli.conf)?;
            config.add_peer(&name, &id, addr)?;
            config.save(&cli.conf)?;
            info!("Added peer '{}'", name);
        }
        Commands::Remove { name, id } => {
            let mut config = Config::load(&cli.conf)?;
            config.remove_peer(&name, &id)?;
            config.save(&cli.conf)?;
            info!("Removed peer '{}'", name);
        }
        Commands::Id => {
            let config = Config::load(&cli.conf)?;
            println!("{}", config.id);
        }
        Commands::Agent { forward_port } => {
            let config = Config::load(&cli.conf)?;
            roles::run_agent(config, forward_port, cli.verbose)
                .await
                .context("Agent failed")?;
        }
        Commands::Connector { port } => {
            let config = Config::load(&cli.conf)?;
            roles::run_connector(config, port, cli.verbose)
                .await
                .context("Connector failed")?;
        }
    }

    Ok(())
}
