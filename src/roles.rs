//! Agent and connector process lifecycles

use crate::config::Config;
use anyhow::{Context, Result};
use p2ptunnel_transport::PeerNetwork;
use p2ptunnel_transport_quic::QuicNetwork;
use p2ptunnel_tunnel::{
    Agent, AgentConfig, Connector, ConnectorConfig, Discovery, DiscoveryConfig,
    SinglePeerSelector,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Start the QUIC node described by `config`
fn start_node(config: &Config) -> Result<Arc<QuicNetwork>> {
    let identity = config.identity()?;
    let quic_config = config.quic_config();
    let bind_addr = quic_config.bind_addr;

    let network = QuicNetwork::bind(identity, quic_config)
        .with_context(|| format!("Failed to start peer node on {}", bind_addr))?;

    for (id, addr) in config.addresses() {
        network.add_address(id.clone(), addr);
    }

    info!(
        name = %config.name,
        id = %network.local_peer_id(),
        addr = %bind_addr,
        "Peer node started"
    );

    Ok(Arc::new(network))
}

/// Expose `127.0.0.1:forward_port` to the configured peers
pub async fn run_agent(config: Config, forward_port: u16, verbose: bool) -> Result<()> {
    let registry = Arc::new(config.registry()?);
    if registry.is_empty() {
        warn!("No peers configured; every inbound channel will be rejected");
    }

    let network = start_node(&config)?;
    let agent = Arc::new(Agent::new(
        registry,
        AgentConfig::new(forward_port).with_verbose(verbose),
    ));
    agent.register(network.as_ref());

    info!("Agent ready. Peers connect to id {}", network.local_peer_id());

    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone());
    cancel.cancelled().await;

    info!("Shutting down agent...");
    network.close().await;
    info!("Agent stopped");

    Ok(())
}

/// Listen on `port` and forward every connection to the single configured peer
pub async fn run_connector(config: Config, port: u16, verbose: bool) -> Result<()> {
    let registry = config.registry()?;
    let selector = SinglePeerSelector::from_registry(&registry)
        .context("The connector needs exactly one configured peer")?;

    let network = start_node(&config)?;
    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone());

    let discovery = Arc::new(Discovery::new(
        network.clone(),
        registry.entries().to_vec(),
        DiscoveryConfig::default(),
    ));

    {
        let discovery = discovery.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { discovery.run_prober(cancel).await });
    }

    {
        let discovery = discovery.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let report = discovery.await_ready(cancel).await;
            for (peer, e) in &report.failed {
                error!(peer = %peer.name, error = %e, "Peer cannot be used");
            }
            if !report.pending.is_empty() {
                info!(pending = report.pending.len(), "Readiness probe stopped");
            }
        });
    }

    let connector = Arc::new(Connector::new(
        network.clone(),
        Arc::new(selector),
        ConnectorConfig::default()
            .with_port(port)
            .with_verbose(verbose),
    ));
    let listener = connector
        .bind()
        .await
        .context("Failed to start connector listener")?;

    connector.run(listener, cancel.clone()).await;

    info!("Shutting down connector...");
    cancel.cancel();
    network.close().await;
    info!("Connector stopped");

    Ok(())
}

/// Cancel `cancel` on SIGINT/SIGTERM (Ctrl+C elsewhere)
fn spawn_signal_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "Failed to listen for shutdown signals");
        }
        cancel.cancel();
    });
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
