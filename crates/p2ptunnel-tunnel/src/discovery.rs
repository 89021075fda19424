//! Peer discovery and readiness
//!
//! Two loops share the configured peer list. The prober keeps connections to
//! every peer warm in the background; the readiness probe runs at startup and
//! reports when each peer first accepts a tunnel channel.

use crate::registry::RegistryEntry;
use crate::retry::RetryPolicy;
use p2ptunnel_proto::PROTOCOL;
use p2ptunnel_transport::{NetworkError, PeerNetwork};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between background probes
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub probe_interval: Duration,
    /// Delay between readiness rounds
    pub retry: RetryPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of [`Discovery::await_ready`]
#[derive(Debug, Default)]
pub struct ReadinessReport {
    pub ready: Vec<RegistryEntry>,
    /// Peers that failed with a non-retryable error
    pub failed: Vec<(RegistryEntry, NetworkError)>,
    /// Peers still unreachable when probing stopped
    pub pending: Vec<RegistryEntry>,
}

#[derive(Debug)]
pub struct Discovery<N: PeerNetwork> {
    network: Arc<N>,
    peers: Vec<RegistryEntry>,
    config: DiscoveryConfig,
}

impl<N: PeerNetwork> Discovery<N> {
    pub fn new(network: Arc<N>, peers: Vec<RegistryEntry>, config: DiscoveryConfig) -> Self {
        Self {
            network,
            peers,
            config,
        }
    }

    /// Dial every configured peer that is not connected; returns the number of dials
    pub async fn probe_once(&self) -> usize {
        let mut dials = 0;

        for peer in &self.peers {
            if self.network.is_connected(&peer.id) {
                continue;
            }

            dials += 1;
            match self.network.resolve_and_connect(&peer.id).await {
                Ok(()) => debug!(peer = %peer.name, "Connected to peer"),
                Err(e) => debug!(peer = %peer.name, error = %e, "Peer not reachable yet"),
            }
        }

        dials
    }

    /// Probe on every tick until cancelled
    pub async fn run_prober(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
            }
        }

        debug!("Discovery prober stopped");
    }

    /// Open a probe channel to each peer until all have answered or failed
    pub async fn await_ready(&self, cancel: CancellationToken) -> ReadinessReport {
        let mut report = ReadinessReport::default();
        let mut pending = self.peers.clone();

        loop {
            let mut unreachable = Vec::new();

            for peer in pending {
                match self.network.open_channel(&peer.id, PROTOCOL).await {
                    Ok(mut channel) => {
                        let _ = channel.shutdown().await;
                        info!(peer = %peer.name, id = %peer.id, "Peer is ready");
                        report.ready.push(peer);
                    }
                    Err(e) if self.config.retry.is_retryable(&e) => {
                        debug!(peer = %peer.name, error = %e, "Peer not ready");
                        unreachable.push(peer);
                    }
                    Err(e) => {
                        warn!(peer = %peer.name, error = %e, "Peer probe failed");
                        report.failed.push((peer, e));
                    }
                }
            }

            pending = unreachable;
            if pending.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    report.pending = pending;
                    break;
                }
                _ = tokio::time::sleep(self.config.retry.delay) => {}
            }
        }

        report
    }
}
