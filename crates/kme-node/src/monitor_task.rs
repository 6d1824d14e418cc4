//! Periodic peer monitoring
//!
//! Each cycle probes every peer's health endpoint, retries queued removals
//! and logs the pool's counters.

use std::sync::Arc;
use std::time::Duration;

use kme_core::KeyStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::broadcaster::Broadcaster;

/// Background peer monitor
pub struct MonitorTask {
    store: Arc<KeyStore>,
    broadcaster: Broadcaster,
    interval: Duration,
    shutdown_rx: broadcast::Receiver<()>,
    cycle_count: u64,
}

impl MonitorTask {
    /// Create a monitor task
    pub fn new(
        store: Arc<KeyStore>,
        broadcaster: Broadcaster,
        interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            interval,
            shutdown_rx,
            cycle_count: 0,
        }
    }

    /// Spawn the monitor task as a background task
    pub fn spawn(
        store: Arc<KeyStore>,
        broadcaster: Broadcaster,
        interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let task = Self::new(store, broadcaster, interval, shutdown_rx);
        tokio::spawn(
            async move {
                task.run().await;
            }
            .instrument(tracing::Span::current()),
        )
    }

    async fn run(mut self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            peers = self.broadcaster.peers().len(),
            "Monitor task started"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Monitor task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.cycle_count += 1;
                    self.check_once().await;
                }
            }
        }
    }

    /// One monitoring cycle
    pub async fn check_once(&self) {
        self.broadcaster.probe_peers().await;
        self.broadcaster.flush_outbox().await;

        for peer in self.broadcaster.peer_statuses() {
            if !peer.reachable {
                warn!(
                    peer = %peer.kme_id,
                    failures = peer.consecutive_failures,
                    pending_removals = peer.pending_removals,
                    error = peer.last_error.as_deref().unwrap_or(""),
                    "Peer unreachable"
                );
            }
        }

        let stats = self.store.stats();
        debug!(
            cycle = self.cycle_count,
            pool_size = stats.pool_size,
            reserved = stats.reserved_keys,
            consumed = stats.consumed_keys,
            mirrored_removals = stats.mirrored_removals,
            "Monitor cycle"
        );
    }
}
