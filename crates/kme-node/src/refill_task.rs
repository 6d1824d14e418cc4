//! Background refill of the key pool
//!
//! Generators keep their pool topped up so encryption requests rarely pay for
//! generation. Each tick refills only once the pool has fallen below its
//! threshold, and always back up to capacity.

use std::sync::Arc;
use std::time::Duration;

use kme_core::KeyStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info};

/// Periodic pool refill
pub struct RefillTask {
    store: Arc<KeyStore>,
    key_size: usize,
    interval: Duration,
    shutdown_rx: broadcast::Receiver<()>,
}

impl RefillTask {
    /// Create a refill task generating keys of `key_size` bits
    pub fn new(
        store: Arc<KeyStore>,
        key_size: usize,
        interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            key_size,
            interval,
            shutdown_rx,
        }
    }

    /// Spawn the refill task as a background task
    pub fn spawn(
        store: Arc<KeyStore>,
        key_size: usize,
        interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let task = Self::new(store, key_size, interval, shutdown_rx);
        tokio::spawn(
            async move {
                task.run().await;
            }
            .instrument(tracing::Span::current()),
        )
    }

    /// Run the refill loop until shutdown
    async fn run(mut self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            key_size = self.key_size,
            "Refill task started"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Refill task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.refill_once();
                }
            }
        }
    }

    /// Refill if needed; returns the number of keys generated
    pub fn refill_once(&self) -> usize {
        match self.store.refill(self.key_size) {
            Ok(0) => 0,
            Ok(generated) => {
                debug!(
                    generated,
                    pool_size = self.store.size(),
                    "Refilled key pool"
                );
                generated
            }
            Err(e) => {
                error!(error = %e, "Pool refill failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kme_core::KeyPool;

    use super::*;

    #[test]
    fn test_refill_once_respects_threshold() {
        let store = Arc::new(KeyStore::standalone(KeyPool::new(8, 4)));
        let (_tx, rx) = broadcast::channel(1);
        let task = RefillTask::new(store.clone(), 256, Duration::from_millis(10), rx);

        assert_eq!(task.refill_once(), 8);
        assert_eq!(store.size(), 8);
        // At capacity: nothing to do
        assert_eq!(task.refill_once(), 0);
    }

    #[tokio::test]
    async fn test_task_fills_pool_and_stops() {
        let store = Arc::new(KeyStore::standalone(KeyPool::new(16, 16)));
        let (tx, rx) = broadcast::channel(1);
        let handle = RefillTask::spawn(store.clone(), 128, Duration::from_millis(10), rx);

        for _ in 0..100 {
            if store.size() == 16 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.size(), 16);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
