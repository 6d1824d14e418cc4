//! Replication of key additions and removals to peer KMEs
//!
//! [`Broadcaster`] implements [`KeySync`] over signed HTTP requests. Calls
//! from the key store return at once; delivery runs on a spawned task with
//! bounded retries, and a peer that stays unreachable only costs a logged
//! warning.
//!
//! ## Removal outbox
//!
//! A removal that exhausts its retries is queued per peer in memory. The
//! monitor task calls [`Broadcaster::flush_outbox`] every cycle until the
//! peer acknowledges it. Key additions are not queued: an undelivered key
//! is simply never served by the peer.
//!
//! A removal queued behind another for the same SAE pair is merged into
//! it. Each peer's queue holds at most [`MAX_QUEUED_REMOVAL_IDS`] key IDs;
//! past that the oldest IDs are dropped with a warning.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kme_core::{KeyBatch, KeyId, KeySync, KmeError, KmeResult, SaeId};
use kme_logging::{CorrelationContext, TRACEPARENT_HEADER};
use reqwest::header::CONTENT_TYPE;
use tracing::{Instrument, debug, error, info, warn};

use crate::api::types::{ExchangeRequest, PeerStatus, RemoveRequest};
use crate::auth;
use crate::config::{NodeConfig, PeerConfig};
use crate::error::NodeResult;

/// Peer endpoint receiving new keys
pub const EXCHANGE_PATH: &str = "/kme/keys/exchange";

/// Peer endpoint receiving removals
pub const REMOVE_PATH: &str = "/kme/keys/remove";

/// Unauthenticated liveness endpoint
pub const HEALTH_PATH: &str = "/kme/health";

/// Key IDs one queued removal grows to before a new one is started
pub const MAX_MERGED_REMOVAL_IDS: usize = 1024;

/// Key IDs queued for one peer before the oldest are dropped
pub const MAX_QUEUED_REMOVAL_IDS: usize = 100_000;

tokio::task_local! {
    /// Correlation context of the request being handled
    pub static REQUEST_TRACE: CorrelationContext;
}

/// Correlation context for outbound work triggered by the current request
fn outbound_trace() -> CorrelationContext {
    REQUEST_TRACE
        .try_with(CorrelationContext::child)
        .unwrap_or_else(|_| CorrelationContext::new_root())
}

/// Bounded retry schedule for peer requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per request, at least one
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base: Duration,
    /// Bound on each attempt
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Build the policy from node configuration
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: config.retry_base(),
            timeout: config.peer_timeout(),
        }
    }

    /// Exponential backoff: base * 2^failures, capped at 2^6
    pub fn backoff(&self, failures: u32) -> Duration {
        self.base * 2u32.pow(failures.saturating_sub(1).min(6))
    }
}

/// Append a removal to a peer's queue
///
/// Merges into the newest queued removal when it names the same SAE pair
/// and has room, skipping IDs already queued there. Then trims the oldest
/// IDs until at most `limit` remain and returns how many were dropped.
fn queue_removal(queue: &mut Vec<RemoveRequest>, request: RemoveRequest, limit: usize) -> usize {
    match queue.last_mut() {
        Some(last)
            if last.master_sae_id == request.master_sae_id
                && last.slave_sae_id == request.slave_sae_id
                && last.key_ids.len() + request.key_ids.len() <= MAX_MERGED_REMOVAL_IDS =>
        {
            for id in request.key_ids {
                if !last.key_ids.contains(&id) {
                    last.key_ids.push(id);
                }
            }
        }
        _ => queue.push(request),
    }

    let mut total: usize = queue.iter().map(|r| r.key_ids.len()).sum();
    let mut dropped = 0;
    while total > limit {
        let excess = total - limit;
        let Some(oldest) = queue.first_mut() else {
            break;
        };
        if oldest.key_ids.len() <= excess {
            let removed = queue.remove(0).key_ids.len();
            total -= removed;
            dropped += removed;
        } else {
            oldest.key_ids.drain(..excess);
            total -= excess;
            dropped += excess;
        }
    }
    dropped
}

fn warn_dropped(kme_id: &str, dropped: usize) {
    if dropped > 0 {
        warn!(
            peer = %kme_id,
            dropped,
            limit = MAX_QUEUED_REMOVAL_IDS,
            "Removal outbox full, dropped oldest key IDs"
        );
    }
}

/// Tracks delivery state for a peer
#[derive(Debug, Default)]
struct PeerHealth {
    consecutive_failures: u32,
    last_attempt: Option<Instant>,
    last_success: Option<Instant>,
    last_error: Option<String>,
}

impl PeerHealth {
    /// Record a successful exchange, resetting the failure counter
    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_success = Some(Instant::now());
        self.last_attempt = self.last_success;
        self.last_error = None;
    }

    /// Record a failed exchange
    fn record_failure(&mut self, error: String) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_attempt = Some(Instant::now());
        self.last_error = Some(error);
    }

    /// Reachable once anything succeeded and nothing failed since
    fn is_reachable(&self) -> bool {
        self.last_success.is_some() && self.consecutive_failures == 0
    }
}

struct Inner {
    local_kme_id: String,
    client: reqwest::Client,
    peers: Vec<PeerConfig>,
    retry: RetryPolicy,
    health: DashMap<String, PeerHealth>,
    outbox: DashMap<String, Vec<RemoveRequest>>,
}

/// HTTP replication to every configured peer
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// Create a broadcaster for the peers in `config`
    pub fn new(config: &NodeConfig) -> NodeResult<Self> {
        let retry = RetryPolicy::from_config(config);
        let client = reqwest::Client::builder().timeout(retry.timeout).build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                local_kme_id: config.kme_id.clone(),
                client,
                peers: config.peers.clone(),
                retry,
                health: DashMap::new(),
                outbox: DashMap::new(),
            }),
        })
    }

    /// Configured peers
    pub fn peers(&self) -> &[PeerConfig] {
        &self.inner.peers
    }

    /// Deliver a batch of keys to every peer
    pub async fn send_keys_to_peers(&self, batch: &KeyBatch, trace: &CorrelationContext) {
        let body = match serde_json::to_vec(&ExchangeRequest::from_batch(batch)) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to encode key batch");
                return;
            }
        };

        for peer in &self.inner.peers {
            match self.deliver(peer, EXCHANGE_PATH, &body, trace).await {
                Ok(()) => info!(
                    peer = %peer.kme_id,
                    count = batch.keys.len(),
                    trace_id = %trace.trace_id_str(),
                    "Delivered keys to peer"
                ),
                Err(e) => warn!(
                    peer = %peer.kme_id,
                    count = batch.keys.len(),
                    trace_id = %trace.trace_id_str(),
                    error = %e,
                    "Key delivery failed"
                ),
            }
        }
    }

    /// Mirror a removal to every peer, queueing it for peers that fail
    pub async fn remove_keys_from_peers(&self, request: RemoveRequest, trace: &CorrelationContext) {
        for peer in &self.inner.peers {
            match self.deliver_removal(peer, &request, trace).await {
                Ok(()) => info!(
                    peer = %peer.kme_id,
                    count = request.key_ids.len(),
                    trace_id = %trace.trace_id_str(),
                    "Mirrored removal to peer"
                ),
                Err(e) => {
                    warn!(
                        peer = %peer.kme_id,
                        count = request.key_ids.len(),
                        trace_id = %trace.trace_id_str(),
                        error = %e,
                        "Removal delivery failed, queued for retry"
                    );
                    self.enqueue_removal(&peer.kme_id, request.clone());
                }
            }
        }
    }

    /// Retry every queued removal once
    ///
    /// Returns how many removals were delivered.
    pub async fn flush_outbox(&self) -> usize {
        let mut delivered = 0;
        for peer in &self.inner.peers {
            let Some((_, pending)) = self.inner.outbox.remove(&peer.kme_id) else {
                continue;
            };
            let trace = CorrelationContext::new_root();
            let mut remaining = Vec::new();
            for request in pending {
                if !remaining.is_empty() {
                    remaining.push(request);
                    continue;
                }
                match self.deliver_removal(peer, &request, &trace).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        debug!(peer = %peer.kme_id, error = %e, "Outbox flush failed");
                        remaining.push(request);
                    }
                }
            }
            if !remaining.is_empty() {
                // Removals queued while flushing go after the older ones
                let mut queue = self.inner.outbox.entry(peer.kme_id.clone()).or_default();
                let newer = std::mem::take(&mut *queue);
                *queue = remaining;
                let dropped: usize = newer
                    .into_iter()
                    .map(|request| queue_removal(&mut queue, request, MAX_QUEUED_REMOVAL_IDS))
                    .sum();
                warn_dropped(&peer.kme_id, dropped);
            }
        }
        if delivered > 0 {
            info!(delivered, "Flushed removal outbox");
        }
        delivered
    }

    /// Probe each peer's health endpoint once
    pub async fn probe_peers(&self) {
        for peer in &self.inner.peers {
            let result = self
                .inner
                .client
                .get(peer.endpoint(HEALTH_PATH))
                .send()
                .await
                .map_err(|e| e.to_string())
                .and_then(|resp| {
                    if resp.status().is_success() {
                        Ok(())
                    } else {
                        Err(format!("HTTP {}", resp.status()))
                    }
                });

            let mut health = self.inner.health.entry(peer.kme_id.clone()).or_default();
            match result {
                Ok(()) => health.record_success(),
                Err(e) => {
                    debug!(peer = %peer.kme_id, error = %e, "Peer probe failed");
                    health.record_failure(e);
                }
            }
        }
    }

    /// Removals waiting for a peer
    pub fn pending_removals(&self, kme_id: &str) -> usize {
        self.inner.outbox.get(kme_id).map_or(0, |q| q.len())
    }

    /// Reachability of every peer
    pub fn peer_statuses(&self) -> Vec<PeerStatus> {
        self.inner
            .peers
            .iter()
            .map(|peer| {
                let health = self.inner.health.get(&peer.kme_id);
                PeerStatus {
                    kme_id: peer.kme_id.clone(),
                    url: peer.url.clone(),
                    reachable: health.as_ref().is_some_and(|h| h.is_reachable()),
                    consecutive_failures: health.as_ref().map_or(0, |h| h.consecutive_failures),
                    pending_removals: self.pending_removals(&peer.kme_id),
                    last_error: health.as_ref().and_then(|h| h.last_error.clone()),
                }
            })
            .collect()
    }

    fn enqueue_removal(&self, kme_id: &str, request: RemoveRequest) {
        let mut queue = self.inner.outbox.entry(kme_id.to_string()).or_default();
        let dropped = queue_removal(&mut queue, request, MAX_QUEUED_REMOVAL_IDS);
        warn_dropped(kme_id, dropped);
    }

    async fn deliver_removal(
        &self,
        peer: &PeerConfig,
        request: &RemoveRequest,
        trace: &CorrelationContext,
    ) -> KmeResult<()> {
        let body = serde_json::to_vec(request)
            .map_err(|e| KmeError::invalid(format!("cannot encode removal: {e}")))?;
        self.deliver(peer, REMOVE_PATH, &body, trace).await
    }

    /// POST a signed body, retrying with backoff
    async fn deliver(
        &self,
        peer: &PeerConfig,
        path: &str,
        body: &[u8],
        trace: &CorrelationContext,
    ) -> KmeResult<()> {
        let retry = self.inner.retry;
        let mut last_error = String::new();

        for attempt in 1..=retry.max_attempts {
            match self.post_signed(peer, path, body, trace).await {
                Ok(()) => {
                    self.inner
                        .health
                        .entry(peer.kme_id.clone())
                        .or_default()
                        .record_success();
                    return Ok(());
                }
                Err(e) => {
                    debug!(peer = %peer.kme_id, attempt, error = %e, "Peer request failed");
                    self.inner
                        .health
                        .entry(peer.kme_id.clone())
                        .or_default()
                        .record_failure(e.clone());
                    last_error = e;
                }
            }
            if attempt < retry.max_attempts {
                tokio::time::sleep(retry.backoff(attempt)).await;
            }
        }

        Err(KmeError::PeerUnreachable {
            peer: peer.kme_id.clone(),
            reason: last_error,
        })
    }

    async fn post_signed(
        &self,
        peer: &PeerConfig,
        path: &str,
        body: &[u8],
        trace: &CorrelationContext,
    ) -> Result<(), String> {
        let mut request = self
            .inner
            .client
            .post(peer.endpoint(path))
            .header(CONTENT_TYPE, "application/json")
            .header(TRACEPARENT_HEADER, trace.to_traceparent());
        for (name, value) in auth::signed_headers(&self.inner.local_kme_id, &peer.secret, path, body) {
            request = request.header(name, value);
        }

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(format!("HTTP {status}: {text}"))
        }
    }
}

impl KeySync for Broadcaster {
    fn send_keys(&self, batch: KeyBatch) {
        if self.inner.peers.is_empty() {
            return;
        }
        let trace = outbound_trace();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(count = batch.keys.len(), "No runtime; key batch not replicated");
            return;
        };
        let this = self.clone();
        runtime.spawn(
            async move { this.send_keys_to_peers(&batch, &trace).await }
                .instrument(tracing::Span::current()),
        );
    }

    fn remove_keys(&self, master_sae_id: &SaeId, slave_sae_id: &SaeId, key_ids: Vec<KeyId>) {
        if self.inner.peers.is_empty() {
            return;
        }
        let request = RemoveRequest::new(master_sae_id, slave_sae_id, &key_ids);
        let trace = outbound_trace();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            for peer in &self.inner.peers {
                self.enqueue_removal(&peer.kme_id, request.clone());
            }
            return;
        };
        let this = self.clone();
        runtime.spawn(
            async move { this.remove_keys_from_peers(request, &trace).await }
                .instrument(tracing::Span::current()),
        );
    }
}
