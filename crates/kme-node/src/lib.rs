//! # KME Node
//!
//! A Key Management Entity serving QKD-style keys to the SAEs attached to
//! it. A deployment runs two nodes:
//!
//! - a **generator**, which fills its pool and hands out encryption keys
//! - a **retriever**, which receives mirrored keys and hands them out for
//!   decryption
//!
//! [`KmeNode`] ties together:
//! - the key store ([`kme_core::KeyStore`]) replicating through the
//!   [`Broadcaster`]
//! - the HTTP API ([`api::router`])
//! - the background refill and monitor tasks
//!
//! ## Example
//!
//! ```rust,ignore
//! use kme_core::KmeRole;
//! use kme_node::{KmeNode, NodeConfig, PeerConfig};
//!
//! let config = NodeConfig::new("KME-A", KmeRole::Generator, "SAE-A")
//!     .with_peer(PeerConfig::new("KME-B", "http://127.0.0.1:8002", "secret"));
//! let node = KmeNode::new(config)?;
//! let addr = node.start().await?;
//! println!("Serving on {addr}");
//! node.stop().await?;
//! ```

pub mod api;
pub mod auth;
pub mod broadcaster;
pub mod cli;
pub mod client;
mod config;
mod error;
pub mod monitor_task;
pub mod refill_task;

pub use broadcaster::{Broadcaster, RetryPolicy};
pub use client::{DEFAULT_GRACE_PERIOD, KmeClient};
pub use config::{NodeConfig, PeerConfig};
pub use error::{NodeError, NodeResult};

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kme_core::KeyStore;
use kme_logging::NodeContextData;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, instrument};

use crate::api::{AppState, SharedState};
use crate::monitor_task::MonitorTask;
use crate::refill_task::RefillTask;

/// A KME node: key store, HTTP API and background tasks
pub struct KmeNode {
    /// State shared with the HTTP handlers
    state: SharedState,
    /// Logging context of this node
    context: NodeContextData,
    /// Address the API is bound to (None until started)
    local_addr: RwLock<Option<SocketAddr>>,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
    /// Background task handles, the server included
    background_tasks: RwLock<Vec<JoinHandle<()>>>,
    /// Whether the node has been started
    started: AtomicBool,
}

impl KmeNode {
    /// Create a node
    ///
    /// Validates the configuration and builds an empty key store.
    /// Call [`start`](Self::start) to begin serving.
    #[instrument(skip(config), fields(kme_id = %config.kme_id, role = %config.role))]
    pub fn new(config: NodeConfig) -> NodeResult<Self> {
        let context = NodeContextData::new(config.kme_id.clone(), config.role);
        let state = Arc::new(AppState::new(config, &context)?);
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            instance_id = %context.instance_id,
            peers = state.config.peers.len(),
            "Node created"
        );

        Ok(Self {
            state,
            context,
            local_addr: RwLock::new(None),
            shutdown_tx,
            background_tasks: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Bind the configured listen address and start serving
    pub async fn start(&self) -> NodeResult<SocketAddr> {
        if self.is_started() {
            return Err(NodeError::AlreadyStarted);
        }
        let listener = TcpListener::bind(self.state.config.listen_addr).await?;
        self.start_with_listener(listener).await
    }

    /// Start serving on an already bound listener
    #[instrument(skip(self, listener), fields(kme_id = %self.context.kme_id))]
    pub async fn start_with_listener(&self, listener: TcpListener) -> NodeResult<SocketAddr> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted);
        }
        let addr = listener.local_addr()?;
        let config = self.state.config.clone();

        let tasks = self.context.span().in_scope(|| {
            let mut tasks = Vec::new();

            let app = api::router(self.state.clone());
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let server = tokio::spawn(
                async move {
                    let result = axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            let _ = shutdown_rx.recv().await;
                        })
                        .await;
                    if let Err(e) = result {
                        error!(error = %e, "HTTP server failed");
                    }
                }
                .instrument(tracing::Span::current()),
            );
            tasks.push(server);

            if config.refill_enabled() {
                tasks.push(RefillTask::spawn(
                    self.state.store.clone(),
                    config.default_key_size,
                    config.refill_interval(),
                    self.shutdown_tx.subscribe(),
                ));
            }

            tasks.push(MonitorTask::spawn(
                self.state.store.clone(),
                self.state.broadcaster.clone(),
                config.monitor_interval(),
                self.shutdown_tx.subscribe(),
            ));
            tasks
        });

        self.background_tasks.write().await.extend(tasks);
        *self.local_addr.write().await = Some(addr);

        info!(
            addr = %addr,
            role = %config.role,
            refill = config.refill_enabled(),
            "Node started"
        );
        Ok(addr)
    }

    /// Stop serving and wait for the background tasks
    #[instrument(skip(self), fields(kme_id = %self.context.kme_id))]
    pub async fn stop(&self) -> NodeResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already stopped
        }

        let _ = self.shutdown_tx.send(());

        let mut tasks = self.background_tasks.write().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        *self.local_addr.write().await = None;

        info!("Node stopped");
        Ok(())
    }

    /// Check if the node is started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// This node's KME identifier
    pub fn kme_id(&self) -> &str {
        &self.state.config.kme_id
    }

    /// Node configuration
    pub fn config(&self) -> &NodeConfig {
        &self.state.config
    }

    /// The node's key store
    pub fn store(&self) -> &Arc<KeyStore> {
        &self.state.store
    }

    /// The node's peer replication
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.state.broadcaster
    }

    /// Bound address (if started)
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Base URL of the API (if started)
    pub async fn base_url(&self) -> Option<String> {
        self.local_addr().await.map(|addr| format!("http://{addr}"))
    }
}
