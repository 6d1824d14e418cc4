//! HTTP API of a KME node
//!
//! Two surfaces share one router:
//!
//! - SAE-facing routes after ETSI GS QKD 014: `status`, `enc_keys` and
//!   `dec_keys` under `/keys/{sae_id}/`
//! - Peer-facing routes under `/kme/`, signed with the secret shared
//!   between the two KMEs
//!
//! Every request runs inside a correlation scope taken from its
//! `traceparent` header, so replication it triggers continues the same trace.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use kme_core::{KeyPool, KeyStore};
use kme_logging::{CorrelationContext, NodeContextData, TRACEPARENT_HEADER};
use tower_http::trace::TraceLayer;
use tracing::{Instrument, info_span};

use crate::auth::PeerVerifier;
use crate::broadcaster::{Broadcaster, EXCHANGE_PATH, HEALTH_PATH, REMOVE_PATH, REQUEST_TRACE};
use crate::config::NodeConfig;
use crate::error::NodeResult;

pub mod error;
mod handlers;
pub mod types;

/// Header naming the calling SAE
pub const SAE_ID_HEADER: &str = "x-sae-id";

/// Header carrying the sender's address on encryption requests
pub const SENDER_EMAIL_HEADER: &str = "x-sender-email";

/// Header carrying the intended receiver's address
pub const RECEIVER_EMAIL_HEADER: &str = "x-receiver-email";

/// State shared by every handler
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub store: Arc<KeyStore>,
    pub broadcaster: Broadcaster,
    pub verifier: PeerVerifier,
    span: tracing::Span,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Build the store, broadcaster and verifier for a node
    pub fn new(config: NodeConfig, context: &NodeContextData) -> NodeResult<Self> {
        config.validate()?;
        let broadcaster = Broadcaster::new(&config)?;
        let pool = KeyPool::new(config.pool_capacity, config.refill_threshold);
        let store = Arc::new(KeyStore::new(pool, Arc::new(broadcaster.clone())));
        let verifier = PeerVerifier::new(&config.peers, config.auth_max_skew());

        Ok(Self {
            config: Arc::new(config),
            store,
            broadcaster,
            verifier,
            span: context.span(),
        })
    }
}

/// Router with every route of the node
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/keys/{sae_id}/status", get(handlers::status))
        .route(
            "/keys/{sae_id}/enc_keys",
            get(handlers::enc_keys_get).post(handlers::enc_keys_post),
        )
        .route(
            "/keys/{sae_id}/dec_keys",
            get(handlers::dec_keys_get).post(handlers::dec_keys_post),
        )
        .route(EXCHANGE_PATH, post(handlers::peer_exchange))
        .route(REMOVE_PATH, post(handlers::peer_remove))
        .route(HEALTH_PATH, get(handlers::health))
        .layer(middleware::from_fn_with_state(state.clone(), trace_context))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the request inside its correlation scope and the node's span
async fn trace_context(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    let header = request
        .headers()
        .get(TRACEPARENT_HEADER)
        .and_then(|v| v.to_str().ok());
    let trace = CorrelationContext::from_header_or_root(header);
    let span = info_span!(
        parent: &state.span,
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        trace_id = %trace.trace_id_str(),
        hop = trace.hops,
    );

    REQUEST_TRACE
        .scope(trace, next.run(request))
        .instrument(span)
        .await
}
