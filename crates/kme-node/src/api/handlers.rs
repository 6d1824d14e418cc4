//! Request handlers
//!
//! Handlers translate requests into key store calls and never hold the
//! store across an await point.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::HeaderMap,
};
use kme_core::{KeyId, KmeError, KmeResult, ReceiverCheck, SaeId};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use super::error::ApiError;
use super::types::{
    DecKeysQuery, DecKeysRequest, DecKeysResponse, EncKeysRequest, EncKeysResponse,
    ExchangeRequest, HealthResponse, KeyContainer, PeerAck, RemoveRequest, StatusResponse,
};
use super::{RECEIVER_EMAIL_HEADER, SAE_ID_HEADER, SENDER_EMAIL_HEADER, SharedState};
use crate::broadcaster::{EXCHANGE_PATH, REMOVE_PATH};

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Trimmed, non-empty header value
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// SAE making the request: `X-SAE-ID`, or the SAE attached to this node
fn caller_sae(state: &SharedState, headers: &HeaderMap) -> KmeResult<SaeId> {
    match header_value(headers, SAE_ID_HEADER) {
        Some(sae) => SaeId::new(sae),
        None => SaeId::new(state.config.sae_id.as_str()),
    }
}

/// SAE named in the request path, checked against `known_saes`
fn path_sae(state: &SharedState, raw: &str) -> KmeResult<SaeId> {
    let sae = SaeId::new(raw)?;
    let known = &state.config.known_saes;
    if !known.is_empty() && !known.iter().any(|k| k == sae.as_str()) {
        return Err(KmeError::UnknownSae(sae.to_string()));
    }
    Ok(sae)
}

/// JSON body, with an empty body read as the default value
fn parse_optional_body<T: DeserializeOwned + Default>(body: &[u8]) -> KmeResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> KmeResult<T> {
    serde_json::from_slice(body).map_err(|e| KmeError::invalid(format!("malformed body: {e}")))
}

/// Apply defaults and limits to `number` and `size`
fn validate_enc_request(state: &SharedState, request: &EncKeysRequest) -> KmeResult<(usize, usize)> {
    let config = &state.config;
    let number = request.number.unwrap_or(1);
    if number == 0 || number > config.max_keys_per_request {
        return Err(KmeError::invalid(format!(
            "number must be between 1 and {}",
            config.max_keys_per_request
        )));
    }

    let size = request.size.unwrap_or(config.default_key_size);
    if size % 8 != 0 || !(config.min_key_size..=config.max_key_size).contains(&size) {
        return Err(KmeError::InvalidKeySize(size));
    }
    Ok((number, size))
}

/// `GET /keys/{slave_sae_id}/status`
#[instrument(skip(state, headers))]
pub async fn status(
    State(state): State<SharedState>,
    Path(slave_sae_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusResponse> {
    let slave = path_sae(&state, &slave_sae_id)?;
    let master = caller_sae(&state, &headers)?;
    let stats = state.store.stats();
    let config = &state.config;

    Ok(Json(StatusResponse {
        source_kme_id: config.kme_id.clone(),
        target_kme_id: config
            .peers
            .first()
            .map(|p| p.kme_id.clone())
            .unwrap_or_default(),
        master_sae_id: master.to_string(),
        slave_sae_id: slave.to_string(),
        key_size: config.default_key_size,
        stored_key_count: stats.pool_size,
        max_key_count: stats.capacity,
        max_key_per_request: config.max_keys_per_request,
        max_key_size: config.max_key_size,
        min_key_size: config.min_key_size,
        max_sae_id_count: 0,
        pool_size: stats.pool_size,
        reserved_keys: stats.reserved_keys,
        consumed_keys: stats.consumed_keys,
        mirrored_removals: stats.mirrored_removals,
        role: config.role.to_string(),
        peers: state.broadcaster.peer_statuses(),
    }))
}

/// `POST /keys/{slave_sae_id}/enc_keys`
#[instrument(skip(state, headers, body))]
pub async fn enc_keys_post(
    State(state): State<SharedState>,
    Path(slave_sae_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<EncKeysResponse> {
    let request = parse_optional_body(&body)?;
    issue_enc_keys(&state, &slave_sae_id, &headers, &request)
}

/// `GET /keys/{slave_sae_id}/enc_keys?number=&size=`
#[instrument(skip(state, headers, query))]
pub async fn enc_keys_get(
    State(state): State<SharedState>,
    Path(slave_sae_id): Path<String>,
    headers: HeaderMap,
    query: Result<Query<EncKeysRequest>, QueryRejection>,
) -> ApiResult<EncKeysResponse> {
    let Query(request) = query.map_err(|e| KmeError::invalid(e.body_text()))?;
    issue_enc_keys(&state, &slave_sae_id, &headers, &request)
}

fn issue_enc_keys(
    state: &SharedState,
    slave_sae_id: &str,
    headers: &HeaderMap,
    request: &EncKeysRequest,
) -> ApiResult<EncKeysResponse> {
    let slave = path_sae(state, slave_sae_id)?;
    let master = caller_sae(state, headers)?;
    let (number, size) = validate_enc_request(state, request)?;
    let sender_email = header_value(headers, SENDER_EMAIL_HEADER);
    let receiver_email = header_value(headers, RECEIVER_EMAIL_HEADER);

    let keys = state.store.get_new_key(number, size, false)?;
    state.store.append_keys(
        &master,
        &slave,
        keys.clone(),
        sender_email.clone(),
        receiver_email.clone(),
        true,
    )?;

    for key in &keys {
        debug!(key_id = %key.key_id(), preview = %key.preview(), "Issued key");
    }
    info!(
        master = %master,
        slave = %slave,
        count = keys.len(),
        size,
        "Issued encryption keys"
    );

    Ok(Json(EncKeysResponse {
        keys: keys.iter().map(KeyContainer::from).collect(),
        receiver_sae_id: slave.to_string(),
        receiver_email,
        sender_email,
    }))
}

/// `POST /keys/{master_sae_id}/dec_keys`
#[instrument(skip(state, headers, body))]
pub async fn dec_keys_post(
    State(state): State<SharedState>,
    Path(master_sae_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<DecKeysResponse> {
    let request: DecKeysRequest = parse_optional_body(&body)?;
    let ids = request.key_ids.into_iter().map(|r| r.key_id).collect();
    retrieve_dec_keys(&state, &master_sae_id, &headers, ids)
}

/// `GET /keys/{master_sae_id}/dec_keys?key_ID=`
#[instrument(skip(state, headers, query))]
pub async fn dec_keys_get(
    State(state): State<SharedState>,
    Path(master_sae_id): Path<String>,
    headers: HeaderMap,
    query: Result<Query<DecKeysQuery>, QueryRejection>,
) -> ApiResult<DecKeysResponse> {
    let Query(query) = query.map_err(|e| KmeError::invalid(e.body_text()))?;
    let ids = query.key_id.into_iter().collect();
    retrieve_dec_keys(&state, &master_sae_id, &headers, ids)
}

fn retrieve_dec_keys(
    state: &SharedState,
    master_sae_id: &str,
    headers: &HeaderMap,
    raw_ids: Vec<String>,
) -> ApiResult<DecKeysResponse> {
    let master = path_sae(state, master_sae_id)?;
    let slave = caller_sae(state, headers)?;
    if raw_ids.is_empty() {
        return Err(KmeError::invalid("at least one key_ID is required").into());
    }
    if raw_ids.len() > state.config.max_keys_per_request {
        return Err(KmeError::invalid(format!(
            "at most {} key_IDs per request",
            state.config.max_keys_per_request
        ))
        .into());
    }
    let ids = raw_ids
        .iter()
        .map(|raw| KeyId::parse(raw))
        .collect::<KmeResult<Vec<_>>>()?;

    let receiver_email = header_value(headers, RECEIVER_EMAIL_HEADER);
    for id in &ids {
        check_association(state, id, &slave, receiver_email.as_deref())?;
    }

    let keys = match state.store.get_keys_by_id(&ids, true) {
        Ok(keys) => keys,
        Err(e) => {
            if let KmeError::KeyNotFound(missing) = &e {
                info!(master = %master, missing = missing.len(), "Decryption keys not available");
            }
            return Err(e.into());
        }
    };
    state.store.mirror_removal(&master, &slave, &ids);

    info!(
        master = %master,
        slave = %slave,
        count = keys.len(),
        "Served decryption keys"
    );
    Ok(Json(DecKeysResponse {
        keys: keys.iter().map(KeyContainer::from).collect(),
    }))
}

/// Compare the caller and its receiver hint with the key's association
///
/// Mismatches are logged; only a receiver mismatch in strict mode fails.
fn check_association(
    state: &SharedState,
    key_id: &KeyId,
    caller: &SaeId,
    receiver_email: Option<&str>,
) -> KmeResult<()> {
    if let Some(association) = state.store.get_key_email_info(key_id) {
        if &association.slave_sae_id != caller {
            warn!(
                key_id = %key_id,
                expected = %association.slave_sae_id,
                caller = %caller,
                "Decryption requested by an SAE other than the key's slave"
            );
        }
    }

    match state.store.verify_receiver(key_id, receiver_email) {
        ReceiverCheck::Mismatch { expected, provided } => {
            warn!(
                key_id = %key_id,
                expected = %expected,
                provided = %provided,
                strict = state.config.strict_receiver_check,
                "SECURITY WARNING: receiver does not match key association"
            );
            if state.config.strict_receiver_check {
                return Err(KmeError::ReceiverMismatch {
                    key_id: key_id.clone(),
                    expected,
                    provided,
                });
            }
        }
        ReceiverCheck::Verified => debug!(key_id = %key_id, "Receiver verified"),
        ReceiverCheck::NoHint | ReceiverCheck::NoAssociation => {}
    }
    Ok(())
}

/// `POST /kme/keys/exchange`
#[instrument(skip_all)]
pub async fn peer_exchange(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<PeerAck> {
    let peer = state.verifier.verify(&headers, EXCHANGE_PATH, &body)?;
    let request: ExchangeRequest = parse_body(&body)?;
    let batch = request.into_batch()?;
    let accepted = state.store.apply_peer_keys(&batch)?;

    debug!(peer = %peer, received = batch.keys.len(), accepted, "Peer key exchange");
    Ok(Json(PeerAck { accepted }))
}

/// `POST /kme/keys/remove`
#[instrument(skip_all)]
pub async fn peer_remove(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<PeerAck> {
    let peer = state.verifier.verify(&headers, REMOVE_PATH, &body)?;
    let request: RemoveRequest = parse_body(&body)?;
    let ids = request.parsed_ids()?;
    let removed = state.store.apply_peer_removal(&ids);

    info!(peer = %peer, requested = ids.len(), removed, "Applied peer removal");
    Ok(Json(PeerAck { accepted: removed }))
}

/// `GET /kme/health`
pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        kme_id: state.config.kme_id.clone(),
        role: state.config.role.to_string(),
    })
}
