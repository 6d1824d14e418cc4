//! HTTP client for the SAE-facing API
//!
//! Used by the CLI and by tests that drive two nodes. A decrypting SAE that
//! asks the retriever right after the generator issued a key may race the
//! replication; [`KmeClient::dec_keys_with_retry`] absorbs that window.

use std::time::Duration;

use kme_core::{KeyId, KmeError};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::api::types::{
    DecKeysRequest, DecKeysResponse, EncKeysRequest, EncKeysResponse, ErrorBody, HealthResponse,
    KeyIdRef, StatusResponse,
};
use crate::api::{RECEIVER_EMAIL_HEADER, SAE_ID_HEADER, SENDER_EMAIL_HEADER};
use crate::broadcaster::HEALTH_PATH;
use crate::error::{NodeError, NodeResult};

/// Default time a decryption request keeps retrying missing keys
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const FIRST_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Client acting for one SAE against one KME
#[derive(Debug, Clone)]
pub struct KmeClient {
    client: reqwest::Client,
    base_url: String,
    sae_id: Option<String>,
}

impl KmeClient {
    /// Create a client for the KME at `base_url`
    pub fn new(base_url: impl Into<String>) -> NodeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sae_id: None,
        })
    }

    /// Identify as `sae_id` through `X-SAE-ID`
    pub fn with_sae_id(mut self, sae_id: impl Into<String>) -> Self {
        self.sae_id = Some(sae_id.into());
        self
    }

    /// Status of the link to `slave_sae_id`
    pub async fn status(&self, slave_sae_id: &str) -> NodeResult<StatusResponse> {
        let request = self
            .client
            .get(self.url(&format!("/keys/{slave_sae_id}/status")));
        self.send(request).await
    }

    /// Request keys for encrypting towards `slave_sae_id`
    pub async fn enc_keys(
        &self,
        slave_sae_id: &str,
        request: &EncKeysRequest,
        sender_email: Option<&str>,
        receiver_email: Option<&str>,
    ) -> NodeResult<EncKeysResponse> {
        let mut builder = self
            .client
            .post(self.url(&format!("/keys/{slave_sae_id}/enc_keys")))
            .json(request);
        if let Some(sender) = sender_email {
            builder = builder.header(SENDER_EMAIL_HEADER, sender);
        }
        if let Some(receiver) = receiver_email {
            builder = builder.header(RECEIVER_EMAIL_HEADER, receiver);
        }
        self.send(builder).await
    }

    /// Retrieve keys issued by `master_sae_id`'s KME
    pub async fn dec_keys(
        &self,
        master_sae_id: &str,
        key_ids: &[String],
        receiver_email: Option<&str>,
    ) -> NodeResult<DecKeysResponse> {
        let body = DecKeysRequest {
            key_ids: key_ids
                .iter()
                .map(|id| KeyIdRef { key_id: id.clone() })
                .collect(),
        };
        let mut builder = self
            .client
            .post(self.url(&format!("/keys/{master_sae_id}/dec_keys")))
            .json(&body);
        if let Some(receiver) = receiver_email {
            builder = builder.header(RECEIVER_EMAIL_HEADER, receiver);
        }
        self.send(builder).await
    }

    /// Retrieve keys, retrying while they are not found yet
    ///
    /// Only `KeyNotFound` is retried, with doubling delays from 100ms up to
    /// 1s, until `grace` has passed.
    pub async fn dec_keys_with_retry(
        &self,
        master_sae_id: &str,
        key_ids: &[String],
        receiver_email: Option<&str>,
        grace: Duration,
    ) -> NodeResult<DecKeysResponse> {
        let deadline = tokio::time::Instant::now() + grace;
        let mut delay = FIRST_RETRY_DELAY;
        let mut attempt = 1u32;
        loop {
            match self.dec_keys(master_sae_id, key_ids, receiver_email).await {
                Err(NodeError::Key(KmeError::KeyNotFound(missing)))
                    if tokio::time::Instant::now() + delay <= deadline =>
                {
                    debug!(
                        attempt,
                        missing = missing.len(),
                        delay_ms = delay.as_millis() as u64,
                        "Keys not replicated yet, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Liveness of the KME
    pub async fn health(&self) -> NodeResult<HealthResponse> {
        self.send(self.client.get(self.url(HEALTH_PATH))).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, mut request: RequestBuilder) -> NodeResult<T> {
        if let Some(sae_id) = &self.sae_id {
            request = request.header(SAE_ID_HEADER, sae_id);
        }
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response.json().await?);
        }
        Err(error_from_response(response).await)
    }
}

/// Map an error response back to a node error
async fn error_from_response(response: Response) -> NodeError {
    let status = response.status();
    let body: Option<ErrorBody> = response.json().await.ok();

    if status == StatusCode::NOT_FOUND {
        if let Some(body) = &body {
            let missing: Vec<KeyId> = body
                .details
                .iter()
                .filter_map(|d| d.get("key_ID").and_then(|v| v.as_str()))
                .filter_map(|id| KeyId::parse(id).ok())
                .collect();
            return NodeError::Key(KmeError::KeyNotFound(missing));
        }
    }

    NodeError::Api {
        status: status.as_u16(),
        message: body.map(|b| b.message).unwrap_or_default(),
    }
}
