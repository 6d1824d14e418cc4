//! Peer request signatures
//!
//! Every request between KMEs carries three headers:
//!
//! - `X-KME-ID`: the sender's KME identifier
//! - `X-KME-Timestamp`: unix seconds at signing time
//! - `X-KME-Signature`: hex BLAKE3 keyed hash of `"{timestamp}\n{path}\n{body}"`
//!
//! The hash key is derived from the secret shared with that peer, so a node
//! only accepts requests from peers it is configured with.

use std::collections::HashMap;
use std::time::Duration;

use axum::http::HeaderMap;
use kme_core::{KmeError, KmeResult};

use crate::config::PeerConfig;

/// Header naming the sending KME
pub const KME_ID_HEADER: &str = "x-kme-id";

/// Header carrying the signing time
pub const TIMESTAMP_HEADER: &str = "x-kme-timestamp";

/// Header carrying the signature
pub const SIGNATURE_HEADER: &str = "x-kme-signature";

const KEY_CONTEXT: &str = "kme peer auth v1";

/// Compute the signature for a request
pub fn sign(secret: &str, timestamp: i64, path: &str, body: &[u8]) -> String {
    mac(secret, timestamp, path, body).to_hex().to_string()
}

fn mac(secret: &str, timestamp: i64, path: &str, body: &[u8]) -> blake3::Hash {
    let key = blake3::derive_key(KEY_CONTEXT, secret.as_bytes());
    let mut hasher = blake3::Hasher::new_keyed(&key);
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hasher.finalize()
}

/// Headers to attach to an outbound peer request
pub fn signed_headers(
    local_kme_id: &str,
    secret: &str,
    path: &str,
    body: &[u8],
) -> [(&'static str, String); 3] {
    let timestamp = chrono::Utc::now().timestamp();
    [
        (KME_ID_HEADER, local_kme_id.to_string()),
        (TIMESTAMP_HEADER, timestamp.to_string()),
        (SIGNATURE_HEADER, sign(secret, timestamp, path, body)),
    ]
}

/// Checks inbound peer requests against the configured peers
#[derive(Debug, Clone)]
pub struct PeerVerifier {
    secrets: HashMap<String, String>,
    max_skew: Duration,
}

impl PeerVerifier {
    /// Create a verifier trusting `peers`
    pub fn new(peers: &[PeerConfig], max_skew: Duration) -> Self {
        Self {
            secrets: peers
                .iter()
                .map(|p| (p.kme_id.clone(), p.secret.clone()))
                .collect(),
            max_skew,
        }
    }

    /// Verify a request and return the sending peer's KME ID
    pub fn verify(&self, headers: &HeaderMap, path: &str, body: &[u8]) -> KmeResult<String> {
        self.verify_at(headers, path, body, chrono::Utc::now().timestamp())
    }

    /// Verify against an explicit clock
    pub fn verify_at(
        &self,
        headers: &HeaderMap,
        path: &str,
        body: &[u8],
        now: i64,
    ) -> KmeResult<String> {
        let peer = header(headers, KME_ID_HEADER)?;
        let secret = self
            .secrets
            .get(peer)
            .ok_or_else(|| KmeError::Unauthorized(format!("unknown peer {peer}")))?;

        let timestamp: i64 = header(headers, TIMESTAMP_HEADER)?
            .parse()
            .map_err(|_| KmeError::Unauthorized("malformed timestamp".into()))?;
        if timestamp.abs_diff(now) > self.max_skew.as_secs() {
            return Err(KmeError::Unauthorized(format!(
                "timestamp {timestamp} outside allowed skew"
            )));
        }

        let provided = blake3::Hash::from_hex(header(headers, SIGNATURE_HEADER)?)
            .map_err(|_| KmeError::Unauthorized("malformed signature".into()))?;
        // blake3::Hash equality is constant time
        if provided != mac(secret, timestamp, path, body) {
            return Err(KmeError::Unauthorized(format!("bad signature from {peer}")));
        }
        Ok(peer.to_string())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> KmeResult<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| KmeError::Unauthorized(format!("missing {name} header")))
}
