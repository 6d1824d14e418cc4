//! Mapping of key errors to ETSI error responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kme_core::KmeError;
use serde_json::json;

use super::types::ErrorBody;

/// Error returned by API handlers
#[derive(Debug)]
pub struct ApiError(pub KmeError);

impl From<KmeError> for ApiError {
    fn from(e: KmeError) -> Self {
        Self(e)
    }
}

impl ApiError {
    /// HTTP status for the wrapped error
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            KmeError::InsufficientKeys { .. }
            | KmeError::InvalidRequest(_)
            | KmeError::InvalidKeySize(_)
            | KmeError::UnknownSae(_) => StatusCode::BAD_REQUEST,
            KmeError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            KmeError::ReceiverMismatch { .. } => StatusCode::FORBIDDEN,
            KmeError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            KmeError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            KmeError::PeerUnreachable { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn body(&self) -> ErrorBody {
        match &self.0 {
            KmeError::KeyNotFound(ids) => ErrorBody {
                message: "key(s) do not exist".to_string(),
                details: ids.iter().map(|id| json!({ "key_ID": id })).collect(),
            },
            // Never echo the expected receiver back to the caller
            KmeError::ReceiverMismatch { key_id, .. } => ErrorBody {
                message: "receiver does not match key association".to_string(),
                details: vec![json!({ "key_ID": key_id })],
            },
            other => ErrorBody {
                message: other.to_string(),
                details: Vec::new(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
