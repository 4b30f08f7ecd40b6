use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use uuid::Uuid;

/// When enabled, internal error detail is echoed in 500 responses.
/// Off by default; set from `service.expose_error_detail` at startup.
static EXPOSE_ERROR_DETAIL: AtomicBool = AtomicBool::new(false);

pub fn set_expose_error_detail(enabled: bool) {
    EXPOSE_ERROR_DETAIL.store(enabled, Ordering::Relaxed);
}

/// Errors surfaced by the gateway's ingestion and query paths.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed caller input. The message names the offending field.
    #[error("{0}")]
    Validation(String),

    /// The device-protocol decoder rejected the payload. Terminal: a
    /// malformed payload will not self-correct on retry.
    #[error("Failed to parse device data: {0}")]
    Decode(String),

    /// The durable store is unreachable after one reconnect attempt.
    #[error("Database unavailable")]
    StoreUnavailable,

    /// One of the artifact uploads failed. The sibling artifact is not
    /// rolled back and no record is written.
    #[error("Artifact upload failed: {0}")]
    ArtifactUpload(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Shorthand for a missing-required-field validation error.
    pub fn required(field: &str) -> Self {
        GatewayError::Validation(format!("{field} is required"))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) | GatewayError::Decode(_) => StatusCode::BAD_REQUEST,
            GatewayError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ArtifactUpload(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to the caller. Internal errors collapse to a
    /// generic message unless detail exposure was enabled at startup.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Internal(e) => {
                if EXPOSE_ERROR_DETAIL.load(Ordering::Relaxed) {
                    format!("Internal server error: {e:#}")
                } else {
                    "Internal server error".to_string()
                }
            }
            other => other.to_string(),
        }
    }
}

/// Render an error as the standard `{success: false, ...}` body, tagging
/// the response with the request correlation id when the caller has one.
pub fn error_response(err: &GatewayError, request_id: Option<Uuid>) -> Response {
    let mut body = json!({
        "success": false,
        "message": err.public_message(),
    });
    if let Some(id) = request_id {
        body["request_id"] = json!(id);
    }
    (err.status_code(), Json(body)).into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        error_response(&self, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::required("device_status").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Decode("bad section".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::StoreUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::ArtifactUpload("s3 put failed".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::NotFound("ECG record").status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_required_names_the_field() {
        let err = GatewayError::required("device_data");
        assert_eq!(err.to_string(), "device_data is required");
    }

    #[test]
    fn test_internal_detail_hidden_by_default() {
        let err = GatewayError::Internal(anyhow::anyhow!("connection refused on 10.0.0.3"));
        assert_eq!(err.public_message(), "Internal server error");
    }
}
