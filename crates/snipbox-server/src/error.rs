//! HTTP error mapping

use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use snipbox::GatewayError;

/// Error returned by the HTTP handlers
#[derive(Debug)]
pub enum ApiError {
    Gateway(GatewayError),
    BadRequest(String),
    /// Request body over the limit, refused before parsing
    BodyTooLarge { limit: usize },
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError::Gateway(e)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Option<Duration>) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", None),
            ApiError::BodyTooLarge { .. } => (StatusCode::BAD_REQUEST, "payload_too_large", None),
            ApiError::Gateway(e) => match e {
                GatewayError::InvalidLanguage(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_language", None)
                }
                GatewayError::PayloadTooLarge { .. } => {
                    (StatusCode::BAD_REQUEST, "payload_too_large", None)
                }
                GatewayError::Throttled { retry_after } => {
                    (StatusCode::TOO_MANY_REQUESTS, "throttled", Some(*retry_after))
                }
                GatewayError::Rejected { retry_after } => {
                    (StatusCode::FORBIDDEN, "rejected", Some(*retry_after))
                }
                GatewayError::ServiceBusy | GatewayError::ShuttingDown => {
                    (StatusCode::SERVICE_UNAVAILABLE, "service_busy", None)
                }
                GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, retry_after) = self.parts();
        let message = match &self {
            ApiError::Gateway(e) => e.to_string(),
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::BodyTooLarge { limit } => {
                format!("request body exceeds the {limit} byte limit")
            }
        };

        let body = serde_json::json!({
            "error": {
                "type": kind,
                "message": message,
            }
        });
        let mut response = (status, Json(body)).into_response();

        if let Some(retry_after) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
        }
        response
    }
}

/// Whole seconds for `Retry-After`, rounded up and never zero
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}
