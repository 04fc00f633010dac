use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Domain errors raised inside the gateway core.
///
/// Most of these are absorbed where they occur: a failure local to one
/// connection or one recipient never propagates to other delivery paths.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The registry cannot accept another connection. Retryable by the client.
    #[error("connection registry at capacity ({0} connections)")]
    ResourceExhausted(usize),

    /// A write to one specific connection failed; that connection is
    /// presumed dead and unregistered.
    #[error("delivery to connection {0} failed")]
    DeliveryFailed(String),

    /// The membership collaborator could not resolve an audience descriptor.
    #[error("audience resolution failed: {0}")]
    AudienceResolutionFailed(String),
}

/// Structured API error returned to HTTP clients.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "RESOURCE_EXHAUSTED".to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::ResourceExhausted(_) => {
                tracing::warn!(%err, "rejecting handshake: registry at capacity");
                Self::service_unavailable("Server at capacity, retry later")
            }
            other => {
                tracing::error!(%other, "gateway error");
                Self::internal("An internal error occurred")
            }
        }
    }
}
