use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Pipeline-wide error type
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Source ran dry. Treated as a clean shutdown by every worker.
    #[error("End of stream")]
    EndOfStream,

    #[error("Lost synchronization: {0}")]
    ProtocolDesync(String),

    #[error("Server error: {status} {reason}")]
    ServerError { status: u16, reason: String },

    #[error("RTSP error: {0}")]
    Rtsp(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether the failure may go away by reconnecting (server-side 5xx)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServerError { status, .. } if (500..600).contains(status))
    }

    /// End-of-stream and teardown interruption are shutdown signals, not failures
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::Interrupted)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::ServiceUnavailable(_) | Self::ResourceExhausted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::warn!(
            status = status.as_u16(),
            error_message = %body.message,
            "Request rejected"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, PipelineError>;
