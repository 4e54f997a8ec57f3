use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::messages::anthropic;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Gateway errors with their HTTP status and retry classification.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed request: missing model, invalid body, unknown dialect.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Provider kind unknown to this deployment.
    #[error("Provider '{0}' not found")]
    ProviderNotFound(String),

    /// The provider rejected the model name outright.
    #[error("{0}")]
    ModelNotFound(String),

    /// The credential was rejected upstream (401/403, token invalid).
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Upstream quota or billing limit hit on this credential.
    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Upstream rate limit, surfaced to the caller as 429.
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        /// Upstream error body.
        message: String,
    },

    /// No eligible credential for the provider and no fallback left.
    #[error("No healthy credential available for provider '{provider}'")]
    NoHealthyCredential {
        /// The exhausted provider.
        provider: String,
    },

    /// Transport-level failure reaching the upstream.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A streaming upstream went silent past the inter-event timeout.
    #[error("Stream timed out waiting for upstream events")]
    StreamTimeout,

    /// Upstream returned a status the gateway has no specific mapping for.
    #[error("Provider API error ({status}): {message}")]
    ProviderApiError {
        /// Upstream HTTP status.
        status: u16,
        /// Upstream error body.
        message: String,
    },

    /// Internal failure. `Some` carries a provider message that is safe to
    /// show; `None` must not leak details.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl GatewayError {
    /// Whether the whole request may be retried on a fresh credential.
    ///
    /// Transport failures, timeouts, 408/429 and 5xx count as retryable;
    /// credential-scoped errors are retryable too since the retry switches
    /// credentials first. Everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionError(_) | Self::StreamTimeout | Self::RateLimitExceeded { .. } => true,
            Self::AuthenticationFailed(_) | Self::QuotaExhausted(_) => true,
            Self::ProviderApiError { status, .. } => matches!(status, 408 | 429 | 500..=599),
            _ => false,
        }
    }

    /// Whether the failure is pinned to the credential rather than the
    /// request. Such errors quarantine the credential immediately.
    pub fn should_switch_credential(&self) -> bool {
        match self {
            Self::AuthenticationFailed(_) | Self::QuotaExhausted(_) => true,
            Self::ProviderApiError { status, message } => {
                matches!(status, 401 | 403)
                    || message.contains("invalid token")
                    || message.contains("token expired")
                    || message.contains("unauthorized")
            }
            _ => false,
        }
    }

    /// HTTP status returned to the caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            Self::QuotaExhausted(_) | Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ProviderNotFound(_) | Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::NoHealthyCredential { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ConnectionError(_) | Self::StreamTimeout => StatusCode::BAD_GATEWAY,
            Self::ProviderApiError { status, .. } => match *status {
                400 => StatusCode::BAD_REQUEST,
                401 => StatusCode::UNAUTHORIZED,
                403 => StatusCode::FORBIDDEN,
                404 => StatusCode::NOT_FOUND,
                429 => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error type for the response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::AuthenticationFailed(_) => "authentication_error",
            Self::QuotaExhausted(_) => "insufficient_quota",
            Self::RateLimitExceeded { .. } => "rate_limit_error",
            Self::ProviderNotFound(_) | Self::ModelNotFound(_) => "not_found_error",
            Self::NoHealthyCredential { .. } => "no_healthy_provider",
            Self::ConnectionError(_) | Self::StreamTimeout | Self::ProviderApiError { .. } => "api_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(provider_msg)) => provider_msg.clone(),
            Self::Internal(None) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Map an upstream HTTP status and body to the matching error.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            400 => Self::InvalidRequest(message),
            401 => Self::AuthenticationFailed(message),
            403 => Self::QuotaExhausted(message),
            404 => Self::ModelNotFound(message),
            429 => Self::RateLimitExceeded { message },
            500 => Self::Internal(Some(message)),
            _ => Self::ProviderApiError { status, message },
        }
    }
}

/// Error body shape: `{"error": {"message", "type", "code"}}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    r#type: String,
    code: u16,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = ErrorBody {
            error: ErrorDetails {
                message: self.client_message(),
                r#type: self.error_type().to_string(),
                code: status.as_u16(),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<GatewayError> for anthropic::ErrorResponse {
    fn from(error: GatewayError) -> Self {
        Self {
            r#type: "error".to_string(),
            error: anthropic::ErrorDetails {
                r#type: error.error_type().to_string(),
                message: error.client_message(),
            },
        }
    }
}

/// Gateway error rendered in the Anthropic error envelope.
pub struct AnthropicErrorResponse {
    status: StatusCode,
    body: anthropic::ErrorResponse,
}

impl From<GatewayError> for AnthropicErrorResponse {
    fn from(error: GatewayError) -> Self {
        let status = error.status_code();
        let body = anthropic::ErrorResponse::from(error);

        Self { status, body }
    }
}

impl IntoResponse for AnthropicErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type AnthropicResult<T> = std::result::Result<T, AnthropicErrorResponse>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_scoped_errors_switch_credentials() {
        assert!(GatewayError::AuthenticationFailed("bad key".into()).should_switch_credential());
        assert!(GatewayError::QuotaExhausted("empty".into()).should_switch_credential());
        assert!(
            GatewayError::ProviderApiError {
                status: 502,
                message: "invalid token".into()
            }
            .should_switch_credential()
        );
        assert!(!GatewayError::ConnectionError("reset".into()).should_switch_credential());
    }

    #[test]
    fn retry_classification() {
        assert!(GatewayError::ConnectionError("reset".into()).is_retryable());
        assert!(GatewayError::StreamTimeout.is_retryable());
        assert!(
            GatewayError::ProviderApiError {
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!GatewayError::InvalidRequest("bad".into()).is_retryable());
        assert!(!GatewayError::ModelNotFound("nope".into()).is_retryable());
    }

    #[test]
    fn no_healthy_credential_is_503() {
        let error = GatewayError::NoHealthyCredential {
            provider: "openai".into(),
        };

        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.error_type(), "no_healthy_provider");
    }

    #[test]
    fn internal_errors_do_not_leak() {
        assert_eq!(GatewayError::Internal(None).client_message(), "Internal server error");
        assert_eq!(
            GatewayError::Internal(Some("upstream said no".into())).client_message(),
            "upstream said no"
        );
    }
}
