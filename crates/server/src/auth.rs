//! Shared API key authentication.
//!
//! Every gateway endpoint requires `Authorization: Bearer <api_key>`. Keys
//! are compared by their SHA-256 digests so the comparison cost does not
//! depend on where the candidate diverges.

use axum::{
    extract::Request,
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

#[derive(Clone)]
pub(crate) struct ApiKeyAuth {
    expected_digest: [u8; 32],
}

impl ApiKeyAuth {
    pub fn new(api_key: &SecretString) -> Self {
        Self {
            expected_digest: Sha256::digest(api_key.expose_secret().as_bytes()).into(),
        }
    }

    fn verify(&self, candidate: &str) -> bool {
        let candidate_digest: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();

        // Fixed-width digest comparison: no early exit on the key bytes.
        self.expected_digest
            .iter()
            .zip(candidate_digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

pub(crate) async fn require_api_key(auth: ApiKeyAuth, request: Request, next: Next) -> Response {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        // Anthropic SDK clients send the key in x-api-key instead.
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|value| value.to_str().ok())
        });

    match bearer {
        Some(candidate) if auth.verify(candidate) => next.run(request).await,
        _ => unauthorized(),
    }
}

fn unauthorized() -> Response {
    let body = serde_json::json!({
        "error": {
            "message": "Invalid or missing API key",
            "type": "authentication_error",
            "code": 401
        }
    });

    (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_the_exact_key() {
        let auth = ApiKeyAuth::new(&SecretString::from("s3cret".to_string()));

        assert!(auth.verify("s3cret"));
        assert!(!auth.verify("s3cret "));
        assert!(!auth.verify("S3cret"));
        assert!(!auth.verify(""));
    }
}
