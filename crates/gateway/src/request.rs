use axum::http::HeaderMap;

/// Runtime context for one gateway request.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestContext {
    /// Caller-supplied user identifier, seeds the prefix-cache session.
    pub user_id: Option<String>,

    /// Incoming request headers.
    #[allow(dead_code)]
    pub headers: HeaderMap,
}

/// Extract the request context from headers and the request body metadata.
pub(super) fn extract_context(headers: &HeaderMap, user_id: Option<String>) -> RequestContext {
    let user_id = user_id.or_else(|| {
        headers
            .get("x-relay-user-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });

    RequestContext {
        user_id,
        headers: headers.clone(),
    }
}
