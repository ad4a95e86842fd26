use crate::app_state::GatewayState;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use common_http_errors::ApiError;
use tracing::warn;

/// Single shared bearer token gates every `/v1/*` route.
pub async fn bearer_auth_middleware(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer ").map(str::trim));

    match token {
        Some(token) if constant_time_eq(token, &state.config.api_key) => Ok(next.run(request).await),
        _ => {
            warn!("rejected request with missing or invalid bearer token");
            Err(ApiError::Forbidden { trace_id: None })
        }
    }
}

/// Admin routes use a distinct shared secret carried in `X-Admin-Key`.
pub async fn admin_auth_middleware(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = request
        .headers()
        .get("X-Admin-Key")
        .and_then(|value| value.to_str().ok());

    match key {
        Some(key) if constant_time_eq(key, &state.config.admin_key) => Ok(next.run(request).await),
        _ => {
            warn!("rejected admin request with missing or invalid admin key");
            Err(ApiError::Forbidden { trace_id: None })
        }
    }
}

/// Byte-wise comparison that always walks the full length of `expected`
/// rather than short-circuiting on the first mismatch, so a shared-secret
/// check doesn't leak how many leading bytes a guess got right.
fn constant_time_eq(given: &str, expected: &str) -> bool {
    let given = given.as_bytes();
    let expected = expected.as_bytes();
    if given.len() != expected.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (a, b) in given.iter().zip(expected.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("secret-key", "secret-key"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatches_and_length_differences() {
        assert!(!constant_time_eq("secret-key", "secret-keys"));
        assert!(!constant_time_eq("secret-key", "different!"));
    }
}
