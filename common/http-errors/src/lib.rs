//! Shared error shape and error-rate metrics for gateway HTTP handlers.

use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    /// Mirrors `code` under the key spec.md §6 "Gateway error bodies" pins
    /// for the aggregate dispatch-outcome responses (`error`, not `code`).
    /// `None` for the non-aggregate variants, which aren't part of that
    /// documented contract.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

/// Gateway-facing error taxonomy. Variants map 1:1 onto the aggregate-outcome
/// response table the dispatcher produces after walking the provider pool.
#[derive(Debug)]
pub enum ApiError {
    ForbiddenMissingRole {
        role: &'static str,
        trace_id: Option<Uuid>,
    },
    Forbidden {
        trace_id: Option<Uuid>,
    },
    BadRequest {
        code: &'static str,
        trace_id: Option<Uuid>,
        message: Option<String>,
    },
    NotFound {
        code: &'static str,
        trace_id: Option<Uuid>,
    },
    /// All candidate providers came back with an expired/invalid credential.
    AllUnauthorized {
        details: String,
    },
    /// All candidate providers were blocked at admission or hit upstream rate limits.
    AllRateLimited {
        details: String,
    },
    /// All candidate providers reported free-tier quota exhaustion.
    AllQuotaExceeded {
        details: String,
    },
    /// Some providers were attempted but none of them are presently reachable.
    NoAvailableProviders {
        details: String,
        errors: Vec<String>,
    },
    /// Every attempted provider failed for a mix of reasons.
    AllFailed {
        details: String,
        attempts: u32,
        errors: Vec<String>,
    },
    /// The pool has no configured providers at all.
    NoProvidersConfigured,
    Internal {
        trace_id: Option<Uuid>,
        message: Option<String>,
    },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self {
        Self::Internal {
            trace_id,
            message: Some(e.to_string()),
        }
    }

    pub fn bad_request(code: &'static str, trace_id: Option<Uuid>) -> Self {
        Self::BadRequest {
            code,
            trace_id,
            message: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body, error_code) = match self {
            ApiError::ForbiddenMissingRole { role, trace_id } => (
                StatusCode::FORBIDDEN,
                ErrorBody {
                    code: "missing_role".into(),
                    error: None,
                    missing_role: Some(role.into()),
                    trace_id,
                    message: None,
                    details: None,
                    attempts: None,
                    errors: None,
                },
                "missing_role",
            ),
            ApiError::Forbidden { trace_id } => (
                StatusCode::FORBIDDEN,
                ErrorBody {
                    code: "forbidden".into(),
                    error: None,
                    missing_role: None,
                    trace_id,
                    message: None,
                    details: None,
                    attempts: None,
                    errors: None,
                },
                "forbidden",
            ),
            ApiError::BadRequest {
                code,
                trace_id,
                message,
            } => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    code: code.into(),
                    error: None,
                    missing_role: None,
                    trace_id,
                    message,
                    details: None,
                    attempts: None,
                    errors: None,
                },
                code,
            ),
            ApiError::NotFound { code, trace_id } => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    code: code.into(),
                    error: None,
                    missing_role: None,
                    trace_id,
                    message: None,
                    details: None,
                    attempts: None,
                    errors: None,
                },
                code,
            ),
            ApiError::AllUnauthorized { details } => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    code: "All providers unauthorized".into(),
                    error: Some("All providers unauthorized".to_string()),
                    missing_role: None,
                    trace_id: None,
                    message: None,
                    details: Some(details),
                    attempts: None,
                    errors: None,
                },
                "all_unauthorized",
            ),
            ApiError::AllRateLimited { details } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorBody {
                    code: "All providers rate limited".into(),
                    error: Some("All providers rate limited".to_string()),
                    missing_role: None,
                    trace_id: None,
                    message: None,
                    details: Some(details),
                    attempts: None,
                    errors: None,
                },
                "all_rate_limited",
            ),
            ApiError::AllQuotaExceeded { details } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorBody {
                    code: "All providers quota exceeded".into(),
                    error: Some("All providers quota exceeded".to_string()),
                    missing_role: None,
                    trace_id: None,
                    message: None,
                    details: Some(details),
                    attempts: None,
                    errors: None,
                },
                "all_quota_exceeded",
            ),
            ApiError::NoAvailableProviders { details, errors } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    code: "No available providers".into(),
                    error: Some("No available providers".to_string()),
                    missing_role: None,
                    trace_id: None,
                    message: None,
                    details: Some(details),
                    attempts: None,
                    errors: Some(errors),
                },
                "no_available_providers",
            ),
            ApiError::AllFailed {
                details,
                attempts,
                errors,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    code: "All providers failed".into(),
                    error: Some("All providers failed".to_string()),
                    missing_role: None,
                    trace_id: None,
                    message: None,
                    details: Some(details),
                    attempts: Some(attempts),
                    errors: Some(errors),
                },
                "all_failed",
            ),
            ApiError::NoProvidersConfigured => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    code: "No Qwen providers configured".into(),
                    error: Some("No Qwen providers configured".to_string()),
                    missing_role: None,
                    trace_id: None,
                    message: None,
                    details: None,
                    attempts: None,
                    errors: None,
                },
                "no_providers_configured",
            ),
            ApiError::Internal { trace_id, message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    code: "internal_error".into(),
                    error: None,
                    missing_role: None,
                    trace_id,
                    message,
                    details: None,
                    attempts: None,
                    errors: None,
                },
                "internal_error",
            ),
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Error-rate metrics with a cardinality guard.
//
// `ApiError::BadRequest` and friends carry a free-form `code`; a misbehaving
// caller (or a bug upstream) could mint an unbounded number of distinct codes
// and blow up the `http_errors_total{code=...}` series cardinality. We cap
// the number of distinct codes tracked per process and fold the remainder
// into a single `overflow` bucket.
// ---------------------------------------------------------------------------

const MAX_ERROR_CODES: usize = 40;

static HTTP_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_errors_total",
        "Count of HTTP error responses emitted (status >= 400)",
        &["service", "code", "status"]
    )
    .expect("http_errors_total already registered")
});

static DISTINCT_ERROR_CODES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "http_errors_distinct_codes",
        "Distinct error codes observed since process start, capped at the cardinality guard"
    )
    .expect("http_errors_distinct_codes already registered")
});

static ERROR_CODE_OVERFLOW: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_errors_code_overflow_total",
        "Count of error responses whose code was folded into the overflow bucket",
        &["service"]
    )
    .expect("http_errors_code_overflow_total already registered")
});

static SEEN_CODES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn record_error_code(service: &str, code: &str, status: u16) {
    let bounded_code = {
        let mut seen = SEEN_CODES.lock().expect("error-code set poisoned");
        if seen.contains(code) {
            code.to_string()
        } else if seen.len() < MAX_ERROR_CODES {
            seen.insert(code.to_string());
            DISTINCT_ERROR_CODES.set(seen.len() as i64);
            code.to_string()
        } else {
            ERROR_CODE_OVERFLOW.with_label_values(&[service]).inc();
            "overflow".to_string()
        }
    };
    HTTP_ERRORS_TOTAL
        .with_label_values(&[service, &bounded_code, &status.to_string()])
        .inc();
}

/// Axum middleware that records every >=400 response into `http_errors_total`,
/// reading the `X-Error-Code` header set by [`ApiError::into_response`].
pub fn http_error_metrics_layer(
    service: &'static str,
) -> impl Fn(Request, Next) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>
       + Clone
       + Send
       + 'static {
    move |req: Request, next: Next| {
        Box::pin(async move {
            let response = next.run(req).await;
            let status = response.status();
            if status.as_u16() >= 400 {
                let code = response
                    .headers()
                    .get("X-Error-Code")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown")
                    .to_string();
                record_error_code(service, &code, status.as_u16());
            }
            response
        })
    }
}

/// Test-only hooks for exercising the cardinality guard without standing up
/// a full axum app.
pub mod test_helpers {
    use super::*;

    pub fn simulate_error_code(code: &str) {
        record_error_code("test-svc", code, 400);
    }

    pub fn distinct_gauge() -> i64 {
        DISTINCT_ERROR_CODES.get()
    }

    pub fn overflow_count() -> i64 {
        ERROR_CODE_OVERFLOW.with_label_values(&["test-svc"]).get()
    }
}
