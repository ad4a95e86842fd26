//! Entry point: binds an inbound request to the provider pool, performs the
//! upstream call via [`crate::pool::ProviderPool`], and shapes the result
//! into the gateway's HTTP response — buffered JSON, or an SSE stream piped
//! through [`crate::stream_dedup::StreamDedup`].
//!
//! Each dispatch owns a fresh [`DeferredWork`] so quota bookkeeping is
//! detached from response writing: the handler spawns it, builds the
//! response, then hands the join future to the runtime instead of awaiting
//! it, so the client is never blocked on a store write it doesn't care about.

use crate::account_provider::{ChatBody, ChatResponse, SearchResponse};
use crate::app_state::GatewayState;
use crate::deferred::DeferredWork;
use crate::stream_dedup::StreamDedup;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_http_errors::ApiError;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

pub async fn chat_completions(
    State(state): State<GatewayState>,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let deferred = Arc::new(DeferredWork::new());
    let result = state.pool.dispatch_chat(&state.quota, &deferred, payload).await;
    tokio::spawn(async move { deferred.join_all().await });

    match result {
        Ok(chat) => {
            state.record_dispatch_metrics("chat", "success");
            Ok(render_chat_response(chat, state.metrics.clone()))
        }
        Err(err) => {
            state.record_dispatch_metrics("chat", "rejected");
            Err(err)
        }
    }
}

fn render_chat_response(chat: ChatResponse, metrics: Arc<crate::metrics::GatewayMetrics>) -> Response {
    let status = StatusCode::from_u16(chat.status).unwrap_or(StatusCode::OK);

    match chat.body {
        ChatBody::Buffered(bytes) => {
            let mut response = Response::builder().status(status);
            if let Some(content_type) = &chat.content_type {
                response = response.header(header::CONTENT_TYPE, content_type);
            }
            response
                .body(Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        ChatBody::EventStream(upstream) => {
            let mut dedup = StreamDedup::new();
            let provider_id = chat.provider_id;
            let byte_stream = upstream.bytes_stream().map(move |chunk| {
                let dropped_before = dedup.dropped_count();
                let out = match chunk {
                    Ok(bytes) => Ok::<_, std::io::Error>(dedup.push(&bytes)),
                    Err(err) => {
                        warn!(?err, "upstream stream read failed mid-flight");
                        Ok(dedup.flush())
                    }
                };
                metrics.record_stream_dedup_drop(&provider_id, dedup.dropped_count() - dropped_before);
                out
            });
            let mut response = Response::builder().status(status);
            if let Some(content_type) = &chat.content_type {
                response = response.header(header::CONTENT_TYPE, content_type);
            }
            response
                .body(Body::from_stream(byte_stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

pub async fn web_search(
    State(state): State<GatewayState>,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let query = payload
        .get("query")
        .and_then(Value::as_str)
        .filter(|q| !q.trim().is_empty());
    let Some(query) = query else {
        return Err(ApiError::bad_request("missing_query", None));
    };

    let deferred = Arc::new(DeferredWork::new());
    let result = state.pool.dispatch_search(&state.quota, &deferred, query).await;
    tokio::spawn(async move { deferred.join_all().await });

    match result {
        Ok(search) => {
            state.record_dispatch_metrics("search", "success");
            Ok(Json(search_response_body(search)).into_response())
        }
        Err(err) => {
            state.record_dispatch_metrics("search", "rejected");
            Err(err)
        }
    }
}

fn search_response_body(result: SearchResponse) -> Value {
    json!({
        "success": true,
        "query": result.query,
        "results": result.results.into_iter().map(|r| json!({
            "title": r.title,
            "url": r.url,
            "content": r.content,
            "score": r.score,
            "publishedDate": r.published_date,
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_response_body_has_expected_shape() {
        let result = SearchResponse {
            query: "rust".to_string(),
            results: vec![],
        };
        let body = search_response_body(result);
        assert_eq!(body["success"], true);
        assert_eq!(body["query"], "rust");
        assert!(body["results"].as_array().unwrap().is_empty());
    }
}
