//! Admin surface named in `spec.md` §6 but not specified in detail there;
//! `SPEC_FULL.md` §4 calls for typed responses assembling runtime state,
//! quota snapshots, and global counters. Every handler here is gated by
//! `X-Admin-Key` via [`crate::auth_middleware::admin_auth_middleware`].

use crate::account_provider::ProviderStatus;
use crate::app_state::GatewayState;
use crate::auth_manager::{AuthManager, ExchangeOutcome};
use crate::blob_store::BlobStoreExt;
use crate::credential::canonicalize_key;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use common_http_errors::ApiError;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

const PENDING_AUTH_TTL_SECS: u64 = 600;

#[derive(Debug, Serialize)]
pub struct ProviderStatsEntry {
    pub id: String,
    pub alias: Option<String>,
    pub status: &'static str,
    pub last_error: Option<String>,
    pub total_requests: u64,
    pub error_count: u64,
    pub last_latency_ms: Option<u64>,
    pub usage: Value,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub provider_count: usize,
    pub providers: Vec<ProviderStatsEntry>,
}

pub async fn stats(State(state): State<GatewayState>) -> Result<Json<StatsResponse>, ApiError> {
    let providers = state.pool.snapshot().await;
    let ids: Vec<String> = providers.iter().map(|p| p.id().to_string()).collect();
    let usage_batch = state.quota.get_usage_batch(&ids).await;

    let entries = futures_util::future::join_all(providers.iter().map(|provider| async {
        let runtime = provider.snapshot().await;
        let usage = usage_batch.get(provider.id()).copied().unwrap_or_default();
        ProviderStatsEntry {
            id: runtime.id.clone(),
            alias: runtime.alias.clone(),
            status: status_label(runtime.status),
            last_error: runtime.last_error.clone(),
            total_requests: runtime.total_requests,
            error_count: runtime.error_count,
            last_latency_ms: runtime.last_latency_ms,
            usage: json!({
                "chat": {
                    "daily": usage.chat.daily,
                    "rpm": usage.chat.rpm,
                },
                "search": {
                    "daily": usage.search.daily,
                    "rpm": usage.search.rpm,
                },
            }),
        }
    }))
    .await;

    Ok(Json(StatsResponse {
        provider_count: entries.len(),
        providers: entries,
    }))
}

fn status_label(status: ProviderStatus) -> &'static str {
    match status {
        ProviderStatus::Initializing => "initializing",
        ProviderStatus::Active => "active",
        ProviderStatus::Error => "error",
        ProviderStatus::Inactive => "inactive",
    }
}

#[derive(Debug, Serialize)]
pub struct AuthStartResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: u64,
    pub interval: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingAuth {
    canonical_id: String,
    code_verifier: String,
}

fn random_account_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("qwen_creds_{}.json", hex::encode(bytes))
}

fn generate_pkce() -> (String, String) {
    let mut verifier_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut verifier_bytes);
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

/// Starts device-code enrollment for a brand-new account: mints a fresh
/// canonical credential key before the account exists anywhere, stashes the
/// PKCE verifier alongside it under the device code so `auth/poll` can
/// resume the same flow from a second, stateless request.
pub async fn auth_start(State(state): State<GatewayState>) -> Result<Json<AuthStartResponse>, ApiError> {
    let canonical_id = random_account_id();
    let auth = AuthManager::new(
        canonical_id.clone(),
        state.config.qwen_oauth_client_id.clone(),
        state.blob.clone(),
        state.http_client.clone(),
    );
    let (verifier, challenge) = generate_pkce();

    let started = auth
        .start_device_auth(&challenge)
        .await
        .map_err(|err| ApiError::internal(err, None))?;

    let pending = PendingAuth {
        canonical_id,
        code_verifier: verifier,
    };
    let pending_key = format!("admin_pending_auth:{}", started.device_code);
    state
        .blob
        .set_json(&pending_key, &pending, Some(PENDING_AUTH_TTL_SECS))
        .await
        .map_err(|err| ApiError::internal(err, None))?;

    Ok(Json(AuthStartResponse {
        device_code: started.device_code,
        user_code: started.user_code,
        verification_uri: started.verification_uri,
        verification_uri_complete: started.verification_uri_complete,
        expires_in: started.expires_in,
        interval: started.interval,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AuthPollRequest {
    pub device_code: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status")]
pub enum AuthPollResponse {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "complete")]
    Complete { id: String },
}

pub async fn auth_poll(
    State(state): State<GatewayState>,
    Json(req): Json<AuthPollRequest>,
) -> Result<Json<AuthPollResponse>, ApiError> {
    let pending_key = format!("admin_pending_auth:{}", req.device_code);
    let pending = state
        .blob
        .get_json::<PendingAuth>(&pending_key)
        .await
        .map_err(|err| ApiError::internal(err, None))?
        .ok_or_else(|| ApiError::bad_request("unknown_device_code", None))?;

    let auth = AuthManager::new(
        pending.canonical_id.clone(),
        state.config.qwen_oauth_client_id.clone(),
        state.blob.clone(),
        state.http_client.clone(),
    );

    match auth
        .exchange_device_code(&req.device_code, &pending.code_verifier)
        .await
        .map_err(|err| ApiError::internal(err, None))?
    {
        ExchangeOutcome::Pending => Ok(Json(AuthPollResponse::Pending)),
        ExchangeOutcome::Credential(_) => {
            state
                .blob
                .delete(&pending_key)
                .await
                .map_err(|err| ApiError::internal(err, None))?;
            state
                .registry
                .upsert_id(&pending.canonical_id)
                .await
                .map_err(|err| ApiError::internal(err, None))?;
            state.pool.rescan(false).await;
            Ok(Json(AuthPollResponse::Complete {
                id: pending.canonical_id,
            }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct AliasBody {
    pub alias: Option<String>,
}

pub async fn set_alias(
    State(state): State<GatewayState>,
    Query(query): Query<IdQuery>,
    Json(body): Json<AliasBody>,
) -> Result<impl IntoResponse, ApiError> {
    let id = canonicalize_key(&query.id);
    state
        .registry
        .set_alias(&id, body.alias.as_deref())
        .await
        .map_err(|err| ApiError::internal(err, None))?;
    state.pool.apply_alias_map().await;
    Ok(Json(json!({ "ok": true })))
}

pub async fn remove_provider(
    State(state): State<GatewayState>,
    Query(query): Query<IdQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let id = canonicalize_key(&query.id);
    state
        .registry
        .remove(&id)
        .await
        .map_err(|err| ApiError::internal(err, None))?;
    state.pool.rescan(false).await;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct RescanQuery {
    #[serde(default)]
    pub mode: Option<String>,
}

pub async fn rescan(
    State(state): State<GatewayState>,
    Query(query): Query<RescanQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let full = query.mode.as_deref() == Some("full");
    state.pool.rescan(full).await;
    Ok(Json(json!({ "ok": true, "mode": if full { "full" } else { "light" } })))
}
