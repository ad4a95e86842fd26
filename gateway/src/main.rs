use axum::http::StatusCode;
use axum::middleware;
use axum::response::Response;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use common_http_errors::http_error_metrics_layer;
use gateway::admin;
use gateway::app_state::GatewayState;
use gateway::auth_middleware::{admin_auth_middleware, bearer_auth_middleware};
use gateway::blob_store::{BlobStore, RedisBlobStore};
use gateway::config::GatewayConfig;
use gateway::dispatcher::{chat_completions, web_search};
use gateway::metrics::GatewayMetrics;
use gateway::pool::ProviderPool;
use gateway::quota::QuotaManager;
use gateway::registry::ProviderRegistry;
use reqwest::Client;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(axum::extract::State(state): axum::extract::State<GatewayState>) -> Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "failed to render metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(axum::body::Body::from("metrics unavailable"))
                .expect("failed to build metrics error response")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = Arc::new(GatewayConfig::from_env()?);

    let db_pool = PgPool::connect(&config.database_url).await?;
    let blob: Arc<dyn BlobStore> =
        Arc::new(RedisBlobStore::connect(&config.redis_url, config.redis_prefix.clone()).await?);

    let registry = ProviderRegistry::new(db_pool.clone());
    registry.ensure_schema().await?;

    let quota = QuotaManager::new(db_pool.clone(), config.quota, config.audit_success_logs);
    quota.ensure_schema().await?;

    let http_client = Client::builder().build()?;
    let metrics = Arc::new(GatewayMetrics::new()?);

    let pool = Arc::new(
        ProviderPool::new(
            blob.clone(),
            registry.clone(),
            http_client.clone(),
            config.qwen_oauth_client_id.clone(),
            config.qwen_default_base_url.clone(),
            config.static_auth_files.clone(),
            config.provider_scan_secs,
            config.provider_full_kv_scan_minutes,
        )
        .with_metrics(metrics.clone()),
    );
    // Warm the pool at boot so /admin/api/stats and the first dispatch don't
    // race an empty snapshot; `initialization order: clock -> stores ->
    // registry -> quota -> pool -> dispatcher` from spec.md §9.
    pool.rescan(false).await;
    let warm_count = pool.provider_count().await;
    info!(providers = warm_count, "provider pool warmed");

    let state = GatewayState {
        blob: blob.clone(),
        registry,
        quota: quota.clone(),
        pool: pool.clone(),
        metrics,
        config: config.clone(),
        http_client,
    };

    if let Some(url) = config.alert_webhook_url.clone() {
        let engine = Arc::new(gateway::alerts::AlertEngine::new(
            blob.clone(),
            state.http_client.clone(),
            pool.clone(),
            quota.clone(),
            Some(url),
            config.alert_auth_failed_threshold,
            config.alert_daily_quota_threshold_percent,
            config.alert_tick_secs,
        ));
        tokio::spawn(engine.run_forever());
    }

    let v1_state = state.clone();
    let v1 = Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/tools/web_search", post(web_search))
        .layer(middleware::from_fn_with_state(v1_state.clone(), bearer_auth_middleware))
        .with_state(v1_state);

    let admin_state = state.clone();
    let admin_router = Router::new()
        .route("/api/stats", get(admin::stats))
        .route("/api/auth/start", post(admin::auth_start))
        .route("/api/auth/poll", post(admin::auth_poll))
        .route("/api/providers/alias", patch(admin::set_alias))
        .route("/api/providers", delete(admin::remove_provider))
        .route("/api/providers/rescan", post(admin::rescan))
        .layer(middleware::from_fn_with_state(admin_state.clone(), admin_auth_middleware))
        .with_state(admin_state);

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .nest("/v1", v1)
        .nest("/admin", admin_router)
        .with_state(state)
        .layer(middleware::from_fn(http_error_metrics_layer("gateway")));

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8787);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    info!(%addr, "starting gateway");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
