//! End-to-end dispatch scenarios against a mocked upstream, exercising the
//! real `AccountProvider`/`QuotaManager` code paths the router's handlers
//! compose in `ProviderPool::dispatch_chat`. See `tests/support/mod.rs` for
//! why no live Postgres/Redis is needed.

mod support;

use gateway::account_provider::DispatchFailure;
use gateway::deferred::DeferredWork;
use gateway::quota::Kind;
use httpmock::MockServer;
use serde_json::json;

#[tokio::test]
async fn happy_path_chat_completion_succeeds() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"id": "chatcmpl-1", "choices": []}));
    });

    let provider = support::account_provider("acct-happy", Some(&server.base_url())).await;
    let quota = support::unlimited_quota();
    let deferred = DeferredWork::new();

    let result = provider
        .handle_chat(&quota, &deferred, json!({"messages": [{"role": "user", "content": "hi"}]}))
        .await;
    deferred.join_all().await;

    mock.assert();
    let response = result.expect("mocked 200 should dispatch as success");
    assert_eq!(response.status, 200);
    assert_eq!(response.provider_id, provider.id());
    assert_eq!(provider.snapshot().await.status, gateway::account_provider::ProviderStatus::Active);
}

#[tokio::test]
async fn rate_limited_provider_cools_down_then_peer_succeeds() {
    let limited_server = MockServer::start();
    limited_server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/v1/chat/completions");
        then.status(429).body("Too Many Requests");
    });
    let healthy_server = MockServer::start();
    healthy_server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"id": "chatcmpl-2", "choices": []}));
    });

    let limited = support::account_provider("acct-limited", Some(&limited_server.base_url())).await;
    let healthy = support::account_provider("acct-healthy", Some(&healthy_server.base_url())).await;
    let quota = support::unlimited_quota();
    let deferred = DeferredWork::new();
    let payload = json!({"messages": [{"role": "user", "content": "hi"}]});

    let now = chrono::Utc::now().timestamp_millis();
    let failure = limited
        .handle_chat(&quota, &deferred, payload.clone())
        .await
        .unwrap_err();
    assert!(matches!(failure, DispatchFailure::RateLimited));
    assert!(!limited.can_attempt(now).await, "should be cooling down immediately after a 429");
    assert!(
        limited.can_attempt(now + 20_000).await,
        "cooldown window should have lapsed by then"
    );

    let success = healthy.handle_chat(&quota, &deferred, payload).await;
    deferred.join_all().await;
    assert!(success.is_ok(), "peer provider should still dispatch cleanly");
}

#[tokio::test]
async fn quota_exceeded_on_all_candidates_is_classified_distinctly() {
    let server_a = MockServer::start();
    server_a.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/v1/chat/completions");
        then.status(429).json_body(json!({"error": "insufficient_quota"}));
    });
    let server_b = MockServer::start();
    server_b.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/v1/chat/completions");
        then.status(429).body("free allocated quota exceeded");
    });

    let a = support::account_provider("acct-a", Some(&server_a.base_url())).await;
    let b = support::account_provider("acct-b", Some(&server_b.base_url())).await;
    let quota = support::unlimited_quota();
    let deferred = DeferredWork::new();
    let payload = json!({"messages": [{"role": "user", "content": "hi"}]});

    let failure_a = a.handle_chat(&quota, &deferred, payload.clone()).await.unwrap_err();
    let failure_b = b.handle_chat(&quota, &deferred, payload).await.unwrap_err();
    deferred.join_all().await;

    assert!(matches!(failure_a, DispatchFailure::QuotaExceeded));
    assert!(matches!(failure_b, DispatchFailure::QuotaExceeded));
}

#[tokio::test]
async fn account_with_no_stored_credential_is_auth_expired() {
    let provider = support::account_provider("acct-never-enrolled", None).await;
    let quota = support::unlimited_quota();
    let deferred = DeferredWork::new();

    let failure = provider
        .handle_chat(&quota, &deferred, json!({"messages": []}))
        .await
        .unwrap_err();

    assert!(matches!(failure, DispatchFailure::AuthExpired));
    assert_eq!(failure.message(), "Unauthorized (Please Login)");
}

#[tokio::test]
async fn search_dispatch_reuses_the_same_failure_classification() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/api/v1/indices/plugin/web_search");
        then.status(200).json_body(json!({
            "status": 0,
            "data": {"items": [{"title": "t", "url": "u", "snippet": "s", "_score": 1.0}]}
        }));
    });

    let provider = support::account_provider("acct-search", Some(&server.base_url())).await;
    let quota = support::unlimited_quota();
    let deferred = DeferredWork::new();

    let result = provider.handle_search(&quota, &deferred, "rust").await;
    deferred.join_all().await;
    let search = result.expect("mocked search success");
    assert_eq!(search.results.len(), 1);
    assert_eq!(search.results[0].title, "t");

    let usage = quota.get_usage(provider.id()).await;
    assert_eq!(usage.search.daily.used, 0, "db-backed daily counter stays best-effort without a live store");
    let _ = Kind::Search;
}
