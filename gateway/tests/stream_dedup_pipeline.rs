//! Drives a real `text/event-stream` response from a mocked upstream through
//! `AccountProvider::handle_chat` and then through `StreamDedup` exactly as
//! `dispatcher::render_chat_response` does, confirming adjacent-duplicate
//! deltas are dropped end-to-end rather than only at the unit level.

mod support;

use futures_util::StreamExt;
use gateway::account_provider::ChatBody;
use gateway::deferred::DeferredWork;
use gateway::stream_dedup::StreamDedup;
use httpmock::MockServer;
use serde_json::json;

fn sse_event(content: &str) -> String {
    format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}")
}

#[tokio::test]
async fn duplicate_deltas_are_dropped_across_the_full_pipeline() {
    let server = MockServer::start();
    let body = format!(
        "{}\n\n{}\n\n{}\n\ndata: [DONE]\n\n",
        sse_event("hello"),
        sse_event("hello"),
        sse_event("world"),
    );
    server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/v1/chat/completions");
        then.status(200).header("content-type", "text/event-stream").body(body);
    });

    let provider = support::account_provider("acct-stream", Some(&server.base_url())).await;
    let quota = support::unlimited_quota();
    let deferred = DeferredWork::new();

    let chat = provider
        .handle_chat(&quota, &deferred, json!({"messages": [], "stream": true}))
        .await
        .expect("mocked event-stream should dispatch as success");
    deferred.join_all().await;

    let upstream = match chat.body {
        ChatBody::EventStream(resp) => resp,
        ChatBody::Buffered(_) => panic!("expected an event-stream body for a text/event-stream content type"),
    };

    let mut dedup = StreamDedup::new();
    let mut forwarded = Vec::new();
    let mut stream = upstream.bytes_stream();
    while let Some(chunk) = stream.next().await {
        forwarded.push(dedup.push(&chunk.unwrap()));
    }
    forwarded.push(dedup.flush());

    let text: String = forwarded
        .into_iter()
        .map(|b| String::from_utf8(b.to_vec()).unwrap())
        .collect();
    let events: Vec<&str> = text.split("\n\n").filter(|s| !s.is_empty()).collect();

    assert_eq!(events.len(), 3, "one duplicate 'hello' delta should have been dropped: {events:?}");
    assert!(events[0].contains("hello"));
    assert!(events[1].contains("world"));
    assert!(events[2].contains("[DONE]"));
    assert_eq!(dedup.dropped_count(), 1);
}
