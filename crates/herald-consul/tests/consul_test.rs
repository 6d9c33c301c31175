//! Consul backend integration tests
//!
//! Drives `ConsulClient` against a wiremock agent: sessions, KV acquire and
//! release, child listings with blocking-query watches, and session loss.

use std::time::Duration;

use bytes::Bytes;
use herald_common::RetryConfig;
use herald_consul::{ConsulClient, ConsulConfig};
use herald_coordination::{CoordinationClient, CoordinationError, SessionState};
use serde_json::json;
use tokio::sync::broadcast;
use wiremock::matchers::{
    body_string, header, method, path, path_regex, query_param, query_param_is_missing,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
        multiplier: 2.0,
        jitter_factor: 0.0,
    }
}

async fn mount_session(server: &MockServer, id: &str) {
    Mock::given(method("PUT"))
        .and(path("/v1/session/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ID": id })))
        .mount(server)
        .await;
}

async fn next_state(events: &mut broadcast::Receiver<SessionState>) -> SessionState {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("session channel closed")
}

#[tokio::test]
async fn test_connect_sends_token_and_ephemeral_session() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/create"))
        .and(header("X-Consul-Token", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ID": "sess-1" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = ConsulClient::connect(ConsulConfig::new(&server.uri()).with_token("secret"))
        .await
        .unwrap();
    assert_eq!(client.session_id().as_deref(), Some("sess-1"));
    assert_eq!(client.session_state(), SessionState::Connected);

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["Behavior"], "delete");
    assert_eq!(body["LockDelay"], "0s");
    assert_eq!(body["TTL"], "15s");
}

#[tokio::test]
async fn test_connect_fails_when_agent_errors() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/create"))
        .respond_with(ResponseTemplate::new(500).set_body_string("No cluster leader"))
        .mount(&server)
        .await;

    let result = ConsulClient::connect(ConsulConfig::new(&server.uri())).await;
    assert!(matches!(result, Err(CoordinationError::Transport(_))));
}

#[tokio::test]
async fn test_create_ephemeral_acquires_key() {
    let server = MockServer::start().await;
    mount_session(&server, "sess-1").await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/v1/kv/herald/Foo/server"))
        .and(query_param("acquire", "sess-1"))
        .and(body_string("entry"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ConsulClient::connect(ConsulConfig::new(&server.uri()))
        .await
        .unwrap();
    client
        .create_ephemeral("/herald/Foo/server%3A8080", Bytes::from_static(b"entry"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_key_held_by_other_session() {
    let server = MockServer::start().await;
    mount_session(&server, "sess-1").await;
    Mock::given(method("PUT"))
        .and(path("/v1/kv/herald/Foo/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("false"))
        .mount(&server)
        .await;

    let client = ConsulClient::connect(ConsulConfig::new(&server.uri()))
        .await
        .unwrap();
    let result = client
        .create_ephemeral("/herald/Foo/a", Bytes::from_static(b"x"))
        .await;
    assert_eq!(
        result,
        Err(CoordinationError::NodeOwned("/herald/Foo/a".to_string()))
    );
}

fn held_pair(session: &str) -> serde_json::Value {
    json!([{
        "Key": "herald/Foo/a",
        "CreateIndex": 4,
        "ModifyIndex": 9,
        "LockIndex": 1,
        "Flags": 0,
        "Value": "eA==",
        "Session": session
    }])
}

#[tokio::test]
async fn test_delete_owned_releases_own_key_with_cas() {
    let server = MockServer::start().await;
    mount_session(&server, "sess-1").await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/herald/Foo/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(held_pair("sess-1")))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/kv/herald/Foo/a"))
        .and(query_param("cas", "9"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ConsulClient::connect(ConsulConfig::new(&server.uri()))
        .await
        .unwrap();
    assert!(client.delete_owned("/herald/Foo/a").await.unwrap());
    assert!(!client.delete_owned("/herald/Foo/missing").await.unwrap());
}

#[tokio::test]
async fn test_delete_owned_leaves_key_of_other_session() {
    let server = MockServer::start().await;
    mount_session(&server, "sess-1").await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/herald/Foo/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(held_pair("sess-other")))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/kv/herald/Foo/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .expect(0)
        .mount(&server)
        .await;

    let client = ConsulClient::connect(ConsulConfig::new(&server.uri()))
        .await
        .unwrap();
    assert!(!client.delete_owned("/herald/Foo/a").await.unwrap());
}

#[tokio::test]
async fn test_children_listing_and_watch_fire() {
    let server = MockServer::start().await;
    mount_session(&server, "sess-1").await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/herald/Foo/"))
        .and(query_param("separator", "/"))
        .and(query_param_is_missing("index"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "5")
                .set_body_json(json!(["herald/Foo/a", "herald/Foo/b", "herald/Foo/nested/"])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/herald/Foo/"))
        .and(query_param("index", "5"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "6")
                .set_body_json(json!(["herald/Foo/a"])),
        )
        .mount(&server)
        .await;

    let client = ConsulClient::connect(ConsulConfig::new(&server.uri()))
        .await
        .unwrap();
    let (children, watch) = client.get_children_watched("/herald/Foo").await.unwrap();
    assert_eq!(children, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(watch.path(), "/herald/Foo");

    let fired = tokio::time::timeout(Duration::from_secs(5), watch)
        .await
        .unwrap();
    assert!(fired.is_ok());
}

#[tokio::test]
async fn test_missing_prefix_lists_no_children() {
    let server = MockServer::start().await;
    mount_session(&server, "sess-1").await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/herald/Bar/"))
        .and(query_param_is_missing("index"))
        .respond_with(ResponseTemplate::new(404).insert_header("X-Consul-Index", "3"))
        .mount(&server)
        .await;

    let client = ConsulClient::connect(ConsulConfig::new(&server.uri()))
        .await
        .unwrap();
    let (children, _watch) = client.get_children_watched("/herald/Bar").await.unwrap();
    assert!(children.is_empty());
}

#[tokio::test]
async fn test_get_data_decodes_value() {
    let server = MockServer::start().await;
    mount_session(&server, "sess-1").await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/herald/Foo/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "Key": "herald/Foo/a",
            "CreateIndex": 4,
            "ModifyIndex": 4,
            "LockIndex": 1,
            "Flags": 0,
            "Value": "aGVsbG8=",
            "Session": "sess-1"
        }])))
        .mount(&server)
        .await;

    let client = ConsulClient::connect(ConsulConfig::new(&server.uri()))
        .await
        .unwrap();
    assert_eq!(
        client.get_data("/herald/Foo/a").await.unwrap(),
        Some(Bytes::from_static(b"hello"))
    );
    assert_eq!(client.get_data("/herald/Foo/missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_invalidated_session_is_replaced() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ID": "sess-1" })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_session(&server, "sess-2").await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/renew/sess-1"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Session id not found"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/renew/sess-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let config = ConsulConfig::new(&server.uri())
        .with_session_ttl(Duration::from_millis(300))
        .with_retry(fast_retry());
    let client = ConsulClient::connect(config).await.unwrap();
    let mut events = client.session_events();

    assert_eq!(next_state(&mut events).await, SessionState::Lost);
    assert_eq!(next_state(&mut events).await, SessionState::Reconnected);
    assert_eq!(client.session_id().as_deref(), Some("sess-2"));
    assert!(client.session_state().is_live());
}

#[tokio::test]
async fn test_renewal_failures_suspend_then_lose_session() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ID": "sess-1" })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_session(&server, "sess-2").await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/renew/sess-1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/destroy/sess-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/renew/sess-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let config = ConsulConfig::new(&server.uri())
        .with_session_ttl(Duration::from_millis(300))
        .with_retry(fast_retry());
    let client = ConsulClient::connect(config).await.unwrap();
    let mut events = client.session_events();

    assert_eq!(next_state(&mut events).await, SessionState::Suspended);
    assert!(matches!(
        client.get_data("/herald/Foo/a").await,
        Err(CoordinationError::ConnectionLoss | CoordinationError::SessionExpired)
    ));
    assert_eq!(next_state(&mut events).await, SessionState::Lost);
    assert_eq!(next_state(&mut events).await, SessionState::Reconnected);
    assert_eq!(client.session_id().as_deref(), Some("sess-2"));
}

#[tokio::test]
async fn test_close_destroys_session() {
    let server = MockServer::start().await;
    mount_session(&server, "sess-1").await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/destroy/sess-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ConsulClient::connect(ConsulConfig::new(&server.uri()))
        .await
        .unwrap();
    client.close().await;
    client.close().await;

    let result = client
        .create_ephemeral("/herald/Foo/a", Bytes::from_static(b"x"))
        .await;
    assert_eq!(result, Err(CoordinationError::Closed));
}
