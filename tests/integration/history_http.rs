// Test-specific lint overrides: integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for the HTTP history fetcher against an in-process
//! axum server: success decoding, auth failures, malformed bodies, and
//! unreachable servers.

use std::time::Duration;

use axum::Router;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use url::Url;

use chatlink::history::{HistoryApi, HistoryError, HttpHistoryClient};
use chatlink_proto::message::{MessageId, UserId};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves `router` on an ephemeral port and returns the base URL.
async fn start_server(router: Router) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Url::parse(&format!("http://{addr}")).unwrap()
}

fn client(base: Url) -> HttpHistoryClient {
    HttpHistoryClient::new(base, REQUEST_TIMEOUT).unwrap()
}

fn peer(id: &str) -> UserId {
    UserId::parse(id).unwrap()
}

#[tokio::test]
async fn success_decodes_the_message_list() {
    let router = Router::new().route(
        "/chat-history/{peer}/",
        get(|Path(peer): Path<String>, headers: HeaderMap| async move {
            assert_eq!(peer, "42");
            let auth = headers.get(header::AUTHORIZATION).unwrap();
            assert_eq!(auth.to_str().unwrap(), "Bearer tok-abc");
            axum::Json(serde_json::json!([
                {"id": 1, "sender_id": "42", "text": "hello", "timestamp": 1000},
                {"id": 2, "sender_id": "me", "image": "cat.png", "timestamp": 2000},
            ]))
        }),
    );
    let base = start_server(router).await;

    let list = client(base)
        .fetch_conversation(&peer("42"), "tok-abc")
        .await
        .unwrap();

    assert_eq!(list.len(), 2);
    assert_eq!(list[0].id, MessageId::new(1));
    assert_eq!(list[0].text.as_deref(), Some("hello"));
    assert_eq!(list[1].image.as_deref(), Some("cat.png"));
    assert_eq!(list[1].text, None);
}

#[tokio::test]
async fn empty_conversation_is_an_empty_list() {
    let router = Router::new().route(
        "/chat-history/{peer}/",
        get(|| async { axum::Json(serde_json::json!([])) }),
    );
    let base = start_server(router).await;

    let list = client(base)
        .fetch_conversation(&peer("7"), "tok")
        .await
        .unwrap();
    assert!(list.is_empty());
}

#[tokio::test]
async fn unauthorized_status_maps_to_unauthorized() {
    let router = Router::new().route(
        "/chat-history/{peer}/",
        get(|| async { StatusCode::UNAUTHORIZED.into_response() }),
    );
    let base = start_server(router).await;

    let err = client(base)
        .fetch_conversation(&peer("42"), "expired")
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::Unauthorized));
}

#[tokio::test]
async fn forbidden_status_maps_to_unauthorized() {
    let router = Router::new().route(
        "/chat-history/{peer}/",
        get(|| async { StatusCode::FORBIDDEN.into_response() }),
    );
    let base = start_server(router).await;

    let err = client(base)
        .fetch_conversation(&peer("42"), "tok")
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::Unauthorized));
}

#[tokio::test]
async fn server_error_maps_to_request_failure() {
    let router = Router::new().route(
        "/chat-history/{peer}/",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR.into_response() }),
    );
    let base = start_server(router).await;

    let err = client(base)
        .fetch_conversation(&peer("42"), "tok")
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::Request(_)));
}

#[tokio::test]
async fn non_array_body_maps_to_invalid_format() {
    let router = Router::new().route(
        "/chat-history/{peer}/",
        get(|| async { axum::Json(serde_json::json!({"detail": "wrapped"})) }),
    );
    let base = start_server(router).await;

    let err = client(base)
        .fetch_conversation(&peer("42"), "tok")
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::InvalidFormat(_)));
}

#[tokio::test]
async fn unreachable_server_maps_to_request_failure() {
    // Bind then drop so the port refuses connections.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let base = Url::parse(&format!("http://{addr}")).unwrap();
    let err = client(base)
        .fetch_conversation(&peer("42"), "tok")
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::Request(_)));
}
