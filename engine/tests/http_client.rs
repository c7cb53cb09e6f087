//! `HttpDeliveryClient` against an in-process axum server.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use sparkwms_engine::{
    Commit, CommitId, CommitRequest, CommitResponse, DeliveryClient, DeliveryError,
    HealthResponse, HttpDeliveryClient,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TOKEN: &str = "s3cret";

#[derive(Clone, Default)]
struct TestState {
    seen: Arc<Mutex<HashSet<CommitId>>>,
}

async fn create_commit(
    State(state): State<TestState>,
    headers: HeaderMap,
    Json(body): Json<CommitRequest>,
) -> Result<Json<CommitResponse>, (StatusCode, String)> {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"));
    if !authorized {
        return Err((StatusCode::UNAUTHORIZED, "missing token".into()));
    }

    let commit =
        Commit::try_from(body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let applied = state.seen.lock().unwrap().insert(commit.commit_id());

    Ok(Json(CommitResponse {
        commit_id: commit.commit_id(),
        applied,
    }))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: "test".into(),
    })
}

async fn unavailable() -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "maintenance")
}

async fn wrong_ack() -> Json<CommitResponse> {
    Json(CommitResponse {
        commit_id: CommitId::new(),
        applied: true,
    })
}

async fn slow() -> StatusCode {
    tokio::time::sleep(Duration::from_secs(5)).await;
    StatusCode::OK
}

async fn spawn_server() -> SocketAddr {
    let app = Router::new()
        .route("/api/commits", post(create_commit))
        .route("/api/health", get(health))
        .route("/down/commits", post(unavailable))
        .route("/down/health", get(unavailable))
        .route("/liar/commits", post(wrong_ack))
        .route("/slow/commits", post(slow))
        .with_state(TestState::default());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn commit() -> Commit {
    Commit::new("dev-1", "A1", 42, -5, 1_700_000_000_000).unwrap()
}

#[tokio::test]
async fn delivers_and_deduplicates() {
    let addr = spawn_server().await;
    let client = HttpDeliveryClient::new(&format!("http://{TOKEN}@{addr}/api")).unwrap();
    let c = commit();

    let first = client.send_commit(&c).await.unwrap();
    assert_eq!(first.commit_id, c.commit_id());
    assert!(first.applied);

    let again = client.send_commit(&c).await.unwrap();
    assert!(!again.applied);
}

#[tokio::test]
async fn health_probe() {
    let addr = spawn_server().await;

    let client = HttpDeliveryClient::new(&format!("http://{TOKEN}@{addr}/api")).unwrap();
    assert!(client.check().await.unwrap());

    let down = HttpDeliveryClient::new(&format!("http://{addr}/down")).unwrap();
    assert!(!down.check().await.unwrap());
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let addr = spawn_server().await;
    let client = HttpDeliveryClient::new(&format!("http://{addr}/api")).unwrap();

    assert!(matches!(
        client.send_commit(&commit()).await,
        Err(DeliveryError::Unauthorized)
    ));
}

#[tokio::test]
async fn server_errors_carry_status_and_body() {
    let addr = spawn_server().await;
    let client = HttpDeliveryClient::new(&format!("http://{addr}/down")).unwrap();

    match client.send_commit(&commit()).await {
        Err(DeliveryError::Server { status, message }) => {
            assert_eq!(status, 503);
            assert_eq!(message, "maintenance");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn mismatched_ack_is_a_protocol_error() {
    let addr = spawn_server().await;
    let client = HttpDeliveryClient::new(&format!("http://{addr}/liar")).unwrap();

    assert!(matches!(
        client.send_commit(&commit()).await,
        Err(DeliveryError::Protocol(_))
    ));
}

#[tokio::test]
async fn slow_server_times_out() {
    let addr = spawn_server().await;
    let client = HttpDeliveryClient::with_timeout(
        &format!("http://{addr}/slow"),
        Duration::from_millis(100),
    )
    .unwrap();

    assert!(matches!(
        client.send_commit(&commit()).await,
        Err(DeliveryError::Timeout(_))
    ));
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    // Bind and immediately drop to get a port nobody listens on.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let client = HttpDeliveryClient::new(&format!("http://{addr}")).unwrap();

    assert!(matches!(
        client.send_commit(&commit()).await,
        Err(DeliveryError::Network(_))
    ));
    assert!(client.check().await.is_err());
}
