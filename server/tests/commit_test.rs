//! Integration tests for the commit protocol.
//!
//! The `live_server_tests` need a running server backed by PostgreSQL.
//! Set SPARKWMS_SERVER_URL (and AUTH_TOKEN if the server requires one);
//! without it they return early.

use sparkwms_engine::{Commit, CommitRequest, CommitResponse, HealthResponse};

/// Test helper to create a test commit.
fn create_test_commit(location: &str, item_id: i64, delta: i64) -> Commit {
    Commit::new("device-1", location, item_id, delta, 1706745600000).unwrap()
}

#[cfg(test)]
mod protocol_tests {
    use super::*;

    #[test]
    fn test_request_from_device_json() {
        let json = r#"{
            "commitId": "0b9e1f43-5a55-4d3e-9c1e-2f0c6f0f5b11",
            "deviceId": "dev-1",
            "location": "A1",
            "itemId": 42,
            "delta": -5,
            "enqueuedAt": 1706745600000
        }"#;

        let request: CommitRequest = serde_json::from_str(json).unwrap();
        let commit = Commit::try_from(request).unwrap();

        assert_eq!(
            commit.commit_id().to_string(),
            "0b9e1f43-5a55-4d3e-9c1e-2f0c6f0f5b11"
        );
        assert_eq!(commit.location(), "A1");
        assert_eq!(commit.item_id(), 42);
        assert_eq!(commit.delta(), -5);
    }

    #[test]
    fn test_request_keeps_commit_id() {
        let commit = create_test_commit("A1", 42, -5);
        let request = CommitRequest::from(&commit);
        assert_eq!(request.commit_id, commit.commit_id());

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["commitId"], commit.commit_id().to_string());
        assert_eq!(json["enqueuedAt"], 1706745600000u64);
    }

    #[test]
    fn test_request_bounds() {
        for (item_id, delta, ok) in [
            (i64::from(i16::MIN), i64::from(i32::MIN), true),
            (i64::from(i16::MAX), i64::from(i32::MAX), true),
            (i64::from(i16::MAX) + 1, 0, false),
            (0, i64::from(i32::MIN) - 1, false),
        ] {
            let request = CommitRequest {
                item_id,
                delta,
                ..CommitRequest::from(&create_test_commit("A1", 1, 1))
            };
            assert_eq!(Commit::try_from(request).is_ok(), ok, "{item_id}/{delta}");
        }
    }

    #[test]
    fn test_response_serialization() {
        let commit = create_test_commit("A1", 42, -5);
        let response = CommitResponse {
            commit_id: commit.commit_id(),
            applied: false,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"commitId\""));
        assert!(json.contains("\"applied\":false"));

        let parsed: CommitResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_health_response() {
        let health: HealthResponse =
            serde_json::from_str(r#"{"status":"ok","version":"0.1.0"}"#).unwrap();
        assert!(health.is_ok());
    }
}

#[cfg(test)]
mod live_server_tests {
    use super::*;
    use sparkwms_engine::{DeliveryClient, HttpDeliveryClient};

    fn server_url() -> Option<String> {
        std::env::var("SPARKWMS_SERVER_URL").ok()
    }

    fn connect_string(base: &str) -> String {
        match std::env::var("AUTH_TOKEN") {
            Ok(token) if !token.is_empty() => base.replacen("://", &format!("://{token}@"), 1),
            _ => base.to_string(),
        }
    }

    #[tokio::test]
    async fn test_redelivery_is_acknowledged_once() {
        let Some(base) = server_url() else {
            return;
        };
        let client = HttpDeliveryClient::new(&connect_string(&base)).unwrap();
        assert!(client.check().await.unwrap());

        let commit = create_test_commit("TEST-A1", 42, -5);
        let first = client.send_commit(&commit).await.unwrap();
        assert!(first.applied);

        let second = client.send_commit(&commit).await.unwrap();
        assert_eq!(second.commit_id, commit.commit_id());
        assert!(!second.applied);
    }

    #[tokio::test]
    async fn test_invalid_commit_is_bad_request() {
        let Some(base) = server_url() else {
            return;
        };

        let mut request = reqwest::Client::new()
            .post(format!("{}/commits", base.trim_end_matches('/')))
            .json(&serde_json::json!({
                "commitId": "0b9e1f43-5a55-4d3e-9c1e-2f0c6f0f5b11",
                "deviceId": "dev-1",
                "location": "A1",
                "itemId": 70000,
                "delta": 1,
                "enqueuedAt": 0
            }));
        if let Ok(token) = std::env::var("AUTH_TOKEN") {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
