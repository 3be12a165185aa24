use super::test_helpers::{StaticTokens, APPLICATION_BEARER, DELEGATED_BEARER};
use crate::graph::{PlannerApi, PlannerClient};
use crate::models::RemoteTask;
use crate::BridgeError;
use std::sync::Arc;

fn client_for(server: &mockito::ServerGuard) -> PlannerClient {
    PlannerClient::new(server.url(), Arc::new(StaticTokens)).unwrap()
}

fn task_body(id: &str, etag: &str, percent: u8) -> String {
    serde_json::json!({
        "id": id,
        "title": "Draft",
        "percentComplete": percent,
        "priority": 5,
        "planId": "p1",
        "bucketId": "b1",
        "@odata.etag": etag,
    })
    .to_string()
}

#[tokio::test]
async fn get_task_returns_body_and_etag() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/tasks/R1")
        .match_header("authorization", format!("Bearer {DELEGATED_BEARER}").as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(task_body("R1", "W/\"1\"", 50))
        .create_async()
        .await;

    let client = client_for(&server);
    let fetch = client.get_task("R1").await.unwrap();

    assert_eq!(fetch.task.id, "R1");
    assert_eq!(fetch.task.percent_complete, 50);
    assert_eq!(fetch.etag, "W/\"1\"");
    mock.assert_async().await;
}

#[tokio::test]
async fn conditional_get_treats_304_as_noop() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/tasks/R1")
        .match_header("if-none-match", "W/\"1\"")
        .with_status(304)
        .create_async()
        .await;

    let client = client_for(&server);
    let result = client.get_task_if_modified("R1", Some("W/\"1\"")).await.unwrap();

    assert!(result.is_none());
    mock.assert_async().await;
}

#[tokio::test]
async fn patch_sends_if_match_and_surfaces_412() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("PATCH", "/tasks/R1")
        .match_header("if-match", "W/\"stale\"")
        .with_status(412)
        .create_async()
        .await;

    let client = client_for(&server);
    let mut patch = serde_json::Map::new();
    patch.insert("title".to_string(), "Renamed".into());
    let err = client.patch_task("R1", "W/\"stale\"", &patch).await.unwrap_err();

    assert!(matches!(err, BridgeError::PreconditionFailed { .. }));
    mock.assert_async().await;
}

#[tokio::test]
async fn missing_task_maps_to_remote_not_found() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/tasks/GONE")
        .with_status(404)
        .create_async()
        .await;

    let client = client_for(&server);
    let err = client.get_task("GONE").await.unwrap_err();
    assert!(matches!(err, BridgeError::RemoteNotFound(_)));

    // The housekeeper's probe reads the same signal as a clean boolean.
    assert!(!client.task_exists("GONE").await.unwrap());
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("PATCH", "/tasks/R1")
        .with_status(429)
        .with_header("retry-after", "5")
        .create_async()
        .await;

    let client = client_for(&server);
    let patch = serde_json::Map::new();
    let err = client.patch_task("R1", "W/\"1\"", &patch).await.unwrap_err();

    match err {
        BridgeError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 5),
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn delegated_403_falls_back_to_application_token() {
    let mut server = mockito::Server::new_async().await;
    let denied = server
        .mock("GET", "/tasks/R1")
        .match_header("authorization", format!("Bearer {DELEGATED_BEARER}").as_str())
        .with_status(403)
        .create_async()
        .await;
    let granted = server
        .mock("GET", "/tasks/R1")
        .match_header(
            "authorization",
            format!("Bearer {APPLICATION_BEARER}").as_str(),
        )
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(task_body("R1", "W/\"1\"", 0))
        .create_async()
        .await;

    let client = client_for(&server);
    let fetch = client.get_task("R1").await.unwrap();

    assert_eq!(fetch.task.id, "R1");
    denied.assert_async().await;
    granted.assert_async().await;
}

#[tokio::test]
async fn create_task_captures_returned_identity() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/tasks")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(task_body("R-new", "W/\"0\"", 0))
        .create_async()
        .await;

    let client = client_for(&server);
    let remote = RemoteTask {
        title: "Draft".to_string(),
        plan_id: "p1".to_string(),
        bucket_id: "b1".to_string(),
        percent_complete: 0,
        priority: 3,
        ..Default::default()
    };
    let fetch = client.create_task(&remote).await.unwrap();

    assert_eq!(fetch.task.id, "R-new");
    assert_eq!(fetch.etag, "W/\"0\"");
    mock.assert_async().await;
}

#[tokio::test]
async fn delete_requires_if_match() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("DELETE", "/tasks/R1")
        .match_header("if-match", "W/\"3\"")
        .with_status(204)
        .create_async()
        .await;

    let client = client_for(&server);
    client.delete_task("R1", "W/\"3\"").await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn plan_listing_unwraps_value_envelope() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/plans/p1/tasks")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "value": [
                    serde_json::from_str::<serde_json::Value>(&task_body("R1", "W/\"1\"", 0)).unwrap(),
                    serde_json::from_str::<serde_json::Value>(&task_body("R2", "W/\"4\"", 100)).unwrap(),
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let client = client_for(&server);
    let tasks = client.list_plan_tasks("p1").await.unwrap();

    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[1].id, "R2");
    assert_eq!(tasks[1].percent_complete, 100);
}

#[tokio::test]
async fn server_errors_are_transient() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/tasks/R1")
        .with_status(503)
        .create_async()
        .await;

    let client = client_for(&server);
    let err = client.get_task("R1").await.unwrap_err();
    assert!(err.is_transient());
    assert!(err.consumes_attempt());
}
