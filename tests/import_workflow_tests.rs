//! Integration Tests for multi-store imports
//!
//! Covers the completion policy when one of the target stores fails.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;

use common::{get, post_json, put_bytes, service_with_stores, FailingStore, TestService};
use image_service::backend::{ImageStore, MemoryStore};

async fn fast_and_broken() -> (TestService, Arc<MemoryStore>) {
    let fast = Arc::new(MemoryStore::new("fast"));
    let service = service_with_stores(
        vec![
            fast.clone() as Arc<dyn ImageStore>,
            Arc::new(FailingStore::new("broken")) as Arc<dyn ImageStore>,
        ],
        "fast",
    )
    .await;
    (service, fast)
}

async fn stage_and_import(service: &TestService, all_must_succeed: bool) -> (String, serde_json::Value) {
    let id = service.create_image(r#"{"name":"multi"}"#).await;
    let (status, _) = service
        .send(put_bytes(&format!("/v2/images/{id}/stage"), b"payload"))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let body = format!(
        r#"{{"method":{{"name":"glance-direct"}},"stores":["fast","broken"],"all_stores_must_succeed":{all_must_succeed}}}"#
    );
    let (status, task) = service
        .send(post_json(&format!("/v2/images/{id}/import"), &body))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{task}");

    let task = service.wait_for_task(task["id"].as_str().unwrap()).await;
    (id, task)
}

#[tokio::test]
async fn test_partial_import_succeeds_when_allowed() {
    let (service, fast) = fast_and_broken().await;

    let (id, task) = stage_and_import(&service, false).await;

    assert_eq!(task["status"], "success", "{task}");
    let (_, image) = service.send(get(&format!("/v2/images/{id}"))).await;
    assert_eq!(image["status"], "active");
    assert_eq!(image["properties"]["os_glance_importing_to_stores"], "");
    assert_eq!(image["properties"]["os_glance_failed_import"], "broken");
    assert_eq!(image["locations"].as_array().unwrap().len(), 1);
    assert_eq!(image["locations"][0]["store"], "fast");
    assert_eq!(fast.len().await, 1);

    let (status, data) = service.send_raw(get(&format!("/v2/images/{id}/file"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(data, b"payload");
}

#[tokio::test]
async fn test_strict_import_reverts_on_store_failure() {
    let (service, fast) = fast_and_broken().await;

    let (id, task) = stage_and_import(&service, true).await;

    assert_eq!(task["status"], "failure", "{task}");
    assert!(task["result"].is_null());
    assert!(task["message"].as_str().unwrap().contains("broken"));

    let (_, image) = service.send(get(&format!("/v2/images/{id}"))).await;
    assert_eq!(image["status"], "uploading");
    assert!(image["locations"].as_array().unwrap().is_empty());
    assert_eq!(image["properties"]["os_glance_importing_to_stores"], "");
    assert_eq!(image["properties"]["os_glance_failed_import"], "broken");
    assert!(fast.is_empty().await, "data written to fast was not reverted");
}

#[tokio::test]
async fn test_failed_import_can_be_retried() {
    let (service, fast) = fast_and_broken().await;
    let (id, task) = stage_and_import(&service, true).await;
    assert_eq!(task["status"], "failure");

    let (status, task) = service
        .send(post_json(
            &format!("/v2/images/{id}/import"),
            r#"{"method":{"name":"glance-direct"},"stores":["fast"]}"#,
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{task}");

    let task = service.wait_for_task(task["id"].as_str().unwrap()).await;
    assert_eq!(task["status"], "success", "{task}");
    let (_, image) = service.send(get(&format!("/v2/images/{id}"))).await;
    assert_eq!(image["status"], "active");
    assert_eq!(image["properties"]["os_glance_failed_import"], "");
    assert_eq!(fast.len().await, 1);
}
