//! Integration Tests for API Endpoints
//!
//! Tests full request/response cycle for each endpoint.

mod common;

use axum::{body::Body, http::Request, http::StatusCode};
use serde_json::Value;

use common::{delete, get, post_json, put_bytes, put_empty, test_service};

// == Health and Stats ==

#[tokio::test]
async fn test_health_endpoint() {
    let (service, _, _) = test_service().await;

    let (status, json) = service.send(get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert!(json.get("timestamp").is_some());
}

#[tokio::test]
async fn test_stats_endpoint_structure() {
    let (service, _, _) = test_service().await;

    let (status, json) = service.send(get("/stats")).await;

    assert_eq!(status, StatusCode::OK);
    for field in ["hits", "misses", "evictions", "total_entries", "total_bytes", "max_size", "hit_rate"] {
        assert!(json.get(field).is_some(), "missing {field}");
    }
}

// == Image Records ==

#[tokio::test]
async fn test_create_get_and_list_images() {
    let (service, _, _) = test_service().await;

    let id = service
        .create_image(r#"{"name":"cirros","visibility":"public","properties":{"os_distro":"cirros"}}"#)
        .await;

    let (status, image) = service.send(get(&format!("/v2/images/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(image["name"], "cirros");
    assert_eq!(image["status"], "queued");
    assert_eq!(image["visibility"], "public");
    assert_eq!(image["properties"]["os_distro"], "cirros");

    let (status, listing) = service.send(get("/v2/images")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["images"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_reserved_property_is_forbidden() {
    let (service, _, _) = test_service().await;

    let (status, json) = service
        .send(post_json(
            "/v2/images",
            r#"{"properties":{"os_glance_importing_to_stores":"fast"}}"#,
        ))
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(json["error"].as_str().unwrap().contains("reserved"));
}

#[tokio::test]
async fn test_malformed_json_rejected() {
    let (service, _, _) = test_service().await;

    let response = service
        .send(
            Request::builder()
                .method("POST")
                .uri("/v2/images")
                .header("content-type", "application/json")
                .body(Body::from("not valid json"))
                .unwrap(),
        )
        .await;

    assert!(response.0.is_client_error());
}

#[tokio::test]
async fn test_delete_image() {
    let (service, fast, _) = test_service().await;
    let id = service.create_image("{}").await;
    let (status, _) = service
        .send(put_bytes(&format!("/v2/images/{id}/file"), b"image-bytes"))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(fast.len().await, 1);

    let (status, _) = service.send(delete(&format!("/v2/images/{id}"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = service.send(get(&format!("/v2/images/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(fast.is_empty().await);
}

// == Image Data ==

#[tokio::test]
async fn test_upload_and_download() {
    let (service, _, _) = test_service().await;
    let id = service.create_image("{}").await;

    let (status, _) = service
        .send(put_bytes(&format!("/v2/images/{id}/file"), b"0123456789"))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, image) = service.send(get(&format!("/v2/images/{id}"))).await;
    assert_eq!(image["status"], "active");
    assert_eq!(image["size"], 10);

    let (status, data) = service.send_raw(get(&format!("/v2/images/{id}/file"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(data, b"0123456789");
}

#[tokio::test]
async fn test_second_read_is_served_from_cache() {
    let (service, fast, _) = test_service().await;
    let id = service.create_image("{}").await;
    service
        .send(put_bytes(&format!("/v2/images/{id}/file"), b"cache me"))
        .await;

    let (_, first) = service.send_raw(get(&format!("/v2/images/{id}/file"))).await;
    let reads_after_first = fast.read_count();
    let (_, second) = service.send_raw(get(&format!("/v2/images/{id}/file"))).await;

    assert_eq!(first, second);
    assert_eq!(reads_after_first, 1);
    assert_eq!(fast.read_count(), reads_after_first, "second read hit the store");

    let (_, stats) = service.send(get("/stats")).await;
    assert_eq!(stats["hits"], 1);
    assert_eq!(stats["misses"], 1);
}

#[tokio::test]
async fn test_download_of_queued_image_conflicts() {
    let (service, _, _) = test_service().await;
    let id = service.create_image("{}").await;

    let (status, _) = service.send(get(&format!("/v2/images/{id}/file"))).await;

    assert_eq!(status, StatusCode::CONFLICT);
}

// == Interoperable Import ==

#[tokio::test]
async fn test_glance_direct_import_to_two_stores() {
    let (service, fast, slow) = test_service().await;
    let id = service.create_image(r#"{"name":"staged"}"#).await;

    let (status, _) = service
        .send(put_bytes(&format!("/v2/images/{id}/stage"), b"staged-data"))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, image) = service.send(get(&format!("/v2/images/{id}"))).await;
    assert_eq!(image["status"], "uploading");

    let (status, task) = service
        .send(post_json(
            &format!("/v2/images/{id}/import"),
            r#"{"method":{"name":"glance-direct"},"stores":["fast","slow"]}"#,
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(task["type"], "api_image_import");

    let task = service.wait_for_task(task["id"].as_str().unwrap()).await;
    assert_eq!(task["status"], "success", "{task}");
    assert_eq!(task["result"]["image_id"], Value::String(id.clone()));
    assert!(task["message"].is_null());

    let (_, image) = service.send(get(&format!("/v2/images/{id}"))).await;
    assert_eq!(image["status"], "active");
    assert_eq!(image["size"], 11);
    assert_eq!(image["locations"].as_array().unwrap().len(), 2);
    assert_eq!(image["properties"]["os_glance_importing_to_stores"], "");
    assert_eq!(fast.len().await, 1);
    assert_eq!(slow.len().await, 1);
}

#[tokio::test]
async fn test_copy_image_adds_store() {
    let (service, _, slow) = test_service().await;
    let id = service.create_image("{}").await;
    service
        .send(put_bytes(&format!("/v2/images/{id}/file"), b"copy me"))
        .await;

    let (status, task) = service
        .send(post_json(
            &format!("/v2/images/{id}/import"),
            r#"{"method":{"name":"copy-image"},"stores":["slow"]}"#,
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let task = service.wait_for_task(task["id"].as_str().unwrap()).await;
    assert_eq!(task["status"], "success", "{task}");

    let (_, image) = service.send(get(&format!("/v2/images/{id}"))).await;
    let stores: Vec<&str> = image["locations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["store"].as_str().unwrap())
        .collect();
    assert_eq!(stores, vec!["fast", "slow"]);
    assert_eq!(slow.len().await, 1);
}

#[tokio::test]
async fn test_import_without_staged_data_conflicts() {
    let (service, _, _) = test_service().await;
    let id = service.create_image("{}").await;

    let (status, _) = service
        .send(post_json(
            &format!("/v2/images/{id}/import"),
            r#"{"method":{"name":"glance-direct"}}"#,
        ))
        .await;

    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_import_to_unknown_store_rejected() {
    let (service, _, _) = test_service().await;
    let id = service.create_image("{}").await;
    service
        .send(put_bytes(&format!("/v2/images/{id}/stage"), b"data"))
        .await;

    let (status, _) = service
        .send(post_json(
            &format!("/v2/images/{id}/import"),
            r#"{"method":{"name":"glance-direct"},"stores":["nowhere"]}"#,
        ))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// == Discovery ==

#[tokio::test]
async fn test_info_endpoints() {
    let (service, _, _) = test_service().await;

    let (status, import) = service.send(get("/v2/info/import")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        import["import-methods"]["value"],
        serde_json::json!(["glance-direct", "copy-image"])
    );

    let (status, stores) = service.send(get("/v2/info/stores")).await;
    assert_eq!(status, StatusCode::OK);
    let stores = stores["stores"].as_array().unwrap();
    assert_eq!(stores.len(), 2);
    assert!(stores.iter().any(|s| s["id"] == "fast" && s["default"] == true));
}

// == Tasks ==

#[tokio::test]
async fn test_import_task_failure_kills_image() {
    let (service, _, _) = test_service().await;

    let (status, task) = service
        .send(post_json(
            "/v2/tasks",
            r#"{"type":"import","input":{"import_from":"file:///nonexistent/image.qcow2"}}"#,
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let task = service.wait_for_task(task["id"].as_str().unwrap()).await;
    assert_eq!(task["status"], "failure");
    assert!(task["result"].is_null());
    assert!(task["message"].as_str().unwrap().contains("nonexistent"));

    let (_, listing) = service.send(get("/v2/images")).await;
    assert_eq!(listing["images"][0]["status"], "killed");
}

#[tokio::test]
async fn test_file_import_disabled_by_default() {
    let (service, fast, _) = test_service().await;

    let (status, task) = service
        .send(post_json(
            "/v2/tasks",
            r#"{"type":"import","input":{"import_from":"file:///etc/passwd"}}"#,
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let task = service.wait_for_task(task["id"].as_str().unwrap()).await;
    assert_eq!(task["status"], "failure");
    assert!(task["message"].as_str().unwrap().contains("disabled"));
    assert!(fast.is_empty().await);

    let (_, listing) = service.send(get("/v2/images")).await;
    let id = listing["images"][0]["id"].as_str().unwrap().to_string();
    assert_eq!(listing["images"][0]["status"], "killed");
    let (status, _) = service.send_raw(get(&format!("/v2/images/{id}/file"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_task_with_bad_uri_rejected() {
    let (service, _, _) = test_service().await;

    let (status, _) = service
        .send(post_json(
            "/v2/tasks",
            r#"{"type":"import","input":{"import_from":"ftp://example.com/image"}}"#,
        ))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (_, tasks) = service.send(get("/v2/tasks")).await;
    assert!(tasks["tasks"].as_array().unwrap().is_empty());
}

// == Cache Management ==

#[tokio::test]
async fn test_cache_queue_list_and_delete() {
    let (service, _, _) = test_service().await;
    let id = service.create_image("{}").await;

    let (status, _) = service.send(put_empty(&format!("/v2/cache/{id}"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, listing) = service.send(get("/v2/cache")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["queued_images"][0], Value::String(id.clone()));
    assert!(listing["cached_images"].as_array().unwrap().is_empty());

    let (status, _) = service.send(delete(&format!("/v2/cache/{id}"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = service.send(delete(&format!("/v2/cache/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cache_clear_target_header() {
    let (service, _, _) = test_service().await;
    let cached = service.create_image("{}").await;
    service
        .send(put_bytes(&format!("/v2/images/{cached}/file"), b"data"))
        .await;
    service.send(get(&format!("/v2/images/{cached}/file"))).await;
    let queued = service.create_image("{}").await;
    service.send(put_empty(&format!("/v2/cache/{queued}"))).await;

    let (status, report) = service
        .send(
            Request::builder()
                .method("DELETE")
                .uri("/v2/cache")
                .header("x-image-cache-clear-target", "cache")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["cached_removed"], 1);
    assert_eq!(report["queued_removed"], 0);

    let (_, listing) = service.send(get("/v2/cache")).await;
    assert!(listing["cached_images"].as_array().unwrap().is_empty());
    assert_eq!(listing["queued_images"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cache_clear_invalid_target() {
    let (service, _, _) = test_service().await;

    let (status, _) = service
        .send(
            Request::builder()
                .method("DELETE")
                .uri("/v2/cache")
                .header("x-image-cache-clear-target", "all-of-it")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}
