//! Integration tests for the out-of-band file API.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use cistern_server::auth::TEAM_HEADER;
use common::{TestServer, download, json_request, json_request_as, upload};
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

async fn create_volume(server: &TestServer, name: &str) -> String {
    let (status, body) =
        json_request(server, "POST", "/volumes", Some(json!({"name": name}))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["volume_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn file_api_unavailable_without_filesystem_pool() {
    let server = TestServer::new().await;
    let volume_id = create_volume(&server, "plain").await;

    let (status, _) = json_request(
        &server,
        "GET",
        &format!("/volumes/{volume_id}/files?path=/"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn fresh_volume_answers_503_until_first_mount() {
    let server = TestServer::with_volume_fs().await;
    let volume_id = create_volume(&server, "fresh").await;

    // No mount has initialized the metadata snapshot yet.
    let (status, body) = json_request(
        &server,
        "GET",
        &format!("/volumes/{volume_id}/files?path=/"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "volume_not_initialized");
}

#[tokio::test]
async fn upload_overwrites_and_download_returns_latest() {
    let server = TestServer::with_volume_fs().await;
    let volume_id = create_volume(&server, "files").await;
    server.initialize_volume(&volume_id).await;

    let (status, body) = upload(&server, &volume_id, "/f", b"Original content").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["path"], "/f");
    assert_eq!(body["size"], 16);

    let (status, body) = upload(&server, &volume_id, "/f", b"New").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["size"], 3);

    let (status, content) = download(&server, &volume_id, "/f").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content, b"New");
}

#[tokio::test]
async fn empty_upload_creates_an_empty_file() {
    let server = TestServer::with_volume_fs().await;
    let volume_id = create_volume(&server, "empties").await;
    server.initialize_volume(&volume_id).await;

    let (status, body) = upload(&server, &volume_id, "/empty", b"").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["size"], 0);

    let (status, content) = download(&server, &volume_id, "/empty").await;
    assert_eq!(status, StatusCode::OK);
    assert!(content.is_empty());
}

#[tokio::test]
async fn upload_requires_content_length() {
    let server = TestServer::with_volume_fs().await;
    let volume_id = create_volume(&server, "lengths").await;
    server.initialize_volume(&volume_id).await;

    let request = Request::builder()
        .method("PUT")
        .uri(format!("/volumes/{volume_id}/files/upload?path=/f"))
        .header(TEAM_HEADER, server.team_id.to_string())
        .body(Body::from("data"))
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);
}

#[tokio::test]
async fn recursive_delete_removes_the_tree() {
    let server = TestServer::with_volume_fs().await;
    let volume_id = create_volume(&server, "trees").await;
    server.initialize_volume(&volume_id).await;

    upload(&server, &volume_id, "/rmdir/a.txt", b"a").await;
    upload(&server, &volume_id, "/rmdir/s/b.txt", b"b").await;

    let (status, _) = json_request(
        &server,
        "DELETE",
        &format!("/volumes/{volume_id}/files?path=/rmdir&recursive=true"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = json_request(
        &server,
        "GET",
        &format!("/volumes/{volume_id}/files?path=/rmdir"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Deleting a missing path is already done.
    let (status, _) = json_request(
        &server,
        "DELETE",
        &format!("/volumes/{volume_id}/files?path=/rmdir&recursive=true"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn listing_paginates_with_opaque_tokens() {
    let server = TestServer::with_volume_fs().await;
    let volume_id = create_volume(&server, "pages").await;
    server.initialize_volume(&volume_id).await;

    for name in ["alpha", "bravo", "charlie", "delta", "echo"] {
        upload(&server, &volume_id, &format!("/{name}"), b"x").await;
    }

    let (status, body) = json_request(
        &server,
        "GET",
        &format!("/volumes/{volume_id}/files?path=/&limit=2"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["alpha", "bravo"]);
    let token = body["nextToken"].as_str().unwrap().to_string();

    let (_, body) = json_request(
        &server,
        "GET",
        &format!("/volumes/{volume_id}/files?path=/&limit=2&nextToken={token}"),
        None,
    )
    .await;
    let names: Vec<&str> = body["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["charlie", "delta"]);

    let (status, _) = json_request(
        &server,
        "GET",
        &format!("/volumes/{volume_id}/files?path=/&nextToken=garbage!"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn file_paths_must_be_absolute() {
    let server = TestServer::with_volume_fs().await;
    let volume_id = create_volume(&server, "paths").await;
    server.initialize_volume(&volume_id).await;

    let (status, _) = json_request(
        &server,
        "GET",
        &format!("/volumes/{volume_id}/files?path=relative"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn file_api_hides_foreign_volumes() {
    let server = TestServer::with_volume_fs().await;
    let volume_id = create_volume(&server, "mine").await;
    server.initialize_volume(&volume_id).await;

    let (status, _) = json_request_as(
        &server,
        "GET",
        &format!("/volumes/{volume_id}/files?path=/"),
        None,
        Some(Uuid::new_v4()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn uploads_are_durable_across_pool_eviction() {
    let server = TestServer::with_volume_fs().await;
    let volume_id = create_volume(&server, "durable").await;
    server.initialize_volume(&volume_id).await;

    upload(&server, &volume_id, "/kept", b"survives").await;

    // Drop every pooled client; the next request restores the pushed
    // snapshot from scratch.
    server.state.fs_pool.as_ref().unwrap().close_all().await;

    let (status, content) = download(&server, &volume_id, "/kept").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content, b"survives");
}

#[tokio::test]
async fn upload_rate_limit_returns_429() {
    let server = TestServer::with_config(true, |config| {
        config.rate_limit.upload.requests_per_minute = 60;
        config.rate_limit.upload.burst = 2;
    })
    .await;
    let volume_id = create_volume(&server, "limited").await;
    server.initialize_volume(&volume_id).await;

    let (status, _) = upload(&server, &volume_id, "/a", b"x").await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = upload(&server, &volume_id, "/b", b"x").await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = upload(&server, &volume_id, "/c", b"x").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["message"].as_str().unwrap().contains("Rate limit"));

    // Listing has its own budget and is unaffected.
    let (status, _) = json_request(
        &server,
        "GET",
        &format!("/volumes/{volume_id}/files?path=/"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}
