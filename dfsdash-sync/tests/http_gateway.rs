use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path, Query};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use dfsdash_common::model::{HealthStatus, NodeRole, NodeStatus, QueueStatus, Resource};
use dfsdash_sync::gateway::RecoveryReport;
use dfsdash_sync::mutations::FileSyncState;
use dfsdash_sync::{
    ClusterApi, Dashboard, HttpGateway, LocalUpload, Phase, QueueFilter, Source, SyncError,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

const BLOB: &[u8] = b"replicated bytes";

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn gateway(base_url: &str) -> HttpGateway {
    HttpGateway::new(base_url, Duration::from_secs(5)).unwrap()
}

async fn list_nodes() -> Json<Value> {
    Json(json!([
        {
            "id": "node-1",
            "address": "http://node-1:8001",
            "status": "UP",
            "role": "MAIN",
            "last_heartbeat": "2024-05-01T10:00:00Z",
            "latency_ms": 3
        },
        { "id": "node-2", "address": "http://node-2:8002", "status": "DOWN" },
        { "address": "http://nameless:8003", "status": "UP" },
        { "id": "node-1", "address": "http://node-1:8001", "status": "UP", "role": "MAIN" }
    ]))
}

async fn check_nodes() -> Json<Value> {
    Json(json!({
        "checked_at": "2024-05-01T10:05:00Z",
        "nodes": [
            { "id": "node-1", "address": "http://node-1:8001", "status": "UP" },
            { "id": "node-2", "address": "http://node-2:8002", "status": "UP" }
        ]
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "UP" }))
}

async fn list_files() -> Json<Value> {
    let checksum = hex::encode(Sha256::digest(BLOB));
    Json(json!({
        "files": [
            {
                "file_key": "abc123",
                "original_filename": "design.png",
                "size_bytes": 2400000,
                "replicas": ["node-1", "node-2"],
                "uploaded_at": "2024-05-01 09:00:00",
                "checksum_sha256": checksum
            },
            { "id": "def456", "filename": "report.pdf", "size": 512000 },
            { "original_filename": "orphan.bin" }
        ],
        "count": 3
    }))
}

async fn replication_queue(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let status = params.get("status").cloned().unwrap_or_else(|| "PENDING".to_string());
    let target = params.get("node_id").cloned().unwrap_or_else(|| "node-2".to_string());
    Json(json!({
        "items": [{
            "id": 7,
            "file_key": "abc123",
            "source_node_id": "node-1",
            "target_node_id": target,
            "status": status,
            "retry_count": 1,
            "last_attempt": null,
            "created_at": "2024-05-01 09:01:00"
        }],
        "count": 1
    }))
}

async fn upload(mut multipart: Multipart) -> impl IntoResponse {
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or_default().to_string();
            let data = field.bytes().await.unwrap();
            if filename == "reject.txt" {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "no available storage nodes" })),
                );
            }
            return (
                StatusCode::OK,
                Json(json!({
                    "file_id": format!("key-{filename}"),
                    "original_filename": filename,
                    "size_bytes": data.len(),
                    "selected_node": "node-2"
                })),
            );
        }
    }
    (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing file field" })))
}

async fn delete_file(Path(id): Path<String>) -> impl IntoResponse {
    if id == "missing" {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "file not found" }))).into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn recover(Path(id): Path<String>) -> Json<Value> {
    Json(json!({
        "message": format!("recovery finished for {id}"),
        "total": 2,
        "success": 2,
        "failed": 0
    }))
}

async fn download(Path(key): Path<String>) -> impl IntoResponse {
    if key == "abc123" {
        return (StatusCode::OK, BLOB.to_vec()).into_response();
    }
    (StatusCode::NOT_FOUND, "no such file").into_response()
}

fn naming_service() -> Router {
    Router::new()
        .route("/nodes", get(list_nodes))
        .route("/nodes/check", get(check_nodes))
        .route("/nodes/{id}/recover", post(recover))
        .route("/health", get(health))
        .route("/files", get(list_files))
        .route("/files/{id}", delete(delete_file))
        .route("/replication-queue", get(replication_queue))
        .route("/upload", post(upload))
        .route("/download/{key}", get(download))
}

#[tokio::test]
async fn fetch_nodes_skips_malformed_and_dedupes() {
    let base = serve(naming_service()).await;
    let listing = gateway(&base).fetch_nodes().await.unwrap();

    assert_eq!(listing.items.len(), 2);
    assert_eq!(listing.skipped.len(), 1);
    assert_eq!(listing.skipped[0].resource, Resource::Nodes);

    let node_1 = &listing.items[0];
    assert_eq!(node_1.id, "node-1");
    assert_eq!(node_1.role, NodeRole::Main);
    assert_eq!(listing.items[1].status, NodeStatus::Down);
    assert_eq!(listing.items[1].role, NodeRole::Unknown);
}

#[tokio::test]
async fn fetch_files_accepts_either_key_spelling() {
    let base = serve(naming_service()).await;
    let listing = gateway(&base).fetch_files().await.unwrap();

    assert_eq!(listing.items.len(), 2);
    assert_eq!(listing.skipped.len(), 1);
    assert_eq!(listing.items[0].id, "abc123");
    assert_eq!(listing.items[0].replica_node_ids.len(), 2);
    assert!(listing.items[0].created_at.is_some());
    assert_eq!(listing.items[1].id, "def456");
    assert_eq!(listing.items[1].filename, "report.pdf");
    assert_eq!(listing.items[1].size_bytes, 512000);
    assert!(listing.items[1].replica_node_ids.is_empty());
}

#[tokio::test]
async fn fetch_health_maps_status() {
    let base = serve(naming_service()).await;
    let health = gateway(&base).fetch_health().await.unwrap();
    assert_eq!(health.status, HealthStatus::Ok);
}

#[tokio::test]
async fn fetch_queue_sends_filter_as_query() {
    let base = serve(naming_service()).await;
    let filter = QueueFilter {
        node_id: Some("node-3".to_string()),
        status: Some(QueueStatus::Failed),
    };
    let listing = gateway(&base).fetch_queue(&filter).await.unwrap();
    assert_eq!(listing.items.len(), 1);
    assert_eq!(listing.items[0].target_node_id, "node-3");
    assert_eq!(listing.items[0].status, QueueStatus::Failed);
    assert!(listing.items[0].last_attempt.is_none());
}

#[tokio::test]
async fn upload_returns_confirmed_entry() {
    let base = serve(naming_service()).await;
    let entry = gateway(&base)
        .upload_file(&LocalUpload::new("notes.txt", "hello world"))
        .await
        .unwrap();
    assert_eq!(entry.id, "key-notes.txt");
    assert_eq!(entry.filename, "notes.txt");
    assert_eq!(entry.size_bytes, 11);
    assert!(entry.replica_node_ids.contains("node-2"));
}

#[tokio::test]
async fn non_success_status_is_transport_error() {
    let base = serve(naming_service()).await;
    let gw = gateway(&base);

    let err = gw
        .upload_file(&LocalUpload::new("reject.txt", "x"))
        .await
        .unwrap_err();
    match err {
        SyncError::Transport {
            resource,
            status_code,
            reason,
        } => {
            assert_eq!(resource, Resource::Upload);
            assert_eq!(status_code, Some(503));
            assert_eq!(reason, "no available storage nodes");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = gw.delete_file("missing").await.unwrap_err();
    assert_eq!(err.status_code(), Some(404));
    gw.delete_file("abc123").await.unwrap();
}

#[tokio::test]
async fn recover_and_download() {
    let base = serve(naming_service()).await;
    let gw = gateway(&base);

    let report = gw.recover_node("node-2").await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            message: "recovery finished for node-2".to_string(),
            total: 2,
            success: 2,
            failed: 0,
        }
    );

    let data = gw.download_file("abc123").await.unwrap();
    assert_eq!(&data[..], BLOB);
    assert_eq!(gw.download_file("nope").await.unwrap_err().status_code(), Some(404));
}

#[tokio::test]
async fn unreachable_backend_is_transport_error() {
    // Bind then drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = gateway(&format!("http://{addr}")).fetch_health().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Transport {
            resource: Resource::Health,
            status_code: None,
            ..
        }
    ));
}

#[tokio::test]
async fn dashboard_isolates_failing_source() {
    let router = Router::new()
        .route("/nodes", get(list_nodes))
        .route("/health", get(health))
        .route("/files", get(list_files))
        .route(
            "/replication-queue",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "database is locked") }),
        );
    let base = serve(router).await;

    let dash = Dashboard::new(Arc::new(gateway(&base)));
    let snap = dash.refresh().await.unwrap();
    assert_eq!(dash.phase(), Phase::ReadyWithErrors);
    assert_eq!(snap.nodes.len(), 2);
    assert_eq!(snap.files.len(), 2);
    assert_eq!(snap.health.status, HealthStatus::Ok);
    assert!(snap.queue.is_empty());

    let err = snap.error(Source::Queue).unwrap();
    assert_eq!(err.status_code(), Some(500));
    assert!(err.to_string().contains("database is locked"));
    assert_eq!(snap.skipped.len(), 2);
}

#[tokio::test]
async fn dashboard_end_to_end() {
    let base = serve(naming_service()).await;
    let dash = Dashboard::new(Arc::new(gateway(&base)));

    dash.refresh().await.unwrap();
    assert_eq!(dash.phase(), Phase::Ready);

    let outcomes = dash
        .upload(vec![LocalUpload::new("a.txt", "aaa")])
        .await
        .unwrap();
    assert_eq!(outcomes[0].result.as_ref().unwrap().id, "key-a.txt");
    // The stub never lists the upload, so it stays pending.
    let view = dash.view();
    assert_eq!(view.files[0].entry.id, "key-a.txt");
    assert_eq!(view.files[0].state, FileSyncState::AwaitingSync);

    let snap = dash.check_nodes().await.unwrap();
    assert!(snap.nodes.iter().all(|n| n.status == NodeStatus::Up));
    assert_eq!(snap.nodes[0].role, NodeRole::Main);

    let data = dash.download("abc123").await.unwrap();
    assert_eq!(&data[..], BLOB);

    dash.shutdown();
    assert!(matches!(dash.refresh().await, Err(SyncError::SessionClosed)));
}

#[tokio::test]
async fn dashboard_loads_config_from_file() {
    let base = serve(naming_service()).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dfsdash.toml");
    std::fs::write(&path, format!("base_url = \"{base}/\"\nrequest_timeout_secs = 2\n")).unwrap();

    let config = dfsdash_sync::config::DashConfig::load(&path).unwrap();
    if std::env::var("DFSDASH_BASE_URL").is_ok() {
        return;
    }
    let gw = HttpGateway::from_config(&config).unwrap();
    assert_eq!(gw.base_url(), base);
    assert_eq!(gw.fetch_health().await.unwrap().status, HealthStatus::Ok);
}
