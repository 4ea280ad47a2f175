//! Fetch Gateway: one operation per naming-service resource.
//!
//! Raw payloads never leave this module; every response is passed through
//! the normalizer before it is returned. Each call is exactly one round trip
//! with no retries, bounded by the client's own timeout.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dfsdash_common::model::{
    ClusterHealth, FileEntry, Node, QueueStatus, ReplicationQueueItem, Resource,
};
use dfsdash_common::normalize::{
    normalize_file, normalize_health, normalize_list, normalize_node, normalize_queue_item,
    normalize_upload_result, MalformedRecord, Normalized,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::DashConfig;
use crate::error::SyncError;

/// Normalized list response plus the records that had to be dropped.
pub type Listing<T> = Normalized<T>;

/// A local file submitted for upload.
#[derive(Debug, Clone)]
pub struct LocalUpload {
    pub filename: String,
    pub data: Bytes,
}

impl LocalUpload {
    pub fn new(filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
        }
    }

    pub async fn from_path(path: &Path) -> anyhow::Result<Self> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("Not a file path: {}", path.display()))?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Ok(Self::new(filename, data))
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Optional narrowing of the replication queue listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueFilter {
    /// Matches the item's target node.
    pub node_id: Option<String>,
    pub status: Option<QueueStatus>,
}

impl QueueFilter {
    pub fn pending() -> Self {
        Self {
            node_id: None,
            status: Some(QueueStatus::Pending),
        }
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(node_id) = &self.node_id {
            pairs.push(("node_id", node_id.clone()));
        }
        if let Some(status) = &self.status {
            pairs.push(("status", status.as_str().to_string()));
        }
        pairs
    }
}

/// Outcome of asking the naming service to drain a node's pending replications.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RecoveryReport {
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "count")]
    pub total: u32,
    #[serde(default)]
    pub success: u32,
    #[serde(default)]
    pub failed: u32,
}

/// Operations against the naming service's HTTP surface.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn fetch_nodes(&self) -> Result<Listing<Node>, SyncError>;

    /// Ask the naming service to actively probe every node, returning fresh
    /// liveness. The probe reports id, address and status only.
    async fn check_nodes(&self) -> Result<Listing<Node>, SyncError>;

    async fn fetch_health(&self) -> Result<ClusterHealth, SyncError>;

    async fn fetch_files(&self) -> Result<Listing<FileEntry>, SyncError>;

    async fn fetch_queue(
        &self,
        filter: &QueueFilter,
    ) -> Result<Listing<ReplicationQueueItem>, SyncError>;

    async fn upload_file(&self, upload: &LocalUpload) -> Result<FileEntry, SyncError>;

    async fn delete_file(&self, file_id: &str) -> Result<(), SyncError>;

    async fn recover_node(&self, node_id: &str) -> Result<RecoveryReport, SyncError>;

    async fn download_file(&self, file_id: &str) -> Result<Bytes, SyncError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &DashConfig) -> anyhow::Result<Self> {
        Ok(Self::new(&config.base_url, config.request_timeout())?)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send and reject any non-2xx status.
    async fn send(&self, resource: Resource, req: RequestBuilder) -> Result<Response, SyncError> {
        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::transport(resource, e))?;

        let status = resp.status();
        debug!(resource = %resource, status = status.as_u16(), "Response received");
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|b| b.error)
            .unwrap_or_else(|| text.trim().to_string());
        Err(SyncError::status(resource, status, &reason))
    }

    async fn send_json(&self, resource: Resource, req: RequestBuilder) -> Result<Value, SyncError> {
        let resp = self.send(resource, req).await?;
        resp.json().await.map_err(|e| SyncError::transport(resource, e))
    }

    async fn get_list<T, K>(
        &self,
        resource: Resource,
        req: RequestBuilder,
        field: &str,
        normalize: fn(&Value) -> Result<T, MalformedRecord>,
        key: fn(&T) -> K,
    ) -> Result<Listing<T>, SyncError>
    where
        K: Eq + Hash,
    {
        let body = self.send_json(resource, req).await?;
        let raw = list_payload(resource, body, field)?;
        let mut listing = normalize_list(&raw, normalize);
        for skipped in &listing.skipped {
            warn!(resource = %resource, reason = skipped.reason, raw = %skipped.raw, "Skipping malformed record");
        }
        listing.items = dedupe_by_key(listing.items, key);
        Ok(listing)
    }
}

#[async_trait]
impl ClusterApi for HttpGateway {
    async fn fetch_nodes(&self) -> Result<Listing<Node>, SyncError> {
        let req = self.client.get(self.url("/nodes"));
        self.get_list(Resource::Nodes, req, "nodes", normalize_node, node_key)
            .await
    }

    async fn check_nodes(&self) -> Result<Listing<Node>, SyncError> {
        let req = self.client.get(self.url("/nodes/check"));
        self.get_list(Resource::NodeCheck, req, "nodes", normalize_node, node_key)
            .await
    }

    async fn fetch_health(&self) -> Result<ClusterHealth, SyncError> {
        let body = self
            .send_json(Resource::Health, self.client.get(self.url("/health")))
            .await?;
        Ok(normalize_health(&body))
    }

    async fn fetch_files(&self) -> Result<Listing<FileEntry>, SyncError> {
        let req = self.client.get(self.url("/files"));
        self.get_list(Resource::Files, req, "files", normalize_file, file_key)
            .await
    }

    async fn fetch_queue(
        &self,
        filter: &QueueFilter,
    ) -> Result<Listing<ReplicationQueueItem>, SyncError> {
        let req = self
            .client
            .get(self.url("/replication-queue"))
            .query(&filter.query_pairs());
        self.get_list(Resource::Queue, req, "items", normalize_queue_item, queue_key)
            .await
    }

    async fn upload_file(&self, upload: &LocalUpload) -> Result<FileEntry, SyncError> {
        let mime = mime_guess::from_path(&upload.filename).first_or_octet_stream();
        let part = Part::bytes(upload.data.to_vec())
            .file_name(upload.filename.clone())
            .mime_str(mime.as_ref())
            .map_err(|e| SyncError::transport(Resource::Upload, e))?;
        let form = Form::new().part("file", part);

        let body = self
            .send_json(Resource::Upload, self.client.post(self.url("/upload")).multipart(form))
            .await?;
        let entry = normalize_upload_result(&body)?;
        debug!(file_id = %entry.id, filename = %upload.filename, "Upload accepted");
        Ok(entry)
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), SyncError> {
        let url = self.url(&format!("/files/{}", urlencoding::encode(file_id)));
        self.send(Resource::Delete, self.client.delete(url)).await?;
        Ok(())
    }

    async fn recover_node(&self, node_id: &str) -> Result<RecoveryReport, SyncError> {
        let url = self.url(&format!("/nodes/{}/recover", urlencoding::encode(node_id)));
        let body = self.send_json(Resource::Recover, self.client.post(url)).await?;
        serde_json::from_value(body.clone()).map_err(|_| {
            SyncError::Malformed(MalformedRecord {
                resource: Resource::Recover,
                reason: "unexpected recovery report",
                raw: body,
            })
        })
    }

    async fn download_file(&self, file_id: &str) -> Result<Bytes, SyncError> {
        let url = self.url(&format!("/download/{}", urlencoding::encode(file_id)));
        let resp = self.send(Resource::Download, self.client.get(url)).await?;
        resp.bytes()
            .await
            .map_err(|e| SyncError::transport(Resource::Download, e))
    }
}

fn node_key(node: &Node) -> String {
    node.id.clone()
}

fn file_key(file: &FileEntry) -> String {
    file.id.clone()
}

fn queue_key(item: &ReplicationQueueItem) -> i64 {
    item.id
}

/// List endpoints answer with either a bare array or an object wrapping the
/// array under `field`. Go's encoder writes an empty list as `null`.
pub(crate) fn list_payload(
    resource: Resource,
    body: Value,
    field: &str,
) -> Result<Vec<Value>, SyncError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove(field) {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) => Ok(Vec::new()),
            other => {
                if let Some(v) = other {
                    map.insert(field.to_string(), v);
                }
                Err(MalformedRecord {
                    resource,
                    reason: "response has no recognizable list",
                    raw: Value::Object(map),
                }
                .into())
            }
        },
        other => Err(MalformedRecord {
            resource,
            reason: "response has no recognizable list",
            raw: other,
        }
        .into()),
    }
}

/// One entry per key: the position of the first occurrence, the data of the last.
pub(crate) fn dedupe_by_key<T, K: Eq + Hash>(items: Vec<T>, key: fn(&T) -> K) -> Vec<T> {
    let mut index: HashMap<K, usize> = HashMap::with_capacity(items.len());
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        match index.get(&key(&item)) {
            Some(&i) => out[i] = item,
            None => {
                index.insert(key(&item), out.len());
                out.push(item);
            }
        }
    }
    out
}
