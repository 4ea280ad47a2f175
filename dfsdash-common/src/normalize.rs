//! Conversion of raw backend JSON into canonical entities.
//!
//! The naming service, the storage nodes and older dashboard builds disagree
//! on key spellings. Every field below resolves through a fixed list of keys;
//! the first key that is present and non-null wins. Nothing here performs I/O.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::model::{
    ClusterHealth, FileEntry, HealthStatus, Node, NodeRole, NodeStatus, QueueStatus,
    ReplicationQueueItem, Resource,
};

const NODE_ID: &[&str] = &["id", "node_id", "nodeId"];
const NODE_ADDRESS: &[&str] = &["address", "addr"];
const NODE_HEARTBEAT: &[&str] = &["last_heartbeat", "lastHeartbeat"];
const NODE_LATENCY: &[&str] = &["latency_ms", "latencyMs"];

const FILE_ID: &[&str] = &["file_key", "fileKey", "file_id", "id"];
const FILE_NAME: &[&str] = &["original_filename", "filename", "name"];
const FILE_SIZE: &[&str] = &["size_bytes", "size"];
const FILE_REPLICAS: &[&str] = &["replicas", "replica_node_ids"];
const FILE_CREATED: &[&str] = &["uploaded_at", "created_at", "createdAt"];
const FILE_CHECKSUM: &[&str] = &["checksum_sha256", "checksum"];
const UPLOAD_NODE: &[&str] = &["selected_node", "node_id"];

const QUEUE_FILE_KEY: &[&str] = &["file_key", "fileKey"];
const QUEUE_SOURCE: &[&str] = &["source_node_id", "sourceNodeId"];
const QUEUE_TARGET: &[&str] = &["target_node_id", "targetNodeId"];
const QUEUE_RETRIES: &[&str] = &["retry_count", "retryCount"];
const QUEUE_LAST_ATTEMPT: &[&str] = &["last_attempt", "lastAttempt"];
const QUEUE_CREATED: &[&str] = &["created_at", "createdAt"];
const QUEUE_ERROR: &[&str] = &["error_message", "errorMessage"];

const HEALTH_UP: &[&str] = &["upNodes", "up_nodes"];
const HEALTH_DOWN: &[&str] = &["downNodes", "down_nodes"];
const HEALTH_TOTAL_FILES: &[&str] = &["totalFiles", "total_files"];

/// Raw health vocabulary → canonical status. Anything not listed is `Unknown`.
const HEALTH_STATUS_TABLE: &[(&str, HealthStatus)] =
    &[("UP", HealthStatus::Ok), ("DOWN", HealthStatus::Down)];

/// A record whose required fields could not be resolved.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("malformed {resource} record ({reason}): {raw}")]
pub struct MalformedRecord {
    pub resource: Resource,
    pub reason: &'static str,
    pub raw: Value,
}

impl MalformedRecord {
    fn new(resource: Resource, reason: &'static str, raw: &Value) -> Self {
        Self {
            resource,
            reason,
            raw: raw.clone(),
        }
    }
}

/// Result of normalizing a list payload: the good records and the rejected ones.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub items: Vec<T>,
    pub skipped: Vec<MalformedRecord>,
}

/// Normalize every element, collecting failures instead of aborting.
pub fn normalize_list<T>(
    raw: &[Value],
    mut f: impl FnMut(&Value) -> Result<T, MalformedRecord>,
) -> Normalized<T> {
    let mut items = Vec::with_capacity(raw.len());
    let mut skipped = Vec::new();
    for value in raw {
        match f(value) {
            Ok(item) => items.push(item),
            Err(e) => skipped.push(e),
        }
    }
    Normalized { items, skipped }
}

pub fn normalize_node(raw: &Value) -> Result<Node, MalformedRecord> {
    let resource = Resource::Nodes;
    let id = required_str(raw, NODE_ID)
        .ok_or_else(|| MalformedRecord::new(resource, "missing node id", raw))?;

    let status = match field(raw, &["status"]).and_then(Value::as_str) {
        Some(s) if s.eq_ignore_ascii_case("UP") => NodeStatus::Up,
        _ => NodeStatus::Down,
    };

    let role = match field(raw, &["role"]).and_then(Value::as_str) {
        Some(s) if s.eq_ignore_ascii_case("MAIN") => NodeRole::Main,
        Some(s) if s.eq_ignore_ascii_case("BACKUP") => NodeRole::Backup,
        Some(s) if s.eq_ignore_ascii_case("REPLICA") => NodeRole::Replica,
        _ => NodeRole::Unknown,
    };

    Ok(Node {
        id,
        address: string_or_default(raw, NODE_ADDRESS),
        status,
        role,
        last_heartbeat: timestamp(raw, NODE_HEARTBEAT),
        latency_ms: field(raw, NODE_LATENCY).and_then(Value::as_u64),
    })
}

pub fn normalize_file(raw: &Value) -> Result<FileEntry, MalformedRecord> {
    file_entry(raw, Resource::Files)
}

/// Upload responses name the node the naming service routed to instead of a
/// replica list; that node becomes the sole known replica.
pub fn normalize_upload_result(raw: &Value) -> Result<FileEntry, MalformedRecord> {
    let mut entry = file_entry(raw, Resource::Upload)?;
    if entry.replica_node_ids.is_empty() {
        if let Some(node) = required_str(raw, UPLOAD_NODE) {
            entry.replica_node_ids.insert(node);
        }
    }
    Ok(entry)
}

fn file_entry(raw: &Value, resource: Resource) -> Result<FileEntry, MalformedRecord> {
    let id = required_str(raw, FILE_ID)
        .ok_or_else(|| MalformedRecord::new(resource, "missing file key", raw))?;

    let size_bytes = match field(raw, FILE_SIZE) {
        None => 0,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| MalformedRecord::new(resource, "size is not a non-negative integer", raw))?,
    };

    let replica_node_ids: BTreeSet<String> = field(raw, FILE_REPLICAS)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    Ok(FileEntry {
        id,
        filename: string_or_default(raw, FILE_NAME),
        size_bytes,
        replica_node_ids,
        created_at: timestamp(raw, FILE_CREATED),
        checksum_sha256: required_str(raw, FILE_CHECKSUM),
    })
}

pub fn normalize_health(raw: &Value) -> ClusterHealth {
    let status = field(raw, &["status"])
        .and_then(Value::as_str)
        .and_then(|s| {
            HEALTH_STATUS_TABLE
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(s))
                .map(|(_, status)| *status)
        })
        .unwrap_or(HealthStatus::Unknown);

    let count = |keys: &[&str]| {
        field(raw, keys)
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    };

    ClusterHealth {
        status,
        up_nodes: count(HEALTH_UP),
        down_nodes: count(HEALTH_DOWN),
        total_files: field(raw, HEALTH_TOTAL_FILES).and_then(Value::as_u64),
    }
}

pub fn normalize_queue_item(raw: &Value) -> Result<ReplicationQueueItem, MalformedRecord> {
    let resource = Resource::Queue;
    let id = field(raw, &["id"])
        .and_then(Value::as_i64)
        .ok_or_else(|| MalformedRecord::new(resource, "missing integer queue id", raw))?;
    let file_key = required_str(raw, QUEUE_FILE_KEY)
        .ok_or_else(|| MalformedRecord::new(resource, "missing file key", raw))?;
    let retry_count = match field(raw, QUEUE_RETRIES) {
        None => 0,
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| MalformedRecord::new(resource, "retry count is not a non-negative integer", raw))?,
    };

    Ok(ReplicationQueueItem {
        id,
        file_key,
        source_node_id: string_or_default(raw, QUEUE_SOURCE),
        target_node_id: string_or_default(raw, QUEUE_TARGET),
        status: QueueStatus::parse(&string_or_default(raw, &["status"])),
        retry_count,
        last_attempt: timestamp(raw, QUEUE_LAST_ATTEMPT),
        created_at: timestamp(raw, QUEUE_CREATED),
        error_message: required_str(raw, QUEUE_ERROR),
    })
}

/// First present, non-null value among `keys`.
fn field<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| raw.get(*k))
        .find(|v| !v.is_null())
}

/// Identifiers occasionally arrive as numbers; accept both.
fn required_str(raw: &Value, keys: &[&str]) -> Option<String> {
    match field(raw, keys)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_or_default(raw: &Value, keys: &[&str]) -> String {
    field(raw, keys)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn timestamp(raw: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    field(raw, keys).and_then(Value::as_str).and_then(parse_timestamp)
}

/// RFC 3339, or the naming service's SQL `YYYY-MM-DD HH:MM:SS` form (UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}
