use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Resource ──

/// Backend endpoint a record or error came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Nodes,
    NodeCheck,
    Health,
    Files,
    Queue,
    Upload,
    Delete,
    Recover,
    Download,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Nodes => "nodes",
            Resource::NodeCheck => "node_check",
            Resource::Health => "health",
            Resource::Files => "files",
            Resource::Queue => "queue",
            Resource::Upload => "upload",
            Resource::Delete => "delete",
            Resource::Recover => "recover",
            Resource::Download => "download",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Node ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub status: NodeStatus,
    pub role: NodeRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeRole {
    #[serde(rename = "MAIN")]
    Main,
    #[serde(rename = "BACKUP")]
    Backup,
    #[serde(rename = "REPLICA")]
    Replica,
    #[serde(rename = "unknown")]
    Unknown,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Up => "UP",
            NodeStatus::Down => "DOWN",
        }
    }
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Main => "MAIN",
            NodeRole::Backup => "BACKUP",
            NodeRole::Replica => "REPLICA",
            NodeRole::Unknown => "unknown",
        }
    }
}

// ── File ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    /// Backend file key.
    pub id: String,
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub replica_node_ids: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum_sha256: Option<String>,
}

// ── Replication Queue ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationQueueItem {
    pub id: i64,
    /// Loose reference to `FileEntry::id`; the file may not be listed yet.
    pub file_key: String,
    pub source_node_id: String,
    pub target_node_id: String,
    pub status: QueueStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Queue status as reported by the naming service.
///
/// The backend may introduce new values at any time, so anything outside the
/// known set is kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueStatus {
    Pending,
    Completed,
    Failed,
    Other(String),
}

impl QueueStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "PENDING" => QueueStatus::Pending,
            "COMPLETED" => QueueStatus::Completed,
            "FAILED" => QueueStatus::Failed,
            other => QueueStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            QueueStatus::Pending => "PENDING",
            QueueStatus::Completed => "COMPLETED",
            QueueStatus::Failed => "FAILED",
            QueueStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for QueueStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for QueueStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(QueueStatus::parse(&raw))
    }
}

// ── Health ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterHealth {
    pub status: HealthStatus,
    pub up_nodes: u32,
    pub down_nodes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u64>,
}

impl Default for ClusterHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            up_nodes: 0,
            down_nodes: 0,
            total_files: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Down,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
            HealthStatus::Unknown => "unknown",
        }
    }
}

// ── Summary ──

/// Headline counts shown on the cluster status panel.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ClusterSummary {
    pub total_nodes: usize,
    pub up: usize,
    pub down: usize,
    pub main: usize,
    pub backup: usize,
    pub replica: usize,
    pub total_files: u64,
}

impl ClusterSummary {
    /// `total_files` prefers the naming service's own count over the listing,
    /// which the backend caps.
    pub fn from_parts(nodes: &[Node], files: &[FileEntry], health: &ClusterHealth) -> Self {
        let count_role = |role: NodeRole| nodes.iter().filter(|n| n.role == role).count();
        let up = nodes.iter().filter(|n| n.status == NodeStatus::Up).count();
        Self {
            total_nodes: nodes.len(),
            up,
            down: nodes.len() - up,
            main: count_role(NodeRole::Main),
            backup: count_role(NodeRole::Backup),
            replica: count_role(NodeRole::Replica),
            total_files: health.total_files.unwrap_or(files.len() as u64),
        }
    }
}
