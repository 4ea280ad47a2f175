//! In-memory `ClusterApi` for exercising the orchestrator and coordinator
//! without a naming service.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dfsdash_common::model::{
    ClusterHealth, FileEntry, HealthStatus, Node, NodeRole, NodeStatus, QueueStatus,
    ReplicationQueueItem, Resource,
};
use tokio::sync::watch;

use crate::error::SyncError;
use crate::gateway::{ClusterApi, Listing, LocalUpload, QueueFilter, RecoveryReport};

pub(crate) fn node(id: &str, status: NodeStatus, role: NodeRole) -> Node {
    Node {
        id: id.to_string(),
        address: format!("{id}.cluster.local:9000"),
        status,
        role,
        last_heartbeat: Some(Utc::now()),
        latency_ms: Some(4),
    }
}

pub(crate) fn file(id: &str, filename: &str, size: u64) -> FileEntry {
    FileEntry {
        id: id.to_string(),
        filename: filename.to_string(),
        size_bytes: size,
        replica_node_ids: BTreeSet::from(["node-1".to_string()]),
        created_at: Some(Utc::now()),
        checksum_sha256: None,
    }
}

/// Poll `check` until it holds, failing the test after about two seconds.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

struct FakeState {
    nodes: Vec<Node>,
    probe: Vec<Node>,
    health: ClusterHealth,
    files: Vec<FileEntry>,
    queue: Vec<ReplicationQueueItem>,
    blobs: HashMap<String, Bytes>,
    failures: HashMap<Resource, u16>,
    failing_uploads: HashSet<String>,
    gates: HashMap<String, watch::Receiver<bool>>,
    delay: Duration,
    calls: HashMap<Resource, usize>,
    last_queue_filter: Option<QueueFilter>,
}

pub(crate) struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    /// Three nodes (one down), three files and one pending replication.
    pub(crate) fn healthy() -> Self {
        let nodes = vec![
            node("node-1", NodeStatus::Up, NodeRole::Main),
            node("node-2", NodeStatus::Up, NodeRole::Replica),
            node("node-3", NodeStatus::Down, NodeRole::Backup),
        ];
        let files = vec![
            file("f1", "design.png", 2_400_000),
            file("f2", "report.pdf", 512_000),
            file("f3", "music.mp3", 7_100_000),
        ];
        let queue = vec![ReplicationQueueItem {
            id: 1,
            file_key: "f3".to_string(),
            source_node_id: "node-1".to_string(),
            target_node_id: "node-3".to_string(),
            status: QueueStatus::Pending,
            retry_count: 2,
            last_attempt: None,
            created_at: Some(Utc::now()),
            error_message: Some("connection refused".to_string()),
        }];
        Self {
            state: Mutex::new(FakeState {
                probe: nodes.clone(),
                nodes,
                health: ClusterHealth {
                    status: HealthStatus::Ok,
                    up_nodes: 2,
                    down_nodes: 1,
                    total_files: Some(3),
                },
                files,
                queue,
                blobs: HashMap::new(),
                failures: HashMap::new(),
                failing_uploads: HashSet::new(),
                gates: HashMap::new(),
                delay: Duration::ZERO,
                calls: HashMap::new(),
                last_queue_filter: None,
            }),
        }
    }

    pub(crate) fn fail(&self, resource: Resource, status: u16) {
        self.state.lock().unwrap().failures.insert(resource, status);
    }

    pub(crate) fn recover(&self, resource: Resource) {
        self.state.lock().unwrap().failures.remove(&resource);
    }

    pub(crate) fn fail_upload(&self, filename: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_uploads
            .insert(filename.to_string());
    }

    /// Calls keyed by `key` (an upload's filename, or a resource name) wait
    /// until `true` is sent on the returned channel.
    pub(crate) fn gate(&self, key: &str) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        self.state.lock().unwrap().gates.insert(key.to_string(), rx);
        tx
    }

    pub(crate) fn set_nodes(&self, nodes: Vec<Node>) {
        self.state.lock().unwrap().nodes = nodes;
    }

    pub(crate) fn set_probe(&self, nodes: Vec<Node>) {
        self.state.lock().unwrap().probe = nodes;
    }

    pub(crate) fn set_files(&self, files: Vec<FileEntry>) {
        self.state.lock().unwrap().files = files;
    }

    pub(crate) fn set_blob(&self, file_id: &str, data: impl Into<Bytes>) {
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert(file_id.to_string(), data.into());
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub(crate) fn calls(&self, resource: Resource) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&resource)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn last_queue_filter(&self) -> Option<QueueFilter> {
        self.state.lock().unwrap().last_queue_filter.clone()
    }

    /// Count the call, then honor the configured delay, gate and failure.
    async fn enter(&self, resource: Resource, gate_key: &str) -> Result<(), SyncError> {
        let (delay, gate) = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(resource).or_insert(0) += 1;
            (state.delay, state.gates.get(gate_key).cloned())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(mut gate) = gate {
            loop {
                let open = *gate.borrow_and_update();
                if open || gate.changed().await.is_err() {
                    break;
                }
            }
        }
        let failure = self.state.lock().unwrap().failures.get(&resource).copied();
        match failure {
            Some(code) => Err(SyncError::Transport {
                resource,
                status_code: Some(code),
                reason: "injected failure".to_string(),
            }),
            None => Ok(()),
        }
    }
}

fn listing<T>(items: Vec<T>) -> Listing<T> {
    Listing {
        items,
        skipped: Vec::new(),
    }
}

#[async_trait]
impl ClusterApi for FakeApi {
    async fn fetch_nodes(&self) -> Result<Listing<Node>, SyncError> {
        self.enter(Resource::Nodes, "nodes").await?;
        Ok(listing(self.state.lock().unwrap().nodes.clone()))
    }

    async fn check_nodes(&self) -> Result<Listing<Node>, SyncError> {
        self.enter(Resource::NodeCheck, "node_check").await?;
        Ok(listing(self.state.lock().unwrap().probe.clone()))
    }

    async fn fetch_health(&self) -> Result<ClusterHealth, SyncError> {
        self.enter(Resource::Health, "health").await?;
        Ok(self.state.lock().unwrap().health.clone())
    }

    async fn fetch_files(&self) -> Result<Listing<FileEntry>, SyncError> {
        self.enter(Resource::Files, "files").await?;
        Ok(listing(self.state.lock().unwrap().files.clone()))
    }

    async fn fetch_queue(
        &self,
        filter: &QueueFilter,
    ) -> Result<Listing<ReplicationQueueItem>, SyncError> {
        self.state.lock().unwrap().last_queue_filter = Some(filter.clone());
        self.enter(Resource::Queue, "queue").await?;
        let items = self
            .state
            .lock()
            .unwrap()
            .queue
            .iter()
            .filter(|q| filter.status.as_ref().map_or(true, |s| &q.status == s))
            .filter(|q| filter.node_id.as_ref().map_or(true, |n| &q.target_node_id == n))
            .cloned()
            .collect();
        Ok(listing(items))
    }

    async fn upload_file(&self, upload: &LocalUpload) -> Result<FileEntry, SyncError> {
        self.enter(Resource::Upload, &upload.filename).await?;
        let mut state = self.state.lock().unwrap();
        if state.failing_uploads.contains(&upload.filename) {
            return Err(SyncError::Transport {
                resource: Resource::Upload,
                status_code: Some(500),
                reason: "no available storage nodes".to_string(),
            });
        }
        let entry = file(
            &format!("srv-{}", upload.filename),
            &upload.filename,
            upload.size_bytes(),
        );
        state.files.insert(0, entry.clone());
        state.blobs.insert(entry.id.clone(), upload.data.clone());
        Ok(entry)
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), SyncError> {
        self.enter(Resource::Delete, "delete").await?;
        let mut state = self.state.lock().unwrap();
        let before = state.files.len();
        state.files.retain(|f| f.id != file_id);
        if state.files.len() == before {
            return Err(SyncError::Transport {
                resource: Resource::Delete,
                status_code: Some(404),
                reason: "file not found".to_string(),
            });
        }
        Ok(())
    }

    async fn recover_node(&self, node_id: &str) -> Result<RecoveryReport, SyncError> {
        self.enter(Resource::Recover, "recover").await?;
        let mut state = self.state.lock().unwrap();
        let mut total = 0;
        for item in state.queue.iter_mut() {
            if item.target_node_id == node_id && item.status == QueueStatus::Pending {
                item.status = QueueStatus::Completed;
                total += 1;
            }
        }
        Ok(RecoveryReport {
            message: "recovery complete".to_string(),
            total,
            success: total,
            failed: 0,
        })
    }

    async fn download_file(&self, file_id: &str) -> Result<Bytes, SyncError> {
        self.enter(Resource::Download, "download").await?;
        self.state
            .lock()
            .unwrap()
            .blobs
            .get(file_id)
            .cloned()
            .ok_or_else(|| SyncError::Transport {
                resource: Resource::Download,
                status_code: Some(404),
                reason: "file not found".to_string(),
            })
    }
}
