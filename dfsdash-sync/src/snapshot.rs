use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use dfsdash_common::model::{
    ClusterHealth, ClusterSummary, FileEntry, Node, ReplicationQueueItem, Resource,
};
use dfsdash_common::normalize::MalformedRecord;

use crate::error::SyncError;

/// One of the four independent read endpoints feeding a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Source {
    Nodes,
    Health,
    Files,
    Queue,
}

impl Source {
    pub const ALL: [Source; 4] = [Source::Nodes, Source::Health, Source::Files, Source::Queue];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Nodes => "nodes",
            Source::Health => "health",
            Source::Files => "files",
            Source::Queue => "queue",
        }
    }

    pub fn resource(&self) -> Resource {
        match self {
            Source::Nodes => Resource::Nodes,
            Source::Health => Resource::Health,
            Source::Files => Resource::Files,
            Source::Queue => Resource::Queue,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated, immutable view of the cluster at one point in time.
///
/// Each refresh cycle builds a fresh value; snapshots are shared as
/// `Arc<Snapshot>` and never patched in place.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    pub files: Vec<FileEntry>,
    pub queue: Vec<ReplicationQueueItem>,
    pub health: ClusterHealth,
    /// Sources whose last read failed. Their slices hold the previous values.
    pub per_source_error: BTreeMap<Source, SyncError>,
    /// List records dropped during normalization in this cycle.
    pub skipped: Vec<MalformedRecord>,
    /// `None` until the first aggregation completes.
    pub taken_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn error(&self, source: Source) -> Option<&SyncError> {
        self.per_source_error.get(&source)
    }

    pub fn has_errors(&self) -> bool {
        !self.per_source_error.is_empty()
    }

    /// `PartialAggregationFailure` when at least one source failed.
    pub fn partial_failure(&self) -> Option<SyncError> {
        if self.per_source_error.is_empty() {
            return None;
        }
        Some(SyncError::PartialAggregationFailure {
            per_source_error: self.per_source_error.clone(),
        })
    }

    pub fn file(&self, id: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.id == id)
    }

    pub fn contains_file(&self, id: &str) -> bool {
        self.file(id).is_some()
    }

    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary::from_parts(&self.nodes, &self.files, &self.health)
    }

    /// Take the node slice of `probed` (data, error and skipped records),
    /// leaving everything else as it is.
    pub fn replace_nodes_from(&mut self, probed: &Snapshot) {
        self.nodes = probed.nodes.clone();
        match probed.per_source_error.get(&Source::Nodes) {
            Some(e) => {
                self.per_source_error.insert(Source::Nodes, e.clone());
            }
            None => {
                self.per_source_error.remove(&Source::Nodes);
            }
        }
        self.skipped.retain(|r| r.resource != Resource::Nodes);
        self.skipped.extend(
            probed
                .skipped
                .iter()
                .filter(|r| r.resource == Resource::Nodes)
                .cloned(),
        );
        self.taken_at = probed.taken_at;
    }
}
