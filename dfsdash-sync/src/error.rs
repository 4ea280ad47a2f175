use std::collections::BTreeMap;

use dfsdash_common::model::Resource;
use dfsdash_common::normalize::MalformedRecord;

use crate::snapshot::Source;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("{resource} request failed{}: {reason}", status_suffix(.status_code))]
    Transport {
        resource: Resource,
        status_code: Option<u16>,
        reason: String,
    },
    #[error(transparent)]
    Malformed(#[from] MalformedRecord),
    #[error("{} of 4 sources failed: {}", .per_source_error.len(), join_sources(.per_source_error))]
    PartialAggregationFailure {
        per_source_error: BTreeMap<Source, SyncError>,
    },
    #[error("File not visible: {0}")]
    UnknownFile(String),
    #[error("Delete already in flight: {0}")]
    DeleteInFlight(String),
    #[error("Checksum mismatch for {file_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file_id: String,
        expected: String,
        actual: String,
    },
    #[error("Dashboard session closed")]
    SessionClosed,
}

impl SyncError {
    pub fn transport(resource: Resource, err: reqwest::Error) -> Self {
        SyncError::Transport {
            resource,
            status_code: err.status().map(|s| s.as_u16()),
            reason: err.to_string(),
        }
    }

    pub fn status(resource: Resource, status: reqwest::StatusCode, body: &str) -> Self {
        let reason = if body.is_empty() {
            status.canonical_reason().unwrap_or("unexpected status").to_string()
        } else {
            body.to_string()
        };
        SyncError::Transport {
            resource,
            status_code: Some(status.as_u16()),
            reason,
        }
    }

    /// HTTP status code, when the failure got that far.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SyncError::Transport { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code.map(|c| format!(" (HTTP {c})")).unwrap_or_default()
}

fn join_sources(errors: &BTreeMap<Source, SyncError>) -> String {
    errors
        .iter()
        .map(|(source, e)| format!("{source}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}
