//! Optimistic Mutation Manager.
//!
//! Local uploads and deletes change the visible file list immediately. The
//! pending set is overlaid onto whatever snapshot is current and is never
//! written into the snapshot itself. Entries leave the set only when a later
//! snapshot confirms them or when the backend reports a failure.

use chrono::{DateTime, Utc};
use dfsdash_common::model::FileEntry;
use tracing::debug;
use uuid::Uuid;

use crate::error::SyncError;
use crate::gateway::LocalUpload;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, PartialEq)]
pub enum UploadState {
    /// Request in flight; a placeholder is shown.
    Submitted,
    /// The backend accepted the file; waiting for a snapshot that lists it.
    Confirmed(FileEntry),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpload {
    pub local_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub submitted_at: DateTime<Utc>,
    pub state: UploadState,
}

impl PendingUpload {
    fn placeholder(&self) -> FileEntry {
        FileEntry {
            id: self.local_id.clone(),
            filename: self.filename.clone(),
            size_bytes: self.size_bytes,
            replica_node_ids: Default::default(),
            created_at: Some(self.submitted_at),
            checksum_sha256: None,
        }
    }

    fn confirmed_id(&self) -> Option<&str> {
        match &self.state {
            UploadState::Confirmed(entry) => Some(&entry.id),
            UploadState::Submitted => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelete {
    pub target_file_id: String,
    /// The backend acknowledged the delete.
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingMutation {
    Upload(PendingUpload),
    Delete(PendingDelete),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSyncState {
    Synced,
    Uploading,
    AwaitingSync,
}

/// A row in the file list as the user should see it.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleFile {
    pub entry: FileEntry,
    pub state: FileSyncState,
}

#[derive(Debug, Default)]
pub struct PendingSet {
    /// Newest batch first, submission order within a batch.
    uploads: Vec<PendingUpload>,
    deletes: Vec<PendingDelete>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.deletes.is_empty()
    }

    pub fn uploads(&self) -> &[PendingUpload] {
        &self.uploads
    }

    pub fn deletes(&self) -> &[PendingDelete] {
        &self.deletes
    }

    pub fn mutations(&self) -> Vec<PendingMutation> {
        self.uploads
            .iter()
            .cloned()
            .map(PendingMutation::Upload)
            .chain(self.deletes.iter().cloned().map(PendingMutation::Delete))
            .collect()
    }

    /// Register placeholders for a batch. The returned entries are in the
    /// same order as `files`.
    pub fn apply_upload(&mut self, files: &[LocalUpload], now: DateTime<Utc>) -> Vec<PendingUpload> {
        let batch: Vec<PendingUpload> = files
            .iter()
            .map(|f| PendingUpload {
                local_id: format!("local-{}", Uuid::new_v4()),
                filename: f.filename.clone(),
                size_bytes: f.size_bytes(),
                submitted_at: now,
                state: UploadState::Submitted,
            })
            .collect();
        self.uploads.splice(0..0, batch.iter().cloned());
        batch
    }

    /// Swap the placeholder for the server's entry, keeping its slot.
    ///
    /// Returns `false` if the placeholder is no longer pending.
    pub fn confirm_upload(&mut self, local_id: &str, mut entry: FileEntry) -> bool {
        let Some(upload) = self.uploads.iter_mut().find(|u| u.local_id == local_id) else {
            return false;
        };
        if entry.filename.is_empty() {
            entry.filename = upload.filename.clone();
        }
        if entry.created_at.is_none() {
            entry.created_at = Some(upload.submitted_at);
        }
        debug!(local_id, file_id = %entry.id, "Upload confirmed");
        upload.state = UploadState::Confirmed(entry);
        true
    }

    pub fn fail_upload(&mut self, local_id: &str) -> Option<PendingUpload> {
        let pos = self.uploads.iter().position(|u| u.local_id == local_id)?;
        Some(self.uploads.remove(pos))
    }

    /// Hide `file_id` until the delete resolves.
    ///
    /// Only files the user can currently see are deletable; placeholders for
    /// uploads still in flight have no server id yet.
    pub fn apply_delete(
        &mut self,
        file_id: &str,
        snapshot: &Snapshot,
    ) -> Result<PendingDelete, SyncError> {
        if self.deletes.iter().any(|d| d.target_file_id == file_id) {
            return Err(SyncError::DeleteInFlight(file_id.to_string()));
        }
        let known = snapshot.contains_file(file_id)
            || self.uploads.iter().any(|u| u.confirmed_id() == Some(file_id));
        if !known {
            return Err(SyncError::UnknownFile(file_id.to_string()));
        }
        let pending = PendingDelete {
            target_file_id: file_id.to_string(),
            confirmed: false,
        };
        self.deletes.push(pending.clone());
        Ok(pending)
    }

    /// The delete stays pending until a snapshot no longer lists the file, so
    /// a stale read cannot bring it back.
    pub fn confirm_delete(&mut self, file_id: &str) {
        if let Some(d) = self.deletes.iter_mut().find(|d| d.target_file_id == file_id) {
            d.confirmed = true;
        }
        self.uploads.retain(|u| u.confirmed_id() != Some(file_id));
    }

    /// Drop the pending delete; the file shows again in its original slot.
    pub fn fail_delete(&mut self, file_id: &str) -> bool {
        let before = self.deletes.len();
        self.deletes.retain(|d| d.target_file_id != file_id);
        self.deletes.len() != before
    }

    /// Clear mutations the snapshot confirms, then overlay the rest.
    pub fn reconcile(&mut self, snapshot: &Snapshot) -> Vec<VisibleFile> {
        let uploads_before = self.uploads.len();
        let deletes_before = self.deletes.len();

        self.uploads.retain(|u| match u.confirmed_id() {
            Some(id) => !snapshot.contains_file(id),
            None => true,
        });
        let uploads = &self.uploads;
        self.deletes.retain(|d| {
            snapshot.contains_file(&d.target_file_id)
                || uploads.iter().any(|u| u.confirmed_id() == Some(d.target_file_id.as_str()))
        });

        let cleared = (uploads_before - self.uploads.len()) + (deletes_before - self.deletes.len());
        if cleared > 0 {
            debug!(cleared, remaining = self.uploads.len() + self.deletes.len(), "Pending mutations reconciled");
        }
        self.overlay(snapshot)
    }

    /// The snapshot's files with pending uploads prepended and pending
    /// deletes hidden.
    pub fn overlay(&self, snapshot: &Snapshot) -> Vec<VisibleFile> {
        let hidden = |id: &str| self.deletes.iter().any(|d| d.target_file_id == id);
        let mut out = Vec::with_capacity(self.uploads.len() + snapshot.files.len());

        for upload in &self.uploads {
            match &upload.state {
                UploadState::Submitted => out.push(VisibleFile {
                    entry: upload.placeholder(),
                    state: FileSyncState::Uploading,
                }),
                UploadState::Confirmed(entry) => {
                    if !snapshot.contains_file(&entry.id) && !hidden(&entry.id) {
                        out.push(VisibleFile {
                            entry: entry.clone(),
                            state: FileSyncState::AwaitingSync,
                        });
                    }
                }
            }
        }

        out.extend(
            snapshot
                .files
                .iter()
                .filter(|f| !hidden(&f.id))
                .map(|f| VisibleFile {
                    entry: f.clone(),
                    state: FileSyncState::Synced,
                }),
        );
        out
    }
}
