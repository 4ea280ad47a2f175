//! Refresh Coordinator.
//!
//! A `Dashboard` is one consumer session: it owns the current snapshot and the
//! pending mutation set, decides when aggregation runs and exposes the
//! overlaid view. Clones share the same session.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dfsdash_common::model::{FileEntry, ReplicationQueueItem, Resource};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate;
use crate::error::SyncError;
use crate::gateway::{ClusterApi, Listing, LocalUpload, QueueFilter, RecoveryReport};
use crate::mutations::{PendingSet, VisibleFile};
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No aggregation has been requested yet.
    Idle,
    Loading,
    Ready,
    /// The last cycle completed with at least one failed source.
    ReadyWithErrors,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Loading => "loading",
            Phase::Ready => "ready",
            Phase::ReadyWithErrors => "ready-with-errors",
        }
    }

    fn settled(snapshot: &Snapshot) -> Self {
        if snapshot.has_errors() {
            Phase::ReadyWithErrors
        } else {
            Phase::Ready
        }
    }
}

/// What a consumer renders.
#[derive(Debug, Clone)]
pub struct DashboardView {
    pub phase: Phase,
    pub snapshot: Arc<Snapshot>,
    /// Snapshot files with pending uploads and deletes applied.
    pub files: Vec<VisibleFile>,
    pub pending_uploads: usize,
    pub pending_deletes: usize,
}

/// Per-file result of an upload batch, in submission order.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub local_id: String,
    pub filename: String,
    pub result: Result<FileEntry, SyncError>,
}

/// `None` until the cycle finishes. A dropped sender means it was discarded.
type CycleReceiver = watch::Receiver<Option<Arc<Snapshot>>>;

struct State {
    phase: Phase,
    snapshot: Arc<Snapshot>,
    pending: PendingSet,
    inflight: Option<CycleReceiver>,
    /// Run one more cycle once the in-flight one finishes.
    trailing: bool,
}

struct Inner {
    api: Arc<dyn ClusterApi>,
    state: Mutex<State>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Dashboard {
    inner: Arc<Inner>,
}

impl Dashboard {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    snapshot: Arc::new(Snapshot::default()),
                    pending: PendingSet::new(),
                    inflight: None,
                    trailing: false,
                }),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.lock().snapshot.clone()
    }

    pub fn view(&self) -> DashboardView {
        let state = self.inner.lock();
        DashboardView {
            phase: state.phase,
            snapshot: state.snapshot.clone(),
            files: state.pending.overlay(&state.snapshot),
            pending_uploads: state.pending.uploads().len(),
            pending_deletes: state.pending.deletes().len(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Run an aggregation cycle, or join the one already in flight.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, SyncError> {
        let mut rx = self.inner.start_cycle(true)?;
        loop {
            let finished = rx.borrow_and_update().clone();
            if let Some(snapshot) = finished {
                return Ok(snapshot);
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(SyncError::SessionClosed),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(SyncError::SessionClosed);
                    }
                }
            }
        }
    }

    /// Refresh every `period` until `stop` resolves. `stop` also cuts short a
    /// refresh that is still waiting on the backend.
    pub async fn run_periodic<F>(
        &self,
        period: Duration,
        stop: F,
        mut on_refresh: impl FnMut(Result<Arc<Snapshot>, SyncError>),
    ) where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);
        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut stop => return,
            }
            tokio::select! {
                result = self.refresh() => on_refresh(result),
                _ = &mut stop => return,
            }
        }
    }

    /// Re-probe node liveness. Only the node slice of the snapshot changes.
    pub async fn check_nodes(&self) -> Result<Arc<Snapshot>, SyncError> {
        self.inner.ensure_open()?;
        let previous = self.snapshot();
        let probed = aggregate::check_nodes(self.inner.api.as_ref(), &previous).await;
        self.inner.ensure_open()?;

        let mut state = self.inner.lock();
        // A full cycle may have committed while the probe was out.
        let mut next = (*state.snapshot).clone();
        next.replace_nodes_from(&probed);
        let next = Arc::new(next);
        state.store(next.clone());
        // Only a settled full cycle leaves Idle or Loading.
        if matches!(state.phase, Phase::Ready | Phase::ReadyWithErrors) {
            state.phase = Phase::settled(&next);
        }
        Ok(next)
    }

    /// Queue listing with an arbitrary filter. The snapshot only holds
    /// pending items.
    pub async fn queue(
        &self,
        filter: &QueueFilter,
    ) -> Result<Listing<ReplicationQueueItem>, SyncError> {
        self.inner.ensure_open()?;
        self.inner.api.fetch_queue(filter).await
    }

    /// Upload every file concurrently. Placeholders are visible as soon as
    /// this is called; each one is confirmed or removed on its own.
    pub async fn upload(&self, files: Vec<LocalUpload>) -> Result<Vec<UploadOutcome>, SyncError> {
        self.inner.ensure_open()?;
        let batch = self.inner.lock().pending.apply_upload(&files, Utc::now());
        info!(count = batch.len(), "Upload batch submitted");

        let handles: Vec<JoinHandle<Result<FileEntry, SyncError>>> = batch
            .iter()
            .zip(files)
            .map(|(pending, file)| {
                let inner = self.inner.clone();
                let local_id = pending.local_id.clone();
                tokio::spawn(async move { inner.upload_one(local_id, file).await })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(batch.len());
        for (pending, handle) in batch.into_iter().zip(handles) {
            outcomes.push(UploadOutcome {
                local_id: pending.local_id,
                filename: pending.filename,
                result: joined(handle, Resource::Upload).await,
            });
        }
        Ok(outcomes)
    }

    /// Hide `file_id` and delete it. On failure it shows again where it was.
    pub async fn delete(&self, file_id: &str) -> Result<(), SyncError> {
        self.inner.ensure_open()?;
        {
            let mut state = self.inner.lock();
            let snapshot = state.snapshot.clone();
            state.pending.apply_delete(file_id, &snapshot)?;
        }

        let inner = self.inner.clone();
        let file_id = file_id.to_string();
        let handle = tokio::spawn(async move { inner.delete_one(file_id).await });
        joined(handle, Resource::Delete).await
    }

    pub async fn recover_node(&self, node_id: &str) -> Result<RecoveryReport, SyncError> {
        self.inner.ensure_open()?;
        let report = self.inner.api.recover_node(node_id).await?;
        self.inner.ensure_open()?;
        info!(
            node_id,
            total = report.total,
            success = report.success,
            failed = report.failed,
            "Node recovery finished"
        );
        self.inner.schedule_trailing();
        Ok(report)
    }

    /// Fetch a file's bytes, checked against the listed SHA-256 when the
    /// snapshot has one.
    pub async fn download(&self, file_id: &str) -> Result<Bytes, SyncError> {
        self.inner.ensure_open()?;
        let expected = self
            .snapshot()
            .file(file_id)
            .and_then(|f| f.checksum_sha256.clone());
        let data = self.inner.api.download_file(file_id).await?;

        if let Some(expected) = expected {
            let actual = hex::encode(Sha256::digest(&data));
            if !actual.eq_ignore_ascii_case(&expected) {
                return Err(SyncError::ChecksumMismatch {
                    file_id: file_id.to_string(),
                    expected,
                    actual,
                });
            }
            debug!(file_id, "Checksum verified");
        }
        Ok(data)
    }

    /// End the session. Work already in flight runs to completion but its
    /// results are dropped.
    pub fn shutdown(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!("Dashboard session closed");
            self.inner.cancel.cancel();
        }
    }
}

impl State {
    /// Install a finished aggregation cycle.
    fn commit(&mut self, snapshot: Arc<Snapshot>) {
        self.phase = Phase::settled(&snapshot);
        self.store(snapshot);
    }

    fn store(&mut self, snapshot: Arc<Snapshot>) {
        self.pending.reconcile(&snapshot);
        self.snapshot = snapshot;
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::SessionClosed);
        }
        Ok(())
    }

    /// Start a cycle unless one is already running; either way return its
    /// receiver. `visible` cycles move the phase to `Loading`.
    fn start_cycle(self: &Arc<Self>, visible: bool) -> Result<CycleReceiver, SyncError> {
        self.ensure_open()?;
        let mut state = self.lock();
        if visible {
            state.phase = Phase::Loading;
        }
        if let Some(rx) = &state.inflight {
            debug!("Joining in-flight refresh");
            return Ok(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        state.inflight = Some(rx.clone());
        tokio::spawn(self.clone().run_cycles(tx));
        Ok(rx)
    }

    /// Refresh after a mutation without showing `Loading`. If a cycle is
    /// running its reads may predate the mutation, so one more follows it.
    fn schedule_trailing(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        {
            let mut state = self.lock();
            if state.inflight.is_some() {
                state.trailing = true;
                return;
            }
        }
        if let Err(e) = self.start_cycle(false) {
            debug!(error = %e, "Trailing refresh not started");
        }
    }

    async fn run_cycles(self: Arc<Self>, mut tx: watch::Sender<Option<Arc<Snapshot>>>) {
        loop {
            let previous = self.lock().snapshot.clone();
            let next = Arc::new(aggregate::refresh_all(self.api.as_ref(), &previous).await);

            let again = {
                let mut state = self.lock();
                if self.cancel.is_cancelled() {
                    state.inflight = None;
                    debug!("Session closed, discarding aggregation result");
                    return;
                }
                state.commit(next.clone());
                if std::mem::take(&mut state.trailing) {
                    let (next_tx, next_rx) = watch::channel(None);
                    state.inflight = Some(next_rx);
                    Some(next_tx)
                } else {
                    state.inflight = None;
                    None
                }
            };

            let _ = tx.send(Some(next));
            match again {
                Some(next_tx) => {
                    debug!("Running trailing refresh");
                    tx = next_tx;
                }
                None => return,
            }
        }
    }

    async fn upload_one(
        self: Arc<Self>,
        local_id: String,
        file: LocalUpload,
    ) -> Result<FileEntry, SyncError> {
        let result = self.api.upload_file(&file).await;
        self.ensure_open()?;

        match &result {
            Ok(entry) => {
                self.lock().pending.confirm_upload(&local_id, entry.clone());
                info!(local_id = %local_id, file_id = %entry.id, filename = %file.filename, "Upload confirmed");
                self.schedule_trailing();
            }
            Err(e) => {
                self.lock().pending.fail_upload(&local_id);
                warn!(local_id = %local_id, filename = %file.filename, error = %e, "Upload failed");
            }
        }
        result
    }

    async fn delete_one(self: Arc<Self>, file_id: String) -> Result<(), SyncError> {
        let result = self.api.delete_file(&file_id).await;
        self.ensure_open()?;

        match &result {
            Ok(()) => {
                self.lock().pending.confirm_delete(&file_id);
                info!(file_id = %file_id, "Delete confirmed");
                self.schedule_trailing();
            }
            Err(e) => {
                self.lock().pending.fail_delete(&file_id);
                warn!(file_id = %file_id, error = %e, "Delete failed, restoring file");
            }
        }
        result
    }
}

async fn joined<T>(
    handle: JoinHandle<Result<T, SyncError>>,
    resource: Resource,
) -> Result<T, SyncError> {
    handle.await.unwrap_or_else(|e| {
        Err(SyncError::Transport {
            resource,
            status_code: None,
            reason: format!("task failed: {e}"),
        })
    })
}
