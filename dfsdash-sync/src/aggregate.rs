//! Aggregation Orchestrator.
//!
//! Fans out to the four read sources at once and waits for every one of them
//! to settle. A failing source keeps its previous slice and is recorded in
//! `per_source_error`; it never blocks the other three.

use std::collections::HashMap;

use chrono::Utc;
use dfsdash_common::model::{Node, NodeRole, Resource};
use tracing::{info, warn};

use crate::error::SyncError;
use crate::gateway::{ClusterApi, QueueFilter};
use crate::snapshot::{Snapshot, Source};

/// Build a new snapshot from all four sources, starting from `previous`.
pub async fn refresh_all(api: &dyn ClusterApi, previous: &Snapshot) -> Snapshot {
    let queue_filter = QueueFilter::pending();

    // join!, not try_join!: every source must settle regardless of the others.
    let (nodes, health, files, queue) = tokio::join!(
        api.fetch_nodes(),
        api.fetch_health(),
        api.fetch_files(),
        api.fetch_queue(&queue_filter),
    );

    let mut next = Snapshot {
        nodes: previous.nodes.clone(),
        files: previous.files.clone(),
        queue: previous.queue.clone(),
        health: previous.health.clone(),
        per_source_error: Default::default(),
        skipped: Vec::new(),
        taken_at: Some(Utc::now()),
    };

    if let Some(listing) = settle(&mut next, Source::Nodes, nodes) {
        next.nodes = listing.items;
        next.skipped.extend(listing.skipped);
    }
    if let Some(health) = settle(&mut next, Source::Health, health) {
        next.health = health;
    }
    if let Some(listing) = settle(&mut next, Source::Files, files) {
        next.files = listing.items;
        next.skipped.extend(listing.skipped);
    }
    if let Some(listing) = settle(&mut next, Source::Queue, queue) {
        next.queue = listing.items;
        next.skipped.extend(listing.skipped);
    }

    info!(
        nodes = next.nodes.len(),
        files = next.files.len(),
        queue = next.queue.len(),
        health = next.health.status.as_str(),
        errors = next.per_source_error.len(),
        skipped = next.skipped.len(),
        "Aggregation cycle complete"
    );
    next
}

/// Re-probe node liveness and replace only the `nodes` slice.
///
/// The probe reports id, address and status; role, heartbeat and latency are
/// carried over from `previous` for nodes it already knew about.
pub async fn check_nodes(api: &dyn ClusterApi, previous: &Snapshot) -> Snapshot {
    let probed = api.check_nodes().await;

    let mut next = previous.clone();
    next.taken_at = Some(Utc::now());
    next.per_source_error.remove(&Source::Nodes);
    next.skipped.retain(|r| r.resource != Resource::Nodes);

    if let Some(listing) = settle(&mut next, Source::Nodes, probed) {
        next.nodes = merge_probe(&previous.nodes, listing.items);
        next.skipped.extend(listing.skipped);
    }
    next
}

fn settle<T>(next: &mut Snapshot, source: Source, outcome: Result<T, SyncError>) -> Option<T> {
    match outcome {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(source = %source, error = %e, "Source failed, keeping previous data");
            next.per_source_error.insert(source, e);
            None
        }
    }
}

fn merge_probe(known: &[Node], probed: Vec<Node>) -> Vec<Node> {
    let by_id: HashMap<&str, &Node> = known.iter().map(|n| (n.id.as_str(), n)).collect();
    probed
        .into_iter()
        .map(|mut node| {
            if let Some(prev) = by_id.get(node.id.as_str()) {
                if node.role == NodeRole::Unknown {
                    node.role = prev.role;
                }
                if node.address.is_empty() {
                    node.address = prev.address.clone();
                }
                node.last_heartbeat = node.last_heartbeat.or(prev.last_heartbeat);
                node.latency_ms = node.latency_ms.or(prev.latency_ms);
            }
            node
        })
        .collect()
}
