use std::path::{Path, PathBuf};
use std::sync::Arc;

use dfsdash_common::format::{format_bytes, FileKind};
use dfsdash_common::model::QueueStatus;
use dfsdash_sync::config::DashConfig;
use dfsdash_sync::mutations::FileSyncState;
use dfsdash_sync::{Dashboard, DashboardView, HttpGateway, LocalUpload, QueueFilter, Snapshot, Source};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

const DEFAULT_CONFIG_PATH: &str = "dfsdash.toml";

const USAGE: &str = "usage: dfsdash [watch | check | queue [STATUS] [NODE] | upload PATH... | \
delete FILE_KEY | recover NODE_ID | download FILE_KEY DEST]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = PathBuf::from(
        std::env::var("DFSDASH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let config = DashConfig::load(&config_path)?;
    let gateway = HttpGateway::from_config(&config)?;
    info!(base_url = %gateway.base_url(), "dfsdash starting");
    let dash = Dashboard::new(Arc::new(gateway));

    let command = args.first().map(|s| s.as_str()).unwrap_or("watch");
    let rest = args.get(1..).unwrap_or_default();
    let result = match command {
        "watch" => watch(&dash, &config).await,
        "check" => check(&dash).await,
        "queue" => queue(&dash, rest).await,
        "upload" => upload(&dash, rest).await,
        "delete" => match rest {
            [file_key] => delete(&dash, file_key).await,
            _ => anyhow::bail!(USAGE),
        },
        "recover" => match rest {
            [node_id] => recover(&dash, node_id).await,
            _ => anyhow::bail!(USAGE),
        },
        "download" => match rest {
            [file_key, dest] => download(&dash, file_key, Path::new(dest)).await,
            _ => anyhow::bail!(USAGE),
        },
        _ => anyhow::bail!(USAGE),
    };
    dash.shutdown();
    result
}

async fn watch(dash: &Dashboard, config: &DashConfig) -> anyhow::Result<()> {
    dash.refresh().await?;
    print_view(&dash.view());

    info!("Watching cluster. Press Ctrl+C to stop.");
    let stop = async {
        let _ = signal::ctrl_c().await;
        info!("Received shutdown signal");
    };
    dash.run_periodic(config.refresh_interval(), stop, |result| match result {
        Ok(_) => print_view(&dash.view()),
        Err(e) => error!(error = %e, "Refresh failed"),
    })
    .await;
    Ok(())
}

async fn check(dash: &Dashboard) -> anyhow::Result<()> {
    dash.refresh().await?;
    let snapshot = dash.check_nodes().await?;
    if let Some(e) = snapshot.error(Source::Nodes) {
        anyhow::bail!("node check failed: {e}");
    }
    print_nodes(&snapshot);
    Ok(())
}

async fn queue(dash: &Dashboard, args: &[String]) -> anyhow::Result<()> {
    let filter = QueueFilter {
        status: args.first().map(|s| QueueStatus::parse(s)),
        node_id: args.get(1).cloned(),
    };
    let listing = dash.queue(&filter).await?;
    println!(
        "{:>6}  {:<10} {:<24} {:<12} {:<12} {:>5}",
        "ID", "STATUS", "FILE", "SOURCE", "TARGET", "TRIES"
    );
    for item in &listing.items {
        println!(
            "{:>6}  {:<10} {:<24} {:<12} {:<12} {:>5}",
            item.id,
            item.status.as_str(),
            item.file_key,
            item.source_node_id,
            item.target_node_id,
            item.retry_count,
        );
        if let Some(msg) = &item.error_message {
            println!("        last error: {msg}");
        }
    }
    println!("{} item(s)", listing.items.len());
    Ok(())
}

async fn upload(dash: &Dashboard, paths: &[String]) -> anyhow::Result<()> {
    if paths.is_empty() {
        anyhow::bail!(USAGE);
    }
    let mut files = Vec::new();
    for path in paths {
        for entry in WalkDir::new(path).follow_links(true) {
            let entry = entry?;
            if entry.file_type().is_file() {
                files.push(LocalUpload::from_path(entry.path()).await?);
            }
        }
    }
    if files.is_empty() {
        warn!("No files to upload");
        return Ok(());
    }

    let mut failed = 0;
    for outcome in dash.upload(files).await? {
        match outcome.result {
            Ok(entry) => println!(
                "uploaded  {:<32} {:>10}  {}",
                entry.filename,
                format_bytes(entry.size_bytes),
                entry.id
            ),
            Err(e) => {
                failed += 1;
                println!("failed    {:<32} {e}", outcome.filename);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} upload(s) failed");
    }
    Ok(())
}

async fn delete(dash: &Dashboard, file_key: &str) -> anyhow::Result<()> {
    dash.refresh().await?;
    dash.delete(file_key).await?;
    println!("deleted {file_key}");
    Ok(())
}

async fn recover(dash: &Dashboard, node_id: &str) -> anyhow::Result<()> {
    let report = dash.recover_node(node_id).await?;
    println!(
        "{}: {} total, {} succeeded, {} failed",
        report.message, report.total, report.success, report.failed
    );
    Ok(())
}

async fn download(dash: &Dashboard, file_key: &str, dest: &Path) -> anyhow::Result<()> {
    dash.refresh().await?;
    let data = dash.download(file_key).await?;
    tokio::fs::write(dest, &data)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", dest.display(), e))?;
    println!("{} -> {} ({})", file_key, dest.display(), format_bytes(data.len() as u64));
    Ok(())
}

fn print_view(view: &DashboardView) {
    let snapshot = &view.snapshot;
    let summary = snapshot.summary();
    println!(
        "[{}] health: {}  nodes: {} ({} up, {} down)  files: {}  pending replications: {}",
        view.phase.as_str(),
        snapshot.health.status.as_str(),
        summary.total_nodes,
        summary.up,
        summary.down,
        summary.total_files,
        snapshot.queue.len(),
    );
    for (source, e) in &snapshot.per_source_error {
        println!("  {source} unavailable: {e}");
    }
    print_nodes(snapshot);
    for visible in &view.files {
        let file = &visible.entry;
        let state = match visible.state {
            FileSyncState::Synced => "",
            FileSyncState::Uploading => "uploading",
            FileSyncState::AwaitingSync => "syncing",
        };
        println!(
            "  {:<32} {:>10}  {:<9} {} replica(s) {}",
            file.filename,
            format_bytes(file.size_bytes),
            FileKind::from_filename(&file.filename).as_str(),
            file.replica_node_ids.len(),
            state,
        );
    }
}

fn print_nodes(snapshot: &Snapshot) {
    for node in &snapshot.nodes {
        println!(
            "  {:<12} {:<24} {:<5} {:<8} {}",
            node.id,
            node.address,
            node.status.as_str(),
            node.role.as_str(),
            node.latency_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}
