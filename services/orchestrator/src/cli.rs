//! Command-line interface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use stumatch_reconcile::LifecycleState;
use tracing::info;

use crate::client::{HttpNetworkClient, NodeRecord};
use crate::config::Config;
use crate::orchestrator::{ActionOutcome, NodeOrchestrator};
use crate::output::{
    chunk_rows, print_dashboard, print_failure, print_info, print_output, print_single,
    print_success, LifecycleRow, OutputFormat,
};
use crate::registry::{MockNetwork, NetworkApi};

/// How often follow-mode commands redraw.
const FOLLOW_INTERVAL: Duration = Duration::from_millis(250);

/// Storage node lifecycle orchestrator.
#[derive(Debug, Parser)]
#[command(name = "stumatch-orchestrator")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run against an in-memory storage network.
    #[arg(long, global = true)]
    mock: bool,

    /// Storage network API base URL.
    #[arg(long, global = true, env = "STUMATCH_API_URL")]
    api_url: Option<String>,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Keep the cached view fresh and print it on every refresh.
    Watch(WatchArgs),

    /// Provision new nodes and follow them until they are active or failed.
    Provision(ProvisionArgs),

    /// Upload a file and follow its chunk distribution.
    Upload(UploadArgs),

    /// Download a file.
    Download(DownloadArgs),

    /// Start a registered node that is stopped.
    Start(NodeArgs),

    /// Stop a running node.
    Stop(NodeArgs),

    /// Restart a node.
    Restart(NodeArgs),

    /// Stop and unregister a node.
    Delete(NodeArgs),

    /// Stop every running node.
    DeleteAll,

    /// Delete a file.
    DeleteFile(FileArgs),
}

#[derive(Debug, Args)]
struct WatchArgs {
    /// Refresh once, print and exit.
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Args)]
struct ProvisionArgs {
    /// Number of nodes to provision.
    #[arg(long, default_value = "1")]
    count: u32,
}

#[derive(Debug, Args)]
struct UploadArgs {
    /// File to upload.
    path: PathBuf,
}

#[derive(Debug, Args)]
struct DownloadArgs {
    /// File ID.
    file_id: String,

    /// Where to write the file.
    #[arg(long, short)]
    output: PathBuf,
}

#[derive(Debug, Args)]
struct NodeArgs {
    /// Node ID.
    node_id: String,
}

#[derive(Debug, Args)]
struct FileArgs {
    /// File ID.
    file_id: String,
}

impl Cli {
    /// Apply command-line overrides on top of `config`.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(url) = &self.api_url {
            config.api_url = url.trim_end_matches('/').to_string();
        }
    }

    pub async fn run(self, config: Config) -> Result<()> {
        let api = self.network(&config)?;
        let orchestrator = NodeOrchestrator::new(api, &config);

        let result = self.dispatch(&orchestrator, &config).await;
        orchestrator.shutdown().await;
        result
    }

    fn network(&self, config: &Config) -> Result<Arc<dyn NetworkApi>> {
        if self.mock {
            info!("Using in-memory storage network");
            let network = MockNetwork::new();
            network.add_node(NodeRecord::new("node1", config.base_port), true);
            network.add_node(NodeRecord::new("node2", config.base_port + 1), true);
            return Ok(Arc::new(network));
        }

        let client = HttpNetworkClient::new(config).context("failed to build HTTP client")?;
        Ok(Arc::new(client))
    }

    async fn dispatch(&self, orchestrator: &NodeOrchestrator, config: &Config) -> Result<()> {
        let format = self.format;
        match &self.command {
            Commands::Watch(args) => watch(orchestrator, config, args, format).await,
            Commands::Provision(args) => provision(orchestrator, args, format).await,
            Commands::Upload(args) => upload(orchestrator, args, format).await,
            Commands::Download(args) => {
                let bytes = orchestrator
                    .download_file(&args.file_id)
                    .await
                    .context("download failed")?;
                tokio::fs::write(&args.output, &bytes)
                    .await
                    .with_context(|| format!("failed to write {}", args.output.display()))?;
                print_success(&format!(
                    "Wrote {} bytes to {}",
                    bytes.len(),
                    args.output.display()
                ));
                Ok(())
            }
            Commands::Start(args) => {
                orchestrator.refresh_once().await;
                report("start", orchestrator.start_existing_node(&args.node_id).await)
            }
            Commands::Stop(args) => report("stop", orchestrator.stop_node(&args.node_id).await),
            Commands::Restart(args) => {
                orchestrator.refresh_once().await;
                report("restart", orchestrator.restart_node(&args.node_id).await)
            }
            Commands::Delete(args) => {
                report("delete", orchestrator.delete_node(&args.node_id).await)
            }
            Commands::DeleteAll => report("delete-all", orchestrator.delete_all_nodes().await),
            Commands::DeleteFile(args) => {
                report("delete-file", orchestrator.delete_file(&args.file_id).await)
            }
        }
    }
}

fn report(action: &str, outcome: ActionOutcome) -> Result<()> {
    match outcome {
        ActionOutcome::Accepted => {
            print_success(&format!("{action} accepted"));
            Ok(())
        }
        other => {
            print_failure(&format!("{action} {other}"));
            bail!("{action} did not succeed")
        }
    }
}

async fn watch(
    orchestrator: &NodeOrchestrator,
    config: &Config,
    args: &WatchArgs,
    format: OutputFormat,
) -> Result<()> {
    if args.once {
        let report = orchestrator.refresh_once().await;
        for (source, error) in &report.failed {
            print_failure(&format!("{source}: {error}"));
        }
        print_dashboard(
            &orchestrator.cache_snapshot().await,
            &orchestrator.lifecycle_entries().await,
            format,
        );
        return Ok(());
    }

    orchestrator.start();
    let mut ticker = tokio::time::interval(config.refresh_interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                return Ok(());
            }
            _ = ticker.tick() => {
                print_dashboard(
                    &orchestrator.cache_snapshot().await,
                    &orchestrator.lifecycle_entries().await,
                    format,
                );
            }
        }
    }
}

async fn provision(
    orchestrator: &NodeOrchestrator,
    args: &ProvisionArgs,
    format: OutputFormat,
) -> Result<()> {
    // Seed the cache so allocation sees every registered port.
    orchestrator.refresh_once().await;

    let mut node_ids = Vec::new();
    for _ in 0..args.count.max(1) {
        let node_id = orchestrator
            .start_node()
            .await
            .context("provisioning precondition failed")?;
        print_info(&format!("Provisioning {node_id}"));
        node_ids.push(node_id);
    }

    let mut last = Vec::new();
    loop {
        let entries: Vec<_> = orchestrator
            .lifecycle_entries()
            .await
            .into_iter()
            .filter(|e| node_ids.contains(&e.node_id))
            .collect();

        if format == OutputFormat::Table && entries != last {
            let rows: Vec<LifecycleRow> = entries.iter().map(LifecycleRow::from).collect();
            print_output(&rows, format);
        }

        // Retired entries are gone, which only happens after `Active`.
        if entries.iter().all(|e| e.is_terminal()) {
            if format == OutputFormat::Json {
                print_single(&entries);
            }
            let failed = entries
                .iter()
                .filter(|e| e.state == LifecycleState::Failed)
                .count();
            if failed > 0 {
                bail!("{failed} of {} nodes failed to provision", node_ids.len());
            }
            print_success(&format!("{} node(s) active", node_ids.len()));
            return Ok(());
        }

        last = entries;
        tokio::time::sleep(FOLLOW_INTERVAL).await;
    }
}

async fn upload(orchestrator: &NodeOrchestrator, args: &UploadArgs, format: OutputFormat) -> Result<()> {
    let bytes = tokio::fs::read(&args.path)
        .await
        .with_context(|| format!("failed to read {}", args.path.display()))?;
    let file_name = args
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string());

    let file_id = orchestrator
        .upload_file(&file_name, bytes)
        .await
        .context("upload failed")?;
    print_success(&format!("Uploaded {file_name} as {file_id}"));

    let mut last_confirmed = None;
    while let Some(progress) = orchestrator.distribution_progress().await {
        if last_confirmed != Some(progress.confirmed_positions) {
            match format {
                OutputFormat::Table => {
                    print_info(&format!(
                        "{}/{} chunks confirmed, replication {:.1}x",
                        progress.confirmed_positions,
                        progress.total_chunks,
                        progress.replication_factor
                    ));
                    print_output(&chunk_rows(&progress), format);
                }
                OutputFormat::Json => print_single(&progress),
            }
            last_confirmed = Some(progress.confirmed_positions);
        }
        tokio::time::sleep(FOLLOW_INTERVAL).await;
    }

    Ok(())
}
