//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use stumatch_reconcile::{LifecycleEntry, LifecycleState};
use tabled::{Table, Tabled};

use crate::cache::CacheSnapshot;
use crate::client::{FileRecord, NodeRecord};
use crate::distribution::DistributionProgress;

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

/// Print rows in the specified format.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => println!("{}", format_json(data, "[]")),
    }
}

/// Print a single item as JSON.
pub fn print_single<T: Serialize>(data: &T) {
    println!("{}", format_json(data, "{}"));
}

pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

pub fn print_failure(message: &str) {
    eprintln!("{} {}", "Error:".red().bold(), message);
}

fn format_json<T: Serialize + ?Sized>(data: &T, fallback: &str) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| fallback.to_string())
}

/// Registry node row.
#[derive(Debug, Clone, Serialize, Tabled)]
pub struct NodeRow {
    #[tabled(rename = "Node")]
    pub node_id: String,
    #[tabled(rename = "Port", display = "display_option_u32")]
    pub port: Option<u32>,
    #[tabled(rename = "Address", display = "display_option")]
    pub address: Option<String>,
    #[tabled(rename = "Status")]
    pub status: String,
}

impl From<&NodeRecord> for NodeRow {
    fn from(node: &NodeRecord) -> Self {
        let status = if node.running {
            "running".green().to_string()
        } else {
            "stopped".dimmed().to_string()
        };
        Self {
            node_id: node.node_id.clone(),
            port: node.port,
            address: node.address.clone(),
            status,
        }
    }
}

/// Lifecycle entry row.
#[derive(Debug, Clone, Serialize, Tabled)]
pub struct LifecycleRow {
    #[tabled(rename = "Node")]
    pub node_id: String,
    #[tabled(rename = "State")]
    pub state: String,
    #[tabled(rename = "Progress")]
    pub progress: String,
    #[tabled(rename = "Port")]
    pub port: u32,
    #[tabled(rename = "Error", display = "display_option")]
    pub error: Option<String>,
}

impl From<&LifecycleEntry> for LifecycleRow {
    fn from(entry: &LifecycleEntry) -> Self {
        Self {
            node_id: entry.node_id.clone(),
            state: colorize_state(entry.state),
            progress: format!("{:.1}%", entry.progress),
            port: entry.port,
            error: entry.error.clone(),
        }
    }
}

/// File row.
#[derive(Debug, Clone, Serialize, Tabled)]
pub struct FileRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Name")]
    pub file_name: String,
    #[tabled(rename = "Size")]
    pub size: String,
    #[tabled(rename = "Uploaded")]
    pub uploaded: String,
}

impl From<&FileRecord> for FileRow {
    fn from(file: &FileRecord) -> Self {
        Self {
            id: file.id.clone(),
            file_name: file.file_name.clone(),
            size: format_bytes(file.size_bytes),
            uploaded: file
                .created_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Per-node chunk reveal row.
#[derive(Debug, Clone, Serialize, Tabled)]
pub struct ChunkRow {
    #[tabled(rename = "Node")]
    pub node_id: String,
    #[tabled(rename = "Chunks")]
    pub chunks: String,
    #[tabled(rename = "Confirmed")]
    pub confirmed: String,
}

/// Rows for a distribution presentation.
pub fn chunk_rows(progress: &DistributionProgress) -> Vec<ChunkRow> {
    progress
        .nodes
        .iter()
        .map(|node| {
            let chunks = node
                .chunk_indices
                .iter()
                .map(|i| format!("#{i}"))
                .collect::<Vec<_>>()
                .join(" ");
            let confirmed = format!("{}/{}", node.confirmed, node.chunk_indices.len());
            let confirmed = if node.complete {
                confirmed.green().to_string()
            } else {
                confirmed
            };
            ChunkRow {
                node_id: node.node_id.clone(),
                chunks,
                confirmed,
            }
        })
        .collect()
}

/// Print the cached view plus live lifecycle entries.
pub fn print_dashboard(snapshot: &CacheSnapshot, entries: &[LifecycleEntry], format: OutputFormat) {
    let nodes: Vec<NodeRow> = snapshot.nodes().iter().map(NodeRow::from).collect();
    let files: Vec<FileRow> = snapshot.files().iter().map(FileRow::from).collect();
    let provisioning: Vec<LifecycleRow> = entries.iter().map(LifecycleRow::from).collect();

    if format == OutputFormat::Json {
        print_single(&serde_json::json!({
            "nodes": snapshot.nodes(),
            "files": snapshot.files(),
            "networkStatus": snapshot.network_status(),
            "provisioning": entries,
        }));
        return;
    }

    if let Some(status) = snapshot.network_status() {
        print_info(&format!(
            "{} nodes, {} of {} used ({:.1}%), {} chunks",
            status.total_nodes,
            format_bytes(status.used_storage_bytes),
            format_bytes(status.total_storage_bytes),
            status.utilization_percent,
            status.total_chunks
        ));
    }
    print_output(&nodes, format);
    if !provisioning.is_empty() {
        print_output(&provisioning, format);
    }
    print_output(&files, format);
}

fn colorize_state(state: LifecycleState) -> String {
    match state {
        LifecycleState::Active => state.as_str().green().to_string(),
        LifecycleState::Failed => state.as_str().red().to_string(),
        _ => state.as_str().yellow().to_string(),
    }
}

/// Human-readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

fn display_option(opt: &Option<String>) -> String {
    opt.as_deref().unwrap_or("-").to_string()
}

fn display_option_u32(opt: &Option<u32>) -> String {
    opt.map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}
