//! Quire command line
//!
//! Loads a document snapshot and inspects it offline.
//!
//! ## Usage
//!
//! ```bash
//! # Print the block tree, optionally after replaying an op log
//! quire tree --snapshot doc.json [--ops ops.json] [--config quire.ron]
//!
//! # List blocks whose rectangles intersect a box
//! quire query --snapshot doc.json --rects rects.json 0 0 800 600
//! ```
//!
//! Set `RUST_LOG=debug` to see what the document layer does.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quire_crdt::Delta;
use quire_document::{DocumentConfig, DocumentController, MemoryRemote};
use quire_types::{BlockRect, DocumentData, Operation};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "quire", version, about = "Inspect Quire document snapshots")]
struct Cli {
    /// RON file overriding the document defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the block tree
    Tree {
        /// Snapshot JSON (`{rootId, blocks}`)
        #[arg(long)]
        snapshot: PathBuf,
        /// Operation log JSON to replay on top
        #[arg(long)]
        ops: Option<PathBuf>,
    },
    /// List blocks intersecting a box
    Query {
        #[arg(long)]
        snapshot: PathBuf,
        /// Block rectangles JSON (`[{id, x, y, width, height}]`)
        #[arg(long)]
        rects: PathBuf,
        #[arg(allow_negative_numbers = true)]
        x0: f64,
        #[arg(allow_negative_numbers = true)]
        y0: f64,
        #[arg(allow_negative_numbers = true)]
        x1: f64,
        #[arg(allow_negative_numbers = true)]
        y1: f64,
    },
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn open(snapshot: &Path, config: DocumentConfig) -> Result<DocumentController<MemoryRemote>> {
    let data: DocumentData = load_json(snapshot)?;
    let doc_id = snapshot
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let doc = DocumentController::open(doc_id, &data, Arc::new(MemoryRemote::new()), config)
        .with_context(|| format!("opening {}", snapshot.display()))?;
    Ok(doc)
}

/// One line per block, indented by depth.
fn render_tree(doc: &DocumentController<MemoryRemote>) -> String {
    let mut out = String::new();
    for (depth, block) in doc.chain().traverse(None) {
        let text = block
            .data
            .delta_value()
            .and_then(|v| Delta::from_value(v).ok())
            .map(|d| d.to_text().replace('\n', " "))
            .unwrap_or_default();
        let _ = write!(out, "{:indent$}{} {}", "", block.ty, block.id, indent = depth * 2);
        if !text.is_empty() {
            let _ = write!(out, " {:?}", text);
        }
        out.push('\n');
    }
    out
}

/// Ids of blocks whose rectangles intersect the box, top to bottom.
fn query(doc: &mut DocumentController<MemoryRemote>, rects: Vec<BlockRect>, bounds: [f64; 4]) -> Vec<String> {
    for rect in rects {
        let id = rect.id.clone();
        if !doc.observe_block(&id) {
            debug!("skipping rect for unknown block {}", id);
            continue;
        }
        doc.set_block_visible(&id, true);
        doc.report_block_rect(rect);
    }
    doc.commit_all_positions();
    let [x0, y0, x1, y1] = bounds;
    doc.get_intersect_blocks(x0, y0, x1, y1)
        .into_iter()
        .map(|r| r.id.to_string())
        .collect()
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => DocumentConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => DocumentConfig::default(),
    };

    match cli.command {
        Command::Tree { snapshot, ops } => {
            let mut doc = open(&snapshot, config)?;
            if let Some(path) = ops {
                let ops: Vec<Operation> = load_json(&path)?;
                let total = ops.len();
                let applied = doc.receive_ops(ops);
                info!("replayed {}/{} ops from {}", applied, total, path.display());
            }
            doc.chain().validate()?;
            print!("{}", render_tree(&doc));
            doc.close().await;
        }
        Command::Query {
            snapshot,
            rects,
            x0,
            y0,
            x1,
            y1,
        } => {
            let mut doc = open(&snapshot, config)?;
            let rects: Vec<BlockRect> = load_json(&rects)?;
            for id in query(&mut doc, rects, [x0, y0, x1, y1]) {
                println!("{id}");
            }
            doc.close().await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    run(Cli::parse()).await
}
