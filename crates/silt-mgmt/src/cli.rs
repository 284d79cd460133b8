//! The `silt` command line.

use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use silt_lake::{
    collect, serve, CommitMessage, Head, KeyRange, Lake, LocalLake, RemoteLake, VecPuller,
    DEFAULT_BATCH_SIZE,
};
use silt_meta::{DEFAULT_AUTHOR, MAIN_BRANCH};
use silt_storage::{Id, Layout, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ManageConfig;
use crate::monitor::Monitor;

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "silt")]
#[command(about = "Silt data lake management CLI", long_about = None)]
pub struct Cli {
    /// Lake location: a storage URI or path, or the URL of a lake service.
    #[arg(short, long, global = true, env = "SILT_LAKE")]
    pub lake: Option<String>,

    /// Config file (`.toml` or `.json`).
    #[arg(short, long, global = true, env = "SILT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Create a pool.
    Create {
        name: String,
        /// Pool key and order, e.g. `ts:desc`.
        #[arg(short = 'o', long, default_value = "ts:asc")]
        layout: String,
        /// Target data object size in bytes (0 for the default).
        #[arg(short = 'S', long, default_value = "0")]
        threshold: u64,
        /// Bytes between seek index entries (0 for the default).
        #[arg(long, default_value = "0")]
        seek_stride: u64,
    },
    /// Remove a pool and its data.
    Drop { pool: String },
    /// Rename a pool.
    Rename { pool: String, name: String },
    /// Create a branch, or remove one with `--delete`.
    Branch {
        pool: String,
        name: String,
        /// Commit to start from; defaults to the tip of `main`.
        #[arg(long)]
        at: Option<Id>,
        #[arg(short, long)]
        delete: bool,
    },
    /// Print the tip of `pool[@branch]`.
    Tip { head: String },
    /// Load JSON lines from a file or stdin.
    Load {
        head: String,
        /// Input file; stdin when absent or `-`.
        file: Option<PathBuf>,
        #[command(flatten)]
        msg: MessageArgs,
    },
    /// Delete objects by id, or records by key range.
    Delete {
        head: String,
        ids: Vec<Id>,
        /// Delete records with keys between LO and HI instead.
        #[arg(long, num_args = 2, value_names = ["LO", "HI"], conflicts_with = "ids")]
        range: Option<Vec<String>>,
        #[command(flatten)]
        msg: MessageArgs,
    },
    /// Merge objects into one.
    Compact {
        head: String,
        #[arg(required = true)]
        ids: Vec<Id>,
        /// Also write vector blobs.
        #[arg(long)]
        vectors: bool,
        #[command(flatten)]
        msg: MessageArgs,
    },
    /// Run a query and print the results as JSON lines.
    Query {
        /// Query source, e.g. `logs@main range 1 10` or `logs:objects`.
        source: String,
        /// Default `pool[@branch]` for the source.
        #[arg(long, default_value = "")]
        head: String,
        /// Print scan statistics to stderr.
        #[arg(short, long)]
        stats: bool,
    },
    /// Undo a commit.
    Revert {
        head: String,
        commit: Id,
        #[command(flatten)]
        msg: MessageArgs,
    },
    /// Merge `pool@branch` into another branch of the same pool.
    Merge {
        head: String,
        #[arg(default_value = MAIN_BRANCH)]
        into: String,
        #[command(flatten)]
        msg: MessageArgs,
    },
    /// Remove data objects no branch reaches.
    Vacuum {
        head: String,
        #[arg(long)]
        dryrun: bool,
    },
    /// Serve the lake over HTTP.
    Serve {
        #[arg(long, default_value = "127.0.0.1:9867")]
        listen: SocketAddr,
    },
    /// Compact pools.
    Manage {
        #[command(subcommand)]
        mode: ManageMode,
    },
}

/// How `manage` runs.
#[derive(Subcommand, Clone, Copy)]
pub enum ManageMode {
    /// One cycle on every pool.
    Update,
    /// Keep compacting until interrupted.
    Monitor,
}

/// Commit metadata flags.
#[derive(clap::Args, Clone)]
pub struct MessageArgs {
    /// Commit message.
    #[arg(short, long, default_value = "")]
    pub message: String,
    /// Commit author.
    #[arg(long, default_value = DEFAULT_AUTHOR)]
    pub author: String,
}

impl MessageArgs {
    fn commit_message(&self) -> CommitMessage {
        CommitMessage::new(self.message.as_str()).with_author(self.author.as_str())
    }
}

/// Open the lake at `location`: a lake service for `http(s)` URLs, the
/// store at a storage URI or a local path otherwise.
pub fn open_lake(location: &str, token: Option<&str>) -> Result<Arc<dyn Lake>> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(Arc::new(RemoteLake::with_token(location, token)?));
    }
    let uri = if location.contains("://") {
        location.to_string()
    } else {
        let path = Path::new(location);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        path.to_string_lossy().into_owned()
    };
    Ok(Arc::new(LocalLake::open(&uri)?))
}

fn split_head(head: &str) -> Result<(String, String)> {
    let head = Head::parse(head);
    let pool = head.pool.context("a pool name is required")?;
    Ok((pool, head.branch.unwrap_or_else(|| MAIN_BRANCH.to_string())))
}

/// Parse JSON lines into values.
pub fn parse_json_lines(text: &str) -> Result<Vec<Value>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            let json: serde_json::Value =
                serde_json::from_str(line).with_context(|| format!("line {}", n + 1))?;
            Ok(Value::from_json(&json))
        })
        .collect()
}

fn read_input(file: Option<&Path>) -> Result<String> {
    let mut text = String::new();
    match file {
        Some(path) if path != Path::new("-") => {
            text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
        }
        _ => {
            std::io::stdin().read_to_string(&mut text)?;
        }
    }
    Ok(text)
}

/// Cancelled on ctrl-c.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            child.cancel();
        }
    });
    token
}

impl Cli {
    fn manage_config(&self) -> Result<ManageConfig> {
        let mut config = match &self.config {
            Some(path) => ManageConfig::from_file(path)?,
            None => ManageConfig::default(),
        };
        if let Some(lake) = &self.lake {
            config.lake = lake.clone();
        }
        Ok(config)
    }

    /// Execute the parsed command.
    pub async fn run(self) -> Result<()> {
        let config = self.manage_config()?;
        let token = config.token()?;
        let lake = open_lake(&config.lake, token.as_deref())?;
        let cancel = interrupt_token();

        match self.command {
            Command::Create {
                name,
                layout,
                threshold,
                seek_stride,
            } => {
                let layout: Layout = layout.parse()?;
                let pool = lake.create_pool(&name, layout, seek_stride, threshold).await?;
                println!("pool created: {} {}", pool.name, pool.id);
            }
            Command::Drop { pool } => {
                let id = lake.id_of(&pool).await?;
                lake.remove_pool(id).await?;
                println!("pool deleted: {}", pool);
            }
            Command::Rename { pool, name } => {
                let id = lake.id_of(&pool).await?;
                lake.rename_pool(id, &name).await?;
                println!("pool {} renamed to {}", pool, name);
            }
            Command::Branch {
                pool,
                name,
                at,
                delete,
            } => {
                let id = lake.id_of(&pool).await?;
                if delete {
                    lake.remove_branch(id, &name).await?;
                    println!("branch deleted: {}", name);
                } else {
                    let at = match at {
                        Some(at) => at,
                        None => lake.tip(id, MAIN_BRANCH).await?,
                    };
                    let branch = lake.create_branch(id, &name, at).await?;
                    println!("{}@{} created at {}", pool, branch.name, branch.commit);
                }
            }
            Command::Tip { head } => {
                let (pool, branch) = split_head(&head)?;
                let id = lake.id_of(&pool).await?;
                println!("{}", lake.tip(id, &branch).await?);
            }
            Command::Load { head, file, msg } => {
                let (pool, branch) = split_head(&head)?;
                let id = lake.id_of(&pool).await?;
                let values = parse_json_lines(&read_input(file.as_deref())?)?;
                let count = values.len();
                let mut input = VecPuller::new(values, DEFAULT_BATCH_SIZE);
                let commit = lake
                    .load(id, &branch, &mut input, &msg.commit_message(), &cancel)
                    .await?;
                info!(pool = %pool, branch = %branch, records = count, "loaded");
                println!("{} committed", commit);
            }
            Command::Delete {
                head,
                ids,
                range,
                msg,
            } => {
                let (pool, branch) = split_head(&head)?;
                let id = lake.id_of(&pool).await?;
                let commit = match range.as_deref() {
                    Some([lo, hi]) => {
                        let range = KeyRange::new(Value::parse_literal(lo), Value::parse_literal(hi));
                        lake.delete_where(id, &branch, &range, &msg.commit_message(), &cancel)
                            .await?
                    }
                    Some(_) => bail!("--range takes two keys"),
                    None if ids.is_empty() => bail!("nothing to delete"),
                    None => lake.delete(id, &branch, &ids, &msg.commit_message()).await?,
                };
                println!("{} committed", commit);
            }
            Command::Compact {
                head,
                ids,
                vectors,
                msg,
            } => {
                let (pool, branch) = split_head(&head)?;
                let id = lake.id_of(&pool).await?;
                let commit = lake
                    .compact(id, &branch, &ids, vectors, &msg.commit_message(), &cancel)
                    .await?;
                println!("{} compaction committed", commit);
            }
            Command::Query {
                source,
                head,
                stats,
            } => {
                let mut scan = lake.query(&head, &source, &cancel).await?;
                for value in collect(scan.as_mut()).await? {
                    println!("{}", value.to_json());
                }
                if stats {
                    let p = scan.progress();
                    eprintln!(
                        "objects {} bytes {} records {} matched {}",
                        p.objects_read, p.bytes_read, p.records_read, p.records_matched
                    );
                }
            }
            Command::Revert { head, commit, msg } => {
                let (pool, branch) = split_head(&head)?;
                let id = lake.id_of(&pool).await?;
                let undo = lake
                    .revert(id, &branch, commit, &msg.commit_message())
                    .await?;
                println!("{} reverted in {}", commit, undo);
            }
            Command::Merge { head, into, msg } => {
                let (pool, branch) = split_head(&head)?;
                let id = lake.id_of(&pool).await?;
                let commit = lake
                    .merge_branch(id, &branch, &into, &msg.commit_message())
                    .await?;
                println!("{} merged into {} at {}", branch, into, commit);
            }
            Command::Vacuum { head, dryrun } => {
                let (pool, branch) = split_head(&head)?;
                let id = lake.id_of(&pool).await?;
                let ids = lake.vacuum(id, &branch, dryrun, &cancel).await?;
                let verb = if dryrun { "would vacuum" } else { "vacuumed" };
                println!("{} {} objects", verb, ids.len());
                for id in ids {
                    println!("{}", id);
                }
            }
            Command::Serve { listen } => {
                let listener = tokio::net::TcpListener::bind(listen)
                    .await
                    .with_context(|| format!("binding {}", listen))?;
                serve(lake, listener, cancel).await?;
            }
            Command::Manage { mode } => {
                let monitor = Monitor::new(lake, config);
                match mode {
                    ManageMode::Update => {
                        for (pool, report) in monitor.update(&cancel).await? {
                            println!(
                                "{}: {} runs, {} objects compacted, {} vectors added",
                                pool, report.runs_found, report.objects_compacted, report.vectors_added
                            );
                        }
                    }
                    ManageMode::Monitor => monitor.run(&cancel).await?,
                }
            }
        }
        Ok(())
    }
}
