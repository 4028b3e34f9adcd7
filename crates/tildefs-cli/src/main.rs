//! tildefs command-line tool.
//!
//! Usage:
//!   tildefs --root /srv/store set users/amy "profile"
//!   tildefs --root /srv/store get users/amy
//!   echo hello | tildefs put notes/today
//!   tildefs tree users
//!
//! The store root comes from `--root`, then `TILDEFS_ROOT`, then the
//! `root` key of `--config`, then the platform data directory.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncWriteExt, stdin, stdout};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tildefs::{Filepath, Filestore, StoreConfig, Transaction};

/// Hierarchical key/value store over a directory tree.
#[derive(Parser, Debug)]
#[command(name = "tildefs")]
#[command(about = "Read and write a tildefs store")]
struct Args {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store root directory (overrides config and environment)
    #[arg(short, long)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print none, leaf or node
    Type { path: String },
    /// Print the value at a path
    Get { path: String },
    /// Store a value (an empty value clears it)
    Set { path: String, value: String },
    /// Delete the value, keeping children
    Clear { path: String },
    /// List child names
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Remove a path and everything below it
    Rm { path: String },
    /// Stream stdin into a path
    Put { path: String },
    /// Stream a path to stdout
    Cat { path: String },
    /// Print the subtree below a path
    Tree {
        #[arg(default_value = "/")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tildefs: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<StoreConfig> {
    let config = match &args.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StoreConfig::default(),
    };
    let mut config = config.with_env_overrides();
    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let store = Filestore::open(&config)
        .await
        .with_context(|| format!("opening store at {}", config.root.display()))?;
    let txn = store.transaction();
    tracing::debug!(
        root = %store.config().root.display(),
        create_root = store.config().create_root,
        command = ?args.command,
        "running"
    );

    match args.command {
        Command::Type { path } => {
            let path = txn.path([path])?;
            println!("{}", txn.get_type(&path).await?);
        }
        Command::Get { path } => {
            let path = txn.path([path])?;
            let data = txn.get_data(&path).await?;
            let mut out = stdout();
            out.write_all(&data).await?;
            if !data.ends_with(b"\n") && !data.is_empty() {
                out.write_all(b"\n").await?;
            }
            out.flush().await?;
        }
        Command::Set { path, value } => {
            txn.set_data(&txn.path([path])?, value).await?;
        }
        Command::Clear { path } => {
            txn.clear_data(&txn.path([path])?).await?;
        }
        Command::Ls { path } => {
            for name in txn.get_kid_names(&txn.path([path])?).await? {
                println!("{name}");
            }
        }
        Command::Rm { path } => {
            txn.rem_subtree(&txn.path([path])?).await?;
        }
        Command::Put { path } => {
            let path = txn.path([path])?;
            let mut head = txn.get_data_head_stream(&path).await?;
            tokio::io::copy(&mut stdin(), &mut head)
                .await
                .context("streaming stdin")?;
            let written = head.finish().await?;
            tracing::info!(path = %path, written, "stored");
        }
        Command::Cat { path } => {
            let mut tail = txn.get_data_tail_stream(&txn.path([path])?).await?;
            let mut out = stdout();
            tokio::io::copy(&mut tail, &mut out).await?;
            out.flush().await?;
        }
        Command::Tree { path } => {
            let path = txn.path([path])?;
            print_tree(txn, &path).await?;
        }
    }
    Ok(())
}

/// Depth-first listing, one entry per line, with value sizes. Siblings are
/// pushed in reverse so they pop in name order.
async fn print_tree(txn: &Transaction, top: &Filepath) -> Result<()> {
    let mut stack = vec![(top.clone(), 0usize)];
    while let Some((path, depth)) = stack.pop() {
        let kind = txn.get_type(&path).await?;
        let bytes = txn.get_data_bytes(&path).await?;
        let name = if depth == 0 {
            path.to_string()
        } else {
            path.name().unwrap_or_default().to_string()
        };
        let indent = "  ".repeat(depth);
        if !kind.exists() {
            println!("{indent}{name} (none)");
        } else if kind.is_leaf() || bytes > 0 {
            println!("{indent}{name} [{bytes} bytes]");
        } else {
            println!("{indent}{name}");
        }
        if kind.is_node() {
            let parent = path.clone();
            let mut kids = txn
                .iterate_node(&path, move |name| parent.kid([name]))
                .await?
                .collect()
                .await?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            kids.sort_by(|a, b| b.name().cmp(&a.name()));
            stack.extend(kids.into_iter().map(|kid| (kid, depth + 1)));
        }
    }
    Ok(())
}
