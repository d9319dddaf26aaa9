//! Bonsai - command line access to a directory of bonsai trees

use anyhow::{Context, Result};
use bonsai::access::{EdgeKey, KeyBound};
use bonsai::config::{StorageConfig, WalConfig, DEFAULT_PAGE_SIZE};
use bonsai::database::Database;
use clap::{Parser as ClapParser, Subcommand};
use log::info;
use std::path::PathBuf;

/// Bonsai - inspect and edit disk-resident bonsai trees
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory
    #[arg(short = 'D', long, default_value = "./bonsai_data")]
    data_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Page size used when the database is created
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Number of buffer pool frames
    #[arg(long, default_value = "1024")]
    frames: usize,

    /// Do not fsync the WAL on commit
    #[arg(long)]
    no_sync: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty tree
    Create { tree: String },
    /// Store a value under (group, position), creating the tree if needed
    Put {
        tree: String,
        group: i32,
        position: i64,
        value: i32,
    },
    /// Look up the value stored under (group, position)
    Get {
        tree: String,
        group: i32,
        position: i64,
    },
    /// List entries in key order
    Scan {
        tree: String,
        /// Only list entries of this group
        #[arg(short, long)]
        group: Option<i32>,
    },
    /// Print size and shape of a tree
    Stats { tree: String },
    /// Walk the leaf chain and verify key order and sibling links
    Check { tree: String },
    /// Delete a tree and its file
    Delete { tree: String },
    /// Flush all pages and restart the WAL
    Checkpoint,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = StorageConfig {
        page_size: args.page_size,
        buffer_pool_frames: args.frames,
        wal: WalConfig {
            sync_on_commit: !args.no_sync,
            ..Default::default()
        },
        ..Default::default()
    };

    let db = Database::open_or_create(&args.data_dir, config)
        .with_context(|| format!("Failed to open database at {}", args.data_dir.display()))?;
    let stats = db.recovery_stats();
    if stats.records_redone > 0 || stats.losers > 0 {
        info!(
            "Recovery redid {} records and rolled back {} operations",
            stats.records_redone, stats.losers
        );
    }

    run(&db, args.command)?;
    db.close()
}

fn run(db: &Database, command: Command) -> Result<()> {
    match command {
        Command::Create { tree } => {
            db.create_bonsai(&tree)?;
            println!("Created tree {}", tree);
        }
        Command::Put {
            tree,
            group,
            position,
            value,
        } => {
            let bonsai = if db.has_bonsai(&tree) {
                db.bonsai(&tree)?
            } else {
                db.create_bonsai(&tree)?
            };
            db.atomic_operations()
                .with_operation(|op| Ok(bonsai.put(op, group, position, value)?))?;
        }
        Command::Get {
            tree,
            group,
            position,
        } => match db.bonsai(&tree)?.get(group, position)? {
            Some(value) => println!("{}", value),
            None => println!("(not found)"),
        },
        Command::Scan { tree, group } => {
            let (from, to) = match group {
                Some(group) => (
                    KeyBound::Key(EdgeKey::new(group, i64::MIN)),
                    KeyBound::Key(EdgeKey::new(group, i64::MAX)),
                ),
                None => (KeyBound::AlwaysLess, KeyBound::AlwaysGreater),
            };
            let entries = db.bonsai(&tree)?.range(from, to)?;
            for (key, value) in &entries {
                println!("{}\t{}", key, value);
            }
            println!("({} entries)", entries.len());
        }
        Command::Stats { tree } => {
            let bonsai = db.bonsai(&tree)?;
            let report = bonsai.check_consistency()?;
            println!("tree:    {}", bonsai.name());
            println!("entries: {}", bonsai.size()?);
            println!("leaves:  {}", report.leaves);
            println!("depth:   {}", report.depth);
        }
        Command::Check { tree } => {
            let report = db.bonsai(&tree)?.check_consistency()?;
            println!(
                "OK: {} entries in {} leaves, depth {}",
                report.entries, report.leaves, report.depth
            );
        }
        Command::Delete { tree } => {
            db.delete_bonsai(&tree)?;
            println!("Deleted tree {}", tree);
        }
        Command::Checkpoint => {
            let lsn = db.checkpoint()?;
            println!("Checkpoint at LSN {}", lsn.0);
        }
    }
    Ok(())
}
