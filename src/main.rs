//! Code Revive CLI
//!
//! Offline tools for cache files: dumping, opt record listings, merging and
//! size statistics.

use anyhow::Context;
use clap::{Parser, Subcommand};
use code_revive::config::Config;
use code_revive::{logging, merge, CacheFile, VERSION};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "code-revive")]
#[command(author, version, about = "Inspect and merge compiled code cache files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump a cache file: header, containers, lookup tables and code blobs
    Print {
        /// The cache file
        file: PathBuf,
        /// Print a JSON summary instead of the full listing
        #[arg(long)]
        json: bool,
    },

    /// List every version's dependencies and opt records
    PrintOpt {
        /// The cache file
        file: PathBuf,
    },

    /// Merge cache files from many runs into one
    Merge {
        /// Comma separated options, e.g. `file=out.csa,input_files=runs/,policy=coverage`
        options: String,
        /// Build identity the inputs must carry (default: that of the first input)
        #[arg(long)]
        identity: Option<String>,
    },

    /// Show per-container method, version and size counts
    Stats {
        /// The cache file
        file: PathBuf,
    },
}

fn load(path: &Path) -> anyhow::Result<CacheFile> {
    CacheFile::load(path, None).with_context(|| format!("cannot load {}", path.display()))
}

/// Merge options always carry `merge`
fn merge_options(options: &str) -> String {
    if options.split(',').any(|o| o == "merge") {
        options.to_string()
    } else {
        format!("merge,{}", options)
    }
}

fn run_merge(config: &Config, identity: Option<&str>) -> anyhow::Result<()> {
    let report = merge::merge(config, identity)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_stats(path: &Path) -> anyhow::Result<()> {
    let file = load(path)?;
    println!("Code Revive v{}", VERSION);
    println!("{}", path.display());
    println!("  build identity: {}", file.build_identity());
    println!("  metaspace entries: {}", file.meta().len());
    for (i, container) in file.containers().iter().enumerate() {
        let mut versions = 0;
        for (_, head) in container.methods() {
            versions += container.code_space().version_count(head)?;
        }
        println!(
            "  container #{}: {} methods, {} versions, {} code bytes, {} table bytes",
            i,
            container.method_count(),
            versions,
            container.code_space().len(),
            container.table().encoded_size()
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Merge { options, .. } => Config::parse(&merge_options(options))?,
        _ => Config::default(),
    };
    logging::init(&config, cli.verbose)?;

    match cli.command {
        Commands::Print { file, json } => {
            let cache = load(&file)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&cache.summary())?);
            } else {
                print!("{}", cache.print(None));
            }
        }
        Commands::PrintOpt { file } => print!("{}", load(&file)?.print_opt()?),
        Commands::Merge { identity, .. } => run_merge(&config, identity.as_deref())?,
        Commands::Stats { file } => run_stats(&file)?,
    }
    Ok(())
}
