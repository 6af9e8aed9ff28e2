//! blockdb - inspection CLI for a block storage directory

use anyhow::{Context, Result};
use blockdb::storage::{BlockId, BlockManager, PageBuffer};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

/// Inspect and manipulate a blockdb storage directory
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Storage directory
    #[arg(short = 'D', long, default_value = "./blockdb_data")]
    data_dir: PathBuf,

    /// Block size in bytes
    #[arg(short, long, default_value = "4096")]
    block_size: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report directory status and per-file block counts
    Info,
    /// Print the block count of one file
    Length { file: String },
    /// Hex-dump one block
    Dump { file: String, block: u64 },
    /// Allocate one new zero-filled block at the end of a file
    Append { file: String },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let manager = BlockManager::new(&args.data_dir, args.block_size)
        .with_context(|| format!("Failed to open storage directory {:?}", args.data_dir))?;

    match args.command {
        Command::Info => info(&manager, &args.data_dir)?,
        Command::Length { file } => println!("{}", manager.length(&file)?),
        Command::Dump { file, block } => dump(&manager, &file, block)?,
        Command::Append { file } => println!("{}", manager.append(&file)?),
    }

    Ok(())
}

fn info(manager: &BlockManager, data_dir: &Path) -> Result<()> {
    println!("Storage directory: {}", data_dir.display());
    println!("Newly created:     {}", manager.is_new());
    println!("Block size:        {} bytes", manager.block_size());

    let mut names = Vec::new();
    for entry in fs::read_dir(data_dir).context("Failed to list storage directory")? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();

    for name in &names {
        println!("{:>8} blocks  {}", manager.length(name)?, name);
    }
    if names.is_empty() {
        println!("(no files)");
    }

    Ok(())
}

fn dump(manager: &BlockManager, file: &str, number: u64) -> Result<()> {
    let block = BlockId::new(file, number);
    let mut page = PageBuffer::new(manager.block_size());
    manager.read(&block, &mut page)?;

    println!("{}", block);
    for (i, chunk) in page.contents().chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:08x}  {}", i * 16, hex.join(" "));
    }

    Ok(())
}
