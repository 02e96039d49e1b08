//! blockstore - inspect block store files

use anyhow::{bail, Context, Result};
use blockstore::storage::layout::{BLOCK_MASK, BLOCK_OFFSET_MASK};
use blockstore::storage::{Allocation, BlockCache, CacheConfig, Store, StoreConfig, BLOCK_SIZE};
use clap::{Parser as ClapParser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// blockstore - inspect block store files
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Blocks held by the cache
    #[arg(short = 'c', long, default_value = "256")]
    cache_blocks: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show store geometry and allocation summary
    Info {
        /// Store file
        path: PathBuf,
    },

    /// List the allocation of each block
    Alloc {
        /// Store file
        path: PathBuf,

        /// Maximum number of blocks to list
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Hex dump bytes from a block
    Dump {
        /// Store file
        path: PathBuf,

        /// Byte address inside the file
        #[arg(short, long, value_parser = parse_address)]
        address: u64,

        /// Number of bytes to dump
        #[arg(short, long, default_value = "256")]
        length: usize,
    },
}

fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {:?}: {}", s, e))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let cache = BlockCache::new(CacheConfig::with_capacity(args.cache_blocks));

    match args.command {
        Command::Info { path } => {
            let store = open_existing(&cache, &path)?;
            let result = print_info(&store);
            store.close()?;
            result
        }
        Command::Alloc { path, limit } => {
            let store = open_existing(&cache, &path)?;
            print_allocations(&store, limit);
            store.close()?;
            Ok(())
        }
        Command::Dump {
            path,
            address,
            length,
        } => {
            let store = open_existing(&cache, &path)?;
            let result = dump(&store, address, length);
            store.close()?;
            result
        }
    }
}

/// Opens a store without creating one when the file is missing.
fn open_existing(cache: &BlockCache, path: &Path) -> Result<Arc<Store>> {
    let len = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    if len == 0 {
        bail!("{} is empty", path.display());
    }

    // inspection never needs durable writes
    let config = StoreConfig::default().sync_on_flush(false);
    Store::open(cache, path, config).with_context(|| format!("Failed to open {}", path.display()))
}

fn print_info(store: &Arc<Store>) -> Result<()> {
    let table = store.allocation_table();

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for alloc in &table {
        *counts.entry(alloc.name()).or_default() += 1;
    }

    let header = store.header()?;

    println!("store:       {}", store);
    println!("path:        {}", store.path().display());
    println!("version:     {}", header.version);
    println!("file size:   {} bytes", store.file_size());
    println!("block size:  {} bytes", header.block_size);
    println!("group size:  {} blocks", header.alloc_group_count);
    println!("blocks:      {}", store.block_count());
    for (name, count) in counts {
        println!("  {:<14} {}", name, count);
    }

    let full_fragment_blocks = table
        .iter()
        .filter(|alloc| {
            matches!(
                alloc,
                Allocation::MiniFrag {
                    mask: Allocation::MINI_FRAG_FULL
                }
            )
        })
        .count();
    if full_fragment_blocks > 0 {
        println!("full mini-fragment blocks: {}", full_fragment_blocks);
    }

    Ok(())
}

fn print_allocations(store: &Arc<Store>, limit: Option<usize>) {
    let table = store.allocation_table();
    let limit = limit.unwrap_or(table.len());

    for (index, alloc) in table.iter().enumerate().take(limit) {
        match alloc {
            Allocation::MiniFrag { mask } => {
                println!("{:>8} {:#010x} {} mask={:#04x}", index, index * BLOCK_SIZE, alloc, mask)
            }
            _ => println!("{:>8} {:#010x} {}", index, index * BLOCK_SIZE, alloc),
        }
    }

    if table.len() > limit {
        println!("... {} more", table.len() - limit);
    }
}

fn dump(store: &Arc<Store>, address: u64, length: usize) -> Result<()> {
    let offset = (address & BLOCK_OFFSET_MASK) as usize;
    let length = length.min(BLOCK_SIZE - offset);

    let mut bytes = vec![0u8; length];
    store
        .read_block_bytes(address & BLOCK_MASK, offset, &mut bytes)
        .with_context(|| format!("Failed to read {:#x}", address))?;

    for (row, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        println!(
            "{:#010x}  {:<47}  {}",
            address + (row * 16) as u64,
            hex.join(" "),
            ascii
        );
    }

    Ok(())
}
