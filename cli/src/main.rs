//! chainevents CLI: inspect and manage checkpoint files.
//!
//! Usage:
//! ```bash
//! chainevents inspect ./checkpoints/orders.json
//! chainevents reset   ./checkpoints/orders.json --block 41
//! chainevents info    --config network.json
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::env;
use std::path::Path;
use std::process;

use anyhow::{anyhow, bail, Context, Result};
use chainevents_core::{Checkpoint, NetworkConfig};
use chainevents_storage::{record_json, FileCheckpoint, CHECKPOINT_VERSION};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "inspect" => cmd_inspect(&args[2..]),
        "reset" => cmd_reset(&args[2..]),
        "info" => cmd_info(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("chainevents {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_usage() {
    println!("chainevents {}", env!("CARGO_PKG_VERSION"));
    println!("Block and commit event checkpoints\n");
    println!("USAGE:");
    println!("    chainevents <COMMAND>\n");
    println!("COMMANDS:");
    println!("    inspect <FILE>              Print a checkpoint record");
    println!("    reset <FILE> [--block N]    Clear a checkpoint, or move it to block N");
    println!("    info [--config <FILE>]      Show network configuration");
    println!("    version                     Print version");
    println!("    help                        Print this help");
}

fn cmd_inspect(args: &[String]) -> Result<()> {
    let [path] = args else {
        bail!("usage: chainevents inspect <FILE>");
    };
    let state = FileCheckpoint::load(path)?;
    println!("{}", serde_json::to_string_pretty(&record_json(&state)?)?);
    Ok(())
}

/// Parse `<FILE> [--block N]`.
fn parse_reset_args(args: &[String]) -> Result<(&Path, Option<u64>)> {
    match args {
        [path] => Ok((Path::new(path), None)),
        [path, flag, block] if flag == "--block" => {
            let block = block
                .parse::<u64>()
                .with_context(|| format!("invalid block number '{block}'"))?;
            Ok((Path::new(path), Some(block)))
        }
        _ => Err(anyhow!("usage: chainevents reset <FILE> [--block N]")),
    }
}

fn cmd_reset(args: &[String]) -> Result<()> {
    let (path, block) = parse_reset_args(args)?;
    let checkpoint = FileCheckpoint::open(path)?;
    match block {
        Some(block) => checkpoint.set_block_number(block)?,
        None => checkpoint.reset()?,
    }
    checkpoint.close()?;
    info!(path = %path.display(), ?block, "Checkpoint reset");
    println!("{}", serde_json::to_string_pretty(&record_json(&checkpoint.state())?)?);
    Ok(())
}

fn cmd_info(args: &[String]) -> Result<()> {
    let config = match args {
        [] => NetworkConfig::default(),
        [flag, path] if flag == "--config" => NetworkConfig::from_file(path)?,
        _ => bail!("usage: chainevents info [--config <FILE>]"),
    };
    println!("ChainEvents v{}", env!("CARGO_PKG_VERSION"));
    println!("  Channel: {}", config.channel);
    println!("  Commit strategy: {:?}", config.commit_strategy);
    println!("  Commit timeout: {} ms", config.commit_timeout_ms);
    println!("  Checkpoint format: JSON, version {CHECKPOINT_VERSION}, file-locked");
    Ok(())
}
