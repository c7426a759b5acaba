mod telemetry;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use powchain::{Block, Chain, Settings};

// -----------------------------
// Command line
// -----------------------------

/// Hash-chained proof-of-work ledger.
#[derive(Parser, Debug)]
#[clap(name = "powchain", version)]
struct Cli {
    /// Settings file (TOML). Defaults to ./powchain.toml when present.
    #[clap(long, short = 'c', global = true, value_parser)]
    config: Option<PathBuf>,

    /// Chain database directory.
    #[clap(long, global = true, value_parser)]
    db: Option<PathBuf>,

    /// Difficulty in leading zero bits, used only when creating a new chain.
    #[clap(long, global = true, value_parser)]
    difficulty: Option<u32>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mine a block carrying DATA and append it to the chain.
    Addblock {
        #[clap(long, value_parser)]
        data: String,
    },
    /// Print every block from the tip back to genesis.
    Printchain {
        /// Emit a JSON array instead of text.
        #[clap(long)]
        json: bool,
    },
    /// Re-validate proof of work and linkage of every block.
    Verify,
}

// -----------------------------
// Output
// -----------------------------

#[derive(Serialize)]
struct BlockView {
    timestamp: i64,
    data: String,
    prev_hash: String,
    hash: String,
    nonce: u64,
    pow_valid: bool,
}

impl BlockView {
    fn new(block: &Block, pow_valid: bool) -> Self {
        Self {
            timestamp: block.timestamp,
            data: String::from_utf8_lossy(&block.payload).into_owned(),
            prev_hash: hex::encode(&block.prev_hash),
            hash: block.hash_hex(),
            nonce: block.nonce,
            pow_valid,
        }
    }
}

fn format_time(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string())
}

// -----------------------------
// Commands
// -----------------------------

fn add_block(chain: &mut Chain, data: &str) -> Result<()> {
    let block = chain.append(data).context("append block")?;
    println!("Mined block {} (nonce={})", block.hash_hex(), block.nonce);
    Ok(())
}

fn print_chain(chain: &Chain, json: bool) -> Result<()> {
    let mut views = Vec::new();
    for block in chain.iter() {
        let block = block.context("read block")?;
        views.push(BlockView::new(&block, block.validate(chain.pow())));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }
    for view in &views {
        println!("Prev. Hash: {}", view.prev_hash);
        println!("Data: {}", view.data);
        println!("Hash: {}", view.hash);
        println!("Nonce: {}", view.nonce);
        println!("Time: {}", format_time(view.timestamp));
        println!("PoW: {}", view.pow_valid);
        println!();
    }
    Ok(())
}

fn verify(chain: &Chain) -> Result<()> {
    let report = chain.verify().context("walk chain")?;
    for block in &report.blocks {
        let status = if block.is_valid() { "ok" } else { "INVALID" };
        println!(
            "{} {} pow={} linked={}",
            status, block.hash, block.pow_valid, block.linked
        );
    }
    let invalid = report.invalid().count();
    if invalid > 0 {
        bail!("{invalid} of {} blocks failed verification", report.len());
    }
    println!("{} blocks verified (difficulty {})", report.len(), chain.difficulty());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("load settings")?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    if let Some(difficulty) = cli.difficulty {
        settings.difficulty = difficulty;
    }
    telemetry::init(&settings.log_level)?;

    let mut chain = Chain::open_or_create(&settings)
        .with_context(|| format!("open chain at {}", settings.db_path.display()))?;

    match cli.command {
        Command::Addblock { data } => add_block(&mut chain, &data),
        Command::Printchain { json } => print_chain(&chain, json),
        Command::Verify => verify(&chain),
    }
}
