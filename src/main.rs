//! CLI running generated transfer load through the execution core.
//!
//! ```bash
//! # Speculative application lifecycle, fast path with OCC fallback
//! speculative-exec --mode app --giga --occ -b 20 -t 500
//!
//! # Block pipeline, sequential execution, heavy conflicts
//! speculative-exec --mode pipeline --no-occ --conflict-factor 0.9
//! ```

use clap::{Parser, ValueEnum};
use speculative_exec::loadgen::{LoadGenerator, WorkloadConfig};
use speculative_exec::{
    Application, BlockHeader, BlockInput, BlockPipeline, BlockProcessor, ExecutionConfig, HandlerRegistry,
    MemReceiptStore, MemStore, StandardHooks, TransferVm,
};
use alloy_primitives::{keccak256, B256};
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// process_proposal / finalize_block / commit per height.
    App,
    /// Submit every block to the four-stage pipeline.
    Pipeline,
}

#[derive(Parser, Debug)]
#[command(name = "speculative-exec")]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value = "app")]
    mode: Mode,

    /// Number of blocks
    #[arg(short = 'b', long, default_value = "10")]
    blocks: u64,

    /// Transactions per block
    #[arg(short = 't', long, default_value = "1000")]
    txs_per_block: usize,

    /// Number of funded accounts
    #[arg(short = 'a', long, default_value = "1000")]
    accounts: usize,

    /// 0.0 = independent transfers, 1.0 = every transfer between two accounts
    #[arg(long, default_value = "0.0")]
    conflict_factor: f64,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Enable the dependency-signalled fast path
    #[arg(long)]
    giga: bool,

    /// Disable the OCC path
    #[arg(long)]
    no_occ: bool,

    /// Worker threads for concurrent execution (default: available cores)
    #[arg(long)]
    workers: Option<usize>,
}

fn header(height: u64) -> BlockHeader {
    BlockHeader {
        height,
        hash: keccak256(height.to_be_bytes()),
        time: height,
        ..BlockHeader::default()
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = ExecutionConfig {
        giga_enabled: args.giga,
        occ_enabled: !args.no_occ,
        ..ExecutionConfig::default()
    };
    if let Some(workers) = args.workers {
        config.concurrency_workers = workers;
    }
    config.validate()?;

    let generator = LoadGenerator::new(WorkloadConfig {
        num_accounts: args.accounts,
        txs_per_block: args.txs_per_block,
        conflict_factor: args.conflict_factor,
        seed: args.seed,
        chain_id: config.chain_id,
        ..WorkloadConfig::default()
    });
    info!(
        mode = ?args.mode,
        blocks = args.blocks,
        txs_per_block = args.txs_per_block,
        accounts = args.accounts,
        conflict_factor = args.conflict_factor,
        giga = config.giga_enabled,
        occ = config.occ_enabled,
        workers = config.concurrency_workers,
        "generating workload"
    );
    let blocks: Vec<_> = (1..=args.blocks).map(|_| generator.next_block()).collect();

    let store = Arc::new(MemStore::with_genesis(generator.genesis()));
    let receipts = Arc::new(MemReceiptStore::new());
    let processor = BlockProcessor::new(
        config,
        Arc::new(HandlerRegistry::standard()),
        Arc::new(TransferVm),
        Arc::new(StandardHooks::new()),
    )?;

    let start = Instant::now();
    let (successful, app_hash) = match args.mode {
        Mode::App => run_app(processor, store, receipts, &blocks)?,
        Mode::Pipeline => run_pipeline(processor, store, receipts, &blocks)?,
    };
    let elapsed = start.elapsed();

    let total: usize = blocks.iter().map(Vec::len).sum();
    println!(
        "{:10} | {:6} blocks | {:8} txs | {:8} successful | {:9.2} ms | {:9.0} tx/s | {}",
        format!("{:?}", args.mode).to_lowercase(),
        blocks.len(),
        total,
        successful,
        elapsed.as_secs_f64() * 1000.0,
        total as f64 / elapsed.as_secs_f64(),
        app_hash
    );
    Ok(())
}

fn run_app(
    processor: BlockProcessor,
    store: Arc<MemStore>,
    receipts: Arc<MemReceiptStore>,
    blocks: &[Vec<alloy_primitives::Bytes>],
) -> Result<(usize, B256), Box<dyn Error>> {
    let app = Application::new(processor, store, receipts);
    let mut successful = 0;
    let mut app_hash = B256::ZERO;

    for (height, txs) in (1u64..).zip(blocks) {
        let header = header(height);
        app.process_proposal(&header, txs);
        let response = app.finalize_block(&header, txs)?;
        successful += response.tx_results.iter().filter(|r| r.is_ok()).count();
        app_hash = app.commit()?.app_hash;
    }

    let stats = app.speculation_stats();
    info!(hits = stats.hits, misses = stats.misses, timeouts = stats.timeouts, "speculation");
    Ok((successful, app_hash))
}

fn run_pipeline(
    processor: BlockProcessor,
    store: Arc<MemStore>,
    receipts: Arc<MemReceiptStore>,
    blocks: &[Vec<alloy_primitives::Bytes>],
) -> Result<(usize, B256), Box<dyn Error>> {
    // In-flight blocks never exceed what the output channel holds.
    let window = processor.config().channel_capacity.max(1);
    let pipeline = BlockPipeline::new(Arc::new(processor), store, receipts, 1);
    pipeline.start()?;

    let mut successful = 0;
    let mut app_hash = B256::ZERO;
    let mut in_flight = 0usize;
    let mut pending = (1u64..).zip(blocks).peekable();

    while pending.peek().is_some() || in_flight > 0 {
        if in_flight < window {
            if let Some((height, txs)) = pending.next() {
                pipeline.submit(BlockInput {
                    header: header(height),
                    txs: txs.clone(),
                })?;
                in_flight += 1;
                continue;
            }
        }
        let executed = pipeline.next_output(Duration::from_secs(60))?;
        in_flight -= 1;
        let block = executed.result.as_ref().map_err(|err| err.clone())?;
        successful += block.tx_results.iter().filter(|r| r.is_ok()).count();
        app_hash = pipeline.commit(executed.height())?;
    }

    pipeline.stop();
    Ok((successful, app_hash))
}
