//! Block execution across paths and conflict levels.

use alloy_primitives::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use speculative_exec::loadgen::{LoadGenerator, WorkloadConfig};
use speculative_exec::state::{MemStore, StateStore};
use speculative_exec::{BlockHeader, BlockProcessor, ExecutionConfig, HandlerRegistry, StandardHooks, TransferVm};
use std::sync::Arc;

const PATHS: [(&str, bool, bool); 3] = [("sequential", false, false), ("occ", false, true), ("fast", true, true)];

fn processor(giga_enabled: bool, occ_enabled: bool) -> BlockProcessor {
    let config = ExecutionConfig {
        giga_enabled,
        occ_enabled,
        ..ExecutionConfig::default()
    };
    match BlockProcessor::new(
        config,
        Arc::new(HandlerRegistry::standard()),
        Arc::new(TransferVm),
        Arc::new(StandardHooks::new()),
    ) {
        Ok(processor) => processor,
        Err(err) => panic!("invalid bench config: {err}"),
    }
}

fn workload(num_accounts: usize, txs_per_block: usize, conflict_factor: f64) -> (MemStore, Vec<Bytes>) {
    let generator = LoadGenerator::new(WorkloadConfig {
        num_accounts,
        txs_per_block,
        conflict_factor,
        ..WorkloadConfig::default()
    });
    // Signing happens here, outside the measured loop.
    let block = generator.next_block();
    (MemStore::with_genesis(generator.genesis()), block)
}

fn header() -> BlockHeader {
    BlockHeader {
        height: 1,
        ..BlockHeader::default()
    }
}

/// Full block processing (recovery included) per path and conflict factor.
fn bench_conflict_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_execution/conflict_levels");

    let conflict_factors = [0.0, 0.25, 0.5, 0.75, 1.0];
    let num_transactions = 1000;
    let header = header();

    for &conflict_factor in &conflict_factors {
        let (store, txs) = workload(1000, num_transactions, conflict_factor);
        let snapshot = store.snapshot();
        group.throughput(Throughput::Elements(num_transactions as u64));

        for (name, giga, occ) in PATHS {
            let processor = processor(giga, occ);
            group.bench_with_input(
                BenchmarkId::new(name, format!("conflict_{:.0}%", conflict_factor * 100.0)),
                &txs,
                |b, txs| {
                    b.iter(|| {
                        let block = processor.process_block(&*snapshot, &header, black_box(txs));
                        block.map(|b| b.tx_results.len()).unwrap_or_default()
                    });
                },
            );
        }
    }

    group.finish();
}

/// Execution only: transactions are recovered once up front.
fn bench_batch_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_execution/batch_sizes");

    let batch_sizes = [100, 500, 1000, 5000];
    let header = header();

    for &batch_size in &batch_sizes {
        let (store, txs) = workload(10_000, batch_size, 0.0);
        let snapshot = store.snapshot();
        group.throughput(Throughput::Elements(batch_size as u64));

        for (name, giga, occ) in PATHS {
            let processor = processor(giga, occ);
            let ctx = processor.block_context(&header);
            let prepared = processor.preprocess(&ctx, &txs);
            group.bench_with_input(BenchmarkId::new(name, batch_size), &prepared, |b, prepared| {
                b.iter(|| {
                    let block = processor.execute_prepared(&*snapshot, &header, &ctx, black_box(prepared.clone()));
                    block.map(|b| b.tx_results.len()).unwrap_or_default()
                });
            });
        }
    }

    group.finish();
}

/// Sender recovery alone.
fn bench_preprocessing(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_execution/preprocessing");

    let num_transactions = 1000;
    let (_, txs) = workload(1000, num_transactions, 0.0);
    let processor = processor(false, false);
    let ctx = processor.block_context(&header());

    group.throughput(Throughput::Elements(num_transactions as u64));
    group.bench_with_input(BenchmarkId::new("recover", num_transactions), &txs, |b, txs| {
        b.iter(|| processor.preprocess(&ctx, black_box(txs)).len());
    });

    group.finish();
}

criterion_group!(benches, bench_conflict_levels, bench_batch_sizes, bench_preprocessing);
criterion_main!(benches);
