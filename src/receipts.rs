//! Transaction receipts and log blooms.
//!
//! Receipts are auxiliary output: nothing here is part of the state root.

use crate::error::ReceiptError;
use crate::processor::ProcessedBlock;
use alloy_primitives::{Bloom, Log, B256};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: B256,
    pub height: u64,
    pub index: usize,
    pub success: bool,
    pub code: u32,
    pub gas_used: u64,
    /// Gas used by this and every earlier transaction of the block.
    pub cumulative_gas_used: u64,
    pub logs: Vec<Log>,
    pub logs_bloom: Bloom,
}

pub fn logs_bloom<'a>(logs: impl IntoIterator<Item = &'a Log>) -> Bloom {
    let mut bloom = Bloom::default();
    for log in logs {
        bloom.accrue_log(log);
    }
    bloom
}

/// Receipts of `block` in block order, and the block-wide bloom.
pub fn build_receipts(block: &ProcessedBlock) -> (Vec<Receipt>, Bloom) {
    let mut cumulative_gas_used = 0u64;
    let mut block_bloom = Bloom::default();
    let receipts = block
        .tx_results
        .iter()
        .zip(&block.tx_hashes)
        .enumerate()
        .map(|(index, (result, tx_hash))| {
            cumulative_gas_used = cumulative_gas_used.saturating_add(result.gas_used);
            let logs_bloom = logs_bloom(&result.logs);
            block_bloom.accrue_bloom(&logs_bloom);
            Receipt {
                tx_hash: *tx_hash,
                height: block.height,
                index,
                success: result.is_ok(),
                code: result.code,
                gas_used: result.gas_used,
                cumulative_gas_used,
                logs: result.logs.clone(),
                logs_bloom,
            }
        })
        .collect();
    (receipts, block_bloom)
}

/// Auxiliary receipt storage written by the finalizer.
pub trait ReceiptStore: Send + Sync {
    fn write_block(&self, height: u64, receipts: Vec<Receipt>, bloom: Bloom) -> Result<(), ReceiptError>;

    fn receipt(&self, tx_hash: &B256) -> Option<Receipt>;

    fn block_bloom(&self, height: u64) -> Option<Bloom>;
}

#[derive(Default)]
struct Inner {
    by_hash: BTreeMap<B256, Receipt>,
    blooms: BTreeMap<u64, Bloom>,
}

#[derive(Default)]
pub struct MemReceiptStore {
    inner: RwLock<Inner>,
}

impl MemReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReceiptStore for MemReceiptStore {
    fn write_block(&self, height: u64, receipts: Vec<Receipt>, bloom: Bloom) -> Result<(), ReceiptError> {
        let mut inner = self.inner.write();
        if inner.blooms.contains_key(&height) {
            return Err(ReceiptError::AlreadyWritten(height));
        }
        inner.blooms.insert(height, bloom);
        for receipt in receipts {
            inner.by_hash.insert(receipt.tx_hash, receipt);
        }
        Ok(())
    }

    fn receipt(&self, tx_hash: &B256) -> Option<Receipt> {
        self.inner.read().by_hash.get(tx_hash).cloned()
    }

    fn block_bloom(&self, height: u64) -> Option<Bloom> {
        self.inner.read().blooms.get(&height).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{codes, TxResult};
    use alloy_primitives::{Address, Bytes, BloomInput};

    fn log(address: u8) -> Log {
        Log::new_unchecked(Address::repeat_byte(address), vec![B256::repeat_byte(address)], Bytes::new())
    }

    #[test]
    fn test_receipts_accumulate_gas_and_bloom() {
        let block = ProcessedBlock {
            height: 9,
            tx_hashes: vec![B256::repeat_byte(1), B256::repeat_byte(2)],
            tx_results: vec![
                TxResult {
                    logs: vec![log(0xaa)],
                    ..TxResult::default()
                }
                .with_gas(30_000, 21_000),
                TxResult::sdk_error(codes::INVALID_SEQUENCE, "bad nonce").with_gas(21_000, 0),
            ],
            ..ProcessedBlock::default()
        };

        let (receipts, bloom) = build_receipts(&block);
        assert_eq!(receipts.len(), 2);
        assert!(receipts[0].success);
        assert!(!receipts[1].success);
        assert_eq!(receipts[1].cumulative_gas_used, 21_000);
        assert!(bloom.contains_input(BloomInput::Raw(Address::repeat_byte(0xaa).as_slice())));
        assert_eq!(receipts[1].logs_bloom, Bloom::default());

        let store = MemReceiptStore::new();
        store.write_block(9, receipts, bloom).expect("first write");
        assert_eq!(store.receipt(&B256::repeat_byte(2)).map(|r| r.index), Some(1));
        assert_eq!(store.block_bloom(9), Some(bloom));
        assert_eq!(store.write_block(9, Vec::new(), bloom), Err(ReceiptError::AlreadyWritten(9)));
    }
}
