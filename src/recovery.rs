//! Pooled parallel sender recovery.
//!
//! A [`SenderRecoverer`] is checked out per block and sized to its
//! transaction count. Each [`SenderRecoverer::recover`] spawns one task on
//! the pool's rayon threads; [`SenderRecoverer::get`] blocks only on that
//! index's completion signal. Result buffers are recycled through the pool,
//! signals never are.

use crate::codec::TypedTx;
use crate::error::{ConfigError, RecoveryError};
use alloy_primitives::{Address, Bytes};
use crossbeam::channel::{bounded, Receiver};
use crossbeam::sync::WaitGroup;
use occ_executor::panic_message;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

pub type RecoveryResult = Result<Address, RecoveryError>;

/// Recovers the sender of a raw virtual machine transaction.
pub fn recover_raw(raw_tx: &[u8], chain_id: u64) -> RecoveryResult {
    let tx = match TypedTx::decode(raw_tx) {
        Ok(TypedTx::Vm(tx)) => tx,
        Ok(TypedTx::Native(_)) => return Err(RecoveryError::NotVmTransaction),
        Err(err) => return Err(RecoveryError::Decode(err.to_string())),
    };
    if tx.chain_id != chain_id {
        return Err(RecoveryError::InvalidSignature(format!(
            "signed for chain {}, expected {chain_id}",
            tx.chain_id
        )));
    }
    tx.recover_sender()
}

struct RecoveryBuffers {
    results: Vec<OnceLock<RecoveryResult>>,
    ready: Vec<Option<Receiver<()>>>,
}

/// Pool of reusable recoverers sharing one rayon thread pool.
pub struct SenderRecoveryPool {
    threads: Arc<rayon::ThreadPool>,
    idle: Mutex<Vec<RecoveryBuffers>>,
    /// Buffers whose capacity exceeds this are dropped on release.
    max_capacity: usize,
}

impl SenderRecoveryPool {
    pub fn new(num_threads: usize, max_capacity: usize) -> Result<Self, ConfigError> {
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("sender-recovery-{i}"))
            .build()
            .map_err(|e| ConfigError::ThreadPool(e.to_string()))?;
        Ok(Self {
            threads: Arc::new(threads),
            idle: Mutex::new(Vec::new()),
            max_capacity,
        })
    }

    /// Checks out a recoverer for a block of `tx_count` transactions.
    pub fn checkout(&self, height: u64, tx_count: usize) -> SenderRecoverer {
        let RecoveryBuffers {
            mut results,
            mut ready,
        } = self.idle.lock().pop().unwrap_or_else(|| RecoveryBuffers {
            results: Vec::new(),
            ready: Vec::new(),
        });

        results.resize_with(tx_count, OnceLock::new);
        ready.clear();
        ready.resize_with(tx_count, || None);

        SenderRecoverer {
            height,
            results: Arc::new(results),
            ready,
            wait_group: None,
            threads: self.threads.clone(),
        }
    }

    /// Returns a recoverer to the pool once all of its tasks have exited.
    pub fn release(&self, mut recoverer: SenderRecoverer) {
        recoverer.wait_all();

        let results = std::mem::take(&mut recoverer.results);
        let mut ready = std::mem::take(&mut recoverer.ready);
        let mut results = match Arc::try_unwrap(results) {
            Ok(results) => results,
            Err(_) => {
                warn!(height = recoverer.height, "recovery buffer still shared, not pooling");
                return;
            }
        };

        if results.capacity() > self.max_capacity {
            debug!(
                height = recoverer.height,
                capacity = results.capacity(),
                "dropping oversized recovery buffer"
            );
            return;
        }

        for slot in results.iter_mut() {
            slot.take();
        }
        ready.clear();
        self.idle.lock().push(RecoveryBuffers { results, ready });
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// Per-block recovery state.
pub struct SenderRecoverer {
    height: u64,
    results: Arc<Vec<OnceLock<RecoveryResult>>>,
    ready: Vec<Option<Receiver<()>>>,
    wait_group: Option<WaitGroup>,
    threads: Arc<rayon::ThreadPool>,
}

impl SenderRecoverer {
    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Starts recovering the sender of `raw_tx` at `idx`. Never blocks.
    pub fn recover(&mut self, idx: usize, raw_tx: Bytes, chain_id: u64) {
        self.recover_with(idx, move || recover_raw(&raw_tx, chain_id));
    }

    /// Runs `job` as the recovery task for `idx`.
    ///
    /// A panic inside `job` becomes an error result for `idx` only.
    pub fn recover_with<F>(&mut self, idx: usize, job: F)
    where
        F: FnOnce() -> RecoveryResult + Send + 'static,
    {
        if idx >= self.results.len() {
            warn!(height = self.height, idx, len = self.results.len(), "recovery index out of range");
            return;
        }
        if self.ready[idx].is_some() {
            warn!(height = self.height, idx, "recovery already requested");
            return;
        }

        let (signal, ready) = bounded::<()>(1);
        self.ready[idx] = Some(ready);

        let results = self.results.clone();
        let wait_group = self.wait_group.get_or_insert_with(WaitGroup::new).clone();
        self.threads.spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(job))
                .unwrap_or_else(|payload| Err(RecoveryError::Panicked(panic_message(payload.as_ref()))));
            let _ = results[idx].set(outcome);
            // Closing the signal wakes `get`; the buffer reference must be
            // gone before the wait group is.
            drop(signal);
            drop(results);
            drop(wait_group);
        });
    }

    /// Blocks until the recovery for `idx` completes.
    ///
    /// Returns `None` immediately if no recovery was requested for `idx`.
    pub fn get(&self, idx: usize) -> Option<&RecoveryResult> {
        let ready = self.ready.get(idx)?.as_ref()?;
        // The task never sends; the channel disconnects once the result is set.
        let _ = ready.recv();
        self.results[idx].get()
    }

    /// Blocks until every spawned task has exited.
    pub fn wait_all(&mut self) {
        if let Some(wait_group) = self.wait_group.take() {
            wait_group.wait();
        }
    }
}

impl Drop for SenderRecoverer {
    fn drop(&mut self) {
        self.wait_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VirtualMachineTx;
    use alloy_primitives::U256;
    use k256::ecdsa::SigningKey;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::time::{Duration, Instant};

    fn signed_raw(seed: u64) -> (Bytes, Address) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut key_bytes = [0u8; 32];
        rng.fill(&mut key_bytes);
        let key = SigningKey::from_bytes(&key_bytes.into()).expect("valid key bytes");
        let mut tx = VirtualMachineTx {
            chain_id: 1,
            nonce: seed,
            gas_limit: 21_000,
            max_fee_per_gas: U256::from(1),
            max_priority_fee_per_gas: U256::ZERO,
            to: Some(Address::repeat_byte(0x42)),
            value: U256::from(1),
            data: Bytes::new(),
            signature: Vec::new(),
        };
        tx.sign(&key).expect("signing succeeds");
        let raw = TypedTx::Vm(tx).encode().expect("encodes");
        (Bytes::from(raw), Address::from_private_key(&key))
    }

    #[test]
    fn test_get_blocks_until_recovered() {
        let pool = SenderRecoveryPool::new(2, 8192).expect("pool builds");
        let mut recoverer = pool.checkout(1, 3);
        let (gate_tx, gate_rx) = bounded::<()>(0);

        let sender = Address::repeat_byte(7);
        recoverer.recover_with(1, move || {
            let _ = gate_rx.recv();
            Ok(sender)
        });

        // Never submitted: returns without blocking.
        assert!(recoverer.get(0).is_none());
        assert!(recoverer.get(99).is_none());

        let start = Instant::now();
        let opener = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let _ = gate_tx.send(());
        });
        assert_eq!(recoverer.get(1), Some(&Ok(sender)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        opener.join().expect("opener thread");

        pool.release(recoverer);
    }

    #[test]
    fn test_panic_is_scoped_to_index() {
        let pool = SenderRecoveryPool::new(2, 8192).expect("pool builds");
        let mut recoverer = pool.checkout(1, 2);
        let (raw, sender) = signed_raw(3);

        recoverer.recover_with(0, || panic!("bad curve point"));
        recoverer.recover(1, raw, 1);

        assert_eq!(
            recoverer.get(0),
            Some(&Err(RecoveryError::Panicked("bad curve point".to_string())))
        );
        assert_eq!(recoverer.get(1), Some(&Ok(sender)));
        pool.release(recoverer);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_chain_id_mismatch() {
        let (raw, _) = signed_raw(4);
        assert!(matches!(recover_raw(&raw, 2), Err(RecoveryError::InvalidSignature(_))));
    }

    #[test]
    fn test_pool_reuse_never_leaks_prior_results() {
        let pool = SenderRecoveryPool::new(4, 8192).expect("pool builds");
        let signed: Vec<(Bytes, Address)> = (0..8).map(signed_raw).collect();
        let mut rng = StdRng::seed_from_u64(99);

        for round in 0..1000usize {
            let tx_count = match round % 10 {
                0 => 0,
                1 => 8192,
                2 => 8193,
                _ => rng.gen_range(1..64),
            };
            let mut recoverer = pool.checkout(round as u64, tx_count);
            assert_eq!(recoverer.len(), tx_count);

            let mut submitted = Vec::new();
            if tx_count > 0 {
                for _ in 0..rng.gen_range(0..4usize) {
                    let idx = rng.gen_range(0..tx_count);
                    if submitted.iter().any(|(i, _)| *i == idx) {
                        continue;
                    }
                    let which = (round + idx) % signed.len();
                    let (raw, sender) = signed[which].clone();
                    recoverer.recover(idx, raw, 1);
                    submitted.push((idx, sender));
                }
            }

            for idx in 0..tx_count.min(64) {
                match submitted.iter().find(|(i, _)| *i == idx) {
                    Some((_, sender)) => assert_eq!(recoverer.get(idx), Some(&Ok(*sender))),
                    None => assert!(recoverer.get(idx).is_none(), "round {round} idx {idx} leaked"),
                }
            }
            for (idx, sender) in &submitted {
                assert_eq!(recoverer.get(*idx), Some(&Ok(*sender)));
            }

            pool.release(recoverer);
        }

        // The 8193-entry buffer is never pooled, so at most one buffer idles.
        assert!(pool.idle_count() <= 1);
    }
}
