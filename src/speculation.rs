//! Speculative execution of proposed blocks ahead of confirmation.
//!
//! At most one speculation is in flight. Its slot is taken out under the
//! lock by the confirming call and the lock is released before waiting.

use crate::error::BlockError;
use crate::processor::ProcessedBlock;
use alloy_primitives::B256;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type BlockOutcome = Result<ProcessedBlock, BlockError>;

struct OptimisticProcessingInfo {
    height: u64,
    hash: B256,
    aborted: bool,
    /// `None` for a slot marked aborted without a computation.
    completion: Option<Receiver<BlockOutcome>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeculationState {
    Idle,
    Speculating { height: u64 },
    Aborted { height: u64 },
}

#[derive(Debug, Default)]
pub struct SpeculationStats {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    aborts: AtomicU64,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeculationCounts {
    pub hits: u64,
    pub misses: u64,
    pub timeouts: u64,
    pub aborts: u64,
}

impl SpeculationStats {
    pub fn counts(&self) -> SpeculationCounts {
        SpeculationCounts {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
        }
    }
}

pub struct SpeculationController {
    slot: Mutex<Option<OptimisticProcessingInfo>>,
    timeout: Duration,
    stats: SpeculationStats,
}

impl SpeculationController {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            timeout,
            stats: SpeculationStats::default(),
        }
    }

    pub fn state(&self) -> SpeculationState {
        match self.slot.lock().as_ref() {
            None => SpeculationState::Idle,
            Some(info) if info.aborted => SpeculationState::Aborted { height: info.height },
            Some(info) => SpeculationState::Speculating { height: info.height },
        }
    }

    pub fn stats(&self) -> SpeculationCounts {
        self.stats.counts()
    }

    /// Starts speculating on proposal `hash` at `height`.
    ///
    /// A different proposal at the height already in flight aborts it; the
    /// running computation finishes and its result is dropped. Returns
    /// whether `job` was started.
    pub fn propose<F>(&self, height: u64, hash: B256, job: F) -> bool
    where
        F: FnOnce() -> BlockOutcome + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(info) = slot.as_mut() {
            if info.height == height {
                if info.hash != hash && !info.aborted {
                    info.aborted = true;
                    self.stats.aborts.fetch_add(1, Ordering::Relaxed);
                    info!(height, in_flight = %info.hash, proposed = %hash, "conflicting proposal, speculation aborted");
                }
                return false;
            }
            debug!(height, replaced = info.height, "replacing stale speculation");
        }

        let (sender, receiver) = bounded(1);
        let spawned = thread::Builder::new()
            .name(format!("speculate-{height}"))
            .spawn(move || {
                // The confirming call may have given up already.
                let _ = sender.send(job());
            });
        if let Err(err) = spawned {
            warn!(height, %err, "failed to spawn speculation");
            *slot = None;
            return false;
        }

        *slot = Some(OptimisticProcessingInfo {
            height,
            hash,
            aborted: false,
            completion: Some(receiver),
        });
        info!(height, %hash, "speculation started");
        true
    }

    /// Prevents any speculative result from being used at `height`.
    pub fn mark_skipped(&self, height: u64, hash: B256) {
        let mut slot = self.slot.lock();
        match slot.as_mut() {
            Some(info) if info.height == height => info.aborted = true,
            _ => {
                *slot = Some(OptimisticProcessingInfo {
                    height,
                    hash,
                    aborted: true,
                    completion: None,
                })
            }
        }
        debug!(height, "speculation skipped");
    }

    /// Returns the block for (`height`, `hash`), reusing a matching
    /// speculative result or running `redo` synchronously. The slot is
    /// always empty afterwards.
    pub fn confirm<F>(&self, height: u64, hash: B256, redo: F) -> BlockOutcome
    where
        F: FnOnce() -> BlockOutcome,
    {
        let info = self.slot.lock().take();
        let Some(info) = info else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            debug!(height, "no speculation in flight, executing");
            return redo();
        };

        let usable = !info.aborted && info.height == height && info.hash == hash;
        let completion = match info.completion {
            Some(completion) if usable => completion,
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                info!(
                    height,
                    speculated_height = info.height,
                    aborted = info.aborted,
                    "speculative result unusable, executing"
                );
                return redo();
            }
        };

        match completion.recv_timeout(self.timeout) {
            Ok(Err(err)) if err.is_upgrade() => Err(err),
            Ok(Ok(block)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(height, "speculative result reused");
                Ok(block)
            }
            Ok(Err(err)) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                warn!(height, %err, "speculative execution failed, executing");
                redo()
            }
            Err(RecvTimeoutError::Timeout) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(height, timeout_ms = self.timeout.as_millis() as u64, "speculation timed out, executing");
                redo()
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                warn!(height, "speculation ended without a result, executing");
                redo()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxResult;
    use crossbeam::channel::unbounded;

    fn block(height: u64, tag: u32) -> ProcessedBlock {
        ProcessedBlock {
            height,
            tx_results: vec![TxResult {
                code: tag,
                ..TxResult::default()
            }],
            ..ProcessedBlock::default()
        }
    }

    #[test]
    fn test_matching_confirmation_reuses_result() {
        let controller = SpeculationController::new(Duration::from_secs(5));
        let h1 = B256::repeat_byte(1);
        assert!(controller.propose(3, h1, move || Ok(block(3, 7))));
        assert_eq!(controller.state(), SpeculationState::Speculating { height: 3 });

        let result = controller.confirm(3, h1, || panic!("must reuse"));
        assert_eq!(result, Ok(block(3, 7)));
        assert_eq!(controller.state(), SpeculationState::Idle);
        assert_eq!(controller.stats().hits, 1);
    }

    #[test]
    fn test_conflicting_proposal_forces_redo() {
        let controller = SpeculationController::new(Duration::from_secs(5));
        let (h1, h2) = (B256::repeat_byte(1), B256::repeat_byte(2));
        let (release, gate) = unbounded::<()>();

        assert!(controller.propose(4, h1, move || {
            let _ = gate.recv();
            Ok(block(4, 99))
        }));
        assert!(!controller.propose(4, h2, || Ok(block(4, 100))));
        assert_eq!(controller.state(), SpeculationState::Aborted { height: 4 });
        drop(release);

        let result = controller.confirm(4, h1, || Ok(block(4, 1)));
        assert_eq!(result, Ok(block(4, 1)));
        assert_eq!(controller.state(), SpeculationState::Idle);
        let stats = controller.stats();
        assert_eq!((stats.aborts, stats.misses, stats.hits), (1, 1, 0));
    }

    #[test]
    fn test_timeout_falls_back() {
        let controller = SpeculationController::new(Duration::from_millis(20));
        let hash = B256::repeat_byte(5);
        let (_hold, gate) = unbounded::<()>();
        controller.propose(5, hash, move || {
            let _ = gate.recv_timeout(Duration::from_secs(1));
            Ok(block(5, 50))
        });

        assert_eq!(controller.confirm(5, hash, || Ok(block(5, 0))), Ok(block(5, 0)));
        assert_eq!(controller.stats().timeouts, 1);
        assert_eq!(controller.state(), SpeculationState::Idle);
    }

    #[test]
    fn test_skipped_height_and_cold_path() {
        let controller = SpeculationController::new(Duration::from_secs(1));
        let hash = B256::repeat_byte(6);
        controller.mark_skipped(6, hash);
        assert_eq!(controller.state(), SpeculationState::Aborted { height: 6 });
        assert_eq!(controller.confirm(6, hash, || Ok(block(6, 2))), Ok(block(6, 2)));

        // Nothing in flight.
        assert_eq!(controller.confirm(7, hash, || Ok(block(7, 3))), Ok(block(7, 3)));
        assert_eq!(controller.stats().misses, 2);
    }

    #[test]
    fn test_upgrade_from_speculation_propagates() {
        let controller = SpeculationController::new(Duration::from_secs(5));
        let hash = B256::repeat_byte(8);
        controller.propose(8, hash, || {
            Err(BlockError::UpgradeRequired {
                name: "v2".into(),
                height: 8,
            })
        });
        let result = controller.confirm(8, hash, || panic!("upgrade must not be redone"));
        assert!(result.is_err_and(|err| err.is_upgrade()));
    }
}
