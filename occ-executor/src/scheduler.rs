//! Scheduler for coordinating parallel transaction execution with push-based invalidation.

use crate::types::{ExecutionStatus, Incarnation, TxnIndex};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, trace};

/// Task for a worker thread to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Execute a transaction at a specific incarnation.
    Execute(TxnIndex, Incarnation),
    /// No task currently available, retry later.
    Wait,
    /// All transactions are committed.
    Done,
}

/// Scheduler state for coordinating parallel execution.
pub struct Scheduler {
    /// Number of transactions in the batch.
    num_txns: usize,

    /// Execution status for each transaction.
    statuses: Vec<Mutex<ExecutionStatus>>,

    /// Queue of transactions ready to execute.
    ready_queue: Mutex<VecDeque<(TxnIndex, Incarnation)>>,

    /// Index of the next transaction to commit.
    commit_idx: AtomicUsize,

    /// Number of executions started, including re-executions.
    executions: AtomicUsize,

    /// Whether every transaction has committed.
    done: AtomicBool,

    /// Only one thread commits at a time.
    commit_lock: Mutex<()>,
}

impl Scheduler {
    /// Creates a new scheduler for a batch of transactions.
    pub fn new(num_txns: usize) -> Self {
        Self {
            num_txns,
            statuses: (0..num_txns)
                .map(|_| Mutex::new(ExecutionStatus::Ready(0)))
                .collect(),
            ready_queue: Mutex::new((0..num_txns).map(|idx| (idx, 0)).collect()),
            commit_idx: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            done: AtomicBool::new(num_txns == 0),
            commit_lock: Mutex::new(()),
        }
    }

    /// Gets the next task for a worker thread.
    pub fn next_task(&self) -> Task {
        if self.done.load(Ordering::Acquire) {
            return Task::Done;
        }

        let next = self.ready_queue.lock().pop_front();
        if let Some((txn_idx, incarnation)) = next {
            let mut status = self.statuses[txn_idx].lock();
            if *status == ExecutionStatus::Ready(incarnation) {
                *status = ExecutionStatus::Executing(incarnation);
                self.executions.fetch_add(1, Ordering::Relaxed);
                return Task::Execute(txn_idx, incarnation);
            }
            // Stale queue entry, superseded by a later abort.
            return Task::Wait;
        }

        if self.commit_idx.load(Ordering::Acquire) >= self.num_txns {
            self.done.store(true, Ordering::Release);
            return Task::Done;
        }

        Task::Wait
    }

    /// Marks a transaction as executed and aborts the invalidated readers.
    ///
    /// Returns false if the incarnation was aborted while running and has
    /// already been re-queued.
    pub fn finish_execution(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        invalidated: &[TxnIndex],
    ) -> bool {
        let finished = {
            let mut status = self.statuses[txn_idx].lock();
            match *status {
                ExecutionStatus::Executing(inc) if inc == incarnation => {
                    *status = ExecutionStatus::Executed(incarnation);
                    true
                }
                ExecutionStatus::Aborting(inc) if inc == incarnation => {
                    *status = ExecutionStatus::Ready(incarnation + 1);
                    self.ready_queue.lock().push_back((txn_idx, incarnation + 1));
                    false
                }
                _ => false,
            }
        };

        for &reader in invalidated {
            self.abort_transaction(reader);
        }

        finished
    }

    /// Aborts a transaction and schedules it for re-execution.
    pub fn abort_transaction(&self, txn_idx: TxnIndex) {
        let mut status = self.statuses[txn_idx].lock();
        match *status {
            ExecutionStatus::Executed(incarnation) => {
                trace!(txn_idx, incarnation, "aborting executed transaction");
                *status = ExecutionStatus::Ready(incarnation + 1);
                self.ready_queue.lock().push_back((txn_idx, incarnation + 1));
            }
            ExecutionStatus::Executing(incarnation) => {
                *status = ExecutionStatus::Aborting(incarnation);
            }
            // Already pending, aborting or committed.
            _ => {}
        }
    }

    /// Commits executed transactions in order.
    ///
    /// `validate` is called for the transaction at the commit index with its
    /// executed incarnation; every lower transaction is committed at that
    /// point, so a passing validation is final. A failing one re-queues the
    /// transaction. Returns the number of transactions committed by this call.
    pub fn try_commit<F>(&self, mut validate: F) -> usize
    where
        F: FnMut(TxnIndex, Incarnation) -> bool,
    {
        let Some(_guard) = self.commit_lock.try_lock() else {
            return 0;
        };

        let start_idx = self.commit_idx.load(Ordering::Acquire);
        let mut commit_idx = start_idx;

        while commit_idx < self.num_txns {
            let mut status = self.statuses[commit_idx].lock();
            let ExecutionStatus::Executed(incarnation) = *status else {
                break;
            };

            if !validate(commit_idx, incarnation) {
                debug!(txn_idx = commit_idx, incarnation, "read set changed, re-executing");
                *status = ExecutionStatus::Ready(incarnation + 1);
                self.ready_queue.lock().push_back((commit_idx, incarnation + 1));
                break;
            }

            *status = ExecutionStatus::Committed;
            drop(status);
            commit_idx += 1;
            self.commit_idx.store(commit_idx, Ordering::Release);
        }

        if commit_idx >= self.num_txns {
            self.done.store(true, Ordering::Release);
        }

        commit_idx - start_idx
    }

    /// Checks if a transaction has been committed.
    pub fn is_committed(&self, txn_idx: TxnIndex) -> bool {
        matches!(*self.statuses[txn_idx].lock(), ExecutionStatus::Committed)
    }

    /// Gets the current status of a transaction.
    pub fn get_status(&self, txn_idx: TxnIndex) -> ExecutionStatus {
        *self.statuses[txn_idx].lock()
    }

    /// Checks if all transactions are committed.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Number of executions started so far.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_basic() {
        let scheduler = Scheduler::new(3);

        assert_eq!(scheduler.next_task(), Task::Execute(0, 0));
        assert_eq!(scheduler.next_task(), Task::Execute(1, 0));
        assert_eq!(scheduler.next_task(), Task::Execute(2, 0));
        assert_eq!(scheduler.next_task(), Task::Wait);
    }

    #[test]
    fn test_empty_batch_is_done() {
        let scheduler = Scheduler::new(0);
        assert!(scheduler.is_done());
        assert_eq!(scheduler.next_task(), Task::Done);
    }

    #[test]
    fn test_abort_and_reexecute() {
        let scheduler = Scheduler::new(2);

        let _ = scheduler.next_task();
        assert!(scheduler.finish_execution(0, 0, &[]));

        let _ = scheduler.next_task();

        // Transaction 1 invalidates transaction 0.
        assert!(scheduler.finish_execution(1, 0, &[0]));

        assert_eq!(scheduler.next_task(), Task::Execute(0, 1));
    }

    #[test]
    fn test_abort_while_executing_requeues_after_finish() {
        let scheduler = Scheduler::new(2);

        assert_eq!(scheduler.next_task(), Task::Execute(0, 0));
        assert_eq!(scheduler.next_task(), Task::Execute(1, 0));

        scheduler.abort_transaction(1);
        assert_eq!(scheduler.get_status(1), ExecutionStatus::Aborting(0));
        assert_eq!(scheduler.next_task(), Task::Wait);

        assert!(!scheduler.finish_execution(1, 0, &[]));
        assert_eq!(scheduler.next_task(), Task::Execute(1, 1));
    }

    #[test]
    fn test_commit_in_order_with_validation() {
        let scheduler = Scheduler::new(3);
        for _ in 0..3 {
            let _ = scheduler.next_task();
        }

        // Transaction 1 finishes first; nothing can commit yet.
        scheduler.finish_execution(1, 0, &[]);
        assert_eq!(scheduler.try_commit(|_, _| true), 0);

        scheduler.finish_execution(0, 0, &[]);
        scheduler.finish_execution(2, 0, &[]);

        // Transaction 1 fails validation once.
        let committed = scheduler.try_commit(|idx, _| idx != 1);
        assert_eq!(committed, 1);
        assert!(scheduler.is_committed(0));
        assert_eq!(scheduler.next_task(), Task::Execute(1, 1));

        scheduler.finish_execution(1, 1, &[]);
        assert_eq!(scheduler.try_commit(|_, _| true), 2);
        assert!(scheduler.is_done());
        assert_eq!(scheduler.next_task(), Task::Done);
    }
}
