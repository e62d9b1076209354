//! Parallel transaction executor with optimistic concurrency control.

use crate::mvhashmap::MVHashMap;
use crate::scheduler::{Scheduler, Task};
use crate::types::{Incarnation, ReadOrigin, TxnIndex};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Committed base state the batch executes on top of.
pub trait Storage<K, V>: Sync {
    fn read(&self, key: &K) -> Option<V>;
}

/// The per-transaction logic run by the executor.
///
/// `execute` may be invoked several times for the same index; only the
/// output of the incarnation that commits is kept. All state access must go
/// through the [`TxnView`].
pub trait TransactionTask<K, V>: Sync {
    type Output: Send;

    fn execute(&self, txn_idx: TxnIndex, view: &TxnView<'_, K, V>) -> Self::Output;

    /// Output for an execution that panicked. Its writes are discarded.
    fn on_panic(&self, txn_idx: TxnIndex, message: String) -> Self::Output;
}

/// A transaction's window onto the multi-version state.
///
/// Reads see the latest write of any lower transaction, then base storage.
/// Writes are buffered and published when the execution finishes.
pub struct TxnView<'a, K, V> {
    txn_idx: TxnIndex,
    mv: &'a MVHashMap<K, V>,
    storage: &'a dyn Storage<K, V>,
    reads: RefCell<Vec<(K, ReadOrigin)>>,
    writes: RefCell<BTreeMap<K, Option<V>>>,
}

impl<'a, K, V> TxnView<'a, K, V>
where
    K: Eq + Hash + Ord + Clone,
    V: Clone,
{
    fn new(txn_idx: TxnIndex, mv: &'a MVHashMap<K, V>, storage: &'a dyn Storage<K, V>) -> Self {
        Self {
            txn_idx,
            mv,
            storage,
            reads: RefCell::new(Vec::new()),
            writes: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn txn_idx(&self) -> TxnIndex {
        self.txn_idx
    }

    pub fn read(&self, key: &K) -> Option<V> {
        if let Some(own) = self.writes.borrow().get(key) {
            return own.clone();
        }

        let result = self.mv.read(key, self.txn_idx);
        let origin = result.origin();
        self.mv.record_read(key, self.txn_idx, origin);
        self.reads.borrow_mut().push((key.clone(), origin));

        match result {
            crate::mvhashmap::ReadResult::Versioned(_, value) => value,
            crate::mvhashmap::ReadResult::Storage => self.storage.read(key),
        }
    }

    /// Buffers a write; `None` deletes the key.
    pub fn write(&self, key: K, value: Option<V>) {
        self.writes.borrow_mut().insert(key, value);
    }

    fn into_parts(self) -> (Vec<(K, ReadOrigin)>, BTreeMap<K, Option<V>>) {
        (self.reads.into_inner(), self.writes.into_inner())
    }
}

/// Configuration for parallel execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads.
    pub num_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_threads: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
        }
    }
}

/// Result of parallel batch execution.
#[derive(Debug)]
pub struct BlockExecutionResult<K, V, O> {
    /// Output of the committed incarnation of every transaction, in index order.
    pub outputs: Vec<O>,
    /// Final value of every written key, sorted by key.
    pub writes: Vec<(K, Option<V>)>,
    /// Total number of executions (including re-executions).
    pub total_executions: usize,
    pub duration: Duration,
}

struct TxnRecord<K, O> {
    incarnation: Incarnation,
    reads: Vec<(K, ReadOrigin)>,
    write_keys: BTreeSet<K>,
    output: Option<O>,
}

/// Parallel optimistic executor.
pub struct ParallelExecutor {
    config: ExecutorConfig,
}

impl ParallelExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Executes `num_txns` transactions in parallel, producing the same
    /// outputs and final writes as running them one by one in index order.
    pub fn execute_block<K, V, T>(
        &self,
        num_txns: usize,
        task: &T,
        storage: &dyn Storage<K, V>,
    ) -> BlockExecutionResult<K, V, T::Output>
    where
        K: Eq + Hash + Ord + Clone + Send + Sync,
        V: Clone + Send + Sync,
        T: TransactionTask<K, V>,
    {
        let start = Instant::now();
        let scheduler = Scheduler::new(num_txns);
        let mv = MVHashMap::new();
        let records: Vec<Mutex<Option<TxnRecord<K, T::Output>>>> =
            (0..num_txns).map(|_| Mutex::new(None)).collect();

        let num_threads = self.config.num_threads.clamp(1, num_txns.max(1));
        thread::scope(|scope| {
            for worker_id in 0..num_threads {
                let scheduler = &scheduler;
                let mv = &mv;
                let records = &records;
                scope.spawn(move || {
                    Self::worker_loop(worker_id, scheduler, mv, records, task, storage);
                });
            }
        });

        let outputs = records
            .into_iter()
            .enumerate()
            .map(|(idx, record)| {
                record
                    .into_inner()
                    .and_then(|r| r.output)
                    .unwrap_or_else(|| task.on_panic(idx, "transaction never committed".into()))
            })
            .collect();

        let duration = start.elapsed();
        let total_executions = scheduler.executions();
        debug!(
            num_txns,
            total_executions,
            elapsed_us = duration.as_micros() as u64,
            "parallel batch committed"
        );

        BlockExecutionResult {
            outputs,
            writes: mv.final_writes(),
            total_executions,
            duration,
        }
    }

    fn worker_loop<K, V, T>(
        worker_id: usize,
        scheduler: &Scheduler,
        mv: &MVHashMap<K, V>,
        records: &[Mutex<Option<TxnRecord<K, T::Output>>>],
        task: &T,
        storage: &dyn Storage<K, V>,
    ) where
        K: Eq + Hash + Ord + Clone,
        V: Clone,
        T: TransactionTask<K, V>,
    {
        let backoff = Backoff::new();
        let validate = |idx: TxnIndex, incarnation: Incarnation| {
            records[idx].lock().as_ref().is_some_and(|record| {
                record.incarnation == incarnation
                    && record
                        .reads
                        .iter()
                        .all(|(key, origin)| mv.validate_read(key, idx, *origin))
            })
        };

        loop {
            match scheduler.next_task() {
                Task::Execute(txn_idx, incarnation) => {
                    backoff.reset();
                    let view = TxnView::new(txn_idx, mv, storage);
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.execute(txn_idx, &view)));
                    let (reads, mut writes) = view.into_parts();
                    let output = match outcome {
                        Ok(output) => output,
                        Err(payload) => {
                            let message = panic_message(payload.as_ref());
                            warn!(worker_id, txn_idx, incarnation, %message, "transaction panicked");
                            writes.clear();
                            task.on_panic(txn_idx, message)
                        }
                    };

                    let write_keys: BTreeSet<K> = writes.keys().cloned().collect();
                    let mut record = records[txn_idx].lock();
                    let mut invalidated = match record.as_ref() {
                        Some(prev) => mv.remove_writes(txn_idx, prev.write_keys.difference(&write_keys)),
                        None => Vec::new(),
                    };
                    for (key, value) in writes {
                        invalidated.extend(mv.write(key, txn_idx, incarnation, value));
                    }
                    *record = Some(TxnRecord {
                        incarnation,
                        reads,
                        write_keys,
                        output: Some(output),
                    });
                    drop(record);

                    invalidated.sort_unstable();
                    invalidated.dedup();
                    scheduler.finish_execution(txn_idx, incarnation, &invalidated);
                    scheduler.try_commit(&validate);
                }
                Task::Wait => {
                    if scheduler.try_commit(&validate) == 0 {
                        backoff.snooze();
                    }
                }
                Task::Done => break,
            }
        }
    }
}

/// Renders a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
