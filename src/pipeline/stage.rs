//! Stage lifecycle and cancellation shared by every pipeline stage.

use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// How often a blocked worker re-checks its cancellation token.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    NotStarted,
    Running,
    Stopped,
}

/// Cooperative cancellation. A child token is cancelled when its parent is.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            parent: Some(self.cancelled.clone()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.load(Ordering::SeqCst))
    }
}

/// Blocks until `item` is accepted. Returns false if cancelled first or
/// the channel is gone.
pub(crate) fn send<T>(sender: &Sender<T>, mut item: T, cancel: &CancelToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        match sender.send_timeout(item, POLL_INTERVAL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => item = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Blocks until an item arrives. Returns `None` once cancelled.
pub(crate) fn recv<T>(receiver: &Receiver<T>, cancel: &CancelToken) -> Option<T> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(item) => return Some(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// A named group of worker threads with a `NotStarted -> Running ->
/// Stopped` lifecycle. Both transitions are idempotent.
pub struct Stage {
    name: &'static str,
    state: Mutex<StageState>,
    cancel: CancelToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Stage {
    pub fn new(name: &'static str, parent: &CancelToken) -> Self {
        Self {
            name,
            state: Mutex::new(StageState::NotStarted),
            cancel: parent.child(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> StageState {
        *self.state.lock()
    }

    /// Spawns `workers` threads running the worker `make` returns for each
    /// worker id. Does nothing unless the stage has never been started.
    pub fn start<F, W>(&self, workers: usize, mut make: F) -> std::io::Result<bool>
    where
        F: FnMut(usize) -> W,
        W: FnOnce(CancelToken) + Send + 'static,
    {
        let mut state = self.state.lock();
        if *state != StageState::NotStarted {
            return Ok(false);
        }

        let mut handles = self.handles.lock();
        for id in 0..workers {
            let worker = make(id);
            let cancel = self.cancel.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{id}", self.name))
                .spawn(move || worker(cancel));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Tear down the workers already running.
                    self.cancel.cancel();
                    for handle in handles.drain(..) {
                        let _ = handle.join();
                    }
                    *state = StageState::Stopped;
                    return Err(err);
                }
            }
        }
        *state = StageState::Running;
        debug!(stage = self.name, workers, "stage started");
        Ok(true)
    }

    /// Cancels the stage and waits for its workers to exit.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if *state == StageState::Stopped {
            return;
        }
        self.cancel.cancel();
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                error!(stage = self.name, "stage worker panicked");
            }
        }
        *state = StageState::Stopped;
        debug!(stage = self.name, "stage stopped");
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_child_token_follows_parent() {
        let root = CancelToken::new();
        let child = root.child();
        assert!(!child.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());

        let other = CancelToken::new().child();
        other.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let root = CancelToken::new();
        let stage = Stage::new("test", &root);
        let started = Arc::new(AtomicUsize::new(0));

        let counter = started.clone();
        let run = |_| {
            let counter = counter.clone();
            move |cancel: CancelToken| {
                counter.fetch_add(1, Ordering::SeqCst);
                while !cancel.is_cancelled() {
                    thread::sleep(POLL_INTERVAL);
                }
            }
        };
        assert!(stage.start(3, run).expect("spawns"));
        assert!(!stage.start(3, |_| |_: CancelToken| {}).expect("no-op"));
        assert_eq!(stage.state(), StageState::Running);

        stage.stop();
        stage.stop();
        assert_eq!(stage.state(), StageState::Stopped);
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_blocked_send_observes_cancellation() {
        let (sender, _receiver) = bounded(1);
        let cancel = CancelToken::new();
        assert!(send(&sender, 1, &cancel));

        let blocked = {
            let cancel = cancel.clone();
            thread::spawn(move || send(&sender, 2, &cancel))
        };
        thread::sleep(POLL_INTERVAL * 3);
        cancel.cancel();
        assert!(!blocked.join().expect("joins"));
    }
}
