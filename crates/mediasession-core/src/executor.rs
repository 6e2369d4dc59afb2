//! Single-threaded FIFO executor, one per session.
//!
//! Tasks posted from any thread run one at a time, in posting order, on a
//! dedicated named thread. Posting before the run loop is up blocks the
//! caller until the loop signals readiness; the readiness flag is only read
//! and written under its lock, so a `post` racing the startup signal cannot
//! miss the wakeup.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::sync::lock;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct Lifecycle {
    /// Run loop is receiving tasks.
    ready: bool,
    /// `quit` was called; no new tasks are accepted.
    quit: bool,
    /// Run loop thread has exited (or died before becoming ready).
    stopped: bool,
}

struct Shared {
    name: String,
    lifecycle: Mutex<Lifecycle>,
    ready_cv: Condvar,
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
}

impl Shared {
    fn close(&self) {
        lock(&self.tx).take();
    }
}

/// Cloneable handle to a serial run loop.
#[derive(Clone)]
pub struct SerialExecutor {
    shared: Arc<Shared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("name", &self.shared.name)
            .field("lifecycle", &*lock(&self.shared.lifecycle))
            .finish()
    }
}

/// Marks the executor stopped when the run loop thread exits, including by
/// panic before it ever became ready.
struct StopGuard(Weak<Shared>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.0.upgrade() {
            let mut lifecycle = lock(&shared.lifecycle);
            lifecycle.stopped = true;
            shared.ready_cv.notify_all();
        }
    }
}

impl SerialExecutor {
    /// Start a run loop on a new thread called `name`.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let shared = Arc::new(Shared {
            name: name.into(),
            lifecycle: Mutex::new(Lifecycle::default()),
            ready_cv: Condvar::new(),
            tx: Mutex::new(Some(tx)),
        });

        let weak = Arc::downgrade(&shared);
        let handle = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || run_loop(weak, rx))?;

        Ok(Self {
            shared,
            thread: Arc::new(Mutex::new(Some(handle))),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueue `task`. Returns `false` when the task was not posted: the
    /// executor has quit, or its thread died before becoming ready.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut lifecycle = lock(&self.shared.lifecycle);
            while !lifecycle.ready && !lifecycle.stopped {
                lifecycle = self
                    .shared
                    .ready_cv
                    .wait(lifecycle)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
            if lifecycle.stopped || lifecycle.quit {
                debug!(executor = %self.shared.name, "executor not accepting tasks");
                return false;
            }
        }

        match lock(&self.shared.tx).as_ref() {
            Some(tx) => tx.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Stop accepting tasks. Already queued tasks still run, then the loop
    /// exits. Safe to call repeatedly and before the loop is ready.
    pub fn quit(&self) {
        let mut lifecycle = lock(&self.shared.lifecycle);
        if lifecycle.quit {
            return;
        }
        lifecycle.quit = true;
        debug!(executor = %self.shared.name, ready = lifecycle.ready, "executor quit requested");
        // Dropping the sender lets the loop drain what is queued and stop.
        self.shared.close();
    }

    pub fn is_running(&self) -> bool {
        let lifecycle = lock(&self.shared.lifecycle);
        lifecycle.ready && !lifecycle.quit && !lifecycle.stopped
    }

    /// Whether the caller is running on this executor's thread.
    pub fn is_current(&self) -> bool {
        lock(&self.thread)
            .as_ref()
            .map(|handle| handle.thread().id() == thread::current().id())
            .unwrap_or(false)
    }

    /// Block until the run loop thread exits. Returns immediately when
    /// called from the executor thread itself or after a previous join.
    pub fn join(&self) {
        if self.is_current() {
            return;
        }
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(executor = %self.shared.name, "executor thread panicked");
            }
        }
    }
}

fn run_loop(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<Task>) {
    let _guard = StopGuard(shared.clone());

    let name = match shared.upgrade() {
        Some(shared) => {
            let mut lifecycle = lock(&shared.lifecycle);
            lifecycle.ready = true;
            if lifecycle.quit {
                shared.close();
            }
            shared.ready_cv.notify_all();
            shared.name.clone()
        }
        None => return,
    };
    debug!(executor = %name, "executor ready");

    while let Some(task) = rx.blocking_recv() {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(executor = %name, "task panicked; continuing with next task");
        }
    }

    debug!(executor = %name, "executor stopped");
}
