//! Bounded, dynamically-sized worker pool.
//!
//! Workers are spawned on demand up to a ceiling, execute queued tasks in
//! FIFO order, and exit after sitting idle for the configured timeout, so
//! the pool shrinks back toward zero threads when load passes. Submission
//! never blocks: a full queue is surfaced synchronously as an error and the
//! caller decides its retry/drop policy.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::dispatch::hold;
use crate::error::RuntimeError;

/// Worker pool tuning knobs. Defaults are policy, not architecture; embedders
/// override what they need.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Ceiling on concurrently running worker threads.
    pub max_threads: usize,
    /// Queue capacity; 0 means unbounded.
    pub max_tasks: usize,
    /// How long an idle worker lingers before exiting.
    pub idle_timeout: Duration,
    /// Upper bound on waiting for workers to quiesce in `stop`.
    pub stop_timeout: Duration,
    /// Granularity of the bounded polling in `wait` and `stop`.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_threads: thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(4)
                .min(8),
            max_tasks: 0,
            idle_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

struct QueuedTask {
    name: String,
    run: Box<dyn FnOnce() + Send>,
}

struct PoolState {
    queue: VecDeque<QueuedTask>,
    /// Workers alive (running a task, draining, or idle-waiting).
    active: usize,
    /// Workers blocked in the idle wait.
    waiting: usize,
    /// Current thread ceiling; dropped to zero by `stop`.
    max_threads: usize,
    stopping: bool,
    /// Total workers ever spawned, for thread naming.
    spawned: u64,
}

struct PoolInner {
    state: Mutex<PoolState>,
    idle: Condvar,
    idle_timeout: Duration,
}

/// Bounded FIFO task pool with idle-timeout thread reaping.
///
/// Clones share one pool; they are handed to collaborators that need to
/// push work off the reactor thread.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        WorkerPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    active: 0,
                    waiting: 0,
                    max_threads: config.max_threads,
                    stopping: false,
                    spawned: 0,
                }),
                idle: Condvar::new(),
                idle_timeout: config.idle_timeout,
            }),
            config,
        }
    }

    /// Queue a task for execution on a worker thread.
    ///
    /// Returns the queue depth after insertion. Spawns a worker only when
    /// none is idle; otherwise exactly one idle worker is woken, so burst
    /// submissions neither stampede sleepers nor overshoot the ceiling.
    pub fn submit<F>(&self, name: &str, task: F) -> Result<usize, RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = hold(&self.inner.state);
        if state.stopping {
            return Err(RuntimeError::PoolStopped);
        }
        if self.config.max_tasks != 0 && state.queue.len() >= self.config.max_tasks {
            return Err(RuntimeError::QueueFull {
                depth: state.queue.len(),
            });
        }

        state.queue.push_back(QueuedTask {
            name: name.to_owned(),
            run: Box::new(task),
        });
        let depth = state.queue.len();

        if state.waiting > 0 {
            self.inner.idle.notify_one();
        } else if state.active < state.max_threads {
            state.active += 1;
            state.spawned += 1;
            let thread_name = format!("vigil-worker-{}", state.spawned);
            let inner = Arc::clone(&self.inner);
            drop(state);
            if let Err(e) = thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker_loop(inner))
            {
                log::error!("failed to spawn worker thread: {e}");
                hold(&self.inner.state).active -= 1;
            }
        }

        Ok(depth)
    }

    /// Block until the pool is drained or the timeout elapses.
    ///
    /// Returns whether work (queued or executing) is still pending.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = {
                let state = hold(&self.inner.state);
                !state.queue.is_empty() || state.active > state.waiting
            };
            if !pending {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    /// Shut the pool down.
    ///
    /// Freezes the thread ceiling at zero, wakes every idle worker, then
    /// waits (bounded) for the active count to reach zero. Tasks still
    /// queued when the workers are gone are discarded; threads still busy
    /// past the bound are logged and left to finish on their own.
    pub fn stop(&self) {
        {
            let mut state = hold(&self.inner.state);
            state.stopping = true;
            state.max_threads = 0;
            self.inner.idle.notify_all();
        }

        let deadline = Instant::now() + self.config.stop_timeout;
        loop {
            let active = hold(&self.inner.state).active;
            if active == 0 {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!("worker pool stop timed out, {active} threads still busy");
                break;
            }
            thread::sleep(self.config.poll_interval);
        }

        let discarded = {
            let mut state = hold(&self.inner.state);
            state.queue.drain(..).count()
        };
        if discarded > 0 {
            log::warn!("discarding {discarded} queued tasks at pool stop");
        }
        log::debug!("worker pool stopped");
    }

    /// Tasks currently queued (not yet picked up by a worker).
    pub fn queued(&self) -> usize {
        hold(&self.inner.state).queue.len()
    }

    /// Worker threads currently alive.
    pub fn active_workers(&self) -> usize {
        hold(&self.inner.state).active
    }

    /// Worker threads blocked in the idle wait.
    pub fn idle_workers(&self) -> usize {
        hold(&self.inner.state).waiting
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    log::debug!("worker thread started");
    let mut state = hold(&inner.state);
    'run: loop {
        // Drain the queue; tasks run with no lock held.
        loop {
            if state.stopping {
                break 'run;
            }
            let Some(task) = state.queue.pop_front() else {
                break;
            };
            drop(state);
            run_task(task);
            state = hold(&inner.state);
        }

        if state.active > state.max_threads {
            break;
        }

        state.waiting += 1;
        let (guard, wait) = inner
            .idle
            .wait_timeout(state, inner.idle_timeout)
            .unwrap_or_else(|e| e.into_inner());
        state = guard;
        state.waiting -= 1;

        if state.stopping {
            break;
        }
        // Idle timeout with nothing to do: this worker reaps itself.
        if wait.timed_out() && state.queue.is_empty() {
            break;
        }
    }
    state.active -= 1;
    drop(state);
    log::debug!("worker thread exiting");
}

fn run_task(task: QueuedTask) {
    let name = task.name;
    match panic::catch_unwind(AssertUnwindSafe(task.run)) {
        Ok(()) => log::debug!("task '{name}' completed"),
        Err(payload) => {
            log::error!(
                "task '{name}' panicked: {}",
                crate::dispatch::panic_message(&payload)
            );
        }
    }
}
