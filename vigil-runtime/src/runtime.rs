//! The runtime context object.
//!
//! One `Runtime` per process (or per test) wires a reactor to a worker
//! pool. Collaborators receive a [`ReactorHandle`] and a [`WorkerPool`]
//! clone instead of reaching for globals, so independent instances can
//! coexist.

use std::io;
use std::time::Duration;

use crate::dispatch::CallbackError;
use crate::error::RuntimeError;
use crate::pool::{PoolConfig, WorkerPool};
use crate::reactor::{Reactor, ReactorConfig, ReactorHandle};
use crate::service::{Service, ServiceFns};

/// Combined configuration for a [`Runtime`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub reactor: ReactorConfig,
    pub pool: PoolConfig,
}

/// A reactor paired with a worker pool.
pub struct Runtime {
    reactor: Reactor,
    pool: WorkerPool,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Ok(Runtime {
            reactor: Reactor::new(config.reactor)?,
            pool: WorkerPool::new(config.pool),
        })
    }

    /// Cross-thread surface for handler/timer registration, wakeup and quit.
    pub fn handle(&self) -> ReactorHandle {
        self.reactor.handle()
    }

    /// The pool executing deferred and background work.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Register a lifecycle participant before `run`.
    pub fn register_service(&mut self, service: Box<dyn Service>) {
        self.reactor.register_service(service);
    }

    /// Register a lifecycle participant from a start/stop closure pair.
    pub fn register_service_fns<S, T>(&mut self, name: &str, start: S, stop: T)
    where
        S: FnMut() -> Result<(), CallbackError> + Send + 'static,
        T: FnMut() -> Result<(), CallbackError> + Send + 'static,
    {
        self.reactor
            .register_service(Box::new(ServiceFns::new(name, start, stop)));
    }

    /// Map termination signals to `quit` and the reload signal to a task
    /// submission running `reload` on the pool.
    pub fn install_signal_handlers<F>(&mut self, reload: F) -> io::Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let pool = self.pool.clone();
        self.reactor.enable_signals(&pool, reload)
    }

    /// Queue background work; returns the queue depth after insertion.
    pub fn submit_task<F>(&self, name: &str, task: F) -> Result<usize, RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.submit(name, task)
    }

    /// Block until the pool drains or the timeout elapses; returns whether
    /// work is still pending.
    pub fn pool_wait(&self, timeout: Duration) -> bool {
        self.pool.wait(timeout)
    }

    /// Run the reactor on the calling thread, then stop the pool once the
    /// loop exits. Returns when `quit` is observed or a wait error is fatal.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        let result = self.reactor.run();
        self.pool.stop();
        result
    }

    /// Ask the reactor to stop.
    pub fn quit(&self) {
        self.reactor.handle().quit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Dispatch, OwnerId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_independent_runtimes_coexist() {
        let mut a = Runtime::new(RuntimeConfig::default()).unwrap();
        let mut b = Runtime::new(RuntimeConfig::default()).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        for runtime in [&mut a, &mut b] {
            let counter = Arc::clone(&fired);
            let handle = runtime.handle();
            handle.register_timer(OwnerId::next(), Duration::ZERO, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Dispatch::Continue)
            });
        }

        let ha = a.handle();
        let hb = b.handle();
        let ta = thread::spawn(move || a.run());
        let tb = thread::spawn(move || b.run());
        thread::sleep(Duration::from_millis(100));
        ha.quit();
        hb.quit();
        ta.join().unwrap().unwrap();
        tb.join().unwrap().unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_stops_pool_on_exit() {
        let mut runtime = Runtime::new(RuntimeConfig::default()).unwrap();
        let handle = runtime.handle();
        handle.register_timer(OwnerId::next(), Duration::ZERO, {
            let handle = handle.clone();
            move || {
                handle.quit();
                Ok(Dispatch::Continue)
            }
        });

        runtime.run().unwrap();
        assert!(matches!(
            runtime.submit_task("late", || {}),
            Err(RuntimeError::PoolStopped)
        ));
    }
}
