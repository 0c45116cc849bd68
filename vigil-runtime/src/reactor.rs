//! The reactor - a single-threaded loop multiplexing I/O and timers.
//!
//! One blocking wait call per iteration. Other threads mutate the handler
//! and timer registries freely while the reactor is blocked; every mutation
//! signals the wakeup channel so it takes effect on the next iteration, and
//! the snapshot taken per iteration keeps the in-flight wait-set immutable.
//!
//! ```text
//! while enabled:
//!     collect due timers, compute wait budget
//!     purge tombstoned handlers
//!     snapshot handlers -> wait-set (+ wakeup descriptor)
//!     block in the platform wait
//!     drain wakeup, fold in signal flags
//!     dispatch ready handlers, then due timers
//! ```

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::dispatch::{hold, invoke_guarded, CallbackError, Dispatch};
use crate::error::RuntimeError;
use crate::handler::{HandlerId, HandlerRegistry};
use crate::poller::{create_poller, EventMask, PlatformPoller, Poller, WaitFd};
use crate::pool::WorkerPool;
use crate::service::{Service, ServiceRegistry};
use crate::signal::SignalBridge;
use crate::timer::{DueTimer, TimerId, TimerRegistry};
use crate::wakeup::WakeupChannel;
use crate::OwnerId;

/// Reactor tuning knobs.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Ceiling on one blocking wait, so the loop periodically re-evaluates
    /// newly added work even with no timers pending.
    pub max_wait: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            max_wait: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Running,
    Stopping,
}

/// State shared between the reactor thread and its handles.
struct ReactorShared {
    handlers: HandlerRegistry,
    timers: TimerRegistry,
    wakeup: WakeupChannel,
    enabled: AtomicBool,
    state: Mutex<RunState>,
}

struct SignalSetup {
    bridge: SignalBridge,
    pool: WorkerPool,
    reload: Arc<dyn Fn() + Send + Sync>,
}

/// The event reactor.
///
/// Owns the platform poller and the service registry; everything else lives
/// in shared state reachable from [`ReactorHandle`] clones on any thread.
pub struct Reactor {
    shared: Arc<ReactorShared>,
    poller: PlatformPoller,
    services: ServiceRegistry,
    signals: Option<SignalSetup>,
    config: ReactorConfig,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Result<Self, RuntimeError> {
        Ok(Reactor {
            shared: Arc::new(ReactorShared {
                handlers: HandlerRegistry::new(),
                timers: TimerRegistry::new(),
                wakeup: WakeupChannel::new()?,
                enabled: AtomicBool::new(false),
                state: Mutex::new(RunState::Stopped),
            }),
            poller: create_poller()?,
            services: ServiceRegistry::new(),
            signals: None,
            config,
        })
    }

    /// A cloneable cross-thread surface for registrations, wakeup and quit.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register a lifecycle participant. Must happen before `run`.
    pub fn register_service(&mut self, service: Box<dyn Service>) {
        self.services.register(service);
    }

    /// Drop a lifecycle participant by name before `run`.
    pub fn unregister_service(&mut self, name: &str) -> bool {
        self.services.unregister(name)
    }

    /// Map process signals onto the reactor: termination signals quit the
    /// loop, a reload signal submits `reload` to `pool`. Handlers installed
    /// here never run user logic in signal context.
    pub fn enable_signals<F>(&mut self, pool: &WorkerPool, reload: F) -> io::Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let bridge = SignalBridge::install(&self.shared.wakeup)?;
        self.signals = Some(SignalSetup {
            bridge,
            pool: pool.clone(),
            reload: Arc::new(reload),
        });
        Ok(())
    }

    /// Run the loop on the calling thread until `quit` or a fatal wait
    /// error. Valid only while stopped; terminal reentry is allowed.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        {
            let mut state = hold(&self.shared.state);
            if *state != RunState::Stopped {
                return Err(RuntimeError::AlreadyRunning);
            }
            // Arm the loop and clear leftover wakeups before publishing
            // Running: a quit issued by any thread that has observed
            // Running must neither be overwritten by this store nor have
            // its wakeup byte swallowed by this drain.
            self.shared.enabled.store(true, Ordering::Release);
            self.shared.wakeup.drain();
            *state = RunState::Running;
        }

        self.services.start_all();
        log::info!("reactor running");

        let result = self.run_loop();

        *hold(&self.shared.state) = RunState::Stopping;
        self.services.stop_all();
        *hold(&self.shared.state) = RunState::Stopped;
        log::info!("reactor stopped");
        result
    }

    fn run_loop(&mut self) -> Result<(), RuntimeError> {
        while self.shared.enabled.load(Ordering::Acquire) {
            let now = Instant::now();
            let (budget, due) = self
                .shared
                .timers
                .compute_next_wait(now, self.config.max_wait);

            self.shared.handlers.purge();
            let snapshot = self.shared.handlers.snapshot();

            let wakeup_fd = self.shared.wakeup.read_fd();
            let mut wait_set = Vec::with_capacity(snapshot.len() + 1);
            wait_set.push(WaitFd {
                fd: wakeup_fd,
                mask: EventMask::READABLE,
            });
            wait_set.extend(
                snapshot
                    .iter()
                    .map(|(_, fd, mask)| WaitFd { fd: *fd, mask: *mask }),
            );

            // A signal interruption surfaces as an empty ready-set and
            // simply starts the next iteration.
            let ready = match self.poller.wait(&wait_set, Some(budget)) {
                Ok(ready) => ready,
                Err(e) => {
                    log::error!("blocking wait failed: {e}");
                    self.shared.enabled.store(false, Ordering::Release);
                    return Err(e.into());
                }
            };

            if ready.iter().any(|r| r.fd == wakeup_fd) {
                self.shared.wakeup.drain();
            }
            self.process_signals();

            // Registration order among the descriptors reported ready. The
            // wait-set carries one entry per handler, so a descriptor shared
            // by disjoint-mask handlers can surface as several ready entries;
            // each handler is matched against the union and its own mask
            // filter picks out the conditions it watches.
            for (id, fd, _) in &snapshot {
                let triggered = ready
                    .iter()
                    .filter(|r| r.fd == *fd)
                    .fold(EventMask::empty(), |acc, r| acc | r.mask);
                if !triggered.is_empty() {
                    self.dispatch_handler(*id, *fd, triggered);
                }
            }

            self.dispatch_timers(due);
        }
        Ok(())
    }

    fn dispatch_handler(&self, id: HandlerId, fd: RawFd, triggered: EventMask) {
        // A miss means the handler was removed between snapshot and
        // dispatch; the event is dropped.
        let Some((owner, callback)) = self.shared.handlers.lookup(id, triggered) else {
            return;
        };
        let who = HandlerName { fd, owner };
        let verdict = invoke_guarded("handler", &who, || {
            let mut guard = hold(&callback);
            (guard.as_mut())(fd, triggered)
        });
        if !verdict.is_continue() {
            self.shared.handlers.remove(id);
        }
    }

    fn dispatch_timers(&self, due: Vec<DueTimer>) {
        for timer in due {
            // Cancellation between collection and dispatch wins.
            if !timer.one_shot && !self.shared.timers.contains(timer.id) {
                continue;
            }
            let who = TimerName { owner: timer.owner };
            let verdict = invoke_guarded("timer", &who, || {
                let mut guard = hold(&timer.callback);
                (guard.as_mut())()
            });
            if !timer.one_shot && !verdict.is_continue() {
                self.shared.timers.remove(timer.id);
            }
        }
    }

    fn process_signals(&self) {
        let Some(setup) = &self.signals else {
            return;
        };
        if setup.bridge.take_termination() {
            log::info!("termination signal received, shutting down");
            self.shared.enabled.store(false, Ordering::Release);
        }
        if setup.bridge.take_reload() {
            log::info!("reload signal received");
            let action = Arc::clone(&setup.reload);
            if let Err(e) = setup.pool.submit("reload", move || action()) {
                log::error!("failed to queue reload task: {e}");
            }
        }
    }
}

/// Cloneable cross-thread surface of a [`Reactor`].
///
/// Registrations made while the reactor is blocked in its wait call signal
/// the wakeup channel and take effect on the next iteration.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<ReactorShared>,
}

impl ReactorHandle {
    /// Watch `fd` for the conditions in `mask`.
    pub fn register_handler<F>(
        &self,
        owner: OwnerId,
        fd: RawFd,
        mask: EventMask,
        callback: F,
    ) -> Result<HandlerId, RuntimeError>
    where
        F: FnMut(RawFd, EventMask) -> Result<Dispatch, CallbackError> + Send + 'static,
    {
        let id = self.shared.handlers.add(owner, fd, mask, callback)?;
        self.shared.wakeup.signal();
        Ok(id)
    }

    /// Stop watching a handler. Takes effect no later than the next
    /// iteration boundary.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let removed = self.shared.handlers.remove(id);
        if removed {
            self.shared.wakeup.signal();
        }
        removed
    }

    /// Remove every handler registered by `owner`.
    pub fn remove_handlers_of(&self, owner: OwnerId) -> usize {
        let removed = self.shared.handlers.remove_owner(owner);
        if removed > 0 {
            self.shared.wakeup.signal();
        }
        removed
    }

    /// Schedule a callback every `interval`; zero means one-shot, due
    /// immediately.
    pub fn register_timer<F>(&self, owner: OwnerId, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut() -> Result<Dispatch, CallbackError> + Send + 'static,
    {
        let id = self.shared.timers.add(owner, interval, callback);
        self.shared.wakeup.signal();
        id
    }

    /// Remove a timer. A stale id is a no-op returning false.
    pub fn remove_timer(&self, id: TimerId) -> bool {
        self.shared.timers.remove(id)
    }

    /// Remove every timer registered by `owner`.
    pub fn remove_timers_of(&self, owner: OwnerId) -> usize {
        self.shared.timers.remove_owner(owner)
    }

    /// Restart a timer's countdown with a new interval.
    pub fn reset_timer(&self, id: TimerId, interval: Duration) -> Result<(), RuntimeError> {
        self.shared.timers.reset(id, interval)?;
        self.shared.wakeup.signal();
        Ok(())
    }

    /// Force an immediate reactor iteration.
    pub fn wakeup(&self) {
        self.shared.wakeup.signal();
    }

    /// Ask the reactor to stop. Idempotent, valid from any state and any
    /// thread; checked once per iteration and made prompt by the wakeup.
    pub fn quit(&self) {
        self.shared.enabled.store(false, Ordering::Release);
        self.shared.wakeup.signal();
    }

    pub fn is_running(&self) -> bool {
        *hold(&self.shared.state) == RunState::Running
    }
}

struct HandlerName {
    fd: RawFd,
    owner: OwnerId,
}

impl fmt::Display for HandlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "for fd {} ({:?})", self.fd, self.owner)
    }
}

struct TimerName {
    owner: OwnerId,
}

impl fmt::Display for TimerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "of {:?}", self.owner)
    }
}
