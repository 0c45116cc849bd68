//! vigil-runtime: concurrency core of the vigil monitoring agent
//!
//! Provides:
//! - Single-threaded event reactor multiplexing descriptor I/O and timers
//! - Bounded, dynamically-sized worker pool for deferred/background work
//! - Cross-thread wakeup and process-signal integration
//!
//! # Architecture
//!
//! ```text
//! collaborators (agent tree, alerters, protocol workers)
//!     |
//!     v
//! Runtime (context object: ReactorHandle + WorkerPool)
//!     |
//!     +---------------------------+
//!     v                           v
//! Reactor (handlers, timers,   WorkerPool (FIFO queue,
//!   services, wakeup)            idle-reaped threads)
//!     |
//!     v
//! Poller (poll(2) on Linux, kqueue on macOS/BSD)
//! ```
//!
//! Collaborators register three kinds of work and must not assume which
//! thread runs their callback unless they submitted it to the pool:
//! handlers (a callback when a descriptor is ready), timers (a callback
//! after an interval, optionally repeating) and tasks (a callback on a
//! worker thread).

use std::sync::atomic::{AtomicU64, Ordering};

pub mod dispatch;
pub mod error;
pub mod handler;
pub mod poller;
pub mod pool;
pub mod reactor;
pub mod runtime;
pub mod service;
pub mod signal;
pub mod timer;
pub mod wakeup;

pub use dispatch::{CallbackError, Dispatch};
pub use error::RuntimeError;
pub use handler::{HandlerId, HandlerRegistry};
pub use poller::{create_poller, EventMask, Poller, ReadyFd, WaitFd};
pub use pool::{PoolConfig, WorkerPool};
pub use reactor::{Reactor, ReactorConfig, ReactorHandle};
pub use runtime::{Runtime, RuntimeConfig};
pub use service::{Service, ServiceFns, ServiceRegistry};
pub use signal::SignalBridge;
pub use timer::{TimerId, TimerRegistry};
pub use wakeup::WakeupChannel;

/// Opaque identity of the collaborator owning a registration, used for bulk
/// removal without holding on to every individual id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Allocate a process-unique owner identity.
    pub fn next() -> OwnerId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        OwnerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}
