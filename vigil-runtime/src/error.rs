use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::OwnerId;

/// Errors surfaced synchronously by the runtime API.
///
/// Callback failures never appear here: they are caught at the dispatch
/// boundary, logged, and contained to the one handler/timer/task involved.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("reactor is already running")]
    AlreadyRunning,

    #[error("descriptor {fd} is already watched by owner {owner:?}")]
    DescriptorBusy { fd: RawFd, owner: OwnerId },

    #[error("task queue is full ({depth} tasks queued)")]
    QueueFull { depth: usize },

    #[error("worker pool is stopped")]
    PoolStopped,

    #[error("timer is no longer registered")]
    StaleTimer,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
