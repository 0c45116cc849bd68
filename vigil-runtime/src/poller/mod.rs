//! Platform blocking wait - multiplexes descriptor readiness.
//!
//! Platform-specific implementations:
//! - Linux: poll(2)
//! - macOS/BSD: kqueue
//!
//! The reactor rebuilds the wait-set from a registry snapshot on every
//! iteration, so backends take the full descriptor list per call instead of
//! keeping registration state of their own.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use bitflags::bitflags;

#[cfg(target_os = "linux")]
mod poll;
#[cfg(target_os = "linux")]
pub use poll::PollPoller as PlatformPoller;

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
mod kqueue;
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
pub use kqueue::KqueuePoller as PlatformPoller;

bitflags! {
    /// Interest/readiness mask for a watched descriptor.
    ///
    /// `ERROR` and `HANGUP` are always reported when they occur, whether or
    /// not they were part of the registered interest.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const ERROR    = 0b0100;
        const HANGUP   = 0b1000;
    }
}

/// One entry of the wait-set built for a single blocking call.
#[derive(Debug, Clone, Copy)]
pub struct WaitFd {
    pub fd: RawFd,
    pub mask: EventMask,
}

/// A descriptor reported ready, with the conditions that triggered.
#[derive(Debug, Clone, Copy)]
pub struct ReadyFd {
    pub fd: RawFd,
    pub mask: EventMask,
}

/// Trait for the platform-specific blocking wait.
pub trait Poller: Send {
    /// Block until at least one descriptor is ready or the timeout elapses.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` polls without
    /// blocking. Interruption by a signal is not an error and returns an
    /// empty ready-set, as does a timeout.
    fn wait(&mut self, fds: &[WaitFd], timeout: Option<Duration>) -> io::Result<Vec<ReadyFd>>;
}

/// Create a new platform-specific poller.
pub fn create_poller() -> io::Result<PlatformPoller> {
    PlatformPoller::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_bits_are_distinct() {
        let all = EventMask::READABLE | EventMask::WRITABLE | EventMask::ERROR | EventMask::HANGUP;
        assert_eq!(all.bits().count_ones(), 4);
    }

    #[test]
    fn test_mask_intersection() {
        let interest = EventMask::READABLE | EventMask::HANGUP;
        assert!(interest.intersects(EventMask::READABLE));
        assert!(!interest.intersects(EventMask::WRITABLE));
    }
}
