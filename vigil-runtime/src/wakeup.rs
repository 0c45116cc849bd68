//! Cross-thread wakeup channel for interrupting the blocking wait.
//!
//! A non-blocking self-pipe: any thread (or a signal handler) writes one
//! byte to make the read end poll readable; the reactor drains it once per
//! iteration. Bursts coalesce naturally because a full pipe means a wakeup
//! is already pending.

use std::io;
use std::os::unix::io::RawFd;

/// Self-pipe wakeup primitive.
///
/// `signal()` is async-signal-safe and never blocks; `drain()` is called by
/// the reactor after the wait call returns.
pub struct WakeupChannel {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakeupChannel {
    /// Create a new wakeup channel with both pipe ends non-blocking.
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];

        #[cfg(target_os = "linux")]
        {
            let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
            for fd in fds {
                unsafe {
                    let flags = libc::fcntl(fd, libc::F_GETFL);
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
                }
            }
        }

        Ok(WakeupChannel {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// The descriptor the reactor includes in every wait-set.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// The write end, for wiring signal handlers directly onto the pipe.
    pub(crate) fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Interrupt a blocked wait call.
    ///
    /// Safe to call from any thread and from signal context. A failed write
    /// (pipe full) means an undrained wakeup is already pending, which is
    /// all the caller needed.
    pub fn signal(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(self.write_fd, &byte as *const u8 as *const _, 1);
        }
    }

    /// Reset the channel after the wait call returned.
    ///
    /// Reads until the pipe is empty so past signals cannot busy-loop the
    /// reactor and future signals are not lost.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakeupChannel {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{create_poller, EventMask, Poller, WaitFd};
    use std::time::Duration;

    fn is_readable(channel: &WakeupChannel) -> bool {
        let mut poller = create_poller().expect("Failed to create poller");
        let ready = poller
            .wait(
                &[WaitFd {
                    fd: channel.read_fd(),
                    mask: EventMask::READABLE,
                }],
                Some(Duration::from_millis(50)),
            )
            .expect("Wait failed");
        !ready.is_empty()
    }

    #[test]
    fn test_signal_makes_read_end_ready() {
        let channel = WakeupChannel::new().expect("Failed to create channel");
        assert!(!is_readable(&channel));
        channel.signal();
        assert!(is_readable(&channel));
    }

    #[test]
    fn test_drain_resets_channel() {
        let channel = WakeupChannel::new().expect("Failed to create channel");
        channel.signal();
        channel.signal();
        channel.signal();
        channel.drain();
        assert!(!is_readable(&channel));
    }

    #[test]
    fn test_burst_signals_coalesce() {
        let channel = WakeupChannel::new().expect("Failed to create channel");
        // Far more signals than the pipe buffer holds; none may block.
        for _ in 0..100_000 {
            channel.signal();
        }
        channel.drain();
        assert!(!is_readable(&channel));
        channel.signal();
        assert!(is_readable(&channel));
    }
}
