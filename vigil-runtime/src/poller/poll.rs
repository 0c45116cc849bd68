//! poll(2)-based blocking wait for Linux.

use std::io;
use std::time::Duration;

use super::{EventMask, Poller, ReadyFd, WaitFd};

/// poll(2) poller.
///
/// The pollfd array is rebuilt from the caller's wait-set on every call and
/// reused across iterations to avoid reallocating.
pub struct PollPoller {
    /// Reusable buffer for the pollfd array.
    fds: Vec<libc::pollfd>,
}

impl PollPoller {
    /// Create a new poll(2) poller.
    pub fn new() -> io::Result<Self> {
        Ok(PollPoller {
            fds: Vec::with_capacity(64),
        })
    }

    fn interest_to_events(mask: EventMask) -> libc::c_short {
        let mut events = 0;
        if mask.contains(EventMask::READABLE) {
            events |= libc::POLLIN;
        }
        if mask.contains(EventMask::WRITABLE) {
            events |= libc::POLLOUT;
        }
        // POLLERR and POLLHUP are output-only conditions for poll(2).
        events
    }

    fn events_to_mask(revents: libc::c_short) -> EventMask {
        let mut mask = EventMask::empty();
        if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
            mask |= EventMask::READABLE;
        }
        if revents & libc::POLLOUT != 0 {
            mask |= EventMask::WRITABLE;
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            mask |= EventMask::ERROR;
        }
        if revents & libc::POLLHUP != 0 {
            mask |= EventMask::HANGUP;
        }
        mask
    }
}

impl Poller for PollPoller {
    fn wait(&mut self, fds: &[WaitFd], timeout: Option<Duration>) -> io::Result<Vec<ReadyFd>> {
        self.fds.clear();
        for entry in fds {
            self.fds.push(libc::pollfd {
                fd: entry.fd,
                events: Self::interest_to_events(entry.mask),
                revents: 0,
            });
        }

        // Round the budget up; truncating a sub-millisecond wait to zero
        // would turn the blocking call into a spin.
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d
                .as_nanos()
                .div_ceil(1_000_000)
                .min(libc::c_int::MAX as u128) as libc::c_int,
        };

        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            // EINTR is not an error, just no events
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut ready = Vec::with_capacity(n as usize);
        for pfd in &self.fds {
            if pfd.revents != 0 {
                ready.push(ReadyFd {
                    fd: pfd.fd,
                    mask: Self::events_to_mask(pfd.revents),
                });
            }
        }

        Ok(ready)
    }
}
