//! kqueue-based blocking wait for macOS and BSD.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{EventMask, Poller, ReadyFd, WaitFd};

/// kqueue poller for macOS/BSD systems.
///
/// Each call submits the wait-set as an `EV_ONESHOT` changelist and collects
/// events in the same `kevent` call, so no registration state survives
/// between iterations. Entries that never fire stay registered in the kernel
/// queue; re-adding them on the next call is an idempotent modify.
pub struct KqueuePoller {
    /// The kqueue file descriptor.
    kq: RawFd,
    /// Buffer for kevent results.
    events: Vec<libc::kevent>,
}

// SAFETY: KqueuePoller is Send because:
// - kqueue file descriptors are thread-safe at the OS level
// - The kevent structs we store only use null pointers for udata
unsafe impl Send for KqueuePoller {}

impl KqueuePoller {
    /// Create a new kqueue poller.
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }

        // Set close-on-exec
        unsafe {
            let flags = libc::fcntl(kq, libc::F_GETFD);
            libc::fcntl(kq, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }

        Ok(KqueuePoller {
            kq,
            events: vec![zeroed_event(); 64],
        })
    }
}

fn zeroed_event() -> libc::kevent {
    libc::kevent {
        ident: 0,
        filter: 0,
        flags: 0,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}

impl Poller for KqueuePoller {
    fn wait(&mut self, fds: &[WaitFd], timeout: Option<Duration>) -> io::Result<Vec<ReadyFd>> {
        let mut changes = Vec::with_capacity(fds.len() * 2);
        for entry in fds {
            if entry.mask.contains(EventMask::READABLE) {
                let mut ev = zeroed_event();
                ev.ident = entry.fd as usize;
                ev.filter = libc::EVFILT_READ;
                ev.flags = libc::EV_ADD | libc::EV_ONESHOT;
                changes.push(ev);
            }
            if entry.mask.contains(EventMask::WRITABLE) {
                let mut ev = zeroed_event();
                ev.ident = entry.fd as usize;
                ev.filter = libc::EVFILT_WRITE;
                ev.flags = libc::EV_ADD | libc::EV_ONESHOT;
                changes.push(ev);
            }
        }

        if self.events.len() < changes.len() {
            self.events.resize(changes.len(), zeroed_event());
        }

        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });

        let n = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as libc::c_int,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timespec
                    .as_ref()
                    .map_or(std::ptr::null(), |ts| ts as *const libc::timespec),
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

        // Coalesce per-filter kevents into one readiness entry per fd.
        let mut ready: Vec<ReadyFd> = Vec::with_capacity(n as usize);
        for ev in &self.events[..n as usize] {
            let fd = ev.ident as RawFd;
            let mut mask = EventMask::empty();
            match ev.filter {
                libc::EVFILT_READ => mask |= EventMask::READABLE,
                libc::EVFILT_WRITE => mask |= EventMask::WRITABLE,
                _ => {}
            }
            if ev.flags & libc::EV_EOF != 0 {
                mask |= EventMask::HANGUP;
            }
            if ev.flags & libc::EV_ERROR != 0 {
                mask |= EventMask::ERROR;
            }
            if let Some(existing) = ready.iter_mut().find(|r| r.fd == fd) {
                existing.mask |= mask;
            } else {
                ready.push(ReadyFd { fd, mask });
            }
        }

        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poller_creation() {
        let poller = KqueuePoller::new().expect("Failed to create poller");
        drop(poller);
    }

    #[test]
    fn test_pipe_read_readiness() {
        let mut poller = KqueuePoller::new().expect("Failed to create poller");

        let mut fds = [0i32; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let wait_set = [WaitFd {
            fd: read_fd,
            mask: EventMask::READABLE,
        }];

        unsafe {
            libc::write(write_fd, b"hello".as_ptr() as *const _, 5);
        }

        let ready = poller
            .wait(&wait_set, Some(Duration::from_millis(100)))
            .expect("Wait failed");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd, read_fd);
        assert!(ready[0].mask.contains(EventMask::READABLE));

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
