//! Process-signal integration.
//!
//! Termination signals (SIGTERM, SIGINT) and the reload signal (SIGHUP)
//! only flip an atomic flag and write the reactor's wakeup pipe from signal
//! context; the reactor picks the flags up on its next iteration and maps
//! them to `quit()` or a reload task submission. No user logic ever runs
//! inside a signal handler.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::{flag, low_level};

use crate::wakeup::WakeupChannel;

/// Installed signal handlers and the flags they raise.
pub struct SignalBridge {
    term: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    ids: Vec<signal_hook::SigId>,
}

impl SignalBridge {
    /// Install handlers for SIGTERM/SIGINT (terminate) and SIGHUP (reload),
    /// each also writing `wakeup` so a blocked reactor notices promptly.
    pub fn install(wakeup: &WakeupChannel) -> io::Result<Self> {
        let term = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));
        let mut ids = Vec::new();

        for signal in [SIGTERM, SIGINT] {
            ids.push(flag::register(signal, Arc::clone(&term))?);
            ids.push(low_level::pipe::register_raw(signal, wakeup.write_fd())?);
        }
        ids.push(flag::register(SIGHUP, Arc::clone(&reload))?);
        ids.push(low_level::pipe::register_raw(SIGHUP, wakeup.write_fd())?);

        Ok(SignalBridge { term, reload, ids })
    }

    /// Consume a pending termination request.
    pub fn take_termination(&self) -> bool {
        self.term.swap(false, Ordering::SeqCst)
    }

    /// Consume a pending reload request.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            low_level::unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sighup_raises_reload_flag_and_wakeup() {
        let wakeup = WakeupChannel::new().expect("Failed to create channel");
        let bridge = SignalBridge::install(&wakeup).expect("Failed to install handlers");

        assert!(!bridge.take_reload());
        low_level::raise(SIGHUP).expect("Failed to raise signal");

        assert!(bridge.take_reload());
        assert!(!bridge.take_reload());
        assert!(!bridge.take_termination());
        wakeup.drain();
    }
}
