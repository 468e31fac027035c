//! Termination-signal suppression while protected resources are open.
//!
//! A process holding a coordination lock, or an open HDF5 file, must not be
//! quietly terminated: a signal landing mid-write truncates the file. The
//! `KillGuard` is a process-wide reference count; while it is above zero the
//! terminate/interrupt signals are deferred instead of delivered, and when
//! the last handle is released the previously installed dispositions are
//! restored and any deferred signal is re-raised so the process exits as
//! asked.
//!
//! The counter, saved dispositions and deferred flag are process-global by
//! nature (signals are process-wide); they live in one lazily-initialized
//! mutex-protected singleton. Acquire is reentrant within a thread and safe
//! across threads.
//!
//! On non-unix targets the counter still works but no signal masking takes
//! place.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Signal number deferred while the guard is held; 0 when none.
static DEFERRED_SIGNAL: AtomicI32 = AtomicI32::new(0);

static STATE: Lazy<Mutex<GuardState>> = Lazy::new(|| Mutex::new(GuardState::default()));

#[derive(Default)]
struct GuardState {
    count: u64,
    #[cfg(unix)]
    saved: Vec<(nix::sys::signal::Signal, nix::sys::signal::SigAction)>,
}

/// Process-wide suppression of termination signals.
pub struct KillGuard;

impl KillGuard {
    /// Suppress termination signals until the returned handle is dropped.
    pub fn acquire() -> KillGuardHandle {
        let mut state = lock_state();
        if state.count == 0 {
            install_handlers(&mut state);
        }
        state.count += 1;
        KillGuardHandle { _priv: () }
    }

    /// Number of live handles.
    pub fn count() -> u64 {
        lock_state().count
    }

    fn release() {
        let mut state = lock_state();
        debug_assert!(state.count > 0, "kill guard released more than acquired");
        state.count = state.count.saturating_sub(1);
        if state.count == 0 {
            restore_handlers(&mut state);
            let deferred = DEFERRED_SIGNAL.swap(0, Ordering::SeqCst);
            if deferred != 0 {
                debug!(signal = deferred, "re-raising deferred termination signal");
                reraise(deferred);
            }
        }
    }
}

/// RAII handle; dropping it releases one count of suppression.
#[must_use]
pub struct KillGuardHandle {
    _priv: (),
}

impl Drop for KillGuardHandle {
    fn drop(&mut self) {
        KillGuard::release();
    }
}

fn lock_state() -> std::sync::MutexGuard<'static, GuardState> {
    // A poisoned global would otherwise wedge every future file open.
    STATE.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(unix)]
mod platform {
    use super::{GuardState, DEFERRED_SIGNAL};
    use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::sync::atomic::Ordering;
    use tracing::warn;

    /// Signals that would otherwise terminate the process mid-write.
    const GUARDED: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

    extern "C" fn defer(signum: nix::libc::c_int) {
        DEFERRED_SIGNAL.store(signum, Ordering::SeqCst);
    }

    #[allow(unsafe_code)]
    pub(super) fn install_handlers(state: &mut GuardState) {
        let action = SigAction::new(
            SigHandler::Handler(defer),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in GUARDED {
            // Signal dispositions are process-global; the caller holds the
            // state mutex.
            match unsafe { sigaction(sig, &action) } {
                Ok(previous) => state.saved.push((sig, previous)),
                Err(e) => warn!("failed to defer {:?}: {}", sig, e),
            }
        }
    }

    #[allow(unsafe_code)]
    pub(super) fn restore_handlers(state: &mut GuardState) {
        for (sig, previous) in state.saved.drain(..).rev() {
            if let Err(e) = unsafe { sigaction(sig, &previous) } {
                warn!("failed to restore {:?}: {}", sig, e);
            }
        }
    }

    pub(super) fn reraise(signum: i32) {
        match Signal::try_from(signum) {
            Ok(sig) => {
                if let Err(e) = raise(sig) {
                    warn!("failed to re-raise {:?}: {}", sig, e);
                }
            }
            Err(e) => warn!("deferred an unknown signal {}: {}", signum, e),
        }
    }
}

#[cfg(unix)]
use platform::{install_handlers, restore_handlers, reraise};

#[cfg(not(unix))]
fn install_handlers(_state: &mut GuardState) {}

#[cfg(not(unix))]
fn restore_handlers(_state: &mut GuardState) {}

#[cfg(not(unix))]
fn reraise(signum: i32) {
    tracing::warn!(signal = signum, "deferred signal cannot be re-raised on this platform");
}
