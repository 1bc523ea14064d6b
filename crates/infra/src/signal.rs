//! Termination signal masking.
//!
//! **Unix platforms:** `SIGINT` and `SIGTERM` are routed to a dedicated
//! waiter thread with `sigwait`. Every other thread keeps them blocked so
//! the kernel never runs the default action on them.
//!
//! **Other platforms:** the blocker is a no-op and no waiter is installed.

use std::io;
use std::marker::PhantomData;

use crate::shutdown::ShutdownSignal;

/// Blocks termination signals for the current thread while alive.
///
/// On drop, only the signals this guard newly blocked are unblocked, so
/// nesting guards (or creating one on a thread that already blocks the
/// signals) restores exactly the previous mask.
#[derive(Debug)]
#[must_use = "signals are unblocked again when the guard is dropped"]
pub struct ExitSignalBlocker {
    #[cfg(unix)]
    newly_blocked: Vec<libc::c_int>,
    // Signal masks are per thread; the guard must be dropped where it was made.
    _not_send: PhantomData<*const ()>,
}

impl ExitSignalBlocker {
    pub fn new() -> io::Result<Self> {
        #[cfg(unix)]
        {
            let newly_blocked = unix::block_termination_signals()?;
            Ok(Self {
                newly_blocked,
                _not_send: PhantomData,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {
                _not_send: PhantomData,
            })
        }
    }
}

impl Drop for ExitSignalBlocker {
    fn drop(&mut self) {
        #[cfg(unix)]
        unix::unblock(&self.newly_blocked);
    }
}

/// Block termination signals on the calling thread for the rest of its life.
///
/// Threads spawned afterwards inherit the mask.
pub fn block_termination_signals_permanently() -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::block_termination_signals().map(|_| ())
    }
    #[cfg(not(unix))]
    {
        Ok(())
    }
}

/// Wait for the next termination signal. The calling thread must already
/// block them.
#[cfg(unix)]
pub fn wait_for_termination_signal() -> io::Result<ShutdownSignal> {
    unix::wait()
}

#[cfg(unix)]
mod unix {
    use std::io;
    use std::mem::MaybeUninit;
    use std::ptr;

    use crate::shutdown::ShutdownSignal;

    const TERMINATION_SIGNALS: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];

    fn signal_set(signals: &[libc::c_int]) -> libc::sigset_t {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigemptyset fully initializes the set before any read.
        unsafe {
            libc::sigemptyset(set.as_mut_ptr());
            for sig in signals {
                libc::sigaddset(set.as_mut_ptr(), *sig);
            }
            set.assume_init()
        }
    }

    pub(super) fn block_termination_signals() -> io::Result<Vec<libc::c_int>> {
        let set = signal_set(&TERMINATION_SIGNALS);
        let mut previous = signal_set(&[]);
        // SAFETY: both pointers reference valid, initialized sigset_t values.
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(TERMINATION_SIGNALS
            .iter()
            .copied()
            // SAFETY: `previous` was filled in by pthread_sigmask.
            .filter(|sig| unsafe { libc::sigismember(&previous, *sig) } == 0)
            .collect())
    }

    pub(super) fn unblock(signals: &[libc::c_int]) {
        if signals.is_empty() {
            return;
        }
        let set = signal_set(signals);
        // SAFETY: `set` is initialized; the old-mask pointer may be null.
        unsafe {
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());
        }
    }

    pub(super) fn wait() -> io::Result<ShutdownSignal> {
        let set = signal_set(&TERMINATION_SIGNALS);
        let mut received: libc::c_int = 0;
        // SAFETY: `set` is initialized and `received` is a valid out pointer.
        let rc = unsafe { libc::sigwait(&set, &mut received) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(match received {
            libc::SIGINT => ShutdownSignal::Interrupt,
            _ => ShutdownSignal::Terminate,
        })
    }

    /// Whether `sig` is blocked on the calling thread.
    #[cfg(test)]
    pub(super) fn is_blocked(sig: libc::c_int) -> bool {
        let mut current = signal_set(&[]);
        // SAFETY: a null new-set only queries the current mask.
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), &mut current);
            libc::sigismember(&current, sig) == 1
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn blocker_restores_mask_on_drop() {
        assert!(!unix::is_blocked(libc::SIGTERM));
        {
            let _guard = ExitSignalBlocker::new().unwrap();
            assert!(unix::is_blocked(libc::SIGTERM));
            assert!(unix::is_blocked(libc::SIGINT));
        }
        assert!(!unix::is_blocked(libc::SIGTERM));
        assert!(!unix::is_blocked(libc::SIGINT));
    }

    #[test]
    fn nested_blocker_keeps_outer_mask() {
        let outer = ExitSignalBlocker::new().unwrap();
        {
            let _inner = ExitSignalBlocker::new().unwrap();
        }
        assert!(unix::is_blocked(libc::SIGTERM));
        drop(outer);
        assert!(!unix::is_blocked(libc::SIGTERM));
    }

    #[test]
    fn blocker_is_restored_when_unwinding() {
        let result = std::panic::catch_unwind(|| {
            let _guard = ExitSignalBlocker::new().unwrap();
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(!unix::is_blocked(libc::SIGTERM));
    }
}
