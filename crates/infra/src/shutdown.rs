//! Process-wide, signal-driven cancellation.
//!
//! One [`ShutdownCoordinator`] is created at startup and passed by handle to
//! everything that blocks. The lifecycle is one-way:
//!
//! ```text
//! Armed ──signal──▶ SignalReceived ──actions done──▶ ActionsRan
//! ```
//!
//! Once requested, shutdown is never cleared.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// What triggered shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl-C in a terminal)
    Interrupt,
    /// SIGTERM (container runtime / service manager stop)
    Terminate,
    /// Requested by the executor itself
    Internal,
}

impl core::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
            ShutdownSignal::Internal => f.write_str("INTERNAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Armed,
    SignalReceived,
    ActionsRan,
}

/// Raised by [`ShutdownCoordinator::check_quit`] once shutdown was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("quit requested")]
pub struct QuitReceived;

type ShutdownAction = Box<dyn FnOnce() + Send>;

struct Registry {
    state: ShutdownState,
    actions: Vec<ShutdownAction>,
}

struct Inner {
    quit: AtomicBool,
    registry: Mutex<Registry>,
    quit_changed: Condvar,
}

#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .finish()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                quit: AtomicBool::new(false),
                registry: Mutex::new(Registry {
                    state: ShutdownState::Armed,
                    actions: Vec::new(),
                }),
                quit_changed: Condvar::new(),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ShutdownState {
        self.registry().state
    }

    pub fn is_quit_requested(&self) -> bool {
        self.inner.quit.load(Ordering::SeqCst)
    }

    pub fn check_quit(&self) -> Result<(), QuitReceived> {
        if self.is_quit_requested() {
            Err(QuitReceived)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless shutdown is requested first.
    ///
    /// Returns `false` when woken by a shutdown request.
    pub fn sleep_unless_quit(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut registry = self.registry();
        loop {
            if self.is_quit_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            registry = self
                .inner
                .quit_changed
                .wait_timeout(registry, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Register `action` to run once shutdown is requested.
    ///
    /// If shutdown was already requested the action runs immediately on the
    /// calling thread.
    pub fn add_shutdown_action<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut registry = self.registry();
        if registry.state == ShutdownState::Armed {
            registry.actions.push(Box::new(action));
            return;
        }
        drop(registry);
        action();
    }

    /// Set the quit flag and run registered actions in registration order.
    ///
    /// Only the first call has any effect.
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        self.inner.quit.store(true, Ordering::SeqCst);

        let actions = {
            let mut registry = self.registry();
            self.inner.quit_changed.notify_all();
            if registry.state != ShutdownState::Armed {
                return;
            }
            registry.state = ShutdownState::SignalReceived;
            std::mem::take(&mut registry.actions)
        };

        info!(signal = %signal, actions = actions.len(), "shutdown requested");
        for action in actions {
            action();
        }

        self.registry().state = ShutdownState::ActionsRan;
    }

    /// Route termination signals to a background waiter thread.
    ///
    /// Blocks the signals on the calling thread first, so call this from the
    /// main thread before spawning anything else.
    #[cfg(unix)]
    pub fn install_signal_waiter(&self) -> io::Result<thread::JoinHandle<()>> {
        crate::signal::block_termination_signals_permanently()?;

        let coordinator = self.clone();
        thread::Builder::new()
            .name("signal-waiter".to_string())
            .spawn(move || match crate::signal::wait_for_termination_signal() {
                Ok(signal) => coordinator.request_shutdown(signal),
                Err(e) => warn!(error = %e, "waiting for termination signal failed"),
            })
    }

    #[cfg(not(unix))]
    pub fn install_signal_waiter(&self) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("signal-waiter".to_string())
            .spawn(|| {})
    }
}
