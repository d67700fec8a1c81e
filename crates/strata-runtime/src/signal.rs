//! Interrupt state and signal forwarding.
//!
//! Signals that arrive before the contained process exists are recorded so
//! setup can abort with cleanup; once it runs they are forwarded to it.
//! Handlers only touch atomics and call `kill(2)`, and no thread is
//! spawned, so installing them early does not prevent `unshare(2)` of a
//! user namespace.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::SigId;
use strata_common::error::{EngineError, Result};

/// Signals forwarded to the contained process.
pub const FORWARDED_SIGNALS: &[i32] = &[SIGINT, SIGTERM, SIGHUP, SIGQUIT, SIGUSR1, SIGUSR2];

#[derive(Debug, Default)]
struct State {
    received: AtomicI32,
    child: AtomicI32,
    pending: AtomicI32,
}

/// Shared interrupt state of one invocation.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    state: Arc<State>,
}

impl Interrupt {
    /// Creates a state with no signal received and no child.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs handlers for [`FORWARDED_SIGNALS`] that feed this state.
    ///
    /// Handlers stay installed until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler cannot be registered.
    pub fn install(&self) -> Result<SignalGuard> {
        let mut ids = Vec::with_capacity(FORWARDED_SIGNALS.len());
        for &signal in FORWARDED_SIGNALS {
            let interrupt = self.clone();
            // SAFETY: the handler only performs atomic operations and
            // `kill(2)`, both async-signal-safe.
            let id = unsafe {
                signal_hook::low_level::register(signal, move || interrupt.notify(signal))
            }
            .map_err(|e| EngineError::io("signal handler", e))?;
            ids.push(id);
        }
        tracing::debug!(signals = ids.len(), "signal forwarding installed");
        Ok(SignalGuard { ids })
    }

    /// Records `signal` and forwards it to the child, if one is running.
    /// Otherwise it is held for the next [`Interrupt::attach_child`].
    ///
    /// Async-signal-safe.
    pub fn notify(&self, signal: i32) {
        self.state.received.store(signal, Ordering::SeqCst);
        let child = self.state.child.load(Ordering::SeqCst);
        if child > 0 {
            forward(child, signal);
        } else {
            self.state.pending.store(signal, Ordering::SeqCst);
        }
    }

    /// Last signal received, if any.
    #[must_use]
    pub fn received(&self) -> Option<i32> {
        match self.state.received.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }

    /// Fails if a signal was received.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Interrupted`].
    pub fn check(&self) -> Result<()> {
        match self.received() {
            Some(signal) => {
                tracing::warn!(signal, "interrupted during setup");
                Err(EngineError::Interrupted)
            }
            None => Ok(()),
        }
    }

    /// Starts forwarding to `pid`, delivering a signal that arrived while
    /// the process was being started.
    pub fn attach_child(&self, pid: u32) {
        let pid = i32::try_from(pid).unwrap_or(0);
        self.state.child.store(pid, Ordering::SeqCst);
        let pending = self.state.pending.swap(0, Ordering::SeqCst);
        if pid > 0 && pending > 0 {
            tracing::debug!(signal = pending, pid, "forwarding signal received during launch");
            forward(pid, pending);
        }
    }

    /// Stops forwarding.
    pub fn detach_child(&self) {
        self.state.child.store(0, Ordering::SeqCst);
    }
}

fn forward(pid: i32, signal: i32) {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let _ = unsafe { libc::kill(pid, signal) };
}

/// Keeps signal handlers installed while alive.
#[derive(Debug)]
pub struct SignalGuard {
    ids: Vec<SigId>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            let _ = signal_hook::low_level::unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_not_interrupted() {
        let interrupt = Interrupt::new();
        assert_eq!(interrupt.received(), None);
        interrupt.check().expect("not interrupted");
    }

    #[test]
    fn notify_without_child_records_signal() {
        let interrupt = Interrupt::new();
        interrupt.clone().notify(SIGTERM);
        assert_eq!(interrupt.received(), Some(SIGTERM));
        assert!(matches!(interrupt.check(), Err(EngineError::Interrupted)));
    }

    #[test]
    fn signal_before_attach_is_delivered_on_attach() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let interrupt = Interrupt::new();
        interrupt.notify(SIGTERM);
        interrupt.attach_child(child.id());
        let status = child.wait().expect("wait");
        interrupt.detach_child();
        assert!(!status.success());
    }

    #[test]
    fn forwarding_reaches_attached_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let interrupt = Interrupt::new();
        interrupt.attach_child(child.id());
        interrupt.notify(SIGTERM);
        interrupt.detach_child();
        let status = child.wait().expect("wait");
        assert!(!status.success());
    }
}
