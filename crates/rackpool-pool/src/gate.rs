//! The process-wide serialization gate.
//!
//! Every mutation of host state machines, every collaborator callback and
//! every timer expiration serializes on one gate. The wrapper exists for the
//! latency diagnostics: the control plane must never perform blocking work
//! while holding it, and budget overruns are logged with a captured
//! backtrace so the offending call site can be found.

use std::backtrace::Backtrace;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::error;

/// Acquisitions that wait longer than this are reported.
const ACQUIRE_BUDGET: Duration = Duration::from_millis(100);

/// Holds that last longer than this are reported.
const HOLD_BUDGET: Duration = Duration::from_millis(300);

/// A mutex whose guard measures how long it was waited for and held.
#[derive(Debug)]
pub struct Gate<T> {
    inner: Mutex<T>,
}

impl<T> Gate<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquires the gate, blocking until it is free.
    ///
    /// A poisoned gate means a callback panicked while holding it; there is
    /// no host state worth salvaging at that point, so we crash.
    pub fn lock(&self) -> GateGuard<'_, T> {
        let requested = Instant::now();
        let guard = self.inner.lock().expect("gate poisoned");
        let waited = requested.elapsed();
        if waited > ACQUIRE_BUDGET {
            error!(
                waited_ms = waited.as_millis() as u64,
                backtrace = %Backtrace::force_capture(),
                "acquiring the gate took longer than its budget"
            );
        }
        GateGuard {
            guard,
            acquired: Instant::now(),
        }
    }
}

/// RAII guard for the gate; reports over-long holds on release.
pub struct GateGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    acquired: Instant,
}

impl<T> Deref for GateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for GateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for GateGuard<'_, T> {
    fn drop(&mut self) {
        let held = self.acquired.elapsed();
        if held > HOLD_BUDGET {
            error!(
                held_ms = held.as_millis() as u64,
                backtrace = %Backtrace::force_capture(),
                "holding the gate took longer than its budget"
            );
        }
    }
}
