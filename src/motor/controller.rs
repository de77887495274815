//! Per-motor state cell shared between a motor and its executor.
//!
//! ```text
//!   Initializing ──(motor)──▶ Running ──(motor)──▶ Stopped
//!        │                       │                    ▲
//!        └──(executor)──┐  (executor)                 │
//!                       ▼        ▼                    │
//!                     RequestedStop ─────(motor)──────┘
//! ```
//!
//! Every transition is one `compare_exchange` on an `AtomicU8`. The executor only
//! ever moves a motor *into* `RequestedStop`; every other transition belongs to the
//! motor. When both race from the same source state exactly one CAS wins, so a stop
//! request can neither be lost nor applied twice.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum MotorState {
    /// Constructed, loop not entered yet.
    Initializing = 0,
    /// Cycle loop active.
    Running = 1,
    /// Executor asked the motor to stop at its next cycle boundary.
    RequestedStop = 2,
    /// Loop exited, either on its own or after observing a stop request.
    Stopped = 3,
}

impl MotorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initializing,
            1 => Self::Running,
            2 => Self::RequestedStop,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for MotorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::RequestedStop => "requested-stop",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outcome of [`MotorController::request_stop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopRequest {
    /// This call moved the motor into `RequestedStop`.
    Requested,
    /// A stop was already pending.
    AlreadyRequested,
    /// The motor had already stopped.
    AlreadyStopped,
}

#[derive(Debug)]
pub struct MotorController {
    state: AtomicU8,
    submitted: AtomicBool,
    // Only used to wake waiters; the state itself is never guarded by it.
    changed: Mutex<()>,
    changed_cv: Condvar,
}

impl Default for MotorController {
    fn default() -> Self {
        Self::new()
    }
}

impl MotorController {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(MotorState::Initializing as u8),
            submitted: AtomicBool::new(false),
            changed: Mutex::new(()),
            changed_cv: Condvar::new(),
        }
    }

    pub fn state(&self) -> MotorState {
        MotorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_stop_requested(&self) -> bool {
        self.state() == MotorState::RequestedStop
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == MotorState::Stopped
    }

    /// Executor side: ask the motor to stop at its next cycle boundary.
    ///
    /// Accepted from `Initializing` as well as `Running`, so a motor stop-requested
    /// before its thread got going never enters its loop. Duplicate requests are
    /// ignored.
    pub fn request_stop(&self) -> StopRequest {
        let mut current = self.state();
        loop {
            match current {
                MotorState::RequestedStop => return StopRequest::AlreadyRequested,
                MotorState::Stopped => return StopRequest::AlreadyStopped,
                MotorState::Initializing | MotorState::Running => {
                    match self.transition(current, MotorState::RequestedStop) {
                        Ok(()) => return StopRequest::Requested,
                        Err(actual) => current = actual,
                    }
                }
            }
        }
    }

    /// Motor side: enter the loop. Fails if a stop was requested first.
    pub fn enter_running(&self) -> Result<(), MotorState> {
        self.transition(MotorState::Initializing, MotorState::Running)
    }

    /// Motor side: leave the loop, whatever the reason. Idempotent.
    ///
    /// Returns the state the motor left.
    pub fn finish(&self) -> MotorState {
        let mut current = self.state();
        loop {
            if current == MotorState::Stopped {
                return current;
            }
            match self.transition(current, MotorState::Stopped) {
                Ok(()) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether the motor has been handed to an execution service.
    pub fn has_started(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    /// Claim the one and only submission of this motor. Returns `false` if it was
    /// already claimed.
    pub(crate) fn mark_started(&self) -> bool {
        self.submitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Block until the motor reaches `state` or `timeout` elapses.
    pub fn await_state(&self, state: MotorState, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.changed.lock();
        while self.state() != state {
            if self.wait(&mut guard, deadline) {
                return self.state() == state;
            }
        }
        true
    }

    /// Block until a stop is requested (or the motor stopped) or `deadline` passes.
    /// `None` waits without a deadline.
    ///
    /// Returns `true` if the motor is being stopped.
    pub fn await_stop_request(&self, deadline: Option<Instant>) -> bool {
        let mut guard = self.changed.lock();
        while !self.is_stopping() {
            if self.wait(&mut guard, deadline) {
                return self.is_stopping();
            }
        }
        true
    }

    fn is_stopping(&self) -> bool {
        matches!(self.state(), MotorState::RequestedStop | MotorState::Stopped)
    }

    /// One condvar wait. `true` when the deadline passed.
    fn wait(&self, guard: &mut MutexGuard<'_, ()>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => self.changed_cv.wait_until(guard, deadline).timed_out(),
            None => {
                self.changed_cv.wait(guard);
                false
            }
        }
    }

    fn transition(&self, from: MotorState, to: MotorState) -> Result<(), MotorState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(MotorState::from_u8)?;
        tracing::trace!("motor state {from} -> {to}");
        let _guard = self.changed.lock();
        self.changed_cv.notify_all();
        Ok(())
    }
}
