//! Motors: the worker units of an activity.
//!
//! A motor is bound to one [`ActivityInput`] and one [`ActivityAction`] and runs a
//! tight loop on its own thread:
//!
//! 1. check its [`MotorController`] for a stop request,
//! 2. wait for the activity's rate limiter, if any (a stop request ends this wait),
//! 3. take the next cycle number from the input (stop if exhausted),
//! 4. apply the action to it.
//!
//! The stop check sits between cycles only. A stop request never interrupts an
//! action that has already begun; it takes effect once that action returns.
//!
//! Whatever way the loop ends (stop request, exhausted input or a panic inside the
//! workload) the controller ends up `Stopped`, so executor bookkeeping stays
//! consistent.

pub mod controller;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

pub use controller::{MotorController, MotorState, StopRequest};

use crate::activity::ActivityDef;
use crate::error::MotorError;
use crate::executor::rate::RateLimiter;

/// Source of cycle numbers. `None` means the input is exhausted.
///
/// Inputs may be shared by all motors of an activity, hence `&self`.
pub trait ActivityInput: Send + Sync {
    fn next_cycle(&self) -> Option<u64>;
}

impl<F> ActivityInput for F
where
    F: Fn() -> Option<u64> + Send + Sync,
{
    fn next_cycle(&self) -> Option<u64> {
        self()
    }
}

/// The workload applied once per cycle. Each motor owns its action.
///
/// Errors are the workload's own business; the motor does not inspect outcomes.
pub trait ActivityAction: Send {
    fn run_cycle(&mut self, cycle: u64);
}

impl<F> ActivityAction for F
where
    F: FnMut(u64) + Send,
{
    fn run_cycle(&mut self, cycle: u64) {
        self(cycle)
    }
}

/// Optional motor capability: react to live changes of the activity definition.
pub trait ActivityDefObserver {
    fn on_activity_def_update(&self, def: &ActivityDef);
}

/// The threading harness of an activity, as seen by the executor.
pub trait Motor: Send + Sync {
    /// Slot index within the executor's pool.
    fn slot(&self) -> usize;

    fn controller(&self) -> &MotorController;

    /// Run the cycle loop on the calling thread until stopped or exhausted.
    fn run(&self) -> Result<(), MotorError>;

    /// True once the motor has been handed to an execution service.
    fn has_started(&self) -> bool {
        self.controller().has_started()
    }

    /// Motors that take live reconfiguration return themselves here.
    fn as_def_observer(&self) -> Option<&dyn ActivityDefObserver> {
        None
    }
}

/// Standard motor: input + action + optional shared rate limiter.
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use cycler::motor::{CoreMotor, Motor, MotorState};
///
/// let next = Arc::new(AtomicU64::new(0));
/// let motor = CoreMotor::new("docs", 0)
///     .with_input(Arc::new(move || {
///         let cycle = next.fetch_add(1, Ordering::Relaxed);
///         (cycle < 3).then_some(cycle)
///     }))
///     .with_action(|cycle: u64| println!("cycle {cycle}"));
///
/// motor.run().unwrap();
/// assert_eq!(motor.controller().state(), MotorState::Stopped);
/// ```
pub struct CoreMotor {
    alias: String,
    slot: usize,
    controller: MotorController,
    input: Option<Arc<dyn ActivityInput>>,
    // Taken by the running thread.
    action: Mutex<Option<Box<dyn ActivityAction>>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl CoreMotor {
    pub fn new(alias: impl Into<String>, slot: usize) -> Self {
        Self {
            alias: alias.into(),
            slot,
            controller: MotorController::new(),
            input: None,
            action: Mutex::new(None),
            limiter: None,
        }
    }

    pub fn with_input(mut self, input: Arc<dyn ActivityInput>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_action(self, action: impl ActivityAction + 'static) -> Self {
        self.with_boxed_action(Box::new(action))
    }

    pub fn with_boxed_action(self, action: Box<dyn ActivityAction>) -> Self {
        *self.action.lock() = Some(action);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    fn missing_input(&self) -> MotorError {
        MotorError::MissingInput {
            alias: self.alias.clone(),
            slot: self.slot,
        }
    }

    fn missing_action(&self) -> MotorError {
        MotorError::MissingAction {
            alias: self.alias.clone(),
            slot: self.slot,
        }
    }
}

/// Moves the controller to `Stopped` when the loop is left, including by unwinding.
struct FinishOnDrop<'a>(&'a MotorController);

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

impl Motor for CoreMotor {
    fn slot(&self) -> usize {
        self.slot
    }

    fn controller(&self) -> &MotorController {
        &self.controller
    }

    fn run(&self) -> Result<(), MotorError> {
        let _finish = FinishOnDrop(&self.controller);
        let input = self.input.as_ref().ok_or_else(|| self.missing_input())?;
        let mut action = self.action.lock().take().ok_or_else(|| self.missing_action())?;

        if let Err(state) = self.controller.enter_running() {
            tracing::debug!("Motor {self} not entering its loop, state is {state}.");
            return Ok(());
        }
        tracing::debug!("Motor {self} running.");

        let mut cycles = 0u64;
        loop {
            if self.controller.is_stop_requested() {
                tracing::debug!("Motor {self} observed stop request after {cycles} cycles.");
                break;
            }
            let paced_stop = self.limiter.as_ref().is_some_and(|l| l.acquire(&self.controller));
            if paced_stop {
                tracing::debug!("Motor {self} stopped while pacing after {cycles} cycles.");
                break;
            }
            let Some(cycle) = input.next_cycle() else {
                tracing::debug!("Motor {self} input exhausted after {cycles} cycles.");
                break;
            };
            action.run_cycle(cycle);
            cycles += 1;
        }
        Ok(())
    }

    fn as_def_observer(&self) -> Option<&dyn ActivityDefObserver> {
        Some(self)
    }
}

impl ActivityDefObserver for CoreMotor {
    fn on_activity_def_update(&self, def: &ActivityDef) {
        let Some(limiter) = &self.limiter else {
            return;
        };
        match def.cycle_rate() {
            Ok(rate) => limiter.set_rate(rate),
            Err(e) => tracing::warn!("Motor {self} keeping its rate, bad update: {e}"),
        }
    }
}

impl fmt::Display for CoreMotor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.alias, self.slot)
    }
}

impl fmt::Debug for CoreMotor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreMotor")
            .field("alias", &self.alias)
            .field("slot", &self.slot)
            .field("state", &self.controller.state())
            .field("started", &self.controller.has_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn counting_input(limit: u64) -> Arc<dyn ActivityInput> {
        let next = AtomicU64::new(0);
        Arc::new(move || {
            let cycle = next.fetch_add(1, Ordering::Relaxed);
            (cycle < limit).then_some(cycle)
        })
    }

    fn endless_input() -> Arc<dyn ActivityInput> {
        let next = AtomicU64::new(0);
        Arc::new(move || Some(next.fetch_add(1, Ordering::Relaxed)))
    }

    #[test]
    fn runs_every_cycle_of_a_finite_input() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let motor = CoreMotor::new("finite", 0)
            .with_input(counting_input(5))
            .with_action(move |cycle: u64| sink.lock().push(cycle));

        motor.run().unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(motor.controller().state(), MotorState::Stopped);
    }

    #[test]
    fn unconfigured_motor_is_rejected_and_stopped() {
        let motor = CoreMotor::new("bare", 2);
        assert_eq!(
            motor.run(),
            Err(MotorError::MissingInput {
                alias: "bare".into(),
                slot: 2
            })
        );
        assert!(motor.controller().is_stopped());

        let motor = CoreMotor::new("bare", 3).with_input(counting_input(1));
        assert!(matches!(motor.run(), Err(MotorError::MissingAction { slot: 3, .. })));
        assert!(motor.controller().is_stopped());
    }

    #[test]
    fn stop_requested_before_run_skips_the_loop() {
        let ran = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ran);
        let motor = CoreMotor::new("early", 0)
            .with_input(endless_input())
            .with_action(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        motor.controller().request_stop();
        motor.run().unwrap();
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        assert!(motor.controller().is_stopped());
    }

    #[test]
    fn stop_is_observed_only_after_the_action_returns() {
        let entered = Arc::new(AtomicU64::new(0));
        let completed = Arc::new(AtomicU64::new(0));
        let (entered_w, completed_w) = (Arc::clone(&entered), Arc::clone(&completed));
        let motor = Arc::new(
            CoreMotor::new("slow", 0)
                .with_input(endless_input())
                .with_action(move |_| {
                    entered_w.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(150));
                    completed_w.fetch_add(1, Ordering::SeqCst);
                }),
        );
        let runner = {
            let motor = Arc::clone(&motor);
            thread::spawn(move || motor.run())
        };

        while entered.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(motor.controller().request_stop(), StopRequest::Requested);
        // Mid-action: the stop is pending, not yet observed.
        assert_eq!(motor.controller().state(), MotorState::RequestedStop);
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        runner.join().unwrap().unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert!(motor.controller().is_stopped());
    }

    #[test]
    fn panicking_action_still_stops() {
        let motor = Arc::new(
            CoreMotor::new("boom", 0)
                .with_input(endless_input())
                .with_action(|cycle: u64| {
                    if cycle == 2 {
                        panic!("workload failure");
                    }
                }),
        );
        let runner = {
            let motor = Arc::clone(&motor);
            thread::spawn(move || motor.run())
        };
        assert!(runner.join().is_err());
        assert!(motor.controller().is_stopped());
    }

    #[test]
    fn observer_updates_shared_rate() {
        let limiter = Arc::new(RateLimiter::new(None));
        let motor = CoreMotor::new("paced", 0).with_rate_limiter(Arc::clone(&limiter));
        let def = ActivityDef::parse("alias=paced;cyclerate=40").unwrap();

        motor.as_def_observer().unwrap().on_activity_def_update(&def);
        assert_eq!(limiter.rate(), Some(40.0));

        def.params().set("cyclerate", "garbage");
        motor.as_def_observer().unwrap().on_activity_def_update(&def);
        assert_eq!(limiter.rate(), Some(40.0));
    }

    #[test]
    fn stop_ends_a_slow_paced_motor_between_slots() {
        let ran = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ran);
        let motor = Arc::new(
            CoreMotor::new("crawl", 0)
                .with_input(endless_input())
                .with_action(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .with_rate_limiter(Arc::new(RateLimiter::new(Some(0.2)))),
        );
        let runner = {
            let motor = Arc::clone(&motor);
            thread::spawn(move || motor.run())
        };
        while ran.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        // The next slot is five seconds away.
        let begun = Instant::now();
        motor.controller().request_stop();
        assert!(motor.controller().await_state(MotorState::Stopped, Duration::from_secs(2)));
        assert!(begun.elapsed() < Duration::from_secs(2));
        runner.join().unwrap().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
