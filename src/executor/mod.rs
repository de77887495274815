//! Activity executor: a live-resizable pool of motors for one activity.
//!
//! An [`ActivityExecutor`] owns the motors of one activity and keeps their number
//! equal to the activity's `threads` parameter. It does so by *reconciling*: on
//! [`start`](ActivityExecutor::start) and again on every change of the activity's
//! [`ParameterMap`], synchronously, on the thread that made the change.
//!
//! # Reconciliation
//! 1. Read the desired motor count `N` from the activity definition.
//! 2. While the pool holds more than `N` motors, pop the **newest** one and request
//!    it to stop. Long-lived low slots keep running when the count oscillates.
//! 3. While the pool holds fewer than `N` motors, ask the [`MotorDispenser`] for a
//!    motor at the next slot index and append it.
//! 4. Submit every motor that has not been submitted yet to the execution service.
//!
//! The whole sequence is one critical section per executor: a manual `start()`
//! racing a parameter update from another thread waits its turn. The section is
//! re-entrant for the *same* thread (a dispenser or observer that itself changes a
//! parameter does not deadlock); such a nested request is deferred and the outer
//! reconciliation simply runs again once it is done, against the latest value.
//!
//! Within a reconciliation shrinking precedes growth, which precedes submission,
//! so the pool never transiently exceeds the new size.
//!
//! # Submission
//! Each motor is submitted exactly once: the executor claims the motor's
//! "started" flag with a CAS before handing it to the [`ExecutionService`], one new
//! OS thread per motor. If the thread cannot be created the error carries the alias
//! and slot, the failed motor and every motor above it (none of them started) are
//! dropped from the pool, and the shortfall is retried by the next reconciliation.
//!
//! # Stopping
//! - [`stop`](ActivityExecutor::stop) asks every motor to stop at its next cycle
//!   boundary and returns at once.
//! - [`force_stop`](ActivityExecutor::force_stop) stops, waits at most the grace
//!   period for motors to wind down, then shuts the execution service down hard.
//!   Motors still inside an action are abandoned mid-action; this is the one place
//!   the "never interrupt an action" guarantee is given up.
//! - [`stop_executor`](ActivityExecutor::stop_executor) shuts the service down and
//!   waits, bounded, for every motor thread to exit. Running out of time is an
//!   error for the caller.

pub mod rate;
pub mod service;

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::ReentrantMutex;
use serde::Serialize;
use typed_builder::TypedBuilder;

use crate::activity::ActivityDef;
use crate::error::{DefinitionError, ExecutorError};
use crate::motor::{Motor, MotorState};
use crate::params::{ParameterListener, ParameterMap};
use service::{ExecutionService, SubmitError};

/// Factory of motors for one activity. Pure: it must not touch executor state.
pub trait MotorDispenser: Send + Sync {
    /// A ready-to-run motor for `slot` of the activity described by `def`.
    fn get_motor(
        &self,
        def: &Arc<ActivityDef>,
        slot: usize,
    ) -> Result<Arc<dyn Motor>, DefinitionError>;
}

impl<F> MotorDispenser for F
where
    F: Fn(&Arc<ActivityDef>, usize) -> Result<Arc<dyn Motor>, DefinitionError> + Send + Sync,
{
    fn get_motor(
        &self,
        def: &Arc<ActivityDef>,
        slot: usize,
    ) -> Result<Arc<dyn Motor>, DefinitionError> {
        self(def, slot)
    }
}

/// Wrap a closure as a shareable dispenser.
pub fn motor_dispenser<F>(dispense: F) -> Arc<dyn MotorDispenser>
where
    F: Fn(&Arc<ActivityDef>, usize) -> Result<Arc<dyn Motor>, DefinitionError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(dispense)
}

/// Timing knobs of an [`ActivityExecutor`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct ExecutorSettings {
    /// How long `stop_executor` waits for motor threads to exit.
    #[builder(default = Duration::from_secs(60))]
    pub shutdown_timeout: Duration,
    /// How long `force_stop` lets motors wind down before shutting down hard.
    #[builder(default = Duration::from_secs(1))]
    pub force_stop_grace: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Lifecycle of the executor itself (not of its motors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    /// Constructed; parameter changes are recorded but not acted on.
    Idle,
    /// Started; parameter changes reconcile the pool.
    Running,
    /// Stop requested; a later `start()` builds a fresh pool.
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct MotorStatus {
    pub slot: usize,
    pub state: MotorState,
    pub started: bool,
}

/// Point-in-time view of an executor, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub alias: String,
    pub run_state: RunState,
    /// `None` when the `threads` parameter is currently unparseable.
    pub desired_threads: Option<usize>,
    /// Motor threads not yet exited, including abandoned ones.
    pub outstanding: usize,
    pub motors: Vec<MotorStatus>,
}

struct Pool {
    dispenser: Option<Arc<dyn MotorDispenser>>,
    motors: Vec<Arc<dyn Motor>>,
    run_state: RunState,
    reconciling: bool,
    rerun: bool,
}

/// Clears the reconciliation flags however the reconciliation ends.
struct Reconciling<'a>(&'a RefCell<Pool>);

impl Drop for Reconciling<'_> {
    fn drop(&mut self) {
        let mut pool = self.0.borrow_mut();
        pool.reconciling = false;
        pool.rerun = false;
    }
}

pub struct ActivityExecutor {
    def: Arc<ActivityDef>,
    settings: ExecutorSettings,
    service: ExecutionService,
    pool: ReentrantMutex<RefCell<Pool>>,
}

impl ActivityExecutor {
    /// Create an executor with default settings and register it as a listener on
    /// the definition's parameters.
    pub fn new(def: Arc<ActivityDef>) -> Arc<Self> {
        Self::with_settings(def, ExecutorSettings::default())
    }

    pub fn with_settings(def: Arc<ActivityDef>, settings: ExecutorSettings) -> Arc<Self> {
        let service = ExecutionService::new(def.alias());
        let executor = Arc::new(Self {
            def,
            settings,
            service,
            pool: ReentrantMutex::new(RefCell::new(Pool {
                dispenser: None,
                motors: Vec::new(),
                run_state: RunState::Idle,
                reconciling: false,
                rerun: false,
            })),
        });
        let listener: Weak<dyn ParameterListener> =
            Arc::downgrade(&executor) as Weak<dyn ParameterListener>;
        executor.def.params().add_listener(listener);
        executor
    }

    pub fn activity_def(&self) -> &Arc<ActivityDef> {
        &self.def
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Must be set before the first `start()`.
    pub fn set_motor_dispenser(&self, dispenser: Arc<dyn MotorDispenser>) {
        self.pool.lock().borrow_mut().dispenser = Some(dispenser);
    }

    pub fn run_state(&self) -> RunState {
        self.pool.lock().borrow().run_state
    }

    /// Snapshot of the current pool, oldest slot first.
    pub fn motors(&self) -> Vec<Arc<dyn Motor>> {
        self.pool.lock().borrow().motors.clone()
    }

    pub fn motor_count(&self) -> usize {
        self.pool.lock().borrow().motors.len()
    }

    /// Reconcile the pool to the configured thread count and launch new motors.
    ///
    /// Calling it again without a parameter change submits nothing new. After
    /// `stop()` it builds a fresh pool.
    pub fn start(&self) -> Result<(), ExecutorError> {
        let guard = self.pool.lock();
        tracing::info!("Starting activity {}", self.def.log_name());
        {
            let mut pool = guard.borrow_mut();
            if pool.dispenser.is_none() {
                return Err(self.missing_dispenser());
            }
            if pool.run_state == RunState::Stopped {
                tracing::debug!(
                    "Restarting {}, discarding {} stopped motors.",
                    self.def.alias(),
                    pool.motors.len()
                );
                pool.motors.clear();
            }
            pool.run_state = RunState::Running;
        }
        match self.reconcile(&guard) {
            Ok(true) => self.notify_observers(&guard),
            Ok(false) => {}
            Err(e @ ExecutorError::ServiceShutdown { .. }) => {
                // No motor can run again; stay out of the update path.
                guard.borrow_mut().run_state = RunState::Stopped;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Ask every motor to stop at its next cycle boundary. Does not wait.
    pub fn stop(&self) {
        let guard = self.pool.lock();
        let mut pool = guard.borrow_mut();
        tracing::info!("Stopping activity {}", self.def.log_name());
        if pool.run_state == RunState::Running {
            pool.run_state = RunState::Stopped;
        }
        for motor in &pool.motors {
            let outcome = motor.controller().request_stop();
            tracing::trace!("Stop request for {}[{}]: {outcome:?}", self.def.alias(), motor.slot());
        }
    }

    /// `stop()`, wait up to the grace period, then discard everything still queued.
    ///
    /// Returns the number of submissions that never started. Motors still running
    /// after the grace period are abandoned.
    pub fn force_stop(&self) -> usize {
        let _guard = self.pool.lock();
        self.stop();
        let wound_down = self.service.await_termination(self.settings.force_stop_grace);

        tracing::info!("Stopping activity {} forcibly", self.def.log_name());
        let discarded = self.service.shutdown_now();
        let abandoned = if wound_down { 0 } else { self.service.active() };
        if discarded > 0 || abandoned > 0 {
            tracing::warn!(
                "Forced stop of {}: {discarded} never started, {abandoned} abandoned mid-action.",
                self.def.alias()
            );
        } else {
            tracing::debug!("Forced stop of {}: all motors had wound down.", self.def.alias());
        }
        discarded
    }

    /// Shut the execution service down and wait for motor threads to exit.
    pub fn stop_executor(&self) -> Result<(), ExecutorError> {
        tracing::info!("Shutting down executor for {}", self.def.log_name());
        self.service.shutdown();
        let timeout = self.settings.shutdown_timeout;
        if self.service.await_termination(timeout) {
            tracing::debug!("Executor for {} terminated.", self.def.alias());
            return Ok(());
        }
        let remaining = self.service.outstanding();
        tracing::error!(
            "Executor for {} still has {remaining} motors after {timeout:?}.",
            self.def.alias()
        );
        Err(ExecutorError::ShutdownTimeout {
            alias: self.def.alias().to_string(),
            timeout,
            remaining,
        })
    }

    pub fn status(&self) -> ExecutorStatus {
        let guard = self.pool.lock();
        let pool = guard.borrow();
        ExecutorStatus {
            alias: self.def.alias().to_string(),
            run_state: pool.run_state,
            desired_threads: self.def.threads().ok(),
            outstanding: self.service.outstanding(),
            motors: pool
                .motors
                .iter()
                .map(|m| MotorStatus {
                    slot: m.slot(),
                    state: m.controller().state(),
                    started: m.has_started(),
                })
                .collect(),
        }
    }

    fn missing_dispenser(&self) -> ExecutorError {
        ExecutorError::MissingDispenser {
            alias: self.def.alias().to_string(),
        }
    }

    /// Returns `Ok(false)` when the request was deferred to an enclosing
    /// reconciliation on this thread.
    fn reconcile(&self, cell: &RefCell<Pool>) -> Result<bool, ExecutorError> {
        {
            let mut pool = cell.borrow_mut();
            if pool.reconciling {
                tracing::trace!("Nested reconfiguration of {} deferred.", self.def.alias());
                pool.rerun = true;
                return Ok(false);
            }
            pool.reconciling = true;
        }
        let _flags = Reconciling(cell);
        loop {
            self.reconcile_once(cell)?;
            if !std::mem::take(&mut cell.borrow_mut().rerun) {
                return Ok(true);
            }
        }
    }

    fn reconcile_once(&self, cell: &RefCell<Pool>) -> Result<(), ExecutorError> {
        let alias = self.def.alias();
        let dispenser = cell
            .borrow()
            .dispenser
            .clone()
            .ok_or_else(|| self.missing_dispenser())?;
        let desired = self.def.threads()?;

        {
            let mut pool = cell.borrow_mut();
            while pool.motors.len() > desired {
                if let Some(motor) = pool.motors.pop() {
                    tracing::trace!("Stopping cycle motor {alias}[{}]", motor.slot());
                    motor.controller().request_stop();
                }
            }
        }

        loop {
            let slot = {
                let pool = cell.borrow();
                if pool.motors.len() >= desired {
                    break;
                }
                pool.motors.len()
            };
            // No borrow held: the dispenser may re-enter through a parameter change.
            let motor = dispenser.get_motor(&self.def, slot)?;
            tracing::trace!("Adding cycle motor {alias}[{slot}]");
            cell.borrow_mut().motors.push(motor);
        }

        let unstarted: Vec<(usize, Arc<dyn Motor>)> = cell
            .borrow()
            .motors
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.has_started())
            .map(|(i, m)| (i, Arc::clone(m)))
            .collect();

        for (index, motor) in unstarted {
            if !motor.controller().mark_started() {
                continue;
            }
            if let Err(e) = self.submit(&motor) {
                tracing::error!("Could not launch motor {alias}[{index}]: {e}");
                cell.borrow_mut().motors.truncate(index);
                return Err(e);
            }
            tracing::debug!("Launched motor {alias}[{index}]");
        }
        Ok(())
    }

    fn submit(&self, motor: &Arc<dyn Motor>) -> Result<(), ExecutorError> {
        let alias = self.def.alias().to_string();
        let slot = motor.slot();
        let runner = StopOnDrop(Arc::clone(motor));
        let label = alias.clone();
        self.service
            .execute(move || {
                let runner = runner;
                if let Err(e) = runner.0.run() {
                    tracing::error!("Motor {label}[{slot}] refused to run: {e}");
                }
            })
            .map_err(|e| match e {
                SubmitError::Shutdown => ExecutorError::ServiceShutdown { alias },
                SubmitError::Spawn(source) => ExecutorError::Spawn { alias, slot, source },
            })
    }

    fn notify_observers(&self, cell: &RefCell<Pool>) {
        // Cloned so observers run without a borrow held.
        let motors = cell.borrow().motors.clone();
        for motor in &motors {
            if let Some(observer) = motor.as_def_observer() {
                observer.on_activity_def_update(&self.def);
            }
        }
    }
}

/// Settles a submitted motor as `Stopped` once its task is gone, run or not.
struct StopOnDrop(Arc<dyn Motor>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.controller().finish();
    }
}

impl ParameterListener for ActivityExecutor {
    fn handle_parameter_map_update(&self, _params: &ParameterMap) {
        let guard = self.pool.lock();
        if guard.borrow().run_state != RunState::Running {
            tracing::trace!("{} not running, parameter change recorded only.", self.def.alias());
            return;
        }
        match self.reconcile(&guard) {
            Ok(true) => self.notify_observers(&guard),
            Ok(false) => {}
            Err(e @ ExecutorError::ServiceShutdown { .. }) => {
                guard.borrow_mut().run_state = RunState::Stopped;
                tracing::warn!("{}: {e}; ignoring further parameter changes.", self.def.alias());
            }
            Err(e) => tracing::error!("Reconfiguring {} failed: {e}", self.def.log_name()),
        }
    }
}

impl Drop for ActivityExecutor {
    fn drop(&mut self) {
        for motor in &self.pool.get_mut().get_mut().motors {
            motor.controller().request_stop();
        }
        self.service.shutdown();
    }
}

impl fmt::Debug for ActivityExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityExecutor")
            .field("alias", &self.def.alias())
            .field("settings", &self.settings)
            .field("motors", &self.motor_count())
            .finish()
    }
}
