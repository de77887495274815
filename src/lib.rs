//! Cycler: the execution engine of a load generator.
//!
//! An *activity* is a named workload: a stream of numbered cycles, each fed to an
//! action. Cycler runs activities on pools of OS threads and lets you resize a pool
//! while it runs, simply by changing the activity's `threads` parameter.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`ParameterMap`]: the live `key=value` configuration of an activity. Every change
//!   is pushed synchronously to its listeners.
//! - [`ActivityDef`]: alias plus parameters; typed views such as `threads`, `cycles`
//!   and `cyclerate`.
//! - [`Motor`]: one worker thread's loop. Takes cycles from an input, applies an
//!   action, and checks its [`MotorController`] between cycles. Never interrupted
//!   mid-action.
//! - [`ActivityExecutor`]: owns the motors of one activity and keeps their number equal
//!   to `threads`, growing by appending slots and shrinking newest-first.
//! - [`MotorDispenser`]: builds a motor for a slot. The executor never builds motors
//!   itself.
//! - [`ActivityTypes`]: named workload types, each able to produce a dispenser. `diag`
//!   is built in.
//! - [`Scenario`]: runs several activities side by side for a while, then shuts them
//!   all down.
//!
//! # Design goals
//!
//! - Resizing is cheap and safe: only the difference is started or stopped, and
//!   concurrent resizes of one activity are serialised.
//! - Stopping is cooperative: actions finish the cycle they are in. Only a forced stop
//!   gives up on stragglers.
//! - Motor state is a lock-free cell; bookkeeping survives panics in workloads.
//!
//! # Where to start
//!
//! Build a [`Scenario`] and call [`Scenario::start_activity`] with something like
//! `"type=diag;alias=warmup;threads=4;cycles=100000"`. To plug in your own workload,
//! implement [`ActivityType`] (usually only `action_dispenser`) and register it. For
//! full control, drive an [`ActivityExecutor`] with your own [`MotorDispenser`].
//!
//! Enable log output with [`logging::init`] and `RUST_LOG`.

/// Workload types, dispensers and the shared cycle input
pub mod activities;
/// Activity definitions
pub mod activity;
/// Error types
pub mod error;
/// Motor pools and their execution service
pub mod executor;
/// Tracing subscriber setup
pub mod logging;
/// Worker loops and their state cells
pub mod motor;
/// Live parameter store
pub mod params;
/// Multi-activity driver
pub mod scenario;

pub use activities::{ActivityType, ActivityTypes, CoreMotorDispenser, CycleRange};
pub use activity::ActivityDef;
pub use error::{ExecutorError, ScenarioError};
pub use executor::{ActivityExecutor, ExecutorSettings, MotorDispenser, motor_dispenser};
pub use motor::{CoreMotor, Motor, MotorController, MotorState};
pub use params::{ParameterListener, ParameterMap};
pub use scenario::Scenario;
