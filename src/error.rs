//! Error types for the activity engine.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// A parameter value could not be read or parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    /// A `key=value` pair without a `=`, or with an empty key.
    #[error("malformed parameter entry '{0}'")]
    Malformed(String),

    /// The value exists but does not parse as the requested type.
    #[error("parameter '{key}' has value '{value}', expected {expected}")]
    Invalid {
        key: String,
        value: String,
        expected: &'static str,
    },

    /// A required parameter is absent.
    #[error("required parameter '{0}' is missing")]
    Missing(String),
}

/// The activity definition is unusable for building motors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error(transparent)]
    Param(#[from] ParamError),

    /// Neither an alias nor a type was given, so the activity has no name.
    #[error("activity definition has neither 'alias' nor 'type'")]
    Unnamed,

    #[error("invalid cycle range '{0}'")]
    CycleRange(String),
}

/// Failures surfaced by [`crate::executor::ActivityExecutor`].
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// `start()` (or a reconfiguration) ran before a motor dispenser was set.
    #[error("activity '{alias}' has no motor dispenser")]
    MissingDispenser { alias: String },

    #[error("activity definition rejected: {0}")]
    Definition(#[from] DefinitionError),

    /// The OS refused to create a thread for a motor.
    #[error("could not spawn motor thread for {alias}[{slot}]: {source}")]
    Spawn {
        alias: String,
        slot: usize,
        #[source]
        source: io::Error,
    },

    /// Submission after the execution service was shut down.
    #[error("execution service for '{alias}' is shut down")]
    ServiceShutdown { alias: String },

    /// Motors were still running when the termination wait ran out.
    #[error("executor for '{alias}' did not terminate within {timeout:?} ({remaining} left)")]
    ShutdownTimeout {
        alias: String,
        timeout: Duration,
        remaining: usize,
    },
}

/// A motor was run without being fully configured.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MotorError {
    #[error("motor {alias}[{slot}] has no input")]
    MissingInput { alias: String, slot: usize },

    #[error("motor {alias}[{slot}] has no action")]
    MissingAction { alias: String, slot: usize },
}

/// Workload type registration and lookup failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("activity type '{0}' is already defined")]
    Duplicate(String),

    #[error("activity type '{0}' not found")]
    Unknown(String),
}

/// Failures of the multi-activity [`crate::scenario::Scenario`] driver.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("activity '{0}' is already running")]
    DuplicateActivity(String),

    #[error("activity '{0}' is not known to this scenario")]
    UnknownActivity(String),

    /// A blocking shutdown task panicked or was cancelled.
    #[error("shutdown task for '{alias}' failed: {message}")]
    Join { alias: String, message: String },
}
