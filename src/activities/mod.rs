//! Workload types and the building blocks they hand to an executor.
//!
//! An [`ActivityType`] turns an [`ActivityDef`] into a [`MotorDispenser`]. Most types
//! only provide an [`ActionDispenser`]; the default input is a [`CycleRange`] shared
//! by every motor of the activity, and the default motor is a [`CoreMotor`] pacing
//! itself with the activity's `cyclerate`.
//!
//! Types are looked up by name in an explicit [`ActivityTypes`] table.

pub mod diag;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::activity::ActivityDef;
use crate::error::{DefinitionError, RegistryError};
use crate::executor::MotorDispenser;
use crate::executor::rate::RateLimiter;
use crate::motor::{ActivityAction, ActivityInput, CoreMotor, Motor};

pub use diag::DiagActivity;

/// Builds the per-motor action for a slot.
pub trait ActionDispenser: Send + Sync {
    fn get_action(
        &self,
        def: &Arc<ActivityDef>,
        slot: usize,
    ) -> Result<Box<dyn ActivityAction>, DefinitionError>;
}

/// Builds (or shares) the cycle input for a slot.
pub trait InputDispenser: Send + Sync {
    fn get_input(
        &self,
        def: &Arc<ActivityDef>,
        slot: usize,
    ) -> Result<Arc<dyn ActivityInput>, DefinitionError>;
}

/// A named kind of workload.
pub trait ActivityType: Send + Sync {
    fn name(&self) -> &str;

    fn action_dispenser(
        &self,
        def: &Arc<ActivityDef>,
    ) -> Result<Arc<dyn ActionDispenser>, DefinitionError>;

    /// One [`CycleRange`] over the `cycles` parameter, shared by all slots.
    fn input_dispenser(
        &self,
        def: &Arc<ActivityDef>,
    ) -> Result<Arc<dyn InputDispenser>, DefinitionError> {
        let range: Arc<dyn ActivityInput> = Arc::new(CycleRange::new(def.cycles()?));
        Ok(Arc::new(SharedInput(range)))
    }

    fn motor_dispenser(
        &self,
        def: &Arc<ActivityDef>,
    ) -> Result<Arc<dyn MotorDispenser>, DefinitionError> {
        let limiter = Arc::new(RateLimiter::new(def.cycle_rate()?));
        let dispenser =
            CoreMotorDispenser::new(self.input_dispenser(def)?, self.action_dispenser(def)?)
                .with_rate_limiter(limiter);
        Ok(Arc::new(dispenser))
    }
}

/// Hands the same input to every slot.
pub struct SharedInput(pub Arc<dyn ActivityInput>);

impl InputDispenser for SharedInput {
    fn get_input(
        &self,
        _def: &Arc<ActivityDef>,
        _slot: usize,
    ) -> Result<Arc<dyn ActivityInput>, DefinitionError> {
        Ok(Arc::clone(&self.0))
    }
}

/// Composes an input and an action dispenser into [`CoreMotor`]s.
pub struct CoreMotorDispenser {
    input: Arc<dyn InputDispenser>,
    action: Arc<dyn ActionDispenser>,
    limiter: Option<Arc<RateLimiter>>,
}

impl CoreMotorDispenser {
    pub fn new(input: Arc<dyn InputDispenser>, action: Arc<dyn ActionDispenser>) -> Self {
        Self {
            input,
            action,
            limiter: None,
        }
    }

    /// All motors built by this dispenser share `limiter`.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }
}

impl MotorDispenser for CoreMotorDispenser {
    fn get_motor(
        &self,
        def: &Arc<ActivityDef>,
        slot: usize,
    ) -> Result<Arc<dyn Motor>, DefinitionError> {
        let mut motor = CoreMotor::new(def.alias(), slot)
            .with_input(self.input.get_input(def, slot)?)
            .with_boxed_action(self.action.get_action(def, slot)?);
        if let Some(limiter) = &self.limiter {
            motor = motor.with_rate_limiter(Arc::clone(limiter));
        }
        Ok(Arc::new(motor))
    }
}

/// Lock-free source of the cycles in `start..end`, each handed out exactly once
/// no matter how many motors draw from it.
pub struct CycleRange {
    next: AtomicU64,
    start: u64,
    end: u64,
}

impl CycleRange {
    pub fn new(range: Range<u64>) -> Self {
        Self {
            next: AtomicU64::new(range.start),
            start: range.start,
            end: range.end,
        }
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    /// Cycles not yet handed out.
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.next.load(Ordering::Acquire))
    }
}

impl ActivityInput for CycleRange {
    fn next_cycle(&self) -> Option<u64> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.end).then(|| n + 1))
            .ok()
    }
}

impl fmt::Debug for CycleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleRange")
            .field("range", &self.range())
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Registry of workload types, keyed by name.
#[derive(Default)]
pub struct ActivityTypes {
    types: BTreeMap<String, Arc<dyn ActivityType>>,
}

impl ActivityTypes {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in types (`diag`).
    pub fn with_builtins() -> Self {
        let mut types = Self::new();
        types.types.insert("diag".to_string(), Arc::new(DiagActivity));
        types
    }

    pub fn register(&mut self, activity_type: Arc<dyn ActivityType>) -> Result<(), RegistryError> {
        let name = activity_type.name().to_string();
        if self.types.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::debug!("Registered activity type '{name}'");
        self.types.insert(name, activity_type);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ActivityType>, RegistryError> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for ActivityTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.types.keys()).finish()
    }
}
