//! `diag`: a workload that does nothing but count, for exercising the engine.
//!
//! Every motor's action bumps one counter shared by the activity and logs progress
//! every `interval` cycles (default 1000).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{ActionDispenser, ActivityType};
use crate::activity::ActivityDef;
use crate::error::{DefinitionError, ParamError};
use crate::motor::ActivityAction;

const DEFAULT_INTERVAL: u64 = 1000;

#[derive(Debug, Clone, Copy, Default)]
pub struct DiagActivity;

impl ActivityType for DiagActivity {
    fn name(&self) -> &str {
        "diag"
    }

    fn action_dispenser(
        &self,
        def: &Arc<ActivityDef>,
    ) -> Result<Arc<dyn ActionDispenser>, DefinitionError> {
        Ok(Arc::new(DiagActionDispenser::new(def)?))
    }
}

#[derive(Debug)]
pub struct DiagActionDispenser {
    interval: u64,
    cycles: Arc<AtomicU64>,
}

impl DiagActionDispenser {
    pub fn new(def: &ActivityDef) -> Result<Self, DefinitionError> {
        let interval = def.params().get_u64_or("interval", DEFAULT_INTERVAL)?;
        if interval == 0 {
            return Err(ParamError::Invalid {
                key: "interval".into(),
                value: "0".into(),
                expected: "a positive integer",
            }
            .into());
        }
        Ok(Self {
            interval,
            cycles: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Cycles completed by every action this dispenser has built.
    pub fn cycles_run(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

impl ActionDispenser for DiagActionDispenser {
    fn get_action(
        &self,
        def: &Arc<ActivityDef>,
        slot: usize,
    ) -> Result<Box<dyn ActivityAction>, DefinitionError> {
        Ok(Box::new(DiagAction {
            alias: def.alias().to_string(),
            slot,
            interval: self.interval,
            cycles: Arc::clone(&self.cycles),
        }))
    }
}

pub struct DiagAction {
    alias: String,
    slot: usize,
    interval: u64,
    cycles: Arc<AtomicU64>,
}

impl ActivityAction for DiagAction {
    fn run_cycle(&mut self, cycle: u64) {
        let total = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        if total % self.interval == 0 {
            tracing::info!(
                "diag {}[{}]: cycle {cycle}, {total} cycles so far",
                self.alias,
                self.slot
            );
        } else {
            tracing::trace!("diag {}[{}]: cycle {cycle}", self.alias, self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_cycles_across_slots() {
        let def = ActivityDef::parse("type=diag;").unwrap();
        assert_eq!(def.alias(), "diag");
        let dispenser = DiagActionDispenser::new(&def).unwrap();
        let mut first = dispenser.get_action(&def, 0).unwrap();
        let mut second = dispenser.get_action(&def, 1).unwrap();
        first.run_cycle(1);
        second.run_cycle(2);
        first.run_cycle(3);
        assert_eq!(dispenser.cycles_run(), 3);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let def = ActivityDef::parse("type=diag;interval=0").unwrap();
        assert!(DiagActionDispenser::new(&def).is_err());
        let def = ActivityDef::parse("type=diag;interval=often").unwrap();
        assert!(DiagActivity.action_dispenser(&def).is_err());
    }
}
