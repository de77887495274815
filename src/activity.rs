use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{DefinitionError, ParamError};
use crate::executor::rate::MIN_RATE;
use crate::params::ParameterMap;

/// Identity and live configuration of one activity.
///
/// The alias is fixed at construction. The parameters may change at any time, from
/// any thread, and every change is pushed synchronously to the map's listeners.
/// Definitions are shared as `Arc<ActivityDef>` between the driver, the executor and
/// every motor built for the activity.
#[derive(Debug, Serialize)]
pub struct ActivityDef {
    alias: String,
    params: ParameterMap,
}

impl ActivityDef {
    pub fn new(alias: impl Into<String>, params: ParameterMap) -> Arc<Self> {
        Arc::new(Self {
            alias: alias.into(),
            params,
        })
    }

    /// Build a definition from `key=value;` form. The alias comes from `alias`, or
    /// falls back to `type`.
    pub fn parse(input: &str) -> Result<Arc<Self>, DefinitionError> {
        let params = ParameterMap::parse(input)?;
        let alias = params
            .get("alias")
            .or_else(|| params.get("type"))
            .ok_or(DefinitionError::Unnamed)?;
        Ok(Self::new(alias, params))
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn params(&self) -> &ParameterMap {
        &self.params
    }

    pub fn activity_type(&self) -> Option<String> {
        self.params.get("type")
    }

    /// Name used in log lines.
    pub fn log_name(&self) -> String {
        match self.activity_type() {
            Some(kind) if kind != self.alias => format!("{} ({kind})", self.alias),
            _ => self.alias.clone(),
        }
    }

    /// Desired motor count. Defaults to 1; `auto` means one per logical CPU.
    pub fn threads(&self) -> Result<usize, DefinitionError> {
        match self.params.get("threads") {
            Some(value) if value.eq_ignore_ascii_case("auto") => Ok(num_cpus::get()),
            _ => Ok(self.params.get_usize_or("threads", 1)?),
        }
    }

    /// Cycle interval to cover, from `cycles=N` (meaning `0..N`) or `cycles=start..end`.
    pub fn cycles(&self) -> Result<Range<u64>, DefinitionError> {
        let Some(spec) = self.params.get("cycles") else {
            return Ok(0..u64::MAX);
        };
        let range = match spec.split_once("..") {
            Some((start, end)) => {
                let start = start.trim().parse::<u64>();
                let end = end.trim().parse::<u64>();
                match (start, end) {
                    (Ok(start), Ok(end)) => start..end,
                    _ => return Err(DefinitionError::CycleRange(spec)),
                }
            }
            None => match spec.trim().parse::<u64>() {
                Ok(end) => 0..end,
                Err(_) => return Err(DefinitionError::CycleRange(spec)),
            },
        };
        if range.start > range.end {
            return Err(DefinitionError::CycleRange(spec));
        }
        Ok(range)
    }

    /// Target cycles per second across all motors; `None` when unlimited. Nonzero
    /// rates below [`MIN_RATE`] are rejected.
    pub fn cycle_rate(&self) -> Result<Option<f64>, DefinitionError> {
        let rate = self.params.get_f64_or("cyclerate", 0.0)?;
        let expected = if !rate.is_finite() || rate < 0.0 {
            "a finite, non-negative number"
        } else if rate > 0.0 && rate < MIN_RATE {
            "0 or at least one cycle per year"
        } else {
            return Ok((rate > 0.0).then_some(rate));
        };
        Err(ParamError::Invalid {
            key: "cyclerate".into(),
            value: rate.to_string(),
            expected,
        }
        .into())
    }
}

impl fmt::Display for ActivityDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.alias, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_falls_back_to_type() {
        let def = ActivityDef::parse("type=diag;").unwrap();
        assert_eq!(def.alias(), "diag");
        assert_eq!(def.log_name(), "diag");

        let def = ActivityDef::parse("type=diag;alias=writes").unwrap();
        assert_eq!(def.alias(), "writes");
        assert_eq!(def.log_name(), "writes (diag)");

        assert_eq!(ActivityDef::parse("threads=2").unwrap_err(), DefinitionError::Unnamed);
    }

    #[test]
    fn alias_does_not_follow_parameter_changes() {
        let def = ActivityDef::parse("alias=first").unwrap();
        def.params().set("alias", "second");
        assert_eq!(def.alias(), "first");
    }

    #[test]
    fn threads_default_auto_and_garbage() {
        let def = ActivityDef::parse("alias=a").unwrap();
        assert_eq!(def.threads().unwrap(), 1);
        def.params().set("threads", "auto");
        assert_eq!(def.threads().unwrap(), num_cpus::get());
        def.params().set("threads", "-1");
        assert!(matches!(def.threads(), Err(DefinitionError::Param(_))));
    }

    #[test]
    fn cycle_ranges() {
        let def = ActivityDef::parse("alias=a").unwrap();
        assert_eq!(def.cycles().unwrap(), 0..u64::MAX);
        def.params().set("cycles", "10");
        assert_eq!(def.cycles().unwrap(), 0..10);
        def.params().set("cycles", "5..8");
        assert_eq!(def.cycles().unwrap(), 5..8);
        def.params().set("cycles", "8..5");
        assert!(matches!(def.cycles(), Err(DefinitionError::CycleRange(_))));
        def.params().set("cycles", "x..5");
        assert!(def.cycles().is_err());
    }

    #[test]
    fn cycle_rate_zero_means_unlimited() {
        let def = ActivityDef::parse("alias=a;cyclerate=0").unwrap();
        assert_eq!(def.cycle_rate().unwrap(), None);
        def.params().set("cyclerate", "250.5");
        assert_eq!(def.cycle_rate().unwrap(), Some(250.5));
        def.params().set("cyclerate", "-1");
        assert!(def.cycle_rate().is_err());
    }

    #[test]
    fn cycle_rate_below_one_per_year_is_rejected() {
        let def = ActivityDef::parse("alias=a;cyclerate=1e-20").unwrap();
        assert!(matches!(
            def.cycle_rate(),
            Err(DefinitionError::Param(ParamError::Invalid { ref key, .. })) if key == "cyclerate"
        ));
        def.params().set("cyclerate", "1e-7");
        assert_eq!(def.cycle_rate().unwrap(), Some(1e-7));
    }
}
