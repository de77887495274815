use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use typed_builder::TypedBuilder;

use crate::activities::ActivityTypes;
use crate::activity::ActivityDef;
use crate::error::{DefinitionError, ParamError, ScenarioError};
use crate::executor::{ActivityExecutor, ExecutorSettings, ExecutorStatus};

/// A set of named activities run side by side.
///
/// Activities are started from `key=value;` definitions whose `type` names an entry in
/// the scenario's [`ActivityTypes`]. Each gets its own [`ActivityExecutor`]; parameters
/// can be changed while it runs.
///
/// ```no_run
/// # async fn demo() -> Result<(), cycler::error::ScenarioError> {
/// use std::time::Duration;
/// use cycler::Scenario;
///
/// let scenario = Scenario::builder().name("smoke").build();
/// scenario.start_activity("type=diag;alias=warmup;threads=2;cycles=10000")?;
/// scenario.set_param("warmup", "threads", 4)?;
/// let last = scenario.run_for(Duration::from_secs(5)).await?;
/// println!("{}", serde_json::to_string_pretty(&last).unwrap());
/// # Ok(())
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default = ActivityTypes::with_builtins())]
    types: ActivityTypes,
    /// Applied to every executor this scenario creates.
    #[builder(default)]
    settings: ExecutorSettings,
    #[builder(default, setter(skip))]
    executors: Mutex<BTreeMap<String, Arc<ActivityExecutor>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioStatus {
    pub name: String,
    pub activities: Vec<ExecutorStatus>,
}

impl Scenario {
    pub fn activity_types(&self) -> &ActivityTypes {
        &self.types
    }

    /// Parse `definition` and start it. See [`Scenario::start_activity_def`].
    pub fn start_activity(&self, definition: &str) -> Result<Arc<ActivityExecutor>, ScenarioError> {
        self.start_activity_def(ActivityDef::parse(definition)?)
    }

    /// Resolve the definition's type, build its executor and start it.
    pub fn start_activity_def(
        &self,
        def: Arc<ActivityDef>,
    ) -> Result<Arc<ActivityExecutor>, ScenarioError> {
        let mut executors = self.executors.lock();
        let alias = def.alias().to_string();
        if executors.contains_key(&alias) {
            return Err(ScenarioError::DuplicateActivity(alias));
        }

        let type_name = def
            .activity_type()
            .ok_or_else(|| DefinitionError::from(ParamError::Missing("type".into())))?;
        let activity_type = self.types.get(&type_name)?;
        let dispenser = activity_type.motor_dispenser(&def)?;

        let executor = ActivityExecutor::with_settings(def, self.settings.clone());
        executor.set_motor_dispenser(dispenser);
        if let Err(e) = executor.start() {
            executor.stop();
            return Err(e.into());
        }
        tracing::info!("Scenario {}: activity {alias} started.", self.name);
        executors.insert(alias, Arc::clone(&executor));
        Ok(executor)
    }

    pub fn executor(&self, alias: &str) -> Option<Arc<ActivityExecutor>> {
        self.executors.lock().get(alias).cloned()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.executors.lock().keys().cloned().collect()
    }

    /// Change a parameter of a running activity. The executor reacts before this returns.
    pub fn set_param(
        &self,
        alias: &str,
        key: &str,
        value: impl ToString,
    ) -> Result<(), ScenarioError> {
        let executor = self
            .executor(alias)
            .ok_or_else(|| ScenarioError::UnknownActivity(alias.to_string()))?;
        executor.activity_def().params().set(key, value);
        Ok(())
    }

    /// Stop one activity and wait for its motors to exit. Blocks.
    pub fn stop_activity(&self, alias: &str) -> Result<ExecutorStatus, ScenarioError> {
        let executor = self
            .executors
            .lock()
            .remove(alias)
            .ok_or_else(|| ScenarioError::UnknownActivity(alias.to_string()))?;
        executor.stop();
        executor.stop_executor()?;
        Ok(executor.status())
    }

    pub fn status(&self) -> ScenarioStatus {
        let executors: Vec<_> = self.executors.lock().values().cloned().collect();
        ScenarioStatus {
            name: self.name.clone(),
            activities: executors.iter().map(|e| e.status()).collect(),
        }
    }

    pub fn status_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.status())
    }

    /// Let the activities run for `duration`, then shut every one of them down.
    pub async fn run_for(&self, duration: Duration) -> Result<ScenarioStatus, ScenarioError> {
        tracing::info!("Scenario {}: running for {duration:?}.", self.name);
        tokio::time::sleep(duration).await;
        self.shutdown().await
    }

    /// Stop every activity and wait for all executors concurrently.
    ///
    /// Returns the final status of each activity, or the first failure once all have
    /// been waited for.
    pub async fn shutdown(&self) -> Result<ScenarioStatus, ScenarioError> {
        let executors: Vec<(String, Arc<ActivityExecutor>)> =
            std::mem::take(&mut *self.executors.lock()).into_iter().collect();
        tracing::info!("Scenario {}: stopping {} activities...", self.name, executors.len());

        for (_, executor) in &executors {
            executor.stop();
        }
        let handles = executors.iter().map(|(_, executor)| {
            let executor = Arc::clone(executor);
            tokio::task::spawn_blocking(move || executor.stop_executor())
        });
        let outcomes = join_all(handles).await;

        let mut first_error = None;
        for ((alias, _), outcome) in executors.iter().zip(outcomes) {
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => ScenarioError::from(e),
                Err(e) => ScenarioError::Join {
                    alias: alias.clone(),
                    message: e.to_string(),
                },
            };
            tracing::error!("Scenario {}: {failure}", self.name);
            first_error.get_or_insert(failure);
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        tracing::info!("Done running scenario: {}!", self.name);
        Ok(ScenarioStatus {
            name: self.name.clone(),
            activities: executors.iter().map(|(_, e)| e.status()).collect(),
        })
    }
}
