//! Parameter store: the live, observable configuration of one activity.
//!
//! A [`ParameterMap`] maps string keys to string values and parses them on read
//! through typed accessors. Every mutation notifies each registered
//! [`ParameterListener`] exactly once, synchronously, on the mutating thread and
//! before the mutating call returns. Reconfiguration is therefore immediate: once
//! `set("threads", "8")` returns, every listener (typically an
//! [`ActivityExecutor`](crate::executor::ActivityExecutor)) has already acted on it.
//!
//! No internal lock is held while listeners run, so a listener may read the map
//! freely, and may even mutate it (which notifies again, re-entrantly).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParamError;

/// Observer of parameter changes.
pub trait ParameterListener: Send + Sync {
    /// Called after every mutation of `params`.
    fn handle_parameter_map_update(&self, params: &ParameterMap);
}

/// Named activity parameters with change notification.
#[derive(Default)]
pub struct ParameterMap {
    values: RwLock<BTreeMap<String, String>>,
    // Weak so that a listener owning (a definition owning) this map is not kept alive by it.
    listeners: Mutex<Vec<Weak<dyn ParameterListener>>>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self {
            values: RwLock::new(values),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Parse the `key=value;key=value;` form.
    ///
    /// Whitespace around keys and values is trimmed, empty entries are skipped and a
    /// later occurrence of a key overrides an earlier one.
    pub fn parse(input: &str) -> Result<Self, ParamError> {
        let mut values = BTreeMap::new();
        for entry in input.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| ParamError::Malformed(entry.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ParamError::Malformed(entry.to_string()));
            }
            values.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Self::from_map(values))
    }

    /// Register a listener. Dead listeners are pruned on the next notification.
    pub fn add_listener(&self, listener: Weak<dyn ParameterListener>) {
        self.listeners.lock().push(listener);
    }

    /// Number of listeners that are still alive.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// A copy of the current contents.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.read().clone()
    }

    pub fn get_string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Read and parse `key`. `Ok(None)` when absent; an error when present but unparseable.
    pub fn get_as<T: FromStr>(
        &self,
        key: &str,
        expected: &'static str,
    ) -> Result<Option<T>, ParamError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ParamError::Invalid {
                key: key.to_string(),
                value,
                expected,
            })
    }

    pub fn get_i64_or(&self, key: &str, default: i64) -> Result<i64, ParamError> {
        Ok(self.get_as(key, "an integer")?.unwrap_or(default))
    }

    pub fn get_u64_or(&self, key: &str, default: u64) -> Result<u64, ParamError> {
        Ok(self.get_as(key, "a non-negative integer")?.unwrap_or(default))
    }

    pub fn get_usize_or(&self, key: &str, default: usize) -> Result<usize, ParamError> {
        Ok(self.get_as(key, "a non-negative integer")?.unwrap_or(default))
    }

    pub fn get_f64_or(&self, key: &str, default: f64) -> Result<f64, ParamError> {
        Ok(self.get_as(key, "a number")?.unwrap_or(default))
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool, ParamError> {
        Ok(self.get_as(key, "true or false")?.unwrap_or(default))
    }

    /// Set one parameter and notify listeners.
    pub fn set(&self, key: impl Into<String>, value: impl ToString) {
        self.values.write().insert(key.into(), value.to_string());
        self.notify();
    }

    /// Set several parameters as a single mutation: listeners are notified once.
    pub fn set_all<K, V, I>(&self, entries: I)
    where
        K: Into<String>,
        V: ToString,
        I: IntoIterator<Item = (K, V)>,
    {
        {
            let mut values = self.values.write();
            for (key, value) in entries {
                values.insert(key.into(), value.to_string());
            }
        }
        self.notify();
    }

    /// Remove a parameter. Listeners are notified only if something was removed.
    pub fn remove(&self, key: &str) -> Option<String> {
        let removed = self.values.write().remove(key);
        if removed.is_some() {
            self.notify();
        }
        removed
    }

    fn notify(&self) {
        let live: Vec<Arc<dyn ParameterListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.handle_parameter_map_update(self);
        }
    }
}

impl fmt::Display for ParameterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.values.read().iter() {
            write!(f, "{key}={value};")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ParameterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterMap")
            .field("values", &*self.values.read())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl Serialize for ParameterMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.read().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ParameterMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer).map(Self::from_map)
    }
}
