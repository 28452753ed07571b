//! Shared runtime configuration of the CSE server.

use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Serialize;
use serde_json::Value;

use crate::util::dict::get_path;
use crate::util::dict::set_path;

/// Path of the enabled flag toggled through `PUT /system`.
pub const SERVICE_ENABLED_PATH: &str = "service.enabled";
/// Path of the template definitions loaded from the catalog at startup.
pub const TEMPLATES_PATH: &str = "broker.templates";

/// Nested configuration addressed by dotted paths, behind a single lock.
#[derive(Debug, Default)]
pub struct ServerConfig {
    inner: Mutex<Value>,
}

impl ServerConfig {
    pub fn new(value: Value) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Builds the runtime view of a loaded config file.
    pub fn from_serializable<T: Serialize>(config: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_value(config)?))
    }

    pub fn get_value_at(&self, path: &str) -> Option<Value> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        get_path(&inner, path).cloned()
    }

    pub fn set_value_at(&self, path: &str, value: Value) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        set_path(&mut inner, path, value);
    }

    pub fn snapshot(&self) -> Value {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.get_value_at(SERVICE_ENABLED_PATH)
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.set_value_at(SERVICE_ENABLED_PATH, Value::Bool(enabled));
    }

    pub fn bool_at(&self, path: &str) -> bool {
        self.get_value_at(path)
            .and_then(|v| v.as_bool())
            .unwrap_or_default()
    }

    pub fn string_at(&self, path: &str) -> Option<String> {
        self.get_value_at(path)
            .and_then(|v| v.as_str().map(str::to_string))
    }
}
