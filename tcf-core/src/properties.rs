//! String-keyed heterogeneous properties container.
//!
//! The launch framework hands one of these to a stepper run; steps read and
//! write named attributes in it as step-local state, namespaced by their
//! full-qualified id.

use serde_json::Value;
use std::collections::HashMap;

/// A string-keyed map of heterogeneous values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertiesContainer {
    values: HashMap<String, Value>,
}

impl PropertiesContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, replacing any previous value under the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Get a property value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Remove a property, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Whether a property is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Get a property as a string slice.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Get a property as an unsigned integer.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(Value::as_u64)
    }

    /// Get a property as a boolean.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    /// Set a property under a scope prefix (typically a step's
    /// full-qualified id), keeping step-local state from colliding across
    /// iteration groups.
    pub fn set_scoped(&mut self, scope: &str, key: &str, value: impl Into<Value>) {
        self.set(format!("{scope}.{key}"), value);
    }

    /// Get a property stored under a scope prefix.
    pub fn get_scoped(&self, scope: &str, key: &str) -> Option<&Value> {
        self.get(&format!("{scope}.{key}"))
    }

    /// Number of properties in the container.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the container is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
