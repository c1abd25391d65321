//! Property containers.

use crate::entity::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single scalar or reference property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Foreign-key-like reference to another entity.
    Reference(Option<EntityId>),
}

impl PropertyValue {
    /// Returns the referenced entity if this is a reference value.
    ///
    /// The outer `Option` is `None` for non-reference values.
    #[must_use]
    pub fn as_reference(&self) -> Option<Option<&EntityId>> {
        match self {
            Self::Reference(target) => Some(target.as_ref()),
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Option<EntityId>> for PropertyValue {
    fn from(value: Option<EntityId>) -> Self {
        Self::Reference(value)
    }
}

/// The per-transaction property bag of one entity.
///
/// A container keeps the values it was loaded with alongside the current
/// values, so changes can be detected, committed or rolled back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyContainer {
    current: BTreeMap<String, PropertyValue>,
    original: BTreeMap<String, PropertyValue>,
}

impl PropertyContainer {
    /// Creates an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a container whose loaded values are `values`.
    #[must_use]
    pub fn from_values(values: BTreeMap<String, PropertyValue>) -> Self {
        Self {
            original: values.clone(),
            current: values,
        }
    }

    /// Builder-style setter for the current value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Returns the current value of a property.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.current.get(name)
    }

    /// Returns the loaded value of a property.
    #[must_use]
    pub fn original(&self, name: &str) -> Option<&PropertyValue> {
        self.original.get(name)
    }

    /// Sets the current value of a property.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.current.insert(name.into(), value.into());
    }

    /// Returns the entity referenced by a reference property.
    #[must_use]
    pub fn reference(&self, name: &str) -> Option<EntityId> {
        self.get(name)
            .and_then(PropertyValue::as_reference)
            .flatten()
            .cloned()
    }

    /// Returns true if any value differs from the loaded one.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.current != self.original
    }

    /// Returns the names of properties whose value differs from the loaded one.
    #[must_use]
    pub fn changed_properties(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .current
            .iter()
            .filter(|(name, value)| self.original.get(*name) != Some(*value))
            .map(|(name, _)| name.as_str())
            .collect();
        names.extend(
            self.original
                .keys()
                .filter(|name| !self.current.contains_key(*name))
                .map(String::as_str),
        );
        names
    }

    /// Iterates over the current values in name order.
    pub fn values(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.current.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Returns a copy of the current values.
    #[must_use]
    pub fn to_values(&self) -> BTreeMap<String, PropertyValue> {
        self.current.clone()
    }

    /// Returns a container whose loaded values are this container's current ones.
    ///
    /// Used when a sub-transaction takes its own copy of a parent's entity.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self::from_values(self.current.clone())
    }

    /// Accepts the current values as the new baseline.
    pub fn commit_state(&mut self) {
        self.original = self.current.clone();
    }

    /// Restores the loaded values.
    pub fn rollback_state(&mut self) {
        self.current = self.original.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassId;

    #[test]
    fn loaded_container_is_unchanged() {
        let mut values = BTreeMap::new();
        values.insert("name".to_owned(), PropertyValue::from("Ada"));
        let container = PropertyContainer::from_values(values);
        assert!(!container.has_changed());
        assert!(container.changed_properties().is_empty());
    }

    #[test]
    fn set_marks_changed_and_rollback_restores() {
        let mut container = PropertyContainer::new().with("name", "Ada");
        container.commit_state();

        container.set("name", "Grace");
        assert!(container.has_changed());
        assert_eq!(container.changed_properties(), vec!["name"]);

        container.rollback_state();
        assert_eq!(container.get("name"), Some(&PropertyValue::from("Ada")));
        assert!(!container.has_changed());
    }

    #[test]
    fn reference_lookup() {
        let target = EntityId::new(ClassId::new("Customer"));
        let container = PropertyContainer::new()
            .with("customer", Some(target.clone()))
            .with("number", 7_i64);

        assert_eq!(container.reference("customer"), Some(target));
        assert_eq!(container.reference("number"), None);
        assert_eq!(container.reference("missing"), None);
    }

    #[test]
    fn snapshot_takes_current_as_baseline() {
        let mut container = PropertyContainer::new().with("n", 1_i64);
        container.commit_state();
        container.set("n", 2_i64);

        let copy = container.snapshot();
        assert!(!copy.has_changed());
        assert_eq!(copy.get("n"), Some(&PropertyValue::Int(2)));
    }
}
