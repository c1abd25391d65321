//! Entity identifier.

use crate::types::ClassId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an entity.
///
/// An entity ID pairs the entity's class with a UUID. It names one logical
/// domain object across every transaction of a hierarchy and is:
/// - Globally unique
/// - Immutable once assigned
/// - Never reused
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    class: ClassId,
    value: Uuid,
}

impl EntityId {
    /// Creates a new random entity ID of the given class.
    #[must_use]
    pub fn new(class: ClassId) -> Self {
        Self {
            class,
            value: Uuid::new_v4(),
        }
    }

    /// Creates an entity ID from a class and a UUID.
    #[must_use]
    pub fn from_uuid(class: ClassId, value: Uuid) -> Self {
        Self { class, value }
    }

    /// Returns the entity's class.
    #[must_use]
    pub fn class(&self) -> &ClassId {
        &self.class
    }

    /// Returns the UUID part.
    #[must_use]
    pub fn value(&self) -> Uuid {
        self.value
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}/{})", self.class, self.value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_unique() {
        let class = ClassId::new("Order");
        assert_ne!(EntityId::new(class.clone()), EntityId::new(class));
    }

    #[test]
    fn same_uuid_different_class_differs() {
        let uuid = Uuid::new_v4();
        let a = EntityId::from_uuid(ClassId::new("Order"), uuid);
        let b = EntityId::from_uuid(ClassId::new("Customer"), uuid);
        assert_ne!(a, b);
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn ordering_groups_by_class() {
        let a = EntityId::from_uuid(ClassId::new("A"), Uuid::from_bytes([9; 16]));
        let b = EntityId::from_uuid(ClassId::new("B"), Uuid::from_bytes([0; 16]));
        assert!(a < b);
    }

    #[test]
    fn display() {
        let id = EntityId::from_uuid(ClassId::new("Order"), Uuid::nil());
        assert_eq!(
            format!("{id}"),
            "Order/00000000-0000-0000-0000-000000000000"
        );
    }
}
