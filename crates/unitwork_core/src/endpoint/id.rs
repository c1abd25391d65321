//! Relation end-point identifier.

use crate::entity::EntityId;
use std::fmt;
use std::sync::Arc;

/// Identifies one side of one relation for one entity.
///
/// Ordering groups all end-points of an entity together, which the registry
/// relies on for range scans.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationEndPointId {
    entity: EntityId,
    property: Arc<str>,
}

impl RelationEndPointId {
    /// Creates an end-point id.
    #[must_use]
    pub fn new(entity: EntityId, property: impl Into<Arc<str>>) -> Self {
        Self {
            entity,
            property: property.into(),
        }
    }

    /// Returns the owning entity.
    #[must_use]
    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    /// Returns the relation property name.
    #[must_use]
    pub fn property(&self) -> &str {
        &self.property
    }

    /// Returns the shared relation property name.
    #[must_use]
    pub fn property_arc(&self) -> &Arc<str> {
        &self.property
    }
}

impl fmt::Display for RelationEndPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.property)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassId;

    #[test]
    fn ids_of_one_entity_sort_together() {
        let a = EntityId::from_uuid(ClassId::new("Order"), uuid::Uuid::from_bytes([1; 16]));
        let b = EntityId::from_uuid(ClassId::new("Order"), uuid::Uuid::from_bytes([2; 16]));

        let mut ids = vec![
            RelationEndPointId::new(b.clone(), "customer"),
            RelationEndPointId::new(a.clone(), "items"),
            RelationEndPointId::new(a.clone(), "customer"),
        ];
        ids.sort();

        assert_eq!(ids[0].entity(), &a);
        assert_eq!(ids[0].property(), "customer");
        assert_eq!(ids[1].entity(), &a);
        assert_eq!(ids[2].entity(), &b);
    }
}
