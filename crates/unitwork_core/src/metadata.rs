//! Relation metadata.
//!
//! The engine never reads mapping files. It asks a [`RelationMetadata`]
//! service for the shape of each relation end-point: cardinality, whether
//! the end-point is real (stores the reference) or virtual (derived from the
//! opposite side), and which property on the other class is its opposite.

use crate::endpoint::RelationEndPointId;
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::types::ClassId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Number of entities an end-point can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    /// At most one.
    One,
    /// Any number, ordered.
    Many,
}

/// Storage kind of an end-point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndPointKind {
    /// Holds the reference value itself.
    Real,
    /// Derived from the real end-points that point at the owner.
    Virtual,
}

/// The opposite side of a bidirectional relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OppositeEndPoint {
    /// Class owning the opposite end-point.
    pub class: ClassId,
    /// Relation property on that class.
    pub property: Arc<str>,
}

/// Metadata for one relation property of one class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationEndPointDefinition {
    /// Owning class.
    pub class: ClassId,
    /// Relation property name.
    pub property: Arc<str>,
    /// Cardinality of this side.
    pub cardinality: Cardinality,
    /// Real or virtual.
    pub kind: EndPointKind,
    /// Opposite side, `None` for unidirectional relations.
    pub opposite: Option<OppositeEndPoint>,
}

impl RelationEndPointDefinition {
    /// Returns true for virtual end-points.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.kind == EndPointKind::Virtual
    }

    /// Returns true if the relation has an opposite side.
    #[must_use]
    pub fn is_bidirectional(&self) -> bool {
        self.opposite.is_some()
    }

    /// Returns the end-point id of this definition on `owner`.
    #[must_use]
    pub fn end_point_id(&self, owner: &EntityId) -> RelationEndPointId {
        RelationEndPointId::new(owner.clone(), self.property.clone())
    }

    /// Returns the opposite end-point id on `opposite_entity`.
    #[must_use]
    pub fn opposite_end_point_id(&self, opposite_entity: &EntityId) -> Option<RelationEndPointId> {
        self.opposite
            .as_ref()
            .map(|opposite| {
                RelationEndPointId::new(opposite_entity.clone(), opposite.property.clone())
            })
    }
}

/// Supplies relation metadata to the engine.
pub trait RelationMetadata: Send + Sync {
    /// Returns every relation end-point definition of a class.
    fn definitions_for(&self, class: &ClassId) -> Vec<RelationEndPointDefinition>;

    /// Returns the definition behind an end-point id.
    fn definition(&self, end_point: &RelationEndPointId) -> Option<RelationEndPointDefinition> {
        self.definitions_for(end_point.entity().class())
            .into_iter()
            .find(|definition| *definition.property == *end_point.property())
    }
}

/// Metadata held in memory, built with [`MetadataBuilder`].
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    by_class: BTreeMap<ClassId, Vec<RelationEndPointDefinition>>,
}

impl StaticMetadata {
    /// Returns true if the class was declared.
    #[must_use]
    pub fn knows_class(&self, class: &ClassId) -> bool {
        self.by_class.contains_key(class)
    }

    /// Iterates over the declared classes.
    pub fn classes(&self) -> impl Iterator<Item = &ClassId> {
        self.by_class.keys()
    }
}

impl RelationMetadata for StaticMetadata {
    fn definitions_for(&self, class: &ClassId) -> Vec<RelationEndPointDefinition> {
        self.by_class.get(class).cloned().unwrap_or_default()
    }

    fn definition(&self, end_point: &RelationEndPointId) -> Option<RelationEndPointDefinition> {
        self.by_class
            .get(end_point.entity().class())?
            .iter()
            .find(|definition| *definition.property == *end_point.property())
            .cloned()
    }
}

/// Programmatic builder for [`StaticMetadata`].
///
/// ```rust
/// use unitwork_core::MetadataBuilder;
///
/// let metadata = MetadataBuilder::new()
///     .one_to_many("Customer", "orders", "Order", "customer")
///     .one_to_one("Employee", "computer", "Computer", "employee")
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct MetadataBuilder {
    classes: BTreeSet<ClassId>,
    definitions: Vec<RelationEndPointDefinition>,
}

impl MetadataBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a class, with or without relations.
    #[must_use]
    pub fn class(mut self, class: &str) -> Self {
        self.classes.insert(ClassId::new(class));
        self
    }

    /// Declares a one-to-many relation.
    ///
    /// `one_class.collection` is a virtual collection; `many_class.reference`
    /// is the real end-point holding the reference.
    #[must_use]
    pub fn one_to_many(
        self,
        one_class: &str,
        collection: &str,
        many_class: &str,
        reference: &str,
    ) -> Self {
        self.pair(
            (one_class, collection, Cardinality::Many),
            (many_class, reference),
        )
    }

    /// Declares a one-to-one relation.
    ///
    /// `virtual_class.virtual_property` is derived; `real_class.real_property`
    /// holds the reference.
    #[must_use]
    pub fn one_to_one(
        self,
        virtual_class: &str,
        virtual_property: &str,
        real_class: &str,
        real_property: &str,
    ) -> Self {
        self.pair(
            (virtual_class, virtual_property, Cardinality::One),
            (real_class, real_property),
        )
    }

    /// Declares a unidirectional reference with no opposite end-point.
    #[must_use]
    pub fn unidirectional(mut self, class: &str, property: &str) -> Self {
        let class = ClassId::new(class);
        self.classes.insert(class.clone());
        self.definitions.push(RelationEndPointDefinition {
            class,
            property: Arc::from(property),
            cardinality: Cardinality::One,
            kind: EndPointKind::Real,
            opposite: None,
        });
        self
    }

    fn pair(
        mut self,
        (virtual_class, virtual_property, cardinality): (&str, &str, Cardinality),
        (real_class, real_property): (&str, &str),
    ) -> Self {
        let virtual_class = ClassId::new(virtual_class);
        let real_class = ClassId::new(real_class);
        let virtual_property: Arc<str> = Arc::from(virtual_property);
        let real_property: Arc<str> = Arc::from(real_property);

        self.classes.insert(virtual_class.clone());
        self.classes.insert(real_class.clone());
        self.definitions.push(RelationEndPointDefinition {
            class: virtual_class.clone(),
            property: virtual_property.clone(),
            cardinality,
            kind: EndPointKind::Virtual,
            opposite: Some(OppositeEndPoint {
                class: real_class.clone(),
                property: real_property.clone(),
            }),
        });
        self.definitions.push(RelationEndPointDefinition {
            class: real_class,
            property: real_property,
            cardinality: Cardinality::One,
            kind: EndPointKind::Real,
            opposite: Some(OppositeEndPoint {
                class: virtual_class,
                property: virtual_property,
            }),
        });
        self
    }

    /// Builds the metadata, rejecting duplicate relation properties.
    pub fn build(self) -> CoreResult<StaticMetadata> {
        let mut by_class: BTreeMap<ClassId, Vec<RelationEndPointDefinition>> = self
            .classes
            .into_iter()
            .map(|class| (class, Vec::new()))
            .collect();

        for definition in self.definitions {
            let entries = by_class.entry(definition.class.clone()).or_default();
            if entries.iter().any(|d| d.property == definition.property) {
                return Err(CoreError::invalid_argument(format!(
                    "relation property {}.{} declared twice",
                    definition.class, definition.property
                )));
            }
            entries.push(definition);
        }

        Ok(StaticMetadata { by_class })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> StaticMetadata {
        MetadataBuilder::new()
            .one_to_many("Customer", "orders", "Order", "customer")
            .one_to_one("Employee", "computer", "Computer", "employee")
            .unidirectional("Order", "approved_by")
            .class("Product")
            .build()
            .unwrap()
    }

    #[test]
    fn one_to_many_declares_both_sides() {
        let metadata = metadata();
        let customer = metadata.definitions_for(&ClassId::new("Customer"));
        assert_eq!(customer.len(), 1);
        assert_eq!(customer[0].kind, EndPointKind::Virtual);
        assert_eq!(customer[0].cardinality, Cardinality::Many);

        let order = metadata.definitions_for(&ClassId::new("Order"));
        let reference = order.iter().find(|d| &*d.property == "customer").unwrap();
        assert_eq!(reference.kind, EndPointKind::Real);
        assert_eq!(
            reference.opposite.as_ref().map(|o| &*o.property),
            Some("orders")
        );
    }

    #[test]
    fn unidirectional_has_no_opposite() {
        let metadata = metadata();
        let id = RelationEndPointId::new(EntityId::new(ClassId::new("Order")), "approved_by");
        let definition = metadata.definition(&id).unwrap();
        assert!(!definition.is_bidirectional());
        assert!(definition.opposite_end_point_id(id.entity()).is_none());
    }

    #[test]
    fn class_without_relations_is_known() {
        let metadata = metadata();
        assert!(metadata.knows_class(&ClassId::new("Product")));
        assert!(metadata.definitions_for(&ClassId::new("Product")).is_empty());
        assert!(metadata.definitions_for(&ClassId::new("Unknown")).is_empty());
    }

    #[test]
    fn duplicate_property_is_rejected() {
        let result = MetadataBuilder::new()
            .one_to_many("Customer", "orders", "Order", "customer")
            .unidirectional("Order", "customer")
            .build();
        assert!(matches!(result, Err(CoreError::InvalidArgument { .. })));
    }
}
