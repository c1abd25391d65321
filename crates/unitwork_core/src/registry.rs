//! Per-transaction registry of entities and relation end-points.
//!
//! Each transaction owns one registry. All cross references are identity
//! keys: end-points name their owner and opposites by [`EntityId`], never by
//! pointer, so a registry can be inspected, cloned or discarded on its own.

use crate::endpoint::{RelationEndPoint, RelationEndPointId};
use crate::entity::{EntityId, EntityState, Lifecycle, PropertyContainer, PropertyValue};
use crate::error::{CoreError, CoreResult};
use std::collections::{BTreeMap, BTreeSet};

/// A registered entity.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    id: EntityId,
    container: PropertyContainer,
    lifecycle: Lifecycle,
}

impl EntityRecord {
    /// Returns the entity id.
    #[must_use]
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Returns the property container.
    #[must_use]
    pub fn container(&self) -> &PropertyContainer {
        &self.container
    }

    pub(crate) fn container_mut(&mut self) -> &mut PropertyContainer {
        &mut self.container
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }
}

/// The state of one entity, copied out of a sub-transaction's registry.
#[derive(Debug, Clone)]
pub(crate) struct EntitySnapshot {
    id: EntityId,
    state: EntityState,
    values: BTreeMap<String, PropertyValue>,
    end_points: Vec<RelationEndPoint>,
}

/// Entity and end-point tables of one transaction.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entities: BTreeMap<EntityId, EntityRecord>,
    end_points: BTreeMap<RelationEndPointId, RelationEndPoint>,
    discarded: BTreeSet<EntityId>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_existing(
        &mut self,
        id: EntityId,
        container: PropertyContainer,
    ) -> CoreResult<()> {
        self.register(id, container, Lifecycle::Existing)
    }

    pub(crate) fn register_new(
        &mut self,
        id: EntityId,
        container: PropertyContainer,
    ) -> CoreResult<()> {
        self.register(id, container, Lifecycle::New)
    }

    fn register(
        &mut self,
        id: EntityId,
        container: PropertyContainer,
        lifecycle: Lifecycle,
    ) -> CoreResult<()> {
        if self.entities.contains_key(&id) || self.discarded.contains(&id) {
            return Err(CoreError::invalid_operation(format!(
                "entity {id} is already registered"
            )));
        }
        self.entities.insert(
            id.clone(),
            EntityRecord {
                id,
                container,
                lifecycle,
            },
        );
        Ok(())
    }

    pub(crate) fn register_end_point(
        &mut self,
        end_point: impl Into<RelationEndPoint>,
    ) -> CoreResult<()> {
        let end_point = end_point.into();
        if self.end_points.contains_key(end_point.id()) {
            return Err(CoreError::invalid_operation(format!(
                "end-point {} is already registered",
                end_point.id()
            )));
        }
        self.end_points.insert(end_point.id().clone(), end_point);
        Ok(())
    }

    pub(crate) fn replace_end_point(&mut self, end_point: impl Into<RelationEndPoint>) {
        let end_point = end_point.into();
        self.end_points.insert(end_point.id().clone(), end_point);
    }

    /// Returns true if the entity has a container in this registry.
    #[must_use]
    pub fn contains_entity(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Returns a registered entity.
    #[must_use]
    pub fn entity(&self, id: &EntityId) -> Option<&EntityRecord> {
        self.entities.get(id)
    }

    pub(crate) fn entity_mut(&mut self, id: &EntityId) -> Option<&mut EntityRecord> {
        self.entities.get_mut(id)
    }

    /// Returns the number of registered entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Iterates over registered entity ids in order.
    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.entities.keys()
    }

    /// Returns the state of an entity, or `None` if it is unknown here.
    #[must_use]
    pub fn state(&self, id: &EntityId) -> Option<EntityState> {
        if self.discarded.contains(id) {
            return Some(EntityState::Discarded);
        }
        let record = self.entities.get(id)?;
        let state = match record.lifecycle {
            Lifecycle::New => EntityState::New,
            Lifecycle::Deleted => EntityState::Deleted,
            Lifecycle::Existing => {
                let relations_changed = self
                    .owned_end_points(id)
                    .any(|(_, end_point)| end_point.has_changed());
                if record.container.has_changed() || relations_changed {
                    EntityState::Changed
                } else {
                    EntityState::Existing
                }
            }
        };
        Some(state)
    }

    /// Returns true if the identity was discarded in this transaction.
    #[must_use]
    pub fn is_discarded(&self, id: &EntityId) -> bool {
        self.discarded.contains(id)
    }

    /// Returns a registered end-point.
    #[must_use]
    pub fn end_point(&self, id: &RelationEndPointId) -> Option<&RelationEndPoint> {
        self.end_points.get(id)
    }

    pub(crate) fn end_point_mut(
        &mut self,
        id: &RelationEndPointId,
    ) -> Option<&mut RelationEndPoint> {
        self.end_points.get_mut(id)
    }

    /// Returns the number of registered end-points.
    #[must_use]
    pub fn end_point_count(&self) -> usize {
        self.end_points.len()
    }

    /// Iterates over registered end-points in id order.
    pub fn end_points(&self) -> impl Iterator<Item = &RelationEndPoint> {
        self.end_points.values()
    }

    fn owned_end_points<'a>(
        &'a self,
        entity: &'a EntityId,
    ) -> impl Iterator<Item = (&'a RelationEndPointId, &'a RelationEndPoint)> + 'a {
        self.end_points
            .range(RelationEndPointId::new(entity.clone(), "")..)
            .take_while(move |(id, _)| id.entity() == entity)
    }

    /// Returns the ids of the end-points owned by `entity`.
    #[must_use]
    pub fn owned_end_point_ids(&self, entity: &EntityId) -> Vec<RelationEndPointId> {
        self.owned_end_points(entity)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns every registered end-point that currently points at `target`.
    #[must_use]
    pub fn referencing_end_point_ids(&self, target: &EntityId) -> Vec<RelationEndPointId> {
        self.end_points
            .values()
            .filter(|end_point| end_point.references(target))
            .map(|end_point| end_point.id().clone())
            .collect()
    }

    /// Returns the values to persist for an entity: its properties with every
    /// owned real end-point written back as a reference.
    #[must_use]
    pub fn persistent_values(&self, id: &EntityId) -> Option<BTreeMap<String, PropertyValue>> {
        let mut values = self.entities.get(id)?.container.to_values();
        for (end_point_id, end_point) in self.owned_end_points(id) {
            if let RelationEndPoint::Real(real) = end_point {
                values.insert(
                    end_point_id.property().to_owned(),
                    PropertyValue::Reference(real.opposite().cloned()),
                );
            }
        }
        Some(values)
    }

    /// Returns the entities that must be written on commit, with their states.
    #[must_use]
    pub fn changed_entities(&self) -> Vec<(EntityId, EntityState)> {
        self.entities
            .keys()
            .filter_map(|id| {
                let state = self.state(id)?;
                state.needs_persisting().then(|| (id.clone(), state))
            })
            .collect()
    }

    pub(crate) fn unregister_end_point(
        &mut self,
        id: &RelationEndPointId,
    ) -> Option<RelationEndPoint> {
        self.end_points.remove(id)
    }

    /// Removes an entity's container, leaving its end-points to the caller.
    pub(crate) fn remove_entity(&mut self, id: &EntityId) -> Option<EntityRecord> {
        self.entities.remove(id)
    }

    /// Drops the entity and its end-points and remembers the identity as discarded.
    pub(crate) fn discard(&mut self, id: &EntityId) {
        for end_point_id in self.owned_end_point_ids(id) {
            self.end_points.remove(&end_point_id);
        }
        self.entities.remove(id);
        self.discarded.insert(id.clone());
    }

    pub(crate) fn mark_deleted(&mut self, id: &EntityId) -> CoreResult<()> {
        let record = self
            .entities
            .get_mut(id)
            .ok_or_else(|| CoreError::entity_not_found(id))?;
        record.lifecycle = Lifecycle::Deleted;
        Ok(())
    }

    /// Copies the current state of a changed entity for transfer to a parent
    /// registry. Returns `None` for unknown or discarded entities.
    pub(crate) fn snapshot(&self, id: &EntityId) -> Option<EntitySnapshot> {
        let state = self.state(id)?;
        let values = self.persistent_values(id)?;
        let end_points = self
            .owned_end_points(id)
            .map(|(_, end_point)| end_point.clone())
            .collect();
        Some(EntitySnapshot {
            id: id.clone(),
            state,
            values,
            end_points,
        })
    }

    /// Fails if `snapshot` cannot be applied to this registry.
    ///
    /// A new entity must not be known here yet; any other entity must still
    /// be loaded.
    pub(crate) fn check_snapshot(&self, snapshot: &EntitySnapshot) -> CoreResult<()> {
        let id = &snapshot.id;
        if snapshot.state == EntityState::New {
            if self.entities.contains_key(id) || self.discarded.contains(id) {
                return Err(CoreError::invalid_operation(format!(
                    "entity {id} is already registered"
                )));
            }
        } else if !self.entities.contains_key(id) {
            return Err(CoreError::entity_not_found(id));
        }
        Ok(())
    }

    /// Applies a snapshot taken in a sub-transaction as uncommitted changes.
    pub(crate) fn apply_snapshot(&mut self, snapshot: EntitySnapshot) -> CoreResult<()> {
        let EntitySnapshot {
            id,
            state,
            values,
            end_points,
        } = snapshot;

        if state == EntityState::New {
            self.register_new(id, PropertyContainer::from_values(values))?;
            for end_point in end_points {
                self.replace_end_point(end_point);
            }
            return Ok(());
        }

        let record = self
            .entities
            .get_mut(&id)
            .ok_or_else(|| CoreError::entity_not_found(&id))?;
        for (name, value) in values {
            record.container.set(name, value);
        }
        let lifecycle = record.lifecycle;

        for end_point in end_points {
            self.merge_end_point(end_point)?;
        }

        if state == EntityState::Deleted {
            if lifecycle == Lifecycle::New {
                self.discard(&id);
            } else {
                self.mark_deleted(&id)?;
            }
        }
        Ok(())
    }

    fn merge_end_point(&mut self, end_point: RelationEndPoint) -> CoreResult<()> {
        let merged = match (self.end_points.get_mut(end_point.id()), &end_point) {
            // Nothing was read through it, so there is nothing to transfer.
            (_, source) if !source.is_complete() => true,
            (Some(RelationEndPoint::Real(target)), RelationEndPoint::Real(source)) => {
                target.set_opposite(source.opposite().cloned());
                true
            }
            (Some(RelationEndPoint::Virtual(target)), RelationEndPoint::Virtual(source))
                if target.is_complete() =>
            {
                if let Some(items) = source.opposites() {
                    target.replace_current(items.to_vec())?;
                }
                true
            }
            _ => false,
        };
        if !merged {
            self.end_points.insert(end_point.id().clone(), end_point);
        }
        Ok(())
    }

    /// Accepts every change as the new baseline.
    ///
    /// Deleted entities become discarded; new entities become existing; real
    /// end-point values are written back into their owners' containers.
    pub(crate) fn commit_all(&mut self) {
        let deleted: Vec<EntityId> = self
            .entities
            .values()
            .filter(|record| record.lifecycle == Lifecycle::Deleted)
            .map(|record| record.id.clone())
            .collect();
        for id in &deleted {
            self.discard(id);
        }

        let references: Vec<(EntityId, String, Option<EntityId>)> = self
            .end_points
            .values()
            .filter_map(RelationEndPoint::as_real)
            .map(|real| {
                (
                    real.id().entity().clone(),
                    real.id().property().to_owned(),
                    real.opposite().cloned(),
                )
            })
            .collect();
        for (owner, property, target) in references {
            if let Some(record) = self.entities.get_mut(&owner) {
                record.container.set(property, PropertyValue::Reference(target));
            }
        }

        for record in self.entities.values_mut() {
            record.container.commit_state();
            record.lifecycle = Lifecycle::Existing;
        }
        for end_point in self.end_points.values_mut() {
            end_point.commit();
        }
    }

    /// Restores every entity and end-point to its loaded state.
    ///
    /// New entities become discarded; deleted entities come back.
    pub(crate) fn rollback_all(&mut self) {
        let created: Vec<EntityId> = self
            .entities
            .values()
            .filter(|record| record.lifecycle == Lifecycle::New)
            .map(|record| record.id.clone())
            .collect();
        for id in &created {
            self.discard(id);
        }

        for record in self.entities.values_mut() {
            record.container.rollback_state();
            record.lifecycle = Lifecycle::Existing;
        }
        for end_point in self.end_points.values_mut() {
            end_point.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{RealEndPoint, VirtualEndPoint};
    use crate::metadata::Cardinality;
    use crate::types::ClassId;

    fn customer() -> EntityId {
        EntityId::new(ClassId::new("Customer"))
    }

    fn order() -> EntityId {
        EntityId::new(ClassId::new("Order"))
    }

    fn registry_with_pair() -> (Registry, EntityId, EntityId) {
        let mut registry = Registry::new();
        let customer = customer();
        let order = order();

        registry
            .register_existing(customer.clone(), PropertyContainer::new())
            .unwrap();
        registry
            .register_existing(order.clone(), PropertyContainer::new())
            .unwrap();
        registry
            .register_end_point(VirtualEndPoint::complete(
                RelationEndPointId::new(customer.clone(), "orders"),
                Cardinality::Many,
                vec![order.clone()],
            ))
            .unwrap();
        registry
            .register_end_point(RealEndPoint::new(
                RelationEndPointId::new(order.clone(), "customer"),
                Some(customer.clone()),
            ))
            .unwrap();

        (registry, customer, order)
    }

    #[test]
    fn loaded_entities_are_existing() {
        let (registry, customer, order) = registry_with_pair();
        assert_eq!(registry.state(&customer), Some(EntityState::Existing));
        assert_eq!(registry.state(&order), Some(EntityState::Existing));
        assert_eq!(registry.state(&self::order()), None);
    }

    #[test]
    fn relation_change_marks_owner_changed() {
        let (mut registry, customer, order) = registry_with_pair();
        let id = RelationEndPointId::new(order.clone(), "customer");
        registry
            .end_point_mut(&id)
            .and_then(RelationEndPoint::as_real_mut)
            .unwrap()
            .set_opposite(None);

        assert_eq!(registry.state(&order), Some(EntityState::Changed));
        assert_eq!(registry.state(&customer), Some(EntityState::Existing));
    }

    #[test]
    fn owned_end_points_are_scoped_to_owner() {
        let (registry, customer, order) = registry_with_pair();
        assert_eq!(registry.owned_end_point_ids(&customer).len(), 1);
        assert_eq!(registry.owned_end_point_ids(&order).len(), 1);
        assert_eq!(
            registry.owned_end_point_ids(&order)[0].property(),
            "customer"
        );
    }

    #[test]
    fn referencing_end_points() {
        let (registry, customer, order) = registry_with_pair();
        let referencing = registry.referencing_end_point_ids(&customer);
        assert_eq!(referencing, vec![RelationEndPointId::new(order, "customer")]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (mut registry, customer, _) = registry_with_pair();
        assert!(registry
            .register_existing(customer, PropertyContainer::new())
            .is_err());
    }

    #[test]
    fn discard_removes_owned_end_points() {
        let (mut registry, customer, _) = registry_with_pair();
        registry.discard(&customer);

        assert_eq!(registry.state(&customer), Some(EntityState::Discarded));
        assert!(registry.owned_end_point_ids(&customer).is_empty());
        assert!(registry
            .register_existing(customer, PropertyContainer::new())
            .is_err());
    }

    #[test]
    fn persistent_values_include_references() {
        let (registry, customer, order) = registry_with_pair();
        let values = registry.persistent_values(&order).unwrap();
        assert_eq!(
            values.get("customer"),
            Some(&PropertyValue::Reference(Some(customer)))
        );
    }

    #[test]
    fn commit_discards_deleted_and_accepts_changes() {
        let (mut registry, customer, order) = registry_with_pair();
        let created = self::order();
        registry
            .register_new(created.clone(), PropertyContainer::new().with("n", 1_i64))
            .unwrap();
        registry.mark_deleted(&order).unwrap();

        let changed = registry.changed_entities();
        assert_eq!(changed.len(), 2);

        registry.commit_all();
        assert_eq!(registry.state(&order), Some(EntityState::Discarded));
        assert_eq!(registry.state(&created), Some(EntityState::Existing));
        assert_eq!(registry.state(&customer), Some(EntityState::Existing));
        assert!(registry.changed_entities().is_empty());
    }

    #[test]
    fn rollback_discards_new_and_restores_deleted() {
        let (mut registry, _, order) = registry_with_pair();
        let created = self::order();
        registry
            .register_new(created.clone(), PropertyContainer::new())
            .unwrap();
        registry.mark_deleted(&order).unwrap();

        registry.rollback_all();
        assert_eq!(registry.state(&created), Some(EntityState::Discarded));
        assert_eq!(registry.state(&order), Some(EntityState::Existing));
    }

    #[test]
    fn snapshots_need_a_matching_parent_entity() {
        let (mut child, customer, order) = registry_with_pair();
        child
            .entity_mut(&order)
            .unwrap()
            .container_mut()
            .set("total", 5_i64);
        let created = self::order();
        child.register_new(created.clone(), PropertyContainer::new()).unwrap();
        let changed = child.snapshot(&order).unwrap();
        let new = child.snapshot(&created).unwrap();

        let mut parent = Registry::new();
        parent
            .register_existing(customer, PropertyContainer::new())
            .unwrap();
        assert!(matches!(
            parent.check_snapshot(&changed),
            Err(CoreError::EntityNotFound { .. })
        ));
        assert!(parent.check_snapshot(&new).is_ok());

        parent.apply_snapshot(new.clone()).unwrap();
        assert!(matches!(
            parent.check_snapshot(&new),
            Err(CoreError::InvalidOperation { .. })
        ));
    }
}
