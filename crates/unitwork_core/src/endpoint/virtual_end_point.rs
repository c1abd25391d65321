//! Virtual end-points.

use crate::endpoint::RelationEndPointId;
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::metadata::Cardinality;

/// Materialisation state of a virtual end-point.
#[derive(Debug, Clone, PartialEq)]
pub enum VirtualEndPointData {
    /// Not loaded; the next read must load the opposites.
    Incomplete,
    /// Loaded opposites, with the loaded snapshot for change detection.
    Complete {
        /// Current opposites, in order.
        current: Vec<EntityId>,
        /// Opposites as loaded.
        original: Vec<EntityId>,
    },
}

/// An end-point derived from the real end-points that reference its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualEndPoint {
    id: RelationEndPointId,
    cardinality: Cardinality,
    data: VirtualEndPointData,
}

impl VirtualEndPoint {
    /// Creates an end-point whose data has not been loaded.
    #[must_use]
    pub fn incomplete(id: RelationEndPointId, cardinality: Cardinality) -> Self {
        Self {
            id,
            cardinality,
            data: VirtualEndPointData::Incomplete,
        }
    }

    /// Creates an end-point with loaded opposites.
    #[must_use]
    pub fn complete(
        id: RelationEndPointId,
        cardinality: Cardinality,
        opposites: Vec<EntityId>,
    ) -> Self {
        Self {
            id,
            cardinality,
            data: VirtualEndPointData::Complete {
                original: opposites.clone(),
                current: opposites,
            },
        }
    }

    pub(crate) fn with_original(
        id: RelationEndPointId,
        cardinality: Cardinality,
        current: Vec<EntityId>,
        original: Vec<EntityId>,
    ) -> Self {
        Self {
            id,
            cardinality,
            data: VirtualEndPointData::Complete { current, original },
        }
    }

    /// Returns the end-point id.
    #[must_use]
    pub fn id(&self) -> &RelationEndPointId {
        &self.id
    }

    /// Returns the cardinality.
    #[must_use]
    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    /// Returns the materialisation state.
    #[must_use]
    pub fn data(&self) -> &VirtualEndPointData {
        &self.data
    }

    /// Returns true if the opposites are loaded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self.data, VirtualEndPointData::Complete { .. })
    }

    /// Returns the current opposites, or `None` while incomplete.
    #[must_use]
    pub fn opposites(&self) -> Option<&[EntityId]> {
        match &self.data {
            VirtualEndPointData::Complete { current, .. } => Some(current),
            VirtualEndPointData::Incomplete => None,
        }
    }

    /// Returns the loaded opposites, or `None` while incomplete.
    #[must_use]
    pub fn original_opposites(&self) -> Option<&[EntityId]> {
        match &self.data {
            VirtualEndPointData::Complete { original, .. } => Some(original),
            VirtualEndPointData::Incomplete => None,
        }
    }

    /// Returns true if the end-point is complete and contains `entity`.
    #[must_use]
    pub fn contains(&self, entity: &EntityId) -> bool {
        self.opposites().is_some_and(|items| items.contains(entity))
    }

    /// Returns true if complete and changed since load.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        match &self.data {
            VirtualEndPointData::Complete { current, original } => current != original,
            VirtualEndPointData::Incomplete => false,
        }
    }

    /// Loads opposites into an incomplete end-point. Complete end-points are left as is.
    pub fn mark_complete(&mut self, opposites: Vec<EntityId>) {
        if !self.is_complete() {
            self.data = VirtualEndPointData::Complete {
                original: opposites.clone(),
                current: opposites,
            };
        }
    }

    /// Drops the loaded data while keeping the end-point registered.
    pub fn mark_incomplete(&mut self) {
        self.data = VirtualEndPointData::Incomplete;
    }

    /// Appends an opposite to a collection end-point.
    pub fn add(&mut self, entity: EntityId) -> CoreResult<()> {
        self.ensure_cardinality(Cardinality::Many)?;
        let items = self.current_mut()?;
        if !items.contains(&entity) {
            items.push(entity);
        }
        Ok(())
    }

    /// Removes an opposite; missing items are ignored.
    pub fn remove(&mut self, entity: &EntityId) -> CoreResult<()> {
        let items = self.current_mut()?;
        items.retain(|item| item != entity);
        Ok(())
    }

    /// Replaces the opposite of a single-valued end-point.
    pub fn set_single(&mut self, entity: Option<EntityId>) -> CoreResult<()> {
        self.ensure_cardinality(Cardinality::One)?;
        let items = self.current_mut()?;
        items.clear();
        items.extend(entity);
        Ok(())
    }

    /// Removes every opposite.
    pub fn clear(&mut self) -> CoreResult<()> {
        self.current_mut()?.clear();
        Ok(())
    }

    /// Overwrites the current opposites, keeping the loaded snapshot.
    pub(crate) fn replace_current(&mut self, items: Vec<EntityId>) -> CoreResult<()> {
        *self.current_mut()? = items;
        Ok(())
    }

    pub(crate) fn commit(&mut self) {
        if let VirtualEndPointData::Complete { current, original } = &mut self.data {
            *original = current.clone();
        }
    }

    pub(crate) fn rollback(&mut self) {
        if let VirtualEndPointData::Complete { current, original } = &mut self.data {
            *current = original.clone();
        }
    }

    fn current_mut(&mut self) -> CoreResult<&mut Vec<EntityId>> {
        match &mut self.data {
            VirtualEndPointData::Complete { current, .. } => Ok(current),
            VirtualEndPointData::Incomplete => Err(CoreError::end_point_incomplete(&self.id)),
        }
    }

    fn ensure_cardinality(&self, expected: Cardinality) -> CoreResult<()> {
        if self.cardinality == expected {
            Ok(())
        } else {
            Err(CoreError::cardinality_mismatch(
                &self.id,
                format!("expected {expected:?}, end-point is {:?}", self.cardinality),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassId;

    fn collection() -> VirtualEndPoint {
        let owner = EntityId::new(ClassId::new("Customer"));
        VirtualEndPoint::complete(
            RelationEndPointId::new(owner, "orders"),
            Cardinality::Many,
            Vec::new(),
        )
    }

    #[test]
    fn add_and_remove_track_changes() {
        let mut end_point = collection();
        let order = EntityId::new(ClassId::new("Order"));

        end_point.add(order.clone()).unwrap();
        assert!(end_point.contains(&order));
        assert!(end_point.has_changed());

        end_point.remove(&order).unwrap();
        assert!(!end_point.has_changed());
    }

    #[test]
    fn add_is_idempotent() {
        let mut end_point = collection();
        let order = EntityId::new(ClassId::new("Order"));
        end_point.add(order.clone()).unwrap();
        end_point.add(order).unwrap();
        assert_eq!(end_point.opposites().unwrap().len(), 1);
    }

    #[test]
    fn incomplete_rejects_mutation_but_keeps_id() {
        let mut end_point = collection();
        let id = end_point.id().clone();
        end_point.mark_incomplete();

        assert!(!end_point.is_complete());
        assert_eq!(end_point.id(), &id);
        assert!(matches!(
            end_point.add(EntityId::new(ClassId::new("Order"))),
            Err(CoreError::EndPointIncomplete { .. })
        ));
    }

    #[test]
    fn set_single_requires_cardinality_one() {
        let mut end_point = collection();
        assert!(matches!(
            end_point.set_single(None),
            Err(CoreError::CardinalityMismatch { .. })
        ));
    }

    #[test]
    fn commit_and_rollback() {
        let mut end_point = collection();
        let first = EntityId::new(ClassId::new("Order"));
        let second = EntityId::new(ClassId::new("Order"));

        end_point.add(first.clone()).unwrap();
        end_point.commit();
        assert!(!end_point.has_changed());

        end_point.add(second).unwrap();
        end_point.rollback();
        assert_eq!(end_point.opposites().unwrap(), &[first][..]);
    }

    #[test]
    fn mark_complete_does_not_overwrite_loaded_data() {
        let mut end_point = collection();
        let order = EntityId::new(ClassId::new("Order"));
        end_point.add(order.clone()).unwrap();

        end_point.mark_complete(Vec::new());
        assert!(end_point.contains(&order));
    }
}
