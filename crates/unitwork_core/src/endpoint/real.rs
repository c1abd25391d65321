//! Real end-points.

use crate::endpoint::RelationEndPointId;
use crate::entity::EntityId;

/// An end-point that stores its reference value directly.
#[derive(Debug, Clone, PartialEq)]
pub struct RealEndPoint {
    id: RelationEndPointId,
    opposite: Option<EntityId>,
    original: Option<EntityId>,
}

impl RealEndPoint {
    /// Creates a real end-point whose loaded value is `opposite`.
    #[must_use]
    pub fn new(id: RelationEndPointId, opposite: Option<EntityId>) -> Self {
        Self {
            id,
            original: opposite.clone(),
            opposite,
        }
    }

    /// Creates a real end-point for a new entity with a changed value.
    #[must_use]
    pub(crate) fn with_original(
        id: RelationEndPointId,
        opposite: Option<EntityId>,
        original: Option<EntityId>,
    ) -> Self {
        Self {
            id,
            opposite,
            original,
        }
    }

    /// Returns the end-point id.
    #[must_use]
    pub fn id(&self) -> &RelationEndPointId {
        &self.id
    }

    /// Returns the referenced entity.
    #[must_use]
    pub fn opposite(&self) -> Option<&EntityId> {
        self.opposite.as_ref()
    }

    /// Returns the loaded value.
    #[must_use]
    pub fn original_opposite(&self) -> Option<&EntityId> {
        self.original.as_ref()
    }

    /// Returns true if the value differs from the loaded one.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.opposite != self.original
    }

    /// Replaces the referenced entity.
    pub fn set_opposite(&mut self, opposite: Option<EntityId>) {
        self.opposite = opposite;
    }

    pub(crate) fn commit(&mut self) {
        self.original = self.opposite.clone();
    }

    pub(crate) fn rollback(&mut self) {
        self.opposite = self.original.clone();
    }
}
