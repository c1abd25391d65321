//! Relation end-points.
//!
//! Every relation between two entities has up to two end-points, one per
//! side. A *real* end-point stores the reference; a *virtual* end-point is the
//! derived side (for example the collection of a one-to-many relation) and is
//! loaded lazily.

mod id;
mod real;
mod virtual_end_point;

pub use id::RelationEndPointId;
pub use real::RealEndPoint;
pub use virtual_end_point::{VirtualEndPoint, VirtualEndPointData};

use crate::entity::EntityId;

/// A registered end-point.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationEndPoint {
    /// Stores the reference value.
    Real(RealEndPoint),
    /// Derived and lazily loaded.
    Virtual(VirtualEndPoint),
}

impl RelationEndPoint {
    /// Returns the end-point id.
    #[must_use]
    pub fn id(&self) -> &RelationEndPointId {
        match self {
            Self::Real(end_point) => end_point.id(),
            Self::Virtual(end_point) => end_point.id(),
        }
    }

    /// Returns true for virtual end-points.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual(_))
    }

    /// Returns true if the data is available (always for real end-points).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Real(_) => true,
            Self::Virtual(end_point) => end_point.is_complete(),
        }
    }

    /// Returns true if the end-point differs from its loaded state.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        match self {
            Self::Real(end_point) => end_point.has_changed(),
            Self::Virtual(end_point) => end_point.has_changed(),
        }
    }

    /// Returns true if the end-point currently points at `entity`.
    #[must_use]
    pub fn references(&self, entity: &EntityId) -> bool {
        match self {
            Self::Real(end_point) => end_point.opposite() == Some(entity),
            Self::Virtual(end_point) => end_point.contains(entity),
        }
    }

    /// Returns the current opposites, or `None` while incomplete.
    #[must_use]
    pub fn current_opposites(&self) -> Option<Vec<EntityId>> {
        match self {
            Self::Real(end_point) => Some(end_point.opposite().cloned().into_iter().collect()),
            Self::Virtual(end_point) => end_point.opposites().map(<[EntityId]>::to_vec),
        }
    }

    /// Returns the real end-point, if this is one.
    #[must_use]
    pub fn as_real(&self) -> Option<&RealEndPoint> {
        match self {
            Self::Real(end_point) => Some(end_point),
            Self::Virtual(_) => None,
        }
    }

    /// Returns the virtual end-point, if this is one.
    #[must_use]
    pub fn as_virtual(&self) -> Option<&VirtualEndPoint> {
        match self {
            Self::Real(_) => None,
            Self::Virtual(end_point) => Some(end_point),
        }
    }

    /// Mutable access to a real end-point.
    pub fn as_real_mut(&mut self) -> Option<&mut RealEndPoint> {
        match self {
            Self::Real(end_point) => Some(end_point),
            Self::Virtual(_) => None,
        }
    }

    /// Mutable access to a virtual end-point.
    pub fn as_virtual_mut(&mut self) -> Option<&mut VirtualEndPoint> {
        match self {
            Self::Real(_) => None,
            Self::Virtual(end_point) => Some(end_point),
        }
    }

    pub(crate) fn commit(&mut self) {
        match self {
            Self::Real(end_point) => end_point.commit(),
            Self::Virtual(end_point) => end_point.commit(),
        }
    }

    pub(crate) fn rollback(&mut self) {
        match self {
            Self::Real(end_point) => end_point.rollback(),
            Self::Virtual(end_point) => end_point.rollback(),
        }
    }
}

impl From<RealEndPoint> for RelationEndPoint {
    fn from(end_point: RealEndPoint) -> Self {
        Self::Real(end_point)
    }
}

impl From<VirtualEndPoint> for RelationEndPoint {
    fn from(end_point: VirtualEndPoint) -> Self {
        Self::Virtual(end_point)
    }
}
