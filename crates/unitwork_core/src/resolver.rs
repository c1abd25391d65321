//! Finding the end-points that reference an entity.

use crate::config::Config;
use crate::endpoint::{RelationEndPoint, RelationEndPointId};
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::metadata::RelationMetadata;
use crate::registry::Registry;
use std::collections::BTreeSet;

/// Walks one registry to find every end-point that points at an entity.
///
/// Bidirectional relations are followed from the entity's own end-points to
/// their opposites, so the result never requires a scan of the whole graph.
/// References through unidirectional relations have no opposite to follow;
/// when enabled in [`Config`], registered real end-points are scanned for
/// them instead.
#[derive(Clone, Copy)]
pub struct OppositeEndPointResolver<'a> {
    registry: &'a Registry,
    metadata: &'a dyn RelationMetadata,
    include_unidirectional: bool,
}

impl<'a> OppositeEndPointResolver<'a> {
    /// Creates a resolver over `registry`.
    #[must_use]
    pub fn new(
        registry: &'a Registry,
        metadata: &'a dyn RelationMetadata,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            metadata,
            include_unidirectional: config.fix_up_unidirectional_references,
        }
    }

    /// Returns the end-points, other than the entity's own, that currently
    /// reference `entity`, in id order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EndPointIncomplete`] if one of the entity's
    /// virtual end-points is not loaded, and [`CoreError::EndPointNotFound`]
    /// if the opposite of a loaded reference is not registered.
    pub fn referencing_end_points(&self, entity: &EntityId) -> CoreResult<Vec<RelationEndPointId>> {
        let mut found = BTreeSet::new();

        for id in self.registry.owned_end_point_ids(entity) {
            let definition = self
                .metadata
                .definition(&id)
                .ok_or_else(|| CoreError::unknown_relation(&id))?;
            if !definition.is_bidirectional() {
                continue;
            }
            let opposites = self
                .registry
                .end_point(&id)
                .and_then(RelationEndPoint::current_opposites)
                .ok_or_else(|| CoreError::end_point_incomplete(&id))?;

            for opposite in opposites.iter().filter(|opposite| *opposite != entity) {
                let Some(opposite_id) = definition.opposite_end_point_id(opposite) else {
                    continue;
                };
                let end_point = self
                    .registry
                    .end_point(&opposite_id)
                    .ok_or_else(|| CoreError::end_point_not_found(&opposite_id))?;
                // An incomplete opposite is reconciled when it is next loaded.
                if end_point.references(entity) {
                    found.insert(opposite_id);
                }
            }
        }

        if self.include_unidirectional {
            found.extend(self.unidirectional_references(entity));
        }
        Ok(found.into_iter().collect())
    }

    fn unidirectional_references(&self, entity: &EntityId) -> Vec<RelationEndPointId> {
        self.registry
            .end_points()
            .filter_map(RelationEndPoint::as_real)
            .filter(|real| real.opposite() == Some(entity) && real.id().entity() != entity)
            .filter(|real| {
                self.metadata
                    .definition(real.id())
                    .is_some_and(|definition| !definition.is_bidirectional())
            })
            .map(|real| real.id().clone())
            .collect()
    }
}

impl std::fmt::Debug for OppositeEndPointResolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OppositeEndPointResolver")
            .field("include_unidirectional", &self.include_unidirectional)
            .finish_non_exhaustive()
    }
}
