//! Removing end-points from a registry.

use crate::command::{CommandContext, ExecutionBlocker, ExpansionContext};
use crate::endpoint::RelationEndPointId;
use crate::error::{CoreError, CoreResult};
use std::fmt;

/// Removes end-points from the registry on `perform`.
///
/// A low-level building block with no events or hooks. Real end-points lose
/// their value; a removed virtual end-point is registered again as incomplete
/// on its next access.
#[derive(Debug, Clone, PartialEq)]
pub struct UnregisterEndPointsCommand {
    end_points: Vec<RelationEndPointId>,
    blockers: Vec<ExecutionBlocker>,
}

impl UnregisterEndPointsCommand {
    /// Builds the command.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EndPointNotFound`] for an end-point that is not
    /// registered.
    pub fn new(cx: &ExpansionContext<'_>, end_points: Vec<RelationEndPointId>) -> CoreResult<Self> {
        let mut blockers = Vec::new();
        for id in &end_points {
            let end_point = cx
                .registry()
                .end_point(id)
                .ok_or_else(|| CoreError::end_point_not_found(id))?;
            if end_point.has_changed() {
                blockers.push(ExecutionBlocker::for_end_point(id, "end-point has changed"));
            }
        }
        Ok(Self {
            end_points,
            blockers,
        })
    }

    /// Returns the end-points to remove.
    #[must_use]
    pub fn end_points(&self) -> &[RelationEndPointId] {
        &self.end_points
    }

    pub(crate) fn notify_begin(&mut self, _: &mut CommandContext<'_>) -> CoreResult<()> {
        Ok(())
    }

    pub(crate) fn begin(&mut self, _: &mut CommandContext<'_>) -> CoreResult<()> {
        Ok(())
    }

    pub(crate) fn perform(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        for id in &self.end_points {
            cx.registry_mut().unregister_end_point(id);
        }
        Ok(())
    }

    pub(crate) fn end(&mut self, _: &mut CommandContext<'_>) -> CoreResult<()> {
        Ok(())
    }

    pub(crate) fn notify_end(&mut self, _: &mut CommandContext<'_>) -> CoreResult<()> {
        Ok(())
    }

    pub(crate) fn exceptions(&self) -> Vec<ExecutionBlocker> {
        self.blockers.clone()
    }
}

impl fmt::Display for UnregisterEndPointsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unregister {} end-points", self.end_points.len())
    }
}
