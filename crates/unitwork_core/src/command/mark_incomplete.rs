//! Invalidating virtual end-points.

use crate::command::{CommandContext, ExecutionBlocker, ExpansionContext};
use crate::endpoint::{RelationEndPoint, RelationEndPointId};
use crate::error::{CoreError, CoreResult};
use std::fmt;

/// Drops the loaded data of virtual end-points while keeping them registered.
///
/// The next read of such an end-point loads its opposites again.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkVirtualEndPointsIncompleteCommand {
    end_points: Vec<RelationEndPointId>,
    blockers: Vec<ExecutionBlocker>,
}

impl MarkVirtualEndPointsIncompleteCommand {
    /// Builds the command.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EndPointNotFound`] for an end-point that is not
    /// registered and [`CoreError::InvalidArgument`] for a real end-point.
    pub fn new(cx: &ExpansionContext<'_>, end_points: Vec<RelationEndPointId>) -> CoreResult<Self> {
        let mut blockers = Vec::new();
        for id in &end_points {
            let end_point = cx
                .registry()
                .end_point(id)
                .ok_or_else(|| CoreError::end_point_not_found(id))?
                .as_virtual()
                .ok_or_else(|| {
                    CoreError::invalid_argument(format!("{id} is a real end-point"))
                })?;
            if end_point.is_complete() && end_point.has_changed() {
                blockers.push(ExecutionBlocker::for_end_point(id, "end-point has changed"));
            }
        }
        Ok(Self {
            end_points,
            blockers,
        })
    }

    /// Returns the end-points to invalidate.
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
        let registry = cx.registry_mut();
        for id in &self.end_points {
            if let Some(end_point) = registry
                .end_point_mut(id)
                .and_then(RelationEndPoint::as_virtual_mut)
            {
                end_point.mark_incomplete();
            }
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

impl fmt::Display for MarkVirtualEndPointsIncompleteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mark {} end-points incomplete", self.end_points.len())
    }
}
