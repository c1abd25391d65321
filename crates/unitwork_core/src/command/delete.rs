//! Entity deletion.

use crate::command::{
    Command, CommandContext, CompositeCommand, ExecutionBlocker, ExpansionContext,
    RelationChangeCommand,
};
use crate::entity::{EntityId, Lifecycle};
use crate::error::{CoreError, CoreResult};
use std::fmt;

/// Deletes one entity from a transaction.
///
/// The command detaches every end-point the entity owns. A `New` entity is
/// then discarded outright; any other entity is marked `Deleted` and removed
/// from the store on commit.
///
/// Expansion adds one "remove reference" change for every end-point elsewhere
/// in the transaction that still points at the entity, so that after the
/// expanded command has run nothing references it.
#[derive(Debug)]
pub struct DeleteCommand {
    entity: EntityId,
    detach: CompositeCommand,
}

impl DeleteCommand {
    /// Builds the command for a loaded, live entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotFound`] if the entity is not loaded in
    /// the transaction and [`CoreError::InvalidState`] if it is already
    /// deleted or discarded.
    pub fn new(cx: &ExpansionContext<'_>, entity: &EntityId) -> CoreResult<Self> {
        let registry = cx.registry();
        let state = registry
            .state(entity)
            .ok_or_else(|| CoreError::entity_not_found(entity))?;
        if !state.is_live() {
            return Err(CoreError::invalid_state(entity, state, "delete"));
        }

        let detach = registry
            .owned_end_point_ids(entity)
            .iter()
            .filter_map(|id| registry.end_point(id))
            .filter_map(RelationChangeCommand::detach)
            .map(Command::RelationChange)
            .collect();

        Ok(Self {
            entity: entity.clone(),
            detach,
        })
    }

    /// Returns the entity being deleted.
    #[must_use]
    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    /// Returns the number of end-points the command detaches.
    #[must_use]
    pub fn detached_end_points(&self) -> usize {
        self.detach.len()
    }

    pub(crate) fn notify_begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        cx.events().entity_deleting(cx.transaction(), &self.entity)?;
        self.detach.notify_begin(cx)
    }

    pub(crate) fn begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        let tx = cx.transaction();
        cx.hooks()
            .each(&self.entity, |hooks| hooks.on_deleting(tx, &self.entity))?;
        self.detach.begin(cx)
    }

    pub(crate) fn perform(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.detach.perform(cx)?;

        let registry = cx.registry_mut();
        let lifecycle = registry
            .entity(&self.entity)
            .map(|record| record.lifecycle())
            .ok_or_else(|| CoreError::entity_not_found(&self.entity))?;
        match lifecycle {
            Lifecycle::New => {
                registry.discard(&self.entity);
                Ok(())
            }
            Lifecycle::Existing | Lifecycle::Deleted => registry.mark_deleted(&self.entity),
        }
    }

    pub(crate) fn end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.detach.end(cx)?;
        let tx = cx.transaction();
        cx.hooks()
            .each(&self.entity, |hooks| hooks.on_deleted(tx, &self.entity))
    }

    pub(crate) fn notify_end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.detach.notify_end(cx)?;
        cx.events().entity_deleted(cx.transaction(), &self.entity)
    }

    pub(crate) fn exceptions(&self) -> Vec<ExecutionBlocker> {
        self.detach.exceptions()
    }

    pub(crate) fn expand(self, cx: &ExpansionContext<'_>) -> CoreResult<Vec<Command>> {
        let referencing = cx.resolver().referencing_end_points(&self.entity)?;

        let mut commands = Vec::with_capacity(referencing.len() + 1);
        let fix_ups = referencing
            .into_iter()
            .map(|end_point| {
                RelationChangeCommand::remove_reference(cx, end_point, &self.entity)
                    .map(Command::RelationChange)
            })
            .collect::<CoreResult<Vec<_>>>()?;
        commands.push(Command::Delete(self));
        commands.extend(fix_ups);
        Ok(commands)
    }
}

impl fmt::Display for DeleteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delete {}", self.entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::endpoint::{RelationEndPoint, RelationEndPointId};
    use crate::entity::{EntityState, PropertyContainer};
    use crate::events::EventSink;
    use crate::hooks::HookRegistry;
    use crate::test_support::OrderGraph;
    use crate::types::{ClassId, TransactionId};

    fn expand_and_run(graph: &mut OrderGraph, entity: &EntityId) -> usize {
        let config = Config::default();
        let expanded = {
            let cx = ExpansionContext::new(
                TransactionId::new(1),
                &graph.registry,
                &graph.metadata,
                &config,
            );
            Command::Delete(DeleteCommand::new(&cx, entity).unwrap())
                .expand_to_all_related_objects(&cx)
                .unwrap()
        };
        let len = expanded.len();
        let events = EventSink::new();
        let hooks = HookRegistry::new();
        let mut cx = CommandContext::new(
            TransactionId::new(1),
            &mut graph.registry,
            &events,
            &hooks,
        );
        expanded.into_command().notify_and_perform(&mut cx).unwrap();
        len
    }

    fn referenced_anywhere(graph: &OrderGraph, entity: &EntityId) -> bool {
        graph.registry.end_points().any(|end_point| end_point.references(entity))
    }

    #[test]
    fn deleting_an_order_removes_it_from_its_customer() {
        let mut graph = OrderGraph::new();
        let order = graph.orders[0].clone();

        // Referenced once, by ada.orders.
        assert_eq!(expand_and_run(&mut graph, &order), 2);
        assert_eq!(graph.registry.state(&order), Some(EntityState::Deleted));
        assert!(!referenced_anywhere(&graph, &order));
    }

    #[test]
    fn deleting_a_customer_clears_every_order() {
        let mut graph = OrderGraph::new();
        let ada = graph.ada.clone();

        // Referenced by both orders' customer end-points.
        assert_eq!(expand_and_run(&mut graph, &ada), 3);
        assert!(!referenced_anywhere(&graph, &ada));
        for order in &graph.orders {
            assert_eq!(graph.registry.state(order), Some(EntityState::Changed));
        }
    }

    #[test]
    fn deleting_an_approver_clears_unidirectional_references() {
        let mut graph = OrderGraph::new();
        let bob = graph.bob.clone();
        assert!(referenced_anywhere(&graph, &bob));

        expand_and_run(&mut graph, &bob);
        assert!(!referenced_anywhere(&graph, &bob));
    }

    #[test]
    fn new_entities_are_discarded() {
        let mut graph = OrderGraph::new();
        let created = EntityId::new(ClassId::new("Product"));
        graph
            .registry
            .register_new(created.clone(), PropertyContainer::new())
            .unwrap();

        assert_eq!(expand_and_run(&mut graph, &created), 1);
        assert_eq!(graph.registry.state(&created), Some(EntityState::Discarded));
        assert!(!graph
            .registry
            .changed_entities()
            .iter()
            .any(|(id, _)| *id == created));
    }

    #[test]
    fn deleting_twice_fails_fast() {
        let mut graph = OrderGraph::new();
        let order = graph.orders[1].clone();
        expand_and_run(&mut graph, &order);

        let config = Config::default();
        let cx = ExpansionContext::new(
            TransactionId::new(1),
            &graph.registry,
            &graph.metadata,
            &config,
        );
        assert!(matches!(
            DeleteCommand::new(&cx, &order),
            Err(CoreError::InvalidState {
                state: EntityState::Deleted,
                ..
            })
        ));
        assert!(matches!(
            DeleteCommand::new(&cx, &EntityId::new(ClassId::new("Order"))),
            Err(CoreError::EntityNotFound { .. })
        ));
    }

    #[test]
    fn detaches_every_non_empty_owned_end_point() {
        let graph = OrderGraph::new();
        let config = Config::default();
        let cx = ExpansionContext::new(
            TransactionId::new(1),
            &graph.registry,
            &graph.metadata,
            &config,
        );

        // customer and approved_by are both set on the first order.
        let command = DeleteCommand::new(&cx, &graph.orders[0]).unwrap();
        assert_eq!(command.detached_end_points(), 2);

        let after = graph
            .registry
            .end_point(&RelationEndPointId::new(graph.orders[0].clone(), "customer"))
            .and_then(RelationEndPoint::as_real)
            .and_then(|real| real.opposite().cloned());
        assert_eq!(after, Some(graph.ada.clone()));
    }
}
