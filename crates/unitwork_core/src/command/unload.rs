//! Unloading entities from a transaction.
//!
//! Unloading evicts an entity's data from one transaction's cache without
//! touching the store. A later access loads it again from the parent
//! transaction or the persistence provider.

use crate::command::{
    Command, CommandContext, CompositeCommand, ExecutionBlocker, ExpansionContext,
    MarkVirtualEndPointsIncompleteCommand, UnregisterEndPointsCommand,
};
use crate::endpoint::{RelationEndPoint, RelationEndPointId};
use crate::entity::{EntityId, EntityState};
use crate::error::{CoreError, CoreResult};
use std::collections::BTreeSet;
use std::fmt;

/// Unloads entities, with hooks and events around the data eviction.
///
/// Before every phase the command re-checks its data command's blockers, so
/// a blocked unload fails as a whole and never runs partially.
#[derive(Debug)]
pub struct UnloadCommand {
    entities: Vec<EntityId>,
    unload_data: Box<Command>,
}

impl UnloadCommand {
    /// Wraps a data eviction command for `entities`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidArgument`] if `entities` is empty.
    pub fn new(entities: Vec<EntityId>, unload_data: impl Into<Command>) -> CoreResult<Self> {
        if entities.is_empty() {
            return Err(CoreError::invalid_argument(
                "unload requires at least one entity",
            ));
        }
        Ok(Self {
            entities,
            unload_data: Box::new(unload_data.into()),
        })
    }

    /// Returns the unloaded entities.
    #[must_use]
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    fn ensure_can_execute(&self) -> CoreResult<()> {
        self.unload_data.ensure_can_execute()
    }

    pub(crate) fn notify_begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.ensure_can_execute()?;
        cx.events().entities_unloading(cx.transaction(), &self.entities)?;
        self.unload_data.notify_begin(cx)
    }

    pub(crate) fn begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.ensure_can_execute()?;
        let tx = cx.transaction();
        for entity in &self.entities {
            cx.hooks().each(entity, |hooks| hooks.on_unloading(tx, entity))?;
        }
        self.unload_data.begin(cx)
    }

    pub(crate) fn perform(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.ensure_can_execute()?;
        self.unload_data.perform(cx)
    }

    pub(crate) fn end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.ensure_can_execute()?;
        self.unload_data.end(cx)?;
        let tx = cx.transaction();
        for entity in self.entities.iter().rev() {
            cx.hooks().each(entity, |hooks| hooks.on_unloaded(tx, entity))?;
        }
        Ok(())
    }

    pub(crate) fn notify_end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.ensure_can_execute()?;
        self.unload_data.notify_end(cx)?;
        cx.events().entities_unloaded(cx.transaction(), &self.entities)
    }

    pub(crate) fn exceptions(&self) -> Vec<ExecutionBlocker> {
        self.unload_data.exceptions()
    }
}

impl fmt::Display for UnloadCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unload {} entities", self.entities.len())
    }
}

/// Evicts entity data from one registry.
///
/// Entities not loaded in the registry are ignored. The eviction is a
/// composite of an [`UnregisterEndPointsCommand`] for the entities' own
/// end-points and a [`MarkVirtualEndPointsIncompleteCommand`] for complete
/// virtual end-points of other entities that contain them; after both have
/// run the property containers are removed.
#[derive(Debug)]
pub struct UnloadDataCommand {
    entities: Vec<EntityId>,
    parts: CompositeCommand,
    blockers: Vec<ExecutionBlocker>,
}

impl UnloadDataCommand {
    /// Builds the eviction for the loaded subset of `entities`.
    ///
    /// # Errors
    ///
    /// Fails if an end-point of the registry cannot be resolved.
    pub fn new(cx: &ExpansionContext<'_>, entities: &[EntityId]) -> CoreResult<Self> {
        let registry = cx.registry();
        let mut loaded: Vec<EntityId> = Vec::new();
        let mut blockers = Vec::new();
        for entity in entities {
            if !registry.contains_entity(entity) || loaded.contains(entity) {
                continue;
            }
            match registry.state(entity) {
                Some(EntityState::Existing) | None => {}
                Some(state) => blockers.push(ExecutionBlocker::for_entity(
                    entity,
                    format!("has pending changes (state {state})"),
                )),
            }
            loaded.push(entity.clone());
        }

        let owned: Vec<RelationEndPointId> = loaded
            .iter()
            .flat_map(|entity| registry.owned_end_point_ids(entity))
            .collect();
        let mut opposite: Vec<RelationEndPointId> = Vec::new();
        for entity in &loaded {
            for id in registry.referencing_end_point_ids(entity) {
                let other_virtual = !loaded.contains(id.entity())
                    && registry.end_point(&id).is_some_and(RelationEndPoint::is_virtual);
                if other_virtual && !opposite.contains(&id) {
                    opposite.push(id);
                }
            }
        }

        let mut parts = CompositeCommand::default();
        parts.push(UnregisterEndPointsCommand::new(cx, owned)?);
        parts.push(MarkVirtualEndPointsIncompleteCommand::new(cx, opposite)?);
        Ok(Self {
            entities: loaded,
            parts,
            blockers,
        })
    }

    /// Blocks the eviction of entities that a sub-transaction below this
    /// registry still holds with pending changes.
    ///
    /// Evicting them here would leave the sub-transaction nothing to commit
    /// into.
    #[must_use]
    pub fn with_changes_below(mut self, changed_below: &BTreeSet<EntityId>) -> Self {
        for entity in self.entities.iter().filter(|entity| changed_below.contains(*entity)) {
            self.blockers.push(ExecutionBlocker::for_entity(
                entity,
                "has pending changes in an open sub-transaction",
            ));
        }
        self
    }

    /// Returns the entities that will be evicted.
    #[must_use]
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Returns true if nothing is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Returns true if `entity` could be evicted from the registry of `cx`
    /// right now.
    #[must_use]
    pub fn can_unload(cx: &ExpansionContext<'_>, entity: &EntityId) -> bool {
        Self::new(cx, std::slice::from_ref(entity))
            .is_ok_and(|command| command.exceptions().is_empty())
    }

    pub(crate) fn notify_begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.parts.notify_begin(cx)
    }

    pub(crate) fn begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.parts.begin(cx)
    }

    pub(crate) fn perform(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.parts.perform(cx)?;
        for entity in &self.entities {
            cx.registry_mut().remove_entity(entity);
        }
        Ok(())
    }

    pub(crate) fn end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.parts.end(cx)
    }

    pub(crate) fn notify_end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.parts.notify_end(cx)
    }

    pub(crate) fn exceptions(&self) -> Vec<ExecutionBlocker> {
        let mut blockers = self.blockers.clone();
        blockers.extend(self.parts.exceptions());
        blockers
    }
}

impl fmt::Display for UnloadDataCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unload data of {} entities", self.entities.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventSink;
    use crate::hooks::HookRegistry;
    use crate::test_support::OrderGraph;
    use crate::types::TransactionId;

    fn run(graph: &mut OrderGraph, command: impl Into<Command>) -> CoreResult<()> {
        let events = EventSink::new();
        let hooks = HookRegistry::new();
        let mut cx = CommandContext::new(
            TransactionId::new(1),
            &mut graph.registry,
            &events,
            &hooks,
        );
        command.into().notify_and_perform(&mut cx)
    }

    fn unload_data(graph: &OrderGraph, entities: &[EntityId]) -> UnloadDataCommand {
        let config = Config::default();
        let cx = ExpansionContext::new(
            TransactionId::new(1),
            &graph.registry,
            &graph.metadata,
            &config,
        );
        UnloadDataCommand::new(&cx, entities).unwrap()
    }

    #[test]
    fn empty_entity_set_fails_at_construction() {
        assert!(matches!(
            UnloadCommand::new(Vec::new(), Command::Nop),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn unloading_an_order_invalidates_its_customer_collection() {
        let mut graph = OrderGraph::new();
        let order = graph.orders[0].clone();
        let data = unload_data(&graph, std::slice::from_ref(&order));
        assert!(data.exceptions().is_empty());

        run(&mut graph, UnloadCommand::new(vec![order.clone()], data).unwrap()).unwrap();

        assert!(!graph.registry.contains_entity(&order));
        assert!(graph.registry.owned_end_point_ids(&order).is_empty());
        let orders = graph
            .registry
            .end_point(&RelationEndPointId::new(graph.ada.clone(), "orders"))
            .unwrap();
        assert!(!orders.is_complete());
    }

    #[test]
    fn changed_entities_block_the_whole_unload() {
        let mut graph = OrderGraph::new();
        let (changed, clean) = (graph.orders[0].clone(), graph.orders[1].clone());
        graph
            .registry
            .entity_mut(&changed)
            .unwrap()
            .container_mut()
            .set("total", 99_i64);

        let data = unload_data(&graph, &[changed.clone(), clean.clone()]);
        assert_eq!(data.exceptions().len(), 1);

        let result = run(
            &mut graph,
            UnloadCommand::new(vec![changed, clean.clone()], data).unwrap(),
        );
        assert!(matches!(result, Err(CoreError::CommandBlocked { .. })));
        assert!(graph.registry.contains_entity(&clean));
    }

    #[test]
    fn entities_not_loaded_are_ignored() {
        let graph = OrderGraph::new();
        let stranger = EntityId::new(crate::types::ClassId::new("Order"));
        let data = unload_data(&graph, &[stranger, graph.grace.clone()]);
        assert_eq!(data.entities(), std::slice::from_ref(&graph.grace));
    }

    #[test]
    fn can_unload_checks_opposite_collections() {
        let mut graph = OrderGraph::new();
        let (ada, order) = (graph.ada.clone(), graph.orders[0].clone());
        graph
            .registry
            .end_point_mut(&RelationEndPointId::new(ada, "orders"))
            .and_then(RelationEndPoint::as_virtual_mut)
            .unwrap()
            .remove(&graph.orders[1])
            .unwrap();

        let config = Config::default();
        let cx = ExpansionContext::new(
            TransactionId::new(1),
            &graph.registry,
            &graph.metadata,
            &config,
        );
        assert!(!UnloadDataCommand::can_unload(&cx, &order));
        assert!(UnloadDataCommand::can_unload(&cx, &graph.grace));
    }

    #[test]
    fn eviction_runs_through_unregister_and_mark_incomplete() {
        let graph = OrderGraph::new();
        let data = unload_data(&graph, &[graph.orders[0].clone(), graph.ada.clone()]);
        let Command::UnregisterEndPoints(unregister) = data.parts.iter().next().unwrap() else {
            panic!("first part must unregister end-points");
        };
        assert_eq!(unregister.end_points().len(), 3);
        let Command::MarkIncomplete(mark) = data.parts.iter().nth(1).unwrap() else {
            panic!("second part must mark end-points incomplete");
        };
        // ada.orders is unregistered with its owner, not marked incomplete.
        assert!(mark.end_points().is_empty());
    }

    #[test]
    fn entities_changed_in_a_sub_transaction_block_eviction() {
        let mut graph = OrderGraph::new();
        let order = graph.orders[1].clone();
        let changed_below = BTreeSet::from([order.clone()]);
        let data = unload_data(&graph, &[order.clone(), graph.grace.clone()])
            .with_changes_below(&changed_below);
        assert_eq!(data.exceptions().len(), 1);
        assert_eq!(data.exceptions()[0].subject(), order.to_string());

        let result = run(&mut graph, UnloadCommand::new(data.entities().to_vec(), data).unwrap());
        assert!(matches!(result, Err(CoreError::CommandBlocked { .. })));
        assert!(graph.registry.contains_entity(&order));
    }
}
