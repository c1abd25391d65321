//! The session: a transaction hierarchy with its collaborators.
//!
//! All user-level operations take the transaction they act in. Entities and
//! virtual end-points are loaded lazily: the root reads from the
//! [`PersistenceProvider`], a sub-transaction reads from its parent's
//! current, uncommitted state.

use crate::command::{
    Command, CommandContext, DeleteCommand, ExpandedCommand, ExpansionContext,
    MarkVirtualEndPointsIncompleteCommand, RelationChangeCommand, UnloadCommand,
    UnloadDataCommand,
};
use crate::config::Config;
use crate::endpoint::{RealEndPoint, RelationEndPoint, RelationEndPointId, VirtualEndPoint};
use crate::entity::{EntityId, EntityState, PropertyContainer, PropertyValue};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventSink, LifecycleFeed, TransactionListener};
use crate::hooks::{EntityHooks, HookRegistry};
use crate::metadata::{Cardinality, OppositeEndPoint, RelationEndPointDefinition, RelationMetadata};
use crate::provider::{ChangeKind, ChangeSet, EntityChange, PersistenceProvider};
use crate::registry::{EntityRecord, Registry};
use crate::transaction::{HierarchyExecutor, Transaction, TransactionScope, UnlockGuard};
use crate::types::{ClassId, TransactionId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// A unit of work over an object graph.
///
/// The session starts with a root transaction. Sub-transactions are created
/// with [`create_sub_transaction`](Self::create_sub_transaction); while one is
/// open its parent is read-only.
pub struct Session {
    config: Config,
    metadata: Arc<dyn RelationMetadata>,
    provider: Arc<dyn PersistenceProvider>,
    events: EventSink,
    hooks: HookRegistry,
    transactions: BTreeMap<TransactionId, Transaction>,
    discarded: BTreeSet<TransactionId>,
    root: TransactionId,
    next_id: TransactionId,
    current: Option<TransactionId>,
}

impl Session {
    /// Creates a session with an empty root transaction.
    #[must_use]
    pub fn new(
        config: Config,
        metadata: Arc<dyn RelationMetadata>,
        provider: Arc<dyn PersistenceProvider>,
    ) -> Self {
        let root = TransactionId::new(1);
        let mut transactions = BTreeMap::new();
        transactions.insert(root, Transaction::root(root));
        Self {
            config,
            metadata,
            provider,
            events: EventSink::new(),
            hooks: HookRegistry::new(),
            transactions,
            discarded: BTreeSet::new(),
            root,
            next_id: root.next(),
            current: None,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the relation metadata.
    #[must_use]
    pub fn metadata(&self) -> &dyn RelationMetadata {
        self.metadata.as_ref()
    }

    /// Returns the persistence provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn PersistenceProvider> {
        &self.provider
    }

    /// Returns the event sink.
    #[must_use]
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Adds a listener to every transaction of the session.
    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.events.add_listener(listener);
    }

    /// Creates a [`LifecycleFeed`], registers it as a listener and returns it.
    pub fn lifecycle_feed(&self) -> Arc<LifecycleFeed> {
        let feed = Arc::new(LifecycleFeed::with_max_history(self.config.feed_history));
        self.events.add_listener(feed.clone());
        feed
    }

    /// Registers entity hooks for a class.
    pub fn register_hooks(&mut self, class: impl Into<ClassId>, hooks: Arc<dyn EntityHooks>) {
        self.hooks.register(class.into(), hooks);
    }

    /// Returns the hook registry.
    #[must_use]
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    // =========================================================================
    // Hierarchy
    // =========================================================================

    fn node(&self, tx: TransactionId) -> CoreResult<&Transaction> {
        self.transactions
            .get(&tx)
            .ok_or_else(|| missing_transaction(tx, self.discarded.contains(&tx)))
    }

    fn node_mut(&mut self, tx: TransactionId) -> CoreResult<&mut Transaction> {
        let discarded = self.discarded.contains(&tx);
        self.transactions
            .get_mut(&tx)
            .ok_or_else(|| missing_transaction(tx, discarded))
    }

    /// Returns the root transaction.
    #[must_use]
    pub fn root(&self) -> TransactionId {
        self.root
    }

    /// Returns the current transaction, or the leaf of the hierarchy if no
    /// scope is active.
    ///
    /// # Errors
    ///
    /// Returns an error if the current transaction was discarded.
    pub fn active_transaction(&self) -> CoreResult<TransactionId> {
        match self.current {
            Some(tx) => self.node(tx).map(Transaction::id),
            None => self.leaf_of(self.root),
        }
    }

    /// Returns the innermost transaction below `tx`, or `tx` itself.
    ///
    /// # Errors
    ///
    /// Returns an error if `tx` is unknown or discarded.
    pub fn leaf_of(&self, tx: TransactionId) -> CoreResult<TransactionId> {
        let mut node = self.node(tx)?;
        while let Some(child) = node.child() {
            node = self.node(child)?;
        }
        Ok(node.id())
    }

    /// Returns the parent of `tx`.
    ///
    /// # Errors
    ///
    /// Returns an error if `tx` is unknown or discarded.
    pub fn parent_of(&self, tx: TransactionId) -> CoreResult<Option<TransactionId>> {
        Ok(self.node(tx)?.parent())
    }

    /// Returns the open sub-transaction of `tx`.
    ///
    /// # Errors
    ///
    /// Returns an error if `tx` is unknown or discarded.
    pub fn child_of(&self, tx: TransactionId) -> CoreResult<Option<TransactionId>> {
        Ok(self.node(tx)?.child())
    }

    /// Returns true if `tx` has an open sub-transaction and is not unlocked.
    ///
    /// # Errors
    ///
    /// Returns an error if `tx` is unknown or discarded.
    pub fn is_read_only(&self, tx: TransactionId) -> CoreResult<bool> {
        Ok(self.node(tx)?.is_read_only())
    }

    /// Returns every level of the hierarchy containing `tx`, from its leaf up
    /// to the root.
    ///
    /// # Errors
    ///
    /// Returns an error if `tx` is unknown or discarded.
    pub fn hierarchy_from_leaf(&self, tx: TransactionId) -> CoreResult<Vec<TransactionId>> {
        let mut levels = Vec::new();
        let mut next = Some(self.leaf_of(tx)?);
        while let Some(level) = next {
            levels.push(level);
            next = self.node(level)?.parent();
        }
        Ok(levels)
    }

    fn depth_of(&self, tx: TransactionId) -> CoreResult<usize> {
        let mut depth = 1;
        let mut node = self.node(tx)?;
        while let Some(parent) = node.parent() {
            depth += 1;
            node = self.node(parent)?;
        }
        Ok(depth)
    }

    /// Returns the registry of `tx` for inspection.
    ///
    /// # Errors
    ///
    /// Returns an error if `tx` is unknown or discarded.
    pub fn registry(&self, tx: TransactionId) -> CoreResult<&Registry> {
        Ok(&self.node(tx)?.registry)
    }

    /// Opens a sub-transaction of `parent`. The parent becomes read-only.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `parent` already has an open
    /// sub-transaction and [`CoreError::HierarchyTooDeep`] past the configured
    /// depth.
    pub fn create_sub_transaction(&mut self, parent: TransactionId) -> CoreResult<TransactionId> {
        if let Some(child) = self.node(parent)?.child() {
            return Err(CoreError::invalid_operation(format!(
                "{parent} already has an open sub-transaction {child}"
            )));
        }
        if self.depth_of(parent)? >= self.config.max_hierarchy_depth {
            return Err(CoreError::HierarchyTooDeep {
                limit: self.config.max_hierarchy_depth,
            });
        }

        let id = self.next_id;
        self.next_id = id.next();
        self.transactions.insert(id, Transaction::child_of(id, parent));
        self.node_mut(parent)?.set_child(Some(id));
        debug!(transaction = %id, parent = %parent, "created sub-transaction");
        Ok(id)
    }

    /// Discards a sub-transaction and everything below it without applying
    /// their changes. The parent becomes writable again.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for the root transaction.
    pub fn discard(&mut self, tx: TransactionId) -> CoreResult<()> {
        let Some(parent) = self.node(tx)?.parent() else {
            return Err(CoreError::invalid_operation(
                "the root transaction cannot be discarded",
            ));
        };

        let mut next = Some(tx);
        while let Some(level) = next {
            next = self.transactions.remove(&level).and_then(|node| node.child());
            self.discarded.insert(level);
            debug!(transaction = %level, "discarded transaction");
        }
        self.node_mut(parent)?.set_child(None);
        Ok(())
    }

    /// Makes `tx` the current transaction until the returned scope is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `tx` is unknown or discarded.
    pub fn enter(&mut self, tx: TransactionId) -> CoreResult<TransactionScope<'_>> {
        self.node(tx)?;
        trace!(transaction = %tx, "entering transaction scope");
        Ok(TransactionScope::new(self, tx))
    }

    /// Returns the transaction made current by the innermost active scope.
    #[must_use]
    pub fn current_transaction(&self) -> Option<TransactionId> {
        self.current
    }

    pub(crate) fn replace_current(&mut self, tx: Option<TransactionId>) -> Option<TransactionId> {
        std::mem::replace(&mut self.current, tx)
    }

    /// Makes a read-only transaction writable until the guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `tx` is unknown or discarded.
    pub fn unlock(&mut self, tx: TransactionId) -> CoreResult<UnlockGuard<'_>> {
        let node = self.node_mut(tx)?;
        let was_unlocked = node.is_unlocked();
        node.set_unlocked(true);
        trace!(transaction = %tx, "unlocked transaction");
        Ok(UnlockGuard::new(self, tx, was_unlocked))
    }

    pub(crate) fn set_unlocked(&mut self, tx: TransactionId, unlocked: bool) {
        if let Some(node) = self.transactions.get_mut(&tx) {
            node.set_unlocked(unlocked);
        }
    }

    fn ensure_writable(&self, tx: TransactionId) -> CoreResult<()> {
        self.node(tx)?.ensure_writable()
    }

    // =========================================================================
    // Loading
    // =========================================================================

    fn definition(&self, end_point: &RelationEndPointId) -> CoreResult<RelationEndPointDefinition> {
        self.metadata
            .definition(end_point)
            .ok_or_else(|| CoreError::unknown_relation(end_point))
    }

    /// Loads `id` into `tx` if it is not registered there and returns its state.
    fn ensure_loaded(&mut self, tx: TransactionId, id: &EntityId) -> CoreResult<EntityState> {
        if let Some(state) = self.node(tx)?.registry.state(id) {
            return Ok(state);
        }

        let container = match self.node(tx)?.parent() {
            Some(parent) => {
                let state = self.ensure_loaded(parent, id)?;
                if !state.is_live() {
                    self.node_mut(tx)?.registry.discard(id);
                    return Ok(EntityState::Discarded);
                }
                let values = self
                    .node(parent)?
                    .registry
                    .persistent_values(id)
                    .ok_or_else(|| CoreError::entity_not_found(id))?;
                PropertyContainer::from_values(values)
            }
            None => self.provider.load_properties(id)?,
        };

        let definitions = self.metadata.definitions_for(id.class());
        let registry = &mut self.node_mut(tx)?.registry;
        for definition in &definitions {
            let end_point_id = definition.end_point_id(id);
            if registry.end_point(&end_point_id).is_some() {
                continue;
            }
            if definition.is_virtual() {
                registry.replace_end_point(VirtualEndPoint::incomplete(
                    end_point_id,
                    definition.cardinality,
                ));
            } else {
                let opposite = container.reference(&definition.property);
                registry.replace_end_point(RealEndPoint::new(end_point_id, opposite));
            }
        }
        registry.register_existing(id.clone(), container)?;
        debug!(transaction = %tx, entity = %id, "loaded entity");
        Ok(EntityState::Existing)
    }

    /// Ensures the end-point is registered and, if virtual, complete.
    fn ensure_end_point(
        &mut self,
        tx: TransactionId,
        end_point: &RelationEndPointId,
    ) -> CoreResult<()> {
        let definition = self.definition(end_point)?;
        let owner = end_point.entity();
        let state = self.ensure_loaded(tx, owner)?;
        if state == EntityState::Discarded {
            return Err(CoreError::invalid_state(owner, state, "read relations of"));
        }

        let registry = &self.node(tx)?.registry;
        if registry
            .end_point(end_point)
            .is_some_and(RelationEndPoint::is_complete)
        {
            return Ok(());
        }

        if !definition.is_virtual() {
            let opposite = registry
                .entity(owner)
                .and_then(|record| record.container().reference(end_point.property()));
            self.node_mut(tx)?
                .registry
                .replace_end_point(RealEndPoint::new(end_point.clone(), opposite));
            return Ok(());
        }

        let Some(opposite) = definition.opposite.clone() else {
            return Err(CoreError::unknown_relation(end_point));
        };
        let loaded = match self.node(tx)?.parent() {
            Some(parent) => {
                self.ensure_end_point(parent, end_point)?;
                self.node(parent)?
                    .registry
                    .end_point(end_point)
                    .and_then(RelationEndPoint::current_opposites)
                    .ok_or_else(|| CoreError::end_point_incomplete(end_point))?
            }
            None => self.provider.load_related(&definition, owner)?,
        };

        let registry = &mut self.node_mut(tx)?.registry;
        let items = reconcile(registry, owner, &opposite, loaded, definition.cardinality);
        trace!(
            transaction = %tx,
            end_point = %end_point,
            count = items.len(),
            "loaded virtual end-point"
        );
        match registry
            .end_point_mut(end_point)
            .and_then(RelationEndPoint::as_virtual_mut)
        {
            Some(virtual_end_point) => virtual_end_point.mark_complete(items),
            None => registry.replace_end_point(VirtualEndPoint::complete(
                end_point.clone(),
                definition.cardinality,
                items,
            )),
        }
        Ok(())
    }

    fn current_opposites(
        &self,
        tx: TransactionId,
        end_point: &RelationEndPointId,
    ) -> CoreResult<Vec<EntityId>> {
        self.node(tx)?
            .registry
            .end_point(end_point)
            .and_then(RelationEndPoint::current_opposites)
            .ok_or_else(|| CoreError::end_point_incomplete(end_point))
    }

    fn ensure_live(
        &mut self,
        tx: TransactionId,
        id: &EntityId,
        operation: &'static str,
    ) -> CoreResult<()> {
        let state = self.ensure_loaded(tx, id)?;
        if state.is_live() {
            Ok(())
        } else {
            Err(CoreError::invalid_state(id, state, operation))
        }
    }

    /// Loads what a relation change on `end_point` touches: the end-point,
    /// the opposites of its current and `extra` items, and for single-valued
    /// opposites the end-point they would be taken from.
    fn prepare_relation(
        &mut self,
        tx: TransactionId,
        end_point: &RelationEndPointId,
        extra: &[EntityId],
    ) -> CoreResult<()> {
        self.ensure_end_point(tx, end_point)?;
        let definition = self.definition(end_point)?;
        if !definition.is_bidirectional() {
            return Ok(());
        }

        let mut neighbours = self.current_opposites(tx, end_point)?;
        neighbours.extend(extra.iter().cloned());
        for neighbour in &neighbours {
            let Some(opposite) = definition.opposite_end_point_id(neighbour) else {
                continue;
            };
            self.ensure_end_point(tx, &opposite)?;

            let single = self
                .metadata
                .definition(&opposite)
                .is_some_and(|d| d.cardinality == Cardinality::One);
            if !single {
                continue;
            }
            for displaced in self.current_opposites(tx, &opposite)? {
                if displaced != *end_point.entity() {
                    let displaced = RelationEndPointId::new(
                        displaced,
                        end_point.property_arc().clone(),
                    );
                    self.ensure_end_point(tx, &displaced)?;
                }
            }
        }
        Ok(())
    }

    /// Loads every end-point a delete of `id` detaches.
    fn prepare_delete(&mut self, tx: TransactionId, id: &EntityId) -> CoreResult<()> {
        for definition in self.metadata.definitions_for(id.class()) {
            let end_point = definition.end_point_id(id);
            self.ensure_end_point(tx, &end_point)?;
            if !definition.is_bidirectional() {
                continue;
            }
            for opposite in self.current_opposites(tx, &end_point)? {
                if let Some(opposite_id) = definition.opposite_end_point_id(&opposite) {
                    self.ensure_end_point(tx, &opposite_id)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn expansion_context(&self, tx: TransactionId) -> CoreResult<ExpansionContext<'_>> {
        Ok(ExpansionContext::new(
            tx,
            &self.node(tx)?.registry,
            self.metadata.as_ref(),
            &self.config,
        ))
    }

    // =========================================================================
    // Entities
    // =========================================================================

    /// Returns the property container of an entity, loading it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotFound`] if the entity does not exist and
    /// [`CoreError::InvalidState`] if it was discarded in `tx`.
    pub fn get_entity(
        &mut self,
        tx: TransactionId,
        id: &EntityId,
    ) -> CoreResult<&PropertyContainer> {
        let state = self.ensure_loaded(tx, id)?;
        if state == EntityState::Discarded {
            return Err(CoreError::invalid_state(id, state, "load"));
        }
        self.node(tx)?
            .registry
            .entity(id)
            .map(EntityRecord::container)
            .ok_or_else(|| CoreError::entity_not_found(id))
    }

    /// Returns a property value. For a real relation property this is the
    /// current reference.
    ///
    /// # Errors
    ///
    /// Fails as [`get_entity`](Self::get_entity) does.
    pub fn get_property(
        &mut self,
        tx: TransactionId,
        id: &EntityId,
        name: &str,
    ) -> CoreResult<Option<PropertyValue>> {
        self.get_entity(tx, id)?;
        let registry = &self.node(tx)?.registry;
        let end_point_id = RelationEndPointId::new(id.clone(), name);
        if let Some(RelationEndPoint::Real(real)) = registry.end_point(&end_point_id) {
            return Ok(Some(PropertyValue::Reference(real.opposite().cloned())));
        }
        Ok(registry
            .entity(id)
            .and_then(|record| record.container().get(name).cloned()))
    }

    /// Sets a plain property.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidArgument`] for relation properties and
    /// [`CoreError::InvalidState`] unless the entity is live.
    pub fn set_property(
        &mut self,
        tx: TransactionId,
        id: &EntityId,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> CoreResult<()> {
        self.ensure_writable(tx)?;
        self.ensure_live(tx, id, "modify")?;
        if self
            .metadata
            .definition(&RelationEndPointId::new(id.clone(), name))
            .is_some()
        {
            return Err(CoreError::invalid_argument(format!(
                "{name} is a relation property of {}",
                id.class()
            )));
        }
        self.node_mut(tx)?
            .registry
            .entity_mut(id)
            .ok_or_else(|| CoreError::entity_not_found(id))?
            .container_mut()
            .set(name, value);
        Ok(())
    }

    /// Creates a new entity of `class` in `tx`. Its relations start empty.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionReadOnly`] if `tx` is read-only.
    pub fn new_entity(
        &mut self,
        tx: TransactionId,
        class: impl Into<ClassId>,
    ) -> CoreResult<EntityId> {
        self.ensure_writable(tx)?;
        let id = EntityId::new(class.into());
        let definitions = self.metadata.definitions_for(id.class());

        let registry = &mut self.node_mut(tx)?.registry;
        registry.register_new(id.clone(), PropertyContainer::new())?;
        for definition in &definitions {
            let end_point_id = definition.end_point_id(&id);
            if definition.is_virtual() {
                registry.register_end_point(VirtualEndPoint::complete(
                    end_point_id,
                    definition.cardinality,
                    Vec::new(),
                ))?;
            } else {
                registry.register_end_point(RealEndPoint::new(end_point_id, None))?;
            }
        }
        debug!(transaction = %tx, entity = %id, "created entity");
        Ok(id)
    }

    /// Returns the state of an entity in `tx`, or `None` if it is not loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if `tx` is unknown or discarded.
    pub fn entity_state(
        &self,
        tx: TransactionId,
        id: &EntityId,
    ) -> CoreResult<Option<EntityState>> {
        Ok(self.node(tx)?.registry.state(id))
    }

    /// Returns the entities a commit of `tx` would write, with their states.
    ///
    /// # Errors
    ///
    /// Returns an error if `tx` is unknown or discarded.
    pub fn entities_to_persist(
        &self,
        tx: TransactionId,
    ) -> CoreResult<Vec<(EntityId, EntityState)>> {
        Ok(self.node(tx)?.registry.changed_entities())
    }

    // =========================================================================
    // Relations
    // =========================================================================

    /// Returns the opposite of a single-valued relation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CardinalityMismatch`] for collections.
    pub fn related(
        &mut self,
        tx: TransactionId,
        id: &EntityId,
        property: &str,
    ) -> CoreResult<Option<EntityId>> {
        let end_point_id = RelationEndPointId::new(id.clone(), property);
        self.ensure_end_point(tx, &end_point_id)?;
        match self.node(tx)?.registry.end_point(&end_point_id) {
            Some(RelationEndPoint::Real(real)) => Ok(real.opposite().cloned()),
            Some(RelationEndPoint::Virtual(virtual_end_point))
                if virtual_end_point.cardinality() == Cardinality::One =>
            {
                Ok(virtual_end_point
                    .opposites()
                    .and_then(<[EntityId]>::first)
                    .cloned())
            }
            Some(_) => Err(CoreError::cardinality_mismatch(
                &end_point_id,
                "use related_many for collections",
            )),
            None => Err(CoreError::end_point_not_found(&end_point_id)),
        }
    }

    /// Returns the items of a collection relation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CardinalityMismatch`] for single-valued relations.
    pub fn related_many(
        &mut self,
        tx: TransactionId,
        id: &EntityId,
        property: &str,
    ) -> CoreResult<Vec<EntityId>> {
        let end_point_id = RelationEndPointId::new(id.clone(), property);
        self.ensure_end_point(tx, &end_point_id)?;
        match self.node(tx)?.registry.end_point(&end_point_id) {
            Some(RelationEndPoint::Virtual(virtual_end_point))
                if virtual_end_point.cardinality() == Cardinality::Many =>
            {
                virtual_end_point
                    .opposites()
                    .map(<[EntityId]>::to_vec)
                    .ok_or_else(|| CoreError::end_point_incomplete(&end_point_id))
            }
            Some(_) => Err(CoreError::cardinality_mismatch(
                &end_point_id,
                "use related for single-valued relations",
            )),
            None => Err(CoreError::end_point_not_found(&end_point_id)),
        }
    }

    /// Sets a single-valued relation and updates every opposite end-point.
    ///
    /// # Errors
    ///
    /// Fails if either entity is not live, the relation is a collection or
    /// `target` has the wrong class.
    pub fn set_related(
        &mut self,
        tx: TransactionId,
        id: &EntityId,
        property: &str,
        target: Option<&EntityId>,
    ) -> CoreResult<()> {
        self.ensure_writable(tx)?;
        self.ensure_live(tx, id, "relate")?;
        if let Some(target) = target {
            self.ensure_live(tx, target, "relate to")?;
        }
        let end_point = RelationEndPointId::new(id.clone(), property);
        let extra: Vec<EntityId> = target.into_iter().cloned().collect();
        self.prepare_relation(tx, &end_point, &extra)?;

        let cx = self.expansion_context(tx)?;
        let command = RelationChangeCommand::set(&cx, end_point, target.cloned())?;
        self.run_relation_change(tx, command)
    }

    /// Adds `item` to a collection relation, taking it from its previous owner.
    ///
    /// # Errors
    ///
    /// Fails if either entity is not live or the relation is not a collection.
    pub fn add_related(
        &mut self,
        tx: TransactionId,
        id: &EntityId,
        property: &str,
        item: &EntityId,
    ) -> CoreResult<()> {
        self.ensure_writable(tx)?;
        self.ensure_live(tx, id, "relate")?;
        self.ensure_live(tx, item, "relate to")?;
        let end_point = RelationEndPointId::new(id.clone(), property);
        self.prepare_relation(tx, &end_point, std::slice::from_ref(item))?;

        let cx = self.expansion_context(tx)?;
        let command = RelationChangeCommand::add(&cx, end_point, item.clone())?;
        self.run_relation_change(tx, command)
    }

    /// Removes `item` from a collection relation.
    ///
    /// # Errors
    ///
    /// Fails if the collection does not contain `item`.
    pub fn remove_related(
        &mut self,
        tx: TransactionId,
        id: &EntityId,
        property: &str,
        item: &EntityId,
    ) -> CoreResult<()> {
        self.ensure_writable(tx)?;
        self.ensure_live(tx, id, "relate")?;
        let end_point = RelationEndPointId::new(id.clone(), property);
        self.prepare_relation(tx, &end_point, &[])?;

        let cx = self.expansion_context(tx)?;
        let command = RelationChangeCommand::remove(&cx, end_point, item.clone())?;
        self.run_relation_change(tx, command)
    }

    fn run_relation_change(
        &mut self,
        tx: TransactionId,
        command: RelationChangeCommand,
    ) -> CoreResult<()> {
        let expanded = {
            let cx = self.expansion_context(tx)?;
            Command::from(command).expand_to_all_related_objects(&cx)?
        };
        debug!(transaction = %tx, command = %expanded, "changing relation");
        self.run_command(tx, expanded.into_command())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Deletes an entity and detaches it from every loaded relation.
    ///
    /// A new entity is discarded at once; an existing one stays registered as
    /// deleted until commit.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotFound`] if the entity does not exist and
    /// [`CoreError::InvalidState`] unless it is live.
    pub fn delete(&mut self, tx: TransactionId, id: &EntityId) -> CoreResult<()> {
        self.ensure_writable(tx)?;
        let command = self.delete_command(tx, id)?;
        debug!(transaction = %tx, entity = %id, fix_ups = command.len() - 1, "deleting entity");
        self.run_command(tx, command.into_command())
    }

    /// Builds the expanded delete command for `id` without running it.
    ///
    /// # Errors
    ///
    /// Fails as [`delete`](Self::delete) does.
    pub fn delete_command(
        &mut self,
        tx: TransactionId,
        id: &EntityId,
    ) -> CoreResult<ExpandedCommand> {
        if self.ensure_loaded(tx, id)?.is_live() {
            self.prepare_delete(tx, id)?;
        }
        let cx = self.expansion_context(tx)?;
        Command::from(DeleteCommand::new(&cx, id)?).expand_to_all_related_objects(&cx)
    }

    // =========================================================================
    // Unload
    // =========================================================================

    fn check_unload(&self, tx: TransactionId, entities: &[EntityId]) -> CoreResult<()> {
        if entities.is_empty() {
            return Err(CoreError::invalid_argument("nothing to unload"));
        }
        if self.config.strict_unload {
            let levels = self.hierarchy_from_leaf(tx)?;
            for entity in entities {
                let loaded = levels.iter().any(|level| {
                    self.transactions
                        .get(level)
                        .is_some_and(|node| node.registry.contains_entity(entity))
                });
                if !loaded {
                    return Err(CoreError::entity_not_found(entity));
                }
            }
        }
        Ok(())
    }

    /// Returns the entities with pending changes in any sub-transaction
    /// below `tx`.
    fn changed_below(&self, tx: TransactionId) -> CoreResult<BTreeSet<EntityId>> {
        let mut changed = BTreeSet::new();
        let mut next = self.node(tx)?.child();
        while let Some(child) = next {
            let node = self.node(child)?;
            changed.extend(node.registry.changed_entities().into_iter().map(|(id, _)| id));
            next = node.child();
        }
        Ok(changed)
    }

    /// Builds the data eviction of `entities` for one level.
    fn unload_data_command(
        &self,
        level: TransactionId,
        entities: &[EntityId],
    ) -> CoreResult<UnloadDataCommand> {
        let changed_below = self.changed_below(level)?;
        let cx = self.expansion_context(level)?;
        Ok(UnloadDataCommand::new(&cx, entities)?.with_changes_below(&changed_below))
    }

    /// Unloads entities from every level of the hierarchy, leaf first.
    ///
    /// Levels where an entity is not loaded are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CommandBlocked`] at the first level where an
    /// entity has pending changes. Levels already unloaded stay unloaded.
    pub fn unload(&mut self, tx: TransactionId, entities: &[EntityId]) -> CoreResult<()> {
        self.check_unload(tx, entities)?;
        debug!(transaction = %tx, count = entities.len(), "unloading entities");
        HierarchyExecutor::new(unload_factory(entities)).execute_for_hierarchy(self, tx)
    }

    /// Like [`unload`](Self::unload), but returns `Ok(false)` at the first
    /// level that cannot unload instead of failing.
    ///
    /// # Errors
    ///
    /// Fails on argument and event errors.
    pub fn try_unload(&mut self, tx: TransactionId, entities: &[EntityId]) -> CoreResult<bool> {
        self.check_unload(tx, entities)?;
        debug!(transaction = %tx, count = entities.len(), "trying to unload entities");
        HierarchyExecutor::new(unload_factory(entities)).try_execute_for_hierarchy(self, tx)
    }

    /// Evicts entity data from every level without raising events or hooks.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CommandBlocked`] at the first level where an
    /// entity has pending changes.
    pub fn unload_data(&mut self, tx: TransactionId, entities: &[EntityId]) -> CoreResult<()> {
        self.check_unload(tx, entities)?;
        HierarchyExecutor::new(move |session: &mut Session, level: TransactionId| {
            let data = session.unload_data_command(level, entities)?;
            if data.is_empty() {
                return Ok(Command::Nop);
            }
            let command = Command::from(data);
            command.ensure_can_execute()?;
            Ok(command)
        })
        .execute_for_hierarchy(self, tx)
    }

    /// Marks a virtual end-point incomplete on every level, so its next read
    /// loads it again.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidArgument`] for real end-points and
    /// [`CoreError::CommandBlocked`] where the end-point has changed.
    pub fn unload_virtual_end_point(
        &mut self,
        tx: TransactionId,
        end_point: &RelationEndPointId,
    ) -> CoreResult<()> {
        self.check_virtual(end_point)?;
        HierarchyExecutor::new(mark_incomplete_factory(end_point, true))
            .execute_for_hierarchy(self, tx)
    }

    /// Like [`unload_virtual_end_point`](Self::unload_virtual_end_point), but
    /// returns `Ok(false)` at the first level where the end-point has changed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidArgument`] for real end-points.
    pub fn try_unload_virtual_end_point(
        &mut self,
        tx: TransactionId,
        end_point: &RelationEndPointId,
    ) -> CoreResult<bool> {
        self.check_virtual(end_point)?;
        HierarchyExecutor::new(mark_incomplete_factory(end_point, false))
            .try_execute_for_hierarchy(self, tx)
    }

    fn check_virtual(&self, end_point: &RelationEndPointId) -> CoreResult<()> {
        if self.definition(end_point)?.is_virtual() {
            Ok(())
        } else {
            Err(CoreError::invalid_argument(format!("{end_point} is a real end-point")))
        }
    }

    /// Unloads every entity without pending changes from every level.
    ///
    /// An entity is kept at a level while a sub-transaction below that level
    /// still holds pending changes to it.
    ///
    /// # Errors
    ///
    /// Fails on event, hook and listener errors.
    pub fn unload_all(&mut self, tx: TransactionId) -> CoreResult<()> {
        debug!(transaction = %tx, "unloading all unchanged entities");
        HierarchyExecutor::new(|session: &mut Session, level: TransactionId| {
            let changed_below = session.changed_below(level)?;
            let cx = session.expansion_context(level)?;
            let candidates: Vec<EntityId> = cx
                .registry()
                .entity_ids()
                .filter(|id| !changed_below.contains(*id))
                .filter(|id| UnloadDataCommand::can_unload(&cx, id))
                .cloned()
                .collect();
            let data = UnloadDataCommand::new(&cx, &candidates)?.with_changes_below(&changed_below);
            if data.is_empty() {
                return Ok(Command::Nop);
            }
            Ok(UnloadCommand::new(data.entities().to_vec(), data)?.into())
        })
        .execute_for_hierarchy(self, tx)
    }

    // =========================================================================
    // Commands, commit and rollback
    // =========================================================================

    /// Runs a command in `tx` through all five phases.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionReadOnly`] if `tx` is read-only, and
    /// any error raised by the command.
    pub fn execute(&mut self, tx: TransactionId, command: impl Into<Command>) -> CoreResult<()> {
        self.run_command(tx, command.into())
    }

    pub(crate) fn run_command(
        &mut self,
        tx: TransactionId,
        mut command: Command,
    ) -> CoreResult<()> {
        let Self {
            transactions,
            discarded,
            events,
            hooks,
            ..
        } = self;
        let node = transactions
            .get_mut(&tx)
            .ok_or_else(|| missing_transaction(tx, discarded.contains(&tx)))?;
        node.ensure_writable()?;
        let mut cx = CommandContext::new(tx, &mut node.registry, events, hooks);
        command.notify_and_perform(&mut cx)
    }

    /// Commits `tx`.
    ///
    /// The root writes its changes through the persistence provider; a
    /// sub-transaction applies them to its parent as uncommitted changes.
    /// Afterwards every entity in `tx` is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionReadOnly`] while `tx` has an open
    /// sub-transaction, [`CoreError::EntityNotFound`] if a changed entity is
    /// no longer loaded in the parent, and any listener veto or provider
    /// error. Nothing is committed on error.
    pub fn commit(&mut self, tx: TransactionId) -> CoreResult<()> {
        let node = self.node(tx)?;
        node.ensure_writable()?;
        let parent = node.parent();
        let changed = node.registry.changed_entities();
        let ids: Vec<EntityId> = changed.iter().map(|(id, _)| id.clone()).collect();
        self.events.committing(tx, &ids)?;

        match parent {
            None => {
                let changes = change_set(&node.registry, &changed);
                self.provider.save(&changes)?;
            }
            Some(parent) => {
                let snapshots: Vec<_> = changed
                    .iter()
                    .filter_map(|(id, _)| node.registry.snapshot(id))
                    .collect();
                for snapshot in &snapshots {
                    self.node(parent)?.registry.check_snapshot(snapshot)?;
                }
                let mut unlocked = self.unlock(parent)?;
                let registry = &mut unlocked.node_mut(parent)?.registry;
                for snapshot in snapshots {
                    registry.apply_snapshot(snapshot)?;
                }
            }
        }

        self.node_mut(tx)?.registry.commit_all();
        debug!(transaction = %tx, count = ids.len(), "committed transaction");
        self.events.committed(tx, &ids)
    }

    /// Reverts every uncommitted change in `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionReadOnly`] if `tx` is read-only.
    pub fn rollback(&mut self, tx: TransactionId) -> CoreResult<()> {
        let node = self.node_mut(tx)?;
        node.ensure_writable()?;
        node.registry.rollback_all();
        debug!(transaction = %tx, "rolled back transaction");
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("root", &self.root)
            .field("transactions", &self.transactions.len())
            .field("current", &self.current)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

fn missing_transaction(transaction: TransactionId, discarded: bool) -> CoreError {
    if discarded {
        CoreError::TransactionDiscarded { transaction }
    } else {
        CoreError::TransactionNotFound { transaction }
    }
}

/// Adjusts loaded collection data to the references already known locally.
///
/// Items whose real end-point here points elsewhere, or that were discarded
/// here, are dropped; local real end-points pointing at `owner` are added.
fn reconcile(
    registry: &Registry,
    owner: &EntityId,
    opposite: &OppositeEndPoint,
    loaded: Vec<EntityId>,
    cardinality: Cardinality,
) -> Vec<EntityId> {
    let mut items: Vec<EntityId> = loaded
        .into_iter()
        .filter(|item| !registry.is_discarded(item))
        .filter(|item| {
            registry
                .end_point(&RelationEndPointId::new(item.clone(), opposite.property.clone()))
                .map_or(true, |real| real.references(owner))
        })
        .collect();

    for id in registry.referencing_end_point_ids(owner) {
        let is_opposite = *id.property() == *opposite.property
            && *id.entity().class() == opposite.class
            && registry.end_point(&id).is_some_and(|end_point| !end_point.is_virtual());
        if is_opposite && !items.contains(id.entity()) {
            items.push(id.entity().clone());
        }
    }

    if cardinality == Cardinality::One {
        items.truncate(1);
    }
    items
}

fn change_set(registry: &Registry, changed: &[(EntityId, EntityState)]) -> ChangeSet {
    let changes = changed
        .iter()
        .map(|(id, state)| {
            let kind = match state {
                EntityState::New => ChangeKind::Insert,
                EntityState::Deleted => ChangeKind::Delete,
                _ => ChangeKind::Update,
            };
            let properties = match kind {
                ChangeKind::Delete => BTreeMap::new(),
                _ => registry.persistent_values(id).unwrap_or_default(),
            };
            EntityChange {
                id: id.clone(),
                kind,
                properties,
            }
        })
        .collect();
    ChangeSet { changes }
}

fn unload_factory(
    entities: &[EntityId],
) -> impl FnMut(&mut Session, TransactionId) -> CoreResult<Command> + '_ {
    move |session: &mut Session, level: TransactionId| {
        let data = session.unload_data_command(level, entities)?;
        if data.is_empty() {
            return Ok(Command::Nop);
        }
        Ok(UnloadCommand::new(data.entities().to_vec(), data)?.into())
    }
}

fn mark_incomplete_factory(
    end_point: &RelationEndPointId,
    guarded: bool,
) -> impl FnMut(&mut Session, TransactionId) -> CoreResult<Command> + '_ {
    move |session: &mut Session, level: TransactionId| {
        let cx = session.expansion_context(level)?;
        if !cx
            .registry()
            .end_point(end_point)
            .is_some_and(RelationEndPoint::is_complete)
        {
            return Ok(Command::Nop);
        }
        let command = Command::from(MarkVirtualEndPointsIncompleteCommand::new(
            &cx,
            vec![end_point.clone()],
        )?);
        if guarded {
            command.ensure_can_execute()?;
        }
        Ok(command)
    }
}
