//! Per-entity lifecycle hooks.
//!
//! Hooks are the business-level callbacks of an entity class ("about to be
//! deleted", "relation changed"). They run in the `begin`/`end` phases of a
//! command, inside the `notify_begin`/`notify_end` events of the
//! [`crate::events::EventSink`].

use crate::entity::EntityId;
use crate::error::CoreResult;
use crate::events::RelationDelta;
use crate::types::{ClassId, TransactionId};
use std::collections::HashMap;
use std::sync::Arc;

/// Callbacks for entities of one class. All methods default to no-ops.
#[allow(unused_variables)]
pub trait EntityHooks: Send + Sync {
    /// The entity is about to be deleted.
    fn on_deleting(&self, transaction: TransactionId, entity: &EntityId) -> CoreResult<()> {
        Ok(())
    }

    /// The entity was deleted.
    fn on_deleted(&self, transaction: TransactionId, entity: &EntityId) -> CoreResult<()> {
        Ok(())
    }

    /// The entity is about to be unloaded.
    fn on_unloading(&self, transaction: TransactionId, entity: &EntityId) -> CoreResult<()> {
        Ok(())
    }

    /// The entity was unloaded.
    fn on_unloaded(&self, transaction: TransactionId, entity: &EntityId) -> CoreResult<()> {
        Ok(())
    }

    /// A relation of the entity is about to change.
    fn on_relation_changing(
        &self,
        transaction: TransactionId,
        delta: &RelationDelta,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// A relation of the entity changed.
    fn on_relation_changed(
        &self,
        transaction: TransactionId,
        delta: &RelationDelta,
    ) -> CoreResult<()> {
        Ok(())
    }
}

/// Hooks registered per entity class.
#[derive(Default)]
pub struct HookRegistry {
    by_class: HashMap<ClassId, Vec<Arc<dyn EntityHooks>>>,
}

impl HookRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers hooks for a class. Hooks run in registration order.
    pub fn register(&mut self, class: ClassId, hooks: Arc<dyn EntityHooks>) {
        self.by_class.entry(class).or_default().push(hooks);
    }

    /// Returns the hooks registered for a class.
    #[must_use]
    pub fn hooks_for(&self, class: &ClassId) -> &[Arc<dyn EntityHooks>] {
        self.by_class.get(class).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Calls `f` with every hook of the entity's class, stopping at the first error.
    pub(crate) fn each(
        &self,
        entity: &EntityId,
        f: impl Fn(&dyn EntityHooks) -> CoreResult<()>,
    ) -> CoreResult<()> {
        for hooks in self.hooks_for(entity.class()) {
            f(hooks.as_ref())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("classes", &self.by_class.len())
            .finish()
    }
}
