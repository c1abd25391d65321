//! Persistence provider contract.
//!
//! Providers are **opaque property-bag stores**. They load and save
//! [`PropertyContainer`] values keyed by [`EntityId`] and answer which
//! entities reference a given entity through a relation. The engine owns all
//! relation and lifecycle semantics - providers do not understand end-points,
//! transactions or commands.

use crate::entity::{EntityId, PropertyContainer, PropertyValue};
use crate::error::{CoreError, CoreResult};
use crate::metadata::RelationEndPointDefinition;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Type of change written on commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Entity did not exist in the store.
    Insert,
    /// Entity existed and changed.
    Update,
    /// Entity must be removed.
    Delete,
}

/// One entity written on commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    /// The entity.
    pub id: EntityId,
    /// Type of change.
    pub kind: ChangeKind,
    /// Full property values, references included. Empty for deletes.
    pub properties: BTreeMap<String, PropertyValue>,
}

/// Everything a root transaction writes in one commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Changes in entity id order.
    pub changes: Vec<EntityChange>,
}

impl ChangeSet {
    /// Returns true if there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the number of changed entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns the ids of changes of one kind.
    #[must_use]
    pub fn ids_of(&self, kind: ChangeKind) -> Vec<&EntityId> {
        self.changes
            .iter()
            .filter(|change| change.kind == kind)
            .map(|change| &change.id)
            .collect()
    }
}

/// Loads and saves entity property bags.
///
/// # Invariants
///
/// - `load_properties` returns the values last saved for the entity
/// - `load_related` returns the entities whose real end-point named by the
///   definition's opposite currently references `entity`, in id order
/// - `save` applies a change set entirely or not at all
pub trait PersistenceProvider: Send + Sync {
    /// Loads the stored properties of an entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotFound`] if the entity is not stored.
    fn load_properties(&self, id: &EntityId) -> CoreResult<PropertyContainer>;

    /// Loads the opposites of a virtual end-point.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition has no opposite.
    fn load_related(
        &self,
        definition: &RelationEndPointDefinition,
        entity: &EntityId,
    ) -> CoreResult<Vec<EntityId>>;

    /// Writes a change set.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Persistence`] if the change set cannot be applied.
    fn save(&self, changes: &ChangeSet) -> CoreResult<()>;
}

/// A provider that keeps every row in memory.
///
/// Suitable for tests and for sessions that never touch a real store.
///
/// ```rust
/// use unitwork_core::{ClassId, EntityId, InMemoryProvider, PersistenceProvider, PropertyValue};
///
/// let provider = InMemoryProvider::new();
/// let id = EntityId::new(ClassId::new("Customer"));
/// provider.insert(id.clone(), [("name", PropertyValue::from("Ada"))]);
///
/// let container = provider.load_properties(&id).unwrap();
/// assert_eq!(container.get("name"), Some(&PropertyValue::from("Ada")));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    rows: RwLock<BTreeMap<EntityId, BTreeMap<String, PropertyValue>>>,
    property_loads: AtomicUsize,
    related_loads: AtomicUsize,
    saves: AtomicUsize,
}

impl InMemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a row, replacing any existing one.
    pub fn insert<K, I>(&self, id: EntityId, values: I)
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, PropertyValue)>,
    {
        let row = values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.rows.write().insert(id, row);
    }

    /// Returns a copy of a stored row.
    #[must_use]
    pub fn row(&self, id: &EntityId) -> Option<BTreeMap<String, PropertyValue>> {
        self.rows.read().get(id).cloned()
    }

    /// Returns true if a row is stored for the entity.
    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.rows.read().contains_key(id)
    }

    /// Returns the number of stored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Number of `load_properties` calls so far.
    #[must_use]
    pub fn property_loads(&self) -> usize {
        self.property_loads.load(Ordering::SeqCst)
    }

    /// Number of `load_related` calls so far.
    #[must_use]
    pub fn related_loads(&self) -> usize {
        self.related_loads.load(Ordering::SeqCst)
    }

    /// Number of successful saves so far.
    #[must_use]
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl PersistenceProvider for InMemoryProvider {
    fn load_properties(&self, id: &EntityId) -> CoreResult<PropertyContainer> {
        self.property_loads.fetch_add(1, Ordering::SeqCst);
        self.rows
            .read()
            .get(id)
            .cloned()
            .map(PropertyContainer::from_values)
            .ok_or_else(|| CoreError::entity_not_found(id))
    }

    fn load_related(
        &self,
        definition: &RelationEndPointDefinition,
        entity: &EntityId,
    ) -> CoreResult<Vec<EntityId>> {
        self.related_loads.fetch_add(1, Ordering::SeqCst);
        let opposite = definition.opposite.as_ref().ok_or_else(|| {
            CoreError::invalid_argument(format!(
                "relation {}.{} has no opposite to load",
                definition.class, definition.property
            ))
        })?;

        let rows = self.rows.read();
        Ok(rows
            .iter()
            .filter(|(id, _)| *id.class() == opposite.class)
            .filter(|(_, row)| {
                row.get(&*opposite.property)
                    .and_then(PropertyValue::as_reference)
                    .flatten()
                    == Some(entity)
            })
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn save(&self, changes: &ChangeSet) -> CoreResult<()> {
        let mut rows = self.rows.write();

        for change in &changes.changes {
            let exists = rows.contains_key(&change.id);
            match change.kind {
                ChangeKind::Insert if exists => {
                    return Err(CoreError::persistence(format!(
                        "cannot insert {}: already stored",
                        change.id
                    )));
                }
                ChangeKind::Update | ChangeKind::Delete if !exists => {
                    return Err(CoreError::persistence(format!(
                        "cannot write {}: not stored",
                        change.id
                    )));
                }
                _ => {}
            }
        }

        for change in &changes.changes {
            match change.kind {
                ChangeKind::Insert | ChangeKind::Update => {
                    rows.insert(change.id.clone(), change.properties.clone());
                }
                ChangeKind::Delete => {
                    rows.remove(&change.id);
                }
            }
        }

        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataBuilder, RelationMetadata};
    use crate::types::ClassId;

    fn customer_orders() -> RelationEndPointDefinition {
        let metadata = MetadataBuilder::new()
            .one_to_many("Customer", "orders", "Order", "customer")
            .build()
            .unwrap();
        metadata
            .definitions_for(&ClassId::new("Customer"))
            .remove(0)
    }

    #[test]
    fn load_missing_entity_fails() {
        let provider = InMemoryProvider::new();
        let id = EntityId::new(ClassId::new("Customer"));
        assert!(matches!(
            provider.load_properties(&id),
            Err(CoreError::EntityNotFound { .. })
        ));
        assert_eq!(provider.property_loads(), 1);
    }

    #[test]
    fn load_related_follows_references() {
        let provider = InMemoryProvider::new();
        let customer = EntityId::new(ClassId::new("Customer"));
        let other = EntityId::new(ClassId::new("Customer"));
        let order = EntityId::new(ClassId::new("Order"));
        provider.insert(customer.clone(), Vec::<(String, PropertyValue)>::new());
        provider.insert(
            order.clone(),
            [("customer", PropertyValue::Reference(Some(customer.clone())))],
        );
        provider.insert(
            EntityId::new(ClassId::new("Order")),
            [("customer", PropertyValue::Reference(Some(other)))],
        );

        let related = provider.load_related(&customer_orders(), &customer).unwrap();
        assert_eq!(related, vec![order]);
        assert_eq!(provider.related_loads(), 1);
    }

    #[test]
    fn save_is_all_or_nothing() {
        let provider = InMemoryProvider::new();
        let stored = EntityId::new(ClassId::new("Customer"));
        provider.insert(stored.clone(), [("name", PropertyValue::from("Ada"))]);

        let changes = ChangeSet {
            changes: vec![
                EntityChange {
                    id: stored.clone(),
                    kind: ChangeKind::Update,
                    properties: BTreeMap::from([("name".to_owned(), PropertyValue::from("Grace"))]),
                },
                EntityChange {
                    id: EntityId::new(ClassId::new("Customer")),
                    kind: ChangeKind::Delete,
                    properties: BTreeMap::new(),
                },
            ],
        };

        assert!(matches!(
            provider.save(&changes),
            Err(CoreError::Persistence { .. })
        ));
        assert_eq!(
            provider.row(&stored).unwrap().get("name"),
            Some(&PropertyValue::from("Ada"))
        );
        assert_eq!(provider.saves(), 0);
    }

    #[test]
    fn save_applies_inserts_updates_and_deletes() {
        let provider = InMemoryProvider::new();
        let kept = EntityId::new(ClassId::new("Customer"));
        let removed = EntityId::new(ClassId::new("Customer"));
        let created = EntityId::new(ClassId::new("Customer"));
        provider.insert(kept.clone(), [("n", PropertyValue::Int(1))]);
        provider.insert(removed.clone(), [("n", PropertyValue::Int(2))]);

        let changes = ChangeSet {
            changes: vec![
                EntityChange {
                    id: kept.clone(),
                    kind: ChangeKind::Update,
                    properties: BTreeMap::from([("n".to_owned(), PropertyValue::Int(10))]),
                },
                EntityChange {
                    id: removed.clone(),
                    kind: ChangeKind::Delete,
                    properties: BTreeMap::new(),
                },
                EntityChange {
                    id: created.clone(),
                    kind: ChangeKind::Insert,
                    properties: BTreeMap::new(),
                },
            ],
        };
        provider.save(&changes).unwrap();

        assert_eq!(provider.len(), 2);
        assert!(!provider.contains(&removed));
        assert!(provider.contains(&created));
        assert_eq!(changes.ids_of(ChangeKind::Delete), vec![&removed]);
    }
}
