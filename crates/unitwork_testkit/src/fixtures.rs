//! Test fixtures and session helpers.
//!
//! Provides a seeded object model and listeners that record or veto what a
//! session does.

use parking_lot::Mutex;
use std::sync::Arc;
use unitwork_core::{
    ChangeSet, ClassId, Config, CoreError, CoreResult, EntityHooks, EntityId, InMemoryProvider,
    MetadataBuilder, PersistenceProvider, PropertyContainer, PropertyValue, RelationDelta,
    RelationEndPointDefinition, Session, StaticMetadata, TransactionId, TransactionListener,
};

/// Relation metadata of the test model.
///
/// - `Customer.orders` (virtual, many) / `Order.customer` (real)
/// - `Employee.computer` (virtual, one) / `Computer.employee` (real)
/// - `Order.approved_by` (real, unidirectional)
pub fn order_metadata() -> StaticMetadata {
    MetadataBuilder::new()
        .one_to_many("Customer", "orders", "Order", "customer")
        .one_to_one("Employee", "computer", "Computer", "employee")
        .unidirectional("Order", "approved_by")
        .build()
        .expect("Invalid test metadata")
}

/// A seeded store of customers, orders, employees and computers.
///
/// Every customer owns `orders_per_customer` orders, in `orders` order.
/// The first order is approved by the first employee. The only computer
/// belongs to the first employee.
pub struct OrderModel {
    /// The backing store.
    pub provider: Arc<InMemoryProvider>,
    /// The relation metadata.
    pub metadata: Arc<StaticMetadata>,
    /// Stored customers.
    pub customers: Vec<EntityId>,
    /// Stored orders, grouped by customer.
    pub orders: Vec<EntityId>,
    /// Two stored employees.
    pub employees: Vec<EntityId>,
    /// One stored computer.
    pub computers: Vec<EntityId>,
}

impl OrderModel {
    /// Seeds a store with `customers` customers owning `orders_per_customer`
    /// orders each.
    pub fn new(customers: usize, orders_per_customer: usize) -> Self {
        let provider = Arc::new(InMemoryProvider::new());
        let employees: Vec<EntityId> = (0..2).map(|_| entity("Employee")).collect();
        for (n, employee) in employees.iter().enumerate() {
            provider.insert(
                employee.clone(),
                [("name", PropertyValue::from(format!("employee {n}")))],
            );
        }

        let computers = vec![entity("Computer")];
        provider.insert(
            computers[0].clone(),
            [
                ("name", PropertyValue::from("workstation")),
                ("employee", PropertyValue::Reference(Some(employees[0].clone()))),
            ],
        );

        let mut orders = Vec::new();
        let customers: Vec<EntityId> = (0..customers).map(|_| entity("Customer")).collect();
        for (n, customer) in customers.iter().enumerate() {
            provider.insert(
                customer.clone(),
                [("name", PropertyValue::from(format!("customer {n}")))],
            );
            for _ in 0..orders_per_customer {
                let order = entity("Order");
                let approved_by = orders.is_empty().then(|| employees[0].clone());
                provider.insert(
                    order.clone(),
                    [
                        ("total", PropertyValue::from(100_i64)),
                        ("customer", PropertyValue::Reference(Some(customer.clone()))),
                        ("approved_by", PropertyValue::Reference(approved_by)),
                    ],
                );
                orders.push(order);
            }
        }

        Self {
            provider,
            metadata: Arc::new(order_metadata()),
            customers,
            orders,
            employees,
            computers,
        }
    }

    /// Opens a session over the store with default configuration.
    pub fn session(&self) -> Session {
        self.session_with(Config::default())
    }

    /// Opens a session over the store.
    pub fn session_with(&self, config: Config) -> Session {
        Session::new(config, self.metadata.clone(), self.provider.clone())
    }

    /// Returns the customer an order references in the store.
    pub fn stored_customer_of(&self, order: &EntityId) -> Option<EntityId> {
        let row = self.provider.row(order)?;
        row.get("customer")
            .and_then(PropertyValue::as_reference)
            .flatten()
            .cloned()
    }
}

fn entity(class: &str) -> EntityId {
    EntityId::new(ClassId::new(class))
}

/// Something a [`RecordingListener`] or [`RecordingHooks`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    /// Before a delete.
    Deleting(EntityId),
    /// After a delete.
    Deleted(EntityId),
    /// Before an unload.
    Unloading(Vec<EntityId>),
    /// After an unload.
    Unloaded(Vec<EntityId>),
    /// Before a relation change.
    RelationChanging(RelationDelta),
    /// After a relation change.
    RelationChanged(RelationDelta),
    /// Before a commit.
    Committing(Vec<EntityId>),
    /// After a commit.
    Committed(Vec<EntityId>),
}

impl Recorded {
    /// Returns true for the callbacks that run before a change.
    pub fn is_before(&self) -> bool {
        matches!(
            self,
            Self::Deleting(_) | Self::Unloading(_) | Self::RelationChanging(_) | Self::Committing(_)
        )
    }
}

/// A listener that records every event it receives.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(TransactionId, Recorded)>>,
}

impl RecordingListener {
    /// Creates a listener, ready to be added to a session.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns what was recorded, in order.
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().iter().map(|(_, event)| event.clone()).collect()
    }

    /// Returns what was recorded in one transaction, in order.
    pub fn events_in(&self, transaction: TransactionId) -> Vec<Recorded> {
        self.events
            .lock()
            .iter()
            .filter(|(tx, _)| *tx == transaction)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, transaction: TransactionId, event: Recorded) -> CoreResult<()> {
        self.events.lock().push((transaction, event));
        Ok(())
    }
}

impl TransactionListener for RecordingListener {
    fn entity_deleting(&self, transaction: TransactionId, entity: &EntityId) -> CoreResult<()> {
        self.record(transaction, Recorded::Deleting(entity.clone()))
    }

    fn entity_deleted(&self, transaction: TransactionId, entity: &EntityId) -> CoreResult<()> {
        self.record(transaction, Recorded::Deleted(entity.clone()))
    }

    fn entities_unloading(
        &self,
        transaction: TransactionId,
        entities: &[EntityId],
    ) -> CoreResult<()> {
        self.record(transaction, Recorded::Unloading(entities.to_vec()))
    }

    fn entities_unloaded(
        &self,
        transaction: TransactionId,
        entities: &[EntityId],
    ) -> CoreResult<()> {
        self.record(transaction, Recorded::Unloaded(entities.to_vec()))
    }

    fn relation_changing(
        &self,
        transaction: TransactionId,
        delta: &RelationDelta,
    ) -> CoreResult<()> {
        self.record(transaction, Recorded::RelationChanging(delta.clone()))
    }

    fn relation_changed(
        &self,
        transaction: TransactionId,
        delta: &RelationDelta,
    ) -> CoreResult<()> {
        self.record(transaction, Recorded::RelationChanged(delta.clone()))
    }

    fn committing(&self, transaction: TransactionId, entities: &[EntityId]) -> CoreResult<()> {
        self.record(transaction, Recorded::Committing(entities.to_vec()))
    }

    fn committed(&self, transaction: TransactionId, entities: &[EntityId]) -> CoreResult<()> {
        self.record(transaction, Recorded::Committed(entities.to_vec()))
    }
}

/// Entity hooks that record every call.
///
/// Unload calls are recorded as single-entity [`Recorded::Unloading`] and
/// [`Recorded::Unloaded`] entries.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    calls: Mutex<Vec<Recorded>>,
}

impl RecordingHooks {
    /// Creates hooks, ready to be registered for a class.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the recorded calls, in order.
    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().clone()
    }

    fn record(&self, call: Recorded) -> CoreResult<()> {
        self.calls.lock().push(call);
        Ok(())
    }
}

impl EntityHooks for RecordingHooks {
    fn on_deleting(&self, _: TransactionId, entity: &EntityId) -> CoreResult<()> {
        self.record(Recorded::Deleting(entity.clone()))
    }

    fn on_deleted(&self, _: TransactionId, entity: &EntityId) -> CoreResult<()> {
        self.record(Recorded::Deleted(entity.clone()))
    }

    fn on_unloading(&self, _: TransactionId, entity: &EntityId) -> CoreResult<()> {
        self.record(Recorded::Unloading(vec![entity.clone()]))
    }

    fn on_unloaded(&self, _: TransactionId, entity: &EntityId) -> CoreResult<()> {
        self.record(Recorded::Unloaded(vec![entity.clone()]))
    }

    fn on_relation_changing(&self, _: TransactionId, delta: &RelationDelta) -> CoreResult<()> {
        self.record(Recorded::RelationChanging(delta.clone()))
    }

    fn on_relation_changed(&self, _: TransactionId, delta: &RelationDelta) -> CoreResult<()> {
        self.record(Recorded::RelationChanged(delta.clone()))
    }
}

/// A listener that vetoes deletes of chosen entities, or every commit.
#[derive(Debug, Default)]
pub struct VetoingListener {
    protected: Mutex<Vec<EntityId>>,
    veto_commits: bool,
}

impl VetoingListener {
    /// Vetoes every delete of `entity`.
    pub fn protecting(entity: &EntityId) -> Arc<Self> {
        Arc::new(Self {
            protected: Mutex::new(vec![entity.clone()]),
            veto_commits: false,
        })
    }

    /// Vetoes every commit.
    pub fn commits() -> Arc<Self> {
        Arc::new(Self {
            protected: Mutex::default(),
            veto_commits: true,
        })
    }

    /// Stops protecting `entity`.
    pub fn release(&self, entity: &EntityId) {
        self.protected.lock().retain(|protected| protected != entity);
    }
}

impl TransactionListener for VetoingListener {
    fn entity_deleting(&self, _: TransactionId, entity: &EntityId) -> CoreResult<()> {
        if self.protected.lock().contains(entity) {
            return Err(CoreError::vetoed(format!("{entity} is protected")));
        }
        Ok(())
    }

    fn committing(&self, transaction: TransactionId, _: &[EntityId]) -> CoreResult<()> {
        if self.veto_commits {
            return Err(CoreError::vetoed(format!("commits of {transaction} are disabled")));
        }
        Ok(())
    }
}

/// A provider that keeps every change set it saves, then forwards it.
#[derive(Debug)]
pub struct CapturingProvider {
    inner: Arc<InMemoryProvider>,
    saved: Mutex<Vec<ChangeSet>>,
}

impl CapturingProvider {
    /// Wraps `inner`.
    pub fn new(inner: Arc<InMemoryProvider>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            saved: Mutex::default(),
        })
    }

    /// Returns every change set saved so far, oldest first.
    pub fn saved(&self) -> Vec<ChangeSet> {
        self.saved.lock().clone()
    }
}

impl PersistenceProvider for CapturingProvider {
    fn load_properties(&self, id: &EntityId) -> CoreResult<PropertyContainer> {
        self.inner.load_properties(id)
    }

    fn load_related(
        &self,
        definition: &RelationEndPointDefinition,
        entity: &EntityId,
    ) -> CoreResult<Vec<EntityId>> {
        self.inner.load_related(definition, entity)
    }

    fn save(&self, changes: &ChangeSet) -> CoreResult<()> {
        self.inner.save(changes)?;
        self.saved.lock().push(changes.clone());
        Ok(())
    }
}

/// Renders a change set as JSON for assertions and failure messages.
pub fn change_set_json(changes: &ChangeSet) -> serde_json::Value {
    serde_json::to_value(changes).expect("Change sets always serialize")
}
