//! Shared fixtures for unit tests.
//!
//! Both fixtures describe the same graph:
//! - Customer `ada` owns orders `o1` and `o2`; customer `grace` owns none
//! - `o1` was approved by employee `bob` through a unidirectional relation
//! - Employee `alice` has computer `laptop`; `bob` has none

use crate::config::Config;
use crate::endpoint::{RealEndPoint, RelationEndPointId, VirtualEndPoint};
use crate::entity::{EntityId, PropertyContainer, PropertyValue};
use crate::metadata::{Cardinality, MetadataBuilder, StaticMetadata};
use crate::provider::InMemoryProvider;
use crate::registry::Registry;
use crate::transaction::Session;
use crate::types::ClassId;
use std::sync::Arc;

pub(crate) fn order_metadata() -> StaticMetadata {
    MetadataBuilder::new()
        .one_to_many("Customer", "orders", "Order", "customer")
        .one_to_one("Employee", "computer", "Computer", "employee")
        .unidirectional("Order", "approved_by")
        .class("Product")
        .build()
        .unwrap()
}

fn id(class: &str) -> EntityId {
    EntityId::new(ClassId::new(class))
}

fn reference(target: Option<&EntityId>) -> PropertyValue {
    PropertyValue::Reference(target.cloned())
}

/// The graph as rows of a persistence provider.
struct Rows {
    ada: EntityId,
    grace: EntityId,
    orders: Vec<EntityId>,
    alice: EntityId,
    bob: EntityId,
    laptop: EntityId,
}

impl Rows {
    fn new() -> Self {
        Self {
            ada: id("Customer"),
            grace: id("Customer"),
            orders: vec![id("Order"), id("Order")],
            alice: id("Employee"),
            bob: id("Employee"),
            laptop: id("Computer"),
        }
    }

    fn containers(&self) -> Vec<(EntityId, PropertyContainer)> {
        vec![
            (self.ada.clone(), PropertyContainer::new().with("name", "Ada")),
            (self.grace.clone(), PropertyContainer::new().with("name", "Grace")),
            (
                self.orders[0].clone(),
                PropertyContainer::new()
                    .with("total", 10_i64)
                    .with("customer", reference(Some(&self.ada)))
                    .with("approved_by", reference(Some(&self.bob))),
            ),
            (
                self.orders[1].clone(),
                PropertyContainer::new()
                    .with("total", 20_i64)
                    .with("customer", reference(Some(&self.ada)))
                    .with("approved_by", reference(None)),
            ),
            (self.alice.clone(), PropertyContainer::new().with("name", "Alice")),
            (self.bob.clone(), PropertyContainer::new().with("name", "Bob")),
            (
                self.laptop.clone(),
                PropertyContainer::new()
                    .with("name", "Laptop")
                    .with("employee", reference(Some(&self.alice))),
            ),
        ]
    }
}

/// The graph fully loaded into a single registry.
pub(crate) struct OrderGraph {
    pub(crate) registry: Registry,
    pub(crate) metadata: StaticMetadata,
    pub(crate) ada: EntityId,
    pub(crate) grace: EntityId,
    pub(crate) orders: Vec<EntityId>,
    pub(crate) alice: EntityId,
    pub(crate) bob: EntityId,
    pub(crate) laptop: EntityId,
}

impl OrderGraph {
    pub(crate) fn new() -> Self {
        let rows = Rows::new();
        let mut registry = Registry::new();
        for (id, container) in rows.containers() {
            registry.register_existing(id, container).unwrap();
        }

        let virtual_end_points = [
            (&rows.ada, "orders", Cardinality::Many, rows.orders.clone()),
            (&rows.grace, "orders", Cardinality::Many, Vec::new()),
            (&rows.alice, "computer", Cardinality::One, vec![rows.laptop.clone()]),
            (&rows.bob, "computer", Cardinality::One, Vec::new()),
        ];
        for (owner, property, cardinality, items) in virtual_end_points {
            registry
                .register_end_point(VirtualEndPoint::complete(
                    RelationEndPointId::new(owner.clone(), property),
                    cardinality,
                    items,
                ))
                .unwrap();
        }

        let real_end_points = [
            (&rows.orders[0], "customer", Some(&rows.ada)),
            (&rows.orders[0], "approved_by", Some(&rows.bob)),
            (&rows.orders[1], "customer", Some(&rows.ada)),
            (&rows.orders[1], "approved_by", None),
            (&rows.laptop, "employee", Some(&rows.alice)),
        ];
        for (owner, property, target) in real_end_points {
            registry
                .register_end_point(RealEndPoint::new(
                    RelationEndPointId::new(owner.clone(), property),
                    target.cloned(),
                ))
                .unwrap();
        }

        Self {
            registry,
            metadata: order_metadata(),
            ada: rows.ada,
            grace: rows.grace,
            orders: rows.orders,
            alice: rows.alice,
            bob: rows.bob,
            laptop: rows.laptop,
        }
    }
}

/// The graph stored in an in-memory provider, for session tests.
pub(crate) struct OrderStore {
    pub(crate) provider: Arc<InMemoryProvider>,
    pub(crate) metadata: Arc<StaticMetadata>,
    pub(crate) ada: EntityId,
    pub(crate) grace: EntityId,
    pub(crate) orders: Vec<EntityId>,
    pub(crate) alice: EntityId,
    pub(crate) bob: EntityId,
    pub(crate) laptop: EntityId,
}

impl OrderStore {
    pub(crate) fn new() -> Self {
        let rows = Rows::new();
        let provider = Arc::new(InMemoryProvider::new());
        for (id, container) in rows.containers() {
            provider.insert(id, container.to_values());
        }

        Self {
            provider,
            metadata: Arc::new(order_metadata()),
            ada: rows.ada,
            grace: rows.grace,
            orders: rows.orders,
            alice: rows.alice,
            bob: rows.bob,
            laptop: rows.laptop,
        }
    }

    pub(crate) fn session(&self) -> Session {
        self.session_with(Config::default())
    }

    pub(crate) fn session_with(&self, config: Config) -> Session {
        Session::new(config, self.metadata.clone(), self.provider.clone())
    }
}
