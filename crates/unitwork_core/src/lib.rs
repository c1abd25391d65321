//! # Unitwork Core
//!
//! A transactional unit-of-work engine for object graphs.
//!
//! This crate provides:
//! - Per-transaction registries of entities and relation end-points
//! - Nested transactions that load from, and commit into, their parent
//! - Five-phase commands for deletes, unloads and relation changes, expanded
//!   so that both sides of every bidirectional relation stay consistent
//! - Lifecycle events with veto, and per-class entity hooks
//!
//! ## Design Principles
//!
//! - Entities and end-points refer to each other by identity, never by pointer
//! - Only a command's `perform` phase mutates a registry
//! - Relation metadata and persistence are supplied by the caller
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use unitwork_core::{
//!     ClassId, Config, EntityId, InMemoryProvider, MetadataBuilder, PropertyValue, Session,
//! };
//!
//! let metadata = MetadataBuilder::new()
//!     .one_to_many("Customer", "orders", "Order", "customer")
//!     .build()
//!     .unwrap();
//! let provider = Arc::new(InMemoryProvider::new());
//! let ada = EntityId::new(ClassId::new("Customer"));
//! provider.insert(ada.clone(), [("name", PropertyValue::from("Ada"))]);
//!
//! let mut session = Session::new(Config::default(), Arc::new(metadata), provider.clone());
//! let tx = session.root();
//! let order = session.new_entity(tx, "Order").unwrap();
//! session.add_related(tx, &ada, "orders", &order).unwrap();
//! assert_eq!(session.related(tx, &order, "customer").unwrap(), Some(ada.clone()));
//!
//! session.commit(tx).unwrap();
//! assert!(provider.contains(&order));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod command;
mod config;
mod endpoint;
mod entity;
mod error;
mod events;
mod hooks;
mod metadata;
mod provider;
mod registry;
mod resolver;
mod transaction;
mod types;

#[cfg(test)]
mod test_support;

pub use command::{
    AdHocCommand, Command, CommandContext, CommandExpander, CompositeCommand, DeleteCommand,
    ExecutionBlocker, ExpandedCommand, ExpansionContext, MarkVirtualEndPointsIncompleteCommand,
    PhaseHandler, RelationChangeCommand, RelationModification, UnloadCommand, UnloadDataCommand,
    UnregisterEndPointsCommand,
};
pub use config::Config;
pub use endpoint::{
    RealEndPoint, RelationEndPoint, RelationEndPointId, VirtualEndPoint, VirtualEndPointData,
};
pub use entity::{EntityId, EntityState, PropertyContainer, PropertyValue};
pub use error::{CoreError, CoreResult};
pub use events::{
    EventSink, LifecycleEvent, LifecycleEventKind, LifecycleFeed, RelationDelta,
    TransactionListener,
};
pub use hooks::{EntityHooks, HookRegistry};
pub use metadata::{
    Cardinality, EndPointKind, MetadataBuilder, OppositeEndPoint, RelationEndPointDefinition,
    RelationMetadata, StaticMetadata,
};
pub use provider::{ChangeKind, ChangeSet, EntityChange, InMemoryProvider, PersistenceProvider};
pub use registry::{EntityRecord, Registry};
pub use resolver::OppositeEndPointResolver;
pub use transaction::{HierarchyExecutor, Session, TransactionScope, UnlockGuard};
pub use types::{ClassId, TransactionId};
