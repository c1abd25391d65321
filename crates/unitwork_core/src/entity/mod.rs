//! Entity identities, states and property containers.

mod container;
mod id;
mod state;

pub use container::{PropertyContainer, PropertyValue};
pub use id::EntityId;
pub(crate) use state::Lifecycle;
pub use state::EntityState;
