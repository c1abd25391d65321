//! Nested transactions.
//!
//! A [`Session`] holds a hierarchy of transactions:
//! - The root transaction loads from and saves to the persistence provider
//! - Each transaction has at most one open child, which loads from its parent
//! - A transaction with an open child is read-only until the child is
//!   discarded, or while an [`UnlockGuard`] is held for it
//! - Every transaction owns its own registry; nothing is shared by reference

mod executor;
mod scope;
mod session;
mod state;

pub use executor::HierarchyExecutor;
pub use scope::{TransactionScope, UnlockGuard};
pub use session::Session;
pub(crate) use state::Transaction;
