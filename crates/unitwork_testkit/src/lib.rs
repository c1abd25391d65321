//! # Unitwork Testkit
//!
//! Test utilities for unitwork.
//!
//! This crate provides:
//! - A seeded customer/order/employee model backed by an in-memory provider
//! - Recording and vetoing listeners and recording entity hooks
//! - Property-based generators for relation operations using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use unitwork_testkit::prelude::*;
//!
//! #[test]
//! fn moving_an_order() {
//!     let model = OrderModel::new(2, 1);
//!     let mut session = model.session();
//!     let tx = session.root();
//!     session.set_related(tx, &model.orders[0], "customer", Some(&model.customers[1]))?;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
