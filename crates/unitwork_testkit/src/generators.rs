//! Property-based test generators using proptest.
//!
//! Operations are generated as indices into an [`OrderModel`](crate::OrderModel)
//! so the same strategy works for any seeded model.

use proptest::prelude::*;
use unitwork_core::PropertyValue;

/// A relation operation on the customer/order model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationOp {
    /// Sets `Order.customer` of an order to a customer, or to nothing.
    SetCustomer {
        /// Index into the model's orders.
        order: usize,
        /// Index into the model's customers.
        customer: Option<usize>,
    },
    /// Adds an order to a customer's `orders`.
    AddOrder {
        /// Index into the model's customers.
        customer: usize,
        /// Index into the model's orders.
        order: usize,
    },
    /// Removes the first order of a customer's `orders`, if any.
    RemoveFirstOrder {
        /// Index into the model's customers.
        customer: usize,
    },
    /// Deletes an order.
    DeleteOrder {
        /// Index into the model's orders.
        order: usize,
    },
    /// Creates an order for a customer.
    CreateOrder {
        /// Index into the model's customers.
        customer: usize,
    },
}

impl RelationOp {
    /// Returns the order the operation targets, if it targets one.
    pub fn order(&self) -> Option<usize> {
        match self {
            Self::SetCustomer { order, .. }
            | Self::AddOrder { order, .. }
            | Self::DeleteOrder { order } => Some(*order),
            Self::RemoveFirstOrder { .. } | Self::CreateOrder { .. } => None,
        }
    }
}

/// Strategy for one operation over `customers` customers and `orders` orders.
pub fn relation_op_strategy(customers: usize, orders: usize) -> impl Strategy<Value = RelationOp> {
    prop_oneof![
        3 => (0..orders, prop::option::weighted(0.8, 0..customers))
            .prop_map(|(order, customer)| RelationOp::SetCustomer { order, customer }),
        3 => (0..customers, 0..orders)
            .prop_map(|(customer, order)| RelationOp::AddOrder { customer, order }),
        2 => (0..customers).prop_map(|customer| RelationOp::RemoveFirstOrder { customer }),
        1 => (0..orders).prop_map(|order| RelationOp::DeleteOrder { order }),
        1 => (0..customers).prop_map(|customer| RelationOp::CreateOrder { customer }),
    ]
}

/// Strategy for a sequence of up to `max_len` operations.
pub fn relation_ops_strategy(
    customers: usize,
    orders: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<RelationOp>> {
    prop::collection::vec(relation_op_strategy(customers, orders), 1..=max_len)
}

/// Strategy for the shape of an [`OrderModel`](crate::OrderModel):
/// `(customers, orders_per_customer)`.
pub fn model_shape_strategy() -> impl Strategy<Value = (usize, usize)> {
    (1_usize..5, 0_usize..4)
}

/// Strategy for scalar property values.
///
/// Floats are finite so values compare equal after a store round trip.
pub fn property_value_strategy() -> impl Strategy<Value = PropertyValue> {
    prop_oneof![
        Just(PropertyValue::Null),
        any::<bool>().prop_map(PropertyValue::Bool),
        any::<i64>().prop_map(PropertyValue::Int),
        (-1.0e9_f64..1.0e9).prop_map(PropertyValue::Float),
        "[a-zA-Z0-9 ]{0,24}".prop_map(PropertyValue::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(PropertyValue::Bytes),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn operations_stay_in_range() {
        let mut runner = TestRunner::default();
        for _ in 0..200 {
            let op = relation_op_strategy(3, 5).new_tree(&mut runner).unwrap().current();
            if let Some(order) = op.order() {
                assert!(order < 5);
            }
            match op {
                RelationOp::SetCustomer { customer: Some(customer), .. }
                | RelationOp::AddOrder { customer, .. }
                | RelationOp::RemoveFirstOrder { customer }
                | RelationOp::CreateOrder { customer } => assert!(customer < 3),
                _ => {}
            }
        }
    }

    #[test]
    fn property_values_are_never_references() {
        let mut runner = TestRunner::default();
        for _ in 0..100 {
            let value = property_value_strategy().new_tree(&mut runner).unwrap().current();
            assert!(value.as_reference().is_none());
        }
    }
}
