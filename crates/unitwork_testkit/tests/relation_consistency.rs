//! Both sides of a bidirectional relation agree after any sequence of
//! operations, in the session and in the store after commit.

use proptest::prelude::*;
use std::collections::BTreeSet;
use unitwork_core::{CoreResult, EntityId, Session, TransactionId};
use unitwork_testkit::prelude::*;

struct Run<'m> {
    model: &'m OrderModel,
    orders: Vec<EntityId>,
    deleted: BTreeSet<EntityId>,
}

impl<'m> Run<'m> {
    fn new(model: &'m OrderModel) -> Self {
        Self {
            model,
            orders: model.orders.clone(),
            deleted: BTreeSet::new(),
        }
    }

    fn live_order(&self, index: usize) -> Option<EntityId> {
        let order = &self.orders[index % self.orders.len()];
        (!self.deleted.contains(order)).then(|| order.clone())
    }

    fn live_orders(&self) -> Vec<EntityId> {
        self.orders
            .iter()
            .filter(|order| !self.deleted.contains(*order))
            .cloned()
            .collect()
    }

    fn apply(
        &mut self,
        session: &mut Session,
        tx: TransactionId,
        op: RelationOp,
    ) -> CoreResult<()> {
        let customers = &self.model.customers;
        match op {
            RelationOp::SetCustomer { order, customer } => {
                if let Some(order) = self.live_order(order) {
                    let customer = customer.map(|index| &customers[index]);
                    session.set_related(tx, &order, "customer", customer)?;
                }
            }
            RelationOp::AddOrder { customer, order } => {
                if let Some(order) = self.live_order(order) {
                    session.add_related(tx, &customers[customer], "orders", &order)?;
                }
            }
            RelationOp::RemoveFirstOrder { customer } => {
                let customer = &customers[customer];
                if let Some(first) = session.related_many(tx, customer, "orders")?.first() {
                    session.remove_related(tx, customer, "orders", first)?;
                }
            }
            RelationOp::DeleteOrder { order } => {
                if let Some(order) = self.live_order(order) {
                    session.delete(tx, &order)?;
                    self.deleted.insert(order);
                }
            }
            RelationOp::CreateOrder { customer } => {
                let order = session.new_entity(tx, "Order")?;
                session.set_property(tx, &order, "total", 1_i64)?;
                session.add_related(tx, &customers[customer], "orders", &order)?;
                self.orders.push(order);
            }
        }
        Ok(())
    }
}

fn check_sides_agree(
    session: &mut Session,
    tx: TransactionId,
    customers: &[EntityId],
    orders: &[EntityId],
) -> Result<(), TestCaseError> {
    for customer in customers {
        for order in session.related_many(tx, customer, "orders").unwrap() {
            prop_assert_eq!(
                session.related(tx, &order, "customer").unwrap(),
                Some(customer.clone())
            );
        }
    }
    for order in orders {
        if let Some(customer) = session.related(tx, order, "customer").unwrap() {
            prop_assert!(session.related_many(tx, &customer, "orders").unwrap().contains(order));
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn relation_sides_agree(ops in relation_ops_strategy(3, 6, 24), nested in any::<bool>()) {
        let model = OrderModel::new(3, 2);
        let mut session = model.session();
        let root = session.root();
        let tx = if nested { session.create_sub_transaction(root).unwrap() } else { root };

        let mut run = Run::new(&model);
        for op in ops {
            run.apply(&mut session, tx, op).unwrap();
        }
        let live = run.live_orders();
        check_sides_agree(&mut session, tx, &model.customers, &live)?;

        if nested {
            session.commit(tx).unwrap();
            session.discard(tx).unwrap();
            check_sides_agree(&mut session, root, &model.customers, &live)?;
        }
        session.commit(root).unwrap();

        let mut fresh = model.session();
        let fresh_root = fresh.root();
        for order in &live {
            let expected = session.related(root, order, "customer").unwrap();
            prop_assert_eq!(&model.stored_customer_of(order), &expected);
            prop_assert_eq!(fresh.related(fresh_root, order, "customer").unwrap(), expected);
        }
        for order in &run.deleted {
            prop_assert!(!model.provider.contains(order));
        }
        check_sides_agree(&mut fresh, fresh_root, &model.customers, &live)?;
    }

    #[test]
    fn rollback_restores_the_loaded_graph(ops in relation_ops_strategy(2, 4, 12)) {
        let model = OrderModel::new(2, 2);
        let mut session = model.session();
        let root = session.root();

        let before: Vec<Vec<EntityId>> = model
            .customers
            .iter()
            .map(|customer| session.related_many(root, customer, "orders").unwrap())
            .collect();

        let mut run = Run::new(&model);
        for op in ops {
            run.apply(&mut session, root, op).unwrap();
        }
        session.rollback(root).unwrap();

        for (customer, expected) in model.customers.iter().zip(&before) {
            prop_assert_eq!(&session.related_many(root, customer, "orders").unwrap(), expected);
        }
        prop_assert!(session.entities_to_persist(root).unwrap().is_empty());
    }
}
