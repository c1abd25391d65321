//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::registry::Registry;
use crate::types::TransactionId;

/// One node of a transaction hierarchy.
#[derive(Debug)]
pub(crate) struct Transaction {
    /// Transaction ID.
    id: TransactionId,
    /// Parent transaction, `None` for the root.
    parent: Option<TransactionId>,
    /// Open sub-transaction.
    child: Option<TransactionId>,
    /// Set while an unlock guard is held.
    unlocked: bool,
    /// Entities and end-points loaded in this transaction.
    pub(crate) registry: Registry,
}

impl Transaction {
    /// Creates a root transaction.
    pub(crate) fn root(id: TransactionId) -> Self {
        Self {
            id,
            parent: None,
            child: None,
            unlocked: false,
            registry: Registry::new(),
        }
    }

    /// Creates a sub-transaction of `parent`.
    pub(crate) fn child_of(id: TransactionId, parent: TransactionId) -> Self {
        Self {
            parent: Some(parent),
            ..Self::root(id)
        }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    pub(crate) fn parent(&self) -> Option<TransactionId> {
        self.parent
    }

    pub(crate) fn child(&self) -> Option<TransactionId> {
        self.child
    }

    pub(crate) fn set_child(&mut self, child: Option<TransactionId>) {
        self.child = child;
    }

    pub(crate) fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub(crate) fn set_unlocked(&mut self, unlocked: bool) {
        self.unlocked = unlocked;
    }

    /// Returns true while a child is open and no unlock guard is held.
    pub(crate) fn is_read_only(&self) -> bool {
        self.child.is_some() && !self.unlocked
    }

    /// Ensures the transaction may be mutated.
    pub(crate) fn ensure_writable(&self) -> CoreResult<()> {
        if self.is_read_only() {
            Err(CoreError::TransactionReadOnly {
                transaction: self.id,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_child_makes_transaction_read_only() {
        let mut tx = Transaction::root(TransactionId::new(1));
        assert!(tx.ensure_writable().is_ok());

        tx.set_child(Some(TransactionId::new(2)));
        assert!(tx.is_read_only());
        assert!(matches!(
            tx.ensure_writable(),
            Err(CoreError::TransactionReadOnly { .. })
        ));

        tx.set_unlocked(true);
        assert!(!tx.is_read_only());
    }

    #[test]
    fn child_records_parent() {
        let tx = Transaction::child_of(TransactionId::new(2), TransactionId::new(1));
        assert_eq!(tx.parent(), Some(TransactionId::new(1)));
        assert_eq!(tx.id(), TransactionId::new(2));
        assert!(tx.child().is_none());
    }
}
