//! Scoped guards over a session.
//!
//! Both guards borrow the session mutably and deref to it, so work done
//! inside the scope goes through the guard. Dropping the guard restores the
//! previous state on every exit path, early returns and `?` included.

use crate::transaction::Session;
use crate::types::TransactionId;
use std::ops::{Deref, DerefMut};

/// Makes a transaction the session's current one until dropped.
///
/// ```rust,ignore
/// {
///     let scope = session.enter(child)?;
///     assert_eq!(scope.current_transaction(), Some(child));
/// }
/// assert_eq!(session.current_transaction(), None);
/// ```
#[derive(Debug)]
pub struct TransactionScope<'s> {
    session: &'s mut Session,
    transaction: TransactionId,
    previous: Option<TransactionId>,
}

impl<'s> TransactionScope<'s> {
    pub(crate) fn new(session: &'s mut Session, transaction: TransactionId) -> Self {
        let previous = session.replace_current(Some(transaction));
        Self {
            session,
            transaction,
            previous,
        }
    }

    /// Returns the transaction this scope entered.
    #[must_use]
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }
}

impl Deref for TransactionScope<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for TransactionScope<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        self.session.replace_current(self.previous);
    }
}

/// Makes a read-only transaction writable until dropped.
#[derive(Debug)]
pub struct UnlockGuard<'s> {
    session: &'s mut Session,
    transaction: TransactionId,
    was_unlocked: bool,
}

impl<'s> UnlockGuard<'s> {
    pub(crate) fn new(
        session: &'s mut Session,
        transaction: TransactionId,
        was_unlocked: bool,
    ) -> Self {
        Self {
            session,
            transaction,
            was_unlocked,
        }
    }

    /// Returns the unlocked transaction.
    #[must_use]
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }
}

impl Deref for UnlockGuard<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for UnlockGuard<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for UnlockGuard<'_> {
    fn drop(&mut self) {
        self.session.set_unlocked(self.transaction, self.was_unlocked);
    }
}
