//! Running a command on every level of a transaction hierarchy.

use crate::command::Command;
use crate::error::CoreResult;
use crate::transaction::Session;
use crate::types::TransactionId;
use tracing::{trace, warn};

/// Applies a command factory to a hierarchy, leaf first, then every ancestor.
///
/// The factory is called once per level with the session and that level's
/// transaction. Read-only ancestors are unlocked only while their own
/// level's command runs.
///
/// ```rust,ignore
/// let mut executor = HierarchyExecutor::new(|session: &mut Session, tx| {
///     session.delete_command(tx, &order).map(ExpandedCommand::into_command)
/// });
/// executor.execute_for_hierarchy(&mut session, leaf)?;
/// ```
pub struct HierarchyExecutor<F> {
    factory: F,
}

impl<F> HierarchyExecutor<F>
where
    F: FnMut(&mut Session, TransactionId) -> CoreResult<Command>,
{
    /// Creates an executor around `factory`.
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    /// Builds and runs the command at every level, leaf to root.
    ///
    /// # Errors
    ///
    /// Stops at the first factory or command error. The level's unlock is
    /// released before the error is returned; levels already run stay applied.
    pub fn execute_for_hierarchy(
        &mut self,
        session: &mut Session,
        start: TransactionId,
    ) -> CoreResult<()> {
        for level in session.hierarchy_from_leaf(start)? {
            let command = (self.factory)(session, level)?;
            trace!(transaction = %level, command = %command, "executing hierarchy level");
            run_level(session, level, command)?;
        }
        Ok(())
    }

    /// Like [`execute_for_hierarchy`](Self::execute_for_hierarchy), but stops
    /// at the first level whose command cannot execute.
    ///
    /// Returns `Ok(false)` when a level declined. That level and every more
    /// ancestral one are left untouched; levels already run are **not**
    /// rolled back.
    ///
    /// # Errors
    ///
    /// Factory and command errors propagate as in the unconditional walk.
    pub fn try_execute_for_hierarchy(
        &mut self,
        session: &mut Session,
        start: TransactionId,
    ) -> CoreResult<bool> {
        for level in session.hierarchy_from_leaf(start)? {
            let command = (self.factory)(session, level)?;
            if !command.can_execute() {
                warn!(
                    transaction = %level,
                    command = %command,
                    blockers = command.exceptions().len(),
                    "hierarchy walk stopped: command cannot execute"
                );
                return Ok(false);
            }
            trace!(transaction = %level, command = %command, "executing hierarchy level");
            run_level(session, level, command)?;
        }
        Ok(true)
    }
}

fn run_level(session: &mut Session, level: TransactionId, command: Command) -> CoreResult<()> {
    if session.is_read_only(level)? {
        let mut unlocked = session.unlock(level)?;
        unlocked.run_command(level, command)
    } else {
        session.run_command(level, command)
    }
}

impl<F> std::fmt::Debug for HierarchyExecutor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchyExecutor").finish_non_exhaustive()
    }
}
