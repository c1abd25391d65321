//! The five-phase command protocol.
//!
//! Every structural change to a transaction's registry is a [`Command`].
//! Commands run in five ordered phases:
//!
//! 1. `notify_begin` - pre-change events; listeners may veto
//! 2. `begin` - per-entity "about to change" hooks
//! 3. `perform` - the only phase that mutates the registry
//! 4. `end` - per-entity "changed" hooks
//! 5. `notify_end` - post-change events
//!
//! A command that fails stops at the failing phase. Nothing already applied
//! is undone.
//!
//! Commands are plain data: building one and expanding it with
//! [`Command::expand_to_all_related_objects`] only reads the registry. The
//! expanded form contains a fix-up command for every opposite end-point the
//! change touches.

mod ad_hoc;
mod composite;
mod delete;
mod mark_incomplete;
mod relation;
mod unload;
mod unregister;

pub use ad_hoc::{AdHocCommand, CommandExpander, PhaseHandler};
pub use composite::{CompositeCommand, ExpandedCommand};
pub use delete::DeleteCommand;
pub use mark_incomplete::MarkVirtualEndPointsIncompleteCommand;
pub use relation::{RelationChangeCommand, RelationModification};
pub use unload::{UnloadCommand, UnloadDataCommand};
pub use unregister::UnregisterEndPointsCommand;

use crate::config::Config;
use crate::endpoint::RelationEndPointId;
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::events::EventSink;
use crate::hooks::HookRegistry;
use crate::metadata::RelationMetadata;
use crate::registry::Registry;
use crate::resolver::OppositeEndPointResolver;
use crate::types::TransactionId;
use std::fmt;
use tracing::trace;

/// Everything a command may touch while it runs against one transaction.
pub struct CommandContext<'a> {
    transaction: TransactionId,
    registry: &'a mut Registry,
    events: &'a EventSink,
    hooks: &'a HookRegistry,
}

impl<'a> CommandContext<'a> {
    /// Creates a context for `transaction`.
    pub fn new(
        transaction: TransactionId,
        registry: &'a mut Registry,
        events: &'a EventSink,
        hooks: &'a HookRegistry,
    ) -> Self {
        Self {
            transaction,
            registry,
            events,
            hooks,
        }
    }

    /// Returns the target transaction.
    #[must_use]
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// Returns the target registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        self.registry
    }

    /// Mutable access to the target registry.
    pub fn registry_mut(&mut self) -> &mut Registry {
        self.registry
    }

    /// Returns the event sink.
    #[must_use]
    pub fn events(&self) -> &EventSink {
        self.events
    }

    /// Returns the entity hooks.
    #[must_use]
    pub fn hooks(&self) -> &HookRegistry {
        self.hooks
    }
}

impl fmt::Debug for CommandContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("transaction", &self.transaction)
            .finish_non_exhaustive()
    }
}

/// Read-only view used to build and expand commands.
#[derive(Clone, Copy)]
pub struct ExpansionContext<'a> {
    transaction: TransactionId,
    registry: &'a Registry,
    metadata: &'a dyn RelationMetadata,
    config: &'a Config,
}

impl<'a> ExpansionContext<'a> {
    /// Creates a context over one transaction's registry.
    #[must_use]
    pub fn new(
        transaction: TransactionId,
        registry: &'a Registry,
        metadata: &'a dyn RelationMetadata,
        config: &'a Config,
    ) -> Self {
        Self {
            transaction,
            registry,
            metadata,
            config,
        }
    }

    /// Returns the transaction being expanded against.
    #[must_use]
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    /// Returns the relation metadata.
    #[must_use]
    pub fn metadata(&self) -> &'a dyn RelationMetadata {
        self.metadata
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &'a Config {
        self.config
    }

    /// Returns a resolver over this registry.
    #[must_use]
    pub fn resolver(&self) -> OppositeEndPointResolver<'a> {
        OppositeEndPointResolver::new(self.registry, self.metadata, self.config)
    }
}

impl fmt::Debug for ExpansionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpansionContext")
            .field("transaction", &self.transaction)
            .finish_non_exhaustive()
    }
}

/// A reason a command cannot execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionBlocker {
    subject: String,
    reason: String,
}

impl ExecutionBlocker {
    /// Creates a blocker for an arbitrary subject.
    pub fn new(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Creates a blocker naming an entity.
    pub fn for_entity(entity: &EntityId, reason: impl Into<String>) -> Self {
        Self::new(entity.to_string(), reason)
    }

    /// Creates a blocker naming an end-point.
    pub fn for_end_point(end_point: &RelationEndPointId, reason: impl Into<String>) -> Self {
        Self::new(end_point.to_string(), reason)
    }

    /// Returns what is blocked.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Returns why.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for ExecutionBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.reason)
    }
}

/// A unit of mutation against one transaction.
#[derive(Debug)]
pub enum Command {
    /// Does nothing.
    Nop,
    /// Deletes one entity.
    Delete(DeleteCommand),
    /// Unloads entities with hooks and events.
    Unload(UnloadCommand),
    /// Evicts entity data without hooks or events.
    UnloadData(UnloadDataCommand),
    /// Removes end-points from the registry.
    UnregisterEndPoints(UnregisterEndPointsCommand),
    /// Drops the data of virtual end-points.
    MarkIncomplete(MarkVirtualEndPointsIncompleteCommand),
    /// Modifies one relation end-point.
    RelationChange(RelationChangeCommand),
    /// Runs children in protocol order.
    Composite(CompositeCommand),
    /// A command together with all of its fix-ups.
    Expanded(ExpandedCommand),
    /// Phases supplied as closures.
    AdHoc(AdHocCommand),
}

macro_rules! dispatch {
    ($command:expr, $inner:ident => $call:expr, nop => $nop:expr) => {
        match $command {
            Command::Nop => $nop,
            Command::Delete($inner) => $call,
            Command::Unload($inner) => $call,
            Command::UnloadData($inner) => $call,
            Command::UnregisterEndPoints($inner) => $call,
            Command::MarkIncomplete($inner) => $call,
            Command::RelationChange($inner) => $call,
            Command::Composite($inner) => $call,
            Command::Expanded($inner) => $call,
            Command::AdHoc($inner) => $call,
        }
    };
}

impl Command {
    /// Raises pre-change events.
    pub fn notify_begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        dispatch!(self, command => command.notify_begin(cx), nop => Ok(()))
    }

    /// Runs "about to change" hooks.
    pub fn begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        dispatch!(self, command => command.begin(cx), nop => Ok(()))
    }

    /// Applies the structural change.
    pub fn perform(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        dispatch!(self, command => command.perform(cx), nop => Ok(()))
    }

    /// Runs "changed" hooks.
    pub fn end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        dispatch!(self, command => command.end(cx), nop => Ok(()))
    }

    /// Raises post-change events.
    pub fn notify_end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        dispatch!(self, command => command.notify_end(cx), nop => Ok(()))
    }

    /// Runs all five phases in order, stopping at the first error.
    pub fn notify_and_perform(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        trace!(transaction = %cx.transaction(), command = %self, "notify_begin");
        self.notify_begin(cx)?;
        trace!(transaction = %cx.transaction(), command = %self, "begin");
        self.begin(cx)?;
        trace!(transaction = %cx.transaction(), command = %self, "perform");
        self.perform(cx)?;
        trace!(transaction = %cx.transaction(), command = %self, "end");
        self.end(cx)?;
        trace!(transaction = %cx.transaction(), command = %self, "notify_end");
        self.notify_end(cx)
    }

    /// Returns every reason the command cannot execute.
    #[must_use]
    pub fn exceptions(&self) -> Vec<ExecutionBlocker> {
        dispatch!(self, command => command.exceptions(), nop => Vec::new())
    }

    /// Returns true if nothing blocks the command.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        self.exceptions().is_empty()
    }

    /// Fails with [`CoreError::CommandBlocked`] if anything blocks the command.
    pub fn ensure_can_execute(&self) -> CoreResult<()> {
        let blockers = self.exceptions();
        if blockers.is_empty() {
            Ok(())
        } else {
            Err(CoreError::CommandBlocked { blockers })
        }
    }

    /// Returns the command followed by every fix-up needed to keep the
    /// opposite sides of its relations consistent.
    ///
    /// This only reads the registry. Expanding an [`ExpandedCommand`] returns
    /// it unchanged.
    pub fn expand_to_all_related_objects(
        self,
        cx: &ExpansionContext<'_>,
    ) -> CoreResult<ExpandedCommand> {
        let commands = match self {
            Self::Expanded(expanded) => return Ok(expanded),
            Self::Composite(composite) => composite.expand(cx)?,
            Self::Delete(delete) => delete.expand(cx)?,
            Self::RelationChange(change) => change.expand(cx)?,
            Self::AdHoc(ad_hoc) => ad_hoc.expand(cx)?,
            other => vec![other],
        };
        Ok(ExpandedCommand::new(commands))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, command => fmt::Display::fmt(command, f), nop => f.write_str("nop"))
    }
}

impl From<DeleteCommand> for Command {
    fn from(command: DeleteCommand) -> Self {
        Self::Delete(command)
    }
}

impl From<UnloadCommand> for Command {
    fn from(command: UnloadCommand) -> Self {
        Self::Unload(command)
    }
}

impl From<UnloadDataCommand> for Command {
    fn from(command: UnloadDataCommand) -> Self {
        Self::UnloadData(command)
    }
}

impl From<UnregisterEndPointsCommand> for Command {
    fn from(command: UnregisterEndPointsCommand) -> Self {
        Self::UnregisterEndPoints(command)
    }
}

impl From<MarkVirtualEndPointsIncompleteCommand> for Command {
    fn from(command: MarkVirtualEndPointsIncompleteCommand) -> Self {
        Self::MarkIncomplete(command)
    }
}

impl From<RelationChangeCommand> for Command {
    fn from(command: RelationChangeCommand) -> Self {
        Self::RelationChange(command)
    }
}

impl From<CompositeCommand> for Command {
    fn from(command: CompositeCommand) -> Self {
        Self::Composite(command)
    }
}

impl From<ExpandedCommand> for Command {
    fn from(command: ExpandedCommand) -> Self {
        Self::Expanded(command)
    }
}

impl From<AdHocCommand> for Command {
    fn from(command: AdHocCommand) -> Self {
        Self::AdHoc(command)
    }
}
