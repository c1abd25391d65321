//! Commands assembled from closures.

use crate::command::{Command, CommandContext, ExecutionBlocker, ExpansionContext};
use crate::error::CoreResult;
use std::fmt;

/// Handler for one phase of an [`AdHocCommand`].
pub type PhaseHandler = Box<dyn FnMut(&mut CommandContext<'_>) -> CoreResult<()>>;

/// Produces the fix-ups of an [`AdHocCommand`].
pub type CommandExpander = Box<dyn FnOnce(&ExpansionContext<'_>) -> CoreResult<Vec<Command>>>;

/// A command whose phases and expansion are supplied by the caller.
///
/// Unset phases do nothing. Without an expander the command expands to
/// itself alone.
///
/// ```rust
/// use unitwork_core::{AdHocCommand, Command};
///
/// let command: Command = AdHocCommand::new("audit")
///     .on_perform(|cx| {
///         println!("running in {}", cx.transaction());
///         Ok(())
///     })
///     .into();
/// assert!(command.can_execute());
/// ```
pub struct AdHocCommand {
    description: String,
    notify_begin: Option<PhaseHandler>,
    begin: Option<PhaseHandler>,
    perform: Option<PhaseHandler>,
    end: Option<PhaseHandler>,
    notify_end: Option<PhaseHandler>,
    expander: Option<CommandExpander>,
    blockers: Vec<ExecutionBlocker>,
}

impl AdHocCommand {
    /// Creates a command that does nothing yet.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            notify_begin: None,
            begin: None,
            perform: None,
            end: None,
            notify_end: None,
            expander: None,
            blockers: Vec::new(),
        }
    }

    /// Sets the `notify_begin` handler.
    #[must_use]
    pub fn on_notify_begin(
        mut self,
        handler: impl FnMut(&mut CommandContext<'_>) -> CoreResult<()> + 'static,
    ) -> Self {
        self.notify_begin = Some(Box::new(handler));
        self
    }

    /// Sets the `begin` handler.
    #[must_use]
    pub fn on_begin(
        mut self,
        handler: impl FnMut(&mut CommandContext<'_>) -> CoreResult<()> + 'static,
    ) -> Self {
        self.begin = Some(Box::new(handler));
        self
    }

    /// Sets the `perform` handler.
    #[must_use]
    pub fn on_perform(
        mut self,
        handler: impl FnMut(&mut CommandContext<'_>) -> CoreResult<()> + 'static,
    ) -> Self {
        self.perform = Some(Box::new(handler));
        self
    }

    /// Sets the `end` handler.
    #[must_use]
    pub fn on_end(
        mut self,
        handler: impl FnMut(&mut CommandContext<'_>) -> CoreResult<()> + 'static,
    ) -> Self {
        self.end = Some(Box::new(handler));
        self
    }

    /// Sets the `notify_end` handler.
    #[must_use]
    pub fn on_notify_end(
        mut self,
        handler: impl FnMut(&mut CommandContext<'_>) -> CoreResult<()> + 'static,
    ) -> Self {
        self.notify_end = Some(Box::new(handler));
        self
    }

    /// Sets the expander. Its commands follow this one in the expansion.
    #[must_use]
    pub fn with_expander(
        mut self,
        expander: impl FnOnce(&ExpansionContext<'_>) -> CoreResult<Vec<Command>> + 'static,
    ) -> Self {
        self.expander = Some(Box::new(expander));
        self
    }

    /// Adds a reason the command cannot execute.
    #[must_use]
    pub fn blocked_by(mut self, blocker: ExecutionBlocker) -> Self {
        self.blockers.push(blocker);
        self
    }

    /// Returns the description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn notify_begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        run(&mut self.notify_begin, cx)
    }

    pub(crate) fn begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        run(&mut self.begin, cx)
    }

    pub(crate) fn perform(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        run(&mut self.perform, cx)
    }

    pub(crate) fn end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        run(&mut self.end, cx)
    }

    pub(crate) fn notify_end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        run(&mut self.notify_end, cx)
    }

    pub(crate) fn exceptions(&self) -> Vec<ExecutionBlocker> {
        self.blockers.clone()
    }

    pub(crate) fn expand(mut self, cx: &ExpansionContext<'_>) -> CoreResult<Vec<Command>> {
        let fix_ups = match self.expander.take() {
            Some(expander) => expander(cx)?,
            None => Vec::new(),
        };
        let mut commands = Vec::with_capacity(fix_ups.len() + 1);
        commands.push(Command::AdHoc(self));
        commands.extend(fix_ups);
        Ok(commands)
    }
}

fn run(handler: &mut Option<PhaseHandler>, cx: &mut CommandContext<'_>) -> CoreResult<()> {
    match handler {
        Some(handler) => handler(cx),
        None => Ok(()),
    }
}

impl fmt::Display for AdHocCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ad hoc command '{}'", self.description)
    }
}

impl fmt::Debug for AdHocCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdHocCommand")
            .field("description", &self.description)
            .field("has_expander", &self.expander.is_some())
            .field("blockers", &self.blockers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventSink;
    use crate::hooks::HookRegistry;
    use crate::metadata::StaticMetadata;
    use crate::registry::Registry;
    use crate::types::TransactionId;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn unset_phases_are_no_ops() {
        let performed = Rc::new(Cell::new(0));
        let counter = Rc::clone(&performed);
        let mut command: Command = AdHocCommand::new("count")
            .on_perform(move |_| {
                counter.set(counter.get() + 1);
                Ok(())
            })
            .into();

        let mut registry = Registry::new();
        let events = EventSink::new();
        let hooks = HookRegistry::new();
        let mut cx = CommandContext::new(TransactionId::new(1), &mut registry, &events, &hooks);
        command.notify_and_perform(&mut cx).unwrap();
        command.notify_and_perform(&mut cx).unwrap();

        assert_eq!(performed.get(), 2);
    }

    #[test]
    fn without_expander_expands_to_itself() {
        let registry = Registry::new();
        let metadata = StaticMetadata::default();
        let config = Config::default();
        let cx = ExpansionContext::new(TransactionId::new(1), &registry, &metadata, &config);

        let expanded = Command::from(AdHocCommand::new("alone"))
            .expand_to_all_related_objects(&cx)
            .unwrap();
        assert_eq!(expanded.len(), 1);
        assert_eq!(
            expanded.iter().next().map(ToString::to_string),
            Some("ad hoc command 'alone'".to_owned())
        );
    }

    #[test]
    fn expander_sees_the_expansion_context() {
        let registry = Registry::new();
        let metadata = StaticMetadata::default();
        let config = Config::default();
        let cx = ExpansionContext::new(TransactionId::new(9), &registry, &metadata, &config);

        let expanded = Command::from(AdHocCommand::new("fan out").with_expander(|cx| {
            assert_eq!(cx.transaction(), TransactionId::new(9));
            Ok(vec![Command::Nop])
        }))
        .expand_to_all_related_objects(&cx)
        .unwrap();
        assert_eq!(expanded.len(), 2);
    }
}
