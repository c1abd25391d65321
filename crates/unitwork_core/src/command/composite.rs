//! Composite and expanded commands.

use crate::command::{Command, CommandContext, ExecutionBlocker, ExpansionContext};
use crate::error::CoreResult;
use std::fmt;

/// Runs child commands as one command.
///
/// `notify_begin`, `begin` and `perform` visit the children first to last;
/// `end` and `notify_end` visit them last to first, so every child's "after"
/// phases see the structural changes of all its siblings.
#[derive(Debug, Default)]
pub struct CompositeCommand {
    commands: Vec<Command>,
}

impl CompositeCommand {
    /// Creates a composite over `commands`.
    #[must_use]
    pub fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    /// Appends a child.
    pub fn push(&mut self, command: impl Into<Command>) {
        self.commands.push(command.into());
    }

    /// Returns the number of children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if there are no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Iterates over the children in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }

    /// Returns the children.
    #[must_use]
    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    pub(crate) fn notify_begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        for command in &mut self.commands {
            command.notify_begin(cx)?;
        }
        Ok(())
    }

    pub(crate) fn begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        for command in &mut self.commands {
            command.begin(cx)?;
        }
        Ok(())
    }

    pub(crate) fn perform(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        for command in &mut self.commands {
            command.perform(cx)?;
        }
        Ok(())
    }

    pub(crate) fn end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        for command in self.commands.iter_mut().rev() {
            command.end(cx)?;
        }
        Ok(())
    }

    pub(crate) fn notify_end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        for command in self.commands.iter_mut().rev() {
            command.notify_end(cx)?;
        }
        Ok(())
    }

    pub(crate) fn exceptions(&self) -> Vec<ExecutionBlocker> {
        self.commands.iter().flat_map(Command::exceptions).collect()
    }

    pub(crate) fn expand(self, cx: &ExpansionContext<'_>) -> CoreResult<Vec<Command>> {
        let mut expanded = Vec::with_capacity(self.commands.len());
        for command in self.commands {
            expanded.extend(command.expand_to_all_related_objects(cx)?.into_commands());
        }
        Ok(expanded)
    }
}

impl FromIterator<Command> for CompositeCommand {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl fmt::Display for CompositeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "composite of {} commands", self.commands.len())
    }
}

/// A command followed by all of its fix-ups.
///
/// Produced by [`Command::expand_to_all_related_objects`]. Runs as a
/// [`CompositeCommand`]; expanding it again returns it unchanged.
#[derive(Debug, Default)]
pub struct ExpandedCommand {
    inner: CompositeCommand,
}

impl ExpandedCommand {
    /// Wraps already-expanded commands.
    #[must_use]
    pub fn new(commands: Vec<Command>) -> Self {
        Self {
            inner: CompositeCommand::new(commands),
        }
    }

    /// Returns the number of commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if there are no commands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over the commands in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.inner.iter()
    }

    /// Returns the commands.
    #[must_use]
    pub fn into_commands(self) -> Vec<Command> {
        self.inner.into_commands()
    }

    /// Wraps the expansion as a [`Command`].
    #[must_use]
    pub fn into_command(self) -> Command {
        Command::Expanded(self)
    }

    pub(crate) fn notify_begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.inner.notify_begin(cx)
    }

    pub(crate) fn begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.inner.begin(cx)
    }

    pub(crate) fn perform(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.inner.perform(cx)
    }

    pub(crate) fn end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.inner.end(cx)
    }

    pub(crate) fn notify_end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        self.inner.notify_end(cx)
    }

    pub(crate) fn exceptions(&self) -> Vec<ExecutionBlocker> {
        self.inner.exceptions()
    }
}

impl fmt::Display for ExpandedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.iter().next() {
            Some(first) => write!(f, "{first} with {} fix-ups", self.len() - 1),
            None => f.write_str("empty expansion"),
        }
    }
}
