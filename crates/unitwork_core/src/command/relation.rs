//! Relation changes and their bidirectional fix-ups.

use crate::command::{Command, CommandContext, ExecutionBlocker, ExpansionContext};
use crate::endpoint::{RelationEndPoint, RelationEndPointId, VirtualEndPoint};
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::events::RelationDelta;
use crate::metadata::{Cardinality, RelationEndPointDefinition};
use std::fmt;

/// What a [`RelationChangeCommand`] does to its end-point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationModification {
    /// Replaces the opposite of a single-valued end-point.
    Set {
        /// Opposite before the change.
        old: Option<EntityId>,
        /// Opposite after the change.
        new: Option<EntityId>,
    },
    /// Appends to a collection.
    Add(EntityId),
    /// Removes from a collection.
    Remove(EntityId),
    /// Empties a virtual end-point.
    Clear {
        /// Opposites before the change.
        old: Vec<EntityId>,
    },
}

impl RelationModification {
    fn deltas(&self, end_point: &RelationEndPointId) -> Vec<RelationDelta> {
        let delta = |old: Option<&EntityId>, new: Option<&EntityId>| RelationDelta {
            end_point: end_point.clone(),
            old: old.cloned(),
            new: new.cloned(),
        };
        match self {
            Self::Set { old, new } => vec![delta(old.as_ref(), new.as_ref())],
            Self::Add(item) => vec![delta(None, Some(item))],
            Self::Remove(item) => vec![delta(Some(item), None)],
            Self::Clear { old } => old.iter().map(|item| delta(Some(item), None)).collect(),
        }
    }
}

/// Modifies one relation end-point.
///
/// Commands built by the public constructors expand to the change plus the
/// fix-ups that keep the opposite end-points consistent. Fix-ups and the
/// detach commands of a delete do not expand further.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationChangeCommand {
    end_point: RelationEndPointId,
    modification: RelationModification,
    expands: bool,
    deltas: Vec<RelationDelta>,
}

impl RelationChangeCommand {
    fn build(
        end_point: RelationEndPointId,
        modification: RelationModification,
        expands: bool,
    ) -> Self {
        let deltas = modification.deltas(&end_point);
        Self {
            end_point,
            modification,
            expands,
            deltas,
        }
    }

    /// Sets a real or single-valued virtual end-point to `new`.
    ///
    /// # Errors
    ///
    /// Fails if the end-point is not registered, is an incomplete virtual
    /// end-point, is a collection, or `new` is of the wrong class.
    pub fn set(
        cx: &ExpansionContext<'_>,
        end_point: RelationEndPointId,
        new: Option<EntityId>,
    ) -> CoreResult<Self> {
        let definition = definition(cx, &end_point)?;
        if let Some(target) = &new {
            check_target_class(&definition, &end_point, target)?;
        }
        let old = match registered(cx, &end_point)? {
            RelationEndPoint::Real(real) => real.opposite().cloned(),
            RelationEndPoint::Virtual(virtual_end_point) => {
                if virtual_end_point.cardinality() == Cardinality::Many {
                    return Err(CoreError::cardinality_mismatch(
                        &end_point,
                        "cannot set a collection; use add or remove",
                    ));
                }
                virtual_end_point
                    .opposites()
                    .ok_or_else(|| CoreError::end_point_incomplete(&end_point))?
                    .first()
                    .cloned()
            }
        };
        Ok(Self::build(end_point, RelationModification::Set { old, new }, true))
    }

    /// Adds `item` to a collection end-point.
    ///
    /// # Errors
    ///
    /// Fails if the end-point is not a complete collection or `item` is of the
    /// wrong class.
    pub fn add(
        cx: &ExpansionContext<'_>,
        end_point: RelationEndPointId,
        item: EntityId,
    ) -> CoreResult<Self> {
        let definition = definition(cx, &end_point)?;
        check_target_class(&definition, &end_point, &item)?;
        collection(cx, &end_point)?;
        Ok(Self::build(end_point, RelationModification::Add(item), true))
    }

    /// Removes `item` from a collection end-point.
    ///
    /// # Errors
    ///
    /// Fails if the end-point is not a complete collection containing `item`.
    pub fn remove(
        cx: &ExpansionContext<'_>,
        end_point: RelationEndPointId,
        item: EntityId,
    ) -> CoreResult<Self> {
        definition(cx, &end_point)?;
        if !collection(cx, &end_point)?.contains(&item) {
            return Err(CoreError::invalid_argument(format!(
                "{item} is not related through {end_point}"
            )));
        }
        Ok(Self::build(end_point, RelationModification::Remove(item), true))
    }

    /// Detaches an end-point from everything it references.
    ///
    /// Returns `None` for end-points that reference nothing or whose data is
    /// not loaded.
    #[must_use]
    pub fn detach(end_point: &RelationEndPoint) -> Option<Self> {
        let modification = match end_point {
            RelationEndPoint::Real(real) => RelationModification::Set {
                old: Some(real.opposite()?.clone()),
                new: None,
            },
            RelationEndPoint::Virtual(virtual_end_point) => {
                let old = virtual_end_point.opposites()?.to_vec();
                if old.is_empty() {
                    return None;
                }
                RelationModification::Clear { old }
            }
        };
        Some(Self::build(end_point.id().clone(), modification, false))
    }

    /// Removes `target` from an end-point that references it.
    ///
    /// # Errors
    ///
    /// Fails if the end-point is not registered or does not reference `target`.
    pub fn remove_reference(
        cx: &ExpansionContext<'_>,
        end_point: RelationEndPointId,
        target: &EntityId,
    ) -> CoreResult<Self> {
        let registered = registered(cx, &end_point)?;
        if !registered.references(target) {
            return Err(CoreError::invalid_argument(format!(
                "{end_point} does not reference {target}"
            )));
        }
        let modification = match registered {
            RelationEndPoint::Virtual(v) if v.cardinality() == Cardinality::Many => {
                RelationModification::Remove(target.clone())
            }
            _ => RelationModification::Set {
                old: Some(target.clone()),
                new: None,
            },
        };
        Ok(Self::build(end_point, modification, false))
    }

    fn fix_up(end_point: RelationEndPointId, modification: RelationModification) -> Command {
        Command::RelationChange(Self::build(end_point, modification, false))
    }

    /// Returns the modified end-point.
    #[must_use]
    pub fn end_point(&self) -> &RelationEndPointId {
        &self.end_point
    }

    /// Returns the modification.
    #[must_use]
    pub fn modification(&self) -> &RelationModification {
        &self.modification
    }

    /// Returns true if expansion adds fix-ups for the opposite side.
    #[must_use]
    pub fn expands(&self) -> bool {
        self.expands
    }

    fn owner(&self) -> &EntityId {
        self.end_point.entity()
    }

    pub(crate) fn notify_begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        let tx = cx.transaction();
        for delta in &self.deltas {
            cx.events().relation_changing(tx, delta)?;
        }
        Ok(())
    }

    pub(crate) fn begin(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        let tx = cx.transaction();
        for delta in &self.deltas {
            cx.hooks()
                .each(self.owner(), |hooks| hooks.on_relation_changing(tx, delta))?;
        }
        Ok(())
    }

    pub(crate) fn perform(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        let end_point = cx
            .registry_mut()
            .end_point_mut(&self.end_point)
            .ok_or_else(|| CoreError::end_point_not_found(&self.end_point))?;

        match (&self.modification, end_point) {
            (RelationModification::Set { new, .. }, RelationEndPoint::Real(real)) => {
                real.set_opposite(new.clone());
                Ok(())
            }
            (RelationModification::Set { new, .. }, RelationEndPoint::Virtual(v)) => {
                v.set_single(new.clone())
            }
            (RelationModification::Add(item), RelationEndPoint::Virtual(v)) => v.add(item.clone()),
            (RelationModification::Remove(item), RelationEndPoint::Virtual(v)) => v.remove(item),
            (RelationModification::Clear { .. }, RelationEndPoint::Virtual(v)) => v.clear(),
            (_, RelationEndPoint::Real(_)) => Err(CoreError::cardinality_mismatch(
                &self.end_point,
                "real end-points can only be set",
            )),
        }
    }

    pub(crate) fn end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        let tx = cx.transaction();
        for delta in self.deltas.iter().rev() {
            cx.hooks()
                .each(self.owner(), |hooks| hooks.on_relation_changed(tx, delta))?;
        }
        Ok(())
    }

    pub(crate) fn notify_end(&mut self, cx: &mut CommandContext<'_>) -> CoreResult<()> {
        let tx = cx.transaction();
        for delta in self.deltas.iter().rev() {
            cx.events().relation_changed(tx, delta)?;
        }
        Ok(())
    }

    pub(crate) fn exceptions(&self) -> Vec<ExecutionBlocker> {
        Vec::new()
    }

    pub(crate) fn expand(self, cx: &ExpansionContext<'_>) -> CoreResult<Vec<Command>> {
        if !self.expands {
            return Ok(vec![Command::RelationChange(self)]);
        }
        let definition = definition(cx, &self.end_point)?;
        let fix_ups = match &definition.opposite {
            Some(_) => self.fix_ups(cx, &definition)?,
            None => Vec::new(),
        };

        let mut commands = Vec::with_capacity(fix_ups.len() + 1);
        commands.push(Command::RelationChange(self));
        commands.extend(fix_ups);
        Ok(commands)
    }

    fn fix_ups(
        &self,
        cx: &ExpansionContext<'_>,
        definition: &RelationEndPointDefinition,
    ) -> CoreResult<Vec<Command>> {
        let owner = self.owner();
        let opposite_of = |entity: &EntityId| {
            definition
                .opposite_end_point_id(entity)
                .ok_or_else(|| CoreError::unknown_relation(&self.end_point))
        };
        let mut fix_ups = Vec::new();

        match &self.modification {
            RelationModification::Set { old, new } if old == new => {}
            RelationModification::Set { old, new } if !definition.is_virtual() => {
                // The opposite side is virtual: a collection or a one-to-one.
                if let Some(old) = old {
                    fix_ups.extend(detach_from_virtual(cx, opposite_of(old)?, owner));
                }
                if let Some(new) = new {
                    let target = opposite_of(new)?;
                    if let Some(previous) = complete_virtual(cx, &target) {
                        match previous.cardinality() {
                            Cardinality::Many => {
                                fix_ups.push(Self::fix_up(
                                    target,
                                    RelationModification::Add(owner.clone()),
                                ));
                            }
                            Cardinality::One => {
                                let displaced = previous
                                    .opposites()
                                    .and_then(<[EntityId]>::first)
                                    .filter(|displaced| *displaced != owner)
                                    .cloned();
                                if let Some(displaced) = &displaced {
                                    let displaced_end_point = self.end_point_of(displaced);
                                    registered(cx, &displaced_end_point)?;
                                    fix_ups.push(Self::fix_up(
                                        displaced_end_point,
                                        RelationModification::Set {
                                            old: Some(new.clone()),
                                            new: None,
                                        },
                                    ));
                                }
                                fix_ups.push(Self::fix_up(
                                    target,
                                    RelationModification::Set {
                                        old: displaced,
                                        new: Some(owner.clone()),
                                    },
                                ));
                            }
                        }
                    }
                }
            }
            RelationModification::Set { old, new } => {
                // A single-valued virtual end-point; the opposite side is real.
                if let Some(old) = old {
                    let target = opposite_of(old)?;
                    if real_value(cx, &target)?.as_ref() == Some(owner) {
                        fix_ups.push(Self::fix_up(
                            target,
                            RelationModification::Set {
                                old: Some(owner.clone()),
                                new: None,
                            },
                        ));
                    }
                }
                if let Some(new) = new {
                    let target = opposite_of(new)?;
                    let displaced = real_value(cx, &target)?;
                    if let Some(displaced) = displaced.as_ref().filter(|d| *d != owner) {
                        fix_ups.extend(detach_from_virtual(cx, self.end_point_of(displaced), new));
                    }
                    fix_ups.push(Self::fix_up(
                        target,
                        RelationModification::Set {
                            old: displaced,
                            new: Some(owner.clone()),
                        },
                    ));
                }
            }
            RelationModification::Add(item) => {
                let target = opposite_of(item)?;
                let previous = real_value(cx, &target)?;
                if previous.as_ref() != Some(owner) {
                    if let Some(previous) = &previous {
                        fix_ups.extend(detach_from_virtual(cx, self.end_point_of(previous), item));
                    }
                    fix_ups.push(Self::fix_up(
                        target,
                        RelationModification::Set {
                            old: previous,
                            new: Some(owner.clone()),
                        },
                    ));
                }
            }
            RelationModification::Remove(item) => {
                let target = opposite_of(item)?;
                if real_value(cx, &target)?.as_ref() == Some(owner) {
                    fix_ups.push(Self::fix_up(
                        target,
                        RelationModification::Set {
                            old: Some(owner.clone()),
                            new: None,
                        },
                    ));
                }
            }
            RelationModification::Clear { old } => {
                for item in old {
                    let target = opposite_of(item)?;
                    if real_value(cx, &target)?.as_ref() == Some(owner) {
                        fix_ups.push(Self::fix_up(
                            target,
                            RelationModification::Set {
                                old: Some(owner.clone()),
                                new: None,
                            },
                        ));
                    }
                }
            }
        }
        Ok(fix_ups)
    }

    /// The end-point with this command's property on another entity.
    fn end_point_of(&self, entity: &EntityId) -> RelationEndPointId {
        RelationEndPointId::new(entity.clone(), self.end_point.property_arc().clone())
    }
}

impl fmt::Display for RelationChangeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.modification {
            RelationModification::Set { new: Some(new), .. } => {
                write!(f, "set {} to {new}", self.end_point)
            }
            RelationModification::Set { new: None, .. } => {
                write!(f, "set {} to none", self.end_point)
            }
            RelationModification::Add(item) => write!(f, "add {item} to {}", self.end_point),
            RelationModification::Remove(item) => {
                write!(f, "remove {item} from {}", self.end_point)
            }
            RelationModification::Clear { .. } => write!(f, "clear {}", self.end_point),
        }
    }
}

fn definition(
    cx: &ExpansionContext<'_>,
    end_point: &RelationEndPointId,
) -> CoreResult<RelationEndPointDefinition> {
    cx.metadata()
        .definition(end_point)
        .ok_or_else(|| CoreError::unknown_relation(end_point))
}

fn registered<'a>(
    cx: &ExpansionContext<'a>,
    end_point: &RelationEndPointId,
) -> CoreResult<&'a RelationEndPoint> {
    cx.registry()
        .end_point(end_point)
        .ok_or_else(|| CoreError::end_point_not_found(end_point))
}

fn collection<'a>(
    cx: &ExpansionContext<'a>,
    end_point: &RelationEndPointId,
) -> CoreResult<&'a [EntityId]> {
    let virtual_end_point = registered(cx, end_point)?
        .as_virtual()
        .filter(|v| v.cardinality() == Cardinality::Many)
        .ok_or_else(|| CoreError::cardinality_mismatch(end_point, "not a collection"))?;
    virtual_end_point
        .opposites()
        .ok_or_else(|| CoreError::end_point_incomplete(end_point))
}

fn real_value(
    cx: &ExpansionContext<'_>,
    end_point: &RelationEndPointId,
) -> CoreResult<Option<EntityId>> {
    registered(cx, end_point)?
        .as_real()
        .map(|real| real.opposite().cloned())
        .ok_or_else(|| CoreError::cardinality_mismatch(end_point, "expected a real end-point"))
}

/// Returns a registered, complete virtual end-point. Incomplete ones are
/// reconciled with the real side when they are next loaded.
fn complete_virtual<'a>(
    cx: &ExpansionContext<'a>,
    end_point: &RelationEndPointId,
) -> Option<&'a VirtualEndPoint> {
    cx.registry()
        .end_point(end_point)
        .and_then(RelationEndPoint::as_virtual)
        .filter(|v| v.is_complete())
}

/// Removes `item` from a virtual end-point, if it is loaded and holds it.
fn detach_from_virtual(
    cx: &ExpansionContext<'_>,
    end_point: RelationEndPointId,
    item: &EntityId,
) -> Option<Command> {
    let virtual_end_point = complete_virtual(cx, &end_point)?;
    if !virtual_end_point.contains(item) {
        return None;
    }
    let modification = match virtual_end_point.cardinality() {
        Cardinality::Many => RelationModification::Remove(item.clone()),
        Cardinality::One => RelationModification::Set {
            old: Some(item.clone()),
            new: None,
        },
    };
    Some(RelationChangeCommand::fix_up(end_point, modification))
}

fn check_target_class(
    definition: &RelationEndPointDefinition,
    end_point: &RelationEndPointId,
    target: &EntityId,
) -> CoreResult<()> {
    match &definition.opposite {
        Some(opposite) if opposite.class != *target.class() => Err(CoreError::invalid_argument(
            format!("{end_point} relates to {}, not {}", opposite.class, target.class()),
        )),
        _ => Ok(()),
    }
}
