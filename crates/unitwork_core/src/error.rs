//! Error types for unitwork core.

use crate::command::ExecutionBlocker;
use crate::endpoint::RelationEndPointId;
use crate::entity::{EntityId, EntityState};
use crate::types::TransactionId;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in unitwork core operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Entity is unknown to the transaction and its persistence provider.
    #[error("entity not found: {entity}")]
    EntityNotFound {
        /// The identity that was looked up.
        entity: EntityId,
    },

    /// Entity is in a state that does not permit the operation.
    #[error("cannot {operation} entity {entity} in state {state}")]
    InvalidState {
        /// The entity.
        entity: EntityId,
        /// Its current state.
        state: EntityState,
        /// The rejected operation.
        operation: &'static str,
    },

    /// An argument failed validation.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Transaction id does not name an open transaction.
    #[error("transaction not found: {transaction}")]
    TransactionNotFound {
        /// The transaction id.
        transaction: TransactionId,
    },

    /// Transaction has an open sub-transaction and is not unlocked.
    #[error("transaction {transaction} is read-only")]
    TransactionReadOnly {
        /// The transaction id.
        transaction: TransactionId,
    },

    /// Transaction has been discarded.
    #[error("transaction {transaction} has been discarded")]
    TransactionDiscarded {
        /// The transaction id.
        transaction: TransactionId,
    },

    /// Hierarchy would exceed the configured depth.
    #[error("transaction hierarchy too deep: limit is {limit}")]
    HierarchyTooDeep {
        /// Configured maximum depth.
        limit: usize,
    },

    /// End-point is not registered in the transaction.
    #[error("end-point not registered: {end_point}")]
    EndPointNotFound {
        /// The end-point id.
        end_point: RelationEndPointId,
    },

    /// Virtual end-point data has not been loaded.
    #[error("end-point data is incomplete: {end_point}")]
    EndPointIncomplete {
        /// The end-point id.
        end_point: RelationEndPointId,
    },

    /// No relation metadata exists for the end-point.
    #[error("unknown relation: {end_point}")]
    UnknownRelation {
        /// The end-point id.
        end_point: RelationEndPointId,
    },

    /// Operation does not fit the end-point's cardinality.
    #[error("cardinality mismatch on {end_point}: {message}")]
    CardinalityMismatch {
        /// The end-point id.
        end_point: RelationEndPointId,
        /// Description of the mismatch.
        message: String,
    },

    /// A command guard reported blockers.
    #[error("command cannot execute: {}", describe_blockers(.blockers))]
    CommandBlocked {
        /// Accumulated blockers.
        blockers: Vec<ExecutionBlocker>,
    },

    /// A listener or hook vetoed the change.
    #[error("vetoed: {reason}")]
    Vetoed {
        /// Reason given by the observer.
        reason: String,
    },

    /// Persistence provider failure.
    #[error("persistence error: {message}")]
    Persistence {
        /// Description of the failure.
        message: String,
    },
}

fn describe_blockers(blockers: &[ExecutionBlocker]) -> String {
    blockers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CoreError {
    /// Creates an entity not found error.
    pub fn entity_not_found(entity: &EntityId) -> Self {
        Self::EntityNotFound {
            entity: entity.clone(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(entity: &EntityId, state: EntityState, operation: &'static str) -> Self {
        Self::InvalidState {
            entity: entity.clone(),
            state,
            operation,
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an end-point not found error.
    pub fn end_point_not_found(end_point: &RelationEndPointId) -> Self {
        Self::EndPointNotFound {
            end_point: end_point.clone(),
        }
    }

    /// Creates an end-point incomplete error.
    pub fn end_point_incomplete(end_point: &RelationEndPointId) -> Self {
        Self::EndPointIncomplete {
            end_point: end_point.clone(),
        }
    }

    /// Creates an unknown relation error.
    pub fn unknown_relation(end_point: &RelationEndPointId) -> Self {
        Self::UnknownRelation {
            end_point: end_point.clone(),
        }
    }

    /// Creates a cardinality mismatch error.
    pub fn cardinality_mismatch(
        end_point: &RelationEndPointId,
        message: impl Into<String>,
    ) -> Self {
        Self::CardinalityMismatch {
            end_point: end_point.clone(),
            message: message.into(),
        }
    }

    /// Creates a veto error.
    pub fn vetoed(reason: impl Into<String>) -> Self {
        Self::Vetoed {
            reason: reason.into(),
        }
    }

    /// Creates a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassId;

    #[test]
    fn blocked_message_lists_every_blocker() {
        let entity = EntityId::new(ClassId::new("Order"));
        let err = CoreError::CommandBlocked {
            blockers: vec![
                ExecutionBlocker::for_entity(&entity, "has pending changes"),
                ExecutionBlocker::new("Customer/x.orders", "end-point has changed"),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("has pending changes"));
        assert!(message.contains("end-point has changed"));
    }

    #[test]
    fn invalid_state_names_operation() {
        let entity = EntityId::new(ClassId::new("Order"));
        let err = CoreError::invalid_state(&entity, EntityState::Deleted, "delete");
        assert!(err.to_string().starts_with("cannot delete entity"));
    }
}
