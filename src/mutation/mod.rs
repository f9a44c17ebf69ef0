//! Optimistic writes and the paused-mutation queue.

mod engine;
mod pending;

pub use engine::{Dispatched, MutationEngine, ResumeReport};
pub use pending::{Effect, MutationId, MutationPlan, MutationStatus, PendingMutation, Reconcile};

/// What a write returns to its caller
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
    /// Accepted by the store; the reconciled value
    Confirmed(T),
    /// Queued until the store is reachable; the optimistic value is visible meanwhile
    Paused { mutation_id: MutationId, optimistic: T },
}

impl<T> MutationOutcome<T> {
    pub fn is_paused(&self) -> bool {
        matches!(self, MutationOutcome::Paused { .. })
    }

    pub fn value(&self) -> &T {
        match self {
            MutationOutcome::Confirmed(value) | MutationOutcome::Paused { optimistic: value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            MutationOutcome::Confirmed(value) | MutationOutcome::Paused { optimistic: value, .. } => value,
        }
    }

    pub fn mutation_id(&self) -> Option<MutationId> {
        match self {
            MutationOutcome::Confirmed(_) => None,
            MutationOutcome::Paused { mutation_id, .. } => Some(*mutation_id),
        }
    }
}
