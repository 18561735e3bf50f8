//! # Reconciler Errors

use crate::controller::store::StoreError;
use crate::crd::condition::ConditionError;
use crate::osb::error::OsbError;

/// Error returned by a reconcile pass; the error policy requeues with backoff
#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Osb(#[from] OsbError),

    /// A step failed and was recorded on a status condition
    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error("{0}")]
    Invalid(String),
}
