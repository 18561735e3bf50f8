//! # Conflict Classification
//!
//! A conflict means another actor changed the same object (in the cluster or
//! at the broker) after we read it. Status computed from that read must not be
//! written back.

use crate::controller::error::ReconcilerError;

/// True exactly when the broker answered 409 Conflict
pub fn is_conflict_osb_error(err: &ReconcilerError) -> bool {
    matches!(err, ReconcilerError::Osb(e) if crate::osb::error::is_conflict_osb_error(e))
}
