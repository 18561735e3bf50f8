//! # Conditions
//!
//! Living condition sets for the kf resources.
//!
//! A condition set has one happy condition (`Ready`) and a list of dependents.
//! Marking a dependent updates the happy condition:
//!
//! - every dependent True makes Ready True
//! - a False dependent makes Ready False with the same reason and message
//! - an Unknown dependent makes Ready Unknown unless another dependent is False
//!
//! `lastTransitionTime` only moves when status, reason or message change, so
//! re-marking a condition with the same values leaves the status semantically equal.

use crate::controller::error::ReconcilerError;
use crate::controller::store::StoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of the happy condition in every set
pub const CONDITION_READY: &str = "Ready";

/// Status of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        })
    }
}

/// Condition represents an observation of one aspect of a resource
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,
    /// Last transition time (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// Machine readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human readable message for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(condition_type: &str, status: ConditionStatus, reason: &str, message: &str) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status,
            last_transition_time: None,
            reason: (!reason.is_empty()).then(|| reason.to_string()),
            message: (!message.is_empty()).then(|| message.to_string()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    pub fn is_false(&self) -> bool {
        self.status == ConditionStatus::False
    }

    pub fn is_unknown(&self) -> bool {
        self.status == ConditionStatus::Unknown
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }

    fn transitioned_at(&self) -> Option<DateTime<Utc>> {
        self.last_transition_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Errors produced when a condition is marked as failed.
///
/// The message is the same text that lands on the condition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("{0}")]
    Reconciliation(String),
    #[error("{0}")]
    NotOwned(String),
    #[error("{0}")]
    Template(String),
    #[error("{0}")]
    Timeout(String),
}

/// Failure described only by its message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MessageError(pub String);

/// A happy condition plus the dependents that feed it
#[derive(Debug, Clone, Copy)]
pub struct ConditionSet {
    happy: &'static str,
    dependents: &'static [&'static str],
}

impl ConditionSet {
    pub const fn new(dependents: &'static [&'static str]) -> Self {
        Self {
            happy: CONDITION_READY,
            dependents,
        }
    }

    /// Manage the given condition list with this set's rules
    pub fn manage<'a>(&self, conditions: &'a mut Vec<Condition>) -> ConditionManager<'a> {
        ConditionManager {
            set: *self,
            conditions,
        }
    }
}

/// Applies a [`ConditionSet`] to a mutable condition list
#[derive(Debug)]
pub struct ConditionManager<'a> {
    set: ConditionSet,
    conditions: &'a mut Vec<Condition>,
}

impl ConditionManager<'_> {
    /// Add an Unknown condition for the happy type and every dependent that is missing
    pub fn initialize_conditions(&mut self) {
        let happy_status = self
            .get_condition(self.set.happy)
            .map_or(ConditionStatus::Unknown, |c| c.status);
        if self.get_condition(self.set.happy).is_none() {
            self.set_condition(Condition::new(
                self.set.happy,
                ConditionStatus::Unknown,
                "",
                "",
            ));
        }
        // A happy set stays happy, its dependents are all True already
        let dependent_status = if happy_status == ConditionStatus::True {
            ConditionStatus::True
        } else {
            ConditionStatus::Unknown
        };
        for dependent in self.set.dependents {
            if self.get_condition(dependent).is_none() {
                self.set_condition(Condition::new(dependent, dependent_status, "", ""));
            }
        }
    }

    pub fn get_condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }

    pub fn is_happy(&self) -> bool {
        self.get_condition(self.set.happy)
            .is_some_and(Condition::is_true)
    }

    /// Replace the condition of the same type, keeping the transition time
    /// when nothing observable changed
    pub fn set_condition(&mut self, mut condition: Condition) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        match self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            Some(existing) => {
                if existing.same_state(&condition) {
                    return;
                }
                condition.last_transition_time = Some(now);
                *existing = condition;
            }
            None => {
                condition.last_transition_time = Some(now);
                self.conditions.push(condition);
            }
        }
        self.conditions.sort_by(|a, b| a.r#type.cmp(&b.r#type));
    }

    pub fn mark_true(&mut self, condition_type: &str) {
        self.set_condition(Condition::new(condition_type, ConditionStatus::True, "", ""));

        let all_true = self
            .set
            .dependents
            .iter()
            .all(|d| self.get_condition(d).is_some_and(Condition::is_true));
        if all_true {
            self.set_condition(Condition::new(
                self.set.happy,
                ConditionStatus::True,
                "",
                "",
            ));
        }
    }

    pub fn mark_unknown(&mut self, condition_type: &str, reason: &str, message: &str) {
        self.set_condition(Condition::new(
            condition_type,
            ConditionStatus::Unknown,
            reason,
            message,
        ));

        if condition_type == self.set.happy {
            return;
        }

        // False dependents win over Unknown ones
        let failed = self
            .set
            .dependents
            .iter()
            .any(|d| self.get_condition(d).is_some_and(Condition::is_false));
        if failed {
            if !self
                .get_condition(self.set.happy)
                .is_some_and(Condition::is_false)
            {
                self.set_condition(Condition::new(
                    self.set.happy,
                    ConditionStatus::False,
                    reason,
                    message,
                ));
            }
            return;
        }

        if self.set.dependents.contains(&condition_type) {
            self.set_condition(Condition::new(
                self.set.happy,
                ConditionStatus::Unknown,
                reason,
                message,
            ));
        }
    }

    pub fn mark_false(&mut self, condition_type: &str, reason: &str, message: &str) {
        self.set_condition(Condition::new(
            condition_type,
            ConditionStatus::False,
            reason,
            message,
        ));

        if condition_type != self.set.happy && self.set.dependents.contains(&condition_type) {
            self.set_condition(Condition::new(
                self.set.happy,
                ConditionStatus::False,
                reason,
                message,
            ));
        }
    }
}

/// Manager for the condition of a single child resource
#[derive(Debug)]
pub struct SingleCondition<'a> {
    manager: ConditionManager<'a>,
    destination: &'static str,
    child: &'static str,
}

impl<'a> SingleCondition<'a> {
    pub fn new(
        set: ConditionSet,
        conditions: &'a mut Vec<Condition>,
        destination: &'static str,
        child: &'static str,
    ) -> Self {
        Self {
            manager: set.manage(conditions),
            destination,
            child,
        }
    }

    pub fn get(&self) -> Option<&Condition> {
        self.manager.get_condition(self.destination)
    }

    pub fn mark_success(&mut self) {
        self.manager.mark_true(self.destination);
    }

    pub fn mark_unknown(&mut self, reason: &str, message: &str) {
        self.manager.mark_unknown(self.destination, reason, message);
    }

    pub fn mark_false(&mut self, reason: &str, message: &str) {
        self.manager.mark_false(self.destination, reason, message);
    }

    /// Mark that an object with the child's name exists but is controlled by someone else
    pub fn mark_child_not_owned(&mut self, child_name: &str) -> ConditionError {
        let message = format!(
            "There is an existing {} {:?} that we do not own.",
            self.child, child_name
        );
        self.manager
            .mark_false(self.destination, "NotOwned", &message);
        ConditionError::NotOwned(message)
    }

    pub fn mark_template_error(&mut self, err: &dyn fmt::Display) -> ConditionError {
        let message = format!("Couldn't populate the {} template: {}", self.child, err);
        self.manager
            .mark_false(self.destination, "TemplateError", &message);
        ConditionError::Template(message)
    }

    /// Record a failed step.
    ///
    /// Store conflicts mean the cached copy was stale and are recorded as Unknown.
    pub fn mark_reconciliation_error(
        &mut self,
        action: &str,
        err: &(dyn std::error::Error + 'static),
    ) -> ConditionError {
        let message = format!(
            "Error occurred while {} {}: {}",
            action, self.child, err
        );
        if is_cache_outdated(err) {
            self.manager
                .mark_unknown(self.destination, "CacheOutdated", &message);
        } else {
            self.manager
                .mark_false(self.destination, "ReconciliationError", &message);
        }
        ConditionError::Reconciliation(message)
    }

    /// True while the condition is missing or Unknown
    pub fn is_pending(&self) -> bool {
        self.get().is_none_or(Condition::is_unknown)
    }

    /// Fails once the condition has not transitioned within the deadline
    pub fn error_if_timeout(&self, deadline: chrono::Duration) -> Result<(), ConditionError> {
        let Some(transitioned) = self.get().and_then(Condition::transitioned_at) else {
            return Ok(());
        };
        if Utc::now() - transitioned > deadline {
            return Err(ConditionError::Timeout(format!(
                "timed out, no progress was made in {} seconds, previous status: {:?}",
                deadline.num_seconds(),
                self.to_string()
            )));
        }
        Ok(())
    }

    /// Copy the state of another resource's condition onto this one
    pub fn propagate(&mut self, source: Option<&Condition>) {
        match source {
            None => self.mark_unknown("Unknown", "source status is nil"),
            Some(c) => {
                let reason = c.reason.clone().unwrap_or_default();
                let message = c.message.clone().unwrap_or_default();
                match c.status {
                    ConditionStatus::True => self.mark_success(),
                    ConditionStatus::False => self.mark_false(&reason, &message),
                    ConditionStatus::Unknown => self.mark_unknown(&reason, &message),
                }
            }
        }
    }
}

impl fmt::Display for SingleCondition<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (status, reason, message) = self.get().map_or(
            (String::new(), String::new(), String::new()),
            |c| {
                (
                    c.status.to_string(),
                    c.reason.clone().unwrap_or_default(),
                    c.message.clone().unwrap_or_default(),
                )
            },
        );
        write!(
            f,
            "condition: {} status: {:?} reason: {:?} message: {:?}",
            self.destination, status, reason, message
        )
    }
}

fn is_cache_outdated(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(store_err) = e.downcast_ref::<StoreError>() {
            return store_err.is_conflict() || store_err.is_already_exists();
        }
        if let Some(ReconcilerError::Store(store_err)) = e.downcast_ref::<ReconcilerError>() {
            return store_err.is_conflict() || store_err.is_already_exists();
        }
        current = e.source();
    }
    false
}
