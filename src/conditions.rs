//! Condition ledger for status reporting
//!
//! Conditions follow Kubernetes API conventions: each has a type, a
//! tri-state status, a machine-readable reason, a severity, and a
//! human-readable message. The ledger keeps at most one condition per type
//! and preserves `lastTransitionTime` across reconcile passes when the
//! status does not change, so repeated passes over a stable resource do
//! not churn timestamps.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Type of the top-level aggregate readiness condition
pub const READY: &str = "Ready";

/// Message set on the aggregate condition when all sub-conditions are true
pub const READY_MESSAGE: &str = "Setup complete";

/// Message set on the aggregate condition while sub-conditions are pending
pub const READY_INIT_MESSAGE: &str = "Setup started";

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Machine-readable reason for a condition's state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionReason {
    /// Initial state before the first reconcile touches the area
    #[default]
    Init,
    /// Work has been requested and is in progress
    Requested,
    /// The area is ready
    Ready,
    /// The area failed
    Error,
}

/// Severity of a condition; informational for expected transient states,
/// warning or error for states that need attention
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionSeverity {
    /// Expected transient state
    #[default]
    Info,
    /// Unexpected but recoverable state
    Warning,
    /// Failure state
    Error,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition; identity within the ledger
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: ConditionReason,

    /// Severity of the condition
    pub severity: ConditionSeverity,

    /// Human-readable message
    pub message: String,

    /// Last time the condition's status changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: ConditionReason,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason,
            severity,
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Create an Unknown condition, used for initialization defaults
    pub fn unknown(type_: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            type_,
            ConditionStatus::Unknown,
            ConditionReason::Init,
            ConditionSeverity::Info,
            message,
        )
    }

    /// Create a True condition with Ready reason
    pub fn true_(type_: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            type_,
            ConditionStatus::True,
            ConditionReason::Ready,
            ConditionSeverity::Info,
            message,
        )
    }

    /// Create a False condition with the given reason and severity
    pub fn false_(
        type_: impl Into<String>,
        reason: ConditionReason,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self::new(type_, ConditionStatus::False, reason, severity, message)
    }
}

/// Ordered collection of conditions keyed by type
///
/// Order of first insertion is preserved so status output is stable
/// across passes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the ledger has no conditions
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of conditions in the ledger
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the conditions in ledger order
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    /// Insert each default condition only if no condition of that type
    /// exists yet. Idempotent across repeated reconcile passes.
    pub fn init(&mut self, defaults: &[Condition]) {
        for c in defaults {
            if self.get(&c.type_).is_none() {
                self.0.push(c.clone());
            }
        }
    }

    /// Get the condition of the given type, if present
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// Upsert a condition by type.
    ///
    /// When a condition of the same type exists and its status equals the
    /// new status, the stored `lastTransitionTime` is preserved; the
    /// timestamp only moves when the status actually transitions.
    pub fn set(&mut self, mut condition: Condition) {
        match self.0.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.0.push(condition),
        }
    }

    /// Remove the condition of the given type, if present
    pub fn remove(&mut self, type_: &str) {
        self.0.retain(|c| c.type_ != type_);
    }

    /// Returns true if the condition exists and its status is True
    pub fn is_true(&self, type_: &str) -> bool {
        matches!(self.get(type_), Some(c) if c.status == ConditionStatus::True)
    }

    /// Mark the condition of the given type True
    pub fn mark_true(&mut self, type_: &str, message: impl Into<String>) {
        self.set(Condition::true_(type_, message));
    }

    /// Mark the condition of the given type False
    pub fn mark_false(
        &mut self,
        type_: &str,
        reason: ConditionReason,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) {
        self.set(Condition::false_(type_, reason, severity, message));
    }

    /// Mark the condition of the given type Unknown
    pub fn mark_unknown(
        &mut self,
        type_: &str,
        reason: ConditionReason,
        message: impl Into<String>,
    ) {
        self.set(Condition::new(
            type_,
            ConditionStatus::Unknown,
            reason,
            ConditionSeverity::Info,
            message,
        ));
    }

    /// Compute an aggregate condition for `target` from all other
    /// conditions in the ledger.
    ///
    /// Any False condition dominates and its reason, severity, and
    /// message are carried onto the aggregate; all True yields True;
    /// anything else yields Unknown carrying the first Unknown's message.
    pub fn mirror(&self, target: &str) -> Condition {
        let subs: Vec<&Condition> = self.0.iter().filter(|c| c.type_ != target).collect();

        if let Some(first_false) = subs.iter().find(|c| c.status == ConditionStatus::False) {
            return Condition::new(
                target,
                ConditionStatus::False,
                first_false.reason.clone(),
                first_false.severity.clone(),
                first_false.message.clone(),
            );
        }
        if !subs.is_empty() && subs.iter().all(|c| c.status == ConditionStatus::True) {
            return Condition::true_(target, READY_MESSAGE);
        }
        let message = subs
            .iter()
            .find(|c| c.status == ConditionStatus::Unknown)
            .map(|c| c.message.clone())
            .unwrap_or_else(|| READY_INIT_MESSAGE.to_string());
        Condition::new(
            target,
            ConditionStatus::Unknown,
            ConditionReason::Init,
            ConditionSeverity::Info,
            message,
        )
    }

    /// Returns true iff every condition except the aggregate type is True.
    ///
    /// Vacuously true when only the aggregate itself (or nothing) is
    /// present; a control plane with no enabled services is ready.
    pub fn all_sub_conditions_true(&self) -> bool {
        self.0
            .iter()
            .filter(|c| c.type_ != READY)
            .all(|c| c.status == ConditionStatus::True)
    }

    /// Restore `lastTransitionTime` from a pre-pass snapshot for every
    /// condition whose status is unchanged relative to that snapshot.
    ///
    /// A pass may remove and re-create a condition (init after a disable,
    /// say); the re-created entry would otherwise carry a fresh timestamp
    /// even though the observable status never changed.
    pub fn restore_last_transition_times(&mut self, saved: &Conditions) {
        for c in &mut self.0 {
            if let Some(prev) = saved.get(&c.type_) {
                if prev.status == c.status {
                    c.last_transition_time = prev.last_transition_time;
                }
            }
        }
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(v: Vec<Condition>) -> Self {
        Self(v)
    }
}

impl<'a> IntoIterator for &'a Conditions {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
