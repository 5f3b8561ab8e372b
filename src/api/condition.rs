//! Status conditions.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Type of the only condition maintained on a GitOpsSet.
pub const READY_CONDITION: &str = "Ready";

/// Longest message stored on a condition, including the truncation marker.
pub const MAX_CONDITION_MESSAGE_LEN: usize = 20_000;

const TRUNCATION_MARKER: &str = "...";

/// Status of a condition.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// Not yet known.
    #[default]
    Unknown,
}

/// A Kubernetes-style status condition.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Ready`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Condition status.
    pub status: ConditionStatus,
    /// Machine-readable reason in `PascalCase`.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
    /// RFC3339 time of the last status change.
    pub last_transition_time: String,
    /// Generation the condition was computed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Builds a `Ready` condition stamped with the current time.
    ///
    /// Messages longer than [`MAX_CONDITION_MESSAGE_LEN`] are truncated and end in `...`.
    #[must_use]
    pub fn ready(
        status: ConditionStatus,
        reason: &str,
        message: &str,
        observed_generation: Option<i64>,
    ) -> Self {
        Self {
            type_: READY_CONDITION.to_string(),
            status,
            reason: reason.to_string(),
            message: truncate_message(message),
            last_transition_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            observed_generation,
        }
    }

    /// Whether the condition status is `True`.
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_CONDITION_MESSAGE_LEN {
        return message.to_string();
    }
    let keep = MAX_CONDITION_MESSAGE_LEN - TRUNCATION_MARKER.len();
    let mut truncated: String = message.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}
