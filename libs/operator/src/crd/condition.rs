use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single status condition, following the conventional Kubernetes shape
///.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus) -> Self {
        Self {
            type_: type_.to_owned(),
            status,
            reason: None,
            message: None,
            last_transition_time: Some(Utc::now()),
        }
    }

    pub fn ready(ok: bool, message: impl Into<String>) -> Self {
        let mut c = Self::new(
            "Ready",
            if ok {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
        );
        c.message = Some(message.into());
        c
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Inserts or replaces the condition of the same `type_` in `conditions`,
/// preserving the position of existing entries and appending new ones.
/// Only refreshes `last_transition_time` when the status actually changed,
/// so unrelated reconciles do not churn timestamps.
pub fn upsert(conditions: &mut Vec<Condition>, new: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) {
        if existing.status == new.status {
            existing.reason = new.reason;
            existing.message = new.message;
        } else {
            *existing = new;
        }
    } else {
        conditions.push(new);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn upsert_replaces_same_type() {
        let mut conditions = vec![Condition::ready(true, "ok")];
        upsert(&mut conditions, Condition::ready(false, "broken"));
        assert_eq!(conditions.len(), 1);
        assert!(!conditions[0].is_true());
    }

    #[test]
    fn upsert_appends_new_type() {
        let mut conditions = vec![Condition::ready(true, "ok")];
        upsert(&mut conditions, Condition::new("Accepted", ConditionStatus::True));
        assert_eq!(conditions.len(), 2);
    }
}
