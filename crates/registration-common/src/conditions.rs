//! Helpers for metav1-style status conditions
//!
//! Status writes are the single largest cost in this control plane; every
//! mutation compares both status and reason before touching the store.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/// Condition status "True"
pub const TRUE: &str = "True";
/// Condition status "False"
pub const FALSE: &str = "False";
/// Condition status "Unknown"
pub const UNKNOWN: &str = "Unknown";

/// Build a condition with lastTransitionTime set to now
pub fn new_condition(
    type_: impl Into<String>,
    status: impl Into<String>,
    reason: impl Into<String>,
    message: impl Into<String>,
) -> Condition {
    Condition {
        type_: type_.into(),
        status: status.into(),
        reason: reason.into(),
        message: message.into(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether a condition of the given type exists with status True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).map(|c| c.status == TRUE).unwrap_or(false)
}

/// Whether a write for `desired` can be skipped because the stored condition
/// already carries the same status and reason.
pub fn is_condition_unchanged(conditions: &[Condition], desired: &Condition) -> bool {
    find_condition(conditions, &desired.type_)
        .map(|c| c.status == desired.status && c.reason == desired.reason)
        .unwrap_or(false)
}

/// Merge a condition into a condition list.
///
/// The lastTransitionTime of an existing condition is preserved unless the
/// status actually changed. Returns true if the list was modified in a way
/// that needs to be written back (status or reason differ, or the condition
/// is new).
pub fn set_condition(conditions: &mut Vec<Condition>, mut desired: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == desired.type_) {
        Some(existing) => {
            if existing.status == desired.status && existing.reason == desired.reason {
                return false;
            }
            if existing.status == desired.status {
                desired.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = desired;
            true
        }
        None => {
            conditions.push(desired);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_and_truth_helpers() {
        let conditions = vec![
            new_condition("HubAccepted", TRUE, "HubClusterAdminAccepted", "accepted"),
            new_condition("ManagedClusterJoined", TRUE, "ManagedClusterJoined", "joined"),
        ];
        assert!(is_condition_true(&conditions, "HubAccepted"));
        assert!(!is_condition_true(&conditions, "ManagedClusterConditionAvailable"));
        assert_eq!(
            find_condition(&conditions, "ManagedClusterJoined").unwrap().reason,
            "ManagedClusterJoined"
        );
    }

    #[test]
    fn set_condition_appends_new_type() {
        let mut conditions = vec![];
        let changed = set_condition(
            &mut conditions,
            new_condition("HubAccepted", TRUE, "HubClusterAdminAccepted", "accepted"),
        );
        assert!(changed);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn set_condition_skips_same_status_and_reason() {
        let mut conditions = vec![new_condition(
            "ManagedClusterConditionAvailable",
            TRUE,
            "ManagedClusterLeaseUpdated",
            "lease is fresh",
        )];
        let changed = set_condition(
            &mut conditions,
            new_condition(
                "ManagedClusterConditionAvailable",
                TRUE,
                "ManagedClusterLeaseUpdated",
                "lease is fresh, again",
            ),
        );
        assert!(!changed, "identical status+reason must not trigger a write");
    }

    #[test]
    fn set_condition_updates_on_status_flip() {
        let mut conditions = vec![new_condition(
            "ManagedClusterConditionAvailable",
            TRUE,
            "ManagedClusterLeaseUpdated",
            "fresh",
        )];
        let changed = set_condition(
            &mut conditions,
            new_condition(
                "ManagedClusterConditionAvailable",
                FALSE,
                "ManagedClusterLeaseUpdateStopped",
                "stale",
            ),
        );
        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, FALSE);
        assert_eq!(conditions[0].reason, "ManagedClusterLeaseUpdateStopped");
    }

    #[test]
    fn set_condition_preserves_transition_time_on_reason_only_change() {
        let original = new_condition("C", TRUE, "ReasonA", "a");
        let original_time = original.last_transition_time.clone();
        let mut conditions = vec![original];

        std::thread::sleep(std::time::Duration::from_millis(5));
        let changed = set_condition(&mut conditions, new_condition("C", TRUE, "ReasonB", "b"));
        assert!(changed);
        assert_eq!(conditions[0].last_transition_time, original_time);
        assert_eq!(conditions[0].reason, "ReasonB");
    }

    #[test]
    fn unchanged_check_matches_set_condition() {
        let stored = vec![new_condition("C", FALSE, "ReasonA", "a")];
        assert!(is_condition_unchanged(&stored, &new_condition("C", FALSE, "ReasonA", "other message")));
        assert!(!is_condition_unchanged(&stored, &new_condition("C", TRUE, "ReasonA", "a")));
        assert!(!is_condition_unchanged(&stored, &new_condition("D", FALSE, "ReasonA", "a")));
    }
}
