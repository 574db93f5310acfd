//! # Status conditions
//!
//! Helpers for the deduplicating update of the status condition list. The
//! list holds at most one condition per type; `lastTransitionTime` only
//! advances when a condition's status actually changes.

use crate::crd::{ConfigMapSecretCondition, ConfigMapSecretStatus};

/// Reason given when required ConfigMapSecret variables cannot be resolved.
pub const CREATE_VARIABLES_ERROR_REASON: &str = "CreateVariablesError";

/// Reason given for failures that are not caused by cluster state, e.g.
/// owner-reference construction.
pub const INTERNAL_ERROR_REASON: &str = "InternalError";

/// Creates a new condition stamped with the current time.
pub fn new_condition(
    r#type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> ConfigMapSecretCondition {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    ConfigMapSecretCondition {
        r#type: r#type.to_string(),
        status: status.to_string(),
        last_update_time: Some(now.clone()),
        last_transition_time: Some(now),
        reason: (!reason.is_empty()).then(|| reason.to_string()),
        message: (!message.is_empty()).then(|| message.to_string()),
    }
}

/// Returns the condition with the provided type, if any.
pub fn get_condition<'a>(
    status: &'a ConfigMapSecretStatus,
    r#type: &str,
) -> Option<&'a ConfigMapSecretCondition> {
    status.conditions.iter().find(|c| c.r#type == r#type)
}

/// Updates the status to include the provided condition.
///
/// If a condition of the same type already exists with the same status,
/// reason, and message, the list is left untouched. If only the status is
/// unchanged, the previous `lastTransitionTime` is carried over.
pub fn set_condition(status: &mut ConfigMapSecretStatus, mut cond: ConfigMapSecretCondition) {
    if let Some(prev) = get_condition(status, &cond.r#type) {
        if prev.status == cond.status && prev.reason == cond.reason && prev.message == cond.message
        {
            return;
        }
        if prev.status == cond.status {
            cond.last_transition_time = prev.last_transition_time.clone();
        }
    }
    remove_condition(status, &cond.r#type);
    status.conditions.push(cond);
}

/// Removes the condition with the provided type.
pub fn remove_condition(status: &mut ConfigMapSecretStatus, r#type: &str) {
    status.conditions.retain(|c| c.r#type != r#type);
}
