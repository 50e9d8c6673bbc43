// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Status condition helpers for catalog resources.
//!
//! Conditions follow the Kubernetes convention:
//! - `type`: Ready, Failed or `OrphanMitigation`
//! - `status`: "True", "False", or "Unknown"
//! - `reason`: a `CamelCase` code from [`crate::status_reasons`]
//! - `message`: a human-readable explanation
//! - `lastTransitionTime`: RFC3339 timestamp of the last status flip
//!
//! Brokers, instances and bindings also mirror their Ready reason into
//! `status.lastConditionState`, which backs the `Status` printer column.
//!
//! # Example
//!
//! ```rust,no_run
//! use svcat::crd::ServiceInstanceStatus;
//! use svcat::reconcilers::status::set_ready;
//! use svcat::status_reasons::REASON_PROVISIONED_SUCCESSFULLY;
//!
//! let mut status = ServiceInstanceStatus::default();
//! set_ready(&mut status, true, REASON_PROVISIONED_SUCCESSFULLY, "The instance was provisioned successfully");
//! assert_eq!(status.last_condition_state.as_deref(), Some("Ready"));
//! ```

use crate::crd::{Condition, ServiceBindingStatus, ServiceBrokerStatus, ServiceInstanceStatus};
use crate::reconcilers::ReconcileError;
use crate::status_reasons::{
    CONDITION_FALSE, CONDITION_TRUE, CONDITION_TYPE_FAILED, CONDITION_TYPE_ORPHAN_MITIGATION,
    CONDITION_TYPE_READY,
};
use chrono::Utc;

/// `lastConditionState` of a ready resource.
pub const LAST_CONDITION_STATE_READY: &str = "Ready";

/// A status that carries conditions and a `lastConditionState` column.
pub trait ConditionedStatus {
    fn conditions(&self) -> &[Condition];

    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn set_last_condition_state(&mut self, state: &str);

    /// Generation whose desired state was last reached or given up on.
    fn reconciled_generation(&self) -> i64;

    fn set_reconciled_generation(&mut self, generation: i64);

    fn set_observed_generation(&mut self, generation: i64);

    /// An asynchronous broker operation started for `observedGeneration` is still running.
    fn operation_in_flight(&self) -> bool;
}

macro_rules! impl_conditioned_status {
    ($status:ty) => {
        impl_conditioned_status!($status, |_status| false);
    };
    ($status:ty, |$s:ident| $in_flight:expr) => {
        impl ConditionedStatus for $status {
            fn conditions(&self) -> &[Condition] {
                &self.conditions
            }

            fn conditions_mut(&mut self) -> &mut Vec<Condition> {
                &mut self.conditions
            }

            fn set_last_condition_state(&mut self, state: &str) {
                self.last_condition_state = Some(state.to_string());
            }

            fn reconciled_generation(&self) -> i64 {
                self.reconciled_generation
            }

            fn set_reconciled_generation(&mut self, generation: i64) {
                self.reconciled_generation = generation;
            }

            fn set_observed_generation(&mut self, generation: i64) {
                self.observed_generation = generation;
            }

            fn operation_in_flight(&self) -> bool {
                let $s = self;
                $in_flight
            }
        }
    };
}

impl_conditioned_status!(ServiceBrokerStatus);
impl_conditioned_status!(ServiceInstanceStatus, |status| status.async_op_in_progress);
impl_conditioned_status!(ServiceBindingStatus, |status| status.async_op_in_progress);

/// Create a new condition stamped with the current time.
///
/// # Example
///
/// ```rust,no_run
/// # use svcat::reconcilers::status::create_condition;
/// let condition = create_condition("Ready", "True", "FetchedCatalog", "Successfully fetched catalog");
/// assert_eq!(condition.r#type, "Ready");
/// assert_eq!(condition.status, "True");
/// ```
#[must_use]
pub fn create_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> Condition {
    Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_transition_time: Some(Utc::now().to_rfc3339()),
    }
}

#[must_use]
pub fn find_condition<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

/// Whether the condition of `condition_type` is present with status True.
#[must_use]
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type).is_some_and(|c| c.status == CONDITION_TRUE)
}

/// Update or add a condition.
///
/// `lastTransitionTime` is kept when the status does not flip, so reason and
/// message changes alone never look like a transition.
pub fn update_condition_in_memory(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition_type) {
        let last_transition_time = if existing.status == status {
            existing
                .last_transition_time
                .clone()
                .unwrap_or_else(|| Utc::now().to_rfc3339())
        } else {
            Utc::now().to_rfc3339()
        };

        existing.status = status.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
        existing.last_transition_time = Some(last_transition_time);
    } else {
        conditions.push(create_condition(condition_type, status, reason, message));
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, condition_type: &str) {
    conditions.retain(|c| c.r#type != condition_type);
}

/// Compare condition sets ignoring order and timestamps.
#[must_use]
pub fn conditions_equal(current: &[Condition], new: &[Condition]) -> bool {
    if current.len() != new.len() {
        return false;
    }

    for new_cond in new {
        match current.iter().find(|c| c.r#type == new_cond.r#type) {
            None => return false,
            Some(curr_cond) => {
                if curr_cond.status != new_cond.status
                    || curr_cond.reason != new_cond.reason
                    || curr_cond.message != new_cond.message
                {
                    return false;
                }
            }
        }
    }

    true
}

/// Set Ready and mirror it into `lastConditionState`.
///
/// Becoming ready also clears Failed.
pub fn set_ready<S: ConditionedStatus>(status: &mut S, ready: bool, reason: &str, message: &str) {
    let value = if ready { CONDITION_TRUE } else { CONDITION_FALSE };
    update_condition_in_memory(status.conditions_mut(), CONDITION_TYPE_READY, value, reason, message);
    if ready {
        remove_condition(status.conditions_mut(), CONDITION_TYPE_FAILED);
        status.set_last_condition_state(LAST_CONDITION_STATE_READY);
    } else {
        status.set_last_condition_state(reason);
    }
}

/// Ready=False plus Failed=True with the same reason.
pub fn set_failed<S: ConditionedStatus>(status: &mut S, reason: &str, message: &str) {
    set_ready(status, false, reason, message);
    update_condition_in_memory(
        status.conditions_mut(),
        CONDITION_TYPE_FAILED,
        CONDITION_TRUE,
        reason,
        message,
    );
}

/// Drop a Failed condition left by an earlier spec.
pub fn clear_failed<S: ConditionedStatus>(status: &mut S) {
    remove_condition(status.conditions_mut(), CONDITION_TYPE_FAILED);
}

/// Set or clear the `OrphanMitigation` condition.
pub fn set_orphan_mitigation<S: ConditionedStatus>(
    status: &mut S,
    in_progress: bool,
    reason: &str,
    message: &str,
) {
    if in_progress {
        update_condition_in_memory(
            status.conditions_mut(),
            CONDITION_TYPE_ORPHAN_MITIGATION,
            CONDITION_TRUE,
            reason,
            message,
        );
    } else {
        remove_condition(status.conditions_mut(), CONDITION_TYPE_ORPHAN_MITIGATION);
    }
}

/// Record a reconcile error: always Ready=False, plus Failed=True when terminal.
pub fn record_error<S: ConditionedStatus>(status: &mut S, err: &ReconcileError) {
    let message = err.to_string();
    if err.is_terminal() {
        set_failed(status, err.reason(), &message);
    } else {
        set_ready(status, false, err.reason(), &message);
    }
}

#[must_use]
pub fn is_ready<S: ConditionedStatus>(status: &S) -> bool {
    is_condition_true(status.conditions(), CONDITION_TYPE_READY)
}

#[must_use]
pub fn is_failed<S: ConditionedStatus>(status: &S) -> bool {
    is_condition_true(status.conditions(), CONDITION_TYPE_FAILED)
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod status_tests;
