// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconcile error taxonomy.
//!
//! Every failure a reconciler reports belongs to one of five classes. The class
//! decides what the dispatcher does with the key:
//!
//! | Class | Example | Requeue |
//! |-------|---------|---------|
//! | `Validation` | parameter collision, unknown plan | no, waits for a spec change |
//! | `Transient` | store conflict, broker 5xx | per-key backoff |
//! | `RemoteTerminal` | broker 4xx | no, waits for a spec change or relist |
//! | `Orphan` | request sent, outcome unknown | per-key backoff (mitigation runs) |
//! | `Poison` | malformed stored object | at the backoff ceiling |

use crate::injector::InjectError;
use crate::osb::OsbError;
use crate::parameters::ParametersError;
use crate::status_reasons::{REASON_STORE_ERROR, REASON_INJECTION_FAILED, REASON_PARAMETERS_ERROR};
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// The spec is inconsistent; nothing changes until the user edits it.
    #[error("{message}")]
    Validation { reason: &'static str, message: String },

    /// Retrying later is expected to succeed.
    #[error("{message}")]
    Transient { reason: &'static str, message: String },

    /// The broker refused the request.
    #[error("{message}")]
    RemoteTerminal { reason: &'static str, message: String },

    /// The broker may hold state we do not know about.
    #[error("{message}")]
    Orphan { reason: &'static str, message: String },

    /// The stored object cannot be processed.
    #[error("malformed object: {0}")]
    Poison(String),
}

impl ReconcileError {
    pub fn validation(reason: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            reason,
            message: message.into(),
        }
    }

    pub fn transient(reason: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            reason,
            message: message.into(),
        }
    }

    pub fn remote_terminal(reason: &'static str, message: impl Into<String>) -> Self {
        Self::RemoteTerminal {
            reason,
            message: message.into(),
        }
    }

    pub fn orphan(reason: &'static str, message: impl Into<String>) -> Self {
        Self::Orphan {
            reason,
            message: message.into(),
        }
    }

    /// Classify a failed broker call made for an operation with condition `reason`.
    #[must_use]
    pub fn from_osb(reason: &'static str, prefix: &str, err: &OsbError) -> Self {
        let message = format!("{prefix}: {}", err.summary());
        if err.leaves_remote_state_unknown() {
            Self::orphan(reason, message)
        } else if err.is_retryable() {
            Self::transient(reason, message)
        } else {
            Self::remote_terminal(reason, message)
        }
    }

    /// Machine readable condition reason.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation { reason, .. }
            | Self::Transient { reason, .. }
            | Self::RemoteTerminal { reason, .. }
            | Self::Orphan { reason, .. } => reason,
            Self::Poison(_) => REASON_STORE_ERROR,
        }
    }

    /// Metric label for the class.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Transient { .. } => "transient",
            Self::RemoteTerminal { .. } => "remote_terminal",
            Self::Orphan { .. } => "orphan",
            Self::Poison(_) => "poison",
        }
    }

    /// Terminal errors are not retried until the object changes.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::RemoteTerminal { .. })
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invalid(message) => Self::Poison(message),
            other => Self::transient(REASON_STORE_ERROR, other.to_string()),
        }
    }
}

impl From<ParametersError> for ReconcileError {
    fn from(err: ParametersError) -> Self {
        if err.is_transient() {
            Self::transient(REASON_PARAMETERS_ERROR, err.to_string())
        } else {
            Self::validation(REASON_PARAMETERS_ERROR, err.to_string())
        }
    }
}

impl From<InjectError> for ReconcileError {
    fn from(err: InjectError) -> Self {
        if err.is_transient() {
            Self::transient(REASON_INJECTION_FAILED, err.to_string())
        } else {
            Self::validation(REASON_INJECTION_FAILED, err.to_string())
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
