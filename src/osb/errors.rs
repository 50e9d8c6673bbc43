// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Errors returned by broker clients.
//!
//! The classification helpers encode the OSB status-code contract so reconcilers
//! never match on raw codes.

use crate::constants::{OSB_ERROR_ASYNC_REQUIRED, OSB_ERROR_CONCURRENCY};
use thiserror::Error;

/// Failure of one OSB call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OsbError {
    /// The broker answered with a non-success status.
    #[error("broker returned HTTP {status}: {}", describe(.error, .description))]
    Http {
        status: u16,
        /// Machine readable `error` field of the body.
        error: Option<String>,
        /// Human readable `description` field of the body.
        description: Option<String>,
    },

    /// The broker answered with a success status but a body we could not decode.
    #[error("broker returned HTTP {status} with an unreadable body: {message}")]
    Decode { status: u16, message: String },

    /// No usable response. `request_sent` is false only when the connection was never made.
    #[error("request to broker failed: {message}")]
    Transport { message: String, request_sent: bool },

    /// The request was rejected before it was sent.
    #[error("invalid broker request: {0}")]
    InvalidRequest(String),

    /// Client could not be built from the broker configuration.
    #[error("invalid broker client configuration: {0}")]
    Config(String),
}

fn describe(error: &Option<String>, description: &Option<String>) -> String {
    match (error, description) {
        (Some(e), Some(d)) => format!("{e}: {d}"),
        (Some(e), None) => e.clone(),
        (None, Some(d)) => d.clone(),
        (None, None) => "no description".to_string(),
    }
}

impl OsbError {
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } | Self::Decode { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.status() == Some(410)
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Http { status: 409, .. })
    }

    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Http { status: 401 | 403, .. })
    }

    /// 422 `AsyncRequired`.
    #[must_use]
    pub fn is_async_required(&self) -> bool {
        matches!(self, Self::Http { status: 422, error: Some(e), .. } if e == OSB_ERROR_ASYNC_REQUIRED)
    }

    /// 422 `ConcurrencyError`: another operation on this resource is in flight.
    #[must_use]
    pub fn is_concurrency_error(&self) -> bool {
        matches!(self, Self::Http { status: 422, error: Some(e), .. } if e == OSB_ERROR_CONCURRENCY)
    }

    /// Worth retrying unchanged: network trouble, 408, 429, 5xx or a concurrency error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Http { status, .. } => {
                matches!(status, 408 | 429 | 500..=599) || self.is_concurrency_error()
            }
            Self::Decode { .. } | Self::InvalidRequest(_) | Self::Config(_) => false,
        }
    }

    /// The broker may have acted on the request without us learning the outcome.
    ///
    /// Timeouts, 408, 5xx and undecodable 2xx bodies all leave the remote state unknown.
    #[must_use]
    pub fn leaves_remote_state_unknown(&self) -> bool {
        match self {
            Self::Transport { request_sent, .. } => *request_sent,
            Self::Http { status, .. } => matches!(status, 408 | 500..=599),
            Self::Decode { status, .. } => (200..300).contains(status),
            Self::InvalidRequest(_) | Self::Config(_) => false,
        }
    }

    /// Short description for conditions and events.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Http {
                status,
                error,
                description,
            } => format!(
                "Status: {status}; ErrorMessage: {}; Description: {}",
                error.as_deref().unwrap_or("<nil>"),
                description.as_deref().unwrap_or("<nil>")
            ),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for OsbError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            request_sent: !err.is_connect() && !err.is_builder(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod errors_tests;
