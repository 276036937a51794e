//! Error types for provisioning
//!
//! Errors are structured with fields so a failed run can be diagnosed from
//! the error alone: the resource name that was being touched, the kind of
//! resource, and for an exhausted namespace how many candidates were tried
//! and what the last failure was.
//!
//! The variants double as the classification the provisioner acts on:
//! `NotFound`, `Conflict` and `Unclassified` move on to the next candidate
//! name, `PropagationDelay` is retried with backoff, everything else is
//! terminal.

use std::time::Duration;

use thiserror::Error;

use crate::naming::ResourceKind;

/// Main error type for provisioning operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The named resource does not exist
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Resource kind that was looked up
        kind: ResourceKind,
        /// Name that was looked up
        name: String,
    },

    /// The name is taken by someone else, or a concurrent write won the race
    #[error("conflict on {name}: {message}")]
    Conflict {
        /// Name (or policy scope) the conflict happened on
        name: String,
        /// Platform message describing the conflict
        message: String,
    },

    /// A just-created resource is not yet visible to a dependent subsystem
    #[error("{name} not yet propagated: {message}")]
    PropagationDelay {
        /// Resource that is not yet visible
        name: String,
        /// Platform message
        message: String,
    },

    /// Every candidate name was tried without finding a usable one
    #[error("exhausted {kind} namespace after {attempted} candidates (last error: {last_error})")]
    ExhaustedNamespace {
        /// Resource kind being provisioned
        kind: ResourceKind,
        /// Number of candidate names that were tried
        attempted: usize,
        /// The last per-candidate failure observed
        last_error: String,
    },

    /// The caller is not allowed to perform the operation
    #[error("permission denied on {name}: {message}")]
    PermissionDenied {
        /// Resource the operation targeted
        name: String,
        /// Platform message
        message: String,
    },

    /// A platform failure that matches no known signature
    #[error("unclassified error on {name}: {message}")]
    Unclassified {
        /// Resource the operation targeted
        name: String,
        /// Platform message
        message: String,
    },

    /// An external command could not be run or exited unsuccessfully
    #[error("command failed [{label}]: {message}")]
    Command {
        /// Label of the command (e.g. the service being enabled)
        label: String,
        /// stderr or spawn error
        message: String,
    },

    /// An operation exceeded its time bound
    #[error("{label} timed out after {after:?}")]
    Timeout {
        /// Label of the operation
        label: String,
        /// The bound that was exceeded
        after: Duration,
    },

    /// Invalid input (base names, configuration)
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// JSON encoding/decoding error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a propagation delay error
    pub fn propagation_delay(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PropagationDelay {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a permission denied error
    pub fn permission_denied(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PermissionDenied {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an unclassified error
    pub fn unclassified(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Unclassified {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a command error
    pub fn command(label: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            label: label.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Whether this failure is the "created but not yet visible" signature
    /// that [`RetryPolicy`](crate::retry::RetryPolicy) backs off on.
    pub fn is_propagation_delay(&self) -> bool {
        matches!(self, Error::PropagationDelay { .. })
    }

    /// Whether the failure must abort provisioning instead of moving on to
    /// the next candidate name.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => false,
            Error::Unclassified { .. } => false,
            // The CLI itself is broken or hung; every candidate would fail the same way
            Error::Timeout { .. } => true,
            Error::Command { .. } => true,
            Error::PropagationDelay { .. } => true,
            Error::ExhaustedNamespace { .. } => true,
            Error::PermissionDenied { .. } => true,
            Error::Validation { .. } => true,
            Error::Serialization(_) => true,
            Error::Io(_) => true,
        }
    }

    /// Resource name this error refers to, when there is one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::NotFound { name, .. }
            | Error::Conflict { name, .. }
            | Error::PropagationDelay { name, .. }
            | Error::PermissionDenied { name, .. }
            | Error::Unclassified { name, .. } => Some(name),
            _ => None,
        }
    }
}
