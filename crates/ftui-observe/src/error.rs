#![forbid(unsafe_code)]

//! Error types for observation, bindings, and configuration.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Stale observation | Re-run scheduled for a cancelled token | Dropped, never re-run |
//! | Unbalanced completion | Completion fired twice | Impossible: completions are moved out once |
//! | Tracked closure failure | Observation panicked or returned `Err` | [`ObservationFailure`] via the failure channel |
//! | Dangling binding | Binding root dropped | [`BindingError::Dangling`]; panicking accessors abort loudly |

use std::fmt;

use crate::tracking::PropertyKey;

/// Errors from [`Binding`](crate::Binding) and [`Bindable`](crate::Bindable)
/// access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// The object the binding addresses no longer exists.
    Dangling(PropertyKey),
    /// Path lookup found no accessor with that path.
    UnknownProperty {
        /// Type name of the object that was searched.
        object: &'static str,
        /// The requested path.
        path: String,
    },
    /// The accessor exists but its value type differs from the requested one.
    TypeMismatch {
        /// The requested path.
        path: &'static str,
        /// Type name that was requested.
        expected: &'static str,
    },
}

impl fmt::Display for BindingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dangling(key) => write!(f, "binding to {key} outlived its root object"),
            Self::UnknownProperty { object, path } => {
                write!(f, "no bindable property '{path}' on {object}")
            }
            Self::TypeMismatch { path, expected } => {
                write!(f, "property '{path}' is not of type {expected}")
            }
        }
    }
}

impl std::error::Error for BindingError {}

/// A tracked closure failed during a re-run.
///
/// Re-runs have no caller waiting on them, so the failure is routed through
/// the registry's failure channel instead of a return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationFailure {
    /// Id of the observation whose closure failed.
    pub observation: u64,
    /// Panic payload or error rendered as text.
    pub message: String,
}

impl fmt::Display for ObservationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observation #{} failed: {}", self.observation, self.message)
    }
}

impl std::error::Error for ObservationFailure {}

/// The serial context behind a [`SerialHandle`](crate::SerialHandle) is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffClosed;

impl fmt::Display for HandoffClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("serial context has shut down")
    }
}

impl std::error::Error for HandoffClosed {}

/// Configuration error with field context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub field: &'static str,
    pub value: String,
    pub message: String,
}

impl ConfigError {
    pub(crate) fn new(
        field: &'static str,
        value: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field,
            value: value.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={} ({})", self.field, self.value, self.message)
    }
}

impl std::error::Error for ConfigError {}
