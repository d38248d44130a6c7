//! Error types for the extension runtime
//!
//! Provides detailed error information for sandbox violations, hook failures
//! and the load pass.

use crate::fs::FsError;
use crate::wasm::WasmError;
use serde::Serialize;
use std::any::Any;
use std::time::Duration;
use thiserror::Error;

/// An attempted filesystem operation outside the granted capability
///
/// Always fatal to the extension that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{message} (path: {path}, operation: {operation})")]
pub struct SecurityViolation {
    pub message: String,
    pub path: String,
    pub operation: String,
}

impl SecurityViolation {
    pub fn new(
        message: impl Into<String>,
        path: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            path: path.into(),
            operation: operation.into(),
        }
    }

    /// Find a violation anywhere in an error chain
    ///
    /// Looks through the wrappers the runtime itself produces
    /// ([`FsError`], [`WasmError`]) as well as plain sources.
    pub fn find_in(err: &anyhow::Error) -> Option<SecurityViolation> {
        if let Some(violation) = err.downcast_ref::<SecurityViolation>() {
            return Some(violation.clone());
        }
        err.chain().find_map(|cause| {
            if let Some(violation) = cause.downcast_ref::<SecurityViolation>() {
                return Some(violation.clone());
            }
            if let Some(FsError::Security(violation)) = cause.downcast_ref::<FsError>() {
                return Some(violation.clone());
            }
            if let Some(WasmError::Security(violation)) = cause.downcast_ref::<WasmError>() {
                return Some(violation.clone());
            }
            None
        })
    }
}

/// Status API used outside of a render hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("status context is only available during on_render")]
pub struct StatusUnavailable;

/// How a single hook call went wrong
#[derive(Debug, Clone, Error)]
pub enum HookFailure {
    #[error("security violation: {0}")]
    Security(SecurityViolation),

    #[error("{0}")]
    Failed(String),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl HookFailure {
    /// Classify an error returned by extension code
    pub fn from_error(err: anyhow::Error) -> Self {
        match SecurityViolation::find_in(&err) {
            Some(violation) => Self::Security(violation),
            None => Self::Failed(format!("{err:#}")),
        }
    }

    /// Classify a caught panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }

    /// Check if this failure disables the extension immediately
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::Security(_))
    }
}

/// Errors reported by the load pass
///
/// None of these escape [`crate::loader::ExtensionLoader::load_all`]; they are
/// collected into the [`crate::loader::LoadReport`].
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unit failed to load: {0:#}")]
    Unit(#[source] anyhow::Error),

    #[error("unit declares no API version (host requires {expected})")]
    MissingApiVersion { expected: String },

    #[error("incompatible API version {found} (host requires {expected})")]
    IncompatibleApiVersion { expected: String, found: String },

    #[error("failed to instantiate extension '{name}': {reason}")]
    Instantiate { name: String, reason: String },

    #[error("security violation while loading: {0}")]
    Security(SecurityViolation),

    #[error("extension '{name}' collides with '{existing}' (folder '{folder}')")]
    Collision {
        name: String,
        existing: String,
        folder: String,
    },
}

impl LoadError {
    /// Check if this is a security-related error
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::Security(_))
    }
}
