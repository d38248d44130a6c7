//! Capability filesystem for extensions
//!
//! Every file an extension touches goes through a [`CapabilityFs`], which
//! resolves the requested path onto one of three roots and rejects anything
//! outside the granted capability with a [`SecurityViolation`].
//!
//! | Root | Read | Write |
//! |------|------|-------|
//! | private (`self:/`, relative) | yes | yes |
//! | runtime (`runtime:/`) | yes | no |
//! | shared (`extensions:/`) | root and top-level files | no |
//! | anything else | no | no |

mod capability;
pub mod resolve;

pub use capability::{
    sanitize_extension_name, CapabilityFs, Intent, OpenMode, CREDENTIAL_PREFIX, FALLBACK_FOLDER,
};
pub use resolve::{PathResolver, ResolvedPath, RootKind, Roots};

use crate::error::SecurityViolation;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by capability filesystem operations
#[derive(Debug, Error)]
pub enum FsError {
    #[error(transparent)]
    Security(#[from] SecurityViolation),

    #[error("{operation} failed for {path}: {source}")]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    /// Check if this is a security-related error
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::Security(_))
    }

    /// The violation, if this is one
    pub fn as_violation(&self) -> Option<&SecurityViolation> {
        match self {
            Self::Security(violation) => Some(violation),
            Self::Io { .. } => None,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
