//! Sandbox scope: the ambient capability binding
//!
//! While extension code runs, a [`SandboxScope`] binds that extension's
//! [`CapabilityFs`] to the current task. The functions in [`fs`] are the
//! ambient filesystem entry points handed to extension code: they route
//! through whatever capability is bound, and refuse to do anything when
//! nothing is bound.
//!
//! ```text
//! manager ──► SandboxScope::run(|| ext.on_render(ctx))
//!                 │
//!                 │  binds CapabilityFs (task-local)
//!                 ▼
//!             sandbox::fs::write("self:/x", ..) ──► CapabilityFs::write_bytes
//!                 │
//!                 ▼  scope exit (return, error or unwind)
//!             previous binding restored
//! ```
//!
//! The binding is task-local, so an async hook keeps its binding across
//! `.await` points and never leaks it into other tasks.

use crate::error::SecurityViolation;
use crate::fs::CapabilityFs;
use std::future::Future;

tokio::task_local! {
    static ACTIVE: CapabilityFs;
}

/// Scoped binding of one extension's capability
#[derive(Debug, Clone)]
pub struct SandboxScope {
    capability: CapabilityFs,
}

impl SandboxScope {
    pub fn new(capability: CapabilityFs) -> Self {
        Self { capability }
    }

    pub fn capability(&self) -> &CapabilityFs {
        &self.capability
    }

    /// Run synchronous code with the capability bound
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        ACTIVE.sync_scope(self.capability.clone(), f)
    }

    /// Run a future with the capability bound on every poll
    pub async fn run_async<F: Future>(&self, future: F) -> F::Output {
        ACTIVE.scope(self.capability.clone(), future).await
    }
}

/// The capability bound to the current task
pub fn current() -> Result<CapabilityFs, SecurityViolation> {
    ACTIVE
        .try_with(CapabilityFs::clone)
        .map_err(|_| SecurityViolation::new("no sandbox scope is active", "", "scope"))
}

/// Whether a scope is bound to the current task
pub fn is_active() -> bool {
    ACTIVE.try_with(|_| ()).is_ok()
}

/// Ambient filesystem entry points for extension code
///
/// Named after their `std::fs` counterparts; every call goes through the
/// bound [`CapabilityFs`].
pub mod fs {
    use super::current;
    use crate::fs::{FsResult, OpenMode};
    use std::fs::{File, Metadata};

    pub fn open(path: impl AsRef<str>, mode: OpenMode) -> FsResult<File> {
        current()?.open(path.as_ref(), mode)
    }

    #[cfg(unix)]
    pub fn open_raw(path: impl AsRef<str>, flags: i32, mode: u32) -> FsResult<File> {
        current()?.open_raw(path.as_ref(), flags, mode)
    }

    /// Always refused; a descriptor carries no path to validate
    pub fn from_raw_fd(fd: i32) -> FsResult<File> {
        current()?.reopen_descriptor(fd)
    }

    pub fn read_to_string(path: impl AsRef<str>) -> FsResult<String> {
        current()?.read_text(path.as_ref())
    }

    pub fn read(path: impl AsRef<str>) -> FsResult<Vec<u8>> {
        current()?.read_bytes(path.as_ref())
    }

    pub fn write(path: impl AsRef<str>, contents: impl AsRef<[u8]>) -> FsResult<()> {
        current()?.write_bytes(path.as_ref(), contents.as_ref())
    }

    pub fn read_dir(path: impl AsRef<str>) -> FsResult<Vec<String>> {
        current()?.list_dir(path.as_ref())
    }

    pub fn exists(path: impl AsRef<str>) -> FsResult<bool> {
        current()?.exists(path.as_ref())
    }

    pub fn metadata(path: impl AsRef<str>) -> FsResult<Metadata> {
        current()?.stat(path.as_ref())
    }

    pub fn is_file(path: impl AsRef<str>) -> FsResult<bool> {
        current()?.is_file(path.as_ref())
    }

    pub fn is_dir(path: impl AsRef<str>) -> FsResult<bool> {
        current()?.is_dir(path.as_ref())
    }
}
