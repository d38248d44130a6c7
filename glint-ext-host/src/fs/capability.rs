//! The capability handle granted to one extension

use super::resolve::{PathResolver, ResolvedPath, RootKind, Roots};
use super::{FsError, FsResult};
use crate::config::HostConfig;
use crate::error::SecurityViolation;
use std::fmt;
use std::fs::{self, File, Metadata, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Folder name used when sanitising leaves nothing
pub const FALLBACK_FOLDER: &str = "extension";

/// Segment prefix that is always refused, whatever the config adds
pub const CREDENTIAL_PREFIX: &str = ".env";

/// Operations that may look at another extension's folder, but not into it
const METADATA_OPERATIONS: [&str; 4] = ["exists", "stat", "isfile", "isdir"];

/// Map an extension name to a safe folder name
///
/// Characters outside `[A-Za-z0-9_.-]` become `_`, every `..` becomes `_`,
/// and leading/trailing `.`, `_` and `-` are trimmed. The result is never
/// empty and never contains a path separator.
pub fn sanitize_extension_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.replace("..", "_");
    let trimmed = cleaned.trim_matches(|c| matches!(c, '.' | '_' | '-'));

    if trimmed.is_empty() {
        FALLBACK_FOLDER.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Whether an operation reads or modifies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
}

/// How [`CapabilityFs::open`] opens a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub create_new: bool,
}

impl OpenMode {
    /// Read an existing file
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// Create or truncate, then write
    pub fn write_only() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// Create if missing, append to the end
    pub fn append_only() -> Self {
        Self {
            append: true,
            create: true,
            ..Default::default()
        }
    }

    /// Read and write an existing file
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Any modifying flag makes this a write
    pub fn intent(&self) -> Intent {
        if self.write || self.append || self.create || self.truncate || self.create_new {
            Intent::Write
        } else {
            Intent::Read
        }
    }

    fn options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.read)
            .write(self.write)
            .append(self.append)
            .create(self.create)
            .truncate(self.truncate)
            .create_new(self.create_new);
        options
    }
}

/// Write intent of raw `open(2)` flags
#[cfg(unix)]
pub fn raw_flags_intent(flags: i32) -> Intent {
    let write_bits = libc::O_WRONLY | libc::O_RDWR | libc::O_APPEND | libc::O_CREAT | libc::O_TRUNC;
    if flags & write_bits != 0 {
        Intent::Write
    } else {
        Intent::Read
    }
}

/// Filesystem access bounded to one extension's capability
///
/// Cheap to clone; clones share the violation latch, so a violation raised
/// through any clone is visible to whoever classifies the hook call.
#[derive(Clone)]
pub struct CapabilityFs {
    inner: Arc<Inner>,
}

struct Inner {
    extension: String,
    folder: String,
    resolver: PathResolver,
    guarded: Vec<String>,
    violation: Mutex<Option<SecurityViolation>>,
}

impl CapabilityFs {
    /// Capability for `extension` with the default credential guard
    pub fn new(extension: &str, shared_root: impl AsRef<Path>, runtime_root: impl AsRef<Path>) -> Self {
        Self::build(extension, shared_root.as_ref(), runtime_root.as_ref(), Vec::new())
    }

    /// Capability for `extension` using the roots and guard from a host config
    pub fn for_config(extension: &str, config: &HostConfig) -> Self {
        Self::build(
            extension,
            &config.extensions_dir,
            &config.runtime_dir,
            config.guarded_prefixes.clone(),
        )
    }

    /// `extra` adds to the credential guard; it never replaces it
    fn build(extension: &str, shared: &Path, runtime: &Path, extra: Vec<String>) -> Self {
        let mut guarded = vec![CREDENTIAL_PREFIX.to_string()];
        for prefix in extra {
            if !prefix.is_empty() && !guarded.contains(&prefix) {
                guarded.push(prefix);
            }
        }

        let folder = sanitize_extension_name(extension);
        let roots = Roots::new(shared, runtime, &folder);
        Self {
            inner: Arc::new(Inner {
                extension: extension.to_string(),
                folder,
                resolver: PathResolver::new(roots),
                guarded,
                violation: Mutex::new(None),
            }),
        }
    }

    pub fn extension(&self) -> &str {
        &self.inner.extension
    }

    /// Sanitised folder name of the private root
    pub fn folder(&self) -> &str {
        &self.inner.folder
    }

    pub fn private_dir(&self) -> &Path {
        self.inner.resolver.roots().private()
    }

    pub fn runtime_dir(&self) -> &Path {
        self.inner.resolver.roots().runtime()
    }

    pub fn shared_dir(&self) -> &Path {
        self.inner.resolver.roots().shared()
    }

    /// Resolve a path without validating it
    pub fn resolve(&self, path: &str) -> ResolvedPath {
        self.inner.resolver.resolve(path)
    }

    /// First violation raised through this capability, if any
    pub fn violation(&self) -> Option<SecurityViolation> {
        self.inner
            .violation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take the latched violation, clearing the latch
    pub fn take_violation(&self) -> Option<SecurityViolation> {
        self.inner
            .violation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Validate a path for an operation, returning the canonical target
    pub fn check(
        &self,
        path: &str,
        operation: &'static str,
        intent: Intent,
    ) -> Result<PathBuf, SecurityViolation> {
        let resolved = self.resolve(path);

        if self.is_guarded(&resolved.raw) || self.is_guarded(&resolved.canonical) {
            return Err(self.deny("Access to credential files is forbidden", &resolved, operation));
        }

        let roots = self.inner.resolver.roots();
        match roots.classify(&resolved.canonical) {
            Some(RootKind::Private) => Ok(resolved.canonical),
            Some(RootKind::Runtime) => match intent {
                Intent::Read => Ok(resolved.canonical),
                Intent::Write => Err(self.deny(
                    "Write access to runtime files is forbidden",
                    &resolved,
                    operation,
                )),
            },
            Some(RootKind::Shared) => self.check_shared(resolved, roots, operation, intent),
            None => Err(self.deny(
                "Access outside the sandbox roots is forbidden",
                &resolved,
                operation,
            )),
        }
    }

    fn check_shared(
        &self,
        resolved: ResolvedPath,
        roots: &Roots,
        operation: &'static str,
        intent: Intent,
    ) -> Result<PathBuf, SecurityViolation> {
        let relative = resolved
            .canonical
            .strip_prefix(roots.shared())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut components = relative.components();

        if let Some(first) = components.next() {
            let nested = components.next().is_some();
            let sibling = roots.shared().join(first.as_os_str()).is_dir();
            if nested || (sibling && !METADATA_OPERATIONS.contains(&operation)) {
                return Err(self.deny(
                    "Access to other extension directories is forbidden",
                    &resolved,
                    operation,
                ));
            }
        }

        match intent {
            Intent::Read => Ok(resolved.canonical),
            Intent::Write => Err(self.deny(
                "Write access to the extensions root is forbidden",
                &resolved,
                operation,
            )),
        }
    }

    fn is_guarded(&self, path: &Path) -> bool {
        path.components().any(|component| match component {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                self.inner
                    .guarded
                    .iter()
                    .any(|prefix| part.starts_with(prefix.as_str()))
            }
            _ => false,
        })
    }

    fn deny(&self, message: &str, resolved: &ResolvedPath, operation: &str) -> SecurityViolation {
        self.violate(SecurityViolation::new(
            message,
            resolved.raw.display().to_string(),
            operation,
        ))
    }

    fn violate(&self, violation: SecurityViolation) -> SecurityViolation {
        tracing::debug!(
            extension = %self.inner.extension,
            path = %violation.path,
            operation = %violation.operation,
            "{}",
            violation.message
        );
        let mut latch = self
            .inner
            .violation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if latch.is_none() {
            *latch = Some(violation.clone());
        }
        violation
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Open a file
    pub fn open(&self, path: &str, mode: OpenMode) -> FsResult<File> {
        let target = self.check(path, "open", mode.intent())?;
        if mode.intent() == Intent::Write {
            ensure_parent(&target, "open")?;
        }
        mode.options()
            .open(&target)
            .map_err(io_error(&target, "open"))
    }

    /// Open with raw `open(2)` flags and permission bits
    #[cfg(unix)]
    pub fn open_raw(&self, path: &str, flags: i32, mode: u32) -> FsResult<File> {
        use std::os::unix::fs::OpenOptionsExt;

        let intent = raw_flags_intent(flags);
        let target = self.check(path, "os.open", intent)?;

        let access = flags & libc::O_ACCMODE;
        let mut options = OpenOptions::new();
        options
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .append(flags & libc::O_APPEND != 0)
            .truncate(flags & libc::O_TRUNC != 0);
        if flags & libc::O_CREAT != 0 {
            if flags & libc::O_EXCL != 0 {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        let handled = libc::O_ACCMODE | libc::O_APPEND | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC;
        options.mode(mode).custom_flags(flags & !handled);

        if intent == Intent::Write {
            ensure_parent(&target, "os.open")?;
        }
        options.open(&target).map_err(io_error(&target, "os.open"))
    }

    /// Wrapping an existing descriptor is never permitted
    ///
    /// A raw descriptor carries no path, so it cannot be validated.
    pub fn reopen_descriptor(&self, fd: i32) -> FsResult<File> {
        Err(self
            .violate(SecurityViolation::new(
                "Opening files from raw descriptors is forbidden",
                fd.to_string(),
                "fdopen",
            ))
            .into())
    }

    pub fn read_text(&self, path: &str) -> FsResult<String> {
        let target = self.check(path, "read_text", Intent::Read)?;
        fs::read_to_string(&target).map_err(io_error(&target, "read_text"))
    }

    pub fn read_bytes(&self, path: &str) -> FsResult<Vec<u8>> {
        let target = self.check(path, "read_bytes", Intent::Read)?;
        fs::read(&target).map_err(io_error(&target, "read_bytes"))
    }

    /// Write text, creating missing parent directories
    pub fn write_text(&self, path: &str, data: &str) -> FsResult<()> {
        let target = self.check(path, "write_text", Intent::Write)?;
        ensure_parent(&target, "write_text")?;
        fs::write(&target, data).map_err(io_error(&target, "write_text"))
    }

    /// Write bytes, creating missing parent directories
    pub fn write_bytes(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let target = self.check(path, "write_bytes", Intent::Write)?;
        ensure_parent(&target, "write_bytes")?;
        fs::write(&target, data).map_err(io_error(&target, "write_bytes"))
    }

    /// Entry names of a directory, sorted
    pub fn list_dir(&self, path: &str) -> FsResult<Vec<String>> {
        let target = self.check(path, "listdir", Intent::Read)?;
        let entries = fs::read_dir(&target).map_err(io_error(&target, "listdir"))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(&target, "listdir"))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, path: &str) -> FsResult<bool> {
        let target = self.check(path, "exists", Intent::Read)?;
        Ok(target.exists())
    }

    pub fn stat(&self, path: &str) -> FsResult<Metadata> {
        let target = self.check(path, "stat", Intent::Read)?;
        fs::metadata(&target).map_err(io_error(&target, "stat"))
    }

    pub fn is_file(&self, path: &str) -> FsResult<bool> {
        let target = self.check(path, "isfile", Intent::Read)?;
        Ok(target.is_file())
    }

    pub fn is_dir(&self, path: &str) -> FsResult<bool> {
        let target = self.check(path, "isdir", Intent::Read)?;
        Ok(target.is_dir())
    }
}

impl fmt::Debug for CapabilityFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityFs")
            .field("extension", &self.inner.extension)
            .field("private_dir", &self.private_dir())
            .finish()
    }
}

fn ensure_parent(target: &Path, operation: &'static str) -> FsResult<()> {
    match target.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(io_error(parent, operation)),
        None => Ok(()),
    }
}

fn io_error(path: &Path, operation: &'static str) -> impl FnOnce(std::io::Error) -> FsError {
    let path = path.to_path_buf();
    move |source| FsError::Io {
        path,
        operation,
        source,
    }
}
