//! Virtual root mapping and path canonicalisation
//!
//! # Path Resolution Flow
//!
//! ```text
//! Input: "self:/cache/../notes.txt"
//!           │
//!           ▼
//! ┌──────────────────────────────────┐
//! │  1. Map virtual prefix           │
//! │     self:/       → private root  │
//! │     runtime:/    → runtime root  │
//! │     extensions:/ → shared root   │
//! │     relative     → private root  │
//! │     ~/foo        → $HOME/foo     │
//! └──────────────────────────────────┘
//!           │
//!           ▼
//! ┌──────────────────────────────────┐
//! │  2. Canonicalise per component   │
//! │     - drop `.`                   │
//! │     - `..` pops resolved prefix  │
//! │     - existing prefixes follow   │
//! │       symlinks                   │
//! │     - missing tail kept as-is    │
//! └──────────────────────────────────┘
//!           │
//!           ▼
//! Output: "/srv/glint/extensions/weather/notes.txt"
//! ```
//!
//! Resolution never touches filesystem state; deciding whether the result
//! is permitted is the job of [`super::CapabilityFs`].

use std::path::{Component, Path, PathBuf};

/// Prefix addressing the caller's private root
pub const SELF_SCHEME: &str = "self:/";
/// Prefix addressing the read-only runtime root
pub const RUNTIME_SCHEME: &str = "runtime:/";
/// Prefix addressing the shared extensions root
pub const SHARED_SCHEME: &str = "extensions:/";

/// Symlink hops followed through dangling links before giving up
const MAX_LINK_HOPS: usize = 40;

/// The three roots an extension may see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    /// The extension's own folder (read and write)
    Private,
    /// Host runtime data (read only)
    Runtime,
    /// The extensions root (read only, never into other private folders)
    Shared,
}

/// Canonical roots for one extension
#[derive(Debug, Clone)]
pub struct Roots {
    private: PathBuf,
    runtime: PathBuf,
    shared: PathBuf,
}

impl Roots {
    /// Build roots for the extension owning `folder` below `shared`
    ///
    /// The private root is the canonical shared root joined with the folder
    /// name; the folder itself is not resolved, so a symlinked folder cannot
    /// widen the private root.
    pub fn new(shared: impl AsRef<Path>, runtime: impl AsRef<Path>, folder: &str) -> Self {
        let shared = canonicalize_lenient(&absolute(shared.as_ref()));
        let runtime = canonicalize_lenient(&absolute(runtime.as_ref()));
        Self {
            private: shared.join(folder),
            runtime,
            shared,
        }
    }

    pub fn private(&self) -> &Path {
        &self.private
    }

    pub fn runtime(&self) -> &Path {
        &self.runtime
    }

    pub fn shared(&self) -> &Path {
        &self.shared
    }

    /// Which root a canonical path lies in
    ///
    /// Checked most specific first: private, then runtime, then shared.
    pub fn classify(&self, canonical: &Path) -> Option<RootKind> {
        if canonical.starts_with(&self.private) {
            Some(RootKind::Private)
        } else if canonical.starts_with(&self.runtime) {
            Some(RootKind::Runtime)
        } else if canonical.starts_with(&self.shared) {
            Some(RootKind::Shared)
        } else {
            None
        }
    }
}

/// A requested path together with its resolved forms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// The string the extension passed in
    pub requested: String,
    /// After prefix mapping, before canonicalisation
    pub raw: PathBuf,
    /// Fully canonical form; operations are validated against and run on this
    pub canonical: PathBuf,
}

/// Maps requested paths onto the roots of one extension
#[derive(Debug, Clone)]
pub struct PathResolver {
    roots: Roots,
}

impl PathResolver {
    pub fn new(roots: Roots) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &Roots {
        &self.roots
    }

    /// Resolve a requested path
    pub fn resolve(&self, requested: &str) -> ResolvedPath {
        let raw = self.map_prefix(requested);
        let canonical = canonicalize_lenient(&raw);
        ResolvedPath {
            requested: requested.to_string(),
            raw,
            canonical,
        }
    }

    fn map_prefix(&self, requested: &str) -> PathBuf {
        let schemes = [
            (SELF_SCHEME, &self.roots.private),
            (RUNTIME_SCHEME, &self.roots.runtime),
            (SHARED_SCHEME, &self.roots.shared),
        ];
        for (scheme, root) in schemes {
            if let Some(rest) = requested.strip_prefix(scheme) {
                return root.join(rest.trim_start_matches('/'));
            }
        }

        let expanded = expand_home(requested);
        if expanded.is_absolute() {
            expanded
        } else {
            self.roots.private.join(expanded)
        }
    }
}

/// Expand `~` to home directory
fn expand_home(path: &str) -> PathBuf {
    if let Some(suffix) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(suffix);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Canonicalise a path that may not exist yet
///
/// Existing prefixes are replaced by their `canonicalize()` form, so
/// symlinks resolve exactly as the OS would resolve them. Dangling links are
/// followed by hand. Whatever does not exist is kept lexically, with `..`
/// popping the already resolved prefix.
pub fn canonicalize_lenient(path: &Path) -> PathBuf {
    resolve_components(path, 0)
}

fn resolve_components(path: &Path, hops: usize) -> PathBuf {
    let mut resolved = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => {
                resolved.push(part);
                match resolved.canonicalize() {
                    Ok(canonical) => resolved = canonical,
                    Err(_) => {
                        if let Ok(target) = std::fs::read_link(&resolved) {
                            if hops >= MAX_LINK_HOPS {
                                // Unresolvable chain; an empty path lies in no root
                                return PathBuf::new();
                            }
                            let base = resolved
                                .parent()
                                .map(Path::to_path_buf)
                                .unwrap_or_default();
                            resolved = resolve_components(&base.join(target), hops + 1);
                        }
                    }
                }
            }
        }
    }

    resolved
}
