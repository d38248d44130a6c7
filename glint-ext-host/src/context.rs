//! Per-hook context handed to extension code

use crate::fs::CapabilityFs;
use crate::render::StatusContext;
use crate::storage::Storage;
use chrono::{DateTime, Local, Utc};
use glint_ext_api::{HookKind, LogLevel};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Logger scoped to one extension
///
/// Events go to the `glint::extension` target with an `extension` field, so
/// they can be filtered with `RUST_LOG=glint::extension=debug`.
#[derive(Debug, Clone)]
pub struct ExtensionLogger {
    extension: String,
}

impl ExtensionLogger {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let extension = self.extension.as_str();
        match level {
            LogLevel::Trace => tracing::trace!(target: "glint::extension", extension, "{message}"),
            LogLevel::Debug => tracing::debug!(target: "glint::extension", extension, "{message}"),
            LogLevel::Info => tracing::info!(target: "glint::extension", extension, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "glint::extension", extension, "{message}"),
            LogLevel::Error => tracing::error!(target: "glint::extension", extension, "{message}"),
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message.as_ref());
    }
}

/// Flag an extension raises to ask the host for an early re-render
#[derive(Debug, Clone, Default)]
pub struct UpdateRequester(Arc<AtomicBool>);

impl UpdateRequester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Read and clear the flag
    pub fn consume(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Wall-clock and monotonic time
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock;

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn local(&self) -> DateTime<Local> {
        Local::now()
    }

    /// Seconds since the Unix epoch
    pub fn timestamp(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }

    pub fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Everything one hook call may use
///
/// Built fresh by the manager for every call. Storage is opened on first
/// use only.
pub struct HookContext<'a> {
    hook: HookKind,
    logger: ExtensionLogger,
    config: &'a Map<String, Value>,
    snapshot: &'a Value,
    platform: &'a str,
    storage_path: PathBuf,
    storage: Option<Storage>,
    fs: CapabilityFs,
    status: StatusContext<'a>,
    updates: UpdateRequester,
    clock: Clock,
}

/// Host-owned pieces a [`HookContext`] borrows
#[derive(Debug, Clone, Copy)]
pub struct ContextSource<'a> {
    pub config: &'a Map<String, Value>,
    pub snapshot: &'a Value,
    pub platform: &'a str,
    pub storage_file: &'a str,
    pub updates: &'a UpdateRequester,
}

impl<'a> HookContext<'a> {
    pub fn new(
        hook: HookKind,
        source: ContextSource<'a>,
        fs: CapabilityFs,
        status: StatusContext<'a>,
    ) -> Self {
        Self {
            hook,
            logger: ExtensionLogger::new(fs.extension()),
            config: source.config,
            snapshot: source.snapshot,
            platform: source.platform,
            storage_path: fs.private_dir().join(source.storage_file),
            storage: None,
            fs,
            status,
            updates: source.updates.clone(),
            clock: Clock,
        }
    }

    /// Hook being run
    pub fn hook(&self) -> HookKind {
        self.hook
    }

    pub fn extension_name(&self) -> &str {
        self.fs.extension()
    }

    pub fn logger(&self) -> &ExtensionLogger {
        &self.logger
    }

    pub fn config(&self) -> &Map<String, Value> {
        self.config
    }

    /// Read-only view of the latest snapshot
    pub fn snapshot(&self) -> &Value {
        self.snapshot
    }

    pub fn platform(&self) -> &str {
        self.platform
    }

    /// The extension's storage, opened on first use
    pub fn storage(&mut self) -> &mut Storage {
        let path = &self.storage_path;
        self.storage.get_or_insert_with(|| Storage::open(path))
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// The extension's filesystem capability
    pub fn fs(&self) -> &CapabilityFs {
        &self.fs
    }

    /// Status view; bound only during `on_render`
    pub fn status(&mut self) -> &mut StatusContext<'a> {
        &mut self.status
    }

    /// Ask the host to re-render before the next scheduled tick
    pub fn request_update(&self) {
        self.updates.request();
    }

    pub fn updates(&self) -> &UpdateRequester {
        &self.updates
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderContext;
    use serde_json::json;

    #[test]
    fn test_update_requester() {
        let updates = UpdateRequester::new();
        let clone = updates.clone();
        assert!(!updates.consume());

        clone.request();
        assert!(updates.is_requested());
        assert!(updates.consume());
        assert!(!updates.consume());
    }

    #[test]
    fn test_context_accessors() {
        let dir = tempfile::tempdir().unwrap();
        let fs = CapabilityFs::new("Clock Ext", dir.path().join("ext"), dir.path().join("rt"));
        let config = Map::from_iter([("tz".to_string(), json!("UTC"))]);
        let snapshot = json!({"viewers": 3});
        let updates = UpdateRequester::new();
        let source = ContextSource {
            config: &config,
            snapshot: &snapshot,
            platform: "linux",
            storage_file: "storage.json",
            updates: &updates,
        };
        let mut render = RenderContext::default();

        let mut ctx = HookContext::new(
            HookKind::Render,
            source,
            fs,
            StatusContext::bound(&mut render, "status"),
        );

        assert_eq!(ctx.extension_name(), "Clock Ext");
        assert_eq!(ctx.config()["tz"], "UTC");
        assert_eq!(ctx.snapshot()["viewers"], 3);
        assert_eq!(ctx.platform(), "linux");
        assert!(ctx.storage_path().ends_with("Clock_Ext/storage.json"));

        ctx.storage().set("seen", true);
        ctx.status().add_line("hello").unwrap();
        ctx.request_update();
        drop(ctx);

        assert!(updates.consume());
        assert_eq!(render.lines(), ["hello".to_string()].as_slice());
        assert!(dir.path().join("ext/Clock_Ext/storage.json").is_file());
    }

    #[test]
    fn test_clock() {
        let clock = Clock;
        let start = clock.monotonic();
        assert!(clock.timestamp() > 1_600_000_000.0);
        assert!(clock.now().timestamp() > 1_600_000_000);
        assert!(clock.monotonic() >= start);
    }
}
