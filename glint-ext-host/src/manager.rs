//! Extension lifecycle manager
//!
//! Owns every loaded extension and drives its hooks. Each call runs inside
//! a [`SandboxScope`] bound to the extension's capability, panics are
//! caught, and the outcome is classified:
//!
//! ```text
//! hook call ──► Ok ─────────────────────────────► (nothing)
//!     │
//!     ├──► SecurityViolation (returned or latched) ─► Disabled at once
//!     │
//!     └──► error / panic / timeout ──► count += 1 ──► Disabled at threshold
//! ```
//!
//! Every entry point takes `&mut self`, so hook execution is serialized.

use crate::audit::{self, AuditSink, NullAuditSink};
use crate::config::HostConfig;
use crate::context::{ContextSource, HookContext, UpdateRequester};
use crate::error::{HookFailure, LoadError};
use crate::extension::Extension;
use crate::fs::{sanitize_extension_name, CapabilityFs};
use crate::render::{RenderContext, StatusContext};
use crate::sandbox::SandboxScope;
use crate::slot::{ExtensionSlot, Transition};
use futures::FutureExt;
use glint_ext_api::{ExtensionInfo, HookKind};
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Snapshot key holding every extension's namespace
pub const EXTENSIONS_KEY: &str = "extensions";

struct Entry {
    slot: ExtensionSlot,
    extension: Box<dyn Extension>,
    loaded: bool,
}

/// Owns loaded extensions and invokes their hooks
pub struct ExtensionManager {
    config: HostConfig,
    entries: Vec<Entry>,
    snapshot: Value,
    updates: UpdateRequester,
    audit: Arc<dyn AuditSink>,
}

impl ExtensionManager {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            snapshot: Value::Object(Map::new()),
            updates: UpdateRequester::new(),
            audit: Arc::new(NullAuditSink::new()),
        }
    }

    /// Send audit events to `sink`
    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Snapshot retained from the latest `on_snapshot` pass
    pub fn snapshot(&self) -> &Value {
        &self.snapshot
    }

    /// Check that `name` and its sanitised folder are both still free
    ///
    /// Two extensions must never share a private root.
    pub fn ensure_available(&self, name: &str) -> Result<(), LoadError> {
        let folder = sanitize_extension_name(name);
        match self
            .entries
            .iter()
            .find(|e| e.slot.name() == name || e.slot.folder() == folder)
        {
            Some(existing) => Err(LoadError::Collision {
                name: name.to_string(),
                existing: existing.slot.name().to_string(),
                folder,
            }),
            None => Ok(()),
        }
    }

    /// Take ownership of an instantiated extension
    pub fn register(
        &mut self,
        info: ExtensionInfo,
        extension: Box<dyn Extension>,
    ) -> Result<(), LoadError> {
        self.ensure_available(&info.name)?;
        let folder = sanitize_extension_name(&info.name);

        let capability = CapabilityFs::for_config(&info.name, &self.config);
        if let Err(e) = std::fs::create_dir_all(capability.private_dir()) {
            tracing::warn!(
                extension = %info.name,
                path = %capability.private_dir().display(),
                error = %e,
                "Failed to create private folder"
            );
        }

        tracing::info!(
            extension = %info.name,
            version = %info.version,
            folder = %folder,
            "Extension registered"
        );
        audit::record(self.audit.as_ref(), audit::extension_loaded(&info, &folder));

        self.entries.push(Entry {
            slot: ExtensionSlot::new(info, folder, self.config.failure_threshold),
            extension,
            loaded: false,
        });
        Ok(())
    }

    /// Run `on_load` for every extension that has not had it yet
    pub fn on_load(&mut self) {
        let shared = Shared {
            config: &self.config,
            snapshot: &self.snapshot,
            updates: &self.updates,
            audit: self.audit.as_ref(),
        };

        for entry in self.entries.iter_mut().filter(|e| !e.loaded) {
            entry.loaded = true;
            if entry.slot.is_active() {
                invoke(entry, HookKind::Load, &shared, StatusContext::unbound(), |ext, ctx| {
                    ext.on_load(ctx)
                });
            }
        }
    }

    /// Let every active extension fill its snapshot namespace
    ///
    /// Each extension gets `snapshot["extensions"][name]` (created as an
    /// empty object when missing) to mutate; the rest of the snapshot is
    /// its read-only view. The result is kept for later hooks.
    pub fn on_snapshot(&mut self, snapshot: &mut Value) {
        if !snapshot.is_object() {
            tracing::warn!("Snapshot is not a JSON object, skipping on_snapshot");
            self.snapshot = snapshot.clone();
            return;
        }

        let config = &self.config;
        let updates = &self.updates;
        let audit = self.audit.as_ref();

        for entry in self.entries.iter_mut().filter(|e| e.slot.is_active()) {
            let name = entry.slot.name().to_string();
            let mut namespace = take_namespace(snapshot, &name);

            let shared = Shared {
                config,
                snapshot: &*snapshot,
                updates,
                audit,
            };
            invoke(entry, HookKind::Snapshot, &shared, StatusContext::unbound(), |ext, ctx| {
                ext.on_snapshot(&mut namespace, ctx)
            });

            put_namespace(snapshot, &name, namespace);
        }

        self.snapshot = snapshot.clone();
    }

    /// Let every active extension edit the shared render buffer, in order
    ///
    /// A security violation rolls the buffer back to what it was before
    /// the violating extension ran.
    pub fn on_render(&mut self, render: &mut RenderContext, mode: &str) {
        let shared = Shared {
            config: &self.config,
            snapshot: &self.snapshot,
            updates: &self.updates,
            audit: self.audit.as_ref(),
        };

        for entry in self.entries.iter_mut().filter(|e| e.slot.is_active()) {
            let checkpoint = render.clone();
            let failure = run_sync(
                entry,
                HookKind::Render,
                &shared,
                StatusContext::bound(render, mode),
                |ext, ctx| ext.on_render(ctx),
            );

            if matches!(failure, Some(HookFailure::Security(_))) {
                *render = checkpoint;
            }
            settle(&mut entry.slot, HookKind::Render, failure, shared.audit);
        }
    }

    /// Run `on_tick` for every active extension, one at a time
    pub async fn on_tick(&mut self) {
        let timeout = self.config.tick_timeout();
        let shared = Shared {
            config: &self.config,
            snapshot: &self.snapshot,
            updates: &self.updates,
            audit: self.audit.as_ref(),
        };

        for entry in self.entries.iter_mut() {
            if !entry.slot.is_active() {
                continue;
            }

            let fs = shared.capability(entry.slot.name());
            let mut ctx = shared.context(HookKind::Tick, fs.clone(), StatusContext::unbound());
            let scope = SandboxScope::new(fs.clone());

            let call = AssertUnwindSafe(scope.run_async(entry.extension.on_tick(&mut ctx)))
                .catch_unwind();
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => Outcome::from(result),
                    Err(_) => Outcome::TimedOut(limit),
                },
                None => Outcome::from(call.await),
            };
            drop(ctx);

            let failure = classify(outcome, &fs);
            settle(&mut entry.slot, HookKind::Tick, failure, shared.audit);
        }
    }

    /// Run `on_tick` every configured interval until `shutdown` yields or closes
    pub async fn tick_loop(&mut self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                _ = shutdown.recv() => {
                    tracing::info!("Tick loop stopped");
                    break;
                }
            }
        }
    }

    /// Best-effort `on_shutdown`; failures are logged, never counted
    pub fn on_shutdown(&mut self) {
        let shared = Shared {
            config: &self.config,
            snapshot: &self.snapshot,
            updates: &self.updates,
            audit: self.audit.as_ref(),
        };

        for entry in self.entries.iter_mut().filter(|e| e.slot.is_active()) {
            let failure = run_sync(
                entry,
                HookKind::Shutdown,
                &shared,
                StatusContext::unbound(),
                |ext, ctx| ext.on_shutdown(ctx),
            );
            if let Some(failure) = failure {
                tracing::error!(
                    extension = %entry.slot.name(),
                    error = %failure,
                    "on_shutdown failed"
                );
                audit::record(shared.audit, audit::shutdown_failed(entry.slot.name(), &failure));
            }
        }

        if let Err(e) = self.audit.flush() {
            tracing::warn!(error = %e, "Failed to flush audit sink");
        }
    }

    /// Ask the host for an early re-render
    pub fn request_update(&self) {
        self.updates.request();
    }

    /// Read and clear the re-render flag
    pub fn consume_update_request(&self) -> bool {
        self.updates.consume()
    }

    /// Handle for raising the re-render flag from elsewhere
    pub fn update_requester(&self) -> UpdateRequester {
        self.updates.clone()
    }

    /// Slots in registration order
    pub fn slots(&self) -> impl Iterator<Item = &ExtensionSlot> {
        self.entries.iter().map(|e| &e.slot)
    }

    pub fn slot(&self, name: &str) -> Option<&ExtensionSlot> {
        self.slots().find(|s| s.name() == name)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.slot(name).is_some_and(ExtensionSlot::is_active)
    }

    pub fn active_names(&self) -> Vec<&str> {
        self.slots()
            .filter(|s| s.is_active())
            .map(ExtensionSlot::name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("extensions_dir", &self.config.extensions_dir)
            .field("slots", &self.slots().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Hook invocation
// ============================================================================

/// Host state borrowed while hooks run
struct Shared<'a> {
    config: &'a HostConfig,
    snapshot: &'a Value,
    updates: &'a UpdateRequester,
    audit: &'a dyn AuditSink,
}

impl<'a> Shared<'a> {
    fn capability(&self, extension: &str) -> CapabilityFs {
        CapabilityFs::for_config(extension, self.config)
    }

    fn context<'b>(
        &self,
        hook: HookKind,
        fs: CapabilityFs,
        status: StatusContext<'b>,
    ) -> HookContext<'b>
    where
        'a: 'b,
    {
        let config: &'a HostConfig = self.config;
        let source = ContextSource {
            config: &config.config,
            snapshot: self.snapshot,
            platform: &config.platform,
            storage_file: &config.storage_file,
            updates: self.updates,
        };
        HookContext::new(hook, source, fs, status)
    }
}

enum Outcome {
    Completed(anyhow::Result<()>),
    Panicked(Box<dyn Any + Send>),
    TimedOut(Duration),
}

impl From<Result<anyhow::Result<()>, Box<dyn Any + Send>>> for Outcome {
    fn from(result: Result<anyhow::Result<()>, Box<dyn Any + Send>>) -> Self {
        match result {
            Ok(result) => Outcome::Completed(result),
            Err(payload) => Outcome::Panicked(payload),
        }
    }
}

/// Run one synchronous hook sandboxed and classify the outcome
fn run_sync<F>(
    entry: &mut Entry,
    hook: HookKind,
    shared: &Shared<'_>,
    status: StatusContext<'_>,
    call: F,
) -> Option<HookFailure>
where
    F: FnOnce(&mut Box<dyn Extension>, &mut HookContext<'_>) -> anyhow::Result<()>,
{
    let fs = shared.capability(entry.slot.name());
    let mut ctx = shared.context(hook, fs.clone(), status);
    let scope = SandboxScope::new(fs.clone());
    let extension = &mut entry.extension;

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        scope.run(|| call(extension, &mut ctx))
    }));
    drop(ctx);

    classify(Outcome::from(result), &fs)
}

/// Run one synchronous hook and apply any failure to the slot
fn invoke<F>(
    entry: &mut Entry,
    hook: HookKind,
    shared: &Shared<'_>,
    status: StatusContext<'_>,
    call: F,
) where
    F: FnOnce(&mut Box<dyn Extension>, &mut HookContext<'_>) -> anyhow::Result<()>,
{
    let failure = run_sync(entry, hook, shared, status, call);
    settle(&mut entry.slot, hook, failure, shared.audit);
}

/// Turn an outcome into a failure, honouring the violation latch
///
/// An extension that swallowed a violation error is still a violator.
fn classify(outcome: Outcome, fs: &CapabilityFs) -> Option<HookFailure> {
    let failure = match outcome {
        Outcome::Completed(Ok(())) => None,
        Outcome::Completed(Err(err)) => Some(HookFailure::from_error(err)),
        Outcome::Panicked(payload) => Some(HookFailure::from_panic(payload)),
        Outcome::TimedOut(limit) => Some(HookFailure::TimedOut(limit)),
    };

    match (fs.take_violation(), failure) {
        (_, Some(failure @ HookFailure::Security(_))) => Some(failure),
        (Some(violation), _) => Some(HookFailure::Security(violation)),
        (None, failure) => failure,
    }
}

fn settle(
    slot: &mut ExtensionSlot,
    hook: HookKind,
    failure: Option<HookFailure>,
    audit_sink: &dyn AuditSink,
) {
    let Some(failure) = failure else {
        return;
    };
    let name = slot.name().to_string();

    match &failure {
        HookFailure::Security(violation) => {
            tracing::error!(
                extension = %name,
                hook = %hook,
                path = %violation.path,
                operation = %violation.operation,
                "SECURITY VIOLATION: {}",
                violation.message
            );
            audit::record(
                audit_sink,
                audit::security_violation(&name, hook.as_str(), violation),
            );
        }
        other => {
            tracing::error!(extension = %name, hook = %hook, error = %other, "Extension hook failed");
        }
    }

    match slot.record(hook, &failure) {
        Transition::Counted { count } => {
            audit::record(audit_sink, audit::hook_failed(&name, hook, &failure, count));
        }
        Transition::Disabled(reason) => {
            if !failure.is_security_violation() {
                audit::record(
                    audit_sink,
                    audit::hook_failed(&name, hook, &failure, slot.failure_count()),
                );
            }
            tracing::warn!(extension = %name, reason = %reason, "Extension disabled");
            audit::record(audit_sink, audit::extension_disabled(&name, &reason));
        }
        Transition::AlreadyDisabled => {}
    }
}

fn take_namespace(snapshot: &mut Value, name: &str) -> Map<String, Value> {
    let Some(root) = snapshot.as_object_mut() else {
        return Map::new();
    };
    let all = root
        .entry(EXTENSIONS_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    if !all.is_object() {
        *all = Value::Object(Map::new());
    }

    match all.as_object_mut().and_then(|all| all.remove(name)) {
        Some(Value::Object(namespace)) => namespace,
        _ => Map::new(),
    }
}

fn put_namespace(snapshot: &mut Value, name: &str, namespace: Map<String, Value>) {
    if let Some(Value::Object(all)) = snapshot.get_mut(EXTENSIONS_KEY) {
        all.insert(name.to_string(), Value::Object(namespace));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, MemoryAuditSink};
    use crate::sandbox;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        dir: tempfile::TempDir,
        audit: Arc<MemoryAuditSink>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("runtime")).unwrap();
            Self {
                dir,
                audit: Arc::new(MemoryAuditSink::new()),
            }
        }

        fn config(&self) -> HostConfig {
            HostConfig::new(self.dir.path().join("extensions"), self.dir.path().join("runtime"))
        }

        fn manager(&self) -> ExtensionManager {
            self.manager_with(self.config())
        }

        fn manager_with(&self, config: HostConfig) -> ExtensionManager {
            ExtensionManager::new(config).with_audit(self.audit.clone())
        }
    }

    fn add(manager: &mut ExtensionManager, name: &str, ext: impl Extension + 'static) {
        manager
            .register(ExtensionInfo::new(name, "1.0.0"), Box::new(ext))
            .unwrap();
    }

    /// Counts calls and fails every render
    struct Flaky {
        calls: Arc<AtomicUsize>,
    }

    impl Extension for Flaky {
        fn on_render(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("flaky render")
        }
    }

    struct Liner(&'static str);

    impl Extension for Liner {
        fn on_render(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            ctx.status().add_line(self.0)?;
            Ok(())
        }
    }

    #[test]
    fn test_three_failures_disable() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        let calls = Arc::new(AtomicUsize::new(0));
        add(&mut manager, "flaky", Flaky { calls: calls.clone() });
        add(&mut manager, "steady", Liner("steady"));

        for _ in 0..5 {
            let mut render = RenderContext::default();
            manager.on_render(&mut render, "status");
            assert_eq!(render.lines().last().map(String::as_str), Some("steady"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!manager.is_active("flaky"));
        assert!(manager.is_active("steady"));
        assert_eq!(manager.active_names(), ["steady"]);
        assert_eq!(fx.audit.find_by_type(AuditEventType::HookFailed).len(), 3);
        assert_eq!(fx.audit.find_by_type(AuditEventType::ExtensionDisabled).len(), 1);
    }

    /// Writes through the ambient entry point and swallows the error
    struct Sneaky;

    impl Extension for Sneaky {
        fn on_render(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            let _ = sandbox::fs::write("runtime:/planted.txt", "x");
            ctx.status().add_line("sneaky")?;
            Ok(())
        }
    }

    #[test]
    fn test_swallowed_violation_still_disables() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        add(&mut manager, "sneaky", Sneaky);

        let mut render = RenderContext::new(vec!["base".into()]);
        manager.on_render(&mut render, "status");

        // Lines written after the swallowed violation are dropped too
        assert_eq!(render.lines(), ["base"]);
        assert!(!manager.is_active("sneaky"));
        assert!(!fx.dir.path().join("runtime/planted.txt").exists());
        let violations = fx.audit.find_by_type(AuditEventType::SecurityViolation);
        assert_eq!(violations.len(), 1);
        assert_eq!(manager.slot("sneaky").unwrap().failure_count(), 0);

        // Disabled extensions get no further hooks
        let mut render = RenderContext::default();
        manager.on_render(&mut render, "status");
        assert!(render.lines().is_empty());
    }

    /// Fails its first render, then rewrites the buffer and escapes the sandbox
    struct Relapse {
        calls: Arc<AtomicUsize>,
    }

    impl Extension for Relapse {
        fn on_render(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first render fails");
            }
            ctx.status().clear()?;
            ctx.status().add_line("relapse")?;
            ctx.fs().write_text("runtime:/x.txt", "x")?;
            Ok(())
        }
    }

    #[test]
    fn test_violation_after_prior_failure_disables_and_rolls_back() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        let calls = Arc::new(AtomicUsize::new(0));
        add(&mut manager, "before", Liner("before"));
        add(&mut manager, "relapse", Relapse { calls: calls.clone() });
        add(&mut manager, "after", Liner("after"));

        let mut render = RenderContext::default();
        manager.on_render(&mut render, "status");
        assert_eq!(manager.slot("relapse").unwrap().failure_count(), 1);
        assert!(manager.is_active("relapse"));

        let mut render = RenderContext::default();
        manager.on_render(&mut render, "status");
        assert_eq!(render.lines(), ["before", "after"]);

        let slot = manager.slot("relapse").unwrap();
        assert_eq!(slot.failure_count(), 1);
        assert_eq!(
            slot.state(),
            &crate::slot::SlotState::Disabled {
                reason: crate::slot::DisableReason::SecurityViolation {
                    hook: HookKind::Render
                }
            }
        );

        // Never retried
        manager.on_render(&mut RenderContext::default(), "status");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!fx.dir.path().join("runtime/x.txt").exists());
    }

    struct Panicky;

    impl Extension for Panicky {
        fn on_load(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            panic!("bad load")
        }
    }

    #[test]
    fn test_panic_counts_as_failure() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        add(&mut manager, "panicky", Panicky);
        manager.on_load();

        let slot = manager.slot("panicky").unwrap();
        assert!(slot.is_active());
        assert_eq!(slot.failure_count(), 1);
        assert!(!sandbox::is_active());

        // on_load runs only once per extension
        manager.on_load();
        assert_eq!(manager.slot("panicky").unwrap().failure_count(), 1);
    }

    struct StatusOutsideRender;

    impl Extension for StatusOutsideRender {
        fn on_snapshot(
            &mut self,
            _namespace: &mut Map<String, Value>,
            ctx: &mut HookContext<'_>,
        ) -> anyhow::Result<()> {
            ctx.status().add_line("too early")?;
            Ok(())
        }
    }

    #[test]
    fn test_status_outside_render_is_generic_failure() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        add(&mut manager, "early", StatusOutsideRender);

        let mut snapshot = json!({});
        manager.on_snapshot(&mut snapshot);

        let slot = manager.slot("early").unwrap();
        assert!(slot.is_active());
        assert_eq!(slot.failure_count(), 1);
    }

    struct Counter;

    impl Extension for Counter {
        fn on_snapshot(
            &mut self,
            namespace: &mut Map<String, Value>,
            ctx: &mut HookContext<'_>,
        ) -> anyhow::Result<()> {
            let viewers = ctx.snapshot()["viewers"].as_u64().unwrap_or(0);
            let seen = namespace.get("seen").and_then(Value::as_u64).unwrap_or(0);
            namespace.insert("seen".into(), json!(seen + 1));
            namespace.insert("viewers".into(), json!(viewers));
            Ok(())
        }

        fn on_render(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            let seen = ctx.snapshot()["extensions"]["counter"]["seen"].clone();
            ctx.status().add_line(format!("seen {seen}"))?;
            Ok(())
        }
    }

    #[test]
    fn test_snapshot_namespace() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        add(&mut manager, "counter", Counter);

        let mut snapshot = json!({"viewers": 7});
        manager.on_snapshot(&mut snapshot);
        manager.on_snapshot(&mut snapshot);

        assert_eq!(snapshot["extensions"]["counter"], json!({"seen": 2, "viewers": 7}));
        assert_eq!(manager.snapshot(), &snapshot);

        let mut render = RenderContext::default();
        manager.on_render(&mut render, "status");
        assert_eq!(render.lines(), ["seen 2".to_string()].as_slice());
    }

    #[test]
    fn test_render_order_follows_registration() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        add(&mut manager, "first", Liner("one"));
        add(&mut manager, "second", Liner("two"));

        let mut render = RenderContext::new(vec!["base".into()]);
        manager.on_render(&mut render, "status");
        assert_eq!(render.into_text(), "base\none\ntwo");
    }

    #[test]
    fn test_collision_rejected() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        add(&mut manager, "My Ext", Liner("a"));

        let err = manager
            .register(ExtensionInfo::new("My_Ext", "2.0.0"), Box::new(Liner("b")))
            .unwrap_err();
        assert!(matches!(err, LoadError::Collision { ref existing, .. } if existing == "My Ext"));

        let err = manager
            .register(ExtensionInfo::new("My Ext", "2.0.0"), Box::new(Liner("c")))
            .unwrap_err();
        assert!(matches!(err, LoadError::Collision { .. }));
        assert_eq!(manager.len(), 1);
        assert!(fx.dir.path().join("extensions/My_Ext").is_dir());
    }

    struct Shy;

    impl Extension for Shy {
        fn on_shutdown(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("cannot say goodbye")
        }
    }

    #[test]
    fn test_shutdown_failure_not_counted() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        add(&mut manager, "shy", Shy);

        for _ in 0..4 {
            manager.on_shutdown();
        }

        let slot = manager.slot("shy").unwrap();
        assert!(slot.is_active());
        assert_eq!(slot.failure_count(), 0);
        assert_eq!(fx.audit.find_by_type(AuditEventType::ShutdownFailed).len(), 4);
    }

    struct Remember;

    #[async_trait]
    impl Extension for Remember {
        async fn on_tick(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            let ticks = ctx.storage().get_or("ticks", 0).as_u64().unwrap_or(0);
            ctx.storage().set("ticks", ticks + 1);
            sandbox::fs::write("self:/last_tick.txt", ticks.to_string())?;
            if ticks + 1 >= 2 {
                ctx.request_update();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tick_storage_and_update_request() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        add(&mut manager, "remember", Remember);

        manager.on_tick().await;
        assert!(!manager.consume_update_request());
        manager.on_tick().await;
        assert!(manager.consume_update_request());
        assert!(!manager.consume_update_request());

        let private = fx.dir.path().join("extensions/remember");
        let stored: Value =
            serde_json::from_str(&std::fs::read_to_string(private.join("storage.json")).unwrap())
                .unwrap();
        assert_eq!(stored["ticks"], 2);
        assert_eq!(std::fs::read_to_string(private.join("last_tick.txt")).unwrap(), "1");
        assert!(manager.is_active("remember"));
    }

    struct Sleepy;

    #[async_trait]
    impl Extension for Sleepy {
        async fn on_tick(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_timeout_is_generic_failure() {
        let fx = Fixture::new();
        let config = fx
            .config()
            .with_tick_timeout(Some(Duration::from_millis(100)));
        let mut manager = fx.manager_with(config);
        add(&mut manager, "sleepy", Sleepy);

        manager.on_tick().await;

        assert_eq!(manager.slot("sleepy").unwrap().failure_count(), 1);
        assert!(!sandbox::is_active());
    }

    struct TickCounter(Arc<AtomicUsize>);

    #[async_trait]
    impl Extension for TickCounter {
        async fn on_tick(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_loop_stops_on_shutdown() {
        let fx = Fixture::new();
        let config = fx.config().with_tick_interval(Duration::from_secs(10));
        let mut manager = fx.manager_with(config);
        let ticks = Arc::new(AtomicUsize::new(0));
        add(&mut manager, "ticker", TickCounter(ticks.clone()));

        let (tx, rx) = mpsc::channel(1);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            tx.send(()).await.unwrap();
        });

        manager.tick_loop(rx).await;
        stopper.await.unwrap();

        // Ticks at 0s, 10s and 20s
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
