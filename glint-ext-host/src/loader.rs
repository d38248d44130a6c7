//! Extension discovery and the load pass
//!
//! ```text
//! ModuleCatalog (native, registration order)  ─┐
//! extensions dir (*.wasm, sorted by file name) ─┴─► for each unit:
//!
//!   1. unit code runs in a scope bound to the unit name
//!   2. API version must equal `required_api_version`
//!   3. factories register (same scope)
//!   4. each extension is built in a scope bound to its own name
//!   5. manager.register (name/folder collisions refused)
//!
//! then manager.on_load()
//! ```
//!
//! Nothing fails the pass as a whole: every refusal is logged, audited and
//! listed in the returned [`LoadReport`].

use crate::audit;
use crate::config::HostConfig;
use crate::error::{HookFailure, LoadError, SecurityViolation};
use crate::fs::CapabilityFs;
use crate::manager::ExtensionManager;
use crate::module::{ExtensionModule, ModuleCatalog, Registrar};
use crate::sandbox::SandboxScope;
use crate::wasm::{WasmError, WasmUnitSource};
use std::io::ErrorKind;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

/// A kind of unit file found in the extensions directory
pub trait UnitSource: Send + Sync {
    /// Short label for logs
    fn kind(&self) -> &'static str;

    /// Whether this source handles `path`
    fn accepts(&self, path: &Path) -> bool;

    /// Read the unit and run its top-level code
    ///
    /// Called inside a sandbox scope bound to the unit name.
    fn load(&self, path: &Path) -> anyhow::Result<Box<dyn ExtensionModule>>;
}

/// Outcome of [`ExtensionLoader::load_all`]
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Extension names, in load order
    pub loaded: Vec<String>,
    /// Unit or extension name with the reason it was refused
    pub skipped: Vec<(String, LoadError)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }

    pub fn skipped_names(&self) -> impl Iterator<Item = &str> {
        self.skipped.iter().map(|(name, _)| name.as_str())
    }

    /// Reason `name` was refused, if it was
    pub fn reason(&self, name: &str) -> Option<&LoadError> {
        self.skipped
            .iter()
            .find(|(skipped, _)| skipped == name)
            .map(|(_, reason)| reason)
    }
}

/// Finds units and hands their extensions to an [`ExtensionManager`]
#[derive(Default)]
pub struct ExtensionLoader {
    catalog: ModuleCatalog,
    sources: Vec<Box<dyn UnitSource>>,
}

/// Why sandboxed load-time code was refused
enum Refusal {
    Security(SecurityViolation),
    Failed(anyhow::Error),
}

impl ExtensionLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Native units, loaded before anything on disk
    pub fn with_catalog(mut self, catalog: ModuleCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Handle another kind of unit file
    pub fn with_source(mut self, source: impl UnitSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Load `*.wasm` units from the extensions directory
    pub fn with_wasm(self, config: &HostConfig) -> Result<Self, WasmError> {
        Ok(self.with_source(WasmUnitSource::from_config(config)?))
    }

    /// Load every unit, then run `on_load` for everything that was registered
    pub fn load_all(&self, manager: &mut ExtensionManager) -> LoadReport {
        let mut report = LoadReport::default();

        for (unit, init) in self.catalog.units() {
            tracing::debug!(unit, kind = "native", "Loading unit");
            self.load_unit(unit, manager, &mut report, || init());
        }

        let dir = manager.config().extensions_dir.clone();
        for (unit, path, source) in self.discover(&dir) {
            tracing::debug!(unit = %unit, kind = source.kind(), path = %path.display(), "Loading unit");
            self.load_unit(&unit, manager, &mut report, || source.load(&path));
        }

        tracing::info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            "Load pass finished"
        );
        manager.on_load();
        report
    }

    /// Unit files in `dir`, sorted by file name
    fn discover(&self, dir: &Path) -> Vec<(String, PathBuf, &dyn UnitSource)> {
        if self.sources.is_empty() {
            return Vec::new();
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %dir.display(), "Extensions folder not found, skipping");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Failed to read extensions folder");
                return Vec::new();
            }
        };

        let mut units: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter_map(|path| {
                let source = self.sources.iter().find(|s| s.accepts(&path))?;
                let unit = path.file_stem()?.to_string_lossy().into_owned();
                Some((unit, path, source.as_ref()))
            })
            .collect();
        units.sort_by(|a, b| a.1.file_name().cmp(&b.1.file_name()));
        units
    }

    fn load_unit<F>(&self, unit: &str, manager: &mut ExtensionManager, report: &mut LoadReport, load: F)
    where
        F: FnOnce() -> anyhow::Result<Box<dyn ExtensionModule>>,
    {
        if unit.starts_with('_') {
            tracing::debug!(unit, "Skipping private unit");
            return;
        }

        let expected = manager.config().required_api_version.clone();
        let scope = SandboxScope::new(CapabilityFs::for_config(unit, manager.config()));

        let module = match run_sandboxed(&scope, load) {
            Ok(module) => module,
            Err(refusal) => return skip_unit(manager, report, unit, refusal.into_unit_error()),
        };

        match module.api_version() {
            None => return skip_unit(manager, report, unit, LoadError::MissingApiVersion { expected }),
            Some(found) if found != expected => {
                let found = found.to_string();
                return skip_unit(
                    manager,
                    report,
                    unit,
                    LoadError::IncompatibleApiVersion { expected, found },
                );
            }
            Some(_) => {}
        }

        let mut registrar = Registrar::new();
        if let Err(refusal) = run_sandboxed(&scope, || module.register(&mut registrar)) {
            return skip_unit(manager, report, unit, refusal.into_unit_error());
        }

        tracing::info!(unit, extensions = registrar.len(), "Unit loaded");

        for (info, factory) in registrar.into_entries() {
            let name = info.name.clone();
            if let Err(err) = manager.ensure_available(&name) {
                reject(manager, report, &name, err);
                continue;
            }

            let scope = SandboxScope::new(CapabilityFs::for_config(&name, manager.config()));
            let result = match run_sandboxed(&scope, factory) {
                Ok(extension) => manager.register(info, extension),
                Err(Refusal::Security(violation)) => Err(LoadError::Security(violation)),
                Err(Refusal::Failed(err)) => Err(LoadError::Instantiate {
                    name: name.clone(),
                    reason: format!("{err:#}"),
                }),
            };

            match result {
                Ok(()) => report.loaded.push(name),
                Err(err) => reject(manager, report, &name, err),
            }
        }
    }
}

impl Refusal {
    fn into_unit_error(self) -> LoadError {
        match self {
            Refusal::Security(violation) => LoadError::Security(violation),
            Refusal::Failed(err) => LoadError::Unit(err),
        }
    }
}

/// Run load-time code inside `scope`, catching panics
///
/// A violation the code swallowed still counts: the scope's latch is
/// checked after every call.
fn run_sandboxed<T>(
    scope: &SandboxScope,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, Refusal> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| scope.run(f)));

    if let Some(violation) = scope.capability().take_violation() {
        return Err(Refusal::Security(violation));
    }

    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => match SecurityViolation::find_in(&err) {
            Some(violation) => Err(Refusal::Security(violation)),
            None => Err(Refusal::Failed(err)),
        },
        Err(payload) => Err(Refusal::Failed(anyhow::Error::new(
            HookFailure::from_panic(payload),
        ))),
    }
}

fn skip_unit(manager: &ExtensionManager, report: &mut LoadReport, unit: &str, reason: LoadError) {
    if reason.is_security_violation() {
        tracing::error!(unit, reason = %reason, "Unit refused");
    } else {
        tracing::warn!(unit, reason = %reason, "Unit skipped");
    }
    audit::record(manager.audit().as_ref(), audit::unit_skipped(unit, &reason));
    report.skipped.push((unit.to_string(), reason));
}

fn reject(manager: &ExtensionManager, report: &mut LoadReport, name: &str, reason: LoadError) {
    if reason.is_security_violation() {
        tracing::error!(extension = name, reason = %reason, "Extension refused");
    } else {
        tracing::warn!(extension = name, reason = %reason, "Extension rejected");
    }
    audit::record(
        manager.audit().as_ref(),
        audit::extension_rejected(name, &reason),
    );
    report.skipped.push((name.to_string(), reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, MemoryAuditSink};
    use crate::context::HookContext;
    use crate::extension::Extension;
    use crate::module::NativeModule;
    use crate::sandbox;
    use glint_ext_api::ExtensionInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: HostConfig,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let shared = dir.path().join("extensions");
        let runtime = dir.path().join("runtime");
        std::fs::create_dir_all(&shared).unwrap();
        std::fs::create_dir_all(&runtime).unwrap();
        Fixture {
            config: HostConfig::new(shared, runtime),
            _dir: dir,
        }
    }

    #[derive(Default)]
    struct Counter {
        loads: Arc<AtomicUsize>,
    }

    impl Extension for Counter {
        fn on_load(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_loads_native_units_in_order_and_runs_on_load() {
        let fx = fixture();
        let loads = Arc::new(AtomicUsize::new(0));

        let mut catalog = ModuleCatalog::new();
        let (a, b) = (loads.clone(), loads.clone());
        catalog
            .register("second", move || {
                let loads = a.clone();
                Ok(NativeModule::new("1.1").extension(ExtensionInfo::new("beta", "1.0.0"), move || {
                    Ok(Counter { loads })
                }))
            })
            .register("first", move || {
                let loads = b.clone();
                Ok(NativeModule::new("1.1").extension(ExtensionInfo::new("alpha", "1.0.0"), move || {
                    Ok(Counter { loads })
                }))
            });

        let mut manager = ExtensionManager::new(fx.config.clone());
        let report = ExtensionLoader::new().with_catalog(catalog).load_all(&mut manager);

        assert!(report.is_clean());
        assert_eq!(report.loaded, ["beta", "alpha"]);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert!(fx.config.extensions_dir.join("beta").is_dir());
    }

    #[test]
    fn test_version_mismatch_skips_unit() {
        let fx = fixture();
        let mut catalog = ModuleCatalog::new();
        catalog
            .register("old", || {
                Ok(NativeModule::new("1.0").extension(ExtensionInfo::new("old", "1.0.0"), || {
                    Ok(Counter::default())
                }))
            })
            .register("bare", || {
                Ok(NativeModule::unversioned().extension(ExtensionInfo::new("bare", "1.0.0"), || {
                    Ok(Counter::default())
                }))
            });

        let sink = Arc::new(MemoryAuditSink::new());
        let mut manager = ExtensionManager::new(fx.config.clone()).with_audit(sink.clone());
        let report = ExtensionLoader::new().with_catalog(catalog).load_all(&mut manager);

        assert!(report.loaded.is_empty());
        assert!(matches!(
            report.reason("old"),
            Some(LoadError::IncompatibleApiVersion { found, .. }) if found == "1.0"
        ));
        assert!(matches!(
            report.reason("bare"),
            Some(LoadError::MissingApiVersion { .. })
        ));
        assert_eq!(sink.find_by_type(AuditEventType::UnitSkipped).len(), 2);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_underscore_units_are_ignored() {
        let fx = fixture();
        let mut catalog = ModuleCatalog::new();
        catalog.register("_helpers", || -> anyhow::Result<NativeModule> {
            panic!("must not run")
        });

        let mut manager = ExtensionManager::new(fx.config);
        let report = ExtensionLoader::new().with_catalog(catalog).load_all(&mut manager);

        assert!(report.loaded.is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn test_unit_code_is_sandboxed_to_unit_name() {
        let fx = fixture();
        let runtime = fx.config.runtime_dir.clone();
        std::fs::write(runtime.join("device.txt"), "x").unwrap();

        let mut catalog = ModuleCatalog::new();
        catalog.register("snoop", || {
            // Runtime root is readable, private root is writable
            sandbox::fs::read_to_string("runtime:/device.txt")?;
            sandbox::fs::write("self:/boot.txt", "ok")?;
            Ok(NativeModule::new("1.1"))
        });
        catalog.register("thief", || {
            let _ = sandbox::fs::write("runtime:/device.txt", "pwned");
            Ok(NativeModule::new("1.1"))
        });

        let sink = Arc::new(MemoryAuditSink::new());
        let mut manager = ExtensionManager::new(fx.config.clone()).with_audit(sink.clone());
        let report = ExtensionLoader::new().with_catalog(catalog).load_all(&mut manager);

        assert!(report.reason("snoop").is_none());
        assert!(fx.config.extensions_dir.join("snoop/boot.txt").is_file());

        // Swallowed, but still refused
        assert!(report.reason("thief").unwrap().is_security_violation());
        assert_eq!(std::fs::read_to_string(runtime.join("device.txt")).unwrap(), "x");
    }

    #[test]
    fn test_factory_failures_are_rejected() {
        let fx = fixture();
        let mut catalog = ModuleCatalog::new();
        catalog.register("mixed", || {
            Ok(NativeModule::new("1.1")
                .extension(ExtensionInfo::new("broken", "1.0.0"), || -> anyhow::Result<Counter> {
                    anyhow::bail!("missing token")
                })
                .extension(ExtensionInfo::new("panicky", "1.0.0"), || -> anyhow::Result<Counter> {
                    panic!("boom")
                })
                .extension(ExtensionInfo::new("fine", "1.0.0"), || Ok(Counter::default())))
        });

        let sink = Arc::new(MemoryAuditSink::new());
        let mut manager = ExtensionManager::new(fx.config).with_audit(sink.clone());
        let report = ExtensionLoader::new().with_catalog(catalog).load_all(&mut manager);

        assert_eq!(report.loaded, ["fine"]);
        assert!(matches!(
            report.reason("broken"),
            Some(LoadError::Instantiate { reason, .. }) if reason.contains("missing token")
        ));
        assert!(matches!(
            report.reason("panicky"),
            Some(LoadError::Instantiate { reason, .. }) if reason.contains("boom")
        ));
        assert_eq!(sink.find_by_type(AuditEventType::ExtensionRejected).len(), 2);
    }

    #[test]
    fn test_factory_runs_in_extension_scope() {
        let fx = fixture();
        let mut catalog = ModuleCatalog::new();
        catalog.register("unit", || {
            Ok(NativeModule::new("1.1").extension(ExtensionInfo::new("Weather Pro", "1.0.0"), || {
                sandbox::fs::write("self:/created.txt", "hi")?;
                Ok(Counter::default())
            }))
        });

        let mut manager = ExtensionManager::new(fx.config.clone());
        let report = ExtensionLoader::new().with_catalog(catalog).load_all(&mut manager);

        assert_eq!(report.loaded, ["Weather Pro"]);
        assert!(fx
            .config
            .extensions_dir
            .join("Weather_Pro/created.txt")
            .is_file());
    }

    #[test]
    fn test_folder_collision_rejected() {
        let fx = fixture();
        let mut catalog = ModuleCatalog::new();
        catalog.register("pair", || {
            Ok(NativeModule::new("1.1")
                .extension(ExtensionInfo::new("My Ext", "1.0.0"), || Ok(Counter::default()))
                .extension(ExtensionInfo::new("My/Ext", "1.0.0"), || Ok(Counter::default())))
        });

        let mut manager = ExtensionManager::new(fx.config);
        let report = ExtensionLoader::new().with_catalog(catalog).load_all(&mut manager);

        assert_eq!(report.loaded, ["My Ext"]);
        assert!(matches!(
            report.reason("My/Ext"),
            Some(LoadError::Collision { existing, .. }) if existing == "My Ext"
        ));
    }

    #[test]
    fn test_missing_extensions_dir_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig::new(dir.path().join("nope"), dir.path().join("runtime"));
        let mut manager = ExtensionManager::new(config.clone());

        let report = ExtensionLoader::new()
            .with_wasm(&config)
            .unwrap()
            .load_all(&mut manager);

        assert!(report.loaded.is_empty());
        assert!(report.is_clean());
    }
}
