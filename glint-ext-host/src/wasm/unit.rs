//! Wasm units as [`ExtensionModule`]s

use super::engine::{WasmEngine, WasmInstance};
use super::host_call::CallState;
use super::WasmError;
use crate::config::HostConfig;
use crate::context::HookContext;
use crate::extension::Extension;
use crate::loader::UnitSource;
use crate::module::{ExtensionModule, Registrar};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use glint_ext_api::{HookCall, HookKind, HookReply, UnitManifest};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

type SharedInstance = Arc<Mutex<WasmInstance>>;

/// Loads `*.wasm` files from the extensions directory
pub struct WasmUnitSource {
    engine: WasmEngine,
}

impl WasmUnitSource {
    /// Create a source whose calls are each limited to `fuel`
    pub fn new(fuel: u64) -> Result<Self, WasmError> {
        Ok(Self {
            engine: WasmEngine::new(fuel)?,
        })
    }

    pub fn from_config(config: &HostConfig) -> Result<Self, WasmError> {
        Self::new(config.wasm_fuel)
    }
}

impl UnitSource for WasmUnitSource {
    fn kind(&self) -> &'static str {
        "wasm"
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "wasm")
    }

    fn load(&self, path: &Path) -> anyhow::Result<Box<dyn ExtensionModule>> {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let digest = blake3::hash(&bytes).to_hex().to_string();

        let mut instance = self.engine.instantiate(&bytes)?;
        let manifest = instance.manifest()?;

        tracing::debug!(
            path = %path.display(),
            digest = %digest,
            extensions = manifest.extensions.len(),
            "Wasm unit instantiated"
        );

        Ok(Box::new(WasmModule {
            manifest,
            instance: Arc::new(Mutex::new(instance)),
        }))
    }
}

struct WasmModule {
    manifest: UnitManifest,
    instance: SharedInstance,
}

impl ExtensionModule for WasmModule {
    fn api_version(&self) -> Option<&str> {
        self.manifest.api_version.as_deref()
    }

    fn register(self: Box<Self>, registrar: &mut Registrar) -> anyhow::Result<()> {
        for info in self.manifest.extensions {
            let instance = Arc::clone(&self.instance);
            let name = info.name.clone();
            registrar.register(info, move || WasmExtension::create(instance, name));
        }
        Ok(())
    }
}

/// One extension living inside a wasm unit
struct WasmExtension {
    name: String,
    instance: SharedInstance,
}

impl WasmExtension {
    fn create(instance: SharedInstance, name: String) -> anyhow::Result<Box<dyn Extension>> {
        let reply = lock(&instance).create(&name)?;
        if let Some(message) = reply.error {
            return Err(anyhow!(message));
        }
        Ok(Box::new(Self { name, instance }))
    }

    fn invoke(
        &mut self,
        ctx: &mut HookContext<'_>,
        hook: HookKind,
        namespace: Option<Value>,
    ) -> anyhow::Result<HookReply> {
        let mode = ctx
            .status()
            .is_bound()
            .then(|| ctx.status().mode().to_string());
        let call = HookCall {
            extension: self.name.clone(),
            hook,
            namespace,
            mode,
        };

        let mut instance = lock(&self.instance);
        instance.begin_call(CallState::capture(ctx));
        let result = instance.hook(&call);
        if let Some(state) = instance.end_call() {
            state.restore(ctx);
        }

        let reply = result?;
        match reply.error {
            Some(message) => Err(anyhow!(message)),
            None => Ok(reply),
        }
    }
}

#[async_trait]
impl Extension for WasmExtension {
    fn on_load(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.invoke(ctx, HookKind::Load, None).map(drop)
    }

    fn on_snapshot(
        &mut self,
        namespace: &mut Map<String, Value>,
        ctx: &mut HookContext<'_>,
    ) -> anyhow::Result<()> {
        let current = Value::Object(namespace.clone());
        let reply = self.invoke(ctx, HookKind::Snapshot, Some(current))?;
        if let Some(Value::Object(updated)) = reply.namespace {
            *namespace = updated;
        }
        Ok(())
    }

    fn on_render(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.invoke(ctx, HookKind::Render, None).map(drop)
    }

    async fn on_tick(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.invoke(ctx, HookKind::Tick, None).map(drop)
    }

    fn on_shutdown(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.invoke(ctx, HookKind::Shutdown, None).map(drop)
    }
}

/// Poisoning is ignored: a trapped call leaves the store usable
fn lock(instance: &SharedInstance) -> std::sync::MutexGuard<'_, WasmInstance> {
    instance.lock().unwrap_or_else(PoisonError::into_inner)
}
