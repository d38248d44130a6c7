//! glint-ext-host: sandboxed extension runtime for the glint status host
//!
//! Extensions are untrusted. Each one gets a private folder, read-only views
//! of the runtime folder and the shared extensions folder, and nothing else:
//!
//! ```text
//! ┌───────────────── ExtensionManager ─────────────────┐
//! │  on_load · on_snapshot · on_render · on_tick · ... │
//! │                        │                           │
//! │            SandboxScope(CapabilityFs)              │
//! │                        │                           │
//! │   native Extension ────┼──── WasmExtension         │
//! │   sandbox::fs::*       │     glint.host_call       │
//! └────────────────────────┼───────────────────────────┘
//!                          ▼
//!      PathResolver ─► self:/  runtime:/  extensions:/
//! ```
//!
//! A security violation disables the extension on the spot; other failures
//! are counted and disable it at the configured threshold.

pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod extension;
pub mod fs;
pub mod loader;
pub mod manager;
pub mod module;
pub mod render;
pub mod sandbox;
pub mod slot;
pub mod storage;
pub mod telemetry;
pub mod wasm;

pub use audit::{AuditEvent, AuditEventType, AuditSink, JsonlAuditSink, MemoryAuditSink, NullAuditSink};
pub use config::{ConfigError, HostConfig};
pub use context::{Clock, ExtensionLogger, HookContext, UpdateRequester};
pub use error::{HookFailure, LoadError, SecurityViolation, StatusUnavailable};
pub use extension::Extension;
pub use fs::{CapabilityFs, FsError, OpenMode, PathResolver, RootKind};
pub use loader::{ExtensionLoader, LoadReport, UnitSource};
pub use manager::ExtensionManager;
pub use module::{ExtensionModule, ModuleCatalog, NativeModule, Registrar};
pub use render::{RenderContext, StatusContext};
pub use sandbox::SandboxScope;
pub use slot::{DisableReason, ExtensionSlot, SlotState};
pub use storage::Storage;
pub use wasm::{WasmError, WasmUnitSource};

pub use async_trait::async_trait;
pub use glint_ext_api::{DefaultStatus, ExtensionInfo, HookKind};
