//! WebAssembly extension units
//!
//! A `.wasm` file in the extensions directory is one unit. The guest talks
//! to the host through a single import and a handful of exports:
//!
//! ```text
//!  host                                   guest
//!  ────                                   ─────
//!  ext_manifest() ──────────────────────► UnitManifest (msgpack)
//!  ext_create(name) ────────────────────► HookReply
//!  ext_hook(HookCall) ──────────────────► HookReply
//!          ◄──────────── glint.host_call(HostCall) ── HostReply
//! ```
//!
//! There is no WASI: every filesystem request goes through `host_call` and
//! is checked against the sandbox scope the host is running the call in.
//! A violation traps the guest; the error surfaces as
//! [`WasmError::Security`].

mod engine;
mod host_call;
mod unit;

pub use unit::WasmUnitSource;

use crate::error::SecurityViolation;
use thiserror::Error;

/// Errors that can occur while loading or calling a wasm unit
#[derive(Debug, Error)]
pub enum WasmError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("Linking host functions failed: {0}")]
    Link(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("Export not found: {0}")]
    ExportNotFound(&'static str),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("Deserialization failed: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,

    #[error("{0}")]
    Security(SecurityViolation),
}

impl WasmError {
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::Security(_))
    }
}
