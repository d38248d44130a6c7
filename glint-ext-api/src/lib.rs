//! glint-ext-api: Shared types for the glint extension system
//!
//! This crate defines the protocol between the host runtime and guest
//! (WebAssembly) extensions. Communication uses MessagePack serialization.
//!
//! # Call flow
//!
//! ```text
//! host                                   guest (wasm unit)
//! ────                                   ─────────────────
//! ext_manifest()            ───────►     UnitManifest
//! ext_create(name)          ───────►     HookReply
//! ext_hook(HookCall)        ───────►     HookReply
//!        ▲                                   │
//!        └──── glint.host_call(HostCall) ◄───┘  (fs, storage, status, ...)
//!                    HostReply ───────►
//! ```
//!
//! Every buffer crossing the boundary is returned as a packed `i64`
//! (`ptr << 32 | len`), see [`abi`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

mod status;

pub use status::{ActiveApp, DefaultStatus, Favorite, Presence};

/// API version a host requires unless configured otherwise
pub const DEFAULT_API_VERSION: &str = "1.1";

/// Names shared by the host linker and the guest exports
pub mod abi {
    /// Import module providing host functions
    pub const HOST_MODULE: &str = "glint";
    /// The single host function: `host_call(ptr, len) -> packed`
    pub const HOST_CALL: &str = "host_call";

    pub const EXPORT_MEMORY: &str = "memory";
    pub const EXPORT_ALLOC: &str = "ext_alloc";
    pub const EXPORT_DEALLOC: &str = "ext_dealloc";
    pub const EXPORT_MANIFEST: &str = "ext_manifest";
    pub const EXPORT_CREATE: &str = "ext_create";
    pub const EXPORT_HOOK: &str = "ext_hook";

    /// Pack a pointer and length into a single i64 value
    ///
    /// wasm32-unknown-unknown doesn't support multi-value returns, so every
    /// buffer is returned this way.
    #[inline]
    pub fn pack_ptr_len(ptr: i32, len: i32) -> i64 {
        ((ptr as i64) << 32) | (len as i64 & 0xFFFF_FFFF)
    }

    /// Unpack ptr and len from a packed i64
    #[inline]
    pub fn unpack_ptr_len(packed: i64) -> (i32, i32) {
        let ptr = (packed >> 32) as i32;
        let len = (packed & 0xFFFF_FFFF) as i32;
        (ptr, len)
    }
}

/// Identity of one extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    /// Declared name, also the base of the private folder name
    pub name: String,

    /// Extension version (semver)
    pub version: String,

    /// Extension author
    #[serde(default)]
    pub author: Option<String>,

    /// Short description
    #[serde(default)]
    pub description: Option<String>,
}

impl ExtensionInfo {
    /// Create a new extension info
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            author: None,
            description: None,
        }
    }

    /// Add author
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Add description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Manifest returned by a unit's `ext_manifest()` export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitManifest {
    /// Declared API version; `None` means the unit did not declare one
    #[serde(default)]
    pub api_version: Option<String>,

    /// Extensions this unit provides
    #[serde(default)]
    pub extensions: Vec<ExtensionInfo>,
}

impl UnitManifest {
    pub fn new(api_version: impl Into<String>) -> Self {
        Self {
            api_version: Some(api_version.into()),
            extensions: Vec::new(),
        }
    }

    /// Add an extension
    pub fn extension(mut self, info: ExtensionInfo) -> Self {
        self.extensions.push(info);
        self
    }
}

/// Lifecycle hook kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    Load,
    Snapshot,
    Render,
    Tick,
    Shutdown,
}

impl HookKind {
    /// Hook method name as used in logs and audit records
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Load => "on_load",
            HookKind::Snapshot => "on_snapshot",
            HookKind::Render => "on_render",
            HookKind::Tick => "on_tick",
            HookKind::Shutdown => "on_shutdown",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Argument of the guest's `ext_hook` export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookCall {
    /// Target extension within the unit
    pub extension: String,

    /// Which hook to run
    pub hook: HookKind,

    /// The extension's snapshot namespace (only for `on_snapshot`)
    #[serde(default)]
    pub namespace: Option<Value>,

    /// Render mode (only for `on_render`)
    #[serde(default)]
    pub mode: Option<String>,
}

/// Result of `ext_create` / `ext_hook`
///
/// A zero-length reply is read as success with no data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookReply {
    /// Failure message, `None` on success
    #[serde(default)]
    pub error: Option<String>,

    /// Updated snapshot namespace (only for `on_snapshot`)
    #[serde(default)]
    pub namespace: Option<Value>,
}

impl HookReply {
    /// Successful reply
    pub fn ok() -> Self {
        Self::default()
    }

    /// Failed reply
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            namespace: None,
        }
    }

    /// Successful reply carrying an updated namespace
    pub fn with_namespace(namespace: Value) -> Self {
        Self {
            error: None,
            namespace: Some(namespace),
        }
    }
}

/// Log level for [`HostCall::Log`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Request sent from guest to host through `glint.host_call`
///
/// Paths accept the same forms as the host's capability filesystem
/// (`self:/`, `runtime:/`, `extensions:/`, relative, absolute).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HostCall {
    Log { level: LogLevel, message: String },
    ReadText { path: String },
    ReadBytes { path: String },
    WriteText { path: String, data: String },
    WriteBytes { path: String, data: Vec<u8> },
    ListDir { path: String },
    Exists { path: String },
    Stat { path: String },
    StorageGet { key: String },
    StorageSet { key: String, value: Value },
    StatusClear,
    StatusAddLine { text: String },
    StatusExtend { lines: Vec<String> },
    StatusReplaceSection { title: String, lines: Vec<String> },
    StatusLines,
    DefaultStatus,
    Config,
    Snapshot,
    Platform,
    RequestUpdate,
    Now,
}

/// Host answer to a [`HostCall`]
///
/// Security violations never produce a reply: the host traps the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HostReply {
    Ok(Value),
    Err(String),
}

impl HostReply {
    pub fn into_result(self) -> Result<Value, String> {
        match self {
            HostReply::Ok(value) => Ok(value),
            HostReply::Err(message) => Err(message),
        }
    }
}

/// File metadata returned by [`HostCall::Stat`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub is_file: bool,
    pub is_dir: bool,
    pub len: u64,
    pub readonly: bool,
    /// Modification time, seconds since the Unix epoch
    #[serde(default)]
    pub modified: Option<i64>,
}

/// Encode a protocol value as MessagePack
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(value)
}

/// Decode a protocol value from MessagePack
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let packed = abi::pack_ptr_len(0x1234_5678, 0x100);
        assert_eq!(abi::unpack_ptr_len(packed), (0x1234_5678, 0x100));
        assert_eq!(abi::unpack_ptr_len(0), (0, 0));
    }

    #[test]
    fn test_manifest_without_version() {
        let manifest = UnitManifest {
            api_version: None,
            extensions: vec![ExtensionInfo::new("clock", "1.0.0")],
        };
        let bytes = encode(&manifest).unwrap();
        let decoded: UnitManifest = decode(&bytes).unwrap();

        assert!(decoded.api_version.is_none());
        assert_eq!(decoded.extensions[0].name, "clock");
    }

    #[test]
    fn test_hook_reply_carries_namespace() {
        let reply = HookReply::with_namespace(serde_json::json!({"ticks": 3}));
        let decoded: HookReply = decode(&encode(&reply).unwrap()).unwrap();

        assert!(decoded.error.is_none());
        assert_eq!(decoded.namespace, Some(serde_json::json!({"ticks": 3})));
    }

    #[test]
    fn test_hook_names() {
        assert_eq!(HookKind::Render.as_str(), "on_render");
        assert_eq!(HookKind::Tick.to_string(), "on_tick");
    }

    #[test]
    fn test_extension_info_builder() {
        let info = ExtensionInfo::new("weather", "0.2.0")
            .author("someone")
            .description("Adds a weather line");
        assert_eq!(info.author.as_deref(), Some("someone"));
        assert_eq!(info.description.as_deref(), Some("Adds a weather line"));
    }
}
