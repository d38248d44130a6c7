//! glint-ext-sdk: write glint extensions as WebAssembly units
//!
//! A unit declares its extensions in a manifest and builds them on request.
//! Everything an extension can reach goes through [`Host`], which forwards
//! to the `glint.host_call` import; the host checks every path against the
//! extension's sandbox.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use glint_ext_sdk::prelude::*;
//!
//! struct Clock;
//!
//! impl Extension for Clock {
//!     fn on_render(&mut self, host: &Host, _mode: &str) -> Result<(), String> {
//!         let now = host.now().map_err(|e| e.to_string())?;
//!         host.add_line(format!("{now:.0}")).map_err(|e| e.to_string())
//!     }
//! }
//!
//! struct Unit;
//!
//! impl ExtensionUnit for Unit {
//!     fn manifest() -> UnitManifest {
//!         UnitManifest::new(DEFAULT_API_VERSION).extension(ExtensionInfo::new("clock", "0.1.0"))
//!     }
//!
//!     fn create(name: &str) -> Result<Box<dyn Extension>, String> {
//!         match name {
//!             "clock" => Ok(Box::new(Clock)),
//!             other => Err(format!("unknown extension {other}")),
//!         }
//!     }
//! }
//!
//! export_unit!(Unit);
//! ```

use serde_json::{Map, Value};
use std::fmt;

pub use glint_ext_api::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{export_unit, memory, Extension, ExtensionUnit, Host, HostError};
    pub use glint_ext_api::{
        ExtensionInfo, HookKind, HostCall, LogLevel, UnitManifest, DEFAULT_API_VERSION,
    };
    pub use serde_json::{json, Map, Value};
}

/// A wasm unit: the set of extensions one module provides
pub trait ExtensionUnit {
    /// Declared API version and extensions
    fn manifest() -> UnitManifest;

    /// Build the extension declared as `name`
    fn create(name: &str) -> Result<Box<dyn Extension>, String>;
}

/// Guest side of the extension lifecycle
///
/// Every hook defaults to a no-op. Returning `Err` counts as a failure; a
/// sandbox violation traps the module and disables the extension at once.
pub trait Extension {
    fn on_load(&mut self, _host: &Host) -> Result<(), String> {
        Ok(())
    }

    /// `namespace` is this extension's part of the snapshot
    fn on_snapshot(&mut self, _namespace: &mut Map<String, Value>, _host: &Host) -> Result<(), String> {
        Ok(())
    }

    fn on_render(&mut self, _host: &Host, _mode: &str) -> Result<(), String> {
        Ok(())
    }

    fn on_tick(&mut self, _host: &Host) -> Result<(), String> {
        Ok(())
    }

    fn on_shutdown(&mut self, _host: &Host) -> Result<(), String> {
        Ok(())
    }
}

// ============================================================================
// Host calls
// ============================================================================

/// A failed host call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The host answered with an error
    Host(String),
    /// The reply could not be decoded
    Decode(String),
    /// No host answered (not running inside glint)
    Unavailable,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Host(message) => write!(f, "host error: {message}"),
            HostError::Decode(message) => write!(f, "invalid host reply: {message}"),
            HostError::Unavailable => f.write_str("host is unavailable"),
        }
    }
}

impl std::error::Error for HostError {}

#[cfg(target_arch = "wasm32")]
#[link(wasm_import_module = "glint")]
extern "C" {
    #[link_name = "host_call"]
    fn glint_host_call(ptr: i32, len: i32) -> i64;
}

/// Outside wasm there is no host; every call reports [`HostError::Unavailable`]
#[cfg(not(target_arch = "wasm32"))]
unsafe fn glint_host_call(_ptr: i32, _len: i32) -> i64 {
    0
}

/// Handle to the host for the current call
#[derive(Debug, Clone, Copy, Default)]
pub struct Host;

impl Host {
    /// Send a raw request
    pub fn call(&self, request: &HostCall) -> Result<Value, HostError> {
        let bytes = rmp_serde::to_vec(request).map_err(|e| HostError::Decode(e.to_string()))?;
        let packed = unsafe { glint_host_call(bytes.as_ptr() as i32, bytes.len() as i32) };
        let (ptr, len) = abi::unpack_ptr_len(packed);
        if len <= 0 {
            return Err(HostError::Unavailable);
        }

        let reply: Option<HostReply> = unsafe { memory::deserialize_from_ptr(ptr, len) };
        memory::ext_dealloc(ptr, len);
        match reply {
            Some(reply) => reply.into_result().map_err(HostError::Host),
            None => Err(HostError::Decode("not a host reply".to_string())),
        }
    }

    fn unit(&self, request: HostCall) -> Result<(), HostError> {
        self.call(&request).map(drop)
    }

    fn typed<T: serde::de::DeserializeOwned>(&self, request: HostCall) -> Result<T, HostError> {
        let value = self.call(&request)?;
        serde_json::from_value(value).map_err(|e| HostError::Decode(e.to_string()))
    }

    // Logging

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        // Logging is best effort
        let _ = self.unit(HostCall::Log {
            level,
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    // Files; paths accept `self:/`, `runtime:/`, `extensions:/`, relative and absolute forms

    pub fn read_text(&self, path: impl Into<String>) -> Result<String, HostError> {
        self.typed(HostCall::ReadText { path: path.into() })
    }

    pub fn read_bytes(&self, path: impl Into<String>) -> Result<Vec<u8>, HostError> {
        self.typed(HostCall::ReadBytes { path: path.into() })
    }

    pub fn write_text(&self, path: impl Into<String>, data: impl Into<String>) -> Result<(), HostError> {
        self.unit(HostCall::WriteText {
            path: path.into(),
            data: data.into(),
        })
    }

    pub fn write_bytes(&self, path: impl Into<String>, data: Vec<u8>) -> Result<(), HostError> {
        self.unit(HostCall::WriteBytes {
            path: path.into(),
            data,
        })
    }

    pub fn list_dir(&self, path: impl Into<String>) -> Result<Vec<String>, HostError> {
        self.typed(HostCall::ListDir { path: path.into() })
    }

    pub fn exists(&self, path: impl Into<String>) -> Result<bool, HostError> {
        self.typed(HostCall::Exists { path: path.into() })
    }

    pub fn stat(&self, path: impl Into<String>) -> Result<FileStat, HostError> {
        self.typed(HostCall::Stat { path: path.into() })
    }

    // Storage

    pub fn storage_get(&self, key: impl Into<String>) -> Result<Value, HostError> {
        self.call(&HostCall::StorageGet { key: key.into() })
    }

    pub fn storage_set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), HostError> {
        self.unit(HostCall::StorageSet {
            key: key.into(),
            value: value.into(),
        })
    }

    // Status message; only valid inside `on_render`

    pub fn clear_status(&self) -> Result<(), HostError> {
        self.unit(HostCall::StatusClear)
    }

    pub fn add_line(&self, text: impl Into<String>) -> Result<(), HostError> {
        self.unit(HostCall::StatusAddLine { text: text.into() })
    }

    pub fn extend_status(&self, lines: Vec<String>) -> Result<(), HostError> {
        self.unit(HostCall::StatusExtend { lines })
    }

    pub fn replace_section(&self, title: impl Into<String>, lines: Vec<String>) -> Result<(), HostError> {
        self.unit(HostCall::StatusReplaceSection {
            title: title.into(),
            lines,
        })
    }

    pub fn status_lines(&self) -> Result<Vec<String>, HostError> {
        self.typed(HostCall::StatusLines)
    }

    pub fn default_status(&self) -> Result<Option<DefaultStatus>, HostError> {
        self.typed(HostCall::DefaultStatus)
    }

    // Context

    pub fn config(&self) -> Result<Map<String, Value>, HostError> {
        self.typed(HostCall::Config)
    }

    pub fn snapshot(&self) -> Result<Value, HostError> {
        self.call(&HostCall::Snapshot)
    }

    pub fn platform(&self) -> Result<String, HostError> {
        self.typed(HostCall::Platform)
    }

    pub fn request_update(&self) -> Result<(), HostError> {
        self.unit(HostCall::RequestUpdate)
    }

    /// Seconds since the Unix epoch
    pub fn now(&self) -> Result<f64, HostError> {
        self.typed(HostCall::Now)
    }
}

// ============================================================================
// Guest runtime
// ============================================================================

/// Plumbing behind [`export_unit!`]
#[doc(hidden)]
pub mod runtime {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    thread_local! {
        static INSTANCES: RefCell<BTreeMap<String, Box<dyn Extension>>> =
            RefCell::new(BTreeMap::new());
    }

    pub fn manifest<U: ExtensionUnit>() -> i64 {
        memory::serialize_and_return(&U::manifest())
    }

    pub fn create<U: ExtensionUnit>(ptr: i32, len: i32) -> i64 {
        let Some(name) = (unsafe { memory::deserialize_from_ptr::<String>(ptr, len) }) else {
            return memory::serialize_and_return(&HookReply::error("invalid create request"));
        };

        match U::create(&name) {
            Ok(extension) => {
                INSTANCES.with(|instances| instances.borrow_mut().insert(name, extension));
                0
            }
            Err(message) => memory::serialize_and_return(&HookReply::error(message)),
        }
    }

    pub fn hook(ptr: i32, len: i32) -> i64 {
        let Some(call) = (unsafe { memory::deserialize_from_ptr::<HookCall>(ptr, len) }) else {
            return memory::serialize_and_return(&HookReply::error("invalid hook request"));
        };

        let reply = INSTANCES.with(|instances| {
            let mut instances = instances.borrow_mut();
            match instances.get_mut(&call.extension) {
                Some(extension) => dispatch(extension.as_mut(), call),
                None => HookReply::error(format!("unknown extension '{}'", call.extension)),
            }
        });

        if reply.error.is_none() && reply.namespace.is_none() {
            return 0;
        }
        memory::serialize_and_return(&reply)
    }

    fn dispatch(extension: &mut dyn Extension, call: HookCall) -> HookReply {
        let host = Host;
        let result = match call.hook {
            HookKind::Load => extension.on_load(&host),
            HookKind::Snapshot => {
                let mut namespace = match call.namespace {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                return match extension.on_snapshot(&mut namespace, &host) {
                    Ok(()) => HookReply::with_namespace(Value::Object(namespace)),
                    Err(message) => HookReply::error(message),
                };
            }
            HookKind::Render => {
                let mode = call.mode.as_deref().unwrap_or("status");
                extension.on_render(&host, mode)
            }
            HookKind::Tick => extension.on_tick(&host),
            HookKind::Shutdown => extension.on_shutdown(&host),
        };

        match result {
            Ok(()) => HookReply::ok(),
            Err(message) => HookReply::error(message),
        }
    }
}

/// Memory utilities for the guest side of the ABI
pub mod memory {
    use std::alloc::{alloc, dealloc, Layout};

    /// Allocate `size` bytes in linear memory; 0 on failure
    #[inline]
    pub fn ext_alloc(size: i32) -> i32 {
        if size <= 0 {
            return 0;
        }
        match Layout::from_size_align(size as usize, 1) {
            Ok(layout) => unsafe { alloc(layout) as i32 },
            Err(_) => 0,
        }
    }

    /// Free memory obtained from [`ext_alloc`]
    #[inline]
    pub fn ext_dealloc(ptr: i32, size: i32) {
        if ptr == 0 || size <= 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(size as usize, 1) {
            unsafe { dealloc(ptr as *mut u8, layout) }
        }
    }

    pub use glint_ext_api::abi::pack_ptr_len;

    /// Serialize data into a fresh buffer, returning it packed
    pub fn serialize_and_return<T: serde::Serialize>(data: &T) -> i64 {
        let bytes = rmp_serde::to_vec(data).unwrap_or_default();
        let len = bytes.len() as i32;
        let ptr = ext_alloc(len);

        if ptr == 0 {
            return 0;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, len as usize);
        }
        pack_ptr_len(ptr, len)
    }

    /// Deserialize data from a raw pointer and length
    ///
    /// # Safety
    /// The pointer must be valid for `len` bytes.
    pub unsafe fn deserialize_from_ptr<T: serde::de::DeserializeOwned>(
        ptr: i32,
        len: i32,
    ) -> Option<T> {
        if ptr == 0 || len <= 0 {
            return None;
        }
        let slice = std::slice::from_raw_parts(ptr as *const u8, len as usize);
        rmp_serde::from_slice(slice).ok()
    }
}

/// Export the functions the host expects from a unit
///
/// Generates `ext_manifest`, `ext_create`, `ext_hook`, `ext_alloc` and
/// `ext_dealloc`.
#[macro_export]
macro_rules! export_unit {
    ($unit:ty) => {
        #[no_mangle]
        pub extern "C" fn ext_manifest() -> i64 {
            $crate::runtime::manifest::<$unit>()
        }

        #[no_mangle]
        pub extern "C" fn ext_create(ptr: i32, len: i32) -> i64 {
            $crate::runtime::create::<$unit>(ptr, len)
        }

        #[no_mangle]
        pub extern "C" fn ext_hook(ptr: i32, len: i32) -> i64 {
            $crate::runtime::hook(ptr, len)
        }

        #[no_mangle]
        pub extern "C" fn ext_alloc(size: i32) -> i32 {
            $crate::memory::ext_alloc(size)
        }

        #[no_mangle]
        pub extern "C" fn ext_dealloc(ptr: i32, size: i32) {
            $crate::memory::ext_dealloc(ptr, size)
        }
    };
}
