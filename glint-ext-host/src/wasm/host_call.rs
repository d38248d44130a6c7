//! The `glint.host_call` import

use super::engine::read_memory;
use super::WasmError;
use crate::context::{Clock, ExtensionLogger, HookContext, UpdateRequester};
use crate::error::{SecurityViolation, StatusUnavailable};
use crate::fs::{FsError, FsResult};
use crate::render::{RenderContext, StatusContext};
use crate::sandbox;
use crate::storage::Storage;
use anyhow::anyhow;
use glint_ext_api::{abi, FileStat, HostCall, HostReply};
use serde_json::{json, Value};
use std::fs::Metadata;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use wasmtime::{Caller, Extern, Linker, Memory};

/// Store data for a wasm unit
#[derive(Default)]
pub(crate) struct HostState {
    /// Set only while a hook is running
    pub(crate) call: Option<CallState>,
}

/// What a guest may reach during one hook call
///
/// Copied out of the [`HookContext`] before the call and handed back after,
/// since the store cannot hold borrowed data.
pub(crate) struct CallState {
    logger: ExtensionLogger,
    config: Value,
    snapshot: Value,
    platform: String,
    storage_path: PathBuf,
    storage: Option<Storage>,
    render: Option<RenderContext>,
    mode: String,
    updates: UpdateRequester,
}

impl CallState {
    pub(crate) fn capture(ctx: &mut HookContext<'_>) -> Self {
        let render = ctx.status().take_render();
        let mode = ctx.status().mode().to_string();
        Self {
            logger: ctx.logger().clone(),
            config: Value::Object(ctx.config().clone()),
            snapshot: ctx.snapshot().clone(),
            platform: ctx.platform().to_string(),
            storage_path: ctx.storage_path().to_path_buf(),
            storage: None,
            render,
            mode,
            updates: ctx.updates().clone(),
        }
    }

    /// Return the render target to the context it came from
    pub(crate) fn restore(self, ctx: &mut HookContext<'_>) {
        if let Some(render) = self.render {
            ctx.status().restore_render(render);
        }
    }

    fn storage(&mut self) -> &mut Storage {
        let path = &self.storage_path;
        self.storage.get_or_insert_with(|| Storage::open(path))
    }

    fn status<T>(
        &mut self,
        f: impl FnOnce(&mut StatusContext<'_>) -> Result<T, StatusUnavailable>,
    ) -> Result<T, StatusUnavailable> {
        let mut status = match self.render.as_mut() {
            Some(render) => StatusContext::bound(render, &self.mode),
            None => StatusContext::unbound(),
        };
        f(&mut status)
    }
}

/// Register `glint.host_call` with the linker
pub(crate) fn link(linker: &mut Linker<HostState>) -> Result<(), WasmError> {
    linker
        .func_wrap(
            abi::HOST_MODULE,
            abi::HOST_CALL,
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i64> {
                let memory = guest_memory(&mut caller)?;
                let request = read_memory(&caller, &memory, ptr, len)?;
                let call: HostCall = glint_ext_api::decode(&request)?;

                // A violation becomes a trap and never reaches the guest
                let reply = dispatch(caller.data_mut(), call)?;

                let encoded = glint_ext_api::encode(&reply)?;
                write_reply(&mut caller, &memory, &encoded)
            },
        )
        .map_err(WasmError::Link)?;
    Ok(())
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> anyhow::Result<Memory> {
    caller
        .get_export(abi::EXPORT_MEMORY)
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow!("guest does not export '{}'", abi::EXPORT_MEMORY))
}

fn write_reply(
    caller: &mut Caller<'_, HostState>,
    memory: &Memory,
    bytes: &[u8],
) -> anyhow::Result<i64> {
    let alloc = caller
        .get_export(abi::EXPORT_ALLOC)
        .and_then(Extern::into_func)
        .ok_or_else(|| anyhow!("guest does not export '{}'", abi::EXPORT_ALLOC))?
        .typed::<i32, i32>(&*caller)?;

    let len = i32::try_from(bytes.len())?;
    let ptr = alloc.call(&mut *caller, len)?;
    memory.write(&mut *caller, ptr as usize, bytes)?;
    Ok(abi::pack_ptr_len(ptr, len))
}

/// Serve one guest request
///
/// Filesystem requests use the capability of whatever sandbox scope the
/// host is running the guest in, so the same code path serves load time
/// and hook calls.
fn dispatch(state: &mut HostState, call: HostCall) -> Result<HostReply, SecurityViolation> {
    match call {
        HostCall::Log { level, message } => {
            match &state.call {
                Some(call) => call.logger.log(level, &message),
                None => tracing::debug!(target: "glint::extension", "{message}"),
            }
            Ok(HostReply::Ok(Value::Null))
        }

        HostCall::ReadText { path } => {
            fs_reply(sandbox::current()?.read_text(&path).map(Value::String))
        }
        HostCall::ReadBytes { path } => {
            fs_reply(sandbox::current()?.read_bytes(&path).map(|bytes| json!(bytes)))
        }
        HostCall::WriteText { path, data } => {
            fs_reply(sandbox::current()?.write_text(&path, &data).map(|()| Value::Null))
        }
        HostCall::WriteBytes { path, data } => {
            fs_reply(sandbox::current()?.write_bytes(&path, &data).map(|()| Value::Null))
        }
        HostCall::ListDir { path } => {
            fs_reply(sandbox::current()?.list_dir(&path).map(|names| json!(names)))
        }
        HostCall::Exists { path } => fs_reply(sandbox::current()?.exists(&path).map(Value::Bool)),
        HostCall::Stat { path } => {
            fs_reply(sandbox::current()?.stat(&path).map(|meta| file_stat(&meta)))
        }

        other => Ok(match state.call.as_mut() {
            Some(call) => serve(call, other),
            None => HostReply::Err("only available while a hook is running".to_string()),
        }),
    }
}

/// Requests that need per-call state
fn serve(call: &mut CallState, request: HostCall) -> HostReply {
    let status = |result: Result<Value, StatusUnavailable>| match result {
        Ok(value) => HostReply::Ok(value),
        Err(e) => HostReply::Err(e.to_string()),
    };

    match request {
        HostCall::StorageGet { key } => {
            HostReply::Ok(call.storage().get(&key).cloned().unwrap_or(Value::Null))
        }
        HostCall::StorageSet { key, value } => {
            call.storage().set(key, value);
            HostReply::Ok(Value::Null)
        }

        HostCall::StatusClear => status(call.status(|s| s.clear().map(|()| Value::Null))),
        HostCall::StatusAddLine { text } => {
            status(call.status(|s| s.add_line(text).map(|()| Value::Null)))
        }
        HostCall::StatusExtend { lines } => {
            status(call.status(|s| s.extend(lines).map(|()| Value::Null)))
        }
        HostCall::StatusReplaceSection { title, lines } => status(
            call.status(|s| s.replace_section(&title, lines).map(|()| Value::Null)),
        ),
        HostCall::StatusLines => status(call.status(|s| s.lines().map(|lines| json!(lines)))),
        HostCall::DefaultStatus => status(call.status(|s| {
            s.default_status().map(|default| {
                default
                    .and_then(|d| serde_json::to_value(d).ok())
                    .unwrap_or(Value::Null)
            })
        })),

        HostCall::Config => HostReply::Ok(call.config.clone()),
        HostCall::Snapshot => HostReply::Ok(call.snapshot.clone()),
        HostCall::Platform => HostReply::Ok(Value::String(call.platform.clone())),
        HostCall::RequestUpdate => {
            call.updates.request();
            HostReply::Ok(Value::Null)
        }
        HostCall::Now => HostReply::Ok(json!(Clock.timestamp())),

        // Filesystem and logging requests never get here
        other => HostReply::Err(format!("unsupported request: {other:?}")),
    }
}

fn fs_reply(result: FsResult<Value>) -> Result<HostReply, SecurityViolation> {
    match result {
        Ok(value) => Ok(HostReply::Ok(value)),
        Err(FsError::Security(violation)) => Err(violation),
        Err(e) => Ok(HostReply::Err(e.to_string())),
    }
}

fn file_stat(meta: &Metadata) -> Value {
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| i64::try_from(d.as_secs()).ok());

    let stat = FileStat {
        is_file: meta.is_file(),
        is_dir: meta.is_dir(),
        len: meta.len(),
        readonly: meta.permissions().readonly(),
        modified,
    };
    serde_json::to_value(stat).unwrap_or(Value::Null)
}
