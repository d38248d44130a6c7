//! wasmtime engine and per-unit instance

use super::host_call::{self, CallState, HostState};
use super::WasmError;
use crate::error::SecurityViolation;
use glint_ext_api::abi::{self, unpack_ptr_len};
use glint_ext_api::{HookCall, HookReply, UnitManifest};
use wasmtime::*;

/// Compiles units and links the host import
pub(crate) struct WasmEngine {
    engine: Engine,
    fuel: u64,
}

/// One instantiated unit
///
/// All extensions declared by a unit share this instance; the guest routes
/// hook calls by the extension name in [`HookCall`].
pub(crate) struct WasmInstance {
    store: Store<HostState>,
    memory: Memory,
    alloc_fn: TypedFunc<i32, i32>,
    dealloc_fn: TypedFunc<(i32, i32), ()>,
    manifest_fn: TypedFunc<(), i64>,
    create_fn: TypedFunc<(i32, i32), i64>,
    hook_fn: TypedFunc<(i32, i32), i64>,
    fuel: u64,
}

#[derive(Clone, Copy)]
enum Entry {
    Create,
    Hook,
}

impl Entry {
    fn export(self) -> &'static str {
        match self {
            Entry::Create => abi::EXPORT_CREATE,
            Entry::Hook => abi::EXPORT_HOOK,
        }
    }
}

impl WasmEngine {
    /// Create an engine that meters every call to `fuel` units
    pub(crate) fn new(fuel: u64) -> Result<Self, WasmError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.wasm_memory64(false);

        let engine = Engine::new(&config).map_err(WasmError::EngineCreation)?;

        Ok(Self { engine, fuel })
    }

    /// Compile and instantiate a unit
    ///
    /// Start functions run here, so this must be called inside the unit's
    /// sandbox scope.
    pub(crate) fn instantiate(&self, bytes: &[u8]) -> Result<WasmInstance, WasmError> {
        let module = Module::new(&self.engine, bytes).map_err(WasmError::ModuleCompilation)?;

        let mut store = Store::new(&self.engine, HostState::default());
        store
            .set_fuel(self.fuel)
            .map_err(WasmError::EngineCreation)?;

        let mut linker = Linker::new(&self.engine);
        host_call::link(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| match SecurityViolation::find_in(&e) {
                Some(violation) => WasmError::Security(violation),
                None => WasmError::Instantiation(e),
            })?;

        let memory = instance
            .get_memory(&mut store, abi::EXPORT_MEMORY)
            .ok_or(WasmError::ExportNotFound(abi::EXPORT_MEMORY))?;

        let alloc_fn = instance
            .get_typed_func::<i32, i32>(&mut store, abi::EXPORT_ALLOC)
            .map_err(|_| WasmError::ExportNotFound(abi::EXPORT_ALLOC))?;
        let dealloc_fn = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, abi::EXPORT_DEALLOC)
            .map_err(|_| WasmError::ExportNotFound(abi::EXPORT_DEALLOC))?;
        let manifest_fn = instance
            .get_typed_func::<(), i64>(&mut store, abi::EXPORT_MANIFEST)
            .map_err(|_| WasmError::ExportNotFound(abi::EXPORT_MANIFEST))?;
        let create_fn = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, abi::EXPORT_CREATE)
            .map_err(|_| WasmError::ExportNotFound(abi::EXPORT_CREATE))?;
        let hook_fn = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, abi::EXPORT_HOOK)
            .map_err(|_| WasmError::ExportNotFound(abi::EXPORT_HOOK))?;

        Ok(WasmInstance {
            store,
            memory,
            alloc_fn,
            dealloc_fn,
            manifest_fn,
            create_fn,
            hook_fn,
            fuel: self.fuel,
        })
    }
}

impl WasmInstance {
    /// Ask the guest which extensions it provides
    pub(crate) fn manifest(&mut self) -> Result<UnitManifest, WasmError> {
        self.refuel()?;
        let packed = self
            .manifest_fn
            .call(&mut self.store, ())
            .map_err(|e| call_error(abi::EXPORT_MANIFEST, e))?;

        let bytes = self.take_buffer(packed)?;
        Ok(glint_ext_api::decode(&bytes)?)
    }

    /// Instantiate one declared extension inside the guest
    pub(crate) fn create(&mut self, name: &str) -> Result<HookReply, WasmError> {
        let payload = glint_ext_api::encode(&name)?;
        let reply = self.call(Entry::Create, &payload)?;
        decode_reply(&reply)
    }

    /// Run one hook
    pub(crate) fn hook(&mut self, call: &HookCall) -> Result<HookReply, WasmError> {
        let payload = glint_ext_api::encode(call)?;
        let reply = self.call(Entry::Hook, &payload)?;
        decode_reply(&reply)
    }

    /// Hand the per-call host state to the store
    pub(crate) fn begin_call(&mut self, state: CallState) {
        self.store.data_mut().call = Some(state);
    }

    /// Take the per-call host state back
    pub(crate) fn end_call(&mut self) -> Option<CallState> {
        self.store.data_mut().call.take()
    }

    fn refuel(&mut self) -> Result<(), WasmError> {
        self.store
            .set_fuel(self.fuel)
            .map_err(WasmError::EngineCreation)
    }

    fn call(&mut self, entry: Entry, payload: &[u8]) -> Result<Vec<u8>, WasmError> {
        self.refuel()?;

        let len = i32::try_from(payload.len())
            .map_err(|_| WasmError::MemoryAccess(format!("payload too large: {}", payload.len())))?;
        let ptr = self
            .alloc_fn
            .call(&mut self.store, len)
            .map_err(|e| call_error(abi::EXPORT_ALLOC, e))?;

        self.memory
            .write(&mut self.store, ptr as usize, payload)
            .map_err(|e| WasmError::MemoryAccess(format!("Failed to write payload: {}", e)))?;

        let func = match entry {
            Entry::Create => &self.create_fn,
            Entry::Hook => &self.hook_fn,
        };
        let packed = func
            .call(&mut self.store, (ptr, len))
            .map_err(|e| call_error(entry.export(), e))?;

        self.dealloc_fn
            .call(&mut self.store, (ptr, len))
            .map_err(|e| call_error(abi::EXPORT_DEALLOC, e))?;

        self.take_buffer(packed)
    }

    /// Copy a guest buffer out and release it; a zero length means "no data"
    fn take_buffer(&mut self, packed: i64) -> Result<Vec<u8>, WasmError> {
        let (ptr, len) = unpack_ptr_len(packed);
        if len == 0 {
            return Ok(Vec::new());
        }

        let bytes = read_memory(&self.store, &self.memory, ptr, len)?;
        self.dealloc_fn
            .call(&mut self.store, (ptr, len))
            .map_err(|e| call_error(abi::EXPORT_DEALLOC, e))?;
        Ok(bytes)
    }
}

fn decode_reply(bytes: &[u8]) -> Result<HookReply, WasmError> {
    if bytes.is_empty() {
        return Ok(HookReply::ok());
    }
    Ok(glint_ext_api::decode(bytes)?)
}

/// Turn a wasmtime call error into the most specific [`WasmError`]
fn call_error(function: &'static str, err: anyhow::Error) -> WasmError {
    if let Some(violation) = SecurityViolation::find_in(&err) {
        return WasmError::Security(violation);
    }
    if err.downcast_ref::<Trap>() == Some(&Trap::OutOfFuel) {
        return WasmError::FuelExhausted;
    }
    WasmError::FunctionCall {
        function,
        source: err,
    }
}

/// Copy `len` bytes at `ptr` out of guest memory
pub(crate) fn read_memory(
    store: impl AsContext,
    memory: &Memory,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, WasmError> {
    let data = memory.data(&store);
    let start = usize::try_from(ptr)
        .map_err(|_| WasmError::MemoryAccess(format!("Negative pointer: {}", ptr)))?;
    let len = usize::try_from(len)
        .map_err(|_| WasmError::MemoryAccess(format!("Negative length: {}", len)))?;

    match start.checked_add(len) {
        Some(end) if end <= data.len() => Ok(data[start..end].to_vec()),
        _ => Err(WasmError::MemoryAccess(format!(
            "Out of bounds: ptr={}, len={}, memory_size={}",
            start,
            len,
            data.len()
        ))),
    }
}
