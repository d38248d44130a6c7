//! Integration tests for wasm units: loading, host calls and sandboxing
//!
//! Guests are generated as WAT at test time. Each one embeds its manifest
//! and the host requests it makes as MessagePack blobs in data segments.

use glint_ext_api::abi::pack_ptr_len;
use glint_ext_api::{ExtensionInfo, HookReply, HostCall, UnitManifest};
use glint_ext_host::{
    AuditEventType, DisableReason, ExtensionLoader, ExtensionManager, HostConfig, HookKind,
    LoadError, MemoryAuditSink, RenderContext, SlotState,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const MANIFEST_AT: i32 = 1024;
const LOAD_REQUEST_AT: i32 = 4096;
const HOOK_REQUEST_AT: i32 = 8192;
const HOOK_REPLY_AT: i32 = 12288;

/// Builder for a minimal guest module
struct Guest {
    manifest: Vec<u8>,
    load_request: Option<Vec<u8>>,
    hook_request: Option<Vec<u8>>,
    hook_reply: Option<Vec<u8>>,
    spin: bool,
}

impl Guest {
    fn new(manifest: &UnitManifest) -> Self {
        Self {
            manifest: glint_ext_api::encode(manifest).unwrap(),
            load_request: None,
            hook_request: None,
            hook_reply: None,
            spin: false,
        }
    }

    fn single(api_version: &str, name: &str) -> Self {
        Self::new(&UnitManifest::new(api_version).extension(ExtensionInfo::new(name, "0.1.0")))
    }

    /// Make `call` from `ext_manifest`, i.e. from the unit's top-level code
    fn calls_at_load(mut self, call: &HostCall) -> Self {
        self.load_request = Some(glint_ext_api::encode(call).unwrap());
        self
    }

    /// Make `call` from every `ext_hook` invocation
    fn calls_in_hooks(mut self, call: &HostCall) -> Self {
        self.hook_request = Some(glint_ext_api::encode(call).unwrap());
        self
    }

    fn replies(mut self, reply: &HookReply) -> Self {
        self.hook_reply = Some(glint_ext_api::encode(reply).unwrap());
        self
    }

    /// Loop forever in `ext_hook`
    fn spinning(mut self) -> Self {
        self.spin = true;
        self
    }

    fn wat(&self) -> String {
        let data = |offset: i32, bytes: &Option<Vec<u8>>| match bytes {
            Some(bytes) => format!("(data (i32.const {offset}) \"{}\")", escape(bytes)),
            None => String::new(),
        };
        let call = |offset: i32, bytes: &Option<Vec<u8>>| match bytes {
            Some(bytes) => format!(
                "(drop (call $host_call (i32.const {offset}) (i32.const {})))",
                bytes.len()
            ),
            None => String::new(),
        };
        let hook_result = match &self.hook_reply {
            Some(bytes) => pack_ptr_len(HOOK_REPLY_AT, bytes.len() as i32),
            None => 0,
        };

        format!(
            r#"(module
  (import "glint" "host_call" (func $host_call (param i32 i32) (result i64)))
  (memory (export "memory") 4)
  (global $heap (mut i32) (i32.const 65536))
  (data (i32.const {manifest_at}) "{manifest}")
  {load_data}
  {hook_data}
  {reply_data}
  (func (export "ext_alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $ptr))
  (func (export "ext_dealloc") (param i32 i32))
  (func (export "ext_manifest") (result i64)
    {load_call}
    (i64.const {manifest_packed}))
  (func (export "ext_create") (param i32 i32) (result i64)
    (i64.const 0))
  (func (export "ext_hook") (param i32 i32) (result i64)
    {spin}
    {hook_call}
    (i64.const {hook_result})))
"#,
            manifest_at = MANIFEST_AT,
            manifest = escape(&self.manifest),
            load_data = data(LOAD_REQUEST_AT, &self.load_request),
            hook_data = data(HOOK_REQUEST_AT, &self.hook_request),
            reply_data = data(HOOK_REPLY_AT, &self.hook_reply),
            load_call = call(LOAD_REQUEST_AT, &self.load_request),
            manifest_packed = pack_ptr_len(MANIFEST_AT, self.manifest.len() as i32),
            spin = if self.spin { "(loop $spin (br $spin))" } else { "" },
            hook_call = call(HOOK_REQUEST_AT, &self.hook_request),
            hook_result = hook_result,
        )
    }

    /// wasmtime accepts the text format directly
    fn install(&self, dir: &Path, unit: &str) {
        std::fs::write(dir.join(format!("{unit}.wasm")), self.wat()).unwrap();
    }
}

fn escape(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{b:02x}")).collect()
}

struct Host {
    dir: TempDir,
    config: HostConfig,
    audit: Arc<MemoryAuditSink>,
}

impl Host {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let shared = dir.path().join("extensions");
        let runtime = dir.path().join("runtime");
        std::fs::create_dir_all(&shared).unwrap();
        std::fs::create_dir_all(&runtime).unwrap();
        Self {
            config: HostConfig::new(shared, runtime).with_wasm_fuel(1_000_000),
            dir,
            audit: Arc::new(MemoryAuditSink::new()),
        }
    }

    fn extensions(&self) -> &Path {
        &self.config.extensions_dir
    }

    fn load(&self) -> (ExtensionManager, glint_ext_host::LoadReport) {
        let mut manager = ExtensionManager::new(self.config.clone()).with_audit(self.audit.clone());
        let report = ExtensionLoader::new()
            .with_wasm(&self.config)
            .expect("Failed to create wasm source")
            .load_all(&mut manager);
        (manager, report)
    }
}

#[test]
fn test_wasm_extension_renders_through_host_call() {
    let host = Host::new();
    Guest::single("1.1", "greeter")
        .calls_in_hooks(&HostCall::StatusAddLine {
            text: "hello from wasm".into(),
        })
        .install(host.extensions(), "greeter");

    let (mut manager, report) = host.load();
    assert_eq!(report.loaded, ["greeter"]);
    assert!(report.is_clean());

    let mut render = RenderContext::new(vec!["header".into()]);
    manager.on_render(&mut render, "status");

    assert_eq!(render.lines(), ["header", "hello from wasm"]);
    // on_load also made the call, outside render, and only got an error reply
    assert!(manager.is_active("greeter"));
    assert_eq!(manager.slot("greeter").unwrap().failure_count(), 0);
}

#[test]
fn test_units_load_in_file_name_order() {
    let host = Host::new();
    Guest::single("1.1", "second").install(host.extensions(), "b_unit");
    Guest::single("1.1", "first").install(host.extensions(), "a_unit");
    Guest::single("1.1", "hidden").install(host.extensions(), "_private");

    let (manager, report) = host.load();
    assert_eq!(report.loaded, ["first", "second"]);
    assert!(manager.slot("hidden").is_none());
}

#[test]
fn test_version_mismatch_skips_unit() {
    let host = Host::new();
    Guest::single("1.0", "legacy").install(host.extensions(), "legacy");
    Guest::new(&UnitManifest::default().extension(ExtensionInfo::new("bare", "0.1.0")))
        .install(host.extensions(), "bare");

    let (manager, report) = host.load();

    assert!(report.loaded.is_empty());
    assert!(matches!(
        report.reason("legacy"),
        Some(LoadError::IncompatibleApiVersion { expected, found })
            if expected == "1.1" && found == "1.0"
    ));
    assert!(matches!(
        report.reason("bare"),
        Some(LoadError::MissingApiVersion { .. })
    ));
    assert!(manager.is_empty());
    assert_eq!(host.audit.find_by_type(AuditEventType::UnitSkipped).len(), 2);
}

#[test]
fn test_required_version_is_configurable() {
    let mut host = Host::new();
    host.config = host.config.clone().with_required_api_version("1.0");
    Guest::single("1.0", "legacy").install(host.extensions(), "legacy");

    let (_, report) = host.load();
    assert_eq!(report.loaded, ["legacy"]);
}

#[test]
fn test_invalid_module_is_skipped() {
    let host = Host::new();
    std::fs::write(host.extensions().join("broken.wasm"), b"\0asm garbage").unwrap();
    Guest::single("1.1", "fine").install(host.extensions(), "fine");

    let (_, report) = host.load();
    assert_eq!(report.loaded, ["fine"]);
    assert!(matches!(report.reason("broken"), Some(LoadError::Unit(_))));
}

#[test]
fn test_write_to_runtime_disables_extension() {
    let host = Host::new();
    Guest::single("1.1", "intruder")
        .calls_in_hooks(&HostCall::WriteText {
            path: "runtime:/hack.txt".into(),
            data: "owned".into(),
        })
        .install(host.extensions(), "intruder");

    let (manager, report) = host.load();
    assert_eq!(report.loaded, ["intruder"]);

    let slot = manager.slot("intruder").unwrap();
    assert_eq!(
        slot.state(),
        &SlotState::Disabled {
            reason: DisableReason::SecurityViolation {
                hook: HookKind::Load
            }
        }
    );
    assert!(!host.config.runtime_dir.join("hack.txt").exists());

    let violations = host.audit.find_by_type(AuditEventType::SecurityViolation);
    assert_eq!(violations.len(), 1);
    let event = serde_json::to_value(&violations[0]).unwrap();
    assert_eq!(event["details"]["operation"], "write_text");
    assert_eq!(event["details"]["hook"], "on_load");
    assert!(event["details"]["path"]
        .as_str()
        .unwrap()
        .ends_with("runtime/hack.txt"));
}

#[test]
fn test_private_folder_is_writable() {
    let host = Host::new();
    Guest::single("1.1", "notes")
        .calls_in_hooks(&HostCall::WriteText {
            path: "self:/note.txt".into(),
            data: "remember".into(),
        })
        .install(host.extensions(), "notes");

    let (manager, _) = host.load();

    assert!(manager.is_active("notes"));
    let written = std::fs::read_to_string(host.extensions().join("notes/note.txt")).unwrap();
    assert_eq!(written, "remember");
}

#[test]
fn test_violation_in_unit_code_refuses_unit() {
    let host = Host::new();
    let secret = host.dir.path().join("secret.txt");
    std::fs::write(&secret, "top secret").unwrap();

    Guest::single("1.1", "snoop")
        .calls_at_load(&HostCall::ReadText {
            path: secret.display().to_string(),
        })
        .install(host.extensions(), "snoop");

    let (manager, report) = host.load();

    assert!(report.loaded.is_empty());
    match report.reason("snoop") {
        Some(LoadError::Security(violation)) => {
            assert_eq!(violation.message, "Access outside the sandbox roots is forbidden");
            assert_eq!(violation.operation, "read_text");
        }
        other => panic!("expected a security refusal, got {other:?}"),
    }
    assert!(manager.slot("snoop").is_none());
}

#[test]
fn test_error_replies_count_towards_threshold() {
    let host = Host::new();
    Guest::single("1.1", "grumpy")
        .replies(&HookReply::error("not today"))
        .install(host.extensions(), "grumpy");

    let (mut manager, _) = host.load();
    assert_eq!(manager.slot("grumpy").unwrap().failure_count(), 1);

    let mut render = RenderContext::default();
    manager.on_render(&mut render, "status");
    assert!(manager.is_active("grumpy"));
    manager.on_render(&mut render, "status");

    assert_eq!(
        manager.slot("grumpy").unwrap().state(),
        &SlotState::Disabled {
            reason: DisableReason::RepeatedFailures {
                hook: HookKind::Render,
                count: 3
            }
        }
    );
    let failures = host.audit.find_by_type(AuditEventType::HookFailed);
    assert_eq!(failures.len(), 3);
}

#[test]
fn test_fuel_exhaustion_is_a_generic_failure() {
    let mut host = Host::new();
    host.config = host.config.clone().with_failure_threshold(1);
    Guest::single("1.1", "spinner")
        .spinning()
        .install(host.extensions(), "spinner");

    let (manager, report) = host.load();
    assert_eq!(report.loaded, ["spinner"]);

    assert!(matches!(
        manager.slot("spinner").unwrap().state(),
        SlotState::Disabled {
            reason: DisableReason::RepeatedFailures { .. }
        }
    ));
    assert!(host
        .audit
        .find_by_type(AuditEventType::SecurityViolation)
        .is_empty());
}

#[test]
fn test_snapshot_namespace_round_trips_through_guest() {
    let host = Host::new();
    let reply = HookReply::with_namespace(serde_json::json!({ "temperature": 21 }));
    Guest::single("1.1", "weather")
        .replies(&reply)
        .install(host.extensions(), "weather");

    let (mut manager, _) = host.load();
    let mut snapshot = serde_json::json!({ "battery": 80 });
    manager.on_snapshot(&mut snapshot);

    assert_eq!(snapshot["extensions"]["weather"]["temperature"], 21);
    assert_eq!(snapshot["battery"], 80);
}
