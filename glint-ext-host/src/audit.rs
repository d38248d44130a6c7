//! Audit trail for extension lifecycle and security events
//!
//! Provides a trait-based audit system that hosts can customize to send
//! events to their preferred destination. The manager and loader record:
//!
//! | Event | When |
//! |-------|------|
//! | `unit_skipped` | a unit failed to load or declared an incompatible API |
//! | `extension_loaded` | an extension was instantiated and registered |
//! | `extension_rejected` | instantiation failed or the name collided |
//! | `security_violation` | a hook touched the filesystem outside its capability |
//! | `hook_failed` | a hook returned an error, panicked or timed out |
//! | `extension_disabled` | an extension stopped receiving hooks |
//! | `shutdown_failed` | `on_shutdown` failed (never counted) |

use crate::error::SecurityViolation;
use glint_ext_api::{ExtensionInfo, HookKind};
use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Timestamp type (RFC 3339 string for portability)
pub type Timestamp = String;

fn now_rfc3339() -> Timestamp {
    chrono::Utc::now().to_rfc3339()
}

/// One audited event
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Timestamp of the event
    pub timestamp: Timestamp,
    /// Type of event
    pub event_type: AuditEventType,
    /// Extension (or unit) name
    pub extension: String,
    /// Additional details
    pub details: AuditDetails,
}

impl AuditEvent {
    /// Create a new audit event
    pub fn new(
        event_type: AuditEventType,
        extension: impl Into<String>,
        details: AuditDetails,
    ) -> Self {
        Self {
            timestamp: now_rfc3339(),
            event_type,
            extension: extension.into(),
            details,
        }
    }
}

/// Type of audit event
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    UnitSkipped,
    ExtensionLoaded,
    ExtensionRejected,
    SecurityViolation,
    HookFailed,
    ExtensionDisabled,
    ShutdownFailed,
}

/// Details about the audit event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AuditDetails {
    /// Unit or extension refused during loading
    Load { reason: String },
    /// Extension registered
    Lifecycle {
        version: String,
        folder: String,
    },
    /// Capability violation
    Violation {
        hook: String,
        path: String,
        operation: String,
        message: String,
    },
    /// Generic hook failure
    Failure {
        hook: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure_count: Option<u32>,
    },
    /// Extension disabled
    Disabled { reason: String },
}

/// Error type for audit operations
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to write audit log: {0}")]
    WriteError(#[from] std::io::Error),

    #[error("Failed to serialize audit event: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Trait for audit event sinks
///
/// # Example
///
/// ```rust
/// use glint_ext_host::audit::{AuditSink, AuditEvent, AuditError};
///
/// struct StderrAuditSink;
///
/// impl AuditSink for StderrAuditSink {
///     fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
///         eprintln!("{:?}", event);
///         Ok(())
///     }
///
///     fn flush(&self) -> Result<(), AuditError> {
///         Ok(())
///     }
/// }
/// ```
pub trait AuditSink: Send + Sync {
    /// Record an audit event
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;

    /// Flush any buffered events
    fn flush(&self) -> Result<(), AuditError>;

    /// Check if the sink is healthy/available
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Record an event, logging instead of failing
pub(crate) fn record(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(event) {
        tracing::warn!(error = %e, "Failed to record audit event");
    }
}

// ============================================================================
// Default Implementations
// ============================================================================

/// File-based audit sink (JSON Lines, one object per line)
pub struct JsonlAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlAuditSink {
    /// Create a new file audit sink, appending to an existing log
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Get the log file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let json = serde_json::to_string(&event)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", json)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.flush()?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.path.parent().map(|p| p.exists()).unwrap_or(true)
    }
}

impl fmt::Debug for JsonlAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlAuditSink")
            .field("path", &self.path)
            .finish()
    }
}

/// In-memory audit sink for testing
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
    max_events: usize,
}

impl MemoryAuditSink {
    /// Create a new memory sink with default capacity (1000 events)
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new memory sink with specified capacity
    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            events: RwLock::new(Vec::with_capacity(max_events.min(1000))),
            max_events,
        }
    }

    /// Get all recorded events
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get event count
    pub fn count(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Clear all events
    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Find events by type
    pub fn find_by_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.filtered(|e| e.event_type == event_type)
    }

    /// Find events by extension
    pub fn find_by_extension(&self, extension: &str) -> Vec<AuditEvent> {
        self.filtered(|e| e.extension == extension)
    }

    fn filtered(&self, keep: impl Fn(&AuditEvent) -> bool) -> Vec<AuditEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| keep(e))
            .cloned()
            .collect()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.max_events {
            events.remove(0); // FIFO eviction
        }
        events.push(event);
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

impl fmt::Debug for MemoryAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAuditSink")
            .field("count", &self.count())
            .field("max_events", &self.max_events)
            .finish()
    }
}

/// Null audit sink (discards all events)
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl NullAuditSink {
    pub fn new() -> Self {
        Self
    }
}

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

// ============================================================================
// Helper functions
// ============================================================================

pub fn unit_skipped(unit: &str, reason: impl fmt::Display) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::UnitSkipped,
        unit,
        AuditDetails::Load {
            reason: reason.to_string(),
        },
    )
}

pub fn extension_loaded(info: &ExtensionInfo, folder: &str) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::ExtensionLoaded,
        &info.name,
        AuditDetails::Lifecycle {
            version: info.version.clone(),
            folder: folder.to_string(),
        },
    )
}

pub fn extension_rejected(extension: &str, reason: impl fmt::Display) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::ExtensionRejected,
        extension,
        AuditDetails::Load {
            reason: reason.to_string(),
        },
    )
}

pub fn security_violation(
    extension: &str,
    hook: &str,
    violation: &SecurityViolation,
) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::SecurityViolation,
        extension,
        AuditDetails::Violation {
            hook: hook.to_string(),
            path: violation.path.clone(),
            operation: violation.operation.clone(),
            message: violation.message.clone(),
        },
    )
}

pub fn hook_failed(
    extension: &str,
    hook: HookKind,
    error: impl fmt::Display,
    failure_count: u32,
) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::HookFailed,
        extension,
        AuditDetails::Failure {
            hook: hook.to_string(),
            error: error.to_string(),
            failure_count: Some(failure_count),
        },
    )
}

pub fn extension_disabled(extension: &str, reason: impl fmt::Display) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::ExtensionDisabled,
        extension,
        AuditDetails::Disabled {
            reason: reason.to_string(),
        },
    )
}

pub fn shutdown_failed(extension: &str, error: impl fmt::Display) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::ShutdownFailed,
        extension,
        AuditDetails::Failure {
            hook: HookKind::Shutdown.to_string(),
            error: error.to_string(),
            failure_count: None,
        },
    )
}
