//! Per-extension lifecycle state
//!
//! ```text
//!            generic failure (count < threshold)
//!              ┌──────┐
//!              ▼      │
//!          ┌────────────┐  security violation    ┌──────────┐
//!   load ─►│   Active   │───────────────────────►│ Disabled │ (terminal)
//!          └────────────┘  count reaches threshold└──────────┘
//! ```
//!
//! All transitions go through [`ExtensionSlot::record`].

use crate::error::HookFailure;
use glint_ext_api::{ExtensionInfo, HookKind};
use serde::Serialize;
use std::fmt;

/// Why an extension was disabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DisableReason {
    SecurityViolation { hook: HookKind },
    RepeatedFailures { hook: HookKind, count: u32 },
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecurityViolation { hook } => write!(f, "security violation in {hook}"),
            Self::RepeatedFailures { hook, count } => {
                write!(f, "{count} failures (last in {hook})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SlotState {
    Active,
    Disabled { reason: DisableReason },
}

/// What a recorded failure did to the slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Still active, counter now at `count`
    Counted { count: u32 },
    /// Just became disabled
    Disabled(DisableReason),
    /// Was already disabled; nothing changed
    AlreadyDisabled,
}

/// Bookkeeping for one loaded extension
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionSlot {
    info: ExtensionInfo,
    folder: String,
    state: SlotState,
    failure_count: u32,
    threshold: u32,
}

impl ExtensionSlot {
    pub fn new(info: ExtensionInfo, folder: impl Into<String>, threshold: u32) -> Self {
        Self {
            info,
            folder: folder.into(),
            state: SlotState::Active,
            failure_count: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &ExtensionInfo {
        &self.info
    }

    /// Sanitised private folder name
    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn state(&self) -> &SlotState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SlotState::Active
    }

    /// Generic failures so far (never reset)
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Apply a hook failure
    ///
    /// Security violations disable immediately; other failures count towards
    /// the threshold across all hook kinds.
    pub fn record(&mut self, hook: HookKind, failure: &HookFailure) -> Transition {
        if !self.is_active() {
            return Transition::AlreadyDisabled;
        }

        let reason = if failure.is_security_violation() {
            DisableReason::SecurityViolation { hook }
        } else {
            self.failure_count += 1;
            if self.failure_count < self.threshold {
                return Transition::Counted {
                    count: self.failure_count,
                };
            }
            DisableReason::RepeatedFailures {
                hook,
                count: self.failure_count,
            }
        };

        self.state = SlotState::Disabled {
            reason: reason.clone(),
        };
        Transition::Disabled(reason)
    }
}
