//! The extension trait
//!
//! Every hook has a no-op default, so an extension implements only what it
//! needs. Hooks return `anyhow::Result<()>`; the manager classifies errors
//! (a [`crate::SecurityViolation`] anywhere in the chain disables the
//! extension at once) and panics are caught and counted as failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use glint_ext_host::{Extension, HookContext};
//!
//! #[derive(Default)]
//! struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl Extension for Greeter {
//!     fn on_render(&mut self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
//!         ctx.status().add_line("hello from greeter")?;
//!         Ok(())
//!     }
//! }
//! ```

use crate::context::HookContext;
use async_trait::async_trait;
use serde_json::{Map, Value};

#[async_trait]
pub trait Extension: Send {
    /// Called once after the whole load pass
    fn on_load(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Contribute to the snapshot
    ///
    /// `namespace` is this extension's object at
    /// `snapshot["extensions"][name]`; the rest of the snapshot is readable
    /// through [`HookContext::snapshot`].
    fn on_snapshot(
        &mut self,
        _namespace: &mut Map<String, Value>,
        _ctx: &mut HookContext<'_>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Edit the status message through [`HookContext::status`]
    fn on_render(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Periodic work, driven by the host timer
    async fn on_tick(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Best-effort cleanup; failures are logged only
    fn on_shutdown(&mut self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}
