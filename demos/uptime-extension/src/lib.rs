//! Uptime extension for glint
//!
//! Build with: cargo build --target wasm32-unknown-unknown --release
//! then copy the `.wasm` file into the extensions directory.
//!
//! Remembers when it was first loaded, counts ticks in its storage and
//! adds an "Uptime" section to the status message.

use glint_ext_sdk::prelude::*;

struct Uptime {
    started: f64,
}

impl Extension for Uptime {
    fn on_load(&mut self, host: &Host) -> Result<(), String> {
        self.started = host.now().map_err(|e| e.to_string())?;
        host.write_text("self:/started.txt", format!("{:.0}", self.started))
            .map_err(|e| e.to_string())?;
        host.info("uptime loaded");
        Ok(())
    }

    fn on_snapshot(&mut self, namespace: &mut Map<String, Value>, host: &Host) -> Result<(), String> {
        let now = host.now().map_err(|e| e.to_string())?;
        namespace.insert("seconds".into(), json!((now - self.started).max(0.0) as u64));
        Ok(())
    }

    fn on_render(&mut self, host: &Host, mode: &str) -> Result<(), String> {
        if mode != "status" {
            return Ok(());
        }
        let snapshot = host.snapshot().map_err(|e| e.to_string())?;
        let seconds = snapshot["extensions"]["uptime"]["seconds"].as_u64().unwrap_or(0);
        let ticks = host.storage_get("ticks").ok().and_then(|v| v.as_u64()).unwrap_or(0);

        host.replace_section(
            "Uptime",
            vec![
                format!("{}h {:02}m", seconds / 3600, (seconds / 60) % 60),
                format!("{ticks} ticks"),
            ],
        )
        .map_err(|e| e.to_string())
    }

    fn on_tick(&mut self, host: &Host) -> Result<(), String> {
        let ticks = host.storage_get("ticks").ok().and_then(|v| v.as_u64()).unwrap_or(0);
        host.storage_set("ticks", ticks + 1).map_err(|e| e.to_string())
    }

    fn on_shutdown(&mut self, host: &Host) -> Result<(), String> {
        host.info("uptime stopping");
        Ok(())
    }
}

struct Unit;

impl ExtensionUnit for Unit {
    fn manifest() -> UnitManifest {
        UnitManifest::new(DEFAULT_API_VERSION).extension(
            ExtensionInfo::new("uptime", "0.1.0").description("Shows how long the host has been running"),
        )
    }

    fn create(name: &str) -> Result<Box<dyn Extension>, String> {
        match name {
            "uptime" => Ok(Box::new(Uptime { started: 0.0 })),
            other => Err(format!("unknown extension '{other}'")),
        }
    }
}

export_unit!(Unit);
