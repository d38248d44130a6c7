//! Structured "default status" data handed to render hooks
//!
//! The host computes these facts; extensions only read them.

use serde::{Deserialize, Serialize};

/// Read-only snapshot of the status the host composed for this tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultStatus {
    pub uptime_seconds: u64,
    pub local_time: String,
    pub active_app: ActiveApp,
    #[serde(default)]
    pub process_count: Option<u32>,
    pub presence: Presence,
    #[serde(default)]
    pub favorites: Vec<Favorite>,
    #[serde(default)]
    pub work_languages: Vec<String>,
    pub footer_text: String,
    pub viewer_count: u32,
    pub update_interval_seconds: f64,
}

/// The foreground application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveApp {
    pub key: String,
    pub name: String,
    pub tagline: String,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
    #[serde(default)]
    pub minecraft_server: Option<String>,
    #[serde(default)]
    pub minecraft_client: Option<String>,
}

/// Owner presence (active / idle / away)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub state: String,
    #[serde(default)]
    pub idle_seconds: Option<u64>,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

/// A favourite application and whether it is running
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Favorite {
    pub name: String,
    pub running: bool,
    pub active: bool,
}
