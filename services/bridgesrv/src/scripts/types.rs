//! Script record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-defined automation script stored in SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    /// Script body in the sandboxed expression language
    pub source: String,
    /// Invocation cadence; clamped to at least the poll interval
    pub interval_ms: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Message from the most recent failed run, cleared on success
    pub last_error: Option<String>,
}

impl ScriptDefinition {
    pub fn new(id: &str, name: &str, source: &str, interval_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            enabled: false,
            source: source.to_string(),
            interval_ms,
            last_run_at: None,
            last_error: None,
        }
    }
}
