use std::path::PathBuf;

use serde::Deserialize;

/// Log output settings; `RUST_LOG` overrides `level` when set.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
    /// Append-only log file written alongside stdout.
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            file: None,
        }
    }
}
