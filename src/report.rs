//! The per-session report.
//!
//! A flat audit record of what a session did, persisted next to
//! `InstallInfo.json` so external reporting tools (or a follow-up
//! session) can inspect the outcome without re-deriving it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallEvent {
    pub name: String,
    pub version: String,
    pub status: InstallOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    Success,
    Failure,
    Skipped,
}

/// The report for a single run of the session controller.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Report {
    #[serde(default)]
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub manifest_name: Option<String>,
    #[serde(default)]
    pub installs: Vec<InstallEvent>,
    #[serde(default)]
    pub removals: Vec<InstallEvent>,
    #[serde(default)]
    pub problem_items: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub restart_required: bool,
}

impl Report {
    pub fn new(manifest_name: impl Into<String>) -> Report {
        Report {
            start_time: Some(chrono::Utc::now()),
            manifest_name: Some(manifest_name.into()),
            ..Default::default()
        }
    }

    pub fn record_install(&mut self, name: &str, version: &str, status: InstallOutcome, detail: Option<String>) {
        self.installs.push(InstallEvent {
            name: name.to_string(),
            version: version.to_string(),
            status,
            detail,
        });
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn record_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn finish(&mut self) {
        self.end_time = Some(chrono::Utc::now());
    }

    pub fn write_to(&self, path: &std::path::Path) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
    }
}
