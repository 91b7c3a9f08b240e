//! The self-serve manifest.
//!
//! A small, user-writable manifest fragment layered on top of the
//! primary manifest's `optional_installs`. Grounded on the atomic-
//! replace pattern in `store_config.rs` (write to a
//! `tempfile::NamedTempFile`, then `persist()` over the final path so a
//! crash mid-write never corrupts the file readers see).

use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// The self-serve manifest: items a user has opted into or out of from
/// the optional-installs catalog, without administrator involvement.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SelfServeManifest {
    #[serde(default)]
    pub managed_installs: Vec<String>,
    #[serde(default)]
    pub managed_uninstalls: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SelfServeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed self-serve manifest: {0}")]
    Parse(String),
}

impl SelfServeManifest {
    pub fn read_from(path: &Path) -> Result<SelfServeManifest, SelfServeError> {
        if !path.exists() {
            return Ok(SelfServeManifest::default());
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| SelfServeError::Parse(e.to_string()))
    }

    /// Only items also present in `allowed_optional_installs` (the
    /// union of all reachable manifests' `optional_installs`) are
    /// honored — a user cannot self-serve an item the admin never
    /// offered.
    pub fn validate(&self, allowed_optional_installs: &[String]) -> SelfServeManifest {
        SelfServeManifest {
            managed_installs: self
                .managed_installs
                .iter()
                .filter(|name| allowed_optional_installs.contains(name))
                .cloned()
                .collect(),
            managed_uninstalls: self.managed_uninstalls.clone(),
        }
    }

    /// Write this manifest atomically: write to a temp file in the
    /// same directory, then rename over the destination, so a reader
    /// never observes a partially-written file.
    pub fn write_to(&self, path: &Path) -> Result<(), SelfServeError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let text = serde_json::to_string_pretty(self).map_err(|e| SelfServeError::Parse(e.to_string()))?;
        tmp.write_all(text.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| SelfServeError::Io(e.error))?;
        Ok(())
    }

    pub fn add_install(&mut self, name: &str) {
        self.managed_uninstalls.retain(|n| n != name);
        if !self.managed_installs.iter().any(|n| n == name) {
            self.managed_installs.push(name.to_string());
        }
    }

    pub fn remove_install(&mut self, name: &str) {
        self.managed_installs.retain(|n| n != name);
        if !self.managed_uninstalls.iter().any(|n| n == name) {
            self.managed_uninstalls.push(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_drops_items_not_in_allowed_list() {
        let manifest = SelfServeManifest {
            managed_installs: vec!["Allowed".into(), "NotOffered".into()],
            managed_uninstalls: vec![],
        };

        let validated = manifest.validate(&["Allowed".to_string()]);
        assert_eq!(validated.managed_installs, vec!["Allowed".to_string()]);
    }

    #[test]
    fn add_install_removes_conflicting_uninstall_entry() {
        let mut manifest = SelfServeManifest {
            managed_installs: vec![],
            managed_uninstalls: vec!["AppA".into()],
        };

        manifest.add_install("AppA");
        assert_eq!(manifest.managed_installs, vec!["AppA".to_string()]);
        assert!(manifest.managed_uninstalls.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SelfServeManifest.json");

        let mut manifest = SelfServeManifest::default();
        manifest.add_install("AppA");
        manifest.write_to(&path).unwrap();

        let read_back = SelfServeManifest::read_from(&path).unwrap();
        assert_eq!(read_back, manifest);
    }

    #[test]
    fn missing_file_reads_as_empty_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let manifest = SelfServeManifest::read_from(&path).unwrap();
        assert_eq!(manifest, SelfServeManifest::default());
    }
}
