//! The `InstallInfo` data model.
//!
//! Persists its resolved transaction plan as JSON, the same pattern
//! `transaction.rs`'s `TransactionDb` uses, with eight lists and two
//! memoized name sets.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pkginfo::Pkginfo;

/// One resolved install action the session controller will act on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedInstall {
    pub name: String,
    pub version: String,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installer_item: Option<String>,
    /// Set when an optional install was rejected solely on
    /// `minimum_os_version` and `ShowOptionalInstallsForHigherOSVersions`
    /// is on; `None` otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Companion to `note`: true when a newer-OS-only version exists
    /// but isn't installable on this host yet.
    #[serde(default)]
    pub update_available: bool,
    /// Set on seat-limited optional installs after a `LicenseInfoURL`
    /// lookup: `true` when at least one seat remains. `None` when the
    /// item isn't seat-limited or no license info was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licensed_seats_available: Option<bool>,
}

/// One resolved removal action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedUninstall {
    pub name: String,
    pub version: String,
}

/// An item that could not be resolved (missing from catalogs,
/// dependency contradiction, applicability rejection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemItem {
    pub name: String,
    pub reason: String,
}

/// The full resolved transaction plan for one session, serialized to
/// `InstallInfo.json` at the end of the resolver's run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstallInfo {
    #[serde(default)]
    pub managed_installs: Vec<ManagedInstall>,
    #[serde(default)]
    pub removals: Vec<ManagedUninstall>,
    #[serde(default)]
    pub optional_installs: Vec<ManagedInstall>,
    #[serde(default)]
    pub managed_updates: Vec<ManagedInstall>,
    #[serde(default)]
    pub problem_items: Vec<ProblemItem>,
    #[serde(default)]
    pub featured_items: Vec<String>,
    #[serde(default)]
    pub apple_updates: Vec<ManagedInstall>,
    #[serde(default)]
    pub staged_os_installer: Option<ManagedInstall>,
    #[serde(default)]
    pub processed_installs: HashSet<String>,
    #[serde(default)]
    pub processed_uninstalls: HashSet<String>,
}

impl InstallInfo {
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
    }

    pub fn read_from(path: &Path) -> io::Result<InstallInfo> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// `processed_installs` and `processed_uninstalls` are always
    /// disjoint: an item is never simultaneously scheduled for install
    /// and removal in the same plan.
    pub fn processed_sets_are_disjoint(&self) -> bool {
        self.processed_installs.is_disjoint(&self.processed_uninstalls)
    }

    pub fn record_install(&mut self, pkginfo: &Pkginfo, installed: bool, installer_item: Option<String>) {
        self.processed_installs.insert(pkginfo.reference());
        self.managed_installs.push(ManagedInstall {
            name: pkginfo.name.clone(),
            version: pkginfo.version.clone(),
            installed,
            installer_item,
            note: None,
            update_available: false,
            licensed_seats_available: None,
        });
        if pkginfo.featured {
            self.featured_items.push(pkginfo.name.clone());
        }
    }

    pub fn record_removal(&mut self, pkginfo: &Pkginfo) {
        self.processed_uninstalls.insert(pkginfo.reference());
        self.removals.push(ManagedUninstall {
            name: pkginfo.name.clone(),
            version: pkginfo.version.clone(),
        });
    }

    pub fn record_problem(&mut self, name: &str, reason: &str) {
        self.problem_items.push(ProblemItem {
            name: name.to_string(),
            reason: reason.to_string(),
        });
    }
}
