//! The Manifest data model.
//!
//! Grounded on `types/mod.rs`'s `Repository`/`Descriptor` structs, whose
//! tolerant-default deserialization this module reuses for a Munki
//! manifest's nine sections plus the conditional-items overlay.

use serde::{Deserialize, Serialize};

/// One entry of `conditional_items`: a predicate plus the manifest
/// sections it contributes when true.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConditionalItem {
    pub condition: String,
    #[serde(default)]
    pub managed_installs: Vec<String>,
    #[serde(default)]
    pub managed_uninstalls: Vec<String>,
    #[serde(default)]
    pub managed_updates: Vec<String>,
    #[serde(default)]
    pub optional_installs: Vec<String>,
    #[serde(default)]
    pub included_manifests: Vec<String>,
}

/// A single manifest. Manifests form a directed graph via
/// `included_manifests`; the retriever walks that graph with a visited
/// set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Manifest {
    #[serde(default)]
    pub catalogs: Vec<String>,
    #[serde(default)]
    pub managed_installs: Vec<String>,
    #[serde(default)]
    pub managed_uninstalls: Vec<String>,
    #[serde(default)]
    pub managed_updates: Vec<String>,
    #[serde(default)]
    pub optional_installs: Vec<String>,
    #[serde(default)]
    pub default_installs: Vec<String>,
    #[serde(default)]
    pub included_manifests: Vec<String>,
    #[serde(default)]
    pub conditional_items: Vec<ConditionalItem>,
    #[serde(default)]
    pub referenced_by: Option<String>,
}

impl Manifest {
    /// Merge any `conditional_items` whose predicate is true against
    /// `facts` into this manifest's own section lists, in place.
    /// Evaluated in declaration order; later conditional items can add
    /// duplicate entries, which downstream memoized walks (retrieval,
    /// resolution) de-duplicate naturally.
    pub fn apply_conditional_items(&mut self, facts: &crate::predicate::FactMap) {
        let conditions = std::mem::take(&mut self.conditional_items);

        for item in &conditions {
            if crate::predicate::evaluate(&item.condition, facts) {
                self.managed_installs.extend(item.managed_installs.iter().cloned());
                self.managed_uninstalls.extend(item.managed_uninstalls.iter().cloned());
                self.managed_updates.extend(item.managed_updates.iter().cloned());
                self.optional_installs.extend(item.optional_installs.iter().cloned());
                self.included_manifests.extend(item.included_manifests.iter().cloned());
            }
        }

        self.conditional_items = conditions;
    }
}
