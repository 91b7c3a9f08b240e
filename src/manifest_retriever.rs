//! Manifest retrieval and resolution.
//!
//! Grounded on `repo.rs`'s `recurse_repo`, which walks a repository's
//! dependency/virtual-package graph with a visited-name set to avoid
//! re-processing a node twice; this module applies the same pattern to
//! `included_manifests`.

use std::collections::HashSet;

use crate::host_facts::HostFacts;
use crate::manifest::Manifest;

/// Anything that can hand back manifest bytes by name: the live
/// `fetcher::ResourceFetcher` in production, a fixed map in tests.
pub trait ManifestSource {
    fn get_manifest(&self, name: &str) -> Option<Manifest>;
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("no primary manifest could be resolved for this host")]
    NoPrimaryManifest,
    #[error("manifest '{0}' referenced but could not be retrieved")]
    NotFound(String),
}

/// Resolve the name of the primary manifest for this host, using this
/// fallback order: full hostname → short hostname → serial number →
/// `site_default`.
pub fn resolve_primary_manifest_name<S: ManifestSource>(source: &S, facts: &HostFacts) -> Result<String, ManifestError> {
    let candidates = [
        facts.hostname.clone(),
        facts.short_hostname.clone(),
        facts.serial_number.clone(),
        "site_default".to_string(),
    ];

    for candidate in candidates.iter() {
        if source.get_manifest(candidate).is_some() {
            return Ok(candidate.clone());
        }
    }

    Err(ManifestError::NoPrimaryManifest)
}

/// The fully resolved set of manifests reachable from the primary
/// manifest, with conditional items already merged and catalogs
/// collected in first-seen, depth-first order.
pub struct ResolvedManifests {
    pub primary_name: String,
    pub manifests: Vec<Manifest>,
    pub catalogs: Vec<String>,
}

/// Retrieve and recursively resolve manifests starting from the
/// host's primary manifest, applying conditional items at each node
/// and following `included_manifests` with a visited-name set so a
/// diamond-shaped or cyclic include graph is walked at most once per
/// manifest name: visiting the same manifest twice performs at most one
/// network/disk operation.
pub fn resolve_manifests<S: ManifestSource>(
    source: &S,
    facts: &HostFacts,
) -> Result<ResolvedManifests, ManifestError> {
    let primary_name = resolve_primary_manifest_name(source, facts)?;
    let fact_map = facts.as_fact_map();

    let mut visited = HashSet::new();
    let mut manifests = Vec::new();
    let mut catalogs = Vec::new();

    walk(source, &primary_name, &fact_map, &mut visited, &mut manifests, &mut catalogs)?;

    Ok(ResolvedManifests {
        primary_name,
        manifests,
        catalogs,
    })
}

fn walk<S: ManifestSource>(
    source: &S,
    name: &str,
    fact_map: &crate::predicate::FactMap,
    visited: &mut HashSet<String>,
    manifests: &mut Vec<Manifest>,
    catalogs: &mut Vec<String>,
) -> Result<(), ManifestError> {
    if visited.contains(name) {
        return Ok(());
    }
    visited.insert(name.to_string());

    let mut manifest = source
        .get_manifest(name)
        .ok_or_else(|| ManifestError::NotFound(name.to_string()))?;
    manifest.apply_conditional_items(fact_map);

    for catalog in &manifest.catalogs {
        if !catalogs.contains(catalog) {
            catalogs.push(catalog.clone());
        }
    }

    let included = manifest.included_manifests.clone();
    manifests.push(manifest);

    for included_name in &included {
        walk(source, included_name, fact_map, visited, manifests, catalogs)?;
    }

    Ok(())
}
