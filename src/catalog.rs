//! The catalog database.
//!
//! Grounded on `repo.rs`'s `Repository`/`refresh_repos`/`recurse_repo`
//! (an ordered collection of named items, cached per session behind a
//! `HashMap`) and `transaction.rs`'s `PackageStore` trait shape. Rather
//! than a single `packages: PackageMap` index, this module builds four:
//! `named`, `receipts`, `updaters`, `autoremoveitems`.

use hashbrown::HashMap;

use crate::host_facts::HostFacts;
use crate::pkginfo::{parse_item_reference, Pkginfo};
use crate::predicate;
use crate::version::{self, VersionOrder};

/// One loaded catalog: an ordered list of pkginfos plus its derived
/// indices.
pub struct Catalog {
    pub name: String,
    items: Vec<Pkginfo>,
    /// name -> indices into `items`, ordered as encountered.
    named: HashMap<String, Vec<usize>>,
    /// packageid -> indices into `items` carrying a receipt with that id.
    receipts: HashMap<String, Vec<usize>>,
    /// indices of items whose `update_for` is non-empty.
    updaters: Vec<usize>,
    /// names flagged `autoremove`.
    autoremoveitems: Vec<String>,
}

impl Catalog {
    pub fn build(name: String, items: Vec<Pkginfo>) -> Catalog {
        let mut named: HashMap<String, Vec<usize>> = HashMap::new();
        let mut receipts: HashMap<String, Vec<usize>> = HashMap::new();
        let mut updaters = Vec::new();
        let mut autoremoveitems = Vec::new();

        for (idx, item) in items.iter().enumerate() {
            named.entry(item.name.clone()).or_insert_with(Vec::new).push(idx);

            for receipt in &item.receipts {
                receipts
                    .entry(receipt.packageid.clone())
                    .or_insert_with(Vec::new)
                    .push(idx);
            }

            if !item.update_for.is_empty() {
                updaters.push(idx);
            }

            if item.autoremove && !autoremoveitems.contains(&item.name) {
                autoremoveitems.push(item.name.clone());
            }
        }

        // Within each name bucket, order newest-first so callers that
        // want "highest version wins" don't need to re-sort.
        for indices in named.values_mut() {
            indices.sort_by(|&a, &b| version::compare(&items[b].version, &items[a].version));
        }

        Catalog {
            name,
            items,
            named,
            receipts,
            updaters,
            autoremoveitems,
        }
    }

    pub fn items_named(&self, name: &str) -> impl Iterator<Item = &Pkginfo> {
        self.named
            .get(name)
            .into_iter()
            .flat_map(move |indices| indices.iter().map(move |&i| &self.items[i]))
    }

    pub fn receipt_owners(&self, packageid: &str) -> impl Iterator<Item = &Pkginfo> {
        self.receipts
            .get(packageid)
            .into_iter()
            .flat_map(move |indices| indices.iter().map(move |&i| &self.items[i]))
    }

    pub fn updaters(&self) -> impl Iterator<Item = &Pkginfo> {
        self.updaters.iter().map(move |&i| &self.items[i])
    }

    pub fn autoremove_names(&self) -> &[String] {
        &self.autoremoveitems
    }

    pub fn all_items(&self) -> impl Iterator<Item = &Pkginfo> {
        self.items.iter()
    }
}

/// Why a candidate pkginfo was rejected during `item_detail`'s
/// applicability search, accumulated for a single warning at the end of
/// an unsuccessful search.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub name: String,
    pub version: String,
    pub reason: String,
}

/// Session-scoped cache of loaded catalogs, kept by name. Matches the
/// session-scoped `HashMap<RepoRecord, Repository>` shape in
/// `package_store::macos::MacOSPackageStore`: built on first fetch,
/// retained for the rest of the session.
#[derive(Default)]
pub struct CatalogDb {
    catalogs: HashMap<String, Catalog>,
}

impl CatalogDb {
    pub fn new() -> CatalogDb {
        CatalogDb::default()
    }

    /// Idempotent per session: if `name` is already loaded, this is a
    /// no-op.
    pub fn insert_if_absent(&mut self, name: String, items: Vec<Pkginfo>) {
        if !self.catalogs.contains_key(&name) {
            let catalog = Catalog::build(name.clone(), items);
            self.catalogs.insert(name, catalog);
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.catalogs.contains_key(name)
    }

    fn catalogs_in_order<'a>(&'a self, catalog_list: &[String]) -> Vec<&'a Catalog> {
        catalog_list.iter().filter_map(|name| self.catalogs.get(name)).collect()
    }

    /// The applicability-filtered lookup. Parses
    /// `name-version` / `name--version` when `item_ref` carries a
    /// version suffix and no explicit `version` override is given.
    pub fn item_detail(
        &self,
        item_ref: &str,
        catalog_list: &[String],
        version_override: Option<&str>,
        skip_minimum_os_check: bool,
        host_facts: &HostFacts,
    ) -> (Option<&Pkginfo>, Vec<Rejection>) {
        let (name, parsed_version) = parse_item_reference(item_ref);
        let requested_version = version_override.or(parsed_version.as_deref());

        let mut rejections = Vec::new();
        let fact_map = host_facts.as_fact_map();

        for catalog in self.catalogs_in_order(catalog_list) {
            let mut candidates: Vec<&Pkginfo> = catalog.items_named(&name).collect();

            if let Some(requested) = requested_version {
                candidates.retain(|c| version::eq(&c.version, requested));
            }
            // `items_named` is already newest-first per catalog.

            for candidate in candidates {
                match applicability_reason(candidate, host_facts, &fact_map, skip_minimum_os_check) {
                    Ok(()) => return (Some(candidate), rejections),
                    Err(reason) => rejections.push(Rejection {
                        name: candidate.name.clone(),
                        version: candidate.version.clone(),
                        reason,
                    }),
                }
            }
        }

        (None, rejections)
    }

    /// All pkginfos with the given name across catalogs, newest-first.
    pub fn all_items_with_name<'a>(&'a self, name: &str, catalog_list: &[String]) -> Vec<&'a Pkginfo> {
        let mut items: Vec<&Pkginfo> = self
            .catalogs_in_order(catalog_list)
            .into_iter()
            .flat_map(|c| c.items_named(name))
            .collect();
        items.sort_by(|a, b| version::compare(&b.version, &a.version));
        items
    }

    /// Names of pkginfos whose `update_for` references `item_ref`,
    /// order-independent by construction.
    pub fn updates_for(&self, item_ref: &str, catalog_list: &[String]) -> Vec<String> {
        let (name, version) = parse_item_reference(item_ref);
        let mut names: Vec<String> = Vec::new();

        for catalog in self.catalogs_in_order(catalog_list) {
            for updater in catalog.updaters() {
                let matches = updater.update_for.as_slice().iter().any(|target| {
                    let (target_name, target_version) = parse_item_reference(target);
                    if target_name != name {
                        return false;
                    }
                    match (&version, &target_version) {
                        (Some(v), Some(tv)) => version::eq(v, tv),
                        _ => true,
                    }
                });

                if matches && !names.contains(&updater.name) {
                    names.push(updater.name.clone());
                }
            }
        }

        names.sort();
        names
    }

    /// Union of `autoremoveitems` across catalogs.
    pub fn autoremoval_items(&self, catalog_list: &[String]) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for catalog in self.catalogs_in_order(catalog_list) {
            for name in catalog.autoremove_names() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }
}

/// Apply the four-stage applicability filter in order: Munki-version
/// floor, OS min/max, supported architectures, predicate.
/// Returns `Ok(())` if the candidate passes everything, otherwise the
/// reason for rejection.
fn applicability_reason(
    candidate: &Pkginfo,
    host_facts: &HostFacts,
    fact_map: &predicate::FactMap,
    skip_minimum_os_check: bool,
) -> Result<(), String> {
    if let Some(ref min_munki) = candidate.minimum_munki_version {
        if version::compare_to_installed(&host_facts.munki_version, min_munki) == VersionOrder::Newer {
            return Err(format!("requires munki version {}", min_munki));
        }
    }

    if !skip_minimum_os_check {
        if let Some(ref min_os) = candidate.minimum_os_version {
            if version::compare_to_installed(&host_facts.os_vers, min_os) == VersionOrder::Newer {
                return Err(format!("requires macOS version {}", min_os));
            }
        }
    }

    if let Some(ref max_os) = candidate.maximum_os_version {
        if version::compare_to_installed(&host_facts.os_vers, max_os) == VersionOrder::Older {
            return Err(format!("requires macOS version at most {}", max_os));
        }
    }

    if !candidate.supported_architectures.is_empty() {
        let matches_arch = candidate.supported_architectures.iter().any(|arch| {
            if arch == &host_facts.arch {
                return true;
            }
            // An x86_64 item matches a 64-bit-capable i386 host.
            arch == "x86_64" && host_facts.arch == "i386" && host_facts.x86_64_capable
        });

        if !matches_arch {
            return Err(format!(
                "not supported on architecture {} (supports {:?})",
                host_facts.arch, candidate.supported_architectures
            ));
        }
    }

    if let Some(ref condition) = candidate.installable_condition {
        if !predicate::evaluate(condition, fact_map) {
            return Err(format!("installable_condition failed: {}", condition));
        }
    }

    Ok(())
}
