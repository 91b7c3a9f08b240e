//! The dependency resolver: the heart of a session.
//!
//! Grounded on `transaction.rs`'s `process_install_action`, which walks
//! a requested action's dependency edges recursively, detects
//! contradictory actions on the same package, and memoizes visited
//! packages so a diamond-shaped dependency graph is walked once. This
//! module generalizes that walk to Munki's five manifest sections
//! (`managed_installs`, `managed_uninstalls`, `managed_updates`,
//! `optional_installs`, `default_installs`), `requires`/`update_for`
//! expansion, and autoremoval.

use std::collections::HashMap;

use crate::cache::{CacheError, CacheManager};
use crate::catalog::CatalogDb;
use crate::fetcher::FetchError;
use crate::host_facts::HostFacts;
use crate::install_info::InstallInfo;
use crate::install_state::{self, InstallState};
use crate::pkginfo::Pkginfo;

/// Resolves a manifest's sections against a `CatalogDb` into a
/// finished `InstallInfo`, honoring `requires`/`update_for` expansion
/// and avoiding infinite recursion on cyclic dependency graphs via the
/// `processed_installs`/`processed_uninstalls` memo sets carried on
/// `InstallInfo` itself; those sets stay disjoint for the lifetime of a
/// resolve.
pub struct Resolver<'a> {
    catalog_db: &'a CatalogDb,
    catalog_list: &'a [String],
    host_facts: &'a HostFacts,
    cache: &'a CacheManager,
    repo_base: &'a str,
    license_seats: &'a HashMap<String, i64>,
    skip_minimum_os_check: bool,
    show_optional_installs_for_higher_os_versions: bool,
    info: InstallInfo,
}

impl<'a> Resolver<'a> {
    pub fn new(
        catalog_db: &'a CatalogDb,
        catalog_list: &'a [String],
        host_facts: &'a HostFacts,
        cache: &'a CacheManager,
        repo_base: &'a str,
        license_seats: &'a HashMap<String, i64>,
    ) -> Resolver<'a> {
        Resolver {
            catalog_db,
            catalog_list,
            host_facts,
            cache,
            repo_base,
            license_seats,
            skip_minimum_os_check: false,
            show_optional_installs_for_higher_os_versions: false,
            info: InstallInfo::default(),
        }
    }

    pub fn skip_minimum_os_check(mut self, skip: bool) -> Resolver<'a> {
        self.skip_minimum_os_check = skip;
        self
    }

    /// Mirrors the `ShowOptionalInstallsForHigherOSVersions` preference:
    /// when set, an optional install rejected solely for
    /// `minimum_os_version` still appears in `optional_installs`,
    /// annotated with `note`/`update_available` instead of being dropped.
    pub fn show_optional_installs_for_higher_os_versions(mut self, show: bool) -> Resolver<'a> {
        self.show_optional_installs_for_higher_os_versions = show;
        self
    }

    /// Resolve every manifest section into a finished `InstallInfo`.
    /// `optional_installs` is filtered down by the caller to the
    /// validated self-serve selections plus `default_installs` before
    /// being passed in here.
    pub fn resolve(
        mut self,
        managed_installs: &[String],
        managed_uninstalls: &[String],
        managed_updates: &[String],
        optional_installs: &[String],
        default_installs: &[String],
    ) -> InstallInfo {
        for item_ref in managed_installs {
            self.process_install(item_ref);
        }

        for item_ref in managed_updates {
            self.process_managed_update(item_ref);
        }

        for item_ref in default_installs {
            self.process_default_install(item_ref);
        }

        for item_ref in optional_installs {
            self.process_optional_install(item_ref);
        }

        for item_ref in managed_uninstalls {
            self.process_removal(item_ref);
        }

        self.process_autoremoval();

        self.info
    }

    fn lookup(&self, item_ref: &str) -> Option<&'a Pkginfo> {
        let (pkginfo, rejections) =
            self.catalog_db
                .item_detail(item_ref, self.catalog_list, None, self.skip_minimum_os_check, self.host_facts);
        if pkginfo.is_none() {
            log::debug!("no applicable candidate for '{}': {:?}", item_ref, rejections);
        }
        pkginfo
    }

    /// Expand and install `item_ref`'s `requires` list before deciding
    /// whether `item_ref` itself needs installing, mirroring
    /// `process_install_action`'s pre-order dependency walk.
    fn process_install(&mut self, item_ref: &str) {
        if self.info.processed_installs.contains(item_ref) {
            return;
        }

        let pkginfo = match self.lookup(item_ref) {
            Some(p) => p,
            None => {
                self.info.record_problem(item_ref, "no applicable item found in any catalog");
                return;
            }
        };

        // Mark processed before recursing into requires so a cycle
        // (A requires B, B requires A) terminates instead of looping.
        self.info.processed_installs.insert(pkginfo.reference());

        if self.info.processed_uninstalls.contains(&pkginfo.reference()) {
            self.info
                .record_problem(item_ref, "contradiction: item is scheduled for both install and removal");
            return;
        }

        for required in pkginfo.requires.as_slice() {
            self.process_install(required);
        }

        let state = install_state::evaluate(pkginfo, self.host_facts);
        self.apply_install_decision(pkginfo, state);

        for updater_name in self.catalog_db.updates_for(&pkginfo.reference(), self.catalog_list) {
            self.process_managed_update(&updater_name);
        }
    }

    fn apply_install_decision(&mut self, pkginfo: &'a Pkginfo, state: InstallState) {
        match state {
            InstallState::Current => {
                self.info.record_install(pkginfo, true, None);
            }
            InstallState::NotPresent | InstallState::NeedsUpdate => {
                for required in pkginfo.requires.as_slice() {
                    if self.info.problem_items.iter().any(|p| p.name == *required) {
                        self.info.record_problem(
                            &pkginfo.name,
                            &format!("required item '{}' could not be resolved", required),
                        );
                        return;
                    }
                }

                if pkginfo.is_apple_item() {
                    // apple_item blocks any Apple-Software-Update
                    // interaction for this run: detect and surface it,
                    // but never attempt to fetch/install it ourselves.
                    self.info.apple_updates.push(crate::install_info::ManagedInstall {
                        name: pkginfo.name.clone(),
                        version: pkginfo.version.clone(),
                        installed: false,
                        installer_item: None,
                        note: None,
                        update_available: false,
                        licensed_seats_available: None,
                    });
                    return;
                }

                match self.cache.cache_package(self.repo_base, pkginfo) {
                    Ok(_) => {
                        self.info.record_install(pkginfo, false, pkginfo.installer_item_location.clone());
                    }
                    Err(e) => {
                        self.info.record_problem(&pkginfo.name, &cache_error_reason(&e));
                    }
                }
            }
            InstallState::Installed => {
                self.info.record_install(pkginfo, true, None);
            }
        }
    }

    fn process_managed_update(&mut self, item_ref: &str) {
        if self.info.processed_installs.contains(item_ref) {
            return;
        }

        let pkginfo = match self.lookup(item_ref) {
            Some(p) => p,
            None => return,
        };

        if self.info.processed_installs.contains(&pkginfo.reference()) {
            return;
        }
        self.info.processed_installs.insert(pkginfo.reference());

        // A managed_update only applies if the item it updates is
        // actually present on the host; unlike process_install it never
        // pulls in something new.
        let target_installed = pkginfo
            .update_for
            .as_slice()
            .iter()
            .any(|target| {
                self.catalog_db
                    .all_items_with_name(&crate::pkginfo::parse_item_reference(target).0, self.catalog_list)
                    .into_iter()
                    .any(|candidate| install_state::some_version_installed(candidate, self.host_facts))
            });

        if !target_installed {
            return;
        }

        for required in pkginfo.requires.as_slice() {
            self.process_install(required);
        }

        let state = install_state::evaluate(pkginfo, self.host_facts);
        if matches!(state, InstallState::NotPresent | InstallState::NeedsUpdate) {
            self.info.managed_updates.push(crate::install_info::ManagedInstall {
                name: pkginfo.name.clone(),
                version: pkginfo.version.clone(),
                installed: false,
                installer_item: pkginfo.installer_item_location.clone(),
                note: None,
                update_available: false,
                licensed_seats_available: None,
            });
        }
    }

    fn process_optional_install(&mut self, item_ref: &str) {
        if self.info.processed_installs.contains(item_ref) {
            return;
        }

        let (pkginfo, _) = self
            .catalog_db
            .item_detail(item_ref, self.catalog_list, None, self.skip_minimum_os_check, self.host_facts);

        let pkginfo = match pkginfo {
            Some(p) => p,
            None => {
                if self.show_optional_installs_for_higher_os_versions {
                    self.record_higher_os_optional(item_ref);
                }
                return;
            }
        };

        if self.info.optional_installs.iter().any(|i| i.name == pkginfo.name) {
            return;
        }

        let state = install_state::evaluate(pkginfo, self.host_facts);
        self.info.optional_installs.push(crate::install_info::ManagedInstall {
            name: pkginfo.name.clone(),
            version: pkginfo.version.clone(),
            installed: !matches!(state, InstallState::NotPresent | InstallState::NeedsUpdate),
            installer_item: match state {
                InstallState::NotPresent | InstallState::NeedsUpdate => pkginfo.installer_item_location.clone(),
                _ => None,
            },
            note: None,
            update_available: false,
            licensed_seats_available: crate::cache::seats_available(self.license_seats, &pkginfo.name),
        });
    }

    /// Relaxed second lookup ignoring `minimum_os_version`: if it
    /// succeeds where the strict lookup failed, the only blocker was
    /// the OS-version floor, so surface the candidate as a not-yet-
    /// installable optional install rather than dropping it silently.
    fn record_higher_os_optional(&mut self, item_ref: &str) {
        let (candidate, _) = self.catalog_db.item_detail(item_ref, self.catalog_list, None, true, self.host_facts);

        let candidate = match candidate {
            Some(c) => c,
            None => return,
        };

        if self.info.optional_installs.iter().any(|i| i.name == candidate.name) {
            return;
        }

        if let Some(ref min_os) = candidate.minimum_os_version {
            self.info.optional_installs.push(crate::install_info::ManagedInstall {
                name: candidate.name.clone(),
                version: candidate.version.clone(),
                installed: false,
                installer_item: None,
                note: Some(format!("Requires macOS version {}.", min_os)),
                update_available: true,
                licensed_seats_available: crate::cache::seats_available(self.license_seats, &candidate.name),
            });
        }
    }

    fn process_default_install(&mut self, item_ref: &str) {
        // A default install is an optional install the user hasn't
        // explicitly opted out of; resolved the same way, then folded
        // into managed_installs so it actually gets installed.
        if self.info.processed_installs.contains(item_ref) {
            return;
        }
        self.process_install(item_ref);
    }

    fn process_removal(&mut self, item_ref: &str) {
        if self.info.processed_uninstalls.contains(item_ref) {
            return;
        }

        let pkginfo = match self.lookup(item_ref) {
            Some(p) => p,
            None => return,
        };

        if self.info.processed_uninstalls.contains(&pkginfo.reference()) {
            return;
        }
        self.info.processed_uninstalls.insert(pkginfo.reference());

        if self.info.processed_installs.contains(&pkginfo.reference()) {
            self.info
                .record_problem(item_ref, "contradiction: item is scheduled for both install and removal");
            return;
        }

        if !pkginfo.uninstallable {
            self.info.record_problem(item_ref, "item is marked not uninstallable");
            return;
        }

        if install_state::some_version_installed(pkginfo, self.host_facts) {
            self.info.record_removal(pkginfo);
        }
    }

    /// Expand the catalogs' union of `autoremoveitems` into removals
    /// for anything currently installed but no longer referenced by any
    /// manifest section already processed. An item already scheduled
    /// for install in this resolve is never autoremoved.
    fn process_autoremoval(&mut self) {
        let candidates = self.catalog_db.autoremoval_items(self.catalog_list);

        for name in candidates {
            if self.info.processed_installs.contains(&name)
                || self.info.managed_installs.iter().any(|m| m.name == name)
            {
                continue;
            }

            if let Some(pkginfo) = self.lookup(&name) {
                if install_state::some_version_installed(pkginfo, self.host_facts) {
                    self.process_removal(&pkginfo.reference());
                }
            }
        }
    }
}

/// Collapse a cache/fetch failure into one of the problem-item
/// categories: verification, connection, http, filesystem, download.
fn cache_error_reason(err: &CacheError) -> String {
    match err {
        CacheError::InsufficientDiskSpace { needed, available } => {
            format!("filesystem: insufficient disk space (need {} bytes, have {})", needed, available)
        }
        CacheError::FileSystem(msg) => format!("filesystem: {}", msg),
        CacheError::Fetch(FetchError::Verification) => "verification: checksum mismatch".to_string(),
        CacheError::Fetch(FetchError::Connection { message, .. }) => format!("connection: {}", message),
        CacheError::Fetch(FetchError::Http { code, message }) => format!("http: {} {}", code, message),
        CacheError::Fetch(FetchError::FileSystem(msg)) => format!("filesystem: {}", msg),
        CacheError::Fetch(FetchError::Download { message, .. }) => format!("download: {}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkginfo::StringOrList;
    use std::collections::HashMap;

    fn facts() -> HostFacts {
        HostFacts {
            os_vers: "14.0".into(),
            arch: "arm64".into(),
            x86_64_capable: false,
            hostname: "host".into(),
            short_hostname: "host".into(),
            serial_number: "SN".into(),
            munki_version: "5.0".into(),
            machine_model: "Mac".into(),
            date: chrono::Utc::now(),
            console_user: None,
            ipv4_address: None,
            on_ac_power: true,
            applications: Vec::new(),
            installed_packages: HashMap::new(),
        }
    }

    /// A `CacheManager` rooted in a fresh temp dir, with `names` (each
    /// `"{name}-{version}.pkg"`) pre-seeded so `cache_package` finds them
    /// already cached and never attempts a real fetch.
    fn cache_with_seeded(names: &[&str]) -> (tempfile::TempDir, CacheManager) {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path().to_path_buf());
        std::fs::create_dir_all(cache.pkgs_dir()).unwrap();
        for name in names {
            std::fs::write(cache.pkgs_dir().join(name), b"stub").unwrap();
        }
        (dir, cache)
    }

    fn pkginfo(name: &str, version: &str) -> Pkginfo {
        Pkginfo {
            name: name.into(),
            version: version.into(),
            installer_type: None,
            installer_item_location: Some(format!("{}-{}.pkg", name, version)),
            installer_item_hash: None,
            installer_item_size: None,
            installed_size: None,
            receipts: vec![],
            installs: vec![],
            requires: StringOrList::default(),
            update_for: StringOrList::default(),
            minimum_os_version: None,
            maximum_os_version: None,
            supported_architectures: vec![],
            minimum_munki_version: None,
            installable_condition: None,
            blocking_applications: vec![],
            unattended_install: false,
            unattended_uninstall: false,
            force_install_after_date: None,
            on_demand: false,
            apple_item: None,
            precache: false,
            uninstallable: true,
            uninstall_method: None,
            installcheck_script: None,
            uninstallcheck_script: None,
            version_script: None,
            preinstall_script: None,
            postinstall_script: None,
            preuninstall_script: None,
            postuninstall_script: None,
            package_url: None,
            package_complete_url: None,
            display_name: None,
            description: None,
            icon_name: None,
            icon_hash: None,
            category: None,
            developer: None,
            featured: false,
            autoremove: false,
            unused_software_removal_info: None,
            restart_action: None,
        }
    }

    #[test]
    fn simple_install_resolves_to_managed_installs() {
        let mut db = CatalogDb::new();
        db.insert_if_absent("production".into(), vec![pkginfo("AppA", "1.0")]);
        let catalogs = vec!["production".to_string()];
        let facts = facts();
        let (_dir, cache) = cache_with_seeded(&["AppA-1.0.pkg"]);
        let seats = HashMap::new();

        let resolver = Resolver::new(&db, &catalogs, &facts, &cache, "https://repo.example.com", &seats);
        let info = resolver.resolve(&["AppA".to_string()], &[], &[], &[], &[]);

        assert_eq!(info.managed_installs.len(), 1);
        assert_eq!(info.managed_installs[0].name, "AppA");
        assert!(!info.managed_installs[0].installed);
    }

    #[test]
    fn dependency_chain_with_cycle_terminates() {
        let mut a = pkginfo("A", "1.0");
        a.requires = StringOrList(vec!["B".into()]);
        let mut b = pkginfo("B", "1.0");
        b.requires = StringOrList(vec!["A".into()]);

        let mut db = CatalogDb::new();
        db.insert_if_absent("production".into(), vec![a, b]);
        let catalogs = vec!["production".to_string()];
        let facts = facts();
        let (_dir, cache) = cache_with_seeded(&["A-1.0.pkg", "B-1.0.pkg"]);
        let seats = HashMap::new();

        let resolver = Resolver::new(&db, &catalogs, &facts, &cache, "https://repo.example.com", &seats);
        let info = resolver.resolve(&["A".to_string()], &[], &[], &[], &[]);

        assert_eq!(info.managed_installs.len(), 2);
        assert!(info.processed_sets_are_disjoint());
    }

    #[test]
    fn update_for_expansion_adds_managed_update_when_target_installed() {
        let base = pkginfo("App", "1.0");
        let mut updater = pkginfo("AppPatch", "1.0.1");
        updater.update_for = StringOrList(vec!["App".into()]);

        let mut db = CatalogDb::new();
        db.insert_if_absent("production".into(), vec![base, updater]);
        let catalogs = vec!["production".to_string()];
        let facts = facts();
        let (_dir, cache) = cache_with_seeded(&["App-1.0.pkg"]);
        let seats = HashMap::new();

        let resolver = Resolver::new(&db, &catalogs, &facts, &cache, "https://repo.example.com", &seats);
        let info = resolver.resolve(&["App".to_string()], &[], &[], &[], &[]);

        assert!(info.managed_updates.iter().any(|u| u.name == "AppPatch"));
    }

    #[test]
    fn removal_of_uninstallable_item_becomes_problem_item() {
        let mut widget = pkginfo("Widget", "1.0");
        widget.uninstallable = false;

        let mut db = CatalogDb::new();
        db.insert_if_absent("production".into(), vec![widget]);
        let catalogs = vec!["production".to_string()];
        let facts = facts();
        let (_dir, cache) = cache_with_seeded(&[]);
        let seats = HashMap::new();

        let resolver = Resolver::new(&db, &catalogs, &facts, &cache, "https://repo.example.com", &seats);
        let info = resolver.resolve(&[], &["Widget".to_string()], &[], &[], &[]);

        assert!(info.removals.is_empty());
        assert_eq!(info.problem_items.len(), 1);
    }

    #[test]
    fn optional_install_does_not_force_install() {
        let mut db = CatalogDb::new();
        db.insert_if_absent("production".into(), vec![pkginfo("Extra", "1.0")]);
        let catalogs = vec!["production".to_string()];
        let facts = facts();
        let (_dir, cache) = cache_with_seeded(&[]);
        let seats = HashMap::new();

        let resolver = Resolver::new(&db, &catalogs, &facts, &cache, "https://repo.example.com", &seats);
        let info = resolver.resolve(&[], &[], &[], &["Extra".to_string()], &[]);

        assert_eq!(info.optional_installs.len(), 1);
        assert!(info.managed_installs.is_empty());
    }

    #[test]
    fn optional_install_above_os_floor_surfaces_note_when_enabled() {
        let mut x = pkginfo("X", "2.0");
        x.minimum_os_version = Some("14.0".into());

        let mut db = CatalogDb::new();
        db.insert_if_absent("production".into(), vec![x]);
        let catalogs = vec!["production".to_string()];

        let mut host = facts();
        host.os_vers = "13.0".into();
        let (_dir, cache) = cache_with_seeded(&[]);
        let seats = HashMap::new();

        let resolver = Resolver::new(&db, &catalogs, &host, &cache, "https://repo.example.com", &seats)
            .show_optional_installs_for_higher_os_versions(true);
        let info = resolver.resolve(&[], &[], &[], &["X".to_string()], &[]);

        assert_eq!(info.optional_installs.len(), 1);
        let item = &info.optional_installs[0];
        assert!(item.update_available);
        assert_eq!(item.note.as_deref(), Some("Requires macOS version 14.0."));
        assert!(info.managed_installs.is_empty());
    }

    #[test]
    fn optional_install_above_os_floor_dropped_when_flag_off() {
        let mut x = pkginfo("X", "2.0");
        x.minimum_os_version = Some("14.0".into());

        let mut db = CatalogDb::new();
        db.insert_if_absent("production".into(), vec![x]);
        let catalogs = vec!["production".to_string()];

        let mut host = facts();
        host.os_vers = "13.0".into();
        let (_dir, cache) = cache_with_seeded(&[]);
        let seats = HashMap::new();

        let resolver = Resolver::new(&db, &catalogs, &host, &cache, "https://repo.example.com", &seats);
        let info = resolver.resolve(&[], &[], &[], &["X".to_string()], &[]);

        assert!(info.optional_installs.is_empty());
    }
}
