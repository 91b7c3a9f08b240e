//! End-to-end scenarios driven against in-memory catalogs and
//! manifests, one per named situation: simple install, a cyclic
//! dependency chain, update_for expansion, autoremoval, cache eviction
//! under disk pressure, and applicability rejection with the
//! higher-OS-version note.

use std::collections::HashMap;
use std::fs;

use munkicheck::cache::CacheManager;
use munkicheck::catalog::CatalogDb;
use munkicheck::host_facts::HostFacts;
use munkicheck::install_state::InstallState;
use munkicheck::pkginfo::{InstallsItem, Pkginfo, Receipt, StringOrList};
use munkicheck::resolver::Resolver;

fn host_facts() -> HostFacts {
    HostFacts {
        os_vers: "14.0".into(),
        arch: "arm64".into(),
        x86_64_capable: false,
        hostname: "workstation.example.com".into(),
        short_hostname: "workstation".into(),
        serial_number: "C02AB12CDEFG".into(),
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

fn base_pkginfo(name: &str, version: &str) -> Pkginfo {
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
fn scenario_1_simple_install() {
    let mut app_a = base_pkginfo("AppA", "1.0");
    app_a.installer_item_hash = Some("H".into());
    app_a.installs = vec![InstallsItem::Application {
        path: "/Applications/AppA.app".into(),
        bundle_identifier: None,
        bundle_version: Some("1.0".into()),
        minimum_update_version: None,
    }];

    let mut db = CatalogDb::new();
    db.insert_if_absent("production".into(), vec![app_a]);
    let catalogs = vec!["production".to_string()];
    let facts = host_facts();

    let info = Resolver::new(&db, &catalogs, &facts).resolve(&["AppA".to_string()], &[], &[], &[], &[]);

    assert_eq!(info.managed_installs.len(), 1);
    let item = &info.managed_installs[0];
    assert_eq!(item.name, "AppA");
    assert_eq!(item.version, "1.0");
    assert!(!item.installed);
    assert_eq!(item.installer_item.as_deref(), Some("AppA-1.0.pkg"));
    assert!(info.processed_installs.contains("AppA-1.0"));
}

#[test]
fn scenario_2_dependency_chain_cycle_safe() {
    let mut a = base_pkginfo("A", "1.0");
    a.requires = StringOrList(vec!["B".into()]);
    let mut b = base_pkginfo("B", "1.0");
    b.requires = StringOrList(vec!["A".into()]);

    let mut db = CatalogDb::new();
    db.insert_if_absent("production".into(), vec![a, b]);
    let catalogs = vec!["production".to_string()];
    let facts = host_facts();

    let info = Resolver::new(&db, &catalogs, &facts).resolve(&["A".to_string()], &[], &[], &[], &[]);

    assert_eq!(info.managed_installs.len(), 2);
    assert!(info.processed_installs.contains("A-1.0"));
    assert!(info.processed_installs.contains("B-1.0"));
    assert!(info.processed_sets_are_disjoint());
}

#[test]
fn scenario_3_update_for_expansion() {
    let mut app = base_pkginfo("App", "1.0");
    app.installs = vec![InstallsItem::Application {
        path: "/Applications/App.app".into(),
        bundle_identifier: None,
        bundle_version: Some("1.0".into()),
        minimum_update_version: None,
    }];

    let mut update = base_pkginfo("AppUpdate", "1.0.1");
    update.update_for = StringOrList(vec!["App".into()]);

    let mut db = CatalogDb::new();
    db.insert_if_absent("production".into(), vec![app, update]);
    let catalogs = vec!["production".to_string()];

    let mut facts = host_facts();
    facts.applications.push(munkicheck::host_facts::InstalledApplication {
        name: "App".into(),
        path: "/Applications/App.app".into(),
        bundle_id: None,
        version: Some("1.0".into()),
    });

    let info = Resolver::new(&db, &catalogs, &facts).resolve(&["App".to_string()], &[], &[], &[], &[]);

    assert_eq!(info.managed_installs.len(), 1);
    assert_eq!(info.managed_installs[0].name, "App");
    assert!(info.managed_installs[0].installed);

    assert_eq!(info.managed_updates.len(), 1);
    assert_eq!(info.managed_updates[0].name, "AppUpdate");
}

#[test]
fn scenario_4_autoremoval() {
    let mut widget = base_pkginfo("Widget", "1.0");
    widget.autoremove = true;
    widget.receipts = vec![Receipt {
        packageid: "com.x.widget".into(),
        version: "1.0".into(),
        optional: false,
    }];

    let mut db = CatalogDb::new();
    db.insert_if_absent("production".into(), vec![widget]);
    let catalogs = vec!["production".to_string()];

    let mut facts = host_facts();
    facts.installed_packages.insert("com.x.widget".into(), "1.0".into());

    // Widget is not in any manifest section; only autoremoval pulls it in.
    let info = Resolver::new(&db, &catalogs, &facts).resolve(&[], &[], &[], &[], &[]);

    assert_eq!(info.removals.len(), 1);
    assert_eq!(info.removals[0].name, "Widget");
    assert!(info.processed_uninstalls.contains("Widget-1.0"));
}

#[test]
fn scenario_5_disk_space_pressure_uncache_then_proceeds() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheManager::new(dir.path().to_path_buf());
    fs::create_dir_all(cache.pkgs_dir()).unwrap();

    let precached = cache.pkgs_dir().join("Foo-1.0.pkg");
    fs::write(&precached, vec![0u8; 1024]).unwrap();
    assert!(precached.exists());

    // Simulates reclaiming space before a large download: the
    // precached-but-no-longer-needed item is uncached first.
    cache.uncache("Foo-1.0.pkg").unwrap();
    assert!(!precached.exists());

    // Cleanup only removes what isn't in the keep list, regardless of
    // how it got there.
    fs::write(cache.pkgs_dir().join("NeededThing-1.0.pkg"), b"data").unwrap();
    let removed = cache.clean_up_download_cache(&["NeededThing-1.0.pkg".to_string()]).unwrap();
    assert!(removed.is_empty());
    assert!(cache.pkgs_dir().join("NeededThing-1.0.pkg").exists());
}

#[test]
fn scenario_6_applicability_rejection_with_higher_os_note() {
    let mut x = base_pkginfo("X", "2.0");
    x.minimum_os_version = Some("14.0".into());

    let mut db = CatalogDb::new();
    db.insert_if_absent("production".into(), vec![x]);
    let catalogs = vec!["production".to_string()];

    let mut facts = host_facts();
    facts.os_vers = "13.0".into();

    let info = Resolver::new(&db, &catalogs, &facts)
        .show_optional_installs_for_higher_os_versions(true)
        .resolve(&[], &[], &[], &["X".to_string()], &[]);

    assert_eq!(info.optional_installs.len(), 1);
    let item = &info.optional_installs[0];
    assert_eq!(item.name, "X");
    assert!(item.update_available);
    assert_eq!(item.note.as_deref(), Some("Requires macOS version 14.0."));
    assert!(info.managed_installs.is_empty());
}

#[test]
fn install_state_evaluate_matches_receipts_based_current() {
    let mut pkg = base_pkginfo("Receipted", "2.0");
    pkg.receipts = vec![Receipt {
        packageid: "com.example.receipted".into(),
        version: "2.0".into(),
        optional: false,
    }];

    let mut facts = host_facts();
    facts.installed_packages.insert("com.example.receipted".into(), "2.0".into());

    assert_eq!(munkicheck::install_state::evaluate(&pkg, &facts), InstallState::Current);
}
