//! Installation-state evaluation.
//!
//! Grounded on `package_store::macos::status_impl`, which runs a
//! fixed precedence chain of checks (receipt presence, `installs`
//! entries, install-check scripts) to decide whether a package needs
//! installing. This module generalizes that chain to the full
//! precedence order below, and adds an embedded-script execution
//! contract (temp file, mode 0700, pkginfo JSON on stdin, one-hour
//! timeout).

use std::io::Write as _;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::host_facts::HostFacts;
use crate::pkginfo::{InstallerType, InstallsItem, Pkginfo};
use crate::version::{self, VersionOrder};

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// The result of evaluating whether a `Pkginfo` is currently installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    /// Installed, and no version comparison is possible or needed
    /// (e.g. `OnDemand`, or a script that only reports presence).
    Installed,
    /// Not installed at all.
    NotPresent,
    /// Installed, but an older version than what the catalog offers.
    NeedsUpdate,
    /// Installed, same or newer than what the catalog offers.
    Current,
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to write embedded script to a temp file: {0}")]
    Write(String),
    #[error("failed to execute embedded script: {0}")]
    Exec(String),
    #[error("embedded script exceeded its one-hour execution budget")]
    Timeout,
}

/// Evaluate the installation state of `pkginfo` on a host described by
/// `facts`, following this precedence chain:
/// `OnDemand` → `installcheck_script` → `version_script` →
/// `startosinstall`/`stage_os_installer` → `installs` list → receipts
/// list.
pub fn evaluate(pkginfo: &Pkginfo, facts: &HostFacts) -> InstallState {
    if pkginfo.on_demand {
        return InstallState::NotPresent;
    }

    if let Some(ref script) = pkginfo.installcheck_script {
        match run_installcheck_script(script, pkginfo) {
            Ok(true) => return InstallState::NotPresent,
            Ok(false) => return InstallState::Current,
            Err(_) => {
                // Fall through to the next check in the chain rather
                // than treating a broken script as a hard failure.
            }
        }
    }

    if let Some(ref script) = pkginfo.version_script {
        if let Ok(output) = run_version_script(script, pkginfo) {
            let trimmed = output.trim();
            if trimmed.is_empty() {
                return InstallState::NotPresent;
            }
            return match version::compare_to_installed(trimmed, &pkginfo.version) {
                VersionOrder::NotPresent => InstallState::NotPresent,
                VersionOrder::Older => InstallState::NeedsUpdate,
                VersionOrder::Same | VersionOrder::Newer => InstallState::Current,
            };
        }
    }

    if matches!(
        pkginfo.installer_type,
        Some(InstallerType::StartosInstall) | Some(InstallerType::StageOsInstaller)
    ) {
        return evaluate_os_installer(pkginfo, facts);
    }

    if !pkginfo.installs.is_empty() {
        return evaluate_installs_list(pkginfo, facts);
    }

    evaluate_receipts_list(pkginfo, facts)
}

/// Whether some version of the item (not necessarily the catalog
/// version) is present at all.
pub fn some_version_installed(pkginfo: &Pkginfo, facts: &HostFacts) -> bool {
    !matches!(evaluate(pkginfo, facts), InstallState::NotPresent)
}

/// Whether the evidence used to reach the current state came from an
/// explicit receipt or installs match, as opposed to a script. Used to
/// decide whether an "installed" item still needs its receipt recorded.
pub fn evidence_this_is_installed(pkginfo: &Pkginfo, facts: &HostFacts) -> bool {
    if pkginfo.installcheck_script.is_some() || pkginfo.version_script.is_some() {
        return !matches!(evaluate(pkginfo, facts), InstallState::NotPresent);
    }
    !pkginfo.receipts.is_empty() || !pkginfo.installs.is_empty()
}

fn evaluate_os_installer(pkginfo: &Pkginfo, facts: &HostFacts) -> InstallState {
    // macOS installer assets are versioned by OS major/minor only; an
    // installed OS at or above the target major version counts as
    // current.
    let installed_major = facts.os_vers.split('.').next().unwrap_or("0");
    let target_major = pkginfo.version.split('.').next().unwrap_or("0");

    match version::compare(installed_major, target_major) {
        std::cmp::Ordering::Less => InstallState::NeedsUpdate,
        _ => InstallState::Current,
    }
}

fn evaluate_installs_list(pkginfo: &Pkginfo, facts: &HostFacts) -> InstallState {
    let mut any_present = false;

    for item in &pkginfo.installs {
        match item {
            InstallsItem::Application {
                bundle_identifier,
                path,
                minimum_update_version,
                ..
            }
            | InstallsItem::Bundle {
                bundle_identifier,
                path,
                minimum_update_version,
                ..
            } => {
                // A direct read of the declared path takes precedence
                // over the /Applications inventory scan: an app the
                // admin installed elsewhere is still correctly installed.
                let installed_version = match bundle_version_at_path(path) {
                    Some(version) => Some(version),
                    None => {
                        let name = path.rsplit('/').next().map(|s| s.trim_end_matches(".app"));
                        match facts.find_application(bundle_identifier.as_deref(), name) {
                            Some(app) => Some(app.version.clone()),
                            None => return InstallState::NotPresent,
                        }
                    }
                };

                any_present = true;
                let required = minimum_update_version.as_deref().unwrap_or(&pkginfo.version);
                if let Some(installed_version) = installed_version {
                    if version::compare(&installed_version, required) == std::cmp::Ordering::Less {
                        return InstallState::NeedsUpdate;
                    }
                }
            }
            InstallsItem::Plist { path, .. } => {
                if !std::path::Path::new(path).exists() {
                    return InstallState::NotPresent;
                }
                any_present = true;
            }
            InstallsItem::File { path, .. } => {
                if !std::path::Path::new(path).exists() {
                    return InstallState::NotPresent;
                }
                any_present = true;
            }
        }
    }

    if any_present {
        InstallState::Current
    } else {
        InstallState::NotPresent
    }
}

/// `Some(version)` when an app bundle actually exists at `path`,
/// `None` when it doesn't (caller falls back to the inventory scan).
#[cfg(target_os = "macos")]
fn bundle_version_at_path(path: &str) -> Option<Option<String>> {
    let info_plist = std::path::Path::new(path).join("Contents/Info.plist");
    if !info_plist.exists() {
        return None;
    }
    Some(crate::host_facts::read_bundle_info(&info_plist).and_then(|(_, version)| version))
}

#[cfg(not(target_os = "macos"))]
fn bundle_version_at_path(_path: &str) -> Option<Option<String>> {
    None
}

fn evaluate_receipts_list(pkginfo: &Pkginfo, facts: &HostFacts) -> InstallState {
    if pkginfo.receipts.is_empty() {
        return InstallState::NotPresent;
    }

    let mut worst = InstallState::Current;

    for receipt in &pkginfo.receipts {
        match facts.installed_packages.get(&receipt.packageid) {
            None => {
                if !receipt.optional {
                    return InstallState::NotPresent;
                }
            }
            Some(installed_version) => {
                if !receipt.optional && version::compare(installed_version, &receipt.version) == std::cmp::Ordering::Less {
                    worst = InstallState::NeedsUpdate;
                }
            }
        }
    }

    worst
}

fn run_installcheck_script(script: &str, pkginfo: &Pkginfo) -> Result<bool, ScriptError> {
    // installcheck_script returns 0 to mean "needs installing" per the
    // spec's contract, mirroring a shell test's exit-code convention.
    let status = run_embedded_script(script, pkginfo)?;
    Ok(status == 0)
}

fn run_version_script(script: &str, pkginfo: &Pkginfo) -> Result<String, ScriptError> {
    run_embedded_script_capture(script, pkginfo)
}

fn run_embedded_script(script: &str, pkginfo: &Pkginfo) -> Result<i32, ScriptError> {
    let path = write_script_to_temp(script)?;
    let status = spawn_with_timeout(&path, pkginfo)?;
    let _ = std::fs::remove_file(&path);
    Ok(status)
}

fn run_embedded_script_capture(script: &str, pkginfo: &Pkginfo) -> Result<String, ScriptError> {
    let path = write_script_to_temp(script)?;
    let output = spawn_capture_with_timeout(&path, pkginfo)?;
    let _ = std::fs::remove_file(&path);
    Ok(output)
}

fn write_script_to_temp(script: &str) -> Result<std::path::PathBuf, ScriptError> {
    let mut file = tempfile::Builder::new()
        .prefix("munkicheck-script-")
        .tempfile()
        .map_err(|e| ScriptError::Write(e.to_string()))?;
    file.write_all(script.as_bytes()).map_err(|e| ScriptError::Write(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.as_file().metadata().map_err(|e| ScriptError::Write(e.to_string()))?.permissions();
        perms.set_mode(0o700);
        file.as_file().set_permissions(perms).map_err(|e| ScriptError::Write(e.to_string()))?;
    }

    let (_, path) = file.keep().map_err(|e| ScriptError::Write(e.to_string()))?;

    if !is_executable::is_executable(&path) {
        let _ = std::fs::remove_file(&path);
        return Err(ScriptError::Exec(format!("{} is not executable after chmod", path.display())));
    }

    Ok(path)
}

fn pkginfo_stdin(pkginfo: &Pkginfo) -> Vec<u8> {
    serde_json::to_vec(pkginfo).unwrap_or_default()
}

fn spawn_with_timeout(path: &std::path::Path, pkginfo: &Pkginfo) -> Result<i32, ScriptError> {
    let mut child = Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ScriptError::Exec(e.to_string()))?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&pkginfo_stdin(pkginfo));
    }

    wait_with_timeout(&mut child).map(|status| status.code().unwrap_or(-1))
}

fn spawn_capture_with_timeout(path: &std::path::Path, pkginfo: &Pkginfo) -> Result<String, ScriptError> {
    let mut child = Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ScriptError::Exec(e.to_string()))?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&pkginfo_stdin(pkginfo));
    }

    wait_with_timeout(&mut child)?;

    let output = child.wait_with_output().map_err(|e| ScriptError::Exec(e.to_string()))?;
    String::from_utf8(output.stdout).map_err(|e| ScriptError::Exec(e.to_string()))
}

fn wait_with_timeout(child: &mut std::process::Child) -> Result<std::process::ExitStatus, ScriptError> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(|e| ScriptError::Exec(e.to_string()))? {
            return Ok(status);
        }
        if start.elapsed() > SCRIPT_TIMEOUT {
            let _ = child.kill();
            return Err(ScriptError::Timeout);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkginfo::Receipt;
    use std::collections::HashMap;

    fn facts() -> HostFacts {
        HostFacts {
            os_vers: "14.3".into(),
            arch: "arm64".into(),
            x86_64_capable: false,
            hostname: "host".into(),
            short_hostname: "host".into(),
            serial_number: "SN".into(),
            munki_version: "1.0".into(),
            machine_model: "Mac".into(),
            date: chrono::Utc::now(),
            console_user: None,
            ipv4_address: None,
            on_ac_power: true,
            applications: Vec::new(),
            installed_packages: HashMap::new(),
        }
    }

    fn minimal_pkginfo() -> Pkginfo {
        Pkginfo {
            name: "Test".into(),
            version: "1.0".into(),
            installer_type: None,
            installer_item_location: None,
            installer_item_hash: None,
            installer_item_size: None,
            installed_size: None,
            receipts: vec![],
            installs: vec![],
            requires: Default::default(),
            update_for: Default::default(),
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
    fn on_demand_items_are_never_present() {
        let mut pkginfo = minimal_pkginfo();
        pkginfo.on_demand = true;
        assert_eq!(evaluate(&pkginfo, &facts()), InstallState::NotPresent);
    }

    #[test]
    fn receipts_list_not_present_when_missing() {
        let mut pkginfo = minimal_pkginfo();
        pkginfo.receipts = vec![Receipt {
            packageid: "com.example.foo".into(),
            version: "1.0".into(),
            optional: false,
        }];
        assert_eq!(evaluate(&pkginfo, &facts()), InstallState::NotPresent);
    }

    #[test]
    fn receipts_list_needs_update_when_older() {
        let mut pkginfo = minimal_pkginfo();
        pkginfo.version = "2.0".into();
        pkginfo.receipts = vec![Receipt {
            packageid: "com.example.foo".into(),
            version: "2.0".into(),
            optional: false,
        }];
        let mut host = facts();
        host.installed_packages.insert("com.example.foo".into(), "1.0".into());
        assert_eq!(evaluate(&pkginfo, &host), InstallState::NeedsUpdate);
    }

    #[test]
    fn receipts_list_current_when_version_matches() {
        let mut pkginfo = minimal_pkginfo();
        pkginfo.version = "2.0".into();
        pkginfo.receipts = vec![Receipt {
            packageid: "com.example.foo".into(),
            version: "2.0".into(),
            optional: false,
        }];
        let mut host = facts();
        host.installed_packages.insert("com.example.foo".into(), "2.0".into());
        assert_eq!(evaluate(&pkginfo, &host), InstallState::Current);
    }

    #[test]
    fn optional_missing_receipt_does_not_block() {
        let mut pkginfo = minimal_pkginfo();
        pkginfo.receipts = vec![Receipt {
            packageid: "com.example.optional".into(),
            version: "1.0".into(),
            optional: true,
        }];
        assert_eq!(evaluate(&pkginfo, &facts()), InstallState::Current);
    }

    #[test]
    fn some_version_installed_matches_not_present() {
        let pkginfo = minimal_pkginfo();
        assert!(!some_version_installed(&pkginfo, &facts()));
    }

    #[test]
    fn optional_receipt_at_older_version_does_not_force_update() {
        let mut pkginfo = minimal_pkginfo();
        pkginfo.version = "2.0".into();
        pkginfo.receipts = vec![
            Receipt {
                packageid: "com.example.core".into(),
                version: "2.0".into(),
                optional: false,
            },
            Receipt {
                packageid: "com.example.addon".into(),
                version: "2.0".into(),
                optional: true,
            },
        ];
        let mut host = facts();
        host.installed_packages.insert("com.example.core".into(), "2.0".into());
        host.installed_packages.insert("com.example.addon".into(), "1.0".into());

        assert_eq!(evaluate(&pkginfo, &host), InstallState::Current);
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn installs_list_finds_app_at_direct_path_outside_inventory() {
        use crate::pkginfo::InstallsItem;

        let dir = tempfile::tempdir().unwrap();
        let app_path = dir.path().join("Custom.app");
        std::fs::create_dir_all(app_path.join("Contents")).unwrap();
        std::fs::write(
            app_path.join("Contents/Info.plist"),
            br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleIdentifier</key>
    <string>com.example.custom</string>
    <key>CFBundleShortVersionString</key>
    <string>2.0</string>
</dict>
</plist>
"#,
        )
        .unwrap();

        let mut pkginfo = minimal_pkginfo();
        pkginfo.version = "2.0".into();
        pkginfo.installs = vec![InstallsItem::Application {
            path: app_path.to_string_lossy().to_string(),
            bundle_identifier: Some("com.example.custom".into()),
            bundle_version: None,
            minimum_update_version: None,
        }];

        assert_eq!(evaluate(&pkginfo, &facts()), InstallState::Current);
    }
}
