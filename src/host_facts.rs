//! Session-stable host facts.
//!
//! Grounded on `package_store::macos::get_package_info`, which shells
//! out to `pkgutil --export-plist` and parses the resulting plist; this
//! module generalizes that pattern to `pkgutil --pkgs` / `--pkg-info-plist`
//! for the full installed-packages receipt map, and adds the rest of the
//! fact surface a session needs (os version, arch, hostname, serial,
//! applications inventory, power state).

use std::collections::HashMap;
use std::process::Command;

use serde_json::Value;

use crate::predicate::FactMap;

/// One entry in the host's application inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledApplication {
    pub name: String,
    pub path: String,
    pub bundle_id: Option<String>,
    pub version: Option<String>,
}

/// Lazily populated, session-stable facts about the local host.
#[derive(Debug, Clone)]
pub struct HostFacts {
    pub os_vers: String,
    pub arch: String,
    pub x86_64_capable: bool,
    pub hostname: String,
    pub short_hostname: String,
    pub serial_number: String,
    pub munki_version: String,
    pub machine_model: String,
    pub date: chrono::DateTime<chrono::Utc>,
    pub console_user: Option<String>,
    pub ipv4_address: Option<String>,
    pub on_ac_power: bool,
    pub applications: Vec<InstalledApplication>,
    pub installed_packages: HashMap<String, String>,
}

impl HostFacts {
    /// Collect facts from the live host. Any single probe that fails
    /// (missing binary, unexpected output) degrades to a sensible
    /// default rather than aborting fact collection — §7's recovery
    /// policy applies here too, since a missing fact should not prevent
    /// a session from starting.
    pub fn collect() -> HostFacts {
        let hostname = hostname();
        let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

        HostFacts {
            os_vers: os_version(),
            arch: std::env::consts::ARCH.to_string(),
            x86_64_capable: is_x86_64_capable(),
            hostname: hostname.clone(),
            short_hostname,
            serial_number: serial_number(),
            munki_version: env!("CARGO_PKG_VERSION").to_string(),
            machine_model: machine_model(),
            date: chrono::Utc::now(),
            console_user: console_user(),
            ipv4_address: ipv4_address(),
            on_ac_power: on_ac_power(),
            applications: enumerate_applications(),
            installed_packages: installed_packages(),
        }
    }

    /// Project these facts into the untyped map the predicate evaluator
    /// consumes.
    pub fn as_fact_map(&self) -> FactMap {
        let mut map = FactMap::new();
        map.insert("os_vers".into(), Value::String(self.os_vers.clone()));
        map.insert("arch".into(), Value::String(self.arch.clone()));
        map.insert("x86_64_capable".into(), Value::Bool(self.x86_64_capable));
        map.insert("hostname".into(), Value::String(self.hostname.clone()));
        map.insert("serial_number".into(), Value::String(self.serial_number.clone()));
        map.insert("munki_version".into(), Value::String(self.munki_version.clone()));
        map.insert("machine_model".into(), Value::String(self.machine_model.clone()));
        map.insert("date".into(), Value::String(self.date.to_rfc3339()));
        if let Some(ref user) = self.console_user {
            map.insert("console_user".into(), Value::String(user.clone()));
        }
        if let Some(ref ip) = self.ipv4_address {
            map.insert("ipv4_address".into(), Value::String(ip.clone()));
        }
        map.insert("on_ac_power".into(), Value::Bool(self.on_ac_power));
        map
    }

    /// Find an application by bundle id, falling back to name, for an
    /// `installs` entry of type `application` with no usable direct path.
    pub fn find_application(&self, bundle_id: Option<&str>, name: Option<&str>) -> Option<&InstalledApplication> {
        if let Some(bundle_id) = bundle_id {
            if let Some(app) = self.applications.iter().find(|a| a.bundle_id.as_deref() == Some(bundle_id)) {
                return Some(app);
            }
        }
        if let Some(name) = name {
            return self.applications.iter().find(|a| a.name == name);
        }
        None
    }
}

#[cfg(target_os = "macos")]
fn os_version() -> String {
    run_capture("sw_vers", &["-productVersion"]).unwrap_or_else(|| "0.0".to_string())
}

#[cfg(not(target_os = "macos"))]
fn os_version() -> String {
    "0.0".to_string()
}

#[cfg(target_os = "macos")]
fn is_x86_64_capable() -> bool {
    std::env::consts::ARCH == "x86_64"
        || run_capture("sysctl", &["-n", "hw.optional.x86_64"])
            .map(|s| s.trim() == "1")
            .unwrap_or(false)
}

#[cfg(not(target_os = "macos"))]
fn is_x86_64_capable() -> bool {
    std::env::consts::ARCH == "x86_64"
}

fn hostname() -> String {
    run_capture("hostname", &[]).unwrap_or_else(|| "localhost".to_string())
}

#[cfg(target_os = "macos")]
fn serial_number() -> String {
    // `ioreg -l` output contains a line like: "IOPlatformSerialNumber" = "C02ABC123DEF"
    run_capture("ioreg", &["-c", "IOPlatformExpertDevice", "-d", "2"])
        .and_then(|output| {
            output.lines().find_map(|line| {
                if line.contains("IOPlatformSerialNumber") {
                    line.split('"').nth(3).map(|s| s.to_string())
                } else {
                    None
                }
            })
        })
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

#[cfg(not(target_os = "macos"))]
fn serial_number() -> String {
    "UNKNOWN".to_string()
}

#[cfg(target_os = "macos")]
fn machine_model() -> String {
    run_capture("sysctl", &["-n", "hw.model"]).unwrap_or_else(|| "Unknown".to_string())
}

#[cfg(not(target_os = "macos"))]
fn machine_model() -> String {
    "Unknown".to_string()
}

fn console_user() -> Option<String> {
    std::env::var("USER").ok().or_else(|| std::env::var("USERNAME").ok())
}

fn ipv4_address() -> Option<String> {
    // Best-effort: shell out to a tool known to exist on macOS/Linux
    // rather than pull in a full network-interface-enumeration crate
    // for a single informational fact.
    run_capture("hostname", &["-I"])
        .or_else(|| run_capture("ipconfig", &["getifaddr", "en0"]))
        .map(|s| s.split_whitespace().next().unwrap_or("").to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(target_os = "macos")]
fn on_ac_power() -> bool {
    run_capture("pmset", &["-g", "batt"])
        .map(|s| s.contains("AC Power"))
        .unwrap_or(true)
}

#[cfg(not(target_os = "macos"))]
fn on_ac_power() -> bool {
    true
}

#[cfg(target_os = "macos")]
fn enumerate_applications() -> Vec<InstalledApplication> {
    let mut apps = Vec::new();
    let roots = ["/Applications", "/Applications/Utilities"];

    for root in roots.iter() {
        let entries = match std::fs::read_dir(root) {
            Ok(v) => v,
            Err(_) => continue,
        };

        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("app") {
                continue;
            }

            let info_plist = path.join("Contents/Info.plist");
            let (bundle_id, version) = read_bundle_info(&info_plist).unwrap_or((None, None));

            apps.push(InstalledApplication {
                name: path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string(),
                path: path.to_string_lossy().to_string(),
                bundle_id,
                version,
            });
        }
    }

    apps
}

#[cfg(target_os = "macos")]
pub(crate) fn read_bundle_info(info_plist: &std::path::Path) -> Option<(Option<String>, Option<String>)> {
    #[derive(serde::Deserialize)]
    struct Info {
        #[serde(rename = "CFBundleIdentifier")]
        bundle_id: Option<String>,
        #[serde(rename = "CFBundleShortVersionString")]
        short_version: Option<String>,
    }

    let file = std::fs::File::open(info_plist).ok()?;
    let info: Info = plist::from_reader(file).ok()?;
    Some((info.bundle_id, info.short_version))
}

#[cfg(not(target_os = "macos"))]
fn enumerate_applications() -> Vec<InstalledApplication> {
    Vec::new()
}

/// Query the platform package database for every installed receipt,
/// mapping package id to installed version.
#[cfg(target_os = "macos")]
fn installed_packages() -> HashMap<String, String> {
    let mut map = HashMap::new();

    let pkgs = match run_capture("pkgutil", &["--pkgs"]) {
        Some(v) => v,
        None => return map,
    };

    for pkgid in pkgs.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(version) = pkg_info_version(pkgid) {
            map.insert(pkgid.to_string(), version);
        }
    }

    map
}

#[cfg(target_os = "macos")]
fn pkg_info_version(pkgid: &str) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct PkgInfoPlist {
        #[serde(rename = "pkg-version")]
        pkg_version: String,
    }

    let output = Command::new("pkgutil")
        .args(&["--pkg-info-plist", pkgid])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let plist: PkgInfoPlist = plist::from_bytes(&output.stdout).ok()?;
    Some(plist.pkg_version)
}

#[cfg(not(target_os = "macos"))]
fn installed_packages() -> HashMap<String, String> {
    HashMap::new()
}

fn run_capture(cmd: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(cmd).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok().map(|s| s.trim().to_string())
}
