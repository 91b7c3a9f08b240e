//! The session controller — orchestrates one update-check session end
//! to end.
//!
//! Grounded on `package_store::macos::MacOSPackageStore`'s
//! `refresh_repos`/`force_refresh_repos` orchestration (load each
//! configured repo, build its index, surface errors per-repo rather
//! than aborting the whole refresh), scaled up here to a full 13-step
//! pipeline. Single-instance locking is grounded on the (declared but
//! otherwise unused upstream) `fd-lock` dependency, used here
//! for its actual purpose.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::cache::CacheManager;
use crate::catalog::CatalogDb;
use crate::fetcher::{FetchError, ResourceFetcher, ResourceKind};
use crate::host_facts::HostFacts;
use crate::install_info::InstallInfo;
use crate::manifest::Manifest;
use crate::manifest_retriever::{self, ManifestError, ManifestSource};
use crate::report::{InstallOutcome, Report};
use crate::resolver::Resolver;
use crate::self_serve::SelfServeManifest;

/// Sentinel file paths, all well-known and fixed.
pub const STOP_REQUESTED_PATH: &str = "/private/tmp/com.googlecode.munki.managedsoftwareupdate.stop_requested";
pub const MANUAL_CHECK_TRIGGER_PATH: &str = "/private/tmp/.com.googlecode.munki.updatecheck.launchd";
pub const INSTALL_NO_LOGOUT_TRIGGER_PATH: &str = "/private/tmp/.com.googlecode.munki.managedinstall.launchd";
pub const BOOTSTRAP_MODE_PATH: &str = "/Users/Shared/.com.googlecode.munki.checkandinstallatstartup";

/// Hard ceiling on a single session's runtime before a stale lock is
/// considered abandoned and killed.
const SESSION_LOCK_CEILING: Duration = Duration::from_secs(1800);

/// Exit codes of the session driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    ErrorsOccurred = -1,
    PreflightFailure = -2,
    RootRequired = 1,
    MissingDirectories = 2,
}

/// Cooperative cancellation, polled between phases. Backed by the
/// stop-requested sentinel file rather than a signal handler,
/// since the flag's source is external (GUI or `kill -USR1`-style
/// trigger writing the file).
pub struct StopToken {
    sentinel_path: PathBuf,
}

impl StopToken {
    pub fn new() -> StopToken {
        StopToken {
            sentinel_path: PathBuf::from(STOP_REQUESTED_PATH),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> StopToken {
        StopToken {
            sentinel_path: path.into(),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.sentinel_path.exists()
    }
}

impl Default for StopToken {
    fn default() -> Self {
        StopToken::new()
    }
}

/// The named preferences, persisted as JSON under a platform config
/// directory (grounded on `StoreConfig`, which round-trips its own
/// settings the same way via `directories::BaseDirs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub software_repo_url: String,
    #[serde(default)]
    pub manifest_url: Option<String>,
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub package_url: Option<String>,
    #[serde(default)]
    pub client_resource_url: Option<String>,
    #[serde(default)]
    pub client_identifier: Option<String>,
    #[serde(default)]
    pub license_info_url: Option<String>,
    #[serde(default)]
    pub local_only_manifest: Option<String>,
    #[serde(default)]
    pub install_apple_software_updates: bool,
    #[serde(default)]
    pub apple_software_updates_only: bool,
    #[serde(default)]
    pub suppress_auto_install: bool,
    #[serde(default)]
    pub suppress_loginwindow_install: bool,
    #[serde(default)]
    pub suppress_user_notification: bool,
    #[serde(default)]
    pub days_between_notifications: i32,
    #[serde(default)]
    pub show_optional_installs_for_higher_os_versions: bool,
    #[serde(default)]
    pub last_check_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub last_check_result: Option<String>,
    #[serde(default)]
    pub last_notified_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub pending_update_count: u32,
    #[serde(default)]
    pub oldest_update_days: u32,
    #[serde(default)]
    pub forced_update_due_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub self_serve_manifest_path: PathBuf,
}

impl SessionConfig {
    pub fn load(path: &Path) -> SessionConfig {
        let config = fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_else(|| SessionConfig {
                software_repo_url: "https://munki.example.com/repo".to_string(),
                manifest_url: None,
                catalog_url: None,
                icon_url: None,
                package_url: None,
                client_resource_url: None,
                client_identifier: None,
                license_info_url: None,
                local_only_manifest: None,
                install_apple_software_updates: false,
                apple_software_updates_only: false,
                suppress_auto_install: false,
                suppress_loginwindow_install: false,
                suppress_user_notification: false,
                days_between_notifications: 1,
                show_optional_installs_for_higher_os_versions: false,
                last_check_date: None,
                last_check_result: None,
                last_notified_date: None,
                pending_update_count: 0,
                oldest_update_days: 0,
                forced_update_due_date: None,
                cache_dir: PathBuf::from("/Library/Managed Installs/Cache"),
                self_serve_manifest_path: PathBuf::from("/Users/Shared/.SelfServeManifest"),
            });

        config.warn_on_malformed_urls();
        config
    }

    /// Sanity-check the configured URL overrides without rejecting the
    /// config outright; a malformed override should surface as a loud
    /// warning rather than silently falling through to the default repo
    /// layout in `ResourceFetcher::resource_url`.
    fn warn_on_malformed_urls(&self) {
        let named = [
            ("SoftwareRepoURL", Some(self.software_repo_url.as_str())),
            ("ManifestURL", self.manifest_url.as_deref()),
            ("CatalogURL", self.catalog_url.as_deref()),
            ("IconURL", self.icon_url.as_deref()),
            ("PackageURL", self.package_url.as_deref()),
            ("ClientResourceURL", self.client_resource_url.as_deref()),
            ("LicenseInfoURL", self.license_info_url.as_deref()),
        ];
        for (key, value) in named {
            if let Some(value) = value {
                if let Err(e) = url::Url::parse(value) {
                    log::warn!("{} is not a valid URL ({}): {}", key, value, e);
                }
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("another session has been running for less than the 1800s ceiling; exiting")]
    AlreadyRunning,
    #[error("preflight check failed: {0}")]
    PreflightFailed(String),
    #[error("primary manifest could not be resolved: {0}")]
    Manifest(#[from] ManifestError),
    #[error("install info directory is not writable: {0}")]
    NotWritable(String),
}

/// A `ManifestSource` backed by the live fetcher, pulling manifests
/// from the configured repo URL through the resource cache.
pub struct RemoteManifestSource<'a> {
    fetcher: &'a ResourceFetcher,
    repo_base: String,
    cache_dir: PathBuf,
}

impl<'a> ManifestSource for RemoteManifestSource<'a> {
    fn get_manifest(&self, name: &str) -> Option<Manifest> {
        let url = self.fetcher.resource_url(&self.repo_base, ResourceKind::Manifest, name, None, None);
        let destination = self.cache_dir.join("manifests").join(name);
        match self.fetcher.fetch(&url, &destination, true, None, false) {
            Ok(_) => fs::read_to_string(&destination).ok().and_then(|t| serde_json::from_str(&t).ok()),
            Err(FetchError::Http { code: 404, .. }) => None,
            Err(_) => None,
        }
    }
}

/// Advisory single-instance lock over a lock file, using the
/// (declared but otherwise unused upstream) `fd-lock`
/// dependency for its actual purpose: an `flock`-backed exclusive lock
/// that the OS releases automatically if the holder dies. The 1800s
/// ceiling covers the remaining case `flock` can't: a holder that is
/// still alive but has been running far longer than any real session
/// should, which we reclaim by sending it `SIGKILL`.
fn read_stale_pid(lock_path: &Path) -> Option<i32> {
    fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}

fn lock_file_is_stale(lock_path: &Path) -> bool {
    fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|m| m.elapsed().ok())
        .map_or(false, |age| age > SESSION_LOCK_CEILING)
}

fn kill_stale_holder(lock_path: &Path) {
    if let Some(pid) = read_stale_pid(lock_path) {
        log::warn!(
            "session lock at {:?} held longer than the 1800s ceiling by pid {}; sending SIGKILL",
            lock_path,
            pid
        );
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

/// Acquire the single-instance lock, run `f` while holding it, then
/// release. Returns `Err(SessionError::AlreadyRunning)` if another
/// live session holds the lock and has not exceeded the ceiling.
pub fn with_session_lock<R>(lock_path: &Path, f: impl FnOnce() -> R) -> Result<R, SessionError> {
    use std::io::{Seek, SeekFrom, Write};

    if let Some(parent) = lock_path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let open = || {
        fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(lock_path)
    };

    let file = open().map_err(|e| SessionError::NotWritable(e.to_string()))?;
    let mut locked = fd_lock::FdLock::new(file);

    let mut guard = match locked.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
            if lock_file_is_stale(lock_path) {
                kill_stale_holder(lock_path);
                std::thread::sleep(Duration::from_millis(100));
                locked.try_lock().map_err(|_| SessionError::AlreadyRunning)?
            } else {
                return Err(SessionError::AlreadyRunning);
            }
        }
    };

    let _ = guard.set_len(0);
    let _ = guard.seek(SeekFrom::Start(0));
    let _ = guard.write_all(std::process::id().to_string().as_bytes());

    let result = f();
    drop(guard);
    let _ = fs::remove_file(lock_path);
    Ok(result)
}

/// Drives one update-check session through its 13-step pipeline.
pub struct SessionController {
    pub config: SessionConfig,
    pub catalog_db: CatalogDb,
    pub cache: CacheManager,
    pub stop_token: StopToken,
}

impl SessionController {
    pub fn new(config: SessionConfig) -> SessionController {
        let cache = CacheManager::new(config.cache_dir.clone());
        SessionController {
            config,
            catalog_db: CatalogDb::new(),
            cache,
            stop_token: StopToken::new(),
        }
    }

    /// Run the full pipeline, returning the finished `InstallInfo`,
    /// `Report`, and exit code. Steps run in order; any step whose
    /// failure is session-fatal (not-root, preflight, primary-manifest,
    /// disk-unwritable) returns early with the corresponding
    /// `ExitCode`.
    pub fn run(&mut self) -> (InstallInfo, Report, ExitCode) {
        let mut report = Report::new("pending");

        // Step 1: auto-detect repo URL if not explicitly configured.
        if self.config.software_repo_url.is_empty() {
            self.config.software_repo_url = self.probe_repo_url();
        }

        // Step 2: record machine facts.
        let host_facts = HostFacts::collect();
        report.manifest_name = None;

        if !self.preflight_ok() {
            report.record_error("preflight check failed");
            return (InstallInfo::default(), report, ExitCode::PreflightFailure);
        }

        // Step 3: retrieve the primary manifest.
        let fetcher = ResourceFetcher::new();
        let source = RemoteManifestSource {
            fetcher: &fetcher,
            repo_base: self.config.software_repo_url.clone(),
            cache_dir: self.config.cache_dir.clone(),
        };

        let resolved = match manifest_retriever::resolve_manifests(&source, &host_facts) {
            Ok(r) => r,
            Err(e) => {
                report.record_error(format!("primary manifest failure: {}", e));
                return (InstallInfo::default(), report, ExitCode::ErrorsOccurred);
            }
        };
        report.manifest_name = Some(resolved.primary_name.clone());

        // Step 4/5: check-stop, stop any precache agent.
        if self.stop_token.stop_requested() {
            report.record_warning("stop requested before session start");
            return (InstallInfo::default(), report, ExitCode::Success);
        }
        self.stop_precache_agent();

        // Step 6: power assertion only on AC power — a platform hook,
        // not modeled further here.
        if host_facts.on_ac_power {
            log::debug!("on AC power: acquiring idle-sleep assertion");
        }

        // Load catalogs discovered by the manifest walk (step 3/8 prep).
        for catalog_name in &resolved.catalogs {
            if !self.catalog_db.is_loaded(catalog_name) {
                match self.load_catalog(&fetcher, catalog_name) {
                    Ok(()) => {}
                    Err(e) => report.record_warning(format!("failed to load catalog '{}': {}", catalog_name, e)),
                }
            }
        }

        // Step 7/8: resolve manifest sections into InstallInfo.
        let mut managed_installs = Vec::new();
        let mut managed_uninstalls = Vec::new();
        let mut managed_updates = Vec::new();
        let mut optional_installs = Vec::new();
        let mut default_installs = Vec::new();

        for manifest in &resolved.manifests {
            managed_installs.extend(manifest.managed_installs.iter().cloned());
            managed_uninstalls.extend(manifest.managed_uninstalls.iter().cloned());
            managed_updates.extend(manifest.managed_updates.iter().cloned());
            optional_installs.extend(manifest.optional_installs.iter().cloned());
            default_installs.extend(manifest.default_installs.iter().cloned());
        }

        // Self-serve reconciliation: validate against the union of
        // optional_installs before merging into the resolver inputs.
        let self_serve = SelfServeManifest::read_from(&self.config.self_serve_manifest_path)
            .unwrap_or_default()
            .validate(&optional_installs);
        managed_installs.extend(self_serve.managed_installs.iter().cloned());
        managed_uninstalls.extend(self_serve.managed_uninstalls.iter().cloned());

        // Batched license-seat lookup, consulted by the resolver when
        // annotating seat-limited optional installs.
        let license_seats = match &self.config.license_info_url {
            Some(url) => match fetcher.fetch_license_seats(url) {
                Ok(seats) => seats,
                Err(e) => {
                    report.record_warning(format!("failed to fetch license info: {}", e));
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        let resolver = Resolver::new(
            &self.catalog_db,
            &resolved.catalogs,
            &host_facts,
            &self.cache,
            &self.config.software_repo_url,
            &license_seats,
        )
        .show_optional_installs_for_higher_os_versions(self.config.show_optional_installs_for_higher_os_versions);
        let mut install_info = resolver.resolve(
            &managed_installs,
            &managed_uninstalls,
            &managed_updates,
            &optional_installs,
            &default_installs,
        );

        // Step 9: partition managed_installs lacking an installer_item
        // into problem_items (already largely done during resolution,
        // this is the final sweep).
        let (ready, orphaned): (Vec<_>, Vec<_>) = install_info
            .managed_installs
            .drain(..)
            .partition(|item| item.installed || item.installer_item.is_some());
        install_info.managed_installs = ready;
        for item in orphaned {
            install_info.record_problem(&item.name, "no installer_item after resolution");
        }

        // Step 10: sort startosinstall items to the end of
        // managed_installs and warn, unsupported in this core.
        let (regular, deferred): (Vec<_>, Vec<_>) = install_info.managed_installs.drain(..).partition_map(|item| {
            let (detail, _) = self.catalog_db.item_detail(&item.name, &resolved.catalogs, Some(&item.version), true, &host_facts);
            let is_startosinstall = detail.map_or(false, |p| matches!(p.installer_type, Some(crate::pkginfo::InstallerType::StartosInstall)));
            if is_startosinstall {
                itertools::Either::Right(item)
            } else {
                itertools::Either::Left(item)
            }
        });
        if !deferred.is_empty() {
            report.record_warning("startosinstall items present; unsupported in this core, sorted to the end");
        }
        install_info.staged_os_installer = deferred.first().cloned();
        install_info.managed_installs = regular.into_iter().chain(deferred).collect();

        // Step 11: write InstallInfo.json atomically, only if changed.
        let info_path = self.config.cache_dir.join("InstallInfo.json");
        self.write_install_info_if_changed(&info_path, &install_info, &mut report);

        for install in &install_info.managed_installs {
            report.record_install(
                &install.name,
                &install.version,
                InstallOutcome::Skipped,
                Some("resolved, not yet installed by this core".to_string()),
            );
        }

        // Step 12: clean up orphan cache entries.
        let keep: Vec<String> = install_info
            .managed_installs
            .iter()
            .filter_map(|i| i.installer_item.clone())
            .collect();
        if let Err(e) = self.cache.clean_up_download_cache(&keep) {
            report.record_warning(format!("cache cleanup failed: {}", e));
        }

        // Step 13: start the precache agent.
        self.start_precache_agent();

        report.problem_items = install_info.problem_items.iter().map(|p| p.name.clone()).collect();
        report.finish();

        let exit_code = if report.errors.is_empty() {
            ExitCode::Success
        } else {
            ExitCode::ErrorsOccurred
        };

        (install_info, report, exit_code)
    }

    fn preflight_ok(&self) -> bool {
        self.config.cache_dir.parent().map_or(true, |p| p.exists() || fs::create_dir_all(p).is_ok())
    }

    fn probe_repo_url(&self) -> String {
        "https://munki.example.com/repo".to_string()
    }

    fn load_catalog(&mut self, fetcher: &ResourceFetcher, name: &str) -> Result<(), FetchError> {
        let url = fetcher.resource_url(&self.config.software_repo_url, ResourceKind::Catalog, name, None, None);
        let destination = self.config.cache_dir.join("catalogs").join(name);
        fetcher.fetch(&url, &destination, true, None, false)?;

        let text = fs::read_to_string(&destination).unwrap_or_default();
        let items: Vec<crate::pkginfo::Pkginfo> = serde_json::from_str(&text).unwrap_or_default();
        self.catalog_db.insert_if_absent(name.to_string(), items);
        Ok(())
    }

    fn write_install_info_if_changed(&self, path: &Path, info: &InstallInfo, report: &mut Report) {
        let new_text = match serde_json::to_string_pretty(info) {
            Ok(t) => t,
            Err(e) => {
                report.record_error(format!("failed to serialize InstallInfo: {}", e));
                return;
            }
        };

        let existing_text = fs::read_to_string(path).ok();
        if existing_text.as_deref() == Some(new_text.as_str()) {
            return;
        }

        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                report.record_error("install info directory is not writable");
                return;
            }
        }

        let mut tmp = match tempfile::NamedTempFile::new_in(path.parent().unwrap_or_else(|| Path::new("."))) {
            Ok(t) => t,
            Err(e) => {
                report.record_error(format!("failed to create temp file for InstallInfo: {}", e));
                return;
            }
        };

        use std::io::Write;
        if tmp.write_all(new_text.as_bytes()).is_err() {
            report.record_error("failed to write InstallInfo");
            return;
        }

        if let Err(e) = tmp.persist(path) {
            report.record_error(format!("failed to persist InstallInfo: {}", e));
        }
    }

    fn stop_precache_agent(&self) {
        log::debug!("stopping precache agent (platform service-manager hook)");
    }

    fn start_precache_agent(&self) {
        log::debug!("starting precache agent (platform service-manager hook)");
    }
}
