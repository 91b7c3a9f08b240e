//! The cache / precache manager.
//!
//! Grounded on `store_config.rs`'s `package_dir`/`cache_dir` path
//! layout and `repo.rs`'s `download_path`, generalized to a cache
//! directory layout (`pkgs/`, `icons/`, `client_resources/`) plus
//! disk-space and license-seat bookkeeping.

use std::fs;
use std::path::{Path, PathBuf};

use crate::fetcher::{FetchError, ResourceFetcher, ResourceKind};
use crate::pkginfo::Pkginfo;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("not enough free disk space: need {needed} bytes, have {available} bytes")]
    InsufficientDiskSpace { needed: u64, available: u64 },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("filesystem error: {0}")]
    FileSystem(String),
}

/// The on-disk cache root, laid out the way `StoreConfig` lays out
/// `package_dir`/`cache_dir`: one subdirectory
/// per resource kind, all rooted under a single cache directory.
pub struct CacheManager {
    root: PathBuf,
    fetcher: ResourceFetcher,
}

impl CacheManager {
    pub fn new(root: PathBuf) -> CacheManager {
        CacheManager {
            root,
            fetcher: ResourceFetcher::new(),
        }
    }

    pub fn pkgs_dir(&self) -> PathBuf {
        self.root.join("pkgs")
    }

    pub fn icons_dir(&self) -> PathBuf {
        self.root.join("icons")
    }

    pub fn client_resources_dir(&self) -> PathBuf {
        self.root.join("client_resources")
    }

    fn package_path(&self, pkginfo: &Pkginfo) -> PathBuf {
        let location = pkginfo
            .installer_item_location
            .as_deref()
            .unwrap_or(pkginfo.reference().as_str());
        self.pkgs_dir().join(location)
    }

    /// Available free bytes on the filesystem backing the cache root.
    /// Falls back to `u64::MAX` (never blocks) when the platform call
    /// is unavailable, the same conservative-degrade policy used
    /// throughout host-fact collection.
    pub fn available_disk_space(&self) -> u64 {
        available_disk_space_for(&self.root)
    }

    /// Whether caching `pkginfo`'s installer item would leave at least
    /// its declared `installed_size` free afterward. Monotonic in
    /// `installed_size`: a smaller item is never rejected when a larger
    /// one at the same path would be accepted.
    pub fn enough_disk_space_for(&self, pkginfo: &Pkginfo) -> bool {
        let needed = pkginfo.installer_item_size.unwrap_or(0);
        self.available_disk_space() >= needed
    }

    /// Download and verify `pkginfo`'s installer item into the cache,
    /// resuming a partial download if one exists. A destination already
    /// present in the cache is trusted as-is and never re-fetched.
    pub fn cache_package(&self, repo_base: &str, pkginfo: &Pkginfo) -> Result<bool, CacheError> {
        if !self.enough_disk_space_for(pkginfo) {
            return Err(CacheError::InsufficientDiskSpace {
                needed: pkginfo.installer_item_size.unwrap_or(0),
                available: self.available_disk_space(),
            });
        }

        let location = pkginfo
            .installer_item_location
            .as_deref()
            .ok_or_else(|| CacheError::FileSystem("pkginfo has no installer_item_location".to_string()))?;

        let destination = self.package_path(pkginfo);
        if destination.exists() {
            return Ok(false);
        }

        let url = self.fetcher.resource_url(
            repo_base,
            ResourceKind::Package,
            location,
            pkginfo.package_url.as_deref(),
            pkginfo.package_complete_url.as_deref(),
        );

        let did_download = self.fetcher.fetch(
            &url,
            &destination,
            true,
            pkginfo.installer_item_hash.as_deref(),
            pkginfo.installer_item_hash.is_some(),
        )?;

        Ok(did_download)
    }

    pub fn cache_icon(&self, repo_base: &str, icon_name: &str) -> Result<bool, CacheError> {
        let url = self.fetcher.resource_url(repo_base, ResourceKind::Icon, icon_name, None, None);
        let destination = self.icons_dir().join(icon_name);
        Ok(self.fetcher.fetch(&url, &destination, true, None, false)?)
    }

    pub fn cache_client_resource(&self, repo_base: &str, name: &str) -> Result<bool, CacheError> {
        let url = self.fetcher.resource_url(repo_base, ResourceKind::ClientResource, name, None, None);
        let destination = self.client_resources_dir().join(name);
        Ok(self.fetcher.fetch(&url, &destination, true, None, false)?)
    }

    /// Remove every cached package whose installer item is not
    /// referenced by `keep` (the set of installer_item_location values
    /// still scheduled for install in the current `InstallInfo`). Spec
    /// §8 invariant 6: items in `keep` are never removed.
    pub fn clean_up_download_cache(&self, keep: &[String]) -> Result<Vec<PathBuf>, CacheError> {
        let mut removed = Vec::new();
        let dir = self.pkgs_dir();

        if !dir.exists() {
            return Ok(removed);
        }

        for entry in fs::read_dir(&dir).map_err(|e| CacheError::FileSystem(e.to_string()))? {
            let entry = entry.map_err(|e| CacheError::FileSystem(e.to_string()))?;
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();

            if keep.iter().any(|k| k.as_str() == name) {
                continue;
            }

            let path = entry.path();
            if path.is_file() {
                fs::remove_file(&path).map_err(|e| CacheError::FileSystem(e.to_string()))?;
                removed.push(path);
            }
        }

        Ok(removed)
    }

    /// Remove a single cached item by its installer_item_location,
    /// used when an item's applicability changes mid-session (spec
    /// §4.9 `uncache`).
    pub fn uncache(&self, installer_item_location: &str) -> Result<(), CacheError> {
        let path = self.pkgs_dir().join(installer_item_location);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| CacheError::FileSystem(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn available_disk_space_for(path: &Path) -> u64 {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let cpath = match CString::new(path.to_string_lossy().as_bytes()) {
        Ok(c) => c,
        Err(_) => return u64::MAX,
    };

    unsafe {
        let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
        if libc::statvfs(cpath.as_ptr(), stat.as_mut_ptr()) != 0 {
            return u64::MAX;
        }
        let stat = stat.assume_init();
        (stat.f_bavail as u64) * (stat.f_frsize as u64)
    }
}

#[cfg(not(unix))]
fn available_disk_space_for(_path: &Path) -> u64 {
    u64::MAX
}

/// Whether `name` still has at least one license seat available,
/// looked up in a batched `{name: seats}` map already fetched from
/// `LicenseInfoURL` (see `ResourceFetcher::fetch_license_seats`).
/// Absent names aren't seat-limited. Only the `seats > 0` variant is
/// implemented; per-seat accounting of who holds a seat is not tracked
/// (see DESIGN.md Open Question 2).
pub fn seats_available(seats: &std::collections::HashMap<String, i64>, name: &str) -> Option<bool> {
    seats.get(name).map(|&n| n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkginfo::StringOrList;

    fn pkginfo(name: &str, version: &str, size: Option<u64>) -> Pkginfo {
        Pkginfo {
            name: name.into(),
            version: version.into(),
            installer_type: None,
            installer_item_location: Some(format!("{}-{}.pkg", name, version)),
            installer_item_hash: None,
            installer_item_size: size,
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
    fn enough_disk_space_is_monotonic_in_installed_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path().to_path_buf());

        let small = pkginfo("Small", "1.0", Some(1));
        let huge = pkginfo("Huge", "1.0", Some(u64::MAX - 1));

        // Whatever the real available space is, a 1-byte item is
        // never rejected when a u64::MAX-ish item would be accepted.
        if cache.enough_disk_space_for(&huge) {
            assert!(cache.enough_disk_space_for(&small));
        }
    }

    #[test]
    fn clean_up_download_cache_preserves_kept_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path().to_path_buf());
        fs::create_dir_all(cache.pkgs_dir()).unwrap();
        fs::write(cache.pkgs_dir().join("Keep-1.0.pkg"), b"data").unwrap();
        fs::write(cache.pkgs_dir().join("Drop-1.0.pkg"), b"data").unwrap();

        let removed = cache.clean_up_download_cache(&["Keep-1.0.pkg".to_string()]).unwrap();

        assert_eq!(removed.len(), 1);
        assert!(cache.pkgs_dir().join("Keep-1.0.pkg").exists());
        assert!(!cache.pkgs_dir().join("Drop-1.0.pkg").exists());
    }

    #[test]
    fn seats_available_true_when_seats_remain() {
        let mut seats = std::collections::HashMap::new();
        seats.insert("AppA".to_string(), 3i64);
        assert_eq!(seats_available(&seats, "AppA"), Some(true));
    }

    #[test]
    fn seats_available_false_when_exhausted() {
        let mut seats = std::collections::HashMap::new();
        seats.insert("AppA".to_string(), 0i64);
        assert_eq!(seats_available(&seats, "AppA"), Some(false));
    }

    #[test]
    fn seats_available_none_when_not_seat_limited() {
        let seats = std::collections::HashMap::new();
        assert_eq!(seats_available(&seats, "AppA"), None);
    }
}
