//! The Pkginfo data model.
//!
//! Grounded on `types/mod.rs`'s `Package` struct (optional fields,
//! `#[serde(default = "HashMap::new")]` tolerance for forward
//! compatibility) generalized to the Munki-shaped Pkginfo fields.
//! `requires`/`update_for` accept either a bare string or a list in the
//! source data; this is handled with a manual `Deserialize` impl in the
//! same style as `ConfigPath`/`PackageKey`'s string-or-structured
//! deserializers.

use serde::de::{Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tolerant wrapper: deserializes either a single string or a list of
/// strings into a `Vec<String>`. Used for `requires` and `update_for`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StringOrList(pub Vec<String>);

impl StringOrList {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for StringOrList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;

        impl<'de> Visitor<'de> for V {
            type Value = StringOrList;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string or a list of strings")
            }

            fn visit_str<E>(self, v: &str) -> Result<StringOrList, E>
            where
                E: serde::de::Error,
            {
                Ok(StringOrList(vec![v.to_string()]))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<StringOrList, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element::<String>()? {
                    items.push(item);
                }
                Ok(StringOrList(items))
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// Parse a `name-version` / `name--version` manifest item reference
/// into `(name, version)`. Splits on the last hyphen, preferring a `--`
/// separator when present.
pub fn parse_item_reference(item: &str) -> (String, Option<String>) {
    if let Some(idx) = item.find("--") {
        let (name, rest) = item.split_at(idx);
        let version = &rest[2..];
        if !version.is_empty() {
            return (name.to_string(), Some(version.to_string()));
        }
    }

    if let Some(idx) = item.rfind('-') {
        // Only treat this as a version split if what follows looks like
        // a version (starts with a digit) — otherwise a hyphenated bare
        // name (e.g. "Google-Chrome") would be misparsed.
        let (name, rest) = item.split_at(idx);
        let candidate = &rest[1..];
        if candidate.chars().next().map_or(false, |c| c.is_ascii_digit()) {
            return (name.to_string(), Some(candidate.to_string()));
        }
    }

    (item.to_string(), None)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstallerType {
    Pkg,
    Nopkg,
    CopyFromDmg,
    StageOsInstaller,
    StartosInstall,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub packageid: String,
    pub version: String,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum InstallsItem {
    Application {
        path: String,
        #[serde(rename = "CFBundleIdentifier", skip_serializing_if = "Option::is_none")]
        bundle_identifier: Option<String>,
        #[serde(rename = "CFBundleShortVersionString", skip_serializing_if = "Option::is_none")]
        bundle_version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        minimum_update_version: Option<String>,
    },
    Bundle {
        path: String,
        #[serde(rename = "CFBundleIdentifier", skip_serializing_if = "Option::is_none")]
        bundle_identifier: Option<String>,
        #[serde(rename = "CFBundleShortVersionString", skip_serializing_if = "Option::is_none")]
        bundle_version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        minimum_update_version: Option<String>,
    },
    Plist {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        version_comparison_key: Option<String>,
        #[serde(rename = "CFBundleShortVersionString", skip_serializing_if = "Option::is_none")]
        bundle_version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        minimum_update_version: Option<String>,
    },
    File {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        md5checksum: Option<String>,
    },
}

impl InstallsItem {
    pub fn path(&self) -> &str {
        match self {
            InstallsItem::Application { path, .. }
            | InstallsItem::Bundle { path, .. }
            | InstallsItem::Plist { path, .. }
            | InstallsItem::File { path, .. } => path,
        }
    }

    pub fn minimum_update_version(&self) -> Option<&str> {
        match self {
            InstallsItem::Application { minimum_update_version, .. }
            | InstallsItem::Bundle { minimum_update_version, .. }
            | InstallsItem::Plist { minimum_update_version, .. } => minimum_update_version.as_deref(),
            InstallsItem::File { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnusedSoftwareRemovalInfo {
    pub removal_days: u32,
    #[serde(default)]
    pub bundle_ids: Vec<String>,
}

/// The atomic unit describing one installable software item.
/// Identified by the pair `(name, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pkginfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub installer_type: Option<InstallerType>,
    #[serde(default)]
    pub installer_item_location: Option<String>,
    #[serde(default)]
    pub installer_item_hash: Option<String>,
    #[serde(default)]
    pub installer_item_size: Option<u64>,
    #[serde(default)]
    pub installed_size: Option<u64>,
    #[serde(default)]
    pub receipts: Vec<Receipt>,
    #[serde(default)]
    pub installs: Vec<InstallsItem>,
    #[serde(default)]
    pub requires: StringOrList,
    #[serde(default)]
    pub update_for: StringOrList,
    #[serde(default)]
    pub minimum_os_version: Option<String>,
    #[serde(default)]
    pub maximum_os_version: Option<String>,
    #[serde(default)]
    pub supported_architectures: Vec<String>,
    #[serde(default)]
    pub minimum_munki_version: Option<String>,
    #[serde(default)]
    pub installable_condition: Option<String>,
    #[serde(default)]
    pub blocking_applications: Vec<String>,
    #[serde(default)]
    pub unattended_install: bool,
    #[serde(default)]
    pub unattended_uninstall: bool,
    #[serde(default)]
    pub force_install_after_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, rename = "OnDemand")]
    pub on_demand: bool,
    #[serde(default)]
    pub apple_item: Option<bool>,
    #[serde(default)]
    pub precache: bool,
    #[serde(default = "default_true")]
    pub uninstallable: bool,
    #[serde(default)]
    pub uninstall_method: Option<String>,
    #[serde(default)]
    pub installcheck_script: Option<String>,
    #[serde(default)]
    pub uninstallcheck_script: Option<String>,
    #[serde(default)]
    pub version_script: Option<String>,
    #[serde(default)]
    pub preinstall_script: Option<String>,
    #[serde(default)]
    pub postinstall_script: Option<String>,
    #[serde(default)]
    pub preuninstall_script: Option<String>,
    #[serde(default)]
    pub postuninstall_script: Option<String>,
    #[serde(default, rename = "PackageURL")]
    pub package_url: Option<String>,
    #[serde(default, rename = "PackageCompleteURL")]
    pub package_complete_url: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon_name: Option<String>,
    #[serde(default)]
    pub icon_hash: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub developer: Option<String>,
    #[serde(default)]
    pub featured: bool,
    #[serde(default)]
    pub autoremove: bool,
    #[serde(default)]
    pub unused_software_removal_info: Option<UnusedSoftwareRemovalInfo>,
    #[serde(default)]
    pub restart_action: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Pkginfo {
    /// `name-version` form of this item's identity, used for
    /// `processed_installs`/`processed_uninstalls` memo entries and
    /// `update_for` reference matching.
    pub fn reference(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// Whether this pkginfo's `apple_item` should be inferred as true
    /// when the admin did not set it explicitly.
    pub fn is_apple_item(&self) -> bool {
        if let Some(explicit) = self.apple_item {
            return explicit;
        }

        if self.receipts.iter().any(|r| r.packageid.starts_with("com.apple.")) {
            return true;
        }

        if self.installs.iter().any(|i| match i {
            InstallsItem::Application { bundle_identifier, .. }
            | InstallsItem::Bundle { bundle_identifier, .. } => {
                bundle_identifier.as_deref().map_or(false, |b| b.starts_with("com.apple."))
            }
            _ => false,
        }) {
            return true;
        }

        matches!(self.installer_type, Some(InstallerType::StartosInstall))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_reference_disambiguates_double_hyphen() {
        assert_eq!(
            parse_item_reference("name-1.2.3"),
            ("name".to_string(), Some("1.2.3".to_string()))
        );
        assert_eq!(
            parse_item_reference("name--1.2.3"),
            ("name".to_string(), Some("1.2.3".to_string()))
        );
        assert_eq!(parse_item_reference("Google-Chrome"), ("Google-Chrome".to_string(), None));
    }

    #[test]
    fn requires_accepts_string_or_list() {
        let single: StringOrList = serde_json::from_str("\"FooLib\"").unwrap();
        assert_eq!(single.0, vec!["FooLib".to_string()]);

        let list: StringOrList = serde_json::from_str("[\"FooLib\", \"BarLib\"]").unwrap();
        assert_eq!(list.0, vec!["FooLib".to_string(), "BarLib".to_string()]);
    }

    #[test]
    fn apple_item_inferred_from_receipt_prefix() {
        let pkginfo = Pkginfo {
            apple_item: None,
            receipts: vec![Receipt {
                packageid: "com.apple.pkg.Something".into(),
                version: "1.0".into(),
                optional: false,
            }],
            ..minimal_pkginfo()
        };
        assert!(pkginfo.is_apple_item());
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
}
