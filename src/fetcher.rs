//! The resource fetcher.
//!
//! Grounded on `download.rs`'s resumable `reqwest` GET with a
//! `ProgressWriter` and `tempfile::NamedTempFile`-then-persist commit,
//! and `repo.rs`'s cache-freshness / conditional-fetch handling. This
//! module generalizes both into a single `ResourceFetcher` covering all
//! five resource kinds in the repo's fetch URL layout.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};

/// The five fetchable resource kinds, each with its own base-path
/// suffix relative to the configured repo URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Manifest,
    Catalog,
    Package,
    Icon,
    ClientResource,
}

impl ResourceKind {
    fn path_suffix(self) -> &'static str {
        match self {
            ResourceKind::Manifest => "manifests",
            ResourceKind::Catalog => "catalogs",
            ResourceKind::Package => "pkgs",
            ResourceKind::Icon => "icons",
            ResourceKind::ClientResource => "client_resources",
        }
    }
}

/// The typed error sum covering connection, HTTP, verification, and
/// filesystem failures during a fetch.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("connection error {code:?}: {message}")]
    Connection { code: Option<u16>, message: String },
    #[error("http error {code}: {message}")]
    Http { code: u16, message: String },
    #[error("verification failed: checksum mismatch")]
    Verification,
    #[error("filesystem error: {0}")]
    FileSystem(String),
    #[error("download error {code:?}: {message}")]
    Download { code: Option<u16>, message: String },
}

/// Middleware hook: rewrites a request's URL and headers before it is
/// sent.
pub trait Middleware: Send + Sync {
    fn process_request(&self, url: String, headers: Vec<(String, String)>) -> (String, Vec<(String, String)>);
}

/// Result of a fetch: whether a new download actually happened (`false`
/// on a cache hit / `304 Not Modified`).
pub type DidDownload = bool;

pub struct ResourceFetcher {
    client: reqwest::blocking::Client,
    middleware: Option<Box<dyn Middleware>>,
}

impl ResourceFetcher {
    pub fn new() -> ResourceFetcher {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client can always be built with default TLS backend");

        ResourceFetcher {
            client,
            middleware: None,
        }
    }

    pub fn with_middleware(middleware: Box<dyn Middleware>) -> ResourceFetcher {
        let mut fetcher = ResourceFetcher::new();
        fetcher.middleware = Some(middleware);
        fetcher
    }

    /// Build the URL for a resource, honoring `PackageURL`/
    /// `PackageCompleteURL` overrides for package fetches.
    pub fn resource_url(
        &self,
        repo_base: &str,
        kind: ResourceKind,
        name: &str,
        package_url_override: Option<&str>,
        package_complete_url_override: Option<&str>,
    ) -> String {
        if kind == ResourceKind::Package {
            if let Some(complete) = package_complete_url_override {
                return complete.to_string();
            }
            if let Some(base) = package_url_override {
                return format!("{}/{}", base.trim_end_matches('/'), name);
            }
        }

        format!("{}/{}/{}", repo_base.trim_end_matches('/'), kind.path_suffix(), name)
    }

    /// Fetch a resource, writing it to `destination`. Implements
    /// resume-from-partial, SHA-256 verification, and a sidecar
    /// metadata file standing in for an extended-attribute cache of
    /// last-modified/etag (a documented deviation, see DESIGN.md).
    pub fn fetch(
        &self,
        url: &str,
        destination: &Path,
        resume: bool,
        expected_hash: Option<&str>,
        verify: bool,
    ) -> Result<DidDownload, FetchError> {
        let (url, headers) = match &self.middleware {
            Some(mw) => mw.process_request(url.to_string(), Vec::new()),
            None => (url.to_string(), Vec::new()),
        };

        let partial_path = destination.with_extension("download");
        let meta_path = sidecar_meta_path(destination);

        let mut request = self.client.get(&url);
        for (key, value) in &headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let mut resume_offset = 0u64;
        if resume && partial_path.exists() {
            resume_offset = fs::metadata(&partial_path).map(|m| m.len()).unwrap_or(0);
            if resume_offset > 0 {
                request = request.header("Range", format!("bytes={}-", resume_offset));
            }
        }

        if let Some(cached) = read_sidecar_meta(&meta_path) {
            if let Some(etag) = cached.etag {
                request = request.header("If-None-Match", etag);
            }
            if let Some(last_modified) = cached.last_modified {
                request = request.header("If-Modified-Since", last_modified);
            }
        }

        let response = request.send().map_err(|e| map_reqwest_error(&e))?;

        if response.status().as_u16() == 304 {
            return Ok(false);
        }

        let status = response.status();
        if status.as_u16() == 416 {
            // Server refused our resume range; restart from scratch.
            let _ = fs::remove_file(&partial_path);
            return self.fetch(&url, destination, false, expected_hash, verify);
        }

        if !status.is_success() && status.as_u16() != 206 {
            return Err(FetchError::Http {
                code: status.as_u16(),
                message: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if let Some(parent) = partial_path.parent() {
            fs::create_dir_all(parent).map_err(|e| FetchError::FileSystem(e.to_string()))?;
        }

        let append = status.as_u16() == 206 && resume_offset > 0;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&partial_path)
            .map_err(|e| FetchError::FileSystem(e.to_string()))?;

        if append {
            file.seek(SeekFrom::End(0)).map_err(|e| FetchError::FileSystem(e.to_string()))?;
        }

        let mut reader = response;
        io::copy(&mut reader, &mut file).map_err(|e| FetchError::Download {
            code: None,
            message: e.to_string(),
        })?;
        file.flush().map_err(|e| FetchError::FileSystem(e.to_string()))?;
        drop(file);

        if verify {
            if let Some(expected) = expected_hash {
                let actual = sha256_hex(&partial_path).map_err(|e| FetchError::FileSystem(e.to_string()))?;
                if !actual.eq_ignore_ascii_case(expected) {
                    let _ = fs::remove_file(&partial_path);
                    return Err(FetchError::Verification);
                }
            }
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| FetchError::FileSystem(e.to_string()))?;
        }
        fs::rename(&partial_path, destination).map_err(|e| FetchError::FileSystem(e.to_string()))?;

        write_sidecar_meta(&meta_path, &SidecarMeta { etag, last_modified });

        Ok(true)
    }

    /// Batched GET against a `LicenseInfoURL`, returning the `{name:
    /// seats}` map it serves. Not cached or resumed: this is a small,
    /// session-fresh lookup rather than a large downloadable resource.
    pub fn fetch_license_seats(&self, license_info_url: &str) -> Result<HashMap<String, i64>, FetchError> {
        let response = self.client.get(license_info_url).send().map_err(|e| map_reqwest_error(&e))?;

        if !response.status().is_success() {
            return Err(FetchError::Http {
                code: response.status().as_u16(),
                message: response.status().canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        let body = response.text().map_err(|e| FetchError::Download {
            code: None,
            message: e.to_string(),
        })?;

        serde_json::from_str(&body).map_err(|e| FetchError::Download {
            code: None,
            message: format!("malformed license info response: {}", e),
        })
    }
}

impl Default for ResourceFetcher {
    fn default() -> Self {
        ResourceFetcher::new()
    }
}

fn sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.input(&buf[..n]);
    }
    let mut out = [0u8; 32];
    hasher.result(&mut out);
    Ok(out.iter().map(|b| format!("{:02x}", b)).collect())
}

struct SidecarMeta {
    etag: Option<String>,
    last_modified: Option<String>,
}

fn sidecar_meta_path(destination: &Path) -> PathBuf {
    let mut name = destination.file_name().unwrap_or_default().to_os_string();
    name.push(".meta.json");
    destination.with_file_name(name)
}

fn read_sidecar_meta(path: &Path) -> Option<SidecarMeta> {
    let text = fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    Some(SidecarMeta {
        etag: value.get("etag").and_then(|v| v.as_str()).map(str::to_string),
        last_modified: value
            .get("last_modified")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

fn write_sidecar_meta(path: &Path, meta: &SidecarMeta) {
    let value = serde_json::json!({
        "etag": meta.etag,
        "last_modified": meta.last_modified,
    });
    if let Ok(text) = serde_json::to_string(&value) {
        let _ = fs::write(path, text);
    }
}

fn map_reqwest_error(err: &reqwest::Error) -> FetchError {
    let code = err.status().map(|s| s.as_u16());
    FetchError::Connection {
        code,
        message: ssl_code_to_message(err).unwrap_or_else(|| err.to_string()),
    }
}

/// Map a handful of well-known SSL/TLS failure substrings to
/// human-readable descriptions, standing in for a fuller fixed table of
/// SSL codes that is network/TLS-backend specific; this crate covers
/// the common cases and falls back to the underlying error's own
/// message otherwise.
fn ssl_code_to_message(err: &reqwest::Error) -> Option<String> {
    let text = err.to_string();
    let known = [
        ("certificate has expired", "SSL certificate has expired"),
        ("self signed certificate", "SSL certificate is self-signed"),
        ("certificate verify failed", "SSL certificate verification failed"),
        ("handshake failure", "SSL handshake failed"),
        ("connection refused", "Connection refused"),
        ("timed out", "Connection timed out"),
    ];

    known
        .iter()
        .find(|(needle, _)| text.to_lowercase().contains(needle))
        .map(|(_, msg)| msg.to_string())
}
