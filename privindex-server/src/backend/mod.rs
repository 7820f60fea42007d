//! # Backend Contract
//!
//! Every storage backend implements [`PackageRepo`]: readiness, read/write
//! authorization, package upload and download, full listing, and publishing
//! or fetching the serialized index.
//!
//! ## Error Policy
//!
//! Expected failures (validation, conflict, lock timeout, unavailable) come
//! back as typed results with [`OperationStatus::Failed`] and an
//! [`ErrorCode`]. Anything unexpected is recorded into the backend's
//! [`BackendStatus`] through [`record_error_if_raises`], which flips the
//! instance to not-ready, and is then returned as `Err`.
//!
//! Backends are selected by the `type` string found in config and secret
//! tables; see [`registry`].

pub mod file_system;
pub mod registry;

use crate::error::{AppError, AppResult, ErrorCode};
use crate::hash_utils::sha256_file;
use crate::index::PkgRef;
use crate::normalize_distribution_name;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Free-form package metadata as uploaded.
pub type PackageMeta = BTreeMap<String, String>;

pub const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_SYNC_INDEX_INTERVAL: u64 = 60;

/// Settings every backend config carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonConfig {
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Instance name; the key of the config table, never written back as a field.
    #[serde(default, skip_serializing)]
    pub name: String,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Seconds between index sync cycles.
    #[serde(default = "default_sync_index_interval")]
    pub sync_index_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_read_expires: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_write_expires: Option<u64>,
}

fn default_max_file_bytes() -> u64 {
    DEFAULT_MAX_FILE_BYTES
}

fn default_sync_index_interval() -> u64 {
    DEFAULT_SYNC_INDEX_INTERVAL
}

impl CommonConfig {
    pub fn new(backend_type: &str, name: &str) -> Self {
        Self {
            backend_type: backend_type.to_string(),
            name: name.to_string(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            sync_index_interval: DEFAULT_SYNC_INDEX_INTERVAL,
            auth_read_expires: None,
            auth_write_expires: None,
        }
    }
}

/// Static per-instance configuration, typed per backend.
pub trait RepoConfig: fmt::Debug + Send + Sync + 'static {
    fn common(&self) -> &CommonConfig;

    /// The config as a table, without the instance name.
    fn to_table(&self) -> AppResult<toml::Table>;

    fn as_any(&self) -> &dyn Any;
}

/// Fields shared by every secret. `raw` never appears in `Debug` output.
#[derive(Clone, Deserialize)]
pub struct SecretFields {
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(default)]
    pub name: String,
    pub raw: String,
}

impl fmt::Debug for SecretFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretFields")
            .field("backend_type", &self.backend_type)
            .field("name", &self.name)
            .field("raw", &"<redacted>")
            .finish()
    }
}

/// Credential material presented by a client.
pub trait RepoSecret: fmt::Debug + Send + Sync + 'static {
    fn fields(&self) -> &SecretFields;

    /// Stable hash of the credential, used as the auth cache key.
    fn secret_hash(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    fn backend_type(&self) -> &str {
        &self.fields().backend_type
    }

    fn name(&self) -> &str {
        &self.fields().name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct UploadPackageResult {
    pub status: OperationStatus,
    pub message: String,
    pub code: Option<ErrorCode>,
    /// The stored package, on success.
    pub pkg_ref: Option<PkgRef>,
}

impl UploadPackageResult {
    pub fn succeeded(pkg_ref: PkgRef) -> Self {
        Self {
            status: OperationStatus::Succeeded,
            message: String::new(),
            code: None,
            pkg_ref: Some(pkg_ref),
        }
    }

    pub fn failed(err: &AppError) -> Self {
        Self {
            status: OperationStatus::Failed,
            message: err.to_string(),
            code: Some(err.error_code()),
            pkg_ref: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadIndexResult {
    pub status: OperationStatus,
    pub message: String,
    pub code: Option<ErrorCode>,
}

impl UploadIndexResult {
    pub fn succeeded() -> Self {
        Self {
            status: OperationStatus::Succeeded,
            message: String::new(),
            code: None,
        }
    }

    pub fn failed(err: &AppError) -> Self {
        Self {
            status: OperationStatus::Failed,
            message: err.to_string(),
            code: Some(err.error_code()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadIndexResult {
    pub status: OperationStatus,
    pub message: String,
    pub code: Option<ErrorCode>,
}

impl DownloadIndexResult {
    pub fn succeeded() -> Self {
        Self {
            status: OperationStatus::Succeeded,
            message: String::new(),
            code: None,
        }
    }

    pub fn failed(err: &AppError) -> Self {
        Self {
            status: OperationStatus::Failed,
            message: err.to_string(),
            code: Some(err.error_code()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadPackageResult {
    pub status: OperationStatus,
    pub message: String,
    pub code: Option<ErrorCode>,
    /// Where the artifact was written, on success.
    pub path: Option<PathBuf>,
}

impl DownloadPackageResult {
    pub fn succeeded(path: PathBuf) -> Self {
        Self {
            status: OperationStatus::Succeeded,
            message: String::new(),
            code: None,
            path: Some(path),
        }
    }

    pub fn failed(err: &AppError) -> Self {
        Self {
            status: OperationStatus::Failed,
            message: err.to_string(),
            code: Some(err.error_code()),
            path: None,
        }
    }
}

#[derive(Debug)]
struct StatusInner {
    ready: bool,
    message: String,
}

/// Readiness of one backend instance plus the last recorded diagnostic.
#[derive(Debug)]
pub struct BackendStatus {
    inner: RwLock<StatusInner>,
}

impl Default for BackendStatus {
    fn default() -> Self {
        Self::ready()
    }
}

impl BackendStatus {
    pub fn ready() -> Self {
        Self {
            inner: RwLock::new(StatusInner {
                ready: true,
                message: String::new(),
            }),
        }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(StatusInner {
                ready: false,
                message: message.into(),
            }),
        }
    }

    pub fn get(&self) -> (bool, String) {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        (inner.ready, inner.message.clone())
    }

    pub fn is_ready(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ready
    }

    pub fn record_error(&self, message: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.ready = false;
        inner.message = message.to_string();
    }

    /// `Err(Unavailable)` carrying the stored diagnostic when not ready.
    pub fn ensure_ready(&self) -> AppResult<()> {
        match self.get() {
            (true, _) => Ok(()),
            (false, message) => Err(AppError::Unavailable(message)),
        }
    }
}

/// Run `fut`; an unexpected error is recorded into `status` before being
/// returned. Expected errors pass through untouched.
pub async fn record_error_if_raises<T, F>(status: &BackendStatus, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match fut.await {
        Err(e) if !e.is_expected() => {
            tracing::error!(error = %e, "Backend operation failed unexpectedly");
            status.record_error(&format!("{e:#}"));
            Err(e)
        }
        other => other,
    }
}

/// Split an outcome into expected failures, which callers report as typed
/// results, and unexpected ones, which stay in the outer `Err`.
pub fn partition_expected<T>(res: AppResult<T>) -> AppResult<Result<T, AppError>> {
    match res {
        Ok(value) => Ok(Ok(value)),
        Err(e) if e.is_expected() => Ok(Err(e)),
        Err(e) => Err(e),
    }
}

/// Fill in `distrib` and `sha256` before a package is stored.
///
/// `distrib` comes from the normalized `name` when absent; with neither the
/// upload is rejected. A missing `sha256` is computed from the file.
pub async fn prepare_upload_meta(mut meta: PackageMeta, path: &Path) -> AppResult<PackageMeta> {
    let distrib = match meta.get("distrib").filter(|d| !d.is_empty()) {
        Some(distrib) => normalize_distribution_name(distrib),
        None => match meta.get("name").filter(|n| !n.is_empty()) {
            Some(name) => normalize_distribution_name(name),
            None => {
                return Err(AppError::BadRequest(
                    "Cannot generate the distribution name.".to_string(),
                ))
            }
        },
    };
    meta.insert("distrib".to_string(), distrib);

    if meta.get("sha256").is_none_or(|s| s.is_empty()) {
        let sha256 = sha256_file(path).await?;
        meta.insert("sha256".to_string(), sha256);
    }
    Ok(meta)
}

/// One configured storage backend.
#[async_trait]
pub trait PackageRepo: fmt::Debug + Send + Sync {
    fn backend_type(&self) -> &str;

    fn name(&self) -> &str;

    fn config(&self) -> &dyn RepoConfig;

    fn status(&self) -> &BackendStatus;

    /// `(true, "")` when usable, otherwise `false` with the last diagnostic.
    fn ready(&self) -> (bool, String) {
        self.status().get()
    }

    fn record_error(&self, message: &str) {
        tracing::warn!(instance = %self.name(), message = %message, "Backend marked not ready");
        self.status().record_error(message);
    }

    async fn auth_read(&self, secret: &dyn RepoSecret) -> bool;

    /// Must never pass for a secret that only grants read access.
    async fn auth_write(&self, secret: &dyn RepoSecret) -> bool;

    async fn upload_package(
        &self,
        filename: &str,
        meta: PackageMeta,
        path: &Path,
    ) -> AppResult<UploadPackageResult>;

    async fn download_package(
        &self,
        pkg_ref: &PkgRef,
        dest: &Path,
    ) -> AppResult<DownloadPackageResult>;

    /// Full listing of authoritative storage.
    async fn collect_all_published_packages(&self) -> AppResult<Vec<PkgRef>>;

    async fn local_index_is_up_to_date(&self, path: &Path) -> AppResult<bool>;

    async fn upload_index(&self, path: &Path) -> AppResult<UploadIndexResult>;

    async fn download_index(&self, path: &Path) -> AppResult<DownloadIndexResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_meta_derives_distrib_and_sha() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg-1.0.tar.gz");
        std::fs::write(&path, b"hello world").unwrap();

        let meta = PackageMeta::from([("name".to_string(), "Foo_Bar".to_string())]);
        let meta = prepare_upload_meta(meta, &path).await.unwrap();
        assert_eq!(meta["distrib"], "foo-bar");
        assert_eq!(
            meta["sha256"],
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_prepare_meta_keeps_given_sha() {
        let dir = tempfile::tempdir().unwrap();
        let meta = PackageMeta::from([
            ("distrib".to_string(), "Pkg".to_string()),
            ("sha256".to_string(), "abc".to_string()),
        ]);
        // The file is never opened when a checksum is given.
        let meta = prepare_upload_meta(meta, &dir.path().join("absent"))
            .await
            .unwrap();
        assert_eq!(meta["distrib"], "pkg");
        assert_eq!(meta["sha256"], "abc");
    }

    #[tokio::test]
    async fn test_prepare_meta_without_name_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = prepare_upload_meta(PackageMeta::new(), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("distribution name"));
        assert_eq!(err.error_code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_record_error_only_for_unexpected_failures() {
        let status = BackendStatus::ready();

        let res: AppResult<()> = record_error_if_raises(&status, async {
            Err(AppError::Conflict("Package exists.".into()))
        })
        .await;
        assert!(res.is_err());
        assert!(status.is_ready());

        let res: AppResult<()> = record_error_if_raises(&status, async {
            Err(AppError::InternalError("storage vanished".into()))
        })
        .await;
        assert!(res.is_err());
        let (ready, message) = status.get();
        assert!(!ready);
        assert!(message.contains("storage vanished"));
        assert!(matches!(status.ensure_ready(), Err(AppError::Unavailable(_))));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let fields = SecretFields {
            backend_type: "file_system".into(),
            name: "local".into(),
            raw: "hunter2".into(),
        };
        let printed = format!("{fields:?}");
        assert!(!printed.contains("hunter2"));
    }
}
