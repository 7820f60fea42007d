//! # File-System Backend
//!
//! Stores packages on a local (or mounted) filesystem:
//!
//! ```text
//! <storage>/
//! ├── index.toml              # published index
//! └── <distrib>/
//!     ├── pkg-1.0.tar.gz
//!     └── pkg-1.0.tar.gz.meta # TOML metadata, written last
//! ```
//!
//! `<storage>` defaults to `<cache>/<instance>/storage`. A package counts as
//! published only when both the file and its `.meta` sidecar exist.
//!
//! Credentials are compared against the `read_secret` and `write_secret`
//! configured for the instance; the write secret also grants read.

use super::registry::Backend;
use super::{
    partition_expected, prepare_upload_meta, record_error_if_raises, BackendStatus, CommonConfig,
    DownloadIndexResult, DownloadPackageResult, PackageMeta, PackageRepo, RepoConfig, RepoSecret,
    SecretFields, UploadIndexResult, UploadPackageResult,
};
use crate::config::LocalPaths;
use crate::error::{AppError, AppResult};
use crate::hash_utils::{sha256_file, sha256_hash};
use crate::index::PkgRef;
use crate::lock::acquire_exclusive;
use crate::{normalize_distribution_name, split_package_ext, validate_filename};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const FILE_SYSTEM_TYPE: &str = "file_system";

/// How long an upload waits for another upload of the same package.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(500);
pub const META_SUFFIX: &str = ".meta";
const PUBLISHED_INDEX: &str = "index.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSystemConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub read_secret: String,
    #[serde(default)]
    pub write_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_root: Option<PathBuf>,
}

impl FileSystemConfig {
    pub fn new(name: &str, read_secret: &str, write_secret: &str) -> Self {
        Self {
            common: CommonConfig::new(FILE_SYSTEM_TYPE, name),
            read_secret: read_secret.to_string(),
            write_secret: write_secret.to_string(),
            storage_root: None,
        }
    }
}

impl RepoConfig for FileSystemConfig {
    fn common(&self) -> &CommonConfig {
        &self.common
    }

    fn to_table(&self) -> AppResult<toml::Table> {
        match toml::Value::try_from(self)? {
            toml::Value::Table(table) => Ok(table),
            other => Err(AppError::InternalError(format!(
                "config serialized to a non-table value: {other}"
            ))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
pub struct FileSystemSecret {
    fields: SecretFields,
    hash: String,
}

impl FileSystemSecret {
    pub fn new(fields: SecretFields) -> Self {
        let hash = format!("fs-{}", sha256_hash(fields.raw.as_bytes()));
        Self { fields, hash }
    }

    fn token(&self) -> &str {
        &self.fields.raw
    }
}

impl RepoSecret for FileSystemSecret {
    fn fields(&self) -> &SecretFields {
        &self.fields
    }

    fn secret_hash(&self) -> &str {
        &self.hash
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Storage-relative paths of a package and its sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemLocation {
    pub package_path: String,
    pub meta_path: String,
}

pub struct FileSystemBackend;

impl Backend for FileSystemBackend {
    const TYPE: &'static str = FILE_SYSTEM_TYPE;
    type Config = FileSystemConfig;
    type Secret = FileSystemSecret;
    type Location = FileSystemLocation;

    fn create_secret(fields: SecretFields) -> AppResult<Self::Secret> {
        Ok(FileSystemSecret::new(fields))
    }

    fn create_repo(config: Self::Config, paths: &LocalPaths) -> AppResult<Arc<dyn PackageRepo>> {
        Ok(Arc::new(FileSystemRepo::new(config, paths)?))
    }
}

#[derive(Debug)]
pub struct FileSystemRepo {
    config: FileSystemConfig,
    status: BackendStatus,
    storage: PathBuf,
    lock_dir: PathBuf,
}

impl FileSystemRepo {
    pub fn new(config: FileSystemConfig, paths: &LocalPaths) -> AppResult<Self> {
        let name = config.common.name.clone();
        let cache = paths.instance_cache(&name);
        let storage = config
            .storage_root
            .clone()
            .unwrap_or_else(|| cache.join("storage"));

        let status = if cache.is_dir() {
            std::fs::create_dir_all(&storage)?;
            BackendStatus::ready()
        } else {
            tracing::warn!(instance = %name, cache = %cache.display(), "Cache path not exists");
            BackendStatus::not_ready("Cache path not exists")
        };

        Ok(Self {
            lock_dir: paths.instance_lock_dir(&name),
            config,
            status,
            storage,
        })
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage
    }

    fn published_index_path(&self) -> PathBuf {
        self.storage.join(PUBLISHED_INDEX)
    }

    fn package_lock_path(&self, package: &str) -> PathBuf {
        self.lock_dir.join(format!("{package}.lock"))
    }

    /// The published file already holding `package`, in any distribution
    /// and with any extension.
    async fn find_published(&self, package: &str) -> AppResult<Option<PathBuf>> {
        if !tokio::fs::try_exists(&self.storage).await? {
            return Ok(None);
        }
        let mut distrib_dirs = tokio::fs::read_dir(&self.storage).await?;
        while let Some(distrib_dir) = distrib_dirs.next_entry().await? {
            if !distrib_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut children = tokio::fs::read_dir(distrib_dir.path()).await?;
            while let Some(child) = children.next_entry().await? {
                let Ok(child_name) = child.file_name().into_string() else {
                    continue;
                };
                let Some(filename) = child_name.strip_suffix(META_SUFFIX) else {
                    continue;
                };
                if split_package_ext(filename).map(|(stem, _)| stem) != Some(package) {
                    continue;
                }
                let pkg_path = distrib_dir.path().join(filename);
                if tokio::fs::try_exists(&pkg_path).await? {
                    return Ok(Some(pkg_path));
                }
            }
        }
        Ok(None)
    }

    async fn store_package(
        &self,
        filename: &str,
        meta: PackageMeta,
        path: &Path,
    ) -> AppResult<PkgRef> {
        self.status.ensure_ready()?;
        validate_filename(filename)?;
        let (package, ext) = split_package_ext(filename).ok_or_else(|| {
            AppError::BadRequest(format!("Unsupported package extension: {filename}"))
        })?;

        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| {
                AppError::BadRequest(format!("Cannot read upload {}: {e}", path.display()))
            })?
            .len();
        if size > self.config.common.max_file_bytes {
            return Err(AppError::BadRequest(format!(
                "File too large: {} bytes (max: {})",
                size, self.config.common.max_file_bytes
            )));
        }

        let meta = prepare_upload_meta(meta, path).await?;
        let (distrib, sha256) = match (meta.get("distrib"), meta.get("sha256")) {
            (Some(d), Some(s)) => (d.clone(), s.clone()),
            _ => {
                return Err(AppError::InternalError(
                    "upload metadata lost distrib or sha256".to_string(),
                ))
            }
        };

        validate_filename(&distrib)?;

        let _guard = acquire_exclusive(&self.package_lock_path(package), LOCK_TIMEOUT).await?;

        // Identifiers are unique across distributions and extensions.
        if let Some(existing) = self.find_published(package).await? {
            tracing::debug!(package = %package, existing = %existing.display(), "Identifier taken");
            return Err(AppError::Conflict("Package exists.".to_string()));
        }

        let distrib_dir = self.storage.join(&distrib);
        tokio::fs::create_dir_all(&distrib_dir).await?;
        let pkg_path = distrib_dir.join(filename);
        let meta_path = distrib_dir.join(format!("{filename}{META_SUFFIX}"));

        tokio::fs::copy(path, &pkg_path).await?;
        // The sidecar marks the upload complete, so it goes last.
        tokio::fs::write(&meta_path, toml::to_string(&meta)?).await?;

        tracing::info!(
            instance = %self.config.common.name,
            filename = %filename,
            distrib = %distrib,
            size,
            "Package stored"
        );

        Ok(PkgRef {
            backend_type: FILE_SYSTEM_TYPE.to_string(),
            distrib: distrib.clone(),
            package: package.to_string(),
            ext: ext.to_string(),
            sha256,
            location: location_table(&distrib, filename),
            meta,
        })
    }

    async fn collect(&self) -> AppResult<Vec<PkgRef>> {
        self.status.ensure_ready()?;
        let mut pkg_refs = Vec::new();
        if !tokio::fs::try_exists(&self.storage).await? {
            return Ok(pkg_refs);
        }

        let mut distrib_dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.storage).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                distrib_dirs.push(entry.path());
            }
        }
        distrib_dirs.sort();

        for distrib_dir in distrib_dirs {
            let Some(dir_name) = distrib_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let dir_name = dir_name.to_string();

            let mut packages = BTreeSet::new();
            let mut metas = BTreeSet::new();
            let mut children = tokio::fs::read_dir(&distrib_dir).await?;
            while let Some(child) = children.next_entry().await? {
                let Ok(child_name) = child.file_name().into_string() else {
                    continue;
                };
                match child_name.strip_suffix(META_SUFFIX) {
                    Some(filename) => metas.insert(filename.to_string()),
                    None => packages.insert(child_name.clone()),
                };
            }

            for filename in packages.intersection(&metas) {
                if let Some(pkg_ref) = self.read_pkg_ref(&distrib_dir, &dir_name, filename).await? {
                    pkg_refs.push(pkg_ref);
                }
            }
        }

        tracing::debug!(
            instance = %self.config.common.name,
            count = pkg_refs.len(),
            "Collected published packages"
        );
        Ok(pkg_refs)
    }

    async fn read_pkg_ref(
        &self,
        distrib_dir: &Path,
        dir_name: &str,
        filename: &str,
    ) -> AppResult<Option<PkgRef>> {
        let Some((package, ext)) = split_package_ext(filename) else {
            tracing::warn!(filename = %filename, "Skipping file with unknown extension");
            return Ok(None);
        };
        let meta_path = distrib_dir.join(format!("{filename}{META_SUFFIX}"));
        let content = tokio::fs::read_to_string(&meta_path).await?;
        let meta: PackageMeta = match toml::from_str(&content) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(path = %meta_path.display(), error = %e, "Skipping unreadable metadata");
                return Ok(None);
            }
        };

        let distrib = normalize_distribution_name(
            meta.get("distrib").map(String::as_str).unwrap_or(dir_name),
        );
        let sha256 = match meta.get("sha256") {
            Some(sha256) => sha256.clone(),
            None => sha256_file(&distrib_dir.join(filename)).await?,
        };

        Ok(Some(PkgRef {
            backend_type: FILE_SYSTEM_TYPE.to_string(),
            distrib,
            package: package.to_string(),
            ext: ext.to_string(),
            sha256,
            location: location_table(dir_name, filename),
            meta,
        }))
    }

    async fn fetch_package(&self, pkg_ref: &PkgRef, dest: &Path) -> AppResult<PathBuf> {
        self.status.ensure_ready()?;
        let relative = pkg_ref.location.get("package_path").ok_or_else(|| {
            AppError::BadRequest(format!("package '{}' has no package_path", pkg_ref.package))
        })?;
        let source = self.resolve_in_storage(relative)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(AppError::NotFound(format!(
                "Package file not found: {}",
                pkg_ref.filename()
            )));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, dest).await?;

        let actual = sha256_file(dest).await?;
        if actual != pkg_ref.sha256 {
            tokio::fs::remove_file(dest).await?;
            return Err(AppError::Conflict(format!(
                "Checksum mismatch for {}: expected {}, got {}",
                pkg_ref.filename(),
                pkg_ref.sha256,
                actual
            )));
        }
        Ok(dest.to_path_buf())
    }

    /// Join a storage-relative path, refusing anything that escapes storage.
    fn resolve_in_storage(&self, relative: &str) -> AppResult<PathBuf> {
        let relative = Path::new(relative);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(AppError::BadRequest(format!(
                "Invalid storage path: {}",
                relative.display()
            )));
        }
        Ok(self.storage.join(relative))
    }

    async fn index_up_to_date(&self, local: &Path) -> AppResult<bool> {
        self.status.ensure_ready()?;
        let published = self.published_index_path();
        let published_exists = tokio::fs::try_exists(&published).await?;
        let local_exists = tokio::fs::try_exists(local).await?;

        match (published_exists, local_exists) {
            (false, _) => Ok(true),
            (true, false) => Ok(false),
            (true, true) => {
                let published_len = tokio::fs::metadata(&published).await?.len();
                let local_len = tokio::fs::metadata(local).await?.len();
                if published_len != local_len {
                    return Ok(false);
                }
                Ok(sha256_file(&published).await? == sha256_file(local).await?)
            }
        }
    }

    async fn publish_index_file(&self, path: &Path) -> AppResult<()> {
        self.status.ensure_ready()?;
        if !tokio::fs::try_exists(path).await? {
            return Err(AppError::NotFound(format!(
                "Index file not found: {}",
                path.display()
            )));
        }
        let target = self.published_index_path();
        copy_atomically(path, &target).await?;
        tracing::info!(instance = %self.config.common.name, path = %target.display(), "Index published");
        Ok(())
    }

    async fn fetch_index_file(&self, path: &Path) -> AppResult<()> {
        self.status.ensure_ready()?;
        let published = self.published_index_path();
        if !tokio::fs::try_exists(&published).await? {
            return Err(AppError::NotFound("Published index not found".to_string()));
        }
        copy_atomically(&published, path).await
    }
}

fn location_table(distrib_dir: &str, filename: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "package_path".to_string(),
            format!("{distrib_dir}/{filename}"),
        ),
        (
            "meta_path".to_string(),
            format!("{distrib_dir}/{filename}{META_SUFFIX}"),
        ),
    ])
}

/// Copy through a uniquely named temporary sibling and rename into place.
async fn copy_atomically(from: &Path, to: &Path) -> AppResult<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = to.as_os_str().to_owned();
    tmp.push(format!(".tmp.{}", Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    let copied = match tokio::fs::copy(from, &tmp).await {
        Ok(_) => tokio::fs::rename(&tmp, to).await,
        Err(e) => Err(e),
    };
    if let Err(e) = copied {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
            tracing::debug!(path = %tmp.display(), error = %cleanup, "Temporary file not removed");
        }
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl PackageRepo for FileSystemRepo {
    fn backend_type(&self) -> &str {
        FILE_SYSTEM_TYPE
    }

    fn name(&self) -> &str {
        &self.config.common.name
    }

    fn config(&self) -> &dyn RepoConfig {
        &self.config
    }

    fn status(&self) -> &BackendStatus {
        &self.status
    }

    async fn auth_read(&self, secret: &dyn RepoSecret) -> bool {
        let Some(secret) = secret.as_any().downcast_ref::<FileSystemSecret>() else {
            return false;
        };
        let token = secret.token();
        !token.is_empty() && (token == self.config.read_secret || token == self.config.write_secret)
    }

    async fn auth_write(&self, secret: &dyn RepoSecret) -> bool {
        let Some(secret) = secret.as_any().downcast_ref::<FileSystemSecret>() else {
            return false;
        };
        let token = secret.token();
        !token.is_empty() && token == self.config.write_secret
    }

    async fn upload_package(
        &self,
        filename: &str,
        meta: PackageMeta,
        path: &Path,
    ) -> AppResult<UploadPackageResult> {
        let res =
            record_error_if_raises(&self.status, self.store_package(filename, meta, path)).await;
        Ok(match partition_expected(res)? {
            Ok(pkg_ref) => UploadPackageResult::succeeded(pkg_ref),
            Err(e) => {
                tracing::info!(filename = %filename, error = %e, "Upload rejected");
                UploadPackageResult::failed(&e)
            }
        })
    }

    async fn download_package(
        &self,
        pkg_ref: &PkgRef,
        dest: &Path,
    ) -> AppResult<DownloadPackageResult> {
        let res = record_error_if_raises(&self.status, self.fetch_package(pkg_ref, dest)).await;
        Ok(match partition_expected(res)? {
            Ok(path) => DownloadPackageResult::succeeded(path),
            Err(e) => DownloadPackageResult::failed(&e),
        })
    }

    async fn collect_all_published_packages(&self) -> AppResult<Vec<PkgRef>> {
        record_error_if_raises(&self.status, self.collect()).await
    }

    async fn local_index_is_up_to_date(&self, path: &Path) -> AppResult<bool> {
        record_error_if_raises(&self.status, self.index_up_to_date(path)).await
    }

    async fn upload_index(&self, path: &Path) -> AppResult<UploadIndexResult> {
        let res = record_error_if_raises(&self.status, self.publish_index_file(path)).await;
        Ok(match partition_expected(res)? {
            Ok(()) => UploadIndexResult::succeeded(),
            Err(e) => UploadIndexResult::failed(&e),
        })
    }

    async fn download_index(&self, path: &Path) -> AppResult<DownloadIndexResult> {
        let res = record_error_if_raises(&self.status, self.fetch_index_file(path)).await;
        Ok(match partition_expected(res)? {
            Ok(()) => DownloadIndexResult::succeeded(),
            Err(e) => DownloadIndexResult::failed(&e),
        })
    }
}
