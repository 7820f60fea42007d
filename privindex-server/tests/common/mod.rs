//! Common test utilities and helpers
//!
//! Temp-dir workspaces, TOML fixture writers, and a file-system backend with
//! a deliberately slow auth check for cache timing tests.

#![allow(dead_code)]

use async_trait::async_trait;
use privindex_server::backend::file_system::{
    FileSystemBackend, FileSystemConfig, FileSystemLocation, FileSystemRepo,
};
use privindex_server::backend::{
    BackendStatus, CommonConfig, DownloadIndexResult, DownloadPackageResult, PackageMeta,
    PackageRepo, RepoConfig, RepoSecret, SecretFields, UploadIndexResult, UploadPackageResult,
};
use privindex_server::hash_utils::sha256_hash;
use privindex_server::{
    AppError, AppResult, Backend, BackendRegistry, LocalPaths, PkgRef, ServerSettings,
    WorkflowState,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tempfile::TempDir;

pub const SLOW_AUTH_TYPE: &str = "slow_auth";

/// A scratch root holding config files and the server's local directories.
pub struct TestWorkspace {
    pub temp_dir: TempDir,
    pub settings: ServerSettings,
}

impl TestWorkspace {
    /// Write `config` (and `secrets`, if any) and point settings at them.
    pub fn new(config: &str, secrets: Option<&str>) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, config).unwrap();

        let mut settings = ServerSettings::new(config_path);
        settings.root = temp_dir.path().join("root");
        if let Some(secrets) = secrets {
            let secret_path = temp_dir.path().join("admin_secret.toml");
            std::fs::write(&secret_path, secrets).unwrap();
            settings.admin_secret = Some(secret_path);
        }
        Self { temp_dir, settings }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn local_paths(&self) -> LocalPaths {
        self.settings.local_paths()
    }

    /// Build the workflow state over an isolated registry.
    pub async fn state(&self) -> Arc<WorkflowState> {
        Arc::new(
            WorkflowState::from_settings(&self.settings, Arc::new(test_registry()))
                .await
                .unwrap(),
        )
    }

    /// Write `content` to a file under the workspace and return its path.
    pub fn write_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.path().join("uploads").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Default storage folder of a file-system instance.
    pub fn storage(&self, instance: &str) -> PathBuf {
        self.local_paths().instance_cache(instance).join("storage")
    }
}

/// Config table for one file-system instance.
pub fn fs_config(name: &str, read: &str, write: &str) -> String {
    format!(
        "[{name}]\ntype = \"file_system\"\nread_secret = \"{read}\"\nwrite_secret = \"{write}\"\n"
    )
}

/// Config table for one slow-auth instance.
pub fn slow_config(name: &str, secret: &str, delay_ms: u64, read_ttl: u64) -> String {
    format!(
        "[{name}]\ntype = \"{SLOW_AUTH_TYPE}\"\nsecret = \"{secret}\"\nauth_delay_ms = {delay_ms}\nauth_read_expires = {read_ttl}\nauth_write_expires = {read_ttl}\n"
    )
}

pub fn secret_entry(name: &str, backend_type: &str, raw: &str) -> String {
    format!("[{name}]\ntype = \"{backend_type}\"\nraw = \"{raw}\"\n")
}

/// Built-in backends plus the slow-auth test backend.
pub fn test_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register::<FileSystemBackend>().unwrap();
    registry.register::<SlowAuthBackend>().unwrap();
    registry
}

fn auth_calls() -> &'static Mutex<HashMap<String, usize>> {
    static CALLS: OnceLock<Mutex<HashMap<String, usize>>> = OnceLock::new();
    CALLS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// How many times the backend auth check ran for `instance`.
pub fn auth_call_count(instance: &str) -> usize {
    auth_calls()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(instance)
        .copied()
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowAuthConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub secret: String,
    #[serde(default)]
    pub auth_delay_ms: u64,
    /// Delay before answering the index staleness check.
    #[serde(default)]
    pub index_check_delay_ms: u64,
}

impl RepoConfig for SlowAuthConfig {
    fn common(&self) -> &CommonConfig {
        &self.common
    }

    fn to_table(&self) -> AppResult<toml::Table> {
        match toml::Value::try_from(self)? {
            toml::Value::Table(table) => Ok(table),
            other => Err(AppError::InternalError(format!("not a table: {other}"))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct SlowAuthSecret {
    fields: SecretFields,
    hash: String,
}

impl RepoSecret for SlowAuthSecret {
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

/// File-system storage behind an auth check that takes `auth_delay_ms`.
#[derive(Debug)]
pub struct SlowAuthRepo {
    config: SlowAuthConfig,
    storage: FileSystemRepo,
}

impl SlowAuthRepo {
    async fn check(&self, secret: &dyn RepoSecret) -> bool {
        *auth_calls()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(self.config.common.name.clone())
            .or_default() += 1;
        tokio::time::sleep(Duration::from_millis(self.config.auth_delay_ms)).await;
        secret.fields().raw == self.config.secret
    }
}

#[async_trait]
impl PackageRepo for SlowAuthRepo {
    fn backend_type(&self) -> &str {
        SLOW_AUTH_TYPE
    }

    fn name(&self) -> &str {
        &self.config.common.name
    }

    fn config(&self) -> &dyn RepoConfig {
        &self.config
    }

    fn status(&self) -> &BackendStatus {
        self.storage.status()
    }

    async fn auth_read(&self, secret: &dyn RepoSecret) -> bool {
        self.check(secret).await
    }

    async fn auth_write(&self, secret: &dyn RepoSecret) -> bool {
        self.check(secret).await
    }

    async fn upload_package(
        &self,
        filename: &str,
        meta: PackageMeta,
        path: &Path,
    ) -> AppResult<UploadPackageResult> {
        self.storage.upload_package(filename, meta, path).await
    }

    async fn download_package(
        &self,
        pkg_ref: &PkgRef,
        dest: &Path,
    ) -> AppResult<DownloadPackageResult> {
        self.storage.download_package(pkg_ref, dest).await
    }

    async fn collect_all_published_packages(&self) -> AppResult<Vec<PkgRef>> {
        self.storage.collect_all_published_packages().await
    }

    async fn local_index_is_up_to_date(&self, path: &Path) -> AppResult<bool> {
        tokio::time::sleep(Duration::from_millis(self.config.index_check_delay_ms)).await;
        self.storage.local_index_is_up_to_date(path).await
    }

    async fn upload_index(&self, path: &Path) -> AppResult<UploadIndexResult> {
        self.storage.upload_index(path).await
    }

    async fn download_index(&self, path: &Path) -> AppResult<DownloadIndexResult> {
        self.storage.download_index(path).await
    }
}

pub struct SlowAuthBackend;

impl Backend for SlowAuthBackend {
    const TYPE: &'static str = SLOW_AUTH_TYPE;
    type Config = SlowAuthConfig;
    type Secret = SlowAuthSecret;
    type Location = FileSystemLocation;

    fn create_secret(fields: SecretFields) -> AppResult<Self::Secret> {
        let hash = format!("slow-{}", sha256_hash(fields.raw.as_bytes()));
        Ok(SlowAuthSecret { fields, hash })
    }

    fn create_repo(config: Self::Config, paths: &LocalPaths) -> AppResult<Arc<dyn PackageRepo>> {
        let name = config.common.name.clone();
        let mut fs_config = FileSystemConfig::new(&name, &config.secret, &config.secret);
        fs_config.common.max_file_bytes = config.common.max_file_bytes;
        let storage = FileSystemRepo::new(fs_config, paths)?;
        Ok(Arc::new(SlowAuthRepo { config, storage }))
    }
}
