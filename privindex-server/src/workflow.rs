//! # Workflow State
//!
//! Process-wide state built once at startup from the instance configs and
//! the optional admin secrets. For every backend instance it holds:
//!
//! - the live backend, replaceable through [`WorkflowState::reinitialize`]
//! - the in-memory [`PackageIndex`], swapped atomically on rebuild
//! - the signature of the persisted index file and the last sync record
//! - a read and a write [`AuthCache`](crate::auth_cache::AuthCache)
//!
//! Request-facing operations (`api_simple`, `resolve_package`,
//! `upload_package`, …) authenticate first and then work against a
//! snapshot of the index; a concurrent rebuild never shows through half
//! applied.

use crate::auth_cache::{AuthMode, InstanceAuthCache};
use crate::backend::registry::BackendRegistry;
use crate::backend::{
    DownloadPackageResult, OperationStatus, PackageMeta, PackageRepo, RepoConfig, RepoSecret,
    UploadPackageResult,
};
use crate::config::{LocalPaths, ServerSettings};
use crate::error::{AppError, AppResult};
use crate::index::{PackageIndex, PkgRef};
use crate::lock::acquire_exclusive;
use crate::pages;
use crate::scheduler::{JobHandle, TaskScheduler};
use crate::split_package_ext;
use crate::sync::SyncPhase;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

/// How long index readers and writers wait for the index file lock.
pub const INDEX_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Identity of a persisted index file, used to notice external rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSignature {
    pub modified: SystemTime,
    pub size: u64,
}

impl IndexSignature {
    pub async fn of(path: &Path) -> AppResult<Option<Self>> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(Some(Self {
                modified: metadata.modified()?,
                size: metadata.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Result of the last completed index swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub synced_at: DateTime<Utc>,
    pub index_size: u64,
    pub packages: usize,
}

#[derive(Debug)]
struct SyncState {
    phase: SyncPhase,
    signature: Option<IndexSignature>,
    last: Option<SyncRecord>,
}

/// One configured backend instance and everything derived from it.
#[derive(Debug)]
pub struct BackendInstance {
    name: String,
    config: Arc<dyn RepoConfig>,
    backend: RwLock<Arc<dyn PackageRepo>>,
    index: ArcSwap<PackageIndex>,
    index_path: PathBuf,
    index_lock_path: PathBuf,
    sync: Mutex<SyncState>,
    auth: InstanceAuthCache,
    reinit: tokio::sync::Mutex<()>,
}

impl BackendInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &dyn RepoConfig {
        self.config.as_ref()
    }

    /// The current backend object.
    pub fn backend(&self) -> Arc<dyn PackageRepo> {
        self.backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A consistent snapshot of the index.
    pub fn index(&self) -> Arc<PackageIndex> {
        self.index.load_full()
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn index_lock_path(&self) -> &Path {
        &self.index_lock_path
    }

    pub fn auth_cache(&self) -> &InstanceAuthCache {
        &self.auth
    }

    pub fn sync_phase(&self) -> SyncPhase {
        self.sync_state().phase
    }

    pub fn last_sync(&self) -> Option<SyncRecord> {
        self.sync_state().last.clone()
    }

    pub fn index_signature(&self) -> Option<IndexSignature> {
        self.sync_state().signature
    }

    pub(crate) fn set_sync_phase(&self, phase: SyncPhase) {
        self.sync_state().phase = phase;
    }

    /// Replace the index in one step and remember where it came from.
    pub(crate) fn swap_index(&self, index: PackageIndex, signature: Option<IndexSignature>) {
        let packages = index.len();
        self.index.store(Arc::new(index));
        let mut sync = self.sync_state();
        sync.signature = signature;
        sync.last = Some(SyncRecord {
            synced_at: Utc::now(),
            index_size: signature.map(|s| s.size).unwrap_or(0),
            packages,
        });
    }

    /// Add a freshly uploaded ref through copy-on-write.
    fn append_to_index(&self, pkg_ref: &PkgRef) -> AppResult<()> {
        let mut outcome = Ok(());
        self.index.rcu(|current| {
            let mut next = PackageIndex::clone(current);
            outcome = next.add(pkg_ref.clone());
            next
        });
        outcome
    }

    fn sync_state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.sync.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared state for every backend instance served by this process.
#[derive(Debug)]
pub struct WorkflowState {
    registry: Arc<BackendRegistry>,
    local_paths: LocalPaths,
    instances: IndexMap<String, Arc<BackendInstance>>,
    admin_secrets: IndexMap<String, Arc<dyn RepoSecret>>,
}

impl WorkflowState {
    /// Load configs and admin secrets named by `settings` and build the state.
    pub async fn from_settings(
        settings: &ServerSettings,
        registry: Arc<BackendRegistry>,
    ) -> AppResult<Self> {
        if !settings.config.exists() {
            return Err(AppError::NotFound(format!(
                "config file {} not exists",
                settings.config.display()
            )));
        }
        let configs = registry.load_configs(&settings.config)?;
        let admin_secrets = match &settings.admin_secret {
            Some(path) => registry.load_secrets(path)?,
            None => IndexMap::new(),
        };
        Self::build(registry, configs, admin_secrets, settings).await
    }

    pub async fn build(
        registry: Arc<BackendRegistry>,
        configs: IndexMap<String, Arc<dyn RepoConfig>>,
        admin_secrets: IndexMap<String, Arc<dyn RepoSecret>>,
        settings: &ServerSettings,
    ) -> AppResult<Self> {
        let local_paths = settings.local_paths();
        local_paths.makedirs()?;

        let mut instances = IndexMap::new();
        for (name, config) in configs {
            std::fs::create_dir_all(local_paths.instance_cache(&name))?;
            let backend = registry.create_repo(config.as_ref(), &local_paths)?;
            let (ready, message) = backend.ready();
            if !ready {
                tracing::warn!(instance = %name, message = %message, "Backend not ready at startup");
            }

            let index_path = local_paths.index_file(&name);
            let index_lock_path = local_paths.lock.join(format!("{name}.index.lock"));
            let signature = IndexSignature::of(&index_path).await?;
            let index = match signature {
                Some(_) => {
                    let _guard = acquire_exclusive(&index_lock_path, INDEX_LOCK_TIMEOUT).await?;
                    registry.load_index(&index_path)?
                }
                None => PackageIndex::new(),
            };

            let common = config.common();
            let auth = InstanceAuthCache::new(
                Duration::from_secs(common.auth_read_expires.unwrap_or(settings.auth_read_expires)),
                Duration::from_secs(
                    common.auth_write_expires.unwrap_or(settings.auth_write_expires),
                ),
            );

            tracing::info!(
                instance = %name,
                backend_type = %common.backend_type,
                packages = index.len(),
                "Backend instance initialized"
            );

            instances.insert(
                name.clone(),
                Arc::new(BackendInstance {
                    name,
                    config,
                    backend: RwLock::new(backend),
                    index: ArcSwap::from_pointee(index),
                    index_path,
                    index_lock_path,
                    sync: Mutex::new(SyncState {
                        phase: SyncPhase::Idle,
                        signature,
                        last: None,
                    }),
                    auth,
                    reinit: tokio::sync::Mutex::new(()),
                }),
            );
        }

        Ok(Self {
            registry,
            local_paths,
            instances,
            admin_secrets,
        })
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn local_paths(&self) -> &LocalPaths {
        &self.local_paths
    }

    pub fn instance_names(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    pub fn instance(&self, name: &str) -> AppResult<&Arc<BackendInstance>> {
        self.instances
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("Package repository \"{name}\" not exists.")))
    }

    pub fn admin_secret(&self, name: &str) -> Option<Arc<dyn RepoSecret>> {
        self.admin_secrets.get(name).cloned()
    }

    /// Build a client secret typed for instance `name`.
    pub fn create_secret(&self, name: &str, raw: &str) -> AppResult<Arc<dyn RepoSecret>> {
        if name.is_empty() || raw.is_empty() {
            return Err(AppError::Unauthorized(
                "Empty package repository name or secret.".to_string(),
            ));
        }
        let instance = self.instance(name)?;
        let mut table = toml::Table::new();
        table.insert(
            "type".to_string(),
            toml::Value::String(instance.config.common().backend_type.clone()),
        );
        table.insert("raw".to_string(), toml::Value::String(raw.to_string()));
        self.registry.create_secret(name, table)
    }

    /// Rebuild the backend of `name` through the registry and drop its
    /// cached auth decisions. Returns the new readiness.
    pub async fn reinitialize(&self, name: &str) -> AppResult<(bool, String)> {
        let instance = self.instance(name)?;
        let _serialized = instance.reinit.lock().await;

        // Another caller may have recovered it while we waited.
        let current = instance.backend();
        if current.ready().0 {
            return Ok(current.ready());
        }

        let backend = self
            .registry
            .create_repo(instance.config.as_ref(), &self.local_paths)?;
        let readiness = backend.ready();
        *instance
            .backend
            .write()
            .unwrap_or_else(PoisonError::into_inner) = backend;
        instance.auth.clear();

        tracing::info!(instance = %name, ready = readiness.0, "Backend reinitialized");
        Ok(readiness)
    }

    /// Whether `secret` passes `mode` for instance `name`.
    ///
    /// Decisions are cached per secret hash for the instance TTL. A backend
    /// that is not ready is reinitialized once; if it stays down the call
    /// fails with `Unavailable` and no cached decision is consulted.
    pub async fn authenticate(
        &self,
        name: &str,
        secret: &dyn RepoSecret,
        mode: AuthMode,
    ) -> AppResult<bool> {
        let instance = self.instance(name)?;

        let mut backend = instance.backend();
        if !backend.ready().0 {
            self.reinitialize(name).await?;
            backend = instance.backend();
            let (ready, message) = backend.ready();
            if !ready {
                return Err(AppError::Unavailable(format!(
                    "Auth setup error (readonly={})\n{}",
                    mode == AuthMode::Read,
                    message
                )));
            }
        }

        let cache = instance.auth.for_mode(mode);
        let secret_hash = secret.secret_hash();
        if let Some(passed) = cache.lookup(secret_hash) {
            return Ok(passed);
        }

        let passed = match mode {
            AuthMode::Read => backend.auth_read(secret).await,
            AuthMode::Write => backend.auth_write(secret).await,
        };
        cache.store(secret_hash, passed);
        tracing::debug!(
            instance = %name,
            mode = mode.as_str(),
            secret = %short_hash(secret_hash),
            passed,
            "Authentication checked"
        );
        Ok(passed)
    }

    /// The backend of `name`, provided `secret` passes `mode`.
    pub async fn authorized_backend(
        &self,
        name: &str,
        secret: &dyn RepoSecret,
        mode: AuthMode,
    ) -> AppResult<Arc<dyn PackageRepo>> {
        if self.authenticate(name, secret, mode).await? {
            Ok(self.instance(name)?.backend())
        } else {
            Err(AppError::Unauthorized(format!(
                "Auth error (readonly={})",
                mode == AuthMode::Read
            )))
        }
    }

    /// Read-authenticated index snapshot, reloaded first if the persisted
    /// file changed underneath.
    pub async fn index_for_read(
        &self,
        name: &str,
        secret: &dyn RepoSecret,
    ) -> AppResult<Arc<PackageIndex>> {
        self.authorized_backend(name, secret, AuthMode::Read).await?;
        if let Err(e) = self.reload_index_if_changed(name).await {
            tracing::warn!(instance = %name, error = %e, "Index reload failed, serving last good index");
        }
        Ok(self.instance(name)?.index())
    }

    /// PEP 503 root page listing every distribution.
    pub async fn api_simple(&self, name: &str, secret: &dyn RepoSecret) -> AppResult<String> {
        let index = self.index_for_read(name, secret).await?;
        Ok(pages::render_simple_index(&index))
    }

    /// PEP 503 page listing the files of one distribution.
    pub async fn api_simple_distrib(
        &self,
        name: &str,
        secret: &dyn RepoSecret,
        distrib: &str,
    ) -> AppResult<String> {
        let index = self.index_for_read(name, secret).await?;
        match index.get_pkg_refs(distrib) {
            Some(pkg_refs) if !pkg_refs.is_empty() => {
                Ok(pages::render_distribution_page(distrib, pkg_refs))
            }
            _ => Err(AppError::NotFound(format!("distrib={distrib} not found."))),
        }
    }

    /// Look up the ref behind `<distrib>/<filename>`.
    pub async fn resolve_package(
        &self,
        name: &str,
        secret: &dyn RepoSecret,
        distrib: &str,
        filename: &str,
    ) -> AppResult<PkgRef> {
        let index = self.index_for_read(name, secret).await?;
        let (package, ext) = split_package_ext(filename).ok_or_else(|| {
            AppError::NotFound(format!("Package \"{distrib}, {filename}\" not exists."))
        })?;
        let pkg_ref = index.get_single_pkg_ref(distrib, package).ok_or_else(|| {
            AppError::NotFound(format!("Package \"{distrib}, {filename}\" not exists."))
        })?;
        if pkg_ref.ext != ext {
            return Err(AppError::NotFound(format!(
                "Package \"{distrib}, {filename}\" extension not match (query=\"{ext}\")"
            )));
        }
        Ok(pkg_ref.clone())
    }

    pub async fn download_package(
        &self,
        name: &str,
        secret: &dyn RepoSecret,
        distrib: &str,
        filename: &str,
        dest: &Path,
    ) -> AppResult<DownloadPackageResult> {
        let pkg_ref = self.resolve_package(name, secret, distrib, filename).await?;
        let backend = self.instance(name)?.backend();
        backend.download_package(&pkg_ref, dest).await
    }

    /// Write-authenticated upload. A stored package is appended to the
    /// in-memory index right away.
    pub async fn upload_package(
        &self,
        name: &str,
        secret: &dyn RepoSecret,
        filename: &str,
        meta: PackageMeta,
        path: &Path,
    ) -> AppResult<UploadPackageResult> {
        let backend = self
            .authorized_backend(name, secret, AuthMode::Write)
            .await?;
        let result = backend.upload_package(filename, meta, path).await?;

        if let (OperationStatus::Succeeded, Some(pkg_ref)) = (result.status, &result.pkg_ref) {
            if let Err(e) = self.instance(name)?.append_to_index(pkg_ref) {
                tracing::warn!(instance = %name, filename = %filename, error = %e, "Uploaded package not added to index");
                return Ok(UploadPackageResult::failed(&e));
            }
        }
        Ok(result)
    }

    /// Run [`Self::upload_package`] as a background job.
    pub fn upload_package_job<S: TaskScheduler>(
        self: &Arc<Self>,
        scheduler: &S,
        name: String,
        secret: Arc<dyn RepoSecret>,
        filename: String,
        meta: PackageMeta,
        path: PathBuf,
    ) -> JobHandle<AppResult<UploadPackageResult>> {
        let state = Arc::clone(self);
        scheduler.spawn_job(async move {
            state
                .upload_package(&name, secret.as_ref(), &filename, meta, &path)
                .await
        })
    }

    /// Reload the index of `name` when its persisted file no longer matches
    /// the recorded signature. Returns whether a reload happened.
    pub async fn reload_index_if_changed(&self, name: &str) -> AppResult<bool> {
        let instance = self.instance(name)?;
        let Some(current) = IndexSignature::of(&instance.index_path).await? else {
            return Ok(false);
        };
        if instance.index_signature() == Some(current) {
            return Ok(false);
        }

        let _guard = acquire_exclusive(&instance.index_lock_path, INDEX_LOCK_TIMEOUT).await?;
        // Re-read under the lock; a writer may have finished meanwhile.
        let signature = IndexSignature::of(&instance.index_path).await?;
        let index = self.registry.load_index(&instance.index_path)?;
        tracing::info!(instance = %name, packages = index.len(), "Index reloaded from disk");
        instance.swap_index(index, signature);
        Ok(true)
    }
}

fn short_hash(secret_hash: &str) -> &str {
    let end = secret_hash
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(secret_hash.len());
    &secret_hash[..end]
}
