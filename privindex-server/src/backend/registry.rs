//! # Backend Registry
//!
//! Maps a backend type tag (`"file_system"`, …) to the factories that build
//! its config, secret, repository and package references from untyped TOML
//! tables.
//!
//! Backends are registered explicitly through the [`Backend`] trait; there
//! is no runtime discovery. [`BackendRegistry::global`] holds the built-in
//! backends and is initialized once on first use. Tests and embedders build
//! their own with [`BackendRegistry::new`] and pass it to the workflow
//! instead of mutating the shared one.
//!
//! ## Files
//!
//! Config and secret files are TOML tables keyed by instance name:
//!
//! ```toml
//! [local]
//! type = "file_system"
//! read_secret = "r"
//! write_secret = "w"
//! ```
//!
//! Secrets can be loaded but never dumped.

use super::file_system::FileSystemBackend;
use super::{PackageRepo, RepoConfig, RepoSecret, SecretFields};
use crate::config::LocalPaths;
use crate::error::{AppError, AppResult};
use crate::index::{IndexDocument, PackageIndex, PkgRef};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Compile-time description of one backend variant.
pub trait Backend: 'static {
    /// Type tag found in the `type` field of configs, secrets and refs.
    const TYPE: &'static str;

    type Config: RepoConfig + Clone + DeserializeOwned;
    type Secret: RepoSecret;
    /// Backend-specific addressing stored in [`PkgRef::location`].
    type Location: Serialize + DeserializeOwned;

    fn create_secret(fields: SecretFields) -> AppResult<Self::Secret>;

    fn create_repo(config: Self::Config, paths: &LocalPaths) -> AppResult<Arc<dyn PackageRepo>>;
}

type ConfigFactory = fn(toml::Table) -> AppResult<Arc<dyn RepoConfig>>;
type SecretFactory = fn(toml::Table) -> AppResult<Arc<dyn RepoSecret>>;
type RepoFactory = fn(&dyn RepoConfig, &LocalPaths) -> AppResult<Arc<dyn PackageRepo>>;
type PkgRefFactory = fn(toml::Table) -> AppResult<PkgRef>;

/// The four factories registered for one type tag.
#[derive(Clone, Copy)]
pub struct BackendRegistration {
    pub backend_type: &'static str,
    create_config: ConfigFactory,
    create_secret: SecretFactory,
    create_repo: RepoFactory,
    create_pkg_ref: PkgRefFactory,
}

impl std::fmt::Debug for BackendRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistration")
            .field("backend_type", &self.backend_type)
            .finish_non_exhaustive()
    }
}

impl BackendRegistration {
    pub fn of<B: Backend>() -> Self {
        Self {
            backend_type: B::TYPE,
            create_config: create_config_for::<B>,
            create_secret: create_secret_for::<B>,
            create_repo: create_repo_for::<B>,
            create_pkg_ref: create_pkg_ref_for::<B>,
        }
    }
}

fn check_type(table: &toml::Table, expected: &str) -> AppResult<()> {
    match table.get("type").and_then(toml::Value::as_str) {
        Some(t) if t == expected => Ok(()),
        Some(t) => Err(AppError::BadRequest(format!(
            "type mismatch: expected '{expected}', got '{t}'"
        ))),
        None => Err(AppError::BadRequest("missing 'type' field".to_string())),
    }
}

fn create_config_for<B: Backend>(table: toml::Table) -> AppResult<Arc<dyn RepoConfig>> {
    check_type(&table, B::TYPE)?;
    let config: B::Config = toml::Value::Table(table).try_into()?;
    Ok(Arc::new(config))
}

fn create_secret_for<B: Backend>(table: toml::Table) -> AppResult<Arc<dyn RepoSecret>> {
    check_type(&table, B::TYPE)?;
    let fields: SecretFields = toml::Value::Table(table).try_into()?;
    Ok(Arc::new(B::create_secret(fields)?))
}

fn create_repo_for<B: Backend>(
    config: &dyn RepoConfig,
    paths: &LocalPaths,
) -> AppResult<Arc<dyn PackageRepo>> {
    let config = config
        .as_any()
        .downcast_ref::<B::Config>()
        .cloned()
        .ok_or_else(|| {
            AppError::BadRequest(format!(
                "config of instance '{}' is not a {} config",
                config.common().name,
                B::TYPE
            ))
        })?;
    B::create_repo(config, paths)
}

fn create_pkg_ref_for<B: Backend>(table: toml::Table) -> AppResult<PkgRef> {
    check_type(&table, B::TYPE)?;
    let pkg_ref: PkgRef = toml::Value::Table(table).try_into()?;
    // Reject refs whose location this backend cannot address.
    let location = toml::Value::try_from(&pkg_ref.location)?;
    let _: B::Location = location.try_into().map_err(|e| {
        AppError::BadRequest(format!(
            "invalid location for package '{}': {e}",
            pkg_ref.package
        ))
    })?;
    Ok(pkg_ref)
}

#[derive(Debug, Default)]
pub struct BackendRegistry {
    registrations: HashMap<&'static str, BackendRegistration>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every backend compiled into this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        // Built-in tags are distinct and well formed.
        let _ = registry.register::<FileSystemBackend>();
        registry
    }

    /// Process-wide registry of the built-in backends, built on first use.
    pub fn global() -> Arc<BackendRegistry> {
        static GLOBAL: OnceLock<Arc<BackendRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(Self::with_builtin()))
            .clone()
    }

    pub fn register<B: Backend>(&mut self) -> AppResult<()> {
        let tag = B::TYPE;
        let well_formed = !tag.is_empty()
            && tag
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !well_formed {
            return Err(AppError::BadRequest(format!(
                "invalid backend type tag '{tag}'"
            )));
        }
        if self.registrations.contains_key(tag) {
            return Err(AppError::Conflict(format!(
                "backend type '{tag}' is already registered"
            )));
        }
        tracing::debug!(backend_type = tag, "Registered backend");
        self.registrations.insert(tag, BackendRegistration::of::<B>());
        Ok(())
    }

    pub fn backend_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.registrations.keys().copied()
    }

    fn registration(&self, table: &toml::Table) -> AppResult<&BackendRegistration> {
        let backend_type = table
            .get("type")
            .and_then(toml::Value::as_str)
            .ok_or_else(|| AppError::BadRequest("missing 'type' field".to_string()))?;
        self.registrations.get(backend_type).ok_or_else(|| {
            AppError::BadRequest(format!("unknown backend type '{backend_type}'"))
        })
    }

    pub fn create_config(&self, name: &str, mut table: toml::Table) -> AppResult<Arc<dyn RepoConfig>> {
        let registration = self.registration(&table)?;
        table.insert("name".to_string(), toml::Value::String(name.to_string()));
        (registration.create_config)(table)
    }

    pub fn create_secret(&self, name: &str, mut table: toml::Table) -> AppResult<Arc<dyn RepoSecret>> {
        let registration = self.registration(&table)?;
        table.insert("name".to_string(), toml::Value::String(name.to_string()));
        (registration.create_secret)(table)
    }

    pub fn create_repo(
        &self,
        config: &dyn RepoConfig,
        paths: &LocalPaths,
    ) -> AppResult<Arc<dyn PackageRepo>> {
        let backend_type = config.common().backend_type.as_str();
        let registration = self.registrations.get(backend_type).ok_or_else(|| {
            AppError::BadRequest(format!("unknown backend type '{backend_type}'"))
        })?;
        (registration.create_repo)(config, paths)
    }

    pub fn create_pkg_ref(&self, table: toml::Table) -> AppResult<PkgRef> {
        let registration = self.registration(&table)?;
        (registration.create_pkg_ref)(table)
    }

    /// Load instance configs. Names are lower-cased.
    pub fn load_configs(&self, path: &Path) -> AppResult<IndexMap<String, Arc<dyn RepoConfig>>> {
        let mut configs = IndexMap::new();
        for (name, table) in read_named_tables(path, "config")? {
            let name = name.to_lowercase();
            let config = self.create_config(&name, table)?;
            configs.insert(name, config);
        }
        Ok(configs)
    }

    pub fn dump_configs<'a, I>(path: &Path, configs: I) -> AppResult<()>
    where
        I: IntoIterator<Item = &'a dyn RepoConfig>,
    {
        let mut document = toml::Table::new();
        for config in configs {
            document.insert(
                config.common().name.to_lowercase(),
                toml::Value::Table(config.to_table()?),
            );
        }
        fs::write(path, toml::to_string(&document)?)?;
        Ok(())
    }

    pub fn load_secrets(&self, path: &Path) -> AppResult<IndexMap<String, Arc<dyn RepoSecret>>> {
        let mut secrets = IndexMap::new();
        for (name, table) in read_named_tables(path, "secret")? {
            let name = name.to_lowercase();
            let secret = self.create_secret(&name, table)?;
            secrets.insert(name, secret);
        }
        Ok(secrets)
    }

    /// Always fails. Secrets are never written back to disk.
    pub fn dump_secrets<'a, I>(_path: &Path, _secrets: I) -> AppResult<()>
    where
        I: IntoIterator<Item = &'a dyn RepoSecret>,
    {
        Err(AppError::BadRequest("Should not dump secrets.".to_string()))
    }

    /// Load an index file, building each ref through its backend's factory.
    pub fn load_index(&self, path: &Path) -> AppResult<PackageIndex> {
        let content = fs::read_to_string(path)?;
        self.parse_index(&content)
    }

    pub fn parse_index(&self, content: &str) -> AppResult<PackageIndex> {
        let raw: IndexMap<String, Vec<toml::Table>> = toml::from_str(content)?;
        let mut document = IndexDocument::new();
        for (distrib, tables) in raw {
            let refs = tables
                .into_iter()
                .map(|table| self.create_pkg_ref(table))
                .collect::<AppResult<Vec<_>>>()?;
            document.insert(distrib, refs);
        }
        PackageIndex::from_document(document)
    }

    pub fn dump_index(path: &Path, index: &PackageIndex) -> AppResult<()> {
        fs::write(path, index.to_toml_string()?)?;
        Ok(())
    }
}

fn read_named_tables(path: &Path, what: &str) -> AppResult<Vec<(String, toml::Table)>> {
    let content = fs::read_to_string(path)?;
    let document: toml::Table = toml::from_str(&content)?;
    document
        .into_iter()
        .map(|(name, value)| match value {
            toml::Value::Table(table) => Ok((name, table)),
            other => Err(AppError::BadRequest(format!(
                "Invalid {what}, name={name}, value={other}"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::file_system::FILE_SYSTEM_TYPE;

    fn table(content: &str) -> toml::Table {
        toml::from_str(content).unwrap()
    }

    #[test]
    fn test_builtin_registry_knows_file_system() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.backend_types().collect::<Vec<_>>(), vec![FILE_SYSTEM_TYPE]);
        assert!(BackendRegistry::global()
            .backend_types()
            .any(|t| t == FILE_SYSTEM_TYPE));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = BackendRegistry::with_builtin();
        let err = registry.register::<FileSystemBackend>().unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn test_unknown_type_fails() {
        let registry = BackendRegistry::with_builtin();
        let err = registry
            .create_config("x", table("type = \"ftp\""))
            .unwrap_err();
        assert!(err.to_string().contains("unknown backend type"));

        let err = registry.create_config("x", table("raw = \"y\"")).unwrap_err();
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn test_create_config_sets_name_and_defaults() {
        let registry = BackendRegistry::with_builtin();
        let config = registry
            .create_config(
                "local",
                table("type = \"file_system\"\nread_secret = \"r\"\nwrite_secret = \"w\""),
            )
            .unwrap();
        assert_eq!(config.common().name, "local");
        assert_eq!(config.common().sync_index_interval, 60);
        assert_eq!(config.common().max_file_bytes, 1024 * 1024 * 1024);
    }

    #[test]
    fn test_configs_round_trip_and_names_lowercased() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[Local]\ntype = \"file_system\"\nread_secret = \"r\"\nwrite_secret = \"w\"\nsync_index_interval = 5\n",
        )
        .unwrap();

        let registry = BackendRegistry::with_builtin();
        let configs = registry.load_configs(&path).unwrap();
        assert!(configs.contains_key("local"));

        let dumped = dir.path().join("dumped.toml");
        BackendRegistry::dump_configs(&dumped, configs.values().map(|c| c.as_ref())).unwrap();
        let reloaded = registry.load_configs(&dumped).unwrap();
        assert_eq!(reloaded["local"].common(), configs["local"].common());
        assert!(!fs::read_to_string(&dumped).unwrap().contains("name"));
    }

    #[test]
    fn test_non_table_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "local = 3\n").unwrap();
        let err = BackendRegistry::with_builtin().load_configs(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid config"));
    }

    #[test]
    fn test_secrets_load_but_never_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.toml");
        fs::write(&path, "[local]\ntype = \"file_system\"\nraw = \"w\"\n").unwrap();

        let registry = BackendRegistry::with_builtin();
        let secrets = registry.load_secrets(&path).unwrap();
        assert_eq!(secrets["local"].name(), "local");

        let out = dir.path().join("out.toml");
        assert!(BackendRegistry::dump_secrets(&out, secrets.values().map(|s| s.as_ref())).is_err());
        assert!(!out.exists());
    }

    #[test]
    fn test_index_load_rejects_unknown_ref_type() {
        let registry = BackendRegistry::with_builtin();
        let err = registry
            .parse_index(
                "[[pkg]]\ntype = \"ftp\"\ndistrib = \"pkg\"\npackage = \"pkg-1\"\next = \"whl\"\nsha256 = \"0\"\n",
            )
            .unwrap_err();
        assert!(err.to_string().contains("unknown backend type"));
    }
}
