//! # Server Settings and Local Layout
//!
//! Process-wide settings for the index server and the directory layout it
//! keeps under its root folder.
//!
//! Backend-instance configuration (the TOML table keyed by instance name)
//! is not handled here; it is typed per backend and loaded through
//! [`crate::backend::registry::BackendRegistry::load_configs`].
//!
//! ## Loading Settings
//!
//! ```rust,no_run
//! # use privindex_server::config::ServerSettings;
//! // Read PRIVINDEX_* variables with built-in defaults
//! let settings = ServerSettings::from_env()?;
//!
//! // Or point at a TOML settings file
//! let settings = ServerSettings::load("privindex.toml")?;
//! # Ok::<(), privindex_server::AppError>(())
//! ```

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default TTL for cached read-auth decisions, in seconds.
pub const DEFAULT_AUTH_READ_EXPIRES: u64 = 3600;
/// Default TTL for cached write-auth decisions, in seconds.
pub const DEFAULT_AUTH_WRITE_EXPIRES: u64 = 300;
/// Default deadline for one sync cycle of one instance, in seconds.
pub const DEFAULT_SYNC_DEADLINE: u64 = 300;

/// Settings shared by every backend instance served by this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Backend-instance config file (TOML keyed by instance name)
    pub config: PathBuf,
    /// Optional secrets file granting the server admin access per instance
    #[serde(default)]
    pub admin_secret: Option<PathBuf>,
    /// Root folder holding the index, lock, job and cache directories
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_auth_read_expires")]
    pub auth_read_expires: u64,
    #[serde(default = "default_auth_write_expires")]
    pub auth_write_expires: u64,
    #[serde(default = "default_sync_deadline")]
    pub sync_deadline: u64,
}

fn default_root() -> PathBuf {
    env::temp_dir().join("privindex")
}

fn default_auth_read_expires() -> u64 {
    DEFAULT_AUTH_READ_EXPIRES
}

fn default_auth_write_expires() -> u64 {
    DEFAULT_AUTH_WRITE_EXPIRES
}

fn default_sync_deadline() -> u64 {
    DEFAULT_SYNC_DEADLINE
}

impl ServerSettings {
    /// Settings pointing at `config` with every other field defaulted.
    pub fn new(config: impl Into<PathBuf>) -> Self {
        Self {
            config: config.into(),
            admin_secret: None,
            root: default_root(),
            auth_read_expires: DEFAULT_AUTH_READ_EXPIRES,
            auth_write_expires: DEFAULT_AUTH_WRITE_EXPIRES,
            sync_deadline: DEFAULT_SYNC_DEADLINE,
        }
    }

    /// Load settings from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Build settings from `PRIVINDEX_*` environment variables.
    ///
    /// `PRIVINDEX_CONFIG` is required; the rest fall back to defaults.
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let config = lookup("PRIVINDEX_CONFIG").ok_or_else(|| {
            AppError::BadRequest("PRIVINDEX_CONFIG is not set".to_string())
        })?;
        let mut settings = Self::new(config);
        settings.admin_secret = lookup("PRIVINDEX_ADMIN_SECRET").map(PathBuf::from);
        if let Some(root) = lookup("PRIVINDEX_ROOT") {
            settings.root = PathBuf::from(root);
        }
        if let Some(value) = lookup("PRIVINDEX_AUTH_READ_EXPIRES") {
            settings.auth_read_expires = parse_seconds("PRIVINDEX_AUTH_READ_EXPIRES", &value)?;
        }
        if let Some(value) = lookup("PRIVINDEX_AUTH_WRITE_EXPIRES") {
            settings.auth_write_expires = parse_seconds("PRIVINDEX_AUTH_WRITE_EXPIRES", &value)?;
        }
        Ok(settings)
    }

    pub fn local_paths(&self) -> LocalPaths {
        LocalPaths::under(&self.root)
    }

    pub fn sync_deadline(&self) -> Duration {
        Duration::from_secs(self.sync_deadline)
    }
}

fn parse_seconds(key: &str, value: &str) -> AppResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::BadRequest(format!("{key} must be a number of seconds, got '{value}'")))
}

/// Directories the server owns under its root folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPaths {
    /// Persisted per-instance index files
    pub index: PathBuf,
    pub log: PathBuf,
    /// Lock files, one subdirectory per instance
    pub lock: PathBuf,
    pub job: PathBuf,
    /// Per-instance backend working directories
    pub cache: PathBuf,
}

impl LocalPaths {
    pub fn under(root: &Path) -> Self {
        Self {
            index: root.join("index"),
            log: root.join("log"),
            lock: root.join("lock"),
            job: root.join("job"),
            cache: root.join("cache"),
        }
    }

    /// Create every directory, including missing parents.
    pub fn makedirs(&self) -> AppResult<()> {
        for dir in [&self.index, &self.log, &self.lock, &self.job, &self.cache] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Where the in-memory index of `instance` is persisted.
    pub fn index_file(&self, instance: &str) -> PathBuf {
        self.index.join(format!("{instance}.toml"))
    }

    pub fn instance_cache(&self, instance: &str) -> PathBuf {
        self.cache.join(instance)
    }

    pub fn instance_lock_dir(&self, instance: &str) -> PathBuf {
        self.lock.join(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_defaults() {
        let settings = ServerSettings::from_lookup(lookup_from(&[(
            "PRIVINDEX_CONFIG",
            "/etc/privindex/config.toml",
        )]))
        .unwrap();
        assert_eq!(settings.config, PathBuf::from("/etc/privindex/config.toml"));
        assert_eq!(settings.admin_secret, None);
        assert_eq!(settings.auth_read_expires, 3600);
        assert_eq!(settings.auth_write_expires, 300);
    }

    #[test]
    fn test_env_overrides() {
        let settings = ServerSettings::from_lookup(lookup_from(&[
            ("PRIVINDEX_CONFIG", "c.toml"),
            ("PRIVINDEX_ADMIN_SECRET", "admin.toml"),
            ("PRIVINDEX_ROOT", "/srv/privindex"),
            ("PRIVINDEX_AUTH_READ_EXPIRES", "10"),
            ("PRIVINDEX_AUTH_WRITE_EXPIRES", "0"),
        ]))
        .unwrap();
        assert_eq!(settings.admin_secret, Some(PathBuf::from("admin.toml")));
        assert_eq!(settings.root, PathBuf::from("/srv/privindex"));
        assert_eq!(settings.auth_read_expires, 10);
        assert_eq!(settings.auth_write_expires, 0);
    }

    #[test]
    fn test_missing_config_is_rejected() {
        assert!(ServerSettings::from_lookup(lookup_from(&[])).is_err());
    }

    #[test]
    fn test_bad_ttl_is_rejected() {
        let err = ServerSettings::from_lookup(lookup_from(&[
            ("PRIVINDEX_CONFIG", "c.toml"),
            ("PRIVINDEX_AUTH_READ_EXPIRES", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("PRIVINDEX_AUTH_READ_EXPIRES"));
    }

    #[test]
    fn test_load_from_toml_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "config = \"backends.toml\"\nroot = \"/data\"\n").unwrap();

        let settings = ServerSettings::load(&path).unwrap();
        assert_eq!(settings.root, PathBuf::from("/data"));
        assert_eq!(settings.auth_write_expires, DEFAULT_AUTH_WRITE_EXPIRES);
        assert_eq!(settings.sync_deadline(), Duration::from_secs(300));
    }

    #[test]
    fn test_local_paths_makedirs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LocalPaths::under(dir.path());
        paths.makedirs().unwrap();
        for sub in ["index", "log", "lock", "job", "cache"] {
            assert!(dir.path().join(sub).is_dir(), "{sub} missing");
        }
        assert_eq!(paths.index_file("gh"), dir.path().join("index/gh.toml"));
    }
}
