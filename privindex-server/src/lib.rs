//! # Private Package Index Server
//!
//! Core of a private package index that fronts pluggable storage backends
//! behind a uniform, PEP 503 style interface. Clients authenticate against a
//! named backend instance, then upload or download packages; the server
//! keeps a per-instance in-memory index rebuilt from the authoritative
//! remote state and refreshed in the background.
//!
//! ## Features
//!
//! - **Pluggable backends**: every storage backend implements
//!   [`backend::PackageRepo`] and is registered under a type tag in a
//!   [`backend::registry::BackendRegistry`]
//! - **Consistent index**: [`index::PackageIndex`] rejects duplicate package
//!   identifiers and is swapped atomically on rebuild
//! - **Auth caching**: per instance, per mode TTL caches in
//!   [`auth_cache`] keep the remote auth provider off the hot path
//! - **Background sync**: [`sync`] runs a per-instance refresh cycle on the
//!   configured interval, leaving the last good index in place on failure
//!
//! ## Key Modules
//!
//! - [`config`]: Server settings and the local directory layout
//! - [`error`]: Error taxonomy and result types
//! - [`index`]: Package references and the index structure
//! - [`backend`]: Backend contract, registry and the file-system backend
//! - [`workflow`]: Process-wide state tying backends, indexes and auth together
//! - [`sync`]: Index synchronization state machine and scheduler
//! - [`scheduler`]: Periodic task and async job runner
//! - [`pages`]: PEP 503 HTML rendering
//!
//! ## Usage
//!
//! The `privindex` binary (feature `standalone-binary`) wires these
//! together; the helpers below are usable on their own.

pub mod auth_cache;
pub mod backend;
pub mod config;
pub mod error;
pub mod hash_utils;
pub mod index;
pub mod lock;
pub mod pages;
pub mod scheduler;
pub mod sync;
pub mod workflow;

#[cfg(feature = "standalone-binary")]
pub mod cli;

// Re-export key types for convenience
pub use backend::registry::{Backend, BackendRegistry};
pub use backend::{OperationStatus, PackageRepo};
pub use config::{LocalPaths, ServerSettings};
pub use error::{AppError, AppResult, ErrorCode};
pub use index::{PackageIndex, PkgRef};
pub use workflow::WorkflowState;

/// Archive extensions accepted for uploads, without the leading dot.
pub const PACKAGE_EXTENSIONS: &[&str] = &[
    "zip", "whl", "tar.bz2", "tbz", "tar.gz", "tgz", "tar", "tar.xz", "txz", "tlz", "tar.lz",
    "tar.lzma",
];

/// Normalize a distribution name according to PEP 503.
///
/// Lower-cases the name and replaces runs of `[-_.]+` with a single `-`, so
/// `Foo_Bar`, `foo.bar` and `FOO--bar` all name the same distribution.
///
/// # Examples
///
/// ```
/// # use privindex_server::normalize_distribution_name;
/// assert_eq!(normalize_distribution_name("Foo_Bar"), "foo-bar");
/// assert_eq!(normalize_distribution_name("zope.interface"), "zope-interface");
/// ```
pub fn normalize_distribution_name(name: &str) -> String {
    use regex::Regex;
    use std::sync::OnceLock;

    static DISTRIB_NAME_REGEX: OnceLock<Regex> = OnceLock::new();
    let re = DISTRIB_NAME_REGEX.get_or_init(|| {
        Regex::new(r"[-_.]+").unwrap_or_else(|e| {
            panic!("Failed to compile distribution name normalization regex: {}. This is a bug in the code - the regex pattern should be valid.", e)
        })
    });
    re.replace_all(&name.to_lowercase(), "-").to_string()
}

/// Split a package filename into its package identifier and archive
/// extension.
///
/// The longest matching extension from [`PACKAGE_EXTENSIONS`] wins, so
/// `pkg-1.0.tar.gz` yields `("pkg-1.0", "tar.gz")` rather than `tar`/`gz`.
/// Returns `None` when no known extension matches or the stem is empty.
///
/// # Examples
///
/// ```
/// # use privindex_server::split_package_ext;
/// assert_eq!(split_package_ext("pkg-1.0.tar.gz"), Some(("pkg-1.0", "tar.gz")));
/// assert_eq!(split_package_ext("a-1-py3-none-any.whl"), Some(("a-1-py3-none-any", "whl")));
/// assert_eq!(split_package_ext("README.md"), None);
/// ```
pub fn split_package_ext(filename: &str) -> Option<(&str, &str)> {
    PACKAGE_EXTENSIONS
        .iter()
        .filter_map(|ext| {
            let stem = filename.strip_suffix(ext)?.strip_suffix('.')?;
            (!stem.is_empty()).then_some((stem, *ext))
        })
        .max_by_key(|(_, ext)| ext.len())
}

/// Validates a filename to prevent path traversal attacks and other security issues.
///
/// # Errors
///
/// Returns [`AppError::BadRequest`] if the filename:
/// - Is empty or too long (>255 characters)
/// - Contains null bytes or other control characters
/// - Contains `..` (parent directory references)
/// - Is absolute or contains a path separator
///
/// # Examples
///
/// ```
/// # use privindex_server::validate_filename;
/// assert!(validate_filename("pkg-1.0.tar.gz").is_ok());
/// assert!(validate_filename("../etc/passwd").is_err());
/// assert!(validate_filename("dir/pkg.whl").is_err());
/// ```
pub fn validate_filename(filename: &str) -> Result<(), AppError> {
    if filename.is_empty() {
        tracing::warn!("Empty filename provided");
        return Err(AppError::BadRequest("Filename cannot be empty".to_string()));
    }

    // 255 bytes is the common filesystem limit
    const MAX_FILENAME_LENGTH: usize = 255;
    if filename.len() > MAX_FILENAME_LENGTH {
        tracing::warn!(filename = %filename, length = %filename.len(),
                      "Filename too long");
        return Err(AppError::BadRequest(format!(
            "Filename too long: {} characters (max: {})",
            filename.len(),
            MAX_FILENAME_LENGTH
        )));
    }

    if filename.contains('\0') {
        tracing::warn!(filename = %filename, "Null byte detected in filename");
        return Err(AppError::BadRequest(
            "Filename contains null byte".to_string(),
        ));
    }

    if filename.chars().any(|c| c.is_control()) {
        tracing::warn!(filename = %filename, "Control character detected in filename");
        return Err(AppError::BadRequest(
            "Filename contains control characters".to_string(),
        ));
    }

    if filename.contains("..") {
        tracing::warn!(filename = %filename, "Path traversal attempt detected (..)");
        return Err(AppError::BadRequest(
            "Filename contains parent directory reference (..)".to_string(),
        ));
    }

    if filename.contains('/') || filename.contains('\\') {
        tracing::warn!(filename = %filename, "Path separator detected in filename");
        return Err(AppError::BadRequest(
            "Filename cannot contain path separators".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_distribution_name() {
        assert_eq!(normalize_distribution_name("Foo_Bar"), "foo-bar");
        assert_eq!(normalize_distribution_name("a-_.b"), "a-b");
        assert_eq!(normalize_distribution_name("Pkg"), "pkg");
        assert_eq!(normalize_distribution_name("already-normal"), "already-normal");
    }

    #[test]
    fn test_split_prefers_longest_extension() {
        assert_eq!(split_package_ext("x-1.tar.lzma"), Some(("x-1", "tar.lzma")));
        assert_eq!(split_package_ext("x-1.tar.lz"), Some(("x-1", "tar.lz")));
        assert_eq!(split_package_ext("x-1.tar"), Some(("x-1", "tar")));
        assert_eq!(split_package_ext("x-1.tbz"), Some(("x-1", "tbz")));
        assert_eq!(split_package_ext("x-1.zip"), Some(("x-1", "zip")));
    }

    #[test]
    fn test_split_rejects_unknown_or_bare_extension() {
        assert_eq!(split_package_ext("x-1.exe"), None);
        assert_eq!(split_package_ext(".whl"), None);
        assert_eq!(split_package_ext("whl"), None);
        assert_eq!(split_package_ext("x-1tar.gz"), None);
    }

    #[test]
    fn test_validate_filename_rejections() {
        for bad in [
            "",
            "../x.whl",
            "/abs.whl",
            "\\abs.whl",
            "a/b.whl",
            "nul\0.whl",
            "tab\t.whl",
        ] {
            assert!(validate_filename(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(validate_filename(&"a".repeat(256)).is_err());
        assert!(validate_filename(&"a".repeat(255)).is_ok());
    }
}
