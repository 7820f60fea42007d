//! # Package Index
//!
//! The in-memory catalog of every published package held for one backend
//! instance. Two lookups are kept over the same set of [`PkgRef`]s:
//!
//! - distribution name → refs in insertion order
//! - package identifier → ref
//!
//! A package identifier appears at most once. [`PackageIndex::add`] refuses
//! duplicates and leaves the index untouched when it does.
//!
//! ## Persisted Form
//!
//! The index is stored as TOML keyed by distribution, each value an array of
//! refs:
//!
//! ```toml
//! [[foo-bar]]
//! type = "file_system"
//! distrib = "foo-bar"
//! package = "foo_bar-1.0-py3-none-any"
//! ext = "whl"
//! sha256 = "…"
//!
//! [foo-bar.location]
//!
//! [foo-bar.meta]
//! name = "Foo_Bar"
//! ```
//!
//! Loading a dumped index yields an equal index, including the order of
//! refs within each distribution.

use crate::error::{AppError, AppResult};
use crate::normalize_distribution_name;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Serialized shape of an index file.
pub type IndexDocument = IndexMap<String, Vec<PkgRef>>;

/// One published artifact.
///
/// `location` holds backend-specific addressing (a release id, a storage
/// path) and is opaque to the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkgRef {
    #[serde(rename = "type")]
    pub backend_type: String,
    pub distrib: String,
    pub package: String,
    pub ext: String,
    pub sha256: String,
    #[serde(default)]
    pub location: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl PkgRef {
    /// File name the artifact was uploaded under, e.g. `pkg-1.0.tar.gz`.
    pub fn filename(&self) -> String {
        format!("{}.{}", self.package, self.ext)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PackageIndex {
    distrib_to_refs: IndexMap<String, Vec<PkgRef>>,
    package_to_ref: HashMap<String, PkgRef>,
}

impl PackageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from a full listing.
    ///
    /// Fails on the first duplicate package identifier.
    pub fn from_refs<I>(refs: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = PkgRef>,
    {
        let mut index = Self::new();
        for pkg_ref in refs {
            index.add(pkg_ref)?;
        }
        Ok(index)
    }

    pub fn add(&mut self, pkg_ref: PkgRef) -> AppResult<()> {
        if self.package_to_ref.contains_key(&pkg_ref.package) {
            return Err(AppError::Conflict(format!(
                "Duplicated package identifier: {}",
                pkg_ref.package
            )));
        }
        self.package_to_ref
            .insert(pkg_ref.package.clone(), pkg_ref.clone());
        self.distrib_to_refs
            .entry(pkg_ref.distrib.clone())
            .or_default()
            .push(pkg_ref);
        Ok(())
    }

    /// Distribution names in insertion order.
    pub fn all_distributions(&self) -> impl Iterator<Item = &str> {
        self.distrib_to_refs.keys().map(String::as_str)
    }

    /// Refs of a distribution; the query is normalized first.
    pub fn get_pkg_refs(&self, query_distrib: &str) -> Option<&[PkgRef]> {
        let distrib = normalize_distribution_name(query_distrib);
        self.distrib_to_refs.get(&distrib).map(Vec::as_slice)
    }

    /// The ref for `package`, provided it belongs to `query_distrib`.
    pub fn get_single_pkg_ref(&self, query_distrib: &str, package: &str) -> Option<&PkgRef> {
        let distrib = normalize_distribution_name(query_distrib);
        self.package_to_ref
            .get(package)
            .filter(|pkg_ref| pkg_ref.distrib == distrib)
    }

    pub fn get_by_package(&self, package: &str) -> Option<&PkgRef> {
        self.package_to_ref.get(package)
    }

    pub fn refs(&self) -> impl Iterator<Item = &PkgRef> {
        self.distrib_to_refs.values().flatten()
    }

    /// Number of packages.
    pub fn len(&self) -> usize {
        self.package_to_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.package_to_ref.is_empty()
    }

    pub fn to_document(&self) -> IndexDocument {
        self.distrib_to_refs.clone()
    }

    /// Rebuild from a parsed document. Each ref's own `distrib` decides its
    /// bucket; the document key is only a grouping hint.
    pub fn from_document(document: IndexDocument) -> AppResult<Self> {
        Self::from_refs(document.into_values().flatten())
    }

    pub fn to_toml_string(&self) -> AppResult<String> {
        Ok(toml::to_string(&self.distrib_to_refs)?)
    }

    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let document: IndexDocument = toml::from_str(content)?;
        Self::from_document(document)
    }
}

impl PartialEq for PackageIndex {
    fn eq(&self, other: &Self) -> bool {
        // IndexMap equality ignores order; refs within a distribution must match in order.
        self.distrib_to_refs.len() == other.distrib_to_refs.len()
            && self
                .distrib_to_refs
                .iter()
                .zip(other.distrib_to_refs.iter())
                .all(|(a, b)| a == b)
    }
}

impl Eq for PackageIndex {}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(distrib: &str, package: &str) -> PkgRef {
        PkgRef {
            backend_type: "file_system".to_string(),
            distrib: distrib.to_string(),
            package: package.to_string(),
            ext: "whl".to_string(),
            sha256: crate::hash_utils::sha256_hash(package.as_bytes()),
            location: BTreeMap::new(),
            meta: BTreeMap::from([("name".to_string(), distrib.to_string())]),
        }
    }

    #[test]
    fn test_duplicate_package_is_rejected_and_index_unchanged() {
        let mut index = PackageIndex::new();
        index.add(pkg("foo", "foo-1.0")).unwrap();
        let before = index.clone();

        let err = index.add(pkg("bar", "foo-1.0")).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(index, before);
        assert_eq!(index.len(), 1);
        assert!(index.get_pkg_refs("bar").is_none());
    }

    #[test]
    fn test_lookup_normalizes_distribution() {
        let index =
            PackageIndex::from_refs([pkg("foo-bar", "foo_bar-1.0"), pkg("foo-bar", "foo_bar-2.0")])
                .unwrap();

        let refs = index.get_pkg_refs("Foo_Bar").unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].package, "foo_bar-1.0");

        assert!(index.get_single_pkg_ref("foo.bar", "foo_bar-2.0").is_some());
        assert!(index.get_single_pkg_ref("other", "foo_bar-2.0").is_none());
    }

    #[test]
    fn test_toml_round_trip_preserves_order() {
        let index = PackageIndex::from_refs([
            pkg("zeta", "zeta-1.0"),
            pkg("alpha", "alpha-2.0"),
            pkg("alpha", "alpha-1.0"),
        ])
        .unwrap();

        let dumped = index.to_toml_string().unwrap();
        let loaded = PackageIndex::from_toml_str(&dumped).unwrap();
        assert_eq!(loaded, index);
        assert_eq!(
            loaded.all_distributions().collect::<Vec<_>>(),
            vec!["zeta", "alpha"]
        );
        let alpha: Vec<_> = loaded
            .get_pkg_refs("alpha")
            .unwrap()
            .iter()
            .map(|r| r.package.as_str())
            .collect();
        assert_eq!(alpha, vec!["alpha-2.0", "alpha-1.0"]);
    }

    #[test]
    fn test_equality_is_order_sensitive() {
        let a = PackageIndex::from_refs([pkg("x", "x-1"), pkg("x", "x-2")]).unwrap();
        let b = PackageIndex::from_refs([pkg("x", "x-2"), pkg("x", "x-1")]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_index_round_trips() {
        let index = PackageIndex::new();
        let loaded = PackageIndex::from_toml_str(&index.to_toml_string().unwrap()).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_document_with_duplicates_fails() {
        let mut document = IndexDocument::new();
        document.insert("a".into(), vec![pkg("a", "same")]);
        document.insert("b".into(), vec![pkg("b", "same")]);
        assert!(PackageIndex::from_document(document).is_err());
    }

    #[test]
    fn test_filename() {
        let mut r = pkg("pkg", "pkg-1.0");
        r.ext = "tar.gz".into();
        assert_eq!(r.filename(), "pkg-1.0.tar.gz");
    }
}
