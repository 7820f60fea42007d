//! Index consistency and persistence through the registry.

mod common;

use privindex_server::{BackendRegistry, ErrorCode, PackageIndex, PkgRef};
use std::collections::BTreeMap;

fn pkg_ref(distrib: &str, package: &str, ext: &str) -> PkgRef {
    PkgRef {
        backend_type: "file_system".into(),
        distrib: distrib.into(),
        package: package.into(),
        ext: ext.into(),
        sha256: format!("{:0>64}", package.len()),
        location: BTreeMap::from([
            ("package_path".to_string(), format!("{distrib}/{package}.{ext}")),
            ("meta_path".to_string(), format!("{distrib}/{package}.{ext}.meta")),
        ]),
        meta: BTreeMap::from([("name".to_string(), distrib.to_string())]),
    }
}

#[test]
fn test_duplicate_identifier_leaves_index_unchanged() {
    let mut index = PackageIndex::from_refs([
        pkg_ref("pkg", "pkg-1.0", "tar.gz"),
        pkg_ref("pkg", "pkg-1.1", "whl"),
    ])
    .unwrap();
    let before = index.clone();

    // Same identifier under another distribution is still a duplicate.
    let err = index.add(pkg_ref("other", "pkg-1.0", "zip")).unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::Conflict);
    assert_eq!(index, before);
    assert!(index.get_pkg_refs("other").is_none());
    assert_eq!(index.get_by_package("pkg-1.0").unwrap().ext, "tar.gz");

    let err = PackageIndex::from_refs([
        pkg_ref("a", "dup", "whl"),
        pkg_ref("b", "dup", "whl"),
    ])
    .unwrap_err();
    assert!(err.to_string().contains("Duplicated package identifier"));
}

#[test]
fn test_dump_then_load_preserves_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.toml");
    let registry = common::test_registry();

    let index = PackageIndex::from_refs([
        pkg_ref("zeta", "zeta-2.0", "whl"),
        pkg_ref("alpha", "alpha-1.0", "tar.gz"),
        pkg_ref("zeta", "zeta-1.0", "whl"),
    ])
    .unwrap();
    BackendRegistry::dump_index(&path, &index).unwrap();
    let loaded = registry.load_index(&path).unwrap();

    assert_eq!(loaded, index);
    let distribs: Vec<&str> = loaded.all_distributions().collect();
    assert_eq!(distribs, ["zeta", "alpha"]);
    let zeta: Vec<&str> = loaded
        .get_pkg_refs("ZETA")
        .unwrap()
        .iter()
        .map(|r| r.package.as_str())
        .collect();
    assert_eq!(zeta, ["zeta-2.0", "zeta-1.0"]);
}

#[test]
fn test_load_rejects_unknown_backend_type() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    let mut bad = pkg_ref("pkg", "pkg-1.0", "whl");
    bad.backend_type = "nope".into();
    std::fs::write(
        &path,
        PackageIndex::from_refs([bad]).unwrap().to_toml_string().unwrap(),
    )
    .unwrap();

    let err = common::test_registry().load_index(&path).unwrap_err();
    assert!(err.to_string().contains("unknown backend type 'nope'"));
}
