// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios against a `tempfile::TempDir` repository, exercising
//! `insert_apks` the way every `cli` subcommand does: through
//! `apkrepo_core`'s public API rather than the CLI's argument parsing. Built
//! on the "testing" feature of `apkrepo-core`, which exposes its binary-XML
//! manifest builder outside that crate's own test builds.

use apkrepo_core::apk::test_support::{
    debuggable_manifest, manifest_with_static_library, minimal_manifest,
};
use apkrepo_core::config::RepoConfig;
use apkrepo_core::layout::RepoLayout;
use apkrepo_core::orchestrator::insert_apks;
use apkrepo_core::printer::Printer;
use apkrepo_core::signer::PrivateKey;
use apkrepo_core::store::Store;
use apkrepo_core::types::{PackageName, VersionCode};
use apkrepo_core::RepoError;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn test_key() -> PrivateKey {
    PrivateKey::EcP256(p256::ecdsa::SigningKey::random(&mut rand::thread_rng()))
}

fn fast_config(temp_dir: &Path) -> RepoConfig {
    RepoConfig {
        max_deltas_per_package: 5,
        delta_concurrency: 2,
        safety_margin_bytes: 0,
        max_deferrals: 1,
        deferral_delay: Duration::from_millis(1),
        temp_dir: temp_dir.to_path_buf(),
    }
}

/// Writes a minimal but real zip-based "APK": a manifest plus a single
/// `META-INF/CERT.RSA` entry whose raw bytes determine the signer
/// certificate digest the parser facade reports.
fn write_apk(dir: &Path, file_name: &str, manifest: Vec<u8>, cert_seed: u8) -> PathBuf {
    let path = dir.join(file_name);
    let file = std::fs::File::create(&path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file("AndroidManifest.xml", options).unwrap();
    zip.write_all(&manifest).unwrap();
    zip.start_file("META-INF/CERT.RSA", options).unwrap();
    zip.write_all(&[cert_seed; 64]).unwrap();
    zip.finish().unwrap();
    path
}

fn cert_digest_hex(cert_seed: u8) -> String {
    let digest: [u8; 32] = Sha256::digest([cert_seed; 64]).into();
    hex::encode(digest)
}

#[tokio::test]
async fn cold_insert_writes_signed_public_surface_and_no_deltas() {
    let repo_dir = tempfile::tempdir().unwrap();
    let apk_dir = tempfile::tempdir().unwrap();
    let layout = RepoLayout::new(repo_dir.path());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let config = fast_config(repo_dir.path());
    let key = test_key();

    let apk = write_apk(apk_dir.path(), "com.x-1.apk", minimal_manifest("com.x", 1), 1);

    let report = insert_apks(
        &layout,
        &store,
        &config,
        Arc::new(Printer::new()),
        &key,
        &[apk],
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.written_packages.len(), 1);
    assert!(layout.public_key_file().exists());

    let package = PackageName::parse("com.x").unwrap();
    assert!(layout.apk_file(&package, VersionCode::new(1)).exists());
    assert!(layout.metadata_file(&package).exists());

    let index = std::fs::read_to_string(layout.index_file()).unwrap();
    // First line of a signed file is the signature; the index body follows.
    let body = index.splitn(2, '\n').nth(1).unwrap();
    assert!(body.trim_end().ends_with(|c: char| c.is_ascii_digit()));
    assert!(body.contains("com.x:1"));

    assert!(layout.delta_files_on_disk(&package).unwrap().is_empty());
}

#[tokio::test]
async fn sequential_versions_keep_a_bounded_delta_window() {
    let repo_dir = tempfile::tempdir().unwrap();
    let apk_dir = tempfile::tempdir().unwrap();
    let layout = RepoLayout::new(repo_dir.path());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let config = fast_config(repo_dir.path());
    let key = test_key();
    let package = PackageName::parse("com.x").unwrap();

    for version in 1..=7u64 {
        let apk = write_apk(
            apk_dir.path(),
            &format!("com.x-{version}.apk"),
            minimal_manifest("com.x", version),
            1,
        );
        insert_apks(
            &layout,
            &store,
            &config,
            Arc::new(Printer::new()),
            &key,
            &[apk],
            None,
        )
        .await
        .unwrap();
    }

    let mut deltas = layout.delta_files_on_disk(&package).unwrap();
    deltas.sort_by_key(|(base, _, _)| *base);
    assert_eq!(deltas.len(), 5);
    for (i, (base, target, _)) in deltas.iter().enumerate() {
        assert_eq!(base.get(), (i as u64) + 2);
        assert_eq!(target.get(), 7);
    }
}

#[tokio::test]
async fn debuggable_apk_is_rejected_without_mutation() {
    let repo_dir = tempfile::tempdir().unwrap();
    let apk_dir = tempfile::tempdir().unwrap();
    let layout = RepoLayout::new(repo_dir.path());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let config = fast_config(repo_dir.path());
    let key = test_key();

    let apk = write_apk(
        apk_dir.path(),
        "com.x-1.apk",
        debuggable_manifest("com.x", 1),
        1,
    );

    let err = insert_apks(
        &layout,
        &store,
        &config,
        Arc::new(Printer::new()),
        &key,
        &[apk],
        None,
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("debuggable"));
    let package = PackageName::parse("com.x").unwrap();
    assert!(!layout.dir_for_package(&package).exists());
}

#[tokio::test]
async fn key_mismatch_is_rejected_without_mutation() {
    let repo_dir = tempfile::tempdir().unwrap();
    let apk_dir = tempfile::tempdir().unwrap();
    let layout = RepoLayout::new(repo_dir.path());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let config = fast_config(repo_dir.path());
    let key_one = test_key();
    let key_two = test_key();

    let apk_one = write_apk(apk_dir.path(), "com.x-1.apk", minimal_manifest("com.x", 1), 1);
    insert_apks(
        &layout,
        &store,
        &config,
        Arc::new(Printer::new()),
        &key_one,
        &[apk_one],
        None,
    )
    .await
    .unwrap();

    let apk_two = write_apk(apk_dir.path(), "com.y-1.apk", minimal_manifest("com.y", 1), 1);
    let err = insert_apks(
        &layout,
        &store,
        &config,
        Arc::new(Printer::new()),
        &key_two,
        &[apk_two],
        None,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RepoError::RepoSigningKeyMismatch));
    let other = PackageName::parse("com.y").unwrap();
    assert!(!layout.dir_for_package(&other).exists());
}

#[tokio::test]
async fn static_library_dependency_satisfied_cross_batch() {
    let repo_dir = tempfile::tempdir().unwrap();
    let apk_dir = tempfile::tempdir().unwrap();
    let layout = RepoLayout::new(repo_dir.path());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let config = fast_config(repo_dir.path());
    let key = test_key();

    let lib_cert_seed = 9u8;
    let lib_apk = write_apk(
        apk_dir.path(),
        "lib.pkg-10.apk",
        minimal_manifest("lib.pkg", 10),
        lib_cert_seed,
    );
    let app_apk = write_apk(
        apk_dir.path(),
        "app.pkg-1.apk",
        manifest_with_static_library(
            "app.pkg",
            1,
            "lib.pkg",
            10,
            &cert_digest_hex(lib_cert_seed),
        ),
        1,
    );

    let report = insert_apks(
        &layout,
        &store,
        &config,
        Arc::new(Printer::new()),
        &key,
        &[lib_apk, app_apk],
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.written_packages.len(), 2);
    let index = std::fs::read_to_string(layout.index_file()).unwrap();
    assert!(index.contains("lib.pkg:10"));
    assert!(index.contains("app.pkg:1"));
}

#[tokio::test]
async fn chain_break_is_rejected_without_mutation() {
    let repo_dir = tempfile::tempdir().unwrap();
    let apk_dir = tempfile::tempdir().unwrap();
    let layout = RepoLayout::new(repo_dir.path());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let config = fast_config(repo_dir.path());
    let key = test_key();

    let v1 = write_apk(apk_dir.path(), "com.x-1.apk", minimal_manifest("com.x", 1), 1);
    insert_apks(
        &layout,
        &store,
        &config,
        Arc::new(Printer::new()),
        &key,
        &[v1],
        None,
    )
    .await
    .unwrap();

    let index_before = std::fs::read_to_string(layout.index_file()).unwrap();

    let v2 = write_apk(apk_dir.path(), "com.x-2.apk", minimal_manifest("com.x", 2), 2);
    let err = insert_apks(
        &layout,
        &store,
        &config,
        Arc::new(Printer::new()),
        &key,
        &[v2],
        None,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RepoError::ValidationFailed(_, _)));
    let package = PackageName::parse("com.x").unwrap();
    assert!(!layout.apk_file(&package, VersionCode::new(2)).exists());
    let index_after = std::fs::read_to_string(layout.index_file()).unwrap();
    assert_eq!(index_before, index_after);
}
