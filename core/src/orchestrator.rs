// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Insertion Orchestrator (component F, `spec.md` §4.F).
//!
//! The single transactional entry point for "insert N APKs grouped by
//! package": coordinates the parser facade (C), the dependency/chain
//! validator (E), the metadata store (B), the delta engine (G), and the
//! metadata publisher (H). Everything here runs as one `insert_apks` call;
//! nothing else in the crate opens a store transaction.

use crate::apk::{self, ApkDescriptor};
use crate::config::RepoConfig;
use crate::delta;
use crate::error::{RepoError, Result};
use crate::layout::RepoLayout;
use crate::model::Release;
use crate::printer::Printer;
use crate::publisher;
use crate::signer::PrivateKey;
use crate::store::{self, PendingApk, Store};
use crate::types::{PackageName, Timestamp, VersionCode};
use crate::validator;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Collects operator-entered release notes for the highest-version APK in a
/// group, when the caller passed `--release-notes`. Implemented in the `cli`
/// crate (`spec.md` §4.I / §9: the editor invocation is reused-but-not-core),
/// which holds the print mutex for the prompt's duration.
pub trait ReleaseNotesPrompt: Send + Sync {
    fn prompt(
        &self,
        package: &PackageName,
        version: VersionCode,
        existing_notes: Option<&str>,
        last_edit: Timestamp,
    ) -> Result<Option<String>>;
}

/// Outcome of one `insert_apks` call.
#[derive(Debug, Default)]
pub struct InsertReport {
    pub written_packages: Vec<PackageName>,
    pub skipped_packages: Vec<PackageName>,
    pub warnings: Vec<String>,
    pub delta_failures: Vec<(PackageName, RepoError)>,
}

/// Public operation `insertApks(paths, key, promptNotes?)` (`spec.md` §4.F).
pub async fn insert_apks(
    layout: &RepoLayout,
    store: &Arc<Store>,
    config: &RepoConfig,
    printer: Arc<Printer>,
    key: &PrivateKey,
    paths: &[PathBuf],
    notes_prompt: Option<&dyn ReleaseNotesPrompt>,
) -> Result<InsertReport> {
    let timestamp = Timestamp::now();

    // Step 1: public key continuity.
    ensure_signing_key_matches(layout, key)?;

    // Step 2: parse every APK in parallel, group by package, sort ascending.
    let parse_start = std::time::Instant::now();
    let descriptors = parse_all(paths).await?;
    log::info!(
        "parsed {} APK(s) in {:?}",
        descriptors.len(),
        parse_start.elapsed()
    );
    let groups = group_by_package(descriptors);

    // Step 3: validate the combined (batch ∪ repo) view before any write.
    let (combined, incoming_keys) = build_combined_view(store, &groups, timestamp)?;
    let outcome = validator::validate(&combined, &incoming_keys)?;

    let mut report = InsertReport::default();
    report.warnings.extend(outcome.warnings);

    // Spawn the delta engine actor up front; per-package signals are sent as
    // each group commits below, and we drain it once the transaction lands.
    let delta_handle = delta::spawn(layout.clone(), store.clone(), config.clone(), printer);

    // Steps 4-5: one transaction covering every group in input order.
    let mut inserted_packages: Vec<PackageName> = Vec::new();
    let mut skipped_packages: Vec<PackageName> = Vec::new();
    let mut txn_warnings: Vec<String> = Vec::new();
    let mut signaled_packages: Vec<PackageName> = Vec::new();

    let txn_result = store.transaction(|conn, hooks| {
        for (package, group) in &groups {
            let existing_latest = store::get_latest_release(conn, package)?;
            let lowest_incoming = group[0].1.version_code;

            if let Some(existing) = &existing_latest {
                if lowest_incoming <= existing.version_code {
                    let soft_err = RepoError::MoreRecentVersionInRepo {
                        package: package.as_str().to_string(),
                        incoming: lowest_incoming.get(),
                        existing: existing.version_code.get(),
                    };
                    txn_warnings.push(soft_err.to_string());
                    skipped_packages.push(package.clone());
                    continue;
                }
            }

            let dir = layout.dir_for_package(package);
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
                let dir_for_hook = dir.clone();
                hooks.after_rollback(move || {
                    let _ = std::fs::remove_dir_all(&dir_for_hook);
                });
            }

            // Re-validate the chain against what's actually on disk plus
            // this group, rather than trusting the pre-transaction combined
            // view still holds (`spec.md` §4.F step 5).
            let mut chain_view = store::get_releases_ascending(conn, package)?;
            chain_view.extend(group.iter().map(|(_, d)| descriptor_to_release(d, timestamp)));
            chain_view.sort_by_key(|r| r.version_code);
            validator::validate_chain_for_package(&chain_view)?;

            let (_, highest_desc) = group.last().expect("group is never empty");
            let notes_for_latest = match notes_prompt {
                Some(prompt) => prompt.prompt(package, highest_desc.version_code, None, timestamp)?,
                None => None,
            };

            let pending: Vec<PendingApk> = group
                .iter()
                .map(|(path, desc)| PendingApk {
                    release: descriptor_to_release(desc, timestamp),
                    label: desc.label.clone(),
                    icon: desc.icon.clone(),
                    source_path: path.clone(),
                })
                .collect();

            store::upsert_apks(conn, layout, package, &pending, notes_for_latest, timestamp)?;

            inserted_packages.push(package.clone());
            signaled_packages.push(package.clone());
        }
        Ok(())
    });

    if let Err(err) = &txn_result {
        log::error!(
            "insertion failed, rolling back; packages touched before the failure: {}: {err}",
            inserted_packages
                .iter()
                .map(PackageName::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    txn_result?;

    for package in signaled_packages {
        delta_handle.for_package(package);
    }
    delta_handle.start_printing();
    let delta_failures = delta_handle.drain().await;
    for (package, err) in &delta_failures {
        report
            .warnings
            .push(format!("delta generation failed for {package}: {err}"));
    }
    report.delta_failures = delta_failures;
    report.warnings.extend(txn_warnings);
    report.skipped_packages = skipped_packages;

    // Step 7: regenerate the signed public surface only if something landed.
    if !inserted_packages.is_empty() {
        publisher::publish_all(layout, store, key, timestamp)?;
    }
    report.written_packages = inserted_packages;

    Ok(report)
}

/// Step 1: write `public-key.pem` on first use, else fail if the caller's
/// key doesn't derive the same public key already on file.
fn ensure_signing_key_matches(layout: &RepoLayout, key: &PrivateKey) -> Result<()> {
    let derived = key.derive_public_key_pem()?;
    let path = layout.public_key_file();
    if path.exists() {
        let existing = std::fs::read_to_string(&path)?;
        if existing.trim() != derived.trim() {
            return Err(RepoError::RepoSigningKeyMismatch);
        }
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &derived)?;
    }
    Ok(())
}

async fn parse_all(paths: &[PathBuf]) -> Result<Vec<(PathBuf, ApkDescriptor)>> {
    let mut tasks = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let descriptor = apk::parse(&path).map_err(|e| RepoError::AppDetailParseFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            Ok::<_, RepoError>((path, descriptor))
        }));
    }
    let mut out = Vec::with_capacity(tasks.len());
    for task in tasks {
        let result = task
            .await
            .map_err(|e| RepoError::AppDetailParseFailed {
                path: "<unknown>".to_string(),
                reason: format!("parser task panicked: {e}"),
            })??;
        out.push(result);
    }
    Ok(out)
}

/// Groups parsed APKs by package, preserving each package's first-appearance
/// order in `paths`, and sorts each group ascending by version code.
fn group_by_package(
    descriptors: Vec<(PathBuf, ApkDescriptor)>,
) -> Vec<(PackageName, Vec<(PathBuf, ApkDescriptor)>)> {
    let mut order: Vec<PackageName> = Vec::new();
    let mut by_package: HashMap<PackageName, Vec<(PathBuf, ApkDescriptor)>> = HashMap::new();
    for (path, descriptor) in descriptors {
        let package = descriptor.package.clone();
        if !by_package.contains_key(&package) {
            order.push(package.clone());
        }
        by_package.entry(package).or_default().push((path, descriptor));
    }
    order
        .into_iter()
        .map(|package| {
            let mut group = by_package.remove(&package).expect("just inserted above");
            group.sort_by_key(|(_, d)| d.version_code);
            (package, group)
        })
        .collect()
}

/// Assembles "batch ∪ repo" for every package touched by this insertion
/// (`spec.md` §4.F step 3), plus the set of incoming `(package, version)`
/// keys the validator should check dependency/debuggable rules against.
fn build_combined_view(
    store: &Store,
    groups: &[(PackageName, Vec<(PathBuf, ApkDescriptor)>)],
    timestamp: Timestamp,
) -> Result<(Vec<Release>, HashSet<(PackageName, VersionCode)>)> {
    let mut combined = Vec::new();
    let mut incoming_keys = HashSet::new();
    for (package, group) in groups {
        let existing = store.read(|conn| store::get_releases_ascending(conn, package))?;
        combined.extend(existing);
        for (_, descriptor) in group {
            let release = descriptor_to_release(descriptor, timestamp);
            incoming_keys.insert((release.package.clone(), release.version_code));
            combined.push(release);
        }
    }
    Ok((combined, incoming_keys))
}

fn descriptor_to_release(descriptor: &ApkDescriptor, timestamp: Timestamp) -> Release {
    Release {
        package: descriptor.package.clone(),
        version_code: descriptor.version_code,
        version_name: descriptor.version_name.clone(),
        min_sdk: descriptor.min_sdk,
        timestamp,
        apk_sha256: descriptor.apk_sha256.clone(),
        v4_sha256: descriptor.v4_sha256.clone(),
        release_notes: None,
        signer_certs: descriptor.signer_certs.clone(),
        dependencies: descriptor.dependencies.clone(),
        debuggable: descriptor.debuggable,
    }
}

/// Used by the `resign` CLI command: re-derives and rewrites the signed
/// public surface without touching the store, for operators rotating onto a
/// replacement signature after a key compromise is ruled out as a concern
/// for a single package's republish.
pub fn republish(layout: &RepoLayout, store: &Arc<Store>, key: &PrivateKey) -> Result<()> {
    publisher::publish_all(layout, store, key, Timestamp::now())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::RepoConfig;
    use crate::signer::PrivateKey;
    use std::io::Write as _;
    use std::time::Duration;

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

    fn test_key() -> PrivateKey {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        PrivateKey::EcP256(key)
    }

    /// Builds a minimal but real zip-based "APK" whose manifest is readable
    /// by [`crate::apk`], for exercising the orchestrator without a real
    /// `aapt` toolchain.
    fn build_test_apk(dir: &Path, package: &str, version_code: u64, cert_seed: u8) -> PathBuf {
        let manifest = crate::apk::test_support::minimal_manifest(package, version_code);
        let path = dir.join(format!("{package}-{version_code}.apk"));
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zip.start_file("AndroidManifest.xml", options.clone()).unwrap();
        zip.write_all(&manifest).unwrap();
        zip.start_file("META-INF/CERT.RSA", options).unwrap();
        zip.write_all(&[cert_seed; 64]).unwrap();
        zip.finish().unwrap();
        path
    }

    #[tokio::test]
    async fn cold_insert_writes_public_key_and_index() {
        let repo_dir = tempfile::tempdir().unwrap();
        let apk_dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(repo_dir.path());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = fast_config(repo_dir.path());
        let printer = Arc::new(Printer::new());
        let key = test_key();

        let apk_path = build_test_apk(apk_dir.path(), "com.example.app", 1, 7);

        let report = insert_apks(
            &layout,
            &store,
            &config,
            printer,
            &key,
            &[apk_path],
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.written_packages.len(), 1);
        assert!(layout.public_key_file().exists());
        assert!(layout.index_file().exists());
        let package = PackageName::parse("com.example.app").unwrap();
        assert!(layout.apk_file(&package, VersionCode::new(1)).exists());
        assert!(layout.metadata_file(&package).exists());
    }

    #[tokio::test]
    async fn key_mismatch_is_rejected_without_mutation() {
        let repo_dir = tempfile::tempdir().unwrap();
        let apk_dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(repo_dir.path());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = fast_config(repo_dir.path());
        let printer = Arc::new(Printer::new());
        let key_one = test_key();
        let key_two = test_key();

        let apk_path = build_test_apk(apk_dir.path(), "com.example.app", 1, 7);
        insert_apks(&layout, &store, &config, printer.clone(), &key_one, &[apk_path], None)
            .await
            .unwrap();

        let apk_path_two = build_test_apk(apk_dir.path(), "com.example.other", 1, 7);
        let err = insert_apks(
            &layout,
            &store,
            &config,
            printer,
            &key_two,
            &[apk_path_two],
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RepoError::RepoSigningKeyMismatch));
        let other_package = PackageName::parse("com.example.other").unwrap();
        assert!(!layout.dir_for_package(&other_package).exists());
    }

    #[tokio::test]
    async fn reinserting_same_version_is_skipped_with_warning() {
        let repo_dir = tempfile::tempdir().unwrap();
        let apk_dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(repo_dir.path());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = fast_config(repo_dir.path());
        let printer = Arc::new(Printer::new());
        let key = test_key();

        let apk_path = build_test_apk(apk_dir.path(), "com.example.app", 1, 7);
        insert_apks(&layout, &store, &config, printer.clone(), &key, &[apk_path.clone()], None)
            .await
            .unwrap();

        let report = insert_apks(&layout, &store, &config, printer, &key, &[apk_path], None)
            .await
            .unwrap();
        assert!(report.written_packages.is_empty());
        assert_eq!(report.skipped_packages.len(), 1);
    }
}
