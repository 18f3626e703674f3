// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Metadata Publisher (component H, `spec.md` §4.H).
//!
//! Regenerates every signed, externally-visible file after an insertion has
//! committed: per-package metadata, the bulk metadata document, the index,
//! and each package's icon file. Every output is written to a sibling temp
//! path, fsynced, signed on the temp path, then renamed over the real path —
//! so a reader never observes a half-written or unsigned file.

use crate::error::Result;
use crate::layout::RepoLayout;
use crate::model::DeltaRecord;
use crate::signer::{self, PrivateKey};
use crate::store::{self, Store};
use crate::types::{PackageName, Sha256Base64, Sha256Hex, Timestamp, VersionCode};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

#[derive(Serialize)]
struct DeltaInfoJson {
    #[serde(rename = "baseVersionCode")]
    base_version_code: u64,
    sha256: Sha256Hex,
}

#[derive(Serialize)]
struct ReleaseJson {
    #[serde(rename = "versionCode")]
    version_code: u64,
    #[serde(rename = "versionName")]
    version_name: String,
    #[serde(rename = "minSdk")]
    min_sdk: u32,
    #[serde(rename = "releaseTimestamp")]
    release_timestamp: i64,
    #[serde(rename = "apkSha256")]
    apk_sha256: Sha256Base64,
    #[serde(rename = "v4Sha256", skip_serializing_if = "Option::is_none")]
    v4_sha256: Option<Sha256Base64>,
    #[serde(rename = "releaseNotes", skip_serializing_if = "Option::is_none")]
    release_notes: Option<String>,
    deltas: Vec<DeltaInfoJson>,
}

#[derive(Serialize)]
struct PackageMetadataJson {
    name: PackageName,
    label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    #[serde(rename = "lastUpdateTimestamp")]
    last_update_timestamp: i64,
    releases: Vec<ReleaseJson>,
    #[serde(rename = "hasIcon")]
    has_icon: bool,
}

#[derive(Serialize)]
struct BulkMetadataJson {
    packages: Vec<PackageMetadataJson>,
    timestamp: i64,
}

/// Public operation `publish(timestamp)` (`spec.md` §4.H).
pub fn publish_all(
    layout: &RepoLayout,
    store: &Arc<Store>,
    key: &PrivateKey,
    timestamp: Timestamp,
) -> Result<()> {
    let package_names = store.read(|conn| {
        let mut names = Vec::new();
        store::for_each_app_name(conn, |name| {
            names.push(name.clone());
            Ok(())
        })?;
        Ok(names)
    })?;

    let mut packages = Vec::with_capacity(package_names.len());
    for package in &package_names {
        let metadata = build_package_metadata(store, package, timestamp)?;
        write_signed_json(&layout.metadata_file(package), &metadata, key)?;
        packages.push(metadata);
    }

    let bulk = BulkMetadataJson {
        packages,
        timestamp: timestamp.millis(),
    };
    write_signed_json(&layout.bulk_metadata_file(), &bulk, key)?;

    write_signed_index(layout, &package_names, store, timestamp, key)?;

    for package in &package_names {
        sync_icon_file(layout, store, package)?;
    }

    Ok(())
}

fn build_package_metadata(
    store: &Arc<Store>,
    package: &PackageName,
    _timestamp: Timestamp,
) -> Result<PackageMetadataJson> {
    store.read(|conn| {
        let app = store::get_app(conn, package)?.ok_or_else(|| {
            crate::error::RepoError::InvalidRepoState(format!(
                "package {package} vanished mid-publish"
            ))
        })?;
        let mut releases = store::get_releases_ascending(conn, package)?;
        releases.reverse(); // descending by version code, per spec.md §4.H step 1.

        let deltas = store::get_deltas_for_app(conn, package)?;
        let deltas_by_target = |target: VersionCode| -> Vec<DeltaInfoJson> {
            deltas
                .iter()
                .filter(|d: &&DeltaRecord| d.target == target)
                .map(|d| DeltaInfoJson {
                    base_version_code: d.base.get(),
                    sha256: d.sha256.clone(),
                })
                .collect()
        };

        let releases = releases
            .into_iter()
            .map(|r| ReleaseJson {
                version_code: r.version_code.get(),
                version_name: r.version_name,
                min_sdk: r.min_sdk,
                release_timestamp: r.timestamp.millis(),
                apk_sha256: r.apk_sha256,
                v4_sha256: r.v4_sha256,
                release_notes: r.release_notes,
                deltas: deltas_by_target(r.version_code),
            })
            .collect();

        Ok(PackageMetadataJson {
            name: app.name,
            label: app.label,
            group: app.group,
            last_update_timestamp: app.last_update.millis(),
            releases,
            has_icon: app.has_icon,
        })
    })
}

fn write_signed_index(
    layout: &RepoLayout,
    packages: &[PackageName],
    store: &Arc<Store>,
    timestamp: Timestamp,
    key: &PrivateKey,
) -> Result<()> {
    let mut sorted: Vec<&PackageName> = packages.iter().collect();
    sorted.sort();

    let mut body = String::new();
    for package in sorted {
        let latest = store.read(|conn| store::get_latest_release(conn, package))?;
        if let Some(latest) = latest {
            body.push_str(&format!("{package}:{}\n", latest.version_code));
        }
    }
    body.push_str(&timestamp.millis().to_string());
    body.push('\n');

    write_signed_bytes(&layout.index_file(), body.as_bytes(), key)
}

fn sync_icon_file(layout: &RepoLayout, store: &Arc<Store>, package: &PackageName) -> Result<()> {
    let icon_path = layout.icon_file(package);
    let current = store.read(|conn| store::get_icon(conn, package))?;
    match current {
        Some(bytes) => {
            let unchanged = std::fs::read(&icon_path).map(|existing| existing == bytes).unwrap_or(false);
            if !unchanged {
                write_atomic(&icon_path, &bytes)?;
            }
        }
        None => {
            if icon_path.exists() {
                std::fs::remove_file(&icon_path)?;
            }
        }
    }
    Ok(())
}

fn write_signed_json<T: Serialize>(path: &Path, value: &T, key: &PrivateKey) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    write_signed_bytes(path, &body, key)
}

fn write_signed_bytes(path: &Path, body: &[u8], key: &PrivateKey) -> Result<()> {
    let framed = signer::sign_bytes_framed(key, body);
    write_atomic(path, &framed)
}

/// Writes to a sibling `.<name>.tmp` path, fsyncs, then renames over the
/// real path (`spec.md` §4.H's atomicity guarantee).
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("output");
    let tmp_path = parent.join(format!(".{file_name}.tmp"));

    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Release;
    use crate::store::PendingApk;

    fn test_key() -> PrivateKey {
        PrivateKey::EcP256(p256::ecdsa::SigningKey::random(&mut rand::thread_rng()))
    }

    fn sample_release(package: &PackageName, version: u64) -> Release {
        Release {
            package: package.clone(),
            version_code: VersionCode::new(version),
            version_name: format!("1.{version}"),
            min_sdk: 21,
            timestamp: Timestamp::new(1000),
            apk_sha256: Sha256Base64::from_digest_bytes(&[version as u8; 32]),
            v4_sha256: None,
            release_notes: None,
            signer_certs: vec![Sha256Hex::from_digest_bytes(&[1u8; 32])],
            dependencies: vec![],
            debuggable: false,
        }
    }

    #[test]
    fn publish_all_writes_signed_index_and_metadata() {
        let repo_dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(repo_dir.path());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let package = PackageName::parse("com.example.app").unwrap();

        let source = repo_dir.path().join("source.apk");
        std::fs::write(&source, b"apk bytes").unwrap();
        store
            .transaction(|conn, _| {
                let pending = PendingApk {
                    release: sample_release(&package, 1),
                    label: "Example".to_string(),
                    icon: Some(vec![1, 2, 3]),
                    source_path: source.clone(),
                };
                store::upsert_apks(conn, &layout, &package, &[pending], None, Timestamp::new(5000))
            })
            .unwrap();

        let key = test_key();
        publish_all(&layout, &store, &key, Timestamp::new(9000)).unwrap();

        assert!(layout.index_file().exists());
        assert!(layout.metadata_file(&package).exists());
        assert!(layout.bulk_metadata_file().exists());
        assert!(layout.icon_file(&package).exists());

        let pub_pem = key.derive_public_key_pem().unwrap();
        let public_key = crate::signer::PublicKey::from_pem(&pub_pem).unwrap();
        signer::verify(&public_key, &layout.index_file()).unwrap();
        signer::verify(&public_key, &layout.metadata_file(&package)).unwrap();
        signer::verify(&public_key, &layout.bulk_metadata_file()).unwrap();

        let index_contents = std::fs::read_to_string(layout.index_file()).unwrap();
        let body_start = index_contents.find('\n').unwrap() + 1;
        assert!(index_contents[body_start..].contains("com.example.app:1"));
    }

    #[test]
    fn icon_file_is_removed_when_package_has_no_icon() {
        let repo_dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(repo_dir.path());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let package = PackageName::parse("com.example.app").unwrap();

        let source = repo_dir.path().join("source.apk");
        std::fs::write(&source, b"apk bytes").unwrap();
        store
            .transaction(|conn, _| {
                let pending = PendingApk {
                    release: sample_release(&package, 1),
                    label: "Example".to_string(),
                    icon: None,
                    source_path: source.clone(),
                };
                store::upsert_apks(conn, &layout, &package, &[pending], None, Timestamp::new(5000))
            })
            .unwrap();

        std::fs::create_dir_all(layout.dir_for_package(&package)).unwrap();
        std::fs::write(layout.icon_file(&package), b"stale icon bytes").unwrap();

        let key = test_key();
        publish_all(&layout, &store, &key, Timestamp::new(9000)).unwrap();

        assert!(!layout.icon_file(&package).exists());
    }
}
