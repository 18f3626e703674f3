// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Metadata Store (component B).
//!
//! An embedded, single-writer relational store backed by `rusqlite` in WAL
//! mode, matching `spec.md` §4.B's requirement for "durable transactions and
//! write-ahead logging". `kizuna` is the corpus donor for embedding SQLite
//! this way (`rusqlite = { version = "0.30", features = ["bundled"] }`).

use crate::error::Result;
use crate::layout::RepoLayout;
use crate::model::{AppRecord, Dependency, DeltaRecord, Release};
use crate::types::{PackageName, Sha256Base64, Sha256Hex, Timestamp, VersionCode};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA: &str = include_str!("schema.sql");

/// An APK awaiting insertion via [`upsert_apks`]: the release row to write,
/// plus what's needed to update the owning package and copy the file.
#[derive(Clone, Debug)]
pub struct PendingApk {
    pub release: Release,
    pub label: String,
    pub icon: Option<Vec<u8>>,
    pub source_path: PathBuf,
}

/// Hooks registered inside a transaction body, invoked only if the
/// transaction is rolled back. Mirrors the teacher's "register hook inside
/// transaction" idiom (`spec.md` §9) as an explicit undo list.
#[derive(Default)]
pub struct RollbackHooks {
    hooks: Vec<Box<dyn FnOnce() + Send>>,
}

impl RollbackHooks {
    pub fn after_rollback(&mut self, f: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(f));
    }

    fn run(self) {
        for hook in self.hooks {
            hook();
        }
    }
}

/// The embedded store. Single writer: all mutating access goes through
/// [`Store::transaction`]/[`Store::transaction_with_result`], which hold the
/// connection mutex for the duration of the transaction.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bounds WAL growth after long idle periods (`spec.md` §4.B).
    pub fn checkpoint_truncate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.pragma_update(None, "wal_checkpoint", "TRUNCATE")?;
        Ok(())
    }

    /// Runs `body` inside a transaction, committing on `Ok` and rolling back
    /// (then running any registered [`RollbackHooks`]) on `Err`.
    pub fn transaction_with_result<T>(
        &self,
        body: impl FnOnce(&Connection, &mut RollbackHooks) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let mut hooks = RollbackHooks::default();
        match body(&tx, &mut hooks) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // Transaction rolls back implicitly on drop.
                drop(tx);
                hooks.run();
                Err(err)
            }
        }
    }

    pub fn transaction(
        &self,
        body: impl FnOnce(&Connection, &mut RollbackHooks) -> Result<()>,
    ) -> Result<()> {
        self.transaction_with_result(body)
    }

    /// Runs a read without opening an explicit transaction.
    pub fn read<T>(&self, body: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        body(&conn)
    }
}

fn row_to_app(row: &rusqlite::Row) -> rusqlite::Result<AppRecordRaw> {
    Ok(AppRecordRaw {
        name: row.get(0)?,
        label: row.get(1)?,
        group: row.get(2)?,
        last_update_ms: row.get(3)?,
        has_icon: row.get::<_, Option<Vec<u8>>>(4)?.is_some(),
    })
}

struct AppRecordRaw {
    name: String,
    label: String,
    group: Option<String>,
    last_update_ms: i64,
    has_icon: bool,
}

impl AppRecordRaw {
    fn into_record(self) -> Result<AppRecord> {
        Ok(AppRecord {
            name: PackageName::parse(self.name)?,
            label: self.label,
            group: self.group,
            last_update: Timestamp::new(self.last_update_ms),
            has_icon: self.has_icon,
        })
    }
}

pub fn get_app(conn: &Connection, package: &PackageName) -> Result<Option<AppRecord>> {
    let raw = conn
        .query_row(
            "SELECT name, label, group_name, last_update_ms, icon FROM packages WHERE name = ?1",
            params![package.as_str()],
            row_to_app,
        )
        .optional()?;
    raw.map(AppRecordRaw::into_record).transpose()
}

/// Raw icon bytes for a package, if it has one. Separate from [`get_app`]
/// (which only reports presence) because the publisher is the one caller
/// that needs the bytes themselves.
pub fn get_icon(conn: &Connection, package: &PackageName) -> Result<Option<Vec<u8>>> {
    Ok(conn
        .query_row(
            "SELECT icon FROM packages WHERE name = ?1",
            params![package.as_str()],
            |row| row.get::<_, Option<Vec<u8>>>(0),
        )
        .optional()?
        .flatten())
}

pub fn does_app_exist(conn: &Connection, package: &PackageName) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM packages WHERE name = ?1",
            params![package.as_str()],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

pub fn get_latest_release(conn: &Connection, package: &PackageName) -> Result<Option<Release>> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT MAX(version_code) FROM releases WHERE package = ?1",
            params![package.as_str()],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    match version {
        Some(v) => get_release(conn, package, VersionCode::new(v as u64)),
        None => Ok(None),
    }
}

pub fn get_release(
    conn: &Connection,
    package: &PackageName,
    version: VersionCode,
) -> Result<Option<Release>> {
    let row = conn
        .query_row(
            "SELECT version_name, min_sdk, release_ts_ms, apk_sha256, v4_sha256, release_notes, debuggable
             FROM releases WHERE package = ?1 AND version_code = ?2",
            params![package.as_str(), version.get() as i64],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((version_name, min_sdk, ts, apk_sha, v4_sha, notes, debuggable)) = row else {
        return Ok(None);
    };

    let mut cert_stmt = conn.prepare(
        "SELECT cert_sha256_hex FROM release_certs WHERE package = ?1 AND version_code = ?2 ORDER BY cert_sha256_hex",
    )?;
    let certs = cert_stmt
        .query_map(params![package.as_str(), version.get() as i64], |row| {
            row.get::<_, String>(0)
        })?
        .map(|r| r.map_err(Into::into).and_then(|s| Sha256Hex::parse(s)))
        .collect::<Result<Vec<_>>>()?;

    let dependencies = load_dependencies(conn, package, version)?;

    Ok(Some(Release {
        package: package.clone(),
        version_code: version,
        version_name,
        min_sdk: min_sdk as u32,
        timestamp: Timestamp::new(ts),
        apk_sha256: Sha256Base64::parse(apk_sha)?,
        v4_sha256: v4_sha.map(Sha256Base64::parse).transpose()?,
        release_notes: notes,
        signer_certs: certs,
        dependencies,
        debuggable: debuggable != 0,
    }))
}

/// All releases for a package, ascending by version code.
pub fn get_releases_ascending(conn: &Connection, package: &PackageName) -> Result<Vec<Release>> {
    let mut stmt =
        conn.prepare("SELECT version_code FROM releases WHERE package = ?1 ORDER BY version_code ASC")?;
    let versions = stmt
        .query_map(params![package.as_str()], |row| row.get::<_, i64>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    versions
        .into_iter()
        .map(|v| {
            get_release(conn, package, VersionCode::new(v as u64))
                .transpose()
                .expect("release row present under the same transaction that listed it")
        })
        .collect()
}

fn load_dependencies(
    conn: &Connection,
    package: &PackageName,
    version: VersionCode,
) -> Result<Vec<Dependency>> {
    let mut stmt = conn.prepare(
        "SELECT kind, name, required, dep_version_code, cert_digests_json, package_type
         FROM dependencies WHERE package = ?1 AND version_code = ?2 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![package.as_str(), version.get() as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(kind, name, required, dep_version, certs_json, package_type)| -> Result<Dependency> {
                let certs: Option<Vec<Sha256Hex>> = certs_json
                    .map(|j| -> Result<Vec<Sha256Hex>> {
                        let raw: Vec<String> = serde_json::from_str(&j)?;
                        raw.into_iter().map(Sha256Hex::parse).collect()
                    })
                    .transpose()?;
                Ok(match kind.as_str() {
                    "library" => Dependency::UsesLibrary {
                        name,
                        required: required.unwrap_or(1) != 0,
                    },
                    "static-library" => Dependency::UsesStaticLibrary {
                        name,
                        version: VersionCode::new(dep_version.unwrap_or_default() as u64),
                        certs: certs.unwrap_or_default(),
                    },
                    "package" => Dependency::UsesPackage {
                        package_type: package_type.unwrap_or_default(),
                        name,
                        minimum_version: dep_version.map(|v| VersionCode::new(v as u64)),
                        certs,
                    },
                    other => {
                        return Err(crate::error::RepoError::InvalidRepoState(format!(
                            "unknown dependency kind {other:?} stored for {name}"
                        )))
                    }
                })
            },
        )
        .collect()
}

pub fn for_each_app_name(
    conn: &Connection,
    mut f: impl FnMut(&PackageName) -> Result<()>,
) -> Result<()> {
    let mut stmt = conn.prepare("SELECT name FROM packages ORDER BY name ASC")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for name in names {
        f(&PackageName::parse(name)?)?;
    }
    Ok(())
}

/// Inserts (or updates, on idempotent re-insertion) releases for `group`
/// (ascending by version), updates the owning package's label/timestamp/icon
/// from the highest-version APK, and copies each APK's bytes into its
/// canonical path. `spec.md` §4.B describes this single operation.
pub fn upsert_apks(
    conn: &Connection,
    layout: &RepoLayout,
    package: &PackageName,
    group: &[PendingApk],
    release_notes_for_latest: Option<String>,
    timestamp: Timestamp,
) -> Result<()> {
    debug_assert!(
        group.windows(2).all(|w| w[0].release.version_code < w[1].release.version_code),
        "upsert_apks requires its group sorted ascending by version code"
    );

    conn.execute(
        "INSERT INTO packages (name, label, group_name, last_update_ms, icon)
         VALUES (?1, ?1, NULL, ?2, NULL)
         ON CONFLICT(name) DO NOTHING",
        params![package.as_str(), timestamp.millis()],
    )?;

    let highest_idx = group.len() - 1;
    for (i, apk) in group.iter().enumerate() {
        let notes = if i == highest_idx {
            release_notes_for_latest.clone()
        } else {
            apk.release.release_notes.clone()
        };
        insert_release(conn, &apk.release, notes)?;

        let dest = layout.apk_file(package, apk.release.version_code);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&apk.source_path, &dest)?;
    }

    let latest = &group[highest_idx];
    conn.execute(
        "UPDATE packages SET label = ?1, last_update_ms = ?2, icon = ?3 WHERE name = ?4",
        params![
            latest.label,
            timestamp.millis(),
            latest.icon,
            package.as_str()
        ],
    )?;

    Ok(())
}

fn insert_release(conn: &Connection, release: &Release, notes: Option<String>) -> Result<()> {
    conn.execute(
        "INSERT INTO releases
            (package, version_code, version_name, min_sdk, release_ts_ms, apk_sha256, v4_sha256, release_notes, debuggable)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(package, version_code) DO UPDATE SET
            version_name = excluded.version_name,
            min_sdk = excluded.min_sdk,
            release_ts_ms = excluded.release_ts_ms,
            apk_sha256 = excluded.apk_sha256,
            v4_sha256 = excluded.v4_sha256,
            release_notes = excluded.release_notes,
            debuggable = excluded.debuggable",
        params![
            release.package.as_str(),
            release.version_code.get() as i64,
            release.version_name,
            release.min_sdk as i64,
            release.timestamp.millis(),
            release.apk_sha256.as_str(),
            release.v4_sha256.as_ref().map(|s| s.as_str()),
            notes,
            release.debuggable as i64,
        ],
    )?;

    conn.execute(
        "DELETE FROM release_certs WHERE package = ?1 AND version_code = ?2",
        params![release.package.as_str(), release.version_code.get() as i64],
    )?;
    for cert in &release.signer_certs {
        conn.execute(
            "INSERT INTO release_certs (package, version_code, cert_sha256_hex) VALUES (?1, ?2, ?3)",
            params![
                release.package.as_str(),
                release.version_code.get() as i64,
                cert.as_str()
            ],
        )?;
    }

    conn.execute(
        "DELETE FROM dependencies WHERE package = ?1 AND version_code = ?2",
        params![release.package.as_str(), release.version_code.get() as i64],
    )?;
    for dep in &release.dependencies {
        insert_dependency(conn, &release.package, release.version_code, dep)?;
    }

    Ok(())
}

fn insert_dependency(
    conn: &Connection,
    package: &PackageName,
    version: VersionCode,
    dep: &Dependency,
) -> Result<()> {
    match dep {
        Dependency::UsesLibrary { name, required } => {
            conn.execute(
                "INSERT INTO dependencies (package, version_code, kind, name, required) VALUES (?1, ?2, 'library', ?3, ?4)",
                params![package.as_str(), version.get() as i64, name, *required as i64],
            )?;
        }
        Dependency::UsesStaticLibrary { name, version: dep_version, certs } => {
            let certs_json = serde_json::to_string(&certs.iter().map(Sha256Hex::as_str).collect::<Vec<_>>())?;
            conn.execute(
                "INSERT INTO dependencies (package, version_code, kind, name, dep_version_code, cert_digests_json)
                 VALUES (?1, ?2, 'static-library', ?3, ?4, ?5)",
                params![
                    package.as_str(),
                    version.get() as i64,
                    name,
                    dep_version.get() as i64,
                    certs_json
                ],
            )?;
        }
        Dependency::UsesPackage { package_type, name, minimum_version, certs } => {
            let certs_json = certs
                .as_ref()
                .map(|c| serde_json::to_string(&c.iter().map(Sha256Hex::as_str).collect::<Vec<_>>()))
                .transpose()?;
            conn.execute(
                "INSERT INTO dependencies (package, version_code, kind, name, dep_version_code, cert_digests_json, package_type)
                 VALUES (?1, ?2, 'package', ?3, ?4, ?5, ?6)",
                params![
                    package.as_str(),
                    version.get() as i64,
                    name,
                    minimum_version.map(|v| v.get() as i64),
                    certs_json,
                    package_type
                ],
            )?;
        }
    }
    Ok(())
}

/// Replaces the [`DeltaRecord`] set for a package atomically.
pub fn insert_delta_infos(conn: &Connection, records: &[DeltaRecord]) -> Result<()> {
    for record in records {
        conn.execute(
            "INSERT INTO deltas (package, base_version_code, target_version_code, sha256)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(package, base_version_code, target_version_code) DO UPDATE SET sha256 = excluded.sha256",
            params![
                record.package.as_str(),
                record.base.get() as i64,
                record.target.get() as i64,
                record.sha256.as_str()
            ],
        )?;
    }
    Ok(())
}

pub fn delete_deltas_for_app(conn: &Connection, package: &PackageName) -> Result<()> {
    conn.execute(
        "DELETE FROM deltas WHERE package = ?1",
        params![package.as_str()],
    )?;
    Ok(())
}

pub fn get_deltas_for_app(conn: &Connection, package: &PackageName) -> Result<Vec<DeltaRecord>> {
    let mut stmt = conn.prepare(
        "SELECT base_version_code, target_version_code, sha256 FROM deltas WHERE package = ?1 ORDER BY base_version_code DESC",
    )?;
    stmt.query_map(params![package.as_str()], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?
    .map(|r| {
        let (base, target, sha) = r?;
        Ok(DeltaRecord {
            package: package.clone(),
            base: VersionCode::new(base as u64),
            target: VersionCode::new(target as u64),
            sha256: Sha256Hex::parse(sha)?,
        })
    })
    .collect()
}

pub fn update_release_notes(
    conn: &Connection,
    package: &PackageName,
    version: VersionCode,
    text: Option<&str>,
    timestamp: Timestamp,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE releases SET release_notes = ?1 WHERE package = ?2 AND version_code = ?3",
        params![text, package.as_str(), version.get() as i64],
    )?;
    if changed == 0 {
        return Err(crate::error::RepoError::InvalidRepoState(format!(
            "no release {package}:{version} to update release notes for"
        )));
    }
    conn.execute(
        "UPDATE packages SET last_update_ms = ?1 WHERE name = ?2",
        params![timestamp.millis(), package.as_str()],
    )?;
    Ok(())
}

pub fn set_group_for_packages(
    conn: &Connection,
    group: Option<&str>,
    packages: &[PackageName],
    timestamp: Timestamp,
) -> Result<()> {
    for package in packages {
        conn.execute(
            "UPDATE packages SET group_name = ?1, last_update_ms = ?2 WHERE name = ?3",
            params![group, timestamp.millis(), package.as_str()],
        )?;
    }
    Ok(())
}

pub fn create_group(
    conn: &Connection,
    group: &str,
    packages: &[PackageName],
    timestamp: Timestamp,
) -> Result<()> {
    set_group_for_packages(conn, Some(group), packages, timestamp)
}

pub fn delete_group(conn: &Connection, group: &str) -> Result<()> {
    conn.execute(
        "UPDATE packages SET group_name = NULL WHERE group_name = ?1",
        params![group],
    )?;
    Ok(())
}

pub fn get_group_to_app_map(
    conn: &Connection,
) -> Result<std::collections::BTreeMap<String, Vec<PackageName>>> {
    let mut stmt = conn.prepare(
        "SELECT group_name, name FROM packages WHERE group_name IS NOT NULL ORDER BY group_name, name",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut map = std::collections::BTreeMap::new();
    for (group, name) in rows {
        map.entry(group)
            .or_insert_with(Vec::new)
            .push(PackageName::parse(name)?);
    }
    Ok(map)
}

pub fn get_app_labels_in_group(conn: &Connection, group: &str) -> Result<Vec<(PackageName, String)>> {
    let mut stmt =
        conn.prepare("SELECT name, label FROM packages WHERE group_name = ?1 ORDER BY name")?;
    stmt.query_map(params![group], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?
    .map(|r| {
        let (name, label) = r?;
        Ok((PackageName::parse(name)?, label))
    })
    .collect()
}

pub fn get_apps_in_group_but_excluding_apps(
    conn: &Connection,
    group: &str,
    excluding: &[PackageName],
) -> Result<Vec<PackageName>> {
    let all = get_app_labels_in_group(conn, group)?;
    Ok(all
        .into_iter()
        .map(|(name, _)| name)
        .filter(|name| !excluding.contains(name))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Release;

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
    fn upsert_then_read_back() {
        let store = Store::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        let package = PackageName::parse("com.example.app").unwrap();

        let source = dir.path().join("source.apk");
        std::fs::write(&source, b"apk bytes").unwrap();

        store
            .transaction(|conn, _hooks| {
                let pending = PendingApk {
                    release: sample_release(&package, 1),
                    label: "Example".to_string(),
                    icon: Some(vec![1, 2, 3]),
                    source_path: source.clone(),
                };
                upsert_apks(conn, &layout, &package, &[pending], None, Timestamp::new(5000))
            })
            .unwrap();

        store
            .read(|conn| {
                let app = get_app(conn, &package).unwrap().unwrap();
                assert_eq!(app.label, "Example");
                assert!(app.has_icon);
                let release = get_release(conn, &package, VersionCode::new(1))
                    .unwrap()
                    .unwrap();
                assert_eq!(release.signer_certs.len(), 1);
                Ok(())
            })
            .unwrap();

        assert!(layout.apk_file(&package, VersionCode::new(1)).exists());
    }

    #[test]
    fn rollback_runs_hooks() {
        let store = Store::open_in_memory().unwrap();
        let package = PackageName::parse("com.example.app").unwrap();
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();

        let result: Result<()> = store.transaction(|conn, hooks| {
            conn.execute(
                "INSERT INTO packages (name, label, last_update_ms) VALUES (?1, ?1, 0)",
                params![package.as_str()],
            )?;
            hooks.after_rollback(move || {
                ran2.store(true, std::sync::atomic::Ordering::SeqCst);
            });
            Err(crate::error::RepoError::EditFailed)
        });

        assert!(result.is_err());
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
        store
            .read(|conn| {
                assert!(!does_app_exist(conn, &package).unwrap());
                Ok(())
            })
            .unwrap();
    }
}
