// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Delta Generation Engine (component G, `spec.md` §4.G) — the hard part.
//!
//! A single actor task owns the engine (`spec.md` §9's "actor on an
//! unbounded channel with late-latched printer"). It accepts two request
//! variants: [`DeltaRequest::ForPackage`] spawns a per-package task;
//! [`DeltaRequest::StartPrinting`] is sent exactly once, after every
//! `ForPackage` request has been submitted, and flips progress rendering
//! on, draining anything buffered up to that point.

pub mod codec;

use crate::config::RepoConfig;
use crate::error::{RepoError, Result};
use crate::layout::RepoLayout;
use crate::model::DeltaRecord;
use crate::printer::Printer;
use crate::store::{self, Store};
use crate::types::{PackageName, Sha256Hex, VersionCode};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

pub enum DeltaRequest {
    ForPackage(PackageName),
    StartPrinting,
}

enum ProgressMsg {
    Line(String),
    Warn(String),
}

struct DeltaEngine {
    layout: RepoLayout,
    store: Arc<Store>,
    config: RepoConfig,
    printer: Arc<Printer>,
    semaphore: Arc<Semaphore>,
    /// The temp directory's reserved-but-not-yet-freed estimate: the sole
    /// shared mutable quantity across delta workers (`spec.md` §5).
    reserved_estimate: AtomicU64,
}

/// A live handle to the engine's actor task.
pub struct DeltaEngineHandle {
    requests: mpsc::UnboundedSender<DeltaRequest>,
    join: tokio::task::JoinHandle<Vec<(PackageName, RepoError)>>,
}

impl DeltaEngineHandle {
    pub fn for_package(&self, package: PackageName) {
        let _ = self.requests.send(DeltaRequest::ForPackage(package));
    }

    pub fn start_printing(&self) {
        let _ = self.requests.send(DeltaRequest::StartPrinting);
    }

    /// Closes the request channel and waits for every in-flight
    /// per-package task to finish, returning the packages whose delta
    /// generation failed.
    pub async fn drain(self) -> Vec<(PackageName, RepoError)> {
        drop(self.requests);
        self.join.await.unwrap_or_default()
    }
}

/// Spawns the engine's actor task.
pub fn spawn(
    layout: RepoLayout,
    store: Arc<Store>,
    config: RepoConfig,
    printer: Arc<Printer>,
) -> DeltaEngineHandle {
    let (requests_tx, mut requests_rx) = mpsc::unbounded_channel::<DeltaRequest>();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressMsg>();
    let semaphore = Arc::new(Semaphore::new(config.delta_concurrency));

    let engine = Arc::new(DeltaEngine {
        layout,
        store,
        config,
        printer,
        semaphore,
        reserved_estimate: AtomicU64::new(0),
    });

    let join = tokio::spawn(async move {
        let mut tasks = tokio::task::JoinSet::new();
        let mut buffered_lines = Vec::new();
        let mut printing = false;
        let mut requests_open = true;
        let mut failed = Vec::new();

        loop {
            tokio::select! {
                req = requests_rx.recv(), if requests_open => {
                    match req {
                        Some(DeltaRequest::ForPackage(package)) => {
                            let engine = engine.clone();
                            let progress_tx = progress_tx.clone();
                            tasks.spawn(async move {
                                let result = engine.run_package(package.clone(), progress_tx).await;
                                (package, result)
                            });
                        }
                        Some(DeltaRequest::StartPrinting) => {
                            printing = true;
                            for line in buffered_lines.drain(..) {
                                engine.printer.progress_line(&line).await;
                            }
                        }
                        None => requests_open = false,
                    }
                }
                msg = progress_rx.recv() => {
                    match msg {
                        Some(ProgressMsg::Line(line)) if printing => {
                            engine.printer.progress_line(&line).await;
                        }
                        Some(ProgressMsg::Line(line)) => buffered_lines.push(line),
                        Some(ProgressMsg::Warn(warning)) => engine.printer.warn(&warning).await,
                        None => {}
                    }
                }
                joined = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(Ok((package, Err(err)))) = joined {
                        engine.printer.error(&format!("{package}: {err}")).await;
                        failed.push((package, err));
                    }
                }
            }

            if !requests_open && tasks.is_empty() {
                break;
            }
        }

        engine.printer.finish_progress_line().await;
        failed
    });

    DeltaEngineHandle { requests: requests_tx, join }
}

impl DeltaEngine {
    /// Per-package task (`spec.md` §4.G): enumerate on-disk APKs descending
    /// by version, pick up to `K` bases below the new latest, run one job
    /// per base, then replace the package's DeltaRecord set and prune
    /// stale delta files.
    async fn run_package(
        self: Arc<Self>,
        package: PackageName,
        progress: mpsc::UnboundedSender<ProgressMsg>,
    ) -> Result<()> {
        let versions = self.layout.apk_versions_on_disk(&package)?;
        if versions.len() <= 1 {
            self.store
                .transaction(|conn, _hooks| store::delete_deltas_for_app(conn, &package))?;
            self.prune_stale_delta_files(&package, None)?;
            return Ok(());
        }

        let target = versions[0];
        let bases: Vec<VersionCode> = versions
            .into_iter()
            .skip(1)
            .take(self.config.max_deltas_per_package)
            .collect();

        let mut jobs = tokio::task::JoinSet::new();
        for base in bases {
            let engine = self.clone();
            let package = package.clone();
            let progress = progress.clone();
            jobs.spawn(async move { engine.run_job(package, base, target, progress).await });
        }

        let mut records = Vec::new();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(Ok(record)) => records.push(record),
                Ok(Err(err)) => {
                    let _ = progress.send(ProgressMsg::Warn(format!(
                        "{package}: a delta job failed, package will ship with fewer than {} deltas: {err}",
                        self.config.max_deltas_per_package
                    )));
                }
                Err(join_err) => {
                    let _ = progress.send(ProgressMsg::Warn(format!(
                        "{package}: a delta job panicked, package will ship with fewer than {} deltas: {join_err}",
                        self.config.max_deltas_per_package
                    )));
                }
            }
        }

        self.store.transaction(|conn, _hooks| {
            store::delete_deltas_for_app(conn, &package)?;
            store::insert_delta_infos(conn, &records)
        })?;

        self.prune_stale_delta_files(&package, Some(target))?;

        Ok(())
    }

    /// Per-job worker: acquires the generation semaphore, runs the
    /// space-aware admission check, defers up to `D_max` times, then
    /// generates the delta and hashes it. States follow `spec.md` §4.G's
    /// `Queued → (Estimating → Deferred)* → Generating → Hashing →
    /// Committed | Failed` machine, though only `Committed`/`Failed` are
    /// observable here (the orchestrator reads the returned `Result`).
    async fn run_job(
        self: Arc<Self>,
        package: PackageName,
        base: VersionCode,
        target: VersionCode,
        progress: mpsc::UnboundedSender<ProgressMsg>,
    ) -> Result<DeltaRecord> {
        let old_path = self.layout.apk_file(&package, base);
        let new_path = self.layout.apk_file(&package, target);
        let output_path = self.layout.delta_file(&package, base, target);

        let old_size = tokio::fs::metadata(&old_path).await?.len();
        let new_size = tokio::fs::metadata(&new_path).await?.len();
        let estimate = (codec::estimate_temp_space(old_size, new_size) as f64 * 1.05) as u64;

        let mut deferrals = 0u32;
        loop {
            let _permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| RepoError::Codec("delta semaphore closed".to_string()))?;

            let free_space_at_start = self.free_space()?;
            let reserved_before = self.reserved_estimate.fetch_add(estimate, Ordering::SeqCst);
            let live_free_now = self.free_space()?;

            let would_exceed_budget = estimate as i64
                > free_space_at_start as i64
                    - reserved_before as i64
                    - self.config.safety_margin_bytes as i64;
            let already_below_safety_margin = live_free_now < self.config.safety_margin_bytes;

            if would_exceed_budget || already_below_safety_margin {
                if deferrals < self.config.max_deferrals {
                    self.reserved_estimate.fetch_sub(estimate, Ordering::SeqCst);
                    let _ = progress.send(ProgressMsg::Warn(format!(
                        "{package}: deferring delta {base}->{target} ({}/{} deferrals)",
                        deferrals + 1,
                        self.config.max_deferrals
                    )));
                    deferrals += 1;
                    drop(_permit);
                    tokio::time::sleep(self.config.deferral_delay).await;
                    continue;
                }
                let _ = progress.send(ProgressMsg::Warn(format!(
                    "{package}: proceeding with delta {base}->{target} despite low space after {} deferrals",
                    deferrals
                )));
            }

            let _ = progress.send(ProgressMsg::Line(format!(
                "{package}: generating delta {base} -> {target}"
            )));

            let old_apk = old_path.clone();
            let new_apk = new_path.clone();
            let tmp_path = Self::tmp_delta_path(&output_path);
            let tmp_out = tmp_path.clone();
            let codec_result =
                tokio::task::spawn_blocking(move || codec::generate_delta(&old_apk, &new_apk, &tmp_out, true))
                    .await;

            self.reserved_estimate.fetch_sub(estimate, Ordering::SeqCst);

            return match codec_result {
                Ok(Ok(())) => {
                    let sha256 = Self::sha256_of(&tmp_path)?;
                    std::fs::rename(&tmp_path, &output_path)?;
                    Ok(DeltaRecord { package, base, target, sha256 })
                }
                Ok(Err(err)) => {
                    let _ = std::fs::remove_file(&tmp_path);
                    Err(err)
                }
                Err(join_err) => {
                    let _ = std::fs::remove_file(&tmp_path);
                    Err(RepoError::Codec(format!("delta worker failed: {join_err}")))
                }
            };
        }
    }

    /// The path a job generates into before it's known to have succeeded.
    /// Never the final `delta-<base>-to-<target>.gz` name, so a job killed
    /// mid-write can never leave a partial file at a name
    /// [`Self::prune_stale_delta_files`] or the store would treat as live.
    fn tmp_delta_path(output_path: &Path) -> PathBuf {
        let mut p = output_path.as_os_str().to_owned();
        p.push(".tmp");
        PathBuf::from(p)
    }

    fn free_space(&self) -> Result<u64> {
        fs4::available_space(&self.config.temp_dir).map_err(RepoError::Io)
    }

    fn sha256_of(path: &Path) -> Result<Sha256Hex> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        let digest: [u8; 32] = hasher.finalize().into();
        Ok(Sha256Hex::from_digest_bytes(&digest))
    }

    /// Removes every delta file in the package directory whose parsed
    /// `(base, target)` doesn't have `target == current_target`.
    /// `current_target == None` means the package no longer has more than
    /// one release, so every delta file is stale.
    fn prune_stale_delta_files(
        &self,
        package: &PackageName,
        current_target: Option<VersionCode>,
    ) -> Result<()> {
        for (_, target, path) in self.layout.delta_files_on_disk(package)? {
            if Some(target) != current_target {
                let _ = std::fs::remove_file(path);
            }
        }
        self.sweep_stale_tmp_files(package)
    }

    /// Removes any `.tmp` delta artifact left in the package directory —
    /// this job's own or an in-flight sibling's, orphaned by a process
    /// kill mid-generation. Run after every per-package pass so a crash
    /// never leaves an orphan outliving the run that produced it.
    fn sweep_stale_tmp_files(&self, package: &PackageName) -> Result<()> {
        let dir = self.layout.dir_for_package(package);
        if !dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("delta-") && name.ends_with(".gz.tmp") {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::PackageName;
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

    #[tokio::test]
    async fn single_version_package_produces_no_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        let package = PackageName::parse("com.example.app").unwrap();
        std::fs::create_dir_all(layout.dir_for_package(&package)).unwrap();
        std::fs::write(layout.apk_file(&package, VersionCode::new(1)), b"apk bytes").unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .transaction(|conn, _| {
                conn.execute(
                    "INSERT INTO packages (name, label, last_update_ms) VALUES (?1, ?1, 0)",
                    rusqlite::params![package.as_str()],
                )?;
                Ok(())
            })
            .unwrap();

        let printer = Arc::new(Printer::new());
        let handle = spawn(layout, store, fast_config(dir.path()), printer);
        handle.for_package(package.clone());
        handle.start_printing();
        let failed = handle.drain().await;
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn two_versions_produce_one_delta_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        let package = PackageName::parse("com.example.app").unwrap();
        std::fs::create_dir_all(layout.dir_for_package(&package)).unwrap();
        std::fs::write(
            layout.apk_file(&package, VersionCode::new(1)),
            b"version one payload, the base APK bytes here",
        )
        .unwrap();
        std::fs::write(
            layout.apk_file(&package, VersionCode::new(2)),
            b"version two payload, the updated APK bytes with changes",
        )
        .unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .transaction(|conn, _| {
                conn.execute(
                    "INSERT INTO packages (name, label, last_update_ms) VALUES (?1, ?1, 0)",
                    rusqlite::params![package.as_str()],
                )?;
                Ok(())
            })
            .unwrap();

        let printer = Arc::new(Printer::new());
        let handle = spawn(layout.clone(), store.clone(), fast_config(dir.path()), printer);
        handle.for_package(package.clone());
        handle.start_printing();
        let failed = handle.drain().await;
        assert!(failed.is_empty());

        assert!(layout
            .delta_file(&package, VersionCode::new(1), VersionCode::new(2))
            .exists());
        let records = store.read(|conn| store::get_deltas_for_app(conn, &package)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].base, VersionCode::new(1));
        assert_eq!(records[0].target, VersionCode::new(2));

        assert!(!layout
            .delta_file(&package, VersionCode::new(1), VersionCode::new(2))
            .with_extension("gz.tmp")
            .exists());
    }

    #[test]
    fn stale_tmp_file_from_a_crashed_job_is_swept() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        let package = PackageName::parse("com.example.app").unwrap();
        std::fs::create_dir_all(layout.dir_for_package(&package)).unwrap();

        let leftover = layout.dir_for_package(&package).join("delta-1-to-2.gz.tmp");
        std::fs::write(&leftover, b"partial bytes from a killed sibling job").unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = DeltaEngine {
            layout: layout.clone(),
            store,
            config: fast_config(dir.path()),
            printer: Arc::new(Printer::new()),
            semaphore: Arc::new(Semaphore::new(1)),
            reserved_estimate: AtomicU64::new(0),
        };

        engine.prune_stale_delta_files(&package, None).unwrap();
        assert!(!leftover.exists());
    }
}
