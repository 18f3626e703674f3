// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subcommand implementations. Each function opens the store, does its
//! work (acquiring the repository lock first for anything mutating), and
//! leaves printing a short human-readable summary to its caller.

use crate::cli::{require_str, values};
use crate::editor::EditorPrompt;
use crate::error::{CliError, Result};
use crate::validate;
use apkrepo_core::config::RepoConfig;
use apkrepo_core::layout::RepoLayout;
use apkrepo_core::lock::RepoLock;
use apkrepo_core::orchestrator::{self, ReleaseNotesPrompt};
use apkrepo_core::printer::Printer;
use apkrepo_core::signer::PrivateKey;
use apkrepo_core::store::{self, Store};
use apkrepo_core::types::{PackageName, Timestamp, VersionCode};
use apkrepo_core::RepoError;
use clap::ArgMatches;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn open_store(repo_root: &Path) -> Result<(RepoLayout, Arc<Store>)> {
    std::fs::create_dir_all(repo_root)?;
    let layout = RepoLayout::new(repo_root);
    let store = Arc::new(Store::open(&layout.db_file())?);
    Ok((layout, store))
}

fn load_key(args: &ArgMatches) -> Result<PrivateKey> {
    let path = PathBuf::from(require_str(args, "key"));
    Ok(PrivateKey::from_pkcs8_pem_file(&path)?)
}

fn parse_packages(raw: &[String]) -> Result<Vec<PackageName>> {
    raw.iter()
        .map(|s| PackageName::parse(s.clone()).map_err(CliError::Repo))
        .collect()
}

fn republish(layout: &RepoLayout, store: &Arc<Store>, key: &PrivateKey) -> Result<()> {
    orchestrator::republish(layout, store, key)?;
    Ok(())
}

pub async fn insert_apk(repo_root: &Path, args: &ArgMatches) -> Result<()> {
    let (layout, store) = open_store(repo_root)?;
    let _lock = RepoLock::acquire(&layout.lock_file())?;
    let key = load_key(args)?;

    let mut config = RepoConfig::new(repo_root.to_path_buf());
    config.apply_env_overrides();

    let printer = Arc::new(Printer::new());
    let prompt = if args.get_flag("release-notes") {
        Some(EditorPrompt::new(printer.clone()))
    } else {
        None
    };
    let paths: Vec<PathBuf> = values(args, "apk").into_iter().map(PathBuf::from).collect();

    let report = orchestrator::insert_apks(
        &layout,
        &store,
        &config,
        printer,
        &key,
        &paths,
        prompt.as_ref().map(|p| p as &dyn ReleaseNotesPrompt),
    )
    .await?;

    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    println!(
        "inserted {} package(s), skipped {}",
        report.written_packages.len(),
        report.skipped_packages.len()
    );
    Ok(())
}

pub fn validate_repo(repo_root: &Path) -> Result<()> {
    let (layout, store) = open_store(repo_root)?;
    let report = validate::validate_repo(&layout, &store)?;
    println!(
        "ok: {} package(s), {} release(s), {} delta(s) checked",
        report.packages_checked, report.releases_checked, report.deltas_checked
    );
    Ok(())
}

pub fn set_group(repo_root: &Path, args: &ArgMatches) -> Result<()> {
    let (layout, store) = open_store(repo_root)?;
    let _lock = RepoLock::acquire(&layout.lock_file())?;
    let key = load_key(args)?;
    let group = require_str(args, "group").to_string();
    let packages = parse_packages(&values(args, "package"))?;
    let create = args.get_flag("create");
    let add = args.get_flag("add");

    let timestamp = Timestamp::now();
    store.transaction(|conn, _| {
        let existing = store::get_group_to_app_map(conn)?;
        if create && existing.contains_key(&group) {
            return Err(RepoError::InvalidRepoState(format!(
                "group {group} already exists; use --add to append to it"
            )));
        }
        if add && !existing.contains_key(&group) {
            return Err(RepoError::GroupDoesntExist(group.clone()));
        }
        store::create_group(conn, &group, &packages, timestamp)
    })?;

    republish(&layout, &store, &key)
}

pub fn remove_group(repo_root: &Path, args: &ArgMatches) -> Result<()> {
    let (layout, store) = open_store(repo_root)?;
    let _lock = RepoLock::acquire(&layout.lock_file())?;
    let key = load_key(args)?;
    let packages = parse_packages(&values(args, "package"))?;
    let timestamp = Timestamp::now();

    store.transaction(|conn, _| store::set_group_for_packages(conn, None, &packages, timestamp))?;
    republish(&layout, &store, &key)
}

pub fn delete_group(repo_root: &Path, args: &ArgMatches) -> Result<()> {
    let (layout, store) = open_store(repo_root)?;
    let _lock = RepoLock::acquire(&layout.lock_file())?;
    let key = load_key(args)?;
    let group = require_str(args, "group").to_string();

    let exists = store.read(|conn| Ok(store::get_group_to_app_map(conn)?.contains_key(&group)))?;
    if !exists {
        return Err(CliError::NoSuchGroup(group));
    }

    store.transaction(|conn, _| store::delete_group(conn, &group))?;
    republish(&layout, &store, &key)
}

pub fn edit_release_notes(repo_root: &Path, args: &ArgMatches) -> Result<()> {
    let (layout, store) = open_store(repo_root)?;
    let _lock = RepoLock::acquire(&layout.lock_file())?;
    let key = load_key(args)?;
    let package = PackageName::parse(require_str(args, "package").to_string())?;

    let app = store
        .read(|conn| store::get_app(conn, &package))?
        .ok_or_else(|| CliError::Repo(RepoError::InvalidRepoState(format!("package {package} not found"))))?;

    let version = match args.get_one::<String>("version") {
        Some(v) => {
            let code: u64 = v
                .parse()
                .map_err(|_| CliError::Repo(RepoError::InvalidRepoState(format!("invalid version code {v}"))))?;
            VersionCode::new(code)
        }
        None => {
            store
                .read(|conn| store::get_latest_release(conn, &package))?
                .ok_or_else(|| {
                    CliError::Repo(RepoError::InvalidRepoState(format!("{package} has no releases")))
                })?
                .version_code
        }
    };

    let existing = store
        .read(|conn| store::get_release(conn, &package, version))?
        .ok_or_else(|| CliError::NoSuchRelease {
            package: package.as_str().to_string(),
            version: version.get(),
        })?;

    let notes = if args.get_flag("delete") {
        None
    } else {
        let printer = Arc::new(Printer::new());
        EditorPrompt::new(printer).prompt(&package, version, existing.release_notes.as_deref(), app.last_update)?
    };

    let timestamp = Timestamp::now();
    store.transaction(|conn, _| store::update_release_notes(conn, &package, version, notes.as_deref(), timestamp))?;
    republish(&layout, &store, &key)
}

pub fn resign(repo_root: &Path, args: &ArgMatches) -> Result<()> {
    let (layout, store) = open_store(repo_root)?;
    let _lock = RepoLock::acquire(&layout.lock_file())?;
    let key = load_key(args)?;

    for raw in values(args, "package") {
        let package = PackageName::parse(raw)?;
        let exists = store.read(|conn| store::does_app_exist(conn, &package))?;
        if !exists {
            return Err(CliError::Repo(RepoError::InvalidRepoState(format!(
                "package {package} not found"
            ))));
        }
    }

    orchestrator::republish(&layout, &store, &key)?;
    Ok(())
}

pub fn list_packages(repo_root: &Path) -> Result<()> {
    let (_, store) = open_store(repo_root)?;
    let names = store.read(|conn| {
        let mut names = Vec::new();
        store::for_each_app_name(conn, |name| {
            names.push(name.clone());
            Ok(())
        })?;
        Ok(names)
    })?;
    for name in names {
        println!("{name}");
    }
    Ok(())
}

pub fn list_groups(repo_root: &Path) -> Result<()> {
    let (_, store) = open_store(repo_root)?;
    let map = store.read(|conn| store::get_group_to_app_map(conn))?;
    for (group, packages) in map {
        println!("{group}:");
        for package in packages {
            println!("  {package}");
        }
    }
    Ok(())
}
