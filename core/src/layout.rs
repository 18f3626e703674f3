// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File Layout Manager (component A).
//!
//! Pure path algebra over the repository root. No method here performs I/O
//! beyond [`RepoLayout::app_directory_listing`], which only lists.

use crate::error::{RepoError, Result};
use crate::types::{PackageName, VersionCode};
use std::path::{Path, PathBuf};

/// Resolves canonical on-disk paths for every artifact in a repository
/// rooted at a given directory.
#[derive(Clone, Debug)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for_package(&self, package: &PackageName) -> PathBuf {
        self.root.join(package.as_str())
    }

    pub fn apk_file(&self, package: &PackageName, version: VersionCode) -> PathBuf {
        self.dir_for_package(package).join(format!("{}.apk", version.get()))
    }

    pub fn v4_signature_file(&self, package: &PackageName, version: VersionCode) -> PathBuf {
        let mut p = self.apk_file(package, version).into_os_string();
        p.push(".idsig");
        PathBuf::from(p)
    }

    pub fn delta_file(
        &self,
        package: &PackageName,
        base: VersionCode,
        target: VersionCode,
    ) -> PathBuf {
        self.dir_for_package(package)
            .join(format!("delta-{}-to-{}.gz", base.get(), target.get()))
    }

    pub fn metadata_file(&self, package: &PackageName) -> PathBuf {
        self.dir_for_package(package).join("latest-metadata.json")
    }

    pub fn index_file(&self) -> PathBuf {
        self.root.join("index.txt")
    }

    pub fn bulk_metadata_file(&self) -> PathBuf {
        self.root.join("bulk-metadata.json")
    }

    pub fn icon_file(&self, package: &PackageName) -> PathBuf {
        self.dir_for_package(package).join("icon.png")
    }

    pub fn public_key_file(&self) -> PathBuf {
        self.root.join("public-key.pem")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".apkrepo.lock")
    }

    /// Path to the embedded store. Hidden alongside the lock file rather than
    /// served, unlike every other path this type resolves.
    pub fn db_file(&self) -> PathBuf {
        self.root.join(".apkrepo.db")
    }

    /// Parses a delta file name of the form `delta-<base>-to-<target>.gz`.
    pub fn parse_delta_file_name(name: &str) -> Option<(VersionCode, VersionCode)> {
        let rest = name.strip_prefix("delta-")?.strip_suffix(".gz")?;
        let (base, target) = rest.split_once("-to-")?;
        let base: u64 = base.parse().ok()?;
        let target: u64 = target.parse().ok()?;
        Some((VersionCode::new(base), VersionCode::new(target)))
    }

    /// Enumerates first-level package subdirectories. A directory name that
    /// is not a valid package name is a repository-state error.
    pub fn app_directory_listing(&self) -> Result<Vec<PackageName>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            names.push(PackageName::parse(name.to_string()).map_err(|_| {
                RepoError::InvalidRepoState(format!(
                    "repository directory {:?} is not a valid package name",
                    name
                ))
            })?);
        }
        names.sort();
        Ok(names)
    }

    /// Enumerates APK files present in a package directory, descending by
    /// version code.
    pub fn apk_versions_on_disk(&self, package: &PackageName) -> Result<Vec<VersionCode>> {
        let dir = self.dir_for_package(package);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".apk") {
                if let Ok(v) = stem.parse::<u64>() {
                    versions.push(VersionCode::new(v));
                }
            }
        }
        versions.sort_by(|a, b| b.cmp(a));
        Ok(versions)
    }

    /// Enumerates delta files present in a package directory.
    pub fn delta_files_on_disk(
        &self,
        package: &PackageName,
    ) -> Result<Vec<(VersionCode, VersionCode, PathBuf)>> {
        let dir = self.dir_for_package(package);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy().to_string();
            if let Some((base, target)) = Self::parse_delta_file_name(&name) {
                out.push((base, target, entry.path()));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn paths_match_contract() {
        let layout = RepoLayout::new("/srv/repo");
        let pkg = PackageName::parse("com.example.app").unwrap();
        assert_eq!(
            layout.apk_file(&pkg, VersionCode::new(7)),
            PathBuf::from("/srv/repo/com.example.app/7.apk")
        );
        assert_eq!(
            layout.delta_file(&pkg, VersionCode::new(2), VersionCode::new(7)),
            PathBuf::from("/srv/repo/com.example.app/delta-2-to-7.gz")
        );
    }

    #[test]
    fn delta_file_name_parsing() {
        assert_eq!(
            RepoLayout::parse_delta_file_name("delta-2-to-7.gz"),
            Some((VersionCode::new(2), VersionCode::new(7)))
        );
        assert_eq!(RepoLayout::parse_delta_file_name("7.apk"), None);
    }
}
