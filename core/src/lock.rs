// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Advisory repository-level lock file (`spec.md` §5: "concurrent
//! invocations of the orchestrator against the same repository are not
//! supported and should be prevented by a repository-level lock file").

use crate::error::{RepoError, Result};
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Holds an advisory exclusive lock on `<root>/.apkrepo.lock` for the
/// lifetime of the guard. Dropping releases the lock.
pub struct RepoLock {
    file: File,
    path: PathBuf,
}

impl RepoLock {
    /// Acquires the lock, failing fast (no blocking wait) if another
    /// invocation already holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            RepoError::Locked(format!(
                "{} is held by another apkrepo invocation",
                path.display()
            ))
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl std::fmt::Debug for RepoLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoLock").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".apkrepo.lock");
        let first = RepoLock::acquire(&lock_path).unwrap();
        assert!(RepoLock::acquire(&lock_path).is_err());
        drop(first);
        assert!(RepoLock::acquire(&lock_path).is_ok());
    }
}
