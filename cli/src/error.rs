// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CLI error type. Mirrors `debian-repo-tool`'s `DrtError`: one `#[from]`
//! per wrapped library error, plus the handful of variants the CLI itself
//! raises before ever calling into `apkrepo-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("argument parsing error: {0}")]
    Clap(#[from] clap::Error),

    #[error("{0}")]
    Repo(#[from] apkrepo_core::RepoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),

    #[error("{0} does not name an existing group")]
    NoSuchGroup(String),

    #[error("group {0} already exists; use --add to append to it")]
    GroupAlreadyExists(String),

    #[error("release {package}:{version} not found")]
    NoSuchRelease { package: String, version: u64 },
}

pub type Result<T> = std::result::Result<T, CliError>;
