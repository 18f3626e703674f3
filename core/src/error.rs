// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling.

use thiserror::Error;

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0:?}")]
    Store(#[from] rusqlite::Error),

    #[error("JSON error: {0:?}")]
    Json(#[from] serde_json::Error),

    #[error("zip error: {0:?}")]
    Zip(#[from] zip::result::ZipError),

    #[error("hex parsing error: {0:?}")]
    Hex(#[from] hex::FromHexError),

    #[error("base64 decode error: {0:?}")]
    Base64(#[from] base64::DecodeError),

    #[error("key error: {0}")]
    Key(String),

    #[error("invalid package name: {0}")]
    InvalidPackageName(String),

    #[error("invalid sha256 hex digest: {0}")]
    InvalidHexDigest(String),

    #[error("invalid sha256 base64 digest: {0}")]
    InvalidBase64Digest(String),

    #[error("could not create directory for package {0}: {1}")]
    InsertFailed(String, String),

    #[error("a more recent version of {package} is already present in the repository (incoming {incoming}, existing {existing})")]
    MoreRecentVersionInRepo {
        package: String,
        incoming: u64,
        existing: u64,
    },

    #[error("signing certificate set for {package} version {version} is not a superset of the previous release's ({previous_version}); an installed device could not update through this sequence")]
    ApkSigningCertMismatch {
        package: String,
        previous_version: u64,
        version: u64,
    },

    #[error("repository signing key does not match the key already recorded in public-key.pem")]
    RepoSigningKeyMismatch,

    #[error("repository is in an inconsistent state: {0}")]
    InvalidRepoState(String),

    #[error("failed to parse APK {path}: {reason}")]
    AppDetailParseFailed { path: String, reason: String },

    #[error("APK {0} is debuggable and cannot be inserted into the repository")]
    Debuggable(String),

    #[error("missing static library dependency {name} version {version} (cert set {certs:?}) required by {package}")]
    MissingStaticLibrary {
        package: String,
        name: String,
        version: u64,
        certs: Vec<String>,
    },

    #[error("missing required library {name} required by {package}")]
    MissingRequiredLibrary { package: String, name: String },

    #[error("edit produced no usable release notes")]
    EditFailed,

    #[error("group {0} does not exist")]
    GroupDoesntExist(String),

    #[error("dependency validation failed with {0} error(s):\n{1}")]
    ValidationFailed(usize, String),

    #[error("delta codec error: {0}")]
    Codec(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("repository is locked by another invocation: {0}")]
    Locked(String),
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, RepoError>;
