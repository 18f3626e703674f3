// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Domain entities shared between the APK parser facade, the metadata
//! store, and the publisher (`spec.md` §3).

use crate::types::{PackageName, Sha256Base64, Sha256Hex, Timestamp, VersionCode};

/// A package row as tracked by the metadata store.
#[derive(Clone, Debug)]
pub struct AppRecord {
    pub name: PackageName,
    pub label: String,
    pub group: Option<String>,
    pub last_update: Timestamp,
    pub has_icon: bool,
}

/// One dependency declared by a release. Three disjoint kinds, matching
/// `spec.md` §3's `Dependency` entity and §6.1's manifest tags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dependency {
    UsesLibrary {
        name: String,
        required: bool,
    },
    UsesStaticLibrary {
        name: String,
        version: VersionCode,
        certs: Vec<Sha256Hex>,
    },
    UsesPackage {
        package_type: String,
        name: String,
        minimum_version: Option<VersionCode>,
        certs: Option<Vec<Sha256Hex>>,
    },
}

/// A single versioned release of a package.
#[derive(Clone, Debug)]
pub struct Release {
    pub package: PackageName,
    pub version_code: VersionCode,
    pub version_name: String,
    pub min_sdk: u32,
    pub timestamp: Timestamp,
    pub apk_sha256: Sha256Base64,
    pub v4_sha256: Option<Sha256Base64>,
    pub release_notes: Option<String>,
    pub signer_certs: Vec<Sha256Hex>,
    pub dependencies: Vec<Dependency>,
    pub debuggable: bool,
}

/// A delta file record. Exists only when the corresponding file on disk
/// exists (`spec.md` §3's `DeltaRecord`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaRecord {
    pub package: PackageName,
    pub base: VersionCode,
    pub target: VersionCode,
    pub sha256: Sha256Hex,
}
