// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `validate-repo` walker (named in `spec.md` §1 as reusing core contracts
//! without adding new engineering). Cross-checks the on-disk tree against
//! the store and re-runs the subset of invariants from `spec.md` §8 that
//! make sense to check after the fact: digest agreement (1, 2), the delta
//! retention bound (3), chain continuity (4), and signature validity (5).

use crate::error::{CliError, Result};
use apkrepo_core::layout::RepoLayout;
use apkrepo_core::signer::{self, PublicKey};
use apkrepo_core::store::{self, Store};
use apkrepo_core::validator;
use apkrepo_core::{hash, RepoError};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub packages_checked: usize,
    pub releases_checked: usize,
    pub deltas_checked: usize,
}

pub fn validate_repo(layout: &RepoLayout, store: &Arc<Store>) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();
    let mut errors: Vec<String> = Vec::new();

    let packages = layout.app_directory_listing()?;

    for package in &packages {
        report.packages_checked += 1;
        let releases = store.read(|conn| store::get_releases_ascending(conn, package))?;

        if let Err(e) = validator::validate_chain_for_package(&releases) {
            errors.push(e.to_string());
        }

        let mut max_version = None;
        for release in &releases {
            report.releases_checked += 1;
            max_version = Some(release.version_code);

            let apk_path = layout.apk_file(package, release.version_code);
            match hash::sha256_base64_of_file(&apk_path) {
                Ok(digest) if digest == release.apk_sha256 => {}
                Ok(_) => errors.push(format!(
                    "{package}:{}: on-disk APK digest does not match the recorded release",
                    release.version_code
                )),
                Err(e) => errors.push(format!(
                    "{package}:{}: {e}",
                    release.version_code
                )),
            }
        }

        let deltas = store.read(|conn| store::get_deltas_for_app(conn, package))?;
        if deltas.len() > 5 {
            errors.push(format!(
                "{package}: {} delta records exceeds the retention bound of 5",
                deltas.len()
            ));
        }
        for delta in &deltas {
            report.deltas_checked += 1;
            if Some(delta.target) != max_version {
                errors.push(format!(
                    "{package}: stale delta targeting {} while the latest release is {:?}",
                    delta.target, max_version
                ));
                continue;
            }
            let delta_path = layout.delta_file(package, delta.base, delta.target);
            match hash::sha256_hex_of_file(&delta_path) {
                Ok(digest) if digest == delta.sha256 => {}
                Ok(_) => errors.push(format!(
                    "{package}: delta {}->{} digest does not match its DeltaRecord",
                    delta.base, delta.target
                )),
                Err(e) => errors.push(format!(
                    "{package}: delta {}->{}: {e}",
                    delta.base, delta.target
                )),
            }
        }
    }

    if let Err(e) = check_signatures(layout, &packages) {
        errors.push(e.to_string());
    }

    if errors.is_empty() {
        Ok(report)
    } else {
        Err(CliError::Repo(RepoError::InvalidRepoState(errors.join("\n"))))
    }
}

fn check_signatures(
    layout: &RepoLayout,
    packages: &[apkrepo_core::types::PackageName],
) -> apkrepo_core::Result<()> {
    let public_key_path = layout.public_key_file();
    if !public_key_path.exists() {
        return Ok(());
    }
    let public_key = PublicKey::from_pem_file(&public_key_path)?;

    signer::verify(&public_key, &layout.index_file())?;
    signer::verify(&public_key, &layout.bulk_metadata_file())?;
    for package in packages {
        signer::verify(&public_key, &layout.metadata_file(package))?;
    }
    Ok(())
}
