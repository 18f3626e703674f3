// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dependency & Chain Validator (component E, `spec.md` §4.E).
//!
//! Pure function over a materialized view of releases: the orchestrator is
//! responsible for assembling "batch ∪ repo" into `combined` before calling
//! [`validate`]. Keeping this store-free makes the accumulate-then-abort
//! contract (every violation reported, nothing written on failure)
//! straightforward to test without a database.

use crate::error::{RepoError, Result};
use crate::model::{Dependency, Release};
use crate::types::{PackageName, Sha256Hex, VersionCode};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Non-fatal findings from a successful validation pass (missing optional
/// library, unsatisfied advisory package dependency).
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub warnings: Vec<String>,
}

/// Validates `combined` (every release relevant to the packages touched by
/// this insertion, existing and incoming together) and checks dependency
/// satisfaction / debuggable-rejection only for the releases named in
/// `incoming`. Accumulates every violation before returning; if any errors
/// were found, none of them short-circuits the others.
pub fn validate(
    combined: &[Release],
    incoming: &HashSet<(PackageName, VersionCode)>,
) -> Result<ValidationOutcome> {
    let mut errors: Vec<RepoError> = Vec::new();
    let mut outcome = ValidationOutcome::default();

    check_chain_continuity(combined, &mut errors);
    check_dependencies(combined, incoming, &mut errors, &mut outcome.warnings);

    if errors.is_empty() {
        Ok(outcome)
    } else {
        let detail = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        Err(RepoError::ValidationFailed(errors.len(), detail))
    }
}

/// `C(v1) ⊆ C(v2)` for every consecutive pair of a package's releases,
/// sorted ascending by version. Mirrors the platform's install-time key-set
/// check so the repository never ships a sequence Android would refuse to
/// update through.
fn check_chain_continuity(combined: &[Release], errors: &mut Vec<RepoError>) {
    let mut by_package: BTreeMap<&PackageName, Vec<&Release>> = BTreeMap::new();
    for release in combined {
        by_package.entry(&release.package).or_default().push(release);
    }
    for releases in by_package.values_mut() {
        releases.sort_by_key(|r| r.version_code);
        for pair in releases.windows(2) {
            let (previous, current) = (pair[0], pair[1]);
            let previous_certs: HashSet<&Sha256Hex> = previous.signer_certs.iter().collect();
            let current_certs: HashSet<&Sha256Hex> = current.signer_certs.iter().collect();
            if !previous_certs.is_subset(&current_certs) {
                errors.push(RepoError::ApkSigningCertMismatch {
                    package: current.package.as_str().to_string(),
                    previous_version: previous.version_code.get(),
                    version: current.version_code.get(),
                });
            }
        }
    }
}

fn check_dependencies(
    combined: &[Release],
    incoming: &HashSet<(PackageName, VersionCode)>,
    errors: &mut Vec<RepoError>,
    warnings: &mut Vec<String>,
) {
    let mut by_name: HashMap<&str, Vec<&Release>> = HashMap::new();
    for release in combined {
        by_name.entry(release.package.as_str()).or_default().push(release);
    }

    for release in combined {
        if !incoming.contains(&(release.package.clone(), release.version_code)) {
            continue;
        }
        if release.debuggable {
            errors.push(RepoError::Debuggable(release.package.as_str().to_string()));
        }
        for dep in &release.dependencies {
            check_one_dependency(release, dep, &by_name, errors, warnings);
        }
    }
}

fn check_one_dependency(
    release: &Release,
    dep: &Dependency,
    by_name: &HashMap<&str, Vec<&Release>>,
    errors: &mut Vec<RepoError>,
    warnings: &mut Vec<String>,
) {
    match dep {
        Dependency::UsesLibrary { name, required } => {
            let present = by_name.get(name.as_str()).is_some_and(|v| !v.is_empty());
            if !present {
                if *required {
                    errors.push(RepoError::MissingRequiredLibrary {
                        package: release.package.as_str().to_string(),
                        name: name.clone(),
                    });
                } else {
                    warnings.push(format!(
                        "{}: optional library {name} not present",
                        release.package
                    ));
                }
            }
        }
        Dependency::UsesStaticLibrary { name, version, certs } => {
            let found = by_name.get(name.as_str()).is_some_and(|candidates| {
                candidates
                    .iter()
                    .any(|c| c.version_code == *version && cert_sets_equal(&c.signer_certs, certs))
            });
            if !found {
                errors.push(RepoError::MissingStaticLibrary {
                    package: release.package.as_str().to_string(),
                    name: name.clone(),
                    version: version.get(),
                    certs: certs.iter().map(|c| c.as_str().to_string()).collect(),
                });
            }
        }
        Dependency::UsesPackage { name, minimum_version, certs, .. } => {
            let found = by_name.get(name.as_str()).is_some_and(|candidates| {
                candidates.iter().any(|c| {
                    minimum_version.map_or(true, |min| c.version_code >= min)
                        && certs
                            .as_ref()
                            .map_or(true, |want| cert_sets_equal(&c.signer_certs, want))
                })
            });
            if !found {
                warnings.push(format!(
                    "{}: advisory package dependency {name} not satisfied",
                    release.package
                ));
            }
        }
    }
}

/// Re-checks chain continuity for a single package's releases (already
/// sorted ascending by version). Used by the orchestrator after a package
/// directory is created, re-validating against what actually landed on disk
/// (`spec.md` §4.F step 5) rather than trusting the pre-transaction combined
/// view to still hold.
pub fn validate_chain_for_package(releases_ascending: &[Release]) -> Result<()> {
    let mut errors = Vec::new();
    check_chain_continuity(releases_ascending, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        let detail = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n");
        Err(RepoError::ValidationFailed(errors.len(), detail))
    }
}

fn cert_sets_equal(a: &[Sha256Hex], b: &[Sha256Hex]) -> bool {
    let a: HashSet<&Sha256Hex> = a.iter().collect();
    let b: HashSet<&Sha256Hex> = b.iter().collect();
    a == b
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{Sha256Base64, Timestamp};

    fn release(package: &str, version: u64, certs: &[u8], debuggable: bool) -> Release {
        Release {
            package: PackageName::parse(package).unwrap(),
            version_code: VersionCode::new(version),
            version_name: format!("1.{version}"),
            min_sdk: 21,
            timestamp: Timestamp::new(0),
            apk_sha256: Sha256Base64::from_digest_bytes(&[version as u8; 32]),
            v4_sha256: None,
            release_notes: None,
            signer_certs: certs.iter().map(|b| Sha256Hex::from_digest_bytes(&[*b; 32])).collect(),
            dependencies: vec![],
            debuggable,
        }
    }

    fn incoming_of(releases: &[&Release]) -> HashSet<(PackageName, VersionCode)> {
        releases
            .iter()
            .map(|r| (r.package.clone(), r.version_code))
            .collect()
    }

    #[test]
    fn chain_continuity_allows_superset_cert_growth() {
        let v1 = release("com.example.app", 1, &[1], false);
        let v2 = release("com.example.app", 2, &[1, 2], false);
        let combined = vec![v1.clone(), v2.clone()];
        let incoming = incoming_of(&[&v2]);
        assert!(validate(&combined, &incoming).is_ok());
    }

    #[test]
    fn chain_continuity_rejects_dropped_cert() {
        let v1 = release("com.example.app", 1, &[1, 2], false);
        let v2 = release("com.example.app", 2, &[2], false);
        let combined = vec![v1.clone(), v2.clone()];
        let incoming = incoming_of(&[&v2]);
        let err = validate(&combined, &incoming).unwrap_err();
        assert!(matches!(err, RepoError::ValidationFailed(1, _)));
    }

    #[test]
    fn debuggable_release_is_rejected() {
        let v1 = release("com.example.app", 1, &[1], true);
        let combined = vec![v1.clone()];
        let incoming = incoming_of(&[&v1]);
        assert!(validate(&combined, &incoming).is_err());
    }

    #[test]
    fn missing_required_library_is_an_error_optional_is_a_warning() {
        let mut dependent = release("com.example.app", 1, &[1], false);
        dependent.dependencies = vec![
            Dependency::UsesLibrary { name: "com.example.required".to_string(), required: true },
            Dependency::UsesLibrary { name: "com.example.optional".to_string(), required: false },
        ];
        let combined = vec![dependent.clone()];
        let incoming = incoming_of(&[&dependent]);
        let err = validate(&combined, &incoming).unwrap_err();
        assert!(matches!(err, RepoError::ValidationFailed(1, _)));
    }

    #[test]
    fn static_library_requires_exact_version_and_cert_set() {
        let library = release("com.example.lib", 5, &[9], false);
        let mut dependent = release("com.example.app", 1, &[1], false);
        dependent.dependencies = vec![Dependency::UsesStaticLibrary {
            name: "com.example.lib".to_string(),
            version: VersionCode::new(5),
            certs: vec![Sha256Hex::from_digest_bytes(&[9u8; 32])],
        }];
        let combined = vec![library.clone(), dependent.clone()];
        let incoming = incoming_of(&[&dependent]);
        assert!(validate(&combined, &incoming).is_ok());
    }

    #[test]
    fn uses_package_dependency_is_advisory_only() {
        let mut dependent = release("com.example.app", 1, &[1], false);
        dependent.dependencies = vec![Dependency::UsesPackage {
            package_type: "companion".to_string(),
            name: "com.example.missing".to_string(),
            minimum_version: None,
            certs: None,
        }];
        let combined = vec![dependent.clone()];
        let incoming = incoming_of(&[&dependent]);
        let outcome = validate(&combined, &incoming).unwrap();
        assert_eq!(outcome.warnings.len(), 1);
    }
}
