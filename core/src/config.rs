// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunable knobs for the repository mutation engine.
//!
//! These are the constants named throughout `spec.md` §4.G, exposed as a
//! struct so tests can shrink them rather than waiting on real timers and
//! disk pressure.

/// Maximum number of delta bases retained per package (`K` in `spec.md` §4.G).
pub const DEFAULT_MAX_DELTAS_PER_PACKAGE: usize = 5;

/// Maximum number of concurrent delta-generation workers (`P_gen`).
pub const DEFAULT_DELTA_CONCURRENCY: usize = 5;

/// Free-space safety margin maintained in the temp directory (`SAFETY`).
pub const DEFAULT_SAFETY_MARGIN_BYTES: u64 = 200 * 1024 * 1024;

/// Maximum number of times a delta job may be deferred for lack of space
/// (`D_max`).
pub const DEFAULT_MAX_DEFERRALS: u32 = 20;

/// Delay between deferred attempts.
pub const DEFAULT_DEFERRAL_DELAY: std::time::Duration = std::time::Duration::from_secs(30);

/// Runtime configuration for a single [`crate::orchestrator::insert_apks`]
/// or [`crate::orchestrator::republish`] invocation. Fields default to the
/// constants above but can be overridden, primarily so tests run in
/// milliseconds rather than minutes.
#[derive(Clone, Debug)]
pub struct RepoConfig {
    pub max_deltas_per_package: usize,
    pub delta_concurrency: usize,
    pub safety_margin_bytes: u64,
    pub max_deferrals: u32,
    pub deferral_delay: std::time::Duration,
    pub temp_dir: std::path::PathBuf,
}

impl RepoConfig {
    pub fn new(repo_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            max_deltas_per_package: DEFAULT_MAX_DELTAS_PER_PACKAGE,
            delta_concurrency: DEFAULT_DELTA_CONCURRENCY,
            safety_margin_bytes: DEFAULT_SAFETY_MARGIN_BYTES,
            max_deferrals: DEFAULT_MAX_DEFERRALS,
            deferral_delay: DEFAULT_DEFERRAL_DELAY,
            temp_dir: repo_root.into(),
        }
    }

    /// Applies `APKREPO_*` environment variable overrides, in the idiom of
    /// `debian-repo-tool`'s configurable copier. Malformed values are
    /// ignored in favor of the default.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("APKREPO_DELTA_CONCURRENCY") {
            if let Ok(v) = v.parse() {
                self.delta_concurrency = v;
            }
        }
        if let Ok(v) = std::env::var("APKREPO_SAFETY_MARGIN_BYTES") {
            if let Ok(v) = v.parse() {
                self.safety_margin_bytes = v;
            }
        }
        if let Ok(v) = std::env::var("APKREPO_MAX_DEFERRALS") {
            if let Ok(v) = v.parse() {
                self.max_deferrals = v;
            }
        }
    }
}
