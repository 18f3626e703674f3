// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Opaque domain types.
//!
//! Wrapping primitive strings and integers in dedicated types prevents mixing
//! up, say, a hex digest with a Base64 one, and centralizes the validation
//! and normalization rules `spec.md` assigns to each.

use crate::error::{RepoError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A reverse-DNS Android package name: ASCII letters, digits, underscores,
/// and dots; each dot-separated segment begins with a letter.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() || !is_valid_package_name(&s) {
            return Err(RepoError::InvalidPackageName(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_package_name(s: &str) -> bool {
    s.split('.').all(|segment| {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PackageName {
    type Err = RepoError;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A release's version code. The lower 32 bits are the legacy version code,
/// the upper 32 bits the major version (`spec.md` §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionCode(u64);

impl VersionCode {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn from_parts(major: u32, minor: u32) -> Self {
        Self(((major as u64) << 32) | minor as u64)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for VersionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A SHA-256 digest encoded as standard Base64 (44 characters, as Android's
/// package manager reports APK digests).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha256Base64(String);

impl Sha256Base64 {
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        use base64::Engine;
        let s = s.into();
        if s.len() != 44 {
            return Err(RepoError::InvalidBase64Digest(s));
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(|_| RepoError::InvalidBase64Digest(s.clone()))?;
        if decoded.len() != 32 {
            return Err(RepoError::InvalidBase64Digest(s));
        }
        Ok(Self(s))
    }

    pub fn from_digest_bytes(bytes: &[u8; 32]) -> Self {
        use base64::Engine;
        Self(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Base64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A SHA-256 digest encoded as lowercase hex (64 characters), as used for
/// signer-certificate fingerprints. `:`-separated hex (as emitted by
/// `keytool`) is accepted and normalized.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha256Hex(String);

impl Sha256Hex {
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let stripped: String = s.as_ref().chars().filter(|c| *c != ':').collect();
        let lower = stripped.to_ascii_lowercase();
        if lower.len() != 64 || !lower.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RepoError::InvalidHexDigest(s.as_ref().to_string()));
        }
        Ok(Self(lower))
    }

    pub fn from_digest_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn new(millis: i64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    pub fn millis(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn package_name_validation() {
        assert!(PackageName::parse("com.example.app").is_ok());
        assert!(PackageName::parse("com.example_2.app_3").is_ok());
        assert!(PackageName::parse("").is_err());
        assert!(PackageName::parse("com.1example.app").is_err());
        assert!(PackageName::parse("com..app").is_err());
    }

    #[test]
    fn version_code_packing() {
        let v = VersionCode::from_parts(1, 7);
        assert_eq!(v.get(), (1u64 << 32) | 7);
    }

    #[test]
    fn hex_digest_normalizes_colons_and_case() {
        let raw = "AA:BB".to_string() + &"CC".repeat(31);
        let digest = Sha256Hex::parse(&raw).unwrap();
        assert_eq!(digest.as_str().len(), 64);
        assert!(digest.as_str().chars().all(|c| !c.is_ascii_uppercase()));
    }

    #[test]
    fn base64_digest_requires_32_decoded_bytes() {
        assert!(Sha256Base64::parse("short").is_err());
        let bytes = [7u8; 32];
        let encoded = Sha256Base64::from_digest_bytes(&bytes);
        assert!(Sha256Base64::parse(encoded.as_str()).is_ok());
    }
}
