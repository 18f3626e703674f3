// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! APK Parser Facade (component C, `spec.md` §4.C/§6.1).
//!
//! Stands in for the "opaque library" `spec.md` §1 excludes from the core's
//! scope: real zip/manifest/resource-table reading, but signature
//! verification stays shallow (presence checks only — see SPEC_FULL.md).

pub mod axml;
pub mod arsc;
#[cfg(any(test, feature = "testing"))]
pub mod test_support;

use crate::error::RepoError;
use crate::model::Dependency;
use crate::types::{PackageName, Sha256Base64, Sha256Hex, VersionCode};
use axml::{AttrValue, Event};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApkParseError {
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("AndroidManifest.xml missing from APK")]
    ManifestMissing,

    #[error("malformed binary content: {0}")]
    Malformed(&'static str),

    #[error("truncated while reading {0}")]
    Truncated(&'static str),

    #[error("required manifest attribute missing or mistyped: {0}")]
    MissingAttribute(&'static str),

    #[error("invalid package name in manifest: {0:?}")]
    InvalidPackageName(#[from] Box<RepoError>),

    #[error("no v1/v2/v3 signing block found in APK")]
    SignatureFailed,
}

/// A validated, immutable view of one APK's manifest-derived facts
/// (`spec.md` §3's `Release` + `Dependency` + signer certs, plus the icon
/// payload).
#[derive(Clone, Debug)]
pub struct ApkDescriptor {
    pub package: PackageName,
    pub version_code: VersionCode,
    pub version_name: String,
    pub min_sdk: u32,
    pub debuggable: bool,
    pub label: String,
    pub icon: Option<Vec<u8>>,
    pub signer_certs: Vec<Sha256Hex>,
    pub dependencies: Vec<Dependency>,
    pub apk_sha256: Sha256Base64,
    pub v4_sha256: Option<Sha256Base64>,
}

/// Minimum icon density to prefer, expressed in the same units as
/// `ResTable_config::density` (dpi). 160 is `mdpi`, the platform default.
pub const DEFAULT_MIN_ICON_DENSITY: u16 = 160;

pub fn parse(path: &Path) -> Result<ApkDescriptor, ApkParseError> {
    parse_with_min_density(path, DEFAULT_MIN_ICON_DENSITY)
}

pub fn parse_with_min_density(
    path: &Path,
    min_icon_density: u16,
) -> Result<ApkDescriptor, ApkParseError> {
    let file = std::fs::File::open(path)?;
    let apk_sha256 = sha256_base64_of_file(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let manifest_bytes = read_zip_entry(&mut archive, "AndroidManifest.xml")
        .ok_or(ApkParseError::ManifestMissing)?;
    let manifest = axml::parse(&manifest_bytes)?;

    let resource_table = read_zip_entry(&mut archive, "resources.arsc")
        .and_then(|bytes| arsc::parse(&bytes).ok());

    let fields = extract_manifest_fields(&manifest)?;

    let label = resolve_possibly_referenced_string(&fields.label, resource_table.as_ref())
        .unwrap_or_else(|| fields.package.clone());

    let version_name =
        resolve_possibly_referenced_string(&fields.version_name_raw, resource_table.as_ref())
            .unwrap_or_default();

    let icon = match (&fields.icon_ref, resource_table.as_ref()) {
        (Some(AttrValue::Reference(res_id)), Some(table)) => {
            icon_bytes_for_resource(&mut archive, table, *res_id, min_icon_density)
        }
        _ => None,
    };

    let signer_certs = read_signer_certificates(&mut archive)?;

    let v4_sha256 = v4_signature_digest(path)?;

    let package = PackageName::parse(fields.package.clone())
        .map_err(|e| ApkParseError::InvalidPackageName(Box::new(e)))?;

    Ok(ApkDescriptor {
        package,
        version_code: VersionCode::from_parts(fields.version_code_major, fields.version_code_minor),
        version_name,
        min_sdk: fields.min_sdk,
        debuggable: fields.debuggable,
        label,
        icon,
        signer_certs,
        dependencies: fields.dependencies,
        apk_sha256,
        v4_sha256,
    })
}

fn sha256_base64_of_file(path: &Path) -> Result<Sha256Base64, ApkParseError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let digest: [u8; 32] = hasher.finalize().into();
    Ok(Sha256Base64::from_digest_bytes(&digest))
}

fn v4_signature_digest(apk_path: &Path) -> Result<Option<Sha256Base64>, ApkParseError> {
    let mut sidecar = apk_path.as_os_str().to_os_string();
    sidecar.push(".idsig");
    let sidecar = std::path::PathBuf::from(sidecar);
    if !sidecar.exists() {
        return Ok(None);
    }
    let mut file = std::fs::File::open(&sidecar)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let digest: [u8; 32] = hasher.finalize().into();
    Ok(Some(Sha256Base64::from_digest_bytes(&digest)))
}

fn read_zip_entry<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Option<Vec<u8>> {
    let mut entry = archive.by_name(name).ok()?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf).ok()?;
    Some(buf)
}

/// Certificate presence/digest extraction. Real APK Signature Scheme v1-v3
/// cryptographic verification lives outside this crate's scope (`spec.md`
/// §1); here we digest each `META-INF/*.RSA`/`*.DSA`/`*.EC` signer block
/// file found in the archive, which is what a real verifier would also need
/// located before validating.
fn read_signer_certificates<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<Vec<Sha256Hex>, ApkParseError> {
    let mut certs = Vec::new();
    let names: Vec<String> = archive.file_names().map(|s| s.to_string()).collect();
    for name in names {
        let upper = name.to_ascii_uppercase();
        if !upper.starts_with("META-INF/") {
            continue;
        }
        if !(upper.ends_with(".RSA") || upper.ends_with(".DSA") || upper.ends_with(".EC")) {
            continue;
        }
        let mut entry = archive.by_name(&name)?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        let digest: [u8; 32] = Sha256::digest(&buf).into();
        certs.push(Sha256Hex::from_digest_bytes(&digest));
    }
    if certs.is_empty() {
        return Err(ApkParseError::SignatureFailed);
    }
    certs.sort();
    certs.dedup();
    Ok(certs)
}

struct ManifestFields {
    package: String,
    version_code_major: u32,
    version_code_minor: u32,
    version_name_raw: AttrValue,
    min_sdk: u32,
    debuggable: bool,
    label: AttrValue,
    icon_ref: Option<AttrValue>,
    dependencies: Vec<Dependency>,
}

fn attr<'a>(attrs: &'a [axml::Attribute], name: &str) -> Option<&'a axml::Attribute> {
    attrs.iter().find(|a| a.name == name)
}

fn extract_manifest_fields(doc: &axml::AxmlDocument) -> Result<ManifestFields, ApkParseError> {
    let mut package = None;
    let mut version_code_minor = 0u32;
    let mut version_code_major = 0u32;
    let mut version_name_raw = AttrValue::String(String::new());
    let mut min_sdk = 1u32;
    let mut debuggable = false;
    let mut label = AttrValue::String(String::new());
    let mut icon_ref = None;
    let mut dependencies = Vec::new();

    // Element stack tracks which tag we're inside, so `uses-library` etc.
    // are only parsed as direct children of `<application>`.
    let mut stack: Vec<String> = Vec::new();
    let mut pending_static_lib: Option<(String, Option<u64>, Vec<Sha256Hex>)> = None;
    let mut pending_uses_package: Option<(String, String, Option<VersionCode>, Option<Vec<Sha256Hex>>)> =
        None;

    for event in &doc.events {
        match event {
            Event::StartElement { name, attributes } => {
                match name.as_str() {
                    "manifest" => {
                        if let Some(a) = attr(attributes, "package") {
                            if let AttrValue::String(s) = &a.value {
                                package = Some(s.clone());
                            }
                        }
                        if let Some(a) = attr(attributes, "versionCode") {
                            version_code_minor = a.value.as_i64().unwrap_or(0) as u32;
                        }
                        if let Some(a) = attr(attributes, "versionCodeMajor") {
                            version_code_major = a.value.as_i64().unwrap_or(0) as u32;
                        }
                    }
                    "uses-sdk" => {
                        if let Some(a) = attr(attributes, "minSdkVersion") {
                            min_sdk = a.value.as_i64().unwrap_or(1) as u32;
                        }
                    }
                    "application" => {
                        if let Some(a) = attr(attributes, "debuggable") {
                            debuggable = a.value.as_bool().unwrap_or(false);
                        }
                        if let Some(a) = attr(attributes, "label") {
                            label = a.value.clone();
                        }
                        if let Some(a) = attr(attributes, "versionName") {
                            version_name_raw = a.value.clone();
                        }
                        if let Some(a) = attr(attributes, "icon") {
                            icon_ref = Some(a.value.clone());
                        }
                    }
                    "uses-library" => {
                        let name = attr(attributes, "name")
                            .and_then(|a| match &a.value {
                                AttrValue::String(s) => Some(s.clone()),
                                _ => None,
                            })
                            .ok_or(ApkParseError::MissingAttribute("uses-library/name"))?;
                        let required = attr(attributes, "required")
                            .and_then(|a| a.value.as_bool())
                            .unwrap_or(true);
                        dependencies.push(Dependency::UsesLibrary { name, required });
                    }
                    "uses-static-library" => {
                        let name = attr(attributes, "name")
                            .and_then(|a| match &a.value {
                                AttrValue::String(s) => Some(s.clone()),
                                _ => None,
                            })
                            .ok_or(ApkParseError::MissingAttribute("uses-static-library/name"))?;
                        let version = attr(attributes, "version").and_then(|a| a.value.as_i64());
                        let mut certs = Vec::new();
                        if let Some(a) = attr(attributes, "certDigest") {
                            if let AttrValue::String(s) = &a.value {
                                certs.push(Sha256Hex::parse(s).map_err(|_| {
                                    ApkParseError::MissingAttribute(
                                        "uses-static-library/certDigest",
                                    )
                                })?);
                            }
                        }
                        pending_static_lib = Some((name, version.map(|v| v as u64), certs));
                    }
                    "uses-package" => {
                        let package_type = attr(attributes, "packageType")
                            .and_then(|a| match &a.value {
                                AttrValue::String(s) => Some(s.clone()),
                                _ => None,
                            })
                            .unwrap_or_default();
                        let name = attr(attributes, "name")
                            .and_then(|a| match &a.value {
                                AttrValue::String(s) => Some(s.clone()),
                                _ => None,
                            })
                            .ok_or(ApkParseError::MissingAttribute("uses-package/name"))?;
                        let minimum_version = attr(attributes, "version")
                            .and_then(|a| a.value.as_i64())
                            .map(|v| VersionCode::new(v as u64));
                        let certs = attr(attributes, "certDigest")
                            .and_then(|a| match &a.value {
                                AttrValue::String(s) => Sha256Hex::parse(s).ok(),
                                _ => None,
                            })
                            .map(|c| vec![c]);
                        pending_uses_package = Some((package_type, name, minimum_version, certs));
                    }
                    "additional-certificate" => {
                        if let Some(a) = attr(attributes, "certDigest") {
                            if let AttrValue::String(s) = &a.value {
                                if let Ok(digest) = Sha256Hex::parse(s) {
                                    if let Some((_, _, certs)) = pending_static_lib.as_mut() {
                                        certs.push(digest.clone());
                                    }
                                    if let Some((_, _, _, certs)) = pending_uses_package.as_mut() {
                                        let entry = certs.get_or_insert_with(Vec::new);
                                        entry.push(digest);
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
                stack.push(name.clone());
            }
            Event::EndElement { name } => {
                if name == "uses-static-library" {
                    if let Some((lib_name, version, certs)) = pending_static_lib.take() {
                        dependencies.push(Dependency::UsesStaticLibrary {
                            name: lib_name,
                            version: VersionCode::new(version.unwrap_or(0)),
                            certs,
                        });
                    }
                }
                if name == "uses-package" {
                    if let Some((package_type, dep_name, minimum_version, certs)) =
                        pending_uses_package.take()
                    {
                        dependencies.push(Dependency::UsesPackage {
                            package_type,
                            name: dep_name,
                            minimum_version,
                            certs,
                        });
                    }
                }
                stack.pop();
            }
        }
    }

    Ok(ManifestFields {
        package: package.ok_or(ApkParseError::MissingAttribute("manifest/package"))?,
        version_code_major,
        version_code_minor,
        version_name_raw,
        min_sdk,
        debuggable,
        label,
        icon_ref,
        dependencies,
    })
}

fn resolve_possibly_referenced_string(
    value: &AttrValue,
    table: Option<&arsc::ResourceTable>,
) -> Option<String> {
    match value {
        AttrValue::String(s) if !s.is_empty() => Some(s.clone()),
        AttrValue::Reference(res_id) => {
            let table = table?;
            match table.resolve(*res_id, 40)? {
                arsc::ResolvedValue::String(s) => Some(s),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Resolves `spec.md` §4.C's icon selection rule: follow up to 40
/// references to a resource whose per-config entries are raster file
/// paths, pick the best density, reject vector/XML drawables, and return
/// the file's bytes.
fn icon_bytes_for_resource<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    table: &arsc::ResourceTable,
    initial_res_id: u32,
    min_density: u16,
) -> Option<Vec<u8>> {
    let candidates = find_icon_candidates(table, initial_res_id)?;
    let chosen = select_best_icon_config(&candidates, min_density)?;
    let arsc::ResolvedValue::String(path) = &chosen.value else {
        return None;
    };
    let bytes = read_zip_entry(archive, path)?;
    if axml::parse(&bytes).is_ok() {
        return None; // vector/XML drawable, not raster
    }
    Some(bytes)
}

/// Walks the reference chain (bounded, `spec.md` §4.C/§9) until it finds a
/// resource id whose config entries are raw (raster/xml file path) values.
fn find_icon_candidates(
    table: &arsc::ResourceTable,
    initial_res_id: u32,
) -> Option<Vec<arsc::ConfigEntry>> {
    let mut current = initial_res_id;
    for _ in 0..40 {
        let entries = table.config_entries(current);
        if entries.is_empty() {
            return None;
        }
        if entries
            .iter()
            .any(|e| matches!(e.value, arsc::ResolvedValue::String(_)))
        {
            return Some(entries.to_vec());
        }
        match &entries[0].value {
            arsc::ResolvedValue::Reference(next) => current = *next,
            _ => return None,
        }
    }
    None
}

/// Picks the smallest density that is still `>= min_density`, falling back
/// to the largest available density if none qualify.
fn select_best_icon_config(
    candidates: &[arsc::ConfigEntry],
    min_density: u16,
) -> Option<&arsc::ConfigEntry> {
    let raster: Vec<&arsc::ConfigEntry> = candidates
        .iter()
        .filter(|c| matches!(c.value, arsc::ResolvedValue::String(_)))
        .collect();
    if raster.is_empty() {
        return None;
    }
    raster
        .iter()
        .filter(|c| c.density >= min_density)
        .min_by_key(|c| c.density)
        .or_else(|| raster.iter().max_by_key(|c| c.density))
        .copied()
}

#[cfg(test)]
mod test {
    use super::*;
    use arsc::{ConfigEntry, ResolvedValue};

    fn entry(density: u16, path: &str) -> ConfigEntry {
        ConfigEntry {
            density,
            value: ResolvedValue::String(path.to_string()),
        }
    }

    #[test]
    fn picks_closest_density_above_threshold() {
        let candidates = vec![entry(120, "ldpi.png"), entry(240, "hdpi.png"), entry(480, "xxhdpi.png")];
        let chosen = select_best_icon_config(&candidates, 160).unwrap();
        assert_eq!(chosen.density, 240);
    }

    #[test]
    fn falls_back_to_largest_when_none_qualify() {
        let candidates = vec![entry(120, "ldpi.png"), entry(160, "mdpi.png")];
        let chosen = select_best_icon_config(&candidates, 480).unwrap();
        assert_eq!(chosen.density, 160);
    }
}
