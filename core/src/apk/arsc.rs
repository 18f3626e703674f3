// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A compact reader for Android's compiled resource table (`resources.arsc`).
//!
//! Covers enough of the format to resolve simple string/integer resources
//! and to enumerate per-configuration entries for icon density selection
//! (`spec.md` §4.C). Complex (map/style) entries are treated as unresolvable,
//! which is the same "out of scope" boundary `spec.md` draws around the
//! Android resource-config-matching algorithm in general.

use super::ApkParseError;
use std::collections::HashMap;
use std::convert::TryInto;

const RES_TABLE_TYPE: u16 = 0x0002;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_TABLE_PACKAGE_TYPE: u16 = 0x0200;
const RES_TABLE_TYPE_SPEC_TYPE: u16 = 0x0202;
const RES_TABLE_TYPE_TYPE: u16 = 0x0201;

const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;
const TYPE_INT_BOOLEAN: u8 = 0x12;
const TYPE_REFERENCE: u8 = 0x01;

/// One resolvable value, keyed to the configuration (here just density) it
/// was compiled for.
#[derive(Clone, Debug)]
pub struct ConfigEntry {
    pub density: u16,
    pub value: ResolvedValue,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedValue {
    /// A plain string value. Drawable/mipmap entries are compiled this way,
    /// with the string content being the in-APK path to the asset.
    String(String),
    Int(i32),
    Boolean(bool),
    Reference(u32),
    Unsupported,
}

pub struct ResourceTable {
    /// resource id (0xPPTTEEEE) -> all per-config entries found for it.
    entries: HashMap<u32, Vec<ConfigEntry>>,
}

impl ResourceTable {
    /// Follows a chain of `Reference` values up to `max_hops` times,
    /// returning the first non-reference value found. `spec.md` §4.C calls
    /// for a bounded loop with an explicit step counter; exceeding the bound
    /// makes the reference "unresolved".
    pub fn resolve(&self, res_id: u32, max_hops: u32) -> Option<ResolvedValue> {
        let mut current = res_id;
        for _ in 0..max_hops {
            let candidates = self.entries.get(&current)?;
            let value = candidates.first()?.value.clone();
            match value {
                ResolvedValue::Reference(next) => current = next,
                other => return Some(other),
            }
        }
        None
    }

    /// All per-density entries for a resource id, used for icon selection.
    pub fn config_entries(&self, res_id: u32) -> &[ConfigEntry] {
        self.entries
            .get(&res_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

fn read_u16(buf: &[u8], off: usize) -> Result<u16, ApkParseError> {
    buf.get(off..off + 2)
        .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
        .ok_or(ApkParseError::Truncated("u16"))
}

fn read_u32(buf: &[u8], off: usize) -> Result<u32, ApkParseError> {
    buf.get(off..off + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .ok_or(ApkParseError::Truncated("u32"))
}

struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn get(&self, index: i64) -> Option<String> {
        if index < 0 {
            return None;
        }
        self.strings.get(index as usize).cloned()
    }
}

fn parse_string_pool(buf: &[u8], start: usize) -> Result<(StringPool, usize), ApkParseError> {
    let chunk_type = read_u16(buf, start)?;
    if chunk_type != RES_STRING_POOL_TYPE {
        return Err(ApkParseError::Malformed("expected string pool chunk"));
    }
    let header_size = read_u16(buf, start + 2)? as usize;
    let chunk_size = read_u32(buf, start + 4)? as usize;
    let string_count = read_u32(buf, start + 8)? as usize;
    let flags = read_u32(buf, start + 16)?;
    let strings_start = read_u32(buf, start + 20)? as usize;
    let is_utf8 = flags & (1 << 8) != 0;

    let offsets_base = start + header_size;
    let data_base = start + strings_start;
    let mut strings = Vec::with_capacity(string_count);

    for i in 0..string_count {
        let offset = read_u32(buf, offsets_base + i * 4)? as usize;
        let entry = data_base + offset;
        let s = if is_utf8 {
            let (_utf16_len, p1) = read_u8_len(buf, entry)?;
            let (utf8_len, p2) = read_u8_len(buf, p1)?;
            let bytes = buf
                .get(p2..p2 + utf8_len)
                .ok_or(ApkParseError::Truncated("utf8 string"))?;
            String::from_utf8_lossy(bytes).into_owned()
        } else {
            let (utf16_len, p1) = read_u16_len(buf, entry)?;
            let mut units = Vec::with_capacity(utf16_len);
            for j in 0..utf16_len {
                units.push(read_u16(buf, p1 + j * 2)?);
            }
            String::from_utf16_lossy(&units)
        };
        strings.push(s);
    }

    Ok((StringPool { strings }, chunk_size))
}

fn read_u8_len(buf: &[u8], off: usize) -> Result<(usize, usize), ApkParseError> {
    let first = *buf.get(off).ok_or(ApkParseError::Truncated("len byte"))? as usize;
    if first & 0x80 != 0 {
        let second = *buf.get(off + 1).ok_or(ApkParseError::Truncated("len byte"))? as usize;
        Ok((((first & 0x7f) << 8) | second, off + 2))
    } else {
        Ok((first, off + 1))
    }
}

fn read_u16_len(buf: &[u8], off: usize) -> Result<(usize, usize), ApkParseError> {
    let first = read_u16(buf, off)? as usize;
    if first & 0x8000 != 0 {
        let second = read_u16(buf, off + 2)? as usize;
        Ok((((first & 0x7fff) << 16) | second, off + 4))
    } else {
        Ok((first, off + 2))
    }
}

/// Density value found at a fixed offset within `ResTable_config`, once its
/// declared `size` confirms the field is present.
fn config_density(buf: &[u8], config_start: usize) -> Result<u16, ApkParseError> {
    let size = read_u32(buf, config_start)? as usize;
    if size < 16 {
        return Ok(0);
    }
    read_u16(buf, config_start + 14)
}

pub fn parse(buf: &[u8]) -> Result<ResourceTable, ApkParseError> {
    if buf.len() < 12 {
        return Err(ApkParseError::Truncated("resource table header"));
    }
    let root_type = read_u16(buf, 0)?;
    if root_type != RES_TABLE_TYPE {
        return Err(ApkParseError::Malformed("not a resource table"));
    }
    let total_size = read_u32(buf, 4)? as usize;
    let end = total_size.min(buf.len());

    let mut pos = 12; // chunk header (8) + packageCount (4)
    let mut global_pool: Option<StringPool> = None;
    let mut entries: HashMap<u32, Vec<ConfigEntry>> = HashMap::new();

    while pos + 8 <= end {
        let chunk_type = read_u16(buf, pos)?;
        let chunk_size = read_u32(buf, pos + 4)? as usize;
        if chunk_size < 8 || pos + chunk_size > end {
            break;
        }
        match chunk_type {
            RES_STRING_POOL_TYPE => {
                let (pool, _) = parse_string_pool(buf, pos)?;
                global_pool = Some(pool);
            }
            RES_TABLE_PACKAGE_TYPE => {
                let pool = global_pool.as_ref();
                parse_package(buf, pos, chunk_size, pool, &mut entries)?;
            }
            _ => {}
        }
        pos += chunk_size;
    }

    Ok(ResourceTable { entries })
}

fn parse_package(
    buf: &[u8],
    pkg_start: usize,
    pkg_size: usize,
    global_pool: Option<&StringPool>,
    entries: &mut HashMap<u32, Vec<ConfigEntry>>,
) -> Result<(), ApkParseError> {
    let header_size = read_u16(buf, pkg_start + 2)? as usize;
    let package_id = read_u32(buf, pkg_start + 8)?;
    let end = pkg_start + pkg_size;
    let mut pos = pkg_start + header_size;

    // Type-string and key-string pools under a package name types/keys; we
    // resolve entry values against the table's global string pool instead,
    // so we skip over these without keeping them.
    while pos + 8 <= end {
        let chunk_type = read_u16(buf, pos)?;
        let chunk_size = read_u32(buf, pos + 4)? as usize;
        if chunk_size < 8 || pos + chunk_size > end {
            break;
        }
        match chunk_type {
            RES_TABLE_TYPE_TYPE => {
                parse_type_chunk(buf, pos, package_id, global_pool, entries)?;
            }
            _ => {}
        }
        pos += chunk_size;
    }
    Ok(())
}

fn parse_type_chunk(
    buf: &[u8],
    start: usize,
    package_id: u32,
    global_pool: Option<&StringPool>,
    entries: &mut HashMap<u32, Vec<ConfigEntry>>,
) -> Result<(), ApkParseError> {
    let header_size = read_u16(buf, start + 2)? as usize;
    let chunk_size = read_u32(buf, start + 4)? as usize;
    let type_id = *buf.get(start + 8).ok_or(ApkParseError::Truncated("typeId"))? as u32;
    let entry_count = read_u32(buf, start + 12)? as usize;
    let entries_start = read_u32(buf, start + 16)? as usize;
    // ResTable_config begins right after the fixed type header fields, at a
    // position recorded implicitly by header_size.
    let config_start = start + 20;
    let density = config_density(buf, config_start).unwrap_or(0);

    let offsets_base = start + header_size;
    let data_base = start + entries_start;
    let end = start + chunk_size;

    for i in 0..entry_count {
        let offset_pos = offsets_base + i * 4;
        if offset_pos + 4 > end {
            break;
        }
        let offset = read_u32(buf, offset_pos)?;
        if offset == u32::MAX {
            continue; // NO_ENTRY
        }
        let entry_start = data_base + offset as usize;
        if entry_start + 8 > end {
            continue;
        }
        let entry_size = read_u16(buf, entry_start)? as usize;
        let flags = read_u16(buf, entry_start + 2)?;
        const FLAG_COMPLEX: u16 = 0x0001;
        let resource_id = (package_id << 24) | (type_id << 16) | (i as u32);

        if flags & FLAG_COMPLEX != 0 {
            entries.entry(resource_id).or_default().push(ConfigEntry {
                density,
                value: ResolvedValue::Unsupported,
            });
            continue;
        }

        let value_start = entry_start + entry_size;
        if value_start + 8 > end {
            continue;
        }
        let data_type = *buf
            .get(value_start + 3)
            .ok_or(ApkParseError::Truncated("value data type"))?;
        let data = read_u32(buf, value_start + 4)?;
        let value = match data_type {
            TYPE_STRING => global_pool
                .and_then(|pool| pool.get(data as i64))
                .map(ResolvedValue::String)
                .unwrap_or(ResolvedValue::Unsupported),
            TYPE_INT_DEC => ResolvedValue::Int(data as i32),
            TYPE_INT_HEX => ResolvedValue::Int(data as i32),
            TYPE_INT_BOOLEAN => ResolvedValue::Boolean(data != 0),
            TYPE_REFERENCE => ResolvedValue::Reference(data),
            _ => ResolvedValue::Unsupported,
        };

        entries
            .entry(resource_id)
            .or_default()
            .push(ConfigEntry { density, value });
    }

    Ok(())
}
