// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A compact reader for Android's binary XML format (`AndroidManifest.xml`
//! as compiled by `aapt`/`aapt2`), sufficient for the manifest fields this
//! crate needs. This and [`super::arsc`] stand in for the "APK binary-XML
//! parser" `spec.md` §1 calls out as an opaque external collaborator: real,
//! but not an attempt at full AOSP `ResourceTypes.h` fidelity.

use super::ApkParseError;
use std::convert::TryInto;

const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_TYPE: u16 = 0x0003;
const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
const RES_XML_CDATA_TYPE: u16 = 0x0104;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;

const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;
const TYPE_INT_BOOLEAN: u8 = 0x12;
const TYPE_REFERENCE: u8 = 0x01;

/// A manifest attribute's decoded value.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    String(String),
    IntDec(i32),
    IntHex(i32),
    Boolean(bool),
    Reference(u32),
    Other { data_type: u8, data: u32 },
}

impl AttrValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Boolean(b) => Some(*b),
            AttrValue::IntDec(i) | AttrValue::IntHex(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::IntDec(i) | AttrValue::IntHex(i) => Some(*i as i64),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Attribute {
    pub namespace: Option<String>,
    pub name: String,
    pub raw_value: Option<String>,
    pub value: AttrValue,
}

#[derive(Clone, Debug)]
pub enum Event {
    StartElement {
        name: String,
        attributes: Vec<Attribute>,
    },
    EndElement {
        name: String,
    },
}

/// A parsed binary XML document: a flat event list plus the resource ids
/// referenced by the document's resource map (used to resolve `@id/foo`
/// references without needing the full package string).
pub struct AxmlDocument {
    pub events: Vec<Event>,
}

struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn get(&self, index: i32) -> Option<String> {
        if index < 0 {
            return None;
        }
        self.strings.get(index as usize).cloned()
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

fn read_i32(buf: &[u8], off: usize) -> Result<i32, ApkParseError> {
    Ok(read_u32(buf, off)? as i32)
}

/// Parses a `RES_STRING_POOL_TYPE` chunk starting at `start` (the chunk's
/// own type field). Returns the strings and the chunk's total size.
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
    let mut strings = Vec::with_capacity(string_count);
    let data_base = start + strings_start;

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

/// Reads the variable-length (1 or 2 byte) length prefix used by UTF-8
/// encoded pool entries.
fn read_u8_len(buf: &[u8], off: usize) -> Result<(usize, usize), ApkParseError> {
    let first = *buf.get(off).ok_or(ApkParseError::Truncated("len byte"))? as usize;
    if first & 0x80 != 0 {
        let second = *buf.get(off + 1).ok_or(ApkParseError::Truncated("len byte"))? as usize;
        Ok((((first & 0x7f) << 8) | second, off + 2))
    } else {
        Ok((first, off + 1))
    }
}

/// Reads the variable-length (1 or 2 unit) length prefix used by UTF-16
/// encoded pool entries.
fn read_u16_len(buf: &[u8], off: usize) -> Result<(usize, usize), ApkParseError> {
    let first = read_u16(buf, off)? as usize;
    if first & 0x8000 != 0 {
        let second = read_u16(buf, off + 2)? as usize;
        Ok((((first & 0x7fff) << 16) | second, off + 4))
    } else {
        Ok((first, off + 2))
    }
}

pub fn parse(buf: &[u8]) -> Result<AxmlDocument, ApkParseError> {
    if buf.len() < 8 {
        return Err(ApkParseError::Truncated("xml header"));
    }
    let root_type = read_u16(buf, 0)?;
    if root_type != RES_XML_TYPE {
        return Err(ApkParseError::Malformed("not a binary XML document"));
    }
    let total_size = read_u32(buf, 4)? as usize;
    let end = total_size.min(buf.len());

    let mut pos = 8;
    let mut pool: Option<StringPool> = None;
    let mut events = Vec::new();

    while pos + 8 <= end {
        let chunk_type = read_u16(buf, pos)?;
        let chunk_size = read_u32(buf, pos + 4)? as usize;
        if chunk_size < 8 || pos + chunk_size > end {
            return Err(ApkParseError::Malformed("chunk size out of bounds"));
        }

        match chunk_type {
            RES_STRING_POOL_TYPE => {
                let (p, size) = parse_string_pool(buf, pos)?;
                pool = Some(p);
                debug_assert_eq!(size, chunk_size);
            }
            RES_XML_RESOURCE_MAP_TYPE => {
                // Resource id table; we resolve attributes by name, so we
                // don't need this map for the fields we care about.
            }
            RES_XML_START_NAMESPACE_TYPE | RES_XML_END_NAMESPACE_TYPE | RES_XML_CDATA_TYPE => {}
            RES_XML_START_ELEMENT_TYPE => {
                let pool = pool.as_ref().ok_or(ApkParseError::Malformed(
                    "start element before string pool",
                ))?;
                events.push(parse_start_element(buf, pos, pool)?);
            }
            RES_XML_END_ELEMENT_TYPE => {
                let pool = pool
                    .as_ref()
                    .ok_or(ApkParseError::Malformed("end element before string pool"))?;
                let name_idx = read_i32(buf, pos + 8 + 8)?;
                events.push(Event::EndElement {
                    name: pool.get(name_idx).unwrap_or_default(),
                });
            }
            _ => {}
        }

        pos += chunk_size;
    }

    Ok(AxmlDocument { events })
}

fn parse_start_element(
    buf: &[u8],
    chunk_start: usize,
    pool: &StringPool,
) -> Result<Event, ApkParseError> {
    // ResXMLTree_node header: chunk header (8) + lineNumber (4) + comment (4).
    let node_body = chunk_start + 8 + 8;
    let ns_idx = read_i32(buf, node_body)?;
    let name_idx = read_i32(buf, node_body + 4)?;
    let attr_start = read_u16(buf, node_body + 8)? as usize;
    let attr_size = read_u16(buf, node_body + 10)? as usize;
    let attr_count = read_u16(buf, node_body + 12)? as usize;

    let _ = ns_idx;
    let name = pool.get(name_idx).unwrap_or_default();

    let attrs_base = node_body + attr_start;
    let mut attributes = Vec::with_capacity(attr_count);
    for i in 0..attr_count {
        let base = attrs_base + i * attr_size;
        let attr_ns = read_i32(buf, base)?;
        let attr_name = read_i32(buf, base + 4)?;
        let attr_raw_value = read_i32(buf, base + 8)?;
        // Res_value: size(u16), res0(u8), dataType(u8), data(u32) starting
        // at base + 12 + 2 + 1.
        let data_type = *buf
            .get(base + 15)
            .ok_or(ApkParseError::Truncated("attr data type"))?;
        let data = read_u32(buf, base + 16)?;

        let value = match data_type {
            TYPE_STRING => AttrValue::String(pool.get(data as i32).unwrap_or_default()),
            TYPE_INT_DEC => AttrValue::IntDec(data as i32),
            TYPE_INT_HEX => AttrValue::IntHex(data as i32),
            TYPE_INT_BOOLEAN => AttrValue::Boolean(data != 0),
            TYPE_REFERENCE => AttrValue::Reference(data),
            other => AttrValue::Other {
                data_type: other,
                data,
            },
        };

        attributes.push(Attribute {
            namespace: pool.get(attr_ns),
            name: pool.get(attr_name).unwrap_or_default(),
            raw_value: pool.get(attr_raw_value),
            value,
        });
    }

    Ok(Event::StartElement { name, attributes })
}

#[cfg(test)]
mod test {
    use super::*;

    fn push_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Hand-assembles a minimal binary XML document containing a single
    /// `<manifest package="com.example.app">` element, to exercise the
    /// string pool and element parsers without a real `aapt` toolchain.
    fn build_minimal_document() -> Vec<u8> {
        let strings = ["manifest", "package", "com.example.app"];
        let mut pool_data = Vec::new();
        let mut offsets = Vec::new();
        for s in &strings {
            offsets.push(pool_data.len() as u32);
            let units: Vec<u16> = s.encode_utf16().collect();
            push_u16(&mut pool_data, units.len() as u16);
            for u in units {
                push_u16(&mut pool_data, u);
            }
            push_u16(&mut pool_data, 0);
        }
        while pool_data.len() % 4 != 0 {
            pool_data.push(0);
        }

        let pool_header_size = 28u16;
        let offsets_size = offsets.len() * 4;
        let pool_chunk_size = pool_header_size as usize + offsets_size + pool_data.len();

        let mut pool_chunk = Vec::new();
        push_u16(&mut pool_chunk, RES_STRING_POOL_TYPE);
        push_u16(&mut pool_chunk, pool_header_size);
        push_u32(&mut pool_chunk, pool_chunk_size as u32);
        push_u32(&mut pool_chunk, strings.len() as u32); // stringCount
        push_u32(&mut pool_chunk, 0); // styleCount
        push_u32(&mut pool_chunk, 0); // flags: UTF-16
        push_u32(&mut pool_chunk, (pool_header_size as usize + offsets_size) as u32); // stringsStart, relative to chunk start
        push_u32(&mut pool_chunk, 0); // stylesStart
        for o in &offsets {
            push_u32(&mut pool_chunk, *o);
        }
        pool_chunk.extend_from_slice(&pool_data);

        // start element: <manifest package="com.example.app">
        let mut start_el = Vec::new();
        push_u16(&mut start_el, RES_XML_START_ELEMENT_TYPE);
        push_u16(&mut start_el, 16); // header size (chunk hdr 8 + line 4 + comment 4)
        let attr_size = 20usize;
        let fixed_fields_size = 20usize; // ns,name,attrStart,attrSize,attrCount,idIdx,classIdx,styleIdx
        let body_size = fixed_fields_size + attr_size; // + 1 attribute
        push_u32(&mut start_el, (16 + body_size) as u32);
        push_u32(&mut start_el, 1); // line number
        push_i32_helper(&mut start_el, -1); // comment
        push_i32_helper(&mut start_el, -1); // namespace
        push_u32(&mut start_el, 0); // name -> "manifest"
        push_u16(&mut start_el, fixed_fields_size as u16); // attrStart (relative to node body start)
        push_u16(&mut start_el, attr_size as u16);
        push_u16(&mut start_el, 1); // attrCount
        push_u16(&mut start_el, 0); // idIndex
        push_u16(&mut start_el, 0); // classIndex
        push_u16(&mut start_el, 0); // styleIndex
        // attribute: ns(-1), name(1="package"), rawValue(2="com.example.app"), value{size,res0,type,data}
        push_i32_helper(&mut start_el, -1);
        push_u32(&mut start_el, 1);
        push_u32(&mut start_el, 2);
        push_u16(&mut start_el, 8); // size
        start_el.push(0); // res0
        start_el.push(TYPE_STRING);
        push_u32(&mut start_el, 2); // data -> string index 2

        let mut end_el = Vec::new();
        push_u16(&mut end_el, RES_XML_END_ELEMENT_TYPE);
        push_u16(&mut end_el, 16);
        push_u32(&mut end_el, 24);
        push_u32(&mut end_el, 1);
        push_i32_helper(&mut end_el, -1);
        push_i32_helper(&mut end_el, -1);
        push_u32(&mut end_el, 0);

        let mut doc = Vec::new();
        push_u16(&mut doc, RES_XML_TYPE);
        push_u16(&mut doc, 8);
        let total = 8 + pool_chunk.len() + start_el.len() + end_el.len();
        push_u32(&mut doc, total as u32);
        doc.extend_from_slice(&pool_chunk);
        doc.extend_from_slice(&start_el);
        doc.extend_from_slice(&end_el);
        doc
    }

    fn push_i32_helper(buf: &mut Vec<u8>, v: i32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    #[test]
    fn parses_minimal_manifest() {
        let doc = build_minimal_document();
        let parsed = parse(&doc).unwrap();
        assert_eq!(parsed.events.len(), 2);
        match &parsed.events[0] {
            Event::StartElement { name, attributes } => {
                assert_eq!(name, "manifest");
                assert_eq!(attributes.len(), 1);
                assert_eq!(attributes[0].name, "package");
                assert_eq!(
                    attributes[0].value,
                    AttrValue::String("com.example.app".to_string())
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &parsed.events[1] {
            Event::EndElement { name } => assert_eq!(name, "manifest"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
