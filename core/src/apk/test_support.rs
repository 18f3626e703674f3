// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binary-XML manifest builder for tests, generalizing the single hand-coded
//! fixture in [`super::axml`]'s own test module to arbitrary flat element
//! sequences, so callers elsewhere in the crate can build a minimal but
//! complete `AndroidManifest.xml` without a real `aapt` toolchain.

const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_TYPE: u16 = 0x0003;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;

const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_BOOLEAN: u8 = 0x12;

pub enum AttrVal<'a> {
    Str(&'a str),
    Int(i32),
    Bool(bool),
}

pub struct ElementSpec<'a> {
    pub name: &'a str,
    pub attrs: Vec<(&'a str, AttrVal<'a>)>,
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn push_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

struct Interner<'a> {
    strings: Vec<&'a str>,
}

impl<'a> Interner<'a> {
    fn intern(&mut self, s: &'a str) -> u32 {
        if let Some(i) = self.strings.iter().position(|x| *x == s) {
            i as u32
        } else {
            self.strings.push(s);
            (self.strings.len() - 1) as u32
        }
    }
}

/// Builds a flat (non-nested, each element opened then immediately closed)
/// binary XML document. `extract_manifest_fields` doesn't track element
/// nesting, so a flat sequence exercises it identically to a real manifest.
pub fn build_document(elements: &[ElementSpec]) -> Vec<u8> {
    let mut interner = Interner { strings: Vec::new() };
    for el in elements {
        interner.intern(el.name);
        for (name, val) in &el.attrs {
            interner.intern(name);
            if let AttrVal::Str(s) = val {
                interner.intern(s);
            }
        }
    }

    let mut pool_data = Vec::new();
    let mut offsets = Vec::new();
    for s in &interner.strings {
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
    push_u32(&mut pool_chunk, interner.strings.len() as u32);
    push_u32(&mut pool_chunk, 0);
    push_u32(&mut pool_chunk, 0);
    push_u32(&mut pool_chunk, (pool_header_size as usize + offsets_size) as u32);
    push_u32(&mut pool_chunk, 0);
    for o in &offsets {
        push_u32(&mut pool_chunk, *o);
    }
    pool_chunk.extend_from_slice(&pool_data);

    let mut body = Vec::new();
    for el in elements {
        let name_idx = interner.intern(el.name);
        let fixed_fields_size = 20usize;
        let attr_size = 20usize;
        let attrs_total = attr_size * el.attrs.len();

        let mut start_el = Vec::new();
        push_u16(&mut start_el, RES_XML_START_ELEMENT_TYPE);
        push_u16(&mut start_el, 16);
        push_u32(&mut start_el, (16 + fixed_fields_size + attrs_total) as u32);
        push_u32(&mut start_el, 1);
        push_i32(&mut start_el, -1);
        push_i32(&mut start_el, -1);
        push_u32(&mut start_el, name_idx);
        push_u16(&mut start_el, fixed_fields_size as u16);
        push_u16(&mut start_el, attr_size as u16);
        push_u16(&mut start_el, el.attrs.len() as u16);
        push_u16(&mut start_el, 0);
        push_u16(&mut start_el, 0);
        push_u16(&mut start_el, 0);
        for (name, val) in &el.attrs {
            let attr_name_idx = interner.intern(name);
            push_i32(&mut start_el, -1);
            push_u32(&mut start_el, attr_name_idx);
            match val {
                AttrVal::Str(s) => {
                    let value_idx = interner.intern(s);
                    push_u32(&mut start_el, value_idx);
                    push_u16(&mut start_el, 8);
                    start_el.push(0);
                    start_el.push(TYPE_STRING);
                    push_u32(&mut start_el, value_idx);
                }
                AttrVal::Int(i) => {
                    push_u32(&mut start_el, u32::MAX);
                    push_u16(&mut start_el, 8);
                    start_el.push(0);
                    start_el.push(TYPE_INT_DEC);
                    push_u32(&mut start_el, *i as u32);
                }
                AttrVal::Bool(b) => {
                    push_u32(&mut start_el, u32::MAX);
                    push_u16(&mut start_el, 8);
                    start_el.push(0);
                    start_el.push(TYPE_INT_BOOLEAN);
                    push_u32(&mut start_el, *b as u32);
                }
            }
        }
        body.extend_from_slice(&start_el);

        let mut end_el = Vec::new();
        push_u16(&mut end_el, RES_XML_END_ELEMENT_TYPE);
        push_u16(&mut end_el, 16);
        push_u32(&mut end_el, 24);
        push_u32(&mut end_el, 1);
        push_i32(&mut end_el, -1);
        push_i32(&mut end_el, -1);
        push_u32(&mut end_el, name_idx);
        body.extend_from_slice(&end_el);
    }

    let mut doc = Vec::new();
    push_u16(&mut doc, RES_XML_TYPE);
    push_u16(&mut doc, 8);
    let total = 8 + pool_chunk.len() + body.len();
    push_u32(&mut doc, total as u32);
    doc.extend_from_slice(&pool_chunk);
    doc.extend_from_slice(&body);
    doc
}

/// A minimal but complete manifest: `package`/`versionCode` on `<manifest>`,
/// `minSdkVersion` on `<uses-sdk>`, `label`/`versionName` on `<application>`.
/// No icon, no dependency tags, not debuggable.
#[allow(dead_code)]
pub fn minimal_manifest(package: &str, version_code: u64) -> Vec<u8> {
    build_document(&manifest_elements(package, version_code, false))
}

/// Same as [`minimal_manifest`], with `android:debuggable="true"` on
/// `<application>`.
#[allow(dead_code)]
pub fn debuggable_manifest(package: &str, version_code: u64) -> Vec<u8> {
    build_document(&manifest_elements(package, version_code, true))
}

/// Same as [`minimal_manifest`], with a trailing `<uses-static-library>`
/// element declaring a dependency on another package's exact version and
/// signer certificate.
#[allow(dead_code)]
pub fn manifest_with_static_library<'a>(
    package: &'a str,
    version_code: u64,
    lib_name: &'a str,
    lib_version_code: u64,
    lib_cert_digest_hex: &'a str,
) -> Vec<u8> {
    let mut elements = manifest_elements(package, version_code, false);
    elements.push(ElementSpec {
        name: "uses-static-library",
        attrs: vec![
            ("name", AttrVal::Str(lib_name)),
            ("version", AttrVal::Int(lib_version_code as i32)),
            ("certDigest", AttrVal::Str(lib_cert_digest_hex)),
        ],
    });
    build_document(&elements)
}

fn manifest_elements(package: &str, version_code: u64, debuggable: bool) -> Vec<ElementSpec<'_>> {
    let mut application_attrs = vec![
        ("label", AttrVal::Str("Example App")),
        ("versionName", AttrVal::Str("1.0")),
    ];
    if debuggable {
        application_attrs.push(("debuggable", AttrVal::Bool(true)));
    }
    vec![
        ElementSpec {
            name: "manifest",
            attrs: vec![
                ("package", AttrVal::Str(package)),
                ("versionCode", AttrVal::Int(version_code as i32)),
            ],
        },
        ElementSpec {
            name: "uses-sdk",
            attrs: vec![("minSdkVersion", AttrVal::Int(21))],
        },
        ElementSpec {
            name: "application",
            attrs: application_attrs,
        },
    ]
}
