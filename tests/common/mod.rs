//! Shared fixtures: an in-memory stand-in for the PE image seam, a
//! table-backed symbol source, and a builder producing patch database
//! bytes the way the patch compiler lays them out.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::ops::Range;

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;

use bootpatch::{Machine, PeImage, Section, SectionName, SymbolSource};

pub const MAGIC: u16 = 0x7c9a;
pub const COMPRESSION_NONE: u16 = 0;
pub const COMPRESSION_GZIP: u16 = 1;
pub const COMPRESSION_DEFLATE: u16 = 2;

pub const TAG_DIRECT: u16 = 0x0001;
pub const TAG_DWORDS: u16 = 0x0002;
pub const TAG_STRING: u16 = 0x0003;
pub const TAG_ADD_FUNCTION: u16 = 0x0004;

pub const MACHINE_X86: u16 = 0x014c;
pub const MACHINE_X64: u16 = 0x8664;

/// Section alignment the fake layout hands out virtual addresses on.
const PAGE: u32 = 0x1000;

struct FakeSection {
    name: SectionName,
    virtual_address: u32,
    virtual_size: u32,
    raw_offset: u32,
    raw_size: u32,
}

/// An in-memory "executable": a flat buffer plus a section table, a slack
/// region, and a relocation list.
pub struct FakeImage {
    pub machine: Machine,
    pub version: u64,
    pub image_base: u64,
    pub data: Vec<u8>,
    sections: Vec<FakeSection>,
    next_va: u32,
    pub slack: Option<Vec<u8>>,
    pub relocs: Vec<u32>,
}

impl FakeImage {
    pub fn new(machine: Machine, version: u64) -> FakeImage {
        FakeImage {
            machine,
            version,
            image_base: 0x40_0000,
            data: Vec::new(),
            sections: Vec::new(),
            next_va: PAGE,
            slack: Some(vec![0; 0x100]),
            relocs: Vec::new(),
        }
    }

    /// Adds a section whose raw data is `content` zero-padded to
    /// `raw_size`; the live (virtual) size is `content.len()`.
    pub fn add_section(&mut self, name: &str, content: &[u8], raw_size: u32) -> usize {
        assert!(content.len() as u32 <= raw_size);
        let raw_offset = self.data.len() as u32;
        self.data.extend_from_slice(content);
        self.data
            .resize(raw_offset as usize + raw_size as usize, 0);
        let virtual_address = self.next_va;
        self.next_va = (virtual_address + raw_size).next_multiple_of(PAGE);
        self.sections.push(FakeSection {
            name: SectionName::new(name),
            virtual_address,
            virtual_size: content.len() as u32,
            raw_offset,
            raw_size,
        });
        self.sections.len() - 1
    }

    pub fn section_named(&self, name: &str) -> Section {
        self.section_by_name(&SectionName::new(name)).unwrap()
    }

    fn section_view(&self, index: usize) -> Section {
        let s = &self.sections[index];
        Section {
            index,
            virtual_address: s.virtual_address,
            virtual_size: s.virtual_size,
            raw_offset: s.raw_offset,
            raw_size: s.raw_size,
        }
    }
}

impl PeImage for FakeImage {
    fn machine(&self) -> Machine {
        self.machine
    }

    fn file_version(&self) -> u64 {
        self.version
    }

    fn image_base(&self) -> u64 {
        self.image_base
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> bool {
        let Some(dst) = self
            .data
            .get_mut(offset as usize..offset as usize + bytes.len())
        else {
            return false;
        };
        dst.copy_from_slice(bytes);
        true
    }

    fn zero(&mut self, offset: u32, len: u32) -> bool {
        let Some(dst) = self
            .data
            .get_mut(offset as usize..(offset + len) as usize)
        else {
            return false;
        };
        dst.fill(0);
        true
    }

    fn section_by_name(&self, name: &SectionName) -> Option<Section> {
        let index = self.sections.iter().position(|s| s.name == *name)?;
        Some(self.section_view(index))
    }

    fn section_by_rva(&self, rva: u32) -> Option<Section> {
        let index = self.sections.iter().position(|s| {
            rva >= s.virtual_address && rva < s.virtual_address + s.raw_size
        })?;
        Some(self.section_view(index))
    }

    fn section(&self, index: usize) -> Option<Section> {
        (index < self.sections.len()).then(|| self.section_view(index))
    }

    /// Succeeds when the spare raw bytes past the live data already cover
    /// `extra`; the fake never moves file contents around.
    fn expand_section(&mut self, index: usize, extra: u32) -> Option<Section> {
        let s = self.sections.get(index)?;
        (s.raw_size - s.virtual_size >= extra).then(|| self.section_view(index))
    }

    fn create_section(&mut self, name: &SectionName, size: u32) -> Option<Section> {
        let raw_offset = self.data.len() as u32;
        let raw_size = size.next_multiple_of(16);
        self.data.resize((raw_offset + raw_size) as usize, 0);
        let virtual_address = self.next_va;
        self.next_va = (virtual_address + raw_size).next_multiple_of(PAGE);
        self.sections.push(FakeSection {
            name: *name,
            virtual_address,
            virtual_size: 0,
            raw_offset,
            raw_size,
        });
        Some(self.section_view(self.sections.len() - 1))
    }

    fn set_virtual_size(&mut self, index: usize, size: u32) -> bool {
        match self.sections.get_mut(index) {
            Some(s) => {
                s.virtual_size = size;
                true
            }
            None => false,
        }
    }

    fn remove_relocations(&mut self, range: Range<u32>) -> bool {
        self.relocs.retain(|rva| !range.contains(rva));
        true
    }

    fn slack(&self) -> Option<&[u8]> {
        self.slack.as_deref()
    }

    fn slack_mut(&mut self) -> Option<&mut [u8]> {
        self.slack.as_deref_mut()
    }
}

#[derive(Default)]
pub struct FakeSymbols {
    pub map: HashMap<String, u32>,
    pub section_relative: bool,
}

impl FakeSymbols {
    pub fn with(entries: &[(&str, u32)]) -> FakeSymbols {
        FakeSymbols {
            map: entries
                .iter()
                .map(|&(name, rva)| (name.to_owned(), rva))
                .collect(),
            section_relative: false,
        }
    }
}

impl SymbolSource for FakeSymbols {
    fn resolve(&self, name: &str) -> Option<u32> {
        self.map.get(name).copied()
    }

    fn section_relative(&self) -> bool {
        self.section_relative
    }
}

pub fn no_symbols() -> FakeSymbols {
    FakeSymbols::default()
}

// ---- database byte builder -------------------------------------------

fn push_section_name(out: &mut Vec<u8>, name: &str) {
    let mut bytes = [0u8; 8];
    for (dst, src) in bytes.iter_mut().zip(name.bytes()) {
        *dst = src;
    }
    out.extend_from_slice(&bytes);
}

fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.write_u16::<LittleEndian>(bytes.len() as u16).unwrap();
    out.extend_from_slice(bytes);
}

fn push_u16s(out: &mut Vec<u8>, values: &[u16]) {
    out.write_u16::<LittleEndian>(values.len() as u16).unwrap();
    for &v in values {
        out.write_u16::<LittleEndian>(v).unwrap();
    }
}

pub fn direct_patch(section: &str, wildcard: u8, target: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    push_section_name(&mut out, section);
    out.push(wildcard);
    push_bytes(&mut out, target);
    push_bytes(&mut out, replacement);
    out
}

pub fn dwords_patch(section: &str, fields: &[u16], wildcard: u8, target: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    push_section_name(&mut out, section);
    push_u16s(&mut out, fields);
    out.push(wildcard);
    push_bytes(&mut out, target);
    out
}

pub fn string_patch(section: &str, addr_pos: u16, wildcard: u8, target: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    push_section_name(&mut out, section);
    out.write_u16::<LittleEndian>(addr_pos).unwrap();
    out.push(wildcard);
    push_bytes(&mut out, target);
    out
}

#[allow(clippy::too_many_arguments)]
pub fn add_function_patch(
    section: &str,
    wildcard: u8,
    target: &[u8],
    call: &[u8],
    call_pos: u16,
    func: &[u8],
    value_pos: &[u16],
    sym_pos: &[u16],
    sym_names: &[&str],
) -> Vec<u8> {
    let mut out = Vec::new();
    push_section_name(&mut out, section);
    out.push(wildcard);
    push_bytes(&mut out, target);
    push_bytes(&mut out, call);
    out.write_u16::<LittleEndian>(call_pos).unwrap();
    push_bytes(&mut out, func);
    push_u16s(&mut out, value_pos);
    push_u16s(&mut out, sym_pos);
    for name in sym_names {
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        push_bytes(&mut out, &bytes);
    }
    out
}

pub fn version_entry(min: u64, max: u64, tag: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u64::<LittleEndian>(min).unwrap();
    out.write_u64::<LittleEndian>(max).unwrap();
    out.write_u16::<LittleEndian>(tag).unwrap();
    out.extend_from_slice(payload);
    out
}

pub fn platform(machine: u16, versions: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u16::<LittleEndian>(machine).unwrap();
    out.write_u16::<LittleEndian>(versions.len() as u16).unwrap();
    for v in versions {
        out.extend_from_slice(v);
    }
    out
}

pub fn entry(id: u16, platforms: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u16::<LittleEndian>(id).unwrap();
    out.write_u16::<LittleEndian>(platforms.len() as u16).unwrap();
    for p in platforms {
        out.extend_from_slice(p);
    }
    out
}

/// Assembles a whole database stream with the given header fields.
pub fn database_raw(
    format: (u16, u16),
    file_version: (u16, u16),
    compression: u16,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u16::<LittleEndian>(MAGIC).unwrap();
    out.write_u16::<LittleEndian>(format.0).unwrap();
    out.write_u16::<LittleEndian>(format.1).unwrap();
    out.write_u16::<LittleEndian>(file_version.0).unwrap();
    out.write_u16::<LittleEndian>(file_version.1).unwrap();
    out.write_u16::<LittleEndian>(compression).unwrap();
    let compressed = match compression {
        COMPRESSION_GZIP => {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(body).unwrap();
            enc.finish().unwrap()
        }
        COMPRESSION_DEFLATE => {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
            enc.write_all(body).unwrap();
            enc.finish().unwrap()
        }
        _ => body.to_vec(),
    };
    out.extend_from_slice(&compressed);
    out
}

pub fn body(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u16::<LittleEndian>(entries.len() as u16).unwrap();
    for e in entries {
        out.extend_from_slice(e);
    }
    out
}

/// A plain uncompressed database holding `entries`.
pub fn database(file_version: (u16, u16), entries: &[Vec<u8>]) -> Vec<u8> {
    database_raw((0, 3), file_version, COMPRESSION_NONE, &body(entries))
}
