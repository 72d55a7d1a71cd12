//! The versioned patch database: binary format, loader, platform/version
//! lookup, and the id-keyed shortcut operations orchestration code drives.
//!
//! Stream layout, all little-endian:
//! `magic | format_major | format_minor | file_major | file_minor |
//! compression | body`, with the body optionally gzip- or
//! deflate-compressed. The body is `entry_count` followed by entries; see
//! the `read_*` functions for each record.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::{DeflateDecoder, GzDecoder};
use log::debug;

use crate::bytes::{self, Pattern};
use crate::image::{Machine, PeImage, SectionName};
use crate::patch::{
    AddFunctionPatch, DirectPatch, DwordsPatch, PatchKind, StringPatch, SymbolField,
};
use crate::symbols::SymbolSource;
use crate::{Error, Result};

const MAGIC: u16 = 0x7c9a;
const FORMAT_MAJOR: u16 = 0;
const FORMAT_MINOR_MAX: u16 = 3;

const COMPRESSION_NONE: u16 = 0;
const COMPRESSION_GZIP: u16 = 1;
const COMPRESSION_DEFLATE: u16 = 2;

const TAG_DIRECT: u16 = 0x0001;
const TAG_DWORDS: u16 = 0x0002;
const TAG_STRING: u16 = 0x0003;
const TAG_ADD_FUNCTION: u16 = 0x0004;

/// Section names the compact two-byte encoding can refer to by index.
const KNOWN_SECTIONS: [SectionName; 3] =
    [SectionName::BLANK, SectionName::TEXT, SectionName::RDATA];

/// One patch bound to an inclusive file-version range; `max == 0` leaves
/// the range open-ended.
#[derive(Debug, Clone)]
pub struct PatchVersion {
    min: u64,
    max: u64,
    patch: PatchKind,
}

impl PatchVersion {
    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn contains(&self, version: u64) -> bool {
        self.min <= version && (self.max == 0 || self.max >= version)
    }

    pub fn patch(&self) -> &PatchKind {
        &self.patch
    }
}

/// The version ranges one patch entry carries for one machine type.
#[derive(Debug, Clone)]
pub struct PatchPlatform {
    machine: u16,
    versions: Vec<PatchVersion>,
}

impl PatchPlatform {
    /// Raw COFF machine value; ranges for machines this crate does not
    /// model load fine and simply never match.
    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// Every version entry whose range contains `version`. Ranges may
    /// overlap, so this can yield more than one patch.
    pub fn matching(&self, version: u64) -> impl Iterator<Item = &PatchVersion> {
        self.versions.iter().filter(move |v| v.contains(version))
    }
}

/// One logical patch: a numeric id with per-platform variants.
#[derive(Debug, Clone)]
pub struct PatchEntry {
    id: u16,
    platforms: Vec<PatchPlatform>,
}

impl PatchEntry {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn platform(&self, machine: Machine) -> Option<&PatchPlatform> {
        self.platforms
            .iter()
            .find(|p| p.machine == machine.as_u16())
    }
}

/// A parsed patch database, immutable after load.
#[derive(Debug, Clone)]
pub struct PatchDatabase {
    file_version: (u16, u16),
    entries: Vec<PatchEntry>,
}

struct Header {
    file_version: (u16, u16),
    compression: u16,
}

impl Header {
    fn read(r: &mut impl Read) -> Result<Header> {
        if r.read_u16::<LittleEndian>()? != MAGIC {
            return Err(Error::Format("bad magic"));
        }
        let format_major = r.read_u16::<LittleEndian>()?;
        let format_minor = r.read_u16::<LittleEndian>()?;
        if format_major != FORMAT_MAJOR || format_minor > FORMAT_MINOR_MAX {
            return Err(Error::UnsupportedFormat {
                major: format_major,
                minor: format_minor,
            });
        }
        let file_major = r.read_u16::<LittleEndian>()?;
        let file_minor = r.read_u16::<LittleEndian>()?;
        let compression = r.read_u16::<LittleEndian>()?;
        Ok(Header {
            file_version: (file_major, file_minor),
            compression,
        })
    }
}

impl PatchDatabase {
    /// Parses a database stream. The header is validated before any body
    /// byte is read; an unsupported format version is a hard failure with
    /// no partial parse.
    pub fn load<R: Read>(mut r: R) -> Result<PatchDatabase> {
        let header = Header::read(&mut r)?;
        Self::load_body(r, header)
    }

    /// Like [`PatchDatabase::load`], but additionally rejects a database
    /// whose file version is not strictly newer than
    /// `(min_major, min_minor)`, the guard against swapping in a stale
    /// database over one already seen.
    pub fn load_newer_than<R: Read>(
        mut r: R,
        min_major: u16,
        min_minor: u16,
    ) -> Result<PatchDatabase> {
        let header = Header::read(&mut r)?;
        let (major, minor) = header.file_version;
        if major < min_major || (major == min_major && minor <= min_minor) {
            return Err(Error::StaleDatabase {
                major,
                minor,
                min_major,
                min_minor,
            });
        }
        Self::load_body(r, header)
    }

    fn load_body<R: Read>(mut r: R, header: Header) -> Result<PatchDatabase> {
        let entries = match header.compression {
            COMPRESSION_NONE => read_entries(&mut r)?,
            COMPRESSION_GZIP => read_entries(&mut GzDecoder::new(r))?,
            COMPRESSION_DEFLATE => read_entries(&mut DeflateDecoder::new(r))?,
            _ => return Err(Error::Format("unknown compression mode")),
        };
        debug!(
            "loaded patch database {}.{} with {} entries",
            header.file_version.0,
            header.file_version.1,
            entries.len(),
        );
        Ok(PatchDatabase {
            file_version: header.file_version,
            entries,
        })
    }

    /// The database's own `(major, minor)` version tag.
    pub fn version(&self) -> (u16, u16) {
        self.file_version
    }

    /// All entries carrying `id`; several sources may contribute the same
    /// id.
    pub fn get(&self, id: u16) -> impl Iterator<Item = &PatchEntry> {
        self.entries.iter().filter(move |e| e.id == id)
    }

    /// Descriptors registered under `id` that match the machine and whose
    /// version range contains `version`.
    pub fn patches(
        &self,
        id: u16,
        machine: Machine,
        version: u64,
    ) -> impl Iterator<Item = &PatchKind> {
        self.get(id)
            .filter_map(move |e| e.platform(machine))
            .flat_map(move |p| p.matching(version))
            .map(|v| v.patch())
    }

    /// Applies every Direct patch selected for the image's platform and
    /// version.
    pub fn apply_all(&self, image: &mut impl PeImage) -> Result<()> {
        self.apply_all_inner(image, false)
    }

    /// Like [`PatchDatabase::apply_all`], but accepts patches that are
    /// already in place.
    pub fn apply_all_tolerant(&self, image: &mut impl PeImage) -> Result<()> {
        self.apply_all_inner(image, true)
    }

    fn apply_all_inner(&self, image: &mut impl PeImage, tolerate_applied: bool) -> Result<()> {
        let machine = image.machine();
        let version = image.file_version();
        for entry in &self.entries {
            let Some(platform) = entry.platform(machine) else {
                continue;
            };
            for v in platform.matching(version) {
                let PatchKind::Direct(p) = v.patch() else {
                    continue;
                };
                match p.apply(image) {
                    Ok(()) => {}
                    Err(_) if tolerate_applied && p.is_applied(image) => {
                        debug!("patch {} is already applied, moving on", entry.id);
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Applies the Direct and AddFunction patches under `id`. Descriptors
    /// of other kinds are skipped, so callers need not know which variant
    /// backs an id.
    pub fn apply(
        &self,
        image: &mut impl PeImage,
        symbols: &impl SymbolSource,
        id: u16,
    ) -> Result<()> {
        let machine = image.machine();
        let version = image.file_version();
        for patch in self.patches(id, machine, version) {
            match patch {
                PatchKind::Direct(p) => p.apply(image)?,
                PatchKind::AddFunction(p) => p.apply(image, symbols, &[])?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Applies the Dwords and AddFunction patches under `id` with the
    /// given parameter values.
    pub fn apply_values(
        &self,
        image: &mut impl PeImage,
        symbols: &impl SymbolSource,
        id: u16,
        values: &[u32],
    ) -> Result<()> {
        let machine = image.machine();
        let version = image.file_version();
        for patch in self.patches(id, machine, version) {
            match patch {
                PatchKind::Dwords(p) => p.apply(image, values)?,
                PatchKind::AddFunction(p) => p.apply(image, symbols, values)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn apply_value(
        &self,
        image: &mut impl PeImage,
        symbols: &impl SymbolSource,
        id: u16,
        value: u32,
    ) -> Result<()> {
        self.apply_values(image, symbols, id, &[value])
    }

    /// Applies the String patches under `id`.
    pub fn apply_string(&self, image: &mut impl PeImage, id: u16, value: &str) -> Result<()> {
        let machine = image.machine();
        let version = image.file_version();
        for patch in self.patches(id, machine, version) {
            if let PatchKind::String(p) = patch {
                p.apply(image, value)?;
            }
        }
        Ok(())
    }

    /// Reverts the AddFunction patches under `id`.
    pub fn revert(&self, image: &mut impl PeImage, id: u16) -> Result<()> {
        let machine = image.machine();
        let version = image.file_version();
        for patch in self.patches(id, machine, version) {
            if let PatchKind::AddFunction(p) = patch {
                p.revert(image)?;
            }
        }
        Ok(())
    }

    /// Whether every descriptor selected for `id` reads as applied;
    /// vacuously true when none are.
    pub fn is_applied(&self, image: &impl PeImage, id: u16) -> bool {
        self.patches(id, image.machine(), image.file_version())
            .all(|p| p.is_applied(image))
    }

    /// Parameter values from the first Dwords or AddFunction descriptor
    /// under `id`.
    pub fn get_values(&self, image: &impl PeImage, id: u16) -> Option<Vec<u32>> {
        self.patches(id, image.machine(), image.file_version())
            .find_map(|patch| match patch {
                PatchKind::Dwords(p) => Some(p.values(image)),
                PatchKind::AddFunction(p) => Some(p.values(image)),
                _ => None,
            })
            .flatten()
    }

    pub fn get_value(&self, image: &impl PeImage, id: u16) -> Option<u32> {
        self.get_values(image, id)?.first().copied()
    }

    /// Current string of the first String descriptor under `id`.
    pub fn get_string(&self, image: &impl PeImage, id: u16) -> Option<String> {
        self.patches(id, image.machine(), image.file_version())
            .find_map(|patch| match patch {
                PatchKind::String(p) => Some(p.value(image)),
                _ => None,
            })
            .flatten()
    }
}

fn read_entries(r: &mut impl Read) -> Result<Vec<PatchEntry>> {
    let count = r.read_u16::<LittleEndian>()?;
    (0..count).map(|_| read_entry(r)).collect()
}

fn read_entry(r: &mut impl Read) -> Result<PatchEntry> {
    let id = r.read_u16::<LittleEndian>()?;
    let count = r.read_u16::<LittleEndian>()?;
    let platforms = (0..count)
        .map(|_| read_platform(r))
        .collect::<Result<_>>()?;
    Ok(PatchEntry { id, platforms })
}

fn read_platform(r: &mut impl Read) -> Result<PatchPlatform> {
    let machine = r.read_u16::<LittleEndian>()?;
    let count = r.read_u16::<LittleEndian>()?;
    let versions = (0..count)
        .map(|_| read_version(r))
        .collect::<Result<_>>()?;
    Ok(PatchPlatform { machine, versions })
}

fn read_version(r: &mut impl Read) -> Result<PatchVersion> {
    let min = r.read_u64::<LittleEndian>()?;
    let max = r.read_u64::<LittleEndian>()?;
    let patch = match r.read_u16::<LittleEndian>()? {
        TAG_DIRECT => PatchKind::Direct(read_direct(r)?),
        TAG_DWORDS => PatchKind::Dwords(read_dwords(r)?),
        TAG_STRING => PatchKind::String(read_string(r)?),
        TAG_ADD_FUNCTION => PatchKind::AddFunction(read_add_function(r)?),
        _ => return Err(Error::Format("unknown patch type tag")),
    };
    Ok(PatchVersion { min, max, patch })
}

fn read_section_name(r: &mut impl Read) -> Result<SectionName> {
    let mut name = [0u8; 8];
    r.read_exact(&mut name[..2])?;
    if name[0] == 0 && name[1] != 0 {
        return KNOWN_SECTIONS
            .get(name[1] as usize)
            .copied()
            .ok_or(Error::Format("bad known-section index"));
    }
    r.read_exact(&mut name[2..])?;
    Ok(SectionName(name))
}

fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>> {
    let len = r.read_u16::<LittleEndian>()? as usize;
    let mut bytes = vec![0; len];
    r.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_u16s(r: &mut impl Read) -> Result<Vec<u16>> {
    let count = r.read_u16::<LittleEndian>()?;
    (0..count)
        .map(|_| Ok(r.read_u16::<LittleEndian>()?))
        .collect()
}

fn check_fields(fields: &[u16], len: usize) -> Result<()> {
    if fields.iter().any(|&f| f as usize + 4 > len) {
        return Err(Error::Format("field offset outside pattern"));
    }
    Ok(())
}

fn read_direct(r: &mut impl Read) -> Result<DirectPatch> {
    let section = read_section_name(r)?;
    let wildcard = r.read_u8()?;
    let target = read_bytes(r)?;
    let replacement = read_bytes(r)?;
    if target.len() != replacement.len() {
        return Err(Error::Format("direct patch length mismatch"));
    }
    Ok(DirectPatch {
        section,
        target: Pattern::from_raw(target, wildcard),
        replacement,
    })
}

fn read_dwords(r: &mut impl Read) -> Result<DwordsPatch> {
    let section = read_section_name(r)?;
    let fields = read_u16s(r)?;
    let wildcard = r.read_u8()?;
    let target = read_bytes(r)?;
    check_fields(&fields, target.len())?;
    Ok(DwordsPatch {
        section,
        fields,
        target: Pattern::from_raw(target, wildcard),
    })
}

fn read_string(r: &mut impl Read) -> Result<StringPatch> {
    let section = read_section_name(r)?;
    let addr_pos = r.read_u16::<LittleEndian>()?;
    let wildcard = r.read_u8()?;
    let target = read_bytes(r)?;
    check_fields(&[addr_pos], target.len())?;
    Ok(StringPatch {
        section,
        addr_pos,
        target: Pattern::from_raw(target, wildcard),
    })
}

fn read_add_function(r: &mut impl Read) -> Result<AddFunctionPatch> {
    let section = read_section_name(r)?;
    let wildcard = r.read_u8()?;
    let target = read_bytes(r)?;
    let call = read_bytes(r)?;
    let call_pos = r.read_u16::<LittleEndian>()?;
    let func = read_bytes(r)?;
    let value_pos = read_u16s(r)?;
    let sym_pos = read_u16s(r)?;
    check_fields(&[call_pos], call.len())?;
    check_fields(&value_pos, func.len())?;
    check_fields(&sym_pos, func.len())?;

    // a zero dword in a symbol field means the name follows in the stream
    let mut sym_fields = Vec::with_capacity(sym_pos.len());
    for &pos in &sym_pos {
        if bytes::get_dword(&func, pos) == 0 {
            let raw = read_bytes(r)?;
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            let name = std::str::from_utf8(&raw[..end])
                .map_err(|_| Error::Format("symbol name is not valid text"))?
                .to_owned();
            sym_fields.push(SymbolField::Named { pos, name });
        } else {
            sym_fields.push(SymbolField::Fixed { pos });
        }
    }

    let all_fields: Vec<u16> = value_pos.iter().chain(&sym_pos).copied().collect();
    let masked_call = Pattern::masked(&call, &[call_pos])?;
    let masked_func = Pattern::masked(&func, &all_fields)?;

    Ok(AddFunctionPatch {
        section,
        target: Pattern::from_raw(target, wildcard),
        call,
        call_pos,
        func,
        value_pos,
        sym_fields,
        masked_call,
        masked_func,
    })
}
