//! The four patch strategies and their transforms over a target image.
//!
//! Descriptors are immutable templates; every apply/revert/query call
//! recomputes what it needs from the live buffer, so one descriptor can be
//! used against any number of files in any order.

use log::{debug, warn};
use smallvec::SmallVec;

use crate::bytes::{self, Pattern};
use crate::helpers::align;
use crate::image::{PeImage, Section, SectionName};
use crate::persist;
use crate::symbols::SymbolSource;
use crate::{Error, Result};

/// Injected function bodies start on a dword boundary when space allows.
const FUNC_ALIGNMENT: u32 = 4;
/// Length of `call rel32`; the displacement is measured from the end of
/// the instruction.
const CALL_LEN: u32 = 5;

/// One patch strategy, parsed from the database and reused read-only
/// across target files.
#[derive(Debug, Clone)]
pub enum PatchKind {
    Direct(DirectPatch),
    Dwords(DwordsPatch),
    String(StringPatch),
    AddFunction(AddFunctionPatch),
}

impl PatchKind {
    /// Whether the patch reads as installed in `image`.
    pub fn is_applied(&self, image: &impl PeImage) -> bool {
        match self {
            PatchKind::Direct(p) => p.is_applied(image),
            PatchKind::Dwords(p) => p.values(image).is_some(),
            PatchKind::String(p) => p.value(image).is_some(),
            PatchKind::AddFunction(p) => p.values(image).is_some(),
        }
    }
}

struct Match {
    sect: Section,
    /// Offset of the match inside the section's raw data.
    pos: usize,
}

fn section_bytes<'a>(image: &'a impl PeImage, sect: &Section) -> &'a [u8] {
    let start = sect.raw_offset as usize;
    image
        .data()
        .get(start..start + sect.raw_size as usize)
        .unwrap_or(&[])
}

fn locate(image: &impl PeImage, section: &SectionName, pattern: &Pattern) -> Result<Match> {
    let sect = image
        .section_by_name(section)
        .ok_or(Error::SectionNotFound(*section))?;
    let pos = pattern
        .find_in(section_bytes(image, &sect))
        .ok_or(Error::PatternNotFound(*section))?;
    Ok(Match { sect, pos })
}

/// Writes `bytes` over code at `pos` within the section and strips any
/// relocation entries under the written range.
fn write_code(image: &mut impl PeImage, sect: &Section, pos: usize, code: &[u8]) -> Result<()> {
    let offset = sect.raw_offset + pos as u32;
    let va = sect.virtual_address + pos as u32;
    if !image.write(offset, code) {
        return Err(Error::WriteFailed(offset));
    }
    if !image.remove_relocations(va..va + code.len() as u32) {
        return Err(Error::WriteFailed(offset));
    }
    Ok(())
}

/// Find-capture-write shared by the fixed-length variants: locates
/// `target`, copies the live byte into `replacement` at every wildcard
/// position not marked as caller data, and writes the result over the
/// match.
fn patch_section_bytes(
    image: &mut impl PeImage,
    section: &SectionName,
    target: &Pattern,
    replacement: &[u8],
    caller_data: Option<&[bool]>,
) -> Result<()> {
    let m = locate(image, section, target)?;
    let mut out = replacement.to_vec();
    {
        let data = section_bytes(image, &m.sect);
        for i in target.wildcard_positions() {
            if caller_data.is_some_and(|mask| mask[i]) {
                continue;
            }
            out[i] = data[m.pos + i];
        }
    }
    debug!(
        "patching {} bytes in {} at file offset {:#x}",
        out.len(),
        section,
        m.sect.raw_offset as usize + m.pos,
    );
    write_code(image, &m.sect, m.pos, &out)
}

/// Fixed-length find-and-replace.
///
/// Wildcard positions in the target are preserved: the live byte is copied
/// into the replacement before writing, so values the patch author could
/// not know in advance survive.
#[derive(Debug, Clone)]
pub struct DirectPatch {
    pub(crate) section: SectionName,
    pub(crate) target: Pattern,
    pub(crate) replacement: Vec<u8>,
}

impl DirectPatch {
    pub fn apply(&self, image: &mut impl PeImage) -> Result<()> {
        patch_section_bytes(image, &self.section, &self.target, &self.replacement, None)
    }

    /// Whether the replacement bytes are present. The target's wildcard
    /// positions hold build-specific bytes, so they match anything here
    /// too.
    pub fn is_applied(&self, image: &impl PeImage) -> bool {
        let probe = match self.target.wildcard() {
            Some(w) => {
                let mut probe = self.replacement.clone();
                for i in self.target.wildcard_positions() {
                    probe[i] = w;
                }
                Pattern::new(probe, Some(w))
            }
            None => Pattern::new(self.replacement.clone(), None),
        };
        let Some(sect) = image.section_by_name(&self.section) else {
            return false;
        };
        probe.find_in(section_bytes(image, &sect)).is_some()
    }
}

/// Find-and-replace that stores caller-supplied 32-bit values at fixed
/// offsets inside the matched bytes.
#[derive(Debug, Clone)]
pub struct DwordsPatch {
    pub(crate) section: SectionName,
    pub(crate) fields: Vec<u16>,
    pub(crate) target: Pattern,
}

impl DwordsPatch {
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn apply(&self, image: &mut impl PeImage, values: &[u32]) -> Result<()> {
        if values.len() != self.fields.len() {
            return Err(Error::ValueCountMismatch {
                expected: self.fields.len(),
                got: values.len(),
            });
        }
        let mut replacement = self.target.bytes().to_vec();
        let mut caller_data = vec![false; replacement.len()];
        for (&field, &value) in self.fields.iter().zip(values) {
            bytes::set_dword(&mut replacement, field, value);
            caller_data[field as usize..field as usize + 4].fill(true);
        }
        patch_section_bytes(
            image,
            &self.section,
            &self.target,
            &replacement,
            Some(&caller_data),
        )
    }

    /// Reads the field values back out of the matched bytes; `None` when
    /// the pattern is absent.
    pub fn values(&self, image: &impl PeImage) -> Option<Vec<u32>> {
        let sect = image.section_by_name(&self.section)?;
        let data = section_bytes(image, &sect);
        let pos = self.target.find_in(data)?;
        let found = &data[pos..];
        Some(
            self.fields
                .iter()
                .map(|&f| bytes::get_dword(found, f))
                .collect(),
        )
    }
}

/// Rewrites a length-bounded UTF-16 string referenced from a code
/// fragment through an absolute (32-bit) or instruction-relative (64-bit)
/// address field.
#[derive(Debug, Clone)]
pub struct StringPatch {
    pub(crate) section: SectionName,
    /// Offset of the 4-byte address field inside the target pattern.
    pub(crate) addr_pos: u16,
    pub(crate) target: Pattern,
}

struct StringSite {
    code: Section,
    /// Match offset inside the code section.
    pos: usize,
    /// The matched bytes with their live values.
    found: Vec<u8>,
    data: Section,
    /// File offset of the current string.
    str_offset: u32,
    value: String,
}

impl StringPatch {
    fn find_site(&self, image: &impl PeImage) -> Option<StringSite> {
        let code = image.section_by_name(&self.section)?;
        let code_bytes = section_bytes(image, &code);
        let pos = self.target.find_in(code_bytes)?;
        let found = code_bytes[pos..pos + self.target.len()].to_vec();
        let field = bytes::get_dword(&found, self.addr_pos);
        let rva = if image.is_64bit() {
            // rip-relative, measured from the end of the 4-byte field
            field.wrapping_add(code.virtual_address + pos as u32 + u32::from(self.addr_pos) + 4)
        } else {
            field.wrapping_sub(image.image_base() as u32)
        };
        let data = image.section_by_rva(rva)?;
        let sect_offset = rva.wrapping_sub(data.virtual_address);
        let str_offset = data.raw_offset + sect_offset;
        let value = bytes::read_utf16(image.data(), str_offset as usize)?;
        // the string and its terminator must lie inside the section
        let used = (bytes::utf16_len(&value) as u32 + 1) * 2;
        if used > data.raw_size.saturating_sub(sect_offset) {
            return None;
        }
        Some(StringSite {
            code,
            pos,
            found,
            data,
            str_offset,
            value,
        })
    }

    /// The current string, or `None` when the code pattern is absent.
    pub fn value(&self, image: &impl PeImage) -> Option<String> {
        self.find_site(image).map(|site| site.value)
    }

    /// Overwrites in place when the new value fits the existing slot, and
    /// relocates the string otherwise.
    pub fn apply(&self, image: &mut impl PeImage, value: &str) -> Result<()> {
        let site = self
            .find_site(image)
            .ok_or(Error::PatternNotFound(self.section))?;
        let slot = bytes::utf16_len(&site.value);
        if bytes::utf16_len(value) > slot {
            self.move_patch(image, site, value)
        } else {
            // same address, so no relocation changes either way
            let encoded = bytes::encode_utf16(value, Some(slot));
            if !image.write(site.str_offset, &encoded) {
                return Err(Error::WriteFailed(site.str_offset));
            }
            Ok(())
        }
    }

    /// Appends the replacement string past the data section's live bytes
    /// and redirects the code's address field at it.
    fn move_patch(&self, image: &mut impl PeImage, site: StringSite, value: &str) -> Result<()> {
        let encoded = bytes::encode_utf16(value, None);
        let data = image
            .expand_section(site.data.index, encoded.len() as u32)
            .ok_or(Error::Capacity)?;
        let str_offset = data.raw_offset + data.virtual_size;
        let str_va = data.virtual_address + data.virtual_size;
        let field_va = site.code.virtual_address + site.pos as u32 + u32::from(self.addr_pos) + 4;
        let field = if image.is_64bit() {
            str_va.wrapping_sub(field_va)
        } else {
            str_va.wrapping_add(image.image_base() as u32)
        };
        debug!(
            "string outgrew its slot, moving to rva {:#x} in section {}",
            str_va, data.index,
        );
        if !image.write(str_offset, &encoded) {
            return Err(Error::WriteFailed(str_offset));
        }
        let mut code = site.found;
        bytes::set_dword(&mut code, self.addr_pos, field);
        let code_offset = site.code.raw_offset + site.pos as u32;
        if !image.write(code_offset, &code) {
            return Err(Error::WriteFailed(code_offset));
        }
        if !image.set_virtual_size(data.index, data.virtual_size + encoded.len() as u32) {
            return Err(Error::WriteFailed(str_offset));
        }
        Ok(())
    }
}

/// A 4-byte slot in the injected function that ends up holding a
/// call-relative displacement to another function.
#[derive(Debug, Clone)]
pub(crate) enum SymbolField {
    /// The template already carries the RVA.
    Fixed { pos: u16 },
    /// The template dword is zero; the RVA comes from the symbol source.
    Named { pos: u16, name: String },
}

/// Code injection: replaces a matched call site with a call into a
/// freshly written function body, resolving unknown addresses through the
/// symbol source and persisting whatever Revert will need.
#[derive(Debug, Clone)]
pub struct AddFunctionPatch {
    pub(crate) section: SectionName,
    pub(crate) target: Pattern,
    pub(crate) call: Vec<u8>,
    /// Offset of the rel32 field inside the call template.
    pub(crate) call_pos: u16,
    pub(crate) func: Vec<u8>,
    /// Offsets of the caller-parameter fields inside the body.
    pub(crate) value_pos: Vec<u16>,
    pub(crate) sym_fields: Vec<SymbolField>,
    /// The call template with its rel32 field wildcarded; how an installed
    /// call site is found again.
    pub(crate) masked_call: Pattern,
    /// The body template with every parameter and symbol field wildcarded.
    pub(crate) masked_func: Pattern,
}

impl AddFunctionPatch {
    /// Key for the slack-region record holding the captured call-site
    /// bytes: a 16-bit fold of a multiplicative rolling hash over the
    /// section name and target pattern.
    fn persistent_id(&self) -> u16 {
        let mut a: u32 = 63689;
        let mut hash: u32 = 0;
        for &b in self.section.as_bytes().iter().chain(self.target.bytes()) {
            hash = hash.wrapping_mul(a).wrapping_add(u32::from(b));
            a = a.wrapping_mul(378551);
        }
        (((hash & 0xffff) + (hash >> 16)) & 0xffff) as u16
    }

    /// Finds the installed body, looking in the patch's own section first
    /// and then in the dedicated injected-code section.
    fn locate_func(&self, image: &impl PeImage) -> Option<Match> {
        let sect = image.section_by_name(&self.section)?;
        if let Some(pos) = self.masked_func.find_in(section_bytes(image, &sect)) {
            return Some(Match { sect, pos });
        }
        let out = image.section_by_name(&SectionName::PATCH)?;
        let pos = self.masked_func.find_in(section_bytes(image, &out))?;
        Some(Match { sect: out, pos })
    }

    /// Injects the function and rewrites the call site. Nothing is
    /// written until the pattern, the values, every symbol, and the space
    /// reservation have all checked out.
    pub fn apply(
        &self,
        image: &mut impl PeImage,
        symbols: &impl SymbolSource,
        values: &[u32],
    ) -> Result<()> {
        if values.len() != self.value_pos.len() {
            return Err(Error::ValueCountMismatch {
                expected: self.value_pos.len(),
                got: values.len(),
            });
        }
        let sect = image
            .section_by_name(&self.section)
            .ok_or(Error::SectionNotFound(self.section))?;

        let pos = match self.target.find_in(section_bytes(image, &sect)) {
            Some(pos) => pos,
            None if self.locate_func(image).is_some() => return Err(Error::AlreadyApplied),
            None => return Err(Error::PatternNotFound(self.section)),
        };

        // build-specific bytes the pattern matched over; Revert needs them
        let captured: SmallVec<[u8; 32]> = {
            let data = section_bytes(image, &sect);
            self.target
                .wildcard_positions()
                .map(|i| data[pos + i])
                .collect()
        };

        // resolve every named symbol up front
        let mut sym_rvas: SmallVec<[(u16, u32); 8]> = SmallVec::new();
        for field in &self.sym_fields {
            let resolved = match field {
                SymbolField::Fixed { pos } => (*pos, bytes::get_dword(&self.func, *pos)),
                SymbolField::Named { pos, name } => {
                    let mut rva = symbols
                        .resolve(name)
                        .ok_or_else(|| Error::SymbolNotFound(name.clone()))?;
                    if symbols.section_relative() {
                        // addresses are relative to the section holding the
                        // symbol; assume the one being patched
                        rva = rva.wrapping_add(sect.virtual_address);
                    }
                    (*pos, rva)
                }
            };
            sym_rvas.push(resolved);
        }

        // reserve room for the body: grow the target section, or fall back
        // to a dedicated code section
        let out = match image.expand_section(sect.index, self.func.len() as u32) {
            Some(out) => out,
            None => image
                .create_section(&SectionName::PATCH, self.func.len() as u32)
                .ok_or(Error::Capacity)?,
        };
        // expansion may have grown the raw data behind the call site
        let sect = image
            .section(sect.index)
            .ok_or(Error::SectionNotFound(self.section))?;
        let va_call = sect.virtual_address + pos as u32;

        // place the body at the next free byte, aligned when room allows
        let mut addr = out.virtual_size;
        let mut pad = align(addr, FUNC_ALIGNMENT) - addr;
        if pad != 0 && out.raw_size.saturating_sub(addr + pad) < self.func.len() as u32 {
            pad = 0;
        }
        addr += pad;
        let va_func = out.virtual_address + addr;

        let mut call = self.call.clone();
        bytes::set_dword(
            &mut call,
            self.call_pos,
            va_func.wrapping_sub(va_call).wrapping_sub(CALL_LEN),
        );

        let mut func = self.func.clone();
        for (&field, &value) in self.value_pos.iter().zip(values) {
            bytes::set_dword(&mut func, field, value);
        }
        for &(field, rva) in &sym_rvas {
            // call-relative displacement, measured from the field's end
            let disp = rva
                .wrapping_sub(va_func)
                .wrapping_sub(u32::from(field))
                .wrapping_sub(4);
            bytes::set_dword(&mut func, field, disp);
        }

        // write phase
        if !captured.is_empty() {
            let slack = image.slack_mut().ok_or(Error::Capacity)?;
            persist::set(slack, self.persistent_id(), &captured)?;
        }
        debug!(
            "injecting {} byte function at rva {:#x}, call site rva {:#x}",
            func.len(),
            va_func,
            va_call,
        );
        write_code(image, &sect, pos, &call)?;
        let func_offset = out.raw_offset + addr;
        // the body lands past every fixed-up byte, so nothing to strip
        if !image.write(func_offset, &func) {
            return Err(Error::WriteFailed(func_offset));
        }
        let new_size = out.virtual_size + self.func.len() as u32 + pad;
        if !image.set_virtual_size(out.index, new_size) {
            return Err(Error::WriteFailed(func_offset));
        }
        Ok(())
    }

    /// Undoes the injection: restores the original call-site bytes from
    /// the persisted record, zeroes the body, and shrinks the destination
    /// section past trailing zeros. Finding neither the call nor the body
    /// means there is nothing to revert.
    pub fn revert(&self, image: &mut impl PeImage) -> Result<()> {
        let Some(sect) = image.section_by_name(&self.section) else {
            return Ok(());
        };
        let Some(call_pos) = self.masked_call.find_in(section_bytes(image, &sect)) else {
            return Ok(());
        };
        let Some(body) = self.locate_func(image) else {
            return Ok(());
        };

        // rebuild the pre-patch bytes before touching the image
        let mut original = self.target.bytes().to_vec();
        let wildcards: Vec<usize> = self.target.wildcard_positions().collect();
        if !wildcards.is_empty() {
            let slack = image.slack().ok_or(Error::CorruptState)?;
            let saved = persist::get(slack, self.persistent_id()).ok_or(Error::CorruptState)?;
            if saved.len() != wildcards.len() {
                warn!(
                    "persisted record holds {} bytes but the pattern has {} wildcards",
                    saved.len(),
                    wildcards.len(),
                );
                return Err(Error::CorruptState);
            }
            for (&i, &b) in wildcards.iter().zip(saved) {
                original[i] = b;
            }
        }

        debug!(
            "reverting injected function, call site at file offset {:#x}",
            sect.raw_offset as usize + call_pos,
        );
        write_code(image, &sect, call_pos, &original)?;
        let body_offset = body.sect.raw_offset + body.pos as u32;
        if !image.zero(body_offset, self.masked_func.len() as u32) {
            return Err(Error::WriteFailed(body_offset));
        }
        // walk the declared size back over any trailing zeros
        let vs = body.sect.virtual_size;
        if vs > body.pos as u32 {
            let start = body.sect.raw_offset as usize + body.pos;
            let len = (vs - body.pos as u32) as usize;
            let live = image.data().get(start..start + len).unwrap_or(&[]);
            let keep = live.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            if !image.set_virtual_size(body.sect.index, body.pos as u32 + keep as u32) {
                return Err(Error::WriteFailed(body_offset));
            }
        }
        if !wildcards.is_empty() {
            if let Some(slack) = image.slack_mut() {
                persist::remove(slack, self.persistent_id());
            }
        }
        Ok(())
    }

    /// Reads the caller-parameter fields back out of the installed body;
    /// `None` when no body is present.
    pub fn values(&self, image: &impl PeImage) -> Option<Vec<u32>> {
        let body = self.locate_func(image)?;
        let data = section_bytes(image, &body.sect);
        let found = &data[body.pos..];
        Some(
            self.value_pos
                .iter()
                .map(|&f| bytes::get_dword(found, f))
                .collect(),
        )
    }
}
