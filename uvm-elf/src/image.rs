//! ELF32 image parsing: headers, program headers, section headers, symbols,
//! and relocation entries. Read-only — this module never mutates the image
//! or the address space; the loader and relocator do that.

use thiserror::Error;

/// Parser failure. The parser never returns a partially-parsed image: any
/// of these aborts the whole parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ElfError {
    #[error("not an ELF file (bad magic)")]
    BadMagic,
    #[error("unsupported ELF class: expected 32-bit")]
    UnsupportedClass,
    #[error("unsupported byte order: expected little-endian")]
    UnsupportedEncoding,
    #[error("unsupported ELF version")]
    UnsupportedVersion,
    #[error("unsupported machine: expected EM_386")]
    UnsupportedMachine,
    #[error("unsupported object type: expected ET_EXEC or ET_DYN")]
    UnsupportedType,
    #[error("header or table entry truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("section index {index} out of bounds")]
    SectionOutOfBounds { index: usize },
    #[error("symbol index {index} out of bounds")]
    SymbolIndexOutOfBounds { index: usize },
    #[error("string table offset {offset} out of bounds")]
    StringOutOfBounds { offset: usize },
}

type ElfResult<T> = Result<T, ElfError>;

fn u16_at(bytes: &[u8], offset: usize) -> ElfResult<u16> {
    let slice = bytes
        .get(offset..offset + 2)
        .ok_or(ElfError::Truncated { offset })?;
    Ok(u16::from_le_bytes(slice.try_into().unwrap()))
}

fn u32_at(bytes: &[u8], offset: usize) -> ElfResult<u32> {
    let slice = bytes
        .get(offset..offset + 4)
        .ok_or(ElfError::Truncated { offset })?;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn i32_at(bytes: &[u8], offset: usize) -> ElfResult<i32> {
    Ok(u32_at(bytes, offset)? as i32)
}

/// Parsed ELF32 file header (`Elf32_Ehdr`).
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl ElfHeader {
    pub const MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
    pub const CLASS32: u8 = 1;
    pub const DATA_LSB: u8 = 1;
    pub const EV_CURRENT: u8 = 1;
    pub const EM_386: u16 = 3;
    pub const ET_EXEC: u16 = 2;
    pub const ET_DYN: u16 = 3;

    fn parse(bytes: &[u8]) -> ElfResult<Self> {
        if bytes.len() < 52 {
            return Err(ElfError::Truncated { offset: bytes.len() });
        }
        if bytes[0..4] != Self::MAGIC {
            return Err(ElfError::BadMagic);
        }
        if bytes[4] != Self::CLASS32 {
            return Err(ElfError::UnsupportedClass);
        }
        if bytes[5] != Self::DATA_LSB {
            return Err(ElfError::UnsupportedEncoding);
        }
        if bytes[6] != Self::EV_CURRENT {
            return Err(ElfError::UnsupportedVersion);
        }

        let header = ElfHeader {
            e_type: u16_at(bytes, 16)?,
            e_machine: u16_at(bytes, 18)?,
            e_version: u32_at(bytes, 20)?,
            e_entry: u32_at(bytes, 24)?,
            e_phoff: u32_at(bytes, 28)?,
            e_shoff: u32_at(bytes, 32)?,
            e_flags: u32_at(bytes, 36)?,
            e_ehsize: u16_at(bytes, 40)?,
            e_phentsize: u16_at(bytes, 42)?,
            e_phnum: u16_at(bytes, 44)?,
            e_shentsize: u16_at(bytes, 46)?,
            e_shnum: u16_at(bytes, 48)?,
            e_shstrndx: u16_at(bytes, 50)?,
        };

        if header.e_machine != Self::EM_386 {
            return Err(ElfError::UnsupportedMachine);
        }
        if header.e_type != Self::ET_EXEC && header.e_type != Self::ET_DYN {
            return Err(ElfError::UnsupportedType);
        }

        Ok(header)
    }

    /// `true` for a position-independent (`ET_DYN`) image.
    pub fn is_et_dyn(&self) -> bool {
        self.e_type == Self::ET_DYN
    }
}

/// Parsed `Elf32_Phdr`.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

impl ProgramHeader {
    pub const PT_NULL: u32 = 0;
    pub const PT_LOAD: u32 = 1;
    pub const PT_DYNAMIC: u32 = 2;
    pub const PT_INTERP: u32 = 3;
    pub const PT_PHDR: u32 = 6;

    pub const PF_X: u32 = 1 << 0;
    pub const PF_W: u32 = 1 << 1;
    pub const PF_R: u32 = 1 << 2;

    /// Segment is executable.
    pub fn is_executable(&self) -> bool {
        self.p_flags & Self::PF_X != 0
    }

    /// Segment is writable.
    pub fn is_writable(&self) -> bool {
        self.p_flags & Self::PF_W != 0
    }

    /// Segment is readable.
    pub fn is_readable(&self) -> bool {
        self.p_flags & Self::PF_R != 0
    }

    fn parse(bytes: &[u8], offset: usize) -> ElfResult<Self> {
        Ok(Self {
            p_type: u32_at(bytes, offset)?,
            p_offset: u32_at(bytes, offset + 4)?,
            p_vaddr: u32_at(bytes, offset + 8)?,
            p_paddr: u32_at(bytes, offset + 12)?,
            p_filesz: u32_at(bytes, offset + 16)?,
            p_memsz: u32_at(bytes, offset + 20)?,
            p_flags: u32_at(bytes, offset + 24)?,
            p_align: u32_at(bytes, offset + 28)?,
        })
    }
}

/// Parsed `Elf32_Shdr`.
#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u32,
    pub sh_entsize: u32,
}

impl SectionHeader {
    pub const SHT_NULL: u32 = 0;
    pub const SHT_SYMTAB: u32 = 2;
    pub const SHT_STRTAB: u32 = 3;
    pub const SHT_RELA: u32 = 4;
    pub const SHT_DYNAMIC: u32 = 6;
    pub const SHT_REL: u32 = 9;
    pub const SHT_DYNSYM: u32 = 11;

    fn parse(bytes: &[u8], offset: usize) -> ElfResult<Self> {
        Ok(Self {
            sh_name: u32_at(bytes, offset)?,
            sh_type: u32_at(bytes, offset + 4)?,
            sh_flags: u32_at(bytes, offset + 8)?,
            sh_addr: u32_at(bytes, offset + 12)?,
            sh_offset: u32_at(bytes, offset + 16)?,
            sh_size: u32_at(bytes, offset + 20)?,
            sh_link: u32_at(bytes, offset + 24)?,
            sh_info: u32_at(bytes, offset + 28)?,
            sh_addralign: u32_at(bytes, offset + 32)?,
            sh_entsize: u32_at(bytes, offset + 36)?,
        })
    }
}

/// One parsed `Elf32_Sym`, with its name already resolved against the
/// matching string table.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: u32,
    pub size: u32,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
}

impl Symbol {
    pub const STB_LOCAL: u8 = 0;
    pub const STB_GLOBAL: u8 = 1;
    pub const STB_WEAK: u8 = 2;

    /// Symbol binding (`STB_*`).
    pub fn bind(&self) -> u8 {
        self.info >> 4
    }

    /// Symbol type (`STT_*`).
    pub fn sym_type(&self) -> u8 {
        self.info & 0xF
    }

    /// `SHN_UNDEF` — the symbol is imported, not defined in this image.
    pub fn is_undefined(&self) -> bool {
        self.shndx == 0
    }

    /// `true` for `STB_WEAK` bindings, which tolerate being left undefined.
    pub fn is_weak(&self) -> bool {
        self.bind() == Self::STB_WEAK
    }
}

/// A `REL` relocation entry (implicit addend, read from the target word).
#[derive(Debug, Clone, Copy)]
pub struct RelEntry {
    pub offset: u32,
    pub info: u32,
}

impl RelEntry {
    pub fn r_type(&self) -> u32 {
        self.info & 0xFF
    }
    pub fn r_sym(&self) -> u32 {
        self.info >> 8
    }
}

/// A `RELA` relocation entry (explicit addend).
#[derive(Debug, Clone, Copy)]
pub struct RelaEntry {
    pub offset: u32,
    pub info: u32,
    pub addend: i32,
}

impl RelaEntry {
    pub fn r_type(&self) -> u32 {
        self.info & 0xFF
    }
    pub fn r_sym(&self) -> u32 {
        self.info >> 8
    }
}

/// A parsed dynamic table entry (`Elf32_Dyn`).
#[derive(Debug, Clone, Copy)]
pub struct DynEntry {
    pub tag: i32,
    pub val: u32,
}

impl DynEntry {
    pub const DT_NULL: i32 = 0;
    pub const DT_STRTAB: i32 = 5;
    pub const DT_SYMTAB: i32 = 6;
    pub const DT_RELA: i32 = 7;
    pub const DT_RELASZ: i32 = 8;
    pub const DT_RELAENT: i32 = 9;
    pub const DT_REL: i32 = 17;
    pub const DT_RELSZ: i32 = 18;
    pub const DT_RELENT: i32 = 19;
}

/// A validated, fully-parsed ELF32 image. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct ElfImage {
    bytes: Vec<u8>,
    header: ElfHeader,
    program_headers: Vec<ProgramHeader>,
    section_headers: Vec<SectionHeader>,
}

impl ElfImage {
    /// Parse and validate an ELF32 image. Never returns a partially-built
    /// image: any malformed header or table aborts the whole parse.
    pub fn parse(bytes: &[u8]) -> ElfResult<Self> {
        let header = ElfHeader::parse(bytes)?;

        let mut program_headers = Vec::with_capacity(header.e_phnum as usize);
        for i in 0..header.e_phnum as usize {
            let offset = header.e_phoff as usize + i * header.e_phentsize as usize;
            program_headers.push(ProgramHeader::parse(bytes, offset)?);
        }

        let mut section_headers = Vec::with_capacity(header.e_shnum as usize);
        for i in 0..header.e_shnum as usize {
            let offset = header.e_shoff as usize + i * header.e_shentsize as usize;
            section_headers.push(SectionHeader::parse(bytes, offset)?);
        }

        log::debug!(
            "parsed ELF32 image: type={:#x} entry={:#x} {} program headers, {} sections",
            header.e_type,
            header.e_entry,
            program_headers.len(),
            section_headers.len()
        );

        Ok(Self {
            bytes: bytes.to_vec(),
            header,
            program_headers,
            section_headers,
        })
    }

    pub fn header(&self) -> &ElfHeader {
        &self.header
    }

    pub fn program_headers(&self) -> &[ProgramHeader] {
        &self.program_headers
    }

    pub fn section_headers(&self) -> &[SectionHeader] {
        &self.section_headers
    }

    /// Raw image bytes, as given to [`ElfImage::parse`].
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn entry_point(&self) -> u32 {
        self.header.e_entry
    }

    pub fn is_et_dyn(&self) -> bool {
        self.header.is_et_dyn()
    }

    fn segment_bytes(&self, ph: &ProgramHeader) -> ElfResult<&[u8]> {
        let start = ph.p_offset as usize;
        let end = start + ph.p_filesz as usize;
        self.bytes
            .get(start..end)
            .ok_or(ElfError::Truncated { offset: start })
    }

    /// Contents of the first `PT_INTERP` segment, as a path string, if any.
    /// Recorded for diagnostics; the core never follows it.
    pub fn interp_path(&self) -> ElfResult<Option<String>> {
        for ph in &self.program_headers {
            if ph.p_type == ProgramHeader::PT_INTERP {
                let bytes = self.segment_bytes(ph)?;
                let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                return Ok(Some(String::from_utf8_lossy(&bytes[..nul]).into_owned()));
            }
        }
        Ok(None)
    }

    /// Parse the `Elf32_Dyn` array inside the first `PT_DYNAMIC` segment.
    pub fn dynamic_entries(&self) -> ElfResult<Vec<DynEntry>> {
        let Some(ph) = self.program_headers.iter().find(|p| p.p_type == ProgramHeader::PT_DYNAMIC) else {
            return Ok(Vec::new());
        };
        let bytes = self.segment_bytes(ph)?;
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset + 8 <= bytes.len() {
            let tag = i32_at(bytes, offset)?;
            let val = u32_at(bytes, offset + 4)?;
            entries.push(DynEntry { tag, val });
            if tag == DynEntry::DT_NULL {
                break;
            }
            offset += 8;
        }
        Ok(entries)
    }

    /// Read a NUL-terminated string from a string-table section at `index`.
    pub fn string_at(&self, strtab: &SectionHeader, index: u32) -> ElfResult<String> {
        let start = strtab.sh_offset as usize + index as usize;
        if start >= self.bytes.len() {
            return Err(ElfError::StringOutOfBounds { offset: start });
        }
        let slice = &self.bytes[start..];
        let nul = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
        Ok(String::from_utf8_lossy(&slice[..nul]).into_owned())
    }

    /// Section header by name, using the section-name string table.
    pub fn section_by_name(&self, name: &str) -> ElfResult<Option<&SectionHeader>> {
        let shstrtab = self
            .section_headers
            .get(self.header.e_shstrndx as usize)
            .ok_or(ElfError::SectionOutOfBounds { index: self.header.e_shstrndx as usize })?;
        for sh in &self.section_headers {
            if self.string_at(shstrtab, sh.sh_name)? == name {
                return Ok(Some(sh));
            }
        }
        Ok(None)
    }

    /// Parse a symbol table section given its matching string table section.
    pub fn symbols(&self, symtab: &SectionHeader, strtab: &SectionHeader) -> ElfResult<Vec<Symbol>> {
        const ENTRY_SIZE: usize = 16;
        let count = symtab.sh_size as usize / ENTRY_SIZE;
        let mut symbols = Vec::with_capacity(count);
        for i in 0..count {
            let offset = symtab.sh_offset as usize + i * ENTRY_SIZE;
            let name_idx = u32_at(&self.bytes, offset)?;
            let value = u32_at(&self.bytes, offset + 4)?;
            let size = u32_at(&self.bytes, offset + 8)?;
            let info = *self.bytes.get(offset + 12).ok_or(ElfError::Truncated { offset })?;
            let other = *self.bytes.get(offset + 13).ok_or(ElfError::Truncated { offset })?;
            let shndx = u16_at(&self.bytes, offset + 14)?;
            let name = if name_idx == 0 {
                String::new()
            } else {
                self.string_at(strtab, name_idx)?
            };
            symbols.push(Symbol { name, value, size, info, other, shndx });
        }
        Ok(symbols)
    }

    /// Parse a `SHT_REL` section's entries.
    pub fn rel_entries(&self, section: &SectionHeader) -> ElfResult<Vec<RelEntry>> {
        const ENTRY_SIZE: usize = 8;
        let count = section.sh_size as usize / ENTRY_SIZE;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let offset = section.sh_offset as usize + i * ENTRY_SIZE;
            out.push(RelEntry {
                offset: u32_at(&self.bytes, offset)?,
                info: u32_at(&self.bytes, offset + 4)?,
            });
        }
        Ok(out)
    }

    /// Parse a `SHT_RELA` section's entries.
    pub fn rela_entries(&self, section: &SectionHeader) -> ElfResult<Vec<RelaEntry>> {
        const ENTRY_SIZE: usize = 12;
        let count = section.sh_size as usize / ENTRY_SIZE;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let offset = section.sh_offset as usize + i * ENTRY_SIZE;
            out.push(RelaEntry {
                offset: u32_at(&self.bytes, offset)?,
                info: u32_at(&self.bytes, offset + 4)?,
                addend: i32_at(&self.bytes, offset + 8)?,
            });
        }
        Ok(out)
    }

    /// All `SHT_REL`/`SHT_RELA` sections in declaration order. Callers parse
    /// each with [`ElfImage::rel_entries`] or [`ElfImage::rela_entries`] and
    /// hand the result to [`crate::reloc::apply_relocations`], which reads a
    /// `REL` entry's implicit addend from the target word once the segment
    /// is mapped.
    pub fn relocation_sections(&self) -> impl Iterator<Item = &SectionHeader> {
        self.section_headers
            .iter()
            .filter(|sh| sh.sh_type == SectionHeader::SHT_REL || sh.sh_type == SectionHeader::SHT_RELA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header(e_type: u16, phnum: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; 52];
        bytes[0..4].copy_from_slice(&ElfHeader::MAGIC);
        bytes[4] = ElfHeader::CLASS32;
        bytes[5] = ElfHeader::DATA_LSB;
        bytes[6] = ElfHeader::EV_CURRENT;
        bytes[16..18].copy_from_slice(&e_type.to_le_bytes());
        bytes[18..20].copy_from_slice(&ElfHeader::EM_386.to_le_bytes());
        bytes[20..24].copy_from_slice(&1u32.to_le_bytes());
        bytes[24..28].copy_from_slice(&0x1000u32.to_le_bytes()); // e_entry
        bytes[28..32].copy_from_slice(&52u32.to_le_bytes()); // e_phoff
        bytes[42..44].copy_from_slice(&32u16.to_le_bytes()); // e_phentsize
        bytes[44..46].copy_from_slice(&phnum.to_le_bytes());
        bytes
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = minimal_header(ElfHeader::ET_EXEC, 0);
        bytes[0] = 0;
        assert_eq!(ElfImage::parse(&bytes).unwrap_err(), ElfError::BadMagic);
    }

    #[test]
    fn rejects_non_386_machine() {
        let mut bytes = minimal_header(ElfHeader::ET_EXEC, 0);
        bytes[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        assert_eq!(ElfImage::parse(&bytes).unwrap_err(), ElfError::UnsupportedMachine);
    }

    #[test]
    fn parses_single_load_segment() {
        let mut bytes = minimal_header(ElfHeader::ET_DYN, 1);
        bytes.resize(52 + 32, 0);
        let ph_off = 52;
        bytes[ph_off..ph_off + 4].copy_from_slice(&ProgramHeader::PT_LOAD.to_le_bytes());
        bytes[ph_off + 24..ph_off + 28].copy_from_slice(&(ProgramHeader::PF_R | ProgramHeader::PF_X).to_le_bytes());
        let image = ElfImage::parse(&bytes).unwrap();
        assert!(image.is_et_dyn());
        assert_eq!(image.program_headers().len(), 1);
        assert!(image.program_headers()[0].is_executable());
        assert_eq!(image.entry_point(), 0x1000);
    }

    #[test]
    fn truncated_program_header_table_is_rejected() {
        let mut bytes = minimal_header(ElfHeader::ET_EXEC, 2);
        bytes.resize(52 + 10, 0); // not enough room for two 32-byte phdrs
        assert!(matches!(ElfImage::parse(&bytes), Err(ElfError::Truncated { .. })));
    }
}
