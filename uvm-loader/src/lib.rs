//! Turns a parsed ELF32 image into a runnable one: chooses a load base,
//! maps `PT_LOAD` segments into an [`AddressSpace`], installs the GOT/PLT
//! regions, and drives relocation. Composes [`uvm_elf::image`] and
//! [`uvm_elf::reloc`] transiently — it holds no state of its own once
//! [`load`] returns.

use thiserror::Error;
use uvm_elf::image::{ElfError, ElfImage, ProgramHeader, SectionHeader};
use uvm_elf::reloc::{self, RelocReport, SymbolResolver};
use uvm_memory::{AddressSpace, GuestAddress, MemoryError, Protection, RegionKind};

/// Default GOT capacity: 1024 slots of 4 bytes each.
pub const DEFAULT_GOT_SLOTS: u32 = 1024;
/// Default PLT capacity: 512 entries of 16 bytes each (stub size unused
/// directly — relocation resolves calls eagerly, see [`uvm_elf::reloc`]).
pub const DEFAULT_PLT_ENTRIES: u32 = 512;
const PLT_ENTRY_SIZE: u32 = 16;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("image's object type is not EXEC or DYN")]
    UnsupportedType,
}

pub type LoadResult<T> = Result<T, LoadError>;

/// Where to place a `DYN` image's segments. Ignored for `EXEC` images,
/// which are always loaded at their linked addresses (bias 0).
#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig {
    pub et_dyn_load_base: GuestAddress,
    pub got_slots: u32,
    pub plt_entries: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            et_dyn_load_base: 0x0800_0000,
            got_slots: DEFAULT_GOT_SLOTS,
            plt_entries: DEFAULT_PLT_ENTRIES,
        }
    }
}

/// Outcome of a successful load.
#[derive(Debug)]
pub struct LoadOutcome {
    pub load_base: GuestAddress,
    pub entry_point: GuestAddress,
    pub got_base: Option<GuestAddress>,
    pub plt_base: Option<GuestAddress>,
    pub applied_count: u32,
    pub failed_count: u32,
}

/// Parse, map, and relocate `bytes` into `mem`. Follows the ELF image's own
/// `PT_LOAD` layout; never touches regions outside what it registers here.
pub fn load(
    mem: &mut AddressSpace,
    bytes: &[u8],
    config: LoaderConfig,
    resolver: &mut dyn SymbolResolver,
) -> LoadResult<LoadOutcome> {
    let image = ElfImage::parse(bytes)?;

    let load_base = if image.is_et_dyn() {
        config.et_dyn_load_base
    } else {
        0
    };

    map_segments(mem, &image, load_base)?;

    let symbols = load_symbol_table(&image)?;

    let (got_base, plt_base) = install_got_plt(mem, &image, load_base, &config)?;

    let mut rel = Vec::new();
    let mut rela = Vec::new();
    for section in image.relocation_sections() {
        match section.sh_type {
            t if t == SectionHeader::SHT_REL => rel.extend(image.rel_entries(section)?),
            t if t == SectionHeader::SHT_RELA => rela.extend(image.rela_entries(section)?),
            _ => unreachable!("relocation_sections only yields REL/RELA sections"),
        }
    }

    let report: RelocReport =
        reloc::apply_relocations(mem, &symbols, &rel, &rela, 0, load_base, got_base, resolver);

    if !report.succeeded() {
        log::warn!(
            "load completed with {} unresolved required symbol(s)",
            report.hard_failures
        );
    }

    let entry_point = load_base.wrapping_add(image.entry_point());
    log::info!(
        "loaded image: load_base={:#010x} entry={:#010x} applied={} failed={}",
        load_base,
        entry_point,
        report.applied,
        report.failures.len()
    );

    Ok(LoadOutcome {
        load_base,
        entry_point,
        got_base,
        plt_base,
        applied_count: report.applied,
        failed_count: report.failures.len() as u32,
    })
}

fn map_segments(mem: &mut AddressSpace, image: &ElfImage, load_base: u32) -> LoadResult<()> {
    for ph in image.program_headers() {
        if ph.p_type != ProgramHeader::PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let start = load_base.wrapping_add(ph.p_vaddr);
        let kind = if ph.is_executable() { RegionKind::Code } else { RegionKind::Data };

        let mut protection = Protection::empty();
        if ph.is_readable() {
            protection |= Protection::READ;
        }
        if ph.is_writable() {
            protection |= Protection::WRITE;
        }
        if ph.is_executable() {
            protection |= Protection::EXECUTE;
        }

        mem.register_region(start, ph.p_memsz, kind, protection, "segment")?;

        if ph.p_filesz > 0 {
            let src_start = ph.p_offset as usize;
            let src_end = src_start + ph.p_filesz as usize;
            let bytes = image
                .bytes()
                .get(src_start..src_end)
                .ok_or(ElfError::Truncated { offset: src_start })?;
            mem.write(start, bytes)?;
        }

        log::debug!(
            "mapped segment [{:#010x}, {:#010x}) kind={:?} prot={:?}",
            start,
            start as u64 + ph.p_memsz as u64,
            kind,
            protection
        );
    }
    Ok(())
}

fn load_symbol_table(image: &ElfImage) -> LoadResult<Vec<uvm_elf::image::Symbol>> {
    let symtab = match image.section_by_name(".dynsym")? {
        Some(sh) => Some(sh),
        None => image.section_by_name(".symtab")?,
    };
    let Some(symtab) = symtab else {
        return Ok(Vec::new());
    };

    let strtab_name = if symtab.sh_type == SectionHeader::SHT_DYNSYM {
        ".dynstr"
    } else {
        ".strtab"
    };
    let Some(strtab) = image.section_by_name(strtab_name)? else {
        return Ok(Vec::new());
    };

    image.symbols(symtab, strtab).map_err(LoadError::from)
}

fn install_got_plt(
    mem: &mut AddressSpace,
    image: &ElfImage,
    load_base: u32,
    config: &LoaderConfig,
) -> LoadResult<(Option<GuestAddress>, Option<GuestAddress>)> {
    if image.dynamic_entries()?.is_empty() {
        return Ok((None, None));
    }

    let data_end = image
        .program_headers()
        .iter()
        .filter(|ph| ph.p_type == ProgramHeader::PT_LOAD)
        .map(|ph| load_base as u64 + ph.p_vaddr as u64 + ph.p_memsz as u64)
        .max()
        .unwrap_or(load_base as u64);

    let got_size = config.got_slots * 4;
    let got_base = (data_end as u32).next_multiple_of(4096);
    mem.register_region(got_base, got_size, RegionKind::Mmap, Protection::READ | Protection::WRITE, "got")?;

    let plt_size = config.plt_entries * PLT_ENTRY_SIZE;
    let plt_base = (got_base as u64 + got_size as u64) as u32;
    mem.register_region(plt_base, plt_size, RegionKind::Mmap, Protection::READ | Protection::EXECUTE, "plt")?;

    log::debug!(
        "installed GOT at {:#010x} ({} slots), PLT at {:#010x} ({} entries)",
        got_base,
        config.got_slots,
        plt_base,
        config.plt_entries
    );

    Ok((Some(got_base), Some(plt_base)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvm_elf::reloc::NullResolver;
    use uvm_memory::MIN_MEMORY_SIZE;

    fn elf32_header(e_type: u16, phnum: u16, entry: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; 52];
        bytes[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        bytes[4] = 1; // ELFCLASS32
        bytes[5] = 1; // ELFDATA2LSB
        bytes[6] = 1; // EV_CURRENT
        bytes[16..18].copy_from_slice(&e_type.to_le_bytes());
        bytes[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        bytes[20..24].copy_from_slice(&1u32.to_le_bytes());
        bytes[24..28].copy_from_slice(&entry.to_le_bytes());
        bytes[28..32].copy_from_slice(&52u32.to_le_bytes()); // e_phoff
        bytes[42..44].copy_from_slice(&32u16.to_le_bytes()); // e_phentsize
        bytes[44..46].copy_from_slice(&phnum.to_le_bytes());
        bytes
    }

    #[test]
    fn maps_a_single_executable_load_segment_at_et_dyn_base() {
        let mut bytes = elf32_header(3 /* ET_DYN */, 1, 0x10);
        let code = [0x90u8, 0x90, 0xC3]; // NOP NOP RET
        let ph_off = bytes.len();
        bytes.resize(ph_off + 32, 0);
        let file_off = ph_off + 32;
        bytes.extend_from_slice(&code);

        bytes[ph_off..ph_off + 4].copy_from_slice(&ProgramHeader::PT_LOAD.to_le_bytes());
        bytes[ph_off + 4..ph_off + 8].copy_from_slice(&(file_off as u32).to_le_bytes()); // p_offset
        bytes[ph_off + 8..ph_off + 12].copy_from_slice(&0u32.to_le_bytes()); // p_vaddr
        bytes[ph_off + 16..ph_off + 20].copy_from_slice(&(code.len() as u32).to_le_bytes()); // p_filesz
        bytes[ph_off + 20..ph_off + 24].copy_from_slice(&(code.len() as u32).to_le_bytes()); // p_memsz
        bytes[ph_off + 24..ph_off + 28]
            .copy_from_slice(&(ProgramHeader::PF_R | ProgramHeader::PF_X).to_le_bytes());

        let mut mem = AddressSpace::new(MIN_MEMORY_SIZE).unwrap();
        let config = LoaderConfig { et_dyn_load_base: 0x0800_0000, ..Default::default() };
        let outcome = load(&mut mem, &bytes, config, &mut NullResolver).unwrap();

        assert_eq!(outcome.load_base, 0x0800_0000);
        assert_eq!(outcome.entry_point, 0x0800_0010);
        let mapped = mem.read(0x0800_0000, 3).unwrap();
        assert_eq!(mapped, code);
    }

    #[test]
    fn exec_image_loads_at_zero_bias() {
        let mut bytes = elf32_header(2 /* ET_EXEC */, 1, 0x1000);
        let ph_off = bytes.len();
        bytes.resize(ph_off + 32, 0);
        bytes[ph_off..ph_off + 4].copy_from_slice(&ProgramHeader::PT_LOAD.to_le_bytes());
        bytes[ph_off + 8..ph_off + 12].copy_from_slice(&0x1000u32.to_le_bytes());
        bytes[ph_off + 20..ph_off + 24].copy_from_slice(&0x1000u32.to_le_bytes()); // p_memsz
        bytes[ph_off + 24..ph_off + 28].copy_from_slice(&(ProgramHeader::PF_R | ProgramHeader::PF_X).to_le_bytes());

        let mut mem = AddressSpace::new(MIN_MEMORY_SIZE).unwrap();
        let outcome = load(&mut mem, &bytes, LoaderConfig::default(), &mut NullResolver).unwrap();
        assert_eq!(outcome.load_base, 0);
        assert_eq!(outcome.entry_point, 0x1000);
    }
}
