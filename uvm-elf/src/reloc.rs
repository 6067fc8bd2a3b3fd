//! x86 (`R_386_*`) relocation processing against a mapped guest image.
//!
//! Every relocation is applied through [`uvm_memory::AddressSpace::read`]
//! and [`AddressSpace::write`] rather than a raw pointer, since the target
//! lives inside a region the loader has already mapped into the guest
//! address space, not in a buffer we own directly.

use std::collections::HashMap;

use thiserror::Error;
use uvm_memory::{AddressSpace, GuestAddress, MemoryError};

use crate::image::{RelEntry, RelaEntry, Symbol};

pub const R_386_NONE: u32 = 0;
pub const R_386_32: u32 = 1;
pub const R_386_PC32: u32 = 2;
pub const R_386_GOT32: u32 = 3;
pub const R_386_PLT32: u32 = 4;
pub const R_386_COPY: u32 = 5;
pub const R_386_GLOB_DAT: u32 = 6;
pub const R_386_JMP_SLOT: u32 = 7;
pub const R_386_RELATIVE: u32 = 8;
pub const R_386_GOTOFF: u32 = 9;
pub const R_386_GOTPC: u32 = 10;
pub const R_386_16: u32 = 20;
pub const R_386_PC16: u32 = 21;
pub const R_386_8: u32 = 22;
pub const R_386_PC8: u32 = 23;

#[derive(Debug, Error)]
pub enum RelocError {
    #[error("relocation type {0} is not supported")]
    UnsupportedRelocation(u32),
    #[error("symbol {0:?} is required but undefined and not weak")]
    UndefinedSymbol(String),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

type RelocResult<T> = Result<T, RelocError>;

/// Resolves an imported symbol name to a guest address. Implemented by the
/// VM's syscall/runtime layer so this crate never has to know how the host
/// supplies guest-visible library entry points.
pub trait SymbolResolver {
    fn resolve(&mut self, name: &str) -> Option<GuestAddress>;
}

/// A resolver that never resolves anything; useful for statically linked
/// images with no undefined symbols, and in tests.
pub struct NullResolver;

impl SymbolResolver for NullResolver {
    fn resolve(&mut self, _name: &str) -> Option<GuestAddress> {
        None
    }
}

/// One relocation entry normalized to carry an explicit addend, whether it
/// came from a `REL` or `RELA` section. `REL` entries' addends are read
/// from the target word, so this can only be built after the segment
/// containing `offset` has been mapped.
#[derive(Debug, Clone, Copy)]
struct NormalizedReloc {
    offset: u32,
    r_type: u32,
    r_sym: u32,
    addend: i32,
}

/// Outcome of applying all relocations in an image. Every entry is
/// attempted regardless of earlier failures; `hard_failures` counts
/// entries against a symbol that was required (not weak) and stayed
/// unresolved — the one failure kind that makes the overall pass a
/// failure once every entry has been tried.
#[derive(Debug, Default)]
pub struct RelocReport {
    pub applied: u32,
    pub failures: Vec<(GuestAddress, RelocError)>,
    pub hard_failures: u32,
}

impl RelocReport {
    /// `true` if every attempted relocation either applied cleanly or
    /// failed in a recoverable way. `false` means a required, non-weak
    /// symbol was left undefined.
    pub fn succeeded(&self) -> bool {
        self.hard_failures == 0
    }
}

/// Applies every relocation entry to the mapped image, attempting each one
/// independently: a failure is recorded in the returned report but never
/// stops the pass. Only after every entry has been tried does the caller
/// learn whether the pass as a whole succeeded — [`RelocReport::succeeded`]
/// is `false` exactly when a required, non-weak symbol was left undefined.
///
/// `link_base` is the address the image's own section/symbol values are
/// expressed relative to (0 for most `ET_DYN` toolchains); `load_base` is
/// where the loader actually placed the image, and `slide = load_base -
/// link_base` is added to every symbol-derived value. `got_base` anchors
/// `GOT`-relative relocations; slots are assigned to symbols on first use.
pub fn apply_relocations(
    mem: &mut AddressSpace,
    symbols: &[Symbol],
    rel: &[RelEntry],
    rela: &[RelaEntry],
    link_base: u32,
    load_base: u32,
    got_base: Option<GuestAddress>,
    resolver: &mut dyn SymbolResolver,
) -> RelocReport {
    let slide = load_base.wrapping_sub(link_base);
    let mut got_slots: HashMap<u32, GuestAddress> = HashMap::new();
    let mut next_got_slot = got_base.unwrap_or(0);
    let mut report = RelocReport::default();

    let mut normalized = Vec::with_capacity(rel.len() + rela.len());
    for entry in rel {
        let target = load_base.wrapping_add(entry.offset);
        match read_implicit_addend(mem, target) {
            Ok(addend) => normalized.push(NormalizedReloc {
                offset: entry.offset,
                r_type: entry.r_type(),
                r_sym: entry.r_sym(),
                addend,
            }),
            Err(e) => {
                log::warn!("could not read implicit addend at {:#010x}: {}", target, e);
                report.failures.push((target, e));
            }
        }
    }
    for entry in rela {
        normalized.push(NormalizedReloc {
            offset: entry.offset,
            r_type: entry.r_type(),
            r_sym: entry.r_sym(),
            addend: entry.addend,
        });
    }

    for entry in &normalized {
        let target: GuestAddress = load_base.wrapping_add(entry.offset);

        let sym = symbols.get(entry.r_sym as usize);
        let result = apply_one(
            mem,
            sym,
            entry,
            target,
            slide,
            load_base,
            got_base,
            &mut got_slots,
            &mut next_got_slot,
            resolver,
        );

        match result {
            Ok(()) => report.applied += 1,
            Err(err) => {
                log::warn!("relocation at {:#010x} failed: {}", target, err);
                if matches!(err, RelocError::UndefinedSymbol(_)) {
                    report.hard_failures += 1;
                }
                report.failures.push((target, err));
            }
        }
    }

    log::debug!(
        "applied {} relocations ({} recoverable, {} hard failures)",
        report.applied,
        report.failures.len(),
        report.hard_failures
    );

    report
}

#[allow(clippy::too_many_arguments)]
fn apply_one(
    mem: &mut AddressSpace,
    sym: Option<&Symbol>,
    entry: &NormalizedReloc,
    target: GuestAddress,
    slide: u32,
    load_base: u32,
    got_base: Option<GuestAddress>,
    got_slots: &mut HashMap<u32, GuestAddress>,
    next_got_slot: &mut GuestAddress,
    resolver: &mut dyn SymbolResolver,
) -> RelocResult<()> {
    // Resolves this entry's symbol value (`S` in the formula table), either
    // from the image's own definition or via the host-supplied resolver.
    let symbol_value = |resolver: &mut dyn SymbolResolver| -> RelocResult<u32> {
        let sym = sym.ok_or(RelocError::UnsupportedRelocation(entry.r_type))?;
        if !sym.is_undefined() {
            return Ok(sym.value.wrapping_add(slide));
        }
        match resolver.resolve(&sym.name) {
            Some(addr) => Ok(addr),
            None if sym.is_weak() => Ok(0),
            None => Err(RelocError::UndefinedSymbol(sym.name.clone())),
        }
    };

    let got_slot_for = |r_sym: u32, value: u32, got_slots: &mut HashMap<u32, GuestAddress>, next: &mut GuestAddress| -> RelocResult<GuestAddress> {
        if let Some(&slot) = got_slots.get(&r_sym) {
            return Ok(slot);
        }
        let base = got_base.ok_or(RelocError::UnsupportedRelocation(R_386_GOT32))?;
        let slot = *next;
        *next = next.wrapping_add(4);
        mem.write(slot, &value.to_le_bytes())?;
        got_slots.insert(r_sym, slot);
        let _ = base;
        Ok(slot)
    };

    match entry.r_type {
        R_386_NONE => Ok(()),

        R_386_32 => {
            let value = symbol_value(resolver)?.wrapping_add(entry.addend as u32);
            mem.write(target, &value.to_le_bytes())?;
            Ok(())
        }

        R_386_PC32 => {
            let s = symbol_value(resolver)?;
            let value = s.wrapping_add(entry.addend as u32).wrapping_sub(target);
            mem.write(target, &value.to_le_bytes())?;
            Ok(())
        }

        R_386_GOT32 => {
            let s = symbol_value(resolver)?;
            let slot = got_slot_for(entry.r_sym, s, got_slots, next_got_slot)?;
            let g = got_base.unwrap_or(0);
            let value = slot.wrapping_sub(g).wrapping_add(entry.addend as u32);
            mem.write(target, &value.to_le_bytes())?;
            Ok(())
        }

        R_386_PLT32 => {
            // No separate PLT stub table: the GOT slot itself serves as
            // `PLT[sym]`, since every call is resolved eagerly at load time.
            let s = symbol_value(resolver)?;
            let plt = got_slot_for(entry.r_sym, s, got_slots, next_got_slot)?;
            let value = plt.wrapping_add(entry.addend as u32).wrapping_sub(target);
            mem.write(target, &value.to_le_bytes())?;
            Ok(())
        }

        R_386_COPY => {
            let sym = sym.ok_or(RelocError::UnsupportedRelocation(entry.r_type))?;
            let source = resolver
                .resolve(&sym.name)
                .ok_or_else(|| RelocError::UndefinedSymbol(sym.name.clone()))?;
            let buf = mem.read(source, sym.size as usize)?;
            mem.write(target, &buf)?;
            Ok(())
        }

        R_386_GLOB_DAT | R_386_JMP_SLOT => {
            let s = symbol_value(resolver)?;
            mem.write(target, &s.to_le_bytes())?;
            Ok(())
        }

        R_386_RELATIVE => {
            let addend_at_target = read_implicit_addend(mem, target)?;
            let b = load_base;
            let value = b
                .wrapping_add(if entry.addend != 0 { entry.addend } else { addend_at_target } as u32);
            mem.write(target, &value.to_le_bytes())?;
            Ok(())
        }

        R_386_GOTOFF => {
            let s = symbol_value(resolver)?;
            let g = got_base.unwrap_or(0);
            let value = s.wrapping_add(entry.addend as u32).wrapping_sub(g);
            mem.write(target, &value.to_le_bytes())?;
            Ok(())
        }

        R_386_GOTPC => {
            let g = got_base.unwrap_or(0);
            let value = g.wrapping_add(entry.addend as u32).wrapping_sub(target);
            mem.write(target, &value.to_le_bytes())?;
            Ok(())
        }

        R_386_16 => {
            let value = symbol_value(resolver)?.wrapping_add(entry.addend as u32);
            mem.write(target, &(value as u16).to_le_bytes())?;
            Ok(())
        }

        R_386_PC16 => {
            let s = symbol_value(resolver)?;
            let value = s.wrapping_add(entry.addend as u32).wrapping_sub(target);
            mem.write(target, &(value as u16).to_le_bytes())?;
            Ok(())
        }

        R_386_8 => {
            let value = symbol_value(resolver)?.wrapping_add(entry.addend as u32);
            mem.write(target, &[value as u8])?;
            Ok(())
        }

        R_386_PC8 => {
            let s = symbol_value(resolver)?;
            let value = s.wrapping_add(entry.addend as u32).wrapping_sub(target);
            mem.write(target, &[value as u8])?;
            Ok(())
        }

        other => Err(RelocError::UnsupportedRelocation(other)),
    }
}

fn read_implicit_addend(mem: &AddressSpace, target: GuestAddress) -> RelocResult<i32> {
    let buf = mem.read(target, 4)?;
    Ok(i32::from_le_bytes(buf.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvm_memory::{Protection, RegionKind, MIN_MEMORY_SIZE};

    fn image_with_one_region(size: u32) -> AddressSpace {
        let mut mem = AddressSpace::new(MIN_MEMORY_SIZE).unwrap();
        mem.register_region(0x1000, size, RegionKind::Data, Protection::READ | Protection::WRITE, "image")
            .unwrap();
        mem
    }

    #[test]
    fn relative_relocation_adds_load_base() {
        let mut mem = image_with_one_region(0x1000);
        // implicit addend of 0x20 sitting at the relocation target
        mem.write(0x1000, &0x20u32.to_le_bytes()).unwrap();

        let rel = [RelEntry { offset: 0, info: R_386_RELATIVE }];
        let report = apply_relocations(&mut mem, &[], &rel, &[], 0, 0x1000, None, &mut NullResolver);

        assert!(report.succeeded());
        assert_eq!(report.applied, 1);
        let buf = mem.read(0x1000, 4).unwrap();
        assert_eq!(u32::from_le_bytes(buf.try_into().unwrap()), 0x1000 + 0x20);
    }

    #[test]
    fn undefined_required_symbol_is_a_hard_failure_but_does_not_abort_the_pass() {
        let mut mem = image_with_one_region(0x2000);
        let symbols = [Symbol {
            name: "missing_fn".to_string(),
            value: 0,
            size: 0,
            info: (Symbol::STB_GLOBAL << 4) | 2,
            other: 0,
            shndx: 0,
        }];
        // second entry targets a different word and should still apply even
        // though the first entry hard-fails
        let rela = [
            RelaEntry { offset: 0, info: R_386_32, addend: 0 },
            RelaEntry { offset: 4, info: R_386_RELATIVE, addend: 0x10 },
        ];
        let report = apply_relocations(&mut mem, &symbols, &[], &rela, 0, 0x1000, None, &mut NullResolver);

        assert!(!report.succeeded());
        assert_eq!(report.hard_failures, 1);
        assert_eq!(report.applied, 1);
        let buf = mem.read(0x1004, 4).unwrap();
        assert_eq!(u32::from_le_bytes(buf.try_into().unwrap()), 0x1000 + 0x10);
    }

    #[test]
    fn weak_undefined_symbol_resolves_to_zero_without_failing() {
        let mut mem = image_with_one_region(0x1000);
        let symbols = [Symbol {
            name: "weak_fn".to_string(),
            value: 0,
            size: 0,
            info: (Symbol::STB_WEAK << 4) | 2,
            other: 0,
            shndx: 0,
        }];
        let rela = [RelaEntry { offset: 0, info: R_386_32, addend: 0 }];
        let report = apply_relocations(&mut mem, &symbols, &[], &rela, 0, 0x1000, None, &mut NullResolver);
        assert!(report.succeeded());
        assert_eq!(report.applied, 1);
        let buf = mem.read(0x1000, 4).unwrap();
        assert_eq!(u32::from_le_bytes(buf.try_into().unwrap()), 0);
    }
}
