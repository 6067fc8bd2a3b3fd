//! ELF32 image parsing and x86 relocation processing. Knows nothing about
//! where an image gets placed in a guest address space or how segments are
//! mapped in — that is [`uvm_loader`]'s job.

pub mod image;
pub mod reloc;

pub use image::{
    DynEntry, ElfError, ElfHeader, ElfImage, ProgramHeader, RelEntry, RelaEntry, SectionHeader,
    Symbol,
};
pub use reloc::{apply_relocations, NullResolver, RelocError, RelocReport, SymbolResolver};
