//! Architectural state for one guest thread: general-purpose registers,
//! `EIP`, `EFLAGS`, and the segment selectors.

use uvm_memory::GuestAddress;

use crate::flags::{Flags, RESERVED_BIT};

/// 3-bit general-purpose register index, matching the x86 ModR/M encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    /// Decode a 3-bit ModR/M register field.
    pub fn from_index(idx: u8) -> Self {
        match idx & 0b111 {
            0 => Gpr::Eax,
            1 => Gpr::Ecx,
            2 => Gpr::Edx,
            3 => Gpr::Ebx,
            4 => Gpr::Esp,
            5 => Gpr::Ebp,
            6 => Gpr::Esi,
            _ => Gpr::Edi,
        }
    }
}

/// The six x86 segment selectors. Stored but otherwise unused by the core:
/// full protected-mode descriptor lookup is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Segment {
    Cs = 0,
    Ds = 1,
    Es = 2,
    Fs = 3,
    Gs = 4,
    Ss = 5,
}

/// The 8 GPRs, EIP, EFLAGS, and segment selectors of one guest thread.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    gpr: [u32; 8],
    eip: GuestAddress,
    eflags: u32,
    segments: [u16; 6],
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            gpr: [0; 8],
            eip: 0,
            eflags: RESERVED_BIT,
            segments: [0; 6],
        }
    }
}

impl RegisterFile {
    /// A zeroed register file with only `EFLAGS`'s reserved bit set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a full 32-bit GPR.
    pub fn get_r32(&self, r: Gpr) -> u32 {
        self.gpr[r as usize]
    }

    /// Overwrite a full 32-bit GPR.
    pub fn set_r32(&mut self, r: Gpr, value: u32) {
        self.gpr[r as usize] = value;
    }

    /// Read the low 16 bits of a GPR (e.g. `AX` from `EAX`).
    pub fn get_r16(&self, r: Gpr) -> u16 {
        self.gpr[r as usize] as u16
    }

    /// Write the low 16 bits of a GPR, leaving bits 16..32 untouched —
    /// x86 sub-register writes never zero-extend into the parent register.
    pub fn set_r16(&mut self, r: Gpr, value: u16) {
        let slot = &mut self.gpr[r as usize];
        *slot = (*slot & 0xFFFF_0000) | value as u32;
    }

    /// Read an 8-bit sub-register. `index` 0..=3 selects `AL/CL/DL/BL`;
    /// `index` 4..=7 selects `AH/CH/DH/BH` (high byte of the low word of
    /// `EAX/ECX/EDX/EBX`).
    pub fn get_r8(&self, index: u8) -> u8 {
        let low = index < 4;
        let gpr = Gpr::from_index(index & 0b011);
        let value = self.gpr[gpr as usize];
        if low {
            value as u8
        } else {
            (value >> 8) as u8
        }
    }

    /// Write an 8-bit sub-register with the same addressing as [`get_r8`](Self::get_r8).
    /// Leaves every other bit of the parent register untouched.
    pub fn set_r8(&mut self, index: u8, value: u8) {
        let low = index < 4;
        let gpr = Gpr::from_index(index & 0b011);
        let slot = &mut self.gpr[gpr as usize];
        if low {
            *slot = (*slot & 0xFFFF_FF00) | value as u32;
        } else {
            *slot = (*slot & 0xFFFF_00FF) | ((value as u32) << 8);
        }
    }

    /// Current instruction pointer.
    pub fn eip(&self) -> GuestAddress {
        self.eip
    }

    /// Set the instruction pointer (the decode/execute loop's next-fetch address).
    pub fn set_eip(&mut self, value: GuestAddress) {
        self.eip = value;
    }

    /// Raw 32-bit EFLAGS, including bits the engine does not interpret.
    pub fn eflags_raw(&self) -> u32 {
        self.eflags
    }

    /// Overwrite the raw 32-bit EFLAGS (used by `POPF`).
    pub fn set_eflags_raw(&mut self, value: u32) {
        self.eflags = value | RESERVED_BIT;
    }

    /// Read one maintained flag.
    pub fn get_flag(&self, flag: Flags) -> bool {
        Flags::from_bits_truncate(self.eflags).contains(flag)
    }

    /// Set or clear one maintained flag, leaving all other bits unchanged.
    pub fn set_flag(&mut self, flag: Flags, value: bool) {
        let mut bits = Flags::from_bits_truncate(self.eflags);
        bits.set(flag, value);
        self.eflags = (self.eflags & !Flags::all().bits()) | bits.bits();
    }

    /// Segment selector value.
    pub fn get_segment(&self, seg: Segment) -> u16 {
        self.segments[seg as usize]
    }

    /// Set a segment selector value.
    pub fn set_segment(&mut self, seg: Segment, value: u16) {
        self.segments[seg as usize] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_register_file_has_reserved_bit_set() {
        let regs = RegisterFile::new();
        assert_eq!(regs.eflags_raw(), RESERVED_BIT);
    }

    #[test]
    fn sub_register_writes_do_not_zero_extend() {
        let mut regs = RegisterFile::new();
        regs.set_r32(Gpr::Eax, 0xAABBCCDD);
        regs.set_r8(0, 0x11); // AL
        assert_eq!(regs.get_r32(Gpr::Eax), 0xAABBCC11);
        regs.set_r8(4, 0x22); // AH
        assert_eq!(regs.get_r32(Gpr::Eax), 0xAABB2211);
        regs.set_r16(Gpr::Eax, 0x3344);
        assert_eq!(regs.get_r32(Gpr::Eax), 0xAABB3344);
    }

    #[test]
    fn flag_accessors_round_trip_independently() {
        let mut regs = RegisterFile::new();
        regs.set_flag(Flags::ZF, true);
        regs.set_flag(Flags::CF, true);
        assert!(regs.get_flag(Flags::ZF));
        assert!(regs.get_flag(Flags::CF));
        assert!(!regs.get_flag(Flags::SF));
        regs.set_flag(Flags::ZF, false);
        assert!(!regs.get_flag(Flags::ZF));
        assert!(regs.get_flag(Flags::CF));
    }

    #[test]
    fn eflags_round_trips_unmaintained_bits_through_pushf_popf() {
        let mut regs = RegisterFile::new();
        regs.set_eflags_raw(0xFFFF_FFFF);
        let saved = regs.eflags_raw();
        regs.set_flag(Flags::ZF, false);
        regs.set_eflags_raw(saved);
        assert_eq!(regs.eflags_raw(), 0xFFFF_FFFF);
    }
}
