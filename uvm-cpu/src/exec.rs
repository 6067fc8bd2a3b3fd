//! Execution engine: given a decoded instruction, updates registers, flags,
//! and memory, then advances `EIP`.
//!
//! `step` is the only entry point and executes exactly one instruction (or
//! one iteration of a `REP`-prefixed string op). It never loops internally —
//! the run loop belongs to the caller, which is what makes cancellation and
//! breakpoints between instructions possible.

use uvm_memory::{AddressSpace, MemoryError, Protection};

use crate::decode::{
    decode, Condition, DecodeError, DecodedInstruction, EffectiveAddress, Mnemonic, Operand,
    RepMode, Width,
};
use crate::flags::Flags;
use crate::regs::{Gpr, RegisterFile};

use uvm_memory::GuestAddress;

/// Why the engine stopped at a synthetic trap (`INT`, `IN`/`OUT`/`INS`/`OUTS`).
/// The caller (the syscall dispatch seam) decides what happens next; the
/// engine itself has already advanced `EIP` past the trapping instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// `INT n` — the immediate is the interrupt/syscall vector.
    Interrupt(u8),
    /// Port I/O, synthesised as a call into the dispatch seam. `port` is the
    /// immediate or `DX` value used to address the I/O space.
    PortIo(PortOp),
}

/// The specific port-I/O instruction that trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOp {
    In,
    Out,
    Ins,
    Outs,
}

/// A faulting condition the engine cannot recover from on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// Decoder could not parse the bytes at `eip`.
    InvalidInstruction { eip: GuestAddress, bytes: Vec<u8> },
    /// Integer division by zero, or a signed divide overflow (`INT32_MIN / -1`).
    DivideByZero { eip: GuestAddress },
    /// A stack push/pop touched an address outside any readable/writable region.
    StackFault { eip: GuestAddress },
    /// A non-stack memory access touched no registered region.
    BadAddress { addr: GuestAddress, len: usize },
    /// A non-stack memory access was denied by region protection.
    Protection {
        addr: GuestAddress,
        len: usize,
        required: Protection,
    },
}

/// Result of one [`step`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The instruction completed; the caller may step again.
    Continue,
    /// `HLT` executed; the run is over.
    Halted,
    /// A synchronous trap to the syscall dispatch seam.
    Trap(Trap),
    /// The instruction faulted; `EIP` in the fault payload is the address of
    /// the faulting instruction, not the (possibly further) advanced `EIP`
    /// left in the register file.
    Faulted(FaultKind),
}

fn decode_err_to_fault(err: DecodeError) -> FaultKind {
    match err {
        DecodeError::InvalidOpcode { eip, bytes } => FaultKind::InvalidInstruction { eip, bytes },
        DecodeError::TooLong { eip }
        | DecodeError::ReservedModRm { eip }
        | DecodeError::Truncated { eip } => FaultKind::InvalidInstruction { eip, bytes: Vec::new() },
    }
}

fn mem_err_to_fault(e: MemoryError) -> FaultKind {
    match e {
        MemoryError::BadAddress { addr, len } => FaultKind::BadAddress { addr, len },
        MemoryError::Protection { addr, len, required } => FaultKind::Protection { addr, len, required },
        other => {
            // read/write only ever surface BadAddress or Protection; this is
            // a defensive fallback should that invariant ever change.
            log::warn!("unexpected memory error surfaced from read/write: {other}");
            FaultKind::BadAddress { addr: 0, len: 0 }
        }
    }
}

fn mem_err_to_stack_fault(eip: GuestAddress) -> impl Fn(MemoryError) -> FaultKind {
    move |_| FaultKind::StackFault { eip }
}

/// Fetch up to 15 bytes at `eip`, shrinking the request until it fits inside
/// one region. Fails only when not even one byte at `eip` is readable.
fn fetch_bytes(mem: &AddressSpace, eip: GuestAddress) -> Result<Vec<u8>, FaultKind> {
    for len in (1..=15usize).rev() {
        if let Ok(bytes) = mem.read(eip, len) {
            return Ok(bytes);
        }
    }
    Err(FaultKind::BadAddress { addr: eip, len: 1 })
}

fn effective_address(regs: &RegisterFile, addr: &EffectiveAddress) -> GuestAddress {
    let mut result = addr.disp as u32;
    if let Some(base) = addr.base {
        result = result.wrapping_add(regs.get_r32(base));
    }
    if let Some((index, scale)) = addr.index {
        result = result.wrapping_add(regs.get_r32(index).wrapping_mul(scale as u32));
    }
    result
}

fn bytes_to_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf[..bytes.len()].copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn read_operand(op: Operand, regs: &RegisterFile, mem: &AddressSpace) -> Result<u32, FaultKind> {
    match op {
        Operand::Register { width, index } => Ok(match width {
            Width::Byte => regs.get_r8(index) as u32,
            Width::Word => regs.get_r16(Gpr::from_index(index)) as u32,
            Width::Dword => regs.get_r32(Gpr::from_index(index)),
        }),
        Operand::Memory { addr, width } => {
            let ea = effective_address(regs, &addr);
            let bytes = mem.read(ea, width.bytes() as usize).map_err(mem_err_to_fault)?;
            Ok(bytes_to_u32(&bytes))
        }
        Operand::Immediate { value, width } => Ok((value as u64 as u32) & width.mask()),
        Operand::Relative { target } => Ok(target),
    }
}

fn write_operand(
    op: Operand,
    value: u32,
    regs: &mut RegisterFile,
    mem: &mut AddressSpace,
) -> Result<(), FaultKind> {
    match op {
        Operand::Register { width, index } => {
            match width {
                Width::Byte => regs.set_r8(index, value as u8),
                Width::Word => regs.set_r16(Gpr::from_index(index), value as u16),
                Width::Dword => regs.set_r32(Gpr::from_index(index), value),
            }
            Ok(())
        }
        Operand::Memory { addr, width } => {
            let ea = effective_address(regs, &addr);
            let bytes = value.to_le_bytes();
            mem.write(ea, &bytes[..width.bytes() as usize]).map_err(mem_err_to_fault)
        }
        Operand::Immediate { .. } | Operand::Relative { .. } => {
            unreachable!("decoder never emits an immediate or relative operand as a write destination")
        }
    }
}

fn operand_width(op: Operand) -> Width {
    match op {
        Operand::Register { width, .. } => width,
        Operand::Memory { width, .. } => width,
        Operand::Immediate { width, .. } => width,
        Operand::Relative { .. } => Width::Dword,
    }
}

fn sign_bit(value: u32, width: Width) -> bool {
    (value >> (width.bits() - 1)) & 1 == 1
}

fn set_result_flags(regs: &mut RegisterFile, result: u32, width: Width) {
    let masked = result & width.mask();
    regs.set_flag(Flags::ZF, masked == 0);
    regs.set_flag(Flags::SF, sign_bit(masked, width));
    regs.set_flag(Flags::PF, Flags::parity_of(masked));
}

/// `ADD`/`ADC`: result, CF (unsigned overflow), OF (signed overflow).
fn add_with_carry(a: u32, b: u32, carry_in: u32, width: Width) -> (u32, bool, bool) {
    let mask = width.mask() as u64;
    let sum = a as u64 + b as u64 + carry_in as u64;
    let result = (sum & mask) as u32;
    let cf = sum > mask;
    let of = (sign_bit(a, width) == sign_bit(b, width)) && (sign_bit(result, width) != sign_bit(a, width));
    (result, cf, of)
}

/// `SUB`/`SBB`/`CMP`: result, CF (unsigned borrow), OF (signed overflow).
fn sub_with_borrow(a: u32, b: u32, borrow_in: u32, width: Width) -> (u32, bool, bool) {
    let mask = width.mask();
    let full = (a as i64) - (b as i64) - (borrow_in as i64);
    let result = (full & mask as i64) as u32 & mask;
    let cf = (b as u64 + borrow_in as u64) > a as u64;
    let of = (sign_bit(a, width) != sign_bit(b, width)) && (sign_bit(result, width) != sign_bit(a, width));
    (result, cf, of)
}

fn eval_condition(cond: Condition, regs: &RegisterFile) -> bool {
    let cf = regs.get_flag(Flags::CF);
    let zf = regs.get_flag(Flags::ZF);
    let sf = regs.get_flag(Flags::SF);
    let of = regs.get_flag(Flags::OF);
    let pf = regs.get_flag(Flags::PF);
    match cond {
        Condition::O => of,
        Condition::No => !of,
        Condition::B => cf,
        Condition::Ae => !cf,
        Condition::E => zf,
        Condition::Ne => !zf,
        Condition::Be => cf || zf,
        Condition::A => !cf && !zf,
        Condition::S => sf,
        Condition::Ns => !sf,
        Condition::P => pf,
        Condition::Np => !pf,
        Condition::L => sf != of,
        Condition::Ge => sf == of,
        Condition::Le => zf || (sf != of),
        Condition::G => !zf && (sf == of),
    }
}

enum Flow {
    Continue,
    Halt,
    Trap(Trap),
}

/// Execute exactly one instruction at the current `EIP`.
pub fn step(regs: &mut RegisterFile, mem: &mut AddressSpace) -> StepOutcome {
    let eip = regs.eip();
    let bytes = match fetch_bytes(mem, eip) {
        Ok(b) => b,
        Err(f) => return StepOutcome::Faulted(f),
    };
    let insn = match decode(&bytes, eip) {
        Ok(i) => i,
        Err(e) => return StepOutcome::Faulted(decode_err_to_fault(e)),
    };
    let next_eip = eip.wrapping_add(insn.length as u32);
    regs.set_eip(next_eip);

    match execute(&insn, next_eip, regs, mem) {
        Ok(Flow::Continue) => StepOutcome::Continue,
        Ok(Flow::Halt) => StepOutcome::Halted,
        Ok(Flow::Trap(t)) => StepOutcome::Trap(t),
        Err(f) => StepOutcome::Faulted(f),
    }
}

fn execute(
    insn: &DecodedInstruction,
    next_eip: GuestAddress,
    regs: &mut RegisterFile,
    mem: &mut AddressSpace,
) -> Result<Flow, FaultKind> {
    let eip = insn.eip;
    let ops = &insn.operands;

    match insn.mnemonic {
        Mnemonic::Add | Mnemonic::Adc | Mnemonic::Sub | Mnemonic::Sbb | Mnemonic::Cmp => {
            let width = operand_width(ops[0]);
            let a = read_operand(ops[0], regs, mem)?;
            let b = read_operand(ops[1], regs, mem)?;
            let carry_in = if matches!(insn.mnemonic, Mnemonic::Adc | Mnemonic::Sbb) {
                regs.get_flag(Flags::CF) as u32
            } else {
                0
            };
            let (result, cf, of) = match insn.mnemonic {
                Mnemonic::Add | Mnemonic::Adc => add_with_carry(a, b, carry_in, width),
                _ => sub_with_borrow(a, b, carry_in, width),
            };
            set_result_flags(regs, result, width);
            regs.set_flag(Flags::CF, cf);
            regs.set_flag(Flags::OF, of);
            if !matches!(insn.mnemonic, Mnemonic::Cmp) {
                write_operand(ops[0], result, regs, mem)?;
            }
            Ok(Flow::Continue)
        }
        Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Test => {
            let width = operand_width(ops[0]);
            let a = read_operand(ops[0], regs, mem)?;
            let b = read_operand(ops[1], regs, mem)?;
            let result = match insn.mnemonic {
                Mnemonic::And | Mnemonic::Test => a & b,
                Mnemonic::Or => a | b,
                _ => a ^ b,
            };
            set_result_flags(regs, result, width);
            regs.set_flag(Flags::CF, false);
            regs.set_flag(Flags::OF, false);
            if !matches!(insn.mnemonic, Mnemonic::Test) {
                write_operand(ops[0], result, regs, mem)?;
            }
            Ok(Flow::Continue)
        }
        Mnemonic::Not => {
            let width = operand_width(ops[0]);
            let a = read_operand(ops[0], regs, mem)?;
            write_operand(ops[0], (!a) & width.mask(), regs, mem)?;
            Ok(Flow::Continue)
        }
        Mnemonic::Neg => {
            let width = operand_width(ops[0]);
            let a = read_operand(ops[0], regs, mem)?;
            let (result, cf, of) = sub_with_borrow(0, a, 0, width);
            set_result_flags(regs, result, width);
            regs.set_flag(Flags::CF, a != 0 || cf);
            regs.set_flag(Flags::OF, of);
            write_operand(ops[0], result, regs, mem)?;
            Ok(Flow::Continue)
        }
        Mnemonic::Inc | Mnemonic::Dec => {
            let width = operand_width(ops[0]);
            let a = read_operand(ops[0], regs, mem)?;
            let (result, _cf, of) = if matches!(insn.mnemonic, Mnemonic::Inc) {
                add_with_carry(a, 1, 0, width)
            } else {
                sub_with_borrow(a, 1, 0, width)
            };
            set_result_flags(regs, result, width);
            regs.set_flag(Flags::OF, of);
            write_operand(ops[0], result, regs, mem)?;
            Ok(Flow::Continue)
        }
        Mnemonic::Mul | Mnemonic::Imul => {
            let width = operand_width(ops[0]);
            let src = read_operand(ops[0], regs, mem)?;
            let acc = read_operand(Operand::Register { width, index: 0 }, regs, mem)?;
            let (lo, hi, overflow) = if matches!(insn.mnemonic, Mnemonic::Mul) {
                let product = acc as u64 * src as u64;
                let mask = width.mask() as u64;
                let lo = (product & mask) as u32;
                let hi = ((product >> width.bits()) & mask) as u32;
                (lo, hi, hi != 0)
            } else {
                let sign_extend = |v: u32| -> i64 {
                    if sign_bit(v, width) {
                        (v as i64) | !(width.mask() as i64)
                    } else {
                        v as i64
                    }
                };
                let product = sign_extend(acc) * sign_extend(src);
                let mask = width.mask() as i64;
                let lo = (product & mask) as u32;
                let hi = ((product >> width.bits()) & mask) as u32;
                let sign_extended_lo = sign_extend(lo) == product;
                (lo, hi, !sign_extended_lo)
            };
            write_operand(Operand::Register { width, index: 0 }, lo, regs, mem)?;
            if width == Width::Byte {
                regs.set_r16(Gpr::Eax, ((hi as u16) << 8) | (lo as u16 & 0xFF));
            } else {
                let hi_index = 2; // EDX/DX
                write_operand(Operand::Register { width, index: hi_index }, hi, regs, mem)?;
            }
            regs.set_flag(Flags::CF, overflow);
            regs.set_flag(Flags::OF, overflow);
            Ok(Flow::Continue)
        }
        Mnemonic::Div | Mnemonic::Idiv => {
            let width = operand_width(ops[0]);
            let divisor = read_operand(ops[0], regs, mem)?;
            if divisor == 0 {
                return Err(FaultKind::DivideByZero { eip });
            }
            let lo = read_operand(Operand::Register { width, index: 0 }, regs, mem)?;
            let result = if matches!(insn.mnemonic, Mnemonic::Div) {
                let hi = if width == Width::Byte {
                    (regs.get_r16(Gpr::Eax) >> 8) as u64
                } else {
                    read_operand(Operand::Register { width, index: 2 }, regs, mem)? as u64
                };
                let dividend = (hi << width.bits()) | lo as u64;
                let divisor = divisor as u64;
                let quotient = dividend / divisor;
                if quotient > width.mask() as u64 {
                    return Err(FaultKind::DivideByZero { eip });
                }
                (quotient as u32, (dividend % divisor) as u32)
            } else {
                let hi = if width == Width::Byte {
                    ((regs.get_r16(Gpr::Eax) as i16) >> 8) as i64
                } else {
                    read_operand(Operand::Register { width, index: 2 }, regs, mem)? as i32 as i64
                };
                let dividend = (hi << width.bits()) | lo as i64;
                let divisor_signed = divisor as i32 as i64;
                if divisor_signed == -1 && dividend == i32::MIN as i64 && width == Width::Dword {
                    return Err(FaultKind::DivideByZero { eip });
                }
                let quotient = dividend / divisor_signed;
                let remainder = dividend % divisor_signed;
                let qmax = (width.mask() >> 1) as i64;
                if quotient > qmax || quotient < -(qmax + 1) {
                    return Err(FaultKind::DivideByZero { eip });
                }
                (quotient as u32 & width.mask(), remainder as u32 & width.mask())
            };
            let (quotient, remainder) = result;
            if width == Width::Byte {
                regs.set_r16(Gpr::Eax, ((remainder as u16) << 8) | (quotient as u16 & 0xFF));
            } else {
                write_operand(Operand::Register { width, index: 0 }, quotient, regs, mem)?;
                write_operand(Operand::Register { width, index: 2 }, remainder, regs, mem)?;
            }
            Ok(Flow::Continue)
        }
        Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar | Mnemonic::Rol | Mnemonic::Ror | Mnemonic::Rcl
        | Mnemonic::Rcr => {
            let width = operand_width(ops[0]);
            let count = (read_operand(ops[1], regs, mem)? & 0x1F) as u32;
            let a = read_operand(ops[0], regs, mem)?;
            let (result, cf, of) = shift_like(insn.mnemonic, a, count, width, regs.get_flag(Flags::CF));
            if count != 0 {
                set_result_flags(regs, result, width);
                regs.set_flag(Flags::CF, cf);
                if count == 1 {
                    regs.set_flag(Flags::OF, of);
                }
                write_operand(ops[0], result, regs, mem)?;
            }
            Ok(Flow::Continue)
        }
        Mnemonic::Shld | Mnemonic::Shrd => {
            let width = operand_width(ops[0]);
            let dst = read_operand(ops[0], regs, mem)?;
            let fill = read_operand(ops[1], regs, mem)?;
            let count = (read_operand(ops[2], regs, mem)? & 0x1F) as u32;
            if count == 0 {
                return Ok(Flow::Continue);
            }
            let bits = width.bits();
            let (result, cf) = if matches!(insn.mnemonic, Mnemonic::Shld) {
                let combined = ((dst as u64) << bits) | fill as u64;
                let shifted = combined << count;
                let cf = ((combined >> (2 * bits - count)) & 1) != 0;
                (((shifted >> bits) & width.mask() as u64) as u32, cf)
            } else {
                let combined = ((fill as u64) << bits) | dst as u64;
                let cf = ((combined >> (count - 1)) & 1) != 0;
                (((combined >> count) & width.mask() as u64) as u32, cf)
            };
            set_result_flags(regs, result, width);
            regs.set_flag(Flags::CF, cf);
            write_operand(ops[0], result, regs, mem)?;
            Ok(Flow::Continue)
        }
        Mnemonic::Mov => {
            let value = read_operand(ops[1], regs, mem)?;
            write_operand(ops[0], value, regs, mem)?;
            Ok(Flow::Continue)
        }
        Mnemonic::Movzx => {
            let value = read_operand(ops[1], regs, mem)?;
            write_operand(ops[0], value, regs, mem)?;
            Ok(Flow::Continue)
        }
        Mnemonic::Movsx => {
            let src_width = operand_width(ops[1]);
            let value = read_operand(ops[1], regs, mem)?;
            let extended = if sign_bit(value, src_width) {
                value | !src_width.mask()
            } else {
                value
            };
            write_operand(ops[0], extended, regs, mem)?;
            Ok(Flow::Continue)
        }
        Mnemonic::Lea => {
            if let Operand::Memory { addr, .. } = ops[1] {
                let ea = effective_address(regs, &addr);
                write_operand(ops[0], ea, regs, mem)?;
            }
            Ok(Flow::Continue)
        }
        Mnemonic::Xchg => {
            let a = read_operand(ops[0], regs, mem)?;
            let b = read_operand(ops[1], regs, mem)?;
            write_operand(ops[0], b, regs, mem)?;
            write_operand(ops[1], a, regs, mem)?;
            Ok(Flow::Continue)
        }
        Mnemonic::Push => {
            let width = operand_width(ops[0]);
            let value = read_operand(ops[0], regs, mem)?;
            push(regs, mem, value, width, eip)?;
            Ok(Flow::Continue)
        }
        Mnemonic::Pop => {
            let width = operand_width(ops[0]);
            let value = pop(regs, mem, width, eip)?;
            write_operand(ops[0], value, regs, mem)?;
            Ok(Flow::Continue)
        }
        Mnemonic::Pushad => {
            let order = [
                Gpr::Eax, Gpr::Ecx, Gpr::Edx, Gpr::Ebx, Gpr::Esp, Gpr::Ebp, Gpr::Esi, Gpr::Edi,
            ];
            let esp_before = regs.get_r32(Gpr::Esp);
            for r in order {
                let v = if r == Gpr::Esp { esp_before } else { regs.get_r32(r) };
                push(regs, mem, v, Width::Dword, eip)?;
            }
            Ok(Flow::Continue)
        }
        Mnemonic::Popad => {
            let order = [
                Gpr::Edi, Gpr::Esi, Gpr::Ebp, Gpr::Esp, Gpr::Ebx, Gpr::Edx, Gpr::Ecx, Gpr::Eax,
            ];
            for r in order {
                let v = pop(regs, mem, Width::Dword, eip)?;
                if r != Gpr::Esp {
                    regs.set_r32(r, v);
                }
            }
            Ok(Flow::Continue)
        }
        Mnemonic::Pushf => {
            push(regs, mem, regs.eflags_raw(), Width::Dword, eip)?;
            Ok(Flow::Continue)
        }
        Mnemonic::Popf => {
            let value = pop(regs, mem, Width::Dword, eip)?;
            regs.set_eflags_raw(value);
            Ok(Flow::Continue)
        }
        Mnemonic::Cbw => {
            let al = regs.get_r8(0) as i8 as i16 as u16;
            regs.set_r16(Gpr::Eax, al);
            Ok(Flow::Continue)
        }
        Mnemonic::Cwde => {
            let ax = regs.get_r16(Gpr::Eax) as i16 as i32 as u32;
            regs.set_r32(Gpr::Eax, ax);
            Ok(Flow::Continue)
        }
        Mnemonic::Cwd => {
            let ax = regs.get_r16(Gpr::Eax) as i16;
            regs.set_r16(Gpr::Edx, if ax < 0 { 0xFFFF } else { 0 });
            Ok(Flow::Continue)
        }
        Mnemonic::Cdq => {
            let eax = regs.get_r32(Gpr::Eax) as i32;
            regs.set_r32(Gpr::Edx, if eax < 0 { 0xFFFF_FFFF } else { 0 });
            Ok(Flow::Continue)
        }
        Mnemonic::Jmp => {
            let target = read_operand(ops[0], regs, mem)?;
            regs.set_eip(target);
            Ok(Flow::Continue)
        }
        Mnemonic::Jcc(cond) => {
            if eval_condition(cond, regs) {
                let target = read_operand(ops[0], regs, mem)?;
                regs.set_eip(target);
            }
            Ok(Flow::Continue)
        }
        Mnemonic::Call => {
            let target = read_operand(ops[0], regs, mem)?;
            push(regs, mem, next_eip, Width::Dword, eip)?;
            regs.set_eip(target);
            Ok(Flow::Continue)
        }
        Mnemonic::Ret => {
            let target = pop(regs, mem, Width::Dword, eip)?;
            regs.set_eip(target);
            Ok(Flow::Continue)
        }
        Mnemonic::RetImm => {
            let target = pop(regs, mem, Width::Dword, eip)?;
            let extra = read_operand(ops[0], regs, mem)?;
            regs.set_r32(Gpr::Esp, regs.get_r32(Gpr::Esp).wrapping_add(extra));
            regs.set_eip(target);
            Ok(Flow::Continue)
        }
        Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne => {
            let ecx = regs.get_r32(Gpr::Ecx).wrapping_sub(1);
            regs.set_r32(Gpr::Ecx, ecx);
            let zf = regs.get_flag(Flags::ZF);
            let take = match insn.mnemonic {
                Mnemonic::Loop => ecx != 0,
                Mnemonic::Loope => ecx != 0 && zf,
                _ => ecx != 0 && !zf,
            };
            if take {
                let target = read_operand(ops[0], regs, mem)?;
                regs.set_eip(target);
            }
            Ok(Flow::Continue)
        }
        Mnemonic::Jecxz => {
            if regs.get_r32(Gpr::Ecx) == 0 {
                let target = read_operand(ops[0], regs, mem)?;
                regs.set_eip(target);
            }
            Ok(Flow::Continue)
        }
        Mnemonic::Cmovcc(cond) => {
            if eval_condition(cond, regs) {
                let value = read_operand(ops[1], regs, mem)?;
                write_operand(ops[0], value, regs, mem)?;
            }
            Ok(Flow::Continue)
        }
        Mnemonic::Setcc(cond) => {
            let value = eval_condition(cond, regs) as u32;
            write_operand(ops[0], value, regs, mem)?;
            Ok(Flow::Continue)
        }
        Mnemonic::Bt | Mnemonic::Bts | Mnemonic::Btr | Mnemonic::Btc => {
            let width = operand_width(ops[0]);
            let bit_index = read_operand(ops[1], regs, mem)? % width.bits();
            let a = read_operand(ops[0], regs, mem)?;
            let bit = (a >> bit_index) & 1;
            regs.set_flag(Flags::CF, bit != 0);
            let result = match insn.mnemonic {
                Mnemonic::Bt => a,
                Mnemonic::Bts => a | (1 << bit_index),
                Mnemonic::Btr => a & !(1 << bit_index),
                _ => a ^ (1 << bit_index),
            };
            if !matches!(insn.mnemonic, Mnemonic::Bt) {
                write_operand(ops[0], result, regs, mem)?;
            }
            Ok(Flow::Continue)
        }
        Mnemonic::Bsf | Mnemonic::Bsr => {
            let src = read_operand(ops[1], regs, mem)?;
            if src == 0 {
                regs.set_flag(Flags::ZF, true);
            } else {
                regs.set_flag(Flags::ZF, false);
                // `src` is zero-extended within the full 32-bit word by
                // `read_operand`, so the bit index is width-independent.
                let index = if matches!(insn.mnemonic, Mnemonic::Bsf) {
                    src.trailing_zeros()
                } else {
                    31 - src.leading_zeros()
                };
                write_operand(ops[0], index, regs, mem)?;
            }
            Ok(Flow::Continue)
        }
        Mnemonic::Movs | Mnemonic::Cmps | Mnemonic::Scas | Mnemonic::Lods | Mnemonic::Stos => {
            execute_string_op(insn, eip, next_eip, regs, mem)
        }
        Mnemonic::In | Mnemonic::Ins => Ok(Flow::Trap(Trap::PortIo(if matches!(insn.mnemonic, Mnemonic::In) {
            PortOp::In
        } else {
            PortOp::Ins
        }))),
        Mnemonic::Out | Mnemonic::Outs => Ok(Flow::Trap(Trap::PortIo(if matches!(insn.mnemonic, Mnemonic::Out) {
            PortOp::Out
        } else {
            PortOp::Outs
        }))),
        Mnemonic::Int => {
            let vector = read_operand(ops[0], regs, mem)? as u8;
            Ok(Flow::Trap(Trap::Interrupt(vector)))
        }
        Mnemonic::Hlt => Ok(Flow::Halt),
    }
}

fn shift_like(mnemonic: Mnemonic, value: u32, count: u32, width: Width, cf_in: bool) -> (u32, bool, bool) {
    if count == 0 {
        return (value & width.mask(), cf_in, false);
    }
    let bits = width.bits();
    let v = value & width.mask();
    match mnemonic {
        Mnemonic::Shl => {
            let result = (v << count) & width.mask();
            let cf = count <= bits && ((v >> (bits - count.min(bits))) & 1) != 0;
            let of = sign_bit(result, width) != ((v >> (bits - 1)) & 1 != 0);
            (result, cf, of)
        }
        Mnemonic::Shr => {
            let cf = ((v >> (count - 1)) & 1) != 0;
            let result = v >> count;
            let of = sign_bit(v, width);
            (result, cf, of)
        }
        Mnemonic::Sar => {
            let signed = sign_extend_to_i32(v, width);
            let result = ((signed >> count) as u32) & width.mask();
            let cf = ((v >> (count - 1)) & 1) != 0;
            (result, cf, false)
        }
        Mnemonic::Rol => {
            let n = count % bits;
            let result = if n == 0 { v } else { ((v << n) | (v >> (bits - n))) & width.mask() };
            let cf = result & 1 != 0;
            let of = sign_bit(result, width) != (((result << 1) & width.mask()) >> (bits - 1) != 0);
            (result, cf, of)
        }
        Mnemonic::Ror => {
            let n = count % bits;
            let result = if n == 0 { v } else { ((v >> n) | (v << (bits - n))) & width.mask() };
            let cf = sign_bit(result, width);
            let of = cf != (((result >> (bits - 2)) & 1) != 0);
            (result, cf, of)
        }
        Mnemonic::Rcl => {
            let n = count % (bits + 1);
            let mut acc = (v as u64) | ((cf_in as u64) << bits);
            for _ in 0..n {
                let top = (acc >> bits) & 1;
                acc = ((acc << 1) | top) & ((1u64 << (bits + 1)) - 1);
            }
            let result = (acc & width.mask() as u64) as u32;
            let cf = ((acc >> bits) & 1) != 0;
            (result, cf, false)
        }
        Mnemonic::Rcr => {
            let n = count % (bits + 1);
            let mut acc = (v as u64) | ((cf_in as u64) << bits);
            for _ in 0..n {
                let bottom = acc & 1;
                acc = (acc >> 1) | (bottom << bits);
            }
            let result = (acc & width.mask() as u64) as u32;
            let cf = ((acc >> bits) & 1) != 0;
            (result, cf, false)
        }
        _ => unreachable!("shift_like called with a non-shift mnemonic"),
    }
}

fn sign_extend_to_i32(value: u32, width: Width) -> i32 {
    if sign_bit(value, width) {
        (value | !width.mask()) as i32
    } else {
        value as i32
    }
}

fn push(
    regs: &mut RegisterFile,
    mem: &mut AddressSpace,
    value: u32,
    width: Width,
    eip: GuestAddress,
) -> Result<(), FaultKind> {
    let new_esp = regs.get_r32(Gpr::Esp).wrapping_sub(width.bytes());
    let bytes = value.to_le_bytes();
    mem.write(new_esp, &bytes[..width.bytes() as usize])
        .map_err(mem_err_to_stack_fault(eip))?;
    regs.set_r32(Gpr::Esp, new_esp);
    Ok(())
}

fn pop(regs: &mut RegisterFile, mem: &AddressSpace, width: Width, eip: GuestAddress) -> Result<u32, FaultKind> {
    let esp = regs.get_r32(Gpr::Esp);
    let bytes = mem.read(esp, width.bytes() as usize).map_err(mem_err_to_stack_fault(eip))?;
    regs.set_r32(Gpr::Esp, esp.wrapping_add(width.bytes()));
    Ok(bytes_to_u32(&bytes))
}

fn execute_string_op(
    insn: &DecodedInstruction,
    eip: GuestAddress,
    next_eip: GuestAddress,
    regs: &mut RegisterFile,
    mem: &mut AddressSpace,
) -> Result<Flow, FaultKind> {
    let width = insn.string_width.expect("string op always carries a width");
    let step_size = width.bytes() as i64;
    let df = regs.get_flag(Flags::DF);
    let delta: i64 = if df { -step_size } else { step_size };

    if matches!(insn.rep, RepMode::Rep | RepMode::Repe | RepMode::Repne) && regs.get_r32(Gpr::Ecx) == 0 {
        regs.set_eip(next_eip);
        return Ok(Flow::Continue);
    }

    let esi = regs.get_r32(Gpr::Esi);
    let edi = regs.get_r32(Gpr::Edi);

    // The ZF value that ends a REPE/REPNE scan early; the loop keeps going
    // as long as ZF differs from it. REPE (repeat-while-equal) stops the
    // moment it sees a mismatch (ZF=0); REPNE stops the moment it sees a
    // match (ZF=1).
    let stop_zf: Option<bool> = match insn.rep {
        RepMode::Repe => Some(false),
        RepMode::Repne => Some(true),
        _ => None,
    };

    match insn.mnemonic {
        Mnemonic::Movs => {
            let bytes = mem.read(esi, width.bytes() as usize).map_err(mem_err_to_fault)?;
            mem.write(edi, &bytes).map_err(mem_err_to_fault)?;
            regs.set_r32(Gpr::Esi, esi.wrapping_add(delta as u32));
            regs.set_r32(Gpr::Edi, edi.wrapping_add(delta as u32));
        }
        Mnemonic::Stos => {
            let value = regs.get_r32(Gpr::Eax) & width.mask();
            let bytes = value.to_le_bytes();
            mem.write(edi, &bytes[..width.bytes() as usize]).map_err(mem_err_to_fault)?;
            regs.set_r32(Gpr::Edi, edi.wrapping_add(delta as u32));
        }
        Mnemonic::Lods => {
            let bytes = mem.read(esi, width.bytes() as usize).map_err(mem_err_to_fault)?;
            let value = bytes_to_u32(&bytes);
            match width {
                Width::Byte => regs.set_r8(0, value as u8),
                Width::Word => regs.set_r16(Gpr::Eax, value as u16),
                Width::Dword => regs.set_r32(Gpr::Eax, value),
            }
            regs.set_r32(Gpr::Esi, esi.wrapping_add(delta as u32));
        }
        Mnemonic::Cmps => {
            let a = bytes_to_u32(&mem.read(esi, width.bytes() as usize).map_err(mem_err_to_fault)?);
            let b = bytes_to_u32(&mem.read(edi, width.bytes() as usize).map_err(mem_err_to_fault)?);
            let (result, cf, of) = sub_with_borrow(a, b, 0, width);
            set_result_flags(regs, result, width);
            regs.set_flag(Flags::CF, cf);
            regs.set_flag(Flags::OF, of);
            regs.set_r32(Gpr::Esi, esi.wrapping_add(delta as u32));
            regs.set_r32(Gpr::Edi, edi.wrapping_add(delta as u32));
        }
        Mnemonic::Scas => {
            let a = regs.get_r32(Gpr::Eax) & width.mask();
            let b = bytes_to_u32(&mem.read(edi, width.bytes() as usize).map_err(mem_err_to_fault)?);
            let (result, cf, of) = sub_with_borrow(a, b, 0, width);
            set_result_flags(regs, result, width);
            regs.set_flag(Flags::CF, cf);
            regs.set_flag(Flags::OF, of);
            regs.set_r32(Gpr::Edi, edi.wrapping_add(delta as u32));
        }
        _ => unreachable!("execute_string_op called with a non-string mnemonic"),
    }

    let continue_loop = match insn.rep {
        RepMode::None => false,
        _ => {
            let ecx = regs.get_r32(Gpr::Ecx).wrapping_sub(1);
            regs.set_r32(Gpr::Ecx, ecx);
            match stop_zf {
                Some(stop_value) => ecx != 0 && regs.get_flag(Flags::ZF) != stop_value,
                None => ecx != 0,
            }
        }
    };

    if continue_loop {
        regs.set_eip(eip);
    } else {
        regs.set_eip(next_eip);
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvm_memory::{AddressSpace, Protection, RegionKind, MIN_MEMORY_SIZE};

    fn fresh_space() -> AddressSpace {
        AddressSpace::new(MIN_MEMORY_SIZE).unwrap()
    }

    fn load_code(mem: &mut AddressSpace, addr: u32, code: &[u8]) {
        mem.register_region(addr, 0x1000, RegionKind::Code, Protection::READ | Protection::WRITE | Protection::EXECUTE, "code")
            .unwrap();
        mem.write(addr, code).unwrap();
    }

    #[test]
    fn static_add_and_exit_sequence() {
        let mut mem = fresh_space();
        let code = [
            0xB8, 0x05, 0x00, 0x00, 0x00, // mov eax,5
            0xBB, 0x07, 0x00, 0x00, 0x00, // mov ebx,7
            0x01, 0xD8, // add eax,ebx
            0x89, 0xC3, // mov ebx,eax
            0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax,1
            0xCD, 0x80, // int 0x80
        ];
        load_code(&mut mem, 0x1000, &code);
        let mut regs = RegisterFile::new();
        regs.set_eip(0x1000);

        let mut instructions = 0;
        loop {
            match step(&mut regs, &mut mem) {
                StepOutcome::Continue => instructions += 1,
                StepOutcome::Trap(Trap::Interrupt(0x80)) => {
                    instructions += 1;
                    break;
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(instructions, 6);
        assert_eq!(regs.get_r32(Gpr::Eax), 1);
        assert_eq!(regs.get_r32(Gpr::Ebx), 12);
        assert!(!regs.get_flag(Flags::ZF));
        assert!(!regs.get_flag(Flags::SF));
        assert!(!regs.get_flag(Flags::CF));
        assert!(!regs.get_flag(Flags::OF));
    }

    #[test]
    fn stack_round_trip_push_pop_hlt() {
        let mut mem = fresh_space();
        let code = [0x68, 0xEF, 0xBE, 0xAD, 0xDE, 0x58, 0xF4];
        load_code(&mut mem, 0x1000, &code);
        mem.allocate_stack(0xC000_0000, 0x1000).unwrap();
        let mut regs = RegisterFile::new();
        regs.set_eip(0x1000);
        regs.set_r32(Gpr::Esp, 0xC000_0000);

        assert_eq!(step(&mut regs, &mut mem), StepOutcome::Continue);
        assert_eq!(step(&mut regs, &mut mem), StepOutcome::Continue);
        assert_eq!(step(&mut regs, &mut mem), StepOutcome::Halted);
        assert_eq!(regs.get_r32(Gpr::Eax), 0xDEAD_BEEF);
        assert_eq!(regs.get_r32(Gpr::Esp), 0xC000_0000);
    }

    #[test]
    fn conditional_jump_taken_skips_mov() {
        let mut mem = fresh_space();
        // xor eax,eax; cmp eax,0; je +2; mov eax,1; hlt
        let code = [0x31, 0xC0, 0x83, 0xF8, 0x00, 0x74, 0x02, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xF4];
        load_code(&mut mem, 0x1000, &code);
        let mut regs = RegisterFile::new();
        regs.set_eip(0x1000);
        loop {
            match step(&mut regs, &mut mem) {
                StepOutcome::Continue => continue,
                StepOutcome::Halted => break,
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(regs.get_r32(Gpr::Eax), 0);
    }

    #[test]
    fn rep_movsb_copies_five_bytes() {
        let mut mem = fresh_space();
        mem.register_region(0x200000, 0x1000, RegionKind::Data, Protection::READ | Protection::WRITE, "src")
            .unwrap();
        mem.register_region(0x201000, 0x1000, RegionKind::Data, Protection::READ | Protection::WRITE, "dst")
            .unwrap();
        mem.write(0x200000, &[0, 1, 2, 3, 4]).unwrap();
        load_code(&mut mem, 0x1000, &[0xF3, 0xA4]);

        let mut regs = RegisterFile::new();
        regs.set_eip(0x1000);
        regs.set_r32(Gpr::Esi, 0x200000);
        regs.set_r32(Gpr::Edi, 0x201000);
        regs.set_r32(Gpr::Ecx, 5);

        loop {
            match step(&mut regs, &mut mem) {
                StepOutcome::Continue => {
                    if regs.eip() != 0x1000 {
                        break;
                    }
                }
                other => panic!("unexpected: {other:?}"),
            }
        }

        assert_eq!(mem.read(0x201000, 5).unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(regs.get_r32(Gpr::Ecx), 0);
        assert_eq!(regs.get_r32(Gpr::Esi), 0x200005);
        assert_eq!(regs.get_r32(Gpr::Edi), 0x201005);
    }

    #[test]
    fn divide_by_zero_faults_with_registers_unchanged() {
        let mut mem = fresh_space();
        load_code(&mut mem, 0x1000, &[0xF7, 0xF1]); // div ecx
        let mut regs = RegisterFile::new();
        regs.set_eip(0x1000);
        regs.set_r32(Gpr::Eax, 100);
        regs.set_r32(Gpr::Edx, 0);
        regs.set_r32(Gpr::Ecx, 0);

        let outcome = step(&mut regs, &mut mem);
        assert_eq!(outcome, StepOutcome::Faulted(FaultKind::DivideByZero { eip: 0x1000 }));
        assert_eq!(regs.get_r32(Gpr::Eax), 100);
        assert_eq!(regs.get_r32(Gpr::Edx), 0);
    }

    #[test]
    fn rep_movs_with_zero_count_is_a_no_op() {
        let mut mem = fresh_space();
        mem.register_region(0x200000, 0x1000, RegionKind::Data, Protection::READ | Protection::WRITE, "s")
            .unwrap();
        load_code(&mut mem, 0x1000, &[0xF3, 0xA4]);
        let mut regs = RegisterFile::new();
        regs.set_eip(0x1000);
        regs.set_r32(Gpr::Ecx, 0);
        regs.set_r32(Gpr::Esi, 0x200000);
        regs.set_r32(Gpr::Edi, 0x200100);

        let outcome = step(&mut regs, &mut mem);
        assert_eq!(outcome, StepOutcome::Continue);
        assert_eq!(regs.eip(), 0x1002);
        assert_eq!(regs.get_r32(Gpr::Esi), 0x200000);
    }

    #[test]
    fn xor_self_zeroes_and_sets_zf() {
        let mut mem = fresh_space();
        load_code(&mut mem, 0x1000, &[0x31, 0xC0]); // xor eax,eax
        let mut regs = RegisterFile::new();
        regs.set_eip(0x1000);
        regs.set_r32(Gpr::Eax, 0x1234);
        step(&mut regs, &mut mem);
        assert_eq!(regs.get_r32(Gpr::Eax), 0);
        assert!(regs.get_flag(Flags::ZF));
        assert!(!regs.get_flag(Flags::CF));
        assert!(!regs.get_flag(Flags::OF));
    }

    #[test]
    fn repne_scasb_stops_on_first_match() {
        let mut mem = fresh_space();
        mem.register_region(0x200000, 0x1000, RegionKind::Data, Protection::READ | Protection::WRITE, "buf")
            .unwrap();
        // Match byte 0x42 sits at index 3; the rest is 0x41 filler.
        mem.write(0x200000, &[0x41, 0x41, 0x41, 0x42, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41]).unwrap();
        load_code(&mut mem, 0x1000, &[0xF2, 0xAE]); // repne scasb

        let mut regs = RegisterFile::new();
        regs.set_eip(0x1000);
        regs.set_r32(Gpr::Eax, 0x42);
        regs.set_r32(Gpr::Edi, 0x200000);
        regs.set_r32(Gpr::Ecx, 10);

        loop {
            match step(&mut regs, &mut mem) {
                StepOutcome::Continue => {
                    if regs.eip() != 0x1000 {
                        break;
                    }
                }
                other => panic!("unexpected: {other:?}"),
            }
        }

        assert!(regs.get_flag(Flags::ZF), "should have stopped on the matching byte");
        assert_eq!(regs.get_r32(Gpr::Edi), 0x200004);
        assert_eq!(regs.get_r32(Gpr::Ecx), 6, "should stop well before ecx reaches zero");
    }

    #[test]
    fn repe_cmpsb_stops_on_first_mismatch() {
        let mut mem = fresh_space();
        mem.register_region(0x200000, 0x1000, RegionKind::Data, Protection::READ | Protection::WRITE, "a")
            .unwrap();
        mem.register_region(0x201000, 0x1000, RegionKind::Data, Protection::READ | Protection::WRITE, "b")
            .unwrap();
        mem.write(0x200000, &[0x41; 10]).unwrap();
        // Byte 3 differs; everything before and after matches.
        mem.write(0x201000, &[0x41, 0x41, 0x41, 0x42, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41]).unwrap();
        load_code(&mut mem, 0x1000, &[0xF3, 0xA6]); // repe cmpsb

        let mut regs = RegisterFile::new();
        regs.set_eip(0x1000);
        regs.set_r32(Gpr::Esi, 0x200000);
        regs.set_r32(Gpr::Edi, 0x201000);
        regs.set_r32(Gpr::Ecx, 10);

        loop {
            match step(&mut regs, &mut mem) {
                StepOutcome::Continue => {
                    if regs.eip() != 0x1000 {
                        break;
                    }
                }
                other => panic!("unexpected: {other:?}"),
            }
        }

        assert!(!regs.get_flag(Flags::ZF), "should have stopped on the mismatching byte");
        assert_eq!(regs.get_r32(Gpr::Esi), 0x200004);
        assert_eq!(regs.get_r32(Gpr::Edi), 0x201004);
        assert_eq!(regs.get_r32(Gpr::Ecx), 6, "should stop well before ecx reaches zero");
    }
}
