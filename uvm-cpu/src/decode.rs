//! Instruction decoder: turns bytes at `EIP` into a [`DecodedInstruction`].
//!
//! Pure function, no side effects — it never touches the register file or
//! address space, so it is unit-testable against raw byte arrays alone. The
//! engine resolves memory operands against live register state; the decoder
//! only describes *how* to compute them (REDESIGN: one decoded tag instead
//! of a 256-slot handler table; the engine matches on it directly).

use thiserror::Error;
use uvm_memory::GuestAddress;

use crate::regs::Gpr;

/// Decoder failure: an unparsable instruction stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More than 15 prefix/opcode bytes were consumed without reaching a
    /// complete instruction.
    #[error("instruction too long at eip 0x{eip:08x}")]
    TooLong {
        /// EIP at the start of the instruction.
        eip: GuestAddress,
    },
    /// Primary or escaped opcode has no known decoding.
    #[error("invalid opcode at eip 0x{eip:08x}: {bytes:02x?}")]
    InvalidOpcode {
        /// EIP at the start of the instruction.
        eip: GuestAddress,
        /// The opcode bytes that could not be decoded.
        bytes: Vec<u8>,
    },
    /// ModR/M encoding is reserved for this opcode (e.g. `mod=3` where only
    /// a memory operand is valid).
    #[error("reserved modrm encoding at eip 0x{eip:08x}")]
    ReservedModRm {
        /// EIP at the start of the instruction.
        eip: GuestAddress,
    },
    /// The byte stream ran out before the instruction was fully decoded.
    #[error("truncated instruction at eip 0x{eip:08x}")]
    Truncated {
        /// EIP at the start of the instruction.
        eip: GuestAddress,
    },
}

/// Operand width in bytes-equivalent classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    /// Size in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
        }
    }

    /// Size in bits.
    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }

    /// A mask with exactly `bits()` low bits set.
    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Dword => 0xFFFF_FFFF,
        }
    }
}

/// A memory operand's addressing-mode description: `[base + index*scale + disp]`.
/// Resolved against live register values by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveAddress {
    /// Base register, if any (`None` for a bare `disp32` absolute address).
    pub base: Option<Gpr>,
    /// Index register and scale (1, 2, 4, or 8), if any.
    pub index: Option<(Gpr, u8)>,
    /// Signed displacement.
    pub disp: i32,
    /// Segment override recorded for diagnostics; the core treats all
    /// overrides as the flat model per design note.
    pub segment_override: Option<SegmentOverride>,
}

/// A segment-override prefix. `Fs`/`Gs` are recorded but not honored (no TLS).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOverride {
    Cs,
    Ds,
    Es,
    Ss,
    Fs,
    Gs,
}

/// One instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// A GPR (or sub-register) read/write location.
    Register { width: Width, index: u8 },
    /// A memory location, described relative to runtime register values.
    Memory { addr: EffectiveAddress, width: Width },
    /// An immediate value, sign-extended to 64 bits for uniform storage.
    Immediate { value: i64, width: Width },
    /// A control-transfer target, already resolved to an absolute `EIP`
    /// (decoder adds the displacement to the address of the next instruction).
    Relative { target: GuestAddress },
}

/// Broad instruction category, as named in the component contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionClass {
    Arithmetic,
    Logical,
    Shift,
    Move,
    Stack,
    ControlTransfer,
    StringOp,
    Io,
    System,
    BitOp,
}

/// One of the 16 x86 condition codes, used by `Jcc`, `SETcc`, `CMOVcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Condition {
    /// Decode the 4-bit condition field shared by `0x70+cc`, `0x0F 0x80+cc`,
    /// `0x0F 0x90+cc` (SETcc), and `0x0F 0x40+cc` (CMOVcc).
    pub fn from_tttn(tttn: u8) -> Self {
        match tttn & 0xF {
            0x0 => Condition::O,
            0x1 => Condition::No,
            0x2 => Condition::B,
            0x3 => Condition::Ae,
            0x4 => Condition::E,
            0x5 => Condition::Ne,
            0x6 => Condition::Be,
            0x7 => Condition::A,
            0x8 => Condition::S,
            0x9 => Condition::Ns,
            0xA => Condition::P,
            0xB => Condition::Np,
            0xC => Condition::L,
            0xD => Condition::Ge,
            0xE => Condition::Le,
            _ => Condition::G,
        }
    }
}

/// String-operation width/direction marker shared by `MOVS/CMPS/SCAS/LODS/STOS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepMode {
    /// No `REP` prefix.
    None,
    /// `REP` (used with `MOVS`, `STOS`, `LODS`, `INS`, `OUTS`).
    Rep,
    /// `REPE`/`REPZ` — continues while `ZF=1` (used with `CMPS`/`SCAS`).
    Repe,
    /// `REPNE`/`REPNZ` — continues while `ZF=0`.
    Repne,
}

/// The specific operation a decoded instruction performs. A REDESIGN away
/// from a 256-entry table of handler pointers: the engine is a single
/// `match` over this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    Add,
    Adc,
    Sub,
    Sbb,
    Inc,
    Dec,
    Neg,
    Cmp,
    Mul,
    Imul,
    Div,
    Idiv,
    And,
    Or,
    Xor,
    Not,
    Test,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shld,
    Shrd,
    Mov,
    Movzx,
    Movsx,
    Lea,
    Xchg,
    Push,
    Pop,
    Pushad,
    Popad,
    Pushf,
    Popf,
    Cbw,
    Cwd,
    Cwde,
    Cdq,
    Jmp,
    Jcc(Condition),
    Call,
    Ret,
    RetImm,
    Loop,
    Loope,
    Loopne,
    Jecxz,
    Cmovcc(Condition),
    Setcc(Condition),
    Bt,
    Bts,
    Btr,
    Btc,
    Bsf,
    Bsr,
    Movs,
    Cmps,
    Scas,
    Lods,
    Stos,
    In,
    Out,
    Ins,
    Outs,
    Int,
    Hlt,
}

impl Mnemonic {
    /// Stable, human-readable tag for trace records and per-opcode counters.
    /// `Jcc`/`Cmovcc`/`Setcc` collapse their condition code away — counters
    /// and trace lines care about the instruction family, not which of the
    /// 16 conditions fired.
    pub fn tag(&self) -> &'static str {
        match self {
            Mnemonic::Add => "add",
            Mnemonic::Adc => "adc",
            Mnemonic::Sub => "sub",
            Mnemonic::Sbb => "sbb",
            Mnemonic::Inc => "inc",
            Mnemonic::Dec => "dec",
            Mnemonic::Neg => "neg",
            Mnemonic::Cmp => "cmp",
            Mnemonic::Mul => "mul",
            Mnemonic::Imul => "imul",
            Mnemonic::Div => "div",
            Mnemonic::Idiv => "idiv",
            Mnemonic::And => "and",
            Mnemonic::Or => "or",
            Mnemonic::Xor => "xor",
            Mnemonic::Not => "not",
            Mnemonic::Test => "test",
            Mnemonic::Shl => "shl",
            Mnemonic::Shr => "shr",
            Mnemonic::Sar => "sar",
            Mnemonic::Rol => "rol",
            Mnemonic::Ror => "ror",
            Mnemonic::Rcl => "rcl",
            Mnemonic::Rcr => "rcr",
            Mnemonic::Shld => "shld",
            Mnemonic::Shrd => "shrd",
            Mnemonic::Mov => "mov",
            Mnemonic::Movzx => "movzx",
            Mnemonic::Movsx => "movsx",
            Mnemonic::Lea => "lea",
            Mnemonic::Xchg => "xchg",
            Mnemonic::Push => "push",
            Mnemonic::Pop => "pop",
            Mnemonic::Pushad => "pushad",
            Mnemonic::Popad => "popad",
            Mnemonic::Pushf => "pushf",
            Mnemonic::Popf => "popf",
            Mnemonic::Cbw => "cbw",
            Mnemonic::Cwd => "cwd",
            Mnemonic::Cwde => "cwde",
            Mnemonic::Cdq => "cdq",
            Mnemonic::Jmp => "jmp",
            Mnemonic::Jcc(_) => "jcc",
            Mnemonic::Call => "call",
            Mnemonic::Ret => "ret",
            Mnemonic::RetImm => "ret_imm",
            Mnemonic::Loop => "loop",
            Mnemonic::Loope => "loope",
            Mnemonic::Loopne => "loopne",
            Mnemonic::Jecxz => "jecxz",
            Mnemonic::Cmovcc(_) => "cmovcc",
            Mnemonic::Setcc(_) => "setcc",
            Mnemonic::Bt => "bt",
            Mnemonic::Bts => "bts",
            Mnemonic::Btr => "btr",
            Mnemonic::Btc => "btc",
            Mnemonic::Bsf => "bsf",
            Mnemonic::Bsr => "bsr",
            Mnemonic::Movs => "movs",
            Mnemonic::Cmps => "cmps",
            Mnemonic::Scas => "scas",
            Mnemonic::Lods => "lods",
            Mnemonic::Stos => "stos",
            Mnemonic::In => "in",
            Mnemonic::Out => "out",
            Mnemonic::Ins => "ins",
            Mnemonic::Outs => "outs",
            Mnemonic::Int => "int",
            Mnemonic::Hlt => "hlt",
        }
    }
}

/// A fully decoded instruction plus everything needed to execute it.
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    /// EIP at which this instruction starts.
    pub eip: GuestAddress,
    /// Segment override prefix, if any.
    pub segment_override: Option<SegmentOverride>,
    /// `0x66` operand-size override was present.
    pub operand_size_override: bool,
    /// `0x67` address-size override was present.
    pub address_size_override: bool,
    /// `REP`/`REPE`/`REPNE` prefix.
    pub rep: RepMode,
    /// `0xF0 LOCK` prefix was present (accepted, no additional semantics).
    pub lock: bool,
    /// The operation to perform.
    pub mnemonic: Mnemonic,
    /// Broad category, mirroring the component contract's class tag.
    pub class: InstructionClass,
    /// Operands in instruction-specific order (destination first).
    pub operands: Vec<Operand>,
    /// Width of the string operation, when `mnemonic` is a string op.
    pub string_width: Option<Width>,
    /// Total bytes consumed from the stream, including prefixes.
    pub length: u8,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    eip: GuestAddress,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::Truncated { eip: self.eip })?;
        self.pos += 1;
        Ok(b)
    }

    fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let lo = self.u8()? as u16;
        let hi = self.u8()? as u16;
        Ok(lo | (hi << 8))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(self.u16()? as i16)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b0 = self.u8()? as u32;
        let b1 = self.u8()? as u32;
        let b2 = self.u8()? as u32;
        let b3 = self.u8()? as u32;
        Ok(b0 | (b1 << 8) | (b2 << 16) | (b3 << 24))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }
}

/// Decoded ModR/M byte.
struct ModRm {
    md: u8,
    reg: u8,
    rm: u8,
}

fn decode_modrm_operand(
    cur: &mut Cursor,
    modrm: &ModRm,
    width: Width,
    seg: Option<SegmentOverride>,
) -> Result<Operand, DecodeError> {
    if modrm.md == 0b11 {
        return Ok(Operand::Register {
            width,
            index: modrm.rm,
        });
    }

    if modrm.rm == 0b100 {
        // SIB byte follows.
        let sib = cur.u8()?;
        let scale_bits = sib >> 6;
        let index_bits = (sib >> 3) & 0b111;
        let base_bits = sib & 0b111;
        let scale = 1u8 << scale_bits;
        let index = if index_bits == 0b100 {
            None
        } else {
            Some((Gpr::from_index(index_bits), scale))
        };
        let (base, disp) = if base_bits == 0b101 && modrm.md == 0b00 {
            (None, cur.i32()?)
        } else {
            let d = match modrm.md {
                0b00 => 0,
                0b01 => cur.i8()? as i32,
                _ => cur.i32()?,
            };
            (Some(Gpr::from_index(base_bits)), d)
        };
        return Ok(Operand::Memory {
            addr: EffectiveAddress {
                base,
                index,
                disp,
                segment_override: seg,
            },
            width,
        });
    }

    if modrm.md == 0b00 && modrm.rm == 0b101 {
        // mod=0, r/m=5: absolute disp32, no base register.
        let disp = cur.i32()?;
        return Ok(Operand::Memory {
            addr: EffectiveAddress {
                base: None,
                index: None,
                disp,
                segment_override: seg,
            },
            width,
        });
    }

    let disp = match modrm.md {
        0b00 => 0,
        0b01 => cur.i8()? as i32,
        _ => cur.i32()?,
    };
    Ok(Operand::Memory {
        addr: EffectiveAddress {
            base: Some(Gpr::from_index(modrm.rm)),
            index: None,
            disp,
            segment_override: seg,
        },
        width,
    })
}

/// Decode exactly one instruction starting at `bytes[0]`, which is assumed
/// to be the byte at guest address `eip`. Returns the decoded instruction
/// and how many bytes of `bytes` it consumed.
pub fn decode(bytes: &[u8], eip: GuestAddress) -> Result<DecodedInstruction, DecodeError> {
    let start_eip = eip;
    let mut cur = Cursor {
        bytes,
        eip,
        pos: 0,
    };

    let mut segment_override = None;
    let mut operand_size_override = false;
    let mut address_size_override = false;
    let mut rep = RepMode::None;
    let mut lock = false;

    loop {
        if cur.pos >= 15 {
            return Err(DecodeError::TooLong { eip: start_eip });
        }
        let b = *bytes.get(cur.pos).ok_or(DecodeError::Truncated { eip: start_eip })?;
        match b {
            0x2E => segment_override = Some(SegmentOverride::Cs),
            0x36 => segment_override = Some(SegmentOverride::Ss),
            0x3E => segment_override = Some(SegmentOverride::Ds),
            0x26 => segment_override = Some(SegmentOverride::Es),
            0x64 => segment_override = Some(SegmentOverride::Fs),
            0x65 => segment_override = Some(SegmentOverride::Gs),
            0x66 => operand_size_override = true,
            0x67 => address_size_override = true,
            0xF0 => lock = true,
            0xF2 => rep = RepMode::Repne,
            0xF3 => rep = RepMode::Repe,
            _ => break,
        }
        cur.pos += 1;
    }

    let op_width = if operand_size_override {
        Width::Word
    } else {
        Width::Dword
    };

    let opcode = cur.u8()?;

    let (mnemonic, class, operands, string_width) = if opcode == 0x0F {
        decode_two_byte(&mut cur, op_width, segment_override, start_eip)?
    } else {
        decode_one_byte(&mut cur, opcode, op_width, segment_override, rep, start_eip)?
    };

    // REP/REPE/REPNE is only meaningful on string ops and INS/OUTS; normalize
    // REPE/REPNE down to plain Rep for non-comparing string ops so the engine
    // doesn't have to special-case it again.
    let rep = match mnemonic {
        Mnemonic::Cmps | Mnemonic::Scas => rep,
        Mnemonic::Movs | Mnemonic::Lods | Mnemonic::Stos | Mnemonic::Ins | Mnemonic::Outs => {
            match rep {
                RepMode::None => RepMode::None,
                _ => RepMode::Rep,
            }
        }
        _ => RepMode::None,
    };

    let length = cur.pos as u8;
    Ok(DecodedInstruction {
        eip: start_eip,
        segment_override,
        operand_size_override,
        address_size_override,
        rep,
        lock,
        mnemonic,
        class,
        operands,
        string_width,
        length,
    })
}

type DecodeBody = Result<(Mnemonic, InstructionClass, Vec<Operand>, Option<Width>), DecodeError>;

fn read_modrm(cur: &mut Cursor) -> Result<ModRm, DecodeError> {
    let b = cur.u8()?;
    Ok(ModRm {
        md: b >> 6,
        reg: (b >> 3) & 0b111,
        rm: b & 0b111,
    })
}

fn decode_one_byte(
    cur: &mut Cursor,
    opcode: u8,
    op_width: Width,
    seg: Option<SegmentOverride>,
    rep: RepMode,
    eip: GuestAddress,
) -> DecodeBody {
    use InstructionClass as C;
    use Mnemonic as M;

    // ADD/OR/ADC/SBB/AND/SUB/XOR/CMP share an 8-opcode-group layout:
    // group*8 + {0:Eb,Gb 1:Ev,Gv 2:Gb,Eb 3:Gv,Ev 4:AL,Ib 5:eAX,Iz}
    const ARITH_GROUP: [Mnemonic; 8] = [
        M::Add,
        M::Or,
        M::Adc,
        M::Sbb,
        M::And,
        M::Sub,
        M::Xor,
        M::Cmp,
    ];

    if opcode < 0x40 && (opcode & 0x07) <= 5 && (opcode >> 3) < 8 {
        let group = (opcode >> 3) as usize;
        let slot = opcode & 0x07;
        let mnemonic = ARITH_GROUP[group];
        let class = if matches!(mnemonic, M::Cmp) {
            C::Arithmetic
        } else {
            C::Arithmetic
        };
        return match slot {
            0 => decode_rm_reg(cur, Width::Byte, seg, mnemonic, class, true),
            1 => decode_rm_reg(cur, op_width, seg, mnemonic, class, true),
            2 => decode_rm_reg(cur, Width::Byte, seg, mnemonic, class, false),
            3 => decode_rm_reg(cur, op_width, seg, mnemonic, class, false),
            4 => decode_acc_imm(cur, Width::Byte, mnemonic, class),
            _ => decode_acc_imm(cur, op_width, mnemonic, class),
        };
    }

    match opcode {
        0x40..=0x47 => Ok((M::Inc, C::Arithmetic, vec![reg_operand(op_width, opcode - 0x40)], None)),
        0x48..=0x4F => Ok((M::Dec, C::Arithmetic, vec![reg_operand(op_width, opcode - 0x48)], None)),
        0x50..=0x57 => Ok((M::Push, C::Stack, vec![reg_operand(Width::Dword, opcode - 0x50)], None)),
        0x58..=0x5F => Ok((M::Pop, C::Stack, vec![reg_operand(Width::Dword, opcode - 0x58)], None)),
        0x60 => Ok((M::Pushad, C::Stack, vec![], None)),
        0x61 => Ok((M::Popad, C::Stack, vec![], None)),
        0x68 => {
            let imm = cur.i32()?;
            Ok((M::Push, C::Stack, vec![imm_operand(imm as i64, Width::Dword)], None))
        }
        0x6A => {
            let imm = cur.i8()?;
            Ok((M::Push, C::Stack, vec![imm_operand(imm as i64, Width::Dword)], None))
        }
        0x70..=0x7F => {
            let cc = Condition::from_tttn(opcode - 0x70);
            let disp = cur.i8()? as i32;
            let target = (cur.eip.wrapping_add(cur.pos as u32)).wrapping_add(disp as u32);
            Ok((M::Jcc(cc), C::ControlTransfer, vec![Operand::Relative { target }], None))
        }
        0x80 => decode_group1(cur, Width::Byte, seg, true),
        0x81 => decode_group1(cur, op_width, seg, true),
        0x83 => decode_group1(cur, op_width, seg, false),
        0x84 => decode_rm_reg(cur, Width::Byte, seg, M::Test, C::Logical, false).map(|t| (t.0, t.1, t.2, t.3)),
        0x85 => decode_rm_reg(cur, op_width, seg, M::Test, C::Logical, false),
        0x86 => decode_rm_reg(cur, Width::Byte, seg, M::Xchg, C::Move, false),
        0x87 => decode_rm_reg(cur, op_width, seg, M::Xchg, C::Move, false),
        0x88 => decode_rm_reg(cur, Width::Byte, seg, M::Mov, C::Move, true),
        0x89 => decode_rm_reg(cur, op_width, seg, M::Mov, C::Move, true),
        0x8A => decode_rm_reg(cur, Width::Byte, seg, M::Mov, C::Move, false),
        0x8B => decode_rm_reg(cur, op_width, seg, M::Mov, C::Move, false),
        0x8D => {
            let modrm = read_modrm(cur)?;
            if modrm.md == 0b11 {
                return Err(DecodeError::ReservedModRm { eip });
            }
            let src = decode_modrm_operand(cur, &modrm, op_width, seg)?;
            Ok((M::Lea, C::Move, vec![reg_operand(op_width, modrm.reg), src], None))
        }
        0x90 => Ok((M::Mov, C::Move, vec![reg_operand(op_width, 0), reg_operand(op_width, 0)], None)), // NOP = XCHG eAX,eAX
        0x9C => Ok((M::Pushf, C::Stack, vec![], None)),
        0x9D => Ok((M::Popf, C::Stack, vec![], None)),
        0x98 => Ok((
            if matches!(op_width, Width::Word) { M::Cbw } else { M::Cwde },
            C::Move,
            vec![],
            None,
        )),
        0x99 => Ok((
            if matches!(op_width, Width::Word) { M::Cwd } else { M::Cdq },
            C::Move,
            vec![],
            None,
        )),
        0xA4 => Ok((M::Movs, C::StringOp, vec![], Some(Width::Byte))),
        0xA5 => Ok((M::Movs, C::StringOp, vec![], Some(op_width))),
        0xA6 => Ok((M::Cmps, C::StringOp, vec![], Some(Width::Byte))),
        0xA7 => Ok((M::Cmps, C::StringOp, vec![], Some(op_width))),
        0xAA => Ok((M::Stos, C::StringOp, vec![], Some(Width::Byte))),
        0xAB => Ok((M::Stos, C::StringOp, vec![], Some(op_width))),
        0xAC => Ok((M::Lods, C::StringOp, vec![], Some(Width::Byte))),
        0xAD => Ok((M::Lods, C::StringOp, vec![], Some(op_width))),
        0xAE => Ok((M::Scas, C::StringOp, vec![], Some(Width::Byte))),
        0xAF => Ok((M::Scas, C::StringOp, vec![], Some(op_width))),
        0xB0..=0xB7 => {
            let imm = cur.u8()? as i64;
            Ok((M::Mov, C::Move, vec![reg_operand(Width::Byte, opcode - 0xB0), imm_operand(imm, Width::Byte)], None))
        }
        0xB8..=0xBF => {
            let imm = match op_width {
                Width::Word => cur.i16()? as i64,
                _ => cur.i32()? as i64,
            };
            Ok((M::Mov, C::Move, vec![reg_operand(op_width, opcode - 0xB8), imm_operand(imm, op_width)], None))
        }
        0xC0 => decode_group2(cur, Width::Byte, seg, true),
        0xC1 => decode_group2(cur, op_width, seg, true),
        0xC2 => {
            let imm = cur.u16()?;
            Ok((M::RetImm, C::ControlTransfer, vec![imm_operand(imm as i64, Width::Word)], None))
        }
        0xC3 => Ok((M::Ret, C::ControlTransfer, vec![], None)),
        0xC6 => {
            let modrm = read_modrm(cur)?;
            let dst = decode_modrm_operand(cur, &modrm, Width::Byte, seg)?;
            let imm = cur.u8()? as i64;
            Ok((M::Mov, C::Move, vec![dst, imm_operand(imm, Width::Byte)], None))
        }
        0xC7 => {
            let modrm = read_modrm(cur)?;
            let dst = decode_modrm_operand(cur, &modrm, op_width, seg)?;
            let imm = match op_width {
                Width::Word => cur.i16()? as i64,
                _ => cur.i32()? as i64,
            };
            Ok((M::Mov, C::Move, vec![dst, imm_operand(imm, op_width)], None))
        }
        0xD0 => decode_group2_const1(cur, Width::Byte, seg),
        0xD1 => decode_group2_const1(cur, op_width, seg),
        0xD2 => decode_group2_cl(cur, Width::Byte, seg),
        0xD3 => decode_group2_cl(cur, op_width, seg),
        0xE2 => {
            let disp = cur.i8()? as i32;
            let target = cur.eip.wrapping_add(cur.pos as u32).wrapping_add(disp as u32);
            Ok((M::Loop, C::ControlTransfer, vec![Operand::Relative { target }], None))
        }
        0xE1 => {
            let disp = cur.i8()? as i32;
            let target = cur.eip.wrapping_add(cur.pos as u32).wrapping_add(disp as u32);
            Ok((M::Loope, C::ControlTransfer, vec![Operand::Relative { target }], None))
        }
        0xE0 => {
            let disp = cur.i8()? as i32;
            let target = cur.eip.wrapping_add(cur.pos as u32).wrapping_add(disp as u32);
            Ok((M::Loopne, C::ControlTransfer, vec![Operand::Relative { target }], None))
        }
        0xE3 => {
            let disp = cur.i8()? as i32;
            let target = cur.eip.wrapping_add(cur.pos as u32).wrapping_add(disp as u32);
            Ok((M::Jecxz, C::ControlTransfer, vec![Operand::Relative { target }], None))
        }
        0xE4 => {
            let port = cur.u8()? as i64;
            Ok((M::In, C::Io, vec![imm_operand(port, Width::Byte)], None))
        }
        0xE6 => {
            let port = cur.u8()? as i64;
            Ok((M::Out, C::Io, vec![imm_operand(port, Width::Byte)], None))
        }
        0xE8 => {
            let disp = cur.i32()?;
            let target = cur.eip.wrapping_add(cur.pos as u32).wrapping_add(disp as u32);
            Ok((M::Call, C::ControlTransfer, vec![Operand::Relative { target }], None))
        }
        0xE9 => {
            let disp = cur.i32()?;
            let target = cur.eip.wrapping_add(cur.pos as u32).wrapping_add(disp as u32);
            Ok((M::Jmp, C::ControlTransfer, vec![Operand::Relative { target }], None))
        }
        0xEB => {
            let disp = cur.i8()? as i32;
            let target = cur.eip.wrapping_add(cur.pos as u32).wrapping_add(disp as u32);
            Ok((M::Jmp, C::ControlTransfer, vec![Operand::Relative { target }], None))
        }
        0xF4 => Ok((M::Hlt, C::System, vec![], None)),
        0xF6 => decode_group3(cur, Width::Byte, seg),
        0xF7 => decode_group3(cur, op_width, seg),
        0xFE => decode_group4(cur, seg),
        0xFF => decode_group5(cur, op_width, seg),
        0xCD => {
            let imm = cur.u8()? as i64;
            Ok((M::Int, C::System, vec![imm_operand(imm, Width::Byte)], None))
        }
        0x6C => Ok((M::Ins, C::StringOp, vec![], Some(Width::Byte))),
        0x6D => Ok((M::Ins, C::StringOp, vec![], Some(op_width))),
        0x6E => Ok((M::Outs, C::StringOp, vec![], Some(Width::Byte))),
        0x6F => Ok((M::Outs, C::StringOp, vec![], Some(op_width))),
        _ => {
            let _ = rep;
            Err(DecodeError::InvalidOpcode {
                eip,
                bytes: vec![opcode],
            })
        }
    }
}

fn decode_two_byte(
    cur: &mut Cursor,
    op_width: Width,
    seg: Option<SegmentOverride>,
    eip: GuestAddress,
) -> DecodeBody {
    use InstructionClass as C;
    use Mnemonic as M;

    let opcode = cur.u8()?;
    match opcode {
        0x80..=0x8F => {
            let cc = Condition::from_tttn(opcode - 0x80);
            let disp = cur.i32()?;
            let target = cur.eip.wrapping_add(cur.pos as u32).wrapping_add(disp as u32);
            Ok((M::Jcc(cc), C::ControlTransfer, vec![Operand::Relative { target }], None))
        }
        0x90..=0x9F => {
            let cc = Condition::from_tttn(opcode - 0x90);
            let modrm = read_modrm(cur)?;
            let dst = decode_modrm_operand(cur, &modrm, Width::Byte, seg)?;
            Ok((M::Setcc(cc), C::Move, vec![dst], None))
        }
        0x40..=0x4F => {
            let cc = Condition::from_tttn(opcode - 0x40);
            let modrm = read_modrm(cur)?;
            let src = decode_modrm_operand(cur, &modrm, op_width, seg)?;
            Ok((M::Cmovcc(cc), C::Move, vec![reg_operand(op_width, modrm.reg), src], None))
        }
        0xA3 => decode_rm_reg(cur, op_width, seg, M::Bt, C::BitOp, true),
        0xAB => decode_rm_reg(cur, op_width, seg, M::Bts, C::BitOp, true),
        0xB3 => decode_rm_reg(cur, op_width, seg, M::Btr, C::BitOp, true),
        0xBB => decode_rm_reg(cur, op_width, seg, M::Btc, C::BitOp, true),
        0xBA => {
            let modrm = read_modrm(cur)?;
            let dst = decode_modrm_operand(cur, &modrm, op_width, seg)?;
            let imm = cur.u8()? as i64;
            let mnemonic = match modrm.reg {
                4 => M::Bt,
                5 => M::Bts,
                6 => M::Btr,
                7 => M::Btc,
                _ => return Err(DecodeError::ReservedModRm { eip }),
            };
            Ok((mnemonic, C::BitOp, vec![dst, imm_operand(imm, Width::Byte)], None))
        }
        0xBC => decode_rm_reg(cur, op_width, seg, M::Bsf, C::BitOp, false),
        0xBD => decode_rm_reg(cur, op_width, seg, M::Bsr, C::BitOp, false),
        0xB6 => decode_movx(cur, seg, Width::Byte, op_width, M::Movzx),
        0xB7 => decode_movx(cur, seg, Width::Word, op_width, M::Movzx),
        0xBE => decode_movx(cur, seg, Width::Byte, op_width, M::Movsx),
        0xBF => decode_movx(cur, seg, Width::Word, op_width, M::Movsx),
        0xA4 => decode_shd(cur, seg, op_width, M::Shld, false),
        0xA5 => decode_shd(cur, seg, op_width, M::Shld, true),
        0xAC => decode_shd(cur, seg, op_width, M::Shrd, false),
        0xAD => decode_shd(cur, seg, op_width, M::Shrd, true),
        _ => Err(DecodeError::InvalidOpcode {
            eip,
            bytes: vec![0x0F, opcode],
        }),
    }
}

fn decode_movx(
    cur: &mut Cursor,
    seg: Option<SegmentOverride>,
    src_width: Width,
    dst_width: Width,
    mnemonic: Mnemonic,
) -> DecodeBody {
    let modrm = read_modrm(cur)?;
    let src = decode_modrm_operand(cur, &modrm, src_width, seg)?;
    Ok((mnemonic, InstructionClass::Move, vec![reg_operand(dst_width, modrm.reg), src], None))
}

fn decode_shd(
    cur: &mut Cursor,
    seg: Option<SegmentOverride>,
    width: Width,
    mnemonic: Mnemonic,
    by_cl: bool,
) -> DecodeBody {
    let modrm = read_modrm(cur)?;
    let dst = decode_modrm_operand(cur, &modrm, width, seg)?;
    let src = reg_operand(width, modrm.reg);
    let count = if by_cl {
        reg_operand(Width::Byte, 1) // CL
    } else {
        imm_operand(cur.u8()? as i64, Width::Byte)
    };
    Ok((mnemonic, InstructionClass::Shift, vec![dst, src, count], None))
}

fn decode_rm_reg(
    cur: &mut Cursor,
    width: Width,
    seg: Option<SegmentOverride>,
    mnemonic: Mnemonic,
    class: InstructionClass,
    reg_is_source: bool,
) -> DecodeBody {
    let modrm = read_modrm(cur)?;
    let rm_operand = decode_modrm_operand(cur, &modrm, width, seg)?;
    let reg = reg_operand(width, modrm.reg);
    let operands = if reg_is_source {
        vec![rm_operand, reg]
    } else {
        vec![reg, rm_operand]
    };
    Ok((mnemonic, class, operands, None))
}

fn decode_acc_imm(cur: &mut Cursor, width: Width, mnemonic: Mnemonic, class: InstructionClass) -> DecodeBody {
    let imm = match width {
        Width::Byte => cur.u8()? as i64,
        Width::Word => cur.i16()? as i64,
        Width::Dword => cur.i32()? as i64,
    };
    Ok((mnemonic, class, vec![reg_operand(width, 0), imm_operand(imm, width)], None))
}

fn decode_group1(cur: &mut Cursor, width: Width, seg: Option<SegmentOverride>, imm_matches_width: bool) -> DecodeBody {
    const GROUP1: [Mnemonic; 8] = [
        Mnemonic::Add,
        Mnemonic::Or,
        Mnemonic::Adc,
        Mnemonic::Sbb,
        Mnemonic::And,
        Mnemonic::Sub,
        Mnemonic::Xor,
        Mnemonic::Cmp,
    ];
    let modrm = read_modrm(cur)?;
    let dst = decode_modrm_operand(cur, &modrm, width, seg)?;
    let imm = if imm_matches_width {
        match width {
            Width::Byte => cur.u8()? as i64,
            Width::Word => cur.i16()? as i64,
            Width::Dword => cur.i32()? as i64,
        }
    } else {
        cur.i8()? as i64 // 0x83: sign-extended imm8
    };
    let mnemonic = GROUP1[modrm.reg as usize];
    Ok((mnemonic, InstructionClass::Arithmetic, vec![dst, imm_operand(imm, width)], None))
}

fn decode_group2(cur: &mut Cursor, width: Width, seg: Option<SegmentOverride>, by_imm8: bool) -> DecodeBody {
    const GROUP2: [Mnemonic; 8] = [
        Mnemonic::Rol,
        Mnemonic::Ror,
        Mnemonic::Rcl,
        Mnemonic::Rcr,
        Mnemonic::Shl,
        Mnemonic::Shr,
        Mnemonic::Shl, // 6 is an alias of SHL, reserved in practice
        Mnemonic::Sar,
    ];
    let modrm = read_modrm(cur)?;
    let dst = decode_modrm_operand(cur, &modrm, width, seg)?;
    let count = if by_imm8 {
        imm_operand(cur.u8()? as i64, Width::Byte)
    } else {
        imm_operand(1, Width::Byte)
    };
    let mnemonic = GROUP2[modrm.reg as usize];
    Ok((mnemonic, InstructionClass::Shift, vec![dst, count], None))
}

fn decode_group2_const1(cur: &mut Cursor, width: Width, seg: Option<SegmentOverride>) -> DecodeBody {
    const GROUP2: [Mnemonic; 8] = [
        Mnemonic::Rol,
        Mnemonic::Ror,
        Mnemonic::Rcl,
        Mnemonic::Rcr,
        Mnemonic::Shl,
        Mnemonic::Shr,
        Mnemonic::Shl,
        Mnemonic::Sar,
    ];
    let modrm = read_modrm(cur)?;
    let dst = decode_modrm_operand(cur, &modrm, width, seg)?;
    let mnemonic = GROUP2[modrm.reg as usize];
    Ok((mnemonic, InstructionClass::Shift, vec![dst, imm_operand(1, Width::Byte)], None))
}

fn decode_group2_cl(cur: &mut Cursor, width: Width, seg: Option<SegmentOverride>) -> DecodeBody {
    const GROUP2: [Mnemonic; 8] = [
        Mnemonic::Rol,
        Mnemonic::Ror,
        Mnemonic::Rcl,
        Mnemonic::Rcr,
        Mnemonic::Shl,
        Mnemonic::Shr,
        Mnemonic::Shl,
        Mnemonic::Sar,
    ];
    let modrm = read_modrm(cur)?;
    let dst = decode_modrm_operand(cur, &modrm, width, seg)?;
    let mnemonic = GROUP2[modrm.reg as usize];
    Ok((mnemonic, InstructionClass::Shift, vec![dst, reg_operand(Width::Byte, 1)], None))
}

fn decode_group3(cur: &mut Cursor, width: Width, seg: Option<SegmentOverride>) -> DecodeBody {
    let modrm = read_modrm(cur)?;
    let rm = decode_modrm_operand(cur, &modrm, width, seg)?;
    match modrm.reg {
        0 | 1 => {
            let imm = match width {
                Width::Byte => cur.u8()? as i64,
                Width::Word => cur.i16()? as i64,
                Width::Dword => cur.i32()? as i64,
            };
            Ok((Mnemonic::Test, InstructionClass::Logical, vec![rm, imm_operand(imm, width)], None))
        }
        2 => Ok((Mnemonic::Not, InstructionClass::Logical, vec![rm], None)),
        3 => Ok((Mnemonic::Neg, InstructionClass::Arithmetic, vec![rm], None)),
        4 => Ok((Mnemonic::Mul, InstructionClass::Arithmetic, vec![rm], None)),
        5 => Ok((Mnemonic::Imul, InstructionClass::Arithmetic, vec![rm], None)),
        6 => Ok((Mnemonic::Div, InstructionClass::Arithmetic, vec![rm], None)),
        _ => Ok((Mnemonic::Idiv, InstructionClass::Arithmetic, vec![rm], None)),
    }
}

fn decode_group4(cur: &mut Cursor, seg: Option<SegmentOverride>) -> DecodeBody {
    let modrm = read_modrm(cur)?;
    let rm = decode_modrm_operand(cur, &modrm, Width::Byte, seg)?;
    match modrm.reg {
        0 => Ok((Mnemonic::Inc, InstructionClass::Arithmetic, vec![rm], None)),
        _ => Ok((Mnemonic::Dec, InstructionClass::Arithmetic, vec![rm], None)),
    }
}

fn decode_group5(cur: &mut Cursor, width: Width, seg: Option<SegmentOverride>) -> DecodeBody {
    let modrm = read_modrm(cur)?;
    let rm = decode_modrm_operand(cur, &modrm, width, seg)?;
    match modrm.reg {
        0 => Ok((Mnemonic::Inc, InstructionClass::Arithmetic, vec![rm], None)),
        1 => Ok((Mnemonic::Dec, InstructionClass::Arithmetic, vec![rm], None)),
        2 => Ok((Mnemonic::Call, InstructionClass::ControlTransfer, vec![rm], None)),
        4 => Ok((Mnemonic::Jmp, InstructionClass::ControlTransfer, vec![rm], None)),
        6 => Ok((Mnemonic::Push, InstructionClass::Stack, vec![rm], None)),
        _ => Ok((Mnemonic::Call, InstructionClass::ControlTransfer, vec![rm], None)),
    }
}

fn reg_operand(width: Width, index: u8) -> Operand {
    Operand::Register { width, index }
}

fn imm_operand(value: i64, width: Width) -> Operand {
    Operand::Immediate { value, width }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_mov_eax_imm32() {
        let bytes = [0xB8, 0x05, 0x00, 0x00, 0x00];
        let insn = decode(&bytes, 0x1000).unwrap();
        assert_eq!(insn.mnemonic, Mnemonic::Mov);
        assert_eq!(insn.length, 5);
        assert!(matches!(insn.operands[1], Operand::Immediate { value: 5, .. }));
    }

    #[test]
    fn decodes_add_eax_ebx() {
        let bytes = [0x01, 0xD8];
        let insn = decode(&bytes, 0x1000).unwrap();
        assert_eq!(insn.mnemonic, Mnemonic::Add);
        assert_eq!(insn.length, 2);
    }

    #[test]
    fn decodes_int_0x80() {
        let bytes = [0xCD, 0x80];
        let insn = decode(&bytes, 0x1000).unwrap();
        assert_eq!(insn.mnemonic, Mnemonic::Int);
        assert!(matches!(insn.operands[0], Operand::Immediate { value: 0x80, .. }));
    }

    #[test]
    fn decodes_push_imm32_then_pop_eax() {
        let push = decode(&[0x68, 0xEF, 0xBE, 0xAD, 0xDE], 0).unwrap();
        assert_eq!(push.mnemonic, Mnemonic::Push);
        assert_eq!(push.length, 5);
        let pop = decode(&[0x58], 0).unwrap();
        assert_eq!(pop.mnemonic, Mnemonic::Pop);
        assert_eq!(pop.length, 1);
    }

    #[test]
    fn decodes_conditional_jump_short() {
        let insn = decode(&[0x74, 0x02], 0x100).unwrap();
        assert_eq!(insn.mnemonic, Mnemonic::Jcc(Condition::E));
        if let Operand::Relative { target } = insn.operands[0] {
            assert_eq!(target, 0x104);
        } else {
            panic!("expected relative operand");
        }
    }

    #[test]
    fn decodes_rep_movsb() {
        let insn = decode(&[0xF3, 0xA4], 0).unwrap();
        assert_eq!(insn.mnemonic, Mnemonic::Movs);
        assert_eq!(insn.rep, RepMode::Rep);
        assert_eq!(insn.string_width, Some(Width::Byte));
        assert_eq!(insn.length, 2);
    }

    #[test]
    fn decodes_div_ecx() {
        let insn = decode(&[0xF7, 0xF1], 0).unwrap();
        assert_eq!(insn.mnemonic, Mnemonic::Div);
        assert_eq!(insn.length, 2);
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let err = decode(&[0x0F, 0xFF], 0x2000).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidOpcode { eip: 0x2000, .. }));
    }

    #[test]
    fn sib_addressing_decodes_base_index_scale() {
        // mov eax, [ebx + esi*4 + 0x10]: 8B 44 B3 10
        let insn = decode(&[0x8B, 0x44, 0xB3, 0x10], 0).unwrap();
        assert_eq!(insn.mnemonic, Mnemonic::Mov);
        if let Operand::Memory { addr, .. } = insn.operands[1] {
            assert_eq!(addr.base, Some(Gpr::Ebx));
            assert_eq!(addr.index, Some((Gpr::Esi, 4)));
            assert_eq!(addr.disp, 0x10);
        } else {
            panic!("expected memory operand");
        }
    }

    #[test]
    fn sign_extend_opcodes_follow_the_operand_size_prefix() {
        let cdq = decode(&[0x99], 0).unwrap();
        assert_eq!(cdq.mnemonic, Mnemonic::Cdq);
        let cwde = decode(&[0x98], 0).unwrap();
        assert_eq!(cwde.mnemonic, Mnemonic::Cwde);

        let cwd = decode(&[0x66, 0x99], 0).unwrap();
        assert_eq!(cwd.mnemonic, Mnemonic::Cwd);
        let cbw = decode(&[0x66, 0x98], 0).unwrap();
        assert_eq!(cbw.mnemonic, Mnemonic::Cbw);
    }
}
