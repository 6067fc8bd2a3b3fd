//! x86-32 CPU model: register file, instruction decoder, and execution
//! engine. No knowledge of ELF images or host OS services lives here — this
//! crate only understands bytes, registers, and a [`uvm_memory::AddressSpace`].

pub mod decode;
pub mod exec;
pub mod flags;
pub mod regs;

pub use decode::{
    decode, Condition, DecodeError, DecodedInstruction, EffectiveAddress, InstructionClass,
    Mnemonic, Operand, RepMode, SegmentOverride, Width,
};
pub use exec::{step, FaultKind, PortOp, StepOutcome, Trap};
pub use flags::Flags;
pub use regs::{Gpr, RegisterFile, Segment};
