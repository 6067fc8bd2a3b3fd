//! Syscall dispatch seam: the single point where a guest "enter kernel"
//! instruction (`INT`, port I/O) hands control to a host-implemented ABI.
//!
//! The core makes no assumption about argument-passing convention beyond
//! read/write access to registers and memory — that is entirely the
//! handler's business. No global or singleton handler exists; one is
//! installed once, by value, when the [`crate::Vm`] is constructed.

use uvm_cpu::RegisterFile;
use uvm_elf::reloc::SymbolResolver;
use uvm_memory::{AddressSpace, GuestAddress};

/// What the guest asked the trap to do.
#[derive(Debug, Clone, Copy)]
pub enum TrapKind {
    /// `INT n`.
    Interrupt(u8),
    /// `IN`/`OUT` port I/O, synthesized as a call number rather than
    /// touching real hardware ports.
    PortIo { port: u16, write: bool },
}

/// What the VM controller should do after a handler runs.
#[derive(Debug, Clone)]
pub enum ControlFlow {
    /// Resume execution at the instruction after the trap.
    Continue,
    /// Halt the VM with the given guest exit code.
    Exit(i32),
    /// Move the VM to `Faulted` with a synthetic fault.
    Fault(FaultReason),
}

/// A fault the handler itself decided to raise (distinct from the faults
/// the execution engine raises on its own, see [`uvm_cpu::FaultKind`]).
#[derive(Debug, Clone)]
pub struct FaultReason {
    pub message: String,
}

/// A single polymorphic handler for every guest-ABI trap, installed once
/// at VM construction. Also the symbol-resolution hook the relocator
/// consults for undefined dynamic symbols during loading.
pub trait SyscallHandler: SymbolResolver {
    /// Handle one trap. May read and write both `regs` and `mem`.
    fn dispatch(&mut self, trap: TrapKind, regs: &mut RegisterFile, mem: &mut AddressSpace) -> ControlFlow;
}

/// A handler that exits immediately on any trap, useful for images that
/// are not expected to make syscalls (e.g. the static-exit test scenario,
/// where a real ABI handler is substituted instead).
pub struct NullHandler;

impl SymbolResolver for NullHandler {
    fn resolve(&mut self, _name: &str) -> Option<GuestAddress> {
        None
    }
}

impl SyscallHandler for NullHandler {
    fn dispatch(&mut self, trap: TrapKind, _regs: &mut RegisterFile, _mem: &mut AddressSpace) -> ControlFlow {
        log::warn!("no syscall handler installed, exiting on {trap:?}");
        ControlFlow::Exit(0)
    }
}
