//! VM controller and syscall dispatch seam. Composes [`uvm_loader`] and
//! [`uvm_cpu`] over a single owned [`uvm_memory::AddressSpace`] for the
//! lifetime of one guest process — nothing here survives as process-wide
//! state; a caller constructs a [`Vm`], hands it a handler, and destroys
//! it when done.

pub mod error;
pub mod syscall;
pub mod trace;
pub mod vm;

pub use error::{VmError, VmResult};
pub use syscall::{ControlFlow, FaultReason, NullHandler, SyscallHandler, TrapKind};
pub use trace::{LogTraceSink, OpcodeCounters, TraceRecord, TraceSink};
pub use vm::{BreakpointCondition, RunOutcome, Vm, VmConfig, VmState};
