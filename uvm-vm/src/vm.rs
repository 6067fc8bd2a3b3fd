//! VM Controller: owns the register file and address space for the
//! lifetime of one run, drives the fetch-decode-execute loop, and routes
//! traps to the installed [`SyscallHandler`].

use uvm_cpu::{decode, step, FaultKind, Mnemonic, PortOp, RegisterFile, StepOutcome, Trap};
use uvm_loader::{LoadOutcome, LoaderConfig};
use uvm_memory::{AddressSpace, GuestAddress, Protection};

use crate::error::{VmError, VmResult};
use crate::syscall::{ControlFlow, SyscallHandler, TrapKind};
use crate::trace::{OpcodeCounters, TraceRecord, TraceSink};

/// Machine state as seen from outside a single `step`/`run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    HaltedNormal(i32),
    Faulted,
}

/// Outcome of a `run` or `step` call. `Running` only ever comes from
/// `step`, which reports the machine is still alive after executing
/// exactly one instruction; `run`'s loop never returns it.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Running,
    Halted(i32),
    Faulted(FaultKind, GuestAddress),
    Cancelled,
    BudgetExhausted,
    BreakpointHit(GuestAddress),
}

/// An optional condition attached to a breakpoint. `None` always fires.
pub type BreakpointCondition = Option<fn(&RegisterFile) -> bool>;

struct Breakpoint {
    condition: BreakpointCondition,
}

/// Configuration for VM construction, independent of the loaded image.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub memory_size: u64,
    pub loader: LoaderConfig,
    /// Record a [`TraceRecord`] for every executed instruction. Off by
    /// default: even routing through a no-op sink costs a decode-shaped
    /// allocation per instruction that most callers never want.
    pub enable_trace: bool,
    /// Maintain an [`OpcodeCounters`] table across the run.
    pub enable_performance_counters: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: uvm_memory::DEFAULT_MEMORY_SIZE,
            loader: LoaderConfig::default(),
            enable_trace: false,
            enable_performance_counters: false,
        }
    }
}

/// Owns the register file, address space, and syscall handler for one
/// guest process. Constructed once per run; tests build their own rather
/// than reaching for any shared instance.
pub struct Vm {
    regs: RegisterFile,
    mem: AddressSpace,
    handler: Box<dyn SyscallHandler>,
    state: VmState,
    breakpoints: std::collections::HashMap<GuestAddress, Breakpoint>,
    instructions_executed: u64,
    cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
    trace_sink: Option<Box<dyn TraceSink>>,
    counters: Option<OpcodeCounters>,
}

impl Vm {
    /// Construct an empty VM with no image loaded yet.
    pub fn new(config: VmConfig, handler: Box<dyn SyscallHandler>) -> VmResult<Self> {
        let mem = AddressSpace::new(config.memory_size).map_err(uvm_loader::LoadError::from)?;
        let trace_sink: Option<Box<dyn TraceSink>> = if config.enable_trace {
            Some(Box::new(crate::trace::LogTraceSink))
        } else {
            None
        };
        Ok(Self {
            regs: RegisterFile::default(),
            mem,
            handler,
            state: VmState::Running,
            breakpoints: std::collections::HashMap::new(),
            instructions_executed: 0,
            cancel: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            trace_sink,
            counters: config.enable_performance_counters.then(OpcodeCounters::default),
        })
    }

    /// Replace the trace sink `enable_trace` installed (or install one for
    /// the first time). Lets a caller capture records into its own buffer
    /// instead of the default `log::trace!` sink.
    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.trace_sink = Some(sink);
    }

    /// Per-opcode execution counts accumulated so far, if
    /// `enable_performance_counters` was set.
    pub fn opcode_counters(&self) -> Option<&OpcodeCounters> {
        self.counters.as_ref()
    }

    /// A handle the caller can set from another context to request that
    /// the next instruction boundary stop the run with `Cancelled`.
    pub fn cancellation_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.cancel.clone()
    }

    /// Parse, map, and relocate `image_bytes`, then position the
    /// instruction pointer at the resulting entry point.
    pub fn load(&mut self, image_bytes: &[u8], loader_config: LoaderConfig) -> VmResult<LoadOutcome> {
        let outcome = uvm_loader::load(&mut self.mem, image_bytes, loader_config, self.handler.as_mut())?;
        self.regs.set_eip(outcome.entry_point);
        self.state = VmState::Running;
        Ok(outcome)
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.mem
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn instructions_executed(&self) -> u64 {
        self.instructions_executed
    }

    /// Debugger-facing memory read; honors protection.
    pub fn read_memory(&self, addr: GuestAddress, len: usize) -> VmResult<Vec<u8>> {
        self.mem
            .read(addr, len)
            .map_err(|e| VmError::Load(uvm_loader::LoadError::Memory(e)))
    }

    /// Debugger-facing memory write; honors protection.
    pub fn write_memory(&mut self, addr: GuestAddress, buf: &[u8]) -> VmResult<()> {
        self.mem
            .write(addr, buf)
            .map_err(|e| VmError::Load(uvm_loader::LoadError::Memory(e)))
    }

    pub fn set_breakpoint(&mut self, addr: GuestAddress, condition: BreakpointCondition) {
        self.breakpoints.insert(addr, Breakpoint { condition });
    }

    pub fn clear_breakpoint(&mut self, addr: GuestAddress) {
        self.breakpoints.remove(&addr);
    }

    fn breakpoint_hit(&self) -> bool {
        match self.breakpoints.get(&self.regs.eip()) {
            Some(bp) => bp.condition.map(|f| f(&self.regs)).unwrap_or(true),
            None => false,
        }
    }

    /// Execute exactly one instruction (or one iteration of a
    /// `REP`-prefixed string instruction). Returns immediately with the
    /// current state if not `Running`.
    pub fn step(&mut self) -> RunOutcome {
        if !matches!(self.state, VmState::Running) {
            return self.terminal_outcome();
        }

        let eip_before = self.regs.eip();
        if self.trace_sink.is_some() || self.counters.is_some() {
            self.record_introspection(eip_before);
        }
        match step(&mut self.regs, &mut self.mem) {
            StepOutcome::Continue => {
                self.instructions_executed += 1;
                RunOutcome::Running
            }
            StepOutcome::Halted => {
                let code = self.regs.get_r32(uvm_cpu::Gpr::Ebx) as i32;
                self.state = VmState::HaltedNormal(code);
                RunOutcome::Halted(code)
            }
            StepOutcome::Trap(trap) => {
                self.instructions_executed += 1;
                self.handle_trap(trap, eip_before)
            }
            StepOutcome::Faulted(kind) => {
                self.state = VmState::Faulted;
                RunOutcome::Faulted(kind, eip_before)
            }
        }
    }

    /// Decode the instruction at `eip` once and feed it to whichever of the
    /// trace sink / opcode counters are active. A decode failure here is
    /// not this instruction's problem to report — `step` will hit the same
    /// failure immediately afterward and turn it into a proper fault.
    fn record_introspection(&mut self, eip: GuestAddress) {
        let Ok(insn) = self.peek_next_instruction() else {
            return;
        };
        if let Some(sink) = self.trace_sink.as_mut() {
            sink.record(TraceRecord::from_decoded(&insn));
        }
        if let Some(counters) = self.counters.as_mut() {
            counters.record(insn.mnemonic);
        }
        debug_assert_eq!(insn.eip, eip);
    }

    fn terminal_outcome(&self) -> RunOutcome {
        match self.state {
            VmState::HaltedNormal(code) => RunOutcome::Halted(code),
            VmState::Faulted => RunOutcome::Faulted(
                FaultKind::InvalidInstruction { eip: self.regs.eip(), bytes: Vec::new() },
                self.regs.eip(),
            ),
            VmState::Running => unreachable!(),
        }
    }

    /// Handles one trap, returning `Running` when the handler wants
    /// execution to resume at the next instruction.
    fn handle_trap(&mut self, trap: Trap, eip_before: GuestAddress) -> RunOutcome {
        let trap_kind = match trap {
            Trap::Interrupt(n) => TrapKind::Interrupt(n),
            Trap::PortIo(PortOp::In) => TrapKind::PortIo { port: 0, write: false },
            Trap::PortIo(PortOp::Out) => TrapKind::PortIo { port: 0, write: true },
            Trap::PortIo(PortOp::Ins) => TrapKind::PortIo { port: 0, write: false },
            Trap::PortIo(PortOp::Outs) => TrapKind::PortIo { port: 0, write: true },
        };

        match self.handler.dispatch(trap_kind, &mut self.regs, &mut self.mem) {
            ControlFlow::Continue => RunOutcome::Running,
            ControlFlow::Exit(code) => {
                self.state = VmState::HaltedNormal(code);
                RunOutcome::Halted(code)
            }
            ControlFlow::Fault(reason) => {
                log::warn!("syscall handler raised a fault at {:#010x}: {}", eip_before, reason.message);
                self.state = VmState::Faulted;
                RunOutcome::Faulted(FaultKind::InvalidInstruction { eip: eip_before, bytes: Vec::new() }, eip_before)
            }
        }
    }

    /// Run until halt, fault, cancellation, a hit breakpoint, or
    /// `max_instructions` have executed.
    pub fn run(&mut self, max_instructions: Option<u64>) -> RunOutcome {
        let mut executed = 0u64;
        loop {
            if self.cancel.load(std::sync::atomic::Ordering::SeqCst) {
                return RunOutcome::Cancelled;
            }
            if let Some(max) = max_instructions {
                if executed >= max {
                    return RunOutcome::BudgetExhausted;
                }
            }
            if executed > 0 && self.breakpoint_hit() {
                return RunOutcome::BreakpointHit(self.regs.eip());
            }
            if !matches!(self.state, VmState::Running) {
                return self.terminal_outcome();
            }

            match self.step() {
                RunOutcome::Running => executed += 1,
                other => return other,
            }
        }
    }

    /// Decode the instruction at the current EIP without executing it;
    /// used by trace/introspection tooling.
    pub fn peek_next_instruction(&self) -> VmResult<uvm_cpu::DecodedInstruction> {
        let eip = self.regs.eip();
        let bytes = self
            .mem
            .read(eip, 15.min((self.mem.memory_size() as usize).saturating_sub(eip as usize)))
            .unwrap_or_default();
        decode(&bytes, eip).map_err(VmError::from)
    }

    /// Names executed so far, grouped by mnemonic — introspection support
    /// for a caller that wants per-opcode counts; this walks memory once
    /// rather than keeping a running table, so it is meant for debugging,
    /// not a hot path.
    pub fn mnemonic_at(&self, addr: GuestAddress) -> Option<Mnemonic> {
        let bytes = self.mem.read(addr, 15).ok()?;
        decode(&bytes, addr).ok().map(|d| d.mnemonic)
    }

    /// Grant `addr..addr+len` the given protection; used by a debugger to
    /// toggle write-protection around a breakpoint write, for example.
    pub fn set_protection(&mut self, addr: GuestAddress, len: u32, prot: Protection) -> VmResult<()> {
        self.mem
            .set_protection(addr, len, prot)
            .map_err(|e| VmError::Load(uvm_loader::LoadError::Memory(e)))
    }
}
