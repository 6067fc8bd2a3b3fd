//! Thin CLI front-end: reads an ELF32 image, constructs a VM, and runs it
//! to completion. The core crates have no notion of a command line; this
//! binary owns argument parsing, logging setup, and process exit codes.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use uvm_cpu::{Gpr, RegisterFile};
use uvm_elf::reloc::SymbolResolver;
use uvm_loader::LoaderConfig;
use uvm_memory::{AddressSpace, GuestAddress};
use uvm_vm::{ControlFlow, RunOutcome, SyscallHandler, TrapKind, Vm, VmConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Userland x86-32 guest VM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase log verbosity (-v, -vv, ...).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output below warnings.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and run an ELF32 image to completion.
    Run {
        /// Path to the guest ELF32 image.
        elf_path: PathBuf,

        /// Print each decoded instruction before it executes.
        #[arg(long)]
        trace: bool,

        /// Stop after this many instructions even if the guest has not halted.
        #[arg(long)]
        max_instructions: Option<u64>,

        /// Load base used for ET_DYN images.
        #[arg(long, value_parser = parse_hex_u32, default_value = "0x08000000")]
        et_dyn_base: u32,

        /// Total guest address space size, in bytes.
        #[arg(long, default_value_t = uvm_memory::DEFAULT_MEMORY_SIZE)]
        memory_size: u64,
    },
}

fn parse_hex_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Minimal reference syscall handler covering only what the bundled test
/// scenarios need: the Linux/Haiku-style `INT 0x80` exit call (`EAX==1`,
/// exit code in `EBX`). A real guest ABI is a separate concern from this
/// core and would be supplied by whoever embeds the VM.
struct MinimalAbiHandler {
    trace: bool,
}

impl SymbolResolver for MinimalAbiHandler {
    fn resolve(&mut self, name: &str) -> Option<GuestAddress> {
        log::debug!("unresolved symbol {name:?}; no host-side resolution configured");
        None
    }
}

impl SyscallHandler for MinimalAbiHandler {
    fn dispatch(&mut self, trap: TrapKind, regs: &mut RegisterFile, _mem: &mut AddressSpace) -> ControlFlow {
        if self.trace {
            log::info!("trap {trap:?} eax={:#x} ebx={:#x}", regs.get_r32(Gpr::Eax), regs.get_r32(Gpr::Ebx));
        }
        match trap {
            TrapKind::Interrupt(0x80) if regs.get_r32(Gpr::Eax) == 1 => {
                ControlFlow::Exit(regs.get_r32(Gpr::Ebx) as i32)
            }
            TrapKind::Interrupt(n) => {
                log::warn!("unhandled interrupt {n:#x}, exiting");
                ControlFlow::Exit(-1)
            }
            TrapKind::PortIo { port, write } => {
                log::warn!("unhandled port I/O on {port:#x} (write={write}), exiting");
                ControlFlow::Exit(-1)
            }
        }
    }
}

fn run(elf_path: &PathBuf, trace: bool, max_instructions: Option<u64>, et_dyn_base: u32, memory_size: u64) -> ExitCode {
    let bytes = match std::fs::read(elf_path) {
        Ok(b) => b,
        Err(e) => {
            log::error!("could not read {}: {e}", elf_path.display());
            return ExitCode::from(2);
        }
    };

    let config = VmConfig {
        memory_size,
        loader: LoaderConfig { et_dyn_load_base: et_dyn_base, ..Default::default() },
        enable_trace: trace,
        ..Default::default()
    };
    let handler = Box::new(MinimalAbiHandler { trace });
    let mut vm = match Vm::new(config, handler) {
        Ok(vm) => vm,
        Err(e) => {
            log::error!("could not construct VM: {e}");
            return ExitCode::from(2);
        }
    };

    let load_outcome = match vm.load(&bytes, config.loader) {
        Ok(o) => o,
        Err(e) => {
            log::error!("load failed: {e}");
            return ExitCode::from(2);
        }
    };
    log::info!(
        "loaded: load_base={:#010x} entry={:#010x} applied={} failed={}",
        load_outcome.load_base,
        load_outcome.entry_point,
        load_outcome.applied_count,
        load_outcome.failed_count
    );

    let outcome = outcome_to_exit_code(vm.run(max_instructions));
    if let Some(counters) = vm.opcode_counters() {
        for (tag, count) in counters.iter() {
            log::debug!("opcode count: {tag} = {count}");
        }
    }
    outcome
}

fn outcome_to_exit_code(outcome: RunOutcome) -> ExitCode {
    match outcome {
        RunOutcome::Running => unreachable!("run/step loops never surface Running to the caller"),
        RunOutcome::Halted(code) => {
            log::info!("guest halted with code {code}");
            ExitCode::from(code as u8)
        }
        RunOutcome::Faulted(kind, eip) => {
            log::error!("guest faulted at {eip:#010x}: {kind:?}");
            ExitCode::from(101)
        }
        RunOutcome::Cancelled => {
            log::info!("run cancelled");
            ExitCode::from(0)
        }
        RunOutcome::BudgetExhausted => {
            log::warn!("instruction budget exhausted");
            ExitCode::from(124)
        }
        RunOutcome::BreakpointHit(addr) => {
            log::info!("breakpoint hit at {addr:#010x}");
            ExitCode::from(0)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet {
        log::LevelFilter::Warn
    } else {
        match cli.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };
    env_logger::Builder::new().filter_level(level).init();

    match cli.command {
        Command::Run { elf_path, trace, max_instructions, et_dyn_base, memory_size } => {
            run(&elf_path, trace, max_instructions, et_dyn_base, memory_size)
        }
    }
}
