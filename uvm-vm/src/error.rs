//! Aggregated error type for the VM controller. Loading and execution
//! each have their own typed errors in `uvm-elf`/`uvm-loader`/`uvm-cpu`;
//! this just unions them at the one seam that needs to talk about both.

use thiserror::Error;
use uvm_cpu::{DecodeError, FaultKind};
use uvm_loader::LoadError;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("image rejected: {0}")]
    Load(#[from] LoadError),
    #[error("instruction decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("execution faulted: {0:?}")]
    Faulted(FaultKind),
    #[error("no region registered for execution at {0:#010x}")]
    NoEntryRegion(u32),
}

pub type VmResult<T> = Result<T, VmError>;
