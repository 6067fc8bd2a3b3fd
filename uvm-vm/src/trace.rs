//! Introspection plumbing: an opt-in decoded-instruction trace stream and
//! an opt-in per-opcode execution counter table. Both are zero-cost when
//! their `VmConfig` flag is off — [`Vm::step`](crate::vm::Vm::step) only
//! touches this module's types when the caller asked for them.

use std::collections::HashMap;

use uvm_cpu::{DecodedInstruction, Mnemonic};
use uvm_memory::GuestAddress;

/// One decoded instruction, shaped for a trace sink rather than for the
/// execution engine — no operands, just enough to log or correlate against
/// a disassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub eip: GuestAddress,
    pub mnemonic_tag: &'static str,
    pub bytes_len: u8,
}

impl TraceRecord {
    pub(crate) fn from_decoded(insn: &DecodedInstruction) -> Self {
        Self {
            eip: insn.eip,
            mnemonic_tag: insn.mnemonic.tag(),
            bytes_len: insn.length,
        }
    }
}

/// Where a [`TraceRecord`] goes once `enable_trace` is on. The core stays
/// logger-agnostic: a caller wanting trace output on `log` installs
/// [`LogTraceSink`]; a caller building a debugger can capture records into
/// its own buffer instead.
pub trait TraceSink {
    fn record(&mut self, record: TraceRecord);
}

/// Emits one `log::trace!` line per instruction — the default sink the
/// `uvm` binary installs when `--trace` is passed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn record(&mut self, record: TraceRecord) {
        log::trace!(
            "{:#010x}: {} ({} bytes)",
            record.eip,
            record.mnemonic_tag,
            record.bytes_len
        );
    }
}

/// Per-opcode execution counts, keyed by the same stable tag a
/// [`TraceRecord`] carries. Populated only while `enable_performance_counters`
/// is set; read-only from the outside.
#[derive(Debug, Default, Clone)]
pub struct OpcodeCounters {
    counts: HashMap<&'static str, u64>,
}

impl OpcodeCounters {
    pub(crate) fn record(&mut self, mnemonic: Mnemonic) {
        *self.counts.entry(mnemonic.tag()).or_insert(0) += 1;
    }

    /// Count for one mnemonic tag (e.g. `"mov"`), zero if never executed.
    pub fn get(&self, tag: &str) -> u64 {
        self.counts.get(tag).copied().unwrap_or(0)
    }

    /// Every mnemonic seen so far with a nonzero count.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.counts.iter().map(|(tag, count)| (*tag, *count))
    }

    /// Total instructions counted across all mnemonics.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_mnemonic() {
        let mut counters = OpcodeCounters::default();
        counters.record(Mnemonic::Mov);
        counters.record(Mnemonic::Mov);
        counters.record(Mnemonic::Hlt);
        assert_eq!(counters.get("mov"), 2);
        assert_eq!(counters.get("hlt"), 1);
        assert_eq!(counters.get("add"), 0);
        assert_eq!(counters.total(), 3);
    }
}
