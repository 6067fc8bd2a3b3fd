//! # Guest Address Space
//!
//! Owns the guest's simulated 32-bit virtual memory: a table of disjoint
//! [`Region`]s, each backed by its own host allocation, plus the protection
//! and translation logic the rest of the VM reads and writes through.
//!
//! ## Backing strategy
//!
//! Each region is backed by its own anonymous `mmap`'d allocation rather than
//! one large 4 GiB mapping — cheaper to set up for short-lived test runs and
//! closer to what a real host-memory-constrained VM does. `translate` never
//! bypasses protection; it exists for the core's own memory mover.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use uvm_memory::{AddressSpace, Protection, RegionKind};
//!
//! let mut space = AddressSpace::new(256 * 1024 * 1024).unwrap();
//! space.register_region(0x1000, 0x1000, RegionKind::Data, Protection::READ | Protection::WRITE, "scratch").unwrap();
//! space.write(0x1000, &[1, 2, 3, 4]).unwrap();
//! assert_eq!(space.read(0x1000, 4).unwrap(), vec![1, 2, 3, 4]);
//! ```

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use bitflags::bitflags;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use thiserror::Error;

/// The host-side representation of the guest's 32-bit virtual address.
pub type GuestAddress = u32;

/// Minimum `memory_size` accepted by [`AddressSpace::new`].
pub const MIN_MEMORY_SIZE: u64 = 256 * 1024 * 1024;

/// Default simulated address space size (spec default).
pub const DEFAULT_MEMORY_SIZE: u64 = 4 * 1024 * 1024 * 1024;

bitflags! {
    /// Access permissions a region grants. The maximum access the core permits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        /// Region may be read.
        const READ = 1 << 0;
        /// Region may be written.
        const WRITE = 1 << 1;
        /// Region may be fetched from and executed.
        const EXECUTE = 1 << 2;
    }
}

/// What a region is used for; diagnostic only, carries no behavior of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Executable image segment.
    Code,
    /// Initialized/zero-filled data segment.
    Data,
    /// Heap, grown via `brk`-style expansion.
    Heap,
    /// Guest stack, grows downward.
    Stack,
    /// Anonymous mapping installed outside the ELF image (GOT/PLT/thunks).
    Mmap,
    /// Shared mapping between cooperating regions (reserved for future use).
    Shared,
}

/// Errors produced by the address space.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Access touched no registered region, or ran past one.
    #[error("bad address 0x{addr:08x}, len {len}")]
    BadAddress {
        /// First guest address of the failed access.
        addr: GuestAddress,
        /// Length in bytes of the attempted access.
        len: usize,
    },
    /// Access was inside a region but the region lacks the needed bits.
    #[error("protection violation at 0x{addr:08x}, len {len}, required {required:?}")]
    Protection {
        /// First guest address of the failed access.
        addr: GuestAddress,
        /// Length in bytes of the attempted access.
        len: usize,
        /// Access that was required but not granted.
        required: Protection,
    },
    /// A new region would overlap one already registered.
    #[error("region [0x{new_start:08x}, 0x{new_end:08x}) overlaps existing [0x{existing_start:08x}, 0x{existing_end:08x})")]
    Overlap {
        /// Start of the region being registered.
        new_start: GuestAddress,
        /// End (exclusive) of the region being registered.
        new_end: GuestAddress,
        /// Start of the conflicting region.
        existing_start: GuestAddress,
        /// End (exclusive) of the conflicting region.
        existing_end: GuestAddress,
    },
    /// Heap expansion would run into the stack region (or another region).
    #[error("heap expansion by {delta} bytes would collide with another region")]
    HeapCollision {
        /// Requested growth, in bytes.
        delta: usize,
    },
    /// `set_protection`'s range did not lie entirely within one region.
    #[error("protection range [0x{start:08x}, 0x{end:08x}) does not lie within a single region")]
    RangeSpansRegions {
        /// Start of the requested range.
        start: GuestAddress,
        /// End (exclusive) of the requested range.
        end: GuestAddress,
    },
    /// `memory_size` was below [`MIN_MEMORY_SIZE`].
    #[error("requested memory size {0} is below the minimum of {MIN_MEMORY_SIZE}")]
    SizeTooSmall(u64),
    /// The host refused to create or remove a backing mapping.
    #[error("host mmap failed: {0}")]
    HostMmapFailed(String),
}

/// Result alias for [`MemoryError`].
pub type MemResult<T> = Result<T, MemoryError>;

/// A host allocation backing one [`Region`]. Freed on drop.
struct Backing {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the address space is single-threaded per spec §5; the raw pointer
// is never shared across threads.
unsafe impl Send for Backing {}

impl Backing {
    fn new(len: usize) -> MemResult<Self> {
        let nz_len = NonZeroUsize::new(len.max(1)).expect("len.max(1) is never zero");
        // SAFETY: anonymous, not file-backed; no aliasing with any existing mapping.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                nz_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| MemoryError::HostMmapFailed(e.to_string()))?;
        Ok(Self { ptr, len })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mmap of at least `len` bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see as_slice; exclusive access via &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast(), self.len) }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        // SAFETY: ptr/len were returned together by mmap_anonymous and are
        // unmapped exactly once here.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            log::warn!("munmap failed for region backing: {e}");
        }
    }
}

/// A contiguous interval of guest addresses with fixed protection and a
/// host-owned backing buffer. See the invariants in the module documentation.
pub struct Region {
    start: GuestAddress,
    size: u32,
    kind: RegionKind,
    protection: Protection,
    name: String,
    backing: Backing,
}

impl Region {
    /// Start of the region.
    pub fn start(&self) -> GuestAddress {
        self.start
    }

    /// Size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// First address past the region.
    pub fn end(&self) -> u64 {
        self.start as u64 + self.size as u64
    }

    /// What the region is used for.
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Current protection bits.
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn contains_range(&self, addr: GuestAddress, len: usize) -> bool {
        let start = addr as u64;
        let end = start + len as u64;
        start >= self.start as u64 && end <= self.end()
    }
}

/// The guest's 4 GiB sparse virtual memory: a set of disjoint [`Region`]s.
pub struct AddressSpace {
    memory_size: u64,
    regions: Vec<Region>,
    heap_region_idx: Option<usize>,
    stack_region_idx: Option<usize>,
}

impl AddressSpace {
    /// Create an empty address space reserving `memory_size` bytes of
    /// logical capacity (no host memory is committed until regions are
    /// registered).
    pub fn new(memory_size: u64) -> MemResult<Self> {
        if memory_size < MIN_MEMORY_SIZE {
            return Err(MemoryError::SizeTooSmall(memory_size));
        }
        Ok(Self {
            memory_size,
            regions: Vec::new(),
            heap_region_idx: None,
            stack_region_idx: None,
        })
    }

    /// Total logical capacity of this address space.
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    /// All registered regions, in registration order.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    fn find_region_idx(&self, addr: GuestAddress) -> Option<usize> {
        let a = addr as u64;
        self.regions
            .iter()
            .position(|r| a >= r.start as u64 && a < r.end())
    }

    fn find_owning_region(&self, addr: GuestAddress, len: usize) -> MemResult<usize> {
        let idx = self
            .regions
            .iter()
            .position(|r| r.contains_range(addr, len))
            .ok_or(MemoryError::BadAddress { addr, len })?;
        Ok(idx)
    }

    /// Register a new region. Fails with [`MemoryError::Overlap`] if any
    /// existing region intersects `[start, start+size)`.
    pub fn register_region(
        &mut self,
        start: GuestAddress,
        size: u32,
        kind: RegionKind,
        protection: Protection,
        name: &str,
    ) -> MemResult<()> {
        let new_start = start as u64;
        let new_end = new_start + size as u64;
        for existing in &self.regions {
            let existing_start = existing.start as u64;
            let existing_end = existing.end();
            if new_start < existing_end && existing_start < new_end {
                return Err(MemoryError::Overlap {
                    new_start: start,
                    new_end: new_end as GuestAddress,
                    existing_start: existing.start,
                    existing_end: existing_end as GuestAddress,
                });
            }
        }

        let backing = Backing::new(size as usize)?;
        let region = Region {
            start,
            size,
            kind,
            protection,
            name: name.to_string(),
            backing,
        };
        self.regions.push(region);

        match kind {
            RegionKind::Heap => self.heap_region_idx = Some(self.regions.len() - 1),
            RegionKind::Stack => self.stack_region_idx = Some(self.regions.len() - 1),
            _ => {}
        }

        log::trace!(
            "registered region {name} [0x{start:08x}, 0x{new_end:08x}) kind={kind:?} prot={protection:?}"
        );
        Ok(())
    }

    /// Read `len` bytes starting at `addr`. Atomic within a single region:
    /// either the whole range is readable and returned, or nothing is.
    pub fn read(&self, addr: GuestAddress, len: usize) -> MemResult<Vec<u8>> {
        let idx = self.find_owning_region(addr, len)?;
        let region = &self.regions[idx];
        if !region.protection.contains(Protection::READ) {
            return Err(MemoryError::Protection {
                addr,
                len,
                required: Protection::READ,
            });
        }
        let offset = (addr - region.start) as usize;
        Ok(region.backing.as_slice()[offset..offset + len].to_vec())
    }

    /// Write `buf` starting at `addr`. Atomic: a protection failure leaves
    /// the region's bytes unchanged.
    pub fn write(&mut self, addr: GuestAddress, buf: &[u8]) -> MemResult<()> {
        let idx = self.find_owning_region(addr, buf.len())?;
        let region = &mut self.regions[idx];
        if !region.protection.contains(Protection::WRITE) {
            return Err(MemoryError::Protection {
                addr,
                len: buf.len(),
                required: Protection::WRITE,
            });
        }
        let offset = (addr - region.start) as usize;
        region.backing.as_mut_slice()[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    /// Read bytes until a zero byte or `max` bytes have been read, whichever
    /// comes first. The terminating zero (if any) is not included.
    pub fn read_string(&self, addr: GuestAddress, max: usize) -> MemResult<Vec<u8>> {
        let mut out = Vec::new();
        for i in 0..max {
            let a = addr.wrapping_add(i as u32);
            let byte = self.read(a, 1)?[0];
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        Ok(out)
    }

    /// Change the protection of a range. The range must lie entirely within
    /// one region.
    pub fn set_protection(
        &mut self,
        addr: GuestAddress,
        size: u32,
        prot: Protection,
    ) -> MemResult<()> {
        let idx = self
            .regions
            .iter()
            .position(|r| r.contains_range(addr, size as usize))
            .ok_or(MemoryError::RangeSpansRegions {
                start: addr,
                end: addr.wrapping_add(size),
            })?;
        self.regions[idx].protection = prot;
        Ok(())
    }

    /// Grow the heap region upward by `delta` bytes, failing if that would
    /// collide with any other registered region. Returns the new heap size.
    pub fn expand_heap(&mut self, delta: usize) -> MemResult<u32> {
        let idx = self.heap_region_idx.ok_or(MemoryError::HeapCollision { delta })?;
        let new_size = self.regions[idx]
            .size
            .checked_add(delta as u32)
            .ok_or(MemoryError::HeapCollision { delta })?;
        let new_end = self.regions[idx].start as u64 + new_size as u64;
        for (i, r) in self.regions.iter().enumerate() {
            if i == idx {
                continue;
            }
            if new_end > r.start as u64 && (self.regions[idx].start as u64) < r.end() {
                return Err(MemoryError::HeapCollision { delta });
            }
        }

        let old_backing = Backing::new(new_size as usize)?;
        let mut region = &mut self.regions[idx];
        let old_len = region.backing.len.min(old_backing.len);
        let mut new_backing = old_backing;
        new_backing.as_mut_slice()[..old_len].copy_from_slice(&region.backing.as_slice()[..old_len]);
        region.backing = new_backing;
        region.size = new_size;
        Ok(new_size)
    }

    /// Install the heap region at `base` with `initial_size` bytes,
    /// read/write, zero-filled.
    pub fn allocate_heap(&mut self, base: GuestAddress, initial_size: u32) -> MemResult<GuestAddress> {
        self.register_region(
            base,
            initial_size,
            RegionKind::Heap,
            Protection::READ | Protection::WRITE,
            "heap",
        )?;
        Ok(base)
    }

    /// Install one stack region `[top - size, top)`, read/write.
    /// Returns `top`.
    pub fn allocate_stack(&mut self, top: GuestAddress, size: u32) -> MemResult<GuestAddress> {
        let base = top.wrapping_sub(size);
        self.register_region(
            base,
            size,
            RegionKind::Stack,
            Protection::READ | Protection::WRITE,
            "stack",
        )?;
        Ok(top)
    }

    /// Translate a guest address to a raw host pointer into the owning
    /// region's backing buffer, without checking protection. Reserved for
    /// the core's own memory mover (e.g. `REP MOVS`); callers that need a
    /// protection-checked access must use [`AddressSpace::read`]/[`AddressSpace::write`].
    pub fn translate(&self, addr: GuestAddress) -> Option<*const u8> {
        let idx = self.find_region_idx(addr)?;
        let region = &self.regions[idx];
        let offset = (addr - region.start) as usize;
        Some(unsafe { region.backing.as_slice().as_ptr().add(offset) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        AddressSpace::new(MIN_MEMORY_SIZE).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut s = space();
        s.register_region(0x1000, 0x1000, RegionKind::Data, Protection::READ | Protection::WRITE, "x")
            .unwrap();
        s.write(0x1000, &[1, 2, 3, 4]).unwrap();
        assert_eq!(s.read(0x1000, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn overlap_is_rejected() {
        let mut s = space();
        s.register_region(0x1000, 0x1000, RegionKind::Data, Protection::READ, "a").unwrap();
        let err = s
            .register_region(0x1800, 0x100, RegionKind::Data, Protection::READ, "b")
            .unwrap_err();
        assert!(matches!(err, MemoryError::Overlap { .. }));
    }

    #[test]
    fn read_one_past_region_fails() {
        let mut s = space();
        s.register_region(0x1000, 0x10, RegionKind::Data, Protection::READ, "a").unwrap();
        assert!(s.read(0x1000, 0x11).is_err());
        assert!(s.read(0x1010, 1).is_err());
        assert!(s.read(0x1000, 0x10).is_ok());
    }

    #[test]
    fn write_to_read_only_region_fails_and_is_unchanged() {
        let mut s = space();
        s.register_region(0x2000, 0x10, RegionKind::Code, Protection::READ, "ro").unwrap();
        let before = s.read(0x2000, 0x10).unwrap();
        let err = s.write(0x2000, &[0xff; 4]).unwrap_err();
        assert!(matches!(err, MemoryError::Protection { .. }));
        assert_eq!(s.read(0x2000, 0x10).unwrap(), before);
    }

    #[test]
    fn read_string_stops_at_nul() {
        let mut s = space();
        s.register_region(0x3000, 0x20, RegionKind::Data, Protection::READ | Protection::WRITE, "s")
            .unwrap();
        s.write(0x3000, b"hello\0world").unwrap();
        assert_eq!(s.read_string(0x3000, 0x20).unwrap(), b"hello");
    }

    #[test]
    fn stack_region_top_matches_request() {
        let mut s = space();
        let top = s.allocate_stack(0xC000_0000, 0x1000).unwrap();
        assert_eq!(top, 0xC000_0000);
        assert!(s.read(0xC000_0000 - 1, 1).is_ok());
        assert!(s.read(0xC000_0000, 1).is_err());
    }

    #[test]
    fn heap_expands_in_place() {
        let mut s = space();
        s.allocate_heap(0x4000_0000, 0x1000).unwrap();
        let new_size = s.expand_heap(0x1000).unwrap();
        assert_eq!(new_size, 0x2000);
        s.write(0x4000_1000, &[0xaa]).unwrap();
        assert_eq!(s.read(0x4000_1000, 1).unwrap(), vec![0xaa]);
    }
}
