//! Introspection boundary between the engine and the hypervisor.
//!
//! Everything the engine needs from the virtualization platform is captured
//! by the [`Vmi`] trait: pausing the guest, reading and writing its memory,
//! translating addresses, watching frames for access events, and driving the
//! alternate-view (altp2m) hypercalls. The engine itself never talks to a
//! hypervisor directly; it is generic over `V: Vmi`.
//!
//! # Drivers
//!
//! A production deployment would implement this trait over a Xen or KVMi
//! connection. This crate ships one driver, the in-process simulated guest
//! in [`sim`], which backs the demo tool and every test.
//!
//! # Address spaces
//!
//! Three address spaces appear at this boundary:
//!
//! - **VA**: guest virtual addresses, translated through the guest's page
//!   tables (a DTB, usually CR3 with the low bits masked).
//! - **PA / GFN**: guest physical addresses; a GFN is `pa >> 12`.
//! - **MFN**: the machine frame actually backing a GFN. Alternate views
//!   redirect the GFN→MFN step for selected frames.
//!
//! # Read-through page cache
//!
//! Virtual-address reads go through a page-granular cache on the driver
//! side. A write to guest memory does not update that cache, so a caller
//! that writes and immediately re-reads must call
//! [`Vmi::pagecache_flush`] in between or it will observe stale data.

pub mod sim;

use bitflags::bitflags;
use thiserror::Error;

use crate::patch::monitor::EventResponse;

/// Page size used for GFN arithmetic throughout the engine.
pub const PAGE_SIZE: u64 = 4096;

/// Shift converting a physical address to a guest frame number.
pub const PAGE_SHIFT: u64 = 12;

bitflags! {
    /// Memory access kinds, both as a watch mask and as the access that
    /// actually triggered an event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMask: u8 {
        /// Read access.
        const R = 1 << 0;
        /// Write access.
        const W = 1 << 1;
        /// Execute (instruction fetch) access.
        const X = 1 << 2;
    }
}

impl AccessMask {
    /// Render the mask the way the diagnostics print it: `R W X` with
    /// underscores for absent components, e.g. `RW_` or `R__`.
    pub fn render(self) -> String {
        let mut s = String::with_capacity(3);
        s.push(if self.contains(AccessMask::R) { 'R' } else { '_' });
        s.push(if self.contains(AccessMask::W) { 'W' } else { '_' });
        s.push(if self.contains(AccessMask::X) { 'X' } else { '_' });
        s
    }
}

/// vCPU registers the engine reads through the boundary.
///
/// The event record already carries the fault-time instruction pointer, so
/// the only register the engine asks for by name is the page-table base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    /// Control register 3: the page-table base of the current context.
    Cr3,
}

/// One memory access event delivered by the hypervisor.
///
/// The triggering vCPU is blocked until the event is answered with
/// [`Vmi::reply_event`]; whatever the handler does directly stalls the
/// guest.
#[derive(Debug, Clone)]
pub struct MemEvent {
    /// Guest frame the access landed in.
    pub gfn: u64,
    /// Offset of the access within the frame.
    pub offset: u64,
    /// Guest linear address of the access.
    pub gla: u64,
    /// The access kinds that actually occurred (may combine R and W).
    pub out_access: AccessMask,
    /// vCPU that triggered the event.
    pub vcpu: u16,
    /// Instruction pointer of the faulting instruction.
    pub rip: u64,
}

/// Errors surfaced by a VMI driver.
///
/// `InvalidHandle` means the caller passed a malformed or uninitialized
/// reference: a programming error, not something to retry.
/// `HypervisorRejected` means the platform call itself failed: an
/// environment, version, or permission problem to surface to the operator.
#[derive(Error, Debug)]
pub enum VmiError {
    /// The VM handle or an identifier passed to the named operation was
    /// invalid.
    #[error("invalid handle passed to {0}")]
    InvalidHandle(&'static str),

    /// The underlying hypervisor call returned a nonzero status.
    #[error("{op} rejected by hypervisor (rc: {rc})")]
    HypervisorRejected {
        /// Name of the failing platform operation.
        op: &'static str,
        /// Raw status code, for the operator.
        rc: i32,
    },

    /// A guest memory read could not be completed.
    #[error("failed to read {len} bytes at {addr:#x}")]
    ReadFailed {
        /// Address the read started at.
        addr: u64,
        /// Number of bytes requested.
        len: usize,
    },

    /// A guest memory write could not be completed.
    #[error("failed to write {len} bytes at {addr:#x}")]
    WriteFailed {
        /// Address the write started at.
        addr: u64,
        /// Number of bytes requested.
        len: usize,
    },

    /// No page-table mapping exists for the virtual address.
    #[error("no translation for virtual address {0:#x}")]
    TranslationFailed(u64),

    /// The guest symbol could not be resolved.
    #[error("unknown guest symbol: {0}")]
    SymbolNotFound(String),
}

/// Capability handle over one running guest.
///
/// The Patch Session Controller owns the handle for the session's lifetime;
/// every other component borrows it. All waits taken through this trait are
/// bounded so an external stop request is observed promptly.
pub trait Vmi {
    // ----- lifecycle -----

    /// Pause the guest. Idempotent.
    fn pause(&mut self) -> Result<(), VmiError>;

    /// Resume the guest. Idempotent.
    fn resume(&mut self) -> Result<(), VmiError>;

    /// Width of a guest pointer in bytes (4 or 8).
    fn address_width(&self) -> u8;

    // ----- memory -----

    /// Read `buf.len()` bytes of guest physical memory at `paddr`.
    fn read_phys(&mut self, paddr: u64, buf: &mut [u8]) -> Result<(), VmiError>;

    /// Write `buf.len()` bytes of guest physical memory at `paddr`.
    fn write_phys(&mut self, paddr: u64, buf: &[u8]) -> Result<(), VmiError>;

    /// Read guest memory at virtual address `vaddr` in the address space of
    /// `pid` (0 = kernel). Served through the driver's page cache.
    fn read_va(&mut self, vaddr: u64, pid: u32, buf: &mut [u8]) -> Result<(), VmiError>;

    /// Write guest memory at virtual address `vaddr`. Does not update the
    /// page cache; callers that re-read must flush first.
    fn write_va(&mut self, vaddr: u64, pid: u32, buf: &[u8]) -> Result<(), VmiError>;

    /// Drop every cached page so subsequent virtual reads observe current
    /// memory contents.
    fn pagecache_flush(&mut self);

    /// Translate `vaddr` through the page tables rooted at `dtb`.
    fn pagetable_lookup(&mut self, dtb: u64, vaddr: u64) -> Result<u64, VmiError>;

    /// Resolve a kernel symbol to its virtual address.
    fn translate_ksym(&mut self, symbol: &str) -> Result<u64, VmiError>;

    /// Read a vCPU register.
    fn get_vcpu_reg(&mut self, reg: Reg, vcpu: u16) -> Result<u64, VmiError>;

    /// Highest guest frame number known at attach time. A snapshot, not
    /// live-updated as the guest's memory grows.
    fn max_gpfn(&self) -> u64;

    // ----- events -----

    /// Watch `gfn` for the access kinds in `mask`.
    fn register_mem_event(&mut self, gfn: u64, mask: AccessMask) -> Result<(), VmiError>;

    /// Stop watching `gfn`.
    fn clear_mem_event(&mut self, gfn: u64) -> Result<(), VmiError>;

    /// Block up to `timeout_ms` for one access event. `Ok(None)` is a
    /// timeout, distinct from failure: it is the cooperative-cancellation
    /// point of the whole engine.
    fn wait_event(&mut self, timeout_ms: u64) -> Result<Option<MemEvent>, VmiError>;

    /// Answer an outstanding event, unblocking the triggering vCPU.
    fn reply_event(&mut self, event: &MemEvent, response: EventResponse)
        -> Result<(), VmiError>;

    // ----- alternate views (altp2m) -----

    /// Whether the alternate-view subsystem is enabled for this domain.
    fn slat_get_domain_state(&mut self) -> Result<bool, VmiError>;

    /// Globally enable or disable the alternate-view subsystem.
    fn slat_set_domain_state(&mut self, enabled: bool) -> Result<(), VmiError>;

    /// Create a new view. Pages not explicitly remapped default to no
    /// access.
    fn slat_create(&mut self) -> Result<u16, VmiError>;

    /// Destroy a view.
    fn slat_destroy(&mut self, view: u16) -> Result<(), VmiError>;

    /// Make `view` the active view for the calling context (0 = default).
    fn slat_switch(&mut self, view: u16) -> Result<(), VmiError>;

    /// Within `view`, redirect accesses to `old_gfn` onto the machine frame
    /// backing `new_gfn`. Last write wins for repeated remaps of the same
    /// `old_gfn`.
    fn slat_change_gfn(&mut self, view: u16, old_gfn: u64, new_gfn: u64)
        -> Result<(), VmiError>;

    // ----- domain memory -----

    /// Current domain memory ceiling in KiB.
    fn max_mem(&mut self) -> Result<u64, VmiError>;

    /// Set the domain memory ceiling in KiB (`u64::MAX` = unlimited).
    fn set_max_mem(&mut self, kib: u64) -> Result<(), VmiError>;

    /// Reserve exactly one physical frame from the hypervisor free pool and
    /// return its GFN.
    fn alloc_gfn(&mut self) -> Result<u64, VmiError>;

    /// Return one reserved frame to the hypervisor free pool.
    fn free_gfn(&mut self, gfn: u64) -> Result<(), VmiError>;

    // ----- typed helpers -----

    /// Read a little-endian u32 at a virtual address.
    fn read_u32_va(&mut self, vaddr: u64, pid: u32) -> Result<u32, VmiError> {
        let mut buf = [0u8; 4];
        self.read_va(vaddr, pid, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write a little-endian u32 at a virtual address.
    fn write_u32_va(&mut self, vaddr: u64, pid: u32, value: u32) -> Result<(), VmiError> {
        self.write_va(vaddr, pid, &value.to_le_bytes())
    }

    /// Read a little-endian u64 at a virtual address.
    fn read_u64_va(&mut self, vaddr: u64, pid: u32) -> Result<u64, VmiError> {
        let mut buf = [0u8; 8];
        self.read_va(vaddr, pid, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mask_render() {
        assert_eq!((AccessMask::R | AccessMask::W).render(), "RW_");
        assert_eq!(AccessMask::R.render(), "R__");
        assert_eq!(AccessMask::empty().render(), "___");
        assert_eq!((AccessMask::R | AccessMask::W | AccessMask::X).render(), "RWX");
    }
}
