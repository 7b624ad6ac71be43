//! In-process simulated guest.
//!
//! `SimVmi` is a deterministic [`Vmi`] driver over a flat block of "guest"
//! memory. It exists so the engine can be exercised end to end without a
//! hypervisor: the demo tool attaches to it, and every test drives it.
//!
//! # What is simulated
//!
//! - **Memory**: one flat physical range, identity-mapped (VA == PA, any
//!   DTB accepted). Virtual reads go through a page-granular read cache
//!   that writes do not update, mirroring the introspection layer's
//!   read-through cache; [`Vmi::pagecache_flush`] drops it.
//! - **Readers**: scripted guest accesses queued with [`SimVmi::queue_read`]
//!   / [`SimVmi::queue_access`]. Each carries the instruction bytes the
//!   "guest" executes; the driver places them at a code address so the
//!   engine can fetch the 15-byte window at the event's RIP. An access that
//!   hits the watched frame is delivered as a [`MemEvent`]; anything else
//!   completes silently against real memory.
//! - **Observations**: what each scripted reader actually saw — emulated
//!   bytes, real memory, or an injected fault — recorded in order. This is
//!   how tests check the stealth illusion from the reader's side.
//! - **Alternate views**: per-view GFN remap tables. Physical reads and
//!   writes resolve through the active view, so switching views changes
//!   what an observer reads from a remapped frame.
//! - **Memory ceiling**: frame reservation fails once the domain's memory
//!   ceiling would be exceeded, which is exactly why the view layer raises
//!   the ceiling before reserving pages.

use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::Duration;

use super::{AccessMask, MemEvent, Reg, Vmi, VmiError, PAGE_SHIFT, PAGE_SIZE};
use crate::patch::monitor::EventResponse;

/// Default guest memory size: 2 MiB.
const DEFAULT_RAM: usize = 2 * 1024 * 1024;

/// Where scripted reader instructions are placed, one 16-byte slot each.
const CODE_BASE: u64 = 0x10_0000;

/// Arbitrary page-aligned CR3 value exposed to the engine.
const SIM_CR3: u64 = 0x4000;

/// One scripted guest access.
#[derive(Debug, Clone)]
pub struct SimAccess {
    /// Linear address the access targets.
    pub gla: u64,
    /// Access kinds the instruction performs.
    pub access: AccessMask,
    /// Instruction pointer the access executes at.
    pub rip: u64,
    /// Bytes the access moves (how wide the reader reads).
    pub width: usize,
}

/// What a scripted access observed once it completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// A read completed; these are the bytes the reader saw.
    Read(Vec<u8>),
    /// A non-read access passed through unmodified.
    Access(AccessMask),
    /// A fault was injected instead of completing the access.
    Fault(u8),
}

/// Simulated guest implementing the full [`Vmi`] boundary.
pub struct SimVmi {
    ram: Vec<u8>,
    paused: bool,
    address_width: u8,

    symbols: HashMap<String, u64>,
    page_cache: HashMap<u64, Vec<u8>>,

    watch: Option<(u64, AccessMask)>,
    pending: VecDeque<SimAccess>,
    inflight: Option<SimAccess>,
    observed: Vec<Observation>,
    next_code_slot: u64,

    slat_enabled: bool,
    views: HashMap<u16, HashMap<u64, u64>>,
    active_view: u16,
    next_view_id: u16,

    max_mem_kib: u64,
    max_gpfn: u64,
    next_alloc_gfn: u64,
    allocated: Vec<u64>,
}

impl SimVmi {
    /// Create a simulated guest with the default 2 MiB of memory.
    pub fn new() -> Self {
        Self::with_ram(DEFAULT_RAM)
    }

    /// Create a simulated guest with `ram_bytes` of memory (rounded up to a
    /// whole number of pages).
    pub fn with_ram(ram_bytes: usize) -> Self {
        let pages = ram_bytes.div_ceil(PAGE_SIZE as usize).max(1);
        let ram = vec![0u8; pages * PAGE_SIZE as usize];
        let max_gpfn = pages as u64 - 1;
        Self {
            max_mem_kib: ram.len() as u64 / 1024,
            ram,
            paused: false,
            address_width: 8,
            symbols: HashMap::new(),
            page_cache: HashMap::new(),
            watch: None,
            pending: VecDeque::new(),
            inflight: None,
            observed: Vec::new(),
            next_code_slot: CODE_BASE,
            slat_enabled: false,
            views: HashMap::new(),
            active_view: 0,
            next_view_id: 1,
            max_gpfn,
            next_alloc_gfn: max_gpfn + 1,
            allocated: Vec::new(),
        }
    }

    /// Register a kernel symbol at `vaddr`.
    pub fn define_symbol(&mut self, name: &str, vaddr: u64) {
        self.symbols.insert(name.to_string(), vaddr);
    }

    /// Queue a scripted read of `width` bytes at `gla`, executed by the
    /// instruction bytes in `insn`.
    pub fn queue_read(&mut self, gla: u64, insn: &[u8], width: usize) {
        self.queue_access(gla, AccessMask::R, insn, width);
    }

    /// Queue a scripted access with an explicit access mask.
    ///
    /// The instruction bytes are written into guest memory at a fresh code
    /// slot so the engine can read the faulting instruction window at the
    /// event's RIP.
    pub fn queue_access(&mut self, gla: u64, access: AccessMask, insn: &[u8], width: usize) {
        let rip = self.next_code_slot;
        self.next_code_slot += 16;
        let start = rip as usize;
        self.ram[start..start + insn.len()].copy_from_slice(insn);
        self.pending.push_back(SimAccess {
            gla,
            access,
            rip,
            width,
        });
    }

    /// Scripted accesses not yet delivered or completed.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// What each completed scripted access observed, in order.
    pub fn observations(&self) -> &[Observation] {
        &self.observed
    }

    /// Whether the guest is currently paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Resolve a GFN through the active view's remap table.
    fn resolve_gfn(&self, gfn: u64) -> u64 {
        if self.active_view == 0 {
            return gfn;
        }
        match self.views.get(&self.active_view) {
            Some(remaps) => *remaps.get(&gfn).unwrap_or(&gfn),
            None => gfn,
        }
    }

    /// Read `buf.len()` bytes at physical `paddr`, resolved through the
    /// active view, straight from backing memory (no cache).
    fn backing_read(&self, paddr: u64, buf: &mut [u8]) -> Result<(), VmiError> {
        let mut addr = paddr;
        let mut done = 0;
        while done < buf.len() {
            let page = self.resolve_gfn(addr >> PAGE_SHIFT);
            let offset = (addr & (PAGE_SIZE - 1)) as usize;
            let chunk = (buf.len() - done).min(PAGE_SIZE as usize - offset);
            let start = (page << PAGE_SHIFT) as usize + offset;
            let end = start + chunk;
            if end > self.ram.len() {
                return Err(VmiError::ReadFailed {
                    addr: paddr,
                    len: buf.len(),
                });
            }
            buf[done..done + chunk].copy_from_slice(&self.ram[start..end]);
            done += chunk;
            addr += chunk as u64;
        }
        Ok(())
    }

    fn backing_write(&mut self, paddr: u64, buf: &[u8]) -> Result<(), VmiError> {
        let mut addr = paddr;
        let mut done = 0;
        while done < buf.len() {
            let page = self.resolve_gfn(addr >> PAGE_SHIFT);
            let offset = (addr & (PAGE_SIZE - 1)) as usize;
            let chunk = (buf.len() - done).min(PAGE_SIZE as usize - offset);
            let start = (page << PAGE_SHIFT) as usize + offset;
            let end = start + chunk;
            if end > self.ram.len() {
                return Err(VmiError::WriteFailed {
                    addr: paddr,
                    len: buf.len(),
                });
            }
            self.ram[start..end].copy_from_slice(&buf[done..done + chunk]);
            done += chunk;
            addr += chunk as u64;
        }
        Ok(())
    }

    /// Complete a scripted access against real memory and record what the
    /// reader observed.
    fn complete_against_memory(&mut self, access: &SimAccess) {
        if access.access.contains(AccessMask::R) {
            let mut buf = vec![0u8; access.width];
            match self.backing_read(access.gla, &mut buf) {
                Ok(()) => self.observed.push(Observation::Read(buf)),
                Err(_) => self.observed.push(Observation::Fault(0)),
            }
        } else {
            self.observed.push(Observation::Access(access.access));
        }
    }
}

impl Default for SimVmi {
    fn default() -> Self {
        Self::new()
    }
}

impl Vmi for SimVmi {
    fn pause(&mut self) -> Result<(), VmiError> {
        self.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), VmiError> {
        self.paused = false;
        Ok(())
    }

    fn address_width(&self) -> u8 {
        self.address_width
    }

    fn read_phys(&mut self, paddr: u64, buf: &mut [u8]) -> Result<(), VmiError> {
        self.backing_read(paddr, buf)
    }

    fn write_phys(&mut self, paddr: u64, buf: &[u8]) -> Result<(), VmiError> {
        self.backing_write(paddr, buf)
    }

    fn read_va(&mut self, vaddr: u64, _pid: u32, buf: &mut [u8]) -> Result<(), VmiError> {
        // Identity translation, then a page-granular read-through cache
        // keyed by the machine frame the access resolves to. Writes bypass
        // the cache, so a write followed by a read without a flush returns
        // stale bytes, like the real introspection layer.
        let mut addr = vaddr;
        let mut done = 0;
        while done < buf.len() {
            let page = self.resolve_gfn(addr >> PAGE_SHIFT);
            let offset = (addr & (PAGE_SIZE - 1)) as usize;
            let chunk = (buf.len() - done).min(PAGE_SIZE as usize - offset);
            let start = (page << PAGE_SHIFT) as usize;
            if start + PAGE_SIZE as usize > self.ram.len() {
                return Err(VmiError::ReadFailed {
                    addr: vaddr,
                    len: buf.len(),
                });
            }
            let cached = self
                .page_cache
                .entry(page)
                .or_insert_with(|| self.ram[start..start + PAGE_SIZE as usize].to_vec());
            buf[done..done + chunk].copy_from_slice(&cached[offset..offset + chunk]);
            done += chunk;
            addr += chunk as u64;
        }
        Ok(())
    }

    fn write_va(&mut self, vaddr: u64, _pid: u32, buf: &[u8]) -> Result<(), VmiError> {
        self.backing_write(vaddr, buf)
    }

    fn pagecache_flush(&mut self) {
        self.page_cache.clear();
    }

    fn pagetable_lookup(&mut self, _dtb: u64, vaddr: u64) -> Result<u64, VmiError> {
        // Identity-mapped guest: any DTB, VA == PA, as long as the address
        // exists at all.
        if vaddr >= self.ram.len() as u64 {
            return Err(VmiError::TranslationFailed(vaddr));
        }
        Ok(vaddr)
    }

    fn translate_ksym(&mut self, symbol: &str) -> Result<u64, VmiError> {
        self.symbols
            .get(symbol)
            .copied()
            .ok_or_else(|| VmiError::SymbolNotFound(symbol.to_string()))
    }

    fn get_vcpu_reg(&mut self, reg: Reg, vcpu: u16) -> Result<u64, VmiError> {
        if vcpu != 0 {
            return Err(VmiError::InvalidHandle("get_vcpu_reg"));
        }
        match reg {
            Reg::Cr3 => Ok(SIM_CR3),
        }
    }

    fn max_gpfn(&self) -> u64 {
        self.max_gpfn
    }

    fn register_mem_event(&mut self, gfn: u64, mask: AccessMask) -> Result<(), VmiError> {
        if self.watch.is_some() {
            // EBUSY: one watched frame at a time.
            return Err(VmiError::HypervisorRejected {
                op: "register_mem_event",
                rc: -16,
            });
        }
        if mask.is_empty() {
            return Err(VmiError::HypervisorRejected {
                op: "register_mem_event",
                rc: -22,
            });
        }
        self.watch = Some((gfn, mask));
        Ok(())
    }

    fn clear_mem_event(&mut self, gfn: u64) -> Result<(), VmiError> {
        match self.watch {
            Some((watched, _)) if watched == gfn => {
                self.watch = None;
                Ok(())
            }
            _ => Err(VmiError::HypervisorRejected {
                op: "clear_mem_event",
                rc: -2,
            }),
        }
    }

    fn wait_event(&mut self, timeout_ms: u64) -> Result<Option<MemEvent>, VmiError> {
        if self.inflight.is_some() {
            return Err(VmiError::InvalidHandle("wait_event"));
        }
        while let Some(access) = self.pending.pop_front() {
            let gfn = access.gla >> PAGE_SHIFT;
            let delivered = match self.watch {
                Some((watched, mask)) => watched == gfn && access.access.intersects(mask),
                None => false,
            };
            if delivered {
                let event = MemEvent {
                    gfn,
                    offset: access.gla & (PAGE_SIZE - 1),
                    gla: access.gla,
                    out_access: access.access,
                    vcpu: 0,
                    rip: access.rip,
                };
                self.inflight = Some(access);
                return Ok(Some(event));
            }
            // Unwatched accesses complete against memory without a trap.
            self.complete_against_memory(&access);
        }
        thread::sleep(Duration::from_millis(timeout_ms));
        Ok(None)
    }

    fn reply_event(&mut self, _event: &MemEvent, response: EventResponse)
        -> Result<(), VmiError> {
        let access = self
            .inflight
            .take()
            .ok_or(VmiError::InvalidHandle("reply_event"))?;
        match response {
            EventResponse::NoOp => self.complete_against_memory(&access),
            EventResponse::EmulateRead(data) => {
                self.observed.push(Observation::Read(data.bytes().to_vec()));
            }
            EventResponse::InjectFault(vector) => {
                self.observed.push(Observation::Fault(vector));
            }
        }
        Ok(())
    }

    fn slat_get_domain_state(&mut self) -> Result<bool, VmiError> {
        Ok(self.slat_enabled)
    }

    fn slat_set_domain_state(&mut self, enabled: bool) -> Result<(), VmiError> {
        self.slat_enabled = enabled;
        Ok(())
    }

    fn slat_create(&mut self) -> Result<u16, VmiError> {
        if !self.slat_enabled {
            // EOPNOTSUPP until the domain state is switched on.
            return Err(VmiError::HypervisorRejected {
                op: "altp2m_create_view",
                rc: -95,
            });
        }
        let id = self.next_view_id;
        self.next_view_id += 1;
        self.views.insert(id, HashMap::new());
        Ok(id)
    }

    fn slat_destroy(&mut self, view: u16) -> Result<(), VmiError> {
        if self.views.remove(&view).is_none() {
            return Err(VmiError::HypervisorRejected {
                op: "altp2m_destroy_view",
                rc: -22,
            });
        }
        Ok(())
    }

    fn slat_switch(&mut self, view: u16) -> Result<(), VmiError> {
        if view != 0 && !self.views.contains_key(&view) {
            return Err(VmiError::HypervisorRejected {
                op: "altp2m_switch_view",
                rc: -22,
            });
        }
        self.active_view = view;
        Ok(())
    }

    fn slat_change_gfn(&mut self, view: u16, old_gfn: u64, new_gfn: u64)
        -> Result<(), VmiError> {
        match self.views.get_mut(&view) {
            Some(remaps) => {
                remaps.insert(old_gfn, new_gfn);
                Ok(())
            }
            None => Err(VmiError::HypervisorRejected {
                op: "altp2m_change_gfn",
                rc: -22,
            }),
        }
    }

    fn max_mem(&mut self) -> Result<u64, VmiError> {
        Ok(self.max_mem_kib)
    }

    fn set_max_mem(&mut self, kib: u64) -> Result<(), VmiError> {
        self.max_mem_kib = kib;
        Ok(())
    }

    fn alloc_gfn(&mut self) -> Result<u64, VmiError> {
        let gfn = self.next_alloc_gfn;
        let needed_kib = ((gfn + 1) * PAGE_SIZE) / 1024;
        if needed_kib > self.max_mem_kib {
            // ENOMEM: the domain memory ceiling is in the way.
            return Err(VmiError::HypervisorRejected {
                op: "populate_physmap",
                rc: -12,
            });
        }
        self.next_alloc_gfn += 1;
        let end = ((gfn + 1) << PAGE_SHIFT) as usize;
        if end > self.ram.len() {
            self.ram.resize(end, 0);
        }
        self.allocated.push(gfn);
        Ok(gfn)
    }

    fn free_gfn(&mut self, gfn: u64) -> Result<(), VmiError> {
        match self.allocated.iter().position(|&g| g == gfn) {
            Some(idx) => {
                self.allocated.swap_remove(idx);
                Ok(())
            }
            None => Err(VmiError::HypervisorRejected {
                op: "decrease_reservation",
                rc: -22,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagecache_masks_writes_until_flush() {
        let mut vmi = SimVmi::new();
        vmi.write_u32_va(0x1000, 0, 0x1111_2222).unwrap();

        // Populate the cache, then write behind it.
        assert_eq!(vmi.read_u32_va(0x1000, 0).unwrap(), 0x1111_2222);
        vmi.write_u32_va(0x1000, 0, 0x3333_4444).unwrap();
        assert_eq!(vmi.read_u32_va(0x1000, 0).unwrap(), 0x1111_2222);

        vmi.pagecache_flush();
        assert_eq!(vmi.read_u32_va(0x1000, 0).unwrap(), 0x3333_4444);
    }

    #[test]
    fn test_symbol_resolution() {
        let mut vmi = SimVmi::new();
        vmi.define_symbol("watched_entry", 0x8000);
        assert_eq!(vmi.translate_ksym("watched_entry").unwrap(), 0x8000);
        assert!(matches!(
            vmi.translate_ksym("missing"),
            Err(VmiError::SymbolNotFound(_))
        ));
    }

    #[test]
    fn test_translation_is_identity_and_bounded() {
        let mut vmi = SimVmi::new();
        assert_eq!(vmi.pagetable_lookup(SIM_CR3, 0x1234).unwrap(), 0x1234);
        assert!(matches!(
            vmi.pagetable_lookup(SIM_CR3, u64::MAX),
            Err(VmiError::TranslationFailed(_))
        ));
    }

    #[test]
    fn test_unwatched_access_completes_against_memory() {
        let mut vmi = SimVmi::new();
        vmi.write_u32_va(0x2000, 0, 0xaabb_ccdd).unwrap();
        vmi.queue_read(0x2000, &[0x8b, 0x00], 4);

        // Nothing watched: the access never becomes an event.
        assert!(vmi.wait_event(1).unwrap().is_none());
        assert_eq!(
            vmi.observations(),
            &[Observation::Read(vec![0xdd, 0xcc, 0xbb, 0xaa])]
        );
    }

    #[test]
    fn test_watched_access_round_trip() {
        let mut vmi = SimVmi::new();
        vmi.write_u32_va(0x2004, 0, 0xaabb_ccdd).unwrap();
        vmi.register_mem_event(0x2, AccessMask::R | AccessMask::W).unwrap();
        vmi.queue_read(0x2004, &[0x8b, 0x00], 4);

        let event = vmi.wait_event(1).unwrap().expect("event expected");
        assert_eq!(event.gfn, 0x2);
        assert_eq!(event.gla, 0x2004);
        assert_eq!(event.offset, 0x4);
        assert!(event.out_access.contains(AccessMask::R));

        vmi.reply_event(&event, EventResponse::NoOp).unwrap();
        assert_eq!(
            vmi.observations(),
            &[Observation::Read(vec![0xdd, 0xcc, 0xbb, 0xaa])]
        );
    }

    #[test]
    fn test_injected_fault_is_observed() {
        let mut vmi = SimVmi::new();
        vmi.register_mem_event(0x2, AccessMask::R).unwrap();
        vmi.queue_read(0x2000, &[0x8b, 0x00], 4);

        let event = vmi.wait_event(1).unwrap().expect("event expected");
        vmi.reply_event(&event, EventResponse::InjectFault(14)).unwrap();
        assert_eq!(vmi.observations(), &[Observation::Fault(14)]);
    }

    #[test]
    fn test_single_watch_at_a_time() {
        let mut vmi = SimVmi::new();
        vmi.register_mem_event(0x2, AccessMask::R).unwrap();
        assert!(vmi.register_mem_event(0x3, AccessMask::R).is_err());
        vmi.clear_mem_event(0x2).unwrap();
        vmi.register_mem_event(0x3, AccessMask::R).unwrap();
    }

    #[test]
    fn test_ceiling_blocks_reservation() {
        let mut vmi = SimVmi::new();
        assert!(matches!(
            vmi.alloc_gfn(),
            Err(VmiError::HypervisorRejected { rc: -12, .. })
        ));

        vmi.set_max_mem(u64::MAX).unwrap();
        let gfn = vmi.alloc_gfn().unwrap();
        assert!(gfn > vmi.max_gpfn());
        vmi.free_gfn(gfn).unwrap();
        assert!(vmi.free_gfn(gfn).is_err());
    }
}
