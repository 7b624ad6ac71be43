//! Patch session orchestration.
//!
//! A session owns the VM handle for its whole run and walks the states
//! `Unpatched → Patched → Protected → (event loop) → Restoring →
//! Unpatched`:
//!
//! 1. [`PatchSession::apply`] captures the true value at the target
//!    location and writes the patch over it.
//! 2. [`PatchSession::protect`] translates the location down to its guest
//!    frame and registers the read|write watch with the [`ReadShield`]
//!    handler.
//! 3. [`PatchSession::run_until_stopped`] drives the bounded event loop;
//!    every trapped read of the patched location is answered with the
//!    true value, so readers cannot tell the memory was modified.
//! 4. [`PatchSession::shutdown`] restores the true value, drops the watch,
//!    and resumes the guest, on every exit path. Leaving the guest paused
//!    is a worse failure than leaving the patch unrepaired, so teardown
//!    steps are best-effort and never abort each other.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use super::emulate;
use super::insn::{self, Mode, MAX_INSN_LEN};
use super::monitor::{AccessMonitor, EventResponse, MemEventHandler, MonitorError};
use crate::vmi::{AccessMask, MemEvent, Reg, Vmi, VmiError, PAGE_SHIFT};

/// Errors during session setup. Per-event errors never surface here; they
/// degrade to no-op responses inside the handler.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Reading the prior value or writing the patch failed.
    #[error("failed to apply patch at {location:#x}: {source}")]
    ApplyFailed {
        /// Location the patch targeted.
        location: u64,
        /// Underlying platform error.
        #[source]
        source: VmiError,
    },

    /// The operation needs an applied patch and there is none.
    #[error("no patch is applied")]
    NotPatched,

    /// Watch registration or event dispatch failed.
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// A platform call outside apply/monitor failed.
    #[error(transparent)]
    Vmi(#[from] VmiError),
}

/// One applied patch: where, what was there, what is there now.
#[derive(Debug, Clone)]
pub struct PatchRecord {
    location: u64,
    true_value: u32,
    patched_value: u32,
    applied: bool,
}

impl PatchRecord {
    /// Virtual address of the patched word.
    pub fn location(&self) -> u64 {
        self.location
    }

    /// The value captured before corruption. Immutable for the record's
    /// lifetime; this is what readers are shown.
    pub fn true_value(&self) -> u32 {
        self.true_value
    }

    /// The value written over the true one.
    pub fn patched_value(&self) -> u32 {
        self.patched_value
    }

    /// Whether the patch is still in guest memory. This is the authority
    /// for whether cleanup-on-exit must act; it flips to false only after
    /// a verified restoring write.
    pub fn is_applied(&self) -> bool {
        self.applied
    }
}

/// The read-event handler: answers reads of the patched location with the
/// true value.
///
/// An explicit context value (true value, location, processor mode) rather
/// than ambient state, so the monitor stays reusable and the handler can
/// be driven directly in tests.
pub struct ReadShield {
    true_value: u32,
    location: u64,
    mode: Mode,
}

impl ReadShield {
    /// Build a shield for one patched location.
    pub fn new(true_value: u32, location: u64, mode: Mode) -> Self {
        Self {
            true_value,
            location,
            mode,
        }
    }
}

impl<V: Vmi> MemEventHandler<V> for ReadShield {
    fn on_event(&mut self, vmi: &mut V, event: &MemEvent) -> EventResponse {
        eprintln!(
            "[SHIELD] {} access at {:#x} on frame {:#x} (offset {:#x}), insn at {:#x}",
            event.out_access.render(),
            event.gla,
            event.gfn,
            event.offset,
            event.rip
        );

        // Only the read side is substituted; write or execute components
        // of a combined access pass through unmodified.
        if !event.out_access.contains(AccessMask::R) {
            return EventResponse::NoOp;
        }

        // Fetch the faulting instruction window. Any failure from here on
        // degrades to a no-op: the reader then sees the patched value,
        // which costs stealth but never guest liveness.
        let mut window = [0u8; MAX_INSN_LEN];
        if let Err(e) = vmi.read_va(event.rip, 0, &mut window) {
            eprintln!("[SHIELD] failed to read insn window at {:#x}: {e}", event.rip);
            return EventResponse::NoOp;
        }

        let width = match insn::access_size(&window, self.mode) {
            Ok(width) => width,
            Err(e) => {
                eprintln!("[SHIELD] cannot size read at {:#x}: {e}", event.rip);
                return EventResponse::NoOp;
            }
        };

        if event.gla != self.location {
            // Same frame, different location: not ours to hide.
            return EventResponse::NoOp;
        }

        eprintln!(
            "[SHIELD] read of patched location, emulating {} byte(s)",
            width.bytes()
        );
        EventResponse::EmulateRead(emulate::substitute(u64::from(self.true_value), width))
    }
}

/// Orchestrates patch application, protection, the event loop, and
/// guaranteed restoration.
pub struct PatchSession<V: Vmi> {
    vmi: V,
    monitor: AccessMonitor,
    record: Option<PatchRecord>,
    mode: Mode,
}

impl<V: Vmi> PatchSession<V> {
    /// Take ownership of the VM handle for the session's lifetime.
    pub fn new(vmi: V) -> Self {
        let mode = if vmi.address_width() == 8 {
            Mode::Bits64
        } else {
            Mode::Bits32
        };
        Self {
            vmi,
            monitor: AccessMonitor::new(),
            record: None,
            mode,
        }
    }

    /// Borrow the VM handle.
    pub fn vmi_mut(&mut self) -> &mut V {
        &mut self.vmi
    }

    /// The current patch record, if a patch was applied.
    pub fn record(&self) -> Option<&PatchRecord> {
        self.record.as_ref()
    }

    /// Whether a patch is currently applied in guest memory.
    pub fn is_patched(&self) -> bool {
        self.record.as_ref().is_some_and(PatchRecord::is_applied)
    }

    /// Pause the guest.
    pub fn pause(&mut self) -> Result<(), SessionError> {
        self.vmi.pause()?;
        Ok(())
    }

    /// Resume the guest.
    pub fn resume(&mut self) -> Result<(), SessionError> {
        self.vmi.resume()?;
        Ok(())
    }

    /// Capture the true value at `location`, then write `new_value` over
    /// it.
    ///
    /// The read-through page cache is flushed after the write so the
    /// verification re-read (and everything after it) observes the patch
    /// immediately; a stale cache would mask the very modification this
    /// session exists to hide. On write failure no record is kept and no
    /// restoration is attempted later.
    pub fn apply(&mut self, location: u64, new_value: u32) -> Result<(), SessionError> {
        let true_value = self
            .vmi
            .read_u32_va(location, 0)
            .map_err(|source| SessionError::ApplyFailed { location, source })?;
        self.vmi
            .write_u32_va(location, 0, new_value)
            .map_err(|source| SessionError::ApplyFailed { location, source })?;
        self.record = Some(PatchRecord {
            location,
            true_value,
            patched_value: new_value,
            applied: true,
        });

        self.vmi.pagecache_flush();
        let written = self
            .vmi
            .read_u32_va(location, 0)
            .map_err(|source| SessionError::ApplyFailed { location, source })?;
        eprintln!(
            "[SESSION] patched {:#x}: {:#x} -> {:#x}",
            location, true_value, written
        );
        Ok(())
    }

    /// Translate the patched location to its guest frame and register the
    /// read|write watch over it.
    pub fn protect(&mut self) -> Result<u64, SessionError> {
        let location = self
            .record
            .as_ref()
            .ok_or(SessionError::NotPatched)?
            .location;

        // The page-table base of the current context, low bits masked off.
        let cr3 = self.vmi.get_vcpu_reg(Reg::Cr3, 0)?;
        let dtb = cr3 & !0xfff;
        let paddr = self.vmi.pagetable_lookup(dtb, location)?;
        let gfn = paddr >> PAGE_SHIFT;

        self.monitor
            .register(&mut self.vmi, gfn, AccessMask::R | AccessMask::W)?;
        Ok(gfn)
    }

    /// One bounded wait on the event loop. A timeout returns `Ok(())`.
    pub fn run_once(&mut self, timeout_ms: u64) -> Result<(), SessionError> {
        let record = self.record.as_ref().ok_or(SessionError::NotPatched)?;
        let mut shield = ReadShield::new(record.true_value, record.location, self.mode);
        self.monitor.run(&mut self.vmi, timeout_ms, &mut shield)?;
        Ok(())
    }

    /// Drive the event loop until `stop` becomes true or a hard error
    /// occurs. `stop` is observed between bounded waits, which is the
    /// only cancellation point.
    pub fn run_until_stopped(
        &mut self,
        stop: &AtomicBool,
        poll_ms: u64,
    ) -> Result<(), SessionError> {
        while !stop.load(Ordering::SeqCst) {
            self.run_once(poll_ms)?;
        }
        Ok(())
    }

    /// Write the true value back over the patch, if one is applied.
    ///
    /// Best-effort: failures are logged and never escalated, because this
    /// runs during teardown which must proceed regardless. The record's
    /// `is_applied` flips only after the restoring write verifies.
    pub fn restore(&mut self) {
        let Some(record) = self.record.as_mut() else {
            return;
        };
        if !record.applied {
            return;
        }

        eprintln!(
            "[SESSION] restoring {:#x} at {:#x}",
            record.true_value, record.location
        );
        if let Err(e) = self
            .vmi
            .write_u32_va(record.location, 0, record.true_value)
        {
            eprintln!("[SESSION] warning: failed to restore patch: {e}");
            return;
        }
        self.vmi.pagecache_flush();
        match self.vmi.read_u32_va(record.location, 0) {
            Ok(value) if value == record.true_value => record.applied = false,
            Ok(value) => {
                eprintln!("[SESSION] warning: restore verification read {value:#x}");
            }
            Err(e) => eprintln!("[SESSION] warning: failed to verify restore: {e}"),
        }
    }

    /// Unconditional teardown: restore the patch, drop the watch, resume
    /// the guest. Every step is best-effort; runs on every exit path.
    pub fn shutdown(&mut self) {
        self.restore();
        self.monitor.unregister(&mut self.vmi);
        if let Err(e) = self.vmi.resume() {
            eprintln!("[SESSION] warning: failed to resume guest: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmi::sim::{Observation, SimVmi};

    const LOCATION: u64 = 0x8000;
    const TRUE_VALUE: u32 = 0x0000_1234;

    fn patched_session() -> PatchSession<SimVmi> {
        let mut vmi = SimVmi::new();
        vmi.write_u32_va(LOCATION, 0, TRUE_VALUE).unwrap();
        vmi.pause().unwrap();
        let mut session = PatchSession::new(vmi);
        session.apply(LOCATION, 0).unwrap();
        session
    }

    #[test]
    fn test_patch_round_trip_is_bit_identical() {
        let mut session = patched_session();
        assert!(session.is_patched());
        assert_eq!(session.vmi_mut().read_u32_va(LOCATION, 0).unwrap(), 0);

        session.restore();
        assert!(!session.is_patched());
        assert_eq!(
            session.vmi_mut().read_u32_va(LOCATION, 0).unwrap(),
            TRUE_VALUE
        );
    }

    #[test]
    fn test_failed_apply_keeps_no_record() {
        let mut session = PatchSession::new(SimVmi::new());
        // Far beyond the simulated guest's memory.
        assert!(matches!(
            session.apply(u64::MAX - 0x1000, 0),
            Err(SessionError::ApplyFailed { .. })
        ));
        assert!(session.record().is_none());
        // Restore with no record is a no-op.
        session.restore();
    }

    #[test]
    fn test_protect_registers_the_right_frame() {
        let mut session = patched_session();
        let gfn = session.protect().unwrap();
        assert_eq!(gfn, LOCATION >> PAGE_SHIFT);
    }

    #[test]
    fn test_end_to_end_stealth_scenario() {
        let mut session = patched_session();
        session.protect().unwrap();

        let vmi = session.vmi_mut();
        // mov eax, [rax]: 4-byte read, emulated
        vmi.queue_read(LOCATION, &[0x8b, 0x00], 4);
        // mov al, [rax]: 1-byte read, emulated
        vmi.queue_read(LOCATION, &[0x8a, 0x00], 1);
        // add eax, [rax]: unsupported, the real (corrupted) value shows
        vmi.queue_read(LOCATION, &[0x03, 0x00], 4);

        session.resume().unwrap();
        for _ in 0..3 {
            session.run_once(1).unwrap();
        }

        assert_eq!(
            session.vmi_mut().observations(),
            &[
                Observation::Read(vec![0x34, 0x12, 0x00, 0x00]),
                Observation::Read(vec![0x34]),
                Observation::Read(vec![0x00, 0x00, 0x00, 0x00]),
            ]
        );
    }

    #[test]
    fn test_read_elsewhere_in_frame_is_not_emulated() {
        let mut session = patched_session();
        session.protect().unwrap();

        let vmi = session.vmi_mut();
        vmi.write_u32_va(LOCATION + 0x10, 0, 0xcafe_f00d).unwrap();
        vmi.queue_read(LOCATION + 0x10, &[0x8b, 0x00], 4);

        session.run_once(1).unwrap();
        assert_eq!(
            session.vmi_mut().observations(),
            &[Observation::Read(vec![0x0d, 0xf0, 0xfe, 0xca])]
        );
    }

    #[test]
    fn test_write_component_passes_through() {
        let mut session = patched_session();
        session.protect().unwrap();

        // mov [rax], eax: hits the read|write watch, but only reads are
        // substituted.
        session
            .vmi_mut()
            .queue_access(LOCATION, AccessMask::W, &[0x89, 0x00], 4);
        session.run_once(1).unwrap();
        assert_eq!(
            session.vmi_mut().observations(),
            &[Observation::Access(AccessMask::W)]
        );
    }

    #[test]
    fn test_cleanup_on_abnormal_stop() {
        let mut session = patched_session();
        session.protect().unwrap();

        // The stop request lands before any event arrives.
        let stop = AtomicBool::new(true);
        session.run_until_stopped(&stop, 1).unwrap();

        session.shutdown();
        assert!(!session.is_patched());
        assert_eq!(
            session.vmi_mut().read_u32_va(LOCATION, 0).unwrap(),
            TRUE_VALUE
        );
        assert!(!session.vmi_mut().is_paused());
    }
}
