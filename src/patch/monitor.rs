//! Single-target access monitoring and event dispatch.
//!
//! The monitor owns the watched-frame registration and the blocking wait
//! loop. It is deliberately session-agnostic: the per-event behavior lives
//! in a [`MemEventHandler`] context passed into [`AccessMonitor::run`], so
//! the monitor can be reused and tested independent of any particular
//! patch session.
//!
//! # Dispatch model
//!
//! One call to [`AccessMonitor::run`] performs one bounded wait:
//!
//! - **Timeout**: returns `Ok(())` with no event. This is not a failure;
//!   it is the only point where the caller's loop can notice an external
//!   stop request, so no wait here is ever unbounded.
//! - **Event**: the handler runs synchronously, in-line, before the wait
//!   resumes. The triggering vCPU is blocked until the response is sent,
//!   so handler execution time directly stalls the guest. Handlers must
//!   stick to a bounded number of guest reads and pure computation.
//!
//! At most one frame is watched per monitor instance, and it must stay
//! watched for the whole window between patch apply and restore.

use thiserror::Error;

use super::emulate::EmulatedRead;
use crate::vmi::{AccessMask, MemEvent, Vmi, VmiError};

/// The handler's answer to one access event.
///
/// A tagged outcome rather than an out-parameter, so event handling is
/// exhaustively checkable and test assertions can match on the returned
/// value directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventResponse {
    /// Let the access proceed against real memory, unmodified.
    NoOp,
    /// Inject an exception with the given vector instead of completing the
    /// access.
    InjectFault(u8),
    /// Complete the read with the substituted bytes instead of memory.
    EmulateRead(EmulatedRead),
}

/// Per-event behavior, carried as an explicit context value.
pub trait MemEventHandler<V: Vmi> {
    /// Handle one access event. Runs with the triggering vCPU paused;
    /// whatever this does, the guest waits for it.
    fn on_event(&mut self, vmi: &mut V, event: &MemEvent) -> EventResponse;
}

/// Errors from watch registration and event dispatch.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// This monitor already watches a frame; unregister it first.
    #[error("a frame is already being watched (gfn {0:#x})")]
    AlreadyWatched(u64),

    /// The hypervisor rejected the watch registration.
    #[error("failed to register watch on gfn {gfn:#x}: {source}")]
    RegistrationFailed {
        /// Frame the registration was for.
        gfn: u64,
        /// Underlying platform error.
        #[source]
        source: VmiError,
    },

    /// The bounded wait itself failed.
    #[error("failed to listen for events: {0}")]
    WaitFailed(#[source] VmiError),

    /// The event response could not be delivered.
    #[error("failed to answer event: {0}")]
    ReplyFailed(#[source] VmiError),
}

/// Watches exactly one guest frame and dispatches its access events.
pub struct AccessMonitor {
    /// The watched frame and its access mask, if registered.
    watched: Option<(u64, AccessMask)>,
}

impl AccessMonitor {
    /// Create a monitor with nothing watched.
    pub fn new() -> Self {
        Self { watched: None }
    }

    /// The currently watched frame, if any.
    pub fn watched_gfn(&self) -> Option<u64> {
        self.watched.map(|(gfn, _)| gfn)
    }

    /// Register a watch on `gfn` for the access kinds in `mask`.
    ///
    /// Fails with [`MonitorError::AlreadyWatched`] if this monitor already
    /// has a registration, and [`MonitorError::RegistrationFailed`] if the
    /// hypervisor rejects the frame or mask.
    pub fn register<V: Vmi>(
        &mut self,
        vmi: &mut V,
        gfn: u64,
        mask: AccessMask,
    ) -> Result<(), MonitorError> {
        if let Some((watched, _)) = self.watched {
            return Err(MonitorError::AlreadyWatched(watched));
        }
        vmi.register_mem_event(gfn, mask)
            .map_err(|source| MonitorError::RegistrationFailed { gfn, source })?;
        self.watched = Some((gfn, mask));
        eprintln!("[MONITOR] watching gfn {:#x} for {}", gfn, mask.render());
        Ok(())
    }

    /// Drop the current watch, if any. Best-effort: a hypervisor failure
    /// here is logged, not propagated, because this runs during teardown.
    pub fn unregister<V: Vmi>(&mut self, vmi: &mut V) {
        if let Some((gfn, _)) = self.watched.take() {
            if let Err(e) = vmi.clear_mem_event(gfn) {
                eprintln!("[MONITOR] warning: failed to clear watch on gfn {gfn:#x}: {e}");
            }
        }
    }

    /// One bounded wait for an event, dispatching to `handler` if one
    /// arrives. A timeout returns `Ok(())` so the caller can check its
    /// stop flag.
    pub fn run<V, H>(
        &mut self,
        vmi: &mut V,
        timeout_ms: u64,
        handler: &mut H,
    ) -> Result<(), MonitorError>
    where
        V: Vmi,
        H: MemEventHandler<V>,
    {
        let event = match vmi.wait_event(timeout_ms) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(()),
            Err(e) => return Err(MonitorError::WaitFailed(e)),
        };
        let response = handler.on_event(vmi, &event);
        vmi.reply_event(&event, response)
            .map_err(MonitorError::ReplyFailed)
    }
}

impl Default for AccessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmi::sim::{Observation, SimVmi};

    /// Counts events and answers with a fixed response.
    struct FixedResponse {
        response: EventResponse,
        seen: usize,
    }

    impl<V: Vmi> MemEventHandler<V> for FixedResponse {
        fn on_event(&mut self, _vmi: &mut V, _event: &MemEvent) -> EventResponse {
            self.seen += 1;
            self.response.clone()
        }
    }

    #[test]
    fn test_second_registration_is_rejected() {
        let mut vmi = SimVmi::new();
        let mut monitor = AccessMonitor::new();
        monitor.register(&mut vmi, 0x2, AccessMask::R).unwrap();
        assert!(matches!(
            monitor.register(&mut vmi, 0x3, AccessMask::R),
            Err(MonitorError::AlreadyWatched(0x2))
        ));
        assert_eq!(monitor.watched_gfn(), Some(0x2));
    }

    #[test]
    fn test_timeout_is_not_an_error() {
        let mut vmi = SimVmi::new();
        let mut monitor = AccessMonitor::new();
        monitor.register(&mut vmi, 0x2, AccessMask::R).unwrap();
        let mut handler = FixedResponse {
            response: EventResponse::NoOp,
            seen: 0,
        };
        monitor.run(&mut vmi, 1, &mut handler).unwrap();
        assert_eq!(handler.seen, 0);
    }

    #[test]
    fn test_event_dispatch_and_reply() {
        let mut vmi = SimVmi::new();
        vmi.write_u32_va(0x2000, 0, 0xdead_beef).unwrap();
        let mut monitor = AccessMonitor::new();
        monitor.register(&mut vmi, 0x2, AccessMask::R).unwrap();
        vmi.queue_read(0x2000, &[0x8b, 0x00], 4);

        let mut handler = FixedResponse {
            response: EventResponse::NoOp,
            seen: 0,
        };
        monitor.run(&mut vmi, 1, &mut handler).unwrap();
        assert_eq!(handler.seen, 1);
        assert_eq!(
            vmi.observations(),
            &[Observation::Read(vec![0xef, 0xbe, 0xad, 0xde])]
        );

        monitor.unregister(&mut vmi);
        assert_eq!(monitor.watched_gfn(), None);
    }
}
