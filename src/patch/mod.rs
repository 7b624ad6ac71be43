//! Stealth patching: read interception and emulated substitution.
//!
//! The pieces, leaves first:
//!
//! - [`insn`] sizes the memory read performed by a trapped instruction.
//! - [`emulate`] packages a replacement value as an emulated-read
//!   response.
//! - [`monitor`] watches one guest frame and dispatches its access
//!   events.
//! - [`session`] orchestrates the whole run: apply the patch, protect
//!   the frame, answer reads with the true value, restore on the way
//!   out.
//!
//! On each trapped read the flow is: fetch the 15-byte window at the
//! faulting RIP, resolve the access width, substitute that many bytes of
//! the true value. Any failure along the way answers with a no-op and
//! the reader sees real memory: degraded stealth, never a crash.

pub mod emulate;
pub mod insn;
pub mod monitor;
pub mod session;

pub use emulate::{substitute, EmulatedRead, MAX_EMULATE_SIZE};
pub use insn::{access_size, AccessSize, Mode, ResolveError, MAX_INSN_LEN};
pub use monitor::{AccessMonitor, EventResponse, MemEventHandler, MonitorError};
pub use session::{PatchRecord, PatchSession, ReadShield, SessionError};
