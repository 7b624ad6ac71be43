//! Veil - a stealth memory-patch and view-isolation engine.
//!
//! Veil modifies a location in a running guest's memory and keeps the
//! modification invisible to readers inside the guest. Two mechanisms
//! carry the illusion:
//!
//! - **Read interception** ([`patch`]): the patched location's frame is
//!   watched for access events. When a read traps, the faulting
//!   instruction is decoded to find the exact byte width of the read, and
//!   the event is answered with that many bytes of the pre-patch value.
//!   The reader observes the true value; memory keeps the patch.
//! - **View isolation** ([`view`]): alternate second-level page-table
//!   views remap selected guest frames onto different backing pages, so
//!   whole observer contexts can be shown different memory without
//!   per-access traps.
//!
//! The hypervisor itself is behind the [`vmi::Vmi`] trait: pause/resume,
//! memory access, address translation, event delivery, and the
//! alternate-view hypercalls. The crate ships one driver, the in-process
//! simulated guest ([`vmi::sim`]), which backs the demo tool and the
//! tests; a Xen or KVMi driver would implement the same trait.
//!
//! # A session, end to end
//!
//! ```text
//! apply        write the patch, keep the true value
//! protect      translate the location to its frame, watch it (R|W)
//! event loop   trapped read -> decode width -> emulate true value
//! shutdown     restore the true value, drop the watch, resume
//! ```
//!
//! The engine is single-threaded and event-driven. Every wait is bounded
//! so an external stop request (a signal, in the demo tool) is observed
//! promptly, and teardown runs on every exit path: the guest must never
//! be left paused or patched.

pub mod patch;
pub mod view;
pub mod vmi;
