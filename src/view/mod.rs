//! Alternate-view (altp2m) management.
//!
//! An alternate view is a hypervisor-maintained second GFN→MFN table,
//! switchable per execution context. Remapping a frame inside a view lets
//! different observers be shown different backing memory for the same
//! guest physical address: the isolation mechanism that scales past
//! per-frame traps to whole alternate memory contexts.
//!
//! # Lifecycle
//!
//! Per view: `Absent → Created → (Active ⇄ Inactive) → Destroyed`. View 0
//! is the default view; it always exists and is never destroyed by this
//! subsystem. The manager tracks the created set and the active view
//! itself, so destroying an unknown, default, or still-active view is a
//! typed error instead of a hypervisor-level use-after-destroy.
//!
//! # Memory budget
//!
//! Pages reserved for remap targets come out of the domain's memory
//! ceiling, where they would collide with the guest's own ballooning.
//! [`ViewManager::init`] therefore captures the current ceiling and
//! raises it to effectively unlimited; [`ViewManager::deinit`] restores
//! the captured baseline. Reservation before `init` is refused.
//!
//! New views default to no access for every page not explicitly remapped.
//! Fail-closed is deliberate: pages become visible in a view only by an
//! explicit grant, never implicitly.
//!
//! There is no garbage collection of hypervisor-side resources. Every
//! `create_view` and `reserve_page` must be paired with a `destroy_view`
//! and `release_page` on every exit path; [`ViewManager::teardown`] does
//! exactly that for callers unwinding.

use std::collections::HashSet;

use thiserror::Error;

use crate::vmi::{Vmi, VmiError};

/// Errors from view lifecycle management.
#[derive(Error, Debug)]
pub enum ViewError {
    /// Capturing or raising the domain memory ceiling failed; no views
    /// may be created.
    #[error("alternate-view subsystem initialization failed: {0}")]
    InitFailed(#[source] VmiError),

    /// `init` has not succeeded yet.
    #[error("alternate-view subsystem is not initialized")]
    NotInitialized,

    /// View 0 always exists and is never destroyed by this subsystem.
    #[error("view 0 is the default view and cannot be destroyed")]
    DefaultView,

    /// The view id names no created view.
    #[error("view {0} does not exist")]
    UnknownView(u16),

    /// The view is the active view; switch away before destroying it.
    #[error("view {0} is active; switch to another view before destroying it")]
    ViewActive(u16),

    /// The underlying platform call failed.
    #[error(transparent)]
    Vmi(#[from] VmiError),
}

/// Creates, destroys, switches, and remaps alternate views, and accounts
/// for the physical pages they consume.
pub struct ViewManager {
    /// Created (not yet destroyed) view ids.
    views: HashSet<u16>,
    /// The view currently switched to; 0 is the default view.
    active: u16,
    /// Frames reserved from the hypervisor free pool and not yet
    /// released.
    reserved: Vec<u64>,
    /// Whether `init` raised the memory ceiling.
    initialized: bool,
}

impl ViewManager {
    /// Create a manager with no views and nothing reserved.
    pub fn new() -> Self {
        Self {
            views: HashSet::new(),
            active: 0,
            reserved: Vec::new(),
            initialized: false,
        }
    }

    /// Number of created views.
    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// The currently active view (0 = default).
    pub fn active_view(&self) -> u16 {
        self.active
    }

    /// Frames reserved and not yet released.
    pub fn reserved_pages(&self) -> usize {
        self.reserved.len()
    }

    /// Capture the domain's memory ceiling and raise it to effectively
    /// unlimited, so reserved remap pages do not collide with the guest's
    /// own memory. Returns the prior ceiling for [`ViewManager::deinit`].
    ///
    /// On failure no partial state is left: views cannot be created until
    /// a later `init` succeeds.
    pub fn init<V: Vmi>(&mut self, vmi: &mut V) -> Result<u64, ViewError> {
        let baseline = vmi.max_mem().map_err(ViewError::InitFailed)?;
        vmi.set_max_mem(u64::MAX).map_err(ViewError::InitFailed)?;
        self.initialized = true;
        eprintln!("[VIEW] memory ceiling raised (baseline {baseline} KiB)");
        Ok(baseline)
    }

    /// Restore the memory ceiling captured by `init`. Best-effort: this
    /// runs during teardown after views are already gone, so a failure is
    /// logged, never propagated.
    pub fn deinit<V: Vmi>(&mut self, vmi: &mut V, baseline: u64) {
        if let Err(e) = vmi.set_max_mem(baseline) {
            eprintln!("[VIEW] warning: failed to restore memory ceiling: {e}");
        }
        if !self.views.is_empty() || !self.reserved.is_empty() {
            eprintln!(
                "[VIEW] warning: deinit with {} view(s) and {} page(s) outstanding",
                self.views.len(),
                self.reserved.len()
            );
        }
        self.initialized = false;
    }

    /// Whether the alternate-view subsystem is enabled for the domain.
    pub fn get_domain_state<V: Vmi>(&self, vmi: &mut V) -> Result<bool, ViewError> {
        Ok(vmi.slat_get_domain_state()?)
    }

    /// Globally enable or disable the alternate-view subsystem.
    pub fn set_domain_state<V: Vmi>(&self, vmi: &mut V, enabled: bool) -> Result<(), ViewError> {
        Ok(vmi.slat_set_domain_state(enabled)?)
    }

    /// Create a view. Every page not explicitly remapped defaults to no
    /// access.
    pub fn create_view<V: Vmi>(&mut self, vmi: &mut V) -> Result<u16, ViewError> {
        if !self.initialized {
            return Err(ViewError::NotInitialized);
        }
        let id = vmi.slat_create()?;
        self.views.insert(id);
        eprintln!("[VIEW] created view {id}");
        Ok(id)
    }

    /// Destroy a created view. Rejects the default view, unknown ids, and
    /// the currently active view.
    pub fn destroy_view<V: Vmi>(&mut self, vmi: &mut V, id: u16) -> Result<(), ViewError> {
        if id == 0 {
            return Err(ViewError::DefaultView);
        }
        if !self.views.contains(&id) {
            return Err(ViewError::UnknownView(id));
        }
        if self.active == id {
            return Err(ViewError::ViewActive(id));
        }
        vmi.slat_destroy(id)?;
        self.views.remove(&id);
        eprintln!("[VIEW] destroyed view {id}");
        Ok(())
    }

    /// Make `id` the active view for the calling context (0 = default).
    pub fn switch_view<V: Vmi>(&mut self, vmi: &mut V, id: u16) -> Result<(), ViewError> {
        if id != 0 && !self.views.contains(&id) {
            return Err(ViewError::UnknownView(id));
        }
        vmi.slat_switch(id)?;
        self.active = id;
        Ok(())
    }

    /// Within `id`, redirect accesses to `old_gfn` onto the frame backing
    /// `new_gfn`. Remapping the same pair again is a no-op; remapping
    /// `old_gfn` to a different target overwrites the prior redirection.
    pub fn remap<V: Vmi>(
        &mut self,
        vmi: &mut V,
        id: u16,
        old_gfn: u64,
        new_gfn: u64,
    ) -> Result<(), ViewError> {
        if !self.views.contains(&id) {
            return Err(ViewError::UnknownView(id));
        }
        vmi.slat_change_gfn(id, old_gfn, new_gfn)?;
        Ok(())
    }

    /// Reserve exactly one physical frame from the hypervisor free pool.
    pub fn reserve_page<V: Vmi>(&mut self, vmi: &mut V) -> Result<u64, ViewError> {
        if !self.initialized {
            return Err(ViewError::NotInitialized);
        }
        let gfn = vmi.alloc_gfn()?;
        self.reserved.push(gfn);
        eprintln!("[VIEW] reserved page {gfn:#x}");
        Ok(gfn)
    }

    /// Return one reserved frame to the hypervisor free pool. Best-effort:
    /// typically invoked during cleanup, so a hypervisor failure is
    /// logged and never fails the caller's flow.
    pub fn release_page<V: Vmi>(&mut self, vmi: &mut V, gfn: u64) {
        if let Some(idx) = self.reserved.iter().position(|&g| g == gfn) {
            self.reserved.swap_remove(idx);
        } else {
            eprintln!("[VIEW] warning: releasing untracked page {gfn:#x}");
        }
        if let Err(e) = vmi.free_gfn(gfn) {
            eprintln!("[VIEW] warning: failed to release page {gfn:#x}: {e}");
        }
    }

    /// Highest guest frame number known at attach time (a snapshot, not
    /// live-updated).
    pub fn max_gpfn<V: Vmi>(&self, vmi: &V) -> u64 {
        vmi.max_gpfn()
    }

    /// Unwind everything this manager still owns: switch back to the
    /// default view, destroy every created view, release every reserved
    /// page, disable the subsystem, and restore the memory ceiling. Every
    /// step is best-effort and logged; used on every exit path.
    pub fn teardown<V: Vmi>(&mut self, vmi: &mut V, baseline: u64) {
        if self.active != 0 {
            if let Err(e) = vmi.slat_switch(0) {
                eprintln!("[VIEW] warning: failed to switch to default view: {e}");
            }
            self.active = 0;
        }
        for id in std::mem::take(&mut self.views) {
            if let Err(e) = vmi.slat_destroy(id) {
                eprintln!("[VIEW] warning: failed to destroy view {id}: {e}");
            }
        }
        for gfn in std::mem::take(&mut self.reserved) {
            if let Err(e) = vmi.free_gfn(gfn) {
                eprintln!("[VIEW] warning: failed to release page {gfn:#x}: {e}");
            }
        }
        if let Err(e) = vmi.slat_set_domain_state(false) {
            eprintln!("[VIEW] warning: failed to disable alternate views: {e}");
        }
        self.deinit(vmi, baseline);
    }
}

impl Default for ViewManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmi::sim::SimVmi;
    use crate::vmi::PAGE_SHIFT;

    fn ready() -> (SimVmi, ViewManager, u64) {
        let mut vmi = SimVmi::new();
        let mut manager = ViewManager::new();
        let baseline = manager.init(&mut vmi).unwrap();
        manager.set_domain_state(&mut vmi, true).unwrap();
        (vmi, manager, baseline)
    }

    #[test]
    fn test_init_raises_and_deinit_restores_ceiling() {
        let mut vmi = SimVmi::new();
        let mut manager = ViewManager::new();
        let before = vmi.max_mem().unwrap();

        let baseline = manager.init(&mut vmi).unwrap();
        assert_eq!(baseline, before);
        assert_eq!(vmi.max_mem().unwrap(), u64::MAX);

        manager.deinit(&mut vmi, baseline);
        assert_eq!(vmi.max_mem().unwrap(), before);
    }

    #[test]
    fn test_create_and_reserve_require_init() {
        let mut vmi = SimVmi::new();
        vmi.slat_set_domain_state(true).unwrap();
        let mut manager = ViewManager::new();
        assert!(matches!(
            manager.create_view(&mut vmi),
            Err(ViewError::NotInitialized)
        ));
        assert!(matches!(
            manager.reserve_page(&mut vmi),
            Err(ViewError::NotInitialized)
        ));
    }

    #[test]
    fn test_create_requires_domain_state() {
        let mut vmi = SimVmi::new();
        let mut manager = ViewManager::new();
        manager.init(&mut vmi).unwrap();
        // Domain state never enabled: the hypervisor refuses.
        assert!(matches!(
            manager.create_view(&mut vmi),
            Err(ViewError::Vmi(VmiError::HypervisorRejected { .. }))
        ));
    }

    #[test]
    fn test_view_lifecycle_leaves_count_unchanged() {
        let (mut vmi, mut manager, _) = ready();
        let before = manager.view_count();
        let id = manager.create_view(&mut vmi).unwrap();
        assert_eq!(manager.view_count(), before + 1);
        manager.destroy_view(&mut vmi, id).unwrap();
        assert_eq!(manager.view_count(), before);
    }

    #[test]
    fn test_destroying_nonexistent_default_or_active_view_fails() {
        let (mut vmi, mut manager, _) = ready();
        assert!(matches!(
            manager.destroy_view(&mut vmi, 42),
            Err(ViewError::UnknownView(42))
        ));
        assert!(matches!(
            manager.destroy_view(&mut vmi, 0),
            Err(ViewError::DefaultView)
        ));

        let id = manager.create_view(&mut vmi).unwrap();
        manager.switch_view(&mut vmi, id).unwrap();
        assert!(matches!(
            manager.destroy_view(&mut vmi, id),
            Err(ViewError::ViewActive(_))
        ));

        // Switching away makes the destroy legal.
        manager.switch_view(&mut vmi, 0).unwrap();
        manager.destroy_view(&mut vmi, id).unwrap();
    }

    #[test]
    fn test_remap_idempotence_and_override() {
        let (mut vmi, mut manager, _) = ready();
        // Three frames with distinct contents.
        vmi.write_u32_va(0xa000, 0, 0xaaaa_aaaa).unwrap();
        vmi.write_u32_va(0xb000, 0, 0xbbbb_bbbb).unwrap();
        vmi.write_u32_va(0xc000, 0, 0xcccc_cccc).unwrap();

        let view = manager.create_view(&mut vmi).unwrap();
        manager.remap(&mut vmi, view, 0xa, 0xb).unwrap();
        manager.switch_view(&mut vmi, view).unwrap();

        let read_a = |vmi: &mut SimVmi| {
            let mut buf = [0u8; 4];
            vmi.read_phys(0xa000, &mut buf).unwrap();
            u32::from_le_bytes(buf)
        };

        assert_eq!(read_a(&mut vmi), 0xbbbb_bbbb);

        // Same pair again: a no-op for the observer.
        manager.remap(&mut vmi, view, 0xa, 0xb).unwrap();
        assert_eq!(read_a(&mut vmi), 0xbbbb_bbbb);

        // Different target: last write wins.
        manager.remap(&mut vmi, view, 0xa, 0xc).unwrap();
        assert_eq!(read_a(&mut vmi), 0xcccc_cccc);

        // The default view is untouched.
        manager.switch_view(&mut vmi, 0).unwrap();
        assert_eq!(read_a(&mut vmi), 0xaaaa_aaaa);
    }

    #[test]
    fn test_remap_into_unknown_view_fails() {
        let (mut vmi, mut manager, _) = ready();
        assert!(matches!(
            manager.remap(&mut vmi, 7, 0xa, 0xb),
            Err(ViewError::UnknownView(7))
        ));
    }

    #[test]
    fn test_reserved_page_is_beyond_the_attach_snapshot() {
        let (mut vmi, mut manager, _) = ready();
        let gfn = manager.reserve_page(&mut vmi).unwrap();
        assert!(gfn > manager.max_gpfn(&vmi));
        manager.release_page(&mut vmi, gfn);
        assert_eq!(manager.reserved_pages(), 0);
    }

    #[test]
    fn test_teardown_releases_everything() {
        let (mut vmi, mut manager, baseline) = ready();
        let view = manager.create_view(&mut vmi).unwrap();
        let gfn = manager.reserve_page(&mut vmi).unwrap();
        manager.switch_view(&mut vmi, view).unwrap();

        manager.teardown(&mut vmi, baseline);
        assert_eq!(manager.view_count(), 0);
        assert_eq!(manager.reserved_pages(), 0);
        assert_eq!(manager.active_view(), 0);
        assert!(!vmi.slat_get_domain_state().unwrap());
        // The frame went back to the free pool.
        assert!(vmi.free_gfn(gfn).is_err());
    }
}
