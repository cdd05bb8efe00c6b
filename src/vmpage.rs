//! Virtual pages: the per-page state machine of demand paging.
//!
//! A `VmPage` is one logical page of a user address space. It permanently
//! owns one swap slot, assigned at creation, and borrows a physical frame
//! from the coremap while resident. Faulting brings contents in; eviction
//! (driven by the coremap's replacement scan) pushes them out with the
//! `in_transit` flag raised for the duration of the write.

use crate::addr::{PhysAddress, VirtAddress};
use crate::error::VmError;
use crate::platform::{Platform, SwapDevice, VmMap};
use crate::swap::SwapAddr;
use crate::sync::{SpinGuard, SpinLock};
use crate::vm::VmCore;

use alloc::sync::Arc;

use log::trace;
use num_traits::FromPrimitive;

/// Fault types as delivered by the trap layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
#[repr(u32)]
pub enum FaultKind {
    Read = 0,
    Write = 1,
    /// Write hit on a translation installed read-only.
    ReadOnly = 2,
}

#[derive(Debug)]
struct PageState {
    /// Current frame, while resident.
    paddr: Option<PhysAddress>,
    /// This page's permanent slot on the swap device.
    swap_slot: SwapAddr,
    /// A frame-to-swap write is in progress; faults and teardown wait.
    in_transit: bool,
}

#[derive(Debug)]
pub struct VmPage {
    state: SpinLock<PageState>,
}

impl VmPage {
    /// Creates a page with a fresh swap slot and a wired resident frame.
    /// The caller unwires once it has finished populating the frame.
    pub fn new<P: Platform, D: SwapDevice>(
        core: &VmCore<P, D>,
    ) -> Result<(Arc<VmPage>, PhysAddress), VmError> {
        let slot = core.swap.alloc()?;

        let page = Arc::new(VmPage {
            state: SpinLock::new(PageState {
                paddr: None,
                swap_slot: slot,
                in_transit: false,
            }),
        });

        let paddr = match core.coremap.alloc(core, Some(&page), true) {
            Ok(paddr) => paddr,
            Err(e) => {
                core.swap.dealloc(slot);
                return Err(e);
            }
        };
        page.state.lock().paddr = Some(paddr);

        Ok((page, paddr))
    }

    /// Creates a zero-filled page, ready for mapping.
    pub fn new_blank<P: Platform, D: SwapDevice>(
        core: &VmCore<P, D>,
    ) -> Result<Arc<VmPage>, VmError> {
        let (page, paddr) = Self::new(core)?;
        core.coremap.zero(paddr);
        core.coremap.unwire(paddr);
        Ok(page)
    }

    /// Tears the page down, releasing its frame (if resident) and its swap
    /// slot. The caller's handle is consumed; any other handles must be
    /// transient (an eviction caught mid-upgrade).
    pub fn destroy<P: Platform, D: SwapDevice>(page: Arc<VmPage>, core: &VmCore<P, D>) {
        let (mut st, wired) = page.acquire(core);
        assert!(!st.in_transit);
        let slot = st.swap_slot;

        match wired {
            Some(paddr) => {
                st.paddr = None;
                drop(st);
                core.coremap.free(paddr, false);
                core.coremap.unwire(paddr);
            }
            None => drop(st),
        }

        core.swap.dealloc(slot);
    }

    /// Copies `source` into a brand-new page with its own frame and slot.
    /// Afterward the two pages share nothing.
    pub fn clone_page<P: Platform, D: SwapDevice>(
        source: &Arc<VmPage>,
        core: &VmCore<P, D>,
    ) -> Result<Arc<VmPage>, VmError> {
        let (target, target_paddr) = Self::new(core)?;

        let (mut sst, wired) = source.acquire(core);
        let source_paddr = match wired {
            Some(paddr) => paddr,
            None => {
                // The source lives only on the swap device; bring it back
                // before copying.
                let slot = sst.swap_slot;
                drop(sst);
                let paddr = match core.coremap.alloc(core, Some(source), true) {
                    Ok(paddr) => paddr,
                    Err(e) => {
                        core.coremap.unwire(target_paddr);
                        Self::destroy(target, core);
                        return Err(e);
                    }
                };
                core.swap.swap_in(core.window(), paddr, slot);

                sst = source.state.lock();
                assert!(sst.paddr.is_none(), "source paged in behind our back");
                assert_eq!(sst.swap_slot, slot);
                sst.paddr = Some(paddr);
                paddr
            }
        };

        core.coremap.clone_frame(source_paddr, target_paddr);
        drop(sst);

        core.coremap.unwire(source_paddr);
        core.coremap.unwire(target_paddr);
        Ok(target)
    }

    /// Handles a fault on this page: makes it resident, then installs a
    /// translation through the region layer's mapping hook.
    ///
    /// Faults on one page are serialized by the caller; concurrent eviction
    /// of this page is handled here by waiting out `in_transit`.
    pub fn fault<P: Platform, D: SwapDevice, M: VmMap + ?Sized>(
        self: &Arc<VmPage>,
        core: &VmCore<P, D>,
        aspace: &M,
        fault_code: u32,
        fault_vaddr: VirtAddress,
    ) -> Result<(), VmError> {
        // First pin down residency: leave the loop holding the page lock,
        // with the page either wired-resident or known swapped out, and not
        // in transit. Wiring can only be done with the page lock dropped,
        // so each step is re-validated after relocking.
        let mut wired: Option<PhysAddress> = None;
        let mut st = self.state.lock();
        loop {
            if st.in_transit {
                let token = core.wc_transit.prepare();
                drop(st);
                if let Some(w) = wired.take() {
                    core.coremap.unwire(w);
                }
                core.wc_transit.wait(token);
                st = self.state.lock();
                continue;
            }
            let cur = st.paddr;
            if cur == wired {
                break;
            }
            drop(st);
            if let Some(w) = wired.take() {
                core.coremap.unwire(w);
            }
            if let Some(paddr) = cur {
                core.coremap.wire(paddr);
                wired = Some(paddr);
            }
            st = self.state.lock();
        }

        let paddr = match wired {
            Some(paddr) => paddr,
            None => {
                // Swapped out: take a fresh wired frame and read the slot
                // back into it.
                let slot = st.swap_slot;
                drop(st);

                let paddr = core.coremap.alloc(core, Some(self), true)?;
                core.swap.swap_in(core.window(), paddr, slot);

                st = self.state.lock();
                assert!(st.paddr.is_none(), "page faulted in twice concurrently");
                assert_eq!(st.swap_slot, slot);
                st.paddr = Some(paddr);
                trace!("page {:?} swapped in", slot);
                paddr
            }
        };

        // The frame stays wired while the translation goes in; the page
        // lock is not held across calls into the coremap or region layer.
        drop(st);

        let writeable = match FaultKind::from_u32(fault_code) {
            Some(FaultKind::Read) => false,
            Some(FaultKind::Write) | Some(FaultKind::ReadOnly) => true,
            None => {
                core.coremap.unwire(paddr);
                return Err(VmError::InvalidArg);
            }
        };

        aspace.vm_map(fault_vaddr, paddr, writeable);
        core.coremap.unwire(paddr);
        Ok(())
    }

    /// Writes the resident contents out to the page's swap slot and strips
    /// residency. Called by the coremap's replacement path, which has
    /// already wired the frame.
    pub(crate) fn evict<P: Platform, D: SwapDevice>(&self, core: &VmCore<P, D>) {
        let mut st = self.state.lock();
        let paddr = st.paddr.expect("evicting a page that is not resident");
        assert!(!st.in_transit);
        let slot = st.swap_slot;
        st.in_transit = true;
        drop(st);

        assert!(core.coremap.is_wired(paddr));
        core.swap.swap_out(core.window(), paddr, slot);

        let mut st = self.state.lock();
        assert_eq!(st.paddr, Some(paddr));
        st.paddr = None;
        st.in_transit = false;
        drop(st);

        core.wc_transit.wake_all();
    }

    /// Momentary observation of residency; the answer may be stale by the
    /// time the caller looks at it.
    pub fn resident(&self) -> Option<PhysAddress> {
        self.state.lock().paddr
    }

    /// The page's permanent slot on the swap device.
    pub fn swap_addr(&self) -> SwapAddr {
        self.state.lock().swap_slot
    }

    /// Establishes "page locked, and its frame (if any) wired by us". The
    /// frame can be evicted between observing `paddr` and wiring it, so
    /// keep retrying until a locked observation matches our wire. The loop
    /// terminates: a page we hold wired cannot move, so each retry either
    /// matches or sees the one transition that invalidated it.
    fn acquire<'a, P: Platform, D: SwapDevice>(
        &'a self,
        core: &VmCore<P, D>,
    ) -> (SpinGuard<'a, PageState>, Option<PhysAddress>) {
        let mut wired: Option<PhysAddress> = None;
        let mut st = self.state.lock();
        loop {
            let cur = st.paddr;
            if cur == wired {
                return (st, wired);
            }
            drop(st);
            if let Some(w) = wired.take() {
                core.coremap.unwire(w);
            }
            if let Some(paddr) = cur {
                core.coremap.wire(paddr);
                wired = Some(paddr);
            }
            st = self.state.lock();
        }
    }
}

#[cfg(test)]
impl VmPage {
    pub(crate) fn residency(&self) -> (Option<PhysAddress>, bool) {
        let st = self.state.lock();
        (st.paddr, st.in_transit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{set_in_interrupt, TestAddrSpace, TestRig};

    #[test]
    fn new_blank_is_zeroed_and_unwired() {
        let rig = TestRig::with_frames(2);
        let page = VmPage::new_blank(&rig.core).unwrap();

        let paddr = page.resident().unwrap();
        assert!(rig.frame_is(paddr, 0));
        assert!(!rig.core.coremap.is_wired(paddr));
        assert_eq!(rig.core.coremap.stats().user_frames, 1);
        rig.core.coremap.check_page_links();

        VmPage::destroy(page, &rig.core);
    }

    #[test]
    fn destroy_restores_all_accounting() {
        let rig = TestRig::with_frames(2);
        let cm_before = rig.core.coremap.stats();
        let sw_before = rig.core.swap.stats();

        let page = VmPage::new_blank(&rig.core).unwrap();
        assert_eq!(rig.core.swap.stats().free_slots, sw_before.free_slots - 1);

        VmPage::destroy(page, &rig.core);
        assert_eq!(rig.core.coremap.stats(), cm_before);
        assert_eq!(rig.core.swap.stats(), sw_before);
    }

    #[test]
    fn destroy_of_a_swapped_out_page_releases_its_slot() {
        let rig = TestRig::with_frames(1);
        let sw_before = rig.core.swap.stats();

        let page = VmPage::new_blank(&rig.core).unwrap();
        // Push the page out by taking its only possible frame.
        let kpage = rig.core.coremap.alloc(&rig.core, None, false).unwrap();
        assert!(page.resident().is_none());

        VmPage::destroy(page, &rig.core);
        assert_eq!(rig.core.swap.stats(), sw_before);
        assert_eq!(rig.core.coremap.stats().user_frames, 0);

        rig.core.coremap.free(kpage, true);
    }

    #[test]
    fn fault_on_resident_page_maps_and_unwires() {
        let rig = TestRig::with_frames(2);
        let aspace = TestAddrSpace::new(&rig);
        let page = VmPage::new_blank(&rig.core).unwrap();
        let paddr = page.resident().unwrap();

        page.fault(
            &rig.core,
            &aspace,
            FaultKind::Read as u32,
            VirtAddress::from_raw(0x4000),
        )
        .unwrap();

        let mapping = aspace.last_mapping().unwrap();
        assert_eq!(mapping.paddr, paddr);
        assert_eq!(mapping.vaddr, VirtAddress::from_raw(0x4000));
        assert!(!mapping.writeable);
        assert!(!rig.core.coremap.is_wired(paddr));

        page.fault(
            &rig.core,
            &aspace,
            FaultKind::Write as u32,
            VirtAddress::from_raw(0x4000),
        )
        .unwrap();
        assert!(aspace.last_mapping().unwrap().writeable);

        VmPage::destroy(page, &rig.core);
    }

    #[test]
    fn fault_rejects_unknown_kinds() {
        let rig = TestRig::with_frames(2);
        let aspace = TestAddrSpace::new(&rig);
        let page = VmPage::new_blank(&rig.core).unwrap();
        let paddr = page.resident().unwrap();

        assert_eq!(
            page.fault(&rig.core, &aspace, 7, VirtAddress::from_raw(0x4000)),
            Err(VmError::InvalidArg)
        );
        assert!(aspace.last_mapping().is_none());
        assert!(!rig.core.coremap.is_wired(paddr));

        VmPage::destroy(page, &rig.core);
    }

    #[test]
    fn fault_evict_fault_restores_contents() {
        let rig = TestRig::with_frames(1);
        let aspace = TestAddrSpace::new(&rig);
        let page = VmPage::new_blank(&rig.core).unwrap();
        rig.fill_frame(page.resident().unwrap(), 0xc3);

        // Taking the only frame forces the page out.
        let kpage = rig.core.coremap.alloc(&rig.core, None, false).unwrap();
        assert!(page.resident().is_none());
        assert_eq!(rig.device.write_count(), 1);
        rig.core.coremap.check_page_links();

        // Give the frame back and fault the page in again.
        rig.core.coremap.free(kpage, true);
        page.fault(
            &rig.core,
            &aspace,
            FaultKind::Read as u32,
            VirtAddress::from_raw(0x8000),
        )
        .unwrap();

        let paddr = page.resident().unwrap();
        assert!(rig.frame_is(paddr, 0xc3));
        rig.core.coremap.check_page_links();

        VmPage::destroy(page, &rig.core);
    }

    #[test]
    fn cloned_pages_share_nothing() {
        let rig = TestRig::with_frames(3);
        let source = VmPage::new_blank(&rig.core).unwrap();
        rig.fill_frame(source.resident().unwrap(), 0x11);

        let target = VmPage::clone_page(&source, &rig.core).unwrap();
        assert_ne!(source.swap_addr(), target.swap_addr());
        let target_paddr = target.resident().unwrap();
        assert_ne!(source.resident().unwrap(), target_paddr);
        assert!(rig.frame_is(target_paddr, 0x11));
        assert!(!rig.core.coremap.is_wired(target_paddr));

        // Writing the source no longer shows through.
        rig.fill_frame(source.resident().unwrap(), 0x22);
        assert!(rig.frame_is(target_paddr, 0x11));

        VmPage::destroy(source, &rig.core);
        VmPage::destroy(target, &rig.core);
    }

    #[test]
    fn clone_swaps_the_source_back_in() {
        let rig = TestRig::with_frames(2);
        let source = VmPage::new_blank(&rig.core).unwrap();
        rig.fill_frame(source.resident().unwrap(), 0x77);

        // Evict the source by filling RAM with kernel pages.
        let a = rig.core.coremap.alloc(&rig.core, None, false).unwrap();
        let b = rig.core.coremap.alloc(&rig.core, None, false).unwrap();
        assert!(source.resident().is_none());
        rig.core.coremap.free(a, true);
        rig.core.coremap.free(b, true);

        let target = VmPage::clone_page(&source, &rig.core).unwrap();
        assert!(source.resident().is_some());
        assert!(rig.frame_is(target.resident().unwrap(), 0x77));

        VmPage::destroy(source, &rig.core);
        VmPage::destroy(target, &rig.core);
    }

    #[test]
    fn creation_fails_cleanly_when_swap_is_full() {
        let rig = TestRig::with_frames_and_slots(2, 6);
        let cm_before = rig.core.coremap.stats();

        let mut held = Vec::new();
        while let Ok(addr) = rig.core.swap.alloc() {
            held.push(addr);
        }

        assert_eq!(VmPage::new_blank(&rig.core).unwrap_err(), VmError::OutOfSpace);
        assert_eq!(rig.core.coremap.stats(), cm_before);

        for addr in held {
            rig.core.swap.dealloc(addr);
        }
    }

    #[test]
    fn creation_in_interrupt_context_releases_the_slot() {
        let rig = TestRig::with_frames(1);
        let first = VmPage::new_blank(&rig.core).unwrap();
        let sw_before = rig.core.swap.stats();

        set_in_interrupt(true);
        let result = VmPage::new_blank(&rig.core);
        set_in_interrupt(false);

        assert_eq!(result.unwrap_err(), VmError::OutOfMemory);
        assert_eq!(rig.core.swap.stats(), sw_before);

        VmPage::destroy(first, &rig.core);
    }
}
