//! The assembled virtual-memory core.
//!
//! `VmCore` is built once at bootstrap and threaded through everything that
//! pages: it owns the coremap, the swap manager, the kernel window and the
//! channel faulting threads sleep on while a page is in transit to swap.

use crate::addr::{PhysAddress, PhysExtent, VirtAddress};
use crate::coremap::{Coremap, Evictor};
use crate::platform::{KernelWindow, Platform, SwapDevice, TlbShootdown};
use crate::swap::SwapManager;
use crate::sync::WaitChannel;
use crate::vmpage::VmPage;

use log::info;

pub struct VmCore<P: Platform, D: SwapDevice> {
    pub coremap: Coremap<P>,
    pub swap: SwapManager<D>,
    window: KernelWindow,
    pub(crate) wc_transit: WaitChannel,
}

impl<P: Platform, D: SwapDevice> VmCore<P, D> {
    /// Brings up paging over the frames in `managed` and the given swap
    /// device. `managed` is the page-aligned physical range handed over by
    /// the platform, minus whatever was stolen before this point.
    pub fn bootstrap(
        platform: P,
        window: KernelWindow,
        managed: PhysExtent,
        swap_device: D,
    ) -> VmCore<P, D> {
        let coremap = Coremap::bootstrap(platform, window, managed);
        let swap = SwapManager::bootstrap(swap_device, managed.length());
        info!("vm: paging online");

        VmCore {
            coremap,
            swap,
            window,
            wc_transit: WaitChannel::new("wc_transit"),
        }
    }

    pub(crate) fn window(&self) -> &KernelWindow {
        &self.window
    }

    /// Allocates `count` kernel pages and returns their kernel-window
    /// address, or `None` when memory is exhausted.
    pub fn alloc_kpages(&self, count: u64) -> Option<VirtAddress> {
        assert!(count >= 1);
        let result = if count > 1 {
            self.coremap.alloc_multi(self, count)
        } else {
            self.coremap.alloc(self, None, false)
        };
        match result {
            Ok(paddr) => Some(self.window.to_virt(paddr)),
            Err(_) => None,
        }
    }

    /// Frees an allocation made by `alloc_kpages`.
    pub fn free_kpages(&self, vaddr: VirtAddress) {
        self.coremap.free(self.window.to_phys(vaddr), true);
    }

    /// Physical address behind a kernel-window address.
    pub fn kvaddr_to_paddr(&self, vaddr: VirtAddress) -> PhysAddress {
        self.window.to_phys(vaddr)
    }

    /// Remote TLB invalidation handler; see
    /// [`Coremap::tlb_shootdown`](crate::coremap::Coremap::tlb_shootdown).
    pub fn vm_tlbshootdown(&self, request: TlbShootdown) {
        self.coremap.tlb_shootdown(request);
    }

    pub fn vm_tlbshootdown_all(&self) {
        self.coremap.tlb_shootdown_all();
    }
}

impl<P: Platform, D: SwapDevice> Evictor for VmCore<P, D> {
    fn evict(&self, page: &VmPage) {
        page.evict(self);
    }
}
