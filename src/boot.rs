//! Kernel-page allocation across the bootstrap boundary.
//!
//! Until the coremap exists, kernel pages are stolen straight from RAM:
//! untracked, contiguous, gone forever. `KernelPager` owns that routing
//! decision so callers ask one object for pages at any point in boot.

use crate::addr::VirtAddress;
use crate::platform::{KernelWindow, Platform, StealMem, SwapDevice};
use crate::sync::SpinLock;
use crate::vm::VmCore;

use spin::Once;

pub struct KernelPager<S, P: Platform, D: SwapDevice> {
    steal: SpinLock<S>,
    window: KernelWindow,
    vm: Once<VmCore<P, D>>,
}

impl<S: StealMem, P: Platform, D: SwapDevice> KernelPager<S, P, D> {
    pub const fn new(steal: S, window: KernelWindow) -> KernelPager<S, P, D> {
        KernelPager {
            steal: SpinLock::new(steal),
            window,
            vm: Once::new(),
        }
    }

    /// Switches allocation over to the coremap. Called exactly once, after
    /// which stolen memory is history.
    pub fn init_vm(&self, core: VmCore<P, D>) -> &VmCore<P, D> {
        assert!(self.vm.get().is_none(), "paging initialized twice");
        self.vm.call_once(|| core)
    }

    pub fn vm(&self) -> Option<&VmCore<P, D>> {
        self.vm.get()
    }

    /// Allocates `count` kernel pages. Stolen before paging is up; from the
    /// coremap (with eviction if needed) afterward.
    pub fn alloc_kpages(&self, count: u64) -> Option<VirtAddress> {
        assert!(count >= 1);
        match self.vm.get() {
            Some(vm) => vm.alloc_kpages(count),
            None => {
                let paddr = self.steal.lock().steal(count);
                Some(self.window.to_virt(paddr))
            }
        }
    }

    /// Frees pages from `alloc_kpages`. Only legal once paging is up;
    /// stolen pages were never tracked and cannot come back.
    pub fn free_kpages(&self, vaddr: VirtAddress) {
        self.vm
            .get()
            .expect("free_kpages before paging bootstrap")
            .free_kpages(vaddr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{PhysAddress, PhysExtent};
    use crate::page::PAGE_SIZE;
    use crate::testutil::{TestPlatform, TestRig, TestSwapDevice};

    use std::sync::Arc;

    type TestPager = KernelPager<TestStealer, Arc<TestPlatform>, Arc<TestSwapDevice>>;

    /// Bumps through a fixed extent, panicking when it runs dry.
    struct TestStealer {
        next: PhysAddress,
        end: PhysAddress,
    }

    impl TestStealer {
        fn over(extent: PhysExtent) -> TestStealer {
            TestStealer {
                next: extent.address(),
                end: extent.end_address(),
            }
        }
    }

    impl StealMem for TestStealer {
        fn steal(&mut self, frames: u64) -> PhysAddress {
            let paddr = self.next;
            self.next = paddr + crate::addr::Length::from_raw(PAGE_SIZE.as_raw() * frames);
            assert!(self.next <= self.end, "boot memory exhausted");
            paddr
        }
    }

    #[test]
    fn routes_to_stealing_before_init() {
        let rig = TestRig::with_frames(4);
        let extent = rig.core.window().phys_extent();
        let pager: TestPager = KernelPager::new(TestStealer::over(extent), *rig.core.window());

        let first = pager.alloc_kpages(2).unwrap();
        let second = pager.alloc_kpages(1).unwrap();
        assert_eq!(
            second.as_raw() - first.as_raw(),
            2 * PAGE_SIZE.as_raw(),
            "stolen allocations are consecutive"
        );
        assert!(pager.vm().is_none());
    }

    #[test]
    fn routes_to_the_coremap_after_init() {
        let parts = crate::testutil::TestParts::with_frames(4);
        let core = crate::vm::VmCore::bootstrap(
            parts.platform.clone(),
            parts.window,
            parts.managed,
            parts.device.clone(),
        );
        let pager: TestPager =
            KernelPager::new(TestStealer::over(parts.window.phys_extent()), parts.window);
        pager.init_vm(core);

        let vaddr = pager.alloc_kpages(2).unwrap();
        let vm = pager.vm().unwrap();
        assert_eq!(vm.coremap.stats().kernel_frames, 2);

        pager.free_kpages(vaddr);
        assert_eq!(vm.coremap.stats().kernel_frames, 0);
        assert_eq!(vm.coremap.stats().free_frames, 4);
    }

    #[test]
    #[should_panic(expected = "free_kpages before paging bootstrap")]
    fn free_before_init_is_a_bug() {
        let rig = TestRig::with_frames(2);
        let window = *rig.core.window();
        let pager: TestPager = KernelPager::new(TestStealer::over(window.phys_extent()), window);
        pager.free_kpages(VirtAddress::from_raw(window.phys_extent().address().as_raw()));
    }
}
