//! The coremap: physical-frame descriptors, allocation and replacement.
//!
//! Every managed frame has one descriptor recording who owns it (free,
//! kernel or a user page), whether it is wired against eviction, and which
//! TLB slot on which CPU currently caches a translation to it. All
//! descriptors and the statistics live under one spinlock. Threads sleeping
//! for a frame to become unwired park on `wc_wire`; threads waiting for a
//! remote TLB invalidation park on `wc_shootdown`.

use crate::addr::{Length, PhysAddress, PhysExtent};
use crate::error::VmError;
use crate::page::{Frame, FrameRange, PAGE_BYTES, PAGE_SIZE};
use crate::platform::{CpuId, KernelWindow, Platform, TlbRef, TlbShootdown, TlbSlot};
use crate::sync::{SpinGuard, SpinLock, WaitChannel};
use crate::vmpage::VmPage;

use core::mem;
use core::ptr;
use core::slice;

use alloc::sync::{Arc, Weak};
use alloc::vec;

use bitflags::bitflags;
use log::{debug, info, trace};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use static_assertions::const_assert;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct FrameFlags: u8 {
        /// Backs a kernel allocation; never evicted.
        const KERNEL = 1 << 0;
        /// Must not be evicted right now.
        const WIRED = 1 << 1;
        /// Allocated, to the kernel or to a user page.
        const ALLOC = 1 << 2;
        /// Touched since allocation. Written, never read.
        const REFERENCED = 1 << 3;
        /// Final frame of a contiguous allocation run.
        const LAST = 1 << 4;
    }
}

pub(crate) struct FrameDescriptor {
    flags: FrameFlags,
    /// Live TLB entry caching this frame, if any.
    tlb: Option<TlbRef>,
    /// Owning user page. The page outlives any period in which the frame is
    /// allocated to it, so an upgrade during eviction always succeeds.
    page: Weak<VmPage>,
}

const_assert!(mem::size_of::<FrameDescriptor>() <= 64);

impl FrameDescriptor {
    fn new() -> FrameDescriptor {
        FrameDescriptor {
            flags: FrameFlags::empty(),
            tlb: None,
            page: Weak::new(),
        }
    }

    fn is_free(&self) -> bool {
        !self.flags.intersects(FrameFlags::WIRED | FrameFlags::ALLOC)
    }

    fn is_pageable(&self) -> bool {
        !self.flags.intersects(FrameFlags::WIRED | FrameFlags::KERNEL)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CoremapStats {
    pub base_frame: u64,
    pub total_frames: u64,
    pub kernel_frames: u64,
    pub user_frames: u64,
    pub free_frames: u64,
    pub wired_frames: u64,
}

impl CoremapStats {
    fn check(&self) {
        assert_eq!(
            self.total_frames,
            self.free_frames + self.kernel_frames + self.user_frames,
            "coremap accounting out of balance"
        );
    }
}

struct CoremapInner {
    entries: &'static mut [FrameDescriptor],
    stats: CoremapStats,
    rng: SmallRng,
}

impl CoremapInner {
    fn index_of(&self, paddr: PhysAddress) -> usize {
        let index = Frame::new(paddr)
            .index()
            .checked_sub(self.stats.base_frame)
            .expect("address below managed RAM");
        assert!(index < self.stats.total_frames, "address beyond managed RAM");
        index as usize
    }

    fn frame_paddr(&self, index: usize) -> PhysAddress {
        Frame::with_index(self.stats.base_frame + index as u64).start()
    }

    /// Highest free frame, keeping low frames for contiguous kernel runs.
    fn find_free_top_down(&self) -> Option<usize> {
        if self.stats.free_frames == 0 {
            return None;
        }
        (0..self.stats.total_frames as usize)
            .rev()
            .find(|&index| self.entries[index].is_free())
    }

    /// A frame that may be paged out, scanning forward from a random start.
    ///
    /// # Panics
    ///
    /// Panics if no frame is pageable; callers must have kept the kernel
    /// from consuming all of RAM.
    fn find_pageable(&mut self) -> usize {
        let total = self.stats.total_frames as usize;
        let start = self.rng.gen_range(0..total);
        for index in (start..total).chain(0..start) {
            if self.entries[index].is_pageable() {
                return index;
            }
        }
        panic!("no pageable frames");
    }

    /// Base of the window of `count` pageable frames that needs the fewest
    /// evictions; ties go to the lowest base.
    fn find_optimal_range(&self, count: u64) -> Option<usize> {
        let total = self.stats.total_frames;
        if count == 0 || count > total {
            return None;
        }
        let count = count as usize;

        let mut best: Option<(usize, u64)> = None;
        'window: for base in 0..=(total as usize - count) {
            let mut free = 0;
            for index in base..base + count {
                let entry = &self.entries[index];
                if !entry.is_pageable() {
                    continue 'window;
                }
                if entry.is_free() {
                    free += 1;
                }
            }
            if best.map_or(true, |(_, best_free)| free > best_free) {
                best = Some((base, free));
            }
        }
        best.map(|(base, _)| base)
    }

    fn mark_allocated(&mut self, start: usize, count: usize, wired: bool, kernel: bool) {
        for index in start..start + count {
            let entry = &mut self.entries[index];
            assert!(entry.is_free());
            entry.flags.insert(FrameFlags::ALLOC | FrameFlags::REFERENCED);
            if wired {
                entry.flags.insert(FrameFlags::WIRED);
            }
            if kernel {
                entry.flags.insert(FrameFlags::KERNEL);
            }
        }
        self.entries[start + count - 1].flags.insert(FrameFlags::LAST);

        if wired {
            self.stats.wired_frames += count as u64;
        }
        if kernel {
            self.stats.kernel_frames += count as u64;
        } else {
            self.stats.user_frames += count as u64;
        }
        self.stats.free_frames -= count as u64;
        self.stats.check();
    }

    /// Takes one free frame for a contiguous kernel run, without the `LAST`
    /// flag; the caller marks the end of the run itself.
    fn claim_kernel_frame(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        assert!(entry.is_free());
        entry
            .flags
            .insert(FrameFlags::ALLOC | FrameFlags::KERNEL | FrameFlags::REFERENCED);
        self.stats.kernel_frames += 1;
        self.stats.free_frames -= 1;
        self.stats.check();
    }

    fn release_claims(&mut self, base: usize, claimed: &[bool]) {
        for (offset, &claim) in claimed.iter().enumerate() {
            if !claim {
                continue;
            }
            let entry = &mut self.entries[base + offset];
            entry
                .flags
                .remove(FrameFlags::ALLOC | FrameFlags::KERNEL | FrameFlags::REFERENCED);
            self.stats.kernel_frames -= 1;
            self.stats.free_frames += 1;
        }
        self.stats.check();
    }
}

/// Connects replacement back to the page owning the victim frame. The sole
/// implementation writes the page to its swap slot and strips its residency;
/// it is called with the victim frame wired and no coremap lock held.
pub trait Evictor {
    fn evict(&self, page: &VmPage);
}

pub struct Coremap<P: Platform> {
    platform: P,
    window: KernelWindow,
    inner: SpinLock<CoremapInner>,
    wc_wire: WaitChannel,
    wc_shootdown: WaitChannel,
}

impl<P: Platform> Coremap<P> {
    /// Takes ownership of the frames in `managed`, reserving space for the
    /// descriptor table at the front of the range.
    pub fn bootstrap(platform: P, window: KernelWindow, managed: PhysExtent) -> Coremap<P> {
        assert!(managed.is_aligned_to(PAGE_SIZE.as_raw()));
        assert!(window.phys_extent().contains(managed));

        let n_frames = managed.length().as_raw() / PAGE_SIZE.as_raw();
        let table_bytes = Length::from_raw(n_frames * mem::size_of::<FrameDescriptor>() as u64)
            .align_up(PAGE_SIZE.as_raw());
        let (table, rest) = managed.take_first(table_bytes);
        let rest = rest.expect("frame descriptors consumed all of managed RAM");

        let frames = FrameRange::covering(rest);
        let total = frames.count();

        let table_ptr = window.frame_ptr(table.address()) as *mut FrameDescriptor;
        // SAFETY: the table range was split off the managed extent above and
        // is never given to the allocator, so these writes are exclusive.
        // The pointer is page aligned and the range holds one descriptor per
        // managed frame.
        let entries = unsafe {
            for index in 0..total as usize {
                table_ptr.add(index).write(FrameDescriptor::new());
            }
            slice::from_raw_parts_mut(table_ptr, total as usize)
        };

        let stats = CoremapStats {
            base_frame: frames.first().index(),
            total_frames: total,
            kernel_frames: 0,
            user_frames: 0,
            free_frames: total,
            wired_frames: 0,
        };
        stats.check();

        info!(
            "coremap: {} frames starting at frame {}, descriptor table {} KiB",
            total,
            stats.base_frame,
            table_bytes.as_raw() / 1024
        );

        Coremap {
            inner: SpinLock::new(CoremapInner {
                entries,
                stats,
                rng: SmallRng::seed_from_u64(platform.entropy()),
            }),
            platform,
            window,
            wc_wire: WaitChannel::new("wc_wire"),
            wc_shootdown: WaitChannel::new("wc_shootdown"),
        }
    }

    pub fn stats(&self) -> CoremapStats {
        self.inner.lock().stats
    }

    /// Allocates one frame, for a user page (with its back-reference) or for
    /// the kernel. Falls back to evicting someone when nothing is free,
    /// except in interrupt context, where it fails instead of waiting.
    pub fn alloc(
        &self,
        env: &dyn Evictor,
        page: Option<&Arc<VmPage>>,
        wired: bool,
    ) -> Result<PhysAddress, VmError> {
        let mut g = self.inner.lock();

        let index = match g.find_free_top_down() {
            Some(index) => index,
            None => {
                if self.platform.in_interrupt() {
                    debug!("coremap: allocation failed in interrupt context");
                    return Err(VmError::OutOfMemory);
                }
                let (after, index) = self.replace_page(env, g);
                g = after;
                index
            }
        };

        g.mark_allocated(index, 1, wired, page.is_none());
        if let Some(page) = page {
            g.entries[index].page = Arc::downgrade(page);
        }
        Ok(g.frame_paddr(index))
    }

    /// Allocates `count` contiguous frames for the kernel, evicting the user
    /// pages occupying the chosen window. Fails if no window of `count`
    /// pageable frames exists, or if one would need evictions in interrupt
    /// context.
    pub fn alloc_multi(&self, env: &dyn Evictor, count: u64) -> Result<PhysAddress, VmError> {
        assert!(count >= 1);

        'select: loop {
            let mut g = self.inner.lock();
            let Some(base) = g.find_optimal_range(count) else {
                return Err(VmError::OutOfMemory);
            };

            let needs_eviction = (base..base + count as usize)
                .any(|index| g.entries[index].flags.contains(FrameFlags::ALLOC));
            if needs_eviction && self.platform.in_interrupt() {
                // Fail before touching anything rather than page out with
                // interrupts off.
                debug!("coremap: contiguous allocation needs evictions in interrupt context");
                return Err(VmError::OutOfMemory);
            }

            // Claim the window's free frames immediately so concurrent
            // allocations stay out while the rest is paged out.
            let mut claimed = vec![false; count as usize];
            for (offset, claim) in claimed.iter_mut().enumerate() {
                if g.entries[base + offset].is_free() {
                    g.claim_kernel_frame(base + offset);
                    *claim = true;
                }
            }

            let mut offset = 0;
            while offset < count as usize {
                if claimed[offset] {
                    offset += 1;
                    continue;
                }
                let index = base + offset;
                let flags = g.entries[index].flags;
                if !flags.contains(FrameFlags::ALLOC) {
                    // Freed while a neighbor drained to swap.
                    g.claim_kernel_frame(index);
                    claimed[offset] = true;
                    offset += 1;
                } else if flags.contains(FrameFlags::WIRED) {
                    // Transiently wired by a fault or a competing eviction;
                    // wait for it to settle and look again.
                    let token = self.wc_wire.prepare();
                    drop(g);
                    self.wc_wire.wait(token);
                    g = self.inner.lock();
                } else if flags.contains(FrameFlags::KERNEL) {
                    // A competing contiguous allocation claimed part of the
                    // window; give ours back and reselect.
                    g.release_claims(base, &claimed);
                    drop(g);
                    continue 'select;
                } else {
                    g = self.evict_frame(env, g, index);
                    g.claim_kernel_frame(index);
                    claimed[offset] = true;
                    offset += 1;
                }
            }

            g.entries[base + count as usize - 1]
                .flags
                .insert(FrameFlags::LAST);
            debug!("coremap: {} contiguous kernel frames at index {}", count, base);
            return Ok(g.frame_paddr(base));
        }
    }

    /// Frees the allocation run starting at `paddr`: every frame up to and
    /// including the one carrying the `LAST` flag. Each frame must be
    /// allocated, and wired unless this is a kernel free.
    pub fn free(&self, paddr: PhysAddress, is_kernel: bool) {
        let mut g = self.inner.lock();
        let mut index = g.index_of(paddr);
        loop {
            assert!(index < g.entries.len(), "allocation run past the end of the coremap");
            {
                let entry = &g.entries[index];
                assert!(entry.flags.contains(FrameFlags::ALLOC));
                assert!(entry.flags.contains(FrameFlags::WIRED) || is_kernel);
            }

            g = self.flush_tlb_entry(g, index);

            let last;
            {
                let inner = &mut *g;
                let entry = &mut inner.entries[index];
                last = entry.flags.contains(FrameFlags::LAST);
                let was_kernel = entry.flags.contains(FrameFlags::KERNEL);
                // The wired bit survives: a frame freed while wired stays
                // unavailable until its holder unwires it.
                entry.flags.remove(
                    FrameFlags::ALLOC
                        | FrameFlags::REFERENCED
                        | FrameFlags::KERNEL
                        | FrameFlags::LAST,
                );
                entry.page = Weak::new();
                if was_kernel {
                    inner.stats.kernel_frames -= 1;
                } else {
                    inner.stats.user_frames -= 1;
                }
                inner.stats.free_frames += 1;
            }
            g.stats.check();

            if last {
                break;
            }
            index += 1;
        }
    }

    /// Wires the frame at `paddr`, sleeping until any current holder lets
    /// go. Callers must re-validate whatever led them here afterward; the
    /// frame may have changed owners while they slept.
    pub fn wire(&self, paddr: PhysAddress) {
        let mut g = self.inner.lock();
        let index = g.index_of(paddr);
        while g.entries[index].flags.contains(FrameFlags::WIRED) {
            let token = self.wc_wire.prepare();
            drop(g);
            self.wc_wire.wait(token);
            g = self.inner.lock();
        }
        g.entries[index].flags.insert(FrameFlags::WIRED);
        g.stats.wired_frames += 1;
    }

    pub fn unwire(&self, paddr: PhysAddress) {
        let mut g = self.inner.lock();
        let index = g.index_of(paddr);
        assert!(g.entries[index].flags.contains(FrameFlags::WIRED));
        g.entries[index].flags.remove(FrameFlags::WIRED);
        g.stats.wired_frames -= 1;
        self.wc_wire.wake_all();
    }

    /// Momentary observation of the wired bit; only useful for assertions.
    pub fn is_wired(&self, paddr: PhysAddress) -> bool {
        let g = self.inner.lock();
        let index = g.index_of(paddr);
        g.entries[index].flags.contains(FrameFlags::WIRED)
    }

    /// Records that `slot` on `cpu` now caches a translation to `paddr`.
    /// Called by the region layer from its mapping hook, with the frame
    /// still wired by the fault that installed the translation.
    pub fn note_mapping(&self, paddr: PhysAddress, cpu: CpuId, slot: TlbSlot) {
        let mut g = self.inner.lock();
        let index = g.index_of(paddr);
        let entry = &mut g.entries[index];
        assert!(entry.flags.contains(FrameFlags::ALLOC));
        assert!(!entry.flags.contains(FrameFlags::KERNEL));
        entry.tlb = Some(TlbRef { cpu, slot });
    }

    /// Forgets a recorded translation when the region layer reuses the TLB
    /// slot for another frame. No-op if the record was already superseded.
    pub fn mapping_replaced(&self, paddr: PhysAddress, cpu: CpuId, slot: TlbSlot) {
        let mut g = self.inner.lock();
        let index = g.index_of(paddr);
        let entry = &mut g.entries[index];
        if entry.tlb == Some(TlbRef { cpu, slot }) {
            entry.tlb = None;
        }
    }

    /// Remote-invalidation handler, run on the CPU the IPI targeted. If the
    /// descriptor still records exactly the requested entry, invalidate it,
    /// reset the record and wake the waiting evictor. Otherwise the mapping
    /// was already replaced and there is nothing to do.
    pub fn tlb_shootdown(&self, request: TlbShootdown) {
        let mut g = self.inner.lock();
        assert!(request.frame_index < g.entries.len());
        let expected = TlbRef {
            cpu: self.platform.current_cpu(),
            slot: request.slot,
        };
        let entry = &mut g.entries[request.frame_index];
        if entry.tlb == Some(expected) {
            self.platform.tlb_invalidate(request.slot);
            entry.tlb = None;
            self.wc_shootdown.wake_all();
        }
    }

    /// Drops the whole local TLB.
    pub fn tlb_shootdown_all(&self) {
        let _g = self.inner.lock();
        self.platform.tlb_clear();
        self.wc_shootdown.wake_all();
    }

    /// Zeroes the frame at `paddr`. The caller holds the frame reserved.
    pub fn zero(&self, paddr: PhysAddress) {
        // SAFETY: the frame is reserved for the caller and inside the window.
        unsafe { ptr::write_bytes(self.window.frame_ptr(paddr), 0, PAGE_BYTES) };
    }

    /// Copies the frame at `source` onto the frame at `target`. The caller
    /// holds both frames reserved.
    pub fn clone_frame(&self, source: PhysAddress, target: PhysAddress) {
        assert_ne!(source, target);
        // SAFETY: both frames are reserved for the caller, distinct, and
        // inside the window.
        unsafe {
            ptr::copy_nonoverlapping(
                self.window.frame_ptr(source),
                self.window.frame_ptr(target),
                PAGE_BYTES,
            )
        };
    }

    /// Picks a victim and makes its frame free. Returns with the lock still
    /// held so the caller can take the frame before anyone else sees it.
    fn replace_page<'a>(
        &'a self,
        env: &dyn Evictor,
        mut g: SpinGuard<'a, CoremapInner>,
    ) -> (SpinGuard<'a, CoremapInner>, usize) {
        let index = g.find_pageable();
        if g.entries[index].flags.contains(FrameFlags::ALLOC) {
            g = self.evict_frame(env, g, index);
        }
        (g, index)
    }

    /// Evicts the user page occupying `index`. The frame is wired for the
    /// duration; the lock is dropped around the swap I/O and reacquired, so
    /// everything except this frame may have changed by the time this
    /// returns.
    fn evict_frame<'a>(
        &'a self,
        env: &dyn Evictor,
        mut g: SpinGuard<'a, CoremapInner>,
        index: usize,
    ) -> SpinGuard<'a, CoremapInner> {
        let victim;
        {
            let inner = &mut *g;
            let entry = &mut inner.entries[index];
            assert!(entry.flags.contains(FrameFlags::ALLOC));
            assert!(entry.is_pageable());
            victim = entry.page.upgrade().expect("evictable frame with no live page");
            entry.flags.insert(FrameFlags::WIRED);
            inner.stats.wired_frames += 1;
        }
        trace!("coremap: evicting frame {}", index);

        g = self.flush_tlb_entry(g, index);
        drop(g);

        // The wired bit keeps the frame ours while the contents drain out.
        env.evict(&victim);

        let mut g = self.inner.lock();
        {
            let inner = &mut *g;
            let entry = &mut inner.entries[index];
            assert!(entry.flags.contains(FrameFlags::WIRED));
            assert!(entry.flags.contains(FrameFlags::ALLOC));
            assert!(entry.page.as_ptr() == Arc::as_ptr(&victim));
            // Clear the run-end bit too, or a contiguous run claiming this
            // frame later would inherit a bogus early terminator.
            entry.flags.remove(
                FrameFlags::WIRED | FrameFlags::ALLOC | FrameFlags::REFERENCED | FrameFlags::LAST,
            );
            entry.page = Weak::new();
            inner.stats.wired_frames -= 1;
            inner.stats.user_frames -= 1;
            inner.stats.free_frames += 1;
        }
        g.stats.check();
        self.wc_wire.wake_all();
        g
    }

    /// Drops any live TLB entry caching `index`, invalidating locally or
    /// shooting it down on the owning CPU and sleeping until the handler
    /// confirms. The caller has made the frame unmappable (wired or kernel
    /// owned), so the record cannot be re-established underneath us.
    fn flush_tlb_entry<'a>(
        &'a self,
        mut g: SpinGuard<'a, CoremapInner>,
        index: usize,
    ) -> SpinGuard<'a, CoremapInner> {
        let Some(tlb) = g.entries[index].tlb else {
            return g;
        };

        if tlb.cpu == self.platform.current_cpu() {
            self.platform.tlb_invalidate(tlb.slot);
            g.entries[index].tlb = None;
            return g;
        }

        self.platform.ipi_shootdown(
            tlb.cpu,
            TlbShootdown {
                slot: tlb.slot,
                frame_index: index,
            },
        );
        while g.entries[index].tlb.is_some() {
            let token = self.wc_shootdown.prepare();
            drop(g);
            self.wc_shootdown.wait(token);
            g = self.inner.lock();
        }
        g
    }
}

#[cfg(test)]
impl<P: Platform> Coremap<P> {
    /// Evicts the page resident at `paddr` and leaves the frame free,
    /// exactly as the replacement scan would had it drawn this frame.
    pub(crate) fn evict_frame_at(&self, env: &dyn Evictor, paddr: PhysAddress) {
        let g = self.inner.lock();
        let index = g.index_of(paddr);
        drop(self.evict_frame(env, g, index));
    }

    /// Walks every user frame and checks it against its page: a resident
    /// page points back at its frame, and a page caught without residency
    /// is mid-motion under a wired frame.
    pub(crate) fn check_page_links(&self) {
        let g = self.inner.lock();
        for (index, entry) in g.entries.iter().enumerate() {
            let Some(page) = entry.page.upgrade() else {
                continue;
            };
            assert!(entry.flags.contains(FrameFlags::ALLOC));
            assert!(!entry.flags.contains(FrameFlags::KERNEL));
            let (paddr, in_transit) = page.residency();
            if in_transit {
                assert!(entry.flags.contains(FrameFlags::WIRED));
            }
            match paddr {
                Some(paddr) => assert_eq!(paddr, g.frame_paddr(index)),
                None => assert!(entry.flags.contains(FrameFlags::WIRED)),
            }
        }
    }
}
