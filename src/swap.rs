//! The swap manager: backing store for evicted page contents.
//!
//! The backing device is divided into frame-sized slots tracked by a bitmap.
//! Slot 0 is marked used forever so that byte offset 0 never names a real
//! slot. Slot accounting lives under the swap lock; the actual frame I/O is
//! serialized by a separate paging lock, held for exactly one transfer at a
//! time and never while any other core lock is held.

use crate::addr::{Length, PhysAddress};
use crate::error::VmError;
use crate::page::{PAGE_BYTES, PAGE_SIZE};
use crate::platform::{KernelWindow, SwapDevice};
use crate::sync::SpinLock;

use alloc::vec;
use alloc::vec::Vec;

use log::info;

/// The device must be at least this many times larger than managed RAM.
pub const SWAP_MIN_FACTOR: u64 = 2;

/// Byte offset of a slot on the swap device. Never zero.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SwapAddr(u64);

impl SwapAddr {
    fn from_slot(slot: u64) -> SwapAddr {
        assert!(slot != 0);
        SwapAddr(slot * PAGE_SIZE.as_raw())
    }

    pub fn offset(self) -> u64 {
        self.0
    }

    pub fn slot(self) -> u64 {
        self.0 / PAGE_SIZE.as_raw()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwapStats {
    pub total_slots: u64,
    pub free_slots: u64,
    pub reserved_slots: u64,
}

/// One bit per slot; set means used.
struct SlotBitmap {
    words: Vec<u64>,
    len: u64,
}

impl SlotBitmap {
    fn new(len: u64) -> SlotBitmap {
        let n_words = (len as usize).div_ceil(64);
        SlotBitmap {
            words: vec![0; n_words],
            len,
        }
    }

    fn is_set(&self, index: u64) -> bool {
        assert!(index < self.len);
        self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: u64) {
        assert!(!self.is_set(index));
        self.words[(index / 64) as usize] |= 1 << (index % 64);
    }

    fn clear(&mut self, index: u64) {
        assert!(self.is_set(index));
        self.words[(index / 64) as usize] &= !(1 << (index % 64));
    }

    /// First clear bit, if any.
    fn find_clear(&self) -> Option<u64> {
        for (word_index, &word) in self.words.iter().enumerate() {
            if word != u64::MAX {
                let index = word_index as u64 * 64 + word.trailing_ones() as u64;
                if index < self.len {
                    return Some(index);
                }
            }
        }
        None
    }
}

struct SwapState {
    bitmap: SlotBitmap,
    stats: SwapStats,
}

pub struct SwapManager<D> {
    device: D,
    state: SpinLock<SwapState>,
    /// Serializes all paging I/O. Acquired only by threads holding neither
    /// the coremap lock nor any page lock.
    paging_lock: SpinLock<()>,
}

impl<D: SwapDevice> SwapManager<D> {
    /// Sets up swapping over `device`.
    ///
    /// # Panics
    ///
    /// Panics if the device is smaller than `ram_size * SWAP_MIN_FACTOR`.
    pub fn bootstrap(device: D, ram_size: Length) -> SwapManager<D> {
        let ram_size = ram_size.align_up(PAGE_SIZE.as_raw());
        let device_size = device.size();
        assert!(
            device_size.as_raw() >= ram_size.as_raw() * SWAP_MIN_FACTOR,
            "swap device too small: {} bytes for {} bytes of RAM",
            device_size.as_raw(),
            ram_size.as_raw()
        );

        let total_slots = device_size.as_raw() / PAGE_SIZE.as_raw();
        let mut bitmap = SlotBitmap::new(total_slots);
        let mut stats = SwapStats {
            total_slots,
            free_slots: total_slots,
            reserved_slots: 0,
        };

        // Keep offset 0 out of band.
        bitmap.set(0);
        stats.free_slots -= 1;

        info!("swap: {} slots ({} KiB)", total_slots, total_slots * 4);

        SwapManager {
            device,
            state: SpinLock::new(SwapState { bitmap, stats }),
            paging_lock: SpinLock::new(()),
        }
    }

    pub fn stats(&self) -> SwapStats {
        self.state.lock().stats
    }

    /// Grabs a free slot.
    pub fn alloc(&self) -> Result<SwapAddr, VmError> {
        let mut state = self.state.lock();
        let Some(slot) = state.bitmap.find_clear() else {
            return Err(VmError::OutOfSpace);
        };
        state.bitmap.set(slot);
        state.stats.free_slots -= 1;
        Ok(SwapAddr::from_slot(slot))
    }

    /// Returns a slot obtained from `alloc`.
    pub fn dealloc(&self, addr: SwapAddr) {
        let mut state = self.state.lock();
        state.bitmap.clear(addr.slot());
        state.stats.free_slots += 1;
    }

    /// Promises `slots` future allocations. Fails rather than overcommit.
    pub fn reserve(&self, slots: u64) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let stats = &mut state.stats;
        assert!(stats.free_slots <= stats.total_slots);
        assert!(stats.reserved_slots <= stats.free_slots);

        if stats.free_slots - stats.reserved_slots < slots {
            return Err(VmError::OutOfSpace);
        }
        stats.reserved_slots += slots;
        Ok(())
    }

    /// Releases `slots` promises made by `reserve`.
    pub fn unreserve(&self, slots: u64) {
        let mut state = self.state.lock();
        let stats = &mut state.stats;
        assert!(stats.free_slots <= stats.total_slots);
        assert!(stats.reserved_slots <= stats.free_slots);
        assert!(slots <= stats.reserved_slots);
        stats.reserved_slots -= slots;
    }

    /// Reads the slot at `source` into the frame at `target`. The caller
    /// holds the frame reserved and no page or coremap lock.
    pub fn swap_in(&self, window: &KernelWindow, target: PhysAddress, source: SwapAddr) {
        let _io = self.paging_lock.lock();
        // SAFETY: the frame is reserved for the caller and only reachable
        // through the window while the paging lock is held.
        let frame = unsafe { &mut *(window.frame_ptr(target) as *mut [u8; PAGE_BYTES]) };
        if let Err(e) = self.device.read(source.offset(), frame) {
            panic!("swap read failed at offset {}: {:?}", source.offset(), e);
        }
    }

    /// Writes the frame at `source` to the slot at `target`. The caller
    /// holds the frame reserved and no page or coremap lock.
    pub fn swap_out(&self, window: &KernelWindow, source: PhysAddress, target: SwapAddr) {
        let _io = self.paging_lock.lock();
        // SAFETY: as in `swap_in`.
        let frame = unsafe { &*(window.frame_ptr(source) as *const [u8; PAGE_BYTES]) };
        if let Err(e) = self.device.write(target.offset(), frame) {
            panic!("swap write failed at offset {}: {:?}", target.offset(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestSwapDevice;

    use std::sync::Arc;

    fn manager(slots: u64) -> SwapManager<Arc<TestSwapDevice>> {
        // `ram_size` chosen so the size check passes with room to spare.
        let device = Arc::new(TestSwapDevice::new(slots));
        SwapManager::bootstrap(device, PAGE_SIZE)
    }

    #[test]
    fn slot_zero_is_reserved() {
        let swap = manager(8);
        assert_eq!(
            swap.stats(),
            SwapStats {
                total_slots: 8,
                free_slots: 7,
                reserved_slots: 0
            }
        );
        // The first allocation is slot 1, not slot 0.
        assert_eq!(swap.alloc().unwrap().slot(), 1);
    }

    #[test]
    #[should_panic(expected = "swap device too small")]
    fn bootstrap_rejects_small_device() {
        let device = Arc::new(TestSwapDevice::new(4));
        SwapManager::bootstrap(device, Length::from_raw(16 * PAGE_SIZE.as_raw()));
    }

    #[test]
    fn alloc_until_full_then_dealloc() {
        let swap = manager(4);
        let a = swap.alloc().unwrap();
        let b = swap.alloc().unwrap();
        let c = swap.alloc().unwrap();
        assert_eq!(swap.alloc(), Err(VmError::OutOfSpace));
        assert_eq!(swap.stats().free_slots, 0);

        swap.dealloc(b);
        assert_eq!(swap.alloc().unwrap(), b);

        swap.dealloc(a);
        swap.dealloc(b);
        swap.dealloc(c);
        assert_eq!(swap.stats().free_slots, 3);
    }

    #[test]
    fn reserve_accounting() {
        let swap = manager(8);
        swap.reserve(5).unwrap();
        assert_eq!(swap.reserve(3), Err(VmError::OutOfSpace));
        swap.reserve(2).unwrap();
        assert_eq!(swap.stats().reserved_slots, 7);

        swap.unreserve(7);
        assert_eq!(swap.stats().reserved_slots, 0);
    }

    #[test]
    #[should_panic]
    fn unreserve_must_not_underflow() {
        let swap = manager(8);
        swap.reserve(2).unwrap();
        swap.unreserve(3);
    }

    #[test]
    fn io_round_trips_through_a_window() {
        use crate::addr::PhysExtent;
        use crate::platform::KernelWindow;

        let swap = manager(8);

        let layout = std::alloc::Layout::from_size_align(2 * PAGE_BYTES, PAGE_BYTES).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        let phys = PhysExtent::from_raw(0x10000, 2 * PAGE_BYTES as u64);
        let window = unsafe { KernelWindow::new(phys, base) };

        let frame_a = PhysAddress::from_raw(0x10000);
        let frame_b = PhysAddress::from_raw(0x11000);
        unsafe { core::ptr::write_bytes(window.frame_ptr(frame_a), 0xab, PAGE_BYTES) };

        let slot = swap.alloc().unwrap();
        swap.swap_out(&window, frame_a, slot);
        swap.swap_in(&window, frame_b, slot);

        let copied = unsafe { core::slice::from_raw_parts(window.frame_ptr(frame_b), PAGE_BYTES) };
        assert!(copied.iter().all(|&b| b == 0xab));

        unsafe { std::alloc::dealloc(base, layout) };
    }

    use proptest::prelude::*;

    proptest! {
        /// Arbitrary alloc/dealloc interleavings hand out unique slots and
        /// conserve the slot count.
        #[test]
        fn alloc_dealloc_conserves_slots(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
            let swap = manager(16);
            let total_free = swap.stats().free_slots;
            let mut held: Vec<SwapAddr> = Vec::new();

            for take in ops {
                if take {
                    match swap.alloc() {
                        Ok(addr) => {
                            prop_assert!(!held.contains(&addr));
                            prop_assert!(addr.slot() != 0);
                            held.push(addr);
                        }
                        Err(e) => {
                            prop_assert_eq!(e, VmError::OutOfSpace);
                            prop_assert_eq!(held.len() as u64, total_free);
                        }
                    }
                } else if let Some(addr) = held.pop() {
                    swap.dealloc(addr);
                }
                prop_assert_eq!(swap.stats().free_slots, total_free - held.len() as u64);
            }
        }
    }
}
