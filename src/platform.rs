//! Contracts with the rest of the kernel.
//!
//! The core does not talk to hardware or to the region layer directly. The
//! CPU/TLB surface, the swap block device, the region layer's mapping hook
//! and the pre-initialization RAM allocator all enter through the traits
//! here, so the whole core can be driven on a host as well as on a machine.

use crate::addr::{Length, PhysAddress, PhysExtent, VirtAddress};
use crate::page::{PAGE_BYTES, PAGE_SIZE};

pub type CpuId = u32;
pub type TlbSlot = u32;

/// A live TLB entry location: which slot on which CPU.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TlbRef {
    pub cpu: CpuId,
    pub slot: TlbSlot,
}

/// Payload of a remote TLB invalidation request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TlbShootdown {
    pub slot: TlbSlot,
    pub frame_index: usize,
}

/// CPU identity, interrupt state and the TLB, as seen from the current CPU.
///
/// `tlb_invalidate` and `tlb_clear` act on the calling CPU's TLB only.
/// `ipi_shootdown` posts `request` to `target`; the target CPU must deliver
/// it to [`Coremap::tlb_shootdown`](crate::coremap::Coremap::tlb_shootdown).
pub trait Platform: Clone {
    fn current_cpu(&self) -> CpuId;
    fn in_interrupt(&self) -> bool;
    fn tlb_invalidate(&self, slot: TlbSlot);
    fn tlb_clear(&self);
    fn ipi_shootdown(&self, target: CpuId, request: TlbShootdown);
    /// Seed material for the replacement scan.
    fn entropy(&self) -> u64;
}

/// The block device backing swap. Offsets are byte offsets from the start of
/// the device; transfers are always one frame.
///
/// I/O errors are fatal to the kernel, so callers panic on `Err`.
pub trait SwapDevice {
    type Error: core::fmt::Debug;

    fn size(&self) -> Length;
    fn read(&self, offset: u64, frame: &mut [u8; PAGE_BYTES]) -> Result<(), Self::Error>;
    fn write(&self, offset: u64, frame: &[u8; PAGE_BYTES]) -> Result<(), Self::Error>;
}

/// The region layer's mapping hook, called at the end of a fault with the
/// faulting frame still wired. The implementation installs the translation
/// and records the live TLB entry in the coremap
/// ([`note_mapping`](crate::coremap::Coremap::note_mapping)).
pub trait VmMap {
    fn vm_map(&self, vaddr: VirtAddress, paddr: PhysAddress, writeable: bool);
}

/// The bootstrap RAM allocator used before the coremap exists. Stolen memory
/// is not tracked and can never be freed.
pub trait StealMem {
    /// Grabs `frames` contiguous frames.
    ///
    /// # Panics
    ///
    /// Panics if boot-time memory is exhausted.
    fn steal(&mut self, frames: u64) -> PhysAddress;
}

/// The direct-mapped kernel view of managed physical memory. Frame contents
/// are only ever touched through this window: zeroing, frame-to-frame
/// copies and swap I/O.
#[derive(Clone, Copy)]
pub struct KernelWindow {
    phys: PhysExtent,
    base: *mut u8,
}

// The window is a translation, not an owner; the memory behind it is
// guarded by the coremap's frame states.
unsafe impl Send for KernelWindow {}
unsafe impl Sync for KernelWindow {}

impl KernelWindow {
    /// Creates a window mapping `phys` at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a writable mapping of all of `phys`, at least
    /// page aligned, and the mapping must outlive the window. All access to
    /// the covered memory goes through the window (and the descriptors
    /// carved from it); the caller must not retain aliases.
    pub unsafe fn new(phys: PhysExtent, base: *mut u8) -> KernelWindow {
        assert!(phys.is_aligned_to(PAGE_SIZE.as_raw()));
        assert!(!base.is_null());
        assert_eq!(base as usize % PAGE_BYTES, 0);
        KernelWindow { phys, base }
    }

    pub fn phys_extent(&self) -> PhysExtent {
        self.phys
    }

    pub fn to_virt(&self, paddr: PhysAddress) -> VirtAddress {
        assert!(self.phys.contains_address(paddr));
        let offset = paddr - self.phys.address();
        VirtAddress::from_raw(self.base as usize as u64 + offset.as_raw())
    }

    pub fn to_phys(&self, vaddr: VirtAddress) -> PhysAddress {
        let base = self.base as usize as u64;
        let offset = vaddr
            .as_raw()
            .checked_sub(base)
            .expect("address below the kernel window");
        let paddr = self.phys.address() + Length::from_raw(offset);
        assert!(self.phys.contains_address(paddr));
        paddr
    }

    /// Pointer to the frame starting at `paddr`, which must be page aligned
    /// and inside the window. The caller must hold the frame reserved
    /// (wired or kernel owned) for the duration of the access.
    pub(crate) fn frame_ptr(&self, paddr: PhysAddress) -> *mut u8 {
        assert!(paddr.is_aligned_to(PAGE_SIZE.as_raw()));
        self.to_virt(paddr).as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_translation_round_trips() {
        let mut backing = vec![0u8; 4 * PAGE_BYTES + PAGE_BYTES];
        // Align the base up to a page boundary inside the buffer.
        let raw = backing.as_mut_ptr();
        let base = unsafe { raw.add(raw.align_offset(PAGE_BYTES)) };

        let phys = PhysExtent::from_raw(0x10000, 4 * PAGE_BYTES as u64);
        let window = unsafe { KernelWindow::new(phys, base) };

        let paddr = PhysAddress::from_raw(0x11000);
        let vaddr = window.to_virt(paddr);
        assert_eq!(window.to_phys(vaddr), paddr);
        assert_eq!(vaddr.as_raw(), base as usize as u64 + PAGE_BYTES as u64);
    }

    #[test]
    #[should_panic]
    fn window_rejects_out_of_range() {
        let mut backing = vec![0u8; 2 * PAGE_BYTES];
        let raw = backing.as_mut_ptr();
        let base = unsafe { raw.add(raw.align_offset(PAGE_BYTES)) };

        let phys = PhysExtent::from_raw(0x10000, PAGE_BYTES as u64);
        let window = unsafe { KernelWindow::new(phys, base) };
        window.to_virt(PhysAddress::from_raw(0x20000));
    }
}
