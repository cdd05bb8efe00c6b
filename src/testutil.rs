//! Host-side stand-ins for the platform: a page-aligned RAM buffer behind a
//! kernel window, an in-memory swap device, a multi-CPU platform whose CPU
//! identity is per thread, and a minimal region layer over a software TLB.
//! A shared event log records TLB and swap traffic so tests can assert on
//! ordering across components.

use crate::addr::{Length, PhysAddress, PhysExtent, VirtAddress};
use crate::page::{Frame, PAGE_BYTES, PAGE_SIZE};
use crate::platform::{CpuId, KernelWindow, Platform, SwapDevice, TlbShootdown, TlbSlot, VmMap};
use crate::vm::VmCore;

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    fn new() -> EventLog {
        EventLog(Mutex::new(Vec::new()))
    }

    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    /// Index of the first exact occurrence of `event`.
    pub fn index_of(&self, event: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == event)
    }

    pub fn count_matching(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }
}

thread_local! {
    static CURRENT_CPU: Cell<CpuId> = const { Cell::new(0) };
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
}

/// Sets the CPU the current thread claims to run on.
pub(crate) fn set_cpu(cpu: CpuId) {
    CURRENT_CPU.with(|c| c.set(cpu));
}

pub(crate) fn current_cpu() -> CpuId {
    CURRENT_CPU.with(|c| c.get())
}

pub(crate) fn set_in_interrupt(on: bool) {
    IN_INTERRUPT.with(|c| c.set(on));
}

pub(crate) struct TestPlatform {
    events: Arc<EventLog>,
    ipis: Mutex<VecDeque<(CpuId, TlbShootdown)>>,
    seed: u64,
}

impl TestPlatform {
    fn new(events: Arc<EventLog>, seed: u64) -> TestPlatform {
        TestPlatform {
            events,
            ipis: Mutex::new(VecDeque::new()),
            seed,
        }
    }

    /// Pops the oldest IPI pending for `cpu`, if any. Tests play the role
    /// of the interrupt controller and feed the request to the handler.
    pub fn take_ipi_for(&self, cpu: CpuId) -> Option<TlbShootdown> {
        let mut pending = self.ipis.lock().unwrap();
        let pos = pending.iter().position(|(target, _)| *target == cpu)?;
        pending.remove(pos).map(|(_, request)| request)
    }
}

impl Platform for Arc<TestPlatform> {
    fn current_cpu(&self) -> CpuId {
        current_cpu()
    }

    fn in_interrupt(&self) -> bool {
        IN_INTERRUPT.with(|c| c.get())
    }

    fn tlb_invalidate(&self, slot: TlbSlot) {
        self.events
            .push(format!("tlb invalidate cpu {} slot {}", current_cpu(), slot));
    }

    fn tlb_clear(&self) {
        self.events.push(format!("tlb clear cpu {}", current_cpu()));
    }

    fn ipi_shootdown(&self, target: CpuId, request: TlbShootdown) {
        self.events.push(format!(
            "ipi to cpu {} slot {} frame {}",
            target, request.slot, request.frame_index
        ));
        self.ipis.lock().unwrap().push_back((target, request));
    }

    fn entropy(&self) -> u64 {
        self.seed
    }
}

pub(crate) struct TestSwapDevice {
    data: Mutex<Vec<u8>>,
    events: Arc<EventLog>,
    write_delay_ms: AtomicU64,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl TestSwapDevice {
    pub fn new(slots: u64) -> TestSwapDevice {
        Self::with_events(slots, Arc::new(EventLog::new()))
    }

    fn with_events(slots: u64, events: Arc<EventLog>) -> TestSwapDevice {
        TestSwapDevice {
            data: Mutex::new(vec![0; (slots * PAGE_SIZE.as_raw()) as usize]),
            events,
            write_delay_ms: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Stretches every subsequent write, holding the page being evicted in
    /// transit long enough for another thread to trip over it.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SwapDevice for Arc<TestSwapDevice> {
    type Error = Infallible;

    fn size(&self) -> Length {
        Length::from_raw(self.data.lock().unwrap().len() as u64)
    }

    fn read(&self, offset: u64, frame: &mut [u8; PAGE_BYTES]) -> Result<(), Infallible> {
        let start = offset as usize;
        frame.copy_from_slice(&self.data.lock().unwrap()[start..start + PAGE_BYTES]);
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.events
            .push(format!("swap read slot {}", offset / PAGE_SIZE.as_raw()));
        Ok(())
    }

    fn write(&self, offset: u64, frame: &[u8; PAGE_BYTES]) -> Result<(), Infallible> {
        let slot = offset / PAGE_SIZE.as_raw();
        self.events.push(format!("swap write slot {} begin", slot));

        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        let start = offset as usize;
        self.data.lock().unwrap()[start..start + PAGE_BYTES].copy_from_slice(frame);
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.events.push(format!("swap write slot {}", slot));
        Ok(())
    }
}

/// Page-aligned backing memory for the kernel window.
pub(crate) struct RamBuffer {
    base: *mut u8,
    layout: Layout,
}

// The buffer is raw storage; all concurrent access discipline lives in the
// core under test.
unsafe impl Send for RamBuffer {}
unsafe impl Sync for RamBuffer {}

impl RamBuffer {
    fn new(bytes: usize) -> RamBuffer {
        let layout = Layout::from_size_align(bytes, PAGE_BYTES).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        RamBuffer { base, layout }
    }

    fn base(&self) -> *mut u8 {
        self.base
    }
}

impl Drop for RamBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// Everything needed to bootstrap a core by hand.
pub(crate) struct TestParts {
    pub platform: Arc<TestPlatform>,
    pub device: Arc<TestSwapDevice>,
    pub events: Arc<EventLog>,
    pub window: KernelWindow,
    pub managed: PhysExtent,
    pub ram: RamBuffer,
}

impl TestParts {
    pub fn with_frames(frames: u64) -> TestParts {
        Self::build(frames, 2 * (frames + 1) + 16, 0x5eed)
    }

    /// Sizes managed RAM so that after the descriptor-table carve exactly
    /// `frames` frames remain. Holds as long as one page of descriptors
    /// covers the whole range, which the assertion pins down.
    pub fn build(frames: u64, slots: u64, seed: u64) -> TestParts {
        let total = frames + 1;
        assert!(total * 64 <= PAGE_BYTES as u64, "too many frames for one descriptor page");

        let ram = RamBuffer::new((total * PAGE_SIZE.as_raw()) as usize);
        let managed = PhysExtent::new(
            PhysAddress::from_raw(0x10_0000),
            Length::from_raw(total * PAGE_SIZE.as_raw()),
        );
        // SAFETY: the buffer is page aligned, covers `managed`, and is only
        // reachable through this window.
        let window = unsafe { KernelWindow::new(managed, ram.base()) };

        assert!(slots >= 2 * total, "swap device below the bootstrap minimum");
        let events = Arc::new(EventLog::new());
        let platform = Arc::new(TestPlatform::new(Arc::clone(&events), seed));
        let device = Arc::new(TestSwapDevice::with_events(slots, Arc::clone(&events)));

        TestParts {
            platform,
            device,
            events,
            window,
            managed,
            ram,
        }
    }
}

/// A bootstrapped core over host memory.
pub(crate) struct TestRig {
    pub platform: Arc<TestPlatform>,
    pub device: Arc<TestSwapDevice>,
    pub events: Arc<EventLog>,
    pub core: VmCore<Arc<TestPlatform>, Arc<TestSwapDevice>>,
    // Declared after `core` so the memory outlives it on drop.
    _ram: RamBuffer,
}

impl TestRig {
    pub fn with_frames(frames: u64) -> TestRig {
        Self::with_frames_and_slots(frames, 2 * (frames + 1) + 16)
    }

    pub fn with_frames_and_slots(frames: u64, slots: u64) -> TestRig {
        let parts = TestParts::build(frames, slots, 0x5eed);
        let core = VmCore::bootstrap(
            parts.platform.clone(),
            parts.window,
            parts.managed,
            parts.device.clone(),
        );
        assert_eq!(core.coremap.stats().free_frames, frames);

        TestRig {
            platform: parts.platform,
            device: parts.device,
            events: parts.events,
            core,
            _ram: parts.ram,
        }
    }

    /// Descriptor index of `paddr`.
    pub fn frame_index(&self, paddr: PhysAddress) -> usize {
        (Frame::new(paddr).index() - self.core.coremap.stats().base_frame) as usize
    }

    pub fn fill_frame(&self, paddr: PhysAddress, value: u8) {
        // SAFETY: tests only write frames they own, single threaded.
        unsafe { core::ptr::write_bytes(self.core.window().frame_ptr(paddr), value, PAGE_BYTES) };
    }

    pub fn frame_is(&self, paddr: PhysAddress, value: u8) -> bool {
        // SAFETY: as in `fill_frame`.
        let bytes =
            unsafe { core::slice::from_raw_parts(self.core.window().frame_ptr(paddr), PAGE_BYTES) };
        bytes.iter().all(|&b| b == value)
    }

    /// The quantified invariants, checked from outside the core.
    pub fn check_invariants(&self) {
        let cm = self.core.coremap.stats();
        assert_eq!(
            cm.total_frames,
            cm.free_frames + cm.kernel_frames + cm.user_frames
        );

        let sw = self.core.swap.stats();
        assert!(sw.reserved_slots <= sw.free_slots);
        assert!(sw.free_slots <= sw.total_slots);

        self.core.coremap.check_page_links();
    }
}

pub(crate) const TEST_TLB_SLOTS: u32 = 16;

#[derive(Clone, Copy, Debug)]
pub(crate) struct Mapping {
    pub cpu: CpuId,
    pub slot: TlbSlot,
    pub vaddr: VirtAddress,
    pub paddr: PhysAddress,
    pub writeable: bool,
}

/// A minimal region layer: installs translations into a software TLB, one
/// slot per call round robin, and keeps the coremap's records current the
/// way the real fault path would.
pub(crate) struct TestAddrSpace<'a> {
    rig: &'a TestRig,
    next_slot: AtomicU32,
    mappings: Mutex<Vec<Mapping>>,
}

impl<'a> TestAddrSpace<'a> {
    pub fn new(rig: &'a TestRig) -> TestAddrSpace<'a> {
        TestAddrSpace {
            rig,
            next_slot: AtomicU32::new(0),
            mappings: Mutex::new(Vec::new()),
        }
    }

    pub fn last_mapping(&self) -> Option<Mapping> {
        self.mappings.lock().unwrap().last().copied()
    }
}

impl VmMap for TestAddrSpace<'_> {
    fn vm_map(&self, vaddr: VirtAddress, paddr: PhysAddress, writeable: bool) {
        let cpu = current_cpu();
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst) % TEST_TLB_SLOTS;

        let mut mappings = self.mappings.lock().unwrap();
        if let Some(pos) = mappings.iter().position(|m| m.cpu == cpu && m.slot == slot) {
            let old = mappings.remove(pos);
            self.rig.core.coremap.mapping_replaced(old.paddr, old.cpu, old.slot);
        }
        mappings.push(Mapping {
            cpu,
            slot,
            vaddr,
            paddr,
            writeable,
        });
        self.rig.core.coremap.note_mapping(paddr, cpu, slot);
    }
}
