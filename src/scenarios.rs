//! End-to-end paging scenarios, driven through the public surface the way
//! the region layer and kernel allocators would drive it. The two-thread
//! scenarios lean on the test platform's pending-IPI queue and the swap
//! device's injectable write delay to pin down the interleavings.

use crate::addr::VirtAddress;
use crate::testutil::{set_cpu, TestAddrSpace, TestRig};
use crate::vmpage::{FaultKind, VmPage};

use std::sync::Arc;
use std::time::Duration;

use test_log::test;

#[test]
fn s1_fault_evict_fault_restores_contents() {
    let rig = TestRig::with_frames(4);
    let aspace = TestAddrSpace::new(&rig);

    let mut pages = Vec::new();
    for i in 0..4u8 {
        let page = VmPage::new_blank(&rig.core).unwrap();
        rig.fill_frame(page.resident().unwrap(), 0xa0 + i);
        pages.push(page);
        rig.check_invariants();
    }
    assert_eq!(rig.core.coremap.stats().free_frames, 0);

    // A fifth page has nowhere to go without pushing someone out.
    let p5 = VmPage::new_blank(&rig.core).unwrap();
    rig.check_invariants();
    assert!(p5.resident().is_some());
    assert_eq!(rig.device.write_count(), 1);

    let evicted: Vec<usize> = (0..pages.len())
        .filter(|&i| pages[i].resident().is_none())
        .collect();
    assert_eq!(evicted.len(), 1);
    let victim = evicted[0];

    // Faulting the victim back in evicts somebody else and restores the
    // original bytes.
    pages[victim]
        .fault(
            &rig.core,
            &aspace,
            FaultKind::Read as u32,
            VirtAddress::from_raw(0x1000 * victim as u64),
        )
        .unwrap();
    let paddr = pages[victim].resident().unwrap();
    assert!(rig.frame_is(paddr, 0xa0 + victim as u8));
    rig.check_invariants();

    for page in pages {
        VmPage::destroy(page, &rig.core);
    }
    VmPage::destroy(p5, &rig.core);
    rig.check_invariants();
    assert_eq!(rig.core.coremap.stats().user_frames, 0);
}

#[test]
fn s2_contiguous_kernel_alloc_evicts_a_window() {
    let rig = TestRig::with_frames(6);
    let aspace = TestAddrSpace::new(&rig);

    let mut pages = Vec::new();
    for i in 0..6u8 {
        let page = VmPage::new_blank(&rig.core).unwrap();
        rig.fill_frame(page.resident().unwrap(), 0x10 + i);
        pages.push(page);
    }

    let run = rig.core.alloc_kpages(3).unwrap();
    rig.check_invariants();
    let stats = rig.core.coremap.stats();
    assert_eq!(stats.kernel_frames, 3);
    assert_eq!(stats.user_frames, 3);
    assert_eq!(stats.free_frames, 0);
    assert_eq!(rig.device.write_count(), 3);
    assert_eq!(
        pages.iter().filter(|p| p.resident().is_none()).count(),
        3
    );

    rig.core.free_kpages(run);
    assert_eq!(rig.core.coremap.stats().free_frames, 3);
    assert_eq!(rig.core.coremap.stats().kernel_frames, 0);
    rig.check_invariants();

    // Everyone evicted comes back intact.
    for (i, page) in pages.iter().enumerate() {
        if page.resident().is_some() {
            continue;
        }
        page.fault(
            &rig.core,
            &aspace,
            FaultKind::Read as u32,
            VirtAddress::from_raw(0x2000 + 0x1000 * i as u64),
        )
        .unwrap();
        assert!(rig.frame_is(page.resident().unwrap(), 0x10 + i as u8));
    }
    rig.check_invariants();

    for page in pages {
        VmPage::destroy(page, &rig.core);
    }
}

#[test]
fn s3_wired_frames_are_never_victims() {
    let rig = TestRig::with_frames(4);

    let p1 = VmPage::new_blank(&rig.core).unwrap();
    let p1_paddr = p1.resident().unwrap();
    rig.core.coremap.wire(p1_paddr);

    let others: Vec<Arc<VmPage>> = (0..3)
        .map(|_| VmPage::new_blank(&rig.core).unwrap())
        .collect();
    assert_eq!(rig.core.coremap.stats().free_frames, 0);

    // Replacement must pick around the wired frame.
    let p5 = VmPage::new_blank(&rig.core).unwrap();
    assert_eq!(p1.resident(), Some(p1_paddr));
    assert_eq!(
        others.iter().filter(|p| p.resident().is_none()).count(),
        1
    );
    rig.check_invariants();

    rig.core.coremap.unwire(p1_paddr);
    for page in others {
        VmPage::destroy(page, &rig.core);
    }
    VmPage::destroy(p1, &rig.core);
    VmPage::destroy(p5, &rig.core);
}

#[test]
fn s4_eviction_shoots_down_a_remote_tlb_entry() {
    let rig = TestRig::with_frames(1);
    let aspace = TestAddrSpace::new(&rig);

    let page = VmPage::new_blank(&rig.core).unwrap();
    let slot = page.swap_addr().slot();

    set_cpu(0);
    page.fault(
        &rig.core,
        &aspace,
        FaultKind::Write as u32,
        VirtAddress::from_raw(0x2000),
    )
    .unwrap();
    let mapping = aspace.last_mapping().unwrap();
    assert_eq!(mapping.cpu, 0);

    std::thread::scope(|s| {
        let rig_ref = &rig;
        let evictor = s.spawn(move || {
            set_cpu(1);
            // The only frame belongs to the mapped page; taking one forces
            // the replacement path and the cross-CPU shootdown.
            rig_ref.core.coremap.alloc(&rig_ref.core, None, false).unwrap()
        });

        // Play the interrupt controller for CPU 0.
        let request = loop {
            if let Some(request) = rig.platform.take_ipi_for(0) {
                break request;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(request.slot, mapping.slot);
        rig.core.vm_tlbshootdown(request);

        let kpage = evictor.join().unwrap();
        rig.core.coremap.free(kpage, true);
    });

    // The handler invalidated CPU 0's entry before the eviction went to
    // the device.
    let invalidated = rig
        .events
        .index_of(&format!("tlb invalidate cpu 0 slot {}", mapping.slot))
        .unwrap();
    let wrote = rig
        .events
        .index_of(&format!("swap write slot {} begin", slot))
        .unwrap();
    assert!(invalidated < wrote);
    assert!(page.resident().is_none());
    rig.check_invariants();

    VmPage::destroy(page, &rig.core);
}

#[test]
fn s5_fault_waits_out_an_in_transit_eviction() {
    let rig = TestRig::with_frames(2);
    let aspace = TestAddrSpace::new(&rig);

    let page = VmPage::new_blank(&rig.core).unwrap();
    rig.fill_frame(page.resident().unwrap(), 0x99);
    let slot = page.swap_addr().slot();

    rig.device.set_write_delay(Duration::from_millis(150));

    std::thread::scope(|s| {
        let rig_ref = &rig;
        let page_ref = &page;
        let evictor = s.spawn(move || {
            let paddr = page_ref.resident().unwrap();
            rig_ref.core.coremap.evict_frame_at(&rig_ref.core, paddr);
        });

        // Wait until the eviction is committed to the device, then fault.
        // The page is in transit, so the fault sleeps until the write
        // lands and then drives its own swap-in.
        while rig
            .events
            .index_of(&format!("swap write slot {} begin", slot))
            .is_none()
        {
            std::thread::sleep(Duration::from_millis(1));
        }
        page.fault(
            &rig.core,
            &aspace,
            FaultKind::Read as u32,
            VirtAddress::from_raw(0x3000),
        )
        .unwrap();

        evictor.join().unwrap();
    });

    let wrote = rig
        .events
        .index_of(&format!("swap write slot {}", slot))
        .unwrap();
    let read = rig
        .events
        .index_of(&format!("swap read slot {}", slot))
        .unwrap();
    assert!(wrote < read, "the fault read the slot before the eviction finished writing it");
    assert_eq!(rig.device.read_count(), 1);

    assert!(rig.frame_is(page.resident().unwrap(), 0x99));
    rig.check_invariants();

    VmPage::destroy(page, &rig.core);
}

#[test]
fn s6_clones_do_not_share_fate() {
    let rig = TestRig::with_frames(2);
    let aspace = TestAddrSpace::new(&rig);

    let p = VmPage::new_blank(&rig.core).unwrap();
    rig.fill_frame(p.resident().unwrap(), 0xaa);

    let q = VmPage::clone_page(&p, &rig.core).unwrap();
    assert_ne!(p.swap_addr(), q.swap_addr());

    // Scribbling over the original must not show through the clone,
    // resident or swapped out.
    rig.fill_frame(p.resident().unwrap(), 0xbb);
    assert!(rig.frame_is(q.resident().unwrap(), 0xaa));

    rig.core.coremap.evict_frame_at(&rig.core, q.resident().unwrap());
    assert!(q.resident().is_none());
    q.fault(
        &rig.core,
        &aspace,
        FaultKind::Read as u32,
        VirtAddress::from_raw(0x7000),
    )
    .unwrap();
    assert!(rig.frame_is(q.resident().unwrap(), 0xaa));
    assert!(rig.frame_is(p.resident().unwrap(), 0xbb));
    rig.check_invariants();

    VmPage::destroy(p, &rig.core);
    VmPage::destroy(q, &rig.core);
}
