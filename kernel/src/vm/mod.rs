// kernel/src/vm/mod.rs
//
// Public facade for the virtual memory subsystem. Everything outside
// this module — the page-fault handler, process teardown, the mmap
// syscalls — goes through these functions; nothing outside vm/ should
// reach into spt.rs, frame.rs or address_space.rs directly.

extern crate alloc;

pub mod address_space;
pub mod anon;
pub mod fault;
pub mod file_backend;
pub mod fork;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod spt;
pub mod swap;
pub mod traits;
pub mod uninit;

#[cfg(not(test))]
pub mod x86_impl;
#[cfg(test)]
pub mod test_support;

use alloc::boxed::Box;

use crate::process::Pid;

use address_space::{AddressSpace, AllocatorHandle, PageTableHandle};
use page::{InitClosure, TargetKind};
use traits::BlockDevice;

pub use fault::vm_try_handle_fault;
pub use mmap::{do_mmap, do_munmap};

/// One-time subsystem setup: wires the swap device. Call once during
/// boot, before any process can fault.
pub fn vm_init(disk: Box<dyn BlockDevice>) {
    swap::init(disk);
}

/// Register a freshly created process's address space. `page_table`
/// is already built by the caller (the real PML4-backed handle in
/// production, a bare `FakeAddressSpace` in tests).
pub fn spt_init(pid: Pid, page_table: PageTableHandle) {
    address_space::register(AddressSpace::new(pid, page_table));
}

/// Copy `parent`'s address space into `child`'s, sharing frames
/// copy-on-write. `child` must already be registered with `spt_init`.
pub fn spt_copy(parent: Pid, child: Pid) -> Result<(), &'static str> {
    fork::spt_copy(parent, child)
}

/// Tear down a process's address space: release every frame and swap
/// slot it still owns, then drop the registry entry.
pub fn spt_kill(pid: Pid) {
    address_space::with_address_space(pid, |aspace| {
        let mut alloc = AllocatorHandle::default();
        aspace.spt.kill(&mut aspace.page_table, &mut alloc);
    });
    address_space::unregister(pid);
}

pub fn vm_alloc_page_with_initializer(
    pid: Pid,
    va: u64,
    writable: bool,
    target: TargetKind,
    init: Option<InitClosure>,
) -> Result<(), &'static str> {
    address_space::with_address_space(pid, |aspace| {
        aspace.alloc_page_with_initializer(va, writable, target, init)
    })
    .ok_or("vm_alloc_page_with_initializer: address space not found")?
}

pub fn vm_alloc_page(pid: Pid, va: u64, writable: bool, target: TargetKind) -> Result<(), &'static str> {
    vm_alloc_page_with_initializer(pid, va, writable, target, None)
}

/// Force a page to be resident right now, bypassing the fault path —
/// used by syscalls that need to touch a user buffer directly (e.g.
/// copying argv onto a freshly allocated stack before the process
/// ever runs and can fault it in itself).
pub fn vm_claim_page(pid: Pid, va: u64) -> Result<(), &'static str> {
    address_space::with_address_space(pid, |aspace| {
        let mut alloc = AllocatorHandle::default();
        aspace.claim_page(va, &mut alloc)
    })
    .ok_or("vm_claim_page: address space not found")?
}

/// End-to-end scenarios exercised entirely through this facade — the
/// same door a syscall handler would use — plus a couple of direct
/// calls into `frame` where the facade has no way to force eviction
/// (the fake page allocator never actually runs out of memory).
#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec;

    use crate::process::Pid;

    use super::address_space::AllocatorHandle;
    use super::fault::{USER_STACK_TOP, vm_try_handle_fault};
    use super::page::TargetKind;
    use super::test_support::{FakeAddressSpace, FakeDisk, FakeFile};
    use super::traits::FileBackend;
    use super::{address_space, do_mmap, do_munmap, frame, swap, vm_alloc_page, vm_claim_page};

    /// Every test gets its own pid (never reused within a single test
    /// binary run) so the PID-keyed registry never collides between
    /// tests sharing the same boot image.
    fn fresh_pid(tag: u16) -> Pid {
        Pid(0x9000 + tag as usize)
    }

    fn spt_init_fake(pid: Pid) {
        address_space::register(address_space::AddressSpace::new(pid, FakeAddressSpace::new()));
    }

    fn spt_kill_fake(pid: Pid) {
        address_space::with_address_space(pid, |a| {
            let mut alloc = AllocatorHandle::default();
            a.spt.kill(&mut a.page_table, &mut alloc);
        });
        address_space::unregister(pid);
    }

    fn read_kva(kva: super::traits::Kva, len: usize) -> Vec<u8> {
        unsafe { core::slice::from_raw_parts(kva.as_ptr::<u8>(), len).to_vec() }
    }

    fn page_writable_and_resident(pid: Pid, va: u64) -> Option<(bool, bool)> {
        address_space::with_address_space(pid, |a| {
            a.spt.find(va).map(|p| (p.writable, p.frame.is_some()))
        })
        .flatten()
    }

    // S1: touching one page below the user stack top grows the stack.
    #[test_case]
    fn s1_stack_growth_creates_a_writable_anon_stack_page() {
        let pid = fresh_pid(1);
        spt_init_fake(pid);

        let fault_addr = USER_STACK_TOP - 4096;
        let ok = vm_try_handle_fault(pid, fault_addr, true, true, true, fault_addr);
        assert!(ok, "legal stack growth must succeed");

        let (writable, resident) = page_writable_and_resident(pid, fault_addr).expect("page must exist");
        assert!(writable);
        assert!(resident);

        spt_kill_fake(pid);
    }

    // S2: an access far enough below the stack is not a legal growth.
    #[test_case]
    fn s2_access_beyond_stack_growth_window_is_rejected() {
        let pid = fresh_pid(2);
        spt_init_fake(pid);

        let fault_addr = USER_STACK_TOP - (1024 * 1024 + 4096);
        let ok = vm_try_handle_fault(pid, fault_addr, true, true, true, fault_addr);
        assert!(!ok, "fault resolver must refuse to grow the stack this far");
        assert!(address_space::with_address_space(pid, |a| a.spt.find(fault_addr).is_some()).unwrap());

        spt_kill_fake(pid);
    }

    // S3: mmap a file shorter than the mapping length lays out the
    // trailing bytes (in both the last file-backed page and every page
    // after it) as zero-fill.
    #[test_case]
    fn s3_mmap_short_file_zero_fills_the_tail() {
        let pid = fresh_pid(3);
        spt_init_fake(pid);

        let content: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        let file: Box<dyn super::traits::FileBackend> = FakeFile::boxed(content.clone());

        let addr = do_mmap(pid, 0x4000_0000, 5000, true, file, 0).expect("mmap must succeed");
        assert_eq!(addr, 0x4000_0000);

        vm_claim_page(pid, addr).unwrap();
        vm_claim_page(pid, addr + 4096).unwrap();

        let (frame0, frame1) = address_space::with_address_space(pid, |a| {
            (
                a.spt.find(addr).unwrap().frame.unwrap(),
                a.spt.find(addr + 4096).unwrap().frame.unwrap(),
            )
        })
        .unwrap();

        let page0 = read_kva(frame::kva_of(frame0), 4096);
        assert_eq!(&page0[..3000], content.as_slice());
        assert!(page0[3000..].iter().all(|&b| b == 0));

        let page1 = read_kva(frame::kva_of(frame1), 4096);
        assert!(page1.iter().all(|&b| b == 0), "second page has no file bytes left to back it");

        do_munmap(pid, addr).unwrap();
        assert!(address_space::with_address_space(pid, |a| a.spt.find(addr).is_none()).unwrap());

        spt_kill_fake(pid);
    }

    // S4: a second mmap overlapping an existing one is rejected with no
    // side effects on the address space.
    #[test_case]
    fn s4_overlapping_mmap_is_rejected() {
        let pid = fresh_pid(4);
        spt_init_fake(pid);

        let first: Box<dyn super::traits::FileBackend> = FakeFile::boxed(vec![1u8; 4096]);
        do_mmap(pid, 0x5000_0000, 4096, true, first, 0).unwrap();

        let second: Box<dyn super::traits::FileBackend> = FakeFile::boxed(vec![2u8; 4096]);
        let result = do_mmap(pid, 0x5000_0000, 4096, true, second, 0);
        assert!(result.is_err());

        // Exactly the first mapping's page is present — the rejected
        // second mmap left nothing behind.
        let region_count = address_space::with_address_space(pid, |a| a.mmap_regions.len()).unwrap();
        assert_eq!(region_count, 1);

        spt_kill_fake(pid);
    }

    // S5: fork shares frames copy-on-write. Writes on either side after
    // the fork are invisible to the other, and each side's refcount
    // drops back to 1 once it has taken its own copy.
    #[test_case]
    fn s5_fork_cow_isolates_writes_both_ways() {
        let parent = fresh_pid(5);
        let child = fresh_pid(6);
        spt_init_fake(parent);
        spt_init_fake(child);

        let va = 0x6000_0000u64;
        vm_alloc_page(parent, va, true, TargetKind::Anon { is_stack: false }).unwrap();
        vm_claim_page(parent, va).unwrap();

        let parent_frame = address_space::with_address_space(parent, |a| a.spt.find(va).unwrap().frame.unwrap()).unwrap();
        let pattern_p: Vec<u8> = vec![0xABu8; 4096];
        unsafe {
            core::ptr::copy_nonoverlapping(pattern_p.as_ptr(), frame::kva_of(parent_frame).as_mut_ptr::<u8>(), 4096)
        };

        super::fork::spt_copy(parent, child).unwrap();

        // Both sides now share one frame, refcount 2, both marked COW.
        assert_eq!(frame::refcount(parent_frame), 2);
        let child_is_cow = address_space::with_address_space(child, |a| a.spt.find(va).unwrap().is_cow).unwrap();
        let parent_is_cow = address_space::with_address_space(parent, |a| a.spt.find(va).unwrap().is_cow).unwrap();
        assert!(child_is_cow && parent_is_cow);

        // Child sees the parent's pre-fork bytes.
        let child_frame_before = address_space::with_address_space(child, |a| a.spt.find(va).unwrap().frame.unwrap()).unwrap();
        assert_eq!(child_frame_before, parent_frame);
        assert_eq!(read_kva(frame::kva_of(child_frame_before), 4096), pattern_p);

        // Child writes through the COW handler.
        let child_wrote = vm_try_handle_fault(child, va, true, true, false, va);
        assert!(child_wrote);
        let child_frame_after = address_space::with_address_space(child, |a| a.spt.find(va).unwrap().frame.unwrap()).unwrap();
        assert_ne!(child_frame_after, parent_frame, "child must have copied onto a fresh frame");
        unsafe {
            core::ptr::write_bytes(frame::kva_of(child_frame_after).as_mut_ptr::<u8>(), 0xCD, 4096)
        };

        // Parent is unaffected by the child's write.
        assert_eq!(frame::refcount(parent_frame), 1, "parent is sole owner again");
        assert_eq!(read_kva(frame::kva_of(parent_frame), 4096), pattern_p);

        // Parent writes now too; still invisible to the child's copy.
        let parent_wrote = vm_try_handle_fault(parent, va, true, true, false, va);
        assert!(parent_wrote);
        unsafe {
            core::ptr::write_bytes(frame::kva_of(parent_frame).as_mut_ptr::<u8>(), 0xEF, 4096)
        };
        assert_eq!(read_kva(frame::kva_of(child_frame_after), 4096), vec![0xCDu8; 4096]);

        spt_kill_fake(parent);
        spt_kill_fake(child);
    }

    // S6: an evicted ANON page reads back byte-identical after its next claim.
    #[test_case]
    fn s6_swap_round_trip_after_eviction() {
        swap::init(Box::new(FakeDisk::new(swap::SWAP_SLOT_COUNT * super::traits::SECTORS_PER_PAGE)));

        let pid = fresh_pid(7);
        spt_init_fake(pid);

        let va = 0x7000_0000u64;
        vm_alloc_page(pid, va, true, TargetKind::Anon { is_stack: false }).unwrap();
        vm_claim_page(pid, va).unwrap();

        let frame_id = address_space::with_address_space(pid, |a| a.spt.find(va).unwrap().frame.unwrap()).unwrap();
        let pattern: Vec<u8> = (0..4096u32).map(|i| (i % 199) as u8).collect();
        unsafe { core::ptr::copy_nonoverlapping(pattern.as_ptr(), frame::kva_of(frame_id).as_mut_ptr::<u8>(), 4096) };

        let mut alloc = AllocatorHandle::default();
        frame::evict_frame(frame_id, &mut alloc);

        let (resident, swapped) = address_space::with_address_space(pid, |a| {
            let page = a.spt.find(va).unwrap();
            (page.frame.is_some(), matches!(&page.kind, super::page::PageKind::Anon(s) if s.swap_index >= 0))
        })
        .unwrap();
        assert!(!resident);
        assert!(swapped);

        vm_claim_page(pid, va).unwrap();
        let new_frame = address_space::with_address_space(pid, |a| a.spt.find(va).unwrap().frame.unwrap()).unwrap();
        assert_eq!(read_kva(frame::kva_of(new_frame), 4096), pattern);

        spt_kill_fake(pid);
    }

    // Property 8: a mapped page dirtied through its mapping is written
    // back to the file on munmap, and the write is visible through a
    // fresh reopen of that same file — not just through the mapping.
    #[test_case]
    fn dirty_mmap_writeback_persists_through_munmap_and_reopen() {
        let pid = fresh_pid(8);
        spt_init_fake(pid);

        let backing = FakeFile::new(vec![0u8; 4096]);
        let file: Box<dyn super::traits::FileBackend> = backing.reopen();
        let addr = 0x8000_0000u64;
        do_mmap(pid, addr, 4096, true, file, 0).expect("mmap must succeed");
        vm_claim_page(pid, addr).unwrap();

        let frame_id = address_space::with_address_space(pid, |a| a.spt.find(addr).unwrap().frame.unwrap()).unwrap();
        let pattern: Vec<u8> = (0..4096u32).map(|i| (i % 233) as u8).collect();
        unsafe { core::ptr::copy_nonoverlapping(pattern.as_ptr(), frame::kva_of(frame_id).as_mut_ptr::<u8>(), 4096) };

        // Simulate the hardware having observed a write to the mapping.
        address_space::with_address_space(pid, |a| a.page_table.set_dirty(addr, true)).unwrap();

        do_munmap(pid, addr).expect("munmap must succeed");

        let mut reopened = backing.reopen();
        let mut readback = vec![0u8; 4096];
        reopened.read(&mut readback).unwrap();
        assert_eq!(readback, pattern, "dirty mapped bytes must be persisted to the backing file");

        spt_kill_fake(pid);
    }
}
