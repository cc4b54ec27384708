// kernel/src/vm/address_space.rs
//
// Per-process VM state (SPT + mmap regions + page table handle) and
// the PID-keyed registry other modules reach it through. Mirrors the
// teacher's `memory::vma::VMA_TABLE` global-registry-of-fixed-slots
// shape, but each slot is its own lock (`Arc<Mutex<AddressSpace>>`)
// instead of one table-wide lock, so unrelated processes never
// contend with each other just because they share the registry.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::process::Pid;

use super::page::TargetKind;
use super::spt::{self, Spt};
use super::traits::{AddressSpaceOps, InitClosure, Kva, PageAllocator};

#[cfg(not(test))]
pub type PageTableHandle = super::x86_impl::X86AddressSpace;
#[cfg(test)]
pub type PageTableHandle = super::test_support::FakeAddressSpace;

#[cfg(not(test))]
pub type AllocatorHandle = super::x86_impl::KernelPageAllocator;
#[cfg(test)]
pub type AllocatorHandle = super::test_support::FakePageAllocator;

pub const MAX_PROCESSES: usize = 64;
pub const MAX_MMAP_REGIONS_PER_PROCESS: usize = 32;

pub struct MmapRegion {
    pub id: u64,
    pub start: u64,
    pub length: u64,
}

pub struct AddressSpace {
    pub pid: Pid,
    pub page_table: PageTableHandle,
    pub spt: Spt,
    pub mmap_regions: Vec<MmapRegion>,
    next_region_id: u64,
}

impl AddressSpace {
    pub fn new(pid: Pid, page_table: PageTableHandle) -> Self {
        Self {
            pid,
            page_table,
            spt: Spt::new(),
            mmap_regions: Vec::new(),
            next_region_id: 1,
        }
    }

    pub fn alloc_region_id(&mut self) -> u64 {
        let id = self.next_region_id;
        self.next_region_id += 1;
        id
    }

    /// Claim a frame for a page that faulted with no frame yet
    /// (first touch, or post-swap-in), install the PTE, and run the
    /// page kind's content materialization.
    pub fn claim_page(&mut self, va: u64, alloc: &mut AllocatorHandle) -> Result<(), &'static str> {
        let key = spt::page_floor(va);
        let writable = {
            let page = self.spt.find(key).ok_or("claim_page: no SPT entry")?;
            page.writable && !page.is_cow
        };

        let frame_id = super::frame::claim_frame(alloc);
        super::frame::set_owner(frame_id, super::frame::PageKey { pid: self.pid, va: key });
        let kva = super::frame::kva_of(frame_id);

        let page = self.spt.find_mut(key).ok_or("claim_page: SPT entry vanished")?;
        page.frame = Some(frame_id);

        let result = if page.is_uninit() {
            super::uninit::swap_in(page, kva)
        } else {
            match &page.kind {
                super::page::PageKind::Anon(_) => super::anon::swap_in(page, kva),
                super::page::PageKind::File(_) => super::file_backend::swap_in(page, kva),
                _ => Err("claim_page: page in transitional state"),
            }
        };

        if result.is_err() {
            self.spt.find_mut(key).map(|p| p.frame = None);
            super::frame::release_frame_ref(frame_id, alloc);
            return result;
        }

        if !self.page_table.set_page(key, kva, writable) {
            return Err("claim_page: set_page rejected mapping");
        }
        Ok(())
    }

    /// Called by the frame table when this page's frame is chosen for
    /// eviction. Writes the page out (swap, or back to its file) and
    /// clears its PTE and frame pointer. Never touches FRAME_TABLE.
    ///
    /// `swap_out`/writeback runs *before* `clear_page` — `FILE`'s
    /// `swap_out` reads the PTE's dirty bit through `self.page_table`
    /// to decide whether to flush, and an already-unmapped PTE always
    /// reads back clean, silently dropping the write. Resource
    /// exhaustion (the swap device is full) is unrecoverable per
    /// spec.md §7 — the frame is about to be reclaimed and there is
    /// nowhere else for its only copy of the content to go, so this
    /// panics rather than discarding it.
    pub fn evict_page(&mut self, va: u64, kva: Kva) {
        if let Some(page) = self.spt.find_mut(va) {
            let outcome = match &mut page.kind {
                super::page::PageKind::Anon(_) => super::anon::swap_out(page, kva),
                super::page::PageKind::File(_) => {
                    super::file_backend::swap_out(page, kva, va, &mut self.page_table)
                }
                _ => Ok(()),
            };
            if let Err(e) = outcome {
                panic!("vm: swap_out failed for pid {:?} va {:#x}: {}", self.pid, va, e);
            }
            page.frame = None;
        }
        self.page_table.clear_page(va);
    }

    pub fn alloc_page_with_initializer(
        &mut self,
        va: u64,
        writable: bool,
        target: TargetKind,
        init: Option<InitClosure>,
    ) -> Result<(), &'static str> {
        spt::alloc_page_with_initializer(&mut self.spt, va, writable, target, init)
    }

    pub fn alloc_page(&mut self, va: u64, writable: bool, target: TargetKind) -> Result<(), &'static str> {
        spt::alloc_page(&mut self.spt, va, writable, target)
    }
}

const NONE_SLOT: Option<Arc<Mutex<AddressSpace>>> = None;
static PROCESSES: Mutex<[Option<Arc<Mutex<AddressSpace>>>; MAX_PROCESSES]> =
    Mutex::new([NONE_SLOT; MAX_PROCESSES]);

fn slot_of(pid: Pid) -> usize {
    pid.0 % MAX_PROCESSES
}

/// Register a freshly created address space under its PID. Panics on
/// a slot collision with a still-registered process — the caller is
/// expected to have reclaimed the PID's previous process first.
pub fn register(aspace: AddressSpace) {
    let pid = aspace.pid;
    let slot = slot_of(pid);
    let mut table = PROCESSES.lock();
    assert!(table[slot].is_none(), "vm: pid slot collision registering {:?}", pid);
    table[slot] = Some(Arc::new(Mutex::new(aspace)));
}

pub fn unregister(pid: Pid) {
    let slot = slot_of(pid);
    PROCESSES.lock()[slot] = None;
}

fn handle_of(pid: Pid) -> Option<Arc<Mutex<AddressSpace>>> {
    PROCESSES.lock()[slot_of(pid)].clone()
}

/// Look up `pid`'s address space and run `f` against it, holding only
/// that process's lock — never the registry lock and an AddressSpace
/// lock at once.
pub fn with_address_space<R>(pid: Pid, f: impl FnOnce(&mut AddressSpace) -> R) -> Option<R> {
    let handle = handle_of(pid)?;
    Some(f(&mut handle.lock()))
}

pub fn is_accessed(pid: Pid, va: u64) -> Option<bool> {
    with_address_space(pid, |a| a.page_table.is_accessed(va))
}

pub fn set_accessed(pid: Pid, va: u64, v: bool) {
    with_address_space(pid, |a| a.page_table.set_accessed(va, v));
}
