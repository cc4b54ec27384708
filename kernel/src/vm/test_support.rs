// kernel/src/vm/test_support.rs
//
// Software fakes for the hardware traits, used only under `#[cfg(test)]`
// so the VM logic can be exercised without a real page table or disk —
// same role as the teacher's `allocator::buddy_allocator` smoke tests
// running over a small synthetic heap rather than real RAM.

#![cfg(test)]

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::traits::{AddressSpaceOps, BlockDevice, FileBackend, Kva, PageAllocator, PAGE_SIZE, SECTOR_SIZE};

const PAGE_LAYOUT: Layout = match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
    Ok(l) => l,
    Err(_) => panic!("bad page layout"),
};

/// Hands out real heap pages so reads/writes through the returned `Kva`
/// are always valid; nothing is tracked beyond that because tests run
/// single-threaded and free exactly what they allocate.
#[derive(Default)]
pub struct FakePageAllocator;

impl PageAllocator for FakePageAllocator {
    fn alloc_user_page(&mut self) -> Option<Kva> {
        let ptr = unsafe { alloc_zeroed(PAGE_LAYOUT) };
        if ptr.is_null() {
            return None;
        }
        Some(Kva::new(ptr as u64))
    }

    fn free_user_page(&mut self, kva: Kva) {
        unsafe { dealloc(kva.as_u64() as *mut u8, PAGE_LAYOUT) };
    }
}

#[derive(Clone, Copy, Default)]
struct Pte {
    kva: u64,
    writable: bool,
    dirty: bool,
    accessed: bool,
}

/// A page table with no hardware underneath it: a map from page-aligned
/// `va` to the bits a real PTE would carry. Good enough to exercise
/// every VM invariant that doesn't depend on the MMU actually walking
/// anything.
#[derive(Default)]
pub struct FakeAddressSpace {
    ptes: BTreeMap<u64, Pte>,
}

impl FakeAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddressSpaceOps for FakeAddressSpace {
    fn set_page(&mut self, va: u64, kva: Kva, writable: bool) -> bool {
        let entry = self.ptes.entry(va).or_insert(Pte::default());
        entry.kva = kva.as_u64();
        entry.writable = writable;
        true
    }

    fn clear_page(&mut self, va: u64) {
        self.ptes.remove(&va);
    }

    fn is_dirty(&self, va: u64) -> bool {
        self.ptes.get(&va).map(|p| p.dirty).unwrap_or(false)
    }

    fn set_dirty(&mut self, va: u64, dirty: bool) {
        if let Some(p) = self.ptes.get_mut(&va) {
            p.dirty = dirty;
        }
    }

    fn is_accessed(&self, va: u64) -> bool {
        self.ptes.get(&va).map(|p| p.accessed).unwrap_or(false)
    }

    fn set_accessed(&mut self, va: u64, accessed: bool) {
        if let Some(p) = self.ptes.get_mut(&va) {
            p.accessed = accessed;
        }
    }
}

/// An in-memory file backing FILE pages in tests. `reopen()` hands out
/// a second handle sharing the same backing store — like dup()'ing an
/// fd to the same inode — so a write through one handle is visible to
/// another, matching what mmap's per-page `reopen()` calls need for
/// writeback-then-reread to observe persisted bytes.
pub struct FakeFile {
    data: Arc<Mutex<Vec<u8>>>,
    cursor: u64,
}

impl FakeFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: Arc::new(Mutex::new(data)), cursor: 0 }
    }

    pub fn boxed(data: Vec<u8>) -> Box<dyn FileBackend> {
        Box::new(Self::new(data))
    }
}

impl FileBackend for FakeFile {
    fn reopen(&self) -> Box<dyn FileBackend> {
        Box::new(FakeFile { data: self.data.clone(), cursor: 0 })
    }

    fn length(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn seek(&mut self, offset: u64) {
        self.cursor = offset;
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, &'static str> {
        let data = self.data.lock();
        let start = self.cursor as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len(), data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.cursor += n as u64;
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize, &'static str> {
        let mut data = self.data.lock();
        let end = offset as usize + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

/// An in-memory disk backing the swap table in tests.
pub struct FakeDisk {
    sectors: Vec<[u8; SECTOR_SIZE]>,
}

impl FakeDisk {
    pub fn new(sector_count: usize) -> Self {
        Self { sectors: alloc::vec![[0u8; SECTOR_SIZE]; sector_count] }
    }
}

impl BlockDevice for FakeDisk {
    fn sector_count(&self) -> u64 {
        self.sectors.len() as u64
    }

    fn read_sector(&mut self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) {
        buf.copy_from_slice(&self.sectors[sector as usize]);
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8; SECTOR_SIZE]) {
        self.sectors[sector as usize].copy_from_slice(buf);
    }
}
