// kernel/src/vm/spt.rs
//
// Supplemental page table: per-process map from user virtual page to
// its Page metadata. A BTreeMap keeps this ordered by address — handy
// for range scans (find-every-page-in-this-mmap-region on munmap,
// stack-growth range checks) without a second index.

use alloc::collections::BTreeMap;

use super::anon;
use super::file_backend;
use super::page::{Page, PageKind, TargetKind};
use super::traits::{AddressSpaceOps, InitClosure, PageAllocator};

/// Upper bound of canonical user-space addresses this kernel hands
/// out (matches `fault::USER_SPACE_LIMIT` — kept here since `find` is
/// the operation spec.md charges with rejecting non-user addresses,
/// and `fault.rs` reuses this constant rather than a second copy).
pub const USER_SPACE_LIMIT: u64 = 0x0000_8000_0000_0000;

pub struct Spt {
    pages: BTreeMap<u64, Page>,
}

impl Spt {
    pub const fn new() -> Self {
        Self { pages: BTreeMap::new() }
    }

    /// Rounds `va` down to its page boundary; returns none for
    /// non-user addresses, per spec.md §4.1.
    pub fn find(&self, va: u64) -> Option<&Page> {
        if va >= USER_SPACE_LIMIT {
            return None;
        }
        self.pages.get(&page_floor(va))
    }

    pub fn find_mut(&mut self, va: u64) -> Option<&mut Page> {
        if va >= USER_SPACE_LIMIT {
            return None;
        }
        self.pages.get_mut(&page_floor(va))
    }

    pub fn contains(&self, va: u64) -> bool {
        self.pages.contains_key(&page_floor(va))
    }

    /// Insert a freshly allocated page. Fails if one is already
    /// mapped at this address (matches spec.md: insert never
    /// silently overwrites).
    pub fn insert(&mut self, page: Page) -> Result<(), &'static str> {
        let key = page_floor(page.va);
        if self.pages.contains_key(&key) {
            return Err("spt: page already mapped at this address");
        }
        self.pages.insert(key, page);
        Ok(())
    }

    /// Remove and fully tear down the page at `va`: write back /
    /// release its frame, drop its swap slot reference, and finally
    /// drop the SPT entry. The BTreeMap entry is removed *before* the
    /// page is torn down, mirroring the original `hash_delete`-before-
    /// `free` ordering in Pintos's spt_remove_page. `destroy` runs
    /// (and reads the PTE's dirty bit for any FILE writeback) *before*
    /// `clear_page` unmaps it — otherwise the dirty bit always reads
    /// back "not mapped" and writeback never happens.
    pub fn remove(&mut self, va: u64, aspace: &mut dyn AddressSpaceOps, alloc: &mut dyn PageAllocator) {
        let key = page_floor(va);
        if let Some(mut page) = self.pages.remove(&key) {
            destroy(&mut page, key, aspace, alloc);
        }
        aspace.clear_page(key);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Page)> {
        self.pages.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u64, &mut Page)> {
        self.pages.iter_mut()
    }

    pub fn range_mut(&mut self, start: u64, end: u64) -> impl Iterator<Item = (&u64, &mut Page)> {
        self.pages.range_mut(start..end)
    }

    /// Drop every page, used when a process exits.
    pub fn kill(&mut self, aspace: &mut dyn AddressSpaceOps, alloc: &mut dyn PageAllocator) {
        let keys: alloc::vec::Vec<u64> = self.pages.keys().copied().collect();
        for key in keys {
            if let Some(mut page) = self.pages.remove(&key) {
                destroy(&mut page, key, aspace, alloc);
            }
            aspace.clear_page(key);
        }
    }
}

#[inline]
pub fn page_floor(va: u64) -> u64 {
    va & !0xFFF
}

fn destroy(page: &mut Page, va: u64, aspace: &mut dyn AddressSpaceOps, alloc: &mut dyn PageAllocator) {
    match &page.kind {
        PageKind::Anon(_) => anon::destroy(page, alloc),
        PageKind::File(_) => file_backend::destroy(page, va, aspace, alloc),
        PageKind::Uninit(_) => { /* never claimed a frame, nothing to release */ }
        PageKind::Transitioning => unreachable!("page torn down mid-transition"),
    }
}

/// Allocate a page of `target` kind at `va`, still lazily — no frame
/// is claimed until the first fault. Mirrors
/// `vm_alloc_page_with_initializer` from spec.md.
pub fn alloc_page_with_initializer(
    spt: &mut Spt,
    va: u64,
    writable: bool,
    target: TargetKind,
    init: Option<InitClosure>,
) -> Result<(), &'static str> {
    let page = Page::new_uninit(page_floor(va), writable, target, init);
    spt.insert(page)
}

pub fn alloc_page(spt: &mut Spt, va: u64, writable: bool, target: TargetKind) -> Result<(), &'static str> {
    alloc_page_with_initializer(spt, va, writable, target, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::test_support::FakeAddressSpace;
    use crate::vm::test_support::FakePageAllocator;

    fn anon_page(va: u64) -> Page {
        Page::new_uninit(va, true, TargetKind::Anon { is_stack: false }, None)
    }

    #[test_case]
    fn find_rounds_down_to_page_boundary() {
        let mut spt = Spt::new();
        spt.insert(anon_page(0x4000)).unwrap();
        assert!(spt.find(0x4000 + 17).is_some());
        assert_eq!(spt.find(0x4000 + 17).unwrap().va, 0x4000);
        assert!(spt.find(0x5000).is_none());
    }

    #[test_case]
    fn insert_rejects_duplicate_va() {
        let mut spt = Spt::new();
        assert!(spt.insert(anon_page(0x1000)).is_ok());
        assert!(spt.insert(anon_page(0x1000)).is_err());
        // The first page is still there, untouched by the failed insert.
        assert!(spt.find(0x1000).is_some());
    }

    #[test_case]
    fn remove_drops_the_entry() {
        let mut spt = Spt::new();
        spt.insert(anon_page(0x2000)).unwrap();
        let mut pt = FakeAddressSpace::new();
        let mut alloc = FakePageAllocator::default();
        spt.remove(0x2000, &mut pt, &mut alloc);
        assert!(spt.find(0x2000).is_none());
        // Removing something absent is a harmless no-op.
        spt.remove(0x2000, &mut pt, &mut alloc);
    }

    #[test_case]
    fn kill_empties_every_page() {
        let mut spt = Spt::new();
        spt.insert(anon_page(0x1000)).unwrap();
        spt.insert(anon_page(0x2000)).unwrap();
        spt.insert(anon_page(0x3000)).unwrap();
        let mut pt = FakeAddressSpace::new();
        let mut alloc = FakePageAllocator::default();
        spt.kill(&mut pt, &mut alloc);
        assert!(spt.iter().next().is_none());
    }
}
