// kernel/src/vm/anon.rs
//
// ANON page operations: zero-fill on first touch, swap out/in on
// eviction, frame-refcount-aware destroy.

use super::frame;
use super::page::{AnonState, Page, PageKind};
use super::swap;
use super::traits::{Kva, PageAllocator, PAGE_SIZE};

pub fn initializer(page: &mut Page, is_stack: bool) {
    page.kind = PageKind::Anon(AnonState {
        swap_index: -1,
        is_stack,
    });
}

fn state(page: &mut Page) -> &mut AnonState {
    match &mut page.kind {
        PageKind::Anon(s) => s,
        _ => unreachable!("anon op on non-anon page"),
    }
}

/// Materialize the page's content into `kva`: either zero-fill (first
/// touch) or read back from its swap slot.
pub fn swap_in(page: &mut Page, kva: Kva) -> Result<(), &'static str> {
    let st = state(page);
    if st.swap_index >= 0 {
        let slot = st.swap_index as usize;
        swap::read_in(slot, kva);
        swap::dec_ref(slot);
        st.swap_index = -1;
    } else {
        unsafe { core::ptr::write_bytes(kva.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
    }
    Ok(())
}

/// Write the frame's content to a swap slot and remember it.
pub fn swap_out(page: &mut Page, kva: Kva) -> Result<(), &'static str> {
    let slot = swap::write_out(kva)?;
    state(page).swap_index = slot as i64;
    Ok(())
}

/// Drop this page's claim on its frame (and swap slot, if any).
pub fn destroy(page: &mut Page, alloc: &mut dyn PageAllocator) {
    let swap_index = state(page).swap_index;
    if swap_index >= 0 {
        swap::dec_ref(swap_index as usize);
    }
    if let Some(id) = page.frame.take() {
        frame::release_frame_ref(id, alloc);
    }
}

pub fn is_stack(page: &Page) -> bool {
    match &page.kind {
        PageKind::Anon(s) => s.is_stack,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::swap;
    use crate::vm::test_support::{FakeDisk, FakePageAllocator};

    fn fresh_page() -> Page {
        Page {
            va: 0x4000,
            writable: true,
            frame: None,
            kind: PageKind::Anon(AnonState { swap_index: -1, is_stack: false }),
            is_cow: false,
        }
    }

    #[test_case]
    fn swap_in_zero_fills_a_never_swapped_page() {
        let mut alloc = FakePageAllocator::default();
        let kva = alloc.alloc_user_page().unwrap();
        unsafe { core::ptr::write_bytes(kva.as_mut_ptr::<u8>(), 0xAA, PAGE_SIZE) };

        let mut page = fresh_page();
        swap_in(&mut page, kva).unwrap();

        let bytes = unsafe { core::slice::from_raw_parts(kva.as_ptr::<u8>(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        alloc.free_user_page(kva);
    }

    #[test_case]
    fn swap_out_then_swap_in_round_trips_content_byte_for_byte() {
        swap::init(alloc::boxed::Box::new(FakeDisk::new(swap::SWAP_SLOT_COUNT * crate::vm::traits::SECTORS_PER_PAGE)));

        let mut alloc = FakePageAllocator::default();
        let kva = alloc.alloc_user_page().unwrap();
        let pattern: alloc::vec::Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        unsafe { core::ptr::copy_nonoverlapping(pattern.as_ptr(), kva.as_mut_ptr::<u8>(), PAGE_SIZE) };

        let mut page = fresh_page();
        swap_out(&mut page, kva).unwrap();
        match &page.kind {
            PageKind::Anon(s) => assert!(s.swap_index >= 0),
            _ => unreachable!(),
        }

        // Clobber the frame so swap_in can't be trivially "passing" by accident.
        unsafe { core::ptr::write_bytes(kva.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };

        swap_in(&mut page, kva).unwrap();
        let restored = unsafe { core::slice::from_raw_parts(kva.as_ptr::<u8>(), PAGE_SIZE) };
        assert_eq!(restored, pattern.as_slice());
        match &page.kind {
            PageKind::Anon(s) => assert_eq!(s.swap_index, -1),
            _ => unreachable!(),
        }

        alloc.free_user_page(kva);
    }
}
