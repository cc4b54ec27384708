// kernel/src/vm/file_backend.rs
//
// FILE page operations: load from (file, offset, read_bytes,
// zero_bytes), write back when dirty on swap-out or munmap, never
// touches the swap device — the backing file already is the backing
// store.

use super::frame;
use super::page::{FileState, Page, PageKind};
use super::traits::{AddressSpaceOps, Kva, PageAllocator, PAGE_SIZE};

fn state(page: &mut Page) -> &mut FileState {
    match &mut page.kind {
        PageKind::File(s) => s,
        _ => unreachable!("file op on non-file page"),
    }
}

/// Read `read_bytes` from the file at `offset` into `kva`, zero-fill
/// the remainder of the page.
pub fn swap_in(page: &mut Page, kva: Kva) -> Result<(), &'static str> {
    let st = state(page);
    unsafe { core::ptr::write_bytes(kva.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
    if st.read_bytes > 0 {
        st.file.seek(st.offset);
        let dst = unsafe {
            core::slice::from_raw_parts_mut(kva.as_mut_ptr::<u8>(), st.read_bytes as usize)
        };
        let n = st.file.read(dst)?;
        if n != st.read_bytes as usize {
            return Err("file_backend: short read");
        }
    }
    Ok(())
}

/// Write the page back if the PTE's dirty bit is set, then drop the
/// mapping. Does not free the frame — the caller (evict/destroy)
/// decides that, since a clean FILE page can just be dropped.
pub fn swap_out(page: &mut Page, kva: Kva, va: u64, aspace: &mut dyn AddressSpaceOps) -> Result<(), &'static str> {
    if aspace.is_dirty(va) {
        let st = state(page);
        let len = st.read_bytes as usize;
        if len > 0 {
            let src = unsafe { core::slice::from_raw_parts(kva.as_ptr::<u8>(), len) };
            st.file.write_at(src, st.offset)?;
        }
    }
    Ok(())
}

/// Write back if dirty, then release the frame.
pub fn destroy(page: &mut Page, va: u64, aspace: &mut dyn AddressSpaceOps, alloc: &mut dyn PageAllocator) {
    if let Some(id) = page.frame {
        let kva = frame::kva_of(id);
        let _ = swap_out(page, kva, va, aspace);
    }
    if let Some(id) = page.frame.take() {
        frame::release_frame_ref(id, alloc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::test_support::{FakeAddressSpace, FakeFile, FakePageAllocator};

    fn file_page(va: u64, read_bytes: u32, zero_bytes: u32, data: alloc::vec::Vec<u8>) -> Page {
        Page {
            va,
            writable: true,
            frame: None,
            kind: PageKind::File(FileState {
                file: FakeFile::boxed(data),
                offset: 0,
                read_bytes,
                zero_bytes,
                region: None,
            }),
            is_cow: false,
        }
    }

    #[test_case]
    fn swap_in_reads_content_then_zero_pads_the_rest() {
        let content: alloc::vec::Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        let mut page = file_page(0x10000, 3000, PAGE_SIZE as u32 - 3000, content.clone());

        let mut alloc = FakePageAllocator::default();
        let kva = alloc.alloc_user_page().unwrap();
        swap_in(&mut page, kva).unwrap();

        let bytes = unsafe { core::slice::from_raw_parts(kva.as_ptr::<u8>(), PAGE_SIZE) };
        assert_eq!(&bytes[..3000], content.as_slice());
        assert!(bytes[3000..].iter().all(|&b| b == 0));
        alloc.free_user_page(kva);
    }

    #[test_case]
    fn swap_in_all_zero_page_when_read_bytes_is_zero() {
        let mut page = file_page(0x20000, 0, PAGE_SIZE as u32, alloc::vec::Vec::new());
        let mut alloc = FakePageAllocator::default();
        let kva = alloc.alloc_user_page().unwrap();
        unsafe { core::ptr::write_bytes(kva.as_mut_ptr::<u8>(), 0xFF, PAGE_SIZE) };

        swap_in(&mut page, kva).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(kva.as_ptr::<u8>(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        alloc.free_user_page(kva);
    }

    fn read_back(page: &mut Page) -> [u8; 100] {
        let mut buf = [0u8; 100];
        match &mut page.kind {
            PageKind::File(s) => {
                s.file.seek(0);
                s.file.read(&mut buf).unwrap();
            }
            _ => unreachable!(),
        }
        buf
    }

    #[test_case]
    fn swap_out_only_writes_back_when_dirty() {
        let content = alloc::vec![0u8; 100];
        let mut page = file_page(0x30000, 100, PAGE_SIZE as u32 - 100, content);

        let mut alloc = FakePageAllocator::default();
        let kva = alloc.alloc_user_page().unwrap();
        let pattern: alloc::vec::Vec<u8> = (0..100u32).map(|i| i as u8 + 1).collect();
        unsafe { core::ptr::copy_nonoverlapping(pattern.as_ptr(), kva.as_mut_ptr::<u8>(), 100) };

        let mut clean_aspace = FakeAddressSpace::new();
        swap_out(&mut page, kva, 0x30000, &mut clean_aspace).unwrap();
        assert_eq!(read_back(&mut page), [0u8; 100], "clean page must not be written back");

        let mut dirty_aspace = FakeAddressSpace::new();
        dirty_aspace.set_page(0x30000, kva, true);
        dirty_aspace.set_dirty(0x30000, true);
        swap_out(&mut page, kva, 0x30000, &mut dirty_aspace).unwrap();
        assert_eq!(&read_back(&mut page)[..], pattern.as_slice(), "dirty page must be flushed");

        alloc.free_user_page(kva);
    }
}
