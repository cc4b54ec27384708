// kernel/src/vm/mmap.rs
//
// mmap/munmap: a region is a run of lazily-allocated FILE pages, each
// remembering which region it belongs to so munmap can find and tear
// down exactly that range, writing back whatever got dirtied.

use alloc::boxed::Box;

use crate::process::Pid;

use super::address_space::{self, MmapRegion, MAX_MMAP_REGIONS_PER_PROCESS};
use super::page::TargetKind;
use super::traits::{FileBackend, PAGE_SIZE};

/// Map `length` bytes of `file` starting at `offset` into `pid`'s
/// address space at `addr`. `addr` and `length` must already be page
/// aligned — the syscall layer is responsible for that, same
/// division of labor as spec.md's do_mmap.
pub fn do_mmap(
    pid: Pid,
    addr: u64,
    length: u64,
    writable: bool,
    file: Box<dyn FileBackend>,
    offset: u64,
) -> Result<u64, &'static str> {
    if addr == 0 || addr % PAGE_SIZE as u64 != 0 || length == 0 || offset % PAGE_SIZE as u64 != 0 {
        return Err("mmap: invalid address, length, or offset");
    }

    let file_length = file.length();
    if file_length == 0 || offset >= file_length {
        return Err("mmap: file is empty or offset is past its end");
    }

    let page_count = length.div_ceil(PAGE_SIZE as u64) as usize;
    // Bytes actually backed by the file, spanning the whole mapping —
    // everything past this within `length` is zero-fill, even on pages
    // that still have file-backed bytes ahead of them within `length`.
    let total_read_bytes = core::cmp::min(length, file_length - offset);

    address_space::with_address_space(pid, |aspace| {
        if aspace.mmap_regions.len() >= MAX_MMAP_REGIONS_PER_PROCESS {
            return Err("mmap: too many regions for this process");
        }
        for i in 0..page_count {
            if aspace.spt.contains(addr + i as u64 * PAGE_SIZE as u64) {
                return Err("mmap: range overlaps an existing mapping");
            }
        }

        let region_id = aspace.alloc_region_id();
        let mut mapped = 0usize;
        let mut read_remaining = total_read_bytes;
        for i in 0..page_count {
            let va = addr + i as u64 * PAGE_SIZE as u64;
            let page_offset = offset + i as u64 * PAGE_SIZE as u64;
            let read_bytes = core::cmp::min(read_remaining, PAGE_SIZE as u64) as u32;
            let zero_bytes = PAGE_SIZE as u32 - read_bytes;
            read_remaining -= read_bytes as u64;

            let target = TargetKind::File {
                file: file.reopen(),
                offset: page_offset,
                read_bytes,
                zero_bytes,
                region: Some(region_id),
            };

            if aspace.alloc_page(va, writable, target).is_err() {
                break;
            }
            mapped += 1;
        }

        if mapped != page_count {
            for i in 0..mapped {
                let va = addr + i as u64 * PAGE_SIZE as u64;
                let mut alloc = address_space::AllocatorHandle::default();
                aspace.spt.remove(va, &mut aspace.page_table, &mut alloc);
            }
            return Err("mmap: failed to lay out every page");
        }

        aspace.mmap_regions.push(MmapRegion { id: region_id, start: addr, length });
        Ok(addr)
    })
    .ok_or("mmap: address space not found")?
}

/// Unmap the region starting at `addr`, writing back any page the
/// hardware marked dirty.
pub fn do_munmap(pid: Pid, addr: u64) -> Result<(), &'static str> {
    address_space::with_address_space(pid, |aspace| {
        let region_idx = aspace
            .mmap_regions
            .iter()
            .position(|r| r.start == addr)
            .ok_or("munmap: no region at this address")?;
        let region = aspace.mmap_regions.remove(region_idx);

        let end = region.start + region.length;
        let pages: alloc::vec::Vec<u64> = aspace
            .spt
            .range_mut(region.start, end)
            .map(|(va, _)| *va)
            .collect();

        let mut alloc = address_space::AllocatorHandle::default();
        for va in pages {
            aspace.spt.remove(va, &mut aspace.page_table, &mut alloc);
        }
        Ok(())
    })
    .ok_or("munmap: address space not found")?
}
