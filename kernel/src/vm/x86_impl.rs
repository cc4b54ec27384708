// kernel/src/vm/x86_impl.rs
//
// Production implementations of the VM traits, built the same way
// the teacher's `memory::page_table_manager::OwnedPageTable` is: a
// page table is addressed by its PML4 `PhysFrame` and walked through
// the physical-memory-offset direct mapping, never through CR3. That
// means a page table can be inspected and modified without switching
// to it — exactly what the frame table's eviction scan needs when the
// victim belongs to a process other than the one currently running.

use x86_64::{
    VirtAddr,
    structures::paging::{
        mapper::{MapToError, TranslateResult, UnmapError},
        FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame,
        Size4KiB, Translate,
    },
};

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::memory::page_table_manager::BuddyFrameAllocator;

use super::traits::{AddressSpaceOps, BlockDevice, FileBackend, Kva, PageAllocator, SECTOR_SIZE};

fn mapper_for(root: PhysFrame) -> OffsetPageTable<'static> {
    let phys_offset = crate::memory::physical_memory_offset();
    let pml4_virt = phys_offset + root.start_address().as_u64();
    let pml4: &mut PageTable = unsafe { &mut *pml4_virt.as_mut_ptr::<PageTable>() };
    unsafe { OffsetPageTable::new(pml4, phys_offset) }
}

/// One process's page table, addressed by its PML4 frame.
pub struct X86AddressSpace {
    root: PhysFrame,
}

impl X86AddressSpace {
    pub fn new(root: PhysFrame) -> Self {
        Self { root }
    }

    pub fn root_frame(&self) -> PhysFrame {
        self.root
    }
}

impl AddressSpaceOps for X86AddressSpace {
    fn set_page(&mut self, va: u64, kva: Kva, writable: bool) -> bool {
        let mut mapper = mapper_for(self.root);
        let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(va));
        let phys_offset = crate::memory::physical_memory_offset();
        let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(kva.as_u64() - phys_offset.as_u64()));

        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }

        let mut alloc = BuddyFrameAllocator;
        match unsafe { mapper.map_to(page, frame, flags, &mut alloc) } {
            Ok(flush) => {
                flush.flush();
                true
            }
            Err(MapToError::PageAlreadyMapped(_)) => {
                match unsafe { mapper.update_flags(page, flags) } {
                    Ok(flush) => {
                        flush.flush();
                        true
                    }
                    Err(_) => false,
                }
            }
            Err(_) => false,
        }
    }

    fn clear_page(&mut self, va: u64) {
        let mut mapper = mapper_for(self.root);
        let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(va));
        match mapper.unmap(page) {
            Ok((_, flush)) => flush.flush(),
            Err(UnmapError::PageNotMapped) => {}
            Err(_) => {}
        }
    }

    fn is_dirty(&self, va: u64) -> bool {
        flags_of(self.root, va)
            .map(|f| f.contains(PageTableFlags::DIRTY))
            .unwrap_or(false)
    }

    fn set_dirty(&mut self, va: u64, dirty: bool) {
        set_flag(self.root, va, PageTableFlags::DIRTY, dirty);
    }

    fn is_accessed(&self, va: u64) -> bool {
        flags_of(self.root, va)
            .map(|f| f.contains(PageTableFlags::ACCESSED))
            .unwrap_or(false)
    }

    fn set_accessed(&mut self, va: u64, accessed: bool) {
        set_flag(self.root, va, PageTableFlags::ACCESSED, accessed);
    }
}

fn flags_of(root: PhysFrame, va: u64) -> Option<PageTableFlags> {
    let mapper = mapper_for(root);
    match mapper.translate(VirtAddr::new(va)) {
        TranslateResult::Mapped { flags, .. } => Some(flags),
        _ => None,
    }
}

fn set_flag(root: PhysFrame, va: u64, bit: PageTableFlags, value: bool) {
    let mut mapper = mapper_for(root);
    let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(va));
    let Some(mut flags) = flags_of(root, va) else { return };
    if value {
        flags |= bit;
    } else {
        flags -= bit;
    }
    if let Ok(flush) = unsafe { mapper.update_flags(page, flags) } {
        flush.flush();
    }
}

/// Wraps the teacher's buddy allocator, returning frames already
/// mapped at their kernel virtual address via the physical memory
/// offset — callers read/write content without a second translation.
#[derive(Default)]
pub struct KernelPageAllocator;

impl PageAllocator for KernelPageAllocator {
    fn alloc_user_page(&mut self) -> Option<Kva> {
        let mut alloc = BuddyFrameAllocator;
        let frame = alloc.allocate_frame()?;
        let phys_offset = crate::memory::physical_memory_offset();
        Some(phys_offset + frame.start_address().as_u64())
    }

    fn free_user_page(&mut self, kva: Kva) {
        let phys_offset = crate::memory::physical_memory_offset();
        let phys = x86_64::PhysAddr::new(kva.as_u64() - phys_offset.as_u64());
        unsafe {
            crate::allocator::buddy_allocator::BUDDY
                .lock()
                .deallocate(phys, 12);
        }
    }
}

/// Heap-backed swap device. There's no real disk driver in this kernel,
/// so swapped-out pages live in a `Vec` of sectors instead — enough to
/// exercise the swap path (eviction, write-back, swap-in) without a
/// block layer underneath it.
pub struct RamDisk {
    sectors: Vec<[u8; SECTOR_SIZE]>,
}

impl RamDisk {
    pub fn new(sector_count: usize) -> Self {
        Self { sectors: alloc::vec![[0u8; SECTOR_SIZE]; sector_count] }
    }
}

impl BlockDevice for RamDisk {
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

/// Heap-backed file, standing in for the real file system the same
/// way `RamDisk` stands in for a real block device — this kernel has
/// no on-disk file system yet, so `mmap`'s backing file is a named,
/// growable byte buffer kept alive for the process's lifetime.
/// `reopen()` hands out a fresh cursor over the same buffer, matching
/// what mmap needs for each page's independent offset.
pub struct RamFile {
    name: String,
    data: Arc<Mutex<Vec<u8>>>,
    cursor: u64,
}

static RAM_FILES: Mutex<Vec<(String, Arc<Mutex<Vec<u8>>>)>> = Mutex::new(Vec::new());

impl RamFile {
    /// Open `name`, creating it empty on first use — there is no
    /// `sys_open`/`sys_creat` surface yet (file system is out of scope
    /// per spec.md §1), so `sys_mmap` resolves its backing file by name
    /// directly through this registry instead of through an fd table.
    pub fn open(name: &str) -> Box<dyn FileBackend> {
        let mut files = RAM_FILES.lock();
        let data = match files.iter().find(|(n, _)| n == name) {
            Some((_, data)) => data.clone(),
            None => {
                let data = Arc::new(Mutex::new(Vec::new()));
                files.push((String::from(name), data.clone()));
                data
            }
        };
        Box::new(RamFile { name: String::from(name), data, cursor: 0 })
    }
}

impl FileBackend for RamFile {
    fn reopen(&self) -> Box<dyn FileBackend> {
        Box::new(RamFile { name: self.name.clone(), data: self.data.clone(), cursor: 0 })
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
