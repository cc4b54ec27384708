// kernel/src/vm/swap.rs
//
// Swap slot table. One VM page occupies SECTORS_PER_PAGE consecutive
// sectors on the swap device; a slot is identified by its page index
// (slot N -> sectors N*SECTORS_PER_PAGE .. +SECTORS_PER_PAGE).
//
// Slots carry a refcount rather than a plain bitmap: a COW page that
// gets swapped out while still shared by two processes must not be
// freed until both SPT entries drop their reference to it, the same
// way the frame table refcounts physical frames.

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use super::traits::{BlockDevice, Kva, PAGE_SIZE, SECTOR_SIZE, SECTORS_PER_PAGE};

pub const SWAP_SLOT_COUNT: usize = 256;

pub struct SwapTable {
    refcounts: Vec<u8>,
    disk: Option<Box<dyn BlockDevice>>,
}

impl SwapTable {
    pub const fn new() -> Self {
        Self {
            refcounts: Vec::new(),
            disk: None,
        }
    }

    fn init(&mut self, disk: Box<dyn BlockDevice>) {
        self.refcounts = alloc::vec![0u8; SWAP_SLOT_COUNT];
        self.disk = Some(disk);
    }

    fn alloc_slot(&mut self) -> Option<usize> {
        let idx = self.refcounts.iter().position(|&c| c == 0)?;
        self.refcounts[idx] = 1;
        Some(idx)
    }

    fn inc(&mut self, slot: usize) {
        self.refcounts[slot] += 1;
    }

    /// Drops one reference, returning true if the slot is now free.
    fn dec(&mut self, slot: usize) -> bool {
        self.refcounts[slot] -= 1;
        self.refcounts[slot] == 0
    }

    fn write_page(&mut self, slot: usize, kva: Kva) {
        let disk = self.disk.as_mut().expect("swap used before vm_init");
        let base = unsafe { core::slice::from_raw_parts(kva.as_ptr::<u8>(), PAGE_SIZE) };
        for i in 0..SECTORS_PER_PAGE {
            let mut buf = [0u8; SECTOR_SIZE];
            buf.copy_from_slice(&base[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            disk.write_sector((slot * SECTORS_PER_PAGE + i) as u64, &buf);
        }
    }

    fn read_page(&mut self, slot: usize, kva: Kva) {
        let disk = self.disk.as_mut().expect("swap used before vm_init");
        let dst = unsafe { core::slice::from_raw_parts_mut(kva.as_mut_ptr::<u8>(), PAGE_SIZE) };
        for i in 0..SECTORS_PER_PAGE {
            let mut buf = [0u8; SECTOR_SIZE];
            disk.read_sector((slot * SECTORS_PER_PAGE + i) as u64, &mut buf);
            dst[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
        }
    }
}

pub static SWAP_TABLE: Mutex<SwapTable> = Mutex::new(SwapTable::new());

pub fn init(disk: Box<dyn BlockDevice>) {
    SWAP_TABLE.lock().init(disk);
}

/// Write `kva`'s contents to a fresh swap slot and return its index.
pub fn write_out(kva: Kva) -> Result<usize, &'static str> {
    let mut st = SWAP_TABLE.lock();
    let slot = st.alloc_slot().ok_or("swap: device full")?;
    st.write_page(slot, kva);
    Ok(slot)
}

/// Read slot's contents into `kva` and drop this caller's reference.
/// Callers that want to keep the slot alive (shared COW frame still
/// swapped for a sibling) must call `inc_ref` first.
pub fn read_in(slot: usize, kva: Kva) {
    let mut st = SWAP_TABLE.lock();
    st.read_page(slot, kva);
}

pub fn inc_ref(slot: usize) {
    SWAP_TABLE.lock().inc(slot);
}

/// Drop one reference; frees the slot if it was the last one.
pub fn dec_ref(slot: usize) {
    SWAP_TABLE.lock().dec(slot);
}
