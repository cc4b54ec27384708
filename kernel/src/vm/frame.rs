// kernel/src/vm/frame.rs
//
// Frame table + clock-hand eviction. Frames don't hold a pointer back
// to their owning Page (that would mean a raw pointer into another
// process's heap-allocated Spt, fighting the borrow checker for no
// reason) — instead each occupied frame stores a `PageKey{pid,va}`,
// a handle the owner lookup in address_space.rs turns back into a
// live `&mut Page` only for the duration of one call.

use alloc::vec::Vec;
use spin::Mutex;

use crate::process::Pid;
use crate::serial_println_raw;

use super::address_space;
use super::traits::{Kva, PageAllocator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(pub usize);

#[derive(Clone, Copy)]
pub struct PageKey {
    pub pid: Pid,
    pub va: u64,
}

pub struct Frame {
    pub kva: Kva,
    pub page: Option<PageKey>,
    pub refcount: Mutex<u32>,
}

pub struct FrameTable {
    slots: Vec<Option<Frame>>,
    free_slots: Vec<usize>,
    clock_hand: usize,
}

impl FrameTable {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            clock_hand: 0,
        }
    }

    fn insert(&mut self, frame: Frame) -> FrameId {
        if let Some(idx) = self.free_slots.pop() {
            self.slots[idx] = Some(frame);
            FrameId(idx)
        } else {
            self.slots.push(Some(frame));
            FrameId(self.slots.len() - 1)
        }
    }

    pub fn frame(&self, id: FrameId) -> &Frame {
        self.slots[id.0].as_ref().expect("dangling FrameId")
    }

    pub fn frame_mut(&mut self, id: FrameId) -> &mut Frame {
        self.slots[id.0].as_mut().expect("dangling FrameId")
    }

    fn occupied_ids(&self) -> impl Iterator<Item = FrameId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| FrameId(i)))
    }
}

pub static FRAME_TABLE: Mutex<FrameTable> = Mutex::new(FrameTable::new());

/// Allocate a frame, evicting a victim if physical memory is exhausted.
/// Panics if eviction can't free anything — the system has no way to
/// preserve its invariants past that point.
pub fn claim_frame(alloc: &mut dyn PageAllocator) -> FrameId {
    if let Some(kva) = alloc.alloc_user_page() {
        let mut ft = FRAME_TABLE.lock();
        return ft.insert(Frame {
            kva,
            page: None,
            refcount: Mutex::new(1),
        });
    }

    evict_one(alloc);

    if let Some(kva) = alloc.alloc_user_page() {
        let mut ft = FRAME_TABLE.lock();
        return ft.insert(Frame {
            kva,
            page: None,
            refcount: Mutex::new(1),
        });
    }

    panic!("vm: out of physical frames even after eviction");
}

/// Second-chance: walk the table from the clock hand, clearing the
/// accessed bit of anything it's seen, and evicting the first frame
/// whose accessed bit is already clear and which isn't pinned (shared
/// by more than one page).
///
/// The lock order here is AddressSpace before FrameTable — the fault
/// path locks an AddressSpace and then may call claim_frame, which
/// locks FrameTable, so eviction must never hold FrameTable while
/// acquiring an AddressSpace or it's an inversion. We take a snapshot
/// of candidate (index, owner) pairs under the FrameTable lock,
/// release it, consult the owning address spaces one at a time, then
/// briefly re-lock FrameTable to confirm and claim the winner (its
/// owner may have changed underneath us; refcount != 1 means it no
/// longer qualifies and we move on).
///
/// The refcount-based pinning skip is a deviation from the literal
/// clock algorithm in spec.md §4.2 (which never pins a frame out of
/// consideration) — needed so a COW-shared frame isn't evicted out
/// from under one of its owners while another still needs it resident.
/// If every resident frame is currently pinned (e.g. right after a
/// fork that shared everything), there is no legal victim at all;
/// per spec.md §7 this is resource exhaustion, so it panics instead of
/// spinning forever.
fn pick_victim() -> FrameId {
    loop {
        let snapshot: Vec<(usize, PageKey)> = {
            let ft = FRAME_TABLE.lock();
            ft.occupied_ids()
                .filter_map(|id| ft.frame(id).page.map(|key| (id.0, key)))
                .collect()
        };
        if snapshot.is_empty() {
            panic!("vm: no frames to evict");
        }

        let is_unpinned = |idx: usize, key: PageKey| {
            let ft = FRAME_TABLE.lock();
            match ft.slots[idx].as_ref() {
                Some(frame) if frame.page.map(|k| k.va) == Some(key.va) => {
                    *frame.refcount.lock() == 1
                }
                _ => false,
            }
        };

        if !snapshot.iter().any(|&(idx, key)| is_unpinned(idx, key)) {
            panic!("vm: no evictable frame — every resident frame is pinned (shared)");
        }

        let start = FRAME_TABLE.lock().clock_hand;
        for offset in 0..snapshot.len() {
            let (idx, key) = snapshot[(start + offset) % snapshot.len()];

            if !is_unpinned(idx, key) {
                continue;
            }

            let accessed = address_space::is_accessed(key.pid, key.va).unwrap_or(false);
            if accessed {
                address_space::set_accessed(key.pid, key.va, false);
                continue;
            }

            let mut ft = FRAME_TABLE.lock();
            ft.clock_hand = (idx + 1) % ft.slots.len().max(1);
            serial_println_raw!("vm: evicting frame {} (pid {:?} va {:#x})", idx, key.pid, key.va);
            return FrameId(idx);
        }

        // Everyone was pinned or got a second chance this round — the
        // accessed bits we just cleared mean the next pass will find one.
    }
}

fn evict_one(alloc: &mut dyn PageAllocator) {
    let victim = pick_victim();
    evict_frame(victim, alloc);
}

/// Swap a single frame out to disk (or drop it, for FILE pages) and
/// return its slot to the free list. Must never be called while
/// FRAME_TABLE is locked by the caller — swap_out does disk I/O.
pub fn evict_frame(id: FrameId, alloc: &mut dyn PageAllocator) {
    let (key, kva) = {
        let ft = FRAME_TABLE.lock();
        let frame = ft.frame(id);
        (frame.page, frame.kva)
    };

    let Some(key) = key else { return };

    address_space::with_address_space(key.pid, |aspace| {
        aspace.evict_page(key.va, kva);
    });

    let mut ft = FRAME_TABLE.lock();
    ft.slots[id.0] = None;
    ft.free_slots.push(id.0);
    drop(ft);
    alloc.free_user_page(kva);
}

/// Release one reference to a frame. Frees it back to the allocator
/// when the last owner drops it (destroy() of the last sharing page).
pub fn release_frame_ref(id: FrameId, alloc: &mut dyn PageAllocator) {
    let kva = {
        let ft = FRAME_TABLE.lock();
        let frame = ft.frame(id);
        let mut rc = frame.refcount.lock();
        *rc -= 1;
        if *rc > 0 {
            return;
        }
        frame.kva
    };

    let mut ft = FRAME_TABLE.lock();
    ft.slots[id.0] = None;
    ft.free_slots.push(id.0);
    drop(ft);
    alloc.free_user_page(kva);
}

pub fn set_owner(id: FrameId, key: PageKey) {
    FRAME_TABLE.lock().frame_mut(id).page = Some(key);
}

pub fn bump_refcount(id: FrameId) {
    let ft = FRAME_TABLE.lock();
    *ft.frame(id).refcount.lock() += 1;
}

pub fn refcount(id: FrameId) -> u32 {
    let ft = FRAME_TABLE.lock();
    *ft.frame(id).refcount.lock()
}

pub fn kva_of(id: FrameId) -> Kva {
    FRAME_TABLE.lock().frame(id).kva
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::address_space::{self, AddressSpace, PageTableHandle};
    use crate::vm::test_support::FakePageAllocator;

    fn fresh_pid(tag: usize) -> Pid {
        Pid(0xA000 + tag)
    }

    /// Property 9: sweeping the clock hand over N frames that were
    /// never touched again after being mapped evicts each one exactly
    /// once before any of them repeats.
    #[test_case]
    fn clock_eviction_visits_every_frame_once_before_repeating() {
        let pid = fresh_pid(1);
        address_space::register(AddressSpace::new(pid, PageTableHandle::new()));

        let mut alloc = FakePageAllocator::default();
        let vas = [0x1000u64, 0x2000, 0x3000, 0x4000];

        for &va in vas.iter() {
            let id = claim_frame(&mut alloc);
            set_owner(id, PageKey { pid, va });
            let kva = kva_of(id);
            address_space::with_address_space(pid, |a| {
                a.page_table.set_page(va, kva, true);
            });
        }

        let mut evicted: Vec<u64> = Vec::new();
        for _ in 0..vas.len() {
            let victim = pick_victim();
            let va = FRAME_TABLE.lock().frame(victim).page.unwrap().va;
            evict_frame(victim, &mut alloc);
            evicted.push(va);
        }

        let mut got = evicted.clone();
        got.sort_unstable();
        let mut want = vas.to_vec();
        want.sort_unstable();
        assert_eq!(got, want, "every frame evicted exactly once, none repeated");

        address_space::unregister(pid);
    }
}
