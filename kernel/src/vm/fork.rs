// kernel/src/vm/fork.rs
//
// Address-space fork with copy-on-write: the child's SPT is built
// page by page from the parent's. A page that already owns a frame
// is shared (frame refcount bumped, both PTEs flipped read-only,
// `is_cow` set); anything not yet materialized is re-derived from its
// own recipe (target kind + file handle) so the child can fault it in
// independently later.

use crate::process::Pid;

use super::address_space;
use super::page::{AnonState, FileState, Page, PageKind, TargetKind, UninitState};
use super::traits::{AddressSpaceOps, PageAllocator, PAGE_SIZE};
use super::{frame, swap};

/// Copy `parent_pid`'s address space into `child_pid`, which must
/// already be registered with an empty SPT.
pub fn spt_copy(parent_pid: Pid, child_pid: Pid) -> Result<(), &'static str> {
    let cloned = address_space::with_address_space(parent_pid, |parent| {
        let mut alloc = address_space::AllocatorHandle::default();
        let mut out = alloc::vec::Vec::new();
        for (_, page) in parent.spt.iter_mut() {
            out.push(clone_for_fork(child_pid, page, &mut parent.page_table, &mut alloc));
        }
        out
    })
    .ok_or("fork: parent address space not found")?;

    address_space::with_address_space(child_pid, |child| {
        for page in cloned {
            if let Err(e) = child.spt.insert(page) {
                crate::serial_println!("vm: fork insert failed: {}", e);
            }
        }
    })
    .ok_or("fork: child address space not found")?;

    Ok(())
}

/// Everything we need to read out of the parent's page before we can
/// decide whether to touch its frame — kept as owned data so the
/// borrow of `page.kind` ends before `share_frame` needs `&mut page`.
enum Recipe {
    Uninit(UninitState),
    Anon { swap_index: i64, is_stack: bool },
    File(FileState),
}

/// Clone one parent page into the child's SPT. Stack pages are never
/// COW-shared (spec.md §3 "Marker flag STACK distinguishes stack
/// pages (never COW-shared on fork)", §4.6 "ANON, stack: eagerly
/// allocate and copy"), so they're peeled off into their own eager
/// path before the COW-sharing logic below ever sees them.
fn clone_for_fork(
    child_pid: Pid,
    page: &mut Page,
    parent_pt: &mut dyn AddressSpaceOps,
    alloc: &mut dyn PageAllocator,
) -> Page {
    if let PageKind::Anon(a) = &page.kind {
        if a.is_stack {
            return clone_stack_eagerly(child_pid, page, alloc);
        }
    }

    let frame_id = page.frame;
    let recipe = match &mut page.kind {
        PageKind::Uninit(u) => Recipe::Uninit(clone_uninit(u)),
        PageKind::Anon(a) => Recipe::Anon { swap_index: a.swap_index, is_stack: a.is_stack },
        PageKind::File(f) => Recipe::File(clone_file_state(f)),
        PageKind::Transitioning => unreachable!("fork observed a page mid-transition"),
    };

    let shared = frame_id.map(|id| {
        share_frame(page, id, parent_pt);
        id
    });

    let kind = match recipe {
        Recipe::Uninit(u) => PageKind::Uninit(u),
        Recipe::Anon { swap_index, is_stack } => {
            if shared.is_none() && swap_index >= 0 {
                swap::inc_ref(swap_index as usize);
            }
            let child_swap_index = if shared.is_some() { -1 } else { swap_index };
            PageKind::Anon(AnonState { swap_index: child_swap_index, is_stack })
        }
        Recipe::File(f) => PageKind::File(f),
    };

    Page {
        va: page.va,
        writable: page.writable,
        frame: shared,
        is_cow: shared.is_some(),
        kind,
    }
}

/// Eagerly materialize the child's own copy of a stack page, whether
/// the parent's copy is currently resident, swapped out, or never
/// touched. A resident page is memcpy'd frame-to-frame; a swapped-out
/// one is read back from its slot into the child's own fresh frame
/// (via `swap::read_in`, which doesn't touch the slot's refcount, so
/// the parent's own swapped copy is left exactly as it was); a page
/// that was never faulted has nothing to copy and is left unmaterialized,
/// matching what a freshly allocated stack page looks like before its
/// first touch.
fn clone_stack_eagerly(child_pid: Pid, page: &mut Page, alloc: &mut dyn PageAllocator) -> Page {
    let PageKind::Anon(AnonState { swap_index, .. }) = &page.kind else {
        unreachable!("clone_stack_eagerly called on a non-anon page");
    };
    let swap_index = *swap_index;

    let new_frame = match (page.frame, swap_index) {
        (None, sw) if sw < 0 => None,
        (old_frame, sw) => {
            let id = frame::claim_frame(alloc);
            let kva = frame::kva_of(id);
            match old_frame {
                Some(old_id) => {
                    let old_kva = frame::kva_of(old_id);
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            old_kva.as_ptr::<u8>(),
                            kva.as_mut_ptr::<u8>(),
                            PAGE_SIZE,
                        );
                    }
                }
                None => swap::read_in(sw as usize, kva),
            }
            frame::set_owner(id, frame::PageKey { pid: child_pid, va: page.va });
            Some(id)
        }
    };

    Page {
        va: page.va,
        writable: page.writable,
        frame: new_frame,
        is_cow: false,
        kind: PageKind::Anon(AnonState { swap_index: -1, is_stack: true }),
    }
}

fn share_frame(page: &mut Page, id: frame::FrameId, parent_pt: &mut dyn AddressSpaceOps) {
    frame::bump_refcount(id);
    page.is_cow = true;
    parent_pt.set_page(page.va, frame::kva_of(id), false);
}

fn clone_uninit(u: &mut UninitState) -> UninitState {
    let target = match &mut u.target {
        TargetKind::Anon { is_stack } => TargetKind::Anon { is_stack: *is_stack },
        TargetKind::File { file, offset, read_bytes, zero_bytes, region } => TargetKind::File {
            file: file.reopen(),
            offset: *offset,
            read_bytes: *read_bytes,
            zero_bytes: *zero_bytes,
            region: *region,
        },
    };
    // A captured FnOnce can't be cloned; a forked UNINIT page falls
    // back to its kind's default materialization. Callers that need a
    // custom initializer to survive fork (e.g. a lazily-loaded ELF
    // segment) must re-issue vm_alloc_page_with_initializer after fork
    // instead of relying on this path.
    UninitState { target, init: None }
}

fn clone_file_state(f: &mut FileState) -> FileState {
    FileState {
        file: f.file.reopen(),
        offset: f.offset,
        read_bytes: f.read_bytes,
        zero_bytes: f.zero_bytes,
        region: f.region,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::test_support::{FakeAddressSpace, FakePageAllocator};

    fn fresh_pid(tag: usize) -> Pid {
        Pid(0xB000 + tag)
    }

    // A resident stack page must be memcpy'd into a fresh frame on
    // fork, never COW-shared: spec.md §3 ("never COW-shared on fork")
    // and §4.6 ("ANON, stack: eagerly allocate and copy").
    #[test_case]
    fn stack_page_is_eagerly_copied_not_shared_on_fork() {
        let child_pid = fresh_pid(1);
        let mut alloc = FakePageAllocator::default();

        let parent_frame = frame::claim_frame(&mut alloc);
        let parent_kva = frame::kva_of(parent_frame);
        let pattern: alloc::vec::Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        unsafe {
            core::ptr::copy_nonoverlapping(pattern.as_ptr(), parent_kva.as_mut_ptr::<u8>(), PAGE_SIZE)
        };

        let mut page = Page {
            va: 0x7FFF_0000,
            writable: true,
            frame: Some(parent_frame),
            is_cow: false,
            kind: PageKind::Anon(AnonState { swap_index: -1, is_stack: true }),
        };

        let mut parent_pt = FakeAddressSpace::new();
        let child_page = clone_for_fork(child_pid, &mut page, &mut parent_pt, &mut alloc);

        assert!(!child_page.is_cow, "stack pages never end up COW");
        let child_frame = child_page.frame.expect("resident parent stack page must copy eagerly");
        assert_ne!(child_frame, parent_frame, "child must not share the parent's frame");
        assert_eq!(frame::refcount(parent_frame), 1, "parent's frame refcount is untouched by an eager copy");

        let child_bytes = unsafe {
            core::slice::from_raw_parts(frame::kva_of(child_frame).as_ptr::<u8>(), PAGE_SIZE)
        };
        assert_eq!(child_bytes, pattern.as_slice());

        // The parent's own page is left exactly as it was.
        assert!(!page.is_cow);
        assert_eq!(page.frame, Some(parent_frame));
    }
}
