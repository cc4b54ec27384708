// kernel/src/vm/fault.rs
//
// The page-fault resolver. The only entry point the interrupt handler
// in init/devices.rs needs to know about.

use crate::process::Pid;
use crate::serial_println;

use super::address_space::{self, AllocatorHandle};
use super::page::TargetKind;
use super::spt::{self, USER_SPACE_LIMIT};

/// Top of the user stack region; it grows downward from here.
/// Matches the PML4 entry the teacher's `page_table_manager` reserves
/// for user stacks (`USER_STACK_BASE`).
pub const USER_STACK_TOP: u64 = 0x0000_7100_0000_0000;
/// How far below USER_STACK_TOP a stack is allowed to grow.
pub const STACK_GROW_LIMIT: u64 = 1024 * 1024;
/// A `push` faults at most this many bytes below the current rsp.
const STACK_GROW_SLACK: u64 = 8;

/// Resolve a page fault. Returns true if the faulting instruction can
/// safely be retried, false if the process should be killed.
///
/// `rsp_hint` is the user-mode stack pointer at fault time (the trap
/// frame's saved rsp for genuine user-mode faults — this kernel never
/// takes a page fault on a user buffer from kernel context, so there
/// is no second source to reconcile, unlike Pintos's "or the thread's
/// saved esp" branch).
pub fn vm_try_handle_fault(pid: Pid, fault_addr: u64, is_user: bool, is_write: bool, not_present: bool, rsp_hint: u64) -> bool {
    if !is_user || fault_addr >= USER_SPACE_LIMIT {
        return false;
    }

    let va = spt::page_floor(fault_addr);

    let outcome = address_space::with_address_space(pid, |aspace| {
        let existing = aspace.spt.find(va).is_some();

        if existing {
            if !not_present {
                let is_cow = aspace.spt.find(va).map(|p| p.is_cow).unwrap_or(false);
                if is_write && is_cow {
                    return write_protect(aspace, va);
                }
                return false;
            }
            let mut alloc = AllocatorHandle::default();
            return aspace.claim_page(va, &mut alloc).is_ok();
        }

        if !grows_stack(va, rsp_hint) {
            return false;
        }

        if aspace.alloc_page(va, true, TargetKind::Anon { is_stack: true }).is_err() {
            return false;
        }
        let mut alloc = AllocatorHandle::default();
        aspace.claim_page(va, &mut alloc).is_ok()
    });

    outcome.unwrap_or(false)
}

fn grows_stack(va: u64, rsp_hint: u64) -> bool {
    if va >= USER_STACK_TOP {
        return false;
    }
    if va < USER_STACK_TOP.saturating_sub(STACK_GROW_LIMIT) {
        return false;
    }
    va + STACK_GROW_SLACK >= rsp_hint
}

/// A write landed on a page marked copy-on-write. If we're the last
/// owner of the frame, just flip it writable; otherwise copy it into
/// a fresh frame first.
fn write_protect(aspace: &mut super::address_space::AddressSpace, va: u64) -> bool {
    let Some(frame_id) = aspace.spt.find(va).and_then(|p| p.frame) else {
        return false;
    };

    if super::frame::refcount(frame_id) == 1 {
        if let Some(page) = aspace.spt.find_mut(va) {
            page.is_cow = false;
        }
        let kva = super::frame::kva_of(frame_id);
        return aspace.page_table.set_page(va, kva, true);
    }

    let mut alloc = AllocatorHandle::default();
    let new_frame = super::frame::claim_frame(&mut alloc);
    let new_kva = super::frame::kva_of(new_frame);
    let old_kva = super::frame::kva_of(frame_id);

    unsafe {
        core::ptr::copy_nonoverlapping(
            old_kva.as_ptr::<u8>(),
            new_kva.as_mut_ptr::<u8>(),
            super::traits::PAGE_SIZE,
        );
    }

    super::frame::set_owner(new_frame, super::frame::PageKey { pid: aspace.pid, va });
    super::frame::release_frame_ref(frame_id, &mut alloc);

    let Some(page) = aspace.spt.find_mut(va) else { return false };
    page.frame = Some(new_frame);
    page.is_cow = false;

    let ok = aspace.page_table.set_page(va, new_kva, true);
    if !ok {
        serial_println!("vm: write_protect failed to remap pid {:?} va {:#x}", aspace.pid, va);
    }
    ok
}
