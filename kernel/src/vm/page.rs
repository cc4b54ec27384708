// kernel/src/vm/page.rs
//
// The Page: one entry of the supplemental page table. Pintos gives
// each page a function-pointer vtable (`page_operations`); we use a
// plain enum instead and match on it in swap_in/swap_out/destroy —
// one allocation per page fewer, and the compiler checks every
// operation handles every kind.

use alloc::boxed::Box;

use super::traits::{FileBackend, Kva};
use super::frame::FrameId;

/// Deferred first-touch materializer for a page still in UNINIT state.
/// Captures its own arguments as a closure — the Rust analogue of
/// Pintos's `vm_initializer` function pointer plus `void *aux`.
pub type InitClosure = Box<dyn FnOnce(&mut Page, Kva) -> Result<(), &'static str> + Send>;

/// What an UNINIT page will become on first touch, and whatever state
/// that transition needs (the C side's "aux").
pub enum TargetKind {
    Anon { is_stack: bool },
    File {
        file: Box<dyn FileBackend>,
        offset: u64,
        read_bytes: u32,
        zero_bytes: u32,
        region: Option<u64>,
    },
}

pub struct UninitState {
    pub target: TargetKind,
    pub init: Option<InitClosure>,
}

pub struct AnonState {
    /// -1 means "not swapped out". Otherwise an index into the swap table.
    pub swap_index: i64,
    pub is_stack: bool,
}

pub struct FileState {
    pub file: Box<dyn FileBackend>,
    pub offset: u64,
    pub read_bytes: u32,
    pub zero_bytes: u32,
    /// mmap region this page belongs to, if any (munmap needs this to
    /// write back dirty pages on unmap).
    pub region: Option<u64>,
}

pub enum PageKind {
    Uninit(UninitState),
    Anon(AnonState),
    File(FileState),
    /// Placeholder used only while a kind transition is mid-flight
    /// (mem::replace needs somewhere to put the old value). Never
    /// observed outside of uninit::swap_in.
    Transitioning,
}

pub struct Page {
    pub va: u64,
    pub writable: bool,
    pub frame: Option<FrameId>,
    pub kind: PageKind,
    /// Set on the child's page (and re-set on the parent's) when fork
    /// shares a frame between them instead of copying it eagerly.
    pub is_cow: bool,
}

impl Page {
    pub fn new_uninit(va: u64, writable: bool, target: TargetKind, init: Option<InitClosure>) -> Self {
        Self {
            va,
            writable,
            frame: None,
            kind: PageKind::Uninit(UninitState { target, init }),
            is_cow: false,
        }
    }

    pub fn is_uninit(&self) -> bool {
        matches!(self.kind, PageKind::Uninit(_))
    }
}
