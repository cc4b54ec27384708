// kernel/src/vm/uninit.rs
//
// The UNINIT -> {Anon, File} transition. First fault on a freshly
// allocated page runs this exactly once: install the target kind's
// state, then materialize content into the claimed frame.

use super::anon;
use super::file_backend;
use super::page::{Page, PageKind, TargetKind};
use super::traits::Kva;

pub fn swap_in(page: &mut Page, kva: Kva) -> Result<(), &'static str> {
    let uninit = match core::mem::replace(&mut page.kind, PageKind::Transitioning) {
        PageKind::Uninit(u) => u,
        other => {
            page.kind = other;
            return Err("uninit::swap_in called on a page that already has a kind");
        }
    };

    match uninit.target {
        TargetKind::Anon { is_stack } => anon::initializer(page, is_stack),
        TargetKind::File { file, offset, read_bytes, zero_bytes, region } => {
            page.kind = PageKind::File(super::page::FileState {
                file,
                offset,
                read_bytes,
                zero_bytes,
                region,
            });
        }
    }

    match uninit.init {
        Some(init) => init(page, kva),
        None => match &page.kind {
            PageKind::Anon(_) => anon::swap_in(page, kva),
            PageKind::File(_) => file_backend::swap_in(page, kva),
            _ => unreachable!(),
        },
    }
}
