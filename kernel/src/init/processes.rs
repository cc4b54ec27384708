// kernel/src/init/processes.rs
//
// Process creation (idle, user, shell) and entry points.

use alloc::{boxed::Box, format};
use x86_64::VirtAddr;

use crate::{
    memory::page_table_manager::OwnedPageTable,
    process::{
        Pid, Process,
        scheduler::SCHEDULER,
        user_test_fileio,
    },
    vm::{
        self,
        address_space::PageTableHandle,
        page::TargetKind,
    },
    serial_println,
};

/// User code is always loaded at this address — one page, one test
/// binary per process for now.
const USER_CODE_BASE: u64 = 0x0000_0000_0040_0000;
const USER_STACK_BASE: u64 = 0x0000_7100_0000_0000;
/// How much of the 64 KiB stack region we pre-fault; the rest grows
/// on demand through `vm::vm_try_handle_fault`.
const STACK_REGION_SIZE: u64 = 16 * 4096;

// ============================================================================
// PUBLIC API
// ============================================================================

/// Create all processes: idle, user×2, shell.
pub fn init_all() {
    serial_println!("\n🔧 Creating processes with isolated address spaces...");

    create_idle_process();
    create_user_processes(2);
    create_shell_process();

    serial_println!("✅ All processes created!\n");
}

/// Print open file descriptors for every process (debug).
pub fn debug_file_descriptors() {
    let scheduler = SCHEDULER.lock();
    for proc in scheduler.iter_all() {
        serial_println!("Process {}: open files:", proc.pid.0);
        proc.files.debug_list();
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Allocar un kernel stack desde el Buddy (4 KiB).
fn allocate_kernel_stack() -> VirtAddr {
    let phys_addr = unsafe {
        crate::allocator::buddy_allocator::BUDDY.lock()
            .allocate(14)
            .expect("Failed to allocate kernel stack from buddy")
    };

    let virt_addr = crate::memory::physical_memory_offset() + phys_addr.as_u64();

    // Stack top (grows downward)
    VirtAddr::new(virt_addr.as_u64() + 4096)
}

// ============================================================================
// PROCESS CREATORS
// ============================================================================

/// Idle process — uses the kernel's own page table, no vm subsystem
/// registration needed since it never faults on user memory.
fn create_idle_process() {
    let kernel_stack = allocate_kernel_stack();
    let page_table = OwnedPageTable::from_current();

    let mut idle_proc = Box::new(Process::new_kernel(
        Pid(0),
        VirtAddr::new(idle_task as *const () as u64),
        kernel_stack,
        page_table.root_frame(),
    ));

    idle_proc.set_name("idle");
    idle_proc.set_priority(0);

    {
        let mut scheduler = SCHEDULER.lock();
        scheduler.add_process(idle_proc);
    }

    serial_println!("✅ Created idle process (PID 0)");
}

/// User processes — each gets its own page table and its own vm
/// subsystem address space. Code is loaded through a custom init
/// closure on first touch; the stack's first page is claimed eagerly
/// so the process has somewhere to push a return address, and the
/// rest of the 64 KiB region grows lazily on fault.
fn create_user_processes(num_processes: usize) {
    let test_name = "write";

    user_test_fileio::print_available_tests();
    serial_println!("\n📝 Using test: '{}'", test_name);

    for i in 0..num_processes {
        let kernel_stack = allocate_kernel_stack();

        let page_table = unsafe {
            OwnedPageTable::new_user()
                .expect("Failed to create user page table")
        };
        let root_frame = page_table.root_frame();

        serial_println!(
            "Created page table for process {}: PML4 at {:#x}",
            i,
            root_frame.start_address().as_u64()
        );

        let pid = {
            let mut scheduler = SCHEDULER.lock();
            scheduler.allocate_pid()
        };

        vm::spt_init(pid, PageTableHandle::new(root_frame));

        // ============ CODE ============
        // Captured as a `usize` rather than the raw pointer itself —
        // `*const u8` isn't `Send`, and `InitClosure` must be to cross
        // into the vm subsystem's boxed closure slot.
        let code_addr = user_test_fileio::get_test_ptr(test_name) as usize;
        let code_size = 4096usize;
        let init = Box::new(move |_page: &mut crate::vm::page::Page, kva: crate::vm::traits::Kva| {
            unsafe {
                core::ptr::copy_nonoverlapping(code_addr as *const u8, kva.as_mut_ptr::<u8>(), code_size);
            }
            Ok(())
        });

        vm::vm_alloc_page_with_initializer(
            pid,
            USER_CODE_BASE,
            false,
            TargetKind::Anon { is_stack: false },
            Some(init),
        ).expect("Failed to register user code page");
        vm::vm_claim_page(pid, USER_CODE_BASE)
            .expect("Failed to fault in user code page");

        serial_println!("  Loaded code page at {:#x}", USER_CODE_BASE);

        // ============ STACK ============
        let stack_base = USER_STACK_BASE + (i as u64 * 0x10000);
        let stack_top_page = stack_base + STACK_REGION_SIZE - 4096;

        vm::vm_alloc_page(pid, stack_top_page, true, TargetKind::Anon { is_stack: true })
            .expect("Failed to register stack page");
        vm::vm_claim_page(pid, stack_top_page)
            .expect("Failed to fault in stack page");

        let user_stack_top = VirtAddr::new(stack_base + STACK_REGION_SIZE - 8);

        serial_println!(
            "  Stack region: {:#x}..{:#x} (top page claimed, rest demand-paged)",
            stack_base,
            stack_base + STACK_REGION_SIZE,
        );

        // ============ PROCESS ============
        let mut user_proc = Box::new(Process::new_user(
            pid,
            VirtAddr::new(USER_CODE_BASE),
            user_stack_top,
            kernel_stack,
            root_frame,
        ));

        user_proc.set_name(&format!("user_{}", i));
        user_proc.set_priority(5);

        let mut scheduler = SCHEDULER.lock();
        scheduler.add_process(user_proc);

        serial_println!("✅ Created user process {} (PID {})", i, pid.0);
    }
}

/// Shell process — kernel, uses the kernel's own page table.
fn create_shell_process() {
    let kernel_stack = allocate_kernel_stack();
    let page_table = OwnedPageTable::from_current();

    let pid = {
        let mut scheduler = SCHEDULER.lock();
        let pid = scheduler.allocate_pid();

        let mut shell = Box::new(Process::new_kernel(
            pid,
            VirtAddr::new(shell_process as *const () as u64),
            kernel_stack,
            page_table.root_frame(),
        ));

        shell.set_name("shell");
        shell.set_priority(8);

        scheduler.add_process(shell);
        pid
    };

    serial_println!("✅ Created shell process (PID {})", pid.0);
}

// ============================================================================
// PROCESS ENTRY POINTS
// ============================================================================

fn idle_task() -> ! {
    loop {
        unsafe { core::arch::asm!("hlt"); }
    }
}

fn shell_process() -> ! {
    let mut repl = crate::repl::Repl::new(10, 50);
    repl.show_prompt();

    loop {
        if let Some(character) = crate::keyboard::read_key() {
            repl.handle_char(character);
        }
        unsafe { core::arch::asm!("pause"); }
    }
}
