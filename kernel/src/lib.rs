#![no_std]
#![feature(abi_x86_interrupt)]
#![cfg_attr(test, no_main)]
#![cfg_attr(test, feature(custom_test_frameworks))]
#![cfg_attr(test, test_runner(crate::test_runner))]
#![cfg_attr(test, reexport_test_harness_main = "test_main")]

extern crate alloc;

pub mod allocator;
pub mod drivers;
pub mod framebuffer;
pub mod init;
pub mod interrupts;
pub mod keyboard;
pub mod keyboard_buffer;
pub mod memory;
pub mod panic;
pub mod process;
pub mod pit;
pub mod qemu;
pub mod repl;
pub mod serial;
pub mod vm;

use bootloader_api::{BootInfo, BootloaderConfig, config::Mapping, entry_point};
#[cfg(test)]
use x86_64::VirtAddr;

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

pub use qemu::{exit_qemu, QemuExitCode};

/// Anything `#[test_case]` can point at — mirrors blog_os's Testable,
/// so `fn()` tests get a one-line pass/fail trace on the serial console
/// instead of silent success.
pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        serial_println!("ok");
    }
}

pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed);
}

#[cfg(test)]
entry_point!(test_kernel_main, config = &BOOTLOADER_CONFIG);

/// Test entry point. Brings up just enough to run `#[test_case]`s
/// against real hardware — phys memory offset and the buddy allocator,
/// which is all the heap (and so `alloc::*`) needs — without the full
/// `init::boot` sequence (framebuffer, REPL, scheduler) that never
/// returns.
#[cfg(test)]
fn test_kernel_main(boot_info: &'static mut BootInfo) -> ! {
    let phys_mem_offset =
        VirtAddr::new(boot_info.physical_memory_offset.into_option().unwrap());
    init::memory::init_core(phys_mem_offset, &boot_info.memory_regions);

    test_main();
    exit_qemu(QemuExitCode::Success);
}
