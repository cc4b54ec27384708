#![no_std]
#![no_main]

use bootloader_api::{BootInfo, entry_point};
use kernel::BOOTLOADER_CONFIG;

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    kernel::init::boot(boot_info)
}
