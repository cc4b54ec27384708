// kernel/src/qemu.rs
//
// QEMU test-exit plumbing. `Cargo.toml`'s `[package.metadata.bootimage]`
// already expects this: test-success-exit-code 33 is `(0x10 << 1) | 1`,
// the ISA debug-exit device's encoding of `QemuExitCode::Success`.

use x86_64::instructions::port::Port;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(code: QemuExitCode) -> ! {
    unsafe {
        let mut port = Port::<u32>::new(0xf4);
        port.write(code as u32);
    }
    loop {
        unsafe { core::arch::asm!("hlt") };
    }
}
