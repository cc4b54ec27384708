// kernel/src/process/mod.rs

use alloc::boxed::Box;
use x86_64::{VirtAddr, structures::paging::PhysFrame};

pub mod context;
pub mod file;
pub mod syscall;
pub mod timer_preempt;
pub mod trapframe;
pub mod trapret;
pub mod tss;
pub mod user_test_fileio;
pub mod user_test_minimal;
pub mod userspace;
pub mod scheduler;

use context::Context;
use file::FileDescriptorTable;
use trapframe::TrapFrame;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub usize);

/// Estado del proceso
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,      // Listo para ejecutar
    Running,    // Ejecutándose actualmente
    Sleeping,   // Esperando I/O
    Zombie,     // Terminado pero no recolectado
}

/// Privilege level del proceso
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    Kernel,  // Ring 0
    User,    // Ring 3
}

/// Process Control Block (PCB)
pub struct Process {
    pub pid: Pid,
    pub state: ProcessState,
    pub context: Context,
    pub kernel_stack: VirtAddr,
    pub user_stack: Option<VirtAddr>,
    pub privilege: PrivilegeLevel,
    pub page_table: PhysFrame,
    pub files: FileDescriptorTable,
    /// Saved user-mode register state, restored by the timer-preemption
    /// path. `None` until the process has taken at least one interrupt
    /// in user mode.
    pub trapframe: Option<Box<TrapFrame>>,
    pub priority: u8,
    pub name: [u8; 32],
}

impl Process {
    /// Crea un nuevo proceso de kernel (Ring 0), corriendo sobre el
    /// page table que se le pase (normalmente el del kernel).
    pub fn new_kernel(pid: Pid, entry_point: VirtAddr, kernel_stack: VirtAddr, page_table: PhysFrame) -> Self {
        Self {
            pid,
            state: ProcessState::Ready,
            context: Context::new(entry_point, kernel_stack),
            kernel_stack,
            user_stack: None,
            privilege: PrivilegeLevel::Kernel,
            page_table,
            files: FileDescriptorTable::new_with_stdio(),
            trapframe: None,
            priority: 0,
            name: [0; 32],
        }
    }

    /// Crea un proceso de user space (Ring 3). `user_stack_top` es la
    /// dirección donde el vm subsystem ya dejó residente la página
    /// inicial del stack (ver `vm::vm_claim_page`).
    pub fn new_user(
        pid: Pid,
        entry_point: VirtAddr,
        user_stack_top: VirtAddr,
        kernel_stack: VirtAddr,
        page_table: PhysFrame,
    ) -> Self {
        Self {
            pid,
            state: ProcessState::Ready,
            context: Context::new_user(entry_point, kernel_stack, user_stack_top),
            kernel_stack,
            user_stack: Some(user_stack_top),
            privilege: PrivilegeLevel::User,
            page_table,
            files: FileDescriptorTable::new_with_stdio(),
            trapframe: None,
            priority: 0,
            name: [0; 32],
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(31);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }
}

/// Yield CPU para permitir context switch
pub fn yield_cpu() {
    use context::switch_context;

    let switch_info = {
        let mut scheduler = scheduler::SCHEDULER.lock();
        scheduler.switch_to_next()
    };

    if let Some((old_ctx, new_ctx)) = switch_info {
        unsafe {
            switch_context(old_ctx, new_ctx);
        }
    }
}

/// Boot-time entry: switches from the boot stack onto the first
/// scheduled process's context and never returns. Reuses the same
/// `switch_context` trampoline `yield_cpu` drives, with a throwaway
/// context standing in for "the process we're switching away from"
/// since none has run yet.
pub fn start_first_process() -> ! {
    use context::switch_context;

    let next_ctx: *const Context = {
        let mut scheduler = scheduler::SCHEDULER.lock();
        let proc = scheduler.schedule().expect("no processes to start");
        &proc.context as *const Context
    };

    let mut boot_ctx = Context::empty();
    unsafe {
        switch_context(&mut boot_ctx as *mut Context, next_ctx);
    }
    unreachable!("switch_context returned to start_first_process");
}

/// Función de prueba que ejecuta en Ring 3
#[no_mangle]
pub extern "C" fn user_test_function() -> ! {
    // Obtener PID
    let pid = userspace::sys_getpid();
    
    // Mensaje de prueba
    let msg = b"Hello from userspace! PID=";
    userspace::sys_write(1, msg.as_ptr(), msg.len());
    
    // ✅ FIX: Usar array estático o escribir char por char
    if pid < 10 {
        let c = b'0' + pid as u8;
        userspace::sys_write(1, &c as *const u8, 1);
    } else {
        let tens = b'0' + (pid / 10) as u8;
        let ones = b'0' + (pid % 10) as u8;
        userspace::sys_write(1, &tens as *const u8, 1);
        userspace::sys_write(1, &ones as *const u8, 1);
    }
    
    let newline = b"\n";
    userspace::sys_write(1, newline.as_ptr(), newline.len());
    
    // Salir con status 0
    userspace::sys_exit(0);
}