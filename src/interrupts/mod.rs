use alloc::sync::Arc;

use crate::kernel::Kernel;
use crate::log_warn;
use crate::process::Process;

/// User register state saved by the trap entry stub, general registers first,
/// then the frame the CPU pushes on a privilege change.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// A frame for a trap taken with the user stack pointer at `rsp`.
    pub fn at_stack(rsp: u64) -> Self {
        TrapFrame { rsp, ..TrapFrame::default() }
    }
}

impl Kernel {
    /// A page fault or protection fault raised by user code. The process is
    /// killed; the kernel never resolves user faults.
    pub fn handle_fault(&self, process: &Arc<Process>, frame: &TrapFrame, fault_addr: u64) -> ! {
        log_warn!(
            "{}: fault at {:#x} (rip {:#x}), killing pid {}",
            process.name(),
            fault_addr,
            frame.rip,
            process.pid()
        );
        self.kill(process.clone())
    }
}
