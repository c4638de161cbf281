//! Collaborator seams and the kernel hub that ties them together.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use x86_64::VirtAddr;

use crate::config::Config;
use crate::fs::{FileStore, FileSystem};
use crate::memory::{FrameAllocator, Mmu};
use crate::process::{Process, ProcessId};

/// Counting semaphore supplied by the scheduler.
pub trait Semaphore: Send + Sync {
    fn down(&self);
    fn up(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadError;

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Cannot create thread")
    }
}

/// Entry point of a new kernel thread; receives the thread's scheduling id.
pub type ThreadEntry = Box<dyn FnOnce(ProcessId) + Send>;

/// The kernel-thread layer.
pub trait Threads: Send + Sync {
    /// Create a runnable thread. The entry may start before this returns.
    fn spawn(&self, name: &str, entry: ThreadEntry) -> Result<ProcessId, ThreadError>;
    fn semaphore(&self, initial: u32) -> Box<dyn Semaphore>;
    /// Terminate the calling thread.
    fn exit(&self) -> !;
}

/// Console device.
pub trait Console: Send + Sync {
    fn putbuf(&self, bytes: &[u8]);
    /// Block until one byte of input is available.
    fn getc(&self) -> u8;
}

/// CPU-level control transfers.
pub trait Machine: Send + Sync {
    /// Drop to user mode at `entry` with the stack pointer at `stack`. Every
    /// trap from that code comes back through [`Kernel::handle_trap`] with
    /// `process` as the current process.
    fn enter_user(&self, kernel: Arc<Kernel>, process: Arc<Process>, entry: VirtAddr, stack: VirtAddr) -> !;
    fn power_off(&self) -> !;
}

/// Everything the kernel consumes from the layers around it.
pub struct Services {
    pub threads: Arc<dyn Threads>,
    pub mmu: Arc<dyn Mmu>,
    pub frames: Arc<dyn FrameAllocator>,
    pub machine: Arc<dyn Machine>,
    pub console: Arc<dyn Console>,
    pub files: Box<dyn FileStore>,
}

pub struct Kernel {
    pub(crate) config: Config,
    pub(crate) threads: Arc<dyn Threads>,
    pub(crate) mmu: Arc<dyn Mmu>,
    pub(crate) frames: Arc<dyn FrameAllocator>,
    pub(crate) machine: Arc<dyn Machine>,
    pub(crate) console: Arc<dyn Console>,
    pub(crate) fs: FileSystem,
}

impl Kernel {
    pub fn new(services: Services, config: Config) -> Arc<Self> {
        crate::log_info!("User program layer initialized.");
        Arc::new(Kernel {
            config,
            threads: services.threads,
            mmu: services.mmu,
            frames: services.frames,
            machine: services.machine,
            console: services.console,
            fs: FileSystem::new(services.files),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared file-store, behind the global file lock.
    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }
}
