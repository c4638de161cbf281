//! User processes for AtomicOS: executable loading, spawn/wait/exit, per-process
//! file descriptors and the system-call boundary.
//!
//! The crate owns no hardware. The scheduler, MMU, frame allocator, console
//! and file-store it runs on are handed in through [`kernel::Services`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod serial;
pub mod config;
pub mod memory;
pub mod fs;
pub mod kernel;
pub mod loader;
pub mod process;
pub mod syscalls;
pub mod interrupts;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use interrupts::TrapFrame;
pub use kernel::{Console, Kernel, Machine, Semaphore, Services, ThreadEntry, ThreadError, Threads};
pub use loader::{LoadError, LoadedImage};
pub use process::{ChildRecord, Process, ProcessId, ProcessState, SpawnError, WaitError};
pub use syscalls::{Fault, Syscall};
