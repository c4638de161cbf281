//! Process lifecycle: spawn, wait, exit.
//!
//! Each user process runs on its own kernel thread. A parent learns about its
//! children only through [`ChildRecord`]s kept in its own table; a child's
//! exit writes its status there and wakes the parent when the parent is
//! blocked waiting on that very child.

pub mod task;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::fmt;

use crate::kernel::Kernel;
use crate::loader;
use crate::{log_info, log_warn};

pub use task::{ChildRecord, Process, ProcessId, ProcessState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The command line does not fit in the kernel's copy buffer.
    CommandTooLong,
    ThreadCreation,
    /// The child could not load its executable and has already exited.
    LoadFailed,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SpawnError::CommandTooLong => write!(f, "Command line too long"),
            SpawnError::ThreadCreation => write!(f, "Cannot create thread"),
            SpawnError::LoadFailed     => write!(f, "Load failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// Not a child of the caller, or already waited for.
    NoSuchChild,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WaitError::NoSuchChild => write!(f, "No such child"),
        }
    }
}

/// Space-separated tokens of a command line; runs of spaces count as one.
pub fn arguments(command_line: &str) -> impl Iterator<Item = &str> {
    command_line.split(' ').filter(|token| !token.is_empty())
}

/// The executable name: the first token of the command line.
pub fn program_name(command_line: &str) -> &str {
    arguments(command_line).next().unwrap_or("")
}

impl Kernel {
    /// Wrap the calling kernel thread in a process with no address space and
    /// no parent, so it can spawn and wait for user programs.
    pub fn boot_process(&self, pid: ProcessId, name: &str) -> Arc<Process> {
        let process = Arc::new(Process::new(pid, String::from(name), Weak::new(), &*self.threads));
        process.set_state(ProcessState::Running);
        process
    }

    /// Start a child of `parent` running `command_line`.
    ///
    /// Blocks until the child has either loaded its executable or failed to.
    /// On success the child is already in `parent`'s child table.
    pub fn spawn(self: &Arc<Self>, parent: &Arc<Process>, command_line: &str) -> Result<ProcessId, SpawnError> {
        if command_line.len() > self.config.max_command_line {
            return Err(SpawnError::CommandTooLong);
        }
        let command_line = String::from(command_line);
        let name = String::from(program_name(&command_line));

        let kernel = self.clone();
        let weak_parent = Arc::downgrade(parent);
        let pid = self
            .threads
            .spawn(
                &name,
                Box::new(move |pid| kernel.start_process(pid, weak_parent, command_line)),
            )
            .map_err(|e| {
                log_warn!("spawn '{}': {}", name, e);
                SpawnError::ThreadCreation
            })?;

        if !parent.await_load() {
            parent.discard_child(pid);
            return Err(SpawnError::LoadFailed);
        }
        log_info!("spawned '{}' as pid {}", name, pid);
        Ok(pid)
    }

    /// Body of a freshly spawned process thread.
    fn start_process(self: Arc<Self>, pid: ProcessId, parent: Weak<Process>, command_line: String) -> ! {
        let process = Arc::new(Process::new(
            pid,
            String::from(program_name(&command_line)),
            parent.clone(),
            &*self.threads,
        ));

        // The record goes in before the load so that it exists by the time the
        // parent hears back, whichever way the load goes.
        let parent = parent.upgrade();
        if let Some(parent) = &parent {
            parent.add_child(pid);
        }

        match loader::load(&self, &command_line) {
            Ok(image) => {
                *process.address_space.lock() = Some(image.address_space);
                process.set_state(ProcessState::Running);
                if let Some(parent) = parent {
                    parent.report_load(true);
                }
                let machine = self.machine.clone();
                machine.enter_user(self, process, image.entry, image.stack)
            }
            Err(err) => {
                log_warn!("load: {}: {}", process.name(), err);
                if let Some(parent) = parent {
                    parent.report_load(false);
                }
                self.exit(process, -1)
            }
        }
    }

    /// Wait for `child` to exit and return its status.
    ///
    /// A child can be waited for once; its record is gone afterwards.
    pub fn wait(&self, parent: &Process, child: ProcessId) -> Result<i32, WaitError> {
        let mut children = parent.children.lock();
        let index = children.position(child).ok_or(WaitError::NoSuchChild)?;
        if !children.records[index].exited {
            children.waiting_on = Some(child);
            drop(children);
            parent.wait_signal.down();
            children = parent.children.lock();
        }
        children.waiting_on = None;

        // Only this thread removes records while it lives, so the record
        // must still be there.
        let index = children.position(child).expect("child record lost during wait");
        let record = children.records.remove(index);
        assert!(record.exited, "woken before child {} exited", child);
        Ok(record.exit_code)
    }

    /// Terminate `process` with `status` and never return.
    pub fn exit(&self, process: Arc<Process>, status: i32) -> ! {
        self.release(&process, status);
        drop(process);
        self.threads.exit()
    }

    /// Terminate `process` with status -1.
    pub fn kill(&self, process: Arc<Process>) -> ! {
        self.exit(process, -1)
    }

    fn release(&self, process: &Process, status: i32) {
        // A process that never finished loading goes straight to Reaped.
        if process.state() == ProcessState::Running {
            process.set_state(ProcessState::Exiting);
        }
        process.set_exit_code(status);

        let message = alloc::format!("{}: exit({})\n", process.name(), status);
        self.console.putbuf(message.as_bytes());

        if let Some(parent) = process.parent() {
            parent.child_exited(process.pid(), status);
        }

        let handles = process.files.lock().drain();
        for handle in handles {
            self.fs.close(handle.file);
        }

        // Unharvested children lose their records; their own exits then find
        // nothing to update and skip the handoff.
        process.children.lock().records.clear();

        assert!(process.files.lock().is_empty(), "files left open at exit");
        assert!(process.children.lock().records.is_empty(), "child records left at exit");

        if let Some(space) = process.address_space.lock().take() {
            self.mmu.activate_kernel();
            space.destroy();
        }
        process.set_state(ProcessState::Reaped);
        log_info!("pid {} reaped", process.pid());
    }
}
