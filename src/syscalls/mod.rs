//! The system-call boundary.
//!
//! User code traps with the call number at the stack pointer and its
//! arguments in fixed word slots above it. Every pointer is checked and its
//! data copied into kernel memory before the call runs; a call that cannot be
//! decoded kills the caller with status -1.

pub mod uaccess;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::fs::{STDIN_FILENO, STDOUT_FILENO};
use crate::interrupts::TrapFrame;
use crate::kernel::Kernel;
use crate::process::{Process, ProcessId, SpawnError};
use crate::{log_error, log_info, log_warn};

pub use uaccess::{Fault, FaultResult, UserMemory};

/// Syscall numbers (the word at the user stack pointer).
pub const SYS_HALT:     u64 = 0;
pub const SYS_EXIT:     u64 = 1;
pub const SYS_EXEC:     u64 = 2;
pub const SYS_WAIT:     u64 = 3;
pub const SYS_CREATE:   u64 = 4;
pub const SYS_OPEN:     u64 = 6;
pub const SYS_FILESIZE: u64 = 7;
pub const SYS_READ:     u64 = 8;
pub const SYS_WRITE:    u64 = 9;
pub const SYS_CLOSE:    u64 = 12;

/// Word slots, counted from the stack pointer, that each argument lives in.
pub mod slot {
    pub const STATUS: u64 = 1;
    pub const CMD_LINE: u64 = 1;
    pub const PID: u64 = 1;
    pub const FD: u64 = 1;
    pub const NAME: u64 = 1;
    pub const CREATE_NAME: u64 = 4;
    pub const CREATE_SIZE: u64 = 5;
    pub const IO_FD: u64 = 5;
    pub const IO_BUFFER: u64 = 6;
    pub const IO_LENGTH: u64 = 7;
}

const WORD: u64 = core::mem::size_of::<u64>() as u64;

/// A decoded call, with every user string and outgoing buffer already in
/// kernel memory. A string argument is `None` when it was valid but longer
/// than the copy limit; such a call fails with its ordinary error value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Syscall {
    Halt,
    Exit { status: i32 },
    Exec { command_line: Option<String> },
    Wait { pid: ProcessId },
    Create { name: Option<String>, initial_size: u32 },
    Open { name: Option<String> },
    Filesize { fd: i32 },
    /// `buffer` has been checked writable for `len` bytes.
    Read { fd: i32, buffer: u64, len: u32 },
    Write { fd: i32, data: Vec<u8> },
    Close { fd: i32 },
}

/// Read the call at `sp` and its arguments out of `mem`.
pub fn decode(mem: &UserMemory, sp: u64, max_string: usize) -> FaultResult<Syscall> {
    let arg = |slot: u64| -> FaultResult<u64> {
        let at = sp.checked_add(slot * WORD).ok_or(Fault::BadAddress(sp))?;
        mem.read_u64(at)
    };

    let call = match mem.read_u64(sp)? {
        SYS_HALT => Syscall::Halt,
        SYS_EXIT => Syscall::Exit { status: arg(slot::STATUS)? as i32 },
        SYS_EXEC => Syscall::Exec {
            command_line: mem.read_cstr(arg(slot::CMD_LINE)?, max_string)?,
        },
        SYS_WAIT => Syscall::Wait { pid: ProcessId(arg(slot::PID)? as u32) },
        SYS_CREATE => {
            let name = arg(slot::CREATE_NAME)?;
            let initial_size = arg(slot::CREATE_SIZE)? as u32;
            Syscall::Create { name: mem.read_cstr(name, max_string)?, initial_size }
        }
        SYS_OPEN => Syscall::Open { name: mem.read_cstr(arg(slot::NAME)?, max_string)? },
        SYS_FILESIZE => Syscall::Filesize { fd: arg(slot::FD)? as i32 },
        SYS_READ => {
            let fd = arg(slot::IO_FD)? as i32;
            let buffer = arg(slot::IO_BUFFER)?;
            let len = arg(slot::IO_LENGTH)? as u32;
            mem.check_range(buffer, len as usize, true)?;
            Syscall::Read { fd, buffer, len }
        }
        SYS_WRITE => {
            let fd = arg(slot::IO_FD)? as i32;
            let buffer = arg(slot::IO_BUFFER)?;
            let len = arg(slot::IO_LENGTH)? as u32;
            Syscall::Write { fd, data: mem.read_bytes(buffer, len as usize)? }
        }
        SYS_CLOSE => Syscall::Close { fd: arg(slot::FD)? as i32 },
        other => return Err(Fault::BadSyscall(other)),
    };
    Ok(call)
}

impl Kernel {
    /// Entry from the trap handler for a system call made by `process`.
    /// The result, if the call returns one, goes to `frame.rax`.
    pub fn handle_trap(self: &Arc<Self>, process: &Arc<Process>, frame: &mut TrapFrame) {
        let call = {
            let space = process.address_space.lock();
            match space.as_deref() {
                Some(space) => {
                    let mem = UserMemory::new(space, &*self.frames);
                    decode(&mem, frame.rsp, self.config.max_user_string)
                }
                None => {
                    log_error!("trap from pid {} with no address space", process.pid());
                    Err(Fault::BadAddress(frame.rsp))
                }
            }
        };
        let call = match call {
            Ok(call) => call,
            Err(fault) => {
                log_warn!("{}: {}", process.name(), fault);
                self.kill(process.clone())
            }
        };

        if let Some(value) = self.dispatch(process, call) {
            frame.rax = value as u64;
        }
    }

    fn dispatch(self: &Arc<Self>, process: &Arc<Process>, call: Syscall) -> Option<i64> {
        let value = match call {
            Syscall::Halt => {
                log_info!("halt requested by pid {}", process.pid());
                self.machine.power_off()
            }
            Syscall::Exit { status } => self.exit(process.clone(), status),
            Syscall::Exec { command_line } => {
                let command_line = command_line.ok_or(SpawnError::CommandTooLong);
                match command_line.and_then(|cmd| self.spawn(process, &cmd)) {
                    Ok(pid) => pid.0 as i64,
                    Err(_) => -1,
                }
            }
            Syscall::Wait { pid } => match self.wait(process, pid) {
                Ok(status) => status as i64,
                Err(_) => -1,
            },
            Syscall::Create { name, initial_size } => match name {
                Some(name) => self.fs.create(&name, initial_size as u64).is_ok() as i64,
                None => 0,
            },
            Syscall::Open { name } => match name.map(|name| self.fs.open(&name)) {
                Some(Ok(file)) => process.files.lock().insert(file) as i64,
                _ => -1,
            },
            Syscall::Filesize { fd } => {
                let mut files = process.files.lock();
                match files.get_mut(fd) {
                    Some(handle) => self.fs.length(&*handle.file) as i64,
                    None => -1,
                }
            }
            Syscall::Read { fd, buffer, len } => self.sys_read(process, fd, buffer, len),
            Syscall::Write { fd, data } => self.sys_write(process, fd, &data),
            Syscall::Close { fd } => {
                if let Some(handle) = process.files.lock().remove(fd) {
                    self.fs.close(handle.file);
                }
                return None;
            }
        };
        Some(value)
    }

    fn sys_read(self: &Arc<Self>, process: &Arc<Process>, fd: i32, buffer: u64, len: u32) -> i64 {
        let mut data;
        let count = if fd == STDIN_FILENO {
            data = vec![0u8; len as usize];
            for byte in data.iter_mut() {
                *byte = self.console.getc();
            }
            data.len()
        } else {
            let mut files = process.files.lock();
            let handle = match files.get_mut(fd) {
                Some(handle) => handle,
                None => return -1,
            };
            data = vec![0u8; len as usize];
            self.fs.read(&mut *handle.file, &mut data)
        };

        let copied = {
            let space = process.address_space.lock();
            space
                .as_deref()
                .ok_or(Fault::BadAddress(buffer))
                .and_then(|space| UserMemory::new(space, &*self.frames).write(buffer, &data[..count]))
        };
        if let Err(fault) = copied {
            log_warn!("{}: {}", process.name(), fault);
            self.kill(process.clone());
        }
        count as i64
    }

    fn sys_write(&self, process: &Process, fd: i32, data: &[u8]) -> i64 {
        if fd == STDOUT_FILENO {
            if !data.is_empty() {
                self.console.putbuf(data);
            }
            return data.len() as i64;
        }
        let mut files = process.files.lock();
        match files.get_mut(fd) {
            Some(_) if data.is_empty() => 0,
            Some(handle) => self.fs.write(&mut *handle.file, data) as i64,
            None => -1,
        }
    }
}
