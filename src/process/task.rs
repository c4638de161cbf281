use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use spin::Mutex;

use crate::fs::FdTable;
use crate::kernel::{Semaphore, Threads};
use crate::memory::AddressSpace;

/// Process identifier; the same number as the owning thread's scheduling id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Loading,
    Running,
    Exiting,
    Reaped,
}

/// A parent's view of one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRecord {
    pub child_id: ProcessId,
    pub exited: bool,
    /// Valid once `exited` is set.
    pub exit_code: i32,
}

impl ChildRecord {
    pub fn new(child_id: ProcessId) -> Self {
        ChildRecord { child_id, exited: false, exit_code: 0 }
    }
}

/// Child records plus the one child a blocked `wait` is parked on. Both sides
/// of the exit handoff read and update these under the same lock.
pub(super) struct Children {
    pub(super) records: Vec<ChildRecord>,
    pub(super) waiting_on: Option<ProcessId>,
}

impl Children {
    pub(super) fn position(&self, child_id: ProcessId) -> Option<usize> {
        self.records.iter().position(|r| r.child_id == child_id)
    }
}

/// One running user program.
pub struct Process {
    pid: ProcessId,
    name: String,
    parent: Weak<Process>,
    state: Mutex<ProcessState>,
    exit_code: AtomicI32,
    pub(crate) address_space: Mutex<Option<Box<dyn AddressSpace>>>,
    pub(crate) files: Mutex<FdTable>,
    pub(super) children: Mutex<Children>,
    /// Raised by a child's exit while this process waits on it.
    pub(super) wait_signal: Box<dyn Semaphore>,
    /// Raised once by a freshly spawned child when its load attempt is over.
    load_signal: Box<dyn Semaphore>,
    load_ok: AtomicBool,
}

impl Process {
    pub(crate) fn new(pid: ProcessId, name: String, parent: Weak<Process>, threads: &dyn Threads) -> Self {
        Process {
            pid,
            name,
            parent,
            state: Mutex::new(ProcessState::Loading),
            exit_code: AtomicI32::new(0),
            address_space: Mutex::new(None),
            files: Mutex::new(FdTable::new()),
            children: Mutex::new(Children { records: Vec::new(), waiting_on: None }),
            wait_signal: threads.semaphore(0),
            load_signal: threads.semaphore(0),
            load_ok: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    pub(super) fn set_state(&self, state: ProcessState) {
        *self.state.lock() = state;
    }

    /// Meaningful once the process has terminated.
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    pub(super) fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    /// The parent, if it has not been freed yet.
    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.upgrade()
    }

    /// Ids of every child not yet harvested.
    pub fn child_ids(&self) -> Vec<ProcessId> {
        self.children.lock().records.iter().map(|r| r.child_id).collect()
    }

    pub fn open_file_count(&self) -> usize {
        self.files.lock().len()
    }

    pub fn has_address_space(&self) -> bool {
        self.address_space.lock().is_some()
    }

    pub(super) fn add_child(&self, child_id: ProcessId) {
        self.children.lock().records.push(ChildRecord::new(child_id));
    }

    pub(super) fn discard_child(&self, child_id: ProcessId) -> Option<ChildRecord> {
        let mut children = self.children.lock();
        let index = children.position(child_id)?;
        Some(children.records.remove(index))
    }

    /// Store a child's exit status in its record, waking this process if it
    /// is blocked waiting on exactly that child.
    pub(super) fn child_exited(&self, child_id: ProcessId, status: i32) {
        let wake = {
            let mut children = self.children.lock();
            match children.position(child_id) {
                Some(index) => {
                    let record = &mut children.records[index];
                    record.exit_code = status;
                    record.exited = true;
                    children.waiting_on == Some(child_id)
                }
                None => false,
            }
        };
        if wake {
            self.wait_signal.up();
        }
    }

    /// Child side of the spawn rendezvous.
    pub(super) fn report_load(&self, ok: bool) {
        self.load_ok.store(ok, Ordering::SeqCst);
        self.load_signal.up();
    }

    /// Parent side of the spawn rendezvous. Blocks until the child reports.
    pub(super) fn await_load(&self) -> bool {
        self.load_signal.down();
        self.load_ok.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
