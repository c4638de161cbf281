//! Hosted stand-ins for the layers around the kernel: std threads for the
//! scheduler, a table of Rust closures for the CPU, and a byte-buffer console.
//! User programs are closures keyed by entry address; the executables that
//! name them are real ELF images in a [`RamFs`].

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use x86_64::{PhysAddr, VirtAddr};

use crate::config::Config;
use crate::fs::RamFs;
use crate::interrupts::TrapFrame;
use crate::kernel::{Console, Kernel, Machine, Semaphore, Services, ThreadEntry, ThreadError, Threads};
use crate::loader::elf::{PT_LOAD, EHDR_SIZE, PHDR_SIZE};
use crate::loader::SegmentFlags;
use crate::memory::{page_offset, round_up_to_page, FramePool, SoftMmu, PAGE_SIZE};
use crate::process::{Process, ProcessId};
use crate::serial::{self, LogSink};
use crate::syscalls::{self, slot, UserMemory};

pub const TEXT_BASE: u64 = 0x40_0000;
/// Writable segment every test executable carries, used for syscall arguments.
pub const SCRATCH_BASE: u64 = 0x80_0000;
pub const SCRATCH_SIZE: u64 = 4 * PAGE_SIZE;

/// Unwind payload that ends a thread on purpose.
struct ThreadExit;

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        String::from(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic")
    }
}

struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&self, level: &str, args: core::fmt::Arguments) {
        eprintln!("[{}] {}", level, args);
    }
}

static STDERR_SINK: StderrSink = StderrSink;

// ──────────────────────────────────────────────────────────────
//  Scheduler
// ──────────────────────────────────────────────────────────────

pub struct HostSemaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl HostSemaphore {
    pub fn new(initial: u32) -> Self {
        HostSemaphore { count: Mutex::new(initial), cond: Condvar::new() }
    }
}

impl Semaphore for HostSemaphore {
    fn down(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn up(&self) {
        *self.count.lock().unwrap() += 1;
        self.cond.notify_one();
    }
}

pub struct HostThreads {
    next_id: AtomicU32,
    refuse: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    failures: Arc<Mutex<Vec<String>>>,
}

impl HostThreads {
    pub fn new(first_id: u32) -> Self {
        HostThreads {
            next_id: AtomicU32::new(first_id),
            refuse: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make every later `spawn` fail.
    pub fn refuse_spawns(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Join every thread, including those spawned while joining, and return
    /// the messages of any that panicked.
    pub fn join_all(&self) -> Vec<String> {
        loop {
            let batch = std::mem::take(&mut *self.handles.lock().unwrap());
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                let _ = handle.join();
            }
        }
        self.failures.lock().unwrap().clone()
    }
}

impl Threads for HostThreads {
    fn spawn(&self, name: &str, entry: ThreadEntry) -> Result<ProcessId, ThreadError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ThreadError);
        }
        let pid = ProcessId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let failures = self.failures.clone();
        let handle = std::thread::Builder::new()
            .name(String::from(name))
            .spawn(move || {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || entry(pid))) {
                    if !payload.is::<ThreadExit>() {
                        failures.lock().unwrap().push(panic_message(&*payload));
                    }
                }
            })
            .map_err(|_| ThreadError)?;
        self.handles.lock().unwrap().push(handle);
        Ok(pid)
    }

    fn semaphore(&self, initial: u32) -> Box<dyn Semaphore> {
        Box::new(HostSemaphore::new(initial))
    }

    fn exit(&self) -> ! {
        panic::resume_unwind(Box::new(ThreadExit))
    }
}

// ──────────────────────────────────────────────────────────────
//  Console
// ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct BufferConsole {
    output: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
    input_ready: Condvar,
}

impl BufferConsole {
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().unwrap()).into_owned()
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.input.lock().unwrap().extend(bytes);
        self.input_ready.notify_all();
    }
}

impl Console for BufferConsole {
    fn putbuf(&self, bytes: &[u8]) {
        self.output.lock().unwrap().extend_from_slice(bytes);
    }

    fn getc(&self) -> u8 {
        let mut input = self.input.lock().unwrap();
        loop {
            if let Some(byte) = input.pop_front() {
                return byte;
            }
            input = self.input_ready.wait(input).unwrap();
        }
    }
}

// ──────────────────────────────────────────────────────────────
//  CPU
// ──────────────────────────────────────────────────────────────

/// A user program: runs against its context and returns the status that
/// falling off the end of `main` would pass to `exit`.
pub type Program = Arc<dyn Fn(&mut UserCtx) -> i32 + Send + Sync>;

#[derive(Default)]
pub struct Cpu {
    programs: Mutex<HashMap<u64, Program>>,
    halted: AtomicBool,
    failures: Mutex<Vec<String>>,
}

impl Cpu {
    pub fn install(&self, entry: u64, program: Program) {
        self.programs.lock().unwrap().insert(entry, program);
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }
}

impl Machine for Cpu {
    fn enter_user(&self, kernel: Arc<Kernel>, process: Arc<Process>, entry: VirtAddr, stack: VirtAddr) -> ! {
        let program = self.programs.lock().unwrap().get(&entry.as_u64()).cloned();
        let mut ctx = UserCtx { kernel, process, sp: stack.as_u64(), scratch: SCRATCH_BASE };
        let Some(program) = program else {
            // Nothing executable at the entry point.
            let frame = TrapFrame { rip: entry.as_u64(), ..TrapFrame::at_stack(ctx.sp) };
            ctx.kernel.handle_fault(&ctx.process, &frame, entry.as_u64())
        };
        match panic::catch_unwind(AssertUnwindSafe(|| program(&mut ctx))) {
            Ok(status) => ctx.exit(status),
            Err(payload) if payload.is::<ThreadExit>() => panic::resume_unwind(payload),
            Err(payload) => {
                // A failed assertion inside a user program still has to
                // exit, or its parent would wait forever.
                self.failures.lock().unwrap().push(panic_message(&*payload));
                ctx.exit(-1)
            }
        }
    }

    fn power_off(&self) -> ! {
        self.halted.store(true, Ordering::SeqCst);
        panic::resume_unwind(Box::new(ThreadExit))
    }
}

/// What a running user program sees: its memory and the syscall trap.
pub struct UserCtx {
    pub kernel: Arc<Kernel>,
    pub process: Arc<Process>,
    sp: u64,
    scratch: u64,
}

impl UserCtx {
    pub fn stack_pointer(&self) -> u64 {
        self.sp
    }

    pub fn with_memory<R>(&self, f: impl FnOnce(&UserMemory) -> R) -> R {
        let space = self.process.address_space.lock();
        let space = space.as_deref().expect("user code without an address space");
        f(&UserMemory::new(space, &*self.kernel.frames))
    }

    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        self.with_memory(|mem| mem.read_bytes(addr, len)).expect("peek at unmapped memory")
    }

    pub fn peek_u64(&self, addr: u64) -> u64 {
        self.with_memory(|mem| mem.read_u64(addr)).expect("peek at unmapped memory")
    }

    /// argv as laid out on the initial stack.
    pub fn args(&self) -> Vec<String> {
        let argc = self.peek_u64(self.sp + 8);
        let argv = self.peek_u64(self.sp + 16);
        (0..argc)
            .map(|i| {
                let ptr = self.peek_u64(argv + 8 * i);
                self.with_memory(|mem| mem.read_cstr(ptr, 4096)).ok().flatten().expect("bad argv string")
            })
            .collect()
    }

    /// Copy `bytes` into the scratch segment and return their user address.
    pub fn alloc(&mut self, bytes: &[u8]) -> u64 {
        let at = self.scratch;
        assert!(at + bytes.len() as u64 <= SCRATCH_BASE + SCRATCH_SIZE, "scratch exhausted");
        self.with_memory(|mem| mem.write(at, bytes)).expect("scratch segment unmapped");
        self.scratch = (at + bytes.len() as u64 + 7) & !7;
        at
    }

    pub fn cstr(&mut self, s: &str) -> u64 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.alloc(&bytes)
    }

    pub fn buffer(&mut self, len: usize) -> u64 {
        self.alloc(&vec![0u8; len])
    }

    /// Trap with the stack pointer at `sp`, whatever is there.
    pub fn trap_at(&mut self, sp: u64) -> i64 {
        let mut frame = TrapFrame::at_stack(sp);
        let kernel = self.kernel.clone();
        kernel.handle_trap(&self.process, &mut frame);
        frame.rax as i64
    }

    /// Push `number` and `args` (slot, value) below the stack pointer and trap.
    pub fn syscall(&mut self, number: u64, args: &[(u64, u64)]) -> i64 {
        let sp = self.sp - 0x100;
        self.with_memory(|mem| {
            mem.write(sp, &number.to_le_bytes())?;
            args.iter().try_for_each(|&(index, value)| mem.write(sp + 8 * index, &value.to_le_bytes()))
        })
        .expect("user stack unmapped");
        self.trap_at(sp)
    }

    pub fn halt(&mut self) -> ! {
        self.syscall(syscalls::SYS_HALT, &[]);
        unreachable!("halt returned")
    }

    pub fn exit(&mut self, status: i32) -> ! {
        self.syscall(syscalls::SYS_EXIT, &[(slot::STATUS, status as i64 as u64)]);
        unreachable!("exit returned")
    }

    pub fn exec(&mut self, command_line: &str) -> i64 {
        let ptr = self.cstr(command_line);
        self.syscall(syscalls::SYS_EXEC, &[(slot::CMD_LINE, ptr)])
    }

    pub fn wait(&mut self, pid: i64) -> i64 {
        self.syscall(syscalls::SYS_WAIT, &[(slot::PID, pid as u64)])
    }

    pub fn create(&mut self, name: &str, size: u32) -> bool {
        let ptr = self.cstr(name);
        self.syscall(syscalls::SYS_CREATE, &[(slot::CREATE_NAME, ptr), (slot::CREATE_SIZE, size as u64)]) == 1
    }

    pub fn open(&mut self, name: &str) -> i64 {
        let ptr = self.cstr(name);
        self.syscall(syscalls::SYS_OPEN, &[(slot::NAME, ptr)])
    }

    pub fn filesize(&mut self, fd: i64) -> i64 {
        self.syscall(syscalls::SYS_FILESIZE, &[(slot::FD, fd as u64)])
    }

    pub fn read(&mut self, fd: i64, buffer: u64, len: u32) -> i64 {
        self.syscall(
            syscalls::SYS_READ,
            &[(slot::IO_FD, fd as u64), (slot::IO_BUFFER, buffer), (slot::IO_LENGTH, len as u64)],
        )
    }

    pub fn write(&mut self, fd: i64, buffer: u64, len: u32) -> i64 {
        self.syscall(
            syscalls::SYS_WRITE,
            &[(slot::IO_FD, fd as u64), (slot::IO_BUFFER, buffer), (slot::IO_LENGTH, len as u64)],
        )
    }

    pub fn print(&mut self, s: &str) -> i64 {
        let ptr = self.alloc(s.as_bytes());
        self.write(1, ptr, s.len() as u32)
    }

    pub fn close(&mut self, fd: i64) {
        self.syscall(syscalls::SYS_CLOSE, &[(slot::FD, fd as u64)]);
    }
}

// ──────────────────────────────────────────────────────────────
//  Executables
// ──────────────────────────────────────────────────────────────

pub struct Segment {
    p_type: u32,
    flags: u32,
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

impl Segment {
    pub fn text(vaddr: u64, code: &[u8]) -> Self {
        let flags = (SegmentFlags::READ | SegmentFlags::EXECUTE).bits();
        Segment { p_type: PT_LOAD, flags, vaddr, data: code.to_vec(), memsz: code.len() as u64 }
    }

    pub fn data(vaddr: u64, init: &[u8], memsz: u64) -> Self {
        let flags = (SegmentFlags::READ | SegmentFlags::WRITE).bits();
        Segment { p_type: PT_LOAD, flags, vaddr, data: init.to_vec(), memsz }
    }

    pub fn raw(p_type: u32, flags: u32, vaddr: u64, file_len: usize, memsz: u64) -> Self {
        Segment { p_type, flags, vaddr, data: vec![0u8; file_len], memsz }
    }
}

/// Writes small ELF64 x86_64 executables: a text segment, a writable
/// scratch segment and whatever else a test adds.
pub struct ElfBuilder {
    entry: u64,
    text: Segment,
    extra: Vec<Segment>,
}

impl ElfBuilder {
    pub fn new(entry: u64) -> Self {
        ElfBuilder {
            entry,
            text: Segment::text(TEXT_BASE, &[0xC3]),
            extra: vec![Segment::data(SCRATCH_BASE, &[], SCRATCH_SIZE)],
        }
    }

    pub fn text(mut self, vaddr: u64, code: &[u8]) -> Self {
        self.text = Segment::text(vaddr, code);
        self
    }

    pub fn segment(mut self, segment: Segment) -> Self {
        self.extra.push(segment);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let segments: Vec<&Segment> = std::iter::once(&self.text).chain(self.extra.iter()).collect();
        let headers_end = EHDR_SIZE + PHDR_SIZE * segments.len();
        let mut image = vec![0u8; headers_end];

        image[0..4].copy_from_slice(b"\x7FELF");
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // little endian
        image[6] = 1; // EV_CURRENT
        put(&mut image, 16, &2u16.to_le_bytes()); // ET_EXEC
        put(&mut image, 18, &62u16.to_le_bytes()); // EM_X86_64
        put(&mut image, 20, &1u32.to_le_bytes());
        put(&mut image, 24, &self.entry.to_le_bytes());
        put(&mut image, 32, &(EHDR_SIZE as u64).to_le_bytes());
        put(&mut image, 52, &(EHDR_SIZE as u16).to_le_bytes());
        put(&mut image, 54, &(PHDR_SIZE as u16).to_le_bytes());
        put(&mut image, 56, &(segments.len() as u16).to_le_bytes());

        // File data goes page by page after the headers, at the same page
        // offset as the segment's address.
        let mut cursor = round_up_to_page(headers_end as u64);
        for (i, segment) in segments.iter().enumerate() {
            let offset = if segment.data.is_empty() {
                page_offset(segment.vaddr)
            } else {
                let offset = cursor + page_offset(segment.vaddr);
                cursor = round_up_to_page(offset + segment.data.len() as u64);
                let end = offset as usize + segment.data.len();
                if image.len() < end {
                    image.resize(end, 0);
                }
                image[offset as usize..end].copy_from_slice(&segment.data);
                offset
            };

            let at = EHDR_SIZE + PHDR_SIZE * i;
            put(&mut image, at, &segment.p_type.to_le_bytes());
            put(&mut image, at + 4, &segment.flags.to_le_bytes());
            put(&mut image, at + 8, &offset.to_le_bytes());
            put(&mut image, at + 16, &segment.vaddr.to_le_bytes());
            put(&mut image, at + 24, &segment.vaddr.to_le_bytes());
            put(&mut image, at + 32, &(segment.data.len() as u64).to_le_bytes());
            put(&mut image, at + 40, &segment.memsz.to_le_bytes());
            put(&mut image, at + 48, &PAGE_SIZE.to_le_bytes());
        }
        image
    }
}

fn put(image: &mut [u8], at: usize, bytes: &[u8]) {
    image[at..at + bytes.len()].copy_from_slice(bytes);
}

// ──────────────────────────────────────────────────────────────
//  Harness
// ──────────────────────────────────────────────────────────────

/// A kernel wired to the host stand-ins.
pub struct Harness {
    pub kernel: Arc<Kernel>,
    pub fs: RamFs,
    pub frames: Arc<FramePool>,
    pub mmu: Arc<SoftMmu>,
    pub threads: Arc<HostThreads>,
    pub cpu: Arc<Cpu>,
    pub console: Arc<BufferConsole>,
    next_program: AtomicU64,
}

impl Harness {
    pub fn new() -> Self {
        Harness::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        serial::set_sink(&STDERR_SINK);
        let frames = Arc::new(FramePool::new(PhysAddr::new(0x100_0000), 1024));
        let mmu = Arc::new(SoftMmu::new(frames.clone()));
        let threads = Arc::new(HostThreads::new(2));
        let cpu = Arc::new(Cpu::default());
        let console = Arc::new(BufferConsole::default());
        let fs = RamFs::new();
        let kernel = Kernel::new(
            Services {
                threads: threads.clone(),
                mmu: mmu.clone(),
                frames: frames.clone(),
                machine: cpu.clone(),
                console: console.clone(),
                files: Box::new(fs.clone()),
            },
            config,
        );
        Harness { kernel, fs, frames, mmu, threads, cpu, console, next_program: AtomicU64::new(0) }
    }

    /// Make `program` runnable as the executable `name`.
    pub fn install<F>(&self, name: &str, program: F)
    where
        F: Fn(&mut UserCtx) -> i32 + Send + Sync + 'static,
    {
        let entry = TEXT_BASE + 0x10 * self.next_program.fetch_add(1, Ordering::SeqCst);
        self.cpu.install(entry, Arc::new(program));
        self.fs.add_file(name, &ElfBuilder::new(entry).build()).unwrap();
    }

    /// The kernel thread that spawns the first user program.
    pub fn boot(&self) -> Arc<Process> {
        self.kernel.boot_process(ProcessId(1), "main")
    }

    pub fn output(&self) -> String {
        self.console.output()
    }

    /// Join every process thread and fail on any panic inside one.
    pub fn finish(&self) {
        let mut failures = self.threads.join_all();
        failures.extend(self.cpu.failures());
        assert!(failures.is_empty(), "panics in process threads: {:?}", failures);
    }
}
