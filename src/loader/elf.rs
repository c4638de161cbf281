use bitflags::bitflags;
use core::fmt;

use crate::memory::{is_user_vaddr, page_offset, round_up_to_page, PAGE_SIZE};

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8    = 2;
const ELFDATA2LSB: u8   = 1;
const EV_CURRENT: u8    = 1;
const ET_EXEC: u16      = 2;
const EM_X86_64: u16    = 62;

pub const PT_NULL: u32    = 0;
pub const PT_LOAD: u32    = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32  = 3;
pub const PT_NOTE: u32    = 4;
pub const PT_SHLIB: u32   = 5;
pub const PT_PHDR: u32    = 6;
pub const PT_GNU_STACK: u32 = 0x6474_E551;

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;

bitflags! {
    /// `p_flags` permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1;
        const WRITE   = 2;
        const READ    = 4;
    }
}

// ══════════════════════════════════════════════════════════════
//  LoadError
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    NotFound,
    MalformedImage,
    UnsupportedSegment,
    BadSegment,
    ReadError,
    OutOfMemory,
    TooManyArguments,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadError::NotFound           => write!(f, "open failed"),
            LoadError::MalformedImage     => write!(f, "error loading executable"),
            LoadError::UnsupportedSegment => write!(f, "dynamic or interpreted executable"),
            LoadError::BadSegment         => write!(f, "invalid program segment"),
            LoadError::ReadError          => write!(f, "short read from executable"),
            LoadError::OutOfMemory        => write!(f, "out of memory"),
            LoadError::TooManyArguments   => write!(f, "too many arguments"),
        }
    }
}

// ══════════════════════════════════════════════════════════════
//  ELF64 structures
// ══════════════════════════════════════════════════════════════

fn u16_at(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn u32_at(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn u64_at(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Ehdr {
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_phnum: u16,
}

impl Elf64Ehdr {
    /// Parse and check an executable header. Only little-endian ELF64
    /// executables for x86_64 with standard header sizes get through.
    pub fn parse(data: &[u8; EHDR_SIZE], max_phnum: u16) -> Result<Self, LoadError> {
        if data[0..4] != ELF_MAGIC
            || data[4] != ELFCLASS64
            || data[5] != ELFDATA2LSB
            || data[6] != EV_CURRENT
        {
            return Err(LoadError::MalformedImage);
        }
        let e_type = u16_at(data, 16);
        let e_machine = u16_at(data, 18);
        let e_version = u32_at(data, 20);
        let e_ehsize = u16_at(data, 52);
        let e_phentsize = u16_at(data, 54);
        let e_phnum = u16_at(data, 56);

        if e_type != ET_EXEC || e_machine != EM_X86_64 || e_version != EV_CURRENT as u32 {
            return Err(LoadError::MalformedImage);
        }
        if e_ehsize as usize != EHDR_SIZE || e_phentsize as usize != PHDR_SIZE {
            return Err(LoadError::MalformedImage);
        }
        if e_phnum > max_phnum {
            return Err(LoadError::MalformedImage);
        }

        Ok(Elf64Ehdr {
            e_entry: u64_at(data, 24),
            e_phoff: u64_at(data, 32),
            e_phnum,
        })
    }
}

/// What the loader does with a program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Load,
    Ignore,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: SegmentFlags,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

/// Page-granular plan for one loadable segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    /// File offset of the first byte of the first page.
    pub file_page: u64,
    /// Virtual address of the first page.
    pub mem_page: u64,
    /// Bytes read from the file, starting at `file_page`.
    pub read_bytes: u64,
    /// Zero bytes following them; the two sum to whole pages.
    pub zero_bytes: u64,
    pub writable: bool,
}

impl Elf64Phdr {
    pub fn parse(data: &[u8; PHDR_SIZE]) -> Self {
        Elf64Phdr {
            p_type: u32_at(data, 0),
            p_flags: SegmentFlags::from_bits_truncate(u32_at(data, 4)),
            p_offset: u64_at(data, 8),
            p_vaddr: u64_at(data, 16),
            p_filesz: u64_at(data, 32),
            p_memsz: u64_at(data, 40),
        }
    }

    pub fn kind(&self) -> SegmentKind {
        match self.p_type {
            PT_LOAD => SegmentKind::Load,
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => SegmentKind::Reject,
            PT_NULL | PT_NOTE | PT_PHDR | PT_GNU_STACK => SegmentKind::Ignore,
            _ => SegmentKind::Ignore,
        }
    }

    /// Check a loadable segment against a file of `file_len` bytes.
    pub fn validate(&self, file_len: u64) -> Result<(), LoadError> {
        if page_offset(self.p_offset) != page_offset(self.p_vaddr) {
            return Err(LoadError::BadSegment);
        }
        if self.p_offset > file_len {
            return Err(LoadError::BadSegment);
        }
        if self.p_memsz < self.p_filesz || self.p_memsz == 0 {
            return Err(LoadError::BadSegment);
        }
        let end = self.p_vaddr.checked_add(self.p_memsz).ok_or(LoadError::BadSegment)?;
        if !is_user_vaddr(self.p_vaddr) || !is_user_vaddr(end) {
            return Err(LoadError::BadSegment);
        }
        // Page 0 stays unmapped so null dereferences fault.
        if self.p_vaddr < PAGE_SIZE {
            return Err(LoadError::BadSegment);
        }
        Ok(())
    }

    /// Page layout of a segment that passed [`validate`](Self::validate).
    pub fn layout(&self) -> SegmentLayout {
        let offset = page_offset(self.p_vaddr);
        let span = round_up_to_page(offset + self.p_memsz);
        let read_bytes = if self.p_filesz > 0 { offset + self.p_filesz } else { 0 };
        SegmentLayout {
            file_page: self.p_offset - offset,
            mem_page: self.p_vaddr - offset,
            read_bytes,
            zero_bytes: span - read_bytes,
            writable: self.p_flags.contains(SegmentFlags::WRITE),
        }
    }
}
