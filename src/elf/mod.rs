//! Shared ELF types and constants used across the model and link drivers.
//!
//! Provides:
//!
//! - ELF format constants (object types, machines, section/segment types)
//! - `Endian` / `Wordsize` identity enums
//! - `SectionFlags` / `SegmentFlags` bitflag sets
//! - the section, segment, symbol, relocation, and file models

use bitflags::bitflags;

pub mod file;
pub mod reloc;
pub mod section;
pub mod segment;
pub mod structures;
pub mod symbol;

/// Index of a section inside its owning file's section list.
/// Index order is section-header order; 0 is always the null section.
pub type SectionId = usize;

// ── ELF identification ───────────────────────────────────────────────────────

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

pub const ELFCLASS32: u8 = 1;
pub const ELFCLASS64: u8 = 2;

pub const ELFDATA2LSB: u8 = 1;
pub const ELFDATA2MSB: u8 = 2;

pub const EV_CURRENT: u8 = 1;

// ── ELF object types ─────────────────────────────────────────────────────────

pub const ET_NONE: u16 = 0;
pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

// ── Machine types ────────────────────────────────────────────────────────────

pub const EM_386: u16 = 3;
pub const EM_MIPS: u16 = 8;
pub const EM_ARM: u16 = 40;
pub const EM_IA_64: u16 = 50;
pub const EM_X86_64: u16 = 62;

// ── Section header types ─────────────────────────────────────────────────────

pub const SHT_NULL: u32 = 0;
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_HASH: u32 = 5;
pub const SHT_DYNAMIC: u32 = 6;
pub const SHT_NOTE: u32 = 7;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_REL: u32 = 9;
pub const SHT_DYNSYM: u32 = 11;
pub const SHT_GROUP: u32 = 17;

// ── Symbol binding / type / visibility ───────────────────────────────────────

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_FILE: u8 = 4;

pub const STV_DEFAULT: u8 = 0;

// ── Special section indices ──────────────────────────────────────────────────

pub const SHN_UNDEF: u16 = 0;
pub const SHN_LORESERVE: u16 = 0xff00;
pub const SHN_ABS: u16 = 0xfff1;
pub const SHN_COMMON: u16 = 0xfff2;

// ── Program header types ─────────────────────────────────────────────────────

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;
pub const PT_PHDR: u32 = 6;

bitflags! {
    /// Section header flags (`sh_flags`). Stored widened to u64; ELF32
    /// headers truncate on encode.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SectionFlags: u64 {
        const WRITE = 0x1;
        const ALLOC = 0x2;
        const EXECINSTR = 0x4;
        const MERGE = 0x10;
        const STRINGS = 0x20;
        const INFO_LINK = 0x40;
        const GROUP = 0x200;
        const TLS = 0x400;
    }
}

bitflags! {
    /// Program header flags (`p_flags`).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const X = 0x1;
        const W = 0x2;
        const R = 0x4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn ei_data(self) -> u8 {
        match self {
            Endian::Little => ELFDATA2LSB,
            Endian::Big => ELFDATA2MSB,
        }
    }

    pub fn from_ei_data(b: u8) -> Option<Endian> {
        match b {
            ELFDATA2LSB => Some(Endian::Little),
            ELFDATA2MSB => Some(Endian::Big),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wordsize {
    Elf32,
    Elf64,
}

impl Wordsize {
    pub fn ei_class(self) -> u8 {
        match self {
            Wordsize::Elf32 => ELFCLASS32,
            Wordsize::Elf64 => ELFCLASS64,
        }
    }

    pub fn from_ei_class(b: u8) -> Option<Wordsize> {
        match b {
            ELFCLASS32 => Some(Wordsize::Elf32),
            ELFCLASS64 => Some(Wordsize::Elf64),
            _ => None,
        }
    }

    /// Size in bytes of a native address/word.
    pub fn addr_size(self) -> usize {
        match self {
            Wordsize::Elf32 => 4,
            Wordsize::Elf64 => 8,
        }
    }
}
