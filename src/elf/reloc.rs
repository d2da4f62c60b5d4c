//! Editable relocation entries and tables.
//!
//! A `RelocTable` models one SHT_REL/SHT_RELA section: the target section
//! its entries patch, and the entries themselves with symbol indices into
//! the file's symbol table. Application (the architecture-specific
//! arithmetic) lives in the link driver, which pairs each entry with the
//! machine's registry; this module only carries the data.

use crate::elf::structures::RelocEntry;
use crate::elf::SectionId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElfReloc {
    /// Byte offset to patch, relative to the target section start.
    pub offset: u64,
    pub reloc_type: u32,
    /// Index into the owning file's symbol table.
    pub symbol: usize,
    /// Explicit addend (RELA); REL entries carry the addend in the
    /// instruction word instead.
    pub addend: Option<i64>,
}

impl ElfReloc {
    pub fn from_entry(entry: &RelocEntry) -> ElfReloc {
        ElfReloc {
            offset: entry.offset,
            reloc_type: entry.reloc_type,
            symbol: entry.sym_index as usize,
            addend: entry.addend,
        }
    }

    pub fn entry(&self) -> RelocEntry {
        RelocEntry {
            offset: self.offset,
            sym_index: self.symbol as u32,
            reloc_type: self.reloc_type,
            addend: self.addend,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelocTable {
    /// Section name this table serializes under (".rel.text", ...).
    pub name: String,
    /// The section whose bytes the entries patch.
    pub target: SectionId,
    /// The reloc section itself, once one exists in the file.
    pub section: Option<SectionId>,
    /// RELA (explicit addends) vs REL.
    pub rela: bool,
    pub entries: Vec<ElfReloc>,
}

impl RelocTable {
    pub fn new(name: &str, target: SectionId, rela: bool) -> RelocTable {
        RelocTable {
            name: name.to_string(),
            target,
            section: None,
            rela,
            entries: Vec::new(),
        }
    }
}
