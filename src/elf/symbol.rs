//! Editable symbol-table entries.
//!
//! `ElfSymbol` wraps the raw `SymbolEntry` codec with a resolved name and
//! an owning-section reference. Before `update_symbols` runs on the file,
//! `value` is a section-relative offset; afterwards it is the absolute
//! virtual address. COMMON symbols reinterpret `value` as an alignment
//! request until they are allocated storage.

use crate::elf::structures::SymbolEntry;
use crate::elf::{SectionId, SHN_ABS, SHN_COMMON, SHN_LORESERVE, SHN_UNDEF, STB_GLOBAL, STB_LOCAL, STT_NOTYPE};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElfSymbol {
    pub name: String,
    /// Owning section, or none for absolute/undefined/COMMON symbols.
    pub section: Option<SectionId>,
    /// Section-relative offset before `update`, absolute address after.
    pub value: u64,
    pub size: u64,
    pub sym_type: u8,
    pub binding: u8,
    pub visibility: u8,
    /// Raw `st_shndx`; retains the special values (UNDEF/ABS/COMMON).
    pub shndx: u16,
    /// GOT slot assigned during the relocation allocate pass:
    /// (GOT section, byte offset of the slot).
    pub got_slot: Option<(SectionId, u64)>,
    /// Set once `value` has been converted to an absolute address.
    pub updated: bool,
}

impl ElfSymbol {
    /// The reserved null symbol at index 0.
    pub fn null() -> ElfSymbol {
        ElfSymbol {
            name: String::new(),
            section: None,
            value: 0,
            size: 0,
            sym_type: STT_NOTYPE,
            binding: STB_LOCAL,
            visibility: 0,
            shndx: SHN_UNDEF,
            got_slot: None,
            updated: false,
        }
    }

    pub fn new(name: &str, section: Option<SectionId>, value: u64, size: u64, sym_type: u8, binding: u8) -> ElfSymbol {
        let shndx = match section {
            Some(id) => id as u16,
            None => SHN_UNDEF,
        };
        ElfSymbol {
            name: name.to_string(),
            section,
            value,
            size,
            sym_type,
            binding,
            visibility: 0,
            shndx,
            got_slot: None,
            updated: false,
        }
    }

    /// An absolute symbol: no owning section, value is already an address.
    pub fn absolute(name: &str, value: u64) -> ElfSymbol {
        let mut sym = ElfSymbol::new(name, None, value, 0, STT_NOTYPE, STB_GLOBAL);
        sym.shndx = SHN_ABS;
        sym.updated = true;
        sym
    }

    pub fn from_entry(entry: &SymbolEntry, name: String) -> ElfSymbol {
        let section = if entry.shndx != SHN_UNDEF && entry.shndx < SHN_LORESERVE {
            Some(entry.shndx as usize)
        } else {
            None
        };
        ElfSymbol {
            name,
            section,
            value: entry.value,
            size: entry.size,
            sym_type: entry.sym_type(),
            binding: entry.binding(),
            visibility: entry.other & 3,
            shndx: entry.shndx,
            got_slot: None,
            updated: false,
        }
    }

    pub fn is_undefined(&self) -> bool {
        self.section.is_none() && self.shndx == SHN_UNDEF
    }

    pub fn is_common(&self) -> bool {
        self.shndx == SHN_COMMON
    }

    pub fn is_absolute(&self) -> bool {
        self.shndx == SHN_ABS
    }

    pub fn is_defined(&self) -> bool {
        !self.is_undefined() && !self.is_common()
    }

    /// Raw record for serialization; the caller supplies the string-table
    /// offset and the final section index.
    pub fn entry(&self, name_offset: u32) -> SymbolEntry {
        let shndx = match self.section {
            Some(id) => id as u16,
            None => self.shndx,
        };
        SymbolEntry {
            name: name_offset,
            value: self.value,
            size: self.size,
            info: (self.binding << 4) | (self.sym_type & 0xf),
            other: self.visibility,
            shndx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{Endian, Wordsize, STB_GLOBAL, STT_OBJECT};

    #[test]
    fn classification() {
        let undef = ElfSymbol::new("extern_fn", None, 0, 0, STT_NOTYPE, STB_GLOBAL);
        assert!(undef.is_undefined());
        assert!(!undef.is_defined());

        let mut common = ElfSymbol::new("tentative", None, 8, 12, STT_OBJECT, STB_GLOBAL);
        common.shndx = SHN_COMMON;
        assert!(common.is_common());
        assert!(!common.is_defined());

        let abs = ElfSymbol::absolute("_stack_top", 0x9000);
        assert!(abs.is_absolute());
        assert!(abs.is_defined());
    }

    #[test]
    fn entry_roundtrip_preserves_fields() {
        let sym = ElfSymbol::new("main", Some(2), 0x40, 0x20, crate::elf::STT_FUNC, STB_GLOBAL);
        let entry = sym.entry(17);
        assert_eq!(entry.shndx, 2);
        assert_eq!(entry.binding(), STB_GLOBAL);
        let bytes = entry.encode(Wordsize::Elf32, Endian::Little);
        let back = crate::elf::structures::SymbolEntry::decode(&bytes, Wordsize::Elf32, Endian::Little).unwrap();
        let sym2 = ElfSymbol::from_entry(&back, "main".to_string());
        assert_eq!(sym2.section, Some(2));
        assert_eq!(sym2.value, 0x40);
        assert_eq!(sym2.size, 0x20);
    }
}
