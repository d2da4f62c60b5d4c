//! Fixed-layout codecs for the on-disk ELF records.
//!
//! Each record type (file header, program header, section header, symbol
//! entry, REL/RELA entry) gets a symmetric decode/encode pair parameterized
//! by wordsize and endianness. Round-trips are exact: reserved and padding
//! bytes are zeroed deterministically on encode, never left as garbage.
//!
//! The one machine-dependent layout is the MIPS ELF64 RELA entry, which
//! splits `r_info` into `(r_sym, r_ssym, r_type3, r_type2, r_type)` instead
//! of a single 64-bit word.

use crate::bytes::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use crate::elf::*;
use crate::error::{ElfError, Result};

// ── Record sizes ─────────────────────────────────────────────────────────────

pub fn ehdr_size(w: Wordsize) -> usize {
    match w {
        Wordsize::Elf32 => 52,
        Wordsize::Elf64 => 64,
    }
}

pub fn phdr_size(w: Wordsize) -> usize {
    match w {
        Wordsize::Elf32 => 32,
        Wordsize::Elf64 => 56,
    }
}

pub fn shdr_size(w: Wordsize) -> usize {
    match w {
        Wordsize::Elf32 => 40,
        Wordsize::Elf64 => 64,
    }
}

pub fn sym_size(w: Wordsize) -> usize {
    match w {
        Wordsize::Elf32 => 16,
        Wordsize::Elf64 => 24,
    }
}

pub fn rel_size(w: Wordsize) -> usize {
    match w {
        Wordsize::Elf32 => 8,
        Wordsize::Elf64 => 16,
    }
}

pub fn rela_size(w: Wordsize) -> usize {
    match w {
        Wordsize::Elf32 => 12,
        Wordsize::Elf64 => 24,
    }
}

// ── ELF file header ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElfHeader {
    pub wordsize: Wordsize,
    pub endian: Endian,
    pub e_type: u16,
    pub machine: u16,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub phnum: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

impl ElfHeader {
    /// Decode and validate the identification bytes plus fixed fields.
    /// Fails fast with a message naming the offending file.
    pub fn decode(data: &[u8], filename: &str) -> Result<ElfHeader> {
        let malformed = |reason: &str| ElfError::Malformed {
            file: filename.to_string(),
            reason: reason.to_string(),
        };
        if data.len() < 52 {
            return Err(malformed("too small for ELF header"));
        }
        if data[0..4] != ELF_MAGIC {
            return Err(malformed("not an ELF file"));
        }
        let wordsize = Wordsize::from_ei_class(data[4])
            .ok_or_else(|| malformed("unsupported ELF class"))?;
        let endian = Endian::from_ei_data(data[5])
            .ok_or_else(|| malformed("unsupported data encoding"))?;
        if data[6] != EV_CURRENT {
            return Err(malformed("unsupported ELF version"));
        }
        if wordsize == Wordsize::Elf64 && data.len() < 64 {
            return Err(malformed("too small for ELF64 header"));
        }

        let e = endian;
        let hdr = match wordsize {
            Wordsize::Elf32 => ElfHeader {
                wordsize,
                endian,
                e_type: read_u16(data, 16, e),
                machine: read_u16(data, 18, e),
                entry: read_u32(data, 24, e) as u64,
                phoff: read_u32(data, 28, e) as u64,
                shoff: read_u32(data, 32, e) as u64,
                flags: read_u32(data, 36, e),
                phnum: read_u16(data, 44, e),
                shnum: read_u16(data, 48, e),
                shstrndx: read_u16(data, 50, e),
            },
            Wordsize::Elf64 => ElfHeader {
                wordsize,
                endian,
                e_type: read_u16(data, 16, e),
                machine: read_u16(data, 18, e),
                entry: read_u64(data, 24, e),
                phoff: read_u64(data, 32, e),
                shoff: read_u64(data, 40, e),
                flags: read_u32(data, 48, e),
                phnum: read_u16(data, 56, e),
                shnum: read_u16(data, 60, e),
                shstrndx: read_u16(data, 62, e),
            },
        };
        Ok(hdr)
    }

    pub fn encode(&self) -> Vec<u8> {
        let w = self.wordsize;
        let e = self.endian;
        let mut out = Vec::with_capacity(ehdr_size(w));
        out.extend_from_slice(&ELF_MAGIC);
        out.push(w.ei_class());
        out.push(e.ei_data());
        out.push(EV_CURRENT);
        // EI_OSABI, EI_ABIVERSION and padding are zero
        out.resize(16, 0);
        write_u16(&mut out, self.e_type, e);
        write_u16(&mut out, self.machine, e);
        write_u32(&mut out, EV_CURRENT as u32, e);
        match w {
            Wordsize::Elf32 => {
                write_u32(&mut out, self.entry as u32, e);
                write_u32(&mut out, self.phoff as u32, e);
                write_u32(&mut out, self.shoff as u32, e);
            }
            Wordsize::Elf64 => {
                write_u64(&mut out, self.entry, e);
                write_u64(&mut out, self.phoff, e);
                write_u64(&mut out, self.shoff, e);
            }
        }
        write_u32(&mut out, self.flags, e);
        write_u16(&mut out, ehdr_size(w) as u16, e);
        write_u16(&mut out, if self.phnum > 0 { phdr_size(w) as u16 } else { 0 }, e);
        write_u16(&mut out, self.phnum, e);
        write_u16(&mut out, shdr_size(w) as u16, e);
        write_u16(&mut out, self.shnum, e);
        write_u16(&mut out, self.shstrndx, e);
        out
    }
}

// ── Program header ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl ProgramHeader {
    pub fn decode(data: &[u8], w: Wordsize, e: Endian) -> Result<ProgramHeader> {
        if data.len() < phdr_size(w) {
            return Err(ElfError::OutOfRange { offset: 0, len: phdr_size(w), size: data.len() });
        }
        let ph = match w {
            Wordsize::Elf32 => ProgramHeader {
                p_type: read_u32(data, 0, e),
                offset: read_u32(data, 4, e) as u64,
                vaddr: read_u32(data, 8, e) as u64,
                paddr: read_u32(data, 12, e) as u64,
                filesz: read_u32(data, 16, e) as u64,
                memsz: read_u32(data, 20, e) as u64,
                flags: read_u32(data, 24, e),
                align: read_u32(data, 28, e) as u64,
            },
            Wordsize::Elf64 => ProgramHeader {
                p_type: read_u32(data, 0, e),
                flags: read_u32(data, 4, e),
                offset: read_u64(data, 8, e),
                vaddr: read_u64(data, 16, e),
                paddr: read_u64(data, 24, e),
                filesz: read_u64(data, 32, e),
                memsz: read_u64(data, 40, e),
                align: read_u64(data, 48, e),
            },
        };
        Ok(ph)
    }

    pub fn encode(&self, w: Wordsize, e: Endian) -> Vec<u8> {
        let mut out = Vec::with_capacity(phdr_size(w));
        match w {
            Wordsize::Elf32 => {
                write_u32(&mut out, self.p_type, e);
                write_u32(&mut out, self.offset as u32, e);
                write_u32(&mut out, self.vaddr as u32, e);
                write_u32(&mut out, self.paddr as u32, e);
                write_u32(&mut out, self.filesz as u32, e);
                write_u32(&mut out, self.memsz as u32, e);
                write_u32(&mut out, self.flags, e);
                write_u32(&mut out, self.align as u32, e);
            }
            Wordsize::Elf64 => {
                write_u32(&mut out, self.p_type, e);
                write_u32(&mut out, self.flags, e);
                write_u64(&mut out, self.offset, e);
                write_u64(&mut out, self.vaddr, e);
                write_u64(&mut out, self.paddr, e);
                write_u64(&mut out, self.filesz, e);
                write_u64(&mut out, self.memsz, e);
                write_u64(&mut out, self.align, e);
            }
        }
        out
    }
}

// ── Section header ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: u32,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

impl SectionHeader {
    pub fn decode(data: &[u8], w: Wordsize, e: Endian) -> Result<SectionHeader> {
        if data.len() < shdr_size(w) {
            return Err(ElfError::OutOfRange { offset: 0, len: shdr_size(w), size: data.len() });
        }
        let sh = match w {
            Wordsize::Elf32 => SectionHeader {
                name: read_u32(data, 0, e),
                sh_type: read_u32(data, 4, e),
                flags: read_u32(data, 8, e) as u64,
                addr: read_u32(data, 12, e) as u64,
                offset: read_u32(data, 16, e) as u64,
                size: read_u32(data, 20, e) as u64,
                link: read_u32(data, 24, e),
                info: read_u32(data, 28, e),
                addralign: read_u32(data, 32, e) as u64,
                entsize: read_u32(data, 36, e) as u64,
            },
            Wordsize::Elf64 => SectionHeader {
                name: read_u32(data, 0, e),
                sh_type: read_u32(data, 4, e),
                flags: read_u64(data, 8, e),
                addr: read_u64(data, 16, e),
                offset: read_u64(data, 24, e),
                size: read_u64(data, 32, e),
                link: read_u32(data, 40, e),
                info: read_u32(data, 44, e),
                addralign: read_u64(data, 48, e),
                entsize: read_u64(data, 56, e),
            },
        };
        Ok(sh)
    }

    pub fn encode(&self, w: Wordsize, e: Endian) -> Vec<u8> {
        let mut out = Vec::with_capacity(shdr_size(w));
        match w {
            Wordsize::Elf32 => {
                write_u32(&mut out, self.name, e);
                write_u32(&mut out, self.sh_type, e);
                write_u32(&mut out, self.flags as u32, e);
                write_u32(&mut out, self.addr as u32, e);
                write_u32(&mut out, self.offset as u32, e);
                write_u32(&mut out, self.size as u32, e);
                write_u32(&mut out, self.link, e);
                write_u32(&mut out, self.info, e);
                write_u32(&mut out, self.addralign as u32, e);
                write_u32(&mut out, self.entsize as u32, e);
            }
            Wordsize::Elf64 => {
                write_u32(&mut out, self.name, e);
                write_u32(&mut out, self.sh_type, e);
                write_u64(&mut out, self.flags, e);
                write_u64(&mut out, self.addr, e);
                write_u64(&mut out, self.offset, e);
                write_u64(&mut out, self.size, e);
                write_u32(&mut out, self.link, e);
                write_u32(&mut out, self.info, e);
                write_u64(&mut out, self.addralign, e);
                write_u64(&mut out, self.entsize, e);
            }
        }
        out
    }
}

// ── Symbol table entry ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: u32,
    pub value: u64,
    pub size: u64,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
}

impl SymbolEntry {
    pub fn binding(&self) -> u8 {
        self.info >> 4
    }

    pub fn sym_type(&self) -> u8 {
        self.info & 0xf
    }

    pub fn decode(data: &[u8], w: Wordsize, e: Endian) -> Result<SymbolEntry> {
        if data.len() < sym_size(w) {
            return Err(ElfError::OutOfRange { offset: 0, len: sym_size(w), size: data.len() });
        }
        let sym = match w {
            Wordsize::Elf32 => SymbolEntry {
                name: read_u32(data, 0, e),
                value: read_u32(data, 4, e) as u64,
                size: read_u32(data, 8, e) as u64,
                info: data[12],
                other: data[13],
                shndx: read_u16(data, 14, e),
            },
            Wordsize::Elf64 => SymbolEntry {
                name: read_u32(data, 0, e),
                info: data[4],
                other: data[5],
                shndx: read_u16(data, 6, e),
                value: read_u64(data, 8, e),
                size: read_u64(data, 16, e),
            },
        };
        Ok(sym)
    }

    pub fn encode(&self, w: Wordsize, e: Endian) -> Vec<u8> {
        let mut out = Vec::with_capacity(sym_size(w));
        match w {
            Wordsize::Elf32 => {
                write_u32(&mut out, self.name, e);
                write_u32(&mut out, self.value as u32, e);
                write_u32(&mut out, self.size as u32, e);
                out.push(self.info);
                out.push(self.other);
                write_u16(&mut out, self.shndx, e);
            }
            Wordsize::Elf64 => {
                write_u32(&mut out, self.name, e);
                out.push(self.info);
                out.push(self.other);
                write_u16(&mut out, self.shndx, e);
                write_u64(&mut out, self.value, e);
                write_u64(&mut out, self.size, e);
            }
        }
        out
    }
}

// ── Relocation entries ───────────────────────────────────────────────────────

/// A raw REL/RELA record. `addend` is `None` for REL entries (the addend
/// lives in the instruction word).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelocEntry {
    pub offset: u64,
    pub sym_index: u32,
    pub reloc_type: u32,
    pub addend: Option<i64>,
}

impl RelocEntry {
    pub fn decode(data: &[u8], w: Wordsize, e: Endian, machine: u16, rela: bool) -> Result<RelocEntry> {
        let want = if rela { rela_size(w) } else { rel_size(w) };
        if data.len() < want {
            return Err(ElfError::OutOfRange { offset: 0, len: want, size: data.len() });
        }
        let entry = match w {
            Wordsize::Elf32 => {
                let offset = read_u32(data, 0, e) as u64;
                let info = read_u32(data, 4, e);
                let addend = if rela { Some(read_u32(data, 8, e) as i32 as i64) } else { None };
                RelocEntry {
                    offset,
                    sym_index: info >> 8,
                    reloc_type: info & 0xff,
                    addend,
                }
            }
            Wordsize::Elf64 if machine == EM_MIPS => {
                // MIPS64 splits r_info into five sub-fields.
                let offset = read_u64(data, 0, e);
                let sym = read_u32(data, 8, e);
                let r_type = data[15] as u32 | (data[14] as u32) << 8 | (data[13] as u32) << 16;
                let addend = if rela { Some(read_u64(data, 16, e) as i64) } else { None };
                RelocEntry { offset, sym_index: sym, reloc_type: r_type, addend }
            }
            Wordsize::Elf64 => {
                let offset = read_u64(data, 0, e);
                let info = read_u64(data, 8, e);
                let addend = if rela { Some(read_u64(data, 16, e) as i64) } else { None };
                RelocEntry {
                    offset,
                    sym_index: (info >> 32) as u32,
                    reloc_type: info as u32,
                    addend,
                }
            }
        };
        Ok(entry)
    }

    pub fn encode(&self, w: Wordsize, e: Endian, machine: u16) -> Vec<u8> {
        let mut out = Vec::new();
        match w {
            Wordsize::Elf32 => {
                write_u32(&mut out, self.offset as u32, e);
                write_u32(&mut out, (self.sym_index << 8) | (self.reloc_type & 0xff), e);
                if let Some(a) = self.addend {
                    write_u32(&mut out, a as u32, e);
                }
            }
            Wordsize::Elf64 if machine == EM_MIPS => {
                write_u64(&mut out, self.offset, e);
                write_u32(&mut out, self.sym_index, e);
                out.push(0); // r_ssym
                out.push((self.reloc_type >> 16) as u8); // r_type3
                out.push((self.reloc_type >> 8) as u8); // r_type2
                out.push(self.reloc_type as u8); // r_type
                if let Some(a) = self.addend {
                    write_u64(&mut out, a as u64, e);
                }
            }
            Wordsize::Elf64 => {
                write_u64(&mut out, self.offset, e);
                write_u64(&mut out, ((self.sym_index as u64) << 32) | self.reloc_type as u64, e);
                if let Some(a) = self.addend {
                    write_u64(&mut out, a as u64, e);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ehdr_roundtrip_elf32_be() {
        let hdr = ElfHeader {
            wordsize: Wordsize::Elf32,
            endian: Endian::Big,
            e_type: ET_EXEC,
            machine: EM_MIPS,
            entry: 0x8000_0000,
            phoff: 52,
            shoff: 0x200,
            flags: 0x1000,
            phnum: 2,
            shnum: 5,
            shstrndx: 4,
        };
        let bytes = hdr.encode();
        assert_eq!(bytes.len(), 52);
        let back = ElfHeader::decode(&bytes, "test").unwrap();
        assert_eq!(back, hdr);
    }

    #[test]
    fn ehdr_rejects_bad_magic_and_class() {
        let mut bytes = ElfHeader {
            wordsize: Wordsize::Elf64,
            endian: Endian::Little,
            e_type: ET_REL,
            machine: EM_X86_64,
            entry: 0,
            phoff: 0,
            shoff: 64,
            flags: 0,
            phnum: 0,
            shnum: 3,
            shstrndx: 2,
        }
        .encode();
        bytes[0] = 0x7e;
        let err = ElfHeader::decode(&bytes, "bad.o").unwrap_err();
        assert!(err.to_string().contains("bad.o"));
        bytes[0] = 0x7f;
        bytes[4] = 9;
        assert!(ElfHeader::decode(&bytes, "bad.o").is_err());
    }

    #[test]
    fn phdr_shdr_roundtrip_elf64() {
        let ph = ProgramHeader {
            p_type: PT_LOAD,
            flags: 5,
            offset: 0x1000,
            vaddr: 0x40_0000,
            paddr: 0x40_0000,
            filesz: 0x234,
            memsz: 0x334,
            align: 0x1000,
        };
        let bytes = ph.encode(Wordsize::Elf64, Endian::Little);
        assert_eq!(bytes.len(), 56);
        assert_eq!(ProgramHeader::decode(&bytes, Wordsize::Elf64, Endian::Little).unwrap(), ph);

        let sh = SectionHeader {
            name: 27,
            sh_type: SHT_PROGBITS,
            flags: 6,
            addr: 0x40_1000,
            offset: 0x1000,
            size: 0x40,
            link: 0,
            info: 0,
            addralign: 16,
            entsize: 0,
        };
        let bytes = sh.encode(Wordsize::Elf64, Endian::Little);
        assert_eq!(bytes.len(), 64);
        assert_eq!(SectionHeader::decode(&bytes, Wordsize::Elf64, Endian::Little).unwrap(), sh);
    }

    #[test]
    fn sym_layouts_differ_between_wordsizes() {
        let sym = SymbolEntry {
            name: 1,
            value: 0x1234,
            size: 8,
            info: (STB_GLOBAL << 4) | STT_FUNC,
            other: 0,
            shndx: 2,
        };
        let b32 = sym.encode(Wordsize::Elf32, Endian::Little);
        let b64 = sym.encode(Wordsize::Elf64, Endian::Little);
        assert_eq!(b32.len(), 16);
        assert_eq!(b64.len(), 24);
        assert_eq!(SymbolEntry::decode(&b32, Wordsize::Elf32, Endian::Little).unwrap(), sym);
        assert_eq!(SymbolEntry::decode(&b64, Wordsize::Elf64, Endian::Little).unwrap(), sym);
        assert_eq!(sym.binding(), STB_GLOBAL);
        assert_eq!(sym.sym_type(), STT_FUNC);
    }

    #[test]
    fn mips64_rela_packing() {
        let rel = RelocEntry {
            offset: 0x10,
            sym_index: 7,
            reloc_type: 4, // R_MIPS_26
            addend: Some(-8),
        };
        let bytes = rel.encode(Wordsize::Elf64, Endian::Big, EM_MIPS);
        assert_eq!(bytes.len(), 24);
        // r_sym is a plain u32 at offset 8, r_type is the final info byte
        assert_eq!(read_u32(&bytes, 8, Endian::Big), 7);
        assert_eq!(bytes[15], 4);
        let back = RelocEntry::decode(&bytes, Wordsize::Elf64, Endian::Big, EM_MIPS, true).unwrap();
        assert_eq!(back, rel);
    }

    #[test]
    fn rel_entry_roundtrip_elf32() {
        let rel = RelocEntry {
            offset: 0x24,
            sym_index: 3,
            reloc_type: 2,
            addend: None,
        };
        let bytes = rel.encode(Wordsize::Elf32, Endian::Little, EM_ARM);
        assert_eq!(bytes.len(), 8);
        let back = RelocEntry::decode(&bytes, Wordsize::Elf32, Endian::Little, EM_ARM, false).unwrap();
        assert_eq!(back, rel);
    }
}
