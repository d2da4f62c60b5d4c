//! In-memory section model.
//!
//! A section starts unprepared (mutable: content may grow, address may
//! move). `prepare(offset, index, name_offset)` fixes its place in the
//! output file exactly once; after that every mutating call is rejected
//! with a state error. NOBITS sections carry a memory size but no file
//! bytes; `remove_nobits` materializes the implicit zero fill when a flat
//! binary is wanted.

use crate::bytes::{read_u32, ByteArray};
use crate::elf::structures::SectionHeader;
use crate::elf::{Endian, SectionFlags, SectionId, SHT_NOBITS, SHT_NOTE, SHT_STRTAB};
use crate::error::{ElfError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SectionData {
    Bytes(ByteArray),
    /// Memory span with no file content (`.bss` and friends).
    Nobits(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PreparedAt {
    offset: u64,
    index: usize,
    name_offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElfSection {
    pub name: String,
    pub sh_type: u32,
    pub flags: SectionFlags,
    pub addr: u64,
    pub addralign: u64,
    /// Non-owning reference to another section (symtab -> strtab etc.).
    pub link: Option<SectionId>,
    pub info: u32,
    pub entsize: u64,
    data: SectionData,
    prepared: Option<PreparedAt>,
}

/// One entry of a NOTE section: (name, type, descriptor).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Note {
    pub name: String,
    pub note_type: u32,
    pub desc: Vec<u8>,
}

impl ElfSection {
    pub fn new(name: &str, sh_type: u32) -> ElfSection {
        ElfSection {
            name: name.to_string(),
            sh_type,
            flags: SectionFlags::empty(),
            addr: 0,
            addralign: 1,
            link: None,
            info: 0,
            entsize: 0,
            data: SectionData::Bytes(ByteArray::new()),
            prepared: None,
        }
    }

    pub fn new_nobits(name: &str, memsz: u64) -> ElfSection {
        let mut sec = ElfSection::new(name, SHT_NOBITS);
        sec.data = SectionData::Nobits(memsz);
        sec
    }

    pub fn null() -> ElfSection {
        let mut sec = ElfSection::new("", super::SHT_NULL);
        sec.addralign = 0;
        sec
    }

    pub fn is_nobits(&self) -> bool {
        matches!(self.data, SectionData::Nobits(_))
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    /// Byte length of the content; for NOBITS, the declared memory span.
    pub fn get_size(&self) -> u64 {
        match &self.data {
            SectionData::Bytes(b) => b.len() as u64,
            SectionData::Nobits(memsz) => *memsz,
        }
    }

    /// Length this section occupies in the file (zero for NOBITS).
    pub fn file_size(&self) -> u64 {
        match &self.data {
            SectionData::Bytes(b) => b.len() as u64,
            SectionData::Nobits(_) => 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            SectionData::Bytes(b) => b.as_slice(),
            SectionData::Nobits(_) => &[],
        }
    }

    fn check_mutable(&self) -> Result<()> {
        if self.prepared.is_some() {
            return Err(ElfError::AlreadyPrepared("section"));
        }
        Ok(())
    }

    pub fn data_mut(&mut self) -> Result<&mut ByteArray> {
        self.check_mutable()?;
        match &mut self.data {
            SectionData::Bytes(b) => Ok(b),
            SectionData::Nobits(_) => Err(ElfError::InvalidArgument(
                "NOBITS section has no byte content".to_string(),
            )),
        }
    }

    pub fn set_data(&mut self, data: ByteArray) -> Result<()> {
        self.check_mutable()?;
        self.data = SectionData::Bytes(data);
        Ok(())
    }

    pub fn set_nobits(&mut self, memsz: u64) -> Result<()> {
        self.check_mutable()?;
        self.sh_type = SHT_NOBITS;
        self.data = SectionData::Nobits(memsz);
        Ok(())
    }

    /// Append bytes, returning the in-section offset they landed at.
    pub fn append_data(&mut self, bytes: &[u8]) -> Result<u64> {
        self.check_mutable()?;
        match &mut self.data {
            SectionData::Bytes(b) => {
                let offset = b.len() as u64;
                b.append(bytes);
                Ok(offset)
            }
            SectionData::Nobits(memsz) => {
                let offset = *memsz;
                *memsz += bytes.len() as u64;
                Ok(offset)
            }
        }
    }

    /// Grow the section by `len` zero bytes (zero fill for a data section,
    /// a larger span for NOBITS).
    pub fn append_zeros(&mut self, len: u64) -> Result<u64> {
        self.check_mutable()?;
        match &mut self.data {
            SectionData::Bytes(b) => {
                let offset = b.len() as u64;
                b.append_zeros(len as usize);
                Ok(offset)
            }
            SectionData::Nobits(memsz) => {
                let offset = *memsz;
                *memsz += len;
                Ok(offset)
            }
        }
    }

    /// Materialize a NOBITS section's implicit zero fill as explicit bytes.
    pub fn remove_nobits(&mut self) -> Result<()> {
        self.check_mutable()?;
        if let SectionData::Nobits(memsz) = self.data {
            self.sh_type = super::SHT_PROGBITS;
            self.data = SectionData::Bytes(ByteArray::zeroed(memsz as usize));
        }
        Ok(())
    }

    /// Fix file offset, section index, and name offset. One-way: a second
    /// call is a contract violation.
    pub fn prepare(&mut self, offset: u64, index: usize, name_offset: u32) -> Result<()> {
        if self.prepared.is_some() {
            return Err(ElfError::AlreadyPrepared("section"));
        }
        self.prepared = Some(PreparedAt { offset, index, name_offset });
        Ok(())
    }

    pub fn offset(&self) -> Result<u64> {
        self.prepared.map(|p| p.offset).ok_or(ElfError::NotPrepared("section"))
    }

    pub fn index(&self) -> Result<usize> {
        self.prepared.map(|p| p.index).ok_or(ElfError::NotPrepared("section"))
    }

    /// Produce the section header record. Requires a prepared section;
    /// `link` must already be translated to a final section index.
    pub fn header(&self, link: u32) -> Result<SectionHeader> {
        let p = self.prepared.ok_or(ElfError::NotPrepared("section"))?;
        Ok(SectionHeader {
            name: p.name_offset,
            sh_type: self.sh_type,
            flags: self.flags.bits(),
            addr: self.addr,
            offset: p.offset,
            size: self.get_size(),
            link,
            info: self.info,
            addralign: self.addralign,
            entsize: self.entsize,
        })
    }

    /// Decode the (name, type, descriptor) triples of a NOTE section.
    pub fn notes(&self, endian: Endian) -> Result<Vec<Note>> {
        if self.sh_type != SHT_NOTE {
            return Err(ElfError::InvalidArgument(format!(
                "section {} is not a note section",
                self.name
            )));
        }
        let data = self.bytes();
        let mut notes = Vec::new();
        let mut pos = 0usize;
        while pos + 12 <= data.len() {
            let namesz = read_u32(data, pos, endian) as usize;
            let descsz = read_u32(data, pos + 4, endian) as usize;
            let note_type = read_u32(data, pos + 8, endian);
            pos += 12;
            if pos + namesz > data.len() {
                break;
            }
            // namesz counts the trailing NUL
            let name_len = namesz.saturating_sub(1);
            let name = String::from_utf8_lossy(&data[pos..pos + name_len]).into_owned();
            pos += (namesz + 3) & !3;
            if pos + descsz > data.len() {
                break;
            }
            let desc = data[pos..pos + descsz].to_vec();
            pos += (descsz + 3) & !3;
            notes.push(Note { name, note_type, desc });
        }
        Ok(notes)
    }

    /// Append a note triple with 4-byte padding rules.
    pub fn add_note(&mut self, note: &Note, endian: Endian) -> Result<()> {
        if self.sh_type != SHT_NOTE {
            return Err(ElfError::InvalidArgument(format!(
                "section {} is not a note section",
                self.name
            )));
        }
        let data = self.data_mut()?;
        let namesz = note.name.len() + 1;
        let start = data.len();
        data.append_zeros(12);
        data.set_int(start, 4, namesz as u64, endian)?;
        data.set_int(start + 4, 4, note.desc.len() as u64, endian)?;
        data.set_int(start + 8, 4, note.note_type as u64, endian)?;
        data.append(note.name.as_bytes());
        data.append(&[0]);
        let pad = (4 - (namesz % 4)) % 4;
        data.append_zeros(pad);
        data.append(&note.desc);
        let pad = (4 - (note.desc.len() % 4)) % 4;
        data.append_zeros(pad);
        Ok(())
    }
}

/// Convenience constructor for string-table sections built elsewhere.
pub fn strtab_section(name: &str, table: Vec<u8>) -> ElfSection {
    let mut sec = ElfSection::new(name, SHT_STRTAB);
    sec.set_data(ByteArray::from_vec(table)).expect("fresh section is mutable");
    sec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_is_once_only() {
        let mut sec = ElfSection::new(".text", super::super::SHT_PROGBITS);
        sec.prepare(0x100, 1, 1).unwrap();
        assert!(matches!(
            sec.prepare(0x200, 2, 7),
            Err(ElfError::AlreadyPrepared(_))
        ));
        assert_eq!(sec.offset().unwrap(), 0x100);
    }

    #[test]
    fn prepared_section_rejects_mutation() {
        let mut sec = ElfSection::new(".data", super::super::SHT_PROGBITS);
        sec.append_data(&[1, 2, 3]).unwrap();
        sec.prepare(0x40, 2, 9).unwrap();
        assert!(sec.append_data(&[4]).is_err());
        assert!(sec.data_mut().is_err());
    }

    #[test]
    fn nobits_size_and_materialization() {
        let mut sec = ElfSection::new_nobits(".bss", 0x30);
        assert_eq!(sec.get_size(), 0x30);
        assert_eq!(sec.file_size(), 0);
        sec.remove_nobits().unwrap();
        assert!(!sec.is_nobits());
        assert_eq!(sec.get_size(), 0x30);
        assert_eq!(sec.file_size(), 0x30);
        assert!(sec.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn note_roundtrip() {
        let mut sec = ElfSection::new(".note", SHT_NOTE);
        let note = Note {
            name: "elfweave".to_string(),
            note_type: 1,
            desc: vec![0xde, 0xad, 0xbe, 0xef, 0x01],
        };
        sec.add_note(&note, Endian::Little).unwrap();
        let notes = sec.notes(Endian::Little).unwrap();
        assert_eq!(notes, vec![note]);
    }
}
