//! In-memory segment model.
//!
//! Three kinds of segment: section-backed (an ordered list of section ids
//! kept sorted by ascending address), data-backed (a raw blob plus an
//! explicit memory size for BSS-style zero tails), and the program-header
//! table itself. Like sections, segments are unprepared until given a file
//! offset, and immutable afterwards.
//!
//! Section-backed size arithmetic is the core invariant here:
//! `memsz = max(section offset-in-segment + section size)` over all
//! sections, `filesz` the same but excluding NOBITS — the difference is
//! exactly the zero-fill tail a loader must provide.

use crate::bytes::ByteArray;
use crate::elf::section::ElfSection;
use crate::elf::structures::ProgramHeader;
use crate::elf::{SectionId, SegmentFlags, PT_PHDR};
use crate::error::{ElfError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    /// Ordered list of section ids, sorted by ascending section address.
    Sections(Vec<SectionId>),
    /// Raw byte blob; `memsz >= data.len()`, the tail is implicit zeros.
    Data { data: ByteArray, memsz: u64 },
    /// The program-header table itself (PT_PHDR).
    Phdr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PreparedAt {
    offset: u64,
    /// Total program-header-table size; only set for `Phdr` segments.
    phdr_size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElfSegment {
    pub p_type: u32,
    pub vaddr: u64,
    pub paddr: u64,
    pub flags: SegmentFlags,
    pub align: u64,
    /// Sections are not necessarily contiguous in virtual memory; size
    /// calculations must account for internal gaps.
    pub scatter_load: bool,
    kind: SegmentKind,
    prepared: Option<PreparedAt>,
}

impl ElfSegment {
    pub fn new_sectioned(p_type: u32, vaddr: u64, paddr: u64, flags: SegmentFlags, align: u64) -> ElfSegment {
        ElfSegment {
            p_type,
            vaddr,
            paddr,
            flags,
            align,
            scatter_load: false,
            kind: SegmentKind::Sections(Vec::new()),
            prepared: None,
        }
    }

    pub fn new_data(p_type: u32, vaddr: u64, paddr: u64, flags: SegmentFlags, align: u64, data: ByteArray, memsz: u64) -> Result<ElfSegment> {
        if memsz < data.len() as u64 {
            return Err(ElfError::InvalidArgument(format!(
                "segment memsz {:#x} smaller than file size {:#x}",
                memsz,
                data.len()
            )));
        }
        Ok(ElfSegment {
            p_type,
            vaddr,
            paddr,
            flags,
            align,
            scatter_load: false,
            kind: SegmentKind::Data { data, memsz },
            prepared: None,
        })
    }

    pub fn new_phdr(vaddr: u64, paddr: u64, flags: SegmentFlags, align: u64) -> ElfSegment {
        ElfSegment {
            p_type: PT_PHDR,
            vaddr,
            paddr,
            flags,
            align,
            scatter_load: false,
            kind: SegmentKind::Phdr,
            prepared: None,
        }
    }

    pub fn kind(&self) -> &SegmentKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut SegmentKind {
        &mut self.kind
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    pub fn section_ids(&self) -> &[SectionId] {
        match &self.kind {
            SegmentKind::Sections(ids) => ids,
            _ => &[],
        }
    }

    fn check_mutable(&self) -> Result<()> {
        if self.prepared.is_some() {
            return Err(ElfError::AlreadyPrepared("segment"));
        }
        Ok(())
    }

    fn sections_mut(&mut self) -> Result<&mut Vec<SectionId>> {
        match &mut self.kind {
            SegmentKind::Sections(ids) => Ok(ids),
            _ => Err(ElfError::InvalidArgument(
                "segment is not section-backed".to_string(),
            )),
        }
    }

    /// Insert a section id, keeping the list sorted by ascending address.
    pub fn add_section(&mut self, id: SectionId, sections: &[ElfSection]) -> Result<()> {
        self.check_mutable()?;
        let ids = self.sections_mut()?;
        if ids.contains(&id) {
            return Err(ElfError::InvalidArgument(format!(
                "section {} already in segment",
                id
            )));
        }
        ids.push(id);
        ids.sort_by_key(|&i| sections[i].addr);
        Ok(())
    }

    pub fn remove_section(&mut self, id: SectionId) -> Result<()> {
        self.check_mutable()?;
        let ids = self.sections_mut()?;
        match ids.iter().position(|&i| i == id) {
            Some(pos) => {
                ids.remove(pos);
                Ok(())
            }
            None => Err(ElfError::InvalidArgument(format!(
                "section {} not in segment",
                id
            ))),
        }
    }

    pub fn replace_section(&mut self, old: SectionId, new: SectionId, sections: &[ElfSection]) -> Result<()> {
        self.remove_section(old)?;
        self.add_section(new, sections)
    }

    pub fn has_section(&self, id: SectionId) -> bool {
        self.section_ids().contains(&id)
    }

    /// Renumber section ids after a section was removed from the file.
    /// Ids mapped to `None` are dropped from the list.
    pub(crate) fn remap_sections(&mut self, remap: impl Fn(SectionId) -> Option<SectionId>) {
        if let SegmentKind::Sections(ids) = &mut self.kind {
            let mut kept = Vec::with_capacity(ids.len());
            for &id in ids.iter() {
                if let Some(new) = remap(id) {
                    kept.push(new);
                }
            }
            *ids = kept;
        }
    }

    /// Byte offset of a contained section from the segment start.
    fn section_offset(&self, sec: &ElfSection) -> u64 {
        sec.addr - self.vaddr
    }

    pub fn get_memsz(&self, sections: &[ElfSection]) -> u64 {
        match &self.kind {
            SegmentKind::Sections(ids) => ids
                .iter()
                .map(|&i| self.section_offset(&sections[i]) + sections[i].get_size())
                .max()
                .unwrap_or(0),
            SegmentKind::Data { memsz, .. } => *memsz,
            SegmentKind::Phdr => self.prepared.map(|p| p.phdr_size).unwrap_or(0),
        }
    }

    pub fn get_filesz(&self, sections: &[ElfSection]) -> u64 {
        match &self.kind {
            SegmentKind::Sections(ids) => ids
                .iter()
                .filter(|&&i| !sections[i].is_nobits())
                .map(|&i| self.section_offset(&sections[i]) + sections[i].get_size())
                .max()
                .unwrap_or(0),
            SegmentKind::Data { data, .. } => data.len() as u64,
            SegmentKind::Phdr => self.prepared.map(|p| p.phdr_size).unwrap_or(0),
        }
    }

    /// Half-open virtual span `[vaddr, vaddr + memsz)`.
    pub fn get_span(&self, sections: &[ElfSection]) -> (u64, u64) {
        (self.vaddr, self.vaddr + self.get_memsz(sections))
    }

    pub fn contains_vaddr(&self, vaddr: u64, sections: &[ElfSection]) -> bool {
        let (lo, hi) = self.get_span(sections);
        vaddr >= lo && vaddr < hi
    }

    /// Translate a virtual address inside this segment to a physical one.
    /// The delta `paddr - vaddr` is constant over the whole span.
    pub fn vtop(&self, vaddr: u64, sections: &[ElfSection]) -> Result<u64> {
        if !self.contains_vaddr(vaddr, sections) {
            return Err(ElfError::InvalidArgument(format!(
                "virtual address {:#x} not in segment [{:#x}, {:#x})",
                vaddr,
                self.get_span(sections).0,
                self.get_span(sections).1
            )));
        }
        Ok(vaddr.wrapping_add(self.paddr.wrapping_sub(self.vaddr)))
    }

    /// Fix this segment's file offset. For `Phdr` segments use
    /// `prepare_phdr` instead, which also records the table size.
    pub fn prepare(&mut self, offset: u64) -> Result<()> {
        if self.prepared.is_some() {
            return Err(ElfError::AlreadyPrepared("segment"));
        }
        if matches!(self.kind, SegmentKind::Phdr) {
            return Err(ElfError::InvalidArgument(
                "PHDR segment needs prepare_phdr with the table size".to_string(),
            ));
        }
        self.prepared = Some(PreparedAt { offset, phdr_size: 0 });
        Ok(())
    }

    pub fn prepare_phdr(&mut self, offset: u64, phdr_size: u64) -> Result<()> {
        if self.prepared.is_some() {
            return Err(ElfError::AlreadyPrepared("segment"));
        }
        if !matches!(self.kind, SegmentKind::Phdr) {
            return Err(ElfError::InvalidArgument(
                "prepare_phdr on a non-PHDR segment".to_string(),
            ));
        }
        self.prepared = Some(PreparedAt { offset, phdr_size });
        Ok(())
    }

    pub fn offset(&self) -> Result<u64> {
        self.prepared.map(|p| p.offset).ok_or(ElfError::NotPrepared("segment"))
    }

    /// Produce the program-header record for a prepared segment.
    pub fn program_header(&self, sections: &[ElfSection]) -> Result<ProgramHeader> {
        let p = self.prepared.ok_or(ElfError::NotPrepared("segment"))?;
        Ok(ProgramHeader {
            p_type: self.p_type,
            flags: self.flags.bits(),
            offset: p.offset,
            vaddr: self.vaddr,
            paddr: self.paddr,
            filesz: self.get_filesz(sections),
            memsz: self.get_memsz(sections),
            align: self.align,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{SHT_PROGBITS, PT_LOAD};

    fn make_sections() -> Vec<ElfSection> {
        let mut text = ElfSection::new(".text", SHT_PROGBITS);
        text.addr = 0x8000;
        text.append_data(&[0u8; 0x40]).unwrap();
        let mut data = ElfSection::new(".data", SHT_PROGBITS);
        data.addr = 0x8040;
        data.append_data(&[0u8; 0x10]).unwrap();
        let mut bss = ElfSection::new_nobits(".bss", 0x100);
        bss.addr = 0x8050;
        vec![ElfSection::null(), text, data, bss]
    }

    #[test]
    fn memsz_filesz_with_nobits_tail() {
        let sections = make_sections();
        let mut seg = ElfSegment::new_sectioned(PT_LOAD, 0x8000, 0x8000, SegmentFlags::R, 4);
        for id in [1, 2, 3] {
            seg.add_section(id, &sections).unwrap();
        }
        assert_eq!(seg.get_filesz(&sections), 0x50);
        assert_eq!(seg.get_memsz(&sections), 0x150);
        // difference is exactly the NOBITS tail
        assert_eq!(seg.get_memsz(&sections) - seg.get_filesz(&sections), 0x100);
    }

    #[test]
    fn section_list_stays_sorted() {
        let sections = make_sections();
        let mut seg = ElfSegment::new_sectioned(PT_LOAD, 0x8000, 0x8000, SegmentFlags::R, 4);
        seg.add_section(3, &sections).unwrap();
        seg.add_section(1, &sections).unwrap();
        seg.add_section(2, &sections).unwrap();
        assert_eq!(seg.section_ids(), &[1, 2, 3]);
        assert!(seg.add_section(2, &sections).is_err());
        seg.remove_section(2).unwrap();
        assert!(matches!(
            seg.remove_section(2),
            Err(ElfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn vtop_constant_delta_and_range_check() {
        let sections = make_sections();
        let mut seg = ElfSegment::new_sectioned(PT_LOAD, 0x8000, 0xa000_8000, SegmentFlags::R, 4);
        seg.add_section(1, &sections).unwrap();
        let delta = 0xa000_8000u64 - 0x8000;
        for v in [0x8000u64, 0x8004, 0x803f] {
            assert_eq!(seg.vtop(v, &sections).unwrap() - v, delta);
        }
        assert!(seg.vtop(0x8040, &sections).is_err());
        assert!(seg.vtop(0x7fff, &sections).is_err());
    }

    #[test]
    fn prepared_segment_is_immutable() {
        let sections = make_sections();
        let mut seg = ElfSegment::new_sectioned(PT_LOAD, 0x8000, 0x8000, SegmentFlags::R, 4);
        seg.add_section(1, &sections).unwrap();
        seg.prepare(0x1000).unwrap();
        assert!(matches!(seg.prepare(0x2000), Err(ElfError::AlreadyPrepared(_))));
        assert!(seg.add_section(2, &sections).is_err());
        let ph = seg.program_header(&sections).unwrap();
        assert_eq!(ph.offset, 0x1000);
        assert_eq!(ph.p_type, PT_LOAD);
    }

    #[test]
    fn data_segment_memsz_invariant() {
        let blob = ByteArray::from_vec(vec![1, 2, 3, 4]);
        assert!(ElfSegment::new_data(PT_LOAD, 0, 0, SegmentFlags::R, 4, blob.clone(), 2).is_err());
        let seg = ElfSegment::new_data(PT_LOAD, 0, 0, SegmentFlags::R, 4, blob, 16).unwrap();
        assert_eq!(seg.get_filesz(&[]), 4);
        assert_eq!(seg.get_memsz(&[]), 16);
    }

    #[test]
    fn phdr_segment_requires_table_size() {
        let mut seg = ElfSegment::new_phdr(0x8000, 0x8000, SegmentFlags::R, 4);
        assert!(seg.prepare(0x34).is_err());
        seg.prepare_phdr(0x34, 64).unwrap();
        assert_eq!(seg.get_filesz(&[]), 64);
        assert_eq!(seg.get_memsz(&[]), 64);
    }
}
