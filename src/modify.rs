//! Post-link image transforms.
//!
//! These operate on an already-linked file: address-space rewrites
//! (`physical`, `adjust`, `change`), flat-binary extraction, section
//! collapsing, and NOBITS materialization. Each is a small standalone
//! pass over the model; the CLI chains them in argument order.

use log::{debug, info};

use crate::bytes::align_up;
use crate::elf::file::UnpreparedElfFile;
use crate::elf::segment::SegmentKind;
use crate::elf::SectionId;
use crate::error::{ElfError, Result};

/// Address fields the `adjust`/`change` transforms may touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrField {
    Entry,
    Vaddr,
    Paddr,
}

impl AddrField {
    pub fn parse(name: &str) -> Result<AddrField> {
        match name {
            "entry" => Ok(AddrField::Entry),
            "vaddr" | "virt_addr" => Ok(AddrField::Vaddr),
            "paddr" | "phys_addr" => Ok(AddrField::Paddr),
            other => Err(ElfError::InvalidArgument(format!(
                "unknown address field {:?} (expected entry, vaddr, or paddr)",
                other
            ))),
        }
    }
}

/// Rewrite the image to its physical address view: every segment's
/// vaddr becomes its paddr, and contained sections shift by the same
/// delta so loader-style tools can treat the file as running in place.
pub fn physical(file: &mut UnpreparedElfFile) -> Result<()> {
    for seg_idx in 0..file.segments().len() {
        let seg = &file.segments()[seg_idx];
        let delta = seg.paddr.wrapping_sub(seg.vaddr);
        if delta == 0 {
            continue;
        }
        let ids: Vec<SectionId> = seg.section_ids().to_vec();
        for &id in &ids {
            let sec = file.section_mut(id)?;
            sec.addr = sec.addr.wrapping_add(delta);
        }
        // Absolute symbol values track their section's move.
        for sym in file.symbols_mut().iter_mut() {
            if sym.updated && sym.section.map(|s| ids.contains(&s)).unwrap_or(false) {
                sym.value = sym.value.wrapping_add(delta);
            }
        }
        let seg = &mut file.segments_mut()[seg_idx];
        seg.vaddr = seg.paddr;
        debug!("segment {} shifted by {:#x}", seg_idx, delta);
    }
    Ok(())
}

/// Flatten the image to raw bytes ordered by physical address, zero
/// filling the gaps between segments. NOBITS content contributes no
/// bytes (the loader's zero fill is implicit in a flat image only up to
/// the last real byte).
pub fn binary(file: &UnpreparedElfFile) -> Result<Vec<u8>> {
    struct Chunk {
        paddr: u64,
        bytes: Vec<u8>,
    }
    let mut chunks: Vec<Chunk> = Vec::new();
    for seg in file.segments() {
        match seg.kind() {
            SegmentKind::Data { data, .. } => chunks.push(Chunk {
                paddr: seg.paddr,
                bytes: data.as_slice().to_vec(),
            }),
            SegmentKind::Sections(ids) => {
                for &id in ids {
                    let sec = file.section(id)?;
                    if sec.is_nobits() || sec.get_size() == 0 {
                        continue;
                    }
                    chunks.push(Chunk {
                        paddr: seg.paddr + (sec.addr - seg.vaddr),
                        bytes: sec.bytes().to_vec(),
                    });
                }
            }
            SegmentKind::Phdr => {}
        }
    }
    if chunks.is_empty() {
        return Ok(Vec::new());
    }
    chunks.sort_by_key(|c| c.paddr);
    let start = chunks[0].paddr;
    let end = chunks
        .iter()
        .map(|c| c.paddr + c.bytes.len() as u64)
        .max()
        .unwrap_or(start);
    let mut out = vec![0u8; (end - start) as usize];
    for chunk in chunks {
        let off = (chunk.paddr - start) as usize;
        out[off..off + chunk.bytes.len()].copy_from_slice(&chunk.bytes);
    }
    info!("flat image: {:#x}..{:#x} ({} bytes)", start, end, out.len());
    Ok(out)
}

/// Add `delta` to an address field across the whole image.
pub fn adjust(file: &mut UnpreparedElfFile, field: AddrField, delta: i64) -> Result<()> {
    match field {
        AddrField::Entry => file.entry = file.entry.wrapping_add_signed(delta),
        AddrField::Vaddr => {
            for seg_idx in 0..file.segments().len() {
                let ids: Vec<SectionId> = file.segments()[seg_idx].section_ids().to_vec();
                for id in ids {
                    let sec = file.section_mut(id)?;
                    sec.addr = sec.addr.wrapping_add_signed(delta);
                }
                let seg = &mut file.segments_mut()[seg_idx];
                seg.vaddr = seg.vaddr.wrapping_add_signed(delta);
            }
            for sym in file.symbols_mut().iter_mut() {
                if sym.updated && sym.section.is_some() {
                    sym.value = sym.value.wrapping_add_signed(delta);
                }
            }
        }
        AddrField::Paddr => {
            for seg in file.segments_mut() {
                seg.paddr = seg.paddr.wrapping_add_signed(delta);
            }
        }
    }
    Ok(())
}

/// Replace an address field's value where it equals `old`.
pub fn change(file: &mut UnpreparedElfFile, field: AddrField, old: u64, new: u64) -> Result<()> {
    match field {
        AddrField::Entry => {
            if file.entry == old {
                file.entry = new;
            }
        }
        AddrField::Vaddr => {
            let delta = new.wrapping_sub(old);
            for seg_idx in 0..file.segments().len() {
                if file.segments()[seg_idx].vaddr != old {
                    continue;
                }
                let ids: Vec<SectionId> = file.segments()[seg_idx].section_ids().to_vec();
                for id in ids {
                    let sec = file.section_mut(id)?;
                    sec.addr = sec.addr.wrapping_add(delta);
                }
                file.segments_mut()[seg_idx].vaddr = new;
            }
        }
        AddrField::Paddr => {
            for seg in file.segments_mut() {
                if seg.paddr == old {
                    seg.paddr = new;
                }
            }
        }
    }
    Ok(())
}

/// Collapse every section whose name starts with `prefix` into the
/// first such section, concatenating bytes with alignment padding and
/// keeping symbols and relocations pointing at the survivor.
pub fn merge_sections(file: &mut UnpreparedElfFile, prefix: &str) -> Result<()> {
    let ids: Vec<SectionId> = file
        .sections()
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, s)| s.name.starts_with(prefix))
        .map(|(id, _)| id)
        .collect();
    let (&dst, rest) = match ids.split_first() {
        Some(split) => split,
        None => {
            return Err(ElfError::InvalidArgument(format!(
                "no sections match prefix {:?}",
                prefix
            )))
        }
    };

    let mut absorbed: Vec<(SectionId, u64)> = Vec::new();
    for &old in rest {
        let align = file.section(old)?.addralign.max(1);
        let bytes = file.section(old)?.bytes().to_vec();
        let nobits = file.section(old)?.is_nobits();
        let size = file.section(old)?.get_size();
        let cur = file.section(dst)?.get_size();
        let pad = align_up(cur, align) - cur;
        let offset = if nobits {
            file.section_mut(dst)?.append_zeros(pad + size)? + pad
        } else {
            if pad > 0 {
                file.section_mut(dst)?.append_zeros(pad)?;
            }
            file.section_mut(dst)?.append_data(&bytes)?
        };
        absorbed.push((old, offset));
        debug!("collapsed {} into {}", file.section(old)?.name, file.section(dst)?.name);
    }

    for &(old, offset) in &absorbed {
        for sym in file.symbols_mut().iter_mut() {
            if sym.section == Some(old) {
                sym.section = Some(dst);
                sym.shndx = dst as u16;
                sym.value += offset;
            }
        }
        for table in &mut file.reloc_tables {
            if table.target == old {
                table.target = dst;
                for entry in &mut table.entries {
                    entry.offset += offset;
                }
            }
        }
    }
    let mut old_ids: Vec<SectionId> = absorbed.iter().map(|&(id, _)| id).collect();
    old_ids.sort_unstable();
    for id in old_ids.into_iter().rev() {
        file.remove_section(id)?;
    }
    Ok(())
}

/// Materialize every NOBITS section as explicit zero bytes, so a later
/// flat-binary extraction carries the zero fill.
pub fn remove_nobits(file: &mut UnpreparedElfFile) -> Result<()> {
    for id in 0..file.sections().len() {
        if file.section(id)?.is_nobits() {
            file.section_mut(id)?.remove_nobits()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::section::ElfSection;
    use crate::elf::segment::ElfSegment;
    use crate::elf::symbol::ElfSymbol;
    use crate::elf::{
        Endian, SectionFlags, SegmentFlags, Wordsize, EM_ARM, PT_LOAD, SHT_PROGBITS, STB_GLOBAL,
        STT_FUNC,
    };

    fn linked_image() -> UnpreparedElfFile {
        let mut file = UnpreparedElfFile::new();
        file.machine = EM_ARM;
        file.wordsize = Some(Wordsize::Elf32);
        file.endian = Some(Endian::Little);
        file.entry = 0x8000;

        let mut text = ElfSection::new(".text", SHT_PROGBITS);
        text.flags = SectionFlags::ALLOC | SectionFlags::EXECINSTR;
        text.addr = 0x8000;
        text.addralign = 4;
        text.append_data(&[1, 2, 3, 4]).unwrap();
        let text_id = file.add_section(text);

        let mut seg = ElfSegment::new_sectioned(
            PT_LOAD,
            0x8000,
            0x4000_8000,
            SegmentFlags::R | SegmentFlags::X,
            4,
        );
        seg.add_section(text_id, file.sections()).unwrap();
        file.add_segment(seg);
        file.add_symbol(ElfSymbol::new("_start", Some(text_id), 0, 0, STT_FUNC, STB_GLOBAL));
        file
    }

    #[test]
    fn physical_rewrites_addresses() {
        let mut file = linked_image();
        physical(&mut file).unwrap();
        assert_eq!(file.segments()[0].vaddr, 0x4000_8000);
        let text = file.find_section_named(".text").unwrap();
        assert_eq!(file.section(text).unwrap().addr, 0x4000_8000);
    }

    #[test]
    fn binary_pads_gaps() {
        let mut file = linked_image();
        let mut data = ElfSection::new(".data", SHT_PROGBITS);
        data.flags = SectionFlags::ALLOC | SectionFlags::WRITE;
        data.addr = 0x8010;
        data.append_data(&[9, 9]).unwrap();
        let data_id = file.add_section(data);
        let mut seg = ElfSegment::new_sectioned(PT_LOAD, 0x8010, 0x4000_8010, SegmentFlags::R | SegmentFlags::W, 4);
        seg.add_section(data_id, file.sections()).unwrap();
        file.add_segment(seg);

        let flat = binary(&file).unwrap();
        // 4 text bytes, a 12-byte gap, 2 data bytes.
        assert_eq!(flat.len(), 0x12);
        assert_eq!(&flat[0..4], &[1, 2, 3, 4]);
        assert!(flat[4..0x10].iter().all(|&b| b == 0));
        assert_eq!(&flat[0x10..], &[9, 9]);
    }

    #[test]
    fn adjust_and_change_entry() {
        let mut file = linked_image();
        adjust(&mut file, AddrField::Entry, 0x40).unwrap();
        assert_eq!(file.entry, 0x8040);
        change(&mut file, AddrField::Entry, 0x8040, 0x9000).unwrap();
        assert_eq!(file.entry, 0x9000);
        // change with a non-matching old value is a no-op
        change(&mut file, AddrField::Entry, 0xdead, 0x1).unwrap();
        assert_eq!(file.entry, 0x9000);
    }

    #[test]
    fn adjust_vaddr_moves_sections() {
        let mut file = linked_image();
        adjust(&mut file, AddrField::Vaddr, 0x1000).unwrap();
        assert_eq!(file.segments()[0].vaddr, 0x9000);
        let text = file.find_section_named(".text").unwrap();
        assert_eq!(file.section(text).unwrap().addr, 0x9000);
    }

    #[test]
    fn merge_sections_by_prefix() {
        let mut file = UnpreparedElfFile::new();
        for (name, fill, len) in [(".init.a", 0x11u8, 6usize), (".init.b", 0x22, 4)] {
            let mut sec = ElfSection::new(name, SHT_PROGBITS);
            sec.addralign = 4;
            sec.append_data(&vec![fill; len]).unwrap();
            file.add_section(sec);
        }
        let b = file.find_section_named(".init.b").unwrap();
        file.add_symbol(ElfSymbol::new("b_start", Some(b), 0, 0, STT_FUNC, STB_GLOBAL));

        merge_sections(&mut file, ".init").unwrap();
        let merged = file.find_section_named(".init.a").unwrap();
        // 6 bytes, pad to 8, then 4 more.
        assert_eq!(file.section(merged).unwrap().get_size(), 12);
        assert!(file.find_section_named(".init.b").is_none());
        assert_eq!(file.find_symbol("b_start").unwrap().value, 8);
    }

    #[test]
    fn remove_nobits_materializes() {
        let mut file = linked_image();
        let mut bss = ElfSection::new_nobits(".bss", 8);
        bss.flags = SectionFlags::ALLOC | SectionFlags::WRITE;
        file.add_section(bss);
        remove_nobits(&mut file).unwrap();
        let bss = file.find_section_named(".bss").unwrap();
        assert!(!file.section(bss).unwrap().is_nobits());
        assert_eq!(file.section(bss).unwrap().file_size(), 8);
    }

    #[test]
    fn merge_sections_unknown_prefix_fails() {
        let mut file = linked_image();
        assert!(matches!(
            merge_sections(&mut file, ".nothing"),
            Err(ElfError::InvalidArgument(_))
        ));
    }
}
