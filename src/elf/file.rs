//! The ELF file model: parse, mutate, prepare, serialize.
//!
//! `UnpreparedElfFile` aggregates sections, segments, and the symbol and
//! relocation tables, all mutable. `prepare(wordsize, endianness)` is the
//! single irreversible transition: it rebuilds the derived sections
//! (.symtab/.strtab/.shstrtab and the relocation tables), walks segments
//! assigning file offsets, and returns an immutable `PreparedElfFile`
//! that can only be serialized. There is no conversion back.
//!
//! Sections are referenced by index into the file's section list
//! (insertion order is section-header order); index 0 is always the
//! reserved null section.

use std::collections::HashMap;
use std::path::Path;

use crate::bytes::{align_congruent, align_up, read_cstr, ByteArray};
use crate::elf::reloc::{ElfReloc, RelocTable};
use crate::elf::section::ElfSection;
use crate::elf::segment::{ElfSegment, SegmentKind};
use crate::elf::structures::*;
use crate::elf::symbol::ElfSymbol;
use crate::elf::*;
use crate::error::{ElfError, Result};
use crate::suffix::{SuffixMatch, SuffixTree};

/// Symbols given storage by `allocate_symbols` even though they are not
/// COMMON: each binds to a well-known section at offset 0.
const SPECIAL_SYMBOLS: &[(&str, &str)] = &[
    ("_GLOBAL_OFFSET_TABLE_", ".got"),
    ("_SDA_BASE_", ".sdata"),
];

#[derive(Debug)]
pub struct UnpreparedElfFile {
    pub elf_type: u16,
    pub machine: u16,
    pub wordsize: Option<Wordsize>,
    pub endian: Option<Endian>,
    pub entry: u64,
    /// Raw `e_flags` (ABI version bits etc.), preserved across a rewrite.
    pub flags: u32,
    sections: Vec<ElfSection>,
    segments: Vec<ElfSegment>,
    symbols: Vec<ElfSymbol>,
    pub reloc_tables: Vec<RelocTable>,
    symtab_section: Option<SectionId>,
    strtab_section: Option<SectionId>,
    shstrtab_section: Option<SectionId>,
    /// The raw image this file was parsed from, if any. `prepare` emits
    /// it verbatim when the model is still structurally identical to it,
    /// so an unmodified file round-trips byte for byte whatever layout
    /// its original producer chose.
    source: Option<Vec<u8>>,
}

impl Default for UnpreparedElfFile {
    fn default() -> Self {
        Self::new()
    }
}

impl UnpreparedElfFile {
    /// An empty file holding only the reserved null section.
    pub fn new() -> UnpreparedElfFile {
        UnpreparedElfFile {
            elf_type: ET_NONE,
            machine: 0,
            wordsize: None,
            endian: None,
            entry: 0,
            flags: 0,
            sections: vec![ElfSection::null()],
            segments: Vec::new(),
            symbols: Vec::new(),
            reloc_tables: Vec::new(),
            symtab_section: None,
            strtab_section: None,
            shstrtab_section: None,
            source: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<UnpreparedElfFile> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data, &path.display().to_string())
    }

    /// Parse raw file bytes into the typed model. Fails fast on
    /// inconsistent header fields, naming the offending file.
    pub fn from_bytes(data: &[u8], filename: &str) -> Result<UnpreparedElfFile> {
        let malformed = |reason: String| ElfError::Malformed {
            file: filename.to_string(),
            reason,
        };
        let hdr = ElfHeader::decode(data, filename)?;
        let w = hdr.wordsize;
        let e = hdr.endian;

        // Section headers
        let shentsize = shdr_size(w);
        let mut shdrs = Vec::with_capacity(hdr.shnum as usize);
        for i in 0..hdr.shnum as usize {
            let off = hdr.shoff as usize + i * shentsize;
            if off + shentsize > data.len() {
                return Err(malformed(format!("section header {} out of range", i)));
            }
            shdrs.push(SectionHeader::decode(&data[off..off + shentsize], w, e)?);
        }

        let shstr = if (hdr.shstrndx as usize) < shdrs.len() {
            let sh = &shdrs[hdr.shstrndx as usize];
            let (start, end) = (sh.offset as usize, (sh.offset + sh.size) as usize);
            if end > data.len() {
                return Err(malformed("section name table out of range".to_string()));
            }
            &data[start..end]
        } else {
            &[][..]
        };

        let mut file = UnpreparedElfFile::new();
        file.elf_type = hdr.e_type;
        file.machine = hdr.machine;
        file.wordsize = Some(w);
        file.endian = Some(e);
        file.entry = hdr.entry;
        file.flags = hdr.flags;
        file.sections.clear();

        for (i, sh) in shdrs.iter().enumerate() {
            let name = if (sh.name as usize) < shstr.len() {
                read_cstr(shstr, sh.name as usize)
            } else {
                String::new()
            };
            let mut sec = if sh.sh_type == SHT_NOBITS {
                ElfSection::new_nobits(&name, sh.size)
            } else if sh.sh_type == SHT_NULL {
                ElfSection::null()
            } else {
                let (start, end) = (sh.offset as usize, (sh.offset + sh.size) as usize);
                if end > data.len() {
                    return Err(malformed(format!("section {} data out of range", name)));
                }
                let mut sec = ElfSection::new(&name, sh.sh_type);
                sec.set_data(ByteArray::from_vec(data[start..end].to_vec()))?;
                sec
            };
            sec.flags = SectionFlags::from_bits_retain(sh.flags);
            sec.addr = sh.addr;
            sec.addralign = sh.addralign;
            sec.link = if sh.link != 0 && (sh.link as usize) < shdrs.len() {
                Some(sh.link as usize)
            } else {
                None
            };
            sec.info = sh.info;
            sec.entsize = sh.entsize;
            if i == hdr.shstrndx as usize && sh.sh_type == SHT_STRTAB {
                file.shstrtab_section = Some(i);
            }
            file.sections.push(sec);
        }
        if file.sections.is_empty() {
            file.sections.push(ElfSection::null());
        }

        file.parse_symtab(w, e)?;
        file.parse_reloc_tables(w, e)?;
        file.parse_segments(data, &hdr, filename)?;
        file.source = Some(data.to_vec());
        Ok(file)
    }

    fn parse_symtab(&mut self, w: Wordsize, e: Endian) -> Result<()> {
        let symtab_id = match self.sections.iter().position(|s| s.sh_type == SHT_SYMTAB) {
            Some(id) => id,
            None => return Ok(()),
        };
        let strtab_id = self.sections[symtab_id].link;
        let strtab: Vec<u8> = strtab_id
            .map(|id| self.sections[id].bytes().to_vec())
            .unwrap_or_default();

        let entsize = sym_size(w);
        let data = self.sections[symtab_id].bytes().to_vec();
        let count = data.len() / entsize;
        for i in 0..count {
            let entry = SymbolEntry::decode(&data[i * entsize..(i + 1) * entsize], w, e)?;
            let name = if (entry.name as usize) < strtab.len() {
                read_cstr(&strtab, entry.name as usize)
            } else {
                String::new()
            };
            self.symbols.push(ElfSymbol::from_entry(&entry, name));
        }
        self.symtab_section = Some(symtab_id);
        self.strtab_section = strtab_id;
        Ok(())
    }

    fn parse_reloc_tables(&mut self, w: Wordsize, e: Endian) -> Result<()> {
        for id in 0..self.sections.len() {
            let sh_type = self.sections[id].sh_type;
            if sh_type != SHT_REL && sh_type != SHT_RELA {
                continue;
            }
            let rela = sh_type == SHT_RELA;
            let entsize = if rela { rela_size(w) } else { rel_size(w) };
            let mut table = RelocTable::new(
                &self.sections[id].name.clone(),
                self.sections[id].info as usize,
                rela,
            );
            table.section = Some(id);
            let data = self.sections[id].bytes().to_vec();
            let count = data.len() / entsize;
            for i in 0..count {
                let entry = RelocEntry::decode(
                    &data[i * entsize..(i + 1) * entsize],
                    w,
                    e,
                    self.machine,
                    rela,
                )?;
                table.entries.push(ElfReloc::from_entry(&entry));
            }
            self.reloc_tables.push(table);
        }
        Ok(())
    }

    fn parse_segments(&mut self, data: &[u8], hdr: &ElfHeader, filename: &str) -> Result<()> {
        let w = hdr.wordsize;
        let e = hdr.endian;
        let entsize = phdr_size(w);
        let mut claimed = vec![false; self.sections.len()];
        for i in 0..hdr.phnum as usize {
            let off = hdr.phoff as usize + i * entsize;
            if off + entsize > data.len() {
                return Err(ElfError::Malformed {
                    file: filename.to_string(),
                    reason: format!("program header {} out of range", i),
                });
            }
            let ph = ProgramHeader::decode(&data[off..off + entsize], w, e)?;
            let flags = SegmentFlags::from_bits_retain(ph.flags);

            if ph.p_type == PT_PHDR {
                self.segments.push(ElfSegment::new_phdr(ph.vaddr, ph.paddr, flags, ph.align));
                continue;
            }

            // Claim allocated sections whose span falls inside this segment.
            let mut ids = Vec::new();
            for (id, sec) in self.sections.iter().enumerate() {
                if claimed[id]
                    || sec.sh_type == SHT_NULL
                    || !sec.flags.contains(SectionFlags::ALLOC)
                {
                    continue;
                }
                if sec.addr >= ph.vaddr && sec.addr + sec.get_size() <= ph.vaddr + ph.memsz {
                    ids.push(id);
                    claimed[id] = true;
                }
            }

            if ids.is_empty() {
                let (start, end) = (ph.offset as usize, (ph.offset + ph.filesz) as usize);
                if end > data.len() {
                    return Err(ElfError::Malformed {
                        file: filename.to_string(),
                        reason: format!("segment {} data out of range", i),
                    });
                }
                let blob = ByteArray::from_vec(data[start..end].to_vec());
                self.segments.push(ElfSegment::new_data(
                    ph.p_type, ph.vaddr, ph.paddr, flags, ph.align, blob, ph.memsz,
                )?);
            } else {
                let mut seg = ElfSegment::new_sectioned(ph.p_type, ph.vaddr, ph.paddr, flags, ph.align);
                for id in ids {
                    seg.add_section(id, &self.sections)?;
                }
                self.segments.push(seg);
            }
        }
        Ok(())
    }

    // ── Section access ───────────────────────────────────────────────────────

    pub fn sections(&self) -> &[ElfSection] {
        &self.sections
    }

    pub fn section(&self, id: SectionId) -> Result<&ElfSection> {
        self.sections
            .get(id)
            .ok_or_else(|| ElfError::InvalidArgument(format!("no section with index {}", id)))
    }

    pub fn section_mut(&mut self, id: SectionId) -> Result<&mut ElfSection> {
        self.sections
            .get_mut(id)
            .ok_or_else(|| ElfError::InvalidArgument(format!("no section with index {}", id)))
    }

    pub fn add_section(&mut self, sec: ElfSection) -> SectionId {
        self.sections.push(sec);
        self.sections.len() - 1
    }

    pub fn find_section_named(&self, name: &str) -> Option<SectionId> {
        self.sections.iter().position(|s| s.name == name)
    }

    pub fn find_or_create_section(&mut self, name: &str, sh_type: u32, flags: SectionFlags, nobits: bool) -> SectionId {
        if let Some(id) = self.find_section_named(name) {
            return id;
        }
        let mut sec = if nobits {
            ElfSection::new_nobits(name, 0)
        } else {
            ElfSection::new(name, sh_type)
        };
        sec.flags = flags;
        sec.addralign = 4;
        self.add_section(sec)
    }

    /// Remove a section, renumbering every reference in the file: segment
    /// membership, link fields, symbol ownership, relocation targets.
    /// Symbols defined in the removed section are dropped, and relocations
    /// referencing those symbols with them — no dangling references remain.
    pub fn remove_section(&mut self, id: SectionId) -> Result<ElfSection> {
        if id == 0 {
            return Err(ElfError::InvalidArgument(
                "cannot remove the null section".to_string(),
            ));
        }
        if id >= self.sections.len() {
            return Err(ElfError::InvalidArgument(format!("no section with index {}", id)));
        }
        let removed = self.sections.remove(id);

        let remap = |old: SectionId| -> Option<SectionId> {
            use std::cmp::Ordering;
            match old.cmp(&id) {
                Ordering::Less => Some(old),
                Ordering::Equal => None,
                Ordering::Greater => Some(old - 1),
            }
        };

        for sec in &mut self.sections {
            sec.link = sec.link.and_then(remap);
        }
        for seg in &mut self.segments {
            seg.remap_sections(remap);
        }
        self.symtab_section = self.symtab_section.and_then(remap);
        self.strtab_section = self.strtab_section.and_then(remap);
        self.shstrtab_section = self.shstrtab_section.and_then(remap);

        // Drop symbols owned by the removed section, remap the rest.
        let mut sym_remap: Vec<Option<usize>> = Vec::with_capacity(self.symbols.len());
        let mut kept: Vec<ElfSymbol> = Vec::with_capacity(self.symbols.len());
        for sym in self.symbols.drain(..) {
            if sym.section == Some(id) {
                sym_remap.push(None);
                continue;
            }
            let mut sym = sym;
            sym.section = sym.section.and_then(remap);
            sym.got_slot = sym.got_slot.and_then(|(gid, off)| remap(gid).map(|g| (g, off)));
            sym_remap.push(Some(kept.len()));
            kept.push(sym);
        }
        self.symbols = kept;

        self.reloc_tables.retain(|t| t.target != id && t.section != Some(id));
        for table in &mut self.reloc_tables {
            table.target = remap(table.target).expect("retained table has live target");
            table.section = table.section.and_then(remap);
            table.entries.retain_mut(|r| match sym_remap.get(r.symbol) {
                Some(Some(new)) => {
                    r.symbol = *new;
                    true
                }
                _ => false,
            });
        }
        Ok(removed)
    }

    /// Append bytes to a section, padding first to `align`. Returns the
    /// in-section offset the bytes landed at.
    pub fn append_section_data(&mut self, dst: SectionId, bytes: &[u8], align: u64) -> Result<u64> {
        let sec = self.section_mut(dst)?;
        let cur = sec.get_size();
        let pad = align_up(cur, align.max(1)) - cur;
        if pad > 0 {
            sec.append_zeros(pad)?;
        }
        sec.append_data(bytes)
    }

    // ── Segment access ───────────────────────────────────────────────────────

    pub fn segments(&self) -> &[ElfSegment] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [ElfSegment] {
        &mut self.segments
    }

    pub fn add_segment(&mut self, seg: ElfSegment) -> usize {
        self.segments.push(seg);
        self.segments.len() - 1
    }

    pub fn segment_add_section(&mut self, seg: usize, sec: SectionId) -> Result<()> {
        let segment = self
            .segments
            .get_mut(seg)
            .ok_or_else(|| ElfError::InvalidArgument(format!("no segment with index {}", seg)))?;
        segment.add_section(sec, &self.sections)
    }

    // ── Symbols ──────────────────────────────────────────────────────────────

    pub fn symbols(&self) -> &[ElfSymbol] {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut Vec<ElfSymbol> {
        &mut self.symbols
    }

    /// Append a symbol, creating the table (with its reserved null entry
    /// at index 0) on first use. Returns the symbol's index.
    pub fn add_symbol(&mut self, sym: ElfSymbol) -> usize {
        if self.symbols.is_empty() {
            self.symbols.push(ElfSymbol::null());
        }
        self.symbols.push(sym);
        self.symbols.len() - 1
    }

    /// Extend the symbol table, keeping the null symbol at index 0.
    pub fn add_symbols(&mut self, syms: Vec<ElfSymbol>) {
        if self.symbols.is_empty() && !syms.is_empty() {
            self.symbols.push(ElfSymbol::null());
        }
        self.symbols.extend(syms);
    }

    /// Symbols owned by one section, with their indices.
    pub fn section_symbols(&self, id: SectionId) -> Vec<(usize, &ElfSymbol)> {
        self.symbols
            .iter()
            .enumerate()
            .filter(|(_, s)| s.section == Some(id))
            .collect()
    }

    /// Exact-name lookup first; otherwise an unambiguous suffix match, the
    /// linker-style rule that lets a short exported name find the tail of
    /// a longer mangled one.
    pub fn find_symbol(&self, name: &str) -> Result<&ElfSymbol> {
        if let Some(sym) = self.symbols.iter().find(|s| s.name == name) {
            return Ok(sym);
        }
        let mut tree = SuffixTree::new();
        for sym in &self.symbols {
            if !sym.name.is_empty() {
                tree.insert(&sym.name);
            }
        }
        match tree.find_suffix(name) {
            SuffixMatch::Unique(full) => self
                .symbols
                .iter()
                .find(|s| s.name == full)
                .ok_or_else(|| ElfError::SymbolNotFound(name.to_string())),
            SuffixMatch::Ambiguous => Err(ElfError::AmbiguousSymbol(name.to_string())),
            SuffixMatch::None => Err(ElfError::SymbolNotFound(name.to_string())),
        }
    }

    /// Reserve storage for COMMON symbols (size bytes in `.bss`, aligned
    /// to the symbol's `value` reinterpreted as an alignment request) and
    /// bind the special linker symbols to their well-known sections.
    pub fn allocate_symbols(&mut self) -> Result<()> {
        for i in 0..self.symbols.len() {
            if self.symbols[i].is_common() {
                let align = self.symbols[i].value.max(1);
                let size = self.symbols[i].size;
                let bss = self.find_or_create_section(
                    ".bss",
                    SHT_NOBITS,
                    SectionFlags::ALLOC | SectionFlags::WRITE,
                    true,
                );
                let cur = self.sections[bss].get_size();
                let offset = align_up(cur, align);
                self.sections[bss].append_zeros(offset - cur + size)?;
                let sym = &mut self.symbols[i];
                sym.section = Some(bss);
                sym.shndx = bss as u16;
                sym.value = offset;
                continue;
            }
            if !self.symbols[i].is_undefined() {
                continue;
            }
            if let Some((_, sec_name)) = SPECIAL_SYMBOLS
                .iter()
                .find(|(n, _)| *n == self.symbols[i].name)
            {
                let id = self.find_or_create_section(
                    sec_name,
                    SHT_PROGBITS,
                    SectionFlags::ALLOC | SectionFlags::WRITE,
                    false,
                );
                let sym = &mut self.symbols[i];
                sym.section = Some(id);
                sym.shndx = id as u16;
                sym.value = 0;
                sym.size = 0;
            }
        }
        Ok(())
    }

    /// Convert section-relative symbol values to absolute addresses now
    /// that sections are placed; fill assigned GOT slots with the result.
    pub fn update_symbols(&mut self) -> Result<()> {
        let endian = self.endian.ok_or_else(|| {
            ElfError::InvalidArgument("endianness not set before symbol update".to_string())
        })?;
        let width = self
            .wordsize
            .ok_or_else(|| ElfError::InvalidArgument("wordsize not set before symbol update".to_string()))?
            .addr_size();
        for i in 0..self.symbols.len() {
            if let Some(id) = self.symbols[i].section {
                if !self.symbols[i].updated {
                    self.symbols[i].value = self.symbols[i].value.wrapping_add(self.sections[id].addr);
                    self.symbols[i].updated = true;
                }
            }
            if let Some((got, slot)) = self.symbols[i].got_slot {
                let value = self.symbols[i].value;
                self.sections[got].data_mut()?.set_int(slot as usize, width, value, endian)?;
            }
        }
        Ok(())
    }

    // ── Patching ─────────────────────────────────────────────────────────────

    /// A virtual address passes through; an address that only falls in a
    /// segment's physical span translates through that segment's
    /// paddr-to-vaddr delta.
    fn resolve_patch_addr(&self, addr: u64) -> u64 {
        if self.segments.iter().any(|s| s.contains_vaddr(addr, &self.sections)) {
            return addr;
        }
        for seg in &self.segments {
            let memsz = seg.get_memsz(&self.sections);
            if seg.paddr != seg.vaddr && addr >= seg.paddr && addr < seg.paddr.wrapping_add(memsz) {
                return addr.wrapping_sub(seg.paddr).wrapping_add(seg.vaddr);
            }
        }
        addr
    }

    /// Burn a build-time constant into an already-linked image: resolve a
    /// physical or virtual address against the segments, find the backing
    /// bytes, and write `value` in `size` bytes.
    pub fn patch(&mut self, addr: u64, size: usize, value: u64) -> Result<()> {
        let endian = self.endian.ok_or_else(|| {
            ElfError::InvalidArgument("endianness not set before patch".to_string())
        })?;
        if size < 8 && value >= 1u64 << (8 * size) {
            return Err(ElfError::PatchFailed {
                addr,
                reason: format!("value {:#x} does not fit in {} bytes", value, size),
            });
        }
        let addr = self.resolve_patch_addr(addr);
        for seg_idx in 0..self.segments.len() {
            if !self.segments[seg_idx].contains_vaddr(addr, &self.sections) {
                continue;
            }
            if matches!(self.segments[seg_idx].kind(), SegmentKind::Sections(_)) {
                let ids: Vec<SectionId> = self.segments[seg_idx].section_ids().to_vec();
                for id in ids {
                    let (sec_addr, sec_size) = (self.sections[id].addr, self.sections[id].get_size());
                    if addr >= sec_addr && addr < sec_addr + sec_size {
                        let offset = (addr - sec_addr) as usize;
                        if self.sections[id].is_nobits() {
                            return Err(ElfError::PatchFailed {
                                addr,
                                reason: format!(
                                    "target section {} has no file content",
                                    self.sections[id].name
                                ),
                            });
                        }
                        return self.sections[id].data_mut()?.set_int(offset, size, value, endian);
                    }
                }
                continue;
            }
            let vaddr = self.segments[seg_idx].vaddr;
            if let SegmentKind::Data { data, .. } = self.segments[seg_idx].kind_mut() {
                let offset = (addr - vaddr) as usize;
                if offset + size <= data.len() {
                    return data.set_int(offset, size, value, endian);
                }
                return Err(ElfError::PatchFailed {
                    addr,
                    reason: "address in zero-fill region".to_string(),
                });
            }
        }
        Err(ElfError::PatchFailed {
            addr,
            reason: "address not covered by any segment".to_string(),
        })
    }

    /// Patch relative to a known section: `section.addr + extra_offset`.
    pub fn patch_in_section(&mut self, id: SectionId, extra_offset: u64, size: usize, value: u64) -> Result<()> {
        let addr = self.section(id)?.addr + extra_offset;
        self.patch(addr, size, value)
    }

    // ── Prepare ──────────────────────────────────────────────────────────────

    /// True when re-parsing the stored source image yields exactly this
    /// model, meaning nothing has been mutated since parsing.
    fn matches_source(&self) -> bool {
        let src = match &self.source {
            Some(src) => src,
            None => return false,
        };
        let parsed = match UnpreparedElfFile::from_bytes(src, "source") {
            Ok(parsed) => parsed,
            Err(_) => return false,
        };
        parsed.elf_type == self.elf_type
            && parsed.machine == self.machine
            && parsed.wordsize == self.wordsize
            && parsed.endian == self.endian
            && parsed.entry == self.entry
            && parsed.flags == self.flags
            && parsed.sections == self.sections
            && parsed.segments == self.segments
            && parsed.symbols == self.symbols
            && parsed.reloc_tables == self.reloc_tables
    }

    /// The single irreversible transition to a serializable file.
    pub fn prepare(mut self, wordsize: Wordsize, endian: Endian) -> Result<PreparedElfFile> {
        self.wordsize = Some(wordsize);
        self.endian = Some(endian);

        // A structurally untouched file keeps its original byte layout,
        // whatever its producer chose; only mutated files get the
        // canonical re-layout below.
        if self.matches_source() {
            let image = self.source.clone().expect("matched source exists");
            let hdr = ElfHeader::decode(&image, "source")?;
            return Ok(PreparedElfFile {
                file: self,
                wordsize,
                endian,
                phoff: hdr.phoff,
                shoff: hdr.shoff,
                image: Some(image),
            });
        }

        for sec in &self.sections {
            if let Some(link) = sec.link {
                if link >= self.sections.len() {
                    return Err(ElfError::InvalidArgument(format!(
                        "section {} links to nonexistent section {}",
                        sec.name, link
                    )));
                }
            }
        }

        self.regenerate_symtab(wordsize, endian)?;
        self.regenerate_reloc_tables(wordsize, endian)?;

        // Section-header string table over the final name set.
        let shstrtab = self.find_or_create_section(".shstrtab", SHT_STRTAB, SectionFlags::empty(), false);
        self.shstrtab_section = Some(shstrtab);
        let mut names = SuffixTree::new();
        for sec in &self.sections {
            if !sec.name.is_empty() {
                names.insert(&sec.name);
            }
        }
        let (table, name_offsets) = names.to_string_table();
        self.sections[shstrtab].set_data(ByteArray::from_vec(table))?;

        let ehsize = ehdr_size(wordsize) as u64;
        let phentsize = phdr_size(wordsize) as u64;
        let phnum = self.segments.len() as u64;
        let phdr_table_size = phnum * phentsize;
        let phoff = if phnum > 0 { ehsize } else { 0 };
        let mut cursor = ehsize + phdr_table_size;

        let name_off = |name_offsets: &HashMap<String, u32>, name: &str| -> u32 {
            if name.is_empty() {
                0
            } else {
                name_offsets.get(name).copied().unwrap_or(0)
            }
        };

        // Walk segments in insertion order, assigning ascending aligned
        // offsets; data follows the reserved program-header region.
        for seg_idx in 0..self.segments.len() {
            if matches!(self.segments[seg_idx].kind(), SegmentKind::Phdr) {
                self.segments[seg_idx].prepare_phdr(phoff, phdr_table_size)?;
                continue;
            }
            let vaddr = self.segments[seg_idx].vaddr;
            let align = self.segments[seg_idx].align;
            let offset = align_congruent(cursor, vaddr, align);
            let ids: Vec<SectionId> = self.segments[seg_idx].section_ids().to_vec();
            self.segments[seg_idx].prepare(offset)?;
            for id in ids {
                let sec_off = offset + (self.sections[id].addr - vaddr);
                let name_offset = name_off(&name_offsets, &self.sections[id].name.clone());
                self.sections[id].prepare(sec_off, id, name_offset)?;
            }
            cursor = offset + self.segments[seg_idx].get_filesz(&self.sections);
        }

        // Orphan sections (not placed by any segment) follow the segment
        // data in index order.
        for id in 0..self.sections.len() {
            if self.sections[id].is_prepared() {
                continue;
            }
            if id == 0 {
                self.sections[0].prepare(0, 0, 0)?;
                continue;
            }
            cursor = align_up(cursor, self.sections[id].addralign.max(1));
            let name_offset = name_off(&name_offsets, &self.sections[id].name.clone());
            self.sections[id].prepare(cursor, id, name_offset)?;
            cursor += self.sections[id].file_size();
        }

        let shoff = align_up(cursor, wordsize.addr_size() as u64);
        Ok(PreparedElfFile {
            file: self,
            wordsize,
            endian,
            phoff,
            shoff,
            image: None,
        })
    }

    /// Stable-partition the symbol table locals-first, renumbering every
    /// relocation reference through the permutation. `st_info` ordering is
    /// mandatory in the output: all STB_LOCAL entries precede the rest and
    /// the symtab's `sh_info` is one past the last local.
    fn sort_symbols_for_output(&mut self) {
        let mut order: Vec<usize> = (0..self.symbols.len()).collect();
        order.sort_by_key(|&i| self.symbols[i].binding != STB_LOCAL);
        if order.iter().enumerate().all(|(new, &old)| new == old) {
            return;
        }
        let mut remap = vec![0usize; order.len()];
        for (new, &old) in order.iter().enumerate() {
            remap[old] = new;
        }
        let old_symbols = std::mem::take(&mut self.symbols);
        self.symbols = order.iter().map(|&i| old_symbols[i].clone()).collect();
        for table in &mut self.reloc_tables {
            for entry in &mut table.entries {
                entry.symbol = remap[entry.symbol];
            }
        }
    }

    /// Rebuild `.symtab`/`.strtab` contents from the typed symbol list.
    fn regenerate_symtab(&mut self, w: Wordsize, e: Endian) -> Result<()> {
        if self.symbols.is_empty() {
            return Ok(());
        }
        self.sort_symbols_for_output();
        let mut names = SuffixTree::new();
        for sym in &self.symbols {
            if !sym.name.is_empty() {
                names.insert(&sym.name);
            }
        }
        let (table, offsets) = names.to_string_table();

        let strtab = match self.strtab_section {
            Some(id) => id,
            None => self.find_or_create_section(".strtab", SHT_STRTAB, SectionFlags::empty(), false),
        };
        self.strtab_section = Some(strtab);
        self.sections[strtab].set_data(ByteArray::from_vec(table))?;

        let mut bytes = ByteArray::new();
        for sym in &self.symbols {
            let name_offset = if sym.name.is_empty() {
                0
            } else {
                offsets.get(&sym.name).copied().unwrap_or(0)
            };
            bytes.append(&sym.entry(name_offset).encode(w, e));
        }
        let first_global = self
            .symbols
            .iter()
            .position(|s| s.binding != STB_LOCAL)
            .unwrap_or(self.symbols.len());

        let symtab = match self.symtab_section {
            Some(id) => id,
            None => self.find_or_create_section(".symtab", SHT_SYMTAB, SectionFlags::empty(), false),
        };
        self.symtab_section = Some(symtab);
        let sec = &mut self.sections[symtab];
        sec.sh_type = SHT_SYMTAB;
        sec.set_data(bytes)?;
        sec.link = Some(strtab);
        sec.info = first_global as u32;
        sec.entsize = sym_size(w) as u64;
        sec.addralign = w.addr_size() as u64;
        Ok(())
    }

    /// Rebuild each relocation table's section bytes.
    fn regenerate_reloc_tables(&mut self, w: Wordsize, e: Endian) -> Result<()> {
        let machine = self.machine;
        let symtab = self.symtab_section;
        for t in 0..self.reloc_tables.len() {
            let rela = self.reloc_tables[t].rela;
            let mut bytes = ByteArray::new();
            for reloc in &self.reloc_tables[t].entries {
                bytes.append(&reloc.entry().encode(w, e, machine));
            }
            let sh_type = if rela { SHT_RELA } else { SHT_REL };
            let id = match self.reloc_tables[t].section {
                Some(id) => id,
                None => {
                    let name = self.reloc_tables[t].name.clone();
                    let id = self.add_section(ElfSection::new(&name, sh_type));
                    self.reloc_tables[t].section = Some(id);
                    id
                }
            };
            let target = self.reloc_tables[t].target;
            let sec = &mut self.sections[id];
            sec.sh_type = sh_type;
            sec.set_data(bytes)?;
            sec.link = symtab;
            sec.info = target as u32;
            sec.entsize = if rela { rela_size(w) } else { rel_size(w) } as u64;
            sec.addralign = w.addr_size() as u64;
        }
        Ok(())
    }
}

// ── Prepared file ────────────────────────────────────────────────────────────

/// A fully laid-out, immutable file. The only operations left are
/// serialization; there is no conversion back to the unprepared state.
#[derive(Debug)]
pub struct PreparedElfFile {
    file: UnpreparedElfFile,
    wordsize: Wordsize,
    endian: Endian,
    phoff: u64,
    shoff: u64,
    /// Verbatim output for a file whose model never diverged from the
    /// image it was parsed from.
    image: Option<Vec<u8>>,
}

impl PreparedElfFile {
    pub fn wordsize(&self) -> Wordsize {
        self.wordsize
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn sections(&self) -> &[ElfSection] {
        &self.file.sections
    }

    pub fn segments(&self) -> &[ElfSegment] {
        &self.file.segments
    }

    pub fn entry(&self) -> u64 {
        self.file.entry
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if let Some(image) = &self.image {
            return Ok(image.clone());
        }
        let w = self.wordsize;
        let e = self.endian;
        let shentsize = shdr_size(w) as u64;
        let phentsize = phdr_size(w) as u64;
        let total = (self.shoff + self.file.sections.len() as u64 * shentsize) as usize;
        let mut buf = ByteArray::zeroed(total);

        let hdr = ElfHeader {
            wordsize: w,
            endian: e,
            e_type: self.file.elf_type,
            machine: self.file.machine,
            entry: self.file.entry,
            phoff: self.phoff,
            shoff: self.shoff,
            flags: self.file.flags,
            phnum: self.file.segments.len() as u16,
            shnum: self.file.sections.len() as u16,
            shstrndx: self.file.shstrtab_section.unwrap_or(0) as u16,
        };
        buf.set_bytes(0, &hdr.encode())?;

        for (i, seg) in self.file.segments.iter().enumerate() {
            let ph = seg.program_header(&self.file.sections)?;
            let off = (self.phoff + i as u64 * phentsize) as usize;
            buf.set_bytes(off, &ph.encode(w, e))?;
            if let SegmentKind::Data { data, .. } = seg.kind() {
                buf.set_bytes(seg.offset()? as usize, data.as_slice())?;
            }
        }

        for sec in &self.file.sections {
            if sec.sh_type == SHT_NULL || sec.is_nobits() || sec.bytes().is_empty() {
                continue;
            }
            buf.set_bytes(sec.offset()? as usize, sec.bytes())?;
        }

        for (i, sec) in self.file.sections.iter().enumerate() {
            let link = sec.link.map(|l| l as u32).unwrap_or(0);
            let shdr = if sec.sh_type == SHT_NULL {
                SectionHeader::default()
            } else {
                sec.header(link)?
            };
            let off = (self.shoff + i as u64 * shentsize) as usize;
            buf.set_bytes(off, &shdr.encode(w, e))?;
        }
        Ok(buf.into_vec())
    }

    /// Serialize to `path` through a scoped temporary, renaming into place
    /// only on success so no partial output survives a failure.
    pub fn to_filename(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("elfweave.tmp");
        if let Err(err) = std::fs::write(&tmp, &bytes) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        if let Err(err) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{STB_GLOBAL, STT_FUNC, STT_OBJECT};

    fn sample_exec() -> UnpreparedElfFile {
        let mut file = UnpreparedElfFile::new();
        file.elf_type = ET_EXEC;
        file.machine = EM_ARM;
        file.wordsize = Some(Wordsize::Elf32);
        file.endian = Some(Endian::Little);

        let mut text = ElfSection::new(".text", SHT_PROGBITS);
        text.flags = SectionFlags::ALLOC | SectionFlags::EXECINSTR;
        text.addr = 0x8000;
        text.addralign = 4;
        text.append_data(&[0xde, 0xad, 0xbe, 0xef, 1, 2, 3, 4]).unwrap();
        let text_id = file.add_section(text);

        let mut bss = ElfSection::new_nobits(".bss", 0x10);
        bss.flags = SectionFlags::ALLOC | SectionFlags::WRITE;
        bss.addr = 0x8008;
        bss.addralign = 4;
        let bss_id = file.add_section(bss);

        let mut seg = ElfSegment::new_sectioned(
            PT_LOAD,
            0x8000,
            0x8000,
            SegmentFlags::R | SegmentFlags::X,
            0x4,
        );
        seg.add_section(text_id, file.sections()).unwrap();
        seg.add_section(bss_id, file.sections()).unwrap();
        file.add_segment(seg);

        file.add_symbol(ElfSymbol::new("_start", Some(text_id), 0, 0, STT_FUNC, STB_GLOBAL));
        file.entry = 0x8000;
        file
    }

    /// A valid image laid out the way this crate never would: section
    /// data at a padded offset far past the headers, and a section name
    /// table in neither sorted nor suffix-shared order.
    fn foreign_layout_image() -> Vec<u8> {
        let w = Wordsize::Elf32;
        let e = Endian::Little;
        let mut buf = ByteArray::zeroed(0x194);
        let hdr = ElfHeader {
            wordsize: w,
            endian: e,
            e_type: ET_EXEC,
            machine: EM_ARM,
            entry: 0x8000,
            phoff: 52,
            shoff: 0x11c,
            flags: 0,
            phnum: 1,
            shnum: 3,
            shstrndx: 2,
        };
        buf.set_bytes(0, &hdr.encode()).unwrap();
        let ph = ProgramHeader {
            p_type: PT_LOAD,
            flags: 5,
            offset: 0x100,
            vaddr: 0x8000,
            paddr: 0x8000,
            filesz: 8,
            memsz: 8,
            align: 4,
        };
        buf.set_bytes(52, &ph.encode(w, e)).unwrap();
        buf.set_bytes(0x100, &[0xde, 0xad, 0xbe, 0xef, 1, 2, 3, 4]).unwrap();
        buf.set_bytes(0x108, b"\0.shstrtab\0.text\0").unwrap();
        let text = SectionHeader {
            name: 11,
            sh_type: SHT_PROGBITS,
            flags: 6,
            addr: 0x8000,
            offset: 0x100,
            size: 8,
            link: 0,
            info: 0,
            addralign: 4,
            entsize: 0,
        };
        let shstr = SectionHeader {
            name: 1,
            sh_type: SHT_STRTAB,
            flags: 0,
            addr: 0,
            offset: 0x108,
            size: 17,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
        };
        buf.set_bytes(0x11c + 40, &text.encode(w, e)).unwrap();
        buf.set_bytes(0x11c + 80, &shstr.encode(w, e)).unwrap();
        buf.into_vec()
    }

    #[test]
    fn roundtrip_preserves_foreign_layout() {
        let original = foreign_layout_image();
        let out = UnpreparedElfFile::from_bytes(&original, "mem")
            .unwrap()
            .prepare(Wordsize::Elf32, Endian::Little)
            .unwrap()
            .to_bytes()
            .unwrap();
        assert_eq!(out, original);
    }

    #[test]
    fn mutation_invalidates_preserved_layout() {
        let original = foreign_layout_image();
        let mut file = UnpreparedElfFile::from_bytes(&original, "mem").unwrap();
        let text = file.find_section_named(".text").unwrap();
        file.section_mut(text)
            .unwrap()
            .data_mut()
            .unwrap()
            .set_int(0, 4, 0, Endian::Little)
            .unwrap();
        let out = file
            .prepare(Wordsize::Elf32, Endian::Little)
            .unwrap()
            .to_bytes()
            .unwrap();
        assert_ne!(out, original);
        // Still a consistent image carrying the edit.
        let back = UnpreparedElfFile::from_bytes(&out, "mem").unwrap();
        let text = back.find_section_named(".text").unwrap();
        assert_eq!(&back.section(text).unwrap().bytes()[0..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn roundtrip_is_byte_identical() {
        let first = sample_exec()
            .prepare(Wordsize::Elf32, Endian::Little)
            .unwrap()
            .to_bytes()
            .unwrap();
        let reparsed = UnpreparedElfFile::from_bytes(&first, "mem").unwrap();
        let second = reparsed
            .prepare(Wordsize::Elf32, Endian::Little)
            .unwrap()
            .to_bytes()
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn parse_recovers_model() {
        let bytes = sample_exec()
            .prepare(Wordsize::Elf32, Endian::Little)
            .unwrap()
            .to_bytes()
            .unwrap();
        let file = UnpreparedElfFile::from_bytes(&bytes, "mem").unwrap();
        assert_eq!(file.elf_type, ET_EXEC);
        assert_eq!(file.machine, EM_ARM);
        assert_eq!(file.entry, 0x8000);
        let text = file.find_section_named(".text").unwrap();
        assert_eq!(file.section(text).unwrap().addr, 0x8000);
        assert_eq!(file.section(text).unwrap().get_size(), 8);
        assert_eq!(file.segments().len(), 1);
        let seg = &file.segments()[0];
        assert_eq!(seg.get_filesz(file.sections()), 8);
        assert_eq!(seg.get_memsz(file.sections()), 0x18);
        let start = file.find_symbol("_start").unwrap();
        assert_eq!(start.section, Some(text));
    }

    #[test]
    fn symtab_serializes_locals_before_globals() {
        let mut file = sample_exec();
        let text = file.find_section_named(".text").unwrap();
        let start = file.symbols().iter().position(|s| s.name == "_start").unwrap();
        // Appended after the global, so serialization has to reorder.
        file.add_symbol(ElfSymbol::new("loop_top", Some(text), 4, 0, STT_NOTYPE, STB_LOCAL));
        let mut table = RelocTable::new(".rel.text", text, false);
        table.entries.push(ElfReloc { offset: 0, reloc_type: 2, symbol: start, addend: None });
        file.reloc_tables.push(table);

        let bytes = file
            .prepare(Wordsize::Elf32, Endian::Little)
            .unwrap()
            .to_bytes()
            .unwrap();
        let back = UnpreparedElfFile::from_bytes(&bytes, "mem").unwrap();

        let first_global = back
            .symbols()
            .iter()
            .position(|s| s.binding != STB_LOCAL)
            .unwrap();
        assert!(back.symbols()[first_global..].iter().all(|s| s.binding != STB_LOCAL));
        let symtab = back.find_section_named(".symtab").unwrap();
        assert_eq!(back.section(symtab).unwrap().info as usize, first_global);
        // The relocation followed _start through the reorder.
        let entry = &back.reloc_tables[0].entries[0];
        assert_eq!(back.symbols()[entry.symbol].name, "_start");
    }

    #[test]
    fn malformed_input_names_the_file() {
        let err = UnpreparedElfFile::from_bytes(b"not elf data at all", "junk.o").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("junk.o"), "{}", msg);
    }

    #[test]
    fn find_symbol_suffix_rules() {
        let mut file = UnpreparedElfFile::new();
        file.add_symbol(ElfSymbol::absolute("_ZN6kernel4initEv", 0x100));
        file.add_symbol(ElfSymbol::absolute("main", 0x200));
        assert_eq!(file.find_symbol("_ZN6kernel4initEv").unwrap().value, 0x100);
        assert_eq!(file.find_symbol("initEv").unwrap().value, 0x100);
        assert!(matches!(
            file.find_symbol("missing"),
            Err(ElfError::SymbolNotFound(_))
        ));
        file.add_symbol(ElfSymbol::absolute("_ZN5other4initEv", 0x300));
        assert!(matches!(
            file.find_symbol("initEv"),
            Err(ElfError::AmbiguousSymbol(_))
        ));
    }

    #[test]
    fn common_allocation_offsets() {
        let mut file = UnpreparedElfFile::new();
        let mut a = ElfSymbol::new("first", None, 8, 12, STT_OBJECT, STB_GLOBAL);
        a.shndx = SHN_COMMON;
        let mut b = ElfSymbol::new("second", None, 4, 4, STT_OBJECT, STB_GLOBAL);
        b.shndx = SHN_COMMON;
        let a = file.add_symbol(a);
        let b = file.add_symbol(b);
        file.allocate_symbols().unwrap();

        let bss = file.find_section_named(".bss").unwrap();
        assert_eq!(file.symbols()[a].section, Some(bss));
        assert_eq!(file.symbols()[a].value, 0);
        assert_eq!(file.symbols()[b].value, 12);
        assert_eq!(file.section(bss).unwrap().get_size(), 16);
    }

    #[test]
    fn special_symbol_allocation() {
        let mut file = UnpreparedElfFile::new();
        let got = file.add_symbol(ElfSymbol::new(
            "_GLOBAL_OFFSET_TABLE_",
            None,
            0,
            0,
            STT_OBJECT,
            STB_GLOBAL,
        ));
        file.allocate_symbols().unwrap();
        let got_sec = file.find_section_named(".got").unwrap();
        assert_eq!(file.symbols()[got].section, Some(got_sec));
        assert_eq!(file.symbols()[got].value, 0);
    }

    #[test]
    fn patch_hits_section_bytes() {
        let mut file = sample_exec();
        file.patch(0x8004, 4, 0x0102_0304).unwrap();
        let text = file.find_section_named(".text").unwrap();
        assert_eq!(&file.section(text).unwrap().bytes()[4..8], &[0x04, 0x03, 0x02, 0x01]);

        // value too wide for the declared size
        assert!(matches!(
            file.patch(0x8000, 2, 0x1_0000),
            Err(ElfError::PatchFailed { .. })
        ));
        // uncovered address
        assert!(matches!(
            file.patch(0x9000_0000, 4, 1),
            Err(ElfError::PatchFailed { .. })
        ));
        // NOBITS target has no file bytes to patch
        assert!(matches!(
            file.patch(0x8010, 4, 1),
            Err(ElfError::PatchFailed { .. })
        ));
    }

    #[test]
    fn patch_resolves_physical_addresses() {
        let mut file = sample_exec();
        file.segments_mut()[0].paddr = 0xa000_0000;
        file.patch(0xa000_0004, 4, 0x1122_3344).unwrap();
        let text = file.find_section_named(".text").unwrap();
        assert_eq!(
            &file.section(text).unwrap().bytes()[4..8],
            &[0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn remove_section_drops_symbols_and_relocs() {
        let mut file = UnpreparedElfFile::new();
        let mut text = ElfSection::new(".text", SHT_PROGBITS);
        text.flags = SectionFlags::ALLOC;
        text.append_data(&[0; 8]).unwrap();
        let text_id = file.add_section(text);
        let mut junk = ElfSection::new(".junk", SHT_PROGBITS);
        junk.append_data(&[0; 4]).unwrap();
        let junk_id = file.add_section(junk);

        let keep = file.add_symbol(ElfSymbol::new("keep", Some(text_id), 0, 0, STT_FUNC, STB_GLOBAL));
        let drop = file.add_symbol(ElfSymbol::new("drop", Some(junk_id), 0, 0, STT_FUNC, STB_GLOBAL));
        assert!(keep < drop);

        let mut table = RelocTable::new(".rel.text", text_id, false);
        table.entries.push(ElfReloc { offset: 0, reloc_type: 2, symbol: keep, addend: None });
        table.entries.push(ElfReloc { offset: 4, reloc_type: 2, symbol: drop, addend: None });
        file.reloc_tables.push(table);

        file.remove_section(junk_id).unwrap();
        assert!(file.find_section_named(".junk").is_none());
        assert!(file.find_symbol("drop").is_err());
        assert_eq!(file.reloc_tables[0].entries.len(), 1);
        let kept = &file.reloc_tables[0].entries[0];
        assert_eq!(file.symbols()[kept.symbol].name, "keep");
    }
}
