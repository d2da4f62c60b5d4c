//! Linker-script emulation.
//!
//! A layout is an ordered list of `LinkCommand`s replayed against an
//! explicit `LayoutCursor`; the cursor is the only mutable state threaded
//! through the interpreter. New target layouts (the per-architecture
//! kernel+SoC variants, GNU vs RVCT section naming) are expressed as new
//! command lists, not new logic.
//!
//! `Merge` records `(old section, new section, offset)` triples instead
//! of fixing up symbols inline; `finalize_merges` replays those triples
//! over the symbol and relocation tables once the whole script has run,
//! then removes the absorbed sections.

use log::debug;

use crate::bytes::align_up;
use crate::elf::file::UnpreparedElfFile;
use crate::elf::section::ElfSection;
use crate::elf::segment::ElfSegment;
use crate::elf::symbol::ElfSymbol;
use crate::elf::{
    SectionFlags, SectionId, SegmentFlags, EM_ARM, PT_LOAD, SHN_ABS, SHT_PROGBITS,
};
use crate::error::{ElfError, Result};

/// Virtual-address alignment between segments opened by the script.
pub const SEGMENT_ALIGN: u64 = 0x8000;

#[derive(Clone, Debug)]
pub enum LinkCommand {
    /// Open a new LOAD segment at `base`, aligned up to `SEGMENT_ALIGN`.
    Memory { base: u64 },
    /// Open an output section at the cursor, run the nested commands
    /// (typically `Merge`), and optionally close the current segment.
    Section {
        name: String,
        commands: Vec<LinkCommand>,
        end_of_segment: bool,
        /// Clone flags/alignment from an existing section instead of
        /// starting from a bare PROGBITS template.
        base_section: Option<String>,
    },
    /// Append every section matching one of the patterns onto the open
    /// output section. A trailing `*` matches any name with that prefix.
    Merge { patterns: Vec<String> },
    /// Advance the cursor to the next multiple of `n`, zero-filling the
    /// open section.
    Align(u64),
    /// Advance the cursor by `n` zero bytes.
    Pad(u64),
    /// Define (or repoint) an absolute symbol at the cursor address.
    Symbol(String),
    /// Remove matching sections from the file entirely.
    Discard(Vec<String>),
    /// Remove sections of the given header types.
    DiscardType(Vec<u32>),
}

/// The interpreter's only mutable state.
#[derive(Clone, Copy, Debug, Default)]
pub struct LayoutCursor {
    pub addr: u64,
    pub segment: Option<usize>,
    pub section: Option<SectionId>,
}

/// One absorbed section: bytes from `old` now live in `new` at `offset`.
#[derive(Clone, Copy, Debug)]
pub struct MergeRecord {
    pub old: SectionId,
    pub new: SectionId,
    pub offset: u64,
}

#[derive(Debug, Default)]
pub struct ScriptResult {
    pub merges: Vec<MergeRecord>,
    pub discarded: Vec<String>,
}

pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == pattern,
    }
}

/// Replay a command list over the file. The returned `ScriptResult`
/// must be passed to `finalize_merges` before the file is usable.
pub fn run_script(file: &mut UnpreparedElfFile, commands: &[LinkCommand]) -> Result<ScriptResult> {
    let mut cursor = LayoutCursor::default();
    let mut result = ScriptResult::default();
    run_commands(file, commands, &mut cursor, &mut result)?;
    Ok(result)
}

fn run_commands(
    file: &mut UnpreparedElfFile,
    commands: &[LinkCommand],
    cursor: &mut LayoutCursor,
    result: &mut ScriptResult,
) -> Result<()> {
    for cmd in commands {
        match cmd {
            LinkCommand::Memory { base } => {
                cursor.addr = align_up(*base, SEGMENT_ALIGN);
                cursor.segment = Some(open_segment(file, cursor.addr));
                cursor.section = None;
            }
            LinkCommand::Section {
                name,
                commands,
                end_of_segment,
                base_section,
            } => {
                let seg = cursor.segment.ok_or_else(|| {
                    ElfError::InvalidArgument(format!(
                        "section {} placed before any Memory command",
                        name
                    ))
                })?;
                let mut sec = match base_section {
                    Some(base) => {
                        let base_id = file.find_section_named(base).ok_or_else(|| {
                            ElfError::InvalidArgument(format!("no base section named {}", base))
                        })?;
                        let mut clone = ElfSection::new(name, file.section(base_id)?.sh_type);
                        clone.flags = file.section(base_id)?.flags;
                        clone.addralign = file.section(base_id)?.addralign;
                        clone
                    }
                    None => {
                        let mut sec = ElfSection::new(name, SHT_PROGBITS);
                        sec.flags = SectionFlags::ALLOC;
                        sec.addralign = 4;
                        sec
                    }
                };
                cursor.addr = align_up(cursor.addr, sec.addralign.max(1));
                sec.addr = cursor.addr;
                let id = file.add_section(sec);
                file.segment_add_section(seg, id)?;
                cursor.section = Some(id);
                debug!("output section {} at {:#x}", name, cursor.addr);

                run_commands(file, commands, cursor, result)?;

                cursor.addr = file.section(id)?.addr + file.section(id)?.get_size();
                cursor.section = None;
                if *end_of_segment {
                    cursor.addr = align_up(cursor.addr, SEGMENT_ALIGN);
                    cursor.segment = Some(open_segment(file, cursor.addr));
                }
            }
            LinkCommand::Merge { patterns } => {
                let dst = cursor.section.ok_or_else(|| {
                    ElfError::InvalidArgument("Merge outside any output section".to_string())
                })?;
                for pattern in patterns {
                    let matching: Vec<SectionId> = file
                        .sections()
                        .iter()
                        .enumerate()
                        .filter(|(id, s)| {
                            *id != dst
                                && matches_pattern(&s.name, pattern)
                                && !result.merges.iter().any(|m| m.old == *id)
                        })
                        .map(|(id, _)| id)
                        .collect();
                    for old in matching {
                        let offset = absorb_section(file, dst, old)?;
                        result.merges.push(MergeRecord { old, new: dst, offset });
                        debug!(
                            "merged {} into {} at offset {:#x}",
                            file.section(old)?.name,
                            file.section(dst)?.name,
                            offset
                        );
                    }
                }
                cursor.addr = file.section(dst)?.addr + file.section(dst)?.get_size();
            }
            LinkCommand::Align(n) => {
                let target = align_up(cursor.addr, (*n).max(1));
                if let Some(id) = cursor.section {
                    file.section_mut(id)?.append_zeros(target - cursor.addr)?;
                }
                cursor.addr = target;
            }
            LinkCommand::Pad(n) => {
                if let Some(id) = cursor.section {
                    file.section_mut(id)?.append_zeros(*n)?;
                }
                cursor.addr += n;
            }
            LinkCommand::Symbol(name) => {
                let addr = cursor.addr;
                match file.symbols().iter().position(|s| &s.name == name) {
                    Some(i) => {
                        let sym = &mut file.symbols_mut()[i];
                        sym.section = None;
                        sym.shndx = SHN_ABS;
                        sym.value = addr;
                        sym.updated = true;
                    }
                    None => {
                        file.add_symbol(ElfSymbol::absolute(name, addr));
                    }
                }
            }
            LinkCommand::Discard(names) => {
                let matching: Vec<SectionId> = file
                    .sections()
                    .iter()
                    .enumerate()
                    .skip(1)
                    .filter(|(_, s)| names.iter().any(|p| matches_pattern(&s.name, p)))
                    .map(|(id, _)| id)
                    .collect();
                discard_sections(file, matching, cursor, result)?;
            }
            LinkCommand::DiscardType(types) => {
                let matching: Vec<SectionId> = file
                    .sections()
                    .iter()
                    .enumerate()
                    .skip(1)
                    .filter(|(_, s)| types.contains(&s.sh_type))
                    .map(|(id, _)| id)
                    .collect();
                discard_sections(file, matching, cursor, result)?;
            }
        }
    }
    Ok(())
}

fn open_segment(file: &mut UnpreparedElfFile, vaddr: u64) -> usize {
    file.add_segment(ElfSegment::new_sectioned(
        PT_LOAD,
        vaddr,
        vaddr,
        SegmentFlags::R | SegmentFlags::W | SegmentFlags::X,
        SEGMENT_ALIGN,
    ))
}

/// Append `old`'s content onto `dst`, returning the in-section offset it
/// landed at. A NOBITS source keeps `dst` NOBITS if `dst` is still empty;
/// a NOBITS source after real bytes is materialized as zero fill.
fn absorb_section(file: &mut UnpreparedElfFile, dst: SectionId, old: SectionId) -> Result<u64> {
    let src_align = file.section(old)?.addralign.max(1);
    let src_size = file.section(old)?.get_size();
    let src_nobits = file.section(old)?.is_nobits();
    let src_flags = file.section(old)?.flags;
    let src_bytes: Vec<u8> = file.section(old)?.bytes().to_vec();

    if src_nobits && file.section(dst)?.get_size() == 0 && !file.section(dst)?.is_nobits() {
        file.section_mut(dst)?.set_nobits(0)?;
    } else if !src_nobits && file.section(dst)?.is_nobits() {
        file.section_mut(dst)?.remove_nobits()?;
    }
    let cur = file.section(dst)?.get_size();
    let pad = align_up(cur, src_align) - cur;
    if pad > 0 {
        file.section_mut(dst)?.append_zeros(pad)?;
    }
    let offset = if src_nobits {
        file.section_mut(dst)?.append_zeros(src_size)?
    } else {
        file.section_mut(dst)?.append_data(&src_bytes)?
    };

    let sec = file.section_mut(dst)?;
    sec.flags |= src_flags & (SectionFlags::ALLOC | SectionFlags::WRITE | SectionFlags::EXECINSTR);
    sec.addralign = sec.addralign.max(src_align);
    Ok(offset)
}

/// Remove the given sections, keeping the cursor and the already-recorded
/// merge triples consistent with the renumbering each removal causes.
fn discard_sections(
    file: &mut UnpreparedElfFile,
    mut ids: Vec<SectionId>,
    cursor: &mut LayoutCursor,
    result: &mut ScriptResult,
) -> Result<()> {
    ids.sort_unstable();
    for id in ids.into_iter().rev() {
        if result.merges.iter().any(|m| m.old == id || m.new == id) {
            continue;
        }
        result.discarded.push(file.section(id)?.name.clone());
        debug!("discarding section {}", file.section(id)?.name);
        file.remove_section(id)?;
        let shift = |s: SectionId| if s > id { s - 1 } else { s };
        for m in &mut result.merges {
            m.old = shift(m.old);
            m.new = shift(m.new);
        }
        if let Some(sec) = cursor.section {
            cursor.section = Some(shift(sec));
        }
    }
    Ok(())
}

/// Replay the merge triples over symbols and relocation tables, then drop
/// the absorbed sections. Symbols move to the output section with their
/// values rebased by the merge offset; relocation tables retarget with
/// their entry offsets rebased the same way.
pub fn finalize_merges(file: &mut UnpreparedElfFile, result: &ScriptResult) -> Result<()> {
    let mut merges = result.merges.clone();

    for m in &merges {
        for sym in file.symbols_mut().iter_mut() {
            if sym.section == Some(m.old) {
                sym.section = Some(m.new);
                sym.shndx = m.new as u16;
                sym.value += m.offset;
            }
            if let Some((got, slot)) = sym.got_slot {
                if got == m.old {
                    sym.got_slot = Some((m.new, slot + m.offset));
                }
            }
        }
        for table in &mut file.reloc_tables {
            if table.target == m.old {
                table.target = m.new;
                for entry in &mut table.entries {
                    entry.offset += m.offset;
                }
            }
        }
    }

    merges.sort_unstable_by_key(|m| m.old);
    for i in (0..merges.len()).rev() {
        let id = merges[i].old;
        file.remove_section(id)?;
        for m in &mut merges {
            if m.old > id {
                m.old -= 1;
            }
            if m.new > id {
                m.new -= 1;
            }
        }
    }
    Ok(())
}

// ── Stock layouts ────────────────────────────────────────────────────────────

fn out_section(name: &str, patterns: &[&str], end_of_segment: bool) -> LinkCommand {
    LinkCommand::Section {
        name: name.to_string(),
        commands: vec![LinkCommand::Merge {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }],
        end_of_segment,
        base_section: None,
    }
}

/// The generic layout used by a plain multi-object link.
pub fn default_link_script(base: u64) -> Vec<LinkCommand> {
    vec![
        LinkCommand::Memory { base },
        out_section(".text", &[".text*"], false),
        LinkCommand::Align(4),
        out_section(".rodata", &[".rodata*"], false),
        LinkCommand::Align(4),
        out_section(".data", &[".data*", ".sdata*"], false),
        LinkCommand::Align(4),
        out_section(".got", &[".got*"], false),
        LinkCommand::Align(4),
        out_section(".bss", &[".bss*"], false),
        LinkCommand::Symbol("_end".to_string()),
        LinkCommand::Discard(vec![".comment".to_string(), ".pdr".to_string()]),
        LinkCommand::DiscardType(vec![crate::elf::SHT_GROUP]),
    ]
}

/// Kernel-plus-SoC layout: code and read-only data in one segment,
/// writable data in a second. ARM carries an RVCT variant whose inputs
/// use the toolchain's own section naming.
pub fn kernel_soc_script(machine: u16, rvct: bool, base: u64) -> Vec<LinkCommand> {
    let (text, rodata, data, bss): (&[&str], &[&str], &[&str], &[&str]) =
        if machine == EM_ARM && rvct {
            (
                &[".text*", "i.*", "t.*"],
                &[".rodata*", ".constdata*"],
                &[".data*"],
                &[".bss*"],
            )
        } else {
            (&[".text*"], &[".rodata*"], &[".data*", ".sdata*"], &[".bss*"])
        };
    vec![
        LinkCommand::Memory { base },
        out_section(".text", text, false),
        LinkCommand::Align(32),
        out_section(".rodata", rodata, true),
        out_section(".data", data, false),
        LinkCommand::Align(8),
        out_section(".got", &[".got*"], false),
        LinkCommand::Align(8),
        out_section(".bss", bss, false),
        LinkCommand::Symbol("_end".to_string()),
        LinkCommand::Discard(vec![".comment".to_string(), ".pdr".to_string()]),
        LinkCommand::DiscardType(vec![crate::elf::SHT_GROUP]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{STB_GLOBAL, STT_FUNC, SHT_PROGBITS};

    fn input_file() -> UnpreparedElfFile {
        let mut file = UnpreparedElfFile::new();
        let mut a = ElfSection::new(".text.boot", SHT_PROGBITS);
        a.flags = SectionFlags::ALLOC | SectionFlags::EXECINSTR;
        a.addralign = 4;
        a.append_data(&vec![0xaa; 0x20]).unwrap();
        let a_id = file.add_section(a);

        let mut b = ElfSection::new(".text.main", SHT_PROGBITS);
        b.flags = SectionFlags::ALLOC | SectionFlags::EXECINSTR;
        b.addralign = 4;
        b.append_data(&vec![0xbb; 0x30]).unwrap();
        let b_id = file.add_section(b);

        let mut comment = ElfSection::new(".comment", SHT_PROGBITS);
        comment.append_data(b"gcc").unwrap();
        file.add_section(comment);

        file.add_symbol(ElfSymbol::new("boot", Some(a_id), 0, 4, STT_FUNC, STB_GLOBAL));
        file.add_symbol(ElfSymbol::new("main", Some(b_id), 8, 4, STT_FUNC, STB_GLOBAL));
        file
    }

    #[test]
    fn merge_concatenates_and_rebases() {
        let mut file = input_file();
        let script = default_link_script(0x10000);
        let result = run_script(&mut file, &script).unwrap();
        finalize_merges(&mut file, &result).unwrap();

        let text = file.find_section_named(".text").unwrap();
        // 0x20 is already 4-aligned, so 0x20 + 0x30 with no padding.
        assert_eq!(file.section(text).unwrap().get_size(), 0x50);
        assert_eq!(file.section(text).unwrap().addr, 0x10000);

        let boot = file.find_symbol("boot").unwrap();
        assert_eq!(boot.section, Some(text));
        assert_eq!(boot.value, 0);
        let main = file.find_symbol("main").unwrap();
        assert_eq!(main.value, 0x20 + 8);
    }

    #[test]
    fn discard_removes_sections() {
        let mut file = input_file();
        let script = default_link_script(0x10000);
        let result = run_script(&mut file, &script).unwrap();
        assert!(result.discarded.contains(&".comment".to_string()));
        finalize_merges(&mut file, &result).unwrap();
        assert!(file.find_section_named(".comment").is_none());
    }

    #[test]
    fn end_of_segment_opens_new_segment() {
        let mut file = input_file();
        let script = kernel_soc_script(EM_ARM, false, 0x10000);
        run_script(&mut file, &script).unwrap();
        // Memory opens one segment, the rodata end_of_segment a second.
        assert_eq!(file.segments().len(), 2);
        let second = &file.segments()[1];
        assert_eq!(second.vaddr % SEGMENT_ALIGN, 0);
        assert!(second.vaddr > file.segments()[0].vaddr);
    }

    #[test]
    fn script_symbol_is_absolute() {
        let mut file = input_file();
        let script = default_link_script(0x10000);
        let result = run_script(&mut file, &script).unwrap();
        finalize_merges(&mut file, &result).unwrap();
        let end = file.find_symbol("_end").unwrap();
        assert!(end.is_absolute());
        assert!(end.value >= 0x10000 + 0x50);
    }
}
