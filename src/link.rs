//! Merge and link drivers.
//!
//! `merge_files` folds one relocatable object into another: same-named
//! sections concatenate (with alignment padding), incoming symbols are
//! rebased and resolved against the base table, and every relocation is
//! renumbered to the surviving symbol indices. `link_files` is the full
//! pipeline: merge all inputs, replay a linker script for layout, run
//! the allocation passes, convert symbols to absolute addresses, apply
//! relocations, and emit an executable.

use std::path::Path;

use log::{debug, info, warn};

use crate::abi::{AbiRegistry, RelocAlloc, RelocOutcome};
use crate::bytes::align_up;
use crate::elf::file::{PreparedElfFile, UnpreparedElfFile};
use crate::elf::reloc::RelocTable;
use crate::elf::{SectionFlags, SectionId, ET_EXEC, SHT_NULL, SHT_PROGBITS, SHT_REL, SHT_RELA, SHT_STRTAB, SHT_SYMTAB, STB_LOCAL};
use crate::error::{ElfError, Result};
use crate::script::{default_link_script, finalize_merges, kernel_soc_script, run_script};

pub struct LinkOptions {
    /// Base virtual address handed to the layout script.
    pub base_addr: u64,
    /// Use the kernel+SoC layout instead of the generic one.
    pub kernel_soc: bool,
    /// ARM RVCT toolchain section naming.
    pub rvct: bool,
    /// `--section-start name=addr` placement overrides.
    pub section_starts: Vec<(String, u64)>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        LinkOptions {
            base_addr: 0x8000,
            kernel_soc: false,
            rvct: false,
            section_starts: Vec::new(),
        }
    }
}

/// Fold `other` into `base`. Same-named sections concatenate; incoming
/// undefined symbols resolve against base definitions (and vice versa);
/// relocations are renumbered and retargeted.
pub fn merge_files(base: &mut UnpreparedElfFile, other: UnpreparedElfFile) -> Result<()> {
    if base.machine != other.machine {
        return Err(ElfError::InvalidArgument(format!(
            "cannot merge machine {} input into machine {} image",
            other.machine, base.machine
        )));
    }

    // (a) structural section merge, recording where each incoming
    // section's bytes landed.
    let mut sec_map: Vec<Option<(SectionId, u64)>> = vec![None; other.sections().len()];
    for (old_id, sec) in other.sections().iter().enumerate() {
        if matches!(sec.sh_type, SHT_NULL | SHT_SYMTAB | SHT_STRTAB | SHT_REL | SHT_RELA) {
            continue;
        }
        match base.find_section_named(&sec.name) {
            Some(dst) => {
                let align = sec.addralign.max(1);
                let offset = if sec.is_nobits() {
                    let cur = base.section(dst)?.get_size();
                    let pad = align_up(cur, align) - cur;
                    base.section_mut(dst)?.append_zeros(pad + sec.get_size())? + pad
                } else {
                    base.append_section_data(dst, sec.bytes(), align)?
                };
                let dst_sec = base.section_mut(dst)?;
                dst_sec.addralign = dst_sec.addralign.max(align);
                debug!("merged {} at offset {:#x}", sec.name, offset);
                sec_map[old_id] = Some((dst, offset));
            }
            None => {
                let new_id = base.add_section(sec.clone());
                sec_map[old_id] = Some((new_id, 0));
            }
        }
    }

    // (b) + (c) symbol rebase and resolution.
    let mut sym_map: Vec<usize> = Vec::with_capacity(other.symbols().len());
    for (i, sym) in other.symbols().iter().enumerate() {
        if i == 0 {
            sym_map.push(0);
            continue;
        }
        let mut incoming = sym.clone();
        if let Some(old_sec) = incoming.section {
            let (new_sec, offset) = sec_map[old_sec].ok_or_else(|| {
                ElfError::InvalidArgument(format!(
                    "symbol {} defined in an unmerged section",
                    incoming.name
                ))
            })?;
            incoming.section = Some(new_sec);
            incoming.shndx = new_sec as u16;
            incoming.value += offset;
        }

        // Local symbols are file-scoped: they never satisfy or shadow a
        // name from another object, so only globals/weaks take part in
        // the cross-object lookup.
        let existing = if incoming.name.is_empty() || incoming.binding == STB_LOCAL {
            None
        } else {
            base.symbols()
                .iter()
                .position(|s| s.binding != STB_LOCAL && s.name == incoming.name)
        };
        match existing {
            Some(j) if incoming.is_undefined() => {
                // Use the base symbol, defined or not.
                sym_map.push(j);
            }
            Some(j) if base.symbols()[j].is_undefined() => {
                // Incoming definition satisfies a base undefined symbol.
                base.symbols_mut()[j] = incoming;
                sym_map.push(j);
            }
            Some(j) if incoming.is_defined() && base.symbols()[j].is_defined() => {
                warn!("duplicate definition of {}, keeping the first", incoming.name);
                sym_map.push(j);
            }
            _ => {
                sym_map.push(base.add_symbol(incoming));
            }
        }
    }

    // (d) relocation renumbering and retargeting.
    for table in &other.reloc_tables {
        let (new_target, target_offset) = match sec_map[table.target] {
            Some(found) => found,
            None => continue,
        };
        let mut entries = Vec::with_capacity(table.entries.len());
        for entry in &table.entries {
            let mut entry = entry.clone();
            entry.symbol = sym_map[entry.symbol];
            entry.offset += target_offset;
            entries.push(entry);
        }
        match base
            .reloc_tables
            .iter_mut()
            .find(|t| t.target == new_target && t.rela == table.rela)
        {
            Some(existing) => existing.entries.extend(entries),
            None => {
                let mut new_table = RelocTable::new(&table.name, new_target, table.rela);
                new_table.entries = entries;
                base.reloc_tables.push(new_table);
            }
        }
    }
    Ok(())
}

/// Reserve a GOT slot for every symbol referenced by a slot-allocating
/// relocation. Runs before layout so the GOT has its final size when the
/// script places it.
pub fn allocate_got_slots(file: &mut UnpreparedElfFile) -> Result<()> {
    let registry = match AbiRegistry::for_machine(file.machine) {
        Some(r) => r,
        None => return Ok(()),
    };
    let width = file
        .wordsize
        .ok_or_else(|| ElfError::InvalidArgument("wordsize not set before GOT allocation".to_string()))?
        .addr_size() as u64;

    let mut wants: Vec<usize> = Vec::new();
    for table in &file.reloc_tables {
        for entry in &table.entries {
            if let Some(def) = registry.lookup(entry.reloc_type) {
                if def.alloc == Some(RelocAlloc::GotSlot) && !wants.contains(&entry.symbol) {
                    wants.push(entry.symbol);
                }
            }
        }
    }
    if wants.is_empty() {
        return Ok(());
    }

    let got = file.find_or_create_section(
        ".got",
        SHT_PROGBITS,
        SectionFlags::ALLOC | SectionFlags::WRITE,
        false,
    );
    for s in wants {
        if file.symbols()[s].got_slot.is_none() {
            let offset = file.section_mut(got)?.append_zeros(width)?;
            file.symbols_mut()[s].got_slot = Some((got, offset));
            debug!("GOT slot {:#x} for {}", offset, file.symbols()[s].name);
        }
    }
    Ok(())
}

fn sign_extend(value: u64, width: usize) -> i64 {
    if width >= 8 {
        return value as i64;
    }
    let shift = 64 - 8 * width as u32;
    ((value << shift) as i64) >> shift
}

fn width_mask(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * width)) - 1
    }
}

/// Apply every pending relocation. With `final_link` set, an unhandled
/// or unknown relocation type aborts; otherwise it stays pending for a
/// later pass. Successfully applied entries are dropped from their
/// tables.
pub fn apply_relocations(file: &mut UnpreparedElfFile, final_link: bool) -> Result<()> {
    let registry = AbiRegistry::for_machine(file.machine).ok_or_else(|| {
        ElfError::InvalidArgument(format!("no relocation support for machine {}", file.machine))
    })?;
    let endian = file
        .endian
        .ok_or_else(|| ElfError::InvalidArgument("endianness not set before relocation".to_string()))?;
    let got_org = match file.find_section_named(".got") {
        Some(id) => file.section(id)?.addr,
        None => 0,
    };

    for t in 0..file.reloc_tables.len() {
        let target = file.reloc_tables[t].target;
        let rela = file.reloc_tables[t].rela;
        let section_name = file.section(target)?.name.clone();
        let target_addr = file.section(target)?.addr;
        let mut pending = Vec::new();

        for i in 0..file.reloc_tables[t].entries.len() {
            let entry = file.reloc_tables[t].entries[i].clone();
            let def = match registry.lookup(entry.reloc_type) {
                Some(def) => def,
                None => {
                    if final_link {
                        return Err(ElfError::UnresolvedRelocation {
                            section: section_name,
                            offset: entry.offset,
                            detail: format!("unknown relocation type {}", entry.reloc_type),
                        });
                    }
                    warn!(
                        "unknown relocation type {} in {}, left pending",
                        entry.reloc_type, section_name
                    );
                    pending.push(entry);
                    continue;
                }
            };

            let sym = &file.symbols()[entry.symbol];
            if sym.is_undefined() && def.width > 0 {
                if final_link {
                    return Err(ElfError::UnresolvedRelocation {
                        section: section_name,
                        offset: entry.offset,
                        detail: format!("undefined symbol {}", sym.name),
                    });
                }
                pending.push(entry);
                continue;
            }
            let symbol_value = sym.value;
            let section_base = match sym.section {
                Some(id) => file.section(id)?.addr,
                None => 0,
            };
            let got_slot = match sym.got_slot {
                Some((id, off)) => file.section(id)?.addr + off,
                None => 0,
            };

            let raw = if def.width > 0 {
                file.section_mut(target)?
                    .data_mut()?
                    .get_int(entry.offset as usize, def.width, endian)?
            } else {
                0
            };
            let addend = if rela {
                entry.addend.unwrap_or(0)
            } else if def.addend_in_place {
                sign_extend(raw, def.width)
            } else {
                0
            };

            let env = crate::abi::RelocEnv {
                symbol_value,
                addend,
                place: target_addr + entry.offset,
                got_org,
                got_slot,
                section_base,
                raw,
            };
            let outcome = match def.calc {
                Some(f) => f(&env),
                None => RelocOutcome::Unhandled,
            };
            match outcome {
                RelocOutcome::Value(v) => {
                    file.section_mut(target)?.data_mut()?.set_int(
                        entry.offset as usize,
                        def.width,
                        v & width_mask(def.width),
                        endian,
                    )?;
                }
                RelocOutcome::NoOp => {}
                RelocOutcome::Unhandled => {
                    if final_link {
                        return Err(ElfError::UnresolvedRelocation {
                            section: section_name,
                            offset: entry.offset,
                            detail: format!("{} is not implemented", def.name),
                        });
                    }
                    warn!("{} in {} left pending", def.name, section_name);
                    pending.push(entry);
                }
            }
        }
        file.reloc_tables[t].entries = pending;
    }

    if final_link {
        // An executable carries no relocation sections.
        let mut ids: Vec<SectionId> = file
            .reloc_tables
            .iter()
            .filter_map(|t| t.section)
            .collect();
        ids.sort_unstable();
        for id in ids.into_iter().rev() {
            file.remove_section(id)?;
        }
        file.reloc_tables.clear();
    }
    Ok(())
}

/// Merge the input objects and produce a linked executable image.
pub fn link_files(paths: &[&Path], opts: &LinkOptions) -> Result<PreparedElfFile> {
    let first = paths
        .first()
        .ok_or_else(|| ElfError::InvalidArgument("no input files".to_string()))?;
    let mut base = UnpreparedElfFile::from_file(first)?;
    info!("linking {} object(s), base {:#x}", paths.len(), opts.base_addr);
    for path in &paths[1..] {
        let other = UnpreparedElfFile::from_file(path)?;
        merge_files(&mut base, other)?;
    }

    let wordsize = base
        .wordsize
        .ok_or_else(|| ElfError::InvalidArgument("input has no wordsize".to_string()))?;
    let endian = base
        .endian
        .ok_or_else(|| ElfError::InvalidArgument("input has no endianness".to_string()))?;

    base.allocate_symbols()?;
    allocate_got_slots(&mut base)?;

    let script = if opts.kernel_soc {
        kernel_soc_script(base.machine, opts.rvct, opts.base_addr)
    } else {
        default_link_script(opts.base_addr)
    };
    let result = run_script(&mut base, &script)?;
    finalize_merges(&mut base, &result)?;

    apply_section_starts(&mut base, &opts.section_starts)?;

    base.update_symbols()?;
    apply_relocations(&mut base, true)?;

    base.elf_type = ET_EXEC;
    match base.find_symbol("_start") {
        Ok(sym) => base.entry = sym.value,
        Err(_) => warn!("no _start symbol, entry point left at {:#x}", base.entry),
    }

    base.prepare(wordsize, endian)
}

fn apply_section_starts(file: &mut UnpreparedElfFile, starts: &[(String, u64)]) -> Result<()> {
    for (name, addr) in starts {
        let id = file
            .find_section_named(name)
            .ok_or_else(|| ElfError::InvalidArgument(format!("no section named {}", name)))?;
        file.section_mut(id)?.addr = *addr;
        // Re-insert into any owning segment so its sorted order holds.
        for seg_idx in 0..file.segments().len() {
            if file.segments()[seg_idx].has_section(id) {
                file.segments_mut()[seg_idx].remove_section(id)?;
                file.segment_add_section(seg_idx, id)?;
            }
        }
        info!("section {} placed at {:#x}", name, addr);
    }
    Ok(())
}
