//! Per-architecture relocation registries.
//!
//! Each supported machine (ARM, x86, x86-64, IA-64, MIPS) contributes a
//! static table mapping numeric relocation codes to a symbolic name, a
//! calculation function, and an optional allocation action. The tables
//! are plain statics selected by an explicit `AbiRegistry::for_machine`
//! call; nothing registers itself through global mutable state.
//!
//! A calculation has three distinct outcomes: `Value` (patch the target
//! word), `NoOp` (NONE-type relocation, nothing to write), and
//! `Unhandled` (recognized but unimplemented). The link driver treats
//! `Unhandled` as a soft failure during merges and a hard failure at
//! final link time.

pub mod arm;
pub mod ia64;
pub mod mips;
pub mod x86;
pub mod x86_64;

use crate::elf::{EM_386, EM_ARM, EM_IA_64, EM_MIPS, EM_X86_64};

/// Value state handed to a calculation function. Mnemonics follow the
/// conventional relocation algebra: S is the symbol value, A the addend,
/// P the place being patched, G the symbol's GOT slot address.
#[derive(Clone, Copy, Debug, Default)]
pub struct RelocEnv {
    /// S: absolute value of the referenced symbol.
    pub symbol_value: u64,
    /// A: explicit addend (RELA), or the implicit addend recovered from
    /// the instruction word (REL).
    pub addend: i64,
    /// P: absolute address of the word being patched.
    pub place: u64,
    /// GOT_ORG: address of the GOT section, 0 if there is none.
    pub got_org: u64,
    /// GOT(S): address of the symbol's GOT slot, 0 if unassigned.
    pub got_slot: u64,
    /// B(S): address of the section the symbol is defined in.
    pub section_base: u64,
    /// Existing word at the target, for opcode-preserving merges.
    pub raw: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocOutcome {
    /// Patch the target with this value.
    Value(u64),
    /// Recognized, nothing to write (NONE-type relocations).
    NoOp,
    /// Recognized but not implemented.
    Unhandled,
}

/// Side-effecting storage reservation run in a separate pass before any
/// calculation, so slot addresses are stable when calculations read them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocAlloc {
    /// Reserve a GOT slot for the referenced symbol.
    GotSlot,
}

pub struct RelocDef {
    pub code: u32,
    pub name: &'static str,
    /// `None` means the type is recognized but carries no calculation:
    /// equivalent to returning `Unhandled`.
    pub calc: Option<fn(&RelocEnv) -> RelocOutcome>,
    pub alloc: Option<RelocAlloc>,
    /// Bytes patched at the target.
    pub width: usize,
    /// For REL entries, whether the implicit addend is the raw target
    /// word itself. Opcode-merging types extract their own immediate
    /// field and leave this false.
    pub addend_in_place: bool,
}

pub struct AbiRegistry {
    pub machine: u16,
    pub name: &'static str,
    pub relocs: &'static [RelocDef],
}

impl AbiRegistry {
    pub fn for_machine(machine: u16) -> Option<&'static AbiRegistry> {
        match machine {
            EM_ARM => Some(&arm::REGISTRY),
            EM_386 => Some(&x86::REGISTRY),
            EM_X86_64 => Some(&x86_64::REGISTRY),
            EM_IA_64 => Some(&ia64::REGISTRY),
            EM_MIPS => Some(&mips::REGISTRY),
            _ => None,
        }
    }

    pub fn lookup(&self, code: u32) -> Option<&RelocDef> {
        self.relocs.iter().find(|d| d.code == code)
    }
}

// ── Shared calculation formulas ──────────────────────────────────────────────

pub(crate) fn calc_none(_env: &RelocEnv) -> RelocOutcome {
    RelocOutcome::NoOp
}

/// S + A
pub(crate) fn calc_s_plus_a(env: &RelocEnv) -> RelocOutcome {
    RelocOutcome::Value(env.symbol_value.wrapping_add_signed(env.addend))
}

/// S + A - P
pub(crate) fn calc_s_plus_a_minus_p(env: &RelocEnv) -> RelocOutcome {
    RelocOutcome::Value(
        env.symbol_value
            .wrapping_add_signed(env.addend)
            .wrapping_sub(env.place),
    )
}

/// B(S) + A - P
pub(crate) fn calc_base_plus_a_minus_p(env: &RelocEnv) -> RelocOutcome {
    RelocOutcome::Value(
        env.section_base
            .wrapping_add_signed(env.addend)
            .wrapping_sub(env.place),
    )
}

/// GOT(S) + A - GOT_ORG
pub(crate) fn calc_got_slot_minus_org(env: &RelocEnv) -> RelocOutcome {
    RelocOutcome::Value(
        env.got_slot
            .wrapping_add_signed(env.addend)
            .wrapping_sub(env.got_org),
    )
}

/// S + A - GOT_ORG
pub(crate) fn calc_s_plus_a_minus_gotorg(env: &RelocEnv) -> RelocOutcome {
    RelocOutcome::Value(
        env.symbol_value
            .wrapping_add_signed(env.addend)
            .wrapping_sub(env.got_org),
    )
}

/// GOT_ORG + A - P
pub(crate) fn calc_gotorg_plus_a_minus_p(env: &RelocEnv) -> RelocOutcome {
    RelocOutcome::Value(
        env.got_org
            .wrapping_add_signed(env.addend)
            .wrapping_sub(env.place),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pc_relative_worked_example() {
        // Section at 0x1000, symbol at 0x2000, addend 4, reloc at offset 0x10.
        let env = RelocEnv {
            symbol_value: 0x2000,
            addend: 4,
            place: 0x1010,
            ..Default::default()
        };
        assert_eq!(calc_s_plus_a_minus_p(&env), RelocOutcome::Value(0x0ff4));
    }

    #[test]
    fn got_formulas() {
        let env = RelocEnv {
            symbol_value: 0x3000,
            addend: 0,
            got_org: 0x5000,
            got_slot: 0x5008,
            ..Default::default()
        };
        assert_eq!(calc_got_slot_minus_org(&env), RelocOutcome::Value(8));
        assert_eq!(
            calc_s_plus_a_minus_gotorg(&env),
            RelocOutcome::Value(0x3000u64.wrapping_sub(0x5000))
        );
    }

    #[test]
    fn registry_selection() {
        assert_eq!(AbiRegistry::for_machine(EM_ARM).unwrap().name, "arm");
        assert_eq!(AbiRegistry::for_machine(EM_MIPS).unwrap().name, "mips");
        assert!(AbiRegistry::for_machine(0xbeef).is_none());
    }

    #[test]
    fn none_type_is_noop_not_unhandled() {
        let arm = AbiRegistry::for_machine(EM_ARM).unwrap();
        let none = arm.lookup(arm::R_ARM_NONE).unwrap();
        let env = RelocEnv::default();
        assert_eq!((none.calc.unwrap())(&env), RelocOutcome::NoOp);
        // An entry without a calc function is the distinct Unhandled case.
        let mips = AbiRegistry::for_machine(EM_MIPS).unwrap();
        let hi16 = mips.lookup(mips::R_MIPS_HI16).unwrap();
        assert!(hi16.calc.is_none());
    }
}
