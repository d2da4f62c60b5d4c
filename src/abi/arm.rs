//! ARM (EM_ARM) relocation table.
//!
//! Branch relocations (PC24, PLT32, CALL, JUMP24) merge a 24-bit signed
//! word-scaled immediate back into the instruction, so they keep the
//! opcode byte from the raw word and never take the addend from the
//! target in place.

use super::{
    calc_base_plus_a_minus_p, calc_got_slot_minus_org, calc_none, calc_s_plus_a,
    calc_s_plus_a_minus_gotorg, calc_s_plus_a_minus_p, AbiRegistry, RelocAlloc, RelocDef,
    RelocEnv, RelocOutcome,
};
use crate::elf::EM_ARM;

pub const R_ARM_NONE: u32 = 0;
pub const R_ARM_PC24: u32 = 1;
pub const R_ARM_ABS32: u32 = 2;
pub const R_ARM_REL32: u32 = 3;
pub const R_ARM_ABS16: u32 = 5;
pub const R_ARM_ABS8: u32 = 8;
pub const R_ARM_GOTOFF32: u32 = 24;
pub const R_ARM_BASE_PREL: u32 = 25;
pub const R_ARM_GOT_BREL: u32 = 26;
pub const R_ARM_PLT32: u32 = 27;
pub const R_ARM_CALL: u32 = 28;
pub const R_ARM_JUMP24: u32 = 29;
pub const R_ARM_V4BX: u32 = 40;

/// Rewrite the 24-bit immediate of a B/BL instruction. The existing
/// immediate is the implicit addend: sign-extend, scale by 4, add into
/// the S + A - P displacement, then pack the result back under the
/// opcode byte.
fn calc_branch24(env: &RelocEnv) -> RelocOutcome {
    let insn = env.raw as u32;
    let imm = (((insn & 0x00ff_ffff) << 8) as i32 >> 8) as i64;
    let displacement = (env.symbol_value as i64)
        .wrapping_add(imm << 2)
        .wrapping_add(env.addend)
        .wrapping_sub(env.place as i64);
    let imm24 = ((displacement >> 2) as u32) & 0x00ff_ffff;
    RelocOutcome::Value(((insn & 0xff00_0000) | imm24) as u64)
}

pub static REGISTRY: AbiRegistry = AbiRegistry {
    machine: EM_ARM,
    name: "arm",
    relocs: &[
        RelocDef {
            code: R_ARM_NONE,
            name: "R_ARM_NONE",
            calc: Some(calc_none),
            alloc: None,
            width: 0,
            addend_in_place: false,
        },
        RelocDef {
            code: R_ARM_PC24,
            name: "R_ARM_PC24",
            calc: Some(calc_branch24),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_ARM_ABS32,
            name: "R_ARM_ABS32",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_ARM_REL32,
            name: "R_ARM_REL32",
            calc: Some(calc_s_plus_a_minus_p),
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_ARM_ABS16,
            name: "R_ARM_ABS16",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 2,
            addend_in_place: true,
        },
        RelocDef {
            code: R_ARM_ABS8,
            name: "R_ARM_ABS8",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 1,
            addend_in_place: true,
        },
        RelocDef {
            code: R_ARM_GOTOFF32,
            name: "R_ARM_GOTOFF32",
            calc: Some(calc_s_plus_a_minus_gotorg),
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_ARM_BASE_PREL,
            name: "R_ARM_BASE_PREL",
            calc: Some(calc_base_plus_a_minus_p),
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_ARM_GOT_BREL,
            name: "R_ARM_GOT_BREL",
            calc: Some(calc_got_slot_minus_org),
            alloc: Some(RelocAlloc::GotSlot),
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_ARM_PLT32,
            name: "R_ARM_PLT32",
            calc: Some(calc_branch24),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_ARM_CALL,
            name: "R_ARM_CALL",
            calc: Some(calc_branch24),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_ARM_JUMP24,
            name: "R_ARM_JUMP24",
            calc: Some(calc_branch24),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_ARM_V4BX,
            name: "R_ARM_V4BX",
            calc: Some(calc_none),
            alloc: None,
            width: 0,
            addend_in_place: false,
        },
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_preserves_opcode_byte() {
        // BL with immediate 0 (0xeb000000), branching from 0x8000 to 0x8100.
        let env = RelocEnv {
            symbol_value: 0x8100,
            addend: 0,
            place: 0x8000,
            raw: 0xeb00_0000,
            ..Default::default()
        };
        match calc_branch24(&env) {
            RelocOutcome::Value(v) => {
                let insn = v as u32;
                assert_eq!(insn & 0xff00_0000, 0xeb00_0000);
                assert_eq!(insn & 0x00ff_ffff, (0x100 >> 2) as u32);
            }
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn branch_backwards_sign_extends() {
        // Branch from 0x8100 back to 0x8000: displacement -0x100.
        let env = RelocEnv {
            symbol_value: 0x8000,
            addend: 0,
            place: 0x8100,
            raw: 0xea00_0000,
            ..Default::default()
        };
        match calc_branch24(&env) {
            RelocOutcome::Value(v) => {
                let imm = (v as u32) & 0x00ff_ffff;
                let ext = ((imm << 8) as i32 >> 8) << 2;
                assert_eq!(ext, -0x100);
            }
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn branch_folds_existing_immediate() {
        // An in-place immediate of 1 word adds 4 to the displacement.
        let env = RelocEnv {
            symbol_value: 0x8100,
            addend: 0,
            place: 0x8000,
            raw: 0xeb00_0001,
            ..Default::default()
        };
        match calc_branch24(&env) {
            RelocOutcome::Value(v) => {
                assert_eq!((v as u32) & 0x00ff_ffff, (0x104 >> 2) as u32);
            }
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn got_reference_requests_slot() {
        let def = REGISTRY.lookup(R_ARM_GOT_BREL).unwrap();
        assert_eq!(def.alloc, Some(RelocAlloc::GotSlot));
    }
}
