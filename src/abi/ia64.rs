//! IA-64 (EM_IA_64) relocation table. RELA format. Only the LSB data
//! relocations carry calculations; the bundle-slot immediate forms
//! (PCREL21B and friends) are listed so they report by name instead of
//! as unknown codes.

use super::{
    calc_base_plus_a_minus_p, calc_none, calc_s_plus_a, calc_s_plus_a_minus_p, AbiRegistry,
    RelocDef,
};
use crate::elf::EM_IA_64;

pub const R_IA64_NONE: u32 = 0x00;
pub const R_IA64_IMM14: u32 = 0x21;
pub const R_IA64_IMM22: u32 = 0x22;
pub const R_IA64_IMM64: u32 = 0x23;
pub const R_IA64_DIR32LSB: u32 = 0x25;
pub const R_IA64_DIR64LSB: u32 = 0x27;
pub const R_IA64_PCREL21B: u32 = 0x49;
pub const R_IA64_PCREL32LSB: u32 = 0x4d;
pub const R_IA64_PCREL64LSB: u32 = 0x4f;
pub const R_IA64_SECREL32LSB: u32 = 0x65;
pub const R_IA64_SECREL64LSB: u32 = 0x67;

pub static REGISTRY: AbiRegistry = AbiRegistry {
    machine: EM_IA_64,
    name: "ia64",
    relocs: &[
        RelocDef {
            code: R_IA64_NONE,
            name: "R_IA64_NONE",
            calc: Some(calc_none),
            alloc: None,
            width: 0,
            addend_in_place: false,
        },
        RelocDef {
            code: R_IA64_IMM14,
            name: "R_IA64_IMM14",
            calc: None,
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
        RelocDef {
            code: R_IA64_IMM22,
            name: "R_IA64_IMM22",
            calc: None,
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
        RelocDef {
            code: R_IA64_IMM64,
            name: "R_IA64_IMM64",
            calc: None,
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
        RelocDef {
            code: R_IA64_DIR32LSB,
            name: "R_IA64_DIR32LSB",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_IA64_DIR64LSB,
            name: "R_IA64_DIR64LSB",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
        RelocDef {
            code: R_IA64_PCREL21B,
            name: "R_IA64_PCREL21B",
            calc: None,
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
        RelocDef {
            code: R_IA64_PCREL32LSB,
            name: "R_IA64_PCREL32LSB",
            calc: Some(calc_s_plus_a_minus_p),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_IA64_PCREL64LSB,
            name: "R_IA64_PCREL64LSB",
            calc: Some(calc_s_plus_a_minus_p),
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
        RelocDef {
            code: R_IA64_SECREL32LSB,
            name: "R_IA64_SECREL32LSB",
            calc: Some(calc_base_plus_a_minus_p),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_IA64_SECREL64LSB,
            name: "R_IA64_SECREL64LSB",
            calc: Some(calc_base_plus_a_minus_p),
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
    ],
};
