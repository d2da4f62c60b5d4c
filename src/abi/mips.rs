//! MIPS (EM_MIPS) relocation table. REL format on o32; the paired
//! HI16/LO16 forms and the jump-target form need carry tracking between
//! entries, which the driver does not do, so they stay Unhandled and
//! surface by name when a final link needs them.

use super::{calc_none, calc_s_plus_a, AbiRegistry, RelocDef};
use crate::elf::EM_MIPS;

pub const R_MIPS_NONE: u32 = 0;
pub const R_MIPS_16: u32 = 1;
pub const R_MIPS_32: u32 = 2;
pub const R_MIPS_REL32: u32 = 3;
pub const R_MIPS_26: u32 = 4;
pub const R_MIPS_HI16: u32 = 5;
pub const R_MIPS_LO16: u32 = 6;
pub const R_MIPS_GPREL16: u32 = 7;
pub const R_MIPS_LITERAL: u32 = 8;
pub const R_MIPS_GOT16: u32 = 9;
pub const R_MIPS_PC16: u32 = 10;
pub const R_MIPS_CALL16: u32 = 11;
pub const R_MIPS_GPREL32: u32 = 12;
pub const R_MIPS_64: u32 = 18;

pub static REGISTRY: AbiRegistry = AbiRegistry {
    machine: EM_MIPS,
    name: "mips",
    relocs: &[
        RelocDef {
            code: R_MIPS_NONE,
            name: "R_MIPS_NONE",
            calc: Some(calc_none),
            alloc: None,
            width: 0,
            addend_in_place: false,
        },
        RelocDef {
            code: R_MIPS_16,
            name: "R_MIPS_16",
            calc: None,
            alloc: None,
            width: 2,
            addend_in_place: true,
        },
        RelocDef {
            code: R_MIPS_32,
            name: "R_MIPS_32",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_MIPS_REL32,
            name: "R_MIPS_REL32",
            calc: None,
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_MIPS_26,
            name: "R_MIPS_26",
            calc: None,
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_MIPS_HI16,
            name: "R_MIPS_HI16",
            calc: None,
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_MIPS_LO16,
            name: "R_MIPS_LO16",
            calc: None,
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_MIPS_GPREL16,
            name: "R_MIPS_GPREL16",
            calc: None,
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_MIPS_LITERAL,
            name: "R_MIPS_LITERAL",
            calc: None,
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_MIPS_GOT16,
            name: "R_MIPS_GOT16",
            calc: None,
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_MIPS_PC16,
            name: "R_MIPS_PC16",
            calc: None,
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_MIPS_CALL16,
            name: "R_MIPS_CALL16",
            calc: None,
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_MIPS_GPREL32,
            name: "R_MIPS_GPREL32",
            calc: None,
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_MIPS_64,
            name: "R_MIPS_64",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 8,
            addend_in_place: true,
        },
    ],
};
