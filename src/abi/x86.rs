//! x86 (EM_386) relocation table. REL format: implicit addends live in
//! the patched word itself.

use super::{
    calc_got_slot_minus_org, calc_gotorg_plus_a_minus_p, calc_none, calc_s_plus_a,
    calc_s_plus_a_minus_gotorg, calc_s_plus_a_minus_p, AbiRegistry, RelocAlloc, RelocDef,
};
use crate::elf::EM_386;

pub const R_386_NONE: u32 = 0;
pub const R_386_32: u32 = 1;
pub const R_386_PC32: u32 = 2;
pub const R_386_GOT32: u32 = 3;
pub const R_386_PLT32: u32 = 4;
pub const R_386_COPY: u32 = 5;
pub const R_386_GLOB_DAT: u32 = 6;
pub const R_386_JMP_SLOT: u32 = 7;
pub const R_386_RELATIVE: u32 = 8;
pub const R_386_GOTOFF: u32 = 9;
pub const R_386_GOTPC: u32 = 10;
pub const R_386_16: u32 = 20;
pub const R_386_PC16: u32 = 21;

pub static REGISTRY: AbiRegistry = AbiRegistry {
    machine: EM_386,
    name: "x86",
    relocs: &[
        RelocDef {
            code: R_386_NONE,
            name: "R_386_NONE",
            calc: Some(calc_none),
            alloc: None,
            width: 0,
            addend_in_place: false,
        },
        RelocDef {
            code: R_386_32,
            name: "R_386_32",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_386_PC32,
            name: "R_386_PC32",
            calc: Some(calc_s_plus_a_minus_p),
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_386_GOT32,
            name: "R_386_GOT32",
            calc: Some(calc_got_slot_minus_org),
            alloc: Some(RelocAlloc::GotSlot),
            width: 4,
            addend_in_place: true,
        },
        // Static linking resolves a PLT reference straight to the symbol.
        RelocDef {
            code: R_386_PLT32,
            name: "R_386_PLT32",
            calc: Some(calc_s_plus_a_minus_p),
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_386_COPY,
            name: "R_386_COPY",
            calc: None,
            alloc: None,
            width: 0,
            addend_in_place: false,
        },
        RelocDef {
            code: R_386_GLOB_DAT,
            name: "R_386_GLOB_DAT",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_386_JMP_SLOT,
            name: "R_386_JMP_SLOT",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_386_RELATIVE,
            name: "R_386_RELATIVE",
            calc: None,
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_386_GOTOFF,
            name: "R_386_GOTOFF",
            calc: Some(calc_s_plus_a_minus_gotorg),
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_386_GOTPC,
            name: "R_386_GOTPC",
            calc: Some(calc_gotorg_plus_a_minus_p),
            alloc: None,
            width: 4,
            addend_in_place: true,
        },
        RelocDef {
            code: R_386_16,
            name: "R_386_16",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 2,
            addend_in_place: true,
        },
        RelocDef {
            code: R_386_PC16,
            name: "R_386_PC16",
            calc: Some(calc_s_plus_a_minus_p),
            alloc: None,
            width: 2,
            addend_in_place: true,
        },
    ],
};
