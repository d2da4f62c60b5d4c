//! x86-64 (EM_X86_64) relocation table. RELA format throughout, so no
//! entry reads its addend from the patched word.

use super::{
    calc_got_slot_minus_org, calc_gotorg_plus_a_minus_p, calc_none, calc_s_plus_a,
    calc_s_plus_a_minus_gotorg, calc_s_plus_a_minus_p, AbiRegistry, RelocAlloc, RelocDef,
};
use crate::elf::EM_X86_64;

pub const R_X86_64_NONE: u32 = 0;
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;
pub const R_X86_64_GOT32: u32 = 3;
pub const R_X86_64_PLT32: u32 = 4;
pub const R_X86_64_COPY: u32 = 5;
pub const R_X86_64_GLOB_DAT: u32 = 6;
pub const R_X86_64_JUMP_SLOT: u32 = 7;
pub const R_X86_64_RELATIVE: u32 = 8;
pub const R_X86_64_32: u32 = 10;
pub const R_X86_64_32S: u32 = 11;
pub const R_X86_64_16: u32 = 12;
pub const R_X86_64_PC16: u32 = 13;
pub const R_X86_64_PC64: u32 = 24;
pub const R_X86_64_GOTOFF64: u32 = 25;
pub const R_X86_64_GOTPC32: u32 = 26;

pub static REGISTRY: AbiRegistry = AbiRegistry {
    machine: EM_X86_64,
    name: "x86_64",
    relocs: &[
        RelocDef {
            code: R_X86_64_NONE,
            name: "R_X86_64_NONE",
            calc: Some(calc_none),
            alloc: None,
            width: 0,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_64,
            name: "R_X86_64_64",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_PC32,
            name: "R_X86_64_PC32",
            calc: Some(calc_s_plus_a_minus_p),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_GOT32,
            name: "R_X86_64_GOT32",
            calc: Some(calc_got_slot_minus_org),
            alloc: Some(RelocAlloc::GotSlot),
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_PLT32,
            name: "R_X86_64_PLT32",
            calc: Some(calc_s_plus_a_minus_p),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_COPY,
            name: "R_X86_64_COPY",
            calc: None,
            alloc: None,
            width: 0,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_GLOB_DAT,
            name: "R_X86_64_GLOB_DAT",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_JUMP_SLOT,
            name: "R_X86_64_JUMP_SLOT",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_RELATIVE,
            name: "R_X86_64_RELATIVE",
            calc: None,
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_32,
            name: "R_X86_64_32",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_32S,
            name: "R_X86_64_32S",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_16,
            name: "R_X86_64_16",
            calc: Some(calc_s_plus_a),
            alloc: None,
            width: 2,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_PC16,
            name: "R_X86_64_PC16",
            calc: Some(calc_s_plus_a_minus_p),
            alloc: None,
            width: 2,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_PC64,
            name: "R_X86_64_PC64",
            calc: Some(calc_s_plus_a_minus_p),
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_GOTOFF64,
            name: "R_X86_64_GOTOFF64",
            calc: Some(calc_s_plus_a_minus_gotorg),
            alloc: None,
            width: 8,
            addend_in_place: false,
        },
        RelocDef {
            code: R_X86_64_GOTPC32,
            name: "R_X86_64_GOTPC32",
            calc: Some(calc_gotorg_plus_a_minus_p),
            alloc: None,
            width: 4,
            addend_in_place: false,
        },
    ],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{RelocEnv, RelocOutcome};

    #[test]
    fn wide_absolute_patches_eight_bytes() {
        let def = REGISTRY.lookup(R_X86_64_64).unwrap();
        assert_eq!(def.width, 8);
        let env = RelocEnv {
            symbol_value: 0x1_0000_0000,
            addend: -8,
            ..Default::default()
        };
        assert_eq!(
            (def.calc.unwrap())(&env),
            RelocOutcome::Value(0xffff_fff8)
        );
    }
}
