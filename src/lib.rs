//! elfweave: an ELF merge/link toolkit.
//!
//! Parses ELF32/ELF64 objects and executables (both endiannesses, for
//! ARM, x86, x86-64, IA-64, and MIPS), models their sections, segments,
//! and symbols as a mutable in-memory graph, merges multiple objects,
//! applies architecture-specific relocations, and re-serializes a valid
//! ELF image.
//!
//! The central lifecycle is the one-way unprepared→prepared transition:
//! `UnpreparedElfFile` is fully mutable; `prepare(wordsize, endianness)`
//! computes the global layout and yields a `PreparedElfFile` that can
//! only be serialized.

pub mod abi;
pub mod bytes;
pub mod cli;
pub mod elf;
pub mod error;
pub mod link;
pub mod logger;
pub mod modify;
pub mod script;
pub mod suffix;

pub use elf::file::{PreparedElfFile, UnpreparedElfFile};
pub use error::{ElfError, Result};
