//! Error types for the ELF model and link drivers.
//!
//! The library surfaces a single typed error enum; the CLI wraps it with
//! `anyhow` at the top level and maps it to exit status 1. State violations
//! (preparing twice, mutating a prepared object) are programming-contract
//! errors and are never recovered from.

use std::fmt;

pub type Result<T> = std::result::Result<T, ElfError>;

#[derive(Debug)]
pub enum ElfError {
    /// A prepared-only or unprepared-only operation was called in the wrong state.
    AlreadyPrepared(&'static str),
    NotPrepared(&'static str),
    /// Malformed or out-of-domain input to a mutation call.
    InvalidArgument(String),
    /// Header fields inconsistent on input (bad magic, unsupported class, ...).
    Malformed { file: String, reason: String },
    /// A relocation type has no calculation function, or its symbol is missing.
    UnresolvedRelocation { section: String, offset: u64, detail: String },
    /// A patch value does not fit its declared width, or the address is not
    /// covered by any segment.
    PatchFailed { addr: u64, reason: String },
    /// Checked buffer access out of range.
    OutOfRange { offset: usize, len: usize, size: usize },
    SymbolNotFound(String),
    /// A suffix lookup matched more than one inserted name.
    AmbiguousSymbol(String),
    Io(std::io::Error),
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElfError::AlreadyPrepared(what) => {
                write!(f, "{} is already prepared", what)
            }
            ElfError::NotPrepared(what) => {
                write!(f, "{} is not prepared", what)
            }
            ElfError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ElfError::Malformed { file, reason } => write!(f, "{}: {}", file, reason),
            ElfError::UnresolvedRelocation { section, offset, detail } => {
                write!(f, "unresolved relocation at {}+{:#x}: {}", section, offset, detail)
            }
            ElfError::PatchFailed { addr, reason } => {
                write!(f, "patch at {:#x} failed: {}", addr, reason)
            }
            ElfError::OutOfRange { offset, len, size } => {
                write!(f, "access of {} bytes at offset {} exceeds buffer size {}", len, offset, size)
            }
            ElfError::SymbolNotFound(name) => write!(f, "symbol `{}' not found", name),
            ElfError::AmbiguousSymbol(name) => {
                write!(f, "suffix `{}' matches more than one symbol", name)
            }
            ElfError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ElfError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ElfError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ElfError {
    fn from(e: std::io::Error) -> Self {
        ElfError::Io(e)
    }
}
