//! Byte-level patch engine for Windows boot executables.
//!
//! A patch database binds numeric patch ids to byte-pattern descriptors,
//! filtered by machine type and file-version range. Four strategies cover
//! everything the boot binaries need: plain find-and-replace
//! ([`DirectPatch`]), replace with caller-supplied dword parameters
//! ([`DwordsPatch`]), rewriting a referenced UTF-16 string
//! ([`StringPatch`]), and injecting a whole function plus the call to it
//! ([`AddFunctionPatch`]). Everything operates on an in-memory file image
//! behind the [`PeImage`] trait; symbol addresses come from a
//! [`SymbolSource`]. Patterns may carry a wildcard byte so one patch
//! matches across compiler-version variance, and whatever build-specific
//! bytes a wildcard matched over are persisted inside the target file's
//! slack space so the patch can be reverted exactly.
//!
//! The database is parsed once and is read-only afterwards; apply and
//! revert calls against the same image buffer must be serialized by the
//! caller. Every operation validates all of its preconditions before
//! writing a single byte, so a failed call never leaves a torn patch.

mod bytes;
mod database;
mod helpers;
mod image;
mod patch;
pub mod persist;
mod symbols;

pub use crate::bytes::{find, Pattern};
pub use crate::database::{PatchDatabase, PatchEntry, PatchPlatform, PatchVersion};
pub use crate::helpers::pack_version;
pub use crate::image::{Machine, PeImage, Section, SectionName};
pub use crate::patch::{AddFunctionPatch, DirectPatch, DwordsPatch, PatchKind, StringPatch};
pub use crate::symbols::SymbolSource;

/// Why a patch operation did not happen. Failures are values; the only
/// hard stop is an unsupported database format, and even that is reported,
/// not panicked.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pattern does not occur in the named section, usually meaning
    /// the wrong file or an unexpected build.
    #[error("pattern not found in section {0}")]
    PatternNotFound(SectionName),
    #[error("section {0} not found in image")]
    SectionNotFound(SectionName),
    /// Structurally invalid database data.
    #[error("malformed patch database: {0}")]
    Format(&'static str),
    /// The database declares a format this crate does not understand; no
    /// partial parse is attempted.
    #[error("unsupported patch database format {major}.{minor}")]
    UnsupportedFormat { major: u16, minor: u16 },
    /// The database is not newer than the minimum the caller demanded.
    #[error("patch database {major}.{minor} is not newer than {min_major}.{min_minor}")]
    StaleDatabase {
        major: u16,
        minor: u16,
        min_major: u16,
        min_minor: u16,
    },
    /// Neither the slack region nor any section had room.
    #[error("no spare capacity for patch data")]
    Capacity,
    #[error("symbol {0} did not resolve")]
    SymbolNotFound(String),
    /// Every byte value already occurs in the pattern's fixed positions,
    /// so no wildcard sentinel can be chosen.
    #[error("no free wildcard byte value for pattern")]
    NoWildcardValue,
    /// The persisted record contradicts the patch; revert will not guess.
    #[error("persisted patch state is corrupt")]
    CorruptState,
    #[error("expected {expected} patch values, got {got}")]
    ValueCountMismatch { expected: usize, got: usize },
    #[error("patch is already applied")]
    AlreadyApplied,
    #[error("image write failed at offset {0:#x}")]
    WriteFailed(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
