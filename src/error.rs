//! Error types for the Mach-O rewriter.
//!
//! This module covers all failure modes of the conversion pipeline: input
//! parsing, load-command surgery, ordinal remapping, and stub toolchain
//! invocation.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for dylibify operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Mach-O Format Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMagic(u32),

    #[error("unsupported Mach-O magic {0:#x} (big-endian and fat64 images are not supported)")]
    UnsupportedMagic(u32),

    #[error("input is not an executable (file type {filetype:#x}); refusing to dylibify")]
    NotAnExecutable { filetype: u32 },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("insufficient space for new load commands (need {needed} bytes, have {available})")]
    InsufficientLoadCommandSpace { needed: usize, available: usize },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("Mach-O segment '{name}' not found")]
    SegmentNotFound { name: String },

    #[error("invalid ULEB128 at offset {offset:#x}")]
    InvalidUleb128 { offset: usize },

    #[error("fat slice {index} is out of bounds (file size: {file_size:#x})")]
    FatSliceOutOfBounds { index: usize, file_size: u64 },

    // ==================== Rewrite Errors ====================
    #[error("asked to remove dylib '{name}' but it wasn't found in the imports")]
    RemoveTargetNotFound { name: String },

    #[error("library ordinal {ordinal} has no image in the remap table")]
    OrdinalUnmapped { ordinal: u8 },

    // ==================== Stub Errors ====================
    #[error("unsupported stub symbol shape: '{name}'")]
    UnsupportedStubSymbol { name: String },

    #[error("no stub architecture for CPU type {cputype:#x}")]
    UnsupportedStubArch { cputype: u32 },

    #[error("failed to run {tool}: {source}")]
    ToolchainSpawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with status {code}")]
    ToolchainExit { tool: &'static str, code: i32 },
}

/// A specialized Result type for dylibify operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}
