//! Mach-O constants and flags.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

/// 64-bit Mach-O magic (big-endian, needs byte swap)
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

/// 32-bit Mach-O magic (little-endian)
pub const MH_MAGIC: u32 = 0xFEEDFACE;

/// 32-bit Mach-O magic (big-endian)
pub const MH_CIGAM: u32 = 0xCEFAEDFE;

/// FAT binary magic (stored big-endian on disk)
pub const FAT_MAGIC: u32 = 0xCAFEBABE;

/// 64-bit FAT binary magic
pub const FAT_MAGIC_64: u32 = 0xCAFEBABF;

// =============================================================================
// File Types
// =============================================================================

/// Object file
pub const MH_OBJECT: u32 = 0x1;
/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// Dynamic link editor
pub const MH_DYLINKER: u32 = 0x7;
/// Bundle
pub const MH_BUNDLE: u32 = 0x8;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// 32-bit segment
pub const LC_SEGMENT: u32 = 0x1;
/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// Dynamic link-edit symbol table info
pub const LC_DYSYMTAB: u32 = 0xB;
/// Load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Dynamically linked shared lib identification
pub const LC_ID_DYLIB: u32 = 0xD;
/// Load a dynamic linker
pub const LC_LOAD_DYLINKER: u32 = 0xE;
/// Dynamic linker identification
pub const LC_ID_DYLINKER: u32 = 0xF;
/// Load a weak dynamically linked shared library
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// UUID
pub const LC_UUID: u32 = 0x1B;
/// Runpath additions
pub const LC_RPATH: u32 = 0x1C | LC_REQ_DYLD;
/// Location of code signature
pub const LC_CODE_SIGNATURE: u32 = 0x1D;
/// Load and re-export dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Delay load of dylib
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
/// Compressed dyld info
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed dyld info only
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Load upward dylib
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
/// Build for macOS min version
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
/// Build for iOS min version
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
/// Main entry point (replacement for LC_UNIXTHREAD)
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
/// Source version
pub const LC_SOURCE_VERSION: u32 = 0x2A;
/// Build for tvOS min version
pub const LC_VERSION_MIN_TVOS: u32 = 0x2F;
/// Build for watchOS min version
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;
/// Build for platform min version
pub const LC_BUILD_VERSION: u32 = 0x32;

// =============================================================================
// Segment / Section Names
// =============================================================================

/// Zero page segment of executables.
pub const SEG_PAGEZERO: &str = "__PAGEZERO";
/// Text segment.
pub const SEG_TEXT: &str = "__TEXT";
/// Link-edit segment.
pub const SEG_LINKEDIT: &str = "__LINKEDIT";
/// Embedded Info.plist section (in `__TEXT`).
pub const SECT_INFO_PLIST: &str = "__info_plist";

// =============================================================================
// Symbol Types
// =============================================================================

/// If any of these bits set, a symbolic debugging entry
pub const N_STAB: u8 = 0xE0;
/// Private external symbol bit
pub const N_PEXT: u8 = 0x10;
/// Mask for the type bits
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;

/// Undefined symbol
pub const N_UNDF: u8 = 0x0;
/// Absolute symbol
pub const N_ABS: u8 = 0x2;
/// Defined in section number n_sect
pub const N_SECT: u8 = 0xE;
/// Prebound undefined
pub const N_PBUD: u8 = 0xC;
/// Indirect
pub const N_INDR: u8 = 0xA;

// =============================================================================
// Library Ordinals (upper byte of n_desc)
// =============================================================================

/// The symbol binds against its own image.
pub const SELF_LIBRARY_ORDINAL: u8 = 0x00;
/// The symbol is resolved by flat namespace lookup at runtime.
pub const DYNAMIC_LOOKUP_ORDINAL: u8 = 0xFE;
/// The symbol binds against the main executable.
pub const EXECUTABLE_ORDINAL: u8 = 0xFF;

// =============================================================================
// Bind Opcodes (dyld info streams)
// =============================================================================

/// Mask extracting the opcode from a bind byte.
pub const BIND_OPCODE_MASK: u8 = 0xF0;
/// Mask extracting the immediate from a bind byte.
pub const BIND_IMMEDIATE_MASK: u8 = 0x0F;

/// End of stream / lazy entry separator.
pub const BIND_OPCODE_DONE: u8 = 0x00;
/// Set library ordinal from the immediate.
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
/// Set library ordinal from a trailing ULEB128.
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
/// Set a special (sentinel) library ordinal from the signed immediate.
pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
/// Set symbol name (trailing C string) and flags (immediate).
pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
/// Set bind type from the immediate.
pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
/// Set addend from a trailing SLEB128.
pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
/// Set segment (immediate) and offset (trailing ULEB128).
pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
/// Advance the offset by a trailing ULEB128.
pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
/// Perform a bind.
pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
/// Bind, then advance by a trailing ULEB128.
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
/// Bind, then advance by immediate * pointer size.
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
/// Bind ULEB times, skipping ULEB between binds.
pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;

/// Special ordinal: this image.
pub const BIND_SPECIAL_DYLIB_SELF: i64 = 0;
/// Special ordinal: the main executable.
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i64 = -1;
/// Special ordinal: flat namespace lookup.
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i64 = -2;

// =============================================================================
// Build Version Platforms
// =============================================================================

/// macOS platform for LC_BUILD_VERSION.
pub const PLATFORM_MACOS: u32 = 1;
/// iOS platform for LC_BUILD_VERSION.
pub const PLATFORM_IOS: u32 = 2;

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The object file has no undefined references
        const NOUNDEFS = 0x1;
        /// The object file is input for the dynamic linker
        const DYLDLINK = 0x4;
        /// The image is using two-level name space bindings
        const TWOLEVEL = 0x80;
        /// The final linked image contains external weak symbols
        const WEAK_DEFINES = 0x8000;
        /// The final linked image uses weak symbols
        const BINDS_TO_WEAK = 0x10000;
        /// The static linker does not need to examine dependent dylibs for re-exports
        const NO_REEXPORTED_DYLIBS = 0x100000;
        /// The OS will load the main executable at a random address
        const PIE = 0x200000;
        /// Contains a section of type S_THREAD_LOCAL_VARIABLES
        const HAS_TLV_DESCRIPTORS = 0x800000;
        /// The code was linked for use in an application extension
        const APP_EXTENSION_SAFE = 0x2000000;
    }
}
