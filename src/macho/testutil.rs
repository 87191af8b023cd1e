//! Synthetic Mach-O fixtures for tests.
//!
//! Builds small but structurally complete 64-bit executables out of the
//! crate's own on-disk structs: zero page, `__TEXT` with sections, a
//! `__LINKEDIT` carrying a symbol table and dyld-info bind streams, dependency
//! dylibs, and the executable-only commands the rewriter strips.

use byteorder::{BigEndian, ByteOrder};
use zerocopy::IntoBytes;

use crate::util::write_uleb128;

use super::constants::*;
use super::image::Command;
use super::structs::*;

/// File size of a generated slice.
const SLICE_SIZE: usize = 0x4000;
/// File offset of `__text` (and the floor of the load-command region).
const TEXT_OFFSET: u32 = 0x800;
const INFO_PLIST_OFFSET: u32 = 0x900;
const BIND_OFFSET: u32 = 0x1800;
const LAZY_BIND_OFFSET: u32 = 0x1900;
const SYM_OFFSET: u32 = 0x2000;
const STR_OFFSET: u32 = 0x2200;
const STR_SIZE: u32 = 0x200;
const CODESIG_OFFSET: u32 = 0x3000;

/// One classic symbol table entry in the fixture.
pub struct SymbolSpec {
    pub name: String,
    /// Library ordinal packed into n_desc (undefined symbols only).
    pub ordinal: u8,
    /// Defined symbols get N_SECT and a value; undefined get N_UNDF.
    pub defined: bool,
}

impl SymbolSpec {
    pub fn undefined(name: &str, ordinal: u8) -> Self {
        Self {
            name: name.into(),
            ordinal,
            defined: false,
        }
    }

    pub fn defined(name: &str) -> Self {
        Self {
            name: name.into(),
            ordinal: 0,
            defined: true,
        }
    }
}

/// One bind record in a fixture opcode stream.
pub struct BindSpec {
    pub symbol: String,
    pub ordinal: i64,
    pub segment: u8,
    pub offset: u64,
}

impl BindSpec {
    pub fn new(symbol: &str, ordinal: i64) -> Self {
        Self {
            symbol: symbol.into(),
            ordinal,
            segment: 1,
            offset: 0,
        }
    }
}

/// Shape of a generated executable slice.
pub struct ExecutableSpec {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub deps: Vec<String>,
    pub symbols: Vec<SymbolSpec>,
    pub binds: Vec<BindSpec>,
    pub lazy_binds: Vec<BindSpec>,
    pub with_info_plist: bool,
    pub with_code_signature: bool,
}

impl Default for ExecutableSpec {
    fn default() -> Self {
        Self {
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_EXECUTE,
            deps: vec![
                "/usr/lib/libSystem.B.dylib".into(),
                "/usr/lib/libA.dylib".into(),
            ],
            symbols: vec![
                SymbolSpec::undefined("_foo", 2),
                SymbolSpec::defined("_main"),
                SymbolSpec::undefined("_bar", 1),
            ],
            binds: vec![BindSpec::new("_foo", 2)],
            lazy_binds: vec![BindSpec {
                offset: 8,
                ..BindSpec::new("_bar", 1)
            }],
            with_info_plist: false,
            with_code_signature: true,
        }
    }
}

fn name16(name: &str) -> [u8; 16] {
    let mut raw = [0u8; 16];
    let bytes = name.as_bytes();
    raw[..bytes.len().min(16)].copy_from_slice(&bytes[..bytes.len().min(16)]);
    raw
}

/// Encodes a bind opcode stream from bind records.
///
/// Lazy streams terminate each record with DONE (the separator dyld expects);
/// regular streams carry a single trailing DONE.
pub fn encode_bind_stream(binds: &[BindSpec], lazy: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for bind in binds {
        if bind.ordinal > 0 && bind.ordinal <= 15 {
            out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | bind.ordinal as u8);
        } else if bind.ordinal > 15 {
            out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
            write_uleb128(&mut out, bind.ordinal as u64);
        } else {
            out.push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | (bind.ordinal as u8 & 0x0F));
        }
        out.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        out.extend_from_slice(bind.symbol.as_bytes());
        out.push(0);
        out.push(BIND_OPCODE_SET_TYPE_IMM | 1);
        out.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | bind.segment);
        write_uleb128(&mut out, bind.offset);
        out.push(BIND_OPCODE_DO_BIND);
        if lazy {
            out.push(BIND_OPCODE_DONE);
        }
    }
    if !lazy {
        out.push(BIND_OPCODE_DONE);
    }
    out
}

/// Builds a complete synthetic 64-bit executable slice.
pub fn build_executable(spec: &ExecutableSpec) -> Vec<u8> {
    let mut data = vec![0u8; SLICE_SIZE];
    let mut commands: Vec<Vec<u8>> = Vec::new();

    let text_base: u64 = 0x1_0000_0000;

    // __PAGEZERO
    let mut pagezero = SegmentCommand64 {
        vmsize: text_base,
        ..Default::default()
    };
    pagezero.set_name(SEG_PAGEZERO);
    commands.push(pagezero.as_bytes().to_vec());

    // __TEXT with __text (and optionally __info_plist)
    let nsects: u32 = if spec.with_info_plist { 2 } else { 1 };
    let mut text = SegmentCommand64 {
        cmdsize: (SegmentCommand64::SIZE + nsects as usize * Section64::SIZE) as u32,
        vmaddr: text_base,
        vmsize: 0x1000,
        fileoff: 0,
        filesize: 0x1000,
        maxprot: 5,
        initprot: 5,
        nsects,
        ..Default::default()
    };
    text.set_name(SEG_TEXT);
    let mut text_bytes = text.as_bytes().to_vec();
    let text_sect = Section64 {
        sectname: name16("__text"),
        segname: name16(SEG_TEXT),
        addr: text_base + TEXT_OFFSET as u64,
        size: 0x100,
        offset: TEXT_OFFSET,
        align: 2,
        ..Default::default()
    };
    text_bytes.extend_from_slice(text_sect.as_bytes());
    if spec.with_info_plist {
        let plist_sect = Section64 {
            sectname: name16(SECT_INFO_PLIST),
            segname: name16(SEG_TEXT),
            addr: text_base + INFO_PLIST_OFFSET as u64,
            size: 0x40,
            offset: INFO_PLIST_OFFSET,
            ..Default::default()
        };
        text_bytes.extend_from_slice(plist_sect.as_bytes());
        data[INFO_PLIST_OFFSET as usize..INFO_PLIST_OFFSET as usize + 0x40].fill(b'p');
    }
    commands.push(text_bytes);

    // __LINKEDIT
    let mut linkedit = SegmentCommand64 {
        vmaddr: text_base + 0x1000,
        vmsize: 0x3000,
        fileoff: 0x1000,
        filesize: (SLICE_SIZE - 0x1000) as u64,
        maxprot: 1,
        initprot: 1,
        ..Default::default()
    };
    linkedit.set_name(SEG_LINKEDIT);
    commands.push(linkedit.as_bytes().to_vec());

    // Dynamic linker
    let dylinker_path = b"/usr/lib/dyld";
    let dylinker_size = (12 + dylinker_path.len() + 1 + 7) & !7;
    let mut dylinker = vec![0u8; dylinker_size];
    byteorder::LittleEndian::write_u32(&mut dylinker[0..], LC_LOAD_DYLINKER);
    byteorder::LittleEndian::write_u32(&mut dylinker[4..], dylinker_size as u32);
    byteorder::LittleEndian::write_u32(&mut dylinker[8..], 12);
    dylinker[12..12 + dylinker_path.len()].copy_from_slice(dylinker_path);
    commands.push(dylinker);

    // Entry point
    let main_cmd = EntryPointCommand {
        cmd: LC_MAIN,
        cmdsize: EntryPointCommand::SIZE as u32,
        entryoff: TEXT_OFFSET as u64,
        stacksize: 0,
    };
    commands.push(main_cmd.as_bytes().to_vec());

    // Source version
    let source_version = SourceVersionCommand {
        cmd: LC_SOURCE_VERSION,
        cmdsize: SourceVersionCommand::SIZE as u32,
        version: 0,
    };
    commands.push(source_version.as_bytes().to_vec());

    // Minimum OS version (macOS 10.14)
    let version_min = VersionMinCommand {
        cmd: LC_VERSION_MIN_MACOSX,
        cmdsize: VersionMinCommand::SIZE as u32,
        version: pack_version(10, 14, 0),
        sdk: pack_version(10, 14, 0),
    };
    commands.push(version_min.as_bytes().to_vec());

    // Dependencies
    for dep in &spec.deps {
        commands.push(
            Command::dylib(LC_LOAD_DYLIB, dep, 2, 0x0001_0000, 0x0001_0000)
                .bytes()
                .to_vec(),
        );
    }

    // Dyld info with bind and lazy-bind streams
    let bind_stream = encode_bind_stream(&spec.binds, false);
    let lazy_stream = encode_bind_stream(&spec.lazy_binds, true);
    assert!(bind_stream.len() <= (LAZY_BIND_OFFSET - BIND_OFFSET) as usize);
    assert!(lazy_stream.len() <= (SYM_OFFSET - LAZY_BIND_OFFSET) as usize);
    data[BIND_OFFSET as usize..BIND_OFFSET as usize + bind_stream.len()]
        .copy_from_slice(&bind_stream);
    data[LAZY_BIND_OFFSET as usize..LAZY_BIND_OFFSET as usize + lazy_stream.len()]
        .copy_from_slice(&lazy_stream);
    let dyld_info = DyldInfoCommand {
        bind_off: if bind_stream.is_empty() { 0 } else { BIND_OFFSET },
        bind_size: bind_stream.len() as u32,
        lazy_bind_off: if lazy_stream.is_empty() {
            0
        } else {
            LAZY_BIND_OFFSET
        },
        lazy_bind_size: lazy_stream.len() as u32,
        ..Default::default()
    };
    commands.push(dyld_info.as_bytes().to_vec());

    // Symbol and string tables
    let mut strtab: Vec<u8> = vec![0];
    let mut nlist_bytes = Vec::new();
    for symbol in &spec.symbols {
        let n_strx = strtab.len() as u32;
        strtab.extend_from_slice(symbol.name.as_bytes());
        strtab.push(0);
        let entry = if symbol.defined {
            Nlist64 {
                n_strx,
                n_type: N_SECT | N_EXT,
                n_sect: 1,
                n_desc: 0,
                n_value: text_base + TEXT_OFFSET as u64,
            }
        } else {
            Nlist64 {
                n_strx,
                n_type: N_UNDF | N_EXT,
                n_sect: 0,
                n_desc: (symbol.ordinal as u16) << 8,
                n_value: 0,
            }
        };
        nlist_bytes.extend_from_slice(entry.as_bytes());
    }
    assert!(strtab.len() <= STR_SIZE as usize);
    data[SYM_OFFSET as usize..SYM_OFFSET as usize + nlist_bytes.len()]
        .copy_from_slice(&nlist_bytes);
    data[STR_OFFSET as usize..STR_OFFSET as usize + strtab.len()].copy_from_slice(&strtab);
    let symtab = SymtabCommand {
        symoff: SYM_OFFSET,
        nsyms: spec.symbols.len() as u32,
        stroff: STR_OFFSET,
        strsize: STR_SIZE,
        ..Default::default()
    };
    commands.push(symtab.as_bytes().to_vec());

    // Code signature at the file tail
    if spec.with_code_signature {
        let codesig = LinkeditDataCommand {
            cmd: LC_CODE_SIGNATURE,
            cmdsize: LinkeditDataCommand::SIZE as u32,
            dataoff: CODESIG_OFFSET,
            datasize: (SLICE_SIZE - CODESIG_OFFSET as usize) as u32,
        };
        commands.push(codesig.as_bytes().to_vec());
        data[CODESIG_OFFSET as usize..].fill(b's');
    }

    // Assemble header + command table
    let sizeofcmds: usize = commands.iter().map(|c| c.len()).sum();
    assert!(MachHeader64::SIZE + sizeofcmds <= TEXT_OFFSET as usize);
    let header = MachHeader64 {
        magic: MH_MAGIC_64,
        cputype: spec.cputype,
        cpusubtype: spec.cpusubtype,
        filetype: spec.filetype,
        ncmds: commands.len() as u32,
        sizeofcmds: sizeofcmds as u32,
        flags: MachOFlags::NOUNDEFS.bits()
            | MachOFlags::DYLDLINK.bits()
            | MachOFlags::TWOLEVEL.bits()
            | MachOFlags::PIE.bits(),
        reserved: 0,
    };
    data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
    let mut offset = MachHeader64::SIZE;
    for command in &commands {
        data[offset..offset + command.len()].copy_from_slice(command);
        offset += command.len();
    }

    data
}

/// Wraps thin slices into a universal (fat) container.
pub fn build_fat(slices: &[Vec<u8>]) -> Vec<u8> {
    const ALIGN: u32 = 14; // 16 KiB slice alignment
    let header_len = 8 + slices.len() * 20;
    let mut offsets = Vec::new();
    let mut pos = header_len as u64;
    for slice in slices {
        pos = crate::util::align_up(pos, 1 << ALIGN);
        offsets.push(pos);
        pos += slice.len() as u64;
    }

    let mut out = vec![0u8; pos as usize];
    BigEndian::write_u32(&mut out[0..], FAT_MAGIC);
    BigEndian::write_u32(&mut out[4..], slices.len() as u32);
    for (i, slice) in slices.iter().enumerate() {
        let cputype = crate::util::read_u32_le_at(slice, 4);
        let cpusubtype = crate::util::read_u32_le_at(slice, 8);
        let entry = 8 + i * 20;
        BigEndian::write_u32(&mut out[entry..], cputype);
        BigEndian::write_u32(&mut out[entry + 4..], cpusubtype);
        BigEndian::write_u32(&mut out[entry + 8..], offsets[i] as u32);
        BigEndian::write_u32(&mut out[entry + 12..], slice.len() as u32);
        BigEndian::write_u32(&mut out[entry + 16..], ALIGN);
        out[offsets[i] as usize..offsets[i] as usize + slice.len()].copy_from_slice(slice);
    }
    out
}
