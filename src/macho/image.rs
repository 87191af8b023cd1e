//! Parsed Mach-O slice with a mutable load-command table.
//!
//! [`MachImage`] owns a copy of one slice's bytes plus an owned list of load
//! commands. The rewriter removes, edits, and appends commands freely;
//! [`MachImage::sync`] rebuilds the on-disk command table in place before the
//! slice is serialized. Raw data (symbol tables, bind streams, section
//! contents) is patched directly in the byte buffer.

use tracing::trace;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::error::{Error, Result};
use crate::util::{align_up, read_cstr, read_u32_le_at};

use super::constants::*;
use super::structs::*;

// =============================================================================
// Load Command
// =============================================================================

/// One load command, held as raw bytes with typed views.
///
/// Keeping the raw encoding makes pass-through of command types the rewriter
/// does not touch trivial: rebuilding the table is a concatenation.
#[derive(Debug, Clone)]
pub struct Command {
    bytes: Vec<u8>,
}

impl Command {
    /// Wraps raw command bytes. The length must match the encoded `cmdsize`.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < LoadCommand::SIZE {
            return Err(Error::buffer_too_small(LoadCommand::SIZE, bytes.len()));
        }
        let cmdsize = read_u32_le_at(&bytes, 4) as usize;
        if cmdsize != bytes.len() {
            return Err(Error::parse(0, "load command size does not match payload"));
        }
        Ok(Self { bytes })
    }

    /// Returns the command type.
    #[inline]
    pub fn cmd(&self) -> u32 {
        read_u32_le_at(&self.bytes, 0)
    }

    /// Returns the command size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Returns the raw command bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns true for segment commands of either width.
    #[inline]
    pub fn is_segment(&self) -> bool {
        matches!(self.cmd(), LC_SEGMENT | LC_SEGMENT_64)
    }

    /// Returns true for dependency-dylib commands (the identity command is
    /// not a dependency).
    #[inline]
    pub fn is_dependency_dylib(&self) -> bool {
        matches!(
            self.cmd(),
            LC_LOAD_DYLIB
                | LC_LOAD_WEAK_DYLIB
                | LC_REEXPORT_DYLIB
                | LC_LAZY_LOAD_DYLIB
                | LC_LOAD_UPWARD_DYLIB
        )
    }

    /// Reads a typed view of the command prefix.
    pub fn read_struct<T: FromBytes>(&self) -> Option<T> {
        T::read_from_prefix(&self.bytes).ok().map(|(v, _)| v)
    }

    /// Overwrites the command prefix with a typed structure.
    pub fn write_struct<T: IntoBytes + Immutable>(&mut self, value: &T) {
        let src = value.as_bytes();
        self.bytes[..src.len()].copy_from_slice(src);
    }

    /// Returns the dylib path for dylib commands (load or identity).
    pub fn dylib_name(&self) -> Option<&str> {
        let dylib: DylibCommand = self.read_struct()?;
        let name_offset = dylib.dylib.name_offset as usize;
        read_cstr(&self.bytes, name_offset).ok()
    }

    /// Returns the segment name for segment commands of either width.
    pub fn segment_name(&self) -> Option<&str> {
        if !self.is_segment() || self.bytes.len() < 24 {
            return None;
        }
        // segname occupies bytes 8..24 in both widths
        let end = self.bytes[8..24].iter().position(|&b| b == 0).unwrap_or(16);
        std::str::from_utf8(&self.bytes[8..8 + end]).ok()
    }

    /// Builds a dylib command (`LC_LOAD_DYLIB`, `LC_ID_DYLIB`, ...) with the
    /// given path and version fields.
    pub fn dylib(
        cmd: u32,
        path: &str,
        timestamp: u32,
        current_version: u32,
        compatibility_version: u32,
    ) -> Self {
        let cmdsize = align_up((DylibCommand::SIZE + path.len() + 1) as u64, 8) as usize;
        let header = DylibCommand {
            cmd,
            cmdsize: cmdsize as u32,
            dylib: Dylib {
                name_offset: DylibCommand::SIZE as u32,
                timestamp,
                current_version,
                compatibility_version,
            },
        };
        let mut bytes = vec![0u8; cmdsize];
        bytes[..DylibCommand::SIZE].copy_from_slice(header.as_bytes());
        bytes[DylibCommand::SIZE..DylibCommand::SIZE + path.len()]
            .copy_from_slice(path.as_bytes());
        Self { bytes }
    }

    /// Builds a build-version command with no tool entries.
    pub fn build_version(platform: u32, minos: u32, sdk: u32) -> Self {
        let header = BuildVersionCommand {
            cmd: LC_BUILD_VERSION,
            cmdsize: BuildVersionCommand::SIZE as u32,
            platform,
            minos,
            sdk,
            ntools: 0,
        };
        Self {
            bytes: header.as_bytes().to_vec(),
        }
    }

    /// Removes a named section from a segment command, returning the removed
    /// section's file range. The caller is responsible for scrubbing the
    /// referenced bytes.
    pub fn remove_section(&mut self, sectname: &str) -> Option<(u64, u64)> {
        match self.cmd() {
            LC_SEGMENT_64 => {
                let seg: SegmentCommand64 = self.read_struct()?;
                for i in 0..seg.nsects as usize {
                    let off = SegmentCommand64::SIZE + i * Section64::SIZE;
                    let sect = Section64::read_from_prefix(self.bytes.get(off..)?).ok()?.0;
                    if sect.name() == sectname {
                        self.bytes.drain(off..off + Section64::SIZE);
                        let mut seg = seg;
                        seg.nsects -= 1;
                        seg.cmdsize -= Section64::SIZE as u32;
                        self.write_struct(&seg);
                        return Some((sect.offset as u64, sect.size));
                    }
                }
                None
            }
            LC_SEGMENT => {
                let seg: SegmentCommand32 = self.read_struct()?;
                for i in 0..seg.nsects as usize {
                    let off = SegmentCommand32::SIZE + i * Section32::SIZE;
                    let sect = Section32::read_from_prefix(self.bytes.get(off..)?).ok()?.0;
                    if sect.name() == sectname {
                        self.bytes.drain(off..off + Section32::SIZE);
                        let mut seg = seg;
                        seg.nsects -= 1;
                        seg.cmdsize -= Section32::SIZE as u32;
                        self.write_struct(&seg);
                        return Some((sect.offset as u64, sect.size as u64));
                    }
                }
                None
            }
            _ => None,
        }
    }

    /// Iterates the file offsets of sections with file content (offset != 0).
    fn section_file_offsets(&self) -> Vec<u32> {
        let mut offsets = Vec::new();
        match self.cmd() {
            LC_SEGMENT_64 => {
                if let Some(seg) = self.read_struct::<SegmentCommand64>() {
                    for i in 0..seg.nsects as usize {
                        let off = SegmentCommand64::SIZE + i * Section64::SIZE;
                        let Some(tail) = self.bytes.get(off..) else { break };
                        if let Ok((sect, _)) = Section64::read_from_prefix(tail) {
                            if sect.offset != 0 {
                                offsets.push(sect.offset);
                            }
                        }
                    }
                }
            }
            LC_SEGMENT => {
                if let Some(seg) = self.read_struct::<SegmentCommand32>() {
                    for i in 0..seg.nsects as usize {
                        let off = SegmentCommand32::SIZE + i * Section32::SIZE;
                        let Some(tail) = self.bytes.get(off..) else { break };
                        if let Ok((sect, _)) = Section32::read_from_prefix(tail) {
                            if sect.offset != 0 {
                                offsets.push(sect.offset);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        offsets
    }
}

// =============================================================================
// Image Header
// =============================================================================

/// Width-independent view of a slice's Mach-O header.
#[derive(Debug, Clone, Copy)]
pub struct ImageHeader {
    /// Magic number
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Flags
    pub flags: u32,
}

impl ImageHeader {
    /// Returns the architecture as a string.
    pub fn arch_name(&self) -> &'static str {
        match self.cputype {
            CPU_TYPE_ARM64 => "arm64",
            CPU_TYPE_X86_64 => "x86_64",
            CPU_TYPE_ARM => "armv7",
            CPU_TYPE_X86 => "i386",
            _ => "unknown",
        }
    }
}

// =============================================================================
// Mach Image
// =============================================================================

/// One parsed Mach-O slice, mutable in place.
#[derive(Debug, Clone)]
pub struct MachImage {
    /// Width-independent header fields
    pub header: ImageHeader,
    /// True for 64-bit slices
    pub is64: bool,
    /// The slice bytes (header and command table are refreshed by `sync`)
    pub data: Vec<u8>,
    /// Owned load-command list, in load order
    pub commands: Vec<Command>,
    /// End of the region available for load commands (absolute offset)
    cmds_capacity: usize,
    /// End of the command bytes currently written to `data`
    cmds_end: usize,
}

impl MachImage {
    /// Parses one slice from raw bytes (the slice is copied).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MachHeader32::SIZE {
            return Err(Error::buffer_too_small(MachHeader32::SIZE, data.len()));
        }

        let magic = read_u32_le_at(data, 0);
        let is64 = match magic {
            MH_MAGIC_64 => true,
            MH_MAGIC => false,
            MH_CIGAM | MH_CIGAM_64 => return Err(Error::UnsupportedMagic(magic)),
            other => return Err(Error::InvalidMagic(other)),
        };

        let (header, ncmds, sizeofcmds) = if is64 {
            let raw = MachHeader64::read_from_prefix(data)
                .map_err(|_| Error::buffer_too_small(MachHeader64::SIZE, data.len()))?
                .0;
            (
                ImageHeader {
                    magic: raw.magic,
                    cputype: raw.cputype,
                    cpusubtype: raw.cpusubtype,
                    filetype: raw.filetype,
                    flags: raw.flags,
                },
                raw.ncmds,
                raw.sizeofcmds,
            )
        } else {
            let raw = MachHeader32::read_from_prefix(data)
                .map_err(|_| Error::buffer_too_small(MachHeader32::SIZE, data.len()))?
                .0;
            (
                ImageHeader {
                    magic: raw.magic,
                    cputype: raw.cputype,
                    cpusubtype: raw.cpusubtype,
                    filetype: raw.filetype,
                    flags: raw.flags,
                },
                raw.ncmds,
                raw.sizeofcmds,
            )
        };

        let header_size = if is64 {
            MachHeader64::SIZE
        } else {
            MachHeader32::SIZE
        };

        let mut commands = Vec::with_capacity(ncmds as usize);
        let mut offset = header_size;
        let cmds_end = header_size + sizeofcmds as usize;

        for _ in 0..ncmds {
            if offset + LoadCommand::SIZE > cmds_end || offset + LoadCommand::SIZE > data.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }
            let cmdsize = read_u32_le_at(data, offset + 4) as usize;
            if cmdsize < LoadCommand::SIZE {
                return Err(Error::parse(offset, "load command smaller than its header"));
            }
            if offset + cmdsize > data.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }
            commands.push(Command::from_bytes(data[offset..offset + cmdsize].to_vec())?);
            offset += cmdsize;
        }

        let mut image = Self {
            header,
            is64,
            data: data.to_vec(),
            commands,
            cmds_capacity: cmds_end.min(data.len()),
            cmds_end: cmds_end.min(data.len()),
        };

        // Load commands may grow into the gap before the first section's
        // file content.
        if let Some(first) = image.first_section_offset() {
            let first = first as usize;
            if first >= image.cmds_end && first <= image.data.len() {
                image.cmds_capacity = first;
            }
        }

        Ok(image)
    }

    /// Returns the header size for this slice's width.
    #[inline]
    pub fn header_size(&self) -> usize {
        if self.is64 {
            MachHeader64::SIZE
        } else {
            MachHeader32::SIZE
        }
    }

    /// Returns the smallest nonzero section file offset across all segments.
    pub fn first_section_offset(&self) -> Option<u32> {
        self.commands
            .iter()
            .flat_map(|c| c.section_file_offsets())
            .min()
    }

    /// Returns the index of the first command of the given type.
    pub fn find_command(&self, cmd: u32) -> Option<usize> {
        self.commands.iter().position(|c| c.cmd() == cmd)
    }

    /// Removes the command at `index` and returns it.
    pub fn remove_command(&mut self, index: usize) -> Command {
        self.commands.remove(index)
    }

    /// Iterates dependency dylib names in load order (identity excluded).
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.commands
            .iter()
            .filter(|c| c.is_dependency_dylib())
            .filter_map(|c| c.dylib_name())
    }

    /// Returns the symbol table command, if present.
    pub fn symtab(&self) -> Option<SymtabCommand> {
        self.find_command(LC_SYMTAB)
            .and_then(|i| self.commands[i].read_struct())
    }

    /// Returns the dyld info command and its index, if present.
    pub fn dyld_info(&self) -> Option<(usize, DyldInfoCommand)> {
        self.commands
            .iter()
            .position(|c| matches!(c.cmd(), LC_DYLD_INFO | LC_DYLD_INFO_ONLY))
            .and_then(|i| self.commands[i].read_struct::<DyldInfoCommand>().map(|d| (i, d)))
    }

    /// Returns the index of the named segment command.
    pub fn segment_index(&self, name: &str) -> Option<usize> {
        self.commands
            .iter()
            .position(|c| c.is_segment() && c.segment_name() == Some(name))
    }

    /// Removes a section from the named segment and scrubs its contents.
    ///
    /// Returns true if the section existed.
    pub fn remove_section(&mut self, segname: &str, sectname: &str) -> bool {
        let Some(idx) = self.segment_index(segname) else {
            return false;
        };
        let Some((offset, size)) = self.commands[idx].remove_section(sectname) else {
            return false;
        };
        let start = (offset as usize).min(self.data.len());
        let end = ((offset + size) as usize).min(self.data.len());
        self.data[start..end].fill(0);
        true
    }

    /// Returns the `__LINKEDIT` file range as `(fileoff, filesize)`.
    pub fn linkedit_file_range(&self) -> Option<(u64, u64)> {
        let idx = self.segment_index(SEG_LINKEDIT)?;
        let cmd = &self.commands[idx];
        if self.is64 {
            let seg: SegmentCommand64 = cmd.read_struct()?;
            Some((seg.fileoff, seg.filesize))
        } else {
            let seg: SegmentCommand32 = cmd.read_struct()?;
            Some((seg.fileoff as u64, seg.filesize as u64))
        }
    }

    /// Sets the `__LINKEDIT` segment to end at the given absolute file offset.
    pub fn set_linkedit_file_end(&mut self, end: u64) -> Result<()> {
        let idx = self
            .segment_index(SEG_LINKEDIT)
            .ok_or_else(|| Error::SegmentNotFound {
                name: SEG_LINKEDIT.into(),
            })?;
        let page: u64 = if self.is64 { 0x4000 } else { 0x1000 };
        let cmd = &mut self.commands[idx];
        if self.is64 {
            let mut seg: SegmentCommand64 = cmd.read_struct().ok_or_else(|| {
                Error::parse(0, "malformed __LINKEDIT segment command")
            })?;
            seg.filesize = end.saturating_sub(seg.fileoff);
            seg.vmsize = align_up(seg.filesize, page);
            cmd.write_struct(&seg);
        } else {
            let mut seg: SegmentCommand32 = cmd.read_struct().ok_or_else(|| {
                Error::parse(0, "malformed __LINKEDIT segment command")
            })?;
            seg.filesize = end.saturating_sub(seg.fileoff as u64) as u32;
            seg.vmsize = align_up(seg.filesize as u64, page) as u32;
            cmd.write_struct(&seg);
        }
        Ok(())
    }

    /// Appends bytes to the end of the file, growing `__LINKEDIT` to cover
    /// them. Returns the absolute file offset of the appended bytes.
    pub fn append_to_linkedit(&mut self, bytes: &[u8]) -> Result<u64> {
        while self.data.len() % 8 != 0 {
            self.data.push(0);
        }
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        let end = self.data.len() as u64;
        self.set_linkedit_file_end(end)?;
        trace!(
            "relocated {} bytes to end of __LINKEDIT at {:#x}",
            bytes.len(),
            offset
        );
        Ok(offset)
    }

    /// Truncates the file at the given offset, shrinking `__LINKEDIT`.
    pub fn truncate_tail(&mut self, end: u64) -> Result<()> {
        self.data.truncate(end as usize);
        self.set_linkedit_file_end(end)
    }

    /// Reads data at the specified offset within the slice.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        if offset + len > self.data.len() {
            return Err(Error::buffer_too_small(offset + len, self.data.len()));
        }
        Ok(&self.data[offset..offset + len])
    }

    /// Writes data at the specified offset within the slice.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.data.len() {
            return Err(Error::buffer_too_small(
                offset + data.len(),
                self.data.len(),
            ));
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Rebuilds the header and load-command table in the data buffer.
    ///
    /// Fails if the command table no longer fits below the first section's
    /// file content.
    pub fn sync(&mut self) -> Result<()> {
        let header_size = self.header_size();
        let sizeofcmds: usize = self.commands.iter().map(|c| c.size()).sum();
        let new_end = header_size + sizeofcmds;

        if new_end > self.cmds_capacity {
            return Err(Error::InsufficientLoadCommandSpace {
                needed: new_end,
                available: self.cmds_capacity,
            });
        }

        if self.is64 {
            let raw = MachHeader64 {
                magic: self.header.magic,
                cputype: self.header.cputype,
                cpusubtype: self.header.cpusubtype,
                filetype: self.header.filetype,
                ncmds: self.commands.len() as u32,
                sizeofcmds: sizeofcmds as u32,
                flags: self.header.flags,
                reserved: 0,
            };
            self.data[..MachHeader64::SIZE].copy_from_slice(raw.as_bytes());
        } else {
            let raw = MachHeader32 {
                magic: self.header.magic,
                cputype: self.header.cputype,
                cpusubtype: self.header.cpusubtype,
                filetype: self.header.filetype,
                ncmds: self.commands.len() as u32,
                sizeofcmds: sizeofcmds as u32,
                flags: self.header.flags,
            };
            self.data[..MachHeader32::SIZE].copy_from_slice(raw.as_bytes());
        }

        let mut offset = header_size;
        for command in &self.commands {
            self.data[offset..offset + command.size()].copy_from_slice(command.bytes());
            offset += command.size();
        }

        // Scrub the tail of the old command table.
        if self.cmds_end > offset {
            self.data[offset..self.cmds_end].fill(0);
        }
        self.cmds_end = offset;

        Ok(())
    }

    /// Syncs and consumes the image, returning the serialized slice bytes.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        self.sync()?;
        Ok(self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;

    #[test]
    fn test_parse_synthetic_executable() {
        let data = testutil::build_executable(&testutil::ExecutableSpec::default());
        let image = MachImage::parse(&data).unwrap();

        assert!(image.is64);
        assert_eq!(image.header.filetype, MH_EXECUTE);
        assert_eq!(image.header.cputype, CPU_TYPE_ARM64);
        let deps: Vec<_> = image.dependency_names().collect();
        assert_eq!(deps, vec!["/usr/lib/libSystem.B.dylib", "/usr/lib/libA.dylib"]);
        assert!(image.symtab().is_some());
        assert!(image.dyld_info().is_some());
        assert!(image.segment_index(SEG_PAGEZERO).is_some());
    }

    #[test]
    fn test_reject_truncated() {
        let data = testutil::build_executable(&testutil::ExecutableSpec::default());
        assert!(MachImage::parse(&data[..16]).is_err());
    }

    #[test]
    fn test_reject_bad_magic() {
        let mut data = testutil::build_executable(&testutil::ExecutableSpec::default());
        data[0] = 0x00;
        assert!(matches!(
            MachImage::parse(&data),
            Err(Error::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_remove_and_add_commands() {
        let data = testutil::build_executable(&testutil::ExecutableSpec::default());
        let mut image = MachImage::parse(&data).unwrap();
        let ncmds = image.commands.len();

        let idx = image.find_command(LC_MAIN).unwrap();
        image.remove_command(idx);

        image.commands.push(Command::dylib(
            LC_ID_DYLIB,
            "@executable_path/out.dylib",
            2,
            0x0001_0000,
            0x0001_0000,
        ));

        image.sync().unwrap();

        let reparsed = MachImage::parse(&image.data).unwrap();
        assert_eq!(reparsed.commands.len(), ncmds);
        assert!(reparsed.find_command(LC_MAIN).is_none());
        let id_idx = reparsed.find_command(LC_ID_DYLIB).unwrap();
        assert_eq!(
            reparsed.commands[id_idx].dylib_name(),
            Some("@executable_path/out.dylib")
        );
    }

    #[test]
    fn test_remove_section() {
        let spec = testutil::ExecutableSpec {
            with_info_plist: true,
            ..Default::default()
        };
        let data = testutil::build_executable(&spec);
        let mut image = MachImage::parse(&data).unwrap();

        assert!(image.remove_section(SEG_TEXT, SECT_INFO_PLIST));
        assert!(!image.remove_section(SEG_TEXT, SECT_INFO_PLIST));
        image.sync().unwrap();

        let reparsed = MachImage::parse(&image.data).unwrap();
        let text_idx = reparsed.segment_index(SEG_TEXT).unwrap();
        let seg: SegmentCommand64 = reparsed.commands[text_idx].read_struct().unwrap();
        assert_eq!(seg.nsects, 1);
    }

    #[test]
    fn test_linkedit_truncate_and_append() {
        let data = testutil::build_executable(&testutil::ExecutableSpec::default());
        let mut image = MachImage::parse(&data).unwrap();

        let (fileoff, _) = image.linkedit_file_range().unwrap();
        let old_len = image.data.len() as u64;

        image.truncate_tail(old_len - 0x100).unwrap();
        let (_, filesize) = image.linkedit_file_range().unwrap();
        assert_eq!(fileoff + filesize, old_len - 0x100);

        let appended = image.append_to_linkedit(&[0xAA; 16]).unwrap();
        assert_eq!(appended % 8, 0);
        let (_, filesize) = image.linkedit_file_range().unwrap();
        assert_eq!(fileoff + filesize, image.data.len() as u64);
    }

    #[test]
    fn test_command_table_overflow() {
        let data = testutil::build_executable(&testutil::ExecutableSpec::default());
        let mut image = MachImage::parse(&data).unwrap();

        // Stuff the table until it cannot fit below the first section.
        let path = "x".repeat(200);
        for _ in 0..64 {
            image
                .commands
                .push(Command::dylib(LC_LOAD_DYLIB, &path, 2, 0, 0));
        }
        assert!(matches!(
            image.sync(),
            Err(Error::InsufficientLoadCommandSpace { .. })
        ));
    }
}
