//! Thin and universal (fat) Mach-O containers.
//!
//! Fat headers are big-endian; slice payloads are little-endian. Slices are
//! re-laid-out on write with their recorded alignment, since a rewritten
//! slice may have shrunk (signature removal) or grown (relocated bind
//! streams).

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use crate::error::{Error, Result};
use crate::util::align_up;

use super::constants::{FAT_MAGIC, FAT_MAGIC_64};
use super::image::MachImage;

/// Size of the fat header.
const FAT_HEADER_SIZE: usize = 8;
/// Size of one fat arch entry.
const FAT_ARCH_SIZE: usize = 20;

/// One slice of a universal binary, with its container alignment.
#[derive(Debug, Clone)]
pub struct FatSlice {
    /// The parsed slice
    pub image: MachImage,
    /// Alignment of the slice within the container (as a power of two)
    pub align: u32,
}

/// A Mach-O file: either a single thin slice or a universal container.
#[derive(Debug, Clone)]
pub struct MachFile {
    slices: Vec<FatSlice>,
    fat: bool,
}

impl MachFile {
    /// Parses a thin or universal Mach-O file.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FAT_HEADER_SIZE {
            return Err(Error::buffer_too_small(FAT_HEADER_SIZE, data.len()));
        }

        let magic_be = BigEndian::read_u32(data);
        if magic_be == FAT_MAGIC_64 {
            return Err(Error::UnsupportedMagic(magic_be));
        }
        if magic_be != FAT_MAGIC {
            let image = MachImage::parse(data)?;
            debug!("thin input: {}", image.header.arch_name());
            return Ok(Self {
                slices: vec![FatSlice { image, align: 0 }],
                fat: false,
            });
        }

        let nfat_arch = BigEndian::read_u32(&data[4..]) as usize;
        let mut slices = Vec::with_capacity(nfat_arch);
        for index in 0..nfat_arch {
            let entry = FAT_HEADER_SIZE + index * FAT_ARCH_SIZE;
            if entry + FAT_ARCH_SIZE > data.len() {
                return Err(Error::FatSliceOutOfBounds {
                    index,
                    file_size: data.len() as u64,
                });
            }
            let offset = BigEndian::read_u32(&data[entry + 8..]) as usize;
            let size = BigEndian::read_u32(&data[entry + 12..]) as usize;
            let align = BigEndian::read_u32(&data[entry + 16..]);
            if offset.checked_add(size).is_none_or(|end| end > data.len()) {
                return Err(Error::FatSliceOutOfBounds {
                    index,
                    file_size: data.len() as u64,
                });
            }
            let image = MachImage::parse(&data[offset..offset + size])?;
            debug!("fat slice {}: {}", index, image.header.arch_name());
            slices.push(FatSlice { image, align });
        }

        Ok(Self { slices, fat: true })
    }

    /// Returns true for universal inputs.
    #[inline]
    pub fn is_fat(&self) -> bool {
        self.fat
    }

    /// Returns the slices in container order.
    pub fn slices(&self) -> &[FatSlice] {
        &self.slices
    }

    /// Returns the slices mutably.
    pub fn slices_mut(&mut self) -> &mut [FatSlice] {
        &mut self.slices
    }

    /// Serializes the file, re-syncing every slice's command table.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if !self.fat {
            return match self.slices.into_iter().next() {
                Some(slice) => slice.image.into_bytes(),
                None => Err(Error::parse(0, "thin file without a slice")),
            };
        }

        let mut payloads = Vec::with_capacity(self.slices.len());
        for slice in self.slices {
            payloads.push((slice.align, slice.image.header, slice.image.into_bytes()?));
        }

        let header_len = FAT_HEADER_SIZE + payloads.len() * FAT_ARCH_SIZE;
        let mut offsets = Vec::with_capacity(payloads.len());
        let mut pos = header_len as u64;
        for (align, _, bytes) in &payloads {
            let align = (*align).min(30);
            pos = align_up(pos, 1u64 << align);
            offsets.push(pos);
            pos += bytes.len() as u64;
        }

        let mut out = vec![0u8; pos as usize];
        BigEndian::write_u32(&mut out[0..], FAT_MAGIC);
        BigEndian::write_u32(&mut out[4..], payloads.len() as u32);
        for (i, (align, header, bytes)) in payloads.iter().enumerate() {
            let entry = FAT_HEADER_SIZE + i * FAT_ARCH_SIZE;
            BigEndian::write_u32(&mut out[entry..], header.cputype);
            BigEndian::write_u32(&mut out[entry + 4..], header.cpusubtype);
            BigEndian::write_u32(&mut out[entry + 8..], offsets[i] as u32);
            BigEndian::write_u32(&mut out[entry + 12..], bytes.len() as u32);
            BigEndian::write_u32(&mut out[entry + 16..], *align);
            out[offsets[i] as usize..offsets[i] as usize + bytes.len()].copy_from_slice(bytes);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::constants::{CPU_TYPE_ARM64, CPU_TYPE_X86_64};
    use super::super::testutil::{self, ExecutableSpec};
    use super::*;

    #[test]
    fn test_parse_thin() {
        let data = testutil::build_executable(&ExecutableSpec::default());
        let file = MachFile::parse(&data).unwrap();
        assert!(!file.is_fat());
        assert_eq!(file.slices().len(), 1);
    }

    #[test]
    fn test_fat_round_trip() {
        let arm = testutil::build_executable(&ExecutableSpec::default());
        let intel = testutil::build_executable(&ExecutableSpec {
            cputype: CPU_TYPE_X86_64,
            cpusubtype: 3,
            ..Default::default()
        });
        let fat = testutil::build_fat(&[arm, intel]);

        let file = MachFile::parse(&fat).unwrap();
        assert!(file.is_fat());
        assert_eq!(file.slices().len(), 2);
        assert_eq!(file.slices()[0].image.header.cputype, CPU_TYPE_ARM64);
        assert_eq!(file.slices()[1].image.header.cputype, CPU_TYPE_X86_64);

        let written = file.into_bytes().unwrap();
        let reparsed = MachFile::parse(&written).unwrap();
        assert_eq!(reparsed.slices().len(), 2);
        assert_eq!(reparsed.slices()[1].image.header.cputype, CPU_TYPE_X86_64);
    }

    #[test]
    fn test_fat_slice_out_of_bounds() {
        let arm = testutil::build_executable(&ExecutableSpec::default());
        let mut fat = testutil::build_fat(&[arm]);
        // Corrupt the slice size field.
        byteorder::BigEndian::write_u32(&mut fat[8 + 12..], u32::MAX);
        assert!(matches!(
            MachFile::parse(&fat),
            Err(Error::FatSliceOutOfBounds { .. })
        ));
    }
}
