//! PBP container (EBOOT.PBP) support
//!
//! A PBP bundles PARAM.SFO, artwork and the executable. Only the metadata
//! and the `DATA.PSP` payload matter to the loader.

use crate::image::RawImage;
use crate::psf::Psf;
use std::fmt;
use tracing::debug;

/// `"\0PBP"` as a little-endian word
pub const PBP_MAGIC: u32 = 0x5042_5000;

pub const PBP_HEADER_SIZE: usize = 0x28;

/// Embedded file names, in header order
pub const PBP_FILE_NAMES: [&str; 8] = [
    "PARAM.SFO",
    "ICON0.PNG",
    "ICON1.PMF",
    "PIC0.PNG",
    "PIC1.PNG",
    "SND0.AT3",
    "DATA.PSP",
    "DATA.PSAR",
];

const PARAM_SFO: usize = 0;
const DATA_PSP: usize = 6;

/// Parsed PBP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pbp {
    pub version: u32,
    /// Offsets relative to the PBP start
    pub offsets: [u32; 8],
    /// Total size of the PBP region
    pub size: u32,
}

impl Pbp {
    /// Parse a PBP header at `offset`
    pub fn parse(image: &RawImage<'_>, offset: usize) -> Option<Self> {
        if image.read_u32(offset)? != PBP_MAGIC {
            return None;
        }
        let version = image.read_u32(offset + 4)?;
        let mut offsets = [0u32; 8];
        for (i, slot) in offsets.iter_mut().enumerate() {
            *slot = image.read_u32(offset + 8 + i * 4)?;
        }
        let size = (image.len() - offset) as u32;

        debug!("PBP: version 0x{:08x}, DATA.PSP at 0x{:x}", version, offsets[DATA_PSP]);

        Some(Self { version, offsets, size })
    }

    /// Offset of the embedded executable, relative to the PBP start
    pub fn payload_offset(&self) -> u32 {
        self.offsets[DATA_PSP]
    }

    /// Offset and size of an embedded file, `None` when empty
    pub fn file_range(&self, index: usize) -> Option<(u32, u32)> {
        let start = *self.offsets.get(index)?;
        let end = self.offsets.get(index + 1).copied().unwrap_or(self.size);
        (end > start).then(|| (start, end - start))
    }

    /// Parse the embedded PARAM.SFO, if any
    pub fn read_psf(&self, image: &RawImage<'_>, offset: usize) -> Option<Psf> {
        if self.offsets[PARAM_SFO] == 0 {
            return None;
        }
        let (start, size) = self.file_range(PARAM_SFO)?;
        let data = image.slice_clamped(offset + start as usize, size as usize);
        Psf::parse(data)
    }
}

impl fmt::Display for Pbp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-----PBP HEADER---------")?;
        writeln!(f, "version 0x{:08X}", self.version)?;
        for (name, offset) in PBP_FILE_NAMES.iter().zip(self.offsets) {
            writeln!(f, "{:<10} 0x{:08X}", name, offset)?;
        }
        Ok(())
    }
}
