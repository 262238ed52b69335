//! PARAM.SFO metadata

use crate::image::RawImage;
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

/// `"\0PSF"` as a little-endian word
pub const PSF_MAGIC: u32 = 0x4653_5000;

const HEADER_SIZE: usize = 20;
const INDEX_ENTRY_SIZE: usize = 16;

/// Firmware version reported for homebrew
pub const FIRMWARE_VERSION_HOMEBREW: u32 = 999;

/// Entry value types
mod fmt_id {
    pub const UTF8S: u16 = 0x0004;
    pub const UTF8: u16 = 0x0204;
    pub const INTEGER: u16 = 0x0404;
}

/// PSF entry value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsfValue {
    Utf8(String),
    Utf8S(String),
    Integer(u32),
}

impl fmt::Display for PsfValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8(s) | Self::Utf8S(s) => write!(f, "{}", s),
            Self::Integer(v) => write!(f, "0x{:x}", v),
        }
    }
}

/// Parsed PARAM.SFO
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Psf {
    entries: BTreeMap<String, PsfValue>,
}

impl Psf {
    /// Parse PSF data. Returns `None` when the magic or index table is bad;
    /// individual entries with unknown formats or bad offsets are skipped.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let image = RawImage::new(data);
        if image.read_u32(0)? != PSF_MAGIC {
            return None;
        }

        let key_table = image.read_u32(8)? as usize;
        let data_table = image.read_u32(12)? as usize;
        let count = image.read_u32(16)? as usize;

        let mut entries = BTreeMap::new();
        for i in 0..count {
            let at = HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            let key_offset = image.read_u16(at)? as usize;
            let data_fmt = image.read_u16(at + 2)?;
            let data_len = image.read_u32(at + 4)? as usize;
            let data_offset = image.read_u32(at + 12)? as usize;

            let Some(key) = image.read_cstr(key_table + key_offset) else {
                continue;
            };
            let value_at = data_table + data_offset;

            let value = match data_fmt {
                fmt_id::INTEGER => match image.read_u32(value_at) {
                    Some(v) => PsfValue::Integer(v),
                    None => continue,
                },
                fmt_id::UTF8S | fmt_id::UTF8 => {
                    let Some(raw) = image.slice(value_at, data_len) else {
                        continue;
                    };
                    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                    let s = String::from_utf8_lossy(&raw[..end]).into_owned();
                    if data_fmt == fmt_id::UTF8S {
                        PsfValue::Utf8S(s)
                    } else {
                        PsfValue::Utf8(s)
                    }
                }
                other => {
                    trace!("PSF: skipping '{}' with unknown format 0x{:04x}", key, other);
                    continue;
                }
            };

            entries.insert(key, value);
        }

        Some(Self { entries })
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key)? {
            PsfValue::Utf8(s) | PsfValue::Utf8S(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_numeric(&self, key: &str) -> Option<u32> {
        match self.entries.get(key)? {
            PsfValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.get_string("TITLE")
    }

    pub fn disc_id(&self) -> Option<&str> {
        self.get_string("DISC_ID")
    }

    pub fn entries(&self) -> &BTreeMap<String, PsfValue> {
        &self.entries
    }

    pub fn insert(&mut self, key: &str, value: PsfValue) {
        self.entries.insert(key.to_string(), value);
    }

    /// Matches the fixed parameter set the homebrew SDK writes into every
    /// PARAM.SFO it generates
    pub fn is_likely_homebrew(&self) -> bool {
        self.get_string("DISC_VERSION") == Some("1.00")
            && self.disc_id() == Some("UCJS10041")
            && self.get_string("CATEGORY") == Some("MG")
            && self.get_numeric("BOOTABLE") == Some(1)
            && self.get_numeric("REGION") == Some(32768)
            && self.get_string("PSP_SYSTEM_VER") == Some("1.00")
            && self.get_numeric("PARENTAL_LEVEL") == Some(1)
    }

    /// Firmware version the title asks for, as `major * 100 + minor`
    pub fn firmware_version(&self) -> Option<u32> {
        if self.is_likely_homebrew() {
            return Some(FIRMWARE_VERSION_HOMEBREW);
        }
        parse_firmware_version(self.get_string("PSP_SYSTEM_VER")?)
    }

    /// `MEMSIZE == 1` requests the 64MB layout
    pub fn wants_extended_memory(&self) -> bool {
        self.get_numeric("MEMSIZE") == Some(1)
    }

    /// Serialize into PARAM.SFO layout
    pub fn generate(&self) -> Vec<u8> {
        let mut key_table = Vec::new();
        let mut data_table = Vec::new();
        let mut index = Vec::new();

        for (key, value) in &self.entries {
            let key_offset = key_table.len() as u16;
            key_table.extend_from_slice(key.as_bytes());
            key_table.push(0);

            let data_offset = data_table.len() as u32;
            let (data_fmt, bytes) = match value {
                PsfValue::Integer(v) => (fmt_id::INTEGER, v.to_le_bytes().to_vec()),
                PsfValue::Utf8(s) | PsfValue::Utf8S(s) => {
                    let mut bytes = s.as_bytes().to_vec();
                    bytes.push(0);
                    let id = if matches!(value, PsfValue::Utf8S(_)) { fmt_id::UTF8S } else { fmt_id::UTF8 };
                    (id, bytes)
                }
            };
            let len = bytes.len() as u32;
            let max_len = (len + 3) & !3;

            index.extend_from_slice(&key_offset.to_le_bytes());
            index.extend_from_slice(&data_fmt.to_le_bytes());
            index.extend_from_slice(&len.to_le_bytes());
            index.extend_from_slice(&max_len.to_le_bytes());
            index.extend_from_slice(&data_offset.to_le_bytes());

            data_table.extend_from_slice(&bytes);
            data_table.resize(data_offset as usize + max_len as usize, 0);
        }

        while key_table.len() % 4 != 0 {
            key_table.push(0);
        }

        let key_table_start = (HEADER_SIZE + index.len()) as u32;
        let data_table_start = key_table_start + key_table.len() as u32;

        let mut out = Vec::new();
        out.extend_from_slice(&PSF_MAGIC.to_le_bytes());
        out.extend_from_slice(&0x0101u32.to_le_bytes());
        out.extend_from_slice(&key_table_start.to_le_bytes());
        out.extend_from_slice(&data_table_start.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        out.extend(index);
        out.extend(key_table);
        out.extend(data_table);
        out
    }
}

impl fmt::Display for Psf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.entries {
            writeln!(f, "{} = {}", key, value)?;
        }
        Ok(())
    }
}

/// `"6.20"` becomes 620
pub fn parse_firmware_version(version: &str) -> Option<u32> {
    let (major, minor) = version.trim().split_once('.')?;
    let major: u32 = major.parse().ok()?;
    let minor: u32 = format!("{:0<2}", minor).get(..2)?.parse().ok()?;
    Some(major * 100 + minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn homebrew_psf() -> Psf {
        let mut psf = Psf::default();
        psf.insert("BOOTABLE", PsfValue::Integer(1));
        psf.insert("CATEGORY", PsfValue::Utf8("MG".into()));
        psf.insert("DISC_ID", PsfValue::Utf8("UCJS10041".into()));
        psf.insert("DISC_VERSION", PsfValue::Utf8("1.00".into()));
        psf.insert("PARENTAL_LEVEL", PsfValue::Integer(1));
        psf.insert("PSP_SYSTEM_VER", PsfValue::Utf8("1.00".into()));
        psf.insert("REGION", PsfValue::Integer(32768));
        psf.insert("TITLE", PsfValue::Utf8S("Hello".into()));
        psf
    }

    #[test]
    fn test_generate_and_parse() {
        let original = homebrew_psf();
        let data = original.generate();
        assert_eq!(&data[0..4], b"\0PSF");

        let parsed = Psf::parse(&data).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.title(), Some("Hello"));
        assert_eq!(parsed.get_numeric("REGION"), Some(32768));
        assert_eq!(parsed.get_numeric("TITLE"), None);
    }

    #[test]
    fn test_bad_magic() {
        assert!(Psf::parse(b"\0PBP\0\0\0\0").is_none());
        assert!(Psf::parse(&[]).is_none());
    }

    #[test]
    fn test_homebrew_detection() {
        let psf = homebrew_psf();
        assert!(psf.is_likely_homebrew());
        assert_eq!(psf.firmware_version(), Some(FIRMWARE_VERSION_HOMEBREW));

        let mut retail = homebrew_psf();
        retail.insert("DISC_ID", PsfValue::Utf8("ULUS10041".into()));
        retail.insert("PSP_SYSTEM_VER", PsfValue::Utf8("3.71".into()));
        retail.insert("MEMSIZE", PsfValue::Integer(1));
        assert!(!retail.is_likely_homebrew());
        assert_eq!(retail.firmware_version(), Some(371));
        assert!(retail.wants_extended_memory());
    }

    #[test]
    fn test_parse_firmware_version() {
        assert_eq!(parse_firmware_version("6.20"), Some(620));
        assert_eq!(parse_firmware_version("1.5"), Some(150));
        assert_eq!(parse_firmware_version("abc"), None);
    }
}
