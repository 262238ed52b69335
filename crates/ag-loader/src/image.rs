//! Read-only view over a fully buffered module image

/// Bounds-checked little-endian reader over an image buffer.
///
/// Offsets are always explicit; there is no hidden cursor to rewind.
#[derive(Debug, Clone, Copy)]
pub struct RawImage<'a> {
    data: &'a [u8],
}

impl<'a> RawImage<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Bytes from `offset` to the end of the image
    pub fn tail(&self, offset: usize) -> Option<&'a [u8]> {
        self.data.get(offset..)
    }

    /// `len` bytes at `offset`, or `None` if any of them lie past the end
    pub fn slice(&self, offset: usize, len: usize) -> Option<&'a [u8]> {
        let end = offset.checked_add(len)?;
        self.data.get(offset..end)
    }

    /// Up to `len` bytes at `offset`, clamped to the end of the image
    pub fn slice_clamped(&self, offset: usize, len: usize) -> &'a [u8] {
        let start = offset.min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        &self.data[start..end]
    }

    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let b = self.slice(offset, 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let b = self.slice(offset, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// NUL-terminated string starting at `offset`
    pub fn read_cstr(&self, offset: usize) -> Option<String> {
        let rest = self.tail(offset)?;
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        Some(String::from_utf8_lossy(&rest[..end]).into_owned())
    }

    /// First four bytes at `offset`, zero-padded when the image is shorter
    pub fn magic_bytes(&self, offset: usize) -> [u8; 4] {
        let mut magic = [0u8; 4];
        let src = self.slice_clamped(offset, 4);
        magic[..src.len()].copy_from_slice(src);
        magic
    }
}
