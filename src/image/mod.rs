//! In-memory image arena.
//!
//! Every builder writes its structures into one [`ImageBuffer`] at absolute
//! byte offsets. All accessors are bounds-checked against the current length,
//! so a layout bug surfaces as [`FsError::OutOfBounds`] instead of a panic.
//!
//! The buffer only ever grows by appending zeroes, which keeps previously
//! computed offsets valid for builders that size incrementally
//! (cpio, ustar, echfs, FS/Z).
//!
//! # Example
//!
//! ```rust,ignore
//! use bootimg_builder::image::ImageBuffer;
//!
//! let mut img = ImageBuffer::zeroed(4096);
//! img.put_u16(1024 + 56, 0xEF53)?;
//! assert_eq!(img.u16_at(1024 + 56)?, 0xEF53);
//! ```

pub mod crc;

use crate::fs::error::{FsError, FsResult};

/// Growable byte region holding one partition or archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageBuffer {
    data: Vec<u8>,
}

macro_rules! le_accessors {
    ($get:ident, $put:ident, $ty:ty) => {
        pub fn $get(&self, offset: usize) -> FsResult<$ty> {
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            let len = raw.len();
            raw.copy_from_slice(self.bytes(offset, len)?);
            Ok(<$ty>::from_le_bytes(raw))
        }

        pub fn $put(&mut self, offset: usize, value: $ty) -> FsResult<()> {
            self.put_bytes(offset, &value.to_le_bytes())
        }
    };
}

impl ImageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Extend with zeroes up to `len`. Never shrinks.
    pub fn grow_to(&mut self, len: usize) {
        if len > self.data.len() {
            self.data.resize(len, 0);
        }
    }

    /// Append raw bytes and return the offset they landed at.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let offset = self.data.len();
        self.data.extend_from_slice(bytes);
        offset
    }

    /// Zero-pad the end to a multiple of `align`.
    pub fn pad_to(&mut self, align: usize) {
        let len = self.data.len().div_ceil(align) * align;
        self.grow_to(len);
    }

    /// Shrink to `len`. Only used for trimming unused tail space at close.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    fn range(&self, offset: usize, len: usize) -> FsResult<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(offset..end),
            _ => Err(FsError::OutOfBounds {
                offset,
                len,
                size: self.data.len(),
            }),
        }
    }

    pub fn bytes(&self, offset: usize, len: usize) -> FsResult<&[u8]> {
        let range = self.range(offset, len)?;
        Ok(&self.data[range])
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> FsResult<&mut [u8]> {
        let range = self.range(offset, len)?;
        Ok(&mut self.data[range])
    }

    pub fn put_bytes(&mut self, offset: usize, src: &[u8]) -> FsResult<()> {
        self.bytes_mut(offset, src.len())?.copy_from_slice(src);
        Ok(())
    }

    pub fn fill(&mut self, offset: usize, len: usize, value: u8) -> FsResult<()> {
        self.bytes_mut(offset, len)?.fill(value);
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dest` inside the buffer.
    pub fn copy_within(&mut self, src: usize, dest: usize, len: usize) -> FsResult<()> {
        let from = self.range(src, len)?;
        self.range(dest, len)?;
        self.data.copy_within(from, dest);
        Ok(())
    }

    pub fn u8_at(&self, offset: usize) -> FsResult<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    pub fn put_u8(&mut self, offset: usize, value: u8) -> FsResult<()> {
        self.bytes_mut(offset, 1)?[0] = value;
        Ok(())
    }

    le_accessors!(u16_at, put_u16, u16);
    le_accessors!(u32_at, put_u32, u32);
    le_accessors!(u64_at, put_u64, u64);

    /// Test bit `index` of the bitmap starting at byte `base`.
    pub fn bit(&self, base: usize, index: usize) -> FsResult<bool> {
        Ok(self.u8_at(base + index / 8)? & (1 << (index % 8)) != 0)
    }

    pub fn set_bit(&mut self, base: usize, index: usize) -> FsResult<()> {
        let byte = self.bytes_mut(base + index / 8, 1)?;
        byte[0] |= 1 << (index % 8);
        Ok(())
    }

    /// Count set bits in `bits` bits of the bitmap at `base`.
    pub fn count_bits(&self, base: usize, bits: usize) -> FsResult<usize> {
        let mut used = 0;
        for index in 0..bits {
            if self.bit(base, index)? {
                used += 1;
            }
        }
        Ok(used)
    }
}

impl AsRef<[u8]> for ImageBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
