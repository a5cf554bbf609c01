//! Little-endian primitive access for PE and metadata structures.
//!
//! All multi-byte values in PE headers, metadata tables and method bodies are little-endian.
//! Reads advance an offset and fail with [`crate::Error::OutOfBounds`] instead of panicking.
//! Writes go into existing buffers (in-place patching) or append to a `Vec<u8>` (serialization).

use crate::{Error::OutOfBounds, Result};

/// Primitive types that can be read from and written to little-endian byte buffers.
pub trait CilIO: Sized + Copy {
    /// Byte array representation of `Self`
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decode from little-endian bytes
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encode to little-endian bytes
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cil_io {
    ($($ty:ty => $n:expr),* $(,)?) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; $n];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cil_io!(
    u8 => 1, i8 => 1,
    u16 => 2, i16 => 2,
    u32 => 4, i32 => 4,
    u64 => 8, i64 => 8,
    f32 => 4, f64 => 8,
);

/// Read a `T` from the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
pub fn read_le<T: CilIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0;
    read_le_at(data, &mut offset)
}

/// Read a `T` at `offset` and advance `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the read would cross the end of `data`.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    let end = offset.checked_add(size).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(bytes) = T::Bytes::try_from(&data[*offset..end]) else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(bytes))
}

/// Read a heap or table index that is either 2 or 4 bytes wide.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the read would cross the end of `data`.
pub fn read_le_at_dyn(data: &[u8], offset: &mut usize, is_large: bool) -> Result<u32> {
    if is_large {
        read_le_at::<u32>(data, offset)
    } else {
        Ok(u32::from(read_le_at::<u16>(data, offset)?))
    }
}

/// Overwrite the bytes at `offset` with `value`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the write would cross the end of `data`.
pub fn write_le_at<T: CilIO>(data: &mut [u8], offset: usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    let end = offset.checked_add(bytes.len()).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[offset..end].copy_from_slice(bytes);
    Ok(())
}

/// Append `value` to `out`.
pub fn push_le<T: CilIO>(out: &mut Vec<u8>, value: T) {
    out.extend_from_slice(value.to_le_bytes().as_ref());
}

/// Append an index that is either 2 or 4 bytes wide. Small indexes are truncated to 16 bits.
pub fn push_le_dyn(out: &mut Vec<u8>, value: u32, is_large: bool) {
    if is_large {
        push_le::<u32>(out, value);
    } else {
        push_le::<u16>(out, (value & 0xFFFF) as u16);
    }
}

/// Append a compressed unsigned integer (ECMA-335 II.23.2).
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for values above `0x1FFF_FFFF`.
#[allow(clippy::cast_possible_truncation)]
pub fn push_compressed_uint(out: &mut Vec<u8>, value: u32) -> Result<()> {
    match value {
        0..=0x7F => out.push(value as u8),
        0x80..=0x3FFF => {
            out.push(0x80 | (value >> 8) as u8);
            out.push(value as u8);
        }
        0x4000..=0x1FFF_FFFF => {
            out.push(0xC0 | (value >> 24) as u8);
            out.push((value >> 16) as u8);
            out.push((value >> 8) as u8);
            out.push(value as u8);
        }
        _ => {
            return Err(malformed_error!(
                "Value 0x{:x} cannot be compressed",
                value
            ))
        }
    }
    Ok(())
}

/// Append a compressed signed integer (ECMA-335 II.23.2, rotated sign bit).
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for values outside `-2^28..2^28`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn push_compressed_int(out: &mut Vec<u8>, value: i32) -> Result<()> {
    let (width_mask, encoded) = match value {
        -64..=63 => (0x7F_u32, value as u32),
        -8192..=8191 => (0x3FFF, value as u32),
        -0x1000_0000..=0x0FFF_FFFF => (0x1FFF_FFFF, value as u32),
        _ => {
            return Err(malformed_error!(
                "Value {} cannot be compressed",
                value
            ))
        }
    };

    let sign = u32::from(value < 0);
    let rotated = ((encoded << 1) | sign) & width_mask;
    match width_mask {
        0x7F => out.push(rotated as u8),
        0x3FFF => {
            out.push(0x80 | (rotated >> 8) as u8);
            out.push(rotated as u8);
        }
        _ => {
            out.push(0xC0 | (rotated >> 24) as u8);
            out.push((rotated >> 16) as u8);
            out.push((rotated >> 8) as u8);
            out.push(rotated as u8);
        }
    }
    Ok(())
}

/// Round `value` up to the next multiple of `alignment` (a power of two or any non-zero value).
#[must_use]
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_sequence() {
        #[rustfmt::skip]
        let data = [
            0x01,
            0x02, 0x03,
            0x04, 0x05, 0x06, 0x07,
        ];

        let mut offset = 0;
        assert_eq!(read_le_at::<u8>(&data, &mut offset).unwrap(), 0x01);
        assert_eq!(read_le_at::<u16>(&data, &mut offset).unwrap(), 0x0302);
        assert_eq!(read_le_at::<u32>(&data, &mut offset).unwrap(), 0x0706_0504);
        assert_eq!(offset, 7);
        assert!(matches!(read_le_at::<u8>(&data, &mut offset), Err(OutOfBounds)));
    }

    #[test]
    fn dynamic_width() {
        let data = [0x34, 0x12, 0x00, 0x00];

        let mut offset = 0;
        assert_eq!(read_le_at_dyn(&data, &mut offset, false).unwrap(), 0x1234);
        assert_eq!(offset, 2);

        let mut offset = 0;
        assert_eq!(read_le_at_dyn(&data, &mut offset, true).unwrap(), 0x1234);
        assert_eq!(offset, 4);
    }

    #[test]
    fn write_in_place() {
        let mut data = [0u8; 6];
        write_le_at(&mut data, 2, 0xAABB_CCDDu32).unwrap();
        assert_eq!(data, [0, 0, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert!(write_le_at(&mut data, 4, 1u32).is_err());
    }

    #[test]
    fn compressed_encodings() {
        let mut out = Vec::new();
        push_compressed_uint(&mut out, 0x03).unwrap();
        push_compressed_uint(&mut out, 0x2E57).unwrap();
        push_compressed_uint(&mut out, 0x4000).unwrap();
        assert_eq!(out, [0x03, 0xAE, 0x57, 0xC0, 0x00, 0x40, 0x00]);
        assert!(push_compressed_uint(&mut out, 0x2000_0000).is_err());

        let mut out = Vec::new();
        for value in [3, -3, 64, -64, 8192, -8192] {
            push_compressed_int(&mut out, value).unwrap();
        }
        #[rustfmt::skip]
        assert_eq!(out, [
            0x06,
            0x7B,
            0x80, 0x80,
            0x01,
            0xC0, 0x00, 0x40, 0x00,
            0x80, 0x01,
        ]);
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(0x201, 0x200), 0x400);
        assert_eq!(align_up(7, 0), 7);
    }
}
