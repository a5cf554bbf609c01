//! The metadata root and its stream headers (ECMA-335 II.24.2.1 and II.24.2.2).
//!
//! The root is read once at load time. When the writer has to rebuild the metadata (because a
//! patch added rows or heap entries) it re-emits the root with the original version bytes and
//! stream order, only updating stream offsets and sizes.

use crate::{
    file::io::{push_le, read_le, read_le_at},
    Error::OutOfBounds,
    Result,
};

/// Magic signature of the metadata root, `BSJB`
pub const CIL_HEADER_MAGIC: u32 = 0x424A_5342;

/// A stream header: location and name of one metadata stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Offset of the stream, relative to the metadata root
    pub offset: u32,
    /// Size of the stream in bytes
    pub size: u32,
    /// Stream name, e.g. `#~`
    pub name: String,
}

impl StreamHeader {
    /// Parse a stream header at the start of `data`, returning it and its encoded size.
    ///
    /// # Errors
    /// Returns an error if the name is not NUL terminated within 32 bytes.
    pub fn read(data: &[u8]) -> Result<(StreamHeader, usize)> {
        let mut offset = 0;
        let stream_offset = read_le_at::<u32>(data, &mut offset)?;
        let size = read_le_at::<u32>(data, &mut offset)?;

        let name_bytes = &data[offset.min(data.len())..];
        let Some(name_len) = name_bytes.iter().take(32).position(|b| *b == 0) else {
            return Err(malformed_error!("Stream name is not terminated"));
        };

        let name = std::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| malformed_error!("Stream name is not valid UTF-8"))?
            .to_string();

        let encoded = 8 + (name_len + 1).div_ceil(4) * 4;
        Ok((
            StreamHeader {
                offset: stream_offset,
                size,
                name,
            },
            encoded,
        ))
    }

    /// Append the encoded header to `out`
    pub fn write(&self, out: &mut Vec<u8>) {
        push_le::<u32>(out, self.offset);
        push_le::<u32>(out, self.size);
        out.extend_from_slice(self.name.as_bytes());
        let padded = (self.name.len() + 1).div_ceil(4) * 4;
        out.resize(out.len() + padded - self.name.len(), 0);
    }
}

/// The metadata root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    /// Major version, usually 1
    pub major_version: u16,
    /// Minor version, usually 1
    pub minor_version: u16,
    /// Reserved, usually 0
    pub reserved: u32,
    /// The version string bytes including their NUL padding
    pub version_bytes: Vec<u8>,
    /// Flags, usually 0
    pub flags: u16,
    /// Stream headers in their original order
    pub stream_headers: Vec<StreamHeader>,
}

impl Root {
    /// Parse the metadata root at the start of `data`, the complete metadata blob.
    ///
    /// # Errors
    /// Returns an error if the magic is wrong, or the version string or any stream header lies
    /// outside of `data`.
    pub fn read(data: &[u8]) -> Result<Root> {
        if data.len() < 20 {
            return Err(OutOfBounds);
        }

        let signature = read_le::<u32>(data)?;
        if signature != CIL_HEADER_MAGIC {
            return Err(malformed_error!(
                "CIL_HEADER_MAGIC does not match - {}",
                signature
            ));
        }

        let mut offset = 4;
        let major_version = read_le_at::<u16>(data, &mut offset)?;
        let minor_version = read_le_at::<u16>(data, &mut offset)?;
        let reserved = read_le_at::<u32>(data, &mut offset)?;
        let version_length = read_le_at::<u32>(data, &mut offset)? as usize;
        let version_end = offset.checked_add(version_length).ok_or(OutOfBounds)?;
        if version_end > data.len() || version_length > 255 {
            return Err(malformed_error!(
                "Invalid version string length - {}",
                version_length
            ));
        }

        let version_bytes = data[offset..version_end].to_vec();
        let mut offset = version_end;
        let flags = read_le_at::<u16>(data, &mut offset)?;
        let stream_count = read_le_at::<u16>(data, &mut offset)?;
        if stream_count == 0 {
            return Err(malformed_error!("Metadata root declares no streams"));
        }

        let mut stream_headers = Vec::with_capacity(stream_count as usize);
        for _ in 0..stream_count {
            if offset >= data.len() {
                return Err(OutOfBounds);
            }

            let (header, encoded) = StreamHeader::read(&data[offset..])?;
            match header.offset.checked_add(header.size) {
                Some(end) if end as usize <= data.len() => {}
                _ => {
                    return Err(malformed_error!(
                        "Stream {} exceeds the metadata - {} + {}",
                        header.name,
                        header.offset,
                        header.size
                    ))
                }
            }

            offset += encoded;
            stream_headers.push(header);
        }

        Ok(Root {
            major_version,
            minor_version,
            reserved,
            version_bytes,
            flags,
            stream_headers,
        })
    }

    /// The version string without padding, e.g. `v4.0.30319`
    #[must_use]
    pub fn version(&self) -> String {
        let end = self
            .version_bytes
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.version_bytes.len());
        String::from_utf8_lossy(&self.version_bytes[..end]).into_owned()
    }

    /// Find a stream header by name
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&StreamHeader> {
        self.stream_headers.iter().find(|header| header.name == name)
    }

    /// Size of the encoded root including all stream headers
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        let headers: usize = self
            .stream_headers
            .iter()
            .map(|header| 8 + (header.name.len() + 1).div_ceil(4) * 4)
            .sum();
        20 + self.version_bytes.len() + headers
    }

    /// Append the encoded root to `out`
    pub fn write(&self, out: &mut Vec<u8>) {
        push_le::<u32>(out, CIL_HEADER_MAGIC);
        push_le::<u16>(out, self.major_version);
        push_le::<u16>(out, self.minor_version);
        push_le::<u32>(out, self.reserved);
        #[allow(clippy::cast_possible_truncation)]
        push_le::<u32>(out, self.version_bytes.len() as u32);
        out.extend_from_slice(&self.version_bytes);
        push_le::<u16>(out, self.flags);
        #[allow(clippy::cast_possible_truncation)]
        push_le::<u16>(out, self.stream_headers.len() as u16);
        for header in &self.stream_headers {
            header.write(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    const ROOT: [u8; 76] = [
        0x42, 0x53, 0x4A, 0x42,
        0x01, 0x00, 0x01, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x0C, 0x00, 0x00, 0x00,
        0x76, 0x34, 0x2E, 0x30, 0x2E, 0x33, 0x30, 0x33, 0x31, 0x39, 0x00, 0x00,
        0x00, 0x00,
        0x03, 0x00,
        0x4C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x23, 0x7E, 0x00, 0x00,
        0x4C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x23, 0x53, 0x74, 0x72, 0x69, 0x6E, 0x67, 0x73, 0x00, 0x00, 0x00, 0x00,
        0x4C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x23, 0x55, 0x53, 0x00,
    ];

    #[test]
    fn crafted() {
        let root = Root::read(&ROOT).unwrap();
        assert_eq!(root.version(), "v4.0.30319");
        assert_eq!(root.version_bytes.len(), 12);
        assert_eq!(root.stream_headers.len(), 3);
        assert_eq!(root.stream_headers[0].name, "#~");
        assert_eq!(root.stream_headers[1].name, "#Strings");
        assert_eq!(root.stream_headers[2].name, "#US");
        assert_eq!(root.encoded_size(), ROOT.len());
        assert!(root.stream("#Blob").is_none());
    }

    #[test]
    fn write_reproduces_input() {
        let root = Root::read(&ROOT).unwrap();
        let mut out = Vec::new();
        root.write(&mut out);
        assert_eq!(out, ROOT);
    }

    #[test]
    fn bad_magic() {
        let mut data = ROOT;
        data[0] = 0;
        assert!(Root::read(&data).is_err());
    }
}
