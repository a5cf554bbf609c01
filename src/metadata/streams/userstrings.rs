//! The `#US` heap: length-prefixed UTF-16 literals referenced by `ldstr`.

use widestring::U16Str;

use crate::{file::parser::Parser, Error::OutOfBounds, Result};

/// An owned copy of the `#US` heap
#[derive(Debug, Clone, Default)]
pub struct UserStrings {
    data: Vec<u8>,
}

impl UserStrings {
    /// Wrap the heap bytes
    #[must_use]
    pub fn from(data: &[u8]) -> UserStrings {
        UserStrings {
            data: data.to_vec(),
        }
    }

    /// The string at heap offset `index`.
    ///
    /// # Errors
    /// Returns an error if the entry is outside the heap or has an even byte length.
    pub fn get(&self, index: usize) -> Result<String> {
        let Some(tail) = self.data.get(index..) else {
            return Err(OutOfBounds);
        };

        let mut parser = Parser::new(tail);
        let len = parser.read_compressed_uint()? as usize;
        if len == 0 {
            return Ok(String::new());
        }
        if len % 2 == 0 {
            return Err(malformed_error!("Invalid user string length at index - {}", index));
        }

        let bytes = parser.read_bytes(len - 1)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        U16Str::from_slice(&units)
            .to_string()
            .map_err(|_| malformed_error!("Invalid UTF-16 user string at index - {}", index))
    }

    /// Append raw entries produced by a [`super::HeapAppender`] started at this heap's end
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Raw heap bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Heap size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the heap has no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
