//! The `#Strings` heap: NUL-terminated UTF-8 identifiers.

use crate::{Error::OutOfBounds, Result};

/// An owned copy of the `#Strings` heap
#[derive(Debug, Clone, Default)]
pub struct Strings {
    data: Vec<u8>,
}

impl Strings {
    /// Wrap the heap bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a non-empty heap does not start with the empty string.
    pub fn from(data: &[u8]) -> Result<Strings> {
        if data.first().is_some_and(|first| *first != 0) {
            return Err(malformed_error!("Provided #String heap does not start with NUL"));
        }

        Ok(Strings {
            data: data.to_vec(),
        })
    }

    /// The string at `index`.
    ///
    /// # Errors
    /// Returns an error if `index` is outside the heap or the string is not terminated UTF-8.
    pub fn get(&self, index: usize) -> Result<&str> {
        if index == 0 && self.data.is_empty() {
            return Ok("");
        }

        let Some(tail) = self.data.get(index..) else {
            return Err(OutOfBounds);
        };

        let Some(end) = tail.iter().position(|b| *b == 0) else {
            return Err(malformed_error!("Unterminated string at index - {}", index));
        };

        std::str::from_utf8(&tail[..end])
            .map_err(|_| malformed_error!("Invalid string at index - {}", index))
    }

    /// Index of an existing occurrence of `value`, including suffixes of longer strings
    #[must_use]
    pub fn find(&self, value: &str) -> Option<u32> {
        if value.is_empty() {
            return Some(0);
        }

        let mut needle = Vec::with_capacity(value.len() + 1);
        needle.extend_from_slice(value.as_bytes());
        needle.push(0);

        self.data
            .windows(needle.len())
            .position(|window| window == needle.as_slice())
            .and_then(|index| u32::try_from(index).ok())
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
