//! Metadata heaps (ECMA-335 II.24.2.3 - II.24.2.5).
//!
//! Heaps are copied out of the image at load time. Patches only ever append to a heap, so every
//! index that existed in the input stays valid in the output. [`HeapAppender`] collects appended
//! entries and hands out the index each one will have once written after the original heap.

mod blob;
mod guid;
mod strings;
mod userstrings;

pub use blob::Blob;
pub use guid::Guid;
pub use strings::Strings;
pub use userstrings::UserStrings;

use widestring::U16String;

use crate::{file::io::push_compressed_uint, file::parser::Parser, Error::OutOfBounds, Result};

/// The kind of heap an appender writes for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    /// `#Strings`: NUL-terminated UTF-8
    Strings,
    /// `#Blob`: length-prefixed bytes
    Blob,
    /// `#US`: length-prefixed UTF-16 with a trailing flag byte
    UserStrings,
}

/// Entries appended after the end of an existing heap.
#[derive(Debug, Clone)]
pub struct HeapAppender {
    kind: HeapKind,
    base: u32,
    data: Vec<u8>,
}

impl HeapAppender {
    /// Start appending to a heap of kind `kind` whose current size is `base`.
    ///
    /// Index 0 always denotes the empty entry, so appending to an empty heap first emits it.
    #[must_use]
    pub fn new(kind: HeapKind, base: u32) -> Self {
        HeapAppender {
            kind,
            base,
            data: if base == 0 { vec![0] } else { Vec::new() },
        }
    }

    /// Index the next appended entry will receive
    #[must_use]
    pub fn next_index(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.data.len() as u32;
        self.base + len
    }

    /// The heap size these appends start from
    #[must_use]
    pub fn base(&self) -> u32 {
        self.base
    }

    /// The appended bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// True if nothing was appended
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a string to a `#Strings` heap, returning its index
    pub fn push_string(&mut self, value: &str) -> u32 {
        debug_assert_eq!(self.kind, HeapKind::Strings);
        let index = self.next_index();
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        index
    }

    /// Append a blob to a `#Blob` heap, returning its index.
    ///
    /// # Errors
    /// Returns an error if the blob is too large to be length-prefixed.
    pub fn push_blob(&mut self, value: &[u8]) -> Result<u32> {
        debug_assert_eq!(self.kind, HeapKind::Blob);
        let index = self.next_index();
        #[allow(clippy::cast_possible_truncation)]
        push_compressed_uint(&mut self.data, value.len() as u32)?;
        self.data.extend_from_slice(value);
        Ok(index)
    }

    /// Append a user string to a `#US` heap, returning its offset.
    ///
    /// # Errors
    /// Returns an error if the string is too large to be length-prefixed.
    pub fn push_user_string(&mut self, value: &str) -> Result<u32> {
        debug_assert_eq!(self.kind, HeapKind::UserStrings);
        let index = self.next_index();
        let utf16 = U16String::from_str(value);

        // The trailing byte is 1 if any char needs more than the low byte handling (II.24.2.4)
        let special = utf16.as_slice().iter().any(|c| {
            *c > 0x7E || matches!(*c, 0x01..=0x08 | 0x0E..=0x1F | 0x27 | 0x2D)
        });

        #[allow(clippy::cast_possible_truncation)]
        push_compressed_uint(&mut self.data, (utf16.len() * 2 + 1) as u32)?;
        for unit in utf16.as_slice() {
            self.data.extend_from_slice(&unit.to_le_bytes());
        }
        self.data.push(u8::from(special));
        Ok(index)
    }

    /// True if `index` lies in the appended range
    #[must_use]
    pub fn contains(&self, index: u32) -> bool {
        index >= self.base && index < self.next_index()
    }

    /// The appended string at `index`.
    ///
    /// # Errors
    /// Returns an error if `index` is not an appended, NUL-terminated UTF-8 entry.
    pub fn get_string(&self, index: u32) -> Result<&str> {
        let tail = self.tail(index)?;
        let Some(end) = tail.iter().position(|b| *b == 0) else {
            return Err(malformed_error!("Unterminated string at index - {}", index));
        };
        std::str::from_utf8(&tail[..end])
            .map_err(|_| malformed_error!("Invalid string at index - {}", index))
    }

    /// The appended blob at `index`.
    ///
    /// # Errors
    /// Returns an error if `index` is not an appended entry.
    pub fn get_blob(&self, index: u32) -> Result<&[u8]> {
        let mut parser = Parser::new(self.tail(index)?);
        let len = parser.read_compressed_uint()? as usize;
        parser.read_bytes(len)
    }

    fn tail(&self, index: u32) -> Result<&[u8]> {
        index
            .checked_sub(self.base)
            .and_then(|start| self.data.get(start as usize..))
            .ok_or(OutOfBounds)
    }

    /// Take over entries appended by `other`, which must have been started at this appender's end
    pub fn extend(&mut self, other: HeapAppender) {
        debug_assert_eq!(other.base, self.next_index());
        self.data.extend_from_slice(&other.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_heap_gets_null_entry() {
        let mut appender = HeapAppender::new(HeapKind::Blob, 0);
        assert_eq!(appender.push_blob(&[0x06, 0x08]).unwrap(), 1);
        assert_eq!(appender.data(), [0x00, 0x02, 0x06, 0x08]);
        assert_eq!(appender.get_blob(1).unwrap(), [0x06, 0x08]);
        assert!(appender.contains(1));
        assert!(!appender.contains(4));
    }

    #[test]
    fn strings_indices_follow_base() {
        let mut appender = HeapAppender::new(HeapKind::Strings, 0x20);
        assert_eq!(appender.push_string("Debug"), 0x20);
        assert_eq!(appender.push_string("Log"), 0x26);
        assert_eq!(appender.data(), b"Debug\0Log\0");
    }

    #[test]
    fn blob_is_length_prefixed() {
        let mut appender = HeapAppender::new(HeapKind::Blob, 4);
        assert_eq!(appender.push_blob(&[0x00, 0x00, 0x01]).unwrap(), 4);
        assert_eq!(appender.push_blob(&[]).unwrap(), 8);
        assert_eq!(appender.data(), &[0x03, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn user_string_layout() {
        let mut appender = HeapAppender::new(HeapKind::UserStrings, 1);
        assert_eq!(appender.push_user_string("Hi").unwrap(), 1);
        assert_eq!(appender.data(), &[0x05, b'H', 0x00, b'i', 0x00, 0x00]);

        let offset = appender.push_user_string("é").unwrap();
        assert_eq!(offset, 7);
        assert_eq!(&appender.data()[6..], &[0x03, 0xE9, 0x00, 0x01]);
    }

    #[test]
    fn extend_continues() {
        let mut committed = HeapAppender::new(HeapKind::Strings, 10);
        committed.push_string("A");
        let mut staged = HeapAppender::new(HeapKind::Strings, committed.next_index());
        assert_eq!(staged.push_string("B"), 12);
        committed.extend(staged);
        assert_eq!(committed.data(), b"A\0B\0");
    }
}
