//! The `#Blob` heap: length-prefixed binary values such as signatures and constants.

use crate::{file::parser::Parser, Error::OutOfBounds, Result};

/// An owned copy of the `#Blob` heap
#[derive(Debug, Clone, Default)]
pub struct Blob {
    data: Vec<u8>,
}

impl Blob {
    /// Wrap the heap bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a non-empty heap does not start with the empty blob.
    pub fn from(data: &[u8]) -> Result<Blob> {
        if data.first().is_some_and(|first| *first != 0) {
            return Err(malformed_error!("Invalid memory for #Blob heap"));
        }

        Ok(Blob {
            data: data.to_vec(),
        })
    }

    /// The blob at `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the blob or its length prefix is outside the heap.
    pub fn get(&self, index: usize) -> Result<&[u8]> {
        if index == 0 && self.data.is_empty() {
            return Ok(&[]);
        }

        let Some(tail) = self.data.get(index..) else {
            return Err(OutOfBounds);
        };

        let mut parser = Parser::new(tail);
        let len = parser.read_compressed_uint()? as usize;
        parser.read_bytes(len)
    }

    /// Iterate `(index, blob)` over all entries, starting after the leading empty blob
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[u8])> {
        let mut position = usize::from(!self.data.is_empty());
        std::iter::from_fn(move || {
            if position >= self.data.len() {
                return None;
            }

            let mut parser = Parser::new(&self.data[position..]);
            let len = parser.read_compressed_uint().ok()? as usize;
            let header = parser.pos();
            let value = parser.read_bytes(len).ok()?;
            let index = position;
            position += header + len;
            Some((index, value))
        })
    }

    /// Index of an existing entry equal to `value`
    #[must_use]
    pub fn find(&self, value: &[u8]) -> Option<u32> {
        if value.is_empty() && !self.data.is_empty() {
            return Some(0);
        }

        self.iter()
            .find(|(_, blob)| *blob == value)
            .and_then(|(index, _)| u32::try_from(index).ok())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    const HEAP: [u8; 12] = [
        0x00,
        0x03, 0x20, 0x00, 0x01,
        0x02, 0x06, 0x08,
        0x03, 0x00, 0x00, 0x01,
    ];

    #[test]
    fn crafted() {
        let blob = Blob::from(&HEAP).unwrap();
        assert_eq!(blob.get(0).unwrap(), &[] as &[u8]);
        assert_eq!(blob.get(1).unwrap(), &[0x20, 0x00, 0x01]);
        assert_eq!(blob.get(5).unwrap(), &[0x06, 0x08]);
        assert!(blob.get(11).is_err());
        assert!(blob.get(40).is_err());
    }

    #[test]
    fn iterate_and_find() {
        let blob = Blob::from(&HEAP).unwrap();
        let indices: Vec<usize> = blob.iter().map(|(index, _)| index).collect();
        assert_eq!(indices, vec![1, 5, 8]);
        assert_eq!(blob.find(&[0x06, 0x08]), Some(5));
        assert_eq!(blob.find(&[0x00, 0x00, 0x01]), Some(8));
        assert_eq!(blob.find(&[0x07]), None);
    }
}
