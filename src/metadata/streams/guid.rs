//! The `#GUID` heap: 16-byte GUIDs addressed by 1-based index.

use crate::{Error::OutOfBounds, Result};

/// An owned copy of the `#GUID` heap
#[derive(Debug, Clone, Default)]
pub struct Guid {
    data: Vec<u8>,
}

impl Guid {
    /// Wrap the heap bytes
    #[must_use]
    pub fn from(data: &[u8]) -> Guid {
        Guid {
            data: data.to_vec(),
        }
    }

    /// The GUID at 1-based `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for index 0 or an index past the end of the heap.
    pub fn get(&self, index: usize) -> Result<uguid::Guid> {
        if index == 0 {
            return Err(OutOfBounds);
        }

        let start = (index - 1) * 16;
        let Some(bytes) = self.data.get(start..start + 16) else {
            return Err(OutOfBounds);
        };

        let mut buffer = [0u8; 16];
        buffer.copy_from_slice(bytes);
        Ok(uguid::Guid::from_bytes(buffer))
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

    #[test]
    fn crafted() {
        #[rustfmt::skip]
        let data = [
            0xd4, 0x37, 0xa4, 0x6e, 0x12, 0x0e, 0x50, 0x4a, 0xa6, 0x3d, 0x49, 0x1e, 0x33, 0x8b, 0x83, 0x8a,
        ];

        let heap = Guid::from(&data);
        let guid = heap.get(1).unwrap();
        assert_eq!(guid, uguid::guid!("6ea437d4-0e12-4a50-a63d-491e338b838a"));
        assert!(heap.get(0).is_err());
        assert!(heap.get(2).is_err());
    }
}
