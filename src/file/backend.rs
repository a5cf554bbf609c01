//! Byte sources a [`crate::file::File`] can be built on.
//!
//! Input images are never modified through a backend. Patched output is always produced as a
//! fresh buffer by the writer, so a memory-mapped input stays read-only for its whole lifetime.

use std::{fs, path::Path};

use memmap2::Mmap;

use crate::{Error::OutOfBounds, Result};

/// Read-only access to the raw bytes of an input image.
pub trait Backend: Send + Sync {
    /// Borrow `len` bytes starting at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range is not fully inside the data.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let data = self.data();
        let end = offset.checked_add(len).ok_or(OutOfBounds)?;
        data.get(offset..end).ok_or(OutOfBounds)
    }

    /// The complete input.
    fn data(&self) -> &[u8];

    /// Size of the input in bytes.
    fn len(&self) -> usize {
        self.data().len()
    }
}

/// An image held in an owned buffer.
#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Take ownership of `data`
    #[must_use]
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
    fn data(&self) -> &[u8] {
        &self.data
    }
}

/// An image mapped from disk.
#[derive(Debug)]
pub struct Physical {
    data: Mmap,
}

impl Physical {
    /// Map the file at `path` read-only.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped.
    pub fn new(path: &Path) -> Result<Physical> {
        let file = fs::File::open(path)?;

        // The mapping is read-only and the input is not expected to change while a patch run is
        // in progress.
        let data = unsafe { Mmap::map(&file) }?;
        Ok(Physical { data })
    }
}

impl Backend for Physical {
    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }
}
