//! PE image access for .NET modules.
//!
//! [`File`] validates an image with `goblin` and keeps the original bytes available through a
//! [`Backend`]. Besides the parsed headers it records a [`PeLayout`]: the raw file offsets of
//! every header field the writer may have to touch when it appends a section or moves the
//! metadata. The input itself is never modified.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotpatch::File;
//! use std::path::Path;
//!
//! let file = File::from_file(Path::new("Assembly-CSharp.dll"))?;
//! let (clr_rva, clr_size) = file.clr();
//! let clr_offset = file.rva_to_offset(clr_rva as usize)?;
//! println!("CLI header at 0x{:x}, {} bytes", clr_offset, clr_size);
//! # Ok::<(), dotpatch::Error>(())
//! ```

pub mod io;
pub mod parser;

mod backend;

use std::path::Path;

use goblin::pe::{section_table::SectionTable, PE};
use ouroboros::self_referencing;

pub use backend::{Backend, Memory, Physical};

use crate::{
    file::io::read_le_at,
    Error::{Empty, GoblinErr},
    Result,
};

/// Data directory index of the attribute certificate table
pub const DIRECTORY_CERTIFICATE: usize = 4;
/// Data directory index of the debug directory
pub const DIRECTORY_DEBUG: usize = 6;
/// Data directory index of the bound import table
pub const DIRECTORY_BOUND_IMPORT: usize = 11;
/// Data directory index of the CLI header
pub const DIRECTORY_CLR: usize = 14;

/// Size of one section header
pub const SECTION_HEADER_SIZE: usize = 40;

/// File offsets of the PE header fields that the writer updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeLayout {
    /// Offset of the `PE\0\0` signature (`e_lfanew`)
    pub pe_offset: usize,
    /// Offset of the COFF `NumberOfSections` field
    pub number_of_sections_offset: usize,
    /// Number of sections declared by the COFF header
    pub number_of_sections: usize,
    /// Offset of the optional header
    pub optional_header_offset: usize,
    /// True for PE32+ images
    pub pe32_plus: bool,
    /// Offset of the first section header
    pub section_table_offset: usize,
    /// Offset of the first data directory entry
    pub data_directory_offset: usize,
    /// Number of data directory entries
    pub data_directory_count: usize,
    /// `FileAlignment`
    pub file_alignment: u32,
    /// `SectionAlignment`
    pub section_alignment: u32,
    /// `SizeOfHeaders`
    pub size_of_headers: u32,
    /// `CheckSum`
    pub check_sum: u32,
}

impl PeLayout {
    /// Offset of `SizeOfCode`
    #[must_use]
    pub fn size_of_code_offset(&self) -> usize {
        self.optional_header_offset + 4
    }

    /// Offset of `SizeOfImage`
    #[must_use]
    pub fn size_of_image_offset(&self) -> usize {
        self.optional_header_offset + 56
    }

    /// Offset of `SizeOfHeaders`
    #[must_use]
    pub fn size_of_headers_offset(&self) -> usize {
        self.optional_header_offset + 60
    }

    /// Offset of `CheckSum`
    #[must_use]
    pub fn check_sum_offset(&self) -> usize {
        self.optional_header_offset + 64
    }

    /// Offset of data directory `index`
    #[must_use]
    pub fn directory_offset(&self, index: usize) -> usize {
        self.data_directory_offset + index * 8
    }

    /// Offset of section header `index`
    #[must_use]
    pub fn section_header_offset(&self, index: usize) -> usize {
        self.section_table_offset + index * SECTION_HEADER_SIZE
    }

    /// Read the PE header offsets out of a raw image.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the signatures or the optional header magic are
    /// wrong, or [`crate::Error::OutOfBounds`] for truncated headers.
    pub fn read(data: &[u8]) -> Result<PeLayout> {
        if data.len() < 0x40 || &data[0..2] != b"MZ" {
            return Err(malformed_error!("Missing DOS header"));
        }

        let mut offset = 0x3C;
        let pe_offset = read_le_at::<u32>(data, &mut offset)? as usize;
        if data.get(pe_offset..pe_offset + 4) != Some(b"PE\0\0".as_slice()) {
            return Err(malformed_error!("Missing PE signature at 0x{:x}", pe_offset));
        }

        let coff_offset = pe_offset + 4;
        let mut offset = coff_offset + 2;
        let number_of_sections = read_le_at::<u16>(data, &mut offset)? as usize;
        let mut offset = coff_offset + 16;
        let size_of_optional_header = read_le_at::<u16>(data, &mut offset)? as usize;

        let optional_header_offset = coff_offset + 20;
        let mut offset = optional_header_offset;
        let pe32_plus = match read_le_at::<u16>(data, &mut offset)? {
            0x10B => false,
            0x20B => true,
            magic => return Err(malformed_error!("Unknown optional header magic 0x{:x}", magic)),
        };

        let mut offset = optional_header_offset + 32;
        let section_alignment = read_le_at::<u32>(data, &mut offset)?;
        let file_alignment = read_le_at::<u32>(data, &mut offset)?;

        let mut offset = optional_header_offset + 60;
        let size_of_headers = read_le_at::<u32>(data, &mut offset)?;
        let check_sum = read_le_at::<u32>(data, &mut offset)?;

        let directory_count_offset = optional_header_offset + if pe32_plus { 108 } else { 92 };
        let mut offset = directory_count_offset;
        let data_directory_count = read_le_at::<u32>(data, &mut offset)? as usize;

        Ok(PeLayout {
            pe_offset,
            number_of_sections_offset: coff_offset + 2,
            number_of_sections,
            optional_header_offset,
            pe32_plus,
            section_table_offset: optional_header_offset + size_of_optional_header,
            data_directory_offset: directory_count_offset + 4,
            data_directory_count,
            file_alignment,
            section_alignment,
            size_of_headers,
            check_sum,
        })
    }
}

/// A validated PE image backed by the original input bytes.
#[self_referencing]
pub struct File {
    layout: PeLayout,
    data: Box<dyn Backend>,
    #[borrows(data)]
    #[not_covariant]
    pe: PE<'this>,
}

impl File {
    /// Map and validate the image at `file`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not a PE image, or has no CLI header.
    pub fn from_file(file: &Path) -> Result<File> {
        let input = Physical::new(file)?;

        Self::load(input)
    }

    /// Validate an in-memory image.
    ///
    /// # Errors
    /// Returns an error if `data` is not a PE image, or has no CLI header.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        let input = Memory::new(data);

        Self::load(input)
    }

    fn load<T: Backend + 'static>(data: T) -> Result<File> {
        if data.len() == 0 {
            return Err(Empty);
        }

        let layout = PeLayout::read(data.data())?;
        let data: Box<dyn Backend> = Box::new(data);

        File::try_new(layout, data, |data| match PE::parse(data.data()) {
            Ok(pe) => match pe.header.optional_header {
                Some(optional_header) => {
                    if optional_header
                        .data_directories
                        .get_clr_runtime_header()
                        .is_none()
                    {
                        Err(malformed_error!(
                            "File does not have a CLR runtime header directory"
                        ))
                    } else {
                        Ok(pe)
                    }
                }
                None => Err(malformed_error!("File does not have an OptionalHeader")),
            },
            Err(error) => Err(GoblinErr(error)),
        })
    }

    /// The complete input image
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.with_data(|data| data.data())
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range is outside the image.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.with_data(|data| data.data_slice(offset, len))
    }

    /// Size of the image in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// True if the image is empty (never true for a loaded file)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw header offsets
    #[must_use]
    pub fn layout(&self) -> &PeLayout {
        self.borrow_layout()
    }

    /// The section table as parsed by goblin
    #[must_use]
    pub fn sections(&self) -> &[SectionTable] {
        self.with_pe(|pe| pe.sections.as_slice())
    }

    /// RVA and size of the CLI header
    #[must_use]
    pub fn clr(&self) -> (u32, u32) {
        // Presence was verified during load
        self.directory(DIRECTORY_CLR).unwrap_or((0, 0))
    }

    /// RVA (or file offset, for the certificate table) and size of data directory `index`.
    /// Returns `None` for absent or empty directories.
    #[must_use]
    pub fn directory(&self, index: usize) -> Option<(u32, u32)> {
        let layout = self.layout();
        if index >= layout.data_directory_count {
            return None;
        }

        let mut offset = layout.directory_offset(index);
        let data = self.data();
        let address = read_le_at::<u32>(data, &mut offset).ok()?;
        let size = read_le_at::<u32>(data, &mut offset).ok()?;
        if address == 0 || size == 0 {
            None
        } else {
            Some((address, size))
        }
    }

    /// Translate an RVA into a file offset.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if no section contains `rva`.
    pub fn rva_to_offset(&self, rva: usize) -> Result<usize> {
        let rva_u32 =
            u32::try_from(rva).map_err(|_| malformed_error!("RVA too large to fit in u32: {}", rva))?;

        for section in self.sections() {
            let span = section.virtual_size.max(section.size_of_raw_data);
            let Some(section_max) = section.virtual_address.checked_add(span) else {
                return Err(malformed_error!(
                    "Section malformed, causing integer overflow - {} + {}",
                    section.virtual_address,
                    span
                ));
            };

            if section.virtual_address <= rva_u32 && section_max > rva_u32 {
                return Ok((rva - section.virtual_address as usize)
                    + section.pointer_to_raw_data as usize);
            }
        }

        Err(malformed_error!(
            "RVA could not be converted to offset - {}",
            rva
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::AssemblyBuilder;

    #[test]
    fn load_builder_image() {
        let image = AssemblyBuilder::new("Sample").build().unwrap();
        let file = File::from_mem(image.clone()).unwrap();

        assert_eq!(file.len(), image.len());
        assert_eq!(file.sections().len(), 1);

        let layout = file.layout();
        assert_eq!(layout.pe_offset, 0x80);
        assert!(!layout.pe32_plus);
        assert_eq!(layout.file_alignment, 0x200);
        assert_eq!(layout.section_alignment, 0x2000);
        assert_eq!(layout.section_table_offset, 0x178);

        let (clr_rva, clr_size) = file.clr();
        assert_eq!(clr_size, 72);
        let offset = file.rva_to_offset(clr_rva as usize).unwrap();
        assert_eq!(file.data_slice(offset, 4).unwrap(), &[72, 0, 0, 0]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(File::from_mem(Vec::new()), Err(Empty)));
        assert!(File::from_mem(vec![0x4D, 0x5A, 0, 0]).is_err());
        assert!(File::from_mem(vec![0u8; 0x400]).is_err());
    }

    #[test]
    fn rva_outside_sections() {
        let image = AssemblyBuilder::new("Sample").build().unwrap();
        let file = File::from_mem(image).unwrap();
        assert!(file.rva_to_offset(0x10).is_err());
        assert!(file.rva_to_offset(0x7FFF_0000).is_err());
    }
}
