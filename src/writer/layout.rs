//! In-place edits of the PE container around a copy of the input image.
//!
//! [`PeEditor`] owns the output bytes and keeps the section table, the optional header sizes and
//! the data directories consistent while sections are added. It never moves section contents in
//! the virtual address space: growing the headers only shifts raw file offsets.

use log::{debug, warn};

use crate::{
    file::{
        io::{align_up, read_le_at, write_le_at},
        File, PeLayout, DIRECTORY_BOUND_IMPORT, DIRECTORY_CERTIFICATE, DIRECTORY_DEBUG,
        SECTION_HEADER_SIZE,
    },
    writer::checksum::pe_checksum,
    Error, Result,
};

/// Size of one `IMAGE_DEBUG_DIRECTORY` entry
const DEBUG_ENTRY_SIZE: usize = 28;
/// Offset of `PointerToRawData` inside a debug directory entry
const DEBUG_RAW_POINTER_OFFSET: usize = 24;

/// Placement of one section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SectionSpan {
    pub(crate) virtual_address: u32,
    pub(crate) virtual_size: u32,
    pub(crate) pointer_to_raw_data: u32,
    pub(crate) size_of_raw_data: u32,
}

impl SectionSpan {
    fn contains(&self, rva: u32) -> bool {
        let span = self.virtual_size.max(self.size_of_raw_data);
        rva >= self.virtual_address && u64::from(rva) < u64::from(self.virtual_address) + u64::from(span)
    }
}

/// The output image while it is being edited
#[derive(Debug)]
pub(crate) struct PeEditor {
    image: Vec<u8>,
    layout: PeLayout,
    sections: Vec<SectionSpan>,
}

impl PeEditor {
    /// Start from a copy of `file`
    pub(crate) fn new(file: &File) -> Self {
        PeEditor {
            image: file.data().to_vec(),
            layout: file.layout().clone(),
            sections: file
                .sections()
                .iter()
                .map(|section| SectionSpan {
                    virtual_address: section.virtual_address,
                    virtual_size: section.virtual_size,
                    pointer_to_raw_data: section.pointer_to_raw_data,
                    size_of_raw_data: section.size_of_raw_data,
                })
                .collect(),
        }
    }

    pub(crate) fn image(&self) -> &[u8] {
        &self.image
    }

    pub(crate) fn layout(&self) -> &PeLayout {
        &self.layout
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.image
    }

    /// Overwrite `data.len()` bytes at `offset`
    pub(crate) fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len()).ok_or(Error::OutOfBounds)?;
        let target = self.image.get_mut(offset..end).ok_or(Error::OutOfBounds)?;
        target.copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        write_le_at::<u32>(&mut self.image, offset, value)
    }

    fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut offset = offset;
        read_le_at::<u32>(&self.image, &mut offset)
    }

    /// File offset of `rva` under the current section placement
    pub(crate) fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        self.sections
            .iter()
            .find(|section| section.contains(rva))
            .map(|section| (rva - section.virtual_address + section.pointer_to_raw_data) as usize)
            .ok_or_else(|| malformed_error!("RVA 0x{:x} is not inside any section", rva))
    }

    /// Address and size of data directory `index`, `None` if absent
    pub(crate) fn directory(&self, index: usize) -> Result<Option<(u32, u32)>> {
        if index >= self.layout.data_directory_count {
            return Ok(None);
        }

        let offset = self.layout.directory_offset(index);
        let address = self.read_u32(offset)?;
        let size = self.read_u32(offset + 4)?;
        Ok((address != 0 && size != 0).then_some((address, size)))
    }

    fn set_directory(&mut self, index: usize, address: u32, size: u32) -> Result<()> {
        let offset = self.layout.directory_offset(index);
        self.write_u32(offset, address)?;
        self.write_u32(offset + 4, size)
    }

    /// RVA the next added section will receive
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn next_section_rva(&self) -> u32 {
        let end = self
            .sections
            .iter()
            .map(|section| {
                u64::from(section.virtual_address)
                    + u64::from(section.virtual_size.max(section.size_of_raw_data))
            })
            .max()
            .unwrap_or(u64::from(self.layout.size_of_headers));
        align_up(end as usize, self.layout.section_alignment as usize) as u32
    }

    /// Drop the attribute certificate table, which no longer matches the patched image.
    ///
    /// Returns true if a certificate was present.
    pub(crate) fn strip_certificate(&mut self) -> Result<bool> {
        let Some((offset, size)) = self.directory(DIRECTORY_CERTIFICATE)? else {
            return Ok(false);
        };

        warn!("Removing Authenticode signature ({size} bytes); the patched image is unsigned");
        let (offset, size) = (offset as usize, size as usize);
        if offset.saturating_add(size) >= self.image.len() {
            self.image.truncate(offset.min(self.image.len()));
        } else if let Some(region) = self.image.get_mut(offset..offset + size) {
            region.fill(0);
        }
        self.set_directory(DIRECTORY_CERTIFICATE, 0, 0)?;
        Ok(true)
    }

    fn first_raw_offset(&self) -> usize {
        self.sections
            .iter()
            .filter(|section| section.size_of_raw_data != 0 && section.pointer_to_raw_data != 0)
            .map(|section| section.pointer_to_raw_data as usize)
            .min()
            .unwrap_or(self.image.len())
    }

    /// Make room for one more section header, growing the headers if necessary
    #[allow(clippy::cast_possible_truncation)]
    fn reserve_section_header(&mut self) -> Result<()> {
        let slot = self.layout.section_header_offset(self.layout.number_of_sections);
        let end = slot + SECTION_HEADER_SIZE;
        let size_of_headers = self.layout.size_of_headers as usize;
        let first_raw = self.first_raw_offset();

        let slot_is_free = |image: &[u8]| {
            image
                .get(slot..end.min(image.len()))
                .is_some_and(|bytes| bytes.iter().all(|byte| *byte == 0))
        };

        if end <= size_of_headers && end <= first_raw && slot_is_free(&self.image) {
            return Ok(());
        }

        if self.directory(DIRECTORY_BOUND_IMPORT)?.is_some() {
            return Err(Error::WriteLayout(
                "the bound import directory occupies the space after the section table".to_string(),
            ));
        }
        if end <= size_of_headers {
            return Err(Error::WriteLayout(format!(
                "header bytes at 0x{slot:x} are in use, cannot add a section header"
            )));
        }

        let file_alignment = self.layout.file_alignment as usize;
        let new_size_of_headers = align_up(end, file_alignment);
        let lowest_rva = self
            .sections
            .iter()
            .map(|section| section.virtual_address as usize)
            .min()
            .unwrap_or(usize::MAX);
        if new_size_of_headers > lowest_rva {
            return Err(Error::WriteLayout(format!(
                "headers of 0x{new_size_of_headers:x} bytes would overlap the first section at 0x{lowest_rva:x}"
            )));
        }

        if new_size_of_headers > first_raw {
            let delta = align_up(new_size_of_headers - first_raw, file_alignment);
            self.shift_raw_data(first_raw, delta)?;
        }

        self.layout.size_of_headers = new_size_of_headers as u32;
        self.write_u32(self.layout.size_of_headers_offset(), new_size_of_headers as u32)?;
        Ok(())
    }

    /// Insert `delta` zero bytes at `from` and move every raw pointer at or after it
    #[allow(clippy::cast_possible_truncation)]
    fn shift_raw_data(&mut self, from: usize, delta: usize) -> Result<()> {
        debug!("Growing PE headers: shifting raw data at 0x{from:x} by 0x{delta:x}");
        let tail = self.image.split_off(from);
        self.image.resize(from + delta, 0);
        self.image.extend_from_slice(&tail);

        let delta32 = delta as u32;
        for index in 0..self.sections.len() {
            let section = self.sections[index];
            if section.pointer_to_raw_data as usize >= from {
                let moved = section.pointer_to_raw_data + delta32;
                self.sections[index].pointer_to_raw_data = moved;
                self.write_u32(self.layout.section_header_offset(index) + 20, moved)?;
            }
        }

        if let Some((rva, size)) = self.directory(DIRECTORY_DEBUG)? {
            let table = self.rva_to_offset(rva)?;
            for entry in 0..size as usize / DEBUG_ENTRY_SIZE {
                let field = table + entry * DEBUG_ENTRY_SIZE + DEBUG_RAW_POINTER_OFFSET;
                let pointer = self.read_u32(field)?;
                if pointer as usize >= from {
                    self.write_u32(field, pointer + delta32)?;
                }
            }
        }

        if let Some((offset, size)) = self.directory(DIRECTORY_CERTIFICATE)? {
            if offset as usize >= from {
                self.set_directory(DIRECTORY_CERTIFICATE, offset + delta32, size)?;
            }
        }
        Ok(())
    }

    /// Append a section holding `data` at `rva`, which must be [`Self::next_section_rva`].
    ///
    /// # Errors
    /// Returns [`Error::WriteLayout`] if the section header does not fit, or the name is longer
    /// than 8 bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn add_section(
        &mut self,
        name: &str,
        rva: u32,
        data: &[u8],
        characteristics: u32,
    ) -> Result<()> {
        if name.len() > 8 {
            return Err(Error::WriteLayout(format!(
                "section name '{name}' is longer than 8 bytes"
            )));
        }
        debug_assert_eq!(rva, self.next_section_rva());

        self.reserve_section_header()?;

        let file_alignment = self.layout.file_alignment as usize;
        let raw_pointer = align_up(self.image.len(), file_alignment);
        self.image.resize(raw_pointer, 0);
        self.image.extend_from_slice(data);
        self.image.resize(align_up(self.image.len(), file_alignment), 0);
        let raw_size = (self.image.len() - raw_pointer) as u32;

        let span = SectionSpan {
            virtual_address: rva,
            virtual_size: data.len() as u32,
            pointer_to_raw_data: raw_pointer as u32,
            size_of_raw_data: raw_size,
        };

        let mut header = [0u8; SECTION_HEADER_SIZE];
        header[..name.len()].copy_from_slice(name.as_bytes());
        header[8..12].copy_from_slice(&span.virtual_size.to_le_bytes());
        header[12..16].copy_from_slice(&span.virtual_address.to_le_bytes());
        header[16..20].copy_from_slice(&span.size_of_raw_data.to_le_bytes());
        header[20..24].copy_from_slice(&span.pointer_to_raw_data.to_le_bytes());
        header[36..40].copy_from_slice(&characteristics.to_le_bytes());
        let slot = self.layout.section_header_offset(self.layout.number_of_sections);
        self.write_at(slot, &header)?;

        self.sections.push(span);
        self.layout.number_of_sections += 1;
        write_le_at::<u16>(
            &mut self.image,
            self.layout.number_of_sections_offset,
            self.layout.number_of_sections as u16,
        )?;

        let size_of_image = align_up(
            (rva + span.virtual_size) as usize,
            self.layout.section_alignment as usize,
        ) as u32;
        self.write_u32(self.layout.size_of_image_offset(), size_of_image)?;

        let size_of_code = self.read_u32(self.layout.size_of_code_offset())?;
        self.write_u32(self.layout.size_of_code_offset(), size_of_code + raw_size)?;

        debug!(
            "Added section {name} at RVA 0x{rva:x}, raw 0x{raw_pointer:x} (0x{:x} bytes)",
            data.len()
        );
        Ok(())
    }

    /// Recompute the optional header checksum over the current image
    pub(crate) fn update_checksum(&mut self) -> Result<()> {
        let offset = self.layout.check_sum_offset();
        let checksum = pe_checksum(&self.image, offset);
        self.layout.check_sum = checksum;
        self.write_u32(offset, checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::AssemblyBuilder;

    fn editor(builder: &AssemblyBuilder) -> PeEditor {
        PeEditor::new(&File::from_mem(builder.build().unwrap()).unwrap())
    }

    #[test]
    fn add_section_in_free_slot() {
        let mut editor = editor(&AssemblyBuilder::new("Free"));
        let rva = editor.next_section_rva();
        assert_eq!(rva, 0x4000);

        editor.add_section(".dotp", rva, &[0xAB; 10], 0x6000_0020).unwrap();
        let file = File::from_mem(editor.into_bytes()).unwrap();
        assert_eq!(file.sections().len(), 2);

        let added = &file.sections()[1];
        assert_eq!(added.name().unwrap(), ".dotp");
        assert_eq!(added.virtual_address, 0x4000);
        assert_eq!(added.size_of_raw_data, 0x200);
        assert_eq!(file.layout().size_of_headers, 0x200);
        assert_eq!(file.data()[added.pointer_to_raw_data as usize], 0xAB);
    }

    #[test]
    fn full_section_table_grows_headers() {
        let mut builder = AssemblyBuilder::new("Full");
        builder.extra_sections(2).debug_directory();
        let original = File::from_mem(builder.build().unwrap()).unwrap();
        let (debug_rva, _) = original.directory(DIRECTORY_DEBUG).unwrap();

        let mut editor = PeEditor::new(&original);
        let rva = editor.next_section_rva();
        editor.add_section(".dotp", rva, &[1, 2, 3], 0x6000_0020).unwrap();
        let file = File::from_mem(editor.into_bytes()).unwrap();

        assert_eq!(file.layout().size_of_headers, 0x400);
        assert_eq!(file.sections().len(), 4);
        for (before, after) in original.sections().iter().zip(file.sections()) {
            assert_eq!(after.pointer_to_raw_data, before.pointer_to_raw_data + 0x200);
            assert_eq!(after.virtual_address, before.virtual_address);
        }

        // The CodeView record moved with its section
        let entry = file.rva_to_offset(debug_rva as usize).unwrap();
        let mut field = entry + 24;
        let pointer = read_le_at::<u32>(file.data(), &mut field).unwrap() as usize;
        assert_eq!(&file.data()[pointer..pointer + 4], b"RSDS");
    }

    #[test]
    fn bound_imports_block_growth() {
        let mut builder = AssemblyBuilder::new("Bound");
        builder.extra_sections(2).bound_import();
        let mut editor = editor(&builder);
        let rva = editor.next_section_rva();
        assert!(matches!(
            editor.add_section(".dotp", rva, &[0], 0x6000_0020),
            Err(Error::WriteLayout(_))
        ));
    }

    #[test]
    fn certificate_is_stripped() {
        let mut builder = AssemblyBuilder::new("Signed");
        builder.certificate(&[0x30; 20]);
        let original = builder.build().unwrap();
        let mut editor = PeEditor::new(&File::from_mem(original.clone()).unwrap());

        assert!(editor.strip_certificate().unwrap());
        assert!(editor.directory(DIRECTORY_CERTIFICATE).unwrap().is_none());
        assert_eq!(editor.image().len(), original.len() - 32);
        assert!(!editor.strip_certificate().unwrap());
    }

    #[test]
    fn long_section_name() {
        let mut editor = editor(&AssemblyBuilder::new("Name"));
        let rva = editor.next_section_rva();
        assert!(matches!(
            editor.add_section(".toolongname", rva, &[0], 0x6000_0020),
            Err(Error::WriteLayout(_))
        ));
    }
}
