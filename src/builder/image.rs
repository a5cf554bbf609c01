//! PE32 container layout for built assemblies.

use crate::{
    builder::ImageOptions,
    file::{
        io::{align_up, push_le, write_le_at},
        DIRECTORY_BOUND_IMPORT, DIRECTORY_CERTIFICATE, DIRECTORY_CLR, DIRECTORY_DEBUG,
        SECTION_HEADER_SIZE,
    },
    metadata::{
        cor20header::{Cor20Header, COR20_HEADER_SIZE},
        root::{Root, StreamHeader},
    },
    writer::{metadata::serialize_metadata, pe_checksum},
    Error, Result,
};

const PE_OFFSET: usize = 0x80;
const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x2000;
const IMAGE_BASE: u32 = 0x1000_0000;
const SIZE_OF_HEADERS: u32 = 0x200;
const TEXT_RVA: u32 = 0x2000;
const TEXT_RAW: u32 = SIZE_OF_HEADERS;
const DIRECTORY_COUNT: usize = 16;
/// `IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_32BIT_MACHINE | IMAGE_FILE_DLL`
const FILE_CHARACTERISTICS: u16 = 0x2102;
/// `DYNAMIC_BASE | NX_COMPAT | NO_SEH | TERMINAL_SERVER_AWARE`
const DLL_CHARACTERISTICS: u16 = 0x8540;
/// `CNT_CODE | MEM_EXECUTE | MEM_READ`
const TEXT_CHARACTERISTICS: u32 = 0x6000_0020;
/// `CNT_INITIALIZED_DATA | MEM_READ`
const DATA_CHARACTERISTICS: u32 = 0x4000_0040;
/// `COMIMAGE_FLAGS_ILONLY`
const CLI_FLAGS_IL_ONLY: u32 = 0x1;
const METADATA_VERSION: &[u8; 12] = b"v4.0.30319\0\0";
const DEBUG_DIRECTORY_SIZE: usize = 28;
const DEBUG_TYPE_CODEVIEW: u32 = 2;
const PDB_NAME: &[u8] = b"Assembly.pdb\0";
/// Offset of the bound import descriptor, between the section table and the first section
const BOUND_IMPORT_OFFSET: u32 = 0x1F0;

/// Serialize the metadata root and its streams
pub(crate) fn metadata_blob(
    tables: &[u8],
    strings: &[u8],
    user_strings: &[u8],
    guid: &[u8],
    blob: &[u8],
) -> Vec<u8> {
    let root = Root {
        major_version: 1,
        minor_version: 1,
        reserved: 0,
        version_bytes: METADATA_VERSION.to_vec(),
        flags: 0,
        stream_headers: ["#~", "#Strings", "#US", "#GUID", "#Blob"]
            .iter()
            .map(|name| StreamHeader {
                offset: 0,
                size: 0,
                name: (*name).to_string(),
            })
            .collect(),
    };
    serialize_metadata(root, &[tables, strings, user_strings, guid, blob])
}

/// Contents of the `.text` section: CLI header, method bodies, debug data and metadata.
#[derive(Debug)]
pub(crate) struct TextContent {
    data: Vec<u8>,
    debug_directory: bool,
    debug_rva: u32,
}

impl TextContent {
    pub(crate) fn new(options: &ImageOptions) -> Self {
        TextContent {
            data: vec![0; COR20_HEADER_SIZE],
            debug_directory: options.debug_directory,
            debug_rva: 0,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn rva(&self) -> u32 {
        TEXT_RVA + self.data.len() as u32
    }

    fn align(&mut self) {
        self.data.resize(align_up(self.data.len(), 4), 0);
    }

    /// Place a method body, returning its RVA
    pub(crate) fn push_body(&mut self, body: &[u8]) -> u32 {
        self.align();
        let rva = self.rva();
        self.data.extend_from_slice(body);
        rva
    }

    /// Place the debug data and the metadata, then fill in the CLI header
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn set_metadata(&mut self, metadata: Vec<u8>) {
        self.align();
        if self.debug_directory {
            self.debug_rva = self.rva();
            let record_rva = self.debug_rva + DEBUG_DIRECTORY_SIZE as u32;
            let record_size = 24 + PDB_NAME.len() as u32;

            push_le::<u32>(&mut self.data, 0);
            push_le::<u32>(&mut self.data, 0);
            push_le::<u16>(&mut self.data, 0);
            push_le::<u16>(&mut self.data, 0);
            push_le::<u32>(&mut self.data, DEBUG_TYPE_CODEVIEW);
            push_le::<u32>(&mut self.data, record_size);
            push_le::<u32>(&mut self.data, record_rva);
            push_le::<u32>(&mut self.data, record_rva - TEXT_RVA + TEXT_RAW);

            self.data.extend_from_slice(b"RSDS");
            self.data.extend_from_slice(&[0x11; 16]);
            push_le::<u32>(&mut self.data, 1);
            self.data.extend_from_slice(PDB_NAME);
            self.align();
        }

        let header = Cor20Header {
            cb: COR20_HEADER_SIZE as u32,
            major_runtime_version: 2,
            minor_runtime_version: 5,
            meta_data_rva: self.rva(),
            meta_data_size: metadata.len() as u32,
            flags: CLI_FLAGS_IL_ONLY,
            entry_point_token: 0,
            resource_rva: 0,
            resource_size: 0,
            strong_name_signature_rva: 0,
            strong_name_signature_size: 0,
        };
        self.data.extend_from_slice(&metadata);

        let mut encoded = Vec::with_capacity(COR20_HEADER_SIZE);
        header.write(&mut encoded);
        self.data[..COR20_HEADER_SIZE].copy_from_slice(&encoded);
    }
}

struct Section {
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    raw_size: u32,
    raw_pointer: u32,
    characteristics: u32,
}

/// Places sections and writes the DOS, COFF and optional headers around them.
pub(crate) struct ImageLayout<'a> {
    options: &'a ImageOptions,
}

impl<'a> ImageLayout<'a> {
    pub(crate) fn new(options: &'a ImageOptions) -> Self {
        ImageLayout { options }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sections(&self, text: &TextContent) -> Vec<Section> {
        let text_size = text.data.len() as u32;
        let mut sections = vec![Section {
            name: *b".text\0\0\0",
            virtual_size: text_size,
            virtual_address: TEXT_RVA,
            raw_size: align_up(text_size as usize, FILE_ALIGNMENT as usize) as u32,
            raw_pointer: TEXT_RAW,
            characteristics: TEXT_CHARACTERISTICS,
        }];

        for index in 0..self.options.extra_sections {
            let previous = &sections[sections.len() - 1];
            let mut name = [0u8; 8];
            let label = format!(".data{index}");
            name[..label.len().min(8)].copy_from_slice(&label.as_bytes()[..label.len().min(8)]);
            sections.push(Section {
                name,
                virtual_size: FILE_ALIGNMENT,
                virtual_address: align_up(
                    (previous.virtual_address + previous.virtual_size) as usize,
                    SECTION_ALIGNMENT as usize,
                ) as u32,
                raw_size: FILE_ALIGNMENT,
                raw_pointer: previous.raw_pointer + previous.raw_size,
                characteristics: DATA_CHARACTERISTICS,
            });
        }
        sections
    }

    /// Produce the complete image.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if the section table does not fit into the headers.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn assemble(&self, text: &TextContent) -> Result<Vec<u8>> {
        let sections = self.sections(text);
        let section_table = PE_OFFSET + 4 + 20 + 0xE0;
        if section_table + sections.len() * SECTION_HEADER_SIZE > BOUND_IMPORT_OFFSET as usize {
            return Err(Error::NotSupported(format!(
                "{} sections do not fit into the headers",
                sections.len()
            )));
        }

        let last = &sections[sections.len() - 1];
        let size_of_image = align_up(
            (last.virtual_address + last.virtual_size) as usize,
            SECTION_ALIGNMENT as usize,
        ) as u32;
        let initialized_data: u32 = sections[1..].iter().map(|section| section.raw_size).sum();

        let mut pe = Vec::with_capacity(
            (last.raw_pointer + last.raw_size) as usize + self.options.certificate.as_ref().map_or(0, Vec::len),
        );

        // DOS header, e_lfanew at 0x3C
        pe.extend_from_slice(b"MZ");
        pe.resize(0x3C, 0);
        push_le::<u32>(&mut pe, PE_OFFSET as u32);
        pe.resize(PE_OFFSET, 0);

        pe.extend_from_slice(b"PE\0\0");

        // COFF header
        push_le::<u16>(&mut pe, 0x014C);
        push_le::<u16>(&mut pe, sections.len() as u16);
        push_le::<u32>(&mut pe, 0);
        push_le::<u32>(&mut pe, 0);
        push_le::<u32>(&mut pe, 0);
        push_le::<u16>(&mut pe, 0xE0);
        push_le::<u16>(&mut pe, FILE_CHARACTERISTICS);

        // Optional header, PE32
        push_le::<u16>(&mut pe, 0x010B);
        push_le::<u8>(&mut pe, 8);
        push_le::<u8>(&mut pe, 0);
        push_le::<u32>(&mut pe, sections[0].raw_size);
        push_le::<u32>(&mut pe, initialized_data);
        push_le::<u32>(&mut pe, 0);
        push_le::<u32>(&mut pe, 0);
        push_le::<u32>(&mut pe, TEXT_RVA);
        push_le::<u32>(&mut pe, sections.get(1).map_or(0, |section| section.virtual_address));
        push_le::<u32>(&mut pe, IMAGE_BASE);
        push_le::<u32>(&mut pe, SECTION_ALIGNMENT);
        push_le::<u32>(&mut pe, FILE_ALIGNMENT);
        push_le::<u16>(&mut pe, 4);
        push_le::<u16>(&mut pe, 0);
        push_le::<u16>(&mut pe, 0);
        push_le::<u16>(&mut pe, 0);
        push_le::<u16>(&mut pe, 4);
        push_le::<u16>(&mut pe, 0);
        push_le::<u32>(&mut pe, 0);
        push_le::<u32>(&mut pe, size_of_image);
        push_le::<u32>(&mut pe, SIZE_OF_HEADERS);
        push_le::<u32>(&mut pe, 0);
        push_le::<u16>(&mut pe, 3);
        push_le::<u16>(&mut pe, DLL_CHARACTERISTICS);
        push_le::<u32>(&mut pe, 0x0010_0000);
        push_le::<u32>(&mut pe, 0x1000);
        push_le::<u32>(&mut pe, 0x0010_0000);
        push_le::<u32>(&mut pe, 0x1000);
        push_le::<u32>(&mut pe, 0);
        push_le::<u32>(&mut pe, DIRECTORY_COUNT as u32);

        let directories = pe.len();
        pe.resize(directories + DIRECTORY_COUNT * 8, 0);
        let directory = |pe: &mut Vec<u8>, index: usize, address: u32, size: u32| -> Result<()> {
            write_le_at::<u32>(pe, directories + index * 8, address)?;
            write_le_at::<u32>(pe, directories + index * 8 + 4, size)
        };
        directory(&mut pe, DIRECTORY_CLR, TEXT_RVA, COR20_HEADER_SIZE as u32)?;
        if self.options.debug_directory {
            directory(&mut pe, DIRECTORY_DEBUG, text.debug_rva, DEBUG_DIRECTORY_SIZE as u32)?;
        }
        if self.options.bound_import {
            directory(&mut pe, DIRECTORY_BOUND_IMPORT, BOUND_IMPORT_OFFSET, 0x10)?;
        }

        for section in &sections {
            pe.extend_from_slice(&section.name);
            push_le::<u32>(&mut pe, section.virtual_size);
            push_le::<u32>(&mut pe, section.virtual_address);
            push_le::<u32>(&mut pe, section.raw_size);
            push_le::<u32>(&mut pe, section.raw_pointer);
            pe.extend_from_slice(&[0u8; 12]);
            push_le::<u32>(&mut pe, section.characteristics);
        }
        pe.resize(SIZE_OF_HEADERS as usize, 0);

        pe.extend_from_slice(&text.data);
        for section in &sections {
            pe.resize((section.raw_pointer + section.raw_size) as usize, 0);
        }

        if let Some(certificate) = &self.options.certificate {
            let offset = pe.len() as u32;
            let length = 8 + certificate.len();
            push_le::<u32>(&mut pe, length as u32);
            // WIN_CERT_REVISION_2_0, WIN_CERT_TYPE_PKCS_SIGNED_DATA
            push_le::<u16>(&mut pe, 0x0200);
            push_le::<u16>(&mut pe, 0x0002);
            pe.extend_from_slice(certificate);
            pe.resize(align_up(pe.len(), 8), 0);
            let end = pe.len() as u32;
            directory(&mut pe, DIRECTORY_CERTIFICATE, offset, end - offset)?;
        }

        if self.options.checksum {
            let offset = PE_OFFSET + 4 + 20 + 64;
            let checksum = pe_checksum(&pe, offset);
            write_le_at::<u32>(&mut pe, offset, checksum)?;
        }

        Ok(pe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{file::File, metadata::root::CIL_HEADER_MAGIC};

    #[test]
    fn metadata_streams_are_padded() {
        let blob = metadata_blob(&[1, 2, 3], &[0, b'a', 0], &[0], &[7; 16], &[0, 1, 9]);
        let root = Root::read(&blob).unwrap();
        assert_eq!(root.version(), "v4.0.30319");
        assert_eq!(
            root.stream_headers.iter().map(|h| h.name.as_str()).collect::<Vec<_>>(),
            ["#~", "#Strings", "#US", "#GUID", "#Blob"]
        );
        for header in &root.stream_headers {
            assert_eq!(header.offset % 4, 0);
            assert_eq!(header.size % 4, 0);
        }
        assert_eq!(root.stream("#GUID").unwrap().size, 16);
        assert_eq!(u32::from_le_bytes(blob[..4].try_into().unwrap()), CIL_HEADER_MAGIC);
    }

    #[test]
    fn layout_of_single_section() {
        let options = ImageOptions::default();
        let mut text = TextContent::new(&options);
        let rva = text.push_body(&[0x0A, 0x2A]);
        assert_eq!(rva, TEXT_RVA + COR20_HEADER_SIZE as u32);
        text.set_metadata(metadata_blob(&[0; 24], &[0], &[0], &[1; 16], &[0]));

        let image = ImageLayout::new(&options).assemble(&text).unwrap();
        let file = File::from_mem(image).unwrap();
        let layout = file.layout();
        assert_eq!(layout.pe_offset, PE_OFFSET);
        assert_eq!(layout.section_table_offset, 0x178);
        assert_eq!(layout.file_alignment, FILE_ALIGNMENT);
        assert_eq!(file.sections().len(), 1);
        assert_eq!(file.sections()[0].pointer_to_raw_data, TEXT_RAW);
        assert_eq!(file.clr(), (TEXT_RVA, COR20_HEADER_SIZE as u32));
        assert_eq!(file.rva_to_offset(rva as usize).unwrap(), 0x248);
    }

    #[test]
    fn too_many_sections() {
        let options = ImageOptions {
            extra_sections: 3,
            ..ImageOptions::default()
        };
        let mut text = TextContent::new(&options);
        text.set_metadata(metadata_blob(&[0; 24], &[0], &[0], &[1; 16], &[0]));
        assert!(matches!(
            ImageLayout::new(&options).assemble(&text),
            Err(Error::NotSupported(_))
        ));
    }
}
