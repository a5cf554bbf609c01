//! The CLI header (ECMA-335 II.25.3.3), located by PE data directory 14.

use crate::{
    file::{io::push_le, parser::Parser},
    Error::OutOfBounds,
    Result,
};

/// Size of the CLI header in bytes
pub const COR20_HEADER_SIZE: usize = 72;

/// Offset of the `MetaData` directory inside the header
pub const COR20_METADATA_OFFSET: usize = 8;

/// The fields of the CLI header that the patcher reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cor20Header {
    /// Size of the header, always 72
    pub cb: u32,
    /// Major runtime version
    pub major_runtime_version: u16,
    /// Minor runtime version
    pub minor_runtime_version: u16,
    /// RVA of the metadata root
    pub meta_data_rva: u32,
    /// Size of the metadata
    pub meta_data_size: u32,
    /// Runtime flags (`COMIMAGE_FLAGS_*`)
    pub flags: u32,
    /// Entry point token or RVA
    pub entry_point_token: u32,
    /// RVA of managed resources
    pub resource_rva: u32,
    /// Size of managed resources
    pub resource_size: u32,
    /// RVA of the strong name signature
    pub strong_name_signature_rva: u32,
    /// Size of the strong name signature
    pub strong_name_signature_size: u32,
}

impl Cor20Header {
    /// Parse the header from `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for short input, [`crate::Error::Malformed`] if the
    /// size field or the metadata directory is invalid.
    pub fn read(data: &[u8]) -> Result<Cor20Header> {
        if data.len() < COR20_HEADER_SIZE {
            return Err(OutOfBounds);
        }

        let mut parser = Parser::new(data);
        let cb = parser.read_le::<u32>()?;
        if cb as usize != COR20_HEADER_SIZE {
            return Err(malformed_error!(
                "Invalid CLR header size: expected 72, got {}",
                cb
            ));
        }

        let major_runtime_version = parser.read_le::<u16>()?;
        let minor_runtime_version = parser.read_le::<u16>()?;
        let meta_data_rva = parser.read_le::<u32>()?;
        let meta_data_size = parser.read_le::<u32>()?;
        if meta_data_rva == 0 || meta_data_size == 0 {
            return Err(malformed_error!("CLR header has no metadata directory"));
        }

        Ok(Cor20Header {
            cb,
            major_runtime_version,
            minor_runtime_version,
            meta_data_rva,
            meta_data_size,
            flags: parser.read_le::<u32>()?,
            entry_point_token: parser.read_le::<u32>()?,
            resource_rva: parser.read_le::<u32>()?,
            resource_size: parser.read_le::<u32>()?,
            strong_name_signature_rva: parser.read_le::<u32>()?,
            strong_name_signature_size: parser.read_le::<u32>()?,
        })
    }

    /// Append the encoded header to `out`. The directories that are not modelled (code manager
    /// table, vtable fixups, export address table jumps, managed native header) are written as 0.
    pub fn write(&self, out: &mut Vec<u8>) {
        push_le::<u32>(out, self.cb);
        push_le::<u16>(out, self.major_runtime_version);
        push_le::<u16>(out, self.minor_runtime_version);
        push_le::<u32>(out, self.meta_data_rva);
        push_le::<u32>(out, self.meta_data_size);
        push_le::<u32>(out, self.flags);
        push_le::<u32>(out, self.entry_point_token);
        push_le::<u32>(out, self.resource_rva);
        push_le::<u32>(out, self.resource_size);
        push_le::<u32>(out, self.strong_name_signature_rva);
        push_le::<u32>(out, self.strong_name_signature_size);
        out.resize(out.len() + COR20_HEADER_SIZE - 40, 0);
    }
}
