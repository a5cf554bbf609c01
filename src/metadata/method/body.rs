//! Method body headers and their data sections (ECMA-335 II.25.4).
//!
//! [`MethodBody::from`] reads the tiny or fat header, the code size and the exception handling
//! sections that follow the code. [`encode_method_body`] produces the inverse, choosing the tiny
//! header and small exception clauses whenever they can express the body.

use crate::{
    file::io::{push_le, read_le, read_le_at},
    metadata::method::{ExceptionHandler, ExceptionHandlerFlags, MethodBodyFlags, SectionFlags},
    Error::OutOfBounds,
    Result,
};

/// Describes one method that has been compiled to CIL bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    /// Size of the method (length of all instructions, not counting the header) in bytes
    pub size_code: usize,
    /// Size of the method header in bytes
    pub size_header: usize,
    /// Size of header, code, padding and exception sections as stored in the file
    pub size_total: usize,
    /// `MetaData` token for a signature describing the layout of the local variables for the method. 0 == no local variables
    pub local_var_sig_token: u32,
    /// Maximum number of items on the operand stack
    pub max_stack: usize,
    /// Flag, indicating the type of the method header
    pub is_fat: bool,
    /// Flag, indicating to call default constructor on all local variables
    pub is_init_local: bool,
    /// Flag, indicating if this method does have exception handlers
    pub is_exception_data: bool,
    /// A list of exception handlers this method has
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Create a `MethodBody` object from a sequence of bytes starting at the header.
    ///
    /// # Errors
    /// Returns an error if the data is empty, out of bounds, or malformed.
    pub fn from(data: &[u8]) -> Result<MethodBody> {
        if data.is_empty() {
            return Err(malformed_error!("Provided data for body parsing is empty"));
        }

        let first_byte = read_le::<u8>(data)?;
        match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_0000_0011_u8)) {
            MethodBodyFlags::TINY_FORMAT => {
                let size_code = (first_byte >> 2) as usize;
                if size_code + 1 > data.len() {
                    return Err(OutOfBounds);
                }

                Ok(MethodBody {
                    size_code,
                    size_header: 1,
                    size_total: size_code + 1,
                    local_var_sig_token: 0,
                    max_stack: 8,
                    is_fat: false,
                    is_init_local: false,
                    is_exception_data: false,
                    exception_handlers: Vec::new(),
                })
            }
            MethodBodyFlags::FAT_FORMAT => {
                if data.len() < 12 {
                    return Err(OutOfBounds);
                }

                let first_duo = read_le::<u16>(data)?;
                let size_header = ((first_duo >> 12) * 4) as usize;
                if size_header < 12 {
                    return Err(malformed_error!(
                        "Fat method header too small - {}",
                        size_header
                    ));
                }

                let size_code = read_le::<u32>(&data[4..])? as usize;
                if data.len() < size_code + size_header {
                    return Err(OutOfBounds);
                }

                let flags_header = MethodBodyFlags::from_bits_truncate(first_duo & 0x0FFF);
                let max_stack = read_le::<u16>(&data[2..])? as usize;
                let local_var_sig_token = read_le::<u32>(&data[8..])?;

                let mut size_total = size_header + size_code;
                let mut exception_handlers = Vec::new();
                if flags_header.contains(MethodBodyFlags::MORE_SECTS) {
                    size_total = read_sections(data, size_total, &mut exception_handlers)?;
                }

                Ok(MethodBody {
                    size_code,
                    size_header,
                    size_total,
                    local_var_sig_token,
                    max_stack,
                    is_fat: true,
                    is_init_local: flags_header.contains(MethodBodyFlags::INIT_LOCALS),
                    is_exception_data: !exception_handlers.is_empty(),
                    exception_handlers,
                })
            }
            _ => Err(malformed_error!(
                "MethodHeader is neither FAT nor TINY - {}",
                first_byte
            )),
        }
    }

    /// Size of header and code
    #[must_use]
    pub fn size(&self) -> usize {
        self.size_header + self.size_code
    }

    /// The IL code of this body within `data`, the slice the body was read from
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
    pub fn code<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        data.get(self.size_header..self.size()).ok_or(OutOfBounds)
    }
}

/// Parse the data sections following the code, returning the end of the last section.
fn read_sections(
    data: &[u8],
    code_end: usize,
    handlers: &mut Vec<ExceptionHandler>,
) -> Result<usize> {
    let mut cursor = (code_end + 3) & !3;
    loop {
        if data.len() < cursor + 4 {
            return Err(OutOfBounds);
        }

        let section_flags = SectionFlags::from_bits_truncate(data[cursor]);
        let is_fat = section_flags.contains(SectionFlags::FAT_FORMAT);
        let section_size = if is_fat {
            (read_le::<u32>(&data[cursor..])? >> 8) as usize
        } else {
            data[cursor + 1] as usize
        };

        if section_size < 4 || data.len() < cursor + section_size {
            return Err(malformed_error!(
                "Invalid method data section size - {}",
                section_size
            ));
        }

        if section_flags.contains(SectionFlags::EHTABLE) {
            let mut offset = cursor + 4;
            if is_fat {
                for _ in 0..(section_size - 4) / 24 {
                    #[allow(clippy::cast_possible_truncation)]
                    let flags = ExceptionHandlerFlags::from_bits_truncate(
                        read_le_at::<u32>(data, &mut offset)? as u16,
                    );
                    handlers.push(ExceptionHandler {
                        flags,
                        try_offset: read_le_at::<u32>(data, &mut offset)?,
                        try_length: read_le_at::<u32>(data, &mut offset)?,
                        handler_offset: read_le_at::<u32>(data, &mut offset)?,
                        handler_length: read_le_at::<u32>(data, &mut offset)?,
                        filter_offset: read_le_at::<u32>(data, &mut offset)?,
                    });
                }
            } else {
                for _ in 0..(section_size - 4) / 12 {
                    handlers.push(ExceptionHandler {
                        flags: ExceptionHandlerFlags::from_bits_truncate(read_le_at::<u16>(
                            data,
                            &mut offset,
                        )?),
                        try_offset: u32::from(read_le_at::<u16>(data, &mut offset)?),
                        try_length: u32::from(read_le_at::<u8>(data, &mut offset)?),
                        handler_offset: u32::from(read_le_at::<u16>(data, &mut offset)?),
                        handler_length: u32::from(read_le_at::<u8>(data, &mut offset)?),
                        filter_offset: read_le_at::<u32>(data, &mut offset)?,
                    });
                }
            }
        }

        cursor += section_size;
        if !section_flags.contains(SectionFlags::MORE_SECTS) {
            return Ok(cursor);
        }
        cursor = (cursor + 3) & !3;
    }
}

/// Encode a complete method body: header, code and exception handling section.
///
/// A tiny header is used for code shorter than 64 bytes with a max stack of at most 8, no locals
/// and no exception handlers. Exception clauses use the small format when every clause and the
/// section size fit it.
///
/// # Errors
/// Returns an error if the code size or the exception section exceed the encodable range.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_method_body(
    code: &[u8],
    max_stack: u16,
    local_var_sig_token: u32,
    init_locals: bool,
    handlers: &[ExceptionHandler],
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(code.len() + 12);
    if code.len() < 64 && max_stack <= 8 && local_var_sig_token == 0 && handlers.is_empty() {
        out.push(((code.len() as u8) << 2) | MethodBodyFlags::TINY_FORMAT.bits() as u8);
        out.extend_from_slice(code);
        return Ok(out);
    }

    let code_size = u32::try_from(code.len())
        .map_err(|_| malformed_error!("Method code too large - {}", code.len()))?;

    let mut flags = MethodBodyFlags::FAT_FORMAT;
    if init_locals {
        flags |= MethodBodyFlags::INIT_LOCALS;
    }
    if !handlers.is_empty() {
        flags |= MethodBodyFlags::MORE_SECTS;
    }

    push_le::<u16>(&mut out, flags.bits() | (3 << 12));
    push_le::<u16>(&mut out, max_stack);
    push_le::<u32>(&mut out, code_size);
    push_le::<u32>(&mut out, local_var_sig_token);
    out.extend_from_slice(code);

    if handlers.is_empty() {
        return Ok(out);
    }

    out.resize(out.len().div_ceil(4) * 4, 0);
    let small_size = 4 + handlers.len() * 12;
    if small_size <= 0xFF && handlers.iter().all(ExceptionHandler::fits_small) {
        out.push(SectionFlags::EHTABLE.bits());
        out.push(small_size as u8);
        push_le::<u16>(&mut out, 0);
        for handler in handlers {
            push_le::<u16>(&mut out, handler.flags.bits());
            push_le::<u16>(&mut out, handler.try_offset as u16);
            push_le::<u8>(&mut out, handler.try_length as u8);
            push_le::<u16>(&mut out, handler.handler_offset as u16);
            push_le::<u8>(&mut out, handler.handler_length as u8);
            push_le::<u32>(&mut out, handler.filter_offset);
        }
    } else {
        let fat_size = 4 + handlers.len() * 24;
        if fat_size > 0x00FF_FFFF {
            return Err(malformed_error!(
                "Too many exception handlers - {}",
                handlers.len()
            ));
        }

        let kind = (SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits();
        push_le::<u32>(&mut out, u32::from(kind) | ((fat_size as u32) << 8));
        for handler in handlers {
            push_le::<u32>(&mut out, u32::from(handler.flags.bits()));
            push_le::<u32>(&mut out, handler.try_offset);
            push_le::<u32>(&mut out, handler.try_length);
            push_le::<u32>(&mut out, handler.handler_offset);
            push_le::<u32>(&mut out, handler.handler_length);
            push_le::<u32>(&mut out, handler.filter_offset);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny() {
        // ldarg.0; ldarg.1; add; ret
        let data = [0x12, 0x02, 0x03, 0x58, 0x2A, 0xFF];

        let body = MethodBody::from(&data).unwrap();
        assert!(!body.is_fat);
        assert!(!body.is_exception_data);
        assert_eq!(body.size_code, 4);
        assert_eq!(body.size_header, 1);
        assert_eq!(body.size(), 5);
        assert_eq!(body.size_total, 5);
        assert_eq!(body.max_stack, 8);
        assert_eq!(body.code(&data).unwrap(), &[0x02, 0x03, 0x58, 0x2A]);
    }

    #[test]
    fn fat() {
        #[rustfmt::skip]
        let data = [
            0x13, 0x30, 0x05, 0x00,
            0x02, 0x00, 0x00, 0x00,
            0x59, 0x00, 0x00, 0x11,
            0x00, 0x2A,
        ];

        let body = MethodBody::from(&data).unwrap();
        assert!(body.is_fat);
        assert!(body.is_init_local);
        assert!(!body.is_exception_data);
        assert_eq!(body.max_stack, 5);
        assert_eq!(body.size_code, 2);
        assert_eq!(body.size_header, 12);
        assert_eq!(body.size_total, 14);
        assert_eq!(body.local_var_sig_token, 0x1100_0059);
    }

    #[test]
    fn fat_small_exception_section() {
        #[rustfmt::skip]
        let data = [
            0x1B, 0x30, 0x01, 0x00,
            0x05, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0xDE, 0x02, 0x26, 0x2A,
            0x00, 0x00, 0x00,
            0x01, 0x10, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x03, 0x03, 0x00, 0x01, 0x03, 0x00, 0x00, 0x01,
        ];

        let body = MethodBody::from(&data).unwrap();
        assert!(body.is_exception_data);
        assert_eq!(body.size_total, 36);
        assert_eq!(body.exception_handlers.len(), 1);

        let handler = &body.exception_handlers[0];
        assert_eq!(handler.flags, ExceptionHandlerFlags::EXCEPTION);
        assert_eq!(handler.try_offset, 0);
        assert_eq!(handler.try_length, 3);
        assert_eq!(handler.handler_offset, 3);
        assert_eq!(handler.handler_length, 1);
        assert_eq!(handler.filter_offset, 0x0100_0003);
    }

    #[test]
    fn encode_chooses_tiny() {
        let encoded = encode_method_body(&[0x02, 0x2A], 1, 0, true, &[]).unwrap();
        assert_eq!(encoded, [0x0A, 0x02, 0x2A]);

        let body = MethodBody::from(&encoded).unwrap();
        assert_eq!(body.code(&encoded).unwrap(), &[0x02, 0x2A]);
    }

    #[test]
    fn encode_fat_with_handlers() {
        let handler = ExceptionHandler {
            flags: ExceptionHandlerFlags::FINALLY,
            try_offset: 0,
            try_length: 2,
            handler_offset: 2,
            handler_length: 1,
            filter_offset: 0,
        };
        let code = [0x00, 0x00, 0xDC, 0x2A];

        let encoded = encode_method_body(&code, 2, 0x1100_0001, true, &[handler.clone()]).unwrap();
        let body = MethodBody::from(&encoded).unwrap();
        assert!(body.is_fat);
        assert!(body.is_init_local);
        assert_eq!(body.max_stack, 2);
        assert_eq!(body.local_var_sig_token, 0x1100_0001);
        assert_eq!(body.exception_handlers, vec![handler.clone()]);
        assert_eq!(body.size_total, encoded.len());

        let large = ExceptionHandler {
            try_length: 0x1000,
            ..handler
        };
        let encoded = encode_method_body(&code, 2, 0, false, &[large.clone()]).unwrap();
        let body = MethodBody::from(&encoded).unwrap();
        assert_eq!(body.exception_handlers, vec![large]);
        assert_eq!(encoded[16], 0x41);
    }

    #[test]
    fn invalid_headers() {
        assert!(MethodBody::from(&[]).is_err());
        assert!(MethodBody::from(&[0x00]).is_err());
        assert!(MethodBody::from(&[0x16, 0x2A]).is_err());
        assert!(matches!(MethodBody::from(&[0x13, 0x30, 0x00]), Err(OutOfBounds)));
    }
}
