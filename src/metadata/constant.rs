//! Values of the `Constant` table (ECMA-335 II.22.9).

use std::fmt;

use widestring::U16Str;

use crate::{file::parser::Parser, metadata::signatures::ELEMENT_TYPE, Result};

/// A literal value attached to a field, parameter or property
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ConstantValue {
    Boolean(bool),
    Char(u16),
    I1(i8),
    U1(u8),
    I2(i16),
    U2(u16),
    I4(i32),
    U4(u32),
    I8(i64),
    U8(u64),
    R4(f32),
    R8(f64),
    String(String),
    /// A null reference (`ELEMENT_TYPE_CLASS` with a zero value)
    Null,
}

impl ConstantValue {
    /// Decode the blob of a `Constant` row with element type `element_type`.
    ///
    /// # Errors
    /// Returns an error if the blob is too short or the element type cannot hold a constant.
    pub fn parse(element_type: u8, blob: &[u8]) -> Result<ConstantValue> {
        let mut parser = Parser::new(blob);
        Ok(match element_type {
            ELEMENT_TYPE::BOOLEAN => ConstantValue::Boolean(parser.read_le::<u8>()? != 0),
            ELEMENT_TYPE::CHAR => ConstantValue::Char(parser.read_le::<u16>()?),
            ELEMENT_TYPE::I1 => ConstantValue::I1(parser.read_le::<i8>()?),
            ELEMENT_TYPE::U1 => ConstantValue::U1(parser.read_le::<u8>()?),
            ELEMENT_TYPE::I2 => ConstantValue::I2(parser.read_le::<i16>()?),
            ELEMENT_TYPE::U2 => ConstantValue::U2(parser.read_le::<u16>()?),
            ELEMENT_TYPE::I4 => ConstantValue::I4(parser.read_le::<i32>()?),
            ELEMENT_TYPE::U4 => ConstantValue::U4(parser.read_le::<u32>()?),
            ELEMENT_TYPE::I8 => ConstantValue::I8(parser.read_le::<i64>()?),
            ELEMENT_TYPE::U8 => ConstantValue::U8(parser.read_le::<u64>()?),
            ELEMENT_TYPE::R4 => ConstantValue::R4(parser.read_le::<f32>()?),
            ELEMENT_TYPE::R8 => ConstantValue::R8(parser.read_le::<f64>()?),
            ELEMENT_TYPE::STRING => {
                if blob.len() % 2 != 0 {
                    return Err(malformed_error!(
                        "String constant has odd length - {}",
                        blob.len()
                    ));
                }

                let units: Vec<u16> = blob
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                ConstantValue::String(U16Str::from_slice(&units).to_string_lossy())
            }
            ELEMENT_TYPE::CLASS => ConstantValue::Null,
            _ => {
                return Err(malformed_error!(
                    "Invalid constant element type - {}",
                    element_type
                ))
            }
        })
    }

    /// Name of the stored type, as used in error messages
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            ConstantValue::Boolean(_) => "bool",
            ConstantValue::Char(_) => "char",
            ConstantValue::I1(_) => "int8",
            ConstantValue::U1(_) => "uint8",
            ConstantValue::I2(_) => "int16",
            ConstantValue::U2(_) => "uint16",
            ConstantValue::I4(_) => "int32",
            ConstantValue::U4(_) => "uint32",
            ConstantValue::I8(_) => "int64",
            ConstantValue::U8(_) => "uint64",
            ConstantValue::R4(_) => "float32",
            ConstantValue::R8(_) => "float64",
            ConstantValue::String(_) => "string",
            ConstantValue::Null => "null",
        }
    }

    /// The element type byte of the stored type
    #[must_use]
    pub fn element_type(&self) -> u8 {
        match self {
            ConstantValue::Boolean(_) => ELEMENT_TYPE::BOOLEAN,
            ConstantValue::Char(_) => ELEMENT_TYPE::CHAR,
            ConstantValue::I1(_) => ELEMENT_TYPE::I1,
            ConstantValue::U1(_) => ELEMENT_TYPE::U1,
            ConstantValue::I2(_) => ELEMENT_TYPE::I2,
            ConstantValue::U2(_) => ELEMENT_TYPE::U2,
            ConstantValue::I4(_) => ELEMENT_TYPE::I4,
            ConstantValue::U4(_) => ELEMENT_TYPE::U4,
            ConstantValue::I8(_) => ELEMENT_TYPE::I8,
            ConstantValue::U8(_) => ELEMENT_TYPE::U8,
            ConstantValue::R4(_) => ELEMENT_TYPE::R4,
            ConstantValue::R8(_) => ELEMENT_TYPE::R8,
            ConstantValue::String(_) => ELEMENT_TYPE::STRING,
            ConstantValue::Null => ELEMENT_TYPE::CLASS,
        }
    }

    /// The value blob as stored in `#Blob`
    #[must_use]
    pub fn to_blob(&self) -> Vec<u8> {
        match self {
            ConstantValue::Boolean(value) => vec![u8::from(*value)],
            ConstantValue::Char(value) | ConstantValue::U2(value) => value.to_le_bytes().to_vec(),
            ConstantValue::I1(value) => value.to_le_bytes().to_vec(),
            ConstantValue::U1(value) => vec![*value],
            ConstantValue::I2(value) => value.to_le_bytes().to_vec(),
            ConstantValue::I4(value) => value.to_le_bytes().to_vec(),
            ConstantValue::U4(value) => value.to_le_bytes().to_vec(),
            ConstantValue::I8(value) => value.to_le_bytes().to_vec(),
            ConstantValue::U8(value) => value.to_le_bytes().to_vec(),
            ConstantValue::R4(value) => value.to_le_bytes().to_vec(),
            ConstantValue::R8(value) => value.to_le_bytes().to_vec(),
            ConstantValue::String(value) => value
                .encode_utf16()
                .flat_map(u16::to_le_bytes)
                .collect(),
            ConstantValue::Null => vec![0, 0, 0, 0],
        }
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::Boolean(value) => write!(f, "{value}"),
            ConstantValue::Char(value) => write!(f, "'\\u{value:04x}'"),
            ConstantValue::I1(value) => write!(f, "{value}"),
            ConstantValue::U1(value) => write!(f, "{value}"),
            ConstantValue::I2(value) => write!(f, "{value}"),
            ConstantValue::U2(value) => write!(f, "{value}"),
            ConstantValue::I4(value) => write!(f, "{value}"),
            ConstantValue::U4(value) => write!(f, "{value}"),
            ConstantValue::I8(value) => write!(f, "{value}"),
            ConstantValue::U8(value) => write!(f, "{value}"),
            ConstantValue::R4(value) => write!(f, "{value}"),
            ConstantValue::R8(value) => write!(f, "{value}"),
            ConstantValue::String(value) => write!(f, "\"{value}\""),
            ConstantValue::Null => f.write_str("null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers() {
        assert_eq!(
            ConstantValue::parse(ELEMENT_TYPE::I4, &[0x02, 0x00, 0x00, 0x00]).unwrap(),
            ConstantValue::I4(2)
        );
        assert_eq!(
            ConstantValue::parse(ELEMENT_TYPE::I1, &[0xFF]).unwrap(),
            ConstantValue::I1(-1)
        );
        assert!(ConstantValue::parse(ELEMENT_TYPE::I4, &[0x02]).is_err());
    }

    #[test]
    fn strings_and_null() {
        let blob = ConstantValue::String("Real".to_string()).to_blob();
        assert_eq!(blob, [b'R', 0, b'e', 0, b'a', 0, b'l', 0]);
        assert_eq!(
            ConstantValue::parse(ELEMENT_TYPE::STRING, &blob).unwrap(),
            ConstantValue::String("Real".to_string())
        );
        assert_eq!(
            ConstantValue::parse(ELEMENT_TYPE::CLASS, &[0, 0, 0, 0]).unwrap(),
            ConstantValue::Null
        );
        assert!(ConstantValue::parse(ELEMENT_TYPE::OBJECT, &[]).is_err());
    }

    #[test]
    fn blob_round_trip_per_type() {
        for value in [
            ConstantValue::Boolean(true),
            ConstantValue::U2(0xBEEF),
            ConstantValue::I8(-5),
            ConstantValue::R8(1.5),
        ] {
            let parsed = ConstantValue::parse(value.element_type(), &value.to_blob()).unwrap();
            assert_eq!(parsed, value);
        }
    }
}
