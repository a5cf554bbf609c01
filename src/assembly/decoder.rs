//! Decoding of CIL byte code into instructions.
//!
//! Branch displacements are resolved to absolute offsets relative to the start of the code, so
//! the editor can map them onto instruction ids without knowing encoding sizes.

use crate::{
    assembly::{
        instruction::{Immediate, Operand},
        opcodes::{FlowType, OpCode, OperandType},
    },
    file::parser::Parser,
    metadata::token::Token,
    Result,
};

/// An instruction as found in an existing body.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedInstruction {
    /// Offset of the first opcode byte from the start of the code
    pub offset: u32,
    /// Encoded size in bytes
    pub size: u32,
    /// The opcode
    pub opcode: OpCode,
    /// The operand, with branch targets as absolute code offsets
    pub operand: Operand<u32>,
}

/// Decode the instruction at the parser's position.
///
/// # Errors
/// Returns an error for reserved opcodes, truncated operands or branch targets before the
/// start of the code.
pub fn decode_instruction(parser: &mut Parser) -> Result<DecodedInstruction> {
    let start = parser.pos();
    let first_byte = parser.read_le::<u8>()?;
    let opcode = match first_byte {
        0xFE => OpCode::from_parts(0xFE, parser.read_le::<u8>()?)?,
        _ => OpCode::from_parts(0, first_byte)?,
    };

    let operand = match opcode.operand_type() {
        OperandType::None => Operand::None,
        OperandType::Int8 => Operand::Immediate(Immediate::Int8(parser.read_le::<i8>()?)),
        OperandType::UInt8 => Operand::Immediate(Immediate::UInt8(parser.read_le::<u8>()?)),
        OperandType::UInt16 => Operand::Immediate(Immediate::UInt16(parser.read_le::<u16>()?)),
        OperandType::Int32 => Operand::Immediate(Immediate::Int32(parser.read_le::<i32>()?)),
        OperandType::Int64 => Operand::Immediate(Immediate::Int64(parser.read_le::<i64>()?)),
        OperandType::Float32 => Operand::Immediate(Immediate::Float32(parser.read_le::<f32>()?)),
        OperandType::Float64 => Operand::Immediate(Immediate::Float64(parser.read_le::<f64>()?)),
        OperandType::Token => Operand::Token(Token::new(parser.read_le::<u32>()?)),
        OperandType::Switch => {
            let case_count = parser.read_le::<u32>()? as usize;
            if case_count > parser.remaining() / 4 {
                return Err(malformed_error!(
                    "Switch at {} declares {} cases",
                    start,
                    case_count
                ));
            }

            let mut displacements = Vec::with_capacity(case_count);
            for _ in 0..case_count {
                displacements.push(parser.read_le::<i32>()?);
            }

            let next = parser.pos();
            Operand::Switch(
                displacements
                    .into_iter()
                    .map(|displacement| branch_target(start, next, i64::from(displacement)))
                    .collect::<Result<Vec<_>>>()?,
            )
        }
    };

    let next = parser.pos();
    let operand = match (opcode.flow(), operand) {
        (
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave,
            Operand::Immediate(displacement),
        ) => {
            let displacement = displacement.as_i64().unwrap_or_default();
            Operand::Target(branch_target(start, next, displacement)?)
        }
        (_, operand) => operand,
    };

    let offset = u32::try_from(start).map_err(|_| malformed_error!("Code too large"))?;
    let size = u32::try_from(next - start).map_err(|_| malformed_error!("Code too large"))?;
    Ok(DecodedInstruction {
        offset,
        size,
        opcode,
        operand,
    })
}

fn branch_target(start: usize, next: usize, displacement: i64) -> Result<u32> {
    #[allow(clippy::cast_possible_wrap)]
    let target = next as i64 + displacement;
    u32::try_from(target)
        .map_err(|_| malformed_error!("Branch at {} targets offset {}", start, target))
}

/// Decode a complete code block.
///
/// # Errors
/// Returns an error if any instruction is invalid or truncated.
pub fn decode_stream(code: &[u8]) -> Result<Vec<DecodedInstruction>> {
    let mut parser = Parser::new(code);
    let mut instructions = Vec::new();

    while parser.has_more_data() {
        instructions.push(decode_instruction(&mut parser)?);
    }

    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_and_two_byte() {
        let instructions = decode_stream(&[0x02, 0xFE, 0x01, 0x2A]).unwrap();
        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[0].opcode, OpCode::LDARG_0);
        assert_eq!(instructions[1].opcode, OpCode::CEQ);
        assert_eq!(instructions[1].offset, 1);
        assert_eq!(instructions[1].size, 2);
        assert_eq!(instructions[2].offset, 3);
    }

    #[test]
    fn operands() {
        #[rustfmt::skip]
        let code = [
            0x11, 0x10,
            0x20, 0x78, 0x56, 0x34, 0x12,
            0x72, 0x01, 0x00, 0x00, 0x70,
            0xFE, 0x0C, 0x01, 0x01,
        ];

        let instructions = decode_stream(&code).unwrap();
        assert_eq!(
            instructions[0].operand,
            Operand::Immediate(Immediate::UInt8(0x10))
        );
        assert_eq!(
            instructions[1].operand,
            Operand::Immediate(Immediate::Int32(0x1234_5678))
        );
        assert_eq!(instructions[2].operand, Operand::Token(Token::new(0x7000_0001)));
        assert_eq!(instructions[3].opcode, OpCode::LDLOC);
        assert_eq!(
            instructions[3].operand,
            Operand::Immediate(Immediate::UInt16(0x0101))
        );
    }

    #[test]
    fn branches_are_absolute() {
        #[rustfmt::skip]
        let code = [
            0x2B, 0x02,             // br.s +2 -> 4
            0x00,
            0x00,
            0x3A, 0xF6, 0xFF, 0xFF, 0xFF, // brtrue -10 -> -1
        ];

        let mut parser = Parser::new(&code);
        let first = decode_instruction(&mut parser).unwrap();
        assert_eq!(first.operand, Operand::Target(4));
        assert_eq!(first.size, 2);

        assert!(decode_stream(&code).is_err());
    }

    #[test]
    fn switch_targets() {
        #[rustfmt::skip]
        let code = [
            0x45, 0x02, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x00, 0x00,
            0x00,
            0x2A,
        ];

        let instructions = decode_stream(&code).unwrap();
        assert_eq!(instructions[0].operand, Operand::Switch(vec![13, 14]));
        assert_eq!(instructions[0].size, 13);
    }

    #[test]
    fn reserved_and_truncated() {
        assert!(decode_stream(&[0x24]).is_err());
        assert!(decode_stream(&[0xFE]).is_err());
        assert!(decode_stream(&[0x28, 0x01, 0x00]).is_err());
        assert!(decode_stream(&[0x45, 0xFF, 0xFF, 0x00, 0x00]).is_err());
    }
}
