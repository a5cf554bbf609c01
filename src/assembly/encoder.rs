//! Encoding of instructions into CIL byte code.

use crate::{
    assembly::{
        instruction::{Immediate, Operand},
        opcodes::{OpCode, OperandType},
    },
    file::io::push_le,
    Error::InvalidOperand,
    Result,
};

/// Encoded size of `opcode` with `operand`, in bytes
#[must_use]
pub fn instruction_size<T>(opcode: OpCode, operand: &Operand<T>) -> usize {
    let operand_size = match opcode.operand_type().size() {
        Some(size) => size,
        None => 4 + 4 * operand.targets().len(),
    };
    opcode.size() + operand_size
}

/// Append `opcode` and `operand` to `out`. Branch operands carry the displacement from the end
/// of the instruction.
///
/// # Errors
/// Returns [`crate::Error::InvalidOperand`] if the operand does not match or does not fit the
/// opcode's operand encoding.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub fn encode_instruction(out: &mut Vec<u8>, opcode: OpCode, operand: &Operand<i32>) -> Result<()> {
    let mnemonic = opcode.mnemonic();
    let invalid = |detail: String| InvalidOperand { mnemonic, detail };

    if opcode.prefix() != 0 {
        out.push(opcode.prefix());
    }
    out.push(opcode.code());

    match (opcode.operand_type(), operand) {
        (OperandType::None, Operand::None) => {}
        (OperandType::Token, Operand::Token(token)) => push_le::<u32>(out, token.value()),
        (OperandType::Int8, Operand::Target(displacement)) => {
            let value = i8::try_from(*displacement)
                .map_err(|_| invalid(format!("displacement {displacement} needs a long branch")))?;
            push_le::<i8>(out, value);
        }
        (OperandType::Int32, Operand::Target(displacement)) => push_le::<i32>(out, *displacement),
        (OperandType::Switch, Operand::Switch(displacements)) => {
            push_le::<u32>(out, displacements.len() as u32);
            for displacement in displacements {
                push_le::<i32>(out, *displacement);
            }
        }
        (OperandType::Float32, Operand::Immediate(Immediate::Float32(value))) => {
            push_le::<f32>(out, *value);
        }
        (OperandType::Float64, Operand::Immediate(Immediate::Float64(value))) => {
            push_le::<f64>(out, *value);
        }
        (OperandType::Float64, Operand::Immediate(Immediate::Float32(value))) => {
            push_le::<f64>(out, f64::from(*value));
        }
        (op_type, Operand::Immediate(value)) => {
            let Some(integer) = value.as_i64() else {
                return Err(invalid(format!("{value} is not an integer")));
            };
            let out_of_range = || invalid(format!("{integer} does not fit {op_type:?}"));
            match op_type {
                OperandType::Int8 => {
                    push_le::<i8>(out, i8::try_from(integer).map_err(|_| out_of_range())?);
                }
                OperandType::UInt8 => {
                    push_le::<u8>(out, u8::try_from(integer).map_err(|_| out_of_range())?);
                }
                OperandType::UInt16 => {
                    push_le::<u16>(out, u16::try_from(integer).map_err(|_| out_of_range())?);
                }
                OperandType::Int32 => {
                    push_le::<i32>(out, i32::try_from(integer).map_err(|_| out_of_range())?);
                }
                OperandType::Int64 => push_le::<i64>(out, integer),
                _ => return Err(invalid(format!("unexpected immediate {value}"))),
            }
        }
        (op_type, _) => return Err(invalid(format!("operand does not match {op_type:?}"))),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assembly::decoder::decode_stream, metadata::token::Token};

    #[test]
    fn sizes() {
        assert_eq!(instruction_size::<i32>(OpCode::RET, &Operand::None), 1);
        assert_eq!(instruction_size::<i32>(OpCode::CEQ, &Operand::None), 2);
        assert_eq!(instruction_size(OpCode::BR_S, &Operand::Target(0)), 2);
        assert_eq!(instruction_size(OpCode::BR, &Operand::Target(0)), 5);
        assert_eq!(instruction_size(OpCode::SWITCH, &Operand::Switch(vec![0, 0, 0])), 17);
        assert_eq!(
            instruction_size::<i32>(OpCode::CALL, &Operand::Token(Token::new(0x0A00_0001))),
            5
        );
    }

    #[test]
    fn encodes_what_the_decoder_reads() {
        let mut code = Vec::new();
        encode_instruction(&mut code, OpCode::LDARG_S, &Operand::Immediate(Immediate::UInt8(5)))
            .unwrap();
        encode_instruction(&mut code, OpCode::BRFALSE_S, &Operand::Target(1)).unwrap();
        encode_instruction(&mut code, OpCode::NOP, &Operand::None).unwrap();
        encode_instruction(&mut code, OpCode::CEQ, &Operand::None).unwrap();
        encode_instruction(&mut code, OpCode::RET, &Operand::None).unwrap();

        assert_eq!(code, [0x0E, 0x05, 0x2C, 0x01, 0x00, 0xFE, 0x01, 0x2A]);

        let decoded = decode_stream(&code).unwrap();
        assert_eq!(decoded[1].operand, Operand::Target(5));
    }

    #[test]
    fn rejects_out_of_range() {
        let mut code = Vec::new();
        assert!(encode_instruction(&mut code, OpCode::BR_S, &Operand::Target(200)).is_err());
        assert!(encode_instruction(
            &mut code,
            OpCode::LDC_I4_S,
            &Operand::Immediate(Immediate::Int32(1000))
        )
        .is_err());
        assert!(encode_instruction(&mut code, OpCode::CALL, &Operand::None).is_err());
    }
}
