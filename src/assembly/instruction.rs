//! Instructions as held by the [`crate::assembly::InstructionEditor`].
//!
//! An [`Instruction`] is an opcode plus an [`Operand`]. Branch operands do not carry byte
//! displacements: they name another instruction of the same editor through an [`InstrId`], and
//! only become displacements when the stream is finalized. The decoder uses the same operand
//! type with absolute byte offsets in place of ids.

use std::fmt;

use crate::{
    assembly::opcodes::{OpCode, OperandType},
    metadata::token::Token,
    Error::InvalidOperand,
    Result,
};

/// Identity of an instruction inside one editor's arena.
///
/// Ids stay stable across inserts and removals, so they can be used as branch targets before the
/// target has a position in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrId(pub(crate) u32);

impl InstrId {
    /// Arena index
    #[must_use]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An inline numeric operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit
    Int8(i8),
    /// Unsigned 8-bit
    UInt8(u8),
    /// Unsigned 16-bit
    UInt16(u16),
    /// Signed 32-bit
    Int32(i32),
    /// Signed 64-bit
    Int64(i64),
    /// 32-bit float
    Float32(f32),
    /// 64-bit float
    Float64(f64),
}

impl Immediate {
    /// The integer value, `None` for floats
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Immediate::Int8(value) => Some(i64::from(value)),
            Immediate::UInt8(value) => Some(i64::from(value)),
            Immediate::UInt16(value) => Some(i64::from(value)),
            Immediate::Int32(value) => Some(i64::from(value)),
            Immediate::Int64(value) => Some(value),
            Immediate::Float32(_) | Immediate::Float64(_) => None,
        }
    }
}

impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Float32(value) => write!(f, "{value}"),
            Immediate::Float64(value) => write!(f, "{value}"),
            other => write!(f, "{}", other.as_i64().unwrap_or_default()),
        }
    }
}

/// The operand of an instruction. `T` is the branch target representation: [`InstrId`] inside
/// the editor, absolute byte offsets in decoded streams.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand<T = InstrId> {
    /// No operand
    None,
    /// Numeric literal, argument or local index
    Immediate(Immediate),
    /// Metadata token or `#US` offset
    Token(Token),
    /// Branch target
    Target(T),
    /// Switch targets
    Switch(Vec<T>),
}

impl<T> Operand<T> {
    /// Branch targets referenced by this operand
    pub fn targets(&self) -> &[T] {
        match self {
            Operand::Target(target) => std::slice::from_ref(target),
            Operand::Switch(targets) => targets,
            _ => &[],
        }
    }

    /// Rewrite the branch targets
    pub fn map_targets<U>(self, mut f: impl FnMut(T) -> Result<U>) -> Result<Operand<U>> {
        Ok(match self {
            Operand::None => Operand::None,
            Operand::Immediate(value) => Operand::Immediate(value),
            Operand::Token(token) => Operand::Token(token),
            Operand::Target(target) => Operand::Target(f(target)?),
            Operand::Switch(targets) => {
                Operand::Switch(targets.into_iter().map(f).collect::<Result<Vec<_>>>()?)
            }
        })
    }
}

/// One instruction of an editable stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// The opcode
    pub opcode: OpCode,
    /// The operand
    pub operand: Operand,
}

impl Instruction {
    /// An instruction with an explicit operand. The pairing is validated during finalize.
    #[must_use]
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        Instruction { opcode, operand }
    }

    /// An instruction without an operand, e.g. `ret` or `ceq`
    #[must_use]
    pub fn simple(opcode: OpCode) -> Self {
        Instruction::new(opcode, Operand::None)
    }

    /// A token instruction, e.g. `call`, `ldfld` or `ldstr`
    #[must_use]
    pub fn token(opcode: OpCode, token: Token) -> Self {
        Instruction::new(opcode, Operand::Token(token))
    }

    /// A branch to `target`. The short or long form is chosen during finalize.
    #[must_use]
    pub fn branch(opcode: OpCode, target: InstrId) -> Self {
        Instruction::new(opcode, Operand::Target(target))
    }

    /// A jump table
    #[must_use]
    pub fn switch(targets: Vec<InstrId>) -> Self {
        Instruction::new(OpCode::SWITCH, Operand::Switch(targets))
    }

    /// Load a 32-bit constant using the most compact encoding
    #[must_use]
    pub fn ldc_i4(value: i32) -> Self {
        match value {
            -1..=8 => {
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                let code = (0x16 + value) as u16;
                Instruction::simple(OpCode::from_u16(code))
            }
            -128..=127 => {
                #[allow(clippy::cast_possible_truncation)]
                let value = value as i8;
                Instruction::new(OpCode::LDC_I4_S, Operand::Immediate(Immediate::Int8(value)))
            }
            _ => Instruction::new(OpCode::LDC_I4, Operand::Immediate(Immediate::Int32(value))),
        }
    }

    /// Load argument `index` using the most compact encoding
    #[must_use]
    pub fn ldarg(index: u16) -> Self {
        Self::variable(index, OpCode::LDARG_0, OpCode::LDARG_S, OpCode::LDARG)
    }

    /// Load local `index` using the most compact encoding
    #[must_use]
    pub fn ldloc(index: u16) -> Self {
        Self::variable(index, OpCode::LDLOC_0, OpCode::LDLOC_S, OpCode::LDLOC)
    }

    /// Store local `index` using the most compact encoding
    #[must_use]
    pub fn stloc(index: u16) -> Self {
        Self::variable(index, OpCode::STLOC_0, OpCode::STLOC_S, OpCode::STLOC)
    }

    fn variable(index: u16, first: OpCode, short: OpCode, long: OpCode) -> Self {
        match index {
            0..=3 => Instruction::simple(OpCode::from_u16(first.raw() + index)),
            #[allow(clippy::cast_possible_truncation)]
            4..=255 => Instruction::new(short, Operand::Immediate(Immediate::UInt8(index as u8))),
            _ => Instruction::new(long, Operand::Immediate(Immediate::UInt16(index))),
        }
    }

    /// The mnemonic of the opcode
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        self.opcode.mnemonic()
    }

    /// Branch targets of this instruction
    #[must_use]
    pub fn targets(&self) -> &[InstrId] {
        self.operand.targets()
    }

    /// True if the instruction carries an operand whose shape matches the opcode
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.check_operand().is_ok()
    }

    /// Verify that the operand fits the opcode's operand encoding.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidOperand`] describing the mismatch.
    pub fn check_operand(&self) -> Result<()> {
        let mnemonic = self.opcode.mnemonic();
        let mismatch = |detail: String| InvalidOperand { mnemonic, detail };

        match (self.opcode.operand_type(), &self.operand) {
            (OperandType::None, Operand::None)
            | (OperandType::Token, Operand::Token(_))
            | (OperandType::Switch, Operand::Switch(_)) => Ok(()),
            (OperandType::Int8 | OperandType::Int32, Operand::Target(_))
                if self.opcode.is_branch() =>
            {
                Ok(())
            }
            (op_type, Operand::Immediate(value)) if !self.opcode.is_branch() => {
                let fits = match (op_type, value.as_i64()) {
                    (OperandType::Int8, Some(v)) => i8::try_from(v).is_ok(),
                    (OperandType::UInt8, Some(v)) => u8::try_from(v).is_ok(),
                    (OperandType::UInt16, Some(v)) => u16::try_from(v).is_ok(),
                    (OperandType::Int32, Some(v)) => i32::try_from(v).is_ok(),
                    (OperandType::Int64, Some(_)) => true,
                    (OperandType::Float32, None) => matches!(value, Immediate::Float32(_)),
                    (OperandType::Float64, None) => true,
                    _ => false,
                };
                if fits {
                    Ok(())
                } else {
                    Err(mismatch(format!("{value} does not fit {op_type:?}")))
                }
            }
            (op_type, operand) => Err(mismatch(format!(
                "expected {op_type:?}, found {}",
                operand_kind(operand)
            ))),
        }
    }
}

fn operand_kind<T>(operand: &Operand<T>) -> &'static str {
    match operand {
        Operand::None => "no operand",
        Operand::Immediate(_) => "an immediate",
        Operand::Token(_) => "a token",
        Operand::Target(_) => "a branch target",
        Operand::Switch(_) => "a switch table",
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Immediate(value) => write!(f, " {value}"),
            Operand::Token(token) => write!(f, " {token}"),
            Operand::Target(target) => write!(f, " {target}"),
            Operand::Switch(targets) => {
                f.write_str(" (")?;
                for (position, target) in targets.iter().enumerate() {
                    if position > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{target}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_constants() {
        assert_eq!(Instruction::ldc_i4(-1).opcode, OpCode::LDC_I4_M1);
        assert_eq!(Instruction::ldc_i4(8).mnemonic(), "ldc.i4.8");
        assert_eq!(
            Instruction::ldc_i4(100),
            Instruction::new(OpCode::LDC_I4_S, Operand::Immediate(Immediate::Int8(100)))
        );
        assert_eq!(Instruction::ldc_i4(1000).opcode, OpCode::LDC_I4);
    }

    #[test]
    fn compact_variables() {
        assert_eq!(Instruction::ldarg(2).opcode, OpCode::LDARG_2);
        assert_eq!(Instruction::ldarg(4).opcode, OpCode::LDARG_S);
        assert_eq!(Instruction::ldarg(300).opcode, OpCode::LDARG);
        assert_eq!(Instruction::ldloc(3).mnemonic(), "ldloc.3");
        assert_eq!(Instruction::stloc(0).mnemonic(), "stloc.0");
        assert_eq!(Instruction::stloc(7).mnemonic(), "stloc.s");
    }

    #[test]
    fn operand_validation() {
        assert!(Instruction::simple(OpCode::RET).is_well_formed());
        assert!(Instruction::branch(OpCode::BRTRUE, InstrId(0)).is_well_formed());
        assert!(Instruction::ldc_i4(1000).is_well_formed());

        let wrong = Instruction::new(OpCode::CALL, Operand::None);
        assert!(matches!(
            wrong.check_operand(),
            Err(InvalidOperand { mnemonic: "call", .. })
        ));

        let overflow =
            Instruction::new(OpCode::LDC_I4_S, Operand::Immediate(Immediate::Int32(300)));
        assert!(overflow.check_operand().is_err());

        let immediate_branch =
            Instruction::new(OpCode::BR, Operand::Immediate(Immediate::Int32(4)));
        assert!(immediate_branch.check_operand().is_err());
    }

    #[test]
    fn display() {
        let instruction = Instruction::token(OpCode::CALL, Token::new(0x0A00_0001));
        assert_eq!(instruction.to_string(), "call 0x0a000001");
        assert_eq!(
            Instruction::switch(vec![InstrId(1), InstrId(4)]).to_string(),
            "switch (#1, #4)"
        );
    }
}
