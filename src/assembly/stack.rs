//! Evaluation stack depth analysis.
//!
//! The maximum depth is computed by data-flow over every reachable path, starting at the method
//! entry and at each exception handler. Call sites take their effect from the callee signature,
//! which is looked up through [`CallSiteInfo`].

use crate::{
    assembly::{
        instruction::Operand,
        opcodes::{FlowType, OpCode},
    },
    metadata::{signatures::MethodSignature, token::Token},
    Error::{IncompleteBody, InvalidStack},
    Result,
};

/// Signature lookup for the operands of `call`, `callvirt`, `newobj` and `calli`.
///
/// `call`, `callvirt` and `newobj` pass a `MethodDef`, `MemberRef` or `MethodSpec` token,
/// `calli` a `StandAloneSig` token.
pub trait CallSiteInfo {
    /// The signature of the call site target named by `token`.
    ///
    /// # Errors
    /// Returns an error if `token` does not resolve to a method signature.
    fn call_signature(&self, token: Token) -> Result<MethodSignature>;
}

impl<F> CallSiteInfo for F
where
    F: Fn(Token) -> Result<MethodSignature>,
{
    fn call_signature(&self, token: Token) -> Result<MethodSignature> {
        self(token)
    }
}

/// Number of values popped and pushed by one instruction.
///
/// # Errors
/// Returns an error if a call site signature cannot be resolved.
#[allow(clippy::cast_possible_truncation)]
pub fn stack_effect<T>(
    opcode: OpCode,
    operand: &Operand<T>,
    returns_value: bool,
    calls: &dyn CallSiteInfo,
) -> Result<(u32, u32)> {
    let info = opcode.info();
    if opcode == OpCode::RET {
        return Ok((u32::from(returns_value), 0));
    }
    if info.flow != FlowType::Call {
        return Ok((u32::from(info.stack_pops), u32::from(info.stack_pushes)));
    }

    let Operand::Token(token) = operand else {
        return Ok((0, 0));
    };

    let signature = calls.call_signature(*token)?;
    let pushes = signature.stack_pushes() as u32;
    let pops = signature.stack_pops() as u32;
    Ok(match opcode {
        OpCode::NEWOBJ => (pops - u32::from(signature.has_this && !signature.explicit_this), 1),
        OpCode::CALLI => (pops + 1, pushes),
        _ => (pops, pushes),
    })
}

/// Compute the maximum stack depth of a resolved stream, whose branch operands hold positions.
///
/// `entries` lists additional entry points and their initial depth, i.e. exception handler and
/// filter starts.
///
/// # Errors
/// Returns [`crate::Error::InvalidStack`] on underflow or when two paths reach an instruction
/// with different depths, and [`crate::Error::IncompleteBody`] when control falls through past
/// the last instruction.
pub fn compute_max_stack(
    method: &str,
    stream: &[(OpCode, Operand<usize>)],
    entries: &[(usize, u32)],
    returns_value: bool,
    calls: &dyn CallSiteInfo,
) -> Result<u16> {
    if stream.is_empty() {
        return Err(IncompleteBody {
            method: method.to_string(),
            detail: "the instruction stream is empty".to_string(),
        });
    }

    let mut depths: Vec<Option<u32>> = vec![None; stream.len()];
    let mut worklist = Vec::new();
    let mut max_depth = 0u32;

    for &(position, depth) in std::iter::once(&(0, 0)).chain(entries) {
        merge(method, &mut depths, &mut worklist, position, depth)?;
        max_depth = max_depth.max(depth);
    }

    while let Some(position) = worklist.pop() {
        let depth = depths[position].unwrap_or_default();
        let (opcode, operand) = &stream[position];
        let (pops, pushes) = stack_effect(*opcode, operand, returns_value, calls)?;
        if depth < pops {
            return Err(InvalidStack {
                method: method.to_string(),
                detail: format!(
                    "'{}' at position {} pops {} with a depth of {}",
                    opcode, position, pops, depth
                ),
            });
        }

        let after = depth - pops + pushes;
        max_depth = max_depth.max(after);

        let falls_through = match opcode.flow() {
            FlowType::Sequential | FlowType::Call => true,
            FlowType::ConditionalBranch | FlowType::Switch => {
                for target in operand.targets() {
                    merge(method, &mut depths, &mut worklist, *target, after)?;
                }
                true
            }
            FlowType::UnconditionalBranch => {
                for target in operand.targets() {
                    merge(method, &mut depths, &mut worklist, *target, after)?;
                }
                false
            }
            FlowType::Leave => {
                for target in operand.targets() {
                    merge(method, &mut depths, &mut worklist, *target, 0)?;
                }
                false
            }
            FlowType::Return | FlowType::Throw | FlowType::EndFinally => false,
        };

        if falls_through {
            if position + 1 >= stream.len() {
                return Err(IncompleteBody {
                    method: method.to_string(),
                    detail: format!("'{}' falls through past the last instruction", opcode),
                });
            }
            merge(method, &mut depths, &mut worklist, position + 1, after)?;
        }
    }

    u16::try_from(max_depth).map_err(|_| InvalidStack {
        method: method.to_string(),
        detail: format!("depth {max_depth} exceeds the encodable maximum"),
    })
}

fn merge(
    method: &str,
    depths: &mut [Option<u32>],
    worklist: &mut Vec<usize>,
    position: usize,
    depth: u32,
) -> Result<()> {
    let Some(slot) = depths.get_mut(position) else {
        return Err(IncompleteBody {
            method: method.to_string(),
            detail: format!("position {position} is outside the stream"),
        });
    };

    match *slot {
        None => {
            *slot = Some(depth);
            worklist.push(position);
            Ok(())
        }
        Some(existing) if existing == depth => Ok(()),
        Some(existing) => Err(InvalidStack {
            method: method.to_string(),
            detail: format!(
                "position {} is reached with depths {} and {}",
                position, existing, depth
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::signatures::TypeSig;

    fn no_calls(token: Token) -> Result<MethodSignature> {
        Err(crate::Error::InvalidToken(token))
    }

    fn calls(token: Token) -> Result<MethodSignature> {
        match token.value() {
            // void (object, object)
            0x0A00_0001 => Ok(MethodSignature::new_static(
                TypeSig::Void,
                vec![TypeSig::Object, TypeSig::Object],
            )),
            // instance void .ctor(string)
            0x0A00_0002 => Ok(MethodSignature::new_instance(
                TypeSig::Void,
                vec![TypeSig::String],
            )),
            // instance int32 (int32)
            0x0A00_0003 => Ok(MethodSignature::new_instance(TypeSig::I4, vec![TypeSig::I4])),
            _ => Err(crate::Error::InvalidToken(token)),
        }
    }

    fn simple(opcode: OpCode) -> (OpCode, Operand<usize>) {
        (opcode, Operand::None)
    }

    #[test]
    fn straight_line() {
        let stream = vec![
            simple(OpCode::LDARG_0),
            simple(OpCode::LDARG_1),
            (OpCode::CALL, Operand::Token(Token::new(0x0A00_0001))),
            simple(OpCode::RET),
        ];
        assert_eq!(compute_max_stack("M", &stream, &[], false, &calls).unwrap(), 2);
    }

    #[test]
    fn call_effects() {
        let newobj = stack_effect::<usize>(
            OpCode::NEWOBJ,
            &Operand::Token(Token::new(0x0A00_0002)),
            false,
            &calls,
        )
        .unwrap();
        assert_eq!(newobj, (1, 1));

        let callvirt = stack_effect::<usize>(
            OpCode::CALLVIRT,
            &Operand::Token(Token::new(0x0A00_0003)),
            false,
            &calls,
        )
        .unwrap();
        assert_eq!(callvirt, (2, 1));

        let ret = stack_effect::<usize>(OpCode::RET, &Operand::None, true, &no_calls).unwrap();
        assert_eq!(ret, (1, 0));

        assert!(stack_effect::<usize>(
            OpCode::CALL,
            &Operand::Token(Token::new(0x0A00_0009)),
            false,
            &calls
        )
        .is_err());
    }

    #[test]
    fn branches_merge() {
        // ldarg.0; brtrue 4; ldc.i4.0; br 5; ldc.i4.1; ret
        let stream = vec![
            simple(OpCode::LDARG_0),
            (OpCode::BRTRUE_S, Operand::Target(4)),
            simple(OpCode::LDC_I4_0),
            (OpCode::BR_S, Operand::Target(5)),
            simple(OpCode::LDC_I4_1),
            simple(OpCode::RET),
        ];
        assert_eq!(compute_max_stack("M", &stream, &[], true, &no_calls).unwrap(), 1);
    }

    #[test]
    fn inconsistent_merge() {
        // ldarg.0; brtrue 3; ldc.i4.0; ret
        let stream = vec![
            simple(OpCode::LDARG_0),
            (OpCode::BRTRUE_S, Operand::Target(3)),
            simple(OpCode::LDC_I4_0),
            simple(OpCode::RET),
        ];
        assert!(matches!(
            compute_max_stack("M", &stream, &[], false, &no_calls),
            Err(InvalidStack { .. })
        ));
    }

    #[test]
    fn underflow_and_fall_through() {
        let underflow = vec![simple(OpCode::POP), simple(OpCode::RET)];
        assert!(matches!(
            compute_max_stack("M", &underflow, &[], false, &no_calls),
            Err(InvalidStack { .. })
        ));

        let fall_through = vec![simple(OpCode::NOP)];
        assert!(matches!(
            compute_max_stack("M", &fall_through, &[], false, &no_calls),
            Err(IncompleteBody { .. })
        ));

        assert!(matches!(
            compute_max_stack("M", &[], &[], false, &no_calls),
            Err(IncompleteBody { .. })
        ));
    }

    #[test]
    fn handler_entries() {
        // try { nop; leave 4 } catch { pop; leave 4 } ret
        let stream = vec![
            simple(OpCode::NOP),
            (OpCode::LEAVE_S, Operand::Target(4)),
            simple(OpCode::POP),
            (OpCode::LEAVE_S, Operand::Target(4)),
            simple(OpCode::RET),
        ];
        assert_eq!(
            compute_max_stack("M", &stream, &[(2, 1)], false, &no_calls).unwrap(),
            1
        );
    }
}
