//! The instruction editor: a mutable view over one method's instruction stream.
//!
//! Instructions live in an arena and are addressed by [`InstrId`]. The stream is an ordered list
//! of ids, so inserting or removing instructions never changes the identity of the others, and a
//! branch may target an instruction that has been [`InstructionEditor::create`]d but not placed
//! yet. Positions and byte offsets only exist once [`InstructionEditor::finalize`] lays the
//! stream out.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotpatch::assembly::{Instruction, InstructionEditor, OpCode};
//! use dotpatch::metadata::{signatures::MethodSignature, token::Token};
//!
//! let mut editor = InstructionEditor::new("Sample::IsZero", Token::new(0x0600_0001), true);
//! let is_zero = editor.create(Instruction::ldc_i4(1));
//! editor.append(Instruction::ldarg(0));
//! editor.append(Instruction::branch(OpCode::BRFALSE, is_zero));
//! editor.append(Instruction::ldc_i4(0));
//! editor.append(Instruction::simple(OpCode::RET));
//! editor.append_existing(is_zero)?;
//! editor.append(Instruction::simple(OpCode::RET));
//!
//! let no_calls = |token: Token| -> dotpatch::Result<MethodSignature> {
//!     Err(dotpatch::Error::InvalidToken(token))
//! };
//! let body = editor.finalize(&no_calls)?;
//! assert_eq!(body.max_stack(), 1);
//! # Ok::<(), dotpatch::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    assembly::{
        decoder::decode_stream,
        encoder::{encode_instruction, instruction_size},
        instruction::{Instruction, InstrId, Operand},
        opcodes::OpCode,
        stack::{compute_max_stack, CallSiteInfo},
    },
    metadata::{
        method::{encode_method_body, ExceptionHandler, ExceptionHandlerFlags, MethodBody},
        token::Token,
    },
    Error::{
        AnchorInvalidated, AnchorMismatch, AnchorNotFound, DanglingBranchTarget, IncompleteBody,
        IndexOutOfRange, NotSupported,
    },
    Result,
};

/// A location inside the original body of a method, addressed by IL byte offset.
///
/// Anchors are only meaningful while the body still has the layout it was loaded with. An
/// editor refuses to resolve them once an earlier committed patch rewrote the method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    /// Byte offset of the instruction in the original code
    pub offset: u32,
    /// Opcode the instruction is expected to have
    pub opcode: Option<OpCode>,
}

impl Anchor {
    /// An anchor at `offset` that accepts any instruction
    #[must_use]
    pub fn at(offset: u32) -> Self {
        Anchor {
            offset,
            opcode: None,
        }
    }

    /// An anchor at `offset` that must hold `opcode`. Short and long branch forms are
    /// considered equal.
    #[must_use]
    pub fn expecting(offset: u32, opcode: OpCode) -> Self {
        Anchor {
            offset,
            opcode: Some(opcode),
        }
    }
}

/// Where an exception region stops.
///
/// A region that closes the loaded code is bound to its last instruction, so code appended
/// later stays outside of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionEnd {
    /// The region stops right before this instruction
    Before(InstrId),
    /// The region stops right after this instruction
    After(InstrId),
}

/// An exception handling clause whose boundaries are instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRegion {
    /// Clause kind
    pub flags: ExceptionHandlerFlags,
    /// First instruction of the protected block
    pub try_start: InstrId,
    /// End of the protected block
    pub try_end: RegionEnd,
    /// First instruction of the handler
    pub handler_start: InstrId,
    /// End of the handler
    pub handler_end: RegionEnd,
    /// First instruction of the filter, for filter clauses
    pub filter_start: Option<InstrId>,
    /// Catch type token, for typed clauses
    pub class_token: u32,
}

struct Slot {
    instruction: Instruction,
    original_offset: Option<u32>,
    placed: bool,
}

/// A method body that went through [`InstructionEditor::finalize`].
///
/// This is the only form in which a body can be committed to a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedBody {
    method: Token,
    bytes: Vec<u8>,
    code: Vec<u8>,
    max_stack: u16,
    instruction_count: usize,
}

impl FinalizedBody {
    /// The method this body belongs to
    #[must_use]
    pub fn method(&self) -> Token {
        self.method
    }

    /// The encoded body: header, code and exception sections
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The IL code without header
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// The computed maximum stack depth
    #[must_use]
    pub fn max_stack(&self) -> u16 {
        self.max_stack
    }

    /// Number of instructions in the stream
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }
}

/// Mutable instruction stream of one method.
pub struct InstructionEditor {
    method: String,
    token: Token,
    returns_value: bool,
    local_var_sig_token: u32,
    init_locals: bool,
    anchors_valid: bool,
    slots: Vec<Slot>,
    order: Vec<InstrId>,
    handlers: Vec<HandlerRegion>,
}

impl InstructionEditor {
    /// An editor with an empty stream, for a method that `returns_value` or not.
    #[must_use]
    pub fn new(method: impl Into<String>, token: Token, returns_value: bool) -> Self {
        InstructionEditor {
            method: method.into(),
            token,
            returns_value,
            local_var_sig_token: 0,
            init_locals: false,
            anchors_valid: true,
            slots: Vec::new(),
            order: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// An editor over an existing encoded body (header, code and sections).
    ///
    /// # Errors
    /// Returns an error if the body cannot be decoded, or a branch or exception clause does not
    /// land on an instruction boundary.
    pub fn from_body(
        method: impl Into<String>,
        token: Token,
        returns_value: bool,
        data: &[u8],
    ) -> Result<Self> {
        let body = MethodBody::from(data)?;
        let code = body.code(data)?;
        let decoded = decode_stream(code)?;

        let mut editor = InstructionEditor::new(method, token, returns_value);
        editor.local_var_sig_token = body.local_var_sig_token;
        editor.init_locals = body.is_init_local;

        #[allow(clippy::cast_possible_truncation)]
        let by_offset: HashMap<u32, InstrId> = decoded
            .iter()
            .enumerate()
            .map(|(index, instruction)| (instruction.offset, InstrId(index as u32)))
            .collect();
        let code_end = decoded.last().map_or(0, |last| last.offset + last.size);

        let id_at = |offset: u32| -> Result<InstrId> {
            by_offset.get(&offset).copied().ok_or_else(|| {
                malformed_error!("Offset IL_{:04x} is not an instruction boundary", offset)
            })
        };
        #[allow(clippy::cast_possible_truncation)]
        let last = decoded.len().checked_sub(1).map(|index| InstrId(index as u32));
        let end_at = |offset: u32| -> Result<RegionEnd> {
            match last {
                Some(last) if offset == code_end => Ok(RegionEnd::After(last)),
                _ => id_at(offset).map(RegionEnd::Before),
            }
        };

        for instruction in decoded.iter() {
            let operand = instruction.operand.clone().map_targets(&id_at)?;
            let id = editor.push_slot(Instruction::new(instruction.opcode, operand));
            editor.slots[id.index()].original_offset = Some(instruction.offset);
            editor.slots[id.index()].placed = true;
            editor.order.push(id);
        }

        for handler in &body.exception_handlers {
            editor.handlers.push(HandlerRegion {
                flags: handler.flags,
                try_start: id_at(handler.try_offset)?,
                try_end: end_at(handler.try_offset + handler.try_length)?,
                handler_start: id_at(handler.handler_offset)?,
                handler_end: end_at(handler.handler_offset + handler.handler_length)?,
                filter_start: if handler.is_filter() {
                    Some(id_at(handler.filter_offset)?)
                } else {
                    None
                },
                class_token: if handler.is_filter() {
                    0
                } else {
                    handler.filter_offset
                },
            });
        }

        Ok(editor)
    }

    /// Name of the method, as used in errors
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Token of the method
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Mark original-offset anchors as stale, because the body was already rewritten
    pub(crate) fn invalidate_anchors(&mut self) {
        self.anchors_valid = false;
    }

    /// Set the local variable signature and the `init_locals` flag of the encoded body
    pub fn set_locals(&mut self, local_var_sig_token: u32, init_locals: bool) {
        self.local_var_sig_token = local_var_sig_token;
        self.init_locals = init_locals;
    }

    fn push_slot(&mut self, instruction: Instruction) -> InstrId {
        #[allow(clippy::cast_possible_truncation)]
        let id = InstrId(self.slots.len() as u32);
        self.slots.push(Slot {
            instruction,
            original_offset: None,
            placed: false,
        });
        id
    }

    fn slot(&self, id: InstrId) -> Result<&Slot> {
        self.slots.get(id.index()).ok_or(IndexOutOfRange {
            index: id.index(),
            len: self.slots.len(),
        })
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index > self.order.len() {
            return Err(IndexOutOfRange { index, len: self.order.len() });
        }
        Ok(())
    }

    /// Number of instructions in the stream
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if the stream has no instructions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Remove every instruction and exception clause from the stream
    pub fn clear(&mut self) {
        for id in self.order.drain(..) {
            self.slots[id.index()].placed = false;
        }
        self.handlers.clear();
    }

    /// Append `instruction`, returning its id
    pub fn append(&mut self, instruction: Instruction) -> InstrId {
        let id = self.push_slot(instruction);
        self.slots[id.index()].placed = true;
        self.order.push(id);
        id
    }

    /// Insert `instruction` so that it ends up at `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::IndexOutOfRange`] if `index > len()`.
    pub fn insert_at(&mut self, index: usize, instruction: Instruction) -> Result<InstrId> {
        self.check_index(index)?;
        let id = self.push_slot(instruction);
        self.slots[id.index()].placed = true;
        self.order.insert(index, id);
        Ok(id)
    }

    /// Remove the instruction at `index` and return it. Branches that still target it are
    /// reported by [`InstructionEditor::finalize`].
    ///
    /// # Errors
    /// Returns [`crate::Error::IndexOutOfRange`] if `index >= len()`.
    pub fn remove_at(&mut self, index: usize) -> Result<Instruction> {
        if index >= self.order.len() {
            return Err(IndexOutOfRange {
                index,
                len: self.order.len(),
            });
        }

        let id = self.order.remove(index);
        let slot = &mut self.slots[id.index()];
        slot.placed = false;
        Ok(slot.instruction.clone())
    }

    /// Replace the instruction at `index`, keeping its id so that branches to it stay valid.
    /// Returns the previous instruction.
    ///
    /// # Errors
    /// Returns [`crate::Error::IndexOutOfRange`] if `index >= len()`.
    pub fn replace_at(&mut self, index: usize, instruction: Instruction) -> Result<Instruction> {
        let Some(id) = self.order.get(index).copied() else {
            return Err(IndexOutOfRange {
                index,
                len: self.order.len(),
            });
        };

        Ok(std::mem::replace(
            &mut self.slots[id.index()].instruction,
            instruction,
        ))
    }

    /// Create an instruction without placing it, e.g. a label for a forward branch
    pub fn create(&mut self, instruction: Instruction) -> InstrId {
        self.push_slot(instruction)
    }

    /// Append a created instruction.
    ///
    /// # Errors
    /// Returns an error if `id` is unknown or already placed.
    pub fn append_existing(&mut self, id: InstrId) -> Result<()> {
        self.insert_existing(self.order.len(), id)
    }

    /// Insert a created instruction so that it ends up at `index`.
    ///
    /// # Errors
    /// Returns an error if `index > len()`, or `id` is unknown or already placed.
    pub fn insert_existing(&mut self, index: usize, id: InstrId) -> Result<()> {
        self.check_index(index)?;
        if self.slot(id)?.placed {
            return Err(NotSupported(format!(
                "instruction {id} is already placed in {}",
                self.method
            )));
        }

        self.slots[id.index()].placed = true;
        self.order.insert(index, id);
        Ok(())
    }

    /// Point every branch that targets `from` at `to` instead. Returns the number of rewritten
    /// branch operands.
    pub fn redirect_branches(&mut self, from: InstrId, to: InstrId) -> usize {
        let mut count = 0;
        for slot in &mut self.slots {
            match &mut slot.instruction.operand {
                Operand::Target(target) if *target == from => {
                    *target = to;
                    count += 1;
                }
                Operand::Switch(targets) => {
                    for target in targets.iter_mut().filter(|target| **target == from) {
                        *target = to;
                        count += 1;
                    }
                }
                _ => {}
            }
        }
        count
    }

    /// Current position of `id` in the stream
    #[must_use]
    pub fn position(&self, id: InstrId) -> Option<usize> {
        self.order.iter().position(|candidate| *candidate == id)
    }

    /// The instruction with `id`, placed or not
    #[must_use]
    pub fn get(&self, id: InstrId) -> Option<&Instruction> {
        self.slots.get(id.index()).map(|slot| &slot.instruction)
    }

    /// Id of the instruction at `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::IndexOutOfRange`] if `index >= len()`.
    pub fn id_at(&self, index: usize) -> Result<InstrId> {
        self.order.get(index).copied().ok_or(IndexOutOfRange {
            index,
            len: self.order.len(),
        })
    }

    /// The stream in order
    pub fn iter(&self) -> impl Iterator<Item = (InstrId, &Instruction)> + '_ {
        self.order
            .iter()
            .map(|id| (*id, &self.slots[id.index()].instruction))
    }

    /// Exception clauses of the stream
    #[must_use]
    pub fn handlers(&self) -> &[HandlerRegion] {
        &self.handlers
    }

    /// Add an exception clause
    pub fn add_handler(&mut self, region: HandlerRegion) {
        self.handlers.push(region);
    }

    /// Find the placed instruction that was loaded from `anchor.offset` of the original body.
    ///
    /// # Errors
    /// - [`crate::Error::AnchorInvalidated`] if the method was rewritten by an earlier commit
    /// - [`crate::Error::AnchorNotFound`] if no placed instruction started at the offset
    /// - [`crate::Error::AnchorMismatch`] if the instruction has a different opcode
    pub fn locate(&self, anchor: &Anchor) -> Result<InstrId> {
        if !self.anchors_valid {
            return Err(AnchorInvalidated(self.method.clone()));
        }

        let Some(id) = self.order.iter().copied().find(|id| {
            self.slots[id.index()].original_offset == Some(anchor.offset)
        }) else {
            return Err(AnchorNotFound {
                method: self.method.clone(),
                offset: anchor.offset,
            });
        };

        if let Some(expected) = anchor.opcode {
            let found = self.slots[id.index()].instruction.opcode;
            if found.short_form() != expected.short_form() {
                return Err(AnchorMismatch {
                    method: self.method.clone(),
                    offset: anchor.offset,
                    expected: expected.mnemonic(),
                    found: found.mnemonic(),
                });
            }
        }

        Ok(id)
    }

    /// Lay out the stream and encode the method body.
    ///
    /// Branches get the shortest encoding that reaches their target, the maximum stack depth is
    /// recomputed over all paths, and exception clauses are re-encoded from their boundary
    /// instructions.
    ///
    /// # Errors
    /// - [`crate::Error::DanglingBranchTarget`] if a branch or clause refers to an instruction
    ///   that is not in the stream
    /// - [`crate::Error::IncompleteBody`] for an empty stream or a fall-through past the end
    /// - [`crate::Error::InvalidStack`] for an underflow or inconsistent depths
    /// - [`crate::Error::InvalidOperand`] if an operand does not fit its opcode
    pub fn finalize(&self, calls: &dyn CallSiteInfo) -> Result<FinalizedBody> {
        if self.order.is_empty() {
            return Err(IncompleteBody {
                method: self.method.clone(),
                detail: "the instruction stream is empty".to_string(),
            });
        }

        let mut positions = vec![None; self.slots.len()];
        for (position, id) in self.order.iter().enumerate() {
            positions[id.index()] = Some(position);
        }
        let resolve = |id: InstrId, user: &str| -> Result<usize> {
            positions.get(id.index()).copied().flatten().ok_or_else(|| DanglingBranchTarget {
                method: self.method.clone(),
                detail: format!("{user} targets {id}, which is not in the stream"),
            })
        };

        let mut stream = Vec::with_capacity(self.order.len());
        for (position, (_, instruction)) in self.iter().enumerate() {
            instruction.check_operand()?;
            let user = format!("'{}' at position {}", instruction.mnemonic(), position);
            let operand = instruction
                .operand
                .clone()
                .map_targets(|target| resolve(target, &user))?;
            stream.push((instruction.opcode.short_form(), operand));
        }

        let len = stream.len();
        let resolve_end = |end: RegionEnd, user: &str| -> Result<usize> {
            match end {
                RegionEnd::Before(id) => resolve(id, user),
                RegionEnd::After(id) => resolve(id, user).map(|position| position + 1),
            }
        };
        let mut regions = Vec::with_capacity(self.handlers.len());
        let mut entries = Vec::with_capacity(self.handlers.len());
        for (index, handler) in self.handlers.iter().enumerate() {
            let user = format!("exception clause {index}");
            let try_start = resolve(handler.try_start, &user)?;
            let try_end = resolve_end(handler.try_end, &user)?;
            let handler_start = resolve(handler.handler_start, &user)?;
            let handler_end = resolve_end(handler.handler_end, &user)?;
            let filter_start = handler
                .filter_start
                .map(|id| resolve(id, &user))
                .transpose()?;
            if try_end <= try_start || handler_end <= handler_start {
                return Err(IncompleteBody {
                    method: self.method.clone(),
                    detail: format!("{user} has an empty region"),
                });
            }

            let exception_depth = u32::from(!handler.flags.intersects(
                ExceptionHandlerFlags::FINALLY | ExceptionHandlerFlags::FAULT,
            ));
            entries.push((handler_start, exception_depth));
            if let Some(filter_start) = filter_start {
                entries.push((filter_start, 1));
            }
            regions.push((try_start, try_end, handler_start, handler_end, filter_start));
        }

        let max_stack = compute_max_stack(
            &self.method,
            &stream,
            &entries,
            self.returns_value,
            calls,
        )?;

        let offsets = layout(&mut stream);
        let mut code = Vec::with_capacity(offsets[len]);
        for (position, (opcode, operand)) in stream.iter().enumerate() {
            let next = offsets[position + 1];
            #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
            let operand = operand
                .clone()
                .map_targets(|target| Ok(offsets[target] as i32 - next as i32))?;
            encode_instruction(&mut code, *opcode, &operand)?;
        }

        #[allow(clippy::cast_possible_truncation)]
        let offset = |position: usize| offsets[position] as u32;
        let handlers: Vec<ExceptionHandler> = self
            .handlers
            .iter()
            .zip(&regions)
            .map(
                |(handler, &(try_start, try_end, handler_start, handler_end, filter_start))| {
                    ExceptionHandler {
                        flags: handler.flags,
                        try_offset: offset(try_start),
                        try_length: offset(try_end) - offset(try_start),
                        handler_offset: offset(handler_start),
                        handler_length: offset(handler_end) - offset(handler_start),
                        filter_offset: filter_start.map_or(handler.class_token, offset),
                    }
                },
            )
            .collect();

        let bytes = encode_method_body(
            &code,
            max_stack,
            self.local_var_sig_token,
            self.init_locals,
            &handlers,
        )?;

        Ok(FinalizedBody {
            method: self.token,
            bytes,
            code,
            max_stack,
            instruction_count: len,
        })
    }
}

/// Choose branch widths and return the offset of every position, plus the end offset.
///
/// All branches start in their short form and are widened until every displacement fits. A
/// widening only ever moves code apart, so the loop reaches a fix-point.
fn layout(stream: &mut [(OpCode, Operand<usize>)]) -> Vec<usize> {
    loop {
        let mut offsets = Vec::with_capacity(stream.len() + 1);
        let mut offset = 0;
        for (opcode, operand) in stream.iter() {
            offsets.push(offset);
            offset += instruction_size(*opcode, operand);
        }
        offsets.push(offset);

        let mut widened = false;
        for (position, (opcode, operand)) in stream.iter_mut().enumerate() {
            if !opcode.is_short_branch() {
                continue;
            }

            let Operand::Target(target) = operand else {
                continue;
            };

            #[allow(clippy::cast_possible_wrap)]
            let displacement = offsets[*target] as i64 - offsets[position + 1] as i64;
            if i8::try_from(displacement).is_err() {
                *opcode = opcode.long_form();
                widened = true;
            }
        }

        if !widened {
            return offsets;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{decoder::decode_stream, instruction::Immediate},
        metadata::signatures::{MethodSignature, TypeSig},
        Error,
    };

    fn no_calls(token: Token) -> Result<MethodSignature> {
        Err(Error::InvalidToken(token))
    }

    fn log_call(token: Token) -> Result<MethodSignature> {
        match token.value() {
            0x0A00_0001 => Ok(MethodSignature::new_static(
                TypeSig::Void,
                vec![TypeSig::Object],
            )),
            _ => Err(Error::InvalidToken(token)),
        }
    }

    fn empty_editor() -> InstructionEditor {
        InstructionEditor::new("Test::Method", Token::new(0x0600_0001), false)
    }

    // ldarg.0; brfalse.s IL_0004; nop; ret
    #[rustfmt::skip]
    const BODY: [u8; 6] = [
        0x16,
        0x02,
        0x2C, 0x01,
        0x00,
        0x2A,
    ];

    #[test]
    fn decode_existing_body() {
        let editor = InstructionEditor::from_body("Test::M", Token::new(0x0600_0001), false, &BODY)
            .unwrap();
        assert_eq!(editor.len(), 4);

        let branch = editor.id_at(1).unwrap();
        let ret = editor.id_at(3).unwrap();
        assert_eq!(editor.get(branch).unwrap().targets(), &[ret]);
        assert_eq!(editor.locate(&Anchor::at(3)).unwrap(), editor.id_at(2).unwrap());
        assert_eq!(
            editor
                .locate(&Anchor::expecting(1, OpCode::BRFALSE))
                .unwrap(),
            branch
        );
    }

    #[test]
    fn anchors() {
        let mut editor =
            InstructionEditor::from_body("Test::M", Token::new(0x0600_0001), false, &BODY).unwrap();

        assert!(matches!(
            editor.locate(&Anchor::at(2)),
            Err(AnchorNotFound { offset: 2, .. })
        ));
        assert!(matches!(
            editor.locate(&Anchor::expecting(3, OpCode::RET)),
            Err(AnchorMismatch {
                expected: "ret",
                found: "nop",
                ..
            })
        ));

        editor.remove_at(2).unwrap();
        assert!(matches!(editor.locate(&Anchor::at(3)), Err(AnchorNotFound { .. })));
        assert!(editor.locate(&Anchor::expecting(4, OpCode::RET)).is_ok());

        editor.invalidate_anchors();
        assert!(matches!(
            editor.locate(&Anchor::at(0)),
            Err(AnchorInvalidated(_))
        ));
    }

    #[test]
    fn roundtrip_unchanged_body() {
        let editor =
            InstructionEditor::from_body("Test::M", Token::new(0x0600_0001), false, &BODY).unwrap();
        let body = editor.finalize(&no_calls).unwrap();
        assert_eq!(body.bytes(), BODY);
        assert_eq!(body.max_stack(), 1);
        assert_eq!(body.instruction_count(), 4);
    }

    #[test]
    fn forward_labels() {
        let mut editor = empty_editor();
        let end = editor.create(Instruction::simple(OpCode::RET));
        editor.append(Instruction::ldarg(0));
        editor.append(Instruction::branch(OpCode::BRFALSE, end));
        editor.append(Instruction::ldarg(0));
        editor.append(Instruction::token(OpCode::CALL, Token::new(0x0A00_0001)));
        editor.append_existing(end).unwrap();

        assert_eq!(editor.position(end), Some(4));
        let body = editor.finalize(&log_call).unwrap();
        assert_eq!(
            body.code(),
            [0x02, 0x2C, 0x06, 0x02, 0x28, 0x01, 0x00, 0x00, 0x0A, 0x2A]
        );
    }

    #[test]
    fn long_branches_when_needed() {
        let mut editor = empty_editor();
        let end = editor.create(Instruction::simple(OpCode::RET));
        editor.append(Instruction::branch(OpCode::BR_S, end));
        for _ in 0..200 {
            editor.append(Instruction::simple(OpCode::NOP));
        }
        editor.append_existing(end).unwrap();

        let body = editor.finalize(&no_calls).unwrap();
        let decoded = decode_stream(body.code()).unwrap();
        assert_eq!(decoded[0].opcode, OpCode::BR);
        assert_eq!(decoded[0].operand, Operand::Target(205));
        assert_eq!(body.code().len(), 206);
    }

    #[test]
    fn dangling_target() {
        let mut editor =
            InstructionEditor::from_body("Test::M", Token::new(0x0600_0001), false, &BODY).unwrap();
        editor.remove_at(3).unwrap();
        editor.append(Instruction::simple(OpCode::RET));
        assert!(matches!(
            editor.finalize(&no_calls),
            Err(DanglingBranchTarget { .. })
        ));

        let mut editor = empty_editor();
        let label = editor.create(Instruction::simple(OpCode::RET));
        editor.append(Instruction::branch(OpCode::BR, label));
        assert!(matches!(
            editor.finalize(&no_calls),
            Err(DanglingBranchTarget { .. })
        ));
    }

    #[test]
    fn redirect_then_remove() {
        let mut editor =
            InstructionEditor::from_body("Test::M", Token::new(0x0600_0001), false, &BODY).unwrap();
        let nop = editor.id_at(2).unwrap();
        let old_ret = editor.id_at(3).unwrap();
        assert_eq!(editor.redirect_branches(old_ret, nop), 1);
        editor.remove_at(3).unwrap();
        editor.replace_at(2, Instruction::simple(OpCode::RET)).unwrap();

        let body = editor.finalize(&no_calls).unwrap();
        assert_eq!(body.code(), [0x02, 0x2C, 0x00, 0x2A]);
    }

    #[test]
    fn index_validation() {
        let mut editor = empty_editor();
        assert!(matches!(
            editor.insert_at(1, Instruction::simple(OpCode::NOP)),
            Err(IndexOutOfRange { index: 1, len: 0 })
        ));
        assert!(matches!(
            editor.remove_at(0),
            Err(IndexOutOfRange { index: 0, len: 0 })
        ));
        assert!(editor.replace_at(0, Instruction::simple(OpCode::NOP)).is_err());

        let id = editor.append(Instruction::simple(OpCode::RET));
        assert!(editor.append_existing(id).is_err());
        assert!(editor.append_existing(InstrId(42)).is_err());
        assert_eq!(
            editor.insert_at(0, Instruction::simple(OpCode::NOP)).unwrap(),
            InstrId(1)
        );
        assert_eq!(editor.position(id), Some(1));
    }

    #[test]
    fn clear_and_empty() {
        let mut editor =
            InstructionEditor::from_body("Test::M", Token::new(0x0600_0001), false, &BODY).unwrap();
        editor.clear();
        assert!(editor.is_empty());
        assert!(matches!(
            editor.finalize(&no_calls),
            Err(IncompleteBody { .. })
        ));
    }

    #[test]
    fn switch_and_operands() {
        let mut editor = empty_editor();
        let first = editor.create(Instruction::simple(OpCode::RET));
        let second = editor.create(Instruction::simple(OpCode::RET));
        editor.append(Instruction::ldarg(0));
        editor.append(Instruction::switch(vec![first, second]));
        editor.append(Instruction::simple(OpCode::RET));
        editor.append_existing(first).unwrap();
        editor.append_existing(second).unwrap();

        let body = editor.finalize(&no_calls).unwrap();
        let decoded = decode_stream(body.code()).unwrap();
        assert_eq!(decoded[1].operand, Operand::Switch(vec![15, 16]));

        let mut editor = empty_editor();
        editor.append(Instruction::new(
            OpCode::LDC_I4_S,
            Operand::Immediate(Immediate::Int32(1000)),
        ));
        editor.append(Instruction::simple(OpCode::POP));
        editor.append(Instruction::simple(OpCode::RET));
        assert!(matches!(
            editor.finalize(&no_calls),
            Err(Error::InvalidOperand { .. })
        ));
    }

    #[test]
    fn exception_regions() {
        // try { nop; leave.s end } catch [0x01000001] { pop; leave.s end } end: ret
        #[rustfmt::skip]
        let body = [
            0x1B, 0x30, 0x01, 0x00,
            0x07, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x00,
            0xDE, 0x03,
            0x26,
            0xDE, 0x00,
            0x2A,
            0x00,
            0x01, 0x10, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x03, 0x03, 0x00, 0x03, 0x01, 0x00, 0x00, 0x01,
        ];

        let editor =
            InstructionEditor::from_body("Test::M", Token::new(0x0600_0001), false, &body).unwrap();
        assert_eq!(editor.handlers().len(), 1);
        assert_eq!(editor.handlers()[0].class_token, 0x0100_0001);

        let finalized = editor.finalize(&no_calls).unwrap();
        assert_eq!(finalized.max_stack(), 1);
        assert_eq!(finalized.bytes(), body);
    }

    #[test]
    fn appended_code_stays_outside_trailing_handler() {
        // try { leave.s IL_0002 } IL_0002: ret; finally { endfinally }
        #[rustfmt::skip]
        let body = [
            0x1B, 0x30, 0x01, 0x00,
            0x04, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0xDE, 0x00,
            0x2A,
            0xDC,
            0x01, 0x10, 0x00, 0x00,
            0x02, 0x00, 0x00, 0x00, 0x02, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ];

        let mut editor =
            InstructionEditor::from_body("Test::M", Token::new(0x0600_0001), false, &body).unwrap();
        let endfinally = editor.id_at(2).unwrap();
        assert_eq!(editor.handlers()[0].handler_end, RegionEnd::After(endfinally));

        editor.append(Instruction::simple(OpCode::NOP));
        editor.append(Instruction::simple(OpCode::RET));
        let finalized = editor.finalize(&no_calls).unwrap();

        let written = MethodBody::from(finalized.bytes()).unwrap();
        let clause = &written.exception_handlers[0];
        assert_eq!((clause.try_offset, clause.try_length), (0, 2));
        assert_eq!((clause.handler_offset, clause.handler_length), (3, 1));
        assert_eq!(finalized.code(), [0xDE, 0x00, 0x2A, 0xDC, 0x00, 0x2A]);
    }
}
