//! CIL instruction decoding, encoding and editing.
//!
//! # Key Components
//!
//! - [`OpCode`] and the opcode tables in [`opcodes`]
//! - [`Instruction`] / [`Operand`] with [`InstrId`] branch targets
//! - [`decode_stream`] and [`encode_instruction`] for the byte level
//! - [`InstructionEditor`], which turns an edited stream into a [`FinalizedBody`]
//! - [`CallSiteInfo`], the signature lookup used for stack depth analysis

pub mod decoder;
pub mod editor;
pub mod encoder;
pub mod instruction;
pub mod opcodes;
pub mod stack;

pub use decoder::{decode_instruction, decode_stream, DecodedInstruction};
pub use editor::{Anchor, FinalizedBody, HandlerRegion, InstructionEditor, RegionEnd};
pub use encoder::{encode_instruction, instruction_size};
pub use instruction::{Immediate, InstrId, Instruction, Operand};
pub use opcodes::{CilInstruction, FlowType, OpCode, OperandType, INSTRUCTIONS, INSTRUCTIONS_FE};
pub use stack::{compute_max_stack, stack_effect, CallSiteInfo};
