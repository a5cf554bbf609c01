//! The CIL opcode tables (ECMA-335 Partition III).
//!
//! [`INSTRUCTIONS`] covers the single byte opcodes `0x00..=0xE0`, [`INSTRUCTIONS_FE`] the
//! two byte opcodes prefixed with `0xFE`. Each entry carries the mnemonic, the operand encoding,
//! the control flow class and the fixed stack effect. Call instructions and `ret` have a
//! signature dependent effect and list `0 / 0`; see [`crate::assembly::stack`].

use std::fmt;

use crate::Result;

/// Encoding of the inline operand that follows an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand present
    None,
    /// Signed 8-bit integer (also short branch displacements)
    Int8,
    /// Unsigned 8-bit integer
    UInt8,
    /// Unsigned 16-bit integer
    UInt16,
    /// Signed 32-bit integer (also long branch displacements)
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
    /// Metadata token reference
    Token,
    /// Switch table operand
    Switch,
}

impl OperandType {
    /// Size of the operand in bytes, `None` for the variable length switch table
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8 | OperandType::UInt8 => Some(1),
            OperandType::UInt16 => Some(2),
            OperandType::Int32 | OperandType::Float32 | OperandType::Token => Some(4),
            OperandType::Int64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }
}

/// How an instruction passes control to its successors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Falls through to the next instruction
    Sequential,
    /// Branches or falls through
    ConditionalBranch,
    /// Always branches
    UnconditionalBranch,
    /// Calls a method, then falls through
    Call,
    /// Leaves the method
    Return,
    /// Jump table, falls through when no case matches
    Switch,
    /// Raises an exception
    Throw,
    /// Ends a finally, fault or filter block
    EndFinally,
    /// Leaves a protected region, emptying the stack
    Leave,
}

/// Static description of one opcode.
#[derive(Debug, Clone, Copy)]
pub struct CilInstruction {
    /// Mnemonic, empty for reserved opcodes
    pub instr: &'static str,
    /// Operand encoding
    pub op_type: OperandType,
    /// Control flow class
    pub flow: FlowType,
    /// Fixed number of values popped
    pub stack_pops: u8,
    /// Fixed number of values pushed
    pub stack_pushes: u8,
}

const fn op(
    instr: &'static str,
    op_type: OperandType,
    flow: FlowType,
    stack_pops: u8,
    stack_pushes: u8,
) -> CilInstruction {
    CilInstruction {
        instr,
        op_type,
        flow,
        stack_pops,
        stack_pushes,
    }
}

const RESERVED: CilInstruction = op("", OperandType::None, FlowType::Sequential, 0, 0);

/// Single byte opcodes
#[rustfmt::skip]
pub const INSTRUCTIONS: [CilInstruction; 225] = [
    /* 00 */ op("nop", OperandType::None, FlowType::Sequential, 0, 0),
    /* 01 */ op("break", OperandType::None, FlowType::Sequential, 0, 0),
    /* 02 */ op("ldarg.0", OperandType::None, FlowType::Sequential, 0, 1),
    /* 03 */ op("ldarg.1", OperandType::None, FlowType::Sequential, 0, 1),
    /* 04 */ op("ldarg.2", OperandType::None, FlowType::Sequential, 0, 1),
    /* 05 */ op("ldarg.3", OperandType::None, FlowType::Sequential, 0, 1),
    /* 06 */ op("ldloc.0", OperandType::None, FlowType::Sequential, 0, 1),
    /* 07 */ op("ldloc.1", OperandType::None, FlowType::Sequential, 0, 1),
    /* 08 */ op("ldloc.2", OperandType::None, FlowType::Sequential, 0, 1),
    /* 09 */ op("ldloc.3", OperandType::None, FlowType::Sequential, 0, 1),
    /* 0A */ op("stloc.0", OperandType::None, FlowType::Sequential, 1, 0),
    /* 0B */ op("stloc.1", OperandType::None, FlowType::Sequential, 1, 0),
    /* 0C */ op("stloc.2", OperandType::None, FlowType::Sequential, 1, 0),
    /* 0D */ op("stloc.3", OperandType::None, FlowType::Sequential, 1, 0),
    /* 0E */ op("ldarg.s", OperandType::UInt8, FlowType::Sequential, 0, 1),
    /* 0F */ op("ldarga.s", OperandType::UInt8, FlowType::Sequential, 0, 1),
    /* 10 */ op("starg.s", OperandType::UInt8, FlowType::Sequential, 1, 0),
    /* 11 */ op("ldloc.s", OperandType::UInt8, FlowType::Sequential, 0, 1),
    /* 12 */ op("ldloca.s", OperandType::UInt8, FlowType::Sequential, 0, 1),
    /* 13 */ op("stloc.s", OperandType::UInt8, FlowType::Sequential, 1, 0),
    /* 14 */ op("ldnull", OperandType::None, FlowType::Sequential, 0, 1),
    /* 15 */ op("ldc.i4.m1", OperandType::None, FlowType::Sequential, 0, 1),
    /* 16 */ op("ldc.i4.0", OperandType::None, FlowType::Sequential, 0, 1),
    /* 17 */ op("ldc.i4.1", OperandType::None, FlowType::Sequential, 0, 1),
    /* 18 */ op("ldc.i4.2", OperandType::None, FlowType::Sequential, 0, 1),
    /* 19 */ op("ldc.i4.3", OperandType::None, FlowType::Sequential, 0, 1),
    /* 1A */ op("ldc.i4.4", OperandType::None, FlowType::Sequential, 0, 1),
    /* 1B */ op("ldc.i4.5", OperandType::None, FlowType::Sequential, 0, 1),
    /* 1C */ op("ldc.i4.6", OperandType::None, FlowType::Sequential, 0, 1),
    /* 1D */ op("ldc.i4.7", OperandType::None, FlowType::Sequential, 0, 1),
    /* 1E */ op("ldc.i4.8", OperandType::None, FlowType::Sequential, 0, 1),
    /* 1F */ op("ldc.i4.s", OperandType::Int8, FlowType::Sequential, 0, 1),
    /* 20 */ op("ldc.i4", OperandType::Int32, FlowType::Sequential, 0, 1),
    /* 21 */ op("ldc.i8", OperandType::Int64, FlowType::Sequential, 0, 1),
    /* 22 */ op("ldc.r4", OperandType::Float32, FlowType::Sequential, 0, 1),
    /* 23 */ op("ldc.r8", OperandType::Float64, FlowType::Sequential, 0, 1),
    /* 24 */ RESERVED,
    /* 25 */ op("dup", OperandType::None, FlowType::Sequential, 1, 2),
    /* 26 */ op("pop", OperandType::None, FlowType::Sequential, 1, 0),
    /* 27 */ op("jmp", OperandType::Token, FlowType::Return, 0, 0),
    /* 28 */ op("call", OperandType::Token, FlowType::Call, 0, 0),
    /* 29 */ op("calli", OperandType::Token, FlowType::Call, 0, 0),
    /* 2A */ op("ret", OperandType::None, FlowType::Return, 0, 0),
    /* 2B */ op("br.s", OperandType::Int8, FlowType::UnconditionalBranch, 0, 0),
    /* 2C */ op("brfalse.s", OperandType::Int8, FlowType::ConditionalBranch, 1, 0),
    /* 2D */ op("brtrue.s", OperandType::Int8, FlowType::ConditionalBranch, 1, 0),
    /* 2E */ op("beq.s", OperandType::Int8, FlowType::ConditionalBranch, 2, 0),
    /* 2F */ op("bge.s", OperandType::Int8, FlowType::ConditionalBranch, 2, 0),
    /* 30 */ op("bgt.s", OperandType::Int8, FlowType::ConditionalBranch, 2, 0),
    /* 31 */ op("ble.s", OperandType::Int8, FlowType::ConditionalBranch, 2, 0),
    /* 32 */ op("blt.s", OperandType::Int8, FlowType::ConditionalBranch, 2, 0),
    /* 33 */ op("bne.un.s", OperandType::Int8, FlowType::ConditionalBranch, 2, 0),
    /* 34 */ op("bge.un.s", OperandType::Int8, FlowType::ConditionalBranch, 2, 0),
    /* 35 */ op("bgt.un.s", OperandType::Int8, FlowType::ConditionalBranch, 2, 0),
    /* 36 */ op("ble.un.s", OperandType::Int8, FlowType::ConditionalBranch, 2, 0),
    /* 37 */ op("blt.un.s", OperandType::Int8, FlowType::ConditionalBranch, 2, 0),
    /* 38 */ op("br", OperandType::Int32, FlowType::UnconditionalBranch, 0, 0),
    /* 39 */ op("brfalse", OperandType::Int32, FlowType::ConditionalBranch, 1, 0),
    /* 3A */ op("brtrue", OperandType::Int32, FlowType::ConditionalBranch, 1, 0),
    /* 3B */ op("beq", OperandType::Int32, FlowType::ConditionalBranch, 2, 0),
    /* 3C */ op("bge", OperandType::Int32, FlowType::ConditionalBranch, 2, 0),
    /* 3D */ op("bgt", OperandType::Int32, FlowType::ConditionalBranch, 2, 0),
    /* 3E */ op("ble", OperandType::Int32, FlowType::ConditionalBranch, 2, 0),
    /* 3F */ op("blt", OperandType::Int32, FlowType::ConditionalBranch, 2, 0),
    /* 40 */ op("bne.un", OperandType::Int32, FlowType::ConditionalBranch, 2, 0),
    /* 41 */ op("bge.un", OperandType::Int32, FlowType::ConditionalBranch, 2, 0),
    /* 42 */ op("bgt.un", OperandType::Int32, FlowType::ConditionalBranch, 2, 0),
    /* 43 */ op("ble.un", OperandType::Int32, FlowType::ConditionalBranch, 2, 0),
    /* 44 */ op("blt.un", OperandType::Int32, FlowType::ConditionalBranch, 2, 0),
    /* 45 */ op("switch", OperandType::Switch, FlowType::Switch, 1, 0),
    /* 46 */ op("ldind.i1", OperandType::None, FlowType::Sequential, 1, 1),
    /* 47 */ op("ldind.u1", OperandType::None, FlowType::Sequential, 1, 1),
    /* 48 */ op("ldind.i2", OperandType::None, FlowType::Sequential, 1, 1),
    /* 49 */ op("ldind.u2", OperandType::None, FlowType::Sequential, 1, 1),
    /* 4A */ op("ldind.i4", OperandType::None, FlowType::Sequential, 1, 1),
    /* 4B */ op("ldind.u4", OperandType::None, FlowType::Sequential, 1, 1),
    /* 4C */ op("ldind.i8", OperandType::None, FlowType::Sequential, 1, 1),
    /* 4D */ op("ldind.i", OperandType::None, FlowType::Sequential, 1, 1),
    /* 4E */ op("ldind.r4", OperandType::None, FlowType::Sequential, 1, 1),
    /* 4F */ op("ldind.r8", OperandType::None, FlowType::Sequential, 1, 1),
    /* 50 */ op("ldind.ref", OperandType::None, FlowType::Sequential, 1, 1),
    /* 51 */ op("stind.ref", OperandType::None, FlowType::Sequential, 2, 0),
    /* 52 */ op("stind.i1", OperandType::None, FlowType::Sequential, 2, 0),
    /* 53 */ op("stind.i2", OperandType::None, FlowType::Sequential, 2, 0),
    /* 54 */ op("stind.i4", OperandType::None, FlowType::Sequential, 2, 0),
    /* 55 */ op("stind.i8", OperandType::None, FlowType::Sequential, 2, 0),
    /* 56 */ op("stind.r4", OperandType::None, FlowType::Sequential, 2, 0),
    /* 57 */ op("stind.r8", OperandType::None, FlowType::Sequential, 2, 0),
    /* 58 */ op("add", OperandType::None, FlowType::Sequential, 2, 1),
    /* 59 */ op("sub", OperandType::None, FlowType::Sequential, 2, 1),
    /* 5A */ op("mul", OperandType::None, FlowType::Sequential, 2, 1),
    /* 5B */ op("div", OperandType::None, FlowType::Sequential, 2, 1),
    /* 5C */ op("div.un", OperandType::None, FlowType::Sequential, 2, 1),
    /* 5D */ op("rem", OperandType::None, FlowType::Sequential, 2, 1),
    /* 5E */ op("rem.un", OperandType::None, FlowType::Sequential, 2, 1),
    /* 5F */ op("and", OperandType::None, FlowType::Sequential, 2, 1),
    /* 60 */ op("or", OperandType::None, FlowType::Sequential, 2, 1),
    /* 61 */ op("xor", OperandType::None, FlowType::Sequential, 2, 1),
    /* 62 */ op("shl", OperandType::None, FlowType::Sequential, 2, 1),
    /* 63 */ op("shr", OperandType::None, FlowType::Sequential, 2, 1),
    /* 64 */ op("shr.un", OperandType::None, FlowType::Sequential, 2, 1),
    /* 65 */ op("neg", OperandType::None, FlowType::Sequential, 1, 1),
    /* 66 */ op("not", OperandType::None, FlowType::Sequential, 1, 1),
    /* 67 */ op("conv.i1", OperandType::None, FlowType::Sequential, 1, 1),
    /* 68 */ op("conv.i2", OperandType::None, FlowType::Sequential, 1, 1),
    /* 69 */ op("conv.i4", OperandType::None, FlowType::Sequential, 1, 1),
    /* 6A */ op("conv.i8", OperandType::None, FlowType::Sequential, 1, 1),
    /* 6B */ op("conv.r4", OperandType::None, FlowType::Sequential, 1, 1),
    /* 6C */ op("conv.r8", OperandType::None, FlowType::Sequential, 1, 1),
    /* 6D */ op("conv.u4", OperandType::None, FlowType::Sequential, 1, 1),
    /* 6E */ op("conv.u8", OperandType::None, FlowType::Sequential, 1, 1),
    /* 6F */ op("callvirt", OperandType::Token, FlowType::Call, 0, 0),
    /* 70 */ op("cpobj", OperandType::Token, FlowType::Sequential, 2, 0),
    /* 71 */ op("ldobj", OperandType::Token, FlowType::Sequential, 1, 1),
    /* 72 */ op("ldstr", OperandType::Token, FlowType::Sequential, 0, 1),
    /* 73 */ op("newobj", OperandType::Token, FlowType::Call, 0, 0),
    /* 74 */ op("castclass", OperandType::Token, FlowType::Sequential, 1, 1),
    /* 75 */ op("isinst", OperandType::Token, FlowType::Sequential, 1, 1),
    /* 76 */ op("conv.r.un", OperandType::None, FlowType::Sequential, 1, 1),
    /* 77 */ RESERVED,
    /* 78 */ RESERVED,
    /* 79 */ op("unbox", OperandType::Token, FlowType::Sequential, 1, 1),
    /* 7A */ op("throw", OperandType::None, FlowType::Throw, 1, 0),
    /* 7B */ op("ldfld", OperandType::Token, FlowType::Sequential, 1, 1),
    /* 7C */ op("ldflda", OperandType::Token, FlowType::Sequential, 1, 1),
    /* 7D */ op("stfld", OperandType::Token, FlowType::Sequential, 2, 0),
    /* 7E */ op("ldsfld", OperandType::Token, FlowType::Sequential, 0, 1),
    /* 7F */ op("ldsflda", OperandType::Token, FlowType::Sequential, 0, 1),
    /* 80 */ op("stsfld", OperandType::Token, FlowType::Sequential, 1, 0),
    /* 81 */ op("stobj", OperandType::Token, FlowType::Sequential, 2, 0),
    /* 82 */ op("conv.ovf.i1.un", OperandType::None, FlowType::Sequential, 1, 1),
    /* 83 */ op("conv.ovf.i2.un", OperandType::None, FlowType::Sequential, 1, 1),
    /* 84 */ op("conv.ovf.i4.un", OperandType::None, FlowType::Sequential, 1, 1),
    /* 85 */ op("conv.ovf.i8.un", OperandType::None, FlowType::Sequential, 1, 1),
    /* 86 */ op("conv.ovf.u1.un", OperandType::None, FlowType::Sequential, 1, 1),
    /* 87 */ op("conv.ovf.u2.un", OperandType::None, FlowType::Sequential, 1, 1),
    /* 88 */ op("conv.ovf.u4.un", OperandType::None, FlowType::Sequential, 1, 1),
    /* 89 */ op("conv.ovf.u8.un", OperandType::None, FlowType::Sequential, 1, 1),
    /* 8A */ op("conv.ovf.i.un", OperandType::None, FlowType::Sequential, 1, 1),
    /* 8B */ op("conv.ovf.u.un", OperandType::None, FlowType::Sequential, 1, 1),
    /* 8C */ op("box", OperandType::Token, FlowType::Sequential, 1, 1),
    /* 8D */ op("newarr", OperandType::Token, FlowType::Sequential, 1, 1),
    /* 8E */ op("ldlen", OperandType::None, FlowType::Sequential, 1, 1),
    /* 8F */ op("ldelema", OperandType::Token, FlowType::Sequential, 2, 1),
    /* 90 */ op("ldelem.i1", OperandType::None, FlowType::Sequential, 2, 1),
    /* 91 */ op("ldelem.u1", OperandType::None, FlowType::Sequential, 2, 1),
    /* 92 */ op("ldelem.i2", OperandType::None, FlowType::Sequential, 2, 1),
    /* 93 */ op("ldelem.u2", OperandType::None, FlowType::Sequential, 2, 1),
    /* 94 */ op("ldelem.i4", OperandType::None, FlowType::Sequential, 2, 1),
    /* 95 */ op("ldelem.u4", OperandType::None, FlowType::Sequential, 2, 1),
    /* 96 */ op("ldelem.i8", OperandType::None, FlowType::Sequential, 2, 1),
    /* 97 */ op("ldelem.i", OperandType::None, FlowType::Sequential, 2, 1),
    /* 98 */ op("ldelem.r4", OperandType::None, FlowType::Sequential, 2, 1),
    /* 99 */ op("ldelem.r8", OperandType::None, FlowType::Sequential, 2, 1),
    /* 9A */ op("ldelem.ref", OperandType::None, FlowType::Sequential, 2, 1),
    /* 9B */ op("stelem.i", OperandType::None, FlowType::Sequential, 3, 0),
    /* 9C */ op("stelem.i1", OperandType::None, FlowType::Sequential, 3, 0),
    /* 9D */ op("stelem.i2", OperandType::None, FlowType::Sequential, 3, 0),
    /* 9E */ op("stelem.i4", OperandType::None, FlowType::Sequential, 3, 0),
    /* 9F */ op("stelem.i8", OperandType::None, FlowType::Sequential, 3, 0),
    /* A0 */ op("stelem.r4", OperandType::None, FlowType::Sequential, 3, 0),
    /* A1 */ op("stelem.r8", OperandType::None, FlowType::Sequential, 3, 0),
    /* A2 */ op("stelem.ref", OperandType::None, FlowType::Sequential, 3, 0),
    /* A3 */ op("ldelem", OperandType::Token, FlowType::Sequential, 2, 1),
    /* A4 */ op("stelem", OperandType::Token, FlowType::Sequential, 3, 0),
    /* A5 */ op("unbox.any", OperandType::Token, FlowType::Sequential, 1, 1),
    /* A6 */ RESERVED,
    /* A7 */ RESERVED,
    /* A8 */ RESERVED,
    /* A9 */ RESERVED,
    /* AA */ RESERVED,
    /* AB */ RESERVED,
    /* AC */ RESERVED,
    /* AD */ RESERVED,
    /* AE */ RESERVED,
    /* AF */ RESERVED,
    /* B0 */ RESERVED,
    /* B1 */ RESERVED,
    /* B2 */ RESERVED,
    /* B3 */ op("conv.ovf.i1", OperandType::None, FlowType::Sequential, 1, 1),
    /* B4 */ op("conv.ovf.u1", OperandType::None, FlowType::Sequential, 1, 1),
    /* B5 */ op("conv.ovf.i2", OperandType::None, FlowType::Sequential, 1, 1),
    /* B6 */ op("conv.ovf.u2", OperandType::None, FlowType::Sequential, 1, 1),
    /* B7 */ op("conv.ovf.i4", OperandType::None, FlowType::Sequential, 1, 1),
    /* B8 */ op("conv.ovf.u4", OperandType::None, FlowType::Sequential, 1, 1),
    /* B9 */ op("conv.ovf.i8", OperandType::None, FlowType::Sequential, 1, 1),
    /* BA */ op("conv.ovf.u8", OperandType::None, FlowType::Sequential, 1, 1),
    /* BB */ RESERVED,
    /* BC */ RESERVED,
    /* BD */ RESERVED,
    /* BE */ RESERVED,
    /* BF */ RESERVED,
    /* C0 */ RESERVED,
    /* C1 */ RESERVED,
    /* C2 */ op("refanyval", OperandType::Token, FlowType::Sequential, 1, 1),
    /* C3 */ op("ckfinite", OperandType::None, FlowType::Sequential, 1, 1),
    /* C4 */ RESERVED,
    /* C5 */ RESERVED,
    /* C6 */ op("mkrefany", OperandType::Token, FlowType::Sequential, 1, 1),
    /* C7 */ RESERVED,
    /* C8 */ RESERVED,
    /* C9 */ RESERVED,
    /* CA */ RESERVED,
    /* CB */ RESERVED,
    /* CC */ RESERVED,
    /* CD */ RESERVED,
    /* CE */ RESERVED,
    /* CF */ RESERVED,
    /* D0 */ op("ldtoken", OperandType::Token, FlowType::Sequential, 0, 1),
    /* D1 */ op("conv.u2", OperandType::None, FlowType::Sequential, 1, 1),
    /* D2 */ op("conv.u1", OperandType::None, FlowType::Sequential, 1, 1),
    /* D3 */ op("conv.i", OperandType::None, FlowType::Sequential, 1, 1),
    /* D4 */ op("conv.ovf.i", OperandType::None, FlowType::Sequential, 1, 1),
    /* D5 */ op("conv.ovf.u", OperandType::None, FlowType::Sequential, 1, 1),
    /* D6 */ op("add.ovf", OperandType::None, FlowType::Sequential, 2, 1),
    /* D7 */ op("add.ovf.un", OperandType::None, FlowType::Sequential, 2, 1),
    /* D8 */ op("mul.ovf", OperandType::None, FlowType::Sequential, 2, 1),
    /* D9 */ op("mul.ovf.un", OperandType::None, FlowType::Sequential, 2, 1),
    /* DA */ op("sub.ovf", OperandType::None, FlowType::Sequential, 2, 1),
    /* DB */ op("sub.ovf.un", OperandType::None, FlowType::Sequential, 2, 1),
    /* DC */ op("endfinally", OperandType::None, FlowType::EndFinally, 0, 0),
    /* DD */ op("leave", OperandType::Int32, FlowType::Leave, 0, 0),
    /* DE */ op("leave.s", OperandType::Int8, FlowType::Leave, 0, 0),
    /* DF */ op("stind.i", OperandType::None, FlowType::Sequential, 2, 0),
    /* E0 */ op("conv.u", OperandType::None, FlowType::Sequential, 1, 1),
];

/// Two byte opcodes, indexed by the byte after `0xFE`
#[rustfmt::skip]
pub const INSTRUCTIONS_FE: [CilInstruction; 31] = [
    /* 00 */ op("arglist", OperandType::None, FlowType::Sequential, 0, 1),
    /* 01 */ op("ceq", OperandType::None, FlowType::Sequential, 2, 1),
    /* 02 */ op("cgt", OperandType::None, FlowType::Sequential, 2, 1),
    /* 03 */ op("cgt.un", OperandType::None, FlowType::Sequential, 2, 1),
    /* 04 */ op("clt", OperandType::None, FlowType::Sequential, 2, 1),
    /* 05 */ op("clt.un", OperandType::None, FlowType::Sequential, 2, 1),
    /* 06 */ op("ldftn", OperandType::Token, FlowType::Sequential, 0, 1),
    /* 07 */ op("ldvirtftn", OperandType::Token, FlowType::Sequential, 1, 1),
    /* 08 */ RESERVED,
    /* 09 */ op("ldarg", OperandType::UInt16, FlowType::Sequential, 0, 1),
    /* 0A */ op("ldarga", OperandType::UInt16, FlowType::Sequential, 0, 1),
    /* 0B */ op("starg", OperandType::UInt16, FlowType::Sequential, 1, 0),
    /* 0C */ op("ldloc", OperandType::UInt16, FlowType::Sequential, 0, 1),
    /* 0D */ op("ldloca", OperandType::UInt16, FlowType::Sequential, 0, 1),
    /* 0E */ op("stloc", OperandType::UInt16, FlowType::Sequential, 1, 0),
    /* 0F */ op("localloc", OperandType::None, FlowType::Sequential, 1, 1),
    /* 10 */ RESERVED,
    /* 11 */ op("endfilter", OperandType::None, FlowType::EndFinally, 1, 0),
    /* 12 */ op("unaligned.", OperandType::UInt8, FlowType::Sequential, 0, 0),
    /* 13 */ op("volatile.", OperandType::None, FlowType::Sequential, 0, 0),
    /* 14 */ op("tail.", OperandType::None, FlowType::Sequential, 0, 0),
    /* 15 */ op("initobj", OperandType::Token, FlowType::Sequential, 1, 0),
    /* 16 */ op("constrained.", OperandType::Token, FlowType::Sequential, 0, 0),
    /* 17 */ op("cpblk", OperandType::None, FlowType::Sequential, 3, 0),
    /* 18 */ op("initblk", OperandType::None, FlowType::Sequential, 3, 0),
    /* 19 */ op("no.", OperandType::UInt8, FlowType::Sequential, 0, 0),
    /* 1A */ op("rethrow", OperandType::None, FlowType::Throw, 0, 0),
    /* 1B */ RESERVED,
    /* 1C */ op("sizeof", OperandType::Token, FlowType::Sequential, 0, 1),
    /* 1D */ op("refanytype", OperandType::None, FlowType::Sequential, 1, 1),
    /* 1E */ op("readonly.", OperandType::None, FlowType::Sequential, 0, 0),
];


/// An opcode, identified by its optional `0xFE` prefix and its code byte.
///
/// Values are only constructed from the tables, so every `OpCode` names a defined instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpCode(u16);

macro_rules! opcodes {
    ($($name:ident = $value:expr),* $(,)?) => {
        impl OpCode {
            $(
                #[allow(missing_docs)]
                pub const $name: OpCode = OpCode($value);
            )*
        }
    };
}

opcodes! {
    NOP = 0x00,
    LDARG_0 = 0x02, LDARG_1 = 0x03, LDARG_2 = 0x04, LDARG_3 = 0x05,
    LDLOC_0 = 0x06, LDLOC_1 = 0x07, LDLOC_2 = 0x08, LDLOC_3 = 0x09,
    STLOC_0 = 0x0A, STLOC_1 = 0x0B, STLOC_2 = 0x0C, STLOC_3 = 0x0D,
    LDARG_S = 0x0E, LDARGA_S = 0x0F, STARG_S = 0x10,
    LDLOC_S = 0x11, LDLOCA_S = 0x12, STLOC_S = 0x13,
    LDNULL = 0x14, LDC_I4_M1 = 0x15, LDC_I4_0 = 0x16, LDC_I4_1 = 0x17,
    LDC_I4_S = 0x1F, LDC_I4 = 0x20, LDC_I8 = 0x21, LDC_R4 = 0x22, LDC_R8 = 0x23,
    DUP = 0x25, POP = 0x26, CALL = 0x28, CALLI = 0x29, RET = 0x2A,
    BR_S = 0x2B, BRFALSE_S = 0x2C, BRTRUE_S = 0x2D, BEQ_S = 0x2E, BNE_UN_S = 0x33,
    BR = 0x38, BRFALSE = 0x39, BRTRUE = 0x3A, BEQ = 0x3B, BGE = 0x3C, BGT = 0x3D,
    BLE = 0x3E, BLT = 0x3F, BNE_UN = 0x40,
    SWITCH = 0x45, ADD = 0x58, SUB = 0x59, CONV_I4 = 0x69,
    CALLVIRT = 0x6F, LDSTR = 0x72, NEWOBJ = 0x73, CASTCLASS = 0x74, ISINST = 0x75,
    THROW = 0x7A, LDFLD = 0x7B, LDFLDA = 0x7C, STFLD = 0x7D, LDSFLD = 0x7E, STSFLD = 0x80,
    BOX = 0x8C, NEWARR = 0x8D, LDLEN = 0x8E, LDELEM_REF = 0x9A, STELEM_REF = 0xA2,
    UNBOX_ANY = 0xA5, LDTOKEN = 0xD0,
    ENDFINALLY = 0xDC, LEAVE = 0xDD, LEAVE_S = 0xDE,
    CEQ = 0xFE01, CGT = 0xFE02, CLT = 0xFE04,
    LDARG = 0xFE09, LDARGA = 0xFE0A, STARG = 0xFE0B,
    LDLOC = 0xFE0C, LDLOCA = 0xFE0D, STLOC = 0xFE0E,
    ENDFILTER = 0xFE11, RETHROW = 0xFE1A,
}

impl OpCode {
    /// Look up an opcode by prefix (`0` or `0xFE`) and code byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for undefined and reserved opcodes.
    pub fn from_parts(prefix: u8, code: u8) -> Result<OpCode> {
        let entry = match prefix {
            0 => INSTRUCTIONS.get(code as usize),
            0xFE => INSTRUCTIONS_FE.get(code as usize),
            _ => None,
        };

        match entry {
            Some(entry) if !entry.instr.is_empty() => {
                Ok(OpCode((u16::from(prefix) << 8) | u16::from(code)))
            }
            _ => Err(malformed_error!("Invalid opcode: {:02X} {:02X}", prefix, code)),
        }
    }

    pub(crate) fn from_u16(value: u16) -> OpCode {
        OpCode(value)
    }

    pub(crate) fn raw(&self) -> u16 {
        self.0
    }

    /// The prefix byte, `0xFE` for two byte opcodes and `0` otherwise
    #[must_use]
    pub fn prefix(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// The code byte
    #[must_use]
    pub fn code(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Number of bytes the opcode itself occupies
    #[must_use]
    pub fn size(&self) -> usize {
        if self.prefix() == 0 {
            1
        } else {
            2
        }
    }

    /// The table entry of this opcode
    #[must_use]
    pub fn info(&self) -> &'static CilInstruction {
        let table: &'static [CilInstruction] = if self.prefix() == 0 {
            &INSTRUCTIONS
        } else {
            &INSTRUCTIONS_FE
        };
        table.get(self.code() as usize).unwrap_or(&RESERVED)
    }

    /// The mnemonic, e.g. `brtrue.s`
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        self.info().instr
    }

    /// The control flow class
    #[must_use]
    pub fn flow(&self) -> FlowType {
        self.info().flow
    }

    /// The operand encoding
    #[must_use]
    pub fn operand_type(&self) -> OperandType {
        self.info().op_type
    }

    /// True for instructions with a single branch target operand, including `leave`
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow(),
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave
        )
    }

    /// True for branches with an 8-bit displacement
    #[must_use]
    pub fn is_short_branch(&self) -> bool {
        self.is_branch() && self.operand_type() == OperandType::Int8
    }

    /// The 8-bit displacement form of a branch, `self` for everything else
    #[must_use]
    pub fn short_form(&self) -> OpCode {
        match self.0 {
            0x38..=0x44 => OpCode(self.0 - 13),
            0xDD => OpCode::LEAVE_S,
            _ => *self,
        }
    }

    /// The 32-bit displacement form of a branch, `self` for everything else
    #[must_use]
    pub fn long_form(&self) -> OpCode {
        match self.0 {
            0x2B..=0x37 => OpCode(self.0 + 13),
            0xDE => OpCode::LEAVE,
            _ => *self,
        }
    }
}

impl fmt::Debug for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpCode({})", self.mnemonic())
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
