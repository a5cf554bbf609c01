//! # dotpatch Prelude
//!
//! The types needed to load a module, look up symbols, edit bodies, run patches and write the
//! result.
//!
//! ```rust,no_run
//! use dotpatch::prelude::*;
//!
//! let mut module = ModuleLoader::new().load_file(std::path::Path::new("Game.dll"))?;
//! PatchPipeline::new()
//!     .add_patch(GameDebugLogPatch::default())
//!     .run(&mut module)?;
//! # Ok::<(), dotpatch::Error>(())
//! ```

/// The main error type for all dotpatch operations
pub use crate::Error;

/// The result type used throughout dotpatch
pub use crate::Result;

// ================================================================================================
// Loading and Symbols
// ================================================================================================

/// Loaded modules and their construction
pub use crate::module::{AssemblyResolver, Module, ModuleLoader};

/// Symbols of a loaded module
pub use crate::module::{
    AssemblyIdentity, AssemblyReference, DependencyType, ExternalMethod, FieldDef, MethodDef,
    TypeDef,
};

/// Metadata tokens
pub use crate::metadata::token::Token;

/// Constant values of fields
pub use crate::metadata::constant::ConstantValue;

/// Signatures for exact overload lookup
pub use crate::metadata::signatures::{MethodSignature, TypeName, TypeSig};

// ================================================================================================
// Editing
// ================================================================================================

/// Staged changes of one patch
pub use crate::module::Transaction;

/// Instructions and the instruction editor
pub use crate::assembly::{
    decode_stream, Anchor, FinalizedBody, Immediate, InstrId, Instruction, InstructionEditor,
    OpCode, Operand,
};

// ================================================================================================
// Patching and Output
// ================================================================================================

/// Patch trait and pipeline
pub use crate::patch::{Patch, PatchOutcome, PatchPipeline, Patcher, PipelineReport};

/// Conditional guards
pub use crate::patch::{
    Comparison, ConditionalGuard, ConditionalGuardPatch, GuardConstant, GuardPosition,
    GuardSubject,
};

/// Bundled patches
pub use crate::patch::{GameDebugLogPatch, StorePurchasePatch};

/// Writer
pub use crate::writer::{ModuleWriter, WriterOptions};
