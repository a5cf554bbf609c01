//! Error types for loading, resolving, editing and writing .NET modules.
//!
//! Every fallible operation in this crate returns [`crate::Result`]. The variants are grouped by
//! the stage that produces them: container parsing, symbol resolution, instruction editing,
//! patch orchestration and output writing. A failed [`crate::patch::Patch`] is reported by the
//! pipeline as [`Error::PatchFailed`], wrapping the error that stopped it.

use std::path::PathBuf;

use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Container Errors
/// - [`Error::ContainerNotFound`] - The input path does not exist
/// - [`Error::Malformed`] - Corrupted or invalid file structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of a structure
/// - [`Error::NotSupported`] - Valid input using a feature this crate does not handle
///
/// ## Resolution Errors
/// - [`Error::DependencyNotFound`] - A referenced assembly could not be located
/// - [`Error::SymbolNotFound`] - A type, method or field lookup missed
/// - [`Error::SignatureMismatch`] - Same-named members exist, none with the requested signature
/// - [`Error::ConstantTypeMismatch`] - A constant has a different type than expected
///
/// ## Editing Errors
/// - [`Error::IndexOutOfRange`], [`Error::DanglingBranchTarget`], [`Error::InvalidStack`], ...
///
/// ## Output Errors
/// - [`Error::WriteError`] - I/O failure while writing the destination
/// - [`Error::WriteLayout`] - The image cannot be extended to hold the patched data
#[derive(Error, Debug)]
pub enum Error {
    /// The container path given to the loader does not exist.
    #[error("Container not found - {0}")]
    ContainerNotFound(PathBuf),

    /// The file is damaged and could not be parsed.
    ///
    /// Carries the source location where the malformation was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the file.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This file type or feature is not supported.
    #[error("Not supported - {0}")]
    NotSupported(String),

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error while reading input.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate during PE parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// A referenced assembly is not declared, or no file for it exists on the search path.
    #[error("Dependency not found - {0}")]
    DependencyNotFound(String),

    /// A type, method or field could not be found. The message names the symbol.
    #[error("Symbol not found - {0}")]
    SymbolNotFound(String),

    /// Members with the requested name exist, but none matches the requested signature exactly.
    #[error("Signature mismatch - {member}: none of {candidates} candidate(s) match {signature}")]
    SignatureMismatch {
        /// Qualified member name
        member: String,
        /// The signature that was searched for
        signature: String,
        /// Number of same-named members that were compared
        candidates: usize,
    },

    /// More than one member matches a query that must be unique.
    #[error("Ambiguous symbol - {0}")]
    AmbiguousSymbol(String),

    /// A constant's stored type differs from the type the caller expects.
    #[error("Constant type mismatch - {field}: expected {expected}, found {found}")]
    ConstantTypeMismatch {
        /// The field holding the constant
        field: String,
        /// Expected element type
        expected: String,
        /// Stored element type
        found: String,
    },

    /// An instruction index is outside of the current stream.
    #[error("Index {index} out of range for stream of length {len}")]
    IndexOutOfRange {
        /// The requested index
        index: usize,
        /// The current stream length
        len: usize,
    },

    /// A branch, switch or exception region references an instruction that is not in the stream.
    #[error("Dangling branch target in {method} - {detail}")]
    DanglingBranchTarget {
        /// Method being finalized
        method: String,
        /// Which reference is dangling
        detail: String,
    },

    /// An operand does not fit the operand kind of its opcode.
    #[error("Invalid operand for '{mnemonic}' - {detail}")]
    InvalidOperand {
        /// Mnemonic of the offending opcode
        mnemonic: &'static str,
        /// What was wrong with it
        detail: String,
    },

    /// Evaluation stack underflow or inconsistent depth at a merge point.
    #[error("Invalid stack in {method} - {detail}")]
    InvalidStack {
        /// Method being finalized
        method: String,
        /// Description including the instruction index
        detail: String,
    },

    /// A finalized body would be empty or fall through past its last instruction.
    #[error("Incomplete body for {method} - {detail}")]
    IncompleteBody {
        /// Method being finalized
        method: String,
        /// What is missing
        detail: String,
    },

    /// No instruction of the original body started at the anchor offset.
    #[error("Anchor IL_{offset:04x} not found in {method}")]
    AnchorNotFound {
        /// Method searched
        method: String,
        /// Byte offset in the original body
        offset: u32,
    },

    /// The instruction at the anchor offset has an unexpected opcode.
    #[error("Anchor IL_{offset:04x} in {method}: expected '{expected}', found '{found}'")]
    AnchorMismatch {
        /// Method searched
        method: String,
        /// Byte offset in the original body
        offset: u32,
        /// Expected mnemonic
        expected: &'static str,
        /// Mnemonic found at the offset
        found: &'static str,
    },

    /// The method was already rewritten by an earlier patch, so original offsets are meaningless.
    #[error("Offset anchors invalidated for {0}: body was rewritten by an earlier patch")]
    AnchorInvalidated(String),

    /// The method has no IL body (abstract, extern or runtime-implemented).
    #[error("Method {0} has no IL body")]
    NoMethodBody(String),

    /// A token does not point to a row that exists.
    #[error("Invalid token {0}")]
    InvalidToken(Token),

    /// Writing the destination failed.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// Destination that was being written
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The PE image cannot be laid out to hold the patched content.
    #[error("Write layout failed - {0}")]
    WriteLayout(String),

    /// A patch in the pipeline failed; no later patch ran and nothing was written.
    #[error("Patch '{patch}' failed: {source}")]
    PatchFailed {
        /// Name of the failing patch
        patch: String,
        /// The error that stopped it
        source: Box<Error>,
    },

    /// Recursion limit reached while decoding nested structures.
    #[error("Reached the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),
}
