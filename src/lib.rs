// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
//#![deny(unsafe_code)]
// - 'file/backend.rs' uses mmap to map a file into memory

//! # dotpatch
//!
//! [![Crates.io](https://img.shields.io/crates/v/dotpatch.svg)](https://crates.io/crates/dotpatch)
//! [![Documentation](https://docs.rs/dotpatch/badge.svg)](https://docs.rs/dotpatch)
//! [![License](https://img.shields.io/badge/license-Apache--2.0-blue.svg)](https://github.com/BinFlip/dotpatch/blob/main/LICENSE-APACHE)
//!
//! A transactional patch engine for .NET PE assemblies. `dotpatch` loads a managed DLL, resolves
//! types, methods and fields across referenced assemblies, rewrites CIL method bodies at the
//! instruction level, and writes a new image that differs from the input only where a patch
//! asked for it.
//!
//! ## Features
//!
//! - **🔍 Symbol resolution** - Types, nested types, exact-signature overloads and enum constants,
//!   across assembly references and type forwarders
//! - **✏️ Instruction editing** - Insert, remove and replace instructions with stable branch
//!   targets; short and long branch forms are picked automatically
//! - **🧮 Body finalization** - Offsets, branch displacements, max stack and exception clauses are
//!   recomputed and validated before anything is committed
//! - **🔒 Transactions** - A patch either lands completely or leaves the module untouched
//! - **💾 Minimal output** - Unchanged bytes stay unchanged; new bodies and metadata go into an
//!   appended section
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! dotpatch = "0.1"
//! ```
//!
//! ### Using the Prelude
//!
//! ```rust,no_run
//! use dotpatch::prelude::*;
//! use std::path::Path;
//!
//! let mut module = ModuleLoader::new().load_file(Path::new("Managed/Assembly-CSharp.dll"))?;
//! let report = PatchPipeline::new()
//!     .add_patch(GameDebugLogPatch::default())
//!     .add_patch(StorePurchasePatch::default())
//!     .run_and_write(&mut module, Path::new("Assembly-CSharp.patched.dll"))?;
//! println!("{report}");
//! # Ok::<(), dotpatch::Error>(())
//! ```
//!
//! ### Editing a Body by Hand
//!
//! ```rust,no_run
//! use dotpatch::prelude::*;
//! use std::path::Path;
//!
//! let mut module = ModuleLoader::new().load_file(Path::new("Game.dll"))?;
//! let ty = module.find_type("Game.Settings")?.token;
//! let method = module.find_method_by_name(ty, "IsDebugBuild")?.token;
//!
//! module.transaction(|tx| {
//!     let mut editor = tx.editor(method)?;
//!     editor.clear();
//!     editor.append(Instruction::ldc_i4(1));
//!     editor.append(Instruction::simple(OpCode::RET));
//!     tx.replace_body(&editor)
//! })?;
//!
//! ModuleWriter::new().write(&module, Path::new("Game.patched.dll"))?;
//! # Ok::<(), dotpatch::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - **File Layer**: PE validation and header offsets ([`File`])
//! - **Metadata Layer**: heaps, tables, signatures and method bodies ([`metadata`])
//! - **Module Layer**: symbol model, dependency resolution and transactions ([`module`])
//! - **Assembly Layer**: CIL decoding, encoding and the instruction editor ([`assembly`])
//! - **Patch Layer**: the [`patch::Patch`] trait, guards and the pipeline ([`patch`])
//! - **Writer Layer**: minimal-diff serialization ([`writer`])
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade: one `info` line per loaded module, applied patch and
//! written file, `debug` lines for resolution and layout decisions, `error` for failed patches.
//! Install any logger implementation to see them.

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use dotpatch::prelude::*;
///
/// let module = ModuleLoader::new().load_file(std::path::Path::new("Game.dll"))?;
/// println!("{} defines {} types", module.name(), module.types().len());
/// # Ok::<(), dotpatch::Error>(())
/// ```
pub mod prelude;

/// CIL instructions: decoding, encoding, stack analysis and the instruction editor.
///
/// # Key Types
///
/// - [`assembly::Instruction`] - an instruction whose branch operands are [`assembly::InstrId`]s
/// - [`assembly::InstructionEditor`] - a mutable instruction stream for one method
/// - [`assembly::FinalizedBody`] - the encoded, validated result of an edit
/// - [`assembly::Anchor`] - an offset into the body as it was loaded
///
/// # Examples
///
/// ```rust
/// use dotpatch::assembly::{decode_stream, OpCode};
///
/// let code = [0x16, 0x2A]; // ldc.i4.0, ret
/// let instructions = decode_stream(&code)?;
/// assert_eq!(instructions[1].opcode, OpCode::RET);
/// # Ok::<(), dotpatch::Error>(())
/// ```
pub mod assembly;

/// Construction of small .NET images, used for fixtures and tests.
pub mod builder;

/// PE container access.
pub mod file;

/// ECMA-335 metadata structures based on ECMA-335.
///
/// - [`metadata::root`] - metadata root and stream directory
/// - [`metadata::streams`] - `#Strings`, `#US`, `#Blob` and `#GUID` heaps
/// - [`metadata::tables`] - table schema and the `#~` stream
/// - [`metadata::signatures`] - method, field and type signatures
/// - [`metadata::method`] - method body headers and exception clauses
/// - [`metadata::token`] - metadata tokens
pub mod metadata;

/// Loaded modules, symbol lookup, dependency resolution and transactions.
pub mod module;

/// Patches and the pipeline that applies them.
pub mod patch;

/// Serialization of patched modules.
pub mod writer;

/// `dotpatch` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
///
/// # Examples
///
/// ```rust,no_run
/// use dotpatch::{Module, ModuleLoader, Result};
///
/// fn load(path: &str) -> Result<Module> {
///     ModuleLoader::new().load_file(std::path::Path::new(path))
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `dotpatch` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use dotpatch::{Error, ModuleLoader};
///
/// match ModuleLoader::new().load_file(std::path::Path::new("Game.dll")) {
///     Ok(module) => println!("Loaded {}", module.name()),
///     Err(Error::ContainerNotFound(path)) => println!("No such file: {}", path.display()),
///     Err(e) => println!("Error: {}", e),
/// }
/// ```
pub use error::Error;

/// Main entry points for loading and writing modules.
pub use module::{AssemblyResolver, Module, ModuleLoader, Transaction};

/// Output configuration.
pub use writer::{ModuleWriter, WriterOptions};

/// Patching.
pub use patch::{Patch, PatchPipeline, Patcher, PipelineReport};

/// Low-level file and byte parsing utilities.
///
/// # Example
///
/// ```rust
/// use dotpatch::Parser;
///
/// let data = [0x2A, 0x00, 0x01];
/// let mut parser = Parser::new(&data);
/// assert_eq!(parser.read_le::<u8>()?, 0x2A);
/// assert_eq!(parser.read_le::<u16>()?, 0x0100);
/// # Ok::<(), dotpatch::Error>(())
/// ```
pub use file::{parser::Parser, File};
