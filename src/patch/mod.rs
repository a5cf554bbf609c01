//! Patches and the pipeline that applies them.
//!
//! A [`Patch`] is a named transformation of one [`Module`]. Patches are stateless: everything
//! they need is configuration held in their own fields, and everything they change goes
//! through [`Module::transaction`]. A patch that fails therefore leaves the module exactly as it
//! found it, and a [`PatchPipeline`] that stops at the first failure never hands a half-patched
//! module to the writer.
//!
//! # Key Components
//!
//! - [`Patch`]: the trait every transformation implements
//! - [`PatchPipeline`] / [`Patcher`]: ordered, all-or-nothing application and output
//! - [`ConditionalGuard`] / [`ConditionalGuardPatch`]: splice a compare-and-branch into a body
//! - [`GameDebugLogPatch`] / [`StorePurchasePatch`]: the patches of the Unity client build
//!
//! # Offset anchors
//!
//! Patches that edit an existing body address their edit points with [`crate::assembly::Anchor`]s,
//! byte offsets into the body as it was loaded. Anchors only hold while no earlier patch in the
//! same pipeline rewrote that method; the editor rejects them with
//! [`crate::Error::AnchorInvalidated`] otherwise. Order such patches before anything else that
//! touches the same method.
//!
//! # Example
//!
//! ```rust,no_run
//! use dotpatch::prelude::*;
//! use std::path::Path;
//!
//! let mut module = ModuleLoader::new()
//!     .search_dir("Managed")
//!     .load_file(Path::new("Managed/Assembly-CSharp.dll"))?;
//!
//! let report = PatchPipeline::new()
//!     .add_patch(GameDebugLogPatch::default())
//!     .add_patch(StorePurchasePatch::default())
//!     .run_and_write(&mut module, Path::new("out/Assembly-CSharp.dll"))?;
//! println!("{report}");
//! # Ok::<(), dotpatch::Error>(())
//! ```

pub mod guard;
pub mod patches;
pub mod pipeline;
pub mod unity;

pub use guard::{Comparison, ConditionalGuard, ConditionalGuardPatch, GuardConstant, GuardPosition, GuardSubject};
pub use patches::{GameDebugLogPatch, StorePurchasePatch};
pub use pipeline::{PatchOutcome, PatchPipeline, Patcher, PipelineReport};
pub use unity::{find_unity_engine_type, UNITY_ENGINE};

use crate::{module::Module, Result};

/// A named, self-contained transformation of a module.
///
/// Implementations look up every symbol they need before staging any edit, and stage all edits
/// of one application in a single [`Module::transaction`], so an `Err` return always means the
/// module is unchanged.
pub trait Patch: Send + Sync {
    /// Name used in logs and in [`crate::Error::PatchFailed`].
    fn name(&self) -> &str;

    /// Apply the patch to `module`.
    ///
    /// # Errors
    ///
    /// Returns the lookup or editing error that prevented the patch; the module is left as it
    /// was before the call.
    fn apply(&self, module: &mut Module) -> Result<()>;
}

impl<P: Patch + ?Sized> Patch for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn apply(&self, module: &mut Module) -> Result<()> {
        (**self).apply(module)
    }
}
