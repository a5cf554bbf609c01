//! Patches for the Unity client build.
//!
//! | Patch | Kind | Target |
//! |-------|------|--------|
//! | [`GameDebugLogPatch`] | body replacement | `GameDebug::Log` |
//! | [`StorePurchasePatch`] | guard insertion | `StoreUI` purchase flow, `StoreManager::RequestPurchase` |
//!
//! Every name and offset a patch relies on is a public field whose default matches the shipped
//! build, so a patch can be retargeted at another build without code changes.

mod game_debug;
mod store;

pub use game_debug::GameDebugLogPatch;
pub use store::StorePurchasePatch;
