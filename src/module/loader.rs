//! Builder-style entry point for loading modules.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotpatch::ModuleLoader;
//! use std::path::Path;
//!
//! let module = ModuleLoader::new()
//!     .search_dir("Managed")
//!     .load_file(Path::new("Managed/Assembly-CSharp.dll"))?;
//! println!("{} defines {} types", module.name(), module.types().len());
//! # Ok::<(), dotpatch::Error>(())
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::info;

use crate::{
    module::{resolver::AssemblyResolver, Module},
    Error, Result,
};

/// Loads modules and sets up dependency resolution for them.
#[derive(Debug, Clone, Default)]
pub struct ModuleLoader {
    search_dirs: Vec<PathBuf>,
}

impl ModuleLoader {
    /// A loader without extra search directories
    #[must_use]
    pub fn new() -> Self {
        ModuleLoader::default()
    }

    /// Add a directory to search for dependencies, after the directory of the loaded file
    #[must_use]
    pub fn search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dirs.push(dir.into());
        self
    }

    /// The configured search directories
    #[must_use]
    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Load the image at `path`.
    ///
    /// Dependencies are looked up in the directory of `path` first, then in the configured
    /// search directories.
    ///
    /// # Errors
    /// Returns [`Error::ContainerNotFound`] if `path` does not exist, or any error of reading
    /// and decoding the image.
    pub fn load_file(&self, path: &Path) -> Result<Module> {
        if !path.is_file() {
            return Err(Error::ContainerNotFound(path.to_path_buf()));
        }

        let mut dirs = Vec::with_capacity(self.search_dirs.len() + 1);
        if let Some(parent) = path.parent() {
            let parent = if parent.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                parent.to_path_buf()
            };
            dirs.push(parent);
        }
        dirs.extend(self.search_dirs.iter().cloned());

        let module = Module::from_path(path, Arc::new(AssemblyResolver::new(dirs)))?;
        info!("Loaded {} from {}", module.name(), path.display());
        Ok(module)
    }

    /// Load an in-memory image. `name` labels the module in messages and reports.
    ///
    /// # Errors
    /// Returns an error if `data` is not a valid .NET image.
    pub fn load_bytes(&self, name: &str, data: Vec<u8>) -> Result<Module> {
        let resolver = Arc::new(AssemblyResolver::new(self.search_dirs.clone()));
        let module = Module::from_bytes_with(name, data, resolver)?;
        info!("Loaded {} from memory ({})", module.name(), name);
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::AssemblyBuilder;

    #[test]
    fn missing_path() {
        let result = ModuleLoader::new().load_file(Path::new("/nonexistent/Game.dll"));
        assert!(matches!(result, Err(Error::ContainerNotFound(path)) if path.ends_with("Game.dll")));
    }

    #[test]
    fn own_directory_is_searched_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Game.dll");
        std::fs::write(&path, AssemblyBuilder::new("Game").build().unwrap()).unwrap();

        let module = ModuleLoader::new()
            .search_dir("/opt/managed")
            .load_file(&path)
            .unwrap();
        assert_eq!(
            module.resolver().search_dirs(),
            [dir.path().to_path_buf(), PathBuf::from("/opt/managed")]
        );
        assert_eq!(module.path(), Some(path.as_path()));
        assert_eq!(module.name(), "Game");
    }

    #[test]
    fn bytes_keep_their_label() {
        let data = AssemblyBuilder::new("Game").build().unwrap();
        let module = ModuleLoader::new().load_bytes("memory:Game", data).unwrap();
        assert_eq!(module.label(), "memory:Game");
        assert_eq!(module.name(), "Game");
        assert!(module.path().is_none());
    }

    #[test]
    fn not_an_image() {
        assert!(ModuleLoader::new()
            .load_bytes("garbage", vec![0x4D, 0x5A, 0x00])
            .is_err());
        assert!(matches!(
            ModuleLoader::new().load_bytes("empty", Vec::new()),
            Err(Error::Empty)
        ));
    }
}
