//! Locating and caching referenced assemblies.
//!
//! A module that refers to `UnityEngine` expects `UnityEngine.dll` (or `.exe`) in one of the
//! search directories. Resolved modules are shared through an [`Arc`] and loaded at most once per
//! resolver, even when several threads ask for the same assembly.

use std::{path::PathBuf, sync::Arc};

use dashmap::DashMap;
use log::debug;

use crate::{
    metadata::{signatures::MethodSignature, token::Token},
    module::{
        symbols::{FieldDef, TypeDef},
        transaction::ExternalMethod,
        Module,
    },
    Error, Result,
};

/// How many `ExportedType` forwarders are followed before giving up
pub const MAX_FORWARDS: usize = 8;

/// File extensions tried for an assembly name, in order
const CANDIDATE_EXTENSIONS: [&str; 2] = ["dll", "exe"];

/// Finds dependency assemblies on a list of directories and caches the loaded modules.
#[derive(Debug, Default)]
pub struct AssemblyResolver {
    search_dirs: Vec<PathBuf>,
    cache: DashMap<String, Arc<Module>>,
}

impl AssemblyResolver {
    /// A resolver that searches `search_dirs` in order
    #[must_use]
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        AssemblyResolver {
            search_dirs,
            cache: DashMap::new(),
        }
    }

    /// The search directories, in lookup order
    #[must_use]
    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// An empty resolver over the same directories, used by the dependencies themselves so that
    /// cached modules do not keep their own resolver alive
    fn detached(&self) -> Self {
        AssemblyResolver::new(self.search_dirs.clone())
    }

    /// The first `<name>.dll` or `<name>.exe` that exists on the search path
    #[must_use]
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        self.search_dirs.iter().find_map(|dir| {
            CANDIDATE_EXTENSIONS
                .iter()
                .map(|extension| dir.join(format!("{name}.{extension}")))
                .find(|candidate| candidate.is_file())
        })
    }

    /// Add an already loaded module to the cache, replacing any earlier entry of the same name.
    ///
    /// Useful for dependencies that do not live on disk.
    pub fn insert(&self, module: Module) -> Arc<Module> {
        let module = Arc::new(module);
        self.cache
            .insert(module.name().to_ascii_lowercase(), Arc::clone(&module));
        module
    }

    /// True if `name` was resolved or inserted before
    #[must_use]
    pub fn is_cached(&self, name: &str) -> bool {
        self.cache.contains_key(&name.to_ascii_lowercase())
    }

    /// Load the assembly `name`, or return the cached module.
    ///
    /// # Errors
    /// Returns [`crate::Error::DependencyNotFound`] if no candidate file exists, or the error
    /// that stopped the candidate from loading.
    pub fn resolve(&self, name: &str) -> Result<Arc<Module>> {
        let key = name.to_ascii_lowercase();
        if let Some(module) = self.cache.get(&key) {
            return Ok(Arc::clone(module.value()));
        }

        let Some(path) = self.locate(name) else {
            return Err(Error::DependencyNotFound(format!(
                "{name} (searched {})",
                display_dirs(&self.search_dirs)
            )));
        };

        debug!("Resolving {} from {}", name, path.display());
        let module = Module::from_path(&path, Arc::new(self.detached()))?;

        // Another thread may have loaded the same assembly meanwhile; keep the first one
        let entry = self.cache.entry(key).or_insert_with(|| Arc::new(module));
        Ok(Arc::clone(entry.value()))
    }

    /// Find `full_name` in `assembly`, following type forwarders.
    ///
    /// # Errors
    /// - [`crate::Error::DependencyNotFound`] if an assembly on the way cannot be loaded
    /// - [`crate::Error::SymbolNotFound`] if the type is neither defined nor forwarded
    /// - [`crate::Error::RecursionLimit`] if more than [`MAX_FORWARDS`] forwarders are chained
    pub fn find_type(&self, assembly: &str, full_name: &str) -> Result<DependencyType> {
        let full_name = full_name.replace('+', "/");
        let mut current = assembly.to_string();

        for _ in 0..=MAX_FORWARDS {
            let module = self.resolve(&current)?;
            if let Some(ty) = module.type_by_name(&full_name) {
                let token = ty.token;
                return Ok(DependencyType { module, token });
            }

            match module.forwarded_to(&full_name)? {
                Some(target) => {
                    debug!("{} is forwarded from {} to {}", full_name, current, target);
                    current = target;
                }
                None => {
                    return Err(Error::SymbolNotFound(format!("{full_name} in {current}")));
                }
            }
        }

        Err(Error::RecursionLimit(MAX_FORWARDS))
    }
}

fn display_dirs(dirs: &[PathBuf]) -> String {
    if dirs.is_empty() {
        return "no directories".to_string();
    }

    dirs.iter()
        .map(|dir| dir.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A type defined in a dependency module.
#[derive(Debug, Clone)]
pub struct DependencyType {
    module: Arc<Module>,
    token: Token,
}

impl DependencyType {
    /// The module defining the type
    #[must_use]
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// The `TypeDef` token inside [`Self::module`]
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// The type definition.
    ///
    /// # Errors
    /// Never fails for a value returned by the resolver.
    pub fn definition(&self) -> Result<&TypeDef> {
        self.module.type_def(self.token)
    }

    /// The field `name` of this type
    ///
    /// # Errors
    /// Returns [`crate::Error::SymbolNotFound`] if there is no such field.
    pub fn field(&self, name: &str) -> Result<&FieldDef> {
        self.module.find_field(self.token, name)
    }

    /// Look up the method `name` with exactly `signature`, described for import into another
    /// module.
    ///
    /// # Errors
    /// Propagates the lookup errors of [`Module::find_method`].
    pub fn external_method(&self, name: &str, signature: &MethodSignature) -> Result<ExternalMethod> {
        let method = self.module.find_method(self.token, name, signature)?;
        ExternalMethod::from_dependency(&self.module, method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::AssemblyBuilder;

    #[test]
    fn missing_dependency() {
        let resolver = AssemblyResolver::new(vec![PathBuf::from("/nonexistent")]);
        assert!(resolver.locate("UnityEngine").is_none());
        assert!(matches!(
            resolver.resolve("UnityEngine"),
            Err(Error::DependencyNotFound(message)) if message.contains("/nonexistent")
        ));
    }

    #[test]
    fn locate_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = AssemblyBuilder::new("UnityEngine");
        builder.type_def("UnityEngine", "Debug", None);
        std::fs::write(dir.path().join("UnityEngine.dll"), builder.build().unwrap()).unwrap();

        let resolver = AssemblyResolver::new(vec![dir.path().to_path_buf()]);
        assert_eq!(
            resolver.locate("UnityEngine"),
            Some(dir.path().join("UnityEngine.dll"))
        );

        let first = resolver.resolve("UnityEngine").unwrap();
        let second = resolver.resolve("unityengine").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(resolver.is_cached("UNITYENGINE"));

        let debug = resolver.find_type("UnityEngine", "UnityEngine.Debug").unwrap();
        assert_eq!(debug.definition().unwrap().name, "Debug");
        assert!(matches!(
            resolver.find_type("UnityEngine", "UnityEngine.Missing"),
            Err(Error::SymbolNotFound(_))
        ));
    }

    #[test]
    fn forwarded_types() {
        let mut core = AssemblyBuilder::new("UnityEngine.CoreModule");
        core.type_def("UnityEngine", "Debug", None);

        let mut facade = AssemblyBuilder::new("UnityEngine");
        let target = facade.assembly_ref("UnityEngine.CoreModule", [0, 0, 0, 0]);
        facade.exported_type("UnityEngine", "Debug", target);

        let resolver = AssemblyResolver::default();
        resolver.insert(Module::from_bytes("UnityEngine.CoreModule", core.build().unwrap()).unwrap());
        resolver.insert(Module::from_bytes("UnityEngine", facade.build().unwrap()).unwrap());

        let debug = resolver.find_type("UnityEngine", "UnityEngine.Debug").unwrap();
        assert_eq!(debug.module().name(), "UnityEngine.CoreModule");
    }

    #[test]
    fn forwarder_cycle() {
        let mut a = AssemblyBuilder::new("A");
        let b_ref = a.assembly_ref("B", [1, 0, 0, 0]);
        a.exported_type("N", "T", b_ref);

        let mut b = AssemblyBuilder::new("B");
        let a_ref = b.assembly_ref("A", [1, 0, 0, 0]);
        b.exported_type("N", "T", a_ref);

        let resolver = AssemblyResolver::default();
        resolver.insert(Module::from_bytes("A", a.build().unwrap()).unwrap());
        resolver.insert(Module::from_bytes("B", b.build().unwrap()).unwrap());

        assert!(matches!(
            resolver.find_type("A", "N.T"),
            Err(Error::RecursionLimit(MAX_FORWARDS))
        ));
    }
}
