//! Lookups into the Unity engine assembly.

use log::{debug, error};

use crate::{
    metadata::signatures::{TypeName, TypeSig},
    module::{DependencyType, Module, TypeDef},
    Result,
};

/// Simple name of the engine assembly game code references
pub const UNITY_ENGINE: &str = "UnityEngine";

const SYSTEM_VALUE_TYPE: &str = "System.ValueType";

/// Find `full_name` in the `UnityEngine` assembly referenced by `module`.
///
/// Forwarders are followed, so on engine versions that split `UnityEngine` into modules the
/// returned type may live in e.g. `UnityEngine.CoreModule`.
///
/// # Errors
/// - [`crate::Error::DependencyNotFound`] if `module` does not reference `UnityEngine` or the
///   assembly is not on the search path
/// - [`crate::Error::SymbolNotFound`] if the engine does not define the type
pub fn find_unity_engine_type(module: &Module, full_name: &str) -> Result<DependencyType> {
    match module.find_dependency_type(UNITY_ENGINE, full_name) {
        Ok(found) => {
            debug!(
                "Resolved {} to {} in {}",
                full_name,
                found.token(),
                found.module().name()
            );
            Ok(found)
        }
        Err(err) => {
            error!("{} not found in {}: {}", full_name, UNITY_ENGINE, err);
            Err(err)
        }
    }
}

/// The signature element for `ty` of `module`: `valuetype` for enums and structs, `class`
/// otherwise. Types of dependencies are scoped to their assembly.
///
/// # Errors
/// Returns [`crate::Error::InvalidToken`] if `ty` is not defined by `module`.
pub(crate) fn type_sig(module: &Module, ty: &TypeDef) -> Result<TypeSig> {
    let is_value = ty
        .extends
        .as_ref()
        .is_some_and(|base| base.full_name == SYSTEM_VALUE_TYPE)
        || module.is_enum(ty.token)?;

    let name = TypeName::scoped(ty.full_name.as_str(), module.name());
    if is_value {
        Ok(TypeSig::ValueType(name))
    } else {
        Ok(TypeSig::Class(name))
    }
}

/// [`type_sig`] for a type of a dependency module
pub(crate) fn dependency_type_sig(ty: &DependencyType) -> Result<TypeSig> {
    type_sig(ty.module(), ty.definition()?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{builder::AssemblyBuilder, module::AssemblyResolver, Error};

    fn engine() -> Module {
        let mut builder = AssemblyBuilder::new(UNITY_ENGINE);
        let mscorlib = builder.assembly_ref("mscorlib", [2, 0, 0, 0]);
        let object = builder.type_ref(mscorlib, "System", "Object");
        let value_type = builder.type_ref(mscorlib, "System", "ValueType");
        builder.type_def("UnityEngine", "Object", Some(object));
        builder.type_def("UnityEngine", "Vector3", Some(value_type));
        Module::from_bytes(UNITY_ENGINE, builder.build().unwrap()).unwrap()
    }

    fn game(reference_engine: bool) -> Module {
        let mut builder = AssemblyBuilder::new("Assembly-CSharp");
        builder.assembly_ref("mscorlib", [2, 0, 0, 0]);
        if reference_engine {
            builder.assembly_ref(UNITY_ENGINE, [0, 0, 0, 0]);
        }
        let resolver = AssemblyResolver::default();
        resolver.insert(engine());
        Module::from_bytes_with("Assembly-CSharp.dll", builder.build().unwrap(), Arc::new(resolver))
            .unwrap()
    }

    #[test]
    fn engine_types() {
        let module = game(true);
        let object = find_unity_engine_type(&module, "UnityEngine.Object").unwrap();
        assert_eq!(object.definition().unwrap().name, "Object");
        assert_eq!(
            dependency_type_sig(&object).unwrap(),
            TypeSig::class("UnityEngine.Object")
        );

        let vector = find_unity_engine_type(&module, "UnityEngine.Vector3").unwrap();
        assert!(matches!(dependency_type_sig(&vector).unwrap(), TypeSig::ValueType(_)));

        assert!(matches!(
            find_unity_engine_type(&module, "UnityEngine.Missing"),
            Err(Error::SymbolNotFound(_))
        ));
    }

    #[test]
    fn foreign_type_is_rejected() {
        let module = game(true);
        let engine = engine();
        let object = engine.find_type("UnityEngine.Object").unwrap();
        assert!(matches!(
            type_sig(&module, object),
            Err(Error::InvalidToken(_))
        ));
        assert_eq!(
            type_sig(&engine, object).unwrap(),
            TypeSig::class("UnityEngine.Object")
        );
    }

    #[test]
    fn engine_not_referenced() {
        let module = game(false);
        assert!(matches!(
            find_unity_engine_type(&module, "UnityEngine.Object"),
            Err(Error::DependencyNotFound(_))
        ));
    }
}
