//! Symbol lookup on a [`Module`].
//!
//! Lookups are exact. Methods are matched by name and full signature, and a query that could
//! silently pick one of several members fails with [`Error::AmbiguousSymbol`] instead.

use crate::{
    metadata::{
        signatures::MethodSignature,
        tables::{ExportedTypeRaw, TableId},
        token::Token,
    },
    module::{
        metadata::join_namespace,
        resolver::DependencyType,
        symbols::{FieldDef, MethodDef, TypeDef},
        Module,
    },
    Error, Result,
};

/// Full name of the base type of every enum
const SYSTEM_ENUM: &str = "System.Enum";

impl Module {
    pub(crate) fn type_by_name(&self, full_name: &str) -> Option<&TypeDef> {
        self.type_index
            .get(full_name)
            .and_then(|index| self.types.get(*index))
    }

    /// Find a type by its full name.
    ///
    /// Nested types are separated with `/`; the reflection form `Outer+Inner` is accepted too.
    ///
    /// # Errors
    /// Returns [`Error::SymbolNotFound`] if the module defines no such type.
    pub fn find_type(&self, full_name: &str) -> Result<&TypeDef> {
        let normalized = full_name.replace('+', "/");
        self.type_by_name(&normalized)
            .ok_or_else(|| Error::SymbolNotFound(format!("type {full_name} in {}", self.name())))
    }

    /// Find the type `name` nested directly inside `outer`.
    ///
    /// # Errors
    /// Returns [`Error::SymbolNotFound`] if `outer` has no such nested type.
    pub fn find_nested_type(&self, outer: Token, name: &str) -> Result<&TypeDef> {
        let outer = self.type_def(outer)?;
        self.type_by_name(&format!("{}/{}", outer.full_name, name))
            .ok_or_else(|| {
                Error::SymbolNotFound(format!("nested type {}/{}", outer.full_name, name))
            })
    }

    /// Find the method `name` of `ty` whose signature equals `signature`.
    ///
    /// # Errors
    /// - [`Error::SymbolNotFound`] if `ty` has no method called `name`
    /// - [`Error::SignatureMismatch`] if none of the overloads has `signature`
    /// - [`Error::AmbiguousSymbol`] if several definitions match, which only a damaged image has
    pub fn find_method(
        &self,
        ty: Token,
        name: &str,
        signature: &MethodSignature,
    ) -> Result<&MethodDef> {
        let owner = self.type_def(ty)?;
        let candidates = self.methods_named(owner, name)?;
        if candidates.is_empty() {
            return Err(Error::SymbolNotFound(format!(
                "method {}::{}",
                owner.full_name, name
            )));
        }

        let mut exact = candidates
            .iter()
            .filter(|method| method.signature == *signature);
        match (exact.next(), exact.next()) {
            (Some(method), None) => Ok(method),
            (Some(_), Some(_)) => Err(Error::AmbiguousSymbol(format!(
                "{}::{} {}",
                owner.full_name, name, signature
            ))),
            (None, _) => Err(Error::SignatureMismatch {
                member: format!("{}::{}", owner.full_name, name),
                signature: signature.to_string(),
                candidates: candidates.len(),
            }),
        }
    }

    /// Find the only method of `ty` called `name`, whatever its signature.
    ///
    /// # Errors
    /// - [`Error::SymbolNotFound`] if there is none
    /// - [`Error::AmbiguousSymbol`] if `name` is overloaded
    pub fn find_method_by_name(&self, ty: Token, name: &str) -> Result<&MethodDef> {
        let owner = self.type_def(ty)?;
        match self.methods_named(owner, name)?.as_slice() {
            [] => Err(Error::SymbolNotFound(format!(
                "method {}::{}",
                owner.full_name, name
            ))),
            [method] => Ok(method),
            overloads => Err(Error::AmbiguousSymbol(format!(
                "{}::{} has {} overloads",
                owner.full_name,
                name,
                overloads.len()
            ))),
        }
    }

    fn methods_named(&self, owner: &TypeDef, name: &str) -> Result<Vec<&MethodDef>> {
        let mut methods = Vec::new();
        for token in &owner.methods {
            let method = self.method(*token)?;
            if method.name == name {
                methods.push(method);
            }
        }
        Ok(methods)
    }

    /// Find the field `name` of `ty`.
    ///
    /// # Errors
    /// Returns [`Error::SymbolNotFound`] if `ty` has no such field.
    pub fn find_field(&self, ty: Token, name: &str) -> Result<&FieldDef> {
        let owner = self.type_def(ty)?;
        for token in &owner.fields {
            let field = self.field(*token)?;
            if field.name == name {
                return Ok(field);
            }
        }

        Err(Error::SymbolNotFound(format!(
            "field {}::{}",
            owner.full_name, name
        )))
    }

    /// True if `ty` derives from `System.Enum`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidToken`] if `ty` is not a type of this module.
    pub fn is_enum(&self, ty: Token) -> Result<bool> {
        Ok(self
            .type_def(ty)?
            .extends
            .as_ref()
            .is_some_and(|base| base.full_name == SYSTEM_ENUM))
    }

    /// Find `full_name` in the referenced assembly `assembly`.
    ///
    /// The assembly must be referenced by this module. Type forwarders of the dependency are
    /// followed.
    ///
    /// # Errors
    /// - [`Error::DependencyNotFound`] if the module does not reference `assembly`, or its file
    ///   cannot be found on the search path
    /// - [`Error::SymbolNotFound`] if the dependency does not define the type
    pub fn find_dependency_type(&self, assembly: &str, full_name: &str) -> Result<DependencyType> {
        let referenced = self
            .assembly_refs
            .iter()
            .any(|reference| reference.identity.name.eq_ignore_ascii_case(assembly));
        if !referenced {
            return Err(Error::DependencyNotFound(format!(
                "{} does not reference {}",
                self.name(),
                assembly
            )));
        }

        self.resolver.find_type(assembly, full_name)
    }

    /// Name of the assembly an `ExportedType` row forwards `full_name` to.
    ///
    /// For a nested type the forwarder of its outermost type decides.
    pub(crate) fn forwarded_to(&self, full_name: &str) -> Result<Option<String>> {
        let outer = full_name.split('/').next().unwrap_or(full_name);
        let tables = &self.metadata.tables;

        for rid in 1..=tables.row_count(TableId::ExportedType) {
            let row = ExportedTypeRaw::read(tables, rid)?;
            if !row.implementation.is_table(TableId::AssemblyRef) || row.implementation.is_null() {
                continue;
            }

            let name = join_namespace(
                self.metadata.strings.get(row.type_namespace as usize)?,
                self.metadata.strings.get(row.type_name as usize)?,
            );
            if name != outer {
                continue;
            }

            let assembly = tables.row(TableId::AssemblyRef, row.implementation.row())?;
            return Ok(Some(self.metadata.strings.get(assembly[6] as usize)?.to_string()));
        }

        Ok(None)
    }
}
