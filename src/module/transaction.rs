//! Staged changes to a [`Module`].
//!
//! A [`Transaction`] borrows the module immutably and collects everything a patch wants to
//! change: new `AssemblyRef`, `TypeRef` and `MemberRef` rows, heap entries, and finalized method
//! bodies. Lookups through the transaction see the staged rows as if they were committed, so a
//! patch can import a method and then call it in the same body. Nothing reaches the module until
//! [`Module::transaction`] commits, which only happens when the closure returned `Ok`.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotpatch::prelude::*;
//!
//! let mut module = ModuleLoader::new().load_file("Assembly-CSharp.dll".as_ref())?;
//! let ty = module.find_type("StoreManager")?.token;
//! let method = module.find_method_by_name(ty, "RequestPurchase")?.token;
//!
//! module.transaction(|tx| {
//!     let mut editor = tx.editor(method)?;
//!     editor.insert_at(0, Instruction::simple(OpCode::NOP))?;
//!     tx.replace_body(&editor)
//! })?;
//! # Ok::<(), dotpatch::Error>(())
//! ```

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::{
    assembly::{CallSiteInfo, FinalizedBody, InstructionEditor},
    metadata::{
        signatures::{
            encode_method_signature, MethodSignature, TypeName, TypeNameResolver, TypeSig,
            TypeTokenProvider,
        },
        streams::{HeapAppender, HeapKind},
        tables::{AssemblyRefRaw, CodedIndexType, MemberRefRaw, TableId, TypeRefRaw},
        token::Token,
    },
    module::{
        metadata::{call_signature, type_name, type_ref_name, RowSource},
        symbols::{AssemblyIdentity, MethodDef},
        Module,
    },
    Error, Result,
};

/// Largest offset a `#US` token can address
const MAX_USER_STRING_OFFSET: u32 = 0x00FF_FFFF;

/// A method of another assembly, described by name so it can be imported into any module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalMethod {
    /// Simple name of the defining assembly
    pub assembly: String,
    /// The declaring type, scoped to its assembly
    pub declaring_type: TypeName,
    /// Method name
    pub name: String,
    /// Exact signature
    pub signature: MethodSignature,
}

impl ExternalMethod {
    /// Describe `assembly`'s method `declaring_type::name`.
    ///
    /// Named types in `signature` that carry no scope are taken to live in `assembly` as well.
    #[must_use]
    pub fn new(
        assembly: impl Into<String>,
        declaring_type: &str,
        name: impl Into<String>,
        signature: MethodSignature,
    ) -> Self {
        let assembly = assembly.into();
        let mut signature = signature;
        rescope_signature(&mut signature, &assembly);
        ExternalMethod {
            declaring_type: TypeName::scoped(declaring_type, assembly.as_str()),
            assembly,
            name: name.into(),
            signature,
        }
    }

    /// Describe a method defined in the dependency `module`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidToken`] if `method` does not belong to `module`.
    pub fn from_dependency(module: &Module, method: &MethodDef) -> Result<Self> {
        let declaring = module.type_def(method.declaring_type)?;
        Ok(ExternalMethod::new(
            module.name(),
            &declaring.full_name,
            method.name.as_str(),
            method.signature.clone(),
        ))
    }
}

fn rescope_type(sig: &mut TypeSig, assembly: &str) {
    match sig {
        TypeSig::Class(name) | TypeSig::ValueType(name) => {
            if name.scope.is_none() {
                name.scope = Some(assembly.to_string());
            }
        }
        TypeSig::SzArray(inner)
        | TypeSig::Ptr(inner)
        | TypeSig::ByRef(inner)
        | TypeSig::Pinned(inner)
        | TypeSig::Array { base: inner, .. } => rescope_type(inner, assembly),
        TypeSig::GenericInst { base, args } => {
            rescope_type(base, assembly);
            for arg in args {
                rescope_type(arg, assembly);
            }
        }
        TypeSig::Modified { modifier, base, .. } => {
            if modifier.scope.is_none() {
                modifier.scope = Some(assembly.to_string());
            }
            rescope_type(base, assembly);
        }
        TypeSig::FnPtr(signature) => rescope_signature(signature, assembly),
        _ => {}
    }
}

fn rescope_signature(signature: &mut MethodSignature, assembly: &str) {
    rescope_type(&mut signature.return_type, assembly);
    for param in signature.params.iter_mut().chain(signature.varargs.iter_mut()) {
        rescope_type(param, assembly);
    }
}

/// Everything a successful transaction hands back to its module
pub(crate) struct Staged {
    pub(crate) rows: BTreeMap<TableId, Vec<Vec<u32>>>,
    pub(crate) strings: HeapAppender,
    pub(crate) blobs: HeapAppender,
    pub(crate) user_strings: HeapAppender,
    pub(crate) bodies: BTreeMap<Token, FinalizedBody>,
}

/// Pending changes to one module, see the [module documentation](self).
pub struct Transaction<'m> {
    module: &'m Module,
    rows: BTreeMap<TableId, Vec<Vec<u32>>>,
    strings: HeapAppender,
    blobs: HeapAppender,
    user_strings: HeapAppender,
    interned_strings: HashMap<String, u32>,
    interned_blobs: HashMap<Vec<u8>, u32>,
    identities: HashMap<String, AssemblyIdentity>,
    bodies: BTreeMap<Token, FinalizedBody>,
}

impl<'m> Transaction<'m> {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn new(module: &'m Module) -> Self {
        let metadata = module.metadata();
        Transaction {
            module,
            rows: BTreeMap::new(),
            strings: HeapAppender::new(HeapKind::Strings, metadata.strings.len() as u32),
            blobs: HeapAppender::new(HeapKind::Blob, metadata.blob.len() as u32),
            user_strings: HeapAppender::new(
                HeapKind::UserStrings,
                metadata.user_strings.len() as u32,
            ),
            interned_strings: HashMap::new(),
            interned_blobs: HashMap::new(),
            identities: HashMap::new(),
            bodies: BTreeMap::new(),
        }
    }

    pub(crate) fn into_staged(self) -> Staged {
        Staged {
            rows: self.rows,
            strings: self.strings,
            blobs: self.blobs,
            user_strings: self.user_strings,
            bodies: self.bodies,
        }
    }

    /// The module being changed, in its committed state
    #[must_use]
    pub fn module(&self) -> &'m Module {
        self.module
    }

    /// Use `identity` when an `AssemblyRef` for its name has to be created, instead of loading
    /// the assembly through the resolver
    pub fn register_assembly(&mut self, identity: AssemblyIdentity) {
        self.identities
            .insert(identity.name.to_ascii_lowercase(), identity);
    }

    /// An editor over the current body of `method`.
    ///
    /// If an earlier patch or an earlier step of this transaction already replaced the body, the
    /// editor starts from that body and offset anchors are rejected.
    ///
    /// # Errors
    /// - [`Error::NoMethodBody`] if the method has no IL body
    /// - any decoding error of the existing body
    pub fn editor(&self, method: Token) -> Result<InstructionEditor> {
        let definition = self.module.method(method)?;
        let returns_value = definition.returns_value();

        let rewritten = self
            .bodies
            .get(&method)
            .or_else(|| self.module.body(method));
        if let Some(body) = rewritten {
            let mut editor = InstructionEditor::from_body(
                definition.qualified_name.as_str(),
                method,
                returns_value,
                body.bytes(),
            )?;
            editor.invalidate_anchors();
            return Ok(editor);
        }

        let original = self.module.original_body(method)?;
        InstructionEditor::from_body(
            definition.qualified_name.as_str(),
            method,
            returns_value,
            original,
        )
    }

    /// Finalize `editor` against this transaction, so staged member references are known to the
    /// stack analysis.
    ///
    /// # Errors
    /// Propagates the errors of [`InstructionEditor::finalize`].
    pub fn finalize(&self, editor: &InstructionEditor) -> Result<FinalizedBody> {
        editor.finalize(self)
    }

    /// Stage `body` as the new body of its method.
    ///
    /// # Errors
    /// Returns [`Error::InvalidToken`] if the body belongs to no method of this module.
    pub fn set_body(&mut self, body: FinalizedBody) -> Result<()> {
        let method = self.module.method(body.method())?;
        debug!(
            "Staged body for {} ({} instructions, max stack {})",
            method.qualified_name,
            body.instruction_count(),
            body.max_stack()
        );
        self.bodies.insert(body.method(), body);
        Ok(())
    }

    /// Finalize `editor` and stage the result.
    ///
    /// # Errors
    /// Propagates the errors of [`Self::finalize`] and [`Self::set_body`].
    pub fn replace_body(&mut self, editor: &InstructionEditor) -> Result<()> {
        let body = self.finalize(editor)?;
        self.set_body(body)
    }

    /// Append `value` to the user string heap and return its `ldstr` token.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if the heap would grow beyond what a token can address.
    pub fn add_user_string(&mut self, value: &str) -> Result<Token> {
        let offset = self.user_strings.push_user_string(value)?;
        if offset > MAX_USER_STRING_OFFSET {
            return Err(Error::NotSupported(format!(
                "#US heap offset 0x{offset:x} cannot be addressed by a token"
            )));
        }
        Ok(Token::user_string(offset))
    }

    fn intern_string(&mut self, value: &str) -> u32 {
        if let Some(index) = self.module.metadata().strings.find(value) {
            return index;
        }
        if let Some(index) = self.interned_strings.get(value) {
            return *index;
        }

        let index = self.strings.push_string(value);
        self.interned_strings.insert(value.to_string(), index);
        index
    }

    fn intern_blob(&mut self, value: &[u8]) -> Result<u32> {
        if let Some(index) = self.module.metadata().blob.find(value) {
            return Ok(index);
        }
        if let Some(index) = self.interned_blobs.get(value) {
            return Ok(*index);
        }

        let index = self.blobs.push_blob(value)?;
        self.interned_blobs.insert(value.to_vec(), index);
        Ok(index)
    }

    fn stage_row(&mut self, table: TableId, values: Vec<u32>) -> Token {
        let rid = self.row_count(table) + 1;
        self.rows.entry(table).or_default().push(values);
        Token::from_parts(table, rid)
    }

    fn is_local_scope(&self, scope: Option<&str>) -> bool {
        scope.map_or(true, |scope| scope.eq_ignore_ascii_case(self.module.name()))
    }

    /// A token for `name` usable in this module: its own `TypeDef`, an existing `TypeRef`, or a
    /// new `TypeRef` (plus `AssemblyRef`) into the assembly named by the scope.
    ///
    /// # Errors
    /// - [`Error::SymbolNotFound`] if an unscoped name is neither defined nor referenced
    /// - [`Error::DependencyNotFound`] if the scope assembly cannot be resolved
    pub fn import_type(&mut self, name: &TypeName) -> Result<Token> {
        let scope = name.scope.as_deref();
        if self.is_local_scope(scope) {
            if let Some(ty) = self.module.type_by_name(&name.full_name) {
                return Ok(ty.token);
            }
        }

        let mut fallback = None;
        for rid in 1..=self.row_count(TableId::TypeRef) {
            let existing = type_ref_name(self, rid)?;
            if existing != *name {
                continue;
            }

            let token = Token::from_parts(TableId::TypeRef, rid);
            let same_scope = match (existing.scope.as_deref(), scope) {
                (Some(have), Some(want)) => have.eq_ignore_ascii_case(want),
                (_, None) => true,
                (None, Some(_)) => false,
            };
            if same_scope {
                return Ok(token);
            }
            fallback.get_or_insert(token);
        }
        if let Some(token) = fallback {
            return Ok(token);
        }

        let Some(scope) = scope else {
            return Err(Error::SymbolNotFound(format!(
                "type {} is neither defined nor referenced by {}",
                name.full_name,
                self.module.name()
            )));
        };

        let mut parent = self.assembly_ref(scope)?;
        let (namespace, names) = name.split();
        let namespace = namespace.to_string();
        let names: Vec<String> = names.into_iter().map(str::to_string).collect();
        for (depth, simple) in names.iter().enumerate() {
            let namespace = if depth == 0 { namespace.as_str() } else { "" };
            parent = match self.find_type_ref(parent, namespace, simple)? {
                Some(token) => token,
                None => {
                    let row = TypeRefRaw {
                        rid: 0,
                        resolution_scope: parent,
                        type_name: self.intern_string(simple),
                        type_namespace: self.intern_string(namespace),
                    }
                    .to_row()?;
                    self.stage_row(TableId::TypeRef, row)
                }
            };
        }

        debug!("Imported type {} as {}", name, parent);
        Ok(parent)
    }

    fn find_type_ref(&self, scope: Token, namespace: &str, name: &str) -> Result<Option<Token>> {
        for rid in 1..=self.row_count(TableId::TypeRef) {
            let row = self.row(TableId::TypeRef, rid)?;
            if CodedIndexType::ResolutionScope.decode(row[0])? == scope
                && self.string(row[1])? == name
                && self.string(row[2])? == namespace
            {
                return Ok(Some(Token::from_parts(TableId::TypeRef, rid)));
            }
        }
        Ok(None)
    }

    /// The `AssemblyRef` for `name`, staging a new row if the module has none.
    ///
    /// # Errors
    /// Returns [`Error::DependencyNotFound`] if the assembly was not registered and the resolver
    /// cannot load it.
    pub fn assembly_ref(&mut self, name: &str) -> Result<Token> {
        for rid in 1..=self.row_count(TableId::AssemblyRef) {
            let row = self.row(TableId::AssemblyRef, rid)?;
            if self.string(row[6])?.eq_ignore_ascii_case(name) {
                return Ok(Token::from_parts(TableId::AssemblyRef, rid));
            }
        }

        let identity = match self.identities.get(&name.to_ascii_lowercase()) {
            Some(identity) => identity.clone(),
            None => {
                let dependency = self.module.resolver().resolve(name)?;
                dependency
                    .assembly()
                    .cloned()
                    .unwrap_or_else(|| AssemblyIdentity::new(dependency.name(), [0; 4]))
            }
        };

        let public_key_or_token = match identity.public_key_token {
            Some(token) => self.intern_blob(&token)?,
            None => 0,
        };
        let row = AssemblyRefRaw {
            rid: 0,
            version: identity.version,
            flags: 0,
            public_key_or_token,
            name: self.intern_string(&identity.name),
            culture: self.intern_string(&identity.culture),
            hash_value: 0,
        }
        .to_row()?;

        let token = self.stage_row(TableId::AssemblyRef, row);
        debug!("Added reference to {} as {}", identity, token);
        Ok(token)
    }

    /// A token that calls `method` from this module.
    ///
    /// Methods of this module resolve to their `MethodDef`. Otherwise an existing `MemberRef`
    /// with the same parent, name and signature blob is reused, and only if there is none the
    /// missing `AssemblyRef`, `TypeRef` and `MemberRef` rows are staged.
    ///
    /// # Errors
    /// Propagates the errors of [`Self::import_type`] and of the local method lookup.
    pub fn import_method(&mut self, method: &ExternalMethod) -> Result<Token> {
        let declaring = &method.declaring_type;
        if self.is_local_scope(declaring.scope.as_deref()) {
            if let Some(ty) = self.module.type_by_name(&declaring.full_name) {
                let token = ty.token;
                return Ok(self
                    .module
                    .find_method(token, &method.name, &method.signature)?
                    .token);
            }
        }

        let parent = self.import_type(declaring)?;
        let signature = encode_method_signature(&method.signature, self)?;

        for rid in 1..=self.row_count(TableId::MemberRef) {
            let row = self.row(TableId::MemberRef, rid)?;
            if CodedIndexType::MemberRefParent.decode(row[0])? == parent
                && self.string(row[1])? == method.name
                && self.blob(row[2])? == signature.as_slice()
            {
                return Ok(Token::from_parts(TableId::MemberRef, rid));
            }
        }

        let row = MemberRefRaw {
            rid: 0,
            class: parent,
            name: self.intern_string(&method.name),
            signature: self.intern_blob(&signature)?,
        }
        .to_row()?;
        let token = self.stage_row(TableId::MemberRef, row);
        debug!(
            "Imported {}::{} as {}",
            declaring.full_name, method.name, token
        );
        Ok(token)
    }
}

impl RowSource for Transaction<'_> {
    fn row(&self, table: TableId, rid: u32) -> Result<&[u32]> {
        let committed = self.module.metadata().tables.row_count(table);
        if rid <= committed {
            return self.module.metadata().tables.row(table, rid);
        }

        self.rows
            .get(&table)
            .and_then(|rows| rows.get((rid - committed - 1) as usize))
            .map(Vec::as_slice)
            .ok_or(Error::InvalidToken(Token::from_parts(table, rid)))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn row_count(&self, table: TableId) -> u32 {
        let staged = self.rows.get(&table).map_or(0, Vec::len) as u32;
        self.module.metadata().tables.row_count(table) + staged
    }

    fn string(&self, index: u32) -> Result<&str> {
        if self.strings.contains(index) {
            self.strings.get_string(index)
        } else {
            self.module.metadata().strings.get(index as usize)
        }
    }

    fn blob(&self, index: u32) -> Result<&[u8]> {
        if self.blobs.contains(index) {
            self.blobs.get_blob(index)
        } else {
            self.module.metadata().blob.get(index as usize)
        }
    }

    fn enclosing(&self, type_def: u32) -> Option<u32> {
        self.module.metadata().enclosing_type(type_def)
    }
}

impl TypeNameResolver for Transaction<'_> {
    fn resolve_type_name(&self, token: Token) -> Result<TypeName> {
        type_name(self, token)
    }
}

impl CallSiteInfo for Transaction<'_> {
    fn call_signature(&self, token: Token) -> Result<MethodSignature> {
        call_signature(self, token, 0)
    }
}

impl TypeTokenProvider for Transaction<'_> {
    fn type_token(&mut self, name: &TypeName) -> Result<Token> {
        self.import_type(name)
    }
}
