//! Minimal PE32 library images, built from scratch.
//!
//! [`AssemblyBuilder`] produces small but complete .NET DLLs: one `.text` section holding the
//! CLI header, the method bodies and the metadata. It exists so that fixtures for the loader,
//! the patches and the writer can be described in code instead of being checked in as binaries.
//!
//! Rows are numbered in the order they are added and the returned tokens are final. Methods and
//! fields have to be added in the order of their declaring types, because the `TypeDef` table
//! addresses them as contiguous runs.
//!
//! # Examples
//!
//! ```rust
//! use dotpatch::builder::AssemblyBuilder;
//! use dotpatch::metadata::signatures::{MethodSignature, TypeSig};
//!
//! let mut builder = AssemblyBuilder::new("Sample");
//! let mscorlib = builder.assembly_ref("mscorlib", [4, 0, 0, 0]);
//! let object = builder.type_ref(mscorlib, "System", "Object");
//! let program = builder.type_def("Sample", "Program", Some(object));
//! builder.method(
//!     program,
//!     "Main",
//!     0x0096,
//!     &MethodSignature::new_static(TypeSig::Void, Vec::new()),
//!     &[0x2A],
//! );
//!
//! let image = builder.build()?;
//! let module = dotpatch::Module::from_bytes("Sample.dll", image)?;
//! assert_eq!(module.name(), "Sample");
//! # Ok::<(), dotpatch::Error>(())
//! ```

mod image;

use std::collections::HashMap;

use sha1::{Digest, Sha1};

use crate::{
    metadata::{
        constant::ConstantValue,
        method::encode_method_body,
        signatures::{
            encode_field_signature, encode_method_signature, FieldSignature, MethodSignature,
            TypeName, TypeSig,
        },
        streams::{HeapAppender, HeapKind},
        tables::{
            AssemblyRaw, AssemblyRefRaw, ConstantRaw, ExportedTypeRaw, FieldRaw, MemberRefRaw,
            MethodDefRaw, ModuleRaw, NestedClassRaw, ParamRaw, TableId, TablesStream, TypeDefRaw,
            TypeRefRaw,
        },
        token::Token,
    },
    module::{metadata::join_namespace, symbols::ASSEMBLY_FLAG_PUBLIC_KEY},
    Error, Result,
};

use image::{ImageLayout, TextContent};

/// `TypeAttributes.Public | BeforeFieldInit`
const DEFAULT_TYPE_FLAGS: u32 = 0x0010_0001;
/// `TypeAttributes.VisibilityMask`
const VISIBILITY_MASK: u32 = 0x7;
/// `TypeAttributes.NestedPublic`
const NESTED_PUBLIC: u32 = 0x2;
/// `TypeAttributes.Forwarder`
const FORWARDER: u32 = 0x0020_0000;
/// `CALG_SHA1`
const HASH_ALGORITHM_SHA1: u32 = 0x8004;
/// Stack depth declared for bodies passed as plain code
const DEFAULT_MAX_STACK: u16 = 8;

#[derive(Debug, Clone)]
struct TypeEntry {
    namespace: String,
    name: String,
    flags: u32,
    extends: Option<Token>,
    enclosing: Option<u32>,
}

#[derive(Debug, Clone)]
enum BodySource {
    None,
    Encoded(Vec<u8>),
    SharedWith(u32),
}

#[derive(Debug, Clone)]
struct MethodEntry {
    owner: u32,
    name: String,
    flags: u32,
    signature: MethodSignature,
    body: BodySource,
    params: Vec<String>,
}

#[derive(Debug, Clone)]
struct FieldEntry {
    owner: u32,
    name: String,
    flags: u32,
    field_type: TypeSig,
    constant: Option<ConstantValue>,
}

#[derive(Debug, Clone)]
struct TypeRefEntry {
    scope: Token,
    namespace: String,
    name: String,
}

#[derive(Debug, Clone)]
struct MemberRefEntry {
    parent: Token,
    name: String,
    signature: MethodSignature,
}

#[derive(Debug, Clone)]
struct AssemblyRefEntry {
    name: String,
    version: [u16; 4],
    public_key_token: Option<[u8; 8]>,
}

#[derive(Debug, Clone)]
struct ExportedTypeEntry {
    namespace: String,
    name: String,
    implementation: Token,
}

/// Optional parts of the PE image, used to exercise the writer's header handling
#[derive(Debug, Clone, Default)]
pub(crate) struct ImageOptions {
    pub(crate) extra_sections: usize,
    pub(crate) debug_directory: bool,
    pub(crate) certificate: Option<Vec<u8>>,
    pub(crate) bound_import: bool,
    pub(crate) checksum: bool,
}

/// Builds a minimal .NET library image, see the [module documentation](self).
#[derive(Debug, Clone)]
pub struct AssemblyBuilder {
    name: String,
    version: [u16; 4],
    public_key: Option<Vec<u8>>,
    types: Vec<TypeEntry>,
    methods: Vec<MethodEntry>,
    fields: Vec<FieldEntry>,
    type_refs: Vec<TypeRefEntry>,
    member_refs: Vec<MemberRefEntry>,
    assembly_refs: Vec<AssemblyRefEntry>,
    exported_types: Vec<ExportedTypeEntry>,
    user_strings: HeapAppender,
    options: ImageOptions,
    order_violation: Option<String>,
}

impl AssemblyBuilder {
    /// An assembly called `name`, version 1.0.0.0, with only the `<Module>` type
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        AssemblyBuilder {
            name: name.into(),
            version: [1, 0, 0, 0],
            public_key: None,
            types: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            type_refs: Vec::new(),
            member_refs: Vec::new(),
            assembly_refs: Vec::new(),
            exported_types: Vec::new(),
            user_strings: HeapAppender::new(HeapKind::UserStrings, 0),
            options: ImageOptions::default(),
            order_violation: None,
        }
    }

    /// Set the assembly version
    pub fn version(&mut self, version: [u16; 4]) -> &mut Self {
        self.version = version;
        self
    }

    /// Give the assembly a strong name public key
    pub fn public_key(&mut self, key: &[u8]) -> &mut Self {
        self.public_key = Some(key.to_vec());
        self
    }

    /// Add `count` empty data sections after `.text`
    pub fn extra_sections(&mut self, count: usize) -> &mut Self {
        self.options.extra_sections = count;
        self
    }

    /// Add a CodeView debug directory whose record lives in `.text`
    pub fn debug_directory(&mut self) -> &mut Self {
        self.options.debug_directory = true;
        self
    }

    /// Append an attribute certificate (Authenticode) table holding `data`
    pub fn certificate(&mut self, data: &[u8]) -> &mut Self {
        self.options.certificate = Some(data.to_vec());
        self
    }

    /// Declare a bound import directory
    pub fn bound_import(&mut self) -> &mut Self {
        self.options.bound_import = true;
        self
    }

    /// Store a valid checksum in the optional header
    pub fn checksum(&mut self) -> &mut Self {
        self.options.checksum = true;
        self
    }

    /// Reference the assembly `name`
    #[allow(clippy::cast_possible_truncation)]
    pub fn assembly_ref(&mut self, name: &str, version: [u16; 4]) -> Token {
        self.assembly_refs.push(AssemblyRefEntry {
            name: name.to_string(),
            version,
            public_key_token: None,
        });
        Token::from_parts(TableId::AssemblyRef, self.assembly_refs.len() as u32)
    }

    /// Reference the assembly `name` with a public key token
    #[allow(clippy::cast_possible_truncation)]
    pub fn strong_assembly_ref(&mut self, name: &str, version: [u16; 4], token: [u8; 8]) -> Token {
        let reference = self.assembly_ref(name, version);
        if let Some(entry) = self.assembly_refs.last_mut() {
            entry.public_key_token = Some(token);
        }
        reference
    }

    /// Reference the type `namespace.name` through `scope`, an `AssemblyRef` or, for nested
    /// types, the enclosing `TypeRef`
    #[allow(clippy::cast_possible_truncation)]
    pub fn type_ref(&mut self, scope: Token, namespace: &str, name: &str) -> Token {
        self.type_refs.push(TypeRefEntry {
            scope,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Token::from_parts(TableId::TypeRef, self.type_refs.len() as u32)
    }

    /// Define a public class
    #[allow(clippy::cast_possible_truncation)]
    pub fn type_def(&mut self, namespace: &str, name: &str, extends: Option<Token>) -> Token {
        self.types.push(TypeEntry {
            namespace: namespace.to_string(),
            name: name.to_string(),
            flags: DEFAULT_TYPE_FLAGS,
            extends,
            enclosing: None,
        });
        // Row 1 is <Module>
        Token::from_parts(TableId::TypeDef, self.types.len() as u32 + 1)
    }

    /// Make `inner` a nested public type of `outer`
    pub fn nested_class(&mut self, inner: Token, outer: Token) -> &mut Self {
        if let Some(entry) = inner
            .row()
            .checked_sub(2)
            .and_then(|index| self.types.get_mut(index as usize))
        {
            entry.flags = (entry.flags & !VISIBILITY_MASK) | NESTED_PUBLIC;
            entry.enclosing = Some(outer.row());
        }
        self
    }

    fn check_order(&mut self, kind: &str, owner: Token, last: Option<u32>) {
        if last.is_some_and(|last| owner.row() < last) && self.order_violation.is_none() {
            self.order_violation = Some(format!(
                "{kind} of {owner} added after members of a later type"
            ));
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn push_method(&mut self, ty: Token, name: &str, flags: u32, signature: &MethodSignature, body: BodySource) -> Token {
        let last = self.methods.last().map(|method| method.owner);
        self.check_order("method", ty, last);
        self.methods.push(MethodEntry {
            owner: ty.row(),
            name: name.to_string(),
            flags,
            signature: signature.clone(),
            body,
            params: Vec::new(),
        });
        Token::from_parts(TableId::MethodDef, self.methods.len() as u32)
    }

    /// Define a method whose body is `code`, wrapped in the smallest header that fits.
    ///
    /// An empty `code` defines a method without body, as abstract or extern methods are.
    pub fn method(
        &mut self,
        ty: Token,
        name: &str,
        flags: u32,
        signature: &MethodSignature,
        code: &[u8],
    ) -> Token {
        let body = if code.is_empty() {
            BodySource::None
        } else {
            match encode_method_body(code, DEFAULT_MAX_STACK, 0, false, &[]) {
                Ok(body) => BodySource::Encoded(body),
                Err(error) => {
                    self.order_violation
                        .get_or_insert_with(|| format!("body of {name}: {error}"));
                    BodySource::None
                }
            }
        };
        self.push_method(ty, name, flags, signature, body)
    }

    /// Define a method with a complete encoded body (header, code and sections)
    pub fn method_with_body(
        &mut self,
        ty: Token,
        name: &str,
        flags: u32,
        signature: &MethodSignature,
        body: &[u8],
    ) -> Token {
        self.push_method(ty, name, flags, signature, BodySource::Encoded(body.to_vec()))
    }

    /// Define a method that uses the same body (and RVA) as `other`
    pub fn method_sharing_body(
        &mut self,
        ty: Token,
        name: &str,
        flags: u32,
        signature: &MethodSignature,
        other: Token,
    ) -> Token {
        self.push_method(ty, name, flags, signature, BodySource::SharedWith(other.row()))
    }

    /// Name the parameters of `method`, in declaration order
    pub fn param_names(&mut self, method: Token, names: &[&str]) -> &mut Self {
        if let Some(entry) = method
            .row()
            .checked_sub(1)
            .and_then(|index| self.methods.get_mut(index as usize))
        {
            entry.params = names.iter().map(|name| (*name).to_string()).collect();
        }
        self
    }

    /// Define a field, with an optional default value
    #[allow(clippy::cast_possible_truncation)]
    pub fn field(
        &mut self,
        ty: Token,
        name: &str,
        flags: u32,
        field_type: &TypeSig,
        constant: Option<ConstantValue>,
    ) -> Token {
        let last = self.fields.last().map(|field| field.owner);
        self.check_order("field", ty, last);
        self.fields.push(FieldEntry {
            owner: ty.row(),
            name: name.to_string(),
            flags,
            field_type: field_type.clone(),
            constant,
        });
        Token::from_parts(TableId::Field, self.fields.len() as u32)
    }

    /// Reference the method `name` of `parent`, a `TypeRef` or `TypeDef`
    #[allow(clippy::cast_possible_truncation)]
    pub fn member_ref(&mut self, parent: Token, name: &str, signature: &MethodSignature) -> Token {
        self.member_refs.push(MemberRefEntry {
            parent,
            name: name.to_string(),
            signature: signature.clone(),
        });
        Token::from_parts(TableId::MemberRef, self.member_refs.len() as u32)
    }

    /// Forward the type `namespace.name` to the assembly behind the `AssemblyRef` `implementation`
    #[allow(clippy::cast_possible_truncation)]
    pub fn exported_type(&mut self, namespace: &str, name: &str, implementation: Token) -> Token {
        self.exported_types.push(ExportedTypeEntry {
            namespace: namespace.to_string(),
            name: name.to_string(),
            implementation,
        });
        Token::from_parts(TableId::ExportedType, self.exported_types.len() as u32)
    }

    /// Add `value` to the user string heap and return its `ldstr` token
    pub fn user_string(&mut self, value: &str) -> Token {
        match self.user_strings.push_user_string(value) {
            Ok(offset) => Token::user_string(offset),
            Err(error) => {
                self.order_violation
                    .get_or_insert_with(|| format!("user string: {error}"));
                Token::new(0)
            }
        }
    }

    fn type_def_name(&self, index: usize) -> String {
        let mut names = Vec::new();
        let mut current = index;
        // Bounded by the number of types, so a malformed nesting cannot loop forever
        for _ in 0..=self.types.len() {
            let entry = &self.types[current];
            match entry
                .enclosing
                .and_then(|outer| outer.checked_sub(2))
                .map(|outer| outer as usize)
                .filter(|outer| *outer < self.types.len())
            {
                Some(outer) => {
                    names.push(entry.name.clone());
                    current = outer;
                }
                None => {
                    names.push(join_namespace(&entry.namespace, &entry.name));
                    break;
                }
            }
        }
        names.reverse();
        names.join("/")
    }

    fn type_ref_name(&self, index: usize) -> String {
        let mut names = Vec::new();
        let mut current = index;
        for _ in 0..=self.type_refs.len() {
            let entry = &self.type_refs[current];
            if entry.scope.is_table(TableId::TypeRef) && !entry.scope.is_null() {
                names.push(entry.name.clone());
                current = entry.scope.row() as usize - 1;
                continue;
            }
            names.push(join_namespace(&entry.namespace, &entry.name));
            break;
        }
        names.reverse();
        names.join("/")
    }

    /// Build the image.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if members were added out of type order, or
    /// [`Error::SymbolNotFound`] if a signature names a type that is neither defined nor
    /// referenced.
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Result<Vec<u8>> {
        if let Some(violation) = &self.order_violation {
            return Err(Error::NotSupported(violation.clone()));
        }

        let mut names: HashMap<String, Token> = HashMap::new();
        for index in (0..self.type_refs.len()).rev() {
            names.insert(
                self.type_ref_name(index),
                Token::from_parts(TableId::TypeRef, index as u32 + 1),
            );
        }
        for index in (0..self.types.len()).rev() {
            names.insert(
                self.type_def_name(index),
                Token::from_parts(TableId::TypeDef, index as u32 + 2),
            );
        }
        let mut provider = |name: &TypeName| -> Result<Token> {
            names
                .get(&name.full_name)
                .copied()
                .ok_or_else(|| Error::SymbolNotFound(format!("type {name} in builder")))
        };

        let mut strings = HeapAppender::new(HeapKind::Strings, 0);
        let mut blobs = HeapAppender::new(HeapKind::Blob, 0);
        let mut tables = TablesStream::new();

        let file_name = format!("{}.dll", self.name);
        tables.push_row(
            TableId::Module,
            &ModuleRaw {
                generation: 0,
                name: strings.push_string(&file_name),
                mvid: 1,
                encid: 0,
                encbaseid: 0,
            }
            .to_row()?,
        )?;

        for entry in &self.type_refs {
            let row = TypeRefRaw {
                rid: 0,
                resolution_scope: entry.scope,
                type_name: strings.push_string(&entry.name),
                type_namespace: strings.push_string(&entry.namespace),
            };
            tables.push_row(TableId::TypeRef, &row.to_row()?)?;
        }

        // Bodies go into .text first, so MethodDef rows can carry their RVAs
        let mut text = TextContent::new(&self.options);
        let mut rvas = Vec::with_capacity(self.methods.len());
        for entry in &self.methods {
            let rva = match &entry.body {
                BodySource::None => 0,
                BodySource::Encoded(body) => text.push_body(body),
                BodySource::SharedWith(other) => other
                    .checked_sub(1)
                    .and_then(|index| rvas.get(index as usize).copied())
                    .ok_or_else(|| {
                        Error::NotSupported(format!("{} shares a body not defined before it", entry.name))
                    })?,
            };
            rvas.push(rva);
        }

        let type_rows = self.types.len() as u32 + 1;
        // First member owned by `rid` or a later type, or one past the end if none is
        let first_member = |owners: &[u32], rid: u32| -> u32 {
            owners
                .iter()
                .position(|&owner| owner >= rid)
                .unwrap_or(owners.len()) as u32
                + 1
        };
        let field_owners: Vec<u32> = self.fields.iter().map(|field| field.owner).collect();
        let method_owners: Vec<u32> = self.methods.iter().map(|method| method.owner).collect();
        for rid in 1..=type_rows {
            let field_list = first_member(&field_owners, rid);
            let method_list = first_member(&method_owners, rid);

            let row = if rid == 1 {
                TypeDefRaw {
                    rid,
                    flags: 0,
                    type_name: strings.push_string("<Module>"),
                    type_namespace: 0,
                    extends: Token::new(0),
                    field_list,
                    method_list,
                }
            } else {
                let entry = &self.types[rid as usize - 2];
                TypeDefRaw {
                    rid,
                    flags: entry.flags,
                    type_name: strings.push_string(&entry.name),
                    type_namespace: strings.push_string(&entry.namespace),
                    extends: entry.extends.unwrap_or_default(),
                    field_list,
                    method_list,
                }
            };
            tables.push_row(TableId::TypeDef, &row.to_row()?)?;
        }

        let mut constants = Vec::new();
        for (index, entry) in self.fields.iter().enumerate() {
            let signature = encode_field_signature(
                &FieldSignature {
                    field_type: entry.field_type.clone(),
                },
                &mut provider,
            )?;
            let row = FieldRaw {
                rid: index as u32 + 1,
                flags: entry.flags,
                name: strings.push_string(&entry.name),
                signature: blobs.push_blob(&signature)?,
            };
            tables.push_row(TableId::Field, &row.to_row()?)?;

            if let Some(constant) = &entry.constant {
                constants.push(ConstantRaw {
                    rid: 0,
                    base: constant.element_type(),
                    parent: Token::from_parts(TableId::Field, index as u32 + 1),
                    value: blobs.push_blob(&constant.to_blob())?,
                });
            }
        }

        let mut param_rid = 1;
        let mut params = Vec::new();
        for (index, entry) in self.methods.iter().enumerate() {
            let signature = encode_method_signature(&entry.signature, &mut provider)?;
            let row = MethodDefRaw {
                rid: index as u32 + 1,
                rva: rvas[index],
                impl_flags: 0,
                flags: entry.flags,
                name: strings.push_string(&entry.name),
                signature: blobs.push_blob(&signature)?,
                param_list: param_rid,
            };
            tables.push_row(TableId::MethodDef, &row.to_row()?)?;

            for (sequence, name) in entry.params.iter().enumerate() {
                params.push(ParamRaw {
                    rid: param_rid,
                    flags: 0,
                    sequence: sequence as u32 + 1,
                    name: strings.push_string(name),
                });
                param_rid += 1;
            }
        }
        for param in &params {
            tables.push_row(TableId::Param, &param.to_row()?)?;
        }

        for entry in &self.member_refs {
            let signature = encode_method_signature(&entry.signature, &mut provider)?;
            let row = MemberRefRaw {
                rid: 0,
                class: entry.parent,
                name: strings.push_string(&entry.name),
                signature: blobs.push_blob(&signature)?,
            };
            tables.push_row(TableId::MemberRef, &row.to_row()?)?;
        }

        constants.sort_by_key(|constant| constant.parent);
        for constant in &constants {
            tables.push_row(TableId::Constant, &constant.to_row()?)?;
        }

        let mut nested: Vec<NestedClassRaw> = self
            .types
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                entry.enclosing.map(|outer| NestedClassRaw {
                    nested_class: index as u32 + 2,
                    enclosing_class: outer,
                })
            })
            .collect();
        nested.sort_by_key(|row| row.nested_class);
        for row in &nested {
            tables.push_row(TableId::NestedClass, &row.to_row()?)?;
        }

        let (flags, public_key) = match &self.public_key {
            Some(key) => (ASSEMBLY_FLAG_PUBLIC_KEY, blobs.push_blob(key)?),
            None => (0, 0),
        };
        let assembly = AssemblyRaw {
            hash_alg_id: HASH_ALGORITHM_SHA1,
            version: self.version,
            flags,
            public_key,
            name: strings.push_string(&self.name),
            culture: 0,
        };
        tables.push_row(TableId::Assembly, &assembly.to_row()?)?;

        for entry in &self.assembly_refs {
            let public_key_or_token = match &entry.public_key_token {
                Some(token) => blobs.push_blob(token)?,
                None => 0,
            };
            let row = AssemblyRefRaw {
                rid: 0,
                version: entry.version,
                flags: 0,
                public_key_or_token,
                name: strings.push_string(&entry.name),
                culture: 0,
                hash_value: 0,
            };
            tables.push_row(TableId::AssemblyRef, &row.to_row()?)?;
        }

        for entry in &self.exported_types {
            let row = ExportedTypeRaw {
                rid: 0,
                flags: FORWARDER,
                type_def_id: 0,
                type_name: strings.push_string(&entry.name),
                type_namespace: strings.push_string(&entry.namespace),
                implementation: entry.implementation,
            };
            tables.push_row(TableId::ExportedType, &row.to_row()?)?;
        }

        let mvid = Sha1::digest(self.name.as_bytes());
        let guid = &mvid[..16];
        tables.set_heap_lengths(strings.data().len(), guid.len(), blobs.data().len());

        text.set_metadata(image::metadata_blob(
            &tables.serialize(),
            strings.data(),
            self.user_strings.data(),
            guid,
            blobs.data(),
        ));

        ImageLayout::new(&self.options).assemble(&text)
    }
}
