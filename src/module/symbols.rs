//! Types, methods, fields and assembly identities of a loaded module.
//!
//! The symbol model is built once when a module is loaded and is read-only afterwards: patches
//! only ever replace method bodies and add reference rows, neither of which changes the shape of
//! a definition.

use std::{collections::HashMap, fmt};

use sha1::{Digest, Sha1};

use crate::{
    metadata::{
        attributes::{FieldAttributes, TypeAttributes},
        constant::ConstantValue,
        method::{MethodImplFlags, MethodModifiers},
        signatures::{FieldSignature, MethodSignature, TypeName},
        tables::{
            AssemblyRaw, AssemblyRefRaw, ConstantRaw, FieldRaw, MethodDefRaw, ParamRaw, TableId,
            TypeDefRaw,
        },
        token::Token,
    },
    module::metadata::{type_name, Metadata},
    Error, Result,
};

/// `AssemblyFlags.PublicKey`: the reference holds a full public key instead of a token
pub const ASSEMBLY_FLAG_PUBLIC_KEY: u32 = 0x0001;

/// Public key token of `public_key`: the last eight bytes of its SHA-1 hash, reversed
#[must_use]
pub fn public_key_token(public_key: &[u8]) -> [u8; 8] {
    let hash = Sha1::digest(public_key);
    let mut token = [0u8; 8];
    for (target, source) in token.iter_mut().zip(hash[12..20].iter().rev()) {
        *target = *source;
    }
    token
}

/// Name, version, culture and public key token of an assembly
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssemblyIdentity {
    /// Simple name, e.g. `UnityEngine`
    pub name: String,
    /// Major, minor, build, revision
    pub version: [u16; 4],
    /// Culture, empty for neutral assemblies
    pub culture: String,
    /// Public key token of a strong-named assembly
    pub public_key_token: Option<[u8; 8]>,
}

impl AssemblyIdentity {
    /// A culture-neutral identity without public key
    #[must_use]
    pub fn new(name: impl Into<String>, version: [u16; 4]) -> Self {
        AssemblyIdentity {
            name: name.into(),
            version,
            culture: String::new(),
            public_key_token: None,
        }
    }

    /// Set the public key token
    #[must_use]
    pub fn with_public_key_token(mut self, token: [u8; 8]) -> Self {
        self.public_key_token = Some(token);
        self
    }
}

impl fmt::Display for AssemblyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, build, revision] = self.version;
        write!(f, "{}, Version={major}.{minor}.{build}.{revision}", self.name)?;
        let culture = if self.culture.is_empty() {
            "neutral"
        } else {
            &self.culture
        };
        write!(f, ", Culture={culture}, PublicKeyToken=")?;
        match self.public_key_token {
            Some(token) => token.iter().try_for_each(|byte| write!(f, "{byte:02x}")),
            None => f.write_str("null"),
        }
    }
}

/// An `AssemblyRef` row of a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyReference {
    /// `AssemblyRef` token
    pub token: Token,
    /// The referenced identity
    pub identity: AssemblyIdentity,
}

/// A type definition
#[derive(Debug, Clone)]
pub struct TypeDef {
    /// `TypeDef` token
    pub token: Token,
    /// Namespace, empty for nested types and the global namespace
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// `Namespace.Name`, nested types joined with `/`
    pub full_name: String,
    /// Type attributes, unknown bits kept
    pub flags: TypeAttributes,
    /// Base type, `None` for interfaces and `System.Object`
    pub extends: Option<TypeName>,
    /// Enclosing type of a nested type
    pub enclosing: Option<Token>,
    /// Fields in declaration order
    pub fields: Vec<Token>,
    /// Methods in declaration order
    pub methods: Vec<Token>,
}

/// A method definition
#[derive(Debug, Clone)]
pub struct MethodDef {
    /// `MethodDef` token
    pub token: Token,
    /// Simple name
    pub name: String,
    /// `Type::Name`, used in messages
    pub qualified_name: String,
    /// Declaring `TypeDef`
    pub declaring_type: Token,
    /// Attributes without the access mask
    pub flags: MethodModifiers,
    /// Raw `MethodAttributes`
    pub raw_flags: u32,
    /// Implementation flags
    pub impl_flags: MethodImplFlags,
    /// RVA of the body, 0 if there is none
    pub rva: u32,
    /// Decoded signature
    pub signature: MethodSignature,
    /// Parameter names by position, empty where the `Param` table has no row
    pub params: Vec<String>,
}

impl MethodDef {
    /// Argument slot of the parameter `name`, counting the implicit `this`
    #[must_use]
    pub fn arg_slot(&self, name: &str) -> Option<u16> {
        let position = self.params.iter().position(|param| param == name)?;
        let slot = position + usize::from(self.signature.has_this);
        u16::try_from(slot).ok()
    }

    /// True if the method returns a value
    #[must_use]
    pub fn returns_value(&self) -> bool {
        !self.signature.return_type.is_void()
    }

    /// True if the method has an IL body in the image
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.rva != 0
    }
}

/// A field definition
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// `Field` token
    pub token: Token,
    /// Simple name
    pub name: String,
    /// `Type::Name`, used in messages
    pub qualified_name: String,
    /// Declaring `TypeDef`
    pub declaring_type: Token,
    /// Field attributes including the access bits
    pub flags: FieldAttributes,
    /// Decoded signature
    pub signature: FieldSignature,
    /// Default value from the `Constant` table
    pub constant: Option<ConstantValue>,
}

macro_rules! constant_accessor {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $ty:ty) => {
        $(#[$doc])*
        ///
        /// # Errors
        /// Returns [`crate::Error::ConstantTypeMismatch`] if the field has no constant of that type.
        pub fn $name(&self) -> Result<$ty> {
            match &self.constant {
                Some(ConstantValue::$variant(value)) => Ok(value.clone()),
                other => Err(self.mismatch(stringify!($variant), other.as_ref())),
            }
        }
    };
}

impl FieldDef {
    fn mismatch(&self, expected: &str, found: Option<&ConstantValue>) -> Error {
        Error::ConstantTypeMismatch {
            field: self.qualified_name.clone(),
            expected: expected.to_string(),
            found: found.map_or("no constant", ConstantValue::type_name).to_string(),
        }
    }

    constant_accessor!(
        /// The `int32` constant, e.g. the value of an enum member backed by `int`
        as_i32, I4, i32
    );
    constant_accessor!(
        /// The `int64` constant
        as_i64, I8, i64
    );
    constant_accessor!(
        /// The `bool` constant
        as_bool, Boolean, bool
    );
    constant_accessor!(
        /// The string constant
        as_string, String, String
    );
}

/// Everything the symbol model is built from
pub(crate) struct Symbols {
    pub(crate) types: Vec<TypeDef>,
    pub(crate) methods: Vec<MethodDef>,
    pub(crate) fields: Vec<FieldDef>,
    pub(crate) assembly: Option<AssemblyIdentity>,
    pub(crate) assembly_refs: Vec<AssemblyReference>,
}

/// Resolve the member list of `table` through its pointer table, if the module has one
fn member_list(
    metadata: &Metadata,
    table: TableId,
    pointer: TableId,
    start: u32,
    end: u32,
) -> Result<Vec<u32>> {
    let tables = &metadata.tables;
    let uses_pointer = tables.row_count(pointer) > 0;
    let limit = if uses_pointer {
        tables.row_count(pointer)
    } else {
        tables.row_count(table)
    };

    let mut rids = Vec::new();
    for index in start..end.min(limit + 1) {
        if index == 0 {
            continue;
        }
        let rid = if uses_pointer {
            tables.value(pointer, index, 0)?
        } else {
            index
        };
        rids.push(rid);
    }
    Ok(rids)
}

/// End (exclusive) of the list that starts in column `column` of `TypeDef` row `rid`
fn list_end(metadata: &Metadata, rid: u32, column: usize, table: TableId, pointer: TableId) -> Result<u32> {
    let tables = &metadata.tables;
    if rid < tables.row_count(TableId::TypeDef) {
        return tables.value(TableId::TypeDef, rid + 1, column);
    }

    let count = if tables.row_count(pointer) > 0 {
        tables.row_count(pointer)
    } else {
        tables.row_count(table)
    };
    Ok(count + 1)
}

pub(crate) fn assembly_identity(metadata: &Metadata) -> Result<Option<AssemblyIdentity>> {
    if metadata.tables.row_count(TableId::Assembly) == 0 {
        return Ok(None);
    }

    let row = AssemblyRaw::read(&metadata.tables, 1)?;
    let public_key = metadata.blob.get(row.public_key as usize)?;
    Ok(Some(AssemblyIdentity {
        name: metadata.strings.get(row.name as usize)?.to_string(),
        version: row.version,
        culture: metadata.strings.get(row.culture as usize)?.to_string(),
        public_key_token: (!public_key.is_empty()).then(|| public_key_token(public_key)),
    }))
}

pub(crate) fn assembly_references(metadata: &Metadata) -> Result<Vec<AssemblyReference>> {
    let mut references = Vec::new();
    for rid in 1..=metadata.tables.row_count(TableId::AssemblyRef) {
        let row = AssemblyRefRaw::read(&metadata.tables, rid)?;
        let key = metadata.blob.get(row.public_key_or_token as usize)?;
        let public_key_token = if key.is_empty() {
            None
        } else if row.flags & ASSEMBLY_FLAG_PUBLIC_KEY != 0 {
            Some(public_key_token(key))
        } else {
            <[u8; 8]>::try_from(key).ok()
        };

        references.push(AssemblyReference {
            token: Token::from_parts(TableId::AssemblyRef, rid),
            identity: AssemblyIdentity {
                name: metadata.strings.get(row.name as usize)?.to_string(),
                version: row.version,
                culture: metadata.strings.get(row.culture as usize)?.to_string(),
                public_key_token,
            },
        });
    }
    Ok(references)
}

fn constants(metadata: &Metadata) -> Result<HashMap<Token, ConstantValue>> {
    let mut constants = HashMap::new();
    for rid in 1..=metadata.tables.row_count(TableId::Constant) {
        let row = ConstantRaw::read(&metadata.tables, rid)?;
        if !row.parent.is_table(TableId::Field) {
            continue;
        }
        let value = ConstantValue::parse(row.base, metadata.blob.get(row.value as usize)?)?;
        constants.insert(row.parent, value);
    }
    Ok(constants)
}

fn param_names(metadata: &Metadata, method: &MethodDefRaw, count: usize) -> Result<Vec<String>> {
    let tables = &metadata.tables;
    let end = if method.rid < tables.row_count(TableId::MethodDef) {
        tables.value(TableId::MethodDef, method.rid + 1, 5)?
    } else if tables.row_count(TableId::ParamPtr) > 0 {
        tables.row_count(TableId::ParamPtr) + 1
    } else {
        tables.row_count(TableId::Param) + 1
    };

    let mut names = vec![String::new(); count];
    for rid in member_list(metadata, TableId::Param, TableId::ParamPtr, method.param_list, end)? {
        let param = ParamRaw::read(tables, rid)?;
        if let Some(slot) = (param.sequence as usize)
            .checked_sub(1)
            .and_then(|index| names.get_mut(index))
        {
            *slot = metadata.strings.get(param.name as usize)?.to_string();
        }
    }
    Ok(names)
}

/// Build the symbol model of `metadata`.
pub(crate) fn build(metadata: &Metadata) -> Result<Symbols> {
    let tables = &metadata.tables;
    let constants = constants(metadata)?;

    let type_count = tables.row_count(TableId::TypeDef);
    let mut types = Vec::with_capacity(type_count as usize);
    let mut method_owner = HashMap::new();
    let mut field_owner = HashMap::new();

    for rid in 1..=type_count {
        let row = TypeDefRaw::read(tables, rid)?;
        let token = Token::from_parts(TableId::TypeDef, rid);

        let methods_end = list_end(metadata, rid, 5, TableId::MethodDef, TableId::MethodPtr)?;
        let methods: Vec<Token> =
            member_list(metadata, TableId::MethodDef, TableId::MethodPtr, row.method_list, methods_end)?
                .into_iter()
                .map(|method| Token::from_parts(TableId::MethodDef, method))
                .collect();

        let fields_end = list_end(metadata, rid, 4, TableId::Field, TableId::FieldPtr)?;
        let fields: Vec<Token> =
            member_list(metadata, TableId::Field, TableId::FieldPtr, row.field_list, fields_end)?
                .into_iter()
                .map(|field| Token::from_parts(TableId::Field, field))
                .collect();

        for method in &methods {
            method_owner.insert(*method, token);
        }
        for field in &fields {
            field_owner.insert(*field, token);
        }

        let extends = if row.extends.is_null() || row.extends.is_table(TableId::TypeSpec) {
            None
        } else {
            Some(type_name(metadata, row.extends)?)
        };

        types.push(TypeDef {
            token,
            namespace: metadata.strings.get(row.type_namespace as usize)?.to_string(),
            name: metadata.strings.get(row.type_name as usize)?.to_string(),
            full_name: metadata.type_def_name(rid)?,
            flags: TypeAttributes::from_bits_retain(row.flags),
            extends,
            enclosing: metadata
                .enclosing_type(rid)
                .map(|outer| Token::from_parts(TableId::TypeDef, outer)),
            fields,
            methods,
        });
    }

    let owner_name = |owner: Option<&Token>| -> &str {
        owner
            .and_then(|token| types.get(token.row() as usize - 1))
            .map_or("<unknown>", |ty| ty.full_name.as_str())
    };

    let mut methods = Vec::with_capacity(tables.row_count(TableId::MethodDef) as usize);
    for rid in 1..=tables.row_count(TableId::MethodDef) {
        let row = MethodDefRaw::read(tables, rid)?;
        let token = Token::from_parts(TableId::MethodDef, rid);
        let name = metadata.strings.get(row.name as usize)?.to_string();
        let signature = metadata.method_signature(row.signature)?;
        let owner = method_owner.get(&token);

        methods.push(MethodDef {
            token,
            qualified_name: format!("{}::{}", owner_name(owner), name),
            name,
            declaring_type: owner.copied().unwrap_or_default(),
            flags: MethodModifiers::from_bits_truncate(row.flags),
            raw_flags: row.flags,
            impl_flags: MethodImplFlags::from_bits_truncate(row.impl_flags),
            rva: row.rva,
            params: param_names(metadata, &row, signature.params.len())?,
            signature,
        });
    }

    let mut fields = Vec::with_capacity(tables.row_count(TableId::Field) as usize);
    for rid in 1..=tables.row_count(TableId::Field) {
        let row = FieldRaw::read(tables, rid)?;
        let token = Token::from_parts(TableId::Field, rid);
        let name = metadata.strings.get(row.name as usize)?.to_string();
        let owner = field_owner.get(&token);

        fields.push(FieldDef {
            token,
            qualified_name: format!("{}::{}", owner_name(owner), name),
            name,
            declaring_type: owner.copied().unwrap_or_default(),
            flags: FieldAttributes::from_bits_retain(row.flags),
            signature: metadata.field_signature(row.signature)?,
            constant: constants.get(&token).cloned(),
        });
    }

    Ok(Symbols {
        types,
        methods,
        fields,
        assembly: assembly_identity(metadata)?,
        assembly_refs: assembly_references(metadata)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::signatures::TypeSig;

    #[test]
    fn token_from_public_key() {
        // ECMA standard public key, whose token is b77a5c561934e089
        #[rustfmt::skip]
        let ecma_key = [
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(
            public_key_token(&ecma_key),
            [0xb7, 0x7a, 0x5c, 0x56, 0x19, 0x34, 0xe0, 0x89]
        );
    }

    #[test]
    fn identity_display() {
        let identity = AssemblyIdentity::new("UnityEngine", [0, 0, 0, 0]);
        assert_eq!(
            identity.to_string(),
            "UnityEngine, Version=0.0.0.0, Culture=neutral, PublicKeyToken=null"
        );
        let identity = identity.with_public_key_token([0xb7, 0x7a, 0x5c, 0x56, 0x19, 0x34, 0xe0, 0x89]);
        assert!(identity.to_string().ends_with("PublicKeyToken=b77a5c561934e089"));
    }

    fn field(constant: Option<ConstantValue>) -> FieldDef {
        FieldDef {
            token: Token::from_parts(TableId::Field, 1),
            name: "Real".to_string(),
            qualified_name: "StoreManager/StoreCurrencyType::Real".to_string(),
            declaring_type: Token::from_parts(TableId::TypeDef, 3),
            flags: FieldAttributes::from_bits_retain(0x8056),
            signature: FieldSignature {
                field_type: TypeSig::value_type("StoreManager/StoreCurrencyType"),
            },
            constant,
        }
    }

    #[test]
    fn typed_constants() {
        assert_eq!(field(Some(ConstantValue::I4(2))).as_i32().unwrap(), 2);

        let err = field(Some(ConstantValue::I8(2))).as_i32().unwrap_err();
        assert!(matches!(
            err,
            Error::ConstantTypeMismatch { ref expected, ref found, .. }
                if expected == "I4" && found == "int64"
        ));

        assert!(matches!(
            field(None).as_bool(),
            Err(Error::ConstantTypeMismatch { .. })
        ));
    }

    #[test]
    fn argument_slots() {
        let method = MethodDef {
            token: Token::from_parts(TableId::MethodDef, 1),
            name: "RequestPurchase".to_string(),
            qualified_name: "StoreManager::RequestPurchase".to_string(),
            declaring_type: Token::from_parts(TableId::TypeDef, 2),
            flags: MethodModifiers::HIDE_BY_SIG,
            raw_flags: 0x0086,
            impl_flags: MethodImplFlags::empty(),
            rva: 0x2050,
            signature: MethodSignature::new_instance(
                TypeSig::Boolean,
                vec![TypeSig::String, TypeSig::I4],
            ),
            params: vec!["item".to_string(), "currency".to_string()],
        };

        assert_eq!(method.arg_slot("item"), Some(1));
        assert_eq!(method.arg_slot("currency"), Some(2));
        assert_eq!(method.arg_slot("missing"), None);
        assert!(method.returns_value());
        assert!(method.has_body());
    }
}
