//! Module-independent signature model.
//!
//! Type references inside a signature blob are tokens, which only mean something inside the
//! module that holds the blob. For overload resolution across modules the parser replaces every
//! token with the [`TypeName`] it designates, so a signature read from a dependency compares equal
//! to the same signature read from the module that references it.

use std::fmt;

#[allow(non_snake_case, dead_code, missing_docs)]
/// Element type bytes of signature blobs (ECMA-335 II.23.1.16)
pub mod ELEMENT_TYPE {
    pub const END: u8 = 0x00;
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    // Followed by type
    pub const PTR: u8 = 0x0f;
    // Followed by type
    pub const BYREF: u8 = 0x10;
    // Followed by TypeDef or TypeRef token
    pub const VALUETYPE: u8 = 0x11;
    // Followed by TypeDef or TypeRef token
    pub const CLASS: u8 = 0x12;
    pub const VAR: u8 = 0x13;
    // type rank boundsCount bound1 … loCount lo1 …
    pub const ARRAY: u8 = 0x14;
    pub const GENERICINST: u8 = 0x15;
    pub const TYPEDBYREF: u8 = 0x16;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const FNPTR: u8 = 0x1b;
    pub const OBJECT: u8 = 0x1c;
    pub const SZARRAY: u8 = 0x1d;
    pub const MVAR: u8 = 0x1e;
    pub const CMOD_REQD: u8 = 0x1f;
    pub const CMOD_OPT: u8 = 0x20;
    pub const INTERNAL: u8 = 0x21;
    pub const SENTINEL: u8 = 0x41;
    pub const PINNED: u8 = 0x45;
}

/// Calling convention byte: instance method
pub const SIG_HAS_THIS: u8 = 0x20;
/// Calling convention byte: `this` is passed explicitly
pub const SIG_EXPLICIT_THIS: u8 = 0x40;
/// Calling convention byte: generic method
pub const SIG_GENERIC: u8 = 0x10;
/// Calling convention: variable argument list
pub const SIG_VARARG: u8 = 0x05;
/// Leading byte of a field signature
pub const SIG_FIELD: u8 = 0x06;
/// Leading byte of a local variable signature
pub const SIG_LOCAL: u8 = 0x07;
/// Leading byte of a method instantiation
pub const SIG_GENERIC_INST: u8 = 0x0a;

/// The identity of a named type inside a signature.
///
/// `full_name` is `Namespace.Name`, with nested types joined by `/`. `scope` names the
/// assembly the reference was resolved through and is informational only: two names are equal
/// when their full names are.
#[derive(Debug, Clone, Eq)]
pub struct TypeName {
    /// `Namespace.Name`, nested types joined by `/`
    pub full_name: String,
    /// Assembly the type was referenced from, `None` for definitions of the current module
    pub scope: Option<String>,
}

impl TypeName {
    /// A type name without scope
    #[must_use]
    pub fn new(full_name: impl Into<String>) -> Self {
        TypeName {
            full_name: full_name.into(),
            scope: None,
        }
    }

    /// A type name resolved through the assembly `scope`
    #[must_use]
    pub fn scoped(full_name: impl Into<String>, scope: impl Into<String>) -> Self {
        TypeName {
            full_name: full_name.into(),
            scope: Some(scope.into()),
        }
    }

    /// Split into namespace and the outermost-to-innermost type names
    #[must_use]
    pub fn split(&self) -> (&str, Vec<&str>) {
        let mut parts = self.full_name.split('/');
        let outer = parts.next().unwrap_or_default();
        let (namespace, name) = match outer.rfind('.') {
            Some(position) => (&outer[..position], &outer[position + 1..]),
            None => ("", outer),
        };

        let mut names = vec![name];
        names.extend(parts);
        (namespace, names)
    }
}

impl PartialEq for TypeName {
    fn eq(&self, other: &Self) -> bool {
        self.full_name == other.full_name
    }
}

impl std::hash::Hash for TypeName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full_name.hash(state);
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "[{}]{}", scope, self.full_name),
            None => f.write_str(&self.full_name),
        }
    }
}

/// A type as it appears in a signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum TypeSig {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    String,
    Object,
    I,
    U,
    TypedByRef,
    /// A reference type
    Class(TypeName),
    /// A value type
    ValueType(TypeName),
    /// Generic parameter of the enclosing type
    Var(u32),
    /// Generic parameter of the method
    MVar(u32),
    /// Single-dimensional, zero-based array
    SzArray(Box<TypeSig>),
    /// General array
    Array {
        base: Box<TypeSig>,
        rank: u32,
        sizes: Vec<u32>,
        lower_bounds: Vec<i32>,
    },
    /// Instantiated generic type
    GenericInst {
        base: Box<TypeSig>,
        args: Vec<TypeSig>,
    },
    Ptr(Box<TypeSig>),
    ByRef(Box<TypeSig>),
    FnPtr(Box<MethodSignature>),
    Pinned(Box<TypeSig>),
    /// `modreq` or `modopt` applied to `base`
    Modified {
        required: bool,
        modifier: TypeName,
        base: Box<TypeSig>,
    },
}

impl TypeSig {
    /// Reference type by full name
    #[must_use]
    pub fn class(full_name: &str) -> Self {
        TypeSig::Class(TypeName::new(full_name))
    }

    /// Value type by full name
    #[must_use]
    pub fn value_type(full_name: &str) -> Self {
        TypeSig::ValueType(TypeName::new(full_name))
    }

    /// `T[]`
    #[must_use]
    pub fn sz_array(element: TypeSig) -> Self {
        TypeSig::SzArray(Box::new(element))
    }

    /// `T&`
    #[must_use]
    pub fn by_ref(element: TypeSig) -> Self {
        TypeSig::ByRef(Box::new(element))
    }

    /// `Base<Args>`
    #[must_use]
    pub fn generic(base: TypeSig, args: Vec<TypeSig>) -> Self {
        TypeSig::GenericInst {
            base: Box::new(base),
            args,
        }
    }

    /// True for `void`
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, TypeSig::Void)
    }

    /// The element type byte of the primitive types, `None` for composite types
    #[must_use]
    pub fn primitive_element_type(&self) -> Option<u8> {
        Some(match self {
            TypeSig::Void => ELEMENT_TYPE::VOID,
            TypeSig::Boolean => ELEMENT_TYPE::BOOLEAN,
            TypeSig::Char => ELEMENT_TYPE::CHAR,
            TypeSig::I1 => ELEMENT_TYPE::I1,
            TypeSig::U1 => ELEMENT_TYPE::U1,
            TypeSig::I2 => ELEMENT_TYPE::I2,
            TypeSig::U2 => ELEMENT_TYPE::U2,
            TypeSig::I4 => ELEMENT_TYPE::I4,
            TypeSig::U4 => ELEMENT_TYPE::U4,
            TypeSig::I8 => ELEMENT_TYPE::I8,
            TypeSig::U8 => ELEMENT_TYPE::U8,
            TypeSig::R4 => ELEMENT_TYPE::R4,
            TypeSig::R8 => ELEMENT_TYPE::R8,
            TypeSig::String => ELEMENT_TYPE::STRING,
            TypeSig::Object => ELEMENT_TYPE::OBJECT,
            TypeSig::I => ELEMENT_TYPE::I,
            TypeSig::U => ELEMENT_TYPE::U,
            TypeSig::TypedByRef => ELEMENT_TYPE::TYPEDBYREF,
            _ => return None,
        })
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Void => f.write_str("void"),
            TypeSig::Boolean => f.write_str("bool"),
            TypeSig::Char => f.write_str("char"),
            TypeSig::I1 => f.write_str("int8"),
            TypeSig::U1 => f.write_str("uint8"),
            TypeSig::I2 => f.write_str("int16"),
            TypeSig::U2 => f.write_str("uint16"),
            TypeSig::I4 => f.write_str("int32"),
            TypeSig::U4 => f.write_str("uint32"),
            TypeSig::I8 => f.write_str("int64"),
            TypeSig::U8 => f.write_str("uint64"),
            TypeSig::R4 => f.write_str("float32"),
            TypeSig::R8 => f.write_str("float64"),
            TypeSig::String => f.write_str("string"),
            TypeSig::Object => f.write_str("object"),
            TypeSig::I => f.write_str("native int"),
            TypeSig::U => f.write_str("native uint"),
            TypeSig::TypedByRef => f.write_str("typedref"),
            TypeSig::Class(name) => write!(f, "class {}", name.full_name),
            TypeSig::ValueType(name) => write!(f, "valuetype {}", name.full_name),
            TypeSig::Var(index) => write!(f, "!{index}"),
            TypeSig::MVar(index) => write!(f, "!!{index}"),
            TypeSig::SzArray(element) => write!(f, "{element}[]"),
            TypeSig::Array { base, rank, .. } => {
                write!(f, "{base}[{}]", ",".repeat((*rank as usize).saturating_sub(1)))
            }
            TypeSig::GenericInst { base, args } => {
                write!(f, "{base}<")?;
                for (position, arg) in args.iter().enumerate() {
                    if position > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(">")
            }
            TypeSig::Ptr(element) => write!(f, "{element}*"),
            TypeSig::ByRef(element) => write!(f, "{element}&"),
            TypeSig::FnPtr(method) => write!(f, "method {method}"),
            TypeSig::Pinned(element) => write!(f, "{element} pinned"),
            TypeSig::Modified {
                required,
                modifier,
                base,
            } => {
                let kind = if *required { "modreq" } else { "modopt" };
                write!(f, "{base} {kind}({})", modifier.full_name)
            }
        }
    }
}

/// A method signature (ECMA-335 II.23.2.1 - II.23.2.3).
///
/// Equality compares every component, which is the overload rule of the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    /// Instance method
    pub has_this: bool,
    /// `this` appears in the parameter list
    pub explicit_this: bool,
    /// Low nibble of the calling convention byte (0 default, 5 vararg, ...)
    pub calling_convention: u8,
    /// Number of generic parameters of a generic method
    pub generic_param_count: u32,
    /// Return type
    pub return_type: TypeSig,
    /// Declared parameters
    pub params: Vec<TypeSig>,
    /// Arguments after the sentinel of a vararg call site
    pub varargs: Vec<TypeSig>,
}

impl MethodSignature {
    /// A static method with the default calling convention
    #[must_use]
    pub fn new_static(return_type: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSignature {
            has_this: false,
            explicit_this: false,
            calling_convention: 0,
            generic_param_count: 0,
            return_type,
            params,
            varargs: Vec::new(),
        }
    }

    /// An instance method with the default calling convention
    #[must_use]
    pub fn new_instance(return_type: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSignature {
            has_this: true,
            ..MethodSignature::new_static(return_type, params)
        }
    }

    /// The calling convention byte
    #[must_use]
    pub fn convention_byte(&self) -> u8 {
        let mut byte = self.calling_convention & 0x0F;
        if self.has_this {
            byte |= SIG_HAS_THIS;
        }
        if self.explicit_this {
            byte |= SIG_EXPLICIT_THIS;
        }
        if self.generic_param_count > 0 {
            byte |= SIG_GENERIC;
        }
        byte
    }

    /// Number of values a call pops: arguments, varargs and the implicit `this`
    #[must_use]
    pub fn stack_pops(&self) -> usize {
        self.params.len() + self.varargs.len() + usize::from(self.has_this && !self.explicit_this)
    }

    /// Number of values a call pushes
    #[must_use]
    pub fn stack_pushes(&self) -> usize {
        usize::from(!self.return_type.is_void())
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_this {
            f.write_str("instance ")?;
        }
        write!(f, "{} (", self.return_type)?;
        for (position, param) in self.params.iter().enumerate() {
            if position > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        if !self.varargs.is_empty() {
            f.write_str(", ...")?;
        }
        f.write_str(")")
    }
}

/// A field signature (II.23.2.4)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldSignature {
    /// Type of the field, including custom modifiers
    pub field_type: TypeSig,
}

impl fmt::Display for FieldSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.field_type)
    }
}

/// A member reference signature, which is either a method or a field signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemberSignature {
    /// Method reference
    Method(MethodSignature),
    /// Field reference
    Field(FieldSignature),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_does_not_affect_equality() {
        let local = TypeName::new("UnityEngine.Object");
        let remote = TypeName::scoped("UnityEngine.Object", "UnityEngine");
        assert_eq!(local, remote);
        assert_eq!(TypeSig::Class(local), TypeSig::Class(remote));
        assert_ne!(TypeSig::class("A.B"), TypeSig::value_type("A.B"));
    }

    #[test]
    fn split_names() {
        let name = TypeName::new("Game.StoreManager/StoreCurrencyType");
        assert_eq!(name.split(), ("Game", vec!["StoreManager", "StoreCurrencyType"]));
        assert_eq!(TypeName::new("Plain").split(), ("", vec!["Plain"]));
    }

    #[test]
    fn signature_equality_is_exact() {
        let a = MethodSignature::new_static(TypeSig::Void, vec![TypeSig::I4]);
        let b = MethodSignature::new_static(TypeSig::Void, vec![TypeSig::I8]);
        let c = MethodSignature::new_instance(TypeSig::Void, vec![TypeSig::I4]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(c.convention_byte(), 0x20);
        assert_eq!(c.stack_pops(), 2);
        assert_eq!(a.stack_pushes(), 0);
    }

    #[test]
    fn display() {
        let sig = MethodSignature::new_instance(
            TypeSig::Boolean,
            vec![TypeSig::sz_array(TypeSig::Object), TypeSig::by_ref(TypeSig::I4)],
        );
        assert_eq!(sig.to_string(), "instance bool (object[], int32&)");
        assert_eq!(
            TypeSig::generic(TypeSig::class("System.Collections.Generic.List`1"), vec![TypeSig::MVar(0)])
                .to_string(),
            "class System.Collections.Generic.List`1<!!0>"
        );
    }
}
