//! Flags of `TypeDef` and `Field` rows.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// Type attributes (`TypeAttributes`, II.23.1.15)
    pub struct TypeAttributes: u32 {
        /// Visible outside the assembly
        const PUBLIC = 0x0000_0001;
        /// Nested, visible wherever the enclosing type is
        const NESTED_PUBLIC = 0x0000_0002;
        /// Type is an interface
        const INTERFACE = 0x0000_0020;
        /// Type cannot be instantiated
        const ABSTRACT = 0x0000_0080;
        /// Type cannot be derived from
        const SEALED = 0x0000_0100;
        /// Name is special
        const SPECIAL_NAME = 0x0000_0400;
        /// Type is imported
        const IMPORT = 0x0000_1000;
        /// Type is serializable
        const SERIALIZABLE = 0x0000_2000;
        /// Static initialization may run before the first static field access
        const BEFORE_FIELD_INIT = 0x0010_0000;
        /// Runtime checks the name encoding
        const RTSPECIAL_NAME = 0x0000_0800;
        /// Type has security information
        const HAS_SECURITY = 0x0004_0000;
    }
}

/// Mask of the visibility bits of `TypeAttributes`
pub const TYPE_VISIBILITY_MASK: u32 = 0x0000_0007;

impl TypeAttributes {
    /// The visibility value, 0 (not public) to 7 (nested family or assembly)
    #[must_use]
    pub fn visibility(self) -> u32 {
        self.bits() & TYPE_VISIBILITY_MASK
    }

    /// True for the nested visibilities
    #[must_use]
    pub fn is_nested(self) -> bool {
        self.visibility() > 1
    }

    /// True if the type is an interface
    #[must_use]
    pub fn is_interface(self) -> bool {
        self.contains(TypeAttributes::INTERFACE)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// Field attributes (`FieldAttributes`, II.23.1.5) other than the access mask
    pub struct FieldAttributes: u32 {
        /// Defined on the type instead of per instance
        const STATIC = 0x0010;
        /// Can only be written during initialization
        const INIT_ONLY = 0x0020;
        /// Compile time constant
        const LITERAL = 0x0040;
        /// Not serialized when the type is remoted
        const NOT_SERIALIZED = 0x0080;
        /// Field has an RVA
        const HAS_FIELD_RVA = 0x0100;
        /// Name is special
        const SPECIAL_NAME = 0x0200;
        /// Runtime checks the name encoding
        const RTSPECIAL_NAME = 0x0400;
        /// Field has marshalling information
        const HAS_FIELD_MARSHAL = 0x1000;
        /// Implementation is forwarded through `PInvoke`
        const PINVOKE_IMPL = 0x2000;
        /// Field has a default value
        const HAS_DEFAULT = 0x8000;
    }
}

/// Mask of the member access bits of `FieldAttributes`
pub const FIELD_ACCESS_MASK: u32 = 0x0007;

impl FieldAttributes {
    /// The access value, 1 (private) to 6 (public)
    #[must_use]
    pub fn access(self) -> u32 {
        self.bits() & FIELD_ACCESS_MASK
    }

    /// True for static fields
    #[must_use]
    pub fn is_static(self) -> bool {
        self.contains(FieldAttributes::STATIC)
    }

    /// True for compile time constants, such as enum members
    #[must_use]
    pub fn is_literal(self) -> bool {
        self.contains(FieldAttributes::LITERAL)
    }
}
