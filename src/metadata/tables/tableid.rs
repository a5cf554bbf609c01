//! Metadata table identifiers and their column layout (ECMA-335 II.22).

use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::metadata::tables::CodedIndexType;

/// The metadata tables of the `#~` stream.
///
/// Discriminants are the table numbers used in tokens and in the `valid` bit vector. Portable
/// PDB tables (0x30 and up) are not part of a module's tables stream and are not listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumCount)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TableId {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldPtr = 0x03,
    Field = 0x04,
    MethodPtr = 0x05,
    MethodDef = 0x06,
    ParamPtr = 0x07,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0A,
    Constant = 0x0B,
    CustomAttribute = 0x0C,
    FieldMarshal = 0x0D,
    DeclSecurity = 0x0E,
    ClassLayout = 0x0F,
    FieldLayout = 0x10,
    StandAloneSig = 0x11,
    EventMap = 0x12,
    EventPtr = 0x13,
    Event = 0x14,
    PropertyMap = 0x15,
    PropertyPtr = 0x16,
    Property = 0x17,
    MethodSemantics = 0x18,
    MethodImpl = 0x19,
    ModuleRef = 0x1A,
    TypeSpec = 0x1B,
    ImplMap = 0x1C,
    FieldRVA = 0x1D,
    EncLog = 0x1E,
    EncMap = 0x1F,
    Assembly = 0x20,
    AssemblyProcessor = 0x21,
    AssemblyOS = 0x22,
    AssemblyRef = 0x23,
    AssemblyRefProcessor = 0x24,
    AssemblyRefOS = 0x25,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    NestedClass = 0x29,
    GenericParam = 0x2A,
    MethodSpec = 0x2B,
    GenericParamConstraint = 0x2C,
}

/// The kind of one table column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// A 2-byte constant (a 1-byte constant plus padding is stored the same way)
    U16,
    /// A 4-byte constant
    U32,
    /// Index into `#Strings`
    Str,
    /// Index into `#GUID`
    Guid,
    /// Index into `#Blob`
    Blob,
    /// Simple index into another table
    Index(TableId),
    /// Coded index
    Coded(CodedIndexType),
}

impl TableId {
    /// Map a table number to its id
    #[must_use]
    pub fn from_u8(value: u8) -> Option<TableId> {
        TableId::iter().find(|id| *id as u8 == value)
    }

    /// Column layout of this table
    #[must_use]
    #[rustfmt::skip]
    pub fn columns(self) -> &'static [Column] {
        use CodedIndexType as C;
        use Column::{Blob, Coded, Guid, Index, Str, U16, U32};

        match self {
            TableId::Module                 => &[U16, Str, Guid, Guid, Guid],
            TableId::TypeRef                => &[Coded(C::ResolutionScope), Str, Str],
            TableId::TypeDef                => &[U32, Str, Str, Coded(C::TypeDefOrRef), Index(TableId::Field), Index(TableId::MethodDef)],
            TableId::FieldPtr               => &[Index(TableId::Field)],
            TableId::Field                  => &[U16, Str, Blob],
            TableId::MethodPtr              => &[Index(TableId::MethodDef)],
            TableId::MethodDef              => &[U32, U16, U16, Str, Blob, Index(TableId::Param)],
            TableId::ParamPtr               => &[Index(TableId::Param)],
            TableId::Param                  => &[U16, U16, Str],
            TableId::InterfaceImpl          => &[Index(TableId::TypeDef), Coded(C::TypeDefOrRef)],
            TableId::MemberRef              => &[Coded(C::MemberRefParent), Str, Blob],
            TableId::Constant               => &[U16, Coded(C::HasConstant), Blob],
            TableId::CustomAttribute        => &[Coded(C::HasCustomAttribute), Coded(C::CustomAttributeType), Blob],
            TableId::FieldMarshal           => &[Coded(C::HasFieldMarshal), Blob],
            TableId::DeclSecurity           => &[U16, Coded(C::HasDeclSecurity), Blob],
            TableId::ClassLayout            => &[U16, U32, Index(TableId::TypeDef)],
            TableId::FieldLayout            => &[U32, Index(TableId::Field)],
            TableId::StandAloneSig          => &[Blob],
            TableId::EventMap               => &[Index(TableId::TypeDef), Index(TableId::Event)],
            TableId::EventPtr               => &[Index(TableId::Event)],
            TableId::Event                  => &[U16, Str, Coded(C::TypeDefOrRef)],
            TableId::PropertyMap            => &[Index(TableId::TypeDef), Index(TableId::Property)],
            TableId::PropertyPtr            => &[Index(TableId::Property)],
            TableId::Property               => &[U16, Str, Blob],
            TableId::MethodSemantics        => &[U16, Index(TableId::MethodDef), Coded(C::HasSemantics)],
            TableId::MethodImpl             => &[Index(TableId::TypeDef), Coded(C::MethodDefOrRef), Coded(C::MethodDefOrRef)],
            TableId::ModuleRef              => &[Str],
            TableId::TypeSpec               => &[Blob],
            TableId::ImplMap                => &[U16, Coded(C::MemberForwarded), Str, Index(TableId::ModuleRef)],
            TableId::FieldRVA               => &[U32, Index(TableId::Field)],
            TableId::EncLog                 => &[U32, U32],
            TableId::EncMap                 => &[U32],
            TableId::Assembly               => &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
            TableId::AssemblyProcessor      => &[U32],
            TableId::AssemblyOS             => &[U32, U32, U32],
            TableId::AssemblyRef            => &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
            TableId::AssemblyRefProcessor   => &[U32, Index(TableId::AssemblyRef)],
            TableId::AssemblyRefOS          => &[U32, U32, U32, Index(TableId::AssemblyRef)],
            TableId::File                   => &[U32, Str, Blob],
            TableId::ExportedType           => &[U32, U32, Str, Str, Coded(C::Implementation)],
            TableId::ManifestResource       => &[U32, U32, Str, Coded(C::Implementation)],
            TableId::NestedClass            => &[Index(TableId::TypeDef), Index(TableId::TypeDef)],
            TableId::GenericParam           => &[U16, U16, Coded(C::TypeOrMethodDef), Str],
            TableId::MethodSpec             => &[Coded(C::MethodDefOrRef), Blob],
            TableId::GenericParamConstraint => &[Index(TableId::GenericParam), Coded(C::TypeDefOrRef)],
        }
    }
}
