//! Metadata tables: identifiers, column schema, index widths and the decoded `#~` stream.

mod codedindex;
mod rows;
mod stream;
mod tableid;
mod tableinfo;

pub use codedindex::CodedIndexType;
pub use rows::{
    AssemblyRaw, AssemblyRefRaw, ConstantRaw, ExportedTypeRaw, FieldRaw, MemberRefRaw,
    MethodDefRaw, ModuleRaw, NestedClassRaw, ParamRaw, TypeDefRaw, TypeRefRaw,
};
pub use stream::{index_columns, TableData, TablesStream};
pub use tableid::{Column, TableId};
pub use tableinfo::{
    TableInfo, HEAP_EXTRA_DATA, HEAP_LARGE_BLOB, HEAP_LARGE_GUID, HEAP_LARGE_STRINGS,
};
