//! The decoded metadata of one image and name resolution over its rows.
//!
//! [`Metadata`] owns copies of the tables stream and the heaps, together with the file offsets
//! the writer needs to patch them in place. Name and signature resolution is written against the
//! crate-internal [`RowSource`] trait, so that the same code resolves rows of a loaded module and
//! rows staged by a [`crate::module::Transaction`] that are not committed yet.

use std::collections::HashMap;

use crate::{
    file::File,
    metadata::{
        cor20header::{Cor20Header, COR20_HEADER_SIZE},
        root::Root,
        signatures::{FieldSignature, MethodSignature, SignatureParser, TypeName, TypeNameResolver},
        streams::{Blob, Guid, Strings, UserStrings},
        tables::{CodedIndexType, NestedClassRaw, TableId, TablesStream},
        token::Token,
    },
    assembly::CallSiteInfo,
    Error, Result,
};

/// Nesting depth beyond which a `TypeDef` or `TypeRef` chain is treated as a cycle
const MAX_NESTING: usize = 64;

/// Streams and header locations of a loaded image.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// The CLI header
    pub cor20: Cor20Header,
    /// File offset of the CLI header
    pub cor20_offset: usize,
    /// The metadata root with its stream headers
    pub root: Root,
    /// File offset of the metadata root
    pub root_offset: usize,
    /// Name of the tables stream, `#~` or `#-`
    pub tables_name: String,
    /// File offset of the tables stream
    pub tables_offset: usize,
    /// Decoded tables
    pub tables: TablesStream,
    /// `#Strings`
    pub strings: Strings,
    /// `#Blob`
    pub blob: Blob,
    /// `#GUID`
    pub guid: Guid,
    /// `#US`
    pub user_strings: UserStrings,
    enclosing: HashMap<u32, u32>,
}

impl Metadata {
    /// Locate and decode the metadata of `file`.
    ///
    /// # Errors
    /// Returns an error if the CLI header, the root or the tables stream is missing or damaged.
    pub fn read(file: &File) -> Result<Metadata> {
        let (clr_rva, _) = file.clr();
        let cor20_offset = file.rva_to_offset(clr_rva as usize)?;
        let cor20 = Cor20Header::read(file.data_slice(cor20_offset, COR20_HEADER_SIZE)?)?;

        let root_offset = file.rva_to_offset(cor20.meta_data_rva as usize)?;
        let data = file.data_slice(root_offset, cor20.meta_data_size as usize)?;
        let root = Root::read(data)?;

        // Root::read verified that every stream lies inside `data`
        let stream = |name: &str| {
            root.stream(name).map(|header| {
                let start = header.offset as usize;
                (start, &data[start..start + header.size as usize])
            })
        };

        let Some((tables_start, tables_data)) = stream("#~").or_else(|| stream("#-")) else {
            return Err(malformed_error!("Metadata has no tables stream"));
        };
        let tables_name = if root.stream("#~").is_some() { "#~" } else { "#-" };
        let tables = TablesStream::read(tables_data)?;

        let strings = match stream("#Strings") {
            Some((_, heap)) => Strings::from(heap)?,
            None => Strings::default(),
        };
        let blob = match stream("#Blob") {
            Some((_, heap)) => Blob::from(heap)?,
            None => Blob::default(),
        };
        let guid = stream("#GUID").map_or_else(Guid::default, |(_, heap)| Guid::from(heap));
        let user_strings =
            stream("#US").map_or_else(UserStrings::default, |(_, heap)| UserStrings::from(heap));

        let mut enclosing = HashMap::new();
        for rid in 1..=tables.row_count(TableId::NestedClass) {
            let row = NestedClassRaw::read(&tables, rid)?;
            enclosing.insert(row.nested_class, row.enclosing_class);
        }

        Ok(Metadata {
            cor20,
            cor20_offset,
            tables_name: tables_name.to_string(),
            tables_offset: root_offset + tables_start,
            root,
            root_offset,
            tables,
            strings,
            blob,
            guid,
            user_strings,
            enclosing,
        })
    }

    /// `TypeDef` row enclosing the nested type `type_def`
    #[must_use]
    pub fn enclosing_type(&self, type_def: u32) -> Option<u32> {
        self.enclosing.get(&type_def).copied()
    }

    /// Full name of `TypeDef` row `rid`, nested types joined with `/`.
    ///
    /// # Errors
    /// Returns an error if a row or string is missing, or the nesting forms a cycle.
    pub fn type_def_name(&self, rid: u32) -> Result<String> {
        type_def_name(self, rid)
    }

    /// Decode the method signature blob at `index`.
    ///
    /// # Errors
    /// Returns an error for malformed blobs or unresolvable type tokens.
    pub fn method_signature(&self, index: u32) -> Result<MethodSignature> {
        method_signature(self, index)
    }

    /// Decode the field signature blob at `index`.
    ///
    /// # Errors
    /// Returns an error for malformed blobs or unresolvable type tokens.
    pub fn field_signature(&self, index: u32) -> Result<FieldSignature> {
        SignatureParser::new(self.blob.get(index as usize)?, self).parse_field_signature()
    }
}

/// Row and heap access shared by loaded metadata and open transactions.
pub(crate) trait RowSource {
    /// Column values of row `rid`
    fn row(&self, table: TableId, rid: u32) -> Result<&[u32]>;

    /// Number of rows, including staged ones
    fn row_count(&self, table: TableId) -> u32;

    /// String at `#Strings` index `index`
    fn string(&self, index: u32) -> Result<&str>;

    /// Blob at `#Blob` index `index`
    fn blob(&self, index: u32) -> Result<&[u8]>;

    /// `TypeDef` row enclosing `type_def`
    fn enclosing(&self, type_def: u32) -> Option<u32>;
}

impl RowSource for Metadata {
    fn row(&self, table: TableId, rid: u32) -> Result<&[u32]> {
        self.tables.row(table, rid)
    }

    fn row_count(&self, table: TableId) -> u32 {
        self.tables.row_count(table)
    }

    fn string(&self, index: u32) -> Result<&str> {
        self.strings.get(index as usize)
    }

    fn blob(&self, index: u32) -> Result<&[u8]> {
        self.blob.get(index as usize)
    }

    fn enclosing(&self, type_def: u32) -> Option<u32> {
        self.enclosing_type(type_def)
    }
}

impl TypeNameResolver for Metadata {
    fn resolve_type_name(&self, token: Token) -> Result<TypeName> {
        type_name(self, token)
    }
}

impl CallSiteInfo for Metadata {
    fn call_signature(&self, token: Token) -> Result<MethodSignature> {
        call_signature(self, token, 0)
    }
}

/// `Namespace.Name`, or `Name` for the global namespace
pub(crate) fn join_namespace(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

pub(crate) fn type_def_name<S: RowSource + ?Sized>(source: &S, rid: u32) -> Result<String> {
    let mut names = Vec::new();
    let mut current = rid;
    for _ in 0..MAX_NESTING {
        let row = source.row(TableId::TypeDef, current)?;
        let name = source.string(row[1])?;
        match source.enclosing(current) {
            Some(outer) => {
                names.push(name.to_string());
                current = outer;
            }
            None => {
                names.push(join_namespace(source.string(row[2])?, name));
                names.reverse();
                return Ok(names.join("/"));
            }
        }
    }

    Err(malformed_error!("TypeDef nesting too deep - {}", rid))
}

/// Name of `TypeRef` row `rid`, scoped to the assembly it is resolved through
pub(crate) fn type_ref_name<S: RowSource + ?Sized>(source: &S, rid: u32) -> Result<TypeName> {
    let mut names = Vec::new();
    let mut current = rid;
    for _ in 0..MAX_NESTING {
        let row = source.row(TableId::TypeRef, current)?;
        let scope = CodedIndexType::ResolutionScope.decode(row[0])?;
        let name = source.string(row[1])?;
        if !scope.is_null() && scope.is_table(TableId::TypeRef) {
            names.push(name.to_string());
            current = scope.row();
            continue;
        }

        names.push(join_namespace(source.string(row[2])?, name));
        names.reverse();
        let full_name = names.join("/");
        if !scope.is_null() && scope.is_table(TableId::AssemblyRef) {
            let assembly = source.row(TableId::AssemblyRef, scope.row())?;
            return Ok(TypeName::scoped(full_name, source.string(assembly[6])?));
        }
        return Ok(TypeName::new(full_name));
    }

    Err(malformed_error!("TypeRef nesting too deep - {}", rid))
}

pub(crate) fn type_name<S: RowSource + ?Sized>(source: &S, token: Token) -> Result<TypeName> {
    match token.table_id() {
        Some(TableId::TypeDef) if !token.is_null() => {
            Ok(TypeName::new(type_def_name(source, token.row())?))
        }
        Some(TableId::TypeRef) => type_ref_name(source, token.row()),
        Some(TableId::TypeSpec) => Err(Error::NotSupported(format!(
            "TypeSpec {token} used as a named type"
        ))),
        _ => Err(Error::InvalidToken(token)),
    }
}

fn method_signature<S>(source: &S, index: u32) -> Result<MethodSignature>
where
    S: RowSource + TypeNameResolver,
{
    SignatureParser::new(source.blob(index)?, source).parse_method_signature()
}

/// Signature of the method a `call`, `callvirt`, `newobj` or `calli` operand designates
pub(crate) fn call_signature<S>(source: &S, token: Token, depth: usize) -> Result<MethodSignature>
where
    S: RowSource + TypeNameResolver,
{
    match token.table_id() {
        _ if token.is_null() => Err(Error::InvalidToken(token)),
        Some(TableId::MethodDef) => {
            method_signature(source, source.row(TableId::MethodDef, token.row())?[4])
        }
        Some(TableId::MemberRef) => {
            method_signature(source, source.row(TableId::MemberRef, token.row())?[2])
        }
        Some(TableId::StandAloneSig) => {
            method_signature(source, source.row(TableId::StandAloneSig, token.row())?[0])
        }
        Some(TableId::MethodSpec) if depth == 0 => {
            let row = source.row(TableId::MethodSpec, token.row())?;
            let method = CodedIndexType::MethodDefOrRef.decode(row[0])?;
            call_signature(source, method, depth + 1)
        }
        _ => Err(Error::InvalidToken(token)),
    }
}
