//! Loaded modules and the symbol model patches work against.
//!
//! # Key Components
//!
//! - [`Module`]: one loaded image with its types, methods, fields and committed changes
//! - [`ModuleLoader`]: builder-style entry point for loading from disk or memory
//! - [`AssemblyResolver`]: finds and caches referenced assemblies
//! - [`Transaction`]: all-or-nothing staging of new bodies and reference rows
//!
//! A module never changes its input bytes. Committed bodies and metadata additions are kept next
//! to the original image and only merged into a new image by [`crate::writer::ModuleWriter`].

pub mod loader;
pub mod lookup;
pub mod metadata;
pub mod resolver;
pub mod symbols;
pub mod transaction;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::debug;

pub use loader::ModuleLoader;
pub use metadata::Metadata;
pub use resolver::{AssemblyResolver, DependencyType, MAX_FORWARDS};
pub use symbols::{
    public_key_token, AssemblyIdentity, AssemblyReference, FieldDef, MethodDef, TypeDef,
};
pub use transaction::{ExternalMethod, Transaction};

use crate::{
    assembly::FinalizedBody,
    file::File,
    metadata::{
        method::MethodBody,
        tables::{ModuleRaw, TableId},
        token::Token,
    },
    module::transaction::Staged,
    Error, Result,
};

/// A loaded .NET module together with the changes committed to it.
pub struct Module {
    name: String,
    label: String,
    path: Option<PathBuf>,
    file: File,
    resolver: Arc<AssemblyResolver>,
    metadata: Metadata,
    mvid: uguid::Guid,
    assembly: Option<AssemblyIdentity>,
    assembly_refs: Vec<AssemblyReference>,
    types: Vec<TypeDef>,
    methods: Vec<MethodDef>,
    fields: Vec<FieldDef>,
    type_index: HashMap<String, usize>,
    bodies: BTreeMap<Token, FinalizedBody>,
    metadata_dirty: bool,
}

impl Module {
    /// Load the image at `path`, resolving dependencies through `resolver`.
    ///
    /// # Errors
    /// Returns [`Error::ContainerNotFound`] if `path` does not exist, or any error of reading
    /// and decoding the image.
    pub fn from_path(path: &Path, resolver: Arc<AssemblyResolver>) -> Result<Module> {
        if !path.exists() {
            return Err(Error::ContainerNotFound(path.to_path_buf()));
        }

        let file = File::from_file(path)?;
        Module::load(
            file,
            path.display().to_string(),
            Some(path.to_path_buf()),
            resolver,
        )
    }

    /// Load an in-memory image without a dependency search path.
    ///
    /// `label` only names the module in messages.
    ///
    /// # Errors
    /// Returns an error if `data` is not a valid .NET image.
    pub fn from_bytes(label: &str, data: Vec<u8>) -> Result<Module> {
        Module::from_bytes_with(label, data, Arc::new(AssemblyResolver::default()))
    }

    /// Load an in-memory image, resolving dependencies through `resolver`.
    ///
    /// # Errors
    /// Returns an error if `data` is not a valid .NET image.
    pub fn from_bytes_with(
        label: &str,
        data: Vec<u8>,
        resolver: Arc<AssemblyResolver>,
    ) -> Result<Module> {
        let file = File::from_mem(data)?;
        Module::load(file, label.to_string(), None, resolver)
    }

    fn load(
        file: File,
        label: String,
        path: Option<PathBuf>,
        resolver: Arc<AssemblyResolver>,
    ) -> Result<Module> {
        let metadata = Metadata::read(&file)?;
        let symbols = symbols::build(&metadata)?;

        let (module_name, mvid) = if metadata.tables.row_count(TableId::Module) > 0 {
            let row = ModuleRaw::read(&metadata.tables, 1)?;
            (
                metadata.strings.get(row.name as usize)?.to_string(),
                metadata.guid.get(row.mvid as usize)?,
            )
        } else {
            (String::new(), uguid::Guid::ZERO)
        };

        let name = match &symbols.assembly {
            Some(identity) => identity.name.clone(),
            None => Path::new(&module_name)
                .file_stem()
                .map_or_else(|| label.clone(), |stem| stem.to_string_lossy().into_owned()),
        };

        let type_index = symbols
            .types
            .iter()
            .enumerate()
            .map(|(index, ty)| (ty.full_name.clone(), index))
            .collect();

        debug!(
            "Loaded {} ({}): {} types, {} methods, {} fields, {} assembly references",
            name,
            label,
            symbols.types.len(),
            symbols.methods.len(),
            symbols.fields.len(),
            symbols.assembly_refs.len()
        );

        Ok(Module {
            name,
            label,
            path,
            file,
            resolver,
            metadata,
            mvid,
            assembly: symbols.assembly,
            assembly_refs: symbols.assembly_refs,
            types: symbols.types,
            methods: symbols.methods,
            fields: symbols.fields,
            type_index,
            bodies: BTreeMap::new(),
            metadata_dirty: false,
        })
    }

    /// Simple assembly name, or the module name without extension for a netmodule
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The path or label the module was loaded from, for messages
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The input path, `None` for in-memory images
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The module version id
    #[must_use]
    pub fn mvid(&self) -> uguid::Guid {
        self.mvid
    }

    /// The identity from the `Assembly` row, `None` for a netmodule
    #[must_use]
    pub fn assembly(&self) -> Option<&AssemblyIdentity> {
        self.assembly.as_ref()
    }

    /// Referenced assemblies, including references added by committed transactions
    #[must_use]
    pub fn assembly_refs(&self) -> &[AssemblyReference] {
        &self.assembly_refs
    }

    /// All type definitions in row order
    #[must_use]
    pub fn types(&self) -> &[TypeDef] {
        &self.types
    }

    /// All method definitions in row order
    #[must_use]
    pub fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    /// All field definitions in row order
    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// The underlying input image
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    /// The decoded metadata, including committed additions
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The resolver used for dependencies of this module
    #[must_use]
    pub fn resolver(&self) -> &Arc<AssemblyResolver> {
        &self.resolver
    }

    /// True if a transaction committed any change
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.metadata_dirty || !self.bodies.is_empty()
    }

    /// True if committed transactions added metadata rows or heap entries
    #[must_use]
    pub fn metadata_changed(&self) -> bool {
        self.metadata_dirty
    }

    /// The committed replacement body of `method`, if any
    #[must_use]
    pub fn body(&self, method: Token) -> Option<&FinalizedBody> {
        self.bodies.get(&method)
    }

    /// All committed replacement bodies by method token
    #[must_use]
    pub fn bodies(&self) -> &BTreeMap<Token, FinalizedBody> {
        &self.bodies
    }

    fn lookup<'a, T>(&self, items: &'a [T], token: Token, table: TableId) -> Result<&'a T> {
        if token.is_null() || !token.is_table(table) {
            return Err(Error::InvalidToken(token));
        }
        (token.row() as usize)
            .checked_sub(1)
            .and_then(|index| items.get(index))
            .ok_or(Error::InvalidToken(token))
    }

    /// The type definition for a `TypeDef` token.
    ///
    /// # Errors
    /// Returns [`Error::InvalidToken`] for any other token.
    pub fn type_def(&self, token: Token) -> Result<&TypeDef> {
        self.lookup(&self.types, token, TableId::TypeDef)
    }

    /// The method definition for a `MethodDef` token.
    ///
    /// # Errors
    /// Returns [`Error::InvalidToken`] for any other token.
    pub fn method(&self, token: Token) -> Result<&MethodDef> {
        self.lookup(&self.methods, token, TableId::MethodDef)
    }

    /// The field definition for a `Field` token.
    ///
    /// # Errors
    /// Returns [`Error::InvalidToken`] for any other token.
    pub fn field(&self, token: Token) -> Result<&FieldDef> {
        self.lookup(&self.fields, token, TableId::Field)
    }

    /// The encoded body of `method` as stored in the input image.
    ///
    /// # Errors
    /// - [`Error::NoMethodBody`] if the method has no RVA
    /// - [`Error::OutOfBounds`] or [`Error::Malformed`] for a damaged body
    pub fn original_body(&self, method: Token) -> Result<&[u8]> {
        let definition = self.method(method)?;
        if !definition.has_body() {
            return Err(Error::NoMethodBody(definition.qualified_name.clone()));
        }

        let offset = self.file.rva_to_offset(definition.rva as usize)?;
        let data = self.file.data().get(offset..).ok_or(Error::OutOfBounds)?;
        let body = MethodBody::from(data)?;
        data.get(..body.size_total).ok_or(Error::OutOfBounds)
    }

    /// Run `f` against a new [`Transaction`] and commit what it staged if it returns `Ok`.
    ///
    /// If `f` fails, the module is left exactly as it was.
    ///
    /// # Errors
    /// Returns the error of `f`, or an error if the staged rows cannot be committed.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let (value, staged) = {
            let mut transaction = Transaction::new(self);
            let value = f(&mut transaction)?;
            (value, transaction.into_staged())
        };

        self.commit(staged)?;
        Ok(value)
    }

    fn commit(&mut self, staged: Staged) -> Result<()> {
        let Staged {
            rows,
            strings,
            blobs,
            user_strings,
            bodies,
        } = staged;

        let heaps_grew = !(strings.is_empty() && blobs.is_empty() && user_strings.is_empty());
        let rows_added = rows.values().any(|rows| !rows.is_empty());

        if rows_added || heaps_grew {
            let mut tables = self.metadata.tables.clone();
            for (table, values) in &rows {
                for row in values {
                    tables.push_row(*table, row)?;
                }
            }

            if heaps_grew {
                // Heaps that were already addressed with 4 bytes stay that way
                let info = tables.info();
                let strings_len = self.metadata.strings.len() + strings.data().len();
                let blob_len = self.metadata.blob.len() + blobs.data().len();
                let guid_len = self.metadata.guid.len();
                let widen = |large: bool, len: usize, min: usize| if large { len.max(min) } else { len };
                let strings_len = widen(info.is_large_str(), strings_len, 0x1_0000);
                let blob_len = widen(info.is_large_blob(), blob_len, 0x1_0000);
                let guid_len = widen(info.is_large_guid(), guid_len, 0x10_0000);
                tables.set_heap_lengths(strings_len, guid_len, blob_len);
            }

            self.metadata.tables = tables;
            self.metadata.strings.extend(strings.data());
            self.metadata.blob.extend(blobs.data());
            self.metadata.user_strings.extend(user_strings.data());
            self.assembly_refs = symbols::assembly_references(&self.metadata)?;
            self.metadata_dirty = true;

            debug!(
                "Committed {} rows and {} heap bytes to {}",
                rows.values().map(Vec::len).sum::<usize>(),
                strings.data().len() + blobs.data().len() + user_strings.data().len(),
                self.name
            );
        }

        self.bodies.extend(bodies);
        Ok(())
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("label", &self.label)
            .field("mvid", &self.mvid)
            .field("types", &self.types.len())
            .field("methods", &self.methods.len())
            .field("bodies", &self.bodies.len())
            .field("metadata_dirty", &self.metadata_dirty)
            .finish_non_exhaustive()
    }
}
