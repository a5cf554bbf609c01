//! Serialization of a patched [`Module`] back into a PE image.
//!
//! The writer starts from a copy of the input bytes and changes as little as possible:
//!
//! - A module without committed changes is returned unchanged.
//! - A replacement body that fits into the footprint of the original body, and whose RVA no other
//!   method shares, is written in place and the rest of the footprint is zero-filled.
//! - Every other body goes into a new section (`.dotp` by default) and its `MethodDef` RVA is
//!   updated.
//! - If transactions added rows or heap entries, the whole metadata is rebuilt into the new
//!   section with the same stream order, and the CLI header is pointed at it. Heaps are only ever
//!   appended to, so every existing index stays valid.
//!
//! An Authenticode signature no longer matches a patched image and is removed. The checksum is
//! recomputed if the input carried one.
//!
//! Writing to disk goes through a temporary file in the destination directory which is synced and
//! then renamed over the destination, so a failed write never leaves a damaged file behind.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotpatch::{ModuleLoader, ModuleWriter, WriterOptions};
//! use std::path::Path;
//!
//! let module = ModuleLoader::new().load_file(Path::new("Assembly-CSharp.dll"))?;
//! let writer = ModuleWriter::with_options(WriterOptions::default().section_name(".patch"));
//! writer.write(&module, Path::new("out/Assembly-CSharp.dll"))?;
//! # Ok::<(), dotpatch::Error>(())
//! ```

mod checksum;
mod layout;
pub(crate) mod metadata;

pub use checksum::pe_checksum;

use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
};

use log::{debug, info};
use tempfile::NamedTempFile;

use crate::{
    file::io::align_up,
    metadata::{cor20header::COR20_METADATA_OFFSET, tables::TableId, token::Token},
    module::Module,
    Error, Result,
};

use layout::PeEditor;

/// `CNT_CODE | MEM_EXECUTE | MEM_READ`
const PATCH_SECTION_CHARACTERISTICS: u32 = 0x6000_0020;

/// Settings for [`ModuleWriter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterOptions {
    /// Name of the section added for relocated bodies and rebuilt metadata, at most 8 bytes
    pub section_name: String,
    /// Recompute the optional header checksum if the input image carried one
    pub update_checksum: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            section_name: ".dotp".to_string(),
            update_checksum: true,
        }
    }
}

impl WriterOptions {
    /// Set the name of the added section
    #[must_use]
    pub fn section_name(mut self, name: impl Into<String>) -> Self {
        self.section_name = name.into();
        self
    }

    /// Enable or disable checksum recomputation
    #[must_use]
    pub fn update_checksum(mut self, update: bool) -> Self {
        self.update_checksum = update;
        self
    }
}

/// Writes modules to memory or disk, see the [module documentation](self).
#[derive(Debug, Clone, Default)]
pub struct ModuleWriter {
    options: WriterOptions,
}

impl ModuleWriter {
    /// A writer with default options
    #[must_use]
    pub fn new() -> Self {
        ModuleWriter::default()
    }

    /// A writer with `options`
    #[must_use]
    pub fn with_options(options: WriterOptions) -> Self {
        ModuleWriter { options }
    }

    /// The active options
    #[must_use]
    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Serialize `module` into a new image.
    ///
    /// # Errors
    /// Returns [`Error::WriteLayout`] if the new section cannot be placed, or an error if the
    /// input image cannot be re-read.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_vec(&self, module: &Module) -> Result<Vec<u8>> {
        if !module.is_modified() {
            return Ok(module.file().data().to_vec());
        }

        let file = module.file();
        let metadata = module.metadata();
        let mut editor = PeEditor::new(file);
        let had_checksum = editor.layout().check_sum != 0;
        editor.strip_certificate()?;

        let mut rva_users: HashMap<u32, usize> = HashMap::new();
        for method in module.methods().iter().filter(|method| method.has_body()) {
            *rva_users.entry(method.rva).or_default() += 1;
        }

        let mut relocated = Vec::new();
        for (token, body) in module.bodies() {
            let method = module.method(*token)?;
            let bytes = body.bytes();
            let is_fat = bytes.first().is_some_and(|header| header & 0x3 == 0x3);

            if method.has_body() && rva_users.get(&method.rva) == Some(&1) {
                let footprint = module.original_body(*token)?.len();
                let aligned = !is_fat || method.rva % 4 == 0;
                if bytes.len() <= footprint && aligned {
                    let offset = file.rva_to_offset(method.rva as usize)?;
                    let mut replacement = bytes.to_vec();
                    replacement.resize(footprint, 0);
                    editor.write_at(offset, &replacement)?;
                    debug!(
                        "{}: body rewritten in place at RVA 0x{:x} ({} of {} bytes)",
                        method.qualified_name,
                        method.rva,
                        bytes.len(),
                        footprint
                    );
                    continue;
                }
            }
            relocated.push((*token, body));
        }

        if relocated.is_empty() && !module.metadata_changed() {
            return self.finish(editor, had_checksum);
        }

        let section_rva = editor.next_section_rva();
        let mut section = Vec::new();
        let mut new_rvas: Vec<(Token, u32)> = Vec::with_capacity(relocated.len());
        for (token, body) in &relocated {
            section.resize(align_up(section.len(), 4), 0);
            let rva = section_rva + section.len() as u32;
            section.extend_from_slice(body.bytes());
            new_rvas.push((*token, rva));
            debug!(
                "{}: body relocated to RVA 0x{rva:x}",
                module.method(*token)?.qualified_name
            );
        }

        if module.metadata_changed() {
            let mut tables = metadata.tables.clone();
            for (token, rva) in &new_rvas {
                tables.set_value(TableId::MethodDef, token.row(), 0, *rva)?;
            }

            section.resize(align_up(section.len(), 4), 0);
            let metadata_rva = section_rva + section.len() as u32;
            let blob = metadata::rebuild_metadata(module, &tables)?;
            debug!(
                "Metadata rebuilt at RVA 0x{metadata_rva:x} (0x{:x} bytes, was 0x{:x})",
                blob.len(),
                metadata.cor20.meta_data_size
            );

            let directory = metadata.cor20_offset + COR20_METADATA_OFFSET;
            editor.write_u32(directory, metadata_rva)?;
            editor.write_u32(directory + 4, blob.len() as u32)?;
            section.extend_from_slice(&blob);
        } else {
            let column = metadata.tables.column_offset(TableId::MethodDef, 0);
            for (token, rva) in &new_rvas {
                let row = metadata
                    .tables
                    .row_offset(TableId::MethodDef, token.row())
                    .ok_or(Error::InvalidToken(*token))?;
                editor.write_u32(metadata.tables_offset + row + column, *rva)?;
            }
        }

        editor.add_section(
            &self.options.section_name,
            section_rva,
            &section,
            PATCH_SECTION_CHARACTERISTICS,
        )?;

        self.finish(editor, had_checksum)
    }

    fn finish(&self, mut editor: PeEditor, had_checksum: bool) -> Result<Vec<u8>> {
        if had_checksum && self.options.update_checksum {
            editor.update_checksum()?;
        }
        Ok(editor.into_bytes())
    }

    /// Serialize `module` and atomically replace `path` with the result.
    ///
    /// # Errors
    /// Returns the errors of [`Self::to_vec`], or [`Error::WriteError`] if staging, syncing or
    /// renaming the output fails. `path` is left untouched in every error case.
    pub fn write(&self, module: &Module, path: &Path) -> Result<()> {
        let image = self.to_vec(module)?;

        let write_error = |source: std::io::Error| Error::WriteError {
            path: path.to_path_buf(),
            source,
        };

        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut staging = NamedTempFile::new_in(&directory).map_err(write_error)?;
        staging.write_all(&image).map_err(write_error)?;
        staging.as_file().sync_all().map_err(write_error)?;
        staging
            .persist(path)
            .map_err(|error| write_error(error.error))?;

        info!(
            "Wrote {} to {} ({} bytes)",
            module.name(),
            path.display(),
            image.len()
        );
        Ok(())
    }
}
