//! Serialization of a complete metadata blob: root, stream headers and streams.

use crate::{
    file::io::align_up,
    metadata::{root::Root, tables::TablesStream},
    module::Module,
    Result,
};

/// Encode `root` followed by `streams`, one per stream header and in the same order.
///
/// Stream offsets and sizes in `root` are recomputed; every stream is padded to 4 bytes.
pub(crate) fn serialize_metadata(mut root: Root, streams: &[&[u8]]) -> Vec<u8> {
    debug_assert_eq!(root.stream_headers.len(), streams.len());

    let mut offset = root.encoded_size();
    for (header, data) in root.stream_headers.iter_mut().zip(streams) {
        let size = align_up(data.len(), 4);
        #[allow(clippy::cast_possible_truncation)]
        {
            header.offset = offset as u32;
            header.size = size as u32;
        }
        offset += size;
    }

    let mut out = Vec::with_capacity(offset);
    root.write(&mut out);
    for data in streams {
        out.extend_from_slice(data);
        out.resize(align_up(out.len(), 4), 0);
    }
    out
}

/// Rebuild the metadata of `module` around `tables`.
///
/// The known heaps are taken from the module, including everything committed transactions
/// appended. Streams the module does not decode are copied from the input image.
///
/// # Errors
/// Returns an error if an unknown stream can no longer be read from the input image.
pub(crate) fn rebuild_metadata(module: &Module, tables: &TablesStream) -> Result<Vec<u8>> {
    let metadata = module.metadata();
    let tables_data = tables.serialize();

    let mut streams: Vec<&[u8]> = Vec::with_capacity(metadata.root.stream_headers.len());
    for header in &metadata.root.stream_headers {
        let data = match header.name.as_str() {
            name if name == metadata.tables_name => tables_data.as_slice(),
            "#Strings" => metadata.strings.data(),
            "#Blob" => metadata.blob.data(),
            "#GUID" => metadata.guid.data(),
            "#US" => metadata.user_strings.data(),
            _ => module.file().data_slice(
                metadata.root_offset + header.offset as usize,
                header.size as usize,
            )?,
        };
        streams.push(data);
    }

    Ok(serialize_metadata(metadata.root.clone(), &streams))
}
