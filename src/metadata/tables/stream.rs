//! The `#~` tables stream (ECMA-335 II.24.2.6).
//!
//! Every row is decoded into one `u32` per column. Coded indices stay in their encoded form, so
//! a decoded table can be re-serialized without knowing what its columns mean. The byte offset of
//! each row inside the stream is kept to allow patching a single cell in place.

use strum::{EnumCount, IntoEnumIterator};

use crate::{
    file::io::{push_le, push_le_dyn, read_le_at, read_le_at_dyn},
    metadata::{
        tables::{Column, TableId, TableInfo, HEAP_EXTRA_DATA},
        token::Token,
    },
    Error::{self, OutOfBounds},
    Result,
};

/// Decoded rows of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableData {
    columns: usize,
    values: Vec<u32>,
    offsets: Vec<usize>,
}

impl TableData {
    /// Number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        if self.columns == 0 {
            0
        } else {
            self.values.len() / self.columns
        }
    }

    /// True if the table has no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The decoded tables stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablesStream {
    /// Major schema version, 2
    pub major_version: u8,
    /// Minor schema version, 0
    pub minor_version: u8,
    /// Bit vector of sorted tables
    pub sorted: u64,
    /// Extra data following the row counts, if `HeapSizes` had bit 0x40
    pub extra_data: Option<u32>,
    info: TableInfo,
    tables: Vec<TableData>,
}

impl TablesStream {
    /// Create an empty tables stream
    #[must_use]
    pub fn new() -> Self {
        TablesStream {
            major_version: 2,
            minor_version: 0,
            sorted: 0x0000_1600_3301_FA00,
            extra_data: None,
            info: TableInfo::new([0; TableId::COUNT], 0),
            tables: TableId::iter()
                .map(|table| TableData {
                    columns: table.columns().len(),
                    ..TableData::default()
                })
                .collect(),
        }
    }

    /// Decode the tables stream.
    ///
    /// # Errors
    /// Returns an error for truncated data, unknown tables, or the portable PDB tables that
    /// never occur in a module.
    pub fn read(data: &[u8]) -> Result<TablesStream> {
        if data.len() < 24 {
            return Err(OutOfBounds);
        }

        let mut offset = 4;
        let major_version = read_le_at::<u8>(data, &mut offset)?;
        let minor_version = read_le_at::<u8>(data, &mut offset)?;
        let heap_sizes = read_le_at::<u8>(data, &mut offset)?;
        offset += 1;
        let valid = read_le_at::<u64>(data, &mut offset)?;
        let sorted = read_le_at::<u64>(data, &mut offset)?;

        if valid >> TableId::COUNT != 0 {
            return Err(Error::NotSupported(format!(
                "Tables stream contains unknown tables - valid 0x{:016x}",
                valid
            )));
        }

        let mut rows = [0u32; TableId::COUNT];
        for table in TableId::iter() {
            if valid & (1u64 << table as u8) != 0 {
                rows[table as usize] = read_le_at::<u32>(data, &mut offset)?;
            }
        }

        let extra_data = if heap_sizes & HEAP_EXTRA_DATA != 0 {
            Some(read_le_at::<u32>(data, &mut offset)?)
        } else {
            None
        };

        let info = TableInfo::new(rows, heap_sizes);
        let mut tables = Vec::with_capacity(TableId::COUNT);
        for table in TableId::iter() {
            let columns = table.columns();
            let row_count = info.rows(table) as usize;
            let row_size = info.row_size(table);
            if row_count
                .checked_mul(row_size)
                .and_then(|size| size.checked_add(offset))
                .is_none_or(|end| end > data.len())
            {
                return Err(malformed_error!(
                    "Table {:?} with {} rows exceeds the tables stream",
                    table,
                    row_count
                ));
            }

            let mut table_data = TableData {
                columns: columns.len(),
                values: Vec::with_capacity(row_count * columns.len()),
                offsets: Vec::with_capacity(row_count),
            };

            for _ in 0..row_count {
                table_data.offsets.push(offset);
                for column in columns {
                    let value = read_le_at_dyn(data, &mut offset, info.is_large_column(*column))?;
                    table_data.values.push(value);
                }
            }

            tables.push(table_data);
        }

        Ok(TablesStream {
            major_version,
            minor_version,
            sorted,
            extra_data,
            info,
            tables,
        })
    }

    /// Row counts and column widths
    #[must_use]
    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    /// Number of rows in `table`
    #[must_use]
    pub fn row_count(&self, table: TableId) -> u32 {
        self.info.rows(table)
    }

    /// All column values of row `rid` (1-based).
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if the row does not exist.
    pub fn row(&self, table: TableId, rid: u32) -> Result<&[u32]> {
        let data = &self.tables[table as usize];
        if rid == 0 || rid as usize > data.len() {
            return Err(Error::InvalidToken(Token::from_parts(table, rid)));
        }

        let start = (rid as usize - 1) * data.columns;
        Ok(&data.values[start..start + data.columns])
    }

    /// Column `column` of row `rid`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if the row does not exist.
    pub fn value(&self, table: TableId, rid: u32, column: usize) -> Result<u32> {
        self.row(table, rid)?
            .get(column)
            .copied()
            .ok_or(Error::InvalidToken(Token::from_parts(table, rid)))
    }

    /// Overwrite column `column` of row `rid`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if the row does not exist.
    pub fn set_value(&mut self, table: TableId, rid: u32, column: usize, value: u32) -> Result<()> {
        let data = &mut self.tables[table as usize];
        if rid == 0 || rid as usize > data.len() || column >= data.columns {
            return Err(Error::InvalidToken(Token::from_parts(table, rid)));
        }

        data.values[(rid as usize - 1) * data.columns + column] = value;
        Ok(())
    }

    /// Append a row and return its 1-based row id.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the number of values does not match the table.
    pub fn push_row(&mut self, table: TableId, values: &[u32]) -> Result<u32> {
        let data = &mut self.tables[table as usize];
        if values.len() != data.columns {
            return Err(malformed_error!(
                "Table {:?} expects {} columns, got {}",
                table,
                data.columns,
                values.len()
            ));
        }

        data.values.extend_from_slice(values);
        #[allow(clippy::cast_possible_truncation)]
        let rid = data.len() as u32;
        self.info.set_rows(table, rid);
        Ok(rid)
    }

    /// Byte offset of row `rid` inside the stream, for rows that were read from the input.
    #[must_use]
    pub fn row_offset(&self, table: TableId, rid: u32) -> Option<usize> {
        let index = (rid as usize).checked_sub(1)?;
        self.tables[table as usize].offsets.get(index).copied()
    }

    /// Byte offset of a column inside its row, using the current widths
    #[must_use]
    pub fn column_offset(&self, table: TableId, column: usize) -> usize {
        table.columns()[..column]
            .iter()
            .map(|column| if self.info.is_large_column(*column) { 4 } else { 2 })
            .sum()
    }

    /// Derive heap index widths from the heap sizes the stream will be written with
    pub fn set_heap_lengths(&mut self, strings: usize, guid: usize, blob: usize) {
        self.info.set_heap_lengths(strings, guid, blob);
    }

    /// Serialize with widths recomputed from the current row counts, padded to 4 bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_le::<u32>(&mut out, 0);
        push_le::<u8>(&mut out, self.major_version);
        push_le::<u8>(&mut out, self.minor_version);

        let mut heap_sizes = self.info.heap_sizes();
        if self.extra_data.is_some() {
            heap_sizes |= HEAP_EXTRA_DATA;
        }
        push_le::<u8>(&mut out, heap_sizes);
        push_le::<u8>(&mut out, 1);
        push_le::<u64>(&mut out, self.info.valid());
        push_le::<u64>(&mut out, self.sorted);

        for table in TableId::iter() {
            let rows = self.info.rows(table);
            if rows > 0 {
                push_le::<u32>(&mut out, rows);
            }
        }

        if let Some(extra) = self.extra_data {
            push_le::<u32>(&mut out, extra);
        }

        for table in TableId::iter() {
            let columns = table.columns();
            let widths: Vec<bool> = columns
                .iter()
                .map(|column| self.info.is_large_column(*column))
                .collect();

            let data = &self.tables[table as usize];
            for row in data.values.chunks(data.columns.max(1)) {
                for (value, is_large) in row.iter().zip(&widths) {
                    push_le_dyn(&mut out, *value, *is_large);
                }
            }
        }

        out.resize(out.len().div_ceil(4) * 4, 0);
        out
    }
}

impl Default for TablesStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Which columns of `table` hold simple indices into `target`
#[must_use]
pub fn index_columns(table: TableId, target: TableId) -> Vec<usize> {
    table
        .columns()
        .iter()
        .enumerate()
        .filter_map(|(position, column)| match column {
            Column::Index(id) if *id == target => Some(position),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TablesStream {
        let mut stream = TablesStream::new();
        stream.push_row(TableId::Module, &[0, 1, 1, 0, 0]).unwrap();
        stream.push_row(TableId::TypeDef, &[0, 6, 0, 0, 1, 1]).unwrap();
        stream
            .push_row(TableId::MethodDef, &[0x2050, 0, 0x96, 10, 1, 1])
            .unwrap();
        stream
    }

    #[test]
    fn read_back() {
        let stream = sample();
        let bytes = stream.serialize();
        assert_eq!(bytes.len() % 4, 0);

        let parsed = TablesStream::read(&bytes).unwrap();
        assert_eq!(parsed.row_count(TableId::MethodDef), 1);
        assert_eq!(parsed.value(TableId::MethodDef, 1, 0).unwrap(), 0x2050);
        assert_eq!(parsed.row(TableId::TypeDef, 1).unwrap(), &[0, 6, 0, 0, 1, 1]);
        assert_eq!(parsed.serialize(), bytes);

        // header (24) + 3 row counts (12), Module row is 10 bytes, TypeDef row 14
        assert_eq!(parsed.row_offset(TableId::Module, 1), Some(36));
        assert_eq!(parsed.row_offset(TableId::TypeDef, 1), Some(46));
        assert_eq!(parsed.row_offset(TableId::MethodDef, 1), Some(60));
        assert_eq!(parsed.row_offset(TableId::MethodDef, 2), None);
    }

    #[test]
    fn invalid_rows() {
        let mut stream = sample();
        assert!(stream.row(TableId::MethodDef, 0).is_err());
        assert!(stream.row(TableId::MethodDef, 2).is_err());
        assert!(stream.set_value(TableId::Field, 1, 0, 0).is_err());
        assert!(stream.push_row(TableId::Field, &[1, 2]).is_err());
    }

    #[test]
    fn widths_follow_row_counts() {
        let mut stream = sample();
        assert_eq!(stream.column_offset(TableId::MethodDef, 5), 12);
        stream.set_heap_lengths(0x2_0000, 16, 8);
        // RVA, ImplFlags, Flags, then a 4-byte Name
        assert_eq!(stream.column_offset(TableId::MethodDef, 3), 8);
        assert_eq!(stream.column_offset(TableId::MethodDef, 4), 12);
        // Signature stays a 2-byte blob index
        assert_eq!(stream.column_offset(TableId::MethodDef, 5), 14);
    }

    #[test]
    fn rejects_unknown_tables() {
        let mut bytes = sample().serialize();
        bytes[8 + 6] = 0x01; // bit 0x30 of valid
        assert!(TablesStream::read(&bytes).is_err());
    }

    #[test]
    fn index_column_lookup() {
        assert_eq!(index_columns(TableId::TypeDef, TableId::MethodDef), vec![5]);
        assert_eq!(index_columns(TableId::NestedClass, TableId::TypeDef), vec![0, 1]);
        assert!(index_columns(TableId::Field, TableId::TypeDef).is_empty());
    }
}
