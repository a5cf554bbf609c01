//! Row counts and the column widths that follow from them (ECMA-335 II.24.2.6).

use strum::{EnumCount, IntoEnumIterator};

use crate::metadata::tables::{CodedIndexType, Column, TableId};

/// Heap-size flag: `#Strings` indices are 4 bytes
pub const HEAP_LARGE_STRINGS: u8 = 0x01;
/// Heap-size flag: `#GUID` indices are 4 bytes
pub const HEAP_LARGE_GUID: u8 = 0x02;
/// Heap-size flag: `#Blob` indices are 4 bytes
pub const HEAP_LARGE_BLOB: u8 = 0x04;
/// Heap-size flag: four bytes of extra data follow the row counts
pub const HEAP_EXTRA_DATA: u8 = 0x40;

/// Row counts of all tables plus the heap index widths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    rows: [u32; TableId::COUNT],
    large_str: bool,
    large_guid: bool,
    large_blob: bool,
}

impl TableInfo {
    /// Create from row counts (indexed by table number) and the `HeapSizes` byte
    #[must_use]
    pub fn new(rows: [u32; TableId::COUNT], heap_sizes: u8) -> Self {
        TableInfo {
            rows,
            large_str: heap_sizes & HEAP_LARGE_STRINGS != 0,
            large_guid: heap_sizes & HEAP_LARGE_GUID != 0,
            large_blob: heap_sizes & HEAP_LARGE_BLOB != 0,
        }
    }

    /// Row count of `table`
    #[must_use]
    pub fn rows(&self, table: TableId) -> u32 {
        self.rows[table as usize]
    }

    /// Update the row count of `table`
    pub fn set_rows(&mut self, table: TableId, rows: u32) {
        self.rows[table as usize] = rows;
    }

    /// The heap-size flags for the current widths (without [`HEAP_EXTRA_DATA`])
    #[must_use]
    pub fn heap_sizes(&self) -> u8 {
        let mut flags = 0;
        if self.large_str {
            flags |= HEAP_LARGE_STRINGS;
        }
        if self.large_guid {
            flags |= HEAP_LARGE_GUID;
        }
        if self.large_blob {
            flags |= HEAP_LARGE_BLOB;
        }
        flags
    }

    /// Derive heap index widths from the heap sizes in bytes
    pub fn set_heap_lengths(&mut self, strings: usize, guid: usize, blob: usize) {
        self.large_str = strings > 0xFFFF;
        self.large_guid = guid / 16 > 0xFFFF;
        self.large_blob = blob > 0xFFFF;
    }

    /// True if `#Strings` indices are 4 bytes
    #[must_use]
    pub fn is_large_str(&self) -> bool {
        self.large_str
    }

    /// True if `#GUID` indices are 4 bytes
    #[must_use]
    pub fn is_large_guid(&self) -> bool {
        self.large_guid
    }

    /// True if `#Blob` indices are 4 bytes
    #[must_use]
    pub fn is_large_blob(&self) -> bool {
        self.large_blob
    }

    /// True if simple indices into `table` are 4 bytes
    #[must_use]
    pub fn is_large(&self, table: TableId) -> bool {
        self.rows(table) > u32::from(u16::MAX)
    }

    /// True if a coded index of kind `coded` is 4 bytes
    #[must_use]
    pub fn is_large_coded(&self, coded: CodedIndexType) -> bool {
        let limit = 1u32 << (16 - coded.tag_bits());
        coded
            .tables()
            .iter()
            .flatten()
            .any(|table| self.rows(*table) >= limit)
    }

    /// True if `column` is stored with 4 bytes
    #[must_use]
    pub fn is_large_column(&self, column: Column) -> bool {
        match column {
            Column::U16 => false,
            Column::U32 => true,
            Column::Str => self.large_str,
            Column::Guid => self.large_guid,
            Column::Blob => self.large_blob,
            Column::Index(table) => self.is_large(table),
            Column::Coded(coded) => self.is_large_coded(coded),
        }
    }

    /// Size of one row of `table` in bytes
    #[must_use]
    pub fn row_size(&self, table: TableId) -> usize {
        table
            .columns()
            .iter()
            .map(|column| if self.is_large_column(*column) { 4 } else { 2 })
            .sum()
    }

    /// Bit vector of tables that have at least one row
    #[must_use]
    pub fn valid(&self) -> u64 {
        TableId::iter()
            .filter(|table| self.rows(*table) > 0)
            .fold(0, |valid, table| valid | (1u64 << table as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_widths() {
        let mut rows = [0u32; TableId::COUNT];
        rows[TableId::TypeDef as usize] = 10;
        rows[TableId::MethodDef as usize] = 40;
        let info = TableInfo::new(rows, 0);

        assert_eq!(info.row_size(TableId::MethodDef), 14);
        assert_eq!(info.row_size(TableId::TypeDef), 14);
        assert_eq!(info.row_size(TableId::Module), 10);
        assert_eq!(
            info.valid(),
            (1 << TableId::TypeDef as u8) | (1 << TableId::MethodDef as u8)
        );
    }

    #[test]
    fn coded_threshold() {
        let mut rows = [0u32; TableId::COUNT];
        // TypeDefOrRef has 2 tag bits, so 2^14 rows no longer fit
        rows[TableId::TypeRef as usize] = (1 << 14) - 1;
        let mut info = TableInfo::new(rows, 0);
        assert!(!info.is_large_coded(CodedIndexType::TypeDefOrRef));

        info.set_rows(TableId::TypeRef, 1 << 14);
        assert!(info.is_large_coded(CodedIndexType::TypeDefOrRef));
        assert!(!info.is_large(TableId::TypeRef));
    }

    #[test]
    fn heap_flags() {
        let mut info = TableInfo::new([0; TableId::COUNT], HEAP_LARGE_BLOB | HEAP_EXTRA_DATA);
        assert!(info.is_large_blob());
        assert!(!info.is_large_str());
        assert_eq!(info.heap_sizes(), HEAP_LARGE_BLOB);

        info.set_heap_lengths(0x1_0000, 16, 10);
        assert_eq!(info.heap_sizes(), HEAP_LARGE_STRINGS);
        assert_eq!(info.row_size(TableId::Module), 12);
    }
}
