// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The document-data table: an opaque per-document payload.
//!
//! Keys are docids; tags are whatever the caller stored. Empty payloads
//! are not stored at all, so absent and empty read back the same.

use crate::{
    btree::table::Table,
    coding::pack::pack_uint_preserving_sort,
    version::RootInfo,
    DocId, Result, Revision,
};
use std::path::Path;

/// Compression threshold for docdata tags.
const COMPRESS_MIN: u32 = 100;

/// Key of a document's payload.
#[must_use]
pub fn docdata_key(did: DocId) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    pack_uint_preserving_sort(&mut key, u64::from(did));
    key
}

/// The document-data table of one database.
#[derive(Clone)]
pub struct DocdataTable {
    table: Table,
}

impl DocdataTable {
    /// Creates a fresh document-data table.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn create(dir: &Path, block_size: u32) -> Result<Self> {
        let table = Table::create_and_open(
            &dir.join(crate::version::TableId::Docdata.filename()),
            "docdata",
            block_size,
            COMPRESS_MIN,
        )?;
        Ok(Self { table })
    }

    /// Opens the document-data table at a revision.
    ///
    /// # Errors
    ///
    /// As [`Table::open`].
    pub fn open(
        dir: &Path,
        root_info: &RootInfo,
        revision: Revision,
        writable: bool,
    ) -> Result<Self> {
        let table = Table::open(
            &dir.join(crate::version::TableId::Docdata.filename()),
            "docdata",
            root_info,
            revision,
            writable,
        )?;
        Ok(Self { table })
    }

    /// The underlying table.
    #[must_use]
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Stores a document's payload; empty removes the entry.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn set_data(&self, did: DocId, data: &[u8]) -> Result<()> {
        let key = docdata_key(did);
        if data.is_empty() {
            self.table.del(&key)?;
            Ok(())
        } else {
            self.table.add(&key, data)
        }
    }

    /// Removes a document's payload.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn delete_data(&self, did: DocId) -> Result<()> {
        self.table.del(&docdata_key(did))?;
        Ok(())
    }

    /// Reads a document's payload; absent reads as empty.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn get_data(&self, did: DocId) -> Result<Vec<u8>> {
        Ok(self
            .table
            .get_exact_entry(&docdata_key(did))?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn payload_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table = DocdataTable::create(dir.path(), 2048)?;

        table.set_data(1, b"first document")?;
        table.set_data(2, b"second document")?;

        assert_eq!(b"first document".to_vec(), table.get_data(1)?);
        assert_eq!(b"second document".to_vec(), table.get_data(2)?);
        assert_eq!(Vec::<u8>::new(), table.get_data(3)?);

        // Empty payloads take no space and read back the same as absent.
        table.set_data(1, b"")?;
        assert_eq!(Vec::<u8>::new(), table.get_data(1)?);
        assert_eq!(1, table.table().get_entry_count());

        table.delete_data(2)?;
        assert!(table.table().empty());
        Ok(())
    }
}
