// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The synonym table: per-term expansion sets.
//!
//! Keys are the source terms; tags concatenate the sorted synonyms as
//! length-prefixed strings, the length bytes XORed with 0x60 like the
//! spelling table's lists.

use crate::{
    btree::table::Table,
    version::RootInfo,
    Error, Result, Revision,
};
use std::collections::BTreeSet;
use std::path::Path;

/// Compression threshold for synonym tags.
const COMPRESS_MIN: u32 = 100;

const LEN_XOR: u8 = 0x60;

pub(crate) fn encode_synonyms(synonyms: &BTreeSet<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    for synonym in synonyms {
        out.push((synonym.len() as u8) ^ LEN_XOR);
        out.extend_from_slice(synonym);
    }
    out
}

pub(crate) fn decode_synonyms(tag: &[u8]) -> Result<BTreeSet<Vec<u8>>> {
    let mut out = BTreeSet::new();
    let mut input = tag;
    while let Some((&len, rest)) = input.split_first() {
        let len = usize::from(len ^ LEN_XOR);
        if rest.len() < len {
            return Err(Error::Corrupt("synonym list truncated".into()));
        }
        out.insert(rest.get(..len).unwrap_or_default().to_vec());
        input = rest.get(len..).unwrap_or_default();
    }
    Ok(out)
}

/// The synonym table of one database.
#[derive(Clone)]
pub struct SynonymTable {
    table: Table,
}

impl SynonymTable {
    /// Creates a fresh synonym table.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn create(dir: &Path, block_size: u32) -> Result<Self> {
        let table = Table::create_and_open(
            &dir.join(crate::version::TableId::Synonym.filename()),
            "synonym",
            block_size,
            COMPRESS_MIN,
        )?;
        Ok(Self { table })
    }

    /// Opens the synonym table at a revision.
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
            &dir.join(crate::version::TableId::Synonym.filename()),
            "synonym",
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

    /// Adds one synonym for `term`.
    ///
    /// # Errors
    ///
    /// Fails on an over-long synonym or I/O.
    pub fn add_synonym(&self, term: &[u8], synonym: &[u8]) -> Result<()> {
        if synonym.len() > 255 {
            return Err(Error::InvalidArgument("synonym too long".into()));
        }
        let mut synonyms = self.synonym_set(term)?;
        if synonyms.insert(synonym.to_vec()) {
            self.table.add(term, &encode_synonyms(&synonyms))?;
        }
        Ok(())
    }

    /// Removes one synonym for `term`; removing the last drops the entry.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn remove_synonym(&self, term: &[u8], synonym: &[u8]) -> Result<()> {
        let mut synonyms = self.synonym_set(term)?;
        if synonyms.remove(synonym) {
            if synonyms.is_empty() {
                self.table.del(term)?;
            } else {
                self.table.add(term, &encode_synonyms(&synonyms))?;
            }
        }
        Ok(())
    }

    /// Removes every synonym of `term`.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn clear_synonyms(&self, term: &[u8]) -> Result<()> {
        self.table.del(term)?;
        Ok(())
    }

    /// The sorted synonyms of `term`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt data.
    pub fn synonyms(&self, term: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.synonym_set(term)?.into_iter().collect())
    }

    fn synonym_set(&self, term: &[u8]) -> Result<BTreeSet<Vec<u8>>> {
        match self.table.get_exact_entry(term)? {
            None => Ok(BTreeSet::new()),
            Some(tag) => decode_synonyms(&tag),
        }
    }

    /// The terms with synonyms, filtered to those starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn synonym_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        let mut cursor = self.table.cursor_get();
        cursor.find_entry_ge(prefix)?;
        while let Some(key) = cursor.current_key() {
            if !key.starts_with(prefix) {
                break;
            }
            out.push(key.to_vec());
            if !cursor.next()? {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn synonym_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table = SynonymTable::create(dir.path(), 2048)?;

        table.add_synonym(b"car", b"automobile")?;
        table.add_synonym(b"car", b"auto")?;
        table.add_synonym(b"car", b"automobile")?;
        table.add_synonym(b"cat", b"feline")?;

        assert_eq!(
            vec![b"auto".to_vec(), b"automobile".to_vec()],
            table.synonyms(b"car")?
        );
        assert_eq!(vec![b"feline".to_vec()], table.synonyms(b"cat")?);
        assert!(table.synonyms(b"dog")?.is_empty());

        assert_eq!(
            vec![b"car".to_vec(), b"cat".to_vec()],
            table.synonym_keys(b"ca")?
        );

        table.remove_synonym(b"car", b"auto")?;
        assert_eq!(vec![b"automobile".to_vec()], table.synonyms(b"car")?);

        table.remove_synonym(b"car", b"automobile")?;
        assert!(table.synonyms(b"car")?.is_empty());
        assert_eq!(vec![b"cat".to_vec()], table.synonym_keys(b"")?);

        table.clear_synonyms(b"cat")?;
        assert!(table.table().empty());
        Ok(())
    }
}
