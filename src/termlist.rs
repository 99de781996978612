// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The termlist table: which terms each document contains.
//!
//! Keys are docids; tags hold the document length, the term count, and
//! the terms in sorted order with prefix compression. Each term after the
//! first starts with a reuse byte whose low seven bits give the shared
//! prefix length; the high bit set folds in the overwhelmingly common
//! wdf of one, saving the explicit wdf varint.

use crate::{
    btree::table::Table,
    coding::pack::{pack_uint, pack_uint_preserving_sort, unpack_uint32},
    version::RootInfo,
    DocId, Error, Result, Revision, TermCount,
};
use std::path::Path;

/// Compression threshold for termlist tags.
const COMPRESS_MIN: u32 = 100;

const WDF_ONE_FLAG: u8 = 0x80;
const PREFIX_MASK: u8 = 0x7f;

/// Key of a document's termlist.
#[must_use]
pub fn termlist_key(did: DocId) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    pack_uint_preserving_sort(&mut key, u64::from(did));
    key
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Encodes a sorted `(term, wdf)` list plus the document length.
///
/// # Errors
///
/// Fails when the entries are unsorted or a term is empty/over-long.
pub fn encode_termlist(doclen: TermCount, entries: &[(Vec<u8>, TermCount)]) -> Result<Vec<u8>> {
    let mut tag = Vec::new();
    pack_uint(&mut tag, u64::from(doclen));
    pack_uint(&mut tag, entries.len() as u64);

    let mut prev: &[u8] = &[];
    for (index, (term, wdf)) in entries.iter().enumerate() {
        if term.is_empty() || term.len() > 255 {
            return Err(Error::InvalidArgument("unusable term in termlist".into()));
        }
        if index == 0 {
            tag.push(term.len() as u8);
            tag.extend_from_slice(term);
            pack_uint(&mut tag, u64::from(*wdf));
        } else {
            if term.as_slice() <= prev {
                return Err(Error::InvalidArgument("termlist not sorted".into()));
            }
            let reuse = common_prefix_len(prev, term).min(usize::from(PREFIX_MASK));
            let suffix = term.get(reuse..).unwrap_or_default();
            let mut reuse_byte = reuse as u8;
            if *wdf == 1 {
                reuse_byte |= WDF_ONE_FLAG;
            }
            tag.push(reuse_byte);
            tag.push(suffix.len() as u8);
            tag.extend_from_slice(suffix);
            if *wdf != 1 {
                pack_uint(&mut tag, u64::from(*wdf));
            }
        }
        prev = term;
    }
    Ok(tag)
}

/// Decodes a termlist tag into `(doclen, entries)`.
///
/// # Errors
///
/// Fails on truncated or unsorted data.
pub fn decode_termlist(mut tag: &[u8]) -> Result<(TermCount, Vec<(Vec<u8>, TermCount)>)> {
    let input = &mut tag;
    let doclen = unpack_uint32(input)?;
    let count = unpack_uint32(input)? as usize;

    let mut entries: Vec<(Vec<u8>, TermCount)> = Vec::with_capacity(count);
    let mut current: Vec<u8> = Vec::new();
    for index in 0..count {
        let wdf;
        if index == 0 {
            let Some((&len, rest)) = input.split_first() else {
                return Err(Error::Corrupt("termlist truncated".into()));
            };
            *input = rest;
            let len = usize::from(len);
            if input.len() < len {
                return Err(Error::Corrupt("termlist truncated".into()));
            }
            current = input.get(..len).unwrap_or_default().to_vec();
            *input = input.get(len..).unwrap_or_default();
            wdf = unpack_uint32(input)?;
        } else {
            let Some((&reuse_byte, rest)) = input.split_first() else {
                return Err(Error::Corrupt("termlist truncated".into()));
            };
            *input = rest;
            let Some((&add, rest)) = input.split_first() else {
                return Err(Error::Corrupt("termlist truncated".into()));
            };
            *input = rest;
            let reuse = usize::from(reuse_byte & PREFIX_MASK);
            let add = usize::from(add);
            if reuse > current.len() || input.len() < add {
                return Err(Error::Corrupt("termlist truncated".into()));
            }
            current.truncate(reuse);
            current.extend_from_slice(input.get(..add).unwrap_or_default());
            *input = input.get(add..).unwrap_or_default();
            wdf = if reuse_byte & WDF_ONE_FLAG != 0 {
                1
            } else {
                unpack_uint32(input)?
            };
        }
        if let Some((last, _)) = entries.last() {
            if current.as_slice() <= last.as_slice() {
                return Err(Error::Corrupt("termlist order broken".into()));
            }
        }
        entries.push((current.clone(), wdf));
    }
    Ok((doclen, entries))
}

/// The termlist table of one database.
#[derive(Clone)]
pub struct TermlistTable {
    table: Table,
}

impl TermlistTable {
    /// Creates a fresh termlist table.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn create(dir: &Path, block_size: u32) -> Result<Self> {
        let table = Table::create_and_open(
            &dir.join(crate::version::TableId::Termlist.filename()),
            "termlist",
            block_size,
            COMPRESS_MIN,
        )?;
        Ok(Self { table })
    }

    /// Opens the termlist table at a revision.
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
            &dir.join(crate::version::TableId::Termlist.filename()),
            "termlist",
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

    /// Stores a document's termlist; `entries` must be term-sorted.
    ///
    /// # Errors
    ///
    /// Fails on unsorted entries or I/O.
    pub fn set_termlist(
        &self,
        did: DocId,
        doclen: TermCount,
        entries: &[(Vec<u8>, TermCount)],
    ) -> Result<()> {
        let tag = encode_termlist(doclen, entries)?;
        self.table.add(&termlist_key(did), &tag)
    }

    /// Removes a document's termlist.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn delete_termlist(&self, did: DocId) -> Result<()> {
        self.table.del(&termlist_key(did))?;
        Ok(())
    }

    /// Reads a document's `(doclen, entries)`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt data.
    pub fn get_termlist(&self, did: DocId) -> Result<Option<(TermCount, Vec<(Vec<u8>, TermCount)>)>> {
        match self.table.get_exact_entry(&termlist_key(did))? {
            None => Ok(None),
            Some(tag) => Ok(Some(decode_termlist(&tag)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn entries(raw: &[(&str, TermCount)]) -> Vec<(Vec<u8>, TermCount)> {
        raw.iter()
            .map(|(term, wdf)| (term.as_bytes().to_vec(), *wdf))
            .collect()
    }

    #[test]
    fn termlist_roundtrip() {
        let list = entries(&[
            ("brown", 1),
            ("fox", 4),
            ("foxes", 1),
            ("foxtrot", 2),
            ("quick", 1),
        ]);
        let tag = encode_termlist(9, &list).unwrap();
        let (doclen, decoded) = decode_termlist(&tag).unwrap();
        assert_eq!(9, doclen);
        assert_eq!(list, decoded);
    }

    #[test]
    fn shared_prefixes_and_folded_wdf_shrink_the_tag() {
        let compressed = entries(&[("prefix-aaa", 1), ("prefix-aab", 1), ("prefix-aac", 1)]);
        let tag = encode_termlist(3, &compressed).unwrap();
        // 3 terms of 10 bytes stored naively would need 30 bytes of term
        // data alone; shared prefixes collapse that.
        assert!(tag.len() < 20, "{} bytes", tag.len());
    }

    #[test]
    fn empty_termlist_roundtrip() {
        let tag = encode_termlist(0, &[]).unwrap();
        let (doclen, decoded) = decode_termlist(&tag).unwrap();
        assert_eq!(0, doclen);
        assert!(decoded.is_empty());
    }

    #[test]
    fn unsorted_input_is_rejected() {
        let list = entries(&[("zebra", 1), ("aardvark", 1)]);
        assert!(matches!(
            encode_termlist(2, &list),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn table_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table = TermlistTable::create(dir.path(), 2048)?;

        let list = entries(&[("brown", 1), ("fox", 1), ("quick", 1), ("the", 1)]);
        table.set_termlist(1, 4, &list)?;

        let (doclen, decoded) = table.get_termlist(1)?.unwrap();
        assert_eq!(4, doclen);
        assert_eq!(list, decoded);
        assert!(table.get_termlist(2)?.is_none());

        table.delete_termlist(1)?;
        assert!(table.get_termlist(1)?.is_none());
        Ok(())
    }
}
