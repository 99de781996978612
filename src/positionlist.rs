// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The position table: where in each document a term occurs.
//!
//! Keys are `(term, docid)`; tags are interpolative-coded position lists.
//! A single-position list is just the position as a varint. A longer list
//! stores its last position as a varint, then bit-packs the first
//! position, the count, and the interpolative body — consecutive runs
//! cost zero bits.

use crate::{
    btree::table::{Table, DONT_COMPRESS},
    coding::{
        bitstream::{BitReader, BitWriter},
        pack::{
            pack_string_preserving_sort, pack_uint, pack_uint_preserving_sort, unpack_uint32,
        },
    },
    version::RootInfo,
    DocId, Error, Result, Revision, TermCount,
};
use std::path::Path;

/// Key of the position list of `term` in `did`.
#[must_use]
pub fn position_key(term: &[u8], did: DocId) -> Vec<u8> {
    let mut key = Vec::with_capacity(term.len() + 6);
    pack_string_preserving_sort(&mut key, term, false);
    pack_uint_preserving_sort(&mut key, u64::from(did));
    key
}

/// Encodes a strictly increasing position list.
#[must_use]
pub fn pack_positions(positions: &[TermCount]) -> Vec<u8> {
    debug_assert!(!positions.is_empty());
    debug_assert!(positions.windows(2).all(|w| w[0] < w[1]));

    let last = positions.last().copied().unwrap_or(0);
    let mut out = Vec::new();
    pack_uint(&mut out, u64::from(last));

    if positions.len() > 1 {
        let first = positions.first().copied().unwrap_or(0);
        let mut writer = BitWriter::new(out);
        writer.encode(first, last);
        writer.encode(positions.len() as u32 - 2, last - first);
        writer.encode_interpolative(positions, 0, positions.len() - 1);
        out = writer.freeze();
    }
    out
}

/// Decodes a position list back into its positions.
///
/// # Errors
///
/// Fails when the data does not decode to a strictly increasing list.
pub fn unpack_positions(mut data: &[u8]) -> Result<Vec<TermCount>> {
    let input = &mut data;
    let last = unpack_uint32(input)?;
    if input.is_empty() {
        return Ok(vec![last]);
    }

    let mut reader = BitReader::new(input);
    let first = reader.decode(last);
    let size = reader
        .decode(last - first)
        .checked_add(2)
        .ok_or_else(|| Error::Corrupt("position list count overflow".into()))? as usize;

    let mut positions = vec![0 as TermCount; size];
    if let Some(slot) = positions.first_mut() {
        *slot = first;
    }
    if let Some(slot) = positions.last_mut() {
        *slot = last;
    }
    reader.decode_interpolative(&mut positions, 0, size - 1);

    if !positions.windows(2).all(|w| w[0] < w[1]) {
        return Err(Error::Corrupt("position list not strictly increasing".into()));
    }
    Ok(positions)
}

/// Number of positions in an encoded list, without a full decode.
///
/// # Errors
///
/// Fails on truncated data.
pub fn position_count(mut data: &[u8]) -> Result<TermCount> {
    let input = &mut data;
    let last = unpack_uint32(input)?;
    if input.is_empty() {
        return Ok(1);
    }
    let mut reader = BitReader::new(input);
    let first = reader.decode(last);
    Ok(reader
        .decode(last - first)
        .checked_add(2)
        .ok_or_else(|| Error::Corrupt("position list count overflow".into()))?)
}

/// Streams one `(term, docid)` pair's positions in increasing order.
pub struct PositionReader {
    positions: Vec<TermCount>,
    pos: usize,
}

impl PositionReader {
    /// Builds a reader over encoded data.
    ///
    /// # Errors
    ///
    /// As [`unpack_positions`].
    pub fn new(data: &[u8]) -> Result<Self> {
        Ok(Self {
            positions: unpack_positions(data)?,
            pos: 0,
        })
    }

    /// Number of positions.
    #[must_use]
    pub fn count(&self) -> TermCount {
        self.positions.len() as TermCount
    }

    /// The largest position.
    #[must_use]
    pub fn back(&self) -> TermCount {
        self.positions.last().copied().unwrap_or(0)
    }

    /// The next position.
    pub fn next(&mut self) -> Option<TermCount> {
        let position = self.positions.get(self.pos).copied();
        self.pos += 1;
        position
    }

    /// The first position `>= target`; short-circuits off the stored
    /// maximum without scanning when the target lies past it.
    pub fn skip_to(&mut self, target: TermCount) -> Option<TermCount> {
        if target > self.back() {
            self.pos = self.positions.len();
            return None;
        }
        while let Some(position) = self.positions.get(self.pos).copied() {
            self.pos += 1;
            if position >= target {
                return Some(position);
            }
        }
        None
    }
}

/// The position table of one database.
#[derive(Clone)]
pub struct PositionTable {
    table: Table,
}

impl PositionTable {
    /// Creates a fresh position table.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn create(dir: &Path, block_size: u32) -> Result<Self> {
        let table = Table::create_and_open(
            &dir.join(crate::version::TableId::Position.filename()),
            "position",
            block_size,
            DONT_COMPRESS,
        )?;
        Ok(Self { table })
    }

    /// Opens the position table at a revision.
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
            &dir.join(crate::version::TableId::Position.filename()),
            "position",
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

    /// Stores a position list; an empty list removes the entry.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn set_positionlist(
        &self,
        term: &[u8],
        did: DocId,
        positions: &[TermCount],
    ) -> Result<()> {
        let key = position_key(term, did);
        if positions.is_empty() {
            self.table.del(&key)?;
            Ok(())
        } else {
            self.table.add(&key, &pack_positions(positions))
        }
    }

    /// Removes a position list.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn delete_positionlist(&self, term: &[u8], did: DocId) -> Result<()> {
        self.table.del(&position_key(term, did))?;
        Ok(())
    }

    /// Reads the position list of `(term, did)`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or a corrupt list.
    pub fn positions(&self, term: &[u8], did: DocId) -> Result<Option<PositionReader>> {
        match self.table.get_exact_entry(&position_key(term, did))? {
            None => Ok(None),
            Some(tag) => Ok(Some(PositionReader::new(&tag)?)),
        }
    }

    /// Number of positions of `(term, did)`; 0 when absent.
    ///
    /// # Errors
    ///
    /// Fails on I/O or a corrupt list.
    pub fn positionlist_count(&self, term: &[u8], did: DocId) -> Result<TermCount> {
        match self.table.get_exact_entry(&position_key(term, did))? {
            None => Ok(0),
            Some(tag) => position_count(&tag),
        }
    }
}
