// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Value streams and per-slot statistics.
//!
//! A document may carry byte-string values in numbered slots. Each slot's
//! values are stored as a docid-ordered stream of chunks in the postlist
//! table; every chunk's key names the slot and the chunk's first docid.
//! A slot's statistics entry tracks how many documents use it and the
//! lexicographic bounds of the stored values.

use super::{
    value_chunk_key, value_chunk_prefix, value_stats_key, PostlistTable, CHUNK_SIZE_TARGET,
};
use crate::{
    btree::table::Table,
    coding::pack::{pack_string, pack_uint, unpack_string, unpack_uint32, unpack_uint_preserving_sort},
    DocId, Error, Result, ValueSlot,
};
use std::collections::BTreeMap;

/// Statistics of one value slot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValueStats {
    /// Number of documents with a value in the slot.
    pub freq: u32,
    /// Smallest value (lexicographically).
    pub lower_bound: Vec<u8>,
    /// Largest value (lexicographically).
    pub upper_bound: Vec<u8>,
}

impl ValueStats {
    fn encode(&self) -> Vec<u8> {
        let mut tag = Vec::new();
        pack_uint(&mut tag, u64::from(self.freq));
        pack_string(&mut tag, &self.lower_bound);
        tag.extend_from_slice(&self.upper_bound);
        tag
    }

    fn decode(mut tag: &[u8]) -> Result<Self> {
        let input = &mut tag;
        let freq = unpack_uint32(input)?;
        let lower_bound = unpack_string(input)?;
        let upper_bound = input.to_vec();
        Ok(Self {
            freq,
            lower_bound,
            upper_bound,
        })
    }

    /// Widens the bounds to cover `value` and counts it.
    pub fn include(&mut self, value: &[u8]) {
        if self.freq == 0 {
            self.lower_bound = value.to_vec();
            self.upper_bound = value.to_vec();
        } else {
            if value < self.lower_bound.as_slice() {
                self.lower_bound = value.to_vec();
            }
            if value > self.upper_bound.as_slice() {
                self.upper_bound = value.to_vec();
            }
        }
        self.freq += 1;
    }
}

fn encode_value_chunk(entries: &[(DocId, Vec<u8>)]) -> Vec<u8> {
    debug_assert!(!entries.is_empty());
    let mut tag = Vec::new();
    let mut prev = None;
    for (did, value) in entries {
        if let Some(prev) = prev {
            debug_assert!(*did > prev);
            pack_uint(&mut tag, u64::from(did - prev - 1));
        }
        pack_string(&mut tag, value);
        prev = Some(*did);
    }
    tag
}

fn decode_value_chunk(mut tag: &[u8], first_did: DocId) -> Result<Vec<(DocId, Vec<u8>)>> {
    let input = &mut tag;
    if input.is_empty() {
        return Err(Error::Corrupt("value chunk with no entries".into()));
    }
    let mut entries = Vec::new();
    let mut did = first_did;
    entries.push((did, unpack_string(input)?));
    while !input.is_empty() {
        let delta = unpack_uint32(input)?;
        did = did
            .checked_add(delta)
            .and_then(|d| d.checked_add(1))
            .ok_or_else(|| Error::Corrupt("docid overflow in value chunk".into()))?;
        entries.push((did, unpack_string(input)?));
    }
    Ok(entries)
}

fn chunk_first_did(key: &[u8], prefix_len: usize) -> Result<DocId> {
    let mut rest = key.get(prefix_len..).unwrap_or_default();
    DocId::try_from(unpack_uint_preserving_sort(&mut rest)?)
        .map_err(|_| Error::Corrupt("value chunk docid overflow".into()))
}

impl PostlistTable {
    /// Lists the slots that currently have a statistics entry.
    ///
    /// # Errors
    ///
    /// Fails on I/O or a corrupt key.
    pub fn value_slots(&self) -> Result<Vec<ValueSlot>> {
        let prefix = b"\0\xd0";
        let mut out = Vec::new();
        let mut cursor = self.table().cursor_get();
        cursor.find_entry_ge(prefix)?;
        while let Some(key) = cursor.current_key() {
            if !key.starts_with(prefix) {
                break;
            }
            let mut rest = key.get(prefix.len()..).unwrap_or_default();
            let slot = ValueSlot::try_from(unpack_uint_preserving_sort(&mut rest)?)
                .map_err(|_| Error::Corrupt("value slot overflow".into()))?;
            out.push(slot);
            if !cursor.next()? {
                break;
            }
        }
        Ok(out)
    }

    /// Reads a slot's statistics; `None` when no document uses the slot.
    ///
    /// # Errors
    ///
    /// Fails on I/O or a corrupt record.
    pub fn value_stats(&self, slot: ValueSlot) -> Result<Option<ValueStats>> {
        match self.table().get_exact_entry(&value_stats_key(slot))? {
            None => Ok(None),
            Some(tag) => Ok(Some(ValueStats::decode(&tag)?)),
        }
    }

    /// Writes a slot's statistics; zero frequency removes the entry.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn set_value_stats(&self, slot: ValueSlot, stats: &ValueStats) -> Result<()> {
        let key = value_stats_key(slot);
        if stats.freq == 0 {
            self.table().del(&key)?;
            Ok(())
        } else {
            self.table().add(&key, &stats.encode())
        }
    }

    /// Reads one document's value in a slot.
    ///
    /// # Errors
    ///
    /// Fails on I/O or a corrupt chunk.
    pub fn get_value(&self, slot: ValueSlot, did: DocId) -> Result<Option<Vec<u8>>> {
        let prefix = value_chunk_prefix(slot);
        let mut cursor = self.table().cursor_get();
        cursor.find_entry_le(&value_chunk_key(slot, did))?;
        let Some(key) = cursor.current_key() else {
            return Ok(None);
        };
        if !key.starts_with(&prefix) {
            return Ok(None);
        }
        let first_did = chunk_first_did(key, prefix.len())?;
        let (tag, _) = cursor.read_tag_raw()?;
        let entries = decode_value_chunk(&tag, first_did)?;
        Ok(entries
            .binary_search_by_key(&did, |e| e.0)
            .ok()
            .and_then(|index| entries.into_iter().nth(index))
            .map(|(_, value)| value))
    }

    /// A docid-ordered reader over a slot's values.
    ///
    /// # Errors
    ///
    /// Fails on I/O or a corrupt chunk.
    pub fn values(&self, slot: ValueSlot) -> Result<ValueReader> {
        Ok(ValueReader {
            table: self.table().clone(),
            slot,
            entries: Vec::new(),
            pos: 0,
            started: false,
        })
    }

    /// Applies buffered value changes for one slot, merging chunk by
    /// chunk and keeping per-chunk docid ranges disjoint.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt existing chunks.
    pub fn merge_value_changes(
        &self,
        slot: ValueSlot,
        changes: &BTreeMap<DocId, Option<Vec<u8>>>,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let prefix = value_chunk_prefix(slot);
        let first_changed = changes.keys().next().copied().unwrap_or(0);

        // Read the chunks from the one containing the first change to the
        // slot's end, noting their keys.
        let mut existing: Vec<(DocId, Vec<u8>)> = Vec::new();
        let mut replaced: Vec<Vec<u8>> = Vec::new();
        {
            let mut cursor = self.table().cursor_get();
            cursor.find_entry_le(&value_chunk_key(slot, first_changed))?;
            let on_ours = cursor
                .current_key()
                .is_some_and(|key| key.starts_with(&prefix));
            if !on_ours {
                // No chunk starts at or below the first change; begin at
                // the slot's first chunk, if any.
                cursor.find_entry_ge(&prefix)?;
            }
            loop {
                let Some(key) = cursor.current_key() else { break };
                if !key.starts_with(&prefix) {
                    break;
                }
                let key = key.to_vec();
                let first_did = chunk_first_did(&key, prefix.len())?;
                let (tag, _) = cursor.read_tag_raw()?;
                existing.extend(decode_value_chunk(&tag, first_did)?);
                replaced.push(key);
                if !cursor.next()? {
                    break;
                }
            }
        }

        // Merge.
        let mut merged: BTreeMap<DocId, Vec<u8>> = existing.into_iter().collect();
        for (&did, change) in changes {
            match change {
                Some(value) => {
                    merged.insert(did, value.clone());
                }
                None => {
                    merged.remove(&did);
                }
            }
        }

        // Replace.
        for key in &replaced {
            self.table().del(key)?;
        }
        let merged: Vec<(DocId, Vec<u8>)> = merged.into_iter().collect();
        let mut start = 0usize;
        let mut bytes = 0usize;
        for index in 0..merged.len() {
            bytes += merged.get(index).map_or(0, |e| e.1.len() + 3);
            let flush = bytes >= CHUNK_SIZE_TARGET || index + 1 == merged.len();
            if flush {
                let run = merged.get(start..=index).unwrap_or_default();
                if let Some(&(first_did, _)) = run.first() {
                    self.table()
                        .add(&value_chunk_key(slot, first_did), &encode_value_chunk(run))?;
                }
                start = index + 1;
                bytes = 0;
            }
        }
        Ok(())
    }
}

/// Streams `(docid, value)` for one slot, in docid order.
pub struct ValueReader {
    table: Table,
    slot: ValueSlot,
    entries: Vec<(DocId, Vec<u8>)>,
    pos: usize,
    started: bool,
}

impl ValueReader {
    /// The next value, or `None` at the end of the stream.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt chunks.
    pub fn next(&mut self) -> Result<Option<(DocId, Vec<u8>)>> {
        loop {
            if self.pos < self.entries.len() {
                let entry = self.entries.get(self.pos).cloned();
                self.pos += 1;
                return Ok(entry);
            }
            if !self.advance_chunk()? {
                return Ok(None);
            }
        }
    }

    /// Skips to the first value with docid `>= target`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt chunks.
    pub fn skip_to(&mut self, target: DocId) -> Result<Option<(DocId, Vec<u8>)>> {
        loop {
            while let Some(entry) = self.entries.get(self.pos) {
                if entry.0 >= target {
                    let entry = entry.clone();
                    self.pos += 1;
                    return Ok(Some(entry));
                }
                self.pos += 1;
            }
            if !self.advance_chunk()? {
                return Ok(None);
            }
        }
    }

    fn advance_chunk(&mut self) -> Result<bool> {
        let prefix = value_chunk_prefix(self.slot);
        let from = if self.started {
            let Some(&(last, _)) = self.entries.last() else {
                return Ok(false);
            };
            let Some(next) = last.checked_add(1) else {
                return Ok(false);
            };
            value_chunk_key(self.slot, next)
        } else {
            prefix.clone()
        };
        self.started = true;

        let mut cursor = self.table.cursor_get();
        cursor.find_entry_ge(&from)?;
        let Some(key) = cursor.current_key() else {
            return Ok(false);
        };
        if !key.starts_with(&prefix) {
            return Ok(false);
        }
        let first_did = chunk_first_did(key, prefix.len())?;
        let (tag, _) = cursor.read_tag_raw()?;
        self.entries = decode_value_chunk(&tag, first_did)?;
        self.pos = 0;
        Ok(true)
    }
}
