// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The postlist table and the encodings layered onto it.
//!
//! One table carries several disjoint key spaces, told apart by the first
//! byte of the key:
//!
//! | key | contents |
//! |---|---|
//! | `\0` | metainfo: last docid, doclen bounds, wdf bound, total doclen |
//! | `\0\xc0` + name | user metadata |
//! | `\0\xd0` + slot | value-slot statistics |
//! | `\0\xd8` + slot + docid | value-stream chunk |
//! | `\0\xe0` `[` + docid `]` | document-length chunk |
//! | escaped term `[` + docid `]` | per-term posting chunk |
//!
//! Terms are escaped with the sort-preserving string encoding, so a term
//! key never collides with the `\0`-prefixed specials and chunk keys sort
//! by `(term, first docid)`.
//!
//! A posting list is one initial chunk (no docid in the key; its tag opens
//! with termfreq and collection frequency) plus continuation chunks whose
//! keys append the chunk's first docid. Entries are delta-coded docids
//! with within-document frequencies.

pub mod inverter;
pub mod values;

use crate::{
    btree::table::{Table, DONT_COMPRESS},
    coding::pack::{
        pack_bool, pack_string_preserving_sort, pack_uint, pack_uint_preserving_sort, unpack_bool,
        unpack_uint, unpack_uint32, unpack_uint_preserving_sort,
    },
    version::RootInfo,
    DocId, Error, Result, Revision, TermCount,
};
use std::collections::BTreeMap;
use std::path::Path;

/// Soft bound on the encoded size of one chunk's entries.
pub const CHUNK_SIZE_TARGET: usize = 2000;

const META_PREFIX: &[u8] = b"\0";
const USER_METADATA_PREFIX: &[u8] = b"\0\xc0";
const VALUE_STATS_PREFIX: &[u8] = b"\0\xd0";
const VALUE_CHUNK_PREFIX: &[u8] = b"\0\xd8";
const DOCLEN_PREFIX: &[u8] = b"\0\xe0";

// ---- key construction ----------------------------------------------------

/// Key of the metainfo entry.
#[must_use]
pub fn metainfo_key() -> Vec<u8> {
    META_PREFIX.to_vec()
}

/// Key of a user metadata entry.
#[must_use]
pub fn user_metadata_key(name: &[u8]) -> Vec<u8> {
    let mut key = USER_METADATA_PREFIX.to_vec();
    key.extend_from_slice(name);
    key
}

/// Key of a value slot's statistics entry.
#[must_use]
pub fn value_stats_key(slot: u32) -> Vec<u8> {
    let mut key = VALUE_STATS_PREFIX.to_vec();
    pack_uint_preserving_sort(&mut key, u64::from(slot));
    key
}

/// Key of the value-stream chunk of `slot` starting at `did`.
#[must_use]
pub fn value_chunk_key(slot: u32, did: DocId) -> Vec<u8> {
    let mut key = VALUE_CHUNK_PREFIX.to_vec();
    pack_uint_preserving_sort(&mut key, u64::from(slot));
    pack_uint_preserving_sort(&mut key, u64::from(did));
    key
}

/// Key prefix shared by every value-stream chunk of `slot`.
#[must_use]
pub fn value_chunk_prefix(slot: u32) -> Vec<u8> {
    let mut key = VALUE_CHUNK_PREFIX.to_vec();
    pack_uint_preserving_sort(&mut key, u64::from(slot));
    key
}

/// Key of the initial document-length chunk.
#[must_use]
pub fn doclen_initial_key() -> Vec<u8> {
    DOCLEN_PREFIX.to_vec()
}

/// Key of the continuation document-length chunk starting at `did`.
#[must_use]
pub fn doclen_chunk_key(did: DocId) -> Vec<u8> {
    let mut key = DOCLEN_PREFIX.to_vec();
    pack_uint_preserving_sort(&mut key, u64::from(did));
    key
}

/// Key of a term's initial posting chunk.
#[must_use]
pub fn postlist_key(term: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(term.len() + 1);
    pack_string_preserving_sort(&mut key, term, true);
    key
}

/// Key of a term's continuation chunk starting at `did`.
#[must_use]
pub fn postlist_chunk_key(term: &[u8], did: DocId) -> Vec<u8> {
    let mut key = Vec::with_capacity(term.len() + 6);
    pack_string_preserving_sort(&mut key, term, false);
    pack_uint_preserving_sort(&mut key, u64::from(did));
    key
}

/// Key prefix shared by a term's continuation chunks.
#[must_use]
pub fn postlist_chunk_prefix(term: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(term.len() + 1);
    pack_string_preserving_sort(&mut key, term, false);
    key
}

/// Recovers the term from a posting-chunk key. Returns the term and the
/// chunk's first docid (`None` for an initial chunk), or `None` for keys
/// of other key spaces.
#[must_use]
pub fn parse_postlist_key(key: &[u8]) -> Option<(Vec<u8>, Option<DocId>)> {
    if key.first() == Some(&0) {
        return None;
    }
    // A continuation key contains the unescaped terminator; an initial key
    // does not.
    let mut input = key;
    match crate::coding::pack::unpack_string_preserving_sort(&mut input) {
        Ok(term) => {
            let did = unpack_uint_preserving_sort(&mut input).ok()?;
            Some((term, Some(DocId::try_from(did).ok()?)))
        }
        Err(_) => {
            let mut input = key;
            let term =
                crate::coding::pack::unpack_string_preserving_sort_last(&mut input).ok()?;
            Some((term, None))
        }
    }
}

// ---- chunk bodies --------------------------------------------------------

/// Delta-encodes `(docid, count)` entries; the first docid is implied by
/// the chunk header or key.
fn encode_entries(out: &mut Vec<u8>, entries: &[(DocId, TermCount)]) {
    let mut prev = None;
    for &(did, count) in entries {
        if let Some(prev) = prev {
            debug_assert!(did > prev);
            pack_uint(out, u64::from(did - prev - 1));
        }
        pack_uint(out, u64::from(count));
        prev = Some(did);
    }
}

fn decode_entries(
    input: &mut &[u8],
    first_did: DocId,
    out: &mut Vec<(DocId, TermCount)>,
) -> Result<()> {
    if input.is_empty() {
        return Err(Error::Corrupt("posting chunk with no entries".into()));
    }
    let mut did = first_did;
    let count = unpack_uint32(input)?;
    out.push((did, count));
    while !input.is_empty() {
        let delta = unpack_uint32(input)?;
        let count = unpack_uint32(input)?;
        did = did
            .checked_add(delta)
            .and_then(|d| d.checked_add(1))
            .ok_or_else(|| Error::Corrupt("docid overflow in posting chunk".into()))?;
        out.push((did, count));
    }
    Ok(())
}

/// A decoded posting (or doclen) chunk.
struct Chunk {
    entries: Vec<(DocId, TermCount)>,
    is_last: bool,
}

/// Header of an initial per-term chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermHeader {
    /// Number of documents containing the term.
    pub termfreq: TermCount,
    /// Sum of the term's wdf over all documents.
    pub collection_freq: u64,
}

fn decode_initial_chunk(mut tag: &[u8]) -> Result<(TermHeader, Chunk)> {
    let input = &mut tag;
    let termfreq = unpack_uint32(input)?;
    let collection_freq = unpack_uint(input)?;
    let first_did_less_1 = unpack_uint32(input)?;
    let is_last = unpack_bool(input)?;
    let mut entries = Vec::new();
    decode_entries(input, first_did_less_1 + 1, &mut entries)?;
    Ok((
        TermHeader {
            termfreq,
            collection_freq,
        },
        Chunk { entries, is_last },
    ))
}

fn decode_continuation_chunk(mut tag: &[u8], first_did: DocId) -> Result<Chunk> {
    let input = &mut tag;
    let is_last = unpack_bool(input)?;
    let mut entries = Vec::new();
    decode_entries(input, first_did, &mut entries)?;
    Ok(Chunk { entries, is_last })
}

fn encode_initial_chunk(
    header: TermHeader,
    is_last: bool,
    entries: &[(DocId, TermCount)],
) -> Vec<u8> {
    debug_assert!(!entries.is_empty());
    let mut tag = Vec::new();
    pack_uint(&mut tag, u64::from(header.termfreq));
    pack_uint(&mut tag, header.collection_freq);
    pack_uint(&mut tag, u64::from(entries.first().map_or(1, |e| e.0) - 1));
    pack_bool(&mut tag, is_last);
    encode_entries(&mut tag, entries);
    tag
}

fn encode_continuation_chunk(is_last: bool, entries: &[(DocId, TermCount)]) -> Vec<u8> {
    debug_assert!(!entries.is_empty());
    let mut tag = Vec::new();
    pack_bool(&mut tag, is_last);
    encode_entries(&mut tag, entries);
    tag
}

/// Splits a merged entry stream into chunk-sized runs.
fn chunk_runs(entries: &[(DocId, TermCount)]) -> Vec<&[(DocId, TermCount)]> {
    let mut runs = Vec::new();
    let mut start = 0usize;
    let mut bytes = 0usize;
    for (index, &(_, count)) in entries.iter().enumerate() {
        // Rough per-entry cost: delta varint + count varint.
        bytes += 2 + (u64::from(count).max(1).ilog2() as usize) / 7;
        if bytes >= CHUNK_SIZE_TARGET && index + 1 < entries.len() {
            runs.push(entries.get(start..=index).unwrap_or_default());
            start = index + 1;
            bytes = 0;
        }
    }
    if start < entries.len() {
        runs.push(entries.get(start..).unwrap_or_default());
    }
    runs
}

// ---- metainfo ------------------------------------------------------------

/// The statistics stored under the single-`\0` key.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metainfo {
    /// Highest document id ever used.
    pub last_docid: DocId,
    /// Lower bound on document length.
    pub doclen_lower_bound: TermCount,
    /// Upper bound on within-document frequency.
    pub wdf_upper_bound: TermCount,
    /// Upper bound on document length.
    pub doclen_upper_bound: TermCount,
    /// Sum of all document lengths.
    pub total_doclen: u64,
}

impl Metainfo {
    fn encode(&self) -> Vec<u8> {
        let mut tag = Vec::new();
        pack_uint(&mut tag, u64::from(self.last_docid));
        pack_uint(&mut tag, u64::from(self.doclen_lower_bound));
        pack_uint(&mut tag, u64::from(self.wdf_upper_bound));
        pack_uint(&mut tag, u64::from(self.doclen_upper_bound));
        pack_uint(&mut tag, self.total_doclen);
        tag
    }

    fn decode(mut tag: &[u8]) -> Result<Self> {
        let input = &mut tag;
        Ok(Self {
            last_docid: unpack_uint32(input)?,
            doclen_lower_bound: unpack_uint32(input)?,
            wdf_upper_bound: unpack_uint32(input)?,
            doclen_upper_bound: unpack_uint32(input)?,
            total_doclen: unpack_uint(input)?,
        })
    }
}

// ---- the table wrapper ---------------------------------------------------

/// The postlist table of one database.
#[derive(Clone)]
pub struct PostlistTable {
    table: Table,
}

impl PostlistTable {
    /// Creates a fresh postlist table.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn create(dir: &Path, block_size: u32) -> Result<Self> {
        let table = Table::create_and_open(
            &dir.join(crate::version::TableId::Postlist.filename()),
            "postlist",
            block_size,
            DONT_COMPRESS,
        )?;
        Ok(Self { table })
    }

    /// Opens the postlist table at a revision.
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
            &dir.join(crate::version::TableId::Postlist.filename()),
            "postlist",
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

    // ---- metainfo and user metadata -------------------------------------

    /// Reads the metainfo entry; `None` on a database that never held a
    /// document.
    ///
    /// # Errors
    ///
    /// Fails on I/O or a corrupt record.
    pub fn get_metainfo(&self) -> Result<Option<Metainfo>> {
        match self.table.get_exact_entry(&metainfo_key())? {
            None => Ok(None),
            Some(tag) => Ok(Some(Metainfo::decode(&tag)?)),
        }
    }

    /// Writes the metainfo entry.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn set_metainfo(&self, metainfo: &Metainfo) -> Result<()> {
        self.table.add(&metainfo_key(), &metainfo.encode())
    }

    /// Reads one user metadata value; empty and absent are synonymous.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn get_user_metadata(&self, name: &[u8]) -> Result<Vec<u8>> {
        Ok(self
            .table
            .get_exact_entry(&user_metadata_key(name))?
            .unwrap_or_default())
    }

    /// Writes one user metadata value; an empty value removes the entry.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn set_user_metadata(&self, name: &[u8], value: &[u8]) -> Result<()> {
        let key = user_metadata_key(name);
        if value.is_empty() {
            self.table.del(&key)?;
            Ok(())
        } else {
            self.table.add(&key, value)
        }
    }

    /// Lists the user metadata keys starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn metadata_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut wanted = USER_METADATA_PREFIX.to_vec();
        wanted.extend_from_slice(prefix);

        let mut out = Vec::new();
        let mut cursor = self.table.cursor_get();
        cursor.find_entry_ge(&wanted)?;
        while let Some(key) = cursor.current_key() {
            if !key.starts_with(&wanted) {
                break;
            }
            out.push(key.get(USER_METADATA_PREFIX.len()..).unwrap_or_default().to_vec());
            if !cursor.next()? {
                break;
            }
        }
        Ok(out)
    }

    // ---- postlist reads ---------------------------------------------------

    /// The `(termfreq, collection_freq)` of a term; `None` for unindexed
    /// terms.
    ///
    /// # Errors
    ///
    /// Fails on I/O or a corrupt chunk.
    pub fn term_info(&self, term: &[u8]) -> Result<Option<TermHeader>> {
        match self.table.get_exact_entry(&postlist_key(term))? {
            None => Ok(None),
            Some(tag) => Ok(Some(decode_initial_chunk(&tag)?.0)),
        }
    }

    /// A reader over a term's postings; `None` for unindexed terms.
    ///
    /// # Errors
    ///
    /// Fails on I/O or a corrupt chunk.
    pub fn postings(&self, term: &[u8]) -> Result<Option<PostlistReader>> {
        let Some(tag) = self.table.get_exact_entry(&postlist_key(term))? else {
            return Ok(None);
        };
        let (header, chunk) = decode_initial_chunk(&tag)?;
        Ok(Some(PostlistReader {
            table: self.table.clone(),
            term: term.to_vec(),
            header,
            entries: chunk.entries,
            pos: 0,
            at_last_chunk: chunk.is_last,
        }))
    }

    /// The length (sum of wdfs) of one document.
    ///
    /// # Errors
    ///
    /// Fails with the missing-document error when `did` does not exist.
    pub fn doclen(&self, did: DocId) -> Result<TermCount> {
        let chunk = self.locate_doclen_chunk(did)?;
        if let Some(chunk) = chunk {
            if let Ok(index) = chunk.entries.binary_search_by_key(&did, |e| e.0) {
                return Ok(chunk.entries.get(index).map_or(0, |e| e.1));
            }
        }
        Err(Error::DocNotFound(did))
    }

    fn locate_doclen_chunk(&self, did: DocId) -> Result<Option<Chunk>> {
        let mut cursor = self.table.cursor_get();
        cursor.find_entry_le(&doclen_chunk_key(did))?;
        let Some(key) = cursor.current_key() else {
            return Ok(None);
        };
        if !key.starts_with(DOCLEN_PREFIX) {
            return Ok(None);
        }
        let first_did = if key == doclen_initial_key() {
            let (tag, _) = cursor.read_tag_raw()?;
            return Ok(Some(decode_doclen_initial(&tag)?));
        } else {
            let mut rest = key.get(DOCLEN_PREFIX.len()..).unwrap_or_default();
            DocId::try_from(unpack_uint_preserving_sort(&mut rest)?)
                .map_err(|_| Error::Corrupt("doclen chunk docid overflow".into()))?
        };
        let (tag, _) = cursor.read_tag_raw()?;
        Ok(Some(decode_continuation_chunk(&tag, first_did)?))
    }

    /// A reader over every document's length, in docid order; `None` when
    /// the database holds no documents.
    ///
    /// # Errors
    ///
    /// Fails on I/O or a corrupt chunk.
    pub fn doclens(&self) -> Result<Option<DoclenReader>> {
        let Some(tag) = self.table.get_exact_entry(&doclen_initial_key())? else {
            return Ok(None);
        };
        let chunk = decode_doclen_initial(&tag)?;
        Ok(Some(DoclenReader {
            table: self.table.clone(),
            entries: chunk.entries,
            pos: 0,
            at_last_chunk: chunk.is_last,
        }))
    }

    // ---- commit-time merging ---------------------------------------------

    /// Applies one term's buffered changes to its chunks.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt existing chunks.
    pub fn merge_term_changes(
        &self,
        term: &[u8],
        tf_delta: i64,
        cf_delta: i64,
        changes: &BTreeMap<DocId, Option<TermCount>>,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let initial_key = postlist_key(term);
        let existing = self.table.get_exact_entry(&initial_key)?;

        let Some(initial_tag) = existing else {
            // A brand-new term: deletions cannot apply.
            let entries: Vec<(DocId, TermCount)> = changes
                .iter()
                .filter_map(|(&did, &wdf)| wdf.map(|w| (did, w)))
                .collect();
            if entries.is_empty() {
                return Ok(());
            }
            let header = TermHeader {
                termfreq: entries.len() as TermCount,
                collection_freq: entries.iter().map(|e| u64::from(e.1)).sum(),
            };
            self.write_term_chunks(term, header, &entries)?;
            return Ok(());
        };

        let (header, _) = decode_initial_chunk(&initial_tag)?;
        let new_tf = i64::from(header.termfreq) + tf_delta;
        let new_cf = i64::try_from(header.collection_freq).unwrap_or(i64::MAX) + cf_delta;
        if new_tf <= 0 {
            self.delete_term_chunks(term)?;
            return Ok(());
        }
        let new_header = TermHeader {
            termfreq: TermCount::try_from(new_tf)
                .map_err(|_| Error::Corrupt("termfreq overflow".into()))?,
            collection_freq: u64::try_from(new_cf.max(0)).unwrap_or(0),
        };

        let first_changed = changes.keys().next().copied().unwrap_or(0);
        let plan = self.plan_term_merge(term, first_changed)?;
        let mut merged = merge_entries(&plan.entries, changes);

        let plan = if merged.is_empty() && !plan.from_initial {
            // Everything from the located chunk on vanished; rebuild the
            // whole list so the last-chunk flag stays right.
            let full = self.plan_term_merge(term, 0)?;
            merged = merge_entries(&full.entries, changes);
            full
        } else {
            plan
        };

        for key in &plan.replaced_keys {
            self.table.del(key)?;
        }

        if plan.from_initial {
            if merged.is_empty() {
                return Err(Error::Corrupt(
                    "posting list empty with nonzero termfreq".into(),
                ));
            }
            self.write_term_chunks(term, new_header, &merged)?;
        } else {
            self.rewrite_initial_header(term, new_header)?;
            self.write_continuation_chunks(term, &merged)?;
        }
        Ok(())
    }

    /// Reads the chunks of `term` from the one containing `from_did` to
    /// the end, remembering their keys.
    fn plan_term_merge(&self, term: &[u8], from_did: DocId) -> Result<MergePlan> {
        let initial_key = postlist_key(term);
        let cont_prefix = postlist_chunk_prefix(term);

        let mut cursor = self.table.cursor_get();
        cursor.find_entry_le(&postlist_chunk_key(term, from_did))?;
        let start_at_initial = match cursor.current_key() {
            Some(key) => !key.starts_with(&cont_prefix) || key == initial_key.as_slice(),
            None => true,
        };

        let mut plan = MergePlan {
            entries: Vec::new(),
            replaced_keys: Vec::new(),
            from_initial: start_at_initial,
        };

        if start_at_initial {
            if !cursor.find_entry_ge(&initial_key)? {
                return Err(Error::Corrupt("initial posting chunk vanished".into()));
            }
        }

        loop {
            let Some(key) = cursor.current_key() else { break };
            let is_ours =
                key == initial_key.as_slice() || key.starts_with(&cont_prefix);
            if !is_ours {
                break;
            }
            let key = key.to_vec();
            let (tag, _) = cursor.read_tag_raw()?;
            let chunk = if key == initial_key {
                decode_initial_chunk(&tag)?.1
            } else {
                let mut rest = key.get(cont_prefix.len()..).unwrap_or_default();
                let first_did = DocId::try_from(unpack_uint_preserving_sort(&mut rest)?)
                    .map_err(|_| Error::Corrupt("posting chunk docid overflow".into()))?;
                decode_continuation_chunk(&tag, first_did)?
            };
            plan.entries.extend_from_slice(&chunk.entries);
            plan.replaced_keys.push(key);
            let done = chunk.is_last;
            if done || !cursor.next()? {
                break;
            }
        }
        Ok(plan)
    }

    fn delete_term_chunks(&self, term: &[u8]) -> Result<()> {
        let plan = self.plan_term_merge(term, 0)?;
        for key in &plan.replaced_keys {
            self.table.del(key)?;
        }
        Ok(())
    }

    pub(crate) fn write_term_chunks(
        &self,
        term: &[u8],
        header: TermHeader,
        entries: &[(DocId, TermCount)],
    ) -> Result<()> {
        let runs = chunk_runs(entries);
        let last_run = runs.len() - 1;
        for (index, run) in runs.iter().enumerate() {
            let is_last = index == last_run;
            if index == 0 {
                let tag = encode_initial_chunk(header, is_last, run);
                self.table.add(&postlist_key(term), &tag)?;
            } else {
                let first_did = run.first().map_or(0, |e| e.0);
                let tag = encode_continuation_chunk(is_last, run);
                self.table.add(&postlist_chunk_key(term, first_did), &tag)?;
            }
        }
        Ok(())
    }

    fn write_continuation_chunks(&self, term: &[u8], entries: &[(DocId, TermCount)]) -> Result<()> {
        debug_assert!(!entries.is_empty());
        let runs = chunk_runs(entries);
        let last_run = runs.len() - 1;
        for (index, run) in runs.iter().enumerate() {
            let first_did = run.first().map_or(0, |e| e.0);
            let tag = encode_continuation_chunk(index == last_run, run);
            self.table.add(&postlist_chunk_key(term, first_did), &tag)?;
        }
        Ok(())
    }

    fn rewrite_initial_header(&self, term: &[u8], header: TermHeader) -> Result<()> {
        let key = postlist_key(term);
        let tag = self
            .table
            .get_exact_entry(&key)?
            .ok_or_else(|| Error::Corrupt("initial posting chunk vanished".into()))?;
        let (_, chunk) = decode_initial_chunk(&tag)?;
        let tag = encode_initial_chunk(header, chunk.is_last, &chunk.entries);
        self.table.add(&key, &tag)
    }

    /// Applies buffered document-length changes to the doclen chunks.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt existing chunks.
    pub fn merge_doclen_changes(
        &self,
        changes: &BTreeMap<DocId, Option<TermCount>>,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let has_any = self.table.key_exists(&doclen_initial_key())?;
        if !has_any {
            let entries: Vec<(DocId, TermCount)> = changes
                .iter()
                .filter_map(|(&did, &len)| len.map(|l| (did, l)))
                .collect();
            if entries.is_empty() {
                return Ok(());
            }
            self.write_doclen_chunks(&entries)?;
            return Ok(());
        }

        let first_changed = changes.keys().next().copied().unwrap_or(0);
        let plan = self.plan_doclen_merge(first_changed)?;
        let mut merged = merge_entries(&plan.entries, changes);

        let plan = if merged.is_empty() && !plan.from_initial {
            let full = self.plan_doclen_merge(0)?;
            merged = merge_entries(&full.entries, changes);
            full
        } else {
            plan
        };

        for key in &plan.replaced_keys {
            self.table.del(key)?;
        }

        if plan.from_initial {
            if !merged.is_empty() {
                self.write_doclen_chunks(&merged)?;
            }
        } else {
            if merged.is_empty() {
                return Err(Error::Corrupt("doclen merge emptied mid-list".into()));
            }
            self.write_doclen_continuations(&merged)?;
        }
        Ok(())
    }

    fn plan_doclen_merge(&self, from_did: DocId) -> Result<MergePlan> {
        let initial_key = doclen_initial_key();

        let mut cursor = self.table.cursor_get();
        cursor.find_entry_le(&doclen_chunk_key(from_did))?;
        let start_at_initial = match cursor.current_key() {
            Some(key) => !key.starts_with(DOCLEN_PREFIX) || key == initial_key.as_slice(),
            None => true,
        };

        let mut plan = MergePlan {
            entries: Vec::new(),
            replaced_keys: Vec::new(),
            from_initial: start_at_initial,
        };

        if start_at_initial && !cursor.find_entry_ge(&initial_key)? {
            return Err(Error::Corrupt("initial doclen chunk vanished".into()));
        }

        loop {
            let Some(key) = cursor.current_key() else { break };
            if !key.starts_with(DOCLEN_PREFIX) {
                break;
            }
            let key = key.to_vec();
            let (tag, _) = cursor.read_tag_raw()?;
            let chunk = if key == initial_key {
                decode_doclen_initial(&tag)?
            } else {
                let mut rest = key.get(DOCLEN_PREFIX.len()..).unwrap_or_default();
                let first_did = DocId::try_from(unpack_uint_preserving_sort(&mut rest)?)
                    .map_err(|_| Error::Corrupt("doclen chunk docid overflow".into()))?;
                decode_continuation_chunk(&tag, first_did)?
            };
            plan.entries.extend_from_slice(&chunk.entries);
            plan.replaced_keys.push(key);
            if chunk.is_last || !cursor.next()? {
                break;
            }
        }
        Ok(plan)
    }

    pub(crate) fn write_doclen_chunks(&self, entries: &[(DocId, TermCount)]) -> Result<()> {
        let runs = chunk_runs(entries);
        let last_run = runs.len() - 1;
        for (index, run) in runs.iter().enumerate() {
            let is_last = index == last_run;
            if index == 0 {
                let mut tag = Vec::new();
                pack_uint(&mut tag, u64::from(run.first().map_or(1, |e| e.0) - 1));
                pack_bool(&mut tag, is_last);
                encode_entries(&mut tag, run);
                self.table.add(&doclen_initial_key(), &tag)?;
            } else {
                let first_did = run.first().map_or(0, |e| e.0);
                let tag = encode_continuation_chunk(is_last, run);
                self.table.add(&doclen_chunk_key(first_did), &tag)?;
            }
        }
        Ok(())
    }

    fn write_doclen_continuations(&self, entries: &[(DocId, TermCount)]) -> Result<()> {
        let runs = chunk_runs(entries);
        let last_run = runs.len() - 1;
        for (index, run) in runs.iter().enumerate() {
            let first_did = run.first().map_or(0, |e| e.0);
            let tag = encode_continuation_chunk(index == last_run, run);
            self.table.add(&doclen_chunk_key(first_did), &tag)?;
        }
        Ok(())
    }
}

fn decode_doclen_initial(mut tag: &[u8]) -> Result<Chunk> {
    let input = &mut tag;
    let first_did_less_1 = unpack_uint32(input)?;
    let is_last = unpack_bool(input)?;
    let mut entries = Vec::new();
    decode_entries(input, first_did_less_1 + 1, &mut entries)?;
    Ok(Chunk { entries, is_last })
}

struct MergePlan {
    entries: Vec<(DocId, TermCount)>,
    replaced_keys: Vec<Vec<u8>>,
    from_initial: bool,
}

/// Applies `changes` over `existing`, both docid-sorted.
fn merge_entries(
    existing: &[(DocId, TermCount)],
    changes: &BTreeMap<DocId, Option<TermCount>>,
) -> Vec<(DocId, TermCount)> {
    let mut merged: BTreeMap<DocId, TermCount> = existing.iter().copied().collect();
    for (&did, &change) in changes {
        match change {
            Some(count) => {
                merged.insert(did, count);
            }
            None => {
                merged.remove(&did);
            }
        }
    }
    merged.into_iter().collect()
}

// ---- readers -------------------------------------------------------------

/// Streams one term's `(docid, wdf)` postings in docid order.
pub struct PostlistReader {
    table: Table,
    term: Vec<u8>,
    header: TermHeader,
    entries: Vec<(DocId, TermCount)>,
    pos: usize,
    at_last_chunk: bool,
}

impl PostlistReader {
    /// The term's frequency header.
    #[must_use]
    pub fn header(&self) -> TermHeader {
        self.header
    }

    /// The next posting, or `None` at the end of the list.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt chunks.
    pub fn next(&mut self) -> Result<Option<(DocId, TermCount)>> {
        loop {
            if let Some(&entry) = self.entries.get(self.pos) {
                self.pos += 1;
                return Ok(Some(entry));
            }
            if !self.advance_chunk()? {
                return Ok(None);
            }
        }
    }

    /// Skips to the first posting with docid `>= target`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt chunks.
    pub fn skip_to(&mut self, target: DocId) -> Result<Option<(DocId, TermCount)>> {
        // Jump chunks without decoding entries one by one when the target
        // is past the current chunk.
        loop {
            if let Some(&(last, _)) = self.entries.last() {
                if target <= last || self.at_last_chunk {
                    break;
                }
            }
            if !self.advance_chunk()? {
                return Ok(None);
            }
        }
        while let Some(&entry) = self.entries.get(self.pos) {
            if entry.0 >= target {
                self.pos += 1;
                return Ok(Some(entry));
            }
            self.pos += 1;
        }
        self.next()
    }

    fn advance_chunk(&mut self) -> Result<bool> {
        if self.at_last_chunk {
            return Ok(false);
        }
        let next_start = self
            .entries
            .last()
            .map_or(0, |&(did, _)| did.saturating_add(1));
        let mut cursor = self.table.cursor_get();
        let prefix = postlist_chunk_prefix(&self.term);
        if !cursor.find_entry_ge(&postlist_chunk_key(&self.term, next_start))? {
            // Not an exact hit; the next chunk starts at some higher docid.
            match cursor.current_key() {
                Some(key) if key.starts_with(&prefix) => {}
                _ => return Ok(false),
            }
        }
        let key = cursor.current_key().unwrap_or_default().to_vec();
        let mut rest = key.get(prefix.len()..).unwrap_or_default();
        let first_did = DocId::try_from(unpack_uint_preserving_sort(&mut rest)?)
            .map_err(|_| Error::Corrupt("posting chunk docid overflow".into()))?;
        let (tag, _) = cursor.read_tag_raw()?;
        let chunk = decode_continuation_chunk(&tag, first_did)?;
        self.entries = chunk.entries;
        self.at_last_chunk = chunk.is_last;
        self.pos = 0;
        Ok(true)
    }
}

/// Streams `(docid, doclen)` for every document, in docid order.
pub struct DoclenReader {
    table: Table,
    entries: Vec<(DocId, TermCount)>,
    pos: usize,
    at_last_chunk: bool,
}

impl DoclenReader {
    /// The next document, or `None` after the last.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt chunks.
    pub fn next(&mut self) -> Result<Option<(DocId, TermCount)>> {
        loop {
            if let Some(&entry) = self.entries.get(self.pos) {
                self.pos += 1;
                return Ok(Some(entry));
            }
            if self.at_last_chunk {
                return Ok(None);
            }
            let next_start = self
                .entries
                .last()
                .map_or(0, |&(did, _)| did.saturating_add(1));
            let mut cursor = self.table.cursor_get();
            cursor.find_entry_ge(&doclen_chunk_key(next_start))?;
            let Some(key) = cursor.current_key() else {
                return Ok(None);
            };
            if !key.starts_with(DOCLEN_PREFIX) || key == doclen_initial_key() {
                return Ok(None);
            }
            let mut rest = key.get(DOCLEN_PREFIX.len()..).unwrap_or_default();
            let first_did = DocId::try_from(unpack_uint_preserving_sort(&mut rest)?)
                .map_err(|_| Error::Corrupt("doclen chunk docid overflow".into()))?;
            let (tag, _) = cursor.read_tag_raw()?;
            let chunk = decode_continuation_chunk(&tag, first_did)?;
            self.entries = chunk.entries;
            self.at_last_chunk = chunk.is_last;
            self.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn scratch(dir: &Path) -> PostlistTable {
        PostlistTable::create(dir, 2048).unwrap()
    }

    fn apply(
        table: &PostlistTable,
        term: &[u8],
        adds: &[(DocId, TermCount)],
        dels: &[DocId],
    ) {
        let mut changes: BTreeMap<DocId, Option<TermCount>> = BTreeMap::new();
        for &(did, wdf) in adds {
            changes.insert(did, Some(wdf));
        }
        for &did in dels {
            changes.insert(did, None);
        }
        let tf_delta = adds.len() as i64 - dels.len() as i64;
        let cf_delta = adds.iter().map(|e| i64::from(e.1)).sum::<i64>();
        table
            .merge_term_changes(term, tf_delta, cf_delta, &changes)
            .unwrap();
    }

    fn collect(table: &PostlistTable, term: &[u8]) -> Vec<(DocId, TermCount)> {
        let mut out = Vec::new();
        if let Some(mut reader) = table.postings(term).unwrap() {
            while let Some(entry) = reader.next().unwrap() {
                out.push(entry);
            }
        }
        out
    }

    #[test]
    fn fresh_term_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table = scratch(dir.path());

        apply(&table, b"fox", &[(1, 1), (5, 2), (9, 3)], &[]);

        let header = table.term_info(b"fox")?.unwrap();
        assert_eq!(3, header.termfreq);
        assert_eq!(6, header.collection_freq);
        assert_eq!(vec![(1, 1), (5, 2), (9, 3)], collect(&table, b"fox"));
        assert_eq!(None, table.term_info(b"wolf")?);
        Ok(())
    }

    #[test]
    fn updates_and_deletes_merge_into_chunks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table = scratch(dir.path());

        apply(&table, b"fox", &[(1, 1), (2, 2), (3, 3)], &[]);
        // Update wdf of doc 2; tf unchanged, cf grows by the difference.
        let mut changes = BTreeMap::new();
        changes.insert(2, Some(5u32));
        table.merge_term_changes(b"fox", 0, 3, &changes)?;
        assert_eq!(vec![(1, 1), (2, 5), (3, 3)], collect(&table, b"fox"));
        let header = table.term_info(b"fox")?.unwrap();
        assert_eq!(3, header.termfreq);
        assert_eq!(9, header.collection_freq);

        // Delete doc 1; the first docid shifts.
        apply(&table, b"fox", &[], &[1]);
        assert_eq!(vec![(2, 5), (3, 3)], collect(&table, b"fox"));
        let header = table.term_info(b"fox")?.unwrap();
        assert_eq!(2, header.termfreq);

        // Delete the rest; the term disappears entirely.
        apply(&table, b"fox", &[], &[2, 3]);
        assert_eq!(None, table.term_info(b"fox")?);
        assert!(collect(&table, b"fox").is_empty());
        Ok(())
    }

    #[test]
    fn long_postlist_spans_chunks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table = scratch(dir.path());

        let postings: Vec<(DocId, TermCount)> =
            (1..=8000u32).map(|did| (did * 3, did % 7 + 1)).collect();
        apply(&table, b"the", &postings, &[]);

        assert_eq!(postings, collect(&table, b"the"));

        // A fresh read skips straight into a late chunk.
        let mut reader = table.postings(b"the")?.unwrap();
        assert_eq!(Some((21_000, 7000 % 7 + 1)), reader.skip_to(21_000)?);
        assert_eq!(Some((23_997, 7999 % 7 + 1)), reader.skip_to(23_995)?);
        assert_eq!(None, reader.skip_to(1_000_000)?);

        // Mid-list updates only rewrite from the containing chunk on.
        let mut changes = BTreeMap::new();
        changes.insert(12_000, Some(99u32));
        table.merge_term_changes(b"the", 0, 99, &changes)?;
        let mut reader = table.postings(b"the")?.unwrap();
        assert_eq!(Some((12_000, 99)), reader.skip_to(12_000)?);
        Ok(())
    }

    #[test]
    fn doclens_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table = scratch(dir.path());

        let mut changes: BTreeMap<DocId, Option<TermCount>> = BTreeMap::new();
        for did in 1..=500u32 {
            changes.insert(did, Some(did % 40 + 1));
        }
        table.merge_doclen_changes(&changes)?;

        assert_eq!(11, table.doclen(10)?);
        assert_eq!(1, table.doclen(40)?);
        assert!(matches!(table.doclen(501), Err(Error::DocNotFound(501))));

        let mut deletion = BTreeMap::new();
        deletion.insert(10u32, None);
        table.merge_doclen_changes(&deletion)?;
        assert!(matches!(table.doclen(10), Err(Error::DocNotFound(10))));

        let mut reader = table.doclens()?.unwrap();
        let mut n = 0;
        while let Some((did, len)) = reader.next()? {
            assert_ne!(10, did);
            assert_eq!(did % 40 + 1, len);
            n += 1;
        }
        assert_eq!(499, n);
        Ok(())
    }

    #[test]
    fn metainfo_and_user_metadata() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table = scratch(dir.path());

        assert_eq!(None, table.get_metainfo()?);
        let metainfo = Metainfo {
            last_docid: 42,
            doclen_lower_bound: 2,
            wdf_upper_bound: 9,
            doclen_upper_bound: 100,
            total_doclen: 4200,
        };
        table.set_metainfo(&metainfo)?;
        assert_eq!(Some(metainfo), table.get_metainfo()?);

        table.set_user_metadata(b"alpha", b"one")?;
        table.set_user_metadata(b"beta", b"two")?;
        assert_eq!(b"one".to_vec(), table.get_user_metadata(b"alpha")?);
        assert_eq!(Vec::<u8>::new(), table.get_user_metadata(b"gamma")?);
        assert_eq!(
            vec![b"alpha".to_vec(), b"beta".to_vec()],
            table.metadata_keys(b"")?
        );
        assert_eq!(vec![b"beta".to_vec()], table.metadata_keys(b"b")?);

        // Metadata and metainfo coexist with postings.
        apply(&table, b"term", &[(1, 1)], &[]);
        assert_eq!(Some(metainfo), table.get_metainfo()?);
        assert_eq!(vec![(1, 1)], collect(&table, b"term"));
        Ok(())
    }

    #[test]
    fn postlist_key_parses_back() {
        let (term, did) = parse_postlist_key(&postlist_key(b"fox")).unwrap();
        assert_eq!(b"fox".to_vec(), term);
        assert_eq!(None, did);

        let (term, did) = parse_postlist_key(&postlist_chunk_key(b"fox", 77)).unwrap();
        assert_eq!(b"fox".to_vec(), term);
        assert_eq!(Some(77), did);

        // A term containing a zero byte survives the escaping.
        let tricky = b"f\0x";
        let (term, did) = parse_postlist_key(&postlist_chunk_key(tricky, 9)).unwrap();
        assert_eq!(tricky.to_vec(), term);
        assert_eq!(Some(9), did);

        assert_eq!(None, parse_postlist_key(&doclen_initial_key()));
        assert_eq!(None, parse_postlist_key(&metainfo_key()));
    }
}
