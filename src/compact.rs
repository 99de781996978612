// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The compactor: merges N source databases into a fresh destination.
//!
//! Every source's docids are rebased by a per-source offset so the merged
//! docid space is disjoint, then each table is merged by the strategy its
//! key space wants: postings by an N-way term merge with summed
//! frequencies, user metadata through a conflict callback, value
//! statistics by summing with widened bounds, spelling frequencies by
//! summing and fragment sets by union, synonym sets by union, and the
//! docid-keyed tables by a plain rebase-and-append with tags forwarded in
//! stored (still compressed) form.
//!
//! The destination is written under its own write lock and committed as
//! revision 1. With many sources the merge can run in passes, pairing
//! sources into maximum-block-size temporaries that are dropped as soon
//! as they have been consumed.

use crate::{
    db::{Database, DbFlags, WritableDatabase},
    postlist::{
        self, parse_postlist_key, values::ValueStats, Metainfo, PostlistTable, TermHeader,
    },
    Cursor, DocId, Error, Result, TermCount,
};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::path::{Path, PathBuf};

/// Resolves conflicting user-metadata values during compaction: given the
/// key and every source's value, returns the one to keep.
pub type MetadataResolver = dyn Fn(&[u8], &[&[u8]]) -> Vec<u8>;

/// Options of a [`compact`] run.
pub struct CompactOptions {
    /// Destination block size.
    pub block_size: u32,
    /// Per-source docid offsets; computed cumulatively when `None`.
    pub offsets: Option<Vec<DocId>>,
    /// Merge in pair-wise passes when there are many sources.
    pub multipass: bool,
    /// Duplicate user-metadata resolution; the first source wins when
    /// `None`.
    pub resolve_metadata: Option<Box<MetadataResolver>>,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            block_size: crate::db::DEFAULT_BLOCK_SIZE,
            offsets: None,
            multipass: false,
            resolve_metadata: None,
        }
    }
}

/// Largest block size, used for multipass temporaries.
const MAX_BLOCK_SIZE: u32 = 65_536;

/// Fan-in above which multipass pairing kicks in.
const MULTIPASS_FAN_IN: usize = 3;

/// Compacts `sources` into a fresh database at `destination`.
///
/// # Errors
///
/// Fails when a source cannot be opened, the destination exists, or on
/// I/O and corruption errors along the way.
pub fn compact(sources: &[PathBuf], destination: &Path, options: CompactOptions) -> Result<()> {
    if sources.is_empty() {
        return Err(Error::InvalidArgument("no source databases".into()));
    }

    if options.multipass && sources.len() > MULTIPASS_FAN_IN {
        return compact_multipass(sources, destination, options);
    }

    let opened: Vec<Database> = sources
        .iter()
        .map(Database::open)
        .collect::<Result<Vec<_>>>()?;

    let offsets = match &options.offsets {
        Some(offsets) => {
            if offsets.len() != opened.len() {
                return Err(Error::InvalidArgument(
                    "one docid offset per source required".into(),
                ));
            }
            offsets.clone()
        }
        None => {
            let mut offsets = Vec::with_capacity(opened.len());
            let mut base: DocId = 0;
            for db in &opened {
                offsets.push(base);
                base = base
                    .checked_add(db.last_docid())
                    .ok_or(Error::InvalidOperation("docid space exhausted"))?;
            }
            offsets
        }
    };

    // Merge source order by offset so docid-ordered appends stay ordered.
    let mut order: Vec<usize> = (0..opened.len()).collect();
    order.sort_by_key(|&i| offsets.get(i).copied().unwrap_or(0));

    let flags = DbFlags {
        no_termlist: opened.iter().any(|db| db.termlist_table().is_none()),
    };
    let mut dest = WritableDatabase::create_with(destination, options.block_size, flags)?;
    log::info!(
        "compacting {} sources into {}",
        opened.len(),
        destination.display(),
    );

    merge_postlists(&opened, &offsets, &order, &dest, &options)?;
    merge_positions(&opened, &offsets, &order, &dest)?;
    merge_docid_keyed(&opened, &offsets, &order, &dest)?;
    merge_spelling(&opened, &dest)?;
    merge_synonyms(&opened, &dest)?;

    // Statistics are exact sums over the sources.
    let mut doc_count: DocId = 0;
    let mut stats = Metainfo::default();
    let mut spelling_bound: TermCount = 0;
    let mut first = true;
    for (index, db) in opened.iter().enumerate() {
        let offset = offsets.get(index).copied().unwrap_or(0);
        let record = db.version_record();
        doc_count += record.doc_count;
        stats.last_docid = stats.last_docid.max(offset + record.last_docid);
        stats.total_doclen += record.total_doclen;
        spelling_bound = spelling_bound.max(record.spelling_wordfreq_upper_bound);
        stats.wdf_upper_bound = stats.wdf_upper_bound.max(record.wdf_upper_bound);
        stats.doclen_upper_bound = stats.doclen_upper_bound.max(record.doclen_upper_bound);
        if record.doc_count > 0 {
            stats.doclen_lower_bound = if first {
                record.doclen_lower_bound
            } else {
                stats.doclen_lower_bound.min(record.doclen_lower_bound)
            };
            first = false;
        }
    }
    dest.set_statistics(&stats, doc_count, spelling_bound);

    dest.commit()?;
    Ok(())
}

struct PendingSource {
    path: PathBuf,
    offset: DocId,
    // Keeps an intermediate output alive until consumed; dropping it
    // unlinks the files.
    _tmp: Option<tempfile::TempDir>,
}

fn compact_multipass(
    sources: &[PathBuf],
    destination: &Path,
    options: CompactOptions,
) -> Result<()> {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));

    let offsets = match &options.offsets {
        Some(offsets) => {
            if offsets.len() != sources.len() {
                return Err(Error::InvalidArgument(
                    "one docid offset per source required".into(),
                ));
            }
            offsets.clone()
        }
        None => {
            let mut offsets = Vec::with_capacity(sources.len());
            let mut base: DocId = 0;
            for path in sources {
                offsets.push(base);
                base = base
                    .checked_add(Database::open(path)?.last_docid())
                    .ok_or(Error::InvalidOperation("docid space exhausted"))?;
            }
            offsets
        }
    };

    let mut pending: Vec<PendingSource> = sources
        .iter()
        .zip(&offsets)
        .map(|(path, &offset)| PendingSource {
            path: path.clone(),
            offset,
            _tmp: None,
        })
        .collect();

    while pending.len() > MULTIPASS_FAN_IN {
        log::debug!("multipass: {} partial inputs remain", pending.len());
        let mut next: Vec<PendingSource> = Vec::new();
        let mut inputs = pending.into_iter();
        loop {
            let Some(first) = inputs.next() else { break };
            let Some(second) = inputs.next() else {
                next.push(first);
                break;
            };
            let tmp = tempfile::tempdir_in(parent)?;
            let tmp_db = tmp.path().join("pass");
            compact(
                &[first.path.clone(), second.path.clone()],
                &tmp_db,
                CompactOptions {
                    block_size: MAX_BLOCK_SIZE,
                    offsets: Some(vec![first.offset, second.offset]),
                    multipass: false,
                    resolve_metadata: None,
                },
            )?;
            // The pair's docids are now absolute; consumed temporaries of
            // the previous pass drop (and unlink) here.
            drop(first);
            drop(second);
            next.push(PendingSource {
                path: tmp_db,
                offset: 0,
                _tmp: Some(tmp),
            });
        }
        pending = next;
    }

    let final_sources: Vec<PathBuf> = pending.iter().map(|p| p.path.clone()).collect();
    let final_offsets: Vec<DocId> = pending.iter().map(|p| p.offset).collect();
    compact(
        &final_sources,
        destination,
        CompactOptions {
            block_size: options.block_size,
            offsets: Some(final_offsets),
            multipass: false,
            resolve_metadata: options.resolve_metadata,
        },
    )
}

// ---- N-way key merge over table cursors ----------------------------------

struct HeapEntry {
    key: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.source.cmp(&other.source))
    }
}

/// Merges several cursors key-range-restricted to one key space; yields
/// each distinct key with every source's decompressed tag.
struct KeyMerger {
    cursors: Vec<Cursor>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    prefix: Vec<u8>,
}

impl KeyMerger {
    fn new(mut cursors: Vec<Cursor>, prefix: &[u8]) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(cursors.len());
        for (source, cursor) in cursors.iter_mut().enumerate() {
            cursor.find_entry_ge(prefix)?;
            if let Some(key) = cursor.current_key() {
                if key.starts_with(prefix) {
                    heap.push(Reverse(HeapEntry {
                        key: key.to_vec(),
                        source,
                    }));
                }
            }
        }
        Ok(Self {
            cursors,
            heap,
            prefix: prefix.to_vec(),
        })
    }

    /// The next distinct key with `(source, tag)` per source holding it,
    /// in source order.
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<(usize, Vec<u8>)>)>> {
        let Some(Reverse(first)) = self.heap.pop() else {
            return Ok(None);
        };
        let key = first.key;
        let mut hits = vec![first.source];
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.key != key {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                hits.push(entry.source);
            }
        }

        let mut tags = Vec::with_capacity(hits.len());
        hits.sort_unstable();
        for source in hits {
            let cursor = self
                .cursors
                .get_mut(source)
                .ok_or(Error::InvalidOperation("merge cursor index out of range"))?;
            let tag = cursor.read_tag()?;
            tags.push((source, tag));

            if cursor.next()? {
                if let Some(next_key) = cursor.current_key() {
                    if next_key.starts_with(&self.prefix) {
                        self.heap.push(Reverse(HeapEntry {
                            key: next_key.to_vec(),
                            source,
                        }));
                    }
                }
            }
        }
        Ok(Some((key, tags)))
    }
}

// ---- postlist table ------------------------------------------------------

fn merge_postlists(
    sources: &[Database],
    offsets: &[DocId],
    order: &[usize],
    dest: &WritableDatabase,
    options: &CompactOptions,
) -> Result<()> {
    let dest_table = dest.postlist_table();

    merge_user_metadata(sources, dest_table, options)?;
    merge_value_stats(sources, dest_table)?;
    merge_value_streams(sources, offsets, order, dest_table)?;
    merge_doclens(sources, offsets, order, dest_table)?;
    merge_terms(sources, offsets, order, dest_table)?;
    Ok(())
}

fn merge_user_metadata(
    sources: &[Database],
    dest: &PostlistTable,
    options: &CompactOptions,
) -> Result<()> {
    let prefix = postlist::user_metadata_key(b"");
    let cursors: Vec<Cursor> = sources
        .iter()
        .map(|db| db.postlist_table().table().cursor_get())
        .collect();
    let mut merger = KeyMerger::new(cursors, &prefix)?;

    while let Some((key, tags)) = merger.next()? {
        let name = key.get(prefix.len()..).unwrap_or_default();
        let value = if tags.len() == 1 {
            tags.first().map(|(_, tag)| tag.clone()).unwrap_or_default()
        } else if let Some(resolve) = &options.resolve_metadata {
            let views: Vec<&[u8]> = tags.iter().map(|(_, tag)| tag.as_slice()).collect();
            resolve(name, &views)
        } else {
            log::warn!(
                "duplicate metadata key {:?} in {} sources; keeping the first",
                String::from_utf8_lossy(name),
                tags.len(),
            );
            tags.first().map(|(_, tag)| tag.clone()).unwrap_or_default()
        };
        dest.set_user_metadata(name, &value)?;
    }
    Ok(())
}

fn merge_value_stats(sources: &[Database], dest: &PostlistTable) -> Result<()> {
    let mut slots: BTreeSet<crate::ValueSlot> = BTreeSet::new();
    for db in sources {
        slots.extend(db.postlist_table().value_slots()?);
    }
    for slot in slots {
        let mut merged: Option<ValueStats> = None;
        for db in sources {
            let Some(stats) = db.postlist_table().value_stats(slot)? else {
                continue;
            };
            merged = Some(match merged {
                None => stats,
                Some(mut acc) => {
                    acc.freq += stats.freq;
                    if stats.lower_bound < acc.lower_bound {
                        acc.lower_bound = stats.lower_bound;
                    }
                    if stats.upper_bound > acc.upper_bound {
                        acc.upper_bound = stats.upper_bound;
                    }
                    acc
                }
            });
        }
        if let Some(stats) = merged {
            dest.set_value_stats(slot, &stats)?;
        }
    }
    Ok(())
}

fn merge_value_streams(
    sources: &[Database],
    offsets: &[DocId],
    order: &[usize],
    dest: &PostlistTable,
) -> Result<()> {
    let mut slots: BTreeSet<crate::ValueSlot> = BTreeSet::new();
    for db in sources {
        slots.extend(db.postlist_table().value_slots()?);
    }
    for slot in slots {
        let mut changes: BTreeMap<DocId, Option<Vec<u8>>> = BTreeMap::new();
        for &index in order {
            let Some(db) = sources.get(index) else { continue };
            let offset = offsets.get(index).copied().unwrap_or(0);
            let mut reader = db.postlist_table().values(slot)?;
            while let Some((did, value)) = reader.next()? {
                changes.insert(did + offset, Some(value));
            }
        }
        dest.merge_value_changes(slot, &changes)?;
    }
    Ok(())
}

fn merge_doclens(
    sources: &[Database],
    offsets: &[DocId],
    order: &[usize],
    dest: &PostlistTable,
) -> Result<()> {
    let mut entries: Vec<(DocId, TermCount)> = Vec::new();
    for &index in order {
        let Some(db) = sources.get(index) else { continue };
        let offset = offsets.get(index).copied().unwrap_or(0);
        let Some(mut reader) = db.postlist_table().doclens()? else {
            continue;
        };
        while let Some((did, doclen)) = reader.next()? {
            entries.push((did + offset, doclen));
        }
    }
    if entries.is_empty() {
        return Ok(());
    }
    if !entries.windows(2).all(|pair| pair[0].0 < pair[1].0) {
        return Err(Error::InvalidArgument(
            "source docid ranges overlap under the given offsets".into(),
        ));
    }
    dest.write_doclen_chunks(&entries)
}

/// Walks one source's initial posting chunks in term order.
struct TermWalker {
    cursor: Cursor,
    current: Option<Vec<u8>>,
}

impl TermWalker {
    fn new(db: &Database) -> Result<Self> {
        let mut walker = Self {
            cursor: db.postlist_table().table().cursor_get(),
            current: None,
        };
        walker.advance()?;
        Ok(walker)
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            if !self.cursor.next()? {
                self.current = None;
                return Ok(());
            }
            let Some(key) = self.cursor.current_key() else {
                self.current = None;
                return Ok(());
            };
            match parse_postlist_key(key) {
                // Initial chunks only; continuation chunks ride along when
                // the term is processed.
                Some((term, None)) => {
                    self.current = Some(term);
                    return Ok(());
                }
                _ => continue,
            }
        }
    }
}

fn merge_terms(
    sources: &[Database],
    offsets: &[DocId],
    order: &[usize],
    dest: &PostlistTable,
) -> Result<()> {
    let mut walkers: Vec<TermWalker> = sources
        .iter()
        .map(TermWalker::new)
        .collect::<Result<Vec<_>>>()?;

    let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::new();
    for (source, walker) in walkers.iter().enumerate() {
        if let Some(term) = &walker.current {
            heap.push(Reverse(HeapEntry {
                key: term.clone(),
                source,
            }));
        }
    }

    while let Some(Reverse(first)) = heap.pop() {
        let term = first.key;
        let mut holders = vec![first.source];
        while let Some(Reverse(entry)) = heap.peek() {
            if entry.key != term {
                break;
            }
            if let Some(Reverse(entry)) = heap.pop() {
                holders.push(entry.source);
            }
        }

        // Sum the header and concatenate the rebased posting runs in
        // offset order.
        let mut header = TermHeader {
            termfreq: 0,
            collection_freq: 0,
        };
        let mut entries: Vec<(DocId, TermCount)> = Vec::new();
        for &index in order {
            if !holders.contains(&index) {
                continue;
            }
            let Some(db) = sources.get(index) else { continue };
            let offset = offsets.get(index).copied().unwrap_or(0);
            let Some(mut reader) = db.postlist_table().postings(&term)? else {
                continue;
            };
            header.termfreq += reader.header().termfreq;
            header.collection_freq += reader.header().collection_freq;
            while let Some((did, wdf)) = reader.next()? {
                entries.push((did + offset, wdf));
            }
        }
        if !entries.windows(2).all(|pair| pair[0].0 < pair[1].0) {
            return Err(Error::InvalidArgument(
                "source docid ranges overlap under the given offsets".into(),
            ));
        }
        dest.write_term_chunks(&term, header, &entries)?;

        // Refill the heap from the walkers that held this term.
        for &source in &holders {
            let Some(walker) = walkers.get_mut(source) else {
                continue;
            };
            walker.advance()?;
            if let Some(next_term) = &walker.current {
                heap.push(Reverse(HeapEntry {
                    key: next_term.clone(),
                    source,
                }));
            }
        }
    }
    Ok(())
}

// ---- docid-keyed tables --------------------------------------------------

fn merge_positions(
    sources: &[Database],
    offsets: &[DocId],
    order: &[usize],
    dest: &WritableDatabase,
) -> Result<()> {
    let Some(dest_table) = dest.position_table() else {
        return Ok(());
    };
    for &index in order {
        let Some(db) = sources.get(index) else { continue };
        let Some(src) = db.position_table() else { continue };
        let offset = offsets.get(index).copied().unwrap_or(0);

        let mut cursor = src.table().cursor_get();
        while cursor.next()? {
            let Some(key) = cursor.current_key() else { break };
            let Some((term, Some(did))) = parse_postlist_key(key) else {
                return Err(Error::Corrupt("position key without docid".into()));
            };
            let (tag, compressed) = cursor.read_tag_raw()?;
            dest_table.table().add_raw(
                &crate::positionlist::position_key(&term, did + offset),
                &tag,
                compressed,
            )?;
        }
    }
    Ok(())
}

fn merge_docid_keyed(
    sources: &[Database],
    offsets: &[DocId],
    order: &[usize],
    dest: &WritableDatabase,
) -> Result<()> {
    for &index in order {
        let Some(db) = sources.get(index) else { continue };
        let offset = offsets.get(index).copied().unwrap_or(0);

        if let (Some(src), Some(dst)) = (db.termlist_table(), dest.termlist_table()) {
            let mut cursor = src.table().cursor_get();
            while cursor.next()? {
                let key = cursor.current_key().unwrap_or_default();
                let mut rest = key;
                let did = DocId::try_from(
                    crate::coding::pack::unpack_uint_preserving_sort(&mut rest)?,
                )
                .map_err(|_| Error::Corrupt("termlist docid overflow".into()))?;
                let (tag, compressed) = cursor.read_tag_raw()?;
                dst.table().add_raw(
                    &crate::termlist::termlist_key(did + offset),
                    &tag,
                    compressed,
                )?;
            }
        }

        if let (Some(src), Some(dst)) = (db.docdata_table(), dest.docdata_table()) {
            let mut cursor = src.table().cursor_get();
            while cursor.next()? {
                let key = cursor.current_key().unwrap_or_default();
                let mut rest = key;
                let did = DocId::try_from(
                    crate::coding::pack::unpack_uint_preserving_sort(&mut rest)?,
                )
                .map_err(|_| Error::Corrupt("docdata docid overflow".into()))?;
                let (tag, compressed) = cursor.read_tag_raw()?;
                dst.table().add_raw(
                    &crate::docdata::docdata_key(did + offset),
                    &tag,
                    compressed,
                )?;
            }
        }
    }
    Ok(())
}

// ---- vocabulary tables ---------------------------------------------------

fn merge_spelling(sources: &[Database], dest: &WritableDatabase) -> Result<()> {
    let Some(dest_table) = dest.spelling_table() else {
        return Ok(());
    };
    let cursors: Vec<Cursor> = sources
        .iter()
        .filter_map(|db| db.spelling_table())
        .map(|table| table.table().cursor_get())
        .collect();
    if cursors.is_empty() {
        return Ok(());
    }

    let mut merger = KeyMerger::new(cursors, b"")?;
    while let Some((key, tags)) = merger.next()? {
        if key.first() == Some(&b'W') {
            // Word frequencies sum.
            let mut total: u64 = 0;
            for (_, tag) in &tags {
                let mut input = tag.as_slice();
                total += u64::from(crate::coding::pack::unpack_uint32(&mut input)?);
            }
            let mut out = Vec::new();
            crate::coding::pack::pack_uint(&mut out, total);
            dest_table.table().add(&key, &out)?;
        } else {
            // Fragment word sets union.
            let mut words = BTreeSet::new();
            for (_, tag) in &tags {
                words.extend(crate::spelling::decode_wordlist(tag)?);
            }
            dest_table
                .table()
                .add(&key, &crate::spelling::encode_wordlist(&words))?;
        }
    }
    Ok(())
}

fn merge_synonyms(sources: &[Database], dest: &WritableDatabase) -> Result<()> {
    let Some(dest_table) = dest.synonym_table() else {
        return Ok(());
    };
    let cursors: Vec<Cursor> = sources
        .iter()
        .filter_map(|db| db.synonym_table())
        .map(|table| table.table().cursor_get())
        .collect();
    if cursors.is_empty() {
        return Ok(());
    }

    let mut merger = KeyMerger::new(cursors, b"")?;
    while let Some((term, tags)) = merger.next()? {
        let mut synonyms = BTreeSet::new();
        for (_, tag) in &tags {
            synonyms.extend(crate::synonym::decode_synonyms(tag)?);
        }
        dest_table
            .table()
            .add(&term, &crate::synonym::encode_synonyms(&synonyms))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Document;
    use test_log::test;

    fn build_source(dir: &Path, docs: &[&[&str]]) -> Result<()> {
        let mut db = WritableDatabase::create(dir)?;
        for terms in docs {
            let mut doc = Document::new();
            for term in *terms {
                doc.add_term(term, 1);
            }
            doc.set_data(terms.join(" "));
            db.add_document(doc)?;
        }
        db.commit()?;
        Ok(())
    }

    #[test]
    fn two_sources_merge_with_summed_frequencies() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let out = dir.path().join("out");

        build_source(&a, &[&["fox", "quick"], &["fox"]])?;
        build_source(&b, &[&["fox", "slow"]])?;

        compact(&[a, b], &out, CompactOptions::default())?;

        let db = Database::open(&out)?;
        assert_eq!(3, db.doc_count());
        assert_eq!(3, db.last_docid());
        assert_eq!(3, db.term_freq(b"fox")?);
        assert_eq!(3, db.collection_freq(b"fox")?);
        assert_eq!(1, db.term_freq(b"slow")?);

        // Source b's document was rebased past source a's docids.
        let mut postings = db.postings(b"fox")?.unwrap();
        assert_eq!(Some((1, 1)), postings.next()?);
        assert_eq!(Some((2, 1)), postings.next()?);
        assert_eq!(Some((3, 1)), postings.next()?);
        assert_eq!(None, postings.next()?);
        assert_eq!(b"fox slow".to_vec(), db.document_data(3)?);
        assert_eq!(1, db.revision());
        Ok(())
    }

    #[test]
    fn explicit_offsets_are_honored() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let out = dir.path().join("out");

        build_source(&a, &[&["alpha"]])?;
        build_source(&b, &[&["beta"]])?;

        compact(
            &[a, b],
            &out,
            CompactOptions {
                offsets: Some(vec![0, 1000]),
                ..CompactOptions::default()
            },
        )?;

        let db = Database::open(&out)?;
        assert_eq!(2, db.doc_count());
        assert_eq!(1001, db.last_docid());
        let mut postings = db.postings(b"beta")?.unwrap();
        assert_eq!(Some((1001, 1)), postings.next()?);
        Ok(())
    }

    #[test]
    fn metadata_conflicts_resolve_via_callback() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let out = dir.path().join("out");

        {
            let mut db = WritableDatabase::create(&a)?;
            db.set_metadata(b"shared", b"from-a")?;
            db.set_metadata(b"only-a", b"a")?;
            db.commit()?;
        }
        {
            let mut db = WritableDatabase::create(&b)?;
            db.set_metadata(b"shared", b"from-b")?;
            db.commit()?;
        }

        compact(
            &[a, b],
            &out,
            CompactOptions {
                resolve_metadata: Some(Box::new(|_key, values| {
                    values.join(&b"+"[..])
                })),
                ..CompactOptions::default()
            },
        )?;

        let db = Database::open(&out)?;
        assert_eq!(b"from-a+from-b".to_vec(), db.metadata(b"shared")?);
        assert_eq!(b"a".to_vec(), db.metadata(b"only-a")?);
        Ok(())
    }

    #[test]
    fn multipass_matches_single_pass() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sources = Vec::new();
        for n in 0..5u32 {
            let path = dir.path().join(format!("src{n}"));
            build_source(
                &path,
                &[&["common", "alpha"], &["common"]],
            )?;
            sources.push(path);
        }

        let single = dir.path().join("single");
        let multi = dir.path().join("multi");
        compact(&sources, &single, CompactOptions::default())?;
        compact(
            &sources,
            &multi,
            CompactOptions {
                multipass: true,
                ..CompactOptions::default()
            },
        )?;

        let a = Database::open(&single)?;
        let b = Database::open(&multi)?;
        assert_eq!(a.doc_count(), b.doc_count());
        assert_eq!(a.last_docid(), b.last_docid());
        assert_eq!(a.total_doclen(), b.total_doclen());
        assert_eq!(a.term_freq(b"common")?, b.term_freq(b"common")?);

        let mut pa = a.postings(b"common")?.unwrap();
        let mut pb = b.postings(b"common")?.unwrap();
        loop {
            let (x, y) = (pa.next()?, pb.next()?);
            assert_eq!(x, y);
            if x.is_none() {
                break;
            }
        }
        Ok(())
    }
}
