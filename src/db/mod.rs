// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The database facade.
//!
//! A [`Database`] bundles the tables, the version file and the statistics
//! of one database directory, read-only. A [`WritableDatabase`] adds the
//! write lock, the inverter and commit/cancel: document changes stage in
//! memory and hit the tables in dependency order at [`WritableDatabase::commit`],
//! which ends by atomically replacing the version file — the step that
//! makes the new revision visible to readers.

mod document;

pub use document::Document;

use crate::{
    docdata::DocdataTable,
    lock::WriteLock,
    positionlist::{PositionReader, PositionTable},
    postlist::{
        inverter::Inverter, values::ValueStats, Metainfo, PostlistReader, PostlistTable,
    },
    spelling::SpellingTable,
    synonym::SynonymTable,
    termlist::TermlistTable,
    version::{RootInfo, TableId, VersionFile, VersionRecord},
    DocId, Error, Result, TermCount, ValueSlot,
};
use std::path::{Path, PathBuf};

/// Default table block size.
pub const DEFAULT_BLOCK_SIZE: u32 = 8192;

/// Compression threshold used by the per-document and vocabulary tables.
const TAG_COMPRESS_MIN: u32 = 100;

/// Creation-time options of a database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbFlags {
    /// Do not create the termlist and document-data tables. Documents
    /// cannot be deleted or replaced, but the database is smaller.
    pub no_termlist: bool,
}

struct Tables {
    postlist: PostlistTable,
    position: Option<PositionTable>,
    termlist: Option<TermlistTable>,
    docdata: Option<DocdataTable>,
    spelling: Option<SpellingTable>,
    synonym: Option<SynonymTable>,
}

impl Tables {
    fn create(dir: &Path, block_size: u32, flags: DbFlags) -> Result<Self> {
        Ok(Self {
            postlist: PostlistTable::create(dir, block_size)?,
            position: Some(PositionTable::create(dir, block_size)?),
            termlist: if flags.no_termlist {
                None
            } else {
                Some(TermlistTable::create(dir, block_size)?)
            },
            docdata: if flags.no_termlist {
                None
            } else {
                Some(DocdataTable::create(dir, block_size)?)
            },
            spelling: Some(SpellingTable::create(dir, block_size)?),
            synonym: Some(SynonymTable::create(dir, block_size)?),
        })
    }

    fn open(dir: &Path, record: &VersionRecord, writable: bool) -> Result<Self> {
        let revision = record.revision;
        let postlist_info = record.table(TableId::Postlist).ok_or_else(|| {
            Error::Corrupt("version record lacks the postlist table".into())
        })?;
        Ok(Self {
            postlist: PostlistTable::open(dir, postlist_info, revision, writable)?,
            position: record
                .table(TableId::Position)
                .map(|info| PositionTable::open(dir, info, revision, writable))
                .transpose()?,
            termlist: record
                .table(TableId::Termlist)
                .map(|info| TermlistTable::open(dir, info, revision, writable))
                .transpose()?,
            docdata: record
                .table(TableId::Docdata)
                .map(|info| DocdataTable::open(dir, info, revision, writable))
                .transpose()?,
            spelling: record
                .table(TableId::Spelling)
                .map(|info| SpellingTable::open(dir, info, revision, writable))
                .transpose()?,
            synonym: record
                .table(TableId::Synonym)
                .map(|info| SynonymTable::open(dir, info, revision, writable))
                .transpose()?,
        })
    }

    fn each_table(&self) -> Vec<(TableId, &crate::btree::table::Table)> {
        let mut out: Vec<(TableId, &crate::btree::table::Table)> =
            vec![(TableId::Postlist, self.postlist.table())];
        if let Some(t) = &self.position {
            out.push((TableId::Position, t.table()));
        }
        if let Some(t) = &self.termlist {
            out.push((TableId::Termlist, t.table()));
        }
        if let Some(t) = &self.docdata {
            out.push((TableId::Docdata, t.table()));
        }
        if let Some(t) = &self.spelling {
            out.push((TableId::Spelling, t.table()));
        }
        if let Some(t) = &self.synonym {
            out.push((TableId::Synonym, t.table()));
        }
        out
    }
}

/// A read-only view of one database directory at one revision.
pub struct Database {
    dir: PathBuf,
    version: VersionFile,
    tables: Tables,
}

impl Database {
    /// Opens a database read-only at its live revision.
    ///
    /// # Errors
    ///
    /// Fails when the directory holds no database, is corrupt, or is from
    /// an incompatible format.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let version = VersionFile::open(&dir)?;
        let tables = Tables::open(&dir, version.record(), false)?;
        Ok(Self {
            dir,
            version,
            tables,
        })
    }

    /// Re-opens at the current on-disk revision if a writer has committed
    /// since. Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// As [`Self::open`].
    pub fn reopen(&mut self) -> Result<bool> {
        let disk = VersionFile::peek_revision(&self.dir)?;
        if disk == self.version.record().revision {
            return Ok(false);
        }
        log::debug!(
            "reopening {} at revision {disk} (had {})",
            self.dir.display(),
            self.version.record().revision,
        );
        let fresh = Self::open(self.dir.clone())?;
        self.version = fresh.version;
        self.tables = fresh.tables;
        Ok(true)
    }

    /// The database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// The database identity, fresh at creation.
    #[must_use]
    pub fn uuid(&self) -> [u8; 16] {
        self.version.record().uuid
    }

    /// The revision this view reads.
    #[must_use]
    pub fn revision(&self) -> crate::Revision {
        self.version.record().revision
    }

    /// Number of documents.
    #[must_use]
    pub fn doc_count(&self) -> DocId {
        self.version.record().doc_count
    }

    /// Highest document id ever used.
    #[must_use]
    pub fn last_docid(&self) -> DocId {
        self.version.record().last_docid
    }

    /// Sum of all document lengths.
    #[must_use]
    pub fn total_doclen(&self) -> u64 {
        self.version.record().total_doclen
    }

    /// Lower bound on document length.
    #[must_use]
    pub fn doclen_lower_bound(&self) -> TermCount {
        self.version.record().doclen_lower_bound
    }

    /// Upper bound on document length.
    #[must_use]
    pub fn doclen_upper_bound(&self) -> TermCount {
        self.version.record().doclen_upper_bound
    }

    /// Upper bound on within-document frequency.
    #[must_use]
    pub fn wdf_upper_bound(&self) -> TermCount {
        self.version.record().wdf_upper_bound
    }

    /// Number of documents containing `term` (0 when unindexed).
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn term_freq(&self, term: &[u8]) -> Result<TermCount> {
        Ok(self
            .tables
            .postlist
            .term_info(term)?
            .map_or(0, |header| header.termfreq))
    }

    /// Sum of `term`'s wdf over all documents (0 when unindexed).
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn collection_freq(&self, term: &[u8]) -> Result<u64> {
        Ok(self
            .tables
            .postlist
            .term_info(term)?
            .map_or(0, |header| header.collection_freq))
    }

    /// A docid-ordered reader over `term`'s postings.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn postings(&self, term: &[u8]) -> Result<Option<PostlistReader>> {
        self.tables.postlist.postings(term)
    }

    /// The length of one document.
    ///
    /// # Errors
    ///
    /// Fails with the missing-document error for unknown docids.
    pub fn doclen(&self, did: DocId) -> Result<TermCount> {
        self.tables.postlist.doclen(did)
    }

    /// A docid-ordered reader over every document's length.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn doclens(&self) -> Result<Option<crate::postlist::DoclenReader>> {
        self.tables.postlist.doclens()
    }

    /// The positions of `term` in `did`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn positions(&self, term: &[u8], did: DocId) -> Result<Option<PositionReader>> {
        match &self.tables.position {
            None => Ok(None),
            Some(table) => table.positions(term, did),
        }
    }

    /// The `(doclen, sorted (term, wdf) list)` of one document.
    ///
    /// # Errors
    ///
    /// Fails with the feature-unavailable error when the database was
    /// built without termlists, and the missing-document error for
    /// unknown docids.
    pub fn termlist(&self, did: DocId) -> Result<(TermCount, Vec<(Vec<u8>, TermCount)>)> {
        let table = self
            .tables
            .termlist
            .as_ref()
            .ok_or(Error::FeatureUnavailable("termlist table absent"))?;
        table.get_termlist(did)?.ok_or(Error::DocNotFound(did))
    }

    /// The opaque payload of one document.
    ///
    /// # Errors
    ///
    /// Fails with the feature-unavailable error when the database was
    /// built without document data.
    pub fn document_data(&self, did: DocId) -> Result<Vec<u8>> {
        let table = self
            .tables
            .docdata
            .as_ref()
            .ok_or(Error::FeatureUnavailable("docdata table absent"))?;
        table.get_data(did)
    }

    /// The value of `slot` in `did`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn value(&self, slot: ValueSlot, did: DocId) -> Result<Option<Vec<u8>>> {
        self.tables.postlist.get_value(slot, did)
    }

    /// The statistics of a value slot.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn value_stats(&self, slot: ValueSlot) -> Result<Option<ValueStats>> {
        self.tables.postlist.value_stats(slot)
    }

    /// One user metadata value; absent reads as empty.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn metadata(&self, name: &[u8]) -> Result<Vec<u8>> {
        self.tables.postlist.get_user_metadata(name)
    }

    /// The user metadata keys starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn metadata_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.tables.postlist.metadata_keys(prefix)
    }

    /// The synonyms of `term`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn synonyms(&self, term: &[u8]) -> Result<Vec<Vec<u8>>> {
        match &self.tables.synonym {
            None => Ok(Vec::new()),
            Some(table) => table.synonyms(term),
        }
    }

    /// A spelling word's frequency.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn spelling_frequency(&self, word: &[u8]) -> Result<TermCount> {
        match &self.tables.spelling {
            None => Ok(0),
            Some(table) => table.word_frequency(word),
        }
    }

    /// Spelling candidates sharing a fragment with `word`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn spelling_candidates(&self, word: &[u8]) -> Result<Vec<Vec<u8>>> {
        match &self.tables.spelling {
            None => Ok(Vec::new()),
            Some(table) => table.candidates(word),
        }
    }

    pub(crate) fn postlist_table(&self) -> &PostlistTable {
        &self.tables.postlist
    }

    pub(crate) fn position_table(&self) -> Option<&PositionTable> {
        self.tables.position.as_ref()
    }

    pub(crate) fn termlist_table(&self) -> Option<&TermlistTable> {
        self.tables.termlist.as_ref()
    }

    pub(crate) fn docdata_table(&self) -> Option<&DocdataTable> {
        self.tables.docdata.as_ref()
    }

    pub(crate) fn spelling_table(&self) -> Option<&SpellingTable> {
        self.tables.spelling.as_ref()
    }

    pub(crate) fn synonym_table(&self) -> Option<&SynonymTable> {
        self.tables.synonym.as_ref()
    }

    pub(crate) fn version_record(&self) -> &VersionRecord {
        self.version.record()
    }
}

/// The writable view of one database directory.
///
/// At most one exists per directory across all processes, enforced by the
/// write lock. Changes stage in memory until [`Self::commit`]; dropping
/// the handle discards them.
pub struct WritableDatabase {
    dir: PathBuf,
    version: VersionFile,
    tables: Tables,
    record: VersionRecord,
    committed: VersionRecord,
    inverter: Inverter,
    _lock: WriteLock,
}

impl WritableDatabase {
    /// Creates a new database with default options.
    ///
    /// # Errors
    ///
    /// Fails when a database already exists at `dir`.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        Self::create_with(dir, DEFAULT_BLOCK_SIZE, DbFlags::default())
    }

    /// Creates a new database with the given block size and flags.
    ///
    /// # Errors
    ///
    /// Fails when a database already exists at `dir`, on a bad block
    /// size, or on I/O.
    pub fn create_with(dir: impl AsRef<Path>, block_size: u32, flags: DbFlags) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !block_size.is_power_of_two() || !(2048..=65_536).contains(&block_size) {
            return Err(Error::InvalidArgument(format!(
                "block size {block_size} is not a power of two in [2048, 65536]",
            )));
        }
        std::fs::create_dir_all(&dir)?;
        if dir.join(crate::version::VERSION_FILE).exists() {
            return Err(Error::Create(format!(
                "database already exists at {}",
                dir.display(),
            )));
        }

        let lock = WriteLock::acquire(&dir)?;
        let tables = Tables::create(&dir, block_size, flags)?;

        let mut record = VersionRecord::fresh(block_size);
        for (id, _table) in tables.each_table() {
            let compress_min = match id {
                TableId::Postlist | TableId::Position => crate::btree::table::DONT_COMPRESS,
                _ => TAG_COMPRESS_MIN,
            };
            record.set_table(id, RootInfo::fresh(block_size, compress_min));
        }
        let version = VersionFile::create(&dir, record.clone())?;
        log::info!("created database at {}", dir.display());

        Ok(Self {
            dir,
            version,
            tables,
            committed: record.clone(),
            record,
            inverter: Inverter::new(),
            _lock: lock,
        })
    }

    /// Opens an existing database for writing.
    ///
    /// # Errors
    ///
    /// Fails with the lock-contention error when another writer holds the
    /// database, or as [`Database::open`].
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let lock = WriteLock::acquire(&dir)?;
        let version = VersionFile::open(&dir)?;
        let tables = Tables::open(&dir, version.record(), true)?;
        let record = version.record().clone();
        Ok(Self {
            dir,
            version,
            tables,
            committed: record.clone(),
            record,
            inverter: Inverter::new(),
            _lock: lock,
        })
    }

    /// The database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// The database identity.
    #[must_use]
    pub fn uuid(&self) -> [u8; 16] {
        self.record.uuid
    }

    /// Number of documents, including staged changes.
    #[must_use]
    pub fn doc_count(&self) -> DocId {
        self.record.doc_count
    }

    /// Highest document id ever used, including staged changes.
    #[must_use]
    pub fn last_docid(&self) -> DocId {
        self.record.last_docid
    }

    /// Sum of document lengths, including staged changes.
    #[must_use]
    pub fn total_doclen(&self) -> u64 {
        self.record.total_doclen
    }

    /// Upper bound on within-document frequency.
    #[must_use]
    pub fn wdf_upper_bound(&self) -> TermCount {
        self.record.wdf_upper_bound
    }

    /// Lower bound on document length.
    #[must_use]
    pub fn doclen_lower_bound(&self) -> TermCount {
        self.record.doclen_lower_bound
    }

    /// Upper bound on document length.
    #[must_use]
    pub fn doclen_upper_bound(&self) -> TermCount {
        self.record.doclen_upper_bound
    }

    /// Number of documents containing `term` in the committed revision.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn term_freq(&self, term: &[u8]) -> Result<TermCount> {
        Ok(self
            .tables
            .postlist
            .term_info(term)?
            .map_or(0, |header| header.termfreq))
    }

    /// Collection frequency of `term` in the committed revision.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn collection_freq(&self, term: &[u8]) -> Result<u64> {
        Ok(self
            .tables
            .postlist
            .term_info(term)?
            .map_or(0, |header| header.collection_freq))
    }

    /// A reader over `term`'s committed postings.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn postings(&self, term: &[u8]) -> Result<Option<PostlistReader>> {
        self.tables.postlist.postings(term)
    }

    /// The committed length of one document.
    ///
    /// # Errors
    ///
    /// Fails with the missing-document error for unknown docids.
    pub fn doclen(&self, did: DocId) -> Result<TermCount> {
        self.tables.postlist.doclen(did)
    }

    /// The positions of `term` in `did` in the committed revision.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn positions(&self, term: &[u8], did: DocId) -> Result<Option<PositionReader>> {
        match &self.tables.position {
            None => Ok(None),
            Some(table) => table.positions(term, did),
        }
    }

    /// The `(doclen, sorted (term, wdf) list)` of one document.
    ///
    /// # Errors
    ///
    /// As [`Database::termlist`].
    pub fn termlist(&self, did: DocId) -> Result<(TermCount, Vec<(Vec<u8>, TermCount)>)> {
        let table = self
            .tables
            .termlist
            .as_ref()
            .ok_or(Error::FeatureUnavailable("termlist table absent"))?;
        table.get_termlist(did)?.ok_or(Error::DocNotFound(did))
    }

    /// The opaque payload of one document.
    ///
    /// # Errors
    ///
    /// As [`Database::document_data`].
    pub fn document_data(&self, did: DocId) -> Result<Vec<u8>> {
        let table = self
            .tables
            .docdata
            .as_ref()
            .ok_or(Error::FeatureUnavailable("docdata table absent"))?;
        table.get_data(did)
    }

    /// The committed value of `slot` in `did`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corruption.
    pub fn value(&self, slot: ValueSlot, did: DocId) -> Result<Option<Vec<u8>>> {
        self.tables.postlist.get_value(slot, did)
    }

    /// One user metadata value.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn metadata(&self, name: &[u8]) -> Result<Vec<u8>> {
        self.tables.postlist.get_user_metadata(name)
    }

    /// Sets one user metadata value; empty removes it. Becomes durable at
    /// the next commit.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn set_metadata(&self, name: &[u8], value: &[u8]) -> Result<()> {
        self.tables.postlist.set_user_metadata(name, value)
    }

    /// Buffers a spelling-word frequency increase.
    ///
    /// # Errors
    ///
    /// Fails on an over-long word.
    pub fn add_spelling(&mut self, word: &[u8], freqinc: TermCount) -> Result<()> {
        match &mut self.tables.spelling {
            None => Err(Error::FeatureUnavailable("spelling table absent")),
            Some(table) => table.add_word(word, freqinc),
        }
    }

    /// Buffers a spelling-word frequency decrease.
    ///
    /// # Errors
    ///
    /// Fails on an over-long word.
    pub fn remove_spelling(&mut self, word: &[u8], freqdec: TermCount) -> Result<()> {
        match &mut self.tables.spelling {
            None => Err(Error::FeatureUnavailable("spelling table absent")),
            Some(table) => table.remove_word(word, freqdec),
        }
    }

    /// Adds a synonym for `term`. Becomes durable at the next commit.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn add_synonym(&self, term: &[u8], synonym: &[u8]) -> Result<()> {
        match &self.tables.synonym {
            None => Err(Error::FeatureUnavailable("synonym table absent")),
            Some(table) => table.add_synonym(term, synonym),
        }
    }

    /// Removes a synonym for `term`.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn remove_synonym(&self, term: &[u8], synonym: &[u8]) -> Result<()> {
        match &self.tables.synonym {
            None => Err(Error::FeatureUnavailable("synonym table absent")),
            Some(table) => table.remove_synonym(term, synonym),
        }
    }

    // ---- document writes -------------------------------------------------

    fn check_term(term: &[u8]) -> Result<()> {
        if term.is_empty() {
            return Err(Error::InvalidArgument("empty term".into()));
        }
        // The worst-case escaped key must leave room for a docid suffix.
        let escaped = term.len() + term.iter().filter(|&&b| b == 0).count();
        if escaped + 10 > crate::btree::block::MAX_KEY_LEN {
            return Err(Error::InvalidArgument(format!(
                "term of {} bytes is too long",
                term.len(),
            )));
        }
        Ok(())
    }

    fn document_exists(&self, did: DocId) -> Result<bool> {
        match self.inverter.doclens.get(&did) {
            Some(Some(_)) => Ok(true),
            Some(None) => Ok(false),
            None => match self.tables.postlist.doclen(did) {
                Ok(_) => Ok(true),
                Err(Error::DocNotFound(_)) => Ok(false),
                Err(e) => Err(e),
            },
        }
    }

    /// Adds a document, assigning the next docid.
    ///
    /// # Errors
    ///
    /// Fails on an unusable term, docid exhaustion, or I/O.
    pub fn add_document(&mut self, doc: Document) -> Result<DocId> {
        let did = self
            .record
            .last_docid
            .checked_add(1)
            .ok_or(Error::InvalidOperation("docid space exhausted"))?;
        self.insert_document(did, &doc)?;
        Ok(did)
    }

    /// Replaces (or creates) the document with this docid.
    ///
    /// # Errors
    ///
    /// Fails on docid 0, an unusable term, or I/O; replacing requires the
    /// termlist table.
    pub fn replace_document(&mut self, did: DocId, doc: Document) -> Result<()> {
        if did == 0 {
            return Err(Error::InvalidArgument("docid 0 is invalid".into()));
        }
        if self.document_exists(did)? {
            self.remove_document(did)?;
        }
        self.insert_document(did, &doc)
    }

    /// Deletes a document.
    ///
    /// # Errors
    ///
    /// Fails with the missing-document error for unknown docids; requires
    /// the termlist table.
    pub fn delete_document(&mut self, did: DocId) -> Result<()> {
        if !self.document_exists(did)? {
            return Err(Error::DocNotFound(did));
        }
        self.remove_document(did)
    }

    fn insert_document(&mut self, did: DocId, doc: &Document) -> Result<()> {
        for term in doc.terms.keys() {
            Self::check_term(term)?;
        }

        let doclen = doc.length();
        let mut max_wdf = 0;
        for (term, entry) in &doc.terms {
            self.inverter.add_posting(term, did, entry.wdf);
            if !entry.positions.is_empty() {
                self.inverter.set_positions(term, did, entry.positions.clone());
            }
            max_wdf = max_wdf.max(entry.wdf);
        }
        self.inverter.set_doclen(did, doclen);
        for (slot, value) in &doc.values {
            self.inverter.set_value(*slot, did, value.clone());
        }

        if let Some(termlist) = &self.tables.termlist {
            let entries: Vec<(Vec<u8>, TermCount)> = doc
                .terms
                .iter()
                .map(|(term, entry)| (term.clone(), entry.wdf))
                .collect();
            termlist.set_termlist(did, doclen, &entries)?;
        }
        if let Some(docdata) = &self.tables.docdata {
            docdata.set_data(did, &doc.data)?;
        }

        if self.record.doc_count == 0 {
            self.record.doclen_lower_bound = doclen;
            self.record.doclen_upper_bound = doclen;
        } else {
            self.record.doclen_lower_bound = self.record.doclen_lower_bound.min(doclen);
            self.record.doclen_upper_bound = self.record.doclen_upper_bound.max(doclen);
        }
        self.record.wdf_upper_bound = self.record.wdf_upper_bound.max(max_wdf);
        self.record.doc_count += 1;
        self.record.last_docid = self.record.last_docid.max(did);
        self.record.total_doclen += u64::from(doclen);
        Ok(())
    }

    fn remove_document(&mut self, did: DocId) -> Result<()> {
        let termlist = self
            .tables
            .termlist
            .as_ref()
            .ok_or(Error::FeatureUnavailable(
                "deleting documents requires the termlist table",
            ))?;
        let (doclen, entries) = termlist
            .get_termlist(did)?
            .ok_or(Error::DocNotFound(did))?;

        for (term, wdf) in &entries {
            self.inverter.remove_posting(term, did, *wdf);
            self.inverter.remove_positions(term, did);
        }
        self.inverter.remove_doclen(did);

        // Values: the used slots are whatever has stats now plus whatever
        // is staged.
        let mut slots: Vec<ValueSlot> = self.tables.postlist.value_slots()?;
        slots.extend(self.inverter.values.keys().copied());
        slots.sort_unstable();
        slots.dedup();
        for slot in slots {
            let staged = self
                .inverter
                .values
                .get(&slot)
                .and_then(|m| m.get(&did))
                .is_some_and(Option::is_some);
            if staged || self.tables.postlist.get_value(slot, did)?.is_some() {
                self.inverter.remove_value(slot, did);
            }
        }

        termlist.delete_termlist(did)?;
        if let Some(docdata) = &self.tables.docdata {
            docdata.delete_data(did)?;
        }

        self.record.doc_count -= 1;
        self.record.total_doclen = self.record.total_doclen.saturating_sub(u64::from(doclen));
        Ok(())
    }

    pub(crate) fn postlist_table(&self) -> &PostlistTable {
        &self.tables.postlist
    }

    pub(crate) fn position_table(&self) -> Option<&PositionTable> {
        self.tables.position.as_ref()
    }

    pub(crate) fn termlist_table(&self) -> Option<&TermlistTable> {
        self.tables.termlist.as_ref()
    }

    pub(crate) fn docdata_table(&self) -> Option<&DocdataTable> {
        self.tables.docdata.as_ref()
    }

    pub(crate) fn spelling_table(&self) -> Option<&SpellingTable> {
        self.tables.spelling.as_ref()
    }

    pub(crate) fn synonym_table(&self) -> Option<&SynonymTable> {
        self.tables.synonym.as_ref()
    }

    /// Overwrites the cached statistics; the compactor recomputes them
    /// from its sources instead of staging documents.
    pub(crate) fn set_statistics(&mut self, stats: &Metainfo, doc_count: DocId, spelling_bound: TermCount) {
        self.record.doc_count = doc_count;
        self.record.last_docid = stats.last_docid;
        self.record.doclen_lower_bound = stats.doclen_lower_bound;
        self.record.doclen_upper_bound = stats.doclen_upper_bound;
        self.record.wdf_upper_bound = stats.wdf_upper_bound;
        self.record.total_doclen = stats.total_doclen;
        self.record.spelling_wordfreq_upper_bound = spelling_bound;
    }

    // ---- commit / cancel -------------------------------------------------

    /// Makes every staged change durable and visible to new readers, as
    /// one atomic revision step.
    ///
    /// # Errors
    ///
    /// Fails on I/O; on failure the in-memory state still holds the
    /// staged changes and the on-disk database still reads at the old
    /// revision.
    pub fn commit(&mut self) -> Result<()> {
        let new_revision = self.record.revision + 1;
        log::debug!(
            "committing revision {new_revision} at {}",
            self.dir.display(),
        );

        // Document lengths, then postings.
        self.tables
            .postlist
            .merge_doclen_changes(&self.inverter.doclens)?;
        for (term, changes) in &self.inverter.terms {
            self.tables.postlist.merge_term_changes(
                term,
                changes.tf_delta,
                changes.cf_delta,
                &changes.docs,
            )?;
        }

        // Position lists.
        if !self.inverter.positions.is_empty() {
            let position = self
                .tables
                .position
                .as_ref()
                .ok_or(Error::FeatureUnavailable("position table absent"))?;
            for ((term, did), positions) in &self.inverter.positions {
                match positions {
                    Some(positions) => position.set_positionlist(term, *did, positions)?,
                    None => position.delete_positionlist(term, *did)?,
                }
            }
        }

        // Value streams plus their statistics.
        let value_slots: Vec<ValueSlot> = self.inverter.values.keys().copied().collect();
        for slot in value_slots {
            let Some(changes) = self.inverter.values.get(&slot) else {
                continue;
            };
            let had = self.tables.postlist.value_stats(slot)?;
            let mut initialized = had.is_some();
            let mut stats = had.unwrap_or_default();
            for (did, change) in changes {
                let existed = self.tables.postlist.get_value(slot, *did)?.is_some();
                match change {
                    Some(value) => {
                        if !existed {
                            stats.freq += 1;
                        }
                        if initialized {
                            if value.as_slice() < stats.lower_bound.as_slice() {
                                stats.lower_bound = value.clone();
                            }
                            if value.as_slice() > stats.upper_bound.as_slice() {
                                stats.upper_bound = value.clone();
                            }
                        } else {
                            stats.lower_bound = value.clone();
                            stats.upper_bound = value.clone();
                            initialized = true;
                        }
                    }
                    None => {
                        if existed {
                            stats.freq = stats.freq.saturating_sub(1);
                        }
                    }
                }
            }
            self.tables.postlist.merge_value_changes(slot, changes)?;
            self.tables.postlist.set_value_stats(slot, &stats)?;
        }

        // Spelling buffer.
        if let Some(spelling) = &mut self.tables.spelling {
            let max_freq = spelling.flush()?;
            self.record.spelling_wordfreq_upper_bound =
                self.record.spelling_wordfreq_upper_bound.max(max_freq);
        }

        // Metainfo mirrors the statistics into the postlist table.
        self.tables.postlist.set_metainfo(&Metainfo {
            last_docid: self.record.last_docid,
            doclen_lower_bound: self.record.doclen_lower_bound,
            wdf_upper_bound: self.record.wdf_upper_bound,
            doclen_upper_bound: self.record.doclen_upper_bound,
            total_doclen: self.record.total_doclen,
        })?;

        // Flush and stamp every table, then the version file.
        let mut record = self.record.clone();
        record.revision = new_revision;
        for (id, table) in self.tables.each_table() {
            table.flush_db()?;
            let info = table.commit(new_revision)?;
            record.set_table(id, info);
        }
        self.version.commit(record.clone())?;

        self.committed = record.clone();
        self.record = record;
        self.inverter.clear();
        Ok(())
    }

    /// Discards every staged change, returning to the committed revision.
    pub fn cancel(&mut self) {
        self.inverter.clear();
        let revision = self.committed.revision;
        for (id, table) in self.tables.each_table() {
            if let Some(info) = self.committed.table(id) {
                table.cancel(info, revision);
            }
        }
        if let Some(spelling) = &mut self.tables.spelling {
            spelling.discard();
        }
        self.record = self.committed.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn doc_with_terms(terms: &[&str]) -> Document {
        let mut doc = Document::new();
        for term in terms {
            doc.add_term(term, 1);
        }
        doc
    }

    #[test]
    fn single_document_statistics() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = WritableDatabase::create(dir.path())?;

        let mut doc = doc_with_terms(&["brown", "fox", "quick", "the"]);
        doc.set_data("the quick brown fox");
        let did = db.add_document(doc)?;
        assert_eq!(1, did);
        db.commit()?;

        assert_eq!(1, db.doc_count());
        assert_eq!(4, db.doclen(1)?);
        assert_eq!(1, db.term_freq(b"fox")?);
        assert_eq!(1, db.collection_freq(b"fox")?);

        let mut postings = db.postings(b"fox")?.unwrap();
        assert_eq!(Some((1, 1)), postings.next()?);
        assert_eq!(None, postings.next()?);

        assert_eq!(b"the quick brown fox".to_vec(), db.document_data(1)?);
        Ok(())
    }

    #[test]
    fn second_document_accumulates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = WritableDatabase::create(dir.path())?;

        db.add_document(doc_with_terms(&["brown", "fox", "quick", "the"]))?;
        db.commit()?;

        let mut doc = Document::new();
        doc.add_term("fox", 2);
        doc.add_term("the", 1);
        db.add_document(doc)?;
        db.commit()?;

        assert_eq!(2, db.term_freq(b"fox")?);
        assert_eq!(3, db.collection_freq(b"fox")?);
        assert_eq!(7, db.total_doclen());

        let mut postings = db.postings(b"fox")?.unwrap();
        assert_eq!(Some((1, 1)), postings.next()?);
        assert_eq!(Some((2, 2)), postings.next()?);
        assert_eq!(None, postings.next()?);
        Ok(())
    }

    #[test]
    fn deletion_unindexes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = WritableDatabase::create(dir.path())?;

        db.add_document(doc_with_terms(&["brown", "fox", "quick", "the"]))?;
        let mut doc = Document::new();
        doc.add_term("fox", 2);
        doc.add_term("the", 1);
        db.add_document(doc)?;
        db.commit()?;

        db.delete_document(1)?;
        db.commit()?;

        assert_eq!(1, db.doc_count());
        assert_eq!(0, db.term_freq(b"brown")?);
        assert_eq!(1, db.term_freq(b"fox")?);
        let mut postings = db.postings(b"fox")?.unwrap();
        assert_eq!(Some((2, 2)), postings.next()?);
        assert_eq!(None, postings.next()?);
        assert!(matches!(db.doclen(1), Err(Error::DocNotFound(1))));

        assert!(matches!(db.delete_document(1), Err(Error::DocNotFound(1))));
        Ok(())
    }

    #[test]
    fn replace_document_swaps_postings() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = WritableDatabase::create(dir.path())?;

        db.add_document(doc_with_terms(&["old", "stale"]))?;
        db.commit()?;

        db.replace_document(1, doc_with_terms(&["fresh", "new"]))?;
        db.commit()?;

        assert_eq!(1, db.doc_count());
        assert_eq!(0, db.term_freq(b"old")?);
        assert_eq!(1, db.term_freq(b"fresh")?);
        let (doclen, terms) = db.termlist(1)?;
        assert_eq!(2, doclen);
        assert_eq!(
            vec![(b"fresh".to_vec(), 1), (b"new".to_vec(), 1)],
            terms,
        );
        Ok(())
    }

    #[test]
    fn positions_values_metadata_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = WritableDatabase::create(dir.path())?;

        let mut doc = Document::new();
        doc.add_posting("fox", 2);
        doc.add_posting("fox", 7);
        doc.add_value(0, "sort-key");
        db.add_document(doc)?;
        db.set_metadata(b"state", b"fresh")?;
        db.commit()?;

        let mut positions = db.positions(b"fox", 1)?.unwrap();
        assert_eq!(Some(2), positions.next());
        assert_eq!(Some(7), positions.next());
        assert_eq!(None, positions.next());

        assert_eq!(Some(b"sort-key".to_vec()), db.value(0, 1)?);
        assert_eq!(b"fresh".to_vec(), db.metadata(b"state")?);

        // Readers see the same through a separate handle.
        let reader = Database::open(dir.path())?;
        assert_eq!(1, reader.doc_count());
        assert_eq!(Some(b"sort-key".to_vec()), reader.value(0, 1)?);
        let stats = reader.value_stats(0)?.unwrap();
        assert_eq!(1, stats.freq);
        assert_eq!(b"sort-key".to_vec(), stats.lower_bound);
        Ok(())
    }

    #[test]
    fn cancel_discards_staged_changes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = WritableDatabase::create(dir.path())?;

        db.add_document(doc_with_terms(&["kept"]))?;
        db.commit()?;

        db.add_document(doc_with_terms(&["dropped"]))?;
        db.set_metadata(b"key", b"pending")?;
        db.cancel();

        assert_eq!(1, db.doc_count());
        db.commit()?;
        assert_eq!(1, db.term_freq(b"kept")?);
        assert_eq!(0, db.term_freq(b"dropped")?);
        assert_eq!(Vec::<u8>::new(), db.metadata(b"key")?);
        Ok(())
    }

    #[test]
    fn create_refuses_existing_database() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = WritableDatabase::create(dir.path())?;
        drop(db);
        assert!(matches!(
            WritableDatabase::create(dir.path()),
            Err(Error::Create(_))
        ));
        Ok(())
    }

    #[test]
    fn no_termlist_flag_suppresses_per_document_tables() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = WritableDatabase::create_with(
            dir.path(),
            2048,
            DbFlags { no_termlist: true },
        )?;

        db.add_document(doc_with_terms(&["term"]))?;
        db.commit()?;

        assert!(matches!(db.termlist(1), Err(Error::FeatureUnavailable(_))));
        assert!(matches!(
            db.document_data(1),
            Err(Error::FeatureUnavailable(_))
        ));
        assert!(matches!(
            db.delete_document(1),
            Err(Error::FeatureUnavailable(_))
        ));
        assert!(!dir.path().join("termlist.quartz").exists());
        assert!(!dir.path().join("docdata.quartz").exists());
        Ok(())
    }

    #[test]
    fn reader_reopens_after_external_commit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = WritableDatabase::create(dir.path())?;
        db.add_document(doc_with_terms(&["one"]))?;
        db.commit()?;

        let mut reader = Database::open(dir.path())?;
        assert_eq!(1, reader.doc_count());
        assert!(!reader.reopen()?);

        db.add_document(doc_with_terms(&["two"]))?;
        db.commit()?;

        // The reader still reads its snapshot until told to reopen.
        assert_eq!(1, reader.doc_count());
        assert!(reader.reopen()?);
        assert_eq!(2, reader.doc_count());
        assert_eq!(1, reader.term_freq(b"two")?);
        Ok(())
    }

    #[test]
    fn uuids_differ_between_databases() -> Result<()> {
        let dir_a = tempfile::tempdir()?;
        let dir_b = tempfile::tempdir()?;
        let a = WritableDatabase::create(dir_a.path())?;
        let b = WritableDatabase::create(dir_b.path())?;
        assert_ne!(a.uuid(), b.uuid());
        Ok(())
    }
}
