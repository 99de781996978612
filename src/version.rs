// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The version file: the small record that makes commits atomic.
//!
//! The file holds two self-checksummed copies of the version record. A
//! commit writes the new record first, the previously live one second, and
//! replaces the file atomically; opening picks the copy whose checksum
//! verifies and whose revision is higher. A crash between table flush and
//! the rename therefore lands on the older, fully intact revision.

use crate::{
    btree::freelist::{FlCursor, FreeListState},
    coding::{Decode, DecodeError, Encode, EncodeError},
    io::rewrite_atomic,
    DocId, Error, Result, Revision, TermCount,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use varint_rs::{VarintReader, VarintWriter};

/// Name of the version file inside a database directory.
pub const VERSION_FILE: &str = "iamquartz";

const MAGIC: [u8; 8] = *b"quartzdb";
const FORMAT_VERSION: u32 = 1;

/// The tables a database may hold, in version-record order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(usize)]
pub enum TableId {
    /// Postings, document lengths, values, user metadata.
    Postlist = 0,
    /// Position lists.
    Position = 1,
    /// Per-document term lists.
    Termlist = 2,
    /// Per-document opaque payloads.
    Docdata = 3,
    /// Spelling correction data.
    Spelling = 4,
    /// Synonym data.
    Synonym = 5,
}

/// Number of table slots in a version record.
pub const N_TABLES: usize = 6;

/// All table ids, in record order.
pub const ALL_TABLES: [TableId; N_TABLES] = [
    TableId::Postlist,
    TableId::Position,
    TableId::Termlist,
    TableId::Docdata,
    TableId::Spelling,
    TableId::Synonym,
];

impl TableId {
    /// The on-disk file name of this table.
    #[must_use]
    pub fn filename(self) -> &'static str {
        match self {
            Self::Postlist => "postlist.quartz",
            Self::Position => "position.quartz",
            Self::Termlist => "termlist.quartz",
            Self::Docdata => "docdata.quartz",
            Self::Spelling => "spelling.quartz",
            Self::Synonym => "synonym.quartz",
        }
    }

    /// Short name for logging and errors.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Postlist => "postlist",
            Self::Position => "position",
            Self::Termlist => "termlist",
            Self::Docdata => "docdata",
            Self::Spelling => "spelling",
            Self::Synonym => "synonym",
        }
    }
}

/// Per-table metadata recorded at each commit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RootInfo {
    /// Root block number.
    pub root: u32,
    /// Tree height; 0 when the root is a leaf.
    pub level: u8,
    /// Number of entries.
    pub num_entries: u64,
    /// Fixed block size of the table file.
    pub block_size: u32,
    /// The table has never been flushed; its root is the pristine empty
    /// block.
    pub faked_root: bool,
    /// The last transaction ended in sequential (ascending-insert) mode.
    pub sequential: bool,
    /// Tag length threshold for compression; 0 = never.
    pub compress_min: u32,
    /// Free-list cursors.
    pub free_list: FreeListState,
}

impl RootInfo {
    /// Root info for a freshly created, empty table.
    #[must_use]
    pub fn fresh(block_size: u32, compress_min: u32) -> Self {
        Self {
            root: 0,
            level: 0,
            num_entries: 0,
            block_size,
            faked_root: true,
            sequential: false,
            compress_min,
            free_list: FreeListState {
                head: FlCursor::default(),
                tail: FlCursor::default(),
                first_unused_block: 1,
            },
        }
    }
}

const ROOT_FLAG_FAKED: u8 = 0x01;
const ROOT_FLAG_SEQUENTIAL: u8 = 0x02;

impl Encode for RootInfo {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32_varint(self.root)?;
        writer.write_u8(self.level)?;
        writer.write_u64_varint(self.num_entries)?;
        writer.write_u32_varint(self.block_size)?;

        let mut flags = 0u8;
        if self.faked_root {
            flags |= ROOT_FLAG_FAKED;
        }
        if self.sequential {
            flags |= ROOT_FLAG_SEQUENTIAL;
        }
        writer.write_u8(flags)?;

        writer.write_u32_varint(self.compress_min)?;
        writer.write_u32_varint(self.free_list.head.n)?;
        writer.write_u32_varint(self.free_list.head.c)?;
        writer.write_u32_varint(self.free_list.tail.n)?;
        writer.write_u32_varint(self.free_list.tail.c)?;
        writer.write_u32_varint(self.free_list.first_unused_block)?;
        Ok(())
    }
}

impl Decode for RootInfo {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let root = reader.read_u32_varint()?;
        let level = reader.read_u8()?;
        let num_entries = reader.read_u64_varint()?;
        let block_size = reader.read_u32_varint()?;
        let flags = reader.read_u8()?;
        let compress_min = reader.read_u32_varint()?;
        let free_list = FreeListState {
            head: FlCursor {
                n: reader.read_u32_varint()?,
                c: reader.read_u32_varint()?,
            },
            tail: FlCursor {
                n: reader.read_u32_varint()?,
                c: reader.read_u32_varint()?,
            },
            first_unused_block: reader.read_u32_varint()?,
        };
        Ok(Self {
            root,
            level,
            num_entries,
            block_size,
            faked_root: flags & ROOT_FLAG_FAKED != 0,
            sequential: flags & ROOT_FLAG_SEQUENTIAL != 0,
            compress_min,
            free_list,
        })
    }
}

/// One full version record: revision, per-table roots, statistics, UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    /// The revision this record describes.
    pub revision: Revision,
    /// Block size used by every table of this database.
    pub block_size: u32,
    /// Root info per table; `None` when the table does not exist.
    pub tables: [Option<RootInfo>; N_TABLES],
    /// Number of documents.
    pub doc_count: DocId,
    /// Highest document id ever used.
    pub last_docid: DocId,
    /// Lower bound on document length.
    pub doclen_lower_bound: TermCount,
    /// Upper bound on document length.
    pub doclen_upper_bound: TermCount,
    /// Upper bound on within-document frequency.
    pub wdf_upper_bound: TermCount,
    /// Sum of all document lengths.
    pub total_doclen: u64,
    /// Upper bound on spelling word frequency.
    pub spelling_wordfreq_upper_bound: TermCount,
    /// Identity of this database, fresh at creation.
    pub uuid: [u8; 16],
}

impl VersionRecord {
    /// The record of a brand-new, empty database.
    #[must_use]
    pub fn fresh(block_size: u32) -> Self {
        Self {
            revision: 0,
            block_size,
            tables: [None; N_TABLES],
            doc_count: 0,
            last_docid: 0,
            doclen_lower_bound: 0,
            doclen_upper_bound: 0,
            wdf_upper_bound: 0,
            total_doclen: 0,
            spelling_wordfreq_upper_bound: 0,
            uuid: *uuid::Uuid::new_v4().as_bytes(),
        }
    }

    /// The root info slot for `table`.
    #[must_use]
    pub fn table(&self, table: TableId) -> Option<&RootInfo> {
        self.tables.get(table as usize).and_then(Option::as_ref)
    }

    /// Sets the root info slot for `table`.
    pub fn set_table(&mut self, table: TableId, info: RootInfo) {
        if let Some(slot) = self.tables.get_mut(table as usize) {
            *slot = Some(info);
        }
    }
}

impl Encode for VersionRecord {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32_varint(FORMAT_VERSION)?;
        writer.write_u32_varint(self.revision)?;
        writer.write_u32_varint(self.block_size)?;
        for slot in &self.tables {
            match slot {
                None => writer.write_u8(0)?,
                Some(info) => {
                    writer.write_u8(1)?;
                    info.encode_into(writer)?;
                }
            }
        }
        writer.write_u32_varint(self.doc_count)?;
        writer.write_u32_varint(self.last_docid)?;
        writer.write_u32_varint(self.doclen_lower_bound)?;
        writer.write_u32_varint(self.doclen_upper_bound)?;
        writer.write_u32_varint(self.wdf_upper_bound)?;
        writer.write_u64_varint(self.total_doclen)?;
        writer.write_u32_varint(self.spelling_wordfreq_upper_bound)?;
        writer.write_all(&self.uuid)?;
        Ok(())
    }
}

impl Decode for VersionRecord {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let format = reader.read_u32_varint()?;
        if format != FORMAT_VERSION {
            return Err(DecodeError::InvalidTag(("format version", format as u8)));
        }
        let revision = reader.read_u32_varint()?;
        let block_size = reader.read_u32_varint()?;
        let mut tables = [None; N_TABLES];
        for slot in &mut tables {
            match reader.read_u8()? {
                0 => {}
                1 => *slot = Some(RootInfo::decode_from(reader)?),
                other => return Err(DecodeError::InvalidTag(("table presence", other))),
            }
        }
        let doc_count = reader.read_u32_varint()?;
        let last_docid = reader.read_u32_varint()?;
        let doclen_lower_bound = reader.read_u32_varint()?;
        let doclen_upper_bound = reader.read_u32_varint()?;
        let wdf_upper_bound = reader.read_u32_varint()?;
        let total_doclen = reader.read_u64_varint()?;
        let spelling_wordfreq_upper_bound = reader.read_u32_varint()?;
        let mut uuid = [0u8; 16];
        reader.read_exact(&mut uuid)?;
        Ok(Self {
            revision,
            block_size,
            tables,
            doc_count,
            last_docid,
            doclen_lower_bound,
            doclen_upper_bound,
            wdf_upper_bound,
            total_doclen,
            spelling_wordfreq_upper_bound,
            uuid,
        })
    }
}

fn checksum(body: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(body)
}

fn encode_record(record: &VersionRecord) -> Vec<u8> {
    let body = record.encode_into_vec();
    let mut out = Vec::with_capacity(body.len() + 12);
    #[allow(clippy::expect_used)]
    {
        out.write_u32::<BigEndian>(body.len() as u32)
            .expect("cannot fail");
        out.extend_from_slice(&body);
        out.write_u64::<BigEndian>(checksum(&body)).expect("cannot fail");
    }
    out
}

fn decode_record(reader: &mut Cursor<&[u8]>) -> Option<VersionRecord> {
    let len = reader.read_u32::<BigEndian>().ok()? as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).ok()?;
    let stored = reader.read_u64::<BigEndian>().ok()?;
    if checksum(&body) != stored {
        return None;
    }
    VersionRecord::decode_from(&mut Cursor::new(body.as_slice())).ok()
}

/// The open version file of a database.
pub struct VersionFile {
    path: PathBuf,
    record: VersionRecord,
    previous: Option<VersionRecord>,
}

impl VersionFile {
    /// Creates the version file of a brand-new database from its initial
    /// record.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn create(dir: &Path, record: VersionRecord) -> Result<Self> {
        let this = Self {
            path: dir.join(VERSION_FILE),
            record,
            previous: None,
        };
        this.write_out()?;
        Ok(this)
    }

    /// Opens an existing version file and picks the live record.
    ///
    /// # Errors
    ///
    /// Fails when neither record verifies, or the format revision is from
    /// a different major version.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(VERSION_FILE);
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::Opening(format!("cannot read {}: {e}", path.display())))?;

        let Some(rest) = bytes.strip_prefix(&MAGIC[..]) else {
            return Err(Error::Corrupt(format!(
                "{} does not start with the version magic",
                path.display(),
            )));
        };

        let mut reader = Cursor::new(rest);
        let first = decode_record(&mut reader);
        let second = decode_record(&mut reader);

        // A record that parses but names a future format is a version
        // mismatch, not corruption; detect it before failing.
        if first.is_none() && second.is_none() {
            if Self::looks_like_other_version(rest) {
                return Err(Error::Version(format!(
                    "{} is from an incompatible format version",
                    path.display(),
                )));
            }
            return Err(Error::Corrupt(format!(
                "no valid version record in {}",
                path.display(),
            )));
        }

        let (record, previous) = match (first, second) {
            (Some(a), Some(b)) => {
                if a.revision >= b.revision {
                    (a, Some(b))
                } else {
                    (b, Some(a))
                }
            }
            (Some(a), None) => (a, None),
            (None, Some(b)) => (b, None),
            (None, None) => unreachable!(),
        };

        log::trace!("opened {} at revision {}", path.display(), record.revision);

        Ok(Self {
            path,
            record,
            previous,
        })
    }

    fn looks_like_other_version(rest: &[u8]) -> bool {
        let mut reader = Cursor::new(rest);
        let Ok(len) = reader.read_u32::<BigEndian>() else {
            return false;
        };
        let mut body = vec![0u8; len as usize];
        if reader.read_exact(&mut body).is_err() {
            return false;
        }
        let Ok(stored) = reader.read_u64::<BigEndian>() else {
            return false;
        };
        if checksum(&body) != stored {
            return false;
        }
        let mut body = Cursor::new(body.as_slice());
        matches!(body.read_u32_varint(), Ok(v) if v != FORMAT_VERSION)
    }

    /// Reads just the live revision, for cheap reopen checks.
    ///
    /// # Errors
    ///
    /// As [`Self::open`].
    pub fn peek_revision(dir: &Path) -> Result<Revision> {
        Ok(Self::open(dir)?.record.revision)
    }

    /// The live record.
    #[must_use]
    pub fn record(&self) -> &VersionRecord {
        &self.record
    }

    /// Atomically replaces the file so `new` becomes the live record and
    /// the previously live one stays as fallback.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn commit(&mut self, new: VersionRecord) -> Result<()> {
        self.previous = Some(std::mem::replace(&mut self.record, new));
        self.write_out()
    }

    fn write_out(&self) -> Result<()> {
        let mut content = Vec::new();
        content.extend_from_slice(&MAGIC);
        content.extend_from_slice(&encode_record(&self.record));
        content.extend_from_slice(&encode_record(
            self.previous.as_ref().unwrap_or(&self.record),
        ));
        rewrite_atomic(&self.path, &content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample_record(revision: Revision) -> VersionRecord {
        let mut record = VersionRecord::fresh(4096);
        record.revision = revision;
        record.doc_count = 7;
        record.last_docid = 9;
        record.total_doclen = 123;
        record.set_table(
            TableId::Postlist,
            RootInfo {
                root: 17,
                level: 2,
                num_entries: 1234,
                block_size: 4096,
                faked_root: false,
                sequential: true,
                compress_min: 0,
                free_list: FreeListState {
                    head: FlCursor { n: 3, c: 8 },
                    tail: FlCursor { n: 5, c: 100 },
                    first_unused_block: 42,
                },
            },
        );
        record
    }

    #[test]
    fn record_roundtrip() {
        let record = sample_record(6);
        let bytes = record.encode_into_vec();
        let decoded = VersionRecord::decode_from(&mut Cursor::new(bytes.as_slice())).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn create_open_commit_cycle() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let mut version = VersionFile::create(dir.path(), VersionRecord::fresh(8192))?;
        let uuid = version.record().uuid;
        assert_eq!(0, version.record().revision);

        let mut next = version.record().clone();
        next.revision = 1;
        next.doc_count = 3;
        version.commit(next)?;

        let reopened = VersionFile::open(dir.path())?;
        assert_eq!(1, reopened.record().revision);
        assert_eq!(3, reopened.record().doc_count);
        assert_eq!(uuid, reopened.record().uuid);
        assert_eq!(1, VersionFile::peek_revision(dir.path())?);
        Ok(())
    }

    #[test]
    fn corrupt_record_falls_back_to_survivor() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let mut version = VersionFile::create(dir.path(), VersionRecord::fresh(4096))?;
        let mut next = version.record().clone();
        next.revision = 1;
        version.commit(next)?;

        // Flip a byte inside the first (newer) record's body.
        let path = dir.path().join(VERSION_FILE);
        let mut bytes = std::fs::read(&path)?;
        bytes[MAGIC.len() + 20] ^= 0xff;
        std::fs::write(&path, &bytes)?;

        // The survivor is the older record.
        let reopened = VersionFile::open(dir.path())?;
        assert_eq!(0, reopened.record().revision);
        Ok(())
    }

    #[test]
    fn garbage_file_is_corrupt() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(VERSION_FILE), b"not a version file")?;
        assert!(matches!(
            VersionFile::open(dir.path()),
            Err(Error::Corrupt(_))
        ));
        Ok(())
    }

    #[test]
    fn fresh_databases_get_distinct_uuids() {
        let a = VersionRecord::fresh(4096);
        let b = VersionRecord::fresh(4096);
        assert_ne!(a.uuid, b.uuid);
    }
}
