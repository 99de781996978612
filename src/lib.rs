// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embeddable full-text search index storage engine.
//!
//! ##### NOTE
//!
//! > This crate only provides the storage layer of a search engine: the
//! > on-disk tables, the posting encodings and the compactor. It does not
//! > ship a query planner, ranking weights, stemmers or tokenizers — terms
//! > are opaque byte strings supplied by the caller.
//!
//! ##### About
//!
//! The heart of the crate is a block-structured copy-on-write B-tree
//! (`Table`) keyed by opaque byte strings. On top of it sit the
//! search-specific encodings: per-term posting chunks with within-document
//! frequencies, document length chunks, interpolative-coded position lists,
//! prefix-compressed termlists, value streams, spelling and synonym data.
//!
//! Commits are revisioned and atomic: table files are written
//! copy-on-write and fsync'd, then a small version file naming every
//! table's root is atomically replaced. Readers opened at an older
//! revision keep seeing a consistent snapshot until they reopen.
//!
//! # Example usage
//!
//! ```
//! use quartz::{Document, WritableDatabase};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let mut db = WritableDatabase::create(folder.path())?;
//!
//! let mut doc = Document::new();
//! doc.add_term("quick", 1);
//! doc.add_term("fox", 1);
//! doc.set_data("the quick fox");
//!
//! let docid = db.add_document(doc)?;
//! db.commit()?;
//!
//! assert_eq!(1, docid);
//! assert_eq!(1, db.doc_count());
//! assert_eq!(1, db.term_freq(b"fox")?);
//! #
//! # Ok::<(), quartz::Error>(())
//! ```

#![doc(html_root_url = "https://docs.rs/quartz-index")]
#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

#[doc(hidden)]
pub mod btree;

pub mod coding;

mod compact;

mod db;

mod docdata;

mod error;

#[doc(hidden)]
pub mod io;

mod lock;

mod positionlist;

#[doc(hidden)]
pub mod postlist;

mod spelling;

mod synonym;

mod termlist;

mod version;

/// A document identifier; the first document added to a database gets 1.
pub type DocId = u32;

/// A term's within-document frequency, document length, or position.
pub type TermCount = u32;

/// A value slot number.
pub type ValueSlot = u32;

/// A table file revision.
pub type Revision = u32;

/// A block number within one table file.
pub type BlockNum = u32;

#[doc(hidden)]
pub use {
    btree::{cursor::Cursor, table::Table},
    version::{RootInfo, VersionFile},
};

pub use {
    compact::{compact, CompactOptions, MetadataResolver},
    db::{Database, DbFlags, Document, WritableDatabase},
    error::{Error, Result},
};
