// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A document under construction.
//!
//! The caller tokenizes text however it likes; the engine only sees
//! opaque terms with within-document frequencies and optional positions,
//! numbered values and an opaque payload.

use crate::{TermCount, ValueSlot};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub(crate) struct TermEntry {
    pub wdf: TermCount,
    pub positions: Vec<TermCount>,
}

/// A document to be added to a database.
#[derive(Debug, Default, Clone)]
pub struct Document {
    pub(crate) terms: BTreeMap<Vec<u8>, TermEntry>,
    pub(crate) values: BTreeMap<ValueSlot, Vec<u8>>,
    pub(crate) data: Vec<u8>,
}

impl Document {
    /// An empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `wdf_inc` occurrences of a term, without positions.
    pub fn add_term(&mut self, term: impl AsRef<[u8]>, wdf_inc: TermCount) {
        let entry = self.terms.entry(term.as_ref().to_vec()).or_default();
        entry.wdf += wdf_inc;
    }

    /// Adds one occurrence of a term at a position.
    pub fn add_posting(&mut self, term: impl AsRef<[u8]>, position: TermCount) {
        let entry = self.terms.entry(term.as_ref().to_vec()).or_default();
        entry.wdf += 1;
        match entry.positions.binary_search(&position) {
            Ok(_) => {}
            Err(at) => entry.positions.insert(at, position),
        }
    }

    /// Sets the value in a slot.
    pub fn add_value(&mut self, slot: ValueSlot, value: impl AsRef<[u8]>) {
        self.values.insert(slot, value.as_ref().to_vec());
    }

    /// Sets the opaque payload.
    pub fn set_data(&mut self, data: impl AsRef<[u8]>) {
        self.data = data.as_ref().to_vec();
    }

    /// The document length: the sum of all wdfs.
    #[must_use]
    pub fn length(&self) -> TermCount {
        self.terms.values().map(|entry| entry.wdf).sum()
    }

    /// The number of distinct terms.
    #[must_use]
    pub fn term_count(&self) -> usize {
        self.terms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn terms_accumulate() {
        let mut doc = Document::new();
        doc.add_term("fox", 1);
        doc.add_term("fox", 1);
        doc.add_posting("quick", 3);
        doc.add_posting("quick", 1);
        doc.add_posting("quick", 3);

        assert_eq!(2, doc.term_count());
        assert_eq!(5, doc.length());

        let quick = doc.terms.get(&b"quick"[..].to_vec()).unwrap();
        assert_eq!(3, quick.wdf);
        assert_eq!(vec![1, 3], quick.positions);
    }
}
