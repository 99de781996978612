// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The inverter: the writable side's in-memory pending-change buffer.
//!
//! Document additions, deletions and replacements stage their effects
//! here — per-term posting deltas, document lengths, position lists and
//! values — and a commit drains the buffer table by table in dependency
//! order. Dropping the buffer instead is how `cancel()` works.

use crate::{DocId, TermCount, ValueSlot};
use std::collections::BTreeMap;

/// Buffered changes to one term's posting list.
#[derive(Debug, Default)]
pub struct TermChanges {
    /// Net change to the term's document count.
    pub tf_delta: i64,
    /// Net change to the term's collection frequency.
    pub cf_delta: i64,
    /// Per-document new wdf, or `None` for a removed posting.
    pub docs: BTreeMap<DocId, Option<TermCount>>,
}

/// Pending changes accumulated between commits.
#[derive(Debug, Default)]
pub struct Inverter {
    /// Per-term posting changes.
    pub terms: BTreeMap<Vec<u8>, TermChanges>,
    /// Per-document length changes (`None` = document removed).
    pub doclens: BTreeMap<DocId, Option<TermCount>>,
    /// Per `(term, docid)` position lists (`None` = removed).
    pub positions: BTreeMap<(Vec<u8>, DocId), Option<Vec<TermCount>>>,
    /// Per-slot, per-document value changes.
    pub values: BTreeMap<ValueSlot, BTreeMap<DocId, Option<Vec<u8>>>>,
}

impl Inverter {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
            && self.doclens.is_empty()
            && self.positions.is_empty()
            && self.values.is_empty()
    }

    /// Drops everything pending.
    pub fn clear(&mut self) {
        self.terms.clear();
        self.doclens.clear();
        self.positions.clear();
        self.values.clear();
    }

    /// Stages a new posting of `term` in `did`.
    pub fn add_posting(&mut self, term: &[u8], did: DocId, wdf: TermCount) {
        let changes = self.terms.entry(term.to_vec()).or_default();
        changes.tf_delta += 1;
        changes.cf_delta += i64::from(wdf);
        changes.docs.insert(did, Some(wdf));
    }

    /// Stages removal of `term`'s posting in `did`; `old_wdf` is the wdf
    /// being removed.
    pub fn remove_posting(&mut self, term: &[u8], did: DocId, old_wdf: TermCount) {
        let changes = self.terms.entry(term.to_vec()).or_default();
        changes.tf_delta -= 1;
        changes.cf_delta -= i64::from(old_wdf);
        changes.docs.insert(did, None);
    }

    /// Stages a wdf change for an existing posting.
    pub fn update_posting(
        &mut self,
        term: &[u8],
        did: DocId,
        old_wdf: TermCount,
        new_wdf: TermCount,
    ) {
        let changes = self.terms.entry(term.to_vec()).or_default();
        changes.cf_delta += i64::from(new_wdf) - i64::from(old_wdf);
        changes.docs.insert(did, Some(new_wdf));
    }

    /// Stages a document's length.
    pub fn set_doclen(&mut self, did: DocId, doclen: TermCount) {
        self.doclens.insert(did, Some(doclen));
    }

    /// Stages removal of a document's length.
    pub fn remove_doclen(&mut self, did: DocId) {
        self.doclens.insert(did, None);
    }

    /// Stages a `(term, docid)` position list.
    pub fn set_positions(&mut self, term: &[u8], did: DocId, positions: Vec<TermCount>) {
        self.positions.insert((term.to_vec(), did), Some(positions));
    }

    /// Stages removal of a `(term, docid)` position list.
    pub fn remove_positions(&mut self, term: &[u8], did: DocId) {
        self.positions.insert((term.to_vec(), did), None);
    }

    /// Stages a document's value in a slot.
    pub fn set_value(&mut self, slot: ValueSlot, did: DocId, value: Vec<u8>) {
        self.values.entry(slot).or_default().insert(did, Some(value));
    }

    /// Stages removal of a document's value in a slot.
    pub fn remove_value(&mut self, slot: ValueSlot, did: DocId) {
        self.values.entry(slot).or_default().insert(did, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn posting_deltas_accumulate() {
        let mut inverter = Inverter::new();
        assert!(inverter.is_empty());

        inverter.add_posting(b"fox", 1, 2);
        inverter.add_posting(b"fox", 2, 3);
        inverter.remove_posting(b"fox", 3, 4);

        let changes = inverter.terms.get(&b"fox".to_vec()).unwrap();
        assert_eq!(1, changes.tf_delta);
        assert_eq!(1, changes.cf_delta);
        assert_eq!(Some(&Some(2)), changes.docs.get(&1));
        assert_eq!(Some(&None), changes.docs.get(&3));

        inverter.clear();
        assert!(inverter.is_empty());
    }

    #[test]
    fn replacement_within_one_batch_nets_out() {
        let mut inverter = Inverter::new();

        // A document is removed and re-added with a different wdf before
        // any commit: termfreq is unchanged, wdf takes the latest value.
        inverter.remove_posting(b"fox", 7, 2);
        inverter.add_posting(b"fox", 7, 5);

        let changes = inverter.terms.get(&b"fox".to_vec()).unwrap();
        assert_eq!(0, changes.tf_delta);
        assert_eq!(3, changes.cf_delta);
        assert_eq!(Some(&Some(5)), changes.docs.get(&7));
    }
}
