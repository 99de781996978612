// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The spelling table: data for "did you mean" suggestions.
//!
//! Two key spaces share the table. `W` + word holds the word's frequency.
//! Fragment keys hold the sorted set of words containing that fragment:
//! `H` + first two bytes, `T` + last two bytes, `B` + first and last byte
//! (for words of up to four bytes), and `M` + every interior three-byte
//! window. A suggester unions the candidate sets of a misspelling's
//! fragments and ranks them by frequency and edit distance.
//!
//! Word sets are prefix-compressed; all length bytes are XORed with 0x60
//! so they tend to land on lower-case letter values, which helps the
//! table's deflate step.
//!
//! Frequency changes buffer in memory; `flush` folds them into the table
//! and reports the largest frequency written so the caller can maintain
//! the global upper bound.

use crate::{
    btree::table::Table,
    coding::pack::{pack_uint, unpack_uint32},
    version::RootInfo,
    Error, Result, Revision, TermCount,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Compression threshold for spelling tags.
const COMPRESS_MIN: u32 = 100;

const LEN_XOR: u8 = 0x60;

/// Longest spellable word: the key byte limit minus the `W` prefix.
pub const MAX_WORD_LEN: usize = 254;

/// Key of a word's frequency entry.
#[must_use]
pub fn wordfreq_key(word: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(word.len() + 1);
    key.push(b'W');
    key.extend_from_slice(word);
    key
}

/// The fragment keys a word is indexed under. Words shorter than two
/// bytes are not indexed.
#[must_use]
pub fn fragment_keys(word: &[u8]) -> Vec<Vec<u8>> {
    let n = word.len();
    if n < 2 {
        return Vec::new();
    }
    let mut keys = Vec::new();

    let mut head = vec![b'H'];
    head.extend_from_slice(word.get(..2).unwrap_or_default());
    keys.push(head);

    let mut tail = vec![b'T'];
    tail.extend_from_slice(word.get(n - 2..).unwrap_or_default());
    keys.push(tail);

    if n <= 4 {
        // Short words also get a bookend fragment so a single interior
        // typo still finds them.
        let mut bookend = vec![b'B'];
        bookend.push(word.first().copied().unwrap_or_default());
        bookend.push(word.last().copied().unwrap_or_default());
        keys.push(bookend);
    }
    if n > 2 {
        for start in 0..=n - 3 {
            let mut middle = vec![b'M'];
            middle.extend_from_slice(word.get(start..start + 3).unwrap_or_default());
            keys.push(middle);
        }
    }
    keys.sort();
    keys.dedup();
    keys
}

pub(crate) fn encode_wordlist(words: &BTreeSet<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev: &[u8] = &[];
    for (index, word) in words.iter().enumerate() {
        if index == 0 {
            out.push((word.len() as u8) ^ LEN_XOR);
            out.extend_from_slice(word);
        } else {
            let reuse = prev
                .iter()
                .zip(word.iter())
                .take_while(|(a, b)| a == b)
                .count()
                .min(254);
            let add = word.len() - reuse;
            out.push((reuse as u8) ^ LEN_XOR);
            out.push((add as u8) ^ LEN_XOR);
            out.extend_from_slice(word.get(reuse..).unwrap_or_default());
        }
        prev = word;
    }
    out
}

pub(crate) fn decode_wordlist(tag: &[u8]) -> Result<BTreeSet<Vec<u8>>> {
    let mut words = BTreeSet::new();
    let mut input = tag;
    let mut current: Vec<u8> = Vec::new();

    while let Some((&first, rest)) = input.split_first() {
        if current.is_empty() && words.is_empty() {
            let len = usize::from(first ^ LEN_XOR);
            if rest.len() < len {
                return Err(Error::Corrupt("spelling word list truncated".into()));
            }
            current = rest.get(..len).unwrap_or_default().to_vec();
            input = rest.get(len..).unwrap_or_default();
        } else {
            let reuse = usize::from(first ^ LEN_XOR);
            let Some((&add, rest)) = rest.split_first() else {
                return Err(Error::Corrupt("spelling word list truncated".into()));
            };
            let add = usize::from(add ^ LEN_XOR);
            if reuse > current.len() || rest.len() < add {
                return Err(Error::Corrupt("spelling word list truncated".into()));
            }
            current.truncate(reuse);
            current.extend_from_slice(rest.get(..add).unwrap_or_default());
            input = rest.get(add..).unwrap_or_default();
        }
        if !words.insert(current.clone()) {
            return Err(Error::Corrupt("spelling word list order broken".into()));
        }
    }
    Ok(words)
}

/// The spelling table of one database.
pub struct SpellingTable {
    table: Table,
    wordfreq_changes: BTreeMap<Vec<u8>, i64>,
}

impl SpellingTable {
    /// Creates a fresh spelling table.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn create(dir: &Path, block_size: u32) -> Result<Self> {
        let table = Table::create_and_open(
            &dir.join(crate::version::TableId::Spelling.filename()),
            "spelling",
            block_size,
            COMPRESS_MIN,
        )?;
        Ok(Self {
            table,
            wordfreq_changes: BTreeMap::new(),
        })
    }

    /// Opens the spelling table at a revision.
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
            &dir.join(crate::version::TableId::Spelling.filename()),
            "spelling",
            root_info,
            revision,
            writable,
        )?;
        Ok(Self {
            table,
            wordfreq_changes: BTreeMap::new(),
        })
    }

    /// The underlying table.
    #[must_use]
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Buffers a frequency increase for `word`.
    ///
    /// # Errors
    ///
    /// Fails on an over-long word.
    pub fn add_word(&mut self, word: &[u8], freqinc: TermCount) -> Result<()> {
        if word.len() > MAX_WORD_LEN {
            return Err(Error::InvalidArgument("word too long for spelling".into()));
        }
        if word.len() < 2 {
            return Ok(());
        }
        *self.wordfreq_changes.entry(word.to_vec()).or_default() += i64::from(freqinc);
        Ok(())
    }

    /// Buffers a frequency decrease for `word`.
    ///
    /// # Errors
    ///
    /// Fails on an over-long word.
    pub fn remove_word(&mut self, word: &[u8], freqdec: TermCount) -> Result<()> {
        if word.len() > MAX_WORD_LEN {
            return Err(Error::InvalidArgument("word too long for spelling".into()));
        }
        if word.len() < 2 {
            return Ok(());
        }
        *self.wordfreq_changes.entry(word.to_vec()).or_default() -= i64::from(freqdec);
        Ok(())
    }

    /// The word's frequency, committed plus pending.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt data.
    pub fn word_frequency(&self, word: &[u8]) -> Result<TermCount> {
        let stored = self.stored_frequency(word)?;
        let pending = self.wordfreq_changes.get(word).copied().unwrap_or(0);
        Ok(TermCount::try_from((i64::from(stored) + pending).max(0)).unwrap_or(TermCount::MAX))
    }

    fn stored_frequency(&self, word: &[u8]) -> Result<TermCount> {
        match self.table.get_exact_entry(&wordfreq_key(word))? {
            None => Ok(0),
            Some(tag) => {
                let mut input = &tag[..];
                Ok(unpack_uint32(&mut input)?)
            }
        }
    }

    /// The committed candidate words for one fragment key.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt data.
    pub fn fragment_words(&self, fragment: &[u8]) -> Result<Vec<Vec<u8>>> {
        match self.table.get_exact_entry(fragment)? {
            None => Ok(Vec::new()),
            Some(tag) => Ok(decode_wordlist(&tag)?.into_iter().collect()),
        }
    }

    /// The union of candidate words over all of `word`'s fragments.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt data.
    pub fn candidates(&self, word: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut out = BTreeSet::new();
        for key in fragment_keys(word) {
            out.extend(self.fragment_words(&key)?);
        }
        Ok(out.into_iter().collect())
    }

    /// Whether changes are pending.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.wordfreq_changes.values().any(|delta| *delta != 0)
    }

    /// Drops the buffered frequency changes.
    pub fn discard(&mut self) {
        self.wordfreq_changes.clear();
    }

    /// Folds the buffered changes into the table. Returns the largest
    /// frequency written, for the global upper-bound statistic.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt data.
    pub fn flush(&mut self) -> Result<TermCount> {
        let changes = std::mem::take(&mut self.wordfreq_changes);
        let mut max_written: TermCount = 0;

        for (word, delta) in changes {
            if delta == 0 {
                continue;
            }
            let old = self.stored_frequency(&word)?;
            let new = TermCount::try_from((i64::from(old) + delta).max(0))
                .unwrap_or(TermCount::MAX);
            if new == old {
                continue;
            }

            if old == 0 && new > 0 {
                self.toggle_fragments(&word, true)?;
            } else if new == 0 {
                self.toggle_fragments(&word, false)?;
            }

            let key = wordfreq_key(&word);
            if new == 0 {
                self.table.del(&key)?;
            } else {
                let mut tag = Vec::new();
                pack_uint(&mut tag, u64::from(new));
                self.table.add(&key, &tag)?;
                max_written = max_written.max(new);
            }
        }
        Ok(max_written)
    }

    fn toggle_fragments(&self, word: &[u8], present: bool) -> Result<()> {
        for key in fragment_keys(word) {
            let mut words = match self.table.get_exact_entry(&key)? {
                None => BTreeSet::new(),
                Some(tag) => decode_wordlist(&tag)?,
            };
            let changed = if present {
                words.insert(word.to_vec())
            } else {
                words.remove(word)
            };
            if !changed {
                continue;
            }
            if words.is_empty() {
                self.table.del(&key)?;
            } else {
                self.table.add(&key, &encode_wordlist(&words))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn wordlist_roundtrip() {
        let words: BTreeSet<Vec<u8>> = ["hello", "help", "helm", "shell"]
            .iter()
            .map(|w| w.as_bytes().to_vec())
            .collect();
        let tag = encode_wordlist(&words);
        assert_eq!(words, decode_wordlist(&tag).unwrap());
    }

    #[test]
    fn fragment_keys_cover_head_tail_middles() {
        let keys = fragment_keys(b"fragment");
        assert!(keys.contains(&b"Hfr".to_vec()));
        assert!(keys.contains(&b"Tnt".to_vec()));
        assert!(keys.contains(&b"Mfra".to_vec()));
        assert!(keys.contains(&b"Mgme".to_vec()));
        // Long words get no bookend fragment.
        assert!(!keys.iter().any(|k| k.first() == Some(&b'B')));

        let short = fragment_keys(b"cat");
        assert!(short.contains(&b"Bct".to_vec()));

        assert!(fragment_keys(b"a").is_empty());
    }

    #[test]
    fn add_flush_lookup_remove() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut table = SpellingTable::create(dir.path(), 2048)?;

        table.add_word(b"hello", 2)?;
        table.add_word(b"help", 1)?;
        // Pending changes are visible through the frequency accessor.
        assert_eq!(2, table.word_frequency(b"hello")?);
        assert!(table.is_modified());

        let max = table.flush()?;
        assert_eq!(2, max);
        assert!(!table.is_modified());
        assert_eq!(2, table.word_frequency(b"hello")?);

        // Both words share the 'He' head fragment.
        let heads = table.fragment_words(b"Hhe")?;
        assert_eq!(vec![b"hello".to_vec(), b"help".to_vec()], heads);

        let candidates = table.candidates(b"helo")?;
        assert!(candidates.contains(&b"hello".to_vec()));
        assert!(candidates.contains(&b"help".to_vec()));

        // Removing the last reference drops the word from its fragments.
        table.remove_word(b"help", 1)?;
        table.flush()?;
        assert_eq!(0, table.word_frequency(b"help")?);
        assert_eq!(vec![b"hello".to_vec()], table.fragment_words(b"Hhe")?);
        Ok(())
    }

    #[test]
    fn frequencies_accumulate_across_flushes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut table = SpellingTable::create(dir.path(), 2048)?;

        table.add_word(b"word", 1)?;
        table.flush()?;
        table.add_word(b"word", 3)?;
        let max = table.flush()?;
        assert_eq!(4, max);
        assert_eq!(4, table.word_frequency(b"word")?);
        Ok(())
    }
}
