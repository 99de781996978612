// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Table cursors.
//!
//! A cursor keeps one `(block, directory index)` pair per tree level, with
//! the block buffers shared refcounted slices. It always stands on the
//! first component of an entry; tag reassembly walks ahead on a scratch
//! copy of the path, so reading never disturbs the position.
//!
//! Cursors hold a weak reference to their table: once every table handle
//! is gone they fail with [`Error::Closed`]. A write to the table bumps
//! its cursor version; stale cursors rebuild lazily by re-seeking their
//! current key.

use super::{block, table::TableInner};
use crate::{Error, Result};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

#[derive(Clone)]
struct Level {
    num: u32,
    buf: Rc<[u8]>,
    index: usize,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum State {
    /// Before the first entry.
    Before,
    /// On an entry (the first component of it).
    At,
    /// Past the last entry.
    AfterEnd,
}

/// A key-ordered iterator over one table.
pub struct Cursor {
    table: Weak<RefCell<TableInner>>,
    version: u64,
    path: Vec<Level>,
    state: State,
    current_key: Vec<u8>,
    /// Set when a rebuild landed on the successor of a vanished entry;
    /// the following `next()` then yields that successor.
    skip_next_advance: bool,
}

impl Cursor {
    pub(crate) fn new(table: Weak<RefCell<TableInner>>) -> Self {
        Self {
            table,
            version: 0,
            path: Vec::new(),
            state: State::Before,
            current_key: Vec::new(),
            skip_next_advance: false,
        }
    }

    fn upgrade(&self) -> Result<Rc<RefCell<TableInner>>> {
        self.table.upgrade().ok_or(Error::Closed)
    }

    fn rebuild_if_stale(&mut self) -> Result<()> {
        let rc = self.upgrade()?;
        let stale = rc.borrow().cursor_version() != self.version;
        if !stale {
            return Ok(());
        }
        match self.state {
            State::Before | State::AfterEnd => {
                self.path.clear();
                self.version = rc.borrow().cursor_version();
            }
            State::At => {
                let key = std::mem::take(&mut self.current_key);
                let exact = self.find_entry_ge(&key)?;
                if !exact && self.state == State::At {
                    self.skip_next_advance = true;
                }
            }
        }
        Ok(())
    }

    /// Descends to the insertion point for `(key, component)`. Afterwards
    /// the leaf index may equal its item count.
    fn seek(&mut self, key: &[u8], component: u16) -> Result<()> {
        let rc = self.upgrade()?;
        let inner = rc.borrow();
        self.version = inner.cursor_version();
        self.path.clear();
        self.skip_next_advance = false;

        let mut num = inner.root();
        let mut height = inner.level();
        loop {
            let buf = inner.read_block_shared(num)?;
            if block::level(&buf) != height {
                return Err(Error::Corrupt(format!(
                    "table {}: block level {} where {height} expected",
                    inner.name(),
                    block::level(&buf),
                )));
            }
            if height == 0 {
                let index = match block::search(&buf, key, component) {
                    Ok(index) | Err(index) => index,
                };
                self.path.push(Level { num, buf, index });
                return Ok(());
            }
            if block::item_count(&buf) == 0 {
                return Err(Error::Corrupt(format!(
                    "table {}: empty interior block {num}",
                    inner.name(),
                )));
            }
            let index = block::pick_child(&buf, key, component);
            let child = block::ItemRef::at(&buf, index).child();
            self.path.push(Level { num, buf, index });
            num = child;
            height -= 1;
        }
    }

    /// Moves the leaf position one item forward, crossing leaves.
    fn step_forward(&mut self) -> Result<bool> {
        let rc = self.upgrade()?;
        let inner = rc.borrow();

        match self.path.last_mut() {
            None => return Ok(false),
            Some(leaf) => {
                if leaf.index + 1 < block::item_count(&leaf.buf) {
                    leaf.index += 1;
                    return Ok(true);
                }
            }
        }

        // Find the deepest ancestor with an unvisited next child.
        let mut depth = self.path.len() - 1;
        loop {
            if depth == 0 {
                return Ok(false);
            }
            depth -= 1;
            let level = self.path.get(depth).ok_or(Error::Closed)?;
            if level.index + 1 < block::item_count(&level.buf) {
                break;
            }
        }

        // Advance there, then descend along the leftmost edge.
        self.path.truncate(depth + 1);
        let mut num = {
            let level = self.path.get_mut(depth).ok_or(Error::Closed)?;
            level.index += 1;
            block::ItemRef::at(&level.buf, level.index).child()
        };
        loop {
            let buf = inner.read_block_shared(num)?;
            let is_leaf = block::level(&buf) == 0;
            if !is_leaf && block::item_count(&buf) == 0 {
                return Err(Error::Corrupt(format!(
                    "table {}: empty interior block {num}",
                    inner.name(),
                )));
            }
            let child = if is_leaf {
                None
            } else {
                Some(block::ItemRef::at(&buf, 0).child())
            };
            self.path.push(Level { num, buf, index: 0 });
            match child {
                None => return Ok(true),
                Some(next) => num = next,
            }
        }
    }

    /// Moves the leaf position one item backward, crossing leaves.
    fn step_backward(&mut self) -> Result<bool> {
        let rc = self.upgrade()?;
        let inner = rc.borrow();

        match self.path.last_mut() {
            None => return Ok(false),
            Some(leaf) => {
                if leaf.index > 0 {
                    leaf.index -= 1;
                    return Ok(true);
                }
            }
        }

        let mut depth = self.path.len() - 1;
        loop {
            if depth == 0 {
                return Ok(false);
            }
            depth -= 1;
            let level = self.path.get(depth).ok_or(Error::Closed)?;
            if level.index > 0 {
                break;
            }
        }

        // Step back there, then descend along the rightmost edge.
        self.path.truncate(depth + 1);
        let mut num = {
            let level = self.path.get_mut(depth).ok_or(Error::Closed)?;
            level.index -= 1;
            block::ItemRef::at(&level.buf, level.index).child()
        };
        loop {
            let buf = inner.read_block_shared(num)?;
            let count = block::item_count(&buf);
            if count == 0 {
                return Err(Error::Corrupt(format!(
                    "table {}: empty interior block {num}",
                    inner.name(),
                )));
            }
            let child = if block::level(&buf) == 0 {
                None
            } else {
                Some(block::ItemRef::at(&buf, count - 1).child())
            };
            self.path.push(Level {
                num,
                buf,
                index: count - 1,
            });
            match child {
                None => return Ok(true),
                Some(next) => num = next,
            }
        }
    }

    fn on_item(&self) -> Option<block::ItemRef<'_>> {
        let leaf = self.path.last()?;
        if leaf.index < block::item_count(&leaf.buf) {
            Some(block::ItemRef::at(&leaf.buf, leaf.index))
        } else {
            None
        }
    }

    fn settle_forward_on_entry(&mut self) -> Result<bool> {
        loop {
            match self.on_item() {
                Some(item) if item.first_component() => {
                    self.current_key = item.key().to_vec();
                    self.state = State::At;
                    return Ok(true);
                }
                _ => {
                    if !self.step_forward()? {
                        self.state = State::AfterEnd;
                        self.current_key.clear();
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn settle_backward_on_entry(&mut self) -> Result<bool> {
        loop {
            match self.on_item() {
                Some(item) if item.first_component() => {
                    self.current_key = item.key().to_vec();
                    self.state = State::At;
                    return Ok(true);
                }
                _ => {
                    if !self.step_backward()? {
                        self.state = State::Before;
                        self.current_key.clear();
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Positions at the first entry with key `>=` the given key.
    /// Returns true on an exact match.
    ///
    /// # Errors
    ///
    /// Fails on I/O, corruption, or a closed table.
    pub fn find_entry_ge(&mut self, key: &[u8]) -> Result<bool> {
        self.seek(key, u16::MIN)?;
        if !self.settle_forward_on_entry()? {
            return Ok(false);
        }
        Ok(self.current_key == key)
    }

    /// Positions at the last entry with key `<=` the given key, or before
    /// the first entry when every key is greater. Returns true on an
    /// exact match.
    ///
    /// # Errors
    ///
    /// As [`Self::find_entry_ge`].
    pub fn find_entry_le(&mut self, key: &[u8]) -> Result<bool> {
        self.seek(key, u16::MAX)?;
        // The insertion point is just past every component of `key`; the
        // wanted entry starts at the previous first component.
        if !self.step_backward()? {
            self.state = State::Before;
            self.current_key.clear();
            return Ok(false);
        }
        if !self.settle_backward_on_entry()? {
            return Ok(false);
        }
        Ok(self.current_key == key)
    }

    /// Positions at the entry with exactly this key.
    ///
    /// # Errors
    ///
    /// As [`Self::find_entry_ge`].
    pub fn find_exact(&mut self, key: &[u8]) -> Result<bool> {
        self.find_entry_ge(key)
    }

    /// Moves to the next entry; from the initial position, to the first.
    ///
    /// # Errors
    ///
    /// As [`Self::find_entry_ge`].
    pub fn next(&mut self) -> Result<bool> {
        self.rebuild_if_stale()?;
        if self.skip_next_advance {
            self.skip_next_advance = false;
            return Ok(self.state == State::At);
        }
        match self.state {
            State::AfterEnd => Ok(false),
            State::Before => {
                self.seek(&[], u16::MIN)?;
                Ok(self.settle_forward_on_entry()?)
            }
            State::At => {
                if !self.step_forward()? {
                    self.state = State::AfterEnd;
                    self.current_key.clear();
                    return Ok(false);
                }
                self.settle_forward_on_entry()
            }
        }
    }

    /// Moves to the previous entry.
    ///
    /// # Errors
    ///
    /// As [`Self::find_entry_ge`].
    pub fn prev(&mut self) -> Result<bool> {
        self.rebuild_if_stale()?;
        self.skip_next_advance = false;
        match self.state {
            State::Before => Ok(false),
            State::AfterEnd => {
                // Position past everything, then settle backwards.
                self.seek(&[0xff; block::MAX_KEY_LEN], u16::MAX)?;
                if self.on_item().is_none() && !self.step_backward()? {
                    self.state = State::Before;
                    return Ok(false);
                }
                self.settle_backward_on_entry()
            }
            State::At => {
                if !self.step_backward()? {
                    self.state = State::Before;
                    self.current_key.clear();
                    return Ok(false);
                }
                self.settle_backward_on_entry()
            }
        }
    }

    /// The key of the current entry.
    #[must_use]
    pub fn current_key(&self) -> Option<&[u8]> {
        if self.state == State::At {
            Some(&self.current_key)
        } else {
            None
        }
    }

    /// Reads the current entry's tag in stored form plus its compressed
    /// flag, reassembling components.
    ///
    /// # Errors
    ///
    /// Fails when unpositioned, or on I/O and corruption.
    pub fn read_tag_raw(&mut self) -> Result<(Vec<u8>, bool)> {
        self.rebuild_if_stale()?;
        if self.state != State::At {
            return Err(Error::InvalidOperation("read_tag on unpositioned cursor"));
        }

        let (mut tag, compressed, mut last) = {
            let item = self
                .on_item()
                .ok_or(Error::InvalidOperation("read_tag on unpositioned cursor"))?;
            (item.value().to_vec(), item.compressed(), item.last_component())
        };

        // Walk over continuation components on a scratch path.
        let saved_path = self.path.clone();
        let result = (|| {
            while !last {
                if !self.step_forward()? {
                    return Err(Error::Corrupt("tag component chain truncated".into()));
                }
                let Some(item) = self.on_item() else {
                    return Err(Error::Corrupt("tag component chain truncated".into()));
                };
                if item.first_component() || item.key() != self.current_key.as_slice() {
                    return Err(Error::Corrupt("tag component chain broken".into()));
                }
                tag.extend_from_slice(item.value());
                last = item.last_component();
            }
            Ok(())
        })();
        self.path = saved_path;
        result?;

        Ok((tag, compressed))
    }

    /// Reads the current entry's tag, decompressing transparently.
    ///
    /// # Errors
    ///
    /// As [`Self::read_tag_raw`].
    pub fn read_tag(&mut self) -> Result<Vec<u8>> {
        let (tag, compressed) = self.read_tag_raw()?;
        if compressed {
            miniz_oxide::inflate::decompress_to_vec(&tag).map_err(|_| Error::Decompress)
        } else {
            Ok(tag)
        }
    }
}
