// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The table: a copy-on-write B-tree of `(key, tag)` entries.
//!
//! Writes go through [`Table::add`] and [`Table::del`] and only touch
//! freshly allocated blocks; [`Table::flush_db`] writes the dirty blocks,
//! [`Table::commit`] stamps the new revision and yields the root info the
//! version file records. Until the version file is replaced, the previous
//! revision remains fully intact on disk.

use super::{
    block::{self, FIRST_COMPONENT, FORMAT_MAX_ITEM_SIZE, HEADER_SIZE, MAX_KEY_LEN},
    freelist::FreeList,
};
use crate::{version::RootInfo, Error, Result, Revision};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Compression threshold meaning "never compress".
pub const DONT_COMPRESS: u32 = 0;

/// In-order insertions needed before the table flips to sequential mode.
const SEQ_THRESHOLD: i32 = 5;
/// Penalty applied by an out-of-order insertion.
const SEQ_RESET: i32 = -5;

/// Raw block file of one table.
pub struct TableFile {
    file: File,
    block_size: u32,
}

impl TableFile {
    fn create(path: &Path, block_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::Opening(format!("cannot create {}: {e}", path.display())))?;
        Ok(Self { file, block_size })
    }

    fn open(path: &Path, block_size: u32, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| Error::Opening(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self { file, block_size })
    }

    /// The fixed block size of this file.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Reads block `n` into `buf`.
    ///
    /// # Errors
    ///
    /// A read past the end of the file is corruption (the block was
    /// supposed to exist), not a plain I/O error.
    pub fn read_block(&self, n: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size as usize);
        let offset = u64::from(n) * u64::from(self.block_size);
        crate::io::read_exact_at(&self.file, buf, offset).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Corrupt(format!("block {n} lies past the end of the table file"))
            } else {
                Error::Io(e)
            }
        })
    }

    /// Writes block `n`.
    pub fn write_block(&self, n: u32, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size as usize);
        let offset = u64::from(n) * u64::from(self.block_size);
        crate::io::write_all_at(&self.file, buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

struct SplitInfo {
    right: u32,
    bound_key: Vec<u8>,
    bound_comp: u16,
}

pub(crate) struct TableInner {
    path: PathBuf,
    name: &'static str,
    writable: bool,
    block_size: u32,
    max_item_size: usize,
    compress_min: u32,
    io: TableFile,

    revision: Revision,
    root: u32,
    level: u8,
    num_entries: u64,
    faked_root: bool,
    sequential: bool,

    free_list: FreeList,
    dirty: HashMap<u32, Vec<u8>>,
    modified: bool,
    flushed: bool,
    seq_count: i32,
    last_added_key: Vec<u8>,
    cursor_version: u64,
}

fn max_item_size_for(block_size: u32) -> usize {
    // Four maximal items (plus their directory entries) must fit in one
    // block, so a split always has a home for every item.
    let per_item = (block_size as usize - HEADER_SIZE) / 4 - 2;
    per_item.min(FORMAT_MAX_ITEM_SIZE)
}

impl TableInner {
    // ---- reads -----------------------------------------------------------

    /// Reads a block into a refcounted buffer cursors can hold onto
    /// cheaply.
    pub(crate) fn read_block_shared(&self, n: u32) -> Result<Rc<[u8]>> {
        if let Some(buf) = self.dirty.get(&n) {
            return Ok(Rc::from(buf.as_slice()));
        }
        let mut buf = vec![0u8; self.block_size as usize];
        self.io.read_block(n, &mut buf)?;
        block::validate(&buf).map_err(|e| {
            Error::Corrupt(format!("table {}: block {n}: {e}", self.name))
        })?;
        Ok(Rc::from(buf))
    }

    pub(crate) fn root(&self) -> u32 {
        self.root
    }

    pub(crate) fn level(&self) -> u8 {
        self.level
    }

    pub(crate) fn cursor_version(&self) -> u64 {
        self.cursor_version
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Descends to the leaf that would hold `(key, component)`.
    fn find_leaf(
        &self,
        key: &[u8],
        component: u16,
    ) -> Result<(Rc<[u8]>, std::result::Result<usize, usize>)> {
        let mut buf = self.read_block_shared(self.root)?;
        let mut height = self.level;
        while height > 0 {
            let child_index = block::pick_child(&buf, key, component);
            let child = block::ItemRef::at(&buf, child_index).child();
            buf = self.read_block_shared(child)?;
            if block::level(&buf) != height - 1 {
                return Err(Error::Corrupt(format!(
                    "table {}: block level {} where {} expected",
                    self.name,
                    block::level(&buf),
                    height - 1,
                )));
            }
            height -= 1;
        }
        let found = block::search(&buf, key, component);
        Ok((buf, found))
    }

    fn get_component(&self, key: &[u8], component: u16) -> Result<Option<(Vec<u8>, bool, bool)>> {
        if self.num_entries == 0 {
            return Ok(None);
        }
        let (buf, found) = self.find_leaf(key, component)?;
        let Ok(index) = found else {
            return Ok(None);
        };
        let item = block::ItemRef::at(&buf, index);
        Ok(Some((
            item.value().to_vec(),
            item.compressed(),
            item.last_component(),
        )))
    }

    fn get_raw_tag(&self, key: &[u8]) -> Result<Option<(Vec<u8>, bool)>> {
        let Some((mut tag, compressed, mut last)) = self.get_component(key, FIRST_COMPONENT)?
        else {
            return Ok(None);
        };
        let mut component = FIRST_COMPONENT;
        while !last {
            component += 1;
            let Some((value, _, component_last)) = self.get_component(key, component)? else {
                return Err(Error::Corrupt(format!(
                    "table {}: tag component {component} missing",
                    self.name,
                )));
            };
            tag.extend_from_slice(&value);
            last = component_last;
        }
        Ok(Some((tag, compressed)))
    }

    fn key_exists(&self, key: &[u8]) -> Result<bool> {
        if key.is_empty() || self.num_entries == 0 {
            return Ok(false);
        }
        Ok(self.get_component(key, FIRST_COMPONENT)?.is_some())
    }

    // ---- copy-on-write plumbing ------------------------------------------

    fn begin_change(&mut self) {
        if !self.modified {
            self.free_list.set_revision(self.revision + 1);
            self.modified = true;
        }
        self.flushed = false;
        self.cursor_version += 1;
    }

    /// Gives `num` a this-transaction block number, queuing the old one
    /// for release after the next commit. Returns the writable number.
    fn make_writable(&mut self, num: u32) -> Result<u32> {
        if self.dirty.contains_key(&num) {
            return Ok(num);
        }
        let mut buf = vec![0u8; self.block_size as usize];
        if self.faked_root && num == self.root {
            block::init(&mut buf, 0);
        } else {
            self.io.read_block(num, &mut buf)?;
            block::validate(&buf)
                .map_err(|e| Error::Corrupt(format!("table {}: block {num}: {e}", self.name)))?;
        }
        let fresh = self.free_list.get_block(&self.io)?;
        // Block 0 is the fixed initial root; it never re-enters circulation.
        if num != 0 {
            self.free_list.mark_block_unused(&self.io, num)?;
        }
        self.dirty.insert(fresh, buf);
        Ok(fresh)
    }

    fn allocate_block(&mut self, level: u8) -> Result<u32> {
        let fresh = self.free_list.get_block(&self.io)?;
        let mut buf = vec![0u8; self.block_size as usize];
        block::init(&mut buf, level);
        self.dirty.insert(fresh, buf);
        Ok(fresh)
    }

    fn dirty_block(&mut self, num: u32) -> &mut Vec<u8> {
        debug_assert!(self.dirty.contains_key(&num));
        self.dirty.entry(num).or_default()
    }

    /// Splits the writable block `num`, moving its upper items into a new
    /// block. Returns the new block and the left half's new bound.
    fn split_block(&mut self, num: u32, insert_index: usize) -> Result<(SplitInfo, usize)> {
        let level = {
            let buf = self.dirty_block(num);
            block::level(buf)
        };
        let right_num = self.allocate_block(level)?;

        let seq_count = self.seq_count;
        let (moved, split_at) = {
            let buf = self.dirty_block(num);
            let count = block::item_count(buf);
            debug_assert!(count >= 2);

            let split_at = if level == 0 && seq_count >= SEQ_THRESHOLD && insert_index == count
            {
                // Ascending bulk load: keep the left block full and start
                // a fresh one for the new item.
                count
            } else {
                // Split at the byte midpoint, not the item midpoint.
                let target = block::used_bytes(buf) / 2;
                let mut acc = 0usize;
                let mut at = count - 1;
                for index in 0..count {
                    acc += block::ItemRef::at(buf, index).size() + 2;
                    if acc > target {
                        at = index + 1;
                        break;
                    }
                }
                at.clamp(1, count - 1)
            };

            let mut moved = Vec::with_capacity(count - split_at);
            for index in split_at..count {
                let item = block::ItemRef::at(buf, index);
                let offset = block::item_offset(buf, index);
                moved.push(buf.get(offset..offset + item.size()).unwrap_or_default().to_vec());
            }
            for index in (split_at..count).rev() {
                block::delete_item(buf, index);
            }
            (moved, split_at)
        };

        {
            let right = self.dirty_block(right_num);
            for (index, item) in moved.iter().enumerate() {
                let ok = block::insert_item(right, index, item);
                debug_assert!(ok);
            }
        }

        let (bound_key, bound_comp) = {
            let buf = self.dirty_block(num);
            let last = block::ItemRef::at(buf, block::item_count(buf) - 1);
            (last.key().to_vec(), last.component())
        };

        Ok((
            SplitInfo {
                right: right_num,
                bound_key,
                bound_comp,
            },
            split_at,
        ))
    }

    /// Inserts an encoded item into the writable block `num`, splitting if
    /// necessary. The item's `(key, component)` must not already exist.
    fn insert_into_block(
        &mut self,
        num: u32,
        item_bytes: &[u8],
        key: &[u8],
        component: u16,
    ) -> Result<Option<SplitInfo>> {
        let index = {
            let buf = self.dirty_block(num);
            match block::search(buf, key, component) {
                Ok(_) => {
                    return Err(Error::Corrupt(format!(
                        "table {}: duplicate item during insert",
                        self.name,
                    )))
                }
                Err(index) => index,
            }
        };

        let fits = {
            let buf = self.dirty_block(num);
            block::insert_item(buf, index, item_bytes)
        };
        if fits {
            return Ok(None);
        }

        let (split, _) = self.split_block(num, index)?;
        let goes_left = {
            let bound = (split.bound_key.as_slice(), split.bound_comp);
            (key, component) < bound
        };
        let target = if goes_left { num } else { split.right };
        // Recompute the position in the chosen half.
        let ok = {
            let buf = self.dirty_block(target);
            let at = match block::search(buf, key, component) {
                Err(at) => at,
                Ok(_) => {
                    return Err(Error::Corrupt(format!(
                        "table {}: duplicate item after split",
                        self.name,
                    )))
                }
            };
            block::insert_item(buf, at, item_bytes)
        };
        if !ok {
            return Err(Error::Corrupt(format!(
                "table {}: item does not fit a freshly split block",
                self.name,
            )));
        }
        Ok(Some(split))
    }

    /// Recursive copy-on-write insert. Returns the subtree's (possibly
    /// new) block number and split info when the subtree root split.
    fn insert_rec(
        &mut self,
        num: u32,
        height: u8,
        key: &[u8],
        component: u16,
        item_bytes: &[u8],
    ) -> Result<(u32, Option<SplitInfo>)> {
        let num = self.make_writable(num)?;

        if height == 0 {
            let split = self.insert_into_block(num, item_bytes, key, component)?;
            return Ok((num, split));
        }

        let (child_index, child_num) = {
            let buf = self.dirty_block(num);
            let index = block::pick_child(buf, key, component);
            (index, block::ItemRef::at(buf, index).child())
        };

        let (new_child, child_split) =
            self.insert_rec(child_num, height - 1, key, component, item_bytes)?;

        if new_child != child_num {
            let buf = self.dirty_block(num);
            block::set_branch_child(buf, child_index, new_child);
        }

        let Some(child_split) = child_split else {
            return Ok((num, None));
        };

        // The child split: retighten its bound and insert the new sibling
        // under the old bound.
        let (old_bound_key, old_bound_comp) = {
            let buf = self.dirty_block(num);
            let item = block::ItemRef::at(buf, child_index);
            (item.key().to_vec(), item.component())
        };
        {
            let buf = self.dirty_block(num);
            block::delete_item(buf, child_index);
        }

        let left_item = block::encode_branch_item(
            new_child,
            &child_split.bound_key,
            child_split.bound_comp,
        );
        let my_split = self.insert_into_block(
            num,
            &left_item,
            &child_split.bound_key,
            child_split.bound_comp,
        )?;

        // The right sibling keeps the old bound; pick whichever half of
        // (a possibly split) this block now owns that key range.
        let target = match &my_split {
            None => num,
            Some(split) => {
                let goes_left = {
                    let buf = self.dirty_block(num);
                    let count = block::item_count(buf);
                    count > 0
                        && block::ItemRef::at(buf, count - 1)
                            .cmp_key(&old_bound_key, old_bound_comp)
                            .is_ge()
                };
                if goes_left {
                    num
                } else {
                    split.right
                }
            }
        };
        let right_item =
            block::encode_branch_item(child_split.right, &old_bound_key, old_bound_comp);
        let overflow =
            self.insert_into_block(target, &right_item, &old_bound_key, old_bound_comp)?;
        if overflow.is_some() {
            return Err(Error::Corrupt(format!(
                "table {}: branch overflow cascade",
                self.name,
            )));
        }

        Ok((num, my_split))
    }

    /// Inserts one already-encoded leaf item, growing the tree as needed.
    fn insert_item(&mut self, key: &[u8], component: u16, item_bytes: &[u8]) -> Result<()> {
        let root = self.root;
        let level = self.level;
        let (new_root, split) = self.insert_rec(root, level, key, component, item_bytes)?;
        self.root = new_root;
        self.faked_root = false;

        if let Some(split) = split {
            // Grow a new root with the two halves.
            let (left_bound_key, left_bound_comp) = {
                let buf = self.dirty_block(new_root);
                let last = block::ItemRef::at(buf, block::item_count(buf) - 1);
                (last.key().to_vec(), last.component())
            };
            let (right_bound_key, right_bound_comp) = {
                let buf = self.dirty_block(split.right);
                let last = block::ItemRef::at(buf, block::item_count(buf) - 1);
                (last.key().to_vec(), last.component())
            };

            let new_level = self.level + 1;
            let root_num = self.allocate_block(new_level)?;
            {
                let buf = self.dirty_block(root_num);
                let left_item =
                    block::encode_branch_item(new_root, &left_bound_key, left_bound_comp);
                let right_item =
                    block::encode_branch_item(split.right, &right_bound_key, right_bound_comp);
                let ok = block::insert_item(buf, 0, &left_item)
                    && block::insert_item(buf, 1, &right_item);
                debug_assert!(ok);
            }
            self.root = root_num;
            self.level = new_level;
        }
        Ok(())
    }

    /// Recursive copy-on-write delete of one `(key, component)` item.
    /// Returns (new subtree root, found, was-last-component, now-empty).
    fn delete_rec(
        &mut self,
        num: u32,
        height: u8,
        key: &[u8],
        component: u16,
    ) -> Result<(u32, bool, bool, bool)> {
        if height == 0 {
            let (found_at, was_last) = {
                // Peek before going writable: a miss must not COW the path.
                let buf = self.read_block_shared(num)?;
                match block::search(&buf, key, component) {
                    Ok(index) => (Some(index), block::ItemRef::at(&buf, index).last_component()),
                    Err(_) => (None, false),
                }
            };
            let Some(index) = found_at else {
                return Ok((num, false, false, false));
            };
            let num = self.make_writable(num)?;
            let empty = {
                let buf = self.dirty_block(num);
                block::delete_item(buf, index);
                block::item_count(buf) == 0
            };
            return Ok((num, true, was_last, empty));
        }

        let (child_index, child_num) = {
            let buf = self.read_block_shared(num)?;
            let index = block::pick_child(&buf, key, component);
            (index, block::ItemRef::at(&buf, index).child())
        };

        let (new_child, found, was_last, child_empty) =
            self.delete_rec(child_num, height - 1, key, component)?;

        if !found {
            return Ok((num, false, false, false));
        }

        let num = self.make_writable(num)?;
        let empty = if child_empty {
            // Drop the empty child entirely.
            self.dirty.remove(&new_child);
            self.free_list.mark_block_unused(&self.io, new_child)?;
            let buf = self.dirty_block(num);
            block::delete_item(buf, child_index);
            block::item_count(buf) == 0
        } else {
            let buf = self.dirty_block(num);
            block::set_branch_child(buf, child_index, new_child);
            false
        };

        Ok((num, true, was_last, empty))
    }

    fn delete_entry(&mut self, key: &[u8]) -> Result<bool> {
        let mut component = FIRST_COMPONENT;
        loop {
            let root = self.root;
            let level = self.level;
            // An empty leaf root is fine (the table is just empty), but a
            // single-child branch root collapses.
            let (new_root, found, was_last, _root_empty) =
                self.delete_rec(root, level, key, component)?;
            if !found {
                return Ok(component != FIRST_COMPONENT);
            }
            self.root = new_root;
            self.collapse_root()?;

            if was_last {
                return Ok(true);
            }
            component += 1;
        }
    }

    /// While the root is a branch with a single child, the child becomes
    /// the root.
    fn collapse_root(&mut self) -> Result<()> {
        while self.level > 0 {
            let (count, only_child) = {
                let buf = self.read_block_shared(self.root)?;
                let count = block::item_count(&buf);
                let child = if count == 1 {
                    Some(block::ItemRef::at(&buf, 0).child())
                } else {
                    None
                };
                (count, child)
            };
            if count == 0 {
                return Err(Error::Corrupt(format!(
                    "table {}: empty branch block",
                    self.name,
                )));
            }
            let Some(child) = only_child else { break };
            let old_root = self.root;
            self.dirty.remove(&old_root);
            if old_root != 0 {
                self.free_list.mark_block_unused(&self.io, old_root)?;
            }
            self.root = child;
            self.level -= 1;
        }
        Ok(())
    }

    // ---- public-facing operations ----------------------------------------

    fn add(&mut self, key: &[u8], tag: &[u8], already_compressed: bool) -> Result<()> {
        if !self.writable {
            return Err(Error::InvalidOperation("add on a read-only table"));
        }
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".into()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidArgument(format!(
                "key of {} bytes exceeds the {MAX_KEY_LEN}-byte limit",
                key.len(),
            )));
        }

        self.begin_change();

        // Sequential-mode bookkeeping.
        if self.last_added_key.is_empty() || self.last_added_key.as_slice() < key {
            self.seq_count = (self.seq_count + 1).min(SEQ_THRESHOLD * 2);
        } else {
            self.seq_count = SEQ_RESET;
        }
        self.last_added_key = key.to_vec();
        self.sequential = self.seq_count >= SEQ_THRESHOLD;

        let mut compressed = already_compressed;
        let deflated;
        let tag: &[u8] = if !already_compressed
            && self.compress_min != DONT_COMPRESS
            && tag.len() >= self.compress_min as usize
        {
            deflated = miniz_oxide::deflate::compress_to_vec(tag, 6);
            if deflated.len() < tag.len() {
                compressed = true;
                &deflated
            } else {
                tag
            }
        } else {
            tag
        };

        // Replace any existing entry wholesale.
        let existed = self.delete_entry(key)?;
        if !existed {
            self.num_entries += 1;
        }

        // Split the tag over as many components as it needs.
        let capacity = self.max_item_size - (2 + 1 + key.len() + 2);
        let n_components = if tag.is_empty() {
            1
        } else {
            tag.len().div_ceil(capacity)
        };
        if n_components > usize::from(u16::MAX - 1) {
            return Err(Error::InvalidArgument("tag too large".into()));
        }

        for piece in 0..n_components {
            let start = piece * capacity;
            let end = (start + capacity).min(tag.len());
            let component = FIRST_COMPONENT + piece as u16;
            let first = piece == 0;
            let last = piece == n_components - 1;
            let value = tag.get(start..end).unwrap_or_default();
            let item = block::encode_leaf_item(
                key,
                component,
                value,
                compressed && first,
                first,
                last,
            );
            self.insert_item(key, component, &item)?;
        }
        Ok(())
    }

    fn del(&mut self, key: &[u8]) -> Result<bool> {
        if !self.writable {
            return Err(Error::InvalidOperation("del on a read-only table"));
        }
        if key.is_empty() || self.num_entries == 0 {
            return Ok(false);
        }
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidArgument(format!(
                "key of {} bytes exceeds the {MAX_KEY_LEN}-byte limit",
                key.len(),
            )));
        }
        if !self.key_exists(key)? {
            return Ok(false);
        }
        self.begin_change();
        let deleted = self.delete_entry(key)?;
        debug_assert!(deleted);
        self.num_entries -= 1;
        Ok(true)
    }

    fn flush_db(&mut self) -> Result<()> {
        if self.flushed || !self.modified {
            self.flushed = true;
            return Ok(());
        }
        let revision = self.revision + 1;
        let mut blocks: Vec<u32> = self.dirty.keys().copied().collect();
        blocks.sort_unstable();
        for num in blocks {
            if let Some(buf) = self.dirty.get_mut(&num) {
                block::set_revision(buf, revision);
                self.io.write_block(num, buf)?;
            }
        }
        self.dirty.clear();
        self.flushed = true;
        log::trace!("table {}: flushed at revision {revision}", self.name);
        Ok(())
    }

    fn commit(&mut self, new_revision: Revision) -> Result<RootInfo> {
        if new_revision != self.revision + 1 {
            return Err(Error::InvalidOperation(
                "commit revision must advance by exactly one",
            ));
        }
        if self.modified && !self.flushed {
            return Err(Error::InvalidOperation("commit before flush"));
        }
        if self.modified {
            self.free_list.commit(&self.io)?;
            self.io.sync()?;
        }
        self.revision = new_revision;
        self.modified = false;
        self.seq_count = if self.sequential { SEQ_THRESHOLD } else { 0 };
        self.last_added_key.clear();
        Ok(self.root_info())
    }

    fn root_info(&self) -> RootInfo {
        RootInfo {
            root: self.root,
            level: self.level,
            num_entries: self.num_entries,
            block_size: self.block_size,
            faked_root: self.faked_root,
            sequential: self.sequential,
            compress_min: self.compress_min,
            free_list: self.free_list.state(),
        }
    }

    fn cancel(&mut self, root_info: &RootInfo, revision: Revision) {
        self.dirty.clear();
        self.root = root_info.root;
        self.level = root_info.level;
        self.num_entries = root_info.num_entries;
        self.faked_root = root_info.faked_root;
        self.sequential = root_info.sequential;
        self.free_list = FreeList::open(root_info.free_list);
        self.free_list.set_revision(revision + 1);
        self.revision = revision;
        self.modified = false;
        self.flushed = false;
        self.seq_count = if self.sequential { SEQ_THRESHOLD } else { 0 };
        self.last_added_key.clear();
        self.cursor_version += 1;
    }
}

/// A single table of a database: a copy-on-write B-tree in one block file.
///
/// Cloning shares the handle; cursors hold weak references and fail with
/// [`Error::Closed`] once every handle is gone.
#[derive(Clone)]
pub struct Table {
    pub(crate) inner: Rc<RefCell<TableInner>>,
}

impl Table {
    /// Creates a fresh table file with an empty root block at revision 0.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be created or written.
    pub fn create_and_open(
        path: &Path,
        name: &'static str,
        block_size: u32,
        compress_min: u32,
    ) -> Result<Self> {
        debug_assert!(block_size.is_power_of_two());
        debug_assert!((2048..=65_536).contains(&block_size));

        let io = TableFile::create(path, block_size)?;
        let mut root_block = vec![0u8; block_size as usize];
        block::init(&mut root_block, 0);
        io.write_block(0, &root_block)?;

        let inner = TableInner {
            path: path.to_path_buf(),
            name,
            writable: true,
            block_size,
            max_item_size: max_item_size_for(block_size),
            compress_min,
            io,
            revision: 0,
            root: 0,
            level: 0,
            num_entries: 0,
            faked_root: true,
            sequential: false,
            free_list: FreeList::new(),
            dirty: HashMap::new(),
            modified: false,
            flushed: false,
            seq_count: 0,
            last_added_key: Vec::new(),
            cursor_version: 0,
        };
        Ok(Self {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Opens an existing table at the given revision.
    ///
    /// # Errors
    ///
    /// Fails with a corruption error when the root block does not belong
    /// to that revision, and an opening error on I/O problems.
    pub fn open(
        path: &Path,
        name: &'static str,
        root_info: &RootInfo,
        revision: Revision,
        writable: bool,
    ) -> Result<Self> {
        let io = TableFile::open(path, root_info.block_size, writable)?;

        if !root_info.faked_root {
            let mut buf = vec![0u8; root_info.block_size as usize];
            io.read_block(root_info.root, &mut buf)?;
            block::validate(&buf)
                .map_err(|e| Error::Corrupt(format!("table {name}: root block: {e}")))?;
            if block::revision(&buf) > revision {
                return Err(Error::Corrupt(format!(
                    "table {name}: root block revision {} is newer than {revision}",
                    block::revision(&buf),
                )));
            }
            if block::level(&buf) != root_info.level {
                return Err(Error::Corrupt(format!(
                    "table {name}: root level {} where {} expected",
                    block::level(&buf),
                    root_info.level,
                )));
            }
        }

        let mut free_list = FreeList::open(root_info.free_list);
        free_list.set_revision(revision + 1);

        let inner = TableInner {
            path: path.to_path_buf(),
            name,
            writable,
            block_size: root_info.block_size,
            max_item_size: max_item_size_for(root_info.block_size),
            compress_min: root_info.compress_min,
            io,
            revision,
            root: root_info.root,
            level: root_info.level,
            num_entries: root_info.num_entries,
            faked_root: root_info.faked_root,
            sequential: root_info.sequential,
            free_list,
            dirty: HashMap::new(),
            modified: false,
            flushed: false,
            seq_count: if root_info.sequential { SEQ_THRESHOLD } else { 0 },
            last_added_key: Vec::new(),
            cursor_version: 0,
        };
        Ok(Self {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Upserts an entry, compressing large tags per the table's threshold.
    ///
    /// # Errors
    ///
    /// Fails on an empty or over-long key, a read-only handle, or I/O.
    pub fn add(&self, key: &[u8], tag: &[u8]) -> Result<()> {
        self.inner.borrow_mut().add(key, tag, false)
    }

    /// Upserts an entry whose tag is already in stored (possibly
    /// compressed) form — the compaction fast path.
    ///
    /// # Errors
    ///
    /// As [`Self::add`].
    pub fn add_raw(&self, key: &[u8], tag: &[u8], already_compressed: bool) -> Result<()> {
        self.inner.borrow_mut().add(key, tag, already_compressed)
    }

    /// Removes an entry. Returns false when the key was absent (or empty).
    ///
    /// # Errors
    ///
    /// Fails on a read-only handle or I/O.
    pub fn del(&self, key: &[u8]) -> Result<bool> {
        self.inner.borrow_mut().del(key)
    }

    /// Fetches a tag, reassembling components and decompressing.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt component chains.
    pub fn get_exact_entry(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Ok(None);
        }
        let inner = self.inner.borrow();
        let Some((tag, compressed)) = inner.get_raw_tag(key)? else {
            return Ok(None);
        };
        if compressed {
            let tag = miniz_oxide::inflate::decompress_to_vec(&tag)
                .map_err(|_| Error::Decompress)?;
            Ok(Some(tag))
        } else {
            Ok(Some(tag))
        }
    }

    /// Fetches a tag without decompressing, plus its compressed flag.
    ///
    /// # Errors
    ///
    /// Fails on I/O or corrupt component chains.
    pub fn get_exact_entry_raw(&self, key: &[u8]) -> Result<Option<(Vec<u8>, bool)>> {
        if key.is_empty() {
            return Ok(None);
        }
        self.inner.borrow().get_raw_tag(key)
    }

    /// Existence check without materializing the tag.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn key_exists(&self, key: &[u8]) -> Result<bool> {
        self.inner.borrow().key_exists(key)
    }

    /// A cursor positioned before the first entry.
    #[must_use]
    pub fn cursor_get(&self) -> crate::btree::cursor::Cursor {
        crate::btree::cursor::Cursor::new(Rc::downgrade(&self.inner))
    }

    /// Writes all dirty blocks and the free-list tail.
    ///
    /// # Errors
    ///
    /// Fails on I/O.
    pub fn flush_db(&self) -> Result<()> {
        self.inner.borrow_mut().flush_db()
    }

    /// Stamps the new revision; must follow [`Self::flush_db`].
    ///
    /// # Errors
    ///
    /// Fails when called out of order or with a non-successor revision.
    pub fn commit(&self, new_revision: Revision) -> Result<RootInfo> {
        self.inner.borrow_mut().commit(new_revision)
    }

    /// Discards in-memory changes and reloads the tree at the given root.
    pub fn cancel(&self, root_info: &RootInfo, revision: Revision) {
        self.inner.borrow_mut().cancel(root_info, revision);
    }

    /// Whether uncommitted changes exist.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.inner.borrow().modified
    }

    /// Whether the table holds no entries.
    #[must_use]
    pub fn empty(&self) -> bool {
        self.inner.borrow().num_entries == 0
    }

    /// Number of entries.
    #[must_use]
    pub fn get_entry_count(&self) -> u64 {
        self.inner.borrow().num_entries
    }

    /// The current root info (matching the last commit only when no
    /// changes are pending).
    #[must_use]
    pub fn root_info(&self) -> RootInfo {
        self.inner.borrow().root_info()
    }

    /// The committed revision this handle is at.
    #[must_use]
    pub fn revision(&self) -> Revision {
        self.inner.borrow().revision
    }

    /// The file path of this table.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.inner.borrow().path.clone()
    }

    /// Lists blocks on the free list (entries plus chain blocks); valid
    /// between commits.
    ///
    /// # Errors
    ///
    /// Fails on I/O or a corrupt chain.
    pub fn free_blocks(&self) -> Result<Vec<u32>> {
        let inner = self.inner.borrow();
        inner.free_list.free_blocks(&inner.io, true)
    }

    /// One past the highest block number in use.
    #[must_use]
    pub fn first_unused_block(&self) -> u32 {
        self.inner.borrow().free_list.first_unused_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn scratch_table(dir: &Path) -> Table {
        Table::create_and_open(&dir.join("test.quartz"), "test", 2048, DONT_COMPRESS).unwrap()
    }

    #[test]
    fn add_get_del_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table = scratch_table(dir.path());

        assert!(table.empty());
        table.add(b"fox", b"quick brown")?;
        table.add(b"zebra", b"stripes")?;

        assert_eq!(2, table.get_entry_count());
        assert_eq!(
            Some(b"quick brown".to_vec()),
            table.get_exact_entry(b"fox")?
        );
        assert!(table.key_exists(b"zebra")?);
        assert!(!table.key_exists(b"missing")?);
        assert_eq!(None, table.get_exact_entry(b"missing")?);

        assert!(table.del(b"fox")?);
        assert!(!table.del(b"fox")?);
        assert!(!table.del(b"")?);
        assert_eq!(1, table.get_entry_count());
        assert_eq!(None, table.get_exact_entry(b"fox")?);

        Ok(())
    }

    #[test]
    fn upsert_replaces() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table = scratch_table(dir.path());

        table.add(b"key", b"first")?;
        table.add(b"key", b"second")?;
        assert_eq!(1, table.get_entry_count());
        assert_eq!(
            Some(b"second".to_vec()),
            table.get_exact_entry(b"key")?
        );
        Ok(())
    }

    #[test]
    fn empty_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table = scratch_table(dir.path());
        assert!(matches!(
            table.add(b"", b"tag"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn over_long_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table = scratch_table(dir.path());
        let key = vec![b'k'; 256];
        assert!(matches!(
            table.add(&key, b"tag"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn many_entries_split_blocks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table = scratch_table(dir.path());

        for i in 0..2000u32 {
            let key = format!("key{i:06}");
            let tag = format!("value for entry number {i}");
            table.add(key.as_bytes(), tag.as_bytes())?;
        }
        assert_eq!(2000, table.get_entry_count());

        // Spot-check across the whole range after the tree has grown.
        for i in (0..2000u32).step_by(97) {
            let key = format!("key{i:06}");
            let expected = format!("value for entry number {i}");
            assert_eq!(
                Some(expected.clone().into_bytes()),
                table.get_exact_entry(key.as_bytes())?,
                "{key}",
            );
        }
        Ok(())
    }

    #[test]
    fn random_order_inserts_and_deletes() -> Result<()> {
        use rand::seq::SliceRandom;

        let dir = tempfile::tempdir()?;
        let table = scratch_table(dir.path());

        let mut keys: Vec<u32> = (0..1500).collect();
        keys.shuffle(&mut rand::rng());

        for &i in &keys {
            table.add(format!("k{i:05}").as_bytes(), format!("v{i}").as_bytes())?;
        }
        for &i in keys.iter().filter(|i| **i % 3 == 0) {
            assert!(table.del(format!("k{i:05}").as_bytes())?);
        }
        for &i in &keys {
            let got = table.get_exact_entry(format!("k{i:05}").as_bytes())?;
            if i % 3 == 0 {
                assert_eq!(None, got);
            } else {
                assert_eq!(Some(format!("v{i}").into_bytes()), got);
            }
        }
        Ok(())
    }

    #[test]
    fn large_tag_splits_into_components() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table = scratch_table(dir.path());

        let tag: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        table.add(b"big", &tag)?;
        assert_eq!(1, table.get_entry_count());
        assert_eq!(Some(tag.clone()), table.get_exact_entry(b"big")?);

        // Replacing with a short tag drops the old components.
        table.add(b"big", b"short")?;
        assert_eq!(Some(b"short".to_vec()), table.get_exact_entry(b"big")?);

        assert!(table.del(b"big")?);
        assert!(table.empty());
        Ok(())
    }

    #[test]
    fn compression_is_transparent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let table =
            Table::create_and_open(&dir.path().join("z.quartz"), "z", 2048, 32)?;

        let tag = b"abcabcabcabc".repeat(50);
        table.add(b"key", &tag)?;
        assert_eq!(Some(tag.clone()), table.get_exact_entry(b"key")?);

        // The raw form is the deflated bytes.
        let (raw, compressed) = table.get_exact_entry_raw(b"key")?.unwrap();
        assert!(compressed);
        assert!(raw.len() < tag.len());

        // Forwarding the raw form (as compaction does) must reproduce it.
        let table2 =
            Table::create_and_open(&dir.path().join("z2.quartz"), "z2", 2048, 32)?;
        table2.add_raw(b"key", &raw, true)?;
        assert_eq!(Some(tag), table2.get_exact_entry(b"key")?);
        Ok(())
    }

    #[test]
    fn commit_and_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.quartz");
        let table = Table::create_and_open(&path, "t", 2048, DONT_COMPRESS)?;

        for i in 0..500u32 {
            table.add(format!("key{i:04}").as_bytes(), format!("tag{i}").as_bytes())?;
        }
        table.flush_db()?;
        let root_info = table.commit(1)?;
        drop(table);

        let reopened = Table::open(&path, "t", &root_info, 1, false)?;
        assert_eq!(500, reopened.get_entry_count());
        assert_eq!(
            Some(b"tag123".to_vec()),
            reopened.get_exact_entry(b"key0123")?
        );
        Ok(())
    }

    #[test]
    fn snapshot_isolation_across_commits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.quartz");
        let table = Table::create_and_open(&path, "t", 2048, DONT_COMPRESS)?;

        for i in 0..300u32 {
            table.add(format!("key{i:04}").as_bytes(), b"old")?;
        }
        table.flush_db()?;
        let info_r1 = table.commit(1)?;

        // A reader opens revision 1.
        let reader = Table::open(&path, "t", &info_r1, 1, false)?;

        // The writer rewrites everything and commits revision 2, then
        // churns once more so revision-1 blocks actually get recycled.
        for i in 0..300u32 {
            table.add(format!("key{i:04}").as_bytes(), b"new")?;
        }
        table.flush_db()?;
        let info_r2 = table.commit(2)?;
        for i in 0..300u32 {
            table.add(format!("key{i:04}").as_bytes(), b"newer")?;
        }
        table.flush_db()?;
        table.commit(3)?;

        // The revision-1 reader still sees revision 1, bit for bit.
        for i in (0..300u32).step_by(13) {
            assert_eq!(
                Some(b"old".to_vec()),
                reader.get_exact_entry(format!("key{i:04}").as_bytes())?,
            );
        }

        // And a fresh reader at revision 2 sees revision 2.
        let reader2 = Table::open(&path, "t", &info_r2, 2, false)?;
        assert_eq!(
            Some(b"new".to_vec()),
            reader2.get_exact_entry(b"key0000")?
        );
        Ok(())
    }

    #[test]
    fn cancel_discards_changes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.quartz");
        let table = Table::create_and_open(&path, "t", 2048, DONT_COMPRESS)?;

        table.add(b"kept", b"yes")?;
        table.flush_db()?;
        let info = table.commit(1)?;

        table.add(b"dropped", b"pending")?;
        assert!(table.is_modified());
        table.cancel(&info, 1);
        assert!(!table.is_modified());

        assert_eq!(None, table.get_exact_entry(b"dropped")?);
        assert_eq!(Some(b"yes".to_vec()), table.get_exact_entry(b"kept")?);
        Ok(())
    }

    #[test]
    fn free_list_conservation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.quartz");
        let table = Table::create_and_open(&path, "t", 2048, DONT_COMPRESS)?;

        let mut revision = 0;
        for round in 0..6u32 {
            for i in 0..400u32 {
                let key = format!("key{:04}", (i * 7 + round) % 400);
                table.add(key.as_bytes(), format!("value {round} {i}").as_bytes())?;
            }
            table.flush_db()?;
            revision += 1;
            table.commit(revision)?;
        }

        // Every block is reachable from the root, on the free list, or is
        // the fixed initial block 0.
        let mut reachable = std::collections::BTreeSet::new();
        {
            let inner = table.inner.borrow();
            let mut queue = vec![(inner.root(), inner.level())];
            while let Some((num, height)) = queue.pop() {
                assert!(reachable.insert(num), "block {num} reachable twice");
                if height > 0 {
                    let buf = inner.read_block_shared(num)?;
                    for index in 0..block::item_count(&buf) {
                        queue.push((block::ItemRef::at(&buf, index).child(), height - 1));
                    }
                }
            }
        }
        let free: std::collections::BTreeSet<u32> =
            table.free_blocks()?.into_iter().collect();
        assert!(reachable.is_disjoint(&free));

        let total = table.first_unused_block();
        let accounted = reachable.len() + free.len();
        assert_eq!(
            total as usize - 1,
            accounted,
            "reachable {} + free {} vs blocks {} (block 0 excluded)",
            reachable.len(),
            free.len(),
            total,
        );
        Ok(())
    }
}
