// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Free-block tracking for one table file.
//!
//! The free list is a chain of blocks of the same file, marked with the
//! free-list level. Each holds 4-byte block numbers from offset 8 up; the
//! final 4 bytes are either the next chain block or the unused marker.
//!
//! Three cursors drive it: `fl` (where allocation reads), `fl_end` (the
//! barrier — allocation never reads past it) and `flw` (where newly freed
//! blocks are appended). Commit advances `fl_end` to `flw`, which is what
//! makes a block freed in transaction R allocatable only from transaction
//! R+1 on: a reader still at the previous revision can never observe one
//! of its blocks being rewritten.

use super::{block, table::TableFile, BLOCK_UNUSED, LEVEL_FREELIST};
use crate::{Error, Result, Revision};

/// First byte offset usable for entries (after revision + level marker).
const ENTRY_BASE: u32 = 8;

/// Position within the free-list chain.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct FlCursor {
    /// Chain block number.
    pub n: u32,
    /// Byte offset of the next entry; 0 means "no block yet".
    pub c: u32,
}

/// Persisted free-list state, stored in the root info.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct FreeListState {
    /// Read cursor at the last commit.
    pub head: FlCursor,
    /// Write cursor (= barrier) at the last commit.
    pub tail: FlCursor,
    /// One past the highest block number ever used.
    pub first_unused_block: u32,
}

/// The in-memory free list of one open table.
pub struct FreeList {
    fl: FlCursor,
    fl_end: FlCursor,
    flw: FlCursor,
    first_unused_block: u32,
    revision: Revision,
    read_buf: Option<Vec<u8>>,
    write_buf: Option<Vec<u8>>,
    flw_appending: bool,
}

fn read_entry(buf: &[u8], offset: u32) -> u32 {
    let offset = offset as usize;
    let mut bytes = [0u8; 4];
    if let Some(src) = buf.get(offset..offset + 4) {
        bytes.copy_from_slice(src);
    }
    u32::from_be_bytes(bytes)
}

fn write_entry(buf: &mut [u8], offset: u32, value: u32) {
    let offset = offset as usize;
    if let Some(dst) = buf.get_mut(offset..offset + 4) {
        dst.copy_from_slice(&value.to_be_bytes());
    }
}

impl FreeList {
    /// A free list for a brand-new table: nothing free, nothing used but
    /// block 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fl: FlCursor::default(),
            fl_end: FlCursor::default(),
            flw: FlCursor::default(),
            first_unused_block: 1,
            revision: 0,
            read_buf: None,
            write_buf: None,
            flw_appending: false,
        }
    }

    /// Restores the free list recorded at a commit.
    #[must_use]
    pub fn open(state: FreeListState) -> Self {
        Self {
            fl: state.head,
            fl_end: state.tail,
            flw: state.tail,
            first_unused_block: state.first_unused_block,
            revision: 0,
            read_buf: None,
            write_buf: None,
            flw_appending: false,
        }
    }

    /// The state to persist, valid right after [`Self::commit`].
    #[must_use]
    pub fn state(&self) -> FreeListState {
        FreeListState {
            head: self.fl,
            tail: self.flw,
            first_unused_block: self.first_unused_block,
        }
    }

    /// Sets the revision stamped onto free-list blocks written from now on.
    pub fn set_revision(&mut self, revision: Revision) {
        self.revision = revision;
    }

    /// One past the highest block number in use.
    #[must_use]
    pub fn first_unused_block(&self) -> u32 {
        self.first_unused_block
    }

    fn entry_limit(io: &TableFile) -> u32 {
        io.block_size() - 4
    }

    fn read_chain_block(io: &TableFile, n: u32, buf: &mut Vec<u8>) -> Result<()> {
        io.read_block(n, buf)?;
        if block::level(buf) != LEVEL_FREELIST {
            return Err(Error::Corrupt(format!("block {n} is not a free-list block")));
        }
        Ok(())
    }

    fn write_chain_block(&self, io: &TableFile, n: u32, buf: &mut [u8]) -> Result<()> {
        block::set_revision(buf, self.revision);
        block::set_level(buf, LEVEL_FREELIST);
        io.write_block(n, buf)
    }

    /// Hands out a block number for writing: the next reusable entry, or a
    /// fresh block past the end of the file.
    pub fn get_block(&mut self, io: &TableFile) -> Result<u32> {
        self.get_block_internal(io, None)
    }

    fn get_block_internal(
        &mut self,
        io: &TableFile,
        defer_free: Option<&mut u32>,
    ) -> Result<u32> {
        if self.fl == self.fl_end {
            let fresh = self.first_unused_block;
            self.first_unused_block += 1;
            return Ok(fresh);
        }

        if self.read_buf.is_none() {
            if self.fl.n == BLOCK_UNUSED {
                return Err(Error::Corrupt("free list read cursor invalid".into()));
            }
            let mut buf = vec![0u8; io.block_size() as usize];
            Self::read_chain_block(io, self.fl.n, &mut buf)?;
            self.read_buf = Some(buf);
        }

        let limit = Self::entry_limit(io);

        if self.fl.c != limit {
            let buf = self.read_buf.as_deref().unwrap_or_default();
            let blk = read_entry(buf, self.fl.c);
            if blk == BLOCK_UNUSED {
                return Err(Error::Corrupt(format!(
                    "ran off end of free list ({}, {})",
                    self.fl.n, self.fl.c,
                )));
            }
            self.fl.c += 4;
            return Ok(blk);
        }

        // This chain block is exhausted; follow its next pointer, then
        // queue the spent block itself for release.
        let spent = self.fl.n;

        let next = {
            let buf = self.read_buf.as_deref().unwrap_or_default();
            read_entry(buf, self.fl.c)
        };
        if next == BLOCK_UNUSED {
            return Err(Error::Corrupt("free list next pointer invalid".into()));
        }
        self.fl.n = next;
        self.fl.c = ENTRY_BASE;
        if let Some(buf) = self.read_buf.as_mut() {
            Self::read_chain_block(io, next, buf)?;
        }

        if let Some(slot) = defer_free {
            debug_assert_eq!(*slot, BLOCK_UNUSED);
            *slot = spent;
        } else {
            self.mark_block_unused(io, spent)?;
        }

        self.get_block_internal(io, None)
    }

    /// Records `blk` as free once the revision being built is superseded.
    pub fn mark_block_unused(&mut self, io: &TableFile, blk: u32) -> Result<()> {
        // Growing the tail may itself need a block, and the block that
        // hands out may exhaust a chain block that then needs freeing.
        // Defer that release until the original entry is written, to keep
        // the recursion bounded.
        let mut deferred = BLOCK_UNUSED;
        let limit = Self::entry_limit(io);

        if self.write_buf.is_none() {
            let mut buf = vec![0u8; io.block_size() as usize];
            if self.flw.c != 0 {
                Self::read_chain_block(io, self.flw.n, &mut buf)?;
                self.flw_appending = true;
            }
            self.write_buf = Some(buf);
        }

        if self.flw.c == 0 {
            let n = self.get_block_internal(io, Some(&mut deferred))?;
            self.flw.n = n;
            self.flw.c = ENTRY_BASE;
            if self.fl.c == 0 {
                self.fl = self.flw;
                self.fl_end = self.flw;
            }
            self.flw_appending = n == self.first_unused_block - 1;
            if let Some(buf) = self.write_buf.as_mut() {
                write_entry(buf, limit, BLOCK_UNUSED);
            }
        } else if self.flw.c == limit {
            let n = self.get_block_internal(io, Some(&mut deferred))?;
            let full_block = self.flw.n;
            if let Some(buf) = self.write_buf.as_mut() {
                write_entry(buf, limit, n);
            }
            let mut buf = self.write_buf.take().unwrap_or_default();
            self.write_chain_block(io, full_block, &mut buf)?;
            if self.fl.n == full_block {
                // The read cursor is inside the block just written; refresh
                // its copy.
                if let Some(read) = self.read_buf.as_mut() {
                    read.copy_from_slice(&buf);
                }
            }
            self.write_buf = Some(buf);
            self.flw.n = n;
            self.flw.c = ENTRY_BASE;
            self.flw_appending = n == self.first_unused_block - 1;
            if let Some(write) = self.write_buf.as_mut() {
                write_entry(write, limit, BLOCK_UNUSED);
            }
        }

        if let Some(buf) = self.write_buf.as_mut() {
            write_entry(buf, self.flw.c, blk);
        }
        self.flw.c += 4;

        if deferred != BLOCK_UNUSED {
            self.mark_block_unused(io, deferred)?;
        }
        Ok(())
    }

    /// Writes out the tail chain block and advances the barrier: entries
    /// appended during this transaction become allocatable from the next
    /// one.
    pub fn commit(&mut self, io: &TableFile) -> Result<()> {
        // Nothing was freed this transaction: the tail block on disk is
        // already exactly what the last commit left there.
        if self.write_buf.is_none() || self.flw.c == 0 {
            return Ok(());
        }
        let limit = Self::entry_limit(io);
        let tail_block = self.flw.n;
        let mut buf = self.write_buf.take().unwrap_or_default();
        // Pad unused entry slots so an overread is detectable.
        for offset in (self.flw.c..limit).step_by(4) {
            write_entry(&mut buf, offset, BLOCK_UNUSED);
        }
        self.write_chain_block(io, tail_block, &mut buf)?;
        if self.fl.n == tail_block {
            if let Some(read) = self.read_buf.as_mut() {
                read.copy_from_slice(&buf);
            }
        }
        self.write_buf = Some(buf);
        self.flw_appending = true;
        self.fl_end = self.flw;
        Ok(())
    }

    /// Lists every block currently free (entries between the read cursor
    /// and the barrier) plus, when `include_chain` is set, the chain
    /// blocks that store them. Read-only; used by integrity checks.
    pub fn free_blocks(&self, io: &TableFile, include_chain: bool) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        if self.fl == self.fl_end {
            return Ok(out);
        }

        let limit = Self::entry_limit(io);
        let mut cursor = self.fl;
        let mut buf = vec![0u8; io.block_size() as usize];
        Self::read_chain_block(io, cursor.n, &mut buf)?;
        if include_chain {
            out.push(cursor.n);
        }

        loop {
            if cursor == self.fl_end {
                break;
            }
            if cursor.c != limit {
                let blk = read_entry(&buf, cursor.c);
                if blk == BLOCK_UNUSED {
                    return Err(Error::Corrupt("free list entry invalid".into()));
                }
                out.push(blk);
                cursor.c += 4;
                continue;
            }
            let next = read_entry(&buf, cursor.c);
            if next == BLOCK_UNUSED {
                return Err(Error::Corrupt("free list next pointer invalid".into()));
            }
            cursor.n = next;
            cursor.c = ENTRY_BASE;
            Self::read_chain_block(io, next, &mut buf)?;
            if include_chain {
                out.push(next);
            }
        }

        Ok(out)
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}
