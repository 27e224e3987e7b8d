//! Free-block allocation
//!
//! The allocator's view of "free" is computed once per mutating operation:
//! a pre-pass walk marks every block still reachable from the retained
//! tree (metadata pairs and CTZ chains), and allocation scans block
//! indices in bounded lookahead windows, skipping marked blocks. No wear
//! history survives across operations; repeated edits of an image will not
//! rotate wear the way a live mount does.

use crate::ctz;
use crate::dir;
use crate::error::{LfsError, Result};
use crate::metadata::EntryData;
use crate::store::BlockStore;
use crate::superblock::{Superblock, SUPERBLOCK_PAIR};
use std::collections::HashSet;

/// Indices scanned per lookahead window (a 32-byte bitmap's worth).
pub const LOOKAHEAD_WINDOW: u32 = 8 * 32;

/// Single-pass free-block allocator over one operation's in-use set.
pub struct BlockAllocator {
    block_count: u32,
    in_use: HashSet<u32>,
    /// Start index of the current lookahead window
    window_start: u32,
    /// One bit per index in the window; set = unavailable
    window: Vec<u64>,
}

impl BlockAllocator {
    pub fn new(block_count: u32, in_use: HashSet<u32>) -> Self {
        let mut allocator = BlockAllocator {
            block_count,
            in_use,
            window_start: 0,
            window: vec![0; (LOOKAHEAD_WINDOW as usize).div_ceil(64)],
        };
        allocator.fill_window();
        allocator
    }

    /// Walk the retained tree and mark every reachable block as in use.
    ///
    /// Covers the superblock pair, every directory pair, and every block
    /// of every CTZ chain; inline entries reference no blocks.
    pub fn from_tree(store: &mut BlockStore, sb: &Superblock) -> Result<Self> {
        let mut in_use: HashSet<u32> = HashSet::new();
        in_use.extend(SUPERBLOCK_PAIR);
        in_use.extend(sb.root_pair);

        let entries = dir::list(store, sb.root_pair)?;
        for (_, entry) in entries {
            match entry.data {
                EntryData::Dir(pair) => {
                    in_use.extend(pair);
                }
                EntryData::Ctz { head, size } => {
                    in_use.extend(ctz::chain_addresses(store, head, size)?);
                }
                EntryData::Inline(_) => {}
            }
        }

        tracing::debug!(
            reachable = in_use.len(),
            total = sb.block_count,
            "computed in-use set"
        );
        Ok(BlockAllocator::new(sb.block_count, in_use))
    }

    fn fill_window(&mut self) {
        self.window.iter_mut().for_each(|w| *w = 0);
        for i in 0..LOOKAHEAD_WINDOW {
            let block = self.window_start + i;
            if block >= self.block_count || self.in_use.contains(&block) {
                self.window[i as usize / 64] |= 1 << (i % 64);
            }
        }
    }

    /// Hand out the next free block index.
    pub fn allocate(&mut self) -> Result<u32> {
        while self.window_start < self.block_count {
            for i in 0..LOOKAHEAD_WINDOW {
                let word = self.window[i as usize / 64];
                if word & (1 << (i % 64)) == 0 {
                    self.window[i as usize / 64] |= 1 << (i % 64);
                    return Ok(self.window_start + i);
                }
            }
            // Window exhausted; slide to the next one.
            self.window_start += LOOKAHEAD_WINDOW;
            if self.window_start < self.block_count {
                self.fill_window();
            }
        }
        Err(LfsError::NoSpace)
    }

    /// Allocate `count` blocks, in increasing index order.
    pub fn allocate_many(&mut self, count: u32) -> Result<Vec<u32>> {
        (0..count).map(|_| self.allocate()).collect()
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }
}
