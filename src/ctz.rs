//! CTZ skip-list file storage
//!
//! A file's content lives in a chain of data blocks. Chain block `i` ends
//! with `ctz(i) + 1` back-pointers at strides 2^0, 2^1, .., 2^ctz(i), so a
//! seek from the head reaches any block in O(log n) hops while the chain
//! costs only amortized two pointers per block. Block 0 carries no
//! pointers; the total byte size is recorded once, in the owning entry.

use crate::alloc::BlockAllocator;
use crate::error::Result;
use crate::store::BlockStore;
use std::io::{Read, Write};

/// Back-pointers carried by chain block `index` (`index > 0`).
pub fn ptr_count(index: u32) -> u32 {
    debug_assert!(index > 0);
    index.trailing_zeros() + 1
}

/// Payload bytes chain block `index` can hold.
pub fn capacity(block_size: u32, index: u32) -> u32 {
    if index == 0 {
        block_size
    } else {
        block_size - 4 * ptr_count(index)
    }
}

/// Payload bytes stored in chain blocks before `index`.
///
/// Blocks 1..index carry `sum(ctz(k)+1) = 2*(index-1) - popcount(index-1)`
/// pointers in total, which is what the closed form subtracts.
pub fn cumulative(block_size: u32, index: u32) -> u64 {
    if index == 0 {
        return 0;
    }
    let i = index as u64;
    let overhead = 2 * (i - 1) - (index - 1).count_ones() as u64;
    block_size as u64 * i - 4 * overhead
}

/// Chain index and in-payload offset holding logical byte `off`.
pub fn index_for_offset(block_size: u32, off: u64) -> (u32, u64) {
    // First guess assumes the worst-case two pointers per block, which
    // can only overshoot; walk back, then forward, to the exact index.
    let amortized = (block_size - 8) as u64;
    let mut index = (off / amortized) as u32;
    while index > 0 && cumulative(block_size, index) > off {
        index -= 1;
    }
    while cumulative(block_size, index + 1) <= off {
        index += 1;
    }
    (index, off - cumulative(block_size, index))
}

fn read_ptr(store: &mut BlockStore, block: u32, entry: u32) -> Result<u32> {
    let block_size = store.geometry().block_size;
    let raw = store.read(block, block_size - 4 * (entry + 1), 4)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Recover every chain block address, index 0 first.
///
/// Walks the stride-1 pointers once from the head down to block 0, one
/// 4-byte read per block.
pub fn chain_addresses(store: &mut BlockStore, head: u32, size: u32) -> Result<Vec<u32>> {
    if size == 0 {
        return Ok(Vec::new());
    }
    let block_size = store.geometry().block_size;
    let (last, _) = index_for_offset(block_size, size as u64 - 1);

    let mut addrs = vec![0u32; last as usize + 1];
    addrs[last as usize] = head;
    for i in (1..=last).rev() {
        addrs[i as usize - 1] = read_ptr(store, addrs[i as usize], 0)?;
    }
    Ok(addrs)
}

/// Stream a whole chain's content into `sink`.
pub fn copy_to(store: &mut BlockStore, head: u32, size: u32, sink: &mut impl Write) -> Result<()> {
    let block_size = store.geometry().block_size;
    let addrs = chain_addresses(store, head, size)?;
    for (i, &addr) in addrs.iter().enumerate() {
        let start = cumulative(block_size, i as u32);
        let len = (capacity(block_size, i as u32) as u64).min(size as u64 - start);
        let payload = store.read(addr, 0, len as usize)?;
        sink.write_all(&payload)?;
    }
    Ok(())
}

/// Read the whole chain into memory.
pub fn read_all(store: &mut BlockStore, head: u32, size: u32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size as usize);
    copy_to(store, head, size, &mut out)?;
    Ok(out)
}

/// Descend from the head to the chain block at `target` index.
///
/// Each hop follows the largest back-pointer that does not overshoot, so
/// the walk takes O(log n) block reads.
fn seek(store: &mut BlockStore, last: u32, head: u32, target: u32) -> Result<u32> {
    let mut index = last;
    let mut addr = head;
    while index > target {
        let mut k = ptr_count(index) - 1;
        while index - (1 << k) < target {
            k -= 1;
        }
        addr = read_ptr(store, addr, k)?;
        index -= 1 << k;
    }
    Ok(addr)
}

/// Random-access read of `len` bytes at logical offset `off`.
///
/// Reads past `size` are truncated, matching positional reads on a file.
pub fn read_at(
    store: &mut BlockStore,
    head: u32,
    size: u32,
    off: u64,
    len: usize,
) -> Result<Vec<u8>> {
    let end = (off + len as u64).min(size as u64);
    if off >= end {
        return Ok(Vec::new());
    }
    let block_size = store.geometry().block_size;
    let (last, _) = index_for_offset(block_size, size as u64 - 1);

    let mut out = Vec::with_capacity((end - off) as usize);
    let mut pos = off;
    while pos < end {
        let (index, in_block) = index_for_offset(block_size, pos);
        let addr = seek(store, last, head, index)?;
        let take = (capacity(block_size, index) as u64 - in_block).min(end - pos);
        out.extend_from_slice(&store.read(addr, in_block as u32, take as usize)?);
        pos += take;
    }
    Ok(out)
}

fn read_full(source: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Build a new chain from `source`, allocating blocks in increasing index
/// order so the head comes out last. Returns the head address and total
/// byte size.
pub fn build(
    store: &mut BlockStore,
    allocator: &mut BlockAllocator,
    source: &mut impl Read,
) -> Result<(u32, u32)> {
    let block_size = store.geometry().block_size;
    let mut addrs: Vec<u32> = Vec::new();
    let mut total: u64 = 0;

    loop {
        let index = addrs.len() as u32;
        let cap = capacity(block_size, index) as usize;
        let mut chunk = vec![0u8; cap];
        let n = read_full(source, &mut chunk)?;
        if n == 0 && index > 0 {
            break;
        }

        let block = allocator.allocate()?;
        let mut buf = vec![0xFF; block_size as usize];
        buf[..n].copy_from_slice(&chunk[..n]);
        if index > 0 {
            for k in 0..ptr_count(index) {
                let ptr = addrs[(index - (1u32 << k)) as usize];
                let at = (block_size - 4 * (k + 1)) as usize;
                buf[at..at + 4].copy_from_slice(&ptr.to_le_bytes());
            }
        }
        store.write(block, 0, &buf)?;
        addrs.push(block);
        total += n as u64;

        if n < cap {
            break;
        }
    }

    let head = *addrs.last().expect("chain build needs a non-empty source");
    Ok((head, total as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Geometry;
    use proptest::prelude::*;

    const BS: u32 = 256;

    fn mem_store(block_count: u32) -> BlockStore {
        BlockStore::memory(Geometry::new(BS, block_count, 0).unwrap())
    }

    fn chain_allocator(store: &BlockStore) -> BlockAllocator {
        // Reserve nothing: every block is fair game in these unit tests.
        BlockAllocator::new(store.geometry().block_count, Default::default())
    }

    #[test]
    fn test_capacity_and_pointer_counts() {
        assert_eq!(capacity(BS, 0), BS);
        assert_eq!(capacity(BS, 1), BS - 4);
        assert_eq!(capacity(BS, 2), BS - 8);
        assert_eq!(capacity(BS, 3), BS - 4);
        assert_eq!(capacity(BS, 4), BS - 12);
        assert_eq!(capacity(BS, 8), BS - 16);
    }

    #[test]
    fn test_cumulative_matches_capacity_sum() {
        let mut sum = 0u64;
        for i in 0..100 {
            assert_eq!(cumulative(BS, i), sum, "index {}", i);
            sum += capacity(BS, i) as u64;
        }
    }

    #[test]
    fn test_index_for_offset_boundaries() {
        assert_eq!(index_for_offset(BS, 0), (0, 0));
        assert_eq!(index_for_offset(BS, BS as u64 - 1), (0, BS as u64 - 1));
        assert_eq!(index_for_offset(BS, BS as u64), (1, 0));
    }

    #[test]
    fn test_build_and_read_round_trip() {
        let mut store = mem_store(64);
        let mut allocator = chain_allocator(&store);

        let content: Vec<u8> = (0..BS as usize * 5 + 17).map(|i| (i % 251) as u8).collect();
        let (head, size) = build(&mut store, &mut allocator, &mut content.as_slice()).unwrap();
        assert_eq!(size as usize, content.len());

        assert_eq!(read_all(&mut store, head, size).unwrap(), content);
    }

    #[test]
    fn test_single_block_chain() {
        let mut store = mem_store(8);
        let mut allocator = chain_allocator(&store);

        let content = vec![0x5A; 100];
        let (head, size) = build(&mut store, &mut allocator, &mut content.as_slice()).unwrap();
        assert_eq!(read_all(&mut store, head, size).unwrap(), content);
    }

    #[test]
    fn test_read_at_matches_sequential() {
        let mut store = mem_store(64);
        let mut allocator = chain_allocator(&store);

        let content: Vec<u8> = (0..BS as usize * 7 + 3).map(|i| (i % 241) as u8).collect();
        let (head, size) = build(&mut store, &mut allocator, &mut content.as_slice()).unwrap();

        for (off, len) in [(0u64, 10usize), (255, 2), (256, 300), (1000, 0), (1790, 64)] {
            let got = read_at(&mut store, head, size, off, len).unwrap();
            let end = (off as usize + len).min(content.len());
            assert_eq!(got, &content[off as usize..end], "off={} len={}", off, len);
        }
    }

    #[test]
    fn test_read_at_past_end_truncates() {
        let mut store = mem_store(8);
        let mut allocator = chain_allocator(&store);
        let content = vec![1u8; 300];
        let (head, size) = build(&mut store, &mut allocator, &mut content.as_slice()).unwrap();

        assert_eq!(read_at(&mut store, head, size, 290, 100).unwrap(), vec![1u8; 10]);
        assert!(read_at(&mut store, head, size, 400, 10).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_index_for_offset_is_inverse_of_cumulative(off in 0u64..1_000_000) {
            let (index, in_block) = index_for_offset(BS, off);
            prop_assert!(cumulative(BS, index) <= off);
            prop_assert!(off < cumulative(BS, index + 1));
            prop_assert_eq!(off - cumulative(BS, index), in_block);
            prop_assert!(in_block < capacity(BS, index) as u64);
        }

        #[test]
        fn prop_chain_round_trip(len in 1usize..8192) {
            let mut store = mem_store(64);
            let mut allocator = chain_allocator(&store);
            let content: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();

            let (head, size) = build(&mut store, &mut allocator, &mut content.as_slice()).unwrap();
            prop_assert_eq!(size as usize, len);
            prop_assert_eq!(read_all(&mut store, head, size).unwrap(), content);
        }
    }
}
