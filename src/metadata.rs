//! Redundant metadata pairs
//!
//! A directory's entry log lives in a pair of blocks holding the same
//! logical content. Commits go to the non-authoritative half first, so the
//! authoritative copy is never invalidated mid-write; once the new half
//! carries a higher revision and a valid CRC it becomes authoritative.
//! Recovery is the mirror image: scan both halves, trust the newest one
//! that validates, treat everything past the last good CRC as torn.

use crate::error::{LfsError, Result};
use crate::store::BlockStore;
use crate::tag::{self, Decoded, Tag, TagType, NO_ID, TAG_HEADER_SIZE};
use std::collections::BTreeMap;

/// Address of a metadata pair: two block numbers holding the same log.
pub type PairAddr = [u32; 2];

/// Content carried by a directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryData {
    /// Small file stored inline in the metadata log
    Inline(Vec<u8>),
    /// File content in a CTZ skip-list chain
    Ctz { head: u32, size: u32 },
    /// Child directory's metadata pair
    Dir(PairAddr),
}

/// A named child of a directory: file or sub-directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub id: u16,
    pub name: String,
    pub data: EntryData,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        matches!(self.data, EntryData::Dir(_))
    }

    pub fn size(&self) -> u64 {
        match &self.data {
            EntryData::Inline(data) => data.len() as u64,
            EntryData::Ctz { size, .. } => *size as u64,
            EntryData::Dir(_) => 0,
        }
    }
}

/// Result of scanning one half of a pair.
///
/// Explicitly a two-state machine: a half either holds at least one
/// CRC-closed commit, or it is torn and carries no authority.
enum BlockScan {
    Valid {
        revision: u32,
        tags: Vec<Tag>,
        log_bytes: usize,
    },
    Torn,
}

/// Scan a raw metadata block, validating commit boundaries.
///
/// Tags accumulate into a pending set that only graduates when a CRC tag
/// closes the region; a CRC mismatch, malformed tag, or erased flash ends
/// the scan at the last good boundary.
fn scan_block(buf: &[u8]) -> BlockScan {
    if buf.len() < 4 {
        return BlockScan::Torn;
    }
    let revision = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[0..4]);

    let mut pos = 4;
    let mut committed: Vec<Tag> = Vec::new();
    let mut pending: Vec<Tag> = Vec::new();
    let mut boundary: Option<usize> = None;

    loop {
        match tag::decode_at(buf, pos) {
            Decoded::End => break,
            Decoded::Tag(decoded, consumed) => {
                if decoded.ttype == TagType::Crc {
                    if decoded.data.len() != 4 {
                        break;
                    }
                    // The CRC covers the block from offset 0 through this
                    // tag's header.
                    hasher.update(&buf[pos..pos + TAG_HEADER_SIZE]);
                    let expected = u32::from_le_bytes([
                        decoded.data[0],
                        decoded.data[1],
                        decoded.data[2],
                        decoded.data[3],
                    ]);
                    if hasher.clone().finalize() != expected {
                        break;
                    }
                    hasher.update(&decoded.data);
                    pos += consumed;
                    committed.append(&mut pending);
                    boundary = Some(pos);
                } else {
                    hasher.update(&buf[pos..pos + consumed]);
                    pending.push(decoded);
                    pos += consumed;
                }
            }
        }
    }

    match boundary {
        Some(log_bytes) => BlockScan::Valid {
            revision,
            tags: committed,
            log_bytes,
        },
        None => BlockScan::Torn,
    }
}

struct SlotState {
    name: Option<(String, bool)>,
    data: Option<EntryData>,
}

/// Replay a committed log: last writer wins per slot, deletes retire slots.
fn merge(log: &[Tag]) -> (Vec<DirEntry>, Option<Tag>) {
    let mut slots: BTreeMap<u16, SlotState> = BTreeMap::new();
    let mut superblock = None;

    for tag in log {
        let slot = || SlotState {
            name: None,
            data: None,
        };
        match tag.ttype {
            TagType::NameFile | TagType::NameDir => match String::from_utf8(tag.data.clone()) {
                Ok(name) => {
                    slots.entry(tag.id).or_insert_with(slot).name =
                        Some((name, tag.ttype == TagType::NameDir));
                }
                Err(_) => {
                    tracing::warn!(id = tag.id, "entry name is not valid UTF-8, skipping slot");
                    slots.remove(&tag.id);
                }
            },
            TagType::StructInline => {
                slots.entry(tag.id).or_insert_with(slot).data =
                    Some(EntryData::Inline(tag.data.clone()));
            }
            TagType::StructCtz => {
                if let Ok((head, size)) = tag::decode_ctz_struct(&tag.data) {
                    slots.entry(tag.id).or_insert_with(slot).data =
                        Some(EntryData::Ctz { head, size });
                }
            }
            TagType::StructDir => {
                if let Ok(pair) = tag::decode_dir_struct(&tag.data) {
                    slots.entry(tag.id).or_insert_with(slot).data = Some(EntryData::Dir(pair));
                }
            }
            TagType::Delete => {
                slots.remove(&tag.id);
            }
            TagType::Superblock => superblock = Some(tag.clone()),
            TagType::Crc => {}
        }
    }

    let mut entries = Vec::new();
    for (id, slot) in slots {
        match (slot.name, slot.data) {
            (Some((name, is_dir)), Some(data)) => {
                if is_dir != matches!(data, EntryData::Dir(_)) {
                    tracing::warn!(id, %name, "name and struct tags disagree on kind, skipping");
                    continue;
                }
                entries.push(DirEntry { id, name, data });
            }
            _ => tracing::warn!(id, "slot missing its name or struct tag, skipping"),
        }
    }
    (entries, superblock)
}

/// One loaded metadata pair with a resolved authoritative half.
pub struct MetadataPair {
    addr: PairAddr,
    /// Index into `addr` of the authoritative half
    active: usize,
    revision: u32,
    log: Vec<Tag>,
    entries: Vec<DirEntry>,
}

impl MetadataPair {
    /// Read both halves, validate, and pick the authoritative one.
    pub fn load(store: &mut BlockStore, addr: PairAddr) -> Result<Self> {
        let scans = [
            scan_block(&store.read_block(addr[0])?),
            scan_block(&store.read_block(addr[1])?),
        ];

        let active = match &scans {
            [BlockScan::Valid { revision: a, .. }, BlockScan::Valid { revision: b, .. }] => {
                if a >= b {
                    0
                } else {
                    1
                }
            }
            [BlockScan::Valid { .. }, BlockScan::Torn] => 0,
            [BlockScan::Torn, BlockScan::Valid { .. }] => {
                tracing::debug!(?addr, "half 0 torn, recovering from half 1");
                1
            }
            [BlockScan::Torn, BlockScan::Torn] => {
                return Err(LfsError::CorruptMetadata(addr[0], addr[1]));
            }
        };
        let [scan_a, scan_b] = scans;
        let scan = if active == 0 { scan_a } else { scan_b };
        let BlockScan::Valid {
            revision,
            tags,
            log_bytes,
        } = scan
        else {
            unreachable!()
        };
        tracing::trace!(?addr, revision, log_bytes, "loaded pair");

        let (entries, _) = merge(&tags);
        Ok(MetadataPair {
            addr,
            active,
            revision,
            log: tags,
            entries,
        })
    }

    /// Write a fresh pair: `initial` tags committed to the first half at
    /// revision 1, the second half left erased.
    pub fn format(store: &mut BlockStore, addr: PairAddr, initial: Vec<Tag>) -> Result<Self> {
        let block_size = store.geometry().block_size as usize;
        let encoded = encode_block(block_size, 1, &initial).ok_or(LfsError::NoSpace)?;
        store.write(addr[0], 0, &encoded)?;
        store.write(addr[1], 0, &vec![0xFF; block_size])?;

        let (entries, _) = merge(&initial);
        Ok(MetadataPair {
            addr,
            active: 0,
            revision: 1,
            log: initial,
            entries,
        })
    }

    pub fn addr(&self) -> PairAddr {
        self.addr
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Live entries, merged last-writer-wins.
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Latest superblock tag in the log, if this is the superblock pair.
    pub fn superblock_tag(&self) -> Option<&Tag> {
        self.log
            .iter()
            .rev()
            .find(|t| t.ttype == TagType::Superblock)
    }

    /// Smallest slot id not used by a live entry.
    pub fn next_free_id(&self) -> u16 {
        let mut id = 0u16;
        while self.entries.iter().any(|e| e.id == id) {
            id += 1;
        }
        id
    }

    /// Append tags to the log as one commit.
    ///
    /// The grown log is written to the inactive half with a bumped
    /// revision; only after that write completes does the pair flip.
    /// When the log no longer fits, superseded history is compacted away
    /// first; a log that cannot fit even compacted fails with `NoSpace`
    /// and leaves the authoritative half untouched.
    pub fn commit(&mut self, store: &mut BlockStore, new_tags: Vec<Tag>) -> Result<()> {
        let block_size = store.geometry().block_size as usize;
        let revision = self.revision.wrapping_add(1);

        let mut candidate = self.log.clone();
        candidate.extend(new_tags);

        let (log, encoded) = match encode_block(block_size, revision, &candidate) {
            Some(encoded) => (candidate, encoded),
            None => {
                tracing::debug!(addr = ?self.addr, "log full, compacting");
                let compacted = compact(&candidate);
                let encoded =
                    encode_block(block_size, revision, &compacted).ok_or(LfsError::NoSpace)?;
                (compacted, encoded)
            }
        };

        let sibling = self.addr[1 - self.active];
        store.write(sibling, 0, &encoded)?;

        self.active = 1 - self.active;
        self.revision = revision;
        let (entries, _) = merge(&log);
        self.log = log;
        self.entries = entries;
        Ok(())
    }

    /// Tags for inserting (or replacing) one entry.
    pub fn entry_tags(id: u16, name: &str, data: &EntryData) -> Vec<Tag> {
        let name_type = if matches!(data, EntryData::Dir(_)) {
            TagType::NameDir
        } else {
            TagType::NameFile
        };
        let struct_tag = match data {
            EntryData::Inline(bytes) => Tag::new(TagType::StructInline, id, bytes.clone()),
            EntryData::Ctz { head, size } => {
                Tag::new(TagType::StructCtz, id, tag::encode_ctz_struct(*head, *size))
            }
            EntryData::Dir(pair) => Tag::new(TagType::StructDir, id, tag::encode_dir_struct(*pair)),
        };
        vec![Tag::new(name_type, id, name.as_bytes().to_vec()), struct_tag]
    }
}

/// Rewrite a log keeping only the superseding tag per identity.
fn compact(log: &[Tag]) -> Vec<Tag> {
    let (entries, superblock) = merge(log);
    let mut out = Vec::new();
    if let Some(sb) = superblock {
        out.push(sb);
    }
    for entry in entries {
        out.extend(MetadataPair::entry_tags(entry.id, &entry.name, &entry.data));
    }
    out
}

/// Encode one commit into a full block image, or `None` if it won't fit.
fn encode_block(block_size: usize, revision: u32, log: &[Tag]) -> Option<Vec<u8>> {
    let used: usize = 4 + log.iter().map(Tag::encoded_len).sum::<usize>();
    // Room for the closing CRC tag.
    if used + TAG_HEADER_SIZE + 4 > block_size {
        return None;
    }

    let mut buf = vec![0xFF; block_size];
    buf[0..4].copy_from_slice(&revision.to_le_bytes());
    let mut pos = 4;
    for tag in log {
        let header = tag.header_bytes();
        buf[pos..pos + TAG_HEADER_SIZE].copy_from_slice(&header);
        buf[pos + TAG_HEADER_SIZE..pos + TAG_HEADER_SIZE + tag.data.len()]
            .copy_from_slice(&tag.data);
        pos += tag.encoded_len();
    }

    let crc_tag = Tag::new(TagType::Crc, NO_ID, vec![0; 4]);
    buf[pos..pos + TAG_HEADER_SIZE].copy_from_slice(&crc_tag.header_bytes());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[0..pos + TAG_HEADER_SIZE]);
    let crc = hasher.finalize();
    buf[pos + TAG_HEADER_SIZE..pos + TAG_HEADER_SIZE + 4].copy_from_slice(&crc.to_le_bytes());

    Some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Geometry;

    fn mem_store(block_size: u32, block_count: u32) -> BlockStore {
        BlockStore::memory(Geometry::new(block_size, block_count, 0).unwrap())
    }

    fn inline_entry(id: u16, name: &str, content: &[u8]) -> Vec<Tag> {
        MetadataPair::entry_tags(id, name, &EntryData::Inline(content.to_vec()))
    }

    #[test]
    fn test_format_and_load_empty_pair() {
        let mut store = mem_store(512, 4);
        MetadataPair::format(&mut store, [0, 1], Vec::new()).unwrap();

        let pair = MetadataPair::load(&mut store, [0, 1]).unwrap();
        assert_eq!(pair.revision(), 1);
        assert!(pair.entries().is_empty());
    }

    #[test]
    fn test_load_fully_erased_pair_is_corrupt() {
        let mut store = mem_store(512, 4);
        assert!(matches!(
            MetadataPair::load(&mut store, [0, 1]),
            Err(LfsError::CorruptMetadata(0, 1))
        ));
    }

    #[test]
    fn test_commit_goes_to_sibling_first() {
        let mut store = mem_store(512, 4);
        let mut pair = MetadataPair::format(&mut store, [0, 1], Vec::new()).unwrap();

        let before = store.read_block(0).unwrap();
        pair.commit(&mut store, inline_entry(0, "a.bin", b"abc"))
            .unwrap();
        // The previously authoritative half is byte-identical.
        assert_eq!(store.read_block(0).unwrap(), before);

        let reloaded = MetadataPair::load(&mut store, [0, 1]).unwrap();
        assert_eq!(reloaded.revision(), 2);
        assert_eq!(reloaded.entries().len(), 1);
        assert_eq!(reloaded.entries()[0].name, "a.bin");
        assert_eq!(
            reloaded.entries()[0].data,
            EntryData::Inline(b"abc".to_vec())
        );
    }

    #[test]
    fn test_later_tag_supersedes_earlier() {
        let mut store = mem_store(512, 4);
        let mut pair = MetadataPair::format(&mut store, [0, 1], Vec::new()).unwrap();
        pair.commit(&mut store, inline_entry(0, "a.bin", b"old"))
            .unwrap();
        pair.commit(
            &mut store,
            vec![Tag::new(TagType::StructInline, 0, b"new".to_vec())],
        )
        .unwrap();

        let reloaded = MetadataPair::load(&mut store, [0, 1]).unwrap();
        assert_eq!(
            reloaded.entries()[0].data,
            EntryData::Inline(b"new".to_vec())
        );
    }

    #[test]
    fn test_delete_tag_retires_slot() {
        let mut store = mem_store(512, 4);
        let mut pair = MetadataPair::format(&mut store, [0, 1], Vec::new()).unwrap();
        pair.commit(&mut store, inline_entry(0, "a.bin", b"abc"))
            .unwrap();
        pair.commit(&mut store, inline_entry(1, "b.bin", b"def"))
            .unwrap();
        pair.commit(&mut store, vec![Tag::delete(0)]).unwrap();

        let reloaded = MetadataPair::load(&mut store, [0, 1]).unwrap();
        assert_eq!(reloaded.entries().len(), 1);
        assert_eq!(reloaded.entries()[0].name, "b.bin");
        assert_eq!(reloaded.next_free_id(), 0);
    }

    #[test]
    fn test_torn_newer_half_recovers_older_state() {
        let mut store = mem_store(512, 4);
        let mut pair = MetadataPair::format(&mut store, [0, 1], Vec::new()).unwrap();
        pair.commit(&mut store, inline_entry(0, "a.bin", b"v1"))
            .unwrap();
        // rev 2 now lives in block 1; commit v2 into block 0 (rev 3).
        pair.commit(
            &mut store,
            vec![Tag::new(TagType::StructInline, 0, b"v2".to_vec())],
        )
        .unwrap();

        // Tear the newest half mid-commit: flip a byte inside its log.
        let mut newest = store.read_block(0).unwrap();
        newest[20] ^= 0xFF;
        store.write(0, 0, &newest).unwrap();

        let recovered = MetadataPair::load(&mut store, [0, 1]).unwrap();
        assert_eq!(recovered.revision(), 2);
        assert_eq!(
            recovered.entries()[0].data,
            EntryData::Inline(b"v1".to_vec())
        );
    }

    #[test]
    fn test_compaction_drops_superseded_history() {
        let mut store = mem_store(256, 4);
        let mut pair = MetadataPair::format(&mut store, [0, 1], Vec::new()).unwrap();
        pair.commit(&mut store, inline_entry(0, "a.bin", &[0u8; 40]))
            .unwrap();

        // Each rewrite adds ~48 bytes of history; a 256-byte block forces
        // compaction within a few commits.
        for round in 0..8u8 {
            pair.commit(
                &mut store,
                vec![Tag::new(TagType::StructInline, 0, vec![round; 40])],
            )
            .unwrap();
        }

        let reloaded = MetadataPair::load(&mut store, [0, 1]).unwrap();
        assert_eq!(reloaded.entries().len(), 1);
        assert_eq!(reloaded.entries()[0].data, EntryData::Inline(vec![7u8; 40]));
    }

    #[test]
    fn test_oversized_commit_fails_and_preserves_pair() {
        let mut store = mem_store(256, 4);
        let mut pair = MetadataPair::format(&mut store, [0, 1], Vec::new()).unwrap();
        pair.commit(&mut store, inline_entry(0, "a.bin", b"keep"))
            .unwrap();

        let result = pair.commit(&mut store, inline_entry(1, "big.bin", &[0u8; 400]));
        assert!(matches!(result, Err(LfsError::NoSpace)));

        let reloaded = MetadataPair::load(&mut store, [0, 1]).unwrap();
        assert_eq!(reloaded.entries().len(), 1);
        assert_eq!(reloaded.entries()[0].name, "a.bin");
    }

    #[test]
    fn test_multiple_commits_in_one_block_scan() {
        // A block can hold several CRC-closed regions; the scan should
        // accumulate all of them.
        let mut store = mem_store(512, 4);
        let mut pair = MetadataPair::format(&mut store, [0, 1], Vec::new()).unwrap();
        pair.commit(&mut store, inline_entry(0, "a.bin", b"1")).unwrap();

        // Hand-append a second commit after the first one in the active
        // block (block 1 after one commit).
        let buf = store.read_block(1).unwrap();
        let scanned = scan_block(&buf);
        let BlockScan::Valid { log_bytes, .. } = scanned else {
            panic!("expected valid block");
        };

        let extra = inline_entry(1, "b.bin", b"2");
        let mut tail = Vec::new();
        for tag in &extra {
            tag.encode_into(&mut tail);
        }
        let crc_tag = Tag::new(TagType::Crc, NO_ID, vec![0; 4]);
        tail.extend_from_slice(&crc_tag.header_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..log_bytes]);
        hasher.update(&tail);
        let crc = hasher.finalize();
        tail.extend_from_slice(&crc.to_le_bytes());
        store.write(1, log_bytes as u32, &tail).unwrap();

        let reloaded = MetadataPair::load(&mut store, [0, 1]).unwrap();
        assert_eq!(reloaded.entries().len(), 2);
    }
}
