//! Superblock: the filesystem's root record
//!
//! Lives as a tag in the first metadata pair and carries the magic,
//! format version, geometry, and size limits. An image whose magic or
//! major version does not check out is rejected before anything else is
//! read.

use crate::error::{LfsError, Result};
use crate::metadata::{MetadataPair, PairAddr};
use crate::store::BlockStore;
use crate::tag::{Tag, TagType};

pub const MAGIC: [u8; 8] = *b"littlefs";
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 0;

pub const NAME_MAX: u32 = 255;
pub const FILE_MAX: u32 = 0x7FFF_FFFF;
pub const ATTR_MAX: u32 = 1022;

/// The superblock always lives in the first metadata pair.
pub const SUPERBLOCK_PAIR: PairAddr = [0, 1];

/// Encoded payload length of a superblock tag.
const SUPERBLOCK_LEN: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub version_major: u16,
    pub version_minor: u16,
    pub block_size: u32,
    pub block_count: u32,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
    pub root_pair: PairAddr,
}

impl Superblock {
    pub fn new(block_size: u32, block_count: u32, root_pair: PairAddr) -> Self {
        Superblock {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            block_size,
            block_count,
            name_max: NAME_MAX,
            file_max: FILE_MAX,
            attr_max: ATTR_MAX,
            root_pair,
        }
    }

    /// Largest file stored inline in metadata instead of a CTZ chain.
    pub fn inline_max(&self) -> u32 {
        self.attr_max.min(self.block_size / 4)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SUPERBLOCK_LEN);
        bytes.extend_from_slice(&MAGIC);
        let version = (self.version_major as u32) << 16 | self.version_minor as u32;
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes.extend_from_slice(&self.block_size.to_le_bytes());
        bytes.extend_from_slice(&self.block_count.to_le_bytes());
        bytes.extend_from_slice(&self.name_max.to_le_bytes());
        bytes.extend_from_slice(&self.file_max.to_le_bytes());
        bytes.extend_from_slice(&self.attr_max.to_le_bytes());
        bytes.extend_from_slice(&self.root_pair[0].to_le_bytes());
        bytes.extend_from_slice(&self.root_pair[1].to_le_bytes());
        bytes
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != SUPERBLOCK_LEN {
            return Err(LfsError::DetectionFailed(format!(
                "superblock payload is {} bytes, expected {}",
                data.len(),
                SUPERBLOCK_LEN
            )));
        }
        if data[0..8] != MAGIC {
            return Err(LfsError::DetectionFailed(
                "superblock magic mismatch".to_string(),
            ));
        }
        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let version = word(8);
        let version_major = (version >> 16) as u16;
        let version_minor = version as u16;
        if version_major != VERSION_MAJOR {
            return Err(LfsError::UnsupportedVersion {
                major: version_major,
                minor: version_minor,
            });
        }
        Ok(Superblock {
            version_major,
            version_minor,
            block_size: word(12),
            block_count: word(16),
            name_max: word(20),
            file_max: word(24),
            attr_max: word(28),
            root_pair: [word(32), word(36)],
        })
    }

    pub fn tag(&self) -> Tag {
        Tag::new(TagType::Superblock, 0, self.to_bytes())
    }

    /// Read and validate the superblock from a store's first pair.
    pub fn load(store: &mut BlockStore) -> Result<Self> {
        let pair = MetadataPair::load(store, SUPERBLOCK_PAIR)?;
        let tag = pair.superblock_tag().ok_or_else(|| {
            LfsError::DetectionFailed("first metadata pair carries no superblock".to_string())
        })?;
        let sb = Superblock::from_bytes(&tag.data)?;
        if sb.block_count > store.geometry().block_count {
            return Err(LfsError::DetectionFailed(format!(
                "superblock records {} blocks but the store holds {}",
                sb.block_count,
                store.geometry().block_count
            )));
        }
        Ok(sb)
    }
}
