//! Block-level access to a filesystem image backing store
//!
//! A [`BlockStore`] maps logical block numbers to byte ranges of a backing
//! file (or an in-memory buffer), given a block size, block count, and a
//! byte offset into the backing store. The offset supports images embedded
//! inside a larger container (a partition table, a firmware blob).

use crate::error::{LfsError, Result};
use crate::superblock::Superblock;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Smallest block size worth probing; metadata needs room for a commit.
pub const BLOCK_SIZE_MIN: u32 = 128;

/// Largest block size considered during autodetection.
pub const BLOCK_SIZE_MAX: u32 = 16 * 1024 * 1024;

/// Image geometry: how logical blocks map onto the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Block size in bytes (power of two)
    pub block_size: u32,

    /// Total number of blocks addressable in the backing store
    pub block_count: u32,

    /// Byte offset of block 0 within the backing store
    pub offset: u64,
}

impl Geometry {
    pub fn new(block_size: u32, block_count: u32, offset: u64) -> Result<Self> {
        if block_size < BLOCK_SIZE_MIN || !block_size.is_power_of_two() {
            return Err(LfsError::InvalidGeometry(format!(
                "block size {} must be a power of two >= {}",
                block_size, BLOCK_SIZE_MIN
            )));
        }
        if block_count < 2 {
            return Err(LfsError::InvalidGeometry(format!(
                "image holds {} blocks, need at least 2 for the superblock pair",
                block_count
            )));
        }
        Ok(Geometry {
            block_size,
            block_count,
            offset,
        })
    }

    /// Total bytes spanned by the image, excluding the leading offset.
    pub fn image_bytes(&self) -> u64 {
        self.block_size as u64 * self.block_count as u64
    }
}

enum Backing {
    File(std::fs::File),
    Memory(Vec<u8>),
}

/// Random-access block storage over a file or an in-memory image.
pub struct BlockStore {
    backing: Backing,
    geometry: Geometry,
}

impl BlockStore {
    /// Open an existing image file with explicit geometry.
    pub fn open<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < geometry.offset + geometry.image_bytes() {
            return Err(LfsError::InvalidGeometry(format!(
                "backing store is {} bytes, image needs {} at offset {}",
                len,
                geometry.image_bytes(),
                geometry.offset
            )));
        }
        Ok(BlockStore {
            backing: Backing::File(file),
            geometry,
        })
    }

    /// Create (or extend) an image file covering the given geometry.
    ///
    /// An existing file is never truncated: creating an image at an offset
    /// inside a larger container must leave the container's other contents
    /// alone.
    pub fn create<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let needed = geometry.offset + geometry.image_bytes();
        if file.metadata()?.len() < needed {
            file.set_len(needed)?;
        }
        Ok(BlockStore {
            backing: Backing::File(file),
            geometry,
        })
    }

    /// An in-memory image, erased to 0xFF like fresh flash.
    pub fn memory(geometry: Geometry) -> Self {
        let len = geometry.offset + geometry.image_bytes();
        BlockStore {
            backing: Backing::Memory(vec![0xFF; len as usize]),
            geometry,
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn check(&self, block: u32, off: u32, len: usize) -> Result<u64> {
        if block >= self.geometry.block_count {
            return Err(LfsError::OutOfRange {
                block,
                count: self.geometry.block_count,
            });
        }
        if off as u64 + len as u64 > self.geometry.block_size as u64 {
            return Err(LfsError::InvalidGeometry(format!(
                "access [{}, {}) runs past end of block {}",
                off,
                off as u64 + len as u64,
                block
            )));
        }
        Ok(self.geometry.offset + block as u64 * self.geometry.block_size as u64 + off as u64)
    }

    /// Read `buf.len()` bytes from `block` starting at byte `off`.
    pub fn read_into(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        let pos = self.check(block, off, buf.len())?;
        match &mut self.backing {
            Backing::File(file) => {
                file.seek(SeekFrom::Start(pos))?;
                file.read_exact(buf)?;
            }
            Backing::Memory(mem) => {
                buf.copy_from_slice(&mem[pos as usize..pos as usize + buf.len()]);
            }
        }
        Ok(())
    }

    /// Read `len` bytes from `block` starting at byte `off`.
    pub fn read(&mut self, block: u32, off: u32, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(block, off, &mut buf)?;
        Ok(buf)
    }

    /// Read one whole block.
    pub fn read_block(&mut self, block: u32) -> Result<Vec<u8>> {
        self.read(block, 0, self.geometry.block_size as usize)
    }

    /// Write `data` into `block` starting at byte `off`.
    pub fn write(&mut self, block: u32, off: u32, data: &[u8]) -> Result<()> {
        let pos = self.check(block, off, data.len())?;
        match &mut self.backing {
            Backing::File(file) => {
                file.seek(SeekFrom::Start(pos))?;
                file.write_all(data)?;
            }
            Backing::Memory(mem) => {
                mem[pos as usize..pos as usize + data.len()].copy_from_slice(data);
            }
        }
        Ok(())
    }

    /// Flush pending writes to the backing store.
    pub fn sync(&mut self) -> Result<()> {
        if let Backing::File(file) = &mut self.backing {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Open an image, detecting block size when not supplied.
    ///
    /// Detection probes power-of-two candidate block sizes from
    /// [`BLOCK_SIZE_MIN`] up to [`BLOCK_SIZE_MAX`], accepting the first
    /// candidate whose superblock pair validates (magic, version, CRC) and
    /// whose recorded block size agrees. Without an explicit `offset` the
    /// probe is restricted to offset 0: a store embedded at a non-zero
    /// offset must be opened with that offset supplied, never misdetected.
    pub fn detect<P: AsRef<Path>>(
        path: P,
        block_size: Option<u32>,
        offset: Option<u64>,
    ) -> Result<(Self, Superblock)> {
        let path = path.as_ref();
        let len = std::fs::metadata(path)?.len();
        let offset = offset.unwrap_or(0);
        if len <= offset {
            return Err(LfsError::InvalidGeometry(format!(
                "offset {} is past the end of the {}-byte backing store",
                offset, len
            )));
        }
        let avail = len - offset;

        if let Some(block_size) = block_size {
            let geometry = Geometry::new(block_size, (avail / block_size as u64) as u32, offset)?;
            let mut store = BlockStore::open(path, geometry)?;
            let sb = Superblock::load(&mut store)?;
            if sb.block_size != block_size {
                return Err(LfsError::DetectionFailed(format!(
                    "superblock records block size {}, not {}",
                    sb.block_size, block_size
                )));
            }
            return Ok((store, sb));
        }

        let mut candidate = BLOCK_SIZE_MIN;
        while candidate as u64 * 2 <= avail && candidate <= BLOCK_SIZE_MAX {
            let geometry = Geometry::new(candidate, (avail / candidate as u64) as u32, offset)?;
            let mut store = BlockStore::open(path, geometry)?;
            match Superblock::load(&mut store) {
                Ok(sb) if sb.block_size == candidate => {
                    tracing::debug!(block_size = candidate, "superblock validated");
                    return Ok((store, sb));
                }
                Ok(sb) => {
                    tracing::debug!(
                        probed = candidate,
                        recorded = sb.block_size,
                        "superblock block size disagrees with probe"
                    );
                }
                Err(err) => {
                    tracing::debug!(block_size = candidate, %err, "probe failed");
                }
            }
            candidate *= 2;
        }

        Err(LfsError::DetectionFailed(format!(
            "no valid superblock at any block size in [{}, {}] at offset {}",
            BLOCK_SIZE_MIN, BLOCK_SIZE_MAX, offset
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom(block_size: u32, block_count: u32) -> Geometry {
        Geometry::new(block_size, block_count, 0).unwrap()
    }

    #[test]
    fn test_geometry_rejects_non_power_of_two() {
        assert!(matches!(
            Geometry::new(1000, 16, 0),
            Err(LfsError::InvalidGeometry(_))
        ));
        assert!(matches!(
            Geometry::new(64, 16, 0),
            Err(LfsError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_memory_store_round_trip() {
        let mut store = BlockStore::memory(geom(512, 8));
        store.write(3, 100, b"hello").unwrap();
        let read = store.read(3, 100, 5).unwrap();
        assert_eq!(&read, b"hello");
    }

    #[test]
    fn test_memory_store_erased_state() {
        let mut store = BlockStore::memory(geom(512, 8));
        let block = store.read_block(7).unwrap();
        assert!(block.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_read_out_of_range() {
        let mut store = BlockStore::memory(geom(512, 8));
        assert!(matches!(
            store.read(8, 0, 1),
            Err(LfsError::OutOfRange { block: 8, count: 8 })
        ));
    }

    #[test]
    fn test_read_past_end_of_block() {
        let mut store = BlockStore::memory(geom(512, 8));
        assert!(store.read(0, 508, 8).is_err());
    }

    #[test]
    fn test_file_store_with_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.img");
        let geometry = Geometry::new(512, 4, 1024).unwrap();
        {
            let mut store = BlockStore::create(&path, geometry).unwrap();
            store.write(0, 0, b"at-offset").unwrap();
            store.sync().unwrap();
        }
        // Block 0 starts at byte 1024 of the file.
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[1024..1033], b"at-offset");

        let mut reopened = BlockStore::open(&path, geometry).unwrap();
        assert_eq!(reopened.read(0, 0, 9).unwrap(), b"at-offset");
    }

    #[test]
    fn test_create_does_not_truncate_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container.bin");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();

        let geometry = Geometry::new(512, 4, 2048).unwrap();
        BlockStore::create(&path, geometry).unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert!(raw[..2048].iter().all(|&b| b == 0xAB));
    }
}
