//! Image-level operations
//!
//! Ties the store, metadata pairs, directory tree, CTZ chains, and the
//! allocator together into the archive-style operations: create, append,
//! list, extract, delete. Every mutation commits through the redundant
//! pair machinery, so an interrupted run leaves the previous authoritative
//! state intact.

use crate::alloc::BlockAllocator;
use crate::ctz;
use crate::dir::{self, Resolved};
use crate::error::{LfsError, Result};
use crate::metadata::{DirEntry, EntryData, MetadataPair, PairAddr};
use crate::store::{BlockStore, Geometry};
use crate::superblock::{Superblock, SUPERBLOCK_PAIR};
use crate::tag::Tag;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Root directory pair of a freshly formatted image.
const ROOT_PAIR: PairAddr = [2, 3];

/// One row of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Outcome of an operation that matched explicit names.
///
/// Per-name misses don't abort the operation; they are collected so the
/// caller can report each one and still fail the invocation.
#[derive(Debug, Default)]
pub struct OpReport {
    /// Paths the operation touched, in processing order
    pub affected: Vec<String>,
    /// Requested names with no matching entry
    pub missing: Vec<String>,
    /// Existing output files left alone (extract without overwrite)
    pub skipped: Vec<String>,
}

impl OpReport {
    pub fn ok(&self) -> bool {
        self.missing.is_empty() && self.skipped.is_empty()
    }
}

/// A mounted image: store plus validated superblock.
pub struct ImageEngine {
    store: BlockStore,
    sb: Superblock,
}

impl ImageEngine {
    /// Format a fresh image: superblock pair, empty root directory.
    pub fn create<P: AsRef<Path>>(
        path: P,
        image_bytes: u64,
        block_size: u32,
        offset: u64,
    ) -> Result<Self> {
        if image_bytes % block_size as u64 != 0 {
            return Err(LfsError::InvalidGeometry(format!(
                "image size {} is not a multiple of block size {}",
                image_bytes, block_size
            )));
        }
        let block_count = (image_bytes / block_size as u64) as u32;
        if block_count < 4 {
            return Err(LfsError::InvalidGeometry(format!(
                "{} blocks is too small: the superblock and root pairs need 4",
                block_count
            )));
        }
        let geometry = Geometry::new(block_size, block_count, offset)?;
        let mut store = BlockStore::create(path, geometry)?;

        let sb = Superblock::new(block_size, block_count, ROOT_PAIR);
        MetadataPair::format(&mut store, SUPERBLOCK_PAIR, vec![sb.tag()])?;
        MetadataPair::format(&mut store, ROOT_PAIR, Vec::new())?;
        store.sync()?;

        tracing::debug!(block_size, block_count, "formatted image");
        Ok(ImageEngine { store, sb })
    }

    /// Open an existing image, autodetecting block size when not given.
    pub fn open<P: AsRef<Path>>(
        path: P,
        block_size: Option<u32>,
        offset: Option<u64>,
    ) -> Result<Self> {
        let (store, sb) = BlockStore::detect(path, block_size, offset)?;
        Ok(ImageEngine { store, sb })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn geometry(&self) -> Geometry {
        self.store.geometry()
    }

    /// Enumerate every entry, depth-first.
    pub fn list(&mut self) -> Result<Vec<ListEntry>> {
        let entries = dir::list(&mut self.store, self.sb.root_pair)?;
        Ok(entries
            .into_iter()
            .map(|(path, entry)| ListEntry {
                path,
                is_dir: entry.is_dir(),
                size: entry.size(),
            })
            .collect())
    }

    /// Read one file's full content.
    pub fn read(&mut self, path: &str) -> Result<Vec<u8>> {
        let name = normalize(path);
        match dir::resolve(&mut self.store, self.sb.root_pair, &name)? {
            Resolved::Entry { entry, .. } => match entry.data {
                EntryData::Inline(content) => Ok(content),
                EntryData::Ctz { head, size } => ctz::read_all(&mut self.store, head, size),
                EntryData::Dir(_) => Err(LfsError::NotFound(format!("{} is a directory", name))),
            },
            Resolved::Root | Resolved::NotFound => Err(LfsError::NotFound(name)),
        }
    }

    /// Insert host files into the image.
    ///
    /// `sources` maps a host file to its image path. With `replace` unset
    /// an existing entry is a [`LfsError::NameConflict`]; with it set the
    /// entry's tags are superseded and its old blocks become reclaimable
    /// by later allocation passes.
    pub fn insert(&mut self, sources: &[(PathBuf, String)], replace: bool) -> Result<Vec<String>> {
        // One free-set computation covers the whole batch.
        let mut allocator = BlockAllocator::from_tree(&mut self.store, &self.sb)?;
        let mut added = Vec::with_capacity(sources.len());
        for (host, image_path) in sources {
            self.insert_one(&mut allocator, host, image_path, replace)?;
            added.push(normalize(image_path));
        }
        self.store.sync()?;
        Ok(added)
    }

    fn insert_one(
        &mut self,
        allocator: &mut BlockAllocator,
        host: &Path,
        image_path: &str,
        replace: bool,
    ) -> Result<()> {
        let parts = dir::components(image_path)?;
        let Some((name, parents)) = parts.split_last() else {
            return Err(LfsError::InvalidPath(format!(
                "cannot insert at the root itself: {}",
                image_path
            )));
        };
        if name.len() > self.sb.name_max as usize {
            return Err(LfsError::InvalidPath(format!(
                "name longer than {} bytes: {}",
                self.sb.name_max, name
            )));
        }

        let mut cur = self.sb.root_pair;
        for part in parents {
            cur = self.ensure_dir(allocator, cur, part)?;
        }

        let mut pair = MetadataPair::load(&mut self.store, cur)?;
        let id = match pair.find(name) {
            Some(existing) if !replace || existing.is_dir() => {
                return Err(LfsError::NameConflict(image_path.to_string()));
            }
            Some(existing) => existing.id,
            None => pair.next_free_id(),
        };

        let mut file = File::open(host)?;
        let len = file.metadata()?.len();
        if len > self.sb.file_max as u64 {
            return Err(LfsError::InvalidGeometry(format!(
                "{} is {} bytes, over the {}-byte file limit",
                host.display(),
                len,
                self.sb.file_max
            )));
        }

        let data = if len <= self.sb.inline_max() as u64 {
            let mut content = Vec::with_capacity(len as usize);
            file.read_to_end(&mut content)?;
            EntryData::Inline(content)
        } else {
            let (head, size) = ctz::build(&mut self.store, allocator, &mut file)?;
            EntryData::Ctz { head, size }
        };

        pair.commit(
            &mut self.store,
            MetadataPair::entry_tags(id, name, &data),
        )
    }

    /// Find `name` under `parent`, creating the directory if absent.
    fn ensure_dir(
        &mut self,
        allocator: &mut BlockAllocator,
        parent: PairAddr,
        name: &str,
    ) -> Result<PairAddr> {
        let mut pair = MetadataPair::load(&mut self.store, parent)?;
        if let Some(entry) = pair.find(name) {
            return match entry.data {
                EntryData::Dir(child) => Ok(child),
                _ => Err(LfsError::NameConflict(name.to_string())),
            };
        }

        let blocks = allocator.allocate_many(2)?;
        let addr = [blocks[0], blocks[1]];
        MetadataPair::format(&mut self.store, addr, Vec::new())?;
        let id = pair.next_free_id();
        pair.commit(
            &mut self.store,
            MetadataPair::entry_tags(id, name, &EntryData::Dir(addr)),
        )?;
        Ok(addr)
    }

    /// Extract entries into `out_dir`.
    ///
    /// An empty `names` extracts everything. A name matching a directory
    /// extracts its whole subtree. Existing output files are skipped
    /// unless `overwrite` is set; requested names with no match are
    /// reported, not silently dropped.
    pub fn extract(
        &mut self,
        names: &[String],
        out_dir: &Path,
        overwrite: bool,
    ) -> Result<OpReport> {
        let wanted: Vec<String> = names.iter().map(|n| normalize(n)).collect();
        let listing = dir::list(&mut self.store, self.sb.root_pair)?;

        let mut matched = vec![false; wanted.len()];
        let mut report = OpReport::default();

        for (path, entry) in listing {
            let selected = if wanted.is_empty() {
                true
            } else {
                let mut hit = false;
                for (i, want) in wanted.iter().enumerate() {
                    if *want == path || path.starts_with(&format!("{}/", want)) {
                        matched[i] = true;
                        hit = true;
                    }
                }
                hit
            };
            if !selected {
                continue;
            }

            let target = out_dir.join(&path);
            if entry.is_dir() {
                std::fs::create_dir_all(&target)?;
                report.affected.push(path);
            } else if self.write_output(&entry, &target, overwrite)? {
                report.affected.push(path);
            } else {
                tracing::warn!(%path, "output exists, not overwriting");
                report.skipped.push(path);
            }
        }

        for (i, want) in wanted.iter().enumerate() {
            if !matched[i] {
                report.missing.push(want.clone());
            }
        }
        Ok(report)
    }

    /// Write one file entry to `target`; `Ok(false)` means an existing
    /// file was left alone. A failed write removes the partial output
    /// before the error propagates.
    fn write_output(&mut self, entry: &DirEntry, target: &Path, overwrite: bool) -> Result<bool> {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if target.exists() && !overwrite {
            return Ok(false);
        }

        let mut out = File::create(target)?;
        let result = match &entry.data {
            EntryData::Inline(content) => out.write_all(content).map_err(LfsError::from),
            EntryData::Ctz { head, size } => ctz::copy_to(&mut self.store, *head, *size, &mut out),
            EntryData::Dir(_) => unreachable!("directories are handled by the caller"),
        }
        .and_then(|_| out.flush().map_err(LfsError::from));
        drop(out);

        if let Err(err) = result {
            let _ = std::fs::remove_file(target);
            return Err(err);
        }
        Ok(true)
    }

    /// Delete named entries.
    ///
    /// Each match gets a delete-marker commit in its parent pair; the
    /// marker supersedes the entry and is dropped at the pair's next
    /// compaction. Deleting a directory unreferences its whole subtree.
    /// Freed blocks are not zeroed; they become allocatable in later
    /// passes.
    pub fn delete(&mut self, names: &[String]) -> Result<OpReport> {
        let mut report = OpReport::default();
        for name in names {
            let path = normalize(name);
            match dir::resolve(&mut self.store, self.sb.root_pair, &path)? {
                Resolved::Entry { parent, entry } => {
                    let mut pair = MetadataPair::load(&mut self.store, parent)?;
                    pair.commit(&mut self.store, vec![Tag::delete(entry.id)])?;
                    report.affected.push(path);
                }
                Resolved::Root | Resolved::NotFound => report.missing.push(path),
            }
        }
        self.store.sync()?;
        Ok(report)
    }
}

/// Strip the `./` spelling users naturally type for image paths.
fn normalize(name: &str) -> String {
    let mut s = name;
    while let Some(rest) = s.strip_prefix("./") {
        s = rest;
    }
    s.trim_matches('/').to_string()
}
