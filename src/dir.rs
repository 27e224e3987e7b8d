//! Directory tree navigation
//!
//! Directories form a graph of metadata pairs reachable from the
//! superblock's root pair. Nodes are only ever identified by their
//! on-disk pair address and re-read through the store; nothing here holds
//! in-memory links between directories. The format forbids a directory
//! referencing an ancestor, so a revisited or out-of-range pair address is
//! a malformed tree, not a traversal to follow.

use crate::error::{LfsError, Result};
use crate::metadata::{DirEntry, EntryData, MetadataPair, PairAddr};
use crate::store::BlockStore;
use std::collections::HashSet;

/// Where a path resolved to.
pub enum Resolved {
    /// The empty path: the root directory itself
    Root,
    /// An entry and the pair that holds it
    Entry { parent: PairAddr, entry: DirEntry },
    NotFound,
}

fn check_pair(store: &BlockStore, addr: PairAddr) -> Result<()> {
    let count = store.geometry().block_count;
    if addr[0] >= count || addr[1] >= count || addr[0] == addr[1] {
        return Err(LfsError::MalformedTree(format!(
            "invalid pair address {{{}, {}}}",
            addr[0], addr[1]
        )));
    }
    Ok(())
}

/// Split an image path into components, rejecting anything that could
/// escape the tree.
pub fn components(path: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(LfsError::InvalidPath(format!(
                    "'..' not allowed in image paths: {}",
                    path
                )))
            }
            _ => parts.push(part),
        }
    }
    Ok(parts)
}

/// Resolve a '/'-joined path against the tree rooted at `root`.
pub fn resolve(store: &mut BlockStore, root: PairAddr, path: &str) -> Result<Resolved> {
    let parts = components(path)?;
    if parts.is_empty() {
        return Ok(Resolved::Root);
    }

    let mut visited = HashSet::new();
    let mut cur = root;
    for (depth, part) in parts.iter().enumerate() {
        check_pair(store, cur)?;
        if !visited.insert(cur) {
            return Err(LfsError::MalformedTree(format!(
                "pair {{{}, {}}} revisited while resolving {}",
                cur[0], cur[1], path
            )));
        }
        let pair = MetadataPair::load(store, cur)?;
        let Some(entry) = pair.find(part) else {
            return Ok(Resolved::NotFound);
        };
        if depth == parts.len() - 1 {
            return Ok(Resolved::Entry {
                parent: cur,
                entry: entry.clone(),
            });
        }
        match entry.data {
            EntryData::Dir(child) => cur = child,
            // A file in the middle of a path dead-ends the walk.
            _ => return Ok(Resolved::NotFound),
        }
    }
    unreachable!()
}

/// Depth-first walk of every entry under `root`.
///
/// Visits each entry (preorder: a directory before its children) with its
/// '/'-joined path; the root itself has an empty prefix and is not
/// visited. Restart by calling again; the traversal always starts from
/// the persistent store.
pub fn walk(
    store: &mut BlockStore,
    root: PairAddr,
    f: &mut impl FnMut(&str, &DirEntry) -> Result<()>,
) -> Result<()> {
    let mut visited = HashSet::new();
    walk_inner(store, root, "", &mut visited, f)
}

fn walk_inner(
    store: &mut BlockStore,
    addr: PairAddr,
    prefix: &str,
    visited: &mut HashSet<PairAddr>,
    f: &mut impl FnMut(&str, &DirEntry) -> Result<()>,
) -> Result<()> {
    check_pair(store, addr)?;
    if !visited.insert(addr) {
        return Err(LfsError::MalformedTree(format!(
            "pair {{{}, {}}} revisited during traversal",
            addr[0], addr[1]
        )));
    }

    let pair = MetadataPair::load(store, addr)?;
    for entry in pair.entries().to_vec() {
        let path = if prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", prefix, entry.name)
        };
        f(&path, &entry)?;
        if let EntryData::Dir(child) = entry.data {
            walk_inner(store, child, &path, visited, f)?;
        }
    }
    Ok(())
}

/// Collect the full (path, entry) enumeration in traversal order.
pub fn list(store: &mut BlockStore, root: PairAddr) -> Result<Vec<(String, DirEntry)>> {
    let mut out = Vec::new();
    walk(store, root, &mut |path, entry| {
        out.push((path.to_string(), entry.clone()));
        Ok(())
    })?;
    Ok(out)
}
