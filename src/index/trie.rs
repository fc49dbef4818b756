//! Byte-keyed path trie.
//!
//! Every namespace path is stored byte by byte; the node reached by the last
//! byte carries the [`PathEntry`]. Deletion never unlinks nodes, it only sets
//! the tombstone flag, so a path can be revived when its owner comes back.
//!
//! Cascades (tombstone, revive, prefix enumeration) follow path components:
//! the subtree of `/a` is `/a` itself plus everything below `/a/`, never `/ab`.

use std::collections::BTreeMap;

use crate::membership::types::{BACKUP_SLOTS, NodeId};

/// Prefix of the private namespaces holding backup shadow entries.
pub const SHADOW_PREFIX: &str = "#backup";

const SEPARATOR: u8 = b'/';

/// Trie key of `path` inside the shadow namespace of backup `slot` (0-based).
pub fn shadow_key(slot: usize, path: &str) -> String {
    debug_assert!(slot < BACKUP_SLOTS);
    format!("{}{}{}", SHADOW_PREFIX, slot + 1, normalize(path))
}

/// Drops trailing separators. The namespace root normalizes to `""`.
pub fn normalize(path: &str) -> &str {
    path.trim_end_matches('/')
}

/// Parent directory of `path`, `""` for top-level entries.
pub fn parent(path: &str) -> &str {
    let path = normalize(path);
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Last component of `path`.
pub fn basename(path: &str) -> &str {
    let path = normalize(path);
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEntry {
    /// Weak reference to the owning node. `None` after that node was evicted.
    pub owner: Option<NodeId>,
    pub is_directory: bool,
    pub deleted: bool,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: BTreeMap<u8, TrieNode>,
    entry: Option<PathEntry>,
}

impl TrieNode {
    fn is_tombstoned(&self) -> bool {
        self.entry.is_some_and(|entry| entry.deleted)
    }
}

#[derive(Debug, Default)]
pub struct PathTrie {
    root: TrieNode,
    entries: usize,
}

impl PathTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of terminal entries, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Inserts or refreshes `path`. The entry ends up live, owned by `owner`.
    pub fn insert(&mut self, path: &str, owner: NodeId, is_directory: bool) {
        let path = normalize(path);
        if path.is_empty() {
            return;
        }

        let mut current = &mut self.root;
        for byte in path.bytes() {
            current = current.children.entry(byte).or_default();
        }

        if current.entry.is_none() {
            self.entries += 1;
        }
        current.entry = Some(PathEntry {
            owner: Some(owner),
            is_directory,
            deleted: false,
        });
    }

    /// Entry stored at `path`, regardless of tombstones or liveness.
    pub fn lookup(&self, path: &str) -> Option<PathEntry> {
        let mut current = &self.root;
        for byte in normalize(path).bytes() {
            current = current.children.get(&byte)?;
        }
        current.entry
    }

    /// `Some(is_directory)` when `path` is a live, non-tombstoned entry.
    pub fn is_directory(&self, path: &str) -> Option<bool> {
        self.lookup(path)
            .filter(|entry| !entry.deleted)
            .map(|entry| entry.is_directory)
    }

    /// Owner of `path` if the path is reachable without crossing a tombstone
    /// and its owner is still live according to `is_live`.
    pub fn resolve(&self, path: &str, is_live: impl Fn(NodeId) -> bool) -> Option<NodeId> {
        let node = self.walk(normalize(path))?;
        Self::live_owner(node, is_live)
    }

    /// Like [`resolve`](Self::resolve), then tombstones the whole subtree.
    /// Returns the owner as it resolved before the tombstone.
    pub fn resolve_for_delete(
        &mut self,
        path: &str,
        is_live: impl Fn(NodeId) -> bool,
    ) -> Option<NodeId> {
        let node = self.walk_mut(normalize(path))?;
        let owner = Self::live_owner(node, is_live)?;
        let count = tombstone(node);
        tracing::debug!("Tombstoned {} entries under {}", count, path);
        Some(owner)
    }

    /// Tombstones the subtree at `path` unconditionally. Returns the number
    /// of entries that changed state.
    pub fn tombstone(&mut self, path: &str) -> usize {
        let path = normalize(path);
        let mut current = &mut self.root;
        for byte in path.bytes() {
            match current.children.get_mut(&byte) {
                Some(next) => current = next,
                None => return 0,
            }
        }
        tombstone(current)
    }

    /// Tombstones the entry at `path` alone. Descendants stay untouched but
    /// become unreachable while it is deleted.
    pub fn mark_deleted(&mut self, path: &str) -> bool {
        let path = normalize(path);
        let mut current = &mut self.root;
        for byte in path.bytes() {
            match current.children.get_mut(&byte) {
                Some(next) => current = next,
                None => return false,
            }
        }
        match current.entry.as_mut() {
            Some(entry) if !entry.deleted => {
                entry.deleted = true;
                true
            }
            _ => false,
        }
    }

    /// Clears the tombstone on `path` and on every descendant held by the
    /// same owner. Returns that owner.
    pub fn revive(&mut self, path: &str) -> Option<NodeId> {
        let path = normalize(path);
        let mut current = &mut self.root;
        for byte in path.bytes() {
            current = current.children.get_mut(&byte)?;
        }

        let entry = current.entry.as_mut()?;
        entry.deleted = false;
        let owner = entry.owner?;

        let mut stack: Vec<&mut TrieNode> = current.children.get_mut(&SEPARATOR).into_iter().collect();
        while let Some(node) = stack.pop() {
            if let Some(entry) = node.entry.as_mut()
                && entry.owner == Some(owner)
            {
                entry.deleted = false;
            }
            stack.extend(node.children.values_mut());
        }

        Some(owner)
    }

    /// Every non-tombstoned path at or below `prefix`, in byte order.
    /// Directories are skipped unless `include_directories` is set.
    pub fn prefix_search(&self, prefix: &str, include_directories: bool) -> Vec<String> {
        let prefix = normalize(prefix);
        let Some(start) = self.walk(prefix) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        if let Some(entry) = start.entry {
            if entry.deleted {
                return found;
            }
            if include_directories || !entry.is_directory {
                found.push(prefix.to_string());
            }
        }

        if let Some(below) = start.children.get(&SEPARATOR) {
            let mut base = prefix.as_bytes().to_vec();
            base.push(SEPARATOR);
            let mut below_found = Vec::new();
            collect(below, base, &mut below_found, |entry| {
                include_directories || !entry.is_directory
            });
            found.extend(below_found.into_iter().map(|(path, _)| path));
        }

        found
    }

    /// Public namespace entries whose path contains `filter`, for LIST.
    ///
    /// Shadow namespaces are never listed. Tombstoned entries, entries under
    /// a tombstoned directory and entries whose owner is not live are skipped.
    pub fn list(&self, filter: &str, is_live: impl Fn(NodeId) -> bool) -> Vec<(String, bool)> {
        let Some(top) = self.root.children.get(&SEPARATOR) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        collect(top, vec![SEPARATOR], &mut found, |entry| {
            entry.owner.is_some_and(&is_live)
        });

        found
            .into_iter()
            .filter(|(path, _)| path.contains(filter))
            .map(|(path, entry)| (path, entry.is_directory))
            .collect()
    }

    /// Drops every owner reference to `node`. The paths stay in the trie
    /// but no longer resolve until someone inserts them again.
    pub fn clear_owner(&mut self, node: NodeId) -> usize {
        let mut cleared = 0;
        let mut stack = vec![&mut self.root];
        while let Some(current) = stack.pop() {
            if let Some(entry) = current.entry.as_mut()
                && entry.owner == Some(node)
            {
                entry.owner = None;
                cleared += 1;
            }
            stack.extend(current.children.values_mut());
        }
        cleared
    }

    fn live_owner(node: &TrieNode, is_live: impl Fn(NodeId) -> bool) -> Option<NodeId> {
        let entry = node.entry?;
        if entry.deleted {
            return None;
        }
        entry.owner.filter(|owner| is_live(*owner))
    }

    /// Walks to `path`, failing at the first tombstoned component on the way.
    fn walk(&self, path: &str) -> Option<&TrieNode> {
        let mut current = &self.root;
        for (idx, byte) in path.bytes().enumerate() {
            if byte == SEPARATOR && idx > 0 && current.is_tombstoned() {
                return None;
            }
            current = current.children.get(&byte)?;
        }
        Some(current)
    }

    fn walk_mut(&mut self, path: &str) -> Option<&mut TrieNode> {
        let mut current = &mut self.root;
        for (idx, byte) in path.bytes().enumerate() {
            if byte == SEPARATOR && idx > 0 && current.is_tombstoned() {
                return None;
            }
            current = current.children.get_mut(&byte)?;
        }
        Some(current)
    }
}

fn tombstone(node: &mut TrieNode) -> usize {
    let mut count = 0;
    if let Some(entry) = node.entry.as_mut()
        && !entry.deleted
    {
        entry.deleted = true;
        count += 1;
    }

    let mut stack: Vec<&mut TrieNode> = node.children.get_mut(&SEPARATOR).into_iter().collect();
    while let Some(current) = stack.pop() {
        if let Some(entry) = current.entry.as_mut()
            && !entry.deleted
        {
            entry.deleted = true;
            count += 1;
        }
        stack.extend(current.children.values_mut());
    }
    count
}

/// Depth-first collection of live paths below `start`, whose own key is
/// `base`. Children of a tombstoned entry's separator are not visited.
fn collect(
    start: &TrieNode,
    base: Vec<u8>,
    found: &mut Vec<(String, PathEntry)>,
    keep: impl Fn(&PathEntry) -> bool,
) {
    let mut stack = vec![(start, base)];
    while let Some((node, key)) = stack.pop() {
        if let Some(entry) = node.entry
            && !entry.deleted
            && keep(&entry)
        {
            found.push((String::from_utf8_lossy(&key).into_owned(), entry));
        }

        // Reverse so the stack pops children in byte order.
        for (byte, child) in node.children.iter().rev() {
            if *byte == SEPARATOR && node.is_tombstoned() {
                continue;
            }
            let mut child_key = key.clone();
            child_key.push(*byte);
            stack.push((child, child_key));
        }
    }
}
