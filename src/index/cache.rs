use crate::membership::types::NodeId;

#[derive(Debug, Clone)]
struct CacheEntry {
    path: String,
    owner: NodeId,
    last_accessed: u64,
}

/// Bounded cache of recent resolutions, evicting the least recently used.
///
/// Entries hold node ids, never node handles; every hit is checked against
/// the registry through the `liveness` callback before it is trusted.
#[derive(Debug)]
pub struct ResultCache {
    capacity: usize,
    entries: Vec<CacheEntry>,
    /// Logical clock bumped on every touch.
    clock: u64,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached owner of `path`.
    ///
    /// `liveness` answers `None` for nodes no longer registered and
    /// `Some(alive)` otherwise. Anything but a live owner drops the entry
    /// and reports a miss so the caller falls back to the trie.
    pub fn lookup(&mut self, path: &str, liveness: impl Fn(NodeId) -> Option<bool>) -> Option<NodeId> {
        let idx = self.entries.iter().position(|entry| entry.path == path)?;
        let owner = self.entries[idx].owner;

        if liveness(owner) != Some(true) {
            self.entries.remove(idx);
            tracing::debug!("Cache entry for {} dropped, {} not live", path, owner);
            return None;
        }

        self.clock += 1;
        self.entries[idx].last_accessed = self.clock;
        Some(owner)
    }

    pub fn insert(&mut self, path: &str, owner: NodeId) {
        if self.capacity == 0 {
            return;
        }

        self.clock += 1;
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.path == path) {
            entry.owner = owner;
            entry.last_accessed = self.clock;
            return;
        }

        if self.entries.len() >= self.capacity
            && let Some(oldest) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(idx, _)| idx)
        {
            let evicted = self.entries.remove(oldest);
            tracing::debug!("Cache full, evicted {}", evicted.path);
        }

        self.entries.push(CacheEntry {
            path: path.to_string(),
            owner,
            last_accessed: self.clock,
        });
    }

    pub fn invalidate(&mut self, path: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.path != path);
        before != self.entries.len()
    }

    /// Drops `path` and everything cached below it.
    pub fn invalidate_prefix(&mut self, path: &str) -> usize {
        let below = format!("{}/", path);
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.path != path && !entry.path.starts_with(&below));
        before - self.entries.len()
    }

    /// Drops every entry owned by `node`.
    pub fn invalidate_node(&mut self, node: NodeId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.owner != node);
        before - self.entries.len()
    }
}
