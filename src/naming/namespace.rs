//! The naming server's metadata ensemble.
//!
//! Trie, registry and cache change together (a node going down touches all
//! three), so they live behind one coarse lock. Holders never await peer I/O
//! while the guard is alive.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::sync::{Mutex, MutexGuard};

use crate::index::cache::ResultCache;
use crate::index::trie::{PathTrie, shadow_key};
use crate::membership::registry::{NodeRegistry, Registration};
use crate::membership::types::{BACKUP_SLOTS, ControlHandle, NodeId, StorageNode};

/// Where a client request for a path should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Primary(NodeId),
    /// The primary is unreachable; `node` holds the copy of backup `slot`.
    Backup { slot: usize, node: NodeId },
}

impl Resolution {
    pub fn node(&self) -> NodeId {
        match self {
            Resolution::Primary(node) | Resolution::Backup { node, .. } => *node,
        }
    }
}

/// A trie entry to record once the copy backing it has been acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    pub key: String,
    pub owner: NodeId,
    pub is_directory: bool,
    /// Whether the path also joins the owner's owned list (false for shadows).
    pub owned: bool,
}

impl PathRecord {
    pub fn primary(path: &str, owner: NodeId, is_directory: bool) -> Self {
        Self {
            key: path.to_string(),
            owner,
            is_directory,
            owned: true,
        }
    }

    pub fn shadow(slot: usize, path: &str, backup: NodeId, is_directory: bool) -> Self {
        Self {
            key: shadow_key(slot, path),
            owner: backup,
            is_directory,
            owned: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceStats {
    pub nodes: usize,
    pub live_nodes: usize,
    pub entries: usize,
    pub cached: usize,
    pub cache_capacity: usize,
}

pub struct NamespaceState {
    pub trie: PathTrie,
    pub registry: NodeRegistry,
    pub cache: ResultCache,
}

impl NamespaceState {
    pub fn new(cache_capacity: usize, replication_factor: usize) -> Self {
        Self {
            trie: PathTrie::new(),
            registry: NodeRegistry::new(replication_factor),
            cache: ResultCache::new(cache_capacity),
        }
    }

    /// Owner of the public `path`: cache first, then the trie. Trie hits are
    /// cached.
    pub fn resolve_primary(&mut self, path: &str) -> Option<NodeId> {
        let registry = &self.registry;
        if let Some(owner) = self.cache.lookup(path, |id| registry.liveness(id)) {
            return Some(owner);
        }

        let owner = self.trie.resolve(path, |id| registry.is_alive(id))?;
        self.cache.insert(path, owner);
        Some(owner)
    }

    /// Like [`resolve_primary`](Self::resolve_primary), falling back to the
    /// backup shadows in slot order. Backup answers are never cached.
    pub fn resolve(&mut self, path: &str) -> Option<Resolution> {
        if let Some(owner) = self.resolve_primary(path) {
            return Some(Resolution::Primary(owner));
        }

        (0..BACKUP_SLOTS).find_map(|slot| {
            let node = self
                .trie
                .resolve(&shadow_key(slot, path), |id| self.registry.is_alive(id))?;
            tracing::debug!("{} served from backup slot {} on {}", path, slot + 1, node);
            Some(Resolution::Backup { slot, node })
        })
    }

    pub fn addr_of(&self, id: NodeId) -> Option<SocketAddr> {
        self.registry.addr_of(id)
    }

    /// Registers (or revives) the node at `addr` together with the paths it
    /// reported.
    ///
    /// A returning node gets its previously owned paths revived first. A
    /// reported path already owned by another registered node is a replica
    /// and is not claimed.
    pub fn register(
        &mut self,
        addr: SocketAddr,
        control: Option<ControlHandle>,
        listing: &[(String, bool)],
    ) -> Registration {
        let registration = self.registry.register(addr, control);
        let id = registration.id();

        if let Registration::Rejoined(_) = registration {
            let owned = self
                .registry
                .get(id)
                .map(|node| node.owned_paths.clone())
                .unwrap_or_default();
            let revived = owned
                .iter()
                .filter(|path| self.trie.revive(path).is_some())
                .count();
            tracing::info!("Revived {} paths of {}", revived, id);
        }

        let mut claimed = 0;
        for (path, is_directory) in listing {
            if let Some(owner) = self.trie.lookup(path).and_then(|entry| entry.owner)
                && owner != id
                && self.registry.get(owner).is_some()
            {
                tracing::debug!("{} reported {} held by {}, not claiming", id, path, owner);
                continue;
            }
            self.trie.insert(path, id, *is_directory);
            self.registry.add_owned_path(id, path);
            claimed += 1;
        }

        tracing::info!("{} claimed {} of {} reported paths", id, claimed, listing.len());
        registration
    }

    /// Tombstones `path` with its subtree and both backup shadows, and drops
    /// every cached resolution below it. Returns the owner that held it.
    pub fn delete(&mut self, path: &str) -> Option<NodeId> {
        let registry = &self.registry;
        let owner = self
            .trie
            .resolve_for_delete(path, |id| registry.is_alive(id))?;

        for slot in 0..BACKUP_SLOTS {
            self.trie.tombstone(&shadow_key(slot, path));
        }
        self.cache.invalidate_prefix(path);
        self.registry.remove_owned_prefix(owner, path);
        Some(owner)
    }

    /// Marks the node down, hides every path it owns and drops its cached
    /// resolutions. Returns the hidden paths.
    pub fn node_down(&mut self, id: NodeId) -> Vec<String> {
        let Some(paths) = self.registry.mark_down(id) else {
            return Vec::new();
        };

        for path in &paths {
            self.trie.mark_deleted(path);
        }
        let dropped = self.cache.invalidate_node(id);
        tracing::info!(
            "{} down: {} paths hidden, {} cache entries dropped",
            id,
            paths.len(),
            dropped
        );
        paths
    }

    /// Removes the node for good. Trie entries keep their paths but lose
    /// every reference to it.
    pub fn evict(&mut self, id: NodeId) -> Option<StorageNode> {
        let node = self.registry.evict(id)?;
        let cleared = self.trie.clear_owner(id);
        self.cache.invalidate_node(id);
        tracing::info!("Cleared {} trie references to evicted {}", cleared, id);
        Some(node)
    }

    pub fn apply(&mut self, records: Vec<PathRecord>) {
        for record in records {
            self.trie
                .insert(&record.key, record.owner, record.is_directory);
            if record.owned {
                self.registry.add_owned_path(record.owner, &record.key);
            }
        }
    }

    pub fn stats(&self) -> NamespaceStats {
        NamespaceStats {
            nodes: self.registry.len(),
            live_nodes: self.registry.live_nodes().len(),
            entries: self.trie.len(),
            cached: self.cache.len(),
            cache_capacity: self.cache.capacity(),
        }
    }
}

/// Owned handle to the locked ensemble, shared by every session.
pub struct Namespace {
    state: Mutex<NamespaceState>,
}

impl Namespace {
    pub fn new(cache_capacity: usize, replication_factor: usize) -> Self {
        Self {
            state: Mutex::new(NamespaceState::new(cache_capacity, replication_factor)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, NamespaceState> {
        self.state.lock().await
    }
}
