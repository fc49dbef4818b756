//! Node Registry
//!
//! Keeps every storage node the naming server has seen, keyed by its stable
//! [`NodeId`]. Nodes are never dropped on disconnect, only marked down; the
//! sole way out of the registry is [`NodeRegistry::evict`].

use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;

use super::types::{BACKUP_SLOTS, ControlHandle, NodeId, NodeState, NodeSummary, StorageNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    New(NodeId),
    Rejoined(NodeId),
}

impl Registration {
    pub fn id(&self) -> NodeId {
        match self {
            Registration::New(id) | Registration::Rejoined(id) => *id,
        }
    }
}

pub struct NodeRegistry {
    nodes: HashMap<NodeId, StorageNode>,
    by_addr: HashMap<SocketAddr, NodeId>,
    /// Registration order; backup placement depends on it.
    order: Vec<NodeId>,
    next_id: u64,
    replication_factor: usize,
}

impl NodeRegistry {
    pub fn new(replication_factor: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            by_addr: HashMap::new(),
            order: Vec::new(),
            next_id: 1,
            replication_factor: replication_factor.max(2),
        }
    }

    /// Registers the node at `addr`, or brings an already known node back up.
    ///
    /// A returning node keeps its id, owned paths and backups; only its state
    /// and control channel are refreshed.
    pub fn register(&mut self, addr: SocketAddr, control: Option<ControlHandle>) -> Registration {
        if let Some(id) = self.by_addr.get(&addr).copied()
            && let Some(node) = self.nodes.get_mut(&id)
        {
            node.state = NodeState::Alive;
            node.control = control;
            tracing::info!("{} at {} rejoined", id, addr);
            return Registration::Rejoined(id);
        }

        let id = NodeId(self.next_id);
        self.next_id += 1;

        self.nodes.insert(id, StorageNode::new(id, addr, control));
        self.by_addr.insert(addr, id);
        self.order.push(id);

        tracing::info!("Registered {} at {} (registry size {})", id, addr, self.nodes.len());
        Registration::New(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&StorageNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut StorageNode> {
        self.nodes.get_mut(&id)
    }

    pub fn id_of(&self, addr: &SocketAddr) -> Option<NodeId> {
        self.by_addr.get(addr).copied()
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(StorageNode::is_alive)
    }

    /// `None` when the node is no longer registered at all.
    pub fn liveness(&self, id: NodeId) -> Option<bool> {
        self.nodes.get(&id).map(StorageNode::is_alive)
    }

    pub fn addr_of(&self, id: NodeId) -> Option<SocketAddr> {
        self.nodes.get(&id).map(|node| node.addr)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Live nodes in registration order.
    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.is_alive(*id))
            .collect()
    }

    pub fn summaries(&self) -> Vec<NodeSummary> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(NodeSummary::from)
            .collect()
    }

    /// Marks the node down and drops its control channel. Returns the paths
    /// it owned so the caller can tombstone them.
    pub fn mark_down(&mut self, id: NodeId) -> Option<Vec<String>> {
        let node = self.nodes.get_mut(&id)?;
        node.state = NodeState::Down;
        node.control = None;
        tracing::warn!("{} at {} marked down", id, node.addr);
        Some(node.owned_paths.clone())
    }

    /// Removes the node for good. Backup slots pointing at it are cleared;
    /// trie entries are the caller's job.
    pub fn evict(&mut self, id: NodeId) -> Option<StorageNode> {
        let node = self.nodes.remove(&id)?;
        self.by_addr.remove(&node.addr);
        self.order.retain(|other| *other != id);

        for other in self.nodes.values_mut() {
            for slot in other.backups.iter_mut() {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }

        tracing::info!("Evicted {} at {}", id, node.addr);
        Some(node)
    }

    pub fn add_owned_path(&mut self, id: NodeId, path: &str) {
        if let Some(node) = self.nodes.get_mut(&id)
            && !node.owned_paths.iter().any(|owned| owned == path)
        {
            node.owned_paths.push(path.to_string());
        }
    }

    /// Forgets `path` and everything below it from the node's owned list.
    pub fn remove_owned_prefix(&mut self, id: NodeId, path: &str) {
        let below = format!("{}/", path);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.owned_paths
                .retain(|owned| owned != path && !owned.starts_with(&below));
        }
    }

    /// Live node owning the fewest paths, earliest registered on ties.
    pub fn least_loaded(&self) -> Option<NodeId> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|node| node.is_alive())
            .min_by_key(|node| node.owned_paths.len())
            .map(|node| node.id)
    }

    /// Backup nodes of `primary` that are currently alive, with their slot.
    pub fn live_backups(&self, primary: NodeId) -> Vec<(usize, NodeId)> {
        let Some(node) = self.nodes.get(&primary) else {
            return Vec::new();
        };

        node.backups
            .iter()
            .enumerate()
            .filter_map(|(slot, backup)| backup.map(|id| (slot, id)))
            .filter(|(_, id)| self.is_alive(*id))
            .collect()
    }

    /// Places backups once `replication_factor` registered nodes are alive.
    ///
    /// The first `replication_factor - 1` registered nodes receive the first
    /// two other live nodes in registration order; `joined` (when it is not
    /// one of them) receives two distinct random live nodes. Existing
    /// assignments are left alone. Returns every primary that received
    /// backups in this call.
    pub fn assign_backups(&mut self, joined: NodeId) -> Vec<NodeId> {
        let live = self.live_nodes();
        if live.len() < self.replication_factor {
            return Vec::new();
        }

        let mut assigned = Vec::new();

        let founders: Vec<NodeId> = self
            .order
            .iter()
            .copied()
            .take(self.replication_factor - 1)
            .collect();

        for primary in founders.iter().copied() {
            if !self.is_alive(primary) || self.has_backups(primary) {
                continue;
            }

            let picks: Vec<NodeId> = live
                .iter()
                .copied()
                .filter(|id| *id != primary)
                .take(BACKUP_SLOTS)
                .collect();

            if self.set_backups(primary, &picks) {
                assigned.push(primary);
            }
        }

        if !founders.contains(&joined) && self.is_alive(joined) && !self.has_backups(joined) {
            let candidates: Vec<NodeId> = live.iter().copied().filter(|id| *id != joined).collect();
            let picks: Vec<NodeId> = candidates
                .choose_multiple(&mut rand::thread_rng(), BACKUP_SLOTS)
                .copied()
                .collect();

            if self.set_backups(joined, &picks) {
                assigned.push(joined);
            }
        }

        assigned
    }

    fn has_backups(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(StorageNode::has_backups)
    }

    /// Fills both slots at once; a partial pick leaves the node unassigned so
    /// a later registration can place it fully.
    fn set_backups(&mut self, primary: NodeId, picks: &[NodeId]) -> bool {
        if picks.len() < BACKUP_SLOTS {
            return false;
        }
        let Some(node) = self.nodes.get_mut(&primary) else {
            return false;
        };

        for (slot, pick) in node.backups.iter_mut().zip(picks.iter()) {
            *slot = Some(*pick);
        }

        tracing::info!("Assigned backups {:?} to {}", node.backups, primary);
        true
    }
}
