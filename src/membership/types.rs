use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Number of backup slots every primary can hold.
pub const BACKUP_SLOTS: usize = 2;

/// Stable identity of a storage node.
///
/// Handed out from a monotonic counter by the registry and never reused, so
/// caches and trie entries can hold it without caring about registry layout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    /// Disconnected or stopped. The node keeps its registry slot so cached
    /// ids and backup assignments stay meaningful until it rejoins.
    Down,
}

/// Commands the naming server pushes down a node's control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    CreateDir(String),
    CreateFile(String),
    Delete(String),
    Stop,
}

impl ControlCommand {
    /// Parses one control line as the node receives it.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = match (words.next()?, words.next()) {
            ("CREATE_DIR", Some(path)) => ControlCommand::CreateDir(path.to_string()),
            ("CREATE_FILE", Some(path)) => ControlCommand::CreateFile(path.to_string()),
            ("DELETE", Some(path)) => ControlCommand::Delete(path.to_string()),
            ("STOP", None) => ControlCommand::Stop,
            _ => return None,
        };
        Some(command)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::CreateDir(path) => write!(f, "CREATE_DIR {}", path),
            ControlCommand::CreateFile(path) => write!(f, "CREATE_FILE {}", path),
            ControlCommand::Delete(path) => write!(f, "DELETE {}", path),
            ControlCommand::Stop => write!(f, "STOP"),
        }
    }
}

pub type ControlHandle = mpsc::UnboundedSender<ControlCommand>;

/// A storage node as the naming server knows it.
#[derive(Debug)]
pub struct StorageNode {
    pub id: NodeId,
    /// Address clients and peers use to reach the node directly.
    pub addr: SocketAddr,
    pub state: NodeState,
    /// Paths this node registered or was given, in arrival order.
    pub owned_paths: Vec<String>,
    pub backups: [Option<NodeId>; BACKUP_SLOTS],
    pub control: Option<ControlHandle>,
}

impl StorageNode {
    pub fn new(id: NodeId, addr: SocketAddr, control: Option<ControlHandle>) -> Self {
        Self {
            id,
            addr,
            state: NodeState::Alive,
            owned_paths: Vec::new(),
            backups: [None; BACKUP_SLOTS],
            control,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == NodeState::Alive
    }

    pub fn has_backups(&self) -> bool {
        self.backups.iter().any(Option::is_some)
    }

    /// Queues a command on the control channel. Returns `false` when the node
    /// has no live channel to receive it.
    pub fn send(&self, command: ControlCommand) -> bool {
        match &self.control {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }
}

/// Registry row exposed through the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub state: NodeState,
    pub path_count: usize,
    pub backups: Vec<Option<NodeId>>,
}

impl From<&StorageNode> for NodeSummary {
    fn from(node: &StorageNode) -> Self {
        Self {
            id: node.id,
            addr: node.addr,
            state: node.state,
            path_count: node.owned_paths.len(),
            backups: node.backups.to_vec(),
        }
    }
}
