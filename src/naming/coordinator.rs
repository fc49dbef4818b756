use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::namespace::{Namespace, NamespaceStats, PathRecord, Resolution};
use super::protocol::{Access, ClientCommand, NodeEvent, format_listing, format_location, replies};
use crate::config::NamingConfig;
use crate::error::{Activity, FsError, FsResult};
use crate::index::trie::parent;
use crate::membership::registry::Registration;
use crate::membership::types::{ControlCommand, ControlHandle, NodeId, NodeSummary};
use crate::replication::manager::ReplicationManager;
use crate::replication::peer::PeerTransport;

pub type SessionId = u64;

/// Lines queued for one connected client.
pub type Outbound = mpsc::UnboundedSender<String>;

/// Unfinished WRITE resolutions a session may hold; the oldest is dropped
/// past this.
pub const MAX_PENDING_PER_SESSION: usize = 64;

/// How long a WRITE resolution keeps DELETE and COPY off its path before the
/// node reports back.
pub const WRITE_RESERVATION: Duration = Duration::from_secs(30);

/// A WRITE resolution handed to a client, waiting for the node to report.
#[derive(Debug, Clone)]
struct PendingWrite {
    session: SessionId,
    node: NodeId,
    path: String,
    issued: Instant,
}

impl PendingWrite {
    fn reserves(&self, path: &str, below: &str) -> bool {
        self.issued.elapsed() < WRITE_RESERVATION
            && (self.path == path || self.path.starts_with(below))
    }
}

/// An asynchronous write a node reported progress for.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    request: u64,
    node: NodeId,
}

/// The naming server's request-handling core.
///
/// Owns the namespace and the replication manager, tracks client sessions
/// and the correlation ids of outstanding writes. Transport-agnostic: the TCP
/// server feeds it parsed commands and node events.
pub struct NamingService {
    config: NamingConfig,
    namespace: Arc<Namespace>,
    replication: Arc<ReplicationManager>,
    sessions: DashMap<SessionId, Outbound>,
    /// Correlation id -> the write it was issued for.
    pending: DashMap<u64, PendingWrite>,
    /// Path -> asynchronous write currently running on its node.
    in_flight: DashMap<String, InFlight>,
    next_session: AtomicU64,
    next_request: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl NamingService {
    pub fn new(config: NamingConfig, transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let namespace = Arc::new(Namespace::new(
            config.cache_capacity,
            config.replication_factor,
        ));

        tracing::info!(
            "Naming service ready (cache {}, replication factor {})",
            config.cache_capacity,
            config.replication_factor
        );

        Arc::new(Self {
            config,
            namespace,
            replication: Arc::new(ReplicationManager::new(transport)),
            sessions: DashMap::new(),
            pending: DashMap::new(),
            in_flight: DashMap::new(),
            next_session: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
            shutdown,
        })
    }

    pub fn config(&self) -> &NamingConfig {
        &self.config
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stops every live node, drops all client sessions and tells the
    /// listeners to wind down.
    pub async fn close(&self) {
        {
            let state = self.namespace.lock().await;
            for id in state.registry.live_nodes() {
                if let Some(node) = state.registry.get(id) {
                    node.send(ControlCommand::Stop);
                }
            }
        }

        self.sessions.clear();
        self.pending.clear();
        self.shutdown.send_replace(true);
        tracing::info!("Naming service closed");
    }

    // ============================================================
    // CLIENT SESSIONS
    // ============================================================

    pub fn open_session(&self, outbound: Outbound) -> SessionId {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(id, outbound);
        tracing::debug!("Client session {} opened", id);
        id
    }

    /// Later completions for this session's writes are dropped.
    pub fn close_session(&self, session: SessionId) {
        self.sessions.remove(&session);
        self.pending.retain(|_, pending| pending.session != session);
        tracing::debug!("Client session {} closed", session);
    }

    /// Handles one client command and returns the reply lines.
    pub async fn handle(&self, session: SessionId, command: ClientCommand) -> Vec<String> {
        tracing::debug!("Session {}: {}", session, command);

        let result = match command {
            ClientCommand::Resolve { access, path } => self.resolve(session, access, &path).await,
            ClientCommand::List { filter } => return self.list(&filter).await,
            ClientCommand::Create { path, is_directory } => self.create(&path, is_directory).await,
            ClientCommand::Delete { path } => self.delete(&path).await,
            ClientCommand::Copy {
                source,
                destination,
            } => self.copy(&source, &destination).await,
            ClientCommand::Stop => return Vec::new(),
        };

        match result {
            Ok(line) => vec![line],
            Err(e) => {
                tracing::debug!("Session {} request failed: {}", session, e);
                vec![e.reply()]
            }
        }
    }

    async fn resolve(&self, session: SessionId, access: Access, path: &str) -> FsResult<String> {
        let location = {
            let mut state = self.namespace.lock().await;
            // Writes always go to the primary; backups only serve reads.
            let resolution = match access {
                Access::Write => state.resolve_primary(path).map(Resolution::Primary),
                _ => state.resolve(path),
            };
            resolution.and_then(|r| state.addr_of(r.node()).map(|addr| (r.node(), addr)))
        };

        let (node, addr) = location.ok_or_else(|| FsError::NotFound(path.to_string()))?;

        let request = (access == Access::Write).then(|| self.reserve_write(session, node, path));

        Ok(format_location(addr, request))
    }

    /// Hands out a correlation id for a write on `path`, dropping the
    /// session's oldest unfinished one when it already holds too many.
    fn reserve_write(&self, session: SessionId, node: NodeId, path: &str) -> u64 {
        let held: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.session == session)
            .map(|entry| *entry.key())
            .collect();
        if held.len() >= MAX_PENDING_PER_SESSION
            && let Some(oldest) = held.into_iter().min()
        {
            self.pending.remove(&oldest);
            tracing::debug!("Session {} dropped unfinished write {}", session, oldest);
        }

        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(
            id,
            PendingWrite {
                session,
                node,
                path: path.to_string(),
                issued: Instant::now(),
            },
        );
        id
    }

    async fn list(&self, filter: &str) -> Vec<String> {
        let state = self.namespace.lock().await;
        let mut lines: Vec<String> = state
            .trie
            .list(filter, |id| state.registry.is_alive(id))
            .into_iter()
            .map(|(path, is_directory)| format_listing(&path, is_directory))
            .collect();
        lines.push(replies::END_OF_LIST.to_string());
        lines
    }

    async fn create(&self, path: &str, is_directory: bool) -> FsResult<String> {
        let mut state = self.namespace.lock().await;

        if state.resolve_primary(path).is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }

        let parent_dir = parent(path);
        let owner = if parent_dir.is_empty() {
            state
                .registry
                .least_loaded()
                .ok_or_else(|| FsError::NodeUnavailable("no live storage node".into()))?
        } else {
            match state.resolve_primary(parent_dir) {
                Some(owner) if state.trie.is_directory(parent_dir) == Some(true) => owner,
                _ => return Err(FsError::DirectoryNotFound(parent_dir.to_string())),
            }
        };

        let command = if is_directory {
            ControlCommand::CreateDir(path.to_string())
        } else {
            ControlCommand::CreateFile(path.to_string())
        };

        let delivered = state
            .registry
            .get(owner)
            .is_some_and(|node| node.send(command.clone()));
        if !delivered {
            return Err(FsError::NodeUnavailable(owner.to_string()));
        }

        let mut records = vec![PathRecord::primary(path, owner, is_directory)];
        for (slot, backup) in state.registry.live_backups(owner) {
            let delivered = state
                .registry
                .get(backup)
                .is_some_and(|node| node.send(command.clone()));
            if delivered {
                records.push(PathRecord::shadow(slot, path, backup, is_directory));
            } else {
                tracing::warn!("Backup {} missed {}", backup, command);
            }
        }
        state.apply(records);

        tracing::info!("Created {} on {}", path, owner);
        Ok(if is_directory {
            replies::DIRECTORY_CREATED.to_string()
        } else {
            replies::FILE_CREATED.to_string()
        })
    }

    async fn delete(&self, path: &str) -> FsResult<String> {
        if self.write_in_flight(path) {
            return Err(FsError::Busy(Activity::Write, path.to_string()));
        }

        let mut state = self.namespace.lock().await;
        let owner = state
            .delete(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;

        let command = ControlCommand::Delete(path.to_string());
        let backups = state.registry.live_backups(owner);
        for node in std::iter::once(owner).chain(backups.into_iter().map(|(_, id)| id)) {
            let delivered = state
                .registry
                .get(node)
                .is_some_and(|n| n.send(command.clone()));
            if !delivered {
                tracing::warn!("{} missed {}", node, command);
            }
        }

        tracing::info!("Deleted {} from {}", path, owner);
        Ok(replies::DELETED.to_string())
    }

    async fn copy(&self, source: &str, destination: &str) -> FsResult<String> {
        if self.write_in_flight(source) {
            return Err(FsError::Busy(Activity::Write, source.to_string()));
        }
        if self.write_in_flight(destination) {
            return Err(FsError::Busy(Activity::Write, destination.to_string()));
        }

        let copied = self
            .replication
            .copy(&self.namespace, source, destination)
            .await?;

        tracing::info!("Copied {} -> {} ({} entries)", source, destination, copied.len());
        Ok(replies::COPIED.to_string())
    }

    /// Whether a write is running on `path` or below it, or was handed out
    /// recently and its node has not reported back yet.
    fn write_in_flight(&self, path: &str) -> bool {
        let below = format!("{}/", path);
        self.in_flight
            .iter()
            .any(|entry| entry.key() == path || entry.key().starts_with(&below))
            || self.pending.iter().any(|entry| entry.reserves(path, &below))
    }

    // ============================================================
    // STORAGE NODES
    // ============================================================

    /// Records a node's registration. Returns it together with the primaries
    /// that were just given backups and still need a snapshot.
    pub async fn register_node(
        &self,
        addr: SocketAddr,
        control: Option<ControlHandle>,
        listing: &[(String, bool)],
    ) -> (Registration, Vec<NodeId>) {
        let mut state = self.namespace.lock().await;
        let registration = state.register(addr, control, listing);
        let assigned = state.registry.assign_backups(registration.id());
        (registration, assigned)
    }

    /// Copies the current paths of `primaries` onto their backups.
    pub async fn snapshot(&self, primaries: &[NodeId]) -> usize {
        let copied = self.replication.snapshot(&self.namespace, primaries).await;
        tracing::info!("Backup snapshot finished: {} copies recorded", copied);
        copied
    }

    /// Applies a notification from `node`. A write completion starts a
    /// mirror to the node's backups; its handle is returned.
    pub async fn node_event(&self, node: NodeId, event: NodeEvent) -> Option<JoinHandle<usize>> {
        match event {
            NodeEvent::WriteSuccess { request, path } => {
                if let Some(id) = request {
                    self.pending.remove(&id);
                }
                tracing::info!("{} wrote {}", node, path);
                Some(self.spawn_mirror(path, node))
            }
            NodeEvent::WriteFail { request, path } => {
                if let Some(id) = request {
                    self.pending.remove(&id);
                }
                tracing::warn!("{} did not write {}", node, path);
                None
            }
            NodeEvent::AsyncProgress { request, path } => {
                tracing::debug!("{} async write {} progressing on {}", node, request, path);
                self.in_flight.insert(path, InFlight { request, node });
                None
            }
            NodeEvent::AsyncSuccess { request, path } => {
                self.in_flight.remove(&path);
                self.notify(request, format!("ASYNC_WRITE_SUCCESS {}", path));
                tracing::info!("{} finished async write {} of {}", node, request, path);
                Some(self.spawn_mirror(path, node))
            }
            NodeEvent::AsyncFail { request, path } => {
                self.in_flight.remove(&path);
                self.notify(request, format!("ASYNC_WRITE_FAIL {}", path));
                tracing::error!("{} failed async write {} of {}", node, request, path);
                None
            }
            NodeEvent::Stop => {
                self.node_down(node).await;
                None
            }
            NodeEvent::StopAck => {
                tracing::debug!("{} acknowledged STOP", node);
                None
            }
        }
    }

    /// Marks the node down. Every asynchronous write it was running is
    /// reported failed to its client.
    pub async fn node_down(&self, node: NodeId) {
        self.namespace.lock().await.node_down(node);

        let mut failed = Vec::new();
        self.in_flight.retain(|path, write| {
            if write.node == node {
                failed.push((write.request, path.clone()));
                false
            } else {
                true
            }
        });

        for (request, path) in failed {
            tracing::warn!("Async write {} of {} lost with {}", request, path, node);
            self.notify(request, format!("ASYNC_WRITE_FAIL {}", path));
        }
        self.pending.retain(|_, pending| pending.node != node);
    }

    /// The control channel `handle` belonged to has closed. Ignored when the
    /// node has since registered again on a newer channel.
    pub async fn control_lost(&self, node: NodeId, handle: &ControlHandle) {
        let current = {
            let state = self.namespace.lock().await;
            state
                .registry
                .get(node)
                .and_then(|n| n.control.as_ref())
                .is_some_and(|control| control.same_channel(handle))
        };

        if current {
            tracing::warn!("{} lost its control channel", node);
            self.node_down(node).await;
        } else {
            tracing::debug!("Stale control channel of {} closed", node);
        }
    }

    /// Removes the node from the registry for good.
    pub async fn evict(&self, node: NodeId) -> Option<NodeSummary> {
        let evicted = self.namespace.lock().await.evict(node)?;
        self.in_flight.retain(|_, write| write.node != node);
        self.pending.retain(|_, pending| pending.node != node);
        Some(NodeSummary::from(&evicted))
    }

    pub async fn nodes(&self) -> Vec<NodeSummary> {
        self.namespace.lock().await.registry.summaries()
    }

    pub async fn stats(&self) -> NamespaceStats {
        self.namespace.lock().await.stats()
    }

    /// Forwards a completion to the session that asked for `request`, once.
    fn notify(&self, request: u64, line: String) {
        let Some((_, pending)) = self.pending.remove(&request) else {
            tracing::debug!("No waiting client for request {}", request);
            return;
        };

        match self.sessions.get(&pending.session) {
            Some(outbound) => {
                if outbound.send(line).is_err() {
                    tracing::debug!("Session {} went away", pending.session);
                }
            }
            None => tracing::debug!("Session {} closed, dropping {}", pending.session, line),
        }
    }

    fn spawn_mirror(&self, path: String, primary: NodeId) -> JoinHandle<usize> {
        let replication = self.replication.clone();
        let namespace = self.namespace.clone();
        tokio::spawn(async move { replication.mirror_write(&namespace, &path, primary).await })
    }
}
