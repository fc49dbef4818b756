use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::peer::PeerTransport;
use crate::error::{FsError, FsResult};
use crate::index::trie::{basename, normalize};
use crate::membership::types::NodeId;
use crate::naming::namespace::{Namespace, NamespaceState, PathRecord};

/// One node-to-node copy. Planned under the namespace lock, executed
/// without it.
#[derive(Debug, Clone)]
pub struct CopyJob {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub source: String,
    pub target: String,
    pub is_directory: bool,
    /// Recorded in the trie only once the copy is acknowledged.
    pub record: PathRecord,
}

/// Drives every copy between storage nodes: backup snapshots, write mirroring
/// and client-requested COPY.
///
/// Replication is best effort. A failed copy is logged and its trie record is
/// dropped; nothing is retried and the client-visible operation that caused
/// it is not failed after the fact.
pub struct ReplicationManager {
    transport: Arc<dyn PeerTransport>,
    /// One queue per path so mirrors of the same path never overtake each other.
    mirror_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ReplicationManager {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            mirror_locks: DashMap::new(),
        }
    }

    /// Copies every path the given primaries currently own onto their backups
    /// and records the shadow entries. Returns the number of copies recorded.
    pub async fn snapshot(&self, namespace: &Namespace, primaries: &[NodeId]) -> usize {
        let jobs: Vec<CopyJob> = {
            let state = namespace.lock().await;
            primaries
                .iter()
                .flat_map(|primary| {
                    let paths = owned_live_paths(&state, *primary);
                    shadow_jobs(&state, *primary, &paths)
                })
                .collect()
        };

        if jobs.is_empty() {
            return 0;
        }

        tracing::info!("Snapshotting {} paths onto backups", jobs.len());
        let (records, _) = self.execute(jobs).await;
        let count = records.len();
        namespace.lock().await.apply(records);
        count
    }

    /// Pushes the current content of `path` from `primary` to each of its
    /// live backups. Mirrors of one path run one at a time.
    pub async fn mirror_write(&self, namespace: &Namespace, path: &str, primary: NodeId) -> usize {
        let path = normalize(path);
        let queue = self
            .mirror_locks
            .entry(path.to_string())
            .or_default()
            .clone();

        let count = {
            let _turn = queue.lock().await;

            let jobs = {
                let state = namespace.lock().await;
                match state.trie.is_directory(path) {
                    Some(is_directory) => {
                        shadow_jobs(&state, primary, &[(path.to_string(), is_directory)])
                    }
                    None => Vec::new(),
                }
            };

            let (records, _) = self.execute(jobs).await;
            let count = records.len();
            namespace.lock().await.apply(records);
            count
        };

        drop(queue);
        self.mirror_locks
            .remove_if(path, |_, queue| Arc::strong_count(queue) == 1);

        tracing::debug!("Mirrored {} to {} backups", path, count);
        count
    }

    /// Directory-aware copy of `source` onto `destination`.
    ///
    /// - file onto file overwrites the destination
    /// - file onto directory lands at `destination/<basename>`
    /// - directory onto directory merges the source tree into the destination
    /// - directory onto file is rejected
    ///
    /// Every copied path is owned by the destination's node and mirrored to
    /// its backups. Returns the copied target paths.
    pub async fn copy(
        &self,
        namespace: &Namespace,
        source: &str,
        destination: &str,
    ) -> FsResult<Vec<String>> {
        let source = normalize(source);
        let destination = normalize(destination);

        let (jobs, owner) = {
            let mut state = namespace.lock().await;
            plan_copy(&mut state, source, destination)?
        };

        let planned = jobs.len();
        let (records, mut errors) = self.execute(jobs).await;
        let targets: Vec<String> = records.iter().map(|record| record.key.clone()).collect();
        namespace.lock().await.apply(records);

        for target in &targets {
            self.mirror_write(namespace, target, owner).await;
        }

        if targets.len() < planned {
            tracing::warn!(
                "COPY {} -> {}: {} of {} entries copied",
                source,
                destination,
                targets.len(),
                planned
            );
            if let Some(error) = errors.pop() {
                return Err(error);
            }
        }

        Ok(targets)
    }

    /// Runs `jobs` in order. Returns the records of the copies that were
    /// acknowledged and the errors of the ones that were not.
    pub async fn execute(&self, jobs: Vec<CopyJob>) -> (Vec<PathRecord>, Vec<FsError>) {
        let mut records = Vec::with_capacity(jobs.len());
        let mut errors = Vec::new();

        for job in jobs {
            match self.run(&job).await {
                Ok(()) => {
                    tracing::debug!("Copied {}:{} -> {}:{}", job.from, job.source, job.to, job.target);
                    records.push(job.record);
                }
                Err(e) => {
                    tracing::warn!(
                        "Copy {}:{} -> {}:{} failed: {}",
                        job.from,
                        job.source,
                        job.to,
                        job.target,
                        e
                    );
                    errors.push(e);
                }
            }
        }

        (records, errors)
    }

    async fn run(&self, job: &CopyJob) -> FsResult<()> {
        if job.is_directory {
            return self.transport.store_dir(job.to, &job.target).await;
        }
        let content = self.transport.fetch(job.from, &job.source).await?;
        self.transport.store(job.to, &job.target, &content).await
    }
}

/// Non-deleted paths owned by `primary`, with their kind.
fn owned_live_paths(state: &NamespaceState, primary: NodeId) -> Vec<(String, bool)> {
    let Some(node) = state.registry.get(primary) else {
        return Vec::new();
    };

    node.owned_paths
        .iter()
        .filter_map(|path| {
            let is_directory = state.trie.is_directory(path)?;
            Some((path.clone(), is_directory))
        })
        .collect()
}

/// Copies of `paths` from `primary` onto each of its live backups, backup
/// by backup, preserving the order of `paths`.
fn shadow_jobs(state: &NamespaceState, primary: NodeId, paths: &[(String, bool)]) -> Vec<CopyJob> {
    let Some(from) = state.addr_of(primary) else {
        return Vec::new();
    };

    let mut jobs = Vec::new();
    for (slot, backup) in state.registry.live_backups(primary) {
        let Some(to) = state.addr_of(backup) else {
            continue;
        };
        for (path, is_directory) in paths {
            jobs.push(CopyJob {
                from,
                to,
                source: path.clone(),
                target: path.clone(),
                is_directory: *is_directory,
                record: PathRecord::shadow(slot, path, backup, *is_directory),
            });
        }
    }
    jobs
}

fn plan_copy(
    state: &mut NamespaceState,
    source: &str,
    destination: &str,
) -> FsResult<(Vec<CopyJob>, NodeId)> {
    let source_owner = state
        .resolve_primary(source)
        .ok_or_else(|| FsError::NotFound(source.to_string()))?;
    let owner = state
        .resolve_primary(destination)
        .ok_or_else(|| FsError::NotFound(destination.to_string()))?;
    let to = state
        .addr_of(owner)
        .ok_or_else(|| FsError::NodeUnavailable(owner.to_string()))?;

    let source_is_dir = state.trie.is_directory(source).unwrap_or(false);
    let destination_is_dir = state.trie.is_directory(destination).unwrap_or(false);

    // (source path, its owner, target path, is directory)
    let entries: Vec<(String, NodeId, String, bool)> = match (source_is_dir, destination_is_dir) {
        (true, false) => return Err(FsError::InvalidCopy(source.to_string())),
        (false, false) => vec![(
            source.to_string(),
            source_owner,
            destination.to_string(),
            false,
        )],
        (false, true) => vec![(
            source.to_string(),
            source_owner,
            format!("{}/{}", destination, basename(source)),
            false,
        )],
        (true, true) => state
            .trie
            .prefix_search(source, true)
            .into_iter()
            .filter_map(|path| {
                let entry_owner = state.trie.resolve(&path, |id| state.registry.is_alive(id))?;
                let is_directory = state.trie.is_directory(&path)?;
                let target = format!("{}{}", destination, &path[source.len()..]);
                Some((path, entry_owner, target, is_directory))
            })
            .collect(),
    };

    let jobs = entries
        .into_iter()
        .filter_map(|(path, entry_owner, target, is_directory)| {
            let from = state.addr_of(entry_owner)?;
            Some(CopyJob {
                from,
                to,
                record: PathRecord::primary(&target, owner, is_directory),
                source: path,
                target,
                is_directory,
            })
        })
        .collect();

    Ok((jobs, owner))
}
