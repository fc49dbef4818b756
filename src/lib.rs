//! Network File System Cluster Library
//!
//! Core modules behind the `netfs` binary (`main.rs`), which runs either role
//! of the cluster.
//!
//! ## Architecture Modules
//! The system is split between one naming server and any number of storage
//! nodes:
//!
//! - **`naming`**: The metadata server. Resolves paths to storage nodes,
//!   coordinates CREATE, DELETE and COPY, and relays write completions back
//!   to the client that asked.
//! - **`index`**: The path trie and the LRU result cache in front of it.
//! - **`membership`**: The registry of storage nodes, their owned paths and
//!   backup assignments.
//! - **`replication`**: Snapshots to backups, write mirroring and COPY jobs,
//!   all moved node to node through a `PeerTransport`.
//! - **`storage`**: The storage node. Serves file content directly to clients
//!   behind a fail-fast reader/writer gate and runs the sync/async write
//!   pipeline.
//! - **`config`** and **`error`**: Settings and the shared error type.

pub mod config;
pub mod error;
pub mod index;
pub mod membership;
pub mod naming;
pub mod replication;
pub mod storage;
