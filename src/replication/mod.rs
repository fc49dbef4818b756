//! Replication Module
//!
//! Keeps backup copies of every primary's paths on its assigned backup nodes
//! and carries out client-requested copies between nodes.
//!
//! ## Core Concepts
//! - **Shadow entries**: a backup copy of `/p` held in slot `n` is recorded in
//!   the trie as `#backup<n>/p`, so resolving `/p` never lands on a backup by
//!   accident.
//! - **Acknowledged copies**: a shadow or copied entry is recorded only after
//!   the destination node acknowledged the store.
//! - **Per-path ordering**: mirrors of one path are queued behind each other.
//!
//! ## Components
//! - **manager**: plans and executes copy jobs.
//! - **peer**: the node-to-node transport (`FETCH`/`STORE`/`STORE_DIR`).

pub mod manager;
pub mod peer;

#[cfg(test)]
mod tests;
