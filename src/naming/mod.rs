//! Naming Server Module
//!
//! The metadata brain of the cluster. It never carries file bytes for
//! clients: it tells them which storage node serves a path and coordinates
//! every namespace mutation.
//!
//! ## Core Concepts
//! - **Resolution**: cache, then trie, then backup shadows.
//! - **Fan-out**: CREATE and DELETE go to the primary and its live backups.
//! - **Correlation ids**: handed out with every WRITE resolution and carried by
//!   the node's completion notices, so results find their way back to the
//!   client session that asked.
//! - **Node lifecycle**: a node whose control channel closes is marked down,
//!   its paths are hidden and its running async writes are reported failed.
//!
//! ## Components
//! - **protocol**: line formats and reply texts.
//! - **namespace**: trie + registry + cache behind one lock.
//! - **coordinator**: the command state machine (`NamingService`).
//! - **server**: TCP sessions for clients and storage nodes.
//! - **handlers**: admin HTTP routes.

pub mod coordinator;
pub mod handlers;
pub mod namespace;
pub mod protocol;
pub mod server;
