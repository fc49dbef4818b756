//! Path Index Module
//!
//! In-memory metadata the naming server resolves paths against.
//!
//! ## Components
//! - **trie**: byte-keyed prefix tree mapping namespace paths to their owning
//!   node, with soft-delete and revival.
//! - **cache**: small LRU of recent resolutions, revalidated against node
//!   liveness on every hit.

pub mod cache;
pub mod trie;
