//! Membership & Node Registry Module
//!
//! Tracks the storage nodes that make up the cluster as seen by the naming server.
//!
//! ## Core Mechanisms
//! - **Stable identity**: every node gets a monotonic `NodeId` on first registration;
//!   the same address registering again gets its old id back.
//! - **Liveness**: nodes flip between `Alive` and `Down` as their control channel comes
//!   and goes. They stay in the registry until explicitly evicted.
//! - **Backup placement**: once enough nodes have joined, primaries are paired with two
//!   backup nodes that hold mirrored copies of their paths.

pub mod registry;
pub mod types;

#[cfg(test)]
mod tests;
