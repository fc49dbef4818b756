//! Storage Node Module
//!
//! A storage node exports one local directory. It registers its contents with
//! the naming server, then serves clients and peers directly over TCP while
//! taking namespace commands down its control channel.
//!
//! ## Core Concepts
//! - **Access gate**: many readers or one writer per file, refused immediately
//!   when taken rather than queued.
//! - **Write pipeline**: small writes complete inline; larger ones are
//!   acknowledged and written in chunks with progress notices.
//! - **Notifications**: every write ends in exactly one success or failure
//!   notice on the control channel.
//!
//! ## Components
//! - **protocol**: request framing and reply texts.
//! - **access**: `FileAccessController` and its guards.
//! - **local**: the on-disk adapter (`LocalStore`).
//! - **writer**: `WritePipeline`.
//! - **server**: connection handling, registration and the control loop.

pub mod access;
pub mod local;
pub mod protocol;
pub mod server;
pub mod writer;

#[cfg(test)]
mod tests;
