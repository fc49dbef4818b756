//! Runtime configuration for both server roles.
//!
//! Defaults mirror the constants the cluster has always run with; each field
//! can be overridden on the command line or through a `NETFS_*` variable.

use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_NAMING_PORT: u16 = 8090;
pub const DEFAULT_CACHE_CAPACITY: usize = 5;
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;
pub const DEFAULT_ASYNC_THRESHOLD: usize = 10;
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 5_000;

#[derive(Args, Debug, Clone)]
pub struct NamingConfig {
    /// Address the naming server accepts clients and storage nodes on
    #[arg(long, env = "NETFS_NAMING_BIND", default_value = "0.0.0.0:8090")]
    pub bind: SocketAddr,

    /// Optional address for the admin HTTP API
    #[arg(long, env = "NETFS_ADMIN_BIND")]
    pub admin_bind: Option<SocketAddr>,

    /// Number of resolved paths kept in the result cache
    #[arg(long, env = "NETFS_CACHE_CAPACITY", default_value_t = DEFAULT_CACHE_CAPACITY)]
    pub cache_capacity: usize,

    /// Registry size at which backups start being assigned
    #[arg(long, env = "NETFS_REPLICATION_FACTOR", default_value_t = DEFAULT_REPLICATION_FACTOR)]
    pub replication_factor: usize,

    /// Bound on every node-to-node exchange, in milliseconds
    #[arg(long, env = "NETFS_PEER_TIMEOUT_MS", default_value_t = DEFAULT_PEER_TIMEOUT_MS)]
    pub peer_timeout_ms: u64,
}

impl NamingConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_NAMING_PORT)),
            admin_bind: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct StorageConfig {
    /// Naming server to register with
    #[arg(long, env = "NETFS_NAMING_ADDR", default_value = "127.0.0.1:8090")]
    pub naming: SocketAddr,

    /// Address this node serves clients and peers on
    #[arg(long, env = "NETFS_STORAGE_BIND")]
    pub bind: SocketAddr,

    /// Address announced to the naming server (defaults to `bind`)
    #[arg(long, env = "NETFS_ADVERTISE")]
    pub advertise: Option<SocketAddr>,

    /// Directory whose contents this node exports
    #[arg(long, env = "NETFS_ROOT")]
    pub root: PathBuf,

    /// Payloads larger than this many bytes are written asynchronously
    #[arg(long, env = "NETFS_ASYNC_THRESHOLD", default_value_t = DEFAULT_ASYNC_THRESHOLD)]
    pub async_threshold: usize,

    /// Bytes flushed per step of an asynchronous write
    #[arg(long, env = "NETFS_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Pause between asynchronous chunks, in milliseconds
    #[arg(long, env = "NETFS_CHUNK_DELAY_MS", default_value_t = 0)]
    pub chunk_delay_ms: u64,

    /// Bound on registration and peer exchanges, in milliseconds
    #[arg(long, env = "NETFS_PEER_TIMEOUT_MS", default_value_t = DEFAULT_PEER_TIMEOUT_MS)]
    pub peer_timeout_ms: u64,
}

impl StorageConfig {
    pub fn new(naming: SocketAddr, bind: SocketAddr, root: PathBuf) -> Self {
        Self {
            naming,
            bind,
            advertise: None,
            root,
            async_threshold: DEFAULT_ASYNC_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay_ms: 0,
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
        }
    }

    pub fn advertised(&self) -> SocketAddr {
        self.advertise.unwrap_or(self.bind)
    }

    pub fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            async_threshold: self.async_threshold,
            chunk_size: self.chunk_size.max(1),
            chunk_delay: Duration::from_millis(self.chunk_delay_ms),
        }
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

/// How the storage node splits writes between the sync and async paths.
#[derive(Debug, Clone, Copy)]
pub struct WritePolicy {
    pub async_threshold: usize,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            async_threshold: DEFAULT_ASYNC_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: Duration::ZERO,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct AdminArgs {
    /// Base URL of the naming server's admin API
    #[arg(long, env = "NETFS_ADMIN_URL", default_value = "http://127.0.0.1:8091")]
    pub url: String,
}
