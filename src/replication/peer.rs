//! Node-to-node copy transport.
//!
//! The naming server drives every copy but never carries file bytes through
//! its own state for longer than one exchange: it fetches from the source
//! node and stores on the destination node, each under a bounded timeout.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::{FsError, FsResult};
use crate::storage::protocol::{ERROR_PREFIX, STORE_OK, TERMINATOR, encode_payload};

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Full content of `path` on the node at `addr`.
    async fn fetch(&self, addr: SocketAddr, path: &str) -> FsResult<Vec<u8>>;

    /// Writes `content` to `path` on the node at `addr`, creating parents.
    async fn store(&self, addr: SocketAddr, path: &str, content: &[u8]) -> FsResult<()>;

    /// Creates the directory `path` (and its parents) on the node at `addr`.
    async fn store_dir(&self, addr: SocketAddr, path: &str) -> FsResult<()>;
}

/// [`PeerTransport`] over the storage nodes' TCP protocol.
pub struct TcpPeerTransport {
    timeout: Duration,
}

impl TcpPeerTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn bounded<T>(
        &self,
        addr: SocketAddr,
        exchange: impl std::future::Future<Output = FsResult<T>>,
    ) -> FsResult<T> {
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(FsError::peer(addr, format!("no answer within {:?}", self.timeout))),
        }
    }

    /// Sends `request` and waits for the single acknowledgement line.
    async fn acknowledged(&self, addr: SocketAddr, request: Vec<u8>) -> FsResult<()> {
        self.bounded(addr, async move {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| FsError::peer(addr, e))?;
            stream
                .write_all(&request)
                .await
                .map_err(|e| FsError::peer(addr, e))?;

            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .await
                .map_err(|e| FsError::peer(addr, e))?;

            match line.trim_end() {
                STORE_OK => Ok(()),
                "" => Err(FsError::peer(addr, "connection closed before acknowledgement")),
                other => Err(FsError::peer(addr, other)),
            }
        })
        .await
    }
}

#[async_trait]
impl PeerTransport for TcpPeerTransport {
    async fn fetch(&self, addr: SocketAddr, path: &str) -> FsResult<Vec<u8>> {
        let request = format!("FETCH {}\n", path);
        self.bounded(addr, async move {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| FsError::peer(addr, e))?;
            stream
                .write_all(request.as_bytes())
                .await
                .map_err(|e| FsError::peer(addr, e))?;

            let mut reply = Vec::new();
            stream
                .read_to_end(&mut reply)
                .await
                .map_err(|e| FsError::peer(addr, e))?;

            if let Some(content) = reply.strip_suffix(TERMINATOR.as_bytes()) {
                return Ok(content.to_vec());
            }
            if reply.starts_with(ERROR_PREFIX.as_bytes()) {
                let reason = String::from_utf8_lossy(&reply);
                return Err(FsError::peer(addr, reason.trim_end()));
            }
            Err(FsError::peer(addr, "truncated FETCH reply"))
        })
        .await
    }

    async fn store(&self, addr: SocketAddr, path: &str, content: &[u8]) -> FsResult<()> {
        self.acknowledged(addr, encode_payload("STORE", path, content))
            .await
    }

    async fn store_dir(&self, addr: SocketAddr, path: &str) -> FsResult<()> {
        self.acknowledged(addr, format!("STORE_DIR {}\n", path).into_bytes())
            .await
    }
}
