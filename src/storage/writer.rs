//! Write pipeline.
//!
//! Small writes (or any write flagged `--SYNC`) land on disk before the client
//! hears back. Larger ones are acknowledged straight away and written in the
//! background chunk by chunk, reporting progress to the naming server. Every
//! write ends in exactly one success or failure notice.

use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::access::{FileAccessController, WriteGuard};
use super::local::LocalStore;
use crate::config::WritePolicy;
use crate::error::{FsError, FsResult};
use crate::naming::protocol::NodeEvent;

/// Outgoing half of the node's notification queue to the naming server.
pub type Notifier = mpsc::UnboundedSender<NodeEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Content is on disk.
    Written,
    /// Accepted; completion arrives as an async notice.
    Accepted,
}

pub struct WritePipeline {
    store: Arc<LocalStore>,
    access: FileAccessController,
    policy: WritePolicy,
    notifier: Notifier,
}

impl WritePipeline {
    pub fn new(
        store: Arc<LocalStore>,
        access: FileAccessController,
        policy: WritePolicy,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            access,
            policy,
            notifier,
        }
    }

    /// Whether a payload of `len` bytes takes the background path.
    pub fn is_async(&self, len: usize, sync: bool) -> bool {
        !sync && len > self.policy.async_threshold
    }

    /// Takes the write gate for `path` or fails fast, then writes.
    pub async fn write(
        &self,
        path: &str,
        data: Vec<u8>,
        sync: bool,
        request: Option<u64>,
    ) -> FsResult<WriteOutcome> {
        let guard = match self.access.try_begin_write(path) {
            Ok(guard) => guard,
            Err(e) => {
                // Releases the naming server's hold on the path.
                if request.is_some() {
                    self.notify(NodeEvent::WriteFail {
                        request,
                        path: path.to_string(),
                    });
                }
                return Err(e);
            }
        };

        if !self.is_async(data.len(), sync) {
            let result = self.store.write(path, &data).await;
            drop(guard);

            let event = match &result {
                Ok(()) => {
                    tracing::info!("Wrote {} bytes to {}", data.len(), path);
                    NodeEvent::WriteSuccess {
                        request,
                        path: path.to_string(),
                    }
                }
                Err(e) => {
                    tracing::warn!("Write to {} failed: {}", path, e);
                    NodeEvent::WriteFail {
                        request,
                        path: path.to_string(),
                    }
                }
            };
            self.notify(event);
            return result.map(|_| WriteOutcome::Written);
        }

        let request = request.unwrap_or_default();
        guard.set_async(request);
        tracing::info!(
            "Accepted async write {} of {} bytes to {}",
            request,
            data.len(),
            path
        );

        let task = AsyncWrite {
            store: self.store.clone(),
            policy: self.policy,
            notifier: self.notifier.clone(),
            path: path.to_string(),
            request,
            data,
        };
        tokio::spawn(task.run(guard));

        Ok(WriteOutcome::Accepted)
    }

    fn notify(&self, event: NodeEvent) {
        if self.notifier.send(event).is_err() {
            tracing::warn!("Notification dropped: naming channel closed");
        }
    }
}

struct AsyncWrite {
    store: Arc<LocalStore>,
    policy: WritePolicy,
    notifier: Notifier,
    path: String,
    request: u64,
    data: Vec<u8>,
}

impl AsyncWrite {
    /// Holds `guard` until the last byte is synced or the write fails.
    async fn run(self, guard: WriteGuard) {
        let result = self.write_chunks().await;
        drop(guard);

        let event = match result {
            Ok(()) => {
                tracing::info!("Async write {} to {} finished", self.request, self.path);
                NodeEvent::AsyncSuccess {
                    request: self.request,
                    path: self.path.clone(),
                }
            }
            Err(e) => {
                tracing::error!("Async write {} to {} failed: {}", self.request, self.path, e);
                NodeEvent::AsyncFail {
                    request: self.request,
                    path: self.path.clone(),
                }
            }
        };
        let _ = self.notifier.send(event);
    }

    async fn write_chunks(&self) -> FsResult<()> {
        let mut file = self.store.create_for_write(&self.path).await?;
        let chunk_size = self.policy.chunk_size.max(1);

        for chunk in self.data.chunks(chunk_size) {
            file.write_all(chunk)
                .await
                .map_err(|e| FsError::io(&self.path, e))?;
            file.flush().await.map_err(|e| FsError::io(&self.path, e))?;

            let _ = self.notifier.send(NodeEvent::AsyncProgress {
                request: self.request,
                path: self.path.clone(),
            });

            if !self.policy.chunk_delay.is_zero() {
                tokio::time::sleep(self.policy.chunk_delay).await;
            }
        }

        file.sync_all()
            .await
            .map_err(|e| FsError::io(&self.path, e))
    }
}
