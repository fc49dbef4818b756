use anyhow::{Context, anyhow};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::access::FileAccessController;
use super::local::LocalStore;
use super::protocol::{ERROR_PREFIX, STORE_OK, StorageRequest, TERMINATOR, read_request, replies};
use super::writer::{WriteOutcome, WritePipeline};
use crate::config::StorageConfig;
use crate::error::{FsError, FsResult};
use crate::membership::types::ControlCommand;
use crate::naming::protocol::{
    LISTING_END, NodeEvent, STOP_ACK, STORAGE_HELLO, format_announce, format_listing,
    parse_location,
};

const REGISTER_ATTEMPTS: usize = 10;

type LineReader = Lines<BufReader<OwnedReadHalf>>;

/// Everything one storage node serves from.
pub struct StorageServer {
    store: Arc<LocalStore>,
    access: FileAccessController,
    pipeline: WritePipeline,
}

/// Why a control session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlExit {
    /// The node is shutting down.
    Stopped,
    /// The naming server went away; the node should register again.
    Lost,
}

impl StorageServer {
    pub fn new(
        store: LocalStore,
        policy: crate::config::WritePolicy,
        notifier: mpsc::UnboundedSender<NodeEvent>,
    ) -> Arc<Self> {
        let store = Arc::new(store);
        let access = FileAccessController::new();
        let pipeline = WritePipeline::new(store.clone(), access.clone(), policy, notifier);

        Arc::new(Self {
            store,
            access,
            pipeline,
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn access(&self) -> &FileAccessController {
        &self.access
    }

    /// Serves one request, writing the whole reply to `out`.
    pub async fn respond<W>(&self, request: StorageRequest, out: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match request {
            StorageRequest::Read { path } | StorageRequest::Stream { path } => {
                let _guard = match self.access.try_begin_read(&path) {
                    Ok(guard) => guard,
                    Err(FsError::Busy(..)) => {
                        tracing::debug!("Read of {} refused: write in progress", path);
                        return line(out, replies::READ_BLOCKED).await;
                    }
                    Err(e) => return line(out, &e.reply()).await,
                };
                match self.store.read(&path).await {
                    Ok(content) => {
                        out.write_all(&content).await?;
                        out.write_all(TERMINATOR.as_bytes()).await?;
                        tracing::debug!("Sent {} bytes of {}", content.len(), path);
                        Ok(())
                    }
                    Err(e) => line(out, &e.reply()).await,
                }
            }

            StorageRequest::Info { path } => {
                let _guard = match self.access.try_begin_read(&path) {
                    Ok(guard) => guard,
                    Err(e) => return line(out, &e.reply()).await,
                };
                match self.store.info(&path).await {
                    Ok(block) => {
                        out.write_all(block.as_bytes()).await?;
                        out.write_all(TERMINATOR.as_bytes()).await
                    }
                    Err(e) => line(out, &e.reply()).await,
                }
            }

            StorageRequest::Write {
                path,
                data,
                sync,
                request,
            } => match self.pipeline.write(&path, data, sync, request).await {
                Ok(WriteOutcome::Written) => line(out, replies::WRITTEN).await,
                Ok(WriteOutcome::Accepted) => line(out, replies::ACCEPTED).await,
                Err(e) => line(out, &e.reply()).await,
            },

            StorageRequest::Fetch { path } => {
                let fetched = match self.access.try_begin_read(&path) {
                    Ok(_guard) => self.store.read(&path).await,
                    Err(e) => Err(e),
                };
                match fetched {
                    Ok(content) => {
                        out.write_all(&content).await?;
                        out.write_all(TERMINATOR.as_bytes()).await
                    }
                    Err(e) => line(out, &format!("{}{}", ERROR_PREFIX, e)).await,
                }
            }

            StorageRequest::Store { path, data } => {
                let stored = match self.access.try_begin_write(&path) {
                    Ok(_guard) => self.store.write(&path, &data).await,
                    Err(e) => Err(e),
                };
                acknowledge(out, &path, stored).await
            }

            StorageRequest::StoreDir { path } => {
                let stored = self.store.create_dir(&path).await;
                acknowledge(out, &path, stored).await
            }
        }
    }

    /// Applies one command pushed by the naming server. Returns `false` once
    /// the node has been told to stop.
    pub async fn apply(&self, command: ControlCommand) -> bool {
        let result = match &command {
            ControlCommand::CreateDir(path) => self.store.create_dir(path).await,
            ControlCommand::CreateFile(path) => self.store.create_file(path).await,
            ControlCommand::Delete(path) => match self.access.ensure_idle(path) {
                Ok(()) => self.store.delete(path).await,
                Err(e) => Err(e),
            },
            ControlCommand::Stop => return false,
        };

        match result {
            Ok(()) => tracing::info!("Applied {}", command),
            Err(e) => tracing::warn!("{} failed: {}", command, e),
        }
        true
    }
}

async fn line<W: AsyncWrite + Unpin>(out: &mut W, text: &str) -> std::io::Result<()> {
    out.write_all(format!("{}\n", text).as_bytes()).await
}

async fn acknowledge<W: AsyncWrite + Unpin>(
    out: &mut W,
    path: &str,
    result: FsResult<()>,
) -> std::io::Result<()> {
    match result {
        Ok(()) => {
            tracing::debug!("Stored replica {}", path);
            line(out, STORE_OK).await
        }
        Err(e) => {
            tracing::warn!("Storing replica {} failed: {}", path, e);
            line(out, &format!("{}{}", ERROR_PREFIX, e)).await
        }
    }
}

/// Runs a storage node until Ctrl-C or a STOP from the naming server.
pub async fn run(config: StorageConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding storage listener on {}", config.bind))?;
    tracing::info!("Storage node listening on {}", config.bind);

    let (leave, leaving) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received, leaving the cluster");
                let _ = leave.send(true);
            }
            Err(e) => {
                tracing::warn!("Ctrl-C handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    start(config, listener, leaving).await
}

/// Serves on `listener` and stays registered with the naming server until
/// `leaving` flips or the naming server sends STOP.
pub async fn start(
    mut config: StorageConfig,
    listener: TcpListener,
    mut leaving: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let store = LocalStore::open(&config.root)
        .with_context(|| format!("opening root {}", config.root.display()))?;
    tracing::info!("Exporting {}", store.root().display());
    if config.advertise.is_none() {
        config.advertise = Some(listener.local_addr()?);
    }

    let (notifier, mut events) = mpsc::unbounded_channel();
    let server = StorageServer::new(store, config.write_policy(), notifier);
    let (shutdown, stop_signal) = watch::channel(false);
    let serving = tokio::spawn(serve(server.clone(), listener, stop_signal));

    loop {
        let (lines, writer) = tokio::select! {
            registered = register(&config, server.store()) => match registered {
                Ok(session) => session,
                Err(e) => {
                    let _ = shutdown.send(true);
                    return Err(e);
                }
            },
            _ = leaving.changed() => break,
        };

        match control_loop(&server, lines, writer, &mut events, &mut leaving).await {
            ControlExit::Stopped => break,
            ControlExit::Lost => {
                tracing::warn!("Lost naming server at {}, registering again", config.naming)
            }
        }
    }

    let _ = shutdown.send(true);
    let _ = serving.await;
    tracing::info!("Storage node stopped");
    Ok(())
}

/// Accepts client and peer connections until `stop` flips.
pub async fn serve(
    server: Arc<StorageServer>,
    listener: TcpListener,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(server, stream).await {
                        tracing::warn!("Connection from {} ended with error: {:#}", peer, e);
                    }
                });
            }
            _ = stop.changed() => break,
        }
    }
    Ok(())
}

async fn handle_connection(server: Arc<StorageServer>, stream: TcpStream) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    match read_request(&mut reader).await {
        Ok(Some(request)) => server.respond(request, &mut write_half).await?,
        Ok(None) => return Ok(()),
        Err(e) => line(&mut write_half, &e.reply()).await?,
    }

    write_half.shutdown().await?;
    Ok(())
}

/// Registers with the naming server, retrying with backoff while it is not
/// reachable yet.
async fn register(
    config: &StorageConfig,
    store: &LocalStore,
) -> anyhow::Result<(LineReader, OwnedWriteHalf)> {
    let mut delay_ms = 150u64;

    for attempt in 1..=REGISTER_ATTEMPTS {
        match try_register(config, store).await {
            Ok(session) => return Ok(session),
            Err(e) if attempt == REGISTER_ATTEMPTS => {
                return Err(e.context(format!(
                    "registering with {} after {} attempts",
                    config.naming, attempt
                )));
            }
            Err(e) => {
                tracing::warn!(
                    "Registration attempt {} with {} failed: {:#}",
                    attempt,
                    config.naming,
                    e
                );
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(1200);
            }
        }
    }

    Err(anyhow!("no registration attempts configured"))
}

async fn try_register(
    config: &StorageConfig,
    store: &LocalStore,
) -> anyhow::Result<(LineReader, OwnedWriteHalf)> {
    let exchange = async {
        let stream = TcpStream::connect(config.naming).await?;
        let (read_half, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let listing = store.listing()?;
        let mut hello = format!("{}\n{}\n", STORAGE_HELLO, format_announce(config.advertised()));
        for (path, is_directory) in &listing {
            hello.push_str(&format_listing(path, *is_directory));
            hello.push('\n');
        }
        hello.push_str(LISTING_END);
        hello.push('\n');
        writer.write_all(hello.as_bytes()).await?;

        let reply = lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("naming server closed during registration"))?;
        let (addr, _) =
            parse_location(&reply).ok_or_else(|| anyhow!("unexpected registration reply {:?}", reply))?;

        tracing::info!("Registered as {} with {} paths", addr, listing.len());
        Ok::<_, anyhow::Error>((lines, writer))
    };

    tokio::time::timeout(config.peer_timeout(), exchange)
        .await
        .context("registration timed out")?
}

/// Relays notices up and applies commands coming down until either side
/// ends the session.
async fn control_loop(
    server: &StorageServer,
    mut lines: LineReader,
    mut writer: OwnedWriteHalf,
    events: &mut mpsc::UnboundedReceiver<NodeEvent>,
    leaving: &mut watch::Receiver<bool>,
) -> ControlExit {
    loop {
        tokio::select! {
            _ = leaving.changed() => {
                let _ = writer.write_all(format!("{}\n", NodeEvent::Stop).as_bytes()).await;
                return ControlExit::Stopped;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return ControlExit::Lost,
                    Err(e) => {
                        tracing::warn!("Control channel failed: {}", e);
                        return ControlExit::Lost;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let Some(command) = ControlCommand::parse(line) else {
                    tracing::warn!("Unknown control command {:?}", line);
                    continue;
                };
                if !server.apply(command).await {
                    tracing::info!("Stop requested by the naming server");
                    let _ = writer.write_all(format!("{}\n", STOP_ACK).as_bytes()).await;
                    return ControlExit::Stopped;
                }
            }
            Some(event) = events.recv() => {
                tracing::debug!("-> naming: {}", event);
                if writer.write_all(format!("{}\n", event).as_bytes()).await.is_err() {
                    return ControlExit::Lost;
                }
            }
        }
    }
}
