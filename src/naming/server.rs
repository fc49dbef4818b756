use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::coordinator::NamingService;
use super::handlers;
use super::protocol::{
    CLIENT_HELLO, ClientCommand, LISTING_END, NodeEvent, STORAGE_HELLO, format_location,
    parse_announce, parse_listing, replies,
};
use crate::config::NamingConfig;
use crate::membership::types::ControlCommand;
use crate::replication::peer::TcpPeerTransport;

type LineReader = Lines<BufReader<OwnedReadHalf>>;

/// Runs the naming server until Ctrl-C.
pub async fn run(config: NamingConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding naming listener on {}", config.bind))?;
    tracing::info!("Naming server listening on {}", config.bind);

    let transport = Arc::new(TcpPeerTransport::new(config.peer_timeout()));
    let service = NamingService::new(config.clone(), transport);

    if let Some(admin_bind) = config.admin_bind {
        let admin = tokio::net::TcpListener::bind(admin_bind)
            .await
            .with_context(|| format!("binding admin listener on {}", admin_bind))?;
        let app = handlers::router(service.clone());
        tracing::info!("Admin API listening on {}", admin_bind);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(admin, app).await {
                tracing::error!("Admin API stopped: {}", e);
            }
        });
    }

    let closer = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, shutting down");
            closer.close().await;
        }
    });

    serve(service, listener).await
}

/// Accepts connections until the service is closed.
pub async fn serve(service: Arc<NamingService>, listener: TcpListener) -> anyhow::Result<()> {
    let mut shutdown = service.shutdown_signal();

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
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(service, stream, peer).await {
                        tracing::warn!("Connection from {} ended with error: {:#}", peer, e);
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("Naming server stopped accepting connections");
    Ok(())
}

async fn handle_connection(
    service: Arc<NamingService>,
    stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Some(hello) = lines.next_line().await? else {
        return Ok(());
    };

    match hello.trim() {
        CLIENT_HELLO => client_session(service, lines, write_half, peer).await,
        STORAGE_HELLO => storage_session(service, lines, write_half, peer).await,
        other => {
            tracing::warn!("{} opened with {:?}", peer, other);
            write_half
                .write_all(format!("{}\n", replies::UNKNOWN_COMMAND).as_bytes())
                .await?;
            Ok(())
        }
    }
}

async fn client_session(
    service: Arc<NamingService>,
    mut lines: LineReader,
    mut writer: OwnedWriteHalf,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session = service.open_session(tx.clone());
    tracing::info!("Client {} connected as session {}", peer, session);

    // Replies and forwarded completions share one ordered writer.
    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if writer.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(replies::CONNECTED.to_string());

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Client {} read failed: {}", peer, e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match ClientCommand::parse(line) {
            Ok(ClientCommand::Stop) => {
                tracing::info!("Client {} sent STOP", peer);
                break;
            }
            Ok(command) => {
                for reply in service.handle(session, command).await {
                    let _ = tx.send(reply);
                }
            }
            Err(e) => {
                tracing::debug!("Client {}: {}", peer, e);
                let _ = tx.send(e.reply());
            }
        }
    }

    service.close_session(session);
    drop(tx);
    let _ = writer_task.await;
    tracing::info!("Client {} disconnected", peer);
    Ok(())
}

async fn storage_session(
    service: Arc<NamingService>,
    mut lines: LineReader,
    mut writer: OwnedWriteHalf,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let timeout = service.config().peer_timeout();

    let announce = tokio::time::timeout(timeout, lines.next_line())
        .await
        .context("registration timed out")??
        .context("node closed during registration")?;
    let addr = parse_announce(&announce)?;

    let mut listing = Vec::new();
    loop {
        let line = tokio::time::timeout(timeout, lines.next_line())
            .await
            .context("file list timed out")??
            .context("node closed during registration")?;
        let line = line.trim();
        if line == LISTING_END {
            break;
        }
        match parse_listing(line) {
            Some(entry) => listing.push(entry),
            None => tracing::warn!("{} sent unexpected listing line {:?}", addr, line),
        }
    }

    let (control, mut commands) = mpsc::unbounded_channel::<ControlCommand>();
    let (registration, assigned) = service
        .register_node(addr, Some(control.clone()), &listing)
        .await;
    let node = registration.id();

    writer
        .write_all(format!("{}\n", format_location(addr, None)).as_bytes())
        .await?;
    tracing::info!(
        "Storage {} ({} via {}) registered with {} paths",
        node,
        addr,
        peer,
        listing.len()
    );

    if !assigned.is_empty() {
        let snapshotter = service.clone();
        tokio::spawn(async move {
            snapshotter.snapshot(&assigned).await;
        });
    }

    let writer_task = tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            tracing::debug!("-> {}: {}", node, command);
            if writer
                .write_all(format!("{}\n", command).as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
    });

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("{} control channel failed: {}", node, e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match NodeEvent::parse(line) {
            Ok(NodeEvent::Stop) => {
                tracing::info!("{} is stopping", node);
                service.node_event(node, NodeEvent::Stop).await;
                break;
            }
            Ok(event) => {
                service.node_event(node, event).await;
            }
            Err(e) => tracing::warn!("{}: {}", node, e),
        }
    }

    writer_task.abort();
    service.control_lost(node, &control).await;
    Ok(())
}
