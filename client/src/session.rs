//! One interactive session with the naming server.
//!
//! Namespace commands are relayed as typed. READ, STREAM, INFO and WRITE are
//! resolved first and then carried out directly against the storage node the
//! naming server points at.

use anyhow::{Context, anyhow, bail};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;

use netfs_cluster::naming::protocol::{CLIENT_HELLO, STOP, parse_location, replies};
use netfs_cluster::storage::protocol::{SYNC_FLAG, TERMINATOR, encode_write};

/// Completion notices the naming server pushes whenever they arrive.
const NOTICE_PREFIX: &str = "ASYNC_WRITE_";

pub struct Session {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<String>,
}

impl Session {
    pub async fn connect(naming: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(naming)
            .await
            .with_context(|| format!("connecting to naming server {}", naming))?;
        let (read_half, mut writer) = stream.into_split();
        writer
            .write_all(format!("{}\n", CLIENT_HELLO).as_bytes())
            .await?;

        let (tx, replies) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.starts_with(NOTICE_PREFIX) {
                    println!("\n[naming server] {}", line);
                    continue;
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
            tracing::debug!("Naming connection closed");
        });

        let mut session = Self { writer, replies };
        let greeting = session.reply().await?;
        if greeting != replies::CONNECTED {
            bail!("unexpected greeting {:?}", greeting);
        }
        Ok(session)
    }

    async fn send(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .context("naming server connection lost")
    }

    async fn reply(&mut self) -> anyhow::Result<String> {
        self.replies
            .recv()
            .await
            .ok_or_else(|| anyhow!("naming server closed the connection"))
    }

    /// Runs one typed command. Returns `false` once the session is over.
    pub async fn execute(&mut self, input: &str) -> anyhow::Result<bool> {
        let mut words = input.split_whitespace();
        let Some(command) = words.next() else {
            return Ok(true);
        };

        match command {
            "EXIT" | STOP => {
                self.send(STOP).await?;
                return Ok(false);
            }
            "READ" | "STREAM" | "INFO" => {
                let path = words.next().unwrap_or_default();
                let request = format!("{} {}", command, path);
                if let Some((addr, _)) = self.resolve(&request).await? {
                    let reply = exchange(addr, format!("{}\n", request).as_bytes()).await?;
                    print_content(&reply);
                }
            }
            "WRITE" => {
                let rest = input.trim_start()["WRITE".len()..].trim_start();
                let (sync, rest) = match rest.strip_prefix(SYNC_FLAG) {
                    Some(rest) => (true, rest.trim_start()),
                    None => (false, rest),
                };
                let (path, data) = rest.split_once(' ').unwrap_or((rest, ""));

                if let Some((addr, request)) = self.resolve(&format!("WRITE {}", path)).await? {
                    let payload = encode_write(path, data.as_bytes(), sync, request);
                    let reply = exchange(addr, &payload).await?;
                    println!("{}", String::from_utf8_lossy(&reply).trim_end());
                }
            }
            "LIST" => {
                self.send(input.trim()).await?;
                loop {
                    let line = self.reply().await?;
                    if line == replies::END_OF_LIST {
                        break;
                    }
                    println!("{}", line);
                }
            }
            _ => {
                self.send(input.trim()).await?;
                println!("{}", self.reply().await?);
            }
        }
        Ok(true)
    }

    /// Asks the naming server where `request` should go. Prints and returns
    /// `None` when the answer is not a location.
    async fn resolve(&mut self, request: &str) -> anyhow::Result<Option<(SocketAddr, Option<u64>)>> {
        self.send(request).await?;
        let reply = self.reply().await?;
        match parse_location(&reply) {
            Some(location) => {
                tracing::debug!("{} -> {}", request, reply);
                Ok(Some(location))
            }
            None => {
                println!("{}", reply);
                Ok(None)
            }
        }
    }
}

/// One request/response exchange with a storage node.
async fn exchange(addr: SocketAddr, request: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to storage node {}", addr))?;
    stream.write_all(request).await?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    Ok(reply)
}

fn print_content(reply: &[u8]) {
    match reply.strip_suffix(TERMINATOR.as_bytes()) {
        Some(content) => {
            let content = String::from_utf8_lossy(content);
            print!("{}", content);
            if !content.ends_with('\n') {
                println!();
            }
        }
        None => println!("{}", String::from_utf8_lossy(reply).trim_end()),
    }
}
