//! Line protocol spoken with the naming server.
//!
//! Every message is one line. Clients open with `CLIENT`, storage nodes with
//! `STORAGE`; the rest of the session follows the role.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::{FsError, FsResult};
use crate::index::trie::normalize;

pub const CLIENT_HELLO: &str = "CLIENT";
pub const STORAGE_HELLO: &str = "STORAGE";
/// Ends the file list a node sends while registering.
pub const LISTING_END: &str = "END";
pub const STOP: &str = "STOP";
pub const STOP_ACK: &str = "STOP_ACK";

/// Fixed reply texts. Clients match on these, so they never change.
pub mod replies {
    pub const CONNECTED: &str = "Connected to Naming Server";
    pub const NOT_FOUND: &str = "File not found in any storage server";
    pub const DIRECTORY_NOT_FOUND: &str = "Directory Not Found";
    pub const ALREADY_EXISTS: &str = "File or Directory already exists";
    pub const UNKNOWN_COMMAND: &str = "Unknown command";
    pub const WRITE_BUSY: &str = "Write in progress. Please try again later.";
    pub const READ_BUSY: &str = "Read in progress. Please try again later.";
    pub const INVALID_COPY: &str = "Cannot copy a directory onto a file";
    pub const FILE_CREATED: &str = "File created successfully";
    pub const DIRECTORY_CREATED: &str = "Directory created successfully";
    pub const DELETED: &str = "Deleted successfully";
    pub const COPIED: &str = "COPY operation successful";
    pub const END_OF_LIST: &str = "EOF";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Info,
    Stream,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "READ"),
            Access::Write => write!(f, "WRITE"),
            Access::Info => write!(f, "INFO"),
            Access::Stream => write!(f, "STREAM"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Ask which node serves `path`; the client then talks to it directly.
    Resolve { access: Access, path: String },
    List { filter: String },
    Create { path: String, is_directory: bool },
    Delete { path: String },
    Copy { source: String, destination: String },
    Stop,
}

impl ClientCommand {
    pub fn parse(line: &str) -> FsResult<Self> {
        let mut words = line.split_whitespace();
        let command = words
            .next()
            .ok_or_else(|| FsError::Protocol("empty command".into()))?;
        let mut path = || -> FsResult<String> {
            let raw = words
                .next()
                .ok_or_else(|| FsError::Protocol(format!("{} needs a path", command)))?;
            validate_path(raw)
        };

        let parsed = match command {
            "READ" => ClientCommand::Resolve {
                access: Access::Read,
                path: path()?,
            },
            "WRITE" => ClientCommand::Resolve {
                access: Access::Write,
                path: path()?,
            },
            "INFO" => ClientCommand::Resolve {
                access: Access::Info,
                path: path()?,
            },
            "STREAM" => ClientCommand::Resolve {
                access: Access::Stream,
                path: path()?,
            },
            "LIST" => ClientCommand::List {
                filter: words.next().unwrap_or("").to_string(),
            },
            "CREATE_DIR" => ClientCommand::Create {
                path: path()?,
                is_directory: true,
            },
            "CREATE_FILE" => ClientCommand::Create {
                path: path()?,
                is_directory: false,
            },
            "DELETE" => ClientCommand::Delete { path: path()? },
            "COPY" => {
                let source = path()?;
                let destination = path()?;
                ClientCommand::Copy {
                    source,
                    destination,
                }
            }
            STOP => ClientCommand::Stop,
            other => return Err(FsError::Protocol(format!("unknown command {}", other))),
        };
        Ok(parsed)
    }
}

impl fmt::Display for ClientCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientCommand::Resolve { access, path } => write!(f, "{} {}", access, path),
            ClientCommand::List { filter } if filter.is_empty() => write!(f, "LIST"),
            ClientCommand::List { filter } => write!(f, "LIST {}", filter),
            ClientCommand::Create {
                path,
                is_directory: true,
            } => write!(f, "CREATE_DIR {}", path),
            ClientCommand::Create {
                path,
                is_directory: false,
            } => write!(f, "CREATE_FILE {}", path),
            ClientCommand::Delete { path } => write!(f, "DELETE {}", path),
            ClientCommand::Copy {
                source,
                destination,
            } => write!(f, "COPY {} {}", source, destination),
            ClientCommand::Stop => write!(f, "{}", STOP),
        }
    }
}

/// Namespace paths are absolute, carry no `..` components and no trailing
/// separator.
pub fn validate_path(raw: &str) -> FsResult<String> {
    if !raw.starts_with('/') {
        return Err(FsError::Protocol(format!("path {} is not absolute", raw)));
    }
    if raw.split('/').any(|component| component == "..") {
        return Err(FsError::Protocol(format!("path {} escapes the namespace", raw)));
    }
    let path = normalize(raw);
    if path.is_empty() {
        return Err(FsError::Protocol("the namespace root is not addressable".into()));
    }
    Ok(path.to_string())
}

/// Notifications a storage node sends up its control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Synchronous completions carry the correlation id when the client
    /// sent one; writes issued without it report the path alone.
    WriteSuccess { request: Option<u64>, path: String },
    WriteFail { request: Option<u64>, path: String },
    AsyncProgress { request: u64, path: String },
    AsyncSuccess { request: u64, path: String },
    AsyncFail { request: u64, path: String },
    /// The node is leaving the cluster.
    Stop,
    StopAck,
}

impl NodeEvent {
    pub fn parse(line: &str) -> FsResult<Self> {
        let mut words = line.split_whitespace();
        let kind = words.next().unwrap_or("");

        let mut request = || -> FsResult<u64> {
            words
                .next()
                .and_then(|id| id.parse().ok())
                .ok_or_else(|| FsError::Protocol(format!("{} needs a request id", kind)))
        };
        let request_id = match kind {
            "ASYNC_WRITE_PROGRESS" | "ASYNC_WRITE_SUCCESS" | "ASYNC_WRITE_FAIL" => Some(request()?),
            _ => None,
        };
        let mut next = words.next();
        // Optional id ahead of the path; paths always start with '/'.
        let sync_request = match (kind, next) {
            ("WRITE_SUCCESS" | "WRITE_FAIL", Some(word)) if !word.starts_with('/') => {
                let id: u64 = word
                    .parse()
                    .map_err(|_| FsError::Protocol(format!("bad request id {:?}", word)))?;
                next = words.next();
                Some(id)
            }
            _ => None,
        };
        let path = next.map(str::to_string);
        let need_path =
            || path.clone().ok_or_else(|| FsError::Protocol(format!("{} needs a path", kind)));

        let event = match (kind, request_id) {
            ("WRITE_SUCCESS", _) => NodeEvent::WriteSuccess {
                request: sync_request,
                path: need_path()?,
            },
            ("WRITE_FAIL", _) => NodeEvent::WriteFail {
                request: sync_request,
                path: need_path()?,
            },
            ("ASYNC_WRITE_PROGRESS", Some(request)) => NodeEvent::AsyncProgress {
                request,
                path: need_path()?,
            },
            ("ASYNC_WRITE_SUCCESS", Some(request)) => NodeEvent::AsyncSuccess {
                request,
                path: need_path()?,
            },
            ("ASYNC_WRITE_FAIL", Some(request)) => NodeEvent::AsyncFail {
                request,
                path: need_path()?,
            },
            (STOP, _) => NodeEvent::Stop,
            (STOP_ACK, _) => NodeEvent::StopAck,
            _ => return Err(FsError::Protocol(format!("unknown node event {:?}", line))),
        };
        Ok(event)
    }
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::WriteSuccess {
                request: Some(id),
                path,
            } => write!(f, "WRITE_SUCCESS {} {}", id, path),
            NodeEvent::WriteSuccess { request: None, path } => write!(f, "WRITE_SUCCESS {}", path),
            NodeEvent::WriteFail {
                request: Some(id),
                path,
            } => write!(f, "WRITE_FAIL {} {}", id, path),
            NodeEvent::WriteFail { request: None, path } => write!(f, "WRITE_FAIL {}", path),
            NodeEvent::AsyncProgress { request, path } => {
                write!(f, "ASYNC_WRITE_PROGRESS {} {}", request, path)
            }
            NodeEvent::AsyncSuccess { request, path } => {
                write!(f, "ASYNC_WRITE_SUCCESS {} {}", request, path)
            }
            NodeEvent::AsyncFail { request, path } => {
                write!(f, "ASYNC_WRITE_FAIL {} {}", request, path)
            }
            NodeEvent::Stop => write!(f, "{}", STOP),
            NodeEvent::StopAck => write!(f, "{}", STOP_ACK),
        }
    }
}

/// `File: <path>` / `Directory: <path>`, as used by LIST and registration.
pub fn format_listing(path: &str, is_directory: bool) -> String {
    if is_directory {
        format!("Directory: {}", path)
    } else {
        format!("File: {}", path)
    }
}

pub fn parse_listing(line: &str) -> Option<(String, bool)> {
    if let Some(path) = line.strip_prefix("Directory: ") {
        return Some((path.trim().to_string(), true));
    }
    line.strip_prefix("File: ")
        .map(|path| (path.trim().to_string(), false))
}

/// `<ip> <port>` line a node announces itself with.
pub fn format_announce(addr: SocketAddr) -> String {
    format!("{} {}", addr.ip(), addr.port())
}

pub fn parse_announce(line: &str) -> FsResult<SocketAddr> {
    let mut words = line.split_whitespace();
    let ip: IpAddr = words
        .next()
        .and_then(|ip| ip.parse().ok())
        .ok_or_else(|| FsError::Protocol(format!("bad announce {:?}", line)))?;
    let port: u16 = words
        .next()
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| FsError::Protocol(format!("bad announce {:?}", line)))?;
    Ok(SocketAddr::new(ip, port))
}

/// `IP: <ip> Port: <port>`, with `Request: <id>` appended for writes.
pub fn format_location(addr: SocketAddr, request: Option<u64>) -> String {
    match request {
        Some(id) => format!("IP: {} Port: {} Request: {}", addr.ip(), addr.port(), id),
        None => format!("IP: {} Port: {}", addr.ip(), addr.port()),
    }
}

pub fn parse_location(line: &str) -> Option<(SocketAddr, Option<u64>)> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["IP:", ip, "Port:", port, rest @ ..] => {
            let addr = SocketAddr::new(ip.parse().ok()?, port.parse().ok()?);
            let request = match rest {
                ["Request:", id] => Some(id.parse().ok()?),
                [] => None,
                _ => return None,
            };
            Some((addr, request))
        }
        _ => None,
    }
}

// ============================================================
// ADMIN API
// ============================================================

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EvictResponse {
    pub evicted: bool,
    pub node: Option<crate::membership::types::NodeSummary>,
}
