//! Error taxonomy shared by the naming server and the storage nodes.
//!
//! Every variant maps onto one of the textual sentinels clients understand,
//! so handlers can turn any failure into a reply with [`FsError::reply`].

use thiserror::Error;

use crate::naming::protocol::replies;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("parent directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("path already exists: {0}")]
    AlreadyExists(String),

    /// A reader or writer currently holds the path.
    #[error("{0} in progress: {1}")]
    Busy(Activity, String),

    #[error("storage node {0} is unavailable")]
    NodeUnavailable(String),

    #[error("i/o failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed command: {0}")]
    Protocol(String),

    #[error("peer {addr} failed: {reason}")]
    Peer { addr: String, reason: String },

    #[error("cannot copy directory {0} into a file")]
    InvalidCopy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Read,
    Write,
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Activity::Read => write!(f, "read"),
            Activity::Write => write!(f, "write"),
        }
    }
}

impl FsError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        FsError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn peer(addr: impl ToString, reason: impl ToString) -> Self {
        FsError::Peer {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }

    /// The line sent back to whoever issued the failing request.
    pub fn reply(&self) -> String {
        match self {
            FsError::NotFound(_) | FsError::NodeUnavailable(_) => replies::NOT_FOUND.to_string(),
            FsError::DirectoryNotFound(_) => replies::DIRECTORY_NOT_FOUND.to_string(),
            FsError::AlreadyExists(_) => replies::ALREADY_EXISTS.to_string(),
            FsError::Busy(Activity::Write, _) => replies::WRITE_BUSY.to_string(),
            FsError::Busy(Activity::Read, _) => replies::READ_BUSY.to_string(),
            FsError::Protocol(_) => replies::UNKNOWN_COMMAND.to_string(),
            FsError::InvalidCopy(_) => replies::INVALID_COPY.to_string(),
            FsError::Io { .. } | FsError::Peer { .. } => format!("ERROR: {}", self),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, FsError::Busy(..))
    }
}
