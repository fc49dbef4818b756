//! Storage Node Protocol
//!
//! Requests clients and peers send straight to a storage node, one request per
//! connection.
//!
//! Payload-carrying requests (`WRITE`, `STORE`) end with an `EOF` token and may
//! span several lines:
//!
//! ```text
//! WRITE [--SYNC] [--ID <n>] [--LEN <n>] <path> <data...> EOF
//! STORE [--LEN <n>] <path> <data...> EOF
//! ```
//!
//! With `--LEN` the node reads exactly that many content bytes and then
//! expects ` EOF`, so content may itself hold lines ending in `EOF`. Encoders
//! in this crate always send it. Without it the first line ending in `EOF`
//! closes the payload, which is enough for requests typed by hand.
//!
//! Content replies (`READ`, `STREAM`, `INFO`, `FETCH`) end with `EOF\n` before
//! the node closes the connection. Anything else is a single reply line.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{FsError, FsResult};
use crate::naming::protocol::validate_path;

/// Appended to every content reply.
pub const TERMINATOR: &str = "EOF\n";
/// Ends the payload of `WRITE` and `STORE` requests.
pub const PAYLOAD_END: &[u8] = b"EOF";
pub const ERROR_PREFIX: &str = "ERROR: ";
pub const STORE_OK: &str = "STORE_OK";
pub const SYNC_FLAG: &str = "--SYNC";
pub const ID_FLAG: &str = "--ID";
pub const LEN_FLAG: &str = "--LEN";
/// Largest content length a `--LEN` header may announce.
pub const MAX_PAYLOAD: usize = 1 << 30;

pub mod replies {
    pub const WRITTEN: &str = "File written successfully";
    pub const ACCEPTED: &str = "Asynchronous write accepted";
    /// Sent instead of content when a writer holds the file.
    pub const READ_BLOCKED: &str =
        "Write in progress. Cannot read the file right now. Please try again later.";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRequest {
    Read {
        path: String,
    },
    Stream {
        path: String,
    },
    Info {
        path: String,
    },
    Write {
        path: String,
        data: Vec<u8>,
        /// `--SYNC`: never take the asynchronous path.
        sync: bool,
        /// Correlation id from the naming server, echoed in async notices.
        request: Option<u64>,
    },
    /// Raw content read by another node's copy job.
    Fetch {
        path: String,
    },
    /// Raw content written by a copy job. Never reported to the naming server.
    Store {
        path: String,
        data: Vec<u8>,
    },
    StoreDir {
        path: String,
    },
}

/// `<command> --LEN <n> <path> <content> EOF\n`
pub fn encode_payload(command: &str, path: &str, content: &[u8]) -> Vec<u8> {
    let header = format!("{} {} {} {} ", command, LEN_FLAG, content.len(), path);
    let mut out = Vec::with_capacity(header.len() + content.len() + TERMINATOR.len() + 1);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(content);
    out.push(b' ');
    out.extend_from_slice(TERMINATOR.as_bytes());
    out
}

/// Client-side encoding of a WRITE request.
pub fn encode_write(path: &str, content: &[u8], sync: bool, request: Option<u64>) -> Vec<u8> {
    let mut command = String::from("WRITE");
    if sync {
        command.push(' ');
        command.push_str(SYNC_FLAG);
    }
    if let Some(id) = request {
        command.push_str(&format!(" {} {}", ID_FLAG, id));
    }
    encode_payload(&command, path, content)
}

/// Reads one request off a fresh connection. `Ok(None)` when the peer closed
/// without sending anything.
pub async fn read_request<R>(reader: &mut R) -> FsResult<Option<StorageRequest>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = Vec::new();
    let read = reader
        .read_until(b'\n', &mut buffer)
        .await
        .map_err(|e| FsError::io("<request>", e))?;
    if read == 0 {
        return Ok(None);
    }

    if !is_payload(first_word(&buffer)) {
        return parse_request(&buffer).map(Some);
    }

    let header = PayloadHeader::parse(&buffer)?;
    match header.length {
        Some(length) => {
            // Content, then " EOF"; the final newline is optional.
            let needed = header.body + length + PAYLOAD_END.len() + 1;
            if buffer.len() < needed {
                let start = buffer.len();
                buffer.resize(needed, 0);
                reader
                    .read_exact(&mut buffer[start..])
                    .await
                    .map_err(|e| match e.kind() {
                        std::io::ErrorKind::UnexpectedEof => {
                            FsError::Protocol("payload ended before its length".into())
                        }
                        _ => FsError::io("<request>", e),
                    })?;
            }
        }
        None => {
            while !ends_with_marker(&buffer) {
                let read = reader
                    .read_until(b'\n', &mut buffer)
                    .await
                    .map_err(|e| FsError::io("<request>", e))?;
                if read == 0 {
                    return Err(FsError::Protocol("payload ended without EOF".into()));
                }
            }
        }
    }

    parse_payload(&buffer).map(Some)
}

/// Parses a complete request buffer.
pub fn parse_request(buffer: &[u8]) -> FsResult<StorageRequest> {
    if is_payload(first_word(buffer)) {
        return parse_payload(buffer);
    }

    let mut rest = trim_line_end(buffer);
    let command = take_word(&mut rest)
        .ok_or_else(|| FsError::Protocol("empty request".into()))?;

    let simple_path = |mut rest: &[u8]| -> FsResult<String> {
        let raw = take_word(&mut rest)
            .ok_or_else(|| FsError::Protocol("request needs a path".into()))?;
        validate_path(&utf8(raw)?)
    };

    let request = match command {
        b"READ" => StorageRequest::Read {
            path: simple_path(rest)?,
        },
        b"STREAM" => StorageRequest::Stream {
            path: simple_path(rest)?,
        },
        b"INFO" => StorageRequest::Info {
            path: simple_path(rest)?,
        },
        b"FETCH" => StorageRequest::Fetch {
            path: simple_path(rest)?,
        },
        b"STORE_DIR" => StorageRequest::StoreDir {
            path: simple_path(rest)?,
        },
        other => {
            return Err(FsError::Protocol(format!(
                "unknown request {}",
                String::from_utf8_lossy(other)
            )));
        }
    };
    Ok(request)
}

fn is_payload(command: &[u8]) -> bool {
    command == b"WRITE" || command == b"STORE"
}

/// Everything of a `WRITE` or `STORE` request ahead of its content.
#[derive(Debug)]
struct PayloadHeader {
    write: bool,
    path: String,
    sync: bool,
    request: Option<u64>,
    length: Option<usize>,
    /// Offset of the first content byte.
    body: usize,
}

impl PayloadHeader {
    fn parse(buffer: &[u8]) -> FsResult<Self> {
        let mut rest = buffer;
        let write = take_word(&mut rest) == Some(&b"WRITE"[..]);
        let mut sync = false;
        let mut request = None;
        let mut length = None;

        loop {
            let word = take_word(&mut rest)
                .ok_or_else(|| FsError::Protocol("payload request needs a path".into()))?;
            match word {
                b"--SYNC" if write => sync = true,
                b"--ID" if write => request = Some(number(take_word(&mut rest), ID_FLAG)?),
                b"--LEN" => {
                    let len = number(take_word(&mut rest), LEN_FLAG)?;
                    let len = usize::try_from(len)
                        .ok()
                        .filter(|len| *len <= MAX_PAYLOAD)
                        .ok_or_else(|| {
                            FsError::Protocol(format!("payload of {} bytes refused", len))
                        })?;
                    length = Some(len);
                }
                path => {
                    return Ok(Self {
                        write,
                        path: validate_path(&utf8(trim_line_end(path))?)?,
                        sync,
                        request,
                        length,
                        body: buffer.len() - rest.len(),
                    });
                }
            }
        }
    }

    fn content(&self, buffer: &[u8]) -> FsResult<Vec<u8>> {
        let body = &buffer[self.body..];
        match self.length {
            Some(length) => {
                let (data, tail) = body
                    .split_at_checked(length)
                    .ok_or_else(|| FsError::Protocol("payload shorter than its length".into()))?;
                let closed = tail
                    .strip_prefix(b" ")
                    .is_some_and(|tail| tail.starts_with(PAYLOAD_END));
                if !closed {
                    return Err(FsError::Protocol("payload ended without EOF".into()));
                }
                Ok(data.to_vec())
            }
            None => Ok(payload_data(strip_marker(trim_line_end(body))?)),
        }
    }
}

fn parse_payload(buffer: &[u8]) -> FsResult<StorageRequest> {
    let header = PayloadHeader::parse(buffer)?;
    let data = header.content(buffer)?;
    Ok(if header.write {
        StorageRequest::Write {
            path: header.path,
            data,
            sync: header.sync,
            request: header.request,
        }
    } else {
        StorageRequest::Store {
            path: header.path,
            data,
        }
    })
}

fn number(word: Option<&[u8]>, flag: &str) -> FsResult<u64> {
    word.and_then(|word| std::str::from_utf8(word).ok())
        .and_then(|word| word.parse().ok())
        .ok_or_else(|| FsError::Protocol(format!("{} needs a number", flag)))
}

fn utf8(raw: &[u8]) -> FsResult<String> {
    String::from_utf8(raw.to_vec()).map_err(|_| FsError::Protocol("path is not UTF-8".into()))
}

fn first_word(buffer: &[u8]) -> &[u8] {
    let mut rest = buffer;
    take_word(&mut rest).unwrap_or_default()
}

/// Splits off the next word, consuming exactly one separator after it.
fn take_word<'a>(rest: &mut &'a [u8]) -> Option<&'a [u8]> {
    let current: &'a [u8] = *rest;
    let start = current.iter().position(|b| *b != b' ')?;
    let tail = &current[start..];
    match tail.iter().position(|b| *b == b' ' || *b == b'\n') {
        Some(end) => {
            *rest = &tail[end + 1..];
            Some(&tail[..end])
        }
        None => {
            *rest = &[];
            Some(tail)
        }
    }
}

fn trim_line_end(buffer: &[u8]) -> &[u8] {
    let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
    buffer.strip_suffix(b"\r").unwrap_or(buffer)
}

fn ends_with_marker(buffer: &[u8]) -> bool {
    trim_line_end(buffer).ends_with(PAYLOAD_END)
}

fn strip_marker(payload: &[u8]) -> FsResult<&[u8]> {
    payload
        .strip_suffix(PAYLOAD_END)
        .ok_or_else(|| FsError::Protocol("payload ended without EOF".into()))
}

/// Content between the path and the `EOF` marker, minus the one space that
/// separates it from the marker.
fn payload_data(payload: &[u8]) -> Vec<u8> {
    payload.strip_suffix(b" ").unwrap_or(payload).to_vec()
}
