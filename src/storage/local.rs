//! Local filesystem adapter.
//!
//! Maps namespace paths (`/a/b.txt`) onto the node's root directory and wraps
//! the handful of filesystem calls the node needs.

use chrono::{DateTime, Local};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use crate::error::{FsError, FsResult};
use crate::naming::protocol::validate_path;

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Opens (creating if needed) the directory exported under `root`.
    pub fn open(root: impl AsRef<Path>) -> FsResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| FsError::io(root.display().to_string(), e))?;
        let root = root
            .canonicalize()
            .map_err(|e| FsError::io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location of a namespace path.
    pub fn locate(&self, path: &str) -> FsResult<PathBuf> {
        let path = validate_path(path)?;
        Ok(self.root.join(path.trim_start_matches('/')))
    }

    /// Every file and directory under the root as namespace paths, parents
    /// before their children.
    pub fn listing(&self) -> FsResult<Vec<(String, bool)>> {
        let mut entries = Vec::new();

        for entry in WalkDir::new(&self.root).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry under {}: {}", self.root.display(), e);
                    continue;
                }
            };

            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let Some(relative) = relative.to_str() else {
                tracing::warn!("Skipping non UTF-8 path {}", entry.path().display());
                continue;
            };
            if relative.split(std::path::MAIN_SEPARATOR).any(|c| c.contains(char::is_whitespace)) {
                tracing::warn!("Skipping {}: whitespace is not addressable", relative);
                continue;
            }

            let path = format!("/{}", relative.replace(std::path::MAIN_SEPARATOR, "/"));
            entries.push((path, entry.file_type().is_dir()));
        }

        Ok(entries)
    }

    pub async fn read(&self, path: &str) -> FsResult<Vec<u8>> {
        let target = self.locate(path)?;
        fs::read(&target).await.map_err(|e| classify(path, e))
    }

    /// Replaces the content of `path` and syncs it to disk.
    pub async fn write(&self, path: &str, content: &[u8]) -> FsResult<()> {
        let mut file = self.create_for_write(path).await?;
        file.write_all(content)
            .await
            .map_err(|e| FsError::io(path, e))?;
        file.sync_all().await.map_err(|e| FsError::io(path, e))
    }

    /// Truncates (or creates) `path` and hands out the open file.
    pub async fn create_for_write(&self, path: &str) -> FsResult<fs::File> {
        let target = self.locate(path)?;
        self.ensure_parent(path, &target).await?;
        fs::File::create(&target)
            .await
            .map_err(|e| classify(path, e))
    }

    pub async fn create_dir(&self, path: &str) -> FsResult<()> {
        let target = self.locate(path)?;
        fs::create_dir_all(&target)
            .await
            .map_err(|e| FsError::io(path, e))
    }

    /// Creates an empty file, leaving existing content alone.
    pub async fn create_file(&self, path: &str) -> FsResult<()> {
        let target = self.locate(path)?;
        self.ensure_parent(path, &target).await?;
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .await
            .map(|_| ())
            .map_err(|e| FsError::io(path, e))
    }

    /// Removes a file, or a directory with everything inside it.
    pub async fn delete(&self, path: &str) -> FsResult<()> {
        let target = self.locate(path)?;
        let metadata = fs::metadata(&target)
            .await
            .map_err(|e| classify(path, e))?;

        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&target).await
        } else {
            fs::remove_file(&target).await
        };
        removed.map_err(|e| FsError::io(path, e))
    }

    /// Metadata block returned for INFO.
    pub async fn info(&self, path: &str) -> FsResult<String> {
        let target = self.locate(path)?;
        let metadata = fs::symlink_metadata(&target)
            .await
            .map_err(|e| classify(path, e))?;
        Ok(describe(&metadata))
    }

    async fn ensure_parent(&self, path: &str, target: &Path) -> FsResult<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FsError::io(path, e))?;
        }
        Ok(())
    }
}

fn classify(path: &str, error: std::io::Error) -> FsError {
    match error.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        _ => FsError::io(path, error),
    }
}

fn timestamp(time: std::io::Result<SystemTime>) -> String {
    match time {
        Ok(time) => DateTime::<Local>::from(time)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        Err(_) => "unknown".to_string(),
    }
}

fn file_type(metadata: &std::fs::Metadata) -> &'static str {
    let kind = metadata.file_type();
    if kind.is_file() {
        "Regular file"
    } else if kind.is_dir() {
        "Directory"
    } else if kind.is_symlink() {
        "Symbolic link"
    } else {
        "Other"
    }
}

#[cfg(unix)]
fn describe(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;

    let mode = metadata.mode();
    let permissions: String = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ]
    .iter()
    .map(|(bit, c)| if mode & bit != 0 { *c } else { '-' })
    .collect();
    let kind = if metadata.is_dir() { 'd' } else { '-' };

    let changed = DateTime::from_timestamp(metadata.ctime(), 0)
        .map(|t| {
            t.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "unknown".to_string());

    format!(
        "File size: {} bytes\nPermissions: {}{}\nOwner UID: {}\nGroup GID: {}\nLast accessed: {}\nLast modified: {}\nLast status change: {}\nFile type: {}\n",
        metadata.len(),
        kind,
        permissions,
        metadata.uid(),
        metadata.gid(),
        timestamp(metadata.accessed()),
        timestamp(metadata.modified()),
        changed,
        file_type(metadata)
    )
}

#[cfg(not(unix))]
fn describe(metadata: &std::fs::Metadata) -> String {
    let permissions = if metadata.permissions().readonly() { "r--" } else { "rw-" };
    format!(
        "File size: {} bytes\nPermissions: {}\nLast accessed: {}\nLast modified: {}\nFile type: {}\n",
        metadata.len(),
        permissions,
        timestamp(metadata.accessed()),
        timestamp(metadata.modified()),
        file_type(metadata)
    )
}
