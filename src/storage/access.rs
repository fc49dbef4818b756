//! Per-file reader/writer gate.
//!
//! Many readers or one writer per path, never both. Every attempt either gets
//! the gate immediately or fails with [`FsError::Busy`]; nothing queues. The
//! gate is released when the returned guard is dropped, on success and error
//! paths alike.

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{Activity, FsError, FsResult};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AccessState {
    pub readers: usize,
    pub writer: bool,
    /// Correlation id of the asynchronous write holding the gate, if any.
    pub pending_async: Option<u64>,
}

impl AccessState {
    fn is_idle(&self) -> bool {
        self.readers == 0 && !self.writer
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileAccessController {
    states: Arc<DashMap<String, AccessState>>,
}

impl FileAccessController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin_read(&self, path: &str) -> FsResult<ReadGuard> {
        let mut state = self.states.entry(path.to_string()).or_default();
        if state.writer {
            return Err(FsError::Busy(Activity::Write, path.to_string()));
        }
        state.readers += 1;

        Ok(ReadGuard {
            states: self.states.clone(),
            path: path.to_string(),
        })
    }

    pub fn try_begin_write(&self, path: &str) -> FsResult<WriteGuard> {
        let mut state = self.states.entry(path.to_string()).or_default();
        if state.writer {
            return Err(FsError::Busy(Activity::Write, path.to_string()));
        }
        if state.readers > 0 {
            return Err(FsError::Busy(Activity::Read, path.to_string()));
        }
        state.writer = true;

        Ok(WriteGuard {
            states: self.states.clone(),
            path: path.to_string(),
        })
    }

    /// Fails when `path` or anything below it is being read or written.
    pub fn ensure_idle(&self, path: &str) -> FsResult<()> {
        let below = format!("{}/", path);
        for entry in self.states.iter() {
            if entry.key() != path && !entry.key().starts_with(&below) {
                continue;
            }
            if entry.writer {
                return Err(FsError::Busy(Activity::Write, entry.key().clone()));
            }
            if entry.readers > 0 {
                return Err(FsError::Busy(Activity::Read, entry.key().clone()));
            }
        }
        Ok(())
    }

    /// Current state of `path`; idle paths are not tracked.
    pub fn state(&self, path: &str) -> AccessState {
        self.states
            .get(path)
            .map(|state| *state)
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.states.len()
    }
}

fn release(states: &DashMap<String, AccessState>, path: &str, update: impl FnOnce(&mut AccessState)) {
    if let Some(mut state) = states.get_mut(path) {
        update(&mut state);
    }
    states.remove_if(path, |_, state| state.is_idle());
}

pub struct ReadGuard {
    states: Arc<DashMap<String, AccessState>>,
    path: String,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        release(&self.states, &self.path, |state| {
            state.readers = state.readers.saturating_sub(1);
        });
    }
}

pub struct WriteGuard {
    states: Arc<DashMap<String, AccessState>>,
    path: String,
}

impl WriteGuard {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Records that the gate now belongs to the asynchronous write `request`.
    pub fn set_async(&self, request: u64) {
        if let Some(mut state) = self.states.get_mut(&self.path) {
            state.pending_async = Some(request);
        }
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        release(&self.states, &self.path, |state| {
            state.writer = false;
            state.pending_async = None;
        });
    }
}
