//! Per-session merge state for one user's tasks and notes.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use livefeed_protocol::{MAX_ENTRIES, Note, Task, TimedEntry, User, UserStream};

/// Owns the [`UserStream`] of a single session. Reads may run concurrently;
/// every mutation takes the write lock, so each operation is atomic with
/// respect to the others.
#[derive(Debug, Default)]
pub struct UserAggregator {
    stream: RwLock<Option<UserStream>>,
}

impl UserAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<UserStream>> {
        self.stream.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<UserStream>> {
        self.stream.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start an empty view for `user`. Replaces any previous view.
    pub fn add_user(&self, user: &User) {
        *self.write() = Some(UserStream::new(user));
    }

    /// Put `note` at the head of the notes and keep the 10 most recent.
    pub fn add_note(&self, note: &Note) {
        if let Some(stream) = self.write().as_mut() {
            stream.notes.insert(0, TimedEntry::from(note));
            stream.notes.truncate(MAX_ENTRIES);
        }
    }

    /// Replace the stored tasks with `batch`, newest first. The batch is the
    /// API's current state in chronological order, so nothing accumulates
    /// across batches.
    pub fn add_tasks(&self, batch: &[Task]) {
        if let Some(stream) = self.write().as_mut() {
            stream.tasks = batch
                .iter()
                .rev()
                .take(MAX_ENTRIES)
                .map(TimedEntry::from)
                .collect();
        }
    }

    /// Whether `candidate` should replace the stored tasks.
    ///
    /// Accepts when nothing is stored yet, or when the candidate's newest
    /// task differs from the stored head in both timestamp and content. A
    /// change in only one of the two is treated as a duplicate.
    pub fn should_accept_task_batch(&self, candidate: &[Task]) -> bool {
        let Some(newest) = candidate.last() else {
            return false;
        };
        let guard = self.read();
        let Some(stream) = guard.as_ref() else {
            return false;
        };
        match stream.tasks.first() {
            None => true,
            Some(head) => newest.timestamp != head.timestamp && newest.task != head.content,
        }
    }

    /// Clone of the current view, `None` before [`add_user`](Self::add_user).
    pub fn snapshot(&self) -> Option<UserStream> {
        self.read().clone()
    }
}
