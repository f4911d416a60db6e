use serde::{Deserialize, Serialize};

/// Identifier of a user across both feeds and the identity store.
pub type UserId = i64;

/// Maximum number of entries kept per sequence in a [`UserStream`].
pub const MAX_ENTRIES: usize = 10;

/// Per-subscriber queue capacity for notes read from the tailed file.
pub const NOTE_QUEUE_CAPACITY: usize = 10_000;

/// Per-subscriber queue capacity for task batches fetched from the API.
pub const TASK_QUEUE_CAPACITY: usize = 1_000;

/// Returns true when `user_id` can name a real user.
pub fn is_valid_user_id(user_id: UserId) -> bool {
    user_id >= 1
}

/// A resolved identity from the identity store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: UserId,
    pub user_name: String,
}

/// One task as returned by the external task API.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub timestamp: i64,
    pub user_id: UserId,
    pub task: String,
}

/// One note parsed from a record of the tailed file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub timestamp: i64,
    pub user_id: UserId,
    pub note: String,
}

/// Unified shape stored in a user's view; tasks and notes both project into it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TimedEntry {
    pub timestamp: i64,
    pub content: String,
}

impl From<&Task> for TimedEntry {
    fn from(task: &Task) -> Self {
        Self {
            timestamp: task.timestamp,
            content: task.task.clone(),
        }
    }
}

impl From<&Note> for TimedEntry {
    fn from(note: &Note) -> Self {
        Self {
            timestamp: note.timestamp,
            content: note.note.clone(),
        }
    }
}

/// The live view pushed to a client: latest tasks and notes, most recent first.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserStream {
    pub user_id: UserId,
    pub user_name: String,
    pub tasks: Vec<TimedEntry>,
    pub notes: Vec<TimedEntry>,
}

impl UserStream {
    pub fn new(user: &User) -> Self {
        Self {
            user_id: user.user_id,
            user_name: user.user_name.clone(),
            tasks: Vec::with_capacity(MAX_ENTRIES),
            notes: Vec::with_capacity(MAX_ENTRIES),
        }
    }
}

/// Outcome of the most recent tick of a source. Latest value only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub is_healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceStatus {
    pub fn healthy() -> Self {
        Self {
            is_healthy: true,
            error: None,
        }
    }

    pub fn unhealthy(error: impl ToString) -> Self {
        Self {
            is_healthy: false,
            error: Some(error.to_string()),
        }
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self::healthy()
    }
}
